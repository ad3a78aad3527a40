//! Request coalescing.
//!
//! Concurrent callers asking for the same key share one load. The first
//! caller registers a `watch` channel and spawns the load; later callers
//! subscribe to the channel. The load runs as its own task, so a caller
//! that stops waiting does not cancel it for the others.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::metrics;

/// Result of a coalesced call.
#[derive(Debug, Clone)]
pub struct Flight<T> {
    pub value: T,
    /// `true` if another caller started the load this one waited on.
    pub shared: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlightError {
    /// The load task ended without a value (it panicked or was aborted).
    #[error("load ended without producing a value")]
    Aborted,

    #[error("wait cancelled")]
    Cancelled,
}

type Registry<T> = DashMap<String, watch::Receiver<Option<T>>>;

/// Per-key deduplication of concurrent loads.
pub struct SingleFlight<T> {
    flights: Arc<Registry<T>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of loads currently running.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Runs `load` for `key` unless a load for `key` is already running, in
    /// which case waits for that one.
    ///
    /// `load` is only called by the caller that starts the flight.
    pub async fn run<F, Fut>(
        &self,
        key: &str,
        load: F,
        cancel: &CancellationToken,
    ) -> Result<Flight<T>, FlightError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(FlightError::Cancelled);
        }

        let (mut rx, sender) = match self.flights.entry(key.to_owned()) {
            Entry::Occupied(existing) => (existing.get().clone(), None),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx.clone());
                (rx, Some(tx))
            }
        };

        let shared = match sender {
            Some(tx) => {
                let guard = FlightGuard {
                    flights: Arc::clone(&self.flights),
                    key: key.to_owned(),
                };
                let fut = load();
                tokio::spawn(async move {
                    let _guard = guard;
                    let value = fut.await;
                    tx.send_replace(Some(value));
                });
                false
            }
            None => {
                metrics::record_coalesced();
                tracing::trace!(key = %key, "Joined in-flight load");
                true
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FlightError::Cancelled),
            outcome = rx.wait_for(Option::is_some) => outcome.map(|value| (*value).clone()),
        };

        match outcome {
            Ok(Some(value)) => Ok(Flight { value, shared }),
            _ => Err(FlightError::Aborted),
        }
    }
}

/// Removes the registry entry when the load task ends, however it ends.
struct FlightGuard<T> {
    flights: Arc<Registry<T>>,
    key: String,
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        self.flights.remove(&self.key);
    }
}
