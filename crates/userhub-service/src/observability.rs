//! Process-wide tracing and metrics setup.
//!
//! The log filter sits behind a reload layer so [`apply_logging_level`] can
//! change it after a config reload without reinstalling the subscriber.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::config::AppConfig;

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

pub fn init_tracing() {
    init_tracing_with_level("info");
}

/// Installs the global subscriber. `RUST_LOG` wins over `level` when set.
/// Calling this twice keeps the first subscriber.
pub fn init_tracing_with_level(level: &str) {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        Err(_) => EnvFilter::new(level),
    };

    let (filter_layer, handle) = reload::Layer::new(filter);
    if FILTER_HANDLE.set(handle).is_err() {
        return;
    }

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Swaps the active filter. Returns `false` if tracing was not initialized
/// through this module.
pub fn apply_logging_level(level: &str) -> bool {
    let Some(handle) = FILTER_HANDLE.get() else {
        return false;
    };
    handle.modify(|filter| *filter = EnvFilter::new(level)).is_ok()
}

/// Tracing at the configured level plus the Prometheus recorder.
pub fn init_observability(config: &AppConfig) {
    init_tracing_with_level(&config.logging.level);
    if !userhub_cache::metrics::init_metrics() {
        tracing::debug!("Metrics recorder already installed");
    }
    tracing::info!(level = %config.logging.level, "Observability initialized");
}
