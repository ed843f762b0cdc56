//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events; the embedding application picks
//! the sink. This helper installs the usual `fmt` subscriber with an
//! `EnvFilter`, falling back to the configured level when `RUST_LOG` is unset.

use crate::config::ObservabilityConfig;
use crate::error::{BatchLoopError, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
///
/// Returns an error if a global subscriber is already set.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.log_level)));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.structured_logging {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    result.map_err(|e| BatchLoopError::internal(format!("Failed to install tracing subscriber: {}", e)))
}

fn default_directives(level: &str) -> String {
    format!("batchloop_engine={level},batchloop_common={level}")
}
