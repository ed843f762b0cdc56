//! BatchLoop common library
//!
//! This crate contains the error type, configuration, metrics and logging
//! setup shared by the BatchLoop crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

// Re-export commonly used types
pub use config::{BatchLoopConfig, CleanerConfig, GenerationParams, SchedulerConfig};
pub use error::{BatchLoopError, Result};
pub use metrics::{MetricsRegistry, METRICS};
