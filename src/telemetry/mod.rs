//! Telemetry module for logging and metrics.
//!
//! Provides:
//! - Logging configuration and initialization
//! - Metrics collection for dispatch statistics

mod logging;
mod metrics;

pub use logging::init_logging;
pub use metrics::{Counter, Gauge, MetricsRegistry};
