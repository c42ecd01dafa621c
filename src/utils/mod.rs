//! # Utility Modules
//!
//! Supporting utilities used throughout the endpoints.
//!
//! ## Components
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Default durations and async timeout wrappers
//! - **Metrics**: Thread-safe observability counters

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{global_metrics, Metrics, MetricsSnapshot};
