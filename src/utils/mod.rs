//! # Utility Modules
//!
//! Supporting utilities for logging, timing and metrics.
//!
//! ## Components
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Timing defaults and async timeout wrappers
//! - **Metrics**: Thread-safe per-connection counters

pub mod logging;
pub mod metrics;
pub mod timeout;
