//! Observability infrastructure for the resilience layer.
//!
//! Provides the metrics sink contract, an in-process collector, and logging
//! utilities.

pub mod logging;
pub mod metrics;

pub use logging::*;
pub use metrics::*;
