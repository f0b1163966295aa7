//! Observability: structured logging and in-process metrics
//!
//! Logging follows the `LOG_LEVEL` / `LOG_FORMAT` / `LOG_SPANS` conventions, and the
//! metrics collector counts connection, publish and provisioning activity.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, level_for_verbosity, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{mqtt_span, provisioning_span, registration_span};
