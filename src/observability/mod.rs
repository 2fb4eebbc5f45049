//! Observability: structured logging, broker metrics and the stats endpoint

pub mod logging;
pub mod metrics;
pub mod stats_server;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{BrokerMetrics, BrokerStats, LatencySummary, WorkerStatsSnapshot};
pub use stats_server::StatsServer;

// Span macros for structured logging
pub use logging::{broker_span, delivery_span, request_span, worker_span};
