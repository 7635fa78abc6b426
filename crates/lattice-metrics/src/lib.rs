//! Process-wide telemetry registries for lattice services.
//!
//! The [`MetricsSink`] trait is the capability every instrumented component
//! receives; the concrete [`Registry`] implements it with counter, gauge, and
//! histogram families rendered in the Prometheus text exposition format. A
//! lazily initialised process-wide registry is available through [`global`],
//! and tests substitute [`NoopMetrics`] wherever a sink is injected.
//!
//! The [`MetricsServer`] answers `GET /metrics` on its own listener, and
//! [`WarnCounterLayer`] feeds the `log_warnings_count` / `log_errors_count`
//! counters from the tracing pipeline.

mod layer;
mod registry;
mod server;
mod sink;

pub use layer::{LOG_ERRORS_COUNT, LOG_WARNINGS_COUNT, WarnCounterLayer};
pub use registry::{DEFAULT_BUCKETS, Registry, global};
pub use server::{MetricsServer, MetricsServerError};
pub use sink::{LatencyUnit, MetricsSink, NoopMetrics};
