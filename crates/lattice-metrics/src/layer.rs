//! Tracing layer that mirrors warning and error volume into counters.

use std::sync::Arc;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::sink::MetricsSink;

/// Counter fed for every WARN event.
pub const LOG_WARNINGS_COUNT: &str = "log_warnings_count";

/// Counter fed for every ERROR event.
pub const LOG_ERRORS_COUNT: &str = "log_errors_count";

/// Layer that increments `log_warnings_count` / `log_errors_count`.
///
/// Installed alongside the formatting subscriber so operators can alert on
/// log volume without scraping log lines.
pub struct WarnCounterLayer {
    sink: Arc<dyn MetricsSink>,
}

impl WarnCounterLayer {
    /// Builds a layer feeding the given sink.
    #[must_use]
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }
}

impl<S: Subscriber> Layer<S> for WarnCounterLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level == Level::WARN {
            self.sink.inc_counter(LOG_WARNINGS_COUNT, &[]);
        } else if level == Level::ERROR {
            self.sink.inc_counter(LOG_ERRORS_COUNT, &[]);
        }
    }
}
