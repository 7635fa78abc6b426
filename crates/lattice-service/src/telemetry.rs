//! Structured telemetry initialisation.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::{Subscriber, subscriber::SetGlobalDefaultError};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer};

use lattice_config::{Config, LogFormat};
use lattice_metrics::{MetricsSink, WarnCounterLayer};

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

/// Handle returned when telemetry has been initialised.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryHandle;

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Failed to parse the configured log filter expression.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// Failed to install the tracing subscriber.
    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Configures the global tracing subscriber when invoked for the first time.
///
/// Repeated calls are idempotent: the first invocation installs the global
/// subscriber (formatting to stderr plus the warning/error counting layer
/// feeding `sink`); subsequent invocations detect the existing registration
/// and return a fresh [`TelemetryHandle`] without touching global state.
///
/// # Errors
///
/// Returns [`TelemetryError`] when the filter expression is invalid or a
/// different global subscriber was already installed.
pub fn initialise(
    config: &Config,
    sink: Arc<dyn MetricsSink>,
) -> Result<TelemetryHandle, TelemetryError> {
    TELEMETRY_GUARD
        .get_or_try_init(|| install_subscriber(config, sink))
        .map(|_| TelemetryHandle)
}

fn install_subscriber(config: &Config, sink: Arc<dyn MetricsSink>) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_new(&config.log_filter)
        .map_err(|error| TelemetryError::Filter(error.to_string()))?;

    let format_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_writer(io::stderr)
            .with_ansi(false)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(io::stderr)
            // Avoid stray colour codes in non-TTY sinks while keeping colour
            // on interactive terminals.
            .with_ansi(io::stderr().is_terminal())
            .boxed(),
    };

    let subscriber: Box<dyn Subscriber + Send + Sync> = Box::new(
        tracing_subscriber::registry()
            .with(filter)
            .with(WarnCounterLayer::new(sink))
            .with(format_layer),
    );

    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
}
