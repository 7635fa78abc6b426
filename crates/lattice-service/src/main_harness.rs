//! Process entrypoint harness.
//!
//! The main harness owns the root service tree. Running it installs the
//! telemetry pipeline, logs the resolved configuration, boots the metrics
//! exposition endpoint, starts the registered children in order, and blocks
//! until a termination signal arrives, after which the children are stopped
//! in reverse.

use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;
use tracing::{error, info};

use lattice_config::Config;
use lattice_metrics::{MetricsServer, MetricsServerError, MetricsSink};

use crate::harness::Harness;
use crate::service::{Service, ServiceError};
use crate::telemetry::{self, TelemetryError};

const MAIN_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::main");

/// Interval between metric snapshots mirrored to the log.
const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Abstraction over shutdown notification mechanisms.
pub trait ShutdownSignal: Send + Sync {
    /// Blocks until shutdown should proceed.
    fn wait(&self) -> Result<(), ShutdownError>;
}

/// Errors reported by shutdown signal listeners.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Installing signal handlers failed.
    #[error("failed to install signal handlers: {source}")]
    Install {
        #[source]
        source: io::Error,
    },
}

/// Shutdown listener that waits for termination signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemShutdownSignal;

impl SystemShutdownSignal {
    /// Builds the signal listener.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ShutdownSignal for SystemShutdownSignal {
    fn wait(&self) -> Result<(), ShutdownError> {
        let mut signals = Signals::new([SIGTERM, SIGINT, SIGQUIT, SIGHUP])
            .map_err(|source| ShutdownError::Install { source })?;
        if let Some(signal) = signals.forever().next() {
            info!(
                target: MAIN_TARGET,
                signal,
                "shutdown signal received"
            );
        }
        Ok(())
    }
}

/// Test shutdown signal triggered from another thread.
#[derive(Clone)]
pub struct ManualShutdown {
    sender: Arc<Mutex<Option<mpsc::Sender<()>>>>,
    receiver: Arc<Mutex<mpsc::Receiver<()>>>,
}

impl ManualShutdown {
    /// Builds an untriggered shutdown signal.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Releases every waiter.
    pub fn trigger(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Default for ManualShutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal for ManualShutdown {
    fn wait(&self) -> Result<(), ShutdownError> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Disconnection of the sender is the trigger.
        let _ = receiver.recv();
        Ok(())
    }
}

/// Errors surfaced while running the main harness.
#[derive(Debug, Error)]
pub enum MainHarnessError {
    /// Telemetry failed to initialise.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    /// The metrics endpoint failed to bind.
    #[error(transparent)]
    Metrics(#[from] MetricsServerError),
    /// A child service failed to start.
    #[error(transparent)]
    Service(#[from] ServiceError),
    /// Waiting for the shutdown signal failed.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

/// The process-level harness.
pub struct MainHarness {
    config: Config,
    root: Harness,
    sink: Arc<dyn MetricsSink>,
    exit_on_panic: bool,
}

impl MainHarness {
    /// Builds a harness over the given configuration, reporting metrics to
    /// the process-wide registry.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_sink(config, lattice_metrics::global())
    }

    /// Builds a harness with an injected metrics sink (used by tests).
    #[must_use]
    pub fn with_sink(config: Config, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            config,
            root: Harness::new("main"),
            sink,
            exit_on_panic: false,
        }
    }

    /// Terminates the process with exit code 1 when any thread panics.
    #[must_use]
    pub fn with_exit_on_panic(mut self) -> Self {
        self.exit_on_panic = true;
        self
    }

    /// Registers a child service; registration order is start order.
    pub fn register(&mut self, child: Box<dyn Service>) {
        self.root.register(child);
    }

    /// Runs the service tree until the shutdown signal fires.
    ///
    /// # Errors
    ///
    /// Returns [`MainHarnessError`] when telemetry, the metrics endpoint, or
    /// a child service fails to come up. Startup failures unwind the
    /// already-started children before returning.
    pub fn run(mut self, shutdown: &dyn ShutdownSignal) -> Result<(), MainHarnessError> {
        telemetry::initialise(&self.config, Arc::clone(&self.sink))?;

        for (name, value) in self.config.report() {
            info!(target: MAIN_TARGET, config = name, value, "resolved configuration");
        }

        if self.exit_on_panic {
            install_exit_on_panic();
        }

        if self.config.system_metrics {
            let started = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO);
            self.sink
                .set_gauge("process_start_time_seconds", &[], started.as_secs_f64());
        }

        let mut metrics_server = Some(MetricsServer::bind(
            &self.config.metrics_host,
            self.config.metrics_port,
            Arc::clone(&self.sink),
        )?);

        if self.config.metrics_to_log {
            let sink = Arc::clone(&self.sink);
            self.root
                .start_loop(METRICS_LOG_INTERVAL, METRICS_LOG_INTERVAL, move || {
                    info!(
                        target: MAIN_TARGET,
                        snapshot = %sink.render(),
                        "metrics snapshot"
                    );
                    Ok(())
                });
        }

        if let Err(cause) = self.root.start() {
            if let Some(mut server) = metrics_server.take() {
                server.shutdown();
            }
            return Err(cause.into());
        }
        info!(target: MAIN_TARGET, "startup complete");

        shutdown.wait()?;

        if let Err(cause) = self.root.stop() {
            error!(
                target: MAIN_TARGET,
                error = %cause,
                "teardown reported an error"
            );
        }
        if let Some(mut server) = metrics_server.take() {
            server.shutdown();
        }
        info!(target: MAIN_TARGET, "shutdown sequence completed");
        Ok(())
    }
}

/// Installs a panic hook that logs and terminates the process.
fn install_exit_on_panic() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!(
            target: MAIN_TARGET,
            panic = %panic_info,
            "unrecoverable panic, terminating"
        );
        previous(panic_info);
        std::process::exit(1);
    }));
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use lattice_metrics::NoopMetrics;

    use super::*;

    struct CountingService {
        name: String,
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    impl Service for CountingService {
        fn name(&self) -> &str {
            &self.name
        }

        fn start(&mut self) -> Result<(), ServiceError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) -> Result<(), ServiceError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn runs_children_until_shutdown_fires() {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));

        let config = Config {
            metrics_port: 0,
            ..Config::default()
        };
        let mut harness = MainHarness::with_sink(config, Arc::new(NoopMetrics));
        harness.register(Box::new(CountingService {
            name: "child".to_string(),
            starts: Arc::clone(&starts),
            stops: Arc::clone(&stops),
        }));

        let shutdown = ManualShutdown::new();
        let trigger = shutdown.clone();
        let runner = thread::spawn(move || harness.run(&shutdown));

        // Give startup a moment, then request shutdown.
        thread::sleep(Duration::from_millis(100));
        trigger.trigger();
        runner
            .join()
            .expect("join runner")
            .expect("run completes");

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_child_start_aborts_run() {
        struct FailingService;
        impl Service for FailingService {
            fn name(&self) -> &str {
                "failing"
            }
            fn start(&mut self) -> Result<(), ServiceError> {
                Err(ServiceError::startup("failing", "induced"))
            }
            fn stop(&mut self) -> Result<(), ServiceError> {
                Ok(())
            }
        }

        let config = Config {
            metrics_port: 0,
            ..Config::default()
        };
        let mut harness = MainHarness::with_sink(config, Arc::new(NoopMetrics));
        harness.register(Box::new(FailingService));

        let shutdown = ManualShutdown::new();
        let result = harness.run(&shutdown);

        assert!(matches!(result, Err(MainHarnessError::Service(_))));
    }
}
