//! The lifecycle capability trait.

use thiserror::Error;

/// Lifecycle events delivered to services through [`Service::on_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// A sibling or parent service finished starting.
    Started { name: String },
    /// A sibling or parent service finished stopping.
    Stopped { name: String },
    /// A service marked itself done and will be skipped on teardown.
    Done { name: String },
}

/// Capability interface for startable/stoppable components.
///
/// `restore` and `retry` have working defaults; most services only implement
/// `start` and `stop`. The `done` flag is one-way: once a service reports
/// done it is skipped by harness teardown.
pub trait Service: Send {
    /// Human-readable service name used in logs and events.
    fn name(&self) -> &str;

    /// Brings the service up. Called once per lifecycle.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] when startup fails; the owning harness aborts
    /// its own startup and unwinds already-started siblings.
    fn start(&mut self) -> Result<(), ServiceError>;

    /// Tears the service down.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] when teardown fails; the harness logs the
    /// failure and continues stopping remaining children.
    fn stop(&mut self) -> Result<(), ServiceError>;

    /// Re-establishes state after a transient fault.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] when recovery is impossible.
    fn restore(&mut self) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Stops and starts the service again.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] from either phase.
    fn retry(&mut self) -> Result<(), ServiceError> {
        self.stop()?;
        self.start()
    }

    /// Whether the service has permanently finished its work.
    fn is_done(&self) -> bool {
        false
    }

    /// Receives lifecycle events. The default ignores them.
    fn on_event(&mut self, _event: &ServiceEvent) {}
}

/// Errors surfaced by service lifecycle operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Startup failed.
    #[error("service '{name}' failed to start: {message}")]
    Startup { name: String, message: String },
    /// Teardown failed.
    #[error("service '{name}' failed to stop: {message}")]
    Teardown { name: String, message: String },
    /// A periodic iteration body failed.
    #[error("iteration failed: {message}")]
    Iteration { message: String },
    /// Any other failure raised by a service implementation.
    #[error("{message}")]
    Other { message: String },
}

impl ServiceError {
    /// Creates a startup error.
    pub fn startup(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Startup {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates a teardown error.
    pub fn teardown(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Teardown {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates an iteration error.
    pub fn iteration(message: impl Into<String>) -> Self {
        Self::Iteration {
            message: message.into(),
        }
    }

    /// Creates a generic error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}
