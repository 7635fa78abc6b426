//! Lifecycle harness for lattice services.
//!
//! Components implement the [`Service`] capability trait; the [`Harness`]
//! holds an ordered list of children and drives them through start (in
//! registration order) and stop (in reverse, skipping children whose one-way
//! `done` flag is set). A harness can also run a periodic iteration loop with
//! overlap and error policies.
//!
//! [`MainHarness`] is the process entrypoint: it installs the telemetry
//! pipeline, logs the resolved configuration, boots the metrics endpoint,
//! starts the children, and blocks until a termination signal arrives.

mod harness;
mod main_harness;
mod service;
mod telemetry;

pub use harness::{Harness, LoopHandle, LoopOptions};
pub use main_harness::{
    MainHarness, MainHarnessError, ManualShutdown, ShutdownError, ShutdownSignal,
    SystemShutdownSignal,
};
pub use service::{Service, ServiceError, ServiceEvent};
pub use telemetry::{TelemetryError, TelemetryHandle, initialise};
