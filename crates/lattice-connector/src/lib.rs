//! The RPC connector.
//!
//! A connector is one node of a JSON-RPC 2.0 service mesh. It compiles a
//! user-supplied route map (with schema inheritance and custom validation
//! types) into dispatch pipelines, serves inbound calls over its own listener
//! or as embeddable middleware, keeps a registry of outbound peers verified
//! through the reserved `_ping` route, and records per-route counters and
//! latency histograms.
//!
//! ## Request flow
//!
//! ```text
//! HTTP POST -> envelope parse -> validate -> before... -> handler -> after...
//!           -> empty-response correction -> error classification -> metrics
//! ```
//!
//! Every dispatch produces exactly one response and one metrics record.

mod compile;
mod connector;
mod dispatch;
mod errors;
mod metrics;
mod registry;
mod route;
mod transport;

pub use connector::{Connector, ConnectorOptions};
pub use dispatch::{DispatchOptions, Dispatcher, PayloadHook};
pub use errors::{ConnectorError, RouteError};
pub use registry::{ClientRegistry, ServiceCallError};
pub use route::{
    ParentConfig, RouteConfig, RouteHandler, RouteSpec, ServerDefaults, Stage, handler_fn,
    stage_fn,
};
pub use transport::{
    AcceptedConnection, ConnectionHandler, ConnectorListener, HttpRpcHandler, ListenerError,
    ListenerHandle,
};

/// The reserved identity-probe route registered on every connector.
pub const PING_ROUTE: &str = "_ping";
