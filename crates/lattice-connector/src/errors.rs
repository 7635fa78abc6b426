//! Error types for route handlers and connector startup.

use serde_json::{Value, json};
use thiserror::Error;

use lattice_rpc::{CODE_INTERNAL_SERVER, CODE_VALIDATION, CallError};
use lattice_schema::SchemaError;

/// Errors a pipeline stage or handler can raise.
///
/// The dispatcher classifies these into wire-level error objects: `App`
/// errors are forwarded verbatim, `Refused` maps to the reserved 1001 code,
/// `Bug` is logged and delivered as-is, and `Other` is logged and answered
/// with an empty object so unknown failures leak nothing.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The canonical user-visible error shape: numeric code plus message.
    #[error("{message} (code {code})")]
    App { code: i64, message: String },
    /// A downstream dependency refused the connection.
    #[error("downstream connection refused")]
    Refused,
    /// An internal defect escaped a handler.
    #[error("internal bug: {0}")]
    Bug(String),
    /// Any other thrown value.
    #[error("unclassified handler error")]
    Other(Value),
}

impl RouteError {
    /// Creates an application error with the given code and message.
    pub fn app(code: i64, message: impl Into<String>) -> Self {
        Self::App {
            code,
            message: message.into(),
        }
    }

    /// Creates a validation error (code 400) from collected violations.
    pub fn validation(errors: &[String]) -> Self {
        Self::App {
            code: CODE_VALIDATION,
            message: errors.join("; "),
        }
    }

    /// Creates an internal-bug error.
    pub fn bug(message: impl Into<String>) -> Self {
        Self::Bug(message.into())
    }

    /// Wraps an arbitrary error value.
    pub fn other(value: Value) -> Self {
        Self::Other(value)
    }

    /// The wire-level error object for this failure.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        match self {
            Self::App { code, message } => json!({"code": code, "message": message}),
            Self::Refused => {
                json!({"code": CODE_INTERNAL_SERVER, "message": "Internal server error"})
            }
            Self::Bug(message) => Value::String(message.clone()),
            Self::Other(_) => json!({}),
        }
    }
}

impl From<CallError> for RouteError {
    fn from(error: CallError) -> Self {
        if error.is_refused() {
            Self::Refused
        } else {
            Self::Bug(error.to_string())
        }
    }
}

/// Errors surfaced while starting or operating a connector.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// A route's validation schema failed to compile.
    #[error("route '{route}' has an invalid validation schema: {source}")]
    Schema {
        route: String,
        #[source]
        source: SchemaError,
    },
    /// A route inherits from a parent alias the defaults do not define.
    #[error("route '{route}' inherits unknown parent '{parent}'")]
    UnknownParent { route: String, parent: String },
    /// The listener failed to bind or start.
    #[error(transparent)]
    Listener(#[from] crate::transport::ListenerError),
    /// The Unix socket directory could not be prepared.
    #[error(transparent)]
    Socket(#[from] lattice_config::EndpointError),
    /// An outbound client could not be constructed.
    #[error("failed to build client for '{alias}': {source}")]
    Client {
        alias: String,
        #[source]
        source: CallError,
    },
    /// An operation requiring a started connector was invoked early.
    #[error("connector is not started")]
    NotStarted,
    /// `start` was invoked on a connector that is already running.
    #[error("connector is already started")]
    AlreadyStarted,
}
