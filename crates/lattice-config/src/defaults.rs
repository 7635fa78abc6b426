//! Default values applied when the corresponding `JRS_*` variable is unset.

/// Default bind host for the connector listener.
pub const DEFAULT_CONNECTOR_HOST: &str = "0.0.0.0";

/// Default bind port for the connector listener.
pub const DEFAULT_CONNECTOR_PORT: u16 = 3000;

/// Default self-identifier reported by the `_ping` route.
pub const DEFAULT_ALIAS: &str = "anonymous";

/// Default bind host for the metrics exposition endpoint.
pub const DEFAULT_METRICS_HOST: &str = "127.0.0.1";

/// Default bind port for the metrics exposition endpoint.
pub const DEFAULT_METRICS_PORT: u16 = 9777;

/// Default mount path when the connector is embedded as middleware.
pub const DEFAULT_CONNECTOR_PATH: &str = "/";

/// Default request body size limit, in the human-readable size syntax.
pub const DEFAULT_BODY_LIMIT: &str = "20mb";

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";
