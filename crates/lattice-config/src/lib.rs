//! Shared configuration for lattice services.
//!
//! All knobs are read from `JRS_*` environment variables with documented
//! defaults, so a connector can boot with no configuration at all. Loading is
//! side-effect free: [`Config::from_env`] only inspects the environment and
//! returns either a fully resolved [`Config`] or a [`ConfigError`] naming the
//! offending variable. Malformed values are never silently replaced by
//! defaults.

mod defaults;
mod env;
mod limits;
mod logging;
mod socket;

pub use defaults::{
    DEFAULT_ALIAS, DEFAULT_BODY_LIMIT, DEFAULT_CONNECTOR_HOST, DEFAULT_CONNECTOR_PATH,
    DEFAULT_CONNECTOR_PORT, DEFAULT_LOG_FILTER, DEFAULT_METRICS_HOST, DEFAULT_METRICS_PORT,
};
pub use env::{Config, ConfigError};
pub use limits::{BodyLimit, BodyLimitParseError};
pub use logging::{LogFormat, LogFormatParseError};
pub use socket::{EndpointError, SocketEndpoint};
