//! The resolved configuration record and its environment loader.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::defaults::{
    DEFAULT_ALIAS, DEFAULT_BODY_LIMIT, DEFAULT_CONNECTOR_HOST, DEFAULT_CONNECTOR_PATH,
    DEFAULT_CONNECTOR_PORT, DEFAULT_LOG_FILTER, DEFAULT_METRICS_HOST, DEFAULT_METRICS_PORT,
};
use crate::limits::BodyLimit;
use crate::logging::LogFormat;
use crate::socket::SocketEndpoint;

/// Resolved configuration for a lattice service instance.
///
/// Every field has a documented default, so `Config::default()` describes a
/// connector listening on `0.0.0.0:3000` with metrics on `127.0.0.1:9777`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Bind host for the connector listener (`JRS_CONNECTOR_HOST`).
    pub connector_host: String,
    /// Bind port for the connector listener (`JRS_CONNECTOR_PORT`).
    pub connector_port: u16,
    /// Unix socket path; takes precedence over host/port (`JRS_CONNECTOR_SOCKET`).
    pub connector_socket: Option<Utf8PathBuf>,
    /// Self-identifier reported by `_ping` (`JRS_CONNECTOR_ALIAS_NAME`).
    pub alias: String,
    /// Bind host for the metrics endpoint (`JRS_METRICS_HOST`).
    pub metrics_host: String,
    /// Bind port for the metrics endpoint (`JRS_METRICS_PORT`).
    pub metrics_port: u16,
    /// Whether process-level metrics are collected (`JRS_SYSTEM_METRICS`).
    pub system_metrics: bool,
    /// Whether outbound call metrics are recorded (`JRS_EXTERNAL_CALLS_METRICS`).
    pub external_calls_metrics: bool,
    /// Whether metric snapshots are mirrored to the log (`JRS_METRICS_TO_LOG`).
    pub metrics_to_log: bool,
    /// Optional static file directory served by the web wrapper (`JRS_SERVER_STATIC_DIR`).
    pub static_dir: Option<Utf8PathBuf>,
    /// Mount path for the connector middleware (`JRS_SERVER_CONNECTOR_PATH`).
    pub connector_path: String,
    /// Maximum accepted request body size (`JRS_SERVER_BODY_SIZE_LIMIT`).
    pub body_limit: BodyLimit,
    /// Log filter expression (`JRS_LOG_FILTER`).
    pub log_filter: String,
    /// Log output format (`JRS_LOG_FORMAT`).
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connector_host: DEFAULT_CONNECTOR_HOST.to_string(),
            connector_port: DEFAULT_CONNECTOR_PORT,
            connector_socket: None,
            alias: DEFAULT_ALIAS.to_string(),
            metrics_host: DEFAULT_METRICS_HOST.to_string(),
            metrics_port: DEFAULT_METRICS_PORT,
            system_metrics: false,
            external_calls_metrics: false,
            metrics_to_log: false,
            static_dir: None,
            connector_path: DEFAULT_CONNECTOR_PATH.to_string(),
            body_limit: DEFAULT_BODY_LIMIT
                .parse()
                .unwrap_or(BodyLimit::from_bytes(20 * 1024 * 1024)),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a variable is present but malformed.
    /// Absent variables fall back to their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads the configuration through an injectable variable lookup.
    ///
    /// Tests supply a closure over a plain map instead of mutating the
    /// process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a variable is present but malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(host) = lookup("JRS_CONNECTOR_HOST") {
            config.connector_host = host;
        }
        if let Some(port) = lookup("JRS_CONNECTOR_PORT") {
            config.connector_port = parse_port("JRS_CONNECTOR_PORT", &port)?;
        }
        if let Some(socket) = lookup("JRS_CONNECTOR_SOCKET") {
            config.connector_socket = Some(Utf8PathBuf::from(socket));
        }
        if let Some(alias) = lookup("JRS_CONNECTOR_ALIAS_NAME") {
            config.alias = alias;
        }
        if let Some(host) = lookup("JRS_METRICS_HOST") {
            config.metrics_host = host;
        }
        if let Some(port) = lookup("JRS_METRICS_PORT") {
            config.metrics_port = parse_port("JRS_METRICS_PORT", &port)?;
        }
        if let Some(flag) = lookup("JRS_SYSTEM_METRICS") {
            config.system_metrics = parse_bool("JRS_SYSTEM_METRICS", &flag)?;
        }
        if let Some(flag) = lookup("JRS_EXTERNAL_CALLS_METRICS") {
            config.external_calls_metrics = parse_bool("JRS_EXTERNAL_CALLS_METRICS", &flag)?;
        }
        if let Some(flag) = lookup("JRS_METRICS_TO_LOG") {
            config.metrics_to_log = parse_bool("JRS_METRICS_TO_LOG", &flag)?;
        }
        if let Some(dir) = lookup("JRS_SERVER_STATIC_DIR") {
            config.static_dir = Some(Utf8PathBuf::from(dir));
        }
        if let Some(path) = lookup("JRS_SERVER_CONNECTOR_PATH") {
            config.connector_path = path;
        }
        if let Some(limit) = lookup("JRS_SERVER_BODY_SIZE_LIMIT") {
            config.body_limit =
                limit
                    .parse()
                    .map_err(|source| ConfigError::InvalidBodyLimit {
                        value: limit.clone(),
                        source,
                    })?;
        }
        if let Some(filter) = lookup("JRS_LOG_FILTER") {
            config.log_filter = filter;
        }
        if let Some(format) = lookup("JRS_LOG_FORMAT") {
            config.log_format = format
                .parse()
                .map_err(|_| ConfigError::InvalidLogFormat { value: format })?;
        }

        Ok(config)
    }

    /// Endpoint the connector should bind. The Unix socket wins when set.
    #[must_use]
    pub fn connector_endpoint(&self) -> SocketEndpoint {
        match &self.connector_socket {
            Some(path) => SocketEndpoint::unix(path.clone()),
            None => SocketEndpoint::tcp(self.connector_host.clone(), self.connector_port),
        }
    }

    /// Endpoint the metrics exposition server should bind.
    #[must_use]
    pub fn metrics_endpoint(&self) -> SocketEndpoint {
        SocketEndpoint::tcp(self.metrics_host.clone(), self.metrics_port)
    }

    /// Ordered name/value pairs of the resolved configuration.
    ///
    /// The main harness logs these at startup so operators can see the
    /// environment the service actually resolved.
    #[must_use]
    pub fn report(&self) -> Vec<(&'static str, String)> {
        vec![
            ("connector_endpoint", self.connector_endpoint().to_string()),
            ("alias", self.alias.clone()),
            ("metrics_endpoint", self.metrics_endpoint().to_string()),
            ("system_metrics", self.system_metrics.to_string()),
            (
                "external_calls_metrics",
                self.external_calls_metrics.to_string(),
            ),
            ("metrics_to_log", self.metrics_to_log.to_string()),
            ("connector_path", self.connector_path.clone()),
            ("body_limit", self.body_limit.to_string()),
            ("log_filter", self.log_filter.clone()),
            ("log_format", self.log_format.to_string()),
        ]
    }
}

fn parse_port(var: &'static str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidPort {
        var,
        value: value.to_string(),
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var,
            value: value.to_string(),
        }),
    }
}

/// Errors surfaced while resolving the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A port variable did not hold a valid 16-bit port number.
    #[error("{var} value '{value}' is not a valid port")]
    InvalidPort { var: &'static str, value: String },
    /// A boolean variable held an unrecognised value.
    #[error("{var} value '{value}' is not a valid boolean")]
    InvalidBool { var: &'static str, value: String },
    /// The body size limit failed to parse.
    #[error("JRS_SERVER_BODY_SIZE_LIMIT value '{value}' is invalid: {source}")]
    InvalidBodyLimit {
        value: String,
        #[source]
        source: crate::limits::BodyLimitParseError,
    },
    /// The log format was not recognised.
    #[error("JRS_LOG_FORMAT value '{value}' is not a valid log format")]
    InvalidLogFormat { value: String },
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |name| map.get(name).map(|value| (*value).to_string())
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.connector_host, "0.0.0.0");
        assert_eq!(config.connector_port, 3000);
        assert_eq!(config.alias, "anonymous");
        assert_eq!(config.metrics_host, "127.0.0.1");
        assert_eq!(config.metrics_port, 9777);
        assert!(!config.system_metrics);
        assert_eq!(config.connector_path, "/");
        assert_eq!(config.body_limit.bytes(), 20 * 1024 * 1024);
    }

    #[test]
    fn socket_wins_over_host_port() {
        let config = Config::from_lookup(lookup_from(&[
            ("JRS_CONNECTOR_HOST", "10.0.0.1"),
            ("JRS_CONNECTOR_PORT", "4000"),
            ("JRS_CONNECTOR_SOCKET", "/run/lattice/connector.sock"),
        ]))
        .expect("load config");

        assert_eq!(
            config.connector_endpoint(),
            SocketEndpoint::unix("/run/lattice/connector.sock")
        );
    }

    #[test]
    fn overrides_apply() {
        let config = Config::from_lookup(lookup_from(&[
            ("JRS_CONNECTOR_ALIAS_NAME", "billing"),
            ("JRS_EXTERNAL_CALLS_METRICS", "true"),
            ("JRS_SERVER_BODY_SIZE_LIMIT", "1mb"),
            ("JRS_SERVER_CONNECTOR_PATH", "/rpc"),
        ]))
        .expect("load config");

        assert_eq!(config.alias, "billing");
        assert!(config.external_calls_metrics);
        assert_eq!(config.body_limit.bytes(), 1024 * 1024);
        assert_eq!(config.connector_path, "/rpc");
    }

    #[rstest]
    #[case::bad_port("JRS_CONNECTOR_PORT", "70000")]
    #[case::bad_bool("JRS_SYSTEM_METRICS", "maybe")]
    #[case::bad_limit("JRS_SERVER_BODY_SIZE_LIMIT", "huge")]
    #[case::bad_format("JRS_LOG_FORMAT", "xml")]
    fn malformed_values_are_errors(#[case] var: &'static str, #[case] value: &str) {
        let pairs = [(var, value)];
        let result = Config::from_lookup(lookup_from(&pairs));
        assert!(result.is_err(), "{var}={value} should fail to load");
    }

    #[rstest]
    #[case::one("1", true)]
    #[case::yes("YES", true)]
    #[case::on("on", true)]
    #[case::zero("0", false)]
    #[case::off("off", false)]
    fn boolean_forms(#[case] raw: &str, #[case] expected: bool) {
        let pairs = [("JRS_METRICS_TO_LOG", raw)];
        let config = Config::from_lookup(lookup_from(&pairs)).expect("load config");
        assert_eq!(config.metrics_to_log, expected);
    }

    #[test]
    fn report_names_every_surface() {
        let report = Config::default().report();
        let names: Vec<&str> = report.iter().map(|(name, _)| *name).collect();
        assert!(names.contains(&"connector_endpoint"));
        assert!(names.contains(&"metrics_endpoint"));
        assert!(names.contains(&"alias"));
    }
}
