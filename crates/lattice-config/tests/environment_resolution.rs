//! End-to-end resolution checks against a simulated environment.

use std::collections::HashMap;

use lattice_config::{Config, SocketEndpoint};

fn environment<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
    let map: HashMap<&str, &str> = pairs.iter().copied().collect();
    move |name| map.get(name).map(|value| (*value).to_string())
}

#[test]
fn empty_environment_yields_documented_defaults() {
    let config = Config::from_lookup(|_| None).expect("load config");
    assert_eq!(config, Config::default());
    assert_eq!(
        config.connector_endpoint(),
        SocketEndpoint::tcp("0.0.0.0", 3000)
    );
    assert_eq!(
        config.metrics_endpoint(),
        SocketEndpoint::tcp("127.0.0.1", 9777)
    );
}

#[test]
fn full_environment_overrides_every_default() {
    let pairs = [
        ("JRS_CONNECTOR_HOST", "192.168.1.5"),
        ("JRS_CONNECTOR_PORT", "8080"),
        ("JRS_CONNECTOR_ALIAS_NAME", "orders"),
        ("JRS_METRICS_HOST", "0.0.0.0"),
        ("JRS_METRICS_PORT", "9100"),
        ("JRS_SYSTEM_METRICS", "true"),
        ("JRS_EXTERNAL_CALLS_METRICS", "1"),
        ("JRS_METRICS_TO_LOG", "yes"),
        ("JRS_SERVER_STATIC_DIR", "/srv/static"),
        ("JRS_SERVER_CONNECTOR_PATH", "/api/rpc"),
        ("JRS_SERVER_BODY_SIZE_LIMIT", "2mb"),
        ("JRS_LOG_FILTER", "debug"),
        ("JRS_LOG_FORMAT", "compact"),
    ];
    let config = Config::from_lookup(environment(&pairs)).expect("load config");

    assert_eq!(
        config.connector_endpoint(),
        SocketEndpoint::tcp("192.168.1.5", 8080)
    );
    assert_eq!(config.alias, "orders");
    assert_eq!(
        config.metrics_endpoint(),
        SocketEndpoint::tcp("0.0.0.0", 9100)
    );
    assert!(config.system_metrics);
    assert!(config.external_calls_metrics);
    assert!(config.metrics_to_log);
    assert_eq!(config.static_dir.as_deref().map(|p| p.as_str()), Some("/srv/static"));
    assert_eq!(config.connector_path, "/api/rpc");
    assert_eq!(config.body_limit.bytes(), 2 * 1024 * 1024);
    assert_eq!(config.log_filter, "debug");
}

#[test]
fn one_malformed_variable_fails_the_whole_load() {
    let pairs = [
        ("JRS_CONNECTOR_HOST", "10.0.0.1"),
        ("JRS_METRICS_PORT", "not-a-port"),
    ];
    assert!(Config::from_lookup(environment(&pairs)).is_err());
}
