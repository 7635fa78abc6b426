//! Outbound client registry and peer identity verification.
//!
//! Clients are stubs keyed by alias. Registration replaces any existing stub
//! for the alias; stubs are only torn down wholesale when the connector
//! stops. When a registration pins `originRemoteAlias`, the registry probes
//! the peer's `_ping` route and compares the self-reported alias; mismatches
//! are logged as errors but never fail the caller.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, warn};

use lattice_metrics::{LatencyUnit, MetricsSink};
use lattice_rpc::{CODE_CRITICAL_INTERNAL, CallError, ClientConfig, RpcClient, RpcResponse};

use crate::PING_ROUTE;
use crate::errors::ConnectorError;

const REGISTRY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::registry");

/// Attempts made per origin check when the retry policy is enabled.
const ORIGIN_CHECK_ATTEMPTS: u32 = 3;
const ORIGIN_CHECK_BACKOFF: Duration = Duration::from_millis(250);

/// Behavioural options of the registry.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RegistryOptions {
    /// Record `call_api_*` metrics for outbound calls.
    pub external_calls_metrics: bool,
    /// Unit for latency observations.
    pub latency_unit: LatencyUnit,
    /// Retry failed `_ping` probes before settling for a logged error.
    pub retry_origin_check: bool,
}

/// Alias-keyed registry of outbound RPC stubs.
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, RpcClient>>,
    options: RegistryOptions,
    sink: std::sync::Arc<dyn MetricsSink>,
}

/// Errors surfaced by high-level outbound calls.
#[derive(Debug, thiserror::Error)]
pub enum ServiceCallError {
    /// `call_service` was invoked with non-object params.
    #[error("params must be an object")]
    InvalidParams,
    /// No client is registered under the alias.
    #[error("unknown service '{alias}'")]
    UnknownService { alias: String },
    /// The transport-level exchange failed locally.
    #[error(transparent)]
    Transport(#[from] CallError),
    /// The peer answered with an error; passed through unchanged.
    #[error("remote error")]
    Remote(Value),
}

impl ServiceCallError {
    /// The wire-level error object for callers that forward the failure.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        match self {
            Self::InvalidParams => serde_json::json!({
                "code": CODE_CRITICAL_INTERNAL,
                "message": "Critical internal error"
            }),
            Self::UnknownService { alias } => serde_json::json!({
                "code": CODE_CRITICAL_INTERNAL,
                "message": format!("unknown service '{alias}'")
            }),
            Self::Transport(error) => serde_json::json!({
                "code": CODE_CRITICAL_INTERNAL,
                "message": error.to_string()
            }),
            Self::Remote(value) => value.clone(),
        }
    }
}

impl ClientRegistry {
    pub(crate) fn new(
        options: RegistryOptions,
        sink: std::sync::Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            options,
            sink,
        }
    }

    /// Registers (or replaces) the client stub for an alias.
    ///
    /// When the configuration pins an origin alias, the peer is probed via
    /// `_ping`; probe failures and alias mismatches are logged but do not
    /// fail registration.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Client`] only when the target URL cannot be
    /// parsed.
    pub fn add_service(&self, alias: &str, config: &ClientConfig) -> Result<(), ConnectorError> {
        let client =
            RpcClient::new(config.connect()).map_err(|source| ConnectorError::Client {
                alias: alias.to_string(),
                source,
            })?;

        {
            let mut clients = self
                .clients
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            clients.insert(alias.to_string(), client.clone());
        }
        debug!(
            target: REGISTRY_TARGET,
            alias,
            connect = config.connect(),
            "registered outbound client"
        );

        if let Some(expected) = config.origin_remote_alias() {
            self.verify_origin(alias, &client, expected);
        }
        Ok(())
    }

    /// Whether a client is registered under the alias.
    #[must_use]
    pub fn contains(&self, alias: &str) -> bool {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(alias)
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every registered client.
    pub fn clear(&self) {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Issues a raw call to a registered peer and returns the envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceCallError::UnknownService`] for unregistered aliases
    /// and [`ServiceCallError::Transport`] for local transport failures.
    pub fn send_to(
        &self,
        service: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<RpcResponse, ServiceCallError> {
        let client = {
            let clients = self
                .clients
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            clients.get(service).cloned()
        };
        let Some(client) = client else {
            error!(
                target: REGISTRY_TARGET,
                service,
                method,
                "call to unknown service"
            );
            return Err(ServiceCallError::UnknownService {
                alias: service.to_string(),
            });
        };

        let started = Instant::now();
        let outcome = client.call(method, params);
        if self.options.external_calls_metrics {
            crate::metrics::record_call(
                self.sink.as_ref(),
                service,
                method,
                outcome.is_err(),
                started.elapsed(),
                self.options.latency_unit,
            );
        }
        outcome.map_err(ServiceCallError::Transport)
    }

    /// Calls a peer method and interprets the response envelope.
    ///
    /// Remote errors pass through unchanged; the classification below exists
    /// purely for log triage.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceCallError::InvalidParams`] for non-object params,
    /// plus everything [`send_to`](Self::send_to) can produce; a response
    /// envelope carrying an error becomes [`ServiceCallError::Remote`].
    pub fn call_service(
        &self,
        service: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, ServiceCallError> {
        if !params.is_object() {
            error!(
                target: REGISTRY_TARGET,
                service,
                method,
                "call_service invoked with non-object params"
            );
            return Err(ServiceCallError::InvalidParams);
        }

        let response = self.send_to(service, method, Some(params))?;
        match response.error {
            None => Ok(response.result.unwrap_or(Value::Null)),
            Some(remote) => {
                self.triage_remote_error(service, method, &remote);
                Err(ServiceCallError::Remote(remote))
            }
        }
    }

    /// Log-only classification of remote errors by shape and code sign.
    fn triage_remote_error(&self, service: &str, method: &str, remote: &Value) {
        let Value::Object(fields) = remote else {
            error!(
                target: REGISTRY_TARGET,
                service,
                method,
                error = %remote,
                "non-standard plain error from peer"
            );
            return;
        };
        let Some(code) = fields.get("code").and_then(Value::as_i64) else {
            error!(
                target: REGISTRY_TARGET,
                service,
                method,
                error = %remote,
                "non-standard hinted error from peer"
            );
            return;
        };
        if code < 0 {
            error!(
                target: REGISTRY_TARGET,
                service,
                method,
                code,
                "RPC-error from peer"
            );
        } else {
            warn!(
                target: REGISTRY_TARGET,
                service,
                method,
                code,
                "safe provided error from peer"
            );
        }
    }

    /// Probes the peer's `_ping` route and checks its self-reported alias.
    fn verify_origin(&self, alias: &str, client: &RpcClient, expected: &str) {
        let attempts = if self.options.retry_origin_check {
            ORIGIN_CHECK_ATTEMPTS
        } else {
            1
        };

        let mut last_failure = None;
        for attempt in 1..=attempts {
            match client.call(PING_ROUTE, None) {
                Ok(response) => {
                    let reported = response
                        .result
                        .as_ref()
                        .and_then(|result| result.get("alias"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    if reported == expected {
                        debug!(
                            target: REGISTRY_TARGET,
                            alias,
                            "peer identity verified"
                        );
                    } else {
                        error!(
                            target: REGISTRY_TARGET,
                            alias,
                            expected,
                            reported,
                            "peer identity mismatch"
                        );
                    }
                    return;
                }
                Err(cause) => {
                    if attempt < attempts {
                        thread::sleep(ORIGIN_CHECK_BACKOFF);
                    }
                    last_failure = Some(cause);
                }
            }
        }

        if let Some(cause) = last_failure {
            error!(
                target: REGISTRY_TARGET,
                alias,
                expected,
                error = %cause,
                "peer identity probe failed"
            );
        }
    }
}
