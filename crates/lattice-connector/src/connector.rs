//! The connector service.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Value, json};
use tracing::{info, warn};

use lattice_config::{BodyLimit, Config, SocketEndpoint};
use lattice_metrics::{LatencyUnit, MetricsSink};
use lattice_rpc::{ClientConfig, RpcResponse};
use lattice_service::{Service, ServiceError};

use crate::PING_ROUTE;
use crate::compile::compile_routes;
use crate::dispatch::{DispatchOptions, Dispatcher, PayloadHook};
use crate::errors::ConnectorError;
use crate::registry::{ClientRegistry, RegistryOptions, ServiceCallError};
use crate::route::{RouteSpec, ServerDefaults};
use crate::transport::{ConnectorListener, HttpRpcHandler, ListenerHandle};

const CONNECTOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::connector");

/// Configuration of one connector instance.
#[derive(Clone)]
pub struct ConnectorOptions {
    /// Self-identifier reported by the `_ping` route.
    pub alias: String,
    /// Endpoint for the own listener; `None` selects middleware mode.
    pub endpoint: Option<SocketEndpoint>,
    /// Mount path served by the HTTP handler.
    pub connector_path: String,
    /// Maximum accepted request body size.
    pub body_limit: BodyLimit,
    /// Whether falsy-equivalent and literal `"Ok"` responses are replaced.
    pub empty_response_correction: bool,
    /// The replacement used by empty-response correction.
    pub empty_response_default: Value,
    /// Unit for latency observations.
    pub latency_unit: LatencyUnit,
    /// Record `call_api_*` metrics for outbound calls.
    pub external_calls_metrics: bool,
    /// Retry failed `_ping` origin probes before settling for a logged error.
    pub retry_origin_check: bool,
    /// Connection exchanges served concurrently; excess connections queue.
    pub max_connections: usize,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            alias: lattice_config::DEFAULT_ALIAS.to_string(),
            endpoint: None,
            connector_path: lattice_config::DEFAULT_CONNECTOR_PATH.to_string(),
            body_limit: BodyLimit::from_bytes(20 * 1024 * 1024),
            empty_response_correction: true,
            empty_response_default: json!({"status": "OK"}),
            latency_unit: LatencyUnit::default(),
            external_calls_metrics: false,
            retry_origin_check: false,
            max_connections: 128,
        }
    }
}

impl ConnectorOptions {
    /// Derives listener-mode options from the resolved configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            alias: config.alias.clone(),
            endpoint: Some(config.connector_endpoint()),
            connector_path: config.connector_path.clone(),
            body_limit: config.body_limit,
            external_calls_metrics: config.external_calls_metrics,
            ..Self::default()
        }
    }

    /// Derives middleware-mode options (no own listener).
    #[must_use]
    pub fn middleware(config: &Config) -> Self {
        Self {
            endpoint: None,
            ..Self::from_config(config)
        }
    }
}

/// One node of the RPC mesh.
///
/// Routes and defaults are registered before [`start`](Service::start);
/// outbound services can be added at any time. Starting compiles the route
/// table (injecting `_ping`), binds the listener unless running as
/// middleware, materialises queued clients, and probes pinned peers.
pub struct Connector {
    options: ConnectorOptions,
    routes: BTreeMap<String, RouteSpec>,
    defaults: ServerDefaults,
    payload_hook: Option<PayloadHook>,
    sink: Arc<dyn MetricsSink>,
    clients: Arc<ClientRegistry>,
    pending_clients: Mutex<Vec<(String, ClientConfig)>>,
    dispatcher: Option<Arc<Dispatcher>>,
    handler: Option<Arc<HttpRpcHandler>>,
    listener: Option<ListenerHandle>,
    bound_addr: Option<SocketAddr>,
    started: AtomicBool,
}

impl Connector {
    /// Builds a connector reporting to the process-wide metrics registry.
    #[must_use]
    pub fn new(options: ConnectorOptions) -> Self {
        let sink = lattice_metrics::global();
        Self::with_sink(options, sink)
    }

    /// Builds a connector with an injected metrics sink.
    #[must_use]
    pub fn with_sink(options: ConnectorOptions, sink: Arc<dyn MetricsSink>) -> Self {
        let registry_options = RegistryOptions {
            external_calls_metrics: options.external_calls_metrics,
            latency_unit: options.latency_unit,
            retry_origin_check: options.retry_origin_check,
        };
        let clients = Arc::new(ClientRegistry::new(registry_options, Arc::clone(&sink)));
        Self {
            options,
            routes: BTreeMap::new(),
            defaults: ServerDefaults::new(),
            payload_hook: None,
            sink,
            clients,
            pending_clients: Mutex::new(Vec::new()),
            dispatcher: None,
            handler: None,
            listener: None,
            bound_addr: None,
            started: AtomicBool::new(false),
        }
    }

    /// The connector's self-identifier.
    #[must_use]
    pub fn alias(&self) -> &str {
        &self.options.alias
    }

    /// Registers a route. Later registrations replace earlier ones.
    pub fn route(&mut self, name: impl Into<String>, spec: impl Into<RouteSpec>) {
        self.routes.insert(name.into(), spec.into());
    }

    /// Installs the server defaults consumed by route compilation.
    pub fn set_defaults(&mut self, defaults: ServerDefaults) {
        self.defaults = defaults;
    }

    /// Installs the optional pre-dispatch payload hook.
    pub fn set_payload_hook(&mut self, hook: PayloadHook) {
        self.payload_hook = Some(hook);
    }

    /// Registers an outbound peer.
    ///
    /// Before startup the registration is queued and materialised during
    /// [`start`](Service::start); afterwards it takes effect immediately,
    /// replacing any existing stub for the alias.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Client`] when the target URL is invalid
    /// (only possible for immediate registrations).
    pub fn add_service(
        &self,
        alias: impl Into<String>,
        config: ClientConfig,
    ) -> Result<(), ConnectorError> {
        let alias = alias.into();
        if self.started.load(Ordering::SeqCst) {
            self.clients.add_service(&alias, &config)
        } else {
            self.pending_clients
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((alias, config));
            Ok(())
        }
    }

    /// The HTTP handler for middleware embedding.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::NotStarted`] before startup.
    pub fn handler(&self) -> Result<Arc<HttpRpcHandler>, ConnectorError> {
        self.handler.clone().ok_or(ConnectorError::NotStarted)
    }

    /// Dispatches a call in-process, exactly as the transport would.
    ///
    /// # Errors
    ///
    /// Returns the wire-level error object, or a not-started error object
    /// when invoked before startup.
    pub fn dispatch(&self, method: &str, params: Value) -> Result<Value, Value> {
        let Some(dispatcher) = &self.dispatcher else {
            return Err(json!({"code": 500, "message": "connector is not started"}));
        };
        dispatcher.dispatch(method, params)
    }

    /// Issues a raw outbound call to a registered peer.
    ///
    /// # Errors
    ///
    /// See [`ClientRegistry::send_to`].
    pub fn send_to(
        &self,
        service: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<RpcResponse, ServiceCallError> {
        self.clients.send_to(service, method, params)
    }

    /// Calls a peer method and interprets the response envelope.
    ///
    /// # Errors
    ///
    /// See [`ClientRegistry::call_service`].
    pub fn call_service(
        &self,
        service: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, ServiceCallError> {
        self.clients.call_service(service, method, params)
    }

    /// Address the listener actually bound, for TCP endpoints.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    fn start_inner(&mut self) -> Result<(), ConnectorError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(ConnectorError::AlreadyStarted);
        }

        let mut routes = self.routes.clone();
        let alias = self.options.alias.clone();
        routes.insert(
            PING_ROUTE.to_string(),
            RouteSpec::bare(move |_data: &mut Value| {
                Ok(json!({"status": "OK", "alias": alias.clone()}))
            }),
        );

        let compiled = compile_routes(&routes, &self.defaults)?;
        let dispatch_options = DispatchOptions {
            empty_response_correction: self.options.empty_response_correction,
            empty_response_default: self.options.empty_response_default.clone(),
            latency_unit: self.options.latency_unit,
            payload_hook: self.payload_hook.clone(),
        };
        let dispatcher = Arc::new(Dispatcher::new(
            compiled,
            dispatch_options,
            Arc::clone(&self.sink),
        ));
        let handler = Arc::new(HttpRpcHandler::new(
            Arc::clone(&dispatcher),
            self.options.connector_path.clone(),
            self.options.body_limit,
        ));

        if let Some(endpoint) = &self.options.endpoint {
            endpoint.ensure_ready()?;
            let listener = ConnectorListener::bind(endpoint)?;
            self.bound_addr = listener.local_addr();
            let connection_handler: Arc<dyn crate::transport::ConnectionHandler> =
                handler.clone() as Arc<dyn crate::transport::ConnectionHandler>;
            self.listener =
                Some(listener.start(connection_handler, self.options.max_connections)?);
        }

        self.dispatcher = Some(dispatcher);
        self.handler = Some(handler);
        self.started.store(true, Ordering::SeqCst);

        let pending: Vec<(String, ClientConfig)> = self
            .pending_clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for (alias, config) in pending {
            self.clients.add_service(&alias, &config)?;
        }

        info!(
            target: CONNECTOR_TARGET,
            alias = self.options.alias,
            routes = self.routes.len(),
            clients = self.clients.len(),
            "connector started"
        );
        Ok(())
    }

    fn stop_inner(&mut self) {
        if let Some(listener) = self.listener.take()
            && let Err(cause) = listener.close()
        {
            warn!(
                target: CONNECTOR_TARGET,
                error = %cause,
                "listener shutdown reported an error"
            );
        }
        self.clients.clear();
        self.dispatcher = None;
        self.handler = None;
        self.bound_addr = None;
        self.started.store(false, Ordering::SeqCst);
        info!(
            target: CONNECTOR_TARGET,
            alias = self.options.alias,
            "connector stopped"
        );
    }
}

impl Service for Connector {
    fn name(&self) -> &str {
        "connector"
    }

    fn start(&mut self) -> Result<(), ServiceError> {
        self.start_inner()
            .map_err(|cause| ServiceError::startup("connector", cause.to_string()))
    }

    fn stop(&mut self) -> Result<(), ServiceError> {
        self.stop_inner();
        Ok(())
    }
}
