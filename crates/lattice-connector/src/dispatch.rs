//! The per-request dispatch pipeline.
//!
//! A dispatcher owns the compiled route table and runs every inbound call
//! through validate → before-chain → handler → after-chain, followed by
//! empty-response correction, error classification, and metrics recording.
//! Exactly one outcome is produced per dispatch, and metrics are recorded on
//! every path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};
use tracing::{debug, error, warn};

use lattice_metrics::{LatencyUnit, MetricsSink};

use crate::compile::CompiledRoute;
use crate::errors::RouteError;
use crate::metrics::record_handle;

const DISPATCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatch");

/// Hook invoked before any per-request work; errors fail the call like a
/// handler error.
pub type PayloadHook = Arc<dyn Fn() -> Result<(), RouteError> + Send + Sync>;

/// Behavioural options of the dispatch pipeline.
#[derive(Clone)]
pub struct DispatchOptions {
    /// Whether falsy-equivalent and literal `"Ok"` responses are replaced.
    pub empty_response_correction: bool,
    /// The replacement used by empty-response correction.
    pub empty_response_default: Value,
    /// Unit for latency observations.
    pub latency_unit: LatencyUnit,
    /// Optional hook awaited before each dispatch.
    pub payload_hook: Option<PayloadHook>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            empty_response_correction: true,
            empty_response_default: json!({"status": "OK"}),
            latency_unit: LatencyUnit::default(),
            payload_hook: None,
        }
    }
}

/// Dispatches inbound calls through compiled routes.
pub struct Dispatcher {
    routes: BTreeMap<String, CompiledRoute>,
    options: DispatchOptions,
    sink: Arc<dyn MetricsSink>,
}

impl Dispatcher {
    pub(crate) fn new(
        routes: BTreeMap<String, CompiledRoute>,
        options: DispatchOptions,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            routes,
            options,
            sink,
        }
    }

    /// Whether a route with the given name exists.
    #[must_use]
    pub fn has_route(&self, route: &str) -> bool {
        self.routes.contains_key(route)
    }

    /// Runs one call through the pipeline.
    ///
    /// # Errors
    ///
    /// Returns the wire-level error object produced by classification; the
    /// caller embeds it in the response envelope unchanged.
    pub fn dispatch(&self, route: &str, params: Value) -> Result<Value, Value> {
        let started = Instant::now();
        let outcome = self.run(route, params);
        let is_error = outcome.is_err();
        record_handle(
            self.sink.as_ref(),
            route,
            is_error,
            started.elapsed(),
            self.options.latency_unit,
        );
        outcome.map_err(|cause| self.classify(route, cause))
    }

    fn run(&self, route: &str, params: Value) -> Result<Value, RouteError> {
        let Some(compiled) = self.routes.get(route) else {
            return Err(RouteError::app(-32601, format!("Method '{route}' not found")));
        };

        if let Some(hook) = &self.options.payload_hook {
            hook()?;
        }

        let mut current = params;
        let response = match compiled {
            CompiledRoute::Bare(handler) => handler.call(&mut current)?,
            CompiledRoute::Pipeline {
                validator,
                before,
                handler,
                after,
            } => {
                if let Some(validator) = validator
                    && let Err(violations) = validator.validate(&current)
                {
                    return Err(RouteError::validation(&violations));
                }

                for stage in before {
                    if let Some(replacement) = stage.call(&mut current)? {
                        current = replacement;
                    }
                }
                // The handler's return always replaces the accumulator; this
                // is the one asymmetry against before/after stages.
                current = handler.call(&mut current)?;
                for stage in after {
                    if let Some(replacement) = stage.call(&mut current)? {
                        current = replacement;
                    }
                }
                current
            }
        };

        Ok(self.correct_empty(response))
    }

    fn correct_empty(&self, response: Value) -> Value {
        if !self.options.empty_response_correction {
            return response;
        }
        if is_falsy_equivalent(&response) || response == json!("Ok") {
            return self.options.empty_response_default.clone();
        }
        response
    }

    fn classify(&self, route: &str, cause: RouteError) -> Value {
        match &cause {
            RouteError::App { code, message } => {
                debug!(
                    target: DISPATCH_TARGET,
                    route,
                    code,
                    message,
                    "call failed with application error"
                );
            }
            RouteError::Refused => {
                error!(
                    target: DISPATCH_TARGET,
                    route,
                    "downstream refused connection during dispatch"
                );
            }
            RouteError::Bug(message) => {
                error!(
                    target: DISPATCH_TARGET,
                    route,
                    message,
                    "internal bug escaped a handler"
                );
            }
            RouteError::Other(value) => {
                warn!(
                    target: DISPATCH_TARGET,
                    route,
                    value = %value,
                    "unclassified handler error suppressed"
                );
            }
        }
        cause.to_wire()
    }
}

fn is_falsy_equivalent(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::Number(number) => number.as_f64() == Some(0.0),
        Value::String(text) => text.is_empty(),
        _ => false,
    }
}
