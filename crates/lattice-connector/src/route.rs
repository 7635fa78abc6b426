//! Route configuration model.
//!
//! A route maps a method name to a dispatch pipeline. The value supplied for
//! a route is either a bare handler (which bypasses validation and pipeline
//! wrapping entirely) or a structured [`RouteConfig`] carrying validation,
//! ordered `before`/`after` stages, and parent aliases to inherit pipeline
//! fragments from.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::errors::RouteError;

/// The primary handler of a route.
///
/// The handler receives the accumulated pipeline data and its return value
/// always replaces the accumulator, even when it is `Value::Null`. This is
/// the one asymmetry against [`Stage`], whose `None` means "pass through".
pub trait RouteHandler: Send + Sync {
    /// Processes the call data and produces the (pre-correction) response.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] to fail the call; the dispatcher classifies it.
    fn call(&self, data: &mut Value) -> Result<Value, RouteError>;
}

impl<F> RouteHandler for F
where
    F: Fn(&mut Value) -> Result<Value, RouteError> + Send + Sync,
{
    fn call(&self, data: &mut Value) -> Result<Value, RouteError> {
        self(data)
    }
}

/// A `before` or `after` pipeline stage.
///
/// Stages may mutate the accumulator in place and return `Ok(None)` to keep
/// it, or return `Ok(Some(v))` to replace it outright.
pub trait Stage: Send + Sync {
    /// Processes the accumulated call data.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] to fail the call; later stages do not run.
    fn call(&self, data: &mut Value) -> Result<Option<Value>, RouteError>;
}

impl<F> Stage for F
where
    F: Fn(&mut Value) -> Result<Option<Value>, RouteError> + Send + Sync,
{
    fn call(&self, data: &mut Value) -> Result<Option<Value>, RouteError> {
        self(data)
    }
}

/// Wraps a closure as a shareable route handler.
pub fn handler_fn<F>(handler: F) -> Arc<dyn RouteHandler>
where
    F: Fn(&mut Value) -> Result<Value, RouteError> + Send + Sync + 'static,
{
    Arc::new(handler)
}

/// Wraps a closure as a shareable pipeline stage.
pub fn stage_fn<F>(stage: F) -> Arc<dyn Stage>
where
    F: Fn(&mut Value) -> Result<Option<Value>, RouteError> + Send + Sync + 'static,
{
    Arc::new(stage)
}

/// The value registered for a route name.
#[derive(Clone)]
pub enum RouteSpec {
    /// A bare handler; bypasses validation and pipeline wrapping.
    Bare(Arc<dyn RouteHandler>),
    /// A structured route configuration.
    Configured(RouteConfig),
}

impl RouteSpec {
    /// Registers a bare handler.
    pub fn bare<F>(handler: F) -> Self
    where
        F: Fn(&mut Value) -> Result<Value, RouteError> + Send + Sync + 'static,
    {
        Self::Bare(handler_fn(handler))
    }
}

impl From<RouteConfig> for RouteSpec {
    fn from(config: RouteConfig) -> Self {
        Self::Configured(config)
    }
}

/// A structured route configuration.
#[derive(Clone)]
pub struct RouteConfig {
    /// The primary handler.
    pub handler: Arc<dyn RouteHandler>,
    /// Validation schema applied to the call parameters.
    pub validation: Option<Value>,
    /// Stages run before the handler, in order.
    pub before: Vec<Arc<dyn Stage>>,
    /// Stages run after the handler, in order.
    pub after: Vec<Arc<dyn Stage>>,
    /// Parent aliases (in `ServerDefaults::parents`) to inherit from.
    pub inherits: Vec<String>,
}

impl RouteConfig {
    /// Builds a configuration around the primary handler.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&mut Value) -> Result<Value, RouteError> + Send + Sync + 'static,
    {
        Self {
            handler: handler_fn(handler),
            validation: None,
            before: Vec::new(),
            after: Vec::new(),
            inherits: Vec::new(),
        }
    }

    /// Sets the validation schema.
    #[must_use]
    pub fn with_validation(mut self, validation: Value) -> Self {
        self.validation = Some(validation);
        self
    }

    /// Appends a `before` stage.
    #[must_use]
    pub fn before(mut self, stage: Arc<dyn Stage>) -> Self {
        self.before.push(stage);
        self
    }

    /// Appends an `after` stage.
    #[must_use]
    pub fn after(mut self, stage: Arc<dyn Stage>) -> Self {
        self.after.push(stage);
        self
    }

    /// Appends a parent alias to inherit from.
    #[must_use]
    pub fn inherits(mut self, parent: impl Into<String>) -> Self {
        self.inherits.push(parent.into());
        self
    }
}

/// A reusable pipeline fragment referenced by route `inherits` lists.
#[derive(Clone, Default)]
pub struct ParentConfig {
    /// Stages prepended to the route's `before` list.
    pub before: Vec<Arc<dyn Stage>>,
    /// Stages prepended to the route's `after` list.
    pub after: Vec<Arc<dyn Stage>>,
    /// Validation fragment merged under the route's own validation.
    pub validation: Option<Value>,
}

impl ParentConfig {
    /// Builds an empty fragment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a `before` stage.
    #[must_use]
    pub fn before(mut self, stage: Arc<dyn Stage>) -> Self {
        self.before.push(stage);
        self
    }

    /// Appends an `after` stage.
    #[must_use]
    pub fn after(mut self, stage: Arc<dyn Stage>) -> Self {
        self.after.push(stage);
        self
    }

    /// Sets the validation fragment.
    #[must_use]
    pub fn with_validation(mut self, validation: Value) -> Self {
        self.validation = Some(validation);
        self
    }
}

/// Server-wide defaults consumed during route compilation.
#[derive(Clone, Default)]
pub struct ServerDefaults {
    /// Named pipeline fragments routes can inherit.
    pub parents: BTreeMap<String, ParentConfig>,
    /// Custom validation type definitions. Must form a DAG; cycles stop
    /// resolving and surface as validator compile failures.
    pub validation_types: BTreeMap<String, Value>,
}

impl ServerDefaults {
    /// Builds empty defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a parent fragment.
    #[must_use]
    pub fn parent(mut self, alias: impl Into<String>, config: ParentConfig) -> Self {
        self.parents.insert(alias.into(), config);
        self
    }

    /// Registers a custom validation type.
    #[must_use]
    pub fn validation_type(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.validation_types.insert(name.into(), schema);
        self
    }
}
