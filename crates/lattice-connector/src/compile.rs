//! Route compilation.
//!
//! Turns the user-supplied route map plus server defaults into dispatch-ready
//! routes: strict-object defaults applied, parent fragments folded in, custom
//! types resolved, and validators compiled. Compilation failures abort
//! connector startup, so a malformed schema can never silently accept calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use lattice_schema::{Validator, deep_merge, resolve, resolve_self, strict_object_default};

use crate::errors::ConnectorError;
use crate::route::{RouteHandler, RouteSpec, ServerDefaults, Stage};

/// A route ready for dispatch.
pub(crate) enum CompiledRoute {
    /// Bare handler; bypasses validation and pipeline wrapping.
    Bare(Arc<dyn RouteHandler>),
    /// Full pipeline.
    Pipeline {
        validator: Option<Validator>,
        before: Vec<Arc<dyn Stage>>,
        handler: Arc<dyn RouteHandler>,
        after: Vec<Arc<dyn Stage>>,
    },
}

/// Compiles every route against the server defaults.
///
/// # Errors
///
/// Returns [`ConnectorError::UnknownParent`] for dangling `inherits` aliases
/// and [`ConnectorError::Schema`] when a final validation schema does not
/// compile (including residual custom-type names from cyclic definitions).
pub(crate) fn compile_routes(
    routes: &BTreeMap<String, RouteSpec>,
    defaults: &ServerDefaults,
) -> Result<BTreeMap<String, CompiledRoute>, ConnectorError> {
    let resolved_types = resolve_self(&defaults.validation_types);

    let mut compiled = BTreeMap::new();
    for (name, spec) in routes {
        let route = match spec {
            RouteSpec::Bare(handler) => CompiledRoute::Bare(Arc::clone(handler)),
            RouteSpec::Configured(config) => {
                let mut validation = config
                    .validation
                    .as_ref()
                    .map(|user| deep_merge(&strict_object_default(), user));

                let mut before: Vec<Arc<dyn Stage>> = Vec::new();
                let mut after: Vec<Arc<dyn Stage>> = Vec::new();

                if !config.inherits.is_empty() {
                    let mut inherited_validation: Option<Value> = None;
                    for parent_alias in &config.inherits {
                        let parent = defaults.parents.get(parent_alias).ok_or_else(|| {
                            ConnectorError::UnknownParent {
                                route: name.clone(),
                                parent: parent_alias.clone(),
                            }
                        })?;
                        before.extend(parent.before.iter().cloned());
                        after.extend(parent.after.iter().cloned());
                        if let Some(fragment) = &parent.validation {
                            // Later parents override earlier ones.
                            inherited_validation = Some(match inherited_validation {
                                Some(accumulated) => deep_merge(&accumulated, fragment),
                                None => fragment.clone(),
                            });
                        }
                    }
                    if let Some(inherited) = inherited_validation {
                        // The route's explicit values win over inherited ones.
                        validation = Some(match validation {
                            Some(own) => deep_merge(&inherited, &own),
                            None => inherited,
                        });
                    }
                }

                before.extend(config.before.iter().cloned());
                after.extend(config.after.iter().cloned());

                let validator = match validation {
                    Some(mut schema) if !is_empty_schema(&schema) => {
                        resolve(&mut schema, &resolved_types);
                        let validator = Validator::compile(&schema).map_err(|source| {
                            ConnectorError::Schema {
                                route: name.clone(),
                                source,
                            }
                        })?;
                        Some(validator)
                    }
                    _ => None,
                };

                CompiledRoute::Pipeline {
                    validator,
                    before,
                    handler: Arc::clone(&config.handler),
                    after,
                }
            }
        };
        compiled.insert(name.clone(), route);
    }

    Ok(compiled)
}

fn is_empty_schema(schema: &Value) -> bool {
    match schema {
        Value::Object(map) => map.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::route::{ParentConfig, RouteConfig, stage_fn};

    fn noop_route() -> RouteConfig {
        RouteConfig::new(|data: &mut Value| Ok(data.take()))
    }

    fn pipeline_parts(route: &CompiledRoute) -> (usize, usize, bool) {
        match route {
            CompiledRoute::Bare(_) => panic!("expected pipeline route"),
            CompiledRoute::Pipeline {
                before,
                after,
                validator,
                ..
            } => (before.len(), after.len(), validator.is_some()),
        }
    }

    #[test]
    fn bare_handlers_stay_bare() {
        let mut routes = BTreeMap::new();
        routes.insert("echo".to_string(), RouteSpec::bare(|data: &mut Value| Ok(data.take())));

        let compiled = compile_routes(&routes, &ServerDefaults::new()).expect("compile");

        assert!(matches!(compiled.get("echo"), Some(CompiledRoute::Bare(_))));
    }

    #[test]
    fn validation_gains_strict_object_default() {
        let mut routes = BTreeMap::new();
        routes.insert(
            "t".to_string(),
            RouteConfig::new(|data: &mut Value| Ok(data.take()))
                .with_validation(json!({"required": ["name"], "properties": {"name": {"type": "string"}}}))
                .into(),
        );

        let compiled = compile_routes(&routes, &ServerDefaults::new()).expect("compile");
        let CompiledRoute::Pipeline { validator, .. } = compiled.get("t").expect("route") else {
            panic!("expected pipeline");
        };
        let validator = validator.as_ref().expect("validator");

        // Unknown keys rejected: the strict default survived the merge.
        assert!(validator.validate(&json!({"name": "x", "extra": 1})).is_err());
        assert!(validator.validate(&json!({"name": "x"})).is_ok());
    }

    #[test]
    fn inherits_prepends_parent_stages() {
        let defaults = ServerDefaults::new().parent(
            "audited",
            ParentConfig::new()
                .before(stage_fn(|_data: &mut Value| Ok(None)))
                .after(stage_fn(|_data: &mut Value| Ok(None))),
        );
        let mut routes = BTreeMap::new();
        routes.insert(
            "t".to_string(),
            noop_route()
                .before(stage_fn(|_data: &mut Value| Ok(None)))
                .inherits("audited")
                .into(),
        );

        let compiled = compile_routes(&routes, &defaults).expect("compile");
        let (before, after, _) = pipeline_parts(compiled.get("t").expect("route"));

        assert_eq!(before, 2, "parent stage prepended to the route's own");
        assert_eq!(after, 1);
    }

    #[test]
    fn inherited_validation_merges_under_route_validation() {
        let defaults = ServerDefaults::new().parent(
            "sized",
            ParentConfig::new().with_validation(json!({
                "properties": {"n": {"maximum": 10}, "tag": {"type": "string"}}
            })),
        );
        let mut routes = BTreeMap::new();
        routes.insert(
            "t".to_string(),
            noop_route()
                .with_validation(json!({"properties": {"n": {"type": "number", "maximum": 5}}}))
                .inherits("sized")
                .into(),
        );

        let compiled = compile_routes(&routes, &defaults).expect("compile");
        let CompiledRoute::Pipeline { validator, .. } = compiled.get("t").expect("route") else {
            panic!("expected pipeline");
        };
        let validator = validator.as_ref().expect("validator");

        // Route's maximum (5) wins over the parent's (10).
        assert!(validator.validate(&json!({"n": 7})).is_err());
        assert!(validator.validate(&json!({"n": 3})).is_ok());
        // Parent's extra property definition still applies.
        assert!(validator.validate(&json!({"n": 3, "tag": "ok"})).is_ok());
    }

    #[test]
    fn later_parents_override_earlier_ones() {
        let defaults = ServerDefaults::new()
            .parent(
                "first",
                ParentConfig::new().with_validation(json!({"properties": {"n": {"maximum": 5}}})),
            )
            .parent(
                "second",
                ParentConfig::new().with_validation(json!({"properties": {"n": {"maximum": 50}}})),
            );
        let mut routes = BTreeMap::new();
        routes.insert(
            "t".to_string(),
            noop_route()
                .with_validation(json!({"properties": {"n": {"type": "number"}}}))
                .inherits("first")
                .inherits("second")
                .into(),
        );

        let compiled = compile_routes(&routes, &defaults).expect("compile");
        let CompiledRoute::Pipeline { validator, .. } = compiled.get("t").expect("route") else {
            panic!("expected pipeline");
        };
        let validator = validator.as_ref().expect("validator");

        assert!(validator.validate(&json!({"n": 20})).is_ok());
        assert!(validator.validate(&json!({"n": 60})).is_err());
    }

    #[test]
    fn custom_types_expand_in_route_validation() {
        let defaults = ServerDefaults::new()
            .validation_type("message", json!({"type": "stringOrNull", "maxLength": 100}))
            .validation_type("stringOrNull", json!({"type": ["string", "null"]}));
        let mut routes = BTreeMap::new();
        routes.insert(
            "t".to_string(),
            noop_route()
                .with_validation(json!({"properties": {"m": {"type": "message"}}}))
                .into(),
        );

        let compiled = compile_routes(&routes, &defaults).expect("compile");
        let CompiledRoute::Pipeline { validator, .. } = compiled.get("t").expect("route") else {
            panic!("expected pipeline");
        };
        let validator = validator.as_ref().expect("validator");

        assert!(validator.validate(&json!({"m": "abc"})).is_ok());
        assert!(validator.validate(&json!({"m": null})).is_ok());
        assert!(validator.validate(&json!({"m": "x".repeat(101)})).is_err());
        assert!(validator.validate(&json!({"m": 5})).is_err());
    }

    #[test]
    fn cyclic_custom_types_fail_at_startup() {
        let defaults = ServerDefaults::new()
            .validation_type("a", json!({"type": "b"}))
            .validation_type("b", json!({"type": "a"}));
        let mut routes = BTreeMap::new();
        routes.insert(
            "t".to_string(),
            noop_route()
                .with_validation(json!({"properties": {"x": {"type": "a"}}}))
                .into(),
        );

        let result = compile_routes(&routes, &defaults);

        assert!(matches!(result, Err(ConnectorError::Schema { .. })));
    }

    #[test]
    fn unknown_parent_is_a_startup_failure() {
        let mut routes = BTreeMap::new();
        routes.insert("t".to_string(), noop_route().inherits("missing").into());

        let result = compile_routes(&routes, &ServerDefaults::new());

        assert!(matches!(
            result,
            Err(ConnectorError::UnknownParent { ref parent, .. }) if parent == "missing"
        ));
    }

    #[test]
    fn recompilation_is_behaviourally_idempotent() {
        let mut routes = BTreeMap::new();
        routes.insert(
            "t".to_string(),
            noop_route()
                .with_validation(json!({"required": ["name"]}))
                .into(),
        );

        let first = compile_routes(&routes, &ServerDefaults::new()).expect("first compile");
        let second = compile_routes(&routes, &ServerDefaults::new()).expect("second compile");

        for compiled in [&first, &second] {
            let CompiledRoute::Pipeline { validator, .. } = compiled.get("t").expect("route")
            else {
                panic!("expected pipeline");
            };
            let validator = validator.as_ref().expect("validator");
            assert!(validator.validate(&json!({})).is_err());
            assert!(validator.validate(&json!({"name": "x"})).is_ok());
        }
    }
}
