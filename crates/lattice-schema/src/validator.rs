//! Schema compilation and parameter validation.
//!
//! [`Validator::compile`] turns a resolved schema object into an internal
//! node tree, rejecting anything it cannot enforce (in particular residual
//! custom-type names left behind by cyclic definitions, which makes malformed
//! server defaults a startup failure rather than a silent accept-all).
//! [`Validator::validate`] walks a parameter value against that tree and
//! collects human-readable error descriptions naming the offending fields.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Standard JSON type names the validator can enforce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeKind {
    Object,
    Array,
    String,
    Number,
    Integer,
    Boolean,
    Null,
}

impl TypeKind {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "object" => Some(Self::Object),
            "array" => Some(Self::Array),
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            "null" => Some(Self::Null),
            _ => None,
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|number| number.fract() == 0.0)
            }
            Self::Boolean => value.is_boolean(),
            Self::Null => value.is_null(),
        }
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Null => "null",
        };
        formatter.write_str(name)
    }
}

#[derive(Debug, Clone, Default)]
struct Node {
    types: Option<Vec<TypeKind>>,
    required: Vec<String>,
    properties: BTreeMap<String, Node>,
    additional_properties: Option<bool>,
    items: Option<Box<Node>>,
    one_of: Vec<Node>,
    any_of: Vec<Node>,
    all_of: Vec<Node>,
    enum_values: Option<Vec<Value>>,
    max_length: Option<u64>,
    min_length: Option<u64>,
    minimum: Option<f64>,
    maximum: Option<f64>,
}

/// A compiled validation predicate.
#[derive(Debug, Clone)]
pub struct Validator {
    root: Node,
}

/// Errors describing why a parameter value was rejected.
pub type ValidationErrors = Vec<String>;

impl Validator {
    /// Compiles a resolved schema object.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] when the schema references an unknown type
    /// name or a keyword holds a value of the wrong shape.
    pub fn compile(schema: &Value) -> Result<Self, SchemaError> {
        let root = compile_node(schema, "")?;
        Ok(Self { root })
    }

    /// Validates a parameter value against the compiled schema.
    ///
    /// # Errors
    ///
    /// Returns the list of violation descriptions; empty input schemas accept
    /// every value.
    pub fn validate(&self, value: &Value) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();
        check_node(&self.root, value, "", &mut errors);
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Errors raised while compiling a schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The `type` keyword referenced a name with no standard meaning.
    ///
    /// This is how residual custom-type names (left behind by cyclic
    /// definitions) surface at startup.
    #[error("unknown type '{name}' at '{path}'")]
    UnknownType { name: String, path: String },
    /// A keyword held a value of the wrong JSON shape.
    #[error("malformed schema at '{path}': {message}")]
    Malformed { path: String, message: String },
}

fn join_path(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{path}.{segment}")
    }
}

fn compile_node(schema: &Value, path: &str) -> Result<Node, SchemaError> {
    let Value::Object(map) = schema else {
        return Err(SchemaError::Malformed {
            path: path.to_string(),
            message: "schema fragment must be an object".to_string(),
        });
    };

    let mut node = Node::default();

    if let Some(type_value) = map.get("type") {
        let names: Vec<&str> = match type_value {
            Value::String(name) => vec![name.as_str()],
            Value::Array(list) => list
                .iter()
                .map(|entry| {
                    entry.as_str().ok_or_else(|| SchemaError::Malformed {
                        path: path.to_string(),
                        message: "'type' entries must be strings".to_string(),
                    })
                })
                .collect::<Result<_, _>>()?,
            _ => {
                return Err(SchemaError::Malformed {
                    path: path.to_string(),
                    message: "'type' must be a string or array of strings".to_string(),
                });
            }
        };
        let mut kinds = Vec::with_capacity(names.len());
        for name in names {
            let kind = TypeKind::parse(name).ok_or_else(|| SchemaError::UnknownType {
                name: name.to_string(),
                path: path.to_string(),
            })?;
            kinds.push(kind);
        }
        node.types = Some(kinds);
    }

    if let Some(required) = map.get("required") {
        let Value::Array(entries) = required else {
            return Err(SchemaError::Malformed {
                path: path.to_string(),
                message: "'required' must be an array".to_string(),
            });
        };
        for entry in entries {
            let name = entry.as_str().ok_or_else(|| SchemaError::Malformed {
                path: path.to_string(),
                message: "'required' entries must be strings".to_string(),
            })?;
            node.required.push(name.to_string());
        }
    }

    if let Some(properties) = map.get("properties") {
        let Value::Object(entries) = properties else {
            return Err(SchemaError::Malformed {
                path: path.to_string(),
                message: "'properties' must be an object".to_string(),
            });
        };
        for (name, property) in entries {
            let child = compile_node(property, &join_path(path, name))?;
            node.properties.insert(name.clone(), child);
        }
    }

    if let Some(additional) = map.get("additionalProperties") {
        let Value::Bool(allowed) = additional else {
            return Err(SchemaError::Malformed {
                path: path.to_string(),
                message: "'additionalProperties' must be a boolean".to_string(),
            });
        };
        node.additional_properties = Some(*allowed);
    }

    if let Some(items) = map.get("items") {
        let child = compile_node(items, &join_path(path, "[]"))?;
        node.items = Some(Box::new(child));
    }

    for (keyword, bucket) in [("oneOf", 0_usize), ("anyOf", 1), ("allOf", 2)] {
        let Some(alternatives) = map.get(keyword) else {
            continue;
        };
        let Value::Array(entries) = alternatives else {
            return Err(SchemaError::Malformed {
                path: path.to_string(),
                message: format!("'{keyword}' must be an array"),
            });
        };
        let mut compiled = Vec::with_capacity(entries.len());
        for entry in entries {
            compiled.push(compile_node(entry, path)?);
        }
        match bucket {
            0 => node.one_of = compiled,
            1 => node.any_of = compiled,
            _ => node.all_of = compiled,
        }
    }

    if let Some(enum_values) = map.get("enum") {
        let Value::Array(entries) = enum_values else {
            return Err(SchemaError::Malformed {
                path: path.to_string(),
                message: "'enum' must be an array".to_string(),
            });
        };
        node.enum_values = Some(entries.clone());
    }

    node.max_length = read_unsigned(map.get("maxLength"), "maxLength", path)?;
    node.min_length = read_unsigned(map.get("minLength"), "minLength", path)?;
    node.minimum = read_number(map.get("minimum"), "minimum", path)?;
    node.maximum = read_number(map.get("maximum"), "maximum", path)?;

    Ok(node)
}

fn read_unsigned(
    value: Option<&Value>,
    keyword: &str,
    path: &str,
) -> Result<Option<u64>, SchemaError> {
    match value {
        None => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| SchemaError::Malformed {
            path: path.to_string(),
            message: format!("'{keyword}' must be a non-negative integer"),
        }),
    }
}

fn read_number(
    value: Option<&Value>,
    keyword: &str,
    path: &str,
) -> Result<Option<f64>, SchemaError> {
    match value {
        None => Ok(None),
        Some(value) => value.as_f64().map(Some).ok_or_else(|| SchemaError::Malformed {
            path: path.to_string(),
            message: format!("'{keyword}' must be a number"),
        }),
    }
}

fn describe(path: &str) -> String {
    if path.is_empty() {
        "params".to_string()
    } else {
        path.to_string()
    }
}

fn check_node(node: &Node, value: &Value, path: &str, errors: &mut Vec<String>) {
    if let Some(types) = &node.types
        && !types.iter().any(|kind| kind.matches(value))
    {
        let expected: Vec<String> = types.iter().map(TypeKind::to_string).collect();
        errors.push(format!(
            "{} must be of type {}",
            describe(path),
            expected.join(" or ")
        ));
        // Further keyword checks assume the type matched.
        return;
    }

    if let Some(enum_values) = &node.enum_values
        && !enum_values.contains(value)
    {
        errors.push(format!("{} is not one of the allowed values", describe(path)));
    }

    if let Value::Object(map) = value {
        for required in &node.required {
            if !map.contains_key(required) {
                errors.push(format!("{} is required", describe(&join_path(path, required))));
            }
        }
        for (name, property) in map {
            match node.properties.get(name) {
                Some(child) => check_node(child, property, &join_path(path, name), errors),
                None => {
                    if node.additional_properties == Some(false) {
                        errors.push(format!(
                            "{} is not an allowed property",
                            describe(&join_path(path, name))
                        ));
                    }
                }
            }
        }
    }

    if let (Value::Array(entries), Some(items)) = (value, &node.items) {
        for (index, entry) in entries.iter().enumerate() {
            check_node(items, entry, &join_path(path, &index.to_string()), errors);
        }
    }

    if let Value::String(text) = value {
        let length = text.chars().count() as u64;
        if let Some(max_length) = node.max_length
            && length > max_length
        {
            errors.push(format!(
                "{} must be at most {max_length} characters",
                describe(path)
            ));
        }
        if let Some(min_length) = node.min_length
            && length < min_length
        {
            errors.push(format!(
                "{} must be at least {min_length} characters",
                describe(path)
            ));
        }
    }

    if let Some(number) = value.as_f64() {
        if let Some(minimum) = node.minimum
            && number < minimum
        {
            errors.push(format!("{} must be at least {minimum}", describe(path)));
        }
        if let Some(maximum) = node.maximum
            && number > maximum
        {
            errors.push(format!("{} must be at most {maximum}", describe(path)));
        }
    }

    if !node.all_of.is_empty() {
        for alternative in &node.all_of {
            check_node(alternative, value, path, errors);
        }
    }

    if !node.any_of.is_empty() {
        let matched = node
            .any_of
            .iter()
            .any(|alternative| passes(alternative, value, path));
        if !matched {
            errors.push(format!(
                "{} does not match any allowed variant",
                describe(path)
            ));
        }
    }

    if !node.one_of.is_empty() {
        let matches = node
            .one_of
            .iter()
            .filter(|alternative| passes(alternative, value, path))
            .count();
        if matches != 1 {
            errors.push(format!(
                "{} must match exactly one variant, matched {matches}",
                describe(path)
            ));
        }
    }
}

fn passes(node: &Node, value: &Value, path: &str) -> bool {
    let mut probe = Vec::new();
    check_node(node, value, path, &mut probe);
    probe.is_empty()
}
