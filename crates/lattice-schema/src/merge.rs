//! Deep merging of schema fragments.

use serde_json::{Value, json};

/// The default applied under every explicit route validation.
///
/// Guarantees strict parameter objects unless the route overrides these keys.
#[must_use]
pub fn strict_object_default() -> Value {
    json!({"type": "object", "additionalProperties": false})
}

/// Recursively merges `patch` over `base`; patch values win on conflict.
///
/// Objects merge key-by-key, everything else (including arrays) is replaced
/// whole. Both layering directions in route compilation are expressed with
/// this one function by choosing which fragment plays the patch role.
#[must_use]
pub fn deep_merge(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            let mut merged = base_map.clone();
            for (key, patch_value) in patch_map {
                let entry = match base_map.get(key) {
                    Some(base_value) => deep_merge(base_value, patch_value),
                    None => patch_value.clone(),
                };
                merged.insert(key.clone(), entry);
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}
