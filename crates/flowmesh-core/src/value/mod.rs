// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Dynamic value helpers.
//!
//! Step inputs and outputs are `serde_json::Value` throughout the runtime so
//! that a JSON-path extract of a number stays numeric for downstream
//! comparisons. This module adds the accessor utilities the resolver and
//! assertion evaluator share.

mod path;

pub use path::{extract_path, parse_path, PathSegment};

use serde_json::Value;

/// Dynamic type name of a value, as used by `type_is` matchers.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Null => "null",
    }
}

/// Truthiness used by `when` guards and conditional breakpoints.
///
/// Null and `false` are falsy; numbers are falsy at zero; strings and
/// collections are falsy when empty.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Renders a value for embedding inside a larger interpolated string.
///
/// Strings embed without quotes; everything else uses its JSON form.
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numeric view of a value, accepting integers and floats.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_names_cover_every_variant() {
        assert_eq!(type_name(&json!("x")), "string");
        assert_eq!(type_name(&json!(1)), "number");
        assert_eq!(type_name(&json!(true)), "boolean");
        assert_eq!(type_name(&json!([1])), "array");
        assert_eq!(type_name(&json!({"a": 1})), "object");
        assert_eq!(type_name(&Value::Null), "null");
    }

    #[test]
    fn truthiness() {
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("x")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!([])));
    }

    #[test]
    fn display_string_unquotes_strings() {
        assert_eq!(to_display_string(&json!("abc")), "abc");
        assert_eq!(to_display_string(&json!(42)), "42");
        assert_eq!(to_display_string(&json!({"a": 1})), r#"{"a":1}"#);
    }
}
