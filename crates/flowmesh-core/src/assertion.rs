// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Declarative assertions evaluated against captured step outputs.
//!
//! Outputs follow the handler convention `{ status?, headers?, body?,
//! body_raw? }`; matchers that talk about "the body" fall back to the whole
//! output when no `body` field is present, so database and shell outputs
//! assert the same way HTTP responses do.

use crate::error::FlowError;
use crate::expr::{self, Functions};
use crate::scope::Scope;
use crate::value::{self, extract_path};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Closed set of assertion kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionKind {
    StatusCode,
    JsonPath,
    Header,
    BodyContains,
    BodyRegex,
    DurationLte,
    SchemaMatch,
    Size,
    TypeIs,
    Exists,
    NotExists,
    Gt,
    Gte,
    Lt,
    Lte,
    CustomExpression,
}

impl AssertionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusCode => "status_code",
            Self::JsonPath => "json_path",
            Self::Header => "header",
            Self::BodyContains => "body_contains",
            Self::BodyRegex => "body_regex",
            Self::DurationLte => "duration_lte",
            Self::SchemaMatch => "schema_match",
            Self::Size => "size",
            Self::TypeIs => "type_is",
            Self::Exists => "exists",
            Self::NotExists => "not_exists",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::CustomExpression => "custom_expression",
        }
    }
}

/// Comparator applied to a `json_path` extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PathMatcher {
    #[default]
    Equals,
    Contains,
    Exists,
    NotExists,
    MatchesRegex,
    TypeIs,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// One declarative check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    /// Discriminator.
    pub kind: AssertionKind,
    /// Path, header name, or expression, depending on the kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Expected value where the kind takes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    /// Comparator for `json_path` assertions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matcher: Option<PathMatcher>,
    /// Case-insensitive value comparison for `header`.
    #[serde(default)]
    pub ignore_case: bool,
}

/// Outcome of evaluating one assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionResult {
    /// The assertion kind tag.
    pub kind: String,
    /// Whether the assertion held.
    pub ok: bool,
    /// Observed value, when one could be extracted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    /// Expected value, when the kind takes one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    /// Human-readable explanation.
    pub message: String,
}

impl AssertionResult {
    fn pass(kind: AssertionKind, actual: Option<Value>, expected: Option<Value>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            ok: true,
            actual,
            expected,
            message: "ok".to_string(),
        }
    }

    fn fail(
        kind: AssertionKind,
        actual: Option<Value>,
        expected: Option<Value>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            ok: false,
            actual,
            expected,
            message: message.into(),
        }
    }
}

/// Evaluation inputs for one step's assertion list.
pub struct AssertionContext<'a> {
    /// Captured step output.
    pub output: &'a Value,
    /// Step wall time in milliseconds.
    pub duration_ms: u64,
    /// Scope for `custom_expression` assertions.
    pub scope: &'a Scope,
    /// Function registry for `custom_expression` assertions.
    pub funcs: &'a Functions,
}

/// Evaluates every assertion, never short-circuiting.
pub fn evaluate_assertions(
    assertions: &[Assertion],
    ctx: &AssertionContext<'_>,
) -> Vec<AssertionResult> {
    assertions.iter().map(|a| evaluate_one(a, ctx)).collect()
}

/// The body view of an output: its `body` field when present, else the
/// output itself.
fn body_of(output: &Value) -> &Value {
    output.get("body").unwrap_or(output)
}

/// Raw body text: `body_raw` when the handler captured one, else the JSON
/// rendering of the body.
fn body_text(output: &Value) -> String {
    match output.get("body_raw").and_then(Value::as_str) {
        Some(raw) => raw.to_string(),
        None => match body_of(output) {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

fn extract_target(output: &Value, target: Option<&str>) -> Result<Option<Value>, FlowError> {
    match target {
        Some(path) => extract_path(body_of(output), path),
        None => Ok(Some(body_of(output).clone())),
    }
}

/// Evaluates a single assertion.
pub fn evaluate_one(assertion: &Assertion, ctx: &AssertionContext<'_>) -> AssertionResult {
    let kind = assertion.kind;
    match kind {
        AssertionKind::StatusCode => {
            let actual = ctx.output.get("status").cloned();
            let Some(actual) = actual else {
                return AssertionResult::fail(
                    kind,
                    None,
                    assertion.expected.clone(),
                    "output has no status code",
                );
            };
            let expected = assertion.expected.clone().unwrap_or(Value::Null);
            let ok = match &expected {
                Value::Array(options) => options.iter().any(|o| expr::values_equal(o, &actual)),
                single => expr::values_equal(single, &actual),
            };
            if ok {
                AssertionResult::pass(kind, Some(actual), Some(expected))
            } else {
                AssertionResult::fail(
                    kind,
                    Some(actual.clone()),
                    Some(expected.clone()),
                    format!("status {actual} does not match {expected}"),
                )
            }
        }
        AssertionKind::JsonPath => evaluate_json_path(assertion, ctx),
        AssertionKind::Header => {
            let name = assertion.target.as_deref().unwrap_or_default();
            let headers = ctx.output.get("headers").and_then(Value::as_object);
            let actual = headers.and_then(|map| {
                map.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v.clone())
            });
            let Some(actual) = actual else {
                return AssertionResult::fail(
                    kind,
                    None,
                    assertion.expected.clone(),
                    format!("header '{name}' is absent"),
                );
            };
            let Some(expected) = assertion.expected.clone() else {
                // No expected value: presence is enough.
                return AssertionResult::pass(kind, Some(actual), None);
            };
            let ok = match (&actual, &expected) {
                (Value::String(a), Value::String(e)) if assertion.ignore_case => {
                    a.eq_ignore_ascii_case(e)
                }
                (a, e) => expr::values_equal(a, e),
            };
            if ok {
                AssertionResult::pass(kind, Some(actual), Some(expected))
            } else {
                AssertionResult::fail(
                    kind,
                    Some(actual),
                    Some(expected),
                    format!("header '{name}' value mismatch"),
                )
            }
        }
        AssertionKind::BodyContains => {
            let needle = assertion
                .expected
                .as_ref()
                .map(value::to_display_string)
                .unwrap_or_default();
            let haystack = body_text(ctx.output);
            if haystack.contains(&needle) {
                AssertionResult::pass(kind, None, assertion.expected.clone())
            } else {
                AssertionResult::fail(
                    kind,
                    None,
                    assertion.expected.clone(),
                    format!("body does not contain '{needle}'"),
                )
            }
        }
        AssertionKind::BodyRegex => {
            let pattern = assertion
                .expected
                .as_ref()
                .and_then(Value::as_str)
                .unwrap_or_default();
            match regex::Regex::new(pattern) {
                Ok(re) => {
                    let haystack = body_text(ctx.output);
                    if re.is_match(&haystack) {
                        AssertionResult::pass(kind, None, assertion.expected.clone())
                    } else {
                        AssertionResult::fail(
                            kind,
                            None,
                            assertion.expected.clone(),
                            format!("body does not match /{pattern}/"),
                        )
                    }
                }
                Err(e) => AssertionResult::fail(
                    kind,
                    None,
                    assertion.expected.clone(),
                    format!("invalid regex: {e}"),
                ),
            }
        }
        AssertionKind::DurationLte => {
            let budget = assertion.expected.as_ref().and_then(Value::as_u64).unwrap_or(0);
            if ctx.duration_ms <= budget {
                AssertionResult::pass(kind, Some(json!(ctx.duration_ms)), Some(json!(budget)))
            } else {
                AssertionResult::fail(
                    kind,
                    Some(json!(ctx.duration_ms)),
                    Some(json!(budget)),
                    format!("step took {} ms, budget {budget} ms", ctx.duration_ms),
                )
            }
        }
        AssertionKind::SchemaMatch => {
            let Some(schema) = assertion.expected.clone() else {
                return AssertionResult::fail(kind, None, None, "schema_match requires a schema");
            };
            let compiled = match jsonschema::JSONSchema::compile(&schema) {
                Ok(c) => c,
                Err(e) => {
                    let message = format!("invalid schema: {e}");
                    return AssertionResult::fail(kind, None, Some(schema), message);
                }
            };
            let body = body_of(ctx.output);
            let errors: Vec<String> = match compiled.validate(body) {
                Ok(()) => Vec::new(),
                Err(iter) => iter.map(|e| e.to_string()).take(5).collect(),
            };
            if errors.is_empty() {
                AssertionResult::pass(kind, None, Some(schema))
            } else {
                AssertionResult::fail(kind, Some(body.clone()), Some(schema), errors.join("; "))
            }
        }
        AssertionKind::Size => {
            let actual = body_text(ctx.output).len() as u64;
            let expected = assertion.expected.as_ref().and_then(Value::as_u64).unwrap_or(0);
            if actual == expected {
                AssertionResult::pass(kind, Some(json!(actual)), Some(json!(expected)))
            } else {
                AssertionResult::fail(
                    kind,
                    Some(json!(actual)),
                    Some(json!(expected)),
                    format!("body is {actual} octets, expected {expected}"),
                )
            }
        }
        AssertionKind::TypeIs => match extract_target(ctx.output, assertion.target.as_deref()) {
            Ok(Some(v)) => {
                let actual = value::type_name(&v);
                let expected = assertion
                    .expected
                    .as_ref()
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if actual == expected {
                    AssertionResult::pass(kind, Some(json!(actual)), Some(json!(expected)))
                } else {
                    AssertionResult::fail(
                        kind,
                        Some(json!(actual)),
                        Some(json!(expected)),
                        format!("value is {actual}, expected {expected}"),
                    )
                }
            }
            Ok(None) => AssertionResult::fail(
                kind,
                None,
                assertion.expected.clone(),
                "target value is missing",
            ),
            Err(e) => AssertionResult::fail(kind, None, assertion.expected.clone(), e.to_string()),
        },
        AssertionKind::Exists | AssertionKind::NotExists => {
            let found = match extract_target(ctx.output, assertion.target.as_deref()) {
                Ok(Some(Value::Null)) | Ok(None) => false,
                Ok(Some(_)) => true,
                Err(_) => false,
            };
            let want = kind == AssertionKind::Exists;
            if found == want {
                AssertionResult::pass(kind, Some(json!(found)), None)
            } else {
                AssertionResult::fail(
                    kind,
                    Some(json!(found)),
                    None,
                    format!(
                        "path '{}' {}",
                        assertion.target.as_deref().unwrap_or("$"),
                        if want { "is missing" } else { "unexpectedly exists" }
                    ),
                )
            }
        }
        AssertionKind::Gt | AssertionKind::Gte | AssertionKind::Lt | AssertionKind::Lte => {
            let extracted = match extract_target(ctx.output, assertion.target.as_deref()) {
                Ok(Some(v)) => v,
                Ok(None) => {
                    return AssertionResult::fail(
                        kind,
                        None,
                        assertion.expected.clone(),
                        "target value is missing",
                    )
                }
                Err(e) => {
                    return AssertionResult::fail(
                        kind,
                        None,
                        assertion.expected.clone(),
                        e.to_string(),
                    )
                }
            };
            numeric_compare(kind, &extracted, assertion.expected.as_ref())
        }
        AssertionKind::CustomExpression => {
            let Some(expr_src) = assertion.target.as_deref() else {
                return AssertionResult::fail(
                    kind,
                    None,
                    None,
                    "custom_expression requires the expression in 'target'",
                );
            };
            match expr::evaluate_guard(expr_src, ctx.scope, ctx.funcs) {
                Ok(true) => AssertionResult::pass(kind, Some(json!(true)), None),
                Ok(false) => AssertionResult::fail(
                    kind,
                    Some(json!(false)),
                    None,
                    format!("expression '{expr_src}' is falsy"),
                ),
                Err(e) => AssertionResult::fail(kind, None, None, e.to_string()),
            }
        }
    }
}

fn evaluate_json_path(assertion: &Assertion, ctx: &AssertionContext<'_>) -> AssertionResult {
    let kind = assertion.kind;
    let path = assertion.target.as_deref().unwrap_or("$");
    let matcher = assertion.matcher.unwrap_or_default();

    let extracted = match extract_path(body_of(ctx.output), path) {
        Ok(v) => v,
        Err(e) => {
            return AssertionResult::fail(kind, None, assertion.expected.clone(), e.to_string())
        }
    };

    match matcher {
        PathMatcher::Exists | PathMatcher::NotExists => {
            let found = matches!(extracted, Some(ref v) if !v.is_null());
            let want = matcher == PathMatcher::Exists;
            if found == want {
                AssertionResult::pass(kind, Some(json!(found)), None)
            } else {
                AssertionResult::fail(
                    kind,
                    Some(json!(found)),
                    None,
                    format!("path '{path}' existence mismatch"),
                )
            }
        }
        _ => {
            let Some(actual) = extracted else {
                return AssertionResult::fail(
                    kind,
                    None,
                    assertion.expected.clone(),
                    format!("path '{path}' is missing"),
                );
            };
            // A null value satisfies only the existence and type matchers;
            // `type_is` is the one way to assert nullness.
            if actual.is_null() && matcher != PathMatcher::TypeIs {
                return AssertionResult::fail(
                    kind,
                    Some(Value::Null),
                    assertion.expected.clone(),
                    format!("path '{path}' is null"),
                );
            }
            match matcher {
                PathMatcher::Equals => {
                    let expected = assertion.expected.clone().unwrap_or(Value::Null);
                    if expr::values_equal(&actual, &expected) {
                        AssertionResult::pass(kind, Some(actual), Some(expected))
                    } else {
                        AssertionResult::fail(
                            kind,
                            Some(actual),
                            Some(expected),
                            format!("path '{path}' value mismatch"),
                        )
                    }
                }
                PathMatcher::Contains => {
                    let needle = assertion
                        .expected
                        .as_ref()
                        .map(value::to_display_string)
                        .unwrap_or_default();
                    let ok = match &actual {
                        Value::String(s) => s.contains(&needle),
                        Value::Array(items) => items.iter().any(|i| {
                            expr::values_equal(i, assertion.expected.as_ref().unwrap_or(&Value::Null))
                        }),
                        _ => false,
                    };
                    if ok {
                        AssertionResult::pass(kind, Some(actual), assertion.expected.clone())
                    } else {
                        AssertionResult::fail(
                            kind,
                            Some(actual),
                            assertion.expected.clone(),
                            format!("path '{path}' does not contain expected value"),
                        )
                    }
                }
                PathMatcher::MatchesRegex => {
                    let pattern = assertion
                        .expected
                        .as_ref()
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    match regex::Regex::new(pattern) {
                        Ok(re) => {
                            let text = value::to_display_string(&actual);
                            if re.is_match(&text) {
                                AssertionResult::pass(kind, Some(actual), assertion.expected.clone())
                            } else {
                                AssertionResult::fail(
                                    kind,
                                    Some(actual),
                                    assertion.expected.clone(),
                                    format!("path '{path}' does not match /{pattern}/"),
                                )
                            }
                        }
                        Err(e) => AssertionResult::fail(
                            kind,
                            Some(actual),
                            assertion.expected.clone(),
                            format!("invalid regex: {e}"),
                        ),
                    }
                }
                PathMatcher::TypeIs => {
                    let actual_type = value::type_name(&actual);
                    let expected = assertion
                        .expected
                        .as_ref()
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if actual_type == expected {
                        AssertionResult::pass(kind, Some(json!(actual_type)), Some(json!(expected)))
                    } else {
                        AssertionResult::fail(
                            kind,
                            Some(json!(actual_type)),
                            Some(json!(expected)),
                            format!("path '{path}' is {actual_type}, expected {expected}"),
                        )
                    }
                }
                PathMatcher::Gt | PathMatcher::Gte | PathMatcher::Lt | PathMatcher::Lte => {
                    let cmp_kind = match matcher {
                        PathMatcher::Gt => AssertionKind::Gt,
                        PathMatcher::Gte => AssertionKind::Gte,
                        PathMatcher::Lt => AssertionKind::Lt,
                        _ => AssertionKind::Lte,
                    };
                    let mut result = numeric_compare(cmp_kind, &actual, assertion.expected.as_ref());
                    result.kind = kind.as_str().to_string();
                    result
                }
                PathMatcher::Exists | PathMatcher::NotExists => unreachable!("handled above"),
            }
        }
    }
}

fn numeric_compare(kind: AssertionKind, actual: &Value, expected: Option<&Value>) -> AssertionResult {
    let (Some(a), Some(e)) = (
        value::as_f64(actual),
        expected.and_then(value::as_f64),
    ) else {
        return AssertionResult::fail(
            kind,
            Some(actual.clone()),
            expected.cloned(),
            "numeric comparison requires numbers on both sides",
        );
    };
    let ok = match kind {
        AssertionKind::Gt => a > e,
        AssertionKind::Gte => a >= e,
        AssertionKind::Lt => a < e,
        AssertionKind::Lte => a <= e,
        _ => false,
    };
    if ok {
        AssertionResult::pass(kind, Some(actual.clone()), expected.cloned())
    } else {
        AssertionResult::fail(
            kind,
            Some(actual.clone()),
            expected.cloned(),
            format!("{a} {} {e} does not hold", kind.as_str()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_for<'a>(
        output: &'a Value,
        scope: &'a Scope,
        funcs: &'a Functions,
    ) -> AssertionContext<'a> {
        AssertionContext { output, duration_ms: 120, scope, funcs }
    }

    fn http_output() -> Value {
        json!({
            "status": 200,
            "headers": {"Content-Type": "application/json", "X-Request-Id": "r-1"},
            "body": {"ok": true, "items": [1, 2, 3], "user": {"id": 7, "name": "dana"}},
            "body_raw": "{\"ok\":true,\"items\":[1,2,3],\"user\":{\"id\":7,\"name\":\"dana\"}}",
        })
    }

    #[test]
    fn status_code_accepts_int_or_list() {
        let output = http_output();
        let scope = Scope::new();
        let funcs = Functions::standard();
        let ctx = ctx_for(&output, &scope, &funcs);

        let single = Assertion {
            kind: AssertionKind::StatusCode,
            target: None,
            expected: Some(json!(200)),
            matcher: None,
            ignore_case: false,
        };
        assert!(evaluate_one(&single, &ctx).ok);

        let list = Assertion { expected: Some(json!([200, 201])), ..single.clone() };
        assert!(evaluate_one(&list, &ctx).ok);

        let wrong = Assertion { expected: Some(json!(404)), ..single };
        let result = evaluate_one(&wrong, &ctx);
        assert!(!result.ok);
        assert_eq!(result.actual, Some(json!(200)));
    }

    #[test]
    fn json_path_equals_preserves_numbers() {
        let output = http_output();
        let scope = Scope::new();
        let funcs = Functions::standard();
        let ctx = ctx_for(&output, &scope, &funcs);
        let assertion = Assertion {
            kind: AssertionKind::JsonPath,
            target: Some("$.user.id".into()),
            expected: Some(json!(7)),
            matcher: None,
            ignore_case: false,
        };
        assert!(evaluate_one(&assertion, &ctx).ok);
    }

    #[test]
    fn json_path_numeric_comparators() {
        let output = http_output();
        let scope = Scope::new();
        let funcs = Functions::standard();
        let ctx = ctx_for(&output, &scope, &funcs);
        let assertion = Assertion {
            kind: AssertionKind::JsonPath,
            target: Some("$.user.id".into()),
            expected: Some(json!(5)),
            matcher: Some(PathMatcher::Gt),
            ignore_case: false,
        };
        let result = evaluate_one(&assertion, &ctx);
        assert!(result.ok);
        assert_eq!(result.kind, "json_path");
    }

    #[test]
    fn null_path_fails_every_value_matcher() {
        let output = json!({"body": {"middle_name": null}});
        let scope = Scope::new();
        let funcs = Functions::standard();
        let ctx = ctx_for(&output, &scope, &funcs);

        // Even an expected null does not satisfy equals.
        let equals = Assertion {
            kind: AssertionKind::JsonPath,
            target: Some("$.middle_name".into()),
            expected: Some(Value::Null),
            matcher: None,
            ignore_case: false,
        };
        let result = evaluate_one(&equals, &ctx);
        assert!(!result.ok);
        assert!(result.message.contains("null"));

        // A permissive regex must not match a rendered null either.
        let regex = Assertion {
            kind: AssertionKind::JsonPath,
            target: Some("$.middle_name".into()),
            expected: Some(json!(".*")),
            matcher: Some(PathMatcher::MatchesRegex),
            ignore_case: false,
        };
        assert!(!evaluate_one(&regex, &ctx).ok);

        // type_is is the one matcher that asserts nullness.
        let type_is = Assertion {
            kind: AssertionKind::JsonPath,
            target: Some("$.middle_name".into()),
            expected: Some(json!("null")),
            matcher: Some(PathMatcher::TypeIs),
            ignore_case: false,
        };
        assert!(evaluate_one(&type_is, &ctx).ok);
    }

    #[test]
    fn missing_path_with_equals_is_typed_failure() {
        let output = http_output();
        let scope = Scope::new();
        let funcs = Functions::standard();
        let ctx = ctx_for(&output, &scope, &funcs);
        let assertion = Assertion {
            kind: AssertionKind::JsonPath,
            target: Some("$.user.email".into()),
            expected: Some(json!("x@y")),
            matcher: None,
            ignore_case: false,
        };
        let result = evaluate_one(&assertion, &ctx);
        assert!(!result.ok);
        assert!(result.message.contains("missing"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let output = http_output();
        let scope = Scope::new();
        let funcs = Functions::standard();
        let ctx = ctx_for(&output, &scope, &funcs);
        let assertion = Assertion {
            kind: AssertionKind::Header,
            target: Some("content-type".into()),
            expected: Some(json!("application/json")),
            matcher: None,
            ignore_case: false,
        };
        assert!(evaluate_one(&assertion, &ctx).ok);
    }

    #[test]
    fn body_contains_and_regex() {
        let output = http_output();
        let scope = Scope::new();
        let funcs = Functions::standard();
        let ctx = ctx_for(&output, &scope, &funcs);
        let contains = Assertion {
            kind: AssertionKind::BodyContains,
            target: None,
            expected: Some(json!("\"ok\":true")),
            matcher: None,
            ignore_case: false,
        };
        assert!(evaluate_one(&contains, &ctx).ok);

        let re = Assertion {
            kind: AssertionKind::BodyRegex,
            target: None,
            expected: Some(json!(r#""id":\d+"#)),
            matcher: None,
            ignore_case: false,
        };
        assert!(evaluate_one(&re, &ctx).ok);
    }

    #[test]
    fn duration_lte_uses_step_wall_time() {
        let output = http_output();
        let scope = Scope::new();
        let funcs = Functions::standard();
        let ctx = ctx_for(&output, &scope, &funcs);
        let within = Assertion {
            kind: AssertionKind::DurationLte,
            target: None,
            expected: Some(json!(500)),
            matcher: None,
            ignore_case: false,
        };
        assert!(evaluate_one(&within, &ctx).ok);
        let over = Assertion { expected: Some(json!(50)), ..within };
        assert!(!evaluate_one(&over, &ctx).ok);
    }

    #[test]
    fn schema_match_validates_body() {
        let output = http_output();
        let scope = Scope::new();
        let funcs = Functions::standard();
        let ctx = ctx_for(&output, &scope, &funcs);
        let assertion = Assertion {
            kind: AssertionKind::SchemaMatch,
            target: None,
            expected: Some(json!({
                "type": "object",
                "required": ["ok", "user"],
                "properties": {
                    "ok": {"type": "boolean"},
                    "user": {"type": "object", "required": ["id"]},
                },
            })),
            matcher: None,
            ignore_case: false,
        };
        assert!(evaluate_one(&assertion, &ctx).ok);

        let stricter = Assertion {
            expected: Some(json!({"type": "object", "required": ["nope"]})),
            ..assertion
        };
        assert!(!evaluate_one(&stricter, &ctx).ok);
    }

    #[test]
    fn exists_and_not_exists() {
        let output = http_output();
        let scope = Scope::new();
        let funcs = Functions::standard();
        let ctx = ctx_for(&output, &scope, &funcs);
        let exists = Assertion {
            kind: AssertionKind::Exists,
            target: Some("$.user.name".into()),
            expected: None,
            matcher: None,
            ignore_case: false,
        };
        assert!(evaluate_one(&exists, &ctx).ok);
        let not_exists = Assertion {
            kind: AssertionKind::NotExists,
            target: Some("$.user.password".into()),
            expected: None,
            matcher: None,
            ignore_case: false,
        };
        assert!(evaluate_one(&not_exists, &ctx).ok);
    }

    #[test]
    fn custom_expression_consults_scope() {
        let output = http_output();
        let mut scope = Scope::new();
        scope.set_root("vars", json!({"threshold": 2}));
        scope.bind_step("s1", json!({"output": {"count": 3}}));
        let funcs = Functions::standard();
        let ctx = ctx_for(&output, &scope, &funcs);
        let assertion = Assertion {
            kind: AssertionKind::CustomExpression,
            target: Some("steps.s1.output.count > vars.threshold".into()),
            expected: None,
            matcher: None,
            ignore_case: false,
        };
        assert!(evaluate_one(&assertion, &ctx).ok);
    }
}
