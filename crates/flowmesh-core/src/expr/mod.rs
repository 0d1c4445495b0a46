// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! `{{ … }}` template resolution.
//!
//! Any configuration string may embed expressions. A template that is a
//! single expression resolves to the native value of that expression; mixed
//! templates concatenate into a string. Resolution is eager and
//! left-to-right, and a template that fails to resolve fails the containing
//! step before anything is sent on the wire.

mod eval;
mod functions;
mod parser;

pub use eval::{evaluate, values_equal};
pub use functions::{Functions, NativeFn};
pub use parser::{parse, BinaryOp, Expr, UnaryOp};

use crate::error::{FlowError, Result};
use crate::scope::Scope;
use crate::value::to_display_string;
use serde_json::{Map, Value};

/// One `{{ … }}` region or a literal run of text.
enum Segment<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

fn split_segments(input: &str) -> Result<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    let mut rest = input;
    loop {
        match rest.find("{{") {
            None => {
                if let Some(pos) = rest.find("}}") {
                    return Err(FlowError::InvalidDefinition(format!(
                        "expression syntax error: unbalanced '}}}}' at offset {pos}"
                    )));
                }
                if !rest.is_empty() {
                    segments.push(Segment::Text(rest));
                }
                return Ok(segments);
            }
            Some(open) => {
                if open > 0 {
                    segments.push(Segment::Text(&rest[..open]));
                }
                let after_open = &rest[open + 2..];
                let close = after_open.find("}}").ok_or_else(|| {
                    FlowError::InvalidDefinition(
                        "expression syntax error: unbalanced '{{'".into(),
                    )
                })?;
                segments.push(Segment::Placeholder(after_open[..close].trim()));
                rest = &after_open[close + 2..];
            }
        }
    }
}

/// True when the string contains at least one placeholder.
pub fn has_placeholders(input: &str) -> bool {
    input.contains("{{")
}

/// Resolves a template string against a scope.
///
/// A template consisting of exactly one expression yields that expression's
/// native value; otherwise every placeholder is rendered into a string.
pub fn resolve_template(input: &str, scope: &Scope, funcs: &Functions) -> Result<Value> {
    let segments = split_segments(input)?;

    // Single-expression template keeps the native type.
    if let [Segment::Placeholder(expr)] = segments.as_slice() {
        return evaluate(&parse(expr)?, scope, funcs);
    }

    let mut out = String::with_capacity(input.len());
    for segment in &segments {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Placeholder(expr) => {
                let v = evaluate(&parse(expr)?, scope, funcs)?;
                out.push_str(&to_display_string(&v));
            }
        }
    }
    Ok(Value::String(out))
}

/// Recursively resolves every string inside a JSON value.
///
/// Object keys are left untouched; only values are interpolated.
pub fn resolve_value(input: &Value, scope: &Scope, funcs: &Functions) -> Result<Value> {
    match input {
        Value::String(s) => {
            if has_placeholders(s) || s.contains("}}") {
                resolve_template(s, scope, funcs)
            } else {
                Ok(input.clone())
            }
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_value(item, scope, funcs)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, scope, funcs)?);
            }
            Ok(Value::Object(out))
        }
        _ => Ok(input.clone()),
    }
}

/// Evaluates a guard expression (a bare expression, no braces) to a boolean.
pub fn evaluate_guard(expr: &str, scope: &Scope, funcs: &Functions) -> Result<bool> {
    let parsed = parse(expr)?;
    let v = evaluate(&parsed, scope, funcs)?;
    Ok(crate::value::is_truthy(&v))
}
