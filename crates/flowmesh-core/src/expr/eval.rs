// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Expression evaluation against a scope.

use super::functions::Functions;
use super::parser::{BinaryOp, Expr, UnaryOp};
use crate::error::{FlowError, Result};
use crate::scope::Scope;
use crate::value;
use serde_json::Value;

/// Evaluates a parsed expression.
pub fn evaluate(expr: &Expr, scope: &Scope, funcs: &Functions) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => scope
            .lookup(name)
            .cloned()
            .ok_or_else(|| FlowError::UndefinedReference(name.clone())),
        Expr::Field(base, name) => {
            let base_value = evaluate(base, scope, funcs)?;
            match &base_value {
                Value::Object(map) => map.get(name).cloned().ok_or_else(|| {
                    FlowError::UndefinedReference(format!(
                        "{} has no field '{name}'",
                        describe(base)
                    ))
                }),
                Value::Null => Err(FlowError::UndefinedReference(format!(
                    "{} is null, cannot access '{name}'",
                    describe(base)
                ))),
                other => Err(FlowError::TypeError(format!(
                    "cannot access field '{name}' on {}",
                    value::type_name(other)
                ))),
            }
        }
        Expr::Index(base, index) => {
            let base_value = evaluate(base, scope, funcs)?;
            let index_value = evaluate(index, scope, funcs)?;
            match (&base_value, &index_value) {
                (Value::Array(items), Value::Number(n)) => {
                    let i = n.as_i64().and_then(|i| usize::try_from(i).ok()).ok_or_else(
                        || FlowError::TypeError(format!("invalid array index {n}")),
                    )?;
                    items.get(i).cloned().ok_or_else(|| {
                        FlowError::UndefinedReference(format!(
                            "index {i} out of bounds (len {})",
                            items.len()
                        ))
                    })
                }
                (Value::Object(map), Value::String(key)) => {
                    map.get(key).cloned().ok_or_else(|| {
                        FlowError::UndefinedReference(format!("no key '{key}'"))
                    })
                }
                (other, _) => Err(FlowError::TypeError(format!(
                    "cannot index into {}",
                    value::type_name(other)
                ))),
            }
        }
        Expr::Unary(op, operand) => {
            let v = evaluate(operand, scope, funcs)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!value::is_truthy(&v))),
                UnaryOp::Neg => match &v {
                    Value::Number(n) => {
                        if let Some(i) = n.as_i64() {
                            Ok(Value::from(-i))
                        } else {
                            let f = n.as_f64().unwrap_or(0.0);
                            Ok(serde_json::Number::from_f64(-f)
                                .map(Value::Number)
                                .unwrap_or(Value::Null))
                        }
                    }
                    other => Err(FlowError::TypeError(format!(
                        "cannot negate {}",
                        value::type_name(other)
                    ))),
                },
            }
        }
        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, scope, funcs),
        Expr::Call(name, args) => {
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(evaluate(arg, scope, funcs)?);
            }
            funcs.call(name, &evaluated)
        }
    }
}

fn eval_binary(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    scope: &Scope,
    funcs: &Functions,
) -> Result<Value> {
    // Short-circuit logical operators before evaluating the right side.
    match op {
        BinaryOp::And => {
            let l = evaluate(lhs, scope, funcs)?;
            if !value::is_truthy(&l) {
                return Ok(Value::Bool(false));
            }
            let r = evaluate(rhs, scope, funcs)?;
            return Ok(Value::Bool(value::is_truthy(&r)));
        }
        BinaryOp::Or => {
            let l = evaluate(lhs, scope, funcs)?;
            if value::is_truthy(&l) {
                return Ok(Value::Bool(true));
            }
            let r = evaluate(rhs, scope, funcs)?;
            return Ok(Value::Bool(value::is_truthy(&r)));
        }
        _ => {}
    }

    let l = evaluate(lhs, scope, funcs)?;
    let r = evaluate(rhs, scope, funcs)?;

    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(&l, &r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => compare(op, &l, &r),
        BinaryOp::Add => add(&l, &r),
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => arith(op, &l, &r),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

/// Equality with numeric normalization: `1 == 1.0`.
pub fn values_equal(l: &Value, r: &Value) -> bool {
    match (value::as_f64(l), value::as_f64(r)) {
        (Some(a), Some(b)) => a == b,
        _ => l == r,
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    let ordering = match (l, r) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => {
            let (a, b) = match (value::as_f64(l), value::as_f64(r)) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(FlowError::TypeError(format!(
                        "cannot compare {} with {}",
                        value::type_name(l),
                        value::type_name(r)
                    )))
                }
            };
            a.partial_cmp(&b).ok_or_else(|| {
                FlowError::TypeError("comparison with NaN".into())
            })?
        }
    };
    let ok = match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::Ge => ordering.is_ge(),
        _ => unreachable!(),
    };
    Ok(Value::Bool(ok))
}

fn add(l: &Value, r: &Value) -> Result<Value> {
    if let (Value::String(a), Value::String(b)) = (l, r) {
        return Ok(Value::String(format!("{a}{b}")));
    }
    arith(BinaryOp::Add, l, r)
}

fn arith(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    // Integer arithmetic stays integral when both operands are integers.
    if let (Some(a), Some(b)) = (l.as_i64(), r.as_i64()) {
        let out = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div => {
                if b == 0 {
                    return Err(FlowError::TypeError("division by zero".into()));
                }
                a.checked_div(b)
            }
            BinaryOp::Mod => {
                if b == 0 {
                    return Err(FlowError::TypeError("modulo by zero".into()));
                }
                a.checked_rem(b)
            }
            _ => unreachable!(),
        };
        return out
            .map(Value::from)
            .ok_or_else(|| FlowError::TypeError("integer overflow".into()));
    }

    let (a, b) = match (value::as_f64(l), value::as_f64(r)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(FlowError::TypeError(format!(
                "arithmetic requires numbers, got {} and {}",
                value::type_name(l),
                value::type_name(r)
            )))
        }
    };
    let out = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(FlowError::TypeError("division by zero".into()));
            }
            a / b
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Err(FlowError::TypeError("modulo by zero".into()));
            }
            a % b
        }
        _ => unreachable!(),
    };
    Ok(serde_json::Number::from_f64(out)
        .map(Value::Number)
        .unwrap_or(Value::Null))
}

fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.clone(),
        Expr::Field(base, name) => format!("{}.{name}", describe(base)),
        Expr::Index(base, _) => format!("{}[…]", describe(base)),
        _ => "expression".to_string(),
    }
}
