// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Fixed function registry for the expression language.
//!
//! The registry is closed by default and extended only at process start;
//! expressions can never reach arbitrary code.

use crate::error::{FlowError, Result};
use crate::value;
use rand::Rng;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Signature of a registered native function.
pub type NativeFn = fn(&[Value]) -> Result<Value>;

/// Registry of callable functions.
pub struct Functions {
    table: HashMap<&'static str, NativeFn>,
}

impl Functions {
    /// Builds the standard registry: `len`, `int`, `str`, `json`, `now`,
    /// `uuid`, `random`, `faker`, `hash.sha256`.
    pub fn standard() -> Self {
        let mut table: HashMap<&'static str, NativeFn> = HashMap::new();
        table.insert("len", fn_len);
        table.insert("int", fn_int);
        table.insert("str", fn_str);
        table.insert("json", fn_json);
        table.insert("now", fn_now);
        table.insert("uuid", fn_uuid);
        table.insert("random", fn_random);
        table.insert("faker", fn_faker);
        table.insert("hash.sha256", fn_sha256);
        Self { table }
    }

    /// Invokes a function by (possibly dotted) name.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        match self.table.get(name) {
            Some(f) => f(args),
            None => Err(FlowError::UndefinedReference(format!(
                "unknown function '{name}'"
            ))),
        }
    }

    /// True when `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }
}

impl Default for Functions {
    fn default() -> Self {
        Self::standard()
    }
}

fn arity(name: &str, args: &[Value], expected: usize) -> Result<()> {
    if args.len() != expected {
        return Err(FlowError::TypeError(format!(
            "{name}() takes {expected} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

fn fn_len(args: &[Value]) -> Result<Value> {
    arity("len", args, 1)?;
    let n = match &args[0] {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => {
            return Err(FlowError::TypeError(format!(
                "len() expects string, array or object, got {}",
                value::type_name(other)
            )))
        }
    };
    Ok(Value::from(n as i64))
}

fn fn_int(args: &[Value]) -> Result<Value> {
    arity("int", args, 1)?;
    match &args[0] {
        Value::Number(n) => {
            let truncated = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| FlowError::TypeError("int() overflow".into()))?;
            Ok(Value::from(truncated))
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| FlowError::TypeError(format!("int() cannot parse '{s}'"))),
        Value::Bool(b) => Ok(Value::from(i64::from(*b))),
        other => Err(FlowError::TypeError(format!(
            "int() expects number, string or boolean, got {}",
            value::type_name(other)
        ))),
    }
}

fn fn_str(args: &[Value]) -> Result<Value> {
    arity("str", args, 1)?;
    Ok(Value::String(value::to_display_string(&args[0])))
}

fn fn_json(args: &[Value]) -> Result<Value> {
    arity("json", args, 1)?;
    match &args[0] {
        Value::String(s) => serde_json::from_str(s)
            .map_err(|e| FlowError::TypeError(format!("json() parse failed: {e}"))),
        other => Ok(other.clone()),
    }
}

fn fn_now(args: &[Value]) -> Result<Value> {
    arity("now", args, 0)?;
    let now = chrono::Utc::now();
    Ok(Value::String(
        now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    ))
}

fn fn_uuid(args: &[Value]) -> Result<Value> {
    arity("uuid", args, 0)?;
    Ok(Value::String(uuid::Uuid::new_v4().to_string()))
}

fn fn_random(args: &[Value]) -> Result<Value> {
    let mut rng = rand::thread_rng();
    match args {
        [] => {
            let f: f64 = rng.gen();
            Ok(serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null))
        }
        [lo, hi] => {
            let (lo, hi) = match (lo.as_i64(), hi.as_i64()) {
                (Some(lo), Some(hi)) if lo <= hi => (lo, hi),
                _ => {
                    return Err(FlowError::TypeError(
                        "random(lo, hi) expects two integers with lo <= hi".into(),
                    ))
                }
            };
            Ok(Value::from(rng.gen_range(lo..=hi)))
        }
        _ => Err(FlowError::TypeError(
            "random() takes zero or two arguments".into(),
        )),
    }
}

const FIRST_NAMES: &[&str] = &[
    "Alice", "Bruno", "Chen", "Dana", "Elena", "Farid", "Grace", "Hiro", "Iris", "Jonas",
];
const LAST_NAMES: &[&str] = &[
    "Almeida", "Berg", "Costa", "Dimitrov", "Eriksen", "Fischer", "Garcia", "Haddad", "Ivanov",
    "Jensen",
];
const WORDS: &[&str] = &[
    "amber", "breeze", "cedar", "delta", "ember", "flint", "grove", "harbor", "inlet", "juniper",
];

fn fn_faker(args: &[Value]) -> Result<Value> {
    arity("faker", args, 1)?;
    let spec = args[0]
        .as_str()
        .ok_or_else(|| FlowError::TypeError("faker() expects a string spec".into()))?;
    let mut rng = rand::thread_rng();
    let pick = |list: &[&str], rng: &mut rand::rngs::ThreadRng| -> String {
        list[rng.gen_range(0..list.len())].to_string()
    };
    let out = match spec {
        "first_name" => pick(FIRST_NAMES, &mut rng),
        "last_name" => pick(LAST_NAMES, &mut rng),
        "name" => format!("{} {}", pick(FIRST_NAMES, &mut rng), pick(LAST_NAMES, &mut rng)),
        "email" => format!(
            "{}.{}@example.test",
            pick(FIRST_NAMES, &mut rng).to_lowercase(),
            pick(LAST_NAMES, &mut rng).to_lowercase()
        ),
        "username" => format!(
            "{}{}",
            pick(WORDS, &mut rng),
            rng.gen_range(100..10_000)
        ),
        "word" => pick(WORDS, &mut rng),
        "uuid" => uuid::Uuid::new_v4().to_string(),
        "ipv4" => format!(
            "{}.{}.{}.{}",
            rng.gen_range(1..=254u8),
            rng.gen_range(0..=255u8),
            rng.gen_range(0..=255u8),
            rng.gen_range(1..=254u8)
        ),
        "number" => return Ok(Value::from(rng.gen_range(0..1_000_000i64))),
        other => {
            return Err(FlowError::TypeError(format!(
                "faker() does not know spec '{other}'"
            )))
        }
    };
    Ok(Value::String(out))
}

fn fn_sha256(args: &[Value]) -> Result<Value> {
    arity("hash.sha256", args, 1)?;
    let input = match &args[0] {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let digest = Sha256::digest(input.as_bytes());
    Ok(Value::String(hex::encode(digest)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn len_counts_chars_items_and_keys() {
        let funcs = Functions::standard();
        assert_eq!(funcs.call("len", &[json!("héllo")]).unwrap(), json!(5));
        assert_eq!(funcs.call("len", &[json!([1, 2, 3])]).unwrap(), json!(3));
        assert_eq!(funcs.call("len", &[json!({"a": 1})]).unwrap(), json!(1));
    }

    #[test]
    fn int_parses_and_truncates() {
        let funcs = Functions::standard();
        assert_eq!(funcs.call("int", &[json!("42")]).unwrap(), json!(42));
        assert_eq!(funcs.call("int", &[json!(3.9)]).unwrap(), json!(3));
        assert!(funcs.call("int", &[json!("abc")]).is_err());
    }

    #[test]
    fn sha256_matches_known_vector() {
        let funcs = Functions::standard();
        assert_eq!(
            funcs.call("hash.sha256", &[json!("abc")]).unwrap(),
            json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn json_parses_strings() {
        let funcs = Functions::standard();
        assert_eq!(
            funcs.call("json", &[json!("{\"a\":1}")]).unwrap(),
            json!({"a": 1})
        );
    }

    #[test]
    fn random_range_is_inclusive() {
        let funcs = Functions::standard();
        for _ in 0..50 {
            let v = funcs.call("random", &[json!(1), json!(3)]).unwrap();
            let n = v.as_i64().unwrap();
            assert!((1..=3).contains(&n));
        }
    }

    #[test]
    fn unknown_function_is_undefined_reference() {
        let funcs = Functions::standard();
        let err = funcs.call("exec", &[]).unwrap_err();
        assert!(matches!(err, FlowError::UndefinedReference(_)));
    }

    #[test]
    fn faker_specs() {
        let funcs = Functions::standard();
        let email = funcs.call("faker", &[json!("email")]).unwrap();
        assert!(email.as_str().unwrap().contains('@'));
        assert!(funcs.call("faker", &[json!("nope")]).is_err());
    }
}
