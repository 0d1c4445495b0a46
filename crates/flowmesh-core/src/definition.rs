// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Flow definition schema: the persisted document describing a test flow.
//!
//! Documents are accepted wrapped (`{flow: {...}}`) or unwrapped and
//! canonicalize to the unwrapped form. YAML and JSON are both supported.

use crate::assertion::Assertion;
use crate::error::{FlowError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::collections::HashSet;

/// Closed set of action kinds the core executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    HttpRequest,
    DatabaseQuery,
    KafkaPublish,
    KafkaConsume,
    GrpcCall,
    WebsocketConnect,
    WebsocketSend,
    WebsocketReceive,
    BrowserNavigate,
    BrowserClick,
    BrowserFill,
    BrowserWaitFor,
    BrowserScreenshot,
    Shell,
    Wait,
    Condition,
    Parallel,
    ForEach,
    SubFlow,
    MockConfigure,
}

impl ActionKind {
    /// Stable snake_case tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpRequest => "http_request",
            Self::DatabaseQuery => "database_query",
            Self::KafkaPublish => "kafka_publish",
            Self::KafkaConsume => "kafka_consume",
            Self::GrpcCall => "grpc_call",
            Self::WebsocketConnect => "websocket_connect",
            Self::WebsocketSend => "websocket_send",
            Self::WebsocketReceive => "websocket_receive",
            Self::BrowserNavigate => "browser_navigate",
            Self::BrowserClick => "browser_click",
            Self::BrowserFill => "browser_fill",
            Self::BrowserWaitFor => "browser_wait_for",
            Self::BrowserScreenshot => "browser_screenshot",
            Self::Shell => "shell",
            Self::Wait => "wait",
            Self::Condition => "condition",
            Self::Parallel => "parallel",
            Self::ForEach => "for_each",
            Self::SubFlow => "sub_flow",
            Self::MockConfigure => "mock_configure",
        }
    }

    /// Control-flow kinds are interpreted by the engine rather than
    /// dispatched to an action handler.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            Self::Wait | Self::Condition | Self::Parallel | Self::ForEach | Self::SubFlow
        )
    }

    /// Terminal protocol actions that count toward load-test throughput.
    pub fn is_http_like(&self) -> bool {
        matches!(self, Self::HttpRequest | Self::GrpcCall)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry policy attached to a flow or overridden per step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first included.
    pub max_attempts: u32,
    /// Base backoff between attempts.
    pub backoff_ms: u64,
    /// Multiplier applied per attempt; defaults to 2.0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
}

impl RetryPolicy {
    /// Backoff before the given retry (1-based attempt that just failed),
    /// capped at 60 s per attempt.
    pub fn backoff_for_attempt(&self, attempt: u32) -> std::time::Duration {
        const CAP_MS: u64 = 60_000;
        let multiplier = self.backoff_multiplier.unwrap_or(2.0);
        let exp = attempt.saturating_sub(1) as i32;
        let ms = (self.backoff_ms as f64 * multiplier.powi(exp)).min(CAP_MS as f64);
        std::time::Duration::from_millis(ms.max(0.0) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 1, backoff_ms: 0, backoff_multiplier: None }
    }
}

/// Millisecond duration parsed from `"30s"`, `"500ms"`, `"2m"`, `"1h"`, or a
/// bare number of milliseconds.
pub fn parse_duration_ms(input: &str) -> Result<u64> {
    let s = input.trim();
    let (digits, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => s.split_at(idx),
        None => (s, "ms"),
    };
    let n: f64 = digits.trim().parse().map_err(|_| {
        FlowError::InvalidDefinition(format!("invalid duration '{input}'"))
    })?;
    let factor = match unit.trim() {
        "ms" => 1.0,
        "s" => 1_000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        other => {
            return Err(FlowError::InvalidDefinition(format!(
                "unknown duration unit '{other}' in '{input}'"
            )))
        }
    };
    Ok((n * factor) as u64)
}

fn de_duration_opt<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let raw = Option::<Value>::deserialize(deserializer)?;
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_u64()),
        Some(Value::String(s)) => parse_duration_ms(&s)
            .map(Some)
            .map_err(|e| D::Error::custom(e.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "expected duration string or number, got {other}"
        ))),
    }
}

fn ser_duration_opt<S>(value: &Option<u64>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(ms) => serializer.serialize_u64(*ms),
        None => serializer.serialize_none(),
    }
}

/// One node of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Identifier, unique within the flow (nested steps included).
    pub id: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Action discriminator.
    pub action: ActionKind,
    /// Action-specific configuration; may embed `{{ … }}` templates.
    #[serde(default)]
    pub config: Value,
    /// Guard expression; falsy skips the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Step timeout override in milliseconds.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_duration_opt",
        serialize_with = "ser_duration_opt"
    )]
    pub timeout: Option<u64>,
    /// Retry override for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Local binding name → path into the step output.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub save: BTreeMap<String, String>,
    /// Declarative checks applied to the output.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<Assertion>,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// When true a failure does not short-circuit the flow.
    #[serde(default)]
    pub continue_on_error: bool,
}

/// `condition` step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionConfig {
    /// Guard expression selecting the branch.
    #[serde(rename = "if")]
    pub condition: String,
    /// Steps executed when the guard is truthy.
    pub then: Vec<Step>,
    /// Steps executed otherwise.
    #[serde(default, rename = "else")]
    pub otherwise: Vec<Step>,
}

/// `parallel` step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Children spawned as independent subtasks.
    pub steps: Vec<Step>,
    /// Cancel the siblings on the first failure.
    #[serde(default)]
    pub fail_fast: bool,
}

/// `for_each` step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForEachConfig {
    /// Expression or literal list to iterate.
    pub items: Value,
    /// Steps executed per element.
    pub steps: Vec<Step>,
}

/// `wait` step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitConfig {
    /// Delay before the step completes.
    #[serde(deserialize_with = "de_duration", serialize_with = "ser_duration")]
    pub duration: u64,
}

fn de_duration<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    de_duration_opt(deserializer)?
        .ok_or_else(|| serde::de::Error::custom("duration is required"))
}

fn ser_duration<S>(value: &u64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(*value)
}

/// `sub_flow` step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubFlowConfig {
    /// Referenced flow id.
    pub flow_id: uuid::Uuid,
    /// Inputs bound into the sub-flow's scope frame.
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

/// The persisted flow definition document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Required human name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Named environment the flow targets by default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Flow-level timeout in milliseconds.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_duration_opt",
        serialize_with = "ser_duration_opt"
    )]
    pub timeout: Option<u64>,
    /// Flow-level retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Default variable values, overridable per run.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
    /// Steps run before the body, outside pass/fail accounting.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup: Vec<Step>,
    /// The flow body. Required, non-empty.
    pub steps: Vec<Step>,
    /// Steps run unconditionally after the body.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teardown: Vec<Step>,
}

impl FlowDefinition {
    /// Parses a JSON document, accepting wrapped or unwrapped form.
    pub fn from_json(input: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(input)
            .map_err(|e| FlowError::InvalidDefinition(format!("invalid JSON: {e}")))?;
        Self::from_value(raw)
    }

    /// Parses a YAML document, accepting wrapped or unwrapped form.
    pub fn from_yaml(input: &str) -> Result<Self> {
        let raw: Value = serde_yaml::from_str(input)
            .map_err(|e| FlowError::InvalidDefinition(format!("invalid YAML: {e}")))?;
        Self::from_value(raw)
    }

    /// Canonicalizes a raw document value.
    ///
    /// A `{flow: {...}}` wrapper is unwrapped; both forms fold to the same
    /// definition.
    pub fn from_value(mut raw: Value) -> Result<Self> {
        if let Value::Object(ref mut map) = raw {
            if map.len() == 1 {
                if let Some(inner) = map.remove("flow") {
                    raw = inner;
                }
            }
        }
        serde_json::from_value(raw)
            .map_err(|e| FlowError::InvalidDefinition(e.to_string()))
    }

    /// Serializes to the canonical (unwrapped) JSON form.
    pub fn to_canonical_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| FlowError::InvalidDefinition(e.to_string()))
    }

    /// All steps in document order: setup, body, teardown, nested included.
    pub fn walk_steps(&self) -> Vec<Step> {
        let mut out = Vec::new();
        for list in [&self.setup, &self.steps, &self.teardown] {
            for step in list {
                collect_steps(step, &mut out);
            }
        }
        out
    }

    /// Validates the definition, returning every issue found.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.name.trim().is_empty() {
            issues.push("flow name must be non-empty".to_string());
        }
        if self.steps.is_empty() {
            issues.push("flow must define at least one step".to_string());
        }
        if let Some(retry) = &self.retry {
            if retry.max_attempts == 0 {
                issues.push("retry.max_attempts must be at least 1".to_string());
            }
        }

        let mut seen = HashSet::new();
        for step in self.walk_steps() {
            if step.id.trim().is_empty() {
                issues.push("step id must be non-empty".to_string());
                continue;
            }
            if !seen.insert(step.id.clone()) {
                issues.push(format!("duplicate step id '{}'", step.id));
            }
            validate_step_config(&step, &mut issues);
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    /// Validates and folds issues into a single error.
    pub fn ensure_valid(&self) -> Result<()> {
        self.validate()
            .map_err(|issues| FlowError::InvalidDefinition(issues.join("; ")))
    }
}

fn collect_steps(step: &Step, out: &mut Vec<Step>) {
    out.push(step.clone());
    match step.action {
        ActionKind::Condition => {
            if let Ok(cfg) = serde_json::from_value::<ConditionConfig>(step.config.clone()) {
                for child in cfg.then.iter().chain(cfg.otherwise.iter()) {
                    collect_steps(child, out);
                }
            }
        }
        ActionKind::Parallel => {
            if let Ok(cfg) = serde_json::from_value::<ParallelConfig>(step.config.clone()) {
                for child in &cfg.steps {
                    collect_steps(child, out);
                }
            }
        }
        ActionKind::ForEach => {
            if let Ok(cfg) = serde_json::from_value::<ForEachConfig>(step.config.clone()) {
                for child in &cfg.steps {
                    collect_steps(child, out);
                }
            }
        }
        _ => {}
    }
}

fn validate_step_config(step: &Step, issues: &mut Vec<String>) {
    let missing = |field: &str| format!("step '{}': config field '{}' is required", step.id, field);
    let config = step.config.as_object();

    let has = |field: &str| config.map(|m| m.contains_key(field)).unwrap_or(false);

    match step.action {
        ActionKind::HttpRequest => {
            if !has("url") {
                issues.push(missing("url"));
            }
            if !has("method") {
                issues.push(missing("method"));
            }
        }
        ActionKind::DatabaseQuery => {
            if !has("query") {
                issues.push(missing("query"));
            }
        }
        ActionKind::KafkaPublish => {
            if !has("topic") {
                issues.push(missing("topic"));
            }
        }
        ActionKind::KafkaConsume => {
            if !has("topic") {
                issues.push(missing("topic"));
            }
        }
        ActionKind::GrpcCall => {
            if !has("endpoint") {
                issues.push(missing("endpoint"));
            }
            if !has("method") {
                issues.push(missing("method"));
            }
        }
        ActionKind::WebsocketConnect => {
            if !has("url") {
                issues.push(missing("url"));
            }
        }
        ActionKind::WebsocketSend => {
            if !has("message") {
                issues.push(missing("message"));
            }
        }
        ActionKind::WebsocketReceive => {}
        ActionKind::BrowserNavigate => {
            if !has("url") {
                issues.push(missing("url"));
            }
        }
        ActionKind::BrowserClick | ActionKind::BrowserFill | ActionKind::BrowserWaitFor => {
            if !has("selector") {
                issues.push(missing("selector"));
            }
        }
        ActionKind::BrowserScreenshot => {}
        ActionKind::Shell => {
            if !has("command") {
                issues.push(missing("command"));
            }
        }
        ActionKind::Wait => {
            if serde_json::from_value::<WaitConfig>(step.config.clone()).is_err() {
                issues.push(missing("duration"));
            }
        }
        ActionKind::Condition => {
            if serde_json::from_value::<ConditionConfig>(step.config.clone()).is_err() {
                issues.push(format!(
                    "step '{}': condition config requires 'if' and 'then'",
                    step.id
                ));
            }
        }
        ActionKind::Parallel => {
            match serde_json::from_value::<ParallelConfig>(step.config.clone()) {
                Ok(cfg) if cfg.steps.is_empty() => {
                    issues.push(format!("step '{}': parallel block has no children", step.id));
                }
                Ok(_) => {}
                Err(_) => issues.push(missing("steps")),
            }
        }
        ActionKind::ForEach => {
            if serde_json::from_value::<ForEachConfig>(step.config.clone()).is_err() {
                issues.push(format!(
                    "step '{}': for_each config requires 'items' and 'steps'",
                    step.id
                ));
            }
        }
        ActionKind::SubFlow => {
            if serde_json::from_value::<SubFlowConfig>(step.config.clone()).is_err() {
                issues.push(missing("flow_id"));
            }
        }
        ActionKind::MockConfigure => {
            if !has("url") {
                issues.push(missing("url"));
            }
        }
    }

    if let Some(retry) = &step.retry {
        if retry.max_attempts == 0 {
            issues.push(format!("step '{}': retry.max_attempts must be at least 1", step.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_yaml() -> &'static str {
        r#"
name: ping
steps:
  - id: ping
    action: http_request
    config:
      method: GET
      url: https://example.test/ping
    assertions:
      - kind: status_code
        expected: 200
"#
    }

    #[test]
    fn parses_unwrapped_yaml() {
        let def = FlowDefinition::from_yaml(minimal_yaml()).unwrap();
        assert_eq!(def.name, "ping");
        assert_eq!(def.steps.len(), 1);
        assert_eq!(def.steps[0].action, ActionKind::HttpRequest);
        def.ensure_valid().unwrap();
    }

    #[test]
    fn wrapped_and_unwrapped_forms_canonicalize() {
        let unwrapped = json!({
            "name": "t",
            "steps": [{"id": "a", "action": "wait", "config": {"duration": "10ms"}}],
        });
        let wrapped = json!({ "flow": unwrapped.clone() });
        let a = FlowDefinition::from_value(unwrapped).unwrap();
        let b = FlowDefinition::from_value(wrapped).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_canonical_json().unwrap(), b.to_canonical_json().unwrap());
    }

    #[test]
    fn duration_strings_parse_to_millis() {
        assert_eq!(parse_duration_ms("30s").unwrap(), 30_000);
        assert_eq!(parse_duration_ms("500ms").unwrap(), 500);
        assert_eq!(parse_duration_ms("2m").unwrap(), 120_000);
        assert_eq!(parse_duration_ms("250").unwrap(), 250);
        assert!(parse_duration_ms("10 fortnights").is_err());
    }

    #[test]
    fn duplicate_nested_ids_are_rejected() {
        let def = FlowDefinition::from_value(json!({
            "name": "dup",
            "steps": [
                {"id": "a", "action": "wait", "config": {"duration": 1}},
                {"id": "p", "action": "parallel", "config": {"steps": [
                    {"id": "a", "action": "wait", "config": {"duration": 1}}
                ]}},
            ],
        }))
        .unwrap();
        let issues = def.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("duplicate step id 'a'")));
    }

    #[test]
    fn empty_flow_is_invalid() {
        let def = FlowDefinition::from_value(json!({"name": "x", "steps": []})).unwrap();
        assert!(def.validate().is_err());
    }

    #[test]
    fn http_step_requires_url_and_method() {
        let def = FlowDefinition::from_value(json!({
            "name": "x",
            "steps": [{"id": "a", "action": "http_request", "config": {}}],
        }))
        .unwrap();
        let issues = def.validate().unwrap_err();
        assert_eq!(issues.len(), 2);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryPolicy { max_attempts: 10, backoff_ms: 500, backoff_multiplier: Some(2.0) };
        assert_eq!(retry.backoff_for_attempt(1).as_millis(), 500);
        assert_eq!(retry.backoff_for_attempt(2).as_millis(), 1_000);
        assert_eq!(retry.backoff_for_attempt(3).as_millis(), 2_000);
        assert_eq!(retry.backoff_for_attempt(30).as_millis(), 60_000);
    }

    #[test]
    fn action_kind_tags_round_trip() {
        for kind in [
            ActionKind::HttpRequest,
            ActionKind::ForEach,
            ActionKind::BrowserWaitFor,
            ActionKind::MockConfigure,
        ] {
            let tag = serde_json::to_value(kind).unwrap();
            assert_eq!(tag, json!(kind.as_str()));
            let back: ActionKind = serde_json::from_value(tag).unwrap();
            assert_eq!(back, kind);
        }
    }
}
