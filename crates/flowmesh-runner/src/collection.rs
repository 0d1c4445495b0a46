// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Data-driven collection runner.
//!
//! Iterates a dataset (CSV, JSON lines, inline rows, or a bare count)
//! over an ordered flow chain. Each row maps columns onto runtime
//! variables via `variable_mapping`; iterations run sequentially or with
//! bounded parallelism, and live progress publishes as `log` events.

use flowmesh_core::model::{EventType, Execution, ExecutionStatus, RunEvent, TriggerSource};
use flowmesh_core::{FlowError, Result};
use flowmesh_engine::FlowInterpreter;
use flowmesh_state::FlowStore;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::info;
use uuid::Uuid;

/// Where iteration rows come from.
#[derive(Debug, Clone)]
pub enum DataSource {
    /// Literal rows.
    Inline(Vec<Map<String, Value>>),
    /// CSV text with a header row.
    Csv(String),
    /// One JSON object per line.
    JsonLines(String),
    /// N iterations with no row data.
    Count(usize),
}

impl DataSource {
    /// Materializes the rows.
    pub fn rows(&self) -> Result<Vec<Map<String, Value>>> {
        match self {
            Self::Inline(rows) => Ok(rows.clone()),
            Self::Count(n) => Ok(vec![Map::new(); *n]),
            Self::JsonLines(text) => {
                let mut rows = Vec::new();
                for (lineno, line) in text.lines().enumerate() {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let value: Value = serde_json::from_str(trimmed).map_err(|e| {
                        FlowError::InvalidDefinition(format!(
                            "data source line {}: {e}",
                            lineno + 1
                        ))
                    })?;
                    match value {
                        Value::Object(map) => rows.push(map),
                        other => {
                            return Err(FlowError::InvalidDefinition(format!(
                                "data source line {} must be an object, got {}",
                                lineno + 1,
                                flowmesh_core::value::type_name(&other)
                            )))
                        }
                    }
                }
                Ok(rows)
            }
            Self::Csv(text) => {
                let mut reader = csv::Reader::from_reader(text.as_bytes());
                let headers = reader
                    .headers()
                    .map_err(|e| FlowError::InvalidDefinition(format!("csv headers: {e}")))?
                    .clone();
                let mut rows = Vec::new();
                for record in reader.records() {
                    let record = record
                        .map_err(|e| FlowError::InvalidDefinition(format!("csv row: {e}")))?;
                    let mut row = Map::new();
                    for (header, field) in headers.iter().zip(record.iter()) {
                        // Numbers and booleans keep their native types.
                        let value = if let Ok(n) = field.parse::<i64>() {
                            Value::from(n)
                        } else if let Ok(f) = field.parse::<f64>() {
                            serde_json::Number::from_f64(f)
                                .map(Value::Number)
                                .unwrap_or_else(|| Value::String(field.to_string()))
                        } else if let Ok(b) = field.parse::<bool>() {
                            Value::Bool(b)
                        } else {
                            Value::String(field.to_string())
                        };
                        row.insert(header.to_string(), value);
                    }
                    rows.push(row);
                }
                Ok(rows)
            }
        }
    }
}

/// Collection run configuration.
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    pub workspace_id: Uuid,
    /// Ordered flow chain run once per iteration.
    pub flow_ids: Vec<Uuid>,
    pub data: DataSource,
    /// Dataset column → runtime variable name.
    pub variable_mapping: BTreeMap<String, String>,
    /// Concurrent iterations; 1 means sequential.
    pub parallel: usize,
    /// Abort remaining iterations after the first failure.
    pub stop_on_error: bool,
    pub environment: Option<String>,
}

/// Result of one iteration.
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub index: usize,
    pub execution_ids: Vec<Uuid>,
    pub status: ExecutionStatus,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Aggregated collection outcome.
#[derive(Debug, Clone)]
pub struct CollectionOutcome {
    pub collection_id: Uuid,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<IterationResult>,
}

/// Drives data-driven executions.
#[derive(Clone)]
pub struct CollectionRunner {
    interpreter: FlowInterpreter,
    flows: Arc<dyn FlowStore>,
}

impl CollectionRunner {
    pub fn new(interpreter: FlowInterpreter, flows: Arc<dyn FlowStore>) -> Self {
        Self { interpreter, flows }
    }

    /// Runs the collection to completion.
    pub async fn run(&self, config: CollectionConfig) -> Result<CollectionOutcome> {
        let collection_id = Uuid::new_v4();
        let rows = config.data.rows()?;
        let total = rows.len();
        info!(collection_id = %collection_id, iterations = total, "collection run starting");

        // Definitions are snapshotted once, before any iteration runs.
        let mut definitions = Vec::with_capacity(config.flow_ids.len());
        for flow_id in &config.flow_ids {
            let flow = self
                .flows
                .get(config.workspace_id, *flow_id)
                .await?
                .ok_or_else(|| FlowError::NotFound(format!("flow {flow_id}")))?;
            definitions.push((*flow_id, flow.definition));
        }
        let definitions = Arc::new(definitions);

        let parallel = config.parallel.max(1);
        let limiter = Arc::new(Semaphore::new(parallel));
        let mut join_set = JoinSet::new();
        let mut results: Vec<Option<IterationResult>> = (0..total).map(|_| None).collect();
        let mut stop = false;

        let mut spawned = 0usize;
        for (index, row) in rows.into_iter().enumerate() {
            if stop {
                break;
            }
            let permit = limiter
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| FlowError::Capacity("collection limiter closed".into()))?;
            let runner = self.clone();
            let cfg = config.clone();
            let defs = definitions.clone();
            join_set.spawn(async move {
                let _permit = permit;
                runner.run_iteration(collection_id, index, row, &cfg, &defs).await
            });
            spawned += 1;

            // With stop_on_error, drain completions eagerly so a failure
            // halts scheduling of later rows.
            if config.stop_on_error {
                while let Some(done) = join_set.try_join_next() {
                    if let Ok(result) = done {
                        if result.status != ExecutionStatus::Completed {
                            stop = true;
                        }
                        let index = result.index;
                        results[index] = Some(result);
                    }
                }
            }
        }
        while let Some(done) = join_set.join_next().await {
            if let Ok(result) = done {
                if config.stop_on_error && result.status != ExecutionStatus::Completed {
                    stop = true;
                }
                let index = result.index;
                results[index] = Some(result);
            }
        }
        let _ = spawned;

        let results: Vec<IterationResult> = results.into_iter().flatten().collect();
        let passed = results
            .iter()
            .filter(|r| r.status == ExecutionStatus::Completed)
            .count();
        let failed = results.len() - passed;
        info!(
            collection_id = %collection_id,
            passed = passed,
            failed = failed,
            "collection run finished"
        );
        Ok(CollectionOutcome { collection_id, total, passed, failed, results })
    }

    async fn run_iteration(
        &self,
        collection_id: Uuid,
        index: usize,
        row: Map<String, Value>,
        config: &CollectionConfig,
        definitions: &[(Uuid, flowmesh_core::FlowDefinition)],
    ) -> IterationResult {
        // Map dataset columns onto runtime variables.
        let mut variables = Map::new();
        for (column, variable) in &config.variable_mapping {
            if let Some(value) = row.get(column) {
                variables.insert(variable.clone(), value.clone());
            }
        }
        // Unmapped columns pass through under their own names.
        for (column, value) in &row {
            if !config.variable_mapping.contains_key(column) {
                variables.entry(column.clone()).or_insert_with(|| value.clone());
            }
        }

        let started = std::time::Instant::now();
        let mut execution_ids = Vec::new();
        let mut status = ExecutionStatus::Completed;
        let mut error = None;

        // The flow chain runs sequentially within one iteration.
        for (flow_id, definition) in definitions {
            let execution = Execution::new(
                *flow_id,
                config.workspace_id,
                definition.clone(),
                TriggerSource::Collection(collection_id),
            )
            .with_environment(config.environment.clone())
            .with_variables(variables.clone());
            execution_ids.push(execution.id);

            match self.interpreter.run(execution, Map::new()).await {
                Ok(finished) if finished.status == ExecutionStatus::Completed => {}
                Ok(finished) => {
                    status = finished.status;
                    error = finished.error.map(|e| e.message);
                    break;
                }
                Err(e) => {
                    status = ExecutionStatus::Failed;
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        // Live progress for observers.
        self.interpreter.hub().publish(RunEvent::new(
            EventType::Log,
            collection_id,
            json!({
                "collection_id": collection_id,
                "iteration": index,
                "status": status,
            }),
        ));

        IterationResult {
            index,
            execution_ids,
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
        }
    }
}
