// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Database query handler over sqlx's Any driver.
//!
//! Connection pools are cached per connection string and shared across
//! concurrent steps; `sqlx::any::install_default_drivers` must run once at
//! process start (the handler factory does this).

use async_trait::async_trait;
use dashmap::DashMap;
use flowmesh_core::{ActionKind, FlowError, Result, Scope};
use flowmesh_engine::{ActionHandler, ActionOutput, StepContext};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Column, Row};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// `database_query` config.
#[derive(Debug, Deserialize)]
struct DatabaseConfig {
    /// Connection string, e.g. `postgres://…` or `sqlite::memory:`.
    connection: String,
    query: String,
    /// Positional bind parameters.
    #[serde(default)]
    params: Vec<Value>,
    /// Pool size per connection string.
    #[serde(default = "default_max_connections")]
    max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Handler for `database_query`.
pub struct DatabaseHandler {
    pools: DashMap<String, AnyPool>,
    limiter: Arc<Semaphore>,
}

impl DatabaseHandler {
    pub fn new(limiter: Arc<Semaphore>) -> Self {
        Self { pools: DashMap::new(), limiter }
    }

    async fn pool_for(&self, cfg: &DatabaseConfig) -> Result<AnyPool> {
        if let Some(pool) = self.pools.get(&cfg.connection) {
            return Ok(pool.value().clone());
        }
        let pool = AnyPoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect(&cfg.connection)
            .await
            .map_err(|e| FlowError::handler_retryable(format!("database connect: {e}")))?;
        self.pools.insert(cfg.connection.clone(), pool.clone());
        Ok(pool)
    }
}

#[async_trait]
impl ActionHandler for DatabaseHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::DatabaseQuery
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        config: Value,
        _scope: &Scope,
    ) -> Result<ActionOutput> {
        let cfg: DatabaseConfig = serde_json::from_value(config)
            .map_err(|e| FlowError::InvalidDefinition(format!("database_query config: {e}")))?;

        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| FlowError::Capacity("database limiter closed".into()))?;

        let pool = self.pool_for(&cfg).await?;
        let mut query = sqlx::query(&cfg.query);
        for param in &cfg.params {
            query = match param {
                Value::Null => query.bind(None::<String>),
                Value::Bool(b) => query.bind(*b),
                Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap_or(0)),
                Value::Number(n) => query.bind(n.as_f64().unwrap_or(0.0)),
                Value::String(s) => query.bind(s.clone()),
                compound => query.bind(compound.to_string()),
            };
        }

        debug!(query = %cfg.query, "executing database query");
        let fetch = query.fetch_all(&pool);
        let rows = tokio::select! {
            _ = ctx.execution.cancellation().cancelled() => {
                return Err(FlowError::Cancelled(
                    ctx.execution.cancel_reason().unwrap_or(flowmesh_core::CancelReason::UserCancelled),
                ));
            }
            result = fetch => result.map_err(|e| FlowError::handler(format!("query failed: {e}")))?,
        };

        let mut out_rows = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut object = Map::new();
            for (index, column) in row.columns().iter().enumerate() {
                object.insert(column.name().to_string(), column_value(row, index));
            }
            out_rows.push(Value::Object(object));
        }

        Ok(ActionOutput::value(json!({
            "rows": out_rows,
            "row_count": rows.len(),
        })))
    }
}

/// Best-effort typed extraction from an Any-driver row.
fn column_value(row: &sqlx::any::AnyRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<i64, _>(index) {
        return Value::from(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(index) {
        return serde_json::Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<bool, _>(index) {
        return Value::Bool(v);
    }
    if let Ok(v) = row.try_get::<String, _>(index) {
        return Value::String(v);
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmesh_engine::ExecutionContext;
    use std::time::Duration;
    use uuid::Uuid;

    fn step_ctx() -> StepContext {
        StepContext {
            execution: ExecutionContext::new(Uuid::new_v4()),
            step_id: "db".into(),
            timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn query_returns_typed_rows() {
        sqlx::any::install_default_drivers();
        let handler = DatabaseHandler::new(Arc::new(Semaphore::new(100)));
        let config = json!({
            "connection": "sqlite::memory:",
            "query": "SELECT 1 AS n, 'x' AS s",
        });
        let out = handler
            .execute(&step_ctx(), config, &Scope::new())
            .await
            .unwrap();
        assert_eq!(out.output["row_count"], 1);
        assert_eq!(out.output["rows"][0]["n"], 1);
        assert_eq!(out.output["rows"][0]["s"], "x");
    }

    #[tokio::test]
    async fn bad_query_is_handler_error() {
        sqlx::any::install_default_drivers();
        let handler = DatabaseHandler::new(Arc::new(Semaphore::new(100)));
        let config = json!({
            "connection": "sqlite::memory:",
            "query": "SELECT FROM nothing",
        });
        let err = handler
            .execute(&step_ctx(), config, &Scope::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Handler { .. }));
    }
}
