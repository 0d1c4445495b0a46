// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! Shell action handler.
//!
//! Runs a command under `sh -c` (or directly when `args` are given),
//! captures stdout/stderr/exit code, and kills the child on cancellation.

use async_trait::async_trait;
use flowmesh_core::{ActionKind, FlowError, Result, Scope};
use flowmesh_engine::{ActionHandler, ActionOutput, StepContext};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// `shell` config.
#[derive(Debug, Deserialize)]
struct ShellConfig {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: Map<String, Value>,
    /// Treat a non-zero exit code as a handler error.
    #[serde(default = "default_true")]
    fail_on_nonzero: bool,
}

fn default_true() -> bool {
    true
}

/// Handler for `shell`.
#[derive(Default)]
pub struct ShellHandler;

impl ShellHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ActionHandler for ShellHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::Shell
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        config: Value,
        _scope: &Scope,
    ) -> Result<ActionOutput> {
        let cfg: ShellConfig = serde_json::from_value(config)
            .map_err(|e| FlowError::InvalidDefinition(format!("shell config: {e}")))?;

        let mut command = if cfg.args.is_empty() {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&cfg.command);
            c
        } else {
            let mut c = Command::new(&cfg.command);
            c.args(&cfg.args);
            c
        };
        if let Some(cwd) = &cfg.cwd {
            command.current_dir(cwd);
        }
        for (name, value) in &cfg.env {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            command.env(name, rendered);
        }
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        command.kill_on_drop(true);

        debug!(command = %cfg.command, "spawning shell command");
        let child = command
            .spawn()
            .map_err(|e| FlowError::handler(format!("spawn failed: {e}")))?;

        // kill_on_drop terminates the child when the cancelled arm drops
        // the in-flight wait future.
        let output = tokio::select! {
            _ = ctx.execution.cancellation().cancelled() => {
                return Err(FlowError::Cancelled(
                    ctx.execution.cancel_reason().unwrap_or(flowmesh_core::CancelReason::UserCancelled),
                ));
            }
            output = child.wait_with_output() => output
                .map_err(|e| FlowError::handler(format!("wait failed: {e}")))?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);
        if cfg.fail_on_nonzero && exit_code != 0 {
            return Err(FlowError::handler(format!(
                "command exited with {exit_code}: {}",
                stderr.trim()
            )));
        }

        Ok(ActionOutput::value(json!({
            "exit_code": exit_code,
            "body": stdout,
            "stderr": stderr,
        })))
    }
}
