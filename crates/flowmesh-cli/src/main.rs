// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! FlowMesh CLI.
//!
//! Exit codes: 0 success, 1 assertion failure, 2 runtime error,
//! 3 invalid input, 4 cancelled.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use flowmesh_actions::HandlerFactory;
use flowmesh_core::model::{EventType, Execution, ExecutionStatus, FlowRecord, TriggerSource};
use flowmesh_core::{CancelReason, ErrorKind, FlowDefinition};
use flowmesh_engine::{ActionRegistry, DebuggerController, EventHub, FlowInterpreter, Runtime};
use flowmesh_runner::{LoadConfig, LoadRunner};
use flowmesh_state::{
    FlowStore, InMemoryExecutionStore, InMemoryFlowStore, InMemoryLoadTestStore, InMemoryStepStore,
    StepStore,
};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const EXIT_OK: i32 = 0;
const EXIT_ASSERTION: i32 = 1;
const EXIT_RUNTIME: i32 = 2;
const EXIT_INVALID: i32 = 3;
const EXIT_CANCELLED: i32 = 4;

#[derive(Parser)]
#[command(name = "flowmesh")]
#[command(version, about = "FlowMesh integration-test flow runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a flow definition
    Validate {
        /// Path to flow file (YAML or JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Run a flow
    Run {
        /// Path to flow file (YAML or JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Runtime variable overrides, `name=value`
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,

        /// Environment variables file (YAML or JSON map)
        #[arg(long)]
        env_file: Option<PathBuf>,

        /// Write the execution report to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a flow under load with virtual users
    Loadtest {
        /// Path to flow file (YAML or JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Virtual users
        #[arg(long, default_value = "10")]
        vus: u32,

        /// Total duration, seconds
        #[arg(long, default_value = "30")]
        duration: u64,

        /// Ramp-up, seconds
        #[arg(long, default_value = "0")]
        ramp_up: u64,

        /// Ramp-down, seconds
        #[arg(long, default_value = "0")]
        ramp_down: u64,

        /// Think time between iterations, milliseconds
        #[arg(long, default_value = "0")]
        think_time_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("flowmesh={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let code = match cli.command {
        Commands::Validate { file } => validate(&file),
        Commands::Run { file, vars, env_file, output } => {
            run(&file, &vars, env_file.as_deref(), output.as_deref()).await
        }
        Commands::Loadtest { file, vus, duration, ramp_up, ramp_down, think_time_ms } => {
            loadtest(&file, vus, duration, ramp_up, ramp_down, think_time_ms).await
        }
    };
    std::process::exit(code);
}

fn load_definition(path: &Path) -> Result<FlowDefinition> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let definition = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        FlowDefinition::from_json(&text)
    } else {
        FlowDefinition::from_yaml(&text)
    };
    definition.map_err(Into::into)
}

fn validate(file: &Path) -> i32 {
    println!("{} {}", "Validating flow:".cyan().bold(), file.display());
    let definition = match load_definition(file) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{} {e:#}", "Error:".red().bold());
            return EXIT_INVALID;
        }
    };
    match definition.validate() {
        Ok(()) => {
            println!(
                "{} {} ({} step(s))",
                "Valid:".green().bold(),
                definition.name,
                definition.steps.len()
            );
            EXIT_OK
        }
        Err(issues) => {
            eprintln!("{}", "Invalid flow definition:".red().bold());
            for issue in issues {
                eprintln!("  - {issue}");
            }
            EXIT_INVALID
        }
    }
}

fn parse_var_overrides(vars: &[String]) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for pair in vars {
        let (name, raw) = pair
            .split_once('=')
            .with_context(|| format!("--var '{pair}' must be NAME=VALUE"))?;
        // Values parse as JSON when possible, else as strings.
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        out.insert(name.to_string(), value);
    }
    Ok(out)
}

fn load_env_file(path: Option<&Path>) -> Result<Map<String, Value>> {
    let Some(path) = path else {
        return Ok(Map::new());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let value: Value = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(&text)?
    } else {
        serde_yaml::from_str(&text)?
    };
    match value {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("environment file must be a map"),
    }
}

async fn run(
    file: &Path,
    vars: &[String],
    env_file: Option<&Path>,
    output: Option<&Path>,
) -> i32 {
    let definition = match load_definition(file) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{} {e:#}", "Error:".red().bold());
            return EXIT_INVALID;
        }
    };
    if let Err(issues) = definition.validate() {
        eprintln!("{}", "Invalid flow definition:".red().bold());
        for issue in issues {
            eprintln!("  - {issue}");
        }
        return EXIT_INVALID;
    }
    let variables = match parse_var_overrides(vars) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("{} {e:#}", "Error:".red().bold());
            return EXIT_INVALID;
        }
    };
    let env = match load_env_file(env_file) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("{} {e:#}", "Error:".red().bold());
            return EXIT_INVALID;
        }
    };

    // Single-process wiring: in-memory stores, full handler set.
    let flows = Arc::new(InMemoryFlowStore::new());
    let executions = Arc::new(InMemoryExecutionStore::new());
    let steps = Arc::new(InMemoryStepStore::new());
    let hub = EventHub::new();
    let debugger = Arc::new(DebuggerController::new(hub.clone()));
    let registry = Arc::new(ActionRegistry::new());
    HandlerFactory::new().install(&registry);
    let interpreter = FlowInterpreter::new(
        registry,
        hub.clone(),
        debugger.clone(),
        executions.clone(),
        steps.clone(),
        flows.clone(),
    );
    let runtime = Runtime::new(
        interpreter.clone(),
        debugger,
        flows.clone(),
        executions,
        steps.clone(),
    );

    let workspace_id = Uuid::new_v4();
    let flow = FlowRecord::new(workspace_id, definition.clone());
    if let Err(e) = flows.put(flow.clone()).await {
        error!(error = %e, "failed to store flow");
        return EXIT_RUNTIME;
    }

    let execution = Execution::new(flow.id, workspace_id, definition, TriggerSource::Api)
        .with_variables(variables);
    let execution_id = execution.id;

    // Live progress on stderr while the flow runs.
    let mut subscription = hub.subscribe(execution_id);
    let printer = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            match event.event_type {
                EventType::StepCompleted => {
                    eprintln!(
                        "  {} {}",
                        "✓".green(),
                        event.payload["step_id"].as_str().unwrap_or("?")
                    );
                }
                EventType::StepFailed => {
                    eprintln!(
                        "  {} {} {}",
                        "✗".red(),
                        event.payload["step_id"].as_str().unwrap_or("?"),
                        event.payload["error"]["message"].as_str().unwrap_or("")
                    );
                }
                EventType::StepSkipped => {
                    eprintln!(
                        "  {} {}",
                        "-".dimmed(),
                        event.payload["step_id"].as_str().unwrap_or("?")
                    );
                }
                EventType::ExecutionCompleted
                | EventType::ExecutionFailed
                | EventType::ExecutionCancelled => break,
                _ => {}
            }
        }
    });

    // Ctrl-C cancels the run cooperatively.
    let cancel_interpreter = interpreter.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_interpreter.cancel(execution_id, CancelReason::UserCancelled);
        }
    });

    println!("{} {}", "Running flow:".cyan().bold(), flow.name);
    let finished = match runtime.run_inline(execution, env).await {
        Ok(finished) => finished,
        Err(e) => {
            eprintln!("{} {e}", "Error:".red().bold());
            return EXIT_RUNTIME;
        }
    };
    let _ = printer.await;

    // Execution report: the terminal record plus every step attempt.
    let step_records = steps
        .list_for_execution(execution_id)
        .await
        .unwrap_or_default();
    let report = serde_json::json!({
        "execution": finished,
        "steps": step_records,
    });
    let rendered = serde_json::to_string_pretty(&report).unwrap_or_default();
    if let Some(path) = output {
        if let Err(e) = fs::write(path, &rendered) {
            eprintln!("{} cannot write report: {e}", "Error:".red().bold());
            return EXIT_RUNTIME;
        }
        println!("{} {}", "Report written to".dimmed(), path.display());
    } else {
        println!("{rendered}");
    }

    exit_code_for(&finished)
}

fn exit_code_for(finished: &Execution) -> i32 {
    match finished.status {
        ExecutionStatus::Completed => {
            println!(
                "{} {}/{} step(s) passed in {} ms",
                "Passed:".green().bold(),
                finished.passed_steps,
                finished.total_steps,
                finished.duration_ms
            );
            EXIT_OK
        }
        ExecutionStatus::Cancelled => {
            eprintln!("{}", "Cancelled".yellow().bold());
            EXIT_CANCELLED
        }
        _ => {
            let assertion_failure = finished
                .error
                .as_ref()
                .map(|e| e.kind == ErrorKind::AssertionFailed)
                .unwrap_or(false);
            eprintln!(
                "{} {}",
                "Failed:".red().bold(),
                finished
                    .error
                    .as_ref()
                    .map(|e| e.message.as_str())
                    .unwrap_or("execution failed")
            );
            if assertion_failure {
                EXIT_ASSERTION
            } else {
                EXIT_RUNTIME
            }
        }
    }
}

async fn loadtest(
    file: &Path,
    vus: u32,
    duration_secs: u64,
    ramp_up_secs: u64,
    ramp_down_secs: u64,
    think_time_ms: u64,
) -> i32 {
    let definition = match load_definition(file) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{} {e:#}", "Error:".red().bold());
            return EXIT_INVALID;
        }
    };
    if let Err(issues) = definition.validate() {
        eprintln!("{}", "Invalid flow definition:".red().bold());
        for issue in issues {
            eprintln!("  - {issue}");
        }
        return EXIT_INVALID;
    }

    let flows = Arc::new(InMemoryFlowStore::new());
    let executions = Arc::new(InMemoryExecutionStore::new());
    let steps = Arc::new(InMemoryStepStore::new());
    let results = Arc::new(InMemoryLoadTestStore::new());
    let hub = EventHub::new();
    let debugger = Arc::new(DebuggerController::new(hub.clone()));
    let registry = Arc::new(ActionRegistry::new());
    HandlerFactory::new().install(&registry);
    let interpreter = FlowInterpreter::new(
        registry,
        hub,
        debugger,
        executions,
        steps.clone(),
        flows.clone(),
    );

    let workspace_id = Uuid::new_v4();
    let flow = FlowRecord::new(workspace_id, definition);
    let flow_id = flow.id;
    if let Err(e) = flows.put(flow).await {
        error!(error = %e, "failed to store flow");
        return EXIT_RUNTIME;
    }

    let runner = LoadRunner::new(interpreter, flows, steps, results);
    let mut config = LoadConfig::new(workspace_id, flow_id, vus, duration_secs * 1_000);
    config.ramp_up_ms = ramp_up_secs * 1_000;
    config.ramp_down_ms = ramp_down_secs * 1_000;
    config.think_time_ms = think_time_ms;

    println!(
        "{} {} VU(s) for {} s",
        "Load test:".cyan().bold(),
        vus,
        duration_secs
    );
    let id = match runner.start(config).await {
        Ok(id) => id,
        Err(e) => {
            eprintln!("{} {e}", "Error:".red().bold());
            return EXIT_RUNTIME;
        }
    };

    // Ctrl-C stops the run; the runner grants VUs the grace period.
    let stop_runner = runner.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop_runner.stop(id).await;
        }
    });

    // Poll until the run settles, echoing the newest timeline bucket.
    let mut seen_buckets = 0;
    let result = loop {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        let current = match runner.get(id).await {
            Ok(current) => current,
            Err(e) => {
                eprintln!("{} {e}", "Error:".red().bold());
                return EXIT_RUNTIME;
            }
        };
        for bucket in current.timeline.iter().skip(seen_buckets) {
            eprintln!(
                "  t={} rps={:.1} vus={} p50={:.0}ms p95={:.0}ms err={:.1}%",
                bucket.t.format("%H:%M:%S"),
                bucket.rps,
                bucket.active_vus,
                bucket.latency_p50_ms,
                bucket.latency_p95_ms,
                bucket.error_rate * 100.0
            );
        }
        seen_buckets = current.timeline.len();
        if current.status.is_terminal() {
            break current;
        }
    };

    let rendered = serde_json::to_string_pretty(&result).unwrap_or_default();
    println!("{rendered}");
    match result.status {
        flowmesh_core::model::LoadTestStatus::Finished => EXIT_OK,
        flowmesh_core::model::LoadTestStatus::Cancelled => EXIT_CANCELLED,
        _ => EXIT_RUNTIME,
    }
}
