use anyhow::{Context, Result};
use orchestrator::cli::commands::{HistoryCommand, RunCommand, ValidateCommand};
use orchestrator::cli::output::*;
use orchestrator::cli::{Cli, Command};
use orchestrator::core::config::{EngineConfig, PlanConfig};
use orchestrator::core::{FacilitatorKind, PlanExecution, Status};
use orchestrator::execution::{
    ExecutionEngine, ExecutionRequest, LoopbackTaskExecutor, ScriptedStepRunner,
};
use orchestrator::interrupt::{Interrupt, InterruptType, IssuedBy};
use orchestrator::persistence::{ExecutionStore, InMemoryExecutionStore};
use orchestrator::waiter::WaitNotifyEngine;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Run(cmd) => run_plan(cmd).await?,
        Command::Validate(cmd) => validate_plan(cmd)?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

#[cfg(feature = "sqlite")]
async fn history_store() -> Result<Arc<dyn ExecutionStore>> {
    Ok(Arc::new(
        orchestrator::persistence::SqliteExecutionStore::with_default_path().await?,
    ))
}

#[cfg(not(feature = "sqlite"))]
async fn history_store() -> Result<Arc<dyn ExecutionStore>> {
    anyhow::bail!("History requires the `sqlite` feature")
}

async fn run_plan(cmd: &RunCommand) -> Result<()> {
    let plan_config = PlanConfig::from_file(&cmd.file).context("Failed to load plan")?;
    let engine_config = match &cmd.config {
        Some(path) => EngineConfig::from_file(path).context("Failed to load engine config")?,
        None => EngineConfig::default(),
    };
    let plan = plan_config.to_plan();
    println!("{} Loaded plan: {}", INFO, style(&plan.name).bold());

    let store: Arc<dyn ExecutionStore> = if cmd.no_history {
        Arc::new(InMemoryExecutionStore::new())
    } else {
        history_store().await?
    };

    // Scripted outcomes go to the step runner for sync nodes and to the
    // loopback executor for everything dispatched as a task
    let mut runner = ScriptedStepRunner::new();
    let mut task_statuses = HashMap::new();
    for (node_id, status) in &cmd.outcome {
        match plan.node(node_id) {
            Some(node) if node.facilitator == FacilitatorKind::Sync && node.approval.is_none() => {
                runner = runner.with_status(node_id.clone(), *status);
            }
            Some(_) => {
                task_statuses.insert(node_id.clone(), *status);
            }
            None => anyhow::bail!("Outcome given for unknown node '{}'", node_id),
        }
    }
    let mut task_outputs: HashMap<String, Map<String, Value>> = HashMap::new();
    for (node_id, key, value) in &cmd.output {
        task_outputs
            .entry(node_id.clone())
            .or_default()
            .insert(key.clone(), Value::String(value.clone()));
    }

    let waiter = WaitNotifyEngine::new();
    let executor = LoopbackTaskExecutor::new(waiter.clone())
        .with_statuses(task_statuses)
        .with_outputs(task_outputs);
    let engine = ExecutionEngine::builder(store)
        .config(engine_config)
        .waiter(waiter)
        .step_runner(Arc::new(runner))
        .task_executor(Arc::new(executor))
        .build();
    engine.save_plan(&plan).await?;

    let spinner = create_spinner(format!("Running {}", plan.name));
    let mut events = engine.subscribe();
    let printer = {
        let spinner = spinner.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                spinner.println(format_execution_event(&event));
            }
        })
    };

    let request = ExecutionRequest {
        plan_id: plan.id.clone(),
        account_id: cmd.account.clone(),
        pipeline_id: cmd.pipeline.clone().unwrap_or_else(|| plan.id.clone()),
    };
    let execution = engine.submit(request).await?;

    if let Some(secs) = cmd.abort_after {
        let engine = engine.clone();
        let plan_execution_id = execution.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            let interrupt = Interrupt::new(
                InterruptType::AbortAll,
                plan_execution_id,
                None,
                IssuedBy::Operator {
                    identity: whoami(),
                },
            );
            if let Err(e) = engine.register_interrupt(interrupt).await {
                error!("Abort was not applied: {}", e);
            }
        });
    }

    let result = engine
        .wait_for_completion(execution.id, Duration::from_secs(cmd.timeout))
        .await;
    // Let the printer drain what is already on the bus
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();
    spinner.finish_and_clear();
    engine.shutdown();

    let finished = result?;
    print_execution_details(&finished);

    if !cmd.no_history {
        println!(
            "\n{} Execution saved to history (ID: {})",
            INFO,
            style(&finished.id.to_string()[..8]).dim()
        );
    }

    if finished.status.is_positive() {
        println!(
            "\n{} {} completed {}",
            CHECK,
            style(&plan.name).bold(),
            style("successfully").green()
        );
        Ok(())
    } else {
        println!("\n{} {} {}", CROSS, style(&plan.name).bold(), format_status(finished.status));
        std::process::exit(1);
    }
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "operator".to_string())
}

fn validate_plan(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating plan...", INFO);

    match PlanConfig::from_file(&cmd.file) {
        Ok(config) => {
            println!("{} Plan definition is valid!", CHECK);
            println!("  ID: {}", style(&config.id).bold());
            println!("  Start: {}", style(&config.start).cyan());
            println!("  Nodes: {}", style(config.nodes.len()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(e).red());
            std::process::exit(1);
        }
    }
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = history_store().await?;

    if let Some(id) = &cmd.execution_id {
        let id = uuid::Uuid::parse_str(id).context("Invalid execution ID format")?;
        match store.get_plan_execution(id).await? {
            Some(execution) if cmd.json => println!("{}", serde_json::to_string_pretty(&execution)?),
            Some(execution) => print_execution_details(&execution),
            None => println!("{} Execution not found", WARN),
        }
        return Ok(());
    }

    let mut executions = store.list_plan_executions(cmd.pipeline.as_deref()).await?;
    executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    executions.truncate(cmd.limit);

    if executions.is_empty() {
        println!("{} No executions found", INFO);
        return Ok(());
    }

    if cmd.json {
        let data = serde_json::json!({ "executions": executions });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Execution history (showing latest {}):", INFO, cmd.limit);
        for execution in &executions {
            println!("  {}", format_execution_summary(execution));
        }
    }

    Ok(())
}

fn print_execution_details(execution: &PlanExecution) {
    println!("{} Execution Details", INFO);
    println!("  ID: {}", style(execution.id).cyan());
    println!("  Plan: {}", style(&execution.plan_id).bold());
    println!("  Pipeline: {}", style(&execution.pipeline_id).bold());
    println!("  Account: {}", style(&execution.account_id).dim());
    println!("  Status: {}", format_status(execution.status));
    if let Some(duration) = execution.duration().and_then(|d| d.to_std().ok()) {
        println!("  Duration: {}", style(format_duration(duration)).dim());
    }
    if let Some(failure) = &execution.failure {
        println!(
            "  Failed node: {} ({})",
            style(&failure.setup_id).red(),
            format_status(failure.status)
        );
        if failure.retry_chain.len() > 1 {
            println!("  Attempts: {}", failure.retry_chain.len());
        }
        if let Some(message) = &failure.message {
            println!("  Reason: {}", style(message).dim());
        }
    }
    if execution.status == Status::Queued {
        println!("  {} Still queued behind the pipeline's running executions", SPINNER);
    }
}
