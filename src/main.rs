use anyhow::{bail, Context, Result};
use stagegate::cli::commands::{
    DispatchCommand, ExecutionArgs, HistoryCommand, ListCommand, RunCommand, ValidateCommand,
};
use stagegate::cli::output::*;
use stagegate::cli::{Cli, Command};
use stagegate::core::config::WorkflowConfig;
use stagegate::execution::{dispatch, EngineOptions, ExecutionEngine, ExecutionEvent};
use stagegate::persistence::{InMemoryPersistence, PersistenceBackend, RunSummary};
use stagegate::runner::{LocalRunner, RunnerConfig};
use stagegate::{RunStatus, TriggerEvent, Workflow};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    let succeeded = match &cli.command {
        Command::Run(cmd) => run_workflow(cmd, &cli).await?,
        Command::Dispatch(cmd) => dispatch_event(cmd, &cli).await?,
        Command::Validate(cmd) => validate_workflow(cmd)?,
        Command::List(cmd) => list_workflows(cmd).await?,
        Command::History(cmd) => show_history(cmd).await?,
    };

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

fn runner_config(cli: &Cli, args: &ExecutionArgs) -> Result<RunnerConfig> {
    let mut config = match &cli.config {
        Some(path) => RunnerConfig::from_file(path)?,
        None => RunnerConfig::new(),
    };
    if let Some(workspace) = &args.workspace {
        config = config.with_workspace(workspace.clone());
    }
    Ok(config)
}

fn build_engine(config: &RunnerConfig, args: &ExecutionArgs) -> Result<ExecutionEngine<LocalRunner>> {
    let runner = LocalRunner::new(config).context("Failed to create runner")?;
    let workspace = match &config.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to resolve working directory")?,
    };
    let options = EngineOptions {
        workspace,
        artifact_root: config.artifact_root.clone(),
        default_branch: args.event.default_branch.clone(),
        vars: args.vars.iter().cloned().collect(),
    };
    Ok(ExecutionEngine::new(runner, args.strategy).with_options(options))
}

async fn open_history(no_history: bool) -> Result<Arc<dyn PersistenceBackend>> {
    if no_history {
        return Ok(Arc::new(InMemoryPersistence::new()));
    }
    #[cfg(feature = "sqlite")]
    {
        Ok(Arc::new(
            stagegate::persistence::SqliteRunStore::with_default_path().await?,
        ))
    }
    #[cfg(not(feature = "sqlite"))]
    {
        tracing::warn!("Built without the sqlite feature; run history is not kept");
        Ok(Arc::new(InMemoryPersistence::new()))
    }
}

/// Print engine events above a progress bar over `total` job instances
fn attach_console(engine: &ExecutionEngine<LocalRunner>, total: usize) -> indicatif::ProgressBar {
    let progress = create_progress_bar(total);
    let bar = progress.clone();
    engine.add_event_handler(move |event| {
        if let Some(line) = format_execution_event(&event) {
            bar.println(line);
        }
        match &event {
            ExecutionEvent::JobStarted { instance_id } => bar.set_message(instance_id.clone()),
            ExecutionEvent::JobCompleted { .. }
            | ExecutionEvent::JobFailed { .. }
            | ExecutionEvent::JobSkipped { .. }
            | ExecutionEvent::JobCancelled { .. } => bar.inc(1),
            _ => {}
        }
    });
    progress
}

fn load_workflow(path: &Path) -> Result<Workflow> {
    WorkflowConfig::from_file(path)?
        .to_workflow()
        .with_context(|| format!("Failed to load workflow {}", path.display()))
}

async fn record(
    store: &dyn PersistenceBackend,
    workflow: &Workflow,
    event: &TriggerEvent,
    keep: bool,
) -> Result<()> {
    if !keep {
        return Ok(());
    }
    let summary = RunSummary::from_run(workflow, event);
    store.save_run(&summary).await?;
    println!(
        "{} Run saved to history (ID: {})",
        INFO,
        style(&summary.execution_id.to_string()[..8]).dim()
    );
    Ok(())
}

fn print_result(workflow: &Workflow, status: RunStatus) {
    println!("{}", separator());
    for line in format_job_table(workflow) {
        println!("{}", line);
    }
    let icon = if status == RunStatus::Completed { CHECK } else { CROSS };
    println!("{} {} {}", icon, style(&workflow.name).bold(), format_status(status));
}

async fn run_workflow(cmd: &RunCommand, cli: &Cli) -> Result<bool> {
    let args = &cmd.execution;
    let mut workflow = load_workflow(&cmd.file)?;
    let event = args.event.to_event();

    println!("{} Loaded workflow: {}", INFO, style(&workflow.name).bold());
    for (key, value) in &args.vars {
        println!("{} Variable: {} = {}", INFO, style(key).cyan(), style(value).dim());
    }

    let config = runner_config(cli, args)?;
    let engine = build_engine(&config, args)?;
    let store = open_history(args.no_history).await?;

    let progress = attach_console(&engine, workflow.instances.len());
    let result = engine.execute(&mut workflow, &event).await;
    progress.finish_and_clear();

    let status = match result {
        Ok(status) => status,
        Err(e) => {
            println!("{} {}", CROSS, style(&e).red());
            return Ok(false);
        }
    };

    print_result(&workflow, status);
    record(store.as_ref(), &workflow, &event, !args.no_history).await?;
    Ok(status == RunStatus::Completed)
}

fn workflow_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read workflow directory {}", dir.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yml" || e == "yaml");
        if is_yaml {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

async fn dispatch_event(cmd: &DispatchCommand, cli: &Cli) -> Result<bool> {
    let args = &cmd.execution;
    let files = workflow_files(&cmd.dir)?;
    if files.is_empty() {
        bail!("No workflow files in {}", cmd.dir.display());
    }

    let mut workflows = Vec::new();
    for path in &files {
        workflows.push(load_workflow(path)?);
    }
    let event = args.event.to_event();

    let config = runner_config(cli, args)?;
    let engine = build_engine(&config, args)?;
    let store = open_history(args.no_history).await?;

    let total = workflows
        .iter()
        .filter(|w| w.is_triggered_by(&event))
        .map(|w| w.instances.len())
        .sum();
    let progress = attach_console(&engine, total);
    let outcome = dispatch(&engine, workflows, &event).await;
    progress.finish_and_clear();

    for name in &outcome.not_triggered {
        println!("{} {} not triggered", SKIP, style(name).dim());
    }
    if outcome.runs.is_empty() {
        println!("{} No workflow is triggered by {} on {}", WARN, event.kind, event.git_ref);
        return Ok(true);
    }

    for (workflow, result) in &outcome.runs {
        match result {
            Ok(status) => {
                print_result(workflow, *status);
                record(store.as_ref(), workflow, &event, !args.no_history).await?;
            }
            Err(e) => {
                error!("Workflow {} did not run: {}", workflow.name, e);
                println!("{} {}: {}", CROSS, style(&workflow.name).bold(), style(e).red());
            }
        }
    }
    Ok(outcome.all_succeeded())
}

fn validate_workflow(cmd: &ValidateCommand) -> Result<bool> {
    println!("{} Validating workflow...", INFO);

    match WorkflowConfig::from_file(&cmd.file) {
        Ok(config) => {
            let triggers = config.triggers()?;
            println!("{} Workflow configuration is valid!", CHECK);
            println!("  Name: {}", style(&config.name).bold());
            println!("  Triggers: {}", style(triggers.event_names().join(", ")).cyan());
            println!("  Jobs: {}", style(config.jobs.len()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(true)
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            Ok(false)
        }
    }
}

async fn list_workflows(cmd: &ListCommand) -> Result<bool> {
    let store = open_history(false).await?;
    let workflows = store.list_workflows().await?;

    if workflows.is_empty() {
        println!("{} No workflows found in history", INFO);
        return Ok(true);
    }

    if cmd.json {
        let mut json_data = Vec::new();
        for name in &workflows {
            let runs = store.list_runs(name).await?;
            json_data.push(serde_json::json!({ "name": name, "run_count": runs.len() }));
        }
        let data = serde_json::json!({ "workflows": json_data });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(true);
    }

    println!("{} Workflows in history:", INFO);
    for name in &workflows {
        if cmd.with_counts {
            let runs = store.list_runs(name).await?;
            let completed = runs.iter().filter(|r| r.status == RunStatus::Completed).count();
            let failed = runs.iter().filter(|r| r.status == RunStatus::Failed).count();
            println!(
                "  {} ({} runs: {} succeeded, {} failed)",
                style(name).bold(),
                style(runs.len()).cyan(),
                style(completed).green(),
                style(failed).red()
            );
        } else {
            println!("  {}", style(name).bold());
        }
    }
    Ok(true)
}

async fn show_history(cmd: &HistoryCommand) -> Result<bool> {
    let store = open_history(false).await?;

    if let Some(id) = &cmd.execution_id {
        let id = uuid::Uuid::parse_str(id).context("Invalid execution ID format")?;
        match store.load_run(id).await? {
            Some(summary) => print_run_details(&summary, cmd.verbose)?,
            None => println!("{} Run not found", WARN),
        }
        return Ok(true);
    }

    let mut runs = match &cmd.workflow {
        Some(name) => store.list_runs(name).await?,
        None => {
            let mut all = Vec::new();
            for name in store.list_workflows().await? {
                all.extend(store.list_runs(&name).await?);
            }
            all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            all
        }
    };
    runs.truncate(cmd.limit);

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(true);
    }

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Run history (latest {}):", INFO, runs.len());
        for summary in &runs {
            println!("  {}", format_run_summary(summary));
        }
    }
    Ok(true)
}

fn print_run_details(summary: &RunSummary, verbose: bool) -> Result<()> {
    println!("{} Run Details", INFO);
    println!("  ID: {}", style(summary.execution_id).cyan());
    println!("  Workflow: {}", style(&summary.workflow).bold());
    println!("  Event: {} on {}", summary.event, style(&summary.git_ref).cyan());
    println!("  Status: {}", format_status(summary.status));
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    if let Some(completed) = summary.completed_at {
        println!("  Completed: {}", style(completed.to_rfc3339()).dim());
        if let Ok(duration) = completed.signed_duration_since(summary.started_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    println!(
        "  Jobs: {} succeeded, {} failed, {} skipped of {}",
        style(summary.succeeded_jobs).green(),
        style(summary.failed_jobs).red(),
        summary.skipped_jobs,
        summary.total_jobs
    );
    for (job, url) in &summary.environment_urls {
        println!("  Deployed by {}: {}", job, style(url).underlined());
    }

    if verbose {
        println!("\n  {}", style("Full details:").bold());
        let json = serde_json::to_string_pretty(summary)?;
        for line in json.lines() {
            println!("    {}", line);
        }
    }

    Ok(())
}
