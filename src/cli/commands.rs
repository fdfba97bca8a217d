//! CLI command definitions

use crate::core::{EventKind, TriggerEvent};
use crate::execution::SchedulingStrategy;
use clap::Args;
use std::path::PathBuf;

/// Describe the event that starts a run
#[derive(Debug, Args, Clone)]
pub struct EventArgs {
    /// Event name (push, pull_request, release, workflow_dispatch)
    #[arg(short, long, default_value = "push")]
    pub event: EventKind,

    /// Git ref the event happened on; short names mean branches
    #[arg(long = "ref", default_value = "main")]
    pub git_ref: String,

    /// Target branch of a pull request
    #[arg(long)]
    pub base_ref: Option<String>,

    /// Event activity type, e.g. `published` for releases
    #[arg(long)]
    pub action: Option<String>,

    /// Commit SHA
    #[arg(long)]
    pub sha: Option<String>,

    #[arg(long)]
    pub actor: Option<String>,

    /// Branch that deploys are restricted to
    #[arg(long, default_value = "main")]
    pub default_branch: String,
}

impl EventArgs {
    pub fn to_event(&self) -> TriggerEvent {
        let mut event = TriggerEvent::new(self.event, self.git_ref.as_str());
        event.base_ref = self.base_ref.clone();
        event.action = self.action.clone().or_else(|| match self.event {
            EventKind::Release => Some("published".to_string()),
            _ => None,
        });
        if let Some(sha) = &self.sha {
            event = event.with_sha(sha.as_str());
        }
        if let Some(actor) = &self.actor {
            event = event.with_actor(actor.as_str());
        }
        event
    }
}

/// Options shared by `run` and `dispatch`
#[derive(Debug, Args, Clone)]
pub struct ExecutionArgs {
    #[command(flatten)]
    pub event: EventArgs,

    /// Variables exposed as `vars.*` (key=value)
    #[arg(long = "var", value_parser = parse_key_value)]
    pub vars: Vec<(String, String)>,

    /// Scheduling strategy: sequential, parallel or parallel-limited:N
    #[arg(long, default_value = "parallel")]
    pub strategy: SchedulingStrategy,

    /// Working directory for job steps
    #[arg(short, long)]
    pub workspace: Option<PathBuf>,

    /// Don't save runs to history
    #[arg(long)]
    pub no_history: bool,
}

/// Run one workflow for an event
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to workflow YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    #[command(flatten)]
    pub execution: ExecutionArgs,
}

/// Run every workflow in a directory that the event triggers
#[derive(Debug, Args, Clone)]
pub struct DispatchCommand {
    /// Directory containing workflow YAML files
    #[arg(short, long, default_value = "workflows")]
    pub dir: PathBuf,

    #[command(flatten)]
    pub execution: ExecutionArgs,
}

/// Validate a workflow configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to workflow YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List workflows with recorded runs
#[derive(Debug, Args, Clone)]
pub struct ListCommand {
    /// Show run counts
    #[arg(long)]
    pub with_counts: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Workflow name to filter by
    #[arg(short = 'n', long)]
    pub workflow: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Show full details
    #[arg(long)]
    pub verbose: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show a single run
    #[arg(long)]
    pub execution_id: Option<String>,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
