//! CLI output formatting

use crate::{
    core::{annotation::Severity, JobState, RunStatus, Workflow},
    execution::ExecutionEvent,
    persistence::RunSummary,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub use console::style;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");

/// Create a progress bar over job instances
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Horizontal rule as wide as the terminal
pub fn separator() -> String {
    let width = term_size::dimensions_stdout()
        .map(|(w, _)| w)
        .unwrap_or(80)
        .min(100);
    style("─".repeat(width)).dim().to_string()
}

pub fn format_job_state(state: &JobState) -> String {
    match state {
        JobState::Pending => style("PENDING").dim().to_string(),
        JobState::Running { .. } => style("RUNNING").yellow().to_string(),
        JobState::Completed { .. } => style("SUCCESS").green().to_string(),
        JobState::Failed { .. } => style("FAILED").red().to_string(),
        JobState::Skipped { .. } => style("SKIPPED").dim().to_string(),
        JobState::Cancelled { .. } => style("CANCELLED").yellow().to_string(),
    }
}

pub fn format_status(status: RunStatus) -> String {
    match status {
        RunStatus::Pending => style("PENDING").dim().to_string(),
        RunStatus::Running => style("RUNNING").yellow().to_string(),
        RunStatus::Completed => style("COMPLETED").green().to_string(),
        RunStatus::Failed => style("FAILED").red().to_string(),
        RunStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// One line per run in `history`
pub fn format_run_summary(summary: &RunSummary) -> String {
    let status_icon = match summary.status {
        RunStatus::Completed => CHECK,
        RunStatus::Failed => CROSS,
        RunStatus::Running => SPINNER,
        _ => INFO,
    };
    let id = summary.execution_id.to_string();

    format!(
        "{} {} - {} - {} on {} - {} ({}/{} succeeded, {} skipped)",
        status_icon,
        style(&id[..8]).dim(),
        style(&summary.workflow).bold(),
        summary.event,
        style(&summary.git_ref).cyan(),
        format_status(summary.status),
        summary.succeeded_jobs,
        summary.total_jobs,
        summary.skipped_jobs,
    )
}

/// Format an execution event for display; `None` for events not shown
pub fn format_execution_event(event: &ExecutionEvent) -> Option<String> {
    let line = match event {
        ExecutionEvent::RunStarted {
            execution_id,
            workflow,
            total_jobs,
        } => format!(
            "{} Starting {} ({}, {} jobs)",
            ROCKET,
            style(workflow).bold(),
            style(&execution_id.to_string()[..8]).dim(),
            total_jobs
        ),
        ExecutionEvent::RunWaiting { group, .. } => format!(
            "{} Waiting for concurrency group {}",
            SPINNER,
            style(group).yellow()
        ),
        ExecutionEvent::JobWaiting { instance_id, group } => format!(
            "{} {} waiting for concurrency group {}",
            SPINNER,
            style(instance_id).cyan(),
            style(group).yellow()
        ),
        ExecutionEvent::JobStarted { instance_id } => {
            format!("{} {}", SPINNER, style(instance_id).cyan())
        }
        ExecutionEvent::StepStarted { .. } => return None,
        ExecutionEvent::StepFinished {
            instance_id,
            step,
            outcome,
        } => {
            let outcome = match *outcome {
                "success" => style(*outcome).green(),
                "failure" => style(*outcome).red(),
                other => style(other).dim(),
            };
            format!("    {} › {} {}", style(instance_id).dim(), step, outcome)
        }
        ExecutionEvent::Annotation {
            instance_id,
            diagnostic,
        } => {
            let icon = match diagnostic.severity {
                Severity::Error => CROSS,
                Severity::Warning => WARN,
                Severity::Notice => INFO,
            };
            format!("    {}{} {}", icon, style(instance_id).dim(), diagnostic)
        }
        ExecutionEvent::JobCompleted {
            instance_id,
            environment_url,
        } => match environment_url {
            Some(url) => format!(
                "{} {} → {}",
                CHECK,
                style(instance_id).green(),
                style(url).underlined()
            ),
            None => format!("{} {}", CHECK, style(instance_id).green()),
        },
        ExecutionEvent::JobFailed { instance_id, error } => {
            format!("{} {}: {}", CROSS, style(instance_id).red(), style(error).dim())
        }
        ExecutionEvent::JobSkipped {
            instance_id,
            reason,
        } => format!("{} {} ({})", SKIP, style(instance_id).dim(), reason),
        ExecutionEvent::JobCancelled {
            instance_id,
            reason,
        } => format!("{} {} cancelled: {}", WARN, style(instance_id).yellow(), reason),
        ExecutionEvent::RunCompleted {
            execution_id,
            workflow,
            status,
        } => format!(
            "{} {} ({}) {}",
            INFO,
            style(workflow).bold(),
            style(&execution_id.to_string()[..8]).dim(),
            format_status(*status)
        ),
    };
    Some(line)
}

/// Per-job table printed after a run
pub fn format_job_table(workflow: &Workflow) -> Vec<String> {
    let mut lines = Vec::new();
    for job_id in workflow.execution_order() {
        for instance in workflow.instances_of(job_id) {
            let mut line = format!("  {:<28} {}", instance.id, format_job_state(&instance.state));
            match &instance.state {
                JobState::Failed { error, .. } => {
                    line.push_str(&format!("  {}", style(error).dim()));
                }
                JobState::Skipped { reason } | JobState::Cancelled { reason, .. } => {
                    line.push_str(&format!("  {}", style(reason).dim()));
                }
                _ => {}
            }
            if let Some(binding) = &instance.binding {
                line.push_str(&format!("  [{}]", binding.label()));
            }
            lines.push(line);
        }
    }
    lines
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
