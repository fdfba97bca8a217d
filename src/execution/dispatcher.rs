//! Dispatch one event to every workflow it triggers

use crate::{
    core::{RunStatus, TriggerEvent, Workflow},
    execution::engine::{EngineError, ExecutionEngine},
    runner::StepRunner,
};
use tracing::{debug, error, info};

/// Runs started by a dispatch, plus the workflows the event did not match
#[derive(Debug)]
pub struct DispatchOutcome {
    pub runs: Vec<(Workflow, Result<RunStatus, EngineError>)>,
    pub not_triggered: Vec<String>,
}

impl DispatchOutcome {
    /// Whether every started run completed
    pub fn all_succeeded(&self) -> bool {
        self.runs
            .iter()
            .all(|(_, result)| matches!(result, Ok(RunStatus::Completed)))
    }
}

/// Start a run for each workflow `event` triggers. Runs proceed
/// concurrently and share the engine's concurrency groups.
pub async fn dispatch<R: StepRunner + 'static>(
    engine: &ExecutionEngine<R>,
    workflows: Vec<Workflow>,
    event: &TriggerEvent,
) -> DispatchOutcome {
    let (triggered, skipped): (Vec<Workflow>, Vec<Workflow>) = workflows
        .into_iter()
        .partition(|workflow| workflow.is_triggered_by(event));

    let not_triggered: Vec<String> = skipped.into_iter().map(|w| w.name).collect();
    for name in &not_triggered {
        debug!("Workflow '{}' not triggered by {}", name, event.kind);
    }
    info!(
        "Dispatching {} on {} to {} workflow(s)",
        event.kind,
        event.git_ref,
        triggered.len()
    );

    let handles: Vec<_> = triggered
        .into_iter()
        .map(|workflow| {
            let engine = engine.clone();
            let event = event.clone();
            let mut run = workflow.clone();
            let handle = tokio::spawn(async move {
                let result = engine.execute(&mut run, &event).await;
                (run, result)
            });
            (workflow, handle)
        })
        .collect();

    // a run whose task died still counts, as a failure
    let mut runs = Vec::new();
    for (workflow, handle) in handles {
        match handle.await {
            Ok(run) => runs.push(run),
            Err(e) => {
                error!("Run of workflow '{}' ended abnormally: {}", workflow.name, e);
                runs.push((workflow, Err(EngineError::Join(e.to_string()))));
            }
        }
    }

    DispatchOutcome {
        runs,
        not_triggered,
    }
}
