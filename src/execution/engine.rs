//! Main execution engine - orchestrates a workflow run

use crate::{
    core::{
        annotation::Diagnostic,
        artifact::ArtifactStore,
        condition::ExpressionError,
        ExpressionContext, JobResult, JobState, RunStatus, TriggerEvent,
        Workflow,
    },
    execution::{
        concurrency::{CancelSignal, ConcurrencyRegistry},
        executor::{JobExecutor, JobOutcome, JobPlan, JobReport},
        scheduler::{ExecutionScheduler, SchedulingStrategy},
    },
    runner::StepRunner,
};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events that can occur during a workflow run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunStarted {
        execution_id: Uuid,
        workflow: String,
        total_jobs: usize,
    },
    /// The run is queued behind its workflow-level concurrency group
    RunWaiting {
        execution_id: Uuid,
        group: String,
    },
    JobWaiting {
        instance_id: String,
        group: String,
    },
    JobStarted {
        instance_id: String,
    },
    StepStarted {
        instance_id: String,
        step: String,
    },
    StepFinished {
        instance_id: String,
        step: String,
        /// `success`, `failure` or `skipped`
        outcome: &'static str,
    },
    Annotation {
        instance_id: String,
        diagnostic: Diagnostic,
    },
    JobCompleted {
        instance_id: String,
        environment_url: Option<String>,
    },
    JobFailed {
        instance_id: String,
        error: String,
    },
    JobSkipped {
        instance_id: String,
        reason: String,
    },
    JobCancelled {
        instance_id: String,
        reason: String,
    },
    RunCompleted {
        execution_id: Uuid,
        workflow: String,
        status: RunStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Shared list of event handlers
#[derive(Clone, Default)]
pub struct EventSink {
    handlers: Arc<RwLock<Vec<EventHandler>>>,
}

impl EventSink {
    pub fn add<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    pub fn emit(&self, event: ExecutionEvent) {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Workflow '{workflow}' is not triggered by {event} on {git_ref}")]
    NotTriggered {
        workflow: String,
        event: String,
        git_ref: String,
    },

    #[error("Invalid expression in {context}: {source}")]
    Expression {
        context: String,
        #[source]
        source: ExpressionError,
    },

    #[error("Run task failed: {0}")]
    Join(String),
}

/// Settings shared by every run of an engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Working directory for job steps
    pub workspace: PathBuf,

    /// Artifact staging root; a temp folder removed after the run when unset
    pub artifact_root: Option<PathBuf>,

    /// Branch that deploys are restricted to
    pub default_branch: String,

    /// Values exposed as `vars.*`
    pub vars: HashMap<String, String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            artifact_root: None,
            default_branch: "main".to_string(),
            vars: HashMap::new(),
        }
    }
}

/// Decision taken for a ready instance before it may start
enum Gate {
    Run(ExpressionContext),
    Skip(String),
    Cancel(String),
    Fail(String),
}

/// Main workflow execution engine
pub struct ExecutionEngine<R> {
    runner: Arc<R>,
    strategy: SchedulingStrategy,
    registry: Arc<ConcurrencyRegistry>,
    events: EventSink,
    options: Arc<EngineOptions>,
}

impl<R> Clone for ExecutionEngine<R> {
    fn clone(&self) -> Self {
        Self {
            runner: self.runner.clone(),
            strategy: self.strategy,
            registry: self.registry.clone(),
            events: self.events.clone(),
            options: self.options.clone(),
        }
    }
}

impl<R: StepRunner + 'static> ExecutionEngine<R> {
    pub fn new(runner: R, strategy: SchedulingStrategy) -> Self {
        Self {
            runner: Arc::new(runner),
            strategy,
            registry: Arc::new(ConcurrencyRegistry::new()),
            events: EventSink::default(),
            options: Arc::new(EngineOptions::default()),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = Arc::new(options);
        self
    }

    /// Share concurrency groups with another engine
    pub fn with_registry(mut self, registry: Arc<ConcurrencyRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> Arc<ConcurrencyRegistry> {
        self.registry.clone()
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.events.add(handler);
    }

    /// Run the workflow for `event` and return its final status
    pub async fn execute(
        &self,
        workflow: &mut Workflow,
        event: &TriggerEvent,
    ) -> Result<RunStatus, EngineError> {
        if !workflow.is_triggered_by(event) {
            return Err(EngineError::NotTriggered {
                workflow: workflow.name.clone(),
                event: event.kind.to_string(),
                git_ref: event.git_ref.clone(),
            });
        }

        let execution_id = workflow.state.execution_id;
        let mut base = ExpressionContext::for_run(
            &workflow.name,
            event,
            &self.options.default_branch,
            execution_id,
            &self.options.vars,
        );
        for (key, value) in &workflow.env {
            let rendered = base.render(value).map_err(|source| EngineError::Expression {
                context: format!("workflow env '{}'", key),
                source,
            })?;
            base.set_env(key, &rendered);
        }

        info!(
            "Starting workflow run: {} ({}) for {} on {}",
            workflow.name, execution_id, event.kind, event.git_ref
        );
        self.events.emit(ExecutionEvent::RunStarted {
            execution_id,
            workflow: workflow.name.clone(),
            total_jobs: workflow.instances.len(),
        });

        let mut run_cancel = CancelSignal::new();
        let _run_lease = match &workflow.concurrency {
            Some(policy) => {
                let group = base.render(&policy.group).map_err(|source| EngineError::Expression {
                    context: "workflow concurrency group".to_string(),
                    source,
                })?;
                let lease = self
                    .registry
                    .acquire(&group, policy.cancel_in_progress, || {
                        info!("Run {} waiting for concurrency group '{}'", execution_id, group);
                        self.events.emit(ExecutionEvent::RunWaiting {
                            execution_id,
                            group: group.clone(),
                        });
                    })
                    .await;
                run_cancel = run_cancel.with(
                    lease.cancel_flag(),
                    format!("Run superseded in concurrency group '{}'", group),
                );
                Some(lease)
            }
            None => None,
        };

        workflow.state.start(workflow.instances.len());

        let (artifact_root, temporary_root) = match &self.options.artifact_root {
            Some(root) => (root.join(execution_id.to_string()), false),
            None => (
                std::env::temp_dir()
                    .join("stagegate")
                    .join(execution_id.to_string()),
                true,
            ),
        };
        let artifacts = Arc::new(ArtifactStore::new(artifact_root));
        let executor = Arc::new(JobExecutor::new(
            self.runner.clone(),
            artifacts.clone(),
            self.registry.clone(),
            self.events.clone(),
        ));
        let scheduler = ExecutionScheduler::new(self.strategy);

        let fail_fast: HashMap<String, Arc<AtomicBool>> = workflow
            .jobs
            .values()
            .filter(|job| job.fail_fast)
            .map(|job| (job.id.clone(), Arc::new(AtomicBool::new(false))))
            .collect();

        let (tx, mut rx) = mpsc::unbounded_channel::<JobReport>();
        let mut in_flight = 0usize;
        let mut run_cancelled = false;

        // Main execution loop
        loop {
            if let Some(reason) = run_cancel.reason() {
                if !run_cancelled {
                    info!("Run {} cancelled: {}", execution_id, reason);
                    run_cancelled = true;
                }
                self.cancel_pending(workflow, reason);
            }

            self.resolve_gates(workflow, &base, &fail_fast);

            for instance_id in scheduler.next_instances(workflow) {
                let Some(plan) =
                    self.plan(workflow, &instance_id, &base, event, &run_cancel, &fail_fast)
                else {
                    continue;
                };
                if let Some(instance) = workflow.instance_mut(&instance_id) {
                    instance.state = JobState::Running {
                        started_at: Utc::now(),
                    };
                }
                in_flight += 1;
                self.spawn(executor.clone(), plan, tx.clone());
            }
            self.update_state_counts(workflow);

            if in_flight == 0 {
                break;
            }

            match rx.recv().await {
                Some(report) => {
                    in_flight -= 1;
                    self.apply_report(workflow, report, &artifacts, &fail_fast)
                        .await;
                }
                None => break,
            }
        }

        // Anything not finished can no longer become ready
        for instance in workflow.instances.values_mut() {
            if !instance.state.is_terminal() {
                warn!("Job {} never became ready", instance.id);
                instance.state = JobState::Skipped {
                    reason: "Never became ready".to_string(),
                };
            }
        }
        self.update_state_counts(workflow);

        let any_cancelled = workflow
            .instances
            .values()
            .any(|i| matches!(i.state, JobState::Cancelled { .. }));
        let status = if workflow.has_failed() {
            RunStatus::Failed
        } else if run_cancelled || any_cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        workflow.state.finish(status);

        if temporary_root {
            if let Err(e) = std::fs::remove_dir_all(artifacts.root()) {
                debug!("Artifact staging {} not removed: {}", artifacts.root().display(), e);
            }
        }

        info!(
            "Workflow run finished: {} - {}",
            workflow.name,
            status.as_str()
        );
        self.events.emit(ExecutionEvent::RunCompleted {
            execution_id,
            workflow: workflow.name.clone(),
            status,
        });

        Ok(status)
    }

    fn spawn(
        &self,
        executor: Arc<JobExecutor<R>>,
        plan: JobPlan,
        tx: mpsc::UnboundedSender<JobReport>,
    ) {
        tokio::spawn(async move {
            let instance_id = plan.instance_id.clone();
            let job_id = plan.job.id.clone();
            let handle = tokio::spawn(async move { executor.execute(plan).await });
            let report = match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!("Job {} task failed: {}", instance_id, e);
                    JobReport::crashed(&instance_id, &job_id, format!("Job task failed: {}", e))
                }
            };
            let _ = tx.send(report);
        });
    }

    /// Skip, cancel or fail ready instances that must not start, until
    /// nothing changes; skipping a job can make its dependents ready.
    fn resolve_gates(
        &self,
        workflow: &mut Workflow,
        base: &ExpressionContext,
        fail_fast: &HashMap<String, Arc<AtomicBool>>,
    ) {
        loop {
            let decisions: Vec<(String, Gate)> = workflow
                .ready_instances()
                .into_iter()
                .map(|instance| {
                    let gate = Self::gate(workflow, &instance.id, base, fail_fast);
                    (instance.id.clone(), gate)
                })
                .filter(|(_, gate)| !matches!(gate, Gate::Run(_)))
                .collect();

            if decisions.is_empty() {
                return;
            }

            for (instance_id, gate) in decisions {
                let Some(instance) = workflow.instance_mut(&instance_id) else {
                    continue;
                };
                match gate {
                    Gate::Skip(reason) => {
                        info!("Skipping job {}: {}", instance_id, reason);
                        instance.state = JobState::Skipped {
                            reason: reason.clone(),
                        };
                        self.events.emit(ExecutionEvent::JobSkipped {
                            instance_id,
                            reason,
                        });
                    }
                    Gate::Cancel(reason) => {
                        info!("Cancelling job {}: {}", instance_id, reason);
                        instance.state = JobState::Cancelled {
                            reason: reason.clone(),
                            cancelled_at: Utc::now(),
                        };
                        self.events.emit(ExecutionEvent::JobCancelled {
                            instance_id,
                            reason,
                        });
                    }
                    Gate::Fail(error) => {
                        warn!("Job {} failed before starting: {}", instance_id, error);
                        let now = Utc::now();
                        instance.state = JobState::Failed {
                            error: error.clone(),
                            started_at: now,
                            failed_at: now,
                        };
                        self.events.emit(ExecutionEvent::JobFailed { instance_id, error });
                    }
                    Gate::Run(_) => {}
                }
            }
        }
    }

    fn gate(
        workflow: &Workflow,
        instance_id: &str,
        base: &ExpressionContext,
        fail_fast: &HashMap<String, Arc<AtomicBool>>,
    ) -> Gate {
        let Some(instance) = workflow.instance(instance_id) else {
            return Gate::Fail(format!("Unknown job instance '{}'", instance_id));
        };
        let Some(job) = workflow.job(&instance.job_id) else {
            return Gate::Fail(format!("Unknown job '{}'", instance.job_id));
        };

        for need in &job.needs {
            match workflow.job_result(need) {
                Some(JobResult::Success) => {}
                Some(result) => {
                    return Gate::Skip(format!("Needed job '{}' result was {}", need, result))
                }
                None => return Gate::Skip(format!("Needed job '{}' has not finished", need)),
            }
        }

        if fail_fast
            .get(&job.id)
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
        {
            return Gate::Cancel("Another instance of the job failed (fail_fast)".to_string());
        }

        let mut ctx = base.clone();
        for need in &job.needs {
            if let Some(result) = workflow.job_result(need) {
                ctx.set_need(need, result, &workflow.job_outputs(need));
            }
        }
        ctx.set_matrix(&instance.matrix);
        for (key, value) in &job.env {
            match ctx.render(value) {
                Ok(rendered) => ctx.set_env(key, &rendered),
                Err(e) => return Gate::Fail(format!("Invalid env '{}': {}", key, e)),
            }
        }

        if let Some(condition) = &job.condition {
            if !ctx.evaluate(condition) {
                return Gate::Skip(format!("Condition '{}' was false", condition));
            }
        }

        Gate::Run(ctx)
    }

    fn plan(
        &self,
        workflow: &Workflow,
        instance_id: &str,
        base: &ExpressionContext,
        event: &TriggerEvent,
        run_cancel: &CancelSignal,
        fail_fast: &HashMap<String, Arc<AtomicBool>>,
    ) -> Option<JobPlan> {
        let Gate::Run(context) = Self::gate(workflow, instance_id, base, fail_fast) else {
            return None;
        };
        let instance = workflow.instance(instance_id)?;
        let job = workflow.job(&instance.job_id)?;

        let mut cancel = run_cancel.clone();
        if let Some(flag) = fail_fast.get(&job.id) {
            cancel = cancel.with(
                flag.clone(),
                "Another instance of the job failed (fail_fast)",
            );
        }

        Some(JobPlan {
            workflow: workflow.name.clone(),
            instance_id: instance_id.to_string(),
            job: job.clone(),
            matrix: instance.matrix.clone(),
            context,
            event: event.clone(),
            default_branch: self.options.default_branch.clone(),
            workspace: self.options.workspace.clone(),
            cancel,
        })
    }

    async fn apply_report(
        &self,
        workflow: &mut Workflow,
        report: JobReport,
        artifacts: &ArtifactStore,
        fail_fast: &HashMap<String, Arc<AtomicBool>>,
    ) {
        let JobReport {
            instance_id,
            job_id,
            outcome,
            outputs,
            diagnostics,
            environment_url,
            binding,
            started_at,
            finished_at,
        } = report;

        match &outcome {
            JobOutcome::Success => artifacts.seal(&instance_id).await,
            JobOutcome::Failed(_) | JobOutcome::Cancelled(_) => {
                let discarded = artifacts.discard(&instance_id).await;
                if !discarded.is_empty() {
                    debug!("Discarded artifacts of {}: {}", instance_id, discarded.join(", "));
                }
            }
        }

        let Some(instance) = workflow.instance_mut(&instance_id) else {
            error!("Report for unknown job instance {}", instance_id);
            return;
        };
        instance.diagnostics = diagnostics;
        instance.binding = binding;

        match outcome {
            JobOutcome::Success => {
                instance.state = JobState::Completed {
                    started_at,
                    completed_at: finished_at,
                };
                instance.outputs = outputs;
                instance.environment_url = environment_url.clone();
                self.events.emit(ExecutionEvent::JobCompleted {
                    instance_id,
                    environment_url,
                });
            }
            JobOutcome::Failed(error) => {
                instance.state = JobState::Failed {
                    error: error.clone(),
                    started_at,
                    failed_at: finished_at,
                };
                if let Some(flag) = fail_fast.get(&job_id) {
                    flag.store(true, Ordering::SeqCst);
                }
                self.events.emit(ExecutionEvent::JobFailed { instance_id, error });
            }
            JobOutcome::Cancelled(reason) => {
                instance.state = JobState::Cancelled {
                    reason: reason.clone(),
                    cancelled_at: finished_at,
                };
                self.events.emit(ExecutionEvent::JobCancelled {
                    instance_id,
                    reason,
                });
            }
        }

        self.update_state_counts(workflow);
    }

    fn cancel_pending(&self, workflow: &mut Workflow, reason: &str) {
        for instance in workflow.instances.values_mut() {
            if matches!(instance.state, JobState::Pending) {
                instance.state = JobState::Cancelled {
                    reason: reason.to_string(),
                    cancelled_at: Utc::now(),
                };
                self.events.emit(ExecutionEvent::JobCancelled {
                    instance_id: instance.id.clone(),
                    reason: reason.to_string(),
                });
            }
        }
    }

    /// Update state counts
    fn update_state_counts(&self, workflow: &mut Workflow) {
        let mut completed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        let mut running = 0;
        for instance in workflow.instances.values() {
            match instance.state {
                JobState::Completed { .. } => completed += 1,
                JobState::Failed { .. } | JobState::Cancelled { .. } => failed += 1,
                JobState::Skipped { .. } => skipped += 1,
                JobState::Running { .. } => running += 1,
                JobState::Pending => {}
            }
        }
        workflow.state.completed_jobs = completed;
        workflow.state.failed_jobs = failed;
        workflow.state.skipped_jobs = skipped;
        workflow.state.running_jobs = running;
    }
}
