//! Job executor - runs the steps of one job instance

use crate::{
    core::{
        annotation::{parse_output, Diagnostic, WorkflowCommand},
        artifact::{ArtifactBundle, ArtifactError, ArtifactStore},
        condition::ExpressionError,
        identity::{IdentityToken, DEFAULT_TOKEN_TTL_SECS, PACKAGE_INDEX_AUDIENCE},
        matrix::Combination,
        EnvironmentBinding, EventKind, ExpressionContext, Job, Step, StepKind, TriggerEvent,
    },
    execution::{
        concurrency::{CancelSignal, ConcurrencyLease, ConcurrencyRegistry},
        engine::{EventSink, ExecutionEvent},
    },
    runner::{RunnerError, StepAction, StepInvocation, StepOutput, StepRunner},
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

/// Why a step did not produce an output
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("Coverage token variable '{0}' is not set")]
    MissingCoverageToken(String),

    #[error("Refusing to publish: artifact '{0}' was not downloaded by this job")]
    NotDownloaded(String),

    #[error("Refusing to deploy: run was triggered by {event} on {git_ref}, deploys only run on push to '{branch}'")]
    DeployRefused {
        event: EventKind,
        git_ref: String,
        branch: String,
    },
}

/// Job failure message for a step that ended with `error`
fn failure_reason(step_name: &str, error: &StepError) -> String {
    match error {
        StepError::Runner(RunnerError::Timeout(_)) => format!("Step '{}' {}", step_name, error),
        _ => format!("Step '{}' failed: {}", step_name, error),
    }
}

/// Everything needed to run one job instance
#[derive(Debug, Clone)]
pub struct JobPlan {
    pub workflow: String,
    pub instance_id: String,
    pub job: Job,
    pub matrix: Combination,
    /// Context with `github`, `vars`, `needs`, `matrix` and `env` already set
    pub context: ExpressionContext,
    pub event: TriggerEvent,
    pub default_branch: String,
    pub workspace: PathBuf,
    pub cancel: CancelSignal,
}

/// How a job instance ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failed(String),
    Cancelled(String),
}

/// What the executor reports back to the engine
#[derive(Debug, Clone)]
pub struct JobReport {
    pub instance_id: String,
    pub job_id: String,
    pub outcome: JobOutcome,
    pub outputs: HashMap<String, String>,
    pub diagnostics: Vec<Diagnostic>,
    pub environment_url: Option<String>,
    pub binding: Option<EnvironmentBinding>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobReport {
    fn new(plan: &JobPlan) -> Self {
        let now = Utc::now();
        Self {
            instance_id: plan.instance_id.clone(),
            job_id: plan.job.id.clone(),
            outcome: JobOutcome::Success,
            outputs: HashMap::new(),
            diagnostics: Vec::new(),
            environment_url: None,
            binding: None,
            started_at: now,
            finished_at: now,
        }
    }

    /// Report for an instance whose task died before reporting
    pub fn crashed(instance_id: &str, job_id: &str, error: String) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.to_string(),
            job_id: job_id.to_string(),
            outcome: JobOutcome::Failed(error),
            outputs: HashMap::new(),
            diagnostics: Vec::new(),
            environment_url: None,
            binding: None,
            started_at: now,
            finished_at: now,
        }
    }

    fn finish(mut self, outcome: JobOutcome) -> Self {
        self.outcome = outcome;
        self.finished_at = Utc::now();
        self
    }
}

/// State threaded through the steps of one instance
struct RunningJob {
    context: ExpressionContext,
    env: HashMap<String, String>,
    identity: Option<IdentityToken>,
    /// Artifacts this instance downloaded, by name
    downloaded: HashMap<String, ArtifactBundle>,
}

/// Executes job instances
pub struct JobExecutor<R> {
    runner: Arc<R>,
    artifacts: Arc<ArtifactStore>,
    registry: Arc<ConcurrencyRegistry>,
    events: EventSink,
}

impl<R: StepRunner> JobExecutor<R> {
    pub fn new(
        runner: Arc<R>,
        artifacts: Arc<ArtifactStore>,
        registry: Arc<ConcurrencyRegistry>,
        events: EventSink,
    ) -> Self {
        Self {
            runner,
            artifacts,
            registry,
            events,
        }
    }

    /// Run the instance to completion. Failures are reported as data; the
    /// first failing step ends the instance.
    pub async fn execute(&self, plan: JobPlan) -> JobReport {
        let mut report = JobReport::new(&plan);
        let id = plan.instance_id.clone();

        let mut cancel = plan.cancel.clone();
        let _lease: Option<ConcurrencyLease> = match &plan.job.concurrency {
            Some(policy) => {
                let group = match plan.context.render(&policy.group) {
                    Ok(group) => group,
                    Err(e) => {
                        let error = format!("Invalid concurrency group: {}", e);
                        return report.finish(JobOutcome::Failed(error));
                    }
                };
                let lease = self
                    .registry
                    .acquire(&group, policy.cancel_in_progress, || {
                        info!("Job {} waiting for concurrency group '{}'", id, group);
                        self.events.emit(ExecutionEvent::JobWaiting {
                            instance_id: id.clone(),
                            group: group.clone(),
                        });
                    })
                    .await;
                cancel = cancel.with(
                    lease.cancel_flag(),
                    format!("Superseded in concurrency group '{}'", group),
                );
                Some(lease)
            }
            None => None,
        };

        if let Some(reason) = cancel.reason() {
            return report.finish(JobOutcome::Cancelled(reason.to_string()));
        }

        report.started_at = Utc::now();
        info!("Starting job {}", id);
        self.events.emit(ExecutionEvent::JobStarted {
            instance_id: id.clone(),
        });

        let mut env = plan.context.env_vars();
        env.insert("CI".to_string(), "true".to_string());
        env.insert("STAGEGATE_WORKFLOW".to_string(), plan.workflow.clone());
        env.insert("STAGEGATE_JOB".to_string(), id.clone());
        env.insert("STAGEGATE_SHA".to_string(), plan.event.sha.clone());

        let mut job = RunningJob {
            context: plan.context.clone(),
            env,
            identity: None,
            downloaded: HashMap::new(),
        };

        if let Some(spec) = &plan.job.runtime {
            let binding = match EnvironmentBinding::resolve(spec, &job.context) {
                Ok(binding) => binding,
                Err(e) => {
                    let error = format!("Failed to resolve runtime: {}", e);
                    return report.finish(JobOutcome::Failed(error));
                }
            };
            job.env.extend(binding.env_vars());

            let step_name = format!("Set up {}", binding.label());
            self.events.emit(ExecutionEvent::StepStarted {
                instance_id: id.clone(),
                step: step_name.clone(),
            });
            let action = StepAction::Provision {
                binding: binding.clone(),
            };
            let result = self
                .invoke(&plan, &step_name, action, job.env.clone(), plan.job.timeout_secs)
                .await;
            report.binding = Some(binding);
            if let Err(error) = self.conclude(&id, &step_name, None, result, &mut job, &mut report) {
                return report.finish(JobOutcome::Failed(error));
            }
        }

        if plan.job.id_token {
            let subject = format!("{}:{}@{}", plan.workflow, id, plan.event.git_ref);
            job.identity = Some(IdentityToken::mint(
                PACKAGE_INDEX_AUDIENCE,
                &subject,
                chrono::Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
            ));
            debug!("Minted identity token for {}", subject);
        }

        for step in &plan.job.steps {
            if let Some(reason) = cancel.reason() {
                info!("Job {} cancelled: {}", id, reason);
                return report.finish(JobOutcome::Cancelled(reason.to_string()));
            }

            if let Some(condition) = &step.condition {
                if !job.context.evaluate(condition) {
                    debug!("Skipping step '{}' of {}: {} is false", step.name, id, condition);
                    if let Some(step_id) = &step.id {
                        job.context.set_step(step_id, "skipped", &HashMap::new());
                    }
                    self.events.emit(ExecutionEvent::StepFinished {
                        instance_id: id.clone(),
                        step: step.name.clone(),
                        outcome: "skipped",
                    });
                    continue;
                }
            }

            self.events.emit(ExecutionEvent::StepStarted {
                instance_id: id.clone(),
                step: step.name.clone(),
            });
            let result = self.run_step(&plan, step, &mut job).await;
            let concluded =
                self.conclude(&id, &step.name, step.id.as_deref(), result, &mut job, &mut report);
            if let Err(error) = concluded {
                return report.finish(JobOutcome::Failed(error));
            }
        }

        if let Some(url) = plan.job.environment.as_ref().and_then(|e| e.url.as_deref()) {
            match job.context.render(url) {
                Ok(rendered) if !rendered.is_empty() => report.environment_url = Some(rendered),
                Ok(_) => {}
                Err(e) => warn!("Job {} environment URL did not render: {}", id, e),
            }
        }
        for (key, template) in &plan.job.outputs {
            match job.context.render(template) {
                Ok(value) => {
                    report.outputs.insert(key.clone(), value);
                }
                Err(e) => warn!("Job {} output '{}' did not render: {}", id, key, e),
            }
        }

        info!("Job {} succeeded", id);
        report.finish(JobOutcome::Success)
    }

    /// Record a step result; `Err` carries the job failure message
    fn conclude(
        &self,
        instance_id: &str,
        step_name: &str,
        step_id: Option<&str>,
        result: Result<StepOutput, StepError>,
        job: &mut RunningJob,
        report: &mut JobReport,
    ) -> Result<(), String> {
        let failure = match result {
            Ok(output) => {
                let mut outputs = output.outputs.clone();
                for text in [&output.stdout, &output.stderr] {
                    for command in parse_output(text) {
                        match command {
                            WorkflowCommand::SetOutput { name, value } => {
                                outputs.insert(name, value);
                            }
                            WorkflowCommand::Annotation(diagnostic) => {
                                self.events.emit(ExecutionEvent::Annotation {
                                    instance_id: instance_id.to_string(),
                                    diagnostic: diagnostic.clone(),
                                });
                                report.diagnostics.push(diagnostic);
                            }
                        }
                    }
                }

                if output.is_success() {
                    if let Some(step_id) = step_id {
                        job.context.set_step(step_id, "success", &outputs);
                    }
                    None
                } else {
                    let stderr = output.stderr.trim();
                    Some(if stderr.is_empty() {
                        format!("Step '{}' exited with code {}", step_name, output.exit_code)
                    } else {
                        format!(
                            "Step '{}' exited with code {}: {}",
                            step_name,
                            output.exit_code,
                            last_line(stderr)
                        )
                    })
                }
            }
            Err(error) => Some(failure_reason(step_name, &error)),
        };

        let outcome = if failure.is_some() { "failure" } else { "success" };
        self.events.emit(ExecutionEvent::StepFinished {
            instance_id: instance_id.to_string(),
            step: step_name.to_string(),
            outcome,
        });

        match failure {
            Some(error) => {
                warn!("Job {} failed at step '{}': {}", instance_id, step_name, error);
                if let Some(step_id) = step_id {
                    job.context.set_step(step_id, "failure", &HashMap::new());
                }
                Err(error)
            }
            None => Ok(()),
        }
    }

    async fn run_step(
        &self,
        plan: &JobPlan,
        step: &Step,
        job: &mut RunningJob,
    ) -> Result<StepOutput, StepError> {
        let mut env = job.env.clone();
        for (key, value) in &step.env {
            env.insert(key.clone(), job.context.render(value)?);
        }

        let action = match &step.kind {
            StepKind::Run { command } => {
                let command = job.context.render(command)?;
                debug!("Rendered command for '{}': {}", step.name, command);
                StepAction::Run { command }
            }
            StepKind::UploadArtifact { name, path } => {
                let name = job.context.render(name)?;
                let source = plan.workspace.join(job.context.render(path)?);
                let bundle = self
                    .artifacts
                    .upload(&name, &plan.instance_id, &source)
                    .await?;
                return Ok(StepOutput::success(format!(
                    "Uploaded {} files ({} bytes) as '{}'",
                    bundle.files.len(),
                    bundle.size_bytes,
                    name
                )));
            }
            StepKind::DownloadArtifact { name, path } => {
                let name = job.context.render(name)?;
                let dest = plan.workspace.join(job.context.render(path)?);
                let bundle = self.artifacts.download(&name, &dest).await?;
                let message = format!("Downloaded {} files of '{}'", bundle.files.len(), name);
                job.downloaded.insert(name, bundle);
                return Ok(StepOutput::success(message));
            }
            StepKind::ReportCoverage {
                file,
                token_env,
                flags,
            } => {
                let token = env
                    .get(token_env)
                    .filter(|t| !t.is_empty())
                    .cloned()
                    .or_else(|| std::env::var(token_env).ok().filter(|t| !t.is_empty()))
                    .ok_or_else(|| StepError::MissingCoverageToken(token_env.clone()))?;
                let flags = flags
                    .iter()
                    .map(|flag| job.context.render(flag))
                    .collect::<Result<Vec<_>, _>>()?;
                StepAction::ReportCoverage {
                    file: PathBuf::from(job.context.render(file)?),
                    token,
                    flags,
                    sha: plan.event.sha.clone(),
                }
            }
            StepKind::PublishPackage {
                artifact,
                repository_url,
            } => {
                let bundle = job
                    .downloaded
                    .get(artifact)
                    .ok_or_else(|| StepError::NotDownloaded(artifact.clone()))?;
                let identity = job.identity.clone().ok_or(RunnerError::MissingIdentity)?;
                let repository_url = repository_url
                    .as_deref()
                    .map(|url| job.context.render(url))
                    .transpose()?;
                StepAction::PublishPackage {
                    artifact: artifact.clone(),
                    files: bundle.file_paths(),
                    repository_url,
                    identity,
                }
            }
            StepKind::DeployPages { artifact } => {
                if !plan.event.is_push_to(&plan.default_branch) {
                    return Err(StepError::DeployRefused {
                        event: plan.event.kind,
                        git_ref: plan.event.git_ref.clone(),
                        branch: plan.default_branch.clone(),
                    });
                }
                let bundle = self.artifacts.get(artifact).await?;
                StepAction::DeployPages {
                    artifact: artifact.clone(),
                    files: bundle
                        .files
                        .iter()
                        .map(|f| f.to_string_lossy().into_owned())
                        .collect(),
                    sha: plan.event.sha.clone(),
                }
            }
        };

        self.invoke(plan, &step.name, action, env, step.timeout_secs)
            .await
    }

    /// Hand an action to the runner under the step timeout
    async fn invoke(
        &self,
        plan: &JobPlan,
        step_name: &str,
        action: StepAction,
        env: HashMap<String, String>,
        timeout_secs: u64,
    ) -> Result<StepOutput, StepError> {
        let invocation = StepInvocation {
            workflow: plan.workflow.clone(),
            job: plan.instance_id.clone(),
            step: step_name.to_string(),
            action,
            env,
            working_dir: plan.workspace.clone(),
        };

        match timeout(Duration::from_secs(timeout_secs), self.runner.run(&invocation)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => {
                error!("Runner error in {} step '{}': {}", plan.instance_id, step_name, e);
                Err(e.into())
            }
            Err(_) => {
                error!(
                    "Timeout for {} step '{}' after {}s",
                    plan.instance_id, step_name, timeout_secs
                );
                Err(RunnerError::Timeout(timeout_secs).into())
            }
        }
    }
}

fn last_line(text: &str) -> &str {
    text.lines().last().unwrap_or(text)
}
