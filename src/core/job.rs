//! Job domain model

use crate::core::{
    annotation::Diagnostic,
    condition::{Condition, ExpressionError},
    config::{ConcurrencyConfig, JobConfig, StepConfig},
    context::ExpressionContext,
    matrix::{Combination, Matrix},
    state::JobState,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Defaults a job inherits from its workflow
#[derive(Debug, Clone)]
pub struct JobDefaults {
    pub timeout_secs: u64,
}

/// Six hours, the step timeout when neither the step nor the workflow set one
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 21_600;

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
        }
    }
}

/// A job as declared in a workflow, before matrix expansion
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,

    pub name: String,

    /// Jobs that must succeed first
    pub needs: Vec<String>,

    pub condition: Option<Condition>,

    pub runtime: Option<RuntimeSpec>,

    pub steps: Vec<Step>,

    pub env: HashMap<String, String>,

    pub concurrency: Option<ConcurrencyPolicy>,

    pub environment: Option<DeploymentEnvironment>,

    /// Whether instances get a minted identity token
    pub id_token: bool,

    /// Output templates rendered once the instance succeeds
    pub outputs: HashMap<String, String>,

    /// Expanded matrix; empty for a job without a matrix
    pub matrix: Vec<Combination>,

    /// Cancel unfinished siblings when one instance fails
    pub fail_fast: bool,

    /// Cap on concurrently running instances of this job
    pub max_parallel: Option<usize>,

    /// Workflow default timeout, used for setup work outside any step
    pub timeout_secs: u64,
}

impl Job {
    pub fn from_config(config: &JobConfig, defaults: &JobDefaults) -> Result<Self> {
        let condition = config
            .condition
            .as_deref()
            .map(Condition::parse)
            .transpose()
            .with_context(|| format!("Job '{}' has an invalid 'if' condition", config.id))?;

        let steps = config
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                Step::from_config(step, defaults).with_context(|| {
                    format!("Job '{}' step {} is invalid", config.id, index + 1)
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let (matrix, fail_fast, max_parallel) = match &config.strategy {
            Some(strategy) => {
                let matrix = match &strategy.matrix {
                    Some(value) => Matrix::from_value(value)
                        .with_context(|| format!("Job '{}' has an invalid matrix", config.id))?
                        .expand(),
                    None => Vec::new(),
                };
                (matrix, strategy.fail_fast, strategy.max_parallel)
            }
            None => (Vec::new(), false, None),
        };

        Ok(Job {
            id: config.id.clone(),
            name: config.name.clone().unwrap_or_else(|| config.id.clone()),
            needs: config.needs.clone(),
            condition,
            runtime: config.runtime.as_ref().map(|r| RuntimeSpec {
                name: r.name.clone(),
                version: r.version.clone(),
                lockfile: r.lockfile.clone(),
                install: r.install.clone(),
            }),
            steps,
            env: config.env.clone(),
            concurrency: config.concurrency.as_ref().map(ConcurrencyPolicy::from_config),
            environment: config.environment.as_ref().map(|e| DeploymentEnvironment {
                name: e.name.clone(),
                url: e.url.clone(),
            }),
            id_token: config.permissions.id_token.as_deref() == Some("write"),
            outputs: config.outputs.clone(),
            matrix,
            fail_fast,
            max_parallel,
            timeout_secs: defaults.timeout_secs,
        })
    }

    /// One instance per matrix combination, or a single instance
    pub fn instances(&self) -> Vec<JobInstance> {
        if self.matrix.is_empty() {
            return vec![JobInstance::new(self.id.clone(), &self.id, Combination::new())];
        }

        let mut seen: HashMap<String, usize> = HashMap::new();
        self.matrix
            .iter()
            .map(|combination| {
                let base = format!("{} ({})", self.id, combination.label());
                let count = seen.entry(base.clone()).or_insert(0);
                *count += 1;
                let id = if *count == 1 {
                    base
                } else {
                    format!("{} #{}", base, count)
                };
                JobInstance::new(id, &self.id, combination.clone())
            })
            .collect()
    }
}

/// A single step of a job
#[derive(Debug, Clone)]
pub struct Step {
    /// Id used by `steps.<id>` expressions
    pub id: Option<String>,

    pub name: String,

    pub condition: Option<Condition>,

    pub env: HashMap<String, String>,

    pub timeout_secs: u64,

    pub kind: StepKind,
}

impl Step {
    pub fn from_config(config: &StepConfig, defaults: &JobDefaults) -> Result<Self> {
        let kind = config.action()?;
        let condition = config
            .condition
            .as_deref()
            .map(Condition::parse)
            .transpose()
            .context("Invalid 'if' condition")?;

        Ok(Step {
            id: config.id.clone(),
            name: config.name.clone().unwrap_or_else(|| kind.describe()),
            condition,
            env: config.env.clone(),
            timeout_secs: config.timeout_secs.unwrap_or(defaults.timeout_secs),
            kind,
        })
    }
}

/// What a step does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    /// Shell command
    Run { command: String },
    /// Stage files from the workspace into the run's artifact store
    UploadArtifact { name: String, path: String },
    /// Copy a sealed artifact into the workspace
    DownloadArtifact { name: String, path: String },
    /// Forward a coverage report to the aggregator
    ReportCoverage {
        file: String,
        token_env: String,
        flags: Vec<String>,
    },
    /// Trusted publish of a downloaded artifact to a package index
    PublishPackage {
        artifact: String,
        repository_url: Option<String>,
    },
    /// Publish an artifact to the docs host
    DeployPages { artifact: String },
}

impl StepKind {
    /// Default step name
    pub fn describe(&self) -> String {
        match self {
            StepKind::Run { command } => {
                let first = command.lines().next().unwrap_or("").trim();
                format!("Run {}", first)
            }
            StepKind::UploadArtifact { name, .. } => format!("Upload artifact {}", name),
            StepKind::DownloadArtifact { name, .. } => format!("Download artifact {}", name),
            StepKind::ReportCoverage { file, .. } => format!("Report coverage {}", file),
            StepKind::PublishPackage { artifact, .. } => format!("Publish {}", artifact),
            StepKind::DeployPages { artifact } => format!("Deploy {}", artifact),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            StepKind::Run { .. } => "run",
            StepKind::UploadArtifact { .. } => "upload_artifact",
            StepKind::DownloadArtifact { .. } => "download_artifact",
            StepKind::ReportCoverage { .. } => "report_coverage",
            StepKind::PublishPackage { .. } => "publish_package",
            StepKind::DeployPages { .. } => "deploy_pages",
        }
    }
}

/// Declared runtime for a job; `version` may reference `matrix.*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSpec {
    pub name: String,
    pub version: String,
    pub lockfile: Option<String>,
    /// Install command; `{version}` and `{lockfile}` are substituted
    pub install: Option<String>,
}

/// A runtime resolved for one job instance. Built once when the instance
/// starts and shared read-only by every step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentBinding {
    pub runtime: String,
    pub version: String,
    pub lockfile: Option<String>,
    pub install_command: Option<String>,
}

impl EnvironmentBinding {
    pub fn resolve(spec: &RuntimeSpec, ctx: &ExpressionContext) -> Result<Self, ExpressionError> {
        let version = ctx.render(&spec.version)?;
        let install_command = spec
            .install
            .as_deref()
            .map(|install| {
                let substituted = install
                    .replace("{version}", &version)
                    .replace("{lockfile}", spec.lockfile.as_deref().unwrap_or(""));
                ctx.render(&substituted)
            })
            .transpose()?;

        Ok(Self {
            runtime: spec.name.clone(),
            version,
            lockfile: spec.lockfile.clone(),
            install_command,
        })
    }

    /// Variables exported to every step of the instance
    pub fn env_vars(&self) -> HashMap<String, String> {
        let mut vars = HashMap::from([
            ("STAGEGATE_RUNTIME".to_string(), self.runtime.clone()),
            ("STAGEGATE_RUNTIME_VERSION".to_string(), self.version.clone()),
        ]);
        if let Some(lockfile) = &self.lockfile {
            vars.insert("STAGEGATE_LOCKFILE".to_string(), lockfile.clone());
        }
        vars
    }

    pub fn label(&self) -> String {
        format!("{} {}", self.runtime, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyPolicy {
    /// Group name template
    pub group: String,
    pub cancel_in_progress: bool,
}

impl ConcurrencyPolicy {
    pub fn from_config(config: &ConcurrencyConfig) -> Self {
        match config {
            ConcurrencyConfig::Group(group) => Self {
                group: group.clone(),
                cancel_in_progress: false,
            },
            ConcurrencyConfig::Policy {
                group,
                cancel_in_progress,
            } => Self {
                group: group.clone(),
                cancel_in_progress: *cancel_in_progress,
            },
        }
    }
}

/// Deployment environment a job targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentEnvironment {
    pub name: String,
    /// URL template, usually `${{ steps.<id>.outputs.page_url }}`
    pub url: Option<String>,
}

/// One expansion of a job for a single matrix combination
#[derive(Debug, Clone)]
pub struct JobInstance {
    /// `test (3.12)`, or the job id when there is no matrix
    pub id: String,

    pub job_id: String,

    pub matrix: Combination,

    pub state: JobState,

    /// Rendered job outputs
    pub outputs: HashMap<String, String>,

    pub diagnostics: Vec<Diagnostic>,

    /// Rendered URL of the deployment environment
    pub environment_url: Option<String>,

    pub binding: Option<EnvironmentBinding>,
}

impl JobInstance {
    pub fn new(id: String, job_id: &str, matrix: Combination) -> Self {
        Self {
            id,
            job_id: job_id.to_string(),
            matrix,
            state: JobState::Pending,
            outputs: HashMap::new(),
            diagnostics: Vec::new(),
            environment_url: None,
            binding: None,
        }
    }
}
