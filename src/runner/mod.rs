//! Step runners: the seam between the engine and the outside world

pub mod config;
pub mod response;
pub mod services;
pub mod shell;

use crate::core::{identity::IdentityToken, job::EnvironmentBinding};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

pub use config::RunnerConfig;
pub use response::{RunnerError, StepOutput};
pub use services::ServiceClient;
pub use shell::ShellClient;

/// Trait for step execution - allows for different implementations
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run one step action and report its outcome
    async fn run(&self, invocation: &StepInvocation) -> Result<StepOutput, RunnerError>;
}

/// Everything a runner needs to execute one step of one job instance
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub workflow: String,

    /// Job instance id, e.g. `test (3.12)`
    pub job: String,

    /// Step name
    pub step: String,

    pub action: StepAction,

    /// Fully rendered environment for the step
    pub env: HashMap<String, String>,

    pub working_dir: PathBuf,
}

/// Side effects delegated to the runner. Artifact hand-off is handled
/// by the engine itself and never reaches a runner.
#[derive(Debug, Clone)]
pub enum StepAction {
    /// Install the instance's runtime and locked dependencies
    Provision { binding: EnvironmentBinding },

    /// Rendered shell command
    Run { command: String },

    ReportCoverage {
        file: PathBuf,
        token: String,
        flags: Vec<String>,
        sha: String,
    },

    /// Staged files of a downloaded, sealed artifact
    PublishPackage {
        artifact: String,
        files: Vec<PathBuf>,
        repository_url: Option<String>,
        identity: IdentityToken,
    },

    DeployPages {
        artifact: String,
        files: Vec<String>,
        sha: String,
    },
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::Provision { .. } => "provision",
            StepAction::Run { .. } => "run",
            StepAction::ReportCoverage { .. } => "report_coverage",
            StepAction::PublishPackage { .. } => "publish_package",
            StepAction::DeployPages { .. } => "deploy_pages",
        }
    }
}

/// Runner that executes commands on this machine and calls the configured services
#[derive(Debug, Clone)]
pub struct LocalRunner {
    shell: ShellClient,
    services: ServiceClient,
}

impl LocalRunner {
    pub fn new(config: &RunnerConfig) -> Result<Self, RunnerError> {
        Ok(Self {
            shell: ShellClient::new(config.shell.clone()),
            services: ServiceClient::new(config)?,
        })
    }
}

#[async_trait]
impl StepRunner for LocalRunner {
    async fn run(&self, invocation: &StepInvocation) -> Result<StepOutput, RunnerError> {
        let env = &invocation.env;
        let dir = &invocation.working_dir;
        match &invocation.action {
            StepAction::Provision { binding } => match &binding.install_command {
                Some(command) => self.shell.execute(command, env, dir).await,
                None => Ok(StepOutput::success(format!("Using {}", binding.label()))),
            },
            StepAction::Run { command } => self.shell.execute(command, env, dir).await,
            StepAction::ReportCoverage {
                file,
                token,
                flags,
                sha,
            } => {
                self.services
                    .upload_coverage(&dir.join(file), token, flags, sha)
                    .await?;
                Ok(StepOutput::success(format!("Uploaded {}", file.display())))
            }
            StepAction::PublishPackage {
                files,
                repository_url,
                identity,
                ..
            } => {
                let uploaded = self
                    .services
                    .publish(files, repository_url.as_deref(), identity)
                    .await?;
                Ok(StepOutput::success(uploaded.join("\n")))
            }
            StepAction::DeployPages {
                artifact,
                files,
                sha,
            } => {
                let page_url = self.services.deploy_pages(artifact, files, sha).await?;
                Ok(StepOutput::success(format!("Deployed to {}", page_url))
                    .with_output("page_url", page_url))
            }
        }
    }
}
