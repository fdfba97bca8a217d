//! Workflow configuration from YAML

use crate::core::{
    artifact::check_artifact_name,
    condition::{check_template, Condition},
    job::StepKind,
    matrix::{scalar_to_string, Matrix},
    trigger::Triggers,
    workflow::Workflow,
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Top-level workflow configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Workflow name
    pub name: String,

    /// Trigger declaration: a string, a list of event names or a mapping
    #[serde(rename = "on", default)]
    pub on: Value,

    /// Environment variables for every job
    #[serde(default, deserialize_with = "scalar_map")]
    pub env: HashMap<String, String>,

    /// Workflow-level concurrency group, serializing whole runs
    #[serde(default)]
    pub concurrency: Option<ConcurrencyConfig>,

    /// Default timeout for steps (in seconds)
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,

    pub jobs: Vec<JobConfig>,
}

/// `concurrency: pages` or `concurrency: { group: pages, cancel_in_progress: false }`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ConcurrencyConfig {
    Group(String),
    Policy {
        group: String,
        #[serde(default)]
        cancel_in_progress: bool,
    },
}

impl ConcurrencyConfig {
    pub fn group(&self) -> &str {
        match self {
            ConcurrencyConfig::Group(group) => group,
            ConcurrencyConfig::Policy { group, .. } => group,
        }
    }
}

/// Job configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Unique job identifier
    pub id: String,

    /// Human-readable job name
    #[serde(default)]
    pub name: Option<String>,

    /// Jobs that must succeed before this one starts
    #[serde(default, alias = "depends_on")]
    pub needs: Vec<String>,

    /// Condition deciding whether the job runs at all
    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    #[serde(default)]
    pub runtime: Option<RuntimeConfig>,

    #[serde(default)]
    pub strategy: Option<StrategyConfig>,

    #[serde(default)]
    pub permissions: PermissionsConfig,

    #[serde(default)]
    pub environment: Option<EnvironmentConfig>,

    #[serde(default)]
    pub concurrency: Option<ConcurrencyConfig>,

    #[serde(default, deserialize_with = "scalar_map")]
    pub env: HashMap<String, String>,

    /// Output templates exposed to dependent jobs as `needs.<id>.outputs`
    #[serde(default, deserialize_with = "scalar_map")]
    pub outputs: HashMap<String, String>,

    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub name: String,

    /// Version, usually `${{ matrix.<axis> }}`; quote numeric versions
    #[serde(deserialize_with = "scalar_string")]
    pub version: String,

    #[serde(default)]
    pub lockfile: Option<String>,

    #[serde(default)]
    pub install: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default)]
    pub matrix: Option<Value>,

    #[serde(default)]
    pub fail_fast: bool,

    #[serde(default)]
    pub max_parallel: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionsConfig {
    /// `write` to have the engine mint an identity token
    #[serde(default)]
    pub id_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// Step configuration; exactly one action key must be set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    #[serde(default, deserialize_with = "scalar_map")]
    pub env: HashMap<String, String>,

    /// Timeout for this step (overrides the workflow default)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub run: Option<String>,

    #[serde(default)]
    pub upload_artifact: Option<ArtifactConfig>,

    #[serde(default)]
    pub download_artifact: Option<ArtifactConfig>,

    #[serde(default)]
    pub report_coverage: Option<CoverageConfig>,

    #[serde(default)]
    pub publish_package: Option<PublishConfig>,

    #[serde(default)]
    pub deploy_pages: Option<DeployConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageConfig {
    pub file: String,
    /// Environment variable holding the upload token
    pub token_env: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    pub artifact: String,
    #[serde(default)]
    pub repository_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    pub artifact: String,
}

impl StepConfig {
    /// The single action this step performs
    pub fn action(&self) -> Result<StepKind> {
        let mut actions = Vec::new();
        if let Some(command) = &self.run {
            actions.push(StepKind::Run {
                command: command.clone(),
            });
        }
        if let Some(a) = &self.upload_artifact {
            actions.push(StepKind::UploadArtifact {
                name: a.name.clone(),
                path: a.path.clone(),
            });
        }
        if let Some(a) = &self.download_artifact {
            actions.push(StepKind::DownloadArtifact {
                name: a.name.clone(),
                path: a.path.clone(),
            });
        }
        if let Some(c) = &self.report_coverage {
            actions.push(StepKind::ReportCoverage {
                file: c.file.clone(),
                token_env: c.token_env.clone(),
                flags: c.flags.clone(),
            });
        }
        if let Some(p) = &self.publish_package {
            actions.push(StepKind::PublishPackage {
                artifact: p.artifact.clone(),
                repository_url: p.repository_url.clone(),
            });
        }
        if let Some(d) = &self.deploy_pages {
            actions.push(StepKind::DeployPages {
                artifact: d.artifact.clone(),
            });
        }

        match actions.len() {
            0 => bail!("Step has no action (expected one of run, upload_artifact, download_artifact, report_coverage, publish_package, deploy_pages)"),
            1 => Ok(actions.remove(0)),
            _ => {
                let names: Vec<&str> = actions.iter().map(|a| a.kind_name()).collect();
                bail!("Step has more than one action: {}", names.join(", "))
            }
        }
    }

    /// Label for error messages: id, then name, then position
    fn label(&self, index: usize) -> String {
        self.id
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| format!("#{}", index + 1))
    }

    /// Every template string the step carries
    fn templates(&self) -> Vec<&str> {
        let mut templates: Vec<&str> = self.env.values().map(String::as_str).collect();
        if let Some(command) = &self.run {
            templates.push(command);
        }
        for artifact in [&self.upload_artifact, &self.download_artifact]
            .into_iter()
            .flatten()
        {
            templates.push(&artifact.name);
            templates.push(&artifact.path);
        }
        if let Some(coverage) = &self.report_coverage {
            templates.push(&coverage.file);
            templates.extend(coverage.flags.iter().map(String::as_str));
        }
        if let Some(url) = self
            .publish_package
            .as_ref()
            .and_then(|p| p.repository_url.as_deref())
        {
            templates.push(url);
        }
        templates
    }

    /// Artifact names this step refers to
    fn artifact_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for artifact in [&self.upload_artifact, &self.download_artifact]
            .into_iter()
            .flatten()
        {
            names.push(artifact.name.as_str());
        }
        if let Some(p) = &self.publish_package {
            names.push(&p.artifact);
        }
        if let Some(d) = &self.deploy_pages {
            names.push(&d.artifact);
        }
        names
    }
}

impl WorkflowConfig {
    /// Load workflow configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid workflow {}", path.display()))
    }

    /// Parse workflow configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WorkflowConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed trigger declaration
    pub fn triggers(&self) -> Result<Triggers> {
        Triggers::from_value(&self.on)
            .with_context(|| format!("Workflow '{}' has an invalid 'on' section", self.name))
    }

    /// Validate the workflow configuration
    pub fn validate(&self) -> Result<()> {
        self.triggers()?;

        if self.jobs.is_empty() {
            bail!("Workflow '{}' has no jobs", self.name);
        }

        // Check that all job IDs are unique
        let mut seen_ids = HashSet::new();
        for job in &self.jobs {
            if !seen_ids.insert(job.id.as_str()) {
                bail!("Duplicate job ID: {}", job.id);
            }
        }

        // Check that all needs reference existing jobs
        for job in &self.jobs {
            for dep in &job.needs {
                if !seen_ids.contains(dep.as_str()) {
                    bail!("Job '{}' needs non-existent job '{}'", job.id, dep);
                }
            }
        }

        self.check_cycles()?;

        for (key, value) in &self.env {
            check_template(value)
                .with_context(|| format!("Workflow env '{}' has an invalid expression", key))?;
        }
        if let Some(concurrency) = &self.concurrency {
            check_template(concurrency.group())
                .context("Workflow concurrency group has an invalid expression")?;
        }

        for job in &self.jobs {
            self.validate_job(job)?;
        }

        Ok(())
    }

    fn validate_job(&self, job: &JobConfig) -> Result<()> {
        if job.steps.is_empty() {
            bail!("Job '{}' has no steps", job.id);
        }

        if let Some(condition) = &job.condition {
            Condition::parse(condition)
                .with_context(|| format!("Job '{}' has an invalid 'if' condition", job.id))?;
        }

        if let Some(strategy) = &job.strategy {
            if let Some(value) = &strategy.matrix {
                let matrix = Matrix::from_value(value)
                    .with_context(|| format!("Job '{}' has an invalid matrix", job.id))?;
                if matrix.expand().is_empty() {
                    bail!("Job '{}' matrix has no combinations", job.id);
                }
            }
            if strategy.max_parallel == Some(0) {
                bail!("Job '{}' max_parallel must be at least 1", job.id);
            }
        }

        let mut job_templates: Vec<(&str, &str)> = job
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .chain(job.outputs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .collect();
        if let Some(concurrency) = &job.concurrency {
            job_templates.push(("concurrency", concurrency.group()));
        }
        if let Some(url) = job.environment.as_ref().and_then(|e| e.url.as_deref()) {
            job_templates.push(("environment.url", url));
        }
        if let Some(runtime) = &job.runtime {
            job_templates.push(("runtime.version", &runtime.version));
        }
        for (key, template) in job_templates {
            check_template(template)
                .with_context(|| format!("Job '{}' '{}' has an invalid expression", job.id, key))?;
        }

        let predecessors = self.transitive_needs(&job.id);
        let available: HashSet<&str> = self
            .jobs
            .iter()
            .filter(|j| predecessors.contains(j.id.as_str()))
            .flat_map(|j| j.steps.iter())
            .filter_map(|s| s.upload_artifact.as_ref().map(|a| a.name.as_str()))
            .collect();

        let mut step_ids = HashSet::new();
        let mut downloaded: HashSet<String> = HashSet::new();
        for (index, step) in job.steps.iter().enumerate() {
            let label = step.label(index);
            let kind = step
                .action()
                .with_context(|| format!("Job '{}' step '{}' is invalid", job.id, label))?;

            if let Some(id) = &step.id {
                if !step_ids.insert(id.as_str()) {
                    bail!("Job '{}' has duplicate step ID '{}'", job.id, id);
                }
            }
            if let Some(condition) = &step.condition {
                Condition::parse(condition).with_context(|| {
                    format!("Job '{}' step '{}' has an invalid 'if' condition", job.id, label)
                })?;
            }
            for template in step.templates() {
                check_template(template).with_context(|| {
                    format!("Job '{}' step '{}' has an invalid expression", job.id, label)
                })?;
            }
            for name in step.artifact_names() {
                if let Err(e) = check_artifact_name(name) {
                    bail!("Job '{}' step '{}': {}", job.id, label, e);
                }
            }

            match &kind {
                StepKind::DownloadArtifact { name, .. } => {
                    if !available.contains(name.as_str()) {
                        bail!(
                            "Job '{}' step '{}' downloads artifact '{}' which no predecessor job uploads",
                            job.id,
                            label,
                            name
                        );
                    }
                    downloaded.insert(name.clone());
                }
                StepKind::PublishPackage { artifact, .. } => {
                    if !downloaded.contains(artifact.as_str()) {
                        bail!(
                            "Job '{}' step '{}' publishes artifact '{}' which the job has not downloaded from a predecessor",
                            job.id,
                            label,
                            artifact
                        );
                    }
                }
                StepKind::DeployPages { artifact } => {
                    if !available.contains(artifact.as_str()) {
                        bail!(
                            "Job '{}' step '{}' deploys artifact '{}' which no predecessor job uploads",
                            job.id,
                            label,
                            artifact
                        );
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Every job reachable through `needs` from `job_id`
    fn transitive_needs(&self, job_id: &str) -> HashSet<&str> {
        let mut found = HashSet::new();
        let mut stack = vec![job_id];
        while let Some(current) = stack.pop() {
            if let Some(job) = self.jobs.iter().find(|j| j.id == current) {
                for dep in &job.needs {
                    if found.insert(dep.as_str()) {
                        stack.push(dep.as_str());
                    }
                }
            }
        }
        found
    }

    /// Check for cycles in the job dependency graph
    fn check_cycles(&self) -> Result<()> {
        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();

        for job in &self.jobs {
            if !visited.contains(&job.id) {
                self.dfs_check(&job.id, &mut visited, &mut recursion_stack)?;
            }
        }

        Ok(())
    }

    fn dfs_check(
        &self,
        job_id: &str,
        visited: &mut HashSet<String>,
        recursion_stack: &mut HashSet<String>,
    ) -> Result<()> {
        visited.insert(job_id.to_string());
        recursion_stack.insert(job_id.to_string());

        if let Some(job) = self.jobs.iter().find(|j| j.id == job_id) {
            for dep in &job.needs {
                if recursion_stack.contains(dep) {
                    bail!("Cycle detected in dependency graph involving job '{}'", dep);
                }
                if !visited.contains(dep) {
                    self.dfs_check(dep, visited, recursion_stack)?;
                }
            }
        }

        recursion_stack.remove(job_id);
        Ok(())
    }

    /// Convert config to a Workflow domain model
    pub fn to_workflow(&self) -> Result<Workflow> {
        Workflow::from_config(self)
    }
}

/// Mapping whose values may be any YAML scalar (`UV_FROZEN: 1`)
fn scalar_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: HashMap<String, Value> = HashMap::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| match scalar_to_string(&value) {
            Some(s) => Ok((key, s)),
            None => Err(serde::de::Error::custom(format!(
                "value of '{}' must be a string, number or boolean",
                key
            ))),
        })
        .collect()
}

fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    scalar_to_string(&value)
        .ok_or_else(|| serde::de::Error::custom("expected a string, number or boolean"))
}
