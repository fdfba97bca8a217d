//! Runner configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the local runner and the external services it talks to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Shell used for `run` steps, invoked as `<shell> -c <command>`
    pub shell: String,

    /// Working directory for every job; defaults to the current directory
    pub workspace: Option<PathBuf>,

    /// Where artifacts are staged; defaults to a per-run temp folder
    pub artifact_root: Option<PathBuf>,

    /// Coverage aggregator base URL
    pub coverage_url: String,

    /// Package index base URL (token exchange)
    pub package_index_url: String,

    /// Package upload endpoint
    pub package_upload_url: String,

    /// Docs hosting base URL; deploys fail without one
    pub pages_url: Option<String>,

    /// Timeout for HTTP requests in seconds
    pub request_timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            workspace: None,
            artifact_root: None,
            coverage_url: "https://codecov.io".to_string(),
            package_index_url: "https://pypi.org".to_string(),
            package_upload_url: "https://upload.pypi.org/legacy/".to_string(),
            pages_url: None,
            request_timeout_secs: 300,
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a YAML file; missing keys keep their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read runner config {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid runner config {}", path.display()))
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn with_artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifact_root = Some(root.into());
        self
    }

    pub fn with_coverage_url(mut self, url: impl Into<String>) -> Self {
        self.coverage_url = url.into();
        self
    }

    pub fn with_package_index(mut self, index_url: impl Into<String>, upload_url: impl Into<String>) -> Self {
        self.package_index_url = index_url.into();
        self.package_upload_url = upload_url.into();
        self
    }

    pub fn with_pages_url(mut self, url: impl Into<String>) -> Self {
        self.pages_url = Some(url.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout_secs: u64) -> Self {
        self.request_timeout_secs = timeout_secs;
        self
    }
}
