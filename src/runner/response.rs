//! Runner response types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Error types for runner operations
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {0} seconds")]
    Timeout(u64),

    #[error("{service} returned HTTP {status}: {body}")]
    Service {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No endpoint configured for {0}")]
    MissingEndpoint(&'static str),

    #[error("Refusing to publish: no identity token was minted for this job (requires permissions: {{ id_token: write }})")]
    MissingIdentity,

    #[error("Identity token expired at {0}")]
    TokenExpired(chrono::DateTime<chrono::Utc>),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result of running one step action
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOutput {
    pub exit_code: i32,

    pub stdout: String,

    pub stderr: String,

    /// Outputs set directly by the runner (e.g. `page_url` of a deploy)
    pub outputs: HashMap<String, String>,
}

impl StepOutput {
    /// A successful output with the given stdout
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, key: &str, value: impl Into<String>) -> Self {
        self.outputs.insert(key.to_string(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}
