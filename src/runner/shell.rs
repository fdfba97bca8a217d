//! Shell subprocess client for `run` steps

use crate::runner::{RunnerError, StepOutput};
use std::collections::HashMap;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, warn};

/// Client for executing step commands through a shell
#[derive(Debug, Clone)]
pub struct ShellClient {
    /// Shell executable (e.g. "sh", "bash")
    shell: String,
}

impl ShellClient {
    pub fn new(shell: String) -> Self {
        Self { shell }
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Execute `command` as `<shell> -c <command>` in `working_dir`
    ///
    /// A non-zero exit is returned as an output, not an error; callers
    /// decide what a failing exit code means. The child is killed if the
    /// returned future is dropped, so an outer timeout stops it.
    ///
    /// # Errors
    /// Returns `RunnerError::Spawn` if the shell cannot be started.
    pub async fn execute(
        &self,
        command: &str,
        env: &HashMap<String, String>,
        working_dir: &Path,
    ) -> Result<StepOutput, RunnerError> {
        debug!("Spawning {} -c with command: {}", self.shell, command);

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .envs(env)
            .current_dir(working_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RunnerError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if exit_code != 0 {
            warn!("Command exited with code {}: {}", exit_code, stderr.trim());
        }
        debug!("Command returned {} bytes of output", stdout.len());

        Ok(StepOutput {
            exit_code,
            stdout,
            stderr,
            outputs: HashMap::new(),
        })
    }
}
