//! Test utilities: a scripted step runner and run assertions

#![allow(dead_code)]

use async_trait::async_trait;
use stagegate::core::config::WorkflowConfig;
use stagegate::core::{JobState, RunStatus, TriggerEvent, Workflow};
use stagegate::execution::{
    EngineError, EngineOptions, ExecutionEngine, ExecutionEvent, SchedulingStrategy,
};
use stagegate::runner::{RunnerError, StepAction, StepInvocation, StepOutput, StepRunner};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// One step the mock runner was asked to execute
#[derive(Debug, Clone)]
pub struct RecordedStep {
    pub workflow: String,
    pub job: String,
    pub step: String,
    pub kind: &'static str,
    /// Rendered command for `run` steps
    pub command: Option<String>,
    pub env: HashMap<String, String>,
    pub action: StepAction,
    pub started: Instant,
    pub finished: Instant,
}

impl RecordedStep {
    /// Text that rule patterns are matched against
    fn haystack(job: &str, step: &str, action: &StepAction) -> String {
        let detail = match action {
            StepAction::Run { command } => command.clone(),
            StepAction::Provision { binding } => binding
                .install_command
                .clone()
                .unwrap_or_else(|| binding.label()),
            other => other.kind().to_string(),
        };
        format!("{} :: {} :: {}", job, step, detail)
    }

    pub fn matches(&self, pattern: &str) -> bool {
        Self::haystack(&self.job, &self.step, &self.action).contains(pattern)
    }
}

#[derive(Debug, Clone)]
enum Behavior {
    Fail { exit_code: i32, stderr: String },
    Error(String),
    Delay(Duration),
    Stdout(String),
    Panic(String),
}

/// Step runner that never touches the system. Every step succeeds unless a
/// rule whose pattern occurs in `"<job> :: <step> :: <command or kind>"`
/// says otherwise. Clones share their recordings.
#[derive(Clone, Default)]
pub struct MockRunner {
    rules: Arc<Mutex<Vec<(String, Behavior)>>>,
    recorded: Arc<Mutex<Vec<RecordedStep>>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(self, pattern: &str, behavior: Behavior) -> Self {
        self.rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), behavior));
        self
    }

    /// Matching steps exit with `exit_code`
    pub fn fail(self, pattern: &str, exit_code: i32, stderr: &str) -> Self {
        self.rule(
            pattern,
            Behavior::Fail {
                exit_code,
                stderr: stderr.to_string(),
            },
        )
    }

    /// Matching steps return a runner error (service or spawn failure)
    pub fn error(self, pattern: &str, message: &str) -> Self {
        self.rule(pattern, Behavior::Error(message.to_string()))
    }

    /// Matching steps take `delay` before finishing
    pub fn delay(self, pattern: &str, delay: Duration) -> Self {
        self.rule(pattern, Behavior::Delay(delay))
    }

    /// Matching steps print `stdout`
    pub fn stdout(self, pattern: &str, stdout: &str) -> Self {
        self.rule(pattern, Behavior::Stdout(stdout.to_string()))
    }

    /// Matching steps panic inside the runner
    pub fn panic(self, pattern: &str, message: &str) -> Self {
        self.rule(pattern, Behavior::Panic(message.to_string()))
    }

    pub fn recorded(&self) -> Vec<RecordedStep> {
        let mut steps = self.recorded.lock().unwrap().clone();
        steps.sort_by_key(|s| s.started);
        steps
    }

    /// Recorded steps matching `pattern`
    pub fn matching(&self, pattern: &str) -> Vec<RecordedStep> {
        self.recorded()
            .into_iter()
            .filter(|s| s.matches(pattern))
            .collect()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.matching(pattern).len()
    }

    pub fn of_kind(&self, kind: &str) -> Vec<RecordedStep> {
        self.recorded()
            .into_iter()
            .filter(|s| s.kind == kind)
            .collect()
    }

    /// Job instances that reached the runner, in order of first step
    pub fn jobs(&self) -> Vec<String> {
        let mut jobs: Vec<String> = Vec::new();
        for step in self.recorded() {
            if !jobs.contains(&step.job) {
                jobs.push(step.job);
            }
        }
        jobs
    }

    /// Largest number of matching steps that were running at the same time
    pub fn max_in_flight(&self, pattern: &str) -> usize {
        let mut edges: Vec<(Instant, i32)> = Vec::new();
        for step in self.matching(pattern) {
            edges.push((step.started, 1));
            edges.push((step.finished, -1));
        }
        // ends sort before starts at the same instant
        edges.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        let mut current = 0;
        let mut max = 0;
        for (_, delta) in edges {
            current += delta;
            max = max.max(current);
        }
        max as usize
    }
}

#[async_trait]
impl StepRunner for MockRunner {
    async fn run(&self, invocation: &StepInvocation) -> Result<StepOutput, RunnerError> {
        let started = Instant::now();
        let haystack =
            RecordedStep::haystack(&invocation.job, &invocation.step, &invocation.action);
        let behaviors: Vec<Behavior> = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .filter(|(pattern, _)| haystack.contains(pattern.as_str()))
            .map(|(_, behavior)| behavior.clone())
            .collect();

        let mut result = Ok(match &invocation.action {
            StepAction::DeployPages { sha, .. } => {
                let url = format!("https://docs.example.org/{}/", sha);
                StepOutput::success(format!("Deployed to {}", url)).with_output("page_url", url)
            }
            StepAction::PublishPackage { files, .. } => StepOutput::success(
                files
                    .iter()
                    .filter_map(|f| f.file_name())
                    .map(|f| f.to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => StepOutput::success(""),
        });

        let mut stdout = None;
        for behavior in behaviors {
            match behavior {
                Behavior::Delay(delay) => tokio::time::sleep(delay).await,
                Behavior::Stdout(text) => stdout = Some(text),
                Behavior::Fail { exit_code, stderr } => {
                    result = Ok(StepOutput::failure(exit_code, stderr));
                }
                Behavior::Error(message) => result = Err(RunnerError::Internal(message)),
                Behavior::Panic(message) => panic!("{}", message),
            }
        }
        if let (Some(text), Ok(output)) = (stdout, &mut result) {
            output.stdout = text;
        }

        let command = match &invocation.action {
            StepAction::Run { command } => Some(command.clone()),
            _ => None,
        };
        self.recorded.lock().unwrap().push(RecordedStep {
            workflow: invocation.workflow.clone(),
            job: invocation.job.clone(),
            step: invocation.step.clone(),
            kind: invocation.action.kind(),
            command,
            env: invocation.env.clone(),
            action: invocation.action.clone(),
            started,
            finished: Instant::now(),
        });
        result
    }
}

/// A workspace holding the files the bundled workflows upload
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "docs/build/html/index.html", "<h1>dftlib</h1>");
        write(root, "docs/build/html/api/index.html", "<h1>API</h1>");
        write(root, "dist/dftlib-1.4.0-py3-none-any.whl", "wheel");
        write(root, "dist/dftlib-1.4.0.tar.gz", "sdist");
        write(root, "coverage.xml", "<coverage/>");
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn options(&self) -> EngineOptions {
        EngineOptions {
            workspace: self.path().to_path_buf(),
            artifact_root: Some(self.path().join(".artifacts")),
            default_branch: "main".to_string(),
            vars: HashMap::from([("codecov_token".to_string(), "cov-token".to_string())]),
        }
    }
}

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// Engine over `runner` with a fresh workspace
pub fn engine(runner: &MockRunner, workspace: &Workspace) -> ExecutionEngine<MockRunner> {
    ExecutionEngine::new(runner.clone(), SchedulingStrategy::Parallel)
        .with_options(workspace.options())
}

/// Events emitted by an engine, in order
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ExecutionEvent>>>,
}

impl EventLog {
    pub fn attach(engine: &ExecutionEngine<MockRunner>) -> Self {
        let log = Self::default();
        let events = log.events.clone();
        engine.add_event_handler(move |event| events.lock().unwrap().push(event));
        log
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Instance IDs that waited on a concurrency group
    pub fn waited(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ExecutionEvent::JobWaiting { instance_id, .. } => Some(instance_id),
                _ => None,
            })
            .collect()
    }
}

pub fn workflow_from_yaml(yaml: &str) -> Workflow {
    WorkflowConfig::from_yaml(yaml)
        .expect("workflow should validate")
        .to_workflow()
        .expect("workflow should load")
}

pub fn bundled_workflow(name: &str) -> Workflow {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("workflows")
        .join(format!("{}.yml", name));
    WorkflowConfig::from_file(&path)
        .expect("bundled workflow should validate")
        .to_workflow()
        .expect("bundled workflow should load")
}

/// Run `workflow` for `event` with a default engine
pub async fn run(
    runner: &MockRunner,
    workspace: &Workspace,
    workflow: &mut Workflow,
    event: &TriggerEvent,
) -> Result<RunStatus, EngineError> {
    engine(runner, workspace).execute(workflow, event).await
}

pub fn state<'a>(workflow: &'a Workflow, instance_id: &str) -> &'a JobState {
    &workflow
        .instance(instance_id)
        .unwrap_or_else(|| panic!("no job instance '{}'", instance_id))
        .state
}

pub fn assert_succeeded(workflow: &Workflow, instance_id: &str) {
    let state = state(workflow, instance_id);
    assert!(
        matches!(state, JobState::Completed { .. }),
        "expected '{}' to succeed, got {:?}",
        instance_id,
        state
    );
}

pub fn assert_failed(workflow: &Workflow, instance_id: &str, error_contains: &str) {
    match state(workflow, instance_id) {
        JobState::Failed { error, .. } => assert!(
            error.contains(error_contains),
            "expected '{}' error to contain '{}', got '{}'",
            instance_id,
            error_contains,
            error
        ),
        other => panic!("expected '{}' to fail, got {:?}", instance_id, other),
    }
}

pub fn assert_skipped(workflow: &Workflow, instance_id: &str, reason_contains: &str) {
    match state(workflow, instance_id) {
        JobState::Skipped { reason } => assert!(
            reason.contains(reason_contains),
            "expected '{}' skip reason to contain '{}', got '{}'",
            instance_id,
            reason_contains,
            reason
        ),
        other => panic!("expected '{}' to be skipped, got {:?}", instance_id, other),
    }
}

pub fn assert_cancelled(workflow: &Workflow, instance_id: &str) {
    let state = state(workflow, instance_id);
    assert!(
        matches!(state, JobState::Cancelled { .. }),
        "expected '{}' to be cancelled, got {:?}",
        instance_id,
        state
    );
}

/// Assert `before` finished its first step before `after` started any
pub fn assert_ran_before(runner: &MockRunner, before: &str, after: &str) {
    let first = runner.matching(before);
    let second = runner.matching(after);
    assert!(!first.is_empty(), "'{}' never ran", before);
    assert!(!second.is_empty(), "'{}' never ran", after);
    let finished = first.iter().map(|s| s.finished).max().unwrap();
    let started = second.iter().map(|s| s.started).min().unwrap();
    assert!(
        finished <= started,
        "expected '{}' to finish before '{}' started",
        before,
        after
    );
}
