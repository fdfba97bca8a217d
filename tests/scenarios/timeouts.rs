//! Step timeouts and runner errors fail the job without retries

use crate::helpers::*;
use stagegate::core::{RunStatus, TriggerEvent};
use std::time::Duration;

#[tokio::test]
async fn test_step_timeout_fails_job() {
    let yaml = r#"
name: test
on: push
jobs:
  - id: test
    steps:
      - run: pytest --slow
        timeout_secs: 1
      - run: echo after
  - id: build
    needs: [test]
    steps:
      - run: uv build
"#;
    let runner = MockRunner::new().delay("pytest --slow", Duration::from_secs(3));
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(yaml);

    let status = run(&runner, &workspace, &mut workflow, &TriggerEvent::push("main"))
        .await
        .unwrap();

    assert_eq!(status, RunStatus::Failed);
    assert_failed(&workflow, "test", "timed out after 1 seconds");
    assert_skipped(&workflow, "build", "test");
    assert_eq!(runner.count("echo after"), 0);
}

#[tokio::test]
async fn test_default_timeout_comes_from_workflow() {
    let yaml = r#"
name: test
on: push
default_timeout_secs: 1
jobs:
  - id: test
    steps:
      - run: pytest --slow
"#;
    let runner = MockRunner::new().delay("pytest --slow", Duration::from_secs(3));
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(yaml);
    assert_eq!(workflow.job("test").unwrap().steps[0].timeout_secs, 1);

    run(&runner, &workspace, &mut workflow, &TriggerEvent::push("main"))
        .await
        .unwrap();

    assert_failed(&workflow, "test", "timed out");
}

#[tokio::test]
async fn test_runner_error_is_terminal() {
    let yaml = r#"
name: publish
on: workflow_dispatch
jobs:
  - id: build
    steps:
      - run: uv build
      - upload_artifact: { name: dist, path: dist }
  - id: publish
    needs: [build]
    permissions: { id_token: write }
    steps:
      - download_artifact: { name: dist, path: dist }
      - publish_package: { artifact: dist }
"#;
    let runner = MockRunner::new().error("publish_package", "package index returned 400");
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(yaml);

    let status = run(&runner, &workspace, &mut workflow, &TriggerEvent::dispatch("main"))
        .await
        .unwrap();

    assert_eq!(status, RunStatus::Failed);
    assert_failed(&workflow, "publish", "package index returned 400");
    assert_eq!(runner.of_kind("publish_package").len(), 1);
}

#[tokio::test]
async fn test_provisioning_ignores_first_step_timeout() {
    let yaml = r#"
name: test
on: push
jobs:
  - id: test
    runtime: { name: python, version: "3.12", install: "uv sync --locked --python {version}" }
    steps:
      - run: uv run ruff check .
        timeout_secs: 1
"#;
    let runner = MockRunner::new().delay("uv sync", Duration::from_millis(1500));
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(yaml);

    let status = run(&runner, &workspace, &mut workflow, &TriggerEvent::push("main"))
        .await
        .unwrap();

    assert_eq!(status, RunStatus::Completed);
    assert_eq!(runner.count("ruff check"), 1);
}

#[tokio::test]
async fn test_provisioning_uses_workflow_default_timeout() {
    let yaml = r#"
name: test
on: push
default_timeout_secs: 1
jobs:
  - id: test
    runtime: { name: python, version: "3.12", install: "uv sync --locked --python {version}" }
    steps:
      - run: uv run pytest
        timeout_secs: 600
"#;
    let runner = MockRunner::new().delay("uv sync", Duration::from_secs(3));
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(yaml);
    assert_eq!(workflow.job("test").unwrap().timeout_secs, 1);

    run(&runner, &workspace, &mut workflow, &TriggerEvent::push("main"))
        .await
        .unwrap();

    assert_failed(&workflow, "test", "Step 'Set up python 3.12' timed out after 1 seconds");
    assert_eq!(runner.count("pytest"), 0);
}
