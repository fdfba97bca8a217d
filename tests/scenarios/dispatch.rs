//! One event dispatched to several workflows

use crate::helpers::*;
use stagegate::core::{RunStatus, TriggerEvent};
use stagegate::execution::{dispatch, EngineError, ExecutionEvent};

const LINT: &str = r#"
name: lint
on: push
jobs:
  - id: lint-check
    steps:
      - run: uv run ruff check .
"#;

const DOCS: &str = r#"
name: docs
on: push
jobs:
  - id: build
    steps:
      - run: uv run sphinx-build docs docs/build/html
"#;

#[tokio::test]
async fn test_dispatch_runs_every_triggered_workflow() {
    let runner = MockRunner::new();
    let workspace = Workspace::new();
    let engine = engine(&runner, &workspace);
    let workflows = vec![workflow_from_yaml(LINT), workflow_from_yaml(DOCS)];

    let outcome = dispatch(&engine, workflows, &TriggerEvent::push("main")).await;

    assert!(outcome.all_succeeded());
    assert_eq!(outcome.runs.len(), 2);
    assert!(outcome.not_triggered.is_empty());
}

#[tokio::test]
async fn test_panicking_step_fails_its_run() {
    let runner = MockRunner::new().panic("sphinx-build", "renderer crashed");
    let workspace = Workspace::new();
    let engine = engine(&runner, &workspace);
    let workflows = vec![workflow_from_yaml(LINT), workflow_from_yaml(DOCS)];

    let outcome = dispatch(&engine, workflows, &TriggerEvent::push("main")).await;

    assert!(!outcome.all_succeeded());
    let (docs, result) = outcome
        .runs
        .iter()
        .find(|(w, _)| w.name == "docs")
        .unwrap();
    assert_eq!(*result.as_ref().unwrap(), RunStatus::Failed);
    assert_failed(docs, "build", "Job task failed");
    let (lint, _) = outcome.runs.iter().find(|(w, _)| w.name == "lint").unwrap();
    assert_succeeded(lint, "lint-check");
}

#[tokio::test]
async fn test_run_task_that_dies_is_reported_as_failed() {
    let runner = MockRunner::new();
    let workspace = Workspace::new();
    let engine = engine(&runner, &workspace);
    engine.add_event_handler(|event| {
        if let ExecutionEvent::RunStarted { workflow, .. } = &event {
            if workflow == "docs" {
                panic!("event handler crashed");
            }
        }
    });
    let workflows = vec![workflow_from_yaml(LINT), workflow_from_yaml(DOCS)];

    let outcome = dispatch(&engine, workflows, &TriggerEvent::push("main")).await;

    assert_eq!(outcome.runs.len(), 2);
    assert!(!outcome.all_succeeded());
    let (_, result) = outcome
        .runs
        .iter()
        .find(|(w, _)| w.name == "docs")
        .unwrap();
    assert!(matches!(result, Err(EngineError::Join(_))));
    let (_, lint) = outcome.runs.iter().find(|(w, _)| w.name == "lint").unwrap();
    assert_eq!(*lint.as_ref().unwrap(), RunStatus::Completed);
}
