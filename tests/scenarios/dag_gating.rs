//! Jobs start only when every need succeeded and their condition holds

use crate::helpers::*;
use stagegate::core::annotation::Severity;
use stagegate::core::{JobResult, RunStatus, TriggerEvent};
use stagegate::execution::ExecutionEvent;

const LINT: &str = r#"
name: lint
on: push
jobs:
  - id: lint-check
    steps:
      - run: ruff check .
  - id: lint-format
    needs: [lint-check]
    steps:
      - run: ruff format --check .
  - id: test
    needs: [lint-format]
    steps:
      - run: pytest
"#;

#[tokio::test]
async fn test_downstream_runs_after_success() {
    let runner = MockRunner::new();
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(LINT);

    let status = run(&runner, &workspace, &mut workflow, &TriggerEvent::push("main"))
        .await
        .unwrap();

    assert_eq!(status, RunStatus::Completed);
    assert_eq!(runner.jobs(), vec!["lint-check", "lint-format", "test"]);
    assert_ran_before(&runner, "ruff check", "ruff format");
    assert_ran_before(&runner, "ruff format", "pytest");
    assert_eq!(workflow.state.completed_jobs, 3);
}

#[tokio::test]
async fn test_failed_lint_halts_everything_downstream() {
    let runner = MockRunner::new()
        .stdout(
            "ruff check",
            "::error file=src/dftlib/xc.py,line=12,col=5,title=F401::`numpy` imported but unused",
        )
        .fail("ruff check", 1, "Found 1 error.");
    let workspace = Workspace::new();
    let engine = engine(&runner, &workspace);
    let log = EventLog::attach(&engine);
    let mut workflow = workflow_from_yaml(LINT);

    let status = engine
        .execute(&mut workflow, &TriggerEvent::push("main"))
        .await
        .unwrap();

    assert_eq!(status, RunStatus::Failed);
    assert_failed(&workflow, "lint-check", "exited with code 1: Found 1 error.");
    assert_skipped(&workflow, "lint-format", "Needed job 'lint-check' result was failure");
    assert_skipped(&workflow, "test", "Needed job 'lint-format' result was skipped");
    assert_eq!(runner.count("ruff format"), 0);
    assert_eq!(runner.count("pytest"), 0);

    let diagnostics = &workflow.instance("lint-check").unwrap().diagnostics;
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].severity, Severity::Error);
    assert_eq!(diagnostics[0].file.as_deref(), Some("src/dftlib/xc.py"));
    assert_eq!(diagnostics[0].line, Some(12));
    assert_eq!(diagnostics[0].title.as_deref(), Some("F401"));

    let annotated = log.events().into_iter().any(|e| {
        matches!(e, ExecutionEvent::Annotation { instance_id, .. } if instance_id == "lint-check")
    });
    assert!(annotated);
}

#[tokio::test]
async fn test_first_failing_step_ends_job() {
    let yaml = r#"
name: build
on: push
jobs:
  - id: build
    steps:
      - run: uv build
      - run: twine check dist/*
      - run: echo never
"#;
    let runner = MockRunner::new().fail("twine check", 2, "");
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(yaml);

    run(&runner, &workspace, &mut workflow, &TriggerEvent::push("main"))
        .await
        .unwrap();

    assert_failed(&workflow, "build", "exited with code 2");
    assert_eq!(runner.count("uv build"), 1);
    assert_eq!(runner.count("echo never"), 0);
}

#[tokio::test]
async fn test_independent_jobs_run_concurrently() {
    let yaml = r#"
name: checks
on: push
jobs:
  - id: lint
    steps: [{ run: ruff check . }]
  - id: typecheck
    steps: [{ run: mypy src }]
  - id: report
    needs: [lint, typecheck]
    steps: [{ run: echo done }]
"#;
    let runner = MockRunner::new()
        .delay("ruff check", std::time::Duration::from_millis(150))
        .delay("mypy", std::time::Duration::from_millis(150));
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(yaml);

    run(&runner, &workspace, &mut workflow, &TriggerEvent::push("main"))
        .await
        .unwrap();

    assert_eq!(runner.max_in_flight("::"), 2);
    assert_ran_before(&runner, "ruff check", "echo done");
    assert_ran_before(&runner, "mypy", "echo done");
}

#[tokio::test]
async fn test_job_condition_and_outputs() {
    let yaml = r#"
name: release
on: [push, release]
jobs:
  - id: version
    outputs:
      version: "${{ steps.read.outputs.version }}"
    steps:
      - id: read
        run: python -c "print('::set-output name=version::1.4.0')"
  - id: tag-only
    needs: [version]
    if: "startsWith(github.ref, 'refs/tags/')"
    steps:
      - run: echo tagged
  - id: announce
    needs: [version]
    if: "needs.version.result == 'success'"
    steps:
      - run: "echo releasing ${{ needs.version.outputs.version }}"
"#;
    let runner = MockRunner::new().stdout("print(", "::set-output name=version::1.4.0");
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(yaml);

    let status = run(&runner, &workspace, &mut workflow, &TriggerEvent::push("main"))
        .await
        .unwrap();

    assert_eq!(status, RunStatus::Completed);
    assert_skipped(&workflow, "tag-only", "was false");
    assert_eq!(workflow.job_result("tag-only"), Some(JobResult::Skipped));
    assert_eq!(workflow.job_outputs("version").get("version").map(String::as_str), Some("1.4.0"));
    assert_eq!(runner.count("echo releasing 1.4.0"), 1);
}

#[tokio::test]
async fn test_step_condition_sees_previous_outcome() {
    let yaml = r#"
name: docs
on: push
jobs:
  - id: build
    steps:
      - id: html
        run: sphinx-build docs out
      - if: "steps.html.outcome == 'success'"
        run: linkcheck out
      - if: "github.event_name == 'pull_request'"
        run: preview out
"#;
    let runner = MockRunner::new();
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(yaml);

    run(&runner, &workspace, &mut workflow, &TriggerEvent::push("main"))
        .await
        .unwrap();

    assert_succeeded(&workflow, "build");
    assert_eq!(runner.count("linkcheck"), 1);
    assert_eq!(runner.count("preview"), 0);
}

#[tokio::test]
async fn test_untriggered_workflow_is_not_started() {
    let runner = MockRunner::new();
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(LINT);

    let result = run(
        &runner,
        &workspace,
        &mut workflow,
        &TriggerEvent::release("v1.4.0", "published"),
    )
    .await;

    assert!(matches!(result, Err(stagegate::EngineError::NotTriggered { .. })));
    assert!(runner.recorded().is_empty());
    assert_eq!(workflow.state.status, RunStatus::Pending);
}
