//! Matrix instances run independently, each with its own runtime binding

use crate::helpers::*;
use stagegate::core::{JobResult, RunStatus, TriggerEvent};
use std::time::Duration;

fn matrix_yaml(fail_fast: bool, max_parallel: Option<usize>) -> String {
    let max_parallel = max_parallel
        .map(|n| format!("\n      max_parallel: {}", n))
        .unwrap_or_default();
    format!(
        r#"
name: test
on: push
jobs:
  - id: test
    strategy:
      matrix:
        python-version: ["3.10", "3.11", "3.12"]
      fail_fast: {}{}
    runtime:
      name: python
      version: "${{{{ matrix.python-version }}}}"
      lockfile: uv.lock
      install: "uv sync --locked --python {{version}}"
    steps:
      - run: "pytest -q"
      - run: "echo finished ${{{{ matrix.python-version }}}}"
  - id: build
    needs: [test]
    steps:
      - run: uv build
"#,
        fail_fast, max_parallel
    )
}

#[tokio::test]
async fn test_every_version_runs_with_its_own_binding() {
    let runner = MockRunner::new().delay("pytest", Duration::from_millis(100));
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(&matrix_yaml(false, None));

    let status = run(&runner, &workspace, &mut workflow, &TriggerEvent::push("main"))
        .await
        .unwrap();

    assert_eq!(status, RunStatus::Completed);
    assert_eq!(runner.max_in_flight("pytest"), 3);

    for version in ["3.10", "3.11", "3.12"] {
        let id = format!("test ({})", version);
        assert_succeeded(&workflow, &id);

        let installs = runner.matching(&format!("uv sync --locked --python {}", version));
        assert_eq!(installs.len(), 1);
        assert_eq!(installs[0].job, id);

        let steps = runner.matching(&format!("{} :: Run pytest", id));
        assert_eq!(steps.len(), 1);
        assert_eq!(
            steps[0].env.get("STAGEGATE_RUNTIME_VERSION").map(String::as_str),
            Some(version)
        );
        assert_eq!(steps[0].env.get("STAGEGATE_LOCKFILE").map(String::as_str), Some("uv.lock"));

        let binding = workflow.instance(&id).unwrap().binding.clone().unwrap();
        assert_eq!(binding.label(), format!("python {}", version));
        assert_eq!(runner.count(&format!("echo finished {}", version)), 1);
    }
}

#[tokio::test]
async fn test_one_failing_version_does_not_stop_the_others() {
    let runner = MockRunner::new()
        .delay("pytest", Duration::from_millis(100))
        .fail("test (3.11) :: Run pytest", 1, "FAILED tests/test_lda.py::test_energy");
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(&matrix_yaml(false, None));

    let status = run(&runner, &workspace, &mut workflow, &TriggerEvent::push("main"))
        .await
        .unwrap();

    assert_eq!(status, RunStatus::Failed);
    assert_failed(&workflow, "test (3.11)", "test_energy");
    assert_succeeded(&workflow, "test (3.10)");
    assert_succeeded(&workflow, "test (3.12)");
    assert_eq!(runner.count("echo finished 3.11"), 0);
    assert_eq!(runner.count("echo finished 3.12"), 1);

    assert_eq!(workflow.job_result("test"), Some(JobResult::Failure));
    assert_skipped(&workflow, "build", "Needed job 'test' result was failure");
    assert_eq!(runner.count("uv build"), 0);
}

#[tokio::test]
async fn test_fail_fast_cancels_unfinished_siblings() {
    let runner = MockRunner::new()
        .delay("test (3.11) :: Run pytest", Duration::from_millis(300))
        .delay("test (3.12) :: Run pytest", Duration::from_millis(300))
        .fail("test (3.10) :: Run pytest", 1, "boom");
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(&matrix_yaml(true, None));

    let status = run(&runner, &workspace, &mut workflow, &TriggerEvent::push("main"))
        .await
        .unwrap();

    assert_eq!(status, RunStatus::Failed);
    assert_failed(&workflow, "test (3.10)", "boom");
    assert_cancelled(&workflow, "test (3.11)");
    assert_cancelled(&workflow, "test (3.12)");
    assert_eq!(runner.count("echo finished"), 0);
}

#[tokio::test]
async fn test_max_parallel_limits_instances() {
    let runner = MockRunner::new().delay("pytest", Duration::from_millis(50));
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(&matrix_yaml(false, Some(1)));

    let status = run(&runner, &workspace, &mut workflow, &TriggerEvent::push("main"))
        .await
        .unwrap();

    assert_eq!(status, RunStatus::Completed);
    assert_eq!(runner.max_in_flight("pytest"), 1);
    assert_eq!(runner.count("pytest"), 3);
}
