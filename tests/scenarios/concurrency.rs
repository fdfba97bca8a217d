//! Named concurrency groups shared between runs

use crate::helpers::*;
use stagegate::core::{RunStatus, TriggerEvent};
use stagegate::execution::ExecutionEvent;
use std::time::Duration;

const NOTES: &str = r#"
name: notes
on: push
jobs:
  - id: publish-notes
    concurrency:
      group: "notes-${{ github.ref_name }}"
      cancel_in_progress: CANCEL
    steps:
      - run: render-notes
      - run: upload-notes
"#;

fn notes(cancel_in_progress: bool) -> String {
    NOTES.replace("CANCEL", &cancel_in_progress.to_string())
}

#[tokio::test]
async fn test_queued_runs_execute_serially() {
    let runner = MockRunner::new().delay("render-notes", Duration::from_millis(200));
    let workspace = Workspace::new();
    let engine = engine(&runner, &workspace);
    let log = EventLog::attach(&engine);

    let mut first = workflow_from_yaml(&notes(false));
    let mut second = workflow_from_yaml(&notes(false));
    let event = TriggerEvent::push("main");

    let (a, b) = tokio::join!(engine.execute(&mut first, &event), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.execute(&mut second, &event).await
    });

    assert_eq!(a.unwrap(), RunStatus::Completed);
    assert_eq!(b.unwrap(), RunStatus::Completed);
    assert_eq!(runner.count("upload-notes"), 2);
    assert_eq!(runner.max_in_flight("publish-notes"), 1);
    assert_eq!(log.waited(), vec!["publish-notes"]);
}

#[tokio::test]
async fn test_cancel_in_progress_supersedes_holder() {
    let runner = MockRunner::new().delay("render-notes", Duration::from_millis(300));
    let workspace = Workspace::new();
    let engine = engine(&runner, &workspace);

    let mut first = workflow_from_yaml(&notes(true));
    let mut second = workflow_from_yaml(&notes(true));
    let event = TriggerEvent::push("main");

    let (a, b) = tokio::join!(engine.execute(&mut first, &event), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.execute(&mut second, &event).await
    });

    assert_eq!(a.unwrap(), RunStatus::Cancelled);
    assert_cancelled(&first, "publish-notes");
    assert_eq!(b.unwrap(), RunStatus::Completed);
    assert_succeeded(&second, "publish-notes");
    assert_eq!(runner.count("upload-notes"), 1);
}

#[tokio::test]
async fn test_groups_are_keyed_by_rendered_name() {
    let runner = MockRunner::new().delay("render-notes", Duration::from_millis(150));
    let workspace = Workspace::new();
    let engine = engine(&runner, &workspace);
    let log = EventLog::attach(&engine);

    let mut main = workflow_from_yaml(&notes(false));
    let mut develop = workflow_from_yaml(&notes(false));

    let event_main = TriggerEvent::push("main");
    let event_develop = TriggerEvent::push("develop");
    let (a, b) = tokio::join!(
        engine.execute(&mut main, &event_main),
        engine.execute(&mut develop, &event_develop),
    );

    assert_eq!(a.unwrap(), RunStatus::Completed);
    assert_eq!(b.unwrap(), RunStatus::Completed);
    assert_eq!(runner.max_in_flight("render-notes"), 2);
    assert!(log.waited().is_empty());
}

#[tokio::test]
async fn test_workflow_level_group_cancels_older_run() {
    let yaml = r#"
name: ci
on: push
concurrency:
  group: "ci-${{ github.ref }}"
  cancel_in_progress: true
jobs:
  - id: lint
    steps:
      - run: ruff check .
      - run: ruff format --check .
  - id: test
    needs: [lint]
    steps:
      - run: pytest
"#;
    let runner = MockRunner::new().delay("ruff check", Duration::from_millis(300));
    let workspace = Workspace::new();
    let engine = engine(&runner, &workspace);
    let log = EventLog::attach(&engine);

    let mut older = workflow_from_yaml(yaml);
    let mut newer = workflow_from_yaml(yaml);
    let event = TriggerEvent::push("main");

    let (a, b) = tokio::join!(engine.execute(&mut older, &event), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.execute(&mut newer, &event).await
    });

    assert_eq!(a.unwrap(), RunStatus::Cancelled);
    assert_cancelled(&older, "lint");
    assert_cancelled(&older, "test");
    assert_eq!(b.unwrap(), RunStatus::Completed);
    assert_succeeded(&newer, "test");
    assert_eq!(runner.count("pytest"), 1);

    let run_waited = log
        .events()
        .into_iter()
        .any(|e| matches!(e, ExecutionEvent::RunWaiting { group, .. } if group == "ci-refs/heads/main"));
    assert!(run_waited);
}
