//! Deploy and publish run only under the conditions that make them safe

use crate::helpers::*;
use stagegate::core::config::WorkflowConfig;
use stagegate::core::{RunStatus, TriggerEvent};
use stagegate::runner::StepAction;

const UNGUARDED_DEPLOY: &str = r#"
name: docs
on: [push, pull_request]
jobs:
  - id: build
    steps:
      - run: sphinx-build docs docs/build/html
      - upload_artifact: { name: github-pages, path: docs/build/html }
  - id: deploy
    needs: [build]
    steps:
      - deploy_pages: { artifact: github-pages }
"#;

const PUBLISH: &str = r#"
name: publish
on: [release, workflow_dispatch]
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

#[tokio::test]
async fn test_deploy_refused_outside_default_branch_push() {
    let events = [
        TriggerEvent::pull_request(12, "main"),
        TriggerEvent::push("feature/lda"),
    ];
    for event in events {
        let runner = MockRunner::new();
        let workspace = Workspace::new();
        let mut workflow = workflow_from_yaml(UNGUARDED_DEPLOY);

        let status = run(&runner, &workspace, &mut workflow, &event).await.unwrap();

        assert_eq!(status, RunStatus::Failed);
        assert_succeeded(&workflow, "build");
        assert_failed(&workflow, "deploy", "Refusing to deploy");
        assert!(runner.of_kind("deploy_pages").is_empty());
    }
}

#[tokio::test]
async fn test_deploy_on_push_to_default_branch_records_url() {
    let runner = MockRunner::new();
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(UNGUARDED_DEPLOY);

    let event = TriggerEvent::push("main").with_sha("4f2c9e1");
    let status = run(&runner, &workspace, &mut workflow, &event).await.unwrap();

    assert_eq!(status, RunStatus::Completed);
    let deploys = runner.of_kind("deploy_pages");
    assert_eq!(deploys.len(), 1);
    match &deploys[0].action {
        StepAction::DeployPages { artifact, files, sha } => {
            assert_eq!(artifact, "github-pages");
            assert_eq!(sha, "4f2c9e1");
            assert!(files.iter().any(|f| f == "index.html"));
            assert!(files.iter().any(|f| f.ends_with("index.html") && f.starts_with("api")));
        }
        other => panic!("unexpected action {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_build_never_publishes() {
    let runner = MockRunner::new().fail("uv build", 1, "error: backend failed");
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(PUBLISH);

    let status = run(
        &runner,
        &workspace,
        &mut workflow,
        &TriggerEvent::release("v1.4.0", "published"),
    )
    .await
    .unwrap();

    assert_eq!(status, RunStatus::Failed);
    assert_skipped(&workflow, "publish", "Needed job 'build' result was failure");
    assert!(runner.of_kind("publish_package").is_empty());
}

#[tokio::test]
async fn test_publish_uploads_downloaded_artifact_with_identity() {
    let runner = MockRunner::new();
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(PUBLISH);

    let status = run(
        &runner,
        &workspace,
        &mut workflow,
        &TriggerEvent::release("v1.4.0", "published"),
    )
    .await
    .unwrap();

    assert_eq!(status, RunStatus::Completed);
    let publishes = runner.of_kind("publish_package");
    assert_eq!(publishes.len(), 1);
    match &publishes[0].action {
        StepAction::PublishPackage {
            artifact,
            files,
            identity,
            ..
        } => {
            assert_eq!(artifact, "dist");
            let mut names: Vec<String> = files
                .iter()
                .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
                .collect();
            names.sort();
            assert_eq!(names, vec!["dftlib-1.4.0-py3-none-any.whl", "dftlib-1.4.0.tar.gz"]);
            assert_eq!(identity.audience, "pypi");
            assert!(!identity.is_expired());
        }
        other => panic!("unexpected action {:?}", other),
    }
}

#[tokio::test]
async fn test_publish_without_identity_permission_fails() {
    let yaml = PUBLISH.replace("    permissions: { id_token: write }\n", "");
    let runner = MockRunner::new();
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(&yaml);

    let status = run(
        &runner,
        &workspace,
        &mut workflow,
        &TriggerEvent::dispatch("main"),
    )
    .await
    .unwrap();

    assert_eq!(status, RunStatus::Failed);
    assert_failed(&workflow, "publish", "no identity token");
    assert!(runner.of_kind("publish_package").is_empty());
}

#[test]
fn test_publish_must_download_first() {
    let yaml = r#"
name: publish
on: release
jobs:
  - id: build
    steps:
      - upload_artifact: { name: dist, path: dist }
  - id: publish
    needs: [build]
    permissions: { id_token: write }
    steps:
      - publish_package: { artifact: dist }
"#;
    let err = WorkflowConfig::from_yaml(yaml).unwrap_err();
    assert!(format!("{:#}", err).contains("has not downloaded"));
}

#[test]
fn test_download_requires_upstream_producer() {
    let yaml = r#"
name: publish
on: release
jobs:
  - id: build
    steps:
      - upload_artifact: { name: dist, path: dist }
  - id: publish
    steps:
      - download_artifact: { name: dist, path: dist }
"#;
    let err = WorkflowConfig::from_yaml(yaml).unwrap_err();
    assert!(format!("{:#}", err).contains("no predecessor job uploads"));
}

#[tokio::test]
async fn test_missing_upload_path_fails_build() {
    let yaml = r#"
name: docs
on: push
jobs:
  - id: build
    steps:
      - upload_artifact: { name: github-pages, path: site }
  - id: deploy
    needs: [build]
    steps:
      - deploy_pages: { artifact: github-pages }
"#;
    let runner = MockRunner::new();
    let workspace = Workspace::new();
    let mut workflow = workflow_from_yaml(yaml);

    let status = run(&runner, &workspace, &mut workflow, &TriggerEvent::push("main"))
        .await
        .unwrap();

    assert_eq!(status, RunStatus::Failed);
    assert_failed(&workflow, "build", "github-pages");
    assert_skipped(&workflow, "deploy", "build");
}
