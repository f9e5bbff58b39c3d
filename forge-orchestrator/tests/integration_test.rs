//! Integration tests for WorkspaceOrchestrator
//!
//! Tests the service facade end to end on SQLite: workspace creation with its
//! first build, the start/stop/delete lifecycle, lookups and request
//! validation.

mod common;

use common::{complete_job, create_test_store, insert_template_version, seed, test_config, ImportOutcome};
use forge_orchestrator::authz::{Action, Object, ResourceType};
use forge_orchestrator::parameter::TemplateVersionParameter;
use forge_orchestrator::{
    BuildErrorStatus, BuildParameter, CreateWorkspaceBuildRequest, CreateWorkspaceRequest,
    MemoryStore, WorkspaceOrchestrator, WorkspaceTransition,
};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

async fn orchestrator() -> (WorkspaceOrchestrator, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let orchestrator = WorkspaceOrchestrator::connect(test_config(&dir))
        .await
        .expect("Failed to connect");
    (orchestrator, dir)
}

#[tokio::test]
async fn test_create_workspace() {
    let (orchestrator, _dir) = orchestrator().await;
    let fx = seed(orchestrator.store(), vec![]).await;
    let owner_id = Uuid::new_v4();

    let req = CreateWorkspaceRequest {
        name: "test-workspace".to_string(),
        owner_id,
        template_id: fx.template.id,
        template_version_id: None,
        rich_parameter_values: vec![],
        parameter_values: vec![],
    };

    let (workspace, build, job) = orchestrator
        .create_workspace(req, None)
        .await
        .expect("Failed to create workspace");

    assert_eq!(workspace.name, "test-workspace");
    assert_eq!(workspace.owner_id, owner_id);
    assert_eq!(workspace.template_id, fx.template.id);
    assert_eq!(workspace.organization_id, fx.organization_id);
    assert!(!workspace.deleted);

    assert_eq!(build.workspace_id, workspace.id);
    assert_eq!(build.build_number, 1);
    assert_eq!(build.transition, WorkspaceTransition::Start);
    assert_eq!(build.template_version_id, fx.template.active_version_id);
    assert_eq!(build.initiator_id, owner_id);
    assert_eq!(build.job_id, job.id);

    let fetched = orchestrator.get_workspace(workspace.id).await.unwrap();
    assert_eq!(fetched.id, workspace.id);
    let latest = orchestrator.latest_build(workspace.id).await.unwrap();
    assert_eq!(latest.id, build.id);
}

#[tokio::test]
async fn test_create_workspace_with_parameters() {
    let (orchestrator, _dir) = orchestrator().await;
    let mut cpu = TemplateVersionParameter::new(Uuid::nil(), "cpu");
    cpu.required = true;
    let fx = seed(orchestrator.store(), vec![cpu]).await;

    let mut req = CreateWorkspaceRequest {
        name: "sized".to_string(),
        owner_id: Uuid::new_v4(),
        template_id: fx.template.id,
        template_version_id: Some(fx.version.id),
        rich_parameter_values: vec![],
        parameter_values: vec![],
    };

    // A failed first build leaves no workspace behind.
    let err = orchestrator
        .create_workspace(req.clone(), None)
        .await
        .unwrap_err();
    assert_eq!(err.status, BuildErrorStatus::BadRequest);

    req.rich_parameter_values = vec![BuildParameter::new("cpu", "4")];
    let (workspace, build, _) = orchestrator.create_workspace(req, None).await.unwrap();
    assert_eq!(build.template_version_id, fx.version.id);
    assert_eq!(orchestrator.list_builds(workspace.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_create_workspace_unknown_template() {
    let (orchestrator, _dir) = orchestrator().await;

    let req = CreateWorkspaceRequest {
        name: "orphaned".to_string(),
        owner_id: Uuid::new_v4(),
        template_id: Uuid::new_v4(),
        template_version_id: None,
        rich_parameter_values: vec![],
        parameter_values: vec![],
    };
    let err = orchestrator.create_workspace(req, None).await.unwrap_err();
    assert_eq!(err.status, BuildErrorStatus::NotFound);
}

#[tokio::test]
async fn test_create_workspace_requires_create_action() {
    let (orchestrator, _dir) = orchestrator().await;
    let fx = seed(orchestrator.store(), vec![]).await;
    let no_create = |action: Action, object: &Object| {
        !(action == Action::Create && object.resource_type == ResourceType::Workspace)
    };

    let req = CreateWorkspaceRequest {
        name: "denied".to_string(),
        owner_id: Uuid::new_v4(),
        template_id: fx.template.id,
        template_version_id: None,
        rich_parameter_values: vec![],
        parameter_values: vec![],
    };
    let err = orchestrator
        .create_workspace(req, Some(&no_create))
        .await
        .unwrap_err();
    assert_eq!(err.status, BuildErrorStatus::Forbidden);
}

#[tokio::test]
async fn test_workspace_lifecycle() {
    let (orchestrator, _dir) = orchestrator().await;
    let fx = seed(orchestrator.store(), vec![]).await;
    let store = orchestrator.store();
    let id = fx.workspace.id;

    let (start, job) = orchestrator
        .start_workspace(id, CreateWorkspaceBuildRequest {
            state: Some(b"tfstate".to_vec()),
            ..Default::default()
        }, None)
        .await
        .unwrap();
    assert_eq!(start.transition, WorkspaceTransition::Start);

    // Still provisioning
    let err = orchestrator
        .stop_workspace(id, CreateWorkspaceBuildRequest::default(), None)
        .await
        .unwrap_err();
    assert_eq!(err.status, BuildErrorStatus::Conflict);

    complete_job(store, job.id).await;
    let (stop, job) = orchestrator
        .stop_workspace(id, CreateWorkspaceBuildRequest::default(), None)
        .await
        .unwrap();
    assert_eq!(stop.transition, WorkspaceTransition::Stop);
    assert_eq!(stop.provisioner_state, b"tfstate");

    complete_job(store, job.id).await;
    let (delete, _) = orchestrator
        .delete_workspace(id, CreateWorkspaceBuildRequest {
            orphan: true,
            ..Default::default()
        }, None)
        .await
        .unwrap();
    assert_eq!(delete.transition, WorkspaceTransition::Delete);
    assert!(delete.provisioner_state.is_empty());

    let builds = orchestrator.list_builds(id).await.unwrap();
    let transitions: Vec<_> = builds.iter().map(|b| b.transition).collect();
    assert_eq!(
        transitions,
        vec![
            WorkspaceTransition::Start,
            WorkspaceTransition::Stop,
            WorkspaceTransition::Delete
        ]
    );
}

#[tokio::test]
async fn test_start_with_newer_version() {
    let (orchestrator, _dir) = orchestrator().await;
    let fx = seed(orchestrator.store(), vec![]).await;

    let (_, job) = orchestrator
        .start_workspace(fx.workspace.id, CreateWorkspaceBuildRequest::default(), None)
        .await
        .unwrap();
    complete_job(orchestrator.store(), job.id).await;

    let v2 = insert_template_version(
        orchestrator.store(),
        fx.organization_id,
        Some(fx.template.id),
        ImportOutcome::Succeeded,
        vec![],
    )
    .await;
    let (build, _) = orchestrator
        .start_workspace(fx.workspace.id, CreateWorkspaceBuildRequest {
            template_version_id: Some(v2.id),
            ..Default::default()
        }, None)
        .await
        .unwrap();
    assert_eq!(build.template_version_id, v2.id);
    assert_eq!(build.build_number, 2);
}

#[tokio::test]
async fn test_orphan_request_validation() {
    let (orchestrator, _dir) = orchestrator().await;
    let fx = seed(orchestrator.store(), vec![]).await;

    let err = orchestrator
        .stop_workspace(fx.workspace.id, CreateWorkspaceBuildRequest {
            orphan: true,
            ..Default::default()
        }, None)
        .await
        .unwrap_err();
    assert_eq!(err.status, BuildErrorStatus::BadRequest);

    let err = orchestrator
        .delete_workspace(fx.workspace.id, CreateWorkspaceBuildRequest {
            orphan: true,
            state: Some(b"tfstate".to_vec()),
            ..Default::default()
        }, None)
        .await
        .unwrap_err();
    assert_eq!(err.status, BuildErrorStatus::BadRequest);
}

#[tokio::test]
async fn test_missing_workspace() {
    let (orchestrator, _dir) = orchestrator().await;
    let id = Uuid::new_v4();

    let err = orchestrator.get_workspace(id).await.unwrap_err();
    assert_eq!(err.status, BuildErrorStatus::NotFound);

    let err = orchestrator
        .start_workspace(id, CreateWorkspaceBuildRequest::default(), None)
        .await
        .unwrap_err();
    assert_eq!(err.status, BuildErrorStatus::NotFound);

    let err = orchestrator.latest_build(id).await.unwrap_err();
    assert_eq!(err.status, BuildErrorStatus::NotFound);
    assert!(orchestrator.list_builds(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_workspace_retries_on_memory_store() {
    let store = MemoryStore::new();
    let fx = seed(&store, vec![]).await;
    let mut config = test_config(&TempDir::new().unwrap());
    config.max_build_attempts = 3;
    let orchestrator = WorkspaceOrchestrator::new(Arc::new(store.clone()), config);

    let req = CreateWorkspaceRequest {
        name: "retried".to_string(),
        owner_id: Uuid::new_v4(),
        template_id: fx.template.id,
        template_version_id: None,
        rich_parameter_values: vec![],
        parameter_values: vec![],
    };

    store.inject_serialization_failures(2);
    let (workspace, build, _) = orchestrator.create_workspace(req.clone(), None).await.unwrap();
    assert_eq!(build.build_number, 1);
    assert_eq!(orchestrator.list_builds(workspace.id).await.unwrap().len(), 1);

    store.inject_serialization_failures(3);
    let err = orchestrator.create_workspace(req, None).await.unwrap_err();
    assert_eq!(err.status, BuildErrorStatus::Internal);
}

#[tokio::test]
async fn test_reconnect_backs_up_existing_database() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let first = WorkspaceOrchestrator::connect(test_config(&dir)).await.unwrap();
    let fx = seed(first.store(), vec![]).await;
    drop(first);

    let second = WorkspaceOrchestrator::connect(test_config(&dir)).await.unwrap();
    let backups = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().contains(".backup."))
        .count();
    assert_eq!(backups, 1);
    assert_eq!(second.get_workspace(fx.workspace.id).await.unwrap().name, "dev");
}

#[tokio::test]
async fn test_sqlite_store_fixture_roundtrip() {
    let (store, _dir) = create_test_store().await;
    let fx = seed(&store, vec![]).await;
    let orchestrator = WorkspaceOrchestrator::new(Arc::new(store), Default::default());

    let workspace = orchestrator.get_workspace(fx.workspace.id).await.unwrap();
    assert_eq!(workspace.name, "dev");
    assert_eq!(workspace.owner_id, fx.owner_id);
    assert!(orchestrator.list_builds(workspace.id).await.unwrap().is_empty());
}
