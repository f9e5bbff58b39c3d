//! Common test utilities and helpers for forge-orchestrator tests
//!
//! Fixtures take `&dyn Store` so the same seed data works against the SQLite
//! backend and the in-memory backend.

#![allow(dead_code)]

use chrono::Utc;
use forge_orchestrator::authz::Acl;
use forge_orchestrator::db;
use forge_orchestrator::job::{
    InsertProvisionerJobParams, JobTags, ProvisionerJob, ProvisionerJobType, StorageMethod,
    SCOPE_ORGANIZATION, TAG_SCOPE,
};
use forge_orchestrator::parameter::TemplateVersionParameter;
use forge_orchestrator::template::{
    InsertTemplateParams, InsertTemplateVersionParams, ProvisionerType, Template, TemplateVersion,
};
use forge_orchestrator::workspace::InsertWorkspaceParams;
use forge_orchestrator::{
    IsolationLevel, OrchestratorConfig, SqliteStore, Store, Workspace, WorkspaceBuild,
};
use tempfile::TempDir;
use uuid::Uuid;

/// How the import job of a seeded template version ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceling,
    Canceled,
}

pub struct Fixture {
    pub organization_id: Uuid,
    pub owner_id: Uuid,
    pub template: Template,
    pub version: TemplateVersion,
    pub workspace: Workspace,
}

/// Config pointing at a fresh database file inside `dir`
pub fn test_config(dir: &TempDir) -> OrchestratorConfig {
    OrchestratorConfig {
        db_path: dir.path().join("forge.db"),
        max_connections: 5,
        busy_timeout_ms: 5000,
        max_build_attempts: 5,
    }
}

/// Helper to create an on-disk test database with migrations.
///
/// The directory must outlive the store.
pub async fn create_test_store() -> (SqliteStore, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let pool = db::create_pool(&test_config(&dir))
        .await
        .expect("Failed to create database");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    (SqliteStore::new(pool), dir)
}

/// Seeds a template whose active version imported successfully and a
/// workspace on it with no builds.
pub async fn seed(store: &dyn Store, parameters: Vec<TemplateVersionParameter>) -> Fixture {
    let organization_id = Uuid::new_v4();
    let owner_id = Uuid::new_v4();
    let template_id = Uuid::new_v4();

    let version = insert_template_version(
        store,
        organization_id,
        Some(template_id),
        ImportOutcome::Succeeded,
        parameters,
    )
    .await;

    let mut tx = store.begin(IsolationLevel::RepeatableRead).await.unwrap();
    let template = tx
        .insert_template(InsertTemplateParams {
            id: template_id,
            organization_id,
            name: format!("template-{}", &template_id.to_string()[..8]),
            provisioner: ProvisionerType::Echo,
            active_version_id: version.id,
            description: String::new(),
            created_by: owner_id,
            user_acl: Acl::new(),
            group_acl: Acl::new(),
        })
        .await
        .expect("Failed to insert template");
    let workspace = tx
        .insert_workspace(InsertWorkspaceParams {
            id: Uuid::new_v4(),
            owner_id,
            organization_id,
            template_id,
            name: "dev".to_string(),
        })
        .await
        .expect("Failed to insert workspace");
    tx.commit().await.expect("Failed to commit seed");

    Fixture {
        organization_id,
        owner_id,
        template,
        version,
        workspace,
    }
}

/// Inserts a template version whose import job ends in `outcome`.
pub async fn insert_template_version(
    store: &dyn Store,
    organization_id: Uuid,
    template_id: Option<Uuid>,
    outcome: ImportOutcome,
    parameters: Vec<TemplateVersionParameter>,
) -> TemplateVersion {
    let job_id = Uuid::new_v4();
    let version_id = Uuid::new_v4();
    let created_by = Uuid::new_v4();

    let mut tx = store.begin(IsolationLevel::RepeatableRead).await.unwrap();
    tx.insert_provisioner_job(InsertProvisionerJobParams {
        id: job_id,
        created_at: Utc::now(),
        organization_id,
        initiator_id: created_by,
        provisioner: ProvisionerType::Echo,
        storage_method: StorageMethod::File,
        job_type: ProvisionerJobType::TemplateVersionImport,
        input: serde_json::json!({ "template_version_id": version_id }),
        file_id: Uuid::new_v4(),
        tags: JobTags::from([(TAG_SCOPE.to_string(), SCOPE_ORGANIZATION.to_string())]),
        trace_metadata: None,
    })
    .await
    .expect("Failed to insert import job");

    let now = Utc::now();
    let worker_id = Uuid::new_v4();
    match outcome {
        ImportOutcome::Pending => {}
        ImportOutcome::Running => {
            tx.update_provisioner_job_with_start(job_id, worker_id, now)
                .await
                .unwrap();
        }
        ImportOutcome::Succeeded => {
            tx.update_provisioner_job_with_start(job_id, worker_id, now)
                .await
                .unwrap();
            tx.update_provisioner_job_with_complete(job_id, now, None)
                .await
                .unwrap();
        }
        ImportOutcome::Failed => {
            tx.update_provisioner_job_with_start(job_id, worker_id, now)
                .await
                .unwrap();
            tx.update_provisioner_job_with_complete(
                job_id,
                now,
                Some("terraform init failed".to_string()),
            )
            .await
            .unwrap();
        }
        ImportOutcome::Canceling => {
            tx.update_provisioner_job_with_cancel(job_id, now).await.unwrap();
        }
        ImportOutcome::Canceled => {
            tx.update_provisioner_job_with_cancel(job_id, now).await.unwrap();
            tx.update_provisioner_job_with_complete(job_id, now, None)
                .await
                .unwrap();
        }
    }

    let version = tx
        .insert_template_version(InsertTemplateVersionParams {
            id: version_id,
            template_id,
            organization_id,
            name: format!("v-{}", &version_id.to_string()[..8]),
            readme: String::new(),
            job_id,
            created_by,
            parameters,
        })
        .await
        .expect("Failed to insert template version");
    tx.commit().await.expect("Failed to commit template version");
    version
}

/// Makes `version_id` the template's active version.
pub async fn promote_version(store: &dyn Store, template_id: Uuid, version_id: Uuid) {
    let mut tx = store.begin(IsolationLevel::RepeatableRead).await.unwrap();
    tx.update_template_active_version(template_id, version_id)
        .await
        .unwrap();
    tx.commit().await.unwrap();
}

/// Marks a job as picked up and finished successfully.
pub async fn complete_job(store: &dyn Store, job_id: Uuid) {
    let now = Utc::now();
    let mut tx = store.begin(IsolationLevel::RepeatableRead).await.unwrap();
    tx.update_provisioner_job_with_start(job_id, Uuid::new_v4(), now)
        .await
        .unwrap();
    tx.update_provisioner_job_with_complete(job_id, now, None)
        .await
        .unwrap();
    tx.commit().await.expect("Failed to complete job");
}

pub async fn start_job(store: &dyn Store, job_id: Uuid) {
    let mut tx = store.begin(IsolationLevel::RepeatableRead).await.unwrap();
    tx.update_provisioner_job_with_start(job_id, Uuid::new_v4(), Utc::now())
        .await
        .unwrap();
    tx.commit().await.unwrap();
}

pub async fn cancel_job(store: &dyn Store, job_id: Uuid) {
    let mut tx = store.begin(IsolationLevel::RepeatableRead).await.unwrap();
    tx.update_provisioner_job_with_cancel(job_id, Utc::now())
        .await
        .unwrap();
    tx.commit().await.unwrap();
}

pub async fn get_job(store: &dyn Store, job_id: Uuid) -> ProvisionerJob {
    let mut tx = store.begin(IsolationLevel::RepeatableRead).await.unwrap();
    tx.get_provisioner_job_by_id(job_id).await.unwrap()
}

pub async fn list_builds(store: &dyn Store, workspace_id: Uuid) -> Vec<WorkspaceBuild> {
    let mut tx = store.begin(IsolationLevel::RepeatableRead).await.unwrap();
    tx.get_workspace_builds_by_workspace_id(workspace_id)
        .await
        .unwrap()
}

/// Optional string parameter with a default.
pub fn optional_parameter(name: &str, default: &str) -> TemplateVersionParameter {
    let mut parameter = TemplateVersionParameter::new(Uuid::nil(), name);
    parameter.default_value = default.to_string();
    parameter
}
