//! Transactional store contract.
//!
//! The orchestrator never talks to a database directly. It opens a
//! [`StoreTx`] through a [`Store`], performs every read and write of one build
//! attempt through it, and commits. Backends report write-write conflicts as
//! [`StoreError::SerializationFailure`](crate::error::StoreError) so callers
//! can retry the whole transaction.

pub mod memory;
pub mod sqlite;

use crate::error::StoreResult;
use crate::job::{InsertProvisionerJobParams, ProvisionerJob};
use crate::parameter::{
    BuildParameter, InsertParameterValueParams, ParameterScope, ParameterValue,
    TemplateVersionParameter, WorkspaceBuildParameter,
};
use crate::template::{InsertTemplateParams, InsertTemplateVersionParams, Template, TemplateVersion};
use crate::workspace::{InsertWorkspaceBuildParams, InsertWorkspaceParams, Workspace, WorkspaceBuild};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Current time at the precision the store persists.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Opens a transaction. Dropping the returned handle without committing
    /// rolls it back.
    async fn begin(&self, isolation: IsolationLevel) -> StoreResult<Box<dyn StoreTx>>;
}

/// A transaction-scoped store handle.
///
/// Lookups by id return `StoreError::NotFound` when the row does not exist.
#[async_trait]
pub trait StoreTx: Send {
    async fn insert_workspace(&mut self, params: InsertWorkspaceParams) -> StoreResult<Workspace>;
    async fn get_workspace_by_id(&mut self, id: Uuid) -> StoreResult<Workspace>;

    async fn insert_template(&mut self, params: InsertTemplateParams) -> StoreResult<Template>;
    async fn get_template_by_id(&mut self, id: Uuid) -> StoreResult<Template>;
    async fn update_template_active_version(
        &mut self,
        template_id: Uuid,
        version_id: Uuid,
    ) -> StoreResult<()>;

    /// Inserts the version together with its declared parameter schema.
    async fn insert_template_version(
        &mut self,
        params: InsertTemplateVersionParams,
    ) -> StoreResult<TemplateVersion>;
    async fn get_template_version_by_id(&mut self, id: Uuid) -> StoreResult<TemplateVersion>;
    async fn get_template_version_parameters(
        &mut self,
        template_version_id: Uuid,
    ) -> StoreResult<Vec<TemplateVersionParameter>>;

    async fn insert_provisioner_job(
        &mut self,
        params: InsertProvisionerJobParams,
    ) -> StoreResult<ProvisionerJob>;
    async fn get_provisioner_job_by_id(&mut self, id: Uuid) -> StoreResult<ProvisionerJob>;
    async fn update_provisioner_job_with_start(
        &mut self,
        id: Uuid,
        worker_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn update_provisioner_job_with_complete(
        &mut self,
        id: Uuid,
        completed_at: DateTime<Utc>,
        error: Option<String>,
    ) -> StoreResult<()>;
    async fn update_provisioner_job_with_cancel(
        &mut self,
        id: Uuid,
        canceled_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn insert_workspace_build(
        &mut self,
        params: InsertWorkspaceBuildParams,
    ) -> StoreResult<WorkspaceBuild>;
    async fn get_latest_workspace_build_by_workspace_id(
        &mut self,
        workspace_id: Uuid,
    ) -> StoreResult<WorkspaceBuild>;
    /// All builds of a workspace, oldest first.
    async fn get_workspace_builds_by_workspace_id(
        &mut self,
        workspace_id: Uuid,
    ) -> StoreResult<Vec<WorkspaceBuild>>;

    async fn insert_workspace_build_parameters(
        &mut self,
        workspace_build_id: Uuid,
        parameters: &[BuildParameter],
    ) -> StoreResult<()>;
    async fn get_workspace_build_parameters(
        &mut self,
        workspace_build_id: Uuid,
    ) -> StoreResult<Vec<WorkspaceBuildParameter>>;

    async fn parameter_values(
        &mut self,
        scope: ParameterScope,
        scope_id: Uuid,
    ) -> StoreResult<Vec<ParameterValue>>;
    async fn insert_parameter_value(
        &mut self,
        params: InsertParameterValueParams,
    ) -> StoreResult<ParameterValue>;
    async fn delete_parameter_value_by_id(&mut self, id: Uuid) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
