//! In-memory store for development and testing.
//!
//! Each transaction works on a private copy of the tables taken at `begin`.
//! Commits are first-committer-wins over the whole store: a transaction that
//! wrote anything fails with a serialization failure if another transaction
//! committed writes after its snapshot was taken. Read-only transactions
//! always commit.

use super::{now, IsolationLevel, Store, StoreTx};
use crate::error::{StoreError, StoreResult};
use crate::job::{InsertProvisionerJobParams, ProvisionerJob};
use crate::parameter::{
    BuildParameter, InsertParameterValueParams, ParameterScope, ParameterValue,
    TemplateVersionParameter, WorkspaceBuildParameter,
};
use crate::template::{InsertTemplateParams, InsertTemplateVersionParams, Template, TemplateVersion};
use crate::workspace::{
    InsertWorkspaceBuildParams, InsertWorkspaceParams, Workspace, WorkspaceBuild,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct Tables {
    workspaces: BTreeMap<Uuid, Workspace>,
    templates: BTreeMap<Uuid, Template>,
    template_versions: BTreeMap<Uuid, TemplateVersion>,
    template_version_parameters: BTreeMap<Uuid, Vec<TemplateVersionParameter>>,
    provisioner_jobs: BTreeMap<Uuid, ProvisionerJob>,
    workspace_builds: BTreeMap<Uuid, WorkspaceBuild>,
    workspace_build_parameters: BTreeMap<Uuid, Vec<WorkspaceBuildParameter>>,
    parameter_values: BTreeMap<Uuid, ParameterValue>,
}

#[derive(Debug, Default)]
struct Shared {
    tables: Tables,
    /// Bumped by every commit that wrote something.
    version: u64,
    injected_failures: u32,
    transactions_begun: u64,
    commit_attempts: u64,
}

/// In-memory [`Store`] with snapshot isolation.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail with a serialization failure,
    /// whatever the transaction did.
    pub fn inject_serialization_failures(&self, count: u32) {
        self.shared().injected_failures = count;
    }

    /// Number of transactions opened so far.
    pub fn transactions_begun(&self) -> u64 {
        self.shared().transactions_begun
    }

    /// Number of commits attempted so far, successful or not.
    pub fn commit_attempts(&self) -> u64 {
        self.shared().commit_attempts
    }

    // Counters stay readable after a panic in another test thread.
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Shared>> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Backend(format!("memory store lock poisoned: {}", e)))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self, isolation: IsolationLevel) -> StoreResult<Box<dyn StoreTx>> {
        let mut shared = self.lock()?;
        shared.transactions_begun += 1;
        tracing::trace!(?isolation, version = shared.version, "beginning memory transaction");

        Ok(Box::new(MemoryTx {
            store: self.clone(),
            snapshot_version: shared.version,
            tables: shared.tables.clone(),
            dirty: false,
        }))
    }
}

pub struct MemoryTx {
    store: MemoryStore,
    snapshot_version: u64,
    tables: Tables,
    dirty: bool,
}

fn not_found(what: &str, id: Uuid) -> StoreError {
    StoreError::NotFound(format!("{} {}", what, id))
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert_workspace(&mut self, params: InsertWorkspaceParams) -> StoreResult<Workspace> {
        if self.tables.workspaces.contains_key(&params.id) {
            return Err(StoreError::Constraint(format!("workspace {} exists", params.id)));
        }
        let now = now();
        let workspace = Workspace {
            id: params.id,
            created_at: now,
            updated_at: now,
            owner_id: params.owner_id,
            organization_id: params.organization_id,
            template_id: params.template_id,
            name: params.name,
            deleted: false,
        };
        self.tables.workspaces.insert(workspace.id, workspace.clone());
        self.dirty = true;
        Ok(workspace)
    }

    async fn get_workspace_by_id(&mut self, id: Uuid) -> StoreResult<Workspace> {
        self.tables
            .workspaces
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("workspace", id))
    }

    async fn insert_template(&mut self, params: InsertTemplateParams) -> StoreResult<Template> {
        if self.tables.templates.contains_key(&params.id) {
            return Err(StoreError::Constraint(format!("template {} exists", params.id)));
        }
        let now = now();
        let template = Template {
            id: params.id,
            created_at: now,
            updated_at: now,
            organization_id: params.organization_id,
            deleted: false,
            name: params.name,
            provisioner: params.provisioner,
            active_version_id: params.active_version_id,
            description: params.description,
            created_by: params.created_by,
            user_acl: params.user_acl,
            group_acl: params.group_acl,
        };
        self.tables.templates.insert(template.id, template.clone());
        self.dirty = true;
        Ok(template)
    }

    async fn get_template_by_id(&mut self, id: Uuid) -> StoreResult<Template> {
        self.tables
            .templates
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("template", id))
    }

    async fn update_template_active_version(
        &mut self,
        template_id: Uuid,
        version_id: Uuid,
    ) -> StoreResult<()> {
        let template = self
            .tables
            .templates
            .get_mut(&template_id)
            .ok_or_else(|| not_found("template", template_id))?;
        template.active_version_id = version_id;
        template.updated_at = now();
        self.dirty = true;
        Ok(())
    }

    async fn insert_template_version(
        &mut self,
        params: InsertTemplateVersionParams,
    ) -> StoreResult<TemplateVersion> {
        if self.tables.template_versions.contains_key(&params.id) {
            return Err(StoreError::Constraint(format!(
                "template version {} exists",
                params.id
            )));
        }
        let now = now();
        let version = TemplateVersion {
            id: params.id,
            template_id: params.template_id,
            organization_id: params.organization_id,
            created_at: now,
            updated_at: now,
            name: params.name,
            readme: params.readme,
            job_id: params.job_id,
            created_by: params.created_by,
        };
        let mut parameters = params.parameters;
        for parameter in &mut parameters {
            parameter.template_version_id = version.id;
        }
        parameters.sort_by(|a, b| {
            a.display_order
                .cmp(&b.display_order)
                .then_with(|| a.name.cmp(&b.name))
        });

        self.tables
            .template_version_parameters
            .insert(version.id, parameters);
        self.tables.template_versions.insert(version.id, version.clone());
        self.dirty = true;
        Ok(version)
    }

    async fn get_template_version_by_id(&mut self, id: Uuid) -> StoreResult<TemplateVersion> {
        self.tables
            .template_versions
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("template version", id))
    }

    async fn get_template_version_parameters(
        &mut self,
        template_version_id: Uuid,
    ) -> StoreResult<Vec<TemplateVersionParameter>> {
        Ok(self
            .tables
            .template_version_parameters
            .get(&template_version_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_provisioner_job(
        &mut self,
        params: InsertProvisionerJobParams,
    ) -> StoreResult<ProvisionerJob> {
        if self.tables.provisioner_jobs.contains_key(&params.id) {
            return Err(StoreError::Constraint(format!(
                "provisioner job {} exists",
                params.id
            )));
        }
        let job = ProvisionerJob {
            id: params.id,
            created_at: params.created_at,
            updated_at: params.created_at,
            started_at: None,
            canceled_at: None,
            completed_at: None,
            error: None,
            organization_id: params.organization_id,
            initiator_id: params.initiator_id,
            provisioner: params.provisioner,
            storage_method: params.storage_method,
            job_type: params.job_type,
            input: params.input,
            file_id: params.file_id,
            worker_id: None,
            tags: params.tags,
            trace_metadata: params.trace_metadata,
        };
        self.tables.provisioner_jobs.insert(job.id, job.clone());
        self.dirty = true;
        Ok(job)
    }

    async fn get_provisioner_job_by_id(&mut self, id: Uuid) -> StoreResult<ProvisionerJob> {
        self.tables
            .provisioner_jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("provisioner job", id))
    }

    async fn update_provisioner_job_with_start(
        &mut self,
        id: Uuid,
        worker_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let job = self
            .tables
            .provisioner_jobs
            .get_mut(&id)
            .ok_or_else(|| not_found("provisioner job", id))?;
        job.started_at = Some(started_at);
        job.updated_at = started_at;
        job.worker_id = Some(worker_id);
        self.dirty = true;
        Ok(())
    }

    async fn update_provisioner_job_with_complete(
        &mut self,
        id: Uuid,
        completed_at: DateTime<Utc>,
        error: Option<String>,
    ) -> StoreResult<()> {
        let job = self
            .tables
            .provisioner_jobs
            .get_mut(&id)
            .ok_or_else(|| not_found("provisioner job", id))?;
        job.completed_at = Some(completed_at);
        job.updated_at = completed_at;
        job.error = error;
        self.dirty = true;
        Ok(())
    }

    async fn update_provisioner_job_with_cancel(
        &mut self,
        id: Uuid,
        canceled_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let job = self
            .tables
            .provisioner_jobs
            .get_mut(&id)
            .ok_or_else(|| not_found("provisioner job", id))?;
        job.canceled_at = Some(canceled_at);
        job.updated_at = canceled_at;
        self.dirty = true;
        Ok(())
    }

    async fn insert_workspace_build(
        &mut self,
        params: InsertWorkspaceBuildParams,
    ) -> StoreResult<WorkspaceBuild> {
        let duplicate = self.tables.workspace_builds.values().any(|b| {
            b.id == params.id
                || b.job_id == params.job_id
                || (b.workspace_id == params.workspace_id && b.build_number == params.build_number)
        });
        if duplicate {
            return Err(StoreError::Constraint(format!(
                "build {} of workspace {} exists",
                params.build_number, params.workspace_id
            )));
        }
        let build = WorkspaceBuild {
            id: params.id,
            created_at: params.created_at,
            updated_at: params.created_at,
            workspace_id: params.workspace_id,
            template_version_id: params.template_version_id,
            build_number: params.build_number,
            transition: params.transition,
            initiator_id: params.initiator_id,
            provisioner_state: params.provisioner_state,
            job_id: params.job_id,
            reason: params.reason,
        };
        self.tables.workspace_builds.insert(build.id, build.clone());
        self.dirty = true;
        Ok(build)
    }

    async fn get_latest_workspace_build_by_workspace_id(
        &mut self,
        workspace_id: Uuid,
    ) -> StoreResult<WorkspaceBuild> {
        self.tables
            .workspace_builds
            .values()
            .filter(|b| b.workspace_id == workspace_id)
            .max_by_key(|b| b.build_number)
            .cloned()
            .ok_or_else(|| not_found("latest build of workspace", workspace_id))
    }

    async fn get_workspace_builds_by_workspace_id(
        &mut self,
        workspace_id: Uuid,
    ) -> StoreResult<Vec<WorkspaceBuild>> {
        let mut builds: Vec<WorkspaceBuild> = self
            .tables
            .workspace_builds
            .values()
            .filter(|b| b.workspace_id == workspace_id)
            .cloned()
            .collect();
        builds.sort_by_key(|b| b.build_number);
        Ok(builds)
    }

    async fn insert_workspace_build_parameters(
        &mut self,
        workspace_build_id: Uuid,
        parameters: &[BuildParameter],
    ) -> StoreResult<()> {
        let rows = self
            .tables
            .workspace_build_parameters
            .entry(workspace_build_id)
            .or_default();
        for parameter in parameters {
            if rows.iter().any(|r| r.name == parameter.name) {
                return Err(StoreError::Constraint(format!(
                    "build parameter {} of build {} exists",
                    parameter.name, workspace_build_id
                )));
            }
            rows.push(WorkspaceBuildParameter {
                workspace_build_id,
                name: parameter.name.clone(),
                value: parameter.value.clone(),
            });
        }
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        self.dirty = true;
        Ok(())
    }

    async fn get_workspace_build_parameters(
        &mut self,
        workspace_build_id: Uuid,
    ) -> StoreResult<Vec<WorkspaceBuildParameter>> {
        Ok(self
            .tables
            .workspace_build_parameters
            .get(&workspace_build_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn parameter_values(
        &mut self,
        scope: ParameterScope,
        scope_id: Uuid,
    ) -> StoreResult<Vec<ParameterValue>> {
        let mut values: Vec<ParameterValue> = self
            .tables
            .parameter_values
            .values()
            .filter(|v| v.scope == scope && v.scope_id == scope_id)
            .cloned()
            .collect();
        values.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(values)
    }

    async fn insert_parameter_value(
        &mut self,
        params: InsertParameterValueParams,
    ) -> StoreResult<ParameterValue> {
        let duplicate = self.tables.parameter_values.values().any(|v| {
            v.id == params.id
                || (v.scope == params.scope && v.scope_id == params.scope_id && v.name == params.name)
        });
        if duplicate {
            return Err(StoreError::Constraint(format!(
                "parameter value {} in scope {} exists",
                params.name, params.scope_id
            )));
        }
        let value = ParameterValue {
            id: params.id,
            created_at: params.created_at,
            updated_at: params.created_at,
            scope: params.scope,
            scope_id: params.scope_id,
            name: params.name,
            source_scheme: params.source_scheme,
            source_value: params.source_value,
            destination_scheme: params.destination_scheme,
        };
        self.tables.parameter_values.insert(value.id, value.clone());
        self.dirty = true;
        Ok(value)
    }

    async fn delete_parameter_value_by_id(&mut self, id: Uuid) -> StoreResult<()> {
        self.tables
            .parameter_values
            .remove(&id)
            .ok_or_else(|| not_found("parameter value", id))?;
        self.dirty = true;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let this = *self;
        let mut shared = this.store.lock()?;
        shared.commit_attempts += 1;

        if shared.injected_failures > 0 {
            shared.injected_failures -= 1;
            return Err(StoreError::SerializationFailure(
                "injected serialization failure".to_string(),
            ));
        }
        if !this.dirty {
            return Ok(());
        }
        if shared.version != this.snapshot_version {
            return Err(StoreError::SerializationFailure(format!(
                "could not serialize access: snapshot {} is behind {}",
                this.snapshot_version, shared.version
            )));
        }

        shared.tables = this.tables;
        shared.version += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
