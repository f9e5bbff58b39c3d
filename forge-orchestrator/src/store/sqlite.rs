//! SQLite backend.
//!
//! The pool is opened in WAL mode (see [`crate::db::create_pool`]). A deferred
//! transaction then reads from a single snapshot, which is at least as strong
//! as REPEATABLE READ, and a write attempted on a stale snapshot fails with
//! `SQLITE_BUSY_SNAPSHOT`, surfaced as a serialization failure.

use super::{now, IsolationLevel, Store, StoreTx};
use crate::authz::Acl;
use crate::error::{StoreError, StoreResult};
use crate::job::{
    InsertProvisionerJobParams, JobTags, ProvisionerJob, ProvisionerJobType, StorageMethod,
};
use crate::parameter::{
    BuildParameter, InsertParameterValueParams, ParameterDestinationScheme, ParameterScope,
    ParameterSourceScheme, ParameterType, ParameterValue, TemplateVersionParameter,
    ValidationMonotonic, WorkspaceBuildParameter,
};
use crate::template::{
    InsertTemplateParams, InsertTemplateVersionParams, ProvisionerType, Template, TemplateVersion,
};
use crate::workspace::{
    BuildReason, InsertWorkspaceBuildParams, InsertWorkspaceParams, Workspace, WorkspaceBuild,
    WorkspaceTransition,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn begin(&self, isolation: IsolationLevel) -> StoreResult<Box<dyn StoreTx>> {
        // Every level maps onto a deferred WAL transaction.
        tracing::trace!(?isolation, "beginning sqlite transaction");
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTx { tx }))
    }
}

pub struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
}

fn not_found(what: &str, id: Uuid) -> StoreError {
    StoreError::NotFound(format!("{} {}", what, id))
}

fn expect_affected(rows: u64, what: &str, id: Uuid) -> StoreResult<()> {
    if rows == 0 {
        return Err(not_found(what, id));
    }
    Ok(())
}

#[async_trait]
impl StoreTx for SqliteTx {
    async fn insert_workspace(&mut self, params: InsertWorkspaceParams) -> StoreResult<Workspace> {
        let now = now();
        sqlx::query(
            "INSERT INTO workspaces (id, created_at, updated_at, owner_id, organization_id, template_id, name, deleted)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(params.id.to_string())
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(params.owner_id.to_string())
        .bind(params.organization_id.to_string())
        .bind(params.template_id.to_string())
        .bind(&params.name)
        .execute(&mut *self.tx)
        .await?;

        Ok(Workspace {
            id: params.id,
            created_at: now,
            updated_at: now,
            owner_id: params.owner_id,
            organization_id: params.organization_id,
            template_id: params.template_id,
            name: params.name,
            deleted: false,
        })
    }

    async fn get_workspace_by_id(&mut self, id: Uuid) -> StoreResult<Workspace> {
        sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| not_found("workspace", id))?
            .try_into()
    }

    async fn insert_template(&mut self, params: InsertTemplateParams) -> StoreResult<Template> {
        let now = now();
        sqlx::query(
            "INSERT INTO templates (id, created_at, updated_at, organization_id, deleted, name, provisioner,
                                    active_version_id, description, created_by, user_acl, group_acl)
             VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.id.to_string())
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(params.organization_id.to_string())
        .bind(&params.name)
        .bind(params.provisioner)
        .bind(params.active_version_id.to_string())
        .bind(&params.description)
        .bind(params.created_by.to_string())
        .bind(serde_json::to_string(&params.user_acl)?)
        .bind(serde_json::to_string(&params.group_acl)?)
        .execute(&mut *self.tx)
        .await?;

        Ok(Template {
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
        })
    }

    async fn get_template_by_id(&mut self, id: Uuid) -> StoreResult<Template> {
        sqlx::query_as::<_, TemplateRow>("SELECT * FROM templates WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| not_found("template", id))?
            .try_into()
    }

    async fn update_template_active_version(
        &mut self,
        template_id: Uuid,
        version_id: Uuid,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE templates SET active_version_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(version_id.to_string())
        .bind(now().timestamp_millis())
        .bind(template_id.to_string())
        .execute(&mut *self.tx)
        .await?;

        expect_affected(result.rows_affected(), "template", template_id)
    }

    async fn insert_template_version(
        &mut self,
        params: InsertTemplateVersionParams,
    ) -> StoreResult<TemplateVersion> {
        let now = now();
        sqlx::query(
            "INSERT INTO template_versions (id, template_id, organization_id, created_at, updated_at,
                                            name, readme, job_id, created_by)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.id.to_string())
        .bind(params.template_id.map(|id| id.to_string()))
        .bind(params.organization_id.to_string())
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(&params.name)
        .bind(&params.readme)
        .bind(params.job_id.to_string())
        .bind(params.created_by.to_string())
        .execute(&mut *self.tx)
        .await?;

        for parameter in &params.parameters {
            sqlx::query(
                "INSERT INTO template_version_parameters
                    (template_version_id, name, description, type, mutable, default_value, icon, options,
                     validation_regex, validation_min, validation_max, validation_error,
                     validation_monotonic, required, legacy_variable_name, display_order)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(params.id.to_string())
            .bind(&parameter.name)
            .bind(&parameter.description)
            .bind(parameter.parameter_type)
            .bind(parameter.mutable)
            .bind(&parameter.default_value)
            .bind(&parameter.icon)
            .bind(serde_json::to_string(&parameter.options)?)
            .bind(&parameter.validation_regex)
            .bind(parameter.validation_min)
            .bind(parameter.validation_max)
            .bind(&parameter.validation_error)
            .bind(parameter.validation_monotonic)
            .bind(parameter.required)
            .bind(&parameter.legacy_variable_name)
            .bind(parameter.display_order)
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(TemplateVersion {
            id: params.id,
            template_id: params.template_id,
            organization_id: params.organization_id,
            created_at: now,
            updated_at: now,
            name: params.name,
            readme: params.readme,
            job_id: params.job_id,
            created_by: params.created_by,
        })
    }

    async fn get_template_version_by_id(&mut self, id: Uuid) -> StoreResult<TemplateVersion> {
        sqlx::query_as::<_, TemplateVersionRow>("SELECT * FROM template_versions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| not_found("template version", id))?
            .try_into()
    }

    async fn get_template_version_parameters(
        &mut self,
        template_version_id: Uuid,
    ) -> StoreResult<Vec<TemplateVersionParameter>> {
        let rows = sqlx::query_as::<_, TemplateVersionParameterRow>(
            "SELECT * FROM template_version_parameters
             WHERE template_version_id = ?
             ORDER BY display_order ASC, name ASC",
        )
        .bind(template_version_id.to_string())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn insert_provisioner_job(
        &mut self,
        params: InsertProvisionerJobParams,
    ) -> StoreResult<ProvisionerJob> {
        sqlx::query(
            "INSERT INTO provisioner_jobs (id, created_at, updated_at, organization_id, initiator_id,
                                           provisioner, storage_method, type, input, file_id, tags,
                                           trace_metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.id.to_string())
        .bind(params.created_at.timestamp_millis())
        .bind(params.created_at.timestamp_millis())
        .bind(params.organization_id.to_string())
        .bind(params.initiator_id.to_string())
        .bind(params.provisioner)
        .bind(params.storage_method)
        .bind(params.job_type)
        .bind(serde_json::to_string(&params.input)?)
        .bind(params.file_id.to_string())
        .bind(serde_json::to_string(&params.tags)?)
        .bind(
            params
                .trace_metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .execute(&mut *self.tx)
        .await?;

        Ok(ProvisionerJob {
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
        })
    }

    async fn get_provisioner_job_by_id(&mut self, id: Uuid) -> StoreResult<ProvisionerJob> {
        sqlx::query_as::<_, ProvisionerJobRow>("SELECT * FROM provisioner_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| not_found("provisioner job", id))?
            .try_into()
    }

    async fn update_provisioner_job_with_start(
        &mut self,
        id: Uuid,
        worker_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE provisioner_jobs SET started_at = ?, updated_at = ?, worker_id = ? WHERE id = ?",
        )
        .bind(started_at.timestamp_millis())
        .bind(started_at.timestamp_millis())
        .bind(worker_id.to_string())
        .bind(id.to_string())
        .execute(&mut *self.tx)
        .await?;

        expect_affected(result.rows_affected(), "provisioner job", id)
    }

    async fn update_provisioner_job_with_complete(
        &mut self,
        id: Uuid,
        completed_at: DateTime<Utc>,
        error: Option<String>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE provisioner_jobs SET completed_at = ?, updated_at = ?, error = ? WHERE id = ?",
        )
        .bind(completed_at.timestamp_millis())
        .bind(completed_at.timestamp_millis())
        .bind(error)
        .bind(id.to_string())
        .execute(&mut *self.tx)
        .await?;

        expect_affected(result.rows_affected(), "provisioner job", id)
    }

    async fn update_provisioner_job_with_cancel(
        &mut self,
        id: Uuid,
        canceled_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE provisioner_jobs SET canceled_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(canceled_at.timestamp_millis())
        .bind(canceled_at.timestamp_millis())
        .bind(id.to_string())
        .execute(&mut *self.tx)
        .await?;

        expect_affected(result.rows_affected(), "provisioner job", id)
    }

    async fn insert_workspace_build(
        &mut self,
        params: InsertWorkspaceBuildParams,
    ) -> StoreResult<WorkspaceBuild> {
        sqlx::query(
            "INSERT INTO workspace_builds (id, created_at, updated_at, workspace_id, template_version_id,
                                           build_number, transition, initiator_id, provisioner_state,
                                           job_id, reason)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.id.to_string())
        .bind(params.created_at.timestamp_millis())
        .bind(params.created_at.timestamp_millis())
        .bind(params.workspace_id.to_string())
        .bind(params.template_version_id.to_string())
        .bind(params.build_number)
        .bind(params.transition)
        .bind(params.initiator_id.to_string())
        .bind(&params.provisioner_state)
        .bind(params.job_id.to_string())
        .bind(params.reason)
        .execute(&mut *self.tx)
        .await?;

        Ok(WorkspaceBuild {
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
        })
    }

    async fn get_latest_workspace_build_by_workspace_id(
        &mut self,
        workspace_id: Uuid,
    ) -> StoreResult<WorkspaceBuild> {
        sqlx::query_as::<_, WorkspaceBuildRow>(
            "SELECT * FROM workspace_builds WHERE workspace_id = ? ORDER BY build_number DESC LIMIT 1",
        )
        .bind(workspace_id.to_string())
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| not_found("latest build of workspace", workspace_id))?
        .try_into()
    }

    async fn get_workspace_builds_by_workspace_id(
        &mut self,
        workspace_id: Uuid,
    ) -> StoreResult<Vec<WorkspaceBuild>> {
        let rows = sqlx::query_as::<_, WorkspaceBuildRow>(
            "SELECT * FROM workspace_builds WHERE workspace_id = ? ORDER BY build_number ASC",
        )
        .bind(workspace_id.to_string())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn insert_workspace_build_parameters(
        &mut self,
        workspace_build_id: Uuid,
        parameters: &[BuildParameter],
    ) -> StoreResult<()> {
        for parameter in parameters {
            sqlx::query(
                "INSERT INTO workspace_build_parameters (workspace_build_id, name, value) VALUES (?, ?, ?)",
            )
            .bind(workspace_build_id.to_string())
            .bind(&parameter.name)
            .bind(&parameter.value)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn get_workspace_build_parameters(
        &mut self,
        workspace_build_id: Uuid,
    ) -> StoreResult<Vec<WorkspaceBuildParameter>> {
        let rows = sqlx::query_as::<_, WorkspaceBuildParameterRow>(
            "SELECT * FROM workspace_build_parameters WHERE workspace_build_id = ? ORDER BY name ASC",
        )
        .bind(workspace_build_id.to_string())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn parameter_values(
        &mut self,
        scope: ParameterScope,
        scope_id: Uuid,
    ) -> StoreResult<Vec<ParameterValue>> {
        let rows = sqlx::query_as::<_, ParameterValueRow>(
            "SELECT * FROM parameter_values WHERE scope = ? AND scope_id = ? ORDER BY name ASC",
        )
        .bind(scope)
        .bind(scope_id.to_string())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn insert_parameter_value(
        &mut self,
        params: InsertParameterValueParams,
    ) -> StoreResult<ParameterValue> {
        sqlx::query(
            "INSERT INTO parameter_values (id, created_at, updated_at, scope, scope_id, name,
                                           source_scheme, source_value, destination_scheme)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.id.to_string())
        .bind(params.created_at.timestamp_millis())
        .bind(params.created_at.timestamp_millis())
        .bind(params.scope)
        .bind(params.scope_id.to_string())
        .bind(&params.name)
        .bind(params.source_scheme)
        .bind(&params.source_value)
        .bind(params.destination_scheme)
        .execute(&mut *self.tx)
        .await?;

        Ok(ParameterValue {
            id: params.id,
            created_at: params.created_at,
            updated_at: params.created_at,
            scope: params.scope,
            scope_id: params.scope_id,
            name: params.name,
            source_scheme: params.source_scheme,
            source_value: params.source_value,
            destination_scheme: params.destination_scheme,
        })
    }

    async fn delete_parameter_value_by_id(&mut self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM parameter_values WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *self.tx)
            .await?;

        expect_affected(result.rows_affected(), "parameter value", id)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// Internal row types for sqlx

fn parse_uuid(value: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(value).map_err(|e| StoreError::Decode(format!("invalid id {:?}: {}", value, e)))
}

fn parse_optional_uuid(value: Option<String>) -> StoreResult<Option<Uuid>> {
    value.as_deref().map(parse_uuid).transpose()
}

fn from_millis(ts: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ts)
        .ok_or_else(|| StoreError::Decode(format!("invalid timestamp {}", ts)))
}

fn from_optional_millis(ts: Option<i64>) -> StoreResult<Option<DateTime<Utc>>> {
    ts.map(from_millis).transpose()
}

#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: String,
    created_at: i64,
    updated_at: i64,
    owner_id: String,
    organization_id: String,
    template_id: String,
    name: String,
    deleted: bool,
}

impl TryFrom<WorkspaceRow> for Workspace {
    type Error = StoreError;

    fn try_from(row: WorkspaceRow) -> StoreResult<Self> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            owner_id: parse_uuid(&row.owner_id)?,
            organization_id: parse_uuid(&row.organization_id)?,
            template_id: parse_uuid(&row.template_id)?,
            name: row.name,
            deleted: row.deleted,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TemplateRow {
    id: String,
    created_at: i64,
    updated_at: i64,
    organization_id: String,
    deleted: bool,
    name: String,
    provisioner: ProvisionerType,
    active_version_id: String,
    description: String,
    created_by: String,
    user_acl: String,
    group_acl: String,
}

impl TryFrom<TemplateRow> for Template {
    type Error = StoreError;

    fn try_from(row: TemplateRow) -> StoreResult<Self> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            organization_id: parse_uuid(&row.organization_id)?,
            deleted: row.deleted,
            name: row.name,
            provisioner: row.provisioner,
            active_version_id: parse_uuid(&row.active_version_id)?,
            description: row.description,
            created_by: parse_uuid(&row.created_by)?,
            user_acl: serde_json::from_str::<Acl>(&row.user_acl)?,
            group_acl: serde_json::from_str::<Acl>(&row.group_acl)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TemplateVersionRow {
    id: String,
    template_id: Option<String>,
    organization_id: String,
    created_at: i64,
    updated_at: i64,
    name: String,
    readme: String,
    job_id: String,
    created_by: String,
}

impl TryFrom<TemplateVersionRow> for TemplateVersion {
    type Error = StoreError;

    fn try_from(row: TemplateVersionRow) -> StoreResult<Self> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            template_id: parse_optional_uuid(row.template_id)?,
            organization_id: parse_uuid(&row.organization_id)?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            name: row.name,
            readme: row.readme,
            job_id: parse_uuid(&row.job_id)?,
            created_by: parse_uuid(&row.created_by)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TemplateVersionParameterRow {
    template_version_id: String,
    name: String,
    description: String,
    #[sqlx(rename = "type")]
    parameter_type: ParameterType,
    mutable: bool,
    default_value: String,
    icon: String,
    options: String,
    validation_regex: String,
    validation_min: Option<i32>,
    validation_max: Option<i32>,
    validation_error: String,
    validation_monotonic: Option<ValidationMonotonic>,
    required: bool,
    legacy_variable_name: String,
    display_order: i32,
}

impl TryFrom<TemplateVersionParameterRow> for TemplateVersionParameter {
    type Error = StoreError;

    fn try_from(row: TemplateVersionParameterRow) -> StoreResult<Self> {
        Ok(Self {
            template_version_id: parse_uuid(&row.template_version_id)?,
            name: row.name,
            description: row.description,
            parameter_type: row.parameter_type,
            mutable: row.mutable,
            default_value: row.default_value,
            icon: row.icon,
            options: serde_json::from_str(&row.options)?,
            validation_regex: row.validation_regex,
            validation_min: row.validation_min,
            validation_max: row.validation_max,
            validation_error: row.validation_error,
            validation_monotonic: row.validation_monotonic,
            required: row.required,
            legacy_variable_name: row.legacy_variable_name,
            display_order: row.display_order,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProvisionerJobRow {
    id: String,
    created_at: i64,
    updated_at: i64,
    started_at: Option<i64>,
    canceled_at: Option<i64>,
    completed_at: Option<i64>,
    error: Option<String>,
    organization_id: String,
    initiator_id: String,
    provisioner: ProvisionerType,
    storage_method: StorageMethod,
    #[sqlx(rename = "type")]
    job_type: ProvisionerJobType,
    input: String,
    file_id: String,
    worker_id: Option<String>,
    tags: String,
    trace_metadata: Option<String>,
}

impl TryFrom<ProvisionerJobRow> for ProvisionerJob {
    type Error = StoreError;

    fn try_from(row: ProvisionerJobRow) -> StoreResult<Self> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            started_at: from_optional_millis(row.started_at)?,
            canceled_at: from_optional_millis(row.canceled_at)?,
            completed_at: from_optional_millis(row.completed_at)?,
            error: row.error,
            organization_id: parse_uuid(&row.organization_id)?,
            initiator_id: parse_uuid(&row.initiator_id)?,
            provisioner: row.provisioner,
            storage_method: row.storage_method,
            job_type: row.job_type,
            input: serde_json::from_str(&row.input)?,
            file_id: parse_uuid(&row.file_id)?,
            worker_id: parse_optional_uuid(row.worker_id)?,
            tags: serde_json::from_str::<JobTags>(&row.tags)?,
            trace_metadata: row
                .trace_metadata
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkspaceBuildRow {
    id: String,
    created_at: i64,
    updated_at: i64,
    workspace_id: String,
    template_version_id: String,
    build_number: i32,
    transition: WorkspaceTransition,
    initiator_id: String,
    provisioner_state: Vec<u8>,
    job_id: String,
    reason: BuildReason,
}

impl TryFrom<WorkspaceBuildRow> for WorkspaceBuild {
    type Error = StoreError;

    fn try_from(row: WorkspaceBuildRow) -> StoreResult<Self> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            workspace_id: parse_uuid(&row.workspace_id)?,
            template_version_id: parse_uuid(&row.template_version_id)?,
            build_number: row.build_number,
            transition: row.transition,
            initiator_id: parse_uuid(&row.initiator_id)?,
            provisioner_state: row.provisioner_state,
            job_id: parse_uuid(&row.job_id)?,
            reason: row.reason,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkspaceBuildParameterRow {
    workspace_build_id: String,
    name: String,
    value: String,
}

impl TryFrom<WorkspaceBuildParameterRow> for WorkspaceBuildParameter {
    type Error = StoreError;

    fn try_from(row: WorkspaceBuildParameterRow) -> StoreResult<Self> {
        Ok(Self {
            workspace_build_id: parse_uuid(&row.workspace_build_id)?,
            name: row.name,
            value: row.value,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ParameterValueRow {
    id: String,
    created_at: i64,
    updated_at: i64,
    scope: ParameterScope,
    scope_id: String,
    name: String,
    source_scheme: ParameterSourceScheme,
    source_value: String,
    destination_scheme: ParameterDestinationScheme,
}

impl TryFrom<ParameterValueRow> for ParameterValue {
    type Error = StoreError;

    fn try_from(row: ParameterValueRow) -> StoreResult<Self> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            scope: row.scope,
            scope_id: parse_uuid(&row.scope_id)?,
            name: row.name,
            source_scheme: row.source_scheme,
            source_value: row.source_value,
            destination_scheme: row.destination_scheme,
        })
    }
}
