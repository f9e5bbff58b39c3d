//! Service facade over the store and the build orchestrator.
//!
//! Consumed by HTTP handlers, CLI commands or background workers. Every
//! mutating entry point goes through [`WorkspaceBuilder`].

use crate::authz::{Action, Authorizer, Object, ResourceType};
use crate::builder::WorkspaceBuilder;
use crate::config::OrchestratorConfig;
use crate::db;
use crate::error::{BuildError, BuildErrorStatus, Result, StoreError, StoreResult};
use crate::job::ProvisionerJob;
use crate::store::{IsolationLevel, SqliteStore, Store, StoreTx};
use crate::workspace::{
    CreateWorkspaceBuildRequest, CreateWorkspaceRequest, InsertWorkspaceParams, Workspace,
    WorkspaceBuild, WorkspaceTransition,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct WorkspaceOrchestrator {
    store: Arc<dyn Store>,
    config: OrchestratorConfig,
}

impl WorkspaceOrchestrator {
    pub fn new(store: Arc<dyn Store>, config: OrchestratorConfig) -> Self {
        Self { store, config }
    }

    /// Opens the SQLite database named by `config` and brings its schema up to date.
    pub async fn connect(config: OrchestratorConfig) -> StoreResult<Self> {
        if config.db_path.exists() {
            let backup_path = db::backup_database(&config.db_path)?;
            info!("Database backed up to: {}", backup_path.display());
        }

        let pool = db::create_pool(&config).await?;
        db::run_migrations(&pool).await?;
        Ok(Self::new(Arc::new(SqliteStore::new(pool)), config))
    }

    /// Get a reference to the underlying store
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// A builder for `workspace` carrying this orchestrator's retry bound.
    pub fn builder(&self, workspace: Workspace, transition: WorkspaceTransition) -> WorkspaceBuilder {
        WorkspaceBuilder::new(workspace, transition).max_attempts(self.config.max_build_attempts)
    }

    /// Creates a workspace together with its first `start` build.
    #[instrument(skip_all, fields(name = %req.name, template_id = %req.template_id))]
    pub async fn create_workspace(
        &self,
        req: CreateWorkspaceRequest,
        authorizer: Option<&dyn Authorizer>,
    ) -> Result<(Workspace, WorkspaceBuild, ProvisionerJob)> {
        let attempts = self.config.max_build_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.try_create_workspace(&req, authorizer).await {
                Ok((workspace, build, job)) => {
                    info!(
                        attempt,
                        workspace_id = %workspace.id,
                        job_id = %job.id,
                        "workspace created"
                    );
                    return Ok((workspace, build, job));
                }
                Err(err) if err.is_serialization_failure() => {
                    warn!(attempt, error = %err, "serialization failure, retrying workspace creation");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        let message = format!("too many serialization failures after {} attempts", attempts);
        Err(match last_error {
            Some(err) => BuildError::with_cause(BuildErrorStatus::Internal, message, err),
            None => BuildError::new(BuildErrorStatus::Internal, message),
        })
    }

    async fn try_create_workspace(
        &self,
        req: &CreateWorkspaceRequest,
        authorizer: Option<&dyn Authorizer>,
    ) -> Result<(Workspace, WorkspaceBuild, ProvisionerJob)> {
        let mut tx = self
            .store
            .begin(IsolationLevel::RepeatableRead)
            .await
            .map_err(|e| BuildError::store("begin transaction", e))?;

        let template = tx.get_template_by_id(req.template_id).await.map_err(|e| {
            if e.is_not_found() {
                BuildError::with_cause(BuildErrorStatus::NotFound, "template not found", e)
            } else {
                BuildError::store("fetch template", e)
            }
        })?;
        if template.deleted {
            return Err(BuildError::not_found("template not found"));
        }

        let workspace_id = Uuid::new_v4();
        if let Some(authorizer) = authorizer {
            let candidate = Object {
                resource_type: ResourceType::Workspace,
                id: workspace_id,
                owner_id: Some(req.owner_id),
                organization_id: template.organization_id,
                user_acl: Default::default(),
                group_acl: Default::default(),
            };
            if !authorizer.authorize(Action::Create, &candidate) {
                return Err(BuildError::forbidden("Unauthorized to create a workspace."));
            }
        }

        let workspace = tx
            .insert_workspace(InsertWorkspaceParams {
                id: workspace_id,
                owner_id: req.owner_id,
                organization_id: template.organization_id,
                template_id: template.id,
                name: req.name.clone(),
            })
            .await
            .map_err(|e| BuildError::store("insert workspace", e))?;

        let mut builder = self
            .builder(workspace.clone(), WorkspaceTransition::Start)
            .rich_parameter_values(req.rich_parameter_values.clone())
            .legacy_parameter_values(req.parameter_values.clone());
        builder = match req.template_version_id {
            Some(version_id) => builder.version_id(version_id),
            None => builder.active_version(),
        };

        let (build, job) = builder.build_in_tx(tx.as_mut(), authorizer).await?;

        tx.commit()
            .await
            .map_err(|e| BuildError::store("commit transaction", e))?;
        Ok((workspace, build, job))
    }

    /// Queues a new build of an existing workspace.
    #[instrument(skip(self, req, authorizer))]
    pub async fn create_build(
        &self,
        workspace_id: Uuid,
        transition: WorkspaceTransition,
        req: CreateWorkspaceBuildRequest,
        authorizer: Option<&dyn Authorizer>,
    ) -> Result<(WorkspaceBuild, ProvisionerJob)> {
        if req.orphan {
            if transition != WorkspaceTransition::Delete {
                return Err(BuildError::bad_request(
                    "Orphan is only permitted when deleting a workspace.",
                ));
            }
            if req.state.is_some() {
                return Err(BuildError::bad_request(
                    "Orphan cannot be combined with an explicit state.",
                ));
            }
        }

        let workspace = self.get_workspace(workspace_id).await?;
        let mut builder = self
            .builder(workspace, transition)
            .reason(req.reason)
            .rich_parameter_values(req.rich_parameter_values)
            .legacy_parameter_values(req.parameter_values);
        if let Some(initiator) = req.initiator_id {
            builder = builder.initiator(initiator);
        }
        if let Some(version_id) = req.template_version_id {
            builder = builder.version_id(version_id);
        }
        if let Some(state) = req.state {
            builder = builder.state(state);
        }
        if req.orphan {
            builder = builder.orphan();
        }
        if let Some(level) = req.log_level {
            builder = builder.log_level(level);
        }

        builder.build(self.store.as_ref(), authorizer).await
    }

    pub async fn start_workspace(
        &self,
        workspace_id: Uuid,
        req: CreateWorkspaceBuildRequest,
        authorizer: Option<&dyn Authorizer>,
    ) -> Result<(WorkspaceBuild, ProvisionerJob)> {
        self.create_build(workspace_id, WorkspaceTransition::Start, req, authorizer)
            .await
    }

    pub async fn stop_workspace(
        &self,
        workspace_id: Uuid,
        req: CreateWorkspaceBuildRequest,
        authorizer: Option<&dyn Authorizer>,
    ) -> Result<(WorkspaceBuild, ProvisionerJob)> {
        self.create_build(workspace_id, WorkspaceTransition::Stop, req, authorizer)
            .await
    }

    pub async fn delete_workspace(
        &self,
        workspace_id: Uuid,
        req: CreateWorkspaceBuildRequest,
        authorizer: Option<&dyn Authorizer>,
    ) -> Result<(WorkspaceBuild, ProvisionerJob)> {
        self.create_build(workspace_id, WorkspaceTransition::Delete, req, authorizer)
            .await
    }

    pub async fn get_workspace(&self, id: Uuid) -> Result<Workspace> {
        let mut tx = self.begin_read().await?;
        let workspace = tx
            .get_workspace_by_id(id)
            .await
            .map_err(|e| not_found_or("workspace", "fetch workspace", e))?;
        tx.commit()
            .await
            .map_err(|e| BuildError::store("commit transaction", e))?;
        Ok(workspace)
    }

    pub async fn latest_build(&self, workspace_id: Uuid) -> Result<WorkspaceBuild> {
        let mut tx = self.begin_read().await?;
        let build = tx
            .get_latest_workspace_build_by_workspace_id(workspace_id)
            .await
            .map_err(|e| not_found_or("workspace build", "fetch latest workspace build", e))?;
        tx.commit()
            .await
            .map_err(|e| BuildError::store("commit transaction", e))?;
        Ok(build)
    }

    /// All builds of a workspace, oldest first.
    pub async fn list_builds(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceBuild>> {
        let mut tx = self.begin_read().await?;
        let builds = tx
            .get_workspace_builds_by_workspace_id(workspace_id)
            .await
            .map_err(|e| BuildError::store("list workspace builds", e))?;
        tx.commit()
            .await
            .map_err(|e| BuildError::store("commit transaction", e))?;
        Ok(builds)
    }

    async fn begin_read(&self) -> Result<Box<dyn StoreTx>> {
        self.store
            .begin(IsolationLevel::ReadCommitted)
            .await
            .map_err(|e| BuildError::store("begin transaction", e))
    }
}

fn not_found_or(what: &str, operation: &str, err: StoreError) -> BuildError {
    if err.is_not_found() {
        BuildError::with_cause(BuildErrorStatus::NotFound, format!("{} not found", what), err)
    } else {
        BuildError::store(operation, err)
    }
}
