//! Workspace build orchestration.
//!
//! A [`WorkspaceBuilder`] turns a requested transition of a workspace into a
//! new [`WorkspaceBuild`] and the [`ProvisionerJob`] that realizes it. Both
//! rows, the resolved rich parameters and any legacy parameter overrides are
//! written in a single REPEATABLE READ transaction. The transaction is retried
//! from scratch when the store reports a serialization failure.

use crate::authz::{Action, Authorizer, Objecter};
use crate::config::DEFAULT_MAX_BUILD_ATTEMPTS;
use crate::error::{BuildError, BuildErrorStatus, Result, StoreResult};
use crate::job::{
    mutate_tags, InsertProvisionerJobParams, ProvisionerJob, ProvisionerJobStatus,
    ProvisionerJobType, ProvisionerLogLevel, WorkspaceProvisionJob,
};
use crate::parameter::{
    BuildParameter, CreateParameterRequest, DefaultParameterResolver, InsertParameterValueParams,
    ParameterResolver, ParameterScope, ParameterValue, TemplateVersionParameter,
    WorkspaceBuildParameter,
};
use crate::store::{now, IsolationLevel, Store, StoreTx};
use crate::template::{Template, TemplateVersion};
use crate::workspace::{
    BuildReason, InsertWorkspaceBuildParams, Workspace, WorkspaceBuild, WorkspaceTransition,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Message used when the caller may not act on the workspace at all. It is
/// the same wording as for a missing workspace.
const RESOURCE_NOT_FOUND: &str = "Resource not found or you do not have access to this resource";

/// Which template version the new build uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionTarget {
    Specific(Uuid),
    /// The template's active version at the time of the build.
    Active,
    /// The version of the last build, or the active version for a first build.
    #[default]
    LastBuild,
}

/// Which provisioner state the new build starts from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StateTarget {
    Explicit(Vec<u8>),
    /// Empty state, used to abandon resources.
    Orphan,
    /// Copy of the last build's state, or empty for a first build.
    #[default]
    LastBuild,
}

impl StateTarget {
    fn is_custom(&self) -> bool {
        !matches!(self, StateTarget::LastBuild)
    }
}

/// Immutable description of a build request.
///
/// Setters consume and return the builder, so a configured value can be
/// cloned and reused as the base for several requests.
#[derive(Clone)]
pub struct WorkspaceBuilder {
    workspace: Workspace,
    transition: WorkspaceTransition,
    version: VersionTarget,
    state: StateTarget,
    log_level: Option<ProvisionerLogLevel>,
    initiator: Option<Uuid>,
    reason: BuildReason,
    legacy_parameter_values: Vec<CreateParameterRequest>,
    rich_parameter_values: Vec<BuildParameter>,
    resolver: Arc<dyn ParameterResolver>,
    max_attempts: u32,
    last_build: Option<WorkspaceBuild>,
    last_build_job: Option<ProvisionerJob>,
}

impl WorkspaceBuilder {
    pub fn new(workspace: Workspace, transition: WorkspaceTransition) -> Self {
        Self {
            workspace,
            transition,
            version: VersionTarget::default(),
            state: StateTarget::default(),
            log_level: None,
            initiator: None,
            reason: BuildReason::default(),
            legacy_parameter_values: Vec::new(),
            rich_parameter_values: Vec::new(),
            resolver: Arc::new(DefaultParameterResolver),
            max_attempts: DEFAULT_MAX_BUILD_ATTEMPTS,
            last_build: None,
            last_build_job: None,
        }
    }

    pub fn version_id(mut self, id: Uuid) -> Self {
        self.version = VersionTarget::Specific(id);
        self
    }

    pub fn active_version(mut self) -> Self {
        self.version = VersionTarget::Active;
        self
    }

    pub fn state(mut self, state: Vec<u8>) -> Self {
        self.state = StateTarget::Explicit(state);
        self
    }

    pub fn orphan(mut self) -> Self {
        self.state = StateTarget::Orphan;
        self
    }

    pub fn log_level(mut self, level: ProvisionerLogLevel) -> Self {
        self.log_level = Some(level);
        self
    }

    pub fn initiator(mut self, user_id: Uuid) -> Self {
        self.initiator = Some(user_id);
        self
    }

    pub fn reason(mut self, reason: BuildReason) -> Self {
        self.reason = reason;
        self
    }

    pub fn legacy_parameter_values(mut self, values: Vec<CreateParameterRequest>) -> Self {
        self.legacy_parameter_values = values;
        self
    }

    pub fn rich_parameter_values(mut self, values: Vec<BuildParameter>) -> Self {
        self.rich_parameter_values = values;
        self
    }

    pub fn parameter_resolver(mut self, resolver: Arc<dyn ParameterResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Bounds the retry loop of [`build`](Self::build). At least one attempt is always made.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Seeds the last build so it is not fetched again.
    ///
    /// Only honored by [`build_in_tx`](Self::build_in_tx), and only correct if
    /// `build` was read inside that same transaction.
    pub fn set_last_workspace_build_in_tx(mut self, build: WorkspaceBuild) -> Self {
        self.last_build = Some(build);
        self
    }

    /// Seeds the job of the last build. Same caveats as
    /// [`set_last_workspace_build_in_tx`](Self::set_last_workspace_build_in_tx).
    pub fn set_last_workspace_build_job_in_tx(mut self, job: ProvisionerJob) -> Self {
        self.last_build_job = Some(job);
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn transition(&self) -> WorkspaceTransition {
        self.transition
    }

    /// Creates the build in its own transaction, retrying on serialization
    /// failures.
    #[instrument(skip_all, fields(workspace_id = %self.workspace.id, transition = %self.transition))]
    pub async fn build(
        &self,
        store: &dyn Store,
        authorizer: Option<&dyn Authorizer>,
    ) -> Result<(WorkspaceBuild, ProvisionerJob)> {
        if self.last_build.is_some() || self.last_build_job.is_some() {
            debug!("ignoring seeded last build: it was not read in a transaction opened here");
        }

        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            debug!(attempt, "starting build attempt");
            match self.attempt(store, authorizer).await {
                Ok((build, job)) => {
                    info!(
                        attempt,
                        build_number = build.build_number,
                        job_id = %job.id,
                        "workspace build committed"
                    );
                    return Ok((build, job));
                }
                Err(err) if err.is_serialization_failure() => {
                    warn!(attempt, error = %err, "serialization failure, retrying build");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        let message = format!(
            "too many serialization failures after {} attempts",
            self.max_attempts
        );
        Err(match last_error {
            Some(err) => BuildError::with_cause(BuildErrorStatus::Internal, message, err),
            None => BuildError::new(BuildErrorStatus::Internal, message),
        })
    }

    /// Runs a single attempt inside a transaction owned by the caller.
    ///
    /// Nothing is committed here; on error the caller must discard `tx`.
    pub async fn build_in_tx(
        &self,
        tx: &mut dyn StoreTx,
        authorizer: Option<&dyn Authorizer>,
    ) -> Result<(WorkspaceBuild, ProvisionerJob)> {
        let cache = AttemptCache {
            last_build: self.last_build.clone().map(Some),
            last_build_job: self.last_build_job.clone().map(Some),
            ..AttemptCache::default()
        };
        BuildAttempt::new(self, tx, cache).run(authorizer).await
    }

    async fn attempt(
        &self,
        store: &dyn Store,
        authorizer: Option<&dyn Authorizer>,
    ) -> Result<(WorkspaceBuild, ProvisionerJob)> {
        let mut tx = store
            .begin(IsolationLevel::RepeatableRead)
            .await
            .map_err(|e| BuildError::store("begin transaction", e))?;

        // An early return drops `tx`, which rolls it back.
        let created = BuildAttempt::new(self, tx.as_mut(), AttemptCache::default())
            .run(authorizer)
            .await?;

        tx.commit()
            .await
            .map_err(|e| BuildError::store("commit transaction", e))?;
        Ok(created)
    }
}

/// Rows read during one attempt. Never shared between attempts.
///
/// `last_build` and `last_build_job` distinguish "not fetched yet" (`None`)
/// from "the workspace has no prior build" (`Some(None)`).
#[derive(Default)]
struct AttemptCache {
    template: Option<Template>,
    template_version: Option<TemplateVersion>,
    template_version_job: Option<ProvisionerJob>,
    template_version_parameters: Option<Vec<TemplateVersionParameter>>,
    last_build: Option<Option<WorkspaceBuild>>,
    last_build_job: Option<Option<ProvisionerJob>>,
    last_build_parameters: Option<Vec<WorkspaceBuildParameter>>,
    last_parameter_values: Option<Vec<ParameterValue>>,
}

struct BuildAttempt<'a> {
    builder: &'a WorkspaceBuilder,
    tx: &'a mut dyn StoreTx,
    cache: AttemptCache,
}

impl<'a> BuildAttempt<'a> {
    fn new(builder: &'a WorkspaceBuilder, tx: &'a mut dyn StoreTx, cache: AttemptCache) -> Self {
        Self { builder, tx, cache }
    }

    async fn run(
        mut self,
        authorizer: Option<&dyn Authorizer>,
    ) -> Result<(WorkspaceBuild, ProvisionerJob)> {
        if let Some(authorizer) = authorizer {
            self.authorize(authorizer).await?;
        }
        self.check_template_version_matches_template().await?;
        self.check_template_job_status().await?;
        self.check_running_build().await?;

        let builder = self.builder;
        let workspace = &builder.workspace;
        let template = self
            .template()
            .await
            .map_err(|e| BuildError::store("fetch template", e))?;
        let template_version_job = self
            .template_version_job()
            .await
            .map_err(|e| BuildError::store("fetch template version job", e))?;
        let initiator = builder.initiator.unwrap_or(workspace.owner_id);

        self.upsert_legacy_parameters().await?;
        let parameters = self.resolve_parameters().await?;

        let template_version_id = self
            .template_version_id()
            .await
            .map_err(|e| BuildError::store("compute template version ID", e))?;
        let build_number = self
            .build_number()
            .await
            .map_err(|e| BuildError::store("compute build number", e))?;
        let state = self
            .state()
            .await
            .map_err(|e| BuildError::store("compute build state", e))?;

        let workspace_build_id = Uuid::new_v4();
        let input = serde_json::to_value(WorkspaceProvisionJob {
            workspace_build_id,
            dry_run: false,
            log_level: builder.log_level,
        })
        .map_err(|e| {
            BuildError::with_cause(BuildErrorStatus::Internal, "failed to marshal provision job", e)
        })?;

        let created_at = now();
        let job = self
            .tx
            .insert_provisioner_job(InsertProvisionerJobParams {
                id: Uuid::new_v4(),
                created_at,
                organization_id: template.organization_id,
                initiator_id: initiator,
                provisioner: template.provisioner,
                storage_method: template_version_job.storage_method,
                job_type: ProvisionerJobType::WorkspaceBuild,
                input,
                file_id: template_version_job.file_id,
                tags: mutate_tags(workspace.owner_id, &template_version_job.tags),
                trace_metadata: Some(trace_metadata()),
            })
            .await
            .map_err(|e| BuildError::store("insert provisioner job", e))?;

        let build = self
            .tx
            .insert_workspace_build(InsertWorkspaceBuildParams {
                id: workspace_build_id,
                created_at,
                workspace_id: workspace.id,
                template_version_id,
                build_number,
                transition: builder.transition,
                initiator_id: initiator,
                provisioner_state: state,
                job_id: job.id,
                reason: builder.reason,
            })
            .await
            .map_err(|e| BuildError::store("insert workspace build", e))?;

        self.tx
            .insert_workspace_build_parameters(build.id, &parameters)
            .await
            .map_err(|e| BuildError::store("insert workspace build parameters", e))?;

        Ok((build, job))
    }

    async fn authorize(&mut self, authorizer: &dyn Authorizer) -> Result<()> {
        let action = match self.builder.transition {
            WorkspaceTransition::Delete => Action::Delete,
            WorkspaceTransition::Start | WorkspaceTransition::Stop => Action::Update,
        };
        if !authorizer.authorize(action, &self.builder.workspace.rbac_object()) {
            return Err(BuildError::not_found(RESOURCE_NOT_FOUND));
        }

        let template = self
            .template()
            .await
            .map_err(|e| BuildError::store("fetch template", e))?;
        let template_object = template.rbac_object();

        // Custom state can corrupt or leak infrastructure state.
        if self.builder.state.is_custom() && !authorizer.authorize(Action::Update, &template_object)
        {
            return Err(BuildError::forbidden(
                "Only template managers may provide custom state",
            ));
        }

        if self.builder.log_level.is_some()
            && !authorizer.authorize(Action::Update, &template_object)
        {
            return Err(BuildError::forbidden(
                "Workspace builds with a custom log level are restricted to template authors only.",
            ));
        }
        Ok(())
    }

    async fn check_template_version_matches_template(&mut self) -> Result<()> {
        let template = self
            .template()
            .await
            .map_err(|e| BuildError::store("fetch template", e))?;
        let version = self
            .template_version()
            .await
            .map_err(|e| BuildError::store("fetch template version", e))?;

        if version.template_id != Some(template.id) {
            return Err(BuildError::with_cause(
                BuildErrorStatus::BadRequest,
                "template version doesn't match template",
                anyhow::anyhow!(
                    "template version {} belongs to template {:?}, workspace template is {}",
                    version.id,
                    version.template_id,
                    template.id
                ),
            ));
        }
        Ok(())
    }

    async fn check_template_job_status(&mut self) -> Result<()> {
        let version = self
            .template_version()
            .await
            .map_err(|e| BuildError::store("fetch template version", e))?;
        let job = self
            .template_version_job()
            .await
            .map_err(|e| BuildError::store("fetch template version job", e))?;

        match job.status() {
            ProvisionerJobStatus::Succeeded => Ok(()),
            status @ (ProvisionerJobStatus::Pending
            | ProvisionerJobStatus::Running
            | ProvisionerJobStatus::Canceling) => Err(BuildError::bad_request(format!(
                "The provided template version is {}. Wait for it to complete importing!",
                status
            ))),
            ProvisionerJobStatus::Failed => Err(BuildError::bad_request(format!(
                "The provided template version {:?} has failed to import: {:?}. You cannot build workspaces with it!",
                version.name,
                job.error.unwrap_or_default()
            ))),
            ProvisionerJobStatus::Canceled => Err(BuildError::bad_request(
                "The provided template version was canceled during import. You cannot build workspaces with it!",
            )),
        }
    }

    async fn check_running_build(&mut self) -> Result<()> {
        let job = self
            .last_build_job()
            .await
            .map_err(|e| BuildError::store("fetch prior build", e))?;

        match job {
            Some(job) if job.status().is_active() => {
                Err(BuildError::conflict("A workspace build is already active."))
            }
            _ => Ok(()),
        }
    }

    /// Replaces same-named legacy values of the workspace with the overrides.
    async fn upsert_legacy_parameters(&mut self) -> Result<()> {
        if self.builder.legacy_parameter_values.is_empty() {
            return Ok(());
        }

        let mut existing = self
            .last_parameter_values()
            .await
            .map_err(|e| BuildError::store("fetch previous legacy parameters", e))?;
        let builder = self.builder;

        for param in &builder.legacy_parameter_values {
            for old in existing.iter().filter(|v| v.name == param.name) {
                match self.tx.delete_parameter_value_by_id(old.id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        return Err(BuildError::store(
                            &format!("delete old parameter {:?}", old.name),
                            e,
                        ))
                    }
                }
            }
            existing.retain(|v| v.name != param.name);

            let value = self
                .tx
                .insert_parameter_value(InsertParameterValueParams {
                    id: Uuid::new_v4(),
                    created_at: now(),
                    scope: ParameterScope::Workspace,
                    scope_id: builder.workspace.id,
                    name: param.name.clone(),
                    source_scheme: param.source_scheme,
                    source_value: param.source_value.clone(),
                    destination_scheme: param.destination_scheme,
                })
                .await
                .map_err(|e| BuildError::store("insert parameter value", e))?;
            existing.push(value);
        }

        self.cache.last_parameter_values = Some(existing);
        Ok(())
    }

    async fn resolve_parameters(&mut self) -> Result<Vec<BuildParameter>> {
        let schema = self
            .template_version_parameters()
            .await
            .map_err(|e| BuildError::store("fetch template version parameters", e))?;
        let prior_rich = self
            .last_build_parameters()
            .await
            .map_err(|e| BuildError::store("fetch last build parameters", e))?;
        let prior_legacy = self
            .last_parameter_values()
            .await
            .map_err(|e| BuildError::store("fetch last parameter values", e))?;

        let mut resolved = Vec::with_capacity(schema.len());
        for parameter in &schema {
            let requested = self
                .builder
                .rich_parameter_values
                .iter()
                .find(|p| p.name == parameter.name);
            // Every read is done; a failure here is a problem with the request.
            let value = self
                .builder
                .resolver
                .resolve(parameter, &prior_rich, &prior_legacy, requested)
                .map_err(|e| {
                    BuildError::with_cause(BuildErrorStatus::BadRequest, e.to_string(), e)
                })?;
            resolved.push(BuildParameter::new(parameter.name.clone(), value));
        }
        Ok(resolved)
    }

    async fn template(&mut self) -> StoreResult<Template> {
        if let Some(template) = &self.cache.template {
            return Ok(template.clone());
        }
        let template = self
            .tx
            .get_template_by_id(self.builder.workspace.template_id)
            .await?;
        self.cache.template = Some(template.clone());
        Ok(template)
    }

    async fn template_version_id(&mut self) -> StoreResult<Uuid> {
        let version = self.builder.version;
        match version {
            VersionTarget::Specific(id) => Ok(id),
            VersionTarget::Active => Ok(self.template().await?.active_version_id),
            VersionTarget::LastBuild => match self.last_build().await? {
                Some(build) => Ok(build.template_version_id),
                None => Ok(self.template().await?.active_version_id),
            },
        }
    }

    async fn template_version(&mut self) -> StoreResult<TemplateVersion> {
        if let Some(version) = &self.cache.template_version {
            return Ok(version.clone());
        }
        let id = self.template_version_id().await?;
        let version = self.tx.get_template_version_by_id(id).await?;
        self.cache.template_version = Some(version.clone());
        Ok(version)
    }

    async fn template_version_job(&mut self) -> StoreResult<ProvisionerJob> {
        if let Some(job) = &self.cache.template_version_job {
            return Ok(job.clone());
        }
        let version = self.template_version().await?;
        let job = self.tx.get_provisioner_job_by_id(version.job_id).await?;
        self.cache.template_version_job = Some(job.clone());
        Ok(job)
    }

    async fn template_version_parameters(&mut self) -> StoreResult<Vec<TemplateVersionParameter>> {
        if let Some(parameters) = &self.cache.template_version_parameters {
            return Ok(parameters.clone());
        }
        let id = self.template_version_id().await?;
        let parameters = self.tx.get_template_version_parameters(id).await?;
        self.cache.template_version_parameters = Some(parameters.clone());
        Ok(parameters)
    }

    async fn last_build(&mut self) -> StoreResult<Option<WorkspaceBuild>> {
        if let Some(build) = &self.cache.last_build {
            return Ok(build.clone());
        }
        let build = match self
            .tx
            .get_latest_workspace_build_by_workspace_id(self.builder.workspace.id)
            .await
        {
            Ok(build) => Some(build),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        self.cache.last_build = Some(build.clone());
        Ok(build)
    }

    async fn last_build_job(&mut self) -> StoreResult<Option<ProvisionerJob>> {
        if let Some(job) = &self.cache.last_build_job {
            return Ok(job.clone());
        }
        let job = match self.last_build().await? {
            Some(build) => Some(self.tx.get_provisioner_job_by_id(build.job_id).await?),
            None => None,
        };
        self.cache.last_build_job = Some(job.clone());
        Ok(job)
    }

    async fn last_build_parameters(&mut self) -> StoreResult<Vec<WorkspaceBuildParameter>> {
        if let Some(parameters) = &self.cache.last_build_parameters {
            return Ok(parameters.clone());
        }
        let parameters = match self.last_build().await? {
            Some(build) => self.tx.get_workspace_build_parameters(build.id).await?,
            None => Vec::new(),
        };
        self.cache.last_build_parameters = Some(parameters.clone());
        Ok(parameters)
    }

    async fn last_parameter_values(&mut self) -> StoreResult<Vec<ParameterValue>> {
        if let Some(values) = &self.cache.last_parameter_values {
            return Ok(values.clone());
        }
        let values = self
            .tx
            .parameter_values(ParameterScope::Workspace, self.builder.workspace.id)
            .await?;
        self.cache.last_parameter_values = Some(values.clone());
        Ok(values)
    }

    async fn build_number(&mut self) -> StoreResult<i32> {
        Ok(self
            .last_build()
            .await?
            .map_or(1, |build| build.build_number + 1))
    }

    async fn state(&mut self) -> StoreResult<Vec<u8>> {
        let builder = self.builder;
        match &builder.state {
            StateTarget::Orphan => Ok(Vec::new()),
            StateTarget::Explicit(state) => Ok(state.clone()),
            StateTarget::LastBuild => Ok(self
                .last_build()
                .await?
                .map(|build| build.provisioner_state)
                .unwrap_or_default()),
        }
    }
}

/// Identifies the span the build was requested from, for correlating the
/// job with the request that created it.
fn trace_metadata() -> serde_json::Value {
    let span = tracing::Span::current();
    let mut metadata = serde_json::Map::new();
    if let Some(meta) = span.metadata() {
        metadata.insert("span".to_string(), meta.name().into());
    }
    if let Some(id) = span.id() {
        metadata.insert("span_id".to_string(), id.into_u64().into());
    }
    serde_json::Value::Object(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn workspace() -> Workspace {
        let now = Utc::now();
        Workspace {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            owner_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            template_id: Uuid::new_v4(),
            name: "dev".to_string(),
            deleted: false,
        }
    }

    #[test]
    fn test_setters_leave_the_base_untouched() {
        let base = WorkspaceBuilder::new(workspace(), WorkspaceTransition::Start);
        let version = Uuid::new_v4();
        let pinned = base.clone().version_id(version).orphan();

        assert_eq!(base.version, VersionTarget::LastBuild);
        assert_eq!(base.state, StateTarget::LastBuild);
        assert_eq!(pinned.version, VersionTarget::Specific(version));
        assert_eq!(pinned.state, StateTarget::Orphan);
    }

    #[test]
    fn test_last_selector_wins() {
        let builder = WorkspaceBuilder::new(workspace(), WorkspaceTransition::Stop)
            .state(b"tfstate".to_vec())
            .orphan()
            .version_id(Uuid::new_v4())
            .active_version();

        assert_eq!(builder.state, StateTarget::Orphan);
        assert_eq!(builder.version, VersionTarget::Active);
    }

    #[test]
    fn test_defaults() {
        let builder = WorkspaceBuilder::new(workspace(), WorkspaceTransition::Delete);
        assert_eq!(builder.max_attempts, DEFAULT_MAX_BUILD_ATTEMPTS);
        assert_eq!(builder.reason, BuildReason::Initiator);
        assert!(builder.initiator.is_none());
        assert!(!builder.state.is_custom());
        assert!(StateTarget::Orphan.is_custom());
        assert!(StateTarget::Explicit(Vec::new()).is_custom());
    }

    #[test]
    fn test_max_attempts_is_at_least_one() {
        let builder = WorkspaceBuilder::new(workspace(), WorkspaceTransition::Start).max_attempts(0);
        assert_eq!(builder.max_attempts, 1);
    }
}
