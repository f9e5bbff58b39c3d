use crate::authz::{Acl, Object, Objecter, ResourceType};
use crate::job::ProvisionerLogLevel;
use crate::parameter::{BuildParameter, CreateParameterRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub owner_id: Uuid,
    pub organization_id: Uuid,
    pub template_id: Uuid,
    pub name: String,
    pub deleted: bool,
}

impl Objecter for Workspace {
    fn rbac_object(&self) -> Object {
        Object {
            resource_type: ResourceType::Workspace,
            id: self.id,
            owner_id: Some(self.owner_id),
            organization_id: self.organization_id,
            user_acl: Acl::new(),
            group_acl: Acl::new(),
        }
    }
}

/// Requested direction of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceTransition {
    Start,
    Stop,
    Delete,
}

impl fmt::Display for WorkspaceTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkspaceTransition::Start => "start",
            WorkspaceTransition::Stop => "stop",
            WorkspaceTransition::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Why a build was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BuildReason {
    #[default]
    Initiator,
    Autostart,
    Autostop,
}

/// An immutable record of one requested transition of a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceBuild {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub workspace_id: Uuid,
    pub template_version_id: Uuid,
    pub build_number: i32,
    pub transition: WorkspaceTransition,
    pub initiator_id: Uuid,
    /// Opaque provisioner state; empty means "no state".
    pub provisioner_state: Vec<u8>,
    pub job_id: Uuid,
    pub reason: BuildReason,
}

#[derive(Debug, Clone)]
pub struct InsertWorkspaceParams {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub organization_id: Uuid,
    pub template_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct InsertWorkspaceBuildParams {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub workspace_id: Uuid,
    pub template_version_id: Uuid,
    pub build_number: i32,
    pub transition: WorkspaceTransition,
    pub initiator_id: Uuid,
    pub provisioner_state: Vec<u8>,
    pub job_id: Uuid,
    pub reason: BuildReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub name: String,
    pub owner_id: Uuid,
    pub template_id: Uuid,
    /// Pins the first build to a version; defaults to the template's active version.
    #[serde(default)]
    pub template_version_id: Option<Uuid>,
    #[serde(default)]
    pub rich_parameter_values: Vec<BuildParameter>,
    #[serde(default)]
    pub parameter_values: Vec<CreateParameterRequest>,
}

/// Options for a new build of an existing workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateWorkspaceBuildRequest {
    /// Defaults to the workspace owner.
    #[serde(default)]
    pub initiator_id: Option<Uuid>,
    /// Defaults to the version of the last build.
    #[serde(default)]
    pub template_version_id: Option<Uuid>,
    #[serde(default)]
    pub reason: BuildReason,
    #[serde(default)]
    pub state: Option<Vec<u8>>,
    /// Drop the provisioner state; only allowed when deleting.
    #[serde(default)]
    pub orphan: bool,
    #[serde(default)]
    pub log_level: Option<ProvisionerLogLevel>,
    #[serde(default)]
    pub rich_parameter_values: Vec<BuildParameter>,
    #[serde(default)]
    pub parameter_values: Vec<CreateParameterRequest>,
}
