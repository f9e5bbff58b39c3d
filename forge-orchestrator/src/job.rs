//! Provisioner jobs: the rows the orchestrator hands to external workers.

use crate::template::ProvisionerType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Tag naming the visibility scope of a job; workers match on it.
pub const TAG_SCOPE: &str = "scope";
/// Tag carrying the owning user for user-scoped workers.
pub const TAG_OWNER: &str = "owner";

pub const SCOPE_ORGANIZATION: &str = "organization";
pub const SCOPE_USER: &str = "user";

pub type JobTags = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProvisionerJobType {
    TemplateVersionImport,
    WorkspaceBuild,
    TemplateVersionDryRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StorageMethod {
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerLogLevel {
    Debug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerJobStatus {
    Pending,
    Running,
    Succeeded,
    Canceling,
    Canceled,
    Failed,
}

impl ProvisionerJobStatus {
    /// A job is active while a worker may still pick it up or act on it.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ProvisionerJobStatus::Pending
                | ProvisionerJobStatus::Running
                | ProvisionerJobStatus::Canceling
        )
    }
}

impl fmt::Display for ProvisionerJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisionerJobStatus::Pending => "pending",
            ProvisionerJobStatus::Running => "running",
            ProvisionerJobStatus::Succeeded => "succeeded",
            ProvisionerJobStatus::Canceling => "canceling",
            ProvisionerJobStatus::Canceled => "canceled",
            ProvisionerJobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerJob {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub organization_id: Uuid,
    pub initiator_id: Uuid,
    pub provisioner: ProvisionerType,
    pub storage_method: StorageMethod,
    pub job_type: ProvisionerJobType,
    pub input: serde_json::Value,
    pub file_id: Uuid,
    pub worker_id: Option<Uuid>,
    pub tags: JobTags,
    pub trace_metadata: Option<serde_json::Value>,
}

impl ProvisionerJob {
    /// Derives the job status from its timestamps and error field.
    pub fn status(&self) -> ProvisionerJobStatus {
        let failed = self.error.as_deref().is_some_and(|e| !e.is_empty());
        if self.canceled_at.is_some() {
            if self.completed_at.is_none() {
                return ProvisionerJobStatus::Canceling;
            }
            if failed {
                return ProvisionerJobStatus::Failed;
            }
            return ProvisionerJobStatus::Canceled;
        }
        if self.started_at.is_none() {
            return ProvisionerJobStatus::Pending;
        }
        if self.completed_at.is_some() {
            if failed {
                return ProvisionerJobStatus::Failed;
            }
            return ProvisionerJobStatus::Succeeded;
        }
        ProvisionerJobStatus::Running
    }
}

/// Input payload of a workspace build job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceProvisionJob {
    pub workspace_build_id: Uuid,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<ProvisionerLogLevel>,
}

#[derive(Debug, Clone)]
pub struct InsertProvisionerJobParams {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub organization_id: Uuid,
    pub initiator_id: Uuid,
    pub provisioner: ProvisionerType,
    pub storage_method: StorageMethod,
    pub job_type: ProvisionerJobType,
    pub input: serde_json::Value,
    pub file_id: Uuid,
    pub tags: JobTags,
    pub trace_metadata: Option<serde_json::Value>,
}

/// Rewrites worker-matching tags for a job owned by `owner_id`.
///
/// Jobs default to organization scope. User-scoped jobs are pinned to their
/// owner so that per-user workers can claim them; an unknown scope is
/// collapsed to organization scope with no other tags.
pub fn mutate_tags(owner_id: Uuid, tags: &JobTags) -> JobTags {
    let mut tags = tags.clone();
    tags.entry(TAG_SCOPE.to_string())
        .or_insert_with(|| SCOPE_ORGANIZATION.to_string());

    match tags.get(TAG_SCOPE).map(String::as_str) {
        Some(SCOPE_USER) => {
            tags.insert(TAG_OWNER.to_string(), owner_id.to_string());
            tags
        }
        Some(SCOPE_ORGANIZATION) => {
            tags.remove(TAG_OWNER);
            tags
        }
        _ => JobTags::from([(TAG_SCOPE.to_string(), SCOPE_ORGANIZATION.to_string())]),
    }
}
