use crate::authz::{Acl, Object, Objecter, ResourceType};
use crate::parameter::TemplateVersionParameter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Infrastructure backend that realizes a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerType {
    Echo,
    Terraform,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub organization_id: Uuid,
    pub deleted: bool,
    pub name: String,
    pub provisioner: ProvisionerType,
    pub active_version_id: Uuid,
    pub description: String,
    pub created_by: Uuid,
    pub user_acl: Acl,
    pub group_acl: Acl,
}

impl Objecter for Template {
    fn rbac_object(&self) -> Object {
        Object {
            resource_type: ResourceType::Template,
            id: self.id,
            owner_id: None,
            organization_id: self.organization_id,
            user_acl: self.user_acl.clone(),
            group_acl: self.group_acl.clone(),
        }
    }
}

/// An immutable snapshot of a template's provisioning logic.
///
/// `template_id` is optional because versions can be imported before they are
/// attached to a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateVersion {
    pub id: Uuid,
    pub template_id: Option<Uuid>,
    pub organization_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub readme: String,
    pub job_id: Uuid,
    pub created_by: Uuid,
}

#[derive(Debug, Clone)]
pub struct InsertTemplateParams {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub provisioner: ProvisionerType,
    pub active_version_id: Uuid,
    pub description: String,
    pub created_by: Uuid,
    pub user_acl: Acl,
    pub group_acl: Acl,
}

#[derive(Debug, Clone)]
pub struct InsertTemplateVersionParams {
    pub id: Uuid,
    pub template_id: Option<Uuid>,
    pub organization_id: Uuid,
    pub name: String,
    pub readme: String,
    pub job_id: Uuid,
    pub created_by: Uuid,
    pub parameters: Vec<TemplateVersionParameter>,
}
