//! Authorization vocabulary consumed by the build orchestrator.
//!
//! Policy evaluation is not done here. Callers hand the orchestrator an
//! [`Authorizer`] that has already been prepared for the requesting subject,
//! and the orchestrator only asks it yes/no questions about concrete objects.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Workspace,
    Template,
}

/// Actions granted to individual users or groups on a single resource.
pub type Acl = BTreeMap<Uuid, Vec<Action>>;

/// The authorization-relevant view of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub resource_type: ResourceType,
    pub id: Uuid,
    pub owner_id: Option<Uuid>,
    pub organization_id: Uuid,
    pub user_acl: Acl,
    pub group_acl: Acl,
}

impl Object {
    /// True when the object's ACL grants `action` to `user_id` directly.
    pub fn acl_allows(&self, user_id: Uuid, action: Action) -> bool {
        self.user_acl
            .get(&user_id)
            .is_some_and(|actions| actions.contains(&action))
    }
}

/// Anything that can be checked by an [`Authorizer`].
pub trait Objecter {
    fn rbac_object(&self) -> Object;
}

/// A pre-compiled authorization decision function.
///
/// Implementations must be side-effect free; the orchestrator may call them
/// several times per attempt and again on every retry.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, action: Action, object: &Object) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(Action, &Object) -> bool + Send + Sync,
{
    fn authorize(&self, action: Action, object: &Object) -> bool {
        self(action, object)
    }
}
