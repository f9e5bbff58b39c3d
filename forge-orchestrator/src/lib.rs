//! Workspace build orchestration
//!
//! This crate turns requested workspace transitions (start, stop, delete) into
//! persisted builds and the provisioner jobs that realize them. It is a
//! library: HTTP services, CLI commands or background workers supply the
//! store, the authorizer and the request.

pub mod authz;
pub mod builder;
pub mod config;
pub mod db;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod parameter;
pub mod store;
pub mod template;
pub mod workspace;

pub use authz::{Action, Authorizer, Object, Objecter, ResourceType};
pub use builder::{StateTarget, VersionTarget, WorkspaceBuilder};
pub use config::OrchestratorConfig;
pub use error::{BuildError, BuildErrorStatus, ConfigError, Result, StoreError, StoreResult};
pub use job::{ProvisionerJob, ProvisionerJobStatus, ProvisionerLogLevel};
pub use orchestrator::WorkspaceOrchestrator;
pub use parameter::{BuildParameter, DefaultParameterResolver, ParameterResolver};
pub use store::{IsolationLevel, MemoryStore, SqliteStore, Store, StoreTx};
pub use workspace::{
    CreateWorkspaceBuildRequest, CreateWorkspaceRequest, Workspace, WorkspaceBuild,
    WorkspaceTransition,
};
