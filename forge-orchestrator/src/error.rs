use std::fmt::{self, Display, Formatter};
use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub type Result<T> = std::result::Result<T, BuildError>;

/// SQL-standard SQLSTATE for a serialization failure.
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";

/// SQLite result codes that mean "another transaction got there first".
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";
const SQLITE_BUSY_SNAPSHOT: &str = "517";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_serialization_failure(&self) -> bool {
        matches!(self, StoreError::SerializationFailure(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db) => {
                let conflict = db.code().is_some_and(|code| {
                    matches!(
                        &*code,
                        SQLSTATE_SERIALIZATION_FAILURE
                            | SQLITE_BUSY
                            | SQLITE_LOCKED
                            | SQLITE_BUSY_SNAPSHOT
                    )
                });
                if conflict {
                    StoreError::SerializationFailure(db.message().to_string())
                } else {
                    StoreError::Database(sqlx::Error::Database(db))
                }
            }
            other => StoreError::Database(other),
        }
    }
}

/// Caller-facing classification of a failed build request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildErrorStatus {
    BadRequest,
    NotFound,
    Forbidden,
    Conflict,
    Internal,
}

impl BuildErrorStatus {
    /// A suitable HTTP status code for front ends.
    pub fn http_status(self) -> u16 {
        match self {
            BuildErrorStatus::BadRequest => 400,
            BuildErrorStatus::NotFound => 404,
            BuildErrorStatus::Forbidden => 403,
            BuildErrorStatus::Conflict => 409,
            BuildErrorStatus::Internal => 500,
        }
    }
}

/// Error returned by the build orchestrator.
///
/// `message` is safe to show to the caller. `cause` keeps the underlying
/// failure (store error, resolver error, ...) for logs and for the retry
/// decision.
#[derive(Debug)]
pub struct BuildError {
    pub status: BuildErrorStatus,
    pub message: String,
    pub cause: Option<anyhow::Error>,
}

impl BuildError {
    pub fn new(status: BuildErrorStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        status: BuildErrorStatus,
        message: impl Into<String>,
        cause: impl Into<anyhow::Error>,
    ) -> Self {
        Self {
            status,
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(BuildErrorStatus::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(BuildErrorStatus::NotFound, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(BuildErrorStatus::Forbidden, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(BuildErrorStatus::Conflict, message)
    }

    /// Wraps a store failure with the name of the operation that failed.
    pub fn store(operation: &str, err: StoreError) -> Self {
        Self::with_cause(
            BuildErrorStatus::Internal,
            format!("failed to {}", operation),
            err,
        )
    }

    /// True when the root of this error is a store serialization failure,
    /// meaning the whole transaction may be retried.
    pub fn is_serialization_failure(&self) -> bool {
        self.cause.as_ref().is_some_and(|cause| {
            cause.chain().any(|e| {
                e.downcast_ref::<StoreError>()
                    .is_some_and(StoreError::is_serialization_failure)
            })
        })
    }
}

impl Display for BuildError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.message, cause),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| &**cause as &(dyn std::error::Error + 'static))
    }
}

impl From<StoreError> for BuildError {
    fn from(err: StoreError) -> Self {
        BuildError::store("access the store", err)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml_ng::Error),
}
