use crate::config::OrchestratorConfig;
use crate::error::StoreResult;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::instrument;

/// Initialize database connection pool
///
/// WAL mode gives every transaction a stable snapshot and turns a write on a
/// stale snapshot into `SQLITE_BUSY_SNAPSHOT`.
#[instrument(skip(config), fields(db_path = %config.db_path.display()))]
pub async fn create_pool(config: &OrchestratorConfig) -> StoreResult<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&config.db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Run database migrations
#[instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;

    Ok(())
}

/// Backup database before migrations (returns backup path)
pub fn backup_database(db_path: &Path) -> StoreResult<PathBuf> {
    let timestamp = Utc::now().timestamp();
    let backup_path = db_path.with_extension(format!("db.backup.{}", timestamp));

    if db_path.exists() {
        std::fs::copy(db_path, &backup_path)?;
    }

    Ok(backup_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_backup_copies_existing_database() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("forge.db");
        std::fs::write(&db_path, b"sqlite").unwrap();

        let backup = backup_database(&db_path).unwrap();
        assert!(backup.to_string_lossy().contains("db.backup."));
        assert_eq!(std::fs::read(&backup).unwrap(), b"sqlite");
    }

    #[test]
    fn test_backup_of_missing_database_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let backup = backup_database(&dir.path().join("missing.db")).unwrap();
        assert!(!backup.exists());
    }
}
