//! Database layer
//!
//! SQLite connection pool and schema management. All entity SQL lives
//! in the provider sub-modules; this module owns pool construction and
//! the migration lifecycle.

pub mod migrations;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use wharf_common::{Error, Result};

/// Open (and create if needed) the SQLite database at `name`.
/// `:memory:` yields an in-process database for tests.
pub async fn open(name: &str, pool_size: u32) -> Result<SqlitePool> {
    let options = if name == ":memory:" {
        SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::Internal(format!("invalid database options: {}", e)))?
            .foreign_keys(true)
    } else {
        if let Some(parent) = Path::new(name).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Internal(format!("unable to create database directory: {}", e))
                })?;
            }
        }
        SqliteConnectOptions::new()
            .filename(name)
            .create_if_missing(true)
            .foreign_keys(true)
    };
    let pool = SqlitePoolOptions::new()
        .max_connections(pool_size.max(1))
        .connect_with(options)
        .await
        .map_err(|e| Error::ProviderUnavailable(format!("database connection failed: {}", e)))?;
    tracing::info!(database = %name, "database connection established");
    Ok(pool)
}

/// Apply pending migrations up to the latest schema version.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    migrations::run_migrations(pool).await?;
    tracing::info!("database migrations completed");
    Ok(())
}

/// Revert migrations down to `target_version`.
pub async fn revert(pool: &SqlitePool, target_version: i64) -> Result<()> {
    migrations::revert_to(pool, target_version).await?;
    tracing::info!(version = target_version, "database reverted");
    Ok(())
}

/// Drop every table, used by `resetprovider`.
pub async fn reset(pool: &SqlitePool) -> Result<()> {
    migrations::drop_all(pool).await?;
    tracing::warn!("database reset: all data removed");
    Ok(())
}

#[cfg(test)]
pub async fn open_test_pool() -> SqlitePool {
    let pool = open(":memory:", 1).await.unwrap();
    migrate(&pool).await.unwrap();
    pool
}
