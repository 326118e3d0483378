//! Schema migrations
//!
//! Strictly monotonic integer versions recorded in `schema_version`.
//! Each migration has an up and a down script; `revertprovider` walks
//! the downs.

use sqlx::sqlite::SqlitePool;
use wharf_common::{Error, Result};

struct Migration {
    version: i64,
    up: &'static [&'static str],
    down: &'static [&'static str],
}

/// v1: identity store: principals, folders, mappings, keys, shares.
const V1_UP: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
    "CREATE TABLE IF NOT EXISTS roles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        description TEXT NOT NULL DEFAULT '',
        created_at BIGINT NOT NULL DEFAULT 0,
        updated_at BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS admins (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        status INTEGER NOT NULL DEFAULT 1,
        password TEXT NOT NULL DEFAULT '',
        email TEXT NOT NULL DEFAULT '',
        permissions TEXT NOT NULL DEFAULT '[]',
        filters TEXT NOT NULL DEFAULT '{}',
        role_id INTEGER REFERENCES roles(id) ON DELETE RESTRICT,
        description TEXT NOT NULL DEFAULT '',
        additional_info TEXT NOT NULL DEFAULT '',
        last_login BIGINT NOT NULL DEFAULT 0,
        created_at BIGINT NOT NULL DEFAULT 0,
        updated_at BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        status INTEGER NOT NULL DEFAULT 1,
        password TEXT NOT NULL DEFAULT '',
        public_keys TEXT NOT NULL DEFAULT '[]',
        email TEXT NOT NULL DEFAULT '',
        home_dir TEXT NOT NULL DEFAULT '',
        uid INTEGER NOT NULL DEFAULT 0,
        gid INTEGER NOT NULL DEFAULT 0,
        max_sessions INTEGER NOT NULL DEFAULT 0,
        quota_size BIGINT NOT NULL DEFAULT 0,
        quota_files INTEGER NOT NULL DEFAULT 0,
        permissions TEXT NOT NULL DEFAULT '{}',
        used_quota_size BIGINT NOT NULL DEFAULT 0,
        used_quota_files INTEGER NOT NULL DEFAULT 0,
        last_quota_update BIGINT NOT NULL DEFAULT 0,
        upload_bandwidth BIGINT NOT NULL DEFAULT 0,
        download_bandwidth BIGINT NOT NULL DEFAULT 0,
        upload_data_transfer BIGINT NOT NULL DEFAULT 0,
        download_data_transfer BIGINT NOT NULL DEFAULT 0,
        total_data_transfer BIGINT NOT NULL DEFAULT 0,
        used_upload_data_transfer BIGINT NOT NULL DEFAULT 0,
        used_download_data_transfer BIGINT NOT NULL DEFAULT 0,
        expiration_date BIGINT NOT NULL DEFAULT 0,
        last_login BIGINT NOT NULL DEFAULT 0,
        first_download BIGINT NOT NULL DEFAULT 0,
        first_upload BIGINT NOT NULL DEFAULT 0,
        created_at BIGINT NOT NULL DEFAULT 0,
        updated_at BIGINT NOT NULL DEFAULT 0,
        filters TEXT NOT NULL DEFAULT '{}',
        filesystem TEXT NOT NULL DEFAULT '{}',
        role_id INTEGER REFERENCES roles(id) ON DELETE RESTRICT,
        description TEXT NOT NULL DEFAULT '',
        additional_info TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        description TEXT NOT NULL DEFAULT '',
        user_settings TEXT NOT NULL DEFAULT '{}',
        created_at BIGINT NOT NULL DEFAULT 0,
        updated_at BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS folders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        path TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        used_quota_size BIGINT NOT NULL DEFAULT 0,
        used_quota_files INTEGER NOT NULL DEFAULT 0,
        last_quota_update BIGINT NOT NULL DEFAULT 0,
        filesystem TEXT NOT NULL DEFAULT '{}'
    )",
    "CREATE TABLE IF NOT EXISTS users_groups_mapping (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE RESTRICT,
        group_type INTEGER NOT NULL DEFAULT 3,
        UNIQUE(user_id, group_id)
    )",
    "CREATE TABLE IF NOT EXISTS users_folders_mapping (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        folder_id INTEGER NOT NULL REFERENCES folders(id) ON DELETE CASCADE,
        virtual_path TEXT NOT NULL,
        quota_size BIGINT NOT NULL DEFAULT 0,
        quota_files INTEGER NOT NULL DEFAULT 0,
        UNIQUE(user_id, virtual_path)
    )",
    "CREATE TABLE IF NOT EXISTS groups_folders_mapping (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
        folder_id INTEGER NOT NULL REFERENCES folders(id) ON DELETE CASCADE,
        virtual_path TEXT NOT NULL,
        quota_size BIGINT NOT NULL DEFAULT 0,
        quota_files INTEGER NOT NULL DEFAULT 0,
        UNIQUE(group_id, virtual_path)
    )",
    "CREATE TABLE IF NOT EXISTS admins_groups_mapping (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        admin_id INTEGER NOT NULL REFERENCES admins(id) ON DELETE CASCADE,
        group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE RESTRICT,
        options TEXT NOT NULL DEFAULT '{}',
        UNIQUE(admin_id, group_id)
    )",
    "CREATE TABLE IF NOT EXISTS api_keys (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        key_id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        scope INTEGER NOT NULL DEFAULT 2,
        api_key TEXT NOT NULL,
        user_id INTEGER REFERENCES users(id) ON DELETE CASCADE,
        admin_id INTEGER REFERENCES admins(id) ON DELETE CASCADE,
        description TEXT NOT NULL DEFAULT '',
        expires_at BIGINT NOT NULL DEFAULT 0,
        last_use_at BIGINT NOT NULL DEFAULT 0,
        created_at BIGINT NOT NULL DEFAULT 0,
        updated_at BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS shares (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        share_id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        scope INTEGER NOT NULL DEFAULT 1,
        paths TEXT NOT NULL DEFAULT '[]',
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        password TEXT NOT NULL DEFAULT '',
        allow_from TEXT NOT NULL DEFAULT '[]',
        expires_at BIGINT NOT NULL DEFAULT 0,
        max_tokens INTEGER NOT NULL DEFAULT 0,
        used_tokens INTEGER NOT NULL DEFAULT 0,
        last_use_at BIGINT NOT NULL DEFAULT 0,
        created_at BIGINT NOT NULL DEFAULT 0,
        updated_at BIGINT NOT NULL DEFAULT 0
    )",
];

const V1_DOWN: &[&str] = &[
    "DROP TABLE IF EXISTS shares",
    "DROP TABLE IF EXISTS api_keys",
    "DROP TABLE IF EXISTS admins_groups_mapping",
    "DROP TABLE IF EXISTS groups_folders_mapping",
    "DROP TABLE IF EXISTS users_folders_mapping",
    "DROP TABLE IF EXISTS users_groups_mapping",
    "DROP TABLE IF EXISTS folders",
    "DROP TABLE IF EXISTS groups",
    "DROP TABLE IF EXISTS users",
    "DROP TABLE IF EXISTS admins",
    "DROP TABLE IF EXISTS roles",
];

/// v2: event rules, actions and the defender tables.
const V2_UP: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS event_actions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        description TEXT NOT NULL DEFAULT '',
        type INTEGER NOT NULL,
        options TEXT NOT NULL DEFAULT '{}'
    )",
    "CREATE TABLE IF NOT EXISTS event_rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        description TEXT NOT NULL DEFAULT '',
        status INTEGER NOT NULL DEFAULT 1,
        trigger INTEGER NOT NULL,
        conditions TEXT NOT NULL DEFAULT '{}',
        created_at BIGINT NOT NULL DEFAULT 0,
        updated_at BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS rules_actions_mapping (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        rule_id INTEGER NOT NULL REFERENCES event_rules(id) ON DELETE CASCADE,
        action_id INTEGER NOT NULL REFERENCES event_actions(id) ON DELETE RESTRICT,
        \"order\" INTEGER NOT NULL DEFAULT 0,
        options TEXT NOT NULL DEFAULT '{}',
        UNIQUE(rule_id, action_id)
    )",
    "CREATE TABLE IF NOT EXISTS defender_hosts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ip TEXT NOT NULL UNIQUE,
        ban_time BIGINT NOT NULL DEFAULT 0,
        updated_at BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS defender_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        date BIGINT NOT NULL,
        score INTEGER NOT NULL,
        host_id INTEGER NOT NULL REFERENCES defender_hosts(id) ON DELETE CASCADE
    )",
    "CREATE INDEX IF NOT EXISTS idx_defender_events_date ON defender_events(date)",
];

const V2_DOWN: &[&str] = &[
    "DROP INDEX IF EXISTS idx_defender_events_date",
    "DROP TABLE IF EXISTS defender_events",
    "DROP TABLE IF EXISTS defender_hosts",
    "DROP TABLE IF EXISTS rules_actions_mapping",
    "DROP TABLE IF EXISTS event_rules",
    "DROP TABLE IF EXISTS event_actions",
];

/// v3: cross-node transfer and session rows.
const V3_UP: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS active_transfers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        connection_id TEXT NOT NULL,
        transfer_id BIGINT NOT NULL,
        transfer_type INTEGER NOT NULL,
        username TEXT NOT NULL,
        folder_name TEXT NOT NULL DEFAULT '',
        ip TEXT NOT NULL DEFAULT '',
        truncated_size BIGINT NOT NULL DEFAULT 0,
        current_ul_size BIGINT NOT NULL DEFAULT 0,
        current_dl_size BIGINT NOT NULL DEFAULT 0,
        created_at BIGINT NOT NULL DEFAULT 0,
        updated_at BIGINT NOT NULL DEFAULT 0,
        UNIQUE(connection_id, transfer_id)
    )",
    "CREATE TABLE IF NOT EXISTS shared_sessions (
        key TEXT PRIMARY KEY,
        data TEXT NOT NULL DEFAULT '',
        type INTEGER NOT NULL,
        timestamp BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_shared_sessions_type ON shared_sessions(type)",
];

const V3_DOWN: &[&str] = &[
    "DROP INDEX IF EXISTS idx_shared_sessions_type",
    "DROP TABLE IF EXISTS shared_sessions",
    "DROP TABLE IF EXISTS active_transfers",
];

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        up: V1_UP,
        down: V1_DOWN,
    },
    Migration {
        version: 2,
        up: V2_UP,
        down: V2_DOWN,
    },
    Migration {
        version: 3,
        up: V3_UP,
        down: V3_DOWN,
    },
];

async fn current_version(pool: &SqlitePool) -> Result<i64> {
    let exists: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
    )
    .fetch_optional(pool)
    .await
    .map_err(db_err)?;
    if exists.is_none() {
        return Ok(0);
    }
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await
        .map_err(db_err)?;
    Ok(version.unwrap_or(0))
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current = current_version(pool).await?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!(version = migration.version, "applying schema migration");
        for &statement in migration.up {
            sqlx::query(statement).execute(pool).await.map_err(db_err)?;
        }
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(migration.version)
            .execute(pool)
            .await
            .map_err(db_err)?;
    }
    Ok(())
}

pub async fn revert_to(pool: &SqlitePool, target_version: i64) -> Result<()> {
    let current = current_version(pool).await?;
    if target_version > current {
        return Err(Error::Validation(format!(
            "cannot revert to version {} from {}",
            target_version, current
        )));
    }
    for migration in MIGRATIONS
        .iter()
        .rev()
        .filter(|m| m.version <= current && m.version > target_version)
    {
        tracing::info!(version = migration.version, "reverting schema migration");
        for &statement in migration.down {
            sqlx::query(statement).execute(pool).await.map_err(db_err)?;
        }
        sqlx::query("DELETE FROM schema_version WHERE version = ?")
            .bind(migration.version)
            .execute(pool)
            .await
            .map_err(db_err)?;
    }
    Ok(())
}

pub async fn drop_all(pool: &SqlitePool) -> Result<()> {
    revert_to(pool, 0).await?;
    sqlx::query("DROP TABLE IF EXISTS schema_version")
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Internal(format!("migration failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = crate::db::open(":memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();
        assert_eq!(current_version(&pool).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn revert_walks_down() {
        let pool = crate::db::open(":memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        revert_to(&pool, 1).await.unwrap();
        assert_eq!(current_version(&pool).await.unwrap(), 1);
        // users table survives v1 revert target
        sqlx::query("SELECT COUNT(*) FROM users")
            .fetch_one(&pool)
            .await
            .unwrap();
        // event tables are gone
        assert!(sqlx::query("SELECT COUNT(*) FROM event_rules")
            .fetch_one(&pool)
            .await
            .is_err());
        run_migrations(&pool).await.unwrap();
        assert_eq!(current_version(&pool).await.unwrap(), 3);
    }
}
