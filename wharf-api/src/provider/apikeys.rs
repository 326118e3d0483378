//! API keys
//!
//! Long-lived bearer credentials of shape `<key-id>.<secret>`. Only the
//! key id and a hash of the secret are stored; the full key is returned
//! once, at creation.

use super::folders::map_db_err;
use crate::util;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use wharf_common::{Error, Result};

/// Whether a key authenticates an admin or an end user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum ApiKeyScope {
    Admin = 1,
    User = 2,
}

impl Default for ApiKeyScope {
    fn default() -> Self {
        ApiKeyScope::User
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApiKey {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub scope: ApiKeyScope,
    /// Hashed secret; cleared before rendering, kept in dumps.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_hash: String,
    /// Bound principal; empty for user-scoped keys that take the
    /// principal from the request.
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub admin: String,
    #[serde(default)]
    pub description: String,
    /// Millisecond timestamp; 0 means no expiration.
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default)]
    pub last_use_at: i64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl ApiKey {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("field \"name\" is required".to_string()));
        }
        match self.scope {
            ApiKeyScope::Admin if !self.user.is_empty() => Err(Error::Validation(
                "admin-scoped keys cannot be bound to a user".to_string(),
            )),
            ApiKeyScope::User if !self.admin.is_empty() => Err(Error::Validation(
                "user-scoped keys cannot be bound to an admin".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at > 0 && self.expires_at < now_ms
    }
}

/// A freshly created key: the only time the plain secret exists.
#[derive(Debug, Clone, Serialize)]
pub struct NewApiKey {
    pub id: String,
    /// `<key-id>.<secret>`
    pub key: String,
}

fn key_from_row(row: &sqlx::sqlite::SqliteRow) -> ApiKey {
    let scope: i32 = row.get("scope");
    ApiKey {
        id: row.get("key_id"),
        name: row.get("name"),
        scope: if scope == 1 {
            ApiKeyScope::Admin
        } else {
            ApiKeyScope::User
        },
        key_hash: row.get("api_key"),
        user: row
            .try_get::<Option<String>, _>("user_name")
            .unwrap_or(None)
            .unwrap_or_default(),
        admin: row
            .try_get::<Option<String>, _>("admin_name")
            .unwrap_or(None)
            .unwrap_or_default(),
        description: row.get("description"),
        expires_at: row.get("expires_at"),
        last_use_at: row.get("last_use_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

const KEY_SELECT: &str = "SELECT k.*, u.username AS user_name, a.username AS admin_name
     FROM api_keys k LEFT JOIN users u ON u.id = k.user_id
     LEFT JOIN admins a ON a.id = k.admin_id";

pub async fn get_api_key(pool: &SqlitePool, key_id: &str) -> Result<ApiKey> {
    let row = sqlx::query(&format!("{} WHERE k.key_id = ?", KEY_SELECT))
        .bind(key_id)
        .fetch_optional(pool)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| Error::NotFound(format!("API key {:?}", key_id)))?;
    Ok(key_from_row(&row))
}

pub async fn list_api_keys(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
    ascending: bool,
) -> Result<Vec<ApiKey>> {
    let order = if ascending { "ASC" } else { "DESC" };
    let rows = sqlx::query(&format!(
        "{} ORDER BY k.key_id {} LIMIT ? OFFSET ?",
        KEY_SELECT, order
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .map_err(map_db_err)?;
    Ok(rows.iter().map(key_from_row).collect())
}

/// Insert a key and return the one-shot plain credential.
pub async fn add_api_key(pool: &SqlitePool, key: &ApiKey, secret_hash: &str) -> Result<()> {
    let now = util::now_ms();
    let user_id: Option<i64> = if key.user.is_empty() {
        None
    } else {
        Some(
            sqlx::query_scalar("SELECT id FROM users WHERE username = ?")
                .bind(&key.user)
                .fetch_optional(pool)
                .await
                .map_err(map_db_err)?
                .ok_or_else(|| Error::NotFound(format!("user {:?}", key.user)))?,
        )
    };
    let admin_id: Option<i64> = if key.admin.is_empty() {
        None
    } else {
        Some(
            sqlx::query_scalar("SELECT id FROM admins WHERE username = ?")
                .bind(&key.admin)
                .fetch_optional(pool)
                .await
                .map_err(map_db_err)?
                .ok_or_else(|| Error::NotFound(format!("admin {:?}", key.admin)))?,
        )
    };
    sqlx::query(
        "INSERT INTO api_keys (key_id, name, scope, api_key, user_id, admin_id, description,
         expires_at, last_use_at, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(&key.id)
    .bind(&key.name)
    .bind(key.scope as i32)
    .bind(secret_hash)
    .bind(user_id)
    .bind(admin_id)
    .bind(&key.description)
    .bind(key.expires_at)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .map_err(|e| match &e {
        // key ids are generated, a collision here is caller-visible
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::Conflict(format!("API key {:?} already exists", key.id))
        }
        _ => map_db_err(e),
    })?;
    Ok(())
}

pub async fn update_api_key(pool: &SqlitePool, key: &ApiKey) -> Result<()> {
    let res = sqlx::query(
        "UPDATE api_keys SET name = ?, description = ?, expires_at = ?, updated_at = ?
         WHERE key_id = ?",
    )
    .bind(&key.name)
    .bind(&key.description)
    .bind(key.expires_at)
    .bind(util::now_ms())
    .bind(&key.id)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::NotFound(format!("API key {:?}", key.id)));
    }
    Ok(())
}

pub async fn delete_api_key(pool: &SqlitePool, key_id: &str) -> Result<()> {
    let res = sqlx::query("DELETE FROM api_keys WHERE key_id = ?")
        .bind(key_id)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::NotFound(format!("API key {:?}", key_id)));
    }
    Ok(())
}

pub async fn update_api_key_last_use(pool: &SqlitePool, key_id: &str) -> Result<()> {
    sqlx::query("UPDATE api_keys SET last_use_at = ? WHERE key_id = ?")
        .bind(util::now_ms())
        .bind(key_id)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    Ok(())
}
