//! Shares
//!
//! A share is a stable capability a user publishes over a subset of its
//! virtual tree: optionally password protected, IP scoped, expiring and
//! capped to a number of uses.

use super::folders::map_db_err;
use crate::util;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::net::IpAddr;
use wharf_common::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum ShareScope {
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

impl Default for ShareScope {
    fn default() -> Self {
        ShareScope::Read
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Share {
    /// Stable short identifier, server-generated.
    #[serde(default)]
    pub share_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scope: ShareScope,
    /// Virtual paths inside the owner's tree.
    pub paths: Vec<String>,
    #[serde(default)]
    pub username: String,
    /// Hashed password; cleared before rendering, kept in dumps.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// IP/CIDR allow-list; empty means any source.
    #[serde(default)]
    pub allow_from: Vec<String>,
    /// Millisecond timestamp; 0 means no expiration.
    #[serde(default)]
    pub expires_at: i64,
    /// 0 means unlimited uses.
    #[serde(default)]
    pub max_tokens: i32,
    #[serde(default)]
    pub used_tokens: i32,
    #[serde(default)]
    pub last_use_at: i64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Share {
    pub fn validate(&mut self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("field \"name\" is required".to_string()));
        }
        if self.paths.is_empty() {
            return Err(Error::Validation(
                "field \"paths\" is required".to_string(),
            ));
        }
        let mut cleaned = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            let p = util::clean_path(path);
            if !cleaned.contains(&p) {
                cleaned.push(p);
            }
        }
        self.paths = cleaned;
        if self.max_tokens < 0 {
            return Err(Error::Validation(
                "field \"max_tokens\" cannot be negative".to_string(),
            ));
        }
        if self.expires_at > 0 && self.expires_at < util::now_ms() {
            return Err(Error::Validation(
                "field \"expires_at\" must be in the future".to_string(),
            ));
        }
        for entry in &self.allow_from {
            crate::validation::parse_ip_or_cidr(entry)?;
        }
        if self.scope != ShareScope::Read && self.paths.len() != 1 {
            return Err(Error::Validation(
                "write shares require exactly one path".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at > 0 && self.expires_at < now_ms
    }

    /// Usable means not expired and not past its token cap.
    pub fn is_usable(&self, now_ms: i64) -> bool {
        if self.is_expired(now_ms) {
            return false;
        }
        self.max_tokens == 0 || self.used_tokens < self.max_tokens
    }

    pub fn is_ip_allowed(&self, ip: IpAddr) -> bool {
        self.allow_from.is_empty() || crate::validation::ip_matches_any(ip, &self.allow_from)
    }
}

fn share_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Share> {
    let paths: String = row.get("paths");
    let allow_from: String = row.get("allow_from");
    let scope: i32 = row.get("scope");
    Ok(Share {
        share_id: row.get("share_id"),
        name: row.get("name"),
        description: row.get("description"),
        scope: match scope {
            2 => ShareScope::Write,
            3 => ShareScope::ReadWrite,
            _ => ShareScope::Read,
        },
        paths: serde_json::from_str(&paths)
            .map_err(|e| Error::Internal(format!("corrupt share paths: {}", e)))?,
        username: row.get("username"),
        password: row.get("password"),
        allow_from: serde_json::from_str(&allow_from)
            .map_err(|e| Error::Internal(format!("corrupt share allow_from: {}", e)))?,
        expires_at: row.get("expires_at"),
        max_tokens: row.get("max_tokens"),
        used_tokens: row.get("used_tokens"),
        last_use_at: row.get("last_use_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub async fn get_share(pool: &SqlitePool, share_id: &str) -> Result<Share> {
    let row = sqlx::query(
        "SELECT s.*, u.username FROM shares s JOIN users u ON u.id = s.user_id
         WHERE s.share_id = ?",
    )
    .bind(share_id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_err)?
    .ok_or_else(|| Error::NotFound(format!("share {:?}", share_id)))?;
    share_from_row(&row)
}

pub async fn list_shares_for_user(
    pool: &SqlitePool,
    username: &str,
    limit: i64,
    offset: i64,
    ascending: bool,
) -> Result<Vec<Share>> {
    let order = if ascending { "ASC" } else { "DESC" };
    let rows = sqlx::query(&format!(
        "SELECT s.*, u.username FROM shares s JOIN users u ON u.id = s.user_id
         WHERE u.username = ? ORDER BY s.share_id {} LIMIT ? OFFSET ?",
        order
    ))
    .bind(username)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .map_err(map_db_err)?;
    rows.iter().map(share_from_row).collect()
}

pub async fn add_share(pool: &SqlitePool, share: &Share) -> Result<()> {
    let now = util::now_ms();
    let user_id: i64 = sqlx::query_scalar("SELECT id FROM users WHERE username = ?")
        .bind(&share.username)
        .fetch_optional(pool)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| Error::NotFound(format!("user {:?}", share.username)))?;
    let paths = serde_json::to_string(&share.paths).map_err(|e| Error::Internal(e.to_string()))?;
    let allow_from =
        serde_json::to_string(&share.allow_from).map_err(|e| Error::Internal(e.to_string()))?;
    sqlx::query(
        "INSERT INTO shares (share_id, name, description, scope, paths, user_id, password,
         allow_from, expires_at, max_tokens, used_tokens, last_use_at, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?)",
    )
    .bind(&share.share_id)
    .bind(&share.name)
    .bind(&share.description)
    .bind(share.scope as i32)
    .bind(&paths)
    .bind(user_id)
    .bind(&share.password)
    .bind(&allow_from)
    .bind(share.expires_at)
    .bind(share.max_tokens)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::Conflict(format!("share {:?} already exists", share.share_id))
        }
        _ => map_db_err(e),
    })?;
    Ok(())
}

pub async fn update_share(pool: &SqlitePool, share: &Share) -> Result<()> {
    let paths = serde_json::to_string(&share.paths).map_err(|e| Error::Internal(e.to_string()))?;
    let allow_from =
        serde_json::to_string(&share.allow_from).map_err(|e| Error::Internal(e.to_string()))?;
    let res = sqlx::query(
        "UPDATE shares SET name = ?, description = ?, scope = ?, paths = ?, password = ?,
         allow_from = ?, expires_at = ?, max_tokens = ?, updated_at = ? WHERE share_id = ?",
    )
    .bind(&share.name)
    .bind(&share.description)
    .bind(share.scope as i32)
    .bind(&paths)
    .bind(&share.password)
    .bind(&allow_from)
    .bind(share.expires_at)
    .bind(share.max_tokens)
    .bind(util::now_ms())
    .bind(&share.share_id)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::NotFound(format!("share {:?}", share.share_id)));
    }
    Ok(())
}

pub async fn delete_share(pool: &SqlitePool, share_id: &str, username: &str) -> Result<()> {
    let res = sqlx::query(
        "DELETE FROM shares WHERE share_id = ? AND user_id =
         (SELECT id FROM users WHERE username = ?)",
    )
    .bind(share_id)
    .bind(username)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::NotFound(format!("share {:?}", share_id)));
    }
    Ok(())
}

/// Atomically consume one share token, honoring the `max_tokens` cap.
///
/// The guarded UPDATE is the only writer of `used_tokens`, so two racing
/// consumers cannot both take the last token.
pub async fn consume_share_token(pool: &SqlitePool, share_id: &str) -> Result<()> {
    let res = sqlx::query(
        "UPDATE shares SET used_tokens = used_tokens + 1, last_use_at = ?
         WHERE share_id = ? AND (max_tokens = 0 OR used_tokens < max_tokens)",
    )
    .bind(util::now_ms())
    .bind(share_id)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::NotFound(format!("share {:?}", share_id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_respects_cap_and_expiry() {
        let now = util::now_ms();
        let mut share = Share {
            name: "s".to_string(),
            paths: vec!["/".to_string()],
            max_tokens: 2,
            used_tokens: 1,
            ..Default::default()
        };
        assert!(share.is_usable(now));
        share.used_tokens = 2;
        assert!(!share.is_usable(now));
        share.max_tokens = 0;
        assert!(share.is_usable(now));
        share.expires_at = now - 1;
        assert!(!share.is_usable(now));
    }

    #[test]
    fn write_share_single_path() {
        let mut share = Share {
            name: "s".to_string(),
            scope: ShareScope::ReadWrite,
            paths: vec!["/a".to_string(), "/b".to_string()],
            ..Default::default()
        };
        assert!(share.validate().is_err());
        share.paths = vec!["/a".to_string()];
        assert!(share.validate().is_ok());
    }

    #[test]
    fn paths_deduplicated_and_cleaned() {
        let mut share = Share {
            name: "s".to_string(),
            paths: vec!["/a/./b".to_string(), "/a/b/".to_string()],
            ..Default::default()
        };
        share.validate().unwrap();
        assert_eq!(share.paths, vec!["/a/b".to_string()]);
    }
}
