//! Cross-node session state
//!
//! Active-transfer rows let multi-node deployments see aggregate counts;
//! shared-session rows carry password-reset codes and partial 2FA state
//! between nodes. Both are swept by background maintenance.

use super::folders::map_db_err;
use crate::util;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use wharf_common::{Error, Result};

/// Direction of an active transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum TransferType {
    Upload = 0,
    Download = 1,
}

/// A persisted live transfer row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTransfer {
    #[serde(default)]
    pub id: i64,
    pub connection_id: String,
    pub transfer_id: i64,
    pub transfer_type: TransferType,
    pub username: String,
    #[serde(default)]
    pub folder_name: String,
    pub ip: String,
    /// Size hint for resumable uploads replacing existing data.
    #[serde(default)]
    pub truncated_size: i64,
    #[serde(default)]
    pub current_ul_size: i64,
    #[serde(default)]
    pub current_dl_size: i64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

pub async fn add_active_transfer(pool: &SqlitePool, transfer: &ActiveTransfer) -> Result<i64> {
    let now = util::now_ms();
    let res = sqlx::query(
        "INSERT INTO active_transfers (connection_id, transfer_id, transfer_type, username,
         folder_name, ip, truncated_size, current_ul_size, current_dl_size, created_at,
         updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&transfer.connection_id)
    .bind(transfer.transfer_id)
    .bind(transfer.transfer_type as i32)
    .bind(&transfer.username)
    .bind(&transfer.folder_name)
    .bind(&transfer.ip)
    .bind(transfer.truncated_size)
    .bind(transfer.current_ul_size)
    .bind(transfer.current_dl_size)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    Ok(res.last_insert_rowid())
}

pub async fn update_active_transfer_sizes(
    pool: &SqlitePool,
    connection_id: &str,
    transfer_id: i64,
    ul_size: i64,
    dl_size: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE active_transfers SET current_ul_size = ?, current_dl_size = ?, updated_at = ?
         WHERE connection_id = ? AND transfer_id = ?",
    )
    .bind(ul_size)
    .bind(dl_size)
    .bind(util::now_ms())
    .bind(connection_id)
    .bind(transfer_id)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    Ok(())
}

pub async fn remove_active_transfer(
    pool: &SqlitePool,
    connection_id: &str,
    transfer_id: i64,
) -> Result<()> {
    sqlx::query("DELETE FROM active_transfers WHERE connection_id = ? AND transfer_id = ?")
        .bind(connection_id)
        .bind(transfer_id)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    Ok(())
}

/// Drop rows not updated since `before` (ms): the owning node is gone.
pub async fn cleanup_active_transfers(pool: &SqlitePool, before: i64) -> Result<u64> {
    let res = sqlx::query("DELETE FROM active_transfers WHERE updated_at < ?")
        .bind(before)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    Ok(res.rows_affected())
}

pub async fn list_active_transfers(pool: &SqlitePool) -> Result<Vec<ActiveTransfer>> {
    let rows = sqlx::query("SELECT * FROM active_transfers ORDER BY created_at ASC")
        .fetch_all(pool)
        .await
        .map_err(map_db_err)?;
    Ok(rows
        .iter()
        .map(|row| {
            let transfer_type: i32 = row.get("transfer_type");
            ActiveTransfer {
                id: row.get("id"),
                connection_id: row.get("connection_id"),
                transfer_id: row.get("transfer_id"),
                transfer_type: if transfer_type == 0 {
                    TransferType::Upload
                } else {
                    TransferType::Download
                },
                username: row.get("username"),
                folder_name: row.get("folder_name"),
                ip: row.get("ip"),
                truncated_size: row.get("truncated_size"),
                current_ul_size: row.get("current_ul_size"),
                current_dl_size: row.get("current_dl_size"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            }
        })
        .collect())
}

/// Purpose of a shared-session row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(i32)]
pub enum SessionType {
    PasswordReset = 1,
    EmailConfirmation = 2,
    TwoFactorPartial = 3,
}

/// A generic key/value row shared across nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedSession {
    pub key: String,
    pub data: String,
    pub session_type: SessionType,
    pub timestamp: i64,
}

pub async fn put_shared_session(pool: &SqlitePool, session: &SharedSession) -> Result<()> {
    sqlx::query(
        "INSERT INTO shared_sessions (key, data, type, timestamp) VALUES (?, ?, ?, ?)
         ON CONFLICT(key) DO UPDATE SET data = excluded.data, type = excluded.type,
         timestamp = excluded.timestamp",
    )
    .bind(&session.key)
    .bind(&session.data)
    .bind(session.session_type as i32)
    .bind(session.timestamp)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    Ok(())
}

pub async fn get_shared_session(
    pool: &SqlitePool,
    key: &str,
    session_type: SessionType,
) -> Result<SharedSession> {
    let row = sqlx::query("SELECT * FROM shared_sessions WHERE key = ? AND type = ?")
        .bind(key)
        .bind(session_type as i32)
        .fetch_optional(pool)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| Error::NotFound(format!("session {:?}", key)))?;
    Ok(SharedSession {
        key: row.get("key"),
        data: row.get("data"),
        session_type,
        timestamp: row.get("timestamp"),
    })
}

pub async fn delete_shared_session(pool: &SqlitePool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM shared_sessions WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    Ok(())
}

/// Remove rows older than `before` (ms).
pub async fn cleanup_shared_sessions(pool: &SqlitePool, before: i64) -> Result<u64> {
    let res = sqlx::query("DELETE FROM shared_sessions WHERE timestamp < ?")
        .bind(before)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    Ok(res.rows_affected())
}
