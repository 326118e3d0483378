//! Quota accounting
//!
//! Serialized updates to used quota (files, bytes) and used transfer
//! (upload, download) for users and folder buckets. Callers go through
//! [`super::DataProvider`], which serializes per principal.

use super::folders::map_db_err;
use crate::util;
use sqlx::sqlite::SqlitePool;
use wharf_common::{Error, Result};

/// Apply a delta (or reset to absolute values) to a user's used quota.
pub async fn update_user_quota(
    pool: &SqlitePool,
    username: &str,
    files: i32,
    size: i64,
    reset: bool,
) -> Result<()> {
    let now = util::now_ms();
    let query = if reset {
        "UPDATE users SET used_quota_files = ?, used_quota_size = ?, last_quota_update = ?
         WHERE username = ?"
    } else {
        "UPDATE users SET used_quota_files = MAX(0, used_quota_files + ?),
         used_quota_size = MAX(0, used_quota_size + ?), last_quota_update = ?
         WHERE username = ?"
    };
    let res = sqlx::query(query)
        .bind(files)
        .bind(size)
        .bind(now)
        .bind(username)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::NotFound(format!("user {:?}", username)));
    }
    Ok(())
}

/// Apply a delta (or reset) to a folder's cumulative quota bucket.
pub async fn update_folder_quota(
    pool: &SqlitePool,
    folder_name: &str,
    files: i32,
    size: i64,
    reset: bool,
) -> Result<()> {
    let now = util::now_ms();
    let query = if reset {
        "UPDATE folders SET used_quota_files = ?, used_quota_size = ?, last_quota_update = ?
         WHERE name = ?"
    } else {
        "UPDATE folders SET used_quota_files = MAX(0, used_quota_files + ?),
         used_quota_size = MAX(0, used_quota_size + ?), last_quota_update = ?
         WHERE name = ?"
    };
    let res = sqlx::query(query)
        .bind(files)
        .bind(size)
        .bind(now)
        .bind(folder_name)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::NotFound(format!("folder {:?}", folder_name)));
    }
    Ok(())
}

/// Apply a delta (or reset) to a user's used data transfer counters,
/// both in bytes.
pub async fn update_transfer_quota(
    pool: &SqlitePool,
    username: &str,
    upload: i64,
    download: i64,
    reset: bool,
) -> Result<()> {
    let query = if reset {
        "UPDATE users SET used_upload_data_transfer = ?, used_download_data_transfer = ?
         WHERE username = ?"
    } else {
        "UPDATE users SET used_upload_data_transfer = MAX(0, used_upload_data_transfer + ?),
         used_download_data_transfer = MAX(0, used_download_data_transfer + ?)
         WHERE username = ?"
    };
    let res = sqlx::query(query)
        .bind(upload)
        .bind(download)
        .bind(username)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::NotFound(format!("user {:?}", username)));
    }
    Ok(())
}

/// Current used quota for a user: (files, size).
pub async fn get_used_quota(pool: &SqlitePool, username: &str) -> Result<(i32, i64)> {
    let row: Option<(i32, i64)> = sqlx::query_as(
        "SELECT used_quota_files, used_quota_size FROM users WHERE username = ?",
    )
    .bind(username)
    .fetch_optional(pool)
    .await
    .map_err(map_db_err)?;
    row.ok_or_else(|| Error::NotFound(format!("user {:?}", username)))
}

/// Current used transfer for a user: (upload bytes, download bytes).
pub async fn get_used_transfer(pool: &SqlitePool, username: &str) -> Result<(i64, i64)> {
    let row: Option<(i64, i64)> = sqlx::query_as(
        "SELECT used_upload_data_transfer, used_download_data_transfer
         FROM users WHERE username = ?",
    )
    .bind(username)
    .fetch_optional(pool)
    .await
    .map_err(map_db_err)?;
    row.ok_or_else(|| Error::NotFound(format!("user {:?}", username)))
}
