//! Virtual folder storage
//!
//! A base folder is a named storage config with cumulative quota usage;
//! mount instances attach it to users or groups at a virtual path with
//! per-mount quota caps.

use super::fsconfig::FilesystemConfig;
use crate::kms::SecretBox;
use crate::util;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use wharf_common::{Error, Result};

/// A named folder object, referenced by mounts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BaseVirtualFolder {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    /// Backend path for local filesystems; informational for object stores.
    #[serde(default)]
    pub mapped_path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub used_quota_size: i64,
    #[serde(default)]
    pub used_quota_files: i32,
    /// Millisecond timestamp of the last quota usage update.
    #[serde(default)]
    pub last_quota_update: i64,
    #[serde(default)]
    pub filesystem: FilesystemConfig,
}

impl BaseVirtualFolder {
    pub fn validate(&mut self, kms: &SecretBox) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("field \"name\" is required".to_string()));
        }
        if matches!(self.filesystem, FilesystemConfig::Local(_)) && self.mapped_path.is_empty() {
            return Err(Error::Validation(
                "field \"mapped_path\" is required for local folders".to_string(),
            ));
        }
        let aad = format!("folder_{}", self.name);
        self.filesystem.validate_and_seal(kms, &aad)
    }
}

/// A folder mounted into a user's or group's virtual tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VirtualFolder {
    #[serde(flatten)]
    pub folder: BaseVirtualFolder,
    pub virtual_path: String,
    /// Per-mount quota caps; -1 inherits the user's, 0 is unlimited.
    #[serde(default)]
    pub quota_size: i64,
    #[serde(default)]
    pub quota_files: i32,
}

impl VirtualFolder {
    pub fn validate(&mut self) -> Result<()> {
        if self.folder.name.is_empty() {
            return Err(Error::Validation(
                "virtual folder field \"name\" is required".to_string(),
            ));
        }
        self.virtual_path = util::clean_path(&self.virtual_path);
        if self.virtual_path == "/" {
            return Err(Error::Validation(
                "virtual folders cannot be mounted at \"/\"".to_string(),
            ));
        }
        if self.quota_size < -1 || self.quota_files < -1 {
            return Err(Error::Validation(
                "invalid virtual folder quota".to_string(),
            ));
        }
        Ok(())
    }

    /// True when this mount tracks its own quota bucket.
    pub fn has_own_quota(&self) -> bool {
        self.quota_size != -1 || self.quota_files != -1
    }
}

fn folder_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<BaseVirtualFolder> {
    let filesystem: String = row.get("filesystem");
    Ok(BaseVirtualFolder {
        id: row.get("id"),
        name: row.get("name"),
        mapped_path: row.get("path"),
        description: row.get("description"),
        used_quota_size: row.get("used_quota_size"),
        used_quota_files: row.get("used_quota_files"),
        last_quota_update: row.get("last_quota_update"),
        filesystem: serde_json::from_str(&filesystem)
            .map_err(|e| Error::Internal(format!("corrupt folder filesystem config: {}", e)))?,
    })
}

pub async fn get_folder(pool: &SqlitePool, name: &str) -> Result<BaseVirtualFolder> {
    let row = sqlx::query("SELECT * FROM folders WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| Error::NotFound(format!("folder {:?}", name)))?;
    folder_from_row(&row)
}

pub async fn list_folders(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
    ascending: bool,
) -> Result<Vec<BaseVirtualFolder>> {
    let query = if ascending {
        "SELECT * FROM folders ORDER BY name ASC LIMIT ? OFFSET ?"
    } else {
        "SELECT * FROM folders ORDER BY name DESC LIMIT ? OFFSET ?"
    };
    let rows = sqlx::query(query)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .map_err(map_db_err)?;
    rows.iter().map(folder_from_row).collect()
}

pub async fn add_folder(pool: &SqlitePool, folder: &BaseVirtualFolder) -> Result<i64> {
    let fs = serde_json::to_string(&folder.filesystem)
        .map_err(|e| Error::Internal(e.to_string()))?;
    let res = sqlx::query(
        "INSERT INTO folders (name, path, description, used_quota_size, used_quota_files,
         last_quota_update, filesystem) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&folder.name)
    .bind(&folder.mapped_path)
    .bind(&folder.description)
    .bind(folder.used_quota_size)
    .bind(folder.used_quota_files)
    .bind(folder.last_quota_update)
    .bind(&fs)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    Ok(res.last_insert_rowid())
}

pub async fn update_folder(pool: &SqlitePool, folder: &BaseVirtualFolder) -> Result<()> {
    let fs = serde_json::to_string(&folder.filesystem)
        .map_err(|e| Error::Internal(e.to_string()))?;
    let res = sqlx::query(
        "UPDATE folders SET path = ?, description = ?, filesystem = ? WHERE name = ?",
    )
    .bind(&folder.mapped_path)
    .bind(&folder.description)
    .bind(&fs)
    .bind(&folder.name)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::NotFound(format!("folder {:?}", folder.name)));
    }
    Ok(())
}

/// Delete a folder. Mount rows cascade; the referencing users and groups
/// themselves are untouched.
pub async fn delete_folder(pool: &SqlitePool, name: &str) -> Result<()> {
    let res = sqlx::query("DELETE FROM folders WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::NotFound(format!("folder {:?}", name)));
    }
    Ok(())
}

/// Replace a principal's mounts. `owner_column` is `user_id` or `group_id`.
pub(super) async fn replace_mounts(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    table: &str,
    owner_column: &str,
    owner_id: i64,
    mounts: &[VirtualFolder],
) -> Result<()> {
    sqlx::query(&format!("DELETE FROM {} WHERE {} = ?", table, owner_column))
        .bind(owner_id)
        .execute(&mut **tx)
        .await
        .map_err(map_db_err)?;
    for mount in mounts {
        let folder_id: i64 = sqlx::query_scalar("SELECT id FROM folders WHERE name = ?")
            .bind(&mount.folder.name)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_db_err)?
            .ok_or_else(|| Error::NotFound(format!("folder {:?}", mount.folder.name)))?;
        sqlx::query(&format!(
            "INSERT INTO {} ({}, folder_id, virtual_path, quota_size, quota_files)
             VALUES (?, ?, ?, ?, ?)",
            table, owner_column
        ))
        .bind(owner_id)
        .bind(folder_id)
        .bind(&mount.virtual_path)
        .bind(mount.quota_size)
        .bind(mount.quota_files)
        .execute(&mut **tx)
        .await
        .map_err(map_db_err)?;
    }
    Ok(())
}

/// Load a principal's mounts with the base folder joined in.
pub(super) async fn load_mounts(
    pool: &SqlitePool,
    table: &str,
    owner_column: &str,
    owner_id: i64,
) -> Result<Vec<VirtualFolder>> {
    let rows = sqlx::query(&format!(
        "SELECT f.id, f.name, f.path, f.description, f.used_quota_size, f.used_quota_files,
                f.last_quota_update, f.filesystem, m.virtual_path, m.quota_size, m.quota_files
         FROM {} m JOIN folders f ON f.id = m.folder_id
         WHERE m.{} = ? ORDER BY m.virtual_path ASC",
        table, owner_column
    ))
    .bind(owner_id)
    .fetch_all(pool)
    .await
    .map_err(map_db_err)?;
    rows.iter()
        .map(|row| {
            Ok(VirtualFolder {
                folder: folder_from_row(row)?,
                virtual_path: row.get("virtual_path"),
                quota_size: row.get("quota_size"),
                quota_files: row.get("quota_files"),
            })
        })
        .collect()
}

pub(super) fn map_db_err(e: sqlx::Error) -> Error {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::Internal(format!("duplicate object: {}", db.message()))
        }
        sqlx::Error::RowNotFound => Error::NotFound("object".to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            Error::ProviderUnavailable(e.to_string())
        }
        _ => Error::Internal(format!("database error: {}", e)),
    }
}
