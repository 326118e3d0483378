//! User groups
//!
//! A group carries default user settings merged into member users at
//! composition time, plus its own virtual folder mounts.

use super::folders::{self, map_db_err, VirtualFolder};
use super::fsconfig::FilesystemConfig;
use super::users::UserFilters;
use crate::kms::SecretBox;
use crate::util;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use wharf_common::{Error, Permission, Result};

/// Defaults a primary group contributes to its members.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GroupUserSettings {
    #[serde(default)]
    pub home_dir: String,
    #[serde(default)]
    pub max_sessions: i32,
    #[serde(default)]
    pub quota_size: i64,
    #[serde(default)]
    pub quota_files: i32,
    #[serde(default)]
    pub permissions: HashMap<String, Vec<Permission>>,
    #[serde(default)]
    pub upload_bandwidth: i64,
    #[serde(default)]
    pub download_bandwidth: i64,
    #[serde(default)]
    pub upload_data_transfer: i64,
    #[serde(default)]
    pub download_data_transfer: i64,
    #[serde(default)]
    pub total_data_transfer: i64,
    /// Days added to the creation time of new members; 0 disables.
    #[serde(default)]
    pub expires_in: i32,
    #[serde(default)]
    pub filters: UserFilters,
    #[serde(default)]
    pub filesystem: FilesystemConfig,
}

/// A named group.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Group {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub user_settings: GroupUserSettings,
    #[serde(default)]
    pub virtual_folders: Vec<VirtualFolder>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Group {
    pub fn validate(&mut self, kms: &SecretBox) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("field \"name\" is required".to_string()));
        }
        if !crate::validation::is_valid_object_name(&self.name) {
            return Err(Error::Validation(format!(
                "field \"name\" is invalid: {:?}",
                self.name
            )));
        }
        if !self.user_settings.home_dir.is_empty()
            && !self.user_settings.home_dir.starts_with('/')
        {
            return Err(Error::Validation(
                "group home_dir must be an absolute path".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for folder in &mut self.virtual_folders {
            folder.validate()?;
            if !seen.insert(folder.virtual_path.clone()) {
                return Err(Error::Validation(format!(
                    "duplicate virtual path {:?}",
                    folder.virtual_path
                )));
            }
        }
        let aad = format!("group_{}", self.name);
        self.user_settings.filesystem.validate_and_seal(kms, &aad)
    }

    pub fn prepare_for_rendering(&mut self) {
        self.user_settings.filesystem.redact();
        for folder in &mut self.virtual_folders {
            folder.folder.filesystem.redact();
        }
    }
}

fn group_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Group> {
    let settings: String = row.get("user_settings");
    Ok(Group {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        user_settings: serde_json::from_str(&settings)
            .map_err(|e| Error::Internal(format!("corrupt group settings: {}", e)))?,
        virtual_folders: Vec::new(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub async fn get_group(pool: &SqlitePool, name: &str) -> Result<Group> {
    let row = sqlx::query("SELECT * FROM groups WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| Error::NotFound(format!("group {:?}", name)))?;
    let mut group = group_from_row(&row)?;
    group.virtual_folders =
        folders::load_mounts(pool, "groups_folders_mapping", "group_id", group.id).await?;
    Ok(group)
}

pub async fn list_groups(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
    ascending: bool,
) -> Result<Vec<Group>> {
    let order = if ascending { "ASC" } else { "DESC" };
    let rows = sqlx::query(&format!(
        "SELECT * FROM groups ORDER BY name {} LIMIT ? OFFSET ?",
        order
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .map_err(map_db_err)?;
    let mut groups = rows
        .iter()
        .map(group_from_row)
        .collect::<Result<Vec<_>>>()?;
    for group in &mut groups {
        group.virtual_folders =
            folders::load_mounts(pool, "groups_folders_mapping", "group_id", group.id).await?;
    }
    Ok(groups)
}

pub async fn add_group(pool: &SqlitePool, group: &Group) -> Result<i64> {
    let now = util::now_ms();
    let settings =
        serde_json::to_string(&group.user_settings).map_err(|e| Error::Internal(e.to_string()))?;
    let mut tx = pool.begin().await.map_err(map_db_err)?;
    let res = sqlx::query(
        "INSERT INTO groups (name, description, user_settings, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&group.name)
    .bind(&group.description)
    .bind(&settings)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(map_db_err)?;
    let group_id = res.last_insert_rowid();
    folders::replace_mounts(
        &mut tx,
        "groups_folders_mapping",
        "group_id",
        group_id,
        &group.virtual_folders,
    )
    .await?;
    tx.commit().await.map_err(map_db_err)?;
    Ok(group_id)
}

pub async fn update_group(pool: &SqlitePool, group: &Group, expected_updated_at: i64) -> Result<()> {
    let now = util::now_ms();
    let settings =
        serde_json::to_string(&group.user_settings).map_err(|e| Error::Internal(e.to_string()))?;
    let mut tx = pool.begin().await.map_err(map_db_err)?;
    let res = sqlx::query(
        "UPDATE groups SET description = ?, user_settings = ?, updated_at = ?
         WHERE id = ? AND updated_at = ?",
    )
    .bind(&group.description)
    .bind(&settings)
    .bind(now)
    .bind(group.id)
    .bind(expected_updated_at)
    .execute(&mut *tx)
    .await
    .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::Stale(format!("group {:?}", group.name)));
    }
    folders::replace_mounts(
        &mut tx,
        "groups_folders_mapping",
        "group_id",
        group.id,
        &group.virtual_folders,
    )
    .await?;
    tx.commit().await.map_err(map_db_err)?;
    Ok(())
}

/// Delete a group; fails while users or admins still reference it.
pub async fn delete_group(pool: &SqlitePool, name: &str) -> Result<()> {
    let group_id: i64 = sqlx::query_scalar("SELECT id FROM groups WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| Error::NotFound(format!("group {:?}", name)))?;
    let user_refs: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM users_groups_mapping WHERE group_id = ?")
            .bind(group_id)
            .fetch_one(pool)
            .await
            .map_err(map_db_err)?;
    let admin_refs: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM admins_groups_mapping WHERE group_id = ?")
            .bind(group_id)
            .fetch_one(pool)
            .await
            .map_err(map_db_err)?;
    if user_refs + admin_refs > 0 {
        return Err(Error::Referenced(format!(
            "group {:?} is referenced by {} principals",
            name,
            user_refs + admin_refs
        )));
    }
    sqlx::query("DELETE FROM groups WHERE id = ?")
        .bind(group_id)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    Ok(())
}

/// Usernames of the group's members, used for cache invalidation.
pub async fn group_member_usernames(pool: &SqlitePool, name: &str) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT u.username FROM users u JOIN users_groups_mapping m ON m.user_id = u.id
         JOIN groups g ON g.id = m.group_id WHERE g.name = ?",
    )
    .bind(name)
    .fetch_all(pool)
    .await
    .map_err(map_db_err)?;
    Ok(rows.iter().map(|r| r.get("username")).collect())
}
