//! Administrator accounts
//!
//! Admins manage the provider through the API. An admin may be scoped to
//! a role, in which case it only sees principals carrying that role.

use super::folders::map_db_err;
use super::users::{GroupType, RecoveryCode, UserStatus};
use crate::kms::SecretBox;
use crate::mfa::UserTotpConfig;
use crate::util;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use wharf_common::{Error, Result};

/// Administrative capabilities.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AdminPermission {
    #[serde(rename = "*")]
    Any,
    #[serde(rename = "add_users")]
    AddUsers,
    #[serde(rename = "edit_users")]
    EditUsers,
    #[serde(rename = "del_users")]
    DelUsers,
    #[serde(rename = "view_users")]
    ViewUsers,
    #[serde(rename = "view_conns")]
    ViewConns,
    #[serde(rename = "close_conns")]
    CloseConns,
    #[serde(rename = "view_status")]
    ViewStatus,
    #[serde(rename = "manage_admins")]
    ManageAdmins,
    #[serde(rename = "manage_folders")]
    ManageFolders,
    #[serde(rename = "manage_groups")]
    ManageGroups,
    #[serde(rename = "manage_apikeys")]
    ManageApiKeys,
    #[serde(rename = "quota_scans")]
    QuotaScans,
    #[serde(rename = "manage_defender")]
    ManageDefender,
    #[serde(rename = "view_defender")]
    ViewDefender,
    #[serde(rename = "retention_checks")]
    RetentionChecks,
    #[serde(rename = "manage_event_rules")]
    ManageEventRules,
    #[serde(rename = "manage_roles")]
    ManageRoles,
    #[serde(rename = "manage_system")]
    ManageSystem,
}

/// Capabilities a role-scoped admin can never hold.
pub const FORBIDDEN_ROLE_ADMIN_PERMS: [AdminPermission; 6] = [
    AdminPermission::Any,
    AdminPermission::ManageAdmins,
    AdminPermission::ManageSystem,
    AdminPermission::ManageEventRules,
    AdminPermission::ManageRoles,
    AdminPermission::ManageApiKeys,
];

/// Restrictions attached to an admin.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AdminFilters {
    /// IP/CIDR allow-list; empty means any source.
    #[serde(default)]
    pub allow_list: Vec<String>,
    #[serde(default)]
    pub allow_api_key_auth: bool,
    #[serde(default)]
    pub totp_config: Option<UserTotpConfig>,
    #[serde(default)]
    pub recovery_codes: Vec<RecoveryCode>,
}

/// Groups assigned to users created by this admin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminGroupMapping {
    pub name: String,
    /// How the group is attached to new users.
    #[serde(default = "default_add_as")]
    pub add_to_users_as: GroupType,
}

fn default_add_as() -> GroupType {
    GroupType::Membership
}

/// An administrator account.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Admin {
    #[serde(default)]
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub status: UserStatus,
    /// Hash only; cleared before rendering, kept in dumps.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub permissions: Vec<AdminPermission>,
    #[serde(default)]
    pub filters: AdminFilters,
    #[serde(default)]
    pub groups: Vec<AdminGroupMapping>,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub additional_info: String,
    #[serde(default)]
    pub last_login: i64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Admin {
    pub fn has_permission(&self, perm: AdminPermission) -> bool {
        self.permissions.contains(&AdminPermission::Any) || self.permissions.contains(&perm)
    }

    pub fn prepare_for_rendering(&mut self) {
        self.password = String::new();
        if let Some(totp) = &mut self.filters.totp_config {
            totp.secret.redact();
        }
        for code in &mut self.filters.recovery_codes {
            code.secret.redact();
        }
    }

    pub fn validate(&mut self, kms: &SecretBox) -> Result<()> {
        if self.username.is_empty() {
            return Err(Error::Validation(
                "field \"username\" is required".to_string(),
            ));
        }
        if !crate::validation::is_valid_object_name(&self.username) {
            return Err(Error::Validation(format!(
                "field \"username\" is invalid: {:?}",
                self.username
            )));
        }
        if !self.email.is_empty() && !crate::validation::is_valid_email(&self.email) {
            return Err(Error::Validation(format!(
                "field \"email\" is invalid: {:?}",
                self.email
            )));
        }
        if self.permissions.is_empty() {
            return Err(Error::Validation(
                "field \"permissions\" is required".to_string(),
            ));
        }
        if !self.role.is_empty() {
            for perm in &self.permissions {
                if FORBIDDEN_ROLE_ADMIN_PERMS.contains(perm) {
                    return Err(Error::Validation(format!(
                        "permission {:?} is not allowed for role admins",
                        serde_json::to_string(perm).unwrap_or_default()
                    )));
                }
            }
        }
        for entry in &self.filters.allow_list {
            crate::validation::parse_ip_or_cidr(entry)?;
        }
        let aad = format!("admin_{}", self.username);
        if let Some(totp) = &mut self.filters.totp_config {
            totp.validate_and_seal(kms, &aad)?;
        }
        for code in &mut self.filters.recovery_codes {
            kms.encrypt(&mut code.secret, &aad)?;
        }
        Ok(())
    }
}

fn admin_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Admin> {
    let permissions: String = row.get("permissions");
    let filters: String = row.get("filters");
    let corrupt =
        |field: &str, e: serde_json::Error| Error::Internal(format!("corrupt admin {}: {}", field, e));
    Ok(Admin {
        id: row.get("id"),
        username: row.get("username"),
        status: if row.get::<i32, _>("status") == 1 {
            UserStatus::Active
        } else {
            UserStatus::Disabled
        },
        password: row.get("password"),
        email: row.get("email"),
        permissions: serde_json::from_str(&permissions).map_err(|e| corrupt("permissions", e))?,
        filters: serde_json::from_str(&filters).map_err(|e| corrupt("filters", e))?,
        groups: Vec::new(),
        role: row
            .try_get::<Option<String>, _>("role_name")
            .unwrap_or(None)
            .unwrap_or_default(),
        description: row.get("description"),
        additional_info: row.get("additional_info"),
        last_login: row.get("last_login"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const ADMIN_SELECT: &str =
    "SELECT a.*, r.name AS role_name FROM admins a LEFT JOIN roles r ON r.id = a.role_id";

async fn load_admin_groups(pool: &SqlitePool, admin: &mut Admin) -> Result<()> {
    let rows = sqlx::query(
        "SELECT g.name, m.options FROM admins_groups_mapping m
         JOIN groups g ON g.id = m.group_id WHERE m.admin_id = ? ORDER BY g.name ASC",
    )
    .bind(admin.id)
    .fetch_all(pool)
    .await
    .map_err(map_db_err)?;
    admin.groups = rows
        .iter()
        .map(|row| {
            let options: String = row.get("options");
            let add_to_users_as = serde_json::from_str(&options).unwrap_or(GroupType::Membership);
            AdminGroupMapping {
                name: row.get("name"),
                add_to_users_as,
            }
        })
        .collect();
    Ok(())
}

pub async fn get_admin(pool: &SqlitePool, username: &str) -> Result<Admin> {
    let row = sqlx::query(&format!("{} WHERE a.username = ?", ADMIN_SELECT))
        .bind(username)
        .fetch_optional(pool)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| Error::NotFound(format!("admin {:?}", username)))?;
    let mut admin = admin_from_row(&row)?;
    load_admin_groups(pool, &mut admin).await?;
    Ok(admin)
}

pub async fn list_admins(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
    ascending: bool,
) -> Result<Vec<Admin>> {
    let order = if ascending { "ASC" } else { "DESC" };
    let rows = sqlx::query(&format!(
        "{} ORDER BY a.username {} LIMIT ? OFFSET ?",
        ADMIN_SELECT, order
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .map_err(map_db_err)?;
    let mut admins = rows
        .iter()
        .map(admin_from_row)
        .collect::<Result<Vec<_>>>()?;
    for admin in &mut admins {
        load_admin_groups(pool, admin).await?;
    }
    Ok(admins)
}

pub async fn count_admins(pool: &SqlitePool) -> Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM admins")
        .fetch_one(pool)
        .await
        .map_err(map_db_err)
}

async fn replace_admin_groups(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    admin_id: i64,
    groups: &[AdminGroupMapping],
) -> Result<()> {
    sqlx::query("DELETE FROM admins_groups_mapping WHERE admin_id = ?")
        .bind(admin_id)
        .execute(&mut **tx)
        .await
        .map_err(map_db_err)?;
    for mapping in groups {
        let group_id: i64 = sqlx::query_scalar("SELECT id FROM groups WHERE name = ?")
            .bind(&mapping.name)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_db_err)?
            .ok_or_else(|| Error::NotFound(format!("group {:?}", mapping.name)))?;
        let options = serde_json::to_string(&mapping.add_to_users_as)
            .map_err(|e| Error::Internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO admins_groups_mapping (admin_id, group_id, options) VALUES (?, ?, ?)",
        )
        .bind(admin_id)
        .bind(group_id)
        .bind(&options)
        .execute(&mut **tx)
        .await
        .map_err(map_db_err)?;
    }
    Ok(())
}

async fn role_id_for(pool: &SqlitePool, role: &str) -> Result<Option<i64>> {
    if role.is_empty() {
        return Ok(None);
    }
    let id: Option<i64> = sqlx::query_scalar("SELECT id FROM roles WHERE name = ?")
        .bind(role)
        .fetch_optional(pool)
        .await
        .map_err(map_db_err)?;
    id.map(Some)
        .ok_or_else(|| Error::NotFound(format!("role {:?}", role)))
}

pub async fn add_admin(pool: &SqlitePool, admin: &Admin) -> Result<i64> {
    let now = util::now_ms();
    let role_id = role_id_for(pool, &admin.role).await?;
    let permissions =
        serde_json::to_string(&admin.permissions).map_err(|e| Error::Internal(e.to_string()))?;
    let filters =
        serde_json::to_string(&admin.filters).map_err(|e| Error::Internal(e.to_string()))?;
    let mut tx = pool.begin().await.map_err(map_db_err)?;
    let res = sqlx::query(
        "INSERT INTO admins (username, status, password, email, permissions, filters, role_id,
         description, additional_info, last_login, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(&admin.username)
    .bind(admin.status as i32)
    .bind(&admin.password)
    .bind(&admin.email)
    .bind(&permissions)
    .bind(&filters)
    .bind(role_id)
    .bind(&admin.description)
    .bind(&admin.additional_info)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(map_db_err)?;
    let admin_id = res.last_insert_rowid();
    replace_admin_groups(&mut tx, admin_id, &admin.groups).await?;
    tx.commit().await.map_err(map_db_err)?;
    Ok(admin_id)
}

pub async fn update_admin(pool: &SqlitePool, admin: &Admin, expected_updated_at: i64) -> Result<()> {
    let now = util::now_ms();
    let role_id = role_id_for(pool, &admin.role).await?;
    let permissions =
        serde_json::to_string(&admin.permissions).map_err(|e| Error::Internal(e.to_string()))?;
    let filters =
        serde_json::to_string(&admin.filters).map_err(|e| Error::Internal(e.to_string()))?;
    let mut tx = pool.begin().await.map_err(map_db_err)?;
    let res = sqlx::query(
        "UPDATE admins SET status = ?, password = ?, email = ?, permissions = ?, filters = ?,
         role_id = ?, description = ?, additional_info = ?, updated_at = ?
         WHERE id = ? AND updated_at = ?",
    )
    .bind(admin.status as i32)
    .bind(&admin.password)
    .bind(&admin.email)
    .bind(&permissions)
    .bind(&filters)
    .bind(role_id)
    .bind(&admin.description)
    .bind(&admin.additional_info)
    .bind(now)
    .bind(admin.id)
    .bind(expected_updated_at)
    .execute(&mut *tx)
    .await
    .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::Stale(format!("admin {:?}", admin.username)));
    }
    replace_admin_groups(&mut tx, admin.id, &admin.groups).await?;
    tx.commit().await.map_err(map_db_err)?;
    Ok(())
}

pub async fn delete_admin(pool: &SqlitePool, username: &str) -> Result<()> {
    let res = sqlx::query("DELETE FROM admins WHERE username = ?")
        .bind(username)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::NotFound(format!("admin {:?}", username)));
    }
    Ok(())
}

pub async fn update_admin_last_login(pool: &SqlitePool, username: &str) -> Result<()> {
    sqlx::query("UPDATE admins SET last_login = ? WHERE username = ?")
        .bind(util::now_ms())
        .bind(username)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::KmsConfig;

    fn kms() -> SecretBox {
        SecretBox::new(&KmsConfig {
            master_key: hex::encode([3u8; 32]),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn role_admin_cannot_hold_global_perms() {
        let mut admin = Admin {
            username: "op".to_string(),
            permissions: vec![AdminPermission::ManageAdmins],
            role: "tenant1".to_string(),
            ..Default::default()
        };
        assert!(admin.validate(&kms()).is_err());
        admin.permissions = vec![AdminPermission::AddUsers, AdminPermission::ViewUsers];
        assert!(admin.validate(&kms()).is_ok());
    }

    #[test]
    fn wildcard_grants_everything() {
        let admin = Admin {
            username: "root".to_string(),
            permissions: vec![AdminPermission::Any],
            ..Default::default()
        };
        assert!(admin.has_permission(AdminPermission::ManageDefender));
        assert!(admin.has_permission(AdminPermission::CloseConns));
    }
}
