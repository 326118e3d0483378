//! End-user accounts
//!
//! Model, validation and persistence for users: credentials, home
//! directory, path-scoped permissions, filters, quota and bandwidth
//! limits, virtual folder mounts and group memberships.

use super::folders::{self, map_db_err, VirtualFolder};
use super::fsconfig::FilesystemConfig;
use crate::kms::{Secret, SecretBox};
use crate::mfa::UserTotpConfig;
use crate::util;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use wharf_common::{Error, LoginMethod, Permission, Protocol, Result};

/// Account status.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum UserStatus {
    Disabled = 0,
    #[default]
    Active = 1,
}

/// How a group applies to a member.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum GroupType {
    /// Settings source for zero-valued user fields.
    Primary = 1,
    /// Contributes virtual folders only.
    Secondary = 2,
    /// Pure membership, no settings inheritance.
    Membership = 3,
}

/// A user's reference to a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMembership {
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: GroupType,
}

/// What happens to names matching a denied pattern.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum PatternDenyPolicy {
    /// Visible in listings, rejected on access.
    #[default]
    Default = 0,
    /// Invisible in listings and rejected on access.
    Hide = 1,
}

/// Path-scoped shell-pattern filter over file names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PatternsFilter {
    pub path: String,
    #[serde(default)]
    pub allowed_patterns: Vec<String>,
    #[serde(default)]
    pub denied_patterns: Vec<String>,
    #[serde(default)]
    pub deny_policy: PatternDenyPolicy,
}

/// Per-source bandwidth override in KB/s; 0 means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BandwidthLimit {
    /// IP or CIDR sources this limit applies to.
    pub sources: Vec<String>,
    #[serde(default)]
    pub upload_bandwidth: i64,
    #[serde(default)]
    pub download_bandwidth: i64,
}

/// Per-source data-transfer caps in MiB; 0 means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DataTransferLimit {
    pub sources: Vec<String>,
    #[serde(default)]
    pub upload_data_transfer: i64,
    #[serde(default)]
    pub download_data_transfer: i64,
    #[serde(default)]
    pub total_data_transfer: i64,
}

/// One-time recovery code, sealed at rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecoveryCode {
    pub secret: Secret,
    #[serde(default)]
    pub used: bool,
}

/// How the username is derived from a client TLS certificate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TlsUsernameMode {
    #[default]
    None,
    CommonName,
}

/// Restrictions and per-source overrides attached to a user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserFilters {
    /// CIDR allow-list; empty means any source.
    #[serde(default)]
    pub allowed_ip: Vec<String>,
    /// CIDR deny-list, checked before the allow-list.
    #[serde(default)]
    pub denied_ip: Vec<String>,
    #[serde(default)]
    pub denied_login_methods: Vec<LoginMethod>,
    #[serde(default)]
    pub denied_protocols: Vec<Protocol>,
    #[serde(default)]
    pub file_patterns: Vec<PatternsFilter>,
    /// 0 means no per-file size cap.
    #[serde(default)]
    pub max_upload_file_size: i64,
    #[serde(default)]
    pub tls_username: TlsUsernameMode,
    /// Virtual directory a session starts in; empty means "/".
    #[serde(default)]
    pub start_directory: String,
    /// Protocols that refuse login until TOTP is configured for them.
    #[serde(default)]
    pub two_factor_required_protocols: Vec<Protocol>,
    #[serde(default)]
    pub totp_config: Option<UserTotpConfig>,
    #[serde(default)]
    pub recovery_codes: Vec<RecoveryCode>,
    #[serde(default)]
    pub bandwidth_limits: Vec<BandwidthLimit>,
    #[serde(default)]
    pub data_transfer_limits: Vec<DataTransferLimit>,
    /// Days of validity applied to new shares when the user sets none.
    #[serde(default)]
    pub default_shares_expiration: i32,
    /// Reject share creation without a password.
    #[serde(default)]
    pub share_password_required: bool,
    /// Anonymous accounts can only list and download over SFTP/HTTP.
    #[serde(default)]
    pub is_anonymous: bool,
    /// Web-client capability restriction flags; union on composition.
    #[serde(default)]
    pub web_client: Vec<String>,
    #[serde(default)]
    pub allow_api_key_auth: bool,
}

/// An end-user account.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct User {
    #[serde(default)]
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub status: UserStatus,
    /// Argon2id or legacy bcrypt hash; cleared before rendering to
    /// clients, kept in provider dumps.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default)]
    pub public_keys: Vec<String>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub home_dir: String,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_sessions: i32,
    /// Bytes; 0 means unlimited.
    #[serde(default)]
    pub quota_size: i64,
    #[serde(default)]
    pub quota_files: i32,
    /// Virtual-path → permission set; "/" is mandatory.
    #[serde(default)]
    pub permissions: HashMap<String, Vec<Permission>>,
    #[serde(default)]
    pub used_quota_size: i64,
    #[serde(default)]
    pub used_quota_files: i32,
    #[serde(default)]
    pub last_quota_update: i64,
    /// KB/s; 0 means unlimited.
    #[serde(default)]
    pub upload_bandwidth: i64,
    #[serde(default)]
    pub download_bandwidth: i64,
    /// MiB; 0 means unlimited.
    #[serde(default)]
    pub upload_data_transfer: i64,
    #[serde(default)]
    pub download_data_transfer: i64,
    #[serde(default)]
    pub total_data_transfer: i64,
    #[serde(default)]
    pub used_upload_data_transfer: i64,
    #[serde(default)]
    pub used_download_data_transfer: i64,
    /// Millisecond timestamp; 0 means never expires.
    #[serde(default)]
    pub expiration_date: i64,
    #[serde(default)]
    pub last_login: i64,
    #[serde(default)]
    pub first_download: i64,
    #[serde(default)]
    pub first_upload: i64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub filters: UserFilters,
    #[serde(default)]
    pub filesystem: FilesystemConfig,
    #[serde(default)]
    pub virtual_folders: Vec<VirtualFolder>,
    #[serde(default)]
    pub groups: Vec<GroupMembership>,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub additional_info: String,
}

impl User {
    /// The permission set at the longest prefix that is an ancestor of
    /// `virtual_path`. The "/" entry is mandatory, so this always finds
    /// a match on a valid user.
    pub fn permissions_for_path(&self, virtual_path: &str) -> &[Permission] {
        let target = util::clean_path(virtual_path);
        let mut best: Option<(&str, &Vec<Permission>)> = None;
        for (path, perms) in &self.permissions {
            if util::is_same_or_ancestor(path, &target) {
                match best {
                    Some((prev, _)) if prev.len() >= path.len() => {}
                    _ => best = Some((path, perms)),
                }
            }
        }
        best.map(|(_, p)| p.as_slice()).unwrap_or(&[])
    }

    /// The file-pattern filter at the longest matching path, if any.
    pub fn pattern_filter_for_path(&self, virtual_path: &str) -> Option<&PatternsFilter> {
        let target = util::clean_path(virtual_path);
        let mut best: Option<&PatternsFilter> = None;
        for filter in &self.filters.file_patterns {
            if util::is_same_or_ancestor(&filter.path, &target) {
                match best {
                    Some(prev) if prev.path.len() >= filter.path.len() => {}
                    _ => best = Some(filter),
                }
            }
        }
        best
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiration_date > 0 && self.expiration_date < now_ms
    }

    /// The virtual directory a new session starts in.
    pub fn start_directory(&self) -> String {
        if self.filters.start_directory.is_empty() {
            "/".to_string()
        } else {
            util::clean_path(&self.filters.start_directory)
        }
    }

    /// Sum of remaining transfer allowances for display; see the policy
    /// engine for the per-source admission variant.
    pub fn has_transfer_quota(&self) -> bool {
        self.total_data_transfer > 0
            || self.upload_data_transfer > 0
            || self.download_data_transfer > 0
            || !self.filters.data_transfer_limits.is_empty()
    }

    /// Strip secrets for API responses.
    pub fn prepare_for_rendering(&mut self) {
        self.password = String::new();
        self.filesystem.redact();
        for folder in &mut self.virtual_folders {
            folder.folder.filesystem.redact();
        }
        if let Some(totp) = &mut self.filters.totp_config {
            totp.secret.redact();
        }
        for code in &mut self.filters.recovery_codes {
            code.secret.redact();
        }
    }

    /// Validate invariants and seal plain secrets. Group membership names
    /// and referenced folders are checked by the provider against the
    /// store before commit.
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
        // Users with a primary group may leave the home dir empty and
        // inherit it; standalone users must set it.
        let has_primary = self
            .groups
            .iter()
            .any(|g| g.group_type == GroupType::Primary);
        if self.home_dir.is_empty() && !has_primary {
            return Err(Error::Validation(
                "field \"home_dir\" is required".to_string(),
            ));
        }
        if !self.home_dir.is_empty() && !self.home_dir.starts_with('/') {
            return Err(Error::Validation(format!(
                "field \"home_dir\" must be an absolute path: {:?}",
                self.home_dir
            )));
        }
        if self.expiration_date > 0 && self.expiration_date < util::now_ms() {
            return Err(Error::Validation(
                "field \"expiration_date\" must be in the future".to_string(),
            ));
        }
        self.validate_permissions(has_primary)?;
        self.validate_groups()?;
        self.validate_folders()?;
        self.validate_filters()?;
        let aad = self.username.clone();
        if let Some(totp) = &mut self.filters.totp_config {
            totp.validate_and_seal(kms, &aad)?;
        }
        for code in &mut self.filters.recovery_codes {
            kms.encrypt(&mut code.secret, &aad)?;
        }
        self.filesystem.validate_and_seal(kms, &aad)
    }

    fn validate_permissions(&mut self, has_primary: bool) -> Result<()> {
        // With a primary group the whole map may come from the group.
        if self.permissions.is_empty() && has_primary {
            return Ok(());
        }
        if !self.permissions.contains_key("/") {
            return Err(Error::Validation(
                "permissions for \"/\" are required".to_string(),
            ));
        }
        let mut cleaned: HashMap<String, Vec<Permission>> = HashMap::new();
        for (path, perms) in self.permissions.drain() {
            let cleaned_path = util::clean_path(&path);
            if perms.is_empty() {
                return Err(Error::Validation(format!(
                    "no permissions set for path {:?}",
                    cleaned_path
                )));
            }
            if cleaned.insert(cleaned_path.clone(), perms).is_some() {
                return Err(Error::Validation(format!(
                    "duplicate permissions for path {:?}",
                    cleaned_path
                )));
            }
        }
        self.permissions = cleaned;
        Ok(())
    }

    fn validate_groups(&self) -> Result<()> {
        let primary_count = self
            .groups
            .iter()
            .filter(|g| g.group_type == GroupType::Primary)
            .count();
        if !self.groups.is_empty() && primary_count != 1 {
            return Err(Error::Validation(
                "exactly one primary group is required".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for g in &self.groups {
            if !seen.insert(g.name.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate group {:?}",
                    g.name
                )));
            }
        }
        Ok(())
    }

    fn validate_folders(&mut self) -> Result<()> {
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
        Ok(())
    }

    fn validate_filters(&mut self) -> Result<()> {
        for source in self
            .filters
            .allowed_ip
            .iter()
            .chain(self.filters.denied_ip.iter())
        {
            crate::validation::parse_ip_or_cidr(source)?;
        }
        for limit in &self.filters.bandwidth_limits {
            if limit.sources.is_empty() {
                return Err(Error::Validation(
                    "bandwidth limits require at least one source".to_string(),
                ));
            }
            for source in &limit.sources {
                crate::validation::parse_ip_or_cidr(source)?;
            }
        }
        for limit in &self.filters.data_transfer_limits {
            if limit.sources.is_empty() {
                return Err(Error::Validation(
                    "data transfer limits require at least one source".to_string(),
                ));
            }
            for source in &limit.sources {
                crate::validation::parse_ip_or_cidr(source)?;
            }
        }
        for filter in &mut self.filters.file_patterns {
            filter.path = util::clean_path(&filter.path);
            if filter.allowed_patterns.is_empty() && filter.denied_patterns.is_empty() {
                return Err(Error::Validation(format!(
                    "empty file pattern filter for path {:?}",
                    filter.path
                )));
            }
            for pattern in filter
                .allowed_patterns
                .iter()
                .chain(filter.denied_patterns.iter())
            {
                globset::Glob::new(pattern).map_err(|_| {
                    Error::Validation(format!("invalid file pattern {:?}", pattern))
                })?;
            }
        }
        if !self.filters.start_directory.is_empty() {
            self.filters.start_directory = util::clean_path(&self.filters.start_directory);
        }
        Ok(())
    }
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
    let public_keys: String = row.get("public_keys");
    let permissions: String = row.get("permissions");
    let filters: String = row.get("filters");
    let filesystem: String = row.get("filesystem");
    let corrupt = |field: &str, e: serde_json::Error| {
        Error::Internal(format!("corrupt user field {}: {}", field, e))
    };
    Ok(User {
        id: row.get("id"),
        username: row.get("username"),
        status: if row.get::<i32, _>("status") == 1 {
            UserStatus::Active
        } else {
            UserStatus::Disabled
        },
        password: row.get("password"),
        public_keys: serde_json::from_str(&public_keys).map_err(|e| corrupt("public_keys", e))?,
        email: row.get("email"),
        home_dir: row.get("home_dir"),
        uid: row.get::<i64, _>("uid") as u32,
        gid: row.get::<i64, _>("gid") as u32,
        max_sessions: row.get("max_sessions"),
        quota_size: row.get("quota_size"),
        quota_files: row.get("quota_files"),
        permissions: serde_json::from_str(&permissions).map_err(|e| corrupt("permissions", e))?,
        used_quota_size: row.get("used_quota_size"),
        used_quota_files: row.get("used_quota_files"),
        last_quota_update: row.get("last_quota_update"),
        upload_bandwidth: row.get("upload_bandwidth"),
        download_bandwidth: row.get("download_bandwidth"),
        upload_data_transfer: row.get("upload_data_transfer"),
        download_data_transfer: row.get("download_data_transfer"),
        total_data_transfer: row.get("total_data_transfer"),
        used_upload_data_transfer: row.get("used_upload_data_transfer"),
        used_download_data_transfer: row.get("used_download_data_transfer"),
        expiration_date: row.get("expiration_date"),
        last_login: row.get("last_login"),
        first_download: row.get("first_download"),
        first_upload: row.get("first_upload"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        filters: serde_json::from_str(&filters).map_err(|e| corrupt("filters", e))?,
        filesystem: serde_json::from_str(&filesystem).map_err(|e| corrupt("filesystem", e))?,
        virtual_folders: Vec::new(),
        groups: Vec::new(),
        role: row
            .try_get::<Option<String>, _>("role_name")
            .unwrap_or(None)
            .unwrap_or_default(),
        description: row.get("description"),
        additional_info: row.get("additional_info"),
    })
}

const USER_SELECT: &str = "SELECT u.*, r.name AS role_name FROM users u \
     LEFT JOIN roles r ON r.id = u.role_id";

async fn load_user_relations(pool: &SqlitePool, user: &mut User) -> Result<()> {
    user.virtual_folders =
        folders::load_mounts(pool, "users_folders_mapping", "user_id", user.id).await?;
    let rows = sqlx::query(
        "SELECT g.name, m.group_type FROM users_groups_mapping m
         JOIN groups g ON g.id = m.group_id WHERE m.user_id = ? ORDER BY g.name ASC",
    )
    .bind(user.id)
    .fetch_all(pool)
    .await
    .map_err(map_db_err)?;
    user.groups = rows
        .iter()
        .map(|row| {
            let group_type: i32 = row.get("group_type");
            GroupMembership {
                name: row.get("name"),
                group_type: match group_type {
                    1 => GroupType::Primary,
                    2 => GroupType::Secondary,
                    _ => GroupType::Membership,
                },
            }
        })
        .collect();
    Ok(())
}

pub async fn get_user(pool: &SqlitePool, username: &str) -> Result<User> {
    let row = sqlx::query(&format!("{} WHERE u.username = ?", USER_SELECT))
        .bind(username)
        .fetch_optional(pool)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| Error::NotFound(format!("user {:?}", username)))?;
    let mut user = user_from_row(&row)?;
    load_user_relations(pool, &mut user).await?;
    Ok(user)
}

pub async fn list_users(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
    ascending: bool,
    role: Option<&str>,
) -> Result<Vec<User>> {
    let order = if ascending { "ASC" } else { "DESC" };
    let mut users = if let Some(role) = role {
        let rows = sqlx::query(&format!(
            "{} WHERE r.name = ? ORDER BY u.username {} LIMIT ? OFFSET ?",
            USER_SELECT, order
        ))
        .bind(role)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .map_err(map_db_err)?;
        rows.iter().map(user_from_row).collect::<Result<Vec<_>>>()?
    } else {
        let rows = sqlx::query(&format!(
            "{} ORDER BY u.username {} LIMIT ? OFFSET ?",
            USER_SELECT, order
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .map_err(map_db_err)?;
        rows.iter().map(user_from_row).collect::<Result<Vec<_>>>()?
    };
    for user in &mut users {
        load_user_relations(pool, user).await?;
    }
    Ok(users)
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

async fn replace_group_memberships(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    user_id: i64,
    groups: &[GroupMembership],
) -> Result<()> {
    sqlx::query("DELETE FROM users_groups_mapping WHERE user_id = ?")
        .bind(user_id)
        .execute(&mut **tx)
        .await
        .map_err(map_db_err)?;
    for membership in groups {
        let group_id: i64 = sqlx::query_scalar("SELECT id FROM groups WHERE name = ?")
            .bind(&membership.name)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_db_err)?
            .ok_or_else(|| Error::NotFound(format!("group {:?}", membership.name)))?;
        sqlx::query(
            "INSERT INTO users_groups_mapping (user_id, group_id, group_type) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(group_id)
        .bind(membership.group_type as i32)
        .execute(&mut **tx)
        .await
        .map_err(map_db_err)?;
    }
    Ok(())
}

pub async fn add_user(pool: &SqlitePool, user: &User) -> Result<i64> {
    let now = util::now_ms();
    let role_id = role_id_for(pool, &user.role).await?;
    let public_keys = serde_json::to_string(&user.public_keys).map_err(int_err)?;
    let permissions = serde_json::to_string(&user.permissions).map_err(int_err)?;
    let filters = serde_json::to_string(&user.filters).map_err(int_err)?;
    let filesystem = serde_json::to_string(&user.filesystem).map_err(int_err)?;

    let mut tx = pool.begin().await.map_err(map_db_err)?;
    let res = sqlx::query(
        "INSERT INTO users (username, status, password, public_keys, email, home_dir, uid, gid,
         max_sessions, quota_size, quota_files, permissions, used_quota_size, used_quota_files,
         last_quota_update, upload_bandwidth, download_bandwidth, upload_data_transfer,
         download_data_transfer, total_data_transfer, used_upload_data_transfer,
         used_download_data_transfer, expiration_date, last_login, first_download, first_upload,
         created_at, updated_at, filters, filesystem, role_id, description, additional_info)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0, ?, ?, ?, ?, ?, 0, 0, ?, 0, 0, 0,
         ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&user.username)
    .bind(user.status as i32)
    .bind(&user.password)
    .bind(&public_keys)
    .bind(&user.email)
    .bind(&user.home_dir)
    .bind(user.uid as i64)
    .bind(user.gid as i64)
    .bind(user.max_sessions)
    .bind(user.quota_size)
    .bind(user.quota_files)
    .bind(&permissions)
    .bind(user.upload_bandwidth)
    .bind(user.download_bandwidth)
    .bind(user.upload_data_transfer)
    .bind(user.download_data_transfer)
    .bind(user.total_data_transfer)
    .bind(user.expiration_date)
    .bind(now)
    .bind(now)
    .bind(&filters)
    .bind(&filesystem)
    .bind(role_id)
    .bind(&user.description)
    .bind(&user.additional_info)
    .execute(&mut *tx)
    .await
    .map_err(map_db_err)?;
    let user_id = res.last_insert_rowid();
    replace_group_memberships(&mut tx, user_id, &user.groups).await?;
    folders::replace_mounts(
        &mut tx,
        "users_folders_mapping",
        "user_id",
        user_id,
        &user.virtual_folders,
    )
    .await?;
    tx.commit().await.map_err(map_db_err)?;
    Ok(user_id)
}

/// Update a user. The caller passes the `updated_at` it last read; a
/// mismatch means a concurrent writer won and yields [`Error::Stale`].
pub async fn update_user(pool: &SqlitePool, user: &User, expected_updated_at: i64) -> Result<()> {
    let now = util::now_ms();
    let role_id = role_id_for(pool, &user.role).await?;
    let public_keys = serde_json::to_string(&user.public_keys).map_err(int_err)?;
    let permissions = serde_json::to_string(&user.permissions).map_err(int_err)?;
    let filters = serde_json::to_string(&user.filters).map_err(int_err)?;
    let filesystem = serde_json::to_string(&user.filesystem).map_err(int_err)?;

    let mut tx = pool.begin().await.map_err(map_db_err)?;
    let res = sqlx::query(
        "UPDATE users SET status = ?, password = ?, public_keys = ?, email = ?, home_dir = ?,
         uid = ?, gid = ?, max_sessions = ?, quota_size = ?, quota_files = ?, permissions = ?,
         upload_bandwidth = ?, download_bandwidth = ?, upload_data_transfer = ?,
         download_data_transfer = ?, total_data_transfer = ?, expiration_date = ?,
         filters = ?, filesystem = ?, role_id = ?, description = ?, additional_info = ?,
         updated_at = ? WHERE id = ? AND updated_at = ?",
    )
    .bind(user.status as i32)
    .bind(&user.password)
    .bind(&public_keys)
    .bind(&user.email)
    .bind(&user.home_dir)
    .bind(user.uid as i64)
    .bind(user.gid as i64)
    .bind(user.max_sessions)
    .bind(user.quota_size)
    .bind(user.quota_files)
    .bind(&permissions)
    .bind(user.upload_bandwidth)
    .bind(user.download_bandwidth)
    .bind(user.upload_data_transfer)
    .bind(user.download_data_transfer)
    .bind(user.total_data_transfer)
    .bind(user.expiration_date)
    .bind(&filters)
    .bind(&filesystem)
    .bind(role_id)
    .bind(&user.description)
    .bind(&user.additional_info)
    .bind(now)
    .bind(user.id)
    .bind(expected_updated_at)
    .execute(&mut *tx)
    .await
    .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::Stale(format!("user {:?}", user.username)));
    }
    replace_group_memberships(&mut tx, user.id, &user.groups).await?;
    folders::replace_mounts(
        &mut tx,
        "users_folders_mapping",
        "user_id",
        user.id,
        &user.virtual_folders,
    )
    .await?;
    tx.commit().await.map_err(map_db_err)?;
    Ok(())
}

pub async fn delete_user(pool: &SqlitePool, username: &str) -> Result<()> {
    let res = sqlx::query("DELETE FROM users WHERE username = ?")
        .bind(username)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::NotFound(format!("user {:?}", username)));
    }
    Ok(())
}

pub async fn update_last_login(pool: &SqlitePool, username: &str) -> Result<()> {
    sqlx::query("UPDATE users SET last_login = ? WHERE username = ?")
        .bind(util::now_ms())
        .bind(username)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    Ok(())
}

/// Stamp the first upload/download audit timestamps, only when unset.
pub async fn update_first_transfer(
    pool: &SqlitePool,
    username: &str,
    upload: bool,
) -> Result<()> {
    let column = if upload { "first_upload" } else { "first_download" };
    sqlx::query(&format!(
        "UPDATE users SET {col} = ? WHERE username = ? AND {col} = 0",
        col = column
    ))
    .bind(util::now_ms())
    .bind(username)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    Ok(())
}

/// Rewrite only the stored password hash, used for KDF upgrades on login.
pub async fn update_password_hash(pool: &SqlitePool, username: &str, hash: &str) -> Result<()> {
    sqlx::query("UPDATE users SET password = ? WHERE username = ?")
        .bind(hash)
        .bind(username)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    Ok(())
}

fn int_err(e: serde_json::Error) -> Error {
    Error::Internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::KmsConfig;

    fn kms() -> SecretBox {
        SecretBox::new(&KmsConfig {
            master_key: hex::encode([2u8; 32]),
            ..Default::default()
        })
        .unwrap()
    }

    fn base_user() -> User {
        let mut permissions = HashMap::new();
        permissions.insert("/".to_string(), vec![Permission::Any]);
        User {
            username: "alice".to_string(),
            home_dir: "/srv/data/alice".to_string(),
            permissions,
            ..Default::default()
        }
    }

    #[test]
    fn root_permissions_required() {
        let mut user = base_user();
        user.permissions.clear();
        user.permissions
            .insert("/sub".to_string(), vec![Permission::List]);
        assert!(user.validate(&kms()).is_err());
    }

    #[test]
    fn longest_prefix_wins() {
        let mut user = base_user();
        user.permissions
            .insert("/docs".to_string(), vec![Permission::List]);
        user.permissions.insert(
            "/docs/private".to_string(),
            vec![Permission::List, Permission::Download],
        );
        assert_eq!(user.permissions_for_path("/docs/a.txt"), &[Permission::List]);
        assert_eq!(
            user.permissions_for_path("/docs/private/a.txt"),
            &[Permission::List, Permission::Download]
        );
        assert_eq!(user.permissions_for_path("/other"), &[Permission::Any]);
    }

    #[test]
    fn exactly_one_primary_group() {
        let mut user = base_user();
        user.groups = vec![
            GroupMembership {
                name: "g1".to_string(),
                group_type: GroupType::Secondary,
            },
        ];
        assert!(user.validate(&kms()).is_err());
        user.groups.push(GroupMembership {
            name: "g2".to_string(),
            group_type: GroupType::Primary,
        });
        assert!(user.validate(&kms()).is_ok());
    }

    #[test]
    fn virtual_path_not_root_and_unique() {
        let mut user = base_user();
        user.virtual_folders = vec![VirtualFolder {
            folder: super::super::folders::BaseVirtualFolder {
                name: "vf".to_string(),
                ..Default::default()
            },
            virtual_path: "/".to_string(),
            ..Default::default()
        }];
        assert!(user.validate(&kms()).is_err());

        user.virtual_folders[0].virtual_path = "/mnt".to_string();
        user.virtual_folders.push(user.virtual_folders[0].clone());
        assert!(user.validate(&kms()).is_err());
    }

    #[test]
    fn relative_home_dir_rejected() {
        let mut user = base_user();
        user.home_dir = "relative/path".to_string();
        assert!(user.validate(&kms()).is_err());
    }

    #[test]
    fn pattern_filter_longest_path() {
        let mut user = base_user();
        user.filters.file_patterns = vec![
            PatternsFilter {
                path: "/".to_string(),
                denied_patterns: vec!["*.exe".to_string()],
                ..Default::default()
            },
            PatternsFilter {
                path: "/uploads".to_string(),
                allowed_patterns: vec!["*.pdf".to_string()],
                ..Default::default()
            },
        ];
        let f = user.pattern_filter_for_path("/uploads/sub").unwrap();
        assert_eq!(f.path, "/uploads");
        let f = user.pattern_filter_for_path("/other").unwrap();
        assert_eq!(f.path, "/");
    }

    #[test]
    fn rendering_strips_credentials() {
        let mut user = base_user();
        user.password = "$argon2id$hash".to_string();
        user.prepare_for_rendering();
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("argon2id"));
    }
}
