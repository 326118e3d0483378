//! Data provider
//!
//! Persistent store of principals and their satellites plus the
//! authentication entrypoints every protocol front-end calls into. All
//! SQL lives in the per-entity sub-modules; this facade adds caching,
//! per-principal quota serialization and credential verification.

pub mod admins;
pub mod apikeys;
pub mod cache;
pub mod dump;
pub mod effective;
pub mod events;
pub mod folders;
pub mod fsconfig;
pub mod groups;
pub mod quota;
pub mod roles;
pub mod sessions;
pub mod shares;
pub mod users;

use crate::config::DataProviderConfig;
use crate::kms::SecretBox;
use crate::policy;
use crate::util;
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use wharf_common::{Error, LoginMethod, Protocol, Result};

pub use admins::{Admin, AdminPermission};
pub use apikeys::{ApiKey, ApiKeyScope, NewApiKey};
pub use folders::{BaseVirtualFolder, VirtualFolder};
pub use fsconfig::FilesystemConfig;
pub use groups::Group;
pub use roles::Role;
pub use shares::{Share, ShareScope};
pub use users::{User, UserStatus};

/// Hash a password with Argon2id.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| Error::Internal(format!("failed to hash password: {}", e)))?;
    Ok(hash.to_string())
}

/// Verify a password against an Argon2id hash or a legacy bcrypt hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    if hash.starts_with("$2a$") || hash.starts_with("$2b$") || hash.starts_with("$2y$") {
        return bcrypt::verify(password, hash)
            .map_err(|e| Error::Internal(format!("invalid bcrypt hash: {}", e)));
    }
    let parsed = PasswordHash::new(hash)
        .map_err(|e| Error::Internal(format!("invalid password hash: {}", e)))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

fn is_legacy_hash(hash: &str) -> bool {
    hash.starts_with("$2a$") || hash.starts_with("$2b$") || hash.starts_with("$2y$")
}

/// The shared data provider service.
pub struct DataProvider {
    pool: SqlitePool,
    kms: Arc<SecretBox>,
    cache: cache::UserCache,
    config: DataProviderConfig,
    /// Per-principal locks serializing quota updates.
    quota_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DataProvider {
    pub fn new(pool: SqlitePool, kms: Arc<SecretBox>, config: DataProviderConfig) -> Self {
        let cache = cache::UserCache::new(config.user_cache_ttl_secs);
        Self {
            pool,
            kms,
            cache,
            config,
            quota_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn kms(&self) -> &SecretBox {
        &self.kms
    }

    pub fn kms_arc(&self) -> Arc<SecretBox> {
        self.kms.clone()
    }

    /// Create the default administrator on first startup, so the store
    /// never ends up with zero admins.
    pub async fn ensure_default_admin(&self) -> Result<()> {
        if admins::count_admins(&self.pool).await? > 0 {
            return Ok(());
        }
        let mut admin = Admin {
            username: self.config.default_admin_username.clone(),
            password: hash_password(&self.config.default_admin_password)?,
            permissions: vec![AdminPermission::Any],
            status: UserStatus::Active,
            ..Default::default()
        };
        admin.validate(&self.kms)?;
        admins::add_admin(&self.pool, &admin).await?;
        tracing::info!(username = %admin.username, "created default administrator");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::ProviderUnavailable(format!("health check failed: {}", e)))?;
        Ok(())
    }

    // ----- users -----

    /// Load a user as stored, without composition.
    pub async fn get_user(&self, username: &str) -> Result<User> {
        users::get_user(&self.pool, username).await
    }

    /// Load a user and compose it with its groups; cached.
    pub async fn get_effective_user(&self, username: &str) -> Result<User> {
        if let Some(user) = self.cache.get(username) {
            return Ok(user);
        }
        let user = users::get_user(&self.pool, username).await?;
        let mut resolved = Vec::with_capacity(user.groups.len());
        for membership in &user.groups {
            match groups::get_group(&self.pool, &membership.name).await {
                Ok(group) => resolved.push(group),
                Err(Error::NotFound(_)) => {
                    tracing::warn!(
                        user = %username,
                        group = %membership.name,
                        "user references a missing group"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        let effective = effective::compose(user, &resolved);
        self.cache.put(effective.clone());
        Ok(effective)
    }

    pub async fn list_users(
        &self,
        limit: i64,
        offset: i64,
        ascending: bool,
        role: Option<&str>,
    ) -> Result<Vec<User>> {
        users::list_users(&self.pool, limit, offset, ascending, role).await
    }

    pub async fn add_user(&self, user: &mut User) -> Result<()> {
        if !user.password.is_empty() && !user.password.starts_with('$') {
            user.password = hash_password(&user.password)?;
        }
        user.validate(&self.kms)?;
        user.id = users::add_user(&self.pool, user).await?;
        Ok(())
    }

    pub async fn update_user(&self, user: &mut User, expected_updated_at: i64) -> Result<()> {
        if !user.password.is_empty() && !user.password.starts_with('$') {
            user.password = hash_password(&user.password)?;
        }
        user.validate(&self.kms)?;
        users::update_user(&self.pool, user, expected_updated_at).await?;
        self.cache.invalidate(&user.username);
        Ok(())
    }

    pub async fn delete_user(&self, username: &str) -> Result<()> {
        users::delete_user(&self.pool, username).await?;
        self.cache.invalidate(username);
        Ok(())
    }

    // ----- authentication -----

    /// Authenticate a user by password for `protocol` from `ip`.
    pub async fn check_user_password(
        &self,
        username: &str,
        password: &str,
        protocol: Protocol,
        ip: IpAddr,
    ) -> Result<User> {
        let user = self.get_effective_user(username).await?;
        policy::authorize_login(&user, protocol, LoginMethod::Password, ip, util::now_ms())?;
        if user.password.is_empty() {
            return Err(Error::Unauthorized(format!(
                "user {:?} has no password set",
                username
            )));
        }
        if !verify_password(password, &user.password)? {
            return Err(Error::Unauthorized(format!(
                "invalid credentials for user {:?}",
                username
            )));
        }
        if self.config.rehash_legacy_passwords && is_legacy_hash(&user.password) {
            let new_hash = hash_password(password)?;
            users::update_password_hash(&self.pool, username, &new_hash).await?;
            self.cache.invalidate(username);
            tracing::info!(user = %username, "re-hashed legacy password hash");
        }
        users::update_last_login(&self.pool, username).await?;
        Ok(user)
    }

    /// Authenticate a user by SSH public key.
    pub async fn check_user_pubkey(
        &self,
        username: &str,
        pubkey: &str,
        protocol: Protocol,
        ip: IpAddr,
    ) -> Result<User> {
        let user = self.get_effective_user(username).await?;
        policy::authorize_login(&user, protocol, LoginMethod::PublicKey, ip, util::now_ms())?;
        let presented = normalize_pubkey(pubkey);
        let matched = user
            .public_keys
            .iter()
            .any(|k| normalize_pubkey(k) == presented);
        if !matched {
            return Err(Error::Unauthorized(format!(
                "no matching public key for user {:?}",
                username
            )));
        }
        users::update_last_login(&self.pool, username).await?;
        Ok(user)
    }

    /// Authenticate an admin by password.
    pub async fn check_admin_password(
        &self,
        username: &str,
        password: &str,
        ip: IpAddr,
    ) -> Result<Admin> {
        let admin = admins::get_admin(&self.pool, username).await?;
        if admin.status != UserStatus::Active {
            return Err(Error::Unauthorized(format!(
                "admin {:?} is disabled",
                username
            )));
        }
        if !admin.filters.allow_list.is_empty()
            && !crate::validation::ip_matches_any(ip, &admin.filters.allow_list)
        {
            return Err(Error::Unauthorized(format!(
                "admin {:?} login not allowed from {}",
                username, ip
            )));
        }
        if !verify_password(password, &admin.password)? {
            return Err(Error::Unauthorized(format!(
                "invalid credentials for admin {:?}",
                username
            )));
        }
        admins::update_admin_last_login(&self.pool, username).await?;
        Ok(admin)
    }

    /// Verify an API key of shape `<key-id>.<secret>` and stamp its use.
    pub async fn check_api_key(&self, presented: &str, scope: ApiKeyScope) -> Result<ApiKey> {
        let (key_id, secret) = presented
            .split_once('.')
            .ok_or_else(|| Error::Unauthorized("malformed API key".to_string()))?;
        let key = apikeys::get_api_key(&self.pool, key_id).await.map_err(|e| {
            match e {
                Error::NotFound(_) => Error::Unauthorized("invalid API key".to_string()),
                other => other,
            }
        })?;
        if key.scope != scope {
            return Err(Error::Unauthorized("API key scope mismatch".to_string()));
        }
        if key.is_expired(util::now_ms()) {
            return Err(Error::Unauthorized("API key is expired".to_string()));
        }
        if !verify_password(secret, &key.key_hash)? {
            return Err(Error::Unauthorized("invalid API key".to_string()));
        }
        apikeys::update_api_key_last_use(&self.pool, key_id).await?;
        Ok(key)
    }

    /// Generate and store a new API key, returning the one-shot plain
    /// credential.
    pub async fn add_api_key(&self, key: &mut ApiKey) -> Result<NewApiKey> {
        key.validate()?;
        key.id = util::random_string(16);
        let secret = util::random_string(32);
        let hash = hash_password(&secret)?;
        apikeys::add_api_key(&self.pool, key, &hash).await?;
        Ok(NewApiKey {
            id: key.id.clone(),
            key: format!("{}.{}", key.id, secret),
        })
    }

    // ----- quota -----

    async fn quota_lock(&self, principal: &str) -> Arc<Mutex<()>> {
        let mut locks = self.quota_locks.lock().await;
        locks
            .entry(principal.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Serialized per-principal quota update; folder buckets use the
    /// `folder:` prefix in the lock key space.
    pub async fn transactional_user_quota_update(
        &self,
        username: &str,
        files: i32,
        size: i64,
        reset: bool,
    ) -> Result<()> {
        let lock = self.quota_lock(username).await;
        let _guard = lock.lock().await;
        quota::update_user_quota(&self.pool, username, files, size, reset).await?;
        self.cache.invalidate(username);
        Ok(())
    }

    pub async fn transactional_folder_quota_update(
        &self,
        folder_name: &str,
        files: i32,
        size: i64,
        reset: bool,
    ) -> Result<()> {
        let lock = self.quota_lock(&format!("folder:{}", folder_name)).await;
        let _guard = lock.lock().await;
        quota::update_folder_quota(&self.pool, folder_name, files, size, reset).await
    }

    pub async fn transactional_transfer_quota_update(
        &self,
        username: &str,
        upload: i64,
        download: i64,
        reset: bool,
    ) -> Result<()> {
        let lock = self.quota_lock(username).await;
        let _guard = lock.lock().await;
        quota::update_transfer_quota(&self.pool, username, upload, download, reset).await?;
        self.cache.invalidate(username);
        Ok(())
    }

    // ----- groups / roles / folders: cache-aware delegates -----

    pub async fn update_group(&self, group: &mut Group, expected_updated_at: i64) -> Result<()> {
        group.validate(&self.kms)?;
        groups::update_group(&self.pool, group, expected_updated_at).await?;
        let members = groups::group_member_usernames(&self.pool, &group.name).await?;
        self.cache
            .invalidate_many(members.iter().map(String::as_str));
        Ok(())
    }

    pub async fn delete_group(&self, name: &str) -> Result<()> {
        groups::delete_group(&self.pool, name).await
    }

    pub async fn delete_folder(&self, name: &str) -> Result<()> {
        folders::delete_folder(&self.pool, name).await?;
        // Mounts changed under composed users; drop everything.
        self.cache.clear();
        Ok(())
    }

    /// Decrypted TOTP secret for login flows, when TOTP is enabled.
    pub fn mfa_secret_for(&self, user: &User) -> Result<Option<String>> {
        match &user.filters.totp_config {
            Some(totp) if totp.enabled => {
                let secret = self.kms.decrypt(&totp.secret, &user.username)?;
                Ok(Some(secret))
            }
            _ => Ok(None),
        }
    }
}

/// Compare SSH public keys on their base64 blob, ignoring comments.
fn normalize_pubkey(key: &str) -> String {
    let mut parts = key.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(algo), Some(blob)) => format!("{} {}", algo, blob),
        _ => key.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_roundtrip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn legacy_bcrypt_verifies() {
        let hash = bcrypt::hash("legacy-pw", 4).unwrap();
        assert!(is_legacy_hash(&hash));
        assert!(verify_password("legacy-pw", &hash).unwrap());
        assert!(!verify_password("nope", &hash).unwrap());
    }

    #[test]
    fn pubkey_comment_ignored() {
        let a = "ssh-ed25519 AAAAC3Nza... user@host";
        let b = "ssh-ed25519 AAAAC3Nza...";
        assert_eq!(normalize_pubkey(a), normalize_pubkey(b));
    }
}

#[cfg(test)]
mod provider_tests {
    use super::*;
    use crate::kms::KmsConfig;
    use std::collections::HashMap;
    use wharf_common::Permission;

    async fn test_provider() -> DataProvider {
        let pool = crate::db::open_test_pool().await;
        let kms = Arc::new(SecretBox::new(&KmsConfig::default()).unwrap());
        DataProvider::new(pool, kms, crate::config::DataProviderConfig::default())
    }

    fn new_user(username: &str) -> User {
        let mut permissions = HashMap::new();
        permissions.insert("/".to_string(), vec![Permission::Any]);
        User {
            username: username.to_string(),
            password: "pw".to_string(),
            home_dir: format!("/srv/data/{}", username),
            permissions,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn add_then_fetch_roundtrips() {
        let provider = test_provider().await;
        let mut user = new_user("alice");
        user.email = "alice@example.com".to_string();
        user.quota_files = 10;
        provider.add_user(&mut user).await.unwrap();

        let fetched = provider.get_user("alice").await.unwrap();
        assert_eq!(fetched.email, "alice@example.com");
        assert_eq!(fetched.quota_files, 10);
        assert_eq!(
            fetched.permissions.get("/").unwrap(),
            &vec![Permission::Any]
        );
        // The plain password was hashed on insert
        assert!(fetched.password.starts_with("$argon2"));
    }

    #[tokio::test]
    async fn password_check_and_last_login() {
        let provider = test_provider().await;
        let mut user = new_user("bob");
        provider.add_user(&mut user).await.unwrap();

        let ip = "10.0.0.1".parse().unwrap();
        let authed = provider
            .check_user_password("bob", "pw", Protocol::Http, ip)
            .await
            .unwrap();
        assert_eq!(authed.username, "bob");
        let err = provider
            .check_user_password("bob", "wrong", Protocol::Http, ip)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unauthorized");
        let stored = provider.get_user("bob").await.unwrap();
        assert!(stored.last_login > 0);
    }

    #[tokio::test]
    async fn legacy_hash_upgraded_on_login() {
        let provider = test_provider().await;
        let mut user = new_user("carol");
        user.password = bcrypt::hash("legacy", 4).unwrap();
        provider.add_user(&mut user).await.unwrap();

        let ip = "10.0.0.1".parse().unwrap();
        provider
            .check_user_password("carol", "legacy", Protocol::Http, ip)
            .await
            .unwrap();
        let stored = provider.get_user("carol").await.unwrap();
        assert!(stored.password.starts_with("$argon2"));
        // And the upgraded hash still verifies
        provider
            .check_user_password("carol", "legacy", Protocol::Http, ip)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn effective_user_composes_primary_group() {
        let provider = test_provider().await;
        let mut group_perms = HashMap::new();
        group_perms.insert(
            "/".to_string(),
            vec![Permission::List, Permission::Download],
        );
        let mut group = Group {
            name: "G1".to_string(),
            user_settings: groups::GroupUserSettings {
                permissions: group_perms,
                ..Default::default()
            },
            ..Default::default()
        };
        group.validate(provider.kms()).unwrap();
        groups::add_group(provider.pool(), &group).await.unwrap();

        let mut user = new_user("dave");
        user.permissions.clear();
        user.groups = vec![users::GroupMembership {
            name: "G1".to_string(),
            group_type: users::GroupType::Primary,
        }];
        provider.add_user(&mut user).await.unwrap();

        let effective = provider.get_effective_user("dave").await.unwrap();
        assert_eq!(
            effective.permissions.get("/").unwrap(),
            &vec![Permission::List, Permission::Download]
        );
        // Group deletion is blocked while referenced
        let err = provider.delete_group("G1").await.unwrap_err();
        assert_eq!(err.kind(), "referenced");
    }

    #[tokio::test]
    async fn stale_update_is_detected() {
        let provider = test_provider().await;
        let mut user = new_user("erin");
        provider.add_user(&mut user).await.unwrap();

        let mut first = provider.get_user("erin").await.unwrap();
        let mut second = first.clone();
        let stamp = first.updated_at;
        first.description = "first".to_string();
        provider.update_user(&mut first, stamp).await.unwrap();
        second.description = "second".to_string();
        let err = provider.update_user(&mut second, stamp).await.unwrap_err();
        assert_eq!(err.kind(), "stale");
    }

    #[tokio::test]
    async fn quota_updates_are_serialized_and_clamped() {
        let provider = test_provider().await;
        let mut user = new_user("frank");
        provider.add_user(&mut user).await.unwrap();

        provider
            .transactional_user_quota_update("frank", 2, 2048, false)
            .await
            .unwrap();
        provider
            .transactional_user_quota_update("frank", -5, -4096, false)
            .await
            .unwrap();
        let (files, size) = quota::get_used_quota(provider.pool(), "frank")
            .await
            .unwrap();
        assert_eq!(files, 0);
        assert_eq!(size, 0);

        provider
            .transactional_transfer_quota_update("frank", 1024, 512, false)
            .await
            .unwrap();
        let (ul, dl) = quota::get_used_transfer(provider.pool(), "frank")
            .await
            .unwrap();
        assert_eq!((ul, dl), (1024, 512));
    }

    #[tokio::test]
    async fn api_key_lifecycle() {
        let provider = test_provider().await;
        let mut user = new_user("grace");
        user.filters.allow_api_key_auth = true;
        provider.add_user(&mut user).await.unwrap();

        let mut key = ApiKey {
            name: "ci".to_string(),
            scope: ApiKeyScope::User,
            user: "grace".to_string(),
            ..Default::default()
        };
        let new_key = provider.add_api_key(&mut key).await.unwrap();
        assert!(new_key.key.contains('.'));

        let checked = provider
            .check_api_key(&new_key.key, ApiKeyScope::User)
            .await
            .unwrap();
        assert_eq!(checked.user, "grace");
        // Wrong scope is rejected
        assert!(provider
            .check_api_key(&new_key.key, ApiKeyScope::Admin)
            .await
            .is_err());
        // Wrong secret is rejected
        let forged = format!("{}.{}", new_key.id, "x".repeat(32));
        assert!(provider
            .check_api_key(&forged, ApiKeyScope::User)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn share_token_cap_is_atomic() {
        let provider = test_provider().await;
        let mut user = new_user("heidi");
        provider.add_user(&mut user).await.unwrap();

        let mut share = Share {
            share_id: "sh1".to_string(),
            name: "drop".to_string(),
            scope: ShareScope::ReadWrite,
            paths: vec!["/".to_string()],
            username: "heidi".to_string(),
            max_tokens: 2,
            ..Default::default()
        };
        share.validate().unwrap();
        shares::add_share(provider.pool(), &share).await.unwrap();

        shares::consume_share_token(provider.pool(), "sh1")
            .await
            .unwrap();
        shares::consume_share_token(provider.pool(), "sh1")
            .await
            .unwrap();
        let err = shares::consume_share_token(provider.pool(), "sh1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
        let stored = shares::get_share(provider.pool(), "sh1").await.unwrap();
        assert_eq!(stored.used_tokens, 2);
    }

    #[tokio::test]
    async fn dump_load_dump_is_stable() {
        let provider = test_provider().await;
        provider.ensure_default_admin().await.unwrap();
        let mut user = new_user("ivan");
        provider.add_user(&mut user).await.unwrap();

        let first = dump::dump(provider.pool()).await.unwrap();
        let serialized_first = serde_json::to_string(&first).unwrap();

        // Restore into a fresh store and dump again
        let other = test_provider().await;
        dump::load(other.pool(), &first).await.unwrap();
        let second = dump::dump(other.pool()).await.unwrap();

        // Timestamps are server-assigned; compare the stable fields
        assert_eq!(first.users.len(), second.users.len());
        assert_eq!(first.admins.len(), second.admins.len());
        assert_eq!(first.users[0].username, second.users[0].username);
        assert_eq!(first.users[0].password, second.users[0].password);
        assert!(serialized_first.contains("ivan"));
    }

    #[tokio::test]
    async fn deleting_referenced_role_is_blocked() {
        let provider = test_provider().await;
        let role = Role {
            name: "tenant".to_string(),
            ..Default::default()
        };
        roles::add_role(provider.pool(), &role).await.unwrap();
        let mut user = new_user("judy");
        user.role = "tenant".to_string();
        provider.add_user(&mut user).await.unwrap();

        let err = roles::delete_role(provider.pool(), "tenant")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "referenced");
        provider.delete_user("judy").await.unwrap();
        roles::delete_role(provider.pool(), "tenant").await.unwrap();
    }
}
