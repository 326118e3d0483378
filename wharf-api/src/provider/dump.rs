//! Provider backup
//!
//! Logical dump and restore of every entity. Output ordering is
//! deterministic (sorted by name), so dump → load → dump produces
//! byte-identical output.

use super::folders::BaseVirtualFolder;
use super::{admins, apikeys, folders, groups, roles, shares, users};
use crate::events::actions::EventAction;
use crate::events::rules::EventRule;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use wharf_common::{Error, Result};

/// Version of the dump layout.
const DUMP_VERSION: i32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupData {
    pub version: i32,
    #[serde(default)]
    pub roles: Vec<roles::Role>,
    #[serde(default)]
    pub folders: Vec<BaseVirtualFolder>,
    #[serde(default)]
    pub groups: Vec<groups::Group>,
    #[serde(default)]
    pub users: Vec<users::User>,
    #[serde(default)]
    pub admins: Vec<admins::Admin>,
    #[serde(default)]
    pub api_keys: Vec<apikeys::ApiKey>,
    #[serde(default)]
    pub shares: Vec<shares::Share>,
    #[serde(default)]
    pub event_actions: Vec<EventAction>,
    #[serde(default)]
    pub event_rules: Vec<EventRule>,
}

/// Everything, sorted, with hashed credentials as stored (a dump is a
/// restore artifact, not an API response).
pub async fn dump(pool: &SqlitePool) -> Result<BackupData> {
    const ALL: i64 = i64::MAX;
    let mut data = BackupData {
        version: DUMP_VERSION,
        roles: roles::list_roles(pool, ALL, 0, true).await?,
        folders: folders::list_folders(pool, ALL, 0, true).await?,
        groups: groups::list_groups(pool, ALL, 0, true).await?,
        users: users::list_users(pool, ALL, 0, true, None).await?,
        admins: admins::list_admins(pool, ALL, 0, true).await?,
        api_keys: apikeys::list_api_keys(pool, ALL, 0, true).await?,
        shares: Vec::new(),
        event_actions: super::events::list_actions(pool, ALL, 0, true).await?,
        event_rules: super::events::list_all_rules(pool, ALL, 0, true).await?,
    };
    for user in &data.users {
        data.shares.extend(
            shares::list_shares_for_user(pool, &user.username, ALL, 0, true).await?,
        );
    }
    data.shares.sort_by(|a, b| a.share_id.cmp(&b.share_id));
    // Server-assigned row ids are not portable.
    for user in &mut data.users {
        user.id = 0;
    }
    for admin in &mut data.admins {
        admin.id = 0;
    }
    Ok(data)
}

/// Apply a dump: insert new objects, update existing ones. Dependencies
/// load first (roles, folders, groups) so references resolve.
pub async fn load(pool: &SqlitePool, data: &BackupData) -> Result<()> {
    if data.version > DUMP_VERSION {
        return Err(Error::Validation(format!(
            "unsupported backup version {}",
            data.version
        )));
    }
    for role in &data.roles {
        match roles::get_role(pool, &role.name).await {
            Ok(existing) => {
                roles::update_role(pool, &with_role_id(role, existing.id), existing.updated_at)
                    .await?
            }
            Err(Error::NotFound(_)) => {
                roles::add_role(pool, role).await?;
            }
            Err(e) => return Err(e),
        }
    }
    for folder in &data.folders {
        match folders::get_folder(pool, &folder.name).await {
            Ok(_) => folders::update_folder(pool, folder).await?,
            Err(Error::NotFound(_)) => {
                folders::add_folder(pool, folder).await?;
            }
            Err(e) => return Err(e),
        }
    }
    for group in &data.groups {
        match groups::get_group(pool, &group.name).await {
            Ok(existing) => {
                let mut updated = group.clone();
                updated.id = existing.id;
                groups::update_group(pool, &updated, existing.updated_at).await?
            }
            Err(Error::NotFound(_)) => {
                groups::add_group(pool, group).await?;
            }
            Err(e) => return Err(e),
        }
    }
    for user in &data.users {
        match users::get_user(pool, &user.username).await {
            Ok(existing) => {
                let mut updated = user.clone();
                updated.id = existing.id;
                users::update_user(pool, &updated, existing.updated_at).await?
            }
            Err(Error::NotFound(_)) => {
                users::add_user(pool, user).await?;
            }
            Err(e) => return Err(e),
        }
    }
    for admin in &data.admins {
        match admins::get_admin(pool, &admin.username).await {
            Ok(existing) => {
                let mut updated = admin.clone();
                updated.id = existing.id;
                admins::update_admin(pool, &updated, existing.updated_at).await?
            }
            Err(Error::NotFound(_)) => {
                admins::add_admin(pool, admin).await?;
            }
            Err(e) => return Err(e),
        }
    }
    for key in &data.api_keys {
        match apikeys::get_api_key(pool, &key.id).await {
            Ok(_) => apikeys::update_api_key(pool, key).await?,
            Err(Error::NotFound(_)) => {
                apikeys::add_api_key(pool, key, &key.key_hash).await?;
            }
            Err(e) => return Err(e),
        }
    }
    for share in &data.shares {
        match shares::get_share(pool, &share.share_id).await {
            Ok(_) => shares::update_share(pool, share).await?,
            Err(Error::NotFound(_)) => {
                shares::add_share(pool, share).await?;
            }
            Err(e) => return Err(e),
        }
    }
    for action in &data.event_actions {
        match super::events::get_action(pool, &action.name).await {
            Ok(_) => super::events::update_action(pool, action).await?,
            Err(Error::NotFound(_)) => {
                super::events::add_action(pool, action).await?;
            }
            Err(e) => return Err(e),
        }
    }
    for rule in &data.event_rules {
        match super::events::get_rule(pool, &rule.name).await {
            Ok(existing) => {
                let mut updated = rule.clone();
                updated.id = existing.id;
                super::events::update_rule(pool, &updated).await?
            }
            Err(Error::NotFound(_)) => {
                super::events::add_rule(pool, rule).await?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn with_role_id(role: &roles::Role, id: i64) -> roles::Role {
    let mut updated = role.clone();
    updated.id = id;
    updated
}
