//! Effective-user composition
//!
//! Merges a user with its groups: the primary group fills zero-valued
//! fields, every group contributes virtual folders, filters concatenate
//! and web-client restriction flags union. The result is what the policy
//! engine and the VFS operate on.

use super::groups::Group;
use super::users::{GroupType, User};
use crate::util;

/// Compose `user` with its resolved groups. `groups` holds the loaded
/// group objects for the user's memberships; missing entries are skipped
/// (a deleted group must not block login).
pub fn compose(mut user: User, groups: &[Group]) -> User {
    if user.groups.is_empty() {
        finalize(&mut user);
        return user;
    }
    let primary_name = user
        .groups
        .iter()
        .find(|m| m.group_type == GroupType::Primary)
        .map(|m| m.name.clone());
    let find = |name: &str| groups.iter().find(|g| g.name == name);

    if let Some(primary) = primary_name.as_deref().and_then(find) {
        inherit_primary(&mut user, primary);
    }

    // Mount union: user first, then primary, then secondaries, first
    // mount at a virtual path wins.
    let mut ordered_groups: Vec<&Group> = Vec::new();
    if let Some(p) = primary_name.as_deref().and_then(find) {
        ordered_groups.push(p);
    }
    for membership in &user.groups {
        if membership.group_type == GroupType::Secondary {
            if let Some(g) = find(&membership.name) {
                ordered_groups.push(g);
            }
        }
    }
    for group in &ordered_groups {
        for folder in &group.virtual_folders {
            if !user
                .virtual_folders
                .iter()
                .any(|f| f.virtual_path == folder.virtual_path)
            {
                user.virtual_folders.push(folder.clone());
            }
        }
        // Filters and limits concatenate; web-client flags union.
        let filters = &group.user_settings.filters;
        user.filters
            .file_patterns
            .extend(filters.file_patterns.iter().cloned());
        user.filters
            .bandwidth_limits
            .extend(filters.bandwidth_limits.iter().cloned());
        user.filters
            .data_transfer_limits
            .extend(filters.data_transfer_limits.iter().cloned());
        for flag in &filters.web_client {
            if !user.filters.web_client.contains(flag) {
                user.filters.web_client.push(flag.clone());
            }
        }
    }

    finalize(&mut user);
    user
}

/// Fill zero-valued user fields from the primary group's settings.
fn inherit_primary(user: &mut User, primary: &Group) {
    let settings = &primary.user_settings;
    if user.home_dir.is_empty() {
        user.home_dir = settings.home_dir.clone();
    }
    if user.max_sessions == 0 {
        user.max_sessions = settings.max_sessions;
    }
    if user.quota_size == 0 {
        user.quota_size = settings.quota_size;
    }
    if user.quota_files == 0 {
        user.quota_files = settings.quota_files;
    }
    if user.upload_bandwidth == 0 {
        user.upload_bandwidth = settings.upload_bandwidth;
    }
    if user.download_bandwidth == 0 {
        user.download_bandwidth = settings.download_bandwidth;
    }
    if user.upload_data_transfer == 0 {
        user.upload_data_transfer = settings.upload_data_transfer;
    }
    if user.download_data_transfer == 0 {
        user.download_data_transfer = settings.download_data_transfer;
    }
    if user.total_data_transfer == 0 {
        user.total_data_transfer = settings.total_data_transfer;
    }
    if user.expiration_date == 0 && settings.expires_in > 0 {
        user.expiration_date =
            user.created_at + i64::from(settings.expires_in) * 24 * 3600 * 1000;
    }
    // The permission map counts as zero only when it has no "/" entry.
    if !user.permissions.contains_key("/") && settings.permissions.contains_key("/") {
        user.permissions = settings.permissions.clone();
    }
    if user.filesystem == Default::default() && settings.filesystem != Default::default() {
        user.filesystem = settings.filesystem.clone();
    }

    let filters = &settings.filters;
    if user.filters.allowed_ip.is_empty() {
        user.filters.allowed_ip = filters.allowed_ip.clone();
    }
    if user.filters.denied_ip.is_empty() {
        user.filters.denied_ip = filters.denied_ip.clone();
    }
    if user.filters.denied_login_methods.is_empty() {
        user.filters.denied_login_methods = filters.denied_login_methods.clone();
    }
    if user.filters.denied_protocols.is_empty() {
        user.filters.denied_protocols = filters.denied_protocols.clone();
    }
    if user.filters.max_upload_file_size == 0 {
        user.filters.max_upload_file_size = filters.max_upload_file_size;
    }
    if user.filters.start_directory.is_empty() {
        user.filters.start_directory = filters.start_directory.clone();
    }
    if user.filters.two_factor_required_protocols.is_empty() {
        user.filters.two_factor_required_protocols =
            filters.two_factor_required_protocols.clone();
    }
    if user.filters.default_shares_expiration == 0 {
        user.filters.default_shares_expiration = filters.default_shares_expiration;
    }
    if filters.share_password_required {
        user.filters.share_password_required = true;
    }
}

/// Placeholder substitution, applied after every merge.
fn finalize(user: &mut User) {
    let username = user.username.clone();
    if user.home_dir.contains("%username%") {
        user.home_dir = user.home_dir.replace("%username%", &username);
    }
    if user.filters.start_directory.contains("%username%") {
        user.filters.start_directory = user
            .filters
            .start_directory
            .replace("%username%", &username);
        user.filters.start_directory = util::clean_path(&user.filters.start_directory);
    }
    user.filesystem.replace_placeholders(&username);
    for folder in &mut user.virtual_folders {
        folder.folder.filesystem.replace_placeholders(&username);
        if folder.folder.mapped_path.contains("%username%") {
            folder.folder.mapped_path =
                folder.folder.mapped_path.replace("%username%", &username);
        }
    }
    for filter in &mut user.filters.file_patterns {
        if filter.path.contains("%username%") {
            filter.path = util::clean_path(&filter.path.replace("%username%", &username));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::folders::{BaseVirtualFolder, VirtualFolder};
    use crate::provider::groups::GroupUserSettings;
    use crate::provider::users::{GroupMembership, PatternsFilter};
    use std::collections::HashMap;
    use wharf_common::Permission;

    fn group_with(
        name: &str,
        permissions: HashMap<String, Vec<Permission>>,
        folders: Vec<VirtualFolder>,
    ) -> Group {
        Group {
            name: name.to_string(),
            user_settings: GroupUserSettings {
                permissions,
                ..Default::default()
            },
            virtual_folders: folders,
            ..Default::default()
        }
    }

    fn mount(name: &str, path: &str) -> VirtualFolder {
        VirtualFolder {
            folder: BaseVirtualFolder {
                name: name.to_string(),
                mapped_path: format!("/srv/{}", name),
                ..Default::default()
            },
            virtual_path: path.to_string(),
            quota_size: -1,
            quota_files: -1,
        }
    }

    #[test]
    fn primary_group_fills_permissions_and_folders() {
        let mut perms = HashMap::new();
        perms.insert(
            "/".to_string(),
            vec![Permission::List, Permission::Download],
        );
        let g1 = group_with("G1", perms, vec![mount("vf", "/vf")]);

        let user = User {
            username: "bob".to_string(),
            groups: vec![GroupMembership {
                name: "G1".to_string(),
                group_type: GroupType::Primary,
            }],
            ..Default::default()
        };
        let effective = compose(user, &[g1]);
        assert_eq!(
            effective.permissions.get("/").unwrap(),
            &vec![Permission::List, Permission::Download]
        );
        assert!(effective
            .virtual_folders
            .iter()
            .any(|f| f.virtual_path == "/vf"));
    }

    #[test]
    fn user_permissions_with_root_entry_are_kept() {
        let mut group_perms = HashMap::new();
        group_perms.insert("/".to_string(), vec![Permission::List]);
        let g1 = group_with("G1", group_perms, Vec::new());

        let mut user_perms = HashMap::new();
        user_perms.insert("/".to_string(), vec![Permission::Any]);
        let user = User {
            username: "bob".to_string(),
            permissions: user_perms,
            groups: vec![GroupMembership {
                name: "G1".to_string(),
                group_type: GroupType::Primary,
            }],
            ..Default::default()
        };
        let effective = compose(user, &[g1]);
        assert_eq!(
            effective.permissions.get("/").unwrap(),
            &vec![Permission::Any]
        );
    }

    #[test]
    fn first_mount_at_virtual_path_wins() {
        let g1 = group_with("G1", HashMap::new(), vec![mount("p", "/shared")]);
        let g2 = group_with("G2", HashMap::new(), vec![mount("s", "/shared")]);
        let user = User {
            username: "bob".to_string(),
            home_dir: "/srv/bob".to_string(),
            virtual_folders: vec![mount("own", "/shared")],
            groups: vec![
                GroupMembership {
                    name: "G1".to_string(),
                    group_type: GroupType::Primary,
                },
                GroupMembership {
                    name: "G2".to_string(),
                    group_type: GroupType::Secondary,
                },
            ],
            ..Default::default()
        };
        let effective = compose(user, &[g1, g2]);
        let mounts: Vec<_> = effective
            .virtual_folders
            .iter()
            .filter(|f| f.virtual_path == "/shared")
            .collect();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].folder.name, "own");
    }

    #[test]
    fn filters_concatenate_and_flags_union() {
        let mut g1 = group_with("G1", HashMap::new(), Vec::new());
        g1.user_settings.filters.file_patterns = vec![PatternsFilter {
            path: "/".to_string(),
            denied_patterns: vec!["*.exe".to_string()],
            ..Default::default()
        }];
        g1.user_settings.filters.web_client = vec!["shares-disabled".to_string()];
        let mut user = User {
            username: "bob".to_string(),
            home_dir: "/srv/bob".to_string(),
            groups: vec![GroupMembership {
                name: "G1".to_string(),
                group_type: GroupType::Primary,
            }],
            ..Default::default()
        };
        user.filters.file_patterns = vec![PatternsFilter {
            path: "/in".to_string(),
            allowed_patterns: vec!["*.pdf".to_string()],
            ..Default::default()
        }];
        user.filters.web_client = vec!["shares-disabled".to_string()];
        let effective = compose(user, &[g1]);
        assert_eq!(effective.filters.file_patterns.len(), 2);
        assert_eq!(effective.filters.web_client.len(), 1);
    }

    #[test]
    fn username_placeholder_expands() {
        let g1 = Group {
            name: "G1".to_string(),
            user_settings: GroupUserSettings {
                home_dir: "/srv/homes/%username%".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let user = User {
            username: "carol".to_string(),
            groups: vec![GroupMembership {
                name: "G1".to_string(),
                group_type: GroupType::Primary,
            }],
            ..Default::default()
        };
        let effective = compose(user, &[g1]);
        assert_eq!(effective.home_dir, "/srv/homes/carol");
    }

    #[test]
    fn missing_group_is_skipped() {
        let user = User {
            username: "bob".to_string(),
            home_dir: "/srv/bob".to_string(),
            groups: vec![GroupMembership {
                name: "gone".to_string(),
                group_type: GroupType::Primary,
            }],
            ..Default::default()
        };
        let effective = compose(user, &[]);
        assert_eq!(effective.home_dir, "/srv/bob");
    }
}
