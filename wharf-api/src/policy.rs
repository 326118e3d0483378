//! Policy engine
//!
//! Pure authorization functions over an effective user and a request
//! context. Nothing here performs I/O; failures are error variants with
//! a log message and nothing else.

use crate::provider::users::{PatternDenyPolicy, User, UserStatus};
use crate::util;
use crate::validation;
use globset::Glob;
use std::net::IpAddr;
use wharf_common::{Error, LoginMethod, Permission, Protocol, Result};

/// May this user log in at all, with this protocol and method, from
/// this address, now?
pub fn authorize_login(
    user: &User,
    protocol: Protocol,
    method: LoginMethod,
    ip: IpAddr,
    now_ms: i64,
) -> Result<()> {
    if user.status != UserStatus::Active {
        return Err(Error::Unauthorized(format!(
            "user {:?} is disabled",
            user.username
        )));
    }
    if user.is_expired(now_ms) {
        return Err(Error::Unauthorized(format!(
            "user {:?} is expired",
            user.username
        )));
    }
    if user.filters.denied_protocols.contains(&protocol) {
        return Err(Error::Unauthorized(format!(
            "protocol {} is not allowed for user {:?}",
            protocol, user.username
        )));
    }
    if user.filters.denied_login_methods.contains(&method) {
        return Err(Error::Unauthorized(format!(
            "login method {} is not allowed for user {:?}",
            method, user.username
        )));
    }
    if validation::ip_matches_any(ip, &user.filters.denied_ip) {
        return Err(Error::Unauthorized(format!(
            "login not allowed from {} for user {:?}",
            ip, user.username
        )));
    }
    if !user.filters.allowed_ip.is_empty()
        && !validation::ip_matches_any(ip, &user.filters.allowed_ip)
    {
        return Err(Error::Unauthorized(format!(
            "login not allowed from {} for user {:?}",
            ip, user.username
        )));
    }
    if user.filters.is_anonymous && !matches!(protocol, Protocol::Ssh | Protocol::Http) {
        return Err(Error::Unauthorized(format!(
            "anonymous user {:?} can only use SFTP and HTTP",
            user.username
        )));
    }
    if let Some(missing) = two_factor_required_for(user, protocol) {
        return Err(Error::TwoFactorRequired(missing.to_string()));
    }
    Ok(())
}

/// The protocol for which 2FA setup is still required, if login over
/// `protocol` must be refused until TOTP is configured for it.
pub fn two_factor_required_for(user: &User, protocol: Protocol) -> Option<Protocol> {
    if !user
        .filters
        .two_factor_required_protocols
        .contains(&protocol)
    {
        return None;
    }
    let covered = user
        .filters
        .totp_config
        .as_ref()
        .map(|c| c.covers_protocol(protocol))
        .unwrap_or(false);
    if covered {
        None
    } else {
        Some(protocol)
    }
}

/// May this user perform `verb` on `virtual_path`?
pub fn authorize_action(user: &User, verb: Permission, virtual_path: &str) -> Result<()> {
    if user.filters.is_anonymous
        && !matches!(verb, Permission::List | Permission::Download)
    {
        return Err(Error::PermissionDenied(format!(
            "anonymous user {:?} cannot {}",
            user.username, verb
        )));
    }
    let perms = user.permissions_for_path(virtual_path);
    if !perms.contains(&Permission::Any) && !perms.contains(&verb) {
        return Err(Error::PermissionDenied(format!(
            "user {:?} lacks {} on {:?}",
            user.username, verb, virtual_path
        )));
    }
    // Name-level pattern filters apply to the target's basename.
    match pattern_check(user, virtual_path) {
        PatternVerdict::Allowed => Ok(()),
        PatternVerdict::DeniedVisible | PatternVerdict::DeniedHidden => {
            Err(Error::PermissionDenied(format!(
                "access to {:?} is denied by file patterns",
                virtual_path
            )))
        }
    }
}

/// Overwriting an existing file needs both upload and overwrite.
pub fn authorize_overwrite(user: &User, virtual_path: &str) -> Result<()> {
    authorize_action(user, Permission::Upload, virtual_path)?;
    let perms = user.permissions_for_path(virtual_path);
    if !perms.contains(&Permission::Any) && !perms.contains(&Permission::Overwrite) {
        return Err(Error::PermissionDenied(format!(
            "user {:?} lacks overwrite on {:?}",
            user.username, virtual_path
        )));
    }
    Ok(())
}

/// Outcome of a file-pattern check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternVerdict {
    Allowed,
    /// Denied but still visible in listings.
    DeniedVisible,
    /// Denied and hidden from listings.
    DeniedHidden,
}

/// Check the basename of `virtual_path` against the longest-path
/// pattern filter. Directories named by an allowed-patterns filter stay
/// traversable; only leaf names are gated.
pub fn pattern_check(user: &User, virtual_path: &str) -> PatternVerdict {
    let cleaned = util::clean_path(virtual_path);
    if cleaned == "/" {
        return PatternVerdict::Allowed;
    }
    let parent = util::parent_path(&cleaned);
    let name = util::base_name(&cleaned);
    let Some(filter) = user.pattern_filter_for_path(&parent) else {
        return PatternVerdict::Allowed;
    };
    let denied_verdict = match filter.deny_policy {
        PatternDenyPolicy::Hide => PatternVerdict::DeniedHidden,
        PatternDenyPolicy::Default => PatternVerdict::DeniedVisible,
    };
    for pattern in &filter.denied_patterns {
        if glob_matches(pattern, &name) {
            return denied_verdict;
        }
    }
    if !filter.allowed_patterns.is_empty() {
        let allowed = filter
            .allowed_patterns
            .iter()
            .any(|p| glob_matches(p, &name));
        if !allowed {
            return denied_verdict;
        }
    }
    PatternVerdict::Allowed
}

fn glob_matches(pattern: &str, name: &str) -> bool {
    Glob::new(pattern)
        .map(|g| g.compile_matcher().is_match(name))
        .unwrap_or(false)
}

/// Effective bandwidth for a source address: (upload KB/s, download
/// KB/s), 0 meaning unlimited. The first matching per-source rule wins.
pub fn bandwidth_for(user: &User, ip: IpAddr) -> (i64, i64) {
    for limit in &user.filters.bandwidth_limits {
        if validation::ip_matches_any(ip, &limit.sources) {
            return (limit.upload_bandwidth, limit.download_bandwidth);
        }
    }
    (user.upload_bandwidth, user.download_bandwidth)
}

/// Remaining transfer allowance for a source address, in bytes:
/// (upload, download, total), `None` per slot meaning unlimited.
/// Values are monotone non-negative.
pub fn transfer_caps_for(user: &User, ip: IpAddr) -> TransferCaps {
    let (ul_limit, dl_limit, total_limit) = user
        .filters
        .data_transfer_limits
        .iter()
        .find(|limit| validation::ip_matches_any(ip, &limit.sources))
        .map(|limit| {
            (
                limit.upload_data_transfer,
                limit.download_data_transfer,
                limit.total_data_transfer,
            )
        })
        .unwrap_or((
            user.upload_data_transfer,
            user.download_data_transfer,
            user.total_data_transfer,
        ));
    let mib = 1024 * 1024;
    let remaining = |limit_mib: i64, used: i64| -> Option<i64> {
        if limit_mib <= 0 {
            None
        } else {
            Some((limit_mib * mib - used).max(0))
        }
    };
    TransferCaps {
        allowed_ul_bytes: remaining(ul_limit, user.used_upload_data_transfer),
        allowed_dl_bytes: remaining(dl_limit, user.used_download_data_transfer),
        allowed_total_bytes: remaining(
            total_limit,
            user.used_upload_data_transfer + user.used_download_data_transfer,
        ),
    }
}

/// Remaining data-transfer allowance; `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferCaps {
    pub allowed_ul_bytes: Option<i64>,
    pub allowed_dl_bytes: Option<i64>,
    pub allowed_total_bytes: Option<i64>,
}

impl TransferCaps {
    pub fn upload_exhausted(&self) -> bool {
        self.allowed_ul_bytes == Some(0) || self.allowed_total_bytes == Some(0)
    }

    pub fn download_exhausted(&self) -> bool {
        self.allowed_dl_bytes == Some(0) || self.allowed_total_bytes == Some(0)
    }
}

/// Would `added_files`/`added_size` fit the user's quota? Mount-level
/// caps are checked by the VFS against the mount's own bucket.
pub fn check_quota(user: &User, added_files: i32, added_size: i64) -> Result<()> {
    if user.quota_files > 0 && user.used_quota_files + added_files > user.quota_files {
        return Err(Error::QuotaExceeded(format!(
            "file quota exceeded for user {:?}",
            user.username
        )));
    }
    if user.quota_size > 0 && user.used_quota_size + added_size > user.quota_size {
        return Err(Error::QuotaExceeded(format!(
            "size quota exceeded for user {:?}",
            user.username
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mfa::UserTotpConfig;
    use crate::provider::users::{
        BandwidthLimit, DataTransferLimit, PatternsFilter,
    };
    use std::collections::HashMap;

    fn ip() -> IpAddr {
        "10.1.2.3".parse().unwrap()
    }

    fn user_with_perms(perms: &[(&str, Vec<Permission>)]) -> User {
        let mut permissions = HashMap::new();
        for (path, set) in perms {
            permissions.insert(path.to_string(), set.clone());
        }
        User {
            username: "alice".to_string(),
            status: UserStatus::Active,
            home_dir: "/srv/alice".to_string(),
            permissions,
            ..Default::default()
        }
    }

    #[test]
    fn login_denied_for_disabled_and_expired() {
        let mut user = user_with_perms(&[("/", vec![Permission::Any])]);
        user.status = UserStatus::Disabled;
        assert!(authorize_login(&user, Protocol::Http, LoginMethod::Password, ip(), 0).is_err());

        user.status = UserStatus::Active;
        user.expiration_date = 10;
        assert!(authorize_login(&user, Protocol::Http, LoginMethod::Password, ip(), 20).is_err());
        assert!(authorize_login(&user, Protocol::Http, LoginMethod::Password, ip(), 5).is_ok());
    }

    #[test]
    fn login_ip_lists() {
        let mut user = user_with_perms(&[("/", vec![Permission::Any])]);
        user.filters.allowed_ip = vec!["10.1.0.0/16".to_string()];
        assert!(authorize_login(&user, Protocol::Http, LoginMethod::Password, ip(), 0).is_ok());
        user.filters.denied_ip = vec!["10.1.2.3".to_string()];
        assert!(authorize_login(&user, Protocol::Http, LoginMethod::Password, ip(), 0).is_err());
    }

    #[test]
    fn login_requires_totp_for_required_protocol() {
        let mut user = user_with_perms(&[("/", vec![Permission::Any])]);
        user.filters.two_factor_required_protocols = vec![Protocol::Http];
        let err =
            authorize_login(&user, Protocol::Http, LoginMethod::Password, ip(), 0).unwrap_err();
        assert_eq!(err.kind(), "two_factor_required");

        user.filters.totp_config = Some(UserTotpConfig {
            enabled: true,
            config_name: "default".to_string(),
            secret: crate::kms::Secret::plain("x"),
            protocols: vec![Protocol::Http],
        });
        assert!(authorize_login(&user, Protocol::Http, LoginMethod::Password, ip(), 0).is_ok());
        // A different required protocol stays unsatisfied
        user.filters.two_factor_required_protocols = vec![Protocol::Ftp];
        assert!(
            authorize_login(&user, Protocol::Ftp, LoginMethod::Password, ip(), 0).is_err()
        );
    }

    #[test]
    fn action_follows_longest_prefix() {
        let user = user_with_perms(&[
            ("/", vec![Permission::Any]),
            ("/ro", vec![Permission::List, Permission::Download]),
        ]);
        assert!(authorize_action(&user, Permission::Upload, "/x").is_ok());
        assert!(authorize_action(&user, Permission::Upload, "/ro/f.txt").is_err());
        assert!(authorize_action(&user, Permission::Download, "/ro/f.txt").is_ok());
    }

    #[test]
    fn overwrite_needs_both_verbs() {
        let user = user_with_perms(&[("/", vec![Permission::Upload])]);
        assert!(authorize_overwrite(&user, "/f").is_err());
        let user = user_with_perms(&[("/", vec![Permission::Upload, Permission::Overwrite])]);
        assert!(authorize_overwrite(&user, "/f").is_ok());
    }

    #[test]
    fn pattern_policy_hide_vs_default() {
        let mut user = user_with_perms(&[("/", vec![Permission::Any])]);
        user.filters.file_patterns = vec![PatternsFilter {
            path: "/".to_string(),
            denied_patterns: vec!["*.exe".to_string()],
            deny_policy: PatternDenyPolicy::Hide,
            ..Default::default()
        }];
        assert_eq!(pattern_check(&user, "/tool.exe"), PatternVerdict::DeniedHidden);
        user.filters.file_patterns[0].deny_policy = PatternDenyPolicy::Default;
        assert_eq!(pattern_check(&user, "/tool.exe"), PatternVerdict::DeniedVisible);
        assert_eq!(pattern_check(&user, "/tool.txt"), PatternVerdict::Allowed);
    }

    #[test]
    fn allowed_patterns_gate_names() {
        let mut user = user_with_perms(&[("/", vec![Permission::Any])]);
        user.filters.file_patterns = vec![PatternsFilter {
            path: "/in".to_string(),
            allowed_patterns: vec!["*.pdf".to_string()],
            ..Default::default()
        }];
        assert_eq!(pattern_check(&user, "/in/doc.pdf"), PatternVerdict::Allowed);
        assert_eq!(
            pattern_check(&user, "/in/doc.docx"),
            PatternVerdict::DeniedVisible
        );
        // Denied wins over allowed
        user.filters.file_patterns[0].denied_patterns = vec!["secret*".to_string()];
        assert_eq!(
            pattern_check(&user, "/in/secret.pdf"),
            PatternVerdict::DeniedVisible
        );
    }

    #[test]
    fn bandwidth_first_matching_source_wins() {
        let mut user = user_with_perms(&[("/", vec![Permission::Any])]);
        user.upload_bandwidth = 100;
        user.download_bandwidth = 200;
        user.filters.bandwidth_limits = vec![
            BandwidthLimit {
                sources: vec!["10.1.0.0/16".to_string()],
                upload_bandwidth: 10,
                download_bandwidth: 20,
            },
            BandwidthLimit {
                sources: vec!["10.0.0.0/8".to_string()],
                upload_bandwidth: 1,
                download_bandwidth: 2,
            },
        ];
        assert_eq!(bandwidth_for(&user, ip()), (10, 20));
        assert_eq!(
            bandwidth_for(&user, "192.168.0.9".parse().unwrap()),
            (100, 200)
        );
    }

    #[test]
    fn transfer_caps_subtract_usage() {
        let mib = 1024 * 1024;
        let mut user = user_with_perms(&[("/", vec![Permission::Any])]);
        user.total_data_transfer = 10;
        user.used_upload_data_transfer = 6 * mib;
        user.used_download_data_transfer = 5 * mib;
        let caps = transfer_caps_for(&user, ip());
        assert_eq!(caps.allowed_total_bytes, Some(0));
        assert!(caps.upload_exhausted());

        user.filters.data_transfer_limits = vec![DataTransferLimit {
            sources: vec!["10.1.2.3".to_string()],
            upload_data_transfer: 8,
            ..Default::default()
        }];
        let caps = transfer_caps_for(&user, ip());
        assert_eq!(caps.allowed_ul_bytes, Some(2 * mib));
        assert_eq!(caps.allowed_total_bytes, None);
    }

    #[test]
    fn quota_boundaries() {
        let mut user = user_with_perms(&[("/", vec![Permission::Any])]);
        user.quota_files = 1;
        assert!(check_quota(&user, 1, 0).is_ok());
        user.used_quota_files = 1;
        let err = check_quota(&user, 1, 0).unwrap_err();
        assert_eq!(err.kind(), "quota_exceeded");
    }

    #[test]
    fn anonymous_restrictions() {
        let mut user = user_with_perms(&[("/", vec![Permission::Any])]);
        user.filters.is_anonymous = true;
        assert!(authorize_action(&user, Permission::Download, "/f").is_ok());
        assert!(authorize_action(&user, Permission::Upload, "/f").is_err());
        assert!(
            authorize_login(&user, Protocol::Ftp, LoginMethod::Password, ip(), 0).is_err()
        );
    }
}
