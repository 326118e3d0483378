//! Input validation helpers
//!
//! Field-level checks shared by the provider and the HTTP layer.

use ipnetwork::IpNetwork;
use regex::Regex;
use std::net::IpAddr;
use std::sync::LazyLock;
use wharf_common::{Error, Result};

pub const MAX_OBJECT_NAME_LENGTH: usize = 255;
pub const MIN_PASSWORD_LENGTH: usize = 1;
pub const MAX_PASSWORD_LENGTH: usize = 128;

static OBJECT_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9\-_.@]*$").unwrap());

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$").unwrap()
});

/// Usernames and other object names: alphanumeric plus `-_.@`, no
/// leading separator.
pub fn is_valid_object_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_OBJECT_NAME_LENGTH && OBJECT_NAME_REGEX.is_match(name)
}

/// RFC-5322-shaped address check; intentionally stricter than the RFC's
/// quoted forms.
pub fn is_valid_email(email: &str) -> bool {
    email.len() <= 320 && EMAIL_REGEX.is_match(email)
}

/// Parse an entry of an IP filter list: a bare address or a CIDR range.
pub fn parse_ip_or_cidr(value: &str) -> Result<IpNetwork> {
    if let Ok(addr) = value.parse::<IpAddr>() {
        return IpNetwork::new(addr, single_host_prefix(&addr))
            .map_err(|e| Error::Validation(format!("invalid IP {:?}: {}", value, e)));
    }
    value
        .parse::<IpNetwork>()
        .map_err(|_| Error::Validation(format!("invalid IP/CIDR {:?}", value)))
}

fn single_host_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// True when `ip` is inside any of the given IP/CIDR entries.
/// Unparseable entries never match.
pub fn ip_matches_any(ip: IpAddr, entries: &[String]) -> bool {
    entries.iter().any(|entry| {
        parse_ip_or_cidr(entry)
            .map(|network| network.contains(ip))
            .unwrap_or(false)
    })
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.len() < MIN_PASSWORD_LENGTH {
        return Err(Error::Validation(
            "field \"password\" is required".to_string(),
        ));
    }
    if password.len() > MAX_PASSWORD_LENGTH {
        return Err(Error::Validation(format!(
            "field \"password\" too long (max {} characters)",
            MAX_PASSWORD_LENGTH
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names() {
        assert!(is_valid_object_name("alice"));
        assert!(is_valid_object_name("a.b-c_d@example"));
        assert!(!is_valid_object_name(""));
        assert!(!is_valid_object_name(".leading"));
        assert!(!is_valid_object_name("has space"));
        assert!(!is_valid_object_name("has/slash"));
    }

    #[test]
    fn emails() {
        assert!(is_valid_email("user@example.com"));
        assert!(is_valid_email("a+b@sub.example.co"));
        assert!(!is_valid_email("nodomain@"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("user@nodot"));
    }

    #[test]
    fn ip_and_cidr_matching() {
        assert!(parse_ip_or_cidr("10.0.0.1").is_ok());
        assert!(parse_ip_or_cidr("10.0.0.0/8").is_ok());
        assert!(parse_ip_or_cidr("::1").is_ok());
        assert!(parse_ip_or_cidr("not-an-ip").is_err());

        let entries = vec!["192.168.1.0/24".to_string(), "10.0.0.5".to_string()];
        assert!(ip_matches_any("192.168.1.77".parse().unwrap(), &entries));
        assert!(ip_matches_any("10.0.0.5".parse().unwrap(), &entries));
        assert!(!ip_matches_any("10.0.0.6".parse().unwrap(), &entries));
    }
}
