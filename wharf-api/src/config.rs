//! Configuration
//!
//! Settings load in three layers: built-in defaults, then a TOML file,
//! then environment overrides of shape `SFTPGO_<SECTION>__<SUB>__<FIELD>`
//! (the double underscore is the path separator). The env mapping is an
//! explicit enumeration: every recognized key appears below, nothing is
//! discovered at runtime.

use crate::kms::KmsConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use wharf_common::{Error, Result};

const ENV_PREFIX: &str = "SFTPGO_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub common: CommonConfig,
    pub data_provider: DataProviderConfig,
    pub kms: KmsConfig,
    pub httpd: HttpdConfig,
    pub mfa: MfaConfig,
    pub smtp: SmtpConfig,
    pub defender: DefenderConfig,
}

/// Settings shared by every protocol front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    /// Global cap on concurrent sessions; 0 disables the cap.
    pub max_total_connections: usize,
    /// Per-connection idle deadline in minutes; 0 disables.
    pub idle_timeout_mins: u64,
    /// Seconds to wait for transfers to drain on close.
    pub close_timeout_secs: u64,
    /// Optional allow-list file of IP/CIDR entries, hot-reloadable.
    pub whitelist_file: String,
    /// Seconds between persisted updates of active transfer rows.
    pub transfer_update_interval_secs: u64,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            max_total_connections: 0,
            idle_timeout_mins: 15,
            close_timeout_secs: 30,
            whitelist_file: String::new(),
            transfer_update_interval_secs: 10,
        }
    }
}

/// Data provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataProviderConfig {
    /// SQLite database path; `:memory:` for tests.
    pub name: String,
    pub pool_size: u32,
    /// Seconds composed users stay cached; 0 disables the cache.
    pub user_cache_ttl_secs: u64,
    pub default_admin_username: String,
    pub default_admin_password: String,
    /// Upgrade legacy bcrypt hashes to argon2id on successful login.
    pub rehash_legacy_passwords: bool,
}

impl Default for DataProviderConfig {
    fn default() -> Self {
        Self {
            name: "wharf.db".to_string(),
            pool_size: 16,
            user_cache_ttl_secs: 60,
            default_admin_username: "admin".to_string(),
            default_admin_password: "password".to_string(),
            rehash_legacy_passwords: true,
        }
    }
}

/// HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpdConfig {
    pub bind_address: String,
    pub bind_port: u16,
    /// Minutes an API access token stays valid.
    pub api_token_ttl_mins: i64,
    /// Minutes a web session token stays valid.
    pub web_token_ttl_mins: i64,
}

impl Default for HttpdConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 8080,
            api_token_ttl_mins: 20,
            web_token_ttl_mins: 720,
        }
    }
}

/// MFA settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MfaConfig {
    /// Issuer embedded in otpauth provisioning URLs.
    pub totp_issuer: String,
}

impl Default for MfaConfig {
    fn default() -> Self {
        Self {
            totp_issuer: "wharf".to_string(),
        }
    }
}

/// SMTP transport for email actions and out-of-band codes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    /// Max total attachment size in bytes for email actions.
    pub max_attachment_size: i64,
}

impl SmtpConfig {
    pub fn is_enabled(&self) -> bool {
        !self.host.is_empty()
    }
}

/// Brute-force defender settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefenderConfig {
    pub enabled: bool,
    /// `memory` or `provider`.
    pub driver: String,
    /// Score at which a host is banned.
    pub threshold: i32,
    /// Weight of an event recorded while already at the limit.
    pub score_limit_exceeded: i32,
    /// Minutes an event stays in the observation window.
    pub observation_time_mins: i64,
    /// Minutes of the initial ban.
    pub ban_time_mins: i64,
    /// Percent added to the remaining ban on repeat offenses.
    pub ban_time_increment: i64,
}

impl Default for DefenderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            driver: "memory".to_string(),
            threshold: 15,
            score_limit_exceeded: 3,
            observation_time_mins: 30,
            ban_time_mins: 30,
            ban_time_increment: 50,
        }
    }
}

impl Config {
    /// Load defaults, merge the optional TOML file, then apply env
    /// overrides. A malformed file or override is a misconfiguration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::Validation(format!("unable to read config {:?}: {}", path, e))
                })?;
                toml::from_str(&raw).map_err(|e| {
                    Error::Validation(format!("invalid config {:?}: {}", path, e))
                })?
            }
            _ => Config::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.data_provider.name.is_empty() {
            return Err(Error::Validation(
                "data_provider.name cannot be empty".to_string(),
            ));
        }
        if self.defender.enabled
            && self.defender.driver != "memory"
            && self.defender.driver != "provider"
        {
            return Err(Error::Validation(format!(
                "unknown defender driver {:?}",
                self.defender.driver
            )));
        }
        if self.defender.threshold <= 0 {
            return Err(Error::Validation(
                "defender.threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        set_usize("COMMON__MAX_TOTAL_CONNECTIONS", &mut self.common.max_total_connections)?;
        set_u64("COMMON__IDLE_TIMEOUT_MINS", &mut self.common.idle_timeout_mins)?;
        set_u64("COMMON__CLOSE_TIMEOUT_SECS", &mut self.common.close_timeout_secs)?;
        set_string("COMMON__WHITELIST_FILE", &mut self.common.whitelist_file);
        set_u64(
            "COMMON__TRANSFER_UPDATE_INTERVAL_SECS",
            &mut self.common.transfer_update_interval_secs,
        )?;

        set_string("DATA_PROVIDER__NAME", &mut self.data_provider.name);
        set_u32("DATA_PROVIDER__POOL_SIZE", &mut self.data_provider.pool_size)?;
        set_u64(
            "DATA_PROVIDER__USER_CACHE_TTL_SECS",
            &mut self.data_provider.user_cache_ttl_secs,
        )?;
        set_string(
            "DATA_PROVIDER__DEFAULT_ADMIN_USERNAME",
            &mut self.data_provider.default_admin_username,
        );
        set_string(
            "DATA_PROVIDER__DEFAULT_ADMIN_PASSWORD",
            &mut self.data_provider.default_admin_password,
        );
        set_bool(
            "DATA_PROVIDER__REHASH_LEGACY_PASSWORDS",
            &mut self.data_provider.rehash_legacy_passwords,
        )?;

        set_string("KMS__MASTER_KEY", &mut self.kms.master_key);
        set_string("KMS__MASTER_KEY_PATH", &mut self.kms.master_key_path);

        set_string("HTTPD__BIND_ADDRESS", &mut self.httpd.bind_address);
        set_u16("HTTPD__BIND_PORT", &mut self.httpd.bind_port)?;
        set_i64("HTTPD__API_TOKEN_TTL_MINS", &mut self.httpd.api_token_ttl_mins)?;
        set_i64("HTTPD__WEB_TOKEN_TTL_MINS", &mut self.httpd.web_token_ttl_mins)?;

        set_string("MFA__TOTP_ISSUER", &mut self.mfa.totp_issuer);

        set_string("SMTP__HOST", &mut self.smtp.host);
        set_u16("SMTP__PORT", &mut self.smtp.port)?;
        set_string("SMTP__USERNAME", &mut self.smtp.username);
        set_string("SMTP__PASSWORD", &mut self.smtp.password);
        set_string("SMTP__FROM", &mut self.smtp.from);
        set_i64("SMTP__MAX_ATTACHMENT_SIZE", &mut self.smtp.max_attachment_size)?;

        set_bool("DEFENDER__ENABLED", &mut self.defender.enabled)?;
        set_string("DEFENDER__DRIVER", &mut self.defender.driver);
        set_i32("DEFENDER__THRESHOLD", &mut self.defender.threshold)?;
        set_i32(
            "DEFENDER__SCORE_LIMIT_EXCEEDED",
            &mut self.defender.score_limit_exceeded,
        )?;
        set_i64(
            "DEFENDER__OBSERVATION_TIME_MINS",
            &mut self.defender.observation_time_mins,
        )?;
        set_i64("DEFENDER__BAN_TIME_MINS", &mut self.defender.ban_time_mins)?;
        set_i64(
            "DEFENDER__BAN_TIME_INCREMENT",
            &mut self.defender.ban_time_increment,
        )?;
        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, key)).ok()
}

fn set_string(key: &str, target: &mut String) {
    if let Some(value) = env_value(key) {
        *target = value;
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        Error::Validation(format!(
            "invalid value {:?} for {}{}",
            value, ENV_PREFIX, key
        ))
    })
}

macro_rules! env_setter {
    ($name:ident, $ty:ty) => {
        fn $name(key: &str, target: &mut $ty) -> Result<()> {
            if let Some(value) = env_value(key) {
                *target = parse_env(key, &value)?;
            }
            Ok(())
        }
    };
}

env_setter!(set_usize, usize);
env_setter!(set_u64, u64);
env_setter!(set_u32, u32);
env_setter!(set_u16, u16);
env_setter!(set_i64, i64);
env_setter!(set_i32, i32);

fn set_bool(key: &str, target: &mut bool) -> Result<()> {
    if let Some(value) = env_value(key) {
        *target = match value.as_str() {
            "1" | "true" | "TRUE" | "True" => true,
            "0" | "false" | "FALSE" | "False" => false,
            other => {
                return Err(Error::Validation(format!(
                    "invalid boolean {:?} for {}{}",
                    other, ENV_PREFIX, key
                )))
            }
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.httpd.bind_port, 8080);
        assert_eq!(config.defender.driver, "memory");
        assert!(config.data_provider.rehash_legacy_passwords);
    }

    #[test]
    fn toml_merges_over_defaults() {
        let raw = r#"
            [httpd]
            bind_port = 9999

            [defender]
            enabled = true
            threshold = 3
        "#;
        let mut config: Config = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.httpd.bind_port, 9999);
        assert!(config.defender.enabled);
        assert_eq!(config.defender.threshold, 3);
        // untouched sections keep defaults
        assert_eq!(config.common.close_timeout_secs, 30);
    }

    // One test covers both env cases: the process environment is
    // shared, parallel tests would race on it.
    #[test]
    fn env_overrides() {
        std::env::set_var("SFTPGO_HTTPD__BIND_PORT", "7777");
        let mut config = Config::default();
        config.apply_env_overrides().unwrap();
        std::env::remove_var("SFTPGO_HTTPD__BIND_PORT");
        assert_eq!(config.httpd.bind_port, 7777);

        std::env::set_var("SFTPGO_COMMON__IDLE_TIMEOUT_MINS", "soon");
        let mut config = Config::default();
        let res = config.apply_env_overrides();
        std::env::remove_var("SFTPGO_COMMON__IDLE_TIMEOUT_MINS");
        assert!(res.is_err());
    }
}
