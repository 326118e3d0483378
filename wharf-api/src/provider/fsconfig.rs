//! Filesystem configuration variants
//!
//! Every user, group and virtual folder carries one of these. Credentials
//! are [`Secret`]s sealed by the KMS before the object is persisted.

use crate::kms::{Secret, SecretBox};
use serde::{Deserialize, Serialize};
use wharf_common::{Error, Result};

/// Tagged union over the supported storage backends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum FilesystemConfig {
    Local(LocalFsConfig),
    S3(S3FsConfig),
    Gcs(GcsFsConfig),
    AzBlob(AzBlobFsConfig),
    Crypt(CryptFsConfig),
    Sftp(SftpFsConfig),
    Http(HttpFsConfig),
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        FilesystemConfig::Local(LocalFsConfig::default())
    }
}

impl FilesystemConfig {
    pub fn provider_name(&self) -> &'static str {
        match self {
            FilesystemConfig::Local(_) => "local",
            FilesystemConfig::S3(_) => "s3",
            FilesystemConfig::Gcs(_) => "gcs",
            FilesystemConfig::AzBlob(_) => "azblob",
            FilesystemConfig::Crypt(_) => "crypt",
            FilesystemConfig::Sftp(_) => "sftp",
            FilesystemConfig::Http(_) => "http",
        }
    }

    /// Validate the variant and seal any plain credentials.
    ///
    /// `additional_data` binds the ciphertexts to the owning object.
    pub fn validate_and_seal(&mut self, kms: &SecretBox, additional_data: &str) -> Result<()> {
        match self {
            FilesystemConfig::Local(_) => Ok(()),
            FilesystemConfig::S3(c) => c.validate_and_seal(kms, additional_data),
            FilesystemConfig::Gcs(c) => c.validate_and_seal(kms, additional_data),
            FilesystemConfig::AzBlob(c) => c.validate_and_seal(kms, additional_data),
            FilesystemConfig::Crypt(c) => c.validate_and_seal(kms, additional_data),
            FilesystemConfig::Sftp(c) => c.validate_and_seal(kms, additional_data),
            FilesystemConfig::Http(c) => c.validate_and_seal(kms, additional_data),
        }
    }

    /// Carry forward stored ciphertexts for secrets the caller redacted.
    pub fn preserve_redacted(&mut self, previous: &FilesystemConfig) {
        fn keep(current: &mut Secret, prev: &Secret) {
            if current.is_redacted() {
                *current = prev.clone();
            }
        }
        match (self, previous) {
            (FilesystemConfig::S3(c), FilesystemConfig::S3(p)) => {
                keep(&mut c.access_secret, &p.access_secret);
            }
            (FilesystemConfig::Gcs(c), FilesystemConfig::Gcs(p)) => {
                keep(&mut c.credentials, &p.credentials);
            }
            (FilesystemConfig::AzBlob(c), FilesystemConfig::AzBlob(p)) => {
                keep(&mut c.account_key, &p.account_key);
                keep(&mut c.sas_url, &p.sas_url);
            }
            (FilesystemConfig::Crypt(c), FilesystemConfig::Crypt(p)) => {
                keep(&mut c.passphrase, &p.passphrase);
                c.wrapped.preserve_redacted(&p.wrapped);
            }
            (FilesystemConfig::Sftp(c), FilesystemConfig::Sftp(p)) => {
                keep(&mut c.password, &p.password);
                keep(&mut c.private_key, &p.private_key);
                keep(&mut c.key_passphrase, &p.key_passphrase);
            }
            (FilesystemConfig::Http(c), FilesystemConfig::Http(p)) => {
                keep(&mut c.password, &p.password);
                keep(&mut c.api_key, &p.api_key);
            }
            _ => {}
        }
    }

    /// Redact every secret for API responses.
    pub fn redact(&mut self) {
        match self {
            FilesystemConfig::Local(_) => {}
            FilesystemConfig::S3(c) => c.access_secret.redact(),
            FilesystemConfig::Gcs(c) => c.credentials.redact(),
            FilesystemConfig::AzBlob(c) => {
                c.account_key.redact();
                c.sas_url.redact();
            }
            FilesystemConfig::Crypt(c) => {
                c.passphrase.redact();
                c.wrapped.redact();
            }
            FilesystemConfig::Sftp(c) => {
                c.password.redact();
                c.private_key.redact();
                c.key_passphrase.redact();
            }
            FilesystemConfig::Http(c) => {
                c.password.redact();
                c.api_key.redact();
            }
        }
    }

    /// Apply `%username%` substitution to prefix-like fields.
    pub fn replace_placeholders(&mut self, username: &str) {
        fn sub(s: &mut String, username: &str) {
            if s.contains("%username%") {
                *s = s.replace("%username%", username);
            }
        }
        match self {
            FilesystemConfig::Local(_) => {}
            FilesystemConfig::S3(c) => sub(&mut c.key_prefix, username),
            FilesystemConfig::Gcs(c) => sub(&mut c.key_prefix, username),
            FilesystemConfig::AzBlob(c) => sub(&mut c.key_prefix, username),
            FilesystemConfig::Crypt(c) => c.wrapped.replace_placeholders(username),
            FilesystemConfig::Sftp(c) => sub(&mut c.prefix, username),
            FilesystemConfig::Http(c) => sub(&mut c.endpoint, username),
        }
    }
}

fn require_non_empty(value: &str, field: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Validation(format!("field \"{}\" is required", field)));
    }
    Ok(())
}

fn seal_if_plain(kms: &SecretBox, secret: &mut Secret, aad: &str) -> Result<()> {
    if secret.is_redacted() {
        // Retained ciphertext must have been resolved by preserve_redacted
        // before validation; a surviving redacted value is a caller bug.
        return Err(Error::Validation(
            "a required secret is redacted".to_string(),
        ));
    }
    kms.encrypt(secret, aad)
}

/// Local disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LocalFsConfig {
    /// Read buffer size in MB, 0 means default.
    #[serde(default)]
    pub read_buffer_size: usize,
    /// Write buffer size in MB, 0 means default.
    #[serde(default)]
    pub write_buffer_size: usize,
}

/// S3-compatible object storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct S3FsConfig {
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub access_secret: Secret,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub key_prefix: String,
    /// Multipart part size in MB, 0 means default (5).
    #[serde(default)]
    pub upload_part_size: u64,
    /// Concurrent multipart uploads, 0 means default (2).
    #[serde(default)]
    pub upload_concurrency: usize,
    #[serde(default)]
    pub force_path_style: bool,
}

impl S3FsConfig {
    fn validate_and_seal(&mut self, kms: &SecretBox, aad: &str) -> Result<()> {
        require_non_empty(&self.bucket, "bucket")?;
        validate_key_prefix(&self.key_prefix)?;
        seal_if_plain(kms, &mut self.access_secret, aad)
    }
}

/// Google Cloud Storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GcsFsConfig {
    pub bucket: String,
    /// Service account JSON, sealed at rest.
    #[serde(default)]
    pub credentials: Secret,
    /// Use workload/VM default credentials instead of a key.
    #[serde(default)]
    pub automatic_credentials: bool,
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default)]
    pub storage_class: String,
}

impl GcsFsConfig {
    fn validate_and_seal(&mut self, kms: &SecretBox, aad: &str) -> Result<()> {
        require_non_empty(&self.bucket, "bucket")?;
        validate_key_prefix(&self.key_prefix)?;
        if !self.automatic_credentials && self.credentials.is_empty() {
            return Err(Error::Validation(
                "field \"credentials\" is required".to_string(),
            ));
        }
        seal_if_plain(kms, &mut self.credentials, aad)
    }
}

/// Azure Blob Storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AzBlobFsConfig {
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub account_name: String,
    #[serde(default)]
    pub account_key: Secret,
    /// Shared access signature URL, alternative to account credentials.
    #[serde(default)]
    pub sas_url: Secret,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default)]
    pub upload_part_size: u64,
    #[serde(default)]
    pub upload_concurrency: usize,
    #[serde(default)]
    pub use_emulator: bool,
}

impl AzBlobFsConfig {
    fn validate_and_seal(&mut self, kms: &SecretBox, aad: &str) -> Result<()> {
        if self.sas_url.is_empty() {
            require_non_empty(&self.container, "container")?;
            require_non_empty(&self.account_name, "account_name")?;
        }
        validate_key_prefix(&self.key_prefix)?;
        seal_if_plain(kms, &mut self.account_key, aad)?;
        seal_if_plain(kms, &mut self.sas_url, aad)
    }
}

/// Transparent encryption overlay over another backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CryptFsConfig {
    pub passphrase: Secret,
    /// The wrapped backend holding the ciphertext objects.
    #[serde(default)]
    pub wrapped: Box<FilesystemConfig>,
}

impl CryptFsConfig {
    fn validate_and_seal(&mut self, kms: &SecretBox, aad: &str) -> Result<()> {
        if self.passphrase.is_empty() {
            return Err(Error::Validation(
                "field \"passphrase\" is required".to_string(),
            ));
        }
        if matches!(*self.wrapped, FilesystemConfig::Crypt(_)) {
            return Err(Error::Validation(
                "crypt filesystems cannot be nested".to_string(),
            ));
        }
        seal_if_plain(kms, &mut self.passphrase, aad)?;
        self.wrapped.validate_and_seal(kms, aad)
    }
}

/// How the SFTP backend decides two accounts point at the same server,
/// for cross-account loop detection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SftpEqualityCheck {
    /// Compare endpoint and username.
    #[default]
    Full,
    /// Compare endpoint only.
    EndpointOnly,
}

/// SFTP sub-account backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SftpFsConfig {
    pub endpoint: String,
    pub username: String,
    #[serde(default)]
    pub password: Secret,
    #[serde(default)]
    pub private_key: Secret,
    #[serde(default)]
    pub key_passphrase: Secret,
    /// Remote directory restriction, must be absolute when set.
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub fingerprints: Vec<String>,
    /// Read/write buffer size in MB, 0 means unbuffered.
    #[serde(default)]
    pub buffer_size: u64,
    /// Disable the two-reader concurrency the protocol otherwise allows.
    #[serde(default)]
    pub disable_concurrent_reads: bool,
    #[serde(default)]
    pub equality_check_mode: SftpEqualityCheck,
}

impl SftpFsConfig {
    fn validate_and_seal(&mut self, kms: &SecretBox, aad: &str) -> Result<()> {
        require_non_empty(&self.endpoint, "endpoint")?;
        require_non_empty(&self.username, "username")?;
        if self.password.is_empty() && self.private_key.is_empty() {
            return Err(Error::Validation(
                "either a password or a private key is required".to_string(),
            ));
        }
        if !self.prefix.is_empty() && !self.prefix.starts_with('/') {
            return Err(Error::Validation(
                "field \"prefix\" must be an absolute path".to_string(),
            ));
        }
        seal_if_plain(kms, &mut self.password, aad)?;
        seal_if_plain(kms, &mut self.private_key, aad)?;
        seal_if_plain(kms, &mut self.key_passphrase, aad)
    }

    /// True when both configs point at the same remote account.
    pub fn is_same_resource(&self, other: &SftpFsConfig) -> bool {
        if self.endpoint != other.endpoint {
            return false;
        }
        match self.equality_check_mode {
            SftpEqualityCheck::Full => self.username == other.username,
            SftpEqualityCheck::EndpointOnly => true,
        }
    }
}

/// Read-only HTTP filesystem exposing a remote object API.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HttpFsConfig {
    pub endpoint: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Secret,
    #[serde(default)]
    pub api_key: Secret,
    #[serde(default)]
    pub skip_tls_verify: bool,
}

impl HttpFsConfig {
    fn validate_and_seal(&mut self, kms: &SecretBox, aad: &str) -> Result<()> {
        require_non_empty(&self.endpoint, "endpoint")?;
        url::Url::parse(&self.endpoint)
            .map_err(|_| Error::Validation("field \"endpoint\" is not a valid URL".to_string()))?;
        seal_if_plain(kms, &mut self.password, aad)?;
        seal_if_plain(kms, &mut self.api_key, aad)
    }
}

fn validate_key_prefix(prefix: &str) -> Result<()> {
    if prefix.starts_with('/') {
        return Err(Error::Validation(
            "field \"key_prefix\" cannot start with \"/\"".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::KmsConfig;

    fn kms() -> SecretBox {
        SecretBox::new(&KmsConfig {
            master_key: hex::encode([1u8; 32]),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn s3_seal_and_redact() {
        let kms = kms();
        let mut fs = FilesystemConfig::S3(S3FsConfig {
            bucket: "b".to_string(),
            access_key: "ak".to_string(),
            access_secret: Secret::plain("sk"),
            ..Default::default()
        });
        fs.validate_and_seal(&kms, "user1").unwrap();
        if let FilesystemConfig::S3(c) = &fs {
            assert!(c.access_secret.is_encrypted());
        } else {
            panic!("variant changed");
        }
        fs.redact();
        if let FilesystemConfig::S3(c) = &fs {
            assert!(c.access_secret.is_redacted());
        }
    }

    #[test]
    fn crypt_cannot_nest() {
        let kms = kms();
        let mut fs = FilesystemConfig::Crypt(CryptFsConfig {
            passphrase: Secret::plain("p"),
            wrapped: Box::new(FilesystemConfig::Crypt(CryptFsConfig {
                passphrase: Secret::plain("q"),
                wrapped: Box::default(),
            })),
        });
        assert!(fs.validate_and_seal(&kms, "u").is_err());
    }

    #[test]
    fn redacted_without_previous_is_rejected() {
        let kms = kms();
        let mut secret = Secret::plain("x");
        kms.encrypt(&mut secret, "u").unwrap();
        secret.redact();
        let mut fs = FilesystemConfig::S3(S3FsConfig {
            bucket: "b".to_string(),
            access_secret: secret,
            ..Default::default()
        });
        assert!(fs.validate_and_seal(&kms, "u").is_err());
    }

    #[test]
    fn preserve_redacted_keeps_previous_ciphertext() {
        let kms = kms();
        let mut prev = FilesystemConfig::S3(S3FsConfig {
            bucket: "b".to_string(),
            access_secret: Secret::plain("orig"),
            ..Default::default()
        });
        prev.validate_and_seal(&kms, "u").unwrap();

        let mut next = prev.clone();
        next.redact();
        next.preserve_redacted(&prev);
        next.validate_and_seal(&kms, "u").unwrap();
        if let (FilesystemConfig::S3(n), FilesystemConfig::S3(p)) = (&next, &prev) {
            assert_eq!(n.access_secret, p.access_secret);
        }
    }

    #[test]
    fn placeholder_substitution() {
        let mut fs = FilesystemConfig::S3(S3FsConfig {
            bucket: "b".to_string(),
            key_prefix: "home/%username%/".to_string(),
            ..Default::default()
        });
        fs.replace_placeholders("alice");
        if let FilesystemConfig::S3(c) = &fs {
            assert_eq!(c.key_prefix, "home/alice/");
        }
    }

    #[test]
    fn serde_tag_roundtrip() {
        let fs = FilesystemConfig::Sftp(SftpFsConfig {
            endpoint: "sftp.example.com:22".to_string(),
            username: "u".to_string(),
            password: Secret::plain("p"),
            ..Default::default()
        });
        let json = serde_json::to_string(&fs).unwrap();
        assert!(json.contains("\"provider\":\"sftp\""));
        let back: FilesystemConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fs);
    }
}
