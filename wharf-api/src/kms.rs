//! Secrets at rest
//!
//! Credentials embedded in user and folder configurations are sealed with
//! AES-256-GCM under a process-wide master key. The additional data binds
//! each ciphertext to its owning object, so a payload copied between
//! records fails to decrypt.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use wharf_common::{Error, Result, REDACTED_SECRET};

/// AES-256-GCM key size in bytes
const KEY_SIZE: usize = 32;
/// Nonce size for AES-256-GCM
const NONCE_SIZE: usize = 12;

/// Lifecycle state of a stored secret.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SecretStatus {
    /// Cleartext supplied by a caller, not yet sealed.
    Plain,
    /// Sealed payload, safe to persist.
    #[serde(rename = "AES-256-GCM")]
    Encrypted,
    /// Placeholder emitted on read; on write it means "keep stored value".
    Redacted,
    /// No secret set.
    Empty,
}

/// A secret value with its encryption state.
///
/// The API never returns ciphertext or cleartext: reads yield the
/// `[**redacted**]` sentinel, and accepting that sentinel on write retains
/// the previously stored payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Secret {
    pub status: SecretStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub payload: String,
}

impl Default for Secret {
    fn default() -> Self {
        Secret {
            status: SecretStatus::Empty,
            payload: String::new(),
        }
    }
}

impl Secret {
    pub fn plain(value: impl Into<String>) -> Self {
        let payload = value.into();
        if payload.is_empty() {
            return Secret::default();
        }
        Secret {
            status: SecretStatus::Plain,
            payload,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.status, SecretStatus::Empty)
    }

    pub fn is_plain(&self) -> bool {
        matches!(self.status, SecretStatus::Plain)
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.status, SecretStatus::Encrypted)
    }

    pub fn is_redacted(&self) -> bool {
        matches!(self.status, SecretStatus::Redacted)
    }

    /// The cleartext of a plain secret.
    pub fn plaintext(&self) -> Result<&str> {
        if self.is_plain() {
            Ok(&self.payload)
        } else {
            Err(Error::Validation(
                "secret is not in plain state".to_string(),
            ))
        }
    }

    /// Replace the payload with the redaction sentinel for API responses.
    pub fn redact(&mut self) {
        if self.is_encrypted() || self.is_plain() {
            self.status = SecretStatus::Redacted;
            self.payload = REDACTED_SECRET.to_string();
        }
    }

    /// A redacted copy, suitable for serialization.
    pub fn redacted(&self) -> Secret {
        let mut c = self.clone();
        c.redact();
        c
    }
}

/// Where the master key comes from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KmsConfig {
    /// Hex-encoded master key. Takes precedence over `master_key_path`.
    #[serde(default)]
    pub master_key: String,
    /// Path to a file holding the hex-encoded master key.
    #[serde(default)]
    pub master_key_path: String,
}

/// Seals and opens [`Secret`] payloads under the configured master key.
pub struct SecretBox {
    key: [u8; KEY_SIZE],
}

impl SecretBox {
    /// Initialize from configuration. With no key configured a random
    /// per-process key is generated: secrets survive only until restart,
    /// which is acceptable for throwaway instances and tests.
    pub fn new(config: &KmsConfig) -> Result<Self> {
        let key = if !config.master_key.is_empty() {
            Self::decode_hex_key(&config.master_key)?
        } else if !config.master_key_path.is_empty() {
            let contents = std::fs::read_to_string(&config.master_key_path).map_err(|e| {
                Error::Internal(format!(
                    "unable to read master key file {:?}: {}",
                    config.master_key_path, e
                ))
            })?;
            Self::decode_hex_key(contents.trim())?
        } else {
            let mut key = [0u8; KEY_SIZE];
            rand::thread_rng().fill_bytes(&mut key);
            tracing::warn!("no KMS master key configured, using an ephemeral per-process key");
            key
        };
        Ok(Self { key })
    }

    fn decode_hex_key(hex_key: &str) -> Result<[u8; KEY_SIZE]> {
        let bytes = hex::decode(hex_key)
            .map_err(|e| Error::Validation(format!("invalid master key encoding: {}", e)))?;
        if bytes.len() != KEY_SIZE {
            return Err(Error::Validation(format!(
                "master key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        Ok(key)
    }

    /// Seal a plain secret in place. `additional_data` must identify the
    /// owning object (e.g. username) and be supplied again on decrypt.
    pub fn encrypt(&self, secret: &mut Secret, additional_data: &str) -> Result<()> {
        match secret.status {
            SecretStatus::Empty | SecretStatus::Encrypted => Ok(()),
            SecretStatus::Redacted => Err(Error::Validation(
                "cannot encrypt a redacted secret".to_string(),
            )),
            SecretStatus::Plain => {
                let cipher = Aes256Gcm::new_from_slice(&self.key)
                    .map_err(|e| Error::Internal(format!("cipher init failed: {}", e)))?;
                let mut nonce_bytes = [0u8; NONCE_SIZE];
                rand::thread_rng().fill_bytes(&mut nonce_bytes);
                let nonce = Nonce::from_slice(&nonce_bytes);
                let ciphertext = cipher
                    .encrypt(
                        nonce,
                        Payload {
                            msg: secret.payload.as_bytes(),
                            aad: additional_data.as_bytes(),
                        },
                    )
                    .map_err(|e| Error::Internal(format!("encryption failed: {}", e)))?;
                let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
                out.extend_from_slice(&nonce_bytes);
                out.extend_from_slice(&ciphertext);
                secret.payload = base64::engine::general_purpose::STANDARD.encode(out);
                secret.status = SecretStatus::Encrypted;
                Ok(())
            }
        }
    }

    /// Open a sealed secret and return its cleartext.
    pub fn decrypt(&self, secret: &Secret, additional_data: &str) -> Result<String> {
        match secret.status {
            SecretStatus::Plain => Ok(secret.payload.clone()),
            SecretStatus::Empty => Ok(String::new()),
            SecretStatus::Redacted => Err(Error::Validation(
                "cannot decrypt a redacted secret".to_string(),
            )),
            SecretStatus::Encrypted => {
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(&secret.payload)
                    .map_err(|e| {
                        Error::CryptoIntegrityError(format!("invalid secret payload: {}", e))
                    })?;
                if raw.len() <= NONCE_SIZE {
                    return Err(Error::CryptoIntegrityError(
                        "secret payload too short".to_string(),
                    ));
                }
                let (nonce_bytes, ciphertext) = raw.split_at(NONCE_SIZE);
                let cipher = Aes256Gcm::new_from_slice(&self.key)
                    .map_err(|e| Error::Internal(format!("cipher init failed: {}", e)))?;
                let plaintext = cipher
                    .decrypt(
                        Nonce::from_slice(nonce_bytes),
                        Payload {
                            msg: ciphertext,
                            aad: additional_data.as_bytes(),
                        },
                    )
                    .map_err(|_| {
                        Error::CryptoIntegrityError("AEAD authentication failed".to_string())
                    })?;
                String::from_utf8(plaintext)
                    .map_err(|_| Error::CryptoIntegrityError("secret is not UTF-8".to_string()))
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_box() -> SecretBox {
        SecretBox::new(&KmsConfig {
            master_key: hex::encode([7u8; 32]),
            master_key_path: String::new(),
        })
        .unwrap()
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let kms = test_box();
        let mut secret = Secret::plain("s3cr3t");
        kms.encrypt(&mut secret, "user1").unwrap();
        assert!(secret.is_encrypted());
        assert_ne!(secret.payload, "s3cr3t");
        assert_eq!(kms.decrypt(&secret, "user1").unwrap(), "s3cr3t");
    }

    #[test]
    fn mismatched_additional_data_fails() {
        let kms = test_box();
        let mut secret = Secret::plain("s3cr3t");
        kms.encrypt(&mut secret, "user1").unwrap();
        let err = kms.decrypt(&secret, "user2").unwrap_err();
        assert_eq!(err.kind(), "crypto_integrity");
    }

    #[test]
    fn redacted_secret_is_rejected() {
        let kms = test_box();
        let mut secret = Secret::plain("s3cr3t");
        kms.encrypt(&mut secret, "u").unwrap();
        secret.redact();
        assert_eq!(secret.payload, REDACTED_SECRET);
        assert!(kms.decrypt(&secret, "u").is_err());
        let mut redacted = secret.clone();
        assert!(kms.encrypt(&mut redacted, "u").is_err());
    }

    #[test]
    fn empty_secret_roundtrip() {
        let kms = test_box();
        let mut secret = Secret::default();
        kms.encrypt(&mut secret, "u").unwrap();
        assert!(secret.is_empty());
        assert_eq!(kms.decrypt(&secret, "u").unwrap(), "");
    }

    #[test]
    fn tampered_payload_fails_integrity() {
        let kms = test_box();
        let mut secret = Secret::plain("payload");
        kms.encrypt(&mut secret, "u").unwrap();
        let mut raw = base64::engine::general_purpose::STANDARD
            .decode(&secret.payload)
            .unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        secret.payload = base64::engine::general_purpose::STANDARD.encode(raw);
        assert_eq!(kms.decrypt(&secret, "u").unwrap_err().kind(), "crypto_integrity");
    }
}
