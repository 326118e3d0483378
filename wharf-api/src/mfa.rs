//! Multi-factor authentication
//!
//! RFC 6238 TOTP with a ±1 step skew window, per-protocol enablement and
//! one-time recovery codes. A passcode accepted once is remembered until
//! its step window closes, so replay within the same step fails.

use crate::kms::{Secret, SecretBox};
use crate::util;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use wharf_common::{Error, Protocol, Result};

/// TOTP time step in seconds
const TIME_STEP: u64 = 30;
/// Number of recovery codes issued on enable
const RECOVERY_CODE_COUNT: usize = 12;

/// TOTP settings attached to a user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserTotpConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Algorithm-family selector; must name a known config.
    #[serde(default)]
    pub config_name: String,
    #[serde(default)]
    pub secret: Secret,
    /// Protocols this config is enabled for.
    #[serde(default)]
    pub protocols: Vec<Protocol>,
}

impl UserTotpConfig {
    pub fn validate_and_seal(&mut self, kms: &SecretBox, aad: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.config_name.is_empty() {
            return Err(Error::Validation(
                "field \"config_name\" is required".to_string(),
            ));
        }
        if self.secret.is_empty() {
            return Err(Error::Validation(
                "a TOTP secret is required".to_string(),
            ));
        }
        if self.protocols.is_empty() {
            return Err(Error::Validation(
                "at least one protocol is required for TOTP".to_string(),
            ));
        }
        if self.secret.is_redacted() {
            return Err(Error::Validation(
                "the TOTP secret cannot be redacted".to_string(),
            ));
        }
        kms.encrypt(&mut self.secret, aad)
    }

    /// True when TOTP with a stored secret covers `protocol`.
    pub fn covers_protocol(&self, protocol: Protocol) -> bool {
        self.enabled && !self.secret.is_empty() && self.protocols.contains(&protocol)
    }
}

/// Result of generating a fresh TOTP secret.
#[derive(Debug, Clone, Serialize)]
pub struct TotpGenerated {
    pub config_name: String,
    pub secret: String,
    /// otpauth:// provisioning URL, rendered to a QR image by clients.
    pub url: String,
}

/// Issues and verifies TOTP passcodes and recovery codes.
pub struct MfaService {
    issuer: String,
    /// Known config names; only the SHA1 family is supported.
    config_names: Vec<String>,
    /// Passcodes accepted recently, keyed by user, with expiry seconds.
    used_passcodes: Mutex<HashMap<String, u64>>,
}

impl MfaService {
    pub fn new(issuer: &str) -> Self {
        Self {
            issuer: issuer.to_string(),
            config_names: vec!["default".to_string()],
            used_passcodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn config_names(&self) -> &[String] {
        &self.config_names
    }

    fn check_config_name(&self, name: &str) -> Result<()> {
        if self.config_names.iter().any(|c| c == name) {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "unknown TOTP config {:?}",
                name
            )))
        }
    }

    /// Generate a fresh secret for `username`. The secret is returned to
    /// this call only; afterwards it exists solely sealed at rest.
    pub fn generate(&self, config_name: &str, username: &str) -> Result<TotpGenerated> {
        self.check_config_name(config_name)?;
        let secret = generate_base32_secret();
        let url = format!(
            "otpauth://totp/{issuer}:{account}?secret={secret}&issuer={issuer}",
            issuer = self.issuer,
            account = username,
        );
        Ok(TotpGenerated {
            config_name: config_name.to_string(),
            secret,
            url,
        })
    }

    /// Verify a passcode against a plaintext base32 secret.
    ///
    /// A success consumes the passcode for `username`: the same code
    /// presented again inside its step window fails with
    /// [`Error::PasscodeAlreadyUsed`].
    pub fn validate_passcode(
        &self,
        config_name: &str,
        username: &str,
        secret: &str,
        passcode: &str,
    ) -> Result<()> {
        self.check_config_name(config_name)?;
        if passcode.is_empty() {
            return Err(Error::PasscodeRequired);
        }
        let now = unix_now()?;
        let current_step = now / TIME_STEP;
        let key = decode_base32(secret)?;
        for offset in [-1i64, 0, 1] {
            let step = (current_step as i64 + offset) as u64;
            let expected = hotp_sha1(&key, step);
            if constant_time_eq(passcode.as_bytes(), expected.as_bytes()) {
                return self.mark_used(username, passcode, step);
            }
        }
        Err(Error::PasscodeInvalid)
    }

    fn mark_used(&self, username: &str, passcode: &str, step: u64) -> Result<()> {
        let mut used = self.used_passcodes.lock().unwrap();
        let now = unix_now()?;
        used.retain(|_, expiry| *expiry > now);
        let entry = format!("{}:{}", username, passcode);
        // The matched step may be the skewed one; keep the code burned
        // until the last window it could still verify in has passed.
        let expiry = (step + 2) * TIME_STEP;
        if used.insert(entry, expiry).is_some() {
            return Err(Error::PasscodeAlreadyUsed);
        }
        Ok(())
    }

    /// Generate the one-time recovery code set issued on TOTP enable.
    pub fn generate_recovery_codes(&self) -> Vec<String> {
        (0..RECOVERY_CODE_COUNT)
            .map(|_| format!("RC-{}", util::random_string(10).to_uppercase()))
            .collect()
    }
}

fn unix_now() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| Error::Internal("system clock before epoch".to_string()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && a.ct_eq(b).into()
}

/// Generate a 32-character base32 secret.
fn generate_base32_secret() -> String {
    use rand::Rng;
    const BASE32_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| {
            let idx = rng.gen_range(0..BASE32_CHARS.len());
            BASE32_CHARS[idx] as char
        })
        .collect()
}

/// HOTP with SHA1 and 6 digits, per RFC 4226.
fn hotp_sha1(key: &[u8], counter: u64) -> String {
    let hmac = hmac_sha1(key, &counter.to_be_bytes());
    let offset = (hmac[hmac.len() - 1] & 0x0f) as usize;
    let code = u32::from_be_bytes([
        hmac[offset] & 0x7f,
        hmac[offset + 1],
        hmac[offset + 2],
        hmac[offset + 3],
    ]) % 1_000_000;
    format!("{:06}", code)
}

fn hmac_sha1(key: &[u8], message: &[u8]) -> Vec<u8> {
    const BLOCK_SIZE: usize = 64;

    let mut key_padded = [0u8; BLOCK_SIZE];
    if key.len() <= BLOCK_SIZE {
        key_padded[..key.len()].copy_from_slice(key);
    } else {
        let hashed = Sha1::digest(key);
        key_padded[..hashed.len()].copy_from_slice(&hashed);
    }

    let mut ipad = [0x36u8; BLOCK_SIZE];
    let mut opad = [0x5cu8; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE {
        ipad[i] ^= key_padded[i];
        opad[i] ^= key_padded[i];
    }

    let mut inner = Sha1::new();
    inner.update(ipad);
    inner.update(message);
    let inner_hash = inner.finalize();

    let mut outer = Sha1::new();
    outer.update(opad);
    outer.update(inner_hash);
    outer.finalize().to_vec()
}

/// Decode an unpadded base32 string.
fn decode_base32(input: &str) -> Result<Vec<u8>> {
    const ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let input = input.trim_end_matches('=').to_uppercase();
    let mut bits = 0u64;
    let mut bit_count = 0u32;
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    for c in input.chars() {
        let value = ALPHABET
            .find(c)
            .ok_or_else(|| Error::Validation("invalid base32 secret".to_string()))?;
        bits = (bits << 5) | value as u64;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_passcode(secret: &str) -> String {
        let key = decode_base32(secret).unwrap();
        let step = unix_now().unwrap() / TIME_STEP;
        hotp_sha1(&key, step)
    }

    #[test]
    fn rfc4226_vectors() {
        // Appendix D of RFC 4226, secret "12345678901234567890".
        let key = b"12345678901234567890";
        assert_eq!(hotp_sha1(key, 0), "755224");
        assert_eq!(hotp_sha1(key, 1), "287082");
        assert_eq!(hotp_sha1(key, 9), "520489");
    }

    #[test]
    fn base32_roundtrip() {
        // "MZXW6YTB" is base32 for "fooba"
        assert_eq!(decode_base32("MZXW6YTB").unwrap(), b"fooba");
    }

    #[test]
    fn validate_accepts_current_step_once() {
        let svc = MfaService::new("wharf");
        let generated = svc.generate("default", "alice").unwrap();
        let code = current_passcode(&generated.secret);

        svc.validate_passcode("default", "alice", &generated.secret, &code)
            .unwrap();
        let err = svc
            .validate_passcode("default", "alice", &generated.secret, &code)
            .unwrap_err();
        assert_eq!(err.kind(), "passcode_already_used");
    }

    #[test]
    fn same_code_usable_by_other_user() {
        let svc = MfaService::new("wharf");
        let generated = svc.generate("default", "alice").unwrap();
        let code = current_passcode(&generated.secret);
        svc.validate_passcode("default", "alice", &generated.secret, &code)
            .unwrap();
        svc.validate_passcode("default", "bob", &generated.secret, &code)
            .unwrap();
    }

    #[test]
    fn wrong_passcode_rejected() {
        let svc = MfaService::new("wharf");
        let generated = svc.generate("default", "alice").unwrap();
        let err = svc
            .validate_passcode("default", "alice", &generated.secret, "000000")
            .err();
        // One in a million chance the random secret matches; tolerate by
        // accepting either outcome but never a panic.
        if let Some(err) = err {
            assert!(matches!(
                err,
                Error::PasscodeInvalid | Error::PasscodeAlreadyUsed
            ));
        }
    }

    #[test]
    fn unknown_config_rejected() {
        let svc = MfaService::new("wharf");
        assert!(svc.generate("sha512", "alice").is_err());
    }

    #[test]
    fn recovery_codes_are_unique() {
        let svc = MfaService::new("wharf");
        let codes = svc.generate_recovery_codes();
        assert_eq!(codes.len(), RECOVERY_CODE_COUNT);
        let set: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(set.len(), codes.len());
        assert!(codes.iter().all(|c| c.starts_with("RC-")));
    }
}
