//! Token service
//!
//! Short-lived JWTs for the API and web surfaces, partial tokens for
//! pending 2FA, and one-shot out-of-band codes. The signing key is
//! random per process: a restart invalidates every outstanding token,
//! and rotation swaps it atomically.

use crate::provider::sessions::{self, SessionType, SharedSession};
use crate::provider::DataProvider;
use crate::util;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, RwLock};
use wharf_common::{Error, Result};

/// Token audiences; partial tokens may only complete 2FA.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TokenAudience {
    #[serde(rename = "api-admin")]
    ApiAdmin,
    #[serde(rename = "api-user")]
    ApiUser,
    #[serde(rename = "web-admin")]
    WebAdmin,
    #[serde(rename = "web-user")]
    WebUser,
    #[serde(rename = "web-shared")]
    WebShared,
    #[serde(rename = "web-admin-partial")]
    WebAdminPartial,
    #[serde(rename = "web-user-partial")]
    WebUserPartial,
}

impl TokenAudience {
    pub fn is_partial(&self) -> bool {
        matches!(
            self,
            TokenAudience::WebAdminPartial | TokenAudience::WebUserPartial
        )
    }

    fn is_web(&self) -> bool {
        !matches!(self, TokenAudience::ApiAdmin | TokenAudience::ApiUser)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Principal username.
    pub sub: String,
    pub aud: TokenAudience,
    /// Issuing address; a different caller address invalidates.
    pub ip: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_at: i64,
}

struct SigningKey {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

fn random_key() -> SigningKey {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    SigningKey {
        encoding: EncodingKey::from_secret(&secret),
        decoding: DecodingKey::from_secret(&secret),
    }
}

pub struct TokenService {
    key: RwLock<SigningKey>,
    api_ttl_mins: i64,
    web_ttl_mins: i64,
    /// jti values revoked by explicit logout, kept until expiry.
    revoked: Mutex<HashMap<String, i64>>,
    /// Principals whose tokens issued before a timestamp are invalid
    /// (password change, deletion).
    invalidated_before: Mutex<HashMap<String, i64>>,
}

impl TokenService {
    pub fn new(api_ttl_mins: i64, web_ttl_mins: i64) -> Self {
        Self {
            key: RwLock::new(random_key()),
            api_ttl_mins,
            web_ttl_mins,
            revoked: Mutex::new(HashMap::new()),
            invalidated_before: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the signing key; every outstanding token dies with it.
    pub fn rotate_key(&self) {
        *self.key.write().unwrap() = random_key();
        tracing::info!("token signing key rotated");
    }

    pub fn issue(&self, subject: &str, audience: TokenAudience, ip: IpAddr) -> Result<IssuedToken> {
        let now = util::now_ms();
        let ttl_mins = if audience.is_web() {
            self.web_ttl_mins
        } else {
            self.api_ttl_mins
        };
        let claims = Claims {
            sub: subject.to_string(),
            aud: audience,
            ip: ip.to_string(),
            jti: util::random_string(20),
            iat: now / 1000,
            exp: (now + ttl_mins * 60 * 1000) / 1000,
        };
        let key = self.key.read().unwrap();
        let token = encode(&Header::new(Algorithm::HS256), &claims, &key.encoding)
            .map_err(|e| Error::Internal(format!("token signing failed: {}", e)))?;
        Ok(IssuedToken {
            access_token: token,
            expires_at: claims.exp * 1000,
        })
    }

    /// Validate signature, audience, expiry, issuing IP and the
    /// revocation state.
    pub fn validate(&self, token: &str, audience: TokenAudience, ip: IpAddr) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        let key = self.key.read().unwrap();
        let data = decode::<Claims>(token, &key.decoding, &validation)
            .map_err(|_| Error::Unauthorized("invalid or expired token".to_string()))?;
        drop(key);
        let claims = data.claims;
        if claims.aud != audience {
            return Err(Error::Unauthorized("token audience mismatch".to_string()));
        }
        if claims.ip != ip.to_string() {
            return Err(Error::Unauthorized(
                "token was issued to a different address".to_string(),
            ));
        }
        let now_secs = util::now_ms() / 1000;
        {
            let mut revoked = self.revoked.lock().unwrap();
            revoked.retain(|_, exp| *exp > now_secs);
            if revoked.contains_key(&claims.jti) {
                return Err(Error::Unauthorized("token is revoked".to_string()));
            }
        }
        if let Some(cutoff) = self
            .invalidated_before
            .lock()
            .unwrap()
            .get(&claims.sub)
            .copied()
        {
            if claims.iat < cutoff {
                return Err(Error::Unauthorized("token is revoked".to_string()));
            }
        }
        Ok(claims)
    }

    /// Explicit logout.
    pub fn revoke(&self, claims: &Claims) {
        self.revoked
            .lock()
            .unwrap()
            .insert(claims.jti.clone(), claims.exp);
    }

    /// Password change or principal deletion: reject tokens issued
    /// before now at their next use.
    pub fn invalidate_principal(&self, subject: &str) {
        self.invalidated_before
            .lock()
            .unwrap()
            .insert(subject.to_string(), util::now_ms() / 1000);
    }
}

/// TTL of one-shot out-of-band codes.
const CODE_TTL_MS: i64 = 10 * 60 * 1000;

/// Create a password-reset or confirmation code, stored as a shared
/// session so any node can redeem it.
pub async fn create_oneshot_code(
    provider: &DataProvider,
    username: &str,
    session_type: SessionType,
) -> Result<String> {
    let code = util::random_string(32);
    sessions::put_shared_session(
        provider.pool(),
        &SharedSession {
            key: code.clone(),
            data: username.to_string(),
            session_type,
            timestamp: util::now_ms(),
        },
    )
    .await?;
    Ok(code)
}

/// Redeem a one-shot code: deleted on use, rejected past its TTL.
pub async fn consume_oneshot_code(
    provider: &DataProvider,
    code: &str,
    session_type: SessionType,
) -> Result<String> {
    let session = sessions::get_shared_session(provider.pool(), code, session_type)
        .await
        .map_err(|_| Error::Unauthorized("invalid code".to_string()))?;
    sessions::delete_shared_session(provider.pool(), code).await?;
    if session.timestamp + CODE_TTL_MS < util::now_ms() {
        return Err(Error::Unauthorized("code is expired".to_string()));
    }
    Ok(session.data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn issue_and_validate() {
        let svc = TokenService::new(20, 720);
        let issued = svc.issue("alice", TokenAudience::ApiUser, ip()).unwrap();
        let claims = svc
            .validate(&issued.access_token, TokenAudience::ApiUser, ip())
            .unwrap();
        assert_eq!(claims.sub, "alice");
    }

    #[test]
    fn audience_and_ip_are_bound() {
        let svc = TokenService::new(20, 720);
        let issued = svc.issue("alice", TokenAudience::ApiUser, ip()).unwrap();
        assert!(svc
            .validate(&issued.access_token, TokenAudience::ApiAdmin, ip())
            .is_err());
        let other: IpAddr = "10.9.9.9".parse().unwrap();
        assert!(svc
            .validate(&issued.access_token, TokenAudience::ApiUser, other)
            .is_err());
    }

    #[test]
    fn partial_tokens_have_partial_audience() {
        assert!(TokenAudience::WebUserPartial.is_partial());
        assert!(!TokenAudience::ApiUser.is_partial());
    }

    #[test]
    fn logout_revokes() {
        let svc = TokenService::new(20, 720);
        let issued = svc.issue("alice", TokenAudience::WebUser, ip()).unwrap();
        let claims = svc
            .validate(&issued.access_token, TokenAudience::WebUser, ip())
            .unwrap();
        svc.revoke(&claims);
        assert!(svc
            .validate(&issued.access_token, TokenAudience::WebUser, ip())
            .is_err());
    }

    #[test]
    fn password_change_invalidates_older_tokens() {
        let svc = TokenService::new(20, 720);
        let issued = svc.issue("alice", TokenAudience::ApiUser, ip()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        svc.invalidate_principal("alice");
        assert!(svc
            .validate(&issued.access_token, TokenAudience::ApiUser, ip())
            .is_err());
        // New tokens work again
        let fresh = svc.issue("alice", TokenAudience::ApiUser, ip()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(svc
            .validate(&fresh.access_token, TokenAudience::ApiUser, ip())
            .is_ok());
    }

    #[test]
    fn rotation_kills_everything() {
        let svc = TokenService::new(20, 720);
        let issued = svc.issue("alice", TokenAudience::ApiUser, ip()).unwrap();
        svc.rotate_key();
        assert!(svc
            .validate(&issued.access_token, TokenAudience::ApiUser, ip())
            .is_err());
    }

    #[tokio::test]
    async fn oneshot_codes_single_use() {
        let pool = crate::db::open_test_pool().await;
        let provider = crate::provider::DataProvider::new(
            pool,
            std::sync::Arc::new(
                crate::kms::SecretBox::new(&crate::kms::KmsConfig::default()).unwrap(),
            ),
            crate::config::DataProviderConfig::default(),
        );
        let code = create_oneshot_code(&provider, "alice", SessionType::PasswordReset)
            .await
            .unwrap();
        let username = consume_oneshot_code(&provider, &code, SessionType::PasswordReset)
            .await
            .unwrap();
        assert_eq!(username, "alice");
        assert!(
            consume_oneshot_code(&provider, &code, SessionType::PasswordReset)
                .await
                .is_err()
        );
    }
}
