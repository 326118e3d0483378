//! Request authentication
//!
//! Bearer tokens, Basic credentials and API keys for the admin and user
//! API surfaces, plus the defender gate applied to every request.

use crate::error::ApiError;
use crate::provider::{Admin, AdminPermission, ApiKeyScope, User};
use crate::state::AppState;
use crate::tokens::{Claims, TokenAudience};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine;
use std::net::{IpAddr, SocketAddr};
use wharf_common::{Error, Protocol, Result};

pub const API_KEY_HEADER: &str = "X-SFTPGO-API-KEY";
pub const OTP_HEADER: &str = "X-SFTPGO-OTP";
pub const MTIME_HEADER: &str = "X-SFTPGO-MTIME";

/// The caller's address, resolved from the socket.
pub fn client_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

/// Reject requests from banned addresses before any handler runs.
pub async fn defender_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    let ip = client_ip(&request);
    if state.defender.is_banned(ip).await {
        return Err(ApiError(Error::Banned));
    }
    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(value).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// An authenticated administrator.
#[derive(Clone)]
pub struct AuthedAdmin {
    pub admin: Admin,
    pub ip: IpAddr,
    pub claims: Option<Claims>,
}

impl AuthedAdmin {
    pub fn require(&self, perm: AdminPermission) -> Result<()> {
        if self.admin.has_permission(perm) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "admin {:?} lacks the required permission",
                self.admin.username
            )))
        }
    }

    /// Role admins only see principals carrying their role.
    pub fn visible_role(&self) -> Option<&str> {
        if self.admin.role.is_empty() {
            None
        } else {
            Some(&self.admin.role)
        }
    }

    pub fn can_see_user(&self, user: &User) -> bool {
        match self.visible_role() {
            None => true,
            Some(role) => user.role == role,
        }
    }
}

/// An authenticated end user.
#[derive(Clone)]
pub struct AuthedUser {
    pub user: User,
    pub ip: IpAddr,
    pub claims: Option<Claims>,
}

/// Authenticate the admin API: bearer token or admin-scoped API key.
pub async fn authenticate_admin(
    state: &AppState,
    headers: &HeaderMap,
    ip: IpAddr,
) -> Result<AuthedAdmin> {
    if let Some(token) = bearer_token(headers) {
        let claims = state.tokens.validate(token, TokenAudience::ApiAdmin, ip)?;
        let admin = crate::provider::admins::get_admin(state.provider.pool(), &claims.sub)
            .await
            .map_err(|_| Error::Unauthorized("unknown admin".to_string()))?;
        if admin.status != crate::provider::UserStatus::Active {
            return Err(Error::Unauthorized("admin is disabled".to_string()));
        }
        return Ok(AuthedAdmin {
            admin,
            ip,
            claims: Some(claims),
        });
    }
    if let Some(value) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        let key = state.provider.check_api_key(value, ApiKeyScope::Admin).await?;
        if key.admin.is_empty() {
            return Err(Error::Unauthorized(
                "API key is not bound to an admin".to_string(),
            ));
        }
        let admin = crate::provider::admins::get_admin(state.provider.pool(), &key.admin).await?;
        if !admin.filters.allow_api_key_auth {
            return Err(Error::Unauthorized(
                "API key authentication is not allowed for this admin".to_string(),
            ));
        }
        return Ok(AuthedAdmin {
            admin,
            ip,
            claims: None,
        });
    }
    Err(Error::Unauthorized("authentication required".to_string()))
}

/// Authenticate the user API: bearer token or user-scoped API key, the
/// latter optionally carrying `.username` when not pre-bound.
pub async fn authenticate_user(
    state: &AppState,
    headers: &HeaderMap,
    ip: IpAddr,
) -> Result<AuthedUser> {
    if let Some(token) = bearer_token(headers) {
        let claims = state.tokens.validate(token, TokenAudience::ApiUser, ip)?;
        let user = state.provider.get_effective_user(&claims.sub).await
            .map_err(|_| Error::Unauthorized("unknown user".to_string()))?;
        crate::policy::authorize_login(
            &user,
            Protocol::Http,
            wharf_common::LoginMethod::Password,
            ip,
            crate::util::now_ms(),
        )?;
        return Ok(AuthedUser {
            user,
            ip,
            claims: Some(claims),
        });
    }
    if let Some(value) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        // `<key-id>.<secret>` or `<key-id>.<secret>.<username>`
        let mut parts = value.splitn(3, '.');
        let key_id = parts.next().unwrap_or_default();
        let secret = parts.next().unwrap_or_default();
        let explicit_user = parts.next();
        let presented = format!("{}.{}", key_id, secret);
        let key = state
            .provider
            .check_api_key(&presented, ApiKeyScope::User)
            .await?;
        let username = if !key.user.is_empty() {
            key.user.clone()
        } else {
            explicit_user
                .ok_or_else(|| {
                    Error::Unauthorized("API key requires a username suffix".to_string())
                })?
                .to_string()
        };
        let user = state.provider.get_effective_user(&username).await
            .map_err(|_| Error::Unauthorized("unknown user".to_string()))?;
        if !user.filters.allow_api_key_auth {
            return Err(Error::Unauthorized(
                "API key authentication is not allowed for this user".to_string(),
            ));
        }
        crate::policy::authorize_login(
            &user,
            Protocol::Http,
            wharf_common::LoginMethod::Password,
            ip,
            crate::util::now_ms(),
        )?;
        return Ok(AuthedUser {
            user,
            ip,
            claims: None,
        });
    }
    Err(Error::Unauthorized("authentication required".to_string()))
}

/// Validate a partial token, accepted only by the 2FA endpoints.
pub fn authenticate_partial(
    state: &AppState,
    headers: &HeaderMap,
    ip: IpAddr,
    audience: TokenAudience,
) -> Result<Claims> {
    let token = bearer_token(headers)
        .ok_or_else(|| Error::Unauthorized("authentication required".to_string()))?;
    state.tokens.validate(token, audience, ip)
}
