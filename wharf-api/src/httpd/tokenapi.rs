//! Token, profile and 2FA endpoints

use super::auth::{self, basic_credentials, AuthedUser, OTP_HEADER};
use crate::error::{ApiError, ApiResult};
use crate::events::defender::DefenderEventKind;
use crate::kms::Secret;
use crate::mfa::UserTotpConfig;
use crate::provider::admins;
use crate::provider::users::RecoveryCode;
use crate::state::AppState;
use crate::tokens::TokenAudience;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use wharf_common::{Error, Protocol};

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_at: i64,
}

/// GET /api/v2/user/token: Basic credentials, optional OTP header.
pub async fn user_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<axum::response::Response> {
    use axum::response::IntoResponse;
    let ip = auth::client_ip(&request);
    let (username, password) = basic_credentials(&headers)
        .ok_or_else(|| ApiError(Error::Unauthorized("credentials required".to_string())))?;
    let user = match state
        .provider
        .check_user_password(&username, &password, Protocol::Http, ip)
        .await
    {
        Ok(user) => user,
        Err(e) => {
            let kind = match &e {
                Error::NotFound(_) => Some(DefenderEventKind::InvalidUser),
                Error::Unauthorized(_) => Some(DefenderEventKind::InvalidPassword),
                _ => None,
            };
            if let Some(kind) = kind {
                if state.defender.add_event(ip, kind).await.unwrap_or(false) {
                    state.events.emit_ip_blocked(&ip.to_string());
                }
            }
            let e = match e {
                Error::NotFound(_) => Error::Unauthorized("invalid credentials".to_string()),
                other => other,
            };
            return Err(ApiError(e));
        }
    };
    // TOTP enabled for HTTP requires a passcode on every token request.
    if let Some(secret) = state.provider.mfa_secret_for(&user)? {
        let totp = user.filters.totp_config.as_ref().unwrap();
        if totp.protocols.contains(&Protocol::Http) {
            let passcode = headers
                .get(OTP_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if passcode.is_empty() {
                // Password was correct: 401 carrying a partial token
                // only good for completing 2FA.
                let partial =
                    state
                        .tokens
                        .issue(&user.username, TokenAudience::WebUserPartial, ip)?;
                let mut response = ApiError(Error::TwoFactorRequired(
                    Protocol::Http.to_string(),
                ))
                .into_response();
                let body = serde_json::json!({
                    "error": "two-factor authentication required",
                    "access_token": partial.access_token,
                });
                *response.body_mut() =
                    axum::body::Body::from(serde_json::to_vec(&body).unwrap_or_default());
                return Ok(response);
            }
            state.mfa.validate_passcode(
                &totp.config_name,
                &user.username,
                &secret,
                passcode,
            )?;
        }
    }
    let issued = state
        .tokens
        .issue(&user.username, TokenAudience::ApiUser, ip)?;
    Ok(Json(TokenResponse {
        access_token: issued.access_token,
        expires_at: issued.expires_at,
    })
    .into_response())
}

/// GET /api/v2/token: admin token.
pub async fn admin_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<TokenResponse>> {
    let ip = auth::client_ip(&request);
    let (username, password) = basic_credentials(&headers)
        .ok_or_else(|| ApiError(Error::Unauthorized("credentials required".to_string())))?;
    let admin = match state
        .provider
        .check_admin_password(&username, &password, ip)
        .await
    {
        Ok(admin) => admin,
        Err(e) => {
            let kind = match &e {
                Error::NotFound(_) => Some(DefenderEventKind::InvalidUser),
                Error::Unauthorized(_) => Some(DefenderEventKind::InvalidPassword),
                _ => None,
            };
            if let Some(kind) = kind {
                if state.defender.add_event(ip, kind).await.unwrap_or(false) {
                    state.events.emit_ip_blocked(&ip.to_string());
                }
            }
            let e = match e {
                Error::NotFound(_) => Error::Unauthorized("invalid credentials".to_string()),
                other => other,
            };
            return Err(ApiError(e));
        }
    };
    if let Some(totp) = &admin.filters.totp_config {
        if totp.enabled {
            let secret = state.kms.decrypt(&totp.secret, &format!("admin_{}", username))?;
            let passcode = headers
                .get(OTP_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if passcode.is_empty() {
                return Err(ApiError(Error::TwoFactorRequired("HTTP".to_string())));
            }
            state
                .mfa
                .validate_passcode(&totp.config_name, &username, &secret, passcode)?;
        }
    }
    let issued = state.tokens.issue(&username, TokenAudience::ApiAdmin, ip)?;
    Ok(Json(TokenResponse {
        access_token: issued.access_token,
        expires_at: issued.expires_at,
    }))
}

/// GET /api/v2/user/logout
pub async fn user_logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<serde_json::Value>> {
    let ip = auth::client_ip(&request);
    let authed = auth::authenticate_user(&state, &headers, ip).await?;
    if let Some(claims) = &authed.claims {
        state.tokens.revoke(claims);
    }
    Ok(Json(serde_json::json!({"message": "logged out"})))
}

/// GET /api/v2/logout
pub async fn admin_logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<serde_json::Value>> {
    let ip = auth::client_ip(&request);
    let authed = auth::authenticate_admin(&state, &headers, ip).await?;
    if let Some(claims) = &authed.claims {
        state.tokens.revoke(claims);
    }
    Ok(Json(serde_json::json!({"message": "logged out"})))
}

#[derive(Debug, Deserialize)]
pub struct ChangePassword {
    pub current_password: String,
    pub new_password: String,
}

/// PUT /api/v2/user/changepwd
pub async fn user_change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    // body parsed manually so the auth step sees the raw request parts
) -> ApiResult<Json<serde_json::Value>> {
    let ip = auth::client_ip(&request);
    let authed = auth::authenticate_user(&state, &headers, ip).await?;
    let body = axum::body::to_bytes(request.into_body(), 1024 * 1024)
        .await
        .map_err(|_| ApiError(Error::Validation("invalid request body".to_string())))?;
    let payload: ChangePassword = serde_json::from_slice(&body)
        .map_err(|e| ApiError(Error::Validation(format!("invalid JSON body: {}", e))))?;
    change_user_password(&state, &authed, payload).await
}

async fn change_user_password(
    state: &AppState,
    authed: &AuthedUser,
    payload: ChangePassword,
) -> ApiResult<Json<serde_json::Value>> {
    crate::validation::validate_password(&payload.new_password)?;
    state
        .provider
        .check_user_password(
            &authed.user.username,
            &payload.current_password,
            Protocol::Http,
            authed.ip,
        )
        .await
        .map_err(|_| ApiError(Error::Unauthorized("invalid current password".to_string())))?;
    // Mutate the stored record, not the composed view.
    let mut stored = state.provider.get_user(&authed.user.username).await?;
    let expected = stored.updated_at;
    stored.password = payload.new_password;
    state.provider.update_user(&mut stored, expected).await?;
    state.tokens.invalidate_principal(&authed.user.username);
    Ok(Json(serde_json::json!({"message": "password updated"})))
}

/// PUT /api/v2/admin/changepwd
pub async fn admin_change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<serde_json::Value>> {
    let ip = auth::client_ip(&request);
    let authed = auth::authenticate_admin(&state, &headers, ip).await?;
    let body = axum::body::to_bytes(request.into_body(), 1024 * 1024)
        .await
        .map_err(|_| ApiError(Error::Validation("invalid request body".to_string())))?;
    let payload: ChangePassword = serde_json::from_slice(&body)
        .map_err(|e| ApiError(Error::Validation(format!("invalid JSON body: {}", e))))?;
    state
        .provider
        .check_admin_password(&authed.admin.username, &payload.current_password, ip)
        .await
        .map_err(|_| ApiError(Error::Unauthorized("invalid current password".to_string())))?;
    crate::validation::validate_password(&payload.new_password)?;
    let mut admin = admins::get_admin(state.provider.pool(), &authed.admin.username).await?;
    let expected = admin.updated_at;
    admin.password = crate::provider::hash_password(&payload.new_password)?;
    admins::update_admin(state.provider.pool(), &admin, expected).await?;
    state.tokens.invalidate_principal(&authed.admin.username);
    Ok(Json(serde_json::json!({"message": "password updated"})))
}

/// GET /api/v2/user/profile
pub async fn user_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<serde_json::Value>> {
    let ip = auth::client_ip(&request);
    let authed = auth::authenticate_user(&state, &headers, ip).await?;
    let mut user = authed.user;
    user.prepare_for_rendering();
    Ok(Json(serde_json::json!({
        "username": user.username,
        "email": user.email,
        "description": user.description,
        "public_keys": user.public_keys,
        "last_login": user.last_login,
    })))
}

#[derive(Debug, Deserialize)]
pub struct UserProfileUpdate {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub public_keys: Option<Vec<String>>,
}

/// PUT /api/v2/user/profile
pub async fn update_user_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<serde_json::Value>> {
    let ip = auth::client_ip(&request);
    let authed = auth::authenticate_user(&state, &headers, ip).await?;
    let body = axum::body::to_bytes(request.into_body(), 1024 * 1024)
        .await
        .map_err(|_| ApiError(Error::Validation("invalid request body".to_string())))?;
    let payload: UserProfileUpdate = serde_json::from_slice(&body)
        .map_err(|e| ApiError(Error::Validation(format!("invalid JSON body: {}", e))))?;
    let mut stored = state.provider.get_user(&authed.user.username).await?;
    let expected = stored.updated_at;
    if let Some(email) = payload.email {
        stored.email = email;
    }
    if let Some(description) = payload.description {
        stored.description = description;
    }
    if let Some(keys) = payload.public_keys {
        stored.public_keys = keys;
    }
    state.provider.update_user(&mut stored, expected).await?;
    Ok(Json(serde_json::json!({"message": "profile updated"})))
}

/// GET /api/v2/user/2fa/totp/configs
pub async fn totp_config_names(
    State(state): State<AppState>,
) -> Json<Vec<String>> {
    Json(state.mfa.config_names().to_vec())
}

#[derive(Debug, Deserialize)]
pub struct TotpGenerateRequest {
    pub config_name: String,
}

/// POST /api/v2/user/2fa/totp/generate
pub async fn user_totp_generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<crate::mfa::TotpGenerated>> {
    let ip = auth::client_ip(&request);
    let authed = auth::authenticate_user(&state, &headers, ip).await?;
    let body = axum::body::to_bytes(request.into_body(), 64 * 1024)
        .await
        .map_err(|_| ApiError(Error::Validation("invalid request body".to_string())))?;
    let payload: TotpGenerateRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError(Error::Validation(format!("invalid JSON body: {}", e))))?;
    let generated = state
        .mfa
        .generate(&payload.config_name, &authed.user.username)?;
    Ok(Json(generated))
}

#[derive(Debug, Deserialize)]
pub struct TotpValidateRequest {
    pub config_name: String,
    pub secret: String,
    pub passcode: String,
}

/// POST /api/v2/user/2fa/totp/validate
pub async fn user_totp_validate(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<serde_json::Value>> {
    let ip = auth::client_ip(&request);
    let authed = auth::authenticate_user(&state, &headers, ip).await?;
    let body = axum::body::to_bytes(request.into_body(), 64 * 1024)
        .await
        .map_err(|_| ApiError(Error::Validation("invalid request body".to_string())))?;
    let payload: TotpValidateRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError(Error::Validation(format!("invalid JSON body: {}", e))))?;
    state.mfa.validate_passcode(
        &payload.config_name,
        &authed.user.username,
        &payload.secret,
        &payload.passcode,
    )?;
    Ok(Json(serde_json::json!({"message": "passcode valid"})))
}

#[derive(Debug, Deserialize)]
pub struct TotpSaveRequest {
    pub config_name: String,
    pub secret: String,
    pub passcode: String,
    pub protocols: Vec<wharf_common::Protocol>,
}

/// POST /api/v2/user/2fa/totp/save: enable TOTP after a fresh
/// validation; returns the one-shot recovery codes.
pub async fn user_totp_save(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<serde_json::Value>> {
    let ip = auth::client_ip(&request);
    let authed = auth::authenticate_user(&state, &headers, ip).await?;
    let body = axum::body::to_bytes(request.into_body(), 64 * 1024)
        .await
        .map_err(|_| ApiError(Error::Validation("invalid request body".to_string())))?;
    let payload: TotpSaveRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError(Error::Validation(format!("invalid JSON body: {}", e))))?;
    if payload.protocols.is_empty() {
        return Err(ApiError(Error::Validation(
            "at least one protocol is required".to_string(),
        )));
    }
    state.mfa.validate_passcode(
        &payload.config_name,
        &authed.user.username,
        &payload.secret,
        &payload.passcode,
    )?;
    let codes = state.mfa.generate_recovery_codes();
    let mut stored = state.provider.get_user(&authed.user.username).await?;
    let expected = stored.updated_at;
    stored.filters.totp_config = Some(UserTotpConfig {
        enabled: true,
        config_name: payload.config_name,
        secret: Secret::plain(&payload.secret),
        protocols: payload.protocols,
    });
    stored.filters.recovery_codes = codes
        .iter()
        .map(|code| RecoveryCode {
            secret: Secret::plain(code),
            used: false,
        })
        .collect();
    state.provider.update_user(&mut stored, expected).await?;
    Ok(Json(serde_json::json!({
        "message": "TOTP enabled",
        "recovery_codes": codes,
    })))
}

/// DELETE /api/v2/user/2fa/totp: disable TOTP; refused while a
/// required-2FA protocol would become unsatisfiable.
pub async fn user_totp_disable(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<serde_json::Value>> {
    let ip = auth::client_ip(&request);
    let authed = auth::authenticate_user(&state, &headers, ip).await?;
    let mut stored = state.provider.get_user(&authed.user.username).await?;
    if !stored.filters.two_factor_required_protocols.is_empty() {
        return Err(ApiError(Error::Validation(
            "two-factor authentication is required for this account".to_string(),
        )));
    }
    let expected = stored.updated_at;
    stored.filters.totp_config = None;
    stored.filters.recovery_codes.clear();
    state.provider.update_user(&mut stored, expected).await?;
    Ok(Json(serde_json::json!({"message": "TOTP disabled"})))
}

#[derive(Debug, Serialize)]
pub struct RecoveryCodeView {
    pub code: String,
    pub used: bool,
}

/// GET /api/v2/user/2fa/recoverycodes
pub async fn user_recovery_codes(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<Vec<RecoveryCodeView>>> {
    let ip = auth::client_ip(&request);
    let authed = auth::authenticate_user(&state, &headers, ip).await?;
    let stored = state.provider.get_user(&authed.user.username).await?;
    let mut out = Vec::with_capacity(stored.filters.recovery_codes.len());
    for code in &stored.filters.recovery_codes {
        out.push(RecoveryCodeView {
            code: state.kms.decrypt(&code.secret, &stored.username)?,
            used: code.used,
        });
    }
    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
pub struct RecoveryCodeRequest {
    pub code: String,
}

/// POST /api/v2/user/2fa/recoverycodes: consume one code, issuing a
/// full token in place of a passcode. Accepts Basic credentials or the
/// partial token issued by the token endpoint.
pub async fn user_consume_recovery_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<TokenResponse>> {
    let ip = auth::client_ip(&request);
    let username = if let Some((username, password)) = basic_credentials(&headers) {
        // Password first; the code alone is not a credential.
        state
            .provider
            .check_user_password(&username, &password, Protocol::Http, ip)
            .await
            .map_err(|_| ApiError(Error::Unauthorized("invalid credentials".to_string())))?;
        username
    } else {
        auth::authenticate_partial(&state, &headers, ip, TokenAudience::WebUserPartial)?.sub
    };
    let body = axum::body::to_bytes(request.into_body(), 64 * 1024)
        .await
        .map_err(|_| ApiError(Error::Validation("invalid request body".to_string())))?;
    let payload: RecoveryCodeRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError(Error::Validation(format!("invalid JSON body: {}", e))))?;
    let mut stored = state.provider.get_user(&username).await?;
    let expected = stored.updated_at;
    let mut matched = false;
    for code in &mut stored.filters.recovery_codes {
        let plain = state.kms.decrypt(&code.secret, &username)?;
        if plain == payload.code {
            if code.used {
                return Err(ApiError(Error::RecoveryCodeAlreadyUsed));
            }
            code.used = true;
            matched = true;
            break;
        }
    }
    if !matched {
        return Err(ApiError(Error::Unauthorized(
            "invalid recovery code".to_string(),
        )));
    }
    state.provider.update_user(&mut stored, expected).await?;
    let issued = state.tokens.issue(&username, TokenAudience::ApiUser, ip)?;
    Ok(Json(TokenResponse {
        access_token: issued.access_token,
        expires_at: issued.expires_at,
    }))
}

/// GET /api/v2/admin/profile
pub async fn admin_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<serde_json::Value>> {
    let ip = auth::client_ip(&request);
    let authed = auth::authenticate_admin(&state, &headers, ip).await?;
    let mut admin = authed.admin;
    admin.prepare_for_rendering();
    Ok(Json(serde_json::json!({
        "username": admin.username,
        "email": admin.email,
        "description": admin.description,
        "last_login": admin.last_login,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AdminProfileUpdate {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// PUT /api/v2/admin/profile
pub async fn update_admin_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<serde_json::Value>> {
    let ip = auth::client_ip(&request);
    let authed = auth::authenticate_admin(&state, &headers, ip).await?;
    let body = axum::body::to_bytes(request.into_body(), 64 * 1024)
        .await
        .map_err(|_| ApiError(Error::Validation("invalid request body".to_string())))?;
    let payload: AdminProfileUpdate = serde_json::from_slice(&body)
        .map_err(|e| ApiError(Error::Validation(format!("invalid JSON body: {}", e))))?;
    let mut admin = admins::get_admin(state.provider.pool(), &authed.admin.username).await?;
    let expected = admin.updated_at;
    if let Some(email) = payload.email {
        admin.email = email;
    }
    if let Some(description) = payload.description {
        admin.description = description;
    }
    admin.validate(state.provider.kms())?;
    admins::update_admin(state.provider.pool(), &admin, expected).await?;
    Ok(Json(serde_json::json!({"message": "profile updated"})))
}

/// POST /api/v2/admin/2fa/totp/generate
pub async fn admin_totp_generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<crate::mfa::TotpGenerated>> {
    let ip = auth::client_ip(&request);
    let authed = auth::authenticate_admin(&state, &headers, ip).await?;
    let body = axum::body::to_bytes(request.into_body(), 64 * 1024)
        .await
        .map_err(|_| ApiError(Error::Validation("invalid request body".to_string())))?;
    let payload: TotpGenerateRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError(Error::Validation(format!("invalid JSON body: {}", e))))?;
    let generated = state
        .mfa
        .generate(&payload.config_name, &authed.admin.username)?;
    Ok(Json(generated))
}

#[derive(Debug, Deserialize)]
pub struct AdminTotpSaveRequest {
    pub config_name: String,
    pub secret: String,
    pub passcode: String,
}

/// POST /api/v2/admin/2fa/totp/save
pub async fn admin_totp_save(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<serde_json::Value>> {
    let ip = auth::client_ip(&request);
    let authed = auth::authenticate_admin(&state, &headers, ip).await?;
    let body = axum::body::to_bytes(request.into_body(), 64 * 1024)
        .await
        .map_err(|_| ApiError(Error::Validation("invalid request body".to_string())))?;
    let payload: AdminTotpSaveRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError(Error::Validation(format!("invalid JSON body: {}", e))))?;
    state.mfa.validate_passcode(
        &payload.config_name,
        &authed.admin.username,
        &payload.secret,
        &payload.passcode,
    )?;
    let codes = state.mfa.generate_recovery_codes();
    let mut admin = admins::get_admin(state.provider.pool(), &authed.admin.username).await?;
    let expected = admin.updated_at;
    admin.filters.totp_config = Some(UserTotpConfig {
        enabled: true,
        config_name: payload.config_name,
        secret: Secret::plain(&payload.secret),
        // Admin TOTP always covers the HTTP control plane.
        protocols: vec![wharf_common::Protocol::Http],
    });
    admin.filters.recovery_codes = codes
        .iter()
        .map(|code| RecoveryCode {
            secret: Secret::plain(code),
            used: false,
        })
        .collect();
    admin.validate(state.provider.kms())?;
    admins::update_admin(state.provider.pool(), &admin, expected).await?;
    Ok(Json(serde_json::json!({
        "message": "TOTP enabled",
        "recovery_codes": codes,
    })))
}

/// GET /api/v2/admin/2fa/recoverycodes
pub async fn admin_recovery_codes(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> ApiResult<Json<Vec<RecoveryCodeView>>> {
    let ip = auth::client_ip(&request);
    let authed = auth::authenticate_admin(&state, &headers, ip).await?;
    let admin = admins::get_admin(state.provider.pool(), &authed.admin.username).await?;
    let aad = format!("admin_{}", admin.username);
    let mut out = Vec::with_capacity(admin.filters.recovery_codes.len());
    for code in &admin.filters.recovery_codes {
        out.push(RecoveryCodeView {
            code: state.kms.decrypt(&code.secret, &aad)?,
            used: code.used,
        });
    }
    Ok(Json(out))
}
