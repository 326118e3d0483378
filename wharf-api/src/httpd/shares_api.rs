//! Share endpoints
//!
//! Users publish shares over subsets of their tree; the public
//! endpoints resolve a share id plus optional password into scoped
//! read or write access. Multi-path read shares are not browsable and
//! stream as a zip archive.

use super::auth::{self, basic_credentials};
use crate::error::{ApiError, ApiResult};
use crate::policy;
use crate::provider::shares::{self, Share, ShareScope};
use crate::state::AppState;
use crate::util;
use crate::vfs::{Fs as _, FsRead as _, FsWrite as _, VirtualFs, WriteFlags};
use axum::body::Body;
use axum::extract::{ConnectInfo, Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use wharf_common::{Error, Permission};

/// Flag a user can carry that forbids password-less shares.
const WEB_FLAG_SHARE_PASSWORD_REQUIRED: &str = "share-no-password-disabled";

// ----- user share management -----

pub async fn list_my_shares(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<super::admin_api::ListParams>,
) -> ApiResult<Json<Vec<Share>>> {
    let authed = auth::authenticate_user(&state, &headers, addr.ip()).await?;
    let (limit, offset, ascending) = params.normalize()?;
    let mut result = shares::list_shares_for_user(
        state.provider.pool(),
        &authed.user.username,
        limit,
        offset,
        ascending,
    )
    .await?;
    for share in &mut result {
        share.password = String::new();
    }
    Ok(Json(result))
}

pub async fn get_my_share(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(share_id): Path<String>,
) -> ApiResult<Json<Share>> {
    let authed = auth::authenticate_user(&state, &headers, addr.ip()).await?;
    let mut share = shares::get_share(state.provider.pool(), &share_id).await?;
    if share.username != authed.user.username {
        return Err(ApiError(Error::NotFound(format!("share {:?}", share_id))));
    }
    share.password = String::new();
    Ok(Json(share))
}

pub async fn add_share(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(mut share): Json<Share>,
) -> ApiResult<Response> {
    let authed = auth::authenticate_user(&state, &headers, addr.ip()).await?;
    let user = &authed.user;
    share.username = user.username.clone();
    share.share_id = util::random_string(20);
    if share.password.is_empty()
        && (user.filters.share_password_required
            || user
                .filters
                .web_client
                .iter()
                .any(|f| f == WEB_FLAG_SHARE_PASSWORD_REQUIRED))
    {
        return Err(ApiError(Error::Validation(
            "shares without a password are not allowed for this account".to_string(),
        )));
    }
    if share.expires_at == 0 && user.filters.default_shares_expiration > 0 {
        share.expires_at = util::now_ms()
            + i64::from(user.filters.default_shares_expiration) * 24 * 3600 * 1000;
    }
    share.validate()?;
    // The owner must hold the scope's verbs on every shared path.
    for path in &share.paths {
        match share.scope {
            ShareScope::Read => {
                policy::authorize_action(user, Permission::List, path)?;
                policy::authorize_action(user, Permission::Download, path)?;
            }
            ShareScope::Write | ShareScope::ReadWrite => {
                policy::authorize_action(user, Permission::Upload, path)?;
            }
        }
    }
    if !share.password.is_empty() {
        share.password = crate::provider::hash_password(&share.password)?;
    }
    shares::add_share(state.provider.pool(), &share).await?;
    let mut response = StatusCode::CREATED.into_response();
    if let Ok(value) =
        header::HeaderValue::from_str(&format!("/api/v2/user/shares/{}", share.share_id))
    {
        response.headers_mut().insert(header::LOCATION, value);
    }
    if let Ok(value) = header::HeaderValue::from_str(&share.share_id) {
        response.headers_mut().insert("X-Object-ID", value);
    }
    Ok(response)
}

pub async fn update_my_share(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(share_id): Path<String>,
    Json(mut share): Json<Share>,
) -> ApiResult<Json<serde_json::Value>> {
    let authed = auth::authenticate_user(&state, &headers, addr.ip()).await?;
    let existing = shares::get_share(state.provider.pool(), &share_id).await?;
    if existing.username != authed.user.username {
        return Err(ApiError(Error::NotFound(format!("share {:?}", share_id))));
    }
    share.share_id = existing.share_id.clone();
    share.username = existing.username.clone();
    share.validate()?;
    if share.password.is_empty() {
        share.password = existing.password.clone();
    } else {
        share.password = crate::provider::hash_password(&share.password)?;
    }
    shares::update_share(state.provider.pool(), &share).await?;
    Ok(Json(serde_json::json!({"message": "share updated"})))
}

pub async fn delete_my_share(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(share_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let authed = auth::authenticate_user(&state, &headers, addr.ip()).await?;
    shares::delete_share(state.provider.pool(), &share_id, &authed.user.username).await?;
    Ok(Json(serde_json::json!({"message": "share deleted"})))
}

// ----- public share access -----

/// Resolve a usable share: existence, expiry, token cap, source IP and
/// password. A share past its limits is presented as missing.
async fn resolve_share(
    state: &AppState,
    share_id: &str,
    headers: &HeaderMap,
    ip: std::net::IpAddr,
    scope_needed: ShareScope,
) -> Result<(Share, crate::provider::User), Error> {
    let share = shares::get_share(state.provider.pool(), share_id)
        .await
        .map_err(|_| Error::NotFound(format!("share {:?}", share_id)))?;
    if !share.is_usable(util::now_ms()) {
        return Err(Error::NotFound(format!("share {:?}", share_id)));
    }
    if !share.is_ip_allowed(ip) {
        return Err(Error::PermissionDenied(format!(
            "share access not allowed from {}",
            ip
        )));
    }
    let scope_ok = match scope_needed {
        ShareScope::Read => matches!(share.scope, ShareScope::Read | ShareScope::ReadWrite),
        ShareScope::Write => matches!(share.scope, ShareScope::Write | ShareScope::ReadWrite),
        ShareScope::ReadWrite => share.scope == ShareScope::ReadWrite,
    };
    if !scope_ok {
        return Err(Error::PermissionDenied(
            "the share scope does not allow this operation".to_string(),
        ));
    }
    if !share.password.is_empty() {
        let presented = basic_credentials(headers)
            .map(|(_, password)| password)
            .ok_or(Error::Unauthorized("share password required".to_string()))?;
        if !crate::provider::verify_password(&presented, &share.password)? {
            return Err(Error::Unauthorized("invalid share password".to_string()));
        }
    }
    let user = state.provider.get_effective_user(&share.username).await?;
    Ok((share, user))
}

#[derive(Debug, Deserialize)]
pub struct BrowseParams {
    #[serde(default)]
    pub path: Option<String>,
}

/// GET /api/v2/shares/{id}: browse a single-directory read share with
/// `?path=`, or stream the share contents as a zip without it.
pub async fn read_share(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(share_id): Path<String>,
    Query(params): Query<BrowseParams>,
) -> ApiResult<Response> {
    let (share, user) = resolve_share(&state, &share_id, &headers, addr.ip(), ShareScope::Read)
        .await?;
    let vfs = Arc::new(VirtualFs::for_user(&user, &state.kms)?);

    // Browsing requires a single shared directory.
    if let Some(sub) = params.path.as_deref() {
        if share.paths.len() != 1 {
            return Err(ApiError(Error::PermissionDenied(
                "this share is not browsable".to_string(),
            )));
        }
        let root = util::clean_path(&share.paths[0]);
        let target = util::join_path(&root, util::clean_path(sub).trim_start_matches('/'));
        if !util::is_same_or_ancestor(&root, &target) {
            return Err(ApiError(Error::PermissionDenied(
                "path is outside the share".to_string(),
            )));
        }
        let resolved = vfs.resolve(&target);
        let info = resolved.fs.stat(&resolved.fs_path).await?;
        if info.is_dir {
            let entries = resolved.fs.list(&resolved.fs_path).await?;
            let listing: Vec<serde_json::Value> = entries
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "name": e.name,
                        "size": e.size,
                        "type": if e.is_dir { 1 } else { 2 },
                        "last_modified": e.modified_ms,
                    })
                })
                .collect();
            return Ok(Json(listing).into_response());
        }
        // Single file download consumes a token.
        shares::consume_share_token(state.provider.pool(), &share_id).await?;
        let mut reader = resolved.fs.open_read(&resolved.fs_path, 0).await?;
        let mut data = Vec::new();
        loop {
            let chunk = reader.read_chunk(64 * 1024).await?;
            if chunk.is_empty() {
                break;
            }
            data.extend_from_slice(&chunk);
        }
        reader.close().await?;
        let mut response = Response::new(Body::from(data));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/octet-stream"),
        );
        return Ok(response);
    }

    // Whole-share download: streamed zip.
    shares::consume_share_token(state.provider.pool(), &share_id).await?;
    let receiver = crate::zipstream::stream_paths(vfs, share.paths.clone()).await?;
    let stream = futures::stream::unfold(receiver, |mut rx| async move {
        rx.recv().await.map(|item| {
            (
                item.map_err(|e| std::io::Error::other(e.to_string())),
                rx,
            )
        })
    });
    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/zip"),
    );
    response.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        header::HeaderValue::from_str(&format!(
            "attachment; filename=\"share-{}.zip\"",
            share.name
        ))
        .unwrap_or(header::HeaderValue::from_static("attachment")),
    );
    Ok(response)
}

/// POST /api/v2/shares/{id}: upload into a write share, rooted at the
/// shared directory.
pub async fn write_share(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(share_id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let (share, user) = resolve_share(&state, &share_id, &headers, addr.ip(), ShareScope::Write)
        .await?;
    // One token per request, checked against the cap before any write.
    shares::consume_share_token(state.provider.pool(), &share_id)
        .await
        .map_err(|_| ApiError(Error::NotFound(format!("share {:?}", share_id))))?;
    let root = util::clean_path(&share.paths[0]);
    let vfs = Arc::new(VirtualFs::for_user(&user, &state.kms)?);
    vfs.ensure_root().await?;
    let mut uploaded = 0usize;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(Error::Validation(format!("invalid multipart body: {}", e))))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        // Traversal beyond the shared root is forbidden.
        let target = util::join_path(&root, &filename);
        if !util::is_same_or_ancestor(&root, &target) || target == root {
            return Err(ApiError(Error::PermissionDenied(
                "path is outside the share".to_string(),
            )));
        }
        policy::authorize_action(&user, Permission::Upload, &target)?;
        policy::check_quota(&user, 1, 0)?;
        let resolved = vfs.resolve(&target);
        let mut writer = resolved
            .fs
            .open_write(
                &resolved.fs_path,
                WriteFlags {
                    truncate: true,
                    ..Default::default()
                },
            )
            .await?;
        let mut written = 0i64;
        loop {
            let chunk = match field.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(ApiError(Error::Internal(format!(
                        "upload stream failed: {}",
                        e
                    ))));
                }
            };
            written += chunk.len() as i64;
            if user.quota_size > 0 && user.used_quota_size + written > user.quota_size {
                let _ = writer.abort().await;
                return Err(ApiError(Error::QuotaExceeded(format!(
                    "size quota exceeded for user {:?}",
                    user.username
                ))));
            }
            writer.write_chunk(&chunk).await?;
        }
        writer.close().await?;
        state
            .provider
            .transactional_user_quota_update(&user.username, 1, written, false)
            .await?;
        uploaded += 1;
    }
    if uploaded == 0 {
        return Err(ApiError(Error::Validation(
            "no files in the request".to_string(),
        )));
    }
    Ok(StatusCode::CREATED.into_response())
}
