//! Operator endpoints
//!
//! Connections, quota scans and usage updates, retention checks,
//! defender administration, provider dump/load, status and health.

use super::auth;
use crate::error::{ApiError, ApiResult};
use crate::events::actions::{FolderRetention, RetentionActionConfig};
use crate::events::defender::decode_host_id;
use crate::events::EventContext;
use crate::provider::{dump, AdminPermission as Perm};
use crate::state::AppState;
use crate::status;
use crate::vfs::{Fs as _, VirtualFs};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::net::SocketAddr;
use wharf_common::Error;

async fn admin_auth(
    state: &AppState,
    headers: &HeaderMap,
    addr: SocketAddr,
    perm: Perm,
) -> ApiResult<super::auth::AuthedAdmin> {
    let authed = auth::authenticate_admin(state, headers, addr.ip()).await?;
    authed.require(perm)?;
    Ok(authed)
}

// ----- connections -----

pub async fn list_connections(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<crate::connections::ConnectionStatus>>> {
    admin_auth(&state, &headers, addr, Perm::ViewConns).await?;
    Ok(Json(state.connections.statuses()))
}

pub async fn close_connection(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(connection_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    admin_auth(&state, &headers, addr, Perm::CloseConns).await?;
    state.connections.close_connection(&connection_id).await?;
    Ok(Json(serde_json::json!({"message": "connection closed"})))
}

// ----- quotas -----

#[derive(Debug, Deserialize)]
pub struct QuotaUpdateMode {
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_mode() -> String {
    "reset".to_string()
}

#[derive(Debug, Deserialize)]
pub struct QuotaUsage {
    #[serde(default)]
    pub used_quota_files: i32,
    #[serde(default)]
    pub used_quota_size: i64,
}

/// PUT /api/v2/quotas/users/{username}/usage?mode=reset|add
pub async fn update_user_quota_usage(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(username): Path<String>,
    Query(mode): Query<QuotaUpdateMode>,
    Json(usage): Json<QuotaUsage>,
) -> ApiResult<Json<serde_json::Value>> {
    admin_auth(&state, &headers, addr, Perm::QuotaScans).await?;
    let reset = match mode.mode.as_str() {
        "reset" => true,
        "add" => false,
        other => {
            return Err(ApiError(Error::Validation(format!(
                "invalid mode {:?}",
                other
            ))))
        }
    };
    state
        .provider
        .transactional_user_quota_update(
            &username,
            usage.used_quota_files,
            usage.used_quota_size,
            reset,
        )
        .await?;
    Ok(Json(serde_json::json!({"message": "quota updated"})))
}

/// PUT /api/v2/quotas/folders/{name}/usage?mode=reset|add
pub async fn update_folder_quota_usage(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(mode): Query<QuotaUpdateMode>,
    Json(usage): Json<QuotaUsage>,
) -> ApiResult<Json<serde_json::Value>> {
    admin_auth(&state, &headers, addr, Perm::QuotaScans).await?;
    let reset = match mode.mode.as_str() {
        "reset" => true,
        "add" => false,
        other => {
            return Err(ApiError(Error::Validation(format!(
                "invalid mode {:?}",
                other
            ))))
        }
    };
    state
        .provider
        .transactional_folder_quota_update(
            &name,
            usage.used_quota_files,
            usage.used_quota_size,
            reset,
        )
        .await?;
    Ok(Json(serde_json::json!({"message": "quota updated"})))
}

/// POST /api/v2/quotas/users/{username}/scan: walk the user's tree
/// and recompute usage; one scan per user at a time.
pub async fn start_user_quota_scan(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> ApiResult<axum::response::Response> {
    admin_auth(&state, &headers, addr, Perm::QuotaScans).await?;
    let user = state.provider.get_effective_user(&username).await?;
    if !state.quota_scans.start(&username) {
        return Err(ApiError(Error::Conflict(format!(
            "a quota scan is already running for {:?}",
            username
        ))));
    }
    let state_bg = state.clone();
    tokio::spawn(async move {
        let result = async {
            let vfs = VirtualFs::for_user(&user, &state_bg.kms)?;
            let resolved = vfs.resolve("/");
            let entries = resolved.fs.walk(&resolved.fs_path).await?;
            let files = entries.iter().filter(|(_, i)| !i.is_dir).count() as i32;
            let size: i64 = entries
                .iter()
                .filter(|(_, i)| !i.is_dir)
                .map(|(_, i)| i.size)
                .sum();
            state_bg
                .provider
                .transactional_user_quota_update(&user.username, files, size, true)
                .await
        }
        .await;
        if let Err(e) = result {
            tracing::error!(user = %user.username, "quota scan failed: {}", e);
        }
        state_bg.quota_scans.finish(&user.username);
    });
    Ok(StatusCode::ACCEPTED.into_response())
}

/// GET /api/v2/quotas/users/scans
pub async fn list_quota_scans(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<status::ActiveScan>>> {
    admin_auth(&state, &headers, addr, Perm::QuotaScans).await?;
    Ok(Json(state.quota_scans.list()))
}

// ----- retention -----

/// POST /api/v2/retention/users/{username}/check
pub async fn start_retention_check(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(username): Path<String>,
    Json(folders): Json<Vec<FolderRetention>>,
) -> ApiResult<axum::response::Response> {
    admin_auth(&state, &headers, addr, Perm::RetentionChecks).await?;
    let config = RetentionActionConfig { folders };
    let action = crate::events::actions::EventAction {
        id: 0,
        name: format!("retention-check-{}", username),
        description: String::new(),
        options: crate::events::actions::EventActionOptions::DataRetentionCheck(config),
    };
    action.validate()?;
    state.provider.get_effective_user(&username).await?;
    let events = state.events.clone();
    tokio::spawn(async move {
        let mut event = EventContext::fs("retention_check", &username, "/");
        event.protocol = "HTTP".to_string();
        if let Err(e) = events.execute_adhoc_action(&action, &event).await {
            tracing::error!(user = %username, "retention check failed: {}", e);
        }
    });
    Ok(StatusCode::ACCEPTED.into_response())
}

// ----- metadata -----

/// POST /api/v2/metadata/users/{username}/check: verify that every
/// file in the user's tree carries a modification time; backends
/// without native mtimes surface here.
pub async fn start_metadata_check(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> ApiResult<axum::response::Response> {
    admin_auth(&state, &headers, addr, Perm::ViewUsers).await?;
    let user = state.provider.get_effective_user(&username).await?;
    let state_bg = state.clone();
    tokio::spawn(async move {
        let result: Result<usize, Error> = async {
            let vfs = VirtualFs::for_user(&user, &state_bg.kms)?;
            let resolved = vfs.resolve("/");
            let entries = resolved.fs.walk(&resolved.fs_path).await?;
            Ok(entries
                .iter()
                .filter(|(_, info)| !info.is_dir && info.modified_ms == 0)
                .count())
        }
        .await;
        match result {
            Ok(missing) => {
                tracing::info!(user = %user.username, missing, "metadata check completed")
            }
            Err(e) => tracing::error!(user = %user.username, "metadata check failed: {}", e),
        }
    });
    Ok(StatusCode::ACCEPTED.into_response())
}

// ----- defender -----

pub async fn list_defender_hosts(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<crate::events::defender::DefenderHost>>> {
    admin_auth(&state, &headers, addr, Perm::ViewDefender).await?;
    Ok(Json(state.defender.list_hosts().await?))
}

pub async fn get_defender_host(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(host_id): Path<String>,
) -> ApiResult<Json<crate::events::defender::DefenderHost>> {
    admin_auth(&state, &headers, addr, Perm::ViewDefender).await?;
    let ip = decode_host_id(&host_id)?;
    Ok(Json(state.defender.get_host(&ip).await?))
}

pub async fn delete_defender_host(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(host_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    admin_auth(&state, &headers, addr, Perm::ManageDefender).await?;
    let ip = decode_host_id(&host_id)?;
    state.defender.delete_host(&ip).await?;
    Ok(Json(serde_json::json!({"message": "host removed"})))
}

// ----- dump / load -----

/// GET /api/v2/dumpdata
pub async fn dump_data(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult<Json<dump::BackupData>> {
    admin_auth(&state, &headers, addr, Perm::ManageSystem).await?;
    Ok(Json(dump::dump(state.provider.pool()).await?))
}

/// POST /api/v2/loaddata
pub async fn load_data(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(data): Json<dump::BackupData>,
) -> ApiResult<Json<serde_json::Value>> {
    admin_auth(&state, &headers, addr, Perm::ManageSystem).await?;
    dump::load(state.provider.pool(), &data).await?;
    Ok(Json(serde_json::json!({"message": "data restored"})))
}

// ----- events search (plugin seam, no searcher configured) -----

#[derive(Debug, Deserialize)]
pub struct EventSearchParams {
    #[serde(default)]
    pub limit: Option<i64>,
}

/// GET /api/v2/events/fs and /api/v2/events/provider
pub async fn search_events(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(_params): Query<EventSearchParams>,
) -> ApiResult<Json<Vec<serde_json::Value>>> {
    admin_auth(&state, &headers, addr, Perm::ViewStatus).await?;
    // Event search is served by an external searcher plugin; without
    // one the result set is empty.
    Ok(Json(Vec::new()))
}

// ----- status / health -----

pub async fn get_status(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult<Json<status::ServicesStatus>> {
    admin_auth(&state, &headers, addr, Perm::ViewStatus).await?;
    let provider_status = match state.provider.health_check().await {
        Ok(()) => status::ProviderStatus {
            is_active: true,
            error: String::new(),
        },
        Err(e) => status::ProviderStatus {
            is_active: false,
            error: e.to_string(),
        },
    };
    Ok(Json(status::ServicesStatus {
        data_provider: provider_status,
        defender: status::DefenderStatus {
            is_active: state.defender.is_enabled(),
        },
        connections: state.connections.len(),
        version: status::version_info(),
    }))
}

pub async fn get_version() -> Json<status::VersionInfo> {
    Json(status::version_info())
}

pub async fn healthz(State(state): State<AppState>) -> axum::response::Response {
    match state.provider.health_check().await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable").into_response(),
    }
}

pub async fn robots() -> axum::response::Response {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain")],
        "User-agent: *\nDisallow: /\n",
    )
        .into_response()
}
