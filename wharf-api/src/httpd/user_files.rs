//! User file and directory endpoints
//!
//! The HTTP protocol adapter over the control core: every request is
//! admitted as a short-lived connection, authorized by the policy
//! engine, executed through the user's virtual filesystem and accounted
//! against quota and transfer counters. Uploads and downloads run
//! through the shaped transfer wrappers and fire filesystem events.

use super::auth::{self, AuthedUser, MTIME_HEADER};
use crate::connections::{Connection, TransferReader, TransferWriter};
use crate::error::{ApiError, ApiResult};
use crate::events::EventContext;
use crate::policy;
use crate::provider::sessions::TransferType;
use crate::provider::users;
use crate::state::AppState;
use crate::util;
use crate::vfs::{FileInfo, Fs as _, FsRead as _, FsWrite, VirtualFs, WriteFlags};
use axum::body::Body;
use axum::extract::{ConnectInfo, Multipart, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use wharf_common::{Error, Permission, Protocol};

const CHUNK: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
pub struct PathParam {
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    "/".to_string()
}

#[derive(Debug, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub size: i64,
    #[serde(rename = "type")]
    pub entry_type: i32,
    pub last_modified: i64,
}

fn entry_of(info: &FileInfo) -> DirEntry {
    DirEntry {
        name: info.name.clone(),
        size: if info.is_dir { 0 } else { info.size },
        entry_type: if info.is_dir { 1 } else { 2 },
        last_modified: info.modified_ms,
    }
}

async fn user_session(
    state: &AppState,
    headers: &HeaderMap,
    addr: SocketAddr,
) -> ApiResult<(AuthedUser, Arc<VirtualFs>, Arc<Connection>)> {
    let authed = auth::authenticate_user(state, headers, addr.ip()).await?;
    let connection = state.connections.add_connection(
        &authed.user.username,
        authed.user.max_sessions,
        Protocol::Http,
        addr.ip(),
    )?;
    let vfs = Arc::new(VirtualFs::for_user(&authed.user, &state.kms)?);
    if let Err(e) = vfs.ensure_root().await {
        let _ = state.connections.close_connection(&connection.id).await;
        return Err(ApiError(e));
    }
    Ok((authed, vfs, connection))
}

async fn finish_session(state: &AppState, connection: &Arc<Connection>) {
    let _ = state.connections.close_connection(&connection.id).await;
}

/// GET /api/v2/user/dirs
pub async fn list_dir(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<PathParam>,
) -> ApiResult<Json<Vec<DirEntry>>> {
    let (authed, vfs, connection) = user_session(&state, &headers, addr).await?;
    let result = list_dir_inner(&authed, &vfs, &params.path).await;
    finish_session(&state, &connection).await;
    result.map(Json)
}

async fn list_dir_inner(
    authed: &AuthedUser,
    vfs: &Arc<VirtualFs>,
    path: &str,
) -> Result<Vec<DirEntry>, ApiError> {
    let virtual_dir = util::clean_path(path);
    policy::authorize_action(&authed.user, Permission::List, &virtual_dir)?;
    let resolved = vfs.resolve(&virtual_dir);
    let mut entries = resolved.fs.list(&resolved.fs_path).await?;
    // Mounts directly below appear as directories.
    for mount_name in vfs.mount_points_in(&virtual_dir) {
        if !entries.iter().any(|e| e.name == mount_name) {
            entries.push(FileInfo {
                name: mount_name,
                is_dir: true,
                ..Default::default()
            });
        }
    }
    // Names denied with the hide policy never appear in listings.
    entries.retain(|info| {
        let child = util::join_path(&virtual_dir, &info.name);
        policy::pattern_check(&authed.user, &child) != policy::PatternVerdict::DeniedHidden
    });
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries.iter().map(entry_of).collect())
}

/// POST /api/v2/user/dirs: create a directory.
pub async fn make_dir(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<PathParam>,
) -> ApiResult<Response> {
    let (authed, vfs, connection) = user_session(&state, &headers, addr).await?;
    let result = async {
        let virtual_dir = util::clean_path(&params.path);
        policy::authorize_action(&authed.user, Permission::CreateDirs, &virtual_dir)?;
        let resolved = vfs.resolve(&virtual_dir);
        resolved.fs.mkdir(&resolved.fs_path).await?;
        let mut event = EventContext::fs("mkdir", &authed.user.username, &virtual_dir);
        event.protocol = Protocol::Http.to_string();
        event.ip = addr.ip().to_string();
        let _ = state.events.handle_fs_event(event).await;
        Ok::<_, ApiError>(StatusCode::CREATED.into_response())
    }
    .await;
    finish_session(&state, &connection).await;
    result
}

/// DELETE /api/v2/user/dirs
pub async fn remove_dir(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<PathParam>,
) -> ApiResult<Json<serde_json::Value>> {
    let (authed, vfs, connection) = user_session(&state, &headers, addr).await?;
    let result = async {
        let virtual_dir = util::clean_path(&params.path);
        if virtual_dir == "/" {
            return Err(ApiError(Error::Validation(
                "the root directory cannot be removed".to_string(),
            )));
        }
        policy::authorize_action(&authed.user, Permission::DeleteDirs, &virtual_dir)?;
        let resolved = vfs.resolve(&virtual_dir);
        resolved.fs.remove_dir(&resolved.fs_path).await?;
        let mut event = EventContext::fs("rmdir", &authed.user.username, &virtual_dir);
        event.protocol = Protocol::Http.to_string();
        event.ip = addr.ip().to_string();
        let _ = state.events.handle_fs_event(event).await;
        Ok(Json(serde_json::json!({"message": "directory removed"})))
    }
    .await;
    finish_session(&state, &connection).await;
    result
}

/// Parsed byte range: (offset, length).
fn parse_range(value: &str, size: i64) -> Result<(i64, i64), Error> {
    let spec = value
        .strip_prefix("bytes=")
        .ok_or_else(|| Error::Validation("unsupported range unit".to_string()))?;
    let invalid = || Error::Validation(format!("invalid range {:?}", value));
    let (start_raw, end_raw) = spec.split_once('-').ok_or_else(invalid)?;
    if start_raw.is_empty() {
        // suffix form: last N bytes
        let n: i64 = end_raw.parse().map_err(|_| invalid())?;
        let len = n.min(size);
        return Ok((size - len, len));
    }
    let start: i64 = start_raw.parse().map_err(|_| invalid())?;
    if start >= size {
        return Err(invalid());
    }
    if end_raw.is_empty() {
        return Ok((start, size - start));
    }
    let end: i64 = end_raw.parse().map_err(|_| invalid())?;
    if end < start {
        return Err(invalid());
    }
    Ok((start, (end.min(size - 1) - start) + 1))
}

fn http_date(ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms)
        .map(|t| t.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
        .unwrap_or_default()
}

fn parse_http_date(value: &str) -> Option<i64> {
    chrono::NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
        .ok()
        .map(|t| t.and_utc().timestamp_millis())
}

/// GET /api/v2/user/files: download with range and conditional
/// support. A cancellation mid-stream aborts the body.
pub async fn download_file(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<PathParam>,
) -> ApiResult<Response> {
    let (authed, vfs, connection) = user_session(&state, &headers, addr).await?;
    let result = download_inner(&state, &authed, vfs.clone(), &connection, &headers, &params.path)
        .await;
    if result.is_err() {
        finish_session(&state, &connection).await;
    }
    result
}

async fn download_inner(
    state: &AppState,
    authed: &AuthedUser,
    vfs: Arc<VirtualFs>,
    connection: &Arc<Connection>,
    headers: &HeaderMap,
    path: &str,
) -> ApiResult<Response> {
    let virtual_path = util::clean_path(path);
    policy::authorize_action(&authed.user, Permission::Download, &virtual_path)?;
    let caps = policy::transfer_caps_for(&authed.user, authed.ip);
    if caps.download_exhausted() {
        return Err(ApiError(Error::TransferQuotaExceeded(format!(
            "download quota exhausted for user {:?}",
            authed.user.username
        ))));
    }
    let resolved = vfs.resolve(&virtual_path);
    let info = resolved.fs.stat(&resolved.fs_path).await?;
    if info.is_dir {
        return Err(ApiError(Error::Validation(
            "the requested path is a directory".to_string(),
        )));
    }

    // Conditional requests, HTTP-date form.
    if let Some(value) = headers
        .get(header::IF_UNMODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
    {
        if info.modified_ms / 1000 > value / 1000 {
            finish_session(state, connection).await;
            return Ok(StatusCode::PRECONDITION_FAILED.into_response());
        }
    }
    if let Some(value) = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
    {
        if info.modified_ms / 1000 <= value / 1000 {
            finish_session(state, connection).await;
            return Ok(StatusCode::NOT_MODIFIED.into_response());
        }
    }

    // Range, unless If-Range names an older version.
    let mut range: Option<(i64, i64)> = None;
    let range_applicable = match headers
        .get(header::IF_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
    {
        Some(value) => info.modified_ms / 1000 <= value / 1000,
        None => true,
    };
    if range_applicable {
        if let Some(value) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
            match parse_range(value, info.size) {
                Ok(parsed) => range = Some(parsed),
                Err(_) => {
                    finish_session(state, connection).await;
                    let mut response =
                        StatusCode::RANGE_NOT_SATISFIABLE.into_response();
                    if let Ok(v) =
                        header::HeaderValue::from_str(&format!("bytes */{}", info.size))
                    {
                        response.headers_mut().insert(header::CONTENT_RANGE, v);
                    }
                    return Ok(response);
                }
            }
        }
    }

    // A synchronous download rule can refuse the transfer.
    let mut event = EventContext::fs("download", &authed.user.username, &virtual_path);
    event.file_size = info.size;
    event.protocol = Protocol::Http.to_string();
    event.ip = authed.ip.to_string();
    state.events.handle_fs_event(event).await?;

    let (offset, length) = range.unwrap_or((0, info.size));
    let (_, dl_kbps) = policy::bandwidth_for(&authed.user, authed.ip);
    let transfer = state
        .connections
        .open_transfer(
            connection,
            TransferType::Download,
            &virtual_path,
            resolved
                .folder
                .as_ref()
                .map(|f| f.folder.name.as_str())
                .unwrap_or(""),
            dl_kbps,
            0,
        )
        .await?;
    let reader = resolved.fs.open_read(&resolved.fs_path, offset as u64).await?;
    let reader = TransferReader::new(reader, transfer.clone());

    let username = authed.user.username.clone();
    let state_for_cleanup = state.clone();
    let connection_for_cleanup = connection.clone();
    struct StreamState {
        reader: TransferReader,
        remaining: i64,
    }
    let stream = futures::stream::unfold(
        Some(StreamState {
            reader,
            remaining: length,
        }),
        move |slot| {
            let state = state_for_cleanup.clone();
            let connection = connection_for_cleanup.clone();
            let transfer = transfer.clone();
            let username = username.clone();
            async move {
                let mut stream_state = slot?;
                if stream_state.remaining <= 0 {
                    settle_download(&state, &connection, &transfer, &username).await;
                    return None;
                }
                let want = (stream_state.remaining as usize).min(CHUNK);
                match stream_state.reader.read_chunk(want).await {
                    Ok(chunk) if chunk.is_empty() => {
                        settle_download(&state, &connection, &transfer, &username).await;
                        None
                    }
                    Ok(chunk) => {
                        stream_state.remaining -= chunk.len() as i64;
                        Some((Ok(chunk), Some(stream_state)))
                    }
                    Err(e) => {
                        settle_download(&state, &connection, &transfer, &username).await;
                        // Abort the body mid-stream; no new status.
                        Some((
                            Err(std::io::Error::other(e.to_string())),
                            None,
                        ))
                    }
                }
            }
        },
    );

    let mut response = Response::new(Body::from_stream(stream));
    if range.is_some() {
        *response.status_mut() = StatusCode::PARTIAL_CONTENT;
    }
    let headers_mut = response.headers_mut();
    headers_mut.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/octet-stream"),
    );
    headers_mut.insert(
        header::ACCEPT_RANGES,
        header::HeaderValue::from_static("bytes"),
    );
    if let Ok(value) = header::HeaderValue::from_str(&http_date(info.modified_ms)) {
        headers_mut.insert(header::LAST_MODIFIED, value);
    }
    if let Ok(value) = header::HeaderValue::from_str(&length.to_string()) {
        headers_mut.insert(header::CONTENT_LENGTH, value);
    }
    if range.is_some() {
        if let Ok(value) = header::HeaderValue::from_str(&format!(
            "bytes {}-{}/{}",
            offset,
            offset + length - 1,
            info.size
        )) {
            headers_mut.insert(header::CONTENT_RANGE, value);
        }
    }
    Ok(response)
}

async fn settle_download(
    state: &AppState,
    connection: &Arc<Connection>,
    transfer: &Arc<crate::connections::Transfer>,
    username: &str,
) {
    let sent = transfer.bytes_sent();
    let _ = state.connections.close_transfer(connection, transfer).await;
    if sent > 0 {
        let _ = state
            .provider
            .transactional_transfer_quota_update(username, 0, sent, false)
            .await;
        let _ = users::update_first_transfer(state.provider.pool(), username, false).await;
    }
    finish_session(state, connection).await;
}

/// POST /api/v2/user/files: multipart upload into `path`.
pub async fn upload_files(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<PathParam>,
    multipart: Multipart,
) -> ApiResult<Response> {
    let (authed, vfs, connection) = user_session(&state, &headers, addr).await?;
    let result = upload_inner(
        &state,
        &authed,
        vfs,
        &connection,
        &headers,
        &params.path,
        multipart,
    )
    .await;
    finish_session(&state, &connection).await;
    result
}

async fn upload_inner(
    state: &AppState,
    authed: &AuthedUser,
    vfs: Arc<VirtualFs>,
    connection: &Arc<Connection>,
    headers: &HeaderMap,
    dir: &str,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let virtual_dir = util::clean_path(dir);
    let mtime_ms: Option<i64> = headers
        .get(MTIME_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .filter(|v| *v > 0);
    let mut uploaded = 0usize;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(Error::Validation(format!("invalid multipart body: {}", e))))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let virtual_path = util::join_path(&virtual_dir, &filename);
        upload_one(
            state,
            authed,
            &vfs,
            connection,
            &virtual_path,
            field,
            mtime_ms,
        )
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

async fn upload_one(
    state: &AppState,
    authed: &AuthedUser,
    vfs: &Arc<VirtualFs>,
    connection: &Arc<Connection>,
    virtual_path: &str,
    mut field: axum::extract::multipart::Field<'_>,
    mtime_ms: Option<i64>,
) -> ApiResult<()> {
    let user = &authed.user;
    let resolved = vfs.resolve(virtual_path);
    let existing = resolved.fs.stat(&resolved.fs_path).await.ok();
    let is_overwrite = existing.as_ref().map(|i| !i.is_dir).unwrap_or(false);
    if is_overwrite {
        policy::authorize_overwrite(user, virtual_path)?;
    } else {
        policy::authorize_action(user, Permission::Upload, virtual_path)?;
    }
    // Quota admission happens before a single byte lands in storage.
    let added_files = if is_overwrite { 0 } else { 1 };
    policy::check_quota(user, added_files, 0)?;
    let caps = policy::transfer_caps_for(user, authed.ip);
    if caps.upload_exhausted() {
        return Err(ApiError(Error::TransferQuotaExceeded(format!(
            "upload quota exhausted for user {:?}",
            user.username
        ))));
    }
    if let Some(folder) = &resolved.folder {
        if folder.has_own_quota() && folder.quota_files > 0 {
            let stored = crate::provider::folders::get_folder(
                state.provider.pool(),
                &folder.folder.name,
            )
            .await?;
            if stored.used_quota_files + added_files > folder.quota_files {
                return Err(ApiError(Error::QuotaExceeded(format!(
                    "folder quota exceeded for {:?}",
                    folder.folder.name
                ))));
            }
        }
    }

    let (ul_kbps, _) = policy::bandwidth_for(user, authed.ip);
    let truncated_size = existing.as_ref().map(|i| i.size).unwrap_or(0);
    let transfer = state
        .connections
        .open_transfer(
            connection,
            TransferType::Upload,
            virtual_path,
            resolved
                .folder
                .as_ref()
                .map(|f| f.folder.name.as_str())
                .unwrap_or(""),
            ul_kbps,
            truncated_size,
        )
        .await?;
    let writer = resolved
        .fs
        .open_write(
            &resolved.fs_path,
            WriteFlags {
                truncate: true,
                truncated_size,
                ..Default::default()
            },
        )
        .await?;
    let mut writer = TransferWriter::new(writer, transfer.clone());

    let max_upload = user.filters.max_upload_file_size;
    let mut written = 0i64;
    let write_result: Result<(), Error> = async {
        loop {
            let chunk = match field.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    return Err(Error::Internal(format!("upload stream failed: {}", e)))
                }
            };
            written += chunk.len() as i64;
            if max_upload > 0 && written > max_upload {
                return Err(Error::QuotaExceeded(format!(
                    "file exceeds the {} byte upload limit",
                    max_upload
                )));
            }
            if user.quota_size > 0 && user.used_quota_size + written > user.quota_size {
                return Err(Error::QuotaExceeded(format!(
                    "size quota exceeded for user {:?}",
                    user.username
                )));
            }
            if let Some(limit) = caps.allowed_ul_bytes.or(caps.allowed_total_bytes) {
                if written > limit {
                    return Err(Error::TransferQuotaExceeded(format!(
                        "upload quota exhausted for user {:?}",
                        user.username
                    )));
                }
            }
            writer.write_chunk(&chunk).await?;
        }
        crate::vfs::FsWrite::close(&mut writer).await
    }
    .await;

    if let Err(e) = write_result {
        let _ = crate::vfs::FsWrite::abort(&mut writer).await;
        let _ = state.connections.close_transfer(connection, &transfer).await;
        return Err(ApiError(e));
    }
    let received = transfer.bytes_received();
    let _ = state.connections.close_transfer(connection, &transfer).await;

    // Synchronous upload rules can reject the finished file.
    let mut event = EventContext::fs("upload", &user.username, virtual_path);
    event.file_size = received;
    event.protocol = Protocol::Http.to_string();
    event.ip = authed.ip.to_string();
    if let Err(e) = state.events.handle_fs_event(event).await {
        let _ = resolved.fs.remove_file(&resolved.fs_path).await;
        return Err(ApiError(e));
    }

    if let Some(mtime) = mtime_ms {
        // Malformed or unsupported values are ignored.
        let _ = resolved.fs.chtimes(&resolved.fs_path, mtime, mtime).await;
    }

    let size_delta = received - truncated_size;
    state
        .provider
        .transactional_user_quota_update(&user.username, added_files, size_delta, false)
        .await?;
    if let Some(folder) = &resolved.folder {
        state
            .provider
            .transactional_folder_quota_update(&folder.folder.name, added_files, size_delta, false)
            .await?;
    }
    state
        .provider
        .transactional_transfer_quota_update(&user.username, received, 0, false)
        .await?;
    users::update_first_transfer(state.provider.pool(), &user.username, true).await?;
    Ok(())
}

/// DELETE /api/v2/user/files
pub async fn delete_file(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<PathParam>,
) -> ApiResult<Json<serde_json::Value>> {
    let (authed, vfs, connection) = user_session(&state, &headers, addr).await?;
    let result = async {
        let virtual_path = util::clean_path(&params.path);
        policy::authorize_action(&authed.user, Permission::DeleteFiles, &virtual_path)?;
        let resolved = vfs.resolve(&virtual_path);
        let info = resolved.fs.stat(&resolved.fs_path).await?;
        if info.is_dir {
            return Err(ApiError(Error::Validation(
                "the requested path is a directory".to_string(),
            )));
        }
        resolved.fs.remove_file(&resolved.fs_path).await?;
        state
            .provider
            .transactional_user_quota_update(&authed.user.username, -1, -info.size, false)
            .await?;
        if let Some(folder) = &resolved.folder {
            state
                .provider
                .transactional_folder_quota_update(&folder.folder.name, -1, -info.size, false)
                .await?;
        }
        let mut event = EventContext::fs("delete", &authed.user.username, &virtual_path);
        event.file_size = info.size;
        event.protocol = Protocol::Http.to_string();
        event.ip = addr.ip().to_string();
        let _ = state.events.handle_fs_event(event).await;
        Ok(Json(serde_json::json!({"message": "file deleted"})))
    }
    .await;
    finish_session(&state, &connection).await;
    result
}

/// POST /api/v2/user/files/move: rename inside the virtual tree.
#[derive(Debug, Deserialize)]
pub struct MoveParams {
    pub path: String,
    pub target: String,
}

pub async fn move_file(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<MoveParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let (authed, vfs, connection) = user_session(&state, &headers, addr).await?;
    let result = async {
        let source = util::clean_path(&params.path);
        let target = util::clean_path(&params.target);
        let resolved = vfs.resolve(&source);
        let info = resolved.fs.stat(&resolved.fs_path).await?;
        let verb = if info.is_dir {
            Permission::RenameDirs
        } else {
            Permission::RenameFiles
        };
        policy::authorize_action(&authed.user, verb, &source)?;
        policy::authorize_action(&authed.user, verb, &target)?;
        vfs.rename(&source, &target).await?;
        let mut event = EventContext::fs("rename", &authed.user.username, &source);
        event.virtual_target_path = target.clone();
        event.protocol = Protocol::Http.to_string();
        event.ip = addr.ip().to_string();
        let _ = state.events.handle_fs_event(event).await;
        Ok(Json(serde_json::json!({"message": "renamed"})))
    }
    .await;
    finish_session(&state, &connection).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_forms() {
        // closed
        assert_eq!(parse_range("bytes=0-4", 10).unwrap(), (0, 5));
        // open ended
        assert_eq!(parse_range("bytes=4-", 10).unwrap(), (4, 6));
        // suffix: last two bytes
        assert_eq!(parse_range("bytes=-2", 10).unwrap(), (8, 2));
        // end clamped to size
        assert_eq!(parse_range("bytes=5-100", 10).unwrap(), (5, 5));
        // malformed start
        assert!(parse_range("bytes=1a-", 10).is_err());
        // start past the end
        assert!(parse_range("bytes=10-", 10).is_err());
        // wrong unit
        assert!(parse_range("items=1-2", 10).is_err());
    }

    #[test]
    fn http_date_roundtrip() {
        let ms = 1_700_000_000_000i64;
        let formatted = http_date(ms);
        assert!(formatted.ends_with("GMT"));
        assert_eq!(parse_http_date(&formatted).unwrap() / 1000, ms / 1000);
    }
}
