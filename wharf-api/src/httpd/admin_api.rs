//! Admin REST API
//!
//! CRUD over users, admins, groups, roles, folders, API keys, event
//! actions and event rules. Role admins operate inside their role
//! scope.

use super::auth::{self, AuthedAdmin};
use crate::error::{ApiError, ApiResult};
use crate::events::actions::EventAction;
use crate::events::rules::EventRule;
use crate::events::EventContext;
use crate::provider::{
    admins, apikeys, events as event_store, folders, groups, roles, shares, Admin, ApiKey,
    BaseVirtualFolder, Group, Role, User,
};
use crate::state::AppState;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::net::SocketAddr;
use wharf_common::Error;

/// Common list parameters: `limit` (≤500), `offset`, `order`.
#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub order: Option<String>,
}

fn default_limit() -> i64 {
    100
}

impl ListParams {
    pub fn normalize(&self) -> ApiResult<(i64, i64, bool)> {
        if self.limit < 1 || self.limit > 500 {
            return Err(ApiError(Error::Validation(
                "limit must be between 1 and 500".to_string(),
            )));
        }
        if self.offset < 0 {
            return Err(ApiError(Error::Validation(
                "offset cannot be negative".to_string(),
            )));
        }
        let ascending = match self.order.as_deref() {
            None | Some("ASC") => true,
            Some("DESC") => false,
            Some(other) => {
                return Err(ApiError(Error::Validation(format!(
                    "invalid order {:?}",
                    other
                ))))
            }
        };
        Ok((self.limit, self.offset, ascending))
    }
}

/// 201 with `Location` and `X-Object-ID` headers.
fn created(location: &str, object_id: &str) -> Response {
    let mut response = StatusCode::CREATED.into_response();
    if let Ok(value) = axum::http::HeaderValue::from_str(location) {
        response
            .headers_mut()
            .insert(axum::http::header::LOCATION, value);
    }
    if let Ok(value) = axum::http::HeaderValue::from_str(object_id) {
        response.headers_mut().insert("X-Object-ID", value);
    }
    response
}

async fn admin_auth(
    state: &AppState,
    headers: &HeaderMap,
    addr: SocketAddr,
    perm: crate::provider::AdminPermission,
) -> ApiResult<AuthedAdmin> {
    let authed = auth::authenticate_admin(state, headers, addr.ip()).await?;
    authed.require(perm)?;
    Ok(authed)
}

use crate::provider::AdminPermission as Perm;

// ----- users -----

pub async fn list_users(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<User>>> {
    let authed = admin_auth(&state, &headers, addr, Perm::ViewUsers).await?;
    let (limit, offset, ascending) = params.normalize()?;
    let mut users = state
        .provider
        .list_users(limit, offset, ascending, authed.visible_role())
        .await?;
    for user in &mut users {
        user.prepare_for_rendering();
    }
    Ok(Json(users))
}

pub async fn get_user(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> ApiResult<Json<User>> {
    let authed = admin_auth(&state, &headers, addr, Perm::ViewUsers).await?;
    let mut user = state.provider.get_user(&username).await?;
    if !authed.can_see_user(&user) {
        return Err(ApiError(Error::NotFound(format!("user {:?}", username))));
    }
    user.prepare_for_rendering();
    Ok(Json(user))
}

pub async fn add_user(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(mut user): Json<User>,
) -> ApiResult<Response> {
    let authed = admin_auth(&state, &headers, addr, Perm::AddUsers).await?;
    // A role admin creates users inside its role and its declared
    // default groups.
    if let Some(role) = authed.visible_role() {
        user.role = role.to_string();
        for mapping in &authed.admin.groups {
            if !user.groups.iter().any(|g| g.name == mapping.name) {
                user.groups.push(crate::provider::users::GroupMembership {
                    name: mapping.name.clone(),
                    group_type: mapping.add_to_users_as,
                });
            }
        }
    }
    // `%password%` resolves in home_dir at creation time only.
    if !user.password.is_empty() && user.home_dir.contains("%password%") {
        user.home_dir = user.home_dir.replace("%password%", &user.password);
    }
    state.provider.add_user(&mut user).await?;
    state.events.emit_provider_event(EventContext::provider(
        "add",
        "user",
        &user.username,
        &authed.admin.username,
    ));
    Ok(created(
        &format!("/api/v2/users/{}", user.username),
        &user.username,
    ))
}

pub async fn update_user(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(username): Path<String>,
    Json(mut user): Json<User>,
) -> ApiResult<Json<serde_json::Value>> {
    let authed = admin_auth(&state, &headers, addr, Perm::EditUsers).await?;
    let existing = state.provider.get_user(&username).await?;
    if !authed.can_see_user(&existing) {
        return Err(ApiError(Error::NotFound(format!("user {:?}", username))));
    }
    user.username = existing.username.clone();
    user.id = existing.id;
    if authed.visible_role().is_some() {
        user.role = existing.role.clone();
    }
    if user.password.is_empty() {
        user.password = existing.password.clone();
    }
    user.filesystem.preserve_redacted(&existing.filesystem);
    // Redacted 2FA material means "keep what is stored".
    match (&mut user.filters.totp_config, &existing.filters.totp_config) {
        (Some(incoming), Some(stored)) if incoming.secret.is_redacted() => {
            incoming.secret = stored.secret.clone();
        }
        _ => {}
    }
    let all_codes_redacted = !user.filters.recovery_codes.is_empty()
        && user
            .filters
            .recovery_codes
            .iter()
            .all(|c| c.secret.is_redacted());
    if all_codes_redacted {
        user.filters.recovery_codes = existing.filters.recovery_codes.clone();
    }
    // Usage counters are managed by the quota paths.
    user.used_quota_files = existing.used_quota_files;
    user.used_quota_size = existing.used_quota_size;
    user.used_upload_data_transfer = existing.used_upload_data_transfer;
    user.used_download_data_transfer = existing.used_download_data_transfer;
    state
        .provider
        .update_user(&mut user, existing.updated_at)
        .await?;
    state.events.emit_provider_event(EventContext::provider(
        "update",
        "user",
        &username,
        &authed.admin.username,
    ));
    Ok(Json(serde_json::json!({"message": "user updated"})))
}

pub async fn delete_user(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let authed = admin_auth(&state, &headers, addr, Perm::DelUsers).await?;
    let existing = state.provider.get_user(&username).await?;
    if !authed.can_see_user(&existing) {
        return Err(ApiError(Error::NotFound(format!("user {:?}", username))));
    }
    state.provider.delete_user(&username).await?;
    state.tokens.invalidate_principal(&username);
    state.events.emit_provider_event(EventContext::provider(
        "delete",
        "user",
        &username,
        &authed.admin.username,
    ));
    Ok(Json(serde_json::json!({"message": "user deleted"})))
}

// ----- admins -----

pub async fn list_admins(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<Admin>>> {
    admin_auth(&state, &headers, addr, Perm::ManageAdmins).await?;
    let (limit, offset, ascending) = params.normalize()?;
    let mut admins = admins::list_admins(state.provider.pool(), limit, offset, ascending).await?;
    for admin in &mut admins {
        admin.prepare_for_rendering();
    }
    Ok(Json(admins))
}

pub async fn get_admin(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> ApiResult<Json<Admin>> {
    admin_auth(&state, &headers, addr, Perm::ManageAdmins).await?;
    let mut admin = admins::get_admin(state.provider.pool(), &username).await?;
    admin.prepare_for_rendering();
    Ok(Json(admin))
}

pub async fn add_admin(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(mut admin): Json<Admin>,
) -> ApiResult<Response> {
    let authed = admin_auth(&state, &headers, addr, Perm::ManageAdmins).await?;
    if admin.password.is_empty() {
        return Err(ApiError(Error::Validation(
            "field \"password\" is required".to_string(),
        )));
    }
    crate::validation::validate_password(&admin.password)?;
    admin.password = crate::provider::hash_password(&admin.password)?;
    admin.validate(state.provider.kms())?;
    admins::add_admin(state.provider.pool(), &admin).await?;
    state.events.emit_provider_event(EventContext::provider(
        "add",
        "admin",
        &admin.username,
        &authed.admin.username,
    ));
    Ok(created(
        &format!("/api/v2/admins/{}", admin.username),
        &admin.username,
    ))
}

pub async fn update_admin(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(username): Path<String>,
    Json(mut admin): Json<Admin>,
) -> ApiResult<Json<serde_json::Value>> {
    let authed = admin_auth(&state, &headers, addr, Perm::ManageAdmins).await?;
    let existing = admins::get_admin(state.provider.pool(), &username).await?;
    admin.username = existing.username.clone();
    admin.id = existing.id;
    // An admin cannot disable itself or drop its own critical
    // permissions.
    if authed.admin.username == username {
        if admin.status != crate::provider::UserStatus::Active {
            return Err(ApiError(Error::Validation(
                "you cannot disable yourself".to_string(),
            )));
        }
        if !admin.has_permission(Perm::ManageAdmins) {
            return Err(ApiError(Error::Validation(
                "you cannot remove your own admin-management permission".to_string(),
            )));
        }
        if admin.role != existing.role {
            return Err(ApiError(Error::Validation(
                "you cannot change your own role".to_string(),
            )));
        }
    }
    if admin.password.is_empty() {
        admin.password = existing.password.clone();
    } else if !admin.password.starts_with('$') {
        admin.password = crate::provider::hash_password(&admin.password)?;
    }
    match (&mut admin.filters.totp_config, &existing.filters.totp_config) {
        (Some(incoming), Some(stored)) if incoming.secret.is_redacted() => {
            incoming.secret = stored.secret.clone();
        }
        _ => {}
    }
    let all_codes_redacted = !admin.filters.recovery_codes.is_empty()
        && admin
            .filters
            .recovery_codes
            .iter()
            .all(|c| c.secret.is_redacted());
    if all_codes_redacted {
        admin.filters.recovery_codes = existing.filters.recovery_codes.clone();
    }
    admin.validate(state.provider.kms())?;
    admins::update_admin(state.provider.pool(), &admin, existing.updated_at).await?;
    state.events.emit_provider_event(EventContext::provider(
        "update",
        "admin",
        &username,
        &authed.admin.username,
    ));
    Ok(Json(serde_json::json!({"message": "admin updated"})))
}

pub async fn delete_admin(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let authed = admin_auth(&state, &headers, addr, Perm::ManageAdmins).await?;
    if authed.admin.username == username {
        return Err(ApiError(Error::Validation(
            "you cannot delete yourself".to_string(),
        )));
    }
    if admins::count_admins(state.provider.pool()).await? <= 1 {
        return Err(ApiError(Error::Validation(
            "the last administrator cannot be removed".to_string(),
        )));
    }
    admins::delete_admin(state.provider.pool(), &username).await?;
    state.tokens.invalidate_principal(&username);
    state.events.emit_provider_event(EventContext::provider(
        "delete",
        "admin",
        &username,
        &authed.admin.username,
    ));
    Ok(Json(serde_json::json!({"message": "admin deleted"})))
}

// ----- groups -----

pub async fn list_groups(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<Group>>> {
    admin_auth(&state, &headers, addr, Perm::ManageGroups).await?;
    let (limit, offset, ascending) = params.normalize()?;
    let mut groups = groups::list_groups(state.provider.pool(), limit, offset, ascending).await?;
    for group in &mut groups {
        group.prepare_for_rendering();
    }
    Ok(Json(groups))
}

pub async fn get_group(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<Group>> {
    admin_auth(&state, &headers, addr, Perm::ManageGroups).await?;
    let mut group = groups::get_group(state.provider.pool(), &name).await?;
    group.prepare_for_rendering();
    Ok(Json(group))
}

pub async fn add_group(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(mut group): Json<Group>,
) -> ApiResult<Response> {
    let authed = admin_auth(&state, &headers, addr, Perm::ManageGroups).await?;
    group.validate(state.provider.kms())?;
    groups::add_group(state.provider.pool(), &group).await?;
    state.events.emit_provider_event(EventContext::provider(
        "add",
        "group",
        &group.name,
        &authed.admin.username,
    ));
    Ok(created(
        &format!("/api/v2/groups/{}", group.name),
        &group.name,
    ))
}

pub async fn update_group(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(mut group): Json<Group>,
) -> ApiResult<Json<serde_json::Value>> {
    let authed = admin_auth(&state, &headers, addr, Perm::ManageGroups).await?;
    let existing = groups::get_group(state.provider.pool(), &name).await?;
    group.name = existing.name.clone();
    group.id = existing.id;
    group
        .user_settings
        .filesystem
        .preserve_redacted(&existing.user_settings.filesystem);
    group.validate(state.provider.kms())?;
    state
        .provider
        .update_group(&mut group, existing.updated_at)
        .await?;
    state.events.emit_provider_event(EventContext::provider(
        "update",
        "group",
        &name,
        &authed.admin.username,
    ));
    Ok(Json(serde_json::json!({"message": "group updated"})))
}

pub async fn delete_group(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let authed = admin_auth(&state, &headers, addr, Perm::ManageGroups).await?;
    state.provider.delete_group(&name).await?;
    state.events.emit_provider_event(EventContext::provider(
        "delete",
        "group",
        &name,
        &authed.admin.username,
    ));
    Ok(Json(serde_json::json!({"message": "group deleted"})))
}

// ----- roles -----

pub async fn list_roles(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<Role>>> {
    admin_auth(&state, &headers, addr, Perm::ManageRoles).await?;
    let (limit, offset, ascending) = params.normalize()?;
    Ok(Json(
        roles::list_roles(state.provider.pool(), limit, offset, ascending).await?,
    ))
}

pub async fn get_role(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<Role>> {
    admin_auth(&state, &headers, addr, Perm::ManageRoles).await?;
    Ok(Json(roles::get_role(state.provider.pool(), &name).await?))
}

pub async fn add_role(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(role): Json<Role>,
) -> ApiResult<Response> {
    admin_auth(&state, &headers, addr, Perm::ManageRoles).await?;
    role.validate()?;
    roles::add_role(state.provider.pool(), &role).await?;
    Ok(created(&format!("/api/v2/roles/{}", role.name), &role.name))
}

pub async fn update_role(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(mut role): Json<Role>,
) -> ApiResult<Json<serde_json::Value>> {
    admin_auth(&state, &headers, addr, Perm::ManageRoles).await?;
    let existing = roles::get_role(state.provider.pool(), &name).await?;
    role.name = existing.name.clone();
    role.id = existing.id;
    roles::update_role(state.provider.pool(), &role, existing.updated_at).await?;
    Ok(Json(serde_json::json!({"message": "role updated"})))
}

pub async fn delete_role(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    admin_auth(&state, &headers, addr, Perm::ManageRoles).await?;
    roles::delete_role(state.provider.pool(), &name).await?;
    Ok(Json(serde_json::json!({"message": "role deleted"})))
}

// ----- folders -----

pub async fn list_folders(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<BaseVirtualFolder>>> {
    admin_auth(&state, &headers, addr, Perm::ManageFolders).await?;
    let (limit, offset, ascending) = params.normalize()?;
    let mut folders =
        folders::list_folders(state.provider.pool(), limit, offset, ascending).await?;
    for folder in &mut folders {
        folder.filesystem.redact();
    }
    Ok(Json(folders))
}

pub async fn get_folder(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<BaseVirtualFolder>> {
    admin_auth(&state, &headers, addr, Perm::ManageFolders).await?;
    let mut folder = folders::get_folder(state.provider.pool(), &name).await?;
    folder.filesystem.redact();
    Ok(Json(folder))
}

pub async fn add_folder(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(mut folder): Json<BaseVirtualFolder>,
) -> ApiResult<Response> {
    admin_auth(&state, &headers, addr, Perm::ManageFolders).await?;
    folder.validate(state.provider.kms())?;
    folders::add_folder(state.provider.pool(), &folder).await?;
    Ok(created(
        &format!("/api/v2/folders/{}", folder.name),
        &folder.name,
    ))
}

pub async fn update_folder(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(mut folder): Json<BaseVirtualFolder>,
) -> ApiResult<Json<serde_json::Value>> {
    admin_auth(&state, &headers, addr, Perm::ManageFolders).await?;
    let existing = folders::get_folder(state.provider.pool(), &name).await?;
    folder.name = existing.name.clone();
    folder.id = existing.id;
    folder.filesystem.preserve_redacted(&existing.filesystem);
    folder.validate(state.provider.kms())?;
    folders::update_folder(state.provider.pool(), &folder).await?;
    Ok(Json(serde_json::json!({"message": "folder updated"})))
}

pub async fn delete_folder(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    admin_auth(&state, &headers, addr, Perm::ManageFolders).await?;
    state.provider.delete_folder(&name).await?;
    Ok(Json(serde_json::json!({"message": "folder deleted"})))
}

// ----- API keys -----

pub async fn list_api_keys(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<ApiKey>>> {
    admin_auth(&state, &headers, addr, Perm::ManageApiKeys).await?;
    let (limit, offset, ascending) = params.normalize()?;
    let mut keys = apikeys::list_api_keys(state.provider.pool(), limit, offset, ascending).await?;
    for key in &mut keys {
        key.key_hash = String::new();
    }
    Ok(Json(keys))
}

pub async fn add_api_key(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(mut key): Json<ApiKey>,
) -> ApiResult<Response> {
    admin_auth(&state, &headers, addr, Perm::ManageApiKeys).await?;
    let new_key = state.provider.add_api_key(&mut key).await?;
    let mut response = created(&format!("/api/v2/apikeys/{}", new_key.id), &new_key.id);
    *response.status_mut() = StatusCode::CREATED;
    let body = serde_json::to_vec(&new_key).unwrap_or_default();
    *response.body_mut() = axum::body::Body::from(body);
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

pub async fn get_api_key(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> ApiResult<Json<ApiKey>> {
    admin_auth(&state, &headers, addr, Perm::ManageApiKeys).await?;
    let mut key = apikeys::get_api_key(state.provider.pool(), &key_id).await?;
    key.key_hash = String::new();
    Ok(Json(key))
}

pub async fn delete_api_key(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    admin_auth(&state, &headers, addr, Perm::ManageApiKeys).await?;
    apikeys::delete_api_key(state.provider.pool(), &key_id).await?;
    Ok(Json(serde_json::json!({"message": "API key deleted"})))
}

// ----- event actions -----

pub async fn list_event_actions(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<EventAction>>> {
    admin_auth(&state, &headers, addr, Perm::ManageEventRules).await?;
    let (limit, offset, ascending) = params.normalize()?;
    Ok(Json(
        event_store::list_actions(state.provider.pool(), limit, offset, ascending).await?,
    ))
}

pub async fn get_event_action(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<EventAction>> {
    admin_auth(&state, &headers, addr, Perm::ManageEventRules).await?;
    Ok(Json(
        event_store::get_action(state.provider.pool(), &name).await?,
    ))
}

pub async fn add_event_action(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(action): Json<EventAction>,
) -> ApiResult<Response> {
    admin_auth(&state, &headers, addr, Perm::ManageEventRules).await?;
    action.validate()?;
    event_store::add_action(state.provider.pool(), &action).await?;
    Ok(created(
        &format!("/api/v2/eventactions/{}", action.name),
        &action.name,
    ))
}

pub async fn update_event_action(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(mut action): Json<EventAction>,
) -> ApiResult<Json<serde_json::Value>> {
    admin_auth(&state, &headers, addr, Perm::ManageEventRules).await?;
    action.name = name;
    action.validate()?;
    event_store::update_action(state.provider.pool(), &action).await?;
    Ok(Json(serde_json::json!({"message": "event action updated"})))
}

pub async fn delete_event_action(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    admin_auth(&state, &headers, addr, Perm::ManageEventRules).await?;
    event_store::delete_action(state.provider.pool(), &name).await?;
    Ok(Json(serde_json::json!({"message": "event action deleted"})))
}

// ----- event rules -----

pub async fn list_event_rules(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<EventRule>>> {
    admin_auth(&state, &headers, addr, Perm::ManageEventRules).await?;
    let (limit, offset, ascending) = params.normalize()?;
    Ok(Json(
        event_store::list_all_rules(state.provider.pool(), limit, offset, ascending).await?,
    ))
}

pub async fn get_event_rule(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<EventRule>> {
    admin_auth(&state, &headers, addr, Perm::ManageEventRules).await?;
    Ok(Json(
        event_store::get_rule(state.provider.pool(), &name).await?,
    ))
}

pub async fn add_event_rule(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(mut rule): Json<EventRule>,
) -> ApiResult<Response> {
    admin_auth(&state, &headers, addr, Perm::ManageEventRules).await?;
    rule.validate()?;
    event_store::add_rule(state.provider.pool(), &rule).await?;
    Ok(created(
        &format!("/api/v2/eventrules/{}", rule.name),
        &rule.name,
    ))
}

pub async fn update_event_rule(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(mut rule): Json<EventRule>,
) -> ApiResult<Json<serde_json::Value>> {
    admin_auth(&state, &headers, addr, Perm::ManageEventRules).await?;
    let existing = event_store::get_rule(state.provider.pool(), &name).await?;
    rule.name = existing.name.clone();
    rule.id = existing.id;
    rule.validate()?;
    event_store::update_rule(state.provider.pool(), &rule).await?;
    Ok(Json(serde_json::json!({"message": "event rule updated"})))
}

pub async fn delete_event_rule(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    admin_auth(&state, &headers, addr, Perm::ManageEventRules).await?;
    event_store::delete_rule(state.provider.pool(), &name).await?;
    Ok(Json(serde_json::json!({"message": "event rule deleted"})))
}

// ----- user shares (admin view) -----

pub async fn list_user_shares(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(username): Path<String>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<crate::provider::Share>>> {
    admin_auth(&state, &headers, addr, Perm::ViewUsers).await?;
    let (limit, offset, ascending) = params.normalize()?;
    let mut result =
        shares::list_shares_for_user(state.provider.pool(), &username, limit, offset, ascending)
            .await?;
    for share in &mut result {
        share.password = String::new();
    }
    Ok(Json(result))
}
