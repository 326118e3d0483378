//! HTTP API
//!
//! The JSON REST surface under `/api/v2`, assembled from the per-area
//! handler modules. Every request passes the defender gate; handlers
//! authenticate through the token service or API keys.

pub mod admin_api;
pub mod auth;
pub mod maintenance;
pub mod shares_api;
pub mod tokenapi;
pub mod user_files;

use crate::state::AppState;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        // tokens and sessions
        .route("/token", get(tokenapi::admin_token))
        .route("/logout", get(tokenapi::admin_logout))
        .route("/user/token", get(tokenapi::user_token))
        .route("/user/logout", get(tokenapi::user_logout))
        // admin self-service
        .route("/admin/changepwd", put(tokenapi::admin_change_password))
        .route(
            "/admin/profile",
            get(tokenapi::admin_profile).put(tokenapi::update_admin_profile),
        )
        .route(
            "/admin/2fa/totp/generate",
            post(tokenapi::admin_totp_generate),
        )
        .route("/admin/2fa/totp/save", post(tokenapi::admin_totp_save))
        .route(
            "/admin/2fa/recoverycodes",
            get(tokenapi::admin_recovery_codes),
        )
        // user self-service
        .route(
            "/user/profile",
            get(tokenapi::user_profile).put(tokenapi::update_user_profile),
        )
        .route("/user/changepwd", put(tokenapi::user_change_password))
        .route("/user/2fa/totp/configs", get(tokenapi::totp_config_names))
        .route("/user/2fa/totp/generate", post(tokenapi::user_totp_generate))
        .route("/user/2fa/totp/validate", post(tokenapi::user_totp_validate))
        .route("/user/2fa/totp/save", post(tokenapi::user_totp_save))
        .route("/user/2fa/totp", delete(tokenapi::user_totp_disable))
        .route(
            "/user/2fa/recoverycodes",
            get(tokenapi::user_recovery_codes).post(tokenapi::user_consume_recovery_code),
        )
        // user filesystem
        .route(
            "/user/dirs",
            get(user_files::list_dir)
                .post(user_files::make_dir)
                .delete(user_files::remove_dir),
        )
        .route(
            "/user/files",
            get(user_files::download_file)
                .post(user_files::upload_files)
                .delete(user_files::delete_file),
        )
        .route("/user/files/move", post(user_files::move_file))
        // user shares
        .route(
            "/user/shares",
            get(shares_api::list_my_shares).post(shares_api::add_share),
        )
        .route(
            "/user/shares/:id",
            get(shares_api::get_my_share)
                .put(shares_api::update_my_share)
                .delete(shares_api::delete_my_share),
        )
        // public share access
        .route(
            "/shares/:id",
            get(shares_api::read_share).post(shares_api::write_share),
        )
        // provider entities
        .route(
            "/users",
            get(admin_api::list_users).post(admin_api::add_user),
        )
        .route(
            "/users/:username",
            get(admin_api::get_user)
                .put(admin_api::update_user)
                .delete(admin_api::delete_user),
        )
        .route(
            "/users/:username/shares",
            get(admin_api::list_user_shares),
        )
        .route(
            "/admins",
            get(admin_api::list_admins).post(admin_api::add_admin),
        )
        .route(
            "/admins/:username",
            get(admin_api::get_admin)
                .put(admin_api::update_admin)
                .delete(admin_api::delete_admin),
        )
        .route(
            "/groups",
            get(admin_api::list_groups).post(admin_api::add_group),
        )
        .route(
            "/groups/:name",
            get(admin_api::get_group)
                .put(admin_api::update_group)
                .delete(admin_api::delete_group),
        )
        .route(
            "/roles",
            get(admin_api::list_roles).post(admin_api::add_role),
        )
        .route(
            "/roles/:name",
            get(admin_api::get_role)
                .put(admin_api::update_role)
                .delete(admin_api::delete_role),
        )
        .route(
            "/folders",
            get(admin_api::list_folders).post(admin_api::add_folder),
        )
        .route(
            "/folders/:name",
            get(admin_api::get_folder)
                .put(admin_api::update_folder)
                .delete(admin_api::delete_folder),
        )
        .route(
            "/apikeys",
            get(admin_api::list_api_keys).post(admin_api::add_api_key),
        )
        .route(
            "/apikeys/:id",
            get(admin_api::get_api_key).delete(admin_api::delete_api_key),
        )
        // events
        .route(
            "/eventactions",
            get(admin_api::list_event_actions).post(admin_api::add_event_action),
        )
        .route(
            "/eventactions/:name",
            get(admin_api::get_event_action)
                .put(admin_api::update_event_action)
                .delete(admin_api::delete_event_action),
        )
        .route(
            "/eventrules",
            get(admin_api::list_event_rules).post(admin_api::add_event_rule),
        )
        .route(
            "/eventrules/:name",
            get(admin_api::get_event_rule)
                .put(admin_api::update_event_rule)
                .delete(admin_api::delete_event_rule),
        )
        .route("/events/fs", get(maintenance::search_events))
        .route("/events/provider", get(maintenance::search_events))
        // operations
        .route("/connections", get(maintenance::list_connections))
        .route(
            "/connections/:id",
            delete(maintenance::close_connection),
        )
        .route(
            "/quotas/users/scans",
            get(maintenance::list_quota_scans),
        )
        .route(
            "/quotas/users/:username/scan",
            post(maintenance::start_user_quota_scan),
        )
        .route(
            "/quotas/users/:username/usage",
            put(maintenance::update_user_quota_usage),
        )
        .route(
            "/quotas/folders/:name/usage",
            put(maintenance::update_folder_quota_usage),
        )
        .route(
            "/retention/users/:username/check",
            post(maintenance::start_retention_check),
        )
        .route(
            "/metadata/users/:username/check",
            post(maintenance::start_metadata_check),
        )
        .route("/defender/hosts", get(maintenance::list_defender_hosts))
        .route(
            "/defender/hosts/:id",
            get(maintenance::get_defender_host).delete(maintenance::delete_defender_host),
        )
        .route("/dumpdata", get(maintenance::dump_data))
        .route("/loaddata", post(maintenance::load_data))
        .route("/status", get(maintenance::get_status))
        .route("/version", get(maintenance::get_version));

    Router::new()
        .nest("/api/v2", api)
        .route("/healthz", get(maintenance::healthz))
        .route("/robots.txt", get(maintenance::robots))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::defender_gate,
        ))
        // Upload sizes are governed by quota and per-file limits, not
        // by the framework's body cap.
        .layer(axum::extract::DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
