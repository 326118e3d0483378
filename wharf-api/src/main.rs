//! Server entrypoint
//!
//! Subcommands: `serve` (default), `initprovider`, `resetprovider`,
//! `revertprovider --to-version N`, `portable` (single-user service on
//! an in-memory provider) and `gen <completion|man>`. Exit codes:
//! 0 clean shutdown, 1 startup error, 2 misconfiguration.

use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use wharf_api::config::Config;
use wharf_api::state::AppState;
use wharf_common::Error;

fn config_path() -> Option<PathBuf> {
    std::env::var("SFTPGO_CONFIG_FILE")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            let default = PathBuf::from("wharf.toml");
            default.exists().then_some(default)
        })
}

fn load_config() -> Config {
    match Config::load(config_path().as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(2);
        }
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("serve");

    // `gen` writes static artifacts and needs no configuration.
    if command == "gen" {
        std::process::exit(gen(&args[1..]));
    }

    let config = load_config();
    let _log_guard = wharf_api::logging::init("info", None);

    let exit_code = match command {
        "serve" => serve(config).await,
        "portable" => portable(config).await,
        "initprovider" => init_provider(config).await,
        "resetprovider" => reset_provider(config).await,
        "revertprovider" => revert_provider(config, &args[1..]).await,
        other => {
            eprintln!("unknown command {:?}", other);
            2
        }
    };
    std::process::exit(exit_code);
}

async fn serve(config: Config) -> i32 {
    let state = match AppState::build(config).await {
        Ok(state) => state,
        Err(e) => {
            error!("startup failed: {}", e);
            return 1;
        }
    };
    run_server(state).await
}

/// Single-user throwaway service: an in-memory provider holding one
/// account built from `SFTPGO_PORTABLE__*` environment keys, then the
/// regular server loop. Nothing survives shutdown.
async fn portable(mut config: Config) -> i32 {
    config.data_provider.name = ":memory:".to_string();
    // In-memory SQLite is per-connection; the pool must hold one.
    config.data_provider.pool_size = 1;
    let state = match AppState::build(config).await {
        Ok(state) => state,
        Err(e) => {
            error!("startup failed: {}", e);
            return 1;
        }
    };
    if let Err(e) = setup_portable_user(&state).await {
        error!("portable setup failed: {}", e);
        return 1;
    }
    run_server(state).await
}

async fn setup_portable_user(state: &AppState) -> wharf_common::Result<()> {
    use wharf_api::provider::users::User;
    use wharf_common::Permission;

    let username =
        std::env::var("SFTPGO_PORTABLE__USERNAME").unwrap_or_else(|_| "user".to_string());
    let (password, generated) = match std::env::var("SFTPGO_PORTABLE__PASSWORD") {
        Ok(password) if !password.is_empty() => (password, false),
        _ => (wharf_api::util::random_string(12), true),
    };
    let home_dir = std::env::var("SFTPGO_PORTABLE__HOME_DIR")
        .ok()
        .filter(|d| !d.is_empty())
        .or_else(|| {
            std::env::current_dir()
                .ok()
                .map(|d| d.to_string_lossy().to_string())
        })
        .ok_or_else(|| Error::Validation("unable to determine a home directory".to_string()))?;

    let mut permissions = std::collections::HashMap::new();
    permissions.insert("/".to_string(), vec![Permission::Any]);
    let mut user = User {
        username: username.clone(),
        password: password.clone(),
        home_dir,
        permissions,
        ..Default::default()
    };
    state.provider.add_user(&mut user).await?;
    if generated {
        // The only place the generated credential is ever shown.
        println!("portable mode: user {:?}, password {:?}", username, password);
    }
    info!(user = %username, home = %user.home_dir, "portable user ready");
    Ok(())
}

async fn run_server(state: AppState) -> i32 {
    let bind_address = state.config.httpd.bind_address.clone();
    let bind_port = state.config.httpd.bind_port;
    let close_timeout = state.config.common.close_timeout_secs;

    let shutdown = CancellationToken::new();

    // Background services: connection maintenance and the event
    // scheduler.
    tokio::spawn(
        state
            .connections
            .clone()
            .run_maintenance(shutdown.clone()),
    );
    tokio::spawn(wharf_api::events::scheduler::run(
        state.events.clone(),
        shutdown.clone(),
    ));

    // SIGHUP reloads the connection whitelist.
    {
        let connections = state.connections.clone();
        tokio::spawn(async move {
            let Ok(mut hup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while hup.recv().await.is_some() {
                info!("SIGHUP received, reloading whitelist");
                connections.reload_whitelist();
            }
        });
    }

    let addr: SocketAddr = match format!("{}:{}", bind_address, bind_port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("invalid bind address: {}", e);
            return 2;
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("unable to bind {}: {}", addr, e);
            return 1;
        }
    };
    info!(address = %addr, "HTTP API listening");

    let router = wharf_api::httpd::router(state.clone());
    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown(shutdown.clone()));

    let result = server.await;

    // Stop accepting, cancel every connection, wait close_timeout,
    // then force-close.
    info!("shutting down, draining {} connections", state.connections.len());
    let drain = state.connections.close_all();
    if tokio::time::timeout(std::time::Duration::from_secs(close_timeout), drain)
        .await
        .is_err()
    {
        error!("drain timeout reached, forcing shutdown");
    }

    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("server error: {}", e);
            1
        }
    }
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    shutdown.cancel();
}

async fn init_provider(config: Config) -> i32 {
    match init_provider_inner(config).await {
        Ok(()) => {
            info!("data provider initialized");
            0
        }
        Err(e) => {
            error!("initprovider failed: {}", e);
            1
        }
    }
}

async fn init_provider_inner(config: Config) -> wharf_common::Result<()> {
    let pool =
        wharf_api::db::open(&config.data_provider.name, config.data_provider.pool_size).await?;
    wharf_api::db::migrate(&pool).await?;
    let kms = std::sync::Arc::new(wharf_api::kms::SecretBox::new(&config.kms)?);
    let provider =
        wharf_api::provider::DataProvider::new(pool, kms, config.data_provider.clone());
    provider.ensure_default_admin().await
}

async fn reset_provider(config: Config) -> i32 {
    let result: wharf_common::Result<()> = async {
        let pool = wharf_api::db::open(&config.data_provider.name, config.data_provider.pool_size)
            .await?;
        wharf_api::db::reset(&pool).await
    }
    .await;
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("resetprovider failed: {}", e);
            1
        }
    }
}

async fn revert_provider(config: Config, args: &[String]) -> i32 {
    let target = match parse_to_version(args) {
        Ok(target) => target,
        Err(e) => {
            eprintln!("{}", e);
            return 2;
        }
    };
    let result: wharf_common::Result<()> = async {
        let pool = wharf_api::db::open(&config.data_provider.name, config.data_provider.pool_size)
            .await?;
        wharf_api::db::revert(&pool, target).await
    }
    .await;
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("revertprovider failed: {}", e);
            1
        }
    }
}

fn parse_to_version(args: &[String]) -> Result<i64, Error> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--to-version" {
            return iter
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| Error::Validation("--to-version requires a number".to_string()));
        }
    }
    Err(Error::Validation(
        "revertprovider requires --to-version N".to_string(),
    ))
}

/// Static bash completion for the subcommand surface.
const COMPLETION_BASH: &str = r#"# bash completion for wharf-api
_wharf_api() {
    local cur prev commands
    cur="${COMP_WORDS[COMP_CWORD]}"
    prev="${COMP_WORDS[COMP_CWORD-1]}"
    commands="serve portable initprovider resetprovider revertprovider gen"
    case "${prev}" in
        gen)
            COMPREPLY=( $(compgen -W "completion man" -- "${cur}") )
            return 0
            ;;
        revertprovider)
            COMPREPLY=( $(compgen -W "--to-version" -- "${cur}") )
            return 0
            ;;
    esac
    if [ "${COMP_CWORD}" -eq 1 ]; then
        COMPREPLY=( $(compgen -W "${commands}" -- "${cur}") )
    fi
    return 0
}
complete -F _wharf_api wharf-api
"#;

/// Static man page, troff format.
const MAN_PAGE: &str = r#".TH WHARF-API 1 "" "wharf" "User Commands"
.SH NAME
wharf\-api \- managed file\-transfer control plane
.SH SYNOPSIS
.B wharf\-api
[\fIsubcommand\fR]
.SH DESCRIPTION
Runs the shared control core: data provider, virtual filesystem,
policy engine, event subsystem and the REST API.
.SH SUBCOMMANDS
.TP
.B serve
Start the service (default).
.TP
.B portable
Start a single\-user service on an in\-memory provider. The account is
taken from the SFTPGO_PORTABLE__USERNAME, SFTPGO_PORTABLE__PASSWORD and
SFTPGO_PORTABLE__HOME_DIR environment keys; a missing password is
generated and printed once.
.TP
.B initprovider
Create or migrate the data provider, then exit.
.TP
.B resetprovider
Remove every table from the data provider, then exit.
.TP
.B revertprovider \-\-to\-version N
Revert the provider schema to version N, then exit.
.TP
.B gen completion|man
Write the shell completion script or this page to standard output.
.SH ENVIRONMENT
Configuration keys are overridden by variables of shape
SFTPGO_<SECTION>__<SUB>__<FIELD>; SFTPGO_CONFIG_FILE names the TOML
configuration file.
.SH EXIT STATUS
0 on clean shutdown, 1 on startup errors, 2 on misconfiguration.
"#;

/// `gen <completion|man>`: emit static artifacts; there is no CLI
/// framework to derive them from.
fn gen(args: &[String]) -> i32 {
    match args.first().map(String::as_str) {
        Some("completion") => {
            print!("{}", COMPLETION_BASH);
            0
        }
        Some("man") => {
            print!("{}", MAN_PAGE);
            0
        }
        other => {
            eprintln!(
                "gen requires \"completion\" or \"man\", got {:?}",
                other.unwrap_or("nothing")
            );
            2
        }
    }
}
