use std::net::SocketAddr;
use std::time::Duration;

use api_server::http::{self, AppState};
use shared::config::ApiConfig;
use shared::repos::Store;
use tracing::{error, info, warn};

const RATE_LIMIT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    if let Err(err) = dotenvy::dotenv()
        && !err.not_found()
    {
        eprintln!("failed to load .env: {err}");
    }

    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "api_server=debug,shared=debug,tower_http=info,axum=info".to_string()
        }))
        .init();

    let config = match ApiConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to read config: {err}");
            std::process::exit(1);
        }
    };

    let store = match Store::connect(&config.database_url, config.database_max_connections).await
    {
        Ok(store) => store,
        Err(err) => {
            error!("failed to open database: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = store.ensure_schema().await {
        error!("failed to create database schema: {err}");
        std::process::exit(1);
    }

    let state = match AppState::from_config(store, &config) {
        Ok(state) => state,
        Err(err) => {
            error!("failed to initialize completion provider: {err}");
            std::process::exit(1);
        }
    };

    if config.session_sweep_interval_seconds > 0 {
        state.sessions.spawn_sweeper(
            Duration::from_secs(config.session_sweep_interval_seconds),
            Duration::from_secs(config.session_max_age_seconds),
        );
    } else {
        warn!("session sweeper disabled");
    }
    state.rate_limiter.spawn_pruner(
        RATE_LIMIT_PRUNE_INTERVAL,
        Duration::from_secs(config.rate_limit_window_seconds),
    );

    let app = http::build_router(state);

    let addr: SocketAddr = match config.bind_addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!("invalid API_BIND_ADDR {}: {err}", config.bind_addr);
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {addr}: {err}");
            std::process::exit(1);
        }
    };

    info!(
        "api server listening on {}",
        listener.local_addr().unwrap_or(addr)
    );

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(err) = server.await {
        error!("server error: {err}");
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
