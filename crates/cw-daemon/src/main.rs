//! cw-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, recovers the engine
//! from Postgres, wires middleware, spawns the background tasks, and starts
//! the HTTP server.  All route handlers live in `routes.rs`; all shared
//! state types live in `state.rs`.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use cw_daemon::{routes, state};
use cw_db::PgStore;
use cw_engine::Engine;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    let loaded = cw_config::LoadedConfig::load(config_path_from_env().as_deref())
        .context("config assembly failed")?;

    init_tracing(&loaded.config.log_filter);
    info!(config_hash = %loaded.config_hash, "effective config loaded");

    let pool = cw_db::connect_from_env().await?;
    cw_db::migrate(&pool).await?;

    let store = Arc::new(PgStore::new(pool.clone()));
    let engine = Arc::new(
        Engine::recover(store, loaded.config.max_capacity)
            .await
            .context("engine recovery failed; refusing to serve")?,
    );

    let shared = Arc::new(state::AppState::new(
        Arc::clone(&engine),
        loaded.config.clone(),
        loaded.config_hash.clone(),
        Some(pool),
    ));

    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));
    state::spawn_retention_sweep(
        Arc::clone(&shared),
        Duration::from_secs(loaded.config.sweep_interval_secs),
        Duration::from_secs(loaded.config.track_retention_secs),
    );

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr: SocketAddr = loaded
        .config
        .bind_addr
        .parse()
        .context("bind_addr failed to parse")?;
    info!("cw-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("CW_CONFIG").ok().map(PathBuf::from)
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
