//! annocollabd — collaboration server binary.

use std::sync::Arc;

use annocollabd::config::{Config, LogFormat};
use annocollabd::gateway::SessionGateway;
use annocollabd::state::AppState;
use annocollabd::{app, lifecycle};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    // Load .env if present (local dev).
    let _ = dotenvy::dotenv();

    let config = Config::from_env();

    // Tracing.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .with_target(true);
    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }

    info!("annocollabd starting");
    info!(listen = %config.listen_addr, frame_change_scope = ?config.frame_change_scope);

    // ── Persistence gateway ─────────────────────────────────
    let gateway = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.db_max_connections)
                .connect(url)
                .await
                .expect("failed to connect to Postgres");
            SessionGateway::Postgres(pool)
        }
        None => {
            warn!("DATABASE_URL not set, presence is kept in memory and lost on restart");
            SessionGateway::memory()
        }
    };

    info!("applying schema");
    gateway.migrate().await.expect("schema migration failed");
    info!("gateway ready");

    // ── Shared state ────────────────────────────────────────
    let state = AppState::new(gateway, config.clone());

    // ── Background tasks ────────────────────────────────────
    lifecycle::spawn_stale_session_sweeper(Arc::clone(&state));

    // ── Bind & serve ────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind");

    info!(addr = %config.listen_addr, "annocollabd listening");

    axum::serve(listener, app(state))
        .await
        .expect("server error");
}
