use anyhow::{Context, Result};
use axum::Router;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use dotenvy::dotenv;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use briefcast::{db, handlers, scheduler, state::AppState};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let default_filter = if std::env::var("DEV_MODE").is_ok() { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let bind_addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        .parse()
        .context("BIND_ADDR must be host:port")?;

    let conn = db::open_db()?;
    let state = Arc::new(AppState::new(conn));

    tokio::spawn(scheduler::run_scheduler(Arc::clone(&state)));

    let cors = match std::env::var("ALLOWED_ORIGIN") {
        Ok(origin) if !origin.is_empty() => CorsLayer::new()
            .allow_origin(origin.parse::<HeaderValue>().context("ALLOWED_ORIGIN")?)
            .allow_methods(Any)
            .allow_headers(Any),
        _ => CorsLayer::new(),
    };

    let app = Router::new()
        // public
        .route("/health", get(handlers::admin::health))
        .route("/latest", get(handlers::runs::latest))
        .route("/runs/{run_id}/digest", get(handlers::runs::run_digest))
        // run introspection
        .route("/api/runs", get(handlers::runs::list_runs))
        .route("/api/runs/{run_id}", get(handlers::runs::get_run))
        .route("/api/runs/{run_id}/logs", get(handlers::runs::run_logs))
        .route("/api/runs/{run_id}/cancel", post(handlers::admin::cancel_run))
        // operator actions
        .route("/api/newsletters/{id}/run", post(handlers::admin::manual_run))
        .route("/api/newsletters/{id}/reset-seen", post(handlers::admin::reset_seen))
        .layer(cors)
        .with_state(state);

    info!("listening on http://{bind_addr}");
    let listener = TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("server crashed")
}
