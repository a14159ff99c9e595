use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::{self, AppState, SharedState};
use crate::auth;
use crate::config::Config;
use crate::db::{Database, DbHandle};
use crate::deploy::Deployer;
use crate::engine::DockerEngine;

/// Build the full application router: API routes, auth pages, tracing.
pub fn build_router(state: SharedState) -> Router {
    let dev_mode = state.config.is_development();
    let router = api::api_router(state.clone())
        .merge(auth::router(state.clone()))
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if dev_mode {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Start the server and run until ctrl-c.
pub async fn start(config: Config) -> Result<()> {
    let db = Database::new(std::path::Path::new(&config.db_connection))
        .context("Failed to initialize database")?;
    let db = DbHandle::new(db);

    let engine = DockerEngine::connect().context("Failed to connect to container engine")?;

    std::fs::create_dir_all(&config.build_root).context("Failed to create build directory")?;
    let deployer = Deployer::new(
        db.clone(),
        Arc::new(engine),
        config.base_domain.clone(),
        config.build_root.clone(),
    );

    let port = config.port;
    let state = Arc::new(AppState {
        db,
        config,
        deployer,
    });
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!("deeploy listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("shutting down");
}
