//! HTTP server implementation using Axum.

use crate::catalog::CommandCatalog;
use crate::config::BrokerConfig;
use crate::connection::ws_handler;
use crate::error::BrokerError;
use crate::registry::SessionInfo;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Serialize)]
struct TemplateResponse {
    key: String,
    command: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    active_sessions: usize,
    sessions: Vec<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Terminal channel
        .route("/ws", get(ws_handler))
        // Collaborator endpoints
        .route("/health", get(health))
        .route("/config", get(command_config))
        .route("/config/:key", get(command_template))
        // Session management
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", delete(delete_session))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Load the catalog, bind, and serve until Ctrl-C.
pub async fn run_server(config: BrokerConfig) -> Result<(), BrokerError> {
    let catalog = match &config.commands_file {
        Some(path) => CommandCatalog::load(path)?,
        None => CommandCatalog::default(),
    };
    let addr = config.bind_addr();
    let allowed = config.allowed_sessions.len() + catalog.systems.len();
    let state = AppState::new(config, catalog);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| BrokerError::Io {
            operation: "bind",
            source,
        })?;
    info!(allowed, "Starting terminal broker on {}", addr);

    serve(listener, state, ctrl_c()).await
}

/// Serve on an already bound listener; every session is destroyed once
/// `shutdown` resolves and open connections have closed.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<(), BrokerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = state.registry.clone();
    let notifier = state.clone();
    let app = router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            notifier.begin_shutdown();
        })
        .await
        .map_err(|source| BrokerError::Io {
            operation: "serve",
            source,
        })?;

    let destroyed = registry.destroy_all().await;
    info!(destroyed, "terminal broker stopped");
    Ok(())
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let sessions = state.registry.ids().await;
    Json(HealthResponse {
        status: "ok",
        active_sessions: sessions.len(),
        sessions,
    })
}

async fn command_config(State(state): State<AppState>) -> Json<CommandCatalog> {
    Json(state.catalog.as_ref().clone())
}

async fn command_template(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<TemplateResponse>, StatusCode> {
    let command = state.catalog.template(&key).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(TemplateResponse {
        command: command.to_string(),
        key,
    }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.list().await)
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    if state.registry.destroy(&id).await {
        info!("Deleted session: {}", id);
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
