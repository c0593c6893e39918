// src/server/api/mod.rs

//! The agent's thin HTTP surface. Every route exists to reach the
//! supervision core; the interesting behavior all lives below this
//! layer.

use super::context::ServerContext;
use crate::core::errors::{ErrorKind, HelmsmanError, track_unexpected};
use crate::core::metrics::gather_metrics;
use crate::core::state::AgentState;
use anyhow::Result;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

mod backups;
mod downloads;
mod files;
mod servers;
mod websocket;

/// Serves the API until SIGTERM/ctrl-c, then broadcasts shutdown to the
/// background tasks and drains them.
pub async fn serve(mut ctx: ServerContext) -> Result<()> {
    let state = ctx.state.clone();
    let config = state.config.get();

    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port).parse()?;
    let app = router(state);

    info!(%addr, "api server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("api server stopped, draining background tasks");
    let _ = ctx.shutdown_tx.send(());
    while let Some(result) = ctx.background_tasks.join_next().await {
        if let Err(err) = result {
            if err.is_panic() {
                error!(error = %err, "background task panicked during drain");
            }
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm.recv() => {}
    }
    info!("shutdown signal received");
}

/// Assembles the full route table.
pub fn router(state: Arc<AgentState>) -> Router {
    let authed = Router::new()
        .route("/api/system", get(system_handler))
        .route("/api/update", post(update_handler))
        .route(
            "/api/servers",
            get(servers::list_servers).post(servers::create_server),
        )
        .route(
            "/api/servers/{server}",
            get(servers::view_server).delete(servers::delete_server),
        )
        .route("/api/servers/{server}/sync", post(servers::sync_server))
        .route("/api/servers/{server}/power", post(servers::power_server))
        .route(
            "/api/servers/{server}/commands",
            post(servers::command_server),
        )
        .route("/api/servers/{server}/install", post(servers::install_server))
        .route(
            "/api/servers/{server}/reinstall",
            post(servers::reinstall_server),
        )
        .route("/api/servers/{server}/ws/deny", post(servers::deny_tokens))
        .route("/api/servers/{server}/logs", get(servers::server_logs))
        .route(
            "/api/servers/{server}/files/contents",
            get(files::read_contents),
        )
        .route(
            "/api/servers/{server}/files/list-directory",
            get(files::list_directory),
        )
        .route("/api/servers/{server}/files/rename", put(files::rename))
        .route("/api/servers/{server}/files/copy", post(files::copy))
        .route("/api/servers/{server}/files/write", post(files::write))
        .route(
            "/api/servers/{server}/files/create-directory",
            post(files::create_directory),
        )
        .route("/api/servers/{server}/files/delete", post(files::delete_files))
        .route("/api/servers/{server}/files/compress", post(files::compress))
        .route(
            "/api/servers/{server}/files/decompress",
            post(files::decompress),
        )
        .route("/api/servers/{server}/files/chmod", post(files::chmod))
        .route(
            "/api/servers/{server}/files/pull",
            get(files::list_pulls)
                .post(files::pull_file)
                .delete(files::abort_pull),
        )
        .route("/api/servers/{server}/backup", post(backups::create_backup))
        .route(
            "/api/servers/{server}/backup/{backup}/restore",
            post(backups::restore_backup),
        )
        .route(
            "/api/servers/{server}/backup/{backup}",
            delete(backups::delete_backup),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_node_token,
        ));

    Router::new()
        .route("/api/servers/{server}/ws", get(websocket::upgrade))
        .route("/download/backup", get(downloads::download_backup))
        .route("/download/file", get(downloads::download_file))
        .route("/metrics", get(metrics_handler))
        .merge(authed)
        .with_state(state)
}

/// Bearer authentication with the node credential pair; everything under
/// `/api` requires it.
async fn require_node_token(
    State(state): State<Arc<AgentState>>,
    request: Request,
    next: Next,
) -> Response {
    let config = state.config.get();
    let expected = format!("Bearer {}.{}", config.token_id, config.token);

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if presented != Some(expected.as_str()) {
        return ApiError::from(HelmsmanError::Token(
            crate::core::errors::TokenError::InvalidSignature,
        ))
        .into_response();
    }
    next.run(request).await
}

async fn system_handler(State(state): State<Arc<AgentState>>) -> Result<Response, ApiError> {
    let info = crate::core::system::collect(&state.docker).await?;
    Ok(Json(info).into_response())
}

/// Replaces the agent's runtime configuration, unless this node is
/// configured to ignore panel-pushed updates.
async fn update_handler(
    State(state): State<Arc<AgentState>>,
    Json(new_config): Json<crate::config::Config>,
) -> Result<Response, ApiError> {
    if state.config.get().ignore_panel_config_updates {
        return Ok(Json(json!({ "applied": false })).into_response());
    }
    new_config
        .validate()
        .map_err(|err| HelmsmanError::InvalidRequest(err.to_string()))?;
    state.config.replace(new_config);
    info!("runtime configuration replaced by panel update");
    Ok(Json(json!({ "applied": true })).into_response())
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}

/// The boundary where core errors become HTTP responses. Expected kinds
/// map to friendly 4xx messages; anything else is logged once under a
/// fresh UUID and returned as a generic 500.
pub struct ApiError(pub HelmsmanError);

impl From<HelmsmanError> for ApiError {
    fn from(err: HelmsmanError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self.0.kind() {
            ErrorKind::PathResolution | ErrorKind::NotExist => (
                StatusCode::NOT_FOUND,
                "The requested resource was not found on the system.".to_string(),
            ),
            ErrorKind::DenylistFile => (StatusCode::FORBIDDEN, self.0.to_string()),
            ErrorKind::IsDirectory
            | ErrorKind::UnknownArchive
            | ErrorKind::InternalResolution
            | ErrorKind::InvalidIpAddress
            | ErrorKind::DownloadFailed => (StatusCode::BAD_REQUEST, self.0.to_string()),
            ErrorKind::DiskSpace
            | ErrorKind::AlreadyExists
            | ErrorKind::Suspended
            | ErrorKind::IsRunning
            | ErrorKind::PowerActionInProgress
            | ErrorKind::Installing
            | ErrorKind::Transferring => (StatusCode::CONFLICT, self.0.to_string()),
            ErrorKind::Token => (StatusCode::UNAUTHORIZED, self.0.to_string()),
            ErrorKind::Other => match self.0 {
                HelmsmanError::ServerNotFound(_) => (
                    StatusCode::NOT_FOUND,
                    "The requested server was not found on this node.".to_string(),
                ),
                HelmsmanError::InvalidRequest(ref message) => {
                    (StatusCode::BAD_REQUEST, message.clone())
                }
                other => {
                    let id = track_unexpected(&anyhow::Error::new(other));
                    error!(error_id = %id, "request failed with unexpected error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("an unexpected error was encountered: {id}"),
                    )
                }
            },
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
