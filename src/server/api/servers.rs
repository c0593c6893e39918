// src/server/api/servers.rs

//! Server lifecycle endpoints: create, view, power, commands, install.

use super::ApiError;
use crate::core::server::{PowerAction, Server};
use crate::core::state::AgentState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn details(server: &Arc<Server>) -> serde_json::Value {
    json!({
        "uuid": server.uuid(),
        "state": server.phase().to_string(),
        "is_suspended": server.is_suspended(),
        "is_installing": server.is_installing(),
        "is_transferring": server.is_transferring(),
        "utilization": server.last_resource_usage(),
        "configuration": &*server.configuration(),
    })
}

pub async fn list_servers(State(state): State<Arc<AgentState>>) -> Response {
    let servers: Vec<_> = state.servers.all().iter().map(details).collect();
    Json(servers).into_response()
}

#[derive(Deserialize)]
pub struct CreateServerRequest {
    uuid: Uuid,
    #[serde(default)]
    start_on_completion: bool,
}

/// Registers a new server and starts its installation asynchronously.
pub async fn create_server(
    State(state): State<Arc<AgentState>>,
    Json(body): Json<CreateServerRequest>,
) -> Result<Response, ApiError> {
    state
        .servers
        .create(body.uuid, body.start_on_completion)
        .await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

pub async fn view_server(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    Ok(Json(details(&server)).into_response())
}

pub async fn delete_server(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
) -> Result<Response, ApiError> {
    state.servers.delete(server).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn sync_server(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
) -> Result<Response, ApiError> {
    state.servers.sync(server).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Deserialize)]
pub struct PowerRequest {
    action: PowerAction,
    /// Seconds the caller is willing to wait on the power lock.
    #[serde(default)]
    wait_seconds: Option<u64>,
}

/// Runs a power action in the background; the handler returns as soon as
/// the request is accepted.
pub async fn power_server(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
    Json(body): Json<PowerRequest>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    let timeout = body.wait_seconds.map(Duration::from_secs);

    tokio::spawn(async move {
        if let Err(err) = server.handle_power_action(body.action, timeout).await {
            tracing::warn!(
                server = %server.uuid(),
                action = %body.action,
                error = %err,
                "power action failed"
            );
        }
    });
    Ok(StatusCode::ACCEPTED.into_response())
}

#[derive(Deserialize)]
pub struct CommandsRequest {
    commands: Vec<String>,
}

pub async fn command_server(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
    Json(body): Json<CommandsRequest>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    for command in &body.commands {
        server.send_command(command).await?;
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn install_server(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    tokio::spawn(async move {
        if let Err(err) = server.install().await {
            tracing::warn!(server = %server.uuid(), error = %err, "installation failed");
        }
    });
    Ok(StatusCode::ACCEPTED.into_response())
}

pub async fn reinstall_server(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    tokio::spawn(async move {
        if let Err(err) = server.reinstall().await {
            tracing::warn!(server = %server.uuid(), error = %err, "reinstallation failed");
        }
    });
    Ok(StatusCode::ACCEPTED.into_response())
}

#[derive(Deserialize)]
pub struct DenyRequest {
    jtis: Vec<String>,
}

/// Panel-initiated token revocation for a server's websocket sessions.
pub async fn deny_tokens(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
    Json(body): Json<DenyRequest>,
) -> Result<Response, ApiError> {
    state.servers.get_or_err(server)?;
    state.validator.deny_jtis(&body.jtis);
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// The last lines the server wrote to its console.
pub async fn server_logs(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    Ok(Json(json!({ "data": server.recent_logs() })).into_response())
}
