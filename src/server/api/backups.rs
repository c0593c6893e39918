// src/server/api/backups.rs

//! Backup endpoints: create, restore, delete. Archives live in the
//! node's backup directory; serving them happens via signed URLs.

use super::ApiError;
use crate::core::state::AgentState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct CreateBackupRequest {
    uuid: Uuid,
}

/// Generates a backup in the background and returns immediately; the
/// outcome is announced on the server's bus as `backup completed`.
pub async fn create_backup(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
    Json(body): Json<CreateBackupRequest>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    let backups = state.backups.clone();

    tokio::spawn(async move {
        if let Err(err) = backups.create(&server, body.uuid).await {
            tracing::warn!(
                server = %server.uuid(),
                backup = %body.uuid,
                error = %err,
                "backup failed"
            );
        }
    });
    Ok(StatusCode::ACCEPTED.into_response())
}

pub async fn restore_backup(
    State(state): State<Arc<AgentState>>,
    Path((server, backup)): Path<(Uuid, Uuid)>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    state.backups.restore(&server, backup).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn delete_backup(
    State(state): State<Arc<AgentState>>,
    Path((server, backup)): Path<(Uuid, Uuid)>,
) -> Result<Response, ApiError> {
    state.servers.get_or_err(server)?;
    state.backups.delete(backup)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
