// src/server/api/downloads.rs

//! Signed-URL endpoints. These carry no bearer authentication: the
//! one-time token in the query string is the whole credential, and its
//! nonce guarantees a URL works exactly once.

use super::ApiError;
use crate::core::errors::{HelmsmanError, TokenError};
use crate::core::state::AgentState;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

#[derive(Deserialize)]
pub struct SignedQuery {
    token: String,
}

/// A consumed one-time URL behaves as if the resource were gone, rather
/// than advertising that the token was ever valid.
fn consume(state: &AgentState, token: &str) -> Result<crate::core::token::Claims, ApiError> {
    state.validator.validate_one_time(token).map_err(|err| {
        if err == TokenError::NonceSeen {
            ApiError(HelmsmanError::NotExist)
        } else {
            ApiError(HelmsmanError::Token(err))
        }
    })
}

/// Serves a backup archive for a one-time token carrying its UUID.
pub async fn download_backup(
    State(state): State<Arc<AgentState>>,
    Query(query): Query<SignedQuery>,
) -> Result<Response, ApiError> {
    let claims = consume(&state, &query.token)?;
    let backup = claims
        .backup_uuid
        .ok_or(HelmsmanError::Token(TokenError::MissingField("backup_uuid")))?;

    let info = state.backups.locate(backup)?;
    let file = tokio::fs::File::open(&info.path)
        .await
        .map_err(|_| HelmsmanError::NotExist)?;

    Ok((
        [
            (header::CONTENT_TYPE, info.mimetype.to_string()),
            (header::CONTENT_LENGTH, info.size.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}.tar.gz", info.uuid),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// Serves a single server file for a one-time token carrying its path.
pub async fn download_file(
    State(state): State<Arc<AgentState>>,
    Query(query): Query<SignedQuery>,
) -> Result<Response, ApiError> {
    let claims = consume(&state, &query.token)?;
    let server_uuid = claims
        .server_uuid()
        .ok_or(HelmsmanError::Token(TokenError::MissingField("sub")))?;
    let path = claims
        .file_path
        .as_deref()
        .ok_or(HelmsmanError::Token(TokenError::MissingField("file_path")))?;

    let server = state.servers.get_or_err(server_uuid)?;
    let (file, info) = server.filesystem().file(path).await?;

    Ok((
        [
            (header::CONTENT_TYPE, info.mime.clone()),
            (header::CONTENT_LENGTH, info.size.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}", info.name),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}
