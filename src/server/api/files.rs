// src/server/api/files.rs

//! Filesystem endpoints. These are direct pass-throughs to the
//! quota-enforcing filesystem; no path or quota logic lives here.

use super::ApiError;
use crate::core::errors::HelmsmanError;
use crate::core::state::AgentState;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::io::{ReaderStream, StreamReader};
use url::Url;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct FileQuery {
    file: PathBuf,
}

#[derive(Deserialize)]
pub struct DirectoryQuery {
    #[serde(default)]
    directory: PathBuf,
}

/// Streams a file's contents back to the caller.
pub async fn read_contents(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    let (file, info) = server.filesystem().file(&query.file).await?;

    let stream = ReaderStream::new(file);
    Ok((
        [
            (header::CONTENT_TYPE, info.mime.to_string()),
            (header::CONTENT_LENGTH, info.size.to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

pub async fn list_directory(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    let entries = server.filesystem().list_directory(&query.directory)?;
    Ok(Json(entries).into_response())
}

#[derive(Deserialize)]
pub struct RenamePair {
    from: PathBuf,
    to: PathBuf,
}

#[derive(Deserialize)]
pub struct RenameRequest {
    #[serde(default)]
    root: PathBuf,
    files: Vec<RenamePair>,
}

pub async fn rename(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
    Json(body): Json<RenameRequest>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    for pair in &body.files {
        server
            .filesystem()
            .rename(body.root.join(&pair.from), body.root.join(&pair.to))
            .await?;
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Deserialize)]
pub struct CopyRequest {
    location: PathBuf,
}

pub async fn copy(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
    Json(body): Json<CopyRequest>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    server.filesystem().copy(&body.location).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Streams the raw request body into a file, enforcing quota as bytes
/// arrive.
pub async fn write(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
    Query(query): Query<FileQuery>,
    body: Body,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    let reader = StreamReader::new(
        body.into_data_stream()
            .map_err(std::io::Error::other),
    );
    server.filesystem().write_file(&query.file, reader).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Deserialize)]
pub struct CreateDirectoryRequest {
    name: String,
    #[serde(default)]
    path: PathBuf,
}

pub async fn create_directory(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
    Json(body): Json<CreateDirectoryRequest>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    server
        .filesystem()
        .create_directory(&body.name, &body.path)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Deserialize)]
pub struct MultiFileRequest {
    #[serde(default)]
    root: PathBuf,
    files: Vec<PathBuf>,
}

pub async fn delete_files(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
    Json(body): Json<MultiFileRequest>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    for file in &body.files {
        server.filesystem().delete(body.root.join(file)).await?;
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn compress(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
    Json(body): Json<MultiFileRequest>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    let names: Vec<String> = body
        .files
        .iter()
        .map(|f| f.to_string_lossy().to_string())
        .collect();
    let archive = server.filesystem().compress_files(&body.root, &names).await?;
    Ok(Json(archive).into_response())
}

#[derive(Deserialize)]
pub struct DecompressRequest {
    #[serde(default)]
    root: PathBuf,
    file: String,
}

pub async fn decompress(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
    Json(body): Json<DecompressRequest>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    server
        .filesystem()
        .decompress_file(&body.root, &body.file)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Deserialize)]
pub struct ChmodEntry {
    file: PathBuf,
    /// Octal permission string, e.g. `"755"`.
    mode: String,
}

#[derive(Deserialize)]
pub struct ChmodRequest {
    #[serde(default)]
    root: PathBuf,
    files: Vec<ChmodEntry>,
}

pub async fn chmod(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
    Json(body): Json<ChmodRequest>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    for entry in &body.files {
        let mode = u32::from_str_radix(&entry.mode, 8)
            .map_err(|_| HelmsmanError::InvalidRequest(format!("invalid mode: {}", entry.mode)))?;
        server
            .filesystem()
            .chmod(body.root.join(&entry.file), mode)
            .await?;
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Deserialize)]
pub struct PullRequest {
    url: Url,
    #[serde(default)]
    directory: PathBuf,
}

/// Begins a tracked remote download into the server's root.
pub async fn pull_file(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
    Json(body): Json<PullRequest>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    let download = state
        .downloads
        .track(server.uuid(), body.directory, body.url)?;

    let id = download.uuid;
    let downloads = state.downloads.clone();
    tokio::spawn(async move {
        if let Err(err) = downloads.execute(download, &server).await {
            tracing::warn!(server = %server.uuid(), error = %err, "pull failed");
        }
    });
    Ok((StatusCode::ACCEPTED, Json(json!({ "identifier": id }))).into_response())
}

pub async fn list_pulls(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
) -> Result<Response, ApiError> {
    let server = state.servers.get_or_err(server)?;
    let jobs: Vec<_> = state
        .downloads
        .for_server(server.uuid())
        .iter()
        .map(|job| {
            json!({
                "identifier": job.uuid,
                "url": job.url,
                "progress": job.progress(),
            })
        })
        .collect();
    Ok(Json(jobs).into_response())
}

#[derive(Deserialize)]
pub struct AbortPullQuery {
    identifier: Uuid,
}

pub async fn abort_pull(
    State(state): State<Arc<AgentState>>,
    Path(server): Path<Uuid>,
    Query(query): Query<AbortPullQuery>,
) -> Result<Response, ApiError> {
    state.servers.get_or_err(server)?;
    state.downloads.cancel(query.identifier);
    Ok(StatusCode::NO_CONTENT.into_response())
}
