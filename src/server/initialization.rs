// src/server/initialization.rs

//! Handles the complete agent initialization process: container runtime
//! handshake, panel client construction, and bringing every configured
//! server under supervision.

use super::context::ServerContext;
use crate::config::{Config, ConfigHolder};
use crate::core::backup::BackupManager;
use crate::core::downloader::DownloadManager;
use crate::core::remote::PanelHttpClient;
use crate::core::server::ServerManager;
use crate::core::state::{AgentState, BOOT_TIME};
use crate::core::token::TokenValidator;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;

/// Initializes all agent components before the API starts listening.
pub async fn setup(config: Config) -> Result<ServerContext> {
    // Pin the boot time before any token can be validated.
    let boot_time = *BOOT_TIME;
    info!(version = env!("CARGO_PKG_VERSION"), "initializing helmsman");

    let docker = bollard::Docker::connect_with_local_defaults()
        .context("failed to connect to the container runtime")?;
    let version = docker
        .version()
        .await
        .context("container runtime did not answer version handshake")?;
    info!(
        docker_version = version.version.as_deref().unwrap_or("unknown"),
        "connected to container runtime"
    );

    let remote = Arc::new(PanelHttpClient::new(
        &config.remote,
        &config.token_id,
        &config.token,
        config.remote_query.timeout,
    )?);

    let validator = Arc::new(TokenValidator::new(&config.token, boot_time));
    let backups = Arc::new(BackupManager::new(&config.system.backup_directory)?);

    let holder = Arc::new(ConfigHolder::new(config));
    let servers = Arc::new(ServerManager::new(
        holder.clone(),
        remote.clone(),
        docker.clone(),
    ));

    let state = Arc::new(AgentState {
        config: holder,
        servers,
        validator,
        downloads: Arc::new(DownloadManager::new()),
        backups,
        remote,
        docker,
    });

    // Bring every server assigned to this node under supervision before
    // the API opens; the panel expects details calls to resolve.
    state.servers.boot().await?;
    info!(servers = state.servers.len(), "server states initialized");

    let (shutdown_tx, _) = broadcast::channel(1);
    Ok(ServerContext {
        state,
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}
