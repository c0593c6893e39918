// src/core/state.rs

//! The central `AgentState` struct, holding all shared node-wide state.

use crate::config::ConfigHolder;
use crate::core::backup::BackupManager;
use crate::core::downloader::DownloadManager;
use crate::core::remote::PanelClient;
use crate::core::server::ServerManager;
use crate::core::token::TokenValidator;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use std::sync::Arc;

/// When this process came up. Tokens issued before this instant are
/// rejected, so it is pinned once, before anything else runs.
pub static BOOT_TIME: Lazy<DateTime<Utc>> = Lazy::new(Utc::now);

/// The state shared by the HTTP layer, websocket sessions, and every
/// background task. Wrapped in an `Arc` and handed to all of them.
pub struct AgentState {
    /// Live agent configuration; readers take snapshots.
    pub config: Arc<ConfigHolder>,
    /// Every server configured on this node.
    pub servers: Arc<ServerManager>,
    /// Panel-signed token verification and revocation.
    pub validator: Arc<TokenValidator>,
    /// Tracked remote downloads.
    pub downloads: Arc<DownloadManager>,
    /// Node-local backups.
    pub backups: Arc<BackupManager>,
    /// The panel contract.
    pub remote: Arc<dyn PanelClient>,
    /// Shared container runtime handle.
    pub docker: bollard::Docker,
}
