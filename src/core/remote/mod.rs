// src/core/remote/mod.rs

//! The contract between the agent and the remote panel. The agent only
//! ever needs a handful of calls: configuration fetch at boot/sync and
//! status reporting for installs, archives, and transfers.

use crate::core::errors::Result;
use crate::core::server::ServerConfiguration;
use async_trait::async_trait;
use uuid::Uuid;

pub mod client;

pub use client::PanelHttpClient;

/// What the panel must provide. Production uses [`PanelHttpClient`];
/// tests substitute a canned double.
#[async_trait]
pub trait PanelClient: Send + Sync {
    /// Fetches a single server's configuration.
    async fn get_server_configuration(&self, uuid: Uuid) -> Result<ServerConfiguration>;

    /// Fetches every server assigned to this node, paging through the
    /// panel's index.
    async fn get_servers(&self, per_page: usize) -> Result<Vec<ServerConfiguration>>;

    /// Reports whether an installation finished successfully.
    async fn set_installation_status(&self, uuid: Uuid, successful: bool) -> Result<()>;

    /// Reports whether a backup archive was generated successfully.
    async fn set_archive_status(&self, uuid: Uuid, successful: bool) -> Result<()>;

    /// Reports the outcome of an outgoing transfer.
    async fn set_transfer_status(&self, uuid: Uuid, successful: bool) -> Result<()>;

    /// Asks the panel for pre-signed upload URLs for an off-node backup
    /// of the given size.
    async fn get_backup_remote_upload_urls(&self, backup: Uuid, size: u64) -> Result<Vec<String>>;
}
