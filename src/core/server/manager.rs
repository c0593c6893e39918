// src/core/server/manager.rs

//! The node-wide registry of server aggregates: boot-time loading from
//! the panel, creation, deletion, and sync.

use super::{Server, ServerConfiguration};
use crate::config::ConfigHolder;
use crate::core::errors::{HelmsmanError, Result};
use crate::core::metrics;
use crate::core::remote::PanelClient;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Holds every server configured on this node.
pub struct ServerManager {
    servers: DashMap<Uuid, Arc<Server>>,
    node: Arc<ConfigHolder>,
    remote: Arc<dyn PanelClient>,
    docker: bollard::Docker,
}

impl ServerManager {
    pub fn new(
        node: Arc<ConfigHolder>,
        remote: Arc<dyn PanelClient>,
        docker: bollard::Docker,
    ) -> Self {
        Self {
            servers: DashMap::new(),
            node,
            remote,
            docker,
        }
    }

    pub fn get(&self, uuid: Uuid) -> Option<Arc<Server>> {
        self.servers.get(&uuid).map(|entry| entry.value().clone())
    }

    /// Like [`get`], but with the error the HTTP layer wants.
    pub fn get_or_err(&self, uuid: Uuid) -> Result<Arc<Server>> {
        self.get(uuid).ok_or(HelmsmanError::ServerNotFound(uuid))
    }

    pub fn all(&self) -> Vec<Arc<Server>> {
        self.servers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Fetches every server assigned to this node and brings it under
    /// supervision, deriving each initial phase from the runtime.
    pub async fn boot(&self) -> Result<()> {
        let per_page = self.node.get().remote_query.boot_servers_per_page;
        let configurations = self.remote.get_servers(per_page).await?;
        info!(count = configurations.len(), "loading servers from panel");

        for configuration in configurations {
            let uuid = configuration.uuid;
            match self.register(configuration) {
                Ok(server) => server.sync_initial_state().await,
                Err(err) => {
                    warn!(server = %uuid, error = %err, "failed to load server, skipping");
                }
            }
        }

        metrics::SERVERS_CONFIGURED.set(self.servers.len() as f64);
        Ok(())
    }

    /// Builds the aggregate and registers it, without touching the panel.
    fn register(&self, configuration: ServerConfiguration) -> Result<Arc<Server>> {
        let server = Server::new(
            configuration,
            self.node.clone(),
            self.remote.clone(),
            self.docker.clone(),
        )?;
        self.servers.insert(server.uuid(), server.clone());
        Ok(server)
    }

    /// Creates a server from its panel configuration and kicks off the
    /// installation in the background. Returns as soon as the aggregate
    /// is registered.
    pub async fn create(&self, uuid: Uuid, start_on_completion: bool) -> Result<Arc<Server>> {
        let configuration = self.remote.get_server_configuration(uuid).await?;
        let server = self.register(configuration)?;
        server.sync_initial_state().await;
        metrics::SERVERS_CONFIGURED.set(self.servers.len() as f64);

        let install_target = server.clone();
        tokio::spawn(async move {
            if let Err(err) = install_target.install().await {
                warn!(server = %install_target.uuid(), error = %err, "installation failed");
                return;
            }
            if start_on_completion {
                if let Err(err) = install_target
                    .handle_power_action(super::PowerAction::Start, None)
                    .await
                {
                    warn!(server = %install_target.uuid(), error = %err, "failed to start after install");
                }
            }
        });

        Ok(server)
    }

    /// Deletes a server: cancels its context (closing sessions and
    /// loops), removes the container, and erases the data root.
    pub async fn delete(&self, uuid: Uuid) -> Result<()> {
        let Some((_, server)) = self.servers.remove(&uuid) else {
            return Err(HelmsmanError::ServerNotFound(uuid));
        };
        metrics::SERVERS_CONFIGURED.set(self.servers.len() as f64);
        server.destroy().await
    }

    /// Re-fetches a server's configuration from the panel and applies it.
    pub async fn sync(&self, uuid: Uuid) -> Result<()> {
        let server = self.get_or_err(uuid)?;
        let configuration = self.remote.get_server_configuration(uuid).await?;
        server.update_configuration(configuration).await;
        Ok(())
    }
}
