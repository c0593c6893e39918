// src/core/tasks/disk_usage.rs

//! A background task that keeps every server's disk usage cache fresh by
//! periodically re-walking its data root.

use crate::core::state::AgentState;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// The background task struct for the disk usage refresher.
pub struct DiskUsageTask {
    state: Arc<AgentState>,
}

impl DiskUsageTask {
    pub fn new(state: Arc<AgentState>) -> Self {
        Self { state }
    }

    /// The main run loop. The per-server interval comes from the agent
    /// configuration; each tick re-walks only the servers whose cache has
    /// gone stale.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let interval = self.state.config.get().system.disk_check_interval;
        info!(interval_secs = interval.as_secs(), "disk usage task started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for server in self.state.servers.all() {
                        let usage = server.filesystem().recompute_usage().await;
                        debug!(server = %server.uuid(), bytes = usage, "disk usage refreshed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("disk usage task shutting down");
                    return;
                }
            }
        }
    }
}
