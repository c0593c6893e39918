// src/core/tasks/token_purger.rs

//! A background task that expires consumed one-time nonces and stale JTI
//! revocations from the token validator's caches.

use crate::core::state::AgentState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// How often the caches are swept. One minute keeps the nonce map small
/// without mattering for correctness; entries are checked against their
/// own TTLs.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// The background task struct for the token cache purger.
pub struct TokenPurgerTask {
    state: Arc<AgentState>,
}

impl TokenPurgerTask {
    pub fn new(state: Arc<AgentState>) -> Self {
        Self { state }
    }

    /// The main run loop for the purger task.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("token cache purger task started");
        let mut interval = tokio::time::interval(PURGE_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.state.validator.purge_expired();
                }
                _ = shutdown_rx.recv() => {
                    info!("token cache purger task shutting down");
                    return;
                }
            }
        }
    }
}
