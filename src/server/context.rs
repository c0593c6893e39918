// src/server/context.rs

use crate::core::state::AgentState;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// Bundles everything the boot phases hand from one to the next: the
/// shared state, the shutdown broadcast, and the set of spawned
/// background tasks.
pub struct ServerContext {
    pub state: Arc<AgentState>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<()>,
}
