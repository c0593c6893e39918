// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;
use std::sync::Arc;

mod api;
mod context;
mod initialization;
mod spawner;

pub use context::ServerContext;

/// The main agent startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    // 1. Initialize agent state: runtime handle, panel client, server boot.
    let mut context = initialization::setup(config).await?;

    // 2. Spawn all background tasks.
    spawner::spawn_all(&mut context);

    // 3. Serve the HTTP/websocket API. This runs until shutdown.
    api::serve(context).await
}

/// Convenience used by the API layer and tests to reach the shared state
/// type without spelling the whole path.
pub type SharedState = Arc<crate::core::AgentState>;
