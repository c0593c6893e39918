// src/server/spawner.rs

//! Spawns all of the agent's long-running background tasks.

use super::context::ServerContext;
use crate::core::tasks::{disk_usage::DiskUsageTask, token_purger::TokenPurgerTask};

/// Spawns all maintenance tasks into the context's JoinSet.
pub fn spawn_all(ctx: &mut ServerContext) {
    let disk_task = DiskUsageTask::new(ctx.state.clone());
    let shutdown_rx_disk = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        disk_task.run(shutdown_rx_disk).await;
    });

    let purger = TokenPurgerTask::new(ctx.state.clone());
    let shutdown_rx_purge = ctx.shutdown_tx.subscribe();
    ctx.background_tasks.spawn(async move {
        purger.run(shutdown_rx_purge).await;
    });
}
