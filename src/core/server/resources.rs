// src/core/server/resources.rs

//! The resource snapshot published on the `stats` topic and returned by
//! the details endpoint.

use crate::core::environment::{EnvironmentStats, PowerPhase};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NetworkStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Last-known usage for one server. Composed from the environment's
/// sample stream plus the filesystem's disk accounting; the agent keeps
/// only the latest snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub cpu_absolute: f64,
    pub network: NetworkStats,
    pub uptime: i64,
    pub state: PowerPhase,
    pub disk_bytes: u64,
}

impl ResourceUsage {
    /// An empty snapshot for a stopped server, carrying only phase and
    /// disk usage.
    pub fn offline(state: PowerPhase, disk_bytes: u64) -> Self {
        Self {
            state,
            disk_bytes,
            ..Default::default()
        }
    }

    pub fn from_sample(sample: EnvironmentStats, state: PowerPhase, disk_bytes: u64) -> Self {
        Self {
            memory_bytes: sample.memory_bytes,
            memory_limit_bytes: sample.memory_limit_bytes,
            cpu_absolute: sample.cpu_absolute,
            network: NetworkStats {
                rx_bytes: sample.network_rx_bytes,
                tx_bytes: sample.network_tx_bytes,
            },
            uptime: sample.uptime_ms,
            state,
            disk_bytes,
        }
    }
}
