// src/core/environment/docker/stats.rs

//! Resource telemetry: consumes the runtime's statistics stream and
//! feeds normalized samples to the owning server.

use super::DockerEnvironment;
use crate::core::environment::EnvironmentStats;
use crate::core::errors::Result;
use bollard::models::{
    ContainerCpuStats, ContainerMemoryStats, ContainerStatsResponse, ContainerUpdateBody,
};
use bollard::query_parameters::StatsOptionsBuilder;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::debug;

use crate::core::environment::ResourceLimits;

impl DockerEnvironment {
    /// Streams samples until the container stops or the server context is
    /// cancelled. Each raw sample is normalized before it reaches the
    /// stats hook.
    pub(super) async fn poll_resources_inner(&self) -> Result<()> {
        let started_at = self.started_at().await?;
        let options = StatsOptionsBuilder::default().stream(true).build();
        let mut stream = self.client.stats(&self.container_name(), Some(options));

        loop {
            tokio::select! {
                sample = stream.next() => {
                    match sample {
                        Some(Ok(raw)) => {
                            if let Some(stats) = normalize_sample(&raw, started_at) {
                                (self.hooks.on_stats)(stats);
                            }
                        }
                        Some(Err(err)) => {
                            debug!(server = %self.uuid, error = %err, "stats stream error");
                            return Ok(());
                        }
                        None => return Ok(()),
                    }
                }
                _ = self.token.cancelled() => return Ok(()),
            }
        }
    }

    /// Applies changed limits to the running container without a restart.
    pub(super) async fn apply_live_limits(&self, limits: &ResourceLimits) -> Result<()> {
        let (cpu_quota, cpu_period) = limits
            .cpu_quota()
            .map(|(q, p)| (Some(q), Some(p)))
            .unwrap_or((None, None));

        let body = ContainerUpdateBody {
            memory: Some(limits.memory_limit_bytes()),
            memory_swap: Some(limits.memory_swap_bytes()),
            memory_reservation: (limits.memory > 0).then(|| limits.memory * 1024 * 1024),
            cpu_quota,
            cpu_period,
            cpu_shares: Some(limits.cpu_shares()),
            cpuset_cpus: (!limits.threads.is_empty()).then(|| limits.threads.clone()),
            blkio_weight: limits.io_weight(),
            ..Default::default()
        };

        self.client
            .update_container(&self.container_name(), body)
            .await?;
        Ok(())
    }
}

/// Translates a raw runtime sample into the agent's stats shape. Returns
/// `None` for the warm-up samples that lack a previous CPU reading.
fn normalize_sample(
    raw: &ContainerStatsResponse,
    started_at: Option<DateTime<Utc>>,
) -> Option<EnvironmentStats> {
    let memory = raw.memory_stats.as_ref();
    let (memory_bytes, memory_limit) = memory_usage(memory);

    let cpu_absolute = cpu_percent(raw.cpu_stats.as_ref(), raw.precpu_stats.as_ref());

    let (rx, tx) = raw
        .networks
        .as_ref()
        .map(|nets| {
            nets.values().fold((0u64, 0u64), |(rx, tx), net| {
                (
                    rx + net.rx_bytes.unwrap_or(0),
                    tx + net.tx_bytes.unwrap_or(0),
                )
            })
        })
        .unwrap_or((0, 0));

    Some(EnvironmentStats {
        memory_bytes,
        memory_limit_bytes: memory_limit,
        cpu_absolute,
        network_rx_bytes: rx,
        network_tx_bytes: tx,
        uptime_ms: started_at
            .map(|at| (Utc::now() - at).num_milliseconds().max(0))
            .unwrap_or(0),
    })
}

/// Memory in use, corrected for the kernel's inactive file cache the same
/// way the runtime's own CLI reports it.
fn memory_usage(memory: Option<&ContainerMemoryStats>) -> (u64, u64) {
    let Some(memory) = memory else { return (0, 0) };
    let usage = memory.usage.unwrap_or(0);
    let limit = memory.limit.unwrap_or(0);

    let inactive = memory
        .stats
        .as_ref()
        .and_then(|stats| {
            stats
                .get("inactive_file")
                .or_else(|| stats.get("total_inactive_file"))
        })
        .copied()
        .unwrap_or(0);

    (usage.saturating_sub(inactive), limit)
}

/// Absolute CPU percentage: container delta over system delta, scaled by
/// the online core count, rounded to 3 decimals.
fn cpu_percent(cpu: Option<&ContainerCpuStats>, precpu: Option<&ContainerCpuStats>) -> f64 {
    let (Some(cpu), Some(precpu)) = (cpu, precpu) else {
        return 0.0;
    };

    let total = cpu
        .cpu_usage
        .as_ref()
        .and_then(|u| u.total_usage)
        .unwrap_or(0);
    let pre_total = precpu
        .cpu_usage
        .as_ref()
        .and_then(|u| u.total_usage)
        .unwrap_or(0);
    let system = cpu.system_cpu_usage.unwrap_or(0);
    let pre_system = precpu.system_cpu_usage.unwrap_or(0);

    let cpu_delta = total.saturating_sub(pre_total) as f64;
    let system_delta = system.saturating_sub(pre_system) as f64;
    if cpu_delta <= 0.0 || system_delta <= 0.0 {
        return 0.0;
    }

    let cores = cpu.online_cpus.unwrap_or(1).max(1) as f64;
    let percent = (cpu_delta / system_delta) * cores * 100.0;
    (percent * 1000.0).round() / 1000.0
}
