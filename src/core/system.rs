// src/core/system.rs

//! The node information report served at `GET /api/system`.

use crate::core::errors::Result;
use serde::Serialize;
use sysinfo::System;

#[derive(Debug, Clone, Serialize)]
pub struct SystemInformation {
    pub version: String,
    pub kernel_version: String,
    pub architecture: String,
    pub os: String,
    pub cpu_count: usize,
    pub memory_bytes: u64,
    pub docker_version: String,
}

/// Collects host details plus the runtime's reported version.
pub async fn collect(docker: &bollard::Docker) -> Result<SystemInformation> {
    let docker_version = docker
        .version()
        .await
        .ok()
        .and_then(|v| v.version)
        .unwrap_or_else(|| "unknown".to_string());

    let mut system = System::new();
    system.refresh_memory();

    Ok(SystemInformation {
        version: env!("CARGO_PKG_VERSION").to_string(),
        kernel_version: System::kernel_version().unwrap_or_else(|| "unknown".to_string()),
        architecture: System::cpu_arch(),
        os: System::long_os_version().unwrap_or_else(|| "linux".to_string()),
        cpu_count: num_cpus(),
        memory_bytes: system.total_memory(),
        docker_version,
    })
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
