// src/core/environment/mod.rs

//! The abstraction over a container runtime for a single server. The
//! server aggregate drives power transitions through this trait; the
//! Docker implementation lives in [`docker`], and tests substitute their
//! own double.

use crate::core::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{Display, EnumString};

pub mod docker;

pub use docker::DockerEnvironment;

/// Lifecycle stage of a server's container. Serialized values are part of
/// the websocket wire contract.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PowerPhase {
    #[default]
    Offline,
    Starting,
    Running,
    Stopping,
}

/// Resource limits applied to a server's container, as configured by the
/// panel. Raw units follow the panel contract: memory in megabytes, cpu
/// in percent of one core (100 = one full core), disk in megabytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub swap: i64,
    #[serde(default)]
    pub cpu: i64,
    #[serde(default)]
    pub io: i64,
    #[serde(default)]
    pub disk: i64,
    /// Pinned CPU threads, e.g. `"0,1"` or `"0-3"`. Empty means no pin.
    #[serde(default)]
    pub threads: String,
    #[serde(default)]
    pub oom_disabled: bool,
}

impl ResourceLimits {
    /// Memory limit in bytes, with a small overhead allowance so the
    /// contained process is not OOM-killed for touching its own ceiling.
    pub fn memory_limit_bytes(&self) -> i64 {
        if self.memory <= 0 {
            return -1;
        }
        let base = self.memory * 1024 * 1024;
        // 5% headroom, capped at 512 MiB.
        base + (base / 20).min(512 * 1024 * 1024)
    }

    /// Memory+swap in bytes; -1 disables the bound, 0 means "no swap".
    pub fn memory_swap_bytes(&self) -> i64 {
        if self.swap < 0 {
            return -1;
        }
        if self.memory <= 0 {
            return -1;
        }
        self.memory_limit_bytes() + self.swap * 1024 * 1024
    }

    pub fn cpu_quota(&self) -> Option<(i64, i64)> {
        if self.cpu > 0 {
            // quota/period pair against a 100ms scheduling window
            Some((self.cpu * 1_000, 100_000))
        } else {
            None
        }
    }

    pub fn cpu_shares(&self) -> i64 {
        1024
    }

    pub fn io_weight(&self) -> Option<u16> {
        if self.io > 0 { Some(self.io as u16) } else { None }
    }

    pub fn disk_bytes(&self) -> u64 {
        if self.disk <= 0 {
            0
        } else {
            self.disk as u64 * 1024 * 1024
        }
    }
}

/// How a server's process is asked to stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "value")]
pub enum StopConfig {
    /// Write a command to the process's stdin.
    Command(String),
    /// Send an OS signal to pid 1, e.g. `SIGTERM`.
    Signal(String),
    /// Use the runtime's native stop.
    Native,
}

impl Default for StopConfig {
    fn default() -> Self {
        StopConfig::Signal("SIGTERM".to_string())
    }
}

/// A host path bound into the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// One ip:port pair exposed on the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub ip: String,
    pub port: u16,
}

/// Everything the runtime needs to build and run a server's container.
/// Assembled by the server aggregate from its panel configuration and the
/// agent's own settings; swapped wholesale on sync.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentSettings {
    pub image: String,
    pub invocation: String,
    /// Fully merged environment, `TZ` and panel variables included.
    pub environment: HashMap<String, String>,
    pub limits: ResourceLimits,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortMapping>,
    pub stop: StopConfig,
    pub uid: u32,
    pub gid: u32,
    pub pid_limit: i64,
    pub network_name: String,
    pub dns: Vec<String>,
    /// Size of the /tmp tmpfs in megabytes.
    pub tmpfs_size: u64,
    pub labels: HashMap<String, String>,
    /// Console throttle settings, enforced by the attach loop.
    pub throttle_enabled: bool,
    pub throttle_lines: u64,
    pub throttle_period: Duration,
}

/// A point-in-time sample from the runtime's statistics stream.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EnvironmentStats {
    /// Memory in use, corrected for the kernel's inactive file cache.
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    /// Absolute CPU usage as a percentage of one core, to 3 decimals.
    pub cpu_absolute: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub uptime_ms: i64,
}

/// How a container finished.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitState {
    pub exit_code: i64,
    pub oom_killed: bool,
}

/// A one-shot install container: the server's data root plus a scratch
/// directory holding the materialized install script.
#[derive(Debug, Clone, Default)]
pub struct InstallerSpec {
    pub image: String,
    pub entrypoint: String,
    /// Host directory containing `install.sh`.
    pub script_dir: String,
    /// Limits for the install container, already raised to the
    /// configured floor.
    pub limits: ResourceLimits,
}

/// Callbacks the owning server injects into its environment. The
/// environment never holds the server itself; events flow out through
/// these functions only.
#[derive(Clone)]
pub struct EnvironmentHooks {
    /// Publishes an event onto the server's bus.
    pub publish: Arc<dyn Fn(&str, Value) + Send + Sync>,
    /// Receives each console line that survives the throttle.
    pub on_output: Arc<dyn Fn(String) + Send + Sync>,
    /// Observes container-level lifecycle transitions.
    pub on_state: Arc<dyn Fn(PowerPhase) + Send + Sync>,
    /// Receives resource samples while the container runs.
    pub on_stats: Arc<dyn Fn(EnvironmentStats) + Send + Sync>,
}

impl fmt::Debug for EnvironmentHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EnvironmentHooks")
    }
}

impl EnvironmentHooks {
    /// Hooks that discard everything; useful before a server is wired up
    /// and in tests.
    pub fn noop() -> Self {
        Self {
            publish: Arc::new(|_, _| {}),
            on_output: Arc::new(|_| {}),
            on_state: Arc::new(|_| {}),
            on_stats: Arc::new(|_| {}),
        }
    }
}

/// The capability set the supervision engine requires of a container
/// runtime, for one server.
#[async_trait]
pub trait ProcessEnvironment: Send + Sync {
    /// Whether the container exists at all.
    async fn exists(&self) -> Result<bool>;

    /// Whether the container is currently running.
    async fn is_running(&self) -> Result<bool>;

    /// Builds the container (without starting it), pulling the image
    /// when required.
    async fn create(&self) -> Result<()>;

    /// Attaches to the container's stdio streams. Must be called before
    /// `start` so the earliest output lines are not lost.
    async fn attach(&self) -> Result<()>;

    /// Starts the container. The environment reports `Running` through
    /// the state hook once the runtime confirms it.
    async fn start(&self) -> Result<()>;

    /// Politely asks the process to stop using the configured stop
    /// mechanism.
    async fn stop(&self) -> Result<()>;

    /// Waits for the container to reach a stopped state. When the wait
    /// expires: terminates if `terminate_on_timeout`, fails otherwise.
    async fn wait_for_stop(&self, timeout: Duration, terminate_on_timeout: bool) -> Result<()>;

    /// Sends a signal to the container, defaulting to SIGKILL.
    async fn terminate(&self, signal: &str) -> Result<()>;

    /// Removes the container (not the data volume).
    async fn destroy(&self) -> Result<()>;

    /// Writes one line to the process's stdin.
    async fn send_command(&self, line: &str) -> Result<()>;

    /// Returns up to `lines` recent log lines from the runtime's log
    /// driver.
    async fn read_log(&self, lines: usize) -> Result<Vec<String>>;

    /// Milliseconds since the container started, 0 when stopped.
    async fn uptime(&self) -> Result<i64>;

    /// Exit code and OOM flag of the last run.
    async fn exit_state(&self) -> Result<ExitState>;

    /// Streams resource samples to the stats hook until the container
    /// stops or the server's context is cancelled.
    async fn poll_resources(&self) -> Result<()>;

    /// Applies changed resource limits to a live container.
    async fn in_situ_update(&self, limits: &ResourceLimits) -> Result<()>;

    /// Runs the dedicated install container to completion, streaming its
    /// output to install-observer subscribers, and returns how it exited.
    async fn run_installer(&self, spec: &InstallerSpec) -> Result<ExitState>;

    /// Replaces the environment settings (panel sync).
    fn update_settings(&self, settings: EnvironmentSettings);

    /// The environment's view of the container lifecycle.
    fn state(&self) -> PowerPhase;
}
