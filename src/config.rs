// src/config.rs

//! Manages agent configuration: loading, validation, and the mutable
//! process-wide holder that hands out immutable snapshots.

use anyhow::{Context, Result, anyhow};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Where the agent looks for its configuration when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/helmsman/config.toml";

/// Network settings for the agent's own HTTP/websocket API.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Maximum accepted size for direct file writes, in bytes.
    #[serde(default = "default_upload_limit")]
    pub upload_limit: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            upload_limit: default_upload_limit(),
        }
    }
}

/// The system user that owns every server data root. Files created by the
/// agent are chowned to this user so the in-container process can use them.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SystemUser {
    #[serde(default = "default_uid")]
    pub uid: u32,
    #[serde(default = "default_gid")]
    pub gid: u32,
}

impl Default for SystemUser {
    fn default() -> Self {
        Self {
            uid: default_uid(),
            gid: default_gid(),
        }
    }
}

/// Crash detection policy applied when a container stops without a
/// matching `stopping` phase.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CrashDetection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether an exit code of 0 still counts as a crash.
    #[serde(default = "default_true")]
    pub detect_clean_exit_as_crash: bool,
    /// Minimum seconds between automatic restarts; a crash inside this
    /// window leaves the server offline.
    #[serde(default = "default_crash_window")]
    pub restart_window_seconds: u64,
}

impl Default for CrashDetection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            detect_clean_exit_as_crash: default_true(),
            restart_window_seconds: default_crash_window(),
        }
    }
}

/// Filesystem layout and host-level settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SystemConfig {
    /// Root under which `<data>/<uuid>` server directories live.
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,
    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,
    #[serde(default = "default_backup_directory")]
    pub backup_directory: PathBuf,
    #[serde(default)]
    pub user: SystemUser,
    /// Host timezone, injected into containers as `TZ`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Interval between full disk usage recomputations per server.
    #[serde(default = "default_disk_check_interval", with = "humantime_serde")]
    pub disk_check_interval: Duration,
    /// Force a recompute when the cached value is older than this.
    #[serde(default = "default_disk_stale_threshold", with = "humantime_serde")]
    pub disk_stale_threshold: Duration,
    #[serde(default)]
    pub crash_detection: CrashDetection,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            data_directory: default_data_directory(),
            log_directory: default_log_directory(),
            backup_directory: default_backup_directory(),
            user: SystemUser::default(),
            timezone: default_timezone(),
            disk_check_interval: default_disk_check_interval(),
            disk_stale_threshold: default_disk_stale_threshold(),
            crash_detection: CrashDetection::default(),
        }
    }
}

/// Resource floor for install containers; servers with smaller limits are
/// raised to these values while installing.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InstallerLimits {
    /// Memory floor in megabytes.
    #[serde(default = "default_installer_memory")]
    pub memory: u64,
    /// CPU floor in percent of a single core times 100.
    #[serde(default = "default_installer_cpu")]
    pub cpu: u64,
}

impl Default for InstallerLimits {
    fn default() -> Self {
        Self {
            memory: default_installer_memory(),
            cpu: default_installer_cpu(),
        }
    }
}

/// Container runtime settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DockerConfig {
    #[serde(default = "default_docker_network")]
    pub network_name: String,
    /// DNS servers configured into every container.
    #[serde(default)]
    pub dns: Vec<String>,
    /// Size of the container /tmp tmpfs mount, in megabytes.
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: u64,
    /// Hard pid cap applied when a server does not set its own.
    #[serde(default = "default_pid_limit")]
    pub container_pid_limit: i64,
    #[serde(default)]
    pub installer_limits: InstallerLimits,
    /// Always pull the server image before start, even when present locally.
    #[serde(default)]
    pub always_pull_images: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            network_name: default_docker_network(),
            dns: Vec::new(),
            tmpfs_size: default_tmpfs_size(),
            container_pid_limit: default_pid_limit(),
            installer_limits: InstallerLimits::default(),
            always_pull_images: false,
        }
    }
}

/// Limits applied to server console output before lines are dropped.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConsoleThrottle {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of lines allowed per refill period.
    #[serde(default = "default_throttle_lines")]
    pub lines: u64,
    /// Length of the refill period.
    #[serde(default = "default_throttle_period", with = "humantime_serde")]
    pub period: Duration,
}

impl Default for ConsoleThrottle {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            lines: default_throttle_lines(),
            period: default_throttle_period(),
        }
    }
}

/// Settings governing communication with the remote panel.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RemoteQuery {
    #[serde(default = "default_remote_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Page size used when fetching all servers at boot.
    #[serde(default = "default_boot_servers_per_page")]
    pub boot_servers_per_page: usize,
}

impl Default for RemoteQuery {
    fn default() -> Self {
        Self {
            timeout: default_remote_timeout(),
            boot_servers_per_page: default_boot_servers_per_page(),
        }
    }
}

/// The top-level agent configuration, loaded from TOML with `HELMSMAN_`
/// environment variable overrides.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub debug: bool,
    /// This node's identifier as known to the panel.
    #[serde(default)]
    pub uuid: String,
    /// Identifier half of the node credential pair.
    #[serde(default)]
    pub token_id: String,
    /// Secret half: bearer token for `/api` and the HMAC key for signed
    /// websocket/download tokens issued by the panel.
    #[serde(default)]
    pub token: String,
    /// Base URL of the panel, e.g. `https://panel.example.com`.
    #[serde(default)]
    pub remote: String,
    /// Origins beyond the panel URL allowed to open websocket sessions.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// When set, `POST /api/update` acknowledges but does not apply.
    #[serde(default)]
    pub ignore_panel_config_updates: bool,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub throttles: ConsoleThrottle,
    #[serde(default)]
    pub remote_query: RemoteQuery,
}

impl Config {
    /// Loads configuration from a TOML file, then applies any `HELMSMAN_*`
    /// environment overrides (e.g. `HELMSMAN_API__PORT=8443`).
    pub fn from_file(path: &Path) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(
                config::Environment::with_prefix("HELMSMAN")
                    .separator("__")
                    .try_parsing(true),
            );

        let cfg: Config = builder
            .build()
            .with_context(|| format!("failed to read configuration from {}", path.display()))?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        cfg.validate()?;
        info!(path = %path.display(), "configuration loaded");
        Ok(cfg)
    }

    /// Validates cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(anyhow!("configuration is missing the node token"));
        }
        if self.remote.is_empty() {
            return Err(anyhow!("configuration is missing the panel url (remote)"));
        }
        url::Url::parse(&self.remote).context("remote is not a valid url")?;
        if self.system.data_directory.is_relative() {
            return Err(anyhow!("system.data_directory must be an absolute path"));
        }
        Ok(())
    }
}

/// Holds the live configuration. The panel can push updates at runtime, so
/// every reader takes an immutable snapshot; a concurrent update can never
/// tear the fields a caller already observed.
#[derive(Debug)]
pub struct ConfigHolder {
    inner: RwLock<Arc<Config>>,
}

impl ConfigHolder {
    pub fn new(config: Config) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    /// Returns the current configuration snapshot.
    pub fn get(&self) -> Arc<Config> {
        self.inner.read().clone()
    }

    /// Replaces the configuration wholesale.
    pub fn replace(&self, config: Config) {
        *self.inner.write() = Arc::new(config);
    }
}

fn default_true() -> bool {
    true
}
fn default_api_host() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    8080
}
fn default_upload_limit() -> u64 {
    100 * 1024 * 1024 // 100 MB
}
fn default_uid() -> u32 {
    988
}
fn default_gid() -> u32 {
    988
}
fn default_crash_window() -> u64 {
    60
}
fn default_data_directory() -> PathBuf {
    PathBuf::from("/var/lib/helmsman/volumes")
}
fn default_log_directory() -> PathBuf {
    PathBuf::from("/var/log/helmsman")
}
fn default_backup_directory() -> PathBuf {
    PathBuf::from("/var/lib/helmsman/backups")
}
fn default_timezone() -> String {
    std::env::var("TZ").unwrap_or_else(|_| "UTC".to_string())
}
fn default_disk_check_interval() -> Duration {
    Duration::from_secs(150)
}
fn default_disk_stale_threshold() -> Duration {
    Duration::from_secs(300)
}
fn default_installer_memory() -> u64 {
    1024 // 1 GiB
}
fn default_installer_cpu() -> u64 {
    100
}
fn default_docker_network() -> String {
    "helmsman0".to_string()
}
fn default_tmpfs_size() -> u64 {
    100
}
fn default_pid_limit() -> i64 {
    512
}
fn default_throttle_lines() -> u64 {
    10000
}
fn default_throttle_period() -> Duration {
    Duration::from_millis(100)
}
fn default_remote_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_boot_servers_per_page() -> usize {
    50
}
