// tests/common/mod.rs

//! Shared fixtures: an agent configuration rooted in a temp directory, a
//! canned panel client, and a scriptable environment double.

#![allow(dead_code)]

use async_trait::async_trait;
use helmsman::config::{Config, ConfigHolder, SystemUser};
use helmsman::core::environment::{
    EnvironmentHooks, EnvironmentSettings, EnvironmentStats, ExitState, InstallerSpec,
    PowerPhase, ProcessEnvironment, ResourceLimits,
};
use helmsman::core::errors::Result;
use helmsman::core::remote::PanelClient;
use helmsman::core::server::{Server, ServerConfiguration};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// A config whose filesystem roots all live under `base`.
pub fn test_config(base: &Path) -> Config {
    let mut config = Config::default();
    config.uuid = Uuid::new_v4().to_string();
    config.token_id = "node".to_string();
    config.token = "super-secret-node-token".to_string();
    config.remote = "https://panel.example.com".to_string();
    config.system.data_directory = base.join("volumes");
    config.system.log_directory = base.join("logs");
    config.system.backup_directory = base.join("backups");
    config.system.user = current_user();
    config
}

/// Chowning to the invoking user always succeeds, so tests exercise the
/// ownership paths without privileges.
pub fn current_user() -> SystemUser {
    SystemUser {
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
    }
}

pub fn test_server_configuration(uuid: Uuid) -> ServerConfiguration {
    let mut configuration = ServerConfiguration::default();
    configuration.uuid = uuid;
    configuration.invocation = "./start.sh".to_string();
    configuration.container.image = "ghcr.io/example/game:latest".to_string();
    configuration.crash_detection_enabled = true;
    configuration
}

/// A panel that accepts everything and returns nothing.
pub struct NullPanel;

#[async_trait]
impl PanelClient for NullPanel {
    async fn get_server_configuration(&self, uuid: Uuid) -> Result<ServerConfiguration> {
        Ok(test_server_configuration(uuid))
    }

    async fn get_servers(&self, _per_page: usize) -> Result<Vec<ServerConfiguration>> {
        Ok(Vec::new())
    }

    async fn set_installation_status(&self, _uuid: Uuid, _successful: bool) -> Result<()> {
        Ok(())
    }

    async fn set_archive_status(&self, _uuid: Uuid, _successful: bool) -> Result<()> {
        Ok(())
    }

    async fn set_transfer_status(&self, _uuid: Uuid, _successful: bool) -> Result<()> {
        Ok(())
    }

    async fn get_backup_remote_upload_urls(&self, _backup: Uuid, _size: u64) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// A scriptable in-memory environment. Tests drive lifecycle transitions
/// through the hooks it captured at construction.
pub struct MockEnvironment {
    pub hooks: Mutex<Option<EnvironmentHooks>>,
    pub running: AtomicBool,
    pub start_delay: Mutex<Duration>,
    pub start_calls: AtomicUsize,
    pub sent_commands: Mutex<Vec<String>>,
    pub exit: Mutex<ExitState>,
    /// When set, `poll_resources` panics, standing in for a task blowing
    /// up mid-flight.
    pub panic_on_poll: AtomicBool,
}

impl MockEnvironment {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hooks: Mutex::new(None),
            running: AtomicBool::new(false),
            start_delay: Mutex::new(Duration::ZERO),
            start_calls: AtomicUsize::new(0),
            sent_commands: Mutex::new(Vec::new()),
            exit: Mutex::new(ExitState::default()),
            panic_on_poll: AtomicBool::new(false),
        })
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = delay;
    }

    pub fn set_exit(&self, exit_code: i64, oom_killed: bool) {
        *self.exit.lock() = ExitState {
            exit_code,
            oom_killed,
        };
    }

    fn emit_state(&self, phase: PowerPhase) {
        if let Some(hooks) = self.hooks.lock().as_ref() {
            (hooks.on_state)(phase);
        }
    }

    /// Simulates the attach loop observing the container die.
    pub fn simulate_exit(&self, exit_code: i64) {
        self.set_exit(exit_code, false);
        self.running.store(false, Ordering::SeqCst);
        self.emit_state(PowerPhase::Offline);
    }

    pub fn emit_stats(&self, sample: EnvironmentStats) {
        if let Some(hooks) = self.hooks.lock().as_ref() {
            (hooks.on_stats)(sample);
        }
    }
}

#[async_trait]
impl ProcessEnvironment for MockEnvironment {
    async fn exists(&self) -> Result<bool> {
        Ok(true)
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.running.load(Ordering::SeqCst))
    }

    async fn create(&self) -> Result<()> {
        Ok(())
    }

    async fn attach(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let delay = *self.start_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        self.emit_state(PowerPhase::Running);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.emit_state(PowerPhase::Offline);
        Ok(())
    }

    async fn wait_for_stop(&self, _timeout: Duration, _terminate_on_timeout: bool) -> Result<()> {
        Ok(())
    }

    async fn terminate(&self, _signal: &str) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.emit_state(PowerPhase::Offline);
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        Ok(())
    }

    async fn send_command(&self, line: &str) -> Result<()> {
        self.sent_commands.lock().push(line.to_string());
        Ok(())
    }

    async fn read_log(&self, _lines: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn uptime(&self) -> Result<i64> {
        Ok(0)
    }

    async fn exit_state(&self) -> Result<ExitState> {
        Ok(*self.exit.lock())
    }

    async fn poll_resources(&self) -> Result<()> {
        if self.panic_on_poll.load(Ordering::SeqCst) {
            panic!("stats stream exploded");
        }
        Ok(())
    }

    async fn in_situ_update(&self, _limits: &ResourceLimits) -> Result<()> {
        Ok(())
    }

    async fn run_installer(&self, _spec: &InstallerSpec) -> Result<ExitState> {
        Ok(ExitState {
            exit_code: 0,
            oom_killed: false,
        })
    }

    fn update_settings(&self, _settings: EnvironmentSettings) {}

    fn state(&self) -> PowerPhase {
        if self.running.load(Ordering::SeqCst) {
            PowerPhase::Running
        } else {
            PowerPhase::Offline
        }
    }
}

/// Builds a server aggregate wired to a [`MockEnvironment`].
pub fn build_server(base: &Path) -> (Arc<Server>, Arc<MockEnvironment>) {
    let node = Arc::new(ConfigHolder::new(test_config(base)));
    let environment = MockEnvironment::new();

    let captured = environment.clone();
    let server = Server::with_environment(
        test_server_configuration(Uuid::new_v4()),
        node,
        Arc::new(NullPanel),
        move |hooks, _token, _settings| {
            *captured.hooks.lock() = Some(hooks);
            let environment: Arc<dyn ProcessEnvironment> = captured;
            environment
        },
    )
    .expect("failed to build test server");

    (server, environment)
}
