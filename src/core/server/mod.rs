// src/core/server/mod.rs

//! The server aggregate: binds one filesystem, one container environment,
//! one event bus, and the panel configuration snapshot into the unit the
//! rest of the agent supervises.

use crate::config::ConfigHolder;
use crate::core::environment::{
    DockerEnvironment, EnvironmentHooks, EnvironmentSettings, EnvironmentStats, PowerPhase,
    ProcessEnvironment,
};
use crate::core::errors::{HelmsmanError, Result};
use crate::core::events::{EventBus, topic};
use crate::core::filesystem::Filesystem;
use crate::core::remote::PanelClient;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub mod configuration;
pub mod crash;
pub mod install;
pub mod manager;
pub mod power;
pub mod resources;

pub use configuration::ServerConfiguration;
pub use manager::ServerManager;
pub use power::PowerAction;
pub use resources::ResourceUsage;

/// Number of console lines retained for `send logs` requests.
pub const LOG_BUFFER_LINES: usize = 100;

/// One managed game-server instance on this node.
pub struct Server {
    uuid: Uuid,
    /// Panel configuration snapshot; replaced wholesale on sync.
    config: RwLock<Arc<ServerConfiguration>>,
    /// The agent's own live configuration.
    pub(crate) node: Arc<ConfigHolder>,
    /// The panel contract, used for status reporting.
    pub(crate) remote: Arc<dyn PanelClient>,
    filesystem: Arc<Filesystem>,
    environment: Arc<dyn ProcessEnvironment>,
    events: Arc<EventBus>,
    /// Single-slot power lock; at most one power action runs at a time.
    power_lock: Arc<Semaphore>,
    /// Root of this server's context tree. Cancelled on delete, which
    /// unwinds the attach loop, pollers, and websocket sessions.
    token: CancellationToken,

    phase: RwLock<PowerPhase>,
    installing: AtomicBool,
    transferring: AtomicBool,
    /// When the last crash-triggered restart happened.
    last_crash: Mutex<Option<Instant>>,
    /// Ring of recent console lines backing `send logs`.
    log_buffer: Mutex<VecDeque<String>>,
    last_usage: RwLock<ResourceUsage>,
}

impl Server {
    /// Builds a server around a Docker environment. The environment's
    /// hooks hold a weak reference back to the aggregate so the two never
    /// keep each other alive.
    pub fn new(
        configuration: ServerConfiguration,
        node: Arc<ConfigHolder>,
        remote: Arc<dyn PanelClient>,
        docker: bollard::Docker,
    ) -> Result<Arc<Self>> {
        let uuid = configuration.uuid;
        Self::with_environment(configuration, node, remote, move |hooks, token, settings| {
            let environment: Arc<dyn ProcessEnvironment> =
                Arc::new(DockerEnvironment::new(uuid, docker, settings, hooks, token));
            environment
        })
    }

    /// Builds a server around any environment implementation. Production
    /// uses [`Server::new`]; tests substitute their own double.
    pub fn with_environment<F>(
        configuration: ServerConfiguration,
        node: Arc<ConfigHolder>,
        remote: Arc<dyn PanelClient>,
        factory: F,
    ) -> Result<Arc<Self>>
    where
        F: FnOnce(
            EnvironmentHooks,
            CancellationToken,
            EnvironmentSettings,
        ) -> Arc<dyn ProcessEnvironment>,
    {
        let agent = node.get();
        let uuid = configuration.uuid;
        let data_root = agent.system.data_directory.join(uuid.to_string());
        let filesystem = Arc::new(Filesystem::new(
            data_root,
            configuration.build.disk_bytes(),
            configuration.egg.file_denylist.clone(),
            agent.system.user.clone(),
            agent.system.disk_check_interval,
            agent.system.disk_stale_threshold,
        )?);

        let settings = configuration.environment_settings(&agent, filesystem.path());
        let token = CancellationToken::new();

        let server = Arc::new_cyclic(|weak: &std::sync::Weak<Server>| {
            let hooks = Self::environment_hooks(weak.clone());
            let environment = factory(hooks, token.child_token(), settings);

            Server {
                uuid,
                config: RwLock::new(Arc::new(configuration)),
                node: node.clone(),
                remote: remote.clone(),
                filesystem,
                environment,
                events: Arc::new(EventBus::new()),
                power_lock: Arc::new(Semaphore::new(1)),
                token,
                phase: RwLock::new(PowerPhase::Offline),
                installing: AtomicBool::new(false),
                transferring: AtomicBool::new(false),
                last_crash: Mutex::new(None),
                log_buffer: Mutex::new(VecDeque::with_capacity(LOG_BUFFER_LINES)),
                last_usage: RwLock::new(ResourceUsage::default()),
            }
        });

        Ok(server)
    }

    /// Wires the environment callbacks to a not-yet-complete aggregate.
    fn environment_hooks(weak: std::sync::Weak<Server>) -> EnvironmentHooks {
        let publish_weak = weak.clone();
        let output_weak = weak.clone();
        let state_weak = weak.clone();
        let stats_weak = weak;

        EnvironmentHooks {
            publish: Arc::new(move |topic, payload| {
                if let Some(server) = publish_weak.upgrade() {
                    server.events.publish(topic, payload);
                }
            }),
            on_output: Arc::new(move |line| {
                if let Some(server) = output_weak.upgrade() {
                    server.record_console_line(line);
                }
            }),
            on_state: Arc::new(move |phase| {
                if let Some(server) = state_weak.upgrade() {
                    let target = server.clone();
                    server.spawn_supervised("environment transition", async move {
                        target.handle_environment_transition(phase).await;
                    });
                }
            }),
            on_stats: Arc::new(move |sample| {
                if let Some(server) = stats_weak.upgrade() {
                    server.record_stats_sample(sample);
                }
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn filesystem(&self) -> &Arc<Filesystem> {
        &self.filesystem
    }

    pub fn environment(&self) -> &Arc<dyn ProcessEnvironment> {
        &self.environment
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The root cancellation handle; child tokens hang sessions and
    /// background loops off it.
    pub fn context(&self) -> &CancellationToken {
        &self.token
    }

    pub fn configuration(&self) -> Arc<ServerConfiguration> {
        self.config.read().clone()
    }

    pub fn is_suspended(&self) -> bool {
        self.config.read().suspended
    }

    /// Replaces the panel configuration snapshot and pushes the changes
    /// down: disk quota, file denylist, container settings, and, when the
    /// container is live, its resource limits.
    pub async fn update_configuration(&self, configuration: ServerConfiguration) {
        let agent = self.node.get();
        let settings = configuration.environment_settings(&agent, self.filesystem.path());
        let limits = configuration.build.clone();

        self.filesystem.set_limit(configuration.build.disk_bytes());
        self.filesystem
            .set_denylist(configuration.egg.file_denylist.clone());
        *self.config.write() = Arc::new(configuration);

        self.environment.update_settings(settings);
        if self.phase() == PowerPhase::Running {
            if let Err(err) = self.environment.in_situ_update(&limits).await {
                warn!(server = %self.uuid, error = %err, "failed to apply live resource limits");
            }
        }
    }

    pub fn is_installing(&self) -> bool {
        self.installing.load(Ordering::Acquire)
    }

    pub fn is_transferring(&self) -> bool {
        self.transferring.load(Ordering::Acquire)
    }

    pub fn set_transferring(&self, flag: bool) {
        self.transferring.store(flag, Ordering::Release);
        self.events.publish(topic::TRANSFER_STATUS, json!(flag));
    }

    // --- Phase ------------------------------------------------------------

    pub fn phase(&self) -> PowerPhase {
        *self.phase.read()
    }

    /// Applies a phase transition and publishes the matching `status`
    /// event. Transitions are totally ordered per server: every caller is
    /// either under the power lock or reacting to the single attach loop.
    pub fn set_phase(&self, phase: PowerPhase) {
        {
            let mut guard = self.phase.write();
            if *guard == phase {
                return;
            }
            *guard = phase;
        }
        debug!(server = %self.uuid, phase = %phase, "server phase changed");
        self.events
            .publish(topic::STATUS, json!(phase.to_string()));
    }

    /// Derives the initial phase from the runtime at load: a container
    /// already running resumes supervision as `running`.
    pub async fn sync_initial_state(self: &Arc<Self>) {
        match self.environment.is_running().await {
            Ok(true) => {
                if let Err(err) = self.environment.attach().await {
                    warn!(server = %self.uuid, error = %err, "failed to re-attach to running container");
                }
                self.set_phase(PowerPhase::Running);
                self.spawn_resource_poller();
            }
            Ok(false) => self.set_phase(PowerPhase::Offline),
            Err(err) => {
                warn!(server = %self.uuid, error = %err, "unable to inspect container at load");
            }
        }
    }

    // --- Console ----------------------------------------------------------

    fn record_console_line(&self, line: String) {
        {
            let mut buffer = self.log_buffer.lock();
            if buffer.len() == LOG_BUFFER_LINES {
                buffer.pop_front();
            }
            buffer.push_back(line.clone());
        }
        self.events.publish_str(topic::CONSOLE_OUTPUT, &line);
    }

    /// The last `LOG_BUFFER_LINES` console lines.
    pub fn recent_logs(&self) -> Vec<String> {
        self.log_buffer.lock().iter().cloned().collect()
    }

    /// Writes a command to the process's stdin. Ignored while offline.
    pub async fn send_command(&self, line: &str) -> Result<()> {
        if self.phase() == PowerPhase::Offline {
            return Err(HelmsmanError::IsOffline);
        }
        self.environment.send_command(line).await
    }

    // --- Stats ------------------------------------------------------------

    fn record_stats_sample(&self, sample: EnvironmentStats) {
        let usage =
            ResourceUsage::from_sample(sample, self.phase(), self.filesystem.cached_usage());
        *self.last_usage.write() = usage;
        self.events.publish(topic::STATS, json!(usage));
    }

    /// The last snapshot, with phase and disk usage refreshed.
    pub fn last_resource_usage(&self) -> ResourceUsage {
        let mut usage = *self.last_usage.read();
        usage.state = self.phase();
        usage.disk_bytes = self.filesystem.cached_usage();
        if usage.state == PowerPhase::Offline {
            usage = ResourceUsage::offline(usage.state, usage.disk_bytes);
        }
        usage
    }

    fn spawn_resource_poller(self: &Arc<Self>) {
        let server = self.clone();
        self.spawn_supervised("resource poller", async move {
            if let Err(err) = server.environment.poll_resources().await {
                debug!(server = %server.uuid, error = %err, "resource poller exited with error");
            }
        });
    }

    /// Spawns a per-server background task whose panic, should one
    /// happen, is recovered, logged once under a fresh UUID, and
    /// translated into a `daemon error` event on this server's bus.
    pub(crate) fn spawn_supervised<F>(self: &Arc<Self>, task: &'static str, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                let id = Uuid::new_v4();
                tracing::error!(
                    server = %server.uuid,
                    error_id = %id,
                    task,
                    panic = %panic_message(&panic),
                    "background task panicked"
                );
                server.events.publish(
                    topic::DAEMON_ERROR,
                    json!(format!(
                        "an unexpected error was encountered while handling this request: {id}"
                    )),
                );
            }
        });
    }

    // --- Teardown ---------------------------------------------------------

    /// Destroys this server: cancels the context tree (which closes every
    /// websocket session and loop), tears down the bus, removes the
    /// container, and deletes the data root.
    pub async fn destroy(&self) -> Result<()> {
        self.token.cancel();
        self.events.destroy();

        if let Err(err) = self.environment.destroy().await {
            warn!(server = %self.uuid, error = %err, "failed to remove container during delete");
        }

        let root = self.filesystem.path().to_path_buf();
        tokio::fs::remove_dir_all(&root).await.or_else(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Ok(())
            } else {
                Err(err)
            }
        })?;
        Ok(())
    }
}

/// Best-effort rendering of a panic payload for the log line.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
