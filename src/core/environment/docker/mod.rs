// src/core/environment/docker/mod.rs

//! The Docker-backed [`ProcessEnvironment`]. One instance supervises one
//! container whose name is the server's UUID.

use super::{
    EnvironmentHooks, EnvironmentSettings, ExitState, PowerPhase, ProcessEnvironment,
    ResourceLimits,
};
use crate::core::errors::{HelmsmanError, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::query_parameters::{
    InspectContainerOptions, KillContainerOptionsBuilder, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, WaitContainerOptions,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

mod attach;
mod container;
mod install;
mod power;
mod stats;

/// Supervises a single Docker container.
pub struct DockerEnvironment {
    uuid: Uuid,
    client: Docker,
    settings: RwLock<EnvironmentSettings>,
    hooks: EnvironmentHooks,
    state: Arc<RwLock<PowerPhase>>,
    /// Write half of the attached stdio stream, present while attached.
    /// Shared with the attach reader task, which clears it on stream end.
    stdin: SharedStdin,
    /// Cancelled when the owning server is deleted; unwinds the attach
    /// loop and the stats poller.
    token: CancellationToken,
}

type SharedStdin = Arc<tokio::sync::Mutex<Option<Pin<Box<dyn tokio::io::AsyncWrite + Send>>>>>;

/// Applies a lifecycle transition and notifies the owning server. Free
/// function so detached tasks (attach reader) can report without holding
/// the environment itself.
pub(super) fn set_state(
    state: &Arc<RwLock<PowerPhase>>,
    hooks: &EnvironmentHooks,
    phase: PowerPhase,
) {
    let changed = {
        let mut guard = state.write();
        if *guard == phase {
            false
        } else {
            *guard = phase;
            true
        }
    };
    if changed {
        (hooks.on_state)(phase);
    }
}

impl DockerEnvironment {
    pub fn new(
        uuid: Uuid,
        client: Docker,
        settings: EnvironmentSettings,
        hooks: EnvironmentHooks,
        token: CancellationToken,
    ) -> Self {
        Self {
            uuid,
            client,
            settings: RwLock::new(settings),
            hooks,
            state: Arc::new(RwLock::new(PowerPhase::Offline)),
            stdin: Arc::new(tokio::sync::Mutex::new(None)),
            token,
        }
    }

    /// The container name; servers and containers share a UUID.
    fn container_name(&self) -> String {
        self.uuid.to_string()
    }

    fn settings_snapshot(&self) -> EnvironmentSettings {
        self.settings.read().clone()
    }

    /// Updates the environment's own view of the lifecycle and notifies
    /// the owning server.
    fn set_state(&self, phase: PowerPhase) {
        debug!(server = %self.uuid, state = %phase, "environment state changed");
        set_state(&self.state, &self.hooks, phase);
    }

    /// When the container started, per the runtime.
    async fn started_at(&self) -> Result<Option<DateTime<Utc>>> {
        let inspect = self
            .client
            .inspect_container(&self.container_name(), None::<InspectContainerOptions>)
            .await?;
        let Some(state) = inspect.state else {
            return Ok(None);
        };
        if state.running != Some(true) {
            return Ok(None);
        }
        Ok(state
            .started_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)))
    }
}

#[async_trait]
impl ProcessEnvironment for DockerEnvironment {
    async fn exists(&self) -> Result<bool> {
        match self
            .client
            .inspect_container(&self.container_name(), None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn is_running(&self) -> Result<bool> {
        match self
            .client
            .inspect_container(&self.container_name(), None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(inspect.state.and_then(|s| s.running).unwrap_or(false)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn create(&self) -> Result<()> {
        self.create_container().await
    }

    async fn attach(&self) -> Result<()> {
        self.attach_streams().await
    }

    async fn start(&self) -> Result<()> {
        self.client
            .start_container(&self.container_name(), None::<StartContainerOptions>)
            .await?;
        self.set_state(PowerPhase::Running);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_process().await
    }

    async fn wait_for_stop(&self, timeout: Duration, terminate_on_timeout: bool) -> Result<()> {
        self.wait_for_stop_inner(timeout, terminate_on_timeout)
            .await
    }

    async fn terminate(&self, signal: &str) -> Result<()> {
        let options = KillContainerOptionsBuilder::default().signal(signal).build();
        match self
            .client
            .kill_container(&self.container_name(), Some(options))
            .await
        {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                // Already stopped; nothing to kill.
                status_code: 409, ..
            }) => {
                self.set_state(PowerPhase::Offline);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn destroy(&self) -> Result<()> {
        let options = RemoveContainerOptionsBuilder::default()
            .force(true)
            .v(true)
            .build();
        match self
            .client
            .remove_container(&self.container_name(), Some(options))
            .await
        {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn send_command(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(HelmsmanError::Internal(
                "no attached stdin stream for this container".to_string(),
            ));
        };
        stdin.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            stdin.write_all(b"\n").await?;
        }
        stdin.flush().await?;
        Ok(())
    }

    async fn read_log(&self, lines: usize) -> Result<Vec<String>> {
        let options = LogsOptionsBuilder::default()
            .stdout(true)
            .stderr(true)
            .tail(&lines.to_string())
            .build();
        let mut stream = self.client.logs(&self.container_name(), Some(options));

        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for line in String::from_utf8_lossy(&chunk.into_bytes()).lines() {
                out.push(line.to_string());
            }
        }
        Ok(out)
    }

    async fn uptime(&self) -> Result<i64> {
        Ok(self
            .started_at()
            .await?
            .map(|at| (Utc::now() - at).num_milliseconds().max(0))
            .unwrap_or(0))
    }

    async fn exit_state(&self) -> Result<ExitState> {
        let inspect = self
            .client
            .inspect_container(&self.container_name(), None::<InspectContainerOptions>)
            .await?;
        let state = inspect.state.unwrap_or_default();
        Ok(ExitState {
            exit_code: state.exit_code.unwrap_or(0),
            oom_killed: state.oom_killed.unwrap_or(false),
        })
    }

    async fn poll_resources(&self) -> Result<()> {
        self.poll_resources_inner().await
    }

    async fn in_situ_update(&self, limits: &ResourceLimits) -> Result<()> {
        self.apply_live_limits(limits).await
    }

    async fn run_installer(&self, spec: &super::InstallerSpec) -> Result<super::ExitState> {
        self.run_installer_inner(spec).await
    }

    fn update_settings(&self, settings: EnvironmentSettings) {
        *self.settings.write() = settings;
    }

    fn state(&self) -> PowerPhase {
        *self.state.read()
    }
}

/// Waits for the runtime to report the container gone/stopped.
pub(super) async fn wait_stopped(client: &Docker, name: &str) -> Result<()> {
    let mut stream = client.wait_container(name, None::<WaitContainerOptions>);
    while let Some(result) = stream.next().await {
        match result {
            Ok(_) => return Ok(()),
            // "No such container" and friends mean it is certainly not
            // running anymore.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(()),
            Err(bollard::errors::Error::DockerContainerWaitError { .. }) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
