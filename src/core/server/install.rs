// src/core/server/install.rs

//! Installation and reinstallation. The install script runs in a
//! dedicated one-shot container with the server's limits raised to the
//! configured floor; its output is streamed to install observers.

use super::Server;
use crate::core::environment::{ExitState, InstallerSpec, PowerPhase};
use crate::core::errors::{HelmsmanError, Result};
use crate::core::events::topic;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

impl Server {
    /// Runs the install script for this server. Regular power actions
    /// are rejected for the duration.
    pub async fn install(self: &Arc<Self>) -> Result<()> {
        if self
            .installing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HelmsmanError::Installing);
        }

        self.events.publish(topic::INSTALL_STARTED, json!(null));
        let result = self.run_install_container().await;
        self.installing.store(false, Ordering::Release);

        let successful = matches!(&result, Ok(exit) if exit.exit_code == 0);
        self.events.publish(
            topic::INSTALL_COMPLETED,
            json!({ "successful": successful }),
        );

        if let Err(err) = self
            .remote
            .set_installation_status(self.uuid, successful)
            .await
        {
            warn!(server = %self.uuid, error = %err, "failed to report installation status");
        }

        match result {
            Ok(exit) if exit.exit_code == 0 => Ok(()),
            Ok(exit) => Err(HelmsmanError::Internal(format!(
                "install script exited with code {}",
                exit.exit_code
            ))),
            Err(err) => Err(err),
        }
    }

    /// Stops the server (gracefully, escalating on timeout) and runs the
    /// installer again. Existing files are preserved.
    pub async fn reinstall(self: &Arc<Self>) -> Result<()> {
        if self.phase() != PowerPhase::Offline {
            self.set_phase(PowerPhase::Stopping);
            self.environment.stop().await?;
            self.environment
                .wait_for_stop(super::power::STOP_WAIT_TIMEOUT, true)
                .await?;
            self.set_phase(PowerPhase::Offline);
        }
        self.install().await
    }

    async fn run_install_container(&self) -> Result<ExitState> {
        let config = self.configuration();
        if config.skip_install || config.install.script.is_empty() {
            info!(server = %self.uuid, "skipping installation: no script configured");
            return Ok(ExitState {
                exit_code: 0,
                oom_killed: false,
            });
        }

        let node = self.node.get();

        // Raise the server's limits to the installer floor; an install
        // step routinely needs more headroom than the server itself.
        let mut limits = config.build.clone();
        let floor_memory = node.docker.installer_limits.memory as i64;
        if limits.memory > 0 && limits.memory < floor_memory {
            limits.memory = floor_memory;
        }
        let floor_cpu = node.docker.installer_limits.cpu as i64;
        if limits.cpu > 0 && limits.cpu < floor_cpu {
            limits.cpu = floor_cpu;
        }

        // Materialize the script into a scratch directory the installer
        // mounts read-only at /mnt/install.
        let scratch = tempfile::tempdir()?;
        let script = config.install.script.replace("\r\n", "\n");
        std::fs::write(scratch.path().join("install.sh"), script)?;

        let spec = InstallerSpec {
            image: config.install.container_image.clone(),
            entrypoint: config.install.entrypoint.clone(),
            script_dir: scratch.path().to_string_lossy().to_string(),
            limits,
        };

        info!(server = %self.uuid, image = %spec.image, "running install container");
        let exit = self.environment.run_installer(&spec).await?;
        // Installer output lands as root; hand the tree back to the
        // system user before the server next boots.
        self.filesystem.chown("")?;
        Ok(exit)
    }
}
