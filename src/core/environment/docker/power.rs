// src/core/environment/docker/power.rs

//! Stop and wait semantics for the Docker environment.

use super::{DockerEnvironment, wait_stopped};
use crate::core::environment::{PowerPhase, ProcessEnvironment, StopConfig};
use crate::core::errors::{HelmsmanError, Result};
use bollard::query_parameters::StopContainerOptionsBuilder;
use std::time::Duration;
use tracing::debug;

impl DockerEnvironment {
    /// Asks the process to stop using the server's configured mechanism:
    /// a console command written to stdin, an OS signal, or the runtime's
    /// native stop. When both a command and a signal are configured the
    /// command wins; signals remain the escalation path.
    pub(super) async fn stop_process(&self) -> Result<()> {
        let stop = self.settings_snapshot().stop;
        self.set_state(PowerPhase::Stopping);

        match stop {
            StopConfig::Command(line) => self.send_command(&line).await,
            StopConfig::Signal(signal) => self.terminate_keep_stopping(&signal).await,
            StopConfig::Native => {
                let options = StopContainerOptionsBuilder::default().t(30).build();
                match self
                    .client
                    .stop_container(&self.container_name(), Some(options))
                    .await
                {
                    Ok(())
                    | Err(bollard::errors::Error::DockerResponseServerError {
                        status_code: 304, ..
                    }) => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    /// Sends a signal without flipping the phase to offline; the attach
    /// loop observes the actual exit.
    async fn terminate_keep_stopping(&self, signal: &str) -> Result<()> {
        use bollard::query_parameters::KillContainerOptionsBuilder;
        let options = KillContainerOptionsBuilder::default().signal(signal).build();
        match self
            .client
            .kill_container(&self.container_name(), Some(options))
            .await
        {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Blocks until the container stops. On timeout, either escalates to
    /// SIGKILL or surfaces the timeout to the caller.
    pub(super) async fn wait_for_stop_inner(
        &self,
        timeout: Duration,
        terminate_on_timeout: bool,
    ) -> Result<()> {
        if !self.is_running().await? {
            return Ok(());
        }

        let name = self.container_name();
        let waited = tokio::time::timeout(timeout, wait_stopped(&self.client, &name)).await;

        match waited {
            Ok(result) => result,
            Err(_) if terminate_on_timeout => {
                debug!(server = %self.uuid, "graceful stop expired, terminating container");
                self.terminate("SIGKILL").await
            }
            Err(_) => Err(HelmsmanError::Internal(format!(
                "container failed to stop within {}s",
                timeout.as_secs()
            ))),
        }
    }
}
