// src/core/server/power.rs

//! The power state machine. A single-slot lock serializes transitions;
//! callers that cannot take it within their timeout are turned away.

use super::Server;
use crate::core::environment::PowerPhase;
use crate::core::errors::{HelmsmanError, Result};
use crate::core::metrics;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tokio::sync::OwnedSemaphorePermit;
use tracing::info;

/// Default time a caller waits for the power lock.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Kill jumps the queue: it only waits long enough to beat a transition
/// that is already wrapping up.
const KILL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a graceful stop may take before a restart gives up.
pub(super) const STOP_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
    Kill,
}

impl Server {
    /// Executes a power action under the server's exclusive power lock.
    ///
    /// At most one action per server runs at a time; a caller that cannot
    /// take the lock within `timeout` (default 30s, much shorter for
    /// kill) receives `PowerActionInProgress`.
    pub async fn handle_power_action(
        self: &Arc<Self>,
        action: PowerAction,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if self.is_installing() && action != PowerAction::Kill {
            return Err(HelmsmanError::Installing);
        }
        if self.is_transferring() {
            return Err(HelmsmanError::Transferring);
        }

        let acquire_timeout = match action {
            PowerAction::Kill => KILL_ACQUIRE_TIMEOUT,
            _ => timeout.unwrap_or(DEFAULT_ACQUIRE_TIMEOUT),
        };
        let _permit = self.acquire_power_lock(acquire_timeout).await?;

        metrics::POWER_ACTIONS_TOTAL
            .with_label_values(&[&action.to_string()])
            .inc();
        info!(server = %self.uuid, action = %action, "processing power action");

        match action {
            PowerAction::Start => self.start_locked().await,
            PowerAction::Stop => self.stop_locked().await,
            PowerAction::Restart => self.restart_locked().await,
            PowerAction::Kill => self.kill_locked().await,
        }
    }

    async fn acquire_power_lock(&self, timeout: Duration) -> Result<OwnedSemaphorePermit> {
        match tokio::time::timeout(timeout, self.power_lock.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(HelmsmanError::Internal(
                "power lock semaphore closed".to_string(),
            )),
            Err(_) => Err(HelmsmanError::PowerActionInProgress),
        }
    }

    /// The start sequence, run while holding the power lock.
    pub(super) async fn start_locked(self: &Arc<Self>) -> Result<()> {
        if self.is_suspended() {
            return Err(HelmsmanError::Suspended);
        }
        if self.phase() != PowerPhase::Offline {
            return Err(HelmsmanError::IsRunning);
        }

        // The data directory may have been removed out from under a
        // stopped server; the mount must exist before the container does.
        tokio::fs::create_dir_all(self.filesystem.path()).await?;

        // A server over its quota does not get to boot and grow further.
        self.filesystem.has_space_err(true).await?;

        self.environment.create().await?;

        // Attach before start so the earliest process output is captured.
        self.environment.attach().await?;
        self.set_phase(PowerPhase::Starting);

        match self.environment.start().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.set_phase(PowerPhase::Offline);
                Err(err)
            }
        }
    }

    async fn stop_locked(&self) -> Result<()> {
        if self.phase() == PowerPhase::Offline {
            return Err(HelmsmanError::IsOffline);
        }
        self.set_phase(PowerPhase::Stopping);
        self.environment.stop().await
    }

    /// Restart is a graceful stop followed by a start. A wait timeout
    /// fails the restart; it never silently escalates to a kill.
    async fn restart_locked(self: &Arc<Self>) -> Result<()> {
        if self.phase() == PowerPhase::Offline {
            return Err(HelmsmanError::IsOffline);
        }
        self.set_phase(PowerPhase::Stopping);
        self.environment.stop().await?;
        self.environment
            .wait_for_stop(STOP_WAIT_TIMEOUT, false)
            .await?;
        self.set_phase(PowerPhase::Offline);
        self.start_locked().await
    }

    async fn kill_locked(&self) -> Result<()> {
        if self.phase() == PowerPhase::Offline {
            return Err(HelmsmanError::IsOffline);
        }
        self.set_phase(PowerPhase::Stopping);
        self.environment.terminate("SIGKILL").await
    }
}
