// src/core/server/crash.rs

//! Crash detection: reacting to a container that stopped without anyone
//! asking it to.

use super::Server;
use crate::core::environment::PowerPhase;
use crate::core::events::topic;
use crate::core::metrics;
use crate::core::server::power::PowerAction;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

impl Server {
    /// Entry point for every container-level lifecycle transition the
    /// environment reports.
    pub(crate) async fn handle_environment_transition(self: Arc<Self>, phase: PowerPhase) {
        // Notifications arrive on spawned tasks; one that no longer
        // matches the environment's current state is stale (e.g. the
        // `offline` from a stop landing after a restart already brought
        // the container back up) and must be ignored.
        if self.environment.state() != phase {
            return;
        }

        match phase {
            PowerPhase::Starting => self.set_phase(PowerPhase::Starting),
            PowerPhase::Running => {
                self.set_phase(PowerPhase::Running);
                self.spawn_resource_poller();
            }
            PowerPhase::Stopping => self.set_phase(PowerPhase::Stopping),
            PowerPhase::Offline => {
                let prior = self.phase();
                self.set_phase(PowerPhase::Offline);

                // A stop that was asked for is not a crash; neither is an
                // install container churning while the server sits idle.
                if prior == PowerPhase::Stopping || prior == PowerPhase::Offline {
                    return;
                }
                if self.is_installing() || self.is_transferring() {
                    return;
                }
                self.handle_crash().await;
            }
        }
    }

    /// The container went down unexpectedly. Reports the exit details to
    /// console subscribers and restarts, unless detection is disabled or
    /// the server already crashed inside the sliding window.
    async fn handle_crash(self: &Arc<Self>) {
        let exit = self.environment.exit_state().await.unwrap_or_default();
        let node = self.node.get();
        let policy = &node.system.crash_detection;
        let config = self.configuration();

        if exit.exit_code == 0 && !exit.oom_killed && !policy.detect_clean_exit_as_crash {
            return;
        }

        metrics::CRASHES_DETECTED_TOTAL.inc();
        self.events.publish_str(
            topic::DAEMON_MESSAGE,
            "---------- Detected server process in a crashed state! ----------",
        );
        self.events.publish_str(
            topic::DAEMON_MESSAGE,
            &format!("Exit code: {}", exit.exit_code),
        );
        self.events.publish_str(
            topic::DAEMON_MESSAGE,
            &format!("Out of memory: {}", exit.oom_killed),
        );

        if !policy.enabled || !config.crash_detection_enabled {
            info!(
                server = %self.uuid,
                "server crashed, but crash detection is disabled; not restarting"
            );
            return;
        }

        let window = Duration::from_secs(policy.restart_window_seconds);
        {
            let mut last = self.last_crash.lock();
            if let Some(at) = *last {
                if at.elapsed() < window {
                    self.events.publish_str(
                        topic::DAEMON_MESSAGE,
                        &format!(
                            "Aborting automatic restart, last crash occurred less than {} seconds ago.",
                            window.as_secs()
                        ),
                    );
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        info!(server = %self.uuid, "restarting server after crash");
        if let Err(err) = self.handle_power_action(PowerAction::Start, None).await {
            warn!(server = %self.uuid, error = %err, "failed to restart crashed server");
            self.events.publish_str(
                topic::DAEMON_MESSAGE,
                "Failed to restart the server after it crashed.",
            );
        }
    }
}
