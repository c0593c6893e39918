// src/core/environment/docker/attach.rs

//! The container attach loop: a dedicated task that owns the stdio
//! stream, splits output into lines, applies the console throttle, and
//! hands surviving lines to the owning server.

use super::{DockerEnvironment, set_state};
use crate::core::errors::Result;
use crate::core::events::topic;
use crate::core::metrics;
use bollard::query_parameters::AttachContainerOptionsBuilder;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::core::environment::{EnvironmentHooks, PowerPhase};

/// Token-bucket throttle over console lines. When the bucket empties, the
/// rest of the window is dropped and the drops are counted; the contained
/// process itself is never punished for being noisy.
struct ConsoleThrottle {
    enabled: bool,
    capacity: u64,
    remaining: u64,
    period: Duration,
    window_started: Instant,
    dropped_in_window: u64,
}

impl ConsoleThrottle {
    fn new(enabled: bool, capacity: u64, period: Duration) -> Self {
        Self {
            enabled,
            capacity,
            remaining: capacity,
            period,
            window_started: Instant::now(),
            dropped_in_window: 0,
        }
    }

    /// Returns whether this line may pass. Refills on window rollover.
    fn allow(&mut self, hooks: &EnvironmentHooks) -> bool {
        if !self.enabled {
            return true;
        }
        if self.window_started.elapsed() >= self.period {
            if self.dropped_in_window > 0 {
                debug!(dropped = self.dropped_in_window, "console throttle window closed");
            }
            self.window_started = Instant::now();
            self.remaining = self.capacity;
            self.dropped_in_window = 0;
        }
        if self.remaining == 0 {
            if self.dropped_in_window == 0 {
                (hooks.publish)(
                    topic::DAEMON_MESSAGE,
                    Value::String(
                        "server is outputting console data too quickly, output is being throttled"
                            .to_string(),
                    ),
                );
            }
            self.dropped_in_window += 1;
            metrics::THROTTLED_LINES_TOTAL.inc();
            return false;
        }
        self.remaining -= 1;
        true
    }
}

impl DockerEnvironment {
    /// Attaches to the container's stdio. Must run before start so the
    /// earliest lines of the contained process are captured. The reader
    /// task lives until the stream ends (container stopped) or the
    /// server's context is cancelled.
    pub(super) async fn attach_streams(&self) -> Result<()> {
        {
            let guard = self.stdin.lock().await;
            if guard.is_some() {
                // Already attached; attaching twice would duplicate output.
                return Ok(());
            }
        }

        let options = AttachContainerOptionsBuilder::default()
            .stream(true)
            .stdin(true)
            .stdout(true)
            .stderr(true)
            .build();
        let results = self
            .client
            .attach_container(&self.container_name(), Some(options))
            .await?;

        *self.stdin.lock().await = Some(results.input);

        let mut output = results.output;
        let hooks = self.hooks.clone();
        let state = self.state.clone();
        let stdin = self.stdin.clone();
        let token = self.token.clone();
        let settings = self.settings_snapshot();
        let uuid = self.uuid;

        let panic_hooks = hooks.clone();
        tokio::spawn(async move {
            let reader = async move {
                let mut throttle = ConsoleThrottle::new(
                    settings.throttle_enabled,
                    settings.throttle_lines,
                    settings.throttle_period,
                );
                let mut partial = String::new();

                loop {
                    tokio::select! {
                        chunk = output.next() => {
                            match chunk {
                                Some(Ok(data)) => {
                                    partial.push_str(&String::from_utf8_lossy(&data.into_bytes()));
                                    while let Some(idx) = partial.find('\n') {
                                        let line: String = partial.drain(..=idx).collect();
                                        let line = line.trim_end_matches(['\n', '\r']);
                                        if throttle.allow(&hooks) {
                                            (hooks.on_output)(line.to_string());
                                        }
                                    }
                                }
                                Some(Err(err)) => {
                                    debug!(server = %uuid, error = %err, "attach stream error");
                                    break;
                                }
                                // Stream closed: the contained process exited.
                                None => break,
                            }
                        }
                        _ = token.cancelled() => break,
                    }
                }

                if !partial.is_empty() && throttle.allow(&hooks) {
                    (hooks.on_output)(partial.trim_end_matches(['\n', '\r']).to_string());
                }

                *stdin.lock().await = None;
                if !token.is_cancelled() {
                    set_state(&state, &hooks, PowerPhase::Offline);
                }
                debug!(server = %uuid, "attach loop terminated");
            };

            // A panic here must not vanish with the task: recover it,
            // log it once, and surface it to this server's subscribers.
            if let Err(panic) = AssertUnwindSafe(reader).catch_unwind().await {
                let id = uuid::Uuid::new_v4();
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                error!(server = %uuid, error_id = %id, panic = %detail, "attach loop panicked");
                (panic_hooks.publish)(
                    topic::DAEMON_ERROR,
                    Value::String(format!(
                        "an unexpected error was encountered while handling this request: {id}"
                    )),
                );
            }
        });

        Ok(())
    }
}
