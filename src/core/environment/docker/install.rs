// src/core/environment/docker/install.rs

//! The dedicated install container. Runs once to completion with the
//! server's data root and a script scratch directory mounted, streaming
//! every output line to install-observer subscribers.

use super::DockerEnvironment;
use crate::core::environment::{ExitState, InstallerSpec};
use crate::core::errors::Result;
use crate::core::events::topic;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptionsBuilder, InspectContainerOptions,
    RemoveContainerOptionsBuilder,
};
use futures::StreamExt;
use serde_json::Value;
use tracing::debug;

impl DockerEnvironment {
    pub(super) async fn run_installer_inner(&self, spec: &InstallerSpec) -> Result<ExitState> {
        let settings = self.settings_snapshot();
        let name = format!("{}_installer", self.uuid);

        // A leftover installer from an interrupted run is fair game.
        let _ = self
            .client
            .remove_container(
                &name,
                Some(RemoveContainerOptionsBuilder::default().force(true).build()),
            )
            .await;

        self.ensure_image(&spec.image, false).await?;

        let (cpu_quota, cpu_period) = spec
            .limits
            .cpu_quota()
            .map(|(q, p)| (Some(q), Some(p)))
            .unwrap_or((None, None));

        let host_config = HostConfig {
            memory: Some(spec.limits.memory_limit_bytes()),
            memory_swap: Some(spec.limits.memory_swap_bytes()),
            cpu_quota,
            cpu_period,
            binds: Some(vec![
                format!("{}:/mnt/server", settings.mounts.first().map(|m| m.source.clone()).unwrap_or_default()),
                format!("{}:/mnt/install", spec.script_dir),
            ]),
            dns: Some(settings.dns.clone()),
            network_mode: Some(settings.network_name.clone()),
            pids_limit: Some(settings.pid_limit),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            hostname: Some("installer".to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            image: Some(spec.image.clone()),
            cmd: Some(vec![
                spec.entrypoint.clone(),
                "/mnt/install/install.sh".to_string(),
            ]),
            env: Some(
                settings
                    .environment
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect(),
            ),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptionsBuilder::default().name(&name).build();
        self.client.create_container(Some(options), body).await?;

        // Attach before start so the script's first lines are captured.
        let attach_options = AttachContainerOptionsBuilder::default()
            .stream(true)
            .stdout(true)
            .stderr(true)
            .build();
        let results = self
            .client
            .attach_container(&name, Some(attach_options))
            .await?;

        self.client
            .start_container(&name, None::<bollard::query_parameters::StartContainerOptions>)
            .await?;

        let mut output = results.output;
        let mut partial = String::new();
        while let Some(chunk) = output.next().await {
            let Ok(data) = chunk else { break };
            partial.push_str(&String::from_utf8_lossy(&data.into_bytes()));
            while let Some(idx) = partial.find('\n') {
                let line: String = partial.drain(..=idx).collect();
                (self.hooks.publish)(
                    topic::INSTALL_OUTPUT,
                    Value::String(line.trim_end_matches(['\n', '\r']).to_string()),
                );
            }
        }

        super::wait_stopped(&self.client, &name).await?;

        let exit = self
            .client
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
            .ok()
            .and_then(|inspect| inspect.state)
            .map(|state| ExitState {
                exit_code: state.exit_code.unwrap_or(1),
                oom_killed: state.oom_killed.unwrap_or(false),
            })
            .unwrap_or(ExitState {
                exit_code: 1,
                oom_killed: false,
            });

        let _ = self
            .client
            .remove_container(
                &name,
                Some(RemoveContainerOptionsBuilder::default().force(true).build()),
            )
            .await;

        debug!(server = %self.uuid, exit_code = exit.exit_code, "installer container finished");
        Ok(exit)
    }
}
