// src/core/environment/docker/container.rs

//! Container construction: image pull, resource translation, stale
//! record detection, and the create call itself.

use super::DockerEnvironment;
use crate::core::environment::{EnvironmentSettings, ProcessEnvironment};
use crate::core::errors::Result;
use crate::core::events::topic;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding, RestartPolicy};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

impl DockerEnvironment {
    /// Ensures the container for this server exists and matches the
    /// current settings. A missing container is built; one whose stored
    /// record has gone stale (it no longer runs the configured image) is
    /// torn down and rebuilt.
    pub(super) async fn create_container(&self) -> Result<()> {
        let settings = self.settings_snapshot();

        match self
            .client
            .inspect_container(&self.container_name(), None::<InspectContainerOptions>)
            .await
        {
            Ok(existing) => {
                let recorded_image = existing
                    .config
                    .and_then(|config| config.image)
                    .unwrap_or_default();
                if recorded_image == settings.image {
                    return Ok(());
                }
                debug!(
                    server = %self.uuid,
                    recorded = %recorded_image,
                    configured = %settings.image,
                    "stored container record is stale"
                );
                self.recreate_container().await
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => self.build_container(&settings).await,
            Err(err) => Err(err.into()),
        }
    }

    /// Destroys whatever container currently holds this server's name and
    /// builds a fresh one from the current settings.
    pub(super) async fn recreate_container(&self) -> Result<()> {
        self.destroy().await?;
        let settings = self.settings_snapshot();
        self.build_container(&settings).await
    }

    /// Assembles and creates the container. The image is pulled first
    /// when missing locally (or unconditionally when configured to).
    async fn build_container(&self, settings: &EnvironmentSettings) -> Result<()> {
        self.ensure_image(&settings.image, false).await?;

        let limits = &settings.limits;
        let (cpu_quota, cpu_period) = limits
            .cpu_quota()
            .map(|(q, p)| (Some(q), Some(p)))
            .unwrap_or((None, None));

        let mut tmpfs = HashMap::new();
        tmpfs.insert(
            "/tmp".to_string(),
            format!("rw,exec,nosuid,size={}M", settings.tmpfs_size),
        );

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for mapping in &settings.ports {
            for proto in ["tcp", "udp"] {
                port_bindings
                    .entry(format!("{}/{}", mapping.port, proto))
                    .or_insert_with(|| Some(Vec::new()))
                    .get_or_insert_with(Vec::new)
                    .push(PortBinding {
                        host_ip: Some(mapping.ip.clone()),
                        host_port: Some(mapping.port.to_string()),
                    });
            }
        }

        let host_config = HostConfig {
            memory: Some(limits.memory_limit_bytes()),
            memory_swap: Some(limits.memory_swap_bytes()),
            memory_reservation: (limits.memory > 0).then(|| limits.memory * 1024 * 1024),
            cpu_quota,
            cpu_period,
            cpu_shares: Some(limits.cpu_shares()),
            cpuset_cpus: (!limits.threads.is_empty()).then(|| limits.threads.clone()),
            blkio_weight: limits.io_weight(),
            pids_limit: Some(settings.pid_limit),
            oom_kill_disable: Some(limits.oom_disabled),
            binds: Some(
                settings
                    .mounts
                    .iter()
                    .map(|m| {
                        let mode = if m.read_only { "ro" } else { "rw" };
                        format!("{}:{}:{}", m.source, m.target, mode)
                    })
                    .collect(),
            ),
            port_bindings: Some(port_bindings),
            dns: Some(settings.dns.clone()),
            tmpfs: Some(tmpfs),
            network_mode: Some(settings.network_name.clone()),
            restart_policy: Some(RestartPolicy {
                name: None,
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let env: Vec<String> = settings
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let body = ContainerCreateBody {
            hostname: Some(self.container_name()),
            user: Some(format!("{}:{}", settings.uid, settings.gid)),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            tty: Some(true),
            image: Some(settings.image.clone()),
            env: Some(env),
            labels: Some(settings.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptionsBuilder::default()
            .name(&self.container_name())
            .build();
        self.client.create_container(Some(options), body).await?;
        debug!(server = %self.uuid, image = %settings.image, "container created");
        Ok(())
    }

    /// Pulls the image when missing locally or when `force` is set. Pull
    /// progress is streamed to administrative subscribers; a failed pull
    /// falls back to a local copy when one exists.
    pub(super) async fn ensure_image(&self, image: &str, force: bool) -> Result<()> {
        let locally_present = self.client.inspect_image(image).await.is_ok();
        if locally_present && !force {
            return Ok(());
        }

        let options = CreateImageOptionsBuilder::default().from_image(image).build();
        let mut stream = self.client.create_image(Some(options), None, None);

        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        (self.hooks.publish)(
                            topic::INSTALL_OUTPUT,
                            Value::String(format!("Pulling image: {status}")),
                        );
                    }
                }
                Err(err) if locally_present => {
                    warn!(server = %self.uuid, image, error = %err, "image pull failed, using local copy");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}
