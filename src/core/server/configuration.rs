// src/core/server/configuration.rs

//! The per-server configuration snapshot fetched from the panel. The
//! aggregate holds one immutable copy and swaps it wholesale on sync.

use crate::config::Config;
use crate::core::environment::{
    EnvironmentSettings, Mount, PortMapping, ResourceLimits, StopConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The ip:port pair clients connect to, plus any extra bindings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Allocations {
    #[serde(default)]
    pub default: Allocation,
    /// ip -> additional ports bound on that ip.
    #[serde(default)]
    pub mappings: HashMap<String, Vec<u16>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub ip: String,
    pub port: u16,
}

impl Default for Allocation {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSettings {
    #[serde(default)]
    pub image: String,
}

/// Script run inside the dedicated install container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallScript {
    #[serde(default)]
    pub container_image: String,
    #[serde(default = "default_install_entrypoint")]
    pub entrypoint: String,
    #[serde(default)]
    pub script: String,
}

fn default_install_entrypoint() -> String {
    "bash".to_string()
}

/// Panel-side game preset metadata the agent cares about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EggSettings {
    #[serde(default)]
    pub id: String,
    /// Glob patterns clients may never modify.
    #[serde(default)]
    pub file_denylist: Vec<String>,
}

/// Everything the panel knows about one server, as the agent consumes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfiguration {
    pub uuid: Uuid,
    #[serde(default)]
    pub suspended: bool,
    /// The start command, with `{{VAR}}`-style placeholders already
    /// resolved by the panel.
    #[serde(default)]
    pub invocation: String,
    #[serde(default)]
    pub skip_install: bool,
    /// Whether a clean exit should still be treated as a crash.
    #[serde(default)]
    pub crash_detection_enabled: bool,
    /// User-defined variables; values arrive as arbitrary JSON scalars.
    #[serde(default)]
    pub environment: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub allocations: Allocations,
    #[serde(default)]
    pub build: ResourceLimits,
    #[serde(default)]
    pub container: ContainerSettings,
    #[serde(default)]
    pub stop: StopConfig,
    #[serde(default)]
    pub egg: EggSettings,
    #[serde(default)]
    pub install: InstallScript,
}

impl ServerConfiguration {
    /// Merges the panel variables with the agent's ambient ones into the
    /// container environment. `TZ` carries the host timezone, allocation
    /// details are exposed under their conventional names, and a literal
    /// `$$` in a value escapes to a single `$`.
    pub fn environment_variables(&self, agent: &Config) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = HashMap::new();
        env.insert("TZ".to_string(), agent.system.timezone.clone());
        env.insert("STARTUP".to_string(), self.invocation.clone());
        env.insert("SERVER_UUID".to_string(), self.uuid.to_string());
        env.insert("SERVER_IP".to_string(), self.allocations.default.ip.clone());
        env.insert(
            "SERVER_PORT".to_string(),
            self.allocations.default.port.to_string(),
        );

        for (key, value) in &self.environment {
            let raw = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            env.insert(key.clone(), raw.replace("$$", "$"));
        }
        env
    }

    /// All ip:port pairs this server's container binds.
    pub fn port_mappings(&self) -> Vec<PortMapping> {
        let mut ports = vec![PortMapping {
            ip: self.allocations.default.ip.clone(),
            port: self.allocations.default.port,
        }];
        for (ip, extra) in &self.allocations.mappings {
            for port in extra {
                ports.push(PortMapping {
                    ip: ip.clone(),
                    port: *port,
                });
            }
        }
        ports
    }

    /// Assembles the container runtime settings for this server.
    pub fn environment_settings(&self, agent: &Config, data_root: &std::path::Path) -> EnvironmentSettings {
        let mut labels = HashMap::new();
        labels.insert("Service".to_string(), "Helmsman".to_string());
        labels.insert("ContainerType".to_string(), "server_process".to_string());

        EnvironmentSettings {
            image: self.container.image.clone(),
            invocation: self.invocation.clone(),
            environment: self.environment_variables(agent),
            limits: self.build.clone(),
            mounts: vec![Mount {
                source: data_root.to_string_lossy().to_string(),
                target: "/home/container".to_string(),
                read_only: false,
            }],
            ports: self.port_mappings(),
            stop: self.stop.clone(),
            uid: agent.system.user.uid,
            gid: agent.system.user.gid,
            pid_limit: agent.docker.container_pid_limit,
            network_name: agent.docker.network_name.clone(),
            dns: agent.docker.dns.clone(),
            tmpfs_size: agent.docker.tmpfs_size,
            labels,
            throttle_enabled: agent.throttles.enabled,
            throttle_lines: agent.throttles.lines,
            throttle_period: agent.throttles.period,
        }
    }
}
