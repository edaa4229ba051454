use crate::model::{ContainerDetails, RestartPolicy};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

const MIB: i64 = 1024 * 1024;
const NANO_CPUS_PER_CPU: f64 = 1e9;

pub const DEFAULT_MEMORY_MB: u64 = 512;
pub const DEFAULT_CPUS: f64 = 1.0;
pub const DEFAULT_CPU_SHARES: u64 = 1024;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeMode {
    Ro,
    #[default]
    Rw,
}

impl VolumeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ro => "ro",
            Self::Rw => "rw",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartMode {
    #[default]
    No,
    Always,
    UnlessStopped,
    OnFailure,
}

impl RestartMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Always => "always",
            Self::UnlessStopped => "unless-stopped",
            Self::OnFailure => "on-failure",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "no" | "" => Some(Self::No),
            "always" => Some(Self::Always),
            "unless-stopped" => Some(Self::UnlessStopped),
            "on-failure" => Some(Self::OnFailure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSpec {
    pub host: String,
    pub container: String,
    pub mode: VolumeMode,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSpec {
    pub host: u16,
    pub container: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn key(&self) -> String {
        format!("{}/{}", self.container, self.protocol.as_str())
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// High-level settings for a new container, in user units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub image: String,
    pub name: Option<String>,
    pub memory_mb: Option<u64>,
    pub memory_swap_mb: Option<u64>,
    pub cpus: Option<f64>,
    pub cpu_shares: Option<u64>,
    pub volumes: Vec<VolumeSpec>,
    pub ports: Vec<PortSpec>,
    pub network_mode: Option<String>,
    pub environment: Vec<EnvVar>,
    pub working_dir: Option<String>,
    pub command: Option<String>,
    pub entrypoint: Option<String>,
    pub restart: RestartMode,
    pub auto_remove: bool,
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    /// Fills unset or zero resource limits with the create form's defaults.
    pub fn with_defaults(mut self) -> Self {
        if self.memory_mb.unwrap_or(0) == 0 {
            self.memory_mb = Some(DEFAULT_MEMORY_MB);
        }
        if self.cpus.unwrap_or(0.0) <= 0.0 {
            self.cpus = Some(DEFAULT_CPUS);
        }
        if self.cpu_shares.unwrap_or(0) == 0 {
            self.cpu_shares = Some(DEFAULT_CPU_SHARES);
        }
        self
    }

    pub fn container_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    pub fn to_create_body(&self) -> CreateContainerBody {
        let mut body = CreateContainerBody::from_image(self.image.trim());

        body.env = self
            .environment
            .iter()
            .filter(|var| !var.key.trim().is_empty())
            .map(|var| format!("{}={}", var.key.trim(), var.value))
            .collect();
        body.cmd = split_words(self.command.as_deref());
        body.entrypoint = split_words(self.entrypoint.as_deref());
        body.working_dir = non_blank(self.working_dir.as_deref());

        for port in self.ports.iter().filter(|port| port.container > 0) {
            body.exposed_ports.insert(port.key(), json!({}));
            if port.host > 0 {
                body.host_config
                    .port_bindings
                    .entry(port.key())
                    .or_default()
                    .push(HostPort {
                        host_ip: String::new(),
                        host_port: port.host.to_string(),
                    });
            }
        }

        let host = &mut body.host_config;
        host.memory = self.memory_mb.filter(|mb| *mb > 0).map(megabytes);
        host.memory_swap = self.memory_swap_mb.filter(|mb| *mb > 0).map(megabytes);
        host.nano_cpus = self
            .cpus
            .filter(|cpus| *cpus > 0.0)
            .map(|cpus| (cpus * NANO_CPUS_PER_CPU).round() as i64);
        host.cpu_shares = self
            .cpu_shares
            .filter(|shares| *shares > 0)
            .map(|shares| i64::try_from(shares).unwrap_or(i64::MAX));
        host.binds = self
            .volumes
            .iter()
            .filter(|volume| !volume.host.trim().is_empty() && !volume.container.trim().is_empty())
            .map(|volume| {
                format!(
                    "{}:{}:{}",
                    volume.host.trim(),
                    volume.container.trim(),
                    volume.mode.as_str()
                )
            })
            .collect();
        host.network_mode = non_blank(self.network_mode.as_deref());
        host.restart_policy = Some(RestartPolicy {
            name: self.restart.as_str().to_string(),
            maximum_retry_count: 0,
        });
        host.auto_remove = self.auto_remove;

        body
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostPort {
    pub host_ip: String,
    pub host_port: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateHostConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_swap: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nano_cpus: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub port_bindings: BTreeMap<String, Vec<HostPort>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
    pub auto_remove: bool,
}

/// Engine-shaped body for `POST /containers/create`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainerBody {
    pub image: String,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub tty: bool,
    pub open_stdin: bool,
    pub stdin_once: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, Value>,
    pub host_config: CreateHostConfig,
}

impl CreateContainerBody {
    pub fn from_image(image: &str) -> Self {
        Self {
            image: image.to_string(),
            attach_stdin: false,
            attach_stdout: true,
            attach_stderr: true,
            tty: true,
            open_stdin: false,
            stdin_once: false,
            env: Vec::new(),
            cmd: None,
            entrypoint: None,
            working_dir: None,
            exposed_ports: BTreeMap::new(),
            host_config: CreateHostConfig::default(),
        }
    }

    /// Body for a duplicate of an inspected container: same image, env,
    /// command, working dir and exposed ports. Host settings are not carried.
    pub fn copy_of(details: &ContainerDetails) -> Self {
        let config = &details.config;
        let image = if config.image.is_empty() {
            details.image.as_str()
        } else {
            config.image.as_str()
        };

        let mut body = Self::from_image(image);
        body.env = config.env.clone();
        body.cmd = (!config.cmd.is_empty()).then(|| config.cmd.clone());
        body.working_dir = non_blank(Some(&config.working_dir));
        body.exposed_ports = config.exposed_ports.clone();
        body
    }
}

fn megabytes(mb: u64) -> i64 {
    i64::try_from(mb).unwrap_or(i64::MAX).saturating_mul(MIB)
}

fn split_words(value: Option<&str>) -> Option<Vec<String>> {
    let words = value?
        .split_whitespace()
        .map(str::to_string)
        .collect::<Vec<_>>();
    (!words.is_empty()).then_some(words)
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
