use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ResourceClass {
    Containers,
    Images,
    Volumes,
    Networks,
}

impl ResourceClass {
    pub const ALL: [Self; 4] = [Self::Containers, Self::Images, Self::Volumes, Self::Networks];

    pub fn title(self) -> &'static str {
        match self {
            Self::Containers => "Containers",
            Self::Images => "Images",
            Self::Volumes => "Volumes",
            Self::Networks => "Networks",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Containers => 0,
            Self::Images => 1,
            Self::Volumes => 2,
            Self::Networks => 3,
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "c" | "ps" | "container" | "containers" => Some(Self::Containers),
            "i" | "img" | "image" | "images" => Some(Self::Images),
            "v" | "vol" | "volume" | "volumes" => Some(Self::Volumes),
            "n" | "net" | "network" | "networks" => Some(Self::Networks),
            _ => None,
        }
    }
}

impl Display for ResourceClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.title())
    }
}

/// Engine payloads send `null` for empty lists and maps; treat it as empty.
pub(crate) fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PortMapping {
    #[serde(rename = "IP")]
    pub ip: Option<String>,
    pub private_port: u16,
    pub public_port: Option<u16>,
    #[serde(rename = "Type")]
    pub protocol: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MountPoint {
    #[serde(rename = "Type")]
    pub kind: String,
    pub name: Option<String>,
    pub source: String,
    pub destination: String,
    pub mode: String,
    #[serde(rename = "RW")]
    pub rw: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Container {
    pub id: String,
    #[serde(deserialize_with = "null_default")]
    pub names: Vec<String>,
    pub image: String,
    #[serde(rename = "ImageID")]
    pub image_id: String,
    pub command: String,
    pub created: i64,
    #[serde(deserialize_with = "null_default")]
    pub ports: Vec<PortMapping>,
    #[serde(deserialize_with = "null_default")]
    pub labels: BTreeMap<String, String>,
    pub state: String,
    pub status: String,
    #[serde(deserialize_with = "null_default")]
    pub mounts: Vec<MountPoint>,
}

impl Container {
    /// Primary name without the engine's leading slash.
    pub fn name(&self) -> &str {
        self.names
            .first()
            .map(|name| name.trim_start_matches('/'))
            .unwrap_or("")
    }

    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }

    pub fn created_at(&self) -> Option<DateTime<Local>> {
        unix_to_local(self.created)
    }

    pub fn ports_summary(&self) -> String {
        if self.ports.is_empty() {
            return "-".to_string();
        }

        self.ports
            .iter()
            .map(|port| match port.public_port {
                Some(public) => format!("{public}->{}/{}", port.private_port, port.protocol),
                None => format!("{}/{}", port.private_port, port.protocol),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Image {
    pub id: String,
    pub parent_id: String,
    #[serde(deserialize_with = "null_default")]
    pub repo_tags: Vec<String>,
    #[serde(deserialize_with = "null_default")]
    pub repo_digests: Vec<String>,
    pub created: i64,
    pub size: i64,
    pub shared_size: i64,
    #[serde(deserialize_with = "null_default")]
    pub labels: BTreeMap<String, String>,
    pub containers: i64,
}

impl Image {
    pub fn primary_tag(&self) -> &str {
        self.repo_tags
            .first()
            .map(String::as_str)
            .unwrap_or("<none>:<none>")
    }

    pub fn short_id(&self) -> &str {
        short_id(self.id.trim_start_matches("sha256:"))
    }

    pub fn created_at(&self) -> Option<DateTime<Local>> {
        unix_to_local(self.created)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Volume {
    pub name: String,
    pub driver: String,
    pub mountpoint: String,
    pub created_at: String,
    pub scope: String,
    #[serde(deserialize_with = "null_default")]
    pub labels: BTreeMap<String, String>,
    #[serde(deserialize_with = "null_default")]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub(crate) struct VolumeList {
    #[serde(deserialize_with = "null_default")]
    pub volumes: Vec<Volume>,
    #[serde(deserialize_with = "null_default")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IpamConfig {
    pub subnet: Option<String>,
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Ipam {
    pub driver: String,
    #[serde(deserialize_with = "null_default")]
    pub config: Vec<IpamConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Network {
    pub name: String,
    pub id: String,
    pub created: String,
    pub scope: String,
    pub driver: String,
    #[serde(rename = "EnableIPv6")]
    pub enable_ipv6: bool,
    #[serde(rename = "IPAM")]
    pub ipam: Ipam,
    pub internal: bool,
    pub attachable: bool,
    #[serde(deserialize_with = "null_default")]
    pub containers: BTreeMap<String, Value>,
    #[serde(deserialize_with = "null_default")]
    pub labels: BTreeMap<String, String>,
}

impl Network {
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    pub fn subnets(&self) -> Vec<&str> {
        self.ipam
            .config
            .iter()
            .filter_map(|config| config.subnet.as_deref())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerState {
    pub status: String,
    pub running: bool,
    pub paused: bool,
    pub restarting: bool,
    #[serde(rename = "OOMKilled")]
    pub oom_killed: bool,
    pub dead: bool,
    pub pid: i64,
    pub exit_code: i64,
    pub error: String,
    pub started_at: String,
    pub finished_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerConfigSection {
    pub hostname: String,
    pub user: String,
    pub image: String,
    #[serde(deserialize_with = "null_default")]
    pub env: Vec<String>,
    #[serde(deserialize_with = "null_default")]
    pub cmd: Vec<String>,
    #[serde(deserialize_with = "null_default")]
    pub entrypoint: Vec<String>,
    pub working_dir: String,
    #[serde(deserialize_with = "null_default")]
    pub exposed_ports: BTreeMap<String, Value>,
    #[serde(deserialize_with = "null_default")]
    pub labels: BTreeMap<String, String>,
    pub tty: bool,
    pub open_stdin: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RestartPolicy {
    pub name: String,
    pub maximum_retry_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HostConfigSection {
    #[serde(deserialize_with = "null_default")]
    pub binds: Vec<String>,
    pub network_mode: String,
    #[serde(deserialize_with = "null_default")]
    pub port_bindings: BTreeMap<String, Value>,
    pub restart_policy: RestartPolicy,
    pub auto_remove: bool,
    pub memory: i64,
    pub nano_cpus: i64,
    pub cpu_shares: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NetworkSettingsSection {
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(deserialize_with = "null_default")]
    pub networks: BTreeMap<String, Value>,
    #[serde(deserialize_with = "null_default")]
    pub ports: BTreeMap<String, Value>,
}

/// Full inspect object for one container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub created: String,
    pub path: String,
    #[serde(deserialize_with = "null_default")]
    pub args: Vec<String>,
    pub state: ContainerState,
    pub image: String,
    pub restart_count: i64,
    pub driver: String,
    pub platform: String,
    #[serde(rename = "ExecIDs", deserialize_with = "null_default")]
    pub exec_ids: Vec<String>,
    pub config: ContainerConfigSection,
    pub host_config: HostConfigSection,
    pub network_settings: NetworkSettingsSection,
    #[serde(deserialize_with = "null_default")]
    pub mounts: Vec<MountPoint>,
}

impl ContainerDetails {
    pub fn display_name(&self) -> &str {
        self.name.trim_start_matches('/')
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CreatedResponse {
    pub id: String,
    #[serde(deserialize_with = "null_default")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExecInspect {
    #[serde(rename = "ID")]
    pub id: String,
    pub running: bool,
    pub exit_code: Option<i64>,
    #[serde(rename = "ContainerID")]
    pub container_id: String,
    pub pid: i64,
    pub open_stdin: bool,
    pub open_stdout: bool,
    pub open_stderr: bool,
    pub can_remove: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SystemInfo {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub containers: i64,
    pub containers_running: i64,
    pub containers_paused: i64,
    pub containers_stopped: i64,
    pub images: i64,
    pub driver: String,
    pub server_version: String,
    pub operating_system: String,
    #[serde(rename = "OSType")]
    pub os_type: String,
    pub architecture: String,
    #[serde(rename = "NCPU")]
    pub ncpu: i64,
    pub mem_total: i64,
    pub kernel_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VersionInfo {
    pub version: String,
    pub api_version: String,
    #[serde(rename = "MinAPIVersion")]
    pub min_api_version: String,
    pub git_commit: String,
    pub go_version: String,
    pub os: String,
    pub arch: String,
    pub kernel_version: String,
    pub build_time: String,
}

/// Host-level usage reading; replaced wholesale on every sampling tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemUsageReading {
    pub cpu_percent: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub memory_percent: f64,
    pub timestamp: DateTime<Utc>,
}

impl SystemUsageReading {
    pub fn new(cpu_percent: f64, memory_used: u64, memory_total: u64) -> Self {
        Self {
            cpu_percent: cpu_percent.clamp(0.0, 100.0),
            memory_used,
            memory_total,
            memory_percent: percent_of(memory_used as f64, memory_total as f64),
            timestamp: Utc::now(),
        }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0, 0)
    }
}

pub trait Searchable {
    fn search_fields(&self) -> Vec<&str>;

    fn matches_filter(&self, query: &str) -> bool {
        if query.trim().is_empty() {
            return true;
        }

        let query_lower = query.to_lowercase();
        self.search_fields()
            .iter()
            .any(|field| field.to_lowercase().contains(&query_lower))
    }
}

impl Searchable for Container {
    fn search_fields(&self) -> Vec<&str> {
        let mut fields = self.names.iter().map(String::as_str).collect::<Vec<_>>();
        fields.extend([
            self.image.as_str(),
            self.id.as_str(),
            self.state.as_str(),
            self.status.as_str(),
        ]);
        fields
    }
}

impl Searchable for Image {
    fn search_fields(&self) -> Vec<&str> {
        let mut fields = vec![self.id.as_str()];
        fields.extend(self.repo_tags.iter().map(String::as_str));
        fields.extend(self.repo_digests.iter().map(String::as_str));
        fields
    }
}

impl Searchable for Volume {
    fn search_fields(&self) -> Vec<&str> {
        vec![
            self.name.as_str(),
            self.driver.as_str(),
            self.mountpoint.as_str(),
        ]
    }
}

impl Searchable for Network {
    fn search_fields(&self) -> Vec<&str> {
        vec![
            self.name.as_str(),
            self.id.as_str(),
            self.driver.as_str(),
            self.scope.as_str(),
        ]
    }
}

pub fn filter_items<T>(items: &[T], query: &str) -> Vec<T>
where
    T: Searchable + Clone,
{
    items
        .iter()
        .filter(|item| item.matches_filter(query))
        .cloned()
        .collect()
}

/// Running-state counts used by summaries and the derived usage heuristic.
pub fn state_counts(containers: &[Container]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for container in containers {
        *counts.entry(container.state.to_ascii_lowercase()).or_insert(0) += 1;
    }
    counts
}

pub fn percent_of(value: f64, total: f64) -> f64 {
    if total <= 0.0 || !value.is_finite() {
        return 0.0;
    }
    (value / total * 100.0).clamp(0.0, 100.0)
}

pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((index, _)) => &id[..index],
        None => id,
    }
}

pub fn format_bytes(value: u64) -> String {
    const UNITS: [(&str, f64); 5] = [
        ("TB", 1_099_511_627_776.0),
        ("GB", 1_073_741_824.0),
        ("MB", 1_048_576.0),
        ("KB", 1_024.0),
        ("B", 1.0),
    ];
    if value == 0 {
        return "0 B".to_string();
    }

    let value_f64 = value as f64;
    for (suffix, unit_size) in UNITS {
        if value_f64 >= unit_size {
            let scaled = value_f64 / unit_size;
            let rendered = format!("{scaled:.2}");
            let rendered = rendered.trim_end_matches('0').trim_end_matches('.');
            return format!("{rendered} {suffix}");
        }
    }
    format!("{value} B")
}

pub fn human_age(timestamp: Option<DateTime<Local>>) -> String {
    let Some(timestamp) = timestamp else {
        return "-".to_string();
    };

    let elapsed_seconds = (Local::now() - timestamp).num_seconds().max(0);
    format_elapsed_seconds(elapsed_seconds)
}

fn format_elapsed_seconds(seconds: i64) -> String {
    if seconds >= 86_400 {
        return format!("{}d", seconds / 86_400);
    }

    if seconds >= 3_600 {
        return format!("{}h", seconds / 3_600);
    }

    if seconds >= 60 {
        return format!("{}m", seconds / 60);
    }

    format!("{seconds}s")
}

fn unix_to_local(seconds: i64) -> Option<DateTime<Local>> {
    if seconds <= 0 {
        return None;
    }
    Local.timestamp_opt(seconds, 0).single()
}
