use crate::terminal::{DEFAULT_SHELL, TerminalMode};
use crate::transport::{DEFAULT_TCP_PORT, DEFAULT_TIMEOUT, Endpoint};
use crate::usage::UsageSource;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_REFRESH_MS: u64 = 5_000;
const DEFAULT_USAGE_INTERVAL_MS: u64 = 5_000;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;

/// Resolved settings: file values, then command-line overrides, then
/// built-in defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub source: Option<String>,
    pub endpoint: Endpoint,
    pub timeout: Duration,
    pub refresh: Duration,
    pub usage_interval: Duration,
    pub usage_source: UsageSource,
    pub terminal_mode: TerminalMode,
    pub shell: String,
    pub stop_timeout_secs: u64,
}

/// Command-line values that win over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub endpoint: Option<String>,
    pub timeout_ms: Option<u64>,
    pub refresh_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct DockhandConfigFile {
    #[serde(default, alias = "host")]
    endpoint: Option<String>,
    #[serde(default, alias = "timeout")]
    timeout_ms: Option<u64>,
    #[serde(default, alias = "refresh")]
    refresh_ms: Option<u64>,
    #[serde(default)]
    usage_interval_ms: Option<u64>,
    #[serde(default)]
    usage_source: UsageSource,
    #[serde(default)]
    terminal_mode: TerminalMode,
    #[serde(default)]
    shell: Option<String>,
    #[serde(default)]
    stop_timeout_secs: Option<u64>,
}

impl RuntimeConfig {
    pub fn load(overrides: &Overrides) -> Result<Self> {
        let path = discover_config_path();
        let file = match &path {
            Some(path) => read_config_file(path)?,
            None => DockhandConfigFile::default(),
        };
        Self::resolve(path.map(|path| path.display().to_string()), file, overrides)
    }

    fn resolve(
        source: Option<String>,
        file: DockhandConfigFile,
        overrides: &Overrides,
    ) -> Result<Self> {
        let endpoint = match overrides.endpoint.as_ref().or(file.endpoint.as_ref()) {
            Some(raw) => raw
                .parse::<Endpoint>()
                .with_context(|| format!("invalid engine endpoint {raw}"))?,
            None => detect_endpoint(
                std::env::var("DOCKER_HOST").ok(),
                std::env::var_os("HOME").map(PathBuf::from),
                |path| path.exists(),
            )?,
        };

        let timeout_ms = overrides
            .timeout_ms
            .or(file.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT.as_millis() as u64);
        let refresh_ms = overrides
            .refresh_ms
            .or(file.refresh_ms)
            .unwrap_or(DEFAULT_REFRESH_MS);

        Ok(Self {
            source,
            endpoint,
            timeout: Duration::from_millis(timeout_ms.max(1)),
            refresh: Duration::from_millis(refresh_ms.max(100)),
            usage_interval: Duration::from_millis(
                file.usage_interval_ms
                    .unwrap_or(DEFAULT_USAGE_INTERVAL_MS)
                    .max(100),
            ),
            usage_source: file.usage_source,
            terminal_mode: file.terminal_mode,
            shell: file
                .shell
                .filter(|shell| !shell.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SHELL.to_string()),
            stop_timeout_secs: file.stop_timeout_secs.unwrap_or(DEFAULT_STOP_TIMEOUT_SECS),
        })
    }
}

fn read_config_file(path: &Path) -> Result<DockhandConfigFile> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(DockhandConfigFile::default());
    }
    serde_yaml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("DOCKHAND_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [
        PathBuf::from("dockhand.yaml"),
        PathBuf::from("dockhand.yml"),
        PathBuf::from(".dockhand.yaml"),
    ];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let user_candidates = [
            PathBuf::from(&home).join(".config/dockhand/config.yaml"),
            PathBuf::from(&home).join(".config/dockhand/config.yml"),
            PathBuf::from(&home).join(".dockhand.yaml"),
        ];
        for candidate in user_candidates {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

/// Picks the engine endpoint when none is configured: `DOCKER_HOST`, then the
/// first well-known socket that exists, then the unauthenticated TCP port.
fn detect_endpoint(
    docker_host: Option<String>,
    home: Option<PathBuf>,
    exists: impl Fn(&Path) -> bool,
) -> Result<Endpoint> {
    if let Some(raw) = docker_host
        && !raw.trim().is_empty()
    {
        return raw
            .parse::<Endpoint>()
            .with_context(|| format!("invalid DOCKER_HOST {raw}"));
    }

    let mut sockets = Vec::new();
    if let Some(home) = home {
        sockets.push(home.join(".colima/default/docker.sock"));
        sockets.push(home.join(".orbstack/run/docker.sock"));
    }
    sockets.push(PathBuf::from("/var/run/docker.sock"));

    if let Some(socket) = sockets.into_iter().find(|socket| exists(socket)) {
        return Ok(Endpoint::Unix(socket));
    }
    Ok(Endpoint::Tcp {
        host: "localhost".to_string(),
        port: DEFAULT_TCP_PORT,
    })
}
