use std::{
    collections::HashSet,
    fs::File,
    io::Read,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use docgate_core::{
    config::RuntimeConfig,
    log::LogLevel,
    process::{EngineConfig, RestartPolicy},
};
use docgate_services::{
    http::{handlers::{ConvertTimeouts, RouteConfig}, Keepalive},
    pipeline::ResourceSettings,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use service_async::Param;

// config files are small; anything bigger is a mistake
const MAX_CONFIG_BYTES: u64 = 1 << 20;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub resource: ResourceConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub supervisor: RestartPolicy,
    pub engines: Vec<EngineConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    // If no byte comes when the decoder wants the next request, close the
    // connection. Like Nginx `keepalive_timeout`.
    pub keepalive_timeout_sec: u64,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
            keepalive_timeout_sec: 75,
            max_body_bytes: 64 << 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Parent directory of the per-request workspaces.
    pub root: PathBuf,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("docgate"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub acquire_sec: u64,
    pub convert_sec: u64,
    pub max_convert_sec: u64,
    pub webhook_sec: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let d = ConvertTimeouts::default();
        Self {
            acquire_sec: d.acquire.as_secs(),
            convert_sec: d.convert.as_secs(),
            max_convert_sec: d.max_convert.as_secs(),
            webhook_sec: d.webhook.as_secs(),
        }
    }
}

impl From<TimeoutConfig> for ConvertTimeouts {
    fn from(t: TimeoutConfig) -> Self {
        ConvertTimeouts {
            acquire: Duration::from_secs(t.acquire_sec),
            convert: Duration::from_secs(t.convert_sec),
            max_convert: Duration::from_secs(t.max_convert_sec),
            webhook: Duration::from_secs(t.webhook_sec),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config file is larger than {MAX_CONFIG_BYTES} bytes")]
    TooLarge,
    #[error("runtime.workers must be at least 1")]
    NoWorkers,
    #[error("at least one engine must be configured")]
    NoEngines,
    #[error("engine '{0}' is configured twice")]
    DuplicateEngine(String),
    #[error("engine '{0}' has no instances")]
    NoInstances(String),
    #[error("engine '{0}' has an empty command")]
    EmptyCommand(String),
    #[error("engine '{0}' has an empty convert template")]
    EmptyConvert(String),
    #[error("engine '{0}' probes its port but has no base_port")]
    ProbeWithoutPort(String),
    #[error("route {path} uses unknown engine '{engine}'")]
    UnknownEngine { path: String, engine: String },
    #[error("timeouts.convert_sec exceeds timeouts.max_convert_sec")]
    ConvertAboveMax,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = read_capped(path.as_ref())?;
        let config = parse_from_slice::<Config>(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.engines.is_empty() {
            return Err(ConfigError::NoEngines);
        }
        let mut names = HashSet::new();
        for engine in self.engines.iter() {
            if !names.insert(engine.name.as_str()) {
                return Err(ConfigError::DuplicateEngine(engine.name.clone()));
            }
            if engine.instances == 0 {
                return Err(ConfigError::NoInstances(engine.name.clone()));
            }
            if engine.command.is_empty() {
                return Err(ConfigError::EmptyCommand(engine.name.clone()));
            }
            if engine.convert.is_empty() {
                return Err(ConfigError::EmptyConvert(engine.name.clone()));
            }
            if engine.probe && engine.base_port.is_none() {
                return Err(ConfigError::ProbeWithoutPort(engine.name.clone()));
            }
        }
        if let Some(route) = self.routes.iter().find(|r| !names.contains(r.engine.as_str())) {
            return Err(ConfigError::UnknownEngine {
                path: route.path.clone(),
                engine: route.engine.clone(),
            });
        }
        if self.timeouts.convert_sec > self.timeouts.max_convert_sec {
            return Err(ConfigError::ConvertAboveMax);
        }
        Ok(())
    }

    pub fn site(&self) -> SiteConfig {
        SiteConfig {
            log_level: self.log_level,
            keepalive: Keepalive(Duration::from_secs(self.server.keepalive_timeout_sec)),
            resource: ResourceSettings {
                root: self.resource.root.clone(),
                max_body_bytes: self.server.max_body_bytes,
            },
        }
    }
}

/// The part of the config the service stack layers are built from.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub log_level: LogLevel,
    pub keepalive: Keepalive,
    pub resource: ResourceSettings,
}

impl Param<LogLevel> for SiteConfig {
    fn param(&self) -> LogLevel {
        self.log_level
    }
}

impl Param<Keepalive> for SiteConfig {
    fn param(&self) -> Keepalive {
        self.keepalive
    }
}

impl Param<ResourceSettings> for SiteConfig {
    fn param(&self) -> ResourceSettings {
        self.resource.clone()
    }
}

fn read_capped(path: &Path) -> anyhow::Result<Vec<u8>> {
    let mut content = Vec::new();
    File::open(path)?
        .take(MAX_CONFIG_BYTES + 1)
        .read_to_end(&mut content)?;
    if content.len() as u64 > MAX_CONFIG_BYTES {
        return Err(ConfigError::TooLarge.into());
    }
    Ok(content)
}

pub fn parse_from_slice<T: DeserializeOwned>(content: &[u8]) -> anyhow::Result<T> {
    // read first non-space u8
    let is_json = match content.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(first) => *first == b'{',
        None => false,
    };
    match is_json {
        true => serde_json::from_slice::<T>(content).map_err(Into::into),
        false => toml::from_str::<T>(&String::from_utf8_lossy(content)).map_err(Into::into),
    }
}
