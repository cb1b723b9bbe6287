//! Configuration management
//!
//! Handles:
//! - Broker settings (host, credentials, queues, heartbeat)
//! - Collection cadence and hostname override
//! - IP / ASN lookup services and per-step toggles
//! - Metric categories and port checks
//! - Environment overrides on top of the TOML file

use crate::error::ConfigurationError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "HOSTWATCH_CONFIG";

const DEFAULT_COLLECTION_INTERVAL_SECS: u64 = 10;
const DEFAULT_LOOKUP_TIMEOUT_SECS: u64 = 5;
const DEFAULT_BLOCKED_TIMEOUT_SECS: u64 = 300;

/// Zero is reported by `validate` and replaced by the default here
fn nonzero_secs(secs: u64, default: u64) -> Duration {
    Duration::from_secs(if secs == 0 { default } else { secs })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub broker: BrokerConfig,
    pub general: GeneralConfig,
    pub network_info: NetworkInfoConfig,
    pub metrics: MetricsConfig,
    pub port_check: PortCheckConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub data_queue: String,
    pub command_queue: String,
    pub heartbeat_secs: u16,
    pub blocked_connection_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub collection_interval_secs: u64,
    pub hostname_override: Option<String>,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInfoConfig {
    pub collect_private_ip: bool,
    pub collect_public_ip: bool,
    pub collect_asn_info: bool,
    pub public_ip_service: String,
    /// `{ip}` is replaced with the resolved public address
    pub asn_info_service: String,
    pub lookup_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub cpu: CategoryToggle,
    pub memory: CategoryToggle,
    pub disk: DiskConfig,
    pub network: NetworkMetricsConfig,
    pub temperature: CategoryToggle,
    pub processes: ProcessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryToggle {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    pub enabled: bool,
    pub ignore_mounts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkMetricsConfig {
    pub enabled: bool,
    pub ignore_interfaces: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub enabled: bool,
    pub top_count: usize,
    /// Process names reported as running / not running every tick
    pub watch: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortCheckConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub targets: Vec<PortTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortTarget {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            data_queue: "agent_data".to_string(),
            command_queue: "agent_commands".to_string(),
            heartbeat_secs: 600,
            blocked_connection_timeout_secs: DEFAULT_BLOCKED_TIMEOUT_SECS,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            collection_interval_secs: DEFAULT_COLLECTION_INTERVAL_SECS,
            hostname_override: None,
            log_level: "info".to_string(),
        }
    }
}

impl Default for NetworkInfoConfig {
    fn default() -> Self {
        Self {
            collect_private_ip: true,
            collect_public_ip: true,
            collect_asn_info: true,
            public_ip_service: "https://api.ipify.org".to_string(),
            asn_info_service: "https://ipinfo.io/{ip}/json".to_string(),
            lookup_timeout_secs: DEFAULT_LOOKUP_TIMEOUT_SECS,
        }
    }
}

impl Default for CategoryToggle {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ignore_mounts: Vec::new(),
        }
    }
}

impl Default for NetworkMetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ignore_interfaces: Vec::new(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_count: 10,
            watch: Vec::new(),
        }
    }
}

impl Default for PortCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 5,
            targets: Vec::new(),
        }
    }
}

impl BrokerConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(u64::from(self.heartbeat_secs))
    }

    pub fn blocked_connection_timeout(&self) -> Duration {
        nonzero_secs(self.blocked_connection_timeout_secs, DEFAULT_BLOCKED_TIMEOUT_SECS)
    }

    /// AMQP URI with credentials and vhost percent-encoded
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}&connection_timeout={}",
            urlencoding::encode(&self.user),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost),
            self.heartbeat_secs,
            self.blocked_connection_timeout().as_millis(),
        )
    }
}

impl GeneralConfig {
    pub fn collection_interval(&self) -> Duration {
        nonzero_secs(self.collection_interval_secs, DEFAULT_COLLECTION_INTERVAL_SECS)
    }
}

impl NetworkInfoConfig {
    pub fn lookup_timeout(&self) -> Duration {
        nonzero_secs(self.lookup_timeout_secs, DEFAULT_LOOKUP_TIMEOUT_SECS)
    }
}

impl AgentConfig {
    /// Load config from `HOSTWATCH_CONFIG` or the OS-specific location,
    /// then apply environment overrides
    pub async fn load() -> Result<Self> {
        let path = match std::env::var(CONFIG_PATH_ENV) {
            Ok(explicit) => PathBuf::from(explicit),
            Err(_) => Self::config_file_path()?,
        };
        let mut config = Self::load_from(&path).await?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Read a TOML file; a missing file yields defaults
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("hostwatch");
        path.push("config.toml");
        Ok(path)
    }

    /// Apply `RABBITMQ_*` / `COLLECTION_INTERVAL` overrides from `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let broker = &mut self.broker;
        if let Some(host) = lookup("RABBITMQ_HOST") {
            broker.host = host;
        }
        if let Some(port) = lookup("RABBITMQ_PORT") {
            match port.parse() {
                Ok(port) => broker.port = port,
                Err(_) => warn!("Ignoring invalid RABBITMQ_PORT '{}'", port),
            }
        }
        if let Some(user) = lookup("RABBITMQ_USER") {
            broker.user = user;
        }
        if let Some(password) = lookup("RABBITMQ_PASSWORD") {
            broker.password = password;
        }
        if let Some(vhost) = lookup("RABBITMQ_VHOST") {
            broker.vhost = vhost;
        }
        if let Some(queue) = lookup("RABBITMQ_QUEUE_DATA") {
            broker.data_queue = queue;
        }
        if let Some(queue) = lookup("RABBITMQ_QUEUE_COMMANDS") {
            broker.command_queue = queue;
        }
        if let Some(interval) = lookup("COLLECTION_INTERVAL") {
            match interval.parse() {
                Ok(secs) => self.general.collection_interval_secs = secs,
                Err(_) => warn!("Ignoring invalid COLLECTION_INTERVAL '{}'", interval),
            }
        }
    }

    /// Every problem that makes the broker or lookups unusable
    pub fn validate(&self) -> Vec<ConfigurationError> {
        let mut problems = Vec::new();
        let broker = &self.broker;

        if broker.host.trim().is_empty() {
            problems.push(ConfigurationError::EmptyHost);
        }
        if broker.port == 0 {
            problems.push(ConfigurationError::InvalidPort);
        }
        if broker.user.is_empty() {
            problems.push(ConfigurationError::EmptyUser);
        }
        if broker.data_queue.is_empty() {
            problems.push(ConfigurationError::EmptyQueue("data"));
        }
        if broker.command_queue.is_empty() {
            problems.push(ConfigurationError::EmptyQueue("command"));
        }
        if !broker.data_queue.is_empty() && broker.data_queue == broker.command_queue {
            problems.push(ConfigurationError::SharedQueue(broker.data_queue.clone()));
        }
        if self.general.collection_interval_secs == 0 {
            problems.push(ConfigurationError::ZeroInterval);
        }
        if self.network_info.lookup_timeout_secs == 0 {
            problems.push(ConfigurationError::ZeroLookupTimeout);
        }
        if broker.blocked_connection_timeout_secs == 0 {
            problems.push(ConfigurationError::ZeroBlockedTimeout);
        }
        if self.network_info.collect_asn_info && !self.network_info.asn_info_service.contains("{ip}") {
            problems.push(ConfigurationError::AsnTemplate(
                self.network_info.asn_info_service.clone(),
            ));
        }

        problems
    }

    /// Hostname reported in every envelope
    pub fn hostname(&self) -> String {
        match &self.general.hostname_override {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => gethostname::gethostname().to_string_lossy().to_string(),
        }
    }
}
