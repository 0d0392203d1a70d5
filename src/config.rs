use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 7777)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Run head monitors inside the serving process.
    #[serde(default)]
    pub embedded: bool,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl MonitorConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            embedded: false,
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

fn default_reconnect_delay_ms() -> u64 {
    100
}

/// Knobs for the generated routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub entry_point: String,
    pub loopback_url: String,
    pub loopback_middleware: String,
    pub servers_transport: String,
    pub disable_http2: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            entry_point: "web".to_string(),
            loopback_url: "http://localhost:8000".to_string(),
            loopback_middleware: "rpcloopback".to_string(),
            servers_transport: "default".to_string(),
            disable_http2: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub output: Option<String>,
    pub skip_unchanged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "pretty", "compact" or "json"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// How a group's providers relate to its methods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Association {
    /// Every provider serves every method of the group.
    #[default]
    Uniform,
    /// Each provider lists the methods it serves.
    PerMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub association: Association,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub methods: Vec<MethodConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub url: String,
    #[serde(default)]
    pub wsurl: Option<String>,
    #[serde(default)]
    pub archive: bool,
    #[serde(default)]
    pub methods: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodConfig {
    pub name: String,
    #[serde(default)]
    pub block_sensitive: bool,
    #[serde(default)]
    pub block_specific: bool,
    #[serde(default)]
    pub block_arg: bool,
    #[serde(default)]
    pub archive: bool,
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(path, &content)
    }

    /// Parses `content` as JSON when `path` ends in `.json`, TOML otherwise.
    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            serde_json::from_str(content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))
        } else {
            toml::from_str(content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.bind.port() == 0 {
            return Err(anyhow::anyhow!("Ingestion bind port cannot be 0"));
        }
        if self.monitor.reconnect_delay_ms == 0 {
            return Err(anyhow::anyhow!("Monitor reconnect delay must be positive"));
        }
        if self.routing.entry_point.is_empty() {
            return Err(anyhow::anyhow!("Routing entry point cannot be empty"));
        }
        if self.routing.loopback_url.is_empty() {
            return Err(anyhow::anyhow!("Loopback URL cannot be empty"));
        }
        if self.services.is_empty() {
            return Err(anyhow::anyhow!("At least one service must be configured"));
        }
        Ok(())
    }
}
