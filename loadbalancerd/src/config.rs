use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::LOADBALANCER_ENDPOINT;
use crate::network::{self, PartitionVips};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/loadbalancer/loadbalancerd.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub ha: HaConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub app: String,
    pub unit: String,
    /// Whether this unit may write the application bag
    #[serde(default)]
    pub leader: bool,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Mark requested services ready on every partition VIP and publish
    /// as soon as registrations change.
    #[serde(default = "default_respond_automatically")]
    pub respond_automatically: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub vips: Vec<String>,
    /// Partition name to CIDR list
    #[serde(default)]
    pub bindings: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HaConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_init_service")]
    pub init_service: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_endpoint() -> String {
    LOADBALANCER_ENDPOINT.to_string()
}

fn default_respond_automatically() -> bool {
    true
}

fn default_init_service() -> String {
    "haproxy".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/loadbalancer/relations.db")
}

fn default_listen() -> String {
    "127.0.0.1:8480".to_string()
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            init_service: default_init_service(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl NetworkConfig {
    /// Resolve configured VIPs to the partitions they serve.
    pub fn partition_vips(&self) -> Result<PartitionVips> {
        let bindings = network::parse_bindings(&self.bindings).context("Invalid network bindings")?;
        let vips = network::parse_vips(&self.vips).context("Invalid VIP list")?;
        Ok(network::partition_vip_map(&bindings, &vips))
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        // Surface bad addresses at startup rather than on first response
        config.network.partition_vips()?;
        Ok(config)
    }
}
