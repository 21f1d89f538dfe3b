//! Configuration management for Floodgate.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mesh::ClusterConfig;
use crate::ratelimit::LimiterConfig;

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Window store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Named limiter rules registered at startup
    #[serde(default = "default_limits")]
    pub limits: HashMap<String, LimitRule>,

    /// Tier-scoped limiter table
    #[serde(default)]
    pub tiers: TierTable,
}

impl Default for FloodgateConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            limits: default_limits(),
            tiers: TierTable::default(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

/// Which window store backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process counters. Correct for a single instance only.
    Memory,
    /// Gossip-shared counters for multi-instance deployments.
    Mesh,
}

/// Window store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend selection
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Budget for a store round-trip during an admission check;
    /// exceeding it fails open
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,

    /// How often the background sweeper expires stale entries
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Mesh settings, used when `backend` is `mesh`
    #[serde(default)]
    pub mesh: MeshConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            check_timeout_ms: default_check_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            mesh: MeshConfig::default(),
        }
    }
}

impl StoreConfig {
    /// The check timeout as a duration.
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    /// The sweep interval as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_check_timeout_ms() -> u64 {
    250
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// Gossip mesh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Node identifier; generated when omitted
    #[serde(default)]
    pub node_id: Option<String>,

    /// Gossip listen address
    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers
    #[serde(default = "default_gossip_addr")]
    pub advertise_addr: SocketAddr,

    /// Seed nodes for cluster bootstrap
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Cluster identifier
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Gossip interval in milliseconds
    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    /// Grace period before a dead node's state becomes deletable
    #[serde(default = "default_dead_node_grace_secs")]
    pub dead_node_grace_period_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: default_gossip_addr(),
            advertise_addr: default_gossip_addr(),
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval_ms(),
            dead_node_grace_period_secs: default_dead_node_grace_secs(),
        }
    }
}

impl MeshConfig {
    /// Build the cluster configuration this section describes.
    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            node_id: self
                .node_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr,
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: Duration::from_secs(self.dead_node_grace_period_secs),
        }
    }
}

fn default_gossip_addr() -> SocketAddr {
    "0.0.0.0:7946".parse().unwrap()
}

fn default_cluster_id() -> String {
    "floodgate".to_string()
}

fn default_gossip_interval_ms() -> u64 {
    100
}

fn default_dead_node_grace_secs() -> u64 {
    3600
}

/// A named limit rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitRule {
    /// Points available per window
    pub points: u64,
    /// Window length in seconds
    pub duration_secs: u64,
    /// Penalty period in seconds once capacity is exceeded
    #[serde(default)]
    pub block_duration_secs: u64,
}

impl From<&LimitRule> for LimiterConfig {
    fn from(rule: &LimitRule) -> Self {
        LimiterConfig::new(rule.points, rule.duration_secs, rule.block_duration_secs)
    }
}

/// Tier-scoped limiter table: tier label → points per window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierTable {
    /// Base name for lazily registered tier limiters
    #[serde(default = "default_tier_base")]
    pub base: String,

    /// Window length in seconds
    #[serde(default = "default_tier_duration_secs")]
    pub duration_secs: u64,

    /// Points per window for each tier
    #[serde(default = "default_tier_capacities")]
    pub capacities: HashMap<String, u64>,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            base: default_tier_base(),
            duration_secs: default_tier_duration_secs(),
            capacities: default_tier_capacities(),
        }
    }
}

fn default_tier_base() -> String {
    "tier".to_string()
}

fn default_tier_duration_secs() -> u64 {
    60
}

fn default_tier_capacities() -> HashMap<String, u64> {
    HashMap::from([
        ("free".to_string(), 10),
        ("starter".to_string(), 60),
        ("pro".to_string(), 200),
        ("enterprise".to_string(), 1000),
    ])
}

/// Default limit rules for every protected surface.
fn default_limits() -> HashMap<String, LimitRule> {
    let rule = |points, duration_secs, block_duration_secs| LimitRule {
        points,
        duration_secs,
        block_duration_secs,
    };

    HashMap::from([
        ("api".to_string(), rule(100, 900, 0)),
        ("login".to_string(), rule(5, 900, 900)),
        ("password-reset".to_string(), rule(3, 3600, 3600)),
        ("webhook".to_string(), rule(120, 60, 0)),
        ("upload".to_string(), rule(20, 3600, 0)),
        ("export".to_string(), rule(10, 3600, 0)),
        ("method:GET".to_string(), rule(300, 60, 0)),
        ("method:POST".to_string(), rule(60, 60, 0)),
        ("method:PUT".to_string(), rule(60, 60, 0)),
        ("method:DELETE".to_string(), rule(30, 60, 0)),
    ])
}

impl FloodgateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::FloodgateError::Config(e.to_string()))
    }
}
