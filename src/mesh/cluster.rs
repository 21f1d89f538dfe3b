//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and state gossip for the shared window store. Each
//! node publishes its own contribution to every counter; reads sum the
//! contributions of all live nodes.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use parking_lot::Mutex as SyncMutex;
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to join cluster: {0}")]
    JoinError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr: SocketAddr = "0.0.0.0:7946".parse().unwrap();
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "floodgate".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// Key identifying a windowed counter in the cluster state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The identity the counter tracks (already limiter-namespaced).
    pub identity: String,
    /// Window start, epoch seconds floored to the window boundary.
    pub window_start: u64,
    /// Window length in seconds, kept in the key so expiry can be
    /// computed without the limiter config.
    pub window_secs: u64,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(identity: &str, window_start: u64, window_secs: u64) -> Self {
        Self {
            identity: identity.to_string(),
            window_start,
            window_secs,
        }
    }

    /// Convert to a gossip key string.
    /// Format: "counter|{identity}|{window_start}|{window_secs}".
    /// Identities never contain `|`; they are composed of limiter names,
    /// colons, and request-derived tokens.
    pub fn to_gossip_key(&self) -> String {
        format!(
            "counter|{}|{}|{}",
            self.identity, self.window_start, self.window_secs
        )
    }

    /// Parse from a gossip key string.
    pub fn from_gossip_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix("counter|")?;

        // Split from the right: identity may contain our other
        // delimiters, the two trailing numbers never do.
        let (rest, window_secs) = rest.rsplit_once('|')?;
        let (identity, window_start) = rest.rsplit_once('|')?;

        Some(Self {
            identity: identity.to_string(),
            window_start: window_start.parse().ok()?,
            window_secs: window_secs.parse().ok()?,
        })
    }

    /// Whether this counter's window has fully elapsed at `epoch_now`.
    pub fn elapsed(&self, epoch_now: u64) -> bool {
        epoch_now >= self.window_start + self.window_secs
    }
}

/// Gossip key carrying a key's block-until timestamp (epoch seconds).
fn block_gossip_key(identity: &str) -> String {
    format!("block|{}", identity)
}

/// The cluster handle for distributed counter state.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    /// Gossip keys this node has written, so reset and expiry sweeps can
    /// find our contributions without scanning foreign state.
    local_keys: SyncMutex<HashSet<String>>,
    /// Configuration (kept for potential future use).
    #[allow(dead_code)]
    config: ClusterConfig,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id.clone(),
            handle,
            local_keys: SyncMutex::new(HashSet::new()),
            config,
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Add to our contribution for a counter and return the total across
    /// all live nodes.
    pub async fn increment_counter(&self, key: &CounterKey, amount: u64) -> u64 {
        let gossip_key = key.to_gossip_key();
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let current_local: u64 = chitchat
            .self_node_state()
            .get(&gossip_key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let new_local = current_local + amount;
        chitchat
            .self_node_state()
            .set(&gossip_key, new_local.to_string());
        self.local_keys.lock().insert(gossip_key.clone());

        debug!(
            key = %gossip_key,
            local_value = new_local,
            "Incremented local counter contribution"
        );

        self.sum_counter_internal(&chitchat, &gossip_key)
    }

    /// Reduce our contribution for a counter, clamped at zero.
    ///
    /// Refunds can only touch this node's contribution; points admitted
    /// by other nodes are theirs to refund.
    pub async fn decrement_counter(&self, key: &CounterKey, amount: u64) {
        let gossip_key = key.to_gossip_key();
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let current_local: u64 = chitchat
            .self_node_state()
            .get(&gossip_key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let new_local = current_local.saturating_sub(amount);
        chitchat
            .self_node_state()
            .set(&gossip_key, new_local.to_string());
        self.local_keys.lock().insert(gossip_key);
    }

    /// Get the total count for a key across all live nodes.
    pub async fn get_count(&self, key: &CounterKey) -> u64 {
        let gossip_key = key.to_gossip_key();
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        self.sum_counter_internal(&chitchat, &gossip_key)
    }

    /// Internal helper to sum a counter across all live nodes.
    fn sum_counter_internal(&self, chitchat: &chitchat::Chitchat, key: &str) -> u64 {
        let mut total: u64 = 0;

        for node_id in chitchat.live_nodes() {
            if let Some(node_state) = chitchat.node_state(node_id) {
                if let Some(value) = node_state.get(key) {
                    if let Ok(count) = value.parse::<u64>() {
                        total += count;
                    }
                }
            }
        }

        total
    }

    /// Record a block on an identity until `until_epoch` (epoch seconds).
    pub async fn set_block(&self, identity: &str, until_epoch: u64) {
        let gossip_key = block_gossip_key(identity);
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        chitchat
            .self_node_state()
            .set(&gossip_key, until_epoch.to_string());
        self.local_keys.lock().insert(gossip_key.clone());

        debug!(key = %gossip_key, until = until_epoch, "Recorded block marker");
    }

    /// The latest block-until timestamp any live node holds for an
    /// identity, if one exists.
    pub async fn block_until(&self, identity: &str) -> Option<u64> {
        let gossip_key = block_gossip_key(identity);
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;

        let mut latest: Option<u64> = None;
        for node_id in chitchat.live_nodes() {
            if let Some(node_state) = chitchat.node_state(node_id) {
                if let Some(value) = node_state.get(&gossip_key) {
                    if let Ok(until) = value.parse::<u64>() {
                        latest = Some(latest.map_or(until, |l: u64| l.max(until)));
                    }
                }
            }
        }
        latest
    }

    /// Delete this node's contributions (counters and block marker) for
    /// an identity. Other nodes clear their own state as their sweeps
    /// run; until then their contributions remain visible.
    pub async fn clear_identity(&self, identity: &str) {
        let counter_prefix = format!("counter|{}|", identity);
        let block_key = block_gossip_key(identity);

        let to_delete: Vec<String> = {
            let local_keys = self.local_keys.lock();
            local_keys
                .iter()
                .filter(|k| k.starts_with(&counter_prefix) || **k == block_key)
                .cloned()
                .collect()
        };

        if to_delete.is_empty() {
            return;
        }

        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let mut local_keys = self.local_keys.lock();
        for key in to_delete {
            chitchat.self_node_state().delete(&key);
            local_keys.remove(&key);
            debug!(key = %key, "Deleted local state for identity");
        }
    }

    /// Delete this node's counters for fully elapsed windows and expired
    /// block markers. Returns the number of keys removed.
    pub async fn purge_expired(&self, epoch_now: u64) -> usize {
        let candidates: Vec<String> = self.local_keys.lock().iter().cloned().collect();

        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let mut local_keys = self.local_keys.lock();
        let mut removed = 0;

        for key in candidates {
            let expired = if let Some(counter) = CounterKey::from_gossip_key(&key) {
                counter.elapsed(epoch_now)
            } else if key.starts_with("block|") {
                chitchat
                    .self_node_state()
                    .get(&key)
                    .and_then(|v| v.parse::<u64>().ok())
                    .is_some_and(|until| until <= epoch_now)
            } else {
                false
            };

            if expired {
                chitchat.self_node_state().delete(&key);
                local_keys.remove(&key);
                removed += 1;
            }
        }

        removed
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::StartError(format!("Shutdown error: {:?}", e)))?;
        Ok(())
    }
}
