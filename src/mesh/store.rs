//! Gossip-backed window store for multi-instance deployments.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use super::cluster::{Cluster, CounterKey};
use crate::error::Result;
use crate::ratelimit::{WindowSnapshot, WindowStore};

/// Shared window store over a chitchat cluster.
///
/// Windows are floored to wall-clock epoch boundaries so counters from
/// different nodes land in the same window key; per-node contributions
/// are summed across live nodes at read time. The caller's `now` instant
/// is ignored in favor of wall-clock time, which is the only clock the
/// cluster shares.
///
/// Counts converge at gossip speed, so a burst split across nodes can
/// briefly exceed the configured capacity by up to one node's worth of
/// in-flight hits. That is the availability trade this store makes;
/// exact accounting would require the centralized storage this system
/// deliberately avoids.
pub struct MeshStore {
    cluster: Arc<Cluster>,
}

impl MeshStore {
    /// Create a store over a running cluster node.
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }

    /// The underlying cluster.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    fn epoch_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs()
    }

    /// The counter key for the window containing `epoch_now`.
    fn window_key(key: &str, epoch_now: u64, window: Duration) -> CounterKey {
        let window_secs = window.as_secs().max(1);
        let window_start = (epoch_now / window_secs) * window_secs;
        CounterKey::new(key, window_start, window_secs)
    }

    fn reset_after(counter: &CounterKey, epoch_now: u64) -> Duration {
        let window_end = counter.window_start + counter.window_secs;
        Duration::from_secs(window_end.saturating_sub(epoch_now))
    }
}

#[async_trait]
impl WindowStore for MeshStore {
    async fn window(
        &self,
        key: &str,
        _now: Instant,
        window: Duration,
    ) -> Result<Option<WindowSnapshot>> {
        let epoch_now = Self::epoch_now();
        let counter = Self::window_key(key, epoch_now, window);

        let count = self.cluster.get_count(&counter).await;
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(WindowSnapshot {
            count,
            reset_after: Self::reset_after(&counter, epoch_now),
        }))
    }

    async fn increment(
        &self,
        key: &str,
        points: u64,
        _now: Instant,
        window: Duration,
    ) -> Result<WindowSnapshot> {
        let epoch_now = Self::epoch_now();
        let counter = Self::window_key(key, epoch_now, window);

        let count = self.cluster.increment_counter(&counter, points).await;
        Ok(WindowSnapshot {
            count,
            reset_after: Self::reset_after(&counter, epoch_now),
        })
    }

    async fn decrement(
        &self,
        key: &str,
        points: u64,
        _now: Instant,
        window: Duration,
    ) -> Result<()> {
        let epoch_now = Self::epoch_now();
        let counter = Self::window_key(key, epoch_now, window);
        self.cluster.decrement_counter(&counter, points).await;
        Ok(())
    }

    async fn block(&self, key: &str, _now: Instant, duration: Duration) -> Result<()> {
        let until = Self::epoch_now() + duration.as_secs();
        self.cluster.set_block(key, until).await;
        Ok(())
    }

    async fn blocked_for(&self, key: &str, _now: Instant) -> Result<Option<Duration>> {
        let epoch_now = Self::epoch_now();
        Ok(self
            .cluster
            .block_until(key)
            .await
            .filter(|until| *until > epoch_now)
            .map(|until| Duration::from_secs(until - epoch_now)))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.cluster.clear_identity(key).await;
        Ok(())
    }

    async fn sweep(&self, _now: Instant) -> Result<usize> {
        Ok(self.cluster.purge_expired(Self::epoch_now()).await)
    }
}
