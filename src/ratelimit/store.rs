//! Window store trait and the in-process implementation.
//!
//! The store owns all mutable per-key state: hit counts within the
//! current window and any block (penalty) timestamps. Increments must be
//! atomic per key; the engine performs no additional locking and relies
//! entirely on that guarantee. The in-memory implementation is correct
//! for a single instance only; multi-instance deployments use the
//! gossip-backed store in [`crate::mesh`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

/// Counter state observed for a key's active window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Hits recorded in the window so far.
    pub count: u64,
    /// Time until the window rolls over.
    pub reset_after: Duration,
}

/// Pluggable counter storage keyed by identity string.
///
/// All operations take `now` explicitly so that decisions are a pure
/// function of store state and the caller's clock; tests drive the store
/// with constructed instants instead of sleeping.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Hit count and reset time for the key's active window, if one
    /// exists and has not elapsed.
    async fn window(&self, key: &str, now: Instant, window: Duration)
        -> Result<Option<WindowSnapshot>>;

    /// Atomically add `points` to the key's counter, starting a fresh
    /// window at `now` when none exists or the previous one has elapsed.
    /// Returns the post-increment state.
    async fn increment(
        &self,
        key: &str,
        points: u64,
        now: Instant,
        window: Duration,
    ) -> Result<WindowSnapshot>;

    /// Subtract `points` from the key's counter, clamped at zero.
    /// Supports refunding capacity consumed by a single request.
    async fn decrement(&self, key: &str, points: u64, now: Instant, window: Duration)
        -> Result<()>;

    /// Put the key into a block state lasting `duration` from `now`.
    /// Block state survives window resets.
    async fn block(&self, key: &str, now: Instant, duration: Duration) -> Result<()>;

    /// Remaining block time for the key, if it is blocked at `now`.
    async fn blocked_for(&self, key: &str, now: Instant) -> Result<Option<Duration>>;

    /// Clear the key's counter and any block state.
    async fn reset(&self, key: &str) -> Result<()>;

    /// Bulk-expire entries whose window and block period have both fully
    /// elapsed. Returns the number of entries removed.
    async fn sweep(&self, now: Instant) -> Result<usize>;
}

/// Per-key state held by [`MemoryStore`].
#[derive(Debug, Clone)]
struct WindowEntry {
    count: u64,
    window_start: Instant,
    window: Duration,
    blocked_until: Option<Instant>,
}

impl WindowEntry {
    fn new(now: Instant, window: Duration) -> Self {
        Self {
            count: 0,
            window_start: now,
            window,
            blocked_until: None,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.window
    }

    /// Start a fresh window, preserving any block state.
    fn roll_over(&mut self, now: Instant, window: Duration) {
        self.count = 0;
        self.window_start = now;
        self.window = window;
    }

    fn reset_after(&self, now: Instant) -> Duration {
        (self.window_start + self.window).saturating_duration_since(now)
    }
}

/// Single-process window store backed by a sharded concurrent map.
///
/// DashMap's entry API holds the key's shard lock for the duration of a
/// mutation, which provides the per-key atomic-increment guarantee the
/// engine requires. Correct for one instance only.
pub struct MemoryStore {
    entries: DashMap<String, WindowEntry>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of keys currently tracked.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn window(
        &self,
        key: &str,
        now: Instant,
        _window: Duration,
    ) -> Result<Option<WindowSnapshot>> {
        Ok(self.entries.get(key).and_then(|entry| {
            if entry.expired(now) {
                None
            } else {
                Some(WindowSnapshot {
                    count: entry.count,
                    reset_after: entry.reset_after(now),
                })
            }
        }))
    }

    async fn increment(
        &self,
        key: &str,
        points: u64,
        now: Instant,
        window: Duration,
    ) -> Result<WindowSnapshot> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry::new(now, window));

        if entry.expired(now) {
            entry.roll_over(now, window);
        }
        entry.count = entry.count.saturating_add(points);

        Ok(WindowSnapshot {
            count: entry.count,
            reset_after: entry.reset_after(now),
        })
    }

    async fn decrement(
        &self,
        key: &str,
        points: u64,
        now: Instant,
        _window: Duration,
    ) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.expired(now) {
                entry.count = entry.count.saturating_sub(points);
            }
        }
        Ok(())
    }

    async fn block(&self, key: &str, now: Instant, duration: Duration) -> Result<()> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry::new(now, duration));
        entry.blocked_until = Some(now + duration);
        Ok(())
    }

    async fn blocked_for(&self, key: &str, now: Instant) -> Result<Option<Duration>> {
        Ok(self.entries.get(key).and_then(|entry| {
            entry.blocked_until.and_then(|until| {
                let left = until.saturating_duration_since(now);
                if left.is_zero() {
                    None
                } else {
                    Some(left)
                }
            })
        }))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn sweep(&self, now: Instant) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            let window_live = !entry.expired(now);
            let block_live = entry
                .blocked_until
                .is_some_and(|until| until > now);
            window_live || block_live
        });
        Ok(before - self.entries.len())
    }
}
