//! Named limiter configurations.
//!
//! Every protected surface (login, generic API, webhooks, uploads, ...)
//! registers a limiter under a unique name at startup. The registry
//! validates configurations eagerly so that a bad limit fails the
//! registering caller instead of silently disabling enforcement later.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{FloodgateError, Result};

/// Configuration for a single named limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    /// Capacity units available per window. Must be positive.
    pub points: u64,
    /// Length of the counting window. Must be non-zero.
    pub duration: Duration,
    /// Penalty period applied once capacity is exceeded. May be zero,
    /// in which case rejection lasts only until the window resets.
    pub block_duration: Duration,
}

impl LimiterConfig {
    /// Create a limiter config from whole-second durations.
    pub fn new(points: u64, duration_secs: u64, block_duration_secs: u64) -> Self {
        Self {
            points,
            duration: Duration::from_secs(duration_secs),
            block_duration: Duration::from_secs(block_duration_secs),
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.points == 0 {
            return Err(FloodgateError::Config(format!(
                "limiter '{}' must allow at least one point per window",
                name
            )));
        }
        if self.duration.is_zero() {
            return Err(FloodgateError::Config(format!(
                "limiter '{}' must have a non-zero window duration",
                name
            )));
        }
        Ok(())
    }
}

/// Registry of named limiter configurations.
///
/// Thread-safe; configurations are immutable once registered except by
/// explicit re-registration under the same name.
pub struct LimiterRegistry {
    limiters: RwLock<HashMap<String, LimiterConfig>>,
}

impl LimiterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            limiters: RwLock::new(HashMap::new()),
        }
    }

    /// Register a limiter, overwriting any existing config under `name`.
    pub fn register(&self, name: &str, config: LimiterConfig) -> Result<()> {
        config.validate(name)?;

        debug!(
            limiter = %name,
            points = config.points,
            duration_secs = config.duration.as_secs(),
            block_secs = config.block_duration.as_secs(),
            "Registering limiter"
        );

        self.limiters.write().insert(name.to_string(), config);
        Ok(())
    }

    /// Register a limiter only if `name` is not already taken.
    ///
    /// Returns `true` if the registration happened. Used for lazily
    /// created tier-scoped limiters.
    pub fn register_if_absent(&self, name: &str, config: LimiterConfig) -> Result<bool> {
        config.validate(name)?;

        let mut limiters = self.limiters.write();
        if limiters.contains_key(name) {
            return Ok(false);
        }
        debug!(limiter = %name, points = config.points, "Registering limiter lazily");
        limiters.insert(name.to_string(), config);
        Ok(true)
    }

    /// Look up a limiter configuration by name.
    pub fn get(&self, name: &str) -> Result<LimiterConfig> {
        self.limiters
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| FloodgateError::Config(format!("unknown limiter '{}'", name)))
    }

    /// Whether a limiter is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.limiters.read().contains_key(name)
    }

    /// Names of all registered limiters.
    pub fn names(&self) -> Vec<String> {
        self.limiters.read().keys().cloned().collect()
    }
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
