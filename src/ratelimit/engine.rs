//! Core admission-control engine.
//!
//! The engine owns the decision logic: resolve a named limiter, honor
//! any active block, consume capacity, apply penalties, and compose
//! multi-limit checks. All mutable state lives in the [`WindowStore`];
//! the engine holds no per-request state and no locks of its own.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::registry::{LimiterConfig, LimiterRegistry};
use super::store::WindowStore;
use crate::error::Result;

/// Outcome of a single limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Configured capacity of the limiter.
    pub limit: u64,
    /// Capacity left in the current window. Never negative.
    pub remaining: u64,
    /// Time until the window (or block) resets.
    pub reset_after: Duration,
    /// How long the caller should wait before retrying. Only present on
    /// rejection.
    pub retry_after: Option<Duration>,
    /// Whether the key is serving a block penalty.
    pub blocked: bool,
}

/// One limiter reference within a multi-limit check.
#[derive(Debug, Clone)]
pub struct LimitSpec {
    /// Name of the registered limiter.
    pub limiter: String,
    /// Points to consume under that limiter.
    pub points: u64,
}

/// Outcome of an ordered multi-limit check.
#[derive(Debug, Clone)]
pub struct MultiCheckResult {
    /// `true` only if every limit individually allowed.
    pub allowed: bool,
    /// Name of the first limiter that disallowed, if any.
    pub failed_limit: Option<String>,
    /// The binding check: the failing limiter's result on rejection,
    /// otherwise the result with the least remaining capacity.
    pub check: Option<CheckResult>,
}

/// The admission-control engine.
///
/// Generic over the window store so the same decision logic runs against
/// the in-process store or the gossip-backed shared store. Construct one
/// engine at process start and pass it explicitly to the middleware
/// factories.
pub struct RateLimitEngine<S: WindowStore> {
    registry: LimiterRegistry,
    store: S,
}

impl<S: WindowStore> RateLimitEngine<S> {
    /// Create an engine over the given store with an empty registry.
    pub fn new(store: S) -> Self {
        Self {
            registry: LimiterRegistry::new(),
            store,
        }
    }

    /// The limiter registry.
    pub fn registry(&self) -> &LimiterRegistry {
        &self.registry
    }

    /// The backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Register a limiter, overwriting any existing config under `name`.
    pub fn register_limiter(&self, name: &str, config: LimiterConfig) -> Result<()> {
        self.registry.register(name, config)
    }

    /// Register a limiter only if absent. Returns `true` on registration.
    pub fn register_limiter_if_absent(&self, name: &str, config: LimiterConfig) -> Result<bool> {
        self.registry.register_if_absent(name, config)
    }

    /// Check and consume capacity for `key` under the named limiter.
    pub async fn check_limit(&self, limiter: &str, key: &str, points: u64) -> Result<CheckResult> {
        self.check_limit_at(limiter, key, points, Instant::now()).await
    }

    /// Clock-explicit variant of [`check_limit`](Self::check_limit).
    pub async fn check_limit_at(
        &self,
        limiter: &str,
        key: &str,
        points: u64,
        now: Instant,
    ) -> Result<CheckResult> {
        let config = self.registry.get(limiter)?;
        let store_key = store_key(limiter, key);

        trace!(limiter = %limiter, key = %key, points = points, "Checking limit");

        // An active block overrides everything, including window resets.
        if let Some(left) = self.store.blocked_for(&store_key, now).await? {
            trace!(limiter = %limiter, key = %key, "Key is blocked");
            return Ok(CheckResult {
                allowed: false,
                limit: config.points,
                remaining: 0,
                reset_after: left,
                retry_after: Some(left),
                blocked: true,
            });
        }

        let current = self.store.window(&store_key, now, config.duration).await?;
        let count = current.as_ref().map(|w| w.count).unwrap_or(0);

        if count.saturating_add(points) > config.points {
            let (retry_after, blocked) = if config.block_duration.is_zero() {
                // No penalty configured: rejection lasts until the
                // window rolls over.
                let until_reset = current
                    .map(|w| w.reset_after)
                    .unwrap_or(config.duration);
                (until_reset, false)
            } else {
                self.store
                    .block(&store_key, now, config.block_duration)
                    .await?;
                (config.block_duration, true)
            };

            debug!(
                limiter = %limiter,
                key = %key,
                count = count,
                requested = points,
                limit = config.points,
                blocked = blocked,
                "Limit exceeded"
            );

            return Ok(CheckResult {
                allowed: false,
                limit: config.points,
                remaining: 0,
                reset_after: retry_after,
                retry_after: Some(retry_after),
                blocked,
            });
        }

        let snap = self
            .store
            .increment(&store_key, points, now, config.duration)
            .await?;

        Ok(CheckResult {
            allowed: true,
            limit: config.points,
            remaining: config.points.saturating_sub(snap.count),
            reset_after: snap.reset_after,
            retry_after: None,
            blocked: false,
        })
    }

    /// Evaluate several limits for `key` in caller-supplied order,
    /// stopping at the first limiter that disallows.
    ///
    /// Capacity consumed by limits evaluated before the failing one
    /// stays consumed; callers order broad limits first.
    pub async fn check_multiple(&self, limits: &[LimitSpec], key: &str) -> Result<MultiCheckResult> {
        self.check_multiple_at(limits, key, Instant::now()).await
    }

    /// Clock-explicit variant of [`check_multiple`](Self::check_multiple).
    pub async fn check_multiple_at(
        &self,
        limits: &[LimitSpec],
        key: &str,
        now: Instant,
    ) -> Result<MultiCheckResult> {
        let mut tightest: Option<CheckResult> = None;

        for spec in limits {
            let result = self
                .check_limit_at(&spec.limiter, key, spec.points, now)
                .await?;

            if !result.allowed {
                return Ok(MultiCheckResult {
                    allowed: false,
                    failed_limit: Some(spec.limiter.clone()),
                    check: Some(result),
                });
            }

            if tightest
                .as_ref()
                .map(|t| result.remaining < t.remaining)
                .unwrap_or(true)
            {
                tightest = Some(result);
            }
        }

        Ok(MultiCheckResult {
            allowed: true,
            failed_limit: None,
            check: tightest,
        })
    }

    /// Return capacity consumed by a single admitted request.
    pub async fn refund(&self, limiter: &str, key: &str, points: u64) -> Result<()> {
        self.refund_at(limiter, key, points, Instant::now()).await
    }

    /// Clock-explicit variant of [`refund`](Self::refund).
    pub async fn refund_at(
        &self,
        limiter: &str,
        key: &str,
        points: u64,
        now: Instant,
    ) -> Result<()> {
        let config = self.registry.get(limiter)?;
        trace!(limiter = %limiter, key = %key, points = points, "Refunding points");
        self.store
            .decrement(&store_key(limiter, key), points, now, config.duration)
            .await
    }

    /// Clear counter and block state for `key` under the named limiter.
    /// Administrative override.
    pub async fn reset_limit(&self, limiter: &str, key: &str) -> Result<()> {
        // Resolve first so an unknown name fails loudly.
        self.registry.get(limiter)?;
        debug!(limiter = %limiter, key = %key, "Resetting limit state");
        self.store.reset(&store_key(limiter, key)).await
    }

    /// Bulk-expire store entries whose window and block have elapsed.
    pub async fn sweep(&self) -> Result<usize> {
        self.store.sweep(Instant::now()).await
    }
}

/// Store keys are namespaced per limiter so the same identity tracked by
/// several limiters never shares a counter.
fn store_key(limiter: &str, key: &str) -> String {
    format!("{}:{}", limiter, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::store::MemoryStore;

    fn engine() -> RateLimitEngine<MemoryStore> {
        RateLimitEngine::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_unknown_limiter_is_config_error() {
        let engine = engine();
        let err = engine.check_limit("ghost", "k", 1).await.unwrap_err();
        assert!(matches!(err, crate::error::FloodgateError::Config(_)));
    }

    #[tokio::test]
    async fn test_exactly_p_consumptions_succeed() {
        let engine = engine();
        engine
            .register_limiter("api", LimiterConfig::new(3, 60, 0))
            .unwrap();
        let now = Instant::now();

        for i in 0..3 {
            let result = engine.check_limit_at("api", "1.2.3.4", 1, now).await.unwrap();
            assert!(result.allowed, "request {} should be allowed", i + 1);
            assert_eq!(result.remaining, 2 - i);
        }

        let result = engine.check_limit_at("api", "1.2.3.4", 1, now).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        // No block configured: retry once the window resets.
        assert!(!result.blocked);
        assert_eq!(result.retry_after, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_capacity_resets_after_window() {
        let engine = engine();
        engine
            .register_limiter("api", LimiterConfig::new(2, 60, 0))
            .unwrap();
        let t0 = Instant::now();

        engine.check_limit_at("api", "k", 2, t0).await.unwrap();
        let rejected = engine.check_limit_at("api", "k", 1, t0).await.unwrap();
        assert!(!rejected.allowed);

        let t1 = t0 + Duration::from_secs(61);
        let result = engine.check_limit_at("api", "k", 1, t1).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 1);
    }

    #[tokio::test]
    async fn test_login_scenario_block_on_sixth_attempt() {
        let engine = engine();
        engine
            .register_limiter("login", LimiterConfig::new(5, 900, 900))
            .unwrap();
        let now = Instant::now();

        for _ in 0..5 {
            let result = engine
                .check_limit_at("login", "login:bob@example.com", 1, now)
                .await
                .unwrap();
            assert!(result.allowed);
        }

        let result = engine
            .check_limit_at("login", "login:bob@example.com", 1, now)
            .await
            .unwrap();
        assert!(!result.allowed);
        assert!(result.blocked);
        assert_eq!(result.retry_after, Some(Duration::from_secs(900)));
    }

    #[tokio::test]
    async fn test_block_outlasts_window_and_retry_after_decreases() {
        let engine = engine();
        engine
            .register_limiter("login", LimiterConfig::new(1, 60, 900))
            .unwrap();
        let t0 = Instant::now();

        engine.check_limit_at("login", "k", 1, t0).await.unwrap();
        engine.check_limit_at("login", "k", 1, t0).await.unwrap(); // triggers block

        // Well past the counting window, the block still holds.
        let t1 = t0 + Duration::from_secs(300);
        let r1 = engine.check_limit_at("login", "k", 1, t1).await.unwrap();
        assert!(!r1.allowed);
        assert!(r1.blocked);
        assert_eq!(r1.retry_after, Some(Duration::from_secs(600)));

        // retry_after decreases monotonically across repeated checks.
        let t2 = t0 + Duration::from_secs(600);
        let r2 = engine.check_limit_at("login", "k", 1, t2).await.unwrap();
        assert!(r2.retry_after.unwrap() < r1.retry_after.unwrap());

        // Block expires; a fresh window admits again.
        let t3 = t0 + Duration::from_secs(901);
        let r3 = engine.check_limit_at("login", "k", 1, t3).await.unwrap();
        assert!(r3.allowed);
    }

    #[tokio::test]
    async fn test_points_may_exceed_one() {
        let engine = engine();
        engine
            .register_limiter("upload", LimiterConfig::new(10, 3600, 0))
            .unwrap();
        let now = Instant::now();

        let result = engine.check_limit_at("upload", "k", 7, now).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 3);

        // 7 + 4 > 10: rejected without consuming.
        let result = engine.check_limit_at("upload", "k", 4, now).await.unwrap();
        assert!(!result.allowed);

        // The remaining 3 are still available.
        let result = engine.check_limit_at("upload", "k", 3, now).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_check_multiple_reports_first_failure() {
        let engine = engine();
        engine
            .register_limiter("api", LimiterConfig::new(100, 60, 0))
            .unwrap();
        engine
            .register_limiter("burst", LimiterConfig::new(2, 60, 0))
            .unwrap();
        let now = Instant::now();

        let limits = vec![
            LimitSpec { limiter: "api".into(), points: 1 },
            LimitSpec { limiter: "burst".into(), points: 1 },
        ];

        for _ in 0..2 {
            let result = engine.check_multiple_at(&limits, "k", now).await.unwrap();
            assert!(result.allowed);
            assert!(result.failed_limit.is_none());
        }

        let result = engine.check_multiple_at(&limits, "k", now).await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.failed_limit.as_deref(), Some("burst"));
        assert!(!result.check.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_check_multiple_tightest_result_on_success() {
        let engine = engine();
        engine
            .register_limiter("wide", LimiterConfig::new(100, 60, 0))
            .unwrap();
        engine
            .register_limiter("narrow", LimiterConfig::new(5, 60, 0))
            .unwrap();
        let now = Instant::now();

        let limits = vec![
            LimitSpec { limiter: "wide".into(), points: 1 },
            LimitSpec { limiter: "narrow".into(), points: 1 },
        ];

        let result = engine.check_multiple_at(&limits, "k", now).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.check.unwrap().remaining, 4);
    }

    #[tokio::test]
    async fn test_refund_restores_exact_capacity() {
        let engine = engine();
        engine
            .register_limiter("api", LimiterConfig::new(5, 60, 0))
            .unwrap();
        let now = Instant::now();

        engine.check_limit_at("api", "k", 2, now).await.unwrap();
        engine.refund_at("api", "k", 2, now).await.unwrap();

        let result = engine.check_limit_at("api", "k", 1, now).await.unwrap();
        assert_eq!(result.remaining, 4);
    }

    #[tokio::test]
    async fn test_refund_clamps_at_full_capacity() {
        let engine = engine();
        engine
            .register_limiter("api", LimiterConfig::new(5, 60, 0))
            .unwrap();
        let now = Instant::now();

        engine.check_limit_at("api", "k", 1, now).await.unwrap();
        // Over-refund must not create surplus capacity.
        engine.refund_at("api", "k", 10, now).await.unwrap();

        let result = engine.check_limit_at("api", "k", 1, now).await.unwrap();
        assert_eq!(result.remaining, 4);
    }

    #[tokio::test]
    async fn test_reset_limit_clears_block() {
        let engine = engine();
        engine
            .register_limiter("login", LimiterConfig::new(1, 60, 900))
            .unwrap();
        let now = Instant::now();

        engine.check_limit_at("login", "k", 1, now).await.unwrap();
        engine.check_limit_at("login", "k", 1, now).await.unwrap();
        assert!(
            !engine
                .check_limit_at("login", "k", 1, now)
                .await
                .unwrap()
                .allowed
        );

        engine.reset_limit("login", "k").await.unwrap();
        let result = engine.check_limit_at("login", "k", 1, now).await.unwrap();
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn test_tier_capacities_diverge() {
        let engine = engine();
        engine
            .register_limiter("tier:free", LimiterConfig::new(10, 60, 0))
            .unwrap();
        engine
            .register_limiter("tier:pro", LimiterConfig::new(200, 60, 0))
            .unwrap();
        let now = Instant::now();

        // A pro user pushing 150 requests a minute stays admitted.
        for _ in 0..150 {
            let result = engine
                .check_limit_at("tier:pro", "user:p-1", 1, now)
                .await
                .unwrap();
            assert!(result.allowed);
        }

        // A free user doing the same is cut off after 10.
        let mut admitted = 0;
        for _ in 0..150 {
            let result = engine
                .check_limit_at("tier:free", "user:f-1", 1, now)
                .await
                .unwrap();
            if result.allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_limiters_do_not_share_counters() {
        let engine = engine();
        engine
            .register_limiter("a", LimiterConfig::new(2, 60, 0))
            .unwrap();
        engine
            .register_limiter("b", LimiterConfig::new(2, 60, 0))
            .unwrap();
        let now = Instant::now();

        engine.check_limit_at("a", "k", 2, now).await.unwrap();
        let result = engine.check_limit_at("b", "k", 1, now).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 1);
    }
}
