//! Admission middleware for axum.
//!
//! A tower layer that derives the request's identity key, consumes
//! capacity through the engine, emits rate-limit headers, and rejects
//! over-limit requests with a structured 429 before any handler runs.
//! Enforcement failures never take the service down: if the store is
//! unreachable or slow, the request is allowed through and the failure
//! logged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use serde::Serialize;
use tower::{Layer, Service};
use tracing::{trace, warn};

use super::keys::{derive_key, derive_login_key, AuthContext, KeyStrategy};
use crate::error::{FloodgateError, Result};
use crate::ratelimit::{CheckResult, LimitSpec, LimiterConfig, RateLimitEngine, WindowStore};

const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";
const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_millis(250);
const DEFAULT_TIER: &str = "free";

/// Which naming scheme rate-limit response headers use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMode {
    /// `X-RateLimit-*`, with reset as epoch seconds.
    Legacy,
    /// Draft `RateLimit-*`, with reset as delta seconds.
    Draft,
    /// No rate-limit headers.
    Disabled,
}

/// One limiter within a multi-limit policy.
#[derive(Debug, Clone)]
pub struct MultiLimit {
    /// Name of the registered limiter.
    pub limiter: String,
    /// Points consumed under that limiter per request.
    pub points: u64,
    /// Rejection message when this limiter is the one that fails.
    pub message: String,
}

/// How the middleware selects the limiter(s) for a request.
#[derive(Debug, Clone)]
pub enum AdmissionPolicy {
    /// A single named limiter.
    Single { limiter: String },
    /// Tier-scoped limiters `"<base>:<tier>"`, lazily registered from a
    /// tier → capacity table. The tier label comes from the request's
    /// [`AuthContext`]; absent context resolves to `"free"`.
    Tiered {
        base: String,
        tiers: HashMap<String, u64>,
        duration: Duration,
        block_duration: Duration,
    },
    /// An ordered list of limits, all of which must allow.
    Multi { limits: Vec<MultiLimit> },
}

/// Middleware configuration.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub policy: AdmissionPolicy,
    pub points_per_request: u64,
    pub key_strategy: KeyStrategy,
    /// Refund capacity once the response is known to be successful.
    pub skip_successful: bool,
    /// Refund capacity once the response is known to be an error.
    pub skip_failed: bool,
    /// Keys admitted without any engine involvement.
    pub whitelist: Vec<String>,
    pub message: String,
    pub status_code: StatusCode,
    pub header_mode: HeaderMode,
    /// Consult proxy headers for the client IP. Disable when the
    /// service is directly exposed, otherwise clients can spoof keys.
    pub trust_proxy: bool,
    /// Budget for the engine check; exceeding it fails open.
    pub check_timeout: Duration,
}

impl AdmissionConfig {
    /// Configure a single-limiter policy.
    pub fn single(limiter: impl Into<String>) -> AdmissionConfigBuilder {
        AdmissionConfigBuilder::new(AdmissionPolicy::Single {
            limiter: limiter.into(),
        })
    }

    /// Configure a tier-scoped policy over a tier → capacity table.
    pub fn tiered(
        base: impl Into<String>,
        tiers: HashMap<String, u64>,
        duration: Duration,
    ) -> AdmissionConfigBuilder {
        AdmissionConfigBuilder::new(AdmissionPolicy::Tiered {
            base: base.into(),
            tiers,
            duration,
            block_duration: Duration::ZERO,
        })
    }

    /// Configure an ordered multi-limit policy.
    pub fn multi(limits: Vec<MultiLimit>) -> AdmissionConfigBuilder {
        AdmissionConfigBuilder::new(AdmissionPolicy::Multi { limits })
    }
}

/// Builder for [`AdmissionConfig`].
#[must_use = "builder does nothing until you call build()"]
pub struct AdmissionConfigBuilder {
    config: AdmissionConfig,
}

impl AdmissionConfigBuilder {
    fn new(policy: AdmissionPolicy) -> Self {
        Self {
            config: AdmissionConfig {
                policy,
                points_per_request: 1,
                key_strategy: KeyStrategy::Ip,
                skip_successful: false,
                skip_failed: false,
                whitelist: Vec::new(),
                message: DEFAULT_MESSAGE.to_string(),
                status_code: StatusCode::TOO_MANY_REQUESTS,
                header_mode: HeaderMode::Legacy,
                trust_proxy: true,
                check_timeout: DEFAULT_CHECK_TIMEOUT,
            },
        }
    }

    pub fn points_per_request(mut self, points: u64) -> Self {
        self.config.points_per_request = points;
        self
    }

    pub fn key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.config.key_strategy = strategy;
        self
    }

    /// Refund capacity for requests that end below status 400.
    pub fn skip_successful(mut self, skip: bool) -> Self {
        self.config.skip_successful = skip;
        self
    }

    /// Refund capacity for requests that end at status 400 or above.
    pub fn skip_failed(mut self, skip: bool) -> Self {
        self.config.skip_failed = skip;
        self
    }

    pub fn whitelist(mut self, keys: Vec<String>) -> Self {
        self.config.whitelist = keys;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.config.message = message.into();
        self
    }

    pub fn status_code(mut self, code: StatusCode) -> Self {
        self.config.status_code = code;
        self
    }

    pub fn header_mode(mut self, mode: HeaderMode) -> Self {
        self.config.header_mode = mode;
        self
    }

    pub fn trust_proxy(mut self, trust: bool) -> Self {
        self.config.trust_proxy = trust;
        self
    }

    pub fn check_timeout(mut self, timeout: Duration) -> Self {
        self.config.check_timeout = timeout;
        self
    }

    /// Penalty period for lazily registered tier limiters.
    pub fn tier_block_duration(mut self, duration: Duration) -> Self {
        if let AdmissionPolicy::Tiered { block_duration, .. } = &mut self.config.policy {
            *block_duration = duration;
        }
        self
    }

    pub fn build(self) -> AdmissionConfig {
        self.config
    }
}

/// Structured rejection body.
#[derive(Serialize)]
struct RejectionBody {
    success: bool,
    error: RejectionError,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RejectionError {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_type: Option<String>,
}

/// Tower layer enforcing admission control in front of a service.
pub struct AdmissionLayer<S: WindowStore> {
    engine: Arc<RateLimitEngine<S>>,
    config: Arc<AdmissionConfig>,
}

impl<S: WindowStore> AdmissionLayer<S> {
    /// Create a layer, validating the policy eagerly.
    ///
    /// Referencing an unregistered limiter is a configuration error and
    /// fails here, at setup time, rather than turning into an unlimited
    /// endpoint at request time.
    pub fn new(engine: Arc<RateLimitEngine<S>>, config: AdmissionConfig) -> Result<Self> {
        match &config.policy {
            AdmissionPolicy::Single { limiter } => {
                engine.registry().get(limiter)?;
            }
            AdmissionPolicy::Multi { limits } => {
                if limits.is_empty() {
                    return Err(FloodgateError::Config(
                        "multi-limit policy needs at least one limit".to_string(),
                    ));
                }
                for limit in limits {
                    engine.registry().get(&limit.limiter)?;
                }
            }
            AdmissionPolicy::Tiered { tiers, .. } => {
                if tiers.is_empty() {
                    return Err(FloodgateError::Config(
                        "tiered policy needs at least one tier".to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            engine,
            config: Arc::new(config),
        })
    }
}

impl<S: WindowStore> Clone for AdmissionLayer<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: WindowStore, I> Layer<I> for AdmissionLayer<S> {
    type Service = AdmissionService<S, I>;

    fn layer(&self, inner: I) -> Self::Service {
        AdmissionService {
            inner,
            engine: self.engine.clone(),
            config: self.config.clone(),
        }
    }
}

/// Tower service produced by [`AdmissionLayer`].
pub struct AdmissionService<S: WindowStore, I> {
    inner: I,
    engine: Arc<RateLimitEngine<S>>,
    config: Arc<AdmissionConfig>,
}

impl<S: WindowStore, I: Clone> Clone for AdmissionService<S, I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            engine: self.engine.clone(),
            config: self.config.clone(),
        }
    }
}

/// The admission outcome for one request.
struct Decision {
    result: CheckResult,
    limit_name: String,
    message: String,
    /// What this request consumed, for post-response refunds.
    consumed: Vec<(String, u64)>,
}

impl<S, I> Service<Request> for AdmissionService<S, I>
where
    S: WindowStore + 'static,
    I: Service<Request> + Clone + Send + Sync + 'static,
    I::Response: IntoResponse,
    I::Future: Send + 'static,
{
    type Response = Response;
    type Error = I::Error;
    type Future = BoxFuture<'static, std::result::Result<Response, I::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let engine = self.engine.clone();
        let config = self.config.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let (key, req) = match &config.key_strategy {
                KeyStrategy::Login => derive_login_key(req, config.trust_proxy).await,
                strategy => (derive_key(strategy, &req, config.trust_proxy), req),
            };

            // Whitelisted keys bypass the engine entirely: no check, no
            // store write.
            if config.whitelist.iter().any(|w| *w == key) {
                trace!(key = %key, "Whitelisted key bypasses admission");
                let response = inner.call(req).await?;
                return Ok(response.into_response());
            }

            let request_tier = req
                .extensions()
                .get::<AuthContext>()
                .and_then(|auth| auth.tier.clone());
            match admit(&engine, &config, &key, request_tier).await {
                Ok(decision) if decision.result.allowed => {
                    let response = inner.call(req).await?;
                    let mut response = response.into_response();
                    apply_headers(&mut response, config.header_mode, &decision.result);

                    // The inner future has resolved, so the final status
                    // is known; refund if the flags say this outcome
                    // should not count against the limit.
                    let status = response.status().as_u16();
                    let refundable = (config.skip_successful && status < 400)
                        || (config.skip_failed && status >= 400);
                    if refundable {
                        for (limiter, points) in &decision.consumed {
                            if let Err(err) = engine.refund(limiter, &key, *points).await {
                                warn!(
                                    limiter = %limiter,
                                    key = %key,
                                    error = %err,
                                    "Refund failed"
                                );
                            }
                        }
                    }
                    Ok(response)
                }
                Ok(decision) => Ok(reject(&config, &decision)),
                Err(err) => {
                    // Fail open: availability over strict enforcement.
                    warn!(
                        key = %key,
                        error = %err,
                        "Admission check failed; allowing request through"
                    );
                    let response = inner.call(req).await?;
                    Ok(response.into_response())
                }
            }
        })
    }
}

/// Run the configured policy for a key, under the check timeout.
async fn admit<S: WindowStore>(
    engine: &RateLimitEngine<S>,
    config: &AdmissionConfig,
    key: &str,
    // The request's tier is read by the caller and passed in by value so
    // the non-`Sync` request reference is never held across an await here
    // (which would make the admission future non-`Send`).
    request_tier: Option<String>,
) -> Result<Decision> {
    let check = async {
        match &config.policy {
            AdmissionPolicy::Single { limiter } => {
                let result = engine
                    .check_limit(limiter, key, config.points_per_request)
                    .await?;
                Ok(Decision {
                    result,
                    limit_name: limiter.clone(),
                    message: config.message.clone(),
                    consumed: vec![(limiter.clone(), config.points_per_request)],
                })
            }
            AdmissionPolicy::Tiered {
                base,
                tiers,
                duration,
                block_duration,
            } => {
                let tier = request_tier
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TIER.to_string());
                // Unrecognized tiers get the free allowance rather than
                // a free pass.
                let capacity = tiers
                    .get(&tier)
                    .or_else(|| tiers.get(DEFAULT_TIER))
                    .copied()
                    .unwrap_or(1);

                let limiter = format!("{}:{}", base, tier);
                engine.register_limiter_if_absent(
                    &limiter,
                    LimiterConfig {
                        points: capacity,
                        duration: *duration,
                        block_duration: *block_duration,
                    },
                )?;

                let result = engine
                    .check_limit(&limiter, key, config.points_per_request)
                    .await?;
                Ok(Decision {
                    result,
                    consumed: vec![(limiter.clone(), config.points_per_request)],
                    limit_name: limiter,
                    message: config.message.clone(),
                })
            }
            AdmissionPolicy::Multi { limits } => {
                let specs: Vec<LimitSpec> = limits
                    .iter()
                    .map(|l| LimitSpec {
                        limiter: l.limiter.clone(),
                        points: l.points,
                    })
                    .collect();
                let multi = engine.check_multiple(&specs, key).await?;

                match multi.failed_limit {
                    Some(failed) => {
                        let message = limits
                            .iter()
                            .find(|l| l.limiter == failed)
                            .map(|l| l.message.clone())
                            .unwrap_or_else(|| config.message.clone());
                        Ok(Decision {
                            result: multi.check.expect("failed multi-check carries its result"),
                            limit_name: failed,
                            message,
                            consumed: Vec::new(),
                        })
                    }
                    None => Ok(Decision {
                        result: multi.check.expect("non-empty multi-check carries a result"),
                        limit_name: limits[0].limiter.clone(),
                        message: config.message.clone(),
                        consumed: limits
                            .iter()
                            .map(|l| (l.limiter.clone(), l.points))
                            .collect(),
                    }),
                }
            }
        }
    };

    match tokio::time::timeout(config.check_timeout, check).await {
        Ok(result) => result,
        Err(_) => Err(FloodgateError::StoreUnavailable(format!(
            "admission check timed out after {:?}",
            config.check_timeout
        ))),
    }
}

const X_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
const REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
const RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

fn apply_headers(response: &mut Response, mode: HeaderMode, result: &CheckResult) {
    let headers = response.headers_mut();
    match mode {
        HeaderMode::Disabled => {}
        HeaderMode::Legacy => {
            headers.insert(X_LIMIT, HeaderValue::from(result.limit));
            headers.insert(X_REMAINING, HeaderValue::from(result.remaining));
            let reset_at = chrono::Utc::now().timestamp() + result.reset_after.as_secs() as i64;
            headers.insert(X_RESET, HeaderValue::from(reset_at));
        }
        HeaderMode::Draft => {
            headers.insert(LIMIT, HeaderValue::from(result.limit));
            headers.insert(REMAINING, HeaderValue::from(result.remaining));
            headers.insert(RESET, HeaderValue::from(result.reset_after.as_secs()));
        }
    }
}

/// Build the rejection response: status, headers, Retry-After, and the
/// structured error body.
fn reject(config: &AdmissionConfig, decision: &Decision) -> Response {
    let retry_secs = decision.result.retry_after.map(|d| d.as_secs().max(1));

    let body = RejectionBody {
        success: false,
        error: RejectionError {
            code: "RATE_LIMIT_EXCEEDED",
            message: decision.message.clone(),
            retry_after: retry_secs,
            blocked: decision.result.blocked.then_some(true),
            limit_type: Some(decision.limit_name.clone()),
        },
    };

    let mut response = (config.status_code, axum::Json(body)).into_response();
    apply_headers(&mut response, config.header_mode, &decision.result);
    if let Some(retry) = retry_secs {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::MemoryStore;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use std::time::Instant;
    use tower::ServiceExt;

    fn engine_with(limits: &[(&str, u64, u64, u64)]) -> Arc<RateLimitEngine<MemoryStore>> {
        let engine = Arc::new(RateLimitEngine::new(MemoryStore::new()));
        for (name, points, duration, block) in limits {
            engine
                .register_limiter(name, LimiterConfig::new(*points, *duration, *block))
                .unwrap();
        }
        engine
    }

    async fn ok_handler() -> &'static str {
        "ok"
    }

    fn request_from(ip: &str) -> Request {
        Request::builder()
            .uri("/")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_layer_rejects_unknown_limiter_at_setup() {
        let engine = engine_with(&[]);
        let result = AdmissionLayer::new(engine, AdmissionConfig::single("ghost").build());
        assert!(matches!(result.err(), Some(FloodgateError::Config(_))));
    }

    #[tokio::test]
    async fn test_requests_over_limit_get_429() {
        let engine = engine_with(&[("api", 2, 60, 0)]);
        let layer = AdmissionLayer::new(engine, AdmissionConfig::single("api").build()).unwrap();
        let app = Router::new().route("/", get(ok_handler)).layer(layer);

        for _ in 0..2 {
            let response = app.clone().oneshot(request_from("1.2.3.4")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(request_from("1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));

        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["error"]["limitType"], "api");

        // A different client still has capacity.
        let response = app.oneshot(request_from("5.6.7.8")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_legacy_and_draft_headers() {
        let engine = engine_with(&[("api", 10, 60, 0)]);
        let layer =
            AdmissionLayer::new(engine.clone(), AdmissionConfig::single("api").build()).unwrap();
        let app = Router::new().route("/", get(ok_handler)).layer(layer);

        let response = app.oneshot(request_from("1.2.3.4")).await.unwrap();
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "9");
        assert!(response.headers().contains_key("x-ratelimit-reset"));

        let layer = AdmissionLayer::new(
            engine,
            AdmissionConfig::single("api")
                .header_mode(HeaderMode::Draft)
                .build(),
        )
        .unwrap();
        let app = Router::new().route("/", get(ok_handler)).layer(layer);

        let response = app.oneshot(request_from("1.2.3.4")).await.unwrap();
        assert_eq!(response.headers()["ratelimit-limit"], "10");
        assert_eq!(response.headers()["ratelimit-remaining"], "8");
        let reset: u64 = response.headers()["ratelimit-reset"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(reset > 0 && reset <= 60);
    }

    #[tokio::test]
    async fn test_whitelisted_key_never_touches_store() {
        let engine = engine_with(&[("api", 1, 60, 0)]);
        let layer = AdmissionLayer::new(
            engine.clone(),
            AdmissionConfig::single("api")
                .whitelist(vec!["203.0.113.9".to_string()])
                .build(),
        )
        .unwrap();
        let app = Router::new().route("/", get(ok_handler)).layer(layer);

        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(request_from("203.0.113.9"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(engine.store().entry_count(), 0);
    }

    #[tokio::test]
    async fn test_refund_after_successful_response() {
        let engine = engine_with(&[("login", 1, 900, 0)]);
        let layer = AdmissionLayer::new(
            engine,
            AdmissionConfig::single("login").skip_successful(true).build(),
        )
        .unwrap();
        let app = Router::new().route("/", get(ok_handler)).layer(layer);

        // Capacity is 1, but every successful request is refunded, so
        // the limit never bites.
        for _ in 0..4 {
            let response = app.clone().oneshot(request_from("1.2.3.4")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_skip_failed_refunds_error_responses() {
        async fn failing_handler() -> (StatusCode, &'static str) {
            (StatusCode::BAD_GATEWAY, "upstream broke")
        }

        let engine = engine_with(&[("api", 1, 60, 0)]);
        let layer = AdmissionLayer::new(
            engine,
            AdmissionConfig::single("api").skip_failed(true).build(),
        )
        .unwrap();
        let app = Router::new().route("/", get(failing_handler)).layer(layer);

        for _ in 0..3 {
            let response = app.clone().oneshot(request_from("1.2.3.4")).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }
    }

    #[tokio::test]
    async fn test_no_refund_consumes_capacity() {
        let engine = engine_with(&[("api", 1, 60, 0)]);
        let layer = AdmissionLayer::new(engine, AdmissionConfig::single("api").build()).unwrap();
        let app = Router::new().route("/", get(ok_handler)).layer(layer);

        let response = app.clone().oneshot(request_from("1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(request_from("1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_tiered_policy_separates_capacities() {
        let engine = engine_with(&[]);
        let tiers = HashMap::from([("free".to_string(), 2), ("pro".to_string(), 5)]);
        let layer = AdmissionLayer::new(
            engine,
            AdmissionConfig::tiered("tier", tiers, Duration::from_secs(60)).build(),
        )
        .unwrap();
        let app = Router::new().route("/", get(ok_handler)).layer(layer);

        let pro_request = || {
            Request::builder()
                .uri("/")
                .header("x-forwarded-for", "1.2.3.4")
                .extension(AuthContext {
                    user_id: "u-1".into(),
                    tier: Some("pro".into()),
                })
                .body(Body::empty())
                .unwrap()
        };

        // Pro tier: 5 per window.
        for _ in 0..5 {
            let response = app.clone().oneshot(pro_request()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app.clone().oneshot(pro_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        // Anonymous requests resolve to the free tier: 2 per window.
        for _ in 0..2 {
            let response = app.clone().oneshot(request_from("9.9.9.9")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app.clone().oneshot(request_from("9.9.9.9")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_multi_limit_reports_failing_limiter() {
        let engine = engine_with(&[("api", 100, 60, 0), ("burst", 2, 60, 0)]);
        let layer = AdmissionLayer::new(
            engine,
            AdmissionConfig::multi(vec![
                MultiLimit {
                    limiter: "api".into(),
                    points: 1,
                    message: "API limit exceeded".into(),
                },
                MultiLimit {
                    limiter: "burst".into(),
                    points: 1,
                    message: "Burst limit exceeded".into(),
                },
            ])
            .build(),
        )
        .unwrap();
        let app = Router::new().route("/", get(ok_handler)).layer(layer);

        for _ in 0..2 {
            let response = app.clone().oneshot(request_from("1.2.3.4")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.oneshot(request_from("1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["limitType"], "burst");
        assert_eq!(body["error"]["message"], "Burst limit exceeded");
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        use crate::ratelimit::{WindowSnapshot, WindowStore};
        use async_trait::async_trait;

        struct BrokenStore;

        #[async_trait]
        impl WindowStore for BrokenStore {
            async fn window(
                &self,
                _key: &str,
                _now: Instant,
                _window: Duration,
            ) -> Result<Option<WindowSnapshot>> {
                Err(FloodgateError::StoreUnavailable("connection refused".into()))
            }

            async fn increment(
                &self,
                _key: &str,
                _points: u64,
                _now: Instant,
                _window: Duration,
            ) -> Result<WindowSnapshot> {
                Err(FloodgateError::StoreUnavailable("connection refused".into()))
            }

            async fn decrement(
                &self,
                _key: &str,
                _points: u64,
                _now: Instant,
                _window: Duration,
            ) -> Result<()> {
                Err(FloodgateError::StoreUnavailable("connection refused".into()))
            }

            async fn block(&self, _key: &str, _now: Instant, _duration: Duration) -> Result<()> {
                Err(FloodgateError::StoreUnavailable("connection refused".into()))
            }

            async fn blocked_for(&self, _key: &str, _now: Instant) -> Result<Option<Duration>> {
                Err(FloodgateError::StoreUnavailable("connection refused".into()))
            }

            async fn reset(&self, _key: &str) -> Result<()> {
                Err(FloodgateError::StoreUnavailable("connection refused".into()))
            }

            async fn sweep(&self, _now: Instant) -> Result<usize> {
                Err(FloodgateError::StoreUnavailable("connection refused".into()))
            }
        }

        let engine = Arc::new(RateLimitEngine::new(BrokenStore));
        engine
            .register_limiter("api", LimiterConfig::new(1, 60, 0))
            .unwrap();
        let layer = AdmissionLayer::new(engine, AdmissionConfig::single("api").build()).unwrap();
        let app = Router::new().route("/", get(ok_handler)).layer(layer);

        // The store is down; every request still goes through.
        for _ in 0..3 {
            let response = app.clone().oneshot(request_from("1.2.3.4")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_slow_store_fails_open() {
        use crate::ratelimit::{WindowSnapshot, WindowStore};
        use async_trait::async_trait;

        struct HangingStore;

        #[async_trait]
        impl WindowStore for HangingStore {
            async fn window(
                &self,
                _key: &str,
                _now: Instant,
                _window: Duration,
            ) -> Result<Option<WindowSnapshot>> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(None)
            }

            async fn increment(
                &self,
                _key: &str,
                _points: u64,
                _now: Instant,
                _window: Duration,
            ) -> Result<WindowSnapshot> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            }

            async fn decrement(
                &self,
                _key: &str,
                _points: u64,
                _now: Instant,
                _window: Duration,
            ) -> Result<()> {
                Ok(())
            }

            async fn block(&self, _key: &str, _now: Instant, _duration: Duration) -> Result<()> {
                Ok(())
            }

            async fn blocked_for(&self, _key: &str, _now: Instant) -> Result<Option<Duration>> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(None)
            }

            async fn reset(&self, _key: &str) -> Result<()> {
                Ok(())
            }

            async fn sweep(&self, _now: Instant) -> Result<usize> {
                Ok(0)
            }
        }

        let engine = Arc::new(RateLimitEngine::new(HangingStore));
        engine
            .register_limiter("api", LimiterConfig::new(1, 60, 0))
            .unwrap();
        let layer = AdmissionLayer::new(
            engine,
            AdmissionConfig::single("api")
                .check_timeout(Duration::from_millis(20))
                .build(),
        )
        .unwrap();
        let app = Router::new().route("/", get(ok_handler)).layer(layer);

        let response = app.oneshot(request_from("1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
