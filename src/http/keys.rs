//! Request identity key derivation.
//!
//! Strategies map an inbound request to the identity string a limiter
//! counts against. Derivation is deterministic and side-effect-free;
//! every strategy degrades to an IP-based key rather than failing, so a
//! malformed request can never dodge rate limiting.

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request};
use std::net::SocketAddr;
use tracing::debug;

/// Identity attached to the request by upstream authentication.
///
/// Floodgate only consumes this; producing it is the auth layer's job.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Stable user identifier.
    pub user_id: String,
    /// Subscription tier label, when known.
    pub tier: Option<String>,
}

/// How a request is mapped to a rate-limit key.
#[derive(Debug, Clone)]
pub enum KeyStrategy {
    /// Client IP address (the default).
    Ip,
    /// `user:<id>` when authenticated, else IP.
    User,
    /// `api:<key>` from header or query parameter, else IP.
    ApiKey,
    /// `user:<id>:<ip>` when authenticated, else IP.
    Combined,
    /// `<base>:<METHOD>:<path>`, isolating limits per route.
    Endpoint(Box<KeyStrategy>),
    /// `login:<email-or-username>` from submitted credentials, else
    /// `login:<ip>`. Keys on the claimed identity so credential
    /// stuffing cannot evade limits by rotating IPs.
    Login,
}

/// Largest request body the login strategy will buffer looking for
/// credentials. Anything bigger is not a credential payload.
const MAX_CREDENTIAL_BODY: usize = 256 * 1024;

/// Extract the client IP for a request.
///
/// With `trust_proxy` set, the leftmost `x-forwarded-for` entry wins,
/// then `x-real-ip`, then the connection address. Without it only the
/// connection address is used. Falls back to `"unknown"`.
pub fn client_ip(req: &Request, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(forwarded) = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            // May contain "client, proxy1, proxy2"; the leftmost entry
            // is the original client when the proxy is trusted.
            if let Some(ip) = forwarded.split(',').next() {
                let ip = ip.trim();
                if !ip.is_empty() {
                    return ip.to_string();
                }
            }
        }
        if let Some(real_ip) = req
            .headers()
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
        {
            let ip = real_ip.trim();
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Derive the rate-limit key for a request under a strategy.
///
/// The [`KeyStrategy::Login`] body peek is asynchronous; this function
/// covers its fallback (`login:<ip>`) and the full derivation lives in
/// [`derive_login_key`].
pub fn derive_key(strategy: &KeyStrategy, req: &Request, trust_proxy: bool) -> String {
    match strategy {
        KeyStrategy::Ip => client_ip(req, trust_proxy),
        KeyStrategy::User => match req.extensions().get::<AuthContext>() {
            Some(auth) => format!("user:{}", auth.user_id),
            None => client_ip(req, trust_proxy),
        },
        KeyStrategy::ApiKey => match api_key(req) {
            Some(key) => format!("api:{}", key),
            None => client_ip(req, trust_proxy),
        },
        KeyStrategy::Combined => match req.extensions().get::<AuthContext>() {
            Some(auth) => format!(
                "user:{}:{}",
                auth.user_id,
                client_ip(req, trust_proxy)
            ),
            None => client_ip(req, trust_proxy),
        },
        KeyStrategy::Endpoint(base) => format!(
            "{}:{}:{}",
            derive_key(base, req, trust_proxy),
            req.method(),
            req.uri().path()
        ),
        KeyStrategy::Login => format!("login:{}", client_ip(req, trust_proxy)),
    }
}

/// Derive the login key by peeking at the submitted credentials.
///
/// Buffers the body (bounded), looks for an email or username in a JSON
/// payload, and hands back a request carrying the buffered body so the
/// downstream handler still sees it. Requests without a readable
/// identifier key on `login:<ip>`.
pub async fn derive_login_key(req: Request, trust_proxy: bool) -> (String, Request) {
    let ip_key = format!("login:{}", client_ip(&req, trust_proxy));

    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_CREDENTIAL_BODY).await {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(error = %err, "Could not buffer credential body; keying on IP");
            let req = Request::from_parts(parts, Body::empty());
            return (ip_key, req);
        }
    };

    let key = credential_identifier(&bytes)
        .map(|id| format!("login:{}", id))
        .unwrap_or(ip_key);

    let req = Request::from_parts(parts, Body::from(bytes));
    (key, req)
}

/// Pull the claimed identity out of a JSON credential payload.
fn credential_identifier(bytes: &Bytes) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    for field in ["email", "username", "identifier"] {
        if let Some(id) = value.get(field).and_then(|v| v.as_str()) {
            let id = id.trim();
            if !id.is_empty() {
                return Some(id.to_ascii_lowercase());
            }
        }
    }
    None
}

/// API key from the `x-api-key` header or `api_key` query parameter.
fn api_key(req: &Request) -> Option<String> {
    if let Some(key) = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|k| !k.is_empty())
    {
        return Some(key.to_string());
    }

    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            (name == "api_key" && !value.is_empty()).then(|| value.to_string())
        })
    })
}
