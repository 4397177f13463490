//! Webhook receiver: `POST /webhook`.
//!
//! Validation order: required headers (422) → HMAC signature (401) →
//! installation and repository scope (403) → per-sender rate limit (429) →
//! enqueue and 200 immediately, well inside GitHub's 10-second delivery
//! deadline. Deduplication happens later in the router, where persistence
//! is available.

use crate::models::GitHubEvent;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

const EVENT_HEADER: &str = "X-GitHub-Event";
const DELIVERY_HEADER: &str = "X-GitHub-Delivery";
const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

pub struct WebhookState {
    queue: mpsc::Sender<GitHubEvent>,
    secret: String,
    installation_id: Option<u64>,
    repo_full_name: Option<String>,
    limiter: Option<DefaultKeyedRateLimiter<String>>,
}

impl WebhookState {
    pub fn new(
        queue: mpsc::Sender<GitHubEvent>,
        secret: String,
        installation_id: Option<u64>,
        repo_full_name: Option<String>,
        rate_limit_per_minute: u32,
    ) -> Self {
        // A configured max of 0 disables rate limiting.
        let limiter = NonZeroU32::new(rate_limit_per_minute)
            .map(|n| RateLimiter::keyed(Quota::per_minute(n)));
        Self {
            queue,
            secret,
            installation_id,
            repo_full_name,
            limiter,
        }
    }
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn handle_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(event_type) = header_str(&headers, EVENT_HEADER) else {
        return (StatusCode::UNPROCESSABLE_ENTITY, "missing X-GitHub-Event");
    };
    let Some(delivery_id) = header_str(&headers, DELIVERY_HEADER) else {
        return (StatusCode::UNPROCESSABLE_ENTITY, "missing X-GitHub-Delivery");
    };

    if !verify_signature(
        header_str(&headers, SIGNATURE_HEADER),
        state.secret.as_bytes(),
        &body,
    ) {
        warn!(delivery_id = %delivery_id, "Invalid webhook signature");
        return (StatusCode::UNAUTHORIZED, "invalid signature");
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return (StatusCode::UNPROCESSABLE_ENTITY, "unreadable payload"),
    };

    let event = GitHubEvent {
        delivery_id: delivery_id.to_string(),
        event_type: event_type.to_string(),
        action: payload
            .get("action")
            .and_then(|v| v.as_str())
            .map(String::from),
        payload,
    };

    // Installation scope.
    if let Some(expected) = state.installation_id {
        if event.installation_id() != Some(expected) {
            warn!(delivery_id = %delivery_id, "Installation scope mismatch");
            return (StatusCode::FORBIDDEN, "wrong installation");
        }
    }

    // Repository scope.
    if let Some(expected) = &state.repo_full_name {
        if event.repo_full_name() != Some(expected.as_str()) {
            warn!(delivery_id = %delivery_id, repo = ?event.repo_full_name(), "Repository scope mismatch");
            return (StatusCode::FORBIDDEN, "wrong repository");
        }
    }

    // Per-sender rate limit.
    if let Some(limiter) = &state.limiter {
        let key = event.sender().unwrap_or("unknown").to_string();
        if limiter.check_key(&key).is_err() {
            warn!(sender = %key, "Webhook rate limit exceeded");
            return (StatusCode::TOO_MANY_REQUESTS, "rate limited");
        }
    }

    info!(
        full_type = %event.full_type(),
        delivery_id = %delivery_id,
        sender = ?event.sender(),
        "Webhook received"
    );

    match state.queue.try_send(event) {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(delivery_id = %delivery_id, "Event queue full; asking GitHub to redeliver");
            (StatusCode::SERVICE_UNAVAILABLE, "queue full")
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            warn!(delivery_id = %delivery_id, "Event queue closed");
            (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Constant-time HMAC-SHA256 check of `sha256=<hex>` against the body.
pub fn verify_signature(signature_header: Option<&str>, secret: &[u8], body: &[u8]) -> bool {
    let Some(signature) = signature_header
        .and_then(|s| s.strip_prefix("sha256="))
        .and_then(|s| hex::decode(s).ok())
    else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    // verify_slice is constant-time.
    mac.verify_slice(&signature).is_ok()
}

/// The `sha256=<hex>` header value for a body: used by tests and local
/// delivery tooling.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
