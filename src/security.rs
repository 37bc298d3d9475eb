use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Identity attached to every authenticated review-surface request, so
/// approve/reject decisions are attributable in the logs.
#[derive(Clone, Debug)]
pub struct ReviewerContext {
    pub reviewer_id: String,
    pub key_id: String,
}

#[derive(Clone)]
pub struct AuthState {
    keys: Arc<HashMap<String, ReviewerContext>>,
    limiter: Arc<RateLimiter>,
}

impl AuthState {
    pub fn from_env() -> Self {
        Self {
            keys: Arc::new(load_keys_from_env()),
            limiter: Arc::new(RateLimiter::from_env()),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<ReviewerContext> {
        self.keys.get(presented).cloned()
    }
}

pub async fn require_review_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "missing_api_key",
            "Provide X-Argus-Key or a Bearer token",
        ));
    };

    let Some(context) = state.authenticate(&presented) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "Key not recognized",
        ));
    };

    match state.limiter.consume(&context.reviewer_id).await {
        Ok(remaining) => {
            request.extensions_mut().insert(context);
            let mut response = next.run(request).await;
            remaining.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(exceeded) => {
            let mut response = error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many requests",
            );
            exceeded.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    let bearer = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, key)| key.trim().to_string());
    bearer
        .or_else(|| {
            headers
                .get("X-Argus-Key")
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_string())
        })
        .filter(|value| !value.is_empty())
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

/// `REVIEW_API_KEYS` holds `reviewer:key` pairs, comma separated.
fn load_keys_from_env() -> HashMap<String, ReviewerContext> {
    let raw = env::var("REVIEW_API_KEYS").unwrap_or_else(|_| "review-team:argus-dev-key".into());
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((reviewer, secret)) = trimmed
            .split_once(':')
            .map(|(r, s)| (r.trim(), s.trim()))
            .filter(|(r, s)| !r.is_empty() && !s.is_empty())
        else {
            warn!(
                target = "argus.api",
                "ignored malformed REVIEW_API_KEYS entry: {trimmed}"
            );
            continue;
        };
        entries.insert(
            secret.to_string(),
            ReviewerContext {
                reviewer_id: reviewer.to_string(),
                key_id: format!("key-{:02}", idx + 1),
            },
        );
    }

    if entries.is_empty() {
        warn!(
            target = "argus.api",
            "REVIEW_API_KEYS produced no keys; falling back to the dev credential"
        );
        entries.insert(
            "argus-dev-key".to_string(),
            ReviewerContext {
                reviewer_id: "review-team".to_string(),
                key_id: "key-01".to_string(),
            },
        );
    } else {
        info!(
            target = "argus.api",
            key_count = entries.len(),
            "loaded review API keys from env"
        );
    }

    entries
}

/// Token buckets, one per reviewer.
struct RateLimiter {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone)]
pub struct RateStatus {
    capacity: f64,
    tokens: f64,
    rate: f64,
    retry_after: Option<f64>,
}

impl RateLimiter {
    fn from_env() -> Self {
        let rate_per_sec = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value >= 1.0)
            .unwrap_or(10.0);
        Self {
            rate_per_sec,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn consume(&self, key: &str) -> Result<RateStatus, RateStatus> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = guard.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let refill = now.duration_since(bucket.last_refill).as_secs_f64() * self.rate_per_sec;
        bucket.tokens = (bucket.tokens + refill).min(self.capacity);
        bucket.last_refill = now;

        let granted = bucket.tokens >= 1.0;
        if granted {
            bucket.tokens -= 1.0;
        }
        let status = RateStatus {
            capacity: self.capacity,
            tokens: bucket.tokens,
            rate: self.rate_per_sec,
            retry_after: (!granted).then(|| ((1.0 - bucket.tokens) / self.rate_per_sec).max(0.0)),
        };
        if granted { Ok(status) } else { Err(status) }
    }
}

impl RateStatus {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let remaining = self.tokens.max(0.0).floor() as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        insert_numeric(headers, "X-RateLimit-Limit", self.capacity as u64);
        insert_numeric(headers, "X-RateLimit-Remaining", remaining);
        insert_numeric(headers, "X-RateLimit-Reset", reset);
        if let Some(retry_after) = self.retry_after {
            let retry = retry_after.ceil().max(0.0) as u64;
            headers.insert(
                http::header::RETRY_AFTER,
                HeaderValue::from_str(&retry.to_string())
                    .unwrap_or_else(|_| HeaderValue::from_static("1")),
            );
        }
    }
}

fn insert_numeric(headers: &mut http::HeaderMap, name: &'static str, value: u64) {
    headers.insert(
        name,
        HeaderValue::from_str(&value.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
}
