//! The layered request pipeline: RateLimit → Idempotency → Auth
//!
//! Correlation-id handling wraps the trio; the metrics middleware sits
//! just inside it. Each middleware appends its tag to the request-scoped
//! chain and observes its own latency on every outcome.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors;
use crate::state::{AppState, CorrelationId, MiddlewareChain};

const IDEMPOTENCY_TTL_SECONDS: u64 = 24 * 60 * 60;

fn is_bypass_path(path: &str) -> bool {
    matches!(path, "/healthz" | "/readyz" | "/metrics") || path.starts_with("/ui/")
}

fn push_tag(request: &mut Request, tag: &str) {
    match request.extensions_mut().get_mut::<MiddlewareChain>() {
        Some(chain) => chain.0.push(tag.to_string()),
        None => {
            request
                .extensions_mut()
                .insert(MiddlewareChain(vec![tag.to_string()]));
        }
    }
}

fn chain_of(request: &Request) -> Vec<String> {
    request
        .extensions()
        .get::<MiddlewareChain>()
        .map(|chain| chain.0.clone())
        .unwrap_or_default()
}

fn correlation_of(request: &Request) -> String {
    request
        .extensions()
        .get::<CorrelationId>()
        .map(|id| id.0.clone())
        .unwrap_or_default()
}

/// Outermost: mint or propagate the correlation id
pub async fn correlation_middleware(
    State(_state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let header_value = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if sabt_text::ensure_no_control_chars([header_value.as_str()]).is_err() {
        return errors::internal_server_error();
    }
    let correlation_id = if header_value.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        header_value
    };
    request
        .extensions_mut()
        .insert(CorrelationId(correlation_id.clone()));
    request.extensions_mut().insert(MiddlewareChain::default());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Fixed-window rate limiting over the key-value store
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    push_tag(&mut request, "RateLimit");
    let handle = state.timer.start();
    let path = request.uri().path().to_string();

    if is_bypass_path(&path) {
        let duration = handle.elapsed();
        state
            .metrics
            .rate_limit_decision_total
            .with_label_values(&["bypass"])
            .inc();
        state.metrics.rate_limit_latency_seconds.observe(duration);
        state.diagnostics.record_rate_limit("bypass", duration);
        return next.run(request).await;
    }

    let client = request
        .headers()
        .get("x-client-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| "anonymous".to_string());
    if sabt_text::ensure_no_control_chars([client.as_str()]).is_err() {
        return errors::internal_server_error();
    }

    let config = &state.config.ratelimit;
    let window_index = state.clock.now().timestamp() / config.window_seconds as i64;
    let bucket = format!("{}:rl:{}:{}", config.namespace, client, window_index);

    let count = match state.store.incr(&bucket, config.window_seconds).await {
        Ok(count) => count,
        Err(error) => {
            warn!(correlation_id = %correlation_of(&request), error = %error, "rate limit store failure");
            return errors::internal_server_error();
        }
    };

    if count > config.requests {
        warn!(correlation_id = %correlation_of(&request), client = %client, "rate limit exceeded");
        let duration = handle.elapsed();
        state
            .metrics
            .rate_limit_decision_total
            .with_label_values(&["block"])
            .inc();
        state.metrics.rate_limit_latency_seconds.observe(duration);
        state.diagnostics.record_rate_limit("block", duration);
        let (code, message) = errors::rate_limited();
        let mut response = errors::envelope(StatusCode::TOO_MANY_REQUESTS, &code, &message);
        if let Ok(value) = HeaderValue::from_str(&config.penalty_seconds.to_string()) {
            response.headers_mut().insert("retry-after", value);
        }
        return response;
    }

    let remaining = (config.requests - count).max(0);
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        response.headers_mut().insert("x-ratelimit-remaining", value);
    }
    let duration = handle.elapsed();
    state
        .metrics
        .rate_limit_decision_total
        .with_label_values(&["allow"])
        .inc();
    state.metrics.rate_limit_latency_seconds.observe(duration);
    state.diagnostics.record_rate_limit("allow", duration);
    response
}

#[derive(Serialize, Deserialize)]
struct CachedResponse {
    status: u16,
    headers: BTreeMap<String, String>,
    body: String,
    media_type: String,
}

fn replay_response(cached: &CachedResponse) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK));
    for (name, value) in &cached.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = builder.header(CONTENT_TYPE, cached.media_type.as_str());
    builder
        .body(Body::from(cached.body.clone()))
        .unwrap_or_else(|_| errors::internal_server_error())
}

/// Replay cached responses for duplicate mutating requests
pub async fn idempotency_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    push_tag(&mut request, "Idempotency");
    let handle = state.timer.start();
    let path = request.uri().path().to_string();
    let method = request.method().clone();

    if method == axum::http::Method::GET
        || method == axum::http::Method::HEAD
        || is_bypass_path(&path)
    {
        let duration = handle.elapsed();
        state
            .metrics
            .idempotency_hits_total
            .with_label_values(&["bypass"])
            .inc();
        state.metrics.idempotency_latency_seconds.observe(duration);
        return next.run(request).await;
    }

    let raw_key = request
        .headers()
        .get("idempotency-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if sabt_text::ensure_no_control_chars([raw_key.as_str()]).is_err() {
        return errors::internal_server_error();
    }
    let key = sabt_text::normalize_token(Some(&raw_key));
    if key.is_empty() {
        let duration = handle.elapsed();
        state
            .metrics
            .idempotency_hits_total
            .with_label_values(&["reject"])
            .inc();
        state.metrics.idempotency_latency_seconds.observe(duration);
        return errors::idempotency_key_required();
    }

    let namespaced = format!("idem:{key}");

    let replay_cached = |cached: CachedResponse, duration: f64| {
        state
            .metrics
            .idempotency_hits_total
            .with_label_values(&["hit"])
            .inc();
        state.metrics.idempotency_replays_total.inc();
        state.metrics.idempotency_latency_seconds.observe(duration);
        state.diagnostics.record_idempotency("hit", duration);
        replay_response(&cached)
    };

    match state.store.get(&namespaced).await {
        Ok(Some(raw)) => {
            if let Ok(cached) = serde_json::from_str::<CachedResponse>(&raw) {
                return replay_cached(cached, handle.elapsed());
            }
        }
        Ok(None) => {}
        Err(error) => {
            warn!(correlation_id = %correlation_of(&request), error = %error, "idempotency store failure");
            return errors::internal_server_error();
        }
    }

    // Claim the key with a busy marker. A concurrent loser replays whatever
    // the store holds, which may still be this marker (a 425 busy reply).
    let marker = CachedResponse {
        status: 425,
        headers: BTreeMap::new(),
        body: "processing".to_string(),
        media_type: "text/plain".to_string(),
    };
    let marker_raw = match serde_json::to_string(&marker) {
        Ok(raw) => raw,
        Err(_) => return errors::internal_server_error(),
    };
    let stored = match state
        .store
        .set_if_not_exists(&namespaced, &marker_raw, IDEMPOTENCY_TTL_SECONDS)
        .await
    {
        Ok(stored) => stored,
        Err(error) => {
            warn!(correlation_id = %correlation_of(&request), error = %error, "idempotency store failure");
            return errors::internal_server_error();
        }
    };
    if !stored {
        if let Ok(Some(raw)) = state.store.get(&namespaced).await {
            if let Ok(cached) = serde_json::from_str::<CachedResponse>(&raw) {
                return replay_cached(cached, handle.elapsed());
            }
        }
    }

    let response = next.run(request).await;
    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return errors::internal_server_error(),
    };

    let mut captured_headers = BTreeMap::new();
    for (name, value) in &parts.headers {
        let lowered = name.as_str().to_lowercase();
        if lowered.starts_with("x-") {
            if let Ok(text) = value.to_str() {
                captured_headers.insert(lowered, text.to_string());
            }
        }
    }
    let media_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let cached = CachedResponse {
        status: parts.status.as_u16(),
        headers: captured_headers,
        body: String::from_utf8_lossy(&bytes).into_owned(),
        media_type,
    };
    if let Ok(raw) = serde_json::to_string(&cached) {
        let _ = state
            .store
            .set(&namespaced, &raw, IDEMPOTENCY_TTL_SECONDS)
            .await;
    }

    let duration = handle.elapsed();
    state
        .metrics
        .idempotency_hits_total
        .with_label_values(&["miss"])
        .inc();
    state.metrics.idempotency_latency_seconds.observe(duration);
    state.diagnostics.record_idempotency("miss", duration);

    Response::from_parts(parts, Body::from(bytes))
}

/// Bearer / metrics-token authentication
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    push_tag(&mut request, "Auth");
    let handle = state.timer.start();
    let path = request.uri().path().to_string();

    if matches!(path.as_str(), "/healthz" | "/readyz" | "/download") {
        state.metrics.auth_latency_seconds.observe(handle.elapsed());
        return next.run(request).await;
    }

    let raw_auth = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let raw_metrics = request
        .headers()
        .get("x-metrics-token")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if sabt_text::ensure_no_control_chars([raw_auth.as_str(), raw_metrics.as_str()]).is_err() {
        state.metrics.auth_latency_seconds.observe(handle.elapsed());
        state
            .metrics
            .auth_fail_total
            .with_label_values(&["control_chars"])
            .inc();
        return errors::unauthorized("توکن نامعتبر است.");
    }
    let header = sabt_text::normalize_token(Some(&raw_auth));
    let metrics_header = sabt_text::normalize_token(Some(&raw_metrics));

    let allow_metrics = path == "/metrics";
    let token = if allow_metrics && !metrics_header.is_empty() {
        metrics_header
    } else if let Some(bearer) = header.strip_prefix("Bearer ") {
        bearer.trim().to_string()
    } else {
        String::new()
    };

    match state.tokens.authenticate(&token, allow_metrics) {
        Ok(actor) => {
            request.extensions_mut().insert(actor.clone());
            let response = next.run(request).await;
            let duration = handle.elapsed();
            state.metrics.auth_latency_seconds.observe(duration);
            state
                .metrics
                .auth_ok_total
                .with_label_values(&[&actor.role])
                .inc();
            state.diagnostics.record_auth(serde_json::json!({
                "authorized": true,
                "role": actor.role,
                "duration": duration,
            }));
            info!(
                role = %actor.role,
                metrics_only = actor.metrics_only,
                fingerprint = %actor.token_fingerprint,
                "auth ok"
            );
            response
        }
        Err(error) => {
            let duration = handle.elapsed();
            state.metrics.auth_latency_seconds.observe(duration);
            state
                .metrics
                .auth_fail_total
                .with_label_values(&[error.reason])
                .inc();
            state.diagnostics.record_auth(serde_json::json!({
                "authorized": false,
                "reason": error.reason,
                "duration": duration,
            }));
            warn!(reason = %error.reason, "auth failed");
            if allow_metrics {
                errors::metrics_token_invalid()
            } else if error.reason == "scope_denied" {
                errors::scope_denied(error.message_fa)
            } else {
                errors::unauthorized(error.message_fa)
            }
        }
    }
}

/// Innermost wrapper: request counters and latency
pub async fn metrics_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let handle = state.timer.start();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let chain = chain_of(&request);

    let response = next.run(request).await;

    state.metrics.request_latency_seconds.observe(handle.elapsed());
    state
        .metrics
        .request_total
        .with_label_values(&[&method, &path, response.status().as_str()])
        .inc();
    state.diagnostics.record_chain(&chain);
    response
}
