use axum::{
    Json,
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Uri},
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use generation_gateway::error::GatewayError;
use generation_gateway::metrics::REQUEST_TOTAL;
use generation_gateway::{AdmissionError, AdmissionPipeline, RateLimitHeaders, RequestMeta, RunError};
use crate::models::{GenerateRequest, GenerateResponse};
use crate::state::AppState;

const REQUEST_ID: &str = "x-request-id";

pub async fn generate_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    REQUEST_TOTAL.inc();

    let meta = RequestMeta::new(headers, Some(peer), uri.path());
    let request_id = meta
        .headers
        .get(REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| state.next_request_id());

    let admission = match state.pipeline.admit(&meta, state.default_threads).await {
        Ok(admission) => admission,
        Err(e) => return rejection(&state.pipeline, &meta, e),
    };

    // parsed only once admitted, so malformed bodies still count against the quota
    let payload = match serde_json::from_slice::<GenerateRequest>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            let mut response = GatewayError::from(e).into_response();
            insert_rate_limit_headers(response.headers_mut(), &admission.headers);
            return response;
        }
    };

    // caller may ask for less time, never more
    let max_timeout = state.pipeline.executor.default_timeout();
    let timeout = payload
        .timeout
        .map(|secs| Duration::from_secs(secs).min(max_timeout));

    let mut request = payload;
    request.stream = false;
    request.options.get_or_insert_with(Default::default).num_thread = Some(admission.threads);

    let result = state
        .pipeline
        .execute(&request_id, || forward(&state, request), timeout)
        .await;

    let mut response = match result {
        Ok(body) => Json(body).into_response(),
        Err(RunError::Deadline(e)) => e.into_response(),
        Err(RunError::Operation(e)) => e.into_response(),
    };

    let out = response.headers_mut();
    insert_rate_limit_headers(out, &admission.headers);
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        out.insert(HeaderName::from_static(REQUEST_ID), value);
    }
    response
}

// Send the request to the next healthy backend
async fn forward(
    state: &AppState,
    request: GenerateRequest,
) -> Result<GenerateResponse, GatewayError> {
    let backend = state
        .load_balancer
        .get_backend()
        .ok_or(GatewayError::NoHealthyBackend)?;

    let res = state
        .client
        .post(format!("{}/api/generate", backend.url))
        .json(&request)
        .send()
        .await
        .map_err(|e| {
            // Marking backend as unhealthy on error
            backend.set_healthy(false);
            warn!(url = %backend.url, error = %e, "backend failed, marked unhealthy");
            GatewayError::Upstream(e)
        })?;

    if !res.status().is_success() {
        return Err(GatewayError::BadStatus(res.status()));
    }
    Ok(res.json::<GenerateResponse>().await?)
}

// Rejections carry the same quota headers as admitted responses
fn rejection(pipeline: &AdmissionPipeline, meta: &RequestMeta, err: AdmissionError) -> Response {
    let quota = pipeline.rate_limiter.headers(&pipeline.client_key(meta));
    let mut response = err.into_response();
    insert_rate_limit_headers(response.headers_mut(), &quota);
    response
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, quota: &RateLimitHeaders) {
    let values = [
        ("x-ratelimit-limit", quota.limit.to_string()),
        ("x-ratelimit-remaining", quota.remaining.to_string()),
        ("x-ratelimit-reset", quota.reset.to_string()),
        ("x-ratelimit-window", quota.window_secs.to_string()),
    ];
    for (name, value) in values {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}
