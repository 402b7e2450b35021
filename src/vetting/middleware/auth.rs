use axum::{
    extract::Request,
    extract::State,
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::vetting::state::SecurityConfig;

fn constant_time_str_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    let max_len = left_bytes.len().max(right_bytes.len());
    let mut diff = left_bytes.len() ^ right_bytes.len();

    for i in 0..max_len {
        let l = left_bytes.get(i).copied().unwrap_or(0);
        let r = right_bytes.get(i).copied().unwrap_or(0);
        diff |= (l ^ r) as usize;
    }

    diff == 0
}

fn provided_key(request: &Request) -> Option<String> {
    let from_headers = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer ").or(Some(s)))
        .or_else(|| {
            request
                .headers()
                .get("x-api-key")
                .and_then(|h| h.to_str().ok())
        });
    if let Some(key) = from_headers {
        return Some(key.to_string());
    }

    // Browser-friendly fallback: the key may ride in the query string.
    let query = request.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == "api_key")
        .map(|(_, value)| value.into_owned())
}

fn is_authorized(security: &SecurityConfig, provided: Option<&str>) -> bool {
    if security.api_key.is_empty() {
        return false;
    }
    provided
        .map(|candidate| constant_time_str_eq(candidate, &security.api_key))
        .unwrap_or(false)
}

pub async fn auth_middleware(
    State(security): State<Arc<RwLock<SecurityConfig>>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let is_health_check = path == "/api/health" || path == "/health" || path == "/healthz";
    if is_health_check {
        tracing::trace!("Heartbeat/Health: {} {}", method, path);
        return Ok(next.run(request).await);
    }
    tracing::info!("Request: {} {}", method, path);

    if method == axum::http::Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let security = security.read().await.clone();
    if security.api_key.is_empty() {
        tracing::error!("[E-AUTH-KEY-EMPTY] ingress api_key is empty; denying request");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let provided = provided_key(&request);
    if is_authorized(&security, provided.as_deref()) {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}
