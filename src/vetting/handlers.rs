use crate::error::AppError;
use crate::models::queue::is_valid_account_id;
use crate::vetting::queue_store::EnqueueOutcome;
use crate::vetting::state::CoreServices;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Debug, Deserialize)]
pub struct AddSteamIdRequest {
    #[serde(default)]
    pub steam_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

fn invalid_input(detail: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": "invalid_input", "detail": detail})),
    )
        .into_response()
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": "internal_error"})),
    )
        .into_response()
}

async fn add_steam_id(core: &CoreServices, request: AddSteamIdRequest) -> Response {
    let Some(steam_id) = request.steam_id.as_deref().map(str::trim) else {
        return invalid_input("steam_id is required");
    };
    let Some(username) = request.username.as_deref().map(str::trim) else {
        return invalid_input("username is required");
    };
    if !is_valid_account_id(steam_id) {
        return invalid_input("steam_id must be exactly 17 digits");
    }
    if username.is_empty() {
        return invalid_input("username must not be empty");
    }

    if core.queue.is_queued(steam_id).await {
        return Json(serde_json::json!({"already_in_queue": true})).into_response();
    }

    // The remote probe is best-effort: a linked id is turned away here, but
    // an unreachable directory never blocks intake.
    match core.directory.exists(steam_id).await {
        Ok(true) => {
            return Json(serde_json::json!({"already_exists": true})).into_response();
        }
        Ok(false) => {}
        Err(e) => {
            warn!(
                "[W-EXISTENCE-PROBE] queueing {} without remote confirmation: {}",
                steam_id, e
            );
        }
    }

    match core.queue.enqueue(steam_id, username).await {
        Ok(EnqueueOutcome::Added) => Json(serde_json::json!({"added": true})).into_response(),
        Ok(EnqueueOutcome::AlreadyQueued) => {
            Json(serde_json::json!({"already_in_queue": true})).into_response()
        }
        Err(AppError::Validation(detail)) => invalid_input(&detail),
        Err(e) => {
            error!("[E-ENQUEUE] failed to enqueue {}: {}", steam_id, e);
            internal_error()
        }
    }
}

pub async fn handle_add_steam_id_post(
    State(core): State<Arc<CoreServices>>,
    Json(request): Json<AddSteamIdRequest>,
) -> Response {
    add_steam_id(&core, request).await
}

pub async fn handle_add_steam_id_get(
    State(core): State<Arc<CoreServices>>,
    Query(request): Query<AddSteamIdRequest>,
) -> Response {
    add_steam_id(&core, request).await
}

pub async fn handle_queue_stats(State(core): State<Arc<CoreServices>>) -> Response {
    Json(core.queue.stats().await).into_response()
}

pub async fn handle_proxies_status(State(core): State<Arc<CoreServices>>) -> Response {
    Json(core.pool.status().await).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ProxyRequest {
    pub url: String,
}

pub async fn handle_proxies_add(
    State(core): State<Arc<CoreServices>>,
    Json(request): Json<ProxyRequest>,
) -> Response {
    match core.pool.add_socks5(&request.url).await {
        Ok(()) => Json(serde_json::json!({"added": true})).into_response(),
        Err(AppError::Validation(detail)) => invalid_input(&detail),
        Err(e) => {
            error!("[E-POOL-ADD] failed to add connection: {}", e);
            internal_error()
        }
    }
}

pub async fn handle_proxies_remove(
    State(core): State<Arc<CoreServices>>,
    Json(request): Json<ProxyRequest>,
) -> Response {
    match core.pool.remove_socks5(&request.url).await {
        Ok(removed) => Json(serde_json::json!({"removed": removed})).into_response(),
        Err(e) => {
            error!("[E-POOL-REMOVE] failed to remove connection: {}", e);
            internal_error()
        }
    }
}
