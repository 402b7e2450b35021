use crate::vetting::state::CoreServices;
use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use std::sync::Arc;

pub async fn health_check_handler(State(core): State<Arc<CoreServices>>) -> Response {
    let pool = core.pool.status().await;
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": {
            "total": pool.total,
            "available": pool.available,
            "all_in_cooldown": pool.all_in_cooldown,
        },
        "uptime": core.started_at.elapsed().as_secs(),
    }))
    .into_response()
}
