use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::vetting::handlers;
use crate::vetting::health;
use crate::vetting::middleware::auth_middleware;
use crate::vetting::state::AppState;

pub fn build_routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/add-steam-id",
            post(handlers::handle_add_steam_id_post).get(handlers::handle_add_steam_id_get),
        )
        .route("/api/health", get(health::health_check_handler))
        .route("/api/queue/stats", get(handlers::handle_queue_stats))
        .route("/api/proxies/status", get(handlers::handle_proxies_status))
        .route("/api/proxies/add", post(handlers::handle_proxies_add))
        .route("/api/proxies/remove", post(handlers::handle_proxies_remove))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
