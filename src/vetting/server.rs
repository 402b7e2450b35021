use crate::error::AppResult;
use crate::models::Settings;
use crate::vetting::routes::build_routes;
use crate::vetting::state::AppState;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn serve(
    state: AppState,
    settings: &Settings,
    shutdown: CancellationToken,
) -> AppResult<()> {
    let addr = format!("{}:{}", settings.bind_address(), settings.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on {}", addr);

    let app = build_routes(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("HTTP server stopped");
    Ok(())
}
