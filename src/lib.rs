pub mod constants;
pub mod error;
mod models;
mod modules;
#[cfg(test)]
mod test_utils;
mod utils;
mod vetting;

use models::{config, Settings};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use vetting::rate_gate::RateGate;
use vetting::{
    AppState, ConnectionPool, CoreServices, QueueStore, RemoteDirectory, SecurityConfig,
    SteamClient, Submitter, Worker,
};

async fn start_runtime(settings: Settings, shutdown: CancellationToken) -> Result<(), String> {
    let queue = Arc::new(
        QueueStore::load(settings.data_dir.join(constants::QUEUE_FILE))
            .map_err(|e| format!("failed_to_load_queue: {}", e))?,
    );
    // Deferred state persisted by an earlier run starts fresh.
    queue
        .reset_deferred_to_tocheck()
        .await
        .map_err(|e| format!("failed_to_reset_deferred_state: {}", e))?;
    info!("Startup queue depth: {}", queue.len().await);

    let pool = Arc::new(ConnectionPool::load(
        settings.data_dir.join(constants::POOL_CONFIG_FILE),
    ));
    let gate = Arc::new(RateGate::default());
    let steam = Arc::new(SteamClient::new(
        settings.steam_api_key.clone(),
        pool.clone(),
        gate.clone(),
    ));
    let submitter = Arc::new(Submitter::new(
        settings.submit_url.clone(),
        settings.submit_api_key.clone(),
        gate,
    ));
    let directory = Arc::new(RemoteDirectory::new(settings.existence_check_url.clone()));

    let worker = Arc::new(Worker::new(
        queue.clone(),
        pool.clone(),
        steam,
        submitter,
    ));
    worker.rebuild_deferred().await;
    worker.spawn(shutdown.clone());

    let state = AppState {
        core: Arc::new(CoreServices {
            queue,
            pool,
            directory,
            started_at: std::time::Instant::now(),
        }),
        security: Arc::new(tokio::sync::RwLock::new(SecurityConfig {
            api_key: settings.ingress_api_key.clone(),
        })),
    };

    vetting::server::serve(state, &settings, shutdown)
        .await
        .map_err(|e| format!("http_server_failed: {}", e))
}

pub fn run() {
    let data_dir = config::data_dir_from_env();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        eprintln!("Failed to create data directory {:?}: {}", data_dir, e);
        std::process::exit(1);
    }
    modules::logger::init_logger(&data_dir);

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(errors) => {
            for e in &errors {
                error!("[E-ENV-MISSING] {}", e);
            }
            error!(
                "[E-RUNTIME-STARTUP] refusing_to_start_with_incomplete_environment ({} problem(s))",
                errors.len()
            );
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    runtime.block_on(async {
        let shutdown = CancellationToken::new();

        let runtime_token = shutdown.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = start_runtime(settings, runtime_token).await {
                error!("[E-RUNTIME-STARTUP] {}", e);
                std::process::exit(1);
            }
        });

        info!("steamvet is running. Press Ctrl+C to exit.");
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down: letting the active pass finish");
        shutdown.cancel();
        let _ = server.await;
    });
}
