use crate::vetting::pool::ConnectionPool;
use crate::vetting::queue_store::QueueStore;
use crate::vetting::submitter::RemoteDirectory;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct CoreServices {
    pub queue: Arc<QueueStore>,
    pub pool: Arc<ConnectionPool>,
    pub directory: Arc<RemoteDirectory>,
    pub started_at: Instant,
}

#[derive(Clone)]
pub struct SecurityConfig {
    pub api_key: String,
}

// Axum application state
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<CoreServices>,
    pub security: Arc<RwLock<SecurityConfig>>,
}

// Let the auth middleware extract just the security sub-state.
impl axum::extract::FromRef<AppState> for Arc<RwLock<SecurityConfig>> {
    fn from_ref(state: &AppState) -> Self {
        state.security.clone()
    }
}

impl axum::extract::FromRef<AppState> for Arc<CoreServices> {
    fn from_ref(state: &AppState) -> Self {
        state.core.clone()
    }
}
