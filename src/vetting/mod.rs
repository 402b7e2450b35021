pub mod handlers;
pub mod health;
pub mod middleware;
pub mod pool;
pub mod pool_config;
pub mod queue_store;
pub mod rate_gate;
pub mod routes;
pub mod server;
pub mod state;
pub mod steam;
pub mod submitter;
pub mod worker;

pub use pool::ConnectionPool;
pub use queue_store::QueueStore;
pub use state::{AppState, CoreServices, SecurityConfig};
pub use steam::SteamClient;
pub use submitter::{RemoteDirectory, Submitter};
pub use worker::Worker;
