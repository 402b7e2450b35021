use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

// Shared client for direct (non-pooled) calls: existence probes and the
// downstream write. Pooled traffic builds its own per-connection clients.
pub static SHARED_CLIENT: Lazy<Client> = Lazy::new(|| create_base_client(10));

fn create_base_client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(crate::constants::USER_AGENT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

pub fn get_client() -> Client {
    SHARED_CLIENT.clone()
}
