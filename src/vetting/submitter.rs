use crate::vetting::rate_gate::RateGate;
use reqwest::Client;
use std::sync::Arc;
use tracing::{info, warn};

// The downstream service answers a repeat submission with this body; it is
// treated as a success so replays stay idempotent.
const ALREADY_EXISTS_SENTINEL: &str = "Link already exists";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    AlreadyExists,
    // 5xx, no response, or a failed connection: worth retrying next pass.
    Retryable(String),
    Permanent(String),
}

pub struct Submitter {
    client: Client,
    submit_url: String,
    api_key: String,
    gate: Arc<RateGate>,
}

impl Submitter {
    pub fn new(
        submit_url: impl Into<String>,
        api_key: impl Into<String>,
        gate: Arc<RateGate>,
    ) -> Self {
        Self {
            client: crate::utils::http::get_client(),
            submit_url: submit_url.into(),
            api_key: api_key.into(),
            gate,
        }
    }

    pub async fn submit(&self, account_id: &str, submitter: &str) -> SubmitOutcome {
        self.gate.wait().await;
        let response = self
            .client
            .get(&self.submit_url)
            .query(&[
                ("account_id", account_id),
                ("submitter", submitter),
                ("api_key", self.api_key.as_str()),
            ])
            .send()
            .await;

        match response {
            Err(e) => {
                warn!("[Submit] No response for {}: {}", account_id, e);
                SubmitOutcome::Retryable(e.to_string())
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                if status.is_success() {
                    if body.contains(ALREADY_EXISTS_SENTINEL) {
                        info!("[Submit] {} already linked downstream", account_id);
                        SubmitOutcome::AlreadyExists
                    } else {
                        info!("[Submit] {} accepted downstream", account_id);
                        SubmitOutcome::Accepted
                    }
                } else if status.is_server_error() {
                    warn!("[Submit] {} got {} downstream, will retry", account_id, status);
                    SubmitOutcome::Retryable(format!("downstream returned {}", status))
                } else {
                    SubmitOutcome::Permanent(format!(
                        "downstream returned {}: {}",
                        status,
                        body.chars().take(200).collect::<String>()
                    ))
                }
            }
        }
    }
}

// Read-only probe against the remote account directory, used before enqueue
// so already-linked ids never enter the queue.
pub struct RemoteDirectory {
    client: Client,
    base_url: String,
}

impl RemoteDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: crate::utils::http::get_client(),
            base_url: base_url.into(),
        }
    }

    pub async fn exists(&self, account_id: &str) -> Result<bool, String> {
        let url = format!(
            "{}/{}/",
            self.base_url.trim_end_matches('/'),
            account_id
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("existence check failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("existence check returned {}", resp.status()));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| format!("existence check body unreadable: {}", e))?;
        Ok(body.get("exists").and_then(|v| v.as_bool()).unwrap_or(false))
    }
}
