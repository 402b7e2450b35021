use crate::constants;
use crate::error::{AppError, AppResult};
use crate::models::CheckName;
use crate::vetting::pool::{ConnectionPool, ErrorClass};
use crate::vetting::pool_config::{Connection, ConnectionKind};
use crate::vetting::rate_gate::RateGate;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DIRECT_TIMEOUT_SECS: u64 = 10;
const FRIENDS_TIMEOUT_SECS: u64 = 15;
const INVENTORY_TIMEOUT_SECS: u64 = 25;
const MAX_FRIENDS: usize = 60;
const MAX_STEAM_LEVEL: u64 = 13;
const SIMULATE_ERRORS_ENV: &str = "STEAMVET_SIMULATE_ERRORS";

#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Passed {
        // Set only by steam_level when the profile hides its data; the
        // worker then waves the two pooled checks through.
        private: bool,
        detail: Option<String>,
    },
    Failed {
        detail: String,
    },
    Deferred {
        next_available_in_ms: u64,
    },
}

impl CheckOutcome {
    fn passed() -> Self {
        CheckOutcome::Passed {
            private: false,
            detail: None,
        }
    }

    fn passed_with(detail: impl Into<String>) -> Self {
        CheckOutcome::Passed {
            private: false,
            detail: Some(detail.into()),
        }
    }
}

// Proxied requests surface a dead SOCKS hop as refused/unreachable errors,
// so those land in the socks class rather than the generic connection class.
static SOCKS_ERROR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)socks|ECONNREFUSED|ENOTFOUND|EHOSTUNREACH|connection refused|host unreachable")
        .expect("Invalid socks error regex")
});
static CONNECTION_ERROR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)socket hang up|ECONNRESET|ETIMEDOUT|timeout|timed out|connection reset|SSL|TLS|certificate")
        .expect("Invalid connection error regex")
});

fn error_chain_message(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

pub(crate) fn classify_transport_message(message: &str) -> Option<ErrorClass> {
    if SOCKS_ERROR_PATTERN.is_match(message) {
        Some(ErrorClass::SocksError)
    } else if CONNECTION_ERROR_PATTERN.is_match(message) {
        Some(ErrorClass::ConnectionError)
    } else {
        None
    }
}

fn classify_transport_error(err: &reqwest::Error) -> Option<ErrorClass> {
    if let Some(class) = classify_transport_message(&error_chain_message(err)) {
        return Some(class);
    }
    if err.is_timeout() || err.is_connect() {
        return Some(ErrorClass::ConnectionError);
    }
    None
}

// Failure-injection hook for exercising cooldown paths without a hostile
// upstream. Unset (the production state) disables it entirely; the value is
// read once at client construction.
pub(crate) fn parse_simulated_error_class(raw: &str) -> Option<ErrorClass> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "429" => Some(ErrorClass::Http429),
        "connection" => Some(ErrorClass::ConnectionError),
        "socks" => Some(ErrorClass::SocksError),
        "unknown" => Some(ErrorClass::Unknown),
        _ => None,
    }
}

fn simulated_error_class_from_env() -> Option<ErrorClass> {
    let class = std::env::var(SIMULATE_ERRORS_ENV)
        .ok()
        .and_then(|raw| parse_simulated_error_class(&raw));
    if let Some(class) = class {
        warn!(
            "[W-SIMULATED-ERRORS] {}={} is set; pooled calls will fail on purpose",
            SIMULATE_ERRORS_ENV,
            class.as_str()
        );
    }
    class
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

enum PooledFetch {
    Response(StatusCode, Value),
    Deferred { next_available_in_ms: u64 },
}

pub struct SteamClient {
    api_base: String,
    community_base: String,
    api_key: String,
    pool: Arc<ConnectionPool>,
    gate: Arc<RateGate>,
    client_cache: DashMap<String, Client>,
    simulated_errors: Option<ErrorClass>,
}

impl SteamClient {
    pub fn new(api_key: impl Into<String>, pool: Arc<ConnectionPool>, gate: Arc<RateGate>) -> Self {
        Self::with_base_urls(
            constants::API_BASE_URL,
            constants::COMMUNITY_BASE_URL,
            api_key,
            pool,
            gate,
        )
        .with_simulated_errors(simulated_error_class_from_env())
    }

    pub fn with_base_urls(
        api_base: impl Into<String>,
        community_base: impl Into<String>,
        api_key: impl Into<String>,
        pool: Arc<ConnectionPool>,
        gate: Arc<RateGate>,
    ) -> Self {
        Self {
            api_base: api_base.into(),
            community_base: community_base.into(),
            api_key: api_key.into(),
            pool,
            gate,
            client_cache: DashMap::new(),
            simulated_errors: None,
        }
    }

    pub fn with_simulated_errors(mut self, class: Option<ErrorClass>) -> Self {
        self.simulated_errors = class;
        self
    }

    pub async fn run_check(&self, account_id: &str, check: CheckName) -> AppResult<CheckOutcome> {
        match check {
            CheckName::AnimatedAvatar => {
                self.asset_check(account_id, "GetAnimatedAvatar", "avatar").await
            }
            CheckName::AvatarFrame => {
                self.asset_check(account_id, "GetAvatarFrame", "avatar_frame").await
            }
            CheckName::MiniProfileBackground => {
                self.asset_check(account_id, "GetMiniProfileBackground", "profile_background")
                    .await
            }
            CheckName::ProfileBackground => {
                self.asset_check(account_id, "GetProfileBackground", "profile_background")
                    .await
            }
            CheckName::SteamLevel => self.steam_level(account_id).await,
            CheckName::Friends => self.friends(account_id).await,
            CheckName::CsgoInventory => self.csgo_inventory(account_id).await,
        }
    }

    fn client_for(
        &self,
        conn: &Connection,
        timeout_secs: u64,
        follow_redirects: bool,
    ) -> AppResult<Client> {
        let key = format!("{}|{}|{}", conn.label(), timeout_secs, follow_redirects);
        if let Some(client) = self.client_cache.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(constants::USER_AGENT);
        if !follow_redirects {
            builder = builder.redirect(reqwest::redirect::Policy::none());
        }
        if conn.kind == ConnectionKind::Socks5 {
            let url = conn
                .url
                .as_deref()
                .ok_or_else(|| AppError::Pool("socks5 connection without url".into()))?;
            let proxy = reqwest::Proxy::all(url)
                .map_err(|e| AppError::Pool(format!("invalid proxy url {}: {}", url, e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build()?;
        self.client_cache.insert(key, client.clone());
        Ok(client)
    }

    async fn direct_get(&self, url: &str) -> AppResult<Value> {
        self.gate.wait().await;
        let client = self.client_for(&Connection::direct(), DIRECT_TIMEOUT_SECS, true)?;
        let resp = client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::Upstream(format!(
                "unexpected status {} from {}",
                status, url
            )));
        }
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| AppError::Upstream(format!("unparseable body from {}: {}", url, e)))
    }

    // The five profile-asset probes share one shape: the account passes when
    // the queried asset is absent.
    async fn asset_check(
        &self,
        account_id: &str,
        method: &str,
        field: &str,
    ) -> AppResult<CheckOutcome> {
        let url = format!(
            "{}/IPlayerService/{}/v1/?steamid={}",
            self.api_base, method, account_id
        );
        let body = self.direct_get(&url).await?;
        let node = body.get("response").unwrap_or(&body);
        let empty = node.get(field).map(is_empty_value).unwrap_or(true);
        if empty {
            Ok(CheckOutcome::passed())
        } else {
            Ok(CheckOutcome::Failed {
                detail: format!("{} is set", field),
            })
        }
    }

    async fn steam_level(&self, account_id: &str) -> AppResult<CheckOutcome> {
        let url = format!(
            "{}/IPlayerService/GetSteamLevel/v1/?key={}&steamid={}",
            self.api_base, self.api_key, account_id
        );
        let body = self.direct_get(&url).await?;
        let node = body.get("response").unwrap_or(&body);
        match node.get("player_level").and_then(|v| v.as_u64()) {
            // A hidden profile answers with an empty response object.
            None => Ok(CheckOutcome::Passed {
                private: true,
                detail: Some("private".into()),
            }),
            Some(level) if level <= MAX_STEAM_LEVEL => {
                Ok(CheckOutcome::passed_with(format!("level {}", level)))
            }
            Some(level) => Ok(CheckOutcome::Failed {
                detail: format!("level {} exceeds {}", level, MAX_STEAM_LEVEL),
            }),
        }
    }

    async fn friends(&self, account_id: &str) -> AppResult<CheckOutcome> {
        let url = format!(
            "{}/ISteamUser/GetFriendList/v0001/?key={}&steamid={}&relationship=friend",
            self.api_base, self.api_key, account_id
        );
        match self.pooled_get(CheckName::Friends, &url).await? {
            PooledFetch::Deferred {
                next_available_in_ms,
            } => Ok(CheckOutcome::Deferred {
                next_available_in_ms,
            }),
            PooledFetch::Response(status, body) => {
                if status == StatusCode::UNAUTHORIZED {
                    return Ok(CheckOutcome::passed_with("private"));
                }
                if !status.is_success() {
                    return Err(AppError::Upstream(format!(
                        "friends endpoint returned {}",
                        status
                    )));
                }
                let count = body
                    .get("friendslist")
                    .and_then(|f| f.get("friends"))
                    .and_then(|f| f.as_array())
                    .map(|a| a.len())
                    .unwrap_or(0);
                if count <= MAX_FRIENDS {
                    Ok(CheckOutcome::passed_with(format!("{} friends", count)))
                } else {
                    Ok(CheckOutcome::Failed {
                        detail: format!("{} friends exceeds {}", count, MAX_FRIENDS),
                    })
                }
            }
        }
    }

    async fn csgo_inventory(&self, account_id: &str) -> AppResult<CheckOutcome> {
        let url = format!("{}/inventory/{}/730/2", self.community_base, account_id);
        match self.pooled_get(CheckName::CsgoInventory, &url).await? {
            PooledFetch::Deferred {
                next_available_in_ms,
            } => Ok(CheckOutcome::Deferred {
                next_available_in_ms,
            }),
            PooledFetch::Response(status, body) => {
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    return Ok(CheckOutcome::passed_with("private"));
                }
                if !status.is_success() && !status.is_redirection() {
                    return Err(AppError::Upstream(format!(
                        "inventory endpoint returned {}",
                        status
                    )));
                }
                let has_assets = body
                    .get("assets")
                    .map(|a| !is_empty_value(a))
                    .unwrap_or(false);
                if has_assets {
                    Ok(CheckOutcome::Failed {
                        detail: "inventory contains items".into(),
                    })
                } else {
                    Ok(CheckOutcome::passed())
                }
            }
        }
    }

    // Routes one GET through the pool. A cooldown-classified failure cools
    // the current connection and retries through whatever rotation yields
    // next; the loop is bounded by the pool size because every iteration
    // either returns or cools one more connection.
    async fn pooled_get(&self, check: CheckName, url: &str) -> AppResult<PooledFetch> {
        let timeout_secs = match check {
            CheckName::Friends => FRIENDS_TIMEOUT_SECS,
            CheckName::CsgoInventory => INVENTORY_TIMEOUT_SECS,
            _ => DIRECT_TIMEOUT_SECS,
        };
        let follow_redirects = check != CheckName::CsgoInventory;

        let mut rotation = self.pool.current().await;
        let attempts_cap = self.pool.connection_count().await + 1;
        for _ in 0..attempts_cap {
            if rotation.all_in_cooldown {
                return Ok(PooledFetch::Deferred {
                    next_available_in_ms: rotation.next_available_in_ms(),
                });
            }

            if let Some(class) = self.simulated_errors {
                warn!(
                    "[Steam] Simulated {} error on {} via {}",
                    class.as_str(),
                    check,
                    rotation.connection.label()
                );
                rotation = self
                    .pool
                    .mark_current_cooldown(class, Some(check), "simulated error")
                    .await;
                continue;
            }

            self.gate.wait().await;
            let client = self.client_for(&rotation.connection, timeout_secs, follow_redirects)?;
            let mut request = client.get(url);
            if check == CheckName::CsgoInventory {
                request = request
                    .header("Accept", "*/*")
                    .header("Referer", format!("{}/", self.community_base))
                    .header("Sec-Fetch-Dest", "empty")
                    .header("Sec-Fetch-Mode", "cors")
                    .header("Sec-Fetch-Site", "same-origin")
                    .header("X-Requested-With", "XMLHttpRequest");
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        warn!(
                            "[Steam] {} returned 429 via {}",
                            check,
                            rotation.connection.label()
                        );
                        rotation = self
                            .pool
                            .mark_current_cooldown(ErrorClass::Http429, Some(check), "HTTP 429")
                            .await;
                        continue;
                    }
                    let text = resp.text().await.unwrap_or_default();
                    let body = if text.trim().is_empty() {
                        Value::Null
                    } else {
                        serde_json::from_str(&text).unwrap_or(Value::Null)
                    };
                    return Ok(PooledFetch::Response(status, body));
                }
                Err(e) => {
                    let message = error_chain_message(&e);
                    match classify_transport_error(&e) {
                        Some(class) => {
                            warn!(
                                "[Steam] {} transport failure via {} (class={}): {}",
                                check,
                                rotation.connection.label(),
                                class.as_str(),
                                message
                            );
                            rotation = self
                                .pool
                                .mark_current_cooldown(class, Some(check), &message)
                                .await;
                            continue;
                        }
                        None => return Err(AppError::Network(e)),
                    }
                }
            }
        }
        Err(AppError::Pool("connection rotation did not settle".into()))
    }

    // Periodic reachability probe through whatever connection is in use.
    // The probed endpoint rejects keyless calls with 401, which still proves
    // the egress path works.
    pub async fn smoke_test(&self) {
        let rotation = self.pool.current().await;
        if rotation.all_in_cooldown {
            info!("[Steam] Smoke test skipped: every connection is cooling");
            return;
        }
        let url = format!("{}/ISteamWebAPIUtil/GetServerInfo/v1/", self.api_base);
        self.gate.wait().await;
        let client = match self.client_for(&rotation.connection, DIRECT_TIMEOUT_SECS, true) {
            Ok(client) => client,
            Err(e) => {
                warn!("[Steam] Smoke test client build failed: {}", e);
                return;
            }
        };
        let start = std::time::Instant::now();
        match client.get(&url).send().await {
            Ok(resp) => {
                let latency = start.elapsed().as_millis() as u64;
                let status = resp.status();
                if status.is_success() || status == StatusCode::UNAUTHORIZED {
                    info!(
                        "[Steam] Smoke test via {}: ✓ OK ({}ms)",
                        rotation.connection.label(),
                        latency
                    );
                } else {
                    warn!(
                        "[Steam] Smoke test via {}: ✗ FAILED with status {}",
                        rotation.connection.label(),
                        status
                    );
                }
            }
            Err(e) => {
                warn!(
                    "[Steam] Smoke test via {}: ✗ FAILED: {}",
                    rotation.connection.label(),
                    error_chain_message(&e)
                );
            }
        }
    }
}
