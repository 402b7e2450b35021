use crate::error::{AppError, AppResult};
use crate::models::CheckName;
use crate::vetting::pool_config::{
    is_valid_socks5_url, load_pool_file, save_pool_file, Connection, ConnectionKind, PoolFile,
};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const COOLDOWN_429_FRIENDS_MS: u64 = 5 * 60 * 1000;
const COOLDOWN_CONNECTION_MS: u64 = 10 * 60 * 1000;
const COOLDOWN_SOCKS_MS: u64 = 15 * 60 * 1000;
const LAST_ERROR_MAX_LEN: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Http429,
    ConnectionError,
    SocksError,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Http429 => "429",
            ErrorClass::ConnectionError => "connection_error",
            ErrorClass::SocksError => "socks_error",
            ErrorClass::Unknown => "unknown",
        }
    }
}

// What a pool read hands back: the connection to use now, or, when every
// entry is cooling, the one that frees first.
#[derive(Debug, Clone)]
pub struct RotationOutcome {
    pub connection: Connection,
    pub index: usize,
    pub all_in_cooldown: bool,
    pub earliest_available_at: Option<i64>,
}

impl RotationOutcome {
    pub fn next_available_in_ms(&self) -> u64 {
        match self.earliest_available_at {
            Some(at) => (at - now_ms()).max(0) as u64,
            None => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub kind: ConnectionKind,
    pub url: Option<String>,
    pub in_cooldown: bool,
    pub cooldown_until: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub all_in_cooldown: bool,
    pub current_index: usize,
    pub current: ConnectionSnapshot,
    pub next_available_in_ms: Option<i64>,
    pub connections: Vec<ConnectionSnapshot>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn snapshot(conn: &Connection) -> ConnectionSnapshot {
    ConnectionSnapshot {
        kind: conn.kind,
        url: conn.url.clone(),
        in_cooldown: conn.in_cooldown,
        cooldown_until: conn.cooldown_until,
        last_error: conn.last_error.clone(),
    }
}

fn truncate_reason(reason: &str, max_len: usize) -> String {
    if reason.len() <= max_len {
        reason.to_string()
    } else {
        let mut cut = max_len - 3;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &reason[..cut])
    }
}

pub struct ConnectionPool {
    path: PathBuf,
    state: RwLock<PoolFile>,
}

impl ConnectionPool {
    pub fn load(path: PathBuf) -> Self {
        let state = load_pool_file(&path);
        info!(
            "[Pool] Loaded {} connection(s), current index {}",
            state.connections.len(),
            state.current_index
        );
        Self {
            path,
            state: RwLock::new(state),
        }
    }

    #[cfg(test)]
    pub fn new_for_test(path: PathBuf, state: PoolFile) -> Self {
        Self {
            path,
            state: RwLock::new(state),
        }
    }

    fn persist(&self, state: &PoolFile) {
        if let Err(e) = save_pool_file(&self.path, state) {
            warn!("[W-POOL-PERSIST] best_effort_cooldown_persist_failed: {}", e);
        }
    }

    // Clears cooldowns whose deadline has passed. Runs on every pool read.
    fn sweep(state: &mut PoolFile) -> bool {
        let now = now_ms();
        let mut changed = false;
        for conn in state.connections.iter_mut() {
            let expired = conn.in_cooldown
                && conn.cooldown_until.map(|until| until <= now).unwrap_or(true);
            if expired {
                info!("[Pool] Cooldown expired for {}", conn.label());
                conn.in_cooldown = false;
                conn.cooldown_until = None;
                changed = true;
            }
        }
        changed
    }

    fn rotate_locked(state: &mut PoolFile) -> RotationOutcome {
        let len = state.connections.len();
        for step in 1..=len {
            let idx = (state.current_index + step) % len;
            if !state.connections[idx].in_cooldown {
                state.current_index = idx;
                return RotationOutcome {
                    connection: state.connections[idx].clone(),
                    index: idx,
                    all_in_cooldown: false,
                    earliest_available_at: None,
                };
            }
        }

        // Everything is cooling; park on the entry that frees first.
        let (idx, earliest) = state
            .connections
            .iter()
            .enumerate()
            .min_by_key(|(_, conn)| conn.cooldown_until.unwrap_or(i64::MAX))
            .map(|(idx, conn)| (idx, conn.cooldown_until))
            .unwrap_or((0, None));
        state.current_index = idx;
        RotationOutcome {
            connection: state.connections[idx].clone(),
            index: idx,
            all_in_cooldown: true,
            earliest_available_at: earliest,
        }
    }

    pub async fn current(&self) -> RotationOutcome {
        let mut state = self.state.write().await;
        let swept = Self::sweep(&mut state);
        let outcome = if state.connections[state.current_index].in_cooldown {
            Self::rotate_locked(&mut state)
        } else {
            RotationOutcome {
                connection: state.connections[state.current_index].clone(),
                index: state.current_index,
                all_in_cooldown: false,
                earliest_available_at: None,
            }
        };
        if swept {
            self.persist(&state);
        }
        debug!(
            "[Pool] Using {} (index {})",
            outcome.connection.label(),
            outcome.index
        );
        outcome
    }

    pub async fn rotate_to_next_available(&self) -> RotationOutcome {
        let mut state = self.state.write().await;
        Self::sweep(&mut state);
        let outcome = Self::rotate_locked(&mut state);
        self.persist(&state);
        outcome
    }

    fn duration_ms(state: &PoolFile, class: ErrorClass, endpoint: Option<CheckName>) -> u64 {
        match class {
            ErrorClass::Http429 => match endpoint {
                Some(CheckName::Friends) => COOLDOWN_429_FRIENDS_MS,
                _ => state.cooldown_duration_ms,
            },
            ErrorClass::ConnectionError | ErrorClass::Unknown => COOLDOWN_CONNECTION_MS,
            ErrorClass::SocksError => COOLDOWN_SOCKS_MS,
        }
    }

    // Stamps the connection in use and hands back whatever rotation finds.
    pub async fn mark_current_cooldown(
        &self,
        class: ErrorClass,
        endpoint: Option<CheckName>,
        error_msg: &str,
    ) -> RotationOutcome {
        let mut state = self.state.write().await;
        Self::sweep(&mut state);
        let duration = Self::duration_ms(&state, class, endpoint);
        let until = now_ms() + duration as i64;
        let idx = state.current_index;
        {
            let conn = &mut state.connections[idx];
            conn.in_cooldown = true;
            conn.cooldown_until = Some(until);
            conn.last_error = Some(truncate_reason(error_msg, LAST_ERROR_MAX_LEN));
            warn!(
                "[Pool] {} cooled for {}ms (class={}, endpoint={})",
                conn.label(),
                duration,
                class.as_str(),
                endpoint.map(|c| c.as_str()).unwrap_or("-"),
            );
        }
        let outcome = Self::rotate_locked(&mut state);
        self.persist(&state);
        outcome
    }

    pub async fn add_socks5(&self, url: &str) -> AppResult<()> {
        let trimmed = url.trim();
        if !is_valid_socks5_url(trimmed) {
            return Err(AppError::Validation(format!(
                "not a socks5 url: {}",
                trimmed
            )));
        }
        let mut state = self.state.write().await;
        if state
            .connections
            .iter()
            .any(|c| c.url.as_deref() == Some(trimmed))
        {
            return Err(AppError::Validation(format!(
                "connection already present: {}",
                trimmed
            )));
        }
        state.connections.push(Connection::socks5(trimmed));
        self.persist(&state);
        info!("[Pool] Added socks5 connection {}", trimmed);
        Ok(())
    }

    pub async fn remove_socks5(&self, url: &str) -> AppResult<bool> {
        let trimmed = url.trim();
        let mut state = self.state.write().await;
        let before = state.connections.len();
        state
            .connections
            .retain(|c| c.kind != ConnectionKind::Socks5 || c.url.as_deref() != Some(trimmed));
        let removed = state.connections.len() != before;
        if removed {
            if state.current_index >= state.connections.len() {
                state.current_index = 0;
            }
            self.persist(&state);
            info!("[Pool] Removed socks5 connection {}", trimmed);
        }
        Ok(removed)
    }

    pub async fn all_in_cooldown(&self) -> bool {
        let mut state = self.state.write().await;
        let swept = Self::sweep(&mut state);
        if swept {
            self.persist(&state);
        }
        state.connections.iter().all(|c| c.in_cooldown)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    // Copy-on-read snapshot for the HTTP surface; never hands out live state.
    pub async fn status(&self) -> PoolStatus {
        let mut state = self.state.write().await;
        let swept = Self::sweep(&mut state);
        if swept {
            self.persist(&state);
        }

        let available = state.connections.iter().filter(|c| !c.in_cooldown).count();
        let now = now_ms();
        let next_available_in_ms = state
            .connections
            .iter()
            .filter_map(|c| c.cooldown_until)
            .min()
            .map(|until| (until - now).max(0));

        PoolStatus {
            total: state.connections.len(),
            available,
            all_in_cooldown: available == 0,
            current_index: state.current_index,
            current: snapshot(&state.connections[state.current_index]),
            next_available_in_ms,
            connections: state.connections.iter().map(snapshot).collect(),
        }
    }
}
