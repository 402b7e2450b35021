use crate::error::{AppError, AppResult};
use crate::models::queue::{is_valid_account_id, CheckName, CheckStatus, QueueItem, QueueStats};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

const WRITE_ATTEMPTS: u32 = 3;
const WRITE_BACKOFF_STEP_MS: u64 = 500;
const WRITE_BACKOFF_CAP_MS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Added,
    AlreadyQueued,
}

// Durable FIFO of submissions. The whole list lives in memory behind one
// async lock; every mutation rewrites the backing file in full.
pub struct QueueStore {
    path: PathBuf,
    items: Mutex<Vec<QueueItem>>,
}

impl QueueStore {
    pub fn load(path: PathBuf) -> AppResult<Self> {
        let mut items: Vec<QueueItem> = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| AppError::Queue(format!("failed_to_parse_queue_file: {}", e)))?
        } else {
            Vec::new()
        };
        for item in items.iter_mut() {
            item.ensure_all_checks();
        }
        info!("[Queue] Loaded {} item(s) from {:?}", items.len(), path);
        Ok(Self {
            path,
            items: Mutex::new(items),
        })
    }

    async fn persist(&self, items: &[QueueItem]) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(items)
            .map_err(|e| AppError::Queue(format!("failed_to_serialize_queue: {}", e)))?;

        let mut last_err: Option<std::io::Error> = None;
        for attempt in 1..=WRITE_ATTEMPTS {
            match fs::write(&self.path, &content) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "[W-QUEUE-WRITE] queue_write_attempt_{}_failed: {}",
                        attempt, e
                    );
                    last_err = Some(e);
                    if attempt < WRITE_ATTEMPTS {
                        let backoff = (attempt as u64 * WRITE_BACKOFF_STEP_MS)
                            .min(WRITE_BACKOFF_CAP_MS);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }
        Err(AppError::Queue(format!(
            "queue_write_exhausted_retries: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub async fn enqueue(
        &self,
        account_id: &str,
        submitter: &str,
    ) -> AppResult<EnqueueOutcome> {
        if !is_valid_account_id(account_id) {
            return Err(AppError::Validation(format!(
                "account id must be exactly 17 digits: {}",
                account_id
            )));
        }
        if submitter.trim().is_empty() {
            return Err(AppError::Validation("submitter must not be empty".into()));
        }

        let mut items = self.items.lock().await;
        if items.iter().any(|item| item.account_id == account_id) {
            return Ok(EnqueueOutcome::AlreadyQueued);
        }
        items.push(QueueItem::new(account_id, submitter.trim()));
        self.persist(&items).await?;
        info!("[Queue] Enqueued {} (submitter {})", account_id, submitter);
        Ok(EnqueueOutcome::Added)
    }

    pub async fn is_queued(&self, account_id: &str) -> bool {
        self.items
            .lock()
            .await
            .iter()
            .any(|item| item.account_id == account_id)
    }

    pub async fn update_check(
        &self,
        account_id: &str,
        check: CheckName,
        status: CheckStatus,
    ) -> AppResult<()> {
        let mut items = self.items.lock().await;
        let item = items
            .iter_mut()
            .find(|item| item.account_id == account_id)
            .ok_or_else(|| AppError::Queue(format!("not_found: {}", account_id)))?;
        item.checks.insert(check, status);
        self.persist(&items).await
    }

    // Idempotent; reports whether an entry was actually dropped.
    pub async fn remove(&self, account_id: &str) -> AppResult<bool> {
        let mut items = self.items.lock().await;
        let before = items.len();
        items.retain(|item| item.account_id != account_id);
        let removed = items.len() != before;
        if removed {
            self.persist(&items).await?;
            info!("[Queue] Removed {}", account_id);
        }
        Ok(removed)
    }

    // Head-first selection. The head always wins while it can make progress;
    // only a fully cooled pool pushes the scan past it, and then only toward
    // items whose remaining work avoids the pool entirely.
    pub async fn get_next_processable(&self, all_pool_in_cooldown: bool) -> Option<QueueItem> {
        let items = self.items.lock().await;
        let head = items.first()?;

        if !head.has_tocheck() && !head.has_deferred() {
            return Some(head.clone());
        }
        if !all_pool_in_cooldown {
            return Some(head.clone());
        }
        items.iter().find(|item| item.has_direct_tocheck()).cloned()
    }

    // Returns how many checks were re-opened.
    pub async fn reset_deferred_to_tocheck(&self) -> AppResult<usize> {
        let mut items = self.items.lock().await;
        let mut reset = 0;
        for item in items.iter_mut() {
            for status in item.checks.values_mut() {
                if *status == CheckStatus::Deferred {
                    *status = CheckStatus::ToCheck;
                    reset += 1;
                }
            }
        }
        if reset > 0 {
            self.persist(&items).await?;
            info!("[Queue] Reset {} deferred check(s) to open", reset);
        }
        Ok(reset)
    }

    pub async fn has_deferred(&self) -> bool {
        self.items.lock().await.iter().any(|item| item.has_deferred())
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<QueueItem> {
        self.items.lock().await.clone()
    }

    pub async fn stats(&self) -> QueueStats {
        let items = self.items.lock().await;
        let mut stats = QueueStats {
            total: items.len(),
            ..QueueStats::default()
        };
        for item in items.iter() {
            for (name, status) in &item.checks {
                stats.checks.entry(*name).or_default().record(*status);
            }
            *stats.by_submitter.entry(item.submitter.clone()).or_insert(0) += 1;
        }
        stats
    }
}
