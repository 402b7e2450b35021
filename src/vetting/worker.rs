use crate::error::AppResult;
use crate::models::queue::{CheckName, CheckStatus, QueueItem};
use crate::vetting::pool::ConnectionPool;
use crate::vetting::queue_store::QueueStore;
use crate::vetting::steam::{CheckOutcome, SteamClient};
use crate::vetting::submitter::{SubmitOutcome, Submitter};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ITEM_DELAY: Duration = Duration::from_millis(350);
const IDLE_DELAY: Duration = Duration::from_millis(5000);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SMOKE_TEST_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassResult {
    // Nothing actionable in the queue.
    Idle,
    // Touched an item; come back soon.
    Worked,
    // Another pass already held the guard.
    Busy,
}

// Drives the per-item state machine. The worker is the only writer of check
// statuses after enqueue; ingress only appends.
pub struct Worker {
    queue: Arc<QueueStore>,
    pool: Arc<ConnectionPool>,
    steam: Arc<SteamClient>,
    submitter: Arc<Submitter>,
    // account_id -> checks parked on pool availability. Rebuilt from the
    // queue file at startup; the file stays authoritative.
    deferred: DashMap<String, HashSet<CheckName>>,
    pass_active: AtomicBool,
}

impl Worker {
    pub fn new(
        queue: Arc<QueueStore>,
        pool: Arc<ConnectionPool>,
        steam: Arc<SteamClient>,
        submitter: Arc<Submitter>,
    ) -> Self {
        Self {
            queue,
            pool,
            steam,
            submitter,
            deferred: DashMap::new(),
            pass_active: AtomicBool::new(false),
        }
    }

    pub async fn rebuild_deferred(&self) {
        self.deferred.clear();
        for item in self.queue.snapshot().await {
            let parked: HashSet<CheckName> = item
                .checks
                .iter()
                .filter(|(name, status)| {
                    name.is_rate_limited() && **status == CheckStatus::Deferred
                })
                .map(|(name, _)| *name)
                .collect();
            if !parked.is_empty() {
                self.deferred.insert(item.account_id.clone(), parked);
            }
        }
        if !self.deferred.is_empty() {
            info!(
                "[Worker] Restored {} item(s) with parked checks",
                self.deferred.len()
            );
        }
    }

    // One scheduling tick. The guard keeps passes strictly serialized even
    // if a timer and a manual trigger fire together.
    pub async fn process_queue(&self) -> PassResult {
        if self.pass_active.swap(true, Ordering::SeqCst) {
            return PassResult::Busy;
        }
        let result = self.run_pass().await;
        self.pass_active.store(false, Ordering::SeqCst);
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("[Worker] Pass aborted, retrying next tick: {}", e);
                PassResult::Worked
            }
        }
    }

    async fn run_pass(&self) -> AppResult<PassResult> {
        let all_pool_in_cooldown = self.pool.all_in_cooldown().await;
        if !all_pool_in_cooldown {
            self.drain_deferred().await?;
        }

        let Some(item) = self.queue.get_next_processable(all_pool_in_cooldown).await else {
            return Ok(PassResult::Idle);
        };

        let to_run = item.pending_checks();
        if to_run.is_empty() {
            if item.is_settled() {
                self.finalize(&item).await?;
                return Ok(PassResult::Worked);
            }
            // Still parked on deferred checks; nothing runnable this tick.
            return Ok(PassResult::Idle);
        }

        self.run_checks(&item, &to_run, all_pool_in_cooldown).await?;
        Ok(PassResult::Worked)
    }

    async fn drain_deferred(&self) -> AppResult<()> {
        if self.deferred.is_empty() && !self.queue.has_deferred().await {
            return Ok(());
        }
        let reset = self.queue.reset_deferred_to_tocheck().await?;
        self.deferred.clear();
        if reset > 0 {
            info!("[Worker] Reclaimed {} deferred check(s)", reset);
        }
        Ok(())
    }

    async fn run_checks(
        &self,
        item: &QueueItem,
        to_run: &[CheckName],
        all_pool_in_cooldown: bool,
    ) -> AppResult<()> {
        let id = &item.account_id;
        let mut private = false;

        for &check in to_run {
            if private && check.is_rate_limited() {
                info!("[Worker] {}: {} waved through (private profile)", id, check);
                self.queue
                    .update_check(id, check, CheckStatus::Passed)
                    .await?;
                continue;
            }
            if check.is_rate_limited() && all_pool_in_cooldown {
                self.queue
                    .update_check(id, check, CheckStatus::Deferred)
                    .await?;
                self.note_deferred(id, check);
                continue;
            }

            match self.steam.run_check(id, check).await {
                Err(e) => {
                    warn!(
                        "[Worker] {}: {} hit a transient error, retrying next pass: {}",
                        id, check, e
                    );
                    return Ok(());
                }
                Ok(CheckOutcome::Failed { detail }) => {
                    info!("[Worker] {}: {} failed ({}), discarding", id, check, detail);
                    self.queue
                        .update_check(id, check, CheckStatus::Failed)
                        .await?;
                    self.queue.remove(id).await?;
                    self.deferred.remove(id);
                    return Ok(());
                }
                Ok(CheckOutcome::Passed {
                    private: is_private,
                    detail,
                }) => {
                    debug!("[Worker] {}: {} passed {:?}", id, check, detail);
                    self.queue
                        .update_check(id, check, CheckStatus::Passed)
                        .await?;
                    if check == CheckName::SteamLevel && is_private {
                        private = true;
                    }
                }
                Ok(CheckOutcome::Deferred {
                    next_available_in_ms,
                }) => {
                    info!(
                        "[Worker] {}: {} parked, pool frees in {}ms",
                        id, check, next_available_in_ms
                    );
                    self.queue
                        .update_check(id, check, CheckStatus::Deferred)
                        .await?;
                    self.note_deferred(id, check);
                }
            }
        }
        Ok(())
    }

    fn note_deferred(&self, account_id: &str, check: CheckName) {
        self.deferred
            .entry(account_id.to_string())
            .or_default()
            .insert(check);
    }

    async fn finalize(&self, item: &QueueItem) -> AppResult<()> {
        let id = &item.account_id;
        if item.all_passed() {
            match self.submitter.submit(id, &item.submitter).await {
                SubmitOutcome::Accepted | SubmitOutcome::AlreadyExists => {
                    self.queue.remove(id).await?;
                    // remove() is idempotent; the repeat call is a no-op.
                    let _ = self.queue.remove(id).await;
                }
                SubmitOutcome::Retryable(reason) => {
                    warn!(
                        "[Worker] {}: downstream unavailable, keeping item: {}",
                        id, reason
                    );
                    return Ok(());
                }
                SubmitOutcome::Permanent(reason) => {
                    error!(
                        "[E-SUBMIT-REJECTED] {} permanently rejected downstream: {}",
                        id, reason
                    );
                    self.queue.remove(id).await?;
                }
            }
        } else {
            // Normally a failed check removes the item on the spot; this
            // covers items restored from disk already carrying a failure.
            self.queue.remove(id).await?;
        }
        self.deferred.remove(id);
        Ok(())
    }

    // Periodic reclaim: when capacity returns and something is parked,
    // re-open the parked checks so the main loop picks them up.
    pub async fn reclaim_deferred(&self) {
        let status = self.pool.status().await;
        debug!(
            "[Worker] Pool sweep: {}/{} connection(s) available",
            status.available, status.total
        );
        if status.available == 0 || !self.queue.has_deferred().await {
            return;
        }
        match self.queue.reset_deferred_to_tocheck().await {
            Ok(reset) => {
                self.deferred.clear();
                if reset > 0 {
                    info!("[Worker] Sweep re-opened {} parked check(s)", reset);
                }
            }
            Err(e) => warn!("[W-SWEEP] deferred_reset_failed: {}", e),
        }
    }

    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) {
        let worker = self.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            info!("[Worker] Processing loop started");
            loop {
                if token.is_cancelled() {
                    break;
                }
                let outcome = worker.process_queue().await;
                let delay = match outcome {
                    PassResult::Idle => IDLE_DELAY,
                    PassResult::Worked | PassResult::Busy => {
                        if worker.queue.is_empty().await {
                            IDLE_DELAY
                        } else {
                            ITEM_DELAY
                        }
                    }
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
            info!("[Worker] Processing loop stopped");
        });

        let worker = self.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                worker.reclaim_deferred().await;
            }
        });

        let worker = self.clone();
        let token = shutdown;
        tokio::spawn(async move {
            let mut ticker = interval(SMOKE_TEST_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                worker.steam.smoke_test().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::unique_temp_dir;
    use crate::vetting::pool_config::PoolFile;
    use crate::vetting::rate_gate::RateGate;
    use axum::extract::State;
    use axum::{routing::get, Json, Router};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    const ID: &str = "76561197960434622";

    #[derive(Clone, Default)]
    struct SteamMockState {
        // Request paths in arrival order.
        hits: Arc<Mutex<Vec<String>>>,
        // When set, steam_level answers with an empty response object.
        private_level: Arc<AtomicBool>,
        // Level returned when the profile is not private.
        level: Arc<AtomicUsize>,
        // When set, animated_avatar reports an equipped avatar.
        avatar_set: Arc<AtomicBool>,
        // Remaining 429 answers for the friends endpoint.
        friends_429_budget: Arc<AtomicUsize>,
    }

    impl SteamMockState {
        fn record(&self, path: &str) {
            self.hits.lock().unwrap().push(path.to_string());
        }

        fn count(&self, needle: &str) -> usize {
            self.hits
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.contains(needle))
                .count()
        }
    }

    fn steam_mock_router(state: SteamMockState) -> Router {
        async fn empty_response(
            State(state): State<SteamMockState>,
            uri: axum::http::Uri,
        ) -> Json<serde_json::Value> {
            state.record(uri.path());
            Json(serde_json::json!({"response": {}}))
        }

        Router::new()
            .route(
                "/IPlayerService/GetAnimatedAvatar/v1/",
                get(
                    |State(state): State<SteamMockState>, uri: axum::http::Uri| async move {
                        state.record(uri.path());
                        if state.avatar_set.load(Ordering::SeqCst) {
                            Json(serde_json::json!({
                                "response": {"avatar": {"image_small": "a.png"}}
                            }))
                        } else {
                            Json(serde_json::json!({"response": {}}))
                        }
                    },
                ),
            )
            .route("/IPlayerService/GetAvatarFrame/v1/", get(empty_response))
            .route(
                "/IPlayerService/GetMiniProfileBackground/v1/",
                get(empty_response),
            )
            .route(
                "/IPlayerService/GetProfileBackground/v1/",
                get(empty_response),
            )
            .route(
                "/IPlayerService/GetSteamLevel/v1/",
                get(
                    |State(state): State<SteamMockState>, uri: axum::http::Uri| async move {
                        state.record(uri.path());
                        if state.private_level.load(Ordering::SeqCst) {
                            Json(serde_json::json!({"response": {}}))
                        } else {
                            let level = state.level.load(Ordering::SeqCst);
                            Json(serde_json::json!({"response": {"player_level": level}}))
                        }
                    },
                ),
            )
            .route(
                "/ISteamUser/GetFriendList/v0001/",
                get(
                    |State(state): State<SteamMockState>, uri: axum::http::Uri| async move {
                        state.record(uri.path());
                        let budget = &state.friends_429_budget;
                        if budget
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                                n.checked_sub(1)
                            })
                            .is_ok()
                        {
                            return (
                                axum::http::StatusCode::TOO_MANY_REQUESTS,
                                Json(serde_json::json!({})),
                            );
                        }
                        (
                            axum::http::StatusCode::OK,
                            Json(serde_json::json!({"friendslist": {"friends": []}})),
                        )
                    },
                ),
            )
            .route(
                &format!("/inventory/{}/730/2", ID),
                get(
                    |State(state): State<SteamMockState>, uri: axum::http::Uri| async move {
                        state.record(uri.path());
                        Json(serde_json::json!({}))
                    },
                ),
            )
            .with_state(state)
    }

    #[derive(Clone, Default)]
    struct SubmitMockState {
        hits: Arc<AtomicUsize>,
        // Remaining 503 answers before the endpoint starts accepting.
        failures_budget: Arc<AtomicUsize>,
    }

    fn submit_mock_router(state: SubmitMockState) -> Router {
        Router::new()
            .route(
                "/submit",
                get(|State(state): State<SubmitMockState>| async move {
                    state.hits.fetch_add(1, Ordering::SeqCst);
                    if state
                        .failures_budget
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                    {
                        return (axum::http::StatusCode::SERVICE_UNAVAILABLE, "down");
                    }
                    (axum::http::StatusCode::OK, "linked")
                }),
            )
            .with_state(state)
    }

    async fn serve(app: Router) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock");
        });
        (format!("http://{}", addr), handle)
    }

    struct Harness {
        queue: Arc<QueueStore>,
        pool: Arc<ConnectionPool>,
        worker: Arc<Worker>,
        steam_state: SteamMockState,
        submit_state: SubmitMockState,
        steam_base: String,
        submit_base: String,
        dir: PathBuf,
        servers: Vec<tokio::task::JoinHandle<()>>,
    }

    impl Harness {
        async fn new(label: &str, steam_state: SteamMockState, submit_state: SubmitMockState) -> Self {
            let dir = unique_temp_dir(label);
            let (steam_base, steam_server) = serve(steam_mock_router(steam_state.clone())).await;
            let (submit_base, submit_server) =
                serve(submit_mock_router(submit_state.clone())).await;

            let queue = Arc::new(QueueStore::load(dir.join("profiles_queue.json")).unwrap());
            let pool = Arc::new(ConnectionPool::new_for_test(
                dir.join("config_proxies.json"),
                PoolFile::default(),
            ));
            let gate = Arc::new(RateGate::new(Duration::from_millis(1)));
            let steam = Arc::new(SteamClient::with_base_urls(
                &steam_base,
                &steam_base,
                "test-key",
                pool.clone(),
                gate.clone(),
            ));
            let submitter = Arc::new(Submitter::new(
                format!("{}/submit", submit_base),
                "sk-submit",
                gate,
            ));
            let worker = Arc::new(Worker::new(
                queue.clone(),
                pool.clone(),
                steam,
                submitter,
            ));

            Self {
                queue,
                pool,
                worker,
                steam_state,
                submit_state,
                steam_base,
                submit_base,
                dir,
                servers: vec![steam_server, submit_server],
            }
        }

        // Ticks the worker until the queue drains or the budget runs out.
        async fn run_until_empty(&self, max_passes: usize) -> bool {
            for _ in 0..max_passes {
                self.worker.process_queue().await;
                if self.queue.is_empty().await {
                    return true;
                }
            }
            false
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            for server in &self.servers {
                server.abort();
            }
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    #[tokio::test]
    async fn happy_path_runs_all_checks_in_order_and_submits() {
        let harness = Harness::new(
            "happy",
            SteamMockState::default(),
            SubmitMockState::default(),
        )
        .await;
        harness.queue.enqueue(ID, "alice").await.unwrap();

        assert!(harness.run_until_empty(5).await);
        assert_eq!(harness.submit_state.hits.load(Ordering::SeqCst), 1);

        let hits = harness.steam_state.hits.lock().unwrap().clone();
        let expected = [
            "/IPlayerService/GetAnimatedAvatar/v1/",
            "/IPlayerService/GetAvatarFrame/v1/",
            "/IPlayerService/GetMiniProfileBackground/v1/",
            "/IPlayerService/GetProfileBackground/v1/",
            "/IPlayerService/GetSteamLevel/v1/",
            "/ISteamUser/GetFriendList/v0001/",
        ];
        assert_eq!(&hits[..6], &expected);
        assert!(hits[6].contains("/inventory/"));
        assert_eq!(hits.len(), 7);
    }

    #[tokio::test]
    async fn private_profile_skips_the_pooled_checks() {
        let steam_state = SteamMockState::default();
        steam_state.private_level.store(true, Ordering::SeqCst);
        let harness =
            Harness::new("private", steam_state, SubmitMockState::default()).await;
        harness.queue.enqueue(ID, "alice").await.unwrap();

        assert!(harness.run_until_empty(5).await);
        assert_eq!(harness.submit_state.hits.load(Ordering::SeqCst), 1);
        assert_eq!(harness.steam_state.count("GetFriendList"), 0);
        assert_eq!(harness.steam_state.count("/inventory/"), 0);
    }

    #[tokio::test]
    async fn failed_check_discards_without_submitting() {
        let steam_state = SteamMockState::default();
        steam_state.avatar_set.store(true, Ordering::SeqCst);
        let harness = Harness::new("failed", steam_state, SubmitMockState::default()).await;
        harness.queue.enqueue(ID, "alice").await.unwrap();

        assert!(harness.run_until_empty(3).await);
        assert_eq!(harness.submit_state.hits.load(Ordering::SeqCst), 0);
        // The pipeline stops at the first failure.
        assert_eq!(harness.steam_state.count("GetSteamLevel"), 0);
    }

    #[tokio::test]
    async fn downstream_outage_keeps_the_item_and_retries_only_the_write() {
        let submit_state = SubmitMockState::default();
        submit_state.failures_budget.store(1, Ordering::SeqCst);
        let harness =
            Harness::new("retry-write", SteamMockState::default(), submit_state).await;
        harness.queue.enqueue(ID, "alice").await.unwrap();

        // Checks run, then the first finalization hits a 503.
        harness.worker.process_queue().await;
        harness.worker.process_queue().await;
        assert_eq!(harness.queue.len().await, 1);
        assert_eq!(harness.submit_state.hits.load(Ordering::SeqCst), 1);
        let items = harness.queue.snapshot().await;
        assert!(items[0].all_passed());

        // The next pass submits again without re-running any check.
        let check_calls_before = harness.steam_state.hits.lock().unwrap().len();
        harness.worker.process_queue().await;
        assert!(harness.queue.is_empty().await);
        assert_eq!(harness.submit_state.hits.load(Ordering::SeqCst), 2);
        assert_eq!(
            harness.steam_state.hits.lock().unwrap().len(),
            check_calls_before
        );
    }

    #[tokio::test]
    async fn rate_limited_friends_defers_both_pooled_checks() {
        let steam_state = SteamMockState::default();
        steam_state.friends_429_budget.store(usize::MAX, Ordering::SeqCst);
        let harness = Harness::new("deferral", steam_state, SubmitMockState::default()).await;
        harness.queue.enqueue(ID, "alice").await.unwrap();

        harness.worker.process_queue().await;
        let items = harness.queue.snapshot().await;
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].checks.get(&CheckName::Friends),
            Some(&CheckStatus::Deferred)
        );
        assert_eq!(
            items[0].checks.get(&CheckName::CsgoInventory),
            Some(&CheckStatus::Deferred)
        );
        assert!(harness.pool.all_in_cooldown().await);
        // The inventory endpoint was never consulted: the pool was already
        // fully cooled when its turn came.
        assert_eq!(harness.steam_state.count("/inventory/"), 0);

        // With everything cooled and no direct work left, the queue idles.
        assert_eq!(harness.worker.process_queue().await, PassResult::Idle);
        assert_eq!(harness.submit_state.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deferred_work_resumes_after_restart_with_fresh_pool() {
        let steam_state = SteamMockState::default();
        steam_state.friends_429_budget.store(1, Ordering::SeqCst);
        let harness = Harness::new("recover", steam_state, SubmitMockState::default()).await;
        harness.queue.enqueue(ID, "alice").await.unwrap();

        harness.worker.process_queue().await;
        assert!(harness.queue.has_deferred().await);

        // Model a restart: same queue file, a pool whose cooldowns are gone.
        let queue =
            Arc::new(QueueStore::load(harness.dir.join("profiles_queue.json")).unwrap());
        assert!(queue.has_deferred().await);
        let pool = Arc::new(ConnectionPool::new_for_test(
            harness.dir.join("config_proxies_2.json"),
            PoolFile::default(),
        ));
        let gate = Arc::new(RateGate::new(Duration::from_millis(1)));
        let steam = Arc::new(SteamClient::with_base_urls(
            &harness.steam_base,
            &harness.steam_base,
            "test-key",
            pool.clone(),
            gate.clone(),
        ));
        let submitter = Arc::new(Submitter::new(
            format!("{}/submit", harness.submit_base),
            "sk-submit",
            gate,
        ));
        let worker = Arc::new(Worker::new(queue.clone(), pool, steam, submitter));
        worker.rebuild_deferred().await;

        // First pass re-opens the parked checks and runs them.
        worker.process_queue().await;
        let items = queue.snapshot().await;
        assert!(items.is_empty() || items[0].all_passed());
    }

    #[tokio::test]
    async fn sweep_reopens_parked_checks_when_capacity_returns() {
        let harness = Harness::new(
            "sweep",
            SteamMockState::default(),
            SubmitMockState::default(),
        )
        .await;
        harness.queue.enqueue(ID, "alice").await.unwrap();
        harness
            .queue
            .update_check(ID, CheckName::Friends, CheckStatus::Deferred)
            .await
            .unwrap();

        harness.worker.reclaim_deferred().await;
        assert!(!harness.queue.has_deferred().await);
    }

    #[tokio::test]
    async fn concurrent_passes_are_rejected_by_the_guard() {
        let harness = Harness::new(
            "guard",
            SteamMockState::default(),
            SubmitMockState::default(),
        )
        .await;
        harness.queue.enqueue(ID, "alice").await.unwrap();

        let (a, b) = tokio::join!(
            harness.worker.process_queue(),
            harness.worker.process_queue()
        );
        assert!(
            a == PassResult::Busy || b == PassResult::Busy,
            "one of two overlapping passes must observe the guard"
        );
    }
}
