use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

static ACCOUNT_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{17}$").expect("Invalid account id regex"));

pub fn is_valid_account_id(id: &str) -> bool {
    ACCOUNT_ID_REGEX.is_match(id)
}

// The Ord derive follows declaration order, which is also the order checks
// run in: the five direct profile-asset probes first, the two pooled
// endpoints last.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    AnimatedAvatar,
    AvatarFrame,
    MiniProfileBackground,
    ProfileBackground,
    SteamLevel,
    Friends,
    CsgoInventory,
}

impl CheckName {
    pub const ALL: [CheckName; 7] = [
        CheckName::AnimatedAvatar,
        CheckName::AvatarFrame,
        CheckName::MiniProfileBackground,
        CheckName::ProfileBackground,
        CheckName::SteamLevel,
        CheckName::Friends,
        CheckName::CsgoInventory,
    ];

    // The two endpoints that throttle aggressively and must go through the
    // connection pool.
    pub fn is_rate_limited(self) -> bool {
        matches!(self, CheckName::Friends | CheckName::CsgoInventory)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CheckName::AnimatedAvatar => "animated_avatar",
            CheckName::AvatarFrame => "avatar_frame",
            CheckName::MiniProfileBackground => "mini_profile_background",
            CheckName::ProfileBackground => "profile_background",
            CheckName::SteamLevel => "steam_level",
            CheckName::Friends => "friends",
            CheckName::CsgoInventory => "csgo_inventory",
        }
    }
}

impl std::fmt::Display for CheckName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    ToCheck,
    Passed,
    Failed,
    Deferred,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub account_id: String,
    pub submitter: String,
    // Epoch milliseconds.
    pub enqueued_at: i64,
    #[serde(default)]
    pub checks: BTreeMap<CheckName, CheckStatus>,
}

impl QueueItem {
    pub fn new(account_id: impl Into<String>, submitter: impl Into<String>) -> Self {
        let mut item = Self {
            account_id: account_id.into(),
            submitter: submitter.into(),
            enqueued_at: chrono::Utc::now().timestamp_millis(),
            checks: BTreeMap::new(),
        };
        item.ensure_all_checks();
        item
    }

    // Older queue files may predate a check; missing entries start fresh.
    pub fn ensure_all_checks(&mut self) {
        for name in CheckName::ALL {
            self.checks.entry(name).or_insert(CheckStatus::ToCheck);
        }
    }

    pub fn has_tocheck(&self) -> bool {
        self.checks.values().any(|s| *s == CheckStatus::ToCheck)
    }

    pub fn has_deferred(&self) -> bool {
        self.checks.values().any(|s| *s == CheckStatus::Deferred)
    }

    // Checks still to run, in execution order.
    pub fn pending_checks(&self) -> Vec<CheckName> {
        CheckName::ALL
            .into_iter()
            .filter(|name| self.checks.get(name) == Some(&CheckStatus::ToCheck))
            .collect()
    }

    // Any direct (non-pooled) check still runnable while the pool is down.
    pub fn has_direct_tocheck(&self) -> bool {
        self.checks
            .iter()
            .any(|(name, status)| !name.is_rate_limited() && *status == CheckStatus::ToCheck)
    }

    // Every check reached a definitive outcome; the item awaits finalization.
    pub fn is_settled(&self) -> bool {
        self.checks
            .values()
            .all(|s| matches!(s, CheckStatus::Passed | CheckStatus::Failed))
    }

    pub fn all_passed(&self) -> bool {
        self.checks.values().all(|s| *s == CheckStatus::Passed)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CheckStatusCounts {
    pub to_check: usize,
    pub passed: usize,
    pub failed: usize,
    pub deferred: usize,
}

impl CheckStatusCounts {
    pub fn record(&mut self, status: CheckStatus) {
        match status {
            CheckStatus::ToCheck => self.to_check += 1,
            CheckStatus::Passed => self.passed += 1,
            CheckStatus::Failed => self.failed += 1,
            CheckStatus::Deferred => self.deferred += 1,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub checks: BTreeMap<CheckName, CheckStatusCounts>,
    pub by_submitter: BTreeMap<String, usize>,
}
