/// Usage counters mutated by the blocking-decision path
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::{BlockedPatternStat, DailyStat, SyncStatsRequest, UserStats};
use crate::storage::{keys, StorageError, Store};

/// How many detail entries the options page renders
pub const RECENT_DETAILS_LIMIT: usize = 50;

/// Lifetime blocked/allowed tab counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabStats {
    #[serde(default)]
    pub blocked: u64,
    #[serde(default)]
    pub allowed: u64,
}

/// Counters for a single day, keyed by `YYYY-MM-DD` in [`DailyStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DayStats {
    #[serde(default)]
    pub blocked: u64,
}

pub type DailyStats = BTreeMap<String, DayStats>;

/// Hit counter for one pattern, keyed by pattern string in [`PatternStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternHits {
    #[serde(default)]
    pub count: u64,
}

pub type PatternStats = BTreeMap<String, PatternHits>;

/// One entry of the blocked-tab append log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedDetail {
    pub url: String,
    pub pattern: String,
    pub timestamp: DateTime<Utc>,
}

/// All stats the extension persists, loaded from and saved to their
/// individual storage keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsBook {
    pub tab: TabStats,
    pub daily: DailyStats,
    pub patterns: PatternStats,
    pub details: Vec<BlockedDetail>,
}

impl StatsBook {
    pub async fn load(store: &Store) -> Result<StatsBook, StorageError> {
        Ok(StatsBook {
            tab: store.get_or_default(keys::TAB_STATS).await?,
            daily: store.get_or_default(keys::DAILY_STATS).await?,
            patterns: store.get_or_default(keys::BLOCKED_PATTERNS).await?,
            details: store.get_or_default(keys::BLOCKED_DETAILS).await?,
        })
    }

    pub async fn save(&self, store: &Store) -> Result<(), StorageError> {
        store.set_json(keys::TAB_STATS, &self.tab).await?;
        store.set_json(keys::DAILY_STATS, &self.daily).await?;
        store.set_json(keys::BLOCKED_PATTERNS, &self.patterns).await?;
        store.set_json(keys::BLOCKED_DETAILS, &self.details).await
    }

    /// Record one blocked tab: lifetime counter, daily bucket, per-pattern
    /// hit count, and the detail log.
    pub fn record_blocked(&mut self, url: &str, pattern: &str, now: DateTime<Utc>) {
        self.tab.blocked += 1;
        self.daily.entry(day_key(now)).or_default().blocked += 1;
        self.patterns.entry(pattern.to_string()).or_default().count += 1;
        self.details.push(BlockedDetail {
            url: url.to_string(),
            pattern: pattern.to_string(),
            timestamp: now,
        });
    }

    pub fn record_allowed(&mut self) {
        self.tab.allowed += 1;
    }

    /// Newest-first view of the detail log, capped at `n` entries
    pub fn recent_details(&self, n: usize) -> Vec<BlockedDetail> {
        let mut details = self.details.clone();
        details.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        details.truncate(n);
        details
    }

    /// Body for `POST /api/user/stats/sync`
    pub fn sync_request(&self, now: DateTime<Utc>) -> SyncStatsRequest {
        SyncStatsRequest {
            user_stats: UserStats {
                total_tabs_blocked: self.tab.blocked,
                last_updated: Some(now),
            },
            daily_stats: self
                .daily
                .iter()
                .map(|(date, day)| DailyStat {
                    date: date.clone(),
                    tabs_blocked: day.blocked,
                })
                .collect(),
            blocked_pattern_stats: self
                .patterns
                .iter()
                .map(|(pattern, hits)| BlockedPatternStat {
                    pattern: pattern.clone(),
                    count: hits.count,
                })
                .collect(),
        }
    }
}

fn day_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}
