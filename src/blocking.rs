/// Tab lifecycle decision path: match, count, close
use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::blocklist::{find_blocked, BlockedSite};
use crate::stats::StatsBook;
use crate::storage::{keys, StorageError, Store};

/// What the background script should do with a freshly opened tab
#[derive(Debug, Clone, PartialEq)]
pub enum TabDecision {
    Allow,
    Block { pattern: String },
}

/// An open tab as reported by the tabs API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenTab {
    pub id: i32,
    pub url: String,
}

#[derive(Clone)]
pub struct BlockingEngine {
    store: Store,
}

impl BlockingEngine {
    pub fn new(store: Store) -> BlockingEngine {
        BlockingEngine { store }
    }

    /// Blocking is on unless it was explicitly toggled off
    pub async fn is_enabled(&self) -> bool {
        self.store
            .get_json(keys::IS_BLOCKING)
            .await
            .ok()
            .flatten()
            .unwrap_or(true)
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), StorageError> {
        self.store.set_json(keys::IS_BLOCKING, &enabled).await
    }

    /// Decide a newly opened tab. A block updates every counter the
    /// options page reads: lifetime stats, the daily bucket, the
    /// per-pattern hit count, and the detail log.
    pub async fn on_tab_opened(&self, url: &str) -> Result<TabDecision, StorageError> {
        if !self.is_enabled().await {
            return Ok(TabDecision::Allow);
        }

        let sites: Vec<BlockedSite> = self.store.get_or_default(keys::BLOCKED_SITES).await?;
        let Some(site) = find_blocked(url, &sites) else {
            return Ok(TabDecision::Allow);
        };
        let pattern = site.pattern.clone();

        let mut book = StatsBook::load(&self.store).await?;
        book.record_blocked(url, &pattern, Utc::now());
        book.save(&self.store).await?;

        debug!("blocked {url} (pattern: {pattern})");
        Ok(TabDecision::Block { pattern })
    }

    /// A tab finished loading without being blocked
    pub async fn on_tab_loaded(&self, _url: &str) -> Result<(), StorageError> {
        let mut book = StatsBook::load(&self.store).await?;
        book.record_allowed();
        book.save(&self.store).await
    }

    /// Tabs that should be closed when blocking is switched back on
    pub async fn tabs_to_close(&self, tabs: &[OpenTab]) -> Result<Vec<i32>, StorageError> {
        let sites: Vec<BlockedSite> = self.store.get_or_default(keys::BLOCKED_SITES).await?;
        Ok(tabs
            .iter()
            .filter(|tab| find_blocked(&tab.url, &sites).is_some())
            .map(|tab| tab.id)
            .collect())
    }
}
