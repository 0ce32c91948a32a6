/// Server sync flows: blocklist reconciliation, stats, blocking history
use std::rc::Rc;

use chrono::Utc;
use log::warn;
use thiserror::Error;

use crate::api::{ApiClient, ApiError, GetStatsResponse};
use crate::auth::AuthManager;
use crate::blocklist::{
    ensure_can_add, merge_patterns, quick_block_pattern, BlockedSite, BlocklistError,
};
use crate::stats::{BlockedDetail, StatsBook};
use crate::storage::{keys, StorageError, Store};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("server rejected the sync")]
    Rejected,
    #[error(transparent)]
    Blocklist(#[from] BlocklistError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Local blocklist edits plus the push/pull flows against the backend.
/// On any sync failure the local list stays authoritative; there is no
/// automatic retry.
#[derive(Clone)]
pub struct BlocklistService {
    store: Store,
    api: Rc<dyn ApiClient>,
    auth: Rc<AuthManager>,
}

impl BlocklistService {
    pub fn new(store: Store, api: Rc<dyn ApiClient>, auth: Rc<AuthManager>) -> BlocklistService {
        BlocklistService { store, api, auth }
    }

    pub async fn blocked_sites(&self) -> Result<Vec<BlockedSite>, StorageError> {
        self.store.get_or_default(keys::BLOCKED_SITES).await
    }

    /// Add a pattern to the local list, enforcing the free-tier cap.
    /// Returns the updated list; pushing it to the server is a separate
    /// step ([`BlocklistService::sync_patterns`]).
    pub async fn add_pattern(&self, pattern: &str) -> Result<Vec<BlockedSite>, SyncError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(BlocklistError::EmptyPattern.into());
        }

        let mut sites = self.blocked_sites().await?;
        ensure_can_add(sites.len(), self.auth.is_paid_user().await)?;

        sites.push(BlockedSite::new(pattern));
        self.store.set_json(keys::BLOCKED_SITES, &sites).await?;
        Ok(sites)
    }

    pub async fn remove_pattern(&self, pattern: &str) -> Result<Vec<BlockedSite>, SyncError> {
        let mut sites = self.blocked_sites().await?;
        sites.retain(|site| site.pattern != pattern);
        self.store.set_json(keys::BLOCKED_SITES, &sites).await?;
        Ok(sites)
    }

    /// "Block this domain" for the active tab
    pub async fn quick_block(&self, url: &str) -> Result<Vec<BlockedSite>, SyncError> {
        let pattern = quick_block_pattern(url)?;
        self.add_pattern(&pattern).await
    }

    /// Push the local list; the server answers with the canonical list,
    /// which replaces the local one and refreshes the render cache.
    pub async fn sync_patterns(&self) -> Result<Vec<BlockedSite>, SyncError> {
        let token = self
            .auth
            .get_valid_access_token()
            .await
            .ok_or(SyncError::NotLoggedIn)?;
        let local = self.blocked_sites().await?;

        let response = self.api.sync_blocklist(&token, &local).await?;
        if !response.success {
            return Err(SyncError::Rejected);
        }

        let canonical = response.blocked_patterns;
        self.store.set_json(keys::BLOCKED_SITES, &canonical).await?;
        self.store
            .set_json(keys::CACHED_BLOCKED_SITES, &canonical)
            .await?;
        self.store
            .set_json(keys::LAST_SYNC_TIME, &Utc::now())
            .await?;
        Ok(canonical)
    }

    /// Pull the server list and reconcile it with the local one (newer
    /// `created_at` wins per pattern). When the merge still holds entries
    /// the server lacks, they are pushed right back.
    pub async fn load_from_server(&self) -> Result<Vec<BlockedSite>, SyncError> {
        let token = self
            .auth
            .get_valid_access_token()
            .await
            .ok_or(SyncError::NotLoggedIn)?;

        let server = self.api.get_blocklist(&token).await?;
        let local = self.blocked_sites().await?;
        let merged = merge_patterns(&local, &server);

        self.store.set_json(keys::BLOCKED_SITES, &merged).await?;
        self.store
            .set_json(keys::CACHED_BLOCKED_SITES, &merged)
            .await?;

        if merged.len() > server.len() {
            return self.sync_patterns().await;
        }
        Ok(merged)
    }

    /// Render cache written on every successful sync, read at popup open
    pub async fn cached_blocked_sites(&self) -> Option<Vec<BlockedSite>> {
        self.store
            .get_json(keys::CACHED_BLOCKED_SITES)
            .await
            .ok()
            .flatten()
    }
}

/// Pushes usage counters and the blocked-tab log to the backend
#[derive(Clone)]
pub struct StatsService {
    store: Store,
    api: Rc<dyn ApiClient>,
    auth: Rc<AuthManager>,
}

impl StatsService {
    pub fn new(store: Store, api: Rc<dyn ApiClient>, auth: Rc<AuthManager>) -> StatsService {
        StatsService { store, api, auth }
    }

    pub async fn sync_stats(&self) -> Result<(), SyncError> {
        let token = self
            .auth
            .get_valid_access_token()
            .await
            .ok_or(SyncError::NotLoggedIn)?;

        let book = StatsBook::load(&self.store).await?;
        let request = book.sync_request(Utc::now());

        let response = self.api.sync_stats(&token, &request).await?;
        if !response.success {
            return Err(SyncError::Rejected);
        }

        self.store
            .set_json(keys::LAST_SYNC_TIME, &Utc::now())
            .await?;
        Ok(())
    }

    /// Server-side aggregates, as shown on the options page
    pub async fn server_stats(&self) -> Result<GetStatsResponse, SyncError> {
        let token = self
            .auth
            .get_valid_access_token()
            .await
            .ok_or(SyncError::NotLoggedIn)?;
        Ok(self.api.get_stats(&token).await?)
    }

    pub async fn server_blocking_history(&self) -> Result<Vec<BlockedDetail>, SyncError> {
        let token = self
            .auth
            .get_valid_access_token()
            .await
            .ok_or(SyncError::NotLoggedIn)?;
        Ok(self.api.get_blocking_history(&token).await?)
    }

    pub async fn push_blocking_history(&self) -> Result<(), SyncError> {
        let token = self
            .auth
            .get_valid_access_token()
            .await
            .ok_or(SyncError::NotLoggedIn)?;

        let book = StatsBook::load(&self.store).await?;
        if book.details.is_empty() {
            return Ok(());
        }

        let response = self
            .api
            .sync_blocking_history(&token, &book.details)
            .await?;
        if !response.success {
            warn!("blocking history push was not accepted");
            return Err(SyncError::Rejected);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{token_response, MockApi};
    use crate::storage::MemoryStorage;
    use chrono::{TimeZone, Utc};
    use futures::executor::block_on;

    struct Fixture {
        api: Rc<MockApi>,
        store: Store,
        blocklist: BlocklistService,
        stats: StatsService,
    }

    fn fixture() -> Fixture {
        let api = Rc::new(MockApi::default());
        let store = Store::new(Rc::new(MemoryStorage::new()));
        let auth = Rc::new(AuthManager::new(
            store.clone(),
            Rc::clone(&api) as Rc<dyn ApiClient>,
        ));
        Fixture {
            blocklist: BlocklistService::new(
                store.clone(),
                Rc::clone(&api) as Rc<dyn ApiClient>,
                Rc::clone(&auth),
            ),
            stats: StatsService::new(store.clone(), Rc::clone(&api) as Rc<dyn ApiClient>, auth),
            api,
            store,
        }
    }

    async fn log_in(store: &Store) {
        store.set_json(keys::TOKEN, "tok").await.unwrap();
        let expiry = Utc::now().timestamp_millis() + 60_000;
        store.set_json(keys::TOKEN_EXPIRY, &expiry).await.unwrap();
    }

    fn site(pattern: &str, minute: u32) -> BlockedSite {
        BlockedSite {
            pattern: pattern.to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, minute, 0).unwrap(),
        }
    }

    #[test]
    fn test_add_and_remove_pattern_locally() {
        block_on(async {
            let f = fixture();

            let sites = f.blocklist.add_pattern(" *://a.com/* ").await.unwrap();
            assert_eq!(sites.len(), 1);
            assert_eq!(sites[0].pattern, "*://a.com/*");

            let sites = f.blocklist.remove_pattern("*://a.com/*").await.unwrap();
            assert!(sites.is_empty());
        });
    }

    #[test]
    fn test_add_pattern_rejects_empty() {
        block_on(async {
            let f = fixture();
            assert!(matches!(
                f.blocklist.add_pattern("   ").await,
                Err(SyncError::Blocklist(BlocklistError::EmptyPattern))
            ));
        });
    }

    #[test]
    fn test_free_tier_cap_applies() {
        block_on(async {
            let f = fixture();
            for i in 0..5 {
                f.blocklist
                    .add_pattern(&format!("*://site{i}.com/*"))
                    .await
                    .unwrap();
            }

            assert!(matches!(
                f.blocklist.add_pattern("*://one-more.com/*").await,
                Err(SyncError::Blocklist(BlocklistError::PatternLimitReached))
            ));
        });
    }

    #[test]
    fn test_paying_user_passes_the_cap() {
        block_on(async {
            let f = fixture();
            log_in(&f.store).await;
            f.store
                .set_json(keys::CACHED_PRO_STATUS, &true)
                .await
                .unwrap();

            for i in 0..8 {
                f.blocklist
                    .add_pattern(&format!("*://site{i}.com/*"))
                    .await
                    .unwrap();
            }
            assert_eq!(f.blocklist.blocked_sites().await.unwrap().len(), 8);
        });
    }

    #[test]
    fn test_quick_block_adds_host_pattern() {
        block_on(async {
            let f = fixture();
            let sites = f
                .blocklist
                .quick_block("https://news.example.com/story?id=1")
                .await
                .unwrap();
            assert_eq!(sites[0].pattern, "*://news.example.com/*");
        });
    }

    #[test]
    fn test_sync_patterns_requires_login() {
        block_on(async {
            let f = fixture();
            f.blocklist.add_pattern("*://a.com/*").await.unwrap();

            assert!(matches!(
                f.blocklist.sync_patterns().await,
                Err(SyncError::NotLoggedIn)
            ));
            assert!(f.api.pattern_pushes.borrow().is_empty());
        });
    }

    #[test]
    fn test_sync_patterns_persists_canonical_list() {
        block_on(async {
            let f = fixture();
            log_in(&f.store).await;
            f.blocklist.add_pattern("*://a.com/*").await.unwrap();

            let canonical = f.blocklist.sync_patterns().await.unwrap();

            assert_eq!(f.api.pattern_pushes.borrow().len(), 1);
            assert_eq!(canonical.len(), 1);
            assert_eq!(
                f.blocklist.cached_blocked_sites().await.unwrap(),
                canonical
            );
            let last_sync: Option<chrono::DateTime<Utc>> =
                f.store.get_json(keys::LAST_SYNC_TIME).await.unwrap();
            assert!(last_sync.is_some());
        });
    }

    #[test]
    fn test_sync_failure_keeps_local_list() {
        block_on(async {
            let f = fixture();
            log_in(&f.store).await;
            f.blocklist.add_pattern("*://a.com/*").await.unwrap();
            f.api.sync_fails.set(true);

            assert!(f.blocklist.sync_patterns().await.is_err());

            let local = f.blocklist.blocked_sites().await.unwrap();
            assert_eq!(local.len(), 1);
            assert_eq!(local[0].pattern, "*://a.com/*");
        });
    }

    #[test]
    fn test_load_from_server_merges_and_pushes_extras() {
        block_on(async {
            let f = fixture();
            log_in(&f.store).await;

            // local knows an older copy of a.com plus its own b.com
            f.store
                .set_json(
                    keys::BLOCKED_SITES,
                    &vec![site("*://a.com/*", 0), site("*://b.com/*", 1)],
                )
                .await
                .unwrap();
            *f.api.server_patterns.borrow_mut() = vec![site("*://a.com/*", 30)];

            let merged = f.blocklist.load_from_server().await.unwrap();

            assert_eq!(merged.len(), 2);
            assert_eq!(merged[0].pattern, "*://a.com/*");
            // server copy was newer, so its timestamp won
            assert_eq!(merged[0].created_at, site("*://a.com/*", 30).created_at);
            // the merge held a local-only entry, so it was pushed back
            assert_eq!(f.api.pattern_pushes.borrow().len(), 1);
        });
    }

    #[test]
    fn test_load_from_server_no_push_when_server_covers_local() {
        block_on(async {
            let f = fixture();
            log_in(&f.store).await;
            *f.api.server_patterns.borrow_mut() = vec![site("*://a.com/*", 30)];

            let merged = f.blocklist.load_from_server().await.unwrap();

            assert_eq!(merged.len(), 1);
            assert!(f.api.pattern_pushes.borrow().is_empty());
        });
    }

    #[test]
    fn test_expired_token_refreshes_before_sync() {
        block_on(async {
            let f = fixture();
            f.store.set_json(keys::TOKEN, "stale").await.unwrap();
            f.store.set_json(keys::REFRESH_TOKEN, "r1").await.unwrap();
            let expired = Utc::now().timestamp_millis() - 1000;
            f.store
                .set_json(keys::TOKEN_EXPIRY, &expired)
                .await
                .unwrap();
            *f.api.refresh_result.borrow_mut() = Ok(token_response("fresh", "r2", 3600));

            f.blocklist.add_pattern("*://a.com/*").await.unwrap();
            f.blocklist.sync_patterns().await.unwrap();

            assert_eq!(f.api.refresh_calls.get(), 1);
            assert_eq!(f.api.pattern_pushes.borrow().len(), 1);
        });
    }

    #[test]
    fn test_stats_sync_builds_request_from_book() {
        block_on(async {
            let f = fixture();
            log_in(&f.store).await;

            let mut book = StatsBook::load(&f.store).await.unwrap();
            book.record_blocked(
                "https://a.com/",
                "*://a.com/*",
                Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
            );
            book.save(&f.store).await.unwrap();

            f.stats.sync_stats().await.unwrap();

            let requests = f.api.stats_requests.borrow();
            assert_eq!(requests.len(), 1);
            assert_eq!(requests[0].user_stats.total_tabs_blocked, 1);
            assert_eq!(requests[0].daily_stats[0].date, "2024-06-01");
        });
    }

    #[test]
    fn test_server_pulls_require_login() {
        block_on(async {
            let f = fixture();
            assert!(matches!(
                f.stats.server_stats().await,
                Err(SyncError::NotLoggedIn)
            ));

            log_in(&f.store).await;
            assert_eq!(
                f.stats.server_stats().await.unwrap().user_stats.total_tabs_blocked,
                0
            );
            assert!(f.stats.server_blocking_history().await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_blocking_history_push_skips_empty_log() {
        block_on(async {
            let f = fixture();
            log_in(&f.store).await;

            f.stats.push_blocking_history().await.unwrap();
            assert!(f.api.history_pushes.borrow().is_empty());

            let mut book = StatsBook::load(&f.store).await.unwrap();
            book.record_blocked("https://a.com/", "*://a.com/*", Utc::now());
            book.save(&f.store).await.unwrap();

            f.stats.push_blocking_history().await.unwrap();
            assert_eq!(f.api.history_pushes.borrow().len(), 1);
        });
    }
}
