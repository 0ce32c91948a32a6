/// REST surface of the product backend (JSON over HTTPS, bearer auth)
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blocklist::BlockedSite;
use crate::stats::BlockedDetail;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request rejected ({status}): {message}")]
    Status { status: u16, message: String },
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// `POST /api/auth/login` and `POST /api/auth/refresh` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Access-token lifetime in seconds
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
}

/// `GET /api/auth/session` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub email: Option<String>,
    pub supabase_user_id: String,
    pub is_paying: bool,
}

/// `POST /api/auth/register` response. Tokens are not issued at
/// registration; the account first goes through email verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub requires_verification: bool,
    pub message: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBlockedPatternsRequest {
    pub patterns: Vec<BlockedSite>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBlockedPatternsResponse {
    pub success: bool,
    pub blocked_patterns: Vec<BlockedSite>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
    pub total_tabs_blocked: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStat {
    pub date: String,
    pub tabs_blocked: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedPatternStat {
    pub pattern: String,
    pub count: u64,
}

/// `POST /api/user/stats/sync` body; also the `GET /api/user/stats` shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatsRequest {
    pub user_stats: UserStats,
    pub daily_stats: Vec<DailyStat>,
    pub blocked_pattern_stats: Vec<BlockedPatternStat>,
}

pub type GetStatsResponse = SyncStatsRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingHistoryRequest {
    pub blocking_history: Vec<BlockedDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub success: bool,
}

/// One method per backend endpoint. Implemented over `fetch` in the
/// extension and by a canned double in tests.
#[async_trait(?Send)]
pub trait ApiClient {
    /// `POST /api/auth/login` (form-encoded `username`, `password`)
    async fn login(&self, username: &str, password: &str) -> Result<TokenResponse, ApiError>;

    /// `POST /api/auth/register`
    async fn register(
        &self,
        username: &str,
        password: &str,
    ) -> Result<RegistrationResponse, ApiError>;

    /// `POST /api/auth/refresh`
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ApiError>;

    /// `GET /api/auth/session` (bearer)
    async fn session(&self, access_token: &str) -> Result<SessionInfo, ApiError>;

    /// `POST /api/auth/logout` (bearer)
    async fn logout(&self, access_token: &str) -> Result<(), ApiError>;

    /// `GET /api/user/blocklist`
    async fn get_blocklist(&self, access_token: &str) -> Result<Vec<BlockedSite>, ApiError>;

    /// `POST /api/user/blocklist/sync`
    async fn sync_blocklist(
        &self,
        access_token: &str,
        patterns: &[BlockedSite],
    ) -> Result<SyncBlockedPatternsResponse, ApiError>;

    /// `GET /api/user/stats`
    async fn get_stats(&self, access_token: &str) -> Result<GetStatsResponse, ApiError>;

    /// `POST /api/user/stats/sync`
    async fn sync_stats(
        &self,
        access_token: &str,
        request: &SyncStatsRequest,
    ) -> Result<SyncResponse, ApiError>;

    /// `GET /api/user/blocking_history`
    async fn get_blocking_history(
        &self,
        access_token: &str,
    ) -> Result<Vec<BlockedDetail>, ApiError>;

    /// `POST /api/user/blocking_history`
    async fn sync_blocking_history(
        &self,
        access_token: &str,
        records: &[BlockedDetail],
    ) -> Result<SyncResponse, ApiError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::{Cell, RefCell};
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use super::*;

    /// Canned-response [`ApiClient`] with per-endpoint call counters
    pub(crate) struct MockApi {
        pub login_result: RefCell<Result<TokenResponse, String>>,
        pub refresh_result: RefCell<Result<TokenResponse, String>>,
        pub session_result: RefCell<Result<SessionInfo, String>>,
        pub server_patterns: RefCell<Vec<BlockedSite>>,
        pub sync_fails: Cell<bool>,
        /// Suspend once inside `refresh` before answering, so concurrent
        /// callers really overlap with the in-flight request
        pub slow_refresh: Cell<bool>,

        pub refresh_calls: Cell<usize>,
        pub logout_calls: Cell<usize>,
        pub pattern_pushes: RefCell<Vec<Vec<BlockedSite>>>,
        pub stats_requests: RefCell<Vec<SyncStatsRequest>>,
        pub history_pushes: RefCell<Vec<Vec<BlockedDetail>>>,
    }

    impl Default for MockApi {
        fn default() -> MockApi {
            MockApi {
                login_result: RefCell::new(Err("login not stubbed".to_string())),
                refresh_result: RefCell::new(Err("refresh not stubbed".to_string())),
                session_result: RefCell::new(Err("session not stubbed".to_string())),
                server_patterns: RefCell::new(Vec::new()),
                sync_fails: Cell::new(false),
                slow_refresh: Cell::new(false),
                refresh_calls: Cell::new(0),
                logout_calls: Cell::new(0),
                pattern_pushes: RefCell::new(Vec::new()),
                stats_requests: RefCell::new(Vec::new()),
                history_pushes: RefCell::new(Vec::new()),
            }
        }
    }

    pub(crate) fn token_response(access: &str, refresh: &str, expires_in: i64) -> TokenResponse {
        TokenResponse {
            access_token: access.to_string(),
            refresh_token: refresh.to_string(),
            expires_in,
            token_type: "bearer".to_string(),
        }
    }

    fn canned<T: Clone>(result: &RefCell<Result<T, String>>) -> Result<T, ApiError> {
        result
            .borrow()
            .clone()
            .map_err(ApiError::Network)
    }

    #[async_trait(?Send)]
    impl ApiClient for MockApi {
        async fn login(&self, _username: &str, _password: &str) -> Result<TokenResponse, ApiError> {
            canned(&self.login_result)
        }

        async fn register(
            &self,
            username: &str,
            _password: &str,
        ) -> Result<RegistrationResponse, ApiError> {
            Ok(RegistrationResponse {
                requires_verification: true,
                message: "Check your email to verify your account".to_string(),
                email: username.to_string(),
            })
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse, ApiError> {
            if self.slow_refresh.get() {
                yield_now().await;
            }
            self.refresh_calls.set(self.refresh_calls.get() + 1);
            canned(&self.refresh_result)
        }

        async fn session(&self, _access_token: &str) -> Result<SessionInfo, ApiError> {
            canned(&self.session_result)
        }

        async fn logout(&self, _access_token: &str) -> Result<(), ApiError> {
            self.logout_calls.set(self.logout_calls.get() + 1);
            Ok(())
        }

        async fn get_blocklist(&self, _access_token: &str) -> Result<Vec<BlockedSite>, ApiError> {
            Ok(self.server_patterns.borrow().clone())
        }

        async fn sync_blocklist(
            &self,
            _access_token: &str,
            patterns: &[BlockedSite],
        ) -> Result<SyncBlockedPatternsResponse, ApiError> {
            self.pattern_pushes.borrow_mut().push(patterns.to_vec());
            if self.sync_fails.get() {
                return Err(ApiError::Network("sync unavailable".to_string()));
            }
            *self.server_patterns.borrow_mut() = patterns.to_vec();
            Ok(SyncBlockedPatternsResponse {
                success: true,
                blocked_patterns: patterns.to_vec(),
            })
        }

        async fn get_stats(&self, _access_token: &str) -> Result<GetStatsResponse, ApiError> {
            Ok(GetStatsResponse {
                user_stats: UserStats {
                    total_tabs_blocked: 0,
                    last_updated: None,
                },
                daily_stats: Vec::new(),
                blocked_pattern_stats: Vec::new(),
            })
        }

        async fn sync_stats(
            &self,
            _access_token: &str,
            request: &SyncStatsRequest,
        ) -> Result<SyncResponse, ApiError> {
            self.stats_requests.borrow_mut().push(request.clone());
            Ok(SyncResponse { success: true })
        }

        async fn get_blocking_history(
            &self,
            _access_token: &str,
        ) -> Result<Vec<BlockedDetail>, ApiError> {
            Ok(Vec::new())
        }

        async fn sync_blocking_history(
            &self,
            _access_token: &str,
            records: &[BlockedDetail],
        ) -> Result<SyncResponse, ApiError> {
            self.history_pushes.borrow_mut().push(records.to_vec());
            Ok(SyncResponse { success: true })
        }
    }

    /// Suspend the current task once and wake it immediately
    pub(crate) async fn yield_now() {
        struct YieldNow(bool);

        impl Future for YieldNow {
            type Output = ();

            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
                if self.0 {
                    Poll::Ready(())
                } else {
                    self.0 = true;
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            }
        }

        YieldNow(false).await
    }
}
