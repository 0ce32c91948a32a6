/// Browser-side adapters: chrome.storage bridge, fetch client, JS exports
use std::rc::Rc;

use async_trait::async_trait;
use js_sys::Promise;
use serde::de::DeserializeOwned;
use serde::Serialize;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::{future_to_promise, JsFuture};
use web_sys::{AbortController, Headers, Request, RequestCredentials, RequestInit, Response};

use crate::api::{
    ApiClient, ApiError, BlockingHistoryRequest, GetStatsResponse, RegistrationResponse,
    SessionInfo, SyncBlockedPatternsRequest, SyncBlockedPatternsResponse, SyncResponse,
    SyncStatsRequest, TokenResponse,
};
use crate::auth::AuthManager;
use crate::blocking::{BlockingEngine, OpenTab, TabDecision};
use crate::blocklist::BlockedSite;
use crate::stats::{BlockedDetail, StatsBook, TabStats, RECENT_DETAILS_LIMIT};
use crate::storage::{StorageArea, StorageError, Store};
use crate::sync::{BlocklistService, StatsService, SyncError};

/// Session checks race a 5 second abort; other calls rely on the caller
const SESSION_TIMEOUT_MS: i32 = 5000;

// Thin promise-returning shims over chrome.storage.local
#[wasm_bindgen(module = "/js/bridge.js")]
extern "C" {
    #[wasm_bindgen(catch)]
    async fn getStorage(key: &str) -> Result<JsValue, JsValue>;

    #[wasm_bindgen(catch)]
    async fn setStorage(key: &str, value: JsValue) -> Result<(), JsValue>;

    #[wasm_bindgen(catch)]
    async fn removeStorage(key: &str) -> Result<(), JsValue>;
}

#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_name = setTimeout)]
    fn set_timeout(handler: &js_sys::Function, timeout: i32) -> i32;

    #[wasm_bindgen(js_name = clearTimeout)]
    fn clear_timeout(token: i32);
}

/// chrome.storage.local behind the [`StorageArea`] trait
pub struct ExtensionStorage;

#[async_trait(?Send)]
impl StorageArea for ExtensionStorage {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let value = getStorage(key).await.map_err(js_storage_error)?;
        if value.is_null() || value.is_undefined() {
            return Ok(None);
        }
        serde_wasm_bindgen::from_value(value)
            .map(Some)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        // json_compatible keeps maps as plain objects rather than JS Maps
        let value = value
            .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        setStorage(key, value).await.map_err(js_storage_error)
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        removeStorage(key).await.map_err(js_storage_error)
    }
}

fn js_storage_error(value: JsValue) -> StorageError {
    StorageError::Backend(format!("{value:?}"))
}

enum Body {
    Json(String),
    Form(String),
}

/// [`ApiClient`] over the global `fetch` (window or worker scope)
pub struct FetchApiClient {
    base_url: String,
}

impl FetchApiClient {
    pub fn new(base_url: impl Into<String>) -> FetchApiClient {
        FetchApiClient {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn send(
        &self,
        method: &str,
        path: &str,
        bearer: Option<&str>,
        body: Option<Body>,
        timeout_ms: Option<i32>,
    ) -> Result<serde_json::Value, ApiError> {
        let opts = RequestInit::new();
        opts.set_method(method);
        opts.set_credentials(RequestCredentials::Include);

        let headers = Headers::new().map_err(js_api_error)?;
        if let Some(token) = bearer {
            headers
                .set("Authorization", &format!("Bearer {token}"))
                .map_err(js_api_error)?;
        }
        if let Some(body) = body {
            let (content_type, payload) = match body {
                Body::Json(payload) => ("application/json", payload),
                Body::Form(payload) => ("application/x-www-form-urlencoded", payload),
            };
            headers
                .set("Content-Type", content_type)
                .map_err(js_api_error)?;
            opts.set_body(&JsValue::from_str(&payload));
        }
        opts.set_headers(&headers);

        let mut timeout_guard = None;
        if let Some(ms) = timeout_ms {
            let controller = AbortController::new().map_err(js_api_error)?;
            opts.set_signal(Some(&controller.signal()));
            let abort = Closure::once(move || controller.abort());
            let timer = set_timeout(abort.as_ref().unchecked_ref(), ms);
            timeout_guard = Some((abort, timer));
        }

        let request = Request::new_with_str_and_init(&format!("{}{path}", self.base_url), &opts)
            .map_err(js_api_error)?;

        let response = JsFuture::from(global_fetch(&request)).await.map_err(js_api_error);
        if let Some((_abort, timer)) = timeout_guard.take() {
            clear_timeout(timer);
        }
        let response: Response = response?
            .dyn_into()
            .map_err(|_| ApiError::Network("fetch did not produce a Response".to_string()))?;

        let status = response.status();
        let text = JsFuture::from(response.text().map_err(js_api_error)?)
            .await
            .map_err(js_api_error)?
            .as_string()
            .unwrap_or_default();

        if !response.ok() {
            return Err(ApiError::Status {
                status,
                message: error_detail(&text),
            });
        }
        if text.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        bearer: &str,
        timeout_ms: Option<i32>,
    ) -> Result<T, ApiError> {
        let value = self.send("GET", path, Some(bearer), None, timeout_ms).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        bearer: Option<&str>,
        body: &impl Serialize,
    ) -> Result<T, ApiError> {
        let payload = serde_json::to_string(body)?;
        let value = self
            .send("POST", path, bearer, Some(Body::Json(payload)), None)
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

fn global_fetch(request: &Request) -> Promise {
    let global = js_sys::global();
    // background service workers have no Window
    if let Some(scope) = global.dyn_ref::<web_sys::WorkerGlobalScope>() {
        scope.fetch_with_request(request)
    } else {
        global
            .unchecked_into::<web_sys::Window>()
            .fetch_with_request(request)
    }
}

fn js_api_error(value: JsValue) -> ApiError {
    ApiError::Network(format!("{value:?}"))
}

/// Pull the FastAPI `detail` field out of an error body when there is one
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_owned))
        .unwrap_or_else(|| body.to_string())
}

#[async_trait(?Send)]
impl ApiClient for FetchApiClient {
    async fn login(&self, username: &str, password: &str) -> Result<TokenResponse, ApiError> {
        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("username", username)
            .append_pair("password", password)
            .finish();
        let value = self
            .send("POST", "/api/auth/login", None, Some(Body::Form(form)), None)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn register(
        &self,
        username: &str,
        password: &str,
    ) -> Result<RegistrationResponse, ApiError> {
        self.post_json(
            "/api/auth/register",
            None,
            &serde_json::json!({ "username": username, "password": password }),
        )
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ApiError> {
        self.post_json(
            "/api/auth/refresh",
            None,
            &serde_json::json!({ "refresh_token": refresh_token }),
        )
        .await
    }

    async fn session(&self, access_token: &str) -> Result<SessionInfo, ApiError> {
        self.get_json("/api/auth/session", access_token, Some(SESSION_TIMEOUT_MS))
            .await
    }

    async fn logout(&self, access_token: &str) -> Result<(), ApiError> {
        self.send(
            "POST",
            "/api/auth/logout",
            Some(access_token),
            Some(Body::Json("{}".to_string())),
            None,
        )
        .await?;
        Ok(())
    }

    async fn get_blocklist(&self, access_token: &str) -> Result<Vec<BlockedSite>, ApiError> {
        self.get_json("/api/user/blocklist", access_token, None).await
    }

    async fn sync_blocklist(
        &self,
        access_token: &str,
        patterns: &[BlockedSite],
    ) -> Result<SyncBlockedPatternsResponse, ApiError> {
        self.post_json(
            "/api/user/blocklist/sync",
            Some(access_token),
            &SyncBlockedPatternsRequest {
                patterns: patterns.to_vec(),
            },
        )
        .await
    }

    async fn get_stats(&self, access_token: &str) -> Result<GetStatsResponse, ApiError> {
        self.get_json("/api/user/stats", access_token, None).await
    }

    async fn sync_stats(
        &self,
        access_token: &str,
        request: &SyncStatsRequest,
    ) -> Result<SyncResponse, ApiError> {
        self.post_json("/api/user/stats/sync", Some(access_token), request)
            .await
    }

    async fn get_blocking_history(
        &self,
        access_token: &str,
    ) -> Result<Vec<BlockedDetail>, ApiError> {
        self.get_json("/api/user/blocking_history", access_token, None)
            .await
    }

    async fn sync_blocking_history(
        &self,
        access_token: &str,
        records: &[BlockedDetail],
    ) -> Result<SyncResponse, ApiError> {
        self.post_json(
            "/api/user/blocking_history",
            Some(access_token),
            &BlockingHistoryRequest {
                blocking_history: records.to_vec(),
            },
        )
        .await
    }
}

/// Everything the background and popup scripts call, wired over the real
/// storage and fetch adapters. Methods return Promises; errors reject with
/// a message string.
#[wasm_bindgen]
pub struct Extension {
    store: Store,
    auth: Rc<AuthManager>,
    blocking: BlockingEngine,
    blocklist: BlocklistService,
    stats: StatsService,
}

#[wasm_bindgen]
impl Extension {
    #[wasm_bindgen(constructor)]
    pub fn new(base_url: String) -> Extension {
        let store = Store::new(Rc::new(ExtensionStorage));
        let api: Rc<dyn ApiClient> = Rc::new(FetchApiClient::new(base_url));
        let auth = Rc::new(AuthManager::new(store.clone(), Rc::clone(&api)));

        Extension {
            blocking: BlockingEngine::new(store.clone()),
            blocklist: BlocklistService::new(store.clone(), Rc::clone(&api), Rc::clone(&auth)),
            stats: StatsService::new(store.clone(), api, Rc::clone(&auth)),
            store,
            auth,
        }
    }

    /// Resolves with the matched pattern when the tab must be closed,
    /// null when it is allowed
    pub fn on_tab_opened(&self, url: String) -> Promise {
        let blocking = self.blocking.clone();
        future_to_promise(async move {
            match blocking.on_tab_opened(&url).await.map_err(to_js)? {
                TabDecision::Block { pattern } => Ok(JsValue::from_str(&pattern)),
                TabDecision::Allow => Ok(JsValue::NULL),
            }
        })
    }

    pub fn on_tab_loaded(&self, url: String) -> Promise {
        let blocking = self.blocking.clone();
        future_to_promise(async move {
            blocking.on_tab_loaded(&url).await.map_err(to_js)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    pub fn set_blocking_enabled(&self, enabled: bool) -> Promise {
        let blocking = self.blocking.clone();
        future_to_promise(async move {
            blocking.set_enabled(enabled).await.map_err(to_js)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    /// `tabs` is an array of `{ id, url }`; resolves with the ids to close
    pub fn tabs_to_close(&self, tabs: JsValue) -> Promise {
        let blocking = self.blocking.clone();
        future_to_promise(async move {
            let tabs: Vec<OpenTab> = serde_wasm_bindgen::from_value(tabs).map_err(to_js)?;
            let ids = blocking.tabs_to_close(&tabs).await.map_err(to_js)?;
            serde_wasm_bindgen::to_value(&ids).map_err(to_js)
        })
    }

    pub fn login(&self, email: String, password: String, remember: bool) -> Promise {
        let auth = Rc::clone(&self.auth);
        future_to_promise(async move {
            auth.login(&email, &password, remember).await.map_err(to_js)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    pub fn register(&self, email: String, password: String) -> Promise {
        let auth = Rc::clone(&self.auth);
        future_to_promise(async move {
            let response = auth.register(&email, &password).await.map_err(to_js)?;
            serde_wasm_bindgen::to_value(&response).map_err(to_js)
        })
    }

    pub fn logout(&self) -> Promise {
        let auth = Rc::clone(&self.auth);
        future_to_promise(async move {
            auth.logout().await.map_err(to_js)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    /// Resolves with the session object, or null when logged out
    pub fn check_session(&self) -> Promise {
        let auth = Rc::clone(&self.auth);
        future_to_promise(async move {
            match auth.check_session().await.map_err(to_js)? {
                Some(session) => serde_wasm_bindgen::to_value(&session).map_err(to_js),
                None => Ok(JsValue::NULL),
            }
        })
    }

    pub fn is_paid_user(&self) -> Promise {
        let auth = Rc::clone(&self.auth);
        future_to_promise(async move { Ok(JsValue::from_bool(auth.is_paid_user().await)) })
    }

    pub fn remembered_email(&self) -> Promise {
        let auth = Rc::clone(&self.auth);
        future_to_promise(async move {
            match auth.remembered_email().await {
                Some(email) => Ok(JsValue::from_str(&email)),
                None => Ok(JsValue::NULL),
            }
        })
    }

    pub fn settings(&self) -> Promise {
        let store = self.store.clone();
        future_to_promise(async move {
            let settings = store.settings().await.map_err(to_js)?;
            serde_wasm_bindgen::to_value(&settings).map_err(to_js)
        })
    }

    pub fn set_settings(&self, settings: JsValue) -> Promise {
        let store = self.store.clone();
        future_to_promise(async move {
            let settings = serde_wasm_bindgen::from_value(settings).map_err(to_js)?;
            store.set_settings(&settings).await.map_err(to_js)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    pub fn blocked_sites(&self) -> Promise {
        let blocklist = self.blocklist.clone();
        future_to_promise(async move {
            let sites = blocklist.blocked_sites().await.map_err(to_js)?;
            serde_wasm_bindgen::to_value(&sites).map_err(to_js)
        })
    }

    /// Add locally, then push best-effort: a failed sync keeps the local
    /// list authoritative and still resolves with it
    pub fn add_pattern(&self, pattern: String) -> Promise {
        let blocklist = self.blocklist.clone();
        future_to_promise(async move {
            let sites = blocklist.add_pattern(&pattern).await.map_err(to_js)?;
            let sites = sync_best_effort(&blocklist, sites).await;
            serde_wasm_bindgen::to_value(&sites).map_err(to_js)
        })
    }

    pub fn remove_pattern(&self, pattern: String) -> Promise {
        let blocklist = self.blocklist.clone();
        future_to_promise(async move {
            let sites = blocklist.remove_pattern(&pattern).await.map_err(to_js)?;
            let sites = sync_best_effort(&blocklist, sites).await;
            serde_wasm_bindgen::to_value(&sites).map_err(to_js)
        })
    }

    pub fn quick_block(&self, url: String) -> Promise {
        let blocklist = self.blocklist.clone();
        future_to_promise(async move {
            let sites = blocklist.quick_block(&url).await.map_err(to_js)?;
            let sites = sync_best_effort(&blocklist, sites).await;
            serde_wasm_bindgen::to_value(&sites).map_err(to_js)
        })
    }

    pub fn sync_patterns(&self) -> Promise {
        let blocklist = self.blocklist.clone();
        future_to_promise(async move {
            let sites = blocklist.sync_patterns().await.map_err(to_js)?;
            serde_wasm_bindgen::to_value(&sites).map_err(to_js)
        })
    }

    pub fn load_patterns_from_server(&self) -> Promise {
        let blocklist = self.blocklist.clone();
        future_to_promise(async move {
            let sites = blocklist.load_from_server().await.map_err(to_js)?;
            serde_wasm_bindgen::to_value(&sites).map_err(to_js)
        })
    }

    pub fn tab_stats(&self) -> Promise {
        let store = self.store.clone();
        future_to_promise(async move {
            let stats: TabStats = store
                .get_or_default(crate::storage::keys::TAB_STATS)
                .await
                .map_err(to_js)?;
            serde_wasm_bindgen::to_value(&stats).map_err(to_js)
        })
    }

    /// Newest-first slice of the blocked-tab log for the options page
    pub fn recent_blocked_details(&self) -> Promise {
        let store = self.store.clone();
        future_to_promise(async move {
            let book = StatsBook::load(&store).await.map_err(to_js)?;
            let recent = book.recent_details(RECENT_DETAILS_LIMIT);
            serde_wasm_bindgen::to_value(&recent).map_err(to_js)
        })
    }

    /// Last successfully synced list, or null when nothing was cached yet
    pub fn cached_blocked_sites(&self) -> Promise {
        let blocklist = self.blocklist.clone();
        future_to_promise(async move {
            match blocklist.cached_blocked_sites().await {
                Some(sites) => serde_wasm_bindgen::to_value(&sites).map_err(to_js),
                None => Ok(JsValue::NULL),
            }
        })
    }

    pub fn server_stats(&self) -> Promise {
        let stats = self.stats.clone();
        future_to_promise(async move {
            let response = stats.server_stats().await.map_err(to_js)?;
            serde_wasm_bindgen::to_value(&response).map_err(to_js)
        })
    }

    pub fn server_blocking_history(&self) -> Promise {
        let stats = self.stats.clone();
        future_to_promise(async move {
            let history = stats.server_blocking_history().await.map_err(to_js)?;
            serde_wasm_bindgen::to_value(&history).map_err(to_js)
        })
    }

    pub fn sync_stats(&self) -> Promise {
        let stats = self.stats.clone();
        future_to_promise(async move {
            stats.sync_stats().await.map_err(to_js)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    pub fn push_blocking_history(&self) -> Promise {
        let stats = self.stats.clone();
        future_to_promise(async move {
            stats.push_blocking_history().await.map_err(to_js)?;
            Ok(JsValue::UNDEFINED)
        })
    }
}

async fn sync_best_effort(
    blocklist: &BlocklistService,
    local: Vec<BlockedSite>,
) -> Vec<BlockedSite> {
    match blocklist.sync_patterns().await {
        Ok(canonical) => canonical,
        Err(SyncError::NotLoggedIn) => local,
        Err(err) => {
            log::warn!("pattern sync failed: {err}");
            local
        }
    }
}

fn to_js(err: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&err.to_string())
}
