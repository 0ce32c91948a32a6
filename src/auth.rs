/// Access-token lifecycle: persistence, expiry, coalesced refresh, session
use std::cell::RefCell;
use std::rc::Rc;

use chrono::Utc;
use futures::future::{FutureExt, LocalBoxFuture, Shared};
use log::{debug, warn};
use thiserror::Error;

use crate::api::{ApiClient, ApiError, RegistrationResponse, SessionInfo, TokenResponse};
use crate::storage::{keys, StorageError, Store};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

type RefreshFuture = Shared<LocalBoxFuture<'static, Option<String>>>;

/// Holds the persisted token triple (`token`, `refreshToken`, `tokenExpiry`)
/// and guards the refresh endpoint.
///
/// State machine: Absent → Valid → Expired → Refreshing → (Valid | Absent).
/// The `inflight` slot is what coalesces concurrent refreshes: all callers
/// that find a refresh under way await the same shared future instead of
/// issuing their own request, and the slot is cleared once it settles.
pub struct AuthManager {
    store: Store,
    api: Rc<dyn ApiClient>,
    inflight: RefCell<Option<RefreshFuture>>,
}

impl AuthManager {
    pub fn new(store: Store, api: Rc<dyn ApiClient>) -> AuthManager {
        AuthManager {
            store,
            api,
            inflight: RefCell::new(None),
        }
    }

    /// Produce a bearer token fit for use right now, or `None` when the user
    /// must log in again.
    ///
    /// - a stored, unexpired token is returned without touching the network
    /// - an expired token with a stored refresh token triggers exactly one
    ///   refresh request, shared with any concurrent caller
    /// - a failed refresh clears the whole triple (no automatic retry)
    /// - with nothing stored, resolves to `None` with zero network calls
    pub async fn get_valid_access_token(&self) -> Option<String> {
        let token: Option<String> = self.store.get_json(keys::TOKEN).await.ok().flatten();
        let expiry: Option<i64> = self.store.get_json(keys::TOKEN_EXPIRY).await.ok().flatten();

        if let (Some(token), Some(expiry)) = (token, expiry) {
            if Utc::now().timestamp_millis() < expiry {
                return Some(token);
            }
        }

        let refresh_token: String = self
            .store
            .get_json(keys::REFRESH_TOKEN)
            .await
            .ok()
            .flatten()?;

        let refresh = self.join_refresh(refresh_token);
        let token = refresh.await;
        self.inflight.borrow_mut().take();
        token
    }

    /// Return the in-flight refresh if there is one, otherwise start it.
    /// The check-and-insert is synchronous, so callers racing within the
    /// same turn of the event loop land on one future.
    fn join_refresh(&self, refresh_token: String) -> RefreshFuture {
        let mut slot = self.inflight.borrow_mut();
        if let Some(inflight) = slot.as_ref() {
            debug!("token refresh already in flight, joining");
            return inflight.clone();
        }

        let store = self.store.clone();
        let api = Rc::clone(&self.api);
        let refresh = async move { refresh_once(store, api, refresh_token).await }
            .boxed_local()
            .shared();
        *slot = Some(refresh.clone());
        refresh
    }

    /// `POST /api/auth/login`, then persist the token triple. With
    /// `remember` set the email is kept for pre-filling the login form.
    pub async fn login(&self, email: &str, password: &str, remember: bool) -> Result<(), AuthError> {
        let token = self.api.login(email, password).await?;
        persist_token(&self.store, &token).await?;

        if remember {
            self.store.set_json(keys::REMEMBERED_EMAIL, email).await?;
        } else {
            self.store.remove(keys::REMEMBERED_EMAIL).await?;
        }

        Ok(())
    }

    /// `POST /api/auth/register`. No tokens are issued at registration;
    /// any stale triple is dropped and the pending-verification markers set.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
    ) -> Result<RegistrationResponse, AuthError> {
        let response = self.api.register(email, password).await?;
        clear_credentials(&self.store).await?;

        if response.requires_verification {
            self.store.set_json(keys::PENDING_VERIFICATION, &true).await?;
            self.store
                .set_json(keys::PENDING_VERIFICATION_EMAIL, &response.email)
                .await?;
        }

        Ok(response)
    }

    /// Notify the backend and clear the stored triple. The local session
    /// ends even when the logout request fails.
    pub async fn logout(&self) -> Result<(), AuthError> {
        if let Some(token) = self.get_valid_access_token().await {
            if let Err(err) = self.api.logout(&token).await {
                warn!("logout request failed: {err}");
            }
        }
        clear_credentials(&self.store).await?;
        Ok(())
    }

    /// `GET /api/auth/session`. `None` means logged out, either because no
    /// token could be produced or because the check failed; a failed check
    /// is logged and otherwise treated as the free-tier default.
    pub async fn check_session(&self) -> Result<Option<SessionInfo>, AuthError> {
        let Some(token) = self.get_valid_access_token().await else {
            return Ok(None);
        };

        match self.api.session(&token).await {
            Ok(session) => {
                self.store
                    .set_json(keys::CACHED_PRO_STATUS, &session.is_paying)
                    .await?;
                Ok(Some(session))
            }
            Err(err) => {
                warn!("session check failed: {err}");
                Ok(None)
            }
        }
    }

    /// Cached paid-tier flag; false when logged out or never checked
    pub async fn is_paid_user(&self) -> bool {
        let token: Option<String> = self.store.get_json(keys::TOKEN).await.ok().flatten();
        if token.is_none() {
            return false;
        }
        self.store
            .get_json(keys::CACHED_PRO_STATUS)
            .await
            .ok()
            .flatten()
            .unwrap_or(false)
    }

    pub async fn remembered_email(&self) -> Option<String> {
        self.store
            .get_json(keys::REMEMBERED_EMAIL)
            .await
            .ok()
            .flatten()
    }
}

async fn refresh_once(store: Store, api: Rc<dyn ApiClient>, refresh_token: String) -> Option<String> {
    match api.refresh(&refresh_token).await {
        Ok(token) => {
            if let Err(err) = persist_token(&store, &token).await {
                warn!("failed to persist refreshed token: {err}");
            }
            Some(token.access_token)
        }
        Err(err) => {
            warn!("token refresh failed, clearing credentials: {err}");
            if let Err(err) = clear_credentials(&store).await {
                warn!("failed to clear credentials: {err}");
            }
            None
        }
    }
}

async fn persist_token(store: &Store, token: &TokenResponse) -> Result<(), StorageError> {
    store.set_json(keys::TOKEN, &token.access_token).await?;
    store
        .set_json(keys::REFRESH_TOKEN, &token.refresh_token)
        .await?;
    let expiry = Utc::now().timestamp_millis() + token.expires_in * 1000;
    store.set_json(keys::TOKEN_EXPIRY, &expiry).await
}

async fn clear_credentials(store: &Store) -> Result<(), StorageError> {
    store.remove(keys::TOKEN).await?;
    store.remove(keys::REFRESH_TOKEN).await?;
    store.remove(keys::TOKEN_EXPIRY).await
}
