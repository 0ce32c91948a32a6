/// Awaitable key-value access to the extension's persisted state
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Storage keys. One key, one value; reads and writes are single-key atomic
/// and nothing here assumes a multi-key transaction.
pub mod keys {
    pub const BLOCKED_SITES: &str = "blockedSites";
    pub const IS_BLOCKING: &str = "isBlocking";
    pub const TAB_STATS: &str = "tabStats";
    pub const DAILY_STATS: &str = "dailyStats";
    pub const BLOCKED_PATTERNS: &str = "blockedPatterns";
    pub const BLOCKED_DETAILS: &str = "blockedDetails";
    pub const TOKEN: &str = "token";
    pub const REFRESH_TOKEN: &str = "refreshToken";
    pub const TOKEN_EXPIRY: &str = "tokenExpiry";
    pub const CACHED_PRO_STATUS: &str = "cachedProStatus";
    pub const CACHED_BLOCKED_SITES: &str = "cachedBlockedSites";
    pub const LAST_SYNC_TIME: &str = "lastSyncTime";
    pub const SETTINGS: &str = "settings";
    pub const REMEMBERED_EMAIL: &str = "rememberedEmail";
    pub const PENDING_VERIFICATION: &str = "pendingVerification";
    pub const PENDING_VERIFICATION_EMAIL: &str = "pendingVerificationEmail";
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("failed to decode `{key}`: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A single browser storage area (chrome.storage.local in the extension,
/// an in-memory map in tests). Futures are `?Send`: everything runs on the
/// single-threaded extension event loop.
#[async_trait(?Send)]
pub trait StorageArea {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Typed handle over a [`StorageArea`]; cheap to clone
#[derive(Clone)]
pub struct Store {
    area: Rc<dyn StorageArea>,
}

impl Store {
    pub fn new(area: Rc<dyn StorageArea>) -> Store {
        Store { area }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.area.get(key).await? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StorageError::Decode {
                    key: key.to_string(),
                    source,
                }),
        }
    }

    /// Like [`Store::get_json`], but a missing key yields `T::default()`
    pub async fn get_or_default<T: DeserializeOwned + Default>(
        &self,
        key: &str,
    ) -> Result<T, StorageError> {
        Ok(self.get_json(key).await?.unwrap_or_default())
    }

    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let value = serde_json::to_value(value).map_err(|source| StorageError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.area.set(key, value).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.area.remove(key).await
    }

    pub async fn settings(&self) -> Result<Settings, StorageError> {
        self.get_or_default(keys::SETTINGS).await
    }

    pub async fn set_settings(&self, settings: &Settings) -> Result<(), StorageError> {
        self.set_json(keys::SETTINGS, settings).await
    }
}

/// User-tunable switches persisted under the `settings` key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub enable_badges: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            enable_badges: true,
        }
    }
}

/// In-memory storage area for native tests
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RefCell<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }
}

#[async_trait(?Send)]
impl StorageArea for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.entries.borrow_mut().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }
}
