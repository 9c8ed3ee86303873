//! Durable node settings
//!
//! Small typed layer over a [`StorageBackend`]. Keys are slash separated
//! paths such as `services/proxy-transport/current-router`.

use super::backend::{StorageBackend, StorageError};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

// ============================================================================
// KEYS
// ============================================================================

pub const KEY_CURRENT_ROUTER: &str = "services/proxy-transport/current-router";
pub const KEY_MY_ORIGINAL_IDENTITY: &str = "services/proxy-transport/my-original-identity";
pub const KEY_CURRENT_ROUTES: &str = "services/proxy-server/current-routes";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Value under {key} is not valid UTF-8")]
    NotUtf8 { key: String },

    #[error("Value under {key} is malformed: {reason}")]
    Malformed { key: String, reason: String },
}

// ============================================================================
// SETTINGS STORE
// ============================================================================

#[derive(Clone)]
pub struct SettingsStore {
    backend: Arc<dyn StorageBackend>,
}

impl SettingsStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Store backed by process memory only.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(super::backend::MemoryStorage::new()))
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>, SettingsError> {
        let Some(raw) = self.backend.get(key.as_bytes())? else {
            return Ok(None);
        };
        String::from_utf8(raw)
            .map(Some)
            .map_err(|_| SettingsError::NotUtf8 {
                key: key.to_string(),
            })
    }

    pub fn set_string(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.backend.put(key.as_bytes(), value.as_bytes())?;
        self.flush()
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SettingsError> {
        let Some(text) = self.get_string(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| SettingsError::Malformed {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), SettingsError> {
        let text = serde_json::to_string(value).map_err(|e| SettingsError::Malformed {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.set_string(key, &text)
    }

    pub fn remove(&self, key: &str) -> Result<(), SettingsError> {
        self.backend.remove(key.as_bytes())?;
        self.flush()
    }

    fn flush(&self) -> Result<(), SettingsError> {
        self.backend.flush().map_err(|e| {
            error!("Settings flush failed: {}", e);
            SettingsError::from(e)
        })
    }
}

impl std::fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsStore").finish_non_exhaustive()
    }
}
