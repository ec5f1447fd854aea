//! Credential storage for MCP servers.
//!
//! Each server id owns two entries: the bare access token sent as a bearer
//! header, and the full OAuth grant (serialized as JSON) that refreshing
//! needs. Entries live in the platform keyring, or in a process-local map
//! when the keyring is disabled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use keyring::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const KEYRING_SERVICE: &str = "toolrelay-mcp";

#[derive(Debug, Error)]
pub enum TokenStoreError {
    /// The credential backend is locked or temporarily unreachable.
    #[error("keyring unavailable: {0}")]
    KeyringUnavailable(#[source] keyring::Error),
    #[error("keyring error: {0}")]
    Keyring(#[source] keyring::Error),
    #[error("stored OAuth grant for '{server_id}' is unreadable: {source}")]
    CorruptGrant {
        server_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode OAuth grant: {0}")]
    Encode(#[source] serde_json::Error),
}

impl TokenStoreError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TokenStoreError::KeyringUnavailable(_))
    }
}

impl From<keyring::Error> for TokenStoreError {
    fn from(err: keyring::Error) -> Self {
        match err {
            keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_) => {
                TokenStoreError::KeyringUnavailable(err)
            }
            other => TokenStoreError::Keyring(other),
        }
    }
}

/// Tokens and endpoints obtained from an OAuth authorization-code exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpOAuthGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub expires_at_epoch_s: Option<i64>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    AccessToken,
    Grant,
}

impl Slot {
    fn key(self, server_id: &str) -> String {
        match self {
            Slot::AccessToken => server_id.to_string(),
            Slot::Grant => format!("{server_id}:oauth"),
        }
    }
}

#[derive(Debug, Clone)]
enum Backend {
    Keyring,
    Memory(Arc<Mutex<HashMap<String, String>>>),
}

/// Cheap to clone; clones of an in-memory store share their entries.
#[derive(Debug, Clone)]
pub struct McpTokenStore {
    backend: Backend,
}

impl Default for McpTokenStore {
    fn default() -> Self {
        Self::new_with_keyring(true)
    }
}

impl McpTokenStore {
    pub fn new_with_keyring(use_keyring: bool) -> Self {
        let backend = if use_keyring {
            Backend::Keyring
        } else {
            Backend::Memory(Arc::default())
        };
        Self { backend }
    }

    pub fn access_token(&self, server_id: &str) -> Result<Option<String>, TokenStoreError> {
        self.load(&Slot::AccessToken.key(server_id))
    }

    pub fn store_access_token(&self, server_id: &str, token: &str) -> Result<(), TokenStoreError> {
        self.save(&Slot::AccessToken.key(server_id), token)
    }

    pub fn grant(&self, server_id: &str) -> Result<Option<McpOAuthGrant>, TokenStoreError> {
        let Some(raw) = self.load(&Slot::Grant.key(server_id))? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| TokenStoreError::CorruptGrant {
                server_id: server_id.to_string(),
                source,
            })
    }

    pub fn store_grant(&self, server_id: &str, grant: &McpOAuthGrant) -> Result<(), TokenStoreError> {
        let raw = serde_json::to_string(grant).map_err(TokenStoreError::Encode)?;
        self.save(&Slot::Grant.key(server_id), &raw)
    }

    /// Drop both the grant and the access token. Returns whether anything
    /// was stored.
    pub fn forget(&self, server_id: &str) -> Result<bool, TokenStoreError> {
        let mut removed = false;
        for slot in [Slot::Grant, Slot::AccessToken] {
            removed |= self.delete(&slot.key(server_id))?;
        }
        Ok(removed)
    }

    fn load(&self, key: &str) -> Result<Option<String>, TokenStoreError> {
        match &self.backend {
            Backend::Memory(map) => Ok(lock(map).get(key).cloned()),
            Backend::Keyring => match Entry::new(KEYRING_SERVICE, key)?.get_password() {
                Ok(value) => Ok(Some(value)),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(err) => Err(err.into()),
            },
        }
    }

    fn save(&self, key: &str, value: &str) -> Result<(), TokenStoreError> {
        match &self.backend {
            Backend::Memory(map) => {
                lock(map).insert(key.to_string(), value.to_string());
                Ok(())
            }
            Backend::Keyring => Ok(Entry::new(KEYRING_SERVICE, key)?.set_password(value)?),
        }
    }

    fn delete(&self, key: &str) -> Result<bool, TokenStoreError> {
        match &self.backend {
            Backend::Memory(map) => Ok(lock(map).remove(key).is_some()),
            Backend::Keyring => match Entry::new(KEYRING_SERVICE, key)?.delete_credential() {
                Ok(()) => Ok(true),
                Err(keyring::Error::NoEntry) => Ok(false),
                Err(err) => Err(err.into()),
            },
        }
    }
}

fn lock(map: &Mutex<HashMap<String, String>>) -> MutexGuard<'_, HashMap<String, String>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
