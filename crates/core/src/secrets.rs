//! Persistent key/value storage for session secrets.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::errors::{Error, Result};

/// Storage key for the current access token.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Storage key for the current refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
/// Storage key for the name the current session signed in with.
pub const USERNAME_KEY: &str = "username";
/// Storage key for the path to open after the next successful login.
pub const REDIRECT_PATH_KEY: &str = "post_login_redirect";

/// Key/value store scoped to the user profile.
///
/// Implementations must be cheap to call from async code: every method is expected to
/// complete without awaiting (local database, keyring, memory).
pub trait SecretStore: Send + Sync {
    fn get_secret(&self, key: &str) -> Result<Option<String>>;
    fn set_secret(&self, key: &str, value: &str) -> Result<()>;
    fn delete_secret(&self, key: &str) -> Result<()>;
}

/// Process-local store used by tests and short-lived sessions.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get_secret(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .read()
            .map_err(|_| Error::secret("memory store lock poisoned"))?;
        Ok(values.get(key).cloned())
    }

    fn set_secret(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| Error::secret("memory store lock poisoned"))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete_secret(&self, key: &str) -> Result<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| Error::secret("memory store lock poisoned"))?;
        values.remove(key);
        Ok(())
    }
}
