//! Process-wide credential holder.
//!
//! The in-memory copy is authoritative for the running process and is written before the
//! backing [`SecretStore`]; a persistence failure is logged and does not undo the change.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use calibra_core::secrets::{
    MemorySecretStore, SecretStore, ACCESS_TOKEN_KEY, REDIRECT_PATH_KEY, REFRESH_TOKEN_KEY,
    USERNAME_KEY,
};
use calibra_core::session::{CredentialPair, SessionEvent};
use log::{debug, error};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Default, Clone)]
struct Tokens {
    access: Option<String>,
    refresh: Option<String>,
    username: Option<String>,
}

struct CredentialInner {
    secrets: Arc<dyn SecretStore>,
    tokens: RwLock<Tokens>,
    events: broadcast::Sender<SessionEvent>,
}

/// Shared handle; clones see the same tokens and the same event channel.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<CredentialInner>,
}

impl CredentialStore {
    /// Restores tokens persisted by a previous session.
    pub fn load(secrets: Arc<dyn SecretStore>) -> calibra_core::Result<Self> {
        let tokens = Tokens {
            access: secrets.get_secret(ACCESS_TOKEN_KEY)?,
            refresh: secrets.get_secret(REFRESH_TOKEN_KEY)?,
            username: secrets.get_secret(USERNAME_KEY)?,
        };
        if tokens.access.is_some() {
            debug!("[Auth] Restored persisted session");
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(CredentialInner {
                secrets,
                tokens: RwLock::new(tokens),
                events,
            }),
        })
    }

    /// Empty store backed by process memory.
    pub fn in_memory() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(CredentialInner {
                secrets: Arc::new(MemorySecretStore::new()),
                tokens: RwLock::new(Tokens::default()),
                events,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Tokens> {
        self.inner
            .tokens
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tokens> {
        self.inner
            .tokens
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn access_token(&self) -> Option<String> {
        self.read().access.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read().refresh.clone()
    }

    /// The live pair, if both tokens are present.
    pub fn pair(&self) -> Option<CredentialPair> {
        let tokens = self.read();
        match (&tokens.access, &tokens.refresh) {
            (Some(access), Some(refresh)) => Some(CredentialPair::new(access, refresh)),
            _ => None,
        }
    }

    /// Replaces both tokens in one step.
    pub fn replace(&self, pair: &CredentialPair) {
        {
            let mut tokens = self.write();
            tokens.access = Some(pair.access_token.clone());
            tokens.refresh = Some(pair.refresh_token.clone());
        }
        self.persist(ACCESS_TOKEN_KEY, Some(&pair.access_token));
        self.persist(REFRESH_TOKEN_KEY, Some(&pair.refresh_token));
    }

    /// Stores an access token on its own, leaving any refresh token untouched.
    pub fn set_access_token(&self, access_token: &str) {
        self.write().access = Some(access_token.to_string());
        self.persist(ACCESS_TOKEN_KEY, Some(access_token));
    }

    /// Who the session belongs to, as given at login.
    pub fn username(&self) -> Option<String> {
        self.read().username.clone()
    }

    pub fn set_username(&self, username: &str) {
        self.write().username = Some(username.to_string());
        self.persist(USERNAME_KEY, Some(username));
    }

    /// Drops both tokens and the username. Returns false when there was nothing to clear.
    pub fn clear(&self) -> bool {
        let previous = std::mem::take(&mut *self.write());
        self.persist(ACCESS_TOKEN_KEY, None);
        self.persist(REFRESH_TOKEN_KEY, None);
        self.persist(USERNAME_KEY, None);
        previous.access.is_some() || previous.refresh.is_some()
    }

    pub fn set_redirect_path(&self, path: &str) {
        self.persist(REDIRECT_PATH_KEY, Some(path));
    }

    /// Returns the post-login destination and forgets it.
    pub fn take_redirect_path(&self) -> Option<String> {
        let path = match self.inner.secrets.get_secret(REDIRECT_PATH_KEY) {
            Ok(path) => path,
            Err(err) => {
                error!("[Auth] Failed to read post-login redirect: {}", err);
                return None;
            }
        };
        if path.is_some() {
            self.persist(REDIRECT_PATH_KEY, None);
        }
        path
    }

    /// Broadcasts to current subscribers; having none is not an error.
    pub fn publish(&self, event: SessionEvent) {
        debug!("[Auth] Emitting {}", event.name());
        let _ = self.inner.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    fn persist(&self, key: &str, value: Option<&str>) {
        let result = match value {
            Some(value) => self.inner.secrets.set_secret(key, value),
            None => self.inner.secrets.delete_secret(key),
        };
        if let Err(err) = result {
            error!("[Auth] Failed to persist {}: {}", key, err);
        }
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::in_memory()
    }
}
