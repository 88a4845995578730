//! In-memory state of the mock lab backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use calibra_core::locks::LockTarget;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::ServerConfig;

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

struct AccessGrant {
    username: String,
    expires_at: Instant,
}

/// Issued tokens. Refresh tokens are single use.
#[derive(Default)]
pub struct SessionTable {
    access: HashMap<String, AccessGrant>,
    refresh: HashMap<String, String>,
}

impl SessionTable {
    /// Unsigned JWT-shaped token so clients can read `exp`.
    fn access_token_for(username: &str, ttl: Duration) -> String {
        let exp = Utc::now().timestamp() + ttl.as_secs() as i64;
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none","typ":"JWT"}"#);
        let claims = URL_SAFE_NO_PAD.encode(
            json!({ "sub": username, "exp": exp, "jti": Uuid::new_v4().to_string() }).to_string(),
        );
        format!("{}.{}.mock", header, claims)
    }

    /// Mints a new pair and forgets access grants that have already expired.
    pub fn issue(&mut self, username: &str, ttl: Duration, now: Instant) -> TokenPair {
        self.access.retain(|_, grant| grant.expires_at > now);
        let access_token = Self::access_token_for(username, ttl);
        let refresh_token = Uuid::new_v4().to_string();
        self.access.insert(
            access_token.clone(),
            AccessGrant {
                username: username.to_string(),
                expires_at: now + ttl,
            },
        );
        self.refresh
            .insert(refresh_token.clone(), username.to_string());
        TokenPair {
            access_token,
            refresh_token,
        }
    }

    pub fn authenticate(&self, access_token: &str, now: Instant) -> Option<&str> {
        self.access
            .get(access_token)
            .filter(|grant| grant.expires_at > now)
            .map(|grant| grant.username.as_str())
    }

    /// Exchanges a refresh token for a new pair; the old refresh token stops working.
    pub fn rotate(&mut self, refresh_token: &str, ttl: Duration, now: Instant) -> Option<TokenPair> {
        let username = self.refresh.remove(refresh_token)?;
        Some(self.issue(&username, ttl, now))
    }

    /// Expires every access token; refresh tokens keep working.
    pub fn revoke_access_tokens(&mut self) {
        self.access.clear();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LockEntry {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
    #[serde(skip)]
    pub expires_at: Instant,
}

/// Advisory locks; an entry past `expires_at` counts as free.
#[derive(Default)]
pub struct LockTable {
    entries: HashMap<LockTarget, LockEntry>,
}

impl LockTable {
    /// Claims or renews `target` for `user`. Returns the current holder on conflict.
    pub fn acquire(
        &mut self,
        target: &LockTarget,
        user: &str,
        ttl: Duration,
        now: Instant,
    ) -> Result<LockEntry, String> {
        let renewed_at = Utc::now();
        if let Some(entry) = self.entries.get_mut(target) {
            if entry.expires_at > now {
                if entry.holder != user {
                    return Err(entry.holder.clone());
                }
                entry.renewed_at = renewed_at;
                entry.expires_at = now + ttl;
                return Ok(entry.clone());
            }
        }

        let entry = LockEntry {
            holder: user.to_string(),
            acquired_at: renewed_at,
            renewed_at,
            expires_at: now + ttl,
        };
        self.entries.insert(target.clone(), entry.clone());
        Ok(entry)
    }

    /// Only the holder can release. Returns whether an entry was removed.
    pub fn release(&mut self, target: &LockTarget, user: &str) -> bool {
        match self.entries.get(target) {
            Some(entry) if entry.holder == user => {
                self.entries.remove(target);
                true
            }
            _ => false,
        }
    }

    pub fn holder(&self, target: &LockTarget, now: Instant) -> Option<&str> {
        self.entries
            .get(target)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.holder.as_str())
    }
}

pub struct AppState {
    pub config: ServerConfig,
    sessions: Mutex<SessionTable>,
    locks: Mutex<LockTable>,
    drafts: RwLock<HashMap<(String, String), Value>>,
    refresh_calls: AtomicUsize,
    draft_saves: AtomicUsize,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(SessionTable::default()),
            locks: Mutex::new(LockTable::default()),
            drafts: RwLock::new(HashMap::new()),
            refresh_calls: AtomicUsize::new(0),
            draft_saves: AtomicUsize::new(0),
        }
    }

    pub fn sessions(&self) -> MutexGuard<'_, SessionTable> {
        lock_or_recover(&self.sessions)
    }

    pub fn locks(&self) -> MutexGuard<'_, LockTable> {
        lock_or_recover(&self.locks)
    }

    pub fn login(&self, username: &str, password: &str) -> Option<TokenPair> {
        if username.trim().is_empty() || password != self.config.demo_password {
            return None;
        }
        Some(
            self.sessions()
                .issue(username, self.config.access_ttl, Instant::now()),
        )
    }

    pub fn refresh(&self, refresh_token: &str) -> Option<TokenPair> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.sessions()
            .rotate(refresh_token, self.config.access_ttl, Instant::now())
    }

    pub fn authenticate(&self, access_token: &str) -> Option<String> {
        self.sessions()
            .authenticate(access_token, Instant::now())
            .map(str::to_string)
    }

    pub fn revoke_access_tokens(&self) {
        self.sessions().revoke_access_tokens();
    }

    pub fn draft(&self, kind: &str, id: &str) -> Option<Value> {
        let drafts = self
            .drafts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        drafts.get(&(kind.to_string(), id.to_string())).cloned()
    }

    pub fn store_draft(&self, kind: &str, id: &str, stored: Value) {
        self.draft_saves.fetch_add(1, Ordering::SeqCst);
        let mut drafts = self
            .drafts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        drafts.insert((kind.to_string(), id.to_string()), stored);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn draft_saves(&self) -> usize {
        self.draft_saves.load(Ordering::SeqCst)
    }
}
