//! Client configuration.

use std::time::Duration;

use calibra_core::drafts::DEFAULT_DEBOUNCE_MS;
use calibra_core::locks::DEFAULT_HEARTBEAT_INTERVAL_SECS;

/// Lab API used when `CALIBRA_API_URL` is not set.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8088";

/// Default timeout for API requests.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub login_path: String,
    pub refresh_path: String,
    pub acquire_lock_path: String,
    pub release_lock_path: String,
    /// Post-login destination for a record; `{id}` is replaced by the record id.
    pub redirect_template: String,
    pub lock_heartbeat: Duration,
    /// Server-side lock expiry, when agreed with the backend.
    pub lock_ttl: Option<Duration>,
    pub autosave_debounce: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_API_URL)
    }
}

fn env_trimmed(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = env_trimmed(name)?;
    match raw.parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("[Config] Ignoring {}={:?}: not a number", name, raw);
            None
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            login_path: "/auth/login".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            acquire_lock_path: "/locks/acquire".to_string(),
            release_lock_path: "/locks/release".to_string(),
            redirect_template: "/records/{id}".to_string(),
            lock_heartbeat: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            lock_ttl: None,
            autosave_debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
        }
    }

    /// Reads `CALIBRA_*` overrides on top of the defaults.
    pub fn from_env() -> Self {
        let mut config =
            Self::new(&env_trimmed("CALIBRA_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()));
        if let Some(secs) = env_u64("CALIBRA_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("CALIBRA_LOCK_HEARTBEAT_SECS") {
            config.lock_heartbeat = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("CALIBRA_LOCK_TTL_SECS") {
            config.lock_ttl = Some(Duration::from_secs(secs));
        }
        if let Some(ms) = env_u64("CALIBRA_AUTOSAVE_DEBOUNCE_MS") {
            config.autosave_debounce = Duration::from_millis(ms);
        }
        config
    }

    /// Heartbeat interval, clamped so the claim is renewed at least twice per TTL.
    pub fn effective_heartbeat(&self) -> Duration {
        match self.lock_ttl {
            Some(ttl) if !ttl.is_zero() => self.lock_heartbeat.min(ttl / 2),
            _ => self.lock_heartbeat,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Login and refresh calls never go through the refresh protocol.
    pub fn is_auth_endpoint(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        path == self.login_path || path == self.refresh_path
    }

    pub fn redirect_path_for(&self, record_id: &str) -> String {
        self.redirect_template
            .replace("{id}", &urlencoding::encode(record_id))
    }
}
