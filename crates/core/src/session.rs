//! Session credentials and the notifications emitted when they change.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Notification name emitted when the session ends.
pub const AUTH_LOGOUT: &str = "auth-logout";
/// Notification name emitted after a successful token refresh.
pub const AUTH_TOKEN_REFRESHED: &str = "auth-token-refreshed";

/// Access + refresh token of the current session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

#[derive(Deserialize)]
struct ExpiryClaims {
    exp: Option<i64>,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// Expiry of the access token, when it is a JWT carrying an `exp` claim.
    ///
    /// The signature is not verified; the value only drives the expiry countdown.
    pub fn access_expires_at(&self) -> Option<DateTime<Utc>> {
        let payload = self.access_token.split('.').nth(1)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .ok()?;
        let claims: ExpiryClaims = serde_json::from_slice(&bytes).ok()?;
        DateTime::from_timestamp(claims.exp?, 0)
    }

    /// Seconds left before the access token expires (negative once expired).
    pub fn seconds_until_expiry(&self, now: DateTime<Utc>) -> Option<i64> {
        self.access_expires_at()
            .map(|expires_at| (expires_at - now).num_seconds())
    }
}

/// Why a session was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoutReason {
    /// Access token rejected and no refresh token available.
    TokenExpired,
    /// The refresh call itself failed.
    RefreshFailed,
    /// Explicit logout from the user.
    UserLogout,
}

impl LogoutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenExpired => "token_expired",
            Self::RefreshFailed => "refresh_failed",
            Self::UserLogout => "user_logout",
        }
    }
}

impl fmt::Display for LogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collaborator-facing session notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum SessionEvent {
    #[serde(rename = "auth-logout")]
    LoggedOut { reason: LogoutReason },
    #[serde(rename = "auth-token-refreshed")]
    TokenRefreshed { pair: CredentialPair },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoggedOut { .. } => AUTH_LOGOUT,
            Self::TokenRefreshed { .. } => AUTH_TOKEN_REFRESHED,
        }
    }
}
