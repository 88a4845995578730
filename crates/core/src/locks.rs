//! Advisory record locks: targets, client-side states and wire shapes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Heartbeat cadence for renewing an owned lock.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 120;

/// Holder name shown when the server reports a conflict without naming the holder.
pub const UNKNOWN_HOLDER: &str = "another user";

/// The record a lock is claimed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockTarget {
    pub entity_type: String,
    pub entity_id: String,
}

impl LockTarget {
    pub fn new(entity_type: impl Into<String>, entity_id: impl fmt::Display) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.to_string(),
        }
    }
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// Client-side lock lifecycle: `Idle → Acquiring → {Owned, Blocked} → Idle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Acquiring,
    Owned,
    Blocked { locked_by: String },
}

impl LockState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// What a view needs to decide whether editing controls are enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub is_locked: bool,
    pub locked_by: Option<String>,
    pub is_loading: bool,
}

impl From<&LockState> for LockStatus {
    fn from(state: &LockState) -> Self {
        match state {
            LockState::Idle | LockState::Owned => Self {
                is_locked: false,
                locked_by: None,
                is_loading: false,
            },
            LockState::Acquiring => Self {
                is_locked: false,
                locked_by: None,
                is_loading: true,
            },
            LockState::Blocked { locked_by } => Self {
                is_locked: true,
                locked_by: Some(locked_by.clone()),
                is_loading: false,
            },
        }
    }
}

/// Successful answer of `POST /locks/acquire`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
}

/// Error body of a conflicting acquire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConflict {
    #[serde(default)]
    pub locked_by: Option<String>,
}
