//! Editable drafts persisted by autosave.

mod canonical;

pub use canonical::{
    canonical_string, canonicalize, coerce_decimal, CanonicalRules, Fingerprint,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;

/// Quiet period before an edited draft is persisted.
pub const DEFAULT_DEBOUNCE_MS: u64 = 1_000;

/// In-memory state of one editable record.
///
/// `to_payload` must only contain user-authored fields. Derived values written by
/// [`DraftModel::apply_computed`] are never part of the payload, otherwise applying the
/// server answer would itself look like an edit.
pub trait DraftModel: Clone + Send + Sync + 'static {
    /// Builds the model from the stored representation; `Value::Null` means never saved.
    fn from_stored(stored: &Value) -> Result<Self>;

    fn to_payload(&self) -> Value;

    /// Refreshes locally computable derived fields after an edit.
    fn recompute_estimates(&mut self) {}

    /// Overwrites derived fields with the values computed by the server.
    fn apply_computed(&mut self, computed: &Value);

    /// Invalidates values that depend on the shape of the draft (rows added/removed).
    fn structure_changed(&mut self) {}
}

/// Autosave indicator: `idle → saving → {saved, error} → idle` on the next edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveStatus {
    Idle,
    Saving,
    Saved,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveState {
    pub status: SaveStatus,
    pub saved_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for SaveState {
    fn default() -> Self {
        Self {
            status: SaveStatus::Idle,
            saved_at: None,
            last_error: None,
        }
    }
}

/// Last representation known to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftSnapshot {
    pub fingerprint: Fingerprint,
    pub recorded_at: DateTime<Utc>,
}

impl DraftSnapshot {
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The draft was never loaded (or loading was discarded).
    NotLoaded,
    /// Nothing was typed since the draft was loaded.
    NoUserEdits,
    /// The canonical payload matches the last persisted fingerprint.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    Skipped(SkipReason),
}
