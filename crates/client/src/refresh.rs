//! Single-flight coordination for access-token refresh.
//!
//! The first caller that sees an expired token becomes the initiator and holds a
//! [`RefreshLease`]. Every caller that arrives while the lease is alive is queued and woken,
//! in arrival order, with the outcome of that one refresh.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};
use tokio::sync::oneshot;

/// Why the shared refresh failed. Cloned to every queued caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshFailure {
    pub status: Option<u16>,
    pub message: String,
}

impl RefreshFailure {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Display for RefreshFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {})", self.message, status),
            None => f.write_str(&self.message),
        }
    }
}

type RefreshOutcome = Result<String, RefreshFailure>;

#[derive(Default)]
struct GateState {
    refreshing: bool,
    pending: Vec<oneshot::Sender<RefreshOutcome>>,
}

/// Shared refresh flag plus the queue of callers waiting on it.
#[derive(Clone, Default)]
pub struct RefreshGate {
    state: Arc<Mutex<GateState>>,
}

/// What a caller gets when it asks to refresh.
pub enum RefreshTicket {
    /// This caller performs the refresh.
    Initiator(RefreshLease),
    /// Another refresh is running; await its outcome.
    Waiter(oneshot::Receiver<RefreshOutcome>),
}

/// Held by the one caller performing the refresh. Dropping it unresolved fails every waiter.
pub struct RefreshLease {
    gate: RefreshGate,
    resolved: bool,
}

impl RefreshGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        // Never held across an await; a poisoned lock still has consistent state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Atomically become the initiator or join the queue.
    pub fn begin_refresh(&self) -> RefreshTicket {
        let mut state = self.lock();
        if state.refreshing {
            let (tx, rx) = oneshot::channel();
            state.pending.push(tx);
            debug!("[Auth] Refresh in flight, queued caller #{}", state.pending.len());
            return RefreshTicket::Waiter(rx);
        }
        state.refreshing = true;
        RefreshTicket::Initiator(RefreshLease {
            gate: self.clone(),
            resolved: false,
        })
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock().refreshing
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Clears the flag before waking anyone, so a woken caller can start a new refresh.
    fn resolve(&self, outcome: RefreshOutcome) {
        let pending = {
            let mut state = self.lock();
            state.refreshing = false;
            std::mem::take(&mut state.pending)
        };
        for waiter in pending {
            // Receiver gone means that caller was cancelled.
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl RefreshLease {
    pub fn complete_refresh(mut self, access_token: &str) {
        self.resolved = true;
        self.gate.resolve(Ok(access_token.to_string()));
    }

    pub fn fail_refresh(mut self, failure: RefreshFailure) {
        self.resolved = true;
        self.gate.resolve(Err(failure));
    }
}

impl Drop for RefreshLease {
    fn drop(&mut self) {
        if !self.resolved {
            warn!("[Auth] Token refresh abandoned before completion");
            self.gate
                .resolve(Err(RefreshFailure::new(None, "refresh abandoned")));
        }
    }
}
