//! Advisory record lock client.
//!
//! A [`RecordLock`] lives as long as the view editing the record. `start` claims the record and
//! keeps the claim alive with periodic heartbeats while owned; `stop` cancels everything and
//! fires a best-effort release.

use std::sync::{Arc, Mutex, MutexGuard};

use calibra_core::locks::{
    AcquireResponse, LockConflict, LockState, LockStatus, LockTarget, UNKNOWN_HOLDER,
};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::ApiClient;
use crate::error::{ApiRetryClass, Result};
use crate::transport::{ApiRequest, ApiResponse};

struct LockInner {
    api: ApiClient,
    target: LockTarget,
    state: watch::Sender<LockState>,
}

pub struct RecordLock {
    inner: Arc<LockInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RecordLock {
    pub fn new(api: ApiClient, target: LockTarget) -> Self {
        let (state, _) = watch::channel(LockState::Idle);
        Self {
            inner: Arc::new(LockInner { api, target, state }),
            task: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &LockTarget {
        &self.inner.target
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims the record in the background. Returns false if already started for this mount.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut task = self.task();
        if task.is_some() {
            debug!("[Lock] {} already started", self.inner.target);
            return false;
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(inner.run()));
        true
    }

    /// Cancels acquire / heartbeat and releases the claim if one was made.
    ///
    /// The returned handle belongs to the release call; awaiting it is optional.
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        let task = self.task().take()?;
        task.abort();

        let previous = self.inner.state.send_replace(LockState::Idle);
        if previous.is_idle() {
            return None;
        }

        let api = self.inner.api.clone();
        let target = self.inner.target.clone();
        Some(tokio::spawn(release(api, target)))
    }

    pub fn state(&self) -> LockState {
        self.inner.state.borrow().clone()
    }

    pub fn status(&self) -> LockStatus {
        LockStatus::from(&*self.inner.state.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<LockState> {
        self.inner.state.subscribe()
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        let started = self.task().is_some();
        if started && tokio::runtime::Handle::try_current().is_ok() {
            let _ = self.stop();
        }
    }
}

impl LockInner {
    async fn run(self: Arc<Self>) {
        self.state.send_replace(LockState::Acquiring);
        match self.acquire().await {
            Ok(LockState::Owned) => {
                info!("[Lock] Acquired {}", self.target);
                self.state.send_replace(LockState::Owned);
            }
            Ok(state) => {
                info!("[Lock] {} is held elsewhere: {:?}", self.target, state);
                self.state.send_replace(state);
                return;
            }
            Err(err) => {
                warn!("[Lock] Failed to acquire {}: {}", self.target, err);
                self.state.send_replace(LockState::Idle);
                return;
            }
        }

        let interval = self.api.config().effective_heartbeat();
        loop {
            tokio::time::sleep(interval).await;
            match self.acquire().await {
                Ok(LockState::Owned) => debug!("[Lock] Heartbeat renewed {}", self.target),
                Ok(state) => {
                    info!("[Lock] Lost {} on heartbeat: {:?}", self.target, state);
                    self.state.send_replace(state);
                    break;
                }
                Err(err) => match err.retry_class() {
                    ApiRetryClass::Retryable => {
                        warn!("[Lock] Heartbeat failed for {}, retrying: {}", self.target, err);
                    }
                    ApiRetryClass::ReauthRequired => {
                        warn!("[Lock] Session ended, dropping claim on {}: {}", self.target, err);
                        self.state.send_replace(LockState::Idle);
                        break;
                    }
                    ApiRetryClass::Permanent => {
                        warn!("[Lock] Heartbeat rejected for {}: {}", self.target, err);
                        self.state.send_replace(LockState::Idle);
                        break;
                    }
                },
            }
        }
    }

    /// Issue one claim (initial or heartbeat).
    ///
    /// POST /locks/acquire
    async fn acquire(&self) -> Result<LockState> {
        let request = ApiRequest::post(self.api.config().acquire_lock_path.as_str())
            .json(serde_json::to_value(&self.target)?);
        let response = self.api.send(request).await?;
        let me = self.api.credentials().username();
        acquire_outcome(&response, me.as_deref())
    }
}

/// 409 / 423 means someone else holds the record. A 2xx is ours unless it reports the
/// record as locked by a different user than `me`.
fn acquire_outcome(response: &ApiResponse, me: Option<&str>) -> Result<LockState> {
    match response.status {
        409 | 423 => {
            let holder = response
                .json::<LockConflict>()
                .ok()
                .and_then(|conflict| conflict.locked_by)
                .filter(|holder| !holder.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_HOLDER.to_string());
            Ok(LockState::Blocked { locked_by: holder })
        }
        status if (200..300).contains(&status) => {
            let body = match response.json::<AcquireResponse>() {
                Ok(body) => body,
                Err(err) => {
                    debug!("[Lock] Acquire answered without a status body: {}", err);
                    return Ok(LockState::Owned);
                }
            };
            let holder = body
                .locked_by
                .filter(|holder| !holder.trim().is_empty());
            match (body.status.as_str(), holder, me) {
                ("locked", Some(holder), Some(me)) if holder != me => {
                    Ok(LockState::Blocked { locked_by: holder })
                }
                (status, holder, _) => {
                    debug!("[Lock] Acquire answered {} (holder {:?})", status, holder);
                    Ok(LockState::Owned)
                }
            }
        }
        _ => Err(response.to_error()),
    }
}

/// POST /locks/release. Failures are logged and dropped.
async fn release(api: ApiClient, target: LockTarget) {
    let body = match serde_json::to_value(&target) {
        Ok(body) => body,
        Err(err) => {
            warn!("[Lock] Could not encode release for {}: {}", target, err);
            return;
        }
    };
    let request = ApiRequest::post(api.config().release_lock_path.as_str())
        .json(body)
        .best_effort();
    match api.send(request).await {
        Ok(response) if response.is_success() => debug!("[Lock] Released {}", target),
        Ok(response) => warn!(
            "[Lock] Release of {} answered {}",
            target, response.status
        ),
        Err(err) => warn!("[Lock] Release of {} failed: {}", target, err),
    }
}
