//! Debounced autosave for one editable record.
//!
//! The controller owns the in-memory model. Only [`AutosaveController::edit`] and
//! [`AutosaveController::edit_structure`] mark the draft as user-edited; loading never does.
//! A save goes out only when the draft is loaded, has user edits, and its canonical payload
//! fingerprint differs from the last persisted one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use calibra_core::drafts::{
    canonicalize, CanonicalRules, DraftModel, DraftSnapshot, Fingerprint, SaveOutcome, SaveState,
    SaveStatus, SkipReason,
};
use chrono::Utc;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::ApiClient;
use crate::error::{ClientError, Result};
use crate::transport::ApiRequest;

const NOT_FOUND: u16 = 404;

/// Where a draft is read from and written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftEndpoints {
    pub load_path: String,
    pub save_path: String,
}

impl DraftEndpoints {
    pub fn new(load_path: impl Into<String>, save_path: impl Into<String>) -> Self {
        Self {
            load_path: load_path.into(),
            save_path: save_path.into(),
        }
    }

    /// `GET /drafts/{kind}/{id}` + `POST /drafts/{kind}/{id}/draft`
    pub fn draft(kind: &str, id: &str) -> Self {
        let base = format!(
            "/drafts/{}/{}",
            urlencoding::encode(kind),
            urlencoding::encode(id)
        );
        Self::new(base.clone(), format!("{}/draft", base))
    }

    /// `GET /drafts/{kind}/{id}` + `POST /drafts/{kind}/{id}/calculate`
    pub fn calculate(kind: &str, id: &str) -> Self {
        let draft = Self::draft(kind, id);
        let save_path = format!("{}/calculate", draft.load_path);
        Self::new(draft.load_path, save_path)
    }
}

struct DraftState<M> {
    model: Option<M>,
    loaded: bool,
    user_edited: bool,
    snapshot: Option<DraftSnapshot>,
}

struct AutosaveInner<M> {
    api: ApiClient,
    endpoints: DraftEndpoints,
    rules: CanonicalRules,
    draft: Mutex<DraftState<M>>,
    status: watch::Sender<SaveState>,
    revision: watch::Sender<u64>,
    /// Serializes persists so a save never races another save of the same draft.
    persist: tokio::sync::Mutex<()>,
    /// Bumped by `stop`; a load that started under an older generation is discarded.
    generation: AtomicU64,
}

pub struct AutosaveController<M: DraftModel> {
    inner: Arc<AutosaveInner<M>>,
    debounce: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<M: DraftModel> AutosaveController<M> {
    pub fn new(api: ApiClient, endpoints: DraftEndpoints, rules: CanonicalRules) -> Self {
        let debounce = api.config().autosave_debounce;
        let (status, _) = watch::channel(SaveState::default());
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(AutosaveInner {
                api,
                endpoints,
                rules,
                draft: Mutex::new(DraftState {
                    model: None,
                    loaded: false,
                    user_edited: false,
                    snapshot: None,
                }),
                status,
                revision,
                persist: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
            debounce,
            task: Mutex::new(None),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fetches the stored draft and seeds the snapshot from it.
    ///
    /// A 404 means the record was never saved: the model is built from `null` and no snapshot
    /// is recorded.
    pub async fn load(&self) -> Result<()> {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let response = self
            .inner
            .api
            .send(ApiRequest::get(self.inner.endpoints.load_path.as_str()))
            .await?;

        let stored = if response.status == NOT_FOUND {
            None
        } else {
            Some(response.into_result()?.json::<Value>()?)
        };
        let model = M::from_stored(stored.as_ref().unwrap_or(&Value::Null))?;

        if self.inner.generation.load(Ordering::SeqCst) != generation {
            return Err(ClientError::cancelled(format!(
                "load of {} discarded",
                self.inner.endpoints.load_path
            )));
        }

        let snapshot = stored.map(|_| {
            DraftSnapshot::new(Fingerprint::of_payload(&model.to_payload(), &self.inner.rules))
        });
        debug!(
            "[Autosave] Loaded {} (snapshot: {})",
            self.inner.endpoints.load_path,
            snapshot
                .as_ref()
                .map(|s| s.fingerprint.as_str())
                .unwrap_or("none")
        );

        *self.inner.lock_draft() = DraftState {
            model: Some(model),
            loaded: true,
            user_edited: false,
            snapshot,
        };
        self.inner.status.send_replace(SaveState::default());
        Ok(())
    }

    /// Starts the debounce loop. Returns false if already running.
    pub fn start(&self) -> bool {
        let mut task = self.task();
        if task.is_some() {
            return false;
        }
        let revisions = self.inner.revision.subscribe();
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(inner.debounce_loop(revisions, self.debounce)));
        true
    }

    /// Stops the debounce loop and discards any load still in flight.
    pub fn stop(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.task().take() {
            task.abort();
        }
    }

    /// Applies a user edit. Returns false if nothing is loaded yet.
    pub fn edit(&self, apply: impl FnOnce(&mut M)) -> bool {
        {
            let mut draft = self.inner.lock_draft();
            if !draft.loaded {
                return false;
            }
            let Some(model) = draft.model.as_mut() else {
                return false;
            };
            apply(model);
            model.recompute_estimates();
            draft.user_edited = true;
        }

        // A save in flight stays `Saving` and reports `Idle` if it finishes behind this edit.
        self.inner.status.send_if_modified(|state| {
            if matches!(state.status, SaveStatus::Saved | SaveStatus::Error) {
                state.status = SaveStatus::Idle;
                return true;
            }
            false
        });
        self.inner.revision.send_modify(|revision| *revision += 1);
        true
    }

    /// Applies an edit that changes the shape of the draft, saves right away and then
    /// invalidates shape-dependent values.
    pub async fn edit_structure(&self, apply: impl FnOnce(&mut M)) -> Result<SaveOutcome> {
        if !self.edit(apply) {
            return Ok(SaveOutcome::Skipped(SkipReason::NotLoaded));
        }
        let outcome = self.inner.flush().await;
        if let Some(model) = self.inner.lock_draft().model.as_mut() {
            model.structure_changed();
        }
        outcome
    }

    /// Runs the save decision now instead of waiting for the debounce.
    pub async fn flush(&self) -> Result<SaveOutcome> {
        self.inner.flush().await
    }

    pub fn model(&self) -> Option<M> {
        self.inner.lock_draft().model.clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.lock_draft().loaded
    }

    pub fn has_user_edits(&self) -> bool {
        self.inner.lock_draft().user_edited
    }

    pub fn snapshot(&self) -> Option<DraftSnapshot> {
        self.inner.lock_draft().snapshot.clone()
    }

    pub fn save_state(&self) -> SaveState {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SaveState> {
        self.inner.status.subscribe()
    }
}

impl<M: DraftModel> Drop for AutosaveController<M> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<M: DraftModel> AutosaveInner<M> {
    fn lock_draft(&self) -> MutexGuard<'_, DraftState<M>> {
        self.draft.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn debounce_loop(self: Arc<Self>, mut revisions: watch::Receiver<u64>, quiet: Duration) {
        while revisions.changed().await.is_ok() {
            loop {
                match tokio::time::timeout(quiet, revisions.changed()).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(_)) => return,
                    Err(_) => break,
                }
            }
            if let Err(err) = self.flush().await {
                debug!("[Autosave] Debounced save did not complete: {}", err);
            }
        }
    }

    /// Canonical payload and fingerprint to persist, or why nothing should be sent.
    fn candidate(&self) -> std::result::Result<(Value, Fingerprint), SkipReason> {
        let draft = self.lock_draft();
        let model = match (&draft.model, draft.loaded) {
            (Some(model), true) => model,
            _ => return Err(SkipReason::NotLoaded),
        };
        if !draft.user_edited {
            return Err(SkipReason::NoUserEdits);
        }
        let payload = canonicalize(&model.to_payload(), &self.rules);
        let fingerprint = Fingerprint::of(&payload);
        if draft
            .snapshot
            .as_ref()
            .is_some_and(|snapshot| snapshot.fingerprint == fingerprint)
        {
            return Err(SkipReason::Unchanged);
        }
        Ok((payload, fingerprint))
    }

    async fn flush(&self) -> Result<SaveOutcome> {
        let _persist = self.persist.lock().await;

        let (payload, fingerprint) = match self.candidate() {
            Ok(candidate) => candidate,
            Err(reason) => {
                debug!("[Autosave] Skipping save of {}: {:?}", self.endpoints.save_path, reason);
                if reason == SkipReason::Unchanged {
                    self.status.send_modify(|state| {
                        state.status = SaveStatus::Saved;
                        state.last_error = None;
                    });
                }
                return Ok(SaveOutcome::Skipped(reason));
            }
        };

        self.status.send_modify(|state| state.status = SaveStatus::Saving);
        let request = ApiRequest::post(self.endpoints.save_path.as_str()).json(payload);
        let result = match self.api.send(request).await {
            Ok(response) => response
                .into_result()
                .and_then(|response| response.json::<Value>()),
            Err(err) => Err(err),
        };

        match result {
            Ok(computed) => {
                let settled = {
                    let mut draft = self.lock_draft();
                    draft.snapshot = Some(DraftSnapshot::new(fingerprint.clone()));
                    match draft.model.as_mut() {
                        Some(model) => {
                            let current =
                                Fingerprint::of_payload(&model.to_payload(), &self.rules);
                            if current == fingerprint {
                                if !computed.is_null() {
                                    model.apply_computed(&computed);
                                }
                                true
                            } else {
                                // Server values describe the sent payload, not the edited rows.
                                model.recompute_estimates();
                                false
                            }
                        }
                        None => true,
                    }
                };
                if settled {
                    info!("[Autosave] Saved {}", self.endpoints.save_path);
                } else {
                    info!(
                        "[Autosave] Saved {}, newer edits pending",
                        self.endpoints.save_path
                    );
                }
                self.status.send_replace(SaveState {
                    status: if settled {
                        SaveStatus::Saved
                    } else {
                        SaveStatus::Idle
                    },
                    saved_at: Some(Utc::now()),
                    last_error: None,
                });
                Ok(SaveOutcome::Saved)
            }
            Err(err) => {
                warn!("[Autosave] Save of {} failed: {}", self.endpoints.save_path, err);
                self.status.send_modify(|state| {
                    state.status = SaveStatus::Error;
                    state.last_error = Some(err.to_string());
                });
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::test_support::{client_with, json_response, MockTransport};
    use calibra_core::calibration::{evaluate, reading_rules, ReadingSheet};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    const LOAD: &str = "/drafts/inward/42";
    const SAVE: &str = "/drafts/inward/42/draft";

    fn five_readings() -> Value {
        json!({
            "steps": [
                {"nominal": 10, "readings": [10.01, 10.02, 9.99, 10.0, 10.03], "mean": 10.01}
            ]
        })
    }

    /// Serves `stored` on load and answers saves with the sheet evaluation, unless `failing`.
    fn draft_backend(stored: Option<Value>, failing: Arc<AtomicBool>) -> Arc<MockTransport> {
        Arc::new(MockTransport::new(move |request, _| {
            if request.path == LOAD {
                return match &stored {
                    Some(value) => json_response(200, value.clone()),
                    None => json_response(404, json!({"error": "not found"})),
                };
            }
            if failing.load(Ordering::SeqCst) {
                return json_response(503, json!({"error": "unavailable"}));
            }
            let body = request.body.clone().unwrap_or(Value::Null);
            let sheet = ReadingSheet::from_stored(&body).unwrap();
            json_response(200, serde_json::to_value(evaluate(&sheet)).unwrap())
        }))
    }

    fn controller(transport: Arc<MockTransport>) -> AutosaveController<ReadingSheet> {
        let api = client_with(transport, ClientConfig::default());
        AutosaveController::new(api, DraftEndpoints::draft("inward", "42"), reading_rules())
    }

    async fn quiet_period() {
        tokio::time::sleep(Duration::from_millis(1_500)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn loaded_draft_without_edits_is_never_saved() {
        let transport = draft_backend(Some(five_readings()), Arc::default());
        let autosave = controller(transport.clone());
        autosave.load().await.unwrap();
        autosave.start();

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(transport.count(SAVE), 0);
        assert_eq!(
            autosave.flush().await.unwrap(),
            SaveOutcome::Skipped(SkipReason::NoUserEdits)
        );
        assert_eq!(autosave.save_state().status, SaveStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn reverted_edit_is_not_saved() {
        let transport = draft_backend(Some(five_readings()), Arc::default());
        let autosave = controller(transport.clone());
        autosave.load().await.unwrap();
        autosave.start();

        autosave.edit(|sheet| {
            sheet.set_reading(0, 1, "10.5");
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        autosave.edit(|sheet| {
            sheet.set_reading(0, 1, "10.02");
        });
        quiet_period().await;

        assert_eq!(transport.count(SAVE), 0);
        assert_eq!(autosave.save_state().status, SaveStatus::Saved);
    }

    #[tokio::test(start_paused = true)]
    async fn five_readings_scenario() {
        let failing = Arc::new(AtomicBool::new(false));
        let transport = draft_backend(Some(five_readings()), failing.clone());
        let autosave = controller(transport.clone());
        autosave.load().await.unwrap();
        autosave.start();
        quiet_period().await;
        assert_eq!(transport.count(SAVE), 0);

        autosave.edit(|sheet| {
            sheet.set_reading(0, 2, "10.04");
        });
        quiet_period().await;
        let saves = transport.calls_to(SAVE);
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].body.as_ref().unwrap()["steps"][0]["readings"][2], json!(10.04));
        assert_eq!(autosave.save_state().status, SaveStatus::Saved);

        failing.store(true, Ordering::SeqCst);
        autosave.edit(|sheet| {
            sheet.set_reading(0, 0, "10.06");
        });
        quiet_period().await;
        assert_eq!(transport.count(SAVE), 2);
        let state = autosave.save_state();
        assert_eq!(state.status, SaveStatus::Error);
        assert!(state.last_error.is_some());

        failing.store(false, Ordering::SeqCst);
        autosave.edit(|sheet| {
            sheet.set_reading(0, 4, "10.05");
        });
        quiet_period().await;
        let saves = transport.calls_to(SAVE);
        assert_eq!(saves.len(), 3);
        let readings = &saves[2].body.as_ref().unwrap()["steps"][0]["readings"];
        assert_eq!(readings[0], json!(10.06));
        assert_eq!(readings[4], json!(10.05));
        assert_eq!(autosave.save_state().status, SaveStatus::Saved);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_edits_collapse_into_one_save() {
        let transport = draft_backend(Some(five_readings()), Arc::default());
        let autosave = controller(transport.clone());
        autosave.load().await.unwrap();
        autosave.start();

        for value in ["10.1", "10.11", "10.111"] {
            autosave.edit(|sheet| {
                sheet.set_reading(0, 0, value);
            });
            tokio::time::sleep(Duration::from_millis(400)).await;
        }
        quiet_period().await;

        let saves = transport.calls_to(SAVE);
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].body.as_ref().unwrap()["steps"][0]["readings"][0], json!(10.111));
    }

    #[tokio::test(start_paused = true)]
    async fn server_values_overwrite_local_estimates() {
        let transport = draft_backend(Some(five_readings()), Arc::default());
        let autosave = controller(transport);
        autosave.load().await.unwrap();

        autosave.edit(|sheet| {
            sheet.steps[0].readings = vec!["9".into(), "11".into()];
        });
        let estimate = autosave.model().unwrap();
        assert_eq!(estimate.steps[0].mean, Some(dec!(10)));
        assert_eq!(estimate.steps[0].std_dev, None);

        assert_eq!(autosave.flush().await.unwrap(), SaveOutcome::Saved);
        let saved = autosave.model().unwrap();
        assert_eq!(saved.steps[0].std_dev.map(|v| v.round_dp(4)), Some(dec!(1.4142)));
        assert_eq!(saved.max_error, Some(dec!(0)));
        assert!(autosave.save_state().saved_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_save_keeps_previous_snapshot() {
        let failing = Arc::new(AtomicBool::new(true));
        let transport = draft_backend(Some(five_readings()), failing);
        let autosave = controller(transport);
        autosave.load().await.unwrap();
        let loaded = autosave.snapshot().unwrap();

        autosave.edit(|sheet| {
            sheet.set_reading(0, 0, "11");
        });
        assert!(autosave.flush().await.is_err());
        assert_eq!(autosave.snapshot().unwrap().fingerprint, loaded.fingerprint);

        autosave.edit(|sheet| {
            sheet.set_reading(0, 1, "11");
        });
        assert_eq!(autosave.save_state().status, SaveStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn never_saved_draft_saves_only_after_edits() {
        let transport = draft_backend(None, Arc::default());
        let autosave = controller(transport.clone());
        autosave.load().await.unwrap();
        autosave.start();
        assert!(autosave.snapshot().is_none());

        quiet_period().await;
        assert_eq!(transport.count(SAVE), 0);

        autosave.edit(|sheet| sheet.add_step("5", 3));
        quiet_period().await;
        assert_eq!(transport.count(SAVE), 1);
        assert!(autosave.snapshot().is_some());
    }

    #[tokio::test]
    async fn edits_before_load_are_ignored() {
        let transport = draft_backend(Some(five_readings()), Arc::default());
        let autosave = controller(transport.clone());

        assert!(!autosave.edit(|sheet| sheet.add_step("1", 1)));
        assert_eq!(
            autosave.flush().await.unwrap(),
            SaveOutcome::Skipped(SkipReason::NotLoaded)
        );
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn structural_edit_saves_immediately() {
        let transport = draft_backend(Some(five_readings()), Arc::default());
        let autosave = controller(transport.clone());
        autosave.load().await.unwrap();
        autosave.start();

        let outcome = autosave
            .edit_structure(|sheet| sheet.add_step("20", 2))
            .await
            .unwrap();

        assert_eq!(outcome, SaveOutcome::Saved);
        assert_eq!(transport.count(SAVE), 1);
        assert_eq!(autosave.model().unwrap().steps.len(), 2);

        quiet_period().await;
        assert_eq!(transport.count(SAVE), 1);
    }

    /// Answers saves after `latency`, with the evaluation of the submitted sheet.
    fn slow_controller(
        stored: Value,
        latency: Duration,
    ) -> (Arc<MockTransport>, AutosaveController<ReadingSheet>) {
        let transport = Arc::new(
            MockTransport::new(move |request, _| {
                if request.path == LOAD {
                    return json_response(200, stored.clone());
                }
                let body = request.body.clone().unwrap_or(Value::Null);
                let sheet = ReadingSheet::from_stored(&body).unwrap();
                json_response(200, serde_json::to_value(evaluate(&sheet)).unwrap())
            })
            .with_latency(latency),
        );
        let autosave = controller(transport.clone());
        (transport, autosave)
    }

    #[tokio::test(start_paused = true)]
    async fn edit_during_save_is_not_reported_as_saved() {
        let (transport, autosave) = slow_controller(five_readings(), Duration::from_millis(200));
        autosave.load().await.unwrap();
        autosave.edit(|sheet| {
            sheet.set_reading(0, 0, "10.2");
        });

        let flush = autosave.flush();
        let late_edit = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(autosave.save_state().status, SaveStatus::Saving);
            autosave.edit(|sheet| {
                sheet.set_reading(0, 1, "10.3");
            });
            assert_eq!(autosave.save_state().status, SaveStatus::Saving);
        };
        let (outcome, _) = tokio::join!(flush, late_edit);

        assert_eq!(outcome.unwrap(), SaveOutcome::Saved);
        let state = autosave.save_state();
        assert_eq!(state.status, SaveStatus::Idle);
        assert!(state.saved_at.is_some());

        assert_eq!(autosave.flush().await.unwrap(), SaveOutcome::Saved);
        assert_eq!(transport.count(SAVE), 2);
        assert_eq!(autosave.save_state().status, SaveStatus::Saved);
    }

    #[tokio::test(start_paused = true)]
    async fn row_removed_during_save_keeps_its_own_values() {
        let stored = json!({
            "steps": [
                {"nominal": 1, "readings": [1, 100]},
                {"nominal": 10, "readings": [10, 10]}
            ]
        });
        let (_transport, autosave) = slow_controller(stored, Duration::from_millis(200));
        autosave.load().await.unwrap();
        autosave.edit(|sheet| {
            sheet.set_reading(1, 1, "10.0");
            sheet.set_reading(1, 0, "10.2");
        });

        let flush = autosave.flush();
        let remove = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            autosave.edit(|sheet| {
                sheet.remove_step(0);
            });
        };
        let (outcome, _) = tokio::join!(flush, remove);
        assert_eq!(outcome.unwrap(), SaveOutcome::Saved);

        let sheet = autosave.model().unwrap();
        assert_eq!(sheet.steps.len(), 1);
        assert_eq!(sheet.steps[0].readings, vec!["10.2".to_string(), "10.0".to_string()]);
        assert_eq!(sheet.steps[0].std_dev, None);
        assert_eq!(sheet.steps[0].mean, Some(dec!(10.1)));
        assert_eq!(autosave.save_state().status, SaveStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_debounced_saves() {
        let transport = draft_backend(Some(five_readings()), Arc::default());
        let autosave = controller(transport.clone());
        autosave.load().await.unwrap();
        autosave.start();

        autosave.edit(|sheet| {
            sheet.set_reading(0, 0, "12");
        });
        autosave.stop();
        quiet_period().await;

        assert_eq!(transport.count(SAVE), 0);
        assert!(autosave.start());
    }
}
