//! Durable host for coordinator runs.
//!
//! Provides `Engine`, which owns the run database, the collaborator
//! clients and the registry of live run tasks. Every run is one Tokio task
//! driven by [`crate::coordinator`]; its progress is written to [`RunDb`]
//! before each suspension point so [`Engine::recover`] can re-enter it after
//! a restart.
//!
//! Identity rules: at most one live task per run id, and a device process
//! whose terminal result is recorded is never executed again.

pub mod db;
mod router;
pub mod run;

pub use db::RunDb;
pub use router::SignalReceipt;
pub use run::{ChildRecord, CoordinatorState, DeviceState, RunRecord, SignalEntry};

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::{error, info, warn, Instrument};

use crate::apply::DeviceChannel;
use crate::config::{DeviceConfig, EngineConfig, RolloutConfig};
use crate::error::{Result, RolloutError};
use crate::store::ArtifactStore;
use crate::types::{ConfigDiff, ReadinessSignal, RolloutRequest};

// ---------------------------------------------------------------------------
// Settings and acknowledgements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub baseline_branch: String,
    pub engine: EngineConfig,
    pub device: DeviceConfig,
}

impl EngineSettings {
    pub fn from_config(config: &RolloutConfig) -> Self {
        Self {
            baseline_branch: config.store.baseline_branch.clone(),
            engine: config.engine.clone(),
            device: config.device.clone(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&RolloutConfig::default())
    }
}

/// Returned when a run is accepted. Completion is observed through
/// [`Engine::run`], never through the acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunAck {
    pub run_id: String,
    /// `true` when an unfinished record for this id was re-entered.
    pub resumed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub resumed: Vec<String>,
    pub abandoned: Vec<String>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct LiveRun {
    /// Present for runs that wait on readiness signals.
    signals: Option<mpsc::UnboundedSender<ReadinessSignal>>,
    abort: AbortHandle,
}

struct Inner {
    db: RunDb,
    store: Arc<dyn ArtifactStore>,
    channel: Arc<dyn DeviceChannel>,
    settings: EngineSettings,
    live: Mutex<HashMap<String, LiveRun>>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(
        db: RunDb,
        store: Arc<dyn ArtifactStore>,
        channel: Arc<dyn DeviceChannel>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                store,
                channel,
                settings,
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn db(&self) -> &RunDb {
        &self.inner.db
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub(crate) fn store(&self) -> &dyn ArtifactStore {
        self.inner.store.as_ref()
    }

    pub(crate) fn channel(&self) -> &dyn DeviceChannel {
        self.inner.channel.as_ref()
    }

    /// Start a run for `request`.
    ///
    /// Fails with `RunActive` if a task for the same run id is live. An
    /// unfinished record left by a previous host is re-entered rather than
    /// restarted; a terminal record is replaced by a fresh run.
    pub async fn start(&self, request: RolloutRequest) -> Result<RunAck> {
        request.validate()?;
        let id = request.run_id();

        let mut live = self.inner.live.lock().await;
        if live.contains_key(&id) {
            warn!(run_id = %id, "start rejected: run already active");
            return Err(RolloutError::RunActive(id));
        }

        let (mut record, resumed) = match self.inner.db.get(&id)? {
            Some(existing) if !existing.state.is_terminal() => (existing, true),
            _ => (RunRecord::new(request), false),
        };
        let seeded = self.seed_from_backlog(&mut record)?;
        self.inner.db.put(&record)?;

        info!(run_id = %id, kind = record.request.kind(), resumed, seeded, "run started");
        self.spawn_locked(&mut live, record);
        Ok(RunAck { run_id: id, resumed })
    }

    /// Re-enter every unfinished run after a restart.
    ///
    /// Runs untouched for longer than `recovery_max_age` are marked failed
    /// instead.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let abandoned = self
            .inner
            .db
            .abandon_stale(self.inner.settings.engine.recovery_max_age())?;
        for id in &abandoned {
            warn!(run_id = %id, "abandoned stale run");
        }

        let mut report = RecoveryReport {
            abandoned,
            ..Default::default()
        };
        let mut live = self.inner.live.lock().await;
        for mut record in self.inner.db.list_unfinished()? {
            if live.contains_key(&record.id) {
                continue;
            }
            if self.seed_from_backlog(&mut record)? > 0 {
                self.inner.db.put(&record)?;
            }
            info!(run_id = %record.id, state = record.state.as_str(), "resuming run");
            report.resumed.push(record.id.clone());
            self.spawn_locked(&mut live, record);
        }
        Ok(report)
    }

    /// Abort every live run task. Their records stay unfinished and are
    /// picked up again by [`Engine::recover`].
    pub async fn shutdown(&self) {
        let mut live = self.inner.live.lock().await;
        for (id, run) in live.drain() {
            info!(run_id = %id, "suspending run");
            run.abort.abort();
        }
    }

    pub fn run(&self, id: &str) -> Result<RunRecord> {
        self.inner
            .db
            .get(id)?
            .ok_or_else(|| RolloutError::RunNotFound(id.to_string()))
    }

    /// All recorded runs, newest first.
    pub fn runs(&self) -> Result<Vec<RunRecord>> {
        self.inner.db.list_all()
    }

    pub async fn is_live(&self, id: &str) -> bool {
        self.inner.live.lock().await.contains_key(id)
    }

    pub async fn live_runs(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.live.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Poll the run record until it reaches a terminal state.
    #[cfg(test)]
    pub(crate) async fn wait_for_terminal(
        &self,
        id: &str,
        timeout: std::time::Duration,
    ) -> Result<RunRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let record = self.run(id)?;
            if record.state.is_terminal() {
                return Ok(record);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RolloutError::Interrupted(format!(
                    "run '{id}' still {} after {}s",
                    record.state.as_str(),
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    /// Drop backlog signals older than the backlog window.
    pub fn prune_backlog(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.backlog_window()?;
        self.inner.db.prune_signals(cutoff)
    }

    fn backlog_window(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(self.inner.settings.engine.signal_backlog())
            .map_err(|e| RolloutError::Config(format!("signal_backlog_secs: {e}")))
    }

    /// Fold recent backlog signals into a run that is still before its
    /// dispatch. Returns the number of newly observed keys.
    fn seed_from_backlog(&self, record: &mut RunRecord) -> Result<usize> {
        let waiting = matches!(
            record.state,
            CoordinatorState::Init
                | CoordinatorState::DiffComputed
                | CoordinatorState::AwaitingReadiness
        );
        if !record.accepts_signals() || !waiting {
            return Ok(0);
        }
        let since = Utc::now() - self.backlog_window()?;
        let mut added = 0;
        for entry in self.inner.db.signals_since(since)? {
            if record.observe(&entry.signal) {
                added += 1;
            }
        }
        Ok(added)
    }

    fn spawn_locked(&self, live: &mut HashMap<String, LiveRun>, record: RunRecord) {
        let (tx, rx) = if record.accepts_signals() {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let id = record.id.clone();
        let engine = self.clone();
        let span = tracing::info_span!("run", run_id = %id);
        let task_id = id.clone();
        let handle = tokio::spawn(
            async move {
                let outcome = crate::coordinator::drive(&engine, record, rx).await;
                engine.finish(&task_id, outcome).await;
            }
            .instrument(span),
        );

        live.insert(
            id,
            LiveRun {
                signals: tx,
                abort: handle.abort_handle(),
            },
        );
    }

    async fn finish(&self, id: &str, outcome: Result<ConfigDiff>) {
        let state = match outcome {
            Ok(result) => {
                info!(devices = result.len(), "run gathered");
                CoordinatorState::Gathered { result }
            }
            Err(e) => {
                error!(error = %e, "run failed");
                CoordinatorState::Failed {
                    reason: e.to_string(),
                }
            }
        };
        if let Err(e) = self.inner.db.update(id, |r| r.state = state) {
            error!(error = %e, "failed to record terminal state");
        }
        self.inner.live.lock().await.remove(id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::apply::MemoryChannel;
    use crate::store::MemoryStore;
    use crate::types::Artifact;
    use std::time::Duration;
    use tempfile::TempDir;

    pub(crate) struct Harness {
        pub _dir: TempDir,
        pub engine: Engine,
        pub store: MemoryStore,
        pub channel: MemoryChannel,
    }

    pub(crate) fn settings() -> EngineSettings {
        let mut settings = EngineSettings::default();
        settings.engine.poll_interval_ms = 100;
        settings.engine.readiness_timeout_secs = Some(600);
        settings.engine.activity.max_attempts = 3;
        settings.engine.activity.initial_backoff_ms = 10;
        settings
    }

    pub(crate) fn harness_with(settings: EngineSettings) -> Harness {
        let dir = TempDir::new().unwrap();
        let db = RunDb::open(&dir.path().join("runs.db")).unwrap();
        let store = MemoryStore::new();
        let channel = MemoryChannel::new();
        let engine = Engine::new(
            db,
            Arc::new(store.clone()),
            Arc::new(channel.clone()),
            settings,
        );
        Harness {
            _dir: dir,
            engine,
            store,
            channel,
        }
    }

    pub(crate) fn harness() -> Harness {
        harness_with(settings())
    }

    pub(crate) fn art(obj: &str, checksum: &str, label: &str, storage: &str) -> Artifact {
        Artifact {
            object_id: obj.into(),
            checksum: checksum.into(),
            display_label: label.into(),
            storage_id: storage.into(),
            updated_at: None,
        }
    }

    pub(crate) fn proposed(id: &str, branch: &str) -> RolloutRequest {
        RolloutRequest::ProposedChange {
            proposed_change_id: id.into(),
            branch: branch.into(),
        }
    }

    pub(crate) fn signal(target: &str, checksum: &str) -> ReadinessSignal {
        ReadinessSignal {
            target_id: target.into(),
            checksum: checksum.into(),
        }
    }

    /// Wait (in virtual time) until the run reaches `state`.
    pub(crate) async fn wait_for_state(engine: &Engine, id: &str, state: &str) -> RunRecord {
        for _ in 0..200 {
            let record = engine.run(id).unwrap();
            if record.state.as_str() == state {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!(
            "run {id} never reached {state}; last: {:?}",
            engine.run(id).unwrap().state
        );
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_start_is_rejected_while_live() {
        let h = harness();
        h.store
            .set_branch("feature-x", vec![art("R1", "c2", "router1", "s2")])
            .await;

        let ack = h.engine.start(proposed("42", "feature-x")).await.unwrap();
        assert_eq!(ack.run_id, "proposed-change-42");
        assert!(!ack.resumed);

        let err = h
            .engine
            .start(proposed("42", "feature-x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::RunActive(ref id) if id == "proposed-change-42"));
        assert_eq!(h.engine.live_runs().await, vec!["proposed-change-42"]);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_request_is_rejected_before_recording() {
        let h = harness();
        let err = h.engine.start(proposed("", "feature-x")).await.unwrap_err();
        assert!(matches!(err, RolloutError::InvalidRequest(_)));
        assert!(h.engine.runs().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_run_can_be_started_again() {
        let h = harness();
        // No artifacts on either branch: the run gathers an empty result.
        h.engine.start(proposed("7", "empty")).await.unwrap();
        let done = h
            .engine
            .wait_for_terminal("proposed-change-7", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(
            done.state,
            CoordinatorState::Gathered {
                result: ConfigDiff::new()
            }
        );

        let again = h.engine.start(proposed("7", "empty")).await.unwrap();
        assert!(!again.resumed);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_then_recover_resumes_waiting_run() {
        let h = harness();
        h.store
            .set_branch("feature-x", vec![art("R1", "c2", "router1", "s2")])
            .await;
        h.store.set_rendered("router1", "c2", "s2").await;
        h.store.put_content("s2", "system:\n  name: router1\n").await;

        h.engine.start(proposed("42", "feature-x")).await.unwrap();
        wait_for_state(&h.engine, "proposed-change-42", "awaiting_readiness").await;

        h.engine.shutdown().await;
        assert!(!h.engine.is_live("proposed-change-42").await);
        assert!(!h.engine.run("proposed-change-42").unwrap().state.is_terminal());

        let report = h.engine.recover().await.unwrap();
        assert_eq!(report.resumed, vec!["proposed-change-42"]);
        assert!(report.abandoned.is_empty());

        h.engine.signal(signal("R1", "c2")).await.unwrap();
        let done = h
            .engine
            .wait_for_terminal("proposed-change-42", Duration::from_secs(60))
            .await
            .unwrap();
        match done.state {
            CoordinatorState::Gathered { result } => {
                assert!(result.device("router1").is_some());
            }
            other => panic!("expected Gathered, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recover_skips_finished_and_abandons_stale_runs() {
        let h = harness();
        let mut stale = RunRecord::new(proposed("old", "feature-x"));
        stale.updated_at = Utc::now() - chrono::Duration::days(3);
        h.engine.db().put(&stale).unwrap();

        let mut finished = RunRecord::new(proposed("done", "feature-x"));
        finished.state = CoordinatorState::Gathered {
            result: ConfigDiff::new(),
        };
        h.engine.db().put(&finished).unwrap();

        let report = h.engine.recover().await.unwrap();
        assert!(report.resumed.is_empty());
        assert_eq!(report.abandoned, vec!["proposed-change-old"]);
        assert!(h.engine.live_runs().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn prune_backlog_drops_expired_signals() {
        let h = harness();
        let mut old = SignalEntry::new(signal("R1", "c1"));
        old.received_at = Utc::now() - chrono::Duration::hours(2);
        h.engine.db().record_signal(&old).unwrap();
        h.engine.db().record_signal(&SignalEntry::new(signal("R2", "c2"))).unwrap();

        assert_eq!(h.engine.prune_backlog().unwrap(), 1);
    }
}
