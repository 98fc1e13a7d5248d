//! Coordinator process: diff, readiness barrier, fan-out, gather.
//!
//! `drive` is re-entrant. It looks at the recorded [`CoordinatorState`] and
//! skips every phase that already completed, so the same function serves a
//! fresh run and a run recovered after a restart.

use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};

use crate::device;
use crate::diff;
use crate::engine::{ChildRecord, CoordinatorState, DeviceState, Engine, RunRecord};
use crate::error::{Result, RolloutError};
use crate::retry::run_activity;
use crate::types::{BranchDiffEntry, ConfigDiff, ReadinessSignal, RolloutRequest};

pub(crate) async fn drive(
    engine: &Engine,
    record: RunRecord,
    signals: Option<UnboundedReceiver<ReadinessSignal>>,
) -> Result<ConfigDiff> {
    match record.request.clone() {
        RolloutRequest::ProposedChange { branch, .. } => {
            proposed_change(engine, record, &branch, signals).await
        }
        RolloutRequest::Portkey {
            target_id,
            checksum,
        } => portkey(engine, record, &target_id, &checksum).await,
    }
}

// ---------------------------------------------------------------------------
// Proposed change
// ---------------------------------------------------------------------------

async fn proposed_change(
    engine: &Engine,
    mut record: RunRecord,
    branch: &str,
    mut signals: Option<UnboundedReceiver<ReadinessSignal>>,
) -> Result<ConfigDiff> {
    let policy = &engine.settings().engine.activity;

    if record.state == CoordinatorState::Init {
        let baseline = engine.settings().baseline_branch.as_str();
        let store = engine.store();
        let entries = run_activity("get_updated_devices", policy, move |_| {
            diff::detect(store, branch, baseline)
        })
        .await?;
        info!(branch, devices = entries.len(), "branch diff computed");
        record = engine.db().update(&record.id, |r| {
            r.diff = entries;
            r.state = CoordinatorState::DiffComputed;
        })?;
    }

    if record.state == CoordinatorState::DiffComputed && record.diff.is_empty() {
        info!(branch, "no devices changed on branch");
        return Ok(ConfigDiff::new());
    }

    if matches!(
        record.state,
        CoordinatorState::DiffComputed | CoordinatorState::AwaitingReadiness
    ) {
        ensure_distinct_devices(&record.diff)?;
        if record.state == CoordinatorState::DiffComputed {
            record = engine.db().update(&record.id, |r| {
                r.state = CoordinatorState::AwaitingReadiness;
                r.awaiting_since.get_or_insert_with(Utc::now);
            })?;
        }
        let rx = signals.as_mut().ok_or_else(|| {
            RolloutError::Interrupted(format!("run '{}' has no signal channel", record.id))
        })?;
        await_readiness(engine, &mut record, rx).await?;

        let children: Vec<ChildRecord> = record
            .diff
            .iter()
            .map(|entry| {
                ChildRecord::new(
                    record.request.child_id(&entry.display_label),
                    &entry.display_label,
                    &entry.expected_checksum,
                )
            })
            .collect();
        record = engine.db().update(&record.id, |r| {
            for child in children {
                r.children.entry(child.id.clone()).or_insert(child);
            }
            r.state = CoordinatorState::Dispatched;
        })?;
    }

    gather(engine, &record).await
}

/// A run dispatches exactly one device process per device.
fn ensure_distinct_devices(entries: &[BranchDiffEntry]) -> Result<()> {
    let mut by_device: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for entry in entries {
        by_device
            .entry(entry.display_label.as_str())
            .or_default()
            .push(entry.key().to_string());
    }
    match by_device.into_iter().find(|(_, keys)| keys.len() > 1) {
        Some((device, checksums)) => Err(RolloutError::DuplicateDevice {
            device: device.to_string(),
            checksums,
        }),
        None => Ok(()),
    }
}

/// Block until every `(object_id, checksum)` in the diff has been signalled.
///
/// The deadline is measured from `awaiting_since`, which is persisted, so a
/// recovered run does not get a fresh timeout.
async fn await_readiness(
    engine: &Engine,
    record: &mut RunRecord,
    signals: &mut UnboundedReceiver<ReadinessSignal>,
) -> Result<()> {
    let limit = engine.settings().engine.readiness_timeout();
    let since = record.awaiting_since.unwrap_or_else(Utc::now);

    loop {
        let missing = record.readiness.missing(&record.diff);
        if missing.is_empty() {
            info!(signals = record.readiness.len(), "readiness barrier released");
            return Ok(());
        }
        debug!(missing = missing.len(), "awaiting artifact signals");

        let next = match limit {
            Some(limit) => {
                let elapsed = (Utc::now() - since).to_std().unwrap_or_default();
                let remaining = limit.saturating_sub(elapsed);
                match tokio::time::timeout(remaining, signals.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        return Err(RolloutError::ReadinessTimeout {
                            run_id: record.id.clone(),
                            missing: missing.iter().map(ToString::to_string).collect(),
                        })
                    }
                }
            }
            None => signals.recv().await,
        };

        let Some(signal) = next else {
            return Err(RolloutError::Interrupted(format!(
                "signal channel for '{}' closed",
                record.id
            )));
        };
        if record.readiness.contains(&signal.key()) {
            continue;
        }
        *record = engine.db().update(&record.id, |r| {
            r.observe(&signal);
        })?;
        debug!(key = %signal.key(), "readiness signal recorded");
    }
}

// ---------------------------------------------------------------------------
// Portkey
// ---------------------------------------------------------------------------

async fn portkey(
    engine: &Engine,
    mut record: RunRecord,
    target_id: &str,
    checksum: &str,
) -> Result<ConfigDiff> {
    if record.state == CoordinatorState::Init {
        let policy = &engine.settings().engine.activity;
        let store = engine.store();
        let device =
            run_activity("get_device", policy, move |_| store.device_name(target_id)).await?;
        info!(target_id, device = %device, "portkey target resolved");

        let child = ChildRecord::new(record.request.child_id(&device), &device, checksum);
        record = engine.db().update(&record.id, |r| {
            r.children.entry(child.id.clone()).or_insert(child);
            r.state = CoordinatorState::Dispatched;
        })?;
    }
    gather(engine, &record).await
}

// ---------------------------------------------------------------------------
// Gather
// ---------------------------------------------------------------------------

/// Run every unfinished device process concurrently and merge the results.
///
/// Children with a recorded `Done` contribute their stored diff without
/// being executed. The first failure cancels every sibling still running
/// and records it as failed.
async fn gather(engine: &Engine, record: &RunRecord) -> Result<ConfigDiff> {
    let mut result = ConfigDiff::new();
    let mut set = JoinSet::new();

    for child in record.children.values() {
        match &child.state {
            DeviceState::Done { diff } => {
                debug!(child_id = %child.id, "device process already done");
                result.merge(diff.clone());
                continue;
            }
            DeviceState::Failed { reason } => {
                return Err(RolloutError::GatherFailure {
                    child_id: child.id.clone(),
                    reason: reason.clone(),
                });
            }
            _ => {}
        }

        let engine = engine.clone();
        let run_id = record.id.clone();
        let child = child.clone();
        let span = tracing::info_span!("device", child_id = %child.id, device = %child.device);
        set.spawn(
            async move {
                let child_id = child.id.clone();
                let outcome = device::configure(&engine, &run_id, child).await;
                (child_id, outcome)
            }
            .instrument(span),
        );
    }
    info!(running = set.len(), reused = result.len(), "device processes dispatched");

    while let Some(joined) = set.join_next().await {
        let (child_id, outcome) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                set.shutdown().await;
                cancel_unfinished(engine, &record.id, "<unknown>");
                return Err(RolloutError::GatherFailure {
                    child_id: "<unknown>".into(),
                    reason: e.to_string(),
                });
            }
        };
        match outcome {
            Ok(diff) => result.merge(diff),
            Err(e) => {
                warn!(child_id = %child_id, cancelled = set.len(), error = %e, "device process failed");
                set.shutdown().await;
                cancel_unfinished(engine, &record.id, &child_id);
                return Err(RolloutError::GatherFailure {
                    child_id,
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok(result)
}

/// Mark every device process of `run_id` that has not finished as cancelled.
///
/// Called only after the aborted tasks have been joined, so no process can
/// overwrite the cancellation.
fn cancel_unfinished(engine: &Engine, run_id: &str, failed_child: &str) {
    let reason = format!("cancelled: sibling {failed_child} failed");
    let outcome = engine.db().update(run_id, |r| {
        for child in r.children.values_mut() {
            if !child.state.is_terminal() {
                child.state = DeviceState::Failed {
                    reason: reason.clone(),
                };
                child.updated_at = Utc::now();
            }
        }
    });
    if let Err(e) = outcome {
        warn!(run_id, error = %e, "failed to record cancelled device processes");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
