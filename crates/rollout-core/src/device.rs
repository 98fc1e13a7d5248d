//! Device configuration process.
//!
//! One process per dispatched device: wait until the store has rendered the
//! expected checksum, fetch and decode the artifact, replace the device's
//! configuration, report the diff. Each step runs as a retried activity and
//! every transition is persisted on the parent run before the next step.

use std::time::Duration;
use tracing::{debug, trace};

use crate::apply::{self, DeviceTarget};
use crate::engine::{ChildRecord, DeviceState, Engine};
use crate::error::{Result, RolloutError};
use crate::retry::run_activity;
use crate::store::ArtifactStore;
use crate::types::ConfigDiff;

pub(crate) async fn configure(
    engine: &Engine,
    run_id: &str,
    mut child: ChildRecord,
) -> Result<ConfigDiff> {
    loop {
        let step = match &child.state {
            DeviceState::Done { diff } => return Ok(diff.clone()),
            DeviceState::Failed { reason } => {
                return Err(RolloutError::DeviceFailed {
                    device: child.device.clone(),
                    reason: reason.clone(),
                })
            }
            DeviceState::PollingArtifact => wait_for_render(engine, &child)
                .await
                .map(|storage_id| DeviceState::ArtifactReady { storage_id }),
            DeviceState::ArtifactReady { storage_id } => fetch_document(engine, storage_id)
                .await
                .map(|document| DeviceState::Applying { document }),
            DeviceState::Applying { document } => apply_document(engine, &child.device, document)
                .await
                .map(|diff| DeviceState::Done { diff }),
        };

        let next = match step {
            Ok(next) => next,
            Err(e) => {
                record(
                    engine,
                    run_id,
                    &child.id,
                    DeviceState::Failed {
                        reason: e.to_string(),
                    },
                )?;
                return Err(e);
            }
        };
        debug!(from = child.state.as_str(), to = next.as_str(), "device transition");
        child = record(engine, run_id, &child.id, next)?;
    }
}

fn record(engine: &Engine, run_id: &str, child_id: &str, state: DeviceState) -> Result<ChildRecord> {
    let run = engine.db().update(run_id, |r| {
        if let Some(child) = r.children.get_mut(child_id) {
            child.state = state;
            child.updated_at = chrono::Utc::now();
        }
    })?;
    run.children.get(child_id).cloned().ok_or_else(|| {
        RolloutError::RunDb(format!("device process '{child_id}' missing from run '{run_id}'"))
    })
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

async fn wait_for_render(engine: &Engine, child: &ChildRecord) -> Result<String> {
    let interval = engine.settings().engine.poll_interval();
    let store = engine.store();
    let (device, expected) = (child.device.as_str(), child.expected_checksum.as_str());
    run_activity("get_artifact", &engine.settings().engine.activity, move |_| {
        poll_until_rendered(store, device, expected, interval)
    })
    .await
}

/// Sleep-then-check until the rendered checksum for `device` matches.
/// Bounded only by the enclosing activity deadlines.
async fn poll_until_rendered(
    store: &dyn ArtifactStore,
    device: &str,
    expected: &str,
    interval: Duration,
) -> Result<String> {
    let mut polls = 0u32;
    loop {
        tokio::time::sleep(interval).await;
        polls += 1;
        let current = store.device_artifact(device).await?;
        if current.checksum == expected {
            debug!(polls, storage_id = %current.storage_id, "artifact rendered");
            return Ok(current.storage_id);
        }
        trace!(observed = %current.checksum, expected, "artifact not rendered yet");
    }
}

async fn fetch_document(engine: &Engine, storage_id: &str) -> Result<serde_json::Value> {
    let store = engine.store();
    run_activity("get_artifact_content", &engine.settings().engine.activity, move |_| async move {
        let raw = store.fetch_content(storage_id).await?;
        decode_document(storage_id, &raw)
    })
    .await
}

/// Artifacts are YAML (JSON parses as YAML too) and must hold a mapping.
pub(crate) fn decode_document(storage_id: &str, raw: &str) -> Result<serde_json::Value> {
    let decode = |reason: String| RolloutError::Decode {
        storage_id: storage_id.to_string(),
        reason,
    };
    let document: serde_json::Value =
        serde_yaml::from_str(raw).map_err(|e| decode(e.to_string()))?;
    if !document.is_object() {
        return Err(decode("expected a mapping at the document root".into()));
    }
    Ok(document)
}

async fn apply_document(
    engine: &Engine,
    device: &str,
    document: &serde_json::Value,
) -> Result<ConfigDiff> {
    let target = DeviceTarget::from_config(device, &engine.settings().device);
    let (channel, target) = (engine.channel(), &target);
    run_activity("configure_device", &engine.settings().engine.activity, move |_| {
        apply::apply_config(channel, target, document)
    })
    .await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{harness, proposed};
    use crate::engine::{CoordinatorState, RunRecord};
    use crate::error::ApplyFault;
    use serde_json::json;

    fn dispatched(h: &crate::engine::tests::Harness, device: &str, checksum: &str) -> ChildRecord {
        let request = proposed("1", "b");
        let mut run = RunRecord::new(request.clone());
        run.state = CoordinatorState::Dispatched;
        let child = ChildRecord::new(request.child_id(device), device, checksum);
        run.children.insert(child.id.clone(), child.clone());
        h.engine.db().put(&run).unwrap();
        child
    }

    #[test]
    fn decode_accepts_yaml_and_json() {
        assert_eq!(
            decode_document("s1", "system:\n  mtu: 9000\n").unwrap(),
            json!({"system": {"mtu": 9000}})
        );
        assert_eq!(
            decode_document("s1", r#"{"a": [1, 2]}"#).unwrap(),
            json!({"a": [1, 2]})
        );
    }

    #[test]
    fn decode_rejects_garbage_and_scalars() {
        let err = decode_document("s1", "a: [unclosed").unwrap_err();
        assert!(matches!(err, RolloutError::Decode { ref storage_id, .. } if storage_id == "s1"));
        assert!(!err.is_retryable());
        assert!(matches!(
            decode_document("s1", "just a string").unwrap_err(),
            RolloutError::Decode { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_expected_checksum_before_applying() {
        let h = harness();
        h.store.set_rendered("router1", "c1", "s1").await;
        h.store.put_content("s2", "a: 1\n").await;
        let child = dispatched(&h, "router1", "c2");

        let engine = h.engine.clone();
        let task = tokio::spawn(async move { configure(&engine, "proposed-change-1", child).await });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(h.channel.applied().await.is_empty());
        let run = h.engine.run("proposed-change-1").unwrap();
        assert_eq!(
            run.children["router1-proposed-change-1"].state,
            DeviceState::PollingArtifact
        );

        h.store.set_rendered("router1", "c2", "s2").await;
        let diff = task.await.unwrap().unwrap();
        assert!(diff.device("router1").is_some());
        assert_eq!(h.channel.applied().await, vec![("router1".to_string(), json!({"a": 1}))]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_apply_fault_is_retried() {
        let h = harness();
        h.store.set_rendered("router1", "c2", "s2").await;
        h.store.put_content("s2", "a: 1\n").await;
        h.channel
            .fail("router1", ApplyFault::Connection("refused".into()), 2)
            .await;
        let child = dispatched(&h, "router1", "c2");

        let diff = configure(&h.engine, "proposed-change-1", child).await.unwrap();
        assert!(diff.device("router1").is_some());
        assert_eq!(h.channel.applied().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn decode_failure_is_recorded_on_the_child() {
        let h = harness();
        h.store.set_rendered("router1", "c2", "s2").await;
        h.store.put_content("s2", "a: [unclosed").await;
        let child = dispatched(&h, "router1", "c2");

        let err = configure(&h.engine, "proposed-change-1", child).await.unwrap_err();
        assert!(matches!(err, RolloutError::Decode { .. }));

        let run = h.engine.run("proposed-change-1").unwrap();
        assert!(matches!(
            run.children["router1-proposed-change-1"].state,
            DeviceState::Failed { .. }
        ));
        assert!(h.channel.applied().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn applying_child_resumes_without_refetch() {
        let h = harness();
        let mut child = dispatched(&h, "router1", "c2");
        child.state = DeviceState::Applying {
            document: json!({"recorded": true}),
        };

        // No rendered artifact or content exists; only the apply can run.
        let diff = configure(&h.engine, "proposed-change-1", child).await.unwrap();
        assert!(diff.device("router1").is_some());
        assert_eq!(
            h.channel.applied().await,
            vec![("router1".to_string(), json!({"recorded": true}))]
        );
    }
}
