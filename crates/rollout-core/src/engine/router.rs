//! Readiness signal routing.
//!
//! Every signal is appended to the durable backlog first, then broadcast
//! to each live run that waits on readiness. A run started after the
//! signal arrived seeds itself from the backlog instead.

use serde::Serialize;
use tracing::{debug, info};

use super::{Engine, SignalEntry};
use crate::error::{Result, RolloutError};
use crate::types::ReadinessSignal;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SignalReceipt {
    /// Run ids the signal was handed to.
    pub delivered: Vec<String>,
}

impl Engine {
    /// Route `signal` to every live proposed-change run.
    ///
    /// Delivery is fire-and-forget: a run that finished between the lookup
    /// and the send is skipped without error.
    pub async fn signal(&self, signal: ReadinessSignal) -> Result<SignalReceipt> {
        if signal.target_id.trim().is_empty() || signal.checksum.trim().is_empty() {
            return Err(RolloutError::InvalidRequest(
                "artifact signal requires a target id and a checksum".into(),
            ));
        }
        self.db().record_signal(&SignalEntry::new(signal.clone()))?;

        let live = self.inner.live.lock().await;
        let mut delivered = Vec::new();
        for (id, run) in live.iter() {
            let Some(tx) = &run.signals else { continue };
            if tx.send(signal.clone()).is_ok() {
                delivered.push(id.clone());
            } else {
                debug!(run_id = %id, "run no longer listening");
            }
        }
        delivered.sort();

        info!(
            target_id = %signal.target_id,
            checksum = %signal.checksum,
            runs = delivered.len(),
            "artifact signal routed"
        );
        Ok(SignalReceipt { delivered })
    }
}
