//! Device apply protocol adapter.
//!
//! A [`DeviceChannel`] speaks the management protocol and returns the raw
//! per-element changes; [`apply_config`] turns that into a [`ConfigDiff`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::DeviceConfig;
use crate::error::{ApplyFault, Result, RolloutError};
use crate::types::{ConfigDiff, PathChanges, ROOT_PATH};

// ---------------------------------------------------------------------------
// DeviceTarget / RawChange
// ---------------------------------------------------------------------------

/// Where and how to reach one device's management channel.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTarget {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub skip_verify: bool,
    pub timeout_secs: u64,
}

impl DeviceTarget {
    /// Devices are addressed by name; the name must resolve on the network.
    pub fn from_config(device: &str, config: &DeviceConfig) -> Self {
        Self {
            name: device.to_string(),
            address: device.to_string(),
            port: config.port,
            username: config.username.clone(),
            password: config.password.clone(),
            skip_verify: config.skip_verify,
            timeout_secs: config.timeout_secs,
        }
    }
}

/// One element changed by a replace: `(op, path, value)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub op: String,
    pub path: String,
    pub value: serde_json::Value,
}

impl RawChange {
    /// `"<op> <value>"`; string values are rendered without quotes.
    pub fn describe(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => format!("{} {}", self.op, s),
            other => format!("{} {}", self.op, other),
        }
    }
}

#[async_trait]
pub trait DeviceChannel: Send + Sync {
    /// Replace the configuration subtree at `path` with `document` and
    /// report every element that changed.
    async fn replace(
        &self,
        target: &DeviceTarget,
        path: &str,
        document: &serde_json::Value,
    ) -> std::result::Result<Vec<RawChange>, ApplyFault>;
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Group raw changes by path, preserving the device's order within a path.
pub fn normalize(changes: &[RawChange]) -> PathChanges {
    let mut out = PathChanges::new();
    for change in changes {
        out.entry(change.path.clone())
            .or_default()
            .push(change.describe());
    }
    out
}

/// Full-document replace at the root, normalized into a [`ConfigDiff`].
///
/// A failed apply never yields a partial diff.
pub async fn apply_config(
    channel: &dyn DeviceChannel,
    target: &DeviceTarget,
    document: &serde_json::Value,
) -> Result<ConfigDiff> {
    tracing::info!(device = %target.name, address = %target.address, port = target.port, "applying configuration");
    let changes = channel
        .replace(target, ROOT_PATH, document)
        .await
        .map_err(|fault| RolloutError::Apply {
            device: target.name.clone(),
            fault,
        })?;
    tracing::info!(device = %target.name, changed = changes.len(), "configuration replaced");
    Ok(ConfigDiff::for_device(&target.name, normalize(&changes)))
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ChannelState {
    responses: HashMap<String, Vec<RawChange>>,
    faults: HashMap<String, (ApplyFault, u32)>,
    applied: Vec<(String, serde_json::Value)>,
}

/// In-process device channel used by tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    state: Arc<Mutex<ChannelState>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Changes reported the next time `device` is replaced.
    pub async fn respond_with(&self, device: &str, changes: Vec<RawChange>) {
        self.state
            .lock()
            .await
            .responses
            .insert(device.to_string(), changes);
    }

    /// Fail the next `times` applies to `device` with `fault`.
    /// `u32::MAX` fails forever.
    pub async fn fail(&self, device: &str, fault: ApplyFault, times: u32) {
        self.state
            .lock()
            .await
            .faults
            .insert(device.to_string(), (fault, times));
    }

    /// Every successful apply so far, in order: `(device, document)`.
    pub async fn applied(&self) -> Vec<(String, serde_json::Value)> {
        self.state.lock().await.applied.clone()
    }
}

#[async_trait]
impl DeviceChannel for MemoryChannel {
    async fn replace(
        &self,
        target: &DeviceTarget,
        _path: &str,
        document: &serde_json::Value,
    ) -> std::result::Result<Vec<RawChange>, ApplyFault> {
        let mut state = self.state.lock().await;
        if let Some((fault, remaining)) = state.faults.get_mut(&target.name) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(fault.clone());
            }
        }
        state
            .applied
            .push((target.name.clone(), document.clone()));
        Ok(state
            .responses
            .get(&target.name)
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
