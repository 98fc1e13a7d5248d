//! Read access to the source-of-truth artifact store.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{Result, RolloutError};
use crate::types::{Artifact, DeviceArtifact};

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Every artifact visible on `branch`.
    async fn list_artifacts(&self, branch: &str) -> Result<Vec<Artifact>>;

    /// The artifact currently rendered for `device` on the baseline branch.
    async fn device_artifact(&self, device: &str) -> Result<DeviceArtifact>;

    /// Resolve the device name for a managed object id.
    async fn device_name(&self, object_id: &str) -> Result<String>;

    /// Raw artifact content by storage id.
    async fn fetch_content(&self, storage_id: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StoreState {
    branches: HashMap<String, Vec<Artifact>>,
    rendered: HashMap<String, DeviceArtifact>,
    names: HashMap<String, String>,
    contents: HashMap<String, String>,
    unavailable_branches: HashSet<String>,
}

/// In-process artifact store used by tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_branch(&self, branch: &str, artifacts: Vec<Artifact>) {
        self.state
            .write()
            .await
            .branches
            .insert(branch.to_string(), artifacts);
    }

    /// Record what the renderer has produced for `device` so far.
    pub async fn set_rendered(&self, device: &str, checksum: &str, storage_id: &str) {
        self.state.write().await.rendered.insert(
            device.to_string(),
            DeviceArtifact {
                checksum: checksum.to_string(),
                storage_id: storage_id.to_string(),
            },
        );
    }

    pub async fn set_device_name(&self, object_id: &str, name: &str) {
        self.state
            .write()
            .await
            .names
            .insert(object_id.to_string(), name.to_string());
    }

    pub async fn put_content(&self, storage_id: &str, content: &str) {
        self.state
            .write()
            .await
            .contents
            .insert(storage_id.to_string(), content.to_string());
    }

    /// Make every read of `branch` fail with a store error.
    pub async fn make_unavailable(&self, branch: &str) {
        self.state
            .write()
            .await
            .unavailable_branches
            .insert(branch.to_string());
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn list_artifacts(&self, branch: &str) -> Result<Vec<Artifact>> {
        let state = self.state.read().await;
        if state.unavailable_branches.contains(branch) {
            return Err(RolloutError::Store(format!("branch '{branch}' unavailable")));
        }
        Ok(state.branches.get(branch).cloned().unwrap_or_default())
    }

    async fn device_artifact(&self, device: &str) -> Result<DeviceArtifact> {
        self.state
            .read()
            .await
            .rendered
            .get(device)
            .cloned()
            .ok_or_else(|| RolloutError::Store(format!("no artifact rendered for '{device}'")))
    }

    async fn device_name(&self, object_id: &str) -> Result<String> {
        self.state
            .read()
            .await
            .names
            .get(object_id)
            .cloned()
            .ok_or_else(|| RolloutError::Store(format!("no device with id '{object_id}'")))
    }

    async fn fetch_content(&self, storage_id: &str) -> Result<String> {
        self.state
            .read()
            .await
            .contents
            .get(storage_id)
            .cloned()
            .ok_or_else(|| RolloutError::Store(format!("object '{storage_id}' not found")))
    }
}
