//! GraphQL client for the source-of-truth artifact store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use rollout_core::config::StoreConfig;
use rollout_core::store::ArtifactStore;
use rollout_core::types::{Artifact, DeviceArtifact};
use rollout_core::{Result, RolloutError};

const TOKEN_HEADER: &str = "X-INFRAHUB-KEY";

const ARTIFACTS_QUERY: &str = r#"
query ArtifactQuery {
  CoreArtifact {
    edges {
      node {
        checksum { value }
        storage_id { value updated_at }
        object { node { id display_label } }
      }
    }
  }
}
"#;

const DEVICE_ARTIFACT_QUERY: &str = r#"
query DeviceArtifactQuery($device: String!) {
  InfraDevice(name__value: $device) {
    edges {
      node {
        name { value }
        artifacts {
          edges {
            node {
              checksum { value }
              storage_id { value }
            }
          }
        }
      }
    }
  }
}
"#;

const DEVICE_QUERY: &str = r#"
query DeviceQuery($device_id: [ID]) {
  InfraDevice(ids: $device_id) {
    edges {
      node {
        id
        name { value }
      }
    }
  }
}
"#;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Deserialize)]
struct Edges<T> {
    edges: Vec<Edge<T>>,
}

#[derive(Deserialize)]
struct Edge<T> {
    node: T,
}

#[derive(Deserialize)]
struct Attr<T> {
    value: T,
}

#[derive(Deserialize)]
struct StorageAttr {
    value: String,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ArtifactsData {
    #[serde(rename = "CoreArtifact")]
    artifacts: Edges<ArtifactNode>,
}

#[derive(Deserialize)]
struct ArtifactNode {
    checksum: Attr<String>,
    storage_id: StorageAttr,
    object: Edge<ObjectNode>,
}

#[derive(Deserialize)]
struct ObjectNode {
    id: String,
    display_label: String,
}

#[derive(Deserialize)]
struct DevicesData {
    #[serde(rename = "InfraDevice")]
    devices: Edges<DeviceNode>,
}

#[derive(Deserialize)]
struct DeviceNode {
    name: Attr<String>,
    #[serde(default)]
    artifacts: Option<Edges<DeviceArtifactNode>>,
}

#[derive(Deserialize)]
struct DeviceArtifactNode {
    checksum: Attr<String>,
    storage_id: Attr<String>,
}

// ---------------------------------------------------------------------------
// GraphqlStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GraphqlStore {
    client: Client,
    base_url: String,
    baseline_branch: String,
    token: Option<String>,
}

impl GraphqlStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RolloutError::Config(format!("artifact store client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.address.trim_end_matches('/').to_owned(),
            baseline_branch: config.baseline_branch.clone(),
            token: config.api_token.clone(),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }

    async fn query<T: DeserializeOwned>(
        &self,
        branch: &str,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}/graphql/{}", self.base_url, branch);
        let response = self
            .authorize(self.client.post(&url))
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| RolloutError::Store(format!("POST {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RolloutError::Store(format!("POST {url}: {status}")));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| RolloutError::Store(format!("malformed response from {url}: {e}")))?;
        if let Some(first) = envelope.errors.first() {
            return Err(RolloutError::Store(format!(
                "query on branch '{branch}' failed: {}",
                first.message
            )));
        }
        envelope
            .data
            .ok_or_else(|| RolloutError::Store(format!("empty response from {url}")))
    }
}

#[async_trait]
impl ArtifactStore for GraphqlStore {
    async fn list_artifacts(&self, branch: &str) -> Result<Vec<Artifact>> {
        let data: ArtifactsData = self.query(branch, ARTIFACTS_QUERY, json!({})).await?;
        let artifacts: Vec<Artifact> = data
            .artifacts
            .edges
            .into_iter()
            .map(|edge| {
                let node = edge.node;
                Artifact {
                    object_id: node.object.node.id,
                    checksum: node.checksum.value,
                    display_label: node.object.node.display_label,
                    storage_id: node.storage_id.value,
                    updated_at: node.storage_id.updated_at,
                }
            })
            .collect();
        tracing::debug!(branch, count = artifacts.len(), "listed artifacts");
        Ok(artifacts)
    }

    async fn device_artifact(&self, device: &str) -> Result<DeviceArtifact> {
        let data: DevicesData = self
            .query(
                &self.baseline_branch,
                DEVICE_ARTIFACT_QUERY,
                json!({ "device": device }),
            )
            .await?;
        let artifact = data
            .devices
            .edges
            .into_iter()
            .next()
            .and_then(|edge| edge.node.artifacts)
            .and_then(|artifacts| artifacts.edges.into_iter().next())
            .ok_or_else(|| RolloutError::Store(format!("no artifact rendered for '{device}'")))?
            .node;
        Ok(DeviceArtifact {
            checksum: artifact.checksum.value,
            storage_id: artifact.storage_id.value,
        })
    }

    async fn device_name(&self, object_id: &str) -> Result<String> {
        let data: DevicesData = self
            .query(
                &self.baseline_branch,
                DEVICE_QUERY,
                json!({ "device_id": [object_id] }),
            )
            .await?;
        data.devices
            .edges
            .into_iter()
            .next()
            .map(|edge| edge.node.name.value)
            .ok_or_else(|| RolloutError::Store(format!("no device with id '{object_id}'")))
    }

    async fn fetch_content(&self, storage_id: &str) -> Result<String> {
        let url = format!("{}/api/storage/object/{}", self.base_url, storage_id);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| RolloutError::Store(format!("GET {url}: {e}")))?;

        match response.status() {
            StatusCode::OK => response
                .text()
                .await
                .map_err(|e| RolloutError::Store(format!("GET {url}: {e}"))),
            StatusCode::NOT_FOUND => Err(RolloutError::Store(format!(
                "object '{storage_id}' not found"
            ))),
            status => Err(RolloutError::Store(format!("GET {url}: {status}"))),
        }
    }
}
