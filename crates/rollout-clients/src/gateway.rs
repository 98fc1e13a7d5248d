//! JSON management-gateway device channel.
//!
//! Each device runs a gateway that accepts a full-subtree replace as
//! `POST /config/replace` with basic auth and answers with every element it
//! changed as `[op, path, value]` triples.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use rollout_core::apply::{DeviceChannel, DeviceTarget, RawChange};
use rollout_core::error::ApplyFault;
use rollout_core::{Result, RolloutError};

#[derive(Deserialize)]
struct ReplaceResponse {
    #[serde(default)]
    changes: Vec<(String, String, serde_json::Value)>,
}

#[derive(Debug, Clone)]
pub struct GatewayChannel {
    verified: Client,
    unverified: Client,
    scheme: &'static str,
}

impl GatewayChannel {
    pub fn new() -> Result<Self> {
        let build = |skip_verify: bool| {
            Client::builder()
                .danger_accept_invalid_certs(skip_verify)
                .build()
                .map_err(|e| RolloutError::Config(format!("device gateway client: {e}")))
        };
        Ok(Self {
            verified: build(false)?,
            unverified: build(true)?,
            scheme: "https",
        })
    }

    /// Talk plain HTTP instead of HTTPS.
    pub fn plaintext(mut self) -> Self {
        self.scheme = "http";
        self
    }

    fn url(&self, target: &DeviceTarget) -> String {
        format!(
            "{}://{}:{}/config/replace",
            self.scheme, target.address, target.port
        )
    }
}

fn classify_send_error(e: &reqwest::Error) -> ApplyFault {
    if e.is_timeout() {
        ApplyFault::Timeout(e.to_string())
    } else if e.is_connect() {
        ApplyFault::Connection(e.to_string())
    } else {
        ApplyFault::Protocol(e.to_string())
    }
}

fn classify_status(status: StatusCode, body: String) -> ApplyFault {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApplyFault::Auth(detail),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            ApplyFault::Connection(detail)
        }
        s if s.is_client_error() => ApplyFault::Rejected(detail),
        _ => ApplyFault::Protocol(detail),
    }
}

#[async_trait]
impl DeviceChannel for GatewayChannel {
    async fn replace(
        &self,
        target: &DeviceTarget,
        path: &str,
        document: &serde_json::Value,
    ) -> std::result::Result<Vec<RawChange>, ApplyFault> {
        let client = if target.skip_verify {
            &self.unverified
        } else {
            &self.verified
        };
        let url = self.url(target);
        tracing::debug!(device = %target.name, url = %url, "sending replace");

        let response = client
            .post(&url)
            .basic_auth(&target.username, Some(&target.password))
            .timeout(Duration::from_secs(target.timeout_secs))
            .json(&json!({ "path": path, "encoding": "json_ietf", "value": document }))
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let reply: ReplaceResponse = response
            .json()
            .await
            .map_err(|e| ApplyFault::Protocol(format!("malformed replace response: {e}")))?;
        Ok(reply
            .changes
            .into_iter()
            .map(|(op, path, value)| RawChange { op, path, value })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, String::new()),
            ApplyFault::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad leaf".into()),
            ApplyFault::Rejected(ref m) if m.contains("bad leaf")
        ));
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_retryable());
        assert!(!classify_status(StatusCode::INTERNAL_SERVER_ERROR, String::new()).is_retryable());
    }

    #[test]
    fn url_uses_target_address_and_port() {
        let channel = GatewayChannel::new().unwrap();
        let target = DeviceTarget::from_config("leaf1", &Default::default());
        assert_eq!(channel.url(&target), "https://leaf1:57400/config/replace");
        assert_eq!(
            channel.plaintext().url(&target),
            "http://leaf1:57400/config/replace"
        );
    }
}
