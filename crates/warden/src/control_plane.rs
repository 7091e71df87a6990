//! Typed client for the database fleet's control-plane API.
//!
//! The control plane is the management surface for the fleet: instance
//! status reads, standby promotion, snapshot creation. Every call is
//! bounded by the configured timeout; callers decide how a failure
//! degrades (the probe turns it into an unreachable sample, the promoter
//! into a failed result).

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default control-plane URL for local development
const DEFAULT_CONTROL_PLANE_URL: &str = "http://localhost:8480";

/// Configuration for the control-plane client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Base URL for the control-plane API
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token, if the API requires authentication
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    DEFAULT_CONTROL_PLANE_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth_token: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Status of one database instance as reported by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub id: String,
    /// Engine state, e.g. `available`, `promoting`, `stopped`
    pub status: String,
    /// Replication role, `primary` or `replica`
    #[serde(default)]
    pub role: String,
    /// Client-facing endpoint, present once the instance serves traffic
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl InstanceStatus {
    /// Whether the instance is up and serving.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.status.eq_ignore_ascii_case("available")
    }

    /// Whether the instance can be promoted: a healthy replica. An
    /// already-promoted instance reports `primary` and fails this check.
    #[must_use]
    pub fn is_promotable(&self) -> bool {
        self.is_available() && self.role.eq_ignore_ascii_case("replica")
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    snapshot_id: String,
}

/// Control-plane operations the failover path depends on.
#[async_trait]
pub trait FailoverControl: Send + Sync {
    /// Read one instance's current status.
    async fn instance_status(&self, instance_id: &str) -> Result<InstanceStatus>;

    /// Issue the promote-to-primary command for a standby.
    async fn promote_standby(&self, standby_id: &str) -> Result<()>;

    /// Create a snapshot of an instance, returning the snapshot identifier.
    async fn create_snapshot(&self, instance_id: &str) -> Result<String>;
}

/// HTTP implementation of [`FailoverControl`].
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    config: ControlPlaneConfig,
    client: reqwest::Client,
}

impl ControlPlaneClient {
    /// Create a new control-plane client with the given configuration.
    ///
    /// # Panics
    /// Panics if the HTTP client cannot be created.
    #[must_use]
    pub fn new(config: ControlPlaneConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self { config, client }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Check control-plane reachability.
    ///
    /// # Errors
    /// Returns an error if there's an issue building the request.
    pub async fn health_check(&self) -> Result<bool> {
        let url = self.api_url("/healthz");

        match self.with_auth(self.client.get(&url)).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                warn!(error = %e, "Control plane health check failed");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl FailoverControl for ControlPlaneClient {
    async fn instance_status(&self, instance_id: &str) -> Result<InstanceStatus> {
        let url = self.api_url(&format!("/v1/instances/{instance_id}"));

        debug!(instance_id = %instance_id, "Fetching instance status");

        let response = self
            .with_auth(self.client.get(&url))
            .send()
            .await
            .context("Failed to reach control plane")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Status read for {instance_id} failed with status {status}: {body}");
        }

        response
            .json()
            .await
            .context("Failed to parse instance status response")
    }

    async fn promote_standby(&self, standby_id: &str) -> Result<()> {
        let url = self.api_url(&format!("/v1/instances/{standby_id}/promote"));

        debug!(standby_id = %standby_id, "Issuing promote command");

        let response = self
            .with_auth(self.client.post(&url))
            .send()
            .await
            .context("Failed to send promote command")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Promote command for {standby_id} failed with status {status}: {body}");
        }

        Ok(())
    }

    async fn create_snapshot(&self, instance_id: &str) -> Result<String> {
        let url = self.api_url(&format!("/v1/instances/{instance_id}/snapshots"));

        debug!(instance_id = %instance_id, "Requesting snapshot");

        let response = self
            .with_auth(self.client.post(&url))
            .send()
            .await
            .context("Failed to send snapshot request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Snapshot request for {instance_id} failed with status {status}: {body}");
        }

        let snapshot: SnapshotResponse = response
            .json()
            .await
            .context("Failed to parse snapshot response")?;

        Ok(snapshot.snapshot_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ControlPlaneClient {
        ControlPlaneClient::new(ControlPlaneConfig {
            base_url: server.uri(),
            auth_token: None,
            timeout_secs: 5,
        })
    }

    #[test]
    fn promotable_requires_an_available_replica() {
        let status = InstanceStatus {
            id: "db-eu-west".to_string(),
            status: "available".to_string(),
            role: "replica".to_string(),
            endpoint: None,
        };
        assert!(status.is_promotable());

        let promoted = InstanceStatus {
            role: "primary".to_string(),
            ..status.clone()
        };
        assert!(promoted.is_available());
        assert!(!promoted.is_promotable());

        let stopped = InstanceStatus {
            status: "stopped".to_string(),
            ..status
        };
        assert!(!stopped.is_promotable());
    }

    #[tokio::test]
    async fn instance_status_parses_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/instances/db-us-east"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "db-us-east",
                "status": "available",
                "role": "primary",
                "endpoint": "db-us-east.example.net:5432"
            })))
            .mount(&server)
            .await;

        let status = client_for(&server)
            .instance_status("db-us-east")
            .await
            .unwrap();
        assert!(status.is_available());
        assert_eq!(status.role, "primary");
        assert_eq!(status.endpoint.as_deref(), Some("db-us-east.example.net:5432"));
    }

    #[tokio::test]
    async fn api_errors_carry_the_status_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/instances/db-us-east"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .instance_status("db-us-east")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn promote_posts_the_command_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/instances/db-eu-west/promote"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).promote_standby("db-eu-west").await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_returns_the_identifier() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/instances/db-us-east/snapshots"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({ "snapshot_id": "snap-0042" })),
            )
            .mount(&server)
            .await;

        let snapshot_id = client_for(&server)
            .create_snapshot("db-us-east")
            .await
            .unwrap();
        assert_eq!(snapshot_id, "snap-0042");
    }

    #[tokio::test]
    async fn bearer_token_is_attached_when_configured() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/instances/db-us-east"))
            .and(header("authorization", "Bearer cp-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "db-us-east",
                "status": "available",
                "role": "primary"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ControlPlaneClient::new(ControlPlaneConfig {
            base_url: server.uri(),
            auth_token: Some("cp-secret".to_string()),
            timeout_secs: 5,
        });
        client.instance_status("db-us-east").await.unwrap();
    }

    #[tokio::test]
    async fn health_check_maps_status_to_bool() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        assert!(!client_for(&server).health_check().await.unwrap());
    }
}
