//! Replication-lag measurement from range-query telemetry.
//!
//! Queries a Prometheus-style `query_range` API for the standby's lag
//! series over a trailing window. "No datapoint in the window" is reported
//! as a sample with `data_available == false`, never as zero lag, so a
//! silent exporter cannot be mistaken for a caught-up standby.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::{LagMonitor, LagSample};

/// Default telemetry URL for local development
const DEFAULT_TELEMETRY_URL: &str = "http://localhost:9090";

/// Configuration for the lag telemetry client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Base URL for the telemetry API
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Lag query template; `{standby}` expands to the standby instance id
    #[serde(default = "default_lag_query")]
    pub lag_query: String,
    /// Range-query resolution step in seconds
    #[serde(default = "default_step_secs")]
    pub step_secs: u64,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    DEFAULT_TELEMETRY_URL.to_string()
}

fn default_lag_query() -> String {
    r#"pg_replication_lag_seconds{instance="{standby}"}"#.to_string()
}

fn default_step_secs() -> u64 {
    60
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            lag_query: default_lag_query(),
            step_secs: default_step_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Telemetry query response
#[derive(Debug, Deserialize)]
struct RangeResponse {
    status: String,
    data: RangeData,
}

#[derive(Debug, Deserialize)]
struct RangeData {
    #[serde(rename = "resultType")]
    #[allow(dead_code)]
    result_type: String,
    result: Vec<RangeSeries>,
}

#[derive(Debug, Deserialize)]
struct RangeSeries {
    #[allow(dead_code)]
    metric: HashMap<String, String>,
    values: Vec<(f64, String)>,
}

/// One datapoint of the lag series.
#[derive(Debug, Clone, Copy)]
pub struct LagPoint {
    pub at: DateTime<Utc>,
    pub value: f64,
}

/// HTTP client for the lag telemetry API.
#[derive(Debug, Clone)]
pub struct TelemetryClient {
    config: TelemetryConfig,
    client: reqwest::Client,
}

impl TelemetryClient {
    /// Create a new telemetry client with the given configuration.
    ///
    /// # Panics
    /// Panics if the HTTP client cannot be created.
    #[must_use]
    pub fn new(config: TelemetryConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self { config, client }
    }

    /// Execute a range query, flattening all returned series.
    ///
    /// # Errors
    /// Returns an error if the query fails or the response cannot be parsed.
    pub async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step_secs: u64,
    ) -> Result<Vec<LagPoint>> {
        let url = format!(
            "{}/api/v1/query_range",
            self.config.base_url.trim_end_matches('/')
        );

        debug!(query = %query, start = %start, end = %end, step_secs, "Executing telemetry range query");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("query", query),
                ("start", &start.timestamp().to_string()),
                ("end", &end.timestamp().to_string()),
                ("step", &step_secs.to_string()),
            ])
            .send()
            .await
            .context("Failed to send range query to telemetry")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Telemetry range query failed with status {status}: {body}");
        }

        let range_response: RangeResponse = response
            .json()
            .await
            .context("Failed to parse telemetry response")?;

        if range_response.status != "success" {
            anyhow::bail!(
                "Telemetry range query returned status: {}",
                range_response.status
            );
        }

        let mut points = Vec::new();
        for series in &range_response.data.result {
            for (timestamp, value_str) in &series.values {
                let value: f64 = value_str.parse().unwrap_or(0.0);
                let at = DateTime::from_timestamp(*timestamp as i64, 0).unwrap_or_else(Utc::now);
                points.push(LagPoint { at, value });
            }
        }

        Ok(points)
    }

    /// Check telemetry reachability.
    ///
    /// # Errors
    /// Returns an error if there's an issue building the request.
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/-/healthy", self.config.base_url.trim_end_matches('/'));

        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                warn!(error = %e, "Telemetry health check failed");
                Ok(false)
            }
        }
    }
}

/// Range-query-backed lag monitor.
pub struct MetricsLagMonitor {
    client: TelemetryClient,
}

impl MetricsLagMonitor {
    #[must_use]
    pub const fn new(client: TelemetryClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LagMonitor for MetricsLagMonitor {
    async fn measure(&self, standby_id: &str, window: Duration) -> LagSample {
        let end = Utc::now();
        let start = end
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(300));
        let query = self.client.config.lag_query.replace("{standby}", standby_id);

        let points = match self
            .client
            .query_range(&query, start, end, self.client.config.step_secs)
            .await
        {
            Ok(points) => points,
            Err(e) => {
                warn!(standby_id = %standby_id, error = %e, "Lag query failed, reporting no data");
                return LagSample::missing(end);
            }
        };

        // Several series can report the same instant; average them at the
        // newest timestamp in the window.
        let Some(latest) = points.iter().map(|point| point.at).max() else {
            debug!(standby_id = %standby_id, "No lag datapoints in window");
            return LagSample::missing(end);
        };
        let at_latest: Vec<f64> = points
            .iter()
            .filter(|point| point.at == latest)
            .map(|point| point.value)
            .collect();
        #[allow(clippy::cast_precision_loss)]
        let lag_seconds = at_latest.iter().sum::<f64>() / at_latest.len() as f64;

        LagSample {
            lag_seconds,
            observed_at: latest,
            data_available: true,
        }
    }
}
