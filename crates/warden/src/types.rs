//! Core value types and component seams for the failover control loop.
//!
//! Telemetry components produce immutable samples. Absence of data and
//! transport failure are first-class states on the sample itself, so the
//! state machine never has to unwrap an error to make a decision.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::incident::{Incident, IncidentState};

/// One observation of primary reachability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    /// Whether the control plane reports the primary as serving
    pub primary_available: bool,
    /// Raw engine status string, `"unreachable"` when telemetry failed
    pub status: String,
    pub observed_at: DateTime<Utc>,
}

impl HealthSample {
    /// Conservative sample used when the probe timed out or errored.
    /// Missing telemetry counts as evidence of unhealthiness, never the
    /// other way around.
    #[must_use]
    pub fn unreachable(observed_at: DateTime<Utc>) -> Self {
        Self {
            primary_available: false,
            status: "unreachable".to_string(),
            observed_at,
        }
    }
}

/// One observation of standby replication lag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LagSample {
    pub lag_seconds: f64,
    pub observed_at: DateTime<Utc>,
    /// `false` when no datapoint existed in the window. Distinct from zero
    /// lag: a missing measurement can never authorize a promotion.
    pub data_available: bool,
}

impl LagSample {
    /// Sample representing "no datapoint in the measurement window".
    #[must_use]
    pub const fn missing(observed_at: DateTime<Utc>) -> Self {
        Self {
            lag_seconds: 0.0,
            observed_at,
            data_available: false,
        }
    }

    /// True when this sample clears the lag gate for promotion.
    #[must_use]
    pub fn below_threshold(&self, threshold_secs: f64) -> bool {
        self.data_available && self.lag_seconds < threshold_secs
    }
}

/// Outcome of one promotion attempt.
///
/// Always a value, never an error: the executor converts every failure
/// mode into `succeeded == false` with a reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionResult {
    pub succeeded: bool,
    /// Endpoint clients should use after the cutover
    pub new_endpoint: Option<String>,
    pub duration_seconds: f64,
    pub error: Option<String>,
}

impl PromotionResult {
    #[must_use]
    pub fn success(new_endpoint: String, duration: Duration) -> Self {
        Self {
            succeeded: true,
            new_endpoint: Some(new_endpoint),
            duration_seconds: duration.as_secs_f64(),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            succeeded: false,
            new_endpoint: None,
            duration_seconds: duration.as_secs_f64(),
            error: Some(error.into()),
        }
    }
}

/// Probes primary reachability through the control plane.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Single bounded status read. Implementations degrade timeouts and
    /// transport errors into an `unreachable` sample instead of failing.
    async fn probe(&self, primary_id: &str) -> HealthSample;
}

/// Measures standby replication lag over a trailing window.
#[async_trait]
pub trait LagMonitor: Send + Sync {
    /// Latest datapoint within the window, `data_available == false` when
    /// the window is empty or the query failed.
    async fn measure(&self, standby_id: &str, window: Duration) -> LagSample;
}

/// Executes the one-shot standby promotion sequence.
#[async_trait]
pub trait FailoverExecutor: Send + Sync {
    /// Verify, snapshot, promote, poll. Infallible by contract.
    async fn promote(&self, incident: &Incident) -> PromotionResult;
}

/// What a completed tick did, for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickAction {
    /// Primary healthy, no open incident
    None,
    /// First unhealthy observation opened an incident
    OpenedIncident,
    /// Unhealthy again, still below the promotion threshold
    ObservedUnhealthy,
    /// Threshold met but the lag gate refused the promotion
    WithheldPromotion,
    /// Promotion ran and succeeded
    Promoted,
    /// Promotion ran and failed
    PromotionFailed,
    /// Primary recovered and the incident was archived
    ResolvedIncident,
    /// Interrupted promotion from a dead run was marked failed
    AbandonedPromotion,
    /// Incident already failed, holding until the operator steps in
    AwaitingOperator,
}

impl TickAction {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::OpenedIncident => "opened_incident",
            Self::ObservedUnhealthy => "observed_unhealthy",
            Self::WithheldPromotion => "withheld_promotion",
            Self::Promoted => "promoted",
            Self::PromotionFailed => "promotion_failed",
            Self::ResolvedIncident => "resolved_incident",
            Self::AbandonedPromotion => "abandoned_promotion",
            Self::AwaitingOperator => "awaiting_operator",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "opened_incident" => Some(Self::OpenedIncident),
            "observed_unhealthy" => Some(Self::ObservedUnhealthy),
            "withheld_promotion" => Some(Self::WithheldPromotion),
            "promoted" => Some(Self::Promoted),
            "promotion_failed" => Some(Self::PromotionFailed),
            "resolved_incident" => Some(Self::ResolvedIncident),
            "abandoned_promotion" => Some(Self::AbandonedPromotion),
            "awaiting_operator" => Some(Self::AwaitingOperator),
            _ => None,
        }
    }
}

impl fmt::Display for TickAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured record emitted by every completed tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickRecord {
    pub at: DateTime<Utc>,
    /// Incident the tick operated on, if any
    pub incident_id: Option<Uuid>,
    /// Incident state after the tick
    pub incident_state: IncidentState,
    pub action: TickAction,
    pub notifications_sent: u32,
}
