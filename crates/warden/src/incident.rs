//! Incident lifecycle for one candidate failover episode.
//!
//! An incident opens on the first unhealthy probe and tracks the episode
//! until it is archived. A successful promotion archives it immediately; a
//! failed promotion leaves it open with `promotion_attempted` latched so
//! the same outage can never trigger a second promotion, and it is only
//! archived once the primary recovers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Where an incident stands in the failover state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentState {
    Healthy,
    Degraded,
    PromotionInFlight,
    Promoted,
    Failed,
}

impl IncidentState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::PromotionInFlight => "promotion_in_flight",
            Self::Promoted => "promoted",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "healthy" => Some(Self::Healthy),
            "degraded" => Some(Self::Degraded),
            "promotion_in_flight" => Some(Self::PromotionInFlight),
            "promoted" => Some(Self::Promoted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for IncidentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an archived incident ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Primary came back before any promotion ran
    Recovered,
    /// Standby was promoted and serves as the new primary
    Promoted,
    /// Promotion failed or was interrupted
    Failed,
}

impl Resolution {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Recovered => "recovered",
            Self::Promoted => "promoted",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "recovered" => Some(Self::Recovered),
            "promoted" => Some(Self::Promoted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked outage episode on the watched primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub state: IncidentState,
    pub first_unhealthy_at: DateTime<Utc>,
    pub last_observed_at: DateTime<Utc>,
    pub consecutive_unhealthy_checks: u32,
    /// Set exactly once, right before the promote call is issued, and
    /// never cleared for the lifetime of the incident
    pub promotion_attempted: bool,
    /// Cooldown marker for repeated withheld-promotion warnings
    pub last_warned_at: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
    /// New endpoint on promotion, failure reason otherwise
    pub resolution_detail: Option<String>,
    /// Set when the incident is archived; archived rows are immutable
    pub closed_at: Option<DateTime<Utc>>,
    /// Row version for optimistic concurrency, managed by the store
    pub version: i64,
}

impl Incident {
    /// Open a fresh incident on the first unhealthy observation.
    #[must_use]
    pub fn open(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: IncidentState::Degraded,
            first_unhealthy_at: now,
            last_observed_at: now,
            consecutive_unhealthy_checks: 1,
            promotion_attempted: false,
            last_warned_at: None,
            resolution: None,
            resolution_detail: None,
            closed_at: None,
            version: 1,
        }
    }

    /// Record another consecutive unhealthy observation.
    pub fn record_unhealthy(&mut self, now: DateTime<Utc>) {
        self.consecutive_unhealthy_checks += 1;
        self.last_observed_at = now;
    }

    /// Enter the exclusive promotion state. `promotion_attempted` goes true
    /// here, before any promote call is issued, so a crash mid-promotion
    /// still leaves the latch set.
    pub fn begin_promotion(&mut self, now: DateTime<Utc>) {
        self.state = IncidentState::PromotionInFlight;
        self.promotion_attempted = true;
        self.last_observed_at = now;
    }

    /// Archive the incident because the primary recovered on its own.
    pub fn close_recovered(&mut self, now: DateTime<Utc>) {
        self.state = IncidentState::Healthy;
        self.resolution = Some(Resolution::Recovered);
        self.last_observed_at = now;
        self.closed_at = Some(now);
    }

    /// Archive the incident after a successful promotion.
    pub fn close_promoted(&mut self, now: DateTime<Utc>, new_endpoint: Option<String>) {
        self.state = IncidentState::Promoted;
        self.resolution = Some(Resolution::Promoted);
        self.resolution_detail = new_endpoint;
        self.last_observed_at = now;
        self.closed_at = Some(now);
    }

    /// Mark the promotion as failed. The incident stays open so the latch
    /// keeps blocking further promotions until an operator (or recovery)
    /// resolves the episode.
    pub fn mark_failed(&mut self, now: DateTime<Utc>, reason: impl Into<String>) {
        self.state = IncidentState::Failed;
        self.resolution = Some(Resolution::Failed);
        self.resolution_detail = Some(reason.into());
        self.last_observed_at = now;
    }

    /// Archive an incident whose terminal state was already recorded.
    pub fn archive(&mut self, now: DateTime<Utc>) {
        self.last_observed_at = now;
        self.closed_at = Some(now);
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    /// Whether a withheld-promotion warning is due under the cooldown.
    #[must_use]
    pub fn warning_due(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        self.last_warned_at.map_or(true, |last| now - last >= cooldown)
    }

    pub fn mark_warned(&mut self, now: DateTime<Utc>) {
        self.last_warned_at = Some(now);
    }
}
