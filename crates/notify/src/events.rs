//! Notification event types for failover orchestration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity levels for alerts and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - normal operations
    Info,
    /// Warning - something needs attention
    Warning,
    /// Critical - immediate action required
    Critical,
}

impl Severity {
    /// Get the embed color for this severity.
    #[must_use]
    pub const fn color(&self) -> u32 {
        match self {
            Self::Info => 0x0034_98db,     // Blue
            Self::Warning => 0x00f3_9c12,  // Orange
            Self::Critical => 0x00e7_4c3c, // Red
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }
}

/// Events that can trigger notifications.
///
/// Each variant corresponds to one observable transition of the failover
/// state machine and carries the incident it belongs to. Severity is fixed
/// per variant so that operators can route on it without parsing text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    // =========================================================================
    // Incident lifecycle
    // =========================================================================
    /// A new incident was opened: the primary was observed unhealthy
    IncidentOpened {
        incident_id: String,
        primary_id: String,
        status: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// The primary recovered before any promotion was attempted
    IncidentResolved {
        incident_id: String,
        primary_id: String,
        unhealthy_checks: u32,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Promotion lifecycle
    // =========================================================================
    /// Failover conditions were met except for the replication-lag gate
    PromotionWithheld {
        incident_id: String,
        standby_id: String,
        /// `None` when no lag telemetry existed in the window
        lag_seconds: Option<f64>,
        lag_threshold_secs: f64,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// A standby promotion is starting
    PromotionStarted {
        incident_id: String,
        standby_id: String,
        unhealthy_checks: u32,
        lag_seconds: f64,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// The standby was promoted and is serving as the new primary
    PromotionSucceeded {
        incident_id: String,
        standby_id: String,
        new_endpoint: String,
        duration_secs: f64,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// The promotion attempt failed; manual intervention is required
    PromotionFailed {
        incident_id: String,
        standby_id: String,
        reason: String,
        duration_secs: f64,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    /// Get a short title for this event type.
    #[must_use]
    pub fn title(&self) -> String {
        match self {
            Self::IncidentOpened { primary_id, .. } => {
                format!("Primary Unhealthy: {primary_id}")
            }
            Self::IncidentResolved { primary_id, .. } => {
                format!("Primary Recovered: {primary_id}")
            }
            Self::PromotionWithheld { standby_id, .. } => {
                format!("Promotion Withheld: {standby_id}")
            }
            Self::PromotionStarted { standby_id, .. } => {
                format!("Promoting Standby: {standby_id}")
            }
            Self::PromotionSucceeded { standby_id, .. } => {
                format!("Failover Complete: {standby_id}")
            }
            Self::PromotionFailed { standby_id, .. } => {
                format!("Failover Failed: {standby_id}")
            }
        }
    }

    /// Get the severity for this event.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::IncidentResolved { .. } => Severity::Info,

            Self::IncidentOpened { .. } | Self::PromotionWithheld { .. } => Severity::Warning,

            Self::PromotionStarted { .. }
            | Self::PromotionSucceeded { .. }
            | Self::PromotionFailed { .. } => Severity::Critical,
        }
    }

    /// Get a human-readable body for this event.
    #[must_use]
    pub fn body(&self) -> String {
        match self {
            Self::IncidentOpened {
                primary_id, status, ..
            } => {
                format!(
                    "Primary `{primary_id}` reported status `{status}`. \
                     Watching for consecutive failures before acting."
                )
            }

            Self::IncidentResolved {
                primary_id,
                unhealthy_checks,
                ..
            } => {
                format!(
                    "Primary `{primary_id}` is reachable again after {unhealthy_checks} \
                     unhealthy check(s). Incident closed without promotion."
                )
            }

            Self::PromotionWithheld {
                standby_id,
                lag_seconds,
                lag_threshold_secs,
                ..
            } => match lag_seconds {
                Some(lag) => format!(
                    "Replication lag on standby `{standby_id}` is {lag:.1}s, above the \
                     {lag_threshold_secs:.0}s threshold. Promotion withheld until the \
                     standby catches up."
                ),
                None => format!(
                    "No replication-lag telemetry for standby `{standby_id}` in the \
                     measurement window. Promotion withheld: missing data is not \
                     treated as a healthy standby."
                ),
            },

            Self::PromotionStarted {
                standby_id,
                unhealthy_checks,
                lag_seconds,
                ..
            } => {
                format!(
                    "Promoting standby `{standby_id}` after {unhealthy_checks} consecutive \
                     unhealthy checks on the primary. Replication lag at decision time: \
                     {lag_seconds:.1}s."
                )
            }

            Self::PromotionSucceeded {
                standby_id,
                new_endpoint,
                duration_secs,
                ..
            } => {
                format!(
                    "Standby `{standby_id}` promoted in {}. New primary endpoint: \
                     `{new_endpoint}`. Repoint clients and verify application traffic.",
                    format_duration(*duration_secs)
                )
            }

            Self::PromotionFailed {
                standby_id,
                reason,
                duration_secs,
                ..
            } => {
                format!(
                    "Promotion of standby `{standby_id}` failed after {}: {reason}. \
                     Manual intervention required; verify the standby before retrying.",
                    format_duration(*duration_secs)
                )
            }
        }
    }

    /// Get the incident this event belongs to.
    #[must_use]
    pub fn incident_id(&self) -> &str {
        match self {
            Self::IncidentOpened { incident_id, .. }
            | Self::IncidentResolved { incident_id, .. }
            | Self::PromotionWithheld { incident_id, .. }
            | Self::PromotionStarted { incident_id, .. }
            | Self::PromotionSucceeded { incident_id, .. }
            | Self::PromotionFailed { incident_id, .. } => incident_id,
        }
    }

    /// Get the timestamp for this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::IncidentOpened { timestamp, .. }
            | Self::IncidentResolved { timestamp, .. }
            | Self::PromotionWithheld { timestamp, .. }
            | Self::PromotionStarted { timestamp, .. }
            | Self::PromotionSucceeded { timestamp, .. }
            | Self::PromotionFailed { timestamp, .. } => *timestamp,
        }
    }
}

/// Format seconds into a human-readable duration.
pub(crate) fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{secs:.1}s")
    } else {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let total = secs.round() as u64;
        let mins = total / 60;
        let remaining_secs = total % 60;
        if remaining_secs == 0 {
            format!("{mins}m")
        } else {
            format!("{mins}m {remaining_secs}s")
        }
    }
}
