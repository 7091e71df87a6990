//! Slack webhook notification channel.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::{NotifyEvent, Severity};
use crate::NotifyChannel;

/// Environment variable for Slack webhook URL.
const ENV_SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";

/// Per-attempt send timeout. Retries are handled by the dispatcher.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Slack webhook notification channel.
pub struct SlackChannel {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl SlackChannel {
    /// Create a new Slack channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let webhook_url = std::env::var(ENV_SLACK_WEBHOOK_URL).ok();

        if webhook_url.is_some() {
            debug!("Slack notifications enabled");
        } else {
            debug!("Slack notifications disabled (SLACK_WEBHOOK_URL not set)");
        }

        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a Slack channel with a specific webhook URL.
    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url: Some(webhook_url),
            client: reqwest::Client::new(),
        }
    }

    /// Format an event as a Slack webhook payload.
    fn format_payload(event: &NotifyEvent) -> SlackPayload {
        let color = match event.severity() {
            Severity::Info => "#3498db",     // Blue
            Severity::Warning => "#f39c12",  // Orange
            Severity::Critical => "#e74c3c", // Red
        };

        let mut fields = vec![];
        for (name, value) in Self::format_fields(event) {
            fields.push(SlackField {
                title: name,
                value,
                short: true,
            });
        }

        let attachment = SlackAttachment {
            fallback: event.title(),
            color: color.to_string(),
            pretext: None,
            author_name: Some("Failover Warden".to_string()),
            title: event.title(),
            text: Self::format_description(event),
            fields,
            footer: Some(format!(
                "{} | {}",
                event.severity().as_str(),
                event.timestamp().format("%Y-%m-%d %H:%M:%S UTC")
            )),
            ts: Some(event.timestamp().timestamp()),
        };

        SlackPayload {
            attachments: vec![attachment],
        }
    }

    /// Format the description for an event.
    fn format_description(event: &NotifyEvent) -> String {
        match event {
            NotifyEvent::IncidentOpened {
                primary_id, status, ..
            } => {
                format!("Primary `{primary_id}` reported status `{status}`")
            }

            NotifyEvent::IncidentResolved {
                primary_id,
                unhealthy_checks,
                ..
            } => {
                format!(
                    "Primary `{primary_id}` recovered after {unhealthy_checks} unhealthy \
                     check(s)\nIncident closed without promotion"
                )
            }

            NotifyEvent::PromotionWithheld {
                standby_id,
                lag_seconds,
                lag_threshold_secs,
                ..
            } => match lag_seconds {
                Some(lag) => format!(
                    "Standby `{standby_id}` lag is *{lag:.1}s* \
                     (threshold {lag_threshold_secs:.0}s)\nPromotion withheld"
                ),
                None => format!(
                    "No lag telemetry for standby `{standby_id}`\nPromotion withheld"
                ),
            },

            NotifyEvent::PromotionStarted {
                standby_id,
                unhealthy_checks,
                ..
            } => {
                format!(
                    "Promoting standby `{standby_id}` after {unhealthy_checks} consecutive \
                     unhealthy checks"
                )
            }

            NotifyEvent::PromotionSucceeded {
                standby_id,
                new_endpoint,
                ..
            } => {
                format!(
                    "✅ Standby `{standby_id}` is the new primary\n*Endpoint:* `{new_endpoint}`"
                )
            }

            NotifyEvent::PromotionFailed {
                standby_id, reason, ..
            } => {
                format!("❌ Promotion of `{standby_id}` failed\n*Reason:* {reason}")
            }
        }
    }

    /// Format additional fields for an event.
    fn format_fields(event: &NotifyEvent) -> Vec<(String, String)> {
        match event {
            NotifyEvent::IncidentOpened {
                incident_id,
                primary_id,
                status,
                ..
            } => vec![
                ("Incident".to_string(), incident_id.clone()),
                ("Primary".to_string(), primary_id.clone()),
                ("Status".to_string(), status.clone()),
            ],

            NotifyEvent::IncidentResolved {
                incident_id,
                primary_id,
                unhealthy_checks,
                ..
            } => vec![
                ("Incident".to_string(), incident_id.clone()),
                ("Primary".to_string(), primary_id.clone()),
                ("Unhealthy Checks".to_string(), unhealthy_checks.to_string()),
            ],

            NotifyEvent::PromotionWithheld {
                incident_id,
                standby_id,
                lag_seconds,
                lag_threshold_secs,
                ..
            } => vec![
                ("Incident".to_string(), incident_id.clone()),
                ("Standby".to_string(), standby_id.clone()),
                (
                    "Lag".to_string(),
                    lag_seconds.map_or_else(|| "no data".to_string(), |l| format!("{l:.1}s")),
                ),
                (
                    "Threshold".to_string(),
                    format!("{lag_threshold_secs:.0}s"),
                ),
            ],

            NotifyEvent::PromotionStarted {
                incident_id,
                standby_id,
                lag_seconds,
                ..
            } => vec![
                ("Incident".to_string(), incident_id.clone()),
                ("Standby".to_string(), standby_id.clone()),
                ("Lag".to_string(), format!("{lag_seconds:.1}s")),
            ],

            NotifyEvent::PromotionSucceeded {
                incident_id,
                new_endpoint,
                duration_secs,
                ..
            } => vec![
                ("Incident".to_string(), incident_id.clone()),
                ("Endpoint".to_string(), new_endpoint.clone()),
                ("Duration".to_string(), format!("{duration_secs:.1}s")),
            ],

            NotifyEvent::PromotionFailed {
                incident_id,
                standby_id,
                duration_secs,
                ..
            } => vec![
                ("Incident".to_string(), incident_id.clone()),
                ("Standby".to_string(), standby_id.clone()),
                ("Duration".to_string(), format!("{duration_secs:.1}s")),
            ],
        }
    }
}

#[async_trait]
impl NotifyChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_SLACK_WEBHOOK_URL.to_string()))?;

        let payload = Self::format_payload(event);

        debug!(channel = "slack", event_type = ?event.title(), "Sending notification");

        let response = self
            .client
            .post(webhook_url)
            .timeout(SEND_TIMEOUT)
            .json(&payload)
            .send()
            .await?;

        if response.status().is_success() {
            debug!(channel = "slack", "Notification sent successfully");
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            warn!(
                channel = "slack",
                status = %status,
                body = %body,
                "Slack webhook request failed"
            );

            Err(ChannelError::Other(format!(
                "Slack returned {status}: {body}"
            )))
        }
    }
}

// =============================================================================
// Slack API types
// =============================================================================

#[derive(Debug, Serialize)]
struct SlackPayload {
    attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
    fallback: String,
    color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pretext: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_name: Option<String>,
    title: String,
    text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<SlackField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SlackField {
    title: String,
    value: String,
    short: bool,
}
