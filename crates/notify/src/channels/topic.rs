//! Generic topic webhook channel.
//!
//! Publishes the structured notification payload as JSON to a single
//! operator-configured HTTP endpoint (a pub/sub topic bridge, an incident
//! router, or any other consumer that accepts a POST). This is the primary
//! delivery path; chat channels are layered on top of it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::NotifyEvent;
use crate::NotifyChannel;

/// Environment variable for the topic endpoint URL.
const ENV_TOPIC_WEBHOOK_URL: &str = "TOPIC_WEBHOOK_URL";

/// Environment variable for an optional bearer token.
const ENV_TOPIC_WEBHOOK_TOKEN: &str = "TOPIC_WEBHOOK_TOKEN";

/// Per-attempt send timeout. Retries are handled by the dispatcher.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Topic webhook notification channel.
pub struct TopicChannel {
    endpoint: Option<String>,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl TopicChannel {
    /// Create a new topic channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let endpoint = std::env::var(ENV_TOPIC_WEBHOOK_URL).ok();
        let auth_token = std::env::var(ENV_TOPIC_WEBHOOK_TOKEN).ok();

        if endpoint.is_some() {
            debug!("Topic notifications enabled");
        } else {
            debug!("Topic notifications disabled (TOPIC_WEBHOOK_URL not set)");
        }

        Self {
            endpoint,
            auth_token,
            client: reqwest::Client::new(),
        }
    }

    /// Create a topic channel with a specific endpoint URL.
    #[must_use]
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint: Some(endpoint),
            auth_token: None,
            client: reqwest::Client::new(),
        }
    }

    /// Attach a bearer token sent with every publish.
    #[must_use]
    pub fn with_auth_token(mut self, token: String) -> Self {
        self.auth_token = Some(token);
        self
    }

    /// Format an event as the wire payload.
    fn format_payload(event: &NotifyEvent) -> TopicPayload<'_> {
        TopicPayload {
            severity: event.severity().as_str(),
            subject: event.title(),
            body: event.body(),
            incident_id: event.incident_id(),
            timestamp: event.timestamp(),
        }
    }
}

#[async_trait]
impl NotifyChannel for TopicChannel {
    fn name(&self) -> &'static str {
        "topic"
    }

    fn enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_TOPIC_WEBHOOK_URL.to_string()))?;

        let payload = Self::format_payload(event);

        debug!(channel = "topic", subject = %payload.subject, "Publishing notification");

        let mut request = self
            .client
            .post(endpoint)
            .timeout(SEND_TIMEOUT)
            .json(&payload);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse().ok())
                .unwrap_or(1);
            return Err(ChannelError::RateLimited { retry_after_secs });
        }

        if response.status().is_success() {
            debug!(channel = "topic", "Notification published");
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            warn!(
                channel = "topic",
                status = %status,
                body = %body,
                "Topic publish failed"
            );

            Err(ChannelError::Other(format!(
                "Topic endpoint returned {status}: {body}"
            )))
        }
    }
}

// =============================================================================
// Wire payload
// =============================================================================

#[derive(Debug, Serialize)]
struct TopicPayload<'a> {
    severity: &'static str,
    subject: String,
    body: String,
    incident_id: &'a str,
    timestamp: DateTime<Utc>,
}
