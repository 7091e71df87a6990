//! Notification fan-out for failover orchestration events.
//!
//! This crate delivers state-change and alert events from the failover
//! control loop to operator-facing channels (a generic topic webhook,
//! Slack) with bounded retry per channel.
//!
//! # Usage
//!
//! ```no_run
//! use notify::{Notifier, NotifyEvent};
//!
//! # async fn example() {
//! // Create notifier from environment variables
//! let notifier = Notifier::from_env();
//!
//! // Deliver to every enabled channel and collect per-channel results
//! let results = notifier
//!     .notify_and_wait(NotifyEvent::IncidentOpened {
//!         incident_id: "9b1deb4d-3b7d-4bad-9bdd-2b0d7b3dcb6d".to_string(),
//!         primary_id: "db-primary-west".to_string(),
//!         status: "unreachable".to_string(),
//!         timestamp: chrono::Utc::now(),
//!     })
//!     .await;
//! # let _ = results;
//! # }
//! ```
//!
//! # Configuration
//!
//! The notifier is configured via environment variables:
//!
//! - `TOPIC_WEBHOOK_URL`: topic endpoint URL (enables the topic channel)
//! - `TOPIC_WEBHOOK_TOKEN`: optional bearer token for the topic endpoint
//! - `SLACK_WEBHOOK_URL`: Slack webhook URL (enables the Slack channel)
//! - `NOTIFY_DISABLED`: set to "true" to disable all notifications
//!
//! # Architecture
//!
//! The notification system uses a trait-based channel design for extensibility:
//!
//! - [`NotifyChannel`] trait defines the interface for notification channels
//! - [`TopicChannel`] publishes the structured payload to a webhook endpoint
//! - [`SlackChannel`] posts severity-colored attachments to Slack
//! - [`Notifier`] dispatches events to all enabled channels with retry
//!
//! Delivery is at-least-once: a retried send can reach a channel that
//! already accepted the event, so consumers must treat duplicates as
//! idempotent. A channel that stays down after all retries is reported in
//! the per-channel results and never fails the caller.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;

pub use channels::slack::SlackChannel;
pub use channels::topic::TopicChannel;
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{NotifyEvent, Severity};

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable to disable all notifications.
const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";

/// Retry schedule for a single channel delivery.
///
/// Retry `k` (0-based) waits `min(base_delay * 2^k, max_delay)` plus a
/// uniform jitter in `[0, base_delay)` so that multiple channels do not
/// hammer a shared egress in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Base delay; doubled per retry and also the jitter bound.
    pub base_delay: Duration,
    /// Ceiling for the exponential component.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Default schedule: 5 retries, 1s base, 30s ceiling.
    pub const DEFAULT: Self = Self {
        max_retries: 5,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
    };

    /// Compute the wait before retry `attempt` (0-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let capped = (base * 2_f64.powi(exponent)).min(self.max_delay.as_secs_f64());
        let jitter = if base > 0.0 {
            rand::thread_rng().gen_range(0.0..base)
        } else {
            0.0
        };
        Duration::from_secs_f64(capped + jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Central notification dispatcher.
///
/// The `Notifier` manages multiple notification channels and delivers each
/// event to all enabled channels, retrying transient failures per channel.
pub struct Notifier {
    channels: Vec<Arc<dyn NotifyChannel>>,
    retry: RetryPolicy,
    disabled: bool,
}

impl Notifier {
    /// Create a new notifier from environment variables.
    ///
    /// This will auto-detect which channels are configured based on
    /// environment variables and enable them accordingly.
    #[must_use]
    pub fn from_env() -> Self {
        let disabled = std::env::var(ENV_NOTIFY_DISABLED)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        if disabled {
            info!("Notifications disabled via NOTIFY_DISABLED");
            return Self {
                channels: vec![],
                retry: RetryPolicy::DEFAULT,
                disabled: true,
            };
        }

        let mut channels: Vec<Arc<dyn NotifyChannel>> = vec![];

        let topic = TopicChannel::from_env();
        if topic.enabled() {
            info!("Topic notifications enabled");
            channels.push(Arc::new(topic));
        }

        let slack = SlackChannel::from_env();
        if slack.enabled() {
            info!("Slack notifications enabled");
            channels.push(Arc::new(slack));
        }

        if channels.is_empty() {
            warn!("No notification channels configured");
        } else {
            info!(
                channel_count = channels.len(),
                "Notification system initialized"
            );
        }

        Self {
            channels,
            retry: RetryPolicy::DEFAULT,
            disabled: false,
        }
    }

    /// Create a notifier with specific channels.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        Self {
            channels,
            retry: RetryPolicy::DEFAULT,
            disabled: false,
        }
    }

    /// Override the retry schedule.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Create a disabled notifier (for testing or when notifications are off).
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            channels: vec![],
            retry: RetryPolicy::DEFAULT,
            disabled: true,
        }
    }

    /// Check if any notification channels are enabled.
    #[must_use]
    pub fn has_channels(&self) -> bool {
        !self.disabled && !self.channels.is_empty()
    }

    /// Get the number of enabled channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        if self.disabled {
            0
        } else {
            self.channels.len()
        }
    }

    /// Names of the configured channels, in delivery order.
    #[must_use]
    pub fn channel_names(&self) -> Vec<&'static str> {
        if self.disabled {
            return vec![];
        }
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Deliver an event to all enabled channels and wait for completion.
    ///
    /// Channels are delivered to concurrently; each channel gets its own
    /// retry schedule. Returns one `(channel name, result)` pair per enabled
    /// channel. A failed channel never aborts the others.
    pub async fn notify_and_wait(
        &self,
        event: NotifyEvent,
    ) -> Vec<(String, Result<(), ChannelError>)> {
        if self.disabled || self.channels.is_empty() {
            debug!("Notifications disabled or no channels, skipping event");
            return vec![];
        }

        let event = Arc::new(event);
        let retry = self.retry;

        let deliveries = self
            .channels
            .iter()
            .filter(|channel| channel.enabled())
            .map(|channel| {
                let channel = Arc::clone(channel);
                let event = Arc::clone(&event);
                async move {
                    let name = channel.name().to_string();
                    let result = send_with_retry(channel.as_ref(), &event, retry).await;
                    (name, result)
                }
            });

        futures::future::join_all(deliveries).await
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Send one event through one channel, retrying per the policy.
async fn send_with_retry(
    channel: &dyn NotifyChannel,
    event: &NotifyEvent,
    retry: RetryPolicy,
) -> Result<(), ChannelError> {
    let mut attempt = 0;

    loop {
        match channel.send(event).await {
            Ok(()) => {
                debug!(
                    channel = channel.name(),
                    attempts = attempt + 1,
                    "Notification sent"
                );
                return Ok(());
            }
            Err(err) if attempt < retry.max_retries => {
                // A rate-limited channel tells us exactly how long to wait.
                let wait = match &err {
                    ChannelError::RateLimited { retry_after_secs } => {
                        Duration::from_secs(*retry_after_secs)
                    }
                    _ => retry.delay_for_attempt(attempt),
                };

                warn!(
                    channel = channel.name(),
                    attempt = attempt + 1,
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Notification attempt failed, backing off"
                );

                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(
                    channel = channel.name(),
                    attempts = attempt + 1,
                    error = %err,
                    "Notification delivery exhausted retries"
                );
                return Err(err);
            }
        }
    }
}
