//! Configuration for the warden daemon.
//!
//! Values come from an optional TOML file (serde fills every missing field
//! with its default), then individual `FAILOVER_*` environment variables
//! override on top, then the result is validated. A config file is never
//! required; the defaults describe a complete local setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::control_plane::ControlPlaneConfig;
use crate::lag::TelemetryConfig;

/// Config file consulted when `--config` is not given
const DEFAULT_CONFIG_PATH: &str = "warden.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Instance identifier of the watched primary
    #[serde(default = "default_primary_id")]
    pub primary_id: String,
    /// Instance identifier of the promotable standby
    #[serde(default = "default_standby_id")]
    pub standby_id: String,
    /// Seconds between evaluation ticks
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Per-probe timeout in seconds
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Consecutive unhealthy checks required before promotion
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    /// Promotion requires measured lag strictly below this, in seconds
    #[serde(default = "default_lag_threshold_secs")]
    pub lag_threshold_secs: f64,
    /// Trailing lag measurement window in seconds
    #[serde(default = "default_lag_window_secs")]
    pub lag_window_secs: u64,
    /// Recent health samples kept for diagnostics
    #[serde(default = "default_health_window")]
    pub health_window: usize,
    /// Seconds between promotion status polls
    #[serde(default = "default_promotion_poll_interval_secs")]
    pub promotion_poll_interval_secs: u64,
    /// Hard ceiling for one promotion attempt, in seconds
    #[serde(default = "default_promotion_timeout_secs")]
    pub promotion_timeout_secs: u64,
    /// Minimum spacing between repeated withheld-promotion warnings
    #[serde(default = "default_notify_cooldown_secs")]
    pub notify_cooldown_secs: u64,
    /// Delivery retries per notification after the initial attempt
    #[serde(default = "default_notifier_max_retries")]
    pub notifier_max_retries: u32,
    /// Base delay for notification retry backoff, in seconds
    #[serde(default = "default_notifier_base_delay_secs")]
    pub notifier_base_delay_secs: u64,
    /// Backoff ceiling for notification retries, in seconds
    #[serde(default = "default_notifier_max_delay_secs")]
    pub notifier_max_delay_secs: u64,
    /// Days of archived incidents and tick records to keep
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Path of the incident database
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

/// Delivery channels for orchestration events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Generic webhook endpoint for the operations topic
    #[serde(default)]
    pub topic_url: Option<String>,
    /// Bearer token for the topic endpoint
    #[serde(default)]
    pub topic_token: Option<String>,
    /// Slack incoming-webhook URL
    #[serde(default)]
    pub slack_webhook_url: Option<String>,
    /// Disable all deliveries while keeping event logging
    #[serde(default)]
    pub disabled: bool,
}

fn default_primary_id() -> String {
    "db-us-east".to_string()
}

fn default_standby_id() -> String {
    "db-eu-west".to_string()
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_unhealthy_threshold() -> u32 {
    2
}

fn default_lag_threshold_secs() -> f64 {
    60.0
}

fn default_lag_window_secs() -> u64 {
    300
}

fn default_health_window() -> usize {
    5
}

fn default_promotion_poll_interval_secs() -> u64 {
    15
}

fn default_promotion_timeout_secs() -> u64 {
    300
}

fn default_notify_cooldown_secs() -> u64 {
    300
}

fn default_notifier_max_retries() -> u32 {
    5
}

fn default_notifier_base_delay_secs() -> u64 {
    1
}

fn default_notifier_max_delay_secs() -> u64 {
    30
}

fn default_retention_days() -> u32 {
    30
}

fn default_db_path() -> PathBuf {
    PathBuf::from("warden.db")
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            primary_id: default_primary_id(),
            standby_id: default_standby_id(),
            tick_interval_secs: default_tick_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            unhealthy_threshold: default_unhealthy_threshold(),
            lag_threshold_secs: default_lag_threshold_secs(),
            lag_window_secs: default_lag_window_secs(),
            health_window: default_health_window(),
            promotion_poll_interval_secs: default_promotion_poll_interval_secs(),
            promotion_timeout_secs: default_promotion_timeout_secs(),
            notify_cooldown_secs: default_notify_cooldown_secs(),
            notifier_max_retries: default_notifier_max_retries(),
            notifier_base_delay_secs: default_notifier_base_delay_secs(),
            notifier_max_delay_secs: default_notifier_max_delay_secs(),
            retention_days: default_retention_days(),
            db_path: default_db_path(),
            control_plane: ControlPlaneConfig::default(),
            telemetry: TelemetryConfig::default(),
            notifications: NotificationsConfig::default(),
        }
    }
}

impl WardenConfig {
    /// Load configuration: TOML file (explicit path, or `warden.toml` if it
    /// exists), then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_PATH);
                if fallback.exists() {
                    Self::from_file(fallback)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply `FAILOVER_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = env_string("FAILOVER_PRIMARY_ID") {
            self.primary_id = value;
        }
        if let Some(value) = env_string("FAILOVER_STANDBY_ID") {
            self.standby_id = value;
        }
        if let Some(value) = env_parse("FAILOVER_TICK_INTERVAL_SECS") {
            self.tick_interval_secs = value;
        }
        if let Some(value) = env_parse("FAILOVER_PROBE_TIMEOUT_SECS") {
            self.probe_timeout_secs = value;
        }
        if let Some(value) = env_parse("FAILOVER_UNHEALTHY_THRESHOLD") {
            self.unhealthy_threshold = value;
        }
        if let Some(value) = env_parse("FAILOVER_LAG_THRESHOLD_SECS") {
            self.lag_threshold_secs = value;
        }
        if let Some(value) = env_parse("FAILOVER_LAG_WINDOW_SECS") {
            self.lag_window_secs = value;
        }
        if let Some(value) = env_parse("FAILOVER_PROMOTION_POLL_INTERVAL_SECS") {
            self.promotion_poll_interval_secs = value;
        }
        if let Some(value) = env_parse("FAILOVER_PROMOTION_TIMEOUT_SECS") {
            self.promotion_timeout_secs = value;
        }
        if let Some(value) = env_parse("FAILOVER_NOTIFY_COOLDOWN_SECS") {
            self.notify_cooldown_secs = value;
        }
        if let Some(value) = env_parse("FAILOVER_NOTIFIER_MAX_RETRIES") {
            self.notifier_max_retries = value;
        }
        if let Some(value) = env_parse("FAILOVER_NOTIFIER_BASE_DELAY_SECS") {
            self.notifier_base_delay_secs = value;
        }
        if let Some(value) = env_parse("FAILOVER_NOTIFIER_MAX_DELAY_SECS") {
            self.notifier_max_delay_secs = value;
        }
        if let Some(value) = env_string("FAILOVER_DB_PATH") {
            self.db_path = PathBuf::from(value);
        }
        if let Some(value) = env_string("FAILOVER_CONTROL_PLANE_URL") {
            self.control_plane.base_url = value;
        }
        if let Some(value) = env_string("FAILOVER_CONTROL_PLANE_TOKEN") {
            self.control_plane.auth_token = Some(value);
        }
        if let Some(value) = env_string("FAILOVER_TELEMETRY_URL") {
            self.telemetry.base_url = value;
        }
        if let Some(value) = env_string("FAILOVER_TOPIC_WEBHOOK_URL") {
            self.notifications.topic_url = Some(value);
        }
        if let Some(value) = env_string("FAILOVER_TOPIC_WEBHOOK_TOKEN") {
            self.notifications.topic_token = Some(value);
        }
        if let Some(value) = env_string("FAILOVER_SLACK_WEBHOOK_URL") {
            self.notifications.slack_webhook_url = Some(value);
        }
        if let Some(value) = env_parse("FAILOVER_NOTIFY_DISABLED") {
            self.notifications.disabled = value;
        }
    }

    /// Reject configurations the state machine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.primary_id.trim().is_empty() {
            anyhow::bail!("primary_id must not be empty");
        }
        if self.standby_id.trim().is_empty() {
            anyhow::bail!("standby_id must not be empty");
        }
        if self.primary_id == self.standby_id {
            anyhow::bail!("primary_id and standby_id must differ");
        }
        if self.tick_interval_secs == 0 {
            anyhow::bail!("tick_interval_secs must be at least 1");
        }
        if self.unhealthy_threshold == 0 {
            anyhow::bail!("unhealthy_threshold must be at least 1");
        }
        if self.lag_threshold_secs <= 0.0 {
            anyhow::bail!("lag_threshold_secs must be positive");
        }
        if self.lag_window_secs == 0 {
            anyhow::bail!("lag_window_secs must be at least 1");
        }
        if self.health_window == 0 {
            anyhow::bail!("health_window must be at least 1");
        }
        if self.promotion_poll_interval_secs == 0 {
            anyhow::bail!("promotion_poll_interval_secs must be at least 1");
        }
        if self.promotion_timeout_secs == 0 {
            anyhow::bail!("promotion_timeout_secs must be at least 1");
        }
        Ok(())
    }

    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    #[must_use]
    pub const fn lag_window(&self) -> Duration {
        Duration::from_secs(self.lag_window_secs)
    }

    #[must_use]
    pub const fn promotion_poll_interval(&self) -> Duration {
        Duration::from_secs(self.promotion_poll_interval_secs)
    }

    #[must_use]
    pub const fn promotion_timeout(&self) -> Duration {
        Duration::from_secs(self.promotion_timeout_secs)
    }

    #[must_use]
    pub fn warning_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.notify_cooldown_secs as i64)
    }

    /// Retry schedule for notification delivery.
    #[must_use]
    pub fn retry_policy(&self) -> notify::RetryPolicy {
        notify::RetryPolicy {
            max_retries: self.notifier_max_retries,
            base_delay: Duration::from_secs(self.notifier_base_delay_secs),
            max_delay: Duration::from_secs(self.notifier_max_delay_secs),
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn empty_toml_matches_the_defaults() {
        let parsed: WardenConfig = toml::from_str("").unwrap();
        let defaults = WardenConfig::default();
        assert_eq!(parsed.primary_id, defaults.primary_id);
        assert_eq!(parsed.tick_interval_secs, 60);
        assert_eq!(parsed.probe_timeout_secs, 5);
        assert_eq!(parsed.unhealthy_threshold, 2);
        assert!((parsed.lag_threshold_secs - 60.0).abs() < f64::EPSILON);
        assert_eq!(parsed.lag_window_secs, 300);
        assert_eq!(parsed.health_window, 5);
        assert_eq!(parsed.promotion_poll_interval_secs, 15);
        assert_eq!(parsed.promotion_timeout_secs, 300);
        assert_eq!(parsed.notify_cooldown_secs, 300);
        assert_eq!(parsed.notifier_max_retries, 5);
        assert_eq!(parsed.retention_days, 30);
        assert_eq!(parsed.db_path, PathBuf::from("warden.db"));
        assert!(!parsed.notifications.disabled);
    }

    #[test]
    fn full_toml_parses_nested_sections() {
        let raw = r#"
            primary_id = "pg-main-fra"
            standby_id = "pg-standby-ams"
            tick_interval_secs = 30
            lag_threshold_secs = 45.5

            [control_plane]
            base_url = "https://cp.internal:8443"
            auth_token = "cp-secret"

            [telemetry]
            base_url = "https://metrics.internal:9090"
            step_secs = 30

            [notifications]
            slack_webhook_url = "https://hooks.slack.com/services/T0/B0/XYZ"
            disabled = false
        "#;
        let config: WardenConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.primary_id, "pg-main-fra");
        assert_eq!(config.standby_id, "pg-standby-ams");
        assert_eq!(config.tick_interval_secs, 30);
        assert!((config.lag_threshold_secs - 45.5).abs() < f64::EPSILON);
        assert_eq!(config.control_plane.base_url, "https://cp.internal:8443");
        assert_eq!(config.control_plane.auth_token.as_deref(), Some("cp-secret"));
        assert_eq!(config.telemetry.step_secs, 30);
        assert!(config.notifications.slack_webhook_url.is_some());
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn env_overrides_take_precedence() {
        std::env::set_var("FAILOVER_PRIMARY_ID", "pg-env-primary");
        std::env::set_var("FAILOVER_TICK_INTERVAL_SECS", "5");
        std::env::set_var("FAILOVER_LAG_THRESHOLD_SECS", "120.5");
        std::env::set_var("FAILOVER_NOTIFY_DISABLED", "true");

        let mut config = WardenConfig::default();
        config.apply_env_overrides();

        std::env::remove_var("FAILOVER_PRIMARY_ID");
        std::env::remove_var("FAILOVER_TICK_INTERVAL_SECS");
        std::env::remove_var("FAILOVER_LAG_THRESHOLD_SECS");
        std::env::remove_var("FAILOVER_NOTIFY_DISABLED");

        assert_eq!(config.primary_id, "pg-env-primary");
        assert_eq!(config.tick_interval_secs, 5);
        assert!((config.lag_threshold_secs - 120.5).abs() < f64::EPSILON);
        assert!(config.notifications.disabled);
    }

    #[test]
    #[serial]
    fn notifier_delay_env_overrides_reach_the_retry_policy() {
        std::env::set_var("FAILOVER_NOTIFIER_BASE_DELAY_SECS", "2");
        std::env::set_var("FAILOVER_NOTIFIER_MAX_DELAY_SECS", "8");

        let mut config = WardenConfig::default();
        config.apply_env_overrides();

        std::env::remove_var("FAILOVER_NOTIFIER_BASE_DELAY_SECS");
        std::env::remove_var("FAILOVER_NOTIFIER_MAX_DELAY_SECS");

        assert_eq!(config.notifier_base_delay_secs, 2);
        assert_eq!(config.notifier_max_delay_secs, 8);
        let policy = config.retry_policy();
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(8));
    }

    #[test]
    #[serial]
    fn unparseable_env_overrides_are_ignored() {
        std::env::set_var("FAILOVER_TICK_INTERVAL_SECS", "soon");

        let mut config = WardenConfig::default();
        config.apply_env_overrides();

        std::env::remove_var("FAILOVER_TICK_INTERVAL_SECS");

        assert_eq!(config.tick_interval_secs, 60);
    }

    #[test]
    fn validation_rejects_broken_configs() {
        let mut config = WardenConfig::default();
        config.standby_id.clone_from(&config.primary_id);
        assert!(config.validate().is_err());

        let mut config = WardenConfig::default();
        config.unhealthy_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = WardenConfig::default();
        config.lag_threshold_secs = -1.0;
        assert!(config.validate().is_err());

        let mut config = WardenConfig::default();
        config.tick_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn missing_explicit_config_file_is_an_error() {
        let result = WardenConfig::load(Some(Path::new("/nonexistent/warden.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn retry_policy_reflects_the_config() {
        let mut config = WardenConfig::default();
        config.notifier_max_retries = 2;
        config.notifier_base_delay_secs = 3;
        let policy = config.retry_policy();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.base_delay, Duration::from_secs(3));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }
}
