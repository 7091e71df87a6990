//! One-shot standby promotion.
//!
//! Runs the fixed sequence: re-verify the standby is promotable, take a
//! best-effort snapshot of the primary, issue the promote command, then
//! poll until the standby serves or the deadline passes. Every failure
//! mode is folded into the returned [`PromotionResult`]; the state machine
//! never sees an error from here.

use async_trait::async_trait;
use std::cmp;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::control_plane::FailoverControl;
use crate::incident::Incident;
use crate::types::{FailoverExecutor, PromotionResult};

/// Timing bounds for one promotion attempt.
#[derive(Debug, Clone, Copy)]
pub struct PromotionSettings {
    /// Wait between status polls
    pub poll_interval: Duration,
    /// Hard ceiling for the whole attempt
    pub timeout: Duration,
}

impl Default for PromotionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Control-plane-backed promotion executor.
pub struct StandbyPromoter {
    control: Arc<dyn FailoverControl>,
    primary_id: String,
    standby_id: String,
    settings: PromotionSettings,
}

impl StandbyPromoter {
    #[must_use]
    pub fn new(
        control: Arc<dyn FailoverControl>,
        primary_id: impl Into<String>,
        standby_id: impl Into<String>,
        settings: PromotionSettings,
    ) -> Self {
        Self {
            control,
            primary_id: primary_id.into(),
            standby_id: standby_id.into(),
            settings,
        }
    }
}

#[async_trait]
impl FailoverExecutor for StandbyPromoter {
    async fn promote(&self, incident: &Incident) -> PromotionResult {
        let started = Instant::now();

        info!(
            incident_id = %incident.id,
            standby_id = %self.standby_id,
            "Starting standby promotion"
        );

        // Re-verify the standby first. An already-promoted standby reports
        // role `primary` here, which makes a duplicate promote call for a
        // later incident a safe no-op.
        let status = match self.control.instance_status(&self.standby_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(incident_id = %incident.id, error = %e, "Standby status check failed before promotion");
                return PromotionResult::failure(
                    format!("standby status check failed: {e}"),
                    started.elapsed(),
                );
            }
        };
        if !status.is_promotable() {
            warn!(
                incident_id = %incident.id,
                status = %status.status,
                role = %status.role,
                "Standby not promotable"
            );
            return PromotionResult::failure("standby not promotable", started.elapsed());
        }

        // Best-effort snapshot of the (possibly dying) primary. Losing the
        // snapshot must not block the cutover.
        match self.control.create_snapshot(&self.primary_id).await {
            Ok(snapshot_id) => {
                info!(incident_id = %incident.id, snapshot_id = %snapshot_id, "Pre-promotion snapshot created");
            }
            Err(e) => {
                warn!(incident_id = %incident.id, error = %e, "Pre-promotion snapshot failed, continuing without it");
            }
        }

        if let Err(e) = self.control.promote_standby(&self.standby_id).await {
            warn!(incident_id = %incident.id, error = %e, "Promote command failed");
            return PromotionResult::failure(
                format!("promote command failed: {e}"),
                started.elapsed(),
            );
        }

        // Poll until the standby serves again. Each poll is independent, so
        // one failed read does not abort the attempt; the deadline does.
        loop {
            match self.control.instance_status(&self.standby_id).await {
                Ok(status) if status.is_available() => {
                    let duration = started.elapsed();
                    let endpoint = status.endpoint.unwrap_or_else(|| self.standby_id.clone());
                    info!(
                        incident_id = %incident.id,
                        endpoint = %endpoint,
                        duration_secs = duration.as_secs_f64(),
                        "Standby promoted"
                    );
                    return PromotionResult::success(endpoint, duration);
                }
                Ok(status) => {
                    debug!(incident_id = %incident.id, status = %status.status, "Standby not yet available");
                }
                Err(e) => {
                    warn!(incident_id = %incident.id, error = %e, "Promotion status poll failed");
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= self.settings.timeout {
                warn!(
                    incident_id = %incident.id,
                    duration_secs = elapsed.as_secs_f64(),
                    "Promotion timed out"
                );
                return PromotionResult::failure("promotion timed out", elapsed);
            }
            tokio::time::sleep(cmp::min(self.settings.poll_interval, self.settings.timeout - elapsed))
                .await;
        }
    }
}
