//! The failover state machine.
//!
//! One tick: sample primary health and standby lag concurrently, apply the
//! transition rules under hysteresis and the lag gate, run at most one
//! promotion per incident, notify on every transition, and persist through
//! conditional writes so concurrent orchestrator instances cannot both
//! promote. The tick loop never overlaps ticks; everything here assumes
//! exclusive ownership of the open incident between load and store.

use chrono::{DateTime, Utc};
use notify::{Notifier, NotifyEvent};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::incident::{Incident, IncidentState};
use crate::store::{IncidentStore, StoreError};
use crate::types::{
    FailoverExecutor, HealthProbe, HealthSample, LagMonitor, LagSample, TickAction, TickRecord,
};

/// Tunables for the state machine.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Instance identifier of the watched primary
    pub primary_id: String,
    /// Instance identifier of the promotable standby
    pub standby_id: String,
    /// Consecutive unhealthy checks required before promotion
    pub unhealthy_threshold: u32,
    /// Lag gate: promotion requires measured lag strictly below this
    pub lag_threshold_secs: f64,
    /// Trailing window handed to the lag monitor
    pub lag_window: Duration,
    /// Minimum spacing between repeated withheld-promotion warnings
    pub warning_cooldown: chrono::Duration,
    /// How many recent health samples to keep for diagnostics
    pub health_window: usize,
}

/// Errors that abort a tick.
#[derive(Debug, Error)]
pub enum TickError {
    /// Another orchestrator instance won a conditional write. The tick
    /// stops; the next tick re-reads and reconciles.
    #[error("tick aborted: concurrent update on incident {incident_id}")]
    Conflict { incident_id: Uuid },

    #[error("incident store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for TickError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { incident_id } => Self::Conflict { incident_id },
            other => Self::Store(other),
        }
    }
}

/// Drives the whole failover loop. Owns the store; ticks are strictly
/// sequential per instance.
pub struct Orchestrator {
    settings: OrchestratorSettings,
    probe: Arc<dyn HealthProbe>,
    lag: Arc<dyn LagMonitor>,
    executor: Arc<dyn FailoverExecutor>,
    notifier: Notifier,
    store: IncidentStore,
    recent_health: VecDeque<HealthSample>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        settings: OrchestratorSettings,
        probe: Arc<dyn HealthProbe>,
        lag: Arc<dyn LagMonitor>,
        executor: Arc<dyn FailoverExecutor>,
        notifier: Notifier,
        store: IncidentStore,
    ) -> Self {
        Self {
            settings,
            probe,
            lag,
            executor,
            notifier,
            store,
            recent_health: VecDeque::new(),
        }
    }

    /// Run one tick of the state machine.
    ///
    /// # Errors
    /// Returns an error when the incident store fails or a concurrent
    /// instance won a conditional write. Telemetry failures never error;
    /// they arrive as conservative samples.
    pub async fn tick(&mut self) -> Result<TickRecord, TickError> {
        let now = Utc::now();

        let (health, lag) = tokio::join!(
            self.probe.probe(&self.settings.primary_id),
            self.lag
                .measure(&self.settings.standby_id, self.settings.lag_window),
        );
        debug!(
            primary_available = health.primary_available,
            status = %health.status,
            lag_seconds = lag.lag_seconds,
            lag_data = lag.data_available,
            "Collected tick samples"
        );
        self.remember(health.clone());

        let record = match self.store.load_open_incident()? {
            None => self.tick_without_incident(&health, now).await?,
            Some(incident) => match incident.state {
                IncidentState::Degraded => self.tick_degraded(incident, &health, &lag, now).await?,
                IncidentState::PromotionInFlight => {
                    self.recover_interrupted_promotion(incident, now).await?
                }
                IncidentState::Failed => self.tick_failed(incident, &health, now).await?,
                state @ (IncidentState::Healthy | IncidentState::Promoted) => {
                    // Rows in these states are always archived in the same
                    // write that sets them; an open one is corrupt data.
                    error!(
                        incident_id = %incident.id,
                        state = %state,
                        "Open incident in unexpected state, archiving as failed"
                    );
                    let mut incident = incident;
                    incident.mark_failed(now, format!("inconsistent open state {state}"));
                    incident.archive(now);
                    self.store.update_incident(&mut incident)?;
                    TickRecord {
                        at: now,
                        incident_id: Some(incident.id),
                        incident_state: incident.state,
                        action: TickAction::AbandonedPromotion,
                        notifications_sent: 0,
                    }
                }
            },
        };

        self.store.record_tick(&record)?;
        info!(
            state = %record.incident_state,
            action = %record.action,
            notifications = record.notifications_sent,
            "Tick complete"
        );
        Ok(record)
    }

    async fn tick_without_incident(
        &mut self,
        health: &HealthSample,
        now: DateTime<Utc>,
    ) -> Result<TickRecord, TickError> {
        if health.primary_available {
            return Ok(TickRecord {
                at: now,
                incident_id: None,
                incident_state: IncidentState::Healthy,
                action: TickAction::None,
                notifications_sent: 0,
            });
        }

        let incident = Incident::open(now);
        self.store.create_incident(&incident)?;
        info!(
            incident_id = %incident.id,
            status = %health.status,
            "Primary unhealthy, incident opened"
        );
        let sent = self
            .publish(NotifyEvent::IncidentOpened {
                incident_id: incident.id.to_string(),
                primary_id: self.settings.primary_id.clone(),
                status: health.status.clone(),
                timestamp: now,
            })
            .await;
        Ok(TickRecord {
            at: now,
            incident_id: Some(incident.id),
            incident_state: incident.state,
            action: TickAction::OpenedIncident,
            notifications_sent: sent,
        })
    }

    async fn tick_degraded(
        &mut self,
        mut incident: Incident,
        health: &HealthSample,
        lag: &LagSample,
        now: DateTime<Utc>,
    ) -> Result<TickRecord, TickError> {
        if health.primary_available {
            let unhealthy_checks = incident.consecutive_unhealthy_checks;
            incident.close_recovered(now);
            self.store.update_incident(&mut incident)?;
            info!(
                incident_id = %incident.id,
                unhealthy_checks,
                "Primary recovered, incident archived"
            );
            let sent = self
                .publish(NotifyEvent::IncidentResolved {
                    incident_id: incident.id.to_string(),
                    primary_id: self.settings.primary_id.clone(),
                    unhealthy_checks,
                    timestamp: now,
                })
                .await;
            return Ok(TickRecord {
                at: now,
                incident_id: Some(incident.id),
                incident_state: incident.state,
                action: TickAction::ResolvedIncident,
                notifications_sent: sent,
            });
        }

        incident.record_unhealthy(now);

        if incident.consecutive_unhealthy_checks >= self.settings.unhealthy_threshold
            && !incident.promotion_attempted
        {
            if lag.below_threshold(self.settings.lag_threshold_secs) {
                return self.run_promotion(incident, lag, now).await;
            }
            return self.withhold_promotion(incident, lag, now).await;
        }

        self.store.update_incident(&mut incident)?;
        debug!(
            incident_id = %incident.id,
            unhealthy_checks = incident.consecutive_unhealthy_checks,
            threshold = self.settings.unhealthy_threshold,
            "Primary still unhealthy, below the action threshold"
        );
        Ok(TickRecord {
            at: now,
            incident_id: Some(incident.id),
            incident_state: incident.state,
            action: TickAction::ObservedUnhealthy,
            notifications_sent: 0,
        })
    }

    /// Threshold met, but the lag gate said no. A missing measurement and
    /// an excessive one are both disqualifying.
    async fn withhold_promotion(
        &mut self,
        mut incident: Incident,
        lag: &LagSample,
        now: DateTime<Utc>,
    ) -> Result<TickRecord, TickError> {
        let warn_now = incident.warning_due(now, self.settings.warning_cooldown);
        if warn_now {
            incident.mark_warned(now);
        }
        self.store.update_incident(&mut incident)?;
        warn!(
            incident_id = %incident.id,
            unhealthy_checks = incident.consecutive_unhealthy_checks,
            lag_data = lag.data_available,
            lag_seconds = lag.lag_seconds,
            threshold_secs = self.settings.lag_threshold_secs,
            "Failover conditions met but the lag gate is closed, promotion withheld"
        );

        let mut sent = 0;
        if warn_now {
            sent = self
                .publish(NotifyEvent::PromotionWithheld {
                    incident_id: incident.id.to_string(),
                    standby_id: self.settings.standby_id.clone(),
                    lag_seconds: lag.data_available.then_some(lag.lag_seconds),
                    lag_threshold_secs: self.settings.lag_threshold_secs,
                    timestamp: now,
                })
                .await;
        }
        Ok(TickRecord {
            at: now,
            incident_id: Some(incident.id),
            incident_state: incident.state,
            action: TickAction::WithheldPromotion,
            notifications_sent: sent,
        })
    }

    async fn run_promotion(
        &mut self,
        mut incident: Incident,
        lag: &LagSample,
        now: DateTime<Utc>,
    ) -> Result<TickRecord, TickError> {
        incident.begin_promotion(now);
        // This conditional write is the promotion gate. Losing it means
        // another instance moved the incident first, and this tick must
        // stop before any irreversible action.
        self.store.update_incident(&mut incident)?;

        info!(
            incident_id = %incident.id,
            standby_id = %self.settings.standby_id,
            unhealthy_checks = incident.consecutive_unhealthy_checks,
            lag_seconds = lag.lag_seconds,
            "Promotion gate passed, executing failover"
        );
        let mut sent = self
            .publish(NotifyEvent::PromotionStarted {
                incident_id: incident.id.to_string(),
                standby_id: self.settings.standby_id.clone(),
                unhealthy_checks: incident.consecutive_unhealthy_checks,
                lag_seconds: lag.lag_seconds,
                timestamp: now,
            })
            .await;

        let result = self.executor.promote(&incident).await;
        let finished = Utc::now();

        let (action, event) = if result.succeeded {
            let endpoint = result
                .new_endpoint
                .clone()
                .unwrap_or_else(|| self.settings.standby_id.clone());
            incident.close_promoted(finished, result.new_endpoint);
            info!(incident_id = %incident.id, endpoint = %endpoint, "Failover complete");
            (
                TickAction::Promoted,
                NotifyEvent::PromotionSucceeded {
                    incident_id: incident.id.to_string(),
                    standby_id: self.settings.standby_id.clone(),
                    new_endpoint: endpoint,
                    duration_secs: result.duration_seconds,
                    timestamp: finished,
                },
            )
        } else {
            let reason = result
                .error
                .unwrap_or_else(|| "unknown promotion failure".to_string());
            incident.mark_failed(finished, reason.clone());
            error!(
                incident_id = %incident.id,
                reason = %reason,
                "Failover failed, operator action required"
            );
            (
                TickAction::PromotionFailed,
                NotifyEvent::PromotionFailed {
                    incident_id: incident.id.to_string(),
                    standby_id: self.settings.standby_id.clone(),
                    reason,
                    duration_secs: result.duration_seconds,
                    timestamp: finished,
                },
            )
        };

        // The outcome is persisted before the tick returns, but a late
        // conflict must not swallow the critical notification: publish
        // first, then surface the store error.
        let persisted = self.store.update_incident(&mut incident);
        sent += self.publish(event).await;
        persisted?;

        Ok(TickRecord {
            at: finished,
            incident_id: Some(incident.id),
            incident_state: incident.state,
            action,
            notifications_sent: sent,
        })
    }

    /// An incident that already burned its promotion attempt. Nothing to do
    /// but wait for the operator or for the primary to come back.
    async fn tick_failed(
        &mut self,
        mut incident: Incident,
        health: &HealthSample,
        now: DateTime<Utc>,
    ) -> Result<TickRecord, TickError> {
        if health.primary_available {
            let unhealthy_checks = incident.consecutive_unhealthy_checks;
            incident.archive(now);
            self.store.update_incident(&mut incident)?;
            info!(
                incident_id = %incident.id,
                "Primary recovered after a failed promotion, incident archived"
            );
            let sent = self
                .publish(NotifyEvent::IncidentResolved {
                    incident_id: incident.id.to_string(),
                    primary_id: self.settings.primary_id.clone(),
                    unhealthy_checks,
                    timestamp: now,
                })
                .await;
            return Ok(TickRecord {
                at: now,
                incident_id: Some(incident.id),
                incident_state: incident.state,
                action: TickAction::ResolvedIncident,
                notifications_sent: sent,
            });
        }

        incident.last_observed_at = now;
        self.store.update_incident(&mut incident)?;
        debug!(
            incident_id = %incident.id,
            "Incident already failed, holding for operator action"
        );
        Ok(TickRecord {
            at: now,
            incident_id: Some(incident.id),
            incident_state: IncidentState::Failed,
            action: TickAction::AwaitingOperator,
            notifications_sent: 0,
        })
    }

    /// A previous run died between the promotion gate and the outcome
    /// write. The latch is already set, so the promotion is never
    /// re-issued; the incident is marked failed for operator review.
    async fn recover_interrupted_promotion(
        &mut self,
        mut incident: Incident,
        now: DateTime<Utc>,
    ) -> Result<TickRecord, TickError> {
        warn!(
            incident_id = %incident.id,
            "Found an interrupted promotion from a previous run"
        );
        let reason = "promotion interrupted; verify standby state manually".to_string();
        incident.mark_failed(now, reason.clone());
        self.store.update_incident(&mut incident)?;
        let sent = self
            .publish(NotifyEvent::PromotionFailed {
                incident_id: incident.id.to_string(),
                standby_id: self.settings.standby_id.clone(),
                reason,
                duration_secs: 0.0,
                timestamp: now,
            })
            .await;
        Ok(TickRecord {
            at: now,
            incident_id: Some(incident.id),
            incident_state: incident.state,
            action: TickAction::AbandonedPromotion,
            notifications_sent: sent,
        })
    }

    /// Deliver one event through every channel. Delivery failures are
    /// logged and counted out; they never fail the tick.
    async fn publish(&self, event: NotifyEvent) -> u32 {
        let mut sent = 0;
        for (channel, result) in self.notifier.notify_and_wait(event).await {
            match result {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Notification delivery failed");
                }
            }
        }
        sent
    }

    fn remember(&mut self, sample: HealthSample) {
        self.recent_health.push_back(sample);
        while self.recent_health.len() > self.settings.health_window {
            self.recent_health.pop_front();
        }
    }

    /// Most recent health samples, oldest first, capped at the configured
    /// window.
    #[must_use]
    pub fn recent_health(&self) -> &VecDeque<HealthSample> {
        &self.recent_health
    }

    /// Delete archived incidents and audit records older than the cutoff.
    pub fn prune_history(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.store.prune_older_than(cutoff)
    }
}
