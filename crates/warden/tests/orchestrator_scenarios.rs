//! End-to-end failover scenarios driven through the orchestrator.
//!
//! These tests exercise whole incident lifecycles against a real SQLite
//! store, with scripted probe, lag, and control-plane doubles standing in
//! for the network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use notify::{ChannelError, Notifier, NotifyChannel, NotifyEvent, RetryPolicy, Severity};

use warden::control_plane::{FailoverControl, InstanceStatus};
use warden::incident::{Incident, IncidentState, Resolution};
use warden::orchestrator::{Orchestrator, OrchestratorSettings, TickError};
use warden::promote::{PromotionSettings, StandbyPromoter};
use warden::store::IncidentStore;
use warden::types::{
    FailoverExecutor, HealthProbe, HealthSample, LagMonitor, LagSample, PromotionResult,
    TickAction,
};

struct ScriptedProbe {
    plan: Mutex<VecDeque<bool>>,
}

impl ScriptedProbe {
    fn new() -> Self {
        Self {
            plan: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, healthy: bool) {
        self.plan.lock().unwrap().push_back(healthy);
    }

    fn push_unhealthy(&self, count: usize) {
        for _ in 0..count {
            self.push(false);
        }
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, _primary_id: &str) -> HealthSample {
        let healthy = self
            .plan
            .lock()
            .unwrap()
            .pop_front()
            .expect("probe script exhausted");
        if healthy {
            HealthSample {
                primary_available: true,
                status: "available".to_string(),
                observed_at: Utc::now(),
            }
        } else {
            HealthSample::unreachable(Utc::now())
        }
    }
}

struct FixedLag {
    sample: Mutex<LagSample>,
}

impl FixedLag {
    fn new(sample: LagSample) -> Self {
        Self {
            sample: Mutex::new(sample),
        }
    }

    fn set(&self, sample: LagSample) {
        *self.sample.lock().unwrap() = sample;
    }
}

#[async_trait]
impl LagMonitor for FixedLag {
    async fn measure(&self, _standby_id: &str, _window: Duration) -> LagSample {
        *self.sample.lock().unwrap()
    }
}

struct CountingExecutor {
    result: PromotionResult,
    calls: AtomicU32,
}

impl CountingExecutor {
    fn failing(reason: &str) -> Self {
        Self {
            result: PromotionResult::failure(reason, Duration::from_secs(10)),
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FailoverExecutor for CountingExecutor {
    async fn promote(&self, _incident: &Incident) -> PromotionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

/// Control-plane double for driving the real `StandbyPromoter`.
struct ScriptedControl {
    status: InstanceStatus,
    /// Status reported once the promote command has been issued.
    status_after_promote: Option<InstanceStatus>,
    promote_ok: bool,
    status_calls: AtomicU32,
    promote_calls: AtomicU32,
}

impl ScriptedControl {
    fn promotable_standby(promote_ok: bool) -> Self {
        Self {
            status: InstanceStatus {
                id: "db-eu-west".to_string(),
                status: "available".to_string(),
                role: "replica".to_string(),
                endpoint: Some("db-eu-west.example.net:5432".to_string()),
            },
            status_after_promote: None,
            promote_ok,
            status_calls: AtomicU32::new(0),
            promote_calls: AtomicU32::new(0),
        }
    }

    /// Standby that accepts the promote command but never finishes coming up.
    fn stalling_standby() -> Self {
        let mut control = Self::promotable_standby(true);
        control.status_after_promote = Some(InstanceStatus {
            id: "db-eu-west".to_string(),
            status: "promoting".to_string(),
            role: "replica".to_string(),
            endpoint: None,
        });
        control
    }
}

#[async_trait]
impl FailoverControl for ScriptedControl {
    async fn instance_status(&self, _instance_id: &str) -> anyhow::Result<InstanceStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.promote_calls.load(Ordering::SeqCst) > 0 {
            if let Some(stalled) = &self.status_after_promote {
                return Ok(stalled.clone());
            }
        }
        Ok(self.status.clone())
    }

    async fn promote_standby(&self, _standby_id: &str) -> anyhow::Result<()> {
        self.promote_calls.fetch_add(1, Ordering::SeqCst);
        if self.promote_ok {
            Ok(())
        } else {
            anyhow::bail!("control plane rejected the request")
        }
    }

    async fn create_snapshot(&self, _instance_id: &str) -> anyhow::Result<String> {
        Ok("snap-pre-failover".to_string())
    }
}

struct RecordingChannel {
    events: Mutex<Vec<NotifyEvent>>,
}

impl RecordingChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().unwrap().clone()
    }

    fn event_names(&self) -> Vec<&'static str> {
        self.events()
            .iter()
            .map(|event| match event {
                NotifyEvent::IncidentOpened { .. } => "opened",
                NotifyEvent::IncidentResolved { .. } => "resolved",
                NotifyEvent::PromotionWithheld { .. } => "withheld",
                NotifyEvent::PromotionStarted { .. } => "started",
                NotifyEvent::PromotionSucceeded { .. } => "succeeded",
                NotifyEvent::PromotionFailed { .. } => "failed",
            })
            .collect()
    }
}

#[async_trait]
impl NotifyChannel for RecordingChannel {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Channel whose every delivery attempt fails.
struct BrokenChannel;

#[async_trait]
impl NotifyChannel for BrokenChannel {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, _event: &NotifyEvent) -> Result<(), ChannelError> {
        Err(ChannelError::Other("webhook endpoint is down".to_string()))
    }
}

/// Executor that races the orchestrator: while the promotion is in
/// flight it rewrites the incident through a second store handle, so the
/// orchestrator's outcome write must lose the version check.
struct InterferingExecutor {
    side_store: Mutex<IncidentStore>,
}

#[async_trait]
impl FailoverExecutor for InterferingExecutor {
    async fn promote(&self, _incident: &Incident) -> PromotionResult {
        let store = self.side_store.lock().unwrap();
        let mut meddled = store
            .load_open_incident()
            .expect("side store read failed")
            .expect("incident should be open during promotion");
        meddled.last_observed_at = Utc::now();
        store
            .update_incident(&mut meddled)
            .expect("side store write failed");
        PromotionResult::success(
            "db-eu-west.example.net:5432".to_string(),
            Duration::from_secs(40),
        )
    }
}

fn good_lag() -> LagSample {
    LagSample {
        lag_seconds: 2.0,
        observed_at: Utc::now(),
        data_available: true,
    }
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        primary_id: "db-us-east".to_string(),
        standby_id: "db-eu-west".to_string(),
        unhealthy_threshold: 2,
        lag_threshold_secs: 60.0,
        lag_window: Duration::from_secs(300),
        warning_cooldown: chrono::Duration::minutes(5),
        health_window: 5,
    }
}

struct Harness {
    orchestrator: Orchestrator,
    probe: Arc<ScriptedProbe>,
    lag: Arc<FixedLag>,
    recorder: Arc<RecordingChannel>,
}

fn harness(executor: Arc<dyn FailoverExecutor>, store: IncidentStore) -> Harness {
    let probe = Arc::new(ScriptedProbe::new());
    let lag = Arc::new(FixedLag::new(good_lag()));
    let recorder = RecordingChannel::new();
    let notifier = Notifier::with_channels(vec![recorder.clone() as Arc<dyn NotifyChannel>])
        .with_retry_policy(RetryPolicy {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        });
    let orchestrator = Orchestrator::new(
        settings(),
        probe.clone(),
        lag.clone(),
        executor,
        notifier,
        store,
    );
    Harness {
        orchestrator,
        probe,
        lag,
        recorder,
    }
}

fn memory_store() -> IncidentStore {
    IncidentStore::open_in_memory().expect("in-memory store")
}

mod promotion_gating {
    use super::*;

    #[tokio::test]
    async fn a_single_blip_never_promotes() {
        let executor = Arc::new(CountingExecutor::failing("should never run"));
        let mut h = harness(executor.clone(), memory_store());
        h.probe.push(false);
        h.probe.push(true);

        h.orchestrator.tick().await.unwrap();
        let record = h.orchestrator.tick().await.unwrap();

        assert_eq!(record.action, TickAction::ResolvedIncident);
        assert_eq!(executor.calls(), 0);
        assert_eq!(h.recorder.event_names(), vec!["opened", "resolved"]);
    }

    #[tokio::test]
    async fn missing_lag_data_never_authorizes_promotion() {
        let executor = Arc::new(CountingExecutor::failing("should never run"));
        let mut h = harness(executor.clone(), memory_store());
        h.lag.set(LagSample::missing(Utc::now()));
        h.probe.push_unhealthy(5);

        for _ in 0..5 {
            h.orchestrator.tick().await.unwrap();
        }

        assert_eq!(executor.calls(), 0);
        // One warning at the threshold tick, then the cooldown holds.
        assert_eq!(h.recorder.event_names(), vec!["opened", "withheld"]);
        match &h.recorder.events()[1] {
            NotifyEvent::PromotionWithheld { lag_seconds, .. } => assert!(lag_seconds.is_none()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn excessive_lag_withholds_until_the_standby_catches_up() {
        let control = Arc::new(ScriptedControl::promotable_standby(true));
        let executor = Arc::new(StandbyPromoter::new(
            control.clone() as Arc<dyn FailoverControl>,
            "db-us-east",
            "db-eu-west",
            PromotionSettings {
                poll_interval: Duration::from_millis(5),
                timeout: Duration::from_millis(200),
            },
        ));
        let mut h = harness(executor, memory_store());
        h.lag.set(LagSample {
            lag_seconds: 200.0,
            observed_at: Utc::now(),
            data_available: true,
        });
        h.probe.push_unhealthy(3);

        h.orchestrator.tick().await.unwrap();
        let withheld = h.orchestrator.tick().await.unwrap();
        assert_eq!(withheld.action, TickAction::WithheldPromotion);
        assert_eq!(control.promote_calls.load(Ordering::SeqCst), 0);

        h.lag.set(good_lag());
        let promoted = h.orchestrator.tick().await.unwrap();

        assert_eq!(promoted.action, TickAction::Promoted);
        assert_eq!(control.promote_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.recorder.event_names(),
            vec!["opened", "withheld", "started", "succeeded"]
        );
        match &h.recorder.events()[1] {
            NotifyEvent::PromotionWithheld { lag_seconds, .. } => {
                assert_eq!(*lag_seconds, Some(200.0));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn one_hundred_degraded_ticks_promote_exactly_once() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = IncidentStore::open(file.path()).unwrap();
        let executor = Arc::new(CountingExecutor::failing("standby not promotable"));
        let mut h = harness(executor.clone(), store);
        h.probe.push_unhealthy(100);

        for _ in 0..100 {
            h.orchestrator.tick().await.unwrap();
        }

        assert_eq!(executor.calls(), 1);

        let side = IncidentStore::open(file.path()).unwrap();
        let open = side.load_open_incident().unwrap().unwrap();
        assert_eq!(open.state, IncidentState::Failed);
        assert!(open.promotion_attempted);
    }
}

mod failover_lifecycle {
    use super::*;

    #[tokio::test]
    async fn standby_promotion_end_to_end() {
        let control = Arc::new(ScriptedControl::promotable_standby(true));
        let executor = Arc::new(StandbyPromoter::new(
            control.clone() as Arc<dyn FailoverControl>,
            "db-us-east",
            "db-eu-west",
            PromotionSettings {
                poll_interval: Duration::from_millis(5),
                timeout: Duration::from_millis(200),
            },
        ));
        let store = memory_store();
        let mut h = harness(executor, store);
        h.probe.push_unhealthy(2);

        let first = h.orchestrator.tick().await.unwrap();
        assert_eq!(first.action, TickAction::OpenedIncident);

        let second = h.orchestrator.tick().await.unwrap();
        assert_eq!(second.action, TickAction::Promoted);
        assert_eq!(second.incident_state, IncidentState::Promoted);

        assert_eq!(
            h.recorder.event_names(),
            vec!["opened", "started", "succeeded"]
        );
        let events = h.recorder.events();
        assert_eq!(events[2].severity(), Severity::Critical);
        match &events[2] {
            NotifyEvent::PromotionSucceeded { new_endpoint, .. } => {
                assert_eq!(new_endpoint, "db-eu-west.example.net:5432");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn stalled_promotion_times_out_and_fails_the_incident() {
        let control = Arc::new(ScriptedControl::stalling_standby());
        let executor = Arc::new(StandbyPromoter::new(
            control.clone() as Arc<dyn FailoverControl>,
            "db-us-east",
            "db-eu-west",
            PromotionSettings {
                poll_interval: Duration::from_millis(2),
                timeout: Duration::from_millis(10),
            },
        ));
        let mut h = harness(executor, memory_store());
        h.probe.push_unhealthy(2);

        h.orchestrator.tick().await.unwrap();
        let record = h.orchestrator.tick().await.unwrap();

        assert_eq!(record.action, TickAction::PromotionFailed);
        assert_eq!(record.incident_state, IncidentState::Failed);
        assert_eq!(control.promote_calls.load(Ordering::SeqCst), 1);
        // One promotability pre-check, then at least one poll before the
        // deadline cuts the attempt off.
        assert!(control.status_calls.load(Ordering::SeqCst) >= 2);

        assert_eq!(h.recorder.event_names(), vec!["opened", "started", "failed"]);
        let events = h.recorder.events();
        assert_eq!(events[2].severity(), Severity::Critical);
        match &events[2] {
            NotifyEvent::PromotionFailed { reason, .. } => {
                assert!(reason.contains("promotion timed out"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_promote_command_leaves_the_incident_failed() {
        let control = Arc::new(ScriptedControl::promotable_standby(false));
        let executor = Arc::new(StandbyPromoter::new(
            control.clone() as Arc<dyn FailoverControl>,
            "db-us-east",
            "db-eu-west",
            PromotionSettings::default(),
        ));
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = IncidentStore::open(file.path()).unwrap();
        let mut h = harness(executor, store);
        h.probe.push_unhealthy(3);
        h.probe.push(true);

        h.orchestrator.tick().await.unwrap();
        let failed = h.orchestrator.tick().await.unwrap();
        assert_eq!(failed.action, TickAction::PromotionFailed);
        assert_eq!(failed.incident_state, IncidentState::Failed);
        assert_eq!(control.promote_calls.load(Ordering::SeqCst), 1);

        // The latch holds: further unhealthy ticks wait for an operator
        // instead of promoting again.
        let waiting = h.orchestrator.tick().await.unwrap();
        assert_eq!(waiting.action, TickAction::AwaitingOperator);
        assert_eq!(control.promote_calls.load(Ordering::SeqCst), 1);

        let resolved = h.orchestrator.tick().await.unwrap();
        assert_eq!(resolved.action, TickAction::ResolvedIncident);

        let side = IncidentStore::open(file.path()).unwrap();
        assert!(side.load_open_incident().unwrap().is_none());
        let archived = &side.recent_incidents(10).unwrap()[0];
        assert_eq!(archived.resolution, Some(Resolution::Failed));
        assert!(archived
            .resolution_detail
            .as_deref()
            .unwrap()
            .contains("promote command failed"));
    }

    #[tokio::test]
    async fn archive_and_reopen_resets_counters() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = IncidentStore::open(file.path()).unwrap();
        let executor = Arc::new(CountingExecutor::failing("should never run"));
        let mut h = harness(executor, store);
        h.probe.push(false);
        h.probe.push(true);
        h.probe.push(false);

        let opened = h.orchestrator.tick().await.unwrap();
        let first_id = opened.incident_id.unwrap();
        h.orchestrator.tick().await.unwrap();

        let reopened = h.orchestrator.tick().await.unwrap();
        let second_id = reopened.incident_id.unwrap();
        assert_ne!(first_id, second_id);

        let side = IncidentStore::open(file.path()).unwrap();
        let fresh = side.load_open_incident().unwrap().unwrap();
        assert_eq!(fresh.id, second_id);
        assert_eq!(fresh.consecutive_unhealthy_checks, 1);
        assert!(!fresh.promotion_attempted);

        // The archived record is immutable history.
        let all = side.recent_incidents(10).unwrap();
        let old = all.iter().find(|i| i.id == first_id).unwrap();
        assert_eq!(old.resolution, Some(Resolution::Recovered));
        assert_eq!(old.consecutive_unhealthy_checks, 1);
        assert!(old.closed_at.is_some());
    }
}

mod resilience {
    use super::*;

    #[tokio::test]
    async fn broken_notifier_never_blocks_the_tick() {
        let probe = Arc::new(ScriptedProbe::new());
        let lag = Arc::new(FixedLag::new(good_lag()));
        let executor = Arc::new(CountingExecutor::failing("should never run"));
        let notifier =
            Notifier::with_channels(vec![Arc::new(BrokenChannel) as Arc<dyn NotifyChannel>])
                .with_retry_policy(RetryPolicy {
                    max_retries: 2,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(4),
                });
        let mut orchestrator = Orchestrator::new(
            settings(),
            probe.clone(),
            lag,
            executor,
            notifier,
            memory_store(),
        );
        probe.push(false);

        let record = orchestrator.tick().await.unwrap();

        assert_eq!(record.action, TickAction::OpenedIncident);
        assert_eq!(record.notifications_sent, 0);
    }

    #[tokio::test]
    async fn conflicting_writer_aborts_the_tick_after_notifying() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = IncidentStore::open(file.path()).unwrap();
        let side_store = IncidentStore::open(file.path()).unwrap();
        let executor = Arc::new(InterferingExecutor {
            side_store: Mutex::new(side_store),
        });
        let mut h = harness(executor, store);
        h.probe.push_unhealthy(2);

        h.orchestrator.tick().await.unwrap();
        let outcome = h.orchestrator.tick().await;

        match outcome {
            Err(TickError::Conflict { .. }) => {}
            other => panic!("expected a conflict, got {other:?}"),
        }
        // The cutover really happened, so the critical notification went
        // out even though the final write lost the race.
        assert_eq!(
            h.recorder.event_names(),
            vec!["opened", "started", "succeeded"]
        );

        // The interfering writer's version of the incident survived.
        let side = IncidentStore::open(file.path()).unwrap();
        let open = side.load_open_incident().unwrap().unwrap();
        assert_eq!(open.state, IncidentState::PromotionInFlight);
        assert!(open.promotion_attempted);
    }
}
