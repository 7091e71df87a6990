//! Health probing of the primary through the control plane.
//!
//! The probe never returns an error. Timeouts and transport failures
//! degrade into conservative `unreachable` samples: missing telemetry is
//! treated as evidence of unhealthiness, so a flaky control plane can at
//! worst open an incident, never mask one.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::control_plane::FailoverControl;
use crate::types::{HealthProbe, HealthSample};

/// Control-plane-backed health probe with a bounded per-call timeout.
pub struct StatusProbe {
    control: Arc<dyn FailoverControl>,
    timeout: Duration,
}

impl StatusProbe {
    #[must_use]
    pub fn new(control: Arc<dyn FailoverControl>, timeout: Duration) -> Self {
        Self { control, timeout }
    }
}

#[async_trait]
impl HealthProbe for StatusProbe {
    async fn probe(&self, primary_id: &str) -> HealthSample {
        match tokio::time::timeout(self.timeout, self.control.instance_status(primary_id)).await {
            Ok(Ok(status)) => HealthSample {
                primary_available: status.is_available(),
                status: status.status,
                observed_at: Utc::now(),
            },
            Ok(Err(e)) => {
                warn!(primary_id = %primary_id, error = %e, "Health probe failed, treating primary as unreachable");
                HealthSample::unreachable(Utc::now())
            }
            Err(_) => {
                warn!(
                    primary_id = %primary_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Health probe timed out, treating primary as unreachable"
                );
                HealthSample::unreachable(Utc::now())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::InstanceStatus;
    use anyhow::{anyhow, Result};

    enum Script {
        Status(&'static str),
        Error,
        Hang,
    }

    struct FakeControl {
        script: Script,
    }

    #[async_trait]
    impl FailoverControl for FakeControl {
        async fn instance_status(&self, instance_id: &str) -> Result<InstanceStatus> {
            match self.script {
                Script::Status(status) => Ok(InstanceStatus {
                    id: instance_id.to_string(),
                    status: status.to_string(),
                    role: "primary".to_string(),
                    endpoint: None,
                }),
                Script::Error => Err(anyhow!("connection refused")),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Err(anyhow!("unreachable"))
                }
            }
        }

        async fn promote_standby(&self, _standby_id: &str) -> Result<()> {
            unimplemented!("not exercised by the probe")
        }

        async fn create_snapshot(&self, _instance_id: &str) -> Result<String> {
            unimplemented!("not exercised by the probe")
        }
    }

    fn probe_with(script: Script, timeout: Duration) -> StatusProbe {
        StatusProbe::new(Arc::new(FakeControl { script }), timeout)
    }

    #[tokio::test]
    async fn available_status_reads_as_healthy() {
        let probe = probe_with(Script::Status("available"), Duration::from_secs(5));
        let sample = probe.probe("db-us-east").await;
        assert!(sample.primary_available);
        assert_eq!(sample.status, "available");
    }

    #[tokio::test]
    async fn non_available_status_reads_as_unhealthy() {
        let probe = probe_with(Script::Status("rebooting"), Duration::from_secs(5));
        let sample = probe.probe("db-us-east").await;
        assert!(!sample.primary_available);
        assert_eq!(sample.status, "rebooting");
    }

    #[tokio::test]
    async fn transport_errors_become_unreachable_samples() {
        let probe = probe_with(Script::Error, Duration::from_secs(5));
        let sample = probe.probe("db-us-east").await;
        assert!(!sample.primary_available);
        assert_eq!(sample.status, "unreachable");
    }

    #[tokio::test]
    async fn slow_probes_are_cut_off_at_the_timeout() {
        let probe = probe_with(Script::Hang, Duration::from_millis(20));
        let started = std::time::Instant::now();
        let sample = probe.probe("db-us-east").await;
        assert!(!sample.primary_available);
        assert_eq!(sample.status, "unreachable");
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
