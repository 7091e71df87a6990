//! Automated multi-region database failover orchestration.
//!
//! The warden watches a primary database instance through the control
//! plane, tracks replication lag from telemetry, and promotes the
//! configured standby when the primary stays unhealthy and the standby is
//! close enough to current. Every decision runs inside a tick of the
//! [`orchestrator::Orchestrator`] state machine and is persisted through
//! the [`store::IncidentStore`] with optimistic concurrency, so concurrent
//! warden instances never double-promote.

pub mod config;
pub mod control_plane;
pub mod incident;
pub mod lag;
pub mod orchestrator;
pub mod probe;
pub mod promote;
pub mod store;
pub mod types;

pub use config::{NotificationsConfig, WardenConfig};
pub use control_plane::{ControlPlaneClient, ControlPlaneConfig, FailoverControl, InstanceStatus};
pub use incident::{Incident, IncidentState, Resolution};
pub use lag::{MetricsLagMonitor, TelemetryClient, TelemetryConfig};
pub use orchestrator::{Orchestrator, OrchestratorSettings, TickError};
pub use probe::StatusProbe;
pub use promote::{PromotionSettings, StandbyPromoter};
pub use store::{IncidentStore, StoreError};
pub use types::{
    FailoverExecutor, HealthProbe, HealthSample, LagMonitor, LagSample, PromotionResult,
    TickAction, TickRecord,
};
