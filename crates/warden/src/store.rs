//! SQLite-backed incident and tick store.
//!
//! The store enforces the two durability rules the state machine leans on:
//! at most one open incident exists at a time (a partial unique index
//! rejects a second open row), and every update is a conditional write
//! against the row version so concurrent orchestrator instances cannot
//! both act on the same incident. Archived rows are never touched again.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

use crate::incident::{Incident, IncidentState, Resolution};
use crate::types::{TickAction, TickRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A conditional write lost against a concurrent writer.
    #[error("conflicting update for incident {incident_id}: row version moved")]
    Conflict { incident_id: Uuid },

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Handle over the incident database.
#[derive(Debug)]
pub struct IncidentStore {
    connection: Connection,
}

impl IncidentStore {
    /// Open (and if needed create) the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let connection = Connection::open(path)?;
        let store = Self { connection };
        store.ensure_schema()?;
        Ok(store)
    }

    /// In-memory store, used by tests and `warden check`.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let connection = Connection::open_in_memory()?;
        let store = Self { connection };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        self.connection.execute_batch(
            "CREATE TABLE IF NOT EXISTS incidents (
                id                            TEXT PRIMARY KEY,
                state                         TEXT NOT NULL,
                first_unhealthy_at            TEXT NOT NULL,
                last_observed_at              TEXT NOT NULL,
                consecutive_unhealthy_checks  INTEGER NOT NULL,
                promotion_attempted           INTEGER NOT NULL DEFAULT 0,
                last_warned_at                TEXT,
                resolution                    TEXT,
                resolution_detail             TEXT,
                closed_at                     TEXT,
                version                       INTEGER NOT NULL DEFAULT 1
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_single_open
                ON incidents ((1)) WHERE closed_at IS NULL;
            CREATE TABLE IF NOT EXISTS ticks (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                at                  TEXT NOT NULL,
                incident_id         TEXT,
                incident_state      TEXT NOT NULL,
                action              TEXT NOT NULL,
                notifications_sent  INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_ticks_at ON ticks (at);",
        )?;
        Ok(())
    }

    /// Insert a freshly opened incident. Fails with [`StoreError::Conflict`]
    /// when another open incident already exists.
    pub fn create_incident(&self, incident: &Incident) -> Result<(), StoreError> {
        let result = self.connection.execute(
            "INSERT INTO incidents (
                id, state, first_unhealthy_at, last_observed_at,
                consecutive_unhealthy_checks, promotion_attempted,
                last_warned_at, resolution, resolution_detail, closed_at, version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                incident.id.to_string(),
                incident.state.as_str(),
                timestamp(&incident.first_unhealthy_at),
                timestamp(&incident.last_observed_at),
                i64::from(incident.consecutive_unhealthy_checks),
                i64::from(incident.promotion_attempted),
                incident.last_warned_at.map(|at| timestamp(&at)),
                incident.resolution.map(|r| r.as_str()),
                incident.resolution_detail.as_deref(),
                incident.closed_at.map(|at| timestamp(&at)),
                incident.version,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => Err(StoreError::Conflict {
                incident_id: incident.id,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// The single open incident, if any.
    pub fn load_open_incident(&self) -> Result<Option<Incident>, StoreError> {
        let raw = self
            .connection
            .query_row(
                &format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE closed_at IS NULL"),
                [],
                read_raw_incident,
            )
            .optional()?;
        raw.map(parse_incident).transpose()
    }

    /// Conditional write: succeeds only when the caller holds the current
    /// row version, and bumps the version on success.
    pub fn update_incident(&self, incident: &mut Incident) -> Result<(), StoreError> {
        let rows = self.connection.execute(
            "UPDATE incidents
                SET state = ?2, last_observed_at = ?3,
                    consecutive_unhealthy_checks = ?4, promotion_attempted = ?5,
                    last_warned_at = ?6, resolution = ?7, resolution_detail = ?8,
                    closed_at = ?9, version = version + 1
              WHERE id = ?1 AND version = ?10",
            params![
                incident.id.to_string(),
                incident.state.as_str(),
                timestamp(&incident.last_observed_at),
                i64::from(incident.consecutive_unhealthy_checks),
                i64::from(incident.promotion_attempted),
                incident.last_warned_at.map(|at| timestamp(&at)),
                incident.resolution.map(|r| r.as_str()),
                incident.resolution_detail.as_deref(),
                incident.closed_at.map(|at| timestamp(&at)),
                incident.version,
            ],
        )?;
        if rows == 0 {
            return Err(StoreError::Conflict {
                incident_id: incident.id,
            });
        }
        incident.version += 1;
        Ok(())
    }

    /// Most recent incidents, open or archived, newest first.
    pub fn recent_incidents(&self, limit: usize) -> Result<Vec<Incident>, StoreError> {
        let mut statement = self.connection.prepare(&format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents
              ORDER BY first_unhealthy_at DESC LIMIT ?1"
        ))?;
        let rows = statement.query_map(params![limit as i64], read_raw_incident)?;
        let mut incidents = Vec::new();
        for raw in rows {
            incidents.push(parse_incident(raw?)?);
        }
        Ok(incidents)
    }

    /// Append one tick to the audit trail.
    pub fn record_tick(&self, record: &TickRecord) -> Result<i64, StoreError> {
        self.connection.execute(
            "INSERT INTO ticks (at, incident_id, incident_state, action, notifications_sent)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                timestamp(&record.at),
                record.incident_id.map(|id| id.to_string()),
                record.incident_state.as_str(),
                record.action.as_str(),
                i64::from(record.notifications_sent),
            ],
        )?;
        Ok(self.connection.last_insert_rowid())
    }

    /// The most recently recorded tick, if any.
    pub fn last_tick(&self) -> Result<Option<TickRecord>, StoreError> {
        let raw = self
            .connection
            .query_row(
                "SELECT at, incident_id, incident_state, action, notifications_sent
                   FROM ticks ORDER BY id DESC LIMIT 1",
                [],
                read_raw_tick,
            )
            .optional()?;
        raw.map(parse_tick).transpose()
    }

    /// Delete archived incidents and tick records older than the cutoff.
    /// Open incidents are never pruned.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = timestamp(&cutoff);
        let incidents = self.connection.execute(
            "DELETE FROM incidents WHERE closed_at IS NOT NULL AND closed_at < ?1",
            params![cutoff],
        )?;
        let ticks = self
            .connection
            .execute("DELETE FROM ticks WHERE at < ?1", params![cutoff])?;
        Ok(incidents + ticks)
    }
}

const INCIDENT_COLUMNS: &str = "id, state, first_unhealthy_at, last_observed_at, \
    consecutive_unhealthy_checks, promotion_attempted, last_warned_at, \
    resolution, resolution_detail, closed_at, version";

// Raw column values, converted outside the rusqlite row closure so parse
// failures surface as Corrupt instead of panics.
struct RawIncident {
    id: String,
    state: String,
    first_unhealthy_at: String,
    last_observed_at: String,
    consecutive_unhealthy_checks: i64,
    promotion_attempted: i64,
    last_warned_at: Option<String>,
    resolution: Option<String>,
    resolution_detail: Option<String>,
    closed_at: Option<String>,
    version: i64,
}

fn read_raw_incident(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawIncident> {
    Ok(RawIncident {
        id: row.get(0)?,
        state: row.get(1)?,
        first_unhealthy_at: row.get(2)?,
        last_observed_at: row.get(3)?,
        consecutive_unhealthy_checks: row.get(4)?,
        promotion_attempted: row.get(5)?,
        last_warned_at: row.get(6)?,
        resolution: row.get(7)?,
        resolution_detail: row.get(8)?,
        closed_at: row.get(9)?,
        version: row.get(10)?,
    })
}

fn parse_incident(raw: RawIncident) -> Result<Incident, StoreError> {
    let id = Uuid::parse_str(&raw.id)
        .map_err(|err| StoreError::Corrupt(format!("bad incident id {}: {err}", raw.id)))?;
    let state = IncidentState::parse(&raw.state)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown incident state {}", raw.state)))?;
    let resolution = raw
        .resolution
        .as_deref()
        .map(|value| {
            Resolution::parse(value)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown resolution {value}")))
        })
        .transpose()?;
    let consecutive_unhealthy_checks = u32::try_from(raw.consecutive_unhealthy_checks)
        .map_err(|_| StoreError::Corrupt("negative unhealthy check count".to_string()))?;
    Ok(Incident {
        id,
        state,
        first_unhealthy_at: parse_timestamp(&raw.first_unhealthy_at)?,
        last_observed_at: parse_timestamp(&raw.last_observed_at)?,
        consecutive_unhealthy_checks,
        promotion_attempted: raw.promotion_attempted != 0,
        last_warned_at: raw.last_warned_at.as_deref().map(parse_timestamp).transpose()?,
        resolution,
        resolution_detail: raw.resolution_detail,
        closed_at: raw.closed_at.as_deref().map(parse_timestamp).transpose()?,
        version: raw.version,
    })
}

struct RawTick {
    at: String,
    incident_id: Option<String>,
    incident_state: String,
    action: String,
    notifications_sent: i64,
}

fn read_raw_tick(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTick> {
    Ok(RawTick {
        at: row.get(0)?,
        incident_id: row.get(1)?,
        incident_state: row.get(2)?,
        action: row.get(3)?,
        notifications_sent: row.get(4)?,
    })
}

fn parse_tick(raw: RawTick) -> Result<TickRecord, StoreError> {
    let incident_id = raw
        .incident_id
        .as_deref()
        .map(|value| {
            Uuid::parse_str(value)
                .map_err(|err| StoreError::Corrupt(format!("bad incident id {value}: {err}")))
        })
        .transpose()?;
    let incident_state = IncidentState::parse(&raw.incident_state)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown incident state {}", raw.incident_state)))?;
    let action = TickAction::parse(&raw.action)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown tick action {}", raw.action)))?;
    let notifications_sent = u32::try_from(raw.notifications_sent)
        .map_err(|_| StoreError::Corrupt("negative notification count".to_string()))?;
    Ok(TickRecord {
        at: parse_timestamp(&raw.at)?,
        incident_id,
        incident_state,
        action,
        notifications_sent,
    })
}

// Fixed-width UTC timestamps so lexicographic comparison in SQL matches
// chronological order.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("bad timestamp {value}: {err}")))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}
