//! Feature Lifecycle
//!
//! Every feature walks the same eight phases in order. Only the next phase
//! can be entered; completing `Ship` makes the lifecycle terminal.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::storage::{
    format_timestamp, from_json_column, parse_enum_column, parse_timestamp, Result, Storage,
    StorageError,
};

/// The fixed phase sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Brainstorm,
    Research,
    Plan,
    Design,
    Implement,
    Review,
    Test,
    Ship,
}

impl LifecyclePhase {
    pub const ALL: [LifecyclePhase; 8] = [
        LifecyclePhase::Brainstorm,
        LifecyclePhase::Research,
        LifecyclePhase::Plan,
        LifecyclePhase::Design,
        LifecyclePhase::Implement,
        LifecyclePhase::Review,
        LifecyclePhase::Test,
        LifecyclePhase::Ship,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePhase::Brainstorm => "brainstorm",
            LifecyclePhase::Research => "research",
            LifecyclePhase::Plan => "plan",
            LifecyclePhase::Design => "design",
            LifecyclePhase::Implement => "implement",
            LifecyclePhase::Review => "review",
            LifecyclePhase::Test => "test",
            LifecyclePhase::Ship => "ship",
        }
    }

    /// The phase after this one; `None` for `Ship`
    pub fn next(&self) -> Option<LifecyclePhase> {
        let idx = Self::ALL.iter().position(|p| p == self)?;
        Self::ALL.get(idx + 1).copied()
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecyclePhase {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| StorageError::Validation(format!("Unknown lifecycle phase '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Active,
    Completed,
}

/// Per-phase progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseDetail {
    pub phase: LifecyclePhase,
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Active,
    Completed,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::Active => "active",
            LifecycleStatus::Completed => "completed",
        }
    }
}

impl FromStr for LifecycleStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(LifecycleStatus::Active),
            "completed" => Ok(LifecycleStatus::Completed),
            other => Err(StorageError::Validation(format!(
                "Unknown lifecycle status '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle of one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleSession {
    pub id: String,
    pub session_id: Option<String>,
    pub feature: String,
    pub current_phase: LifecyclePhase,
    pub status: LifecycleStatus,
    pub phases: Vec<PhaseDetail>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LifecycleSession {
    fn detail_mut(&mut self, phase: LifecyclePhase) -> Option<&mut PhaseDetail> {
        self.phases.iter_mut().find(|d| d.phase == phase)
    }
}

/// Store for feature lifecycles
pub struct LifecycleStore {
    storage: Arc<Storage>,
}

impl LifecycleStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Begin a lifecycle in the first phase
    pub fn start(&self, feature: &str, session_id: Option<String>) -> Result<LifecycleSession> {
        if feature.trim().is_empty() {
            return Err(StorageError::Validation("feature must not be empty".to_string()));
        }
        let now = Utc::now();
        let phases = LifecyclePhase::ALL
            .iter()
            .enumerate()
            .map(|(i, phase)| PhaseDetail {
                phase: *phase,
                status: if i == 0 { PhaseStatus::Active } else { PhaseStatus::Pending },
                started_at: (i == 0).then_some(now),
                completed_at: None,
            })
            .collect();

        let lifecycle = LifecycleSession {
            id: Uuid::new_v4().to_string(),
            session_id,
            feature: feature.to_string(),
            current_phase: LifecyclePhase::Brainstorm,
            status: LifecycleStatus::Active,
            phases,
            created_at: now,
            updated_at: now,
        };
        self.storage.write(|conn| write_lifecycle(conn, &lifecycle))?;
        Ok(lifecycle)
    }

    pub fn get(&self, id: &str) -> Result<Option<LifecycleSession>> {
        self.storage.read(|conn| get_lifecycle(conn, id))
    }

    /// Lifecycles, optionally filtered, most recently updated first
    pub fn list(
        &self,
        feature: Option<&str>,
        status: Option<LifecycleStatus>,
    ) -> Result<Vec<LifecycleSession>> {
        self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM lifecycle_sessions
                 WHERE (?1 IS NULL OR feature = ?1) AND (?2 IS NULL OR status = ?2)
                 ORDER BY updated_at DESC",
            )?;
            let rows = stmt.query_map(params![feature, status.map(|s| s.as_str())], row_to_lifecycle)?;

            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
    }

    /// Complete the current phase and enter `target`, which must be the next one.
    pub fn advance(&self, id: &str, target: LifecyclePhase) -> Result<LifecycleSession> {
        self.storage.transaction(|tx| {
            let mut lifecycle = get_lifecycle(tx, id)?
                .ok_or_else(|| StorageError::NotFound(format!("lifecycle {}", id)))?;

            if lifecycle.status == LifecycleStatus::Completed {
                return Err(StorageError::Validation(format!(
                    "Lifecycle {} is already completed",
                    id
                )));
            }
            let expected = lifecycle.current_phase.next();
            if expected != Some(target) {
                return Err(StorageError::Validation(format!(
                    "Cannot move from {} to {}; next phase is {}",
                    lifecycle.current_phase,
                    target,
                    expected.map(|p| p.as_str()).unwrap_or("none (use complete)")
                )));
            }

            let now = Utc::now();
            let from = lifecycle.current_phase;
            if let Some(detail) = lifecycle.detail_mut(from) {
                detail.status = PhaseStatus::Completed;
                detail.completed_at = Some(now);
            }
            if let Some(detail) = lifecycle.detail_mut(target) {
                detail.status = PhaseStatus::Active;
                detail.started_at = Some(now);
            }
            lifecycle.current_phase = target;
            lifecycle.updated_at = now;

            write_lifecycle(tx, &lifecycle)?;
            Ok(lifecycle)
        })
    }

    /// Finish the final phase; the lifecycle becomes terminal
    pub fn complete(&self, id: &str) -> Result<LifecycleSession> {
        self.storage.transaction(|tx| {
            let mut lifecycle = get_lifecycle(tx, id)?
                .ok_or_else(|| StorageError::NotFound(format!("lifecycle {}", id)))?;

            if lifecycle.status == LifecycleStatus::Completed {
                return Err(StorageError::Validation(format!(
                    "Lifecycle {} is already completed",
                    id
                )));
            }
            if lifecycle.current_phase != LifecyclePhase::Ship {
                return Err(StorageError::Validation(format!(
                    "Lifecycle {} is in {}; only ship can complete",
                    id, lifecycle.current_phase
                )));
            }

            let now = Utc::now();
            if let Some(detail) = lifecycle.detail_mut(LifecyclePhase::Ship) {
                detail.status = PhaseStatus::Completed;
                detail.completed_at = Some(now);
            }
            lifecycle.status = LifecycleStatus::Completed;
            lifecycle.updated_at = now;

            write_lifecycle(tx, &lifecycle)?;
            Ok(lifecycle)
        })
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let rows = self.storage.write(|conn| {
            Ok(conn.execute("DELETE FROM lifecycle_sessions WHERE id = ?1", params![id])?)
        })?;
        if rows == 0 {
            return Err(StorageError::NotFound(format!("lifecycle {}", id)));
        }
        Ok(())
    }
}

fn get_lifecycle(conn: &Connection, id: &str) -> Result<Option<LifecycleSession>> {
    Ok(conn
        .query_row(
            "SELECT * FROM lifecycle_sessions WHERE id = ?1",
            params![id],
            row_to_lifecycle,
        )
        .optional()?)
}

fn write_lifecycle(conn: &Connection, lifecycle: &LifecycleSession) -> Result<()> {
    conn.execute(
        "INSERT INTO lifecycle_sessions (
            id, session_id, feature, current_phase, status, phases, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(id) DO UPDATE SET
            current_phase = excluded.current_phase,
            status = excluded.status,
            phases = excluded.phases,
            updated_at = excluded.updated_at",
        params![
            lifecycle.id,
            lifecycle.session_id,
            lifecycle.feature,
            lifecycle.current_phase.as_str(),
            lifecycle.status.as_str(),
            serde_json::to_string(&lifecycle.phases)?,
            format_timestamp(&lifecycle.created_at),
            format_timestamp(&lifecycle.updated_at),
        ],
    )?;
    Ok(())
}

fn row_to_lifecycle(row: &rusqlite::Row) -> rusqlite::Result<LifecycleSession> {
    let phase: String = row.get("current_phase")?;
    let status: String = row.get("status")?;
    let phases: String = row.get("phases")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(LifecycleSession {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        feature: row.get("feature")?,
        current_phase: parse_enum_column(&phase, "current_phase")?,
        status: parse_enum_column(&status, "status")?,
        phases: from_json_column(&phases, "phases")?,
        created_at: parse_timestamp(&created_at, "created_at")?,
        updated_at: parse_timestamp(&updated_at, "updated_at")?,
    })
}
