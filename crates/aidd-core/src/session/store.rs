//! Session and observation persistence

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::{
    NewObservation, SessionObservation, SessionOutcome, SessionState, SessionStatus,
};
use crate::storage::{
    format_timestamp, from_json_column, parse_enum_column, parse_optional_timestamp,
    parse_timestamp, to_sql_limit, Result, Storage, StorageError,
};

/// Filters for `SessionStore::list`; newest sessions first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFilter {
    pub branch: Option<String>,
    pub status: Option<SessionStatus>,
    pub memory_session_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for SessionFilter {
    fn default() -> Self {
        Self {
            branch: None,
            status: None,
            memory_session_id: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// Totals plus the most recent sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub total: i64,
    pub active: i64,
    pub completed: i64,
    pub recent: Vec<SessionState>,
}

/// Store for sessions and their observations
pub struct SessionStore {
    storage: Arc<Storage>,
}

impl SessionStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    // ========================================================================
    // SESSIONS
    // ========================================================================

    /// Upsert by id. Status is re-derived from `ended_at`; a session already
    /// stored as completed cannot be overwritten.
    pub fn save(&self, session: &SessionState) -> Result<SessionState> {
        if session.branch.trim().is_empty() {
            return Err(StorageError::Validation("branch must not be empty".to_string()));
        }
        validate_outcome(session.outcome.as_ref())?;
        let mut session = session.clone();
        session.status = session.derived_status();

        self.storage.transaction(|tx| {
            if let Some(existing) = get_session(tx, &session.id)? {
                if existing.ended_at.is_some() {
                    return Err(StorageError::Validation(format!(
                        "Session {} is completed and can no longer change",
                        session.id
                    )));
                }
            }
            write_session(tx, &session)?;
            Ok(session)
        })
    }

    /// Set `ended_at` and the outcome in one step
    pub fn end(&self, id: &str, outcome: Option<SessionOutcome>) -> Result<SessionState> {
        self.storage.transaction(|tx| {
            let mut session =
                get_session(tx, id)?.ok_or_else(|| StorageError::NotFound(format!("session {}", id)))?;
            if session.ended_at.is_some() {
                return Err(StorageError::Validation(format!(
                    "Session {} already ended",
                    id
                )));
            }
            validate_outcome(outcome.as_ref())?;

            session.ended_at = Some(Utc::now());
            session.outcome = outcome;
            session.status = SessionStatus::Completed;
            write_session(tx, &session)?;
            Ok(session)
        })
    }

    /// Get a session by id
    pub fn get(&self, id: &str) -> Result<Option<SessionState>> {
        self.storage.read(|conn| get_session(conn, id))
    }

    /// Sessions matching `filter`, most recently started first
    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<SessionState>> {
        self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM sessions
                 WHERE (?1 IS NULL OR branch = ?1)
                   AND (?2 IS NULL OR status = ?2)
                   AND (?3 IS NULL OR memory_session_id = ?3)
                 ORDER BY started_at DESC, rowid DESC
                 LIMIT ?4 OFFSET ?5",
            )?;
            let rows = stmt.query_map(
                params![
                    filter.branch,
                    filter.status.map(|s| s.as_str()),
                    filter.memory_session_id,
                    to_sql_limit(filter.limit),
                    to_sql_limit(filter.offset),
                ],
                row_to_session,
            )?;

            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
    }

    /// Completed sessions, most recently ended first
    pub fn recent_completed(&self, limit: usize) -> Result<Vec<SessionState>> {
        self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM sessions WHERE ended_at IS NOT NULL
                 ORDER BY ended_at DESC, rowid DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![to_sql_limit(limit)], row_to_session)?;

            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
    }

    /// Remove a session and, by cascade, its observations
    pub fn delete(&self, id: &str) -> Result<()> {
        let rows = self
            .storage
            .write(|conn| Ok(conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?))?;
        if rows == 0 {
            return Err(StorageError::NotFound(format!("session {}", id)));
        }
        Ok(())
    }

    pub fn summary(&self) -> Result<SessionSummary> {
        let (total, active) = self.storage.read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(CASE WHEN ended_at IS NULL THEN 1 ELSE 0 END), 0)
                 FROM sessions",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )?)
        })?;

        let recent = self.list(&SessionFilter {
            limit: 5,
            ..Default::default()
        })?;

        Ok(SessionSummary {
            total,
            active,
            completed: total - active,
            recent,
        })
    }

    // ========================================================================
    // OBSERVATIONS
    // ========================================================================

    /// Record an observation against an existing session
    pub fn save_observation(&self, input: NewObservation) -> Result<SessionObservation> {
        if input.title.trim().is_empty() {
            return Err(StorageError::Validation("observation title must not be empty".to_string()));
        }

        let observation = SessionObservation {
            id: Uuid::new_v4().to_string(),
            session_id: input.session_id,
            observation_type: input.observation_type,
            title: input.title,
            narrative: input.narrative,
            facts: input.facts,
            concepts: input.concepts,
            files_read: input.files_read,
            files_modified: input.files_modified,
            discovery_tokens: input.discovery_tokens,
            created_at: Utc::now(),
        };

        self.storage.transaction(|tx| {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM sessions WHERE id = ?1",
                    params![observation.session_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StorageError::NotFound(format!(
                    "session {}",
                    observation.session_id
                )));
            }

            tx.execute(
                "INSERT INTO observations (
                    id, session_id, type, title, narrative, facts, concepts,
                    files_read, files_modified, discovery_tokens, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    observation.id,
                    observation.session_id,
                    observation.observation_type.as_str(),
                    observation.title,
                    observation.narrative,
                    serde_json::to_string(&observation.facts)?,
                    serde_json::to_string(&observation.concepts)?,
                    serde_json::to_string(&observation.files_read)?,
                    serde_json::to_string(&observation.files_modified)?,
                    observation.discovery_tokens,
                    format_timestamp(&observation.created_at),
                ],
            )?;
            Ok(())
        })?;

        Ok(observation)
    }

    pub fn get_observation(&self, id: &str) -> Result<Option<SessionObservation>> {
        self.storage.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM observations WHERE id = ?1",
                    params![id],
                    row_to_observation,
                )
                .optional()?)
        })
    }

    /// Observations, optionally of one session, newest first
    pub fn list_observations(
        &self,
        session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SessionObservation>> {
        self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM observations
                 WHERE ?1 IS NULL OR session_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![session_id, to_sql_limit(limit)], row_to_observation)?;

            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
    }

    pub fn delete_observation(&self, id: &str) -> Result<()> {
        let rows = self.storage.write(|conn| {
            Ok(conn.execute("DELETE FROM observations WHERE id = ?1", params![id])?)
        })?;
        if rows == 0 {
            return Err(StorageError::NotFound(format!("observation {}", id)));
        }
        Ok(())
    }
}

fn get_session(conn: &Connection, id: &str) -> Result<Option<SessionState>> {
    Ok(conn
        .query_row(
            "SELECT * FROM sessions WHERE id = ?1",
            params![id],
            row_to_session,
        )
        .optional()?)
}

fn write_session(conn: &Connection, session: &SessionState) -> Result<()> {
    let outcome = session.outcome.as_ref();
    conn.execute(
        "INSERT INTO sessions (
            id, parent_session_id, memory_session_id, branch, started_at, ended_at,
            status, ai_model, decisions, errors_resolved, files_modified,
            tasks_completed, tasks_pending, tests_passing, revert_count,
            compliance_score, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        ON CONFLICT(id) DO UPDATE SET
            parent_session_id = excluded.parent_session_id,
            memory_session_id = excluded.memory_session_id,
            branch = excluded.branch,
            started_at = excluded.started_at,
            ended_at = excluded.ended_at,
            status = excluded.status,
            ai_model = excluded.ai_model,
            decisions = excluded.decisions,
            errors_resolved = excluded.errors_resolved,
            files_modified = excluded.files_modified,
            tasks_completed = excluded.tasks_completed,
            tasks_pending = excluded.tasks_pending,
            tests_passing = excluded.tests_passing,
            revert_count = excluded.revert_count,
            compliance_score = excluded.compliance_score,
            updated_at = excluded.updated_at",
        params![
            session.id,
            session.parent_session_id,
            session.memory_session_id,
            session.branch,
            format_timestamp(&session.started_at),
            session.ended_at.as_ref().map(format_timestamp),
            session.status.as_str(),
            session.ai_model,
            serde_json::to_string(&session.decisions)?,
            serde_json::to_string(&session.errors_resolved)?,
            serde_json::to_string(&session.files_modified)?,
            serde_json::to_string(&session.tasks_completed)?,
            serde_json::to_string(&session.tasks_pending)?,
            outcome.map(|o| o.tests_passing),
            outcome.map(|o| o.revert_count),
            outcome.map(|o| o.compliance_score),
            format_timestamp(&Utc::now()),
        ],
    )?;
    Ok(())
}

/// Convert a `sessions` row
pub(crate) fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<SessionState> {
    let started_at: String = row.get("started_at")?;
    let ended_at = parse_optional_timestamp(row.get("ended_at")?, "ended_at")?;

    let tests_passing: Option<bool> = row.get("tests_passing")?;
    let revert_count: Option<u32> = row.get("revert_count")?;
    let compliance_score: Option<f64> = row.get("compliance_score")?;
    let outcome = tests_passing.map(|tests_passing| SessionOutcome {
        tests_passing,
        revert_count: revert_count.unwrap_or(0),
        compliance_score: compliance_score.unwrap_or(0.0),
    });

    let json_list = |column: &str| -> rusqlite::Result<Vec<String>> {
        let raw: String = row.get(column)?;
        from_json_column(&raw, column)
    };

    Ok(SessionState {
        id: row.get("id")?,
        parent_session_id: row.get("parent_session_id")?,
        memory_session_id: row.get("memory_session_id")?,
        branch: row.get("branch")?,
        started_at: parse_timestamp(&started_at, "started_at")?,
        status: if ended_at.is_some() {
            SessionStatus::Completed
        } else {
            SessionStatus::Active
        },
        ended_at,
        ai_model: row.get("ai_model")?,
        decisions: json_list("decisions")?,
        errors_resolved: json_list("errors_resolved")?,
        files_modified: json_list("files_modified")?,
        tasks_completed: json_list("tasks_completed")?,
        tasks_pending: json_list("tasks_pending")?,
        outcome,
    })
}

/// Convert an `observations` row
pub(crate) fn row_to_observation(row: &rusqlite::Row) -> rusqlite::Result<SessionObservation> {
    let kind: String = row.get("type")?;
    let observation_type = parse_enum_column(&kind, "type")?;
    let created_at: String = row.get("created_at")?;

    let json_list = |column: &str| -> rusqlite::Result<Vec<String>> {
        let raw: String = row.get(column)?;
        from_json_column(&raw, column)
    };

    Ok(SessionObservation {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        observation_type,
        title: row.get("title")?,
        narrative: row.get("narrative")?,
        facts: json_list("facts")?,
        concepts: json_list("concepts")?,
        files_read: json_list("files_read")?,
        files_modified: json_list("files_modified")?,
        discovery_tokens: row.get("discovery_tokens")?,
        created_at: parse_timestamp(&created_at, "created_at")?,
    })
}

fn validate_outcome(outcome: Option<&SessionOutcome>) -> Result<()> {
    match outcome {
        Some(o) if !(0.0..=100.0).contains(&o.compliance_score) => Err(StorageError::Validation(
            format!("compliance score {} is outside 0-100", o.compliance_score),
        )),
        _ => Ok(()),
    }
}
