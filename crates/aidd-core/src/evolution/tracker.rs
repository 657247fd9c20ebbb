//! Evolution candidate persistence, action log and snapshots

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    CandidateFilter, CandidateStatus, DecayReport, EvolutionAction, EvolutionCandidate,
    EvolutionLogEntry, EvolutionSnapshot, EvolutionStatus, NewCandidate, RevertOutcome,
};
use crate::storage::{
    format_timestamp, from_json_column, parse_enum_column, parse_timestamp, to_sql_limit, Result,
    Storage, StorageError,
};

/// Title overlap above which a deleted convention decays a candidate
pub const DECAY_SIMILARITY_THRESHOLD: f64 = 0.3;

/// Candidates decayed below this are deleted
pub const MIN_CONFIDENCE: f64 = 30.0;

/// Pending candidates at or above this are eligible for `auto_apply`
pub const DEFAULT_AUTO_APPLY_CONFIDENCE: f64 = 90.0;

/// Jaccard similarity of lower-cased whitespace tokens
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let left: HashSet<String> = a.split_whitespace().map(str::to_lowercase).collect();
    let right: HashSet<String> = b.split_whitespace().map(str::to_lowercase).collect();
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}

/// Store and state machine for evolution candidates
pub struct EvolutionTracker {
    storage: Arc<Storage>,
}

impl EvolutionTracker {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Record a new pending candidate
    pub fn propose(&self, input: NewCandidate) -> Result<EvolutionCandidate> {
        let now = Utc::now();
        let candidate = EvolutionCandidate {
            id: Uuid::new_v4().to_string(),
            candidate_type: input.candidate_type,
            title: input.title,
            description: input.description,
            confidence: input.confidence,
            model_scope: input.model_scope,
            status: CandidateStatus::Pending,
            evidence: input.evidence,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        };
        validate(&candidate)?;

        self.storage.transaction(|tx| {
            write_candidate(tx, &candidate)?;
            append_log(tx, &candidate, EvolutionAction::Proposed, None)?;
            Ok(candidate)
        })
    }

    /// Insert or overwrite a candidate keyed by its id
    pub fn save(&self, candidate: &EvolutionCandidate) -> Result<EvolutionCandidate> {
        validate(candidate)?;
        self.storage.transaction(|tx| {
            let existed = get_candidate(tx, &candidate.id)?.is_some();
            write_candidate(tx, candidate)?;
            let action = if existed {
                EvolutionAction::Updated
            } else {
                EvolutionAction::Proposed
            };
            append_log(tx, candidate, action, None)?;
            Ok(candidate.clone())
        })
    }

    /// Overwrite an existing candidate; `NotFound` if it is gone
    pub fn update(&self, candidate: &EvolutionCandidate) -> Result<EvolutionCandidate> {
        validate(candidate)?;
        self.storage.transaction(|tx| {
            let stored = require_candidate(tx, &candidate.id)?;
            let mut updated = candidate.clone();
            updated.created_at = stored.created_at;
            updated.updated_at = Utc::now();
            write_candidate(tx, &updated)?;
            append_log(tx, &updated, EvolutionAction::Updated, None)?;
            Ok(updated)
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<EvolutionCandidate>> {
        self.storage.read(|conn| get_candidate(conn, id))
    }

    /// Matching candidates, highest confidence first
    pub fn list_candidates(&self, filter: &CandidateFilter) -> Result<Vec<EvolutionCandidate>> {
        let title_pattern = filter
            .title_contains
            .as_ref()
            .map(|t| format!("%{}%", t.to_lowercase()));

        self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM evolution_candidates
                 WHERE (?1 IS NULL OR type = ?1)
                   AND (?2 IS NULL OR lower(title) LIKE ?2)
                   AND (?3 IS NULL OR model_scope = ?3)
                   AND (?4 IS NULL OR confidence >= ?4)
                   AND (?5 IS NULL OR status = ?5)
                 ORDER BY confidence DESC, updated_at DESC",
            )?;
            let rows = stmt.query_map(
                params![
                    filter.candidate_type.map(|t| t.as_str()),
                    title_pattern,
                    filter.model_scope,
                    filter.min_confidence,
                    filter.status.map(|s| s.as_str()),
                ],
                row_to_candidate,
            )?;

            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
    }

    /// pending -> approved
    pub fn approve(&self, id: &str) -> Result<EvolutionCandidate> {
        self.transition(id, &[CandidateStatus::Pending], EvolutionAction::Approved, |c| {
            c.status = CandidateStatus::Approved;
        })
    }

    /// pending|approved -> rejected
    pub fn reject(&self, id: &str, reason: &str) -> Result<EvolutionCandidate> {
        let reason = reason.trim().to_string();
        self.transition(
            id,
            &[CandidateStatus::Pending, CandidateStatus::Approved],
            EvolutionAction::Rejected,
            |c| {
                c.status = CandidateStatus::Rejected;
                c.rejection_reason = (!reason.is_empty()).then(|| reason.clone());
            },
        )
    }

    /// pending|approved -> applied. Snapshots the candidate first so the
    /// change can be reverted; `before_content` is whatever the change
    /// overwrote.
    pub fn apply(&self, id: &str, before_content: Option<&str>) -> Result<EvolutionCandidate> {
        self.apply_with(id, before_content, EvolutionAction::Applied)
    }

    /// Apply every pending candidate at or above `min_confidence`.
    pub fn auto_apply(&self, min_confidence: f64) -> Result<Vec<EvolutionCandidate>> {
        let eligible = self.list_candidates(&CandidateFilter {
            min_confidence: Some(min_confidence),
            status: Some(CandidateStatus::Pending),
            ..Default::default()
        })?;

        let mut applied = Vec::with_capacity(eligible.len());
        for candidate in eligible {
            applied.push(self.apply_with(&candidate.id, None, EvolutionAction::AutoApplied)?);
        }
        if !applied.is_empty() {
            tracing::info!("Auto-applied {} evolution candidates", applied.len());
        }
        Ok(applied)
    }

    /// applied -> reverted, restoring the latest snapshot
    pub fn revert(&self, id: &str) -> Result<RevertOutcome> {
        self.storage.transaction(|tx| {
            let current = require_candidate(tx, id)?;
            if current.status != CandidateStatus::Applied {
                return Err(invalid_transition(&current, "revert"));
            }
            let snapshot = latest_snapshot(tx, id)?
                .ok_or_else(|| StorageError::NotFound(format!("snapshot for candidate {}", id)))?;

            let mut restored = snapshot.candidate_state;
            restored.status = CandidateStatus::Reverted;
            restored.updated_at = Utc::now();
            write_candidate(tx, &restored)?;
            append_log(tx, &restored, EvolutionAction::Reverted, None)?;

            Ok(RevertOutcome {
                candidate: restored,
                restored_content: snapshot.target_content,
            })
        })
    }

    /// Remove a candidate and its snapshots; its log stays.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.storage.transaction(|tx| {
            let candidate = require_candidate(tx, id)?;
            tx.execute("DELETE FROM evolution_snapshots WHERE candidate_id = ?1", params![id])?;
            tx.execute("DELETE FROM evolution_candidates WHERE id = ?1", params![id])?;
            append_log(tx, &candidate, EvolutionAction::Deleted, None)?;
            Ok(())
        })
    }

    pub fn status(&self) -> Result<EvolutionStatus> {
        self.storage.read(|conn| {
            let mut status = EvolutionStatus::default();
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM evolution_candidates GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (name, count) = row?;
                let count = count as usize;
                match parse_enum_column::<CandidateStatus>(&name, "status")? {
                    CandidateStatus::Pending => status.pending = count,
                    CandidateStatus::Approved => status.approved = count,
                    CandidateStatus::Rejected => status.rejected = count,
                    CandidateStatus::Applied => status.applied = count,
                    CandidateStatus::Reverted => status.reverted = count,
                }
            }

            let auto_applied: i64 = conn.query_row(
                "SELECT COUNT(*) FROM evolution_log WHERE action = 'auto_applied'",
                [],
                |row| row.get(0),
            )?;
            status.auto_applied = auto_applied as usize;
            Ok(status)
        })
    }

    /// Log entries, newest first
    pub fn list_log(&self, candidate_id: Option<&str>, limit: usize) -> Result<Vec<EvolutionLogEntry>> {
        self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM evolution_log
                 WHERE ?1 IS NULL OR candidate_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![candidate_id, to_sql_limit(limit)], row_to_log_entry)?;

            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
    }

    /// Snapshots of one candidate, newest first
    pub fn list_snapshots(&self, candidate_id: &str) -> Result<Vec<EvolutionSnapshot>> {
        self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM evolution_snapshots WHERE candidate_id = ?1 ORDER BY id DESC",
            )?;
            let rows = stmt.query_map(params![candidate_id], row_to_snapshot)?;

            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
    }

    /// Weaken convention candidates that resemble a deleted convention.
    ///
    /// Overlap above [`DECAY_SIMILARITY_THRESHOLD`] halves confidence; a
    /// candidate that drops below [`MIN_CONFIDENCE`] is deleted.
    pub fn decay_for_deleted_text(&self, deleted_text: &str) -> Result<DecayReport> {
        let report = self.storage.transaction(|tx| {
            let mut report = DecayReport::default();
            let candidates = {
                let mut stmt = tx.prepare(
                    "SELECT * FROM evolution_candidates WHERE type IN ('new_convention', 'rule_elevation')",
                )?;
                let rows = stmt.query_map([], row_to_candidate)?;
                let mut result = Vec::new();
                for row in rows {
                    result.push(row?);
                }
                result
            };

            for mut candidate in candidates {
                if !candidate.candidate_type.decays_with_conventions() {
                    continue;
                }
                let similarity = jaccard_similarity(&candidate.title, deleted_text);
                if similarity <= DECAY_SIMILARITY_THRESHOLD {
                    continue;
                }

                let detail = format!("similarity {:.2} with deleted convention", similarity);
                candidate.confidence /= 2.0;
                candidate.updated_at = Utc::now();

                if candidate.confidence < MIN_CONFIDENCE {
                    tx.execute(
                        "DELETE FROM evolution_snapshots WHERE candidate_id = ?1",
                        params![candidate.id],
                    )?;
                    tx.execute(
                        "DELETE FROM evolution_candidates WHERE id = ?1",
                        params![candidate.id],
                    )?;
                    append_log(tx, &candidate, EvolutionAction::Removed, Some(&detail))?;
                    report.removed.push(candidate.id);
                } else {
                    write_candidate(tx, &candidate)?;
                    append_log(tx, &candidate, EvolutionAction::Decayed, Some(&detail))?;
                    report.decayed.push(candidate.id);
                }
            }
            Ok(report)
        })?;

        if !report.is_empty() {
            tracing::info!(
                "Confidence decay: {} decayed, {} removed",
                report.decayed.len(),
                report.removed.len()
            );
        }
        Ok(report)
    }

    fn apply_with(
        &self,
        id: &str,
        before_content: Option<&str>,
        action: EvolutionAction,
    ) -> Result<EvolutionCandidate> {
        self.storage.transaction(|tx| {
            let mut candidate = require_candidate(tx, id)?;
            if !matches!(
                candidate.status,
                CandidateStatus::Pending | CandidateStatus::Approved
            ) {
                return Err(invalid_transition(&candidate, "apply"));
            }

            tx.execute(
                "INSERT INTO evolution_snapshots (candidate_id, candidate_state, target_content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    candidate.id,
                    serde_json::to_string(&candidate)?,
                    before_content,
                    format_timestamp(&Utc::now()),
                ],
            )?;

            candidate.status = CandidateStatus::Applied;
            candidate.updated_at = Utc::now();
            write_candidate(tx, &candidate)?;
            append_log(tx, &candidate, action, None)?;
            Ok(candidate)
        })
    }

    fn transition(
        &self,
        id: &str,
        from: &[CandidateStatus],
        action: EvolutionAction,
        change: impl FnOnce(&mut EvolutionCandidate),
    ) -> Result<EvolutionCandidate> {
        self.storage.transaction(|tx| {
            let mut candidate = require_candidate(tx, id)?;
            if !from.contains(&candidate.status) {
                return Err(invalid_transition(&candidate, action.as_str()));
            }
            change(&mut candidate);
            candidate.updated_at = Utc::now();
            write_candidate(tx, &candidate)?;
            append_log(tx, &candidate, action, candidate.rejection_reason.as_deref())?;
            Ok(candidate)
        })
    }
}

fn validate(candidate: &EvolutionCandidate) -> Result<()> {
    if candidate.title.trim().is_empty() {
        return Err(StorageError::Validation("candidate title must not be empty".to_string()));
    }
    if !(0.0..=100.0).contains(&candidate.confidence) {
        return Err(StorageError::Validation(format!(
            "confidence must be within 0-100, got {}",
            candidate.confidence
        )));
    }
    Ok(())
}

fn invalid_transition(candidate: &EvolutionCandidate, action: &str) -> StorageError {
    StorageError::Validation(format!(
        "Cannot {} candidate {} while it is {}",
        action, candidate.id, candidate.status
    ))
}

fn get_candidate(conn: &Connection, id: &str) -> Result<Option<EvolutionCandidate>> {
    Ok(conn
        .query_row(
            "SELECT * FROM evolution_candidates WHERE id = ?1",
            params![id],
            row_to_candidate,
        )
        .optional()?)
}

fn require_candidate(conn: &Connection, id: &str) -> Result<EvolutionCandidate> {
    get_candidate(conn, id)?.ok_or_else(|| StorageError::NotFound(format!("candidate {}", id)))
}

fn latest_snapshot(conn: &Connection, candidate_id: &str) -> Result<Option<EvolutionSnapshot>> {
    Ok(conn
        .query_row(
            "SELECT * FROM evolution_snapshots WHERE candidate_id = ?1 ORDER BY id DESC LIMIT 1",
            params![candidate_id],
            row_to_snapshot,
        )
        .optional()?)
}

fn write_candidate(conn: &Connection, candidate: &EvolutionCandidate) -> Result<()> {
    conn.execute(
        "INSERT INTO evolution_candidates (
            id, type, title, description, confidence, model_scope, status,
            evidence, rejection_reason, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(id) DO UPDATE SET
            type = excluded.type,
            title = excluded.title,
            description = excluded.description,
            confidence = excluded.confidence,
            model_scope = excluded.model_scope,
            status = excluded.status,
            evidence = excluded.evidence,
            rejection_reason = excluded.rejection_reason,
            updated_at = excluded.updated_at",
        params![
            candidate.id,
            candidate.candidate_type.as_str(),
            candidate.title,
            candidate.description,
            candidate.confidence,
            candidate.model_scope,
            candidate.status.as_str(),
            serde_json::to_string(&candidate.evidence)?,
            candidate.rejection_reason,
            format_timestamp(&candidate.created_at),
            format_timestamp(&candidate.updated_at),
        ],
    )?;
    Ok(())
}

fn append_log(
    conn: &Connection,
    candidate: &EvolutionCandidate,
    action: EvolutionAction,
    detail: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO evolution_log (candidate_id, action, confidence, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            candidate.id,
            action.as_str(),
            candidate.confidence,
            detail,
            format_timestamp(&Utc::now()),
        ],
    )?;
    Ok(())
}

fn row_to_candidate(row: &rusqlite::Row) -> rusqlite::Result<EvolutionCandidate> {
    let candidate_type: String = row.get("type")?;
    let status: String = row.get("status")?;
    let evidence: String = row.get("evidence")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(EvolutionCandidate {
        id: row.get("id")?,
        candidate_type: parse_enum_column(&candidate_type, "type")?,
        title: row.get("title")?,
        description: row.get("description")?,
        confidence: row.get("confidence")?,
        model_scope: row.get("model_scope")?,
        status: parse_enum_column(&status, "status")?,
        evidence: from_json_column(&evidence, "evidence")?,
        rejection_reason: row.get("rejection_reason")?,
        created_at: parse_timestamp(&created_at, "created_at")?,
        updated_at: parse_timestamp(&updated_at, "updated_at")?,
    })
}

fn row_to_log_entry(row: &rusqlite::Row) -> rusqlite::Result<EvolutionLogEntry> {
    let action: String = row.get("action")?;
    let created_at: String = row.get("created_at")?;

    Ok(EvolutionLogEntry {
        id: row.get("id")?,
        candidate_id: row.get("candidate_id")?,
        action: parse_enum_column(&action, "action")?,
        confidence: row.get("confidence")?,
        detail: row.get("detail")?,
        created_at: parse_timestamp(&created_at, "created_at")?,
    })
}

fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<EvolutionSnapshot> {
    let state: String = row.get("candidate_state")?;
    let created_at: String = row.get("created_at")?;

    Ok(EvolutionSnapshot {
        id: row.get("id")?,
        candidate_id: row.get("candidate_id")?,
        candidate_state: from_json_column(&state, "candidate_state")?,
        target_content: row.get("target_content")?,
        created_at: parse_timestamp(&created_at, "created_at")?,
    })
}
