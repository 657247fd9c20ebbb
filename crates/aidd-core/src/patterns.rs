//! Pattern Analytics
//!
//! Banned code patterns, the detections recorded against them, and
//! per-session audit scores.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::storage::{
    format_timestamp, from_json_column, parse_enum_column, parse_timestamp, to_sql_limit, Result,
    Storage, StorageError,
};

/// Audits at or above this total pass
pub const AUDIT_PASS_SCORE: f64 = 80.0;
/// Audits at or above this total (and below pass) warn
pub const AUDIT_WARN_SCORE: f64 = 60.0;

const DEFAULT_CATEGORY: &str = "general";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternSeverity {
    Info,
    #[default]
    Warning,
    Error,
}

impl PatternSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternSeverity::Info => "info",
            PatternSeverity::Warning => "warning",
            PatternSeverity::Error => "error",
        }
    }
}

impl fmt::Display for PatternSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternSeverity {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "info" => Ok(PatternSeverity::Info),
            "warning" => Ok(PatternSeverity::Warning),
            "error" => Ok(PatternSeverity::Error),
            other => Err(StorageError::Validation(format!(
                "Unknown pattern severity '{}'",
                other
            ))),
        }
    }
}

/// A code pattern the project has banned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BannedPattern {
    pub id: String,
    pub pattern: String,
    pub category: String,
    pub description: Option<String>,
    pub severity: PatternSeverity,
    pub active: bool,
    /// Detections recorded against this pattern
    pub use_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPattern {
    pub pattern: String,
    pub category: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub severity: PatternSeverity,
}

/// One occurrence of a banned pattern in generated code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternDetection {
    pub id: String,
    pub pattern_id: String,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub file_path: Option<String>,
    pub snippet: Option<String>,
    pub false_positive_count: u32,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDetection {
    pub pattern_id: String,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub file_path: Option<String>,
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternStats {
    pub total_patterns: usize,
    pub active_patterns: usize,
    pub total_detections: usize,
    pub false_positives: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditVerdict {
    Pass,
    Warn,
    Fail,
}

impl AuditVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditVerdict::Pass => "pass",
            AuditVerdict::Warn => "warn",
            AuditVerdict::Fail => "fail",
        }
    }

    pub fn from_score(total: f64) -> Self {
        if total >= AUDIT_PASS_SCORE {
            AuditVerdict::Pass
        } else if total >= AUDIT_WARN_SCORE {
            AuditVerdict::Warn
        } else {
            AuditVerdict::Fail
        }
    }
}

impl FromStr for AuditVerdict {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pass" => Ok(AuditVerdict::Pass),
            "warn" => Ok(AuditVerdict::Warn),
            "fail" => Ok(AuditVerdict::Fail),
            other => Err(StorageError::Validation(format!(
                "Unknown audit verdict '{}'",
                other
            ))),
        }
    }
}

/// Compliance audit of one session's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditScore {
    pub id: String,
    pub session_id: Option<String>,
    pub model: Option<String>,
    /// Dimension name to 0-100 score
    pub scores: BTreeMap<String, f64>,
    /// Mean of `scores`
    pub total_score: f64,
    pub verdict: AuditVerdict,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAudit {
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub scores: BTreeMap<String, f64>,
}

/// Audit aggregates for one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelAuditStats {
    pub model: String,
    pub audits: usize,
    pub average_score: f64,
    pub pass: usize,
    pub warn: usize,
    pub fail: usize,
}

/// Store for banned patterns, detections and audits
pub struct PatternStore {
    storage: Arc<Storage>,
}

impl PatternStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub fn add_pattern(&self, input: NewPattern) -> Result<BannedPattern> {
        if input.pattern.trim().is_empty() {
            return Err(StorageError::Validation("pattern must not be empty".to_string()));
        }
        let now = Utc::now();
        let pattern = BannedPattern {
            id: Uuid::new_v4().to_string(),
            pattern: input.pattern,
            category: input
                .category
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            description: input.description,
            severity: input.severity,
            active: true,
            use_count: 0,
            created_at: now,
            updated_at: now,
        };

        self.storage.write(|conn| {
            conn.execute(
                "INSERT INTO banned_patterns (
                    id, pattern, category, description, severity, active, use_count, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    pattern.id,
                    pattern.pattern,
                    pattern.category,
                    pattern.description,
                    pattern.severity.as_str(),
                    pattern.active,
                    pattern.use_count,
                    format_timestamp(&pattern.created_at),
                    format_timestamp(&pattern.updated_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(pattern)
    }

    pub fn get_pattern(&self, id: &str) -> Result<Option<BannedPattern>> {
        self.storage.read(|conn| get_pattern(conn, id))
    }

    /// Enable or disable a pattern
    pub fn set_active(&self, id: &str, active: bool) -> Result<BannedPattern> {
        self.storage.transaction(|tx| {
            let changed = tx.execute(
                "UPDATE banned_patterns SET active = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, active, format_timestamp(&Utc::now())],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(format!("pattern {}", id)));
            }
            get_pattern(tx, id)?.ok_or_else(|| StorageError::NotFound(format!("pattern {}", id)))
        })
    }

    /// Patterns by category, most used first
    pub fn list_patterns(&self, active_only: bool) -> Result<Vec<BannedPattern>> {
        self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM banned_patterns
                 WHERE ?1 = 0 OR active = 1
                 ORDER BY category, use_count DESC, created_at",
            )?;
            let rows = stmt.query_map(params![active_only], row_to_pattern)?;

            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
    }

    /// Record a detection and bump the pattern's use count.
    pub fn record_detection(&self, input: NewDetection) -> Result<PatternDetection> {
        let detection = PatternDetection {
            id: Uuid::new_v4().to_string(),
            pattern_id: input.pattern_id,
            session_id: input.session_id,
            model: input.model,
            file_path: input.file_path,
            snippet: input.snippet,
            false_positive_count: 0,
            detected_at: Utc::now(),
        };

        self.storage.transaction(|tx| {
            let pattern = get_pattern(tx, &detection.pattern_id)?
                .ok_or_else(|| StorageError::NotFound(format!("pattern {}", detection.pattern_id)))?;
            if !pattern.active {
                return Err(StorageError::Validation(format!(
                    "Pattern {} is inactive",
                    pattern.id
                )));
            }

            tx.execute(
                "INSERT INTO pattern_detections (
                    id, pattern_id, session_id, model, file_path, snippet, false_positive_count, detected_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
                params![
                    detection.id,
                    detection.pattern_id,
                    detection.session_id,
                    detection.model,
                    detection.file_path,
                    detection.snippet,
                    format_timestamp(&detection.detected_at),
                ],
            )?;
            tx.execute(
                "UPDATE banned_patterns SET use_count = use_count + 1, updated_at = ?2 WHERE id = ?1",
                params![pattern.id, format_timestamp(&detection.detected_at)],
            )?;
            Ok(detection)
        })
    }

    /// Detections, newest first
    pub fn list_detections(
        &self,
        pattern_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PatternDetection>> {
        self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM pattern_detections
                 WHERE ?1 IS NULL OR pattern_id = ?1
                 ORDER BY detected_at DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![pattern_id, to_sql_limit(limit)], row_to_detection)?;

            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
    }

    /// Flag a detection as a false positive
    pub fn mark_false_positive(&self, detection_id: &str) -> Result<()> {
        self.storage.write(|conn| {
            let changed = conn.execute(
                "UPDATE pattern_detections SET false_positive_count = false_positive_count + 1
                 WHERE id = ?1",
                params![detection_id],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(format!("detection {}", detection_id)));
            }
            Ok(())
        })
    }

    pub fn stats(&self) -> Result<PatternStats> {
        self.storage.read(|conn| {
            let (total, active): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(active), 0) FROM banned_patterns",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let (detections, false_positives): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(false_positive_count), 0) FROM pattern_detections",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(PatternStats {
                total_patterns: total as usize,
                active_patterns: active as usize,
                total_detections: detections as usize,
                false_positives: false_positives as usize,
            })
        })
    }

    /// Store an audit; the total is the mean of the dimension scores.
    pub fn save_audit(&self, input: NewAudit) -> Result<AuditScore> {
        if input.scores.is_empty() {
            return Err(StorageError::Validation("audit needs at least one score".to_string()));
        }
        if let Some((name, value)) = input
            .scores
            .iter()
            .find(|(_, v)| !(0.0..=100.0).contains(*v))
        {
            return Err(StorageError::Validation(format!(
                "score '{}' must be within 0-100, got {}",
                name, value
            )));
        }

        let total_score = input.scores.values().sum::<f64>() / input.scores.len() as f64;
        let audit = AuditScore {
            id: Uuid::new_v4().to_string(),
            session_id: input.session_id,
            model: input.model,
            verdict: AuditVerdict::from_score(total_score),
            total_score,
            scores: input.scores,
            created_at: Utc::now(),
        };

        self.storage.write(|conn| {
            conn.execute(
                "INSERT INTO audit_scores (id, session_id, model, scores, total_score, verdict, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    audit.id,
                    audit.session_id,
                    audit.model,
                    serde_json::to_string(&audit.scores)?,
                    audit.total_score,
                    audit.verdict.as_str(),
                    format_timestamp(&audit.created_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(audit)
    }

    /// Audits, newest first
    pub fn list_audits(&self, model: Option<&str>, limit: usize) -> Result<Vec<AuditScore>> {
        self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM audit_scores
                 WHERE ?1 IS NULL OR model = ?1
                 ORDER BY created_at DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![model, to_sql_limit(limit)], row_to_audit)?;

            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
    }

    /// Per-model audit aggregates, best average first
    pub fn model_stats(&self) -> Result<Vec<ModelAuditStats>> {
        self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT COALESCE(model, 'unknown') AS model_name,
                        COUNT(*),
                        AVG(total_score),
                        SUM(verdict = 'pass'),
                        SUM(verdict = 'warn'),
                        SUM(verdict = 'fail')
                 FROM audit_scores
                 GROUP BY model_name
                 ORDER BY AVG(total_score) DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ModelAuditStats {
                    model: row.get(0)?,
                    audits: row.get::<_, i64>(1)? as usize,
                    average_score: row.get(2)?,
                    pass: row.get::<_, i64>(3)? as usize,
                    warn: row.get::<_, i64>(4)? as usize,
                    fail: row.get::<_, i64>(5)? as usize,
                })
            })?;

            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
    }
}

fn get_pattern(conn: &Connection, id: &str) -> Result<Option<BannedPattern>> {
    Ok(conn
        .query_row(
            "SELECT * FROM banned_patterns WHERE id = ?1",
            params![id],
            row_to_pattern,
        )
        .optional()?)
}

fn row_to_pattern(row: &rusqlite::Row) -> rusqlite::Result<BannedPattern> {
    let severity: String = row.get("severity")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(BannedPattern {
        id: row.get("id")?,
        pattern: row.get("pattern")?,
        category: row.get("category")?,
        description: row.get("description")?,
        severity: parse_enum_column(&severity, "severity")?,
        active: row.get("active")?,
        use_count: row.get("use_count")?,
        created_at: parse_timestamp(&created_at, "created_at")?,
        updated_at: parse_timestamp(&updated_at, "updated_at")?,
    })
}

fn row_to_detection(row: &rusqlite::Row) -> rusqlite::Result<PatternDetection> {
    let detected_at: String = row.get("detected_at")?;

    Ok(PatternDetection {
        id: row.get("id")?,
        pattern_id: row.get("pattern_id")?,
        session_id: row.get("session_id")?,
        model: row.get("model")?,
        file_path: row.get("file_path")?,
        snippet: row.get("snippet")?,
        false_positive_count: row.get("false_positive_count")?,
        detected_at: parse_timestamp(&detected_at, "detected_at")?,
    })
}

fn row_to_audit(row: &rusqlite::Row) -> rusqlite::Result<AuditScore> {
    let scores: String = row.get("scores")?;
    let verdict: String = row.get("verdict")?;
    let created_at: String = row.get("created_at")?;

    Ok(AuditScore {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        model: row.get("model")?,
        scores: from_json_column(&scores, "scores")?,
        total_score: row.get("total_score")?,
        verdict: parse_enum_column(&verdict, "verdict")?,
        created_at: parse_timestamp(&created_at, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn create_test_store() -> (PatternStore, TempDir) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("test.db"))).unwrap());
        (PatternStore::new(storage), dir)
    }

    fn pattern(store: &PatternStore, text: &str) -> BannedPattern {
        store
            .add_pattern(NewPattern {
                pattern: text.into(),
                ..Default::default()
            })
            .unwrap()
    }

    fn audit(model: &str, scores: &[(&str, f64)]) -> NewAudit {
        NewAudit {
            session_id: None,
            model: Some(model.into()),
            scores: scores.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    #[test]
    fn test_add_pattern_defaults() {
        let (store, _dir) = create_test_store();
        let p = pattern(&store, "console.log");
        assert_eq!(p.category, "general");
        assert_eq!(p.severity, PatternSeverity::Warning);
        assert!(p.active);

        let loaded = store.get_pattern(&p.id).unwrap().unwrap();
        assert_eq!(loaded.pattern, "console.log");

        assert!(matches!(
            store.add_pattern(NewPattern::default()),
            Err(StorageError::Validation(_))
        ));
    }

    #[test]
    fn test_detection_bumps_use_count() {
        let (store, _dir) = create_test_store();
        let p = pattern(&store, "as any");
        for _ in 0..2 {
            store
                .record_detection(NewDetection {
                    pattern_id: p.id.clone(),
                    model: Some("model-a".into()),
                    ..Default::default()
                })
                .unwrap();
        }
        assert_eq!(store.get_pattern(&p.id).unwrap().unwrap().use_count, 2);
        assert_eq!(store.list_detections(Some(&p.id), 10).unwrap().len(), 2);

        let missing = store.record_detection(NewDetection {
            pattern_id: "nope".into(),
            ..Default::default()
        });
        assert!(matches!(missing, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_inactive_patterns() {
        let (store, _dir) = create_test_store();
        let keep = pattern(&store, "eval(");
        let off = pattern(&store, "var ");
        store.set_active(&off.id, false).unwrap();

        let active = store.list_patterns(true).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, keep.id);
        assert_eq!(store.list_patterns(false).unwrap().len(), 2);

        let rejected = store.record_detection(NewDetection {
            pattern_id: off.id.clone(),
            ..Default::default()
        });
        assert!(matches!(rejected, Err(StorageError::Validation(_))));
        assert!(matches!(store.set_active("nope", true), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_stats_and_false_positives() {
        let (store, _dir) = create_test_store();
        let p = pattern(&store, "TODO");
        pattern(&store, "FIXME");
        let d = store
            .record_detection(NewDetection {
                pattern_id: p.id.clone(),
                ..Default::default()
            })
            .unwrap();
        store.mark_false_positive(&d.id).unwrap();
        store.mark_false_positive(&d.id).unwrap();
        assert!(matches!(
            store.mark_false_positive("ghost"),
            Err(StorageError::NotFound(_))
        ));

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_patterns, 2);
        assert_eq!(stats.active_patterns, 2);
        assert_eq!(stats.total_detections, 1);
        assert_eq!(stats.false_positives, 2);
    }

    #[test]
    fn test_audit_total_and_verdict() {
        let (store, _dir) = create_test_store();
        let a = store
            .save_audit(audit("model-a", &[("naming", 90.0), ("tests", 70.0)]))
            .unwrap();
        assert_eq!(a.total_score, 80.0);
        assert_eq!(a.verdict, AuditVerdict::Pass);

        assert!(matches!(
            store.save_audit(audit("model-a", &[("naming", 120.0)])),
            Err(StorageError::Validation(_))
        ));
        assert!(matches!(
            store.save_audit(audit("model-a", &[])),
            Err(StorageError::Validation(_))
        ));

        let listed = store.list_audits(Some("model-a"), 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].scores["tests"], 70.0);
    }

    #[test]
    fn test_model_stats() {
        let (store, _dir) = create_test_store();
        store.save_audit(audit("model-a", &[("x", 90.0)])).unwrap();
        store.save_audit(audit("model-a", &[("x", 50.0)])).unwrap();
        store.save_audit(audit("model-b", &[("x", 65.0)])).unwrap();

        let stats = store.model_stats().unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].model, "model-a");
        assert_eq!(stats[0].audits, 2);
        assert_eq!(stats[0].average_score, 70.0);
        assert_eq!(stats[0].pass, 1);
        assert_eq!(stats[0].fail, 1);
        assert_eq!(stats[1].warn, 1);
    }

    #[test]
    fn test_verdict_thresholds() {
        assert_eq!(AuditVerdict::from_score(80.0), AuditVerdict::Pass);
        assert_eq!(AuditVerdict::from_score(79.9), AuditVerdict::Warn);
        assert_eq!(AuditVerdict::from_score(60.0), AuditVerdict::Warn);
        assert_eq!(AuditVerdict::from_score(59.9), AuditVerdict::Fail);
    }
}
