//! Permanent memory persistence

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    normalize_error, ConventionMemory, DecisionMemory, MemoryContent, MemoryKind, MemoryPatch,
    MistakeMemory, NewMemory, PermanentMemoryEntry,
};
use crate::evolution::{DecayReport, EvolutionTracker};
use crate::search::similarity;
use crate::storage::{
    format_timestamp, from_json_column, parse_enum_column, parse_timestamp, Result, Storage,
    StorageError,
};

/// Result of `save`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub entry: PermanentMemoryEntry,
    /// True when a mistake with the same error text already existed and was merged
    pub duplicate: bool,
}

/// Result of `delete`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub removed: PermanentMemoryEntry,
    /// Present when a convention was removed and the decay pass succeeded
    pub decay: Option<DecayReport>,
}

/// A stored mistake resembling a query error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarMistake {
    pub entry: PermanentMemoryEntry,
    pub score: f64,
}

/// Human-readable snapshot of all permanent memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryExport {
    pub generated_at: DateTime<Utc>,
    pub decisions: Vec<DecisionMemory>,
    pub mistakes: Vec<MistakeMemory>,
    pub conventions: Vec<ConventionMemory>,
}

impl MemoryExport {
    /// Render as markdown, one section per kind.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Project Memory");
        let _ = writeln!(out, "\n_Exported {}_", self.generated_at.format("%Y-%m-%d %H:%M UTC"));

        let _ = writeln!(out, "\n## Decisions\n");
        if self.decisions.is_empty() {
            let _ = writeln!(out, "_None recorded._");
        }
        for d in &self.decisions {
            let _ = writeln!(out, "- **{}**: {}", d.decision, d.reasoning);
            if !d.alternatives.is_empty() {
                let _ = writeln!(out, "  - Alternatives: {}", d.alternatives.join(", "));
            }
            if let Some(context) = &d.context {
                let _ = writeln!(out, "  - Context: {}", context);
            }
        }

        let _ = writeln!(out, "\n## Mistakes\n");
        if self.mistakes.is_empty() {
            let _ = writeln!(out, "_None recorded._");
        }
        for m in &self.mistakes {
            let _ = writeln!(out, "- **{}** (seen {}x)", m.error, m.occurrences);
            let _ = writeln!(out, "  - Root cause: {}", m.root_cause);
            let _ = writeln!(out, "  - Fix: {}", m.fix);
            let _ = writeln!(out, "  - Prevention: {}", m.prevention);
        }

        let _ = writeln!(out, "\n## Conventions\n");
        if self.conventions.is_empty() {
            let _ = writeln!(out, "_None recorded._");
        }
        for c in &self.conventions {
            let _ = writeln!(out, "- {}", c.convention);
            if let Some(example) = &c.example {
                let _ = writeln!(out, "  - Example: `{}`", example);
            }
            if let Some(rationale) = &c.rationale {
                let _ = writeln!(out, "  - Why: {}", rationale);
            }
        }

        out
    }
}

/// Store for decisions, mistakes and conventions
pub struct MemoryStore {
    storage: Arc<Storage>,
}

impl MemoryStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Record an entry.
    ///
    /// A mistake whose error text matches an existing one (case-insensitive)
    /// is merged: `occurrences` goes up, `lastSeenAt` is refreshed and
    /// `fix`/`prevention` are overwritten. Decisions and conventions always insert.
    pub fn save(&self, input: NewMemory) -> Result<SaveOutcome> {
        let now = Utc::now();

        self.storage.transaction(|tx| {
            let content = match input {
                NewMemory::Decision {
                    decision,
                    reasoning,
                    alternatives,
                    context,
                } => {
                    require_text("decision", &decision)?;
                    MemoryContent::Decision(DecisionMemory {
                        decision,
                        reasoning,
                        alternatives,
                        context,
                    })
                }
                NewMemory::Mistake {
                    error,
                    root_cause,
                    fix,
                    prevention,
                } => {
                    require_text("error", &error)?;

                    if let Some(mut entry) = find_mistake(tx, &normalize_error(&error))? {
                        if let MemoryContent::Mistake(m) = &mut entry.content {
                            m.occurrences += 1;
                            m.last_seen_at = now;
                            m.fix = fix;
                            m.prevention = prevention;
                        }
                        entry.updated_at = now;
                        write_entry(tx, &entry)?;
                        return Ok(SaveOutcome {
                            entry,
                            duplicate: true,
                        });
                    }

                    MemoryContent::Mistake(MistakeMemory {
                        error,
                        root_cause,
                        fix,
                        prevention,
                        occurrences: 1,
                        last_seen_at: now,
                    })
                }
                NewMemory::Convention {
                    convention,
                    example,
                    rationale,
                } => {
                    require_text("convention", &convention)?;
                    MemoryContent::Convention(ConventionMemory {
                        convention,
                        example,
                        rationale,
                    })
                }
            };

            let entry = PermanentMemoryEntry {
                id: Uuid::new_v4().to_string(),
                content,
                created_at: now,
                updated_at: now,
            };
            write_entry(tx, &entry)?;
            Ok(SaveOutcome {
                entry,
                duplicate: false,
            })
        })
    }

    /// Get an entry by id
    pub fn get(&self, id: &str) -> Result<Option<PermanentMemoryEntry>> {
        self.storage.read(|conn| get_entry(conn, id))
    }

    /// All entries, optionally of one kind, newest first
    pub fn list(&self, kind: Option<MemoryKind>) -> Result<Vec<PermanentMemoryEntry>> {
        self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM permanent_memory
                 WHERE ?1 IS NULL OR kind = ?1
                 ORDER BY created_at DESC, rowid DESC",
            )?;
            let rows = stmt.query_map(params![kind.map(|k| k.as_str())], row_to_memory)?;

            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
    }

    /// Merge the provided fields into an existing entry of the same kind.
    pub fn edit(&self, id: &str, patch: MemoryPatch) -> Result<PermanentMemoryEntry> {
        self.storage.transaction(|tx| {
            let mut entry =
                get_entry(tx, id)?.ok_or_else(|| StorageError::NotFound(format!("memory {}", id)))?;

            if entry.kind() != patch.kind() {
                return Err(StorageError::KindMismatch {
                    id: id.to_string(),
                    expected: patch.kind().to_string(),
                    actual: entry.kind().to_string(),
                });
            }

            patch.apply_to(&mut entry.content);
            require_text(entry.kind().as_str(), entry.content.title())?;

            if let MemoryContent::Mistake(m) = &entry.content {
                if let Some(other) = find_mistake(tx, &normalize_error(&m.error))? {
                    if other.id != entry.id {
                        return Err(StorageError::Validation(format!(
                            "Mistake {} already records this error text",
                            other.id
                        )));
                    }
                }
            }

            entry.updated_at = Utc::now();
            write_entry(tx, &entry)?;
            Ok(entry)
        })
    }

    /// Remove an entry. Removing a convention also decays overlapping
    /// evolution candidates; a failure there is logged, not returned.
    pub fn delete(&self, id: &str) -> Result<DeleteOutcome> {
        let removed = self.storage.transaction(|tx| {
            let entry =
                get_entry(tx, id)?.ok_or_else(|| StorageError::NotFound(format!("memory {}", id)))?;
            tx.execute("DELETE FROM permanent_memory WHERE id = ?1", params![id])?;
            Ok(entry)
        })?;

        let decay = match &removed.content {
            MemoryContent::Convention(c) => {
                match EvolutionTracker::new(Arc::clone(&self.storage))
                    .decay_for_deleted_text(&c.convention)
                {
                    Ok(report) => Some(report),
                    Err(e) => {
                        tracing::warn!("Confidence decay after deleting {} failed: {}", id, e);
                        None
                    }
                }
            }
            MemoryContent::Decision(_) | MemoryContent::Mistake(_) => None,
        };

        Ok(DeleteOutcome { removed, decay })
    }

    /// Flat snapshot of every entry, oldest first within each kind
    pub fn export(&self) -> Result<MemoryExport> {
        let mut entries = self.list(None)?;
        entries.reverse();

        let mut export = MemoryExport {
            generated_at: Utc::now(),
            decisions: Vec::new(),
            mistakes: Vec::new(),
            conventions: Vec::new(),
        };
        for entry in entries {
            match entry.content {
                MemoryContent::Decision(d) => export.decisions.push(d),
                MemoryContent::Mistake(m) => export.mistakes.push(m),
                MemoryContent::Convention(c) => export.conventions.push(c),
            }
        }
        Ok(export)
    }

    /// Stored mistakes resembling `error`, best first.
    pub fn find_similar_mistakes(
        &self,
        error: &str,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarMistake>> {
        let mistakes = self.list(Some(MemoryKind::Mistake))?;

        let documents: Vec<String> = mistakes
            .iter()
            .map(|entry| match &entry.content {
                MemoryContent::Mistake(m) => {
                    format!("{} {} {} {}", m.error, m.root_cause, m.fix, m.prevention)
                }
                _ => String::new(),
            })
            .collect();

        let matches = similarity::rank_documents(error, &documents, threshold);
        Ok(matches
            .into_iter()
            .take(limit)
            .map(|m| SimilarMistake {
                entry: mistakes[m.index].clone(),
                score: m.score,
            })
            .collect())
    }
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(StorageError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn get_entry(conn: &Connection, id: &str) -> Result<Option<PermanentMemoryEntry>> {
    Ok(conn
        .query_row(
            "SELECT * FROM permanent_memory WHERE id = ?1",
            params![id],
            row_to_memory,
        )
        .optional()?)
}

fn find_mistake(conn: &Connection, error_key: &str) -> Result<Option<PermanentMemoryEntry>> {
    Ok(conn
        .query_row(
            "SELECT * FROM permanent_memory WHERE kind = 'mistake' AND error_key = ?1",
            params![error_key],
            row_to_memory,
        )
        .optional()?)
}

/// Insert or update the row for `entry`; the FTS triggers follow.
fn write_entry(conn: &Connection, entry: &PermanentMemoryEntry) -> Result<()> {
    let mut reasoning = None;
    let mut alternatives = None;
    let mut context = None;
    let mut error_key = None;
    let mut root_cause = None;
    let mut fix = None;
    let mut prevention = None;
    let mut occurrences = None;
    let mut last_seen_at = None;
    let mut example = None;
    let mut rationale = None;

    match &entry.content {
        MemoryContent::Decision(d) => {
            reasoning = Some(d.reasoning.as_str());
            alternatives = Some(serde_json::to_string(&d.alternatives)?);
            context = d.context.as_deref();
        }
        MemoryContent::Mistake(m) => {
            error_key = Some(normalize_error(&m.error));
            root_cause = Some(m.root_cause.as_str());
            fix = Some(m.fix.as_str());
            prevention = Some(m.prevention.as_str());
            occurrences = Some(m.occurrences);
            last_seen_at = Some(format_timestamp(&m.last_seen_at));
        }
        MemoryContent::Convention(c) => {
            example = c.example.as_deref();
            rationale = c.rationale.as_deref();
        }
    }

    conn.execute(
        "INSERT INTO permanent_memory (
            id, kind, title, body,
            reasoning, alternatives, context,
            error_key, root_cause, fix, prevention, occurrences, last_seen_at,
            example, rationale,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            body = excluded.body,
            reasoning = excluded.reasoning,
            alternatives = excluded.alternatives,
            context = excluded.context,
            error_key = excluded.error_key,
            root_cause = excluded.root_cause,
            fix = excluded.fix,
            prevention = excluded.prevention,
            occurrences = excluded.occurrences,
            last_seen_at = excluded.last_seen_at,
            example = excluded.example,
            rationale = excluded.rationale,
            updated_at = excluded.updated_at",
        params![
            entry.id,
            entry.kind().as_str(),
            entry.content.title(),
            entry.content.body(),
            reasoning,
            alternatives,
            context,
            error_key,
            root_cause,
            fix,
            prevention,
            occurrences,
            last_seen_at,
            example,
            rationale,
            format_timestamp(&entry.created_at),
            format_timestamp(&entry.updated_at),
        ],
    )?;
    Ok(())
}

/// Convert a `permanent_memory` row to an entry
pub(crate) fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<PermanentMemoryEntry> {
    let kind: String = row.get("kind")?;
    let title: String = row.get("title")?;

    let content = match parse_enum_column::<MemoryKind>(&kind, "kind")? {
        MemoryKind::Decision => {
            let alternatives: Option<String> = row.get("alternatives")?;
            MemoryContent::Decision(DecisionMemory {
                decision: title,
                reasoning: row.get::<_, Option<String>>("reasoning")?.unwrap_or_default(),
                alternatives: match alternatives {
                    Some(raw) => from_json_column(&raw, "alternatives")?,
                    None => Vec::new(),
                },
                context: row.get("context")?,
            })
        }
        MemoryKind::Mistake => {
            let last_seen: Option<String> = row.get("last_seen_at")?;
            let last_seen_at = match last_seen {
                Some(raw) => parse_timestamp(&raw, "last_seen_at")?,
                None => parse_timestamp(&row.get::<_, String>("updated_at")?, "updated_at")?,
            };
            MemoryContent::Mistake(MistakeMemory {
                error: title,
                root_cause: row.get::<_, Option<String>>("root_cause")?.unwrap_or_default(),
                fix: row.get::<_, Option<String>>("fix")?.unwrap_or_default(),
                prevention: row.get::<_, Option<String>>("prevention")?.unwrap_or_default(),
                occurrences: row.get::<_, Option<u32>>("occurrences")?.unwrap_or(1),
                last_seen_at,
            })
        }
        MemoryKind::Convention => MemoryContent::Convention(ConventionMemory {
            convention: title,
            example: row.get("example")?,
            rationale: row.get("rationale")?,
        }),
    };

    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(PermanentMemoryEntry {
        id: row.get("id")?,
        content,
        created_at: parse_timestamp(&created_at, "created_at")?,
        updated_at: parse_timestamp(&updated_at, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::{CandidateType, NewCandidate};
    use tempfile::{tempdir, TempDir};

    fn create_test_store() -> (MemoryStore, Arc<Storage>, TempDir) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("test.db"))).unwrap());
        (MemoryStore::new(Arc::clone(&storage)), storage, dir)
    }

    fn mistake(error: &str, fix: &str) -> NewMemory {
        NewMemory::Mistake {
            error: error.into(),
            root_cause: "root".into(),
            fix: fix.into(),
            prevention: format!("prevent via {}", fix),
        }
    }

    #[test]
    fn test_mistake_dedup_is_case_insensitive() {
        let (store, _storage, _dir) = create_test_store();

        let first = store.save(mistake("Cannot find module './foo'", "fix one")).unwrap();
        assert!(!first.duplicate);

        let second = store.save(mistake("CANNOT FIND MODULE './FOO'", "fix two")).unwrap();
        assert!(second.duplicate);
        assert_eq!(second.entry.id, first.entry.id);

        let mistakes = store.list(Some(MemoryKind::Mistake)).unwrap();
        assert_eq!(mistakes.len(), 1);
        match &mistakes[0].content {
            MemoryContent::Mistake(m) => {
                assert_eq!(m.occurrences, 2);
                assert_eq!(m.fix, "fix two");
                assert_eq!(m.prevention, "prevent via fix two");
                assert_eq!(m.error, "Cannot find module './foo'");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decisions_never_dedup() {
        let (store, _storage, _dir) = create_test_store();
        for _ in 0..2 {
            store
                .save(NewMemory::Decision {
                    decision: "Use SQLite".into(),
                    reasoning: "embedded".into(),
                    alternatives: vec!["Postgres".into()],
                    context: None,
                })
                .unwrap();
        }
        assert_eq!(store.list(Some(MemoryKind::Decision)).unwrap().len(), 2);
    }

    #[test]
    fn test_empty_headline_rejected() {
        let (store, _storage, _dir) = create_test_store();
        let err = store
            .save(NewMemory::Convention {
                convention: "   ".into(),
                example: None,
                rationale: None,
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[test]
    fn test_edit_missing_and_wrong_kind() {
        let (store, _storage, _dir) = create_test_store();
        let saved = store.save(mistake("boom", "fix")).unwrap();

        let missing = store
            .edit(
                "nope",
                MemoryPatch::Mistake {
                    error: None,
                    root_cause: None,
                    fix: Some("x".into()),
                    prevention: None,
                },
            )
            .unwrap_err();
        assert!(matches!(missing, StorageError::NotFound(_)));

        let mismatch = store
            .edit(
                &saved.entry.id,
                MemoryPatch::Decision {
                    decision: Some("x".into()),
                    reasoning: None,
                    alternatives: None,
                    context: None,
                },
            )
            .unwrap_err();
        assert!(matches!(
            mismatch,
            StorageError::KindMismatch { ref expected, ref actual, .. }
                if expected == "decision" && actual == "mistake"
        ));
    }

    #[test]
    fn test_edit_merges_and_reindexes() {
        let (store, storage, _dir) = create_test_store();
        let saved = store
            .save(NewMemory::Convention {
                convention: "Prefer tabs".into(),
                example: None,
                rationale: None,
            })
            .unwrap();

        let edited = store
            .edit(
                &saved.entry.id,
                MemoryPatch::Convention {
                    convention: Some("Prefer spaces".into()),
                    example: Some("    fn main()".into()),
                    rationale: None,
                },
            )
            .unwrap();
        assert_eq!(edited.content.title(), "Prefer spaces");
        assert_eq!(
            format_timestamp(&edited.created_at),
            format_timestamp(&saved.entry.created_at)
        );

        let hits: i64 = storage
            .read(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM permanent_memory_fts WHERE permanent_memory_fts MATCH 'spaces'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(hits, 1);
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let (store, _storage, _dir) = create_test_store();
        assert!(matches!(store.delete("ghost"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_delete_convention_decays_overlapping_candidates() {
        let (store, storage, _dir) = create_test_store();
        let tracker = EvolutionTracker::new(Arc::clone(&storage));
        let candidate = tracker
            .propose(NewCandidate {
                candidate_type: CandidateType::NewConvention,
                title: "always use strict null checks".into(),
                description: None,
                confidence: 80.0,
                model_scope: None,
                evidence: Vec::new(),
            })
            .unwrap();

        let saved = store
            .save(NewMemory::Convention {
                convention: "always use strict null checks".into(),
                example: None,
                rationale: None,
            })
            .unwrap();

        let outcome = store.delete(&saved.entry.id).unwrap();
        let decay = outcome.decay.unwrap();
        assert_eq!(decay.decayed, vec![candidate.id.clone()]);

        let after = tracker.get(&candidate.id).unwrap().unwrap();
        assert_eq!(after.confidence, 40.0);
    }

    #[test]
    fn test_export_groups_by_kind() {
        let (store, _storage, _dir) = create_test_store();
        store.save(mistake("E1", "f1")).unwrap();
        store
            .save(NewMemory::Convention {
                convention: "Use camelCase in JSON".into(),
                example: Some("{\"createdAt\": 1}".into()),
                rationale: None,
            })
            .unwrap();

        let export = store.export().unwrap();
        assert_eq!(export.mistakes.len(), 1);
        assert_eq!(export.conventions.len(), 1);
        assert!(export.decisions.is_empty());

        let md = export.to_markdown();
        assert!(md.contains("## Mistakes"));
        assert!(md.contains("**E1** (seen 1x)"));
        assert!(md.contains("Use camelCase in JSON"));
    }

    #[test]
    fn test_find_similar_mistakes() {
        let (store, _storage, _dir) = create_test_store();
        store.save(mistake("null pointer in parser", "guard")).unwrap();
        store.save(mistake("css grid misaligned", "flex")).unwrap();

        let similar = store
            .find_similar_mistakes("parser null pointer crash", similarity::DEFAULT_THRESHOLD, 5)
            .unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].entry.content.title(), "null pointer in parser");
    }

    #[test]
    fn test_unknown_kind_is_a_read_error() {
        let (store, storage, _dir) = create_test_store();
        let saved = store.save(mistake("disk full", "free space")).unwrap().entry;

        storage
            .write(|conn| {
                conn.execute_batch("PRAGMA ignore_check_constraints = ON;")?;
                conn.execute(
                    "UPDATE permanent_memory SET kind = 'rumour' WHERE id = ?1",
                    params![saved.id],
                )?;
                conn.execute_batch("PRAGMA ignore_check_constraints = OFF;")?;
                Ok(())
            })
            .unwrap();

        assert!(matches!(store.get(&saved.id), Err(StorageError::Database(_))));
    }
}
