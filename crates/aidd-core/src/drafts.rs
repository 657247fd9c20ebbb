//! Drafts awaiting human approval

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::storage::{format_timestamp, parse_enum_column, parse_timestamp, Result, Storage, StorageError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftSource {
    #[default]
    Manual,
    Evolution,
}

impl DraftSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftSource::Manual => "manual",
            DraftSource::Evolution => "evolution",
        }
    }
}

impl FromStr for DraftSource {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "manual" => Ok(DraftSource::Manual),
            "evolution" => Ok(DraftSource::Evolution),
            other => Err(StorageError::Validation(format!("Unknown draft source '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Pending,
    Approved,
    Rejected,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Pending => "pending",
            DraftStatus::Approved => "approved",
            DraftStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DraftStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DraftStatus::Pending),
            "approved" => Ok(DraftStatus::Approved),
            "rejected" => Ok(DraftStatus::Rejected),
            other => Err(StorageError::Validation(format!("Unknown draft status '{}'", other))),
        }
    }
}

/// Proposed file content (a rule, skill or convention doc)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftEntry {
    pub id: String,
    pub category: String,
    pub title: String,
    pub filename: String,
    pub content: String,
    /// 0-100
    pub confidence: f64,
    pub source: DraftSource,
    pub status: DraftStatus,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDraft {
    pub category: String,
    pub title: String,
    pub filename: String,
    pub content: String,
    pub confidence: f64,
    #[serde(default)]
    pub source: DraftSource,
}

/// Partial update; only `Some` fields are applied
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftPatch {
    pub category: Option<String>,
    pub title: Option<String>,
    pub filename: Option<String>,
    pub content: Option<String>,
    pub confidence: Option<f64>,
}

pub struct DraftStore {
    storage: Arc<Storage>,
}

impl DraftStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub fn create(&self, input: NewDraft) -> Result<DraftEntry> {
        let now = Utc::now();
        let draft = DraftEntry {
            id: Uuid::new_v4().to_string(),
            category: input.category,
            title: input.title,
            filename: input.filename,
            content: input.content,
            confidence: input.confidence,
            source: input.source,
            status: DraftStatus::Pending,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        };
        validate(&draft)?;
        self.storage.write(|conn| write_draft(conn, &draft))?;
        Ok(draft)
    }

    pub fn get(&self, id: &str) -> Result<Option<DraftEntry>> {
        self.storage.read(|conn| get_draft(conn, id))
    }

    /// Edit a draft's content fields; its status is untouched.
    pub fn update(&self, id: &str, patch: DraftPatch) -> Result<DraftEntry> {
        self.storage.transaction(|tx| {
            let mut draft = require_draft(tx, id)?;
            if let Some(v) = patch.category {
                draft.category = v;
            }
            if let Some(v) = patch.title {
                draft.title = v;
            }
            if let Some(v) = patch.filename {
                draft.filename = v;
            }
            if let Some(v) = patch.content {
                draft.content = v;
            }
            if let Some(v) = patch.confidence {
                draft.confidence = v;
            }
            validate(&draft)?;
            draft.updated_at = Utc::now();
            write_draft(tx, &draft)?;
            Ok(draft)
        })
    }

    /// pending -> approved
    pub fn approve(&self, id: &str) -> Result<DraftEntry> {
        self.decide(id, DraftStatus::Approved, None)
    }

    /// pending -> rejected
    pub fn reject(&self, id: &str, reason: &str) -> Result<DraftEntry> {
        let reason = reason.trim();
        self.decide(
            id,
            DraftStatus::Rejected,
            (!reason.is_empty()).then(|| reason.to_string()),
        )
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.storage.write(|conn| {
            let removed = conn.execute("DELETE FROM drafts WHERE id = ?1", params![id])?;
            if removed == 0 {
                return Err(StorageError::NotFound(format!("draft {}", id)));
            }
            Ok(())
        })
    }

    /// Drafts, newest first
    pub fn list(&self, status: Option<DraftStatus>) -> Result<Vec<DraftEntry>> {
        self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM drafts
                 WHERE ?1 IS NULL OR status = ?1
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![status.map(|s| s.as_str())], row_to_draft)?;

            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
    }

    fn decide(&self, id: &str, status: DraftStatus, reason: Option<String>) -> Result<DraftEntry> {
        self.storage.transaction(|tx| {
            let mut draft = require_draft(tx, id)?;
            if draft.status != DraftStatus::Pending {
                return Err(StorageError::Validation(format!(
                    "Draft {} is already {}",
                    id, draft.status
                )));
            }
            draft.status = status;
            draft.rejection_reason = reason;
            draft.updated_at = Utc::now();
            write_draft(tx, &draft)?;
            tracing::debug!("Draft {} {}", id, status);
            Ok(draft)
        })
    }
}

fn validate(draft: &DraftEntry) -> Result<()> {
    if draft.title.trim().is_empty() {
        return Err(StorageError::Validation("draft title must not be empty".to_string()));
    }
    if draft.filename.trim().is_empty() {
        return Err(StorageError::Validation("draft filename must not be empty".to_string()));
    }
    if !(0.0..=100.0).contains(&draft.confidence) {
        return Err(StorageError::Validation(format!(
            "confidence must be within 0-100, got {}",
            draft.confidence
        )));
    }
    Ok(())
}

fn get_draft(conn: &Connection, id: &str) -> Result<Option<DraftEntry>> {
    Ok(conn
        .query_row("SELECT * FROM drafts WHERE id = ?1", params![id], row_to_draft)
        .optional()?)
}

fn require_draft(conn: &Connection, id: &str) -> Result<DraftEntry> {
    get_draft(conn, id)?.ok_or_else(|| StorageError::NotFound(format!("draft {}", id)))
}

fn write_draft(conn: &Connection, draft: &DraftEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO drafts (
            id, category, title, filename, content, confidence, source, status,
            rejection_reason, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(id) DO UPDATE SET
            category = excluded.category,
            title = excluded.title,
            filename = excluded.filename,
            content = excluded.content,
            confidence = excluded.confidence,
            status = excluded.status,
            rejection_reason = excluded.rejection_reason,
            updated_at = excluded.updated_at",
        params![
            draft.id,
            draft.category,
            draft.title,
            draft.filename,
            draft.content,
            draft.confidence,
            draft.source.as_str(),
            draft.status.as_str(),
            draft.rejection_reason,
            format_timestamp(&draft.created_at),
            format_timestamp(&draft.updated_at),
        ],
    )?;
    Ok(())
}

fn row_to_draft(row: &rusqlite::Row) -> rusqlite::Result<DraftEntry> {
    let source: String = row.get("source")?;
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(DraftEntry {
        id: row.get("id")?,
        category: row.get("category")?,
        title: row.get("title")?,
        filename: row.get("filename")?,
        content: row.get("content")?,
        confidence: row.get("confidence")?,
        source: parse_enum_column(&source, "source")?,
        status: parse_enum_column(&status, "status")?,
        rejection_reason: row.get("rejection_reason")?,
        created_at: parse_timestamp(&created_at, "created_at")?,
        updated_at: parse_timestamp(&updated_at, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn create_test_store() -> (DraftStore, TempDir) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("test.db"))).unwrap());
        (DraftStore::new(storage), dir)
    }

    fn draft(title: &str) -> NewDraft {
        NewDraft {
            category: "rules".into(),
            title: title.into(),
            filename: "no-default-exports.md".into(),
            content: "# Avoid default exports".into(),
            confidence: 72.0,
            source: DraftSource::Evolution,
        }
    }

    #[test]
    fn test_create_and_update() {
        let (store, _dir) = create_test_store();
        let d = store.create(draft("No default exports")).unwrap();
        assert_eq!(d.status, DraftStatus::Pending);

        let updated = store
            .update(
                &d.id,
                DraftPatch {
                    content: Some("# Prefer named exports".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.content, "# Prefer named exports");
        assert_eq!(updated.title, "No default exports");
        assert_eq!(updated.source, DraftSource::Evolution);

        assert!(matches!(
            store.update("nope", DraftPatch::default()),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_only_pending_can_be_decided() {
        let (store, _dir) = create_test_store();
        let a = store.create(draft("A")).unwrap();
        let b = store.create(draft("B")).unwrap();

        assert_eq!(store.approve(&a.id).unwrap().status, DraftStatus::Approved);
        assert!(matches!(store.reject(&a.id, "late"), Err(StorageError::Validation(_))));

        let rejected = store.reject(&b.id, "  duplicate of A ").unwrap();
        assert_eq!(rejected.rejection_reason.as_deref(), Some("duplicate of A"));
        assert!(matches!(store.approve(&b.id), Err(StorageError::Validation(_))));
    }

    #[test]
    fn test_list_by_status_and_delete() {
        let (store, _dir) = create_test_store();
        let a = store.create(draft("A")).unwrap();
        store.create(draft("B")).unwrap();
        store.approve(&a.id).unwrap();

        assert_eq!(store.list(None).unwrap().len(), 2);
        assert_eq!(store.list(Some(DraftStatus::Pending)).unwrap().len(), 1);

        store.delete(&a.id).unwrap();
        assert!(store.get(&a.id).unwrap().is_none());
        assert!(matches!(store.delete(&a.id), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_validation() {
        let (store, _dir) = create_test_store();
        let mut bad = draft("x");
        bad.confidence = 101.0;
        assert!(matches!(store.create(bad), Err(StorageError::Validation(_))));
        assert!(matches!(store.create(draft(" ")), Err(StorageError::Validation(_))));
    }
}
