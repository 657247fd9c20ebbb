//! Feature artifacts
//!
//! Plans, designs, research notes and similar documents produced while a
//! feature moves through its lifecycle. Archiving marks an artifact done.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::storage::{
    format_timestamp, parse_enum_column, parse_timestamp, to_sql_limit, Result, Storage,
    StorageError,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    #[default]
    Active,
    Done,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Active => "active",
            ArtifactStatus::Done => "done",
        }
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(ArtifactStatus::Active),
            "done" => Ok(ArtifactStatus::Done),
            other => Err(StorageError::Validation(format!(
                "Unknown artifact status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    /// Free-form kind such as `plan`, `design` or `research`
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub feature: String,
    pub status: ArtifactStatus,
    pub title: String,
    pub description: String,
    pub content: String,
    pub session_id: Option<String>,
    /// Calendar day the artifact belongs to
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewArtifact {
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub feature: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content: String,
    pub session_id: Option<String>,
    /// Defaults to today (UTC)
    pub date: Option<NaiveDate>,
}

/// Partial update; only `Some` fields are applied
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactPatch {
    #[serde(rename = "type")]
    pub artifact_type: Option<String>,
    pub feature: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub status: Option<ArtifactStatus>,
}

/// Filters for `ArtifactStore::list`; newest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactFilter {
    #[serde(rename = "type")]
    pub artifact_type: Option<String>,
    pub status: Option<ArtifactStatus>,
    pub feature: Option<String>,
    pub session_id: Option<String>,
    pub limit: usize,
}

impl Default for ArtifactFilter {
    fn default() -> Self {
        Self {
            artifact_type: None,
            status: None,
            feature: None,
            session_id: None,
            limit: 50,
        }
    }
}

pub struct ArtifactStore {
    storage: Arc<Storage>,
}

impl ArtifactStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub fn create(&self, input: NewArtifact) -> Result<Artifact> {
        let now = Utc::now();
        let artifact = Artifact {
            id: Uuid::new_v4().to_string(),
            artifact_type: input.artifact_type,
            feature: input.feature,
            status: ArtifactStatus::Active,
            title: input.title,
            description: input.description,
            content: input.content,
            session_id: input.session_id,
            date: input.date.unwrap_or_else(|| now.date_naive()),
            created_at: now,
            updated_at: now,
        };
        validate(&artifact)?;
        self.storage.write(|conn| write_artifact(conn, &artifact))?;
        Ok(artifact)
    }

    pub fn get(&self, id: &str) -> Result<Option<Artifact>> {
        self.storage.read(|conn| get_artifact(conn, id))
    }

    pub fn update(&self, id: &str, patch: ArtifactPatch) -> Result<Artifact> {
        self.storage.transaction(|tx| {
            let mut artifact = require_artifact(tx, id)?;
            if let Some(v) = patch.artifact_type {
                artifact.artifact_type = v;
            }
            if let Some(v) = patch.feature {
                artifact.feature = v;
            }
            if let Some(v) = patch.title {
                artifact.title = v;
            }
            if let Some(v) = patch.description {
                artifact.description = v;
            }
            if let Some(v) = patch.content {
                artifact.content = v;
            }
            if let Some(v) = patch.status {
                artifact.status = v;
            }
            validate(&artifact)?;
            artifact.updated_at = Utc::now();
            write_artifact(tx, &artifact)?;
            Ok(artifact)
        })
    }

    /// Mark an artifact done
    pub fn archive(&self, id: &str) -> Result<Artifact> {
        self.update(
            id,
            ArtifactPatch {
                status: Some(ArtifactStatus::Done),
                ..Default::default()
            },
        )
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.storage.write(|conn| {
            let removed = conn.execute("DELETE FROM artifacts WHERE id = ?1", params![id])?;
            if removed == 0 {
                return Err(StorageError::NotFound(format!("artifact {}", id)));
            }
            Ok(())
        })
    }

    pub fn list(&self, filter: &ArtifactFilter) -> Result<Vec<Artifact>> {
        self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM artifacts
                 WHERE (?1 IS NULL OR type = ?1)
                   AND (?2 IS NULL OR status = ?2)
                   AND (?3 IS NULL OR feature = ?3)
                   AND (?4 IS NULL OR session_id = ?4)
                 ORDER BY date DESC, created_at DESC
                 LIMIT ?5",
            )?;
            let rows = stmt.query_map(
                params![
                    filter.artifact_type,
                    filter.status.map(|s| s.as_str()),
                    filter.feature,
                    filter.session_id,
                    to_sql_limit(filter.limit),
                ],
                row_to_artifact,
            )?;

            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
    }
}

fn validate(artifact: &Artifact) -> Result<()> {
    for (field, value) in [
        ("type", &artifact.artifact_type),
        ("feature", &artifact.feature),
        ("title", &artifact.title),
    ] {
        if value.trim().is_empty() {
            return Err(StorageError::Validation(format!("artifact {} must not be empty", field)));
        }
    }
    Ok(())
}

fn get_artifact(conn: &Connection, id: &str) -> Result<Option<Artifact>> {
    Ok(conn
        .query_row("SELECT * FROM artifacts WHERE id = ?1", params![id], row_to_artifact)
        .optional()?)
}

fn require_artifact(conn: &Connection, id: &str) -> Result<Artifact> {
    get_artifact(conn, id)?.ok_or_else(|| StorageError::NotFound(format!("artifact {}", id)))
}

fn write_artifact(conn: &Connection, artifact: &Artifact) -> Result<()> {
    conn.execute(
        "INSERT INTO artifacts (
            id, type, feature, status, title, description, content, session_id,
            date, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(id) DO UPDATE SET
            type = excluded.type,
            feature = excluded.feature,
            status = excluded.status,
            title = excluded.title,
            description = excluded.description,
            content = excluded.content,
            session_id = excluded.session_id,
            updated_at = excluded.updated_at",
        params![
            artifact.id,
            artifact.artifact_type,
            artifact.feature,
            artifact.status.as_str(),
            artifact.title,
            artifact.description,
            artifact.content,
            artifact.session_id,
            artifact.date.format("%Y-%m-%d").to_string(),
            format_timestamp(&artifact.created_at),
            format_timestamp(&artifact.updated_at),
        ],
    )?;
    Ok(())
}

fn row_to_artifact(row: &rusqlite::Row) -> rusqlite::Result<Artifact> {
    let status: String = row.get("status")?;
    let date: String = row.get("date")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Invalid artifact date '{}': {}", date, e),
            )),
        )
    })?;

    Ok(Artifact {
        id: row.get("id")?,
        artifact_type: row.get("type")?,
        feature: row.get("feature")?,
        status: parse_enum_column(&status, "status")?,
        title: row.get("title")?,
        description: row.get("description")?,
        content: row.get("content")?,
        session_id: row.get("session_id")?,
        date,
        created_at: parse_timestamp(&created_at, "created_at")?,
        updated_at: parse_timestamp(&updated_at, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn create_test_store() -> (ArtifactStore, TempDir) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::new(Some(dir.path().join("test.db"))).unwrap());
        (ArtifactStore::new(storage), dir)
    }

    fn artifact(kind: &str, feature: &str, day: u32) -> NewArtifact {
        NewArtifact {
            artifact_type: kind.into(),
            feature: feature.into(),
            title: format!("{} for {}", kind, feature),
            date: NaiveDate::from_ymd_opt(2026, 3, day),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_defaults_and_get() {
        let (store, _dir) = create_test_store();
        let a = store
            .create(NewArtifact {
                artifact_type: "plan".into(),
                feature: "auth".into(),
                title: "Auth plan".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(a.status, ArtifactStatus::Active);
        assert_eq!(a.date, a.created_at.date_naive());

        let loaded = store.get(&a.id).unwrap().unwrap();
        assert_eq!(loaded.title, "Auth plan");
        assert_eq!(loaded.date, a.date);
    }

    #[test]
    fn test_archive_marks_done() {
        let (store, _dir) = create_test_store();
        let a = store.create(artifact("design", "search", 1)).unwrap();
        let archived = store.archive(&a.id).unwrap();
        assert_eq!(archived.status, ArtifactStatus::Done);
        assert!(matches!(store.archive("ghost"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_list_filters_newest_first() {
        let (store, _dir) = create_test_store();
        store.create(artifact("plan", "auth", 1)).unwrap();
        let later = store.create(artifact("plan", "auth", 5)).unwrap();
        store.create(artifact("research", "auth", 3)).unwrap();
        store.create(artifact("plan", "billing", 2)).unwrap();

        let plans = store
            .list(&ArtifactFilter {
                artifact_type: Some("plan".into()),
                feature: Some("auth".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].id, later.id);

        store.archive(&later.id).unwrap();
        let active = store
            .list(&ArtifactFilter {
                status: Some(ArtifactStatus::Active),
                limit: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|a| a.status == ArtifactStatus::Active));
    }

    #[test]
    fn test_update_validation_and_delete() {
        let (store, _dir) = create_test_store();
        let a = store.create(artifact("plan", "auth", 1)).unwrap();
        let blank = store.update(
            &a.id,
            ArtifactPatch {
                title: Some("".into()),
                ..Default::default()
            },
        );
        assert!(matches!(blank, Err(StorageError::Validation(_))));

        store.delete(&a.id).unwrap();
        assert!(matches!(store.delete(&a.id), Err(StorageError::NotFound(_))));
    }
}
