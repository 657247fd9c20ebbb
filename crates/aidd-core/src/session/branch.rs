//! Branch Context
//!
//! Accumulated state per source-control branch. A context is created lazily
//! on first save or promote and, once merged, lives on only in the archive.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::store::row_to_session;
use crate::storage::{
    format_timestamp, from_json_column, parse_optional_timestamp, parse_timestamp, Result,
    Storage, StorageError,
};

/// Accumulated context of one branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchContext {
    pub branch: String,
    pub completed_tasks: Vec<String>,
    pub pending_tasks: Vec<String>,
    pub decisions: Vec<String>,
    pub errors_encountered: Vec<String>,
    /// Deduplicated, in first-seen order
    pub files_modified: Vec<String>,
    pub sessions_count: u32,
    pub total_duration_ms: i64,
    /// `None` until the context is first persisted
    pub updated_at: Option<DateTime<Utc>>,
}

impl BranchContext {
    /// Valid context with nothing accumulated yet
    pub fn empty(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            completed_tasks: Vec::new(),
            pending_tasks: Vec::new(),
            decisions: Vec::new(),
            errors_encountered: Vec::new(),
            files_modified: Vec::new(),
            sessions_count: 0,
            total_duration_ms: 0,
            updated_at: None,
        }
    }

    fn add_files<'a>(&mut self, files: impl IntoIterator<Item = &'a String>) {
        for file in files {
            if !self.files_modified.contains(file) {
                self.files_modified.push(file.clone());
            }
        }
    }
}

/// Fields to merge into a branch context
///
/// List fields are appended; `pending_tasks`, when given, replaces the list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BranchUpdate {
    pub completed_tasks: Vec<String>,
    pub pending_tasks: Option<Vec<String>>,
    pub decisions: Vec<String>,
    pub errors_encountered: Vec<String>,
    pub files_modified: Vec<String>,
}

/// A merged branch, kept for reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedBranch {
    /// `<branch>-<timestamp>`, unique
    pub archive_name: String,
    pub branch: String,
    pub archived_at: DateTime<Utc>,
    pub context: BranchContext,
}

/// Store for branch contexts
pub struct BranchStore {
    storage: Arc<Storage>,
}

impl BranchStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// The branch's context, or an empty one if nothing was recorded yet
    pub fn get(&self, branch: &str) -> Result<BranchContext> {
        self.storage
            .read(|conn| Ok(load(conn, branch)?.unwrap_or_else(|| BranchContext::empty(branch))))
    }

    /// Merge `update` into the branch's context
    pub fn save(&self, branch: &str, update: BranchUpdate) -> Result<BranchContext> {
        require_branch(branch)?;
        self.storage.transaction(|tx| {
            let mut context = load(tx, branch)?.unwrap_or_else(|| BranchContext::empty(branch));

            context.completed_tasks.extend(update.completed_tasks);
            if let Some(pending) = update.pending_tasks {
                context.pending_tasks = pending;
            }
            context.decisions.extend(update.decisions);
            context.errors_encountered.extend(update.errors_encountered);
            context.add_files(&update.files_modified);

            context.updated_at = Some(Utc::now());
            store(tx, &context)?;
            Ok(context)
        })
    }

    /// Fold a completed session into the branch context
    pub fn promote(&self, session_id: &str, branch: &str) -> Result<BranchContext> {
        require_branch(branch)?;
        self.storage.transaction(|tx| {
            let session = tx
                .query_row(
                    "SELECT * FROM sessions WHERE id = ?1",
                    params![session_id],
                    row_to_session,
                )
                .optional()?
                .ok_or_else(|| StorageError::NotFound(format!("session {}", session_id)))?;

            if session.ended_at.is_none() {
                return Err(StorageError::Validation(format!(
                    "Session {} has not ended and cannot be promoted",
                    session_id
                )));
            }

            let mut context = load(tx, branch)?.unwrap_or_else(|| BranchContext::empty(branch));
            context.decisions.extend(session.decisions.iter().cloned());
            context
                .errors_encountered
                .extend(session.errors_resolved.iter().cloned());
            context.add_files(&session.files_modified);
            context.sessions_count += 1;
            context.total_duration_ms += session.duration_ms();

            context.updated_at = Some(Utc::now());
            store(tx, &context)?;
            Ok(context)
        })
    }

    /// Move the branch into the archive. One-way; the active context is gone afterwards.
    pub fn merge(&self, branch: &str) -> Result<ArchivedBranch> {
        self.storage.transaction(|tx| {
            let context =
                load(tx, branch)?.ok_or_else(|| StorageError::NotFound(format!("branch {}", branch)))?;

            let archived_at = Utc::now();
            let base = format!("{}-{}", branch, archived_at.format("%Y%m%dT%H%M%S%6fZ"));
            let mut archive_name = base.clone();
            let mut suffix = 1;
            while archive_exists(tx, &archive_name)? {
                archive_name = format!("{}-{}", base, suffix);
                suffix += 1;
            }

            tx.execute(
                "INSERT INTO branch_archive (archive_name, branch, snapshot, archived_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    archive_name,
                    branch,
                    serde_json::to_string(&context)?,
                    format_timestamp(&archived_at),
                ],
            )?;
            tx.execute("DELETE FROM branches WHERE name = ?1", params![branch])?;

            tracing::info!("Archived branch {} as {}", branch, archive_name);
            Ok(ArchivedBranch {
                archive_name,
                branch: branch.to_string(),
                archived_at,
                context,
            })
        })
    }

    /// Active (unmerged) branch contexts, most recently updated first
    pub fn list(&self) -> Result<Vec<BranchContext>> {
        self.storage.read(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM branches ORDER BY updated_at DESC")?;
            let rows = stmt.query_map([], row_to_branch)?;

            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
    }

    /// Archived branches, optionally for one branch name, newest first
    pub fn list_archived(&self, branch: Option<&str>) -> Result<Vec<ArchivedBranch>> {
        self.storage.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT archive_name, branch, snapshot, archived_at FROM branch_archive
                 WHERE ?1 IS NULL OR branch = ?1
                 ORDER BY archived_at DESC",
            )?;
            let rows = stmt.query_map(params![branch], |row| {
                let snapshot: String = row.get("snapshot")?;
                let archived_at: String = row.get("archived_at")?;
                Ok(ArchivedBranch {
                    archive_name: row.get("archive_name")?,
                    branch: row.get("branch")?,
                    archived_at: parse_timestamp(&archived_at, "archived_at")?,
                    context: from_json_column(&snapshot, "snapshot")?,
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

fn require_branch(branch: &str) -> Result<()> {
    if branch.trim().is_empty() {
        return Err(StorageError::Validation("branch must not be empty".to_string()));
    }
    Ok(())
}

fn archive_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM branch_archive WHERE archive_name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn load(conn: &Connection, branch: &str) -> Result<Option<BranchContext>> {
    Ok(conn
        .query_row(
            "SELECT * FROM branches WHERE name = ?1",
            params![branch],
            row_to_branch,
        )
        .optional()?)
}

fn store(conn: &Connection, context: &BranchContext) -> Result<()> {
    conn.execute(
        "INSERT INTO branches (
            name, completed_tasks, pending_tasks, decisions, errors_encountered,
            files_modified, sessions_count, total_duration_ms, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(name) DO UPDATE SET
            completed_tasks = excluded.completed_tasks,
            pending_tasks = excluded.pending_tasks,
            decisions = excluded.decisions,
            errors_encountered = excluded.errors_encountered,
            files_modified = excluded.files_modified,
            sessions_count = excluded.sessions_count,
            total_duration_ms = excluded.total_duration_ms,
            updated_at = excluded.updated_at",
        params![
            context.branch,
            serde_json::to_string(&context.completed_tasks)?,
            serde_json::to_string(&context.pending_tasks)?,
            serde_json::to_string(&context.decisions)?,
            serde_json::to_string(&context.errors_encountered)?,
            serde_json::to_string(&context.files_modified)?,
            context.sessions_count,
            context.total_duration_ms,
            format_timestamp(&context.updated_at.unwrap_or_else(Utc::now)),
        ],
    )?;
    Ok(())
}

fn row_to_branch(row: &rusqlite::Row) -> rusqlite::Result<BranchContext> {
    let json_list = |column: &str| -> rusqlite::Result<Vec<String>> {
        let raw: String = row.get(column)?;
        from_json_column(&raw, column)
    };

    Ok(BranchContext {
        branch: row.get("name")?,
        completed_tasks: json_list("completed_tasks")?,
        pending_tasks: json_list("pending_tasks")?,
        decisions: json_list("decisions")?,
        errors_encountered: json_list("errors_encountered")?,
        files_modified: json_list("files_modified")?,
        sessions_count: row.get("sessions_count")?,
        total_duration_ms: row.get("total_duration_ms")?,
        updated_at: parse_optional_timestamp(row.get("updated_at")?, "updated_at")?,
    })
}
