//! Three-layer retrieval over observations and permanent memory

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{build_fts_query, normalize_rank};
use crate::memory::{row_to_memory, PermanentMemoryEntry};
use crate::session::{row_to_observation, SessionObservation};
use crate::storage::{parse_timestamp, Result, Storage};

/// Which table a hit came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchSource {
    Observation,
    Memory,
}

impl SearchSource {
    fn from_sql(value: &str) -> Self {
        if value == "memory" {
            SearchSource::Memory
        } else {
            SearchSource::Observation
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    #[default]
    Relevance,
    DateAsc,
    DateDesc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchOptions {
    pub limit: usize,
    pub offset: usize,
    pub order_by: OrderBy,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 20,
            offset: 0,
            order_by: OrderBy::Relevance,
        }
    }
}

/// Layer 1 result: enough to decide whether to fetch details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexHit {
    pub id: String,
    pub source: SearchSource,
    /// Observation type or memory kind
    pub kind: String,
    pub title: String,
    pub session_id: Option<String>,
    /// 0-1, higher is more relevant
    pub relevance: f64,
    pub created_at: DateTime<Utc>,
}

/// Layer 2 row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub id: String,
    pub source: SearchSource,
    pub kind: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// The anchor of a timeline; `entry` is `None` when the id was not found
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineAnchor {
    pub id: String,
    pub found: bool,
    pub entry: Option<TimelineEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    pub anchor: TimelineAnchor,
    /// Chronologically ascending, all strictly before the anchor
    pub before: Vec<TimelineEntry>,
    /// Chronologically ascending, all strictly after the anchor
    pub after: Vec<TimelineEntry>,
}

/// Layer 3 result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "record", rename_all = "snake_case")]
pub enum FullRecord {
    Observation(SessionObservation),
    Memory(PermanentMemoryEntry),
}

impl FullRecord {
    pub fn id(&self) -> &str {
        match self {
            FullRecord::Observation(o) => &o.id,
            FullRecord::Memory(m) => &m.id,
        }
    }
}

/// Read-only retrieval over both full-text indexes
pub struct SearchIndex {
    storage: Arc<Storage>,
}

const TIMELINE_UNION: &str = "SELECT id, 'observation' AS source, type AS kind, title, created_at
                              FROM observations
                              UNION ALL
                              SELECT id, 'memory' AS source, kind, title, created_at
                              FROM permanent_memory";

impl SearchIndex {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Layer 1: ranked hits from both indexes, ordered per `options.order_by`,
    /// with offset/limit applied after merging.
    pub fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<IndexHit>> {
        let Some(fts_query) = build_fts_query(query) else {
            return Ok(Vec::new());
        };
        if options.limit == 0 {
            return Ok(Vec::new());
        }
        let fetch = i64::try_from(options.offset.saturating_add(options.limit)).unwrap_or(i64::MAX);

        let order_sql = match options.order_by {
            OrderBy::Relevance => "score ASC",
            OrderBy::DateAsc => "created_at ASC",
            OrderBy::DateDesc => "created_at DESC",
        };

        let mut hits = self.storage.read(|conn| {
            let mut hits = query_hits(
                conn,
                &format!(
                    "SELECT o.id AS id, o.type AS kind, o.title AS title, o.session_id AS session_id,
                            o.created_at AS created_at, bm25(observations_fts) AS score,
                            'observation' AS source
                     FROM observations_fts
                     JOIN observations o ON o.rowid = observations_fts.rowid
                     WHERE observations_fts MATCH ?1
                     ORDER BY {} LIMIT ?2",
                    order_sql
                ),
                &fts_query,
                fetch,
            )?;
            hits.extend(query_hits(
                conn,
                &format!(
                    "SELECT m.id AS id, m.kind AS kind, m.title AS title, NULL AS session_id,
                            m.created_at AS created_at, bm25(permanent_memory_fts) AS score,
                            'memory' AS source
                     FROM permanent_memory_fts
                     JOIN permanent_memory m ON m.rowid = permanent_memory_fts.rowid
                     WHERE permanent_memory_fts MATCH ?1
                     ORDER BY {} LIMIT ?2",
                    order_sql
                ),
                &fts_query,
                fetch,
            )?);
            Ok(hits)
        })?;

        match options.order_by {
            OrderBy::Relevance => hits.sort_by(|a, b| {
                b.relevance
                    .partial_cmp(&a.relevance)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.created_at.cmp(&a.created_at))
            }),
            OrderBy::DateAsc => hits.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
            OrderBy::DateDesc => hits.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        }

        Ok(hits
            .into_iter()
            .skip(options.offset)
            .take(options.limit)
            .collect())
    }

    /// Layer 2: up to `depth` entries on each side of the anchor.
    ///
    /// A missing anchor yields `found: false` and empty lists.
    pub fn get_timeline(&self, anchor_id: &str, depth: usize) -> Result<Timeline> {
        let depth = i64::try_from(depth).unwrap_or(i64::MAX);

        self.storage.read(|conn| {
            let anchor: Option<TimelineEntry> = conn
                .query_row(
                    &format!("SELECT * FROM ({}) WHERE id = ?1 LIMIT 1", TIMELINE_UNION),
                    params![anchor_id],
                    row_to_timeline_entry,
                )
                .optional()?;

            let Some(anchor) = anchor else {
                return Ok(Timeline {
                    anchor: TimelineAnchor {
                        id: anchor_id.to_string(),
                        found: false,
                        entry: None,
                    },
                    before: Vec::new(),
                    after: Vec::new(),
                });
            };

            let at = crate::storage::format_timestamp(&anchor.created_at);

            let mut before = timeline_rows(
                conn,
                &format!(
                    "SELECT * FROM ({}) WHERE created_at < ?1 ORDER BY created_at DESC LIMIT ?2",
                    TIMELINE_UNION
                ),
                &at,
                depth,
            )?;
            before.reverse();

            let after = timeline_rows(
                conn,
                &format!(
                    "SELECT * FROM ({}) WHERE created_at > ?1 ORDER BY created_at ASC LIMIT ?2",
                    TIMELINE_UNION
                ),
                &at,
                depth,
            )?;

            Ok(Timeline {
                anchor: TimelineAnchor {
                    id: anchor_id.to_string(),
                    found: true,
                    entry: Some(anchor),
                },
                before,
                after,
            })
        })
    }

    /// Layer 3: full records for the ids that exist, in request order.
    /// Observations are checked first, then permanent memory; misses are skipped.
    pub fn get_by_ids(&self, ids: &[String]) -> Result<Vec<FullRecord>> {
        self.storage.read(|conn| {
            let mut records = Vec::with_capacity(ids.len());
            for id in ids {
                let observation = conn
                    .query_row(
                        "SELECT * FROM observations WHERE id = ?1",
                        params![id],
                        row_to_observation,
                    )
                    .optional()?;
                if let Some(observation) = observation {
                    records.push(FullRecord::Observation(observation));
                    continue;
                }

                let memory = conn
                    .query_row(
                        "SELECT * FROM permanent_memory WHERE id = ?1",
                        params![id],
                        row_to_memory,
                    )
                    .optional()?;
                if let Some(memory) = memory {
                    records.push(FullRecord::Memory(memory));
                }
            }
            Ok(records)
        })
    }
}

fn query_hits(conn: &Connection, sql: &str, fts_query: &str, limit: i64) -> Result<Vec<IndexHit>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![fts_query, limit], |row| {
        let source: String = row.get("source")?;
        let created_at: String = row.get("created_at")?;
        let score: f64 = row.get("score")?;
        Ok(IndexHit {
            id: row.get("id")?,
            source: SearchSource::from_sql(&source),
            kind: row.get("kind")?,
            title: row.get("title")?,
            session_id: row.get("session_id")?,
            relevance: normalize_rank(score),
            created_at: parse_timestamp(&created_at, "created_at")?,
        })
    })?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

fn timeline_rows(conn: &Connection, sql: &str, at: &str, limit: i64) -> Result<Vec<TimelineEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![at, limit], row_to_timeline_entry)?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

fn row_to_timeline_entry(row: &rusqlite::Row) -> rusqlite::Result<TimelineEntry> {
    let source: String = row.get("source")?;
    let created_at: String = row.get("created_at")?;
    Ok(TimelineEntry {
        id: row.get("id")?,
        source: SearchSource::from_sql(&source),
        kind: row.get("kind")?,
        title: row.get("title")?,
        created_at: parse_timestamp(&created_at, "created_at")?,
    })
}
