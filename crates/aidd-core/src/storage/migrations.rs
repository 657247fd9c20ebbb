//! Database Migrations
//!
//! Schema migration definitions for the storage layer, plus the bookkeeping
//! that lives in the `meta` key/value table (`schema_version`, `schema_hash`).

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Sessions, observations and permanent memory with FTS5",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Branch contexts, branch archive, lifecycle sessions",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Evolution candidates, action log, snapshots",
        up: MIGRATION_V3_UP,
    },
    Migration {
        version: 4,
        description: "Pattern analytics, audit scores, drafts, artifacts",
        up: MIGRATION_V4_UP,
    },
];

/// Highest schema version this binary knows how to run against.
pub const LATEST_VERSION: u32 = 4;

/// Tables the current schema requires after migration.
pub const REQUIRED_TABLES: &[&str] = &[
    "meta",
    "sessions",
    "observations",
    "observations_fts",
    "permanent_memory",
    "permanent_memory_fts",
    "branches",
    "branch_archive",
    "lifecycle_sessions",
    "evolution_candidates",
    "evolution_log",
    "evolution_snapshots",
    "banned_patterns",
    "pattern_detections",
    "audit_scores",
    "drafts",
    "artifacts",
];

/// Indexes the current schema requires after migration.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_sessions_branch",
    "idx_sessions_status",
    "idx_sessions_started",
    "idx_observations_session",
    "idx_observations_created",
    "idx_memory_kind",
    "idx_memory_created",
    "idx_memory_mistake_key",
    "idx_branch_archive_branch",
    "idx_lifecycle_feature",
    "idx_lifecycle_status",
    "idx_evolution_type",
    "idx_evolution_status",
    "idx_evolution_confidence",
    "idx_evolution_log_candidate",
    "idx_evolution_snapshots_candidate",
    "idx_detections_pattern",
    "idx_detections_detected",
    "idx_audit_model",
    "idx_drafts_status",
    "idx_artifacts_type",
    "idx_artifacts_status",
    "idx_artifacts_feature",
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

const META_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// V1: Sessions, observations, permanent memory
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    parent_session_id TEXT,
    memory_session_id TEXT,
    branch TEXT NOT NULL DEFAULT 'main',
    started_at TEXT NOT NULL,
    ended_at TEXT,
    status TEXT NOT NULL DEFAULT 'active',  -- derived: 'active' | 'completed'
    ai_model TEXT,
    decisions TEXT NOT NULL DEFAULT '[]',
    errors_resolved TEXT NOT NULL DEFAULT '[]',
    files_modified TEXT NOT NULL DEFAULT '[]',
    tasks_completed TEXT NOT NULL DEFAULT '[]',
    tasks_pending TEXT NOT NULL DEFAULT '[]',

    -- Outcome (all NULL when no outcome was recorded)
    tests_passing INTEGER,
    revert_count INTEGER,
    compliance_score REAL,

    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_branch ON sessions(branch);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_started ON sessions(started_at);

CREATE TABLE IF NOT EXISTS observations (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    type TEXT NOT NULL,
    title TEXT NOT NULL,
    narrative TEXT NOT NULL DEFAULT '',
    facts TEXT NOT NULL DEFAULT '[]',
    concepts TEXT NOT NULL DEFAULT '[]',
    files_read TEXT NOT NULL DEFAULT '[]',
    files_modified TEXT NOT NULL DEFAULT '[]',
    discovery_tokens INTEGER,
    created_at TEXT NOT NULL,
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_observations_session ON observations(session_id);
CREATE INDEX IF NOT EXISTS idx_observations_created ON observations(created_at);

CREATE VIRTUAL TABLE IF NOT EXISTS observations_fts USING fts5(
    title, narrative, facts, concepts,
    content='observations',
    content_rowid='rowid',
    tokenize='porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS observations_ai AFTER INSERT ON observations BEGIN
    INSERT INTO observations_fts(rowid, title, narrative, facts, concepts)
    VALUES (NEW.rowid, NEW.title, NEW.narrative, NEW.facts, NEW.concepts);
END;

CREATE TRIGGER IF NOT EXISTS observations_ad AFTER DELETE ON observations BEGIN
    INSERT INTO observations_fts(observations_fts, rowid, title, narrative, facts, concepts)
    VALUES ('delete', OLD.rowid, OLD.title, OLD.narrative, OLD.facts, OLD.concepts);
END;

CREATE TRIGGER IF NOT EXISTS observations_au AFTER UPDATE ON observations BEGIN
    INSERT INTO observations_fts(observations_fts, rowid, title, narrative, facts, concepts)
    VALUES ('delete', OLD.rowid, OLD.title, OLD.narrative, OLD.facts, OLD.concepts);
    INSERT INTO observations_fts(rowid, title, narrative, facts, concepts)
    VALUES (NEW.rowid, NEW.title, NEW.narrative, NEW.facts, NEW.concepts);
END;

-- Permanent memory: one row per decision / mistake / convention.
-- Kind-specific columns are NULL for the other kinds.
CREATE TABLE IF NOT EXISTS permanent_memory (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL CHECK (kind IN ('decision', 'mistake', 'convention')),
    title TEXT NOT NULL,
    body TEXT NOT NULL DEFAULT '',

    -- decision
    reasoning TEXT,
    alternatives TEXT,
    context TEXT,

    -- mistake
    error_key TEXT,
    root_cause TEXT,
    fix TEXT,
    prevention TEXT,
    occurrences INTEGER,
    last_seen_at TEXT,

    -- convention
    example TEXT,
    rationale TEXT,

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memory_kind ON permanent_memory(kind);
CREATE INDEX IF NOT EXISTS idx_memory_created ON permanent_memory(created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_memory_mistake_key
    ON permanent_memory(error_key) WHERE kind = 'mistake';

CREATE VIRTUAL TABLE IF NOT EXISTS permanent_memory_fts USING fts5(
    title, body,
    content='permanent_memory',
    content_rowid='rowid',
    tokenize='porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS permanent_memory_ai AFTER INSERT ON permanent_memory BEGIN
    INSERT INTO permanent_memory_fts(rowid, title, body)
    VALUES (NEW.rowid, NEW.title, NEW.body);
END;

CREATE TRIGGER IF NOT EXISTS permanent_memory_ad AFTER DELETE ON permanent_memory BEGIN
    INSERT INTO permanent_memory_fts(permanent_memory_fts, rowid, title, body)
    VALUES ('delete', OLD.rowid, OLD.title, OLD.body);
END;

CREATE TRIGGER IF NOT EXISTS permanent_memory_au AFTER UPDATE ON permanent_memory BEGIN
    INSERT INTO permanent_memory_fts(permanent_memory_fts, rowid, title, body)
    VALUES ('delete', OLD.rowid, OLD.title, OLD.body);
    INSERT INTO permanent_memory_fts(rowid, title, body)
    VALUES (NEW.rowid, NEW.title, NEW.body);
END;
"#;

/// V2: Branch contexts and lifecycle sessions
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS branches (
    name TEXT PRIMARY KEY,
    completed_tasks TEXT NOT NULL DEFAULT '[]',
    pending_tasks TEXT NOT NULL DEFAULT '[]',
    decisions TEXT NOT NULL DEFAULT '[]',
    errors_encountered TEXT NOT NULL DEFAULT '[]',
    files_modified TEXT NOT NULL DEFAULT '[]',
    sessions_count INTEGER NOT NULL DEFAULT 0,
    total_duration_ms INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

-- Merged branches land here; rows are never removed.
CREATE TABLE IF NOT EXISTS branch_archive (
    archive_name TEXT PRIMARY KEY,
    branch TEXT NOT NULL,
    snapshot TEXT NOT NULL,
    archived_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_branch_archive_branch ON branch_archive(branch);

CREATE TABLE IF NOT EXISTS lifecycle_sessions (
    id TEXT PRIMARY KEY,
    session_id TEXT,
    feature TEXT NOT NULL,
    current_phase TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    phases TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_lifecycle_feature ON lifecycle_sessions(feature);
CREATE INDEX IF NOT EXISTS idx_lifecycle_status ON lifecycle_sessions(status);
"#;

/// V3: Evolution tracking
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS evolution_candidates (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,           -- 'new_convention', 'rule_elevation', 'pattern_ban', 'skill_update'
    title TEXT NOT NULL,
    description TEXT,
    confidence REAL NOT NULL,     -- 0-100
    model_scope TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    evidence TEXT NOT NULL DEFAULT '[]',
    rejection_reason TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_evolution_type ON evolution_candidates(type);
CREATE INDEX IF NOT EXISTS idx_evolution_status ON evolution_candidates(status);
CREATE INDEX IF NOT EXISTS idx_evolution_confidence ON evolution_candidates(confidence);

-- Append-only; survives candidate deletion.
CREATE TABLE IF NOT EXISTS evolution_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    candidate_id TEXT NOT NULL,
    action TEXT NOT NULL,         -- 'proposed', 'approved', 'applied', 'auto_applied', 'reverted', 'rejected', 'decayed', 'removed'
    confidence REAL NOT NULL,
    detail TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_evolution_log_candidate ON evolution_log(candidate_id);

CREATE TABLE IF NOT EXISTS evolution_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    candidate_id TEXT NOT NULL,
    candidate_state TEXT NOT NULL,
    target_content TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_evolution_snapshots_candidate ON evolution_snapshots(candidate_id);
"#;

/// V4: Pattern analytics, drafts, artifacts
const MIGRATION_V4_UP: &str = r#"
CREATE TABLE IF NOT EXISTS banned_patterns (
    id TEXT PRIMARY KEY,
    pattern TEXT NOT NULL,
    category TEXT NOT NULL DEFAULT 'general',
    description TEXT,
    severity TEXT NOT NULL DEFAULT 'warning',  -- 'info', 'warning', 'error'
    active INTEGER NOT NULL DEFAULT 1,
    use_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pattern_detections (
    id TEXT PRIMARY KEY,
    pattern_id TEXT NOT NULL,
    session_id TEXT,
    model TEXT,
    file_path TEXT,
    snippet TEXT,
    false_positive_count INTEGER NOT NULL DEFAULT 0,
    detected_at TEXT NOT NULL,
    FOREIGN KEY (pattern_id) REFERENCES banned_patterns(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_detections_pattern ON pattern_detections(pattern_id);
CREATE INDEX IF NOT EXISTS idx_detections_detected ON pattern_detections(detected_at);

CREATE TABLE IF NOT EXISTS audit_scores (
    id TEXT PRIMARY KEY,
    session_id TEXT,
    model TEXT,
    scores TEXT NOT NULL DEFAULT '{}',   -- dimension -> 0-100
    total_score REAL NOT NULL,
    verdict TEXT NOT NULL,               -- 'pass', 'warn', 'fail'
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_model ON audit_scores(model);

CREATE TABLE IF NOT EXISTS drafts (
    id TEXT PRIMARY KEY,
    category TEXT NOT NULL,
    title TEXT NOT NULL,
    filename TEXT NOT NULL,
    content TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0,
    source TEXT NOT NULL DEFAULT 'manual',  -- 'manual', 'evolution'
    status TEXT NOT NULL DEFAULT 'pending', -- 'pending', 'approved', 'rejected'
    rejection_reason TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_drafts_status ON drafts(status);

CREATE TABLE IF NOT EXISTS artifacts (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    feature TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',  -- 'active', 'done'
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL DEFAULT '',
    session_id TEXT,
    date TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_artifacts_type ON artifacts(type);
CREATE INDEX IF NOT EXISTS idx_artifacts_status ON artifacts(status);
CREATE INDEX IF NOT EXISTS idx_artifacts_feature ON artifacts(feature);
"#;

/// Create the `meta` table if this is a brand-new database.
pub fn ensure_meta(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(META_TABLE)
}

/// Read a value from the `meta` table.
pub fn get_meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
        row.get(0)
    })
    .optional()
}

/// Upsert a value in the `meta` table.
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Get current schema version from database (0 when never migrated or unparsable)
pub fn get_current_version(conn: &Connection) -> rusqlite::Result<u32> {
    let raw = get_meta(conn, "schema_version")?;
    Ok(raw.and_then(|v| v.trim().parse().ok()).unwrap_or(0))
}

/// Migrations whose version is above `current`, ascending.
pub fn pending_migrations(current: u32) -> Vec<&'static Migration> {
    let mut pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    pending.sort_by_key(|m| m.version);
    pending
}

/// Apply pending migrations, one transaction per version.
///
/// `schema_version` is written inside the same transaction as the DDL, so a
/// crash leaves the database at either the prior or the new version.
pub fn apply_migrations(conn: &mut Connection, current: u32) -> rusqlite::Result<u32> {
    let mut applied = 0;

    for migration in pending_migrations(current) {
        tracing::info!(
            "Applying migration v{}: {}",
            migration.version,
            migration.description
        );

        let tx = conn.transaction()?;
        tx.execute_batch(migration.up)?;
        set_meta(&tx, "schema_version", &migration.version.to_string())?;
        tx.commit()?;

        applied += 1;
    }

    Ok(applied)
}

/// Names of required tables and indexes that are absent from `sqlite_master`.
pub fn missing_schema_objects(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT type, name FROM sqlite_master WHERE type IN ('table', 'index')")?;
    let present: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;

    let has = |kind: &str, name: &str| present.iter().any(|(k, n)| k == kind && n == name);

    let mut missing = Vec::new();
    for table in REQUIRED_TABLES {
        if !has("table", table) {
            missing.push(format!("table:{}", table));
        }
    }
    for index in REQUIRED_INDEXES {
        if !has("index", index) {
            missing.push(format!("index:{}", index));
        }
    }
    Ok(missing)
}

/// 16-hex-char fingerprint of the schema this binary expects.
pub fn expected_schema_hash() -> String {
    let mut hasher = Sha256::new();
    hasher.update(META_TABLE.as_bytes());
    for migration in MIGRATIONS {
        hasher.update(migration.version.to_le_bytes());
        hasher.update(migration.up.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}
