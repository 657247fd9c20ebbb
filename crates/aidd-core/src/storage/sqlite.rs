//! SQLite Storage Implementation
//!
//! The engine every store is built on: opening, migrating, integrity
//! verification, pre-migration backups, transactional access, WAL
//! checkpointing and stale-data pruning.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, Transaction};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::migrations;
use crate::config::StoreConfig;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encode/decode at the storage edge
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// Entity exists but is a different permanent-memory kind
    #[error("Entry {id} is a {actual}, not a {expected}")]
    KindMismatch {
        /// Entry id
        id: String,
        /// Kind the caller asked for
        expected: String,
        /// Kind actually stored
        actual: String,
    },
    /// Malformed or out-of-range argument
    #[error("Validation error: {0}")]
    Validation(String),
    /// The database was written by a newer binary
    #[error("Database schema v{found} is newer than supported v{supported}")]
    SchemaTooNew {
        /// Version recorded in `meta`
        found: u32,
        /// Highest version this binary knows
        supported: u32,
    },
    /// Required tables or indexes missing after migration
    #[error("Schema integrity check failed, missing: {}", missing.join(", "))]
    IntegrityCheck {
        /// `table:<name>` / `index:<name>` entries
        missing: Vec<String>,
    },
    /// Invalid timestamp
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
}

impl StorageError {
    /// Startup errors after which the process must not continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::SchemaTooNew { .. } | StorageError::IntegrityCheck { .. }
        )
    }
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;

// ============================================================================
// STORAGE EDGE HELPERS
// ============================================================================

/// Fixed-width RFC 3339 with microseconds and `Z`, so text order is time order.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse RFC3339 timestamp
pub(crate) fn parse_timestamp(value: &str, field_name: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Invalid {} timestamp '{}': {}", field_name, value, e),
                )),
            )
        })
}

pub(crate) fn parse_optional_timestamp(
    value: Option<String>,
    field_name: &str,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_timestamp(&v, field_name)).transpose()
}

/// Parse a text enum column, surfacing unknown values as a row error.
pub(crate) fn parse_enum_column<T>(raw: &str, column: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = StorageError>,
{
    raw.parse().map_err(|e: StorageError| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{} in {}", e, column),
            )),
        )
    })
}

/// Clamp a `usize` count to SQLite's integer range
pub(crate) fn to_sql_limit(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Decode a JSON text column into a typed value, surfacing bad data as a row error.
pub(crate) fn from_json_column<T: serde::de::DeserializeOwned>(
    raw: &str,
    column: &str,
) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Invalid JSON in {}: {}", column, e),
            )),
        )
    })
}

// ============================================================================
// PRUNING / MAINTENANCE TYPES
// ============================================================================

/// What `prune_stale_data` is allowed to delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneOptions {
    /// Pattern detections older than this many days are removed
    pub detection_max_age_days: i64,
    /// Upper bound on observation rows; the oldest beyond it are removed
    pub max_observations: usize,
    /// Observations of sessions outside the N most recent are removed
    pub keep_recent_sessions: usize,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            detection_max_age_days: 90,
            max_observations: 10_000,
            keep_recent_sessions: 100,
        }
    }
}

/// Rows removed by one prune run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub detections_removed: usize,
    pub observations_over_cap: usize,
    pub observations_of_old_sessions: usize,
}

impl PruneReport {
    pub fn total(&self) -> usize {
        self.detections_removed + self.observations_over_cap + self.observations_of_old_sessions
    }
}

/// Outcome of `PRAGMA wal_checkpoint(TRUNCATE)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointResult {
    /// True when a concurrent reader prevented a full checkpoint
    pub busy: bool,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// Row counts per entity table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub schema_version: u32,
    pub sessions: i64,
    pub active_sessions: i64,
    pub observations: i64,
    pub decisions: i64,
    pub mistakes: i64,
    pub conventions: i64,
    pub branches: i64,
    pub archived_branches: i64,
    pub lifecycle_sessions: i64,
    pub evolution_candidates: i64,
    pub banned_patterns: i64,
    pub pattern_detections: i64,
    pub drafts: i64,
    pub artifacts: i64,
}

// ============================================================================
// STORAGE
// ============================================================================

/// Handle to one project database.
///
/// Uses separate reader/writer connections for interior mutability.
/// All methods take `&self`, so stores share one `Arc<Storage>`.
pub struct Storage {
    path: PathBuf,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    migrations_applied: u32,
    migration_backup: Option<PathBuf>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.path)
            .field("migrations_applied", &self.migrations_applied)
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// Apply PRAGMAs and optional encryption to a connection
    fn configure_connection(conn: &Connection, busy_timeout: std::time::Duration) -> Result<()> {
        #[cfg(feature = "encryption")]
        {
            if let Ok(key) = std::env::var("AIDD_ENCRYPTION_KEY") {
                if !key.is_empty() {
                    conn.pragma_update(None, "key", &key)?;
                }
            }
        }

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -16000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA journal_size_limit = 67108864;",
        )?;
        conn.busy_timeout(busy_timeout)?;

        Ok(())
    }

    /// Open (creating if needed) the database at `db_path`, or the default location.
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let config = match db_path {
            Some(path) => StoreConfig::with_path(path),
            None => StoreConfig::resolve(None, None)?,
        };
        Self::open(&config)
    }

    /// Open the database described by `config`, migrating it to the latest schema.
    ///
    /// Fails with a fatal error when the stored schema is newer than this binary
    /// or when required tables/indexes are missing after migration.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.db_path.clone();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
            }
        }

        // Decided before SQLite creates the file
        let had_content = std::fs::metadata(&path)
            .map(|m| m.len() > 0)
            .unwrap_or(false);

        let mut writer_conn = Connection::open(&path)?;

        #[cfg(unix)]
        if path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }

        Self::configure_connection(&writer_conn, config.busy_timeout)?;

        migrations::ensure_meta(&writer_conn)?;
        let current = migrations::get_current_version(&writer_conn)?;
        if current > migrations::LATEST_VERSION {
            return Err(StorageError::SchemaTooNew {
                found: current,
                supported: migrations::LATEST_VERSION,
            });
        }

        let mut migration_backup = None;
        let pending = migrations::pending_migrations(current);
        if !pending.is_empty() && had_content {
            Self::checkpoint_connection(&writer_conn)?;
            let backup =
                Self::copy_pre_migration_backup(&path, current, migrations::LATEST_VERSION)?;
            tracing::info!("Pre-migration backup written to {}", backup.display());
            migration_backup = Some(backup);
        }

        let migrations_applied = migrations::apply_migrations(&mut writer_conn, current)?;

        let missing = migrations::missing_schema_objects(&writer_conn)?;
        if !missing.is_empty() {
            return Err(StorageError::IntegrityCheck { missing });
        }

        let expected_hash = migrations::expected_schema_hash();
        match migrations::get_meta(&writer_conn, "schema_hash")? {
            Some(stored) if stored != expected_hash => {
                tracing::warn!(
                    "Schema hash drift: stored {} but this build expects {}",
                    stored,
                    expected_hash
                );
                migrations::set_meta(&writer_conn, "schema_hash", &expected_hash)?;
            }
            Some(_) => {}
            None => migrations::set_meta(&writer_conn, "schema_hash", &expected_hash)?,
        }

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn, config.busy_timeout)?;

        Ok(Self {
            path,
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            migrations_applied,
            migration_backup,
        })
    }

    fn copy_pre_migration_backup(path: &Path, from: u32, to: u32) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ");
        let mut name = OsString::from(path.as_os_str());
        name.push(format!(".pre-migration-v{}-to-v{}-{}.bak", from, to, stamp));
        let backup = PathBuf::from(name);
        std::fs::copy(path, &backup)?;
        Ok(backup)
    }

    fn checkpoint_connection(conn: &Connection) -> Result<CheckpointResult> {
        let (busy, log_frames, checkpointed_frames) =
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
        Ok(CheckpointResult {
            busy: busy != 0,
            log_frames,
            checkpointed_frames,
        })
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Migrations applied while opening this handle (0 on an up-to-date database)
    pub fn migrations_applied(&self) -> u32 {
        self.migrations_applied
    }

    /// Backup copied before migrating, if one was needed
    pub fn migration_backup(&self) -> Option<&Path> {
        self.migration_backup.as_deref()
    }

    // ========================================================================
    // CONNECTION ACCESS
    // ========================================================================

    /// Run `f` against the read connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let reader = self
            .reader
            .lock()
            .map_err(|_| StorageError::Init("Reader lock poisoned".into()))?;
        f(&reader)
    }

    /// Run `f` against the write connection without an explicit transaction.
    pub fn write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let writer = self
            .writer
            .lock()
            .map_err(|_| StorageError::Init("Writer lock poisoned".into()))?;
        f(&writer)
    }

    /// Run `f` inside one write transaction; commits on `Ok`, rolls back on `Err`.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| StorageError::Init("Writer lock poisoned".into()))?;
        let tx = writer.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Fold the write-ahead log back into the main file. Call on graceful shutdown.
    pub fn checkpoint(&self) -> Result<CheckpointResult> {
        self.write(Self::checkpoint_connection)
    }

    /// Current `schema_version` from `meta`
    pub fn schema_version(&self) -> Result<u32> {
        self.read(|conn| Ok(migrations::get_current_version(conn)?))
    }

    /// Delete stale rows and rebuild the full-text indexes, all in one transaction.
    pub fn prune_stale_data(&self, options: &PruneOptions) -> Result<PruneReport> {
        if options.detection_max_age_days < 0 {
            return Err(StorageError::Validation(
                "detection_max_age_days must not be negative".to_string(),
            ));
        }
        let cutoff = format_timestamp(&(Utc::now() - Duration::days(options.detection_max_age_days)));
        let max_observations = i64::try_from(options.max_observations).unwrap_or(i64::MAX);
        let keep_sessions = i64::try_from(options.keep_recent_sessions).unwrap_or(i64::MAX);

        let report = self.transaction(|tx| {
            let detections_removed = tx.execute(
                "DELETE FROM pattern_detections WHERE detected_at < ?1",
                params![cutoff],
            )?;

            let observations_over_cap = tx.execute(
                "DELETE FROM observations WHERE id IN (
                     SELECT id FROM observations
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT -1 OFFSET ?1
                 )",
                params![max_observations],
            )?;

            let observations_of_old_sessions = tx.execute(
                "DELETE FROM observations WHERE session_id NOT IN (
                     SELECT id FROM sessions ORDER BY started_at DESC LIMIT ?1
                 )",
                params![keep_sessions],
            )?;

            tx.execute_batch(
                "INSERT INTO observations_fts(observations_fts) VALUES('rebuild');
                 INSERT INTO permanent_memory_fts(permanent_memory_fts) VALUES('rebuild');",
            )?;

            Ok(PruneReport {
                detections_removed,
                observations_over_cap,
                observations_of_old_sessions,
            })
        })?;

        tracing::info!(
            detections = report.detections_removed,
            over_cap = report.observations_over_cap,
            old_sessions = report.observations_of_old_sessions,
            "Pruned stale data"
        );
        Ok(report)
    }

    /// Row counts per entity table
    pub fn stats(&self) -> Result<StoreStats> {
        self.read(|conn| {
            let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |r| r.get(0)) };
            Ok(StoreStats {
                schema_version: migrations::get_current_version(conn)?,
                sessions: count("SELECT COUNT(*) FROM sessions")?,
                active_sessions: count("SELECT COUNT(*) FROM sessions WHERE ended_at IS NULL")?,
                observations: count("SELECT COUNT(*) FROM observations")?,
                decisions: count("SELECT COUNT(*) FROM permanent_memory WHERE kind = 'decision'")?,
                mistakes: count("SELECT COUNT(*) FROM permanent_memory WHERE kind = 'mistake'")?,
                conventions: count(
                    "SELECT COUNT(*) FROM permanent_memory WHERE kind = 'convention'",
                )?,
                branches: count("SELECT COUNT(*) FROM branches")?,
                archived_branches: count("SELECT COUNT(*) FROM branch_archive")?,
                lifecycle_sessions: count("SELECT COUNT(*) FROM lifecycle_sessions")?,
                evolution_candidates: count("SELECT COUNT(*) FROM evolution_candidates")?,
                banned_patterns: count("SELECT COUNT(*) FROM banned_patterns")?,
                pattern_detections: count("SELECT COUNT(*) FROM pattern_detections")?,
                drafts: count("SELECT COUNT(*) FROM drafts")?,
                artifacts: count("SELECT COUNT(*) FROM artifacts")?,
            })
        })
    }

    /// Create a consistent backup using VACUUM INTO
    pub fn backup_to(&self, path: &Path) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| StorageError::Init("Invalid backup path encoding".to_string()))?;
        if path_str.bytes().any(|b| b < 0x20 && b != b'\t') {
            return Err(StorageError::Validation(
                "Backup path contains invalid characters".to_string(),
            ));
        }
        self.read(|conn| {
            // VACUUM INTO doesn't support parameterized queries; escape single quotes
            conn.execute_batch(&format!("VACUUM INTO '{}'", path_str.replace('\'', "''")))?;
            Ok(())
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
