//! Storage Module
//!
//! SQLite-based storage layer with:
//! - Versioned migrations gated by `meta.schema_version`
//! - Post-migration integrity verification
//! - Pre-migration file backups
//! - FTS5 full-text indexes over observations and permanent memory
//! - WAL checkpointing and stale-data pruning

mod migrations;
mod sqlite;

pub use migrations::{
    expected_schema_hash, Migration, LATEST_VERSION, MIGRATIONS, REQUIRED_INDEXES,
    REQUIRED_TABLES,
};
pub use sqlite::{
    format_timestamp, CheckpointResult, PruneOptions, PruneReport, Result, Storage, StorageError,
    StoreStats,
};

pub(crate) use sqlite::{
    from_json_column, parse_enum_column, parse_optional_timestamp, parse_timestamp, to_sql_limit,
};
