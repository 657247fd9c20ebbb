//! Test Database Manager
//!
//! Provides isolated database instances for testing:
//! - Temporary databases that are automatically cleaned up
//! - Store constructors sharing one storage handle
//! - Reopening the same file to check persistence

use std::path::{Path, PathBuf};
use std::sync::Arc;

use aidd_core::{
    BranchStore, DraftStore, EvolutionTracker, LifecycleStore, MemoryStore, PatternStore,
    SearchIndex, SessionStore, Storage, StoreConfig, StoreStats,
};
use tempfile::TempDir;

/// Manager for test databases
///
/// Creates isolated database instances for each test to prevent interference.
/// Automatically cleans up temporary databases when dropped.
///
/// # Example
///
/// ```rust,ignore
/// let db = TestDatabaseManager::new_temp();
///
/// let memory = db.memory();
/// memory.save(NewMemory::Convention { .. })?;
///
/// // Database is automatically deleted when `db` goes out of scope
/// ```
pub struct TestDatabaseManager {
    /// The storage instance
    pub storage: Arc<Storage>,
    /// Temporary directory (kept alive to prevent premature deletion)
    _temp_dir: Option<TempDir>,
    /// Path to the database file
    db_path: PathBuf,
}

impl TestDatabaseManager {
    /// Create a new test database in a temporary directory
    pub fn new_temp() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test_aidd.db");

        let storage = Storage::new(Some(db_path.clone())).expect("Failed to create test storage");

        Self {
            storage: Arc::new(storage),
            _temp_dir: Some(temp_dir),
            db_path,
        }
    }

    /// Create a project-style database at `<root>/.aidd/memory.db`
    ///
    /// The directory is owned by the caller and NOT deleted.
    pub fn new_in_project(project_root: &Path) -> Self {
        let config =
            StoreConfig::resolve_with(None, Some(project_root), |_| None).expect("resolve config");
        let storage = Storage::open(&config).expect("Failed to open project storage");

        Self {
            storage: Arc::new(storage),
            _temp_dir: None,
            db_path: config.db_path,
        }
    }

    /// Get the database path
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Drop the current handle and open the same file again
    pub fn reopen(&mut self) {
        let storage =
            Storage::new(Some(self.db_path.clone())).expect("Failed to reopen test storage");
        self.storage = Arc::new(storage);
    }

    /// Row counts; panics on a broken database
    pub fn stats(&self) -> StoreStats {
        self.storage.stats().expect("stats")
    }

    /// True when nothing has been recorded yet
    pub fn is_empty(&self) -> bool {
        let s = self.stats();
        s.sessions == 0 && s.observations == 0 && s.decisions + s.mistakes + s.conventions == 0
    }

    // ========================================================================
    // STORES
    // ========================================================================

    pub fn memory(&self) -> MemoryStore {
        MemoryStore::new(Arc::clone(&self.storage))
    }

    pub fn sessions(&self) -> SessionStore {
        SessionStore::new(Arc::clone(&self.storage))
    }

    pub fn branches(&self) -> BranchStore {
        BranchStore::new(Arc::clone(&self.storage))
    }

    pub fn lifecycles(&self) -> LifecycleStore {
        LifecycleStore::new(Arc::clone(&self.storage))
    }

    pub fn search(&self) -> SearchIndex {
        SearchIndex::new(Arc::clone(&self.storage))
    }

    pub fn evolution(&self) -> EvolutionTracker {
        EvolutionTracker::new(Arc::clone(&self.storage))
    }

    pub fn patterns(&self) -> PatternStore {
        PatternStore::new(Arc::clone(&self.storage))
    }

    pub fn drafts(&self) -> DraftStore {
        DraftStore::new(Arc::clone(&self.storage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_temp_is_empty() {
        let db = TestDatabaseManager::new_temp();
        assert!(db.is_empty());
        assert!(db.path().exists());
    }

    #[test]
    fn test_project_database_location() {
        let root = TempDir::new().unwrap();
        let db = TestDatabaseManager::new_in_project(root.path());
        assert_eq!(db.path(), root.path().join(".aidd").join("memory.db"));
        assert!(db.path().exists());
    }
}
