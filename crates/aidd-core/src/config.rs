//! Store Configuration
//!
//! Resolves where the database lives and the tunables the engine, pruning,
//! health scoring and hook bus read at startup. Explicit arguments win over
//! environment variables, which win over built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;

use crate::hooks::HookBusConfig;
use crate::storage::{PruneOptions, Result, StorageError};

/// Project-local state directory name.
pub const STATE_DIR: &str = ".aidd";

/// Database file name inside the state directory.
pub const DB_FILE_NAME: &str = "memory.db";

/// Default SQLite busy timeout.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Default number of completed sessions considered by health scoring.
pub const DEFAULT_HEALTH_WINDOW: usize = 20;

/// Fully resolved configuration for one store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file path
    pub db_path: PathBuf,
    /// How long a connection waits on a locked database
    pub busy_timeout: Duration,
    /// Defaults used by `prune` when the caller passes none
    pub prune: PruneOptions,
    /// Completed sessions considered by health scoring
    pub health_window: usize,
    /// Hook bus retry / circuit-breaker policy
    pub hooks: HookBusConfig,
}

impl StoreConfig {
    /// Configuration for an explicit database path with default tunables.
    pub fn with_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            prune: PruneOptions::default(),
            health_window: DEFAULT_HEALTH_WINDOW,
            hooks: HookBusConfig::default(),
        }
    }

    /// Resolve configuration from arguments and the process environment.
    ///
    /// Path resolution order: `db_path` > `AIDD_DB_PATH` > `<project>/.aidd/memory.db`
    /// > the platform data directory.
    pub fn resolve(db_path: Option<PathBuf>, project_root: Option<&Path>) -> Result<Self> {
        Self::resolve_with(db_path, project_root, |key| std::env::var(key).ok())
    }

    /// Same as [`StoreConfig::resolve`] with an injectable environment lookup.
    pub fn resolve_with<F>(
        db_path: Option<PathBuf>,
        project_root: Option<&Path>,
        env: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = match db_path {
            Some(p) => p,
            None => match env("AIDD_DB_PATH").filter(|v| !v.trim().is_empty()) {
                Some(p) => PathBuf::from(p),
                None => match project_root {
                    Some(root) => project_db_path(root),
                    None => default_db_path()?,
                },
            },
        };

        let mut config = Self::with_path(path);

        if let Some(ms) = parse_env(&env, "AIDD_BUSY_TIMEOUT_MS")? {
            config.busy_timeout = Duration::from_millis(ms);
        }
        if let Some(window) = parse_env(&env, "AIDD_HEALTH_WINDOW")? {
            config.health_window = window;
        }
        if let Some(days) = parse_env(&env, "AIDD_PRUNE_DETECTION_DAYS")? {
            config.prune.detection_max_age_days = days;
        }
        if let Some(max) = parse_env(&env, "AIDD_PRUNE_MAX_OBSERVATIONS")? {
            config.prune.max_observations = max;
        }
        if let Some(keep) = parse_env(&env, "AIDD_PRUNE_KEEP_SESSIONS")? {
            config.prune.keep_recent_sessions = keep;
        }
        if let Some(retries) = parse_env(&env, "AIDD_HOOK_MAX_RETRIES")? {
            config.hooks.max_retries = retries;
        }
        if let Some(threshold) = parse_env(&env, "AIDD_HOOK_FAILURE_THRESHOLD")? {
            config.hooks.failure_threshold = threshold;
        }
        if let Some(secs) = parse_env(&env, "AIDD_HOOK_COOLDOWN_SECS")? {
            config.hooks.cooldown = chrono::Duration::seconds(secs);
        }

        Ok(config)
    }
}

/// `<project>/.aidd/memory.db`
pub fn project_db_path(project_root: &Path) -> PathBuf {
    project_root.join(STATE_DIR).join(DB_FILE_NAME)
}

/// Fallback location in the platform data directory.
pub fn default_db_path() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("dev", "aidd", "memory").ok_or_else(|| {
        StorageError::Init("Could not determine project directories".to_string())
    })?;
    Ok(proj_dirs.data_dir().join(DB_FILE_NAME))
}

fn parse_env<F, T>(env: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match env(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| StorageError::Validation(format!("{} must be a number, got '{}'", key, raw))),
    }
}
