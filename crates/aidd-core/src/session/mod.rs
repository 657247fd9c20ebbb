//! Sessions, Branches and Lifecycles
//!
//! - [`SessionStore`]: one row per development session plus the typed
//!   observations captured during it
//! - [`BranchStore`]: per-branch accumulation across sessions, with
//!   promote and one-way merge into the archive
//! - [`LifecycleStore`]: the fixed 8-phase progression of a feature

mod branch;
mod lifecycle;
mod store;

pub use branch::{ArchivedBranch, BranchContext, BranchStore, BranchUpdate};
pub use lifecycle::{
    LifecyclePhase, LifecycleSession, LifecycleStatus, LifecycleStore, PhaseDetail, PhaseStatus,
};
pub use store::{SessionFilter, SessionStore, SessionSummary};

pub(crate) use store::{row_to_observation, row_to_session};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::storage::StorageError;

/// Derived from whether `endedAt` is set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            other => Err(StorageError::Validation(format!(
                "Unknown session status '{}'",
                other
            ))),
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOutcome {
    pub tests_passing: bool,
    pub revert_count: u32,
    /// 0-100
    pub compliance_score: f64,
}

impl SessionOutcome {
    /// Tests passed and nothing was reverted
    pub fn is_success(&self) -> bool {
        self.tests_passing && self.revert_count == 0
    }
}

/// One development session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub id: String,
    pub parent_session_id: Option<String>,
    /// Linked memory-session id
    pub memory_session_id: Option<String>,
    pub branch: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub ai_model: Option<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub errors_resolved: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub tasks_completed: Vec<String>,
    #[serde(default)]
    pub tasks_pending: Vec<String>,
    pub outcome: Option<SessionOutcome>,
}

impl SessionState {
    /// A fresh active session starting now
    pub fn start(branch: impl Into<String>, ai_model: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_session_id: None,
            memory_session_id: None,
            branch: branch.into(),
            started_at: Utc::now(),
            ended_at: None,
            status: SessionStatus::Active,
            ai_model,
            decisions: Vec::new(),
            errors_resolved: Vec::new(),
            files_modified: Vec::new(),
            tasks_completed: Vec::new(),
            tasks_pending: Vec::new(),
            outcome: None,
        }
    }

    pub fn derived_status(&self) -> SessionStatus {
        if self.ended_at.is_some() {
            SessionStatus::Completed
        } else {
            SessionStatus::Active
        }
    }

    /// Elapsed milliseconds, never negative; 0 while still active
    pub fn duration_ms(&self) -> i64 {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0))
            .unwrap_or(0)
    }
}

/// Kind of note captured during a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationType {
    Decision,
    Mistake,
    Convention,
    Pattern,
    Preference,
    Insight,
    ToolOutcome,
    WorkflowOutcome,
}

impl ObservationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationType::Decision => "decision",
            ObservationType::Mistake => "mistake",
            ObservationType::Convention => "convention",
            ObservationType::Pattern => "pattern",
            ObservationType::Preference => "preference",
            ObservationType::Insight => "insight",
            ObservationType::ToolOutcome => "tool_outcome",
            ObservationType::WorkflowOutcome => "workflow_outcome",
        }
    }
}

impl fmt::Display for ObservationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObservationType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "decision" => Ok(ObservationType::Decision),
            "mistake" => Ok(ObservationType::Mistake),
            "convention" => Ok(ObservationType::Convention),
            "pattern" => Ok(ObservationType::Pattern),
            "preference" => Ok(ObservationType::Preference),
            "insight" => Ok(ObservationType::Insight),
            "tool_outcome" => Ok(ObservationType::ToolOutcome),
            "workflow_outcome" => Ok(ObservationType::WorkflowOutcome),
            other => Err(StorageError::Validation(format!(
                "Unknown observation type '{}'",
                other
            ))),
        }
    }
}

/// A typed note captured during one session; never mutated after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionObservation {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub observation_type: ObservationType,
    pub title: String,
    pub narrative: String,
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub files_read: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    pub discovery_tokens: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// Request to record an observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewObservation {
    pub session_id: String,
    #[serde(rename = "type")]
    pub observation_type: ObservationType,
    pub title: String,
    #[serde(default)]
    pub narrative: String,
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub files_read: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    pub discovery_tokens: Option<u32>,
}

impl NewObservation {
    pub fn new(
        session_id: impl Into<String>,
        observation_type: ObservationType,
        title: impl Into<String>,
        narrative: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            observation_type,
            title: title.into(),
            narrative: narrative.into(),
            facts: Vec::new(),
            concepts: Vec::new(),
            files_read: Vec::new(),
            files_modified: Vec::new(),
            discovery_tokens: None,
        }
    }
}
