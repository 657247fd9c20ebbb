//! Evolution Tracking
//!
//! Candidates are proposed improvements to project conventions, rules,
//! banned patterns and skills. Each carries a 0-100 confidence that moves as
//! evidence accumulates or disappears. Every action lands in an append-only
//! log, and applying a candidate snapshots its prior state so the change can
//! be reverted.

mod tracker;

pub use tracker::{
    jaccard_similarity, EvolutionTracker, DECAY_SIMILARITY_THRESHOLD, DEFAULT_AUTO_APPLY_CONFIDENCE,
    MIN_CONFIDENCE,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::storage::StorageError;

/// What a candidate would change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateType {
    NewConvention,
    RuleElevation,
    PatternBan,
    SkillUpdate,
}

impl CandidateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateType::NewConvention => "new_convention",
            CandidateType::RuleElevation => "rule_elevation",
            CandidateType::PatternBan => "pattern_ban",
            CandidateType::SkillUpdate => "skill_update",
        }
    }

    /// Types whose confidence decays when a matching convention is deleted
    pub fn decays_with_conventions(&self) -> bool {
        matches!(self, CandidateType::NewConvention | CandidateType::RuleElevation)
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CandidateType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new_convention" => Ok(CandidateType::NewConvention),
            "rule_elevation" => Ok(CandidateType::RuleElevation),
            "pattern_ban" => Ok(CandidateType::PatternBan),
            "skill_update" => Ok(CandidateType::SkillUpdate),
            other => Err(StorageError::Validation(format!(
                "Unknown candidate type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Pending,
    Approved,
    Rejected,
    Applied,
    Reverted,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::Pending => "pending",
            CandidateStatus::Approved => "approved",
            CandidateStatus::Rejected => "rejected",
            CandidateStatus::Applied => "applied",
            CandidateStatus::Reverted => "reverted",
        }
    }
}

impl fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CandidateStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CandidateStatus::Pending),
            "approved" => Ok(CandidateStatus::Approved),
            "rejected" => Ok(CandidateStatus::Rejected),
            "applied" => Ok(CandidateStatus::Applied),
            "reverted" => Ok(CandidateStatus::Reverted),
            other => Err(StorageError::Validation(format!(
                "Unknown candidate status '{}'",
                other
            ))),
        }
    }
}

/// A proposed, confidence-scored improvement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionCandidate {
    pub id: String,
    #[serde(rename = "type")]
    pub candidate_type: CandidateType,
    pub title: String,
    pub description: Option<String>,
    /// 0-100
    pub confidence: f64,
    /// Model the candidate was observed with, if it is model-specific
    pub model_scope: Option<String>,
    pub status: CandidateStatus,
    #[serde(default)]
    pub evidence: Vec<String>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to propose a candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCandidate {
    #[serde(rename = "type")]
    pub candidate_type: CandidateType,
    pub title: String,
    pub description: Option<String>,
    pub confidence: f64,
    pub model_scope: Option<String>,
    #[serde(default)]
    pub evidence: Vec<String>,
}

/// Filters for `list_candidates`; results come sorted by confidence, highest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateFilter {
    #[serde(rename = "type")]
    pub candidate_type: Option<CandidateType>,
    /// Case-insensitive substring of the title
    pub title_contains: Option<String>,
    pub model_scope: Option<String>,
    pub min_confidence: Option<f64>,
    pub status: Option<CandidateStatus>,
}

/// Logged action kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionAction {
    Proposed,
    Updated,
    Approved,
    Rejected,
    Applied,
    AutoApplied,
    Reverted,
    Decayed,
    Removed,
    Deleted,
}

impl EvolutionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvolutionAction::Proposed => "proposed",
            EvolutionAction::Updated => "updated",
            EvolutionAction::Approved => "approved",
            EvolutionAction::Rejected => "rejected",
            EvolutionAction::Applied => "applied",
            EvolutionAction::AutoApplied => "auto_applied",
            EvolutionAction::Reverted => "reverted",
            EvolutionAction::Decayed => "decayed",
            EvolutionAction::Removed => "removed",
            EvolutionAction::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EvolutionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvolutionAction {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(EvolutionAction::Proposed),
            "updated" => Ok(EvolutionAction::Updated),
            "approved" => Ok(EvolutionAction::Approved),
            "rejected" => Ok(EvolutionAction::Rejected),
            "applied" => Ok(EvolutionAction::Applied),
            "auto_applied" => Ok(EvolutionAction::AutoApplied),
            "reverted" => Ok(EvolutionAction::Reverted),
            "decayed" => Ok(EvolutionAction::Decayed),
            "removed" => Ok(EvolutionAction::Removed),
            "deleted" => Ok(EvolutionAction::Deleted),
            other => Err(StorageError::Validation(format!(
                "Unknown evolution action '{}'",
                other
            ))),
        }
    }
}

/// One row of the append-only action log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionLogEntry {
    pub id: i64,
    pub candidate_id: String,
    pub action: EvolutionAction,
    /// Candidate confidence at the time of the action
    pub confidence: f64,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Pre-application state of a candidate and the content it replaced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionSnapshot {
    pub id: i64,
    pub candidate_id: String,
    pub candidate_state: EvolutionCandidate,
    pub target_content: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of `revert`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertOutcome {
    pub candidate: EvolutionCandidate,
    /// Content to restore in the changed file, as captured on apply
    pub restored_content: Option<String>,
}

/// Candidate counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionStatus {
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub applied: usize,
    pub reverted: usize,
    /// `auto_applied` log entries
    pub auto_applied: usize,
}

/// Candidates touched by one decay pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecayReport {
    /// Halved and kept
    pub decayed: Vec<String>,
    /// Fell below the floor and were deleted
    pub removed: Vec<String>,
}

impl DecayReport {
    pub fn is_empty(&self) -> bool {
        self.decayed.is_empty() && self.removed.is_empty()
    }
}
