//! Permanent Memory
//!
//! Long-lived, cross-session facts. Three kinds exist and the set is closed:
//! - **Decision**: what was chosen, why, and what else was considered
//! - **Mistake**: an error, its root cause and fix; deduplicated by error text
//! - **Convention**: a project rule with optional example and rationale

mod store;

pub use store::{DeleteOutcome, MemoryExport, MemoryStore, SaveOutcome, SimilarMistake};

pub(crate) use store::row_to_memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::storage::StorageError;

// ============================================================================
// KIND
// ============================================================================

/// Discriminant of a permanent-memory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Decision,
    Mistake,
    Convention,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 3] = [MemoryKind::Decision, MemoryKind::Mistake, MemoryKind::Convention];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Decision => "decision",
            MemoryKind::Mistake => "mistake",
            MemoryKind::Convention => "convention",
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "decision" => Ok(MemoryKind::Decision),
            "mistake" => Ok(MemoryKind::Mistake),
            "convention" => Ok(MemoryKind::Convention),
            other => Err(StorageError::Validation(format!(
                "Unknown memory kind '{}'",
                other
            ))),
        }
    }
}

// ============================================================================
// ENTRIES
// ============================================================================

/// A recorded architectural or implementation decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionMemory {
    pub decision: String,
    pub reasoning: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    pub context: Option<String>,
}

/// A mistake and how it was fixed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MistakeMemory {
    pub error: String,
    pub root_cause: String,
    pub fix: String,
    pub prevention: String,
    /// How many times this error text has been recorded
    pub occurrences: u32,
    pub last_seen_at: DateTime<Utc>,
}

/// A project convention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConventionMemory {
    pub convention: String,
    pub example: Option<String>,
    pub rationale: Option<String>,
}

/// Kind-specific payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryContent {
    Decision(DecisionMemory),
    Mistake(MistakeMemory),
    Convention(ConventionMemory),
}

impl MemoryContent {
    pub fn kind(&self) -> MemoryKind {
        match self {
            MemoryContent::Decision(_) => MemoryKind::Decision,
            MemoryContent::Mistake(_) => MemoryKind::Mistake,
            MemoryContent::Convention(_) => MemoryKind::Convention,
        }
    }

    /// Headline text: the decision, the error, or the convention
    pub fn title(&self) -> &str {
        match self {
            MemoryContent::Decision(d) => &d.decision,
            MemoryContent::Mistake(m) => &m.error,
            MemoryContent::Convention(c) => &c.convention,
        }
    }

    /// Everything except the headline, joined for full-text indexing
    pub(crate) fn body(&self) -> String {
        let parts: Vec<&str> = match self {
            MemoryContent::Decision(d) => {
                let mut parts = vec![d.reasoning.as_str()];
                parts.extend(d.alternatives.iter().map(String::as_str));
                parts.extend(d.context.as_deref());
                parts
            }
            MemoryContent::Mistake(m) => {
                vec![m.root_cause.as_str(), m.fix.as_str(), m.prevention.as_str()]
            }
            MemoryContent::Convention(c) => {
                c.example.as_deref().into_iter().chain(c.rationale.as_deref()).collect()
            }
        };
        parts
            .into_iter()
            .filter(|p| !p.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One row of permanent memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermanentMemoryEntry {
    pub id: String,
    #[serde(flatten)]
    pub content: MemoryContent,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PermanentMemoryEntry {
    pub fn kind(&self) -> MemoryKind {
        self.content.kind()
    }
}

// ============================================================================
// INPUTS
// ============================================================================

/// Request to record a new entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NewMemory {
    #[serde(rename_all = "camelCase")]
    Decision {
        decision: String,
        reasoning: String,
        #[serde(default)]
        alternatives: Vec<String>,
        context: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Mistake {
        error: String,
        root_cause: String,
        fix: String,
        prevention: String,
    },
    #[serde(rename_all = "camelCase")]
    Convention {
        convention: String,
        example: Option<String>,
        rationale: Option<String>,
    },
}

impl NewMemory {
    pub fn kind(&self) -> MemoryKind {
        match self {
            NewMemory::Decision { .. } => MemoryKind::Decision,
            NewMemory::Mistake { .. } => MemoryKind::Mistake,
            NewMemory::Convention { .. } => MemoryKind::Convention,
        }
    }
}

/// Partial update; only `Some` fields are applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryPatch {
    #[serde(rename_all = "camelCase")]
    Decision {
        decision: Option<String>,
        reasoning: Option<String>,
        alternatives: Option<Vec<String>>,
        context: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Mistake {
        error: Option<String>,
        root_cause: Option<String>,
        fix: Option<String>,
        prevention: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Convention {
        convention: Option<String>,
        example: Option<String>,
        rationale: Option<String>,
    },
}

impl MemoryPatch {
    pub fn kind(&self) -> MemoryKind {
        match self {
            MemoryPatch::Decision { .. } => MemoryKind::Decision,
            MemoryPatch::Mistake { .. } => MemoryKind::Mistake,
            MemoryPatch::Convention { .. } => MemoryKind::Convention,
        }
    }

    /// Merge into `content`. The caller has already checked the kinds agree.
    pub(crate) fn apply_to(self, content: &mut MemoryContent) {
        match (self, content) {
            (
                MemoryPatch::Decision {
                    decision,
                    reasoning,
                    alternatives,
                    context,
                },
                MemoryContent::Decision(d),
            ) => {
                if let Some(v) = decision {
                    d.decision = v;
                }
                if let Some(v) = reasoning {
                    d.reasoning = v;
                }
                if let Some(v) = alternatives {
                    d.alternatives = v;
                }
                if context.is_some() {
                    d.context = context;
                }
            }
            (
                MemoryPatch::Mistake {
                    error,
                    root_cause,
                    fix,
                    prevention,
                },
                MemoryContent::Mistake(m),
            ) => {
                if let Some(v) = error {
                    m.error = v;
                }
                if let Some(v) = root_cause {
                    m.root_cause = v;
                }
                if let Some(v) = fix {
                    m.fix = v;
                }
                if let Some(v) = prevention {
                    m.prevention = v;
                }
            }
            (
                MemoryPatch::Convention {
                    convention,
                    example,
                    rationale,
                },
                MemoryContent::Convention(c),
            ) => {
                if let Some(v) = convention {
                    c.convention = v;
                }
                if example.is_some() {
                    c.example = example;
                }
                if rationale.is_some() {
                    c.rationale = rationale;
                }
            }
            _ => {}
        }
    }
}

/// Dedup key for mistakes: trimmed, lower-cased error text
pub(crate) fn normalize_error(error: &str) -> String {
    error.trim().to_lowercase()
}
