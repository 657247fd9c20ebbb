//! Test Data Factory
//!
//! Provides utilities for generating realistic test data:
//! - Permanent memory entries (decisions, mistakes, conventions)
//! - Sessions with outcomes, already completed
//! - Evolution candidates
//! - Pre-built scenarios for common test cases

use aidd_core::{
    CandidateType, EvolutionCandidate, EvolutionTracker, MemoryStore, NewCandidate, NewMemory,
    NewObservation, ObservationType, PermanentMemoryEntry, SessionObservation, SessionOutcome,
    SessionState, SessionStore,
};

/// Factory for creating test data
///
/// # Example
///
/// ```rust,ignore
/// let db = TestDatabaseManager::new_temp();
///
/// let mistake = TestDataFactory::mistake(&db.memory(), "Cannot find module './x'");
/// let session = TestDataFactory::completed_session(&db.sessions(), SessionSpec::default());
/// ```
pub struct TestDataFactory;

/// Shape of a session created by [`TestDataFactory::completed_session`]
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub branch: String,
    pub ai_model: Option<String>,
    pub decisions: Vec<String>,
    pub errors_resolved: Vec<String>,
    pub files_modified: Vec<String>,
    /// `None` ends the session without an outcome
    pub outcome: Option<SessionOutcome>,
}

impl Default for SessionSpec {
    fn default() -> Self {
        Self {
            branch: "main".to_string(),
            ai_model: Some("test-model".to_string()),
            decisions: vec![],
            errors_resolved: vec![],
            files_modified: vec![],
            outcome: Some(SessionOutcome {
                tests_passing: true,
                revert_count: 0,
                compliance_score: 90.0,
            }),
        }
    }
}

/// Realistic error texts, one per broad category
pub const SAMPLE_ERRORS: [&str; 6] = [
    "TypeError: Cannot read properties of undefined (reading 'map')",
    "Error: Cannot find module './config' from src/server/index.ts",
    "connect ECONNREFUSED 127.0.0.1:5432",
    "expect(received).toBe(expected) Expected: 4 Received: 3",
    "Module not found: Can't resolve '@/components/Button'",
    "SyntaxError: Unexpected token '<' in JSON at position 0",
];

impl TestDataFactory {
    // ========================================================================
    // PERMANENT MEMORY
    // ========================================================================

    pub fn decision(memory: &MemoryStore, decision: &str) -> PermanentMemoryEntry {
        memory
            .save(NewMemory::Decision {
                decision: decision.to_string(),
                reasoning: format!("Reasoning for {}", decision),
                alternatives: vec!["Do nothing".to_string()],
                context: None,
            })
            .expect("save decision")
            .entry
    }

    pub fn mistake(memory: &MemoryStore, error: &str) -> PermanentMemoryEntry {
        memory
            .save(NewMemory::Mistake {
                error: error.to_string(),
                root_cause: "Root cause under investigation".to_string(),
                fix: "Applied the documented fix".to_string(),
                prevention: "Add a regression test".to_string(),
            })
            .expect("save mistake")
            .entry
    }

    pub fn convention(memory: &MemoryStore, convention: &str) -> PermanentMemoryEntry {
        memory
            .save(NewMemory::Convention {
                convention: convention.to_string(),
                example: None,
                rationale: None,
            })
            .expect("save convention")
            .entry
    }

    /// One mistake per entry of [`SAMPLE_ERRORS`]
    pub fn seed_sample_mistakes(memory: &MemoryStore) -> Vec<PermanentMemoryEntry> {
        SAMPLE_ERRORS
            .iter()
            .map(|error| Self::mistake(memory, error))
            .collect()
    }

    // ========================================================================
    // SESSIONS
    // ========================================================================

    /// Start a session on `branch` and persist it
    pub fn active_session(sessions: &SessionStore, branch: &str) -> SessionState {
        let session = SessionState::start(branch, Some("test-model".to_string()));
        sessions.save(&session).expect("save session")
    }

    /// Start, fill and end a session per `spec`
    pub fn completed_session(sessions: &SessionStore, spec: SessionSpec) -> SessionState {
        let mut session = SessionState::start(spec.branch, spec.ai_model);
        session.decisions = spec.decisions;
        session.errors_resolved = spec.errors_resolved;
        session.files_modified = spec.files_modified;
        let session = sessions.save(&session).expect("save session");
        sessions.end(&session.id, spec.outcome).expect("end session")
    }

    /// `count` completed sessions with the given compliance and success
    pub fn seed_completed_sessions(
        sessions: &SessionStore,
        count: usize,
        compliance_score: f64,
        tests_passing: bool,
    ) -> Vec<SessionState> {
        (0..count)
            .map(|i| {
                Self::completed_session(
                    sessions,
                    SessionSpec {
                        decisions: vec![format!("decision {}", i)],
                        outcome: Some(SessionOutcome {
                            tests_passing,
                            revert_count: 0,
                            compliance_score,
                        }),
                        ..SessionSpec::default()
                    },
                )
            })
            .collect()
    }

    pub fn observation(
        sessions: &SessionStore,
        session_id: &str,
        observation_type: ObservationType,
        title: &str,
        narrative: &str,
    ) -> SessionObservation {
        sessions
            .save_observation(NewObservation::new(
                session_id,
                observation_type,
                title,
                narrative,
            ))
            .expect("save observation")
    }

    // ========================================================================
    // EVOLUTION
    // ========================================================================

    pub fn candidate(
        tracker: &EvolutionTracker,
        candidate_type: CandidateType,
        title: &str,
        confidence: f64,
    ) -> EvolutionCandidate {
        tracker
            .propose(NewCandidate {
                candidate_type,
                title: title.to_string(),
                description: None,
                confidence,
                model_scope: None,
                evidence: vec![],
            })
            .expect("propose candidate")
    }
}
