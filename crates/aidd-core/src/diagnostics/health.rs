//! Project Health Scoring
//!
//! Five 0-100 sub-scores over the most recent completed sessions, combined
//! with fixed weights into one composite.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::memory::{MemoryContent, MemoryKind, MemoryStore, MistakeMemory};
use crate::session::{SessionState, SessionStore};
use crate::storage::{Result, Storage};

pub const SUCCESS_WEIGHT: f64 = 0.30;
pub const COMPLIANCE_WEIGHT: f64 = 0.25;
pub const NON_RECURRENCE_WEIGHT: f64 = 0.15;
pub const CONSISTENCY_WEIGHT: f64 = 0.15;
pub const UTILIZATION_WEIGHT: f64 = 0.15;

/// Sub-scores below this produce a recommendation
pub const RECOMMENDATION_THRESHOLD: f64 = 60.0;

const NEUTRAL_SCORE: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthBreakdown {
    /// Sessions with passing tests and no reverts, among those with an outcome
    pub success_rate: f64,
    /// Mean compliance score
    pub compliance: f64,
    /// Share of mistakes that did not recur
    pub non_recurrence: f64,
    /// 100 minus the mean per-model compliance spread
    pub consistency: f64,
    /// Sessions that recorded a decision or resolved an error
    pub utilization: f64,
}

impl HealthBreakdown {
    /// Weighted composite, rounded to an integer
    pub fn composite(&self) -> u32 {
        let raw = SUCCESS_WEIGHT * self.success_rate
            + COMPLIANCE_WEIGHT * self.compliance
            + NON_RECURRENCE_WEIGHT * self.non_recurrence
            + CONSISTENCY_WEIGHT * self.consistency
            + UTILIZATION_WEIGHT * self.utilization;
        raw.round().clamp(0.0, 100.0) as u32
    }

    fn recommendations(&self) -> Vec<String> {
        let mut recs = Vec::new();
        if self.success_rate < RECOMMENDATION_THRESHOLD {
            recs.push(format!(
                "Session success rate is {:.0}%. Run the test suite before ending a session and avoid reverting work.",
                self.success_rate
            ));
        }
        if self.compliance < RECOMMENDATION_THRESHOLD {
            recs.push(format!(
                "Average compliance is {:.0}. Review the project rules that audits flag most often.",
                self.compliance
            ));
        }
        if self.non_recurrence < RECOMMENDATION_THRESHOLD {
            recs.push(
                "Mistakes keep recurring. Turn their prevention notes into conventions or rules."
                    .to_string(),
            );
        }
        if self.consistency < RECOMMENDATION_THRESHOLD {
            recs.push(
                "Compliance varies widely per model. Compare audits by model and tighten instructions for the weakest."
                    .to_string(),
            );
        }
        if self.utilization < RECOMMENDATION_THRESHOLD {
            recs.push(
                "Few sessions record decisions or resolved errors. Capture them so later sessions can reuse them."
                    .to_string(),
            );
        }
        if recs.is_empty() {
            recs.push("Project health looks good. Keep recording decisions and mistakes.".to_string());
        }
        recs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// 0-100
    pub score: u32,
    pub breakdown: HealthBreakdown,
    pub sessions_considered: usize,
    pub mistakes_considered: usize,
    pub recommendations: Vec<String>,
}

/// Score a window of completed sessions against the stored mistakes.
pub fn compute_health(sessions: &[SessionState], mistakes: &[MistakeMemory]) -> HealthReport {
    let with_outcome: Vec<_> = sessions
        .iter()
        .filter_map(|s| s.outcome.map(|o| (s, o)))
        .collect();

    let success_rate = if with_outcome.is_empty() {
        NEUTRAL_SCORE
    } else {
        let ok = with_outcome.iter().filter(|(_, o)| o.is_success()).count();
        ok as f64 / with_outcome.len() as f64 * 100.0
    };

    let compliance = if with_outcome.is_empty() {
        NEUTRAL_SCORE
    } else {
        with_outcome
            .iter()
            .map(|(_, o)| o.compliance_score)
            .sum::<f64>()
            / with_outcome.len() as f64
    };

    let non_recurrence = if mistakes.is_empty() {
        100.0
    } else {
        let recurring = mistakes.iter().filter(|m| m.occurrences > 1).count();
        (1.0 - recurring as f64 / mistakes.len() as f64) * 100.0
    };

    let mut per_model: HashMap<&str, Vec<f64>> = HashMap::new();
    for (session, outcome) in &with_outcome {
        if let Some(model) = session.ai_model.as_deref() {
            per_model.entry(model).or_default().push(outcome.compliance_score);
        }
    }
    let consistency = if per_model.is_empty() {
        100.0
    } else {
        let spreads: f64 = per_model
            .values()
            .map(|scores| {
                if scores.len() < 2 {
                    0.0
                } else {
                    population_std_dev(scores)
                }
            })
            .sum();
        (100.0 - spreads / per_model.len() as f64).max(0.0)
    };

    let utilization = if sessions.is_empty() {
        0.0
    } else {
        let used = sessions
            .iter()
            .filter(|s| !s.decisions.is_empty() || !s.errors_resolved.is_empty())
            .count();
        used as f64 / sessions.len() as f64 * 100.0
    };

    let breakdown = HealthBreakdown {
        success_rate,
        compliance,
        non_recurrence,
        consistency,
        utilization,
    };

    HealthReport {
        score: breakdown.composite(),
        recommendations: breakdown.recommendations(),
        breakdown,
        sessions_considered: sessions.len(),
        mistakes_considered: mistakes.len(),
    }
}

fn population_std_dev(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

/// Reads sessions and mistakes from storage and scores them
pub struct HealthScorer {
    sessions: SessionStore,
    memory: MemoryStore,
}

impl HealthScorer {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            sessions: SessionStore::new(Arc::clone(&storage)),
            memory: MemoryStore::new(storage),
        }
    }

    /// Health over the last `window` completed sessions
    pub fn score(&self, window: usize) -> Result<HealthReport> {
        let sessions = self.sessions.recent_completed(window)?;
        let mistakes: Vec<MistakeMemory> = self
            .memory
            .list(Some(MemoryKind::Mistake))?
            .into_iter()
            .filter_map(|entry| match entry.content {
                MemoryContent::Mistake(m) => Some(m),
                _ => None,
            })
            .collect();

        Ok(compute_health(&sessions, &mistakes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionOutcome;
    use chrono::Utc;

    fn session(model: &str, tests_passing: bool, reverts: u32, compliance: f64) -> SessionState {
        let mut s = SessionState::start("main", Some(model.to_string()));
        s.ended_at = Some(Utc::now());
        s.decisions.push("d".into());
        s.outcome = Some(SessionOutcome {
            tests_passing,
            revert_count: reverts,
            compliance_score: compliance,
        });
        s
    }

    fn mistake(occurrences: u32) -> MistakeMemory {
        MistakeMemory {
            error: "e".into(),
            root_cause: String::new(),
            fix: String::new(),
            prevention: String::new(),
            occurrences,
            last_seen_at: Utc::now(),
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        let sum = SUCCESS_WEIGHT
            + COMPLIANCE_WEIGHT
            + NON_RECURRENCE_WEIGHT
            + CONSISTENCY_WEIGHT
            + UTILIZATION_WEIGHT;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_composite_extremes() {
        let all = |v: f64| HealthBreakdown {
            success_rate: v,
            compliance: v,
            non_recurrence: v,
            consistency: v,
            utilization: v,
        };
        assert_eq!(all(100.0).composite(), 100);
        assert_eq!(all(0.0).composite(), 0);
    }

    #[test]
    fn test_empty_history_defaults() {
        let report = compute_health(&[], &[]);
        assert_eq!(report.breakdown.success_rate, 50.0);
        assert_eq!(report.breakdown.compliance, 50.0);
        assert_eq!(report.breakdown.non_recurrence, 100.0);
        assert_eq!(report.breakdown.consistency, 100.0);
        assert_eq!(report.breakdown.utilization, 0.0);
        // 15 + 12.5 + 15 + 15 + 0
        assert_eq!(report.score, 58);
        assert_eq!(report.recommendations.len(), 3);
    }

    #[test]
    fn test_perfect_history_gets_positive_message() {
        let sessions = vec![
            session("model-a", true, 0, 100.0),
            session("model-a", true, 0, 100.0),
        ];
        let report = compute_health(&sessions, &[mistake(1)]);
        assert_eq!(report.score, 100);
        assert_eq!(report.recommendations.len(), 1);
        assert!(report.recommendations[0].contains("looks good"));
    }

    #[test]
    fn test_sub_scores() {
        let mut idle = session("model-b", true, 0, 80.0);
        idle.decisions.clear();
        let sessions = vec![
            session("model-a", true, 0, 90.0),
            session("model-a", false, 0, 70.0),
            session("model-a", true, 2, 80.0),
            idle,
        ];
        let report = compute_health(&sessions, &[mistake(1), mistake(3)]);
        let b = report.breakdown;

        assert_eq!(b.success_rate, 50.0);
        assert_eq!(b.compliance, 80.0);
        assert_eq!(b.non_recurrence, 50.0);
        assert_eq!(b.utilization, 75.0);
        // model-a spread = sqrt(200/3) ~ 8.165, model-b has one sample and counts as 0
        let expected = 100.0 - (200.0f64 / 3.0).sqrt() / 2.0;
        assert!((b.consistency - expected).abs() < 1e-9);
    }

    #[test]
    fn test_consistency_floors_at_zero() {
        let sessions = vec![
            session("wild", true, 0, 0.0),
            session("wild", true, 0, 100.0),
        ];
        let report = compute_health(&sessions, &[]);
        // spread is 50
        assert_eq!(report.breakdown.consistency, 50.0);

        let sessions = vec![
            session("wild", true, 0, 0.0),
            session("wild", true, 0, 300.0),
        ];
        let report = compute_health(&sessions, &[]);
        assert_eq!(report.breakdown.consistency, 0.0);
    }
}
