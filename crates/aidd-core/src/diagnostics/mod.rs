//! Diagnostics
//!
//! Error categorization, stack-trace parsing and project health scoring.

mod categorize;
mod health;
mod stack_trace;

pub use categorize::{categorize_error, ErrorCategorization, ErrorCategory};
pub use health::{
    compute_health, HealthBreakdown, HealthReport, HealthScorer, COMPLIANCE_WEIGHT,
    CONSISTENCY_WEIGHT, NON_RECURRENCE_WEIGHT, RECOMMENDATION_THRESHOLD, SUCCESS_WEIGHT,
    UTILIZATION_WEIGHT,
};
pub use stack_trace::{parse_stack_trace, ParsedStackTrace, StackFrame};
