//! Error categorization by signature table

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Broad class of a development error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Type,
    Build,
    Runtime,
    Config,
    Dependency,
    Network,
    Test,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Type => "type",
            ErrorCategory::Build => "build",
            ErrorCategory::Runtime => "runtime",
            ErrorCategory::Config => "config",
            ErrorCategory::Dependency => "dependency",
            ErrorCategory::Network => "network",
            ErrorCategory::Test => "test",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of categorizing one error message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCategorization {
    pub category: ErrorCategory,
    /// `min(0.9, 0.3 + 0.2 * matches)`, or 0 when nothing matched
    pub confidence: f64,
    /// Signatures of the winning category that matched
    pub matched_patterns: Vec<String>,
    pub hint: String,
}

struct CategorySignatures {
    category: ErrorCategory,
    patterns: &'static [&'static str],
    hint: &'static str,
}

/// Ordered: earlier categories win ties.
const CATEGORY_TABLE: &[CategorySignatures] = &[
    CategorySignatures {
        category: ErrorCategory::Type,
        patterns: &[
            r"\bTypeError\b",
            r"is not assignable to (type|parameter)",
            r"property '.+' does not exist on type",
            r"\bTS\d{4}\b",
            r"mismatched types",
            r"expected type .+, found",
        ],
        hint: "Check the types at the reported location; a value does not have the shape the code expects.",
    },
    CategorySignatures {
        category: ErrorCategory::Build,
        patterns: &[
            r"cannot find module",
            r"module not found",
            r"failed to compile",
            r"build failed",
            r"\bSyntaxError\b",
            r"unexpected token",
            r"error\[E\d{4}\]",
        ],
        hint: "Fix the compile step first: verify import paths, file names and syntax near the first reported error.",
    },
    CategorySignatures {
        category: ErrorCategory::Runtime,
        patterns: &[
            r"\bReferenceError\b",
            r"cannot read propert(y|ies) of (undefined|null)",
            r"is not a function",
            r"null pointer",
            r"panicked at",
            r"segmentation fault",
            r"stack overflow",
            r"\bRangeError\b",
        ],
        hint: "Reproduce with the failing input and guard the value that is unexpectedly missing or invalid.",
    },
    CategorySignatures {
        category: ErrorCategory::Config,
        patterns: &[
            r"invalid configuration",
            r"config(uration)? (file )?not found",
            r"missing (required )?env(ironment)? var",
            r"\.env\b",
            r"tsconfig",
            r"unknown (option|configuration key)",
        ],
        hint: "Compare the active configuration and environment variables with what the tool documents.",
    },
    CategorySignatures {
        category: ErrorCategory::Dependency,
        patterns: &[
            r"npm ERR!",
            r"\bERESOLVE\b",
            r"peer dep(endency|s)?",
            r"version conflict",
            r"no matching version",
            r"lockfile",
            r"unable to resolve dependency",
        ],
        hint: "Inspect the dependency tree; pin or align the conflicting package versions and reinstall.",
    },
    CategorySignatures {
        category: ErrorCategory::Network,
        patterns: &[
            r"\bECONNREFUSED\b",
            r"\bETIMEDOUT\b",
            r"\bENOTFOUND\b",
            r"connection (refused|reset|timed out)",
            r"socket hang up",
            r"fetch failed",
            r"getaddrinfo",
            r"certificate",
        ],
        hint: "Confirm the target service is reachable and the host, port and TLS settings are correct.",
    },
    CategorySignatures {
        category: ErrorCategory::Test,
        patterns: &[
            r"assertion failed",
            r"\bAssertionError\b",
            r"expect\(.*\)\.",
            r"tests? failed",
            r"\bFAIL\b",
            r"snapshot",
        ],
        hint: "Read the first failing assertion; decide whether the code or the expectation is wrong.",
    },
];

const GENERIC_HINT: &str =
    "No known signature matched. Search past mistakes for similar errors and read the full stack trace.";

static COMPILED: OnceLock<Vec<Vec<Regex>>> = OnceLock::new();

fn compiled() -> &'static [Vec<Regex>] {
    COMPILED.get_or_init(|| {
        CATEGORY_TABLE
            .iter()
            .map(|entry| {
                entry
                    .patterns
                    .iter()
                    .map(|p| {
                        RegexBuilder::new(p)
                            .case_insensitive(true)
                            .build()
                            .expect("category signatures are valid regex literals")
                    })
                    .collect()
            })
            .collect()
    })
}

/// Pick the category with the most matching signatures; ties go to the
/// earlier category in the table.
pub fn categorize_error(message: &str) -> ErrorCategorization {
    let mut best: Option<(usize, Vec<String>)> = None;

    for (idx, regexes) in compiled().iter().enumerate() {
        let matched: Vec<String> = regexes
            .iter()
            .filter(|re| re.is_match(message))
            .map(|re| re.as_str().to_string())
            .collect();
        if matched.is_empty() {
            continue;
        }
        let better = best
            .as_ref()
            .map(|(_, current)| matched.len() > current.len())
            .unwrap_or(true);
        if better {
            best = Some((idx, matched));
        }
    }

    match best {
        Some((idx, matched_patterns)) => {
            let entry = &CATEGORY_TABLE[idx];
            ErrorCategorization {
                category: entry.category,
                confidence: (0.3 + 0.2 * matched_patterns.len() as f64).min(0.9),
                matched_patterns,
                hint: entry.hint.to_string(),
            }
        }
        None => ErrorCategorization {
            category: ErrorCategory::Unknown,
            confidence: 0.0,
            matched_patterns: Vec::new(),
            hint: GENERIC_HINT.to_string(),
        },
    }
}
