//! Read-only views of the external reasoning index.
//!
//! Learned clauses and proof numbers are produced by an external reasoning
//! layer; the core only consults them. The clause checker answers "would
//! this assignment satisfy a learned clause" and carries the generation
//! counter used to invalidate cached tool selections.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::session::ToolHistoryEntry;

/// Proof search status for a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofStatus {
    Proven,
    Disproven,
    Unknown,
    Expanded,
}

impl std::fmt::Display for ProofStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Proven => "proven",
            Self::Disproven => "disproven",
            Self::Unknown => "unknown",
            Self::Expanded => "expanded",
        };
        write!(f, "{}", s)
    }
}

/// Proof record for one variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProofRecord {
    /// Cost estimate; higher means harder to prove the tool will succeed
    pub proof_number: u32,
    /// Search status
    pub status: ProofStatus,
}

/// Verdict from the clause checker for one assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClauseVerdict {
    /// Whether the assignment satisfies a learned clause
    pub blocked: bool,
    /// Why, when blocked
    pub reason: Option<String>,
}

impl ClauseVerdict {
    pub fn allowed() -> Self {
        Self {
            blocked: false,
            reason: None,
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            reason: Some(reason.into()),
        }
    }
}

/// Read-only clause checker.
pub trait ClauseChecker: Send + Sync {
    /// Whether the assignment satisfies any learned clause.
    fn check(&self, assignment: &HashMap<String, bool>) -> ClauseVerdict;

    /// Current clause-set generation. Bumped whenever the clause set
    /// changes; cached selections from older generations are invalid.
    fn generation(&self) -> u64;
}

/// Read-only proof index.
pub trait ProofIndex: Send + Sync {
    /// Proof record for a variable, if known.
    fn lookup(&self, variable: &str) -> Option<ProofRecord>;
}

/// The boolean variable name for "tool X was adopted".
pub fn tool_variable(tool: &str) -> String {
    format!("tool:{tool}")
}

/// Build the base assignment from a session's step history: each completed
/// tool contributes `tool:<name>=true` plus an outcome variable.
pub fn step_assignment(history: &[ToolHistoryEntry]) -> HashMap<String, bool> {
    let mut assignment = HashMap::new();
    for entry in history {
        assignment.insert(tool_variable(&entry.tool), true);
        assignment.insert(format!("outcome:{}:success", entry.tool), entry.success);
    }
    assignment
}
