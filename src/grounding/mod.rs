//! Post-synthesis grounding verification.
//!
//! A drafted answer is re-checked against the evidence actually collected.
//! Violations drive an escalating retry ladder and, at the top, a targeted
//! exploration feedback loop. The verifier never aborts a session; it
//! returns a structured result the EXECUTE phase acts on.

mod checkers;
mod verifier;

pub use checkers::{
    check_language_confusion, check_phantom_files, check_structural_claims, extract_file_refs,
    EvidenceIndex,
};
pub use verifier::{
    feedback_questions, GroundingVerification, GroundingVerifier, Strictness,
};

use serde::{Deserialize, Serialize};

/// Kind of grounding violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// The answer references a file never observed in tool output
    PhantomFile,
    /// A claim about directory/module layout without structural evidence
    StructuralClaim,
    /// Constructs or idioms of a language the project does not use
    LanguageConfusion,
    /// Boilerplate pattern claims unsupported by evidence
    GenericPattern,
    /// Any other ungrounded claim
    Ungrounded,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PhantomFile => "phantom_file",
            Self::StructuralClaim => "structural_claim",
            Self::LanguageConfusion => "language_confusion",
            Self::GenericPattern => "generic_pattern",
            Self::Ungrounded => "ungrounded",
        };
        write!(f, "{}", s)
    }
}

/// Severity of a violation. Critical and high fail verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Whether this severity fails verification.
    pub fn is_failing(&self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }
}

/// One grounding violation found in a drafted answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    /// What is wrong
    pub message: String,
    /// The offending text or term
    pub evidence: String,
    /// How to fix it
    pub suggestion: String,
    /// Phase label at detection time
    pub phase: String,
    /// Retry count when the violation was found
    pub retry_count: u32,
}

impl Violation {
    pub fn new(
        kind: ViolationKind,
        severity: Severity,
        message: impl Into<String>,
        evidence: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            evidence: evidence.into(),
            suggestion: String::new(),
            phase: String::new(),
            retry_count: 0,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = suggestion.into();
        self
    }

    pub fn in_phase(mut self, phase: impl Into<String>, retry_count: u32) -> Self {
        self.phase = phase.into();
        self.retry_count = retry_count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_thresholds() {
        assert!(Severity::Critical.is_failing());
        assert!(Severity::High.is_failing());
        assert!(!Severity::Medium.is_failing());
        assert!(!Severity::Low.is_failing());
        assert!(Severity::Critical > Severity::High);
    }
}
