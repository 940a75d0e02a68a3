//! Verification driver: strictness ladder and feedback-question
//! generation.

use serde::{Deserialize, Serialize};

use super::checkers::{
    check_language_confusion, check_phantom_files, check_structural_claims, EvidenceIndex,
};
#[cfg(test)]
use super::Severity;
use super::{Violation, ViolationKind};

/// Prompt strictness keyed by retry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    /// Retry 0: the original prompt.
    Normal,
    /// Retry 1: violations prepended as bulleted guidance.
    Elevated,
    /// Retry 2: explicit AVOID list and REQUIREMENTS enumeration.
    High,
    /// Retry ≥3: stop retrying; run a targeted exploration round instead.
    Feedback,
}

impl Strictness {
    pub fn from_retry(retry_count: u32) -> Self {
        match retry_count {
            0 => Self::Normal,
            1 => Self::Elevated,
            2 => Self::High,
            _ => Self::Feedback,
        }
    }
}

/// Structured outcome of one verification pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundingVerification {
    /// No critical or high violation was found
    pub passed: bool,
    /// All violations, most severe first
    pub violations: Vec<Violation>,
    /// Strictness for the next retry, from the current retry count
    pub strictness: Strictness,
    /// Targeted exploration questions, populated at Feedback strictness
    pub feedback_questions: Vec<String>,
}

/// Re-checks drafted answers against collected evidence.
#[derive(Debug, Clone, Default)]
pub struct GroundingVerifier;

impl GroundingVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Run the post-synthesis checker subset (structural-claim,
    /// phantom-file, language-confusion) against (answer, evidence).
    ///
    /// Never aborts: the caller chooses retry, escalate or feedback based
    /// on the returned result.
    pub fn verify(
        &self,
        answer: &str,
        evidence: &EvidenceIndex,
        phase: &str,
        retry_count: u32,
    ) -> GroundingVerification {
        let mut violations = Vec::new();
        violations.extend(check_phantom_files(answer, evidence));
        violations.extend(check_structural_claims(answer, evidence));
        violations.extend(check_language_confusion(answer, evidence));
        for violation in &mut violations {
            violation.phase = phase.to_string();
            violation.retry_count = retry_count;
        }
        violations.sort_by(|a, b| b.severity.cmp(&a.severity));

        let passed = !violations.iter().any(|v| v.severity.is_failing());
        let strictness = Strictness::from_retry(retry_count);
        let feedback_questions = if !passed && strictness == Strictness::Feedback {
            feedback_questions(&violations)
        } else {
            Vec::new()
        };

        GroundingVerification {
            passed,
            violations,
            strictness,
            feedback_questions,
        }
    }

    /// Build the retry prompt for a strictness level.
    pub fn escalated_prompt(
        &self,
        base_prompt: &str,
        violations: &[Violation],
        strictness: Strictness,
    ) -> String {
        match strictness {
            Strictness::Normal | Strictness::Feedback => base_prompt.to_string(),
            Strictness::Elevated => {
                let mut prompt = String::from(
                    "Your previous answer had grounding problems. Address each point:\n",
                );
                for violation in violations {
                    prompt.push_str(&format!("- {}\n", violation.message));
                }
                prompt.push('\n');
                prompt.push_str(base_prompt);
                prompt
            }
            Strictness::High => {
                let mut prompt = String::from("AVOID:\n");
                for violation in violations {
                    prompt.push_str(&format!("- {}\n", violation.evidence));
                }
                prompt.push_str(
                    "\nREQUIREMENTS:\n\
                     1. Cite only files that appear in the collected tool output.\n\
                     2. Make no claims about structure you have not observed.\n\
                     3. Use the project's own language and terminology.\n\
                     4. State uncertainty instead of inventing details.\n\n",
                );
                prompt.push_str(base_prompt);
                prompt
            }
        }
    }
}

/// Violation-kind-directed exploration questions, de-duplicated. Always
/// returns at least one question.
pub fn feedback_questions(violations: &[Violation]) -> Vec<String> {
    let mut questions = Vec::new();
    for violation in violations {
        let question = match violation.kind {
            ViolationKind::PhantomFile => format!(
                "find the actual location of functionality related to: {}",
                violation.evidence
            ),
            ViolationKind::StructuralClaim => {
                "use ls/tree to explore the actual directory structure".to_string()
            }
            ViolationKind::LanguageConfusion => format!(
                "identify the actual patterns used instead of: {}",
                violation.evidence
            ),
            ViolationKind::GenericPattern => {
                "search for the specific implementation details".to_string()
            }
            ViolationKind::Ungrounded => {
                format!("verify the claim about: {}", violation.evidence)
            }
        };
        if !questions.contains(&question) {
            questions.push(question);
        }
    }
    if questions.is_empty() {
        questions.push("gather concrete evidence for the answer's main claims".to_string());
    }
    questions
}
