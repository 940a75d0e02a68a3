//! UCB1 scoring for tool candidates.
//!
//! Combines router confidence with a proof-number penalty and a UCB1
//! exploration bonus, then applies learned-clause blocking. Ties break by
//! tool name so scoring is deterministic.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::index::{tool_variable, ClauseChecker, ProofIndex, ProofStatus};

/// Tunables for UCB1 scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ucb1Config {
    /// Exploration constant C (default √2)
    pub exploration_constant: f64,
    /// Weight applied to the normalised proof number (default 0.5)
    pub proof_penalty_weight: f64,
    /// Proof number at which the penalty saturates (default 100)
    pub max_proof_number: f64,
    /// Bounded bonus for tools never selected this session
    pub max_unexplored_bonus: f64,
    /// Confidence assumed for tools the router did not rank
    pub default_confidence: f64,
    /// Weight applied to a semantic-dedup similarity penalty
    pub dedup_penalty_weight: f64,
}

impl Default for Ucb1Config {
    fn default() -> Self {
        Self {
            exploration_constant: std::f64::consts::SQRT_2,
            proof_penalty_weight: 0.5,
            max_proof_number: 100.0,
            max_unexplored_bonus: 2.0,
            default_confidence: 0.5,
            dedup_penalty_weight: 1.0,
        }
    }
}

/// Score assigned to one candidate tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolScore {
    /// Tool name
    pub tool: String,
    /// Router confidence used for the base term
    pub confidence: f64,
    /// Normalised, weighted proof penalty
    pub proof_penalty: f64,
    /// UCB1 exploration bonus
    pub exploration_bonus: f64,
    /// Final score after blocking
    pub final_score: f64,
    /// Whether adopting the tool would satisfy a learned clause
    pub blocked: bool,
    /// Why, when blocked
    pub block_reason: Option<String>,
    /// Proof status, when the proof index knows the tool
    pub proof_status: Option<ProofStatus>,
}

/// Result of forced-move detection over a candidate set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForcedMove {
    /// Exactly one candidate remains viable
    pub is_forced: bool,
    /// The single viable tool, when forced
    pub forced_tool: Option<String>,
    /// Number of non-blocked candidates
    pub viable_count: usize,
    /// Names of blocked candidates, in input order
    pub blocked_tools: Vec<String>,
}

impl ForcedMove {
    /// All candidates were blocked.
    pub fn all_blocked(&self) -> bool {
        self.viable_count == 0 && !self.blocked_tools.is_empty()
    }
}

/// Per-session UCB1 scorer. Selection counts accumulate over the session.
#[derive(Debug, Clone)]
pub struct Ucb1Scorer {
    config: Ucb1Config,
    selection_counts: HashMap<String, u64>,
    total_selections: u64,
}

impl Ucb1Scorer {
    pub fn new(config: Ucb1Config) -> Self {
        Self {
            config,
            selection_counts: HashMap::new(),
            total_selections: 0,
        }
    }

    /// Record that a tool was selected.
    pub fn record_selection(&mut self, tool: &str) {
        *self.selection_counts.entry(tool.to_string()).or_insert(0) += 1;
        self.total_selections += 1;
    }

    /// Total selections this session.
    pub fn total_selections(&self) -> u64 {
        self.total_selections
    }

    /// Score candidates and sort them best-first.
    ///
    /// `confidences` maps router-ranked tools to their confidence; unranked
    /// tools fall back to the configured default. The clause checker is
    /// consulted with `base_assignment` extended by `tool:<name>=true`;
    /// blocked candidates are forced to a negative final score.
    pub fn score(
        &self,
        tools: &[String],
        confidences: &HashMap<String, f64>,
        proof_index: Option<&dyn ProofIndex>,
        clause_checker: Option<&dyn ClauseChecker>,
        base_assignment: &HashMap<String, bool>,
    ) -> Vec<ToolScore> {
        let mut scores: Vec<ToolScore> = tools
            .iter()
            .map(|tool| {
                self.score_one(tool, confidences, proof_index, clause_checker, base_assignment)
            })
            .collect();

        scores.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.tool.cmp(&b.tool))
        });
        scores
    }

    fn score_one(
        &self,
        tool: &str,
        confidences: &HashMap<String, f64>,
        proof_index: Option<&dyn ProofIndex>,
        clause_checker: Option<&dyn ClauseChecker>,
        base_assignment: &HashMap<String, bool>,
    ) -> ToolScore {
        let confidence = confidences
            .get(tool)
            .copied()
            .unwrap_or(self.config.default_confidence)
            .clamp(0.0, 1.0);

        let record = proof_index.and_then(|index| index.lookup(&tool_variable(tool)));
        let proof_penalty = match record {
            Some(record) if record.status == ProofStatus::Disproven => {
                self.config.proof_penalty_weight
            }
            Some(record) => {
                let normalised =
                    (record.proof_number as f64 / self.config.max_proof_number).min(1.0);
                normalised * self.config.proof_penalty_weight
            }
            None => 0.0,
        };

        let count = self.selection_counts.get(tool).copied().unwrap_or(0);
        let exploration_bonus = if count == 0 || self.total_selections == 0 {
            self.config.max_unexplored_bonus
        } else {
            let bonus = self.config.exploration_constant
                * ((self.total_selections as f64).ln() / count as f64).sqrt();
            bonus.min(self.config.max_unexplored_bonus)
        };

        let (blocked, block_reason) = match clause_checker {
            Some(checker) => {
                let mut assignment = base_assignment.clone();
                assignment.insert(tool_variable(tool), true);
                let verdict = checker.check(&assignment);
                (verdict.blocked, verdict.reason)
            }
            None => (false, None),
        };

        let final_score = if blocked {
            -1.0
        } else {
            (confidence - proof_penalty) + exploration_bonus
        };

        ToolScore {
            tool: tool.to_string(),
            confidence,
            proof_penalty,
            exploration_bonus,
            final_score,
            blocked,
            block_reason,
            proof_status: record.map(|r| r.status),
        }
    }
}

impl Default for Ucb1Scorer {
    fn default() -> Self {
        Self::new(Ucb1Config::default())
    }
}

/// Detect a forced move: exactly one candidate survives clause blocking.
///
/// When all candidates are blocked, `is_forced` is false and
/// [`ForcedMove::all_blocked`] is true; the caller should fall through to
/// synthesis.
pub fn check_forced_move(
    tools: &[String],
    checker: &dyn ClauseChecker,
    base_assignment: &HashMap<String, bool>,
) -> ForcedMove {
    let mut blocked_tools = Vec::new();
    let mut viable = Vec::new();
    for tool in tools {
        let mut assignment = base_assignment.clone();
        assignment.insert(tool_variable(tool), true);
        if checker.check(&assignment).blocked {
            blocked_tools.push(tool.clone());
        } else {
            viable.push(tool.clone());
        }
    }

    ForcedMove {
        is_forced: viable.len() == 1,
        forced_tool: if viable.len() == 1 {
            viable.into_iter().next()
        } else {
            None
        },
        viable_count: tools.len() - blocked_tools.len(),
        blocked_tools,
    }
}

/// Forced-move detection over already-computed scores.
pub fn forced_from_scores(scores: &[ToolScore]) -> ForcedMove {
    let blocked_tools: Vec<String> = scores
        .iter()
        .filter(|s| s.blocked)
        .map(|s| s.tool.clone())
        .collect();
    let viable: Vec<&ToolScore> = scores.iter().filter(|s| !s.blocked).collect();
    ForcedMove {
        is_forced: viable.len() == 1,
        forced_tool: if viable.len() == 1 {
            Some(viable[0].tool.clone())
        } else {
            None
        },
        viable_count: viable.len(),
        blocked_tools,
    }
}
