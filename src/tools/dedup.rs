//! Semantic deduplication of tool calls.
//!
//! The router occasionally re-proposes a tool with a lightly reworded
//! query. Signatures of past calls are kept in a bounded sliding window and
//! compared by Jaccard similarity over extracted query terms.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::RwLock;

use super::ToolInvocation;

/// Default sliding-window size for retained signatures.
pub const DEFAULT_HISTORY_CAP: usize = 100;

/// Similarity at or above which a repeat call is blocked.
const BLOCK_THRESHOLD: f64 = 0.8;
/// Similarity at or above which a repeat call is penalised.
const PENALTY_THRESHOLD: f64 = 0.3;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "of", "in", "on", "for", "to", "and", "or", "is", "are", "was", "were",
    "with", "that", "this", "it", "as", "at", "by", "from", "be",
];

/// Outcome of a semantic-dedup check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SemanticStatus {
    /// No meaningful overlap with prior calls.
    Allowed,
    /// Partial overlap; the caller should subtract a score penalty.
    Penalized { similarity: f64 },
    /// Exact or near-duplicate of a prior call.
    Blocked { reason: String },
}

impl SemanticStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Penalized { .. } => "penalized",
            Self::Blocked { .. } => "blocked",
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Signature of one past tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallSignature {
    /// Tool name
    pub tool: String,
    /// Lower-cased term set extracted from the query-like parameters
    pub terms: BTreeSet<String>,
    /// The raw query text
    pub raw_query: String,
    /// Step at which the call ran
    pub step: u32,
    /// Whether the call succeeded
    pub success: bool,
}

impl ToolCallSignature {
    /// Build a signature from an invocation's string parameters.
    pub fn from_invocation(invocation: &ToolInvocation, success: bool) -> Self {
        let raw_query = invocation.raw_query();
        Self {
            tool: invocation.tool.clone(),
            terms: extract_query_terms(&raw_query),
            raw_query,
            step: invocation.step,
            success,
        }
    }
}

/// Extract normalised terms from a query string.
///
/// Splits camelCase and common delimiters, lower-cases, and drops stop
/// words and single characters.
pub fn extract_query_terms(query: &str) -> BTreeSet<String> {
    let mut terms = BTreeSet::new();
    for token in split_tokens(query) {
        let token = token.to_lowercase();
        if token.chars().count() <= 1 {
            continue;
        }
        if STOP_WORDS.contains(&token.as_str()) {
            continue;
        }
        terms.insert(token);
    }
    terms
}

/// Split on delimiters and camelCase boundaries.
fn split_tokens(query: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for chunk in query.split(|c: char| {
        c.is_whitespace() || matches!(c, '_' | '-' | '.' | '/' | ':' | ',' | ';' | '(' | ')' | '"' | '\'')
    }) {
        if chunk.is_empty() {
            continue;
        }
        let mut current = String::new();
        let mut prev_lower = false;
        for c in chunk.chars() {
            if c.is_uppercase() && prev_lower {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = c.is_lowercase() || c.is_numeric();
            current.push(c);
        }
        if !current.is_empty() {
            tokens.push(current);
        }
    }
    tokens
}

/// Jaccard similarity of two term sets. Empty-vs-empty is 0.
pub fn jaccard_similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Bounded sliding window of tool-call signatures with semantic checks.
pub struct ToolCallHistory {
    entries: RwLock<VecDeque<ToolCallSignature>>,
    cap: usize,
}

impl ToolCallHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            cap: cap.max(1),
        }
    }

    /// Record a signature, evicting the oldest entry when full.
    pub fn record(&self, signature: ToolCallSignature) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if entries.len() == self.cap {
            entries.pop_front();
        }
        entries.push_back(signature);
    }

    /// Classify a proposed call against the retained history.
    ///
    /// An exact raw-query match (case-insensitive) on the same tool is
    /// blocked outright; otherwise the highest Jaccard similarity against
    /// prior calls of the same tool decides between blocked, penalised and
    /// allowed.
    pub fn check_semantic_status(&self, tool: &str, raw_query: &str) -> SemanticStatus {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut best_similarity = 0.0f64;
        let terms = extract_query_terms(raw_query);
        for signature in entries.iter().filter(|s| s.tool == tool) {
            if signature.raw_query.eq_ignore_ascii_case(raw_query) {
                return SemanticStatus::Blocked {
                    reason: format!("semantic duplicate of step {}", signature.step),
                };
            }
            let similarity = jaccard_similarity(&terms, &signature.terms);
            if similarity > best_similarity {
                best_similarity = similarity;
            }
        }

        if best_similarity >= BLOCK_THRESHOLD {
            SemanticStatus::Blocked {
                reason: format!("similarity {:.2} to a prior call", best_similarity),
            }
        } else if best_similarity >= PENALTY_THRESHOLD {
            SemanticStatus::Penalized {
                similarity: best_similarity,
            }
        } else {
            SemanticStatus::Allowed
        }
    }

    /// Number of retained signatures.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ToolCallHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}
