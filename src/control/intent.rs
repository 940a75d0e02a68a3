//! Intent-vs-answer classification of reasoner output.
//!
//! A model asked for an answer sometimes returns only an announcement
//! ("Let me start by examining..."). The classifier distinguishes those
//! statements of intent from real answers so the loop keeps exploring
//! instead of completing with a plan. Results are cached by FNV-1a hash.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};
use std::time::{Duration, Instant};

/// Default cache capacity.
pub const DEFAULT_INTENT_CACHE_CAP: usize = 256;

/// Default cache TTL.
pub const DEFAULT_INTENT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Content longer than this is never an intent statement.
const MAX_INTENT_LEN: usize = 500;

/// Classification outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    /// Whether the content is only a statement of intent
    pub is_intent: bool,
    /// Accumulated phrase score
    pub score: i32,
    /// Why the decision was made
    pub reason: String,
    /// Whether the result came from the cache
    pub cached: bool,
}

static NEGATIVE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Fenced code is substance.
        r"```",
        // file.rs:42 style references.
        r"\w+\.\w+:\d+",
        // Path-like inline code.
        r"`[^`\n]*/[^`\n]*`",
        r"(?i)here'?s what i found",
        r"(?i)here is what i found",
        r"(?i)based on (the |my )?analysis",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid regex"))
    .collect()
});

static SUBSTANTIVE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Numbered list.
        r"(?m)^\s*\d+\.\s",
        // Bullets.
        r"(?m)^\s*[-*]\s",
        // Markdown headers.
        r"(?m)^#{1,6}\s",
        // Bold emphasis.
        r"\*\*[^*\n]+\*\*",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid regex"))
    .collect()
});

static HIGH_CONFIDENCE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\blet me start by\b",
        r"(?i)\bi'?ll start by\b",
        r"(?i)\bi'?ll begin by\b",
        r"(?i)\bfirst,? i'?ll\b",
        r"(?i)\bfirst,? i will\b",
        r"(?i)\bto answer this,? i\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid regex"))
    .collect()
});

static MEDIUM_CONFIDENCE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\blet me\b",
        r"(?i)\bi'?ll\b",
        r"(?i)\bi will\b",
        r"(?i)\bi'?m going to\b",
        r"(?i)\bgoing to\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid regex"))
    .collect()
});

static LOW_CONFIDENCE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bwe need to\b",
        r"(?i)\bthe next step\b",
        r"(?i)\bi should\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid regex"))
    .collect()
});

static HELP_WITH_CONTENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)i'?ll help you[^:]*:\s*\S").expect("invalid regex"));

/// FNV-1a 64-bit hash, used as the cache key.
pub fn fnv1a_64(content: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for byte in content.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

struct CacheEntry {
    result: IntentResult,
    last_used: Instant,
}

/// Classifier with an LRU-bounded, TTL-limited result cache.
pub struct IntentClassifier {
    cache: RwLock<HashMap<u64, CacheEntry>>,
    cap: usize,
    ttl: Duration,
}

impl IntentClassifier {
    pub fn new() -> Self {
        Self::with_cache(DEFAULT_INTENT_CACHE_CAP, DEFAULT_INTENT_CACHE_TTL)
    }

    pub fn with_cache(cap: usize, ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            cap: cap.max(1),
            ttl,
        }
    }

    /// Classify content, serving repeats from the cache within the TTL.
    /// A hit refreshes the entry's LRU position.
    pub fn classify(&self, content: &str) -> IntentResult {
        let key = fnv1a_64(content);

        {
            let mut cache = self
                .cache
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(entry) = cache.get_mut(&key) {
                if entry.last_used.elapsed() <= self.ttl {
                    entry.last_used = Instant::now();
                    let mut result = entry.result.clone();
                    result.cached = true;
                    return result;
                }
            }
        }

        let result = classify_uncached(content);

        let mut cache = self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.retain(|_, entry| entry.last_used.elapsed() <= self.ttl);
        if cache.len() >= self.cap {
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(k, _)| *k)
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            key,
            CacheEntry {
                result: result.clone(),
                last_used: Instant::now(),
            },
        );
        result
    }

    /// Number of cached classifications.
    pub fn cache_len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_uncached(content: &str) -> IntentResult {
    let trimmed = content.trim();
    let len = trimmed.len();

    if len > MAX_INTENT_LEN {
        return not_intent(0, "length over limit");
    }

    for pattern in NEGATIVE_PATTERNS.iter() {
        if pattern.is_match(trimmed) {
            return not_intent(0, "contains substantive evidence markers");
        }
    }

    for pattern in SUBSTANTIVE_PATTERNS.iter() {
        if pattern.is_match(trimmed) {
            return not_intent(0, "contains structured content");
        }
    }

    // "I'll help you: <content>" is an answer lead-in, not a plan.
    if HELP_WITH_CONTENT.is_match(trimmed) {
        return not_intent(0, "help phrase followed by content");
    }

    let mut score = 0;
    for pattern in HIGH_CONFIDENCE.iter() {
        if pattern.is_match(trimmed) {
            score += 3;
        }
    }
    for pattern in MEDIUM_CONFIDENCE.iter() {
        if pattern.is_match(trimmed) {
            score += 2;
        }
    }
    for pattern in LOW_CONFIDENCE.iter() {
        if pattern.is_match(trimmed) {
            score += 1;
        }
    }

    let ends_with_terminal = trimmed
        .chars()
        .last()
        .map(|c| matches!(c, '.' | '!' | '?'))
        .unwrap_or(false);

    let is_intent = (score >= 3 && len < 300)
        || (score >= 4 && len < 500)
        || (score >= 2 && len < 150 && !ends_with_terminal);

    IntentResult {
        is_intent,
        score,
        reason: if is_intent {
            format!("intent phrases scored {score} in {len} chars")
        } else {
            format!("score {score} below threshold for {len} chars")
        },
        cached: false,
    }
}

fn not_intent(score: i32, reason: &str) -> IntentResult {
    IntentResult {
        is_intent: false,
        score,
        reason: reason.to_string(),
        cached: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announcement_is_intent() {
        let classifier = IntentClassifier::new();
        let result =
            classifier.classify("Let me start by examining the session module structure");
        assert!(result.is_intent, "{}", result.reason);
        assert!(result.score >= 3);
    }

    #[test]
    fn test_short_unpunctuated_plan_is_intent() {
        let classifier = IntentClassifier::new();
        let result = classifier.classify("I'll check the config loading first");
        assert!(result.is_intent, "{}", result.reason);
    }

    #[test]
    fn test_code_block_is_answer() {
        let classifier = IntentClassifier::new();
        let result =
            classifier.classify("I'll show the fix:\n```rust\nfn main() {}\n```");
        assert!(!result.is_intent);
    }

    #[test]
    fn test_file_line_reference_is_answer() {
        let classifier = IntentClassifier::new();
        let result = classifier.classify("The bug is in loop.rs:42 where the lock is held");
        assert!(!result.is_intent);
    }

    #[test]
    fn test_structured_list_is_answer() {
        let classifier = IntentClassifier::new();
        let result = classifier.classify(
            "I'll summarize:\n1. The store holds sessions\n2. The loop drives phases",
        );
        assert!(!result.is_intent);
    }

    #[test]
    fn test_long_content_is_answer() {
        let classifier = IntentClassifier::new();
        let long = "I'll explain everything about this. ".repeat(20);
        assert!(long.len() > 500);
        assert!(!classifier.classify(&long).is_intent);
    }

    #[test]
    fn test_help_with_colon_content_is_answer() {
        let classifier = IntentClassifier::new();
        let result =
            classifier.classify("I'll help you: the session store is a locked map keyed by id");
        assert!(!result.is_intent);
    }

    #[test]
    fn test_plain_answer_is_not_intent() {
        let classifier = IntentClassifier::new();
        let result = classifier
            .classify("The session store keeps handles in a read-write-locked map.");
        assert!(!result.is_intent);
    }

    #[test]
    fn test_cache_returns_identical_decision() {
        let classifier = IntentClassifier::new();
        let content = "Let me start by reading the router module";
        let first = classifier.classify(content);
        let second = classifier.classify(content);
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.is_intent, second.is_intent);
        assert_eq!(first.score, second.score);
    }

    #[test]
    fn test_cache_is_bounded() {
        let classifier = IntentClassifier::with_cache(4, Duration::from_secs(60));
        for i in 0..10 {
            classifier.classify(&format!("Let me start by checking module {i}"));
        }
        assert!(classifier.cache_len() <= 4);
    }

    #[test]
    fn test_fnv1a_known_values() {
        // Standard FNV-1a test vectors.
        assert_eq!(fnv1a_64(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64("a"), 0xaf63_dc4c_8601_ec8c);
    }
}
