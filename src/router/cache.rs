//! Transposition cache for tool selections.
//!
//! Keyed by a state key derived from the ordered (tool, outcome) sequence
//! plus the clause-set generation. An entry is valid only while its
//! generation matches the checker's current generation and its age is
//! within the TTL. Hit/miss/invalidation counters are lock-free atomics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use crate::session::ToolHistoryEntry;

/// Default maximum number of cached selections.
pub const DEFAULT_CACHE_CAP: usize = 1000;

/// Deterministic key for (ordered step sequence, generation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey(pub String);

impl StateKey {
    /// Build a key from ordered (tool, success) pairs and the generation.
    pub fn build(steps: &[(String, bool)], generation: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(format!("g{generation}|").as_bytes());
        for (tool, success) in steps {
            hasher.update(tool.as_bytes());
            hasher.update(if *success { b"=ok;;" as &[u8] } else { b"=err;" as &[u8] });
        }
        let hash = hasher.finalize();
        StateKey(format!("{:x}", hash))
    }

    /// Build a key from a session's tool history.
    pub fn from_history(history: &[ToolHistoryEntry], generation: u64) -> Self {
        let steps: Vec<(String, bool)> = history
            .iter()
            .map(|entry| (entry.tool.clone(), entry.success))
            .collect();
        Self::build(&steps, generation)
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form for logs.
        write!(f, "{}", &self.0[..16.min(self.0.len())])
    }
}

/// A cached router selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSelection {
    /// Selected tool
    pub tool: String,
    /// Final UCB1 score at caching time
    pub score: f64,
    /// When the entry was cached
    pub cached_at: DateTime<Utc>,
    /// Clause-set generation at caching time
    pub generation: u64,
}

/// Counters for cache behaviour.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

/// Bounded TTL cache of tool selections.
pub struct SelectionCache {
    entries: RwLock<HashMap<String, CachedSelection>>,
    ttl: Duration,
    cap: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl SelectionCache {
    pub fn new(ttl: Duration, cap: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            cap: cap.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Look up a selection. Returns a hit only when the entry's generation
    /// matches `current_generation` and its age is within the TTL; stale
    /// entries are removed and counted as invalidations.
    pub fn get(&self, key: &StateKey, current_generation: u64) -> Option<CachedSelection> {
        let stale = {
            let entries = self
                .entries
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match entries.get(&key.0) {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) => {
                    let age = Utc::now() - entry.cached_at;
                    let expired = age.to_std().map(|a| a > self.ttl).unwrap_or(true);
                    if entry.generation == current_generation && !expired {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(key = %key, tool = %entry.tool, "selection cache hit");
                        return Some(entry.clone());
                    }
                    true
                }
            }
        };

        if stale {
            let mut entries = self
                .entries
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries.remove(&key.0);
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Insert a selection, evicting the oldest entry when at capacity.
    /// The O(n) oldest scan is acceptable at the default 1000-entry cap.
    pub fn insert(&self, key: StateKey, selection: CachedSelection) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if entries.len() >= self.cap && !entries.contains_key(&key.0) {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.cached_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(key.0, selection);
    }

    /// Drop all entries from generations older than `current_generation`.
    pub fn invalidate_generation(&self, current_generation: u64) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| entry.generation == current_generation);
        let removed = (before - entries.len()) as u64;
        if removed > 0 {
            self.invalidations.fetch_add(removed, Ordering::Relaxed);
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> SelectionCacheStats {
        SelectionCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    /// Number of live entries.
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

impl Default for SelectionCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), DEFAULT_CACHE_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection(tool: &str, generation: u64) -> CachedSelection {
        CachedSelection {
            tool: tool.to_string(),
            score: 1.0,
            cached_at: Utc::now(),
            generation,
        }
    }

    #[test]
    fn test_state_key_deterministic() {
        let steps = vec![("grep".to_string(), true), ("symbols".to_string(), false)];
        assert_eq!(StateKey::build(&steps, 7), StateKey::build(&steps, 7));
    }

    #[test]
    fn test_state_key_varies_with_sequence_and_generation() {
        let steps = vec![("grep".to_string(), true)];
        let reordered = vec![("grep".to_string(), false)];
        assert_ne!(StateKey::build(&steps, 1), StateKey::build(&reordered, 1));
        assert_ne!(StateKey::build(&steps, 1), StateKey::build(&steps, 2));
        assert_ne!(
            StateKey::build(&[], 1),
            StateKey::build(&[("grep".to_string(), true)], 1)
        );
    }

    #[test]
    fn test_hit_requires_matching_generation() {
        let cache = SelectionCache::default();
        let key = StateKey::build(&[], 1);
        cache.insert(key.clone(), selection("grep", 1));

        assert!(cache.get(&key, 1).is_some());
        // Generation moved on: entry is invalidated, not served.
        assert!(cache.get(&key, 2).is_none());
        assert!(cache.get(&key, 1).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.invalidations, 1);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = SelectionCache::new(Duration::ZERO, 10);
        let key = StateKey::build(&[], 1);
        let mut entry = selection("grep", 1);
        entry.cached_at = Utc::now() - chrono::Duration::seconds(5);
        cache.insert(key.clone(), entry);

        assert!(cache.get(&key, 1).is_none());
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_eviction_at_capacity() {
        let cache = SelectionCache::new(Duration::from_secs(60), 2);
        let old = StateKey::build(&[("a".to_string(), true)], 1);
        let mut old_entry = selection("a", 1);
        old_entry.cached_at = Utc::now() - chrono::Duration::seconds(30);
        cache.insert(old.clone(), old_entry);
        cache.insert(StateKey::build(&[("b".to_string(), true)], 1), selection("b", 1));
        cache.insert(StateKey::build(&[("c".to_string(), true)], 1), selection("c", 1));

        assert_eq!(cache.len(), 2);
        // The oldest entry was evicted.
        assert!(cache.get(&old, 1).is_none());
    }

    #[test]
    fn test_invalidate_generation() {
        let cache = SelectionCache::default();
        cache.insert(StateKey::build(&[], 1), selection("a", 1));
        cache.insert(
            StateKey::build(&[("b".to_string(), true)], 2),
            selection("b", 2),
        );
        cache.invalidate_generation(2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().invalidations, 1);
    }
}
