//! Configuration for the agent loop and its subsystems.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do when the concurrent-session cap is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapPolicy {
    /// Queue on the semaphore until a slot frees up (FIFO).
    Wait,
    /// Fail immediately with a capacity error.
    Reject,
}

/// What to do when graph initialization fails permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedPolicy {
    /// Continue with a restricted tool-set.
    Degrade,
    /// Fail the session.
    Fail,
}

/// Configuration for the agent loop.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Maximum concurrent sessions (default: 4)
    pub max_concurrent_sessions: usize,
    /// Behavior when the cap is reached
    pub cap_policy: CapPolicy,
    /// Total timeout for a single Run
    pub total_timeout: Duration,
    /// Per-request timeout for one reasoner call
    pub request_timeout: Duration,
    /// Timeout for one router tool selection
    pub router_timeout: Duration,
    /// Extended timeout for reasoner streaming
    pub stream_timeout: Duration,
    /// Maximum retries for a transient reasoner failure
    pub max_reasoner_retries: u32,
    /// Base delay for exponential backoff between retries
    pub retry_base_delay: Duration,
    /// Fixed step budget for a session
    pub total_steps: u32,
    /// Behavior when the graph provider is unavailable
    pub degraded_policy: DegradedPolicy,
    /// Ambiguity score at or above which PLAN requests clarification
    pub clarify_threshold: f64,
    /// TTL for cached tool selections
    pub selection_cache_ttl: Duration,
    /// Maximum entries in the tool-selection cache
    pub selection_cache_cap: usize,
    /// Sliding window size for the semantic-dedup history
    pub call_history_cap: usize,
    /// Extra exploration steps granted by a grounding feedback loop
    pub feedback_exploration_steps: u32,
    /// Namespace prefix for exported metrics
    pub metrics_namespace: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 4,
            cap_policy: CapPolicy::Wait,
            total_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(60),
            router_timeout: Duration::from_millis(500),
            stream_timeout: Duration::from_secs(300),
            max_reasoner_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            total_steps: 12,
            degraded_policy: DegradedPolicy::Degrade,
            clarify_threshold: 0.75,
            selection_cache_ttl: Duration::from_secs(60),
            selection_cache_cap: 1000,
            call_history_cap: 100,
            feedback_exploration_steps: 2,
            metrics_namespace: "scout".to_string(),
        }
    }
}

impl AgentConfig {
    /// Set the concurrency cap.
    pub fn with_max_concurrent_sessions(mut self, cap: usize) -> Self {
        self.max_concurrent_sessions = cap.max(1);
        self
    }

    /// Set the total Run timeout.
    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = timeout;
        self
    }

    /// Set the fixed step budget.
    pub fn with_total_steps(mut self, steps: u32) -> Self {
        self.total_steps = steps.max(1);
        self
    }

    /// Set the cap policy.
    pub fn with_cap_policy(mut self, policy: CapPolicy) -> Self {
        self.cap_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.max_concurrent_sessions, 4);
        assert_eq!(config.cap_policy, CapPolicy::Wait);
        assert_eq!(config.router_timeout, Duration::from_millis(500));
        assert_eq!(config.max_reasoner_retries, 3);
        assert_eq!(config.call_history_cap, 100);
        assert_eq!(config.selection_cache_cap, 1000);
    }

    #[test]
    fn test_builder_clamps() {
        let config = AgentConfig::default()
            .with_max_concurrent_sessions(0)
            .with_total_steps(0);
        assert_eq!(config.max_concurrent_sessions, 1);
        assert_eq!(config.total_steps, 1);
    }
}
