//! Prometheus metric families for the agent core.
//!
//! All families live under a configurable namespace. The registry is
//! in-process; exporting it over HTTP is the embedder's concern.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Metric families emitted by routing, UCB1 scoring, caching and
/// streaming. Fields are public so call sites record directly.
#[derive(Clone)]
pub struct CoreMetrics {
    pub routing_latency: HistogramVec,
    pub routing_confidence: HistogramVec,
    pub routing_selections: IntCounterVec,
    pub routing_fallbacks: IntCounterVec,
    pub routing_errors: IntCounterVec,
    pub routing_warmup_duration: HistogramVec,
    pub routing_warmup_total: IntCounterVec,
    pub routing_init_total: IntCounterVec,

    pub ucb1_selection_score: HistogramVec,
    pub ucb1_proof_penalty: HistogramVec,
    pub ucb1_exploration_bonus: HistogramVec,
    pub ucb1_blocked_selections_total: IntCounterVec,
    pub ucb1_forced_moves_total: IntCounterVec,
    pub ucb1_all_blocked_total: IntCounter,
    pub ucb1_cache_hits_total: IntCounter,
    pub ucb1_cache_misses_total: IntCounter,
    pub ucb1_cache_invalidations_total: IntCounterVec,

    pub stream_tokens_total: IntCounterVec,
    pub stream_duration_seconds: HistogramVec,
    pub stream_errors_total: IntCounterVec,
}

/// Restrict a namespace to characters prometheus accepts.
fn sanitize_namespace(namespace: &str) -> String {
    let cleaned: String = namespace
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if cleaned.is_empty() || cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        format!("scout{cleaned}")
    } else {
        cleaned
    }
}

impl CoreMetrics {
    fn build(namespace: &str) -> std::result::Result<Self, prometheus::Error> {
        let ns = sanitize_namespace(namespace);
        let histogram = |name: &str, help: &str, labels: &[&str]| {
            HistogramVec::new(HistogramOpts::new(name, help).namespace(ns.clone()), labels)
        };
        let counter_vec = |name: &str, help: &str, labels: &[&str]| {
            IntCounterVec::new(Opts::new(name, help).namespace(ns.clone()), labels)
        };

        Ok(Self {
            routing_latency: histogram(
                "routing_latency_seconds",
                "Tool selection latency",
                &["model", "status"],
            )?,
            routing_confidence: histogram(
                "routing_confidence",
                "Router confidence distribution",
                &["model"],
            )?,
            routing_selections: counter_vec(
                "routing_selections_total",
                "Tool selections by the router",
                &["model", "tool"],
            )?,
            routing_fallbacks: counter_vec(
                "routing_fallbacks_total",
                "Router fallbacks",
                &["model", "reason"],
            )?,
            routing_errors: counter_vec(
                "routing_errors_total",
                "Router errors",
                &["model", "error_type"],
            )?,
            routing_warmup_duration: histogram(
                "routing_warmup_duration_seconds",
                "Model warmup duration",
                &["model"],
            )?,
            routing_warmup_total: counter_vec(
                "routing_warmup_total",
                "Model warmup attempts",
                &["model", "status"],
            )?,
            routing_init_total: counter_vec(
                "routing_init_total",
                "Model initialization outcomes",
                &["model", "status", "reason"],
            )?,
            ucb1_selection_score: histogram(
                "ucb1_selection_score",
                "Final UCB1 scores of selected tools",
                &["tool"],
            )?,
            ucb1_proof_penalty: histogram(
                "ucb1_proof_penalty",
                "Proof penalties applied during scoring",
                &["tool"],
            )?,
            ucb1_exploration_bonus: histogram(
                "ucb1_exploration_bonus",
                "Exploration bonuses applied during scoring",
                &["tool"],
            )?,
            ucb1_blocked_selections_total: counter_vec(
                "ucb1_blocked_selections_total",
                "Candidates blocked by learned clauses",
                &["tool", "reason_type"],
            )?,
            ucb1_forced_moves_total: counter_vec(
                "ucb1_forced_moves_total",
                "Forced moves taken without router consultation",
                &["tool"],
            )?,
            ucb1_all_blocked_total: IntCounter::with_opts(
                Opts::new("ucb1_all_blocked_total", "All candidates blocked")
                    .namespace(ns.clone()),
            )?,
            ucb1_cache_hits_total: IntCounter::with_opts(
                Opts::new("ucb1_cache_hits_total", "Selection cache hits").namespace(ns.clone()),
            )?,
            ucb1_cache_misses_total: IntCounter::with_opts(
                Opts::new("ucb1_cache_misses_total", "Selection cache misses")
                    .namespace(ns.clone()),
            )?,
            ucb1_cache_invalidations_total: counter_vec(
                "ucb1_cache_invalidations_total",
                "Selection cache invalidations",
                &["reason"],
            )?,
            stream_tokens_total: counter_vec(
                "stream_tokens_total",
                "Tokens delivered by streaming calls",
                &["model"],
            )?,
            stream_duration_seconds: histogram(
                "stream_duration_seconds",
                "Streaming call duration",
                &["model"],
            )?,
            stream_errors_total: counter_vec(
                "stream_errors_total",
                "Streaming call errors",
                &["model", "error_class"],
            )?,
        })
    }

    /// Build the families and register them all on `registry`.
    pub fn register(namespace: &str, registry: &Registry) -> Result<Arc<Self>> {
        let metrics =
            Self::build(namespace).map_err(|e| Error::Internal(format!("metrics: {e}")))?;
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(metrics.routing_latency.clone()),
            Box::new(metrics.routing_confidence.clone()),
            Box::new(metrics.routing_selections.clone()),
            Box::new(metrics.routing_fallbacks.clone()),
            Box::new(metrics.routing_errors.clone()),
            Box::new(metrics.routing_warmup_duration.clone()),
            Box::new(metrics.routing_warmup_total.clone()),
            Box::new(metrics.routing_init_total.clone()),
            Box::new(metrics.ucb1_selection_score.clone()),
            Box::new(metrics.ucb1_proof_penalty.clone()),
            Box::new(metrics.ucb1_exploration_bonus.clone()),
            Box::new(metrics.ucb1_blocked_selections_total.clone()),
            Box::new(metrics.ucb1_forced_moves_total.clone()),
            Box::new(metrics.ucb1_all_blocked_total.clone()),
            Box::new(metrics.ucb1_cache_hits_total.clone()),
            Box::new(metrics.ucb1_cache_misses_total.clone()),
            Box::new(metrics.ucb1_cache_invalidations_total.clone()),
            Box::new(metrics.stream_tokens_total.clone()),
            Box::new(metrics.stream_duration_seconds.clone()),
            Box::new(metrics.stream_errors_total.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .map_err(|e| Error::Internal(format!("metrics: {e}")))?;
        }
        Ok(Arc::new(metrics))
    }

    /// Families backed by a private registry. Used by tests and by callers
    /// that do not export metrics.
    pub fn standalone(namespace: &str) -> Self {
        // Sanitized names are always valid metric specs.
        Self::build(namespace).expect("valid metric options")
    }
}

impl std::fmt::Debug for CoreMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CoreMetrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_sanitized() {
        assert_eq!(sanitize_namespace("scout"), "scout");
        assert_eq!(sanitize_namespace("my.agent"), "myagent");
        assert_eq!(sanitize_namespace(""), "scout");
        assert_eq!(sanitize_namespace("9lives"), "scout9lives");
    }

    #[test]
    fn test_register_exposes_families() {
        let registry = Registry::new();
        let metrics = CoreMetrics::register("testns", &registry).unwrap();
        metrics
            .routing_selections
            .with_label_values(&["router-model", "grep"])
            .inc();
        metrics.ucb1_all_blocked_total.inc();

        let families = registry.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"testns_routing_selections_total"));
        assert!(names.contains(&"testns_ucb1_all_blocked_total"));
    }

    #[test]
    fn test_standalone_usable_without_registry() {
        let metrics = CoreMetrics::standalone("test");
        metrics
            .stream_tokens_total
            .with_label_values(&["m"])
            .inc_by(5);
        assert_eq!(
            metrics.stream_tokens_total.with_label_values(&["m"]).get(),
            5
        );
    }
}
