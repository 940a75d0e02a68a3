//! Tool contract: specs, typed parameters, invocations, results.
//!
//! The core implements no tool. Exploration tools (file search, symbol
//! graph, grep, ...) are external collaborators plugged in through
//! [`ToolAdapter`]; this module owns only the boundary types.

mod dedup;

pub use dedup::{
    extract_query_terms, jaccard_similarity, SemanticStatus, ToolCallHistory, ToolCallSignature,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;

/// Name of the pseudo-tool that signals synthesis.
///
/// When the router selects `ANSWER_TOOL`, the EXECUTE phase stops invoking
/// tools and asks the reasoner for the final answer instead. Every other
/// tool name selects a real invocation through a [`ToolAdapter`].
pub const ANSWER_TOOL: &str = "answer";

/// Static description of a tool, shown to the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name
    pub name: String,
    /// What the tool does
    pub description: String,
    /// Hints about the query shapes the tool is best for
    pub best_for: Vec<String>,
    /// Parameter names the tool accepts
    pub parameters: Vec<String>,
    /// Whether the tool remains usable in degraded mode (no graph index)
    pub degraded_safe: bool,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            best_for: Vec::new(),
            parameters: Vec::new(),
            degraded_safe: true,
        }
    }

    pub fn with_best_for(mut self, hints: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.best_for = hints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parameters(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.parameters = names.into_iter().map(Into::into).collect();
        self
    }

    /// Mark the tool as requiring the graph index.
    pub fn requires_graph(mut self) -> Self {
        self.degraded_safe = false;
        self
    }
}

/// Typed parameter bag for a tool invocation.
///
/// The invocation interface is polymorphic across tools; separate typed
/// maps keep each field type-safe, with a raw JSON fallback for parameters
/// that fit none of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolParameters {
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    strings: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    ints: BTreeMap<String, i64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    bools: BTreeMap<String, bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw: Option<Value>,
}

impl ToolParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.strings.insert(key.into(), value.into());
        self
    }

    pub fn set_int(mut self, key: impl Into<String>, value: i64) -> Self {
        self.ints.insert(key.into(), value);
        self
    }

    pub fn set_bool(mut self, key: impl Into<String>, value: bool) -> Self {
        self.bools.insert(key.into(), value);
        self
    }

    pub fn set_raw(mut self, value: Value) -> Self {
        self.raw = Some(value);
        self
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.strings.get(key).map(String::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.ints.get(key).copied()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.bools.get(key).copied()
    }

    pub fn raw(&self) -> Option<&Value> {
        self.raw.as_ref()
    }

    /// All string parameter values, in key order. These are the
    /// "query-like" parameters used for semantic deduplication.
    pub fn query_like_values(&self) -> Vec<&str> {
        self.strings.values().map(String::as_str).collect()
    }
}

/// One request to run a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Unique invocation id
    pub id: Uuid,
    /// Tool name
    pub tool: String,
    /// Typed parameters
    pub parameters: ToolParameters,
    /// Session step at which the invocation was issued
    pub step: u32,
    /// Why the router chose this tool
    pub reason: String,
    /// Result, filled in after execution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
}

impl ToolInvocation {
    pub fn new(tool: impl Into<String>, parameters: ToolParameters, step: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            tool: tool.into(),
            parameters,
            step,
            reason: String::new(),
            result: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// The raw query string for dedup purposes: string parameters joined
    /// in key order.
    pub fn raw_query(&self) -> String {
        self.parameters.query_like_values().join(" ")
    }
}

/// Outcome of one tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool succeeded
    pub success: bool,
    /// Tool output text
    pub output: String,
    /// Error text when the tool failed
    pub error: Option<String>,
    /// Wall-clock duration of the invocation
    pub duration: Duration,
    /// Estimated output size in tokens
    pub output_tokens: u64,
    /// Whether the result was served from a cache
    pub cached: bool,
    /// Whether the output was truncated
    pub truncated: bool,
}

impl ToolResult {
    /// Successful result; token estimate is derived from the output.
    pub fn success(output: impl Into<String>, duration: Duration) -> Self {
        let output = output.into();
        let output_tokens = (output.len() / 4) as u64;
        Self {
            success: true,
            output,
            error: None,
            duration,
            output_tokens,
            cached: false,
            truncated: false,
        }
    }

    /// Failed result.
    pub fn failure(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            duration,
            output_tokens: 0,
            cached: false,
            truncated: false,
        }
    }

    pub fn with_cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }

    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }
}

/// Behavioural contract for one exploration tool.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Static description of the tool.
    fn spec(&self) -> &ToolSpec;

    /// Run the tool. Long invocations must honour `ctx`.
    async fn invoke(&self, ctx: &CancellationToken, invocation: &ToolInvocation)
        -> Result<ToolResult>;

    /// A 1-2 line summary of the result, suitable for router context.
    fn summarize(&self, result: &ToolResult) -> String {
        if result.success {
            let mut line = result.output.lines().next().unwrap_or("").to_string();
            if line.len() > 120 {
                line.truncate(120);
            }
            line
        } else {
            format!(
                "failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            )
        }
    }
}

/// Registry of available tool adapters, keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolAdapter>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its spec name.
    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) {
        self.tools.insert(adapter.spec().name.clone(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolAdapter>> {
        self.tools.get(name)
    }

    /// Specs of all registered tools, sorted by name for determinism.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec().clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Specs of tools usable without the graph index.
    pub fn degraded_specs(&self) -> Vec<ToolSpec> {
        self.specs()
            .into_iter()
            .filter(|spec| spec.degraded_safe)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameters_typed_access() {
        let params = ToolParameters::new()
            .set_string("query", "main handler")
            .set_int("max_results", 20)
            .set_bool("case_sensitive", false)
            .set_raw(serde_json::json!({"extra": [1, 2]}));

        assert_eq!(params.get_string("query"), Some("main handler"));
        assert_eq!(params.get_int("max_results"), Some(20));
        assert_eq!(params.get_bool("case_sensitive"), Some(false));
        assert!(params.raw().is_some());
        assert_eq!(params.get_string("missing"), None);
    }

    #[test]
    fn test_raw_query_joins_string_params() {
        let invocation = ToolInvocation::new(
            "grep",
            ToolParameters::new()
                .set_string("pattern", "fn main")
                .set_string("path", "src/"),
            1,
        );
        // BTreeMap ordering: path before pattern.
        assert_eq!(invocation.raw_query(), "src/ fn main");
    }

    #[test]
    fn test_result_token_estimate() {
        let result = ToolResult::success("x".repeat(400), Duration::from_millis(5));
        assert_eq!(result.output_tokens, 100);
        assert!(result.success);

        let failed = ToolResult::failure("no such file", Duration::from_millis(1));
        assert!(!failed.success);
        assert_eq!(failed.output_tokens, 0);
    }

    #[test]
    fn test_registry_specs_sorted_and_degraded_filtered() {
        struct Dummy(ToolSpec);
        #[async_trait]
        impl ToolAdapter for Dummy {
            fn spec(&self) -> &ToolSpec {
                &self.0
            }
            async fn invoke(
                &self,
                _ctx: &CancellationToken,
                _invocation: &ToolInvocation,
            ) -> Result<ToolResult> {
                Ok(ToolResult::success("", Duration::ZERO))
            }
        }

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Dummy(ToolSpec::new("symbols", "graph").requires_graph())));
        registry.register(Arc::new(Dummy(ToolSpec::new("grep", "search"))));

        let names: Vec<String> = registry.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["grep", "symbols"]);

        let degraded: Vec<String> = registry
            .degraded_specs()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(degraded, vec!["grep"]);
    }
}
