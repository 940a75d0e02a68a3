//! Next-tool selection: the fast router model and its scoring pipeline.
//!
//! The router proposes the next exploration tool; UCB1 scoring, clause
//! blocking and the transposition cache live in the submodules. Router
//! output is a JSON object with `tool`, `confidence` and `reasoning` keys,
//! tolerating surrounding prose; an invalid tool name falls back to the
//! closest available tool with a confidence penalty.

mod cache;
mod ucb1;

pub use cache::{
    CachedSelection, SelectionCache, SelectionCacheStats, StateKey, DEFAULT_CACHE_CAP,
};
pub use ucb1::{
    check_forced_move, forced_from_scores, ForcedMove, ToolScore, Ucb1Config, Ucb1Scorer,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::metrics::CoreMetrics;
use crate::models::MultiModelManager;
use crate::reasoner::GenerationParams;
use crate::session::{Message, ToolHistoryEntry};
use crate::tools::{ToolSpec, ANSWER_TOOL};

/// Default cap on one tool selection.
pub const DEFAULT_ROUTER_TIMEOUT: Duration = Duration::from_millis(500);

/// Confidence below which a selection is labelled low-confidence.
const LOW_CONFIDENCE: f64 = 0.3;

/// Confidence multiplier applied on closest-match fallback.
const FALLBACK_PENALTY: f64 = 0.8;

/// A tool that failed earlier in the session, shown to the router as
/// forbidden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTool {
    pub name: String,
    pub error: String,
}

/// Code context handed to the router with each query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterCodeContext {
    /// Dominant language of the project
    pub language: String,
    /// Known file count
    pub file_count: usize,
    /// Known symbol count
    pub symbol_count: usize,
    /// File currently in focus, if any
    pub current_file: Option<String>,
    /// Most recent tool-history entries (success + summary)
    pub recent_tools: Vec<ToolHistoryEntry>,
    /// Tools that failed this session, with their errors
    pub failed_tools: Vec<FailedTool>,
    /// One-line progress description
    pub progress: String,
    /// Current step number
    pub step: u32,
}

/// The router's proposal for the next tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterSelection {
    /// Proposed tool name (validated against the available list)
    pub tool: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Optional parameter hints for the invocation
    pub parameter_hints: Option<Value>,
    /// Why the router chose this tool
    pub reasoning: String,
    /// Measured selection duration
    pub duration: Duration,
}

/// Behavioural contract for the fast tool-selection model.
#[async_trait]
pub trait RouterBackend: Send + Sync {
    /// Propose the next tool for a query. Selecting
    /// [`ANSWER_TOOL`](crate::tools::ANSWER_TOOL) signals synthesis.
    async fn select_tool(
        &self,
        ctx: &CancellationToken,
        query: &str,
        tools: &[ToolSpec],
        code_context: Option<&RouterCodeContext>,
    ) -> Result<RouterSelection>;
}

#[derive(Debug, Deserialize)]
struct RawSelection {
    tool: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    parameters: Option<Value>,
}

/// Extract the outermost JSON object from text that may carry surrounding
/// prose or markdown fences.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end > start {
        Some(&raw[start..=end])
    } else {
        None
    }
}

/// Parse raw router output into a validated selection.
///
/// The tool must be in `tools` (or the answer sentinel); otherwise the
/// closest available name is substituted and the confidence multiplied by
/// 0.8.
pub fn parse_selection(
    raw: &str,
    tools: &[ToolSpec],
    duration: Duration,
) -> Result<RouterSelection> {
    let json = extract_json_object(raw)
        .ok_or_else(|| Error::parse("router output", "no JSON object found"))?;
    let parsed: RawSelection = serde_json::from_str(json)
        .map_err(|e| Error::parse("router output", e.to_string()))?;

    let mut confidence = parsed.confidence.clamp(0.0, 1.0);
    let mut reasoning = parsed.reasoning;
    let tool = if parsed.tool == ANSWER_TOOL
        || tools.iter().any(|spec| spec.name == parsed.tool)
    {
        parsed.tool
    } else {
        let closest = closest_tool(&parsed.tool, tools)
            .ok_or_else(|| Error::parse("router output", "no tools available for fallback"))?;
        tracing::debug!(proposed = %parsed.tool, substituted = %closest, "router proposed unknown tool");
        confidence *= FALLBACK_PENALTY;
        reasoning = format!("{reasoning} (substituted for unknown tool '{}')", parsed.tool);
        closest.to_string()
    };

    Ok(RouterSelection {
        tool,
        confidence,
        parameter_hints: parsed.parameters,
        reasoning,
        duration,
    })
}

/// The available tool whose name is closest by edit distance.
fn closest_tool<'a>(name: &str, tools: &'a [ToolSpec]) -> Option<&'a str> {
    let lower = name.to_lowercase();
    tools
        .iter()
        .map(|spec| {
            (
                levenshtein(&lower, &spec.name.to_lowercase()),
                spec.name.as_str(),
            )
        })
        .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)))
        .map(|(_, name)| name)
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut previous_diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            let value = (previous_diagonal + cost)
                .min(row[j] + 1)
                .min(row[j + 1] + 1);
            previous_diagonal = row[j + 1];
            row[j + 1] = value;
        }
    }
    row[b.len()]
}

/// Router implementation backed by a small model on the shared inference
/// backend.
///
/// Router parse failures are surfaced as parse errors; the EXECUTE phase
/// treats them as a signal to fall back to the main reasoner.
pub struct LlmRouter {
    manager: Arc<MultiModelManager>,
    model: String,
    timeout: Duration,
    metrics: Arc<CoreMetrics>,
}

impl LlmRouter {
    pub fn new(
        manager: Arc<MultiModelManager>,
        model: impl Into<String>,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            manager,
            model: model.into(),
            timeout: DEFAULT_ROUTER_TIMEOUT,
            metrics,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_prompt(
        &self,
        query: &str,
        tools: &[ToolSpec],
        code_context: Option<&RouterCodeContext>,
    ) -> String {
        let mut prompt = String::from(
            "Select the single best tool for the next exploration step.\n\
             Respond with one JSON object: {\"tool\": ..., \"confidence\": 0.0-1.0, \"reasoning\": ...}\n\
             Select \"answer\" when enough evidence has been collected.\n\nTools:\n",
        );
        for spec in tools {
            prompt.push_str(&format!("- {}: {}", spec.name, spec.description));
            if !spec.best_for.is_empty() {
                prompt.push_str(&format!(" (best for: {})", spec.best_for.join(", ")));
            }
            prompt.push('\n');
        }

        if let Some(context) = code_context {
            prompt.push_str(&format!(
                "\nProject: {} ({} files, {} symbols), step {}\n",
                context.language, context.file_count, context.symbol_count, context.step
            ));
            if let Some(file) = &context.current_file {
                prompt.push_str(&format!("Current file: {file}\n"));
            }
            if !context.progress.is_empty() {
                prompt.push_str(&format!("Progress: {}\n", context.progress));
            }
            if !context.recent_tools.is_empty() {
                prompt.push_str("Recent tools:\n");
                for entry in &context.recent_tools {
                    prompt.push_str(&format!(
                        "- {} ({}): {}\n",
                        entry.tool,
                        if entry.success { "ok" } else { "failed" },
                        entry.summary
                    ));
                }
            }
            if !context.failed_tools.is_empty() {
                prompt.push_str("Do not select these failed tools:\n");
                for failed in &context.failed_tools {
                    prompt.push_str(&format!("- {}: {}\n", failed.name, failed.error));
                }
            }
        }

        prompt.push_str(&format!("\nQuery: {query}\n"));
        prompt
    }
}

#[async_trait]
impl RouterBackend for LlmRouter {
    async fn select_tool(
        &self,
        ctx: &CancellationToken,
        query: &str,
        tools: &[ToolSpec],
        code_context: Option<&RouterCodeContext>,
    ) -> Result<RouterSelection> {
        let start = Instant::now();
        let prompt = self.build_prompt(query, tools, code_context);
        let messages = [Message::user(prompt)];
        let params = GenerationParams::default().with_temperature(0.0);

        let outcome = tokio::select! {
            _ = ctx.cancelled() => Err(Error::cancelled("router selection")),
            result = tokio::time::timeout(
                self.timeout,
                self.manager.chat(ctx, &self.model, &messages, &params),
            ) => match result {
                Ok(inner) => inner,
                Err(_) => Err(Error::timeout(self.timeout.as_millis() as u64)),
            },
        };

        let duration = start.elapsed();
        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                self.metrics
                    .routing_latency
                    .with_label_values(&[&self.model, "error"])
                    .observe(duration.as_secs_f64());
                self.metrics
                    .routing_errors
                    .with_label_values(&[&self.model, err.code()])
                    .inc();
                return Err(err);
            }
        };

        match parse_selection(&response.content, tools, duration) {
            Ok(selection) => {
                let status = if selection.confidence < LOW_CONFIDENCE {
                    "low_confidence"
                } else {
                    "success"
                };
                self.metrics
                    .routing_latency
                    .with_label_values(&[&self.model, status])
                    .observe(duration.as_secs_f64());
                self.metrics
                    .routing_confidence
                    .with_label_values(&[&self.model])
                    .observe(selection.confidence);
                self.metrics
                    .routing_selections
                    .with_label_values(&[&self.model, &selection.tool])
                    .inc();
                if selection.reasoning.contains("substituted for unknown tool") {
                    self.metrics
                        .routing_fallbacks
                        .with_label_values(&[&self.model, "unknown_tool"])
                        .inc();
                }
                Ok(selection)
            }
            Err(err) => {
                self.metrics
                    .routing_latency
                    .with_label_values(&[&self.model, "error"])
                    .observe(duration.as_secs_f64());
                self.metrics
                    .routing_errors
                    .with_label_values(&[&self.model, "parse"])
                    .inc();
                self.metrics
                    .routing_fallbacks
                    .with_label_values(&[&self.model, "parse_failure"])
                    .inc();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools() -> Vec<ToolSpec> {
        vec![
            ToolSpec::new("grep", "text search"),
            ToolSpec::new("file_search", "find files"),
            ToolSpec::new("symbols", "symbol graph"),
        ]
    }

    #[test]
    fn test_extract_json_from_prose() {
        let raw = "Sure! Here is the selection:\n```json\n{\"tool\": \"grep\"}\n```\nHope that helps.";
        assert_eq!(extract_json_object(raw), Some("{\"tool\": \"grep\"}"));
        assert_eq!(extract_json_object("no braces"), None);
    }

    #[test]
    fn test_parse_valid_selection() {
        let raw = r#"{"tool": "grep", "confidence": 0.9, "reasoning": "text query"}"#;
        let selection = parse_selection(raw, &tools(), Duration::from_millis(10)).unwrap();
        assert_eq!(selection.tool, "grep");
        assert!((selection.confidence - 0.9).abs() < 1e-9);
        assert_eq!(selection.reasoning, "text query");
    }

    #[test]
    fn test_parse_accepts_answer_sentinel() {
        let raw = r#"{"tool": "answer", "confidence": 1.0, "reasoning": "done"}"#;
        let selection = parse_selection(raw, &tools(), Duration::ZERO).unwrap();
        assert_eq!(selection.tool, ANSWER_TOOL);
    }

    #[test]
    fn test_unknown_tool_falls_back_with_penalty() {
        let raw = r#"{"tool": "gerp", "confidence": 1.0, "reasoning": "typo"}"#;
        let selection = parse_selection(raw, &tools(), Duration::ZERO).unwrap();
        assert_eq!(selection.tool, "grep");
        assert!((selection.confidence - 0.8).abs() < 1e-9);
        assert!(selection.reasoning.contains("substituted"));
    }

    #[test]
    fn test_unparseable_output_is_a_parse_error() {
        let err = parse_selection("not json at all", &tools(), Duration::ZERO).unwrap_err();
        assert_eq!(err.code(), "parse");

        let err = parse_selection("{\"tool\": }", &tools(), Duration::ZERO).unwrap_err();
        assert_eq!(err.code(), "parse");
    }

    #[test]
    fn test_confidence_is_clamped() {
        let raw = r#"{"tool": "grep", "confidence": 7.5, "reasoning": "x"}"#;
        let selection = parse_selection(raw, &tools(), Duration::ZERO).unwrap();
        assert_eq!(selection.confidence, 1.0);
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("grep", "grep"), 0);
        assert_eq!(levenshtein("gerp", "grep"), 2);
        assert_eq!(levenshtein("", "abc"), 3);
    }
}
