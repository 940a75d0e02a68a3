//! EXECUTE: one cycle of select-tool → invoke-tool → observe, or
//! synthesis when the budget or the router says so.
//!
//! Multiple cycles happen through EXECUTE → EXECUTE self-transitions; the
//! loop never runs more than one tool per phase execution.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::events::EventData;
use crate::grounding::{feedback_questions, Strictness};
use crate::index::step_assignment;
use crate::reasoner::{GenerationParams, StreamConfig, StreamEvent};
use crate::router::{
    check_forced_move, forced_from_scores, CachedSelection, FailedTool, RouterCodeContext,
    StateKey, ToolScore,
};
use crate::session::{AgentState, Message, ToolHistoryEntry};
use crate::tools::{
    SemanticStatus, ToolCallSignature, ToolInvocation, ToolParameters, ANSWER_TOOL,
};

use super::{PhaseContext, PhaseOutcome};

/// Weight applied to a semantic-dedup similarity when penalising a score.
const DEDUP_PENALTY_WEIGHT: f64 = 1.0;

pub(crate) async fn run_execute(
    ctx: &CancellationToken,
    phase: &mut PhaseContext<'_>,
) -> Result<PhaseOutcome> {
    // Step 1: budget check.
    if phase.exec.budget.must_synthesize() {
        if phase.exec.budget.in_synthesis() {
            return synthesize(ctx, phase).await;
        }
        // Budget ran out implicitly; REFLECT decides what happens next.
        return Ok(PhaseOutcome::Next(AgentState::Reflect));
    }

    let degraded = phase.session.read(|s| s.degraded_mode).await;
    let specs = if degraded {
        phase.deps.tools.degraded_specs()
    } else {
        phase.deps.tools.specs()
    };
    if specs.is_empty() {
        return synthesize(ctx, phase).await;
    }
    let tool_names: Vec<String> = specs.iter().map(|spec| spec.name.clone()).collect();

    let generation = phase
        .deps
        .clauses
        .as_ref()
        .map(|checker| checker.generation())
        .unwrap_or(0);
    let (history, base_assignment) = phase
        .session
        .read(|s| (s.tool_history.clone(), step_assignment(&s.tool_history)))
        .await;

    // Unit propagation: when clause constraints leave exactly one viable
    // tool, pick it without consulting the router at all.
    if let Some(checker) = phase.deps.clauses.as_deref() {
        let forced = check_forced_move(&tool_names, checker, &base_assignment);
        if forced.all_blocked() {
            phase.deps.metrics.ucb1_all_blocked_total.inc();
            phase
                .emit(EventData::SafetyCheck {
                    check: "clause_blocking".to_string(),
                    passed: false,
                    detail: format!("all {} candidates blocked", forced.blocked_tools.len()),
                })
                .await;
            return synthesize(ctx, phase).await;
        }
        if forced.is_forced && !forced.blocked_tools.is_empty() {
            let tool = forced.forced_tool.clone().unwrap_or_default();
            phase
                .deps
                .metrics
                .ucb1_forced_moves_total
                .with_label_values(&[&tool])
                .inc();
            phase
                .emit(EventData::ToolForcing {
                    tool: tool.clone(),
                    viable_count: forced.viable_count,
                    blocked: forced.blocked_tools.clone(),
                })
                .await;

            let chosen = ToolScore {
                tool: tool.clone(),
                confidence: 1.0,
                proof_penalty: 0.0,
                exploration_bonus: 0.0,
                final_score: 1.0,
                blocked: false,
                block_reason: None,
                proof_status: None,
            };
            // A forced move that duplicates a prior call leaves nothing
            // viable.
            let raw_query = build_parameters(&tool, None, phase.query).1;
            if phase
                .exec
                .call_history
                .check_semantic_status(&tool, &raw_query)
                .is_blocked()
            {
                return synthesize(ctx, phase).await;
            }
            return invoke_tool(ctx, phase, &chosen, None).await;
        }
    }

    // Step 2: cache probe, then router query on a miss.
    let key = StateKey::from_history(&history, generation);
    let mut parameter_hints: Option<Value> = None;
    let mut hinted_tool: Option<String> = None;

    let candidates: Vec<ToolScore> =
        match phase.deps.selection_cache.get(&key, generation) {
            Some(cached) => {
                phase.deps.metrics.ucb1_cache_hits_total.inc();
                score_candidates(phase, &tool_names, &cached.tool, 1.0, &base_assignment)
            }
            None => {
                phase.deps.metrics.ucb1_cache_misses_total.inc();
                let code_context = build_router_context(phase, &history, degraded).await;
                let routed = phase
                    .deps
                    .router
                    .select_tool(ctx, phase.query, &specs, Some(&code_context))
                    .await;

                match routed {
                    Ok(selection) => {
                        if selection.tool == ANSWER_TOOL {
                            return synthesize(ctx, phase).await;
                        }
                        parameter_hints = selection.parameter_hints.clone();
                        hinted_tool = Some(selection.tool.clone());
                        let scores = score_candidates(
                            phase,
                            &tool_names,
                            &selection.tool,
                            selection.confidence,
                            &base_assignment,
                        );
                        if let Some(best) = scores.iter().find(|score| !score.blocked) {
                            phase.deps.selection_cache.insert(
                                key,
                                CachedSelection {
                                    tool: best.tool.clone(),
                                    score: best.final_score,
                                    cached_at: chrono::Utc::now(),
                                    generation,
                                },
                            );
                        }
                        scores
                    }
                    Err(err) if err.is_cancellation() && ctx.is_cancelled() => {
                        return Err(err)
                    }
                    Err(err) if err.code() == "parse" => {
                        // Unreadable router output falls back to the main
                        // reasoner.
                        tracing::warn!(error = %err, "router output unreadable; synthesizing");
                        return synthesize(ctx, phase).await;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "router unavailable; scoring without it");
                        score_candidates_unrouted(phase, &tool_names, &base_assignment)
                    }
                }
            }
        };

    // Step 4: the scored list can still be fully blocked when a clause
    // checker was added between the pre-check and scoring.
    if forced_from_scores(&candidates).all_blocked() {
        phase.deps.metrics.ucb1_all_blocked_total.inc();
        return synthesize(ctx, phase).await;
    }
    for blocked in candidates.iter().filter(|score| score.blocked) {
        phase
            .deps
            .metrics
            .ucb1_blocked_selections_total
            .with_label_values(&[&blocked.tool, "clause"])
            .inc();
    }

    // Step 5: semantic dedup with next-best fallback.
    let chosen = match select_with_dedup(phase, &candidates, hinted_tool.as_deref(), &parameter_hints)
    {
        Some(chosen) => chosen,
        None => {
            phase
                .emit(EventData::SafetyCheck {
                    check: "semantic_dedup".to_string(),
                    passed: false,
                    detail: "every viable candidate duplicates a prior call".to_string(),
                })
                .await;
            return synthesize(ctx, phase).await;
        }
    };

    // Step 6: tool invocation.
    let hints = match hinted_tool.as_deref() {
        Some(hinted) if hinted == chosen.tool => parameter_hints.as_ref(),
        _ => None,
    };
    invoke_tool(ctx, phase, &chosen, hints).await
}

fn score_candidates(
    phase: &PhaseContext<'_>,
    tool_names: &[String],
    routed_tool: &str,
    confidence: f64,
    base_assignment: &HashMap<String, bool>,
) -> Vec<ToolScore> {
    let confidences = HashMap::from([(routed_tool.to_string(), confidence)]);
    phase.exec.scorer.score(
        tool_names,
        &confidences,
        phase.deps.proofs.as_deref(),
        phase.deps.clauses.as_deref(),
        base_assignment,
    )
}

fn score_candidates_unrouted(
    phase: &PhaseContext<'_>,
    tool_names: &[String],
    base_assignment: &HashMap<String, bool>,
) -> Vec<ToolScore> {
    phase.exec.scorer.score(
        tool_names,
        &HashMap::new(),
        phase.deps.proofs.as_deref(),
        phase.deps.clauses.as_deref(),
        base_assignment,
    )
}

async fn build_router_context(
    phase: &PhaseContext<'_>,
    history: &[ToolHistoryEntry],
    degraded: bool,
) -> RouterCodeContext {
    let step = phase.session.read(|s| s.current_step).await;
    let language = phase
        .exec
        .evidence
        .languages()
        .iter()
        .next()
        .cloned()
        .unwrap_or_else(|| "unknown".to_string());
    let successes = history.iter().filter(|entry| entry.success).count();
    RouterCodeContext {
        language,
        file_count: phase.exec.evidence.file_count(),
        symbol_count: 0,
        current_file: None,
        recent_tools: history.iter().rev().take(5).rev().cloned().collect(),
        failed_tools: phase.exec.failed_tools.clone(),
        progress: format!(
            "{} tools run, {} succeeded{}",
            history.len(),
            successes,
            if degraded { ", degraded mode" } else { "" }
        ),
        step,
    }
}

/// Walk the scored candidates best-first, skipping semantic duplicates.
///
/// A penalised candidate has the similarity penalty subtracted and the
/// list is re-sorted once; the walk then restarts on the new ordering so
/// every candidate it lands on is dedup-checked before selection. The walk
/// ends on an allowed candidate, a second penalised hit (the order is
/// frozen after the single re-sort, so that candidate is taken as-is), or
/// exhaustion.
fn select_with_dedup(
    phase: &PhaseContext<'_>,
    candidates: &[ToolScore],
    hinted_tool: Option<&str>,
    parameter_hints: &Option<Value>,
) -> Option<ToolScore> {
    let mut adjusted: Vec<ToolScore> = candidates
        .iter()
        .filter(|score| !score.blocked)
        .cloned()
        .collect();
    let mut dedup_blocked: HashSet<String> = HashSet::new();
    let mut penalized_once = false;
    let mut index = 0;

    while index < adjusted.len() {
        let candidate = adjusted[index].clone();
        if dedup_blocked.contains(&candidate.tool) {
            index += 1;
            continue;
        }
        let hints = match hinted_tool {
            Some(hinted) if hinted == candidate.tool => parameter_hints.as_ref(),
            _ => None,
        };
        let raw_query = build_parameters(&candidate.tool, hints, phase.query).1;

        match phase
            .exec
            .call_history
            .check_semantic_status(&candidate.tool, &raw_query)
        {
            SemanticStatus::Blocked { reason } => {
                tracing::debug!(tool = %candidate.tool, reason = %reason, "candidate deduplicated");
                dedup_blocked.insert(candidate.tool.clone());
                index += 1;
            }
            SemanticStatus::Allowed => return Some(candidate),
            SemanticStatus::Penalized { similarity } => {
                if penalized_once {
                    return Some(candidate);
                }
                penalized_once = true;
                adjusted[index].final_score -= similarity * DEDUP_PENALTY_WEIGHT;
                adjusted.sort_by(|a, b| {
                    b.final_score
                        .partial_cmp(&a.final_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.tool.cmp(&b.tool))
                });
                index = 0;
            }
        }
    }
    None
}

/// Build typed parameters for an invocation and the raw query they imply.
fn build_parameters(
    tool: &str,
    hints: Option<&Value>,
    query: &str,
) -> (ToolParameters, String) {
    let mut params = ToolParameters::new();
    let mut used_hint = false;
    if let Some(Value::Object(map)) = hints {
        for (key, value) in map {
            match value {
                Value::String(text) => {
                    params = params.set_string(key.as_str(), text.as_str());
                    used_hint = true;
                }
                Value::Number(number) if number.is_i64() => {
                    params = params.set_int(key.as_str(), number.as_i64().unwrap_or_default());
                }
                Value::Bool(flag) => {
                    params = params.set_bool(key.as_str(), *flag);
                }
                other => {
                    params = params.set_raw(other.clone());
                }
            }
        }
    }
    if !used_hint {
        params = params.set_string("query", query);
    }
    let invocation = ToolInvocation::new(tool, params.clone(), 0);
    let raw_query = invocation.raw_query();
    (params, raw_query)
}

async fn invoke_tool(
    ctx: &CancellationToken,
    phase: &mut PhaseContext<'_>,
    chosen: &ToolScore,
    hints: Option<&Value>,
) -> Result<PhaseOutcome> {
    let step = phase.session.read(|s| s.current_step).await + 1;
    let (params, _raw) = build_parameters(&chosen.tool, hints, phase.query);
    let invocation = ToolInvocation::new(chosen.tool.clone(), params, step)
        .with_reason(format!("ucb1 score {:.3}", chosen.final_score));

    phase
        .emit(EventData::ToolInvocation {
            tool: chosen.tool.clone(),
            step,
            reason: invocation.reason.clone(),
        })
        .await;
    let metrics = &phase.deps.metrics;
    metrics
        .ucb1_selection_score
        .with_label_values(&[&chosen.tool])
        .observe(chosen.final_score);
    metrics
        .ucb1_proof_penalty
        .with_label_values(&[&chosen.tool])
        .observe(chosen.proof_penalty);
    metrics
        .ucb1_exploration_bonus
        .with_label_values(&[&chosen.tool])
        .observe(chosen.exploration_bonus);
    phase.exec.scorer.record_selection(&chosen.tool);
    phase.exec.budget.increment_step();

    let Some(adapter) = phase.deps.tools.get(&chosen.tool) else {
        phase.exec.failed_tools.push(FailedTool {
            name: chosen.tool.clone(),
            error: "no adapter registered".to_string(),
        });
        return Ok(PhaseOutcome::Next(AgentState::Execute));
    };

    let started = Instant::now();
    match adapter.invoke(ctx, &invocation).await {
        Ok(result) => {
            let summary = adapter.summarize(&result);
            phase.exec.call_history.record(ToolCallSignature::from_invocation(
                &invocation,
                result.success,
            ));
            phase
                .exec
                .evidence
                .add_tool_output(&chosen.tool, &result.output);
            if !result.success {
                phase.exec.failed_tools.push(FailedTool {
                    name: chosen.tool.clone(),
                    error: result
                        .error
                        .clone()
                        .unwrap_or_else(|| "tool failed".to_string()),
                });
            }

            let entry = ToolHistoryEntry {
                tool: chosen.tool.clone(),
                summary: summary.clone(),
                success: result.success,
                step,
            };
            let output_tokens = result.output_tokens;
            let output = result.output.clone();
            let tool_name = chosen.tool.clone();
            phase
                .session
                .update(move |s| {
                    s.tool_history.push(entry);
                    s.push_message(
                        Message::tool(output)
                            .with_tool_call(serde_json::json!({ "tool": tool_name })),
                    );
                    s.add_tokens(output_tokens);
                    s.record_trace("execute", format!("ran {tool_name}"));
                })
                .await;

            phase
                .emit(EventData::ToolResult {
                    tool: chosen.tool.clone(),
                    success: result.success,
                    duration_ms: result.duration.as_millis() as u64,
                    summary,
                })
                .await;
            Ok(PhaseOutcome::Next(AgentState::Execute))
        }
        Err(err) if err.is_cancellation() && ctx.is_cancelled() => Err(err),
        Err(err) => {
            // Tool failures never abort the session; the router sees the
            // tool in the forbidden list on the next cycle.
            phase.exec.failed_tools.push(FailedTool {
                name: chosen.tool.clone(),
                error: err.to_string(),
            });
            phase
                .emit(EventData::ToolResult {
                    tool: chosen.tool.clone(),
                    success: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                    summary: format!("failed: {err}"),
                })
                .await;
            Ok(PhaseOutcome::Next(AgentState::Execute))
        }
    }
}

/// Produce the final answer: reason over evidence, sanitise, classify
/// intent, verify grounding, escalate on violations.
async fn synthesize(
    ctx: &CancellationToken,
    phase: &mut PhaseContext<'_>,
) -> Result<PhaseOutcome> {
    loop {
        let retry = phase.exec.grounding_retries();
        let strictness = Strictness::from_retry(retry);

        if strictness == Strictness::Feedback {
            // Stop re-prompting; explore what the violations point at.
            let questions = feedback_questions(&phase.exec.last_violations);
            let detail = format!(
                "grounding feedback loop: {} targeted questions",
                questions.len()
            );
            phase
                .session
                .update(|s| {
                    s.context.push_str("\nOpen questions from verification:\n");
                    for question in &questions {
                        s.context.push_str(&format!("- {question}\n"));
                    }
                    s.record_trace("synthesis", detail.clone());
                })
                .await;
            phase
                .emit(EventData::Reflection { decision: detail })
                .await;
            phase
                .exec
                .budget
                .extend_exploration(phase.config.feedback_exploration_steps);
            phase.exec.reset_grounding_retries();
            return Ok(PhaseOutcome::Next(AgentState::Execute));
        }

        let base_prompt = build_synthesis_prompt(phase).await;
        let prompt = phase.exec.verifier.escalated_prompt(
            &base_prompt,
            &phase.exec.last_violations,
            strictness,
        );

        phase
            .emit(EventData::LlmRequest {
                model: "reasoner".to_string(),
                purpose: format!("synthesis (retry {retry})"),
            })
            .await;
        let raw_answer = reason_with_retries(ctx, phase, &prompt).await?;

        let sanitized = phase.exec.sanitizer.sanitize(&raw_answer);
        if sanitized.stripped {
            phase
                .emit(EventData::SafetyCheck {
                    check: "sanitizer".to_string(),
                    passed: false,
                    detail: "stripped leaked tool markup".to_string(),
                })
                .await;
        }

        let intent = phase.exec.intent.classify(&sanitized.text);
        if intent.is_intent {
            phase
                .emit(EventData::SafetyCheck {
                    check: "intent".to_string(),
                    passed: false,
                    detail: intent.reason,
                })
                .await;
            phase.exec.bump_grounding_retries();
            continue;
        }

        let verification =
            phase
                .exec
                .verifier
                .verify(&sanitized.text, &phase.exec.evidence, "synthesis", retry);
        phase
            .emit(EventData::SafetyCheck {
                check: "grounding".to_string(),
                passed: verification.passed,
                detail: format!("{} violations", verification.violations.len()),
            })
            .await;

        if verification.passed {
            phase.exec.reset_grounding_retries();
            let answer = sanitized.text.clone();
            phase
                .session
                .update(move |s| {
                    s.push_message(Message::assistant(sanitized.text));
                    s.record_trace("synthesis", "answer verified");
                })
                .await;
            return Ok(PhaseOutcome::Complete { answer });
        }

        tracing::debug!(
            violations = verification.violations.len(),
            retry,
            "grounding verification failed; escalating"
        );
        phase.exec.last_violations = verification.violations;
        phase.exec.bump_grounding_retries();
    }
}

async fn build_synthesis_prompt(phase: &PhaseContext<'_>) -> String {
    let (context, evidence_lines) = phase
        .session
        .read(|s| {
            let lines: Vec<String> = s
                .tool_history
                .iter()
                .filter(|entry| entry.success)
                .map(|entry| format!("- {} (step {}): {}", entry.tool, entry.step, entry.summary))
                .collect();
            (s.context.clone(), lines)
        })
        .await;

    let mut prompt = context;
    if !evidence_lines.is_empty() {
        prompt.push_str("\nEvidence collected:\n");
        prompt.push_str(&evidence_lines.join("\n"));
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "\nQuestion: {}\nAnswer using only the evidence above. \
         Cite files exactly as they appear in the evidence.",
        phase.query
    ));
    prompt
}

/// One streamed reasoner call with exponential back-off on transient
/// failures.
async fn reason_with_retries(
    ctx: &CancellationToken,
    phase: &mut PhaseContext<'_>,
    prompt: &str,
) -> Result<String> {
    let messages = [
        Message::system(
            "You are answering a question about a source tree from collected evidence.",
        ),
        Message::user(prompt),
    ];
    let params = GenerationParams::default();
    let stream_config = StreamConfig::default();
    let mut attempt: u32 = 0;

    loop {
        let started = Instant::now();
        let mut collected = String::new();
        let outcome = {
            let mut handler = |event: StreamEvent| {
                if let StreamEvent::Token(text) = event {
                    collected.push_str(&text);
                }
                Ok(())
            };
            tokio::time::timeout(
                phase.config.stream_timeout,
                phase.deps.reasoner.stream(
                    ctx,
                    &messages,
                    &params,
                    &stream_config,
                    &mut handler,
                ),
            )
            .await
        };

        let err = match outcome {
            Ok(Ok(stats)) => {
                let tokens = (stats.response_bytes / 4) as u64;
                phase
                    .deps
                    .metrics
                    .stream_tokens_total
                    .with_label_values(&["reasoner"])
                    .inc_by(stats.token_count);
                phase
                    .deps
                    .metrics
                    .stream_duration_seconds
                    .with_label_values(&["reasoner"])
                    .observe(started.elapsed().as_secs_f64());
                phase.session.update(move |s| s.add_tokens(tokens)).await;
                phase
                    .emit(EventData::LlmResponse {
                        model: "reasoner".to_string(),
                        tokens,
                        duration_ms: started.elapsed().as_millis() as u64,
                    })
                    .await;
                return Ok(collected);
            }
            Ok(Err(err)) => err,
            Err(_elapsed) => {
                Error::timeout(phase.config.stream_timeout.as_millis() as u64)
            }
        };

        phase
            .deps
            .metrics
            .stream_errors_total
            .with_label_values(&["reasoner", err.code()])
            .inc();

        if ctx.is_cancelled() {
            return Err(Error::cancelled("synthesis"));
        }
        if err.is_transient() && attempt < phase.config.max_reasoner_retries {
            let delay = phase.config.retry_base_delay * 2u32.saturating_pow(attempt);
            tracing::warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "reasoner failed; retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
            continue;
        }
        return Err(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentDeps, ExecutionState};
    use crate::config::AgentConfig;
    use crate::events::{EventBus, EventType};
    use crate::graph::UnavailableGraph;
    use crate::index::{tool_variable, ClauseChecker, ClauseVerdict};
    use crate::metrics::CoreMetrics;
    use crate::reasoner::{Completion, ReasonerClient, StreamHandler, StreamStats};
    use crate::router::{RouterBackend, RouterSelection, SelectionCache};
    use crate::session::{Session, SessionHandle};
    use crate::tools::{
        extract_query_terms, ToolAdapter, ToolRegistry, ToolResult, ToolSpec,
    };
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn selection(tool: &str) -> RouterSelection {
        RouterSelection {
            tool: tool.to_string(),
            confidence: 0.9,
            parameter_hints: None,
            reasoning: "scripted".to_string(),
            duration: Duration::from_millis(1),
        }
    }

    /// Proposes scripted tools in order, then the answer sentinel. Counts
    /// consultations so tests can assert the router was bypassed.
    struct ScriptRouter {
        script: Mutex<VecDeque<RouterSelection>>,
        calls: AtomicUsize,
    }

    impl ScriptRouter {
        fn proposing(tools: &[&str]) -> Self {
            Self {
                script: Mutex::new(tools.iter().map(|t| selection(t)).collect()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RouterBackend for ScriptRouter {
        async fn select_tool(
            &self,
            _ctx: &CancellationToken,
            _query: &str,
            _tools: &[ToolSpec],
            _code_context: Option<&RouterCodeContext>,
        ) -> Result<RouterSelection> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| selection(ANSWER_TOOL)))
        }
    }

    /// Streams scripted responses in order, repeating the last, and keeps
    /// the prompts it was asked to answer.
    struct ScriptReasoner {
        script: Mutex<VecDeque<String>>,
        last: String,
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptReasoner {
        fn answering(responses: &[&str]) -> Self {
            Self {
                script: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
                last: responses.last().map(|s| s.to_string()).unwrap_or_default(),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn next(&self, messages: &[Message]) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(prompt) = messages.last() {
                self.prompts.lock().unwrap().push(prompt.content.clone());
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.last.clone())
        }
    }

    #[async_trait]
    impl ReasonerClient for ScriptReasoner {
        async fn complete(
            &self,
            _ctx: &CancellationToken,
            messages: &[Message],
            _params: &GenerationParams,
        ) -> Result<Completion> {
            let content = self.next(messages);
            let tokens = (content.len() / 4) as u64;
            Ok(Completion {
                content,
                tokens,
                duration: Duration::from_millis(1),
            })
        }

        async fn stream(
            &self,
            _ctx: &CancellationToken,
            messages: &[Message],
            _params: &GenerationParams,
            _config: &StreamConfig,
            handler: StreamHandler<'_>,
        ) -> Result<StreamStats> {
            let content = self.next(messages);
            let bytes = content.len();
            handler(StreamEvent::Token(content))?;
            Ok(StreamStats {
                token_count: 1,
                thinking_count: 0,
                response_bytes: bytes,
                truncated: false,
            })
        }
    }

    struct EchoTool {
        spec: ToolSpec,
        output: String,
        invocations: AtomicUsize,
    }

    impl EchoTool {
        fn named(name: &str) -> Arc<Self> {
            Arc::new(Self {
                spec: ToolSpec::new(name, "scripted tool"),
                output: format!("{name} output"),
                invocations: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ToolAdapter for EchoTool {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }

        async fn invoke(
            &self,
            _ctx: &CancellationToken,
            _invocation: &ToolInvocation,
        ) -> Result<ToolResult> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(ToolResult::success(
                self.output.clone(),
                Duration::from_millis(1),
            ))
        }
    }

    /// Blocks any assignment that adopts one of the listed tools.
    struct BlockList(Vec<String>);

    impl BlockList {
        fn of(tools: &[&str]) -> Arc<Self> {
            Arc::new(Self(tools.iter().map(|t| t.to_string()).collect()))
        }
    }

    impl ClauseChecker for BlockList {
        fn check(&self, assignment: &HashMap<String, bool>) -> ClauseVerdict {
            for tool in &self.0 {
                if assignment
                    .get(&tool_variable(tool))
                    .copied()
                    .unwrap_or(false)
                {
                    return ClauseVerdict::blocked("blocked");
                }
            }
            ClauseVerdict::allowed()
        }

        fn generation(&self) -> u64 {
            1
        }
    }

    struct TestBed {
        deps: AgentDeps,
        config: AgentConfig,
        session: Arc<SessionHandle>,
        router: Arc<ScriptRouter>,
        reasoner: Arc<ScriptReasoner>,
    }

    fn testbed(
        tools: &[Arc<EchoTool>],
        router: ScriptRouter,
        reasoner: ScriptReasoner,
        clauses: Option<Arc<dyn ClauseChecker>>,
    ) -> TestBed {
        let router = Arc::new(router);
        let reasoner = Arc::new(reasoner);
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(Arc::clone(tool) as Arc<dyn ToolAdapter>);
        }
        let deps = AgentDeps {
            router: Arc::clone(&router) as Arc<dyn RouterBackend>,
            reasoner: Arc::clone(&reasoner) as Arc<dyn ReasonerClient>,
            tools: Arc::new(registry),
            graph: Arc::new(UnavailableGraph),
            clauses,
            proofs: None,
            bus: Arc::new(EventBus::new()),
            metrics: Arc::new(CoreMetrics::standalone("exec_test")),
            selection_cache: Arc::new(SelectionCache::default()),
        };
        TestBed {
            deps,
            config: AgentConfig::default(),
            session: SessionHandle::new(Session::new("/tmp/project")),
            router,
            reasoner,
        }
    }

    fn signature(tool: &str, raw: &str) -> ToolCallSignature {
        ToolCallSignature {
            tool: tool.to_string(),
            terms: extract_query_terms(raw),
            raw_query: raw.to_string(),
            step: 1,
            success: true,
        }
    }

    fn score(tool: &str, final_score: f64) -> ToolScore {
        ToolScore {
            tool: tool.to_string(),
            confidence: 0.5,
            proof_penalty: 0.0,
            exploration_bonus: 0.0,
            final_score,
            blocked: false,
            block_reason: None,
            proof_status: None,
        }
    }

    const GROUNDED: &str = "The loop runs until a terminal state is reached.";
    const PHANTOM: &str = "The scheduler hides in src/ghost/scheduler.rs.";

    #[tokio::test]
    async fn test_forced_move_precheck_bypasses_router() {
        let alpha = EchoTool::named("alpha");
        let beta = EchoTool::named("beta");
        let gamma = EchoTool::named("gamma");
        let bed = testbed(
            &[Arc::clone(&alpha), Arc::clone(&beta), Arc::clone(&gamma)],
            ScriptRouter::proposing(&["alpha"]),
            ScriptReasoner::answering(&[GROUNDED]),
            Some(BlockList::of(&["alpha", "beta"]) as Arc<dyn ClauseChecker>),
        );
        let ctx = CancellationToken::new();
        let mut exec = ExecutionState::new(&bed.config, "search the handler code");
        let mut phase = PhaseContext {
            deps: &bed.deps,
            config: &bed.config,
            session: &*bed.session,
            exec: &mut exec,
            query: "search the handler code",
        };

        let outcome = run_execute(&ctx, &mut phase).await.unwrap();

        assert!(matches!(outcome, PhaseOutcome::Next(AgentState::Execute)));
        assert_eq!(bed.router.calls.load(Ordering::SeqCst), 0);
        assert_eq!(gamma.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(alpha.invocations.load(Ordering::SeqCst), 0);
        assert_eq!(beta.invocations.load(Ordering::SeqCst), 0);
        assert_eq!(
            bed.deps
                .metrics
                .ucb1_forced_moves_total
                .with_label_values(&["gamma"])
                .get(),
            1
        );
        let types: Vec<EventType> = bed
            .deps
            .bus
            .recent(20)
            .iter()
            .map(|event| event.event_type)
            .collect();
        assert!(types.contains(&EventType::ToolForcing));
    }

    #[tokio::test]
    async fn test_all_blocked_goes_to_synthesis() {
        let alpha = EchoTool::named("alpha");
        let beta = EchoTool::named("beta");
        let bed = testbed(
            &[Arc::clone(&alpha), Arc::clone(&beta)],
            ScriptRouter::proposing(&["alpha"]),
            ScriptReasoner::answering(&[GROUNDED]),
            Some(BlockList::of(&["alpha", "beta"]) as Arc<dyn ClauseChecker>),
        );
        let ctx = CancellationToken::new();
        let mut exec = ExecutionState::new(&bed.config, "search the handler code");
        let mut phase = PhaseContext {
            deps: &bed.deps,
            config: &bed.config,
            session: &*bed.session,
            exec: &mut exec,
            query: "search the handler code",
        };

        let outcome = run_execute(&ctx, &mut phase).await.unwrap();

        match outcome {
            PhaseOutcome::Complete { answer } => assert_eq!(answer, GROUNDED),
            other => panic!("expected synthesis completion, got {:?}", phase_name(&other)),
        }
        assert_eq!(bed.router.calls.load(Ordering::SeqCst), 0);
        assert_eq!(alpha.invocations.load(Ordering::SeqCst), 0);
        assert_eq!(beta.invocations.load(Ordering::SeqCst), 0);
        assert_eq!(bed.deps.metrics.ucb1_all_blocked_total.get(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_router() {
        let alpha = EchoTool::named("alpha");
        let beta = EchoTool::named("beta");
        let bed = testbed(
            &[Arc::clone(&alpha), Arc::clone(&beta)],
            ScriptRouter::proposing(&["beta"]),
            ScriptReasoner::answering(&[GROUNDED]),
            None,
        );
        // No clause checker: generation 0. Pre-cache a selection for the
        // empty step history.
        bed.deps.selection_cache.insert(
            StateKey::from_history(&[], 0),
            CachedSelection {
                tool: "alpha".to_string(),
                score: 1.5,
                cached_at: chrono::Utc::now(),
                generation: 0,
            },
        );
        let ctx = CancellationToken::new();
        let mut exec = ExecutionState::new(&bed.config, "search the handler code");
        let mut phase = PhaseContext {
            deps: &bed.deps,
            config: &bed.config,
            session: &*bed.session,
            exec: &mut exec,
            query: "search the handler code",
        };

        let outcome = run_execute(&ctx, &mut phase).await.unwrap();

        assert!(matches!(outcome, PhaseOutcome::Next(AgentState::Execute)));
        assert_eq!(bed.router.calls.load(Ordering::SeqCst), 0);
        assert_eq!(alpha.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(bed.deps.metrics.ucb1_cache_hits_total.get(), 1);
    }

    #[tokio::test]
    async fn test_cache_miss_consults_router_and_caches() {
        let alpha = EchoTool::named("alpha");
        let bed = testbed(
            &[Arc::clone(&alpha)],
            ScriptRouter::proposing(&["alpha"]),
            ScriptReasoner::answering(&[GROUNDED]),
            None,
        );
        let ctx = CancellationToken::new();
        let mut exec = ExecutionState::new(&bed.config, "search the handler code");
        let mut phase = PhaseContext {
            deps: &bed.deps,
            config: &bed.config,
            session: &*bed.session,
            exec: &mut exec,
            query: "search the handler code",
        };

        let outcome = run_execute(&ctx, &mut phase).await.unwrap();

        assert!(matches!(outcome, PhaseOutcome::Next(AgentState::Execute)));
        assert_eq!(bed.router.calls.load(Ordering::SeqCst), 1);
        assert_eq!(alpha.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(bed.deps.selection_cache.len(), 1);
        assert_eq!(bed.deps.metrics.ucb1_cache_misses_total.get(), 1);
    }

    #[test]
    fn test_dedup_walk_takes_next_best_on_exact_duplicate() {
        let bed = testbed(
            &[EchoTool::named("alpha"), EchoTool::named("beta")],
            ScriptRouter::proposing(&[]),
            ScriptReasoner::answering(&[GROUNDED]),
            None,
        );
        let query = "main function handler";
        let mut exec = ExecutionState::new(&bed.config, query);
        exec.call_history.record(signature("alpha", query));
        let phase = PhaseContext {
            deps: &bed.deps,
            config: &bed.config,
            session: &*bed.session,
            exec: &mut exec,
            query,
        };

        let candidates = vec![score("alpha", 2.0), score("beta", 1.0)];
        let chosen = select_with_dedup(&phase, &candidates, None, &None).unwrap();
        assert_eq!(chosen.tool, "beta");
    }

    #[test]
    fn test_penalty_resort_rechecks_promoted_candidate() {
        // alpha gets a partial-overlap penalty; the re-sort promotes gamma,
        // which the walk has not yet visited and which exactly duplicates a
        // prior call. The walk must re-check gamma (blocked) and fall back
        // to alpha rather than invoking the duplicate.
        let bed = testbed(
            &[
                EchoTool::named("alpha"),
                EchoTool::named("beta"),
                EchoTool::named("gamma"),
            ],
            ScriptRouter::proposing(&[]),
            ScriptReasoner::answering(&[GROUNDED]),
            None,
        );
        let query = "main function handler";
        let mut exec = ExecutionState::new(&bed.config, query);
        exec.call_history.record(signature("alpha", "main function"));
        exec.call_history.record(signature("gamma", query));
        let phase = PhaseContext {
            deps: &bed.deps,
            config: &bed.config,
            session: &*bed.session,
            exec: &mut exec,
            query,
        };

        // alpha 2.0 - 2/3 penalty = 1.33, so gamma (1.9) leads the resort.
        let candidates = vec![
            score("alpha", 2.0),
            score("gamma", 1.9),
            score("beta", 1.0),
        ];
        let chosen = select_with_dedup(&phase, &candidates, None, &None).unwrap();
        assert_eq!(chosen.tool, "alpha");
    }

    #[test]
    fn test_dedup_walk_exhausts_to_none() {
        let bed = testbed(
            &[EchoTool::named("alpha"), EchoTool::named("beta")],
            ScriptRouter::proposing(&[]),
            ScriptReasoner::answering(&[GROUNDED]),
            None,
        );
        let query = "main function handler";
        let mut exec = ExecutionState::new(&bed.config, query);
        exec.call_history.record(signature("alpha", query));
        exec.call_history.record(signature("beta", query));
        let phase = PhaseContext {
            deps: &bed.deps,
            config: &bed.config,
            session: &*bed.session,
            exec: &mut exec,
            query,
        };

        let candidates = vec![score("alpha", 2.0), score("beta", 1.0)];
        assert!(select_with_dedup(&phase, &candidates, None, &None).is_none());
    }

    #[tokio::test]
    async fn test_all_duplicates_route_to_synthesis() {
        let alpha = EchoTool::named("alpha");
        let bed = testbed(
            &[Arc::clone(&alpha)],
            ScriptRouter::proposing(&["alpha"]),
            ScriptReasoner::answering(&[GROUNDED]),
            None,
        );
        let query = "find the handler";
        let ctx = CancellationToken::new();
        let mut exec = ExecutionState::new(&bed.config, query);
        exec.call_history.record(signature("alpha", query));
        let mut phase = PhaseContext {
            deps: &bed.deps,
            config: &bed.config,
            session: &*bed.session,
            exec: &mut exec,
            query,
        };

        let outcome = run_execute(&ctx, &mut phase).await.unwrap();

        match outcome {
            PhaseOutcome::Complete { answer } => assert_eq!(answer, GROUNDED),
            other => panic!("expected synthesis completion, got {:?}", phase_name(&other)),
        }
        assert_eq!(alpha.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_synthesis_escalates_then_feedback_then_completes() {
        let bed = testbed(
            &[EchoTool::named("alpha")],
            ScriptRouter::proposing(&[ANSWER_TOOL]),
            ScriptReasoner::answering(&[PHANTOM, PHANTOM, PHANTOM, GROUNDED]),
            None,
        );
        let query = "where does scheduling happen?";
        let ctx = CancellationToken::new();
        let mut exec = ExecutionState::new(&bed.config, query);
        exec.budget.enter_synthesis();

        let mut phase = PhaseContext {
            deps: &bed.deps,
            config: &bed.config,
            session: &*bed.session,
            exec: &mut exec,
            query,
        };
        let outcome = run_execute(&ctx, &mut phase).await.unwrap();

        // Three failed drafts exhaust the ladder; the fourth retry level is
        // the feedback loop back into exploration.
        assert!(matches!(outcome, PhaseOutcome::Next(AgentState::Execute)));
        assert_eq!(bed.reasoner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(exec.grounding_retries(), 0);
        assert!(exec.budget.can_explore());

        let prompts = bed.reasoner.prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 3);
        assert!(!prompts[0].contains("grounding problems"));
        assert!(prompts[1].contains("grounding problems"));
        assert!(prompts[2].contains("AVOID:"));
        assert!(prompts[2].contains("REQUIREMENTS:"));

        // The feedback round re-enters EXECUTE; the router concedes to the
        // answer sentinel and the grounded draft completes.
        let mut phase = PhaseContext {
            deps: &bed.deps,
            config: &bed.config,
            session: &*bed.session,
            exec: &mut exec,
            query,
        };
        let outcome = run_execute(&ctx, &mut phase).await.unwrap();
        match outcome {
            PhaseOutcome::Complete { answer } => assert_eq!(answer, GROUNDED),
            other => panic!("expected completion, got {:?}", phase_name(&other)),
        }
        assert_eq!(bed.reasoner.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_synthesis_retries_intent_announcement() {
        let bed = testbed(
            &[EchoTool::named("alpha")],
            ScriptRouter::proposing(&[]),
            ScriptReasoner::answering(&[
                "Let me start by examining the code structure",
                GROUNDED,
            ]),
            None,
        );
        let query = "where does scheduling happen?";
        let ctx = CancellationToken::new();
        let mut exec = ExecutionState::new(&bed.config, query);
        exec.budget.enter_synthesis();
        let mut phase = PhaseContext {
            deps: &bed.deps,
            config: &bed.config,
            session: &*bed.session,
            exec: &mut exec,
            query,
        };

        let outcome = run_execute(&ctx, &mut phase).await.unwrap();

        match outcome {
            PhaseOutcome::Complete { answer } => assert_eq!(answer, GROUNDED),
            other => panic!("expected completion, got {:?}", phase_name(&other)),
        }
        assert_eq!(bed.reasoner.calls.load(Ordering::SeqCst), 2);
    }

    fn phase_name(outcome: &PhaseOutcome) -> &'static str {
        match outcome {
            PhaseOutcome::Next(_) => "next",
            PhaseOutcome::Suspend { .. } => "suspend",
            PhaseOutcome::Complete { .. } => "complete",
        }
    }
}
