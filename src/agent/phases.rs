//! Phase bodies: INIT, PLAN, REFLECT, CLARIFY, DEGRADED.
//!
//! EXECUTE, the central cycle, lives in [`super::execute`].

use tokio_util::sync::CancellationToken;

use crate::config::DegradedPolicy;
use crate::error::Result;
use crate::events::EventData;
use crate::session::AgentState;
use crate::tools::extract_query_terms;

use super::{PhaseContext, PhaseOutcome};

/// INIT: ask the graph provider for an index.
///
/// Success stores the graph id and moves to PLAN. Failure follows the
/// configured policy: DEGRADED with the degraded flag set, or ERROR.
pub(crate) async fn run_init(
    ctx: &CancellationToken,
    phase: &mut PhaseContext<'_>,
) -> Result<PhaseOutcome> {
    let project_root = phase.session.read(|s| s.project_root.clone()).await;

    if !phase.deps.graph.is_available() {
        return degrade_or_fail(phase, "graph provider unavailable").await;
    }

    let initialized = tokio::select! {
        _ = ctx.cancelled() => {
            return Err(crate::error::Error::cancelled("graph initialization"))
        }
        result = phase.deps.graph.initialize(&project_root) => result,
    };

    match initialized {
        Ok(graph_id) => {
            tracing::info!(graph_id = %graph_id, "graph index ready");
            phase
                .session
                .update(|s| s.graph_id = Some(graph_id.clone()))
                .await;
            phase
                .emit(EventData::ContextUpdate {
                    detail: format!("graph index {graph_id} ready"),
                })
                .await;
            Ok(PhaseOutcome::Next(AgentState::Plan))
        }
        Err(err) if err.is_cancellation() => Err(err),
        Err(err) => degrade_or_fail(phase, &err.to_string()).await,
    }
}

async fn degrade_or_fail(phase: &mut PhaseContext<'_>, detail: &str) -> Result<PhaseOutcome> {
    match phase.config.degraded_policy {
        DegradedPolicy::Degrade => {
            tracing::warn!(detail, "continuing without graph index");
            phase.session.update(|s| s.degraded_mode = true).await;
            Ok(PhaseOutcome::Next(AgentState::Degraded))
        }
        DegradedPolicy::Fail => Err(crate::error::Error::permanent("graph", detail.to_string())),
    }
}

/// PLAN: assemble the initial context and classify the query; ambiguous
/// queries route to CLARIFY.
pub(crate) async fn run_plan(
    _ctx: &CancellationToken,
    phase: &mut PhaseContext<'_>,
) -> Result<PhaseOutcome> {
    let complexity = phase.exec.budget.snapshot().complexity;
    let context = phase
        .session
        .read(|s| {
            let mut context = format!(
                "Project root: {}\nQuery: {}\nComplexity: {complexity}\n",
                s.project_root.display(),
                phase.query,
            );
            match &s.graph_id {
                Some(graph_id) => context.push_str(&format!("Graph index: {graph_id}\n")),
                None if s.degraded_mode => {
                    context.push_str("No graph index; restricted tool-set.\n")
                }
                None => {}
            }
            context
        })
        .await;
    phase
        .session
        .update(|s| s.context = context.clone())
        .await;
    phase
        .emit(EventData::ContextUpdate {
            detail: format!("initial context assembled ({} bytes)", context.len()),
        })
        .await;

    let ambiguity = ambiguity_score(phase.query);
    if ambiguity >= phase.config.clarify_threshold && !phase.exec.clarified {
        let question = format!(
            "The query \"{}\" is too broad to explore efficiently. \
             Which file, symbol or behaviour should I focus on?",
            phase.query
        );
        phase
            .session
            .update(|s| s.pending_clarification = Some(question))
            .await;
        return Ok(PhaseOutcome::Next(AgentState::Clarify));
    }

    Ok(PhaseOutcome::Next(AgentState::Execute))
}

/// How underspecified a query is, in [0, 1].
pub(crate) fn ambiguity_score(query: &str) -> f64 {
    let terms = extract_query_terms(query);
    let mut score: f64 = 0.0;

    match terms.len() {
        0..=1 => score += 0.6,
        2 => score += 0.4,
        3..=4 => score += 0.2,
        _ => {}
    }

    let has_code_anchor = query.contains('/')
        || query.contains("::")
        || query.contains('`')
        || query.contains('_')
        || query
            .split_whitespace()
            .any(|word| word.chars().any(|c| c.is_uppercase()) && word.len() > 2);
    if !has_code_anchor {
        score += 0.3;
    }

    let vague_words = ["it", "this", "that", "stuff", "thing", "things", "everything"];
    if query
        .split_whitespace()
        .any(|word| vague_words.contains(&word.to_lowercase().trim_matches('?')))
    {
        score += 0.2;
    }

    score.min(1.0)
}

/// REFLECT: the exploration budget ran out without a completion signal.
///
/// With successful evidence, enter synthesis. With nothing usable and no
/// earlier clarification, ask the user. Otherwise complete with the best
/// evidence available.
pub(crate) async fn run_reflect(
    _ctx: &CancellationToken,
    phase: &mut PhaseContext<'_>,
) -> Result<PhaseOutcome> {
    let (successes, summaries) = phase
        .session
        .read(|s| {
            let successes = s.tool_history.iter().filter(|e| e.success).count();
            let summaries: Vec<String> = s
                .tool_history
                .iter()
                .filter(|e| e.success)
                .map(|e| format!("{}: {}", e.tool, e.summary))
                .collect();
            (successes, summaries)
        })
        .await;

    if successes > 0 {
        phase
            .emit(EventData::Reflection {
                decision: format!("entering synthesis with {successes} successful observations"),
            })
            .await;
        phase.exec.budget.enter_synthesis();
        return Ok(PhaseOutcome::Next(AgentState::Execute));
    }

    if !phase.exec.clarified {
        phase
            .emit(EventData::Reflection {
                decision: "no usable evidence; requesting clarification".to_string(),
            })
            .await;
        let question = "Exploration found no usable evidence. \
                        Can you point at a file, module or behaviour to start from?"
            .to_string();
        phase
            .session
            .update(|s| s.pending_clarification = Some(question))
            .await;
        return Ok(PhaseOutcome::Next(AgentState::Clarify));
    }

    phase
        .emit(EventData::Reflection {
            decision: "completing with collected evidence".to_string(),
        })
        .await;
    let answer = if summaries.is_empty() {
        "Exploration could not gather enough evidence to answer the question.".to_string()
    } else {
        format!(
            "Based on the evidence gathered so far:\n{}",
            summaries.join("\n")
        )
    };
    Ok(PhaseOutcome::Complete { answer })
}

/// CLARIFY: surface the pending question and suspend the loop. Resumption
/// happens through Continue.
pub(crate) async fn run_clarify(phase: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
    phase.exec.clarified = true;
    let question = phase
        .session
        .read(|s| s.pending_clarification.clone())
        .await
        .unwrap_or_else(|| "Could you narrow down the question?".to_string());
    Ok(PhaseOutcome::Suspend { question })
}

/// DEGRADED: note the restricted tool-set and replan.
pub(crate) async fn run_degraded(phase: &mut PhaseContext<'_>) -> Result<PhaseOutcome> {
    let available = phase.deps.tools.degraded_specs().len();
    phase
        .emit(EventData::ContextUpdate {
            detail: format!("degraded mode: {available} tools available without graph index"),
        })
        .await;
    Ok(PhaseOutcome::Next(AgentState::Plan))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguity_scores() {
        // Vague, short, no anchors.
        assert!(ambiguity_score("fix it") >= 0.75);
        assert!(ambiguity_score("how does this work?") >= 0.6);

        // Specific queries with anchors stay below the default threshold.
        assert!(ambiguity_score("where is SessionStore::evict defined") < 0.75);
        assert!(ambiguity_score("explain the retry logic in src/agent/execute.rs") < 0.75);
        assert!(
            ambiguity_score("how does the router cache interact with clause generations") < 0.75
        );
    }
}
