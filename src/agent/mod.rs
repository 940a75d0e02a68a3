//! The agent loop: session scheduling, phase dispatch, termination.
//!
//! Drives a session from IDLE through the phase graph to a terminal state
//! under a global concurrency cap, per-session acquire and cooperative
//! cancellation. Phase bodies live in [`phases`] and [`execute`].

mod execute;
mod phases;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, CapPolicy};
use crate::control::{IntentClassifier, Sanitizer, StepBudget};
use crate::error::{Error, Result};
use crate::events::{AgentEvent, EventBus, EventData};
use crate::graph::GraphProvider;
use crate::grounding::{EvidenceIndex, GroundingVerifier, Violation};
use crate::index::{ClauseChecker, ProofIndex};
use crate::metrics::CoreMetrics;
use crate::reasoner::ReasonerClient;
use crate::router::{FailedTool, RouterBackend, SelectionCache, Ucb1Scorer};
use crate::session::{
    AgentState, Message, Role, Session, SessionHandle, SessionId, SessionSnapshot, SessionStore,
};
use crate::tools::{ToolCallHistory, ToolRegistry};

/// External collaborators the loop drives.
pub struct AgentDeps {
    pub router: Arc<dyn RouterBackend>,
    pub reasoner: Arc<dyn ReasonerClient>,
    pub tools: Arc<ToolRegistry>,
    pub graph: Arc<dyn GraphProvider>,
    pub clauses: Option<Arc<dyn ClauseChecker>>,
    pub proofs: Option<Arc<dyn ProofIndex>>,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<CoreMetrics>,
    pub selection_cache: Arc<SelectionCache>,
}

/// Result of one Run or Continue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub session_id: SessionId,
    /// Final (or suspended) state
    pub state: AgentState,
    /// Sanitised, verified answer when COMPLETE was reached
    pub answer: Option<String>,
    /// Clarification question when the loop suspended in CLARIFY
    pub clarification: Option<String>,
    /// Structured error message when ERROR was reached
    pub error: Option<String>,
    /// Machine-readable code for `error`
    pub error_code: Option<String>,
    pub steps_taken: u32,
    pub tokens_used: u64,
    pub duration: Duration,
}

/// Per-run mutable state: budgets, scorers, histories, retry counters.
///
/// The grounding retry counter is scoped to one synthesis episode; a
/// feedback-triggered exploration round starts the next episode at zero.
pub(crate) struct ExecutionState {
    pub budget: StepBudget,
    pub scorer: Ucb1Scorer,
    pub call_history: ToolCallHistory,
    pub failed_tools: Vec<FailedTool>,
    pub evidence: EvidenceIndex,
    pub sanitizer: Sanitizer,
    pub intent: IntentClassifier,
    pub verifier: GroundingVerifier,
    pub last_violations: Vec<Violation>,
    pub clarified: bool,
    grounding_retries: u32,
}

impl ExecutionState {
    fn new(config: &AgentConfig, query: &str) -> Self {
        Self {
            budget: StepBudget::for_query(config.total_steps, query),
            scorer: Ucb1Scorer::default(),
            call_history: ToolCallHistory::new(config.call_history_cap),
            failed_tools: Vec::new(),
            evidence: EvidenceIndex::new(),
            sanitizer: Sanitizer::default(),
            intent: IntentClassifier::new(),
            verifier: GroundingVerifier::new(),
            last_violations: Vec::new(),
            clarified: false,
            grounding_retries: 0,
        }
    }

    /// Retry count within the current synthesis episode.
    pub fn grounding_retries(&self) -> u32 {
        self.grounding_retries
    }

    pub fn bump_grounding_retries(&mut self) {
        self.grounding_retries += 1;
    }

    /// Start a fresh synthesis episode (after success or a feedback loop).
    pub fn reset_grounding_retries(&mut self) {
        self.grounding_retries = 0;
    }

    /// Rebuild run state from a session resumed out of CLARIFY.
    async fn rebuild(config: &AgentConfig, query: &str, session: &SessionHandle) -> Self {
        let mut exec = Self::new(config, query);
        exec.clarified = true;
        session
            .read(|session: &Session| {
                for entry in &session.tool_history {
                    exec.scorer.record_selection(&entry.tool);
                    exec.budget.increment_step();
                }
                for message in &session.messages {
                    if message.role == Role::Tool {
                        let tool = message
                            .tool_call
                            .as_ref()
                            .and_then(|payload| payload.get("tool"))
                            .and_then(|name| name.as_str())
                            .unwrap_or("tool");
                        exec.evidence.add_tool_output(tool, &message.content);
                    }
                }
            })
            .await;
        exec
    }
}

/// Outcome of one phase execution.
pub(crate) enum PhaseOutcome {
    /// Transition to the next state and continue the loop.
    Next(AgentState),
    /// Leave the session in CLARIFY and return to the caller.
    Suspend { question: String },
    /// Transition to COMPLETE with a final answer.
    Complete { answer: String },
}

/// Everything a phase body needs.
pub(crate) struct PhaseContext<'a> {
    pub deps: &'a AgentDeps,
    pub config: &'a AgentConfig,
    pub session: &'a SessionHandle,
    pub exec: &'a mut ExecutionState,
    pub query: &'a str,
}

impl PhaseContext<'_> {
    /// Emit an event stamped with this session's id and step.
    pub async fn emit(&self, data: EventData) {
        let (id, step) = self
            .session
            .read(|session| (session.id, session.current_step))
            .await;
        self.deps.bus.emit(AgentEvent::new(id, step, data));
    }
}

/// The session scheduler and phase dispatcher.
pub struct AgentLoop {
    config: AgentConfig,
    deps: AgentDeps,
    store: SessionStore,
    semaphore: Arc<Semaphore>,
}

impl AgentLoop {
    pub fn new(config: AgentConfig, deps: AgentDeps) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_sessions));
        Self {
            config,
            deps,
            store: SessionStore::new(),
            semaphore,
        }
    }

    /// Create and register a session for a project root.
    pub async fn create_session(&self, project_root: impl Into<std::path::PathBuf>) -> SessionId {
        let handle = self.store.insert(Session::new(project_root)).await;
        handle.id()
    }

    /// The session store (read access for embedders).
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Drive a session from IDLE to a terminal state (or a CLARIFY
    /// suspension).
    ///
    /// Fails immediately, without touching the session, on an empty query,
    /// an unknown session, a non-IDLE session, or (with
    /// [`CapPolicy::Reject`]) a full concurrency cap. Cancellation and
    /// total-timeout expiry end the run with state ERROR and a
    /// cancellation-flavoured error in the outcome.
    pub async fn run(
        &self,
        ctx: &CancellationToken,
        session_id: SessionId,
        query: &str,
    ) -> Result<RunOutcome> {
        if query.trim().is_empty() {
            return Err(Error::invalid_input("query must not be empty"));
        }
        let session = self.store.require(session_id).await?;
        if session.state().await != AgentState::Idle {
            return Err(Error::invalid_input(format!(
                "session {session_id} is not idle"
            )));
        }

        let _permit = self.acquire_slot(ctx).await?;
        if !session.try_acquire() {
            return Err(Error::session_in_progress(session_id.to_string()));
        }

        session
            .update(|s| s.push_message(Message::user(query)))
            .await;
        self.deps.bus.emit(AgentEvent::new(
            session_id,
            0,
            EventData::SessionStart {
                query: query.to_string(),
            },
        ));

        let mut exec = ExecutionState::new(&self.config, query);
        let outcome = self.drive(ctx, &session, &mut exec, query).await;
        session.release();
        outcome
    }

    /// Resume a session waiting in CLARIFY with the user's input.
    pub async fn continue_session(
        &self,
        ctx: &CancellationToken,
        session_id: SessionId,
        input: &str,
    ) -> Result<RunOutcome> {
        if input.trim().is_empty() {
            return Err(Error::invalid_input("clarification input must not be empty"));
        }
        let session = self.store.require(session_id).await?;
        if session.state().await != AgentState::Clarify {
            return Err(Error::invalid_input(format!(
                "session {session_id} is not awaiting clarification"
            )));
        }

        let _permit = self.acquire_slot(ctx).await?;
        if !session.try_acquire() {
            return Err(Error::session_in_progress(session_id.to_string()));
        }

        session
            .update(|s| {
                s.push_message(Message::user(input));
                s.pending_clarification = None;
            })
            .await;
        let transition = session.transition(AgentState::Plan).await;
        if let Err(err) = transition {
            session.release();
            return Err(err);
        }

        let query = session
            .read(|s| {
                s.messages
                    .iter()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.clone())
                    .unwrap_or_else(|| input.to_string())
            })
            .await;
        let mut exec = ExecutionState::rebuild(&self.config, &query, &session).await;
        let outcome = self.drive(ctx, &session, &mut exec, &query).await;
        session.release();
        outcome
    }

    /// Force a non-terminal session into ERROR. No-op on terminal
    /// sessions.
    pub async fn abort(&self, session_id: SessionId) -> Result<()> {
        let session = self.store.require(session_id).await?;
        session.force_error("aborted by caller").await;
        Ok(())
    }

    /// Externally-visible snapshot of a session.
    pub async fn get_state(&self, session_id: SessionId) -> Option<SessionSnapshot> {
        match self.store.get(session_id).await {
            Some(session) => Some(session.snapshot().await),
            None => None,
        }
    }

    async fn acquire_slot(
        &self,
        ctx: &CancellationToken,
    ) -> Result<tokio::sync::OwnedSemaphorePermit> {
        match self.config.cap_policy {
            CapPolicy::Reject => self
                .semaphore
                .clone()
                .try_acquire_owned()
                .map_err(|_| Error::Capacity {
                    limit: self.config.max_concurrent_sessions,
                }),
            CapPolicy::Wait => {
                tokio::select! {
                    _ = ctx.cancelled() => Err(Error::cancelled("waiting for session slot")),
                    permit = self.semaphore.clone().acquire_owned() => {
                        permit.map_err(|_| Error::Internal("semaphore closed".into()))
                    }
                }
            }
        }
    }

    /// The phase loop. Exits on terminal state, CLARIFY suspension,
    /// cancellation or total-timeout.
    async fn drive(
        &self,
        ctx: &CancellationToken,
        session: &SessionHandle,
        exec: &mut ExecutionState,
        query: &str,
    ) -> Result<RunOutcome> {
        let started = std::time::Instant::now();
        let deadline = Instant::now() + self.config.total_timeout;
        let mut answer = None;
        let mut clarification = None;
        let mut run_error: Option<Error> = None;

        loop {
            let state = session.state().await;
            if state.is_terminal() {
                break;
            }

            if ctx.is_cancelled() {
                run_error = Some(self.fail(session, Error::cancelled("run cancelled")).await);
                break;
            }
            if Instant::now() >= deadline {
                run_error = Some(
                    self.fail(
                        session,
                        Error::timeout(self.config.total_timeout.as_millis() as u64),
                    )
                    .await,
                );
                break;
            }

            let phase_started = std::time::Instant::now();
            let tokens_before = session.read(|s| s.tokens_used).await;

            let mut phase = PhaseContext {
                deps: &self.deps,
                config: &self.config,
                session,
                exec: &mut *exec,
                query,
            };
            let outcome = tokio::select! {
                _ = ctx.cancelled() => {
                    run_error = Some(self.fail(session, Error::cancelled("run cancelled")).await);
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    run_error = Some(self.fail(
                        session,
                        Error::timeout(self.config.total_timeout.as_millis() as u64),
                    ).await);
                    break;
                }
                outcome = self.dispatch(ctx, state, &mut phase) => outcome,
            };

            match outcome {
                Ok(PhaseOutcome::Next(next)) => {
                    let reason = session.transition(next).await;
                    match reason {
                        Ok(reason) => {
                            self.complete_step(
                                session,
                                state,
                                next,
                                reason,
                                phase_started.elapsed(),
                                tokens_before,
                            )
                            .await;
                        }
                        Err(err) => {
                            run_error = Some(self.fail(session, err).await);
                            break;
                        }
                    }
                }
                Ok(PhaseOutcome::Suspend { question }) => {
                    let (id, step, tokens_now) = session
                        .update(|s| {
                            s.advance_step();
                            (s.id, s.current_step, s.tokens_used)
                        })
                        .await;
                    self.deps.bus.emit(AgentEvent::new(
                        id,
                        step,
                        EventData::StepComplete {
                            step,
                            duration_ms: phase_started.elapsed().as_millis() as u64,
                            tokens: tokens_now.saturating_sub(tokens_before),
                        },
                    ));
                    clarification = Some(question);
                    break;
                }
                Ok(PhaseOutcome::Complete { answer: text }) => {
                    match session.transition(AgentState::Complete).await {
                        Ok(reason) => {
                            self.complete_step(
                                session,
                                state,
                                AgentState::Complete,
                                reason,
                                phase_started.elapsed(),
                                tokens_before,
                            )
                            .await;
                            answer = Some(text);
                        }
                        Err(err) => {
                            run_error = Some(self.fail(session, err).await);
                        }
                    }
                    break;
                }
                Err(err) => {
                    run_error = Some(self.fail(session, err).await);
                    break;
                }
            }
        }

        let snapshot = session.snapshot().await;
        self.deps.bus.emit(AgentEvent::new(
            snapshot.id,
            snapshot.current_step,
            EventData::SessionEnd {
                state: snapshot.state,
                steps: snapshot.current_step,
                tokens: snapshot.tokens_used,
            },
        ));

        Ok(RunOutcome {
            session_id: snapshot.id,
            state: snapshot.state,
            answer,
            clarification,
            error: run_error.as_ref().map(|e| e.to_string()),
            error_code: run_error.as_ref().map(|e| e.code().to_string()),
            steps_taken: snapshot.current_step,
            tokens_used: snapshot.tokens_used,
            duration: started.elapsed(),
        })
    }

    async fn dispatch(
        &self,
        ctx: &CancellationToken,
        state: AgentState,
        phase: &mut PhaseContext<'_>,
    ) -> Result<PhaseOutcome> {
        match state {
            AgentState::Idle => Ok(PhaseOutcome::Next(AgentState::Init)),
            AgentState::Init => phases::run_init(ctx, phase).await,
            AgentState::Plan => phases::run_plan(ctx, phase).await,
            AgentState::Execute => execute::run_execute(ctx, phase).await,
            AgentState::Reflect => phases::run_reflect(ctx, phase).await,
            AgentState::Clarify => phases::run_clarify(phase).await,
            AgentState::Degraded => phases::run_degraded(phase).await,
            AgentState::Complete | AgentState::Error => Err(Error::invalid_input(
                "terminal sessions execute no further phases",
            )),
        }
    }

    /// Record a phase failure: session to ERROR, trace step, error event.
    async fn fail(&self, session: &SessionHandle, err: Error) -> Error {
        session.force_error(&err.to_string()).await;
        session
            .update(|s| s.record_trace("completion", format!("run ended: {err}")))
            .await;
        let (id, step) = session.read(|s| (s.id, s.current_step)).await;
        self.deps.bus.emit(AgentEvent::new(
            id,
            step,
            EventData::Error {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        ));
        err
    }

    /// Count a completed phase and publish its events.
    #[allow(clippy::too_many_arguments)]
    async fn complete_step(
        &self,
        session: &SessionHandle,
        from: AgentState,
        to: AgentState,
        reason: &str,
        elapsed: Duration,
        tokens_before: u64,
    ) {
        let (id, step, tokens_now) = session
            .update(|s| {
                s.advance_step();
                (s.id, s.current_step, s.tokens_used)
            })
            .await;

        self.deps.bus.emit(AgentEvent::new(
            id,
            step,
            EventData::StateTransition {
                from,
                to,
                reason: reason.to_string(),
            },
        ));
        self.deps.bus.emit(AgentEvent::new(
            id,
            step,
            EventData::StepComplete {
                step,
                duration_ms: elapsed.as_millis() as u64,
                tokens: tokens_now.saturating_sub(tokens_before),
            },
        ));
    }
}
