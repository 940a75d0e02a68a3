//! # scout-core
//!
//! Control core for an autonomous code-exploration agent: given a
//! natural-language question about a source tree, it drives a bounded,
//! tool-using reasoning loop that picks exploration tools, interprets
//! their output through a streaming reasoner, and verifies that the final
//! answer is grounded in evidence actually collected.
//!
//! ## Core Components
//!
//! - **Session**: state machine, lifecycle, and the concurrency-safe store
//! - **Agent**: the phase loop (INIT/PLAN/EXECUTE/REFLECT/CLARIFY/DEGRADED)
//! - **Router**: fast next-tool selection with UCB1 scoring, learned-clause
//!   blocking and a generation-aware cache
//! - **Reasoner**: streaming LLM clients (NDJSON and SSE wire formats)
//! - **Control**: step budgets, intent classification, output sanitisation
//! - **Grounding**: post-synthesis verification with escalating retries
//!
//! ## Example
//!
//! ```rust,ignore
//! use scout_core::{AgentConfig, AgentLoop};
//! use tokio_util::sync::CancellationToken;
//!
//! let agent = AgentLoop::new(AgentConfig::default(), deps);
//! let session = agent.create_session("/path/to/project").await;
//! let outcome = agent
//!     .run(&CancellationToken::new(), session, "where is the retry logic?")
//!     .await?;
//! println!("{}", outcome.answer.unwrap_or_default());
//! ```

pub mod agent;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod graph;
pub mod grounding;
pub mod index;
pub mod metrics;
pub mod models;
pub mod reasoner;
pub mod router;
pub mod session;
pub mod tools;

// Re-exports for convenience
pub use agent::{AgentDeps, AgentLoop, RunOutcome};
pub use config::{AgentConfig, CapPolicy, DegradedPolicy};
pub use control::{
    BudgetSnapshot, IntentClassifier, IntentResult, ModelFamily, QueryComplexity,
    SanitizeOutcome, Sanitizer, StepBudget,
};
pub use error::{Error, Result};
pub use events::{AgentEvent, EventBus, EventData, EventMetadata, EventType, SubscriberId};
pub use graph::{GraphProvider, UnavailableGraph};
pub use grounding::{
    EvidenceIndex, GroundingVerification, GroundingVerifier, Severity, Strictness, Violation,
    ViolationKind,
};
pub use index::{ClauseChecker, ClauseVerdict, ProofIndex, ProofRecord, ProofStatus};
pub use metrics::CoreMetrics;
pub use models::{ManagedModel, ModelWarmConfig, MultiModelManager};
pub use reasoner::{
    AnthropicClient, ChatToolOutcome, Completion, GenerationParams, OllamaClient,
    ReasonerClient, StreamConfig, StreamEvent, StreamHandler, StreamStats, TokenBucket,
    ToolCallRequest,
};
pub use router::{
    check_forced_move, CachedSelection, FailedTool, ForcedMove, LlmRouter, RouterBackend,
    RouterCodeContext, RouterSelection, SelectionCache, StateKey, ToolScore, Ucb1Config,
    Ucb1Scorer,
};
pub use session::{
    AgentState, Message, ReasoningTrace, Role, Session, SessionHandle, SessionId,
    SessionSnapshot, SessionStore, ToolHistoryEntry,
};
pub use tools::{
    extract_query_terms, SemanticStatus, ToolAdapter, ToolCallHistory, ToolCallSignature,
    ToolInvocation, ToolParameters, ToolRegistry, ToolResult, ToolSpec, ANSWER_TOOL,
};
