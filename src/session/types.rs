//! Core session types: Session, Message, ReasoningTrace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use uuid::Uuid;

use super::state::AgentState;

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// User/human input
    User,
    /// Assistant/model response
    Assistant,
    /// Tool execution result
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender
    pub role: Role,
    /// Content of the message
    pub content: String,
    /// Optional tool-call payload carried by assistant messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<Value>,
}

impl Message {
    /// Create a new message with just role and content.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call: None,
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a tool result message.
    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    /// Attach a tool-call payload.
    pub fn with_tool_call(mut self, payload: Value) -> Self {
        self.tool_call = Some(payload);
        self
    }

    /// Approximate token count, ~4 chars per token for English text.
    pub fn approx_tokens(&self) -> u64 {
        (self.content.len() / 4) as u64
    }
}

/// One recorded step in a session's reasoning trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    /// Step number at the time of recording
    pub step: u32,
    /// Phase that produced this entry
    pub phase: String,
    /// What happened
    pub detail: String,
    /// When it happened
    pub at: DateTime<Utc>,
}

/// Optional audit trail of what the loop did and why.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningTrace {
    pub steps: Vec<TraceStep>,
}

impl ReasoningTrace {
    pub fn record(&mut self, step: u32, phase: impl Into<String>, detail: impl Into<String>) {
        self.steps.push(TraceStep {
            step,
            phase: phase.into(),
            detail: detail.into(),
            at: Utc::now(),
        });
    }
}

/// A summary of one completed tool invocation, consumed by the router to
/// avoid re-proposing identical tools. Append-only per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolHistoryEntry {
    /// Tool name
    pub tool: String,
    /// One-line summary of what was learned
    pub summary: String,
    /// Whether the invocation succeeded
    pub success: bool,
    /// Step at which the tool ran
    pub step: u32,
}

/// In-memory state of one exploration session.
///
/// Mutated only by the loop task currently holding the session's acquire
/// flag; destroyed at process end or by explicit store eviction.
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque unique id
    pub id: SessionId,
    /// Root of the source tree under exploration
    pub project_root: PathBuf,
    /// Graph index id, once INIT succeeds
    pub graph_id: Option<String>,
    /// Current state
    pub state: AgentState,
    /// Completed phases in this session; monotonically increasing
    pub current_step: u32,
    /// Tokens consumed so far; monotonically increasing
    pub tokens_used: u64,
    /// Creation timestamp (UTC)
    pub created_at: DateTime<Utc>,
    /// Last activity timestamp (UTC)
    pub last_active: DateTime<Utc>,
    /// Whether the session runs without a graph index
    pub degraded_mode: bool,
    /// Assembled context handed to the reasoner
    pub context: String,
    /// Conversation history
    pub messages: Vec<Message>,
    /// Append-only log of completed tool invocations
    pub tool_history: Vec<ToolHistoryEntry>,
    /// Pending clarification question, set by PLAN or REFLECT
    pub pending_clarification: Option<String>,
    /// Optional audit trail
    pub trace: Option<ReasoningTrace>,
}

impl Session {
    /// Create an idle session for a project root.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            project_root: project_root.into(),
            graph_id: None,
            state: AgentState::Idle,
            current_step: 0,
            tokens_used: 0,
            created_at: now,
            last_active: now,
            degraded_mode: false,
            context: String::new(),
            messages: Vec::new(),
            tool_history: Vec::new(),
            pending_clarification: None,
            trace: Some(ReasoningTrace::default()),
        }
    }

    /// Append a message and refresh the activity timestamp.
    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        self.last_active = Utc::now();
    }

    /// Record tokens consumed. The counter only grows.
    pub fn add_tokens(&mut self, tokens: u64) {
        self.tokens_used = self.tokens_used.saturating_add(tokens);
    }

    /// Record a completed phase. The counter only grows.
    pub fn advance_step(&mut self) {
        self.current_step += 1;
        self.last_active = Utc::now();
    }

    /// Record a trace step if tracing is enabled.
    pub fn record_trace(&mut self, phase: &str, detail: impl Into<String>) {
        let step = self.current_step;
        if let Some(trace) = self.trace.as_mut() {
            trace.record(step, phase, detail);
        }
    }
}

/// Externally-visible snapshot of a session, returned by GetState.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub state: AgentState,
    pub current_step: u32,
    pub tokens_used: u64,
    pub degraded_mode: bool,
    pub tool_history_len: usize,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub pending_clarification: Option<String>,
}

impl From<&Session> for SessionSnapshot {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id,
            state: session.state,
            current_step: session.current_step,
            tokens_used: session.tokens_used,
            degraded_mode: session.degraded_mode,
            tool_history_len: session.tool_history.len(),
            created_at: session.created_at,
            last_active: session.last_active,
            pending_clarification: session.pending_clarification.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_idle() {
        let session = Session::new("/tmp/project");
        assert_eq!(session.state, AgentState::Idle);
        assert_eq!(session.current_step, 0);
        assert_eq!(session.tokens_used, 0);
        assert!(!session.degraded_mode);
        assert!(session.tool_history.is_empty());
    }

    #[test]
    fn test_counters_are_monotonic() {
        let mut session = Session::new("/tmp/project");
        session.add_tokens(10);
        session.add_tokens(0);
        session.add_tokens(5);
        assert_eq!(session.tokens_used, 15);

        session.advance_step();
        session.advance_step();
        assert_eq!(session.current_step, 2);
    }

    #[test]
    fn test_message_constructors() {
        assert_eq!(Message::user("hi").role, Role::User);
        assert_eq!(Message::system("x").role, Role::System);
        assert_eq!(Message::tool("out").role, Role::Tool);
        let m = Message::assistant("a").with_tool_call(serde_json::json!({"tool": "grep"}));
        assert!(m.tool_call.is_some());
    }

    #[test]
    fn test_trace_records_current_step() {
        let mut session = Session::new("/tmp/project");
        session.advance_step();
        session.record_trace("execute", "ran grep");
        let trace = session.trace.as_ref().unwrap();
        assert_eq!(trace.steps.len(), 1);
        assert_eq!(trace.steps[0].step, 1);
        assert_eq!(trace.steps[0].phase, "execute");
    }

    #[test]
    fn test_snapshot_reflects_session() {
        let mut session = Session::new("/tmp/project");
        session.add_tokens(42);
        session.tool_history.push(ToolHistoryEntry {
            tool: "grep".into(),
            summary: "found 3 matches".into(),
            success: true,
            step: 1,
        });
        let snap = SessionSnapshot::from(&session);
        assert_eq!(snap.tokens_used, 42);
        assert_eq!(snap.tool_history_len, 1);
        assert_eq!(snap.state, AgentState::Idle);
    }
}
