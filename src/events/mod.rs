//! Typed events broadcast by the agent loop.
//!
//! Every state transition, tool invocation, model call and safety check is
//! published on the [`EventBus`] so that adapters (TUIs, log sinks, replay
//! tooling) can observe execution without coupling to the loop.

mod bus;

pub use bus::{EventBus, SubscriberId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::{AgentState, SessionId};

/// Types of events emitted during agent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StateTransition,
    ToolInvocation,
    ToolResult,
    ContextUpdate,
    LlmRequest,
    LlmResponse,
    SafetyCheck,
    Reflection,
    Error,
    SessionStart,
    SessionEnd,
    StepComplete,
    ToolForcing,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StateTransition => "state_transition",
            Self::ToolInvocation => "tool_invocation",
            Self::ToolResult => "tool_result",
            Self::ContextUpdate => "context_update",
            Self::LlmRequest => "llm_request",
            Self::LlmResponse => "llm_response",
            Self::SafetyCheck => "safety_check",
            Self::Reflection => "reflection",
            Self::Error => "error",
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
            Self::StepComplete => "step_complete",
            Self::ToolForcing => "tool_forcing",
        };
        write!(f, "{}", s)
    }
}

/// Typed payload carried by an event. One variant per event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventData {
    StateTransition {
        from: AgentState,
        to: AgentState,
        reason: String,
    },
    ToolInvocation {
        tool: String,
        step: u32,
        reason: String,
    },
    ToolResult {
        tool: String,
        success: bool,
        duration_ms: u64,
        summary: String,
    },
    ContextUpdate {
        detail: String,
    },
    LlmRequest {
        model: String,
        purpose: String,
    },
    LlmResponse {
        model: String,
        tokens: u64,
        duration_ms: u64,
    },
    SafetyCheck {
        check: String,
        passed: bool,
        detail: String,
    },
    Reflection {
        decision: String,
    },
    Error {
        code: String,
        message: String,
    },
    SessionStart {
        query: String,
    },
    SessionEnd {
        state: AgentState,
        steps: u32,
        tokens: u64,
    },
    StepComplete {
        step: u32,
        duration_ms: u64,
        tokens: u64,
    },
    ToolForcing {
        tool: String,
        viable_count: usize,
        blocked: Vec<String>,
    },
}

impl EventData {
    /// The event type this payload belongs to.
    pub fn event_type(&self) -> EventType {
        match self {
            Self::StateTransition { .. } => EventType::StateTransition,
            Self::ToolInvocation { .. } => EventType::ToolInvocation,
            Self::ToolResult { .. } => EventType::ToolResult,
            Self::ContextUpdate { .. } => EventType::ContextUpdate,
            Self::LlmRequest { .. } => EventType::LlmRequest,
            Self::LlmResponse { .. } => EventType::LlmResponse,
            Self::SafetyCheck { .. } => EventType::SafetyCheck,
            Self::Reflection { .. } => EventType::Reflection,
            Self::Error { .. } => EventType::Error,
            Self::SessionStart { .. } => EventType::SessionStart,
            Self::SessionEnd { .. } => EventType::SessionEnd,
            Self::StepComplete { .. } => EventType::StepComplete,
            Self::ToolForcing { .. } => EventType::ToolForcing,
        }
    }
}

/// Optional correlation metadata attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

impl EventMetadata {
    pub fn with_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::default()
        }
    }
}

/// An event emitted during agent execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Unique event id
    pub id: Uuid,
    /// Type tag, derived from the payload
    pub event_type: EventType,
    /// Session this event belongs to
    pub session_id: SessionId,
    /// When the event was emitted (UTC)
    pub timestamp: DateTime<Utc>,
    /// Session step number at emission time
    pub step: u32,
    /// Typed payload
    pub data: EventData,
    /// Optional correlation metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
}

impl AgentEvent {
    /// Create a new event for a session.
    pub fn new(session_id: SessionId, step: u32, data: EventData) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: data.event_type(),
            session_id,
            timestamp: Utc::now(),
            step,
            data,
            metadata: None,
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tag_matches_payload() {
        let data = EventData::StepComplete {
            step: 3,
            duration_ms: 12,
            tokens: 100,
        };
        let event = AgentEvent::new(SessionId::new(), 3, data.clone());
        assert_eq!(event.event_type, EventType::StepComplete);
        assert_eq!(event.data, data);
    }

    #[test]
    fn test_serde_round_trip() {
        let event = AgentEvent::new(
            SessionId::new(),
            1,
            EventData::ToolResult {
                tool: "grep".into(),
                success: true,
                duration_ms: 40,
                summary: "2 matches".into(),
            },
        )
        .with_metadata(EventMetadata::with_source("execute"));

        let json = serde_json::to_string(&event).unwrap();
        let back: AgentEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
