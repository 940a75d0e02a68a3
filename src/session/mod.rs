//! Session lifecycle: state machine, session data, and the shared store.

mod state;
mod store;
mod types;

pub use state::AgentState;
pub use store::{SessionHandle, SessionStore};
pub use types::{
    Message, ReasoningTrace, Role, Session, SessionId, SessionSnapshot, ToolHistoryEntry,
    TraceStep,
};
