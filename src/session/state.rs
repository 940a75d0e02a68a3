//! Agent state machine: the nine session states and their legal transitions.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// State of an exploration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    /// Created, no run started
    Idle,
    /// Initializing the code-graph index
    Init,
    /// Assembling context and classifying the query
    Plan,
    /// Tool-selection / invocation / synthesis cycle
    Execute,
    /// Exploration budget exhausted, deciding how to finish
    Reflect,
    /// Waiting for user clarification
    Clarify,
    /// Operating without the graph index
    Degraded,
    /// Terminal: answer produced
    Complete,
    /// Terminal: run failed
    Error,
}

impl AgentState {
    /// Terminal states are sticky: no further transitions are permitted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Lower-case name used in events and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Init => "init",
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Reflect => "reflect",
            Self::Clarify => "clarify",
            Self::Degraded => "degraded",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    /// Whether `self -> target` appears in the legal transition table.
    pub fn can_transition_to(&self, target: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (*self, target),
            (Idle, Init)
                | (Init, Plan)
                | (Init, Degraded)
                | (Init, Error)
                | (Plan, Execute)
                | (Plan, Clarify)
                | (Plan, Error)
                | (Clarify, Plan)
                | (Clarify, Error)
                | (Execute, Execute)
                | (Execute, Reflect)
                | (Execute, Complete)
                | (Execute, Error)
                | (Reflect, Execute)
                | (Reflect, Complete)
                | (Reflect, Clarify)
                | (Reflect, Error)
                | (Degraded, Plan)
                | (Degraded, Error)
        )
    }

    /// Canonical human-readable reason for a legal transition, for audit
    /// trails and event emission.
    pub fn transition_reason(&self, target: AgentState) -> &'static str {
        use AgentState::*;
        match (*self, target) {
            (Idle, Init) => "run started",
            (Init, Plan) => "graph index ready",
            (Init, Degraded) => "graph unavailable, continuing degraded",
            (Plan, Execute) => "plan assembled",
            (Plan, Clarify) => "query ambiguous",
            (Clarify, Plan) => "clarification received",
            (Execute, Execute) => "exploration step complete",
            (Execute, Reflect) => "exploration budget exhausted",
            (Execute, Complete) => "answer synthesized",
            (Reflect, Execute) => "entering synthesis",
            (Reflect, Complete) => "completing with collected evidence",
            (Reflect, Clarify) => "evidence insufficient, asking user",
            (Degraded, Plan) => "replanning with restricted tools",
            (_, Error) => "unrecoverable failure",
            _ => "unknown",
        }
    }

    /// Validate `self -> target` and return the canonical reason.
    ///
    /// Fails with an invalid-transition error when the pair is not in the
    /// table; terminal states have no outgoing edges.
    pub fn check_transition(&self, target: AgentState) -> Result<&'static str> {
        if self.can_transition_to(target) {
            Ok(self.transition_reason(target))
        } else {
            Err(Error::invalid_transition(self.as_str(), target.as_str()))
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AgentState::*;

    const ALL: [AgentState; 9] = [
        Idle, Init, Plan, Execute, Reflect, Clarify, Degraded, Complete, Error,
    ];

    #[test]
    fn test_legal_transitions() {
        assert!(Idle.can_transition_to(Init));
        assert!(Init.can_transition_to(Plan));
        assert!(Init.can_transition_to(Degraded));
        assert!(Plan.can_transition_to(Execute));
        assert!(Plan.can_transition_to(Clarify));
        assert!(Clarify.can_transition_to(Plan));
        assert!(Execute.can_transition_to(Execute));
        assert!(Execute.can_transition_to(Reflect));
        assert!(Execute.can_transition_to(Complete));
        assert!(Reflect.can_transition_to(Execute));
        assert!(Reflect.can_transition_to(Complete));
        assert!(Reflect.can_transition_to(Clarify));
        assert!(Degraded.can_transition_to(Plan));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for target in ALL {
            assert!(!Complete.can_transition_to(target), "complete -> {target}");
            assert!(!Error.can_transition_to(target), "error -> {target}");
        }
        assert!(Complete.is_terminal());
        assert!(Error.is_terminal());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        assert!(!Idle.can_transition_to(Execute));
        assert!(!Idle.can_transition_to(Complete));
        assert!(!Plan.can_transition_to(Reflect));
        assert!(!Clarify.can_transition_to(Execute));
        assert!(!Degraded.can_transition_to(Execute));

        let err = Idle.check_transition(Complete).unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
    }

    #[test]
    fn test_every_non_terminal_can_fail() {
        for state in [Init, Plan, Execute, Reflect, Clarify, Degraded] {
            assert!(state.can_transition_to(Error), "{state} -> error");
        }
        // Idle is the one non-terminal state without an error edge: a run
        // that never started has nothing to fail.
        assert!(!Idle.can_transition_to(Error));
    }

    #[test]
    fn test_reasons_are_canonical() {
        assert_eq!(Idle.check_transition(Init).unwrap(), "run started");
        assert_eq!(
            Execute.check_transition(Reflect).unwrap(),
            "exploration budget exhausted"
        );
        assert_eq!(
            Reflect.check_transition(Execute).unwrap(),
            "entering synthesis"
        );
    }
}
