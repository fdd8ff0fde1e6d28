//! Saga state machine.

use serde::{Deserialize, Serialize};

/// The state of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Started ──┬──► Completed
///           └──► Compensating ──┬──► Compensated
///                               └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaState {
    /// Saga steps are being executed.
    #[default]
    Started,

    /// A step failed and compensating actions are in progress.
    Compensating,

    /// Every executed step was undone (terminal state).
    Compensated,

    /// All steps completed successfully (terminal state).
    Completed,

    /// A compensating action failed; manual intervention is required (terminal state).
    Failed,
}

impl SagaState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Compensated | SagaState::Failed
        )
    }

    /// Returns true if the saga's operation did not take effect.
    pub fn is_unsuccessful(&self) -> bool {
        matches!(self, SagaState::Compensated | SagaState::Failed)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Started => "STARTED",
            SagaState::Compensating => "COMPENSATING",
            SagaState::Compensated => "COMPENSATED",
            SagaState::Completed => "COMPLETED",
            SagaState::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_started() {
        assert_eq!(SagaState::default(), SagaState::Started);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SagaState::Started.is_terminal());
        assert!(!SagaState::Compensating.is_terminal());
        assert!(SagaState::Compensated.is_terminal());
        assert!(SagaState::Completed.is_terminal());
        assert!(SagaState::Failed.is_terminal());
    }

    #[test]
    fn test_unsuccessful_states() {
        assert!(SagaState::Compensated.is_unsuccessful());
        assert!(SagaState::Failed.is_unsuccessful());
        assert!(!SagaState::Completed.is_unsuccessful());
    }

    #[test]
    fn test_serialization_matches_display() {
        let json = serde_json::to_string(&SagaState::Compensated).unwrap();
        assert_eq!(json, "\"COMPENSATED\"");

        let state: SagaState = serde_json::from_str(&json).unwrap();
        assert_eq!(state.to_string(), "COMPENSATED");
    }
}
