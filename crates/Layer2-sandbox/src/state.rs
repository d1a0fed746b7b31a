//! Submission state machine

use arena_foundation::{Error, Result};
use serde::{Deserialize, Serialize};

/// Possible states of a submission in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionState {
    /// Discovered, not yet looked at
    Pending,

    /// Security validation in progress
    Validating,

    /// Security validation failed
    Rejected,

    /// Compile phase (empty for interpreted languages)
    Compiling,

    /// Compiler failed or timed out
    CompileFailed,

    /// Run phase
    Running,

    /// Run phase hit the wall-clock deadline
    TimedOut,

    /// Killed by a resource ceiling
    ResourceExceeded,

    /// Non-zero exit or signal
    RuntimeError,

    /// Exited 0, output not yet checked
    Completed,

    /// Output below the compliance threshold
    OutputInvalid,

    /// Output accepted, eligible for ranking
    Reported,
}

impl SubmissionState {
    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Rejected
                | Self::CompileFailed
                | Self::TimedOut
                | Self::ResourceExceeded
                | Self::RuntimeError
                | Self::OutputInvalid
                | Self::Reported
        )
    }

    /// Check if the submission finished successfully
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Reported)
    }

    pub fn can_transition_to(&self, next: SubmissionState) -> bool {
        use SubmissionState::*;
        matches!(
            (self, next),
            (Pending, Validating)
                | (Validating, Rejected)
                | (Validating, Compiling)
                | (Compiling, CompileFailed)
                | (Compiling, Running)
                | (Running, TimedOut)
                | (Running, ResourceExceeded)
                | (Running, RuntimeError)
                | (Running, Completed)
                | (Completed, OutputInvalid)
                | (Completed, Reported)
        )
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn advance(self, next: SubmissionState) -> Result<SubmissionState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::Internal(format!(
                "illegal state transition {} -> {}",
                self, next
            )))
        }
    }

    /// Get display name for the state
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Validating => "Validating",
            Self::Rejected => "Rejected",
            Self::Compiling => "Compiling",
            Self::CompileFailed => "CompileFailed",
            Self::Running => "Running",
            Self::TimedOut => "TimedOut",
            Self::ResourceExceeded => "ResourceExceeded",
            Self::RuntimeError => "RuntimeError",
            Self::Completed => "Completed",
            Self::OutputInvalid => "OutputInvalid",
            Self::Reported => "Reported",
        }
    }

    /// Get a symbol for the state (for the text summary)
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Pending => "◯",
            Self::Validating | Self::Compiling | Self::Running => "⟳",
            Self::Rejected => "⊘",
            Self::CompileFailed => "⚒",
            Self::TimedOut => "⏱",
            Self::ResourceExceeded => "▲",
            Self::RuntimeError => "✗",
            Self::Completed => "…",
            Self::OutputInvalid => "≠",
            Self::Reported => "✓",
        }
    }
}

impl std::fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let state = SubmissionState::Pending
            .advance(SubmissionState::Validating)
            .and_then(|s| s.advance(SubmissionState::Compiling))
            .and_then(|s| s.advance(SubmissionState::Running))
            .and_then(|s| s.advance(SubmissionState::Completed))
            .and_then(|s| s.advance(SubmissionState::Reported))
            .unwrap();
        assert!(state.is_terminal());
        assert!(state.is_success());
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(SubmissionState::Pending
            .advance(SubmissionState::Running)
            .is_err());
        assert!(SubmissionState::Rejected
            .advance(SubmissionState::Compiling)
            .is_err());
        assert!(SubmissionState::TimedOut
            .advance(SubmissionState::Reported)
            .is_err());
    }

    #[test]
    fn test_terminal_states() {
        for state in [
            SubmissionState::Rejected,
            SubmissionState::CompileFailed,
            SubmissionState::TimedOut,
            SubmissionState::ResourceExceeded,
            SubmissionState::RuntimeError,
            SubmissionState::OutputInvalid,
            SubmissionState::Reported,
        ] {
            assert!(state.is_terminal(), "{} should be terminal", state);
        }
        assert!(!SubmissionState::Completed.is_terminal());
    }
}
