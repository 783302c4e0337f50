use crate::session::Step;
use serde::Serialize;
use thiserror::Error;

/// A failure that stopped a stage from completing. The session is rolled back to
/// the last stable step before this error is handed to the caller.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[error("stage `{}` failed: {message}", step.as_str())]
pub struct StageError {
    kind: StageErrorKind,
    step: Step,
    message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// Bad local input (video format, missing title, malformed tracked item).
    Validation,
    /// The requested move is not legal from the current step.
    InvalidTransition,
    Upload,
    Detection,
    /// Polling budget ran out without a terminal status; the job may still finish.
    PollTimeout,
    Match,
    Persist,
    Cancelled,
}

impl StageError {
    pub fn new(kind: StageErrorKind, step: Step, message: impl Into<String>) -> Self {
        Self {
            kind,
            step,
            message: message.into(),
        }
    }

    pub fn validation(step: Step, message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Validation, step, message)
    }

    pub fn invalid_transition(from: Step, action: &str) -> Self {
        Self::new(
            StageErrorKind::InvalidTransition,
            from,
            format!("`{action}` is not allowed from `{}`", from.as_str()),
        )
    }

    pub fn cancelled(step: Step) -> Self {
        Self::new(StageErrorKind::Cancelled, step, "operation cancelled")
    }

    pub fn kind(&self) -> StageErrorKind {
        self.kind
    }

    /// Step whose operation failed.
    pub fn step(&self) -> Step {
        self.step
    }

    pub fn detail(&self) -> &str {
        &self.message
    }

    /// Whether the user should be offered a retry of the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            StageErrorKind::Upload
                | StageErrorKind::Detection
                | StageErrorKind::PollTimeout
                | StageErrorKind::Match
                | StageErrorKind::Persist
                | StageErrorKind::Cancelled
        )
    }
}
