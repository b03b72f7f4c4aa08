use serde::{Deserialize, Serialize};

/// Events that drive task status transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TaskEvent {
    /// Begin (or resume) executing the task
    Start,
    /// A step is now waiting for approval
    RequestApproval,
    /// The waiting step was approved
    Approve,
    /// The waiting step was rejected
    Reject,
    /// All steps completed
    Complete,
    /// A step failed or the run request could not be built
    Fail(String),
    /// The task exceeded its overall time budget
    Timeout,
}

impl TaskEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::RequestApproval => "request_approval",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::Timeout => "timeout",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}

/// Events that drive step status transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum StepEvent {
    /// Step requires approval that has not been recorded yet
    RequestApproval,
    /// Approval rejection observed
    Reject,
    /// Approved (or auto-approved); the step is sent to the runner
    Start,
    /// The runner reported process exit
    Exit { exit_code: i32 },
    /// The step deadline elapsed before the runner reported exit
    Timeout,
    /// The step could not be started or the runner boundary faulted
    Fail(String),
}

impl StepEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RequestApproval => "request_approval",
            Self::Reject => "reject",
            Self::Start => "start",
            Self::Exit { .. } => "exit",
            Self::Timeout => "timeout",
            Self::Fail(_) => "fail",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}
