use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a provisioning task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting to be dispatched by the scheduler
    #[default]
    Pending,
    /// Dispatched; a step is executing or about to execute
    Running,
    /// A step is blocked on human approval
    Approving,
    /// An approval was rejected; the pipeline was aborted
    Rejected,
    /// A step failed, timed out, or the run request could not be built
    Failed,
    /// Every step finished successfully
    Complete,
    /// The task as a whole exceeded its time budget
    Timeout,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        Self::Pending,
        Self::Running,
        Self::Approving,
        Self::Rejected,
        Self::Failed,
        Self::Complete,
        Self::Timeout,
    ];

    /// No further transitions are allowed from a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Failed | Self::Complete | Self::Timeout
        )
    }

    /// Statuses that hold a slot on a runner
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Approving)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Approving => "approving",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Complete => "complete",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "approving" => Ok(Self::Approving),
            "rejected" => Ok(Self::Rejected),
            "failed" => Ok(Self::Failed),
            "complete" => Ok(Self::Complete),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// Status of a single pipeline step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Approving,
    Rejected,
    Running,
    Failed,
    Complete,
    Timeout,
}

impl StepStatus {
    pub const ALL: [StepStatus; 7] = [
        Self::Pending,
        Self::Approving,
        Self::Rejected,
        Self::Running,
        Self::Failed,
        Self::Complete,
        Self::Timeout,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Failed | Self::Complete | Self::Timeout
        )
    }

    /// Terminal statuses that fail the owning task
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approving => "approving",
            Self::Rejected => "rejected",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Complete => "complete",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approving" => Ok(Self::Approving),
            "rejected" => Ok(Self::Rejected),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            "complete" => Ok(Self::Complete),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Invalid step status: {s}")),
        }
    }
}
