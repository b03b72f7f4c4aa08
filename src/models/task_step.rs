//! # Task Step Model
//!
//! One row per pipeline stage of a task. Templated rows are created in a batch
//! with the task; callback and collect rows are appended after the main
//! sequence finishes, with indices beyond the template.
//!
//! Maps to the `stackrun_task_steps` table:
//! ```sql
//! CREATE TABLE stackrun_task_steps (
//!   step_id BIGSERIAL PRIMARY KEY,
//!   task_id BIGINT NOT NULL REFERENCES stackrun_tasks(task_id),
//!   step_index INTEGER NOT NULL,
//!   step_type TEXT NOT NULL,
//!   name TEXT NOT NULL DEFAULT '',
//!   args JSONB NOT NULL DEFAULT '[]',
//!   must_approval BOOLEAN NOT NULL DEFAULT false,
//!   status TEXT NOT NULL DEFAULT 'pending',
//!   approver_id TEXT,
//!   message TEXT NOT NULL DEFAULT '',
//!   log_path TEXT NOT NULL,
//!   retry_count INTEGER NOT NULL DEFAULT 0,
//!   start_at TIMESTAMPTZ,
//!   end_at TIMESTAMPTZ,
//!   created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!   UNIQUE (task_id, step_index)
//! );
//! ```

use crate::state_machine::StepStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepType {
    Init,
    Plan,
    Apply,
    Destroy,
    Play,
    Command,
    OnSuccess,
    OnFail,
    Collect,
}

impl StepType {
    pub fn requires_approval_by_default(&self) -> bool {
        matches!(self, Self::Apply | Self::Destroy)
    }

    /// Callback and collect steps run after the main sequence
    pub fn is_post_step(&self) -> bool {
        matches!(self, Self::OnSuccess | Self::OnFail | Self::Collect)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Play => "play",
            Self::Command => "command",
            Self::OnSuccess => "onSuccess",
            Self::OnFail => "onFail",
            Self::Collect => "collect",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Self::Init),
            "plan" => Ok(Self::Plan),
            "apply" => Ok(Self::Apply),
            "destroy" => Ok(Self::Destroy),
            "play" => Ok(Self::Play),
            "command" => Ok(Self::Command),
            "onSuccess" => Ok(Self::OnSuccess),
            "onFail" => Ok(Self::OnFail),
            "collect" => Ok(Self::Collect),
            _ => Err(format!("Invalid step type: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub step_id: i64,
    pub task_id: i64,
    /// 0-based execution order within the task
    pub index: i32,
    pub step_type: StepType,
    pub name: String,
    pub args: Vec<String>,
    pub must_approval: bool,
    pub status: StepStatus,
    /// Set by the approval layer once a human has approved the step
    pub approver_id: Option<String>,
    pub message: String,
    pub log_path: String,
    /// Number of status-stream reconnects performed for this step
    pub retry_count: i32,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TaskStep {
    pub fn is_approved(&self) -> bool {
        self.approver_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTaskStep {
    pub task_id: i64,
    pub index: i32,
    pub step_type: StepType,
    pub name: String,
    pub args: Vec<String>,
    pub must_approval: bool,
}

impl NewTaskStep {
    pub fn log_path(&self) -> String {
        crate::constants::paths::step_log(self.task_id, self.index)
    }
}

/// Partial update of a step row; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepUpdate {
    pub status: Option<StepStatus>,
    pub message: Option<String>,
    pub approver_id: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub retry_count: Option<i32>,
}

impl StepUpdate {
    pub fn status(status: StepStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_approver(mut self, approver_id: impl Into<String>) -> Self {
        self.approver_id = Some(approver_id.into());
        self
    }

    pub fn with_start_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_at = Some(at);
        self
    }

    pub fn with_end_at(mut self, at: DateTime<Utc>) -> Self {
        self.end_at = Some(at);
        self
    }

    pub fn with_retry_count(mut self, retry_count: i32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply(&self, step: &mut TaskStep) {
        if let Some(status) = self.status {
            step.status = status;
        }
        if let Some(message) = &self.message {
            step.message = message.clone();
        }
        if let Some(approver_id) = &self.approver_id {
            step.approver_id = Some(approver_id.clone());
        }
        if let Some(start_at) = self.start_at {
            step.start_at = Some(start_at);
        }
        if let Some(end_at) = self.end_at {
            step.end_at = Some(end_at);
        }
        if let Some(retry_count) = self.retry_count {
            step.retry_count = retry_count;
        }
    }
}
