//! # Task Model
//!
//! A task is one plan/apply/destroy execution request against an environment.
//! It carries the ordered step `Flow`, the resume index `curr_step`, the runner
//! it is pinned to, and the resolved inputs needed to build run requests.
//!
//! ## Database Schema
//!
//! Maps to the `stackrun_tasks` table:
//! ```sql
//! CREATE TABLE stackrun_tasks (
//!   task_id BIGSERIAL PRIMARY KEY,
//!   org_id TEXT NOT NULL,
//!   project_id TEXT NOT NULL,
//!   env_id TEXT NOT NULL,
//!   task_type TEXT NOT NULL,
//!   status TEXT NOT NULL DEFAULT 'pending',
//!   message TEXT NOT NULL DEFAULT '',
//!   flow JSONB NOT NULL,
//!   curr_step INTEGER NOT NULL DEFAULT 0,
//!   runner_id TEXT NOT NULL,
//!   step_timeout_secs BIGINT NOT NULL,
//!   auto_approve BOOLEAN NOT NULL DEFAULT false,
//!   variables JSONB NOT NULL DEFAULT '{}',
//!   repo_address TEXT NOT NULL,
//!   repo_token TEXT,
//!   state_store JSONB,
//!   private_key TEXT,
//!   result JSONB,
//!   start_at TIMESTAMPTZ,
//!   end_at TIMESTAMPTZ,
//!   created_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! ```

use super::task_step::StepType;
use crate::state_machine::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Kind of provisioning run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Plan,
    Apply,
    Destroy,
}

impl TaskType {
    /// Apply and destroy change real infrastructure; plan does not
    pub fn is_effectful(&self) -> bool {
        matches!(self, Self::Apply | Self::Destroy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "apply" => Ok(Self::Apply),
            "destroy" => Ok(Self::Destroy),
            _ => Err(format!("Invalid task type: {s}")),
        }
    }
}

/// Template for one pipeline step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTemplate {
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Explicit approval requirement; defaults by step type when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub must_approval: Option<bool>,
}

impl StepTemplate {
    pub fn new(step_type: StepType) -> Self {
        Self {
            step_type,
            name: step_type.to_string(),
            args: Vec::new(),
            must_approval: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_must_approval(mut self, must_approval: bool) -> Self {
        self.must_approval = Some(must_approval);
        self
    }

    pub fn requires_approval(&self) -> bool {
        self.must_approval
            .unwrap_or_else(|| self.step_type.requires_approval_by_default())
    }
}

/// Ordered step templates plus optional callbacks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub steps: Vec<StepTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<StepTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<StepTemplate>,
}

/// Variables already resolved by the request layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskVariables {
    pub environment: BTreeMap<String, String>,
    pub terraform: BTreeMap<String, String>,
    pub ansible: BTreeMap<String, String>,
}

/// Remote terraform state backend descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateStore {
    pub backend: String,
    pub address: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: i64,
    pub org_id: String,
    pub project_id: String,
    pub env_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub message: String,
    pub flow: Flow,
    /// Index of the step being (or about to be) executed; persisted before the attempt
    pub curr_step: i32,
    pub runner_id: String,
    pub step_timeout_secs: i64,
    pub auto_approve: bool,
    pub variables: TaskVariables,
    pub repo_address: String,
    pub repo_token: Option<String>,
    pub state_store: Option<StateStore>,
    pub private_key: Option<String>,
    pub result: Option<Value>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Per-step timeout, measured from each step's own start
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs.max(0) as u64)
    }
}

/// Input for creating a task together with its templated step rows
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub org_id: String,
    pub project_id: String,
    pub env_id: String,
    pub task_type: TaskType,
    pub flow: Flow,
    pub runner_id: String,
    pub step_timeout_secs: i64,
    pub auto_approve: bool,
    pub variables: TaskVariables,
    pub repo_address: String,
    pub repo_token: Option<String>,
    pub state_store: Option<StateStore>,
    pub private_key: Option<String>,
}

impl NewTask {
    pub fn new(
        env_id: impl Into<String>,
        task_type: TaskType,
        runner_id: impl Into<String>,
        flow: Flow,
    ) -> Self {
        Self {
            org_id: String::new(),
            project_id: String::new(),
            env_id: env_id.into(),
            task_type,
            flow,
            runner_id: runner_id.into(),
            step_timeout_secs: crate::constants::defaults::STEP_TIMEOUT_SECS as i64,
            auto_approve: false,
            variables: TaskVariables::default(),
            repo_address: String::new(),
            repo_token: None,
            state_store: None,
            private_key: None,
        }
    }
}

/// Partial update of a task row; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub message: Option<String>,
    pub curr_step: Option<i32>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn curr_step(index: i32) -> Self {
        Self {
            curr_step: Some(index),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
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

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Mirror the update onto an in-memory copy of the row
    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(message) = &self.message {
            task.message = message.clone();
        }
        if let Some(curr_step) = self.curr_step {
            task.curr_step = curr_step;
        }
        if let Some(start_at) = self.start_at {
            task.start_at = Some(start_at);
        }
        if let Some(end_at) = self.end_at {
            task.end_at = Some(end_at);
        }
        if let Some(result) = &self.result {
            task.result = Some(result.clone());
        }
    }
}
