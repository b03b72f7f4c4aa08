//! Wire messages exchanged with remote runners. Field names are camelCase.

use crate::constants::RECOGNIZED_EXIT_STATES;
use crate::models::{StateStore, StepType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Request to start one step on a runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStepRequest {
    pub task_id: i64,
    pub env_id: String,
    pub runner_id: String,
    pub step_index: i32,
    pub step_type: StepType,
    pub step_args: Vec<String>,
    pub environment_vars: BTreeMap<String, String>,
    pub terraform_vars: BTreeMap<String, String>,
    pub ansible_vars: BTreeMap<String, String>,
    pub repo_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_store: Option<StateStore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    pub timeout_secs: u64,
}

/// Runner acknowledgement; an empty `error` means the step was accepted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStepResponse {
    #[serde(default)]
    pub error: String,
}

impl RunStepResponse {
    pub fn accepted() -> Self {
        Self::default()
    }

    pub fn is_accepted(&self) -> bool {
        self.error.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTaskRequest {
    pub task_id: i64,
    pub container_ids: Vec<String>,
}

/// Key of a live status stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchStepRequest {
    pub env_id: String,
    pub task_id: i64,
    pub step_index: i32,
}

/// One status push from a runner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StepStatusMessage {
    /// Remote container state as reported by the runner
    pub status: String,
    pub exited: bool,
    pub exit_code: i32,
    pub container_id: Option<String>,
    pub log_content: Option<String>,
    pub tf_state_json: Option<String>,
    pub tf_plan_json: Option<String>,
    pub state_list_content: Option<String>,
}

impl StepStatusMessage {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            status: "exited".to_string(),
            exited: true,
            exit_code,
            ..Self::default()
        }
    }

    /// Whether an `exited` report carries a container state we accept as final.
    /// An empty state is accepted; runners that omit it only report final exits.
    pub fn is_recognized_exit(&self) -> bool {
        self.exited
            && (self.status.is_empty()
                || RECOGNIZED_EXIT_STATES
                    .iter()
                    .any(|state| state.eq_ignore_ascii_case(&self.status)))
    }
}
