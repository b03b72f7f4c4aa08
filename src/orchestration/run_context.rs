//! Run-request resolution.
//!
//! Before any step runs, the executor resolves everything the runner needs
//! that does not change between steps: runner address, variables, repository
//! access, state store, and SSH key. A resolution failure is terminal for the
//! task.

use crate::error::{SchedulerError, SchedulerResult};
use crate::models::{StateStore, StepType, Task, TaskStep};
use crate::runner::{RunStepRequest, RunnerDirectory};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Per-task inputs shared by every run-step request
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub runner_address: String,
    pub environment_vars: BTreeMap<String, String>,
    pub terraform_vars: BTreeMap<String, String>,
    pub ansible_vars: BTreeMap<String, String>,
    pub repo_address: String,
    pub repo_token: Option<String>,
    pub state_store: Option<StateStore>,
    pub private_key: Option<String>,
}

impl RunContext {
    pub fn request_for(&self, task: &Task, step: &TaskStep, timeout: Duration) -> RunStepRequest {
        RunStepRequest {
            task_id: task.task_id,
            env_id: task.env_id.clone(),
            runner_id: task.runner_id.clone(),
            step_index: step.index,
            step_type: step.step_type,
            step_args: step.args.clone(),
            environment_vars: self.environment_vars.clone(),
            terraform_vars: self.terraform_vars.clone(),
            ansible_vars: self.ansible_vars.clone(),
            repo_address: self.repo_address.clone(),
            repo_token: self.repo_token.clone(),
            state_store: self.state_store.clone(),
            private_key: self.private_key.clone(),
            timeout_secs: timeout.as_secs(),
        }
    }
}

#[async_trait]
pub trait RunContextResolver: Send + Sync {
    async fn resolve(&self, task: &Task) -> SchedulerResult<RunContext>;
}

/// Resolver that reads everything from the already-resolved task record
pub struct TaskRecordResolver {
    directory: Arc<dyn RunnerDirectory>,
}

impl TaskRecordResolver {
    pub fn new(directory: Arc<dyn RunnerDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl RunContextResolver for TaskRecordResolver {
    async fn resolve(&self, task: &Task) -> SchedulerResult<RunContext> {
        if task.repo_address.trim().is_empty() {
            return Err(SchedulerError::Resolution(format!(
                "task {} has no repository address",
                task.task_id
            )));
        }

        let needs_key = task
            .flow
            .steps
            .iter()
            .any(|template| template.step_type == StepType::Play);
        if needs_key && task.private_key.is_none() {
            return Err(SchedulerError::Resolution(format!(
                "task {} runs a play step but has no private key",
                task.task_id
            )));
        }

        let runner_address = self
            .directory
            .resolve(&task.runner_id)
            .await
            .map_err(|err| SchedulerError::Resolution(err.to_string()))?;

        Ok(RunContext {
            runner_address,
            environment_vars: task.variables.environment.clone(),
            terraform_vars: task.variables.terraform.clone(),
            ansible_vars: task.variables.ansible.clone(),
            repo_address: task.repo_address.clone(),
            repo_token: task.repo_token.clone(),
            state_store: task.state_store.clone(),
            private_key: task.private_key.clone(),
        })
    }
}
