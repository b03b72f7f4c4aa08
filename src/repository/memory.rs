//! Process-local repository backed by ordered maps.
//!
//! Used by tests and by single-process embeddings that do not need durable
//! storage. Semantics match the Postgres implementation, including ordering
//! and duplicate-index rejection.

use super::{template_steps, TaskRepository};
use crate::error::{RepositoryError, RepositoryResult};
use crate::models::{NewTask, NewTaskStep, StepUpdate, Task, TaskStep, TaskUpdate};
use crate::state_machine::{StepStatus, TaskStatus};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct MemoryState {
    tasks: BTreeMap<i64, Task>,
    steps: BTreeMap<i64, TaskStep>,
    next_task_id: i64,
    next_step_id: i64,
}

impl MemoryState {
    fn insert_step(&mut self, step: NewTaskStep) -> RepositoryResult<TaskStep> {
        let duplicate = self
            .steps
            .values()
            .any(|existing| existing.task_id == step.task_id && existing.index == step.index);
        if duplicate {
            return Err(RepositoryError::DuplicateStepIndex {
                task_id: step.task_id,
                index: step.index,
            });
        }

        self.next_step_id += 1;
        let row = TaskStep {
            step_id: self.next_step_id,
            task_id: step.task_id,
            index: step.index,
            step_type: step.step_type,
            log_path: step.log_path(),
            name: step.name,
            args: step.args,
            must_approval: step.must_approval,
            status: StepStatus::Pending,
            approver_id: None,
            message: String::new(),
            retry_count: 0,
            start_at: None,
            end_at: None,
            created_at: Utc::now(),
        };
        self.steps.insert(row.step_id, row.clone());
        Ok(row)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    state: RwLock<MemoryState>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current task row, read without going through the async trait
    pub fn task_snapshot(&self, task_id: i64) -> Option<Task> {
        self.state.read().tasks.get(&task_id).cloned()
    }

    /// Step row at a given index, if present
    pub fn step_at(&self, task_id: i64, index: i32) -> Option<TaskStep> {
        self.state
            .read()
            .steps
            .values()
            .find(|step| step.task_id == task_id && step.index == index)
            .cloned()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create_task(&self, new_task: NewTask) -> RepositoryResult<Task> {
        let mut state = self.state.write();
        state.next_task_id += 1;
        let task_id = state.next_task_id;

        let task = Task {
            task_id,
            org_id: new_task.org_id.clone(),
            project_id: new_task.project_id.clone(),
            env_id: new_task.env_id.clone(),
            task_type: new_task.task_type,
            status: TaskStatus::Pending,
            message: String::new(),
            flow: new_task.flow.clone(),
            curr_step: 0,
            runner_id: new_task.runner_id.clone(),
            step_timeout_secs: new_task.step_timeout_secs,
            auto_approve: new_task.auto_approve,
            variables: new_task.variables.clone(),
            repo_address: new_task.repo_address.clone(),
            repo_token: new_task.repo_token.clone(),
            state_store: new_task.state_store.clone(),
            private_key: new_task.private_key.clone(),
            result: None,
            start_at: None,
            end_at: None,
            created_at: Utc::now(),
        };

        for step in template_steps(task_id, &new_task) {
            state.insert_step(step)?;
        }
        state.tasks.insert(task_id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, task_id: i64) -> RepositoryResult<Task> {
        self.state
            .read()
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or(RepositoryError::TaskNotFound(task_id))
    }

    async fn tasks_by_status(&self, status: TaskStatus) -> RepositoryResult<Vec<Task>> {
        Ok(self
            .state
            .read()
            .tasks
            .values()
            .filter(|task| task.status == status)
            .cloned()
            .collect())
    }

    async fn pending_tasks(
        &self,
        limit: usize,
        exclude_runners: &[String],
    ) -> RepositoryResult<Vec<Task>> {
        Ok(self
            .state
            .read()
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| !exclude_runners.contains(&task.runner_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn active_task_runners(&self) -> RepositoryResult<Vec<(i64, String)>> {
        Ok(self
            .state
            .read()
            .tasks
            .values()
            .filter(|task| task.status.is_active())
            .map(|task| (task.task_id, task.runner_id.clone()))
            .collect())
    }

    async fn update_task(&self, task_id: i64, update: &TaskUpdate) -> RepositoryResult<()> {
        let mut state = self.state.write();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(RepositoryError::TaskNotFound(task_id))?;
        update.apply(task);
        Ok(())
    }

    async fn task_steps(&self, task_id: i64) -> RepositoryResult<Vec<TaskStep>> {
        let mut steps: Vec<TaskStep> = self
            .state
            .read()
            .steps
            .values()
            .filter(|step| step.task_id == task_id)
            .cloned()
            .collect();
        steps.sort_by_key(|step| step.index);
        Ok(steps)
    }

    async fn get_step(&self, step_id: i64) -> RepositoryResult<TaskStep> {
        self.state
            .read()
            .steps
            .get(&step_id)
            .cloned()
            .ok_or(RepositoryError::StepNotFound(step_id))
    }

    async fn last_step(&self, task_id: i64) -> RepositoryResult<Option<TaskStep>> {
        Ok(self
            .state
            .read()
            .steps
            .values()
            .filter(|step| step.task_id == task_id)
            .max_by_key(|step| step.index)
            .cloned())
    }

    async fn insert_step(&self, step: NewTaskStep) -> RepositoryResult<TaskStep> {
        let mut state = self.state.write();
        if !state.tasks.contains_key(&step.task_id) {
            return Err(RepositoryError::TaskNotFound(step.task_id));
        }
        state.insert_step(step)
    }

    async fn update_step(&self, step_id: i64, update: &StepUpdate) -> RepositoryResult<()> {
        let mut state = self.state.write();
        let step = state
            .steps
            .get_mut(&step_id)
            .ok_or(RepositoryError::StepNotFound(step_id))?;
        update.apply(step);
        Ok(())
    }
}
