//! Shared fixtures for the integration tests: a scriptable runner client and
//! a harness wiring the in-memory repository and log store.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use stackrun_core::config::SchedulerConfig;
use stackrun_core::error::{RepositoryError, RepositoryResult, RunnerError, RunnerResult};
use stackrun_core::models::{
    Flow, NewTask, NewTaskStep, StepTemplate, StepType, StepUpdate, Task, TaskStep, TaskType,
    TaskUpdate,
};
use stackrun_core::orchestration::{SchedulerContext, TaskExecutor, TaskRecordResolver};
use stackrun_core::repository::{InMemoryTaskRepository, TaskRepository};
use stackrun_core::runner::{
    RunStepRequest, RunStepResponse, RunnerClient, StaticRunnerDirectory, StatusStream,
    StepStatusMessage, StopTaskRequest, WatchStepRequest,
};
use stackrun_core::state_machine::TaskStatus;
use stackrun_core::storage::InMemoryLogStorage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Scripted runner behaviour for one step index
#[derive(Debug, Clone)]
pub enum StepScript {
    /// Accept the step and report exit with the given code
    ExitWith(i32),
    /// Accept the step and report this final message
    ExitWithPayload(StepStatusMessage),
    /// Accept the step; the status stream never reports anything
    Never,
    /// The start-step call fails at the transport level
    StartError(String),
    /// The runner answers the start-step call with an error
    Refuse(String),
    /// Opening the status stream fails `failures` times, then exits with `code`
    FailConnectThenExit { failures: u32, code: i32 },
    /// Report an exit with an unrecognized remote state first, then a real exit
    NotRecognizedThenExit(i32),
    /// Panic inside the start-step call
    Panic,
    /// The start-step call takes this long to be accepted; the stream never exits
    SlowStart(Duration),
}

#[derive(Debug)]
pub struct MockRunnerClient {
    scripts: Mutex<HashMap<i32, StepScript>>,
    default_script: StepScript,
    connect_failures: Mutex<HashMap<(i64, i32), u32>>,
    pub run_calls: Mutex<Vec<RunStepRequest>>,
    pub watch_calls: Mutex<Vec<WatchStepRequest>>,
    pub stop_calls: Mutex<Vec<StopTaskRequest>>,
}

impl MockRunnerClient {
    pub fn new(default_script: StepScript) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_script,
            connect_failures: Mutex::new(HashMap::new()),
            run_calls: Mutex::new(Vec::new()),
            watch_calls: Mutex::new(Vec::new()),
            stop_calls: Mutex::new(Vec::new()),
        }
    }

    /// Every step exits 0 unless scripted otherwise
    pub fn succeeding() -> Self {
        Self::new(StepScript::ExitWith(0))
    }

    pub fn with_script(self, step_index: i32, script: StepScript) -> Self {
        self.scripts.lock().insert(step_index, script);
        self
    }

    fn script(&self, step_index: i32) -> StepScript {
        self.scripts
            .lock()
            .get(&step_index)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone())
    }

    /// Step indices started for a task, in call order
    pub fn started_steps(&self, task_id: i64) -> Vec<i32> {
        self.run_calls
            .lock()
            .iter()
            .filter(|req| req.task_id == task_id)
            .map(|req| req.step_index)
            .collect()
    }

    pub fn watch_count(&self, task_id: i64, step_index: i32) -> usize {
        self.watch_calls
            .lock()
            .iter()
            .filter(|req| req.task_id == task_id && req.step_index == step_index)
            .count()
    }

    fn exit_message(step_index: i32, code: i32) -> StepStatusMessage {
        StepStatusMessage {
            container_id: Some(format!("container-{step_index}")),
            log_content: Some(format!("log for step {step_index}\n")),
            ..StepStatusMessage::exited(code)
        }
    }
}

#[async_trait]
impl RunnerClient for MockRunnerClient {
    async fn run_step(
        &self,
        _address: &str,
        request: &RunStepRequest,
    ) -> RunnerResult<RunStepResponse> {
        self.run_calls.lock().push(request.clone());
        match self.script(request.step_index) {
            StepScript::StartError(reason) => Err(RunnerError::Connection(reason)),
            StepScript::Refuse(reason) => Ok(RunStepResponse { error: reason }),
            StepScript::Panic => panic!("runner exploded on step {}", request.step_index),
            StepScript::SlowStart(delay) => {
                tokio::time::sleep(delay).await;
                Ok(RunStepResponse::accepted())
            }
            _ => Ok(RunStepResponse::accepted()),
        }
    }

    async fn stop_task(&self, _address: &str, request: &StopTaskRequest) -> RunnerResult<()> {
        self.stop_calls.lock().push(request.clone());
        Ok(())
    }

    async fn watch_step(
        &self,
        _address: &str,
        request: &WatchStepRequest,
    ) -> RunnerResult<StatusStream> {
        self.watch_calls.lock().push(request.clone());
        let index = request.step_index;
        let running = StepStatusMessage {
            status: "running".to_string(),
            container_id: Some(format!("container-{index}")),
            ..StepStatusMessage::default()
        };

        let messages = match self.script(index) {
            StepScript::Never | StepScript::SlowStart(_) => {
                return Ok(futures::stream::iter(vec![Ok(running)])
                    .chain(futures::stream::pending())
                    .boxed())
            }
            StepScript::ExitWith(code) => vec![running, Self::exit_message(index, code)],
            StepScript::ExitWithPayload(message) => vec![running, message],
            StepScript::FailConnectThenExit { failures, code } => {
                let mut seen = self.connect_failures.lock();
                let count = seen.entry((request.task_id, index)).or_insert(0);
                if *count < failures {
                    *count += 1;
                    return Err(RunnerError::Connection("connection refused".to_string()));
                }
                vec![Self::exit_message(index, code)]
            }
            StepScript::NotRecognizedThenExit(code) => {
                let flaky = StepStatusMessage {
                    status: "restarting".to_string(),
                    exited: true,
                    exit_code: 137,
                    ..StepStatusMessage::default()
                };
                vec![flaky, Self::exit_message(index, code)]
            }
            StepScript::StartError(_) | StepScript::Refuse(_) | StepScript::Panic => {
                vec![Self::exit_message(index, 1)]
            }
        };

        Ok(futures::stream::iter(messages.into_iter().map(Ok)).boxed())
    }
}

/// Repository operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepoOp {
    GetTask,
    UpdateTask,
    TaskSteps,
    UpdateStep,
    InsertStep,
}

#[derive(Debug, Default)]
struct Fault {
    skip: u32,
    remaining: u32,
}

/// Delegates to the in-memory repository, failing selected calls with a
/// database error
#[derive(Debug)]
pub struct FaultyRepository {
    inner: Arc<InMemoryTaskRepository>,
    faults: Mutex<HashMap<RepoOp, Fault>>,
}

impl FaultyRepository {
    pub fn new(inner: Arc<InMemoryTaskRepository>) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Let `skip` calls of `op` through, then fail the next `times`
    pub fn fail_after(&self, op: RepoOp, skip: u32, times: u32) {
        self.faults.lock().insert(
            op,
            Fault {
                skip,
                remaining: times,
            },
        );
    }

    pub fn fail_next(&self, op: RepoOp, times: u32) {
        self.fail_after(op, 0, times);
    }

    fn check(&self, op: RepoOp) -> RepositoryResult<()> {
        let mut faults = self.faults.lock();
        let Some(fault) = faults.get_mut(&op) else {
            return Ok(());
        };
        if fault.skip > 0 {
            fault.skip -= 1;
            return Ok(());
        }
        if fault.remaining == 0 {
            return Ok(());
        }
        fault.remaining -= 1;
        Err(RepositoryError::Database(format!("connection reset during {op:?}")))
    }
}

#[async_trait]
impl TaskRepository for FaultyRepository {
    async fn create_task(&self, new_task: NewTask) -> RepositoryResult<Task> {
        self.inner.create_task(new_task).await
    }

    async fn get_task(&self, task_id: i64) -> RepositoryResult<Task> {
        self.check(RepoOp::GetTask)?;
        self.inner.get_task(task_id).await
    }

    async fn tasks_by_status(&self, status: TaskStatus) -> RepositoryResult<Vec<Task>> {
        self.inner.tasks_by_status(status).await
    }

    async fn pending_tasks(
        &self,
        limit: usize,
        exclude_runners: &[String],
    ) -> RepositoryResult<Vec<Task>> {
        self.inner.pending_tasks(limit, exclude_runners).await
    }

    async fn active_task_runners(&self) -> RepositoryResult<Vec<(i64, String)>> {
        self.inner.active_task_runners().await
    }

    async fn update_task(&self, task_id: i64, update: &TaskUpdate) -> RepositoryResult<()> {
        self.check(RepoOp::UpdateTask)?;
        self.inner.update_task(task_id, update).await
    }

    async fn task_steps(&self, task_id: i64) -> RepositoryResult<Vec<TaskStep>> {
        self.check(RepoOp::TaskSteps)?;
        self.inner.task_steps(task_id).await
    }

    async fn get_step(&self, step_id: i64) -> RepositoryResult<TaskStep> {
        self.inner.get_step(step_id).await
    }

    async fn last_step(&self, task_id: i64) -> RepositoryResult<Option<TaskStep>> {
        self.inner.last_step(task_id).await
    }

    async fn insert_step(&self, step: NewTaskStep) -> RepositoryResult<TaskStep> {
        self.check(RepoOp::InsertStep)?;
        self.inner.insert_step(step).await
    }

    async fn update_step(&self, step_id: i64, update: &StepUpdate) -> RepositoryResult<()> {
        self.check(RepoOp::UpdateStep)?;
        self.inner.update_step(step_id, update).await
    }
}

pub struct Harness {
    pub repo: Arc<InMemoryTaskRepository>,
    /// The repository the scheduler components see; wraps `repo`
    pub faults: Arc<FaultyRepository>,
    pub runner: Arc<MockRunnerClient>,
    pub storage: Arc<InMemoryLogStorage>,
    pub ctx: Arc<SchedulerContext>,
}

impl Harness {
    pub fn new(runner: MockRunnerClient) -> Self {
        Self::with_config(runner, SchedulerConfig::default())
    }

    pub fn with_config(runner: MockRunnerClient, config: SchedulerConfig) -> Self {
        let repo = Arc::new(InMemoryTaskRepository::new());
        let faults = Arc::new(FaultyRepository::new(repo.clone()));
        let runner = Arc::new(runner);
        let storage = Arc::new(InMemoryLogStorage::default());
        let directory = StaticRunnerDirectory::default()
            .with_runner("runner-a", "http://runner-a.test")
            .with_runner("runner-b", "http://runner-b.test")
            .with_runner("runner-c", "http://runner-c.test");

        let ctx = Arc::new(SchedulerContext::new(
            faults.clone(),
            runner.clone(),
            Arc::new(TaskRecordResolver::new(Arc::new(directory))),
            storage.clone(),
            config,
        ));

        Self {
            repo,
            faults,
            runner,
            storage,
            ctx,
        }
    }

    pub fn executor(&self) -> TaskExecutor {
        TaskExecutor::new(self.ctx.clone())
    }

    pub async fn create(&self, new_task: NewTask) -> Task {
        self.repo.create_task(new_task).await.unwrap()
    }

    pub async fn task(&self, task_id: i64) -> Task {
        self.repo.get_task(task_id).await.unwrap()
    }

    /// Synchronous read of a task row, for polling conditions
    pub fn task_now(&self, task_id: i64) -> Task {
        self.repo
            .task_snapshot(task_id)
            .unwrap_or_else(|| panic!("task {task_id} not found"))
    }

    pub fn step(&self, task_id: i64, index: i32) -> TaskStep {
        self.repo
            .step_at(task_id, index)
            .unwrap_or_else(|| panic!("task {task_id} has no step {index}"))
    }

    pub async fn steps(&self, task_id: i64) -> Vec<TaskStep> {
        self.repo.task_steps(task_id).await.unwrap()
    }
}

/// A task with the given step types, a resolvable repository and runner
pub fn new_task(task_type: TaskType, runner_id: &str, step_types: &[StepType]) -> NewTask {
    let flow = Flow {
        steps: step_types.iter().copied().map(StepTemplate::new).collect(),
        ..Flow::default()
    };
    let mut task = NewTask::new("env-1", task_type, runner_id, flow);
    task.repo_address = "https://git.example.com/infra.git".to_string();
    task.step_timeout_secs = 60;
    task
}

pub fn auto_approved(mut task: NewTask) -> NewTask {
    task.auto_approve = true;
    task
}

/// Poll `condition` on the (possibly paused) tokio clock
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
