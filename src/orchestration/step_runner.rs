//! # Step Runner
//!
//! Drives one step row to a terminal status:
//!
//! ```text
//! pending ─▶ [approving ─▶]* running ─▶ complete | failed | timeout
//!                  └────────▶ rejected
//! ```
//!
//! A step waits in `approving` when it requires approval, the task is not
//! auto-approved, and no approver is recorded. The approval layer records the
//! decision on the row; this runner polls for it. Once running, the step's
//! status stream is read until the runner reports exit or the deadline
//! (`start_at + step_timeout`) passes. Stream connectivity errors are retried
//! forever with a fixed backoff and counted in `retry_count`.
//!
//! Cancellation never persists a terminal status: the step stays where it is
//! and the next leader picks the task up again. A step found `running` on
//! entry is re-attached to its status stream with its original deadline
//! instead of being started a second time.

use super::{RunContext, SchedulerContext};
use crate::constants::paths;
use crate::error::{RepositoryError, StepError, StepResult};
use crate::logging::log_step_operation;
use crate::models::{StepUpdate, Task, TaskStep, TaskUpdate};
use crate::runner::{StepStatusMessage, StopTaskRequest, WatchStepRequest};
use crate::state_machine::{step_state_machine, StepEvent, StepStatus, TaskStatus};
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

enum WatchOutcome {
    Exited(StepStatusMessage),
    TimedOut,
    Canceled,
}

#[derive(Debug, Clone)]
pub struct StepRunner {
    ctx: Arc<SchedulerContext>,
}

impl StepRunner {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self { ctx }
    }

    /// Run `step` of `task` to a terminal status.
    ///
    /// Panics raised while driving the step are caught here and persisted as
    /// a failed step.
    #[instrument(skip_all, fields(task_id = task.task_id, step_index = step.index, step_type = %step.step_type))]
    pub async fn run_step(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        step: &TaskStep,
        run_ctx: &RunContext,
    ) -> StepResult<()> {
        let guarded = AssertUnwindSafe(self.drive(cancel, task, step, run_ctx))
            .catch_unwind()
            .await;

        match guarded {
            Ok(result) => result,
            Err(panic_payload) => {
                let reason = panic_message(panic_payload.as_ref());
                error!(panic_msg = %reason, "Step execution panicked");

                let update = StepUpdate::status(StepStatus::Failed)
                    .with_message(format!("step panicked: {reason}"))
                    .with_end_at(Utc::now());
                if let Err(err) = self.ctx.repository.update_step(step.step_id, &update).await {
                    error!(error = %err, "Failed to persist panicked step");
                }
                log_step_operation(
                    "panic",
                    task.task_id,
                    step.index,
                    step.step_type.as_str(),
                    StepStatus::Failed.as_str(),
                    Some(&reason),
                );
                Err(StepError::Panicked {
                    index: step.index,
                    reason,
                })
            }
        }
    }

    async fn drive(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        step: &TaskStep,
        run_ctx: &RunContext,
    ) -> StepResult<()> {
        let index = step.index;
        let current = self
            .ctx
            .repository
            .get_step(step.step_id)
            .await
            .map_err(|err| repository_failure(index, err))?;

        match current.status {
            StepStatus::Complete => {
                debug!("Step already complete; skipping");
                return Ok(());
            }
            StepStatus::Rejected => return Err(StepError::Rejected { index }),
            StepStatus::Failed | StepStatus::Timeout => {
                return Err(StepError::AlreadyFinished {
                    index,
                    status: current.status.to_string(),
                })
            }
            StepStatus::Running => {
                let remaining = remaining_budget(current.start_at, task.step_timeout());
                info!(
                    remaining_ms = remaining.as_millis() as u64,
                    "Re-attaching to running step"
                );
                return self
                    .watch(cancel, task, &current, run_ctx, Instant::now() + remaining)
                    .await;
            }
            StepStatus::Pending | StepStatus::Approving => {}
        }

        if requires_approval(task, &current) {
            self.await_approval(cancel, task, &current).await?;
        }
        if cancel.is_cancelled() {
            return Err(StepError::Canceled { index });
        }

        let (started, started_at) = self.start(cancel, task, &current, run_ctx).await?;
        let deadline = started_at + task.step_timeout();
        self.watch(cancel, task, &started, run_ctx, deadline).await
    }

    async fn await_approval(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        step: &TaskStep,
    ) -> StepResult<()> {
        let index = step.index;
        let repo = &self.ctx.repository;

        if step.status != StepStatus::Approving {
            let status = transition(index, step.status, &StepEvent::RequestApproval)?;
            repo.update_step(step.step_id, &StepUpdate::status(status))
                .await
                .map_err(|err| repository_failure(index, err))?;
        }
        repo.update_task(task.task_id, &TaskUpdate::status(TaskStatus::Approving))
            .await
            .map_err(|err| repository_failure(index, err))?;
        log_step_operation(
            "await_approval",
            task.task_id,
            index,
            step.step_type.as_str(),
            StepStatus::Approving.as_str(),
            None,
        );

        let poll_interval = self.ctx.config.approval_poll_interval();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StepError::Canceled { index }),
                _ = tokio::time::sleep(poll_interval) => {}
            }

            let latest = repo
                .get_step(step.step_id)
                .await
                .map_err(|err| repository_failure(index, err))?;

            if latest.status == StepStatus::Rejected {
                info!("Step approval rejected");
                return Err(StepError::Rejected { index });
            }
            if latest.is_approved() {
                info!(approver_id = ?latest.approver_id, "Step approved");
                repo.update_task(task.task_id, &TaskUpdate::status(TaskStatus::Running))
                    .await
                    .map_err(|err| repository_failure(index, err))?;
                return Ok(());
            }
        }
    }

    /// Persist `running` and ask the runner to start the step. No retry.
    ///
    /// Returns the running step and the instant its `start_at` was stamped;
    /// the step deadline counts from there, not from the runner's reply.
    async fn start(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        step: &TaskStep,
        run_ctx: &RunContext,
    ) -> StepResult<(TaskStep, Instant)> {
        let index = step.index;
        let status = transition(index, step.status, &StepEvent::Start)?;
        let started = Instant::now();
        let update = StepUpdate::status(status)
            .with_start_at(Utc::now())
            .with_message("");
        self.ctx
            .repository
            .update_step(step.step_id, &update)
            .await
            .map_err(|err| repository_failure(index, err))?;

        let request = run_ctx.request_for(task, step, task.step_timeout());
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Left running; the next leader re-attaches within the original deadline
                info!("Step start canceled");
                return Err(StepError::Canceled { index });
            }
            response = self.ctx.runner_client.run_step(&run_ctx.runner_address, &request) => response,
        };
        let rejection = match response {
            Ok(response) if response.is_accepted() => None,
            Ok(response) => Some(response.error),
            Err(err) => Some(err.to_string()),
        };

        if let Some(reason) = rejection {
            let update = StepUpdate::status(StepStatus::Failed)
                .with_message(format!("failed to start step: {reason}"))
                .with_end_at(Utc::now());
            self.ctx
                .repository
                .update_step(step.step_id, &update)
                .await
                .map_err(|err| repository_failure(index, err))?;
            log_step_operation(
                "start",
                task.task_id,
                index,
                step.step_type.as_str(),
                StepStatus::Failed.as_str(),
                Some(&reason),
            );
            return Err(StepError::StartFailed { index, reason });
        }

        log_step_operation(
            "start",
            task.task_id,
            index,
            step.step_type.as_str(),
            status.as_str(),
            None,
        );
        let mut running = step.clone();
        update.apply(&mut running);
        Ok((running, started))
    }

    async fn watch(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        step: &TaskStep,
        run_ctx: &RunContext,
        deadline: Instant,
    ) -> StepResult<()> {
        let request = WatchStepRequest {
            env_id: task.env_id.clone(),
            task_id: task.task_id,
            step_index: step.index,
        };
        let mut retry_count = step.retry_count;
        let mut container_id: Option<String> = None;

        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => WatchOutcome::Canceled,
            _ = &mut expired => WatchOutcome::TimedOut,
            message = self.read_until_exit(
                &run_ctx.runner_address,
                &request,
                &mut retry_count,
                &mut container_id,
            ) => WatchOutcome::Exited(message),
        };

        match outcome {
            WatchOutcome::Canceled => {
                info!("Step watch canceled; leaving step for the next leader");
                Err(StepError::Canceled { index: step.index })
            }
            WatchOutcome::TimedOut => {
                self.finish_timeout(task, step, run_ctx, retry_count, container_id)
                    .await
            }
            WatchOutcome::Exited(message) => {
                self.finish_exit(task, step, retry_count, message).await
            }
        }
    }

    /// Read status pushes until an accepted exit report, reconnecting on any
    /// stream error or early close.
    async fn read_until_exit(
        &self,
        address: &str,
        request: &WatchStepRequest,
        retry_count: &mut i32,
        container_id: &mut Option<String>,
    ) -> StepStatusMessage {
        let backoff = self.ctx.config.status_retry_backoff();
        let mut repolled = false;

        loop {
            match self.ctx.runner_client.watch_step(address, request).await {
                Ok(mut stream) => {
                    while let Some(item) = stream.next().await {
                        let message = match item {
                            Ok(message) => message,
                            Err(err) => {
                                warn!(error = %err, "Status stream error");
                                break;
                            }
                        };
                        if let Some(id) = &message.container_id {
                            *container_id = Some(id.clone());
                        }
                        if !message.exited {
                            continue;
                        }
                        // Runners have reported exits with transient states; look once more
                        if message.is_recognized_exit() || repolled {
                            return message;
                        }
                        warn!(
                            remote_status = %message.status,
                            "Exit reported with unrecognized state; polling again"
                        );
                        repolled = true;
                    }
                    warn!("Status stream closed before exit");
                }
                Err(err) => warn!(error = %err, "Failed to open status stream"),
            }

            *retry_count += 1;
            debug!(
                retry_count = *retry_count,
                backoff_ms = backoff.as_millis() as u64,
                "Reconnecting status stream"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    async fn finish_exit(
        &self,
        task: &Task,
        step: &TaskStep,
        retry_count: i32,
        message: StepStatusMessage,
    ) -> StepResult<()> {
        let index = step.index;
        let exit_code = message.exit_code;
        let status = transition(index, step.status, &StepEvent::Exit { exit_code })?;

        self.store_artifacts(task, step, &message).await;

        let mut update = StepUpdate::status(status)
            .with_end_at(Utc::now())
            .with_retry_count(retry_count);
        if status != StepStatus::Complete {
            update = update.with_message(format!("exit code {exit_code}"));
        }
        self.ctx
            .repository
            .update_step(step.step_id, &update)
            .await
            .map_err(|err| repository_failure(index, err))?;

        log_step_operation(
            "finish",
            task.task_id,
            index,
            step.step_type.as_str(),
            status.as_str(),
            None,
        );

        if status == StepStatus::Complete {
            Ok(())
        } else {
            Err(StepError::ExitCode { index, exit_code })
        }
    }

    async fn finish_timeout(
        &self,
        task: &Task,
        step: &TaskStep,
        run_ctx: &RunContext,
        retry_count: i32,
        container_id: Option<String>,
    ) -> StepResult<()> {
        let index = step.index;
        let timeout_err = StepError::Timeout {
            index,
            timeout: task.step_timeout(),
        };
        let status = transition(index, step.status, &StepEvent::Timeout)?;
        let update = StepUpdate::status(status)
            .with_message(timeout_err.to_string())
            .with_end_at(Utc::now())
            .with_retry_count(retry_count);
        self.ctx
            .repository
            .update_step(step.step_id, &update)
            .await
            .map_err(|err| repository_failure(index, err))?;

        log_step_operation(
            "finish",
            task.task_id,
            index,
            step.step_type.as_str(),
            status.as_str(),
            Some(&timeout_err.to_string()),
        );

        let stop = StopTaskRequest {
            task_id: task.task_id,
            container_ids: container_id.into_iter().collect(),
        };
        if let Err(err) = self
            .ctx
            .runner_client
            .stop_task(&run_ctx.runner_address, &stop)
            .await
        {
            warn!(error = %err, "Failed to stop timed-out step on runner");
        }

        Err(timeout_err)
    }

    /// Write log and terraform payloads; failures are logged only
    async fn store_artifacts(&self, task: &Task, step: &TaskStep, message: &StepStatusMessage) {
        let task_id = task.task_id;
        let log_path = if step.log_path.is_empty() {
            paths::step_log(task_id, step.index)
        } else {
            step.log_path.clone()
        };

        let payloads = [
            (log_path, message.log_content.as_deref()),
            (paths::tf_state(task_id), message.tf_state_json.as_deref()),
            (paths::tf_plan(task_id), message.tf_plan_json.as_deref()),
            (
                paths::state_list(task_id),
                message.state_list_content.as_deref(),
            ),
        ];

        for (path, content) in payloads {
            let Some(content) = content else { continue };
            if let Err(err) = self.ctx.storage.write(&path, content.as_bytes()).await {
                warn!(path = %path, error = %err, "Failed to store step artifact");
            }
        }

        if let Some(outputs) = message.tf_state_json.as_deref().and_then(state_outputs) {
            let update = TaskUpdate::default().with_result(outputs);
            if let Err(err) = self.ctx.repository.update_task(task_id, &update).await {
                warn!(error = %err, "Failed to record terraform outputs");
            }
        }
    }
}

fn requires_approval(task: &Task, step: &TaskStep) -> bool {
    step.must_approval
        && !step.step_type.is_post_step()
        && !task.auto_approve
        && !step.is_approved()
}

fn transition(index: i32, current: StepStatus, event: &StepEvent) -> StepResult<StepStatus> {
    step_state_machine::determine_target_state(current, event).map_err(|_| {
        StepError::AlreadyFinished {
            index,
            status: current.to_string(),
        }
    })
}

fn repository_failure(index: i32, err: RepositoryError) -> StepError {
    StepError::Repository {
        index,
        reason: err.to_string(),
    }
}

/// Time left before a step that started at `start_at` hits its timeout
fn remaining_budget(start_at: Option<DateTime<Utc>>, timeout: Duration) -> Duration {
    let Some(start_at) = start_at else {
        return timeout;
    };
    let elapsed = (Utc::now() - start_at).to_std().unwrap_or_default();
    timeout.saturating_sub(elapsed)
}

/// The `outputs` object of a terraform state document
fn state_outputs(state_json: &str) -> Option<Value> {
    let state: Value = serde_json::from_str(state_json).ok()?;
    state.get("outputs").filter(|outputs| outputs.is_object()).cloned()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
