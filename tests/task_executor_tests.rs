//! Task executor and step runner behaviour against the in-memory repository
//! and a scripted runner.

mod common;

use common::{
    auto_approved, new_task, wait_until, Harness, MockRunnerClient, RepoOp, StepScript,
};
use stackrun_core::models::{
    NewTaskStep, StepTemplate, StepType, StepUpdate, TaskType, TaskUpdate,
};
use stackrun_core::repository::TaskRepository;
use stackrun_core::runner::StepStatusMessage;
use stackrun_core::state_machine::{StepStatus, TaskStatus};
use stackrun_core::{TaskOutcome, COLLECT_STEP_INDEX};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const APPLY_FLOW: [StepType; 3] = [StepType::Init, StepType::Plan, StepType::Apply];

#[tokio::test]
async fn test_auto_approved_apply_completes_with_collect() {
    let harness = Harness::new(MockRunnerClient::succeeding());
    let task = harness
        .create(auto_approved(new_task(TaskType::Apply, "runner-a", &APPLY_FLOW)))
        .await;

    let outcome = harness
        .executor()
        .execute(CancellationToken::new(), task.task_id)
        .await
        .unwrap();
    assert_eq!(outcome, TaskOutcome::Complete);

    let task = harness.task(task.task_id).await;
    assert_eq!(task.status, TaskStatus::Complete);
    assert!(task.start_at.is_some());
    assert!(task.end_at.is_some());
    assert_eq!(task.curr_step, COLLECT_STEP_INDEX);

    let steps = harness.steps(task.task_id).await;
    let indices: Vec<i32> = steps.iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![0, 1, 2, COLLECT_STEP_INDEX]);
    assert!(steps.iter().all(|s| s.status == StepStatus::Complete));
    assert_eq!(steps[3].step_type, StepType::Collect);

    assert_eq!(
        harness.runner.started_steps(task.task_id),
        vec![0, 1, 2, COLLECT_STEP_INDEX]
    );
    let log = harness
        .storage
        .get(&format!("{}/step0/log.txt", task.task_id))
        .unwrap();
    assert_eq!(log, b"log for step 0\n");
}

#[tokio::test(start_paused = true)]
async fn test_step_timeout_fails_task() {
    let harness = Harness::new(MockRunnerClient::succeeding().with_script(0, StepScript::Never));
    let mut new = auto_approved(new_task(TaskType::Apply, "runner-a", &[StepType::Init]));
    new.step_timeout_secs = 5;
    let task = harness.create(new).await;

    let started = tokio::time::Instant::now();
    let outcome = harness
        .executor()
        .execute(CancellationToken::new(), task.task_id)
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(5));

    let TaskOutcome::Failed(message) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(message.contains("timeout"));

    let task = harness.task(task.task_id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.message.contains("timeout"));

    let step = harness.step(task.task_id, 0);
    assert_eq!(step.status, StepStatus::Timeout);
    assert!(step.end_at.is_some());

    let stops = harness.runner.stop_calls.lock().clone();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].container_ids, vec!["container-0".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_approval_is_not_a_failure() {
    let harness = Harness::new(MockRunnerClient::succeeding());
    let task = harness
        .create(new_task(TaskType::Apply, "runner-a", &[StepType::Apply]))
        .await;
    let task_id = task.task_id;

    let executor = harness.executor();
    let run = tokio::spawn(async move { executor.execute(CancellationToken::new(), task_id).await });

    assert!(wait_until(|| harness.step(task_id, 0).status == StepStatus::Approving).await);
    assert_eq!(harness.task(task_id).await.status, TaskStatus::Approving);

    let step = harness.step(task_id, 0);
    harness
        .repo
        .update_step(step.step_id, &StepUpdate::status(StepStatus::Rejected))
        .await
        .unwrap();

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome, TaskOutcome::Rejected);

    let task = harness.task(task_id).await;
    assert_eq!(task.status, TaskStatus::Rejected);
    assert_ne!(task.status, TaskStatus::Failed);
    assert!(harness.runner.started_steps(task_id).is_empty());
    // Rejection triggers neither callbacks nor collection
    assert_eq!(harness.steps(task_id).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recorded_approval_releases_step() {
    let harness = Harness::new(MockRunnerClient::succeeding());
    let task = harness
        .create(new_task(
            TaskType::Plan,
            "runner-a",
            &[StepType::Init, StepType::Apply],
        ))
        .await;
    let task_id = task.task_id;

    let executor = harness.executor();
    let run = tokio::spawn(async move { executor.execute(CancellationToken::new(), task_id).await });

    assert!(wait_until(|| harness.step(task_id, 1).status == StepStatus::Approving).await);
    // Steps without an approval requirement ran straight through
    assert_eq!(harness.runner.started_steps(task_id), vec![0]);

    let step = harness.step(task_id, 1);
    harness
        .repo
        .update_step(step.step_id, &StepUpdate::default().with_approver("alice"))
        .await
        .unwrap();

    assert_eq!(run.await.unwrap().unwrap(), TaskOutcome::Complete);
    assert_eq!(harness.runner.started_steps(task_id), vec![0, 1]);
    assert_eq!(harness.task(task_id).await.status, TaskStatus::Complete);
}

#[tokio::test]
async fn test_on_success_callback_is_appended_once() {
    let harness = Harness::new(MockRunnerClient::succeeding());
    let mut new = auto_approved(new_task(
        TaskType::Plan,
        "runner-a",
        &[StepType::Init, StepType::Plan],
    ));
    new.flow.on_success =
        Some(StepTemplate::new(StepType::Command).with_args(vec!["notify".to_string()]));
    new.flow.on_fail = Some(StepTemplate::new(StepType::Command));
    let task = harness.create(new).await;

    let outcome = harness
        .executor()
        .execute(CancellationToken::new(), task.task_id)
        .await
        .unwrap();
    assert_eq!(outcome, TaskOutcome::Complete);

    let steps = harness.steps(task.task_id).await;
    let callbacks: Vec<_> = steps
        .iter()
        .filter(|s| s.step_type == StepType::OnSuccess)
        .collect();
    assert_eq!(callbacks.len(), 1);
    assert_eq!(callbacks[0].index, 2);
    assert_eq!(callbacks[0].args, vec!["notify".to_string()]);
    assert!(steps.iter().all(|s| s.step_type != StepType::OnFail));
    // Plan tasks produce no effects to collect
    assert!(steps.iter().all(|s| s.step_type != StepType::Collect));
}

#[tokio::test]
async fn test_failed_step_runs_on_fail_and_collect() {
    let harness = Harness::new(MockRunnerClient::succeeding().with_script(1, StepScript::ExitWith(2)));
    let mut new = auto_approved(new_task(TaskType::Apply, "runner-a", &APPLY_FLOW));
    new.flow.on_success = Some(StepTemplate::new(StepType::Command));
    new.flow.on_fail = Some(StepTemplate::new(StepType::Command));
    let task = harness.create(new).await;

    let outcome = harness
        .executor()
        .execute(CancellationToken::new(), task.task_id)
        .await
        .unwrap();
    let TaskOutcome::Failed(message) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(message.contains("exited with code 2"));

    let task = harness.task(task.task_id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.end_at.is_some());

    assert_eq!(harness.step(task.task_id, 1).status, StepStatus::Failed);
    assert_eq!(harness.step(task.task_id, 2).status, StepStatus::Pending);
    assert_eq!(harness.step(task.task_id, 3).step_type, StepType::OnFail);
    assert_eq!(
        harness.step(task.task_id, COLLECT_STEP_INDEX).step_type,
        StepType::Collect
    );
    assert_eq!(
        harness.runner.started_steps(task.task_id),
        vec![0, 1, 3, COLLECT_STEP_INDEX]
    );
}

#[tokio::test]
async fn test_resume_skips_steps_below_current() {
    let harness = Harness::new(MockRunnerClient::succeeding());
    let task = harness
        .create(auto_approved(new_task(TaskType::Apply, "runner-a", &APPLY_FLOW)))
        .await;
    for index in [0, 1] {
        let step = harness.step(task.task_id, index);
        harness
            .repo
            .update_step(step.step_id, &StepUpdate::status(StepStatus::Complete))
            .await
            .unwrap();
    }
    harness
        .repo
        .update_task(
            task.task_id,
            &TaskUpdate::status(TaskStatus::Running).with_start_at(chrono::Utc::now()),
        )
        .await
        .unwrap();
    harness
        .repo
        .update_task(task.task_id, &TaskUpdate::curr_step(2))
        .await
        .unwrap();
    let original_start = harness.task(task.task_id).await.start_at;

    let outcome = harness
        .executor()
        .execute(CancellationToken::new(), task.task_id)
        .await
        .unwrap();

    assert_eq!(outcome, TaskOutcome::Complete);
    assert_eq!(
        harness.runner.started_steps(task.task_id),
        vec![2, COLLECT_STEP_INDEX]
    );
    assert_eq!(harness.task(task.task_id).await.start_at, original_start);
}

#[tokio::test]
async fn test_resume_reattaches_to_running_step() {
    let harness = Harness::new(MockRunnerClient::succeeding());
    let task = harness
        .create(auto_approved(new_task(
            TaskType::Plan,
            "runner-a",
            &[StepType::Init, StepType::Plan],
        )))
        .await;
    let first = harness.step(task.task_id, 0);
    harness
        .repo
        .update_step(
            first.step_id,
            &StepUpdate::status(StepStatus::Running).with_start_at(chrono::Utc::now()),
        )
        .await
        .unwrap();
    harness
        .repo
        .update_task(task.task_id, &TaskUpdate::status(TaskStatus::Running))
        .await
        .unwrap();

    let outcome = harness
        .executor()
        .execute(CancellationToken::new(), task.task_id)
        .await
        .unwrap();

    assert_eq!(outcome, TaskOutcome::Complete);
    // Step 0 was not started again, only re-watched
    assert_eq!(harness.runner.started_steps(task.task_id), vec![1]);
    assert_eq!(harness.runner.watch_count(task.task_id, 0), 1);
    assert_eq!(harness.step(task.task_id, 0).status, StepStatus::Complete);
}

#[tokio::test]
async fn test_start_error_fails_step_without_retry() {
    let harness = Harness::new(
        MockRunnerClient::succeeding()
            .with_script(0, StepScript::StartError("connection reset".to_string())),
    );
    let task = harness
        .create(auto_approved(new_task(TaskType::Plan, "runner-a", &[StepType::Init])))
        .await;

    let outcome = harness
        .executor()
        .execute(CancellationToken::new(), task.task_id)
        .await
        .unwrap();

    assert!(matches!(outcome, TaskOutcome::Failed(ref m) if m.contains("failed to start")));
    assert_eq!(harness.runner.started_steps(task.task_id), vec![0]);
    assert_eq!(harness.runner.watch_count(task.task_id, 0), 0);
    let step = harness.step(task.task_id, 0);
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.message.contains("connection reset"));
}

#[tokio::test]
async fn test_runner_refusal_fails_step() {
    let harness = Harness::new(
        MockRunnerClient::succeeding().with_script(0, StepScript::Refuse("no capacity".to_string())),
    );
    let task = harness
        .create(auto_approved(new_task(TaskType::Plan, "runner-a", &[StepType::Init])))
        .await;

    let outcome = harness
        .executor()
        .execute(CancellationToken::new(), task.task_id)
        .await
        .unwrap();

    assert!(matches!(outcome, TaskOutcome::Failed(ref m) if m.contains("no capacity")));
    assert_eq!(harness.task(task.task_id).await.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_panic_becomes_failed_step() {
    let harness = Harness::new(MockRunnerClient::succeeding().with_script(0, StepScript::Panic));
    let task = harness
        .create(auto_approved(new_task(TaskType::Plan, "runner-a", &[StepType::Init])))
        .await;

    let outcome = harness
        .executor()
        .execute(CancellationToken::new(), task.task_id)
        .await
        .unwrap();

    assert!(matches!(outcome, TaskOutcome::Failed(ref m) if m.contains("panicked")));
    let step = harness.step(task.task_id, 0);
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.message.contains("runner exploded"));
    assert_eq!(harness.task(task.task_id).await.status, TaskStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_persists_nothing_terminal() {
    let harness = Harness::new(MockRunnerClient::succeeding().with_script(0, StepScript::Never));
    let task = harness
        .create(auto_approved(new_task(TaskType::Apply, "runner-a", &APPLY_FLOW)))
        .await;
    let task_id = task.task_id;

    let cancel = CancellationToken::new();
    let executor = harness.executor();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { executor.execute(cancel, task_id).await })
    };

    assert!(wait_until(|| harness.runner.watch_count(task_id, 0) == 1).await);
    cancel.cancel();

    assert_eq!(run.await.unwrap().unwrap(), TaskOutcome::Canceled);
    let task = harness.task(task_id).await;
    assert_eq!(task.status, TaskStatus::Running);
    assert!(task.end_at.is_none());
    assert_eq!(harness.step(task_id, 0).status, StepStatus::Running);
    assert_eq!(harness.steps(task_id).await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_status_stream_reconnects_are_counted() {
    let harness = Harness::new(
        MockRunnerClient::succeeding()
            .with_script(0, StepScript::FailConnectThenExit { failures: 2, code: 0 }),
    );
    let task = harness
        .create(auto_approved(new_task(TaskType::Plan, "runner-a", &[StepType::Init])))
        .await;

    let outcome = harness
        .executor()
        .execute(CancellationToken::new(), task.task_id)
        .await
        .unwrap();

    assert_eq!(outcome, TaskOutcome::Complete);
    let step = harness.step(task.task_id, 0);
    assert_eq!(step.status, StepStatus::Complete);
    assert_eq!(step.retry_count, 2);
    assert_eq!(harness.runner.watch_count(task.task_id, 0), 3);
}

#[tokio::test]
async fn test_unrecognized_exit_state_is_polled_again() {
    let harness = Harness::new(
        MockRunnerClient::succeeding().with_script(0, StepScript::NotRecognizedThenExit(0)),
    );
    let task = harness
        .create(auto_approved(new_task(TaskType::Plan, "runner-a", &[StepType::Init])))
        .await;

    let outcome = harness
        .executor()
        .execute(CancellationToken::new(), task.task_id)
        .await
        .unwrap();

    assert_eq!(outcome, TaskOutcome::Complete);
    assert_eq!(harness.step(task.task_id, 0).status, StepStatus::Complete);
}

#[tokio::test]
async fn test_resolution_failure_fails_task_before_any_step() {
    let harness = Harness::new(MockRunnerClient::succeeding());
    let mut new = auto_approved(new_task(TaskType::Apply, "runner-a", &APPLY_FLOW));
    new.repo_address = String::new();
    let task = harness.create(new).await;

    let outcome = harness
        .executor()
        .execute(CancellationToken::new(), task.task_id)
        .await
        .unwrap();

    assert!(matches!(outcome, TaskOutcome::Failed(ref m) if m.contains("run request")));
    let task = harness.task(task.task_id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.message.contains("repository address"));
    assert!(harness.runner.run_calls.lock().is_empty());
    assert_eq!(harness.steps(task.task_id).await.len(), 3);
}

#[tokio::test]
async fn test_terraform_artifacts_and_outputs_are_stored() {
    let payload = StepStatusMessage {
        log_content: Some("Apply complete!".to_string()),
        tf_state_json: Some(r#"{"version":4,"outputs":{"ip":{"value":"10.0.0.1"}}}"#.to_string()),
        tf_plan_json: Some(r#"{"resource_changes":[]}"#.to_string()),
        state_list_content: Some("aws_instance.web\n".to_string()),
        ..StepStatusMessage::exited(0)
    };
    let harness = Harness::new(
        MockRunnerClient::succeeding().with_script(2, StepScript::ExitWithPayload(payload)),
    );
    let task = harness
        .create(auto_approved(new_task(TaskType::Apply, "runner-a", &APPLY_FLOW)))
        .await;
    let id = task.task_id;

    harness
        .executor()
        .execute(CancellationToken::new(), id)
        .await
        .unwrap();

    assert_eq!(
        harness.storage.get(&format!("{id}/step2/log.txt")).unwrap(),
        b"Apply complete!"
    );
    assert!(harness.storage.get(&format!("{id}/tfstate.json")).is_some());
    assert!(harness.storage.get(&format!("{id}/tfplan.json")).is_some());
    assert_eq!(
        harness.storage.get(&format!("{id}/state_list.txt")).unwrap(),
        b"aws_instance.web\n"
    );

    let task = harness.task(id).await;
    assert_eq!(
        task.result,
        Some(serde_json::json!({"ip": {"value": "10.0.0.1"}}))
    );
}

#[tokio::test]
async fn test_repository_error_mid_task_is_persisted_as_failure() {
    let harness = Harness::new(MockRunnerClient::succeeding());
    let task = harness
        .create(auto_approved(new_task(TaskType::Plan, "runner-a", &[StepType::Init])))
        .await;
    harness.faults.fail_next(RepoOp::TaskSteps, 1);

    let outcome = harness
        .executor()
        .execute(CancellationToken::new(), task.task_id)
        .await
        .unwrap();
    let TaskOutcome::Failed(message) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(message.contains("connection reset"));

    let task = harness.task(task.task_id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.message.contains("connection reset"));
    assert!(task.end_at.is_some());
    assert!(harness.runner.started_steps(task.task_id).is_empty());
}

#[tokio::test]
async fn test_failed_progress_write_stops_before_next_step() {
    let harness = Harness::new(MockRunnerClient::succeeding());
    let task = harness
        .create(auto_approved(new_task(
            TaskType::Plan,
            "runner-a",
            &[StepType::Init, StepType::Plan],
        )))
        .await;
    // Writes: start, curr_step=0, then curr_step=1 fails
    harness.faults.fail_after(RepoOp::UpdateTask, 2, 1);

    let outcome = harness
        .executor()
        .execute(CancellationToken::new(), task.task_id)
        .await
        .unwrap();
    assert!(matches!(outcome, TaskOutcome::Failed(_)));

    let task = harness.task(task.task_id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.curr_step, 0);
    assert_eq!(harness.runner.started_steps(task.task_id), vec![0]);
    assert_eq!(harness.step(task.task_id, 0).status, StepStatus::Complete);
    assert_eq!(harness.step(task.task_id, 1).status, StepStatus::Pending);
}

#[tokio::test]
async fn test_unpersistable_failure_is_returned_as_error() {
    let harness = Harness::new(MockRunnerClient::succeeding());
    let task = harness
        .create(auto_approved(new_task(TaskType::Plan, "runner-a", &[StepType::Init])))
        .await;
    harness.faults.fail_next(RepoOp::TaskSteps, 1);
    // The start write succeeds; the failure write does not
    harness.faults.fail_after(RepoOp::UpdateTask, 1, 1);

    let result = harness
        .executor()
        .execute(CancellationToken::new(), task.task_id)
        .await;
    assert!(result.is_err());
    assert_eq!(harness.task_now(task.task_id).status, TaskStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_step_deadline_counts_from_start_stamp() {
    let harness = Harness::new(
        MockRunnerClient::succeeding()
            .with_script(0, StepScript::SlowStart(Duration::from_secs(3))),
    );
    let mut new = auto_approved(new_task(TaskType::Plan, "runner-a", &[StepType::Init]));
    new.step_timeout_secs = 5;
    let task = harness.create(new).await;

    let started = tokio::time::Instant::now();
    let outcome = harness
        .executor()
        .execute(CancellationToken::new(), task.task_id)
        .await
        .unwrap();

    assert!(matches!(outcome, TaskOutcome::Failed(_)));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(6), "deadline drifted: {elapsed:?}");
    assert_eq!(harness.step(task.task_id, 0).status, StepStatus::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_interrupts_hung_start_request() {
    let harness = Harness::new(
        MockRunnerClient::succeeding()
            .with_script(0, StepScript::SlowStart(Duration::from_secs(3600))),
    );
    let task = harness
        .create(auto_approved(new_task(TaskType::Plan, "runner-a", &[StepType::Init])))
        .await;
    let task_id = task.task_id;

    let cancel = CancellationToken::new();
    let executor = harness.executor();
    let started = tokio::time::Instant::now();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { executor.execute(cancel, task_id).await })
    };

    assert!(wait_until(|| harness.runner.started_steps(task_id) == vec![0]).await);
    cancel.cancel();

    assert_eq!(run.await.unwrap().unwrap(), TaskOutcome::Canceled);
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(harness.task_now(task_id).status, TaskStatus::Running);
    assert_eq!(harness.step(task_id, 0).status, StepStatus::Running);
}

#[tokio::test]
async fn test_collect_index_stays_above_appended_callback() {
    let harness = Harness::new(MockRunnerClient::succeeding());
    let mut new = auto_approved(new_task(TaskType::Apply, "runner-a", &[StepType::Init]));
    new.flow.on_success = Some(StepTemplate::new(StepType::Command));
    let task = harness.create(new).await;
    let id = task.task_id;
    harness
        .repo
        .insert_step(NewTaskStep {
            task_id: id,
            index: COLLECT_STEP_INDEX - 1,
            step_type: StepType::Command,
            name: "late".to_string(),
            args: vec![],
            must_approval: false,
        })
        .await
        .unwrap();

    let outcome = harness
        .executor()
        .execute(CancellationToken::new(), id)
        .await
        .unwrap();
    assert_eq!(outcome, TaskOutcome::Complete);

    let steps = harness.steps(id).await;
    let layout: Vec<(i32, StepType)> = steps.iter().map(|s| (s.index, s.step_type)).collect();
    assert_eq!(
        layout,
        vec![
            (0, StepType::Init),
            (COLLECT_STEP_INDEX - 1, StepType::Command),
            (COLLECT_STEP_INDEX, StepType::OnSuccess),
            (COLLECT_STEP_INDEX + 1, StepType::Collect),
        ]
    );
    assert!(steps.iter().all(|s| s.status == StepStatus::Complete));
}
