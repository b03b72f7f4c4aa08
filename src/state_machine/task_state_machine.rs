use super::{events::TaskEvent, states::TaskStatus};
use crate::error::{SchedulerError, SchedulerResult};

/// Determine the task status an event leads to, rejecting invalid transitions.
///
/// `Start` is accepted from `running` and `approving` as well as `pending`:
/// a task recovered after a leadership change re-enters its executor while
/// its persisted status is still active.
pub fn determine_target_state(
    current: TaskStatus,
    event: &TaskEvent,
) -> SchedulerResult<TaskStatus> {
    let target = match (current, event) {
        (TaskStatus::Pending | TaskStatus::Running | TaskStatus::Approving, TaskEvent::Start) => {
            TaskStatus::Running
        }

        (TaskStatus::Running, TaskEvent::RequestApproval) => TaskStatus::Approving,
        (TaskStatus::Approving, TaskEvent::Approve) => TaskStatus::Running,
        // Running covers a rejection recorded while no executor was watching
        (TaskStatus::Running | TaskStatus::Approving, TaskEvent::Reject) => TaskStatus::Rejected,

        (TaskStatus::Running, TaskEvent::Complete) => TaskStatus::Complete,
        (TaskStatus::Running | TaskStatus::Approving, TaskEvent::Fail(_)) => TaskStatus::Failed,
        (TaskStatus::Running | TaskStatus::Approving, TaskEvent::Timeout) => TaskStatus::Timeout,

        (from, _) => {
            return Err(SchedulerError::StateTransition(format!(
                "task cannot handle {} while {from}",
                event.event_type()
            )))
        }
    };

    Ok(target)
}
