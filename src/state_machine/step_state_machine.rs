use super::{events::StepEvent, states::StepStatus};
use crate::error::{SchedulerError, SchedulerResult};

/// Determine the step status an event leads to.
///
/// ```text
/// pending ─▶ [approving ─▶]* running ─▶ complete | failed | timeout
///                  └────────▶ rejected
/// ```
pub fn determine_target_state(
    current: StepStatus,
    event: &StepEvent,
) -> SchedulerResult<StepStatus> {
    let target = match (current, event) {
        (StepStatus::Pending | StepStatus::Approving, StepEvent::RequestApproval) => {
            StepStatus::Approving
        }
        (StepStatus::Approving, StepEvent::Reject) => StepStatus::Rejected,

        (StepStatus::Pending | StepStatus::Approving, StepEvent::Start) => StepStatus::Running,

        (StepStatus::Running, StepEvent::Exit { exit_code: 0 }) => StepStatus::Complete,
        (StepStatus::Running, StepEvent::Exit { .. }) => StepStatus::Failed,
        (StepStatus::Running, StepEvent::Timeout) => StepStatus::Timeout,

        (StepStatus::Pending | StepStatus::Approving | StepStatus::Running, StepEvent::Fail(_)) => {
            StepStatus::Failed
        }

        (from, _) => {
            return Err(SchedulerError::StateTransition(format!(
                "step cannot handle {} while {from}",
                event.event_type()
            )))
        }
    };

    Ok(target)
}

/// Map a runner exit code to the step's terminal status
pub fn exit_status(exit_code: i32) -> StepStatus {
    if exit_code == 0 {
        StepStatus::Complete
    } else {
        StepStatus::Failed
    }
}
