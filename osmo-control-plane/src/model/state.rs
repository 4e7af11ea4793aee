// Copyright 2025 OSMO Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Pure transition rules for task, group and workflow statuses.
//!
//! Every status write against the store goes through a [`TransitionGuard`]:
//! the row must currently be in one of `allowed_from`, and the phase start
//! time column (when there is one) must still be unset. Out-of-order or
//! replayed events therefore update zero rows and are no-ops.

use osmo_common::model::TaskGroupStatus::*;
use osmo_common::model::{TaskGroupStatus, WorkflowStatus};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionGuard {
    pub allowed_from: &'static [TaskGroupStatus],
    /// Phase timestamp column that must be NULL for the write to land.
    pub phase_column: Option<&'static str>,
    pub sets_end_time: bool,
}

/// Guard for a task status transition, or `None` when the target can never
/// be written to a task row.
pub fn task_transition_guard(target: TaskGroupStatus) -> Option<TransitionGuard> {
    match target {
        Submitting => None,
        Waiting => Some(TransitionGuard {
            allowed_from: &[Submitting],
            phase_column: None,
            sets_end_time: false,
        }),
        Processing => Some(TransitionGuard {
            allowed_from: &[Waiting],
            phase_column: Some("processing_start_time"),
            sets_end_time: false,
        }),
        Scheduling => Some(TransitionGuard {
            allowed_from: &[Waiting, Processing],
            phase_column: Some("scheduling_start_time"),
            sets_end_time: false,
        }),
        Initializing => Some(TransitionGuard {
            allowed_from: &[Waiting, Processing, Scheduling],
            phase_column: Some("initializing_start_time"),
            sets_end_time: false,
        }),
        Running => Some(TransitionGuard {
            allowed_from: &[Waiting, Processing, Scheduling, Initializing],
            phase_column: Some("start_time"),
            sets_end_time: false,
        }),
        // Start timeouts only make sense while the pod never reached RUNNING.
        FailedStartTimeout => Some(TransitionGuard {
            allowed_from: &[Waiting, Processing, Scheduling, Initializing],
            phase_column: Some("end_time"),
            sets_end_time: true,
        }),
        _ => Some(TransitionGuard {
            allowed_from: &[Waiting, Processing, Scheduling, Initializing, Running],
            phase_column: Some("end_time"),
            sets_end_time: true,
        }),
    }
}

/// Guard for a group status transition. Groups have the extra SUBMITTING
/// prefix state, and a normal cancel may not interrupt PROCESSING (the
/// CreateGroup job may still be in flight); `force_cancel` may.
pub fn group_transition_guard(
    target: TaskGroupStatus,
    force_cancel: bool,
) -> Option<TransitionGuard> {
    match target {
        Submitting | Rescheduled => None,
        Waiting => Some(TransitionGuard {
            allowed_from: &[Submitting],
            phase_column: None,
            sets_end_time: false,
        }),
        Processing => Some(TransitionGuard {
            allowed_from: &[Submitting, Waiting],
            phase_column: Some("processing_start_time"),
            sets_end_time: false,
        }),
        Scheduling => Some(TransitionGuard {
            allowed_from: &[Submitting, Waiting, Processing],
            phase_column: Some("scheduling_start_time"),
            sets_end_time: false,
        }),
        Initializing => Some(TransitionGuard {
            allowed_from: &[Submitting, Waiting, Processing, Scheduling],
            phase_column: Some("initializing_start_time"),
            sets_end_time: false,
        }),
        Running => Some(TransitionGuard {
            allowed_from: &[Submitting, Waiting, Processing, Scheduling, Initializing],
            phase_column: Some("start_time"),
            sets_end_time: false,
        }),
        finished => {
            let allowed: &'static [TaskGroupStatus] = if finished.canceled() && !force_cancel {
                &[Submitting, Waiting, Scheduling, Initializing, Running]
            } else {
                &[
                    Submitting,
                    Waiting,
                    Processing,
                    Scheduling,
                    Initializing,
                    Running,
                ]
            };
            Some(TransitionGuard {
                allowed_from: allowed,
                phase_column: Some("end_time"),
                sets_end_time: true,
            })
        }
    }
}

/// A task's status together with its lead flag, as needed for aggregation.
#[derive(Clone, Copy, Debug)]
pub struct TaskView {
    pub status: TaskGroupStatus,
    pub lead: bool,
}

/// Group status as a function of its (latest-retry) task statuses.
///
/// When `ignore_nonlead` is set only the lead task decides the terminal
/// outcome, but upstream/server/preemption failures of any member still
/// surface, matching the cluster-wide nature of those failures.
pub fn aggregate_group(tasks: &[TaskView], ignore_nonlead: bool) -> TaskGroupStatus {
    let considered = |t: &TaskView| !ignore_nonlead || t.lead;

    if tasks.iter().any(|t| !t.status.group_finished()) {
        if tasks.iter().any(|t| t.status == Running) {
            return Running;
        }
        return Initializing;
    }
    if tasks.iter().any(|t| t.status == FailedUpstream) {
        return FailedUpstream;
    }
    if tasks.iter().any(|t| t.status == FailedServerError) {
        return FailedServerError;
    }
    if tasks.iter().any(|t| t.status == FailedPreempted) {
        return FailedPreempted;
    }
    if tasks
        .iter()
        .filter(|t| considered(t))
        .any(|t| t.status == FailedEvicted)
    {
        return FailedEvicted;
    }
    if tasks
        .iter()
        .filter(|t| considered(t))
        .any(|t| t.status.failed())
    {
        return Failed;
    }
    if tasks
        .iter()
        .filter(|t| considered(t))
        .all(|t| t.status == Completed)
    {
        return Completed;
    }
    Running
}

/// Workflow status as a function of its group statuses. `Pending` covers
/// the window where no group has left the queue yet; the failure ladder
/// mirrors the group aggregation.
pub fn aggregate_workflow(groups: &[TaskGroupStatus]) -> WorkflowStatus {
    if groups.iter().any(|g| !g.group_finished()) {
        if groups.iter().all(|g| g.in_queue()) {
            return WorkflowStatus::Pending;
        }
        return WorkflowStatus::Running;
    }
    if groups.iter().any(|g| *g == FailedUpstream) {
        return WorkflowStatus::FailedUpstream;
    }
    if groups.iter().any(|g| *g == FailedServerError) {
        return WorkflowStatus::FailedServerError;
    }
    if groups.iter().any(|g| *g == FailedPreempted) {
        return WorkflowStatus::FailedPreempted;
    }
    if groups.iter().any(|g| *g == FailedEvicted) {
        return WorkflowStatus::FailedEvicted;
    }
    if groups.iter().any(|g| *g == FailedExecTimeout) {
        return WorkflowStatus::FailedExecTimeout;
    }
    if groups.iter().any(|g| *g == FailedQueueTimeout) {
        return WorkflowStatus::FailedQueueTimeout;
    }
    if groups.iter().any(|g| *g == FailedCanceled) {
        return WorkflowStatus::FailedCanceled;
    }
    if groups.iter().any(|g| g.failed()) {
        return WorkflowStatus::Failed;
    }
    WorkflowStatus::Completed
}
