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

//! Cancellation and the self-rescheduling timeout checks. A check job
//! always re-reads the workflow row first: operators may extend timeouts
//! at any moment and the extension must win.

use crate::ids::generate_unique_id;
use crate::jobs::{
    self, CancelWorkflow, CheckQueueTimeout, CheckRunTimeout, Job, JobContext, JobError,
    JobPayload, JobResult, UpdateGroup,
};
use chrono::Utc;
use osmo_common::model::{TaskGroupStatus, WorkflowStatus};
use tracing::info;

pub async fn execute_cancel(
    payload: &CancelWorkflow,
    ctx: &JobContext,
) -> Result<JobResult, JobError> {
    let workflow = ctx
        .workflows
        .get(&payload.workflow_id)
        .await?
        .ok_or_else(|| JobError::Invalid(format!("Workflow {} not found", payload.workflow_id)))?;
    ctx.workflows
        .set_cancelled_by(&payload.workflow_id, &payload.user)
        .await?;

    for group in ctx.groups.list_by_workflow(&payload.workflow_id).await? {
        if group.status.group_finished() && !payload.force {
            continue;
        }

        let message = match payload.workflow_status {
            WorkflowStatus::FailedExecTimeout => {
                let mut message = "Task ran longer than the set limit".to_string();
                if let Some(timeout) = workflow.exec_timeout {
                    message.push_str(&format!(" of {timeout:?}"));
                }
                format!("{message}.")
            }
            WorkflowStatus::FailedQueueTimeout => {
                let mut message = "Task stayed in queue longer than the set limit".to_string();
                if let Some(timeout) = workflow.queue_timeout {
                    message.push_str(&format!(" of {timeout:?}"));
                }
                format!("{message}.")
            }
            _ => {
                let mut message = format!("Task was canceled by user: {}.", payload.user);
                if let Some(extra) = &payload.message {
                    message.push_str(&format!(" {extra}"));
                }
                message
            }
        };

        let update = UpdateGroup {
            workflow_id: payload.workflow_id.clone(),
            workflow_uuid: payload.workflow_uuid,
            group_name: group.name.clone(),
            task_name: None,
            retry_id: None,
            status: payload.task_status,
            message,
            user: payload.user.clone(),
            exit_code: None,
            force_cancel: payload.force,
            lead_task: true,
        };
        if payload.force {
            // Forced cancels always re-run, so they must not collide with
            // an earlier update of the same status.
            let job_id = format!(
                "{}-{}-{}-force-update-{}",
                payload.workflow_uuid,
                group.name,
                generate_unique_id(5),
                payload.task_status
            );
            ctx.broker
                .enqueue(&Job::with_job_id(JobPayload::UpdateGroup(update), job_id))
                .await?;
        } else {
            jobs::enqueue_update_group(ctx, update).await?;
        }
    }

    Ok(JobResult::success())
}

pub async fn execute_check_run_timeout(
    payload: &CheckRunTimeout,
    ctx: &JobContext,
) -> Result<JobResult, JobError> {
    let workflow = ctx
        .workflows
        .get(&payload.workflow_id)
        .await?
        .ok_or_else(|| JobError::Invalid(format!("Workflow {} not found", payload.workflow_id)))?;
    if workflow.status.finished() {
        return Ok(JobResult::success());
    }
    let Some(start_time) = workflow.start_time else {
        return Ok(JobResult::success());
    };

    let pool = ctx.pools.get(&workflow.pool).await?;
    let exec_timeout = jobs::effective_exec_timeout(&workflow, pool.as_ref(), &ctx.settings);
    let elapsed = Utc::now()
        .signed_duration_since(start_time)
        .to_std()
        .unwrap_or_default();

    if exec_timeout > elapsed {
        info!(
            workflow_id = %payload.workflow_id,
            elapsed_secs = elapsed.as_secs(),
            timeout_secs = exec_timeout.as_secs(),
            "Execution timeout extended; rescheduling the check"
        );
        ctx.broker
            .enqueue_delayed(
                &Job::new(JobPayload::CheckRunTimeout(payload.clone())),
                exec_timeout - elapsed,
            )
            .await?;
    } else {
        jobs::enqueue(
            ctx,
            JobPayload::CancelWorkflow(CancelWorkflow {
                workflow_id: payload.workflow_id.clone(),
                workflow_uuid: payload.workflow_uuid,
                user: "osmo".to_string(),
                workflow_status: WorkflowStatus::FailedExecTimeout,
                task_status: TaskGroupStatus::FailedExecTimeout,
                message: None,
                force: false,
            }),
        )
        .await?;
    }
    Ok(JobResult::success())
}

pub async fn execute_check_queue_timeout(
    payload: &CheckQueueTimeout,
    ctx: &JobContext,
) -> Result<JobResult, JobError> {
    let workflow = ctx
        .workflows
        .get(&payload.workflow_id)
        .await?
        .ok_or_else(|| JobError::Invalid(format!("Workflow {} not found", payload.workflow_id)))?;
    if workflow.status != WorkflowStatus::Pending {
        return Ok(JobResult::success());
    }
    let Some(submit_time) = workflow.submit_time else {
        return Ok(JobResult::success());
    };

    let pool = ctx.pools.get(&workflow.pool).await?;
    let queue_timeout = jobs::effective_queue_timeout(&workflow, pool.as_ref(), &ctx.settings);
    let queued = Utc::now()
        .signed_duration_since(submit_time)
        .to_std()
        .unwrap_or_default();

    if queue_timeout > queued {
        info!(
            workflow_id = %payload.workflow_id,
            queued_secs = queued.as_secs(),
            timeout_secs = queue_timeout.as_secs(),
            "Queue timeout extended; rescheduling the check"
        );
        ctx.broker
            .enqueue_delayed(
                &Job::new(JobPayload::CheckQueueTimeout(payload.clone())),
                queue_timeout - queued,
            )
            .await?;
    } else {
        jobs::enqueue(
            ctx,
            JobPayload::CancelWorkflow(CancelWorkflow {
                workflow_id: payload.workflow_id.clone(),
                workflow_uuid: payload.workflow_uuid,
                user: "osmo".to_string(),
                workflow_status: WorkflowStatus::FailedQueueTimeout,
                task_status: TaskGroupStatus::FailedQueueTimeout,
                message: None,
                force: false,
            }),
        )
        .await?;
    }
    Ok(JobResult::success())
}
