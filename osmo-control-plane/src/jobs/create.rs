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

//! Frontend side of the backend jobs that place pods: CreateGroup's
//! pre-dispatch rendering and RescheduleTask's retry bookkeeping.

use crate::broker::streams::error_log_key;
use crate::jobs::{
    self, CreateGroup, FileContent, Job, JobContext, JobError, JobPayload, JobResult,
    PrepareOutcome, RescheduleTask, UpdateGroup, UploadWorkflowFiles,
};
use crate::renderer::{RenderRequest, RenderTask};
use crate::scheduler;
use osmo_common::model::{ExitCode, TaskGroupStatus};
use tracing::info;

pub async fn prepare_create_group(
    payload: &mut CreateGroup,
    ctx: &JobContext,
) -> Result<PrepareOutcome, JobError> {
    let group = ctx
        .groups
        .get(&payload.workflow_id, &payload.group_name)
        .await?
        .ok_or_else(|| {
            JobError::Invalid(format!(
                "Group {} of workflow {} not found",
                payload.group_name, payload.workflow_id
            ))
        })?;

    if !matches!(
        group.status,
        TaskGroupStatus::Waiting | TaskGroupStatus::Processing
    ) {
        return Ok(PrepareOutcome::Abort(format!(
            "Create Group Failed: Group {} has status: {}.",
            group.name, group.status
        )));
    }

    if payload.k8s_resources.is_none() {
        let workflow = ctx
            .workflows
            .get(&payload.workflow_id)
            .await?
            .ok_or_else(|| {
                JobError::Invalid(format!("Workflow {} not found", payload.workflow_id))
            })?;
        let backend = ctx.backends.get(&workflow.backend).await?;
        let (namespace, scheduler_settings) = match &backend {
            Some(backend) => (
                backend.k8s_namespace.clone(),
                backend.scheduler_settings.clone(),
            ),
            None => (String::new(), Default::default()),
        };

        let tasks = ctx
            .tasks
            .list_latest_by_group(&payload.workflow_id, &payload.group_name)
            .await?;
        let render_tasks: Vec<RenderTask> = tasks
            .iter()
            .filter_map(|task| {
                group.spec.task(&task.name).map(|spec| RenderTask {
                    name: task.name.clone(),
                    task_uuid: task.task_uuid,
                    retry_id: task.retry_id,
                    spec: spec.clone(),
                })
            })
            .collect();
        let request = RenderRequest {
            workflow_id: payload.workflow_id.clone(),
            workflow_uuid: payload.workflow_uuid,
            user: payload.user.clone(),
            pool: workflow.pool.clone(),
            priority: workflow.priority,
            group_name: group.name.clone(),
            group_uuid: group.group_uuid,
            gang_queue: scheduler::gang_queue_name(&namespace, &workflow.pool),
            namespace,
            scheduler: scheduler_settings,
            tasks: render_tasks,
        };
        let rendered = ctx
            .renderer
            .render_group(&request)
            .map_err(|err| JobError::Invalid(err.to_string()))?;
        payload.k8s_resources = Some(rendered.resources);

        let files: Vec<FileContent> = rendered
            .pod_specs
            .iter()
            .map(|(task_name, pod_spec)| {
                serde_yaml::to_string(pod_spec).map(|content| FileContent {
                    path: format!("{task_name}.spec"),
                    content,
                })
            })
            .collect::<Result<_, _>>()
            .map_err(|err| JobError::Invalid(err.to_string()))?;
        jobs::enqueue(
            ctx,
            JobPayload::UploadWorkflowFiles(UploadWorkflowFiles {
                workflow_id: payload.workflow_id.clone(),
                workflow_uuid: payload.workflow_uuid,
                files,
            }),
        )
        .await?;
    }

    Ok(PrepareOutcome::Ready)
}

pub async fn handle_create_failure(
    payload: &CreateGroup,
    ctx: &JobContext,
    error: &str,
) -> Result<(), JobError> {
    jobs::enqueue_update_group(
        ctx,
        UpdateGroup {
            workflow_id: payload.workflow_id.clone(),
            workflow_uuid: payload.workflow_uuid,
            group_name: payload.group_name.clone(),
            task_name: None,
            retry_id: None,
            status: TaskGroupStatus::FailedServerError,
            message: format!("CreateGroup job failed: {error}"),
            user: payload.user.clone(),
            exit_code: Some(ExitCode::FailedServerError.code()),
            force_cancel: false,
            lead_task: true,
        },
    )
    .await
}

pub async fn prepare_reschedule(
    payload: &mut RescheduleTask,
    ctx: &JobContext,
) -> Result<PrepareOutcome, JobError> {
    let latest = ctx
        .tasks
        .get(&payload.workflow_id, &payload.task_name, None)
        .await?
        .ok_or_else(|| {
            JobError::Invalid(format!(
                "Task {} of workflow {} not found",
                payload.task_name, payload.workflow_id
            ))
        })?;

    if latest.retry_id != payload.retry_id {
        return Ok(PrepareOutcome::Abort(format!(
            "Reschedule Task Failed: Latest retry is {} for task {}",
            latest.retry_id, payload.task_name
        )));
    }
    if !latest.status.prescheduling() {
        if latest.status.group_finished() {
            // The group finished while the reschedule was queued; the
            // superseded pod still needs a (delayed) cleanup.
            delay_cleanup_pod(payload, ctx).await?;
        }
        return Ok(PrepareOutcome::Abort(format!(
            "Reschedule Task Failed: Task has status {}",
            latest.status
        )));
    }

    // The previous retry's error logs are stale if the job ran before.
    ctx.logs
        .delete(&[error_log_key(
            &payload.workflow_id,
            &latest.task_uuid,
            payload.retry_id - 1,
        )])
        .await
        .map_err(|err| JobError::Storage(err.to_string()))?;
    Ok(PrepareOutcome::Ready)
}

pub async fn execute_reschedule(
    payload: &RescheduleTask,
    ctx: &JobContext,
) -> Result<JobResult, JobError> {
    let status = ctx
        .groups
        .fetch_status(&payload.workflow_id, &payload.create_job.group_name)
        .await?;
    if status.group_finished() {
        // UpdateGroup already settled every task and cleaned up; only the
        // superseded pod remains.
        delay_cleanup_pod(payload, ctx).await?;
    }
    Ok(JobResult::success())
}

async fn delay_cleanup_pod(payload: &RescheduleTask, ctx: &JobContext) -> Result<(), JobError> {
    let mut cleanup = payload.cleanup_job.clone();
    if let Some(spec) = &mut cleanup.error_log_spec {
        spec.labels
            .insert("osmo.retry_id".to_string(), payload.retry_id.to_string());
    }
    for spec in &mut cleanup.cleanup_specs {
        spec.labels
            .insert("osmo.retry_id".to_string(), payload.retry_id.to_string());
    }

    let job_id = format!(
        "{}-{}-{}-backend-cleanup",
        payload.workflow_uuid, payload.task_name, payload.retry_id
    );
    info!(job_id = %job_id, "Scheduling delayed cleanup of superseded pod");
    ctx.broker
        .enqueue_delayed(
            &Job::with_job_id(JobPayload::CleanupGroup(cleanup), job_id),
            ctx.settings.force_cleanup_delay,
        )
        .await?;
    Ok(())
}

pub async fn handle_reschedule_failure(
    payload: &RescheduleTask,
    ctx: &JobContext,
    error: &str,
) -> Result<(), JobError> {
    jobs::enqueue_update_group(
        ctx,
        UpdateGroup {
            workflow_id: payload.workflow_id.clone(),
            workflow_uuid: payload.workflow_uuid,
            group_name: payload.create_job.group_name.clone(),
            task_name: Some(payload.task_name.clone()),
            retry_id: Some(payload.retry_id),
            status: TaskGroupStatus::FailedBackendError,
            message: format!("RescheduleTask job failed: {error}"),
            user: payload.create_job.user.clone(),
            exit_code: Some(ExitCode::FailedBackendError.code()),
            force_cancel: false,
            lead_task: payload.lead_task,
        },
    )
    .await
}
