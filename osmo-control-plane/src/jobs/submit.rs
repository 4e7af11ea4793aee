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

//! SubmitWorkflow: expands the accepted spec into store rows and kicks
//! off the root groups of the DAG.

use crate::broker::streams::{workflow_event_key, workflow_log_key, LogEntry};
use crate::jobs::{
    self, CheckQueueTimeout, CreateGroup, JobContext, JobError, JobPayload, JobResult,
    SubmitWorkflow, UpdateGroup,
};
use crate::model::{TaskGroup, Workflow};
use crate::renderer::construct_pod_name;
use crate::repo::group::NewGroup;
use crate::repo::task::NewTask;
use crate::scheduler;
use chrono::Utc;
use osmo_common::model::{ExitCode, TaskGroupStatus, WorkflowStatus};
use tracing::info;

pub async fn execute(payload: &SubmitWorkflow, ctx: &JobContext) -> Result<JobResult, JobError> {
    let edges = scheduler::expand_dag(&payload.spec)
        .map_err(|err| JobError::Invalid(err.to_string()))?;

    let pool = ctx
        .pools
        .get(&payload.pool)
        .await?
        .ok_or_else(|| JobError::Invalid(format!("Pool {} not found", payload.pool)))?;

    let now = Utc::now();
    let workflow = Workflow {
        workflow_id: payload.workflow_id.clone(),
        workflow_uuid: payload.workflow_uuid,
        user: payload.user.clone(),
        pool: pool.name.clone(),
        backend: pool.backend.clone(),
        priority: payload.priority,
        status: WorkflowStatus::Pending,
        submit_time: Some(now),
        start_time: None,
        end_time: None,
        exec_timeout: payload.spec.timeout.exec_timeout,
        queue_timeout: payload.spec.timeout.queue_timeout,
        logs: workflow_log_key(&payload.workflow_id),
        events: workflow_event_key(&payload.workflow_uuid),
        failure_message: None,
        cancelled_by: None,
        parent_workflow_id: payload.parent_workflow_id.clone(),
        app_uuid: payload.app_uuid,
        app_version: payload.app_version,
        plugins: serde_json::Value::Object(Default::default()),
    };
    ctx.workflows.insert(&workflow).await?;

    for group_spec in &payload.spec.groups {
        let group_uuid = payload
            .group_uuids
            .get(&group_spec.name)
            .copied()
            .ok_or_else(|| JobError::Invalid(format!("Missing uuid for group {}", group_spec.name)))?;
        ctx.groups
            .insert(&NewGroup {
                workflow_id: payload.workflow_id.clone(),
                name: group_spec.name.clone(),
                group_uuid,
                spec: group_spec.clone(),
                remaining_upstream: edges
                    .remaining_upstream
                    .get(&group_spec.name)
                    .cloned()
                    .unwrap_or_default(),
                downstream: edges
                    .downstream
                    .get(&group_spec.name)
                    .cloned()
                    .unwrap_or_default(),
            })
            .await?;

        for task_spec in &group_spec.tasks {
            let task_uuid = payload.task_uuids.get(&task_spec.name).copied().ok_or_else(
                || JobError::Invalid(format!("Missing uuid for task {}", task_spec.name)),
            )?;
            let task_db_key = payload
                .task_db_keys
                .get(&task_spec.name)
                .copied()
                .ok_or_else(|| {
                    JobError::Invalid(format!("Missing db key for task {}", task_spec.name))
                })?;
            ctx.tasks
                .insert(&NewTask {
                    workflow_id: payload.workflow_id.clone(),
                    name: task_spec.name.clone(),
                    group_name: group_spec.name.clone(),
                    task_uuid,
                    task_db_key,
                    retry_id: 0,
                    status: TaskGroupStatus::Waiting,
                    lead: task_spec.lead,
                    exit_actions: task_spec.exit_actions.clone(),
                    pod_name: construct_pod_name(&payload.workflow_uuid, &task_uuid),
                    gpu_count: task_spec.resources.gpu.unwrap_or(0.0),
                    cpu_count: task_spec.resources.cpu.unwrap_or(0.0),
                    memory_count: task_spec.resources.memory_gib.unwrap_or(0.0),
                    disk_count: task_spec.resources.storage_gib.unwrap_or(0.0),
                })
                .await?;
        }
    }

    let queue_timeout = jobs::effective_queue_timeout(&workflow, Some(&pool), &ctx.settings);
    ctx.broker
        .enqueue_delayed(
            &crate::jobs::Job::new(JobPayload::CheckQueueTimeout(CheckQueueTimeout {
                workflow_id: payload.workflow_id.clone(),
                workflow_uuid: payload.workflow_uuid,
            })),
            queue_timeout,
        )
        .await?;

    // Cancellation may have arrived while rows were being created; in that
    // case the groups stay in SUBMITTING and the cancel path owns them.
    if !ctx.groups.mark_groups_waiting(&payload.workflow_id).await? {
        info!(
            workflow_id = %payload.workflow_id,
            "Workflow was cancelled during submission"
        );
        return Ok(JobResult::success());
    }

    let scheduler_settings = match ctx.backends.get(&pool.backend).await? {
        Some(backend) => backend.scheduler_settings,
        // The backend row appears on the agent's first INIT; until then
        // groups dispatch with stock settings.
        None => Default::default(),
    };

    let groups = ctx.groups.list_by_workflow(&payload.workflow_id).await?;
    for group in groups {
        if !group.remaining_upstream.is_empty() {
            continue;
        }
        dispatch_group(ctx, &workflow, &group, &scheduler_settings).await?;
    }

    Ok(JobResult::success())
}

/// Moves an unblocked group into PROCESSING and enqueues its CreateGroup.
pub(crate) async fn dispatch_group(
    ctx: &JobContext,
    workflow: &Workflow,
    group: &TaskGroup,
    scheduler_settings: &crate::model::SchedulerSettings,
) -> Result<(), JobError> {
    ctx.tasks
        .mark_processing(&workflow.workflow_id, &group.name)
        .await?;
    ctx.groups
        .update_status(
            &workflow.workflow_id,
            &group.name,
            TaskGroupStatus::Processing,
            Utc::now(),
            "",
            false,
            Some(scheduler_settings),
        )
        .await?;
    jobs::enqueue(
        ctx,
        JobPayload::CreateGroup(CreateGroup {
            backend: workflow.backend.clone(),
            workflow_id: workflow.workflow_id.clone(),
            workflow_uuid: workflow.workflow_uuid,
            group_name: group.name.clone(),
            user: workflow.user.clone(),
            k8s_resources: None,
        }),
    )
    .await
}

pub async fn handle_failure(
    payload: &SubmitWorkflow,
    ctx: &JobContext,
    error: &str,
) -> Result<(), JobError> {
    let Some(workflow) = ctx.workflows.get(&payload.workflow_id).await? else {
        info!(
            workflow_id = %payload.workflow_id,
            "Workflow row never materialized; nothing to fail"
        );
        return Ok(());
    };

    ctx.logs
        .append(
            &workflow_log_key(&workflow.workflow_id),
            &LogEntry::control(format!(
                "Failed SubmitWorkflow for workflow {} with error: {error}",
                workflow.workflow_id
            )),
            Some(ctx.settings.max_log_lines),
        )
        .await
        .map_err(|err| JobError::Storage(err.to_string()))?;

    for group in ctx.groups.list_by_workflow(&workflow.workflow_id).await? {
        if group.status.group_finished() {
            continue;
        }
        jobs::enqueue_update_group(
            ctx,
            UpdateGroup {
                workflow_id: workflow.workflow_id.clone(),
                workflow_uuid: workflow.workflow_uuid,
                group_name: group.name.clone(),
                task_name: None,
                retry_id: None,
                status: TaskGroupStatus::FailedServerError,
                message: format!(
                    "Task is canceled due to Failed Infra: {}, {error}",
                    payload.user
                ),
                user: payload.user.clone(),
                exit_code: Some(ExitCode::FailedServerError.code()),
                force_cancel: false,
                lead_task: true,
            },
        )
        .await?;
    }
    Ok(())
}
