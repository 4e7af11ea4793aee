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

//! UpdateGroup: the central transition handler. Applies one task event
//! (or a whole-group cancellation) through the state-machine guards,
//! re-aggregates group and workflow status, and cascades cleanup,
//! downstream dispatch and retries.

use crate::broker::streams::ActionToken;
use crate::ids::generate_unique_id;
use crate::jobs::cleanup::cleanup_workflow_group;
use crate::jobs::{
    self, CheckRunTimeout, CleanupGroup, CreateGroup, Job, JobContext, JobError, JobPayload,
    JobResult, RescheduleTask, UpdateGroup,
};
use crate::model::state::{aggregate_group, aggregate_workflow, TaskView};
use crate::model::{Backend, Pool, Task, TaskGroup, Workflow};
use crate::renderer::{RenderRequest, RenderTask};
use crate::scheduler::{self, apply_exit_action};
use chrono::{DateTime, Utc};
use osmo_common::model::{ExitCode, TaskGroupStatus, WorkflowId};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

pub async fn execute(payload: &UpdateGroup, ctx: &JobContext) -> Result<JobResult, JobError> {
    let mut payload = payload.clone();
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
    let now = Utc::now();

    if payload.status.canceled() {
        // A cancel must not race a CreateGroup that is mid-flight on the
        // worker channel; unless forced it waits for PROCESSING to yield.
        if group.status != TaskGroupStatus::Processing || payload.force_cancel {
            ctx.groups
                .update_status(
                    &payload.workflow_id,
                    &payload.group_name,
                    payload.status,
                    now,
                    &payload.message,
                    payload.force_cancel,
                    None,
                )
                .await?;
        }
        let current = ctx
            .groups
            .fetch_status(&payload.workflow_id, &payload.group_name)
            .await?;
        if current == TaskGroupStatus::Processing {
            let delayed_id = format!(
                "{}-{}",
                generate_unique_id(5),
                payload.deterministic_job_id()
            );
            ctx.broker
                .enqueue_delayed(
                    &Job::with_job_id(JobPayload::UpdateGroup(payload.clone()), delayed_id),
                    ctx.settings.cancel_retry_delay,
                )
                .await?;
            return Ok(JobResult::no_retry(format!(
                "Group status is {current}: Adding back into job queue."
            )));
        }
    }

    let workflow = ctx
        .workflows
        .get(&payload.workflow_id)
        .await?
        .ok_or_else(|| {
            JobError::Invalid(format!("Workflow {} not found", payload.workflow_id))
        })?;
    let pool = ctx.pools.get(&workflow.pool).await?;
    let total_ttl = jobs::total_timeout(
        workflow.queue_timeout,
        workflow.exec_timeout,
        &ctx.settings,
    );

    if payload.status.canceled()
        || matches!(
            payload.status,
            TaskGroupStatus::FailedUpstream | TaskGroupStatus::FailedServerError
        )
    {
        for task in ctx
            .tasks
            .list_latest_by_group(&payload.workflow_id, &payload.group_name)
            .await?
        {
            ctx.tasks
                .update_status(
                    &task.task_db_key,
                    payload.status,
                    now,
                    &payload.message,
                    payload.exit_code,
                )
                .await?;
        }
    } else if let (Some(task_name), Some(retry_id)) = (payload.task_name.clone(), payload.retry_id)
    {
        let current_task = ctx
            .tasks
            .get(&payload.workflow_id, &task_name, Some(retry_id))
            .await?
            .ok_or_else(|| {
                JobError::Invalid(format!(
                    "Task {task_name} retry {retry_id} of workflow {} not found",
                    payload.workflow_id
                ))
            })?;

        if !current_task.status.prerunning()
            && payload.status == TaskGroupStatus::FailedStartTimeout
        {
            info!(
                task = %current_task.name,
                status = %current_task.status,
                "Skipping FAILED_START_TIMEOUT for a task that already started"
            );
            return Ok(JobResult::success());
        }

        let applied = update_all_tasks(
            &mut payload,
            ctx,
            &group,
            pool.as_ref(),
            &workflow,
            &current_task,
            now,
            total_ttl,
        )
        .await?;
        // A guarded write that affected no row means the event is stale
        // or a broker redelivery; neither may cascade.
        if !applied {
            return Ok(JobResult::success());
        }
    }

    // A rescheduled task keeps its group alive.
    if payload.status == TaskGroupStatus::Rescheduled {
        payload.status = TaskGroupStatus::Running;
    }

    if group.status.prerunning() && payload.status == TaskGroupStatus::Running {
        let exec_timeout = jobs::effective_exec_timeout(&workflow, pool.as_ref(), &ctx.settings);
        ctx.broker
            .enqueue_delayed(
                &Job::new(JobPayload::CheckRunTimeout(CheckRunTimeout {
                    workflow_id: payload.workflow_id.clone(),
                    workflow_uuid: payload.workflow_uuid,
                })),
                exec_timeout,
            )
            .await?;
    }

    // Group status: queue-phase and cancellation statuses are written as
    // given; everything else is the aggregate of the latest task rows.
    let group_status = if payload.status.in_queue() || payload.status.canceled() {
        payload.status
    } else {
        let tasks = ctx
            .tasks
            .list_latest_by_group(&payload.workflow_id, &payload.group_name)
            .await?;
        let views: Vec<TaskView> = tasks
            .iter()
            .map(|task| TaskView {
                status: task.status,
                lead: task.lead,
            })
            .collect();
        aggregate_group(&views, group.spec.ignore_nonlead_status)
    };
    if group_status != group.status {
        ctx.groups
            .update_status(
                &payload.workflow_id,
                &payload.group_name,
                group_status,
                now,
                &payload.message,
                payload.force_cancel,
                None,
            )
            .await?;
    }

    let group_statuses: Vec<TaskGroupStatus> = ctx
        .groups
        .list_by_workflow(&payload.workflow_id)
        .await?
        .iter()
        .map(|group| group.status)
        .collect();
    let workflow_status = aggregate_workflow(&group_statuses);
    let workflow_status_changed = workflow_status != workflow.status;
    if workflow_status_changed {
        let canceled_by =
            (payload.status == TaskGroupStatus::FailedCanceled).then_some(payload.user.as_str());
        let failure_message = workflow_status
            .failed()
            .then_some(payload.message.as_str());
        ctx.workflows
            .update_status(
                &payload.workflow_id,
                workflow_status,
                now,
                failure_message,
                canceled_by,
            )
            .await?;
    }

    // Notify only when the workflow freshly finished, and only for a real
    // lead result; upstream-failure echoes are bookkeeping, not outcomes.
    if workflow_status.finished()
        && workflow_status_changed
        && payload.lead_task
        && payload.status != TaskGroupStatus::FailedUpstream
    {
        ctx.notifier.workflow_finished(&workflow, workflow_status).await;
    }

    let backend = ctx.backends.get(&workflow.backend).await?;

    schedule_cleanup_job(&payload, ctx, &workflow, &group, backend.as_ref()).await?;

    // Re-read in case a concurrent event moved the group.
    let group_status = ctx
        .groups
        .fetch_status(&payload.workflow_id, &payload.group_name)
        .await?;
    match backend {
        None => {
            for downstream in &group.downstream {
                jobs::enqueue_update_group(
                    ctx,
                    UpdateGroup {
                        workflow_id: payload.workflow_id.clone(),
                        workflow_uuid: payload.workflow_uuid,
                        group_name: downstream.clone(),
                        task_name: None,
                        retry_id: None,
                        status: TaskGroupStatus::Failed,
                        message: "Backend not found.".to_string(),
                        user: payload.user.clone(),
                        exit_code: Some(ExitCode::FailedUpstream.code()),
                        force_cancel: false,
                        lead_task: true,
                    },
                )
                .await?;
            }
        }
        Some(_) if group_status.failed() => {
            for downstream in &group.downstream {
                jobs::enqueue_update_group(
                    ctx,
                    UpdateGroup {
                        workflow_id: payload.workflow_id.clone(),
                        workflow_uuid: payload.workflow_uuid,
                        group_name: downstream.clone(),
                        task_name: None,
                        retry_id: None,
                        status: TaskGroupStatus::FailedUpstream,
                        message: "Upstream task failed.".to_string(),
                        user: payload.user.clone(),
                        exit_code: Some(ExitCode::FailedUpstream.code()),
                        force_cancel: false,
                        lead_task: true,
                    },
                )
                .await?;
            }
        }
        Some(backend) if group_status == TaskGroupStatus::Completed => {
            for downstream in &group.downstream {
                let unblocked = ctx
                    .groups
                    .remove_upstream(&payload.workflow_id, downstream, &payload.group_name)
                    .await?;
                if !unblocked {
                    continue;
                }
                let downstream_group = ctx
                    .groups
                    .get(&payload.workflow_id, downstream)
                    .await?
                    .ok_or_else(|| {
                        JobError::Invalid(format!("Downstream group {downstream} not found"))
                    })?;
                crate::jobs::submit::dispatch_group(
                    ctx,
                    &workflow,
                    &downstream_group,
                    &backend.scheduler_settings,
                )
                .await?;
            }
        }
        Some(_) => {}
    }

    Ok(JobResult::success())
}

/// Applies the event to the referenced task and propagates to its peers.
/// Returns whether the guarded write landed; the store reports that via
/// the affected-row count, and a write that landed nowhere means the
/// event lost the race (or is a redelivery) and must not cascade.
#[allow(clippy::too_many_arguments)]
async fn update_all_tasks(
    payload: &mut UpdateGroup,
    ctx: &JobContext,
    group: &TaskGroup,
    pool: Option<&Pool>,
    workflow: &Workflow,
    current_task: &Task,
    now: DateTime<Utc>,
    total_ttl: Duration,
) -> Result<bool, JobError> {
    if !payload.status.finished() {
        return apply_task_status(payload, ctx, current_task, now).await;
    }

    let retry_allowed = group
        .scheduler_settings
        .clone()
        .unwrap_or_default()
        .scheduler_type
        .retry_allowed();
    let max_retries = if retry_allowed {
        ctx.settings.max_retry_per_task
    } else {
        0
    };
    let empty = BTreeMap::new();
    let pool_actions = pool.map(|pool| &pool.default_exit_actions).unwrap_or(&empty);
    if let Some(applied) = apply_exit_action(
        payload.status,
        payload.exit_code,
        &current_task.exit_actions,
        pool_actions,
        current_task.retry_id,
        max_retries,
    ) {
        payload.status = applied.status;
        payload.message.push_str(&applied.note);
    }

    let task_name = current_task.name.clone();
    let peers: Vec<Task> = ctx
        .tasks
        .list_latest_by_group(&payload.workflow_id, &payload.group_name)
        .await?
        .into_iter()
        .filter(|task| task.name != task_name)
        .collect();

    if payload.lead_task {
        if group.spec.has_group_barrier() {
            ctx.logs
                .barrier_clear(&payload.workflow_id, &payload.group_name)
                .await
                .map_err(|err| JobError::Storage(err.to_string()))?;
        }
        let applied = apply_task_status(payload, ctx, current_task, now).await?;
        if !applied {
            return Ok(false);
        }

        if payload.status == TaskGroupStatus::Rescheduled {
            retry_task(payload, ctx, group, workflow, current_task).await?;
            for peer in &peers {
                restart_task(ctx, &payload.workflow_id, peer, total_ttl).await?;
            }
        } else {
            for peer in &peers {
                // Peers did not fail themselves; special failure variants
                // collapse to plain FAILED for them.
                let peer_status = if payload.status.failed() {
                    TaskGroupStatus::Failed
                } else {
                    payload.status
                };
                ctx.tasks
                    .update_status(
                        &peer.task_db_key,
                        peer_status,
                        now,
                        "Lead task finished",
                        None,
                    )
                    .await?;
            }
        }
        Ok(true)
    } else {
        if group.spec.has_group_barrier() {
            ctx.logs
                .barrier_leave(&payload.workflow_id, &payload.group_name, &task_name)
                .await
                .map_err(|err| JobError::Storage(err.to_string()))?;
        }
        let applied = apply_task_status(payload, ctx, current_task, now).await?;
        if group.spec.has_group_barrier() && applied {
            notify_barrier(payload, ctx, total_ttl).await?;
        }
        if !applied {
            return Ok(false);
        }

        if payload.status == TaskGroupStatus::Rescheduled {
            if !group.spec.ignore_nonlead_status {
                if group.spec.has_group_barrier() {
                    ctx.logs
                        .barrier_clear(&payload.workflow_id, &payload.group_name)
                        .await
                        .map_err(|err| JobError::Storage(err.to_string()))?;
                }
                for peer in &peers {
                    restart_task(ctx, &payload.workflow_id, peer, total_ttl).await?;
                }
            }
            retry_task(payload, ctx, group, workflow, current_task).await?;
        } else if payload.status.failed() && !group.spec.ignore_nonlead_status {
            for peer in &peers {
                ctx.tasks
                    .update_status(
                        &peer.task_db_key,
                        TaskGroupStatus::Failed,
                        now,
                        &format!("Task {task_name} Failed."),
                        None,
                    )
                    .await?;
            }
        }
        Ok(true)
    }
}

/// One guarded status write for the event's task. True when the write
/// landed, false when the guards rejected it.
async fn apply_task_status(
    payload: &UpdateGroup,
    ctx: &JobContext,
    current_task: &Task,
    now: DateTime<Utc>,
) -> Result<bool, JobError> {
    Ok(ctx
        .tasks
        .update_status(
            &current_task.task_db_key,
            payload.status,
            now,
            &payload.message,
            payload.exit_code,
        )
        .await?)
}

/// Inserts the retry row and sends the reschedule bundle (old-pod cleanup
/// plus new-pod create) to the backend.
async fn retry_task(
    payload: &UpdateGroup,
    ctx: &JobContext,
    group: &TaskGroup,
    workflow: &Workflow,
    task: &Task,
) -> Result<(), JobError> {
    let spec = group.spec.task(&task.name).ok_or_else(|| {
        JobError::Invalid(format!(
            "Task {} is not found in group {}.",
            task.name, group.name
        ))
    })?;

    let new_task = crate::repo::task::NewTask {
        workflow_id: payload.workflow_id.clone(),
        name: task.name.clone(),
        group_name: group.name.clone(),
        task_uuid: task.task_uuid,
        task_db_key: osmo_common::model::TaskDbKey::new_v4(),
        retry_id: task.retry_id + 1,
        status: TaskGroupStatus::Processing,
        lead: task.lead,
        exit_actions: task.exit_actions.clone(),
        pod_name: task.pod_name.clone(),
        gpu_count: spec.resources.gpu.unwrap_or(0.0),
        cpu_count: spec.resources.cpu.unwrap_or(0.0),
        memory_count: spec.resources.memory_gib.unwrap_or(0.0),
        disk_count: spec.resources.storage_gib.unwrap_or(0.0),
    };
    ctx.tasks.insert_retry(&new_task, &task.task_db_key).await?;

    let backend = ctx.backends.get(&workflow.backend).await?;
    let (namespace, scheduler) = match &backend {
        Some(backend) => (
            backend.k8s_namespace.clone(),
            backend.scheduler_settings.clone(),
        ),
        None => (String::new(), Default::default()),
    };
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
        scheduler,
        tasks: Vec::new(),
    };
    let render_task = RenderTask {
        name: new_task.name.clone(),
        task_uuid: new_task.task_uuid,
        retry_id: new_task.retry_id,
        spec: spec.clone(),
    };
    let pod = ctx
        .renderer
        .render_task(&request, &render_task)
        .map_err(|err| JobError::Invalid(err.to_string()))?;

    // Cleanup targets the superseded retry's pod only.
    let labels = BTreeMap::from([
        (
            "osmo.workflow_uuid".to_string(),
            payload.workflow_uuid.to_string(),
        ),
        ("osmo.group_uuid".to_string(), group.group_uuid.to_string()),
        ("osmo.task_name".to_string(), task.name.clone()),
        ("osmo.retry_id".to_string(), task.retry_id.to_string()),
    ]);
    let error_log_spec = ctx.renderer.error_log_spec(&labels);
    let cleanup_job = CleanupGroup {
        backend: workflow.backend.clone(),
        workflow_id: payload.workflow_id.clone(),
        workflow_uuid: payload.workflow_uuid,
        group_name: group.name.clone(),
        force_delete: false,
        cleanup_specs: vec![error_log_spec.clone()],
        error_log_spec: Some(error_log_spec),
        max_log_lines: ctx.settings.max_error_log_lines,
    };
    let create_job = CreateGroup {
        backend: workflow.backend.clone(),
        workflow_id: payload.workflow_id.clone(),
        workflow_uuid: payload.workflow_uuid,
        group_name: group.name.clone(),
        user: payload.user.clone(),
        k8s_resources: Some(vec![pod]),
    };
    jobs::enqueue(
        ctx,
        JobPayload::RescheduleTask(RescheduleTask {
            backend: workflow.backend.clone(),
            workflow_id: payload.workflow_id.clone(),
            workflow_uuid: payload.workflow_uuid,
            task_name: new_task.name.clone(),
            retry_id: new_task.retry_id,
            lead_task: payload.lead_task,
            create_job,
            cleanup_job,
        }),
    )
    .await
}

async fn restart_task(
    ctx: &JobContext,
    workflow_id: &WorkflowId,
    task: &Task,
    total_ttl: Duration,
) -> Result<(), JobError> {
    info!(task = %task.name, retry_id = task.retry_id, "Restarting peer task");
    ctx.logs
        .push_action(
            workflow_id,
            &task.name,
            task.retry_id,
            &ActionToken::Restart,
            total_ttl,
        )
        .await
        .map_err(|err| JobError::Storage(err.to_string()))
}

/// Fires the group barrier once every still-active member arrived.
async fn notify_barrier(
    payload: &UpdateGroup,
    ctx: &JobContext,
    total_ttl: Duration,
) -> Result<(), JobError> {
    let members = ctx
        .logs
        .barrier_members(&payload.workflow_id, &payload.group_name)
        .await
        .map_err(|err| JobError::Storage(err.to_string()))?;
    let tasks = ctx
        .tasks
        .list_latest_by_group(&payload.workflow_id, &payload.group_name)
        .await?;
    let active = tasks
        .iter()
        .filter(|task| !task.status.group_finished())
        .count();
    if members.len() < active {
        return Ok(());
    }
    for member in members {
        let Some(task) = tasks.iter().find(|task| task.name == member) else {
            continue;
        };
        info!(
            workflow_id = %payload.workflow_id,
            task = %member,
            count = active,
            "Barrier met; releasing member"
        );
        ctx.logs
            .push_action(
                &payload.workflow_id,
                &member,
                task.retry_id,
                &ActionToken::Barrier,
                total_ttl,
            )
            .await
            .map_err(|err| JobError::Storage(err.to_string()))?;
    }
    Ok(())
}

/// Enqueues the backend-side cleanup when the group outcome demands one.
async fn schedule_cleanup_job(
    payload: &UpdateGroup,
    ctx: &JobContext,
    workflow: &Workflow,
    group: &TaskGroup,
    backend: Option<&Backend>,
) -> Result<(), JobError> {
    let lead_finished = payload.status.finished() && payload.lead_task;
    let nonlead_triggered_failed =
        payload.status.failed() && !group.spec.ignore_nonlead_status;
    if !(lead_finished || nonlead_triggered_failed || payload.force_cancel) {
        return Ok(());
    }

    match backend {
        None => {
            info!(
                backend = %workflow.backend,
                group = %group.name,
                "Backend not found; skipping pod cleanup and completing group cleanup"
            );
            cleanup_workflow_group(ctx, &workflow.workflow_id, workflow.workflow_uuid, &group.name)
                .await
        }
        Some(_) => {
            let labels = BTreeMap::from([
                (
                    "osmo.workflow_uuid".to_string(),
                    payload.workflow_uuid.to_string(),
                ),
                ("osmo.group_uuid".to_string(), group.group_uuid.to_string()),
            ]);
            let cleanup_specs = ctx.renderer.group_cleanup_specs(&labels);
            let error_log_spec = payload
                .status
                .has_error_logs()
                .then(|| ctx.renderer.error_log_spec(&labels));

            // The deterministic job id makes redundant schedules (lead
            // finish plus non-lead failure, or a redelivered update)
            // collapse on the broker's dedup key.
            jobs::enqueue(
                ctx,
                JobPayload::CleanupGroup(CleanupGroup {
                    backend: workflow.backend.clone(),
                    workflow_id: payload.workflow_id.clone(),
                    workflow_uuid: payload.workflow_uuid,
                    group_name: payload.group_name.clone(),
                    force_delete: payload.force_cancel,
                    cleanup_specs,
                    error_log_spec,
                    max_log_lines: ctx.settings.max_error_log_lines,
                }),
            )
            .await
        }
    }
}

/// If the update permanently failed after the workflow already finished,
/// cleanup must still be scheduled so cluster objects do not leak.
pub async fn handle_failure(payload: &UpdateGroup, ctx: &JobContext) -> Result<(), JobError> {
    let Some(workflow) = ctx.workflows.get(&payload.workflow_id).await? else {
        return Ok(());
    };
    if !workflow.status.finished() {
        return Ok(());
    }
    let Some(group) = ctx
        .groups
        .get(&payload.workflow_id, &payload.group_name)
        .await?
    else {
        return Ok(());
    };
    let backend = ctx.backends.get(&workflow.backend).await?;
    schedule_cleanup_job(payload, ctx, &workflow, &group, backend.as_ref()).await
}
