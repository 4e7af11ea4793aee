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

//! Group and workflow cleanup. A group is cleaned exactly once; the last
//! cleaned group triggers the single CleanupWorkflow job that archives
//! every live stream into object storage.

use crate::broker::streams::{
    error_log_key, task_log_key, workflow_event_key, workflow_log_key, IoType, LogEntry,
};
use crate::jobs::{
    self, CleanupGroup, CleanupWorkflow, JobContext, JobError, JobPayload, JobResult,
    PrepareOutcome,
};
use futures::{StreamExt, TryStreamExt};
use osmo_common::model::{WorkflowId, WorkflowUuid};
use tracing::info;

const WORKFLOW_LOGS_FILE_NAME: &str = "workflow.log";
const WORKFLOW_EVENTS_FILE_NAME: &str = "events.log";
const ERROR_LOGS_SUFFIX: &str = "-error.log";

/// Marks the group cleaned and, when it was the last one, enqueues the
/// workflow cleanup. The CleanupWorkflow job id is deterministic, so a
/// race between the last two groups cannot produce a second effective run.
pub(crate) async fn cleanup_workflow_group(
    ctx: &JobContext,
    workflow_id: &WorkflowId,
    workflow_uuid: WorkflowUuid,
    group_name: &str,
) -> Result<(), JobError> {
    let (_, all_cleaned) = ctx.groups.patch_cleaned_up(workflow_id, group_name).await?;
    if all_cleaned {
        jobs::enqueue(
            ctx,
            JobPayload::CleanupWorkflow(CleanupWorkflow {
                workflow_id: workflow_id.clone(),
                workflow_uuid,
            }),
        )
        .await?;
    }
    Ok(())
}

/// Before the backend deletes the group's cluster objects, drop any error
/// logs a previous run of this job captured.
pub async fn prepare_cleanup_group(
    payload: &mut CleanupGroup,
    ctx: &JobContext,
) -> Result<PrepareOutcome, JobError> {
    let tasks = ctx
        .tasks
        .list_latest_by_group(&payload.workflow_id, &payload.group_name)
        .await?;
    let keys: Vec<String> = tasks
        .iter()
        .map(|task| error_log_key(&payload.workflow_id, &task.task_uuid, task.retry_id))
        .collect();
    ctx.logs
        .delete(&keys)
        .await
        .map_err(|err| JobError::Storage(err.to_string()))?;
    Ok(PrepareOutcome::Ready)
}

pub async fn execute_cleanup_group(
    payload: &CleanupGroup,
    ctx: &JobContext,
) -> Result<JobResult, JobError> {
    cleanup_workflow_group(
        ctx,
        &payload.workflow_id,
        payload.workflow_uuid,
        &payload.group_name,
    )
    .await?;
    Ok(JobResult::success())
}

pub async fn execute_cleanup_workflow(
    payload: &CleanupWorkflow,
    ctx: &JobContext,
) -> Result<JobResult, JobError> {
    let workflow = ctx
        .workflows
        .get(&payload.workflow_id)
        .await?
        .ok_or_else(|| JobError::Invalid(format!("Workflow {} not found", payload.workflow_id)))?;

    let live_log_key = workflow_log_key(&payload.workflow_id);
    if workflow.logs != live_log_key {
        // Already archived by an earlier run.
        return Ok(JobResult::success());
    }

    if workflow.status.failed() {
        let delimiter = "-".repeat(100);
        let base_url = &ctx.settings.service_base_url;
        let status_url = format!("{base_url}/workflows/{}", payload.workflow_id);
        let error_logs_url = format!(
            "{base_url}/api/workflow/{}/error_logs",
            payload.workflow_id
        );
        let summary = format!(
            "\n{delimiter}\nWorkflow terminated abnormally, view task status at:\n{status_url}\n\n\
             View task error logs at:\n{error_logs_url}\n{delimiter}\n"
        );
        ctx.logs
            .append(
                &live_log_key,
                &LogEntry::dump(0, summary),
                Some(ctx.settings.max_log_lines),
            )
            .await
            .map_err(|err| JobError::Storage(err.to_string()))?;
    }

    // Terminate every live stream so attached readers drain and stop.
    let event_key = workflow_event_key(&payload.workflow_uuid);
    let mut stream_keys: Vec<String> = vec![live_log_key.clone(), event_key.clone()];
    let mut migrations: Vec<(String, String)> = vec![
        (live_log_key.clone(), WORKFLOW_LOGS_FILE_NAME.to_string()),
        (event_key.clone(), WORKFLOW_EVENTS_FILE_NAME.to_string()),
    ];

    for group in ctx.groups.list_by_workflow(&payload.workflow_id).await? {
        for task in ctx
            .tasks
            .list_latest_by_group(&payload.workflow_id, &group.name)
            .await?
        {
            for retry_id in 0..=task.retry_id {
                let key = task_log_key(&payload.workflow_id, &task.name, retry_id);
                stream_keys.push(key.clone());
                let file_name = if retry_id > 0 {
                    format!("{}_{retry_id}.log", task.name)
                } else {
                    format!("{}.log", task.name)
                };
                migrations.push((key, file_name));
            }
            if task.status.has_error_logs() {
                let key = error_log_key(&payload.workflow_id, &task.task_uuid, task.retry_id);
                stream_keys.push(key.clone());
                let file_name = if task.retry_id > 0 {
                    format!("{}_{}{ERROR_LOGS_SUFFIX}", task.name, task.retry_id)
                } else {
                    format!("{}{ERROR_LOGS_SUFFIX}", task.name)
                };
                migrations.push((key, file_name));
            }
        }
    }

    for key in &stream_keys {
        ctx.logs
            .append(key, &LogEntry::end_flag(), None)
            .await
            .map_err(|err| JobError::Storage(err.to_string()))?;
    }

    let workflow_id = payload.workflow_id.clone();
    let archived: Vec<(String, String)> = futures::stream::iter(migrations.into_iter().map(
        |(stream_key, file_name)| {
            let workflow_id = workflow_id.clone();
            async move {
                let entries = ctx
                    .logs
                    .read(&stream_key)
                    .await
                    .map_err(|err| JobError::Storage(err.to_string()))?;
                let contents = render_log_file(&entries);
                let path = ctx
                    .storage
                    .put(&workflow_id.0, &file_name, contents.as_bytes())
                    .await
                    .map_err(|err| JobError::Storage(err.to_string()))?;
                Ok::<(String, String), JobError>((file_name, path))
            }
        },
    ))
    .buffer_unordered(ctx.settings.cleanup_concurrency)
    .try_collect()
    .await?;

    let find_path = |name: &str| {
        archived
            .iter()
            .find(|(file_name, _)| file_name == name)
            .map(|(_, path)| path.clone())
            .unwrap_or_default()
    };
    ctx.workflows
        .set_log_locations(
            &payload.workflow_id,
            &find_path(WORKFLOW_LOGS_FILE_NAME),
            &find_path(WORKFLOW_EVENTS_FILE_NAME),
        )
        .await?;

    ctx.logs
        .delete(&stream_keys)
        .await
        .map_err(|err| JobError::Storage(err.to_string()))?;

    info!(
        workflow_id = %payload.workflow_id,
        streams = stream_keys.len(),
        "Archived workflow streams"
    );
    Ok(JobResult::success())
}

fn render_log_file(entries: &[LogEntry]) -> String {
    let mut contents = String::new();
    for entry in entries {
        if entry.io_type == IoType::EndFlag {
            break;
        }
        contents.push_str(&format!("{} {}\n", entry.time.to_rfc3339(), entry.text));
    }
    contents
}
