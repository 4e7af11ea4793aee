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

//! Listener channel: the backend agent streams cluster telemetry in,
//! each frame is dispatched to a bounded-work handler and acknowledged.

use crate::agent::messages::{
    keep_pod_condition, AgentMessage, Frame, MessageType, MetricsBody, MetricsType,
    MonitorPodBody, NodeConditionsBody, PodConditionsBody, PodEventBody, UpdatePodBody,
};
use crate::agent::{log_backend_message, send_frame, AgentError, AgentState};
use crate::broker::streams::{workflow_event_key, LogEntry, MAX_LOG_TTL};
use crate::jobs::{self, JobPayload, UpdateGroup};
use crate::metrics;
use crate::model::TaskInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::StreamExt;
use osmo_common::model::{ExitCode, TaskGroupStatus};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info};

pub async fn handle_listener(
    ws: WebSocketUpgrade,
    Path(backend): Path<String>,
    State(state): State<Arc<AgentState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, backend, state))
}

async fn handle_socket(socket: WebSocket, backend: String, state: Arc<AgentState>) {
    info!(backend = %backend, "Opening listener websocket connection");
    let (mut sender, mut receiver) = socket.split();

    let registered = match crate::agent::await_init(
        &mut receiver,
        &mut sender,
        "backend_listener",
        &backend,
        &state.ctx,
    )
    .await
    {
        Ok(Some(registered)) => registered,
        Ok(None) => {
            info!(backend = %backend, "Listener closed before INIT completed");
            return;
        }
        Err(err) => {
            error!(backend = %backend, error = %err, "Listener INIT failed");
            return;
        }
    };

    // Push the node-condition configuration right after registration so
    // the agent knows which conditions to report and which to ignore.
    let node_conditions = NodeConditionsBody {
        available_conditions: registered.node_conditions.additional_node_conditions.clone(),
        ignore_conditions: registered.node_conditions.ignore_node_conditions.clone(),
    };
    if let Ok(frame) = Frame::new(MessageType::NodeConditions, &node_conditions) {
        if send_frame(&mut sender, &frame).await.is_err() {
            return;
        }
    }

    // Frames land in a bounded queue first; when handlers fall behind the
    // reader stops pulling and the websocket itself backpressures.
    let (frame_tx, mut frame_rx) = mpsc::channel::<String>(state.config.queue_size);
    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => {
                    if frame_tx.send(text).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.reset();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if send_frame(&mut sender, &Frame::heartbeat()).await.is_err() {
                    break;
                }
            }
            text = frame_rx.recv() => {
                let Some(text) = text else { break };
                let frame = match Frame::parse(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        error!(backend = %backend, error = %err, "Invalid listener frame");
                        break;
                    }
                };
                let started = Instant::now();
                let outcome = dispatch(&frame, &backend, &state).await;
                metrics::record_backend_event(
                    &frame.message_type.to_string(),
                    &backend,
                    started.elapsed(),
                );
                // The agent advances its cursor on the ack even when the
                // handler failed; a failed handler closes the session so
                // the agent replays from its cursor on reconnect.
                let ack_failed = send_frame(&mut sender, &Frame::ack(&frame.uuid)).await.is_err();
                if let Err(err) = outcome {
                    error!(
                        backend = %backend,
                        message_type = %frame.message_type,
                        error = %err,
                        "Listener handler failed"
                    );
                    break;
                }
                if ack_failed {
                    break;
                }
            }
        }
    }

    reader.abort();
    info!(backend = %backend, "Closing listener websocket connection");
}

async fn dispatch(frame: &Frame, backend: &str, state: &AgentState) -> Result<(), AgentError> {
    let ctx = &state.ctx;
    match frame.decode()? {
        AgentMessage::Logging(body) => {
            log_backend_message("backend_listener", backend, &body);
            Ok(())
        }
        AgentMessage::Init(_) => {
            // Re-INIT after a reconnect; registration already happened in
            // the handshake and repeating it is harmless.
            Ok(())
        }
        AgentMessage::UpdatePod(body) => update_pod(ctx, body).await,
        AgentMessage::MonitorPod(body) => monitor_pod(ctx, body).await,
        AgentMessage::Resource(body) => {
            let node = crate::model::ResourceNode {
                name: body.hostname,
                backend: backend.to_string(),
                available: body.available,
                allocatable: body.allocatable_fields,
                labels: body.label_fields,
                usage: Default::default(),
                non_workflow_usage: Default::default(),
                taints: body.taints,
                conditions: body.conditions,
            };
            ctx.resources.upsert(&node).await?;
            Ok(())
        }
        AgentMessage::ResourceUsage(body) => {
            ctx.resources
                .update_usage(
                    &body.hostname,
                    backend,
                    &body.usage_fields,
                    &body.non_workflow_usage_fields,
                )
                .await?;
            Ok(())
        }
        AgentMessage::DeleteResource(body) => {
            ctx.resources.delete(&body.resource, backend).await?;
            let stranded = ctx.tasks.list_on_node(backend, &body.resource).await?;
            fail_tasks(
                ctx,
                stranded,
                "Node got removed from the cluster while the pod was on it",
            )
            .await
        }
        AgentMessage::NodeHash(body) => {
            let removed = ctx
                .resources
                .delete_stale(backend, &body.node_hashes)
                .await?;
            if removed > 0 {
                info!(backend, removed, "Reconciled stale nodes");
            }
            Ok(())
        }
        AgentMessage::TaskList(body) => {
            let orphans = ctx
                .tasks
                .list_backend_orphans(backend, &body.task_list)
                .await?;
            fail_tasks(ctx, orphans, "Pod was deleted while backend agents were down").await
        }
        AgentMessage::Heartbeat(body) => {
            ctx.backends.update_heartbeat(backend, body.time).await?;
            Ok(())
        }
        AgentMessage::Metrics(body) => {
            forward_metric(backend, &body);
            Ok(())
        }
        AgentMessage::PodConditions(body) => pod_conditions(ctx, state, body).await,
        AgentMessage::PodEvent(body) => pod_event(ctx, state, body).await,
        other => {
            error!(backend, "Ignoring invalid backend listener message: {other:?}");
            Ok(())
        }
    }
}

async fn update_pod(ctx: &crate::jobs::JobContext, body: UpdatePodBody) -> Result<(), AgentError> {
    let info = ctx
        .tasks
        .get_info_by_uuid(&body.workflow_uuid, &body.task_uuid, body.retry_id)
        .await?
        .ok_or_else(|| {
            crate::repo::RepoError::NotFound(format!(
                "Task {} retry {} of workflow {}",
                body.task_uuid, body.retry_id, body.workflow_uuid
            ))
        })?;

    if let Some(node) = &body.node {
        if info.task.node_name.is_none() {
            ctx.tasks.set_node_name(&info.task.task_db_key, node).await?;
        }
    }
    if let Some(pod_ip) = &body.pod_ip {
        if info.task.pod_ip.is_none() {
            ctx.tasks.set_pod_ip(&info.task.task_db_key, pod_ip).await?;
        }
    }

    jobs::enqueue_update_group(
        ctx,
        UpdateGroup {
            workflow_id: info.task.workflow_id.clone(),
            workflow_uuid: body.workflow_uuid,
            group_name: info.task.group_name.clone(),
            task_name: Some(info.task.name.clone()),
            retry_id: Some(body.retry_id),
            status: body.status,
            message: body.message,
            user: info.submitted_by,
            exit_code: body.exit_code,
            force_cancel: false,
            lead_task: info.task.lead,
        },
    )
    .await?;
    Ok(())
}

/// The agent noticed a pod stuck before start; if it is still stuck when
/// the delayed update fires, the task fails with FAILED_START_TIMEOUT.
async fn monitor_pod(ctx: &crate::jobs::JobContext, body: MonitorPodBody) -> Result<(), AgentError> {
    let info = ctx
        .tasks
        .get_info_by_uuid(&body.workflow_uuid, &body.task_uuid, body.retry_id)
        .await?
        .ok_or_else(|| {
            crate::repo::RepoError::NotFound(format!(
                "Task {} retry {} of workflow {}",
                body.task_uuid, body.retry_id, body.workflow_uuid
            ))
        })?;

    ctx.broker
        .enqueue_delayed(
            &crate::jobs::Job::new(JobPayload::UpdateGroup(UpdateGroup {
                workflow_id: info.task.workflow_id.clone(),
                workflow_uuid: body.workflow_uuid,
                group_name: info.task.group_name.clone(),
                task_name: Some(info.task.name.clone()),
                retry_id: Some(body.retry_id),
                status: TaskGroupStatus::FailedStartTimeout,
                message: body.message,
                user: info.submitted_by,
                exit_code: Some(ExitCode::FailedStartTimeout.code()),
                force_cancel: false,
                lead_task: info.task.lead,
            })),
            ctx.settings.max_pod_restart_limit,
        )
        .await?;
    Ok(())
}

async fn fail_tasks(
    ctx: &crate::jobs::JobContext,
    tasks: Vec<TaskInfo>,
    message: &str,
) -> Result<(), AgentError> {
    for info in tasks {
        jobs::enqueue_update_group(
            ctx,
            UpdateGroup {
                workflow_id: info.task.workflow_id.clone(),
                workflow_uuid: info.task.workflow_uuid,
                group_name: info.task.group_name.clone(),
                task_name: Some(info.task.name.clone()),
                retry_id: Some(info.task.retry_id),
                status: TaskGroupStatus::FailedBackendError,
                message: message.to_string(),
                user: info.submitted_by,
                exit_code: Some(ExitCode::FailedBackendError.code()),
                force_cancel: false,
                lead_task: info.task.lead,
            },
        )
        .await?;
    }
    Ok(())
}

fn forward_metric(backend: &str, body: &MetricsBody) {
    match body.metrics_type {
        MetricsType::Counter | MetricsType::Histogram => {
            metrics::AGENT_FORWARDED_METRICS
                .with_label_values(&[&body.name, backend])
                .inc_by(body.value);
        }
    }
}

async fn pod_conditions(
    ctx: &crate::jobs::JobContext,
    state: &AgentState,
    body: PodConditionsBody,
) -> Result<(), AgentError> {
    let info = ctx
        .tasks
        .get_info_by_uuid(&body.workflow_uuid, &body.task_uuid, body.retry_id)
        .await?
        .ok_or_else(|| {
            crate::repo::RepoError::NotFound(format!(
                "Task {} retry {} of workflow {}",
                body.task_uuid, body.retry_id, body.workflow_uuid
            ))
        })?;
    let task_name = &info.task.name;
    let token_key = format!(
        "pod_conditions:{}:{task_name}:latest_timestamp",
        body.workflow_uuid
    );
    let event_key = workflow_event_key(&body.workflow_uuid);

    for condition in &body.conditions {
        if !keep_pod_condition(condition) {
            continue;
        }
        let latest = ctx.logs.latest_timestamp(&token_key).await?.unwrap_or(0.0);
        let timestamp = condition.timestamp.timestamp_millis() as f64 / 1000.0;
        if timestamp <= latest {
            continue;
        }

        let retry_suffix = if body.retry_id > 0 {
            format!(" retry-{}", body.retry_id)
        } else {
            String::new()
        };
        let mut line = format!(
            "{} [{task_name}{retry_suffix}] {}: {}",
            condition.timestamp, condition.condition_type, condition.status
        );
        if let (Some(reason), Some(message)) = (&condition.reason, &condition.message) {
            line.push_str(&format!(", Reason: {reason}, Message: {message}"));
        }
        ctx.logs
            .append(
                &event_key,
                &LogEntry::dump(body.retry_id, line),
                Some(state.ctx.settings.max_event_log_lines),
            )
            .await?;
        ctx.logs
            .set_latest_timestamp(&token_key, timestamp, MAX_LOG_TTL)
            .await?;
    }
    Ok(())
}

async fn pod_event(
    ctx: &crate::jobs::JobContext,
    state: &AgentState,
    body: PodEventBody,
) -> Result<(), AgentError> {
    let rows = ctx.tasks.find_by_pod_name(&body.pod_name).await?;
    let Some(info) = rows.first() else {
        tracing::warn!(pod_name = %body.pod_name, "No tasks found for pod event");
        return Ok(());
    };
    let task_name = info.task.name.clone();
    let workflow_uuid = info.task.workflow_uuid;
    let retry_id = rows.len() as i32 - 1;

    let token_key = format!("pod_event:{workflow_uuid}:{task_name}:latest_timestamp");
    let latest = ctx.logs.latest_timestamp(&token_key).await?.unwrap_or(0.0);
    let timestamp = body.timestamp.timestamp_millis() as f64 / 1000.0;
    if timestamp <= latest {
        return Ok(());
    }

    let line = format!(
        "{} [{task_name}] {}: {}",
        body.timestamp, body.reason, body.message
    );
    ctx.logs
        .append(
            &workflow_event_key(&workflow_uuid),
            &LogEntry::dump(retry_id, line),
            Some(state.ctx.settings.max_event_log_lines),
        )
        .await?;
    ctx.logs
        .set_latest_timestamp(&token_key, timestamp, MAX_LOG_TTL)
        .await?;
    Ok(())
}
