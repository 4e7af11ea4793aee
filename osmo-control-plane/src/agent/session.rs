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

//! Worker channel: pulls jobs off the backend's queue and drives them
//! through the agent, one at a time. Disconnect requeues the in-flight
//! job; a "message too big" close (1009) fails it permanently instead,
//! because retrying would poison the channel forever.

use crate::agent::messages::{
    AgentMessage, Frame, PodLogBody, CLOSE_MESSAGE_TOO_BIG,
};
use crate::agent::{log_backend_message, send_frame, AgentError, AgentState};
use crate::broker::streams::{error_log_key, LogEntry};
use crate::broker::{Delivery, UNIQUE_JOB_TTL};
use crate::jobs::{self, Job, JobPayload, JobResult, PrepareOutcome, QueueName};
use crate::metrics;
use crate::model::Workflow;
use crate::secrets::mask_values;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use osmo_common::model::{JobStatus, TaskUuid};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

const DEQUEUE_POLL: Duration = Duration::from_secs(5);

pub async fn handle_worker(
    ws: WebSocketUpgrade,
    Path(backend): Path<String>,
    State(state): State<Arc<AgentState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, backend, state))
}

struct CurrentJob {
    delivery: Delivery,
    job: Job,
    workflow: Option<Workflow>,
    started: Instant,
    /// Lazily fetched per task uuid for POD_LOG masking.
    masked_task: Option<TaskUuid>,
    masked_values: BTreeSet<String>,
}

struct WorkerSession {
    state: Arc<AgentState>,
    backend: String,
    queue: QueueName,
    consumer: String,
    current: Option<CurrentJob>,
}

async fn handle_socket(socket: WebSocket, backend: String, state: Arc<AgentState>) {
    info!(backend = %backend, "Opening worker websocket connection");
    let (mut sender, mut receiver) = socket.split();

    match crate::agent::await_init(
        &mut receiver,
        &mut sender,
        "backend_worker",
        &backend,
        &state.ctx,
    )
    .await
    {
        Ok(Some(_)) => {}
        Ok(None) => {
            info!(backend = %backend, "Worker channel closed before INIT completed");
            return;
        }
        Err(err) => {
            error!(backend = %backend, error = %err, "Worker INIT failed");
            return;
        }
    }

    let mut session = WorkerSession {
        queue: QueueName::Backend(backend.clone()),
        consumer: format!("worker-{backend}"),
        backend,
        state,
        current: None,
    };

    // Jobs a previous session died with become visible again here.
    if let Err(err) = session
        .state
        .ctx
        .broker
        .requeue_orphans(&session.queue, &session.consumer)
        .await
    {
        error!(backend = %session.backend, error = %err, "Failed to requeue orphaned jobs");
    }

    let mut heartbeat = tokio::time::interval(session.state.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // One job is in flight at a time: while `current` is set, only the
    // socket and the heartbeat are polled.
    enum Event {
        Heartbeat,
        Delivery(Delivery),
        Idle,
        BrokerFailed(crate::broker::BrokerError),
        Socket(Option<Result<Message, axum::Error>>),
    }

    let disconnect = loop {
        let event = if session.current.is_none() {
            tokio::select! {
                _ = heartbeat.tick() => Event::Heartbeat,
                delivery = session.state.ctx.broker.dequeue(&session.queue, &session.consumer, DEQUEUE_POLL) => {
                    match delivery {
                        Ok(Some(delivery)) => Event::Delivery(delivery),
                        Ok(None) => Event::Idle,
                        Err(err) => Event::BrokerFailed(err),
                    }
                }
                message = receiver.next() => Event::Socket(message),
            }
        } else {
            tokio::select! {
                _ = heartbeat.tick() => Event::Heartbeat,
                message = receiver.next() => Event::Socket(message),
            }
        };

        match event {
            Event::Idle => {}
            Event::Heartbeat => {
                if send_frame(&mut sender, &Frame::heartbeat()).await.is_err() {
                    break Disconnect::Requeue;
                }
            }
            Event::Delivery(delivery) => {
                if let Err(err) = session.handle_job(&mut sender, delivery).await {
                    error!(backend = %session.backend, error = %err, "Job dispatch failed");
                    break Disconnect::Requeue;
                }
            }
            Event::BrokerFailed(err) => {
                error!(backend = %session.backend, error = %err, "Dequeue failed; backing off");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Event::Socket(Some(Ok(Message::Text(text)))) => {
                if let Err(err) = session.handle_message(&text).await {
                    error!(backend = %session.backend, error = %err, "Worker message handling failed");
                    break Disconnect::Requeue;
                }
            }
            Event::Socket(Some(Ok(Message::Close(frame)))) => {
                let too_big = frame
                    .map(|frame| frame.code == CLOSE_MESSAGE_TOO_BIG)
                    .unwrap_or(false);
                break if too_big {
                    Disconnect::TooBig
                } else {
                    Disconnect::Requeue
                };
            }
            Event::Socket(Some(Ok(_))) => {}
            Event::Socket(Some(Err(err))) => {
                info!(backend = %session.backend, error = %err, "Worker websocket errored");
                break Disconnect::Requeue;
            }
            Event::Socket(None) => break Disconnect::Requeue,
        }
    };

    session.finish_on_disconnect(disconnect).await;
    info!(backend = %session.backend, "Closing worker websocket connection");
}

enum Disconnect {
    /// Connection lost; the in-flight job is redelivered later.
    Requeue,
    /// Close code 1009: the job's payload can never fit, fail it for good.
    TooBig,
}

impl WorkerSession {
    async fn handle_job(
        &mut self,
        sender: &mut crate::agent::WsSender,
        delivery: Delivery,
    ) -> Result<(), AgentError> {
        let mut job = delivery.job.clone();
        let ctx = &self.state.ctx;
        info!(
            backend = %self.backend,
            job_id = %job.job_id,
            job_type = %job.job_type(),
            "Starting job from the queue"
        );

        let accepted = ctx
            .broker
            .dedup(&job.job_id, &job.job_uuid, UNIQUE_JOB_TTL)
            .await?;
        if !accepted {
            info!(job_id = %job.job_id, "Skipping job because it is a duplicate");
            ctx.broker.ack(&delivery).await?;
            return Ok(());
        }

        let retry_count = ctx.broker.retry_count(&job.job_id).await?;
        if retry_count > ctx.settings.max_retry_per_job {
            let message = format!(
                "Job {} failed after retrying {} times",
                job.job_id, ctx.settings.max_retry_per_job
            );
            info!(job_id = %job.job_id, "{message}");
            jobs::handle_failure(&job, ctx, &message).await;
            ctx.broker.ack(&delivery).await?;
            return Ok(());
        }

        let workflow = match job.payload.workflow_uuid() {
            Some(_) => {
                let workflow_id = match &job.payload {
                    JobPayload::CreateGroup(payload) => Some(payload.workflow_id.clone()),
                    JobPayload::CleanupGroup(payload) => Some(payload.workflow_id.clone()),
                    JobPayload::RescheduleTask(payload) => Some(payload.workflow_id.clone()),
                    _ => None,
                };
                match workflow_id {
                    Some(workflow_id) => ctx.workflows.get(&workflow_id).await?,
                    None => None,
                }
            }
            None => None,
        };

        match jobs::prepare_execute(&mut job, ctx).await {
            Ok(PrepareOutcome::Ready) => {}
            Ok(PrepareOutcome::Abort(message)) => {
                info!(job_id = %job.job_id, "{message}");
                ctx.broker.ack(&delivery).await?;
                return Ok(());
            }
            Err(err) => {
                let message = err.to_string();
                error!(job_id = %job.job_id, error = %message, "Job preparation failed");
                jobs::handle_failure(&job, ctx, &message).await;
                ctx.broker.ack(&delivery).await?;
                return Ok(());
            }
        }

        let payload = serde_json::to_string(&job)
            .map_err(|err| AgentError::Socket(err.to_string()))?;
        sender
            .send(Message::Text(payload))
            .await
            .map_err(AgentError::from)?;

        self.current = Some(CurrentJob {
            delivery,
            job,
            workflow,
            started: Instant::now(),
            masked_task: None,
            masked_values: BTreeSet::new(),
        });
        Ok(())
    }

    async fn handle_message(&mut self, text: &str) -> Result<(), AgentError> {
        let frame = Frame::parse(text)?;
        match frame.decode()? {
            AgentMessage::Logging(body) => {
                log_backend_message("backend_worker", &self.backend, &body);
                Ok(())
            }
            AgentMessage::PodLog(body) => self.handle_pod_log(body).await,
            AgentMessage::JobStatus(body) => {
                let mut result = JobResult {
                    status: body.status,
                    message: body.message.unwrap_or_default(),
                };
                if let Some(current) = &self.current {
                    if result.status == JobStatus::Success {
                        result = match jobs::execute(&current.job, &self.state.ctx).await {
                            Ok(result) => result,
                            Err(err) => {
                                error!(
                                    job_id = %current.job.job_id,
                                    error = %err,
                                    "Frontend execute failed after backend success"
                                );
                                JobResult::no_retry(format!(
                                    "Got exception when running frontend execute: {err}"
                                ))
                            }
                        };
                    }
                }
                self.finish_current(result).await
            }
            other => {
                error!(backend = %self.backend, "Invalid worker message type: {other:?}");
                Ok(())
            }
        }
    }

    /// Error-log capture from the backend during cleanup jobs. Known task
    /// secrets are scrubbed before the text is stored anywhere.
    async fn handle_pod_log(&mut self, mut body: PodLogBody) -> Result<(), AgentError> {
        let ctx = self.state.ctx.clone();
        let Some(current) = &mut self.current else {
            error!(backend = %self.backend, "POD_LOG received outside of a job");
            return Ok(());
        };
        if !matches!(
            current.job.payload,
            JobPayload::CleanupGroup(_) | JobPayload::RescheduleTask(_)
        ) {
            return Ok(());
        }
        let Some(workflow) = current.workflow.clone() else {
            return Ok(());
        };

        if body.mask {
            if current.masked_task != Some(body.task) {
                current.masked_task = Some(body.task);
                current.masked_values.clear();
                if let Some(info) = ctx
                    .tasks
                    .get_info_by_uuid(&workflow.workflow_uuid, &body.task, body.retry_id)
                    .await?
                {
                    if let Some(group) = ctx
                        .groups
                        .get(&workflow.workflow_id, &info.task.group_name)
                        .await?
                    {
                        if let Some(spec) = group.spec.task(&info.task.name) {
                            for credential in &spec.credentials {
                                let values = ctx
                                    .secrets
                                    .resolve(&workflow.user, credential)
                                    .await
                                    .unwrap_or_default();
                                current.masked_values.extend(values);
                            }
                        }
                    }
                }
            }
            body.text = mask_values(&body.text, &current.masked_values);
        }

        ctx.logs
            .append(
                &error_log_key(&workflow.workflow_id, &body.task, body.retry_id),
                &LogEntry {
                    time: chrono::Utc::now(),
                    io_type: crate::broker::streams::IoType::Dump,
                    source: "OSMO".to_string(),
                    retry_id: body.retry_id,
                    text: body.text,
                },
                Some(ctx.settings.max_log_lines),
            )
            .await?;
        Ok(())
    }

    async fn finish_current(&mut self, result: JobResult) -> Result<(), AgentError> {
        let Some(current) = self.current.take() else {
            return Ok(());
        };
        let ctx = &self.state.ctx;

        match result.status {
            JobStatus::Success => ctx.broker.ack(&current.delivery).await?,
            JobStatus::FailedRetry => ctx.broker.reject(&current.delivery, true).await?,
            JobStatus::FailedNoRetry => {
                jobs::handle_failure(&current.job, ctx, &result.message).await;
                ctx.broker.ack(&current.delivery).await?;
            }
        }

        metrics::record_job(
            current.job.job_type(),
            &format!("{:?}", result.status),
            current.started.elapsed(),
        );
        info!(
            job_id = %current.job.job_id,
            job_type = %current.job.job_type(),
            status = ?result.status,
            "Completed job"
        );
        Ok(())
    }

    async fn finish_on_disconnect(&mut self, disconnect: Disconnect) {
        let result = match disconnect {
            Disconnect::Requeue => JobResult::retry("Worker channel disconnected"),
            Disconnect::TooBig => {
                if let Some(current) = &self.current {
                    error!(
                        job_id = %current.job.job_id,
                        "Disconnected because message is too big, set as FAILED_NO_RETRY"
                    );
                }
                JobResult::no_retry("Job payload exceeded the websocket message limit")
            }
        };
        if let Err(err) = self.finish_current(result).await {
            error!(backend = %self.backend, error = %err, "Failed to settle in-flight job");
        }
    }
}
