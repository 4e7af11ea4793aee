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

//! The backend agent endpoints. Each backend holds two long-lived
//! websocket sessions: a listener channel carrying telemetry into the
//! control plane and a worker channel carrying jobs out to the cluster.

pub mod listener;
pub mod messages;
pub mod session;

use crate::broker::streams::LogStoreError;
use crate::broker::BrokerError;
use crate::jobs::{JobContext, JobError};
use crate::model::Backend;
use crate::repo::backend::BackendRegistration;
use crate::repo::RepoError;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::routing::get;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use messages::{AgentMessage, Frame, LogLevel, LoggingBody, CLOSE_BACKEND_CONFLICT};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("{0}")]
    Protocol(#[from] messages::ProtocolError),
    #[error("{0}")]
    Repo(#[from] RepoError),
    #[error("{0}")]
    Broker(#[from] BrokerError),
    #[error("{0}")]
    LogStore(#[from] LogStoreError),
    #[error("{0}")]
    Job(#[from] JobError),
    #[error("Websocket error: {0}")]
    Socket(String),
}

impl From<axum::Error> for AgentError {
    fn from(error: axum::Error) -> Self {
        AgentError::Socket(error.to_string())
    }
}

pub struct AgentState {
    pub ctx: JobContext,
    pub config: AgentConfig,
}

pub fn router(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/agent/listener/:backend", get(listener::handle_listener))
        .route("/agent/worker/:backend", get(session::handle_worker))
        .with_state(state)
}

pub(crate) type WsSender = SplitSink<WebSocket, Message>;
pub(crate) type WsReceiver = SplitStream<WebSocket>;

pub(crate) async fn send_frame(sender: &mut WsSender, frame: &Frame) -> Result<(), AgentError> {
    sender
        .send(Message::Text(frame.encode()))
        .await
        .map_err(AgentError::from)
}

pub(crate) fn log_backend_message(channel: &str, backend: &str, body: &LoggingBody) {
    let workflow_uuid = body.workflow_uuid.clone().unwrap_or_default();
    match body.level {
        LogLevel::Debug => debug!(channel, backend, workflow_uuid, "{}", body.text),
        LogLevel::Info => info!(channel, backend, workflow_uuid, "{}", body.text),
        LogLevel::Warning => warn!(channel, backend, workflow_uuid, "{}", body.text),
        LogLevel::Error => error!(channel, backend, workflow_uuid, "{}", body.text),
    }
}

/// Drives the session until the mandatory INIT frame arrives and the
/// backend row is registered or refreshed. Returns `None` when the
/// connection closed or the registration was rejected.
pub(crate) async fn await_init(
    receiver: &mut WsReceiver,
    sender: &mut WsSender,
    channel: &str,
    backend_name: &str,
    ctx: &JobContext,
) -> Result<Option<Backend>, AgentError> {
    while let Some(message) = receiver.next().await {
        let message = message?;
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return Ok(None),
            _ => continue,
        };
        let frame = Frame::parse(&text)?;
        match frame.decode()? {
            AgentMessage::Logging(body) => log_backend_message(channel, backend_name, &body),
            AgentMessage::Init(body) => {
                let registration = BackendRegistration {
                    name: backend_name.to_string(),
                    k8s_uid: body.k8s_uid,
                    k8s_namespace: body.k8s_namespace,
                    version: body.version,
                    node_condition_prefix: body.node_condition_prefix,
                };
                match ctx.backends.register_init(&registration).await {
                    Ok(backend) => return Ok(Some(backend)),
                    Err(RepoError::Conflict(reason)) => {
                        warn!(backend = backend_name, "{reason}");
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_BACKEND_CONFLICT,
                                reason: Cow::from(reason),
                            })))
                            .await;
                        return Ok(None);
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            other => {
                error!(
                    backend = backend_name,
                    "Unexpected message before INIT: {other:?}"
                );
                return Ok(None);
            }
        }
    }
    Ok(None)
}
