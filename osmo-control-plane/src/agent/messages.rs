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

//! The agent wire protocol. Text frames carry
//! `{ "type": ..., "uuid": ..., "body": { ... } }`; the body is decoded
//! per type into [`AgentMessage`].

use chrono::{DateTime, Utc};
use osmo_common::model::{JobStatus, TaskGroupStatus, TaskUuid, WorkflowUuid};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Close code sent when a backend name is already claimed by a different
/// cluster uid.
pub const CLOSE_BACKEND_CONFLICT: u16 = 4000;

/// Standard "message too big" close code; the in-flight job must not be
/// retried or it would poison the channel forever.
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Init,
    Logging,
    UpdatePod,
    MonitorPod,
    Resource,
    ResourceUsage,
    DeleteResource,
    NodeHash,
    TaskList,
    Heartbeat,
    Metrics,
    PodConditions,
    PodEvent,
    Ack,
    JobStatus,
    PodLog,
    NodeConditions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid frame: {0}")]
    Frame(String),
    #[error("Invalid {message_type} body: {error}")]
    Body {
        message_type: MessageType,
        error: String,
    },
}

impl Frame {
    pub fn new(
        message_type: MessageType,
        body: &impl Serialize,
    ) -> Result<Frame, ProtocolError> {
        Ok(Frame {
            message_type,
            uuid: None,
            body: serde_json::to_value(body).map_err(|err| ProtocolError::Body {
                message_type,
                error: err.to_string(),
            })?,
        })
    }

    pub fn parse(raw: &str) -> Result<Frame, ProtocolError> {
        serde_json::from_str(raw).map_err(|err| ProtocolError::Frame(err.to_string()))
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn decode(&self) -> Result<AgentMessage, ProtocolError> {
        fn parse<T: serde::de::DeserializeOwned>(frame: &Frame) -> Result<T, ProtocolError> {
            serde_json::from_value(frame.body.clone()).map_err(|err| ProtocolError::Body {
                message_type: frame.message_type,
                error: err.to_string(),
            })
        }
        Ok(match self.message_type {
            MessageType::Init => AgentMessage::Init(parse(self)?),
            MessageType::Logging => AgentMessage::Logging(parse(self)?),
            MessageType::UpdatePod => AgentMessage::UpdatePod(parse(self)?),
            MessageType::MonitorPod => AgentMessage::MonitorPod(parse(self)?),
            MessageType::Resource => AgentMessage::Resource(parse(self)?),
            MessageType::ResourceUsage => AgentMessage::ResourceUsage(parse(self)?),
            MessageType::DeleteResource => AgentMessage::DeleteResource(parse(self)?),
            MessageType::NodeHash => AgentMessage::NodeHash(parse(self)?),
            MessageType::TaskList => AgentMessage::TaskList(parse(self)?),
            MessageType::Heartbeat => AgentMessage::Heartbeat(parse(self)?),
            MessageType::Metrics => AgentMessage::Metrics(parse(self)?),
            MessageType::PodConditions => AgentMessage::PodConditions(parse(self)?),
            MessageType::PodEvent => AgentMessage::PodEvent(parse(self)?),
            MessageType::Ack => AgentMessage::Ack(parse(self)?),
            MessageType::JobStatus => AgentMessage::JobStatus(parse(self)?),
            MessageType::PodLog => AgentMessage::PodLog(parse(self)?),
            MessageType::NodeConditions => AgentMessage::NodeConditions(parse(self)?),
        })
    }

    pub fn ack(uuid: &Option<String>) -> Frame {
        Frame {
            message_type: MessageType::Ack,
            uuid: None,
            body: serde_json::json!(AckBody {
                uuid: uuid.clone().unwrap_or_default()
            }),
        }
    }

    pub fn heartbeat() -> Frame {
        Frame {
            message_type: MessageType::Heartbeat,
            uuid: None,
            body: serde_json::json!(HeartbeatBody { time: Utc::now() }),
        }
    }
}

#[derive(Clone, Debug)]
pub enum AgentMessage {
    Init(InitBody),
    Logging(LoggingBody),
    UpdatePod(UpdatePodBody),
    MonitorPod(MonitorPodBody),
    Resource(ResourceBody),
    ResourceUsage(ResourceUsageBody),
    DeleteResource(DeleteResourceBody),
    NodeHash(NodeHashBody),
    TaskList(TaskListBody),
    Heartbeat(HeartbeatBody),
    Metrics(MetricsBody),
    PodConditions(PodConditionsBody),
    PodEvent(PodEventBody),
    Ack(AckBody),
    JobStatus(JobStatusBody),
    PodLog(PodLogBody),
    NodeConditions(NodeConditionsBody),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitBody {
    pub k8s_uid: String,
    pub k8s_namespace: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub node_condition_prefix: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingBody {
    pub level: LogLevel,
    pub text: String,
    #[serde(default)]
    pub workflow_uuid: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdatePodBody {
    pub workflow_uuid: WorkflowUuid,
    pub task_uuid: TaskUuid,
    pub retry_id: i32,
    pub status: TaskGroupStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub pod_ip: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorPodBody {
    pub workflow_uuid: WorkflowUuid,
    pub task_uuid: TaskUuid,
    pub retry_id: i32,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceBody {
    pub hostname: String,
    pub available: bool,
    #[serde(default)]
    pub allocatable_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub label_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Value>,
    #[serde(default)]
    pub conditions: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceUsageBody {
    pub hostname: String,
    #[serde(default)]
    pub usage_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub non_workflow_usage_fields: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteResourceBody {
    pub resource: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeHashBody {
    pub node_hashes: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskListBody {
    #[serde(default)]
    pub task_list: Vec<TaskUuid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatBody {
    pub time: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricsType {
    Counter,
    Histogram,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsBody {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub metrics_type: MetricsType,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PodConditionsBody {
    pub workflow_uuid: WorkflowUuid,
    pub task_uuid: TaskUuid,
    pub retry_id: i32,
    pub conditions: Vec<PodCondition>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PodEventBody {
    pub pod_name: String,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AckBody {
    pub uuid: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobStatusBody {
    pub status: JobStatus,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PodLogBody {
    pub task: TaskUuid,
    pub retry_id: i32,
    pub text: String,
    #[serde(default)]
    pub mask: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConditionsBody {
    #[serde(default)]
    pub available_conditions: Vec<String>,
    #[serde(default)]
    pub ignore_conditions: Vec<String>,
}

/// Filters the pod condition stream down to transitions worth recording.
pub fn keep_pod_condition(condition: &PodCondition) -> bool {
    if condition.condition_type == "ContainersReady" {
        return false;
    }
    if matches!(condition.condition_type.as_str(), "Initialized" | "Ready") && condition.status {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;
    use uuid::Uuid;

    #[test]
    fn frame_round_trip() {
        let frame = Frame::new(
            MessageType::JobStatus,
            &JobStatusBody {
                status: JobStatus::Success,
                message: None,
            },
        )
        .unwrap();
        let raw = frame.encode();
        let parsed = Frame::parse(&raw).unwrap();
        assert_eq!(parsed.message_type, MessageType::JobStatus);
        match parsed.decode().unwrap() {
            AgentMessage::JobStatus(body) => assert_eq!(body.status, JobStatus::Success),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn update_pod_body_parses_agent_json() {
        let raw = serde_json::json!({
            "type": "UPDATE_POD",
            "uuid": "abc",
            "body": {
                "workflow_uuid": Uuid::nil(),
                "task_uuid": Uuid::nil(),
                "retry_id": 0,
                "status": "RUNNING",
                "node": "node-1",
            }
        });
        let frame: Frame = serde_json::from_value(raw).unwrap();
        match frame.decode().unwrap() {
            AgentMessage::UpdatePod(body) => {
                assert_eq!(body.status, TaskGroupStatus::Running);
                assert_eq!(body.node.as_deref(), Some("node-1"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn condition_filter() {
        let condition = |condition_type: &str, status: bool| PodCondition {
            condition_type: condition_type.to_string(),
            status,
            reason: None,
            message: None,
            timestamp: Utc::now(),
        };
        assert!(!keep_pod_condition(&condition("ContainersReady", true)));
        assert!(!keep_pod_condition(&condition("Ready", true)));
        assert!(keep_pod_condition(&condition("Ready", false)));
        assert!(keep_pod_condition(&condition("PodScheduled", false)));
    }
}
