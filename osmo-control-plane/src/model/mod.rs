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

pub mod spec;
pub mod state;

use chrono::{DateTime, Utc};
use osmo_common::model::{
    GroupUuid, TaskDbKey, TaskGroupStatus, TaskUuid, WorkflowId, WorkflowPriority, WorkflowStatus,
    WorkflowUuid,
};
use self::spec::GroupSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct Workflow {
    pub workflow_id: WorkflowId,
    pub workflow_uuid: WorkflowUuid,
    pub user: String,
    pub pool: String,
    pub backend: String,
    pub priority: WorkflowPriority,
    pub status: WorkflowStatus,
    pub submit_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exec_timeout: Option<Duration>,
    pub queue_timeout: Option<Duration>,
    /// Location of the workflow log stream: a live stream while the
    /// workflow runs, an object-storage path once archived.
    pub logs: String,
    pub events: String,
    pub failure_message: Option<String>,
    pub cancelled_by: Option<String>,
    pub parent_workflow_id: Option<WorkflowId>,
    pub app_uuid: Option<Uuid>,
    pub app_version: Option<i32>,
    pub plugins: serde_json::Value,
}

#[derive(Clone, Debug)]
pub struct TaskGroup {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub group_uuid: GroupUuid,
    pub spec: GroupSpec,
    pub status: TaskGroupStatus,
    pub remaining_upstream: BTreeSet<String>,
    pub downstream: BTreeSet<String>,
    pub cleaned_up: bool,
    pub failure_message: Option<String>,
    pub scheduler_settings: Option<SchedulerSettings>,
    pub processing_start_time: Option<DateTime<Utc>>,
    pub scheduling_start_time: Option<DateTime<Utc>>,
    pub initializing_start_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct Task {
    pub workflow_id: WorkflowId,
    pub workflow_uuid: WorkflowUuid,
    pub name: String,
    pub group_name: String,
    pub task_uuid: TaskUuid,
    pub task_db_key: TaskDbKey,
    pub retry_id: i32,
    pub status: TaskGroupStatus,
    pub lead: bool,
    pub exit_code: Option<i32>,
    pub exit_actions: BTreeMap<String, String>,
    pub failure_message: Option<String>,
    pub pod_name: String,
    pub node_name: Option<String>,
    pub pod_ip: Option<String>,
    pub processing_start_time: Option<DateTime<Utc>>,
    pub scheduling_start_time: Option<DateTime<Utc>>,
    pub initializing_start_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// A task row joined with the submitting user, as needed when translating
/// agent telemetry into status-update jobs.
#[derive(Clone, Debug)]
pub struct TaskInfo {
    pub task: Task,
    pub submitted_by: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerType {
    #[default]
    Kai,
    /// Plain kube-scheduler; no gang scheduling, no priorities.
    Default,
}

impl SchedulerType {
    pub fn priority_supported(&self) -> bool {
        matches!(self, SchedulerType::Kai)
    }

    pub fn retry_allowed(&self) -> bool {
        matches!(self, SchedulerType::Kai)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub scheduler_type: SchedulerType,
    pub scheduler_name: String,
    pub scheduler_timeout: i32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            scheduler_type: SchedulerType::Kai,
            scheduler_name: "kai-scheduler".to_string(),
            scheduler_timeout: 30,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeConditions {
    #[serde(default)]
    pub rules: BTreeMap<String, String>,
    pub prefix: String,
    #[serde(default)]
    pub additional_node_conditions: Vec<String>,
    #[serde(default)]
    pub ignore_node_conditions: Vec<String>,
}

impl Default for NodeConditions {
    fn default() -> Self {
        Self {
            rules: BTreeMap::from([("Ready".to_string(), "True".to_string())]),
            prefix: "osmo.io/".to_string(),
            additional_node_conditions: Vec::new(),
            ignore_node_conditions: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Backend {
    pub name: String,
    pub description: String,
    pub version: String,
    pub k8s_uid: String,
    pub k8s_namespace: String,
    pub scheduler_settings: SchedulerSettings,
    pub node_conditions: NodeConditions,
    pub last_heartbeat: DateTime<Utc>,
    pub created_date: DateTime<Utc>,
    pub router_address: String,
}

impl Backend {
    /// A backend is online while heartbeats keep arriving.
    pub fn online(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now.signed_duration_since(self.last_heartbeat)
            .to_std()
            .map(|age| age <= max_age)
            .unwrap_or(true)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolStatus {
    #[default]
    Online,
    Offline,
    Maintenance,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolResourceCountable {
    /// -1 means unlimited.
    pub guarantee: i64,
    pub maximum: i64,
    pub weight: i64,
}

impl Default for PoolResourceCountable {
    fn default() -> Self {
        Self {
            guarantee: -1,
            maximum: -1,
            weight: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolResources {
    pub gpu: Option<PoolResourceCountable>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub description: String,
    pub backend: String,
    pub enable_maintenance: bool,
    #[serde(default, with = "humantime_serde")]
    pub default_exec_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub default_queue_timeout: Option<Duration>,
    #[serde(default)]
    pub default_exit_actions: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: PoolResources,
    #[serde(default)]
    pub platforms: Vec<String>,
}

impl Pool {
    pub fn status(&self, backend_online: bool) -> PoolStatus {
        if self.enable_maintenance {
            PoolStatus::Maintenance
        } else if backend_online {
            PoolStatus::Online
        } else {
            PoolStatus::Offline
        }
    }
}

/// One schedulable node of a backend cluster, as reported by the agent.
#[derive(Clone, Debug, Default)]
pub struct ResourceNode {
    pub name: String,
    pub backend: String,
    pub available: bool,
    pub allocatable: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub usage: BTreeMap<String, String>,
    pub non_workflow_usage: BTreeMap<String, String>,
    pub taints: Vec<serde_json::Value>,
    pub conditions: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppStatus {
    Uploading,
    Ready,
    Deleted,
}
