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

//! The pod-spec rendering boundary. The control plane never understands
//! cluster YAML; it hands a [`RenderRequest`] to a [`PodSpecRenderer`] and
//! forwards the opaque result to the backend agent.

use crate::jobs::CleanupSpec;
use crate::model::spec::TaskSpec;
use crate::model::SchedulerSettings;
use osmo_common::model::{GroupUuid, TaskUuid, WorkflowId, WorkflowPriority, WorkflowUuid};
use serde_json::json;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Failed to render pod spec: {0}")]
    Render(String),
}

/// Pod names must be deterministic so a redelivered CreateGroup produces
/// the same cluster objects and the second create is a cluster-level no-op.
pub fn construct_pod_name(workflow_uuid: &WorkflowUuid, task_uuid: &TaskUuid) -> String {
    let workflow_hex = workflow_uuid.to_string();
    format!("osmo-{}-{}", &workflow_hex[..12], task_uuid)
}

#[derive(Clone, Debug)]
pub struct RenderTask {
    pub name: String,
    pub task_uuid: TaskUuid,
    pub retry_id: i32,
    pub spec: TaskSpec,
}

#[derive(Clone, Debug)]
pub struct RenderRequest {
    pub workflow_id: WorkflowId,
    pub workflow_uuid: WorkflowUuid,
    pub user: String,
    pub pool: String,
    pub priority: WorkflowPriority,
    pub group_name: String,
    pub group_uuid: GroupUuid,
    /// Gang-scheduling queue label, keyed by `(namespace, pool)`.
    pub gang_queue: String,
    pub namespace: String,
    pub scheduler: SchedulerSettings,
    pub tasks: Vec<RenderTask>,
}

impl RenderRequest {
    pub fn group_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "osmo.workflow_uuid".to_string(),
                self.workflow_uuid.to_string(),
            ),
            ("osmo.group_uuid".to_string(), self.group_uuid.to_string()),
        ])
    }

    pub fn task_labels(&self, task: &RenderTask) -> BTreeMap<String, String> {
        let mut labels = self.group_labels();
        labels.insert("osmo.task_name".to_string(), task.name.clone());
        labels.insert("osmo.retry_id".to_string(), task.retry_id.to_string());
        labels
    }
}

#[derive(Clone, Debug, Default)]
pub struct RenderedGroup {
    /// Cluster objects to create, in order.
    pub resources: Vec<serde_json::Value>,
    /// Per-task pod specs, archived next to the workflow outputs.
    pub pod_specs: BTreeMap<String, serde_json::Value>,
}

pub trait PodSpecRenderer: Send + Sync {
    fn render_group(&self, request: &RenderRequest) -> Result<RenderedGroup, RenderError>;

    /// Renders the single replacement pod of a rescheduled task.
    fn render_task(
        &self,
        request: &RenderRequest,
        task: &RenderTask,
    ) -> Result<serde_json::Value, RenderError>;

    fn group_cleanup_specs(&self, labels: &BTreeMap<String, String>) -> Vec<CleanupSpec>;

    fn error_log_spec(&self, labels: &BTreeMap<String, String>) -> CleanupSpec;
}

/// Minimal renderer for local development and tests; production
/// deployments plug in their own.
pub struct DefaultPodSpecRenderer;

impl DefaultPodSpecRenderer {
    fn pod(&self, request: &RenderRequest, task: &RenderTask) -> serde_json::Value {
        let env: Vec<serde_json::Value> = task
            .spec
            .environment
            .iter()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect();
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": construct_pod_name(&request.workflow_uuid, &task.task_uuid),
                "namespace": request.namespace,
                "labels": request.task_labels(task),
                "annotations": {"osmo.queue": request.gang_queue},
            },
            "spec": {
                "schedulerName": request.scheduler.scheduler_name,
                "restartPolicy": "Never",
                "containers": [{
                    "name": task.spec.name,
                    "image": task.spec.image,
                    "command": task.spec.command,
                    "args": task.spec.args,
                    "env": env,
                }],
            },
        })
    }
}

impl PodSpecRenderer for DefaultPodSpecRenderer {
    fn render_group(&self, request: &RenderRequest) -> Result<RenderedGroup, RenderError> {
        let mut rendered = RenderedGroup::default();
        for task in &request.tasks {
            let pod = self.pod(request, task);
            rendered.resources.push(pod.clone());
            rendered.pod_specs.insert(task.name.clone(), pod);
        }
        Ok(rendered)
    }

    fn render_task(
        &self,
        request: &RenderRequest,
        task: &RenderTask,
    ) -> Result<serde_json::Value, RenderError> {
        Ok(self.pod(request, task))
    }

    fn group_cleanup_specs(&self, labels: &BTreeMap<String, String>) -> Vec<CleanupSpec> {
        vec![
            CleanupSpec {
                resource_type: "Secret".to_string(),
                labels: labels.clone(),
            },
            CleanupSpec {
                resource_type: "Service".to_string(),
                labels: labels.clone(),
            },
            CleanupSpec {
                resource_type: "Pod".to_string(),
                labels: labels.clone(),
            },
        ]
    }

    fn error_log_spec(&self, labels: &BTreeMap<String, String>) -> CleanupSpec {
        CleanupSpec {
            resource_type: "Pod".to_string(),
            labels: labels.clone(),
        }
    }
}
