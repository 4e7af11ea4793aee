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

//! The submission boundary. Requests arrive here already parsed and
//! authenticated; this service validates them against pools and quotas,
//! mints identities and enqueues the SubmitWorkflow job. Everything after
//! that is job-driven.

use crate::ids::mint_workflow_id;
use crate::jobs::{
    CancelWorkflow, Job, JobContext, JobPayload, SubmitWorkflow,
};
use crate::model::spec::WorkflowSpec;
use crate::model::Workflow;
use crate::scheduler::{self, SchedulerError};
use chrono::Utc;
use osmo_common::model::{
    TaskDbKey, TaskGroupStatus, TaskUuid, WorkflowId, WorkflowPriority, WorkflowStatus,
    WorkflowUuid,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// How stale a backend heartbeat may be before its pools read as offline.
const HEARTBEAT_ONLINE_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum WorkflowServiceError {
    #[error("{0}")]
    Validation(#[from] SchedulerError),
    #[error("Pool {0} not found")]
    PoolNotFound(String),
    #[error("Workflow {0} not found")]
    WorkflowNotFound(WorkflowId),
    #[error("{0}")]
    Internal(String),
}

impl From<crate::repo::RepoError> for WorkflowServiceError {
    fn from(error: crate::repo::RepoError) -> Self {
        WorkflowServiceError::Internal(error.to_string())
    }
}

impl From<crate::broker::BrokerError> for WorkflowServiceError {
    fn from(error: crate::broker::BrokerError) -> Self {
        WorkflowServiceError::Internal(error.to_string())
    }
}

/// A validated submission request, as produced by the request-parsing
/// layer above this crate.
#[derive(Clone, Debug)]
pub struct SubmitWorkflowRequest {
    pub name: String,
    pub spec: WorkflowSpec,
    pub user: String,
    pub pool: String,
    pub priority: WorkflowPriority,
    pub is_admin: bool,
    pub parent_workflow_id: Option<WorkflowId>,
    pub app_uuid: Option<Uuid>,
    pub app_version: Option<i32>,
}

#[derive(Clone, Debug)]
pub struct SubmitResponse {
    pub workflow_id: WorkflowId,
    pub workflow_uuid: WorkflowUuid,
}

pub struct WorkflowService {
    ctx: JobContext,
}

impl WorkflowService {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    pub async fn submit(
        &self,
        request: SubmitWorkflowRequest,
    ) -> Result<SubmitResponse, WorkflowServiceError> {
        let mut spec = request.spec.clone();
        scheduler::validate_spec(&mut spec, self.ctx.settings.max_num_tasks)?;
        scheduler::expand_dag(&spec)?;

        let workflow_id = mint_workflow_id(&request.name);
        let workflow_uuid = WorkflowUuid::new_v4();

        let pool = self
            .ctx
            .pools
            .get(&request.pool)
            .await?
            .ok_or_else(|| WorkflowServiceError::PoolNotFound(request.pool.clone()))?;
        let (scheduler_settings, backend_online) =
            match self.ctx.backends.get(&pool.backend).await? {
                Some(backend) => {
                    let online = backend.online(Utc::now(), HEARTBEAT_ONLINE_WINDOW);
                    (backend.scheduler_settings, online)
                }
                None => (Default::default(), false),
            };

        if let Err(err) = scheduler::validate_submit(
            &pool,
            backend_online,
            &scheduler_settings,
            &spec,
            request.priority,
            request.is_admin,
        ) {
            // The spec parsed, so the rejection leaves a visible trace.
            self.insert_failed_submission(&request, &workflow_id, &err.to_string())
                .await?;
            return Err(err.into());
        }

        let mut group_uuids = BTreeMap::new();
        let mut task_uuids = BTreeMap::new();
        let mut task_db_keys = BTreeMap::new();
        for group in &spec.groups {
            group_uuids.insert(group.name.clone(), osmo_common::model::GroupUuid::new_v4());
            for task in &group.tasks {
                task_uuids.insert(task.name.clone(), TaskUuid::new_v4());
                task_db_keys.insert(task.name.clone(), TaskDbKey::new_v4());
            }
        }

        let job = Job::new(JobPayload::SubmitWorkflow(SubmitWorkflow {
            workflow_id: workflow_id.clone(),
            workflow_uuid,
            user: request.user,
            pool: request.pool,
            priority: request.priority,
            spec,
            group_uuids,
            task_uuids,
            task_db_keys,
            parent_workflow_id: request.parent_workflow_id,
            app_uuid: request.app_uuid,
            app_version: request.app_version,
        }));
        self.ctx.broker.enqueue(&job).await?;

        info!(
            workflow_id = %workflow_id,
            workflow_uuid = %workflow_uuid,
            "Accepted workflow submission"
        );
        Ok(SubmitResponse {
            workflow_id,
            workflow_uuid,
        })
    }

    async fn insert_failed_submission(
        &self,
        request: &SubmitWorkflowRequest,
        workflow_id: &WorkflowId,
        failure: &str,
    ) -> Result<(), WorkflowServiceError> {
        let now = Utc::now();
        let placeholder = Workflow {
            workflow_id: WorkflowId(format!("failed-{workflow_id}")),
            workflow_uuid: WorkflowUuid::new_v4(),
            user: request.user.clone(),
            pool: request.pool.clone(),
            backend: String::new(),
            priority: request.priority,
            status: WorkflowStatus::Failed,
            submit_time: Some(now),
            start_time: None,
            end_time: Some(now),
            exec_timeout: None,
            queue_timeout: None,
            logs: String::new(),
            events: String::new(),
            failure_message: Some(failure.to_string()),
            cancelled_by: None,
            parent_workflow_id: request.parent_workflow_id.clone(),
            app_uuid: request.app_uuid,
            app_version: request.app_version,
            plugins: serde_json::Value::Object(Default::default()),
        };
        self.ctx.workflows.insert(&placeholder).await?;
        Ok(())
    }

    pub async fn cancel(
        &self,
        workflow_id: &WorkflowId,
        user: &str,
        message: Option<String>,
        force: bool,
    ) -> Result<(), WorkflowServiceError> {
        let workflow = self
            .ctx
            .workflows
            .get(workflow_id)
            .await?
            .ok_or_else(|| WorkflowServiceError::WorkflowNotFound(workflow_id.clone()))?;
        self.ctx
            .broker
            .enqueue(&Job::new(JobPayload::CancelWorkflow(CancelWorkflow {
                workflow_id: workflow.workflow_id,
                workflow_uuid: workflow.workflow_uuid,
                user: user.to_string(),
                workflow_status: WorkflowStatus::FailedCanceled,
                task_status: TaskGroupStatus::FailedCanceled,
                message,
                force,
            })))
            .await?;
        Ok(())
    }

    /// Operator-facing timeout extension; the running check jobs pick the
    /// new values up on their next evaluation.
    pub async fn extend_timeouts(
        &self,
        workflow_id: &WorkflowId,
        queue_timeout: Option<Duration>,
        exec_timeout: Option<Duration>,
    ) -> Result<(), WorkflowServiceError> {
        self.ctx
            .workflows
            .set_timeouts(workflow_id, queue_timeout, exec_timeout)
            .await?;
        Ok(())
    }
}
