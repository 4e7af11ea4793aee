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

//! The job model. A [`Job`] is a self-describing envelope whose `job_id`
//! is a pure function of its payload: duplicate submissions of the same
//! logical operation collide on the broker's dedup key and only the first
//! instance takes effect. The `job_uuid` identifies one instance.

pub mod cancel;
pub mod cleanup;
pub mod context;
pub mod create;
pub mod submit;
pub mod update;
pub mod upload;

use crate::broker::BrokerError;
use crate::ids::generate_unique_id;
use crate::model::spec::WorkflowSpec;
use crate::repo::RepoError;
use osmo_common::model::{
    GroupUuid, JobStatus, TaskDbKey, TaskGroupStatus, TaskUuid, WorkflowId, WorkflowPriority,
    WorkflowStatus, WorkflowUuid,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

pub use context::JobContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSuperType {
    Frontend,
    Backend,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueName {
    Frontend,
    Backend(String),
}

impl QueueName {
    pub fn key(&self) -> String {
        match self {
            QueueName::Frontend => "jobs:frontend".to_string(),
            QueueName::Backend(backend) => format!("jobs:backend:{backend}"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub super_type: JobSuperType,
    pub job_id: String,
    pub job_uuid: String,
    #[serde(flatten)]
    pub payload: JobPayload,
}

impl Job {
    pub fn new(payload: JobPayload) -> Job {
        let job_id = payload.deterministic_job_id();
        Self::with_job_id(payload, job_id)
    }

    pub fn with_job_id(payload: JobPayload, job_id: String) -> Job {
        Job {
            super_type: payload.super_type(),
            job_id,
            job_uuid: Uuid::new_v4().simple().to_string(),
            payload,
        }
    }

    pub fn queue(&self) -> QueueName {
        match self.payload.backend() {
            Some(backend) => QueueName::Backend(backend.to_string()),
            None => QueueName::Frontend,
        }
    }

    pub fn job_type(&self) -> &'static str {
        self.payload.job_type()
    }

    pub fn workflow_uuid(&self) -> Option<WorkflowUuid> {
        self.payload.workflow_uuid()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "job_type")]
pub enum JobPayload {
    SubmitWorkflow(SubmitWorkflow),
    CreateGroup(CreateGroup),
    UpdateGroup(UpdateGroup),
    CleanupGroup(CleanupGroup),
    RescheduleTask(RescheduleTask),
    CleanupWorkflow(CleanupWorkflow),
    CancelWorkflow(CancelWorkflow),
    CheckRunTimeout(CheckRunTimeout),
    CheckQueueTimeout(CheckQueueTimeout),
    UploadWorkflowFiles(UploadWorkflowFiles),
    UploadApp(UploadApp),
    DeleteApp(DeleteApp),
}

impl JobPayload {
    pub fn job_type(&self) -> &'static str {
        match self {
            JobPayload::SubmitWorkflow(_) => "SubmitWorkflow",
            JobPayload::CreateGroup(_) => "CreateGroup",
            JobPayload::UpdateGroup(_) => "UpdateGroup",
            JobPayload::CleanupGroup(_) => "CleanupGroup",
            JobPayload::RescheduleTask(_) => "RescheduleTask",
            JobPayload::CleanupWorkflow(_) => "CleanupWorkflow",
            JobPayload::CancelWorkflow(_) => "CancelWorkflow",
            JobPayload::CheckRunTimeout(_) => "CheckRunTimeout",
            JobPayload::CheckQueueTimeout(_) => "CheckQueueTimeout",
            JobPayload::UploadWorkflowFiles(_) => "UploadWorkflowFiles",
            JobPayload::UploadApp(_) => "UploadApp",
            JobPayload::DeleteApp(_) => "DeleteApp",
        }
    }

    pub fn super_type(&self) -> JobSuperType {
        match self.backend() {
            Some(_) => JobSuperType::Backend,
            None => JobSuperType::Frontend,
        }
    }

    /// The backend this job is routed to, for backend jobs.
    pub fn backend(&self) -> Option<&str> {
        match self {
            JobPayload::CreateGroup(payload) => Some(&payload.backend),
            JobPayload::CleanupGroup(payload) => Some(&payload.backend),
            JobPayload::RescheduleTask(payload) => Some(&payload.backend),
            _ => None,
        }
    }

    pub fn workflow_uuid(&self) -> Option<WorkflowUuid> {
        match self {
            JobPayload::SubmitWorkflow(payload) => Some(payload.workflow_uuid),
            JobPayload::CreateGroup(payload) => Some(payload.workflow_uuid),
            JobPayload::UpdateGroup(payload) => Some(payload.workflow_uuid),
            JobPayload::CleanupGroup(payload) => Some(payload.workflow_uuid),
            JobPayload::RescheduleTask(payload) => Some(payload.workflow_uuid),
            JobPayload::CleanupWorkflow(payload) => Some(payload.workflow_uuid),
            JobPayload::CancelWorkflow(payload) => Some(payload.workflow_uuid),
            JobPayload::CheckRunTimeout(payload) => Some(payload.workflow_uuid),
            JobPayload::CheckQueueTimeout(payload) => Some(payload.workflow_uuid),
            JobPayload::UploadWorkflowFiles(payload) => Some(payload.workflow_uuid),
            JobPayload::UploadApp(_) | JobPayload::DeleteApp(_) => None,
        }
    }

    /// The deterministic job id. Two submissions of the same logical
    /// operation must produce equal ids.
    pub fn deterministic_job_id(&self) -> String {
        match self {
            JobPayload::SubmitWorkflow(payload) => format!("{}-submit", payload.workflow_uuid),
            JobPayload::CreateGroup(payload) => {
                format!("{}-{}-submit", payload.workflow_uuid, payload.group_name)
            }
            JobPayload::UpdateGroup(payload) => payload.deterministic_job_id(),
            JobPayload::CleanupGroup(payload) => {
                if payload.force_delete {
                    format!(
                        "{}-{}-force-backend-cleanup",
                        payload.workflow_uuid, payload.group_name
                    )
                } else {
                    format!(
                        "{}-{}-backend-cleanup",
                        payload.workflow_uuid, payload.group_name
                    )
                }
            }
            JobPayload::RescheduleTask(payload) => format!(
                "{}-{}-{}-reschedule",
                payload.workflow_uuid, payload.task_name, payload.retry_id
            ),
            JobPayload::CleanupWorkflow(payload) => format!("{}-cleanup", payload.workflow_uuid),
            JobPayload::CancelWorkflow(payload) => format!("{}-cancel", payload.workflow_uuid),
            // Check jobs re-enqueue themselves; a fixed id would let the
            // broker's dedup key swallow every legitimate re-check.
            JobPayload::CheckRunTimeout(payload) => format!(
                "{}-{}-check_run_timeout",
                payload.workflow_uuid,
                generate_unique_id(5)
            ),
            JobPayload::CheckQueueTimeout(payload) => format!(
                "{}-{}-check_queue_timeout",
                payload.workflow_uuid,
                generate_unique_id(5)
            ),
            JobPayload::UploadWorkflowFiles(payload) => {
                let mut hasher = Sha256::new();
                for file in &payload.files {
                    hasher.update(file.path.as_bytes());
                    hasher.update(b"\n");
                }
                let digest = hex::encode(hasher.finalize());
                format!("{}-{}-upload-files", payload.workflow_uuid, &digest[..32])
            }
            JobPayload::UploadApp(payload) => {
                format!("{}-{}-upload-app", payload.app_uuid, payload.app_version)
            }
            JobPayload::DeleteApp(payload) => {
                let versions = payload
                    .app_versions
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("-");
                format!("{}-{}-delete-app", payload.app_uuid, versions)
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitWorkflow {
    pub workflow_id: WorkflowId,
    pub workflow_uuid: WorkflowUuid,
    pub user: String,
    pub pool: String,
    pub priority: WorkflowPriority,
    pub spec: WorkflowSpec,
    /// Pre-minted identities so a replayed submission creates identical
    /// rows and collides into no-ops.
    pub group_uuids: BTreeMap<String, GroupUuid>,
    pub task_uuids: BTreeMap<String, TaskUuid>,
    pub task_db_keys: BTreeMap<String, TaskDbKey>,
    pub parent_workflow_id: Option<WorkflowId>,
    pub app_uuid: Option<Uuid>,
    pub app_version: Option<i32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateGroup {
    pub backend: String,
    pub workflow_id: WorkflowId,
    pub workflow_uuid: WorkflowUuid,
    pub group_name: String,
    pub user: String,
    /// Rendered cluster resources, attached before dispatch.
    #[serde(default)]
    pub k8s_resources: Option<Vec<serde_json::Value>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateGroup {
    pub workflow_id: WorkflowId,
    pub workflow_uuid: WorkflowUuid,
    pub group_name: String,
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default)]
    pub retry_id: Option<i32>,
    pub status: TaskGroupStatus,
    #[serde(default)]
    pub message: String,
    pub user: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub force_cancel: bool,
    #[serde(default = "default_true")]
    pub lead_task: bool,
}

fn default_true() -> bool {
    true
}

impl UpdateGroup {
    pub fn deterministic_job_id(&self) -> String {
        let mut parts = vec![self.workflow_uuid.to_string(), self.group_name.clone()];
        if let Some(task_name) = &self.task_name {
            parts.push(task_name.clone());
            if let Some(retry_id) = self.retry_id {
                parts.push(retry_id.to_string());
            }
        }
        parts.push("update".to_string());
        parts.push(self.status.to_string());
        parts.join("-")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupSpec {
    pub resource_type: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupGroup {
    pub backend: String,
    pub workflow_id: WorkflowId,
    pub workflow_uuid: WorkflowUuid,
    pub group_name: String,
    #[serde(default)]
    pub force_delete: bool,
    pub cleanup_specs: Vec<CleanupSpec>,
    #[serde(default)]
    pub error_log_spec: Option<CleanupSpec>,
    pub max_log_lines: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RescheduleTask {
    pub backend: String,
    pub workflow_id: WorkflowId,
    pub workflow_uuid: WorkflowUuid,
    pub task_name: String,
    pub retry_id: i32,
    #[serde(default)]
    pub lead_task: bool,
    pub create_job: CreateGroup,
    pub cleanup_job: CleanupGroup,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupWorkflow {
    pub workflow_id: WorkflowId,
    pub workflow_uuid: WorkflowUuid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelWorkflow {
    pub workflow_id: WorkflowId,
    pub workflow_uuid: WorkflowUuid,
    pub user: String,
    pub workflow_status: WorkflowStatus,
    pub task_status: TaskGroupStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckRunTimeout {
    pub workflow_id: WorkflowId,
    pub workflow_uuid: WorkflowUuid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckQueueTimeout {
    pub workflow_id: WorkflowId,
    pub workflow_uuid: WorkflowUuid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadWorkflowFiles {
    pub workflow_id: WorkflowId,
    pub workflow_uuid: WorkflowUuid,
    pub files: Vec<FileContent>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadApp {
    pub app_uuid: Uuid,
    pub app_version: i32,
    pub app_content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteApp {
    pub app_uuid: Uuid,
    pub app_versions: Vec<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobResult {
    pub status: JobStatus,
    pub message: String,
}

impl JobResult {
    pub fn success() -> JobResult {
        JobResult::default()
    }

    pub fn retry(message: impl Into<String>) -> JobResult {
        JobResult {
            status: JobStatus::FailedRetry,
            message: message.into(),
        }
    }

    pub fn no_retry(message: impl Into<String>) -> JobResult {
        JobResult {
            status: JobStatus::FailedNoRetry,
            message: message.into(),
        }
    }
}

/// Outcome of the frontend-side preparation of a backend job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrepareOutcome {
    Ready,
    Abort(String),
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Repo(#[from] RepoError),
    #[error("{0}")]
    Broker(#[from] BrokerError),
    #[error("{0}")]
    Storage(String),
    #[error("{0}")]
    Invalid(String),
}

impl JobError {
    /// Transient infrastructure errors are retried by the broker; anything
    /// else goes through the job's failure handler.
    pub fn retryable(&self) -> bool {
        match self {
            JobError::Repo(RepoError::Internal(_)) => true,
            JobError::Repo(_) => false,
            JobError::Broker(_) => true,
            JobError::Storage(_) => true,
            JobError::Invalid(_) => false,
        }
    }
}

/// Central dispatch: `job_type` to handler.
pub async fn execute(job: &Job, ctx: &JobContext) -> Result<JobResult, JobError> {
    match &job.payload {
        JobPayload::SubmitWorkflow(payload) => submit::execute(payload, ctx).await,
        JobPayload::CreateGroup(_) => Ok(JobResult::success()),
        JobPayload::UpdateGroup(payload) => update::execute(payload, ctx).await,
        JobPayload::CleanupGroup(payload) => cleanup::execute_cleanup_group(payload, ctx).await,
        JobPayload::RescheduleTask(payload) => create::execute_reschedule(payload, ctx).await,
        JobPayload::CleanupWorkflow(payload) => {
            cleanup::execute_cleanup_workflow(payload, ctx).await
        }
        JobPayload::CancelWorkflow(payload) => cancel::execute_cancel(payload, ctx).await,
        JobPayload::CheckRunTimeout(payload) => cancel::execute_check_run_timeout(payload, ctx).await,
        JobPayload::CheckQueueTimeout(payload) => {
            cancel::execute_check_queue_timeout(payload, ctx).await
        }
        JobPayload::UploadWorkflowFiles(payload) => upload::execute_upload_files(payload, ctx).await,
        JobPayload::UploadApp(payload) => upload::execute_upload_app(payload, ctx).await,
        JobPayload::DeleteApp(payload) => upload::execute_delete_app(payload, ctx).await,
    }
}

/// Frontend-side checks and preparation that run before a backend job is
/// sent down the worker channel. Frontend jobs are always ready.
pub async fn prepare_execute(job: &mut Job, ctx: &JobContext) -> Result<PrepareOutcome, JobError> {
    match &mut job.payload {
        JobPayload::CreateGroup(payload) => create::prepare_create_group(payload, ctx).await,
        JobPayload::CleanupGroup(payload) => cleanup::prepare_cleanup_group(payload, ctx).await,
        JobPayload::RescheduleTask(payload) => create::prepare_reschedule(payload, ctx).await,
        _ => Ok(PrepareOutcome::Ready),
    }
}

/// Invoked when a job permanently fails: writes the user-visible failure
/// and cascades whatever downstream effects the job type requires.
pub async fn handle_failure(job: &Job, ctx: &JobContext, error: &str) {
    let outcome = match &job.payload {
        JobPayload::SubmitWorkflow(payload) => submit::handle_failure(payload, ctx, error).await,
        JobPayload::CreateGroup(payload) => create::handle_create_failure(payload, ctx, error).await,
        JobPayload::UpdateGroup(payload) => update::handle_failure(payload, ctx).await,
        JobPayload::RescheduleTask(payload) => {
            create::handle_reschedule_failure(payload, ctx, error).await
        }
        _ => Ok(()),
    };
    if let Err(failure_error) = outcome {
        tracing::error!(
            job_id = %job.job_id,
            job_type = %job.job_type(),
            error = %failure_error,
            "Failure handler itself failed"
        );
    }
}

pub(crate) async fn enqueue(ctx: &JobContext, payload: JobPayload) -> Result<(), JobError> {
    ctx.broker.enqueue(&Job::new(payload)).await?;
    Ok(())
}

/// Status updates dedup at enqueue time already: a second event with the
/// same deterministic id would be skipped by the worker anyway, so it is
/// not worth a queue slot. Cancellations always go through, because their
/// first instance may have been consumed by the PROCESSING re-queue rule.
pub(crate) async fn enqueue_update_group(
    ctx: &JobContext,
    payload: UpdateGroup,
) -> Result<(), JobError> {
    let skip_duplicates = !payload.status.canceled();
    let job = Job::new(JobPayload::UpdateGroup(payload));
    if skip_duplicates && ctx.broker.dedup_exists(&job.job_id).await? {
        tracing::debug!(job_id = %job.job_id, "Skipping duplicate status update");
        return Ok(());
    }
    ctx.broker.enqueue(&job).await?;
    Ok(())
}

pub(crate) fn effective_queue_timeout(
    workflow: &crate::model::Workflow,
    pool: Option<&crate::model::Pool>,
    settings: &crate::config::WorkflowSettings,
) -> std::time::Duration {
    workflow
        .queue_timeout
        .or_else(|| pool.and_then(|pool| pool.default_queue_timeout))
        .unwrap_or(settings.default_queue_timeout)
}

pub(crate) fn effective_exec_timeout(
    workflow: &crate::model::Workflow,
    pool: Option<&crate::model::Pool>,
    settings: &crate::config::WorkflowSettings,
) -> std::time::Duration {
    workflow
        .exec_timeout
        .or_else(|| pool.and_then(|pool| pool.default_exec_timeout))
        .unwrap_or(settings.default_exec_timeout)
}

/// Queue and action-token TTLs are bounded by the total lifetime a
/// workflow can spend queued plus running.
pub fn total_timeout(
    queue_timeout: Option<std::time::Duration>,
    exec_timeout: Option<std::time::Duration>,
    settings: &crate::config::WorkflowSettings,
) -> std::time::Duration {
    queue_timeout.unwrap_or(settings.default_queue_timeout)
        + exec_timeout.unwrap_or(settings.default_exec_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    fn update_group_payload() -> UpdateGroup {
        UpdateGroup {
            workflow_id: WorkflowId("wf-abc123".to_string()),
            workflow_uuid: WorkflowUuid(Uuid::nil()),
            group_name: "g1".to_string(),
            task_name: Some("t1".to_string()),
            retry_id: Some(0),
            status: TaskGroupStatus::Completed,
            message: String::new(),
            user: "alice".to_string(),
            exit_code: Some(0),
            force_cancel: false,
            lead_task: true,
        }
    }

    #[test]
    fn update_group_job_ids_are_deterministic() {
        let a = Job::new(JobPayload::UpdateGroup(update_group_payload()));
        let b = Job::new(JobPayload::UpdateGroup(update_group_payload()));
        assert_eq!(a.job_id, b.job_id);
        assert_ne!(a.job_uuid, b.job_uuid);
        assert!(a.job_id.ends_with("-update-COMPLETED"));
    }

    #[test]
    fn upload_files_job_id_coalesces_on_paths() {
        let files = vec![
            FileContent {
                path: "t1.spec".to_string(),
                content: "a".to_string(),
            },
            FileContent {
                path: "t2.spec".to_string(),
                content: "b".to_string(),
            },
        ];
        let payload = |files: Vec<FileContent>| {
            JobPayload::UploadWorkflowFiles(UploadWorkflowFiles {
                workflow_id: WorkflowId("wf".to_string()),
                workflow_uuid: WorkflowUuid(Uuid::nil()),
                files,
            })
        };
        let a = payload(files.clone()).deterministic_job_id();
        let mut changed = files;
        changed[0].content = "different".to_string();
        let b = payload(changed).deterministic_job_id();
        // Content differences coalesce; only paths feed the digest.
        assert_eq!(a, b);
        assert!(a.ends_with("-upload-files"));
    }

    #[test]
    fn backend_jobs_route_to_their_backend_queue() {
        let job = Job::new(JobPayload::CreateGroup(CreateGroup {
            backend: "cluster-a".to_string(),
            workflow_id: WorkflowId("wf".to_string()),
            workflow_uuid: WorkflowUuid(Uuid::nil()),
            group_name: "g1".to_string(),
            user: "alice".to_string(),
            k8s_resources: None,
        }));
        assert_eq!(job.super_type, JobSuperType::Backend);
        assert_eq!(job.queue(), QueueName::Backend("cluster-a".to_string()));
        assert_eq!(QueueName::Frontend.key(), "jobs:frontend");
        assert_eq!(job.queue().key(), "jobs:backend:cluster-a");
    }

    #[test]
    fn envelope_serializes_with_flattened_payload() {
        let job = Job::new(JobPayload::CleanupWorkflow(CleanupWorkflow {
            workflow_id: WorkflowId("wf".to_string()),
            workflow_uuid: WorkflowUuid(Uuid::nil()),
        }));
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["super_type"], "frontend");
        assert_eq!(value["job_type"], "CleanupWorkflow");
        assert_eq!(value["workflow_id"], "wf");
        assert_eq!(job.job_uuid.len(), 32);

        let parsed: Job = serde_json::from_value(value).unwrap();
        assert!(matches!(parsed.payload, JobPayload::CleanupWorkflow(_)));
    }
}
