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

//! Thin object-storage jobs: workflow artefacts and app contents.

use crate::jobs::{DeleteApp, JobContext, JobError, JobResult, UploadApp, UploadWorkflowFiles};
use crate::model::AppStatus;

const APP_FILE_NAME: &str = "app.yaml";

pub async fn execute_upload_files(
    payload: &UploadWorkflowFiles,
    ctx: &JobContext,
) -> Result<JobResult, JobError> {
    for file in &payload.files {
        ctx.storage
            .put(&payload.workflow_id.0, &file.path, file.content.as_bytes())
            .await
            .map_err(|err| JobError::Storage(err.to_string()))?;
    }
    Ok(JobResult::success())
}

pub async fn execute_upload_app(
    payload: &UploadApp,
    ctx: &JobContext,
) -> Result<JobResult, JobError> {
    let prefix = format!("{}/{}", payload.app_uuid, payload.app_version);
    ctx.storage
        .put(&prefix, APP_FILE_NAME, payload.app_content.as_bytes())
        .await
        .map_err(|err| JobError::Storage(err.to_string()))?;
    ctx.apps
        .set_status(&payload.app_uuid, payload.app_version, AppStatus::Ready)
        .await?;
    Ok(JobResult::success())
}

pub async fn execute_delete_app(
    payload: &DeleteApp,
    ctx: &JobContext,
) -> Result<JobResult, JobError> {
    for version in &payload.app_versions {
        ctx.storage
            .delete_prefix(&format!("{}/{}", payload.app_uuid, version))
            .await
            .map_err(|err| JobError::Storage(err.to_string()))?;
        ctx.apps
            .set_status(&payload.app_uuid, *version, AppStatus::Deleted)
            .await?;
    }
    Ok(JobResult::success())
}
