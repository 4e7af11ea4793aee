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

use crate::model::spec::GroupSpec;
use crate::model::state::group_transition_guard;
use crate::model::{SchedulerSettings, TaskGroup};
use crate::repo::RepoError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use osmo_common::model::{GroupUuid, TaskGroupStatus, WorkflowId};
use sqlx::types::Json;
use sqlx::{Pool, Postgres, QueryBuilder, Row};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct GroupRecord {
    pub workflow_id: String,
    pub name: String,
    pub group_uuid: uuid::Uuid,
    pub spec: Json<GroupSpec>,
    pub status: String,
    pub failure_message: Option<String>,
    pub remaining_upstream: Vec<String>,
    pub downstream: Vec<String>,
    pub cleaned_up: bool,
    pub scheduler_settings: Option<Json<SchedulerSettings>>,
    pub processing_start_time: Option<DateTime<Utc>>,
    pub scheduling_start_time: Option<DateTime<Utc>>,
    pub initializing_start_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl TryFrom<GroupRecord> for TaskGroup {
    type Error = String;

    fn try_from(value: GroupRecord) -> Result<Self, Self::Error> {
        Ok(TaskGroup {
            workflow_id: WorkflowId(value.workflow_id),
            name: value.name,
            group_uuid: GroupUuid(value.group_uuid),
            spec: value.spec.0,
            status: TaskGroupStatus::from_str(&value.status)
                .map_err(|_| format!("Invalid group status: {}", value.status))?,
            remaining_upstream: value.remaining_upstream.into_iter().collect(),
            downstream: value.downstream.into_iter().collect(),
            cleaned_up: value.cleaned_up,
            failure_message: value.failure_message,
            scheduler_settings: value.scheduler_settings.map(|json| json.0),
            processing_start_time: value.processing_start_time,
            scheduling_start_time: value.scheduling_start_time,
            initializing_start_time: value.initializing_start_time,
            start_time: value.start_time,
            end_time: value.end_time,
        })
    }
}

/// Input of a new group row, produced by the SubmitWorkflow handler.
#[derive(Clone, Debug)]
pub struct NewGroup {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub group_uuid: GroupUuid,
    pub spec: GroupSpec,
    pub remaining_upstream: BTreeSet<String>,
    pub downstream: BTreeSet<String>,
}

#[async_trait]
pub trait GroupRepo: Send + Sync {
    /// Idempotent insert of one group row in SUBMITTING.
    async fn insert(&self, group: &NewGroup) -> Result<(), RepoError>;

    async fn get(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
    ) -> Result<Option<TaskGroup>, RepoError>;

    async fn list_by_workflow(&self, workflow_id: &WorkflowId)
        -> Result<Vec<TaskGroup>, RepoError>;

    async fn fetch_status(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
    ) -> Result<TaskGroupStatus, RepoError>;

    /// Guarded status write (see [`crate::model::state`]); returns whether
    /// the write landed.
    async fn update_status(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
        status: TaskGroupStatus,
        now: DateTime<Utc>,
        message: &str,
        force_cancel: bool,
        scheduler_settings: Option<&SchedulerSettings>,
    ) -> Result<bool, RepoError>;

    /// Flips every SUBMITTING group of the workflow to WAITING, unless the
    /// workflow was cancelled in the meantime. Returns false when it was.
    async fn mark_groups_waiting(&self, workflow_id: &WorkflowId) -> Result<bool, RepoError>;

    /// Removes `upstream_name` from `downstream_name`'s remaining upstream
    /// set. Returns true only when this call removed the last remaining
    /// entry; an already-removed member reports false, so a redelivered
    /// completion cannot re-dispatch the downstream group.
    async fn remove_upstream(
        &self,
        workflow_id: &WorkflowId,
        downstream_name: &str,
        upstream_name: &str,
    ) -> Result<bool, RepoError>;

    /// One-way `cleaned_up` flip. Returns `(flipped, all_cleaned)`.
    async fn patch_cleaned_up(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
    ) -> Result<(bool, bool), RepoError>;
}

pub struct DbGroupRepo {
    db_pool: Arc<Pool<Postgres>>,
}

impl DbGroupRepo {
    pub fn new(db_pool: Arc<Pool<Postgres>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl GroupRepo for DbGroupRepo {
    async fn insert(&self, group: &NewGroup) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO groups
                (workflow_id, name, group_uuid, spec, status, remaining_upstream,
                 downstream, cleaned_up)
              VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE)
              ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&group.workflow_id.0)
        .bind(&group.name)
        .bind(group.group_uuid.0)
        .bind(Json(&group.spec))
        .bind(TaskGroupStatus::Submitting.to_string())
        .bind(group.remaining_upstream.iter().cloned().collect::<Vec<_>>())
        .bind(group.downstream.iter().cloned().collect::<Vec<_>>())
        .execute(&*self.db_pool)
        .await?;
        Ok(())
    }

    async fn get(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
    ) -> Result<Option<TaskGroup>, RepoError> {
        let record: Option<GroupRecord> =
            sqlx::query_as("SELECT * FROM groups WHERE workflow_id = $1 AND name = $2")
                .bind(&workflow_id.0)
                .bind(name)
                .fetch_optional(&*self.db_pool)
                .await?;
        record
            .map(TaskGroup::try_from)
            .transpose()
            .map_err(RepoError::Internal)
    }

    async fn list_by_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<TaskGroup>, RepoError> {
        let records: Vec<GroupRecord> =
            sqlx::query_as("SELECT * FROM groups WHERE workflow_id = $1 ORDER BY name")
                .bind(&workflow_id.0)
                .fetch_all(&*self.db_pool)
                .await?;
        records
            .into_iter()
            .map(|record| TaskGroup::try_from(record).map_err(RepoError::Internal))
            .collect()
    }

    async fn fetch_status(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
    ) -> Result<TaskGroupStatus, RepoError> {
        let row = sqlx::query("SELECT status FROM groups WHERE workflow_id = $1 AND name = $2")
            .bind(&workflow_id.0)
            .bind(name)
            .fetch_optional(&*self.db_pool)
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("Group {workflow_id}/{name}")))?;
        let status: String = row.get("status");
        TaskGroupStatus::from_str(&status)
            .map_err(|_| RepoError::Internal(format!("Invalid group status: {status}")))
    }

    async fn update_status(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
        status: TaskGroupStatus,
        now: DateTime<Utc>,
        message: &str,
        force_cancel: bool,
        scheduler_settings: Option<&SchedulerSettings>,
    ) -> Result<bool, RepoError> {
        let guard = group_transition_guard(status, force_cancel)
            .ok_or_else(|| RepoError::InvalidTransition(format!("{status} is not a group status")))?;

        let mut query = QueryBuilder::<Postgres>::new("UPDATE groups SET status = ");
        query.push_bind(status.to_string());
        if let Some(settings) = scheduler_settings {
            query.push(", scheduler_settings = ");
            query.push_bind(Json(settings.clone()));
        }
        if let Some(column) = guard.phase_column {
            query.push(format!(", {column} = "));
            query.push_bind(now);
        }
        if guard.sets_end_time && status.failed() && !message.is_empty() {
            query.push(", failure_message = ");
            query.push_bind(message);
        }
        query.push(" WHERE workflow_id = ");
        query.push_bind(&workflow_id.0);
        query.push(" AND name = ");
        query.push_bind(name);
        query.push(" AND status = ANY(");
        query.push_bind(crate::repo::status_names(guard.allowed_from));
        query.push(")");
        if let Some(column) = guard.phase_column {
            query.push(format!(" AND {column} IS NULL"));
        }

        let result = query.build().execute(&*self.db_pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_groups_waiting(&self, workflow_id: &WorkflowId) -> Result<bool, RepoError> {
        let mut tx = self.db_pool.begin().await?;
        let row = sqlx::query(
            "SELECT status, cancelled_by FROM workflows WHERE workflow_id = $1 FOR UPDATE",
        )
        .bind(&workflow_id.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RepoError::NotFound(format!("Workflow {workflow_id}")))?;

        let status: String = row.get("status");
        let cancelled_by: Option<String> = row.get("cancelled_by");
        let status = osmo_common::model::WorkflowStatus::from_str(&status)
            .map_err(|_| RepoError::Internal(format!("Invalid workflow status: {status}")))?;
        if status.finished() || cancelled_by.is_some() {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE groups SET status = $2 WHERE workflow_id = $1 AND status = $3")
            .bind(&workflow_id.0)
            .bind(TaskGroupStatus::Waiting.to_string())
            .bind(TaskGroupStatus::Submitting.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn remove_upstream(
        &self,
        workflow_id: &WorkflowId,
        downstream_name: &str,
        upstream_name: &str,
    ) -> Result<bool, RepoError> {
        // The membership predicate makes this write fire at most once per
        // edge; a replay matches no row and reports no transition.
        let row = sqlx::query(
            r#"
              UPDATE groups
              SET remaining_upstream = array_remove(remaining_upstream, $3)
              WHERE workflow_id = $1 AND name = $2 AND $3 = ANY(remaining_upstream)
              RETURNING remaining_upstream
            "#,
        )
        .bind(&workflow_id.0)
        .bind(downstream_name)
        .bind(upstream_name)
        .fetch_optional(&*self.db_pool)
        .await?;

        match row {
            Some(row) => {
                let remaining: Vec<String> = row.get("remaining_upstream");
                Ok(remaining.is_empty())
            }
            None => {
                let exists =
                    sqlx::query("SELECT 1 FROM groups WHERE workflow_id = $1 AND name = $2")
                        .bind(&workflow_id.0)
                        .bind(downstream_name)
                        .fetch_optional(&*self.db_pool)
                        .await?;
                if exists.is_none() {
                    return Err(RepoError::NotFound(format!(
                        "Group {workflow_id}/{downstream_name}"
                    )));
                }
                Ok(false)
            }
        }
    }

    async fn patch_cleaned_up(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
    ) -> Result<(bool, bool), RepoError> {
        let mut tx = self.db_pool.begin().await?;
        let flipped = sqlx::query(
            "UPDATE groups SET cleaned_up = TRUE WHERE workflow_id = $1 AND name = $2 AND cleaned_up = FALSE",
        )
        .bind(&workflow_id.0)
        .bind(name)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        let row = sqlx::query(
            "SELECT COUNT(*) AS remaining FROM groups WHERE workflow_id = $1 AND cleaned_up = FALSE",
        )
        .bind(&workflow_id.0)
        .fetch_one(&mut *tx)
        .await?;
        let remaining: i64 = row.get("remaining");
        tx.commit().await?;
        Ok((flipped, remaining == 0))
    }
}
