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

use crate::model::Workflow;
use crate::repo::RepoError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use osmo_common::model::{WorkflowId, WorkflowPriority, WorkflowStatus, WorkflowUuid};
use sqlx::{Pool, Postgres, QueryBuilder};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct WorkflowRecord {
    pub workflow_id: String,
    pub workflow_uuid: Uuid,
    pub submitted_by: String,
    pub cancelled_by: Option<String>,
    pub pool: String,
    pub backend: String,
    pub priority: String,
    pub status: String,
    pub submit_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exec_timeout: Option<i64>,
    pub queue_timeout: Option<i64>,
    pub logs: String,
    pub events: String,
    pub failure_message: Option<String>,
    pub parent_workflow_id: Option<String>,
    pub app_uuid: Option<Uuid>,
    pub app_version: Option<i32>,
    pub plugins: serde_json::Value,
}

impl TryFrom<WorkflowRecord> for Workflow {
    type Error = String;

    fn try_from(value: WorkflowRecord) -> Result<Self, Self::Error> {
        Ok(Workflow {
            workflow_id: WorkflowId(value.workflow_id),
            workflow_uuid: WorkflowUuid(value.workflow_uuid),
            user: value.submitted_by,
            pool: value.pool,
            backend: value.backend,
            priority: WorkflowPriority::from_str(&value.priority)
                .map_err(|_| format!("Invalid priority: {}", value.priority))?,
            status: WorkflowStatus::from_str(&value.status)
                .map_err(|_| format!("Invalid workflow status: {}", value.status))?,
            submit_time: value.submit_time,
            start_time: value.start_time,
            end_time: value.end_time,
            exec_timeout: value.exec_timeout.map(|s| Duration::from_secs(s as u64)),
            queue_timeout: value.queue_timeout.map(|s| Duration::from_secs(s as u64)),
            logs: value.logs,
            events: value.events,
            failure_message: value.failure_message,
            cancelled_by: value.cancelled_by,
            parent_workflow_id: value.parent_workflow_id.map(WorkflowId),
            app_uuid: value.app_uuid,
            app_version: value.app_version,
            plugins: value.plugins,
        })
    }
}

impl From<&Workflow> for WorkflowRecord {
    fn from(value: &Workflow) -> Self {
        WorkflowRecord {
            workflow_id: value.workflow_id.0.clone(),
            workflow_uuid: value.workflow_uuid.0,
            submitted_by: value.user.clone(),
            cancelled_by: value.cancelled_by.clone(),
            pool: value.pool.clone(),
            backend: value.backend.clone(),
            priority: value.priority.to_string(),
            status: value.status.to_string(),
            submit_time: value.submit_time,
            start_time: value.start_time,
            end_time: value.end_time,
            exec_timeout: value.exec_timeout.map(|d| d.as_secs() as i64),
            queue_timeout: value.queue_timeout.map(|d| d.as_secs() as i64),
            logs: value.logs.clone(),
            events: value.events.clone(),
            failure_message: value.failure_message.clone(),
            parent_workflow_id: value.parent_workflow_id.as_ref().map(|id| id.0.clone()),
            app_uuid: value.app_uuid,
            app_version: value.app_version,
            plugins: value.plugins.clone(),
        }
    }
}

#[async_trait]
pub trait WorkflowRepo: Send + Sync {
    /// Idempotent insert; a replayed submission leaves the first row.
    async fn insert(&self, workflow: &Workflow) -> Result<(), RepoError>;

    async fn get(&self, workflow_id: &WorkflowId) -> Result<Option<Workflow>, RepoError>;

    async fn get_by_uuid(&self, workflow_uuid: &WorkflowUuid)
        -> Result<Option<Workflow>, RepoError>;

    /// Guarded status write: terminal statuses set `end_time` once, a
    /// RUNNING write sets `start_time` once, and nothing is written after
    /// the workflow finished.
    async fn update_status(
        &self,
        workflow_id: &WorkflowId,
        status: WorkflowStatus,
        now: DateTime<Utc>,
        failure_message: Option<&str>,
        canceled_by: Option<&str>,
    ) -> Result<bool, RepoError>;

    async fn set_cancelled_by(&self, workflow_id: &WorkflowId, user: &str)
        -> Result<(), RepoError>;

    /// Operator-facing timeout mutation; check jobs re-read these.
    async fn set_timeouts(
        &self,
        workflow_id: &WorkflowId,
        queue_timeout: Option<Duration>,
        exec_timeout: Option<Duration>,
    ) -> Result<(), RepoError>;

    /// Points `logs`/`events` at their archived object-storage locations.
    async fn set_log_locations(
        &self,
        workflow_id: &WorkflowId,
        logs: &str,
        events: &str,
    ) -> Result<(), RepoError>;
}

pub struct DbWorkflowRepo {
    db_pool: Arc<Pool<Postgres>>,
}

impl DbWorkflowRepo {
    pub fn new(db_pool: Arc<Pool<Postgres>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl WorkflowRepo for DbWorkflowRepo {
    async fn insert(&self, workflow: &Workflow) -> Result<(), RepoError> {
        let record = WorkflowRecord::from(workflow);
        sqlx::query(
            r#"
              INSERT INTO workflows
                (workflow_id, workflow_uuid, submitted_by, cancelled_by, pool, backend,
                 priority, status, submit_time, start_time, end_time, exec_timeout,
                 queue_timeout, logs, events, failure_message, parent_workflow_id,
                 app_uuid, app_version, plugins)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                 $17, $18, $19, $20)
              ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&record.workflow_id)
        .bind(record.workflow_uuid)
        .bind(&record.submitted_by)
        .bind(&record.cancelled_by)
        .bind(&record.pool)
        .bind(&record.backend)
        .bind(&record.priority)
        .bind(&record.status)
        .bind(record.submit_time)
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(record.exec_timeout)
        .bind(record.queue_timeout)
        .bind(&record.logs)
        .bind(&record.events)
        .bind(&record.failure_message)
        .bind(&record.parent_workflow_id)
        .bind(record.app_uuid)
        .bind(record.app_version)
        .bind(&record.plugins)
        .execute(&*self.db_pool)
        .await?;
        Ok(())
    }

    async fn get(&self, workflow_id: &WorkflowId) -> Result<Option<Workflow>, RepoError> {
        let record: Option<WorkflowRecord> =
            sqlx::query_as("SELECT * FROM workflows WHERE workflow_id = $1")
                .bind(&workflow_id.0)
                .fetch_optional(&*self.db_pool)
                .await?;
        record
            .map(Workflow::try_from)
            .transpose()
            .map_err(RepoError::Internal)
    }

    async fn get_by_uuid(
        &self,
        workflow_uuid: &WorkflowUuid,
    ) -> Result<Option<Workflow>, RepoError> {
        let record: Option<WorkflowRecord> =
            sqlx::query_as("SELECT * FROM workflows WHERE workflow_uuid = $1")
                .bind(workflow_uuid.0)
                .fetch_optional(&*self.db_pool)
                .await?;
        record
            .map(Workflow::try_from)
            .transpose()
            .map_err(RepoError::Internal)
    }

    async fn update_status(
        &self,
        workflow_id: &WorkflowId,
        status: WorkflowStatus,
        now: DateTime<Utc>,
        failure_message: Option<&str>,
        canceled_by: Option<&str>,
    ) -> Result<bool, RepoError> {
        let mut query = QueryBuilder::<Postgres>::new("UPDATE workflows SET status = ");
        query.push_bind(status.to_string());
        if status == WorkflowStatus::Running {
            query.push(", start_time = COALESCE(start_time, ");
            query.push_bind(now);
            query.push(")");
        }
        if status.finished() {
            query.push(", end_time = ");
            query.push_bind(now);
        }
        if let Some(message) = failure_message {
            query.push(", failure_message = ");
            query.push_bind(message);
        }
        if let Some(user) = canceled_by {
            query.push(", cancelled_by = COALESCE(cancelled_by, ");
            query.push_bind(user);
            query.push(")");
        }
        query.push(" WHERE workflow_id = ");
        query.push_bind(&workflow_id.0);
        query.push(" AND end_time IS NULL");

        let result = query.build().execute(&*self.db_pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_cancelled_by(
        &self,
        workflow_id: &WorkflowId,
        user: &str,
    ) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE workflows SET cancelled_by = $2 WHERE workflow_id = $1 AND cancelled_by IS NULL",
        )
        .bind(&workflow_id.0)
        .bind(user)
        .execute(&*self.db_pool)
        .await?;
        Ok(())
    }

    async fn set_timeouts(
        &self,
        workflow_id: &WorkflowId,
        queue_timeout: Option<Duration>,
        exec_timeout: Option<Duration>,
    ) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              UPDATE workflows
              SET queue_timeout = COALESCE($2, queue_timeout),
                  exec_timeout = COALESCE($3, exec_timeout)
              WHERE workflow_id = $1
            "#,
        )
        .bind(&workflow_id.0)
        .bind(queue_timeout.map(|d| d.as_secs() as i64))
        .bind(exec_timeout.map(|d| d.as_secs() as i64))
        .execute(&*self.db_pool)
        .await?;
        Ok(())
    }

    async fn set_log_locations(
        &self,
        workflow_id: &WorkflowId,
        logs: &str,
        events: &str,
    ) -> Result<(), RepoError> {
        sqlx::query("UPDATE workflows SET logs = $2, events = $3 WHERE workflow_id = $1")
            .bind(&workflow_id.0)
            .bind(logs)
            .bind(events)
            .execute(&*self.db_pool)
            .await?;
        Ok(())
    }
}
