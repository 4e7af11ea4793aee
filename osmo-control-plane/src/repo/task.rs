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

use crate::model::state::task_transition_guard;
use crate::model::{Task, TaskInfo};
use crate::repo::RepoError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use osmo_common::model::{TaskDbKey, TaskGroupStatus, TaskUuid, WorkflowId, WorkflowUuid};
use sqlx::types::Json;
use sqlx::{Pool, Postgres, QueryBuilder};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct TaskRow {
    pub workflow_id: String,
    pub workflow_uuid: uuid::Uuid,
    pub name: String,
    pub group_name: String,
    pub task_uuid: uuid::Uuid,
    pub task_db_key: uuid::Uuid,
    pub retry_id: i32,
    pub status: String,
    pub lead: bool,
    pub exit_code: Option<i32>,
    pub exit_actions: Json<BTreeMap<String, String>>,
    pub failure_message: Option<String>,
    pub pod_name: String,
    pub node_name: Option<String>,
    pub pod_ip: Option<String>,
    pub submitted_by: String,
    pub processing_start_time: Option<DateTime<Utc>>,
    pub scheduling_start_time: Option<DateTime<Utc>>,
    pub initializing_start_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

const TASK_COLUMNS: &str = r#"
    t.workflow_id, w.workflow_uuid, t.name, t.group_name, t.task_uuid, t.task_db_key,
    t.retry_id, t.status, t.lead, t.exit_code, t.exit_actions, t.failure_message,
    t.pod_name, t.node_name, t.pod_ip, w.submitted_by, t.processing_start_time,
    t.scheduling_start_time, t.initializing_start_time, t.start_time, t.end_time
"#;

impl TryFrom<TaskRow> for TaskInfo {
    type Error = String;

    fn try_from(value: TaskRow) -> Result<Self, Self::Error> {
        let submitted_by = value.submitted_by.clone();
        Ok(TaskInfo {
            task: Task {
                workflow_id: WorkflowId(value.workflow_id),
                workflow_uuid: WorkflowUuid(value.workflow_uuid),
                name: value.name,
                group_name: value.group_name,
                task_uuid: TaskUuid(value.task_uuid),
                task_db_key: TaskDbKey(value.task_db_key),
                retry_id: value.retry_id,
                status: TaskGroupStatus::from_str(&value.status)
                    .map_err(|_| format!("Invalid task status: {}", value.status))?,
                lead: value.lead,
                exit_code: value.exit_code,
                exit_actions: value.exit_actions.0,
                failure_message: value.failure_message,
                pod_name: value.pod_name,
                node_name: value.node_name,
                pod_ip: value.pod_ip,
                processing_start_time: value.processing_start_time,
                scheduling_start_time: value.scheduling_start_time,
                initializing_start_time: value.initializing_start_time,
                start_time: value.start_time,
                end_time: value.end_time,
            },
            submitted_by,
        })
    }
}

/// Input of a new task row (retry 0 rows at submit, or a fresh retry row).
#[derive(Clone, Debug)]
pub struct NewTask {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub group_name: String,
    pub task_uuid: TaskUuid,
    pub task_db_key: TaskDbKey,
    pub retry_id: i32,
    pub status: TaskGroupStatus,
    pub lead: bool,
    pub exit_actions: BTreeMap<String, String>,
    pub pod_name: String,
    pub gpu_count: f64,
    pub cpu_count: f64,
    pub memory_count: f64,
    pub disk_count: f64,
}

#[async_trait]
pub trait TaskRepo: Send + Sync {
    /// Idempotent insert of one task retry row.
    async fn insert(&self, task: &NewTask) -> Result<(), RepoError>;

    /// Inserts the retry row and copies the previous retry's refresh token
    /// so the task-side credential file stays valid.
    async fn insert_retry(&self, task: &NewTask, previous: &TaskDbKey) -> Result<(), RepoError>;

    /// Fetches one retry; `None` retry means the latest one.
    async fn get(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
        retry_id: Option<i32>,
    ) -> Result<Option<Task>, RepoError>;

    async fn get_info_by_uuid(
        &self,
        workflow_uuid: &WorkflowUuid,
        task_uuid: &TaskUuid,
        retry_id: i32,
    ) -> Result<Option<TaskInfo>, RepoError>;

    /// The latest retry of every task in the group.
    async fn list_latest_by_group(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
    ) -> Result<Vec<Task>, RepoError>;

    /// Every retry of every task in the group.
    async fn list_all_by_group(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
    ) -> Result<Vec<Task>, RepoError>;

    /// Guarded status write (see [`crate::model::state`]).
    async fn update_status(
        &self,
        task_db_key: &TaskDbKey,
        status: TaskGroupStatus,
        now: DateTime<Utc>,
        message: &str,
        exit_code: Option<i32>,
    ) -> Result<bool, RepoError>;

    /// Flips every WAITING task of the group to PROCESSING.
    async fn mark_processing(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
    ) -> Result<(), RepoError>;

    async fn set_node_name(&self, task_db_key: &TaskDbKey, node: &str) -> Result<(), RepoError>;

    async fn set_pod_ip(&self, task_db_key: &TaskDbKey, pod_ip: &str) -> Result<(), RepoError>;

    /// Latest-retry tasks currently placed on the given node, in a
    /// backend-side status.
    async fn list_on_node(&self, backend: &str, node: &str) -> Result<Vec<TaskInfo>, RepoError>;

    /// Latest-retry tasks the backend should be running but did not report.
    async fn list_backend_orphans(
        &self,
        backend: &str,
        known_tasks: &[TaskUuid],
    ) -> Result<Vec<TaskInfo>, RepoError>;

    /// Rows for the pod name, one per retry, oldest first.
    async fn find_by_pod_name(&self, pod_name: &str) -> Result<Vec<TaskInfo>, RepoError>;
}

pub struct DbTaskRepo {
    db_pool: Arc<Pool<Postgres>>,
}

impl DbTaskRepo {
    pub fn new(db_pool: Arc<Pool<Postgres>>) -> Self {
        Self { db_pool }
    }

    async fn insert_with<'e, E>(executor: E, task: &NewTask) -> Result<(), RepoError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
              INSERT INTO tasks
                (workflow_id, name, group_name, task_uuid, task_db_key, retry_id, status,
                 lead, exit_actions, pod_name, gpu_count, cpu_count, memory_count, disk_count)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
              ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&task.workflow_id.0)
        .bind(&task.name)
        .bind(&task.group_name)
        .bind(task.task_uuid.0)
        .bind(task.task_db_key.0)
        .bind(task.retry_id)
        .bind(task.status.to_string())
        .bind(task.lead)
        .bind(Json(&task.exit_actions))
        .bind(&task.pod_name)
        .bind(task.gpu_count)
        .bind(task.cpu_count)
        .bind(task.memory_count)
        .bind(task.disk_count)
        .execute(executor)
        .await?;
        Ok(())
    }

    fn rows_to_infos(rows: Vec<TaskRow>) -> Result<Vec<TaskInfo>, RepoError> {
        rows.into_iter()
            .map(|row| TaskInfo::try_from(row).map_err(RepoError::Internal))
            .collect()
    }
}

#[async_trait]
impl TaskRepo for DbTaskRepo {
    async fn insert(&self, task: &NewTask) -> Result<(), RepoError> {
        Self::insert_with(&*self.db_pool, task).await
    }

    async fn insert_retry(&self, task: &NewTask, previous: &TaskDbKey) -> Result<(), RepoError> {
        let mut tx = self.db_pool.begin().await?;
        Self::insert_with(&mut *tx, task).await?;
        sqlx::query(
            r#"
              UPDATE tasks SET refresh_token = (
                  SELECT refresh_token FROM tasks WHERE task_db_key = $1
              ) WHERE task_db_key = $2
            "#,
        )
        .bind(previous.0)
        .bind(task.task_db_key.0)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
        retry_id: Option<i32>,
    ) -> Result<Option<Task>, RepoError> {
        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {TASK_COLUMNS} FROM tasks t JOIN workflows w ON t.workflow_id = w.workflow_id \
             WHERE t.workflow_id = "
        ));
        query.push_bind(&workflow_id.0);
        query.push(" AND t.name = ");
        query.push_bind(name);
        if let Some(retry_id) = retry_id {
            query.push(" AND t.retry_id = ");
            query.push_bind(retry_id);
        }
        query.push(" ORDER BY t.retry_id DESC LIMIT 1");

        let row: Option<TaskRow> = query.build_query_as().fetch_optional(&*self.db_pool).await?;
        row.map(|row| TaskInfo::try_from(row).map(|info| info.task))
            .transpose()
            .map_err(RepoError::Internal)
    }

    async fn get_info_by_uuid(
        &self,
        workflow_uuid: &WorkflowUuid,
        task_uuid: &TaskUuid,
        retry_id: i32,
    ) -> Result<Option<TaskInfo>, RepoError> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks t JOIN workflows w ON t.workflow_id = w.workflow_id \
             WHERE w.workflow_uuid = $1 AND t.task_uuid = $2 AND t.retry_id = $3"
        ))
        .bind(workflow_uuid.0)
        .bind(task_uuid.0)
        .bind(retry_id)
        .fetch_optional(&*self.db_pool)
        .await?;
        row.map(|row| TaskInfo::try_from(row).map_err(RepoError::Internal))
            .transpose()
    }

    async fn list_latest_by_group(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
    ) -> Result<Vec<Task>, RepoError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            r#"
              SELECT {TASK_COLUMNS} FROM tasks t
              JOIN workflows w ON t.workflow_id = w.workflow_id
              WHERE t.workflow_id = $1 AND t.group_name = $2
                AND t.retry_id = (
                    SELECT MAX(retry_id) FROM tasks
                    WHERE name = t.name AND workflow_id = $1 AND group_name = $2
                )
              ORDER BY t.name
            "#
        ))
        .bind(&workflow_id.0)
        .bind(group_name)
        .fetch_all(&*self.db_pool)
        .await?;
        Ok(Self::rows_to_infos(rows)?
            .into_iter()
            .map(|info| info.task)
            .collect())
    }

    async fn list_all_by_group(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
    ) -> Result<Vec<Task>, RepoError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            r#"
              SELECT {TASK_COLUMNS} FROM tasks t
              JOIN workflows w ON t.workflow_id = w.workflow_id
              WHERE t.workflow_id = $1 AND t.group_name = $2
              ORDER BY t.name, t.retry_id
            "#
        ))
        .bind(&workflow_id.0)
        .bind(group_name)
        .fetch_all(&*self.db_pool)
        .await?;
        Ok(Self::rows_to_infos(rows)?
            .into_iter()
            .map(|info| info.task)
            .collect())
    }

    async fn update_status(
        &self,
        task_db_key: &TaskDbKey,
        status: TaskGroupStatus,
        now: DateTime<Utc>,
        message: &str,
        exit_code: Option<i32>,
    ) -> Result<bool, RepoError> {
        let guard = task_transition_guard(status).ok_or_else(|| {
            RepoError::InvalidTransition(format!("{status} is not a task status"))
        })?;

        let mut query = QueryBuilder::<Postgres>::new("UPDATE tasks SET status = ");
        query.push_bind(status.to_string());
        if let Some(column) = guard.phase_column {
            query.push(format!(", {column} = "));
            query.push_bind(now);
        }
        if guard.sets_end_time {
            if let Some(code) = exit_code {
                query.push(", exit_code = ");
                query.push_bind(code);
            }
            if !message.is_empty() {
                query.push(", failure_message = ");
                query.push_bind(message);
            }
        }
        query.push(" WHERE task_db_key = ");
        query.push_bind(task_db_key.0);
        query.push(" AND status = ANY(");
        query.push_bind(crate::repo::status_names(guard.allowed_from));
        query.push(")");
        if let Some(column) = guard.phase_column {
            query.push(format!(" AND {column} IS NULL"));
        }

        let result = query.build().execute(&*self.db_pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_processing(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
    ) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE tasks SET status = $3 WHERE workflow_id = $1 AND group_name = $2 AND status = $4",
        )
        .bind(&workflow_id.0)
        .bind(group_name)
        .bind(TaskGroupStatus::Processing.to_string())
        .bind(TaskGroupStatus::Waiting.to_string())
        .execute(&*self.db_pool)
        .await?;
        Ok(())
    }

    async fn set_node_name(&self, task_db_key: &TaskDbKey, node: &str) -> Result<(), RepoError> {
        sqlx::query("UPDATE tasks SET node_name = $2 WHERE task_db_key = $1 AND node_name IS NULL")
            .bind(task_db_key.0)
            .bind(node)
            .execute(&*self.db_pool)
            .await?;
        Ok(())
    }

    async fn set_pod_ip(&self, task_db_key: &TaskDbKey, pod_ip: &str) -> Result<(), RepoError> {
        sqlx::query("UPDATE tasks SET pod_ip = $2 WHERE task_db_key = $1 AND pod_ip IS NULL")
            .bind(task_db_key.0)
            .bind(pod_ip)
            .execute(&*self.db_pool)
            .await?;
        Ok(())
    }

    async fn list_on_node(&self, backend: &str, node: &str) -> Result<Vec<TaskInfo>, RepoError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            r#"
              SELECT {TASK_COLUMNS} FROM tasks t
              JOIN workflows w ON t.workflow_id = w.workflow_id
              WHERE w.backend = $1 AND t.node_name = $2 AND t.status = ANY($3)
            "#
        ))
        .bind(backend)
        .bind(node)
        .bind(crate::repo::status_names(TaskGroupStatus::backend_states()))
        .fetch_all(&*self.db_pool)
        .await?;
        Self::rows_to_infos(rows)
    }

    async fn list_backend_orphans(
        &self,
        backend: &str,
        known_tasks: &[TaskUuid],
    ) -> Result<Vec<TaskInfo>, RepoError> {
        let known: Vec<uuid::Uuid> = known_tasks.iter().map(|uuid| uuid.0).collect();
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            r#"
              SELECT {TASK_COLUMNS} FROM tasks t
              JOIN workflows w ON t.workflow_id = w.workflow_id
              JOIN groups g ON t.workflow_id = g.workflow_id AND t.group_name = g.name
              WHERE w.backend = $1 AND g.status = ANY($2) AND t.task_uuid <> ALL($3)
            "#
        ))
        .bind(backend)
        .bind(crate::repo::status_names(TaskGroupStatus::backend_states()))
        .bind(known)
        .fetch_all(&*self.db_pool)
        .await?;
        Self::rows_to_infos(rows)
    }

    async fn find_by_pod_name(&self, pod_name: &str) -> Result<Vec<TaskInfo>, RepoError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            r#"
              SELECT {TASK_COLUMNS} FROM tasks t
              JOIN workflows w ON t.workflow_id = w.workflow_id
              WHERE t.pod_name = $1
              ORDER BY t.retry_id
            "#
        ))
        .bind(pod_name)
        .fetch_all(&*self.db_pool)
        .await?;
        Self::rows_to_infos(rows)
    }
}
