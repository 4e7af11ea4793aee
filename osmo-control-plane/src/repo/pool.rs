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

use crate::model::{Pool as WorkPool, PoolResources};
use crate::repo::RepoError;
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{Pool, Postgres};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct PoolRecord {
    pub name: String,
    pub description: String,
    pub backend: String,
    pub enable_maintenance: bool,
    pub default_exec_timeout: Option<i64>,
    pub default_queue_timeout: Option<i64>,
    pub default_exit_actions: Json<BTreeMap<String, String>>,
    pub resources: Json<PoolResources>,
    pub platforms: Vec<String>,
}

impl From<PoolRecord> for WorkPool {
    fn from(value: PoolRecord) -> Self {
        WorkPool {
            name: value.name,
            description: value.description,
            backend: value.backend,
            enable_maintenance: value.enable_maintenance,
            default_exec_timeout: value
                .default_exec_timeout
                .map(|s| Duration::from_secs(s as u64)),
            default_queue_timeout: value
                .default_queue_timeout
                .map(|s| Duration::from_secs(s as u64)),
            default_exit_actions: value.default_exit_actions.0,
            resources: value.resources.0,
            platforms: value.platforms,
        }
    }
}

#[async_trait]
pub trait PoolRepo: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<WorkPool>, RepoError>;

    async fn list(&self) -> Result<Vec<WorkPool>, RepoError>;

    /// Operator-managed create-or-replace.
    async fn upsert(&self, pool: &WorkPool) -> Result<(), RepoError>;
}

pub struct DbPoolRepo {
    db_pool: Arc<Pool<Postgres>>,
}

impl DbPoolRepo {
    pub fn new(db_pool: Arc<Pool<Postgres>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl PoolRepo for DbPoolRepo {
    async fn get(&self, name: &str) -> Result<Option<WorkPool>, RepoError> {
        let record: Option<PoolRecord> = sqlx::query_as("SELECT * FROM pools WHERE name = $1")
            .bind(name)
            .fetch_optional(&*self.db_pool)
            .await?;
        Ok(record.map(WorkPool::from))
    }

    async fn list(&self) -> Result<Vec<WorkPool>, RepoError> {
        let records: Vec<PoolRecord> = sqlx::query_as("SELECT * FROM pools ORDER BY name")
            .fetch_all(&*self.db_pool)
            .await?;
        Ok(records.into_iter().map(WorkPool::from).collect())
    }

    async fn upsert(&self, pool: &WorkPool) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO pools
                (name, description, backend, enable_maintenance, default_exec_timeout,
                 default_queue_timeout, default_exit_actions, resources, platforms)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
              ON CONFLICT (name) DO UPDATE SET
                description = $2, backend = $3, enable_maintenance = $4,
                default_exec_timeout = $5, default_queue_timeout = $6,
                default_exit_actions = $7, resources = $8, platforms = $9
            "#,
        )
        .bind(&pool.name)
        .bind(&pool.description)
        .bind(&pool.backend)
        .bind(pool.enable_maintenance)
        .bind(pool.default_exec_timeout.map(|d| d.as_secs() as i64))
        .bind(pool.default_queue_timeout.map(|d| d.as_secs() as i64))
        .bind(Json(&pool.default_exit_actions))
        .bind(Json(&pool.resources))
        .bind(&pool.platforms)
        .execute(&*self.db_pool)
        .await?;
        Ok(())
    }
}
