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

use crate::model::{Backend, NodeConditions, SchedulerSettings};
use crate::repo::RepoError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{Pool, Postgres};
use std::sync::Arc;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct BackendRecord {
    pub name: String,
    pub description: String,
    pub version: String,
    pub k8s_uid: String,
    pub k8s_namespace: String,
    pub scheduler_settings: Json<SchedulerSettings>,
    pub node_conditions: Json<NodeConditions>,
    pub last_heartbeat: DateTime<Utc>,
    pub created_date: DateTime<Utc>,
    pub router_address: String,
}

impl From<BackendRecord> for Backend {
    fn from(value: BackendRecord) -> Self {
        Backend {
            name: value.name,
            description: value.description,
            version: value.version,
            k8s_uid: value.k8s_uid,
            k8s_namespace: value.k8s_namespace,
            scheduler_settings: value.scheduler_settings.0,
            node_conditions: value.node_conditions.0,
            last_heartbeat: value.last_heartbeat,
            created_date: value.created_date,
            router_address: value.router_address,
        }
    }
}

/// Registration payload from an agent INIT frame.
#[derive(Clone, Debug)]
pub struct BackendRegistration {
    pub name: String,
    pub k8s_uid: String,
    pub k8s_namespace: String,
    pub version: String,
    pub node_condition_prefix: String,
}

#[async_trait]
pub trait BackendRepo: Send + Sync {
    /// Creates the backend on first INIT, refreshes mutable fields on
    /// reconnect. A `k8s_uid` mismatch is a conflict: the name is already
    /// paired with a different cluster.
    async fn register_init(&self, registration: &BackendRegistration)
        -> Result<Backend, RepoError>;

    async fn get(&self, name: &str) -> Result<Option<Backend>, RepoError>;

    async fn list(&self) -> Result<Vec<Backend>, RepoError>;

    async fn update_heartbeat(&self, name: &str, time: DateTime<Utc>) -> Result<(), RepoError>;
}

pub struct DbBackendRepo {
    db_pool: Arc<Pool<Postgres>>,
}

impl DbBackendRepo {
    pub fn new(db_pool: Arc<Pool<Postgres>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl BackendRepo for DbBackendRepo {
    async fn register_init(
        &self,
        registration: &BackendRegistration,
    ) -> Result<Backend, RepoError> {
        let mut tx = self.db_pool.begin().await?;
        let existing: Option<BackendRecord> =
            sqlx::query_as("SELECT * FROM backends WHERE name = $1 FOR UPDATE")
                .bind(&registration.name)
                .fetch_optional(&mut *tx)
                .await?;

        let now = Utc::now();
        match existing {
            None => {
                let mut node_conditions = NodeConditions::default();
                node_conditions.prefix = registration.node_condition_prefix.clone();
                sqlx::query(
                    r#"
                      INSERT INTO backends
                        (name, description, version, k8s_uid, k8s_namespace,
                         scheduler_settings, node_conditions, last_heartbeat, created_date,
                         router_address)
                      VALUES ($1, '', $2, $3, $4, $5, $6, $7, $7, '')
                    "#,
                )
                .bind(&registration.name)
                .bind(&registration.version)
                .bind(&registration.k8s_uid)
                .bind(&registration.k8s_namespace)
                .bind(Json(SchedulerSettings::default()))
                .bind(Json(&node_conditions))
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            Some(record) => {
                if record.k8s_uid != registration.k8s_uid {
                    tx.rollback().await?;
                    return Err(RepoError::Conflict(format!(
                        "Backend {} is already being used by a different cluster",
                        registration.name
                    )));
                }
                let mut node_conditions = record.node_conditions.0;
                node_conditions.prefix = registration.node_condition_prefix.clone();
                sqlx::query(
                    r#"
                      UPDATE backends
                      SET k8s_namespace = $2, version = $3, node_conditions = $4,
                          last_heartbeat = $5
                      WHERE name = $1
                    "#,
                )
                .bind(&registration.name)
                .bind(&registration.k8s_namespace)
                .bind(&registration.version)
                .bind(Json(&node_conditions))
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        let record: BackendRecord = sqlx::query_as("SELECT * FROM backends WHERE name = $1")
            .bind(&registration.name)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(record.into())
    }

    async fn get(&self, name: &str) -> Result<Option<Backend>, RepoError> {
        let record: Option<BackendRecord> =
            sqlx::query_as("SELECT * FROM backends WHERE name = $1")
                .bind(name)
                .fetch_optional(&*self.db_pool)
                .await?;
        Ok(record.map(Backend::from))
    }

    async fn list(&self) -> Result<Vec<Backend>, RepoError> {
        let records: Vec<BackendRecord> =
            sqlx::query_as("SELECT * FROM backends ORDER BY name")
                .fetch_all(&*self.db_pool)
                .await?;
        Ok(records.into_iter().map(Backend::from).collect())
    }

    async fn update_heartbeat(&self, name: &str, time: DateTime<Utc>) -> Result<(), RepoError> {
        sqlx::query("UPDATE backends SET last_heartbeat = $2 WHERE name = $1")
            .bind(name)
            .bind(time)
            .execute(&*self.db_pool)
            .await?;
        Ok(())
    }
}
