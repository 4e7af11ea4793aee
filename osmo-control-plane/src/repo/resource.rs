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

use crate::model::ResourceNode;
use crate::repo::RepoError;
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct ResourceRecord {
    pub name: String,
    pub backend: String,
    pub available: bool,
    pub allocatable: Json<BTreeMap<String, String>>,
    pub labels: Json<BTreeMap<String, String>>,
    pub usage: Json<BTreeMap<String, String>>,
    pub non_workflow_usage: Json<BTreeMap<String, String>>,
    pub taints: Json<Vec<serde_json::Value>>,
    pub conditions: Vec<String>,
}

impl From<ResourceRecord> for ResourceNode {
    fn from(value: ResourceRecord) -> Self {
        ResourceNode {
            name: value.name,
            backend: value.backend,
            available: value.available,
            allocatable: value.allocatable.0,
            labels: value.labels.0,
            usage: value.usage.0,
            non_workflow_usage: value.non_workflow_usage.0,
            taints: value.taints.0,
            conditions: value.conditions,
        }
    }
}

#[async_trait]
pub trait ResourceRepo: Send + Sync {
    /// Node registration/update from a RESOURCE message. Usage fields are
    /// only initialized on first sight; RESOURCE_USAGE owns them afterwards.
    async fn upsert(&self, node: &ResourceNode) -> Result<(), RepoError>;

    async fn update_usage(
        &self,
        name: &str,
        backend: &str,
        usage: &BTreeMap<String, String>,
        non_workflow_usage: &BTreeMap<String, String>,
    ) -> Result<(), RepoError>;

    async fn delete(&self, name: &str, backend: &str) -> Result<(), RepoError>;

    async fn list_names(&self, backend: &str) -> Result<Vec<String>, RepoError>;

    /// Removes every node of the backend that is not in `known`.
    async fn delete_stale(&self, backend: &str, known: &[String]) -> Result<u64, RepoError>;

    async fn list(&self, backend: &str) -> Result<Vec<ResourceNode>, RepoError>;
}

pub struct DbResourceRepo {
    db_pool: Arc<Pool<Postgres>>,
}

impl DbResourceRepo {
    pub fn new(db_pool: Arc<Pool<Postgres>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl ResourceRepo for DbResourceRepo {
    async fn upsert(&self, node: &ResourceNode) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO resources
                (name, backend, available, allocatable, labels, usage, non_workflow_usage,
                 taints, conditions)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
              ON CONFLICT (name, backend) DO UPDATE SET
                available = $3, allocatable = $4, labels = $5, taints = $8, conditions = $9
            "#,
        )
        .bind(&node.name)
        .bind(&node.backend)
        .bind(node.available)
        .bind(Json(&node.allocatable))
        .bind(Json(&node.labels))
        .bind(Json(&node.usage))
        .bind(Json(&node.non_workflow_usage))
        .bind(Json(&node.taints))
        .bind(&node.conditions)
        .execute(&*self.db_pool)
        .await?;
        Ok(())
    }

    async fn update_usage(
        &self,
        name: &str,
        backend: &str,
        usage: &BTreeMap<String, String>,
        non_workflow_usage: &BTreeMap<String, String>,
    ) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO resources (name, backend, available, allocatable, labels, usage,
                                     non_workflow_usage, taints, conditions)
              VALUES ($1, $2, TRUE, '{}', '{}', $3, $4, '[]', '{}')
              ON CONFLICT (name, backend) DO UPDATE SET
                usage = $3, non_workflow_usage = $4
            "#,
        )
        .bind(name)
        .bind(backend)
        .bind(Json(usage))
        .bind(Json(non_workflow_usage))
        .execute(&*self.db_pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, name: &str, backend: &str) -> Result<(), RepoError> {
        sqlx::query("DELETE FROM resources WHERE name = $1 AND backend = $2")
            .bind(name)
            .bind(backend)
            .execute(&*self.db_pool)
            .await?;
        Ok(())
    }

    async fn list_names(&self, backend: &str) -> Result<Vec<String>, RepoError> {
        let rows = sqlx::query("SELECT name FROM resources WHERE backend = $1")
            .bind(backend)
            .fetch_all(&*self.db_pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("name")).collect())
    }

    async fn delete_stale(&self, backend: &str, known: &[String]) -> Result<u64, RepoError> {
        let result =
            sqlx::query("DELETE FROM resources WHERE backend = $1 AND name <> ALL($2)")
                .bind(backend)
                .bind(known)
                .execute(&*self.db_pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn list(&self, backend: &str) -> Result<Vec<ResourceNode>, RepoError> {
        let records: Vec<ResourceRecord> =
            sqlx::query_as("SELECT * FROM resources WHERE backend = $1 ORDER BY name")
                .bind(backend)
                .fetch_all(&*self.db_pool)
                .await?;
        Ok(records.into_iter().map(ResourceNode::from).collect())
    }
}
