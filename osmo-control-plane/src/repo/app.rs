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

use crate::model::AppStatus;
use crate::repo::RepoError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use std::sync::Arc;
use uuid::Uuid;

/// One stored version of a reusable workflow template ("app").
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct AppVersionRecord {
    pub app_uuid: Uuid,
    pub version: i32,
    pub owner: String,
    pub status: String,
    pub created_date: DateTime<Utc>,
}

#[async_trait]
pub trait AppRepo: Send + Sync {
    async fn insert(&self, app_uuid: &Uuid, version: i32, owner: &str) -> Result<(), RepoError>;

    async fn get(&self, app_uuid: &Uuid, version: i32)
        -> Result<Option<AppVersionRecord>, RepoError>;

    async fn set_status(
        &self,
        app_uuid: &Uuid,
        version: i32,
        status: AppStatus,
    ) -> Result<(), RepoError>;
}

pub struct DbAppRepo {
    db_pool: Arc<Pool<Postgres>>,
}

impl DbAppRepo {
    pub fn new(db_pool: Arc<Pool<Postgres>>) -> Self {
        Self { db_pool }
    }
}

fn status_name(status: AppStatus) -> &'static str {
    match status {
        AppStatus::Uploading => "UPLOADING",
        AppStatus::Ready => "READY",
        AppStatus::Deleted => "DELETED",
    }
}

#[async_trait]
impl AppRepo for DbAppRepo {
    async fn insert(&self, app_uuid: &Uuid, version: i32, owner: &str) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO apps (app_uuid, version, owner, status, created_date)
              VALUES ($1, $2, $3, $4, $5)
              ON CONFLICT DO NOTHING
            "#,
        )
        .bind(app_uuid)
        .bind(version)
        .bind(owner)
        .bind(status_name(AppStatus::Uploading))
        .bind(Utc::now())
        .execute(&*self.db_pool)
        .await?;
        Ok(())
    }

    async fn get(
        &self,
        app_uuid: &Uuid,
        version: i32,
    ) -> Result<Option<AppVersionRecord>, RepoError> {
        let record: Option<AppVersionRecord> =
            sqlx::query_as("SELECT * FROM apps WHERE app_uuid = $1 AND version = $2")
                .bind(app_uuid)
                .bind(version)
                .fetch_optional(&*self.db_pool)
                .await?;
        Ok(record)
    }

    async fn set_status(
        &self,
        app_uuid: &Uuid,
        version: i32,
        status: AppStatus,
    ) -> Result<(), RepoError> {
        sqlx::query("UPDATE apps SET status = $3 WHERE app_uuid = $1 AND version = $2")
            .bind(app_uuid)
            .bind(version)
            .bind(status_name(status))
            .execute(&*self.db_pool)
            .await?;
        Ok(())
    }
}
