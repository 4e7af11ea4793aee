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

pub mod app;
pub mod backend;
pub mod group;
pub mod pool;
pub mod resource;
pub mod task;
pub mod workflow;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Executor, Pool, Postgres};
use tracing::info;

use osmo_common::config::DbPostgresConfig;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),
    #[error("Database error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(error: sqlx::Error) -> Self {
        RepoError::Internal(error.to_string())
    }
}

fn pg_connect_options(config: &DbPostgresConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(config.host.as_str())
        .port(config.port)
        .database(config.database.as_str())
        .username(config.username.as_str())
        .password(config.password.as_str())
}

pub async fn create_postgres_pool(
    config: &DbPostgresConfig,
) -> Result<Pool<Postgres>, sqlx::Error> {
    info!(
        "DB pool: postgresql://{}:{}/{}",
        config.host, config.port, config.database
    );
    let conn_options = pg_connect_options(config);
    let schema = config.schema.clone();

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .after_connect(move |conn, _meta| {
            let schema = schema.clone();
            Box::pin(async move {
                if let Some(schema) = schema {
                    let sql = format!("SET SCHEMA '{schema}';");
                    conn.execute(sqlx::query(&sql)).await?;
                }
                Ok(())
            })
        })
        .connect_with(conn_options)
        .await
}

pub async fn migrate(pool: &Pool<Postgres>) -> Result<(), sqlx::migrate::MigrateError> {
    info!("Running DB migrations");
    sqlx::migrate!("./db/migration/postgres").run(pool).await
}

pub(crate) fn status_names(statuses: &[osmo_common::model::TaskGroupStatus]) -> Vec<String> {
    statuses.iter().map(ToString::to_string).collect()
}
