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

use crate::broker::streams::RedisLogStore;
use crate::broker::RedisBroker;
use crate::config::ControlPlaneConfig;
use crate::jobs::JobContext;
use crate::notify::LoggingNotifier;
use crate::renderer::DefaultPodSpecRenderer;
use crate::repo;
use crate::secrets::NoSecrets;
use crate::service::workflow::WorkflowService;
use crate::storage::FsStorageClient;
use anyhow::Context;
use osmo_common::redis::RedisPool;
use std::sync::Arc;

/// All long-lived wiring of one control-plane replica.
#[derive(Clone)]
pub struct Services {
    pub job_context: JobContext,
    pub workflow_service: Arc<WorkflowService>,
    pub broker: RedisBroker,
}

impl Services {
    pub async fn new(config: &ControlPlaneConfig) -> Result<Self, anyhow::Error> {
        let db_pool = Arc::new(
            repo::create_postgres_pool(&config.db)
                .await
                .context("DB pool creation")?,
        );
        repo::migrate(&db_pool).await.context("DB migration")?;

        let redis = RedisPool::configured(&config.redis)
            .await
            .context("Redis pool creation")?;
        let broker = RedisBroker::new(redis.clone());
        let logs = RedisLogStore::new(redis);

        let job_context = JobContext {
            workflows: Arc::new(repo::workflow::DbWorkflowRepo::new(db_pool.clone())),
            groups: Arc::new(repo::group::DbGroupRepo::new(db_pool.clone())),
            tasks: Arc::new(repo::task::DbTaskRepo::new(db_pool.clone())),
            backends: Arc::new(repo::backend::DbBackendRepo::new(db_pool.clone())),
            pools: Arc::new(repo::pool::DbPoolRepo::new(db_pool.clone())),
            resources: Arc::new(repo::resource::DbResourceRepo::new(db_pool.clone())),
            apps: Arc::new(repo::app::DbAppRepo::new(db_pool.clone())),
            broker: Arc::new(broker.clone()),
            logs: Arc::new(logs),
            storage: Arc::new(FsStorageClient::new(&config.storage.root)),
            renderer: Arc::new(DefaultPodSpecRenderer),
            secrets: Arc::new(NoSecrets),
            notifier: Arc::new(LoggingNotifier),
            settings: config.workflow.clone(),
        };
        let workflow_service = Arc::new(WorkflowService::new(job_context.clone()));

        Ok(Self {
            job_context,
            workflow_service,
            broker,
        })
    }
}
