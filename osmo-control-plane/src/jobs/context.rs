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

use crate::broker::streams::LogStore;
use crate::broker::Broker;
use crate::config::WorkflowSettings;
use crate::notify::Notifier;
use crate::renderer::PodSpecRenderer;
use crate::repo::app::AppRepo;
use crate::repo::backend::BackendRepo;
use crate::repo::group::GroupRepo;
use crate::repo::pool::PoolRepo;
use crate::repo::resource::ResourceRepo;
use crate::repo::task::TaskRepo;
use crate::repo::workflow::WorkflowRepo;
use crate::secrets::SecretBox;
use crate::storage::StorageClient;
use std::sync::Arc;

/// Everything a job handler may touch. There is no other shared state:
/// handlers are plain functions over this context, and replicas coordinate
/// only through the store and the broker.
#[derive(Clone)]
pub struct JobContext {
    pub workflows: Arc<dyn WorkflowRepo>,
    pub groups: Arc<dyn GroupRepo>,
    pub tasks: Arc<dyn TaskRepo>,
    pub backends: Arc<dyn BackendRepo>,
    pub pools: Arc<dyn PoolRepo>,
    pub resources: Arc<dyn ResourceRepo>,
    pub apps: Arc<dyn AppRepo>,
    pub broker: Arc<dyn Broker>,
    pub logs: Arc<dyn LogStore>,
    pub storage: Arc<dyn StorageClient>,
    pub renderer: Arc<dyn PodSpecRenderer>,
    pub secrets: Arc<dyn SecretBox>,
    pub notifier: Arc<dyn Notifier>,
    pub settings: WorkflowSettings,
}
