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
use async_trait::async_trait;
use osmo_common::model::WorkflowStatus;
use tracing::info;

/// Sink for terminal-workflow notifications (mail, chat, webhooks).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn workflow_finished(&self, workflow: &Workflow, status: WorkflowStatus);
}

pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn workflow_finished(&self, workflow: &Workflow, status: WorkflowStatus) {
        info!(
            workflow_id = %workflow.workflow_id,
            workflow_uuid = %workflow.workflow_uuid,
            user = %workflow.user,
            %status,
            "Workflow finished"
        );
    }
}
