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

//! The frontend worker: drains the frontend queue and executes job
//! handlers. Safe to scale horizontally; the broker's dedup keys and the
//! store's guarded updates carry all the coordination.

use crate::broker::UNIQUE_JOB_TTL;
use crate::jobs::{self, JobContext, JobResult, QueueName};
use crate::metrics;
use crate::progress::ProgressWriter;
use osmo_common::model::JobStatus;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct FrontendWorker {
    ctx: JobContext,
    consumer_id: String,
    dequeue_timeout: Duration,
    progress: ProgressWriter,
    shutdown: CancellationToken,
}

impl FrontendWorker {
    pub fn new(
        ctx: JobContext,
        index: usize,
        dequeue_timeout: Duration,
        progress: ProgressWriter,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            // Stable per replica slot, so leftovers of a crashed run are
            // reclaimed on restart.
            consumer_id: format!("frontend-{index}"),
            dequeue_timeout,
            progress,
            shutdown,
        }
    }

    pub async fn run(self) {
        let queue = QueueName::Frontend;
        if let Err(err) = self
            .ctx
            .broker
            .requeue_orphans(&queue, &self.consumer_id)
            .await
        {
            warn!(error = %err, "Failed to requeue orphaned jobs");
        }

        info!(consumer = %self.consumer_id, "Frontend worker started");
        loop {
            self.progress.report_progress().await;
            let delivery = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                delivery = self.ctx.broker.dequeue(&queue, &self.consumer_id, self.dequeue_timeout) => delivery,
            };
            match delivery {
                Ok(Some(delivery)) => self.handle(delivery).await,
                Ok(None) => {}
                Err(err) => {
                    error!(error = %err, "Dequeue failed; backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!(consumer = %self.consumer_id, "Frontend worker stopped");
    }

    async fn handle(&self, delivery: crate::broker::Delivery) {
        let job = delivery.job.clone();
        let started = Instant::now();

        let accepted = match self
            .ctx
            .broker
            .dedup(&job.job_id, &job.job_uuid, UNIQUE_JOB_TTL)
            .await
        {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(job_id = %job.job_id, error = %err, "Dedup check failed; requeueing");
                let _ = self.ctx.broker.reject(&delivery, true).await;
                return;
            }
        };
        if !accepted {
            info!(job_id = %job.job_id, "Skipping job because it is a duplicate");
            let _ = self.ctx.broker.ack(&delivery).await;
            return;
        }

        let result = match self.ctx.broker.retry_count(&job.job_id).await {
            Ok(count) if count > self.ctx.settings.max_retry_per_job => {
                let message = format!(
                    "Job {} failed after retrying {} times",
                    job.job_id, self.ctx.settings.max_retry_per_job
                );
                info!(job_id = %job.job_id, "{message}");
                JobResult::no_retry(message)
            }
            Ok(_) => match jobs::execute(&job, &self.ctx).await {
                Ok(result) => result,
                Err(err) if err.retryable() => JobResult::retry(err.to_string()),
                Err(err) => JobResult::no_retry(err.to_string()),
            },
            Err(err) => JobResult::retry(err.to_string()),
        };

        let settle = match result.status {
            JobStatus::Success => self.ctx.broker.ack(&delivery).await,
            JobStatus::FailedRetry => self.ctx.broker.reject(&delivery, true).await,
            JobStatus::FailedNoRetry => {
                jobs::handle_failure(&job, &self.ctx, &result.message).await;
                self.ctx.broker.ack(&delivery).await
            }
        };
        if let Err(err) = settle {
            // The delivery stays on the processing list and is reclaimed
            // by requeue_orphans after the broker comes back.
            error!(job_id = %job.job_id, error = %err, "Failed to settle delivery");
        }

        metrics::record_job(
            job.job_type(),
            &format!("{:?}", result.status),
            started.elapsed(),
        );
        info!(
            job_id = %job.job_id,
            job_type = %job.job_type(),
            status = ?result.status,
            message = %result.message,
            "Completed job"
        );
    }
}
