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

//! Durable FIFO job queues over Redis.
//!
//! Producers LPUSH serialized [`Job`] envelopes; consumers BRPOPLPUSH into
//! a per-consumer processing list so an acked job can be LREM'd and a
//! crashed consumer's leftovers can be requeued on the next session start.
//! Dedup keys and retry counters are plain compare-and-set keys with TTL.

pub mod delayed;
pub mod streams;

use crate::jobs::{Job, QueueName};
use async_trait::async_trait;
use fred::interfaces::{KeysInterface, ListInterface, SortedSetsInterface};
use fred::types::{Expiration, SetOptions};
use osmo_common::redis::RedisPool;
use std::time::Duration;
use tracing::{debug, info};

pub const DELAYED_JOB_QUEUE: &str = "jobs:delayed";

/// How long dedup keys and retry counters outlive their first write.
pub const UNIQUE_JOB_TTL: Duration = Duration::from_secs(5 * 24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(String),
    #[error("Invalid job payload: {0}")]
    Codec(String),
}

impl From<fred::error::Error> for BrokerError {
    fn from(error: fred::error::Error) -> Self {
        BrokerError::Redis(error.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(error: serde_json::Error) -> Self {
        BrokerError::Codec(error.to_string())
    }
}

/// An in-flight job delivery; must be settled with `ack` or `reject`.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub job: Job,
    pub queue: QueueName,
    payload: String,
    consumer: String,
}

impl Delivery {
    pub fn new(job: Job, queue: QueueName, payload: String, consumer: String) -> Self {
        Self {
            job,
            queue,
            payload,
            consumer,
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, job: &Job) -> Result<(), BrokerError>;

    /// The job becomes visible for dequeue `delay` from now.
    async fn enqueue_delayed(&self, job: &Job, delay: Duration) -> Result<(), BrokerError>;

    /// Blocking pull with a bounded wait; `None` on timeout.
    async fn dequeue(
        &self,
        queue: &QueueName,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;

    /// First caller with a given `job_id` wins and gets `true`; later
    /// instances observe the stored uuid and get `false`.
    async fn dedup(
        &self,
        job_id: &str,
        job_uuid: &str,
        ttl: Duration,
    ) -> Result<bool, BrokerError>;

    async fn dedup_exists(&self, job_id: &str) -> Result<bool, BrokerError>;

    async fn retry_count(&self, job_id: &str) -> Result<u64, BrokerError>;

    /// Returns a crashed consumer's in-flight jobs to their queue.
    async fn requeue_orphans(
        &self,
        queue: &QueueName,
        consumer: &str,
    ) -> Result<u64, BrokerError>;
}

#[derive(Clone)]
pub struct RedisBroker {
    redis: RedisPool,
}

impl RedisBroker {
    pub fn new(redis: RedisPool) -> Self {
        Self { redis }
    }

    pub(crate) fn redis(&self) -> &RedisPool {
        &self.redis
    }

    fn processing_key(&self, queue: &QueueName, consumer: &str) -> String {
        self.redis.key(format!("{}:processing:{consumer}", queue.key()))
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, job: &Job) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(job)?;
        let queue_key = self.redis.key(job.queue().key());
        let _: i64 = self.redis.pool().lpush(queue_key, payload).await?;
        debug!(job_id = %job.job_id, job_type = %job.job_type(), "Enqueued job");
        Ok(())
    }

    async fn enqueue_delayed(&self, job: &Job, delay: Duration) -> Result<(), BrokerError> {
        let visible_at = chrono::Utc::now().timestamp_millis() as f64 + delay.as_millis() as f64;
        // Member layout: "<queue key>\n<payload>"; the monitor splits on the
        // first newline when moving due entries.
        let member = format!(
            "{}\n{}",
            self.redis.key(job.queue().key()),
            serde_json::to_string(job)?
        );
        let _: i64 = self
            .redis
            .pool()
            .zadd(
                self.redis.key(DELAYED_JOB_QUEUE),
                None,
                None,
                false,
                false,
                (visible_at, member),
            )
            .await?;
        info!(
            job_id = %job.job_id,
            delay_secs = delay.as_secs(),
            "Scheduled delayed job"
        );
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &QueueName,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let queue_key = self.redis.key(queue.key());
        let processing_key = self.processing_key(queue, consumer);
        let payload: Option<String> = self
            .redis
            .pool()
            .brpoplpush(queue_key, processing_key, timeout.as_secs_f64())
            .await?;
        match payload {
            None => Ok(None),
            Some(payload) => {
                let job: Job = serde_json::from_str(&payload)?;
                Ok(Some(Delivery {
                    job,
                    queue: queue.clone(),
                    payload,
                    consumer: consumer.to_string(),
                }))
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let processing_key = self.processing_key(&delivery.queue, &delivery.consumer);
        let _: i64 = self
            .redis
            .pool()
            .lrem(processing_key, 1, delivery.payload.clone())
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let processing_key = self.processing_key(&delivery.queue, &delivery.consumer);
        let _: i64 = self
            .redis
            .pool()
            .lrem(processing_key, 1, delivery.payload.clone())
            .await?;
        if requeue {
            // Back to the head so the retry is the next delivery.
            let queue_key = self.redis.key(delivery.queue.key());
            let _: i64 = self
                .redis
                .pool()
                .rpush(queue_key, delivery.payload.clone())
                .await?;
        }
        Ok(())
    }

    async fn dedup(
        &self,
        job_id: &str,
        job_uuid: &str,
        ttl: Duration,
    ) -> Result<bool, BrokerError> {
        let key = self.redis.key(format!("dedupe:{job_id}"));
        let _: () = self
            .redis
            .pool()
            .set(
                &key,
                job_uuid,
                Some(Expiration::EX(ttl.as_secs() as i64)),
                Some(SetOptions::NX),
                false,
            )
            .await?;
        let stored: Option<String> = self.redis.pool().get(&key).await?;
        Ok(stored.as_deref() == Some(job_uuid))
    }

    async fn dedup_exists(&self, job_id: &str) -> Result<bool, BrokerError> {
        let key = self.redis.key(format!("dedupe:{job_id}"));
        let exists: bool = self.redis.pool().exists(key).await?;
        Ok(exists)
    }

    async fn retry_count(&self, job_id: &str) -> Result<u64, BrokerError> {
        let key = self.redis.key(format!("retry:{job_id}"));
        let count: i64 = self.redis.pool().incr(&key).await?;
        let _: bool = self
            .redis
            .pool()
            .expire(&key, UNIQUE_JOB_TTL.as_secs() as i64, None)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn requeue_orphans(
        &self,
        queue: &QueueName,
        consumer: &str,
    ) -> Result<u64, BrokerError> {
        let queue_key = self.redis.key(queue.key());
        let processing_key = self.processing_key(queue, consumer);
        let mut moved = 0;
        loop {
            let payload: Option<String> = self
                .redis
                .pool()
                .rpoplpush(&processing_key, &queue_key)
                .await?;
            if payload.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            info!(queue = %queue.key(), consumer, moved, "Requeued orphaned deliveries");
        }
        Ok(moved)
    }
}
