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

//! The shared in-memory side store: live log/event streams, group
//! barriers, per-task action queues and stale-event timestamp tokens.
//! Everything here is message passing with TTLs, never a lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fred::interfaces::{KeysInterface, ListInterface, SetsInterface};
use osmo_common::model::{TaskUuid, WorkflowId, WorkflowUuid};
use osmo_common::redis::RedisPool;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on how long any live stream may linger in the side store.
pub const MAX_LOG_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub const GROUP_BARRIER_NAME: &str = "osmo-group-ready";

#[derive(Debug, thiserror::Error)]
pub enum LogStoreError {
    #[error("Redis error: {0}")]
    Redis(String),
    #[error("Invalid log entry: {0}")]
    Codec(String),
}

impl From<fred::error::Error> for LogStoreError {
    fn from(error: fred::error::Error) -> Self {
        LogStoreError::Redis(error.to_string())
    }
}

impl From<serde_json::Error> for LogStoreError {
    fn from(error: serde_json::Error) -> Self {
        LogStoreError::Codec(error.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IoType {
    Stdout,
    Stderr,
    Dump,
    OsmoCtrl,
    /// Terminator appended by workflow cleanup; readers stop here.
    EndFlag,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub io_type: IoType,
    pub source: String,
    pub retry_id: i32,
    pub text: String,
}

impl LogEntry {
    pub fn control(text: impl Into<String>) -> LogEntry {
        LogEntry {
            time: Utc::now(),
            io_type: IoType::OsmoCtrl,
            source: "OSMO".to_string(),
            retry_id: 0,
            text: text.into(),
        }
    }

    pub fn dump(retry_id: i32, text: impl Into<String>) -> LogEntry {
        LogEntry {
            time: Utc::now(),
            io_type: IoType::Dump,
            source: "OSMO".to_string(),
            retry_id,
            text: text.into(),
        }
    }

    pub fn end_flag() -> LogEntry {
        LogEntry {
            time: Utc::now(),
            io_type: IoType::EndFlag,
            source: String::new(),
            retry_id: 0,
            text: String::new(),
        }
    }
}

pub fn workflow_log_key(workflow_id: &WorkflowId) -> String {
    format!("{workflow_id}-logs")
}

pub fn workflow_event_key(workflow_uuid: &WorkflowUuid) -> String {
    format!("{workflow_uuid}-events")
}

pub fn task_log_key(workflow_id: &WorkflowId, task_name: &str, retry_id: i32) -> String {
    format!("{workflow_id}-{task_name}-{retry_id}-logs")
}

pub fn error_log_key(workflow_id: &WorkflowId, task_uuid: &TaskUuid, retry_id: i32) -> String {
    format!("{workflow_id}-{task_uuid}-{retry_id}-error-logs")
}

fn barrier_key(workflow_id: &WorkflowId, group_name: &str) -> String {
    format!("barrier:{workflow_id}:{group_name}:{GROUP_BARRIER_NAME}")
}

fn action_queue_key(workflow_id: &WorkflowId, task_name: &str, retry_id: i32) -> String {
    format!("actions:{workflow_id}:{task_name}:{retry_id}")
}

/// An entry pushed onto a task's action queue. The task-side controller
/// blocks on the queue and reacts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ActionToken {
    /// All barrier members arrived; start user code.
    Barrier,
    /// A peer rescheduled; restart from the beginning.
    Restart,
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(
        &self,
        key: &str,
        entry: &LogEntry,
        max_len: Option<u64>,
    ) -> Result<(), LogStoreError>;

    async fn read(&self, key: &str) -> Result<Vec<LogEntry>, LogStoreError>;

    async fn delete(&self, keys: &[String]) -> Result<(), LogStoreError>;

    async fn barrier_join(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
        member: &str,
        ttl: Duration,
    ) -> Result<(), LogStoreError>;

    async fn barrier_leave(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
        member: &str,
    ) -> Result<(), LogStoreError>;

    async fn barrier_clear(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
    ) -> Result<(), LogStoreError>;

    async fn barrier_members(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
    ) -> Result<Vec<String>, LogStoreError>;

    async fn push_action(
        &self,
        workflow_id: &WorkflowId,
        task_name: &str,
        retry_id: i32,
        action: &ActionToken,
        ttl: Duration,
    ) -> Result<(), LogStoreError>;

    /// Stale-event filtering token: the latest observed timestamp for a
    /// scope such as a task's pod conditions.
    async fn latest_timestamp(&self, token_key: &str) -> Result<Option<f64>, LogStoreError>;

    async fn set_latest_timestamp(
        &self,
        token_key: &str,
        timestamp: f64,
        ttl: Duration,
    ) -> Result<(), LogStoreError>;
}

#[derive(Clone)]
pub struct RedisLogStore {
    redis: RedisPool,
}

impl RedisLogStore {
    pub fn new(redis: RedisPool) -> Self {
        Self { redis }
    }

    async fn expire_nx(&self, key: &str, ttl: Duration) -> Result<(), LogStoreError> {
        let _: bool = self
            .redis
            .pool()
            .expire(
                key,
                ttl.as_secs() as i64,
                Some(fred::types::ExpireOptions::NX),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LogStore for RedisLogStore {
    async fn append(
        &self,
        key: &str,
        entry: &LogEntry,
        max_len: Option<u64>,
    ) -> Result<(), LogStoreError> {
        let key = self.redis.key(key);
        let payload = serde_json::to_string(entry)?;
        let _: i64 = self.redis.pool().rpush(&key, payload).await?;
        if let Some(max_len) = max_len {
            let _: () = self
                .redis
                .pool()
                .ltrim(&key, -(max_len as i64), -1)
                .await?;
        }
        self.expire_nx(&key, MAX_LOG_TTL).await
    }

    async fn read(&self, key: &str) -> Result<Vec<LogEntry>, LogStoreError> {
        let key = self.redis.key(key);
        let raw: Vec<String> = self.redis.pool().lrange(&key, 0, -1).await?;
        raw.iter()
            .map(|payload| serde_json::from_str(payload).map_err(LogStoreError::from))
            .collect()
    }

    async fn delete(&self, keys: &[String]) -> Result<(), LogStoreError> {
        // Batched so one cleanup cannot issue an unbounded DEL.
        for chunk in keys.chunks(1000) {
            let prefixed: Vec<String> = chunk.iter().map(|key| self.redis.key(key)).collect();
            let _: i64 = self.redis.pool().del(prefixed).await?;
        }
        Ok(())
    }

    async fn barrier_join(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
        member: &str,
        ttl: Duration,
    ) -> Result<(), LogStoreError> {
        let key = self.redis.key(barrier_key(workflow_id, group_name));
        let _: i64 = self.redis.pool().sadd(&key, member).await?;
        self.expire_nx(&key, ttl).await
    }

    async fn barrier_leave(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
        member: &str,
    ) -> Result<(), LogStoreError> {
        let key = self.redis.key(barrier_key(workflow_id, group_name));
        let _: i64 = self.redis.pool().srem(key, member).await?;
        Ok(())
    }

    async fn barrier_clear(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
    ) -> Result<(), LogStoreError> {
        let key = self.redis.key(barrier_key(workflow_id, group_name));
        let _: i64 = self.redis.pool().del(key).await?;
        Ok(())
    }

    async fn barrier_members(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
    ) -> Result<Vec<String>, LogStoreError> {
        let key = self.redis.key(barrier_key(workflow_id, group_name));
        let members: Vec<String> = self.redis.pool().smembers(key).await?;
        Ok(members)
    }

    async fn push_action(
        &self,
        workflow_id: &WorkflowId,
        task_name: &str,
        retry_id: i32,
        action: &ActionToken,
        ttl: Duration,
    ) -> Result<(), LogStoreError> {
        let key = self
            .redis
            .key(action_queue_key(workflow_id, task_name, retry_id));
        let payload = serde_json::to_string(action)?;
        let _: i64 = self.redis.pool().lpush(&key, payload).await?;
        self.expire_nx(&key, ttl).await
    }

    async fn latest_timestamp(&self, token_key: &str) -> Result<Option<f64>, LogStoreError> {
        let key = self.redis.key(token_key);
        let value: Option<String> = self.redis.pool().get(key).await?;
        Ok(value.and_then(|value| value.parse().ok()))
    }

    async fn set_latest_timestamp(
        &self,
        token_key: &str,
        timestamp: f64,
        ttl: Duration,
    ) -> Result<(), LogStoreError> {
        let key = self.redis.key(token_key);
        let _: () = self
            .redis
            .pool()
            .set(&key, timestamp.to_string(), None, None, false)
            .await?;
        self.expire_nx(&key, ttl).await
    }
}
