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

use osmo_common::config::{ConfigLoader, DbPostgresConfig, RedisConfig};
use osmo_common::tracing::TracingConfig;
use osmo_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    pub tracing: TracingConfig,
    pub environment: String,
    pub http_port: u16,
    pub db: DbPostgresConfig,
    pub redis: RedisConfig,
    pub workers: WorkerConfig,
    pub agent: AgentConfig,
    pub workflow: WorkflowSettings,
    pub storage: StorageConfig,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("osmo-control-plane"),
            environment: "dev".to_string(),
            http_port: 8080,
            db: DbPostgresConfig::default(),
            redis: RedisConfig::default(),
            workers: WorkerConfig::default(),
            agent: AgentConfig::default(),
            workflow: WorkflowSettings::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl SafeDisplay for ControlPlaneConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "environment: {}", self.environment);
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "DB:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(&mut result, "Redis:");
        let _ = writeln!(&mut result, "{}", self.redis.to_safe_string_indented());
        let _ = writeln!(&mut result, "workers:");
        let _ = writeln!(&mut result, "{}", self.workers.to_safe_string_indented());
        let _ = writeln!(&mut result, "agent:");
        let _ = writeln!(&mut result, "{}", self.agent.to_safe_string_indented());
        let _ = writeln!(&mut result, "workflow:");
        let _ = writeln!(&mut result, "{}", self.workflow.to_safe_string_indented());
        let _ = writeln!(&mut result, "storage:");
        let _ = writeln!(&mut result, "{}", self.storage.to_safe_string_indented());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub count: usize,
    pub progress_file: String,
    #[serde(with = "humantime_serde")]
    pub dequeue_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub delayed_poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            progress_file: "".to_string(),
            dequeue_timeout: Duration::from_secs(5),
            delayed_poll_interval: Duration::from_secs(1),
        }
    }
}

impl SafeDisplay for WorkerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "count: {}", self.count);
        let _ = writeln!(&mut result, "progress file: {}", self.progress_file);
        let _ = writeln!(
            &mut result,
            "dequeue timeout: {:?}",
            self.dequeue_timeout
        );
        let _ = writeln!(
            &mut result,
            "delayed poll interval: {:?}",
            self.delayed_poll_interval
        );
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Bound of the in-process listener queue; a full queue slows the
    /// reading side down and backpressures the agent.
    pub queue_size: usize,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

impl SafeDisplay for AgentConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "queue size: {}", self.queue_size);
        let _ = writeln!(
            &mut result,
            "heartbeat interval: {:?}",
            self.heartbeat_interval
        );
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Base URL of the user-facing service, embedded in failure summaries.
    pub service_base_url: String,
    pub max_num_tasks: usize,
    pub max_retry_per_task: i32,
    pub max_retry_per_job: u64,
    #[serde(with = "humantime_serde")]
    pub default_exec_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub default_queue_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub force_cleanup_delay: Duration,
    /// Grace period before a stuck pod start turns into FAILED_START_TIMEOUT.
    #[serde(with = "humantime_serde")]
    pub max_pod_restart_limit: Duration,
    /// Re-check delay when a cancel races a PROCESSING group.
    #[serde(with = "humantime_serde")]
    pub cancel_retry_delay: Duration,
    pub max_log_lines: u64,
    pub max_task_log_lines: u64,
    pub max_error_log_lines: u64,
    pub max_event_log_lines: u64,
    /// Parallelism of the log archival in workflow cleanup.
    pub cleanup_concurrency: usize,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            service_base_url: "http://localhost:8080".to_string(),
            max_num_tasks: 20,
            max_retry_per_task: 0,
            max_retry_per_job: 5,
            default_exec_timeout: Duration::from_secs(60 * 24 * 60 * 60),
            default_queue_timeout: Duration::from_secs(60 * 24 * 60 * 60),
            force_cleanup_delay: Duration::from_secs(60 * 60),
            max_pod_restart_limit: Duration::from_secs(30 * 60),
            cancel_retry_delay: Duration::from_secs(60),
            max_log_lines: 10000,
            max_task_log_lines: 1000,
            max_error_log_lines: 100,
            max_event_log_lines: 100,
            cleanup_concurrency: 10,
        }
    }
}

impl SafeDisplay for WorkflowSettings {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "max num tasks: {}", self.max_num_tasks);
        let _ = writeln!(
            &mut result,
            "max retry per task: {}",
            self.max_retry_per_task
        );
        let _ = writeln!(&mut result, "max retry per job: {}", self.max_retry_per_job);
        let _ = writeln!(
            &mut result,
            "default exec timeout: {:?}",
            self.default_exec_timeout
        );
        let _ = writeln!(
            &mut result,
            "default queue timeout: {:?}",
            self.default_queue_timeout
        );
        let _ = writeln!(
            &mut result,
            "cleanup concurrency: {}",
            self.cleanup_concurrency
        );
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    pub root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "/var/lib/osmo/storage".to_string(),
        }
    }
}

impl SafeDisplay for StorageConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "root: {}", self.root);
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<ControlPlaneConfig> {
    ConfigLoader::new(&PathBuf::from("config/control-plane.toml"))
}
