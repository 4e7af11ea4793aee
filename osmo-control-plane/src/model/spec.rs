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

//! The user-facing workflow specification, as it arrives from the (already
//! validated) submission request and as it is persisted on the group rows.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub groups: Vec<GroupSpec>,
    #[serde(default)]
    pub timeout: TimeoutSpec,
}

impl WorkflowSpec {
    pub fn group(&self, name: &str) -> Option<&GroupSpec> {
        self.groups.iter().find(|group| group.name == name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeoutSpec {
    #[serde(default, with = "humantime_serde")]
    pub exec_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub queue_timeout: Option<Duration>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    pub tasks: Vec<TaskSpec>,
    /// All tasks of the group rendezvous before starting user code.
    #[serde(default)]
    pub barrier: bool,
    /// Only the lead task decides the group outcome.
    #[serde(default, rename = "ignoreNonleadStatus")]
    pub ignore_nonlead_status: bool,
}

impl GroupSpec {
    /// Barriers only exist for multi-task groups.
    pub fn has_group_barrier(&self) -> bool {
        self.barrier && self.tasks.len() > 1
    }

    pub fn lead_task(&self) -> Option<&TaskSpec> {
        self.tasks.iter().find(|task| task.lead)
    }

    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|task| task.name == name)
    }

    pub fn gpu_request(&self) -> f64 {
        self.tasks
            .iter()
            .map(|task| task.resources.gpu.unwrap_or(0.0))
            .sum()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub lead: bool,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub inputs: Vec<TaskInput>,
    /// Credential names whose values must never appear in stored logs.
    #[serde(default)]
    pub credentials: Vec<String>,
    /// Exit-code ranges that rewrite the final status, e.g.
    /// `{"RESCHEDULED": "137,139"}`.
    #[serde(default, rename = "exitActions")]
    pub exit_actions: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceSpec,
}

/// A task input: another task of this workflow (which creates a DAG edge),
/// a dataset, or a plain URL.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskInput {
    Task { task: String },
    Dataset { dataset: DatasetRef },
    Url { url: String },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub name: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default)]
    pub gpu: Option<f64>,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub memory_gib: Option<f64>,
    #[serde(default)]
    pub storage_gib: Option<f64>,
}
