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

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

/// Human-readable workflow identifier: a user-chosen name plus a random
/// base32 suffix, unique across the deployment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl Display for WorkflowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkflowId {
    fn from(value: &str) -> Self {
        WorkflowId(value.to_string())
    }
}

macro_rules! uuid_newtype {
    ($name:ident) => {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.simple())
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_newtype!(WorkflowUuid);
uuid_newtype!(GroupUuid);
uuid_newtype!(TaskUuid);
// Primary key of a single task retry row.
uuid_newtype!(TaskDbKey);

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Status shared by tasks and task groups. `Rescheduled` is task-only:
/// a rescheduled task row is terminal and a fresh row carries the retry.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskGroupStatus {
    Submitting,
    Waiting,
    Processing,
    Scheduling,
    Initializing,
    Running,
    Completed,
    Rescheduled,
    Failed,
    FailedCanceled,
    FailedServerError,
    FailedBackendError,
    FailedExecTimeout,
    FailedQueueTimeout,
    FailedImagePull,
    FailedUpstream,
    FailedEvicted,
    FailedStartError,
    FailedStartTimeout,
    FailedPreempted,
}

impl TaskGroupStatus {
    /// Statuses while the task lives inside the backend cluster.
    pub fn backend_states() -> &'static [TaskGroupStatus] {
        &[TaskGroupStatus::Scheduling, TaskGroupStatus::Running]
    }

    pub fn failed(&self) -> bool {
        use TaskGroupStatus::*;
        !matches!(
            self,
            Submitting
                | Waiting
                | Processing
                | Scheduling
                | Initializing
                | Running
                | Completed
                | Rescheduled
        )
    }

    /// Terminal for a task row. A rescheduled task is finished; its group
    /// is not (see [`TaskGroupStatus::group_finished`]).
    pub fn finished(&self) -> bool {
        matches!(
            self,
            TaskGroupStatus::Completed | TaskGroupStatus::Rescheduled
        ) || self.failed()
    }

    pub fn group_finished(&self) -> bool {
        *self == TaskGroupStatus::Completed || self.failed()
    }

    pub fn prescheduling(&self) -> bool {
        matches!(
            self,
            TaskGroupStatus::Submitting | TaskGroupStatus::Waiting | TaskGroupStatus::Processing
        )
    }

    pub fn in_queue(&self) -> bool {
        self.prescheduling() || *self == TaskGroupStatus::Scheduling
    }

    pub fn prerunning(&self) -> bool {
        self.in_queue() || *self == TaskGroupStatus::Initializing
    }

    pub fn canceled(&self) -> bool {
        matches!(
            self,
            TaskGroupStatus::FailedCanceled
                | TaskGroupStatus::FailedExecTimeout
                | TaskGroupStatus::FailedQueueTimeout
        )
    }

    pub fn server_errored(&self) -> bool {
        matches!(
            self,
            TaskGroupStatus::FailedServerError
                | TaskGroupStatus::FailedEvicted
                | TaskGroupStatus::FailedStartError
                | TaskGroupStatus::FailedImagePull
        )
    }

    /// Whether error logs should be captured from the pod for this outcome.
    pub fn has_error_logs(&self) -> bool {
        *self == TaskGroupStatus::Rescheduled
            || (self.failed()
                && !self.server_errored()
                && *self != TaskGroupStatus::FailedUpstream
                && !self.canceled())
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    FailedCanceled,
    FailedServerError,
    FailedBackendError,
    FailedExecTimeout,
    FailedQueueTimeout,
    FailedUpstream,
    FailedEvicted,
    FailedPreempted,
}

impl WorkflowStatus {
    pub fn failed(&self) -> bool {
        !matches!(
            self,
            WorkflowStatus::Pending | WorkflowStatus::Running | WorkflowStatus::Completed
        )
    }

    pub fn finished(&self) -> bool {
        *self == WorkflowStatus::Completed || self.failed()
    }

    /// The workflow-level failure corresponding to a group outcome.
    pub fn from_group_failure(status: TaskGroupStatus) -> WorkflowStatus {
        match status {
            TaskGroupStatus::FailedCanceled => WorkflowStatus::FailedCanceled,
            TaskGroupStatus::FailedServerError => WorkflowStatus::FailedServerError,
            TaskGroupStatus::FailedBackendError => WorkflowStatus::FailedBackendError,
            TaskGroupStatus::FailedExecTimeout => WorkflowStatus::FailedExecTimeout,
            TaskGroupStatus::FailedQueueTimeout => WorkflowStatus::FailedQueueTimeout,
            TaskGroupStatus::FailedUpstream => WorkflowStatus::FailedUpstream,
            TaskGroupStatus::FailedEvicted => WorkflowStatus::FailedEvicted,
            TaskGroupStatus::FailedPreempted => WorkflowStatus::FailedPreempted,
            _ => WorkflowStatus::Failed,
        }
    }
}

/// Service-defined exit codes reported for infrastructure outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitCode {
    FailedPreflight,
    FailedUpstream,
    FailedBackendError,
    FailedServerError,
    FailedStartError,
    FailedEvicted,
    FailedStartTimeout,
    FailedPreempted,
    FailedUnknown,
}

impl ExitCode {
    pub fn code(&self) -> i32 {
        match self {
            ExitCode::FailedPreflight => 1001,
            ExitCode::FailedUpstream => 3000,
            ExitCode::FailedBackendError => 3001,
            ExitCode::FailedServerError => 3002,
            ExitCode::FailedStartError => 3003,
            ExitCode::FailedEvicted => 3004,
            ExitCode::FailedStartTimeout => 3005,
            ExitCode::FailedPreempted => 3006,
            ExitCode::FailedUnknown => 4000,
        }
    }
}

/// Outcome of a single job execution attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Success,
    FailedRetry,
    FailedNoRetry,
}

impl JobStatus {
    pub fn retry(&self) -> bool {
        *self == JobStatus::FailedRetry
    }
}
