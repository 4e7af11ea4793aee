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

//! Submission-side scheduling: DAG expansion from task inputs, pool and
//! priority validation, exit-action rewriting and gang queue naming.

use crate::model::spec::{TaskInput, WorkflowSpec};
use crate::model::{Pool, PoolStatus, SchedulerSettings};
use osmo_common::model::{TaskGroupStatus, WorkflowPriority};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Task input {0} does not reference a task of this workflow")]
    UnknownTaskInput(String),
    #[error("Workflow groups form a cycle")]
    Cycle,
    #[error("Duplicate name: {0}")]
    DuplicateName(String),
    #[error("Group {0} has no tasks")]
    EmptyGroup(String),
    #[error("Group {0} needs exactly one lead task")]
    LeadTask(String),
    #[error("Workflow has {count} tasks; the limit is {limit}")]
    TooManyTasks { count: usize, limit: usize },
    #[error("Pool {0} is in maintenance")]
    PoolMaintenance(String),
    #[error("Pool {0} scheduler does not support priorities")]
    PriorityUnsupported(String),
    #[error("Group {group} requests {requested} GPUs; pool guarantee is {guarantee}")]
    GpuQuotaExceeded {
        group: String,
        requested: f64,
        guarantee: i64,
    },
    #[error("Invalid exit action ranges {0:?}")]
    InvalidExitAction(String),
}

/// Group-level DAG edges computed from task-to-task inputs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DagEdges {
    pub remaining_upstream: BTreeMap<String, BTreeSet<String>>,
    pub downstream: BTreeMap<String, BTreeSet<String>>,
}

/// Expands task-level inputs into group-level edges and rejects cyclic
/// specs. Inputs of the form `workflow:task` reference a previous
/// workflow's output and do not create an edge.
pub fn expand_dag(spec: &WorkflowSpec) -> Result<DagEdges, SchedulerError> {
    let mut task_to_group: BTreeMap<&str, &str> = BTreeMap::new();
    for group in &spec.groups {
        for task in &group.tasks {
            task_to_group.insert(task.name.as_str(), group.name.as_str());
        }
    }

    let mut edges = DagEdges::default();
    for group in &spec.groups {
        edges
            .remaining_upstream
            .entry(group.name.clone())
            .or_default();
        edges.downstream.entry(group.name.clone()).or_default();
    }

    for group in &spec.groups {
        for task in &group.tasks {
            for input in &task.inputs {
                let TaskInput::Task { task: reference } = input else {
                    continue;
                };
                if reference.contains(':') {
                    continue;
                }
                let upstream_group = task_to_group
                    .get(reference.as_str())
                    .ok_or_else(|| SchedulerError::UnknownTaskInput(reference.clone()))?;
                if *upstream_group == group.name {
                    continue;
                }
                edges
                    .remaining_upstream
                    .get_mut(&group.name)
                    .map(|upstream| upstream.insert(upstream_group.to_string()));
                edges
                    .downstream
                    .get_mut(*upstream_group)
                    .map(|downstream| downstream.insert(group.name.clone()));
            }
        }
    }

    check_acyclic(&edges)?;
    Ok(edges)
}

fn check_acyclic(edges: &DagEdges) -> Result<(), SchedulerError> {
    let mut in_degree: BTreeMap<&str, usize> = edges
        .remaining_upstream
        .iter()
        .map(|(group, upstream)| (group.as_str(), upstream.len()))
        .collect();
    let mut ready: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(group, _)| *group)
        .collect();

    let mut visited = 0;
    while let Some(group) = ready.pop_front() {
        visited += 1;
        if let Some(downstream) = edges.downstream.get(group) {
            for next in downstream {
                if let Some(degree) = in_degree.get_mut(next.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(next.as_str());
                    }
                }
            }
        }
    }

    if visited == edges.remaining_upstream.len() {
        Ok(())
    } else {
        Err(SchedulerError::Cycle)
    }
}

/// Structural validation of a spec, with lead-task normalization: a
/// single-task group's task becomes the lead implicitly.
pub fn validate_spec(spec: &mut WorkflowSpec, max_num_tasks: usize) -> Result<(), SchedulerError> {
    let mut names = BTreeSet::new();
    let mut task_count = 0;
    for group in &mut spec.groups {
        if !names.insert(group.name.clone()) {
            return Err(SchedulerError::DuplicateName(group.name.clone()));
        }
        if group.tasks.is_empty() {
            return Err(SchedulerError::EmptyGroup(group.name.clone()));
        }
        if group.tasks.len() == 1 {
            group.tasks[0].lead = true;
        }
        if group.tasks.iter().filter(|task| task.lead).count() != 1 {
            return Err(SchedulerError::LeadTask(group.name.clone()));
        }
        for task in &group.tasks {
            if !names.insert(task.name.clone()) {
                return Err(SchedulerError::DuplicateName(task.name.clone()));
            }
            for ranges in task.exit_actions.values() {
                parse_ranges(ranges)?;
            }
            task_count += 1;
        }
    }
    if task_count > max_num_tasks {
        return Err(SchedulerError::TooManyTasks {
            count: task_count,
            limit: max_num_tasks,
        });
    }
    Ok(())
}

/// Submit-time pool checks: maintenance, priority capability and the
/// per-group GPU guarantee for prioritized workflows.
pub fn validate_submit(
    pool: &Pool,
    backend_online: bool,
    scheduler: &SchedulerSettings,
    spec: &WorkflowSpec,
    priority: WorkflowPriority,
    is_admin: bool,
) -> Result<(), SchedulerError> {
    if pool.status(backend_online) == PoolStatus::Maintenance && !is_admin {
        return Err(SchedulerError::PoolMaintenance(pool.name.clone()));
    }
    if priority != WorkflowPriority::Normal && !scheduler.scheduler_type.priority_supported() {
        return Err(SchedulerError::PriorityUnsupported(pool.name.clone()));
    }
    if priority != WorkflowPriority::Low {
        if let Some(gpu) = &pool.resources.gpu {
            if gpu.guarantee >= 0 {
                for group in &spec.groups {
                    let requested = group.gpu_request();
                    if requested > gpu.guarantee as f64 {
                        return Err(SchedulerError::GpuQuotaExceeded {
                            group: group.name.clone(),
                            requested,
                            guarantee: gpu.guarantee,
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

/// Gang-scheduling queue label, keyed by the backend namespace and pool.
pub fn gang_queue_name(namespace: &str, pool: &str) -> String {
    format!("{namespace}-{pool}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitAction {
    Completed,
    Failed,
    Rescheduled,
}

impl ExitAction {
    fn from_key(key: &str) -> Option<ExitAction> {
        match key.to_ascii_uppercase().as_str() {
            "COMPLETED" => Some(ExitAction::Completed),
            "FAILED" => Some(ExitAction::Failed),
            "RESCHEDULED" => Some(ExitAction::Rescheduled),
            _ => None,
        }
    }

    pub fn status(&self) -> TaskGroupStatus {
        match self {
            ExitAction::Completed => TaskGroupStatus::Completed,
            ExitAction::Failed => TaskGroupStatus::Failed,
            ExitAction::Rescheduled => TaskGroupStatus::Rescheduled,
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            ExitAction::Completed => "COMPLETE",
            ExitAction::Failed => "FAIL",
            ExitAction::Rescheduled => "RESCHEDULE",
        }
    }
}

/// Parses comma-separated inclusive ranges such as `"0-3,10"`.
pub fn parse_ranges(ranges: &str) -> Result<Vec<(i32, i32)>, SchedulerError> {
    let mut parsed = Vec::new();
    for interval in ranges.split(',') {
        let bounds: Vec<&str> = interval.split('-').collect();
        let parse = |raw: &str| {
            raw.trim()
                .parse::<i32>()
                .map_err(|_| SchedulerError::InvalidExitAction(ranges.to_string()))
        };
        match bounds.as_slice() {
            [single] => {
                let value = parse(single)?;
                parsed.push((value, value));
            }
            [low, high] => {
                let low = parse(low)?;
                let high = parse(high)?;
                if low > high {
                    return Err(SchedulerError::InvalidExitAction(ranges.to_string()));
                }
                parsed.push((low, high));
            }
            _ => return Err(SchedulerError::InvalidExitAction(ranges.to_string())),
        }
    }
    Ok(parsed)
}

fn in_ranges(ranges: &str, code: i32) -> bool {
    parse_ranges(ranges)
        .map(|ranges| ranges.iter().any(|(low, high)| *low <= code && code <= *high))
        .unwrap_or(false)
}

fn action_for(code: i32, actions: &BTreeMap<String, String>) -> Option<ExitAction> {
    for (key, ranges) in actions {
        if in_ranges(ranges, code) {
            if let Some(action) = ExitAction::from_key(key) {
                return Some(action);
            }
        }
    }
    None
}

/// The rewritten status and the note appended to the failure message.
#[derive(Clone, Debug, PartialEq)]
pub struct AppliedExitAction {
    pub status: TaskGroupStatus,
    pub note: String,
}

/// Rewrites a task's final status according to its exit actions (task
/// level first, then pool defaults), honouring the retry budget.
pub fn apply_exit_action(
    status: TaskGroupStatus,
    exit_code: Option<i32>,
    task_actions: &BTreeMap<String, String>,
    pool_actions: &BTreeMap<String, String>,
    retry_id: i32,
    max_retry: i32,
) -> Option<AppliedExitAction> {
    let code = exit_code?;
    let action = action_for(code, task_actions).or_else(|| action_for(code, pool_actions))?;
    if action.status() == status {
        return None;
    }
    if action == ExitAction::Rescheduled && retry_id >= max_retry {
        return Some(AppliedExitAction {
            status,
            note: format!("No exit action applied due to retry limit {max_retry}."),
        });
    }
    Some(AppliedExitAction {
        status: action.status(),
        note: format!(
            "Exit Action: {} the task for exit code {code}.",
            action.verb()
        ),
    })
}
