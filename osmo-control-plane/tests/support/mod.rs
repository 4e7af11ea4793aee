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

//! In-memory fakes of the store, the broker and the side store, plus a
//! harness that drives jobs the way the worker loop and the backend
//! worker channel do. The fakes honour the same state-machine guards as
//! the Postgres repositories, so scenario tests exercise the real
//! transition rules.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use osmo_common::model::{
    JobStatus, TaskDbKey, TaskGroupStatus, TaskUuid, WorkflowId, WorkflowStatus, WorkflowUuid,
};
use osmo_control_plane::broker::streams::{ActionToken, LogEntry, LogStore, LogStoreError};
use osmo_control_plane::broker::{Broker, BrokerError, Delivery, UNIQUE_JOB_TTL};
use osmo_control_plane::config::WorkflowSettings;
use osmo_control_plane::jobs::{self, Job, JobContext, JobPayload, PrepareOutcome, QueueName, UpdateGroup};
use osmo_control_plane::model::state::{group_transition_guard, task_transition_guard};
use osmo_control_plane::model::{
    AppStatus, Backend, NodeConditions, Pool, ResourceNode, SchedulerSettings, Task, TaskGroup,
    TaskInfo, Workflow,
};
use osmo_control_plane::notify::LoggingNotifier;
use osmo_control_plane::renderer::DefaultPodSpecRenderer;
use osmo_control_plane::repo::app::{AppRepo, AppVersionRecord};
use osmo_control_plane::repo::backend::{BackendRegistration, BackendRepo};
use osmo_control_plane::repo::group::{GroupRepo, NewGroup};
use osmo_control_plane::repo::pool::PoolRepo;
use osmo_control_plane::repo::resource::ResourceRepo;
use osmo_control_plane::repo::task::{NewTask, TaskRepo};
use osmo_control_plane::repo::workflow::WorkflowRepo;
use osmo_control_plane::repo::RepoError;
use osmo_control_plane::secrets::NoSecrets;
use osmo_control_plane::service::workflow::WorkflowService;
use osmo_control_plane::storage::{StorageClient, StorageError};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Store fake
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    workflows: BTreeMap<String, Workflow>,
    groups: BTreeMap<(String, String), TaskGroup>,
    tasks: BTreeMap<Uuid, Task>,
    backends: BTreeMap<String, Backend>,
    pools: BTreeMap<String, Pool>,
    resources: BTreeMap<(String, String), ResourceNode>,
    apps: BTreeMap<(Uuid, i32), AppVersionRecord>,
}

#[derive(Default)]
pub struct FakeStore {
    inner: Mutex<StoreInner>,
}

impl FakeStore {
    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("store poisoned")
    }

    pub fn insert_pool(&self, pool: Pool) {
        self.lock().pools.insert(pool.name.clone(), pool);
    }

    pub fn insert_backend(&self, backend: Backend) {
        self.lock().backends.insert(backend.name.clone(), backend);
    }

    pub fn workflow(&self, workflow_id: &WorkflowId) -> Workflow {
        self.lock()
            .workflows
            .get(&workflow_id.0)
            .cloned()
            .expect("workflow missing")
    }

    pub fn group(&self, workflow_id: &WorkflowId, name: &str) -> TaskGroup {
        self.lock()
            .groups
            .get(&(workflow_id.0.clone(), name.to_string()))
            .cloned()
            .expect("group missing")
    }

    pub fn task(&self, workflow_id: &WorkflowId, name: &str, retry_id: i32) -> Task {
        self.lock()
            .tasks
            .values()
            .find(|task| {
                task.workflow_id == *workflow_id && task.name == name && task.retry_id == retry_id
            })
            .cloned()
            .expect("task missing")
    }

    pub fn task_retries(&self, workflow_id: &WorkflowId, name: &str) -> Vec<Task> {
        let mut retries: Vec<Task> = self
            .lock()
            .tasks
            .values()
            .filter(|task| task.workflow_id == *workflow_id && task.name == name)
            .cloned()
            .collect();
        retries.sort_by_key(|task| task.retry_id);
        retries
    }

    pub fn set_submit_time(&self, workflow_id: &WorkflowId, time: DateTime<Utc>) {
        if let Some(workflow) = self.lock().workflows.get_mut(&workflow_id.0) {
            workflow.submit_time = Some(time);
        }
    }

    fn latest_tasks(inner: &StoreInner, workflow_id: &WorkflowId, group_name: &str) -> Vec<Task> {
        let mut latest: BTreeMap<String, Task> = BTreeMap::new();
        for task in inner.tasks.values() {
            if task.workflow_id != *workflow_id || task.group_name != group_name {
                continue;
            }
            match latest.get(&task.name) {
                Some(existing) if existing.retry_id >= task.retry_id => {}
                _ => {
                    latest.insert(task.name.clone(), task.clone());
                }
            }
        }
        latest.into_values().collect()
    }

    fn task_info(inner: &StoreInner, task: Task) -> TaskInfo {
        let submitted_by = inner
            .workflows
            .get(&task.workflow_id.0)
            .map(|workflow| workflow.user.clone())
            .unwrap_or_default();
        TaskInfo { task, submitted_by }
    }
}

fn task_phase_field<'a>(task: &'a mut Task, column: &str) -> &'a mut Option<DateTime<Utc>> {
    match column {
        "processing_start_time" => &mut task.processing_start_time,
        "scheduling_start_time" => &mut task.scheduling_start_time,
        "initializing_start_time" => &mut task.initializing_start_time,
        "start_time" => &mut task.start_time,
        "end_time" => &mut task.end_time,
        other => panic!("unknown phase column {other}"),
    }
}

fn group_phase_field<'a>(group: &'a mut TaskGroup, column: &str) -> &'a mut Option<DateTime<Utc>> {
    match column {
        "processing_start_time" => &mut group.processing_start_time,
        "scheduling_start_time" => &mut group.scheduling_start_time,
        "initializing_start_time" => &mut group.initializing_start_time,
        "start_time" => &mut group.start_time,
        "end_time" => &mut group.end_time,
        other => panic!("unknown phase column {other}"),
    }
}

#[async_trait]
impl WorkflowRepo for FakeStore {
    async fn insert(&self, workflow: &Workflow) -> Result<(), RepoError> {
        let mut inner = self.lock();
        inner
            .workflows
            .entry(workflow.workflow_id.0.clone())
            .or_insert_with(|| workflow.clone());
        Ok(())
    }

    async fn get(&self, workflow_id: &WorkflowId) -> Result<Option<Workflow>, RepoError> {
        Ok(self.lock().workflows.get(&workflow_id.0).cloned())
    }

    async fn get_by_uuid(
        &self,
        workflow_uuid: &WorkflowUuid,
    ) -> Result<Option<Workflow>, RepoError> {
        Ok(self
            .lock()
            .workflows
            .values()
            .find(|workflow| workflow.workflow_uuid == *workflow_uuid)
            .cloned())
    }

    async fn update_status(
        &self,
        workflow_id: &WorkflowId,
        status: WorkflowStatus,
        now: DateTime<Utc>,
        failure_message: Option<&str>,
        canceled_by: Option<&str>,
    ) -> Result<bool, RepoError> {
        let mut inner = self.lock();
        let Some(workflow) = inner.workflows.get_mut(&workflow_id.0) else {
            return Ok(false);
        };
        if workflow.end_time.is_some() {
            return Ok(false);
        }
        workflow.status = status;
        if status == WorkflowStatus::Running && workflow.start_time.is_none() {
            workflow.start_time = Some(now);
        }
        if status.finished() {
            workflow.end_time = Some(now);
        }
        if let Some(message) = failure_message {
            workflow.failure_message = Some(message.to_string());
        }
        if let Some(user) = canceled_by {
            workflow.cancelled_by.get_or_insert_with(|| user.to_string());
        }
        Ok(true)
    }

    async fn set_cancelled_by(
        &self,
        workflow_id: &WorkflowId,
        user: &str,
    ) -> Result<(), RepoError> {
        if let Some(workflow) = self.lock().workflows.get_mut(&workflow_id.0) {
            workflow.cancelled_by.get_or_insert_with(|| user.to_string());
        }
        Ok(())
    }

    async fn set_timeouts(
        &self,
        workflow_id: &WorkflowId,
        queue_timeout: Option<Duration>,
        exec_timeout: Option<Duration>,
    ) -> Result<(), RepoError> {
        if let Some(workflow) = self.lock().workflows.get_mut(&workflow_id.0) {
            if queue_timeout.is_some() {
                workflow.queue_timeout = queue_timeout;
            }
            if exec_timeout.is_some() {
                workflow.exec_timeout = exec_timeout;
            }
        }
        Ok(())
    }

    async fn set_log_locations(
        &self,
        workflow_id: &WorkflowId,
        logs: &str,
        events: &str,
    ) -> Result<(), RepoError> {
        if let Some(workflow) = self.lock().workflows.get_mut(&workflow_id.0) {
            workflow.logs = logs.to_string();
            workflow.events = events.to_string();
        }
        Ok(())
    }
}

#[async_trait]
impl GroupRepo for FakeStore {
    async fn insert(&self, group: &NewGroup) -> Result<(), RepoError> {
        let mut inner = self.lock();
        let key = (group.workflow_id.0.clone(), group.name.clone());
        inner.groups.entry(key).or_insert_with(|| TaskGroup {
            workflow_id: group.workflow_id.clone(),
            name: group.name.clone(),
            group_uuid: group.group_uuid,
            spec: group.spec.clone(),
            status: TaskGroupStatus::Submitting,
            remaining_upstream: group.remaining_upstream.clone(),
            downstream: group.downstream.clone(),
            cleaned_up: false,
            failure_message: None,
            scheduler_settings: None,
            processing_start_time: None,
            scheduling_start_time: None,
            initializing_start_time: None,
            start_time: None,
            end_time: None,
        });
        Ok(())
    }

    async fn get(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
    ) -> Result<Option<TaskGroup>, RepoError> {
        Ok(self
            .lock()
            .groups
            .get(&(workflow_id.0.clone(), name.to_string()))
            .cloned())
    }

    async fn list_by_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<TaskGroup>, RepoError> {
        Ok(self
            .lock()
            .groups
            .values()
            .filter(|group| group.workflow_id == *workflow_id)
            .cloned()
            .collect())
    }

    async fn fetch_status(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
    ) -> Result<TaskGroupStatus, RepoError> {
        self.lock()
            .groups
            .get(&(workflow_id.0.clone(), name.to_string()))
            .map(|group| group.status)
            .ok_or_else(|| RepoError::NotFound(format!("Group {workflow_id}/{name}")))
    }

    async fn update_status(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
        status: TaskGroupStatus,
        now: DateTime<Utc>,
        message: &str,
        force_cancel: bool,
        scheduler_settings: Option<&SchedulerSettings>,
    ) -> Result<bool, RepoError> {
        let guard = group_transition_guard(status, force_cancel).ok_or_else(|| {
            RepoError::InvalidTransition(format!("{status} is not a group status"))
        })?;
        let mut inner = self.lock();
        let Some(group) = inner
            .groups
            .get_mut(&(workflow_id.0.clone(), name.to_string()))
        else {
            return Ok(false);
        };
        if !guard.allowed_from.contains(&group.status) {
            return Ok(false);
        }
        if let Some(column) = guard.phase_column {
            if group_phase_field(group, column).is_some() {
                return Ok(false);
            }
        }
        group.status = status;
        if let Some(settings) = scheduler_settings {
            group.scheduler_settings = Some(settings.clone());
        }
        if let Some(column) = guard.phase_column {
            *group_phase_field(group, column) = Some(now);
        }
        if guard.sets_end_time && status.failed() && !message.is_empty() {
            group.failure_message = Some(message.to_string());
        }
        Ok(true)
    }

    async fn mark_groups_waiting(&self, workflow_id: &WorkflowId) -> Result<bool, RepoError> {
        let mut inner = self.lock();
        let Some(workflow) = inner.workflows.get(&workflow_id.0) else {
            return Err(RepoError::NotFound(format!("Workflow {workflow_id}")));
        };
        if workflow.status.finished() || workflow.cancelled_by.is_some() {
            return Ok(false);
        }
        for group in inner.groups.values_mut() {
            if group.workflow_id == *workflow_id && group.status == TaskGroupStatus::Submitting {
                group.status = TaskGroupStatus::Waiting;
            }
        }
        Ok(true)
    }

    async fn remove_upstream(
        &self,
        workflow_id: &WorkflowId,
        downstream_name: &str,
        upstream_name: &str,
    ) -> Result<bool, RepoError> {
        let mut inner = self.lock();
        let group = inner
            .groups
            .get_mut(&(workflow_id.0.clone(), downstream_name.to_string()))
            .ok_or_else(|| {
                RepoError::NotFound(format!("Group {workflow_id}/{downstream_name}"))
            })?;
        // Only a removal that actually happened can report the transition
        // to an empty set; replays find the member already gone.
        let removed = group.remaining_upstream.remove(upstream_name);
        Ok(removed && group.remaining_upstream.is_empty())
    }

    async fn patch_cleaned_up(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
    ) -> Result<(bool, bool), RepoError> {
        let mut inner = self.lock();
        let mut flipped = false;
        if let Some(group) = inner
            .groups
            .get_mut(&(workflow_id.0.clone(), name.to_string()))
        {
            if !group.cleaned_up {
                group.cleaned_up = true;
                flipped = true;
            }
        }
        let all_cleaned = inner
            .groups
            .values()
            .filter(|group| group.workflow_id == *workflow_id)
            .all(|group| group.cleaned_up);
        Ok((flipped, all_cleaned))
    }
}

#[async_trait]
impl TaskRepo for FakeStore {
    async fn insert(&self, task: &NewTask) -> Result<(), RepoError> {
        let mut inner = self.lock();
        let duplicate = inner.tasks.values().any(|existing| {
            existing.workflow_id == task.workflow_id
                && existing.name == task.name
                && existing.retry_id == task.retry_id
        });
        if duplicate {
            return Ok(());
        }
        let workflow_uuid = inner
            .workflows
            .get(&task.workflow_id.0)
            .map(|workflow| workflow.workflow_uuid)
            .unwrap_or(WorkflowUuid(Uuid::nil()));
        inner.tasks.insert(
            task.task_db_key.0,
            Task {
                workflow_id: task.workflow_id.clone(),
                workflow_uuid,
                name: task.name.clone(),
                group_name: task.group_name.clone(),
                task_uuid: task.task_uuid,
                task_db_key: task.task_db_key,
                retry_id: task.retry_id,
                status: task.status,
                lead: task.lead,
                exit_code: None,
                exit_actions: task.exit_actions.clone(),
                failure_message: None,
                pod_name: task.pod_name.clone(),
                node_name: None,
                pod_ip: None,
                processing_start_time: None,
                scheduling_start_time: None,
                initializing_start_time: None,
                start_time: None,
                end_time: None,
            },
        );
        Ok(())
    }

    async fn insert_retry(&self, task: &NewTask, _previous: &TaskDbKey) -> Result<(), RepoError> {
        TaskRepo::insert(self, task).await
    }

    async fn get(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
        retry_id: Option<i32>,
    ) -> Result<Option<Task>, RepoError> {
        let inner = self.lock();
        let mut candidates: Vec<&Task> = inner
            .tasks
            .values()
            .filter(|task| task.workflow_id == *workflow_id && task.name == name)
            .collect();
        candidates.sort_by_key(|task| task.retry_id);
        Ok(match retry_id {
            Some(retry_id) => candidates
                .into_iter()
                .find(|task| task.retry_id == retry_id)
                .cloned(),
            None => candidates.last().map(|task| (*task).clone()),
        })
    }

    async fn get_info_by_uuid(
        &self,
        workflow_uuid: &WorkflowUuid,
        task_uuid: &TaskUuid,
        retry_id: i32,
    ) -> Result<Option<TaskInfo>, RepoError> {
        let inner = self.lock();
        let task = inner
            .tasks
            .values()
            .find(|task| {
                task.workflow_uuid == *workflow_uuid
                    && task.task_uuid == *task_uuid
                    && task.retry_id == retry_id
            })
            .cloned();
        Ok(task.map(|task| FakeStore::task_info(&inner, task)))
    }

    async fn list_latest_by_group(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
    ) -> Result<Vec<Task>, RepoError> {
        Ok(FakeStore::latest_tasks(&self.lock(), workflow_id, group_name))
    }

    async fn list_all_by_group(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
    ) -> Result<Vec<Task>, RepoError> {
        let mut tasks: Vec<Task> = self
            .lock()
            .tasks
            .values()
            .filter(|task| task.workflow_id == *workflow_id && task.group_name == group_name)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| (&a.name, a.retry_id).cmp(&(&b.name, b.retry_id)));
        Ok(tasks)
    }

    async fn update_status(
        &self,
        task_db_key: &TaskDbKey,
        status: TaskGroupStatus,
        now: DateTime<Utc>,
        message: &str,
        exit_code: Option<i32>,
    ) -> Result<bool, RepoError> {
        let guard = task_transition_guard(status).ok_or_else(|| {
            RepoError::InvalidTransition(format!("{status} is not a task status"))
        })?;
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(&task_db_key.0) else {
            return Ok(false);
        };
        if !guard.allowed_from.contains(&task.status) {
            return Ok(false);
        }
        if let Some(column) = guard.phase_column {
            if task_phase_field(task, column).is_some() {
                return Ok(false);
            }
        }
        task.status = status;
        if let Some(column) = guard.phase_column {
            *task_phase_field(task, column) = Some(now);
        }
        if guard.sets_end_time {
            if exit_code.is_some() {
                task.exit_code = exit_code;
            }
            if !message.is_empty() {
                task.failure_message = Some(message.to_string());
            }
        }
        Ok(true)
    }

    async fn mark_processing(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
    ) -> Result<(), RepoError> {
        for task in self.lock().tasks.values_mut() {
            if task.workflow_id == *workflow_id
                && task.group_name == group_name
                && task.status == TaskGroupStatus::Waiting
            {
                task.status = TaskGroupStatus::Processing;
            }
        }
        Ok(())
    }

    async fn set_node_name(&self, task_db_key: &TaskDbKey, node: &str) -> Result<(), RepoError> {
        if let Some(task) = self.lock().tasks.get_mut(&task_db_key.0) {
            task.node_name.get_or_insert_with(|| node.to_string());
        }
        Ok(())
    }

    async fn set_pod_ip(&self, task_db_key: &TaskDbKey, pod_ip: &str) -> Result<(), RepoError> {
        if let Some(task) = self.lock().tasks.get_mut(&task_db_key.0) {
            task.pod_ip.get_or_insert_with(|| pod_ip.to_string());
        }
        Ok(())
    }

    async fn list_on_node(&self, backend: &str, node: &str) -> Result<Vec<TaskInfo>, RepoError> {
        let inner = self.lock();
        let tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|task| {
                task.node_name.as_deref() == Some(node)
                    && TaskGroupStatus::backend_states().contains(&task.status)
                    && inner
                        .workflows
                        .get(&task.workflow_id.0)
                        .map(|workflow| workflow.backend == backend)
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        Ok(tasks
            .into_iter()
            .map(|task| FakeStore::task_info(&inner, task))
            .collect())
    }

    async fn list_backend_orphans(
        &self,
        backend: &str,
        known_tasks: &[TaskUuid],
    ) -> Result<Vec<TaskInfo>, RepoError> {
        let inner = self.lock();
        let known: BTreeSet<TaskUuid> = known_tasks.iter().copied().collect();
        let tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|task| {
                !known.contains(&task.task_uuid)
                    && inner
                        .workflows
                        .get(&task.workflow_id.0)
                        .map(|workflow| workflow.backend == backend)
                        .unwrap_or(false)
                    && inner
                        .groups
                        .get(&(task.workflow_id.0.clone(), task.group_name.clone()))
                        .map(|group| TaskGroupStatus::backend_states().contains(&group.status))
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        Ok(tasks
            .into_iter()
            .map(|task| FakeStore::task_info(&inner, task))
            .collect())
    }

    async fn find_by_pod_name(&self, pod_name: &str) -> Result<Vec<TaskInfo>, RepoError> {
        let inner = self.lock();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|task| task.pod_name == pod_name)
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.retry_id);
        Ok(tasks
            .into_iter()
            .map(|task| FakeStore::task_info(&inner, task))
            .collect())
    }
}

#[async_trait]
impl BackendRepo for FakeStore {
    async fn register_init(
        &self,
        registration: &BackendRegistration,
    ) -> Result<Backend, RepoError> {
        let mut inner = self.lock();
        let now = Utc::now();
        match inner.backends.get_mut(&registration.name) {
            Some(backend) => {
                if backend.k8s_uid != registration.k8s_uid {
                    return Err(RepoError::Conflict(format!(
                        "Backend {} is already being used by a different cluster",
                        registration.name
                    )));
                }
                backend.k8s_namespace = registration.k8s_namespace.clone();
                backend.version = registration.version.clone();
                backend.node_conditions.prefix = registration.node_condition_prefix.clone();
                backend.last_heartbeat = now;
                Ok(backend.clone())
            }
            None => {
                let backend = Backend {
                    name: registration.name.clone(),
                    description: String::new(),
                    version: registration.version.clone(),
                    k8s_uid: registration.k8s_uid.clone(),
                    k8s_namespace: registration.k8s_namespace.clone(),
                    scheduler_settings: SchedulerSettings::default(),
                    node_conditions: NodeConditions {
                        prefix: registration.node_condition_prefix.clone(),
                        ..Default::default()
                    },
                    last_heartbeat: now,
                    created_date: now,
                    router_address: String::new(),
                };
                inner
                    .backends
                    .insert(registration.name.clone(), backend.clone());
                Ok(backend)
            }
        }
    }

    async fn get(&self, name: &str) -> Result<Option<Backend>, RepoError> {
        Ok(self.lock().backends.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<Backend>, RepoError> {
        Ok(self.lock().backends.values().cloned().collect())
    }

    async fn update_heartbeat(&self, name: &str, time: DateTime<Utc>) -> Result<(), RepoError> {
        if let Some(backend) = self.lock().backends.get_mut(name) {
            backend.last_heartbeat = time;
        }
        Ok(())
    }
}

#[async_trait]
impl PoolRepo for FakeStore {
    async fn get(&self, name: &str) -> Result<Option<Pool>, RepoError> {
        Ok(self.lock().pools.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<Pool>, RepoError> {
        Ok(self.lock().pools.values().cloned().collect())
    }

    async fn upsert(&self, pool: &Pool) -> Result<(), RepoError> {
        self.insert_pool(pool.clone());
        Ok(())
    }
}

#[async_trait]
impl ResourceRepo for FakeStore {
    async fn upsert(&self, node: &ResourceNode) -> Result<(), RepoError> {
        let mut inner = self.lock();
        let key = (node.name.clone(), node.backend.clone());
        match inner.resources.get_mut(&key) {
            Some(existing) => {
                existing.available = node.available;
                existing.allocatable = node.allocatable.clone();
                existing.labels = node.labels.clone();
                existing.taints = node.taints.clone();
                existing.conditions = node.conditions.clone();
            }
            None => {
                inner.resources.insert(key, node.clone());
            }
        }
        Ok(())
    }

    async fn update_usage(
        &self,
        name: &str,
        backend: &str,
        usage: &BTreeMap<String, String>,
        non_workflow_usage: &BTreeMap<String, String>,
    ) -> Result<(), RepoError> {
        let mut inner = self.lock();
        let key = (name.to_string(), backend.to_string());
        let node = inner.resources.entry(key).or_insert_with(|| ResourceNode {
            name: name.to_string(),
            backend: backend.to_string(),
            available: true,
            ..Default::default()
        });
        node.usage = usage.clone();
        node.non_workflow_usage = non_workflow_usage.clone();
        Ok(())
    }

    async fn delete(&self, name: &str, backend: &str) -> Result<(), RepoError> {
        self.lock()
            .resources
            .remove(&(name.to_string(), backend.to_string()));
        Ok(())
    }

    async fn list_names(&self, backend: &str) -> Result<Vec<String>, RepoError> {
        Ok(self
            .lock()
            .resources
            .values()
            .filter(|node| node.backend == backend)
            .map(|node| node.name.clone())
            .collect())
    }

    async fn delete_stale(&self, backend: &str, known: &[String]) -> Result<u64, RepoError> {
        let known: BTreeSet<&str> = known.iter().map(String::as_str).collect();
        let mut inner = self.lock();
        let before = inner.resources.len();
        inner
            .resources
            .retain(|(name, node_backend), _| node_backend != backend || known.contains(name.as_str()));
        Ok((before - inner.resources.len()) as u64)
    }

    async fn list(&self, backend: &str) -> Result<Vec<ResourceNode>, RepoError> {
        Ok(self
            .lock()
            .resources
            .values()
            .filter(|node| node.backend == backend)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AppRepo for FakeStore {
    async fn insert(&self, app_uuid: &Uuid, version: i32, owner: &str) -> Result<(), RepoError> {
        self.lock()
            .apps
            .entry((*app_uuid, version))
            .or_insert_with(|| AppVersionRecord {
                app_uuid: *app_uuid,
                version,
                owner: owner.to_string(),
                status: "UPLOADING".to_string(),
                created_date: Utc::now(),
            });
        Ok(())
    }

    async fn get(
        &self,
        app_uuid: &Uuid,
        version: i32,
    ) -> Result<Option<AppVersionRecord>, RepoError> {
        Ok(self.lock().apps.get(&(*app_uuid, version)).cloned())
    }

    async fn set_status(
        &self,
        app_uuid: &Uuid,
        version: i32,
        status: AppStatus,
    ) -> Result<(), RepoError> {
        if let Some(record) = self.lock().apps.get_mut(&(*app_uuid, version)) {
            record.status = format!("{status:?}").to_uppercase();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Broker fake
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BrokerInner {
    queues: BTreeMap<String, VecDeque<String>>,
    processing: BTreeMap<String, Vec<String>>,
    delayed: Vec<(Duration, String, String)>,
    dedup: BTreeMap<String, String>,
    retries: BTreeMap<String, u64>,
    enqueued_history: Vec<String>,
}

#[derive(Default)]
pub struct FakeBroker {
    inner: Mutex<BrokerInner>,
}

impl FakeBroker {
    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().expect("broker poisoned")
    }

    /// Job ids ever enqueued to a ready queue (not the delayed set).
    pub fn enqueued_history(&self) -> Vec<String> {
        self.lock().enqueued_history.clone()
    }

    pub fn delayed_jobs(&self) -> Vec<(Duration, Job)> {
        self.lock()
            .delayed
            .iter()
            .map(|(delay, _, payload)| {
                (*delay, serde_json::from_str(payload).expect("delayed job"))
            })
            .collect()
    }

    pub fn queue_len(&self, queue: &QueueName) -> usize {
        self.lock()
            .queues
            .get(&queue.key())
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn enqueue(&self, job: &Job) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(job)?;
        let mut inner = self.lock();
        inner.enqueued_history.push(job.job_id.clone());
        inner
            .queues
            .entry(job.queue().key())
            .or_default()
            .push_back(payload);
        Ok(())
    }

    async fn enqueue_delayed(&self, job: &Job, delay: Duration) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(job)?;
        self.lock()
            .delayed
            .push((delay, job.queue().key(), payload));
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &QueueName,
        consumer: &str,
        _timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let mut inner = self.lock();
        let Some(payload) = inner
            .queues
            .get_mut(&queue.key())
            .and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };
        inner
            .processing
            .entry(consumer.to_string())
            .or_default()
            .push(payload.clone());
        let job: Job = serde_json::from_str(&payload)?;
        Ok(Some(Delivery::new(
            job,
            queue.clone(),
            payload,
            consumer.to_string(),
        )))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        if let Some(processing) = inner.processing.get_mut(delivery.consumer()) {
            if let Some(index) = processing
                .iter()
                .position(|payload| payload == delivery.payload())
            {
                processing.remove(index);
            }
        }
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        self.ack(delivery).await?;
        if requeue {
            self.lock()
                .queues
                .entry(delivery.queue.key())
                .or_default()
                .push_front(delivery.payload().to_string());
        }
        Ok(())
    }

    async fn dedup(
        &self,
        job_id: &str,
        job_uuid: &str,
        _ttl: Duration,
    ) -> Result<bool, BrokerError> {
        let mut inner = self.lock();
        let stored = inner
            .dedup
            .entry(job_id.to_string())
            .or_insert_with(|| job_uuid.to_string());
        Ok(stored == job_uuid)
    }

    async fn dedup_exists(&self, job_id: &str) -> Result<bool, BrokerError> {
        Ok(self.lock().dedup.contains_key(job_id))
    }

    async fn retry_count(&self, job_id: &str) -> Result<u64, BrokerError> {
        let mut inner = self.lock();
        let count = inner.retries.entry(job_id.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn requeue_orphans(
        &self,
        queue: &QueueName,
        consumer: &str,
    ) -> Result<u64, BrokerError> {
        let mut inner = self.lock();
        let orphans = inner
            .processing
            .remove(consumer)
            .unwrap_or_default();
        let moved = orphans.len() as u64;
        let ready = inner.queues.entry(queue.key()).or_default();
        for payload in orphans {
            ready.push_front(payload);
        }
        Ok(moved)
    }
}

// ---------------------------------------------------------------------------
// Log store fake
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LogInner {
    streams: BTreeMap<String, Vec<LogEntry>>,
    barriers: BTreeMap<(String, String), BTreeSet<String>>,
    actions: BTreeMap<(String, String, i32), Vec<ActionToken>>,
    tokens: BTreeMap<String, f64>,
}

#[derive(Default)]
pub struct FakeLogStore {
    inner: Mutex<LogInner>,
}

impl FakeLogStore {
    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().expect("log store poisoned")
    }

    pub fn stream(&self, key: &str) -> Vec<LogEntry> {
        self.lock().streams.get(key).cloned().unwrap_or_default()
    }

    pub fn stream_exists(&self, key: &str) -> bool {
        self.lock().streams.contains_key(key)
    }

    pub fn actions_for(&self, workflow_id: &WorkflowId, task: &str, retry_id: i32) -> Vec<ActionToken> {
        self.lock()
            .actions
            .get(&(workflow_id.0.clone(), task.to_string(), retry_id))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl LogStore for FakeLogStore {
    async fn append(
        &self,
        key: &str,
        entry: &LogEntry,
        max_len: Option<u64>,
    ) -> Result<(), LogStoreError> {
        let mut inner = self.lock();
        let stream = inner.streams.entry(key.to_string()).or_default();
        stream.push(entry.clone());
        if let Some(max_len) = max_len {
            let excess = stream.len().saturating_sub(max_len as usize);
            stream.drain(..excess);
        }
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<LogEntry>, LogStoreError> {
        Ok(self.stream(key))
    }

    async fn delete(&self, keys: &[String]) -> Result<(), LogStoreError> {
        let mut inner = self.lock();
        for key in keys {
            inner.streams.remove(key);
        }
        Ok(())
    }

    async fn barrier_join(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
        member: &str,
        _ttl: Duration,
    ) -> Result<(), LogStoreError> {
        self.lock()
            .barriers
            .entry((workflow_id.0.clone(), group_name.to_string()))
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn barrier_leave(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
        member: &str,
    ) -> Result<(), LogStoreError> {
        if let Some(members) = self
            .lock()
            .barriers
            .get_mut(&(workflow_id.0.clone(), group_name.to_string()))
        {
            members.remove(member);
        }
        Ok(())
    }

    async fn barrier_clear(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
    ) -> Result<(), LogStoreError> {
        self.lock()
            .barriers
            .remove(&(workflow_id.0.clone(), group_name.to_string()));
        Ok(())
    }

    async fn barrier_members(
        &self,
        workflow_id: &WorkflowId,
        group_name: &str,
    ) -> Result<Vec<String>, LogStoreError> {
        Ok(self
            .lock()
            .barriers
            .get(&(workflow_id.0.clone(), group_name.to_string()))
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn push_action(
        &self,
        workflow_id: &WorkflowId,
        task_name: &str,
        retry_id: i32,
        action: &ActionToken,
        _ttl: Duration,
    ) -> Result<(), LogStoreError> {
        self.lock()
            .actions
            .entry((workflow_id.0.clone(), task_name.to_string(), retry_id))
            .or_default()
            .push(action.clone());
        Ok(())
    }

    async fn latest_timestamp(&self, token_key: &str) -> Result<Option<f64>, LogStoreError> {
        Ok(self.lock().tokens.get(token_key).copied())
    }

    async fn set_latest_timestamp(
        &self,
        token_key: &str,
        timestamp: f64,
        _ttl: Duration,
    ) -> Result<(), LogStoreError> {
        self.lock().tokens.insert(token_key.to_string(), timestamp);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage fake
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeStorage {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FakeStorage {
    pub fn blob(&self, prefix: &str, name: &str) -> Option<Vec<u8>> {
        self.blobs
            .lock()
            .expect("storage poisoned")
            .get(&format!("{prefix}/{name}"))
            .cloned()
    }
}

#[async_trait]
impl StorageClient for FakeStorage {
    async fn put(&self, prefix: &str, name: &str, content: &[u8]) -> Result<String, StorageError> {
        let key = format!("{prefix}/{name}");
        self.blobs
            .lock()
            .expect("storage poisoned")
            .insert(key.clone(), content.to_vec());
        Ok(format!("mem://{key}"))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError> {
        let prefix = format!("{prefix}/");
        self.blobs
            .lock()
            .expect("storage poisoned")
            .retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub ctx: JobContext,
    pub store: Arc<FakeStore>,
    pub broker: Arc<FakeBroker>,
    pub logs: Arc<FakeLogStore>,
    pub storage: Arc<FakeStorage>,
    pub service: WorkflowService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(WorkflowSettings::default())
    }

    pub fn with_settings(settings: WorkflowSettings) -> Self {
        let store = Arc::new(FakeStore::default());
        let broker = Arc::new(FakeBroker::default());
        let logs = Arc::new(FakeLogStore::default());
        let storage = Arc::new(FakeStorage::default());
        let ctx = JobContext {
            workflows: store.clone(),
            groups: store.clone(),
            tasks: store.clone(),
            backends: store.clone(),
            pools: store.clone(),
            resources: store.clone(),
            apps: store.clone(),
            broker: broker.clone(),
            logs: logs.clone(),
            storage: storage.clone(),
            renderer: Arc::new(DefaultPodSpecRenderer),
            secrets: Arc::new(NoSecrets),
            notifier: Arc::new(LoggingNotifier),
            settings,
        };
        let service = WorkflowService::new(ctx.clone());
        Self {
            ctx,
            store,
            broker,
            logs,
            storage,
            service,
        }
    }

    pub fn seed_cluster(&self, pool_name: &str, backend_name: &str) {
        let now = Utc::now();
        self.store.insert_backend(Backend {
            name: backend_name.to_string(),
            description: String::new(),
            version: "1.0".to_string(),
            k8s_uid: "uid-1".to_string(),
            k8s_namespace: "osmo".to_string(),
            scheduler_settings: SchedulerSettings::default(),
            node_conditions: NodeConditions::default(),
            last_heartbeat: now,
            created_date: now,
            router_address: String::new(),
        });
        self.store.insert_pool(Pool {
            name: pool_name.to_string(),
            backend: backend_name.to_string(),
            ..Default::default()
        });
    }

    /// Runs the frontend worker algorithm until the queue is empty.
    pub async fn drain_frontend(&self) -> usize {
        let mut handled = 0;
        for _ in 0..1000 {
            let Some(delivery) = self
                .ctx
                .broker
                .dequeue(&QueueName::Frontend, "test-worker", Duration::ZERO)
                .await
                .expect("dequeue")
            else {
                break;
            };
            handled += 1;
            self.settle(delivery).await;
        }
        handled
    }

    async fn settle(&self, delivery: Delivery) {
        let job = delivery.job.clone();
        let accepted = self
            .ctx
            .broker
            .dedup(&job.job_id, &job.job_uuid, UNIQUE_JOB_TTL)
            .await
            .expect("dedup");
        if !accepted {
            self.ctx.broker.ack(&delivery).await.expect("ack");
            return;
        }
        let retries = self
            .ctx
            .broker
            .retry_count(&job.job_id)
            .await
            .expect("retry count");
        if retries > self.ctx.settings.max_retry_per_job {
            jobs::handle_failure(&job, &self.ctx, "retry limit").await;
            self.ctx.broker.ack(&delivery).await.expect("ack");
            return;
        }
        let result = match jobs::execute(&job, &self.ctx).await {
            Ok(result) => result,
            Err(err) if err.retryable() => {
                osmo_control_plane::jobs::JobResult::retry(err.to_string())
            }
            Err(err) => osmo_control_plane::jobs::JobResult::no_retry(err.to_string()),
        };
        match result.status {
            JobStatus::Success => self.ctx.broker.ack(&delivery).await.expect("ack"),
            JobStatus::FailedRetry => self
                .ctx
                .broker
                .reject(&delivery, true)
                .await
                .expect("reject"),
            JobStatus::FailedNoRetry => {
                jobs::handle_failure(&job, &self.ctx, &result.message).await;
                self.ctx.broker.ack(&delivery).await.expect("ack");
            }
        }
    }

    /// Simulates the worker channel delivering one backend job to an agent
    /// that immediately reports success. Returns the handled job, if any.
    pub async fn run_backend_job(&self, backend: &str) -> Option<Job> {
        let queue = QueueName::Backend(backend.to_string());
        let delivery = self
            .ctx
            .broker
            .dequeue(&queue, "test-agent", Duration::ZERO)
            .await
            .expect("dequeue")?;
        let mut job = delivery.job.clone();

        let accepted = self
            .ctx
            .broker
            .dedup(&job.job_id, &job.job_uuid, UNIQUE_JOB_TTL)
            .await
            .expect("dedup");
        if !accepted {
            self.ctx.broker.ack(&delivery).await.expect("ack");
            return Some(job);
        }
        let _ = self
            .ctx
            .broker
            .retry_count(&job.job_id)
            .await
            .expect("retry count");

        match jobs::prepare_execute(&mut job, &self.ctx).await {
            Ok(PrepareOutcome::Ready) => {}
            Ok(PrepareOutcome::Abort(_)) => {
                self.ctx.broker.ack(&delivery).await.expect("ack");
                return Some(job);
            }
            Err(err) => {
                jobs::handle_failure(&job, &self.ctx, &err.to_string()).await;
                self.ctx.broker.ack(&delivery).await.expect("ack");
                return Some(job);
            }
        }

        let result = match jobs::execute(&job, &self.ctx).await {
            Ok(result) => result,
            Err(err) => osmo_control_plane::jobs::JobResult::no_retry(err.to_string()),
        };
        match result.status {
            JobStatus::Success => self.ctx.broker.ack(&delivery).await.expect("ack"),
            JobStatus::FailedRetry => self
                .ctx
                .broker
                .reject(&delivery, true)
                .await
                .expect("reject"),
            JobStatus::FailedNoRetry => {
                jobs::handle_failure(&job, &self.ctx, &result.message).await;
                self.ctx.broker.ack(&delivery).await.expect("ack");
            }
        }
        Some(job)
    }

    /// Drains the backend queue, acking every job as a successful agent
    /// would. Returns the jobs handled.
    pub async fn drain_backend(&self, backend: &str) -> Vec<Job> {
        let mut jobs = Vec::new();
        while let Some(job) = self.run_backend_job(backend).await {
            jobs.push(job);
            if jobs.len() > 100 {
                panic!("backend queue did not drain");
            }
        }
        jobs
    }

    /// Enqueues the status update the listener channel would produce for
    /// an agent pod report.
    pub async fn report(
        &self,
        workflow_id: &WorkflowId,
        task_name: &str,
        retry_id: i32,
        status: TaskGroupStatus,
        exit_code: Option<i32>,
    ) {
        let workflow = self.store.workflow(workflow_id);
        let task = self.store.task(workflow_id, task_name, retry_id);
        let job = Job::new(JobPayload::UpdateGroup(UpdateGroup {
            workflow_id: workflow_id.clone(),
            workflow_uuid: workflow.workflow_uuid,
            group_name: task.group_name.clone(),
            task_name: Some(task.name.clone()),
            retry_id: Some(retry_id),
            status,
            message: String::new(),
            user: workflow.user.clone(),
            exit_code,
            force_cancel: false,
            lead_task: task.lead,
        }));
        self.ctx.broker.enqueue(&job).await.expect("enqueue");
    }
}
