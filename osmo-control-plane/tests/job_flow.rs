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

//! End-to-end job-flow scenarios over the in-memory fakes: submission,
//! the happy path, upstream-failure cascades, cancellation and replay
//! idempotence.

mod support;

use osmo_common::model::{JobStatus, TaskGroupStatus, WorkflowPriority, WorkflowStatus};
use osmo_control_plane::broker::streams::workflow_log_key;
use osmo_control_plane::jobs::{self, Job, JobPayload, UpdateGroup};
use osmo_control_plane::model::spec::{GroupSpec, TaskInput, TaskSpec, WorkflowSpec};
use osmo_control_plane::service::workflow::SubmitWorkflowRequest;
use support::Harness;
use test_r::test;

test_r::enable!();

fn task(name: &str, lead: bool, inputs: Vec<&str>) -> TaskSpec {
    TaskSpec {
        name: name.to_string(),
        image: "busybox:latest".to_string(),
        command: vec!["run".to_string()],
        lead,
        inputs: inputs
            .into_iter()
            .map(|reference| TaskInput::Task {
                task: reference.to_string(),
            })
            .collect(),
        ..Default::default()
    }
}

fn single_task_spec() -> WorkflowSpec {
    WorkflowSpec {
        groups: vec![GroupSpec {
            name: "g1".to_string(),
            tasks: vec![task("t1", true, vec![])],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn chain_spec() -> WorkflowSpec {
    WorkflowSpec {
        groups: vec![
            GroupSpec {
                name: "g1".to_string(),
                tasks: vec![task("t1", true, vec![])],
                ..Default::default()
            },
            GroupSpec {
                name: "g2".to_string(),
                tasks: vec![task("t2", true, vec!["t1"])],
                ..Default::default()
            },
            GroupSpec {
                name: "g3".to_string(),
                tasks: vec![task("t3", true, vec!["t2"])],
                ..Default::default()
            },
        ],
        ..Default::default()
    }
}

fn request(name: &str, spec: WorkflowSpec) -> SubmitWorkflowRequest {
    SubmitWorkflowRequest {
        name: name.to_string(),
        spec,
        user: "alice".to_string(),
        pool: "default".to_string(),
        priority: WorkflowPriority::Normal,
        is_admin: false,
        parent_workflow_id: None,
        app_uuid: None,
        app_version: None,
    }
}

#[test]
async fn happy_path_single_task() {
    let harness = Harness::new();
    harness.seed_cluster("default", "cluster-a");

    let response = harness
        .service
        .submit(request("demo", single_task_spec()))
        .await
        .unwrap();
    let workflow_id = response.workflow_id.clone();
    harness.drain_frontend().await;

    let workflow = harness.store.workflow(&workflow_id);
    assert_eq!(workflow.status, WorkflowStatus::Pending);
    assert_eq!(
        harness.store.group(&workflow_id, "g1").status,
        TaskGroupStatus::Processing
    );
    assert_eq!(
        harness.store.task(&workflow_id, "t1", 0).status,
        TaskGroupStatus::Processing
    );
    // The queue-timeout probe is parked on the delayed queue.
    assert_eq!(harness.broker.delayed_jobs().len(), 1);

    // The backend agent picks up the CreateGroup and acks it.
    let dispatched = harness.drain_backend("cluster-a").await;
    assert_eq!(dispatched.len(), 1);
    assert!(matches!(dispatched[0].payload, JobPayload::CreateGroup(_)));

    // Rendering attached the pod specs and queued their archival.
    harness.drain_frontend().await;
    assert!(harness.storage.blob(&workflow_id.0, "t1.spec").is_some());

    for status in [
        TaskGroupStatus::Scheduling,
        TaskGroupStatus::Initializing,
        TaskGroupStatus::Running,
    ] {
        harness.report(&workflow_id, "t1", 0, status, None).await;
        harness.drain_frontend().await;
    }
    assert_eq!(
        harness.store.task(&workflow_id, "t1", 0).status,
        TaskGroupStatus::Running
    );
    assert_eq!(
        harness.store.group(&workflow_id, "g1").status,
        TaskGroupStatus::Running
    );
    let workflow = harness.store.workflow(&workflow_id);
    assert_eq!(workflow.status, WorkflowStatus::Running);
    assert!(workflow.start_time.is_some());
    // A run-timeout probe joined the queue-timeout probe.
    assert_eq!(harness.broker.delayed_jobs().len(), 2);

    harness
        .report(&workflow_id, "t1", 0, TaskGroupStatus::Completed, Some(0))
        .await;
    harness.drain_frontend().await;

    let task = harness.store.task(&workflow_id, "t1", 0);
    assert_eq!(task.status, TaskGroupStatus::Completed);
    assert_eq!(task.exit_code, Some(0));
    assert_eq!(
        harness.store.group(&workflow_id, "g1").status,
        TaskGroupStatus::Completed
    );
    assert_eq!(
        harness.store.workflow(&workflow_id).status,
        WorkflowStatus::Completed
    );

    // Cleanup: the backend removes cluster objects, then the workflow's
    // streams are archived exactly once.
    let cleanups = harness.drain_backend("cluster-a").await;
    assert!(cleanups
        .iter()
        .any(|job| matches!(job.payload, JobPayload::CleanupGroup(_))));
    harness.drain_frontend().await;

    let workflow = harness.store.workflow(&workflow_id);
    assert!(workflow.logs.starts_with("mem://"));
    assert!(workflow.events.starts_with("mem://"));
    assert!(!harness.logs.stream_exists(&workflow_log_key(&workflow_id)));

    let cleanup_id = format!("{}-cleanup", workflow.workflow_uuid);
    let cleanup_enqueues = harness
        .broker
        .enqueued_history()
        .into_iter()
        .filter(|job_id| *job_id == cleanup_id)
        .count();
    assert_eq!(cleanup_enqueues, 1);
}

#[test]
async fn replaying_a_processed_update_is_a_no_op() {
    let harness = Harness::new();
    harness.seed_cluster("default", "cluster-a");
    let response = harness
        .service
        .submit(request("demo", single_task_spec()))
        .await
        .unwrap();
    let workflow_id = response.workflow_id.clone();
    harness.drain_frontend().await;
    harness.drain_backend("cluster-a").await;
    harness.drain_frontend().await;
    harness
        .report(&workflow_id, "t1", 0, TaskGroupStatus::Completed, Some(0))
        .await;
    harness.drain_frontend().await;
    harness.drain_backend("cluster-a").await;
    harness.drain_frontend().await;

    let group_before = harness.store.group(&workflow_id, "g1");
    let history_before = harness.broker.enqueued_history().len();

    // Same deterministic job id, new instance uuid: the worker observes
    // the dedup key and skips it.
    let workflow = harness.store.workflow(&workflow_id);
    let replay = Job::new(JobPayload::UpdateGroup(UpdateGroup {
        workflow_id: workflow_id.clone(),
        workflow_uuid: workflow.workflow_uuid,
        group_name: "g1".to_string(),
        task_name: Some("t1".to_string()),
        retry_id: Some(0),
        status: TaskGroupStatus::Completed,
        message: String::new(),
        user: "alice".to_string(),
        exit_code: Some(0),
        force_cancel: false,
        lead_task: true,
    }));
    harness.ctx.broker.enqueue(&replay).await.unwrap();
    harness.drain_frontend().await;

    let group_after = harness.store.group(&workflow_id, "g1");
    assert_eq!(group_after.status, group_before.status);
    assert_eq!(group_after.end_time, group_before.end_time);
    // Only the replay enqueue itself was recorded; it spawned nothing.
    assert_eq!(
        harness.broker.enqueued_history().len(),
        history_before + 1
    );

    // A broker redelivery carries the original instance uuid, so it passes
    // the dedup check and re-enters the handler; the guarded writes report
    // no transition and nothing cascades.
    let result = jobs::execute(&replay, &harness.ctx).await.unwrap();
    assert_eq!(result.status, JobStatus::Success);
    assert_eq!(
        harness.store.group(&workflow_id, "g1").status,
        group_before.status
    );
    assert_eq!(
        harness.broker.enqueued_history().len(),
        history_before + 1
    );
    assert_eq!(
        harness
            .broker
            .queue_len(&jobs::QueueName::Backend("cluster-a".to_string())),
        0
    );
}

#[test]
async fn completed_groups_unlock_downstream() {
    let harness = Harness::new();
    harness.seed_cluster("default", "cluster-a");
    let response = harness
        .service
        .submit(request("chain", chain_spec()))
        .await
        .unwrap();
    let workflow_id = response.workflow_id.clone();
    harness.drain_frontend().await;
    harness.drain_backend("cluster-a").await;
    harness.drain_frontend().await;

    harness
        .report(&workflow_id, "t1", 0, TaskGroupStatus::Completed, Some(0))
        .await;
    harness.drain_frontend().await;

    // g1's completion removed it from g2's upstream set and dispatched g2.
    assert_eq!(
        harness.store.group(&workflow_id, "g1").status,
        TaskGroupStatus::Completed
    );
    let g2 = harness.store.group(&workflow_id, "g2");
    assert_eq!(g2.status, TaskGroupStatus::Processing);
    assert!(g2.remaining_upstream.is_empty());
    assert_eq!(
        harness.store.group(&workflow_id, "g3").status,
        TaskGroupStatus::Waiting
    );

    // A redelivery of g1's completion finds no transition left to make and
    // must not dispatch g2 a second time.
    let workflow = harness.store.workflow(&workflow_id);
    let history_before = harness.broker.enqueued_history().len();
    let replay = Job::new(JobPayload::UpdateGroup(UpdateGroup {
        workflow_id: workflow_id.clone(),
        workflow_uuid: workflow.workflow_uuid,
        group_name: "g1".to_string(),
        task_name: Some("t1".to_string()),
        retry_id: Some(0),
        status: TaskGroupStatus::Completed,
        message: String::new(),
        user: "alice".to_string(),
        exit_code: Some(0),
        force_cancel: false,
        lead_task: true,
    }));
    let result = jobs::execute(&replay, &harness.ctx).await.unwrap();
    assert_eq!(result.status, JobStatus::Success);
    assert_eq!(harness.broker.enqueued_history().len(), history_before);

    harness.drain_backend("cluster-a").await;
    harness.drain_frontend().await;
    harness
        .report(&workflow_id, "t2", 0, TaskGroupStatus::Completed, Some(0))
        .await;
    harness.drain_frontend().await;
    assert_eq!(
        harness.store.group(&workflow_id, "g3").status,
        TaskGroupStatus::Processing
    );

    harness.drain_backend("cluster-a").await;
    harness.drain_frontend().await;
    harness
        .report(&workflow_id, "t3", 0, TaskGroupStatus::Completed, Some(0))
        .await;
    harness.drain_frontend().await;
    assert_eq!(
        harness.store.workflow(&workflow_id).status,
        WorkflowStatus::Completed
    );

    // Remaining cleanups settle into exactly one workflow archive.
    harness.drain_backend("cluster-a").await;
    harness.drain_frontend().await;
    let cleanup_id = format!("{}-cleanup", workflow.workflow_uuid);
    assert_eq!(
        harness
            .broker
            .enqueued_history()
            .into_iter()
            .filter(|job_id| *job_id == cleanup_id)
            .count(),
        1
    );
}

#[test]
async fn upstream_failure_cascades_downstream() {
    let harness = Harness::new();
    harness.seed_cluster("default", "cluster-a");
    let response = harness
        .service
        .submit(request("chain", chain_spec()))
        .await
        .unwrap();
    let workflow_id = response.workflow_id.clone();
    harness.drain_frontend().await;

    // Only the root group dispatches.
    assert_eq!(
        harness.store.group(&workflow_id, "g1").status,
        TaskGroupStatus::Processing
    );
    assert_eq!(
        harness.store.group(&workflow_id, "g2").status,
        TaskGroupStatus::Waiting
    );

    harness.drain_backend("cluster-a").await;
    harness.drain_frontend().await;

    harness
        .report(&workflow_id, "t1", 0, TaskGroupStatus::Failed, Some(1))
        .await;
    harness.drain_frontend().await;

    assert_eq!(
        harness.store.group(&workflow_id, "g1").status,
        TaskGroupStatus::Failed
    );
    for group in ["g2", "g3"] {
        assert_eq!(
            harness.store.group(&workflow_id, group).status,
            TaskGroupStatus::FailedUpstream,
            "group {group}"
        );
    }
    assert_eq!(
        harness.store.task(&workflow_id, "t2", 0).status,
        TaskGroupStatus::FailedUpstream
    );
    assert_eq!(
        harness.store.workflow(&workflow_id).status,
        WorkflowStatus::FailedUpstream
    );

    // Completed work is not rolled back, failed groups are cleaned up and
    // the workflow archives once.
    harness.drain_backend("cluster-a").await;
    harness.drain_frontend().await;
    let workflow = harness.store.workflow(&workflow_id);
    let cleanup_id = format!("{}-cleanup", workflow.workflow_uuid);
    assert_eq!(
        harness
            .broker
            .enqueued_history()
            .into_iter()
            .filter(|job_id| *job_id == cleanup_id)
            .count(),
        1
    );
}

#[test]
async fn cancel_defers_while_group_is_processing() {
    let harness = Harness::new();
    harness.seed_cluster("default", "cluster-a");
    let response = harness
        .service
        .submit(request("demo", single_task_spec()))
        .await
        .unwrap();
    let workflow_id = response.workflow_id.clone();
    harness.drain_frontend().await;
    assert_eq!(
        harness.store.group(&workflow_id, "g1").status,
        TaskGroupStatus::Processing
    );
    let delayed_before = harness.broker.delayed_jobs().len();

    harness
        .service
        .cancel(&workflow_id, "alice", None, false)
        .await
        .unwrap();
    harness.drain_frontend().await;

    // The cancel yields to the in-flight CreateGroup and re-queues itself.
    assert_eq!(
        harness.store.group(&workflow_id, "g1").status,
        TaskGroupStatus::Processing
    );
    assert_eq!(
        harness.store.task(&workflow_id, "t1", 0).status,
        TaskGroupStatus::Processing
    );
    let deferred: Vec<_> = harness
        .broker
        .delayed_jobs()
        .into_iter()
        .skip(delayed_before)
        .collect();
    assert!(deferred
        .iter()
        .any(|(_, job)| matches!(job.payload, JobPayload::UpdateGroup(_))));
}

#[test]
async fn force_cancel_bypasses_processing() {
    let harness = Harness::new();
    harness.seed_cluster("default", "cluster-a");
    let response = harness
        .service
        .submit(request("demo", single_task_spec()))
        .await
        .unwrap();
    let workflow_id = response.workflow_id.clone();
    harness.drain_frontend().await;
    assert_eq!(
        harness.store.group(&workflow_id, "g1").status,
        TaskGroupStatus::Processing
    );

    harness
        .service
        .cancel(&workflow_id, "alice", None, true)
        .await
        .unwrap();
    harness.drain_frontend().await;

    let group = harness.store.group(&workflow_id, "g1");
    assert_eq!(group.status, TaskGroupStatus::FailedCanceled);
    assert_eq!(
        harness.store.task(&workflow_id, "t1", 0).status,
        TaskGroupStatus::FailedCanceled
    );
    let workflow = harness.store.workflow(&workflow_id);
    assert_eq!(workflow.status, WorkflowStatus::FailedCanceled);
    assert_eq!(workflow.cancelled_by.as_deref(), Some("alice"));

    // The forced cleanup goes straight to the backend queue.
    let cleanups = harness.drain_backend("cluster-a").await;
    assert!(cleanups.iter().any(|job| {
        matches!(&job.payload, JobPayload::CleanupGroup(payload) if payload.force_delete)
    }));

    // The still-queued CreateGroup aborts once an agent finally sees it.
    assert_eq!(
        harness.store.group(&workflow_id, "g1").status,
        TaskGroupStatus::FailedCanceled
    );
}
