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

//! Retry, timeout-extension and barrier scenarios.

mod support;

use chrono::Utc;
use osmo_common::model::{TaskGroupStatus, WorkflowPriority, WorkflowStatus};
use osmo_control_plane::broker::streams::{ActionToken, LogStore};
use osmo_control_plane::config::WorkflowSettings;
use osmo_control_plane::jobs::{self, CheckQueueTimeout, Job, JobPayload};
use osmo_control_plane::model::spec::{GroupSpec, TaskSpec, TimeoutSpec, WorkflowSpec};
use osmo_control_plane::service::workflow::SubmitWorkflowRequest;
use std::collections::BTreeMap;
use std::time::Duration;
use support::Harness;
use test_r::test;

test_r::enable!();

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
async fn exit_action_reschedules_until_the_retry_budget_is_spent() {
    let settings = WorkflowSettings {
        max_retry_per_task: 2,
        ..Default::default()
    };
    let harness = Harness::with_settings(settings);
    harness.seed_cluster("default", "cluster-a");

    let spec = WorkflowSpec {
        groups: vec![GroupSpec {
            name: "g1".to_string(),
            tasks: vec![TaskSpec {
                name: "t1".to_string(),
                image: "trainer:latest".to_string(),
                lead: true,
                exit_actions: BTreeMap::from([(
                    "RESCHEDULED".to_string(),
                    "137,139".to_string(),
                )]),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    };
    let response = harness.service.submit(request("retry", spec)).await.unwrap();
    let workflow_id = response.workflow_id.clone();
    harness.drain_frontend().await;
    harness.drain_backend("cluster-a").await;
    harness.drain_frontend().await;

    // First OOM-style exit: rewritten to RESCHEDULED, retry row inserted.
    harness
        .report(&workflow_id, "t1", 0, TaskGroupStatus::Failed, Some(137))
        .await;
    harness.drain_frontend().await;

    let retries = harness.store.task_retries(&workflow_id, "t1");
    assert_eq!(retries.len(), 2);
    assert_eq!(retries[0].status, TaskGroupStatus::Rescheduled);
    assert_eq!(retries[1].status, TaskGroupStatus::Processing);
    assert_eq!(retries[1].retry_id, 1);
    // The retry bundle travels to the backend.
    let reschedules = harness.drain_backend("cluster-a").await;
    assert!(reschedules
        .iter()
        .any(|job| matches!(job.payload, JobPayload::RescheduleTask(_))));

    // Second exit with the same code.
    harness
        .report(&workflow_id, "t1", 1, TaskGroupStatus::Failed, Some(137))
        .await;
    harness.drain_frontend().await;
    harness.drain_backend("cluster-a").await;

    let retries = harness.store.task_retries(&workflow_id, "t1");
    assert_eq!(retries.len(), 3);
    assert_eq!(retries[2].retry_id, 2);

    // Third exit: the budget is spent and the failure stands.
    harness
        .report(&workflow_id, "t1", 2, TaskGroupStatus::Failed, Some(137))
        .await;
    harness.drain_frontend().await;

    let retries = harness.store.task_retries(&workflow_id, "t1");
    assert_eq!(retries.len(), 3);
    assert_eq!(retries[2].status, TaskGroupStatus::Failed);
    assert!(retries[2]
        .failure_message
        .as_deref()
        .unwrap_or_default()
        .contains("No exit action applied due to retry limit 2."));
    assert_eq!(
        harness.store.group(&workflow_id, "g1").status,
        TaskGroupStatus::Failed
    );
    assert_eq!(
        harness.store.workflow(&workflow_id).status,
        WorkflowStatus::Failed
    );

    // Every retry id appears exactly once.
    for (expected, task) in retries.iter().enumerate() {
        assert_eq!(task.retry_id, expected as i32);
    }
}

#[test]
async fn queue_timeout_extension_prevents_cancellation() {
    let harness = Harness::new();
    harness.seed_cluster("default", "cluster-a");

    let spec = WorkflowSpec {
        groups: vec![GroupSpec {
            name: "g1".to_string(),
            tasks: vec![TaskSpec {
                name: "t1".to_string(),
                image: "busybox:latest".to_string(),
                lead: true,
                ..Default::default()
            }],
            ..Default::default()
        }],
        timeout: TimeoutSpec {
            queue_timeout: Some(Duration::from_secs(10 * 60)),
            exec_timeout: None,
        },
    };
    let response = harness.service.submit(request("queued", spec)).await.unwrap();
    let workflow_id = response.workflow_id.clone();
    harness.drain_frontend().await;
    harness.drain_backend("cluster-a").await;
    harness.drain_frontend().await;
    harness
        .report(&workflow_id, "t1", 0, TaskGroupStatus::Scheduling, None)
        .await;
    harness.drain_frontend().await;
    assert_eq!(
        harness.store.workflow(&workflow_id).status,
        WorkflowStatus::Pending
    );

    // The operator extends the timeout to 30 minutes just before the
    // 10-minute check fires.
    harness
        .store
        .set_submit_time(&workflow_id, Utc::now() - chrono::Duration::minutes(10));
    harness
        .service
        .extend_timeouts(&workflow_id, Some(Duration::from_secs(30 * 60)), None)
        .await
        .unwrap();

    let workflow = harness.store.workflow(&workflow_id);
    let delayed_before = harness.broker.delayed_jobs().len();
    let check = CheckQueueTimeout {
        workflow_id: workflow_id.clone(),
        workflow_uuid: workflow.workflow_uuid,
    };
    jobs::execute(
        &Job::new(JobPayload::CheckQueueTimeout(check.clone())),
        &harness.ctx,
    )
    .await
    .unwrap();

    // No cancellation; the check rescheduled itself for the remainder.
    assert_eq!(
        harness.store.workflow(&workflow_id).status,
        WorkflowStatus::Pending
    );
    let delayed = harness.broker.delayed_jobs();
    assert_eq!(delayed.len(), delayed_before + 1);
    let (delay, _) = delayed.last().unwrap();
    assert!(
        *delay > Duration::from_secs(19 * 60) && *delay < Duration::from_secs(21 * 60),
        "unexpected re-check delay {delay:?}"
    );

    // At the 30-minute wall clock the extended timeout has elapsed.
    harness
        .store
        .set_submit_time(&workflow_id, Utc::now() - chrono::Duration::minutes(30));
    jobs::execute(&Job::new(JobPayload::CheckQueueTimeout(check)), &harness.ctx)
        .await
        .unwrap();
    harness.drain_frontend().await;

    assert_eq!(
        harness.store.workflow(&workflow_id).status,
        WorkflowStatus::FailedQueueTimeout
    );
    assert_eq!(
        harness.store.task(&workflow_id, "t1", 0).status,
        TaskGroupStatus::FailedQueueTimeout
    );
}

#[test]
async fn barrier_fires_once_all_active_members_arrived() {
    let harness = Harness::new();
    harness.seed_cluster("default", "cluster-a");

    let spec = WorkflowSpec {
        groups: vec![GroupSpec {
            name: "g1".to_string(),
            barrier: true,
            tasks: vec![
                TaskSpec {
                    name: "t1".to_string(),
                    image: "busybox:latest".to_string(),
                    lead: true,
                    ..Default::default()
                },
                TaskSpec {
                    name: "t2".to_string(),
                    image: "busybox:latest".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }],
        ..Default::default()
    };
    let response = harness.service.submit(request("gang", spec)).await.unwrap();
    let workflow_id = response.workflow_id.clone();
    harness.drain_frontend().await;
    harness.drain_backend("cluster-a").await;
    harness.drain_frontend().await;

    // Both task controllers joined the rendezvous.
    harness
        .logs
        .barrier_join(&workflow_id, "g1", "t1", Duration::from_secs(3600))
        .await
        .unwrap();
    harness
        .logs
        .barrier_join(&workflow_id, "g1", "t2", Duration::from_secs(3600))
        .await
        .unwrap();

    // The non-lead finishes; the remaining member covers every task still
    // active, so the barrier releases it.
    harness
        .report(&workflow_id, "t2", 0, TaskGroupStatus::Completed, Some(0))
        .await;
    harness.drain_frontend().await;

    assert_eq!(
        harness.store.task(&workflow_id, "t2", 0).status,
        TaskGroupStatus::Completed
    );
    assert_eq!(
        harness.logs.actions_for(&workflow_id, "t1", 0),
        vec![ActionToken::Barrier]
    );
    assert!(!harness
        .store
        .group(&workflow_id, "g1")
        .status
        .group_finished());

    // The lead finishes; the group and workflow complete.
    harness
        .report(&workflow_id, "t1", 0, TaskGroupStatus::Completed, Some(0))
        .await;
    harness.drain_frontend().await;
    assert_eq!(
        harness.store.group(&workflow_id, "g1").status,
        TaskGroupStatus::Completed
    );
    assert_eq!(
        harness.store.workflow(&workflow_id).status,
        WorkflowStatus::Completed
    );
}
