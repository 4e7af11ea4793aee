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

use lazy_static::lazy_static;
use prometheus::{
    histogram_opts, opts, register_counter_vec_with_registry,
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry, CounterVec,
    HistogramVec, IntCounterVec, Registry,
};
use std::time::Duration;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    pub static ref JOB_COUNT: IntCounterVec = register_int_counter_vec_with_registry!(
        opts!("osmo_worker_job_count", "Number of jobs processed"),
        &["job_type", "job_status"],
        REGISTRY
    )
    .unwrap();
    pub static ref JOB_PROCESSING_TIME: HistogramVec = register_histogram_vec_with_registry!(
        histogram_opts!(
            "osmo_worker_job_processing_time",
            "Job processing time in seconds"
        ),
        &["job_type"],
        REGISTRY
    )
    .unwrap();
    pub static ref BACKEND_EVENT_COUNT: IntCounterVec = register_int_counter_vec_with_registry!(
        opts!(
            "osmo_backend_event_count",
            "Number of events sent from the backend"
        ),
        &["type", "backend"],
        REGISTRY
    )
    .unwrap();
    pub static ref BACKEND_EVENT_PROCESSING_TIME: HistogramVec =
        register_histogram_vec_with_registry!(
            histogram_opts!(
                "osmo_backend_event_processing_time",
                "Time taken to process an event from a backend"
            ),
            &["type", "backend"],
            REGISTRY
        )
        .unwrap();
    pub static ref AGENT_FORWARDED_METRICS: CounterVec =
        register_counter_vec_with_registry!(
            opts!(
                "osmo_backend_forwarded_metric",
                "Metric samples forwarded by backend agents"
            ),
            &["name", "backend"],
            REGISTRY
        )
        .unwrap();
}

pub fn register_all() -> Registry {
    REGISTRY.clone()
}

pub fn record_job(job_type: &str, job_status: &str, elapsed: Duration) {
    JOB_COUNT.with_label_values(&[job_type, job_status]).inc();
    JOB_PROCESSING_TIME
        .with_label_values(&[job_type])
        .observe(elapsed.as_secs_f64());
}

pub fn record_backend_event(message_type: &str, backend: &str, elapsed: Duration) {
    BACKEND_EVENT_COUNT
        .with_label_values(&[message_type, backend])
        .inc();
    BACKEND_EVENT_PROCESSING_TIME
        .with_label_values(&[message_type, backend])
        .observe(elapsed.as_secs_f64());
}
