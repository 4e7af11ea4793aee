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

use axum::routing::get;
use axum::Router;
use osmo_common::tracing::init_tracing_with_default_env_filter;
use osmo_common::SafeDisplay;
use osmo_control_plane::agent::{self, AgentState};
use osmo_control_plane::bootstrap::Services;
use osmo_control_plane::broker::delayed::DelayedJobMonitor;
use osmo_control_plane::config::{make_config_loader, ControlPlaneConfig};
use osmo_control_plane::metrics;
use osmo_control_plane::progress::ProgressWriter;
use osmo_control_plane::worker::FrontendWorker;
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    match make_config_loader().load_or_dump_config() {
        Some(config) => {
            init_tracing_with_default_env_filter(&config.tracing);
            let registry = metrics::register_all();

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(run(config, registry))
        }
        None => Ok(()),
    }
}

async fn run(config: ControlPlaneConfig, registry: Registry) -> Result<(), Box<dyn std::error::Error>> {
    info!("OSMO control plane starting\n{}", config.to_safe_string());

    let services = Services::new(&config).await?;
    let shutdown = CancellationToken::new();
    let mut background = JoinSet::new();

    let progress = ProgressWriter::new(&config.workers.progress_file);
    for index in 0..config.workers.count {
        let worker = FrontendWorker::new(
            services.job_context.clone(),
            index,
            config.workers.dequeue_timeout,
            progress.clone(),
            shutdown.clone(),
        );
        background.spawn(worker.run());
    }

    let monitor = DelayedJobMonitor::new(
        services.broker.clone(),
        config.workers.delayed_poll_interval,
    );
    background.spawn(monitor.run(shutdown.clone()));

    let agent_state = Arc::new(AgentState {
        ctx: services.job_context.clone(),
        config: config.agent.clone(),
    });
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move {
                    let mut buffer = Vec::new();
                    let encoder = TextEncoder::new();
                    if encoder.encode(&registry.gather(), &mut buffer).is_err() {
                        return String::new();
                    }
                    String::from_utf8(buffer).unwrap_or_default()
                }
            }),
        )
        .merge(agent::router(agent_state));

    let address = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.http_port);
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("Listening on {address}");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await?;

    info!("Draining workers");
    shutdown.cancel();
    while background.join_next().await.is_some() {}
    Ok(())
}
