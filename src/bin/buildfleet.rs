// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use async_trait::async_trait;
use buildfleet_config::FleetConfig;
use buildfleet_error::{Error, ResultExt};
use buildfleet_scheduler::queue_coordinator::{FleetCollections, QueueCoordinator};
use buildfleet_scheduler::result_publisher::{JobResultNotification, ResultPublisher, ResultSink};
use buildfleet_store::memory_cluster::MemoryCluster;
use buildfleet_util::init_tracing;
use buildfleet_util::instant_wrapper::default_instant_wrapper;
use clap::Parser;
#[cfg(target_family = "unix")]
use tokio::signal::unix::{SignalKind, signal};
use tracing::{Instrument, Level, event, trace_span};

/// Build job queue coordinator for a fleet of build agents.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Config file to use.
    #[clap(value_parser)]
    config_file: String,
}

/// Sink for standalone runs. Results are only logged.
#[derive(Debug, Clone, Copy)]
struct LoggingResultSink;

#[async_trait]
impl ResultSink for LoggingResultSink {
    async fn publish(&self, notification: &JobResultNotification) -> Result<(), Error> {
        event!(
            Level::INFO,
            job_id = %notification.job_id,
            status = ?notification.status,
            failure_reason = ?notification.failure_reason,
            participation_id = notification.item.job.participation_id,
            "Build job result"
        );
        Ok(())
    }
}

fn get_config() -> Result<FleetConfig, Error> {
    let args = Args::parse();
    let json_contents = std::fs::read_to_string(&args.config_file)
        .err_tip(|| format!("Could not open config file {}", args.config_file))?;
    serde_json5::from_str(&json_contents).err_tip(|| format!("Could not parse config file {}", args.config_file))
}

#[cfg(target_family = "unix")]
async fn wait_for_sigterm() -> Result<(), Error> {
    signal(SignalKind::terminate())
        .err_tip(|| "Failed to listen to SIGTERM")?
        .recv()
        .await;
    Ok(())
}

#[cfg(not(target_family = "unix"))]
async fn wait_for_sigterm() -> Result<(), Error> {
    core::future::pending().await
}

async fn inner_main(cfg: FleetConfig) -> Result<(), Error> {
    let cluster = MemoryCluster::new();
    let collections = FleetCollections::from_memory_cluster(&cluster, &cfg.cluster)?;
    let publisher = ResultPublisher::new(&cfg.result_publisher, Arc::new(LoggingResultSink));
    let coordinator = QueueCoordinator::new(
        &cfg.coordinator,
        &cfg.cluster.instance_name,
        collections,
        publisher.clone(),
        Arc::new(default_instant_wrapper()),
    )
    .err_tip(|| "Creating queue coordinator")?;
    let dispatch_loop = coordinator.spawn_dispatch_loop();
    event!(Level::WARN, ?coordinator, "Ready, waiting for build agents");

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.err_tip(|| "Failed to listen to SIGINT")?;
            event!(Level::WARN, "User terminated process via SIGINT");
        }
        res = wait_for_sigterm() => {
            res?;
            event!(Level::WARN, "Process terminated via SIGTERM");
        }
    }

    drop(dispatch_loop);
    publisher.shutdown().await;
    event!(
        Level::WARN,
        published = publisher.published_count(),
        dropped = publisher.dropped_count(),
        "Successfully shut down buildfleet"
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn core::error::Error>> {
    init_tracing()?;

    let cfg = get_config()?;

    #[allow(clippy::disallowed_methods)]
    {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime
            .block_on(inner_main(cfg).instrument(trace_span!("main")))
            .err_tip(|| "main() function failed")?;
    }
    Ok(())
}
