// Copyright 2025 Ladle Contributors
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
//
// SPDX-License-Identifier: Apache-2.0

//! `ladle-service`: runs one change-feed processor against a `MongoDB` database.
//!
//! Configuration comes from the environment (see [`config::ServiceConfig`]).
//! The process runs until SIGINT/SIGTERM or until the processor fails; a
//! failure exits with status 1 so the supervisor restarts it, and the new
//! process resumes from the last checkpoint.
//!
//! ```bash
//! MONGODB_URI="mongodb://localhost:27017/?replicaSet=rs0" \
//! LADLE_FEED_ID=kitchen \
//! REDIS_URL=redis://localhost:6379 \
//! LADLE_PUBLISH_STREAM=kitchen.changes \
//!     cargo run -p ladle-service
//! ```

mod config;

use config::{CheckpointBackend, ServiceConfig};
use ladle_core::checkpoint::CheckpointStore;
use ladle_core::heartbeat::MongoHeartbeatWriter;
use ladle_core::metrics;
use ladle_core::processor::{ChangeFeedProcessor, ProcessorState};
use ladle_core::stream::{MongoChangeFeed, MongoFeedConfig};
use ladle_handlers::redis_stream::{RedisStreamConfig, RedisStreamPublisher};
use ladle_stores::memory::MemoryStore;
use ladle_stores::mongo::MongoCheckpointStore;
use ladle_stores::redis::{RedisConfig, RedisStore};
use metrics_exporter_prometheus::PrometheusBuilder;
use mongodb::Client;
use std::error::Error;
use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

type BoxError = Box<dyn Error + Send + Sync>;

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "ladle-service stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), BoxError> {
    let config = ServiceConfig::from_env()?;
    info!(
        feed_id = %config.feed_id,
        checkpoint_backend = %config.checkpoint_backend,
        heartbeat_interval_secs = config.heartbeat_interval.as_secs(),
        "Starting ladle-service"
    );

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!(%addr, "Prometheus exporter listening");
    }
    metrics::init_metrics();

    let client = Client::with_uri_str(&config.mongodb_uri).await?;
    let database = client.database(&config.feed_id);

    let store = open_store(&config, &database).await?;
    let writer = MongoHeartbeatWriter::with_collection(&database, &config.heartbeat_collection);
    let feed = MongoChangeFeed::new(
        database.clone(),
        MongoFeedConfig::builder().full_document_update_lookup().build()?,
    );

    let mut processor = ChangeFeedProcessor::new(
        config.processor_config()?,
        Arc::new(feed),
        Arc::clone(&store),
        Arc::new(writer),
    )?;

    match (&config.publish, &config.redis_url) {
        (Some(publish), Some(redis_url)) => {
            let mut builder = RedisStreamConfig::builder()
                .url(redis_url)
                .stream(&publish.stream);
            if !publish.collections.is_empty() {
                builder = builder.collections(publish.collections.iter().cloned());
            }
            if let Some(field) = &publish.group_key_field {
                builder = builder.group_key_field(field);
            }
            processor.register_handler(RedisStreamPublisher::new(builder.build()?).await?)?;
        }
        _ => warn!("No publisher configured; changes are checkpointed but not forwarded"),
    }

    processor.start().await?;
    wait_for_shutdown(shutdown_signal(), processor.subscribe_state()).await;

    let outcome = processor.stop().await;

    let stats = processor.stats().await;
    info!(
        dispatched = stats.events_dispatched,
        heartbeats = stats.heartbeat_events,
        checkpoints = stats.checkpoints_written,
        handler_failures = stats.handler_failures,
        "Processor stopped"
    );
    drop(processor);

    if let Err(e) = store.close().await {
        warn!(error = %e, "Failed to close checkpoint store");
    }
    client.shutdown().await;

    outcome.map_err(Into::into)
}

async fn open_store(
    config: &ServiceConfig,
    database: &mongodb::Database,
) -> Result<Arc<dyn CheckpointStore>, BoxError> {
    Ok(match config.checkpoint_backend {
        CheckpointBackend::Mongo => Arc::new(MongoCheckpointStore::with_collection(
            database,
            &config.checkpoint_collection,
        )),
        CheckpointBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or("REDIS_URL must be set for the redis backend")?;
            Arc::new(RedisStore::new(RedisConfig::builder().url(url).build()?).await?)
        }
        CheckpointBackend::Memory => {
            warn!("Using in-memory checkpoints; positions are lost on exit");
            Arc::new(MemoryStore::new())
        }
    })
}

async fn shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result.map(|()| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.map(|()| "ctrl-c")
    }
}

/// Resolves on a shutdown signal or when the processor errors.
///
/// A failure to install the signal handlers also resolves, so the caller
/// always reaches the stop path.
async fn wait_for_shutdown(
    signal: impl Future<Output = std::io::Result<&'static str>>,
    mut state_rx: watch::Receiver<ProcessorState>,
) {
    tokio::select! {
        signal = signal => match signal {
            Ok(signal) => info!(signal, "Shutdown requested"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signals, stopping"),
        },
        _ = state_rx.wait_for(|state| *state == ProcessorState::Errored) => {
            error!("Processor failed, shutting down");
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ladle_core=info,ladle_stores=info,ladle_handlers=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .init();
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::future::{pending, ready};
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn signal_listener_failure_resolves_wait() {
        let (_state_tx, state_rx) = watch::channel(ProcessorState::Running);
        let failed = ready(Err(std::io::Error::other("no signal driver")));

        timeout(Duration::from_secs(1), wait_for_shutdown(failed, state_rx))
            .await
            .expect("wait did not resolve");
    }

    #[tokio::test]
    async fn errored_processor_resolves_wait() {
        let (state_tx, state_rx) = watch::channel(ProcessorState::Running);
        let waiting = tokio::spawn(wait_for_shutdown(pending(), state_rx));

        state_tx.send_replace(ProcessorState::Errored);
        timeout(Duration::from_secs(1), waiting)
            .await
            .expect("wait did not resolve")
            .unwrap();
    }
}
