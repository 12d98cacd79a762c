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

//! In-memory processor walkthrough.
//!
//! Runs a processor against an in-memory feed and checkpoint store, so no
//! database is needed. It shows handler dispatch, heartbeats, the checkpoint
//! after each change, and a restart that resumes where the first run left off.
//!
//! ```bash
//! RUST_LOG=memory_processor=info,ladle_core=debug \
//!     cargo run -p ladle-core --example memory_processor
//! ```

use async_trait::async_trait;
use bson::doc;
use ladle_core::checkpoint::CheckpointStore;
use ladle_core::event::{ChangeEvent, Namespace, OperationType};
use ladle_core::feed::MemoryChangeFeed;
use ladle_core::handler::{ChangeHandler, HandlerError};
use ladle_core::heartbeat::MemoryHeartbeatWriter;
use ladle_core::processor::{ChangeFeedProcessor, ProcessorConfig};
use ladle_stores::memory::MemoryStore;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

const FEED_ID: &str = "kitchen-feed";

/// Prints every business change it receives.
struct ConsoleHandler;

#[async_trait]
impl ChangeHandler for ConsoleHandler {
    fn name(&self) -> &str {
        "console"
    }

    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        info!(
            collection = %event.collection_name(),
            operation = %event.operation,
            id = ?event.document_id(),
            "Change received"
        );
        Ok(())
    }
}

fn build(
    feed: &MemoryChangeFeed,
    store: &Arc<MemoryStore>,
) -> Result<ChangeFeedProcessor<MemoryChangeFeed, MemoryStore, MemoryHeartbeatWriter>, Box<dyn Error>>
{
    let config = ProcessorConfig::builder()
        .feed_id(FEED_ID)
        .heartbeat_interval(Duration::from_millis(200))
        .build()?;
    let writer = MemoryHeartbeatWriter::new(feed.clone(), "kitchen");

    let mut processor = ChangeFeedProcessor::new(
        config,
        Arc::new(feed.clone()),
        Arc::clone(store),
        Arc::new(writer),
    )?;
    processor.register_handler(ConsoleHandler)?;
    Ok(processor)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_logging();

    let feed = MemoryChangeFeed::new();
    let store = Arc::new(MemoryStore::new());

    let mut processor = build(&feed, &store)?;
    processor.start().await?;

    feed.emit(
        OperationType::Insert,
        Namespace::new("kitchen", "recipes"),
        Some(doc! { "_id": 1, "title": "Carbonara" }),
    )
    .await;
    feed.emit(
        OperationType::Insert,
        Namespace::new("kitchen", "pantry"),
        Some(doc! { "_id": "eggs", "count": 12 }),
    )
    .await;

    // Let a few heartbeats through.
    tokio::time::sleep(Duration::from_millis(700)).await;
    processor.stop().await?;

    let stats = processor.stats().await;
    info!(
        dispatched = stats.events_dispatched,
        heartbeats = stats.heartbeat_events,
        checkpoints = stats.checkpoints_written,
        "First run finished"
    );

    // Changes made while the processor is down are delivered after restart.
    feed.emit(
        OperationType::Delete,
        Namespace::new("kitchen", "recipes"),
        Some(doc! { "_id": 1 }),
    )
    .await;

    if let Some(position) = store.get(FEED_ID).await? {
        info!(token = %position.token.fingerprint(), "Restarting from saved position");
    }

    let mut processor = build(&feed, &store)?;
    processor.start().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    processor.stop().await?;

    info!(
        dispatched = processor.stats().await.events_dispatched,
        "Second run finished"
    );
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("memory_processor=info,ladle_core=info"));
    fmt().with_env_filter(filter).with_target(false).init();
}
