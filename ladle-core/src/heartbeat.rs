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

//! Heartbeats that keep an idle feed's checkpoint fresh.
//!
//! A quiet database produces no changes, so the stored position would age
//! until it falls out of the feed's history. The [`HeartbeatEmitter`]
//! periodically upserts a [`HeartbeatRecord`] into a watched collection. The
//! write itself is a change, so it flows through the feed and advances the
//! checkpoint like any other.
//!
//! Heartbeat failures are never fatal: the failure is logged and the next
//! tick tries again.

use crate::event::{ChangeEvent, Namespace, OperationType};
use crate::feed::MemoryChangeFeed;
use crate::handler::{ChangeHandler, HandlerError};
use crate::metrics;
use async_trait::async_trait;
use bson::{doc, Document};
use chrono::{DateTime, Utc};
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default collection heartbeat records are written to.
pub const DEFAULT_HEARTBEAT_COLLECTION: &str = "heartbeats";

/// Default time between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// The liveness record of one feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    /// Feed the heartbeat belongs to
    #[serde(rename = "feedId")]
    pub feed_id: String,

    /// Time of the last heartbeat
    #[serde(
        rename = "heartbeatTimestamp",
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime"
    )]
    pub heartbeat_timestamp: DateTime<Utc>,
}

/// Errors raised while writing heartbeats.
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// The write was not acknowledged
    #[error("Heartbeat write failed: {0}")]
    Write(String),

    /// The record could not be encoded
    #[error("Heartbeat serialization failed: {0}")]
    Serialization(String),

    /// Invalid emitter configuration
    #[error("Heartbeat configuration error: {0}")]
    Configuration(String),
}

/// Writes heartbeat records.
#[async_trait]
pub trait HeartbeatWriter: Send + Sync {
    /// Upserts the heartbeat record of `feed_id` with timestamp `at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails. The emitter logs it and retries
    /// on the next tick.
    async fn beat(&self, feed_id: &str, at: DateTime<Utc>) -> Result<(), HeartbeatError>;

    /// Collection the records are written to.
    fn collection(&self) -> &str;
}

/// Heartbeat writer backed by a `MongoDB` collection.
///
/// Records are keyed by feed id, so each feed owns exactly one document.
#[derive(Debug, Clone)]
pub struct MongoHeartbeatWriter {
    collection: Collection<Document>,
}

impl MongoHeartbeatWriter {
    /// Writes to the default `heartbeats` collection of `database`.
    pub fn new(database: &Database) -> Self {
        Self::with_collection(database, DEFAULT_HEARTBEAT_COLLECTION)
    }

    /// Writes to a custom collection of `database`.
    pub fn with_collection(database: &Database, collection: &str) -> Self {
        Self {
            collection: database.collection(collection),
        }
    }
}

#[async_trait]
impl HeartbeatWriter for MongoHeartbeatWriter {
    async fn beat(&self, feed_id: &str, at: DateTime<Utc>) -> Result<(), HeartbeatError> {
        self.collection
            .update_one(
                doc! { "_id": feed_id },
                doc! {
                    "$set": {
                        "feedId": feed_id,
                        "heartbeatTimestamp": bson::DateTime::from_chrono(at),
                    }
                },
            )
            .upsert(true)
            .await
            .map_err(|e| HeartbeatError::Write(e.to_string()))?;
        Ok(())
    }

    fn collection(&self) -> &str {
        self.collection.name()
    }
}

/// Heartbeat writer that appends its writes to a [`MemoryChangeFeed`].
///
/// Each beat upserts the in-memory record and emits the matching change on
/// the feed, the same way a database write would appear on a change stream.
#[derive(Clone)]
pub struct MemoryHeartbeatWriter {
    feed: MemoryChangeFeed,
    database: String,
    collection: String,
    records: Arc<Mutex<HashMap<String, HeartbeatRecord>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryHeartbeatWriter {
    /// Creates a writer that emits into `feed` under `database.heartbeats`.
    pub fn new(feed: MemoryChangeFeed, database: impl Into<String>) -> Self {
        Self {
            feed,
            database: database.into(),
            collection: DEFAULT_HEARTBEAT_COLLECTION.to_string(),
            records: Arc::default(),
            failing: Arc::default(),
        }
    }

    /// Writes to a custom collection name.
    #[must_use]
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Makes every subsequent beat fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns the stored record of a feed.
    pub async fn record(&self, feed_id: &str) -> Option<HeartbeatRecord> {
        self.records.lock().await.get(feed_id).cloned()
    }
}

#[async_trait]
impl HeartbeatWriter for MemoryHeartbeatWriter {
    async fn beat(&self, feed_id: &str, at: DateTime<Utc>) -> Result<(), HeartbeatError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HeartbeatError::Write("simulated heartbeat failure".to_string()));
        }

        let record = HeartbeatRecord {
            feed_id: feed_id.to_string(),
            heartbeat_timestamp: at,
        };
        let mut document = bson::to_document(&record)
            .map_err(|e| HeartbeatError::Serialization(e.to_string()))?;
        document.insert("_id", feed_id);

        let previous = self
            .records
            .lock()
            .await
            .insert(feed_id.to_string(), record);
        let operation = if previous.is_some() {
            OperationType::Update
        } else {
            OperationType::Insert
        };

        self.feed
            .emit(
                operation,
                Namespace::new(self.database.clone(), self.collection.clone()),
                Some(document),
            )
            .await;
        Ok(())
    }

    fn collection(&self) -> &str {
        &self.collection
    }
}

/// Counters exposed by a running [`HeartbeatEmitter`].
#[derive(Debug, Default)]
pub struct HeartbeatStats {
    written: AtomicU64,
    failed: AtomicU64,
}

impl HeartbeatStats {
    /// Number of successful heartbeat writes.
    pub fn beats_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Number of failed heartbeat writes.
    pub fn beats_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Background task writing a heartbeat every interval.
///
/// The first beat happens one interval after start. Dropping the emitter
/// aborts the task; [`stop`](Self::stop) shuts it down and waits for it.
pub struct HeartbeatEmitter {
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<HeartbeatStats>,
}

impl HeartbeatEmitter {
    /// Spawns the heartbeat task.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::Configuration`] if `period` is zero.
    pub fn start<W>(
        writer: Arc<W>,
        feed_id: impl Into<String>,
        period: Duration,
    ) -> Result<Self, HeartbeatError>
    where
        W: HeartbeatWriter + ?Sized + 'static,
    {
        if period.is_zero() {
            return Err(HeartbeatError::Configuration(
                "heartbeat interval must be greater than 0".to_string(),
            ));
        }

        let feed_id = feed_id.into();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let stats = Arc::new(HeartbeatStats::default());
        let task_stats = Arc::clone(&stats);

        info!(
            feed_id = %feed_id,
            collection = %writer.collection(),
            interval_secs = period.as_secs_f64(),
            "Starting heartbeat"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => break,

                    _ = ticker.tick() => {
                        let result = tokio::select! {
                            biased;
                            _ = shutdown_rx.recv() => break,
                            result = writer.beat(&feed_id, Utc::now()) => result,
                        };

                        match result {
                            Ok(()) => {
                                task_stats.written.fetch_add(1, Ordering::Relaxed);
                                metrics::increment_heartbeats_written();
                                debug!(feed_id = %feed_id, "Heartbeat written");
                            }
                            Err(e) => {
                                task_stats.failed.fetch_add(1, Ordering::Relaxed);
                                metrics::increment_heartbeat_failures();
                                warn!(feed_id = %feed_id, error = %e, "Heartbeat write failed, retrying next interval");
                            }
                        }
                    }
                }
            }

            debug!(feed_id = %feed_id, "Heartbeat task exited");
        });

        Ok(Self {
            shutdown_tx,
            handle: Some(handle),
            stats,
        })
    }

    /// Returns the emitter's counters.
    pub fn stats(&self) -> &HeartbeatStats {
        &self.stats
    }

    /// Returns true while the task is alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the task and waits for it to exit. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        let _ = self.shutdown_tx.send(());
        if let Err(e) = handle.await {
            error!(error = %e, "Heartbeat task panicked");
        }
    }
}

impl Drop for HeartbeatEmitter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// System handler that receives heartbeat changes.
///
/// Heartbeats carry no business meaning. Routing them here keeps them away
/// from business handlers while they still complete a cycle and advance the
/// checkpoint.
#[derive(Debug, Default)]
pub struct HeartbeatLogHandler;

#[async_trait]
impl ChangeHandler for HeartbeatLogHandler {
    fn name(&self) -> &str {
        "heartbeat-log"
    }

    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        let feed_id = event
            .full_document
            .as_ref()
            .and_then(|doc| doc.get_str("feedId").ok())
            .unwrap_or("unknown");
        debug!(
            feed_id = %feed_id,
            collection = %event.collection_name(),
            cluster_time = %event.cluster_time,
            "Heartbeat observed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ChangeFeed;
    use futures::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn beats_every_interval() {
        let feed = MemoryChangeFeed::new();
        let writer = Arc::new(MemoryHeartbeatWriter::new(feed.clone(), "kitchen"));

        let mut emitter =
            HeartbeatEmitter::start(Arc::clone(&writer), "kitchen", Duration::from_secs(10)).unwrap();
        tokio::time::sleep(Duration::from_secs(35)).await;

        assert_eq!(emitter.stats().beats_written(), 3);
        let events = feed.events().await;
        assert_eq!(events.len(), 3);
        assert!(events[0].is_insert());
        assert!(events[1].is_update());
        assert_eq!(events[2].collection_name(), "heartbeats");
        assert!(writer.record("kitchen").await.is_some());

        emitter.stop().await;
        assert!(!emitter.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_schedule() {
        let feed = MemoryChangeFeed::new();
        let writer = Arc::new(MemoryHeartbeatWriter::new(feed.clone(), "kitchen"));
        writer.set_failing(true);

        let mut emitter =
            HeartbeatEmitter::start(Arc::clone(&writer), "kitchen", Duration::from_secs(10)).unwrap();
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(emitter.stats().beats_failed(), 2);
        assert!(emitter.is_running());

        writer.set_failing(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(emitter.stats().beats_written(), 1);

        emitter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_halts_writes() {
        let feed = MemoryChangeFeed::new();
        let writer = Arc::new(MemoryHeartbeatWriter::new(feed.clone(), "kitchen"));

        let mut emitter =
            HeartbeatEmitter::start(Arc::clone(&writer), "kitchen", Duration::from_secs(5)).unwrap();
        emitter.stop().await;
        emitter.stop().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(feed.events().await.is_empty());
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let writer = Arc::new(MemoryHeartbeatWriter::new(MemoryChangeFeed::new(), "kitchen"));
        let result = HeartbeatEmitter::start(writer, "kitchen", Duration::ZERO);
        assert!(matches!(result, Err(HeartbeatError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_changes_reach_open_cursors() {
        let feed = MemoryChangeFeed::new();
        let writer = MemoryHeartbeatWriter::new(feed.clone(), "kitchen").with_collection("pulse");
        let mut cursor = feed.open(None).await.unwrap();

        writer.beat("kitchen", Utc::now()).await.unwrap();

        let event = cursor.next().await.unwrap().unwrap();
        assert_eq!(event.collection_name(), "pulse");
        let doc = event.full_document.unwrap();
        assert_eq!(doc.get_str("_id").unwrap(), "kitchen");
        assert_eq!(doc.get_str("feedId").unwrap(), "kitchen");
    }

    #[tokio::test]
    async fn log_handler_accepts_heartbeats() {
        let feed = MemoryChangeFeed::new();
        let writer = MemoryHeartbeatWriter::new(feed.clone(), "kitchen");
        writer.beat("kitchen", Utc::now()).await.unwrap();
        let event = feed.events().await.remove(0);

        assert!(HeartbeatLogHandler.handle(&event).await.is_ok());
        assert_eq!(HeartbeatLogHandler.name(), "heartbeat-log");
    }
}
