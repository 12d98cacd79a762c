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

//! The change-feed processor.
//!
//! [`ChangeFeedProcessor`] ties a [`ChangeFeed`], a [`CheckpointStore`] and a
//! [`HeartbeatWriter`] together:
//!
//! - **Resume**: on start, the stored position is loaded and the feed is
//!   opened right after it
//! - **Noise filter**: changes on the checkpoint collection (and any ignored
//!   collection) are neither dispatched nor checkpointed
//! - **Dispatch**: every other change is offered to all handlers, in
//!   registration order, one change at a time
//! - **Checkpoint**: once the cycle completes the change's token is persisted
//!   before the next change is read
//! - **Heartbeat**: a background task keeps the position fresh while the
//!   database is idle
//!
//! Delivery is at-least-once: a crash between dispatch and checkpoint replays
//! that change on restart.
//!
//! # Lifecycle
//!
//! ```text
//! Stopped ──start──▶ Starting ──cursor open──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!                       │                         │
//!                       └────────failure──────────┴──────▶ Errored
//! ```
//!
//! `Errored` is terminal. Handler failures never lead there; checkpoint and
//! feed failures do.
//!
//! # Example
//!
//! ```rust
//! use ladle_core::feed::MemoryChangeFeed;
//! use ladle_core::handler::MockHandler;
//! use ladle_core::heartbeat::MemoryHeartbeatWriter;
//! use ladle_core::processor::{ChangeFeedProcessor, ProcessorConfig, ProcessorState};
//! # use ladle_core::checkpoint::{CheckpointError, CheckpointStore, ResumePosition};
//! # use ladle_core::event::ResumeToken;
//! # #[derive(Default)]
//! # struct NullStore;
//! # #[async_trait::async_trait]
//! # impl CheckpointStore for NullStore {
//! #     async fn get(&self, _: &str) -> Result<Option<ResumePosition>, CheckpointError> { Ok(None) }
//! #     async fn set(&self, _: &str, _: &ResumeToken) -> Result<(), CheckpointError> { Ok(()) }
//! #     async fn delete(&self, _: &str) -> Result<(), CheckpointError> { Ok(()) }
//! #     async fn list(&self) -> Result<Vec<ResumePosition>, CheckpointError> { Ok(vec![]) }
//! # }
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let feed = MemoryChangeFeed::new();
//! let writer = MemoryHeartbeatWriter::new(feed.clone(), "kitchen");
//! let config = ProcessorConfig::builder().feed_id("kitchen").build()?;
//!
//! let mut processor = ChangeFeedProcessor::new(
//!     config,
//!     Arc::new(feed),
//!     Arc::new(NullStore),
//!     Arc::new(writer),
//! )?;
//! processor.register_handler(MockHandler::new("audit"))?;
//!
//! processor.start().await?;
//! assert_eq!(processor.state(), ProcessorState::Running);
//! processor.stop().await?;
//! # Ok(())
//! # }
//! ```

use crate::checkpoint::{CheckpointError, CheckpointStore, DEFAULT_CHECKPOINT_COLLECTION};
use crate::event::{ChangeEvent, ResumeToken};
use crate::feed::{ChangeFeed, FeedCursor, FeedError};
use crate::handler::{ChangeHandler, HandlerRegistry};
use crate::heartbeat::{
    HeartbeatEmitter, HeartbeatError, HeartbeatLogHandler, HeartbeatWriter,
    DEFAULT_HEARTBEAT_COLLECTION, DEFAULT_HEARTBEAT_INTERVAL,
};
use crate::metrics::{self, ProcessorStatus, Timer};
use futures::StreamExt;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Identifier of the feed; keys the checkpoint and heartbeat records
    pub feed_id: String,

    /// Time between heartbeats
    pub heartbeat_interval: Duration,

    /// Collection heartbeat records are written to
    pub heartbeat_collection: String,

    /// Collection checkpoint records are written to
    pub checkpoint_collection: String,

    /// Collections whose changes are never dispatched
    pub ignore_collections: BTreeSet<String>,

    /// How long the feed keeps history; heartbeats must be more frequent
    pub position_expiry: Option<Duration>,
}

impl ProcessorConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> ProcessorConfigBuilder {
        ProcessorConfigBuilder::default()
    }

    /// Returns every collection the noise filter drops, including the
    /// checkpoint collection.
    #[must_use]
    pub fn ignored_collections(&self) -> BTreeSet<String> {
        let mut ignored = self.ignore_collections.clone();
        ignored.insert(self.checkpoint_collection.clone());
        ignored
    }
}

/// Builder for [`ProcessorConfig`].
#[derive(Debug, Default)]
pub struct ProcessorConfigBuilder {
    feed_id: Option<String>,
    heartbeat_interval: Option<Duration>,
    heartbeat_collection: Option<String>,
    checkpoint_collection: Option<String>,
    ignore_collections: BTreeSet<String>,
    position_expiry: Option<Duration>,
}

impl ProcessorConfigBuilder {
    /// Sets the feed id.
    #[must_use]
    pub fn feed_id(mut self, feed_id: impl Into<String>) -> Self {
        self.feed_id = Some(feed_id.into());
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Sets the heartbeat collection.
    #[must_use]
    pub fn heartbeat_collection(mut self, collection: impl Into<String>) -> Self {
        self.heartbeat_collection = Some(collection.into());
        self
    }

    /// Sets the checkpoint collection.
    #[must_use]
    pub fn checkpoint_collection(mut self, collection: impl Into<String>) -> Self {
        self.checkpoint_collection = Some(collection.into());
        self
    }

    /// Adds one collection to the ignore list.
    #[must_use]
    pub fn ignore_collection(mut self, collection: impl Into<String>) -> Self {
        self.ignore_collections.insert(collection.into());
        self
    }

    /// Adds several collections to the ignore list.
    #[must_use]
    pub fn ignore_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_collections
            .extend(collections.into_iter().map(Into::into));
        self
    }

    /// Sets the feed's position expiry window.
    #[must_use]
    pub fn position_expiry(mut self, expiry: Duration) -> Self {
        self.position_expiry = Some(expiry);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Configuration`] if:
    /// - the feed id is missing or empty
    /// - the heartbeat interval is zero, or not shorter than the position expiry
    /// - the heartbeat collection is ignored or equals the checkpoint collection
    pub fn build(self) -> Result<ProcessorConfig, ProcessorError> {
        let feed_id = self
            .feed_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ProcessorError::Configuration("feed_id is required".to_string()))?;

        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if heartbeat_interval.is_zero() {
            return Err(ProcessorError::Configuration(
                "heartbeat_interval must be greater than 0".to_string(),
            ));
        }

        if let Some(expiry) = self.position_expiry {
            if heartbeat_interval >= expiry {
                return Err(ProcessorError::Configuration(format!(
                    "heartbeat_interval ({heartbeat_interval:?}) must be shorter than position_expiry ({expiry:?})"
                )));
            }
        }

        let heartbeat_collection = self
            .heartbeat_collection
            .unwrap_or_else(|| DEFAULT_HEARTBEAT_COLLECTION.to_string());
        let checkpoint_collection = self
            .checkpoint_collection
            .unwrap_or_else(|| DEFAULT_CHECKPOINT_COLLECTION.to_string());

        if heartbeat_collection.is_empty() || checkpoint_collection.is_empty() {
            return Err(ProcessorError::Configuration(
                "collection names must not be empty".to_string(),
            ));
        }

        if heartbeat_collection == checkpoint_collection
            || self.ignore_collections.contains(&heartbeat_collection)
        {
            return Err(ProcessorError::Configuration(format!(
                "heartbeat collection '{heartbeat_collection}' must not be ignored"
            )));
        }

        Ok(ProcessorConfig {
            feed_id,
            heartbeat_interval,
            heartbeat_collection,
            checkpoint_collection,
            ignore_collections: self.ignore_collections,
            position_expiry: self.position_expiry,
        })
    }
}

/// Lifecycle state of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Not consuming.
    Stopped,
    /// Loading the checkpoint and opening the feed.
    Starting,
    /// Consuming the feed.
    Running,
    /// Shutting down.
    Stopping,
    /// Stopped on a fatal error. Terminal.
    Errored,
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Processor statistics.
#[derive(Debug, Clone, Default)]
pub struct ProcessorStats {
    /// Changes read from the feed
    pub events_received: u64,

    /// Changes dropped by the noise filter
    pub events_ignored: u64,

    /// Business changes offered to the handlers
    pub events_dispatched: u64,

    /// Heartbeat changes routed to the heartbeat handler
    pub heartbeat_events: u64,

    /// Handler invocations that failed
    pub handler_failures: u64,

    /// Checkpoints persisted
    pub checkpoints_written: u64,

    /// Token of the last persisted checkpoint
    pub last_checkpoint: Option<ResumeToken>,
}

/// Processor errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// The processor is already running
    #[error("Processor is already running")]
    AlreadyRunning,

    /// The operation is not allowed in the current state
    #[error("Cannot {operation} while processor is {state}")]
    InvalidState {
        /// Rejected operation
        operation: &'static str,
        /// State at the time of the call
        state: ProcessorState,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Checkpoint store failure
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Change feed failure
    #[error("Change feed error: {0}")]
    Feed(#[from] FeedError),

    /// Heartbeat failure
    #[error("Heartbeat error: {0}")]
    Heartbeat(#[from] HeartbeatError),

    /// The worker task panicked or was cancelled
    #[error("Worker error: {0}")]
    Worker(String),
}

type WorkerHandle = JoinHandle<Result<(), ProcessorError>>;

/// Resumable change-feed processor.
///
/// The processor owns its worker and heartbeat tasks; the feed, store and
/// writer are shared with the caller, who remains responsible for closing
/// them after [`stop`](Self::stop).
pub struct ChangeFeedProcessor<F, S, W>
where
    F: ChangeFeed + ?Sized + 'static,
    S: CheckpointStore + ?Sized + 'static,
    W: HeartbeatWriter + ?Sized + 'static,
{
    config: ProcessorConfig,
    ignored: Arc<BTreeSet<String>>,
    feed: Arc<F>,
    store: Arc<S>,
    heartbeat_writer: Arc<W>,
    handlers: HandlerRegistry,
    system_handlers: HandlerRegistry,
    state: Arc<watch::Sender<ProcessorState>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    worker: Option<WorkerHandle>,
    heartbeat: Option<HeartbeatEmitter>,
    stats: Arc<RwLock<ProcessorStats>>,
}

impl<F, S, W> ChangeFeedProcessor<F, S, W>
where
    F: ChangeFeed + ?Sized + 'static,
    S: CheckpointStore + ?Sized + 'static,
    W: HeartbeatWriter + ?Sized + 'static,
{
    /// Creates a stopped processor.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Configuration`] if the writer's collection
    /// differs from the configured heartbeat collection, or if the store
    /// writes into the heartbeat collection.
    #[instrument(skip(config, feed, store, heartbeat_writer), fields(feed_id = %config.feed_id))]
    pub fn new(
        config: ProcessorConfig,
        feed: Arc<F>,
        store: Arc<S>,
        heartbeat_writer: Arc<W>,
    ) -> Result<Self, ProcessorError> {
        if heartbeat_writer.collection() != config.heartbeat_collection {
            return Err(ProcessorError::Configuration(format!(
                "heartbeat writer targets '{}' but the configured heartbeat collection is '{}'",
                heartbeat_writer.collection(),
                config.heartbeat_collection
            )));
        }

        let mut ignored = config.ignored_collections();
        if let Some(backing) = store.backing_collection() {
            if backing == config.heartbeat_collection {
                return Err(ProcessorError::Configuration(format!(
                    "checkpoint store writes into the heartbeat collection '{backing}'"
                )));
            }
            ignored.insert(backing.to_string());
        }

        info!(
            heartbeat_collection = %config.heartbeat_collection,
            ignored = ?ignored,
            heartbeat_interval_secs = config.heartbeat_interval.as_secs_f64(),
            "Creating change feed processor"
        );

        let mut system_handlers = HandlerRegistry::new();
        system_handlers.register(HeartbeatLogHandler);

        let (state, _) = watch::channel(ProcessorState::Stopped);

        Ok(Self {
            config,
            ignored: Arc::new(ignored),
            feed,
            store,
            heartbeat_writer,
            handlers: HandlerRegistry::new(),
            system_handlers,
            state: Arc::new(state),
            shutdown_tx: None,
            worker: None,
            heartbeat: None,
            stats: Arc::new(RwLock::new(ProcessorStats::default())),
        })
    }

    /// Registers a business handler.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::InvalidState`] unless the processor is stopped.
    pub fn register_handler<H>(&mut self, handler: H) -> Result<(), ProcessorError>
    where
        H: ChangeHandler + 'static,
    {
        self.ensure_stopped("register a handler")?;
        debug!(handler = %handler.name(), "Registering handler");
        self.handlers.register(handler);
        Ok(())
    }

    /// Registers an already shared business handler.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::InvalidState`] unless the processor is stopped.
    pub fn register_shared_handler(
        &mut self,
        handler: Arc<dyn ChangeHandler>,
    ) -> Result<(), ProcessorError> {
        self.ensure_stopped("register a handler")?;
        debug!(handler = %handler.name(), "Registering handler");
        self.handlers.register_shared(handler);
        Ok(())
    }

    fn ensure_stopped(&self, operation: &'static str) -> Result<(), ProcessorError> {
        let state = self.state();
        if state == ProcessorState::Stopped {
            Ok(())
        } else {
            Err(ProcessorError::InvalidState { operation, state })
        }
    }

    /// Starts consuming the feed.
    ///
    /// Loads the stored position, opens the feed after it, starts the
    /// heartbeat and spawns the worker. Returns once the processor is running.
    ///
    /// # Errors
    ///
    /// - [`ProcessorError::AlreadyRunning`] if running
    /// - [`ProcessorError::InvalidState`] if errored; build a new processor instead
    /// - [`ProcessorError::Configuration`] if the feed does not deliver heartbeats
    /// - [`ProcessorError::Checkpoint`] / [`ProcessorError::Feed`] if the position
    ///   cannot be loaded or the feed cannot be opened; the processor is then errored
    #[instrument(skip(self), fields(feed_id = %self.config.feed_id))]
    pub async fn start(&mut self) -> Result<(), ProcessorError> {
        match self.state() {
            ProcessorState::Stopped => {}
            ProcessorState::Running | ProcessorState::Starting => {
                return Err(ProcessorError::AlreadyRunning);
            }
            state @ (ProcessorState::Stopping | ProcessorState::Errored) => {
                return Err(ProcessorError::InvalidState {
                    operation: "start",
                    state,
                });
            }
        }

        if !self.feed.observes(&self.config.heartbeat_collection) {
            return Err(ProcessorError::Configuration(format!(
                "change feed does not observe heartbeat collection '{}'",
                self.config.heartbeat_collection
            )));
        }

        info!(handlers = ?self.handlers.names(), "Starting processor");
        self.state.send_replace(ProcessorState::Starting);

        let position = match self.store.get(&self.config.feed_id).await {
            Ok(position) => position,
            Err(e) => {
                error!(error = %e, "Failed to load checkpoint");
                return Err(self.fail(ProcessorError::Checkpoint(e)));
            }
        };

        let resume_after = position.map(|p| {
            info!(updated_at = %p.updated_at, "Resuming from stored position");
            p.token
        });
        if resume_after.is_none() {
            info!("No stored position, starting from the live tail");
        }

        let cursor = match self.feed.open(resume_after.as_ref()).await {
            Ok(cursor) => cursor,
            Err(e) => {
                error!(error = %e, category = e.category(), "Failed to open change feed");
                return Err(self.fail(ProcessorError::Feed(e)));
            }
        };

        let heartbeat = match HeartbeatEmitter::start(
            Arc::clone(&self.heartbeat_writer),
            self.config.feed_id.clone(),
            self.config.heartbeat_interval,
        ) {
            Ok(heartbeat) => heartbeat,
            Err(e) => return Err(self.fail(ProcessorError::Heartbeat(e))),
        };
        self.heartbeat = Some(heartbeat);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        // Running before spawning, so a failing worker cannot be overwritten.
        self.state.send_replace(ProcessorState::Running);
        metrics::set_processor_status(ProcessorStatus::Running);

        let worker = Worker {
            feed_id: self.config.feed_id.clone(),
            heartbeat_collection: self.config.heartbeat_collection.clone(),
            ignored: Arc::clone(&self.ignored),
            store: Arc::clone(&self.store),
            handlers: self.handlers.clone(),
            system_handlers: self.system_handlers.clone(),
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
        };
        self.worker = Some(tokio::spawn(worker.run(cursor, shutdown_rx)));

        info!("Processor started");
        Ok(())
    }

    fn fail(&self, err: ProcessorError) -> ProcessorError {
        self.state.send_replace(ProcessorState::Errored);
        metrics::set_processor_status(ProcessorStatus::Errored);
        err
    }

    /// Stops consuming the feed and releases the worker and heartbeat.
    ///
    /// Idempotent. An in-flight dispatch is abandoned without a checkpoint,
    /// so that change is delivered again on the next start. If the worker
    /// stopped on a fatal error, that error is returned (once) and the
    /// processor stays errored.
    ///
    /// # Errors
    ///
    /// Returns the worker's fatal error, if any.
    #[instrument(skip(self), fields(feed_id = %self.config.feed_id))]
    pub async fn stop(&mut self) -> Result<(), ProcessorError> {
        let initial = self.state();
        if self.worker.is_none() && self.heartbeat.is_none() {
            debug!(state = %initial, "Processor is not running");
            return Ok(());
        }

        info!(state = %initial, "Stopping processor");
        if initial == ProcessorState::Running {
            self.state.send_replace(ProcessorState::Stopping);
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }

        let result = match self.worker.take() {
            Some(worker) => match worker.await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Worker panicked");
                    Err(ProcessorError::Worker(e.to_string()))
                }
            },
            None => Ok(()),
        };

        if result.is_err() || self.state() == ProcessorState::Errored {
            self.state.send_replace(ProcessorState::Errored);
            metrics::set_processor_status(ProcessorStatus::Errored);
        } else {
            self.state.send_replace(ProcessorState::Stopped);
            metrics::set_processor_status(ProcessorStatus::Stopped);
        }

        let stats = self.stats.read().await;
        info!(
            state = %self.state(),
            events_received = stats.events_received,
            events_dispatched = stats.events_dispatched,
            events_ignored = stats.events_ignored,
            handler_failures = stats.handler_failures,
            checkpoints_written = stats.checkpoints_written,
            "Processor stopped"
        );

        result
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ProcessorState {
        *self.state.borrow()
    }

    /// Returns a receiver notified on every state change.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ProcessorState> {
        self.state.subscribe()
    }

    /// Returns true while the worker is consuming the feed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ProcessorState::Running
    }

    /// Returns a snapshot of the statistics.
    pub async fn stats(&self) -> ProcessorStats {
        self.stats.read().await.clone()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Returns the collections the noise filter drops.
    #[must_use]
    pub fn ignored_collections(&self) -> &BTreeSet<String> {
        &self.ignored
    }

    /// Returns the business handler names in dispatch order.
    #[must_use]
    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.names()
    }
}

impl<F, S, W> Drop for ChangeFeedProcessor<F, S, W>
where
    F: ChangeFeed + ?Sized + 'static,
    S: CheckpointStore + ?Sized + 'static,
    W: HeartbeatWriter + ?Sized + 'static,
{
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            warn!(feed_id = %self.config.feed_id, "Processor dropped while running, aborting worker");
            worker.abort();
        }
    }
}

/// State moved into the worker task.
struct Worker<S: CheckpointStore + ?Sized> {
    feed_id: String,
    heartbeat_collection: String,
    ignored: Arc<BTreeSet<String>>,
    store: Arc<S>,
    handlers: HandlerRegistry,
    system_handlers: HandlerRegistry,
    state: Arc<watch::Sender<ProcessorState>>,
    stats: Arc<RwLock<ProcessorStats>>,
}

impl<S: CheckpointStore + ?Sized> Worker<S> {
    #[instrument(skip_all, fields(feed_id = %self.feed_id))]
    async fn run(
        self,
        mut cursor: FeedCursor,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), ProcessorError> {
        debug!("Worker started");

        loop {
            let next = tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    return Ok(());
                }

                next = cursor.next() => next,
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    error!(error = %e, category = e.category(), "Change feed failed");
                    return Err(self.fail(ProcessorError::Feed(e)));
                }
                None => {
                    error!("Change feed ended unexpectedly");
                    return Err(self.fail(ProcessorError::Feed(FeedError::Closed)));
                }
            };

            metrics::increment_events_received();
            self.stats.write().await.events_received += 1;

            if self.ignored.contains(event.collection_name()) {
                trace!(collection = %event.collection_name(), "Ignoring self-generated change");
                metrics::increment_events_ignored(event.collection_name());
                self.stats.write().await.events_ignored += 1;
                continue;
            }

            let is_heartbeat = event.collection_name() == self.heartbeat_collection;
            let registry = if is_heartbeat {
                &self.system_handlers
            } else {
                &self.handlers
            };

            let outcomes = {
                let _timer = Timer::new(event.collection_name(), |duration, collection| {
                    metrics::record_dispatch_duration(duration, collection);
                });

                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        info!(
                            collection = %event.collection_name(),
                            "Shutdown during dispatch, change will be redelivered"
                        );
                        return Ok(());
                    }

                    outcomes = registry.dispatch_all(&event) => outcomes,
                }
            };

            let failures = outcomes.iter().filter(|o| o.is_failed()).count() as u64;
            {
                let mut stats = self.stats.write().await;
                if is_heartbeat {
                    stats.heartbeat_events += 1;
                } else {
                    stats.events_dispatched += 1;
                    metrics::increment_events_dispatched(
                        event.collection_name(),
                        event.operation.as_str(),
                    );
                }
                stats.handler_failures += failures;
            }

            self.checkpoint(&event).await?;
        }
    }

    async fn checkpoint(&self, event: &ChangeEvent) -> Result<(), ProcessorError> {
        let started = Instant::now();
        if let Err(e) = self.store.set(&self.feed_id, &event.resume_token).await {
            metrics::increment_checkpoint_failures();
            error!(
                error = %e,
                collection = %event.collection_name(),
                "Failed to persist checkpoint, stopping"
            );
            return Err(self.fail(ProcessorError::Checkpoint(e)));
        }
        metrics::record_checkpoint_write_duration(started.elapsed());
        metrics::increment_checkpoints_written();

        let mut stats = self.stats.write().await;
        stats.checkpoints_written += 1;
        stats.last_checkpoint = Some(event.resume_token.clone());
        trace!(collection = %event.collection_name(), "Checkpoint persisted");
        Ok(())
    }

    fn fail(&self, err: ProcessorError) -> ProcessorError {
        self.state.send_replace(ProcessorState::Errored);
        metrics::set_processor_status(ProcessorStatus::Errored);
        err
    }
}
