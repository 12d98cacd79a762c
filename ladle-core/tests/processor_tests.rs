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

//! Processor integration tests against the in-memory feed.

use async_trait::async_trait;
use bson::doc;
use chrono::Utc;
use ladle_core::checkpoint::{CheckpointError, CheckpointStore, ResumePosition};
use ladle_core::event::{ChangeEvent, Namespace, OperationType, ResumeToken};
use ladle_core::feed::{FeedError, MemoryChangeFeed};
use ladle_core::handler::{CallJournal, MockHandler};
use ladle_core::heartbeat::{HeartbeatError, HeartbeatWriter, MemoryHeartbeatWriter};
use ladle_core::processor::{
    ChangeFeedProcessor, ProcessorConfig, ProcessorError, ProcessorState,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout};

const DB: &str = "kitchen";
const FEED_ID: &str = "kitchen";

/// Checkpoint store that records every write and can fail on demand.
///
/// With an echo feed, every write also shows up on that feed as a change on
/// `resume_tokens`, the way a store inside the watched database behaves.
#[derive(Default)]
struct TestStore {
    positions: Mutex<HashMap<String, ResumePosition>>,
    writes: Mutex<Vec<ResumeToken>>,
    fail_sets: AtomicBool,
    fail_gets: AtomicBool,
    echo: Option<MemoryChangeFeed>,
}

impl TestStore {
    fn echoing(feed: MemoryChangeFeed) -> Self {
        Self {
            echo: Some(feed),
            ..Self::default()
        }
    }

    async fn seed(&self, token: ResumeToken) {
        self.positions.lock().await.insert(
            FEED_ID.to_string(),
            ResumePosition::new(FEED_ID, token, Utc::now()),
        );
    }

    async fn position(&self) -> Option<ResumeToken> {
        self.positions
            .lock()
            .await
            .get(FEED_ID)
            .map(|p| p.token.clone())
    }

    async fn writes(&self) -> Vec<ResumeToken> {
        self.writes.lock().await.clone()
    }
}

#[async_trait]
impl CheckpointStore for TestStore {
    async fn get(&self, feed_id: &str) -> Result<Option<ResumePosition>, CheckpointError> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(CheckpointError::Connection("store unreachable".into()));
        }
        Ok(self.positions.lock().await.get(feed_id).cloned())
    }

    async fn set(&self, feed_id: &str, token: &ResumeToken) -> Result<(), CheckpointError> {
        if self.fail_sets.load(Ordering::SeqCst) {
            return Err(CheckpointError::Connection("write not acknowledged".into()));
        }

        self.positions.lock().await.insert(
            feed_id.to_string(),
            ResumePosition::new(feed_id, token.clone(), Utc::now()),
        );
        self.writes.lock().await.push(token.clone());

        if let Some(feed) = &self.echo {
            feed.emit(
                OperationType::Update,
                Namespace::new(DB, "resume_tokens"),
                Some(doc! { "_id": feed_id }),
            )
            .await;
        }
        Ok(())
    }

    async fn delete(&self, feed_id: &str) -> Result<(), CheckpointError> {
        self.positions.lock().await.remove(feed_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ResumePosition>, CheckpointError> {
        Ok(self.positions.lock().await.values().cloned().collect())
    }

    fn backing_collection(&self) -> Option<&str> {
        self.echo.as_ref().map(|_| "resume_tokens")
    }
}

type TestProcessor = ChangeFeedProcessor<MemoryChangeFeed, TestStore, MemoryHeartbeatWriter>;

fn config() -> ProcessorConfig {
    ProcessorConfig::builder()
        .feed_id(FEED_ID)
        .heartbeat_interval(Duration::from_secs(60))
        .build()
        .unwrap()
}

fn processor_with(
    config: ProcessorConfig,
    feed: &MemoryChangeFeed,
    store: &Arc<TestStore>,
) -> (TestProcessor, MemoryHeartbeatWriter) {
    let writer = MemoryHeartbeatWriter::new(feed.clone(), DB);
    let processor = ChangeFeedProcessor::new(
        config,
        Arc::new(feed.clone()),
        Arc::clone(store),
        Arc::new(writer.clone()),
    )
    .unwrap();
    (processor, writer)
}

fn processor(feed: &MemoryChangeFeed, store: &Arc<TestStore>) -> TestProcessor {
    processor_with(config(), feed, store).0
}

async fn insert(feed: &MemoryChangeFeed, collection: &str, id: i32) -> ChangeEvent {
    feed.emit(
        OperationType::Insert,
        Namespace::new(DB, collection),
        Some(doc! { "_id": id }),
    )
    .await
}

async fn wait_for_writes(store: &TestStore, count: usize) {
    timeout(Duration::from_secs(5), async {
        while store.writes.lock().await.len() < count {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("checkpoint writes did not arrive in time");
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

async fn wait_for_state(rx: &mut watch::Receiver<ProcessorState>, state: ProcessorState) {
    timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .expect("state not reached in time")
        .expect("state channel closed");
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_change_is_dispatched_then_checkpointed() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    let handler = MockHandler::new("recipes");

    let mut processor = processor(&feed, &store);
    processor.register_handler(handler.clone()).unwrap();
    processor.start().await.unwrap();
    assert_eq!(processor.state(), ProcessorState::Running);

    let event = insert(&feed, "recipes", 1).await;
    wait_for_writes(&store, 1).await;

    assert_eq!(handler.events().await, vec![event.clone()]);
    assert_eq!(store.position().await, Some(event.resume_token));
    assert_eq!(feed.opened_with().await, vec![None]);

    processor.stop().await.unwrap();
    assert_eq!(processor.state(), ProcessorState::Stopped);
}

#[tokio::test]
async fn stored_position_is_resumed_exactly() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    let first = insert(&feed, "recipes", 1).await;
    let second = insert(&feed, "recipes", 2).await;
    store.seed(first.resume_token.clone()).await;

    let handler = MockHandler::new("recipes");
    let mut processor = processor(&feed, &store);
    processor.register_handler(handler.clone()).unwrap();
    processor.start().await.unwrap();

    wait_for_writes(&store, 1).await;

    assert_eq!(feed.opened_with().await, vec![Some(first.resume_token)]);
    assert_eq!(handler.events().await, vec![second.clone()]);
    assert_eq!(store.position().await, Some(second.resume_token));

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn heartbeat_reaches_only_log_handler_and_advances_checkpoint() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    let handler = MockHandler::new("business");

    let (mut processor, writer) = processor_with(config(), &feed, &store);
    processor.register_handler(handler.clone()).unwrap();
    processor.start().await.unwrap();

    writer.beat(FEED_ID, Utc::now()).await.unwrap();
    wait_for_writes(&store, 1).await;

    let heartbeat = feed.events().await.pop().unwrap();
    assert_eq!(heartbeat.collection_name(), "heartbeats");
    assert_eq!(handler.call_count().await, 0);
    assert_eq!(store.position().await, Some(heartbeat.resume_token));

    let stats = processor.stats().await;
    assert_eq!(stats.heartbeat_events, 1);
    assert_eq!(stats.events_dispatched, 0);

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn failing_handler_does_not_block_the_next_or_the_checkpoint() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    let failing = MockHandler::new("failing").failing();
    let healthy = MockHandler::new("healthy");

    let mut processor = processor(&feed, &store);
    processor.register_handler(failing.clone()).unwrap();
    processor.register_handler(healthy.clone()).unwrap();
    processor.start().await.unwrap();

    let event = insert(&feed, "recipes", 1).await;
    wait_for_writes(&store, 1).await;

    assert_eq!(failing.call_count().await, 1);
    assert_eq!(healthy.events().await, vec![event.clone()]);
    assert_eq!(store.position().await, Some(event.resume_token));
    assert_eq!(processor.state(), ProcessorState::Running);
    assert_eq!(processor.stats().await.handler_failures, 1);

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn checkpoint_failure_is_fatal() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    store.fail_sets.store(true, Ordering::SeqCst);
    let handler = MockHandler::new("recipes");

    let mut processor = processor(&feed, &store);
    processor.register_handler(handler.clone()).unwrap();
    let mut state = processor.subscribe_state();
    processor.start().await.unwrap();

    insert(&feed, "recipes", 1).await;
    wait_for_state(&mut state, ProcessorState::Errored).await;

    insert(&feed, "recipes", 2).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.call_count().await, 1);
    assert!(store.position().await.is_none());

    let err = processor.stop().await.unwrap_err();
    assert!(matches!(err, ProcessorError::Checkpoint(_)));
    assert_eq!(processor.state(), ProcessorState::Errored);

    let err = processor.start().await.unwrap_err();
    assert!(matches!(
        err,
        ProcessorError::InvalidState {
            state: ProcessorState::Errored,
            ..
        }
    ));
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn own_checkpoint_writes_are_never_dispatched() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::echoing(feed.clone()));
    let handler = MockHandler::new("everything");

    let mut processor = processor(&feed, &store);
    processor.register_handler(handler.clone()).unwrap();
    processor.start().await.unwrap();

    for id in 1..=3 {
        insert(&feed, "recipes", id).await;
    }
    wait_for_writes(&store, 3).await;
    sleep(Duration::from_millis(50)).await;

    let seen = handler.events().await;
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|e| e.collection_name() == "recipes"));
    assert_eq!(store.writes().await.len(), 3);
    assert_eq!(processor.stats().await.events_ignored, 3);

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn ignored_collections_are_neither_dispatched_nor_checkpointed() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    let handler = MockHandler::new("everything");
    let config = ProcessorConfig::builder()
        .feed_id(FEED_ID)
        .ignore_collection("sessions")
        .build()
        .unwrap();

    let (mut processor, _) = processor_with(config, &feed, &store);
    processor.register_handler(handler.clone()).unwrap();
    processor.start().await.unwrap();

    insert(&feed, "sessions", 1).await;
    let recipe = insert(&feed, "recipes", 2).await;
    wait_for_writes(&store, 1).await;

    assert_eq!(handler.events().await, vec![recipe.clone()]);
    assert_eq!(store.writes().await, vec![recipe.resume_token]);

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn restart_resumes_after_last_checkpoint() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());

    let first_run = MockHandler::new("recipes");
    let mut processor = processor(&feed, &store);
    processor.register_handler(first_run.clone()).unwrap();
    processor.start().await.unwrap();
    insert(&feed, "recipes", 1).await;
    insert(&feed, "recipes", 2).await;
    wait_for_writes(&store, 2).await;
    processor.stop().await.unwrap();
    drop(processor);

    let missed = insert(&feed, "recipes", 3).await;

    let second_run = MockHandler::new("recipes");
    let mut processor = self::processor(&feed, &store);
    processor.register_handler(second_run.clone()).unwrap();
    processor.start().await.unwrap();
    wait_for_writes(&store, 3).await;

    assert_eq!(first_run.call_count().await, 2);
    assert_eq!(second_run.events().await, vec![missed]);

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn change_abandoned_by_stop_is_redelivered() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    let slow = MockHandler::new("slow")
        .only_collections(&["recipes"])
        .with_delay(Duration::from_secs(3600));

    let mut processor = processor(&feed, &store);
    processor.register_handler(slow.clone()).unwrap();
    processor.start().await.unwrap();

    let warmup = insert(&feed, "pantry", 1).await;
    wait_for_writes(&store, 1).await;

    let event = insert(&feed, "recipes", 2).await;
    wait_until(|| slow.started_count() == 1).await;

    timeout(Duration::from_secs(5), processor.stop())
        .await
        .expect("stop must not wait for the handler")
        .unwrap();
    assert_eq!(store.writes().await, vec![warmup.resume_token.clone()]);
    drop(processor);

    let fast = MockHandler::new("fast");
    let mut processor = self::processor(&feed, &store);
    processor.register_handler(fast.clone()).unwrap();
    processor.start().await.unwrap();
    wait_for_writes(&store, 2).await;

    assert_eq!(
        feed.opened_with().await,
        vec![None, Some(warmup.resume_token)]
    );
    assert_eq!(fast.events().await, vec![event]);
    processor.stop().await.unwrap();
}

#[tokio::test]
async fn handlers_run_in_order_one_change_at_a_time() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    let journal = CallJournal::default();

    let mut processor = processor(&feed, &store);
    processor
        .register_handler(
            MockHandler::new("a")
                .with_delay(Duration::from_millis(5))
                .with_journal(journal.clone()),
        )
        .unwrap();
    processor
        .register_handler(MockHandler::new("b").with_journal(journal.clone()))
        .unwrap();
    assert_eq!(processor.handler_names(), vec!["a", "b"]);
    processor.start().await.unwrap();

    let mut tokens = Vec::new();
    for id in 1..=3 {
        tokens.push(insert(&feed, "recipes", id).await.resume_token);
    }
    wait_for_writes(&store, 3).await;

    let expected: Vec<String> = tokens
        .iter()
        .flat_map(|t| {
            let fp = t.fingerprint();
            [format!("a:{fp}"), format!("b:{fp}")]
        })
        .collect();
    assert_eq!(*journal.lock().await, expected);

    // Checkpoints follow feed order.
    assert_eq!(store.writes().await, tokens);
    assert_eq!(processor.stats().await.last_checkpoint, tokens.last().cloned());

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn panicking_handler_is_contained() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    let healthy = MockHandler::new("healthy");

    let mut processor = processor(&feed, &store);
    processor
        .register_handler(MockHandler::new("explosive").panicking())
        .unwrap();
    processor.register_handler(healthy.clone()).unwrap();
    processor.start().await.unwrap();

    insert(&feed, "recipes", 1).await;
    insert(&feed, "recipes", 2).await;
    wait_for_writes(&store, 2).await;

    assert_eq!(healthy.call_count().await, 2);
    assert_eq!(processor.state(), ProcessorState::Running);
    assert_eq!(processor.stats().await.handler_failures, 2);

    processor.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn heartbeats_keep_idle_checkpoint_fresh_and_self_heal() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    let config = ProcessorConfig::builder()
        .feed_id(FEED_ID)
        .heartbeat_interval(Duration::from_secs(10))
        .position_expiry(Duration::from_secs(60))
        .build()
        .unwrap();

    let (mut processor, writer) = processor_with(config, &feed, &store);
    processor.start().await.unwrap();

    sleep(Duration::from_secs(25)).await;
    wait_for_writes(&store, 2).await;
    let fresh = store.position().await;
    assert!(fresh.is_some());

    writer.set_failing(true);
    sleep(Duration::from_secs(30)).await;
    assert_eq!(processor.state(), ProcessorState::Running);
    assert_eq!(store.writes().await.len(), 2);

    writer.set_failing(false);
    sleep(Duration::from_secs(10)).await;
    wait_for_writes(&store, 3).await;
    assert_ne!(store.position().await, fresh);
    assert!(writer.record(FEED_ID).await.is_some());

    processor.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_twice_is_rejected() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    let mut processor = processor(&feed, &store);

    processor.start().await.unwrap();
    assert!(matches!(
        processor.start().await,
        Err(ProcessorError::AlreadyRunning)
    ));
    processor.stop().await.unwrap();
}

#[tokio::test]
async fn handlers_cannot_be_registered_while_running() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    let mut processor = processor(&feed, &store);

    processor.start().await.unwrap();
    let err = processor
        .register_handler(MockHandler::new("late"))
        .unwrap_err();
    assert!(matches!(
        err,
        ProcessorError::InvalidState {
            state: ProcessorState::Running,
            ..
        }
    ));

    processor.stop().await.unwrap();
    processor.register_handler(MockHandler::new("late")).unwrap();
}

#[tokio::test]
async fn stop_is_idempotent() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    let mut processor = processor(&feed, &store);

    processor.stop().await.unwrap();
    processor.start().await.unwrap();
    processor.stop().await.unwrap();
    processor.stop().await.unwrap();
    assert_eq!(processor.state(), ProcessorState::Stopped);
    assert_eq!(feed.open_cursors().await, 0);
}

#[tokio::test]
async fn clean_stop_allows_restart() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    let handler = MockHandler::new("recipes");
    let mut processor = processor(&feed, &store);
    processor.register_handler(handler.clone()).unwrap();

    processor.start().await.unwrap();
    let first = insert(&feed, "recipes", 1).await;
    wait_for_writes(&store, 1).await;
    processor.stop().await.unwrap();

    processor.start().await.unwrap();
    insert(&feed, "recipes", 2).await;
    wait_for_writes(&store, 2).await;

    assert_eq!(
        feed.opened_with().await,
        vec![None, Some(first.resume_token)]
    );
    assert_eq!(handler.call_count().await, 2);
    processor.stop().await.unwrap();
}

#[tokio::test]
async fn feed_open_failure_errors_the_processor() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    feed.fail_next_open("no primary").await;

    let mut processor = processor(&feed, &store);
    let err = processor.start().await.unwrap_err();

    assert!(matches!(err, ProcessorError::Feed(FeedError::Connection { .. })));
    assert_eq!(processor.state(), ProcessorState::Errored);
    processor.stop().await.unwrap();
    assert_eq!(processor.state(), ProcessorState::Errored);
}

#[tokio::test]
async fn zero_heartbeat_interval_errors_the_processor() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    let mut config = config();
    config.heartbeat_interval = Duration::ZERO;

    let (mut processor, _writer) = processor_with(config, &feed, &store);
    let err = processor.start().await.unwrap_err();

    assert!(matches!(
        err,
        ProcessorError::Heartbeat(HeartbeatError::Configuration(_))
    ));
    assert_eq!(processor.state(), ProcessorState::Errored);
    processor.stop().await.unwrap();
}

#[tokio::test]
async fn expired_position_errors_the_processor() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    store
        .seed(ResumeToken::from_document(doc! { "_data": "FFFFFFFFFFFFFFFF" }))
        .await;

    let mut processor = processor(&feed, &store);
    let err = processor.start().await.unwrap_err();

    assert!(matches!(
        err,
        ProcessorError::Feed(FeedError::InvalidResumeToken { code: 286 })
    ));
    assert_eq!(processor.state(), ProcessorState::Errored);
}

#[tokio::test]
async fn checkpoint_load_failure_errors_the_processor() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    store.fail_gets.store(true, Ordering::SeqCst);

    let mut processor = processor(&feed, &store);
    let err = processor.start().await.unwrap_err();

    assert!(matches!(err, ProcessorError::Checkpoint(_)));
    assert_eq!(processor.state(), ProcessorState::Errored);
    assert!(feed.opened_with().await.is_empty());
}

#[tokio::test]
async fn feed_error_while_running_is_fatal() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    let mut processor = processor(&feed, &store);
    let mut state = processor.subscribe_state();
    processor.start().await.unwrap();

    feed.fail("primary stepped down").await;
    wait_for_state(&mut state, ProcessorState::Errored).await;

    let err = processor.stop().await.unwrap_err();
    assert!(matches!(err, ProcessorError::Feed(FeedError::Connection { .. })));
    assert!(processor.stop().await.is_ok());
    assert_eq!(processor.state(), ProcessorState::Errored);
}

#[tokio::test]
async fn feed_ending_is_fatal() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    let mut processor = processor(&feed, &store);
    let mut state = processor.subscribe_state();
    processor.start().await.unwrap();

    feed.close().await;
    wait_for_state(&mut state, ProcessorState::Errored).await;

    let err = processor.stop().await.unwrap_err();
    assert!(matches!(err, ProcessorError::Feed(FeedError::Closed)));
}

#[tokio::test]
async fn feed_must_observe_heartbeat_collection() {
    let feed = MemoryChangeFeed::watching(["recipes"]);
    let store = Arc::new(TestStore::default());
    let mut processor = processor(&feed, &store);

    let err = processor.start().await.unwrap_err();
    assert!(matches!(err, ProcessorError::Configuration(_)));
    assert_eq!(processor.state(), ProcessorState::Stopped);
}

#[tokio::test]
async fn writer_must_target_configured_heartbeat_collection() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    let writer = MemoryHeartbeatWriter::new(feed.clone(), DB).with_collection("pulse");

    let result = ChangeFeedProcessor::new(config(), Arc::new(feed), store, Arc::new(writer));
    assert!(matches!(result, Err(ProcessorError::Configuration(_))));
}

#[tokio::test]
async fn store_backing_collection_joins_ignore_list() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::echoing(feed.clone()));
    let config = ProcessorConfig::builder()
        .feed_id(FEED_ID)
        .checkpoint_collection("positions")
        .build()
        .unwrap();

    let (processor, _) = processor_with(config, &feed, &store);
    let ignored: Vec<&str> = processor
        .ignored_collections()
        .iter()
        .map(String::as_str)
        .collect();
    assert_eq!(ignored, vec!["positions", "resume_tokens"]);
}

#[tokio::test]
async fn state_transitions_are_observable() {
    let feed = MemoryChangeFeed::new();
    let store = Arc::new(TestStore::default());
    let mut processor = processor(&feed, &store);
    let state = processor.subscribe_state();
    assert_eq!(*state.borrow(), ProcessorState::Stopped);

    processor.start().await.unwrap();
    assert_eq!(*state.borrow(), ProcessorState::Running);
    assert!(processor.is_running());

    processor.stop().await.unwrap();
    assert_eq!(*state.borrow(), ProcessorState::Stopped);
}
