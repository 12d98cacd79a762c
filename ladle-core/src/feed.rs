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

//! Change feed sources.
//!
//! A [`ChangeFeed`] opens a cursor over the ordered changes of a database,
//! optionally resuming right after a previously observed [`ResumeToken`].
//! The cursor is a plain [`Stream`](futures::Stream), so it composes with
//! `tokio::select!` and the usual stream combinators.
//!
//! [`MongoChangeFeed`](crate::stream::MongoChangeFeed) is the production
//! source. [`MemoryChangeFeed`] keeps an in-process change log with the same
//! resume semantics and is used for tests and local runs.

use crate::event::{ChangeEvent, ConversionError, Namespace, OperationType, ResumeToken};
use bson::{doc, Document};
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Error code reported when a resume token is no longer in the feed's history.
pub const INVALID_RESUME_TOKEN_CODE: i32 = 286;

/// Ordered stream of changes returned by [`ChangeFeed::open`].
pub type FeedCursor = BoxStream<'static, Result<ChangeEvent, FeedError>>;

/// A source of ordered database changes.
#[async_trait::async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Opens a cursor.
    ///
    /// With `resume_after` the first yielded change is the one immediately
    /// following that token. Without it the cursor starts at the live tail.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::InvalidResumeToken`] if the token fell out of the
    /// feed's history, or a connection error if the feed cannot be opened.
    async fn open(&self, resume_after: Option<&ResumeToken>) -> Result<FeedCursor, FeedError>;

    /// Returns true if changes on `collection` are delivered by this feed.
    fn observes(&self, collection: &str) -> bool {
        let _ = collection;
        true
    }
}

/// Errors raised while opening or reading a change feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Connection or server error
    #[error("Change feed connection error: {message}")]
    Connection {
        /// Error message
        message: String,
        /// Underlying driver error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        /// Server error code, if any
        code: Option<i32>,
        /// Server error labels
        labels: Vec<String>,
    },

    /// A change could not be converted
    #[error("Failed to convert change event: {0}")]
    Conversion(#[from] ConversionError),

    /// The resume token is not in the feed's history
    #[error("Invalid resume token (error code {code})")]
    InvalidResumeToken {
        /// Server error code
        code: i32,
    },

    /// The feed was invalidated (for example the watched database was dropped)
    #[error("Change feed invalidated: {reason}")]
    Invalidated {
        /// Reason reported by the feed
        reason: String,
    },

    /// The feed was closed
    #[error("Change feed closed")]
    Closed,

    /// Invalid feed configuration
    #[error("Change feed configuration error: {0}")]
    Configuration(String),
}

impl FeedError {
    /// Creates a connection error without an underlying source.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
            code: None,
            labels: Vec::new(),
        }
    }

    /// Returns the error category used as a metrics label.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Conversion(_) => "conversion",
            Self::InvalidResumeToken { .. } => "invalid_resume_token",
            Self::Invalidated { .. } => "invalidated",
            Self::Closed => "closed",
            Self::Configuration(_) => "configuration",
        }
    }
}

type Subscriber = mpsc::UnboundedSender<Result<ChangeEvent, FeedError>>;

#[derive(Default)]
struct MemoryFeedState {
    log: Vec<ChangeEvent>,
    subscribers: Vec<Subscriber>,
    opened_with: Vec<Option<ResumeToken>>,
    next_open_failure: Option<String>,
    sequence: u64,
}

/// In-memory change feed.
///
/// Every appended change is kept in an ordered log and fanned out to open
/// cursors. Opening with a token replays the log after that token, then
/// continues live. A token that is not in the log is rejected with
/// [`FeedError::InvalidResumeToken`].
///
/// Clones share the same log.
#[derive(Clone, Default)]
pub struct MemoryChangeFeed {
    state: Arc<Mutex<MemoryFeedState>>,
    observed: Option<Arc<HashSet<String>>>,
}

impl MemoryChangeFeed {
    /// Creates an empty feed that observes every collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty feed restricted to `collections`.
    ///
    /// Changes on other collections are dropped on append.
    pub fn watching<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Arc::default(),
            observed: Some(Arc::new(collections.into_iter().map(Into::into).collect())),
        }
    }

    /// Appends a change with a freshly minted token and returns it.
    pub async fn emit(
        &self,
        operation: OperationType,
        namespace: Namespace,
        document: Option<Document>,
    ) -> ChangeEvent {
        let mut state = self.state.lock().await;
        state.sequence += 1;
        let token = ResumeToken::from_document(doc! { "_data": format!("{:016X}", state.sequence) });

        let mut event = ChangeEvent::new(operation, namespace, token);
        if let Some(document) = document {
            if let Some(id) = document.get("_id") {
                event = event.with_document_key(doc! { "_id": id.clone() });
            }
            event = event.with_full_document(document);
        }

        self.append_locked(&mut state, event.clone());
        event
    }

    /// Appends a change that already carries its token.
    pub async fn push(&self, event: ChangeEvent) {
        let mut state = self.state.lock().await;
        self.append_locked(&mut state, event);
    }

    fn append_locked(&self, state: &mut MemoryFeedState, event: ChangeEvent) {
        if !self.observes(event.collection_name()) {
            trace!(collection = %event.collection_name(), "Change outside watched collections dropped");
            return;
        }

        state
            .subscribers
            .retain(|subscriber| subscriber.unbounded_send(Ok(event.clone())).is_ok());
        state.log.push(event);
    }

    /// Delivers a connection error to every open cursor and ends them.
    pub async fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.state.lock().await;
        for subscriber in state.subscribers.drain(..) {
            let _ = subscriber.unbounded_send(Err(FeedError::connection(message.clone())));
        }
    }

    /// Makes the next [`open`](ChangeFeed::open) call fail with a connection error.
    pub async fn fail_next_open(&self, message: impl Into<String>) {
        self.state.lock().await.next_open_failure = Some(message.into());
    }

    /// Ends every open cursor.
    pub async fn close(&self) {
        self.state.lock().await.subscribers.clear();
    }

    /// Returns a snapshot of the change log.
    pub async fn events(&self) -> Vec<ChangeEvent> {
        self.state.lock().await.log.clone()
    }

    /// Returns the `resume_after` argument of every `open` call, in order.
    pub async fn opened_with(&self) -> Vec<Option<ResumeToken>> {
        self.state.lock().await.opened_with.clone()
    }

    /// Returns the number of live cursors.
    pub async fn open_cursors(&self) -> usize {
        let mut state = self.state.lock().await;
        state.subscribers.retain(|subscriber| !subscriber.is_closed());
        state.subscribers.len()
    }
}

#[async_trait::async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn open(&self, resume_after: Option<&ResumeToken>) -> Result<FeedCursor, FeedError> {
        let mut state = self.state.lock().await;
        state.opened_with.push(resume_after.cloned());

        if let Some(message) = state.next_open_failure.take() {
            return Err(FeedError::connection(message));
        }

        let backlog: Vec<ChangeEvent> = match resume_after {
            None => Vec::new(),
            Some(token) => {
                let position = state
                    .log
                    .iter()
                    .position(|event| &event.resume_token == token)
                    .ok_or(FeedError::InvalidResumeToken {
                        code: INVALID_RESUME_TOKEN_CODE,
                    })?;
                state.log[position + 1..].to_vec()
            }
        };

        let (tx, rx) = mpsc::unbounded();
        debug!(replayed = backlog.len(), "Opening in-memory change feed");
        for event in backlog {
            // The receiver is still held here, so the send cannot fail.
            let _ = tx.unbounded_send(Ok(event));
        }
        state.subscribers.push(tx);

        Ok(rx.boxed())
    }

    fn observes(&self, collection: &str) -> bool {
        self.observed
            .as_ref()
            .map_or(true, |observed| observed.contains(collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(collection: &str) -> Namespace {
        Namespace::new("kitchen", collection)
    }

    #[tokio::test]
    async fn live_tail_sees_only_new_changes() {
        let feed = MemoryChangeFeed::new();
        feed.emit(OperationType::Insert, ns("recipes"), None).await;

        let mut cursor = feed.open(None).await.unwrap();
        let fresh = feed.emit(OperationType::Update, ns("recipes"), None).await;

        let received = cursor.next().await.unwrap().unwrap();
        assert_eq!(received.resume_token, fresh.resume_token);
    }

    #[tokio::test]
    async fn resume_replays_after_token() {
        let feed = MemoryChangeFeed::new();
        let first = feed.emit(OperationType::Insert, ns("recipes"), None).await;
        let second = feed.emit(OperationType::Insert, ns("recipes"), None).await;
        let third = feed.emit(OperationType::Insert, ns("recipes"), None).await;

        let mut cursor = feed.open(Some(&first.resume_token)).await.unwrap();
        assert_eq!(cursor.next().await.unwrap().unwrap(), second);
        assert_eq!(cursor.next().await.unwrap().unwrap(), third);
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let feed = MemoryChangeFeed::new();
        let stranger = ResumeToken::from_document(doc! { "_data": "FFFF" });

        let err = feed.open(Some(&stranger)).await.err().unwrap();
        assert!(matches!(err, FeedError::InvalidResumeToken { code: 286 }));
        assert_eq!(err.category(), "invalid_resume_token");
    }

    #[tokio::test]
    async fn fail_ends_cursor_with_error() {
        let feed = MemoryChangeFeed::new();
        let mut cursor = feed.open(None).await.unwrap();

        feed.fail("primary stepped down").await;

        assert!(matches!(cursor.next().await, Some(Err(FeedError::Connection { .. }))));
        assert!(cursor.next().await.is_none());
    }

    #[tokio::test]
    async fn fail_next_open_applies_once() {
        let feed = MemoryChangeFeed::new();
        feed.fail_next_open("unreachable").await;

        assert!(feed.open(None).await.is_err());
        assert!(feed.open(None).await.is_ok());
        assert_eq!(feed.opened_with().await, vec![None, None]);
    }

    #[tokio::test]
    async fn restricted_feed_drops_unwatched_collections() {
        let feed = MemoryChangeFeed::watching(["recipes", "heartbeats"]);
        assert!(feed.observes("heartbeats"));
        assert!(!feed.observes("billing"));

        feed.emit(OperationType::Insert, ns("billing"), None).await;
        feed.emit(OperationType::Insert, ns("recipes"), None).await;
        assert_eq!(feed.events().await.len(), 1);
    }

    #[tokio::test]
    async fn emit_derives_document_key() {
        let feed = MemoryChangeFeed::new();
        let event = feed
            .emit(OperationType::Insert, ns("recipes"), Some(doc! { "_id": 5, "title": "Ragu" }))
            .await;
        assert_eq!(event.document_id(), Some(&bson::Bson::Int32(5)));
        assert!(event.full_document.is_some());
    }
}
