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

//! Change handlers and ordered dispatch.
//!
//! A [`ChangeHandler`] reacts to one change at a time. Handlers are collected
//! in a [`HandlerRegistry`], and [`HandlerRegistry::dispatch_all`] offers each
//! change to every handler in registration order, one after the other.
//!
//! Handlers fail independently. An error (or a panic) from one handler is
//! logged and reported as [`HandlerOutcome::Failed`], and the remaining
//! handlers still run. The cycle is complete once every handler has been
//! attempted exactly once.
//!
//! # Example
//!
//! ```rust
//! use ladle_core::handler::{ChangeHandler, HandlerError, HandlerRegistry};
//! use ladle_core::event::ChangeEvent;
//! use async_trait::async_trait;
//!
//! struct AuditLog;
//!
//! #[async_trait]
//! impl ChangeHandler for AuditLog {
//!     fn name(&self) -> &str {
//!         "audit-log"
//!     }
//!
//!     async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
//!         println!("{} on {}", event.operation, event.collection_name());
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(AuditLog);
//! assert_eq!(registry.names(), vec!["audit-log"]);
//! ```

use crate::event::ChangeEvent;
use crate::metrics;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, trace};

/// Errors a handler can report for one change.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The downstream system could not be reached.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message
        message: String,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The change could not be encoded for the downstream system.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Human-readable error message
        message: String,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The downstream system rejected the change.
    #[error("Publish error: {message}")]
    Publish {
        /// Human-readable error message
        message: String,
        /// Whether a later attempt could succeed
        retryable: bool,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The handler is misconfigured.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Human-readable error message
        message: String,
        /// Configuration parameter name if applicable
        parameter: Option<String>,
    },

    /// The handler panicked while processing the change.
    #[error("Handler '{handler}' panicked: {message}")]
    Panicked {
        /// Name of the handler
        handler: String,
        /// Panic payload, if it was a string
        message: String,
    },

    /// Any other failure.
    #[error("Handler error: {message}")]
    Other {
        /// Human-readable error message
        message: String,
        /// The underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl HandlerError {
    /// Creates a connection error from any error type.
    #[must_use]
    pub fn connection(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Connection {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a connection error with a custom message.
    #[must_use]
    pub fn connection_msg(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a serialization error from any error type.
    #[must_use]
    pub fn serialization(
        source: impl std::error::Error + Send + Sync + 'static,
        context: impl Into<String>,
    ) -> Self {
        Self::Serialization {
            message: format!("{}: {}", context.into(), source),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a publish error with a custom message.
    #[must_use]
    pub fn publish_msg(message: impl Into<String>, retryable: bool) -> Self {
        Self::Publish {
            message: message.into(),
            retryable,
            source: None,
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>, parameter: Option<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            parameter,
        }
    }

    /// Creates a generic error with a custom message.
    #[must_use]
    pub fn other_msg(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
            source: None,
        }
    }

    /// Returns true if redelivering the same change could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Publish { retryable, .. } => *retryable,
            Self::Serialization { .. }
            | Self::Configuration { .. }
            | Self::Panicked { .. }
            | Self::Other { .. } => false,
        }
    }
}

/// A consumer of changes.
///
/// Implementations must be `Send + Sync`: the registry shares them with the
/// processor's worker task.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Returns false to skip a change without treating it as a failure.
    fn accepts(&self, event: &ChangeEvent) -> bool {
        let _ = event;
        true
    }

    /// Processes one change.
    ///
    /// # Errors
    ///
    /// Any error is logged by the dispatcher and does not affect other handlers.
    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError>;
}

/// Result of offering one change to one handler.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// The handler completed successfully.
    Delivered,

    /// The handler declined the change.
    Skipped,

    /// The handler returned an error or panicked.
    Failed(HandlerError),
}

impl HandlerOutcome {
    /// Returns true for [`HandlerOutcome::Failed`].
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Ordered collection of handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn ChangeHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler. Registration order is dispatch order.
    pub fn register<H>(&mut self, handler: H)
    where
        H: ChangeHandler + 'static,
    {
        self.handlers.push(Arc::new(handler));
    }

    /// Appends an already shared handler.
    pub fn register_shared(&mut self, handler: Arc<dyn ChangeHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the handler names in dispatch order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Returns the number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Offers `event` to every handler, sequentially, in registration order.
    ///
    /// Returns one outcome per handler, in the same order. Never fails: handler
    /// errors and panics are logged and captured in the outcomes.
    pub async fn dispatch_all(&self, event: &ChangeEvent) -> Vec<HandlerOutcome> {
        let mut outcomes = Vec::with_capacity(self.handlers.len());

        for handler in &self.handlers {
            let name = handler.name();

            if !handler.accepts(event) {
                trace!(handler = %name, collection = %event.collection_name(), "Handler skipped change");
                outcomes.push(HandlerOutcome::Skipped);
                continue;
            }

            let outcome = match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                Ok(Ok(())) => {
                    trace!(handler = %name, "Handler delivered change");
                    HandlerOutcome::Delivered
                }
                Ok(Err(e)) => {
                    error!(
                        handler = %name,
                        collection = %event.collection_name(),
                        operation = %event.operation,
                        error = %e,
                        "Handler failed"
                    );
                    metrics::increment_handler_failures(name);
                    HandlerOutcome::Failed(e)
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(
                        handler = %name,
                        collection = %event.collection_name(),
                        panic = %message,
                        "Handler panicked"
                    );
                    metrics::increment_handler_failures(name);
                    HandlerOutcome::Failed(HandlerError::Panicked {
                        handler: name.to_string(),
                        message,
                    })
                }
            };
            outcomes.push(outcome);
        }

        debug!(
            collection = %event.collection_name(),
            handlers = outcomes.len(),
            failed = outcomes.iter().filter(|o| o.is_failed()).count(),
            "Dispatch cycle complete"
        );

        outcomes
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Shared, ordered record of handler invocations.
///
/// Entries are `"{handler}:{token fingerprint}"`.
pub type CallJournal = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct MockState {
    events: Mutex<Vec<ChangeEvent>>,
    started: AtomicUsize,
    failing: AtomicBool,
}

/// In-memory handler for tests.
///
/// Records every change it completes, and can be configured to fail, panic,
/// stall, or only accept certain collections. Clones share state, so a test
/// can keep one clone while the registry owns another.
///
/// # Examples
///
/// ```rust
/// use ladle_core::handler::{HandlerRegistry, MockHandler};
/// use ladle_core::event::{ChangeEvent, Namespace, OperationType, ResumeToken};
/// use bson::doc;
///
/// # async fn example() {
/// let mock = MockHandler::new("mock");
/// let mut registry = HandlerRegistry::new();
/// registry.register(mock.clone());
///
/// let event = ChangeEvent::new(
///     OperationType::Insert,
///     Namespace::new("kitchen", "recipes"),
///     ResumeToken::from_document(doc! { "_data": "01" }),
/// );
/// registry.dispatch_all(&event).await;
/// assert_eq!(mock.call_count().await, 1);
/// # }
/// ```
#[derive(Clone)]
pub struct MockHandler {
    name: String,
    state: Arc<MockState>,
    panics: bool,
    delay: Option<Duration>,
    collections: Option<Vec<String>>,
    journal: Option<CallJournal>,
}

impl MockHandler {
    /// Creates a mock handler that accepts and records every change.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::default(),
            panics: false,
            delay: None,
            collections: None,
            journal: None,
        }
    }

    /// Configures the mock to fail every change.
    #[must_use]
    pub fn failing(self) -> Self {
        self.state.failing.store(true, Ordering::SeqCst);
        self
    }

    /// Configures the mock to panic on every change.
    #[must_use]
    pub const fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    /// Sleeps for `delay` before completing each change.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Only accepts changes on the given collections.
    #[must_use]
    pub fn only_collections(mut self, collections: &[&str]) -> Self {
        self.collections = Some(collections.iter().map(|c| (*c).to_string()).collect());
        self
    }

    /// Appends every completed call to a shared journal.
    #[must_use]
    pub fn with_journal(mut self, journal: CallJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Toggles failure at runtime.
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns the changes this handler completed, including failed attempts.
    pub async fn events(&self) -> Vec<ChangeEvent> {
        self.state.events.lock().await.clone()
    }

    /// Returns the number of completed calls.
    pub async fn call_count(&self) -> usize {
        self.state.events.lock().await.len()
    }

    /// Returns the number of calls that were entered, completed or not.
    #[must_use]
    pub fn started_count(&self) -> usize {
        self.state.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeHandler for MockHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, event: &ChangeEvent) -> bool {
        self.collections
            .as_ref()
            .map_or(true, |c| c.iter().any(|name| name == event.collection_name()))
    }

    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        self.state.started.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.panics {
            panic!("mock handler '{}' panicked", self.name);
        }

        self.state.events.lock().await.push(event.clone());
        if let Some(journal) = &self.journal {
            journal
                .lock()
                .await
                .push(format!("{}:{}", self.name, event.resume_token.fingerprint()));
        }

        if self.state.failing.load(Ordering::SeqCst) {
            return Err(HandlerError::publish_msg("Simulated handler failure", true));
        }
        Ok(())
    }
}
