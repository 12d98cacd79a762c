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

//! Durable storage for feed positions.
//!
//! The [`CheckpointStore`] trait persists one [`ResumePosition`] per feed id.
//! The processor reads it once at startup and overwrites it after every
//! fully dispatched change, so a restarted processor resumes right after
//! the last change all handlers have seen.
//!
//! # Example
//!
//! ```rust
//! use ladle_core::checkpoint::{CheckpointError, CheckpointStore, ResumePosition};
//! use ladle_core::event::ResumeToken;
//! use chrono::Utc;
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//!
//! #[derive(Default)]
//! struct MapStore {
//!     positions: Arc<Mutex<HashMap<String, ResumePosition>>>,
//! }
//!
//! #[async_trait::async_trait]
//! impl CheckpointStore for MapStore {
//!     async fn get(&self, feed_id: &str) -> Result<Option<ResumePosition>, CheckpointError> {
//!         Ok(self.positions.lock().await.get(feed_id).cloned())
//!     }
//!
//!     async fn set(&self, feed_id: &str, token: &ResumeToken) -> Result<(), CheckpointError> {
//!         let position = ResumePosition::new(feed_id, token.clone(), Utc::now());
//!         self.positions.lock().await.insert(feed_id.to_string(), position);
//!         Ok(())
//!     }
//!
//!     async fn delete(&self, feed_id: &str) -> Result<(), CheckpointError> {
//!         self.positions.lock().await.remove(feed_id);
//!         Ok(())
//!     }
//!
//!     async fn list(&self) -> Result<Vec<ResumePosition>, CheckpointError> {
//!         Ok(self.positions.lock().await.values().cloned().collect())
//!     }
//! }
//! ```

use crate::event::ResumeToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default collection checkpoint records are written to.
pub const DEFAULT_CHECKPOINT_COLLECTION: &str = "resume_tokens";

/// The last fully processed position of one feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumePosition {
    /// Feed this position belongs to
    #[serde(rename = "feedId")]
    pub feed_id: String,

    /// Token of the last change every handler was offered
    pub token: ResumeToken,

    /// When the position was written
    #[serde(rename = "updatedAt", with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl ResumePosition {
    /// Creates a position record.
    pub fn new(feed_id: impl Into<String>, token: ResumeToken, updated_at: DateTime<Utc>) -> Self {
        Self {
            feed_id: feed_id.into(),
            token,
            updated_at,
        }
    }
}

/// Trait for checkpoint storage backends.
///
/// Implementations must persist positions durably. `set` is an upsert: it
/// replaces any previous position for the feed and is safe to repeat.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Retrieves the stored position for a feed.
    ///
    /// Returns `None` if the feed has never completed a change.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached or the record is unreadable.
    async fn get(&self, feed_id: &str) -> Result<Option<ResumePosition>, CheckpointError>;

    /// Records `token` as the feed's position, stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is not acknowledged.
    async fn set(&self, feed_id: &str, token: &ResumeToken) -> Result<(), CheckpointError>;

    /// Removes the stored position for a feed.
    ///
    /// Operator tooling only. The processor never forgets a position.
    ///
    /// # Errors
    ///
    /// Returns an error if the position cannot be deleted.
    async fn delete(&self, feed_id: &str) -> Result<(), CheckpointError>;

    /// Lists every stored position.
    ///
    /// # Errors
    ///
    /// Returns an error if the positions cannot be listed.
    async fn list(&self) -> Result<Vec<ResumePosition>, CheckpointError>;

    /// Closes the store, releasing any resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be closed cleanly.
    async fn close(&self) -> Result<(), CheckpointError> {
        Ok(())
    }

    /// Name of the watched collection this store writes into, if any.
    ///
    /// Changes on that collection are the processor's own checkpoint writes
    /// and must never be dispatched.
    fn backing_collection(&self) -> Option<&str> {
        None
    }
}

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Position not found
    #[error("Position not found: {0}")]
    NotFound(String),

    /// Generic error
    #[error("Checkpoint store error: {0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn position_round_trips_through_bson() {
        let position = ResumePosition::new(
            "kitchen",
            ResumeToken::from_document(doc! { "_data": "01" }),
            DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
        );

        let document = bson::to_document(&position).unwrap();
        assert_eq!(document.get_str("feedId").unwrap(), "kitchen");
        assert!(document.get_datetime("updatedAt").is_ok());

        let back: ResumePosition = bson::from_document(document).unwrap();
        assert_eq!(back, position);
    }

    #[test]
    fn error_messages() {
        let err = CheckpointError::Connection("refused".into());
        assert_eq!(err.to_string(), "Connection error: refused");
    }
}
