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

//! In-memory checkpoint store.
//!
//! Positions live in a [`HashMap`] behind an [`RwLock`] and are lost when the
//! process exits. Use it for local development, tests, and demos; anything
//! that must survive a restart needs the `MongoDB` or Redis store.
//!
//! # Example
//!
//! ```rust
//! use ladle_stores::memory::MemoryStore;
//! use ladle_core::checkpoint::CheckpointStore;
//! use ladle_core::event::ResumeToken;
//! use bson::doc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new();
//!
//! let token = ResumeToken::from_document(doc! { "_data": "82A1" });
//! store.set("kitchen", &token).await?;
//!
//! let position = store.get("kitchen").await?.expect("position saved");
//! assert_eq!(position.token, token);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::Utc;
use ladle_core::checkpoint::{CheckpointError, CheckpointStore, ResumePosition};
use ladle_core::event::ResumeToken;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

/// In-memory checkpoint store.
///
/// Clones share the same map, so a test can keep a handle while the
/// processor owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    positions: Arc<RwLock<HashMap<String, ResumePosition>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        debug!("Creating in-memory checkpoint store");
        Self::default()
    }

    /// Creates a store pre-populated with positions, keyed by their feed id.
    #[must_use]
    pub fn with_positions(positions: impl IntoIterator<Item = ResumePosition>) -> Self {
        let positions: HashMap<_, _> = positions
            .into_iter()
            .map(|p| (p.feed_id.clone(), p))
            .collect();
        debug!(
            position_count = positions.len(),
            "Creating in-memory checkpoint store with initial positions"
        );
        Self {
            positions: Arc::new(RwLock::new(positions)),
        }
    }

    /// Returns the number of stored positions.
    pub async fn len(&self) -> usize {
        self.positions.read().await.len()
    }

    /// Returns `true` if no position is stored.
    pub async fn is_empty(&self) -> bool {
        self.positions.read().await.is_empty()
    }

    /// Removes every stored position.
    pub async fn clear(&self) {
        let mut positions = self.positions.write().await;
        let count = positions.len();
        positions.clear();
        debug!(cleared_count = count, "Cleared in-memory checkpoint store");
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn get(&self, feed_id: &str) -> Result<Option<ResumePosition>, CheckpointError> {
        let position = self.positions.read().await.get(feed_id).cloned();
        trace!(feed_id, found = position.is_some(), "Loaded position from memory");
        Ok(position)
    }

    async fn set(&self, feed_id: &str, token: &ResumeToken) -> Result<(), CheckpointError> {
        let position = ResumePosition::new(feed_id, token.clone(), Utc::now());
        self.positions
            .write()
            .await
            .insert(feed_id.to_string(), position);
        trace!(feed_id, token = %token.fingerprint(), "Saved position to memory");
        Ok(())
    }

    async fn delete(&self, feed_id: &str) -> Result<(), CheckpointError> {
        if self.positions.write().await.remove(feed_id).is_some() {
            debug!(feed_id, "Deleted position from memory");
        } else {
            warn!(feed_id, "Attempted to delete non-existent position");
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ResumePosition>, CheckpointError> {
        let mut positions: Vec<_> = self.positions.read().await.values().cloned().collect();
        positions.sort_by(|a, b| a.feed_id.cmp(&b.feed_id));
        Ok(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn token(data: &str) -> ResumeToken {
        ResumeToken::from_document(doc! { "_data": data })
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = MemoryStore::new();
        assert!(store.is_empty().await);
        assert!(store.get("kitchen").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_overwrites_previous_position() {
        let store = MemoryStore::new();
        store.set("kitchen", &token("01")).await.unwrap();
        let first = store.get("kitchen").await.unwrap().unwrap();

        store.set("kitchen", &token("02")).await.unwrap();
        let second = store.get("kitchen").await.unwrap().unwrap();

        assert_eq!(second.token, token("02"));
        assert_eq!(second.feed_id, "kitchen");
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_set_is_idempotent() {
        let store = MemoryStore::new();
        store.set("kitchen", &token("01")).await.unwrap();
        store.set("kitchen", &token("01")).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("kitchen").await.unwrap().unwrap().token, token("01"));
    }

    #[tokio::test]
    async fn test_feeds_are_independent() {
        let store = MemoryStore::new();
        store.set("kitchen", &token("01")).await.unwrap();
        store.set("cellar", &token("02")).await.unwrap();

        let listed = store.list().await.unwrap();
        let ids: Vec<_> = listed.iter().map(|p| p.feed_id.as_str()).collect();
        assert_eq!(ids, vec!["cellar", "kitchen"]);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        store.set("kitchen", &token("01")).await.unwrap();

        store.delete("kitchen").await.unwrap();
        assert!(store.get("kitchen").await.unwrap().is_none());

        // Deleting again is not an error.
        store.delete("kitchen").await.unwrap();
    }

    #[tokio::test]
    async fn test_with_positions_and_clear() {
        let store = MemoryStore::with_positions([
            ResumePosition::new("kitchen", token("01"), Utc::now()),
            ResumePosition::new("cellar", token("02"), Utc::now()),
        ]);
        assert_eq!(store.len().await, 2);

        store.clear().await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        other.set("kitchen", &token("01")).await.unwrap();

        assert!(store.get("kitchen").await.unwrap().is_some());
        assert!(store.backing_collection().is_none());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = vec![];

        for i in 0..10 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .set(&format!("feed_{i}"), &token(&format!("{i:02}")))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len().await, 10);
    }
}
