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

//! `MongoDB`-backed checkpoint store.
//!
//! Positions are kept in the watched database itself, one document per feed:
//!
//! ```text
//! { _id: <feedId>, feedId: <feedId>, token: <resume token>, updatedAt: <date> }
//! ```
//!
//! Every write is a `replaceOne` upsert on `_id`. Because the collection is
//! inside the watched database, each checkpoint write produces a change of
//! its own; [`CheckpointStore::backing_collection`] reports the collection
//! so the processor drops those changes instead of dispatching them.

use async_trait::async_trait;
use bson::{doc, Document};
use chrono::Utc;
use futures::TryStreamExt;
use ladle_core::checkpoint::{
    CheckpointError, CheckpointStore, ResumePosition, DEFAULT_CHECKPOINT_COLLECTION,
};
use ladle_core::event::ResumeToken;
use mongodb::options::WriteConcern;
use mongodb::{Collection, Database};
use tracing::{debug, warn};

/// Checkpoint store writing into a collection of the watched database.
#[derive(Debug, Clone)]
pub struct MongoCheckpointStore {
    collection: Collection<Document>,
}

impl MongoCheckpointStore {
    /// Creates a store using the default `resume_tokens` collection.
    #[must_use]
    pub fn new(database: &Database) -> Self {
        Self::with_collection(database, DEFAULT_CHECKPOINT_COLLECTION)
    }

    /// Creates a store using a custom collection.
    #[must_use]
    pub fn with_collection(database: &Database, collection: &str) -> Self {
        Self {
            collection: database.collection::<Document>(collection),
        }
    }

    /// Returns the collection name.
    #[must_use]
    pub fn collection_name(&self) -> &str {
        self.collection.name()
    }

    fn to_record(position: &ResumePosition) -> Result<Document, CheckpointError> {
        let mut record = bson::to_document(position)
            .map_err(|e| CheckpointError::Serialization(format!("Failed to encode position: {e}")))?;
        record.insert("_id", position.feed_id.as_str());
        Ok(record)
    }

    fn from_record(record: Document) -> Result<ResumePosition, CheckpointError> {
        bson::from_document(record)
            .map_err(|e| CheckpointError::Serialization(format!("Failed to decode position: {e}")))
    }
}

fn connection_error(e: mongodb::error::Error) -> CheckpointError {
    CheckpointError::Connection(e.to_string())
}

#[async_trait]
impl CheckpointStore for MongoCheckpointStore {
    async fn get(&self, feed_id: &str) -> Result<Option<ResumePosition>, CheckpointError> {
        let record = self
            .collection
            .find_one(doc! { "_id": feed_id })
            .await
            .map_err(connection_error)?;

        let position = record.map(Self::from_record).transpose()?;
        debug!(
            feed_id,
            collection = %self.collection.name(),
            found = position.is_some(),
            "Loaded position from MongoDB"
        );
        Ok(position)
    }

    async fn set(&self, feed_id: &str, token: &ResumeToken) -> Result<(), CheckpointError> {
        let record = Self::to_record(&ResumePosition::new(feed_id, token.clone(), Utc::now()))?;
        // Majority acknowledgement: a failover must not roll back a position.
        self.collection
            .replace_one(doc! { "_id": feed_id }, record)
            .upsert(true)
            .write_concern(WriteConcern::majority())
            .await
            .map_err(connection_error)?;

        debug!(feed_id, token = %token.fingerprint(), "Saved position to MongoDB");
        Ok(())
    }

    async fn delete(&self, feed_id: &str) -> Result<(), CheckpointError> {
        let result = self
            .collection
            .delete_one(doc! { "_id": feed_id })
            .await
            .map_err(connection_error)?;

        if result.deleted_count == 0 {
            warn!(feed_id, "Attempted to delete non-existent position");
        } else {
            debug!(feed_id, "Deleted position from MongoDB");
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ResumePosition>, CheckpointError> {
        let records: Vec<Document> = self
            .collection
            .find(doc! {})
            .sort(doc! { "_id": 1 })
            .await
            .map_err(connection_error)?
            .try_collect()
            .await
            .map_err(connection_error)?;

        records.into_iter().map(Self::from_record).collect()
    }

    fn backing_collection(&self) -> Option<&str> {
        Some(self.collection.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let position = ResumePosition::new(
            "kitchen",
            ResumeToken::from_document(doc! { "_data": "82A1" }),
            Utc::now(),
        );

        let record = MongoCheckpointStore::to_record(&position).unwrap();

        assert_eq!(record.get_str("_id").unwrap(), "kitchen");
        assert_eq!(record.get_str("feedId").unwrap(), "kitchen");
        assert_eq!(
            record.get_document("token").unwrap(),
            &doc! { "_data": "82A1" }
        );
        assert!(record.get_datetime("updatedAt").is_ok());
    }

    #[test]
    fn test_record_decodes_with_id() {
        let record = doc! {
            "_id": "kitchen",
            "feedId": "kitchen",
            "token": { "_data": "82A2" },
            "updatedAt": bson::DateTime::now(),
        };

        let position = MongoCheckpointStore::from_record(record).unwrap();
        assert_eq!(position.feed_id, "kitchen");
        assert_eq!(position.token, ResumeToken::from_document(doc! { "_data": "82A2" }));
    }

    #[test]
    fn test_record_missing_token_is_rejected() {
        let record = doc! { "_id": "kitchen", "feedId": "kitchen" };
        assert!(matches!(
            MongoCheckpointStore::from_record(record),
            Err(CheckpointError::Serialization(_))
        ));
    }
}
