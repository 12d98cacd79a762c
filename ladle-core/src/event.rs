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

//! Change feed event representation.
//!
//! A [`ChangeEvent`] is one change observed on the watched database. Every
//! event carries a [`ResumeToken`], the opaque position a feed can be reopened
//! from. The processor only reads events; handlers receive them by reference.
//!
//! # Examples
//!
//! ```rust
//! use ladle_core::event::{ChangeEvent, Namespace, OperationType, ResumeToken};
//! use bson::doc;
//!
//! let event = ChangeEvent::new(
//!     OperationType::Insert,
//!     Namespace::new("kitchen", "recipes"),
//!     ResumeToken::from_document(doc! { "_data": "8263A1" }),
//! )
//! .with_document_key(doc! { "_id": 7 })
//! .with_full_document(doc! { "_id": 7, "title": "Risotto" });
//!
//! assert!(event.is_insert());
//! assert_eq!(event.collection_name(), "recipes");
//! ```

use bson::Document;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Error that can occur when converting driver events or encoding resume tokens.
#[derive(Debug, Clone)]
pub enum ConversionError {
    /// Failed to convert the driver's resume token to a BSON document
    ResumeTokenConversion(String),

    /// Failed to encode or decode a resume token as bytes
    TokenEncoding(String),
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionError::ResumeTokenConversion(msg) => {
                write!(f, "Failed to convert resume token: {}", msg)
            }
            ConversionError::TokenEncoding(msg) => {
                write!(f, "Failed to encode resume token: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConversionError {}

/// Opaque position in a change feed.
///
/// The token is produced by the feed and handed back to it unchanged when
/// resuming. It can be compared for equality and persisted, either as an
/// embedded BSON value through serde or as raw bytes via
/// [`to_bytes`](Self::to_bytes). Its structure is never interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(Document);

impl ResumeToken {
    /// Wraps a feed-native token document.
    pub fn from_document(document: Document) -> Self {
        Self(document)
    }

    /// Encodes the token as BSON bytes for byte-oriented stores.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::TokenEncoding`] if the token cannot be serialized.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ConversionError> {
        bson::to_vec(&self.0).map_err(|e| ConversionError::TokenEncoding(e.to_string()))
    }

    /// Decodes a token previously produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::TokenEncoding`] if the bytes are not a BSON document.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConversionError> {
        bson::from_slice(bytes)
            .map(Self)
            .map_err(|e| ConversionError::TokenEncoding(e.to_string()))
    }

    /// Returns a stable string identifying this position.
    ///
    /// This is the lowercase hex of [`to_bytes`](Self::to_bytes), so equal
    /// tokens share a fingerprint across processes and distinct tokens never
    /// do. Downstream consumers use it as a de-duplication key for replayed
    /// changes.
    pub fn fingerprint(&self) -> String {
        match self.to_bytes() {
            Ok(bytes) => bytes.iter().map(|b| format!("{b:02x}")).collect(),
            Err(_) => format!("{:?}", self.0),
        }
    }

    pub(crate) fn as_document(&self) -> &Document {
        &self.0
    }
}

/// MongoDB change stream operation types.
///
/// The `Unknown` variant keeps forward compatibility with server versions
/// that introduce new operation types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum OperationType {
    /// A document was inserted into a collection
    Insert,

    /// A document was updated in place
    Update,

    /// A document was deleted from a collection
    Delete,

    /// A document was replaced entirely
    Replace,

    /// The change stream was invalidated
    Invalidate,

    /// A collection was dropped
    Drop,

    /// A database was dropped
    #[serde(rename = "dropdatabase")]
    DropDatabase,

    /// A collection was renamed
    Rename,

    /// An operation type this crate does not know about
    #[serde(untagged)]
    Unknown(String),
}

impl OperationType {
    /// Returns true if this operation modifies data (insert, update, replace).
    #[inline]
    pub fn is_data_modification(&self) -> bool {
        matches!(
            self,
            OperationType::Insert | OperationType::Update | OperationType::Replace
        )
    }

    /// Returns true if this operation removes data (delete, drop, drop database).
    #[inline]
    pub fn is_data_removal(&self) -> bool {
        matches!(
            self,
            OperationType::Delete | OperationType::Drop | OperationType::DropDatabase
        )
    }

    /// Returns the lowercase label used in logs and metrics.
    pub fn as_str(&self) -> &str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Replace => "replace",
            OperationType::Invalidate => "invalidate",
            OperationType::Drop => "drop",
            OperationType::DropDatabase => "dropdatabase",
            OperationType::Rename => "rename",
            OperationType::Unknown(op) => op,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MongoDB namespace (database + collection).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name
    #[serde(rename = "db")]
    pub database: String,

    /// Collection name
    #[serde(rename = "coll")]
    pub collection: String,
}

impl Namespace {
    /// Creates a new namespace from database and collection names.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Returns the fully qualified namespace as "database.collection".
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

/// Update description for partial document updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateDescription {
    /// Fields that were added or modified
    #[serde(rename = "updatedFields")]
    pub updated_fields: Document,

    /// Fields that were removed from the document
    #[serde(rename = "removedFields")]
    pub removed_fields: Vec<String>,
}

/// A single change observed on the feed.
///
/// Fields that are not present for every operation use `Option<T>`. For
/// example, `full_document` is absent on deletes and on updates unless the
/// feed was opened with update lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Type of operation that occurred
    #[serde(rename = "operationType")]
    pub operation: OperationType,

    /// Namespace where the operation occurred
    #[serde(rename = "ns")]
    pub namespace: Namespace,

    /// Document key (`_id` and shard key if sharded)
    #[serde(rename = "documentKey", skip_serializing_if = "Option::is_none")]
    pub document_key: Option<Document>,

    /// Full document after the operation
    #[serde(rename = "fullDocument", skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Document>,

    /// Description of what changed in an update operation
    #[serde(rename = "updateDescription", skip_serializing_if = "Option::is_none")]
    pub update_description: Option<UpdateDescription>,

    /// Timestamp of the operation in the oplog
    #[serde(rename = "clusterTime")]
    pub cluster_time: DateTime<Utc>,

    /// Position of this event in the feed
    #[serde(rename = "_id")]
    pub resume_token: ResumeToken,
}

impl ChangeEvent {
    /// Creates an event with no document payload, stamped with the current time.
    pub fn new(operation: OperationType, namespace: Namespace, resume_token: ResumeToken) -> Self {
        Self {
            operation,
            namespace,
            document_key: None,
            full_document: None,
            update_description: None,
            cluster_time: Utc::now(),
            resume_token,
        }
    }

    /// Sets the document key.
    #[must_use]
    pub fn with_document_key(mut self, key: Document) -> Self {
        self.document_key = Some(key);
        self
    }

    /// Sets the full document.
    #[must_use]
    pub fn with_full_document(mut self, document: Document) -> Self {
        self.full_document = Some(document);
        self
    }

    /// Sets the update description.
    #[must_use]
    pub fn with_update_description(mut self, description: UpdateDescription) -> Self {
        self.update_description = Some(description);
        self
    }

    /// Returns true if this is an insert operation.
    #[inline]
    pub fn is_insert(&self) -> bool {
        self.operation == OperationType::Insert
    }

    /// Returns true if this is an update operation.
    #[inline]
    pub fn is_update(&self) -> bool {
        self.operation == OperationType::Update
    }

    /// Returns true if this is a delete operation.
    #[inline]
    pub fn is_delete(&self) -> bool {
        self.operation == OperationType::Delete
    }

    /// Returns true if this is an invalidate operation.
    #[inline]
    pub fn is_invalidate(&self) -> bool {
        self.operation == OperationType::Invalidate
    }

    /// Returns the collection name.
    #[inline]
    pub fn collection_name(&self) -> &str {
        &self.namespace.collection
    }

    /// Returns the database name.
    #[inline]
    pub fn database_name(&self) -> &str {
        &self.namespace.database
    }

    /// Returns the document ID if present in the document key.
    pub fn document_id(&self) -> Option<&bson::Bson> {
        self.document_key.as_ref()?.get("_id")
    }
}

/// Conversion from the MongoDB driver's change stream event.
impl TryFrom<mongodb::change_stream::event::ChangeStreamEvent<Document>> for ChangeEvent {
    type Error = ConversionError;

    fn try_from(
        event: mongodb::change_stream::event::ChangeStreamEvent<Document>,
    ) -> Result<Self, Self::Error> {
        use mongodb::change_stream::event::OperationType as MongoOpType;

        let operation = match event.operation_type {
            MongoOpType::Insert => OperationType::Insert,
            MongoOpType::Update => OperationType::Update,
            MongoOpType::Delete => OperationType::Delete,
            MongoOpType::Replace => OperationType::Replace,
            MongoOpType::Invalidate => OperationType::Invalidate,
            MongoOpType::Drop => OperationType::Drop,
            MongoOpType::DropDatabase => OperationType::DropDatabase,
            MongoOpType::Rename => OperationType::Rename,
            other => {
                let op = format!("{other:?}");
                warn!(operation = %op, "Unknown change stream operation type");
                OperationType::Unknown(op)
            }
        };

        let namespace = event
            .ns
            .map(|ns| Namespace {
                database: ns.db,
                collection: ns.coll.unwrap_or_default(),
            })
            .unwrap_or_else(|| Namespace::new("", ""));

        let update_description = event.update_description.map(|ud| UpdateDescription {
            updated_fields: ud.updated_fields,
            removed_fields: ud.removed_fields,
        });

        // Increment maps to nanoseconds so events within one second stay ordered.
        let cluster_time = event
            .cluster_time
            .and_then(|ts| DateTime::from_timestamp(i64::from(ts.time), ts.increment))
            .unwrap_or_else(|| {
                warn!("Change stream event without a usable cluster time, using current time");
                Utc::now()
            });

        let token = bson::to_document(&event.id).map_err(|e| {
            ConversionError::ResumeTokenConversion(format!(
                "Failed to serialize resume token to BSON document: {}",
                e
            ))
        })?;

        Ok(Self {
            operation,
            namespace,
            document_key: event.document_key,
            full_document: event.full_document,
            update_description,
            cluster_time,
            resume_token: ResumeToken::from_document(token),
        })
    }
}
