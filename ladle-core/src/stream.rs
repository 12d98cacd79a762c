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

//! `MongoDB` change stream feed.
//!
//! [`MongoChangeFeed`] opens a database-level change stream and adapts it to
//! the [`ChangeFeed`] contract:
//!
//! - resume tokens are passed to the server as `resumeAfter`,
//! - driver events are converted into [`ChangeEvent`]s,
//! - an `invalidate` event ends the cursor with [`FeedError::Invalidated`],
//! - server error 286 is reported as [`FeedError::InvalidResumeToken`].
//!
//! There is no reconnection here. A broken cursor surfaces as an error and
//! the owner decides whether to restart.
//!
//! # Example
//!
//! ```rust,no_run
//! use ladle_core::feed::ChangeFeed;
//! use ladle_core::stream::{MongoChangeFeed, MongoFeedConfig};
//! use futures::StreamExt;
//! use mongodb::Client;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::with_uri_str("mongodb://localhost:27017/?replicaSet=rs0").await?;
//! let config = MongoFeedConfig::builder()
//!     .full_document_update_lookup()
//!     .build()?;
//!
//! let feed = MongoChangeFeed::new(client.database("kitchen"), config);
//! let mut cursor = feed.open(None).await?;
//! while let Some(event) = cursor.next().await {
//!     println!("{:?}", event?.operation);
//! }
//! # Ok(())
//! # }
//! ```

use crate::event::{ChangeEvent, ConversionError, ResumeToken};
use crate::feed::{ChangeFeed, FeedCursor, FeedError, INVALID_RESUME_TOKEN_CODE};
use bson::{doc, Document};
use futures::StreamExt;
use mongodb::{
    error::{Error as MongoError, ErrorKind as MongoErrorKind},
    options::{ChangeStreamOptions, FullDocumentType},
    Database,
};
use std::fmt;
use tracing::{debug, info, warn};

impl From<MongoError> for FeedError {
    fn from(err: MongoError) -> Self {
        let code = match err.kind.as_ref() {
            MongoErrorKind::Command(cmd_err) => Some(cmd_err.code),
            _ => None,
        };

        if code == Some(INVALID_RESUME_TOKEN_CODE) {
            return Self::InvalidResumeToken {
                code: INVALID_RESUME_TOKEN_CODE,
            };
        }

        let labels: Vec<String> = err.labels().iter().cloned().collect();

        Self::Connection {
            message: err.to_string(),
            source: Some(Box::new(err)),
            code,
            labels,
        }
    }
}

/// Which collections of the database the feed delivers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WatchScope {
    /// Every collection, including ones created later.
    #[default]
    Database,

    /// Only the named collections.
    Collections(Vec<String>),
}

impl WatchScope {
    /// Returns true if changes on `collection` fall inside this scope.
    pub fn includes(&self, collection: &str) -> bool {
        match self {
            Self::Database => true,
            Self::Collections(names) => names.iter().any(|name| name == collection),
        }
    }
}

impl fmt::Display for WatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database => write!(f, "database"),
            Self::Collections(names) => write!(f, "collections({})", names.join(", ")),
        }
    }
}

/// Configuration for [`MongoChangeFeed`].
#[derive(Debug, Clone, Default)]
pub struct MongoFeedConfig {
    /// Collections delivered by the feed
    pub scope: WatchScope,

    /// Look up the current document for update events
    pub full_document_on_update: bool,

    /// Server batch size
    pub batch_size: Option<u32>,

    /// Extra aggregation stages appended after the scope filter
    pub pipeline: Vec<Document>,
}

impl MongoFeedConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> MongoFeedConfigBuilder {
        MongoFeedConfigBuilder::default()
    }

    fn to_pipeline(&self) -> Vec<Document> {
        let mut stages = Vec::with_capacity(self.pipeline.len() + 1);
        if let WatchScope::Collections(names) = &self.scope {
            stages.push(doc! { "$match": { "ns.coll": { "$in": names.clone() } } });
        }
        stages.extend(self.pipeline.iter().cloned());
        stages
    }

    fn to_mongo_options(
        &self,
        resume_after: Option<&ResumeToken>,
    ) -> Result<ChangeStreamOptions, FeedError> {
        let mut options = ChangeStreamOptions::default();

        if self.full_document_on_update {
            options.full_document = Some(FullDocumentType::UpdateLookup);
        }
        options.batch_size = self.batch_size;

        // Stored tokens are plain documents; the driver wants its own type.
        if let Some(token) = resume_after {
            let bytes = bson::to_vec(token.as_document())
                .map_err(|e| ConversionError::TokenEncoding(e.to_string()))?;
            let driver_token = bson::from_slice(&bytes)
                .map_err(|e| ConversionError::TokenEncoding(e.to_string()))?;
            options.resume_after = Some(driver_token);
        }

        Ok(options)
    }
}

/// Builder for [`MongoFeedConfig`].
#[derive(Debug, Default)]
pub struct MongoFeedConfigBuilder {
    scope: WatchScope,
    full_document_on_update: bool,
    batch_size: Option<u32>,
    pipeline: Vec<Document>,
}

impl MongoFeedConfigBuilder {
    /// Sets the watch scope.
    #[must_use]
    pub fn watch_scope(mut self, scope: WatchScope) -> Self {
        self.scope = scope;
        self
    }

    /// Restricts the feed to the given collections.
    #[must_use]
    pub fn watch_collections(mut self, collections: Vec<String>) -> Self {
        self.scope = WatchScope::Collections(collections);
        self
    }

    /// Includes the current full document on update events.
    #[must_use]
    pub fn full_document_update_lookup(mut self) -> Self {
        self.full_document_on_update = true;
        self
    }

    /// Sets the server batch size.
    #[must_use]
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Appends aggregation stages.
    #[must_use]
    pub fn pipeline(mut self, stages: Vec<Document>) -> Self {
        self.pipeline = stages;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Configuration`] for an empty collection scope or
    /// a zero batch size.
    pub fn build(self) -> Result<MongoFeedConfig, FeedError> {
        if let WatchScope::Collections(names) = &self.scope {
            if names.is_empty() {
                return Err(FeedError::Configuration(
                    "collection scope must name at least one collection".to_string(),
                ));
            }
        }

        if self.batch_size == Some(0) {
            return Err(FeedError::Configuration(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        Ok(MongoFeedConfig {
            scope: self.scope,
            full_document_on_update: self.full_document_on_update,
            batch_size: self.batch_size,
            pipeline: self.pipeline,
        })
    }
}

/// Change feed over one `MongoDB` database.
#[derive(Debug, Clone)]
pub struct MongoChangeFeed {
    database: Database,
    config: MongoFeedConfig,
}

impl MongoChangeFeed {
    /// Creates a feed over `database`.
    pub fn new(database: Database, config: MongoFeedConfig) -> Self {
        Self { database, config }
    }

    /// Returns the watched database name.
    pub fn database_name(&self) -> &str {
        self.database.name()
    }
}

#[async_trait::async_trait]
impl ChangeFeed for MongoChangeFeed {
    async fn open(&self, resume_after: Option<&ResumeToken>) -> Result<FeedCursor, FeedError> {
        let options = self.config.to_mongo_options(resume_after)?;
        let pipeline = self.config.to_pipeline();

        debug!(
            database = %self.database.name(),
            scope = %self.config.scope,
            resuming = resume_after.is_some(),
            "Opening change stream"
        );

        let stream = self
            .database
            .watch()
            .pipeline(pipeline)
            .with_options(options)
            .await?;

        info!(database = %self.database.name(), "Change stream opened");

        let database = self.database.name().to_string();
        let cursor = stream.map(move |item| -> Result<ChangeEvent, FeedError> {
            let event = ChangeEvent::try_from(item?)?;
            if event.is_invalidate() {
                warn!(database = %database, "Change stream invalidated");
                return Err(FeedError::Invalidated {
                    reason: format!("change stream on database '{database}' was invalidated"),
                });
            }
            Ok(event)
        });

        Ok(cursor.boxed())
    }

    fn observes(&self, collection: &str) -> bool {
        self.config.scope.includes(collection)
    }
}
