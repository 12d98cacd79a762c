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

//! Configuration for the Redis stream publisher.

use ladle_core::handler::HandlerError;
use std::collections::BTreeSet;
use std::time::Duration;

/// Default de-duplication window.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for [`RedisStreamPublisher`](super::RedisStreamPublisher).
///
/// # Example
///
/// ```rust
/// use ladle_handlers::redis_stream::RedisStreamConfig;
/// use std::time::Duration;
///
/// let config = RedisStreamConfig::builder()
///     .url("redis://localhost:6379")
///     .stream("kitchen.changes")
///     .collections(["recipes", "menus"])
///     .group_key_field("recipeId")
///     .dedup_ttl(Duration::from_secs(3600))
///     .max_len(100_000)
///     .build()
///     .unwrap();
///
/// assert_eq!(config.stream, "kitchen.changes");
/// ```
#[derive(Debug, Clone)]
pub struct RedisStreamConfig {
    /// Redis connection URL (required).
    pub url: String,

    /// Stream key entries are appended to (required).
    pub stream: String,

    /// Collections to publish. `None` publishes every business change.
    pub collections: Option<BTreeSet<String>>,

    /// Top-level field of the full document used as the entry's group key.
    ///
    /// When unset, or absent from a change, the document id is used.
    pub group_key_field: Option<String>,

    /// How long a published change's de-duplication key is remembered
    /// (default: 24 hours).
    pub dedup_ttl: Duration,

    /// Approximate maximum stream length (`XADD MAXLEN ~`). `None` never trims.
    pub max_len: Option<usize>,

    /// Connection pool size (default: 4).
    pub pool_size: usize,

    /// Connection timeout (default: 5 seconds).
    pub connection_timeout: Duration,
}

impl RedisStreamConfig {
    /// Creates a new builder for `RedisStreamConfig`.
    #[must_use]
    pub fn builder() -> RedisStreamConfigBuilder {
        RedisStreamConfigBuilder::default()
    }

    /// Returns true if changes on `collection` should be published.
    #[must_use]
    pub fn publishes(&self, collection: &str) -> bool {
        self.collections
            .as_ref()
            .map_or(true, |set| set.contains(collection))
    }
}

/// Builder for [`RedisStreamConfig`].
#[derive(Debug, Default)]
pub struct RedisStreamConfigBuilder {
    url: Option<String>,
    stream: Option<String>,
    collections: Option<BTreeSet<String>>,
    group_key_field: Option<String>,
    dedup_ttl: Option<Duration>,
    max_len: Option<usize>,
    pool_size: Option<usize>,
    connection_timeout: Option<Duration>,
}

impl RedisStreamConfigBuilder {
    /// Sets the Redis connection URL (required).
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the stream key (required).
    #[must_use]
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Restricts publishing to the given collections.
    #[must_use]
    pub fn collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = Some(collections.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the business key field used for grouping.
    #[must_use]
    pub fn group_key_field(mut self, field: impl Into<String>) -> Self {
        self.group_key_field = Some(field.into());
        self
    }

    /// Sets the de-duplication window.
    #[must_use]
    pub fn dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = Some(ttl);
        self
    }

    /// Caps the stream at approximately `max_len` entries.
    #[must_use]
    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    /// Sets the connection pool size.
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Builds the `RedisStreamConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Configuration`] naming the offending parameter if:
    /// - `url` or `stream` is missing or empty
    /// - the collection filter is empty
    /// - `group_key_field` is empty
    /// - `dedup_ttl` is shorter than one second
    /// - `max_len` or `pool_size` is 0
    pub fn build(self) -> Result<RedisStreamConfig, HandlerError> {
        fn invalid(message: &str, parameter: &str) -> HandlerError {
            HandlerError::configuration(message, Some(parameter.to_string()))
        }

        let url = self
            .url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| invalid("Redis URL is required", "url"))?;

        let stream = self
            .stream
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("stream name is required", "stream"))?;

        if self.collections.as_ref().is_some_and(BTreeSet::is_empty) {
            return Err(invalid("collection filter cannot be empty", "collections"));
        }

        if self.group_key_field.as_deref() == Some("") {
            return Err(invalid("group key field cannot be empty", "group_key_field"));
        }

        let dedup_ttl = self.dedup_ttl.unwrap_or(DEFAULT_DEDUP_TTL);
        if dedup_ttl.as_secs() == 0 {
            return Err(invalid(
                "de-duplication TTL must be at least one second",
                "dedup_ttl",
            ));
        }

        if self.max_len == Some(0) {
            return Err(invalid("max_len must be greater than 0", "max_len"));
        }

        let pool_size = self.pool_size.unwrap_or(4);
        if pool_size == 0 {
            return Err(invalid("pool size must be greater than 0", "pool_size"));
        }

        Ok(RedisStreamConfig {
            url,
            stream,
            collections: self.collections,
            group_key_field: self.group_key_field,
            dedup_ttl,
            max_len: self.max_len,
            pool_size,
            connection_timeout: self.connection_timeout.unwrap_or(Duration::from_secs(5)),
        })
    }
}
