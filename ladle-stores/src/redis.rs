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

//! Redis-backed checkpoint store.
//!
//! Each feed's position is one Redis string holding the BSON encoding of its
//! [`ResumePosition`]. Writes are plain `SET` (or `SET EX` when a TTL is
//! configured), so repeating a write is harmless.
//!
//! The store lives outside the watched database, so its writes never show up
//! on the change feed and [`CheckpointStore::backing_collection`] is `None`.
//!
//! # Key Pattern
//!
//! ```text
//! ladle:resume_token:{feed_id}
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use ladle_stores::redis::{RedisConfig, RedisStore};
//! use ladle_core::checkpoint::CheckpointStore;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisConfig::builder()
//!     .url("redis://localhost:6379")
//!     .pool_size(4)
//!     .ttl(Duration::from_secs(7 * 24 * 60 * 60))
//!     .build()?;
//!
//! let store = RedisStore::new(config).await?;
//! let position = store.get("kitchen").await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config as ConnectionConfig, Connection, Pool, PoolConfig, Runtime};
use ladle_core::checkpoint::{CheckpointError, CheckpointStore, ResumePosition};
use ladle_core::event::ResumeToken;
use redis::{AsyncCommands, RedisError};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Key prefix for every position written by this store.
pub const KEY_PREFIX: &str = "ladle:resume_token";

/// Maximum number of retry attempts for transient Redis errors.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const BASE_RETRY_DELAY_MS: u64 = 100;

/// Configuration for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., `redis://localhost:6379`)
    pub url: String,

    /// Connection pool size (default: 4)
    pub pool_size: usize,

    /// Optional expiry for stored positions
    ///
    /// Refreshed on every write. A position that expires is indistinguishable
    /// from a feed that never ran.
    pub ttl: Option<Duration>,

    /// Connection timeout (default: 5 seconds)
    pub connection_timeout: Duration,

    /// Maximum number of retries for transient errors (default: 3)
    pub max_retries: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 4,
            ttl: None,
            connection_timeout: Duration::from_secs(5),
            max_retries: MAX_RETRIES,
        }
    }
}

impl RedisConfig {
    /// Creates a new builder for `RedisConfig`.
    #[must_use]
    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::default()
    }
}

/// Builder for [`RedisConfig`] with validation.
#[derive(Debug, Default)]
pub struct RedisConfigBuilder {
    url: Option<String>,
    pool_size: Option<usize>,
    ttl: Option<Duration>,
    connection_timeout: Option<Duration>,
    max_retries: Option<u32>,
}

impl RedisConfigBuilder {
    /// Sets the Redis connection URL.
    ///
    /// Accepts `redis://`, `redis://:password@host`, `redis://host/db` and
    /// `rediss://` for TLS.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the connection pool size.
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Sets an expiry for stored positions.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Sets the maximum number of retries for transient errors.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Builds the `RedisConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is missing, the pool size is 0, or the TTL
    /// is shorter than one second.
    pub fn build(self) -> Result<RedisConfig, CheckpointError> {
        let url = self
            .url
            .ok_or_else(|| CheckpointError::Other("Redis URL is required".to_string()))?;

        let pool_size = self.pool_size.unwrap_or(4);
        if pool_size == 0 {
            return Err(CheckpointError::Other(
                "Pool size must be greater than 0".to_string(),
            ));
        }

        if let Some(ttl) = self.ttl {
            if ttl.as_secs() == 0 {
                return Err(CheckpointError::Other(
                    "TTL must be at least one second".to_string(),
                ));
            }
        }

        Ok(RedisConfig {
            url,
            pool_size,
            ttl: self.ttl,
            connection_timeout: self.connection_timeout.unwrap_or(Duration::from_secs(5)),
            max_retries: self.max_retries.unwrap_or(MAX_RETRIES),
        })
    }
}

/// Redis-backed checkpoint store.
///
/// `Clone` is cheap: clones share the connection pool.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    config: RedisConfig,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to Redis and verifies the connection with `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Connection`] if the pool cannot be created or
    /// the server does not answer.
    pub async fn new(config: RedisConfig) -> Result<Self, CheckpointError> {
        debug!(pool_size = config.pool_size, "Initializing Redis checkpoint store");

        let mut pool_settings = PoolConfig::new(config.pool_size);
        pool_settings.timeouts.wait = Some(config.connection_timeout);
        pool_settings.timeouts.create = Some(config.connection_timeout);
        pool_settings.timeouts.recycle = Some(config.connection_timeout);

        let mut pool_config = ConnectionConfig::from_url(&config.url);
        pool_config.pool = Some(pool_settings);

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| {
                error!(error = %e, "Failed to create Redis connection pool");
                CheckpointError::Connection(format!("Failed to create pool: {e}"))
            })?;

        let mut conn = pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get connection from pool");
            CheckpointError::Connection(format!("Failed to connect to Redis: {e}"))
        })?;

        redis::cmd("PING")
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| {
                error!(error = %e, "Redis PING failed");
                CheckpointError::Connection(format!("Redis connection test failed: {e}"))
            })?;

        debug!("Redis checkpoint store initialized");
        Ok(Self { pool, config })
    }

    /// Returns the Redis key for a feed.
    #[must_use]
    pub fn key_for(feed_id: &str) -> String {
        format!("{KEY_PREFIX}:{feed_id}")
    }

    async fn connection(pool: &Pool) -> Result<Connection, RedisError> {
        pool.get().await.map_err(|e| {
            RedisError::from((
                redis::ErrorKind::IoError,
                "Failed to get connection from pool",
                e.to_string(),
            ))
        })
    }

    /// Executes a Redis operation, retrying transient errors with exponential backoff.
    async fn with_retry<F, T, Fut>(&self, operation: F) -> Result<T, CheckpointError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        let mut retries = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if Self::is_retryable(&e) && retries < self.config.max_retries => {
                    retries += 1;
                    let delay = Duration::from_millis(BASE_RETRY_DELAY_MS * 2_u64.pow(retries - 1));
                    warn!(
                        attempt = retries,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Redis operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(retries, error = %e, "Redis operation failed");
                    return Err(CheckpointError::Connection(format!(
                        "Redis operation failed: {e}"
                    )));
                }
            }
        }
    }

    fn is_retryable(error: &RedisError) -> bool {
        error.is_io_error() || error.is_timeout() || error.is_connection_dropped()
    }

    fn encode(position: &ResumePosition) -> Result<Vec<u8>, CheckpointError> {
        bson::to_vec(position).map_err(|e| {
            CheckpointError::Serialization(format!("Failed to encode position: {e}"))
        })
    }

    fn decode(bytes: &[u8]) -> Result<ResumePosition, CheckpointError> {
        bson::from_slice(bytes).map_err(|e| {
            CheckpointError::Serialization(format!("Failed to decode position: {e}"))
        })
    }
}

#[async_trait]
impl CheckpointStore for RedisStore {
    async fn get(&self, feed_id: &str) -> Result<Option<ResumePosition>, CheckpointError> {
        let key = Self::key_for(feed_id);
        let pool = &self.pool;

        let bytes: Option<Vec<u8>> = self
            .with_retry(|| async {
                let mut conn = Self::connection(pool).await?;
                conn.get(&key).await
            })
            .await?;

        match bytes {
            Some(data) => {
                let position = Self::decode(&data)?;
                debug!(feed_id, key = %key, "Loaded position from Redis");
                Ok(Some(position))
            }
            None => {
                debug!(feed_id, key = %key, "No position stored in Redis");
                Ok(None)
            }
        }
    }

    async fn set(&self, feed_id: &str, token: &ResumeToken) -> Result<(), CheckpointError> {
        let key = Self::key_for(feed_id);
        let value = Self::encode(&ResumePosition::new(feed_id, token.clone(), Utc::now()))?;
        let pool = &self.pool;
        let ttl = self.config.ttl;

        self.with_retry::<_, (), _>(|| async {
            let mut conn = Self::connection(pool).await?;
            match ttl {
                Some(ttl) => conn.set_ex(&key, &value, ttl.as_secs()).await,
                None => conn.set(&key, &value).await,
            }
        })
        .await?;

        debug!(feed_id, token = %token.fingerprint(), "Saved position to Redis");
        Ok(())
    }

    async fn delete(&self, feed_id: &str) -> Result<(), CheckpointError> {
        let key = Self::key_for(feed_id);
        let pool = &self.pool;

        let removed: u64 = self
            .with_retry(|| async {
                let mut conn = Self::connection(pool).await?;
                conn.del(&key).await
            })
            .await?;

        if removed == 0 {
            warn!(feed_id, "Attempted to delete non-existent position");
        } else {
            debug!(feed_id, "Deleted position from Redis");
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ResumePosition>, CheckpointError> {
        let pattern = format!("{KEY_PREFIX}:*");
        let pool = &self.pool;

        let keys: Vec<String> = self
            .with_retry(|| async {
                let mut conn = Self::connection(pool).await?;
                redis::cmd("KEYS").arg(&pattern).query_async(&mut *conn).await
            })
            .await?;

        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<Vec<u8>>> = self
            .with_retry(|| async {
                let mut conn = Self::connection(pool).await?;
                redis::cmd("MGET").arg(&keys).query_async(&mut *conn).await
            })
            .await?;

        // Keys can expire between KEYS and MGET.
        let mut positions = values
            .into_iter()
            .flatten()
            .map(|bytes| Self::decode(&bytes))
            .collect::<Result<Vec<_>, _>>()?;
        positions.sort_by(|a, b| a.feed_id.cmp(&b.feed_id));

        debug!(count = positions.len(), "Listed positions from Redis");
        Ok(positions)
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        self.pool.close();
        debug!("Redis checkpoint store closed");
        Ok(())
    }
}
