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

//! Redis stream publisher implementation.

use super::config::RedisStreamConfig;
use super::message::OutboundMessage;
use async_trait::async_trait;
use deadpool_redis::{Config as ConnectionConfig, Pool, PoolConfig, Runtime};
use ladle_core::event::ChangeEvent;
use ladle_core::handler::{ChangeHandler, HandlerError};
use redis::{RedisError, Script};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, instrument};

/// Prefix of the de-duplication keys.
pub const DEDUP_KEY_PREFIX: &str = "ladle:dedup";

/// Claims the de-duplication key and appends the entry in one step.
///
/// KEYS: dedup key, stream. ARGV: ttl seconds, dedup id, group key, payload,
/// max length (0 for unbounded). Returns the entry id, or nil for a duplicate.
/// A failed append releases the claim before the error is raised.
const PUBLISH_SCRIPT: &str = r"
if not redis.call('SET', KEYS[1], '1', 'NX', 'EX', ARGV[1]) then
    return false
end
local entry
if ARGV[5] ~= '0' then
    entry = redis.pcall('XADD', KEYS[2], 'MAXLEN', '~', ARGV[5], '*',
        'dedup_id', ARGV[2], 'group_key', ARGV[3], 'payload', ARGV[4])
else
    entry = redis.pcall('XADD', KEYS[2], '*',
        'dedup_id', ARGV[2], 'group_key', ARGV[3], 'payload', ARGV[4])
end
if type(entry) == 'table' and entry.err then
    redis.call('DEL', KEYS[1])
    return redis.error_reply(entry.err)
end
return entry
";

/// Result of offering one change to the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The entry was appended under this stream id.
    Appended(String),
    /// The change was published before, inside the de-duplication window.
    Duplicate,
}

/// Outbox-style handler appending each change to a Redis stream.
///
/// Each entry carries `dedup_id`, `group_key` and a JSON `payload`
/// (see [`OutboundMessage`]). The de-duplication key is claimed with
/// `SET NX EX` in the same script that runs `XADD`, so a change replayed
/// after a restart is appended at most once per window.
///
/// # Example
///
/// ```rust,no_run
/// use ladle_handlers::redis_stream::{RedisStreamConfig, RedisStreamPublisher};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RedisStreamConfig::builder()
///     .url("redis://localhost:6379")
///     .stream("kitchen.changes")
///     .build()?;
///
/// let publisher = RedisStreamPublisher::new(config).await?;
/// println!("published so far: {}", publisher.published_count());
/// # Ok(())
/// # }
/// ```
pub struct RedisStreamPublisher {
    pool: Pool,
    config: RedisStreamConfig,
    script: Script,
    name: String,
    published: AtomicU64,
    duplicates: AtomicU64,
}

impl std::fmt::Debug for RedisStreamPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamPublisher")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStreamPublisher {
    /// Connects to Redis and verifies the connection with `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Connection`] if the pool cannot be created or
    /// the server does not answer.
    pub async fn new(config: RedisStreamConfig) -> Result<Self, HandlerError> {
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
                HandlerError::connection(e)
            })?;

        let mut conn = pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get connection from pool");
            HandlerError::connection(e)
        })?;
        redis::cmd("PING")
            .query_async::<()>(&mut *conn)
            .await
            .map_err(HandlerError::connection)?;

        info!(stream = %config.stream, "Redis stream publisher connected");

        Ok(Self {
            pool,
            name: format!("redis-stream:{}", config.stream),
            config,
            script: Script::new(PUBLISH_SCRIPT),
            published: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        })
    }

    /// Returns the publisher configuration.
    #[must_use]
    pub fn config(&self) -> &RedisStreamConfig {
        &self.config
    }

    /// Number of entries appended by this publisher.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Number of changes skipped as duplicates.
    #[must_use]
    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Returns the de-duplication key for a change id.
    #[must_use]
    pub fn dedup_key(dedup_id: &str) -> String {
        format!("{DEDUP_KEY_PREFIX}:{dedup_id}")
    }

    /// Appends `event` to the stream unless it was published recently.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the entry cannot be built, and a
    /// publish or connection error if Redis rejects the script.
    pub async fn publish(&self, event: &ChangeEvent) -> Result<PublishOutcome, HandlerError> {
        let message = OutboundMessage::from_event(event, self.config.group_key_field.as_deref())?;

        let mut conn = self.pool.get().await.map_err(HandlerError::connection)?;

        let entry_id: Option<String> = self
            .script
            .key(Self::dedup_key(&message.dedup_id))
            .key(&self.config.stream)
            .arg(self.config.dedup_ttl.as_secs())
            .arg(&message.dedup_id)
            .arg(&message.group_key)
            .arg(&message.payload)
            .arg(self.config.max_len.unwrap_or(0))
            .invoke_async(&mut *conn)
            .await
            .map_err(publish_error)?;

        Ok(match entry_id {
            Some(id) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                PublishOutcome::Appended(id)
            }
            None => {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                PublishOutcome::Duplicate
            }
        })
    }
}

fn publish_error(e: RedisError) -> HandlerError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        HandlerError::connection(e)
    } else {
        HandlerError::publish_msg(format!("Redis rejected stream entry: {e}"), e.is_timeout())
    }
}

#[async_trait]
impl ChangeHandler for RedisStreamPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, event: &ChangeEvent) -> bool {
        self.config.publishes(event.collection_name())
    }

    #[instrument(skip(self, event), fields(stream = %self.config.stream, collection = %event.collection_name()))]
    async fn handle(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        match self.publish(event).await? {
            PublishOutcome::Appended(id) => {
                debug!(entry_id = %id, operation = %event.operation, "Published change");
            }
            PublishOutcome::Duplicate => {
                debug!(
                    dedup_id = %event.resume_token.fingerprint(),
                    "Change already published, skipping"
                );
            }
        }
        Ok(())
    }
}
