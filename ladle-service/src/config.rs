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

//! Environment-driven service configuration.

use ladle_core::checkpoint::DEFAULT_CHECKPOINT_COLLECTION;
use ladle_core::heartbeat::{DEFAULT_HEARTBEAT_COLLECTION, DEFAULT_HEARTBEAT_INTERVAL};
use ladle_core::processor::{ProcessorConfig, ProcessorError};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Errors raised while reading the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required variable is not set
    #[error("{0} must be set")]
    Missing(&'static str),

    /// A variable is set to a value that cannot be used
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Where resume positions are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointBackend {
    /// A collection in the watched database
    #[default]
    Mongo,
    /// A Redis key per feed
    Redis,
    /// Process memory; positions are lost on exit
    Memory,
}

impl FromStr for CheckpointBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(Self::Mongo),
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown backend '{other}', expected mongo, redis or memory")),
        }
    }
}

impl fmt::Display for CheckpointBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mongo => "mongo",
            Self::Redis => "redis",
            Self::Memory => "memory",
        })
    }
}

/// Publisher settings, present when `LADLE_PUBLISH_STREAM` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishSettings {
    /// Stream key
    pub stream: String,
    /// Collections to publish; empty publishes everything
    pub collections: Vec<String>,
    /// Business key field for grouping
    pub group_key_field: Option<String>,
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// `MONGODB_URI`
    pub mongodb_uri: String,
    /// `LADLE_FEED_ID`: the watched database, also the checkpoint key
    pub feed_id: String,
    /// `LADLE_HEARTBEAT_INTERVAL_SECS`
    pub heartbeat_interval: Duration,
    /// `LADLE_HEARTBEAT_COLLECTION`
    pub heartbeat_collection: String,
    /// `LADLE_CHECKPOINT_COLLECTION`
    pub checkpoint_collection: String,
    /// `LADLE_IGNORE_COLLECTIONS`
    pub ignore_collections: Vec<String>,
    /// `LADLE_CHECKPOINT_BACKEND`
    pub checkpoint_backend: CheckpointBackend,
    /// `REDIS_URL`
    pub redis_url: Option<String>,
    /// `LADLE_PUBLISH_STREAM`, `LADLE_PUBLISH_COLLECTIONS`, `LADLE_GROUP_KEY_FIELD`
    pub publish: Option<PublishSettings>,
    /// `LADLE_METRICS_ADDR`
    pub metrics_addr: Option<SocketAddr>,
}

impl ServiceConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first missing or invalid variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name
    /// to its value.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first missing or invalid variable.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mongodb_uri = get("MONGODB_URI").ok_or(ConfigError::Missing("MONGODB_URI"))?;
        let feed_id = get("LADLE_FEED_ID").ok_or(ConfigError::Missing("LADLE_FEED_ID"))?;

        let heartbeat_interval = match get("LADLE_HEARTBEAT_INTERVAL_SECS") {
            Some(raw) => {
                let secs: u64 = raw.parse().map_err(|e| ConfigError::Invalid {
                    var: "LADLE_HEARTBEAT_INTERVAL_SECS",
                    value: raw.clone(),
                    reason: format!("{e}"),
                })?;
                if secs == 0 {
                    return Err(ConfigError::Invalid {
                        var: "LADLE_HEARTBEAT_INTERVAL_SECS",
                        value: raw,
                        reason: "must be greater than zero".to_string(),
                    });
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_HEARTBEAT_INTERVAL,
        };

        let checkpoint_backend = match get("LADLE_CHECKPOINT_BACKEND") {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                var: "LADLE_CHECKPOINT_BACKEND",
                value: raw.clone(),
                reason,
            })?,
            None => CheckpointBackend::default(),
        };

        let redis_url = get("REDIS_URL");

        let publish = get("LADLE_PUBLISH_STREAM").map(|stream| PublishSettings {
            stream,
            collections: get("LADLE_PUBLISH_COLLECTIONS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            group_key_field: get("LADLE_GROUP_KEY_FIELD"),
        });

        if redis_url.is_none() && (checkpoint_backend == CheckpointBackend::Redis || publish.is_some()) {
            return Err(ConfigError::Missing("REDIS_URL"));
        }

        let metrics_addr: Option<SocketAddr> = match get("LADLE_METRICS_ADDR") {
            Some(raw) => Some(raw.parse().map_err(|e| ConfigError::Invalid {
                var: "LADLE_METRICS_ADDR",
                value: raw.clone(),
                reason: format!("{e}"),
            })?),
            None => None,
        };

        Ok(Self {
            mongodb_uri,
            feed_id,
            heartbeat_interval,
            heartbeat_collection: get("LADLE_HEARTBEAT_COLLECTION")
                .unwrap_or_else(|| DEFAULT_HEARTBEAT_COLLECTION.to_string()),
            checkpoint_collection: get("LADLE_CHECKPOINT_COLLECTION")
                .unwrap_or_else(|| DEFAULT_CHECKPOINT_COLLECTION.to_string()),
            ignore_collections: get("LADLE_IGNORE_COLLECTIONS")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            checkpoint_backend,
            redis_url,
            publish,
            metrics_addr,
        })
    }

    /// Builds the processor configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Configuration`] if the values are inconsistent,
    /// e.g. the heartbeat collection is also ignored.
    pub fn processor_config(&self) -> Result<ProcessorConfig, ProcessorError> {
        ProcessorConfig::builder()
            .feed_id(&self.feed_id)
            .heartbeat_interval(self.heartbeat_interval)
            .heartbeat_collection(&self.heartbeat_collection)
            .checkpoint_collection(&self.checkpoint_collection)
            .ignore_collections(self.ignore_collections.iter().cloned())
            .build()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
