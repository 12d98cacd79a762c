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

//! Outbox-style publishing of changes to a Redis stream.
//!
//! Every accepted change becomes one stream entry:
//!
//! | Field | Content |
//! |---|---|
//! | `dedup_id` | fingerprint of the change's resume token |
//! | `group_key` | configured business key, else the document id |
//! | `payload` | JSON: operation, namespace, document id, full document, update description, cluster time |
//!
//! The processor delivers at least once, so a change can be offered again
//! after a restart. Before appending, the publisher claims
//! `ladle:dedup:{dedup_id}` with `SET NX EX`; if the key already exists the
//! change is skipped. Both steps run in one Lua script.
//!
//! # Example
//!
//! ```rust,ignore
//! use ladle_handlers::redis_stream::{RedisStreamConfig, RedisStreamPublisher};
//!
//! let config = RedisStreamConfig::builder()
//!     .url("redis://localhost:6379")
//!     .stream("kitchen.changes")
//!     .collections(["recipes", "menus"])
//!     .build()?;
//!
//! processor.register_handler(RedisStreamPublisher::new(config).await?)?;
//! ```

mod config;
mod message;
mod publisher;

pub use config::{RedisStreamConfig, RedisStreamConfigBuilder, DEFAULT_DEDUP_TTL};
pub use message::{OutboundMessage, Payload};
pub use publisher::{PublishOutcome, RedisStreamPublisher, DEDUP_KEY_PREFIX};
