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

//! Change handlers for ladle.
//!
//! Handlers plug into a [`ChangeFeedProcessor`](ladle_core::processor::ChangeFeedProcessor)
//! and receive every business change, in feed order.
//!
//! # Available Handlers
//!
//! - **Redis stream** (`redis-stream` feature, default): outbox-style
//!   publisher that appends each change to a Redis stream with a
//!   de-duplication key, so replays after a restart are not published twice.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ladle_handlers::redis_stream::{RedisStreamConfig, RedisStreamPublisher};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisStreamConfig::builder()
//!     .url("redis://localhost:6379")
//!     .stream("kitchen.changes")
//!     .group_key_field("recipeId")
//!     .build()?;
//!
//! let publisher = RedisStreamPublisher::new(config).await?;
//! // processor.register_handler(publisher)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

#[cfg(feature = "redis-stream")]
pub mod redis_stream;
