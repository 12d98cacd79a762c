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

//! Checkpoint store backends for ladle.
//!
//! Each backend implements [`CheckpointStore`](ladle_core::checkpoint::CheckpointStore),
//! persisting one resume position per feed id.
//!
//! # Available Stores
//!
//! - [`memory::MemoryStore`]: process-local, for tests and demos
//! - **`MongoDB`** (`mongo-store` feature): a collection in the watched database
//! - **Redis** (`redis-store` feature): one key per feed, optional TTL
//!
//! # Example: `MongoDB` Store
//!
//! ```rust,ignore
//! use ladle_stores::mongo::MongoCheckpointStore;
//! use ladle_core::checkpoint::CheckpointStore;
//!
//! # async fn example(database: mongodb::Database) -> Result<(), Box<dyn std::error::Error>> {
//! let store = MongoCheckpointStore::new(&database);
//! assert_eq!(store.backing_collection(), Some("resume_tokens"));
//!
//! let position = store.get("kitchen").await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod memory;

#[cfg(feature = "mongo-store")]
pub mod mongo;

#[cfg(feature = "redis-store")]
pub mod redis;
