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

//! Ladle Core - resumable change-feed processing
//!
//! This crate tails a database change feed, hands every change to a set of
//! independently failing handlers and durably records how far it got, so a
//! restarted process continues exactly where the previous one stopped.
//!
//! # Key Components
//!
//! - **Events**: [`event`] defines changes and opaque resume tokens
//! - **Feeds**: [`feed`] (trait and in-memory feed), [`stream`] (`MongoDB`)
//! - **Checkpoints**: [`checkpoint`] defines the position store contract
//! - **Handlers**: [`handler`] defines handlers and ordered dispatch
//! - **Heartbeats**: [`heartbeat`] keeps an idle feed's position fresh
//! - **Processor**: [`processor`] drives the whole loop
//! - **Metrics**: [`metrics`] records counters, histograms and gauges
//!
//! # Example
//!
//! ```rust
//! use ladle_core::event::{ChangeEvent, OperationType};
//!
//! fn describe(event: &ChangeEvent) -> &'static str {
//!     match event.operation {
//!         OperationType::Insert => "created",
//!         OperationType::Update | OperationType::Replace => "changed",
//!         OperationType::Delete => "removed",
//!         _ => "other",
//!     }
//! }
//! ```

pub mod checkpoint;
pub mod event;
pub mod feed;
pub mod handler;
pub mod heartbeat;
pub mod metrics;
pub mod processor;
pub mod stream;
