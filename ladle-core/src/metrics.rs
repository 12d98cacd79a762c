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

//! Metrics instrumentation for change-feed processing.
//!
//! Recording goes through the `metrics` facade, so any installed recorder
//! (Prometheus, `StatsD`, ...) picks the values up. Without a recorder every
//! call is a no-op.
//!
//! # Naming Conventions
//!
//! - Prefix with `ladle_`
//! - Counters end with `_total`
//! - Durations are in seconds and end with `_seconds`
//!
//! Labels are restricted to low-cardinality values: collection, operation and
//! handler names. Never label with document ids or tokens.
//!
//! # Examples
//!
//! ```rust
//! use ladle_core::metrics::{self, ProcessorStatus};
//!
//! metrics::init_metrics();
//! metrics::increment_events_dispatched("recipes", "insert");
//! metrics::set_processor_status(ProcessorStatus::Running);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric name prefix for all Ladle metrics.
#[doc(hidden)]
pub const METRIC_PREFIX: &str = "ladle";

// ============================================================================
// Metric Name Constants
// ============================================================================

/// Changes read from the feed, before filtering.
///
/// Type: Counter
#[doc(hidden)]
pub const EVENTS_RECEIVED_TOTAL: &str = "ladle_events_received_total";

/// Changes dropped by the self-noise filter.
///
/// Type: Counter
/// Labels: collection
#[doc(hidden)]
pub const EVENTS_IGNORED_TOTAL: &str = "ladle_events_ignored_total";

/// Changes that completed a dispatch cycle.
///
/// Type: Counter
/// Labels: collection, operation
#[doc(hidden)]
pub const EVENTS_DISPATCHED_TOTAL: &str = "ladle_events_dispatched_total";

/// Handler invocations that returned an error or panicked.
///
/// Type: Counter
/// Labels: handler
#[doc(hidden)]
pub const HANDLER_FAILURES_TOTAL: &str = "ladle_handler_failures_total";

/// Checkpoint writes acknowledged by the store.
///
/// Type: Counter
#[doc(hidden)]
pub const CHECKPOINTS_WRITTEN_TOTAL: &str = "ladle_checkpoints_written_total";

/// Checkpoint writes that failed.
///
/// Type: Counter
#[doc(hidden)]
pub const CHECKPOINT_FAILURES_TOTAL: &str = "ladle_checkpoint_failures_total";

/// Heartbeat records written.
///
/// Type: Counter
#[doc(hidden)]
pub const HEARTBEATS_WRITTEN_TOTAL: &str = "ladle_heartbeats_written_total";

/// Heartbeat writes that failed.
///
/// Type: Counter
#[doc(hidden)]
pub const HEARTBEAT_FAILURES_TOTAL: &str = "ladle_heartbeat_failures_total";

/// Time spent offering one change to every handler.
///
/// Type: Histogram
/// Labels: collection
/// Unit: seconds
#[doc(hidden)]
pub const DISPATCH_DURATION_SECONDS: &str = "ladle_dispatch_duration_seconds";

/// Time spent writing one checkpoint.
///
/// Type: Histogram
/// Unit: seconds
#[doc(hidden)]
pub const CHECKPOINT_WRITE_DURATION_SECONDS: &str = "ladle_checkpoint_write_duration_seconds";

/// Current processor status (see [`ProcessorStatus`]).
///
/// Type: Gauge
#[doc(hidden)]
pub const PROCESSOR_STATUS: &str = "ladle_processor_status";

/// Registers descriptions for every metric.
///
/// Call once after installing a recorder.
pub fn init_metrics() {
    describe_counter!(
        EVENTS_RECEIVED_TOTAL,
        "Total number of changes read from the feed"
    );
    describe_counter!(
        EVENTS_IGNORED_TOTAL,
        "Total number of changes dropped by the self-noise filter"
    );
    describe_counter!(
        EVENTS_DISPATCHED_TOTAL,
        "Total number of changes offered to every handler"
    );
    describe_counter!(
        HANDLER_FAILURES_TOTAL,
        "Total number of handler invocations that failed or panicked"
    );
    describe_counter!(
        CHECKPOINTS_WRITTEN_TOTAL,
        "Total number of acknowledged checkpoint writes"
    );
    describe_counter!(
        CHECKPOINT_FAILURES_TOTAL,
        "Total number of failed checkpoint writes"
    );
    describe_counter!(
        HEARTBEATS_WRITTEN_TOTAL,
        "Total number of heartbeat records written"
    );
    describe_counter!(
        HEARTBEAT_FAILURES_TOTAL,
        "Total number of failed heartbeat writes"
    );

    describe_histogram!(
        DISPATCH_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time taken to offer one change to every handler"
    );
    describe_histogram!(
        CHECKPOINT_WRITE_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time taken to persist one checkpoint"
    );

    describe_gauge!(
        PROCESSOR_STATUS,
        "Current processor status: 0=stopped, 1=running, 2=errored"
    );
}

/// Increments the count of changes read from the feed.
pub fn increment_events_received() {
    counter!(EVENTS_RECEIVED_TOTAL).increment(1);
}

/// Increments the count of changes dropped by the noise filter.
pub fn increment_events_ignored(collection: &str) {
    counter!(EVENTS_IGNORED_TOTAL, "collection" => collection.to_string()).increment(1);
}

/// Increments the count of dispatched changes.
pub fn increment_events_dispatched(collection: &str, operation: &str) {
    counter!(
        EVENTS_DISPATCHED_TOTAL,
        "collection" => collection.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Increments the failure count of one handler.
pub fn increment_handler_failures(handler: &str) {
    counter!(HANDLER_FAILURES_TOTAL, "handler" => handler.to_string()).increment(1);
}

/// Increments the count of acknowledged checkpoint writes.
pub fn increment_checkpoints_written() {
    counter!(CHECKPOINTS_WRITTEN_TOTAL).increment(1);
}

/// Increments the count of failed checkpoint writes.
pub fn increment_checkpoint_failures() {
    counter!(CHECKPOINT_FAILURES_TOTAL).increment(1);
}

/// Increments the count of heartbeat writes.
pub fn increment_heartbeats_written() {
    counter!(HEARTBEATS_WRITTEN_TOTAL).increment(1);
}

/// Increments the count of failed heartbeat writes.
pub fn increment_heartbeat_failures() {
    counter!(HEARTBEAT_FAILURES_TOTAL).increment(1);
}

/// Records how long one dispatch cycle took.
pub fn record_dispatch_duration(duration: Duration, collection: &str) {
    histogram!(DISPATCH_DURATION_SECONDS, "collection" => collection.to_string())
        .record(duration.as_secs_f64());
}

/// Records how long one checkpoint write took.
pub fn record_checkpoint_write_duration(duration: Duration) {
    histogram!(CHECKPOINT_WRITE_DURATION_SECONDS).record(duration.as_secs_f64());
}

/// Sets the processor status gauge.
pub fn set_processor_status(status: ProcessorStatus) {
    gauge!(PROCESSOR_STATUS).set(f64::from(status as u8));
}

/// Processor status for the `processor_status` gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorStatus {
    /// Not consuming.
    Stopped = 0,
    /// Consuming the feed.
    Running = 1,
    /// Stopped on a fatal error.
    Errored = 2,
}

/// Records the elapsed time when dropped.
///
/// # Examples
///
/// ```rust
/// use ladle_core::metrics::{self, Timer};
///
/// {
///     let _timer = Timer::new("recipes", |duration, collection| {
///         metrics::record_dispatch_duration(duration, collection);
///     });
///     // ... dispatch ...
/// }
/// ```
pub struct Timer<F>
where
    F: FnOnce(Duration, &str),
{
    start: std::time::Instant,
    label: String,
    record_fn: Option<F>,
}

impl<F> Timer<F>
where
    F: FnOnce(Duration, &str),
{
    /// Creates a new timer that will record the duration when dropped.
    pub fn new(label: impl Into<String>, record_fn: F) -> Self {
        Self {
            start: std::time::Instant::now(),
            label: label.into(),
            record_fn: Some(record_fn),
        }
    }
}

impl<F> Drop for Timer<F>
where
    F: FnOnce(Duration, &str),
{
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        if let Some(record_fn) = self.record_fn.take() {
            record_fn(duration, &self.label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_values() {
        assert_eq!(ProcessorStatus::Stopped as u8, 0);
        assert_eq!(ProcessorStatus::Running as u8, 1);
        assert_eq!(ProcessorStatus::Errored as u8, 2);
    }

    #[test]
    fn timer_records_on_drop() {
        let mut recorded = None;
        {
            let _timer = Timer::new("recipes", |duration, label| {
                recorded = Some((duration, label.to_string()));
            });
        }
        let (_, label) = recorded.unwrap();
        assert_eq!(label, "recipes");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        increment_events_received();
        increment_events_ignored("resume_tokens");
        record_dispatch_duration(Duration::from_millis(3), "recipes");
        set_processor_status(ProcessorStatus::Stopped);
    }
}
