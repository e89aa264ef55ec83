// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the pipeline engine.
//!
//! Worker-side failures never propagate locally: the failing worker packages
//! a [`FailureReport`] onto the error queue and exits, and the error-drain
//! worker turns the first report into a pipeline-wide shutdown plus a
//! [`Error::WorkerFailed`] surfaced to the caller. The remaining variants
//! are synchronous lifecycle misuse, reported directly to the caller.

use std::fmt;

/// Boxed error type returned by user-supplied worker functions.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Maximum number of characters of the stringified offending item kept in a
/// failure report.
const ITEM_SUMMARY_LIMIT: usize = 400;

/// Record describing a worker failure, drained by the error-drain worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    /// Name of the worker that failed, e.g. `double-3`.
    pub worker: String,

    /// Stringified rendering of the input the worker was processing,
    /// truncated to a few hundred characters.
    pub item_summary: String,

    /// Message of the error (or panic) raised by the worker function.
    pub error: String,

    /// Captured backtrace of the failure site.
    pub backtrace: String,
}

impl FailureReport {
    /// Builds a report for `worker` failing on `item` with `error`.
    ///
    /// The item is rendered through its `Debug` implementation and truncated
    /// to [`ITEM_SUMMARY_LIMIT`] characters; the backtrace is captured here.
    pub fn new<I: fmt::Debug>(worker: &str, item: &I, error: String) -> Self {
        let rendered = format!("{item:?}");
        let item_summary = if rendered.chars().count() > ITEM_SUMMARY_LIMIT {
            rendered.chars().take(ITEM_SUMMARY_LIMIT).collect()
        } else {
            rendered
        };
        Self {
            worker: worker.to_owned(),
            item_summary,
            error,
            backtrace: std::backtrace::Backtrace::force_capture().to_string(),
        }
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker {} failed on element `{}`: {}",
            self.worker, self.item_summary, self.error
        )
    }
}

/// All errors surfaced to the caller of the pipeline API.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// `start` was called on a pipeline that is already running.
    #[error("The pipeline has already been started")]
    AlreadyStarted,

    /// The pipeline was iterated before `start`.
    #[error("The pipeline has not been started")]
    NotStarted,

    /// The pipeline was iterated without a queued iterable.
    #[error("No iterable queued: call queue_iterable first")]
    NoIterableQueued,

    /// `queue_iterable` was called while a previous iterable is still being
    /// consumed.
    #[error("An iterable is already queued and has not been fully consumed")]
    IterableAlreadyQueued,

    /// The pipeline has been shut down (by `stop`, a signal handler, or a
    /// worker failure) and no longer accepts work.
    #[error("The pipeline has been shut down")]
    ShutDown,

    /// A worker failed; the pipeline has been shut down and must be
    /// reconstructed.
    #[error("Fatal pipeline error: {report}")]
    WorkerFailed {
        /// The drained failure report.
        report: FailureReport,
    },

    /// An OS-level worker could not be spawned.
    #[error("Could not spawn worker `{worker}`: {source}")]
    WorkerSpawn {
        /// Name of the worker that failed to spawn.
        worker: String,
        /// The underlying spawn error.
        source: std::io::Error,
    },

    /// The logging subscriber could not be installed.
    #[error("Could not initialise logging: {message}")]
    TelemetryInit {
        /// Reason reported by the subscriber or the filesystem.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_summary_is_truncated() {
        let long = "x".repeat(2000);
        let report = FailureReport::new("worker-0", &long, "boom".into());
        // Two quotes from the Debug rendering count toward the limit.
        assert_eq!(report.item_summary.chars().count(), 400);
        assert_eq!(report.error, "boom");
        assert!(!report.backtrace.is_empty());
    }

    #[test]
    fn test_short_items_are_kept_verbatim() {
        let report = FailureReport::new("worker-0", &42_i64, "boom".into());
        assert_eq!(report.item_summary, "42");
    }
}
