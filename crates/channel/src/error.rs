// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the stage-to-stage queues.
//!
//! Timed-out operations are reported as [`SendError::Full`] and
//! [`RecvError::Empty`]. Both are expected under backpressure; callers retry
//! them inside a shutdown-aware loop rather than treating them as fatal.

/// Errors that can occur putting an element onto a queue.
#[derive(thiserror::Error, Debug)]
pub enum SendError<T> {
    /// The queue stayed full for the whole timeout and the element could not
    /// be enqueued.
    #[error("Queue is full and the element could not be enqueued")]
    Full(T),

    /// The queue is closed and the element could not be enqueued.
    #[error("Queue is closed and the element could not be enqueued")]
    Closed(T),
}

impl<T> SendError<T> {
    /// Returns the element that could not be enqueued, whichever way the
    /// operation failed.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(v) => v,
            Self::Closed(v) => v,
        }
    }
}

/// Errors that can occur taking an element from a queue.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    /// The queue stayed empty for the whole timeout.
    #[error("The queue is empty")]
    Empty,

    /// The queue is closed and fully drained.
    #[error("The queue is closed")]
    Closed,
}
