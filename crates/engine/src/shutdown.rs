// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The broadcast shutdown latch observed by every worker.
//!
//! One latch is shared by reference across all workers of a pipeline. It is
//! set once (by [`Pipeline::stop`](crate::pipeline::Pipeline::stop), by the
//! error-drain worker on the first failure report, or by an external signal
//! handler) and never cleared. Every blocking operation in the engine has a
//! timeout of at most one second, so a set latch is observed by every worker
//! within one polling interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cloneable handle to a set-once shutdown latch.
#[derive(Debug, Clone, Default)]
pub struct ShutdownEvent {
    flag: Arc<AtomicBool>,
}

impl ShutdownEvent {
    /// Creates a new, unset latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the latch. Idempotent.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once the latch has been set by any handle.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
