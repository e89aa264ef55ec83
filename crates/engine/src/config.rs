// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Timing and capacity configuration for a pipeline.
//!
//! The configuration is injected at construction time; the engine never
//! mutates process-global state. All durations deserialize from humantime
//! strings (`"50ms"`, `"1s"`), and every field has a default matching the
//! engine's nominal polling contract: no blocking operation waits longer
//! than one second between checks of the shutdown latch.

use serde::Deserialize;
use std::time::Duration;

/// Intermediate queues hold a single element. A fast upstream stage blocks on
/// a slow downstream stage after one buffered element per worker, which keeps
/// the amount of in-flight memory minimal for large payloads at the cost of
/// per-element synchronisation.
const DEFAULT_QUEUE_CAPACITY: usize = 1;

const DEFAULT_GET_TIMEOUT: Duration = Duration::from_millis(50);
const DEFAULT_PUT_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_ERROR_POLL_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(4);

/// Tuning knobs of a pipeline instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of every intermediate queue. The queue fed by the input
    /// driver is always unbounded.
    pub queue_capacity: usize,

    /// How long a worker blocks on a queue get before re-checking the
    /// shutdown latch.
    #[serde(with = "humantime_serde")]
    pub get_timeout: Duration,

    /// How long a worker blocks on a queue put before re-checking the
    /// shutdown latch.
    #[serde(with = "humantime_serde")]
    pub put_timeout: Duration,

    /// Sampling period of the status monitor.
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,

    /// Poll timeout of the error-drain worker.
    #[serde(with = "humantime_serde")]
    pub error_poll_timeout: Duration,

    /// Per-worker join deadline during `stop`.
    #[serde(with = "humantime_serde")]
    pub join_timeout: Duration,

    /// Grace period observed after joining, before leftover workers are
    /// reported at error level.
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            get_timeout: DEFAULT_GET_TIMEOUT,
            put_timeout: DEFAULT_PUT_TIMEOUT,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            error_poll_timeout: DEFAULT_ERROR_POLL_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}
