// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Flow-status sampling and the periodic status monitor.
//!
//! The monitor is a background worker that wakes every few seconds, samples
//! queue saturations and per-stage alive-worker counts, and logs the
//! rendered table at info level whenever it differs from the previous
//! sample. The same snapshot is available on demand through
//! [`Pipeline::flowstatus`](crate::pipeline::Pipeline::flowstatus).

use crate::message::StreamMsg;
use crate::shutdown::ShutdownEvent;
use conveyor_channel::Queue;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tabled::{Table, Tabled};
use tracing::info;

/// How often a sleeping monitor re-checks the shutdown latch.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Live view into one stage, sampled by the monitor without touching the
/// stage itself. Handed out by [`Stage::probe`](crate::stage::Stage::probe).
#[derive(Debug, Clone)]
pub struct StageProbe {
    pub(crate) name: String,
    /// Number of workers currently running, maintained by the workers
    /// themselves.
    pub(crate) alive: Arc<AtomicUsize>,
    /// Multiplier applied to `alive` when reporting: a pool stage counts its
    /// single owner as the whole sub-pool.
    pub(crate) alive_factor: usize,
    pub(crate) configured: usize,
    pub(crate) worker_names: Vec<String>,
}

/// Cloneable view into every queue and stage of a pipeline.
pub(crate) struct FlowProbe<P> {
    pub(crate) queues: Vec<Queue<StreamMsg<P>>>,
    pub(crate) stages: Vec<StageProbe>,
}

impl<P> Clone for FlowProbe<P> {
    fn clone(&self) -> Self {
        Self {
            queues: self.queues.clone(),
            stages: self.stages.clone(),
        }
    }
}

impl<P> FlowProbe<P> {
    /// Takes a point-in-time snapshot of the whole flow.
    pub(crate) fn sample(&self) -> FlowStatus {
        FlowStatus {
            queues: self
                .queues
                .iter()
                .map(|q| QueueStatus {
                    depth: q.len(),
                    capacity: q.capacity(),
                })
                .collect(),
            stages: self
                .stages
                .iter()
                .map(|s| StageStatus {
                    name: s.name.clone(),
                    alive_workers: s.alive.load(Ordering::SeqCst) * s.alive_factor,
                    configured_workers: s.configured,
                    worker_names: s.worker_names.clone(),
                })
                .collect(),
        }
    }
}

/// Point-in-time state of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    /// Number of buffered elements.
    pub depth: usize,

    /// Capacity limit, or `None` for the unbounded input queue.
    pub capacity: Option<usize>,
}

/// Point-in-time state of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    /// Stage name, e.g. `Pack(8)`.
    pub name: String,

    /// Number of workers currently alive.
    pub alive_workers: usize,

    /// Number of workers the stage was configured with.
    pub configured_workers: usize,

    /// Names of the stage's workers.
    pub worker_names: Vec<String>,
}

/// Snapshot of every queue and stage, renderable as a table.
///
/// Queues and stages alternate along the pipeline, so a flow with `n` stages
/// has `n + 1` queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowStatus {
    /// Queue snapshots, upstream first.
    pub queues: Vec<QueueStatus>,

    /// Stage snapshots, upstream first.
    pub stages: Vec<StageStatus>,
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Type")]
    kind: &'static str,
    #[tabled(rename = "Saturation")]
    saturation: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Workers")]
    workers: String,
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut rows = Vec::with_capacity(self.queues.len() + self.stages.len());
        for (i, queue) in self.queues.iter().enumerate() {
            let capacity = queue
                .capacity
                .map_or_else(|| "inf".to_owned(), |c| c.to_string());
            rows.push(StatusRow {
                kind: "Queue",
                saturation: format!("{}/{capacity}", queue.depth),
                name: String::new(),
                workers: String::new(),
            });
            if let Some(stage) = self.stages.get(i) {
                rows.push(StatusRow {
                    kind: "Stage",
                    saturation: format!("{}/{}", stage.alive_workers, stage.configured_workers),
                    name: stage.name.clone(),
                    workers: stage.worker_names.join(","),
                });
            }
        }
        write!(f, "{}", Table::new(rows))
    }
}

/// Body of the status-monitor worker: sample, log on change, sleep, until
/// the shutdown latch is set.
pub(crate) fn run_monitor<P>(probe: &FlowProbe<P>, shutdown: &ShutdownEvent, interval: Duration) {
    let mut last_rendered = String::new();
    while !shutdown.is_set() {
        let rendered = probe.sample().to_string();
        if rendered != last_rendered {
            info!("flow status\n{rendered}");
            last_rendered = rendered;
        }
        let deadline = Instant::now() + interval;
        while Instant::now() < deadline {
            if shutdown.is_set() {
                return;
            }
            std::thread::sleep(SLEEP_SLICE);
        }
    }
}
