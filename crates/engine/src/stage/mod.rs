// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Stages and the worker machinery they share.
//!
//! A stage owns one or more OS-thread workers that all run the same loop:
//! pull an element from the upstream queue, transform it, push the result
//! downstream. Stages never share memory with each other beyond the queues;
//! worker-local state (counters, accumulation buffers) is owned by the
//! worker thread and never read from outside.
//!
//! Every blocking operation in a worker is a timed queue get/put that
//! re-checks the shutdown latch between timeouts, so no worker blocks for
//! more than the configured put timeout (one second by default) without
//! observing a shutdown request.
//!
//! # Stage kinds
//!
//! - [`MapStage`](map::MapStage): 1:1 transformation, N parallel workers.
//! - [`PoolStage`](pool::PoolStage): fans one batch out over a thread
//!   sub-pool, emits the collected result.
//! - [`PackStage`](pack::PackStage): collects `k` items into a batch.
//! - [`UnpackStage`](pack::UnpackStage): explodes a batch into items.
//! - [`RepackStage`](pack::RepackStage): rebatches across batch boundaries.

pub mod map;
pub mod pack;
pub mod pool;

use crate::error::{BoxedError, Error, FailureReport};
use crate::message::StreamMsg;
use crate::monitor::StageProbe;
use crate::shutdown::ShutdownEvent;
use conveyor_channel::Queue;
use conveyor_channel::error::{RecvError, SendError};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// How often a join loop re-checks whether a worker has finished.
const JOIN_POLL: Duration = Duration::from_millis(50);

/// User-supplied per-item transformation.
pub(crate) type WorkFn<P> = Arc<dyn Fn(P) -> Result<P, BoxedError> + Send + Sync>;

/// Queue wiring handed to a stage by the pipeline.
///
/// Created by the pipeline during construction; stage `i`'s output queue is
/// stage `i + 1`'s input queue by structural identity, not by copy.
pub struct StageWiring<P> {
    pub(crate) inq: Queue<StreamMsg<P>>,
    pub(crate) outq: Queue<StreamMsg<P>>,
    pub(crate) errq: Queue<FailureReport>,
    pub(crate) shutdown: ShutdownEvent,
    pub(crate) get_timeout: Duration,
    pub(crate) put_timeout: Duration,
}

impl<P> Clone for StageWiring<P> {
    fn clone(&self) -> Self {
        Self {
            inq: self.inq.clone(),
            outq: self.outq.clone(),
            errq: self.errq.clone(),
            shutdown: self.shutdown.clone(),
            get_timeout: self.get_timeout,
            put_timeout: self.put_timeout,
        }
    }
}

/// A pipeline stage: a named group of workers between two queues.
///
/// Implemented by the built-in stage kinds; the pipeline drives the
/// lifecycle: `connect` during construction, `start` when the pipeline
/// starts, `stop` during shutdown.
pub trait Stage<P>: Send {
    /// Stage name used in logs and the status table.
    fn name(&self) -> &str;

    /// Number of workers the stage is configured with.
    fn worker_count(&self) -> usize;

    /// Whether `stop` may abandon workers of this stage that miss the join
    /// deadline. Stages owning a sub-pool return `false` and are joined to
    /// completion so the sub-pool is released.
    fn daemon(&self) -> bool {
        true
    }

    /// Stores the queue wiring. Called exactly once by the pipeline.
    fn connect(&mut self, wiring: StageWiring<P>);

    /// Ids of the connected input and output queues, used to verify the
    /// structural identity of the wiring.
    fn wiring_ids(&self) -> Option<(u64, u64)>;

    /// Spawns the stage workers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerSpawn`] if an OS thread could not be created.
    fn start(&mut self) -> Result<(), Error>;

    /// Live status view for the monitor.
    fn probe(&self) -> StageProbe;

    /// Joins the workers, waiting at most `join_timeout` per worker.
    fn stop(&mut self, join_timeout: Duration);
}

/// Outcome of one shutdown-aware poll of the input queue.
pub(crate) enum Polled<P> {
    /// An element arrived.
    Msg(StreamMsg<P>),
    /// The poll timed out; re-check the shutdown latch and try again.
    Idle,
    /// The shutdown latch is set or the queue is closed; exit the loop.
    Stop,
}

/// Enqueues `msg`, retrying on `Full` until it fits or the shutdown latch is
/// set. Returns `false` if the element was not enqueued.
pub(crate) fn put_shutdown_aware<T>(
    queue: &Queue<T>,
    mut msg: T,
    shutdown: &ShutdownEvent,
    timeout: Duration,
) -> bool {
    while !shutdown.is_set() {
        match queue.put(msg, timeout) {
            Ok(()) => return true,
            Err(SendError::Full(v)) => msg = v,
            Err(SendError::Closed(_)) => return false,
        }
    }
    false
}

/// Runs the user function on one item, catching both error returns and
/// panics. The error message is what ends up in the failure report.
pub(crate) fn apply<P>(f: &WorkFn<P>, item: P) -> Result<P, String> {
    match catch_unwind(AssertUnwindSafe(|| f(item))) {
        Ok(Ok(out)) => Ok(out),
        Ok(Err(error)) => Err(error.to_string()),
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("worker function panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("worker function panicked: {msg}")
    } else {
        "worker function panicked".to_owned()
    }
}

/// Per-worker context: the wiring plus worker-local counters.
pub(crate) struct WorkerCtx<P> {
    pub(crate) name: String,
    pub(crate) inq: Queue<StreamMsg<P>>,
    pub(crate) outq: Queue<StreamMsg<P>>,
    errq: Queue<FailureReport>,
    pub(crate) shutdown: ShutdownEvent,
    pub(crate) get_timeout: Duration,
    put_timeout: Duration,
    pub(crate) count_in: u64,
    pub(crate) count_out: u64,
}

impl<P> WorkerCtx<P> {
    fn new(name: String, wiring: &StageWiring<P>) -> Self {
        Self {
            name,
            inq: wiring.inq.clone(),
            outq: wiring.outq.clone(),
            errq: wiring.errq.clone(),
            shutdown: wiring.shutdown.clone(),
            get_timeout: wiring.get_timeout,
            put_timeout: wiring.put_timeout,
            count_in: 0,
            count_out: 0,
        }
    }

    /// One shutdown-aware poll of the input queue.
    pub(crate) fn poll_input(&self) -> Polled<P> {
        if self.shutdown.is_set() {
            return Polled::Stop;
        }
        match self.inq.get(self.get_timeout) {
            Ok(msg) => Polled::Msg(msg),
            Err(RecvError::Empty) => Polled::Idle,
            Err(RecvError::Closed) => Polled::Stop,
        }
    }

    /// Puts `msg` on the output queue, retrying under the shutdown latch.
    pub(crate) fn put_out(&self, msg: StreamMsg<P>) -> bool {
        put_shutdown_aware(&self.outq, msg, &self.shutdown, self.put_timeout)
    }

    /// Puts `msg` back on the *input* queue (end-of-stream redistribution).
    pub(crate) fn put_in(&self, msg: StreamMsg<P>) -> bool {
        put_shutdown_aware(&self.inq, msg, &self.shutdown, self.put_timeout)
    }

    /// Packages a failure on `item` and posts it to the error queue.
    pub(crate) fn report_failure<I: fmt::Debug>(&self, item: &I, message: String) {
        self.push_report(FailureReport::new(&self.name, item, message));
    }

    /// Posts an already-built failure report to the error queue.
    pub(crate) fn push_report(&self, report: FailureReport) {
        warn!(worker = %self.name, "posting failure report");
        if let Err(e) = self.errq.put(report, self.put_timeout) {
            // The error queue is unbounded, so this only happens during
            // teardown races.
            error!(worker = %self.name, error = %e, "could not post failure report");
        }
    }

    /// Logs the per-stream counters and resets them for the next stream.
    pub(crate) fn finish_stream(&mut self) {
        debug!(
            worker = %self.name,
            count_in = self.count_in,
            count_out = self.count_out,
            "finished stream"
        );
        self.count_in = 0;
        self.count_out = 0;
    }
}

struct AliveGuard(Arc<AtomicUsize>);

impl AliveGuard {
    fn arm(counter: Arc<AtomicUsize>) -> Self {
        let _ = counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct WorkerHandle {
    name: String,
    handle: std::thread::JoinHandle<()>,
}

/// State and behavior shared by every stage kind: wiring storage, worker
/// spawning, alive accounting, and bounded joining.
pub(crate) struct StageCore<P> {
    name: String,
    workers: usize,
    daemon: bool,
    alive_factor: usize,
    wiring: Option<StageWiring<P>>,
    alive: Arc<AtomicUsize>,
    handles: Vec<WorkerHandle>,
}

impl<P> StageCore<P> {
    pub(crate) fn new(name: String, workers: usize, daemon: bool, alive_factor: usize) -> Self {
        Self {
            name,
            workers,
            daemon,
            alive_factor,
            wiring: None,
            alive: Arc::new(AtomicUsize::new(0)),
            handles: Vec::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers * self.alive_factor
    }

    pub(crate) fn daemon(&self) -> bool {
        self.daemon
    }

    pub(crate) fn connect(&mut self, wiring: StageWiring<P>) {
        self.wiring = Some(wiring);
    }

    pub(crate) fn wiring_ids(&self) -> Option<(u64, u64)> {
        self.wiring.as_ref().map(|w| (w.inq.id(), w.outq.id()))
    }

    fn worker_names(&self) -> Vec<String> {
        (0..self.workers)
            .map(|i| format!("{}-{i}", self.name))
            .collect()
    }

    pub(crate) fn probe(&self) -> StageProbe {
        StageProbe {
            name: self.name.clone(),
            alive: self.alive.clone(),
            alive_factor: self.alive_factor,
            configured: self.worker_count(),
            worker_names: self.worker_names(),
        }
    }

    /// Spawns one thread per worker, each running `body` with its own
    /// context.
    pub(crate) fn spawn_workers<F>(&mut self, body: F) -> Result<(), Error>
    where
        P: Send + 'static,
        F: Fn(WorkerCtx<P>) + Clone + Send + 'static,
    {
        let wiring = match self.wiring.as_ref() {
            Some(w) => w.clone(),
            // The pipeline always connects a stage before starting it.
            None => unreachable!("stage started before being connected"),
        };
        for worker_name in self.worker_names() {
            let ctx = WorkerCtx::new(worker_name.clone(), &wiring);
            let body = body.clone();
            let alive = self.alive.clone();
            let handle = std::thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || {
                    let _guard = AliveGuard::arm(alive);
                    body(ctx);
                })
                .map_err(|source| Error::WorkerSpawn {
                    worker: worker_name.clone(),
                    source,
                })?;
            self.handles.push(WorkerHandle {
                name: worker_name,
                handle,
            });
        }
        Ok(())
    }

    /// Joins every worker, waiting at most `join_timeout` each.
    ///
    /// Daemon workers that miss the deadline are abandoned with an error log
    /// (threads cannot be killed; the polling contract bounds their actual
    /// exit). Non-daemon workers are joined to completion so the resources
    /// they own are released.
    pub(crate) fn stop(&mut self, join_timeout: Duration) {
        for worker in self.handles.drain(..) {
            let deadline = Instant::now() + join_timeout;
            while !worker.handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(JOIN_POLL);
            }
            if worker.handle.is_finished() || !self.daemon {
                if !worker.handle.is_finished() {
                    warn!(worker = %worker.name, "waiting for a non-daemon worker to release its sub-pool");
                }
                if worker.handle.join().is_err() {
                    error!(worker = %worker.name, "worker panicked");
                }
            } else {
                error!(worker = %worker.name, "worker did not exit before the join deadline; abandoning it");
            }
        }
    }
}
