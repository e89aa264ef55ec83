// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The pipeline: topology construction, lifecycle and iteration.
//!
//! A pipeline is a linear chain of stages with a queue injected between
//! every pair of neighbours. The queue right after the input driver is
//! unbounded; every other queue is bounded (capacity 1 by default) so a
//! fast upstream stage blocks on a slow downstream stage almost
//! immediately. All stages share one unbounded error queue and one shutdown
//! latch.
//!
//! # Lifecycle
//!
//! 1. Construct with the ordered stage list.
//! 2. `start` once: spawns every stage worker plus the status monitor and
//!    the error-drain worker.
//! 3. `queue_iterable` once per iteration cycle, then iterate the pipeline
//!    until it reports the end of the stream. This may be repeated: the
//!    stages survive a stream and serve the next one.
//! 4. `stop` once: sets the shutdown latch, drains the queues, joins the
//!    workers.
//!
//! # Failure model
//!
//! Fail-stop: the first failure report drained from the error queue shuts
//! the whole pipeline down and is surfaced to the caller as
//! [`Error::WorkerFailed`]. There is no per-item recovery; the pipeline
//! must be reconstructed after a fatal error.
//!
//! An external signal handler can take a [`ShutdownEvent`] handle via
//! [`Pipeline::shutdown_event`] and set it; the owner then calls
//! [`Pipeline::stop`] to join the workers.

use crate::config::PipelineConfig;
use crate::error::{Error, FailureReport};
use crate::in_out::{InputDriver, Output, OutputDriver};
use crate::item::DeepClone;
use crate::message::StreamMsg;
use crate::monitor::{FlowProbe, FlowStatus, run_monitor};
use crate::shutdown::ShutdownEvent;
use crate::stage::{Stage, StageWiring};
use conveyor_channel::Queue;
use conveyor_channel::error::RecvError;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A staged pipeline over payloads of type `P`.
pub struct Pipeline<P>
where
    P: DeepClone + fmt::Debug + Send + 'static,
{
    config: PipelineConfig,
    stages: Vec<Box<dyn Stage<P>>>,
    queues: Vec<Queue<StreamMsg<P>>>,
    error_queue: Queue<FailureReport>,
    shutdown: ShutdownEvent,
    fatal: Arc<Mutex<Option<FailureReport>>>,
    input: InputDriver<P>,
    output: OutputDriver<P>,
    probe: FlowProbe<P>,
    iterable_queued: bool,
    started: bool,
    stopped: bool,
    monitor_handle: Option<JoinHandle<()>>,
    drain_handle: Option<JoinHandle<()>>,
}

impl<P> Pipeline<P>
where
    P: DeepClone + fmt::Debug + Send + 'static,
{
    /// Builds a pipeline from the ordered stage list, with the default
    /// configuration.
    #[must_use]
    pub fn new(stages: Vec<Box<dyn Stage<P>>>) -> Self {
        Self::with_config(PipelineConfig::default(), stages)
    }

    /// Builds a pipeline from the ordered stage list.
    ///
    /// Queues are injected between neighbours here; the stages are wired to
    /// their input/output queues and to the shared error queue, and the
    /// wiring is verified: stage `i`'s output queue is stage `i + 1`'s
    /// input queue, by identity.
    #[must_use]
    pub fn with_config(config: PipelineConfig, mut stages: Vec<Box<dyn Stage<P>>>) -> Self {
        let shutdown = ShutdownEvent::new();
        let error_queue: Queue<FailureReport> = Queue::unbounded();

        // One queue ahead of every stage plus one behind the last. The
        // first is fed by the input driver and must absorb a whole
        // iterable, so it is unbounded.
        let mut queues = Vec::with_capacity(stages.len() + 1);
        queues.push(Queue::unbounded());
        for _ in &stages {
            queues.push(Queue::bounded(config.queue_capacity));
        }

        for (i, stage) in stages.iter_mut().enumerate() {
            stage.connect(StageWiring {
                inq: queues[i].clone(),
                outq: queues[i + 1].clone(),
                errq: error_queue.clone(),
                shutdown: shutdown.clone(),
                get_timeout: config.get_timeout,
                put_timeout: config.put_timeout,
            });
        }
        debug_assert!(
            stages.windows(2).all(|pair| {
                match (pair[0].wiring_ids(), pair[1].wiring_ids()) {
                    (Some((_, upstream_out)), Some((downstream_in, _))) => {
                        upstream_out == downstream_in
                    }
                    _ => false,
                }
            }),
            "adjacent stages must share a queue"
        );

        let input = InputDriver::new(queues[0].clone(), shutdown.clone(), config.put_timeout);
        let output = OutputDriver::new(
            queues[queues.len() - 1].clone(),
            shutdown.clone(),
            config.get_timeout,
        );
        let probe = FlowProbe {
            queues: queues.clone(),
            stages: stages.iter().map(|s| s.probe()).collect(),
        };

        Self {
            config,
            stages,
            queues,
            error_queue,
            shutdown,
            fatal: Arc::new(Mutex::new(None)),
            input,
            output,
            probe,
            iterable_queued: false,
            started: false,
            stopped: false,
            monitor_handle: None,
            drain_handle: None,
        }
    }

    /// Starts every stage worker, the status monitor and the error-drain
    /// worker.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::AlreadyStarted`] on a second call and with
    /// [`Error::WorkerSpawn`] if an OS thread could not be created.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }
        debug!("before start\n{}", self.flowstatus());

        for stage in &mut self.stages {
            stage.start()?;
        }

        let monitor_probe = self.probe.clone();
        let monitor_shutdown = self.shutdown.clone();
        let interval = self.config.monitor_interval;
        self.monitor_handle = Some(
            std::thread::Builder::new()
                .name("flow-status".to_owned())
                .spawn(move || run_monitor(&monitor_probe, &monitor_shutdown, interval))
                .map_err(|source| Error::WorkerSpawn {
                    worker: "flow-status".to_owned(),
                    source,
                })?,
        );

        let drain_queue = self.error_queue.clone();
        let drain_shutdown = self.shutdown.clone();
        let drain_fatal = self.fatal.clone();
        let poll = self.config.error_poll_timeout;
        self.drain_handle = Some(
            std::thread::Builder::new()
                .name("error-drain".to_owned())
                .spawn(move || run_error_drain(&drain_queue, &drain_shutdown, &drain_fatal, poll))
                .map_err(|source| Error::WorkerSpawn {
                    worker: "error-drain".to_owned(),
                    source,
                })?,
        );

        self.started = true;
        Ok(())
    }

    /// Feeds `iterable` into the pipeline, followed by exactly one
    /// end-of-stream marker. Single-shot: a second call before the current
    /// stream has been fully consumed is refused.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::IterableAlreadyQueued`] while a stream is in
    /// flight and with [`Error::ShutDown`] once the pipeline has been shut
    /// down (by `stop` or a worker failure).
    pub fn queue_iterable<I>(&mut self, iterable: I) -> Result<&mut Self, Error>
    where
        I: IntoIterator<Item = P>,
    {
        if self.shutdown.is_set() {
            return Err(Error::ShutDown);
        }
        if self.iterable_queued {
            return Err(Error::IterableAlreadyQueued);
        }
        let queued = self.input.queue_iterable(iterable);
        debug!(queued, "iterable queued");
        self.iterable_queued = true;
        Ok(self)
    }

    /// Returns a point-in-time snapshot of queue saturations and per-stage
    /// alive-worker counts. `Display` renders it as a table.
    #[must_use]
    pub fn flowstatus(&self) -> FlowStatus {
        self.probe.sample()
    }

    /// Returns a handle to the shutdown latch, e.g. for a signal handler.
    ///
    /// Setting the latch makes every worker exit its loop within one
    /// polling interval; the pipeline owner still calls [`Pipeline::stop`]
    /// to join them.
    #[must_use]
    pub fn shutdown_event(&self) -> ShutdownEvent {
        self.shutdown.clone()
    }

    /// Shuts the pipeline down: sets the shutdown latch, drains every
    /// queue, joins the stage workers (bounded per worker), then the
    /// monitor and error-drain workers, and finally closes the queues.
    ///
    /// Idempotent; workers still alive after the grace period are reported
    /// at error level.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        info!("before stop\n{}", self.flowstatus());
        warn!("setting shutdown event");
        self.shutdown.set();

        for queue in &self.queues {
            let _ = queue.drain();
        }
        for (i, stage) in self.stages.iter_mut().enumerate() {
            debug!(stage = i, "stopping stage");
            stage.stop(self.config.join_timeout);
        }

        if let Some(handle) = self.drain_handle.take() {
            if handle.join().is_err() {
                error!("error-drain worker panicked");
            }
        }
        if let Some(handle) = self.monitor_handle.take() {
            if handle.join().is_err() {
                error!("status-monitor worker panicked");
            }
        }
        self.error_queue.close();

        std::thread::sleep(self.config.stop_grace);
        for stage in self.flowstatus().stages {
            if stage.alive_workers > 0 {
                error!(
                    stage = %stage.name,
                    alive = stage.alive_workers,
                    "workers still alive after stop"
                );
            }
        }
        for queue in &self.queues {
            queue.close();
        }
        info!("after stop\n{}", self.flowstatus());
    }
}

impl<P> Iterator for Pipeline<P>
where
    P: DeepClone + fmt::Debug + Send + 'static,
{
    type Item = Result<P, Error>;

    /// Yields the items of the current stream as they become available.
    ///
    /// The stream ends (`None`) when the end-of-stream marker arrives,
    /// which also re-arms `queue_iterable` for the next stream. Lifecycle
    /// misuse and worker failures are yielded as `Err` items.
    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            return Some(Err(Error::NotStarted));
        }
        if !self.iterable_queued {
            return Some(Err(Error::NoIterableQueued));
        }
        match self.output.next_item() {
            Output::Item(item) => Some(Ok(item)),
            Output::EndOfStream => {
                debug!("stream complete");
                self.iterable_queued = false;
                None
            }
            Output::Interrupted => {
                // The stream is dead either way; the single-shot flag must
                // not outlive it.
                self.iterable_queued = false;
                self.fatal
                    .lock()
                    .take()
                    .map(|report| Err(Error::WorkerFailed { report }))
            }
        }
    }
}

impl<P> Drop for Pipeline<P>
where
    P: DeepClone + fmt::Debug + Send + 'static,
{
    fn drop(&mut self) {
        // Workers poll the latch, so they exit even if stop was never
        // called; stop is still the clean path that joins them.
        self.shutdown.set();
    }
}

/// Body of the error-drain worker: waits for the first failure report,
/// logs all its fields, sets the shutdown latch and records the report as
/// the pipeline's fatal error.
fn run_error_drain(
    error_queue: &Queue<FailureReport>,
    shutdown: &ShutdownEvent,
    fatal: &Mutex<Option<FailureReport>>,
    poll: Duration,
) {
    loop {
        if shutdown.is_set() {
            break;
        }
        match error_queue.get(poll) {
            Ok(report) => {
                error!("worker failure, setting shutdown event");
                error!(worker = %report.worker, "failed worker");
                error!(item = %report.item_summary, "offending element");
                error!(error = %report.error, "worker error");
                error!(backtrace = %report.backtrace, "failure backtrace");
                shutdown.set();
                *fatal.lock() = Some(report);
                break;
            }
            Err(RecvError::Empty) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::map::MapStage;

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            get_timeout: Duration::from_millis(10),
            error_poll_timeout: Duration::from_millis(20),
            join_timeout: Duration::from_secs(2),
            stop_grace: Duration::from_millis(50),
            ..PipelineConfig::default()
        }
    }

    fn identity_pipeline(workers: usize) -> Pipeline<i64> {
        Pipeline::with_config(
            fast_config(),
            vec![Box::new(MapStage::new("identity", workers, |x: i64| Ok(x)))],
        )
    }

    #[test]
    fn test_iteration_requires_start_and_a_queued_iterable() {
        let mut pipeline = identity_pipeline(1);
        assert!(matches!(pipeline.next(), Some(Err(Error::NotStarted))));

        pipeline.start().expect("start");
        assert!(matches!(pipeline.next(), Some(Err(Error::NoIterableQueued))));
        pipeline.stop();
    }

    #[test]
    fn test_start_is_guarded_against_double_start() {
        let mut pipeline = identity_pipeline(1);
        pipeline.start().expect("first start");
        assert!(matches!(pipeline.start(), Err(Error::AlreadyStarted)));
        pipeline.stop();
    }

    #[test]
    fn test_queue_iterable_is_single_shot_per_stream() {
        let mut pipeline = identity_pipeline(1);
        pipeline.start().expect("start");
        let _ = pipeline.queue_iterable(vec![1, 2, 3]).expect("first queue");
        assert!(matches!(
            pipeline.queue_iterable(vec![4]),
            Err(Error::IterableAlreadyQueued)
        ));

        let collected: Vec<i64> = pipeline
            .by_ref()
            .map(|r| r.expect("no worker failure"))
            .collect();
        assert_eq!(collected.len(), 3);

        // The stream is consumed: a new iterable may be queued.
        let _ = pipeline.queue_iterable(vec![4]).expect("second stream");
        let collected: Vec<i64> = pipeline
            .by_ref()
            .map(|r| r.expect("no worker failure"))
            .collect();
        assert_eq!(collected, vec![4]);
        pipeline.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut pipeline = identity_pipeline(2);
        pipeline.start().expect("start");
        pipeline.stop();
        pipeline.stop();
    }

    #[test]
    fn test_queue_iterable_fails_after_shutdown() {
        let mut pipeline = identity_pipeline(1);
        pipeline.start().expect("start");
        pipeline.stop();
        assert!(matches!(
            pipeline.queue_iterable(vec![1]),
            Err(Error::ShutDown)
        ));
    }

    #[test]
    fn test_structural_identity_of_the_wiring() {
        let pipeline = Pipeline::<i64>::with_config(
            fast_config(),
            vec![
                Box::new(MapStage::new("a", 1, |x: i64| Ok(x))),
                Box::new(MapStage::new("b", 1, |x: i64| Ok(x))),
            ],
        );
        let (_, a_out) = pipeline.stages[0].wiring_ids().expect("a wired");
        let (b_in, _) = pipeline.stages[1].wiring_ids().expect("b wired");
        assert_eq!(a_out, b_in);
        assert_eq!(pipeline.queues.len(), pipeline.stages.len() + 1);
        // The input queue is unbounded, the internal ones are bounded.
        assert_eq!(pipeline.queues[0].capacity(), None);
        assert_eq!(pipeline.queues[1].capacity(), Some(1));
    }
}
