// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! 1:1 transformation stage with N parallel workers.
//!
//! Each worker pulls an item from the input queue, deep-clones it, applies
//! the user function and pushes the result downstream. With more than one
//! worker the output order is not preserved.
//!
//! # End-of-stream protocol
//!
//! The single end-of-stream marker must be observed by all N workers but
//! forwarded downstream exactly once. A worker that dequeues the marker puts
//! it back on the *input* queue so its peers can see it too, then waits at
//! the finish barrier. Once all N workers have arrived, the barrier winner
//! removes the one residual marker from the input queue and forwards a
//! single marker downstream. A second barrier keeps the peers from
//! re-entering the input queue before the residual marker is gone, which
//! also makes the stage reusable for the next stream without
//! reconstruction.

use crate::barrier::{BarrierWait, CyclicBarrier};
use crate::error::{BoxedError, Error};
use crate::item::DeepClone;
use crate::message::StreamMsg;
use crate::monitor::StageProbe;
use crate::stage::{Polled, Stage, StageCore, StageWiring, WorkFn, WorkerCtx, apply};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Stage applying a user function to each item, on N parallel workers.
pub struct MapStage<P> {
    core: StageCore<P>,
    f: WorkFn<P>,
    finish_barrier: Arc<CyclicBarrier>,
    sync_barrier: Arc<CyclicBarrier>,
}

impl<P> MapStage<P>
where
    P: DeepClone + fmt::Debug + Send + 'static,
{
    /// Creates a stage named `name` running `f` on `workers` parallel
    /// workers.
    pub fn new<N, F>(name: N, workers: usize, f: F) -> Self
    where
        N: Into<String>,
        F: Fn(P) -> Result<P, BoxedError> + Send + Sync + 'static,
    {
        Self {
            core: StageCore::new(name.into(), workers, true, 1),
            f: Arc::new(f),
            finish_barrier: Arc::new(CyclicBarrier::new(workers)),
            sync_barrier: Arc::new(CyclicBarrier::new(workers)),
        }
    }
}

impl<P> Stage<P> for MapStage<P>
where
    P: DeepClone + fmt::Debug + Send + 'static,
{
    fn name(&self) -> &str {
        self.core.name()
    }

    fn worker_count(&self) -> usize {
        self.core.worker_count()
    }

    fn connect(&mut self, wiring: StageWiring<P>) {
        self.core.connect(wiring);
    }

    fn wiring_ids(&self) -> Option<(u64, u64)> {
        self.core.wiring_ids()
    }

    fn start(&mut self) -> Result<(), Error> {
        let f = self.f.clone();
        let finish_barrier = self.finish_barrier.clone();
        let sync_barrier = self.sync_barrier.clone();
        self.core.spawn_workers(move |mut ctx| {
            run_worker(&mut ctx, &f, &finish_barrier, &sync_barrier);
        })
    }

    fn probe(&self) -> StageProbe {
        self.core.probe()
    }

    fn stop(&mut self, join_timeout: Duration) {
        self.core.stop(join_timeout);
    }
}

fn run_worker<P>(
    ctx: &mut WorkerCtx<P>,
    f: &WorkFn<P>,
    finish_barrier: &CyclicBarrier,
    sync_barrier: &CyclicBarrier,
) where
    P: DeepClone + fmt::Debug + Send + 'static,
{
    debug!(worker = %ctx.name, queue = ctx.inq.id(), "start reading from input queue");
    loop {
        match ctx.poll_input() {
            Polled::Stop => break,
            Polled::Idle => continue,
            Polled::Msg(StreamMsg::Eos) => {
                if !handle_terminal(ctx, finish_barrier, sync_barrier) {
                    break;
                }
            }
            Polled::Msg(StreamMsg::Item(item)) => {
                ctx.count_in += 1;
                // The receiving side clones before mutating; `item` is kept
                // around so a failure can still be reported on it.
                let work_item = item.deep_clone();
                match apply(f, work_item) {
                    Ok(out) => {
                        if !ctx.put_out(StreamMsg::Item(out)) {
                            break;
                        }
                        ctx.count_out += 1;
                    }
                    Err(message) => {
                        ctx.report_failure(&item, message);
                        break;
                    }
                }
            }
        }
    }
    debug!(worker = %ctx.name, "worker loop exited");
}

/// Runs the two-phase end-of-stream protocol. Returns `false` if the worker
/// should exit because shutdown was observed.
fn handle_terminal<P>(
    ctx: &mut WorkerCtx<P>,
    finish_barrier: &CyclicBarrier,
    sync_barrier: &CyclicBarrier,
) -> bool {
    debug!(worker = %ctx.name, "got end-of-stream marker");

    // Put the marker back so the other workers can observe it too.
    if !ctx.put_in(StreamMsg::Eos) {
        return false;
    }

    debug!(worker = %ctx.name, "waiting at the finish barrier");
    match finish_barrier.wait(&ctx.shutdown) {
        BarrierWait::Interrupted => return false,
        BarrierWait::Winner => {
            // All workers are idle; exactly one residual marker is left on
            // the input queue. Remove it and forward a single one.
            loop {
                match ctx.poll_input() {
                    Polled::Stop => return false,
                    Polled::Idle => continue,
                    Polled::Msg(msg) => {
                        debug_assert!(msg.is_eos(), "residual element must be the marker");
                        break;
                    }
                }
            }
            if !ctx.put_out(StreamMsg::Eos) {
                return false;
            }
            debug!(worker = %ctx.name, "forwarded end-of-stream marker");
        }
        BarrierWait::Follower => {}
    }

    if matches!(sync_barrier.wait(&ctx.shutdown), BarrierWait::Interrupted) {
        return false;
    }

    ctx.finish_stream();
    true
}
