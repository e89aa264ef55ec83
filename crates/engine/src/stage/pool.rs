// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Fan-out stage: one owner worker driving a thread sub-pool.
//!
//! The stage runs a single outer worker, so there is exactly one owner for
//! the sub-pool and input order is preserved. Each incoming payload must be
//! a batch; its elements are mapped over the sub-pool in parallel and the
//! results are collected back into a single batch of the same length and
//! order before being pushed downstream.
//!
//! While a sub-pool map is in flight, the owner polls the shutdown latch at
//! one-second granularity and abandons the wait if it is set. The owner is
//! a non-daemon worker: `stop` joins it to completion so the sub-pool is
//! dropped (and its threads released) before the pipeline reports shutdown
//! complete.

use crate::error::{BoxedError, Error, FailureReport};
use crate::item::{Batchable, DeepClone};
use crate::message::StreamMsg;
use crate::monitor::StageProbe;
use crate::stage::{Polled, Stage, StageCore, StageWiring, WorkFn, WorkerCtx, apply};
use conveyor_channel::Queue;
use conveyor_channel::error::RecvError;
use rayon::prelude::*;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How often the owner re-checks the shutdown latch while a sub-pool map is
/// in flight.
const SUBPOOL_POLL: Duration = Duration::from_secs(1);

/// Stage mapping the user function over the elements of each incoming batch
/// on a sub-pool of `k` threads.
pub struct PoolStage<P> {
    core: StageCore<P>,
    subpool_size: usize,
    f: WorkFn<P>,
}

impl<P> PoolStage<P>
where
    P: DeepClone + Batchable + fmt::Debug + Send + 'static,
{
    /// Creates a stage named `name` mapping `f` over batch elements on
    /// `subpool_size` sub-pool threads.
    pub fn new<N, F>(name: N, subpool_size: usize, f: F) -> Self
    where
        N: Into<String>,
        F: Fn(P) -> Result<P, BoxedError> + Send + Sync + 'static,
    {
        // A single owner worker manages the sub-pool; the status table
        // reports the sub-pool size through the alive factor.
        Self {
            core: StageCore::new(name.into(), 1, false, subpool_size),
            subpool_size,
            f: Arc::new(f),
        }
    }
}

impl<P> Stage<P> for PoolStage<P>
where
    P: DeepClone + Batchable + fmt::Debug + Send + 'static,
{
    fn name(&self) -> &str {
        self.core.name()
    }

    fn worker_count(&self) -> usize {
        self.core.worker_count()
    }

    fn daemon(&self) -> bool {
        self.core.daemon()
    }

    fn connect(&mut self, wiring: StageWiring<P>) {
        self.core.connect(wiring);
    }

    fn wiring_ids(&self) -> Option<(u64, u64)> {
        self.core.wiring_ids()
    }

    fn start(&mut self) -> Result<(), Error> {
        let f = self.f.clone();
        let subpool_size = self.subpool_size;
        self.core.spawn_workers(move |mut ctx| {
            run_pool_worker(&mut ctx, &f, subpool_size);
        })
    }

    fn probe(&self) -> StageProbe {
        self.core.probe()
    }

    fn stop(&mut self, join_timeout: Duration) {
        self.core.stop(join_timeout);
    }
}

fn run_pool_worker<P>(ctx: &mut WorkerCtx<P>, f: &WorkFn<P>, subpool_size: usize)
where
    P: DeepClone + Batchable + fmt::Debug + Send + 'static,
{
    let thread_prefix = ctx.name.clone();
    let pool = match rayon::ThreadPoolBuilder::new()
        .num_threads(subpool_size)
        .thread_name(move |i| format!("{thread_prefix}-pool-{i}"))
        .build()
    {
        Ok(pool) => pool,
        Err(e) => {
            ctx.push_report(FailureReport {
                worker: ctx.name.clone(),
                item_summary: String::new(),
                error: format!("could not build the sub-pool: {e}"),
                backtrace: std::backtrace::Backtrace::force_capture().to_string(),
            });
            return;
        }
    };
    debug!(worker = %ctx.name, subpool = subpool_size, "sub-pool initialised");

    loop {
        match ctx.poll_input() {
            Polled::Stop => break,
            Polled::Idle => continue,
            Polled::Msg(StreamMsg::Eos) => {
                // Single worker: forward directly, no barrier needed.
                if !ctx.put_out(StreamMsg::Eos) {
                    break;
                }
                ctx.finish_stream();
            }
            Polled::Msg(StreamMsg::Item(item)) => {
                ctx.count_in += 1;
                let elements = match item.deep_clone().unpack() {
                    Ok(elements) => elements,
                    Err(original) => {
                        ctx.report_failure(&original, "element is not a batch".to_owned());
                        break;
                    }
                };

                // Run the map on the sub-pool and wait for the result while
                // keeping an eye on the shutdown latch.
                let results: Queue<Result<Vec<P>, String>> = Queue::bounded(1);
                {
                    let results = results.clone();
                    let f = f.clone();
                    pool.spawn(move || {
                        let mapped: Result<Vec<P>, String> =
                            elements.into_par_iter().map(|x| apply(&f, x)).collect();
                        let _ = results.put(mapped, SUBPOOL_POLL);
                    });
                }
                let outcome = loop {
                    match results.get(SUBPOOL_POLL) {
                        Ok(res) => break Some(res),
                        Err(RecvError::Empty) => {
                            if ctx.shutdown.is_set() {
                                break None;
                            }
                        }
                        Err(RecvError::Closed) => break None,
                    }
                };

                match outcome {
                    None => break,
                    Some(Ok(outputs)) => {
                        if !ctx.put_out(StreamMsg::Item(P::pack(outputs))) {
                            break;
                        }
                        ctx.count_out += 1;
                    }
                    Some(Err(message)) => {
                        ctx.report_failure(&item, message);
                        break;
                    }
                }
            }
        }
    }
    // Dropping the pool waits for any in-flight map and releases the
    // sub-pool threads.
    drop(pool);
    debug!(worker = %ctx.name, "sub-pool released");
}
