// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Batching stages: pack, unpack and repack.
//!
//! All three run a single worker, so they preserve input order. Pack
//! accumulates incoming items into fixed-size batches; unpack explodes
//! batches back into items; repack consumes batches and re-emits fixed-size
//! batches, crossing the incoming batch boundaries.
//!
//! On end of stream, pack and repack first flush a partial batch if one is
//! buffered, then forward the marker.

use crate::error::Error;
use crate::item::{Batchable, DeepClone};
use crate::message::StreamMsg;
use crate::monitor::StageProbe;
use crate::stage::{Polled, Stage, StageCore, StageWiring, WorkerCtx};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Stage collecting `k` consecutive items into one batch.
///
/// Output cardinality is `ceil(n / k)`; every emitted batch except possibly
/// the last holds exactly `k` items. Pack accepts any payload, batch or not:
/// whatever arrives becomes an element of the next batch.
pub struct PackStage<P> {
    core: StageCore<P>,
    batch_size: usize,
}

impl<P> PackStage<P>
where
    P: DeepClone + Batchable + fmt::Debug + Send + 'static,
{
    /// Creates a pack stage emitting batches of `batch_size` items.
    pub fn new(batch_size: usize) -> Self {
        Self {
            core: StageCore::new(format!("Pack({batch_size})"), 1, true, 1),
            batch_size,
        }
    }
}

impl<P> Stage<P> for PackStage<P>
where
    P: DeepClone + Batchable + fmt::Debug + Send + 'static,
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
        let batch_size = self.batch_size;
        self.core.spawn_workers(move |mut ctx| {
            run_pack_worker(&mut ctx, batch_size);
        })
    }

    fn probe(&self) -> StageProbe {
        self.core.probe()
    }

    fn stop(&mut self, join_timeout: Duration) {
        self.core.stop(join_timeout);
    }
}

fn run_pack_worker<P>(ctx: &mut WorkerCtx<P>, batch_size: usize)
where
    P: DeepClone + Batchable + fmt::Debug + Send + 'static,
{
    let mut buffer: Vec<P> = Vec::with_capacity(batch_size);
    loop {
        match ctx.poll_input() {
            Polled::Stop => break,
            Polled::Idle => continue,
            Polled::Msg(StreamMsg::Eos) => {
                if !buffer.is_empty() {
                    debug!(worker = %ctx.name, len = buffer.len(), "emitting partial batch");
                    let batch = P::pack(std::mem::take(&mut buffer));
                    if !ctx.put_out(StreamMsg::Item(batch)) {
                        break;
                    }
                    ctx.count_out += 1;
                }
                if !ctx.put_out(StreamMsg::Eos) {
                    break;
                }
                ctx.finish_stream();
            }
            Polled::Msg(StreamMsg::Item(item)) => {
                ctx.count_in += 1;
                buffer.push(item.deep_clone());
                if buffer.len() == batch_size {
                    let batch = P::pack(std::mem::take(&mut buffer));
                    if !ctx.put_out(StreamMsg::Item(batch)) {
                        break;
                    }
                    ctx.count_out += 1;
                    buffer.reserve(batch_size);
                }
            }
        }
    }
    debug!(worker = %ctx.name, "worker loop exited");
}

/// Stage exploding each incoming batch into its elements, in order.
///
/// A payload that is not a batch is a fatal error: the worker posts a
/// failure report and exits.
pub struct UnpackStage<P> {
    core: StageCore<P>,
}

impl<P> UnpackStage<P>
where
    P: DeepClone + Batchable + fmt::Debug + Send + 'static,
{
    /// Creates an unpack stage.
    pub fn new() -> Self {
        Self {
            core: StageCore::new("Unpack".to_owned(), 1, true, 1),
        }
    }
}

impl<P> Default for UnpackStage<P>
where
    P: DeepClone + Batchable + fmt::Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Stage<P> for UnpackStage<P>
where
    P: DeepClone + Batchable + fmt::Debug + Send + 'static,
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
        self.core.spawn_workers(move |mut ctx| {
            run_unpack_worker(&mut ctx);
        })
    }

    fn probe(&self) -> StageProbe {
        self.core.probe()
    }

    fn stop(&mut self, join_timeout: Duration) {
        self.core.stop(join_timeout);
    }
}

fn run_unpack_worker<P>(ctx: &mut WorkerCtx<P>)
where
    P: DeepClone + Batchable + fmt::Debug + Send + 'static,
{
    'outer: loop {
        match ctx.poll_input() {
            Polled::Stop => break,
            Polled::Idle => continue,
            Polled::Msg(StreamMsg::Eos) => {
                if !ctx.put_out(StreamMsg::Eos) {
                    break;
                }
                ctx.finish_stream();
            }
            Polled::Msg(StreamMsg::Item(item)) => {
                ctx.count_in += 1;
                match item.deep_clone().unpack() {
                    Ok(elements) => {
                        for element in elements {
                            if !ctx.put_out(StreamMsg::Item(element)) {
                                break 'outer;
                            }
                            ctx.count_out += 1;
                        }
                    }
                    Err(original) => {
                        ctx.report_failure(&original, "element is not a batch".to_owned());
                        break;
                    }
                }
            }
        }
    }
    debug!(worker = %ctx.name, "worker loop exited");
}

/// Stage rebatching incoming batches into batches of `k` elements.
///
/// The element counts are conserved: the sum of incoming batch sizes equals
/// the sum of outgoing batch sizes, with a possibly shorter final batch
/// flushed on end of stream.
pub struct RepackStage<P> {
    core: StageCore<P>,
    batch_size: usize,
}

impl<P> RepackStage<P>
where
    P: DeepClone + Batchable + fmt::Debug + Send + 'static,
{
    /// Creates a repack stage emitting batches of `batch_size` elements.
    pub fn new(batch_size: usize) -> Self {
        Self {
            core: StageCore::new(format!("Repack({batch_size})"), 1, true, 1),
            batch_size,
        }
    }
}

impl<P> Stage<P> for RepackStage<P>
where
    P: DeepClone + Batchable + fmt::Debug + Send + 'static,
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
        let batch_size = self.batch_size;
        self.core.spawn_workers(move |mut ctx| {
            run_repack_worker(&mut ctx, batch_size);
        })
    }

    fn probe(&self) -> StageProbe {
        self.core.probe()
    }

    fn stop(&mut self, join_timeout: Duration) {
        self.core.stop(join_timeout);
    }
}

fn run_repack_worker<P>(ctx: &mut WorkerCtx<P>, batch_size: usize)
where
    P: DeepClone + Batchable + fmt::Debug + Send + 'static,
{
    let mut buffer: Vec<P> = Vec::with_capacity(batch_size);
    'outer: loop {
        match ctx.poll_input() {
            Polled::Stop => break,
            Polled::Idle => continue,
            Polled::Msg(StreamMsg::Eos) => {
                if !buffer.is_empty() {
                    debug!(worker = %ctx.name, len = buffer.len(), "emitting partial batch");
                    let batch = P::pack(std::mem::take(&mut buffer));
                    if !ctx.put_out(StreamMsg::Item(batch)) {
                        break;
                    }
                    ctx.count_out += 1;
                }
                if !ctx.put_out(StreamMsg::Eos) {
                    break;
                }
                ctx.finish_stream();
                buffer = Vec::with_capacity(batch_size);
            }
            Polled::Msg(StreamMsg::Item(item)) => {
                match item.deep_clone().unpack() {
                    Ok(elements) => {
                        ctx.count_in += 1;
                        for element in elements {
                            buffer.push(element);
                            if buffer.len() == batch_size {
                                let batch = P::pack(std::mem::take(&mut buffer));
                                if !ctx.put_out(StreamMsg::Item(batch)) {
                                    break 'outer;
                                }
                                ctx.count_out += 1;
                                buffer.reserve(batch_size);
                            }
                        }
                    }
                    Err(original) => {
                        ctx.report_failure(&original, "element is not a batch".to_owned());
                        break;
                    }
                }
            }
        }
    }
    debug!(worker = %ctx.name, "worker loop exited");
}
