// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Drivers at the two ends of the pipeline.
//!
//! The input driver feeds a caller-supplied iterable into the first queue
//! and appends exactly one end-of-stream marker. The output driver consumes
//! the last queue and hands items to the caller until it sees the marker,
//! deep-cloning each item to detach it from any memory still owned by
//! upstream workers.

use crate::item::DeepClone;
use crate::message::StreamMsg;
use crate::shutdown::ShutdownEvent;
use crate::stage::put_shutdown_aware;
use conveyor_channel::Queue;
use conveyor_channel::error::RecvError;
use std::time::Duration;
use tracing::debug;

/// Feeds iterables into the first queue of the pipeline.
pub(crate) struct InputDriver<P> {
    outq: Queue<StreamMsg<P>>,
    shutdown: ShutdownEvent,
    put_timeout: Duration,
}

impl<P> InputDriver<P> {
    pub(crate) fn new(
        outq: Queue<StreamMsg<P>>,
        shutdown: ShutdownEvent,
        put_timeout: Duration,
    ) -> Self {
        Self {
            outq,
            shutdown,
            put_timeout,
        }
    }

    /// Enqueues every element of `iterable`, then exactly one end-of-stream
    /// marker. Runs on the caller's thread; the first queue is unbounded so
    /// this does not block on a slow pipeline.
    ///
    /// Returns the number of elements enqueued. Stops early if the shutdown
    /// latch is set.
    pub(crate) fn queue_iterable<I>(&self, iterable: I) -> usize
    where
        I: IntoIterator<Item = P>,
    {
        let mut queued = 0_usize;
        for element in iterable {
            if !self.put(StreamMsg::Item(element)) {
                return queued;
            }
            queued += 1;
        }
        debug!(queued, "queuing elements complete");
        let _ = self.put(StreamMsg::Eos);
        queued
    }

    fn put(&self, msg: StreamMsg<P>) -> bool {
        put_shutdown_aware(&self.outq, msg, &self.shutdown, self.put_timeout)
    }
}

/// What the output driver observed on the last queue.
pub(crate) enum Output<P> {
    /// An item, already detached from upstream memory.
    Item(P),
    /// The end-of-stream marker: the current stream is complete.
    EndOfStream,
    /// The shutdown latch was set or the queue closed.
    Interrupted,
}

/// Consumes the last queue of the pipeline on behalf of the caller.
pub(crate) struct OutputDriver<P> {
    inq: Queue<StreamMsg<P>>,
    shutdown: ShutdownEvent,
    get_timeout: Duration,
}

impl<P: DeepClone> OutputDriver<P> {
    pub(crate) fn new(
        inq: Queue<StreamMsg<P>>,
        shutdown: ShutdownEvent,
        get_timeout: Duration,
    ) -> Self {
        Self {
            inq,
            shutdown,
            get_timeout,
        }
    }

    /// Shutdown-aware get of the next item. Never mutates the queue beyond
    /// removing elements.
    pub(crate) fn next_item(&self) -> Output<P> {
        while !self.shutdown.is_set() {
            match self.inq.get(self.get_timeout) {
                Ok(StreamMsg::Item(item)) => return Output::Item(item.deep_clone()),
                Ok(StreamMsg::Eos) => {
                    debug!("output driver got end-of-stream marker");
                    return Output::EndOfStream;
                }
                Err(RecvError::Empty) => continue,
                Err(RecvError::Closed) => return Output::Interrupted,
            }
        }
        Output::Interrupted
    }
}
