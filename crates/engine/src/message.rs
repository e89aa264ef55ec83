// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The element type carried by every stage-to-stage queue.
//!
//! End of stream is signalled in-band: the input driver appends a single
//! [`StreamMsg::Eos`] after the last item, and every stage forwards exactly
//! one `Eos` downstream as the last element it emits for that stream. Stages
//! dispatch on the tag instead of testing element types at runtime.

/// A single element travelling through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMsg<P> {
    /// A payload to be processed.
    Item(P),

    /// End-of-stream marker. Always the last element dequeued from any queue
    /// for a given stream.
    Eos,
}

impl<P> StreamMsg<P> {
    /// Returns `true` if this element is the end-of-stream marker.
    #[must_use]
    pub const fn is_eos(&self) -> bool {
        matches!(self, StreamMsg::Eos)
    }

    /// Returns the payload, or `None` for the end-of-stream marker.
    pub fn into_item(self) -> Option<P> {
        match self {
            StreamMsg::Item(p) => Some(p),
            StreamMsg::Eos => None,
        }
    }
}
