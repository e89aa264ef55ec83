// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Shutdown-aware cyclic barrier used by the end-of-stream protocol of
//! multi-worker stages.
//!
//! `std::sync::Barrier` blocks without a timeout, which would let a worker
//! wait forever if a peer exited early (for example after posting a failure
//! report). This barrier re-checks the shutdown latch between short waits,
//! honouring the rule that every blocked worker returns control at least
//! once per second. A party that observes the latch leaves the barrier
//! without tripping it.
//!
//! The first party to arrive in each generation is the winner; the terminal
//! protocol uses the winner to perform the singleton work of a stage
//! (removing the residual end-of-stream marker and forwarding exactly one
//! downstream). The barrier re-arms itself after every generation, so a
//! pipeline can run any number of streams without reconstruction.

use crate::shutdown::ShutdownEvent;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Outcome of a [`CyclicBarrier::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BarrierWait {
    /// All parties arrived and this one arrived first.
    Winner,

    /// All parties arrived and another one arrived first.
    Follower,

    /// The shutdown latch was set before all parties arrived.
    Interrupted,
}

struct BarrierState {
    arrived: usize,
    generation: u64,
}

/// A reusable barrier for a fixed number of parties.
pub(crate) struct CyclicBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl CyclicBarrier {
    pub(crate) fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            cvar: Condvar::new(),
        }
    }

    /// Blocks until all parties arrive or `shutdown` is set.
    pub(crate) fn wait(&self, shutdown: &ShutdownEvent) -> BarrierWait {
        let mut state = self.state.lock();
        let generation = state.generation;
        let index = state.arrived;
        state.arrived += 1;

        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            let _ = self.cvar.notify_all();
            return Self::outcome(index);
        }

        loop {
            let timed_out = self.cvar.wait_for(&mut state, WAIT_SLICE).timed_out();
            if state.generation != generation {
                return Self::outcome(index);
            }
            if timed_out && shutdown.is_set() {
                // Leave without tripping the barrier so a late peer does not
                // count this party twice.
                state.arrived -= 1;
                return BarrierWait::Interrupted;
            }
        }
    }

    const fn outcome(index: usize) -> BarrierWait {
        if index == 0 {
            BarrierWait::Winner
        } else {
            BarrierWait::Follower
        }
    }
}
