// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Blocking queue implementation used as the transport between pipeline stages.

pub mod error;
pub mod queue;

pub use queue::Queue;
