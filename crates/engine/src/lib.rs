// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Staged pipeline engine for parallel data processing.
//!
//! A pipeline is an ordered chain of transformation stages. Each stage owns
//! one or more OS-thread workers that pull elements from an upstream
//! bounded queue, apply a per-item transformation and push results
//! downstream:
//!
//! ```text
//! input ──▶ Q₀ ──▶ Stage₁ ──▶ Q₁ ──▶ … ──▶ Qₙ₋₁ ──▶ Stageₙ ──▶ Qₙ ──▶ output
//! ```
//!
//! The engine orchestrates worker lifecycles, backpressure between stages
//! (internal queues default to capacity 1), in-band end-of-stream
//! signalling, error surfacing through a shared error queue, and graceful
//! shutdown on failure or external request. Payloads are opaque; the engine
//! only requires the [`DeepClone`] capability, plus [`Batchable`] for the
//! batching stages.
//!
//! ```no_run
//! use conveyor_engine::{MapStage, PackStage, Payload, Pipeline, UnpackStage};
//!
//! let mut pipeline = Pipeline::new(vec![
//!     Box::new(PackStage::new(8)),
//!     Box::new(UnpackStage::new()),
//!     Box::new(MapStage::new("double", 4, |p: Payload<i64>| match p {
//!         Payload::Single(v) => Ok(Payload::Single(v * 2)),
//!         batch => Ok(batch),
//!     })),
//! ]);
//! pipeline.start()?;
//! let _ = pipeline.queue_iterable((0..100_i64).map(Payload::from))?;
//! for item in pipeline.by_ref() {
//!     let _doubled = item?;
//! }
//! # Ok::<(), conveyor_engine::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod item;
pub mod message;
pub mod monitor;
pub mod pipeline;
pub mod shutdown;
pub mod stage;
pub mod telemetry;

mod barrier;
mod in_out;

pub use config::PipelineConfig;
pub use error::{BoxedError, Error, FailureReport};
pub use item::{Batchable, DeepClone, Payload};
pub use message::StreamMsg;
pub use monitor::{FlowStatus, QueueStatus, StageProbe, StageStatus};
pub use pipeline::Pipeline;
pub use shutdown::ShutdownEvent;
pub use stage::map::MapStage;
pub use stage::pack::{PackStage, RepackStage, UnpackStage};
pub use stage::pool::PoolStage;
pub use stage::{Stage, StageWiring};
