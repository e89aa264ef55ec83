// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Capabilities the engine requires from the payloads it moves around.
//!
//! The engine treats payloads as opaque values. It needs exactly two things
//! from them:
//!
//! 1. [`DeepClone`]: a private copy, taken by the *receiving* worker before
//!    the payload is mutated. Payloads may be backed by shared buffers
//!    (memory-mapped files, refcounted tensors); a plain `Clone` of such a
//!    type copies the handle, not the memory, so the copy discipline is an
//!    explicit capability the payload type implements itself.
//! 2. [`Batchable`]: only for the batching stages, a lossless conversion
//!    between one payload and a sequence of payloads.
//!
//! [`Payload`] is a ready-made sum type for pipelines whose streams mix
//! scalars and batches, which is the common case as soon as a pack stage is
//! involved.

/// The deep-copy capability.
///
/// `deep_clone` must return a value that shares no mutable state with
/// `self`. For plain owned data this is an ordinary clone; for handle types
/// it has to copy the underlying memory.
pub trait DeepClone: Sized {
    /// Returns a private copy of the value.
    fn deep_clone(&self) -> Self;
}

macro_rules! deep_clone_by_copy {
    ($($ty:ty),* $(,)?) => {
        $(
            impl DeepClone for $ty {
                fn deep_clone(&self) -> Self {
                    *self
                }
            }
        )*
    };
}

deep_clone_by_copy!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char
);

impl DeepClone for String {
    fn deep_clone(&self) -> Self {
        self.clone()
    }
}

impl<T: DeepClone> DeepClone for Vec<T> {
    fn deep_clone(&self) -> Self {
        self.iter().map(DeepClone::deep_clone).collect()
    }
}

impl<T: DeepClone> DeepClone for Option<T> {
    fn deep_clone(&self) -> Self {
        self.as_ref().map(DeepClone::deep_clone)
    }
}

/// Lossless conversion between one payload and a sequence of payloads.
///
/// The pack stages build one payload out of many; the unpack stages take one
/// payload apart. A payload type supports this only if it can represent a
/// collection of itself, so the capability is separate from [`DeepClone`]
/// and only required by the batching stages.
pub trait Batchable: Sized {
    /// Combines `items` into a single payload representing the batch.
    fn pack(items: Vec<Self>) -> Self;

    /// Splits a batch payload into its elements.
    ///
    /// # Errors
    ///
    /// Returns `Err(self)` unchanged when the payload is not a batch; the
    /// unpacking stages turn that into a worker failure.
    fn unpack(self) -> Result<Vec<Self>, Self>;
}

/// A payload wrapper for streams that mix scalar items and batches.
///
/// `Payload<T>` implements both engine capabilities as long as `T` is
/// deep-clonable, so it can be fed through any combination of stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload<T> {
    /// A single value.
    Single(T),

    /// A batch of payloads, produced by a pack stage or by the caller.
    Batch(Vec<Payload<T>>),
}

impl<T> Payload<T> {
    /// Returns the scalar value, or `None` for a batch.
    pub fn single(self) -> Option<T> {
        match self {
            Payload::Single(v) => Some(v),
            Payload::Batch(_) => None,
        }
    }
}

impl<T> From<T> for Payload<T> {
    fn from(value: T) -> Self {
        Payload::Single(value)
    }
}

impl<T: DeepClone> DeepClone for Payload<T> {
    fn deep_clone(&self) -> Self {
        match self {
            Payload::Single(v) => Payload::Single(v.deep_clone()),
            Payload::Batch(vs) => Payload::Batch(vs.iter().map(DeepClone::deep_clone).collect()),
        }
    }
}

impl<T> Batchable for Payload<T> {
    fn pack(items: Vec<Self>) -> Self {
        Payload::Batch(items)
    }

    fn unpack(self) -> Result<Vec<Self>, Self> {
        match self {
            Payload::Batch(vs) => Ok(vs),
            single @ Payload::Single(_) => Err(single),
        }
    }
}
