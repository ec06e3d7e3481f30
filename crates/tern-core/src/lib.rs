//! # tern-core
//!
//! Core primitives for the tern embedded neural-network engine.
//!
//! This crate provides:
//! - [`Tensor`] — a borrowed view descriptor over planned memory
//! - [`Shape`] — n-dimensional shape (no broadcasting, no strides)
//! - [`DType`] / [`QuantParams`] — numeric-format descriptors, including the
//!   power-of-two fixed-point encodings
//! - [`Cursor`] / [`Region`] / [`Memory`] — the size-then-place arena
//!   protocol over caller-provided byte blocks
//! - [`Error`] / [`Result`] — the single error type of the workspace

pub mod arena;
pub mod dtype;
pub mod error;
pub mod shape;
pub mod tensor;

pub use arena::{
    align_up, cast, cast_mut, disjoint_mut, region, region_mut, AlignedBuffer, Cursor, MemSpace,
    Memory, Region, ALIGN,
};
pub use dtype::{DType, Element, QuantParams};
pub use error::{Error, Result};
pub use shape::Shape;
pub use tensor::Tensor;
