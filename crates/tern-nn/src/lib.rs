//! # tern-nn
//!
//! Layers, losses, and math kernels for tern.
//!
//! Every graph node implements the [`Layer`] capability trait: required
//! hooks for shape inference and forward, defaulted hooks for everything a
//! layer may not have (parameters, backward, scratch, its own quantization
//! parameters). The planner and engine in the `tern` crate drive layers
//! exclusively through this surface.
//!
//! Provided layers: [`InputLayer`], [`Dense`] / [`DenseQ7`], [`ReLU`] /
//! [`ReLUQ7`], [`Sigmoid`], [`Tanh`], [`Softmax`], [`Flatten`],
//! [`BatchNorm`]. Losses: [`MseLoss`], [`CrossEntropyLoss`].

pub mod activation;
pub mod batchnorm;
pub mod dense;
pub mod flatten;
pub mod init;
pub mod input;
pub mod kernels;
pub mod layer;
pub mod loss;

pub use activation::{ReLU, ReLUQ7, Sigmoid, Softmax, Tanh};
pub use batchnorm::BatchNorm;
pub use dense::{Dense, DenseQ7};
pub use flatten::Flatten;
pub use input::InputLayer;
pub use layer::{io_f32, io_i8, quantize_tensor_symmetric, Layer, Settings};
pub use loss::{CrossEntropyLoss, Loss, MseLoss};
