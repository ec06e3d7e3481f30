//! # tern
//!
//! Memory-planned neural network training and inference for
//! microcontroller-class targets.
//!
//! The whole working set of a model lives in caller-provided byte blocks,
//! carved up ahead of time by a size-then-place planner; the execution
//! engine then drives forward, backward, and optimizer updates over the
//! bound regions without ever allocating. Single-threaded by design — the
//! target has no scheduler to hand work to.
//!
//! ## Usage
//!
//! ```ignore
//! use tern::prelude::*;
//!
//! let mut model = Model::new()
//!     .add(InputLayer::new(DType::F32, (1, 4)))
//!     .add(Dense::new(3))
//!     .add(Sigmoid::new())
//!     .add(Dense::new(1))
//!     .with_loss(MseLoss::new());
//! model.compile()?;
//!
//! let mut params = AlignedBuffer::new(parameter_memory_size(&model)?);
//! distribute_parameter_memory(&mut model, params.len())?;
//!
//! let mut opt = Sgd::new(0.1);
//! let mut work = AlignedBuffer::new(training_memory_size(&model, &opt)?);
//! schedule_training_memory(&mut model, &opt, work.len())?;
//!
//! let mut mem = Memory::new(params.as_mut_slice(), work.as_mut_slice())?
//!     .with_input(input_bytes)
//!     .with_target(target_bytes);
//! model.init_params(&mut mem, &mut rng)?;
//! model.init_optimizer_state(&opt, &mut mem)?;
//! model.train(&mut mem, samples, batch_size, &mut opt)?;
//! ```
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `tern-core`  | Tensor views, Shape, DType/QuantParams, arena planning |
//! | `tern-nn`    | Layer trait, concrete layers, losses, math kernels |
//! | `tern-optim` | Optimizers over planner-provided state memory |
//! | `tern`       | Model, graph compiler, memory planner, engine, quantizer |

/// Re-export core types.
pub use tern_core::{
    AlignedBuffer, Cursor, DType, Error, MemSpace, Memory, QuantParams, Region, Result, Shape,
    Tensor, ALIGN,
};

/// Re-export neural network building blocks.
pub mod nn {
    pub use tern_nn::*;
}

/// Re-export optimizers.
pub mod optim {
    pub use tern_optim::*;
}

/// Model and graph compiler.
pub mod model;

/// Memory planner — the three size/place pairs.
pub mod planner;

/// Execution engine (implemented as methods on [`Model`]).
pub mod exec;

/// f32 → q7 quantization post-processor.
pub mod quantize;

pub use model::{Model, MAX_CHAIN_LEN};
pub use planner::{
    distribute_parameter_memory, inference_memory_size, parameter_memory_size,
    schedule_inference_memory, schedule_training_memory, training_memory_size,
};
pub use quantize::quantize_model_f32_to_q7;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::model::Model;
    pub use crate::nn::{
        BatchNorm, CrossEntropyLoss, Dense, DenseQ7, Flatten, InputLayer, Layer, Loss, MseLoss,
        ReLU, ReLUQ7, Settings, Sigmoid, Softmax, Tanh,
    };
    pub use crate::optim::{Adam, Optimizer, Sgd};
    pub use crate::planner::{
        distribute_parameter_memory, inference_memory_size, parameter_memory_size,
        schedule_inference_memory, schedule_training_memory, training_memory_size,
    };
    pub use crate::quantize::quantize_model_f32_to_q7;
    pub use crate::{AlignedBuffer, DType, Error, MemSpace, Memory, QuantParams, Region, Shape};
}
