// Input layer — the head of every chain
//
// Holds the micro-batch shape the model was configured for. Its result is
// bound by the engine to the caller's input slice on every call (no copy);
// forward is a no-op and the layer never produces gradients.

use tern_core::{DType, Memory, Result, Shape, Tensor};

use crate::layer::{Layer, Settings};

/// The chain's input node.
pub struct InputLayer {
    settings: Settings,
    result: Tensor,
    deltas: Tensor,
}

impl InputLayer {
    /// `shape` is the micro-batch shape, `[slice_size, features...]` — the
    /// number of samples one forward call processes.
    pub fn new(dtype: DType, shape: impl Into<Shape>) -> Self {
        InputLayer {
            settings: Settings::default(),
            result: Tensor::new(dtype, shape.into()),
            deltas: Tensor::unbound(dtype),
        }
    }

    /// Samples per forward call (the leading dimension).
    pub fn slice_size(&self) -> Result<usize> {
        self.result.shape().dim(0)
    }
}

impl Layer for InputLayer {
    fn type_name(&self) -> &'static str {
        "input"
    }

    fn settings(&self) -> Settings {
        self.settings
    }

    fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    fn result(&self) -> &Tensor {
        &self.result
    }

    fn result_mut(&mut self) -> &mut Tensor {
        &mut self.result
    }

    fn deltas(&self) -> &Tensor {
        &self.deltas
    }

    fn deltas_mut(&mut self) -> &mut Tensor {
        &mut self.deltas
    }

    fn infer_result_shape(&mut self, _input_shape: &Shape) -> Result<()> {
        // The input layer's shape is configuration, not inference.
        Ok(())
    }

    fn forward(&mut self, _input: &Tensor, _mem: &mut Memory) -> Result<()> {
        Ok(())
    }
}
