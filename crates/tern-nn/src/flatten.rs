// Flatten — collapse everything after the batch dimension into one
//
// A pure view change: the layer keeps its input buffer, so the planner
// allocates nothing for it and the result region is re-bound to the input's
// region on every forward call. Backward is a no-op for the same reason —
// the incoming delta already sits in the region the upstream layer will
// read it from.

use tern_core::{DType, Memory, Result, Shape, Tensor};

use crate::layer::{Layer, Settings};

/// Flatten: `[N, d1, d2, ...]` → `[N, d1*d2*...]` without copying.
pub struct Flatten {
    settings: Settings,
    result: Tensor,
    deltas: Tensor,
}

impl Flatten {
    pub fn new(dtype: DType) -> Self {
        let mut settings = Settings::default();
        settings.set_keep_input_buffer(true);
        Flatten {
            settings,
            result: Tensor::unbound(dtype),
            deltas: Tensor::unbound(dtype),
        }
    }
}

impl Layer for Flatten {
    fn type_name(&self) -> &'static str {
        "flatten"
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

    fn infer_result_shape(&mut self, input_shape: &Shape) -> Result<()> {
        let batch = input_shape.dim(0)?;
        let flat = input_shape.elems_per_sample();
        self.result.set_shape(Shape::from((batch, flat)));
        self.deltas.set_shape(input_shape.clone());
        Ok(())
    }

    fn forward(&mut self, input: &Tensor, mem: &mut Memory) -> Result<()> {
        // Alias the input buffer; nothing moves.
        self.result.bind_data(input.data()?);
        if input.has_qparams() {
            self.result.bind_qparams(input.qparams_region()?);
        }
        let _ = mem;
        Ok(())
    }

    fn has_backward(&self) -> bool {
        true
    }

    fn backward(&mut self, _input: &Tensor, _incoming: &Tensor, _mem: &mut Memory) -> Result<()> {
        // The delta already lives in the aliased region; only the shape
        // differs, and shapes are descriptor state, not memory.
        Ok(())
    }
}
