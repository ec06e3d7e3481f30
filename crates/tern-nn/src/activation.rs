// Activation layers — elementwise nonlinearities, float and q7
//
// None of these own parameters; their memory footprint is the result buffer
// the planner gives them. Backward passes recompute the derivative from the
// INPUT activation (the layer's own result holds the incoming delta by then)
// and write dL/dinput in place over the shared input/delta region.
//
// Softmax is the exception twice over: it normalizes rows rather than
// mapping elements, and its backward passes the incoming delta through
// unchanged — it is only trainable in front of cross-entropy, which emits
// the combined softmax+CE gradient.

use tern_core::arena::{cast_mut, disjoint_mut};
use tern_core::{DType, Error, MemSpace, Memory, Result, Shape, Tensor};

use crate::kernels;
use crate::layer::{io_f32, io_i8, Layer, Settings};

macro_rules! layer_plumbing {
    () => {
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
            self.result.set_shape(input_shape.clone());
            self.deltas.set_shape(input_shape.clone());
            Ok(())
        }
    };
}

/// In-place elementwise backward over the shared input/delta region.
fn elementwise_backward(
    input: &Tensor,
    incoming: &Tensor,
    mem: &mut Memory,
    skip: bool,
    bwd: fn(&mut [f32], &[f32]),
) -> Result<()> {
    if skip {
        return Ok(());
    }
    let x_r = input.data()?;
    let dy_r = incoming.data()?;
    if x_r.space != MemSpace::Work {
        return Err(Error::msg(
            "activation backward over read-only input; set no_input_gradient",
        ));
    }
    let [x_b, dy_b] = disjoint_mut(mem.work, [x_r, dy_r])?;
    let dy: &[f32] = tern_core::cast(&*dy_b)?;
    bwd(cast_mut::<f32>(x_b)?, dy);
    Ok(())
}

/// Rectified linear unit, f32.
pub struct ReLU {
    settings: Settings,
    result: Tensor,
    deltas: Tensor,
}

impl ReLU {
    pub fn new() -> Self {
        ReLU {
            settings: Settings::default(),
            result: Tensor::unbound(DType::F32),
            deltas: Tensor::unbound(DType::F32),
        }
    }
}

impl Default for ReLU {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for ReLU {
    fn type_name(&self) -> &'static str {
        "relu"
    }

    layer_plumbing!();

    fn forward(&mut self, input: &Tensor, mem: &mut Memory) -> Result<()> {
        let (x, y) = io_f32(mem.work, mem.input, input, &self.result)?;
        kernels::relu(x, y);
        Ok(())
    }

    fn has_backward(&self) -> bool {
        true
    }

    fn backward(&mut self, input: &Tensor, incoming: &Tensor, mem: &mut Memory) -> Result<()> {
        let skip = self.settings.no_input_gradient();
        elementwise_backward(input, incoming, mem, skip, kernels::relu_bwd_inplace)
    }
}

/// Logistic sigmoid, f32.
pub struct Sigmoid {
    settings: Settings,
    result: Tensor,
    deltas: Tensor,
}

impl Sigmoid {
    pub fn new() -> Self {
        Sigmoid {
            settings: Settings::default(),
            result: Tensor::unbound(DType::F32),
            deltas: Tensor::unbound(DType::F32),
        }
    }
}

impl Default for Sigmoid {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for Sigmoid {
    fn type_name(&self) -> &'static str {
        "sigmoid"
    }

    layer_plumbing!();

    fn forward(&mut self, input: &Tensor, mem: &mut Memory) -> Result<()> {
        let (x, y) = io_f32(mem.work, mem.input, input, &self.result)?;
        kernels::sigmoid(x, y);
        Ok(())
    }

    fn has_backward(&self) -> bool {
        true
    }

    fn backward(&mut self, input: &Tensor, incoming: &Tensor, mem: &mut Memory) -> Result<()> {
        let skip = self.settings.no_input_gradient();
        elementwise_backward(input, incoming, mem, skip, kernels::sigmoid_bwd_inplace)
    }
}

/// Hyperbolic tangent, f32.
pub struct Tanh {
    settings: Settings,
    result: Tensor,
    deltas: Tensor,
}

impl Tanh {
    pub fn new() -> Self {
        Tanh {
            settings: Settings::default(),
            result: Tensor::unbound(DType::F32),
            deltas: Tensor::unbound(DType::F32),
        }
    }
}

impl Default for Tanh {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for Tanh {
    fn type_name(&self) -> &'static str {
        "tanh"
    }

    layer_plumbing!();

    fn forward(&mut self, input: &Tensor, mem: &mut Memory) -> Result<()> {
        let (x, y) = io_f32(mem.work, mem.input, input, &self.result)?;
        kernels::tanh(x, y);
        Ok(())
    }

    fn has_backward(&self) -> bool {
        true
    }

    fn backward(&mut self, input: &Tensor, incoming: &Tensor, mem: &mut Memory) -> Result<()> {
        let skip = self.settings.no_input_gradient();
        elementwise_backward(input, incoming, mem, skip, kernels::tanh_bwd_inplace)
    }
}

/// Row-wise softmax over the last dimension, f32.
pub struct Softmax {
    settings: Settings,
    result: Tensor,
    deltas: Tensor,
}

impl Softmax {
    pub fn new() -> Self {
        Softmax {
            settings: Settings::default(),
            result: Tensor::unbound(DType::F32),
            deltas: Tensor::unbound(DType::F32),
        }
    }
}

impl Default for Softmax {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for Softmax {
    fn type_name(&self) -> &'static str {
        "softmax"
    }

    layer_plumbing!();

    fn forward(&mut self, input: &Tensor, mem: &mut Memory) -> Result<()> {
        let shape = input.shape();
        if shape.rank() == 0 {
            return Err(Error::msg("softmax needs at least one dimension"));
        }
        let cols = shape.dim(shape.rank() - 1)?;
        let rows = shape.elem_count() / cols;
        let (x, y) = io_f32(mem.work, mem.input, input, &self.result)?;
        kernels::softmax_rows(x, y, rows, cols);
        Ok(())
    }

    fn has_backward(&self) -> bool {
        true
    }

    fn backward(&mut self, input: &Tensor, incoming: &Tensor, mem: &mut Memory) -> Result<()> {
        // Pass-through: cross-entropy already emitted the combined gradient.
        let skip = self.settings.no_input_gradient();
        elementwise_backward(input, incoming, mem, skip, |x_dx, dy| {
            x_dx.copy_from_slice(dy)
        })
    }
}

/// Rectified linear unit over q7 data.
///
/// Defines its own result quantization parameters: clamping at the zero
/// point does not change the value range, so the input's grid is reused.
pub struct ReLUQ7 {
    settings: Settings,
    result: Tensor,
    deltas: Tensor,
}

impl ReLUQ7 {
    pub fn new() -> Self {
        ReLUQ7 {
            settings: Settings::default(),
            result: Tensor::unbound(DType::Q7),
            deltas: Tensor::unbound(DType::Q7),
        }
    }
}

impl Default for ReLUQ7 {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer for ReLUQ7 {
    fn type_name(&self) -> &'static str {
        "relu"
    }

    layer_plumbing!();

    fn defines_result_qparams(&self) -> bool {
        true
    }

    fn calc_result_qparams(&mut self, input: &Tensor, mem: &mut Memory) -> Result<()> {
        let qp = input.quant_params(mem)?;
        mem.set_qparams(self.result.qparams_region()?, qp)
    }

    fn forward(&mut self, input: &Tensor, mem: &mut Memory) -> Result<()> {
        let zero = input.quant_params(mem)?.zero;
        let (x, y) = io_i8(mem.work, mem.input, input, &self.result)?;
        kernels::relu_q7(x, zero, y);
        Ok(())
    }
}
