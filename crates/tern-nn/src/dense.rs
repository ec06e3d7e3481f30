// Dense — fully connected layer, float and fixed-point variants
//
// Dense(units) transforms [N, in] to [N, units]:
//
//   y = x @ W + b        W: [in, units]   b: [units]
//
// The float variant is trainable; backward accumulates both parameter
// gradients BEFORE overwriting the shared input/delta region with
// dL/dinput (see the aliasing contract in layer.rs).
//
// The q7 variant is inference-only: i8 weights with a symmetric power-of-two
// scale, i32 bias carried at `input_shift + weight_shift` fractional bits so
// it adds straight into the accumulator, result rescaled by shift to its
// calibrated grid. Its quantization rule (weights → Q7, bias → Q31) is what
// the f32→q7 post-processor dispatches to.

use rand::RngCore;
use tern_core::arena::{cast, cast_mut, disjoint_mut, region};
use tern_core::{
    align_up, Cursor, DType, Error, MemSpace, Memory, QuantParams, Region, Result, Shape, Tensor,
};

use crate::init;
use crate::kernels;
use crate::layer::{io_f32, io_i8, Layer, Settings};

/// Fully connected layer, f32.
pub struct Dense {
    units: usize,
    in_features: usize,
    settings: Settings,
    result: Tensor,
    deltas: Tensor,
    weights: Tensor,
    bias: Tensor,
    weight_grad: Tensor,
    bias_grad: Tensor,
    optimem: [Option<Region>; 2],
}

impl Dense {
    pub fn new(units: usize) -> Self {
        let mut settings = Settings::default();
        settings.set_trainable(true);
        Dense {
            units,
            in_features: 0,
            settings,
            result: Tensor::unbound(DType::F32),
            deltas: Tensor::unbound(DType::F32),
            weights: Tensor::unbound(DType::F32),
            bias: Tensor::unbound(DType::F32),
            weight_grad: Tensor::unbound(DType::F32),
            bias_grad: Tensor::unbound(DType::F32),
            optimem: [None, None],
        }
    }

    pub fn units(&self) -> usize {
        self.units
    }

    pub fn weights(&self) -> &Tensor {
        &self.weights
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }
}

impl Layer for Dense {
    fn type_name(&self) -> &'static str {
        "dense"
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
        if input_shape.rank() != 2 {
            return Err(Error::msg(format!(
                "dense expects 2D input [batch, features], got {}",
                input_shape
            )));
        }
        let batch = input_shape.dim(0)?;
        let in_features = input_shape.dim(1)?;
        if self.in_features != 0 && self.in_features != in_features {
            return Err(Error::ShapeMismatch {
                expected: Shape::from((batch, self.in_features)),
                got: input_shape.clone(),
            });
        }
        self.in_features = in_features;
        self.weights.set_shape(Shape::from((in_features, self.units)));
        self.bias.set_shape(Shape::from(self.units));
        self.weight_grad.set_shape(Shape::from((in_features, self.units)));
        self.bias_grad.set_shape(Shape::from(self.units));
        self.result.set_shape(Shape::from((batch, self.units)));
        self.deltas.set_shape(input_shape.clone());
        Ok(())
    }

    fn param_mem_bytes(&self) -> usize {
        align_up(self.weights.byte_len()) + align_up(self.bias.byte_len())
    }

    fn bind_param_mem(&mut self, cursor: &mut Cursor) {
        self.weights.bind_data(cursor.reserve(self.weights.byte_len()));
        self.bias.bind_data(cursor.reserve(self.bias.byte_len()));
    }

    fn train_mem_bytes(&self) -> usize {
        align_up(self.weight_grad.byte_len()) + align_up(self.bias_grad.byte_len())
    }

    fn bind_train_mem(&mut self, cursor: &mut Cursor) {
        self.weight_grad
            .bind_data(cursor.reserve(self.weight_grad.byte_len()));
        self.bias_grad
            .bind_data(cursor.reserve(self.bias_grad.byte_len()));
    }

    fn trainable_params(&self) -> Vec<&Tensor> {
        vec![&self.weights, &self.bias]
    }

    fn gradients(&self) -> Vec<&Tensor> {
        vec![&self.weight_grad, &self.bias_grad]
    }

    fn optimem(&self) -> &[Option<Region>] {
        &self.optimem
    }

    fn optimem_mut(&mut self) -> &mut [Option<Region>] {
        &mut self.optimem
    }

    fn has_init_params(&self) -> bool {
        true
    }

    fn init_params(&mut self, mem: &mut Memory, rng: &mut dyn RngCore) -> Result<()> {
        let fan_in = self.in_features;
        let fan_out = self.units;
        init::glorot_uniform(self.weights.as_f32_mut(mem)?, fan_in, fan_out, rng);
        self.bias.as_f32_mut(mem)?.fill(0.0);
        Ok(())
    }

    fn forward(&mut self, input: &Tensor, mem: &mut Memory) -> Result<()> {
        let m = input.shape().dim(0)?;
        let (k, n) = (self.in_features, self.units);
        let w = cast::<f32>(region(mem.params, &self.weights.data()?)?)?;
        let b = cast::<f32>(region(mem.params, &self.bias.data()?)?)?;
        let (x, y) = io_f32(mem.work, mem.input, input, &self.result)?;
        kernels::matmul_bias(x, w, b, y, m, k, n);
        Ok(())
    }

    fn has_backward(&self) -> bool {
        true
    }

    fn backward(&mut self, input: &Tensor, incoming: &Tensor, mem: &mut Memory) -> Result<()> {
        let m = input.shape().dim(0)?;
        let (k, n) = (self.in_features, self.units);
        let w = cast::<f32>(region(mem.params, &self.weights.data()?)?)?;

        let gw_r = self.weight_grad.data()?;
        let gb_r = self.bias_grad.data()?;
        let dy_r = incoming.data()?;
        let x_r = input.data()?;

        if x_r.space == MemSpace::Input {
            // First compute layer: the input is caller data, no dL/dinput.
            let x = cast::<f32>(region(mem.input, &x_r)?)?;
            let [gw_b, gb_b, dy_b] = disjoint_mut(mem.work, [gw_r, gb_r, dy_r])?;
            let dy = cast::<f32>(&*dy_b)?;
            kernels::matmul_tn_acc(x, dy, cast_mut::<f32>(gw_b)?, m, k, n);
            kernels::col_sum_acc(dy, cast_mut::<f32>(gb_b)?, m, n);
            return Ok(());
        }

        debug_assert_eq!(self.deltas.data()?, x_r);
        let [gw_b, gb_b, dy_b, x_dx_b] = disjoint_mut(mem.work, [gw_r, gb_r, dy_r, x_r])?;
        let dy = cast::<f32>(&*dy_b)?;
        let x_dx = cast_mut::<f32>(x_dx_b)?;

        // Parameter gradients first: they read the input activation that the
        // delta write below destroys.
        kernels::matmul_tn_acc(x_dx, dy, cast_mut::<f32>(gw_b)?, m, k, n);
        kernels::col_sum_acc(dy, cast_mut::<f32>(gb_b)?, m, n);

        if !self.settings.no_input_gradient() {
            kernels::matmul_nt(dy, w, x_dx, m, n, k);
        }
        Ok(())
    }
}

// DenseQ7 — fixed-point dense, inference only

/// Fully connected layer over q7 data with a q31 bias.
pub struct DenseQ7 {
    units: usize,
    in_features: usize,
    settings: Settings,
    result: Tensor,
    deltas: Tensor,
    weights: Tensor,
    bias: Tensor,
}

impl DenseQ7 {
    pub fn new(units: usize) -> Self {
        DenseQ7 {
            units,
            in_features: 0,
            settings: Settings::default(),
            result: Tensor::unbound(DType::Q7),
            deltas: Tensor::unbound(DType::Q7),
            weights: Tensor::unbound(DType::Q7),
            bias: Tensor::unbound(DType::Q31),
        }
    }

    pub fn units(&self) -> usize {
        self.units
    }

    pub fn weights(&self) -> &Tensor {
        &self.weights
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }
}

impl Layer for DenseQ7 {
    fn type_name(&self) -> &'static str {
        "dense"
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
        if input_shape.rank() != 2 {
            return Err(Error::msg(format!(
                "dense expects 2D input [batch, features], got {}",
                input_shape
            )));
        }
        let batch = input_shape.dim(0)?;
        let in_features = input_shape.dim(1)?;
        if self.in_features != 0 && self.in_features != in_features {
            return Err(Error::ShapeMismatch {
                expected: Shape::from((batch, self.in_features)),
                got: input_shape.clone(),
            });
        }
        self.in_features = in_features;
        self.weights.set_shape(Shape::from((in_features, self.units)));
        self.bias.set_shape(Shape::from(self.units));
        self.result.set_shape(Shape::from((batch, self.units)));
        self.deltas.set_shape(input_shape.clone());
        Ok(())
    }

    fn param_mem_bytes(&self) -> usize {
        let qp = std::mem::size_of::<QuantParams>();
        align_up(qp) + align_up(self.weights.byte_len()) + align_up(qp) + align_up(self.bias.byte_len())
    }

    fn bind_param_mem(&mut self, cursor: &mut Cursor) {
        let qp = std::mem::size_of::<QuantParams>();
        self.weights.bind_qparams(cursor.reserve(qp));
        self.weights.bind_data(cursor.reserve(self.weights.byte_len()));
        self.bias.bind_qparams(cursor.reserve(qp));
        self.bias.bind_data(cursor.reserve(self.bias.byte_len()));
    }

    fn trainable_params(&self) -> Vec<&Tensor> {
        vec![&self.weights, &self.bias]
    }

    fn forward(&mut self, input: &Tensor, mem: &mut Memory) -> Result<()> {
        let m = input.shape().dim(0)?;
        let (k, n) = (self.in_features, self.units);
        let qx = input.quant_params(mem)?;
        let qw = self.weights.quant_params(mem)?;
        let qy = self.result.quant_params(mem)?;
        let w = cast::<i8>(region(mem.params, &self.weights.data()?)?)?;
        let b = cast::<i32>(region(mem.params, &self.bias.data()?)?)?;
        let (x, y) = io_i8(mem.work, mem.input, input, &self.result)?;
        kernels::dense_q7(x, qx, w, qw.shift, b, y, qy, m, k, n);
        Ok(())
    }

    fn quantize_params_from(
        &mut self,
        src: &dyn Layer,
        input_qp: Option<QuantParams>,
        src_mem: &Memory,
        mem: &mut Memory,
    ) -> Result<()> {
        let input_qp = input_qp
            .ok_or_else(|| Error::msg("dense q7 quantization needs the input's qparams"))?;
        let src_params = src.trainable_params();
        if src_params.len() != 2 {
            return Err(Error::ElementCountMismatch {
                expected: 2,
                got: src_params.len(),
            });
        }
        let w_f32 = src_params[0].as_f32(src_mem)?.to_vec();
        let b_f32 = src_params[1].as_f32(src_mem)?.to_vec();

        // Weights: symmetric q7 from the largest magnitude.
        let max_abs = w_f32.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
        let qw = QuantParams::from_symmetric_max(max_abs);
        mem.set_qparams(self.weights.qparams_region()?, qw)?;
        let w_out = self.weights.as_i8_mut(mem)?;
        for (o, &v) in w_out.iter_mut().zip(w_f32.iter()) {
            *o = qw.quantize_f32(v).clamp(i8::MIN as i32, i8::MAX as i32) as i8;
        }

        // Bias: q31 at the accumulator's fractional width, so the forward
        // pass adds it without any extra shift.
        let qb = QuantParams {
            shift: input_qp.shift + qw.shift,
            zero: 0,
        };
        mem.set_qparams(self.bias.qparams_region()?, qb)?;
        let b_out = self.bias.as_i32_mut(mem)?;
        for (o, &v) in b_out.iter_mut().zip(b_f32.iter()) {
            let q = (v * (1u64 << qb.shift) as f32).round();
            *o = q.clamp(i32::MIN as f32, i32::MAX as f32) as i32;
        }
        Ok(())
    }
}
