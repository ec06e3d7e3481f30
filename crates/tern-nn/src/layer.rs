// Layer trait — the capability surface every graph node exposes
//
// The engine and the memory planner drive layers exclusively through this
// trait. Required methods cover what every node has (a type tag, settings,
// result and delta tensors, shape inference, a forward pass); everything
// else is a CAPABILITY with a default: a layer without trainable parameters
// simply leaves `param_mem_bytes` at 0 and the planner skips it, the same
// way the original design skipped null function pointers.
//
// TENSOR ALIASING CONTRACT (enforced by the planner, relied on here):
//
//   - `deltas` of layer i+1 and `result` of layer i are the same region,
//     unless layer i keeps its input buffer, in which case both alias the
//     input-side region.
//   - consequence for backward(): by the time layer i runs, its own result
//     region already holds the INCOMING delta (the next layer wrote it).
//     A backward pass must therefore derive everything it needs from its
//     INPUT activation (still intact) and must read that input completely
//     before overwriting the shared input/delta region with dL/dinput.

use rand::RngCore;
use tern_core::{Cursor, Error, Memory, QuantParams, Region, Result, Shape, Tensor};

// Settings — the per-layer flag register
//
// A u32 behind named accessors. Consumers never touch raw bits, so new
// flags can be added without breaking the layout contract.

/// Per-layer settings flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settings(u32);

impl Settings {
    const TRAINING: u32 = 1 << 0;
    const TRAINABLE: u32 = 1 << 1;
    const BATCH_MODE: u32 = 1 << 2;
    const NO_INPUT_GRADIENT: u32 = 1 << 3;
    const KEEP_INPUT_BUFFER: u32 = 1 << 4;

    /// Training mode: the layer is part of an active training session.
    pub fn training(&self) -> bool {
        self.0 & Self::TRAINING != 0
    }

    pub fn set_training(&mut self, on: bool) {
        self.set(Self::TRAINING, on);
    }

    /// Whether the optimizer updates this layer's parameters.
    pub fn trainable(&self) -> bool {
        self.0 & Self::TRAINABLE != 0
    }

    pub fn set_trainable(&mut self, on: bool) {
        self.set(Self::TRAINABLE, on);
    }

    /// The forward call sees the entire batch at once; layers that need
    /// whole-batch statistics may compute them exactly.
    pub fn batch_mode(&self) -> bool {
        self.0 & Self::BATCH_MODE != 0
    }

    pub fn set_batch_mode(&mut self, on: bool) {
        self.set(Self::BATCH_MODE, on);
    }

    /// No gradient with respect to this layer's input is needed (set on the
    /// first compute layer, whose input is the caller's read-only data).
    pub fn no_input_gradient(&self) -> bool {
        self.0 & Self::NO_INPUT_GRADIENT != 0
    }

    pub fn set_no_input_gradient(&mut self, on: bool) {
        self.set(Self::NO_INPUT_GRADIENT, on);
    }

    /// The layer's result aliases its input buffer instead of getting its
    /// own region (reshape-like layers).
    pub fn keep_input_buffer(&self) -> bool {
        self.0 & Self::KEEP_INPUT_BUFFER != 0
    }

    pub fn set_keep_input_buffer(&mut self, on: bool) {
        self.set(Self::KEEP_INPUT_BUFFER, on);
    }

    fn set(&mut self, bit: u32, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// The interface every layer in the chain implements.
pub trait Layer {
    /// Short identifier for error messages and logs.
    fn type_name(&self) -> &'static str;

    fn settings(&self) -> Settings;
    fn settings_mut(&mut self) -> &mut Settings;

    /// The layer's output tensor.
    fn result(&self) -> &Tensor;
    fn result_mut(&mut self) -> &mut Tensor;

    /// Gradient with respect to this layer's input.
    fn deltas(&self) -> &Tensor;
    fn deltas_mut(&mut self) -> &mut Tensor;

    /// Set the result shape from the input shape. Must be idempotent:
    /// running it twice with the same input yields the same result shape.
    fn infer_result_shape(&mut self, input_shape: &Shape) -> Result<()>;

    /// Whether this layer defines its own result quantization parameters
    /// (as opposed to having them calibrated from observed ranges).
    fn defines_result_qparams(&self) -> bool {
        false
    }

    /// Compute the layer-defined result quantization parameters into the
    /// planned block. Only called when `defines_result_qparams` is true.
    fn calc_result_qparams(&mut self, input: &Tensor, mem: &mut Memory) -> Result<()> {
        let _ = (input, mem);
        Ok(())
    }

    /// Bytes of parameter memory (weights, biases, their qparams blocks).
    fn param_mem_bytes(&self) -> usize {
        0
    }

    /// Bind parameter tensors into parameter memory. The cursor arithmetic
    /// must reserve exactly `param_mem_bytes` bytes.
    fn bind_param_mem(&mut self, cursor: &mut Cursor) {
        let _ = cursor;
    }

    /// Bytes of gradient storage needed during training.
    fn train_mem_bytes(&self) -> usize {
        0
    }

    /// Bind gradient tensors into training memory. Must mirror
    /// `train_mem_bytes` exactly.
    fn bind_train_mem(&mut self, cursor: &mut Cursor) {
        let _ = cursor;
    }

    /// Bytes of scratch needed by forward.
    fn fwd_scratch_bytes(&self) -> usize {
        0
    }

    /// Bytes of scratch needed by backward.
    fn bwd_scratch_bytes(&self) -> usize {
        0
    }

    /// Receive the shared scratch region (sized to the chain-wide maximum).
    fn bind_scratch(&mut self, region: Region) {
        let _ = region;
    }

    /// Trainable parameter tensors, in a fixed order.
    fn trainable_params(&self) -> Vec<&Tensor> {
        Vec::new()
    }

    /// Gradient tensors, index-parallel with `trainable_params`.
    fn gradients(&self) -> Vec<&Tensor> {
        Vec::new()
    }

    /// Optimizer-state regions, index-parallel with `trainable_params`.
    fn optimem(&self) -> &[Option<Region>] {
        &[]
    }

    fn optimem_mut(&mut self) -> &mut [Option<Region>] {
        &mut []
    }

    /// Whether the layer ships a weight-initialization scheme.
    fn has_init_params(&self) -> bool {
        false
    }

    /// Initialize parameter values (weight-init is a layer concern).
    fn init_params(&mut self, mem: &mut Memory, rng: &mut dyn RngCore) -> Result<()> {
        let _ = (mem, rng);
        Ok(())
    }

    /// One forward step over the bound memory. `input` is the previous
    /// layer's result (or the caller's input slice for the first layer).
    fn forward(&mut self, input: &Tensor, mem: &mut Memory) -> Result<()>;

    /// Whether the layer participates in training.
    fn has_backward(&self) -> bool {
        false
    }

    /// One backward step. `incoming` is dL/d(result), already seeded by the
    /// next layer (or the loss). Accumulates parameter gradients and, unless
    /// `no_input_gradient` is set, writes dL/d(input) into `deltas`.
    fn backward(&mut self, input: &Tensor, incoming: &Tensor, mem: &mut Memory) -> Result<()> {
        let _ = (input, incoming, mem);
        Err(Error::MissingBackward {
            layer: self.type_name(),
        })
    }

    /// Copy and quantize this layer's parameters from a structurally
    /// identical float layer. The default applies the generic symmetric
    /// min/max rule per parameter tensor; layers with a type-specific rule
    /// (dense: separate weight/bias widths) override it.
    fn quantize_params_from(
        &mut self,
        src: &dyn Layer,
        input_qp: Option<QuantParams>,
        src_mem: &Memory,
        mem: &mut Memory,
    ) -> Result<()> {
        let _ = input_qp;
        let src_params = src.trainable_params();
        let dst_params = self.trainable_params();
        if src_params.len() != dst_params.len() {
            return Err(Error::ElementCountMismatch {
                expected: dst_params.len(),
                got: src_params.len(),
            });
        }
        let pairs: Vec<(Tensor, Tensor)> = src_params
            .iter()
            .zip(dst_params.iter())
            .map(|(s, d)| ((*s).clone(), (*d).clone()))
            .collect();
        for (src_t, dst_t) in &pairs {
            quantize_tensor_symmetric(src_t, dst_t, src_mem, mem)?;
        }
        Ok(())
    }
}

// Forward I/O resolution
//
// A layer's input may live in working memory (previous layer's result) or in
// the caller's read-only input slice (first compute layer). These helpers do
// the split-borrow in one place so every layer's forward reads the same way.
// They take the memory FIELDS, not `&mut Memory`, so a layer can keep its
// parameter regions borrowed at the same time.

/// Resolve the forward pair as f32: `(input, result)`.
pub fn io_f32<'m>(
    work: &'m mut [u8],
    input_block: &'m [u8],
    input: &Tensor,
    result: &Tensor,
) -> Result<(&'m [f32], &'m mut [f32])> {
    use tern_core::arena::{cast, cast_mut, disjoint_mut, region, region_mut};
    use tern_core::MemSpace;

    let ir = input.data()?;
    let rr = result.data()?;
    if rr.space != MemSpace::Work {
        return Err(Error::msg("layer result must live in working memory"));
    }
    match ir.space {
        MemSpace::Input => {
            let x = cast::<f32>(region(input_block, &ir)?)?;
            let y = cast_mut::<f32>(region_mut(work, &rr)?)?;
            Ok((x, y))
        }
        MemSpace::Work => {
            let [y_b, x_b] = disjoint_mut(work, [rr, ir])?;
            Ok((cast::<f32>(&*x_b)?, cast_mut::<f32>(y_b)?))
        }
        _ => Err(Error::msg("layer input must live in input or working memory")),
    }
}

/// Resolve the forward pair as i8: `(input, result)`.
pub fn io_i8<'m>(
    work: &'m mut [u8],
    input_block: &'m [u8],
    input: &Tensor,
    result: &Tensor,
) -> Result<(&'m [i8], &'m mut [i8])> {
    use tern_core::arena::{cast, cast_mut, disjoint_mut, region, region_mut};
    use tern_core::MemSpace;

    let ir = input.data()?;
    let rr = result.data()?;
    if rr.space != MemSpace::Work {
        return Err(Error::msg("layer result must live in working memory"));
    }
    match ir.space {
        MemSpace::Input => {
            let x = cast::<i8>(region(input_block, &ir)?)?;
            let y = cast_mut::<i8>(region_mut(work, &rr)?)?;
            Ok((x, y))
        }
        MemSpace::Work => {
            let [y_b, x_b] = disjoint_mut(work, [rr, ir])?;
            Ok((cast::<i8>(&*x_b)?, cast_mut::<i8>(y_b)?))
        }
        _ => Err(Error::msg("layer input must live in input or working memory")),
    }
}

/// Generic symmetric f32 → q7 tensor quantization: derive the scale from the
/// largest magnitude, write the qparams block, then quantize every element.
pub fn quantize_tensor_symmetric(
    src: &Tensor,
    dst: &Tensor,
    src_mem: &Memory,
    mem: &mut Memory,
) -> Result<()> {
    let values = src.as_f32(src_mem)?;
    if values.len() != dst.elem_count() {
        return Err(Error::ElementCountMismatch {
            expected: dst.elem_count(),
            got: values.len(),
        });
    }
    let max_abs = values.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
    let qp = QuantParams::from_symmetric_max(max_abs);
    mem.set_qparams(dst.qparams_region()?, qp)?;

    let out = dst.as_i8_mut(mem)?;
    for (o, &v) in out.iter_mut().zip(values.iter()) {
        *o = qp.quantize_f32(v).clamp(i8::MIN as i32, i8::MAX as i32) as i8;
    }
    Ok(())
}
