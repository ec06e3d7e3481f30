// Quantization post-processor — calibrate a q7 model from its f32 twin
//
// One-shot batch calibration, not an online process:
//
//   1. Forward the float model over a representative dataset, tracking the
//      running min/max of every layer's activation (the input layer's
//      "activation" is the raw data itself).
//   2. For every fixed-point layer whose result grid is NOT layer-defined,
//      derive it from the observed range with a 10% symmetric margin.
//   3. For layers that DO define their grid, invoke that computation, in
//      chain order so each sees its input's finished parameters.
//   4. Copy/quantize every trainable parameter tensor through the layer's
//      own rule (dense: weights → q7, bias → q31 at the accumulator width)
//      or the generic symmetric rule.
//
// Preconditions: both models compiled, the float model's parameter and
// inference memory scheduled and its weights loaded, the q7 model's
// parameter and inference memory scheduled.

use tern_core::{Error, MemSpace, Memory, QuantParams, Region, Result};

use crate::model::Model;

/// Running value range of one activation tensor.
#[derive(Debug, Clone, Copy)]
struct ValueRange {
    min: f32,
    max: f32,
}

impl ValueRange {
    fn empty() -> Self {
        ValueRange {
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
        }
    }

    fn update(&mut self, values: &[f32]) {
        for &v in values {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
    }

    /// Expand symmetrically around the midpoint by the calibration margin.
    fn with_margin(&self, margin: f32) -> (f32, f32) {
        let mid = (self.min + self.max) * 0.5;
        let half = (self.max - self.min) * 0.5 * (1.0 + margin);
        (mid - half, mid + half)
    }
}

const CALIBRATION_MARGIN: f32 = 0.1;

/// Calibrate `q7_model` against `f32_model` over `samples` rows of the
/// representative dataset attached to `f32_mem.input`.
pub fn quantize_model_f32_to_q7(
    f32_model: &mut Model,
    q7_model: &mut Model,
    f32_mem: &mut Memory,
    q7_mem: &mut Memory,
    samples: usize,
) -> Result<()> {
    f32_model.check_compiled()?;
    q7_model.check_compiled()?;
    let layer_count = f32_model.layer_count();
    if layer_count != q7_model.layer_count() {
        return Err(Error::msg(format!(
            "model structure mismatch: {} layers vs {}",
            layer_count,
            q7_model.layer_count()
        )));
    }
    for (f, q) in f32_model.layers().iter().zip(q7_model.layers().iter()) {
        if f.type_name() != q.type_name() {
            return Err(Error::msg(format!(
                "model structure mismatch: layer '{}' vs '{}'",
                f.type_name(),
                q.type_name()
            )));
        }
    }

    // Pass 1: observe activation ranges on the float model.
    let slice = f32_model.input_slice_size()?;
    if samples == 0 || samples % slice != 0 {
        return Err(Error::BatchSizeMismatch {
            batch_size: samples,
            slice_size: slice,
        });
    }
    let mut ranges = vec![ValueRange::empty(); layer_count];
    let in_bytes = f32_model.input_sample_bytes()?;
    let micro_bytes = slice * in_bytes;
    let mut start = 0;
    while start < samples {
        // Reslice so the walk sees exactly one micro-batch.
        let mut step_mem = Memory {
            params: &mut *f32_mem.params,
            work: &mut *f32_mem.work,
            input: &f32_mem.input[start * in_bytes..start * in_bytes + micro_bytes],
            target: &[],
        };
        // Read each result right after its layer runs: inference memory
        // ping-pongs activations, so a result only survives one step.
        f32_model.layers_mut()[0]
            .result_mut()
            .bind_data(Region::new(MemSpace::Input, 0, micro_bytes));
        ranges[0].update(f32_model.layers()[0].result().as_f32(&step_mem)?);
        for i in 1..layer_count {
            let input = f32_model.layers()[i - 1].result().clone();
            f32_model.layers_mut()[i].forward(&input, &mut step_mem)?;
            ranges[i].update(f32_model.layers()[i].result().as_f32(&step_mem)?);
        }
        start += slice;
    }

    // Passes 2+3: assign result grids in chain order, calibrated or
    // layer-defined.
    for i in 0..layer_count {
        if !q7_model.layers()[i].result().dtype().is_quantized() {
            continue;
        }
        if q7_model.layers()[i].defines_result_qparams() {
            if i == 0 {
                continue;
            }
            let input = q7_model.layers()[i - 1].result().clone();
            q7_model.layers_mut()[i].calc_result_qparams(&input, q7_mem)?;
        } else {
            let (min, max) = ranges[i].with_margin(CALIBRATION_MARGIN);
            let qp = QuantParams::from_range(min, max);
            let region = q7_model.layers()[i].result().qparams_region()?;
            q7_mem.set_qparams(region, qp)?;
        }
    }

    // Pass 4: copy and quantize the trainable parameters, layer rule first.
    for i in 1..layer_count {
        if q7_model.layers()[i].trainable_params().is_empty() {
            continue;
        }
        let input_qp = {
            let prev = q7_model.layers()[i - 1].result();
            if prev.dtype().is_quantized() {
                Some(prev.quant_params(q7_mem)?)
            } else {
                None
            }
        };
        let src = f32_model.layers()[i].as_ref();
        q7_model.layers_mut()[i].quantize_params_from(src, input_qp, f32_mem, q7_mem)?;
    }
    Ok(())
}
