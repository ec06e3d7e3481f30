// Loss functions — the terminal node of a training chain
//
// A loss wraps the delta sink for the true output layer: `calc_delta` seeds
// dL/d(output) into a tensor whose region the training-memory planner
// aliases onto the output layer's result. Elementwise losses make that
// aliasing safe by construction — each delta element depends only on the
// prediction element it overwrites (and the target).
//
// MSE:           L = Σ (y - t)²            dL/dy = 2 (y - t)
// Cross-entropy: L = -Σ t · ln(y)          dL/dz = y - t
//
// Cross-entropy expects the model to end in softmax and emits the COMBINED
// softmax+CE gradient with respect to the softmax input; the softmax layer
// passes it through unchanged.

use tern_core::arena::{cast, cast_mut, region, region_mut};
use tern_core::{DType, Error, Memory, Region, Result, Shape, Tensor};

/// The interface every loss implements.
pub trait Loss {
    /// Short identifier for error messages and logs.
    fn type_name(&self) -> &'static str;

    /// The terminal delta sink; the planner binds its region onto the
    /// output layer's result.
    fn deltas(&self) -> &Tensor;

    fn deltas_mut(&mut self) -> &mut Tensor;

    /// Size the delta sink to the model's output shape.
    fn infer_shape(&mut self, output_shape: &Shape, dtype: DType) -> Result<()>;

    /// Loss value for one micro-batch. `target` addresses the caller's
    /// target slice for this batch.
    fn calc_loss(&self, prediction: &Tensor, target: Region, mem: &Memory) -> Result<f32>;

    /// Seed the terminal delta for one micro-batch.
    fn calc_delta(&mut self, prediction: &Tensor, target: Region, mem: &mut Memory) -> Result<()>;
}

fn check_f32(dtype: DType) -> Result<()> {
    if dtype != DType::F32 {
        return Err(Error::DTypeMismatch {
            expected: DType::F32,
            got: dtype,
        });
    }
    Ok(())
}

/// Sum-of-squares loss.
pub struct MseLoss {
    deltas: Tensor,
}

impl MseLoss {
    pub fn new() -> Self {
        MseLoss {
            deltas: Tensor::unbound(DType::F32),
        }
    }
}

impl Default for MseLoss {
    fn default() -> Self {
        Self::new()
    }
}

impl Loss for MseLoss {
    fn type_name(&self) -> &'static str {
        "mse"
    }

    fn deltas(&self) -> &Tensor {
        &self.deltas
    }

    fn deltas_mut(&mut self) -> &mut Tensor {
        &mut self.deltas
    }

    fn infer_shape(&mut self, output_shape: &Shape, dtype: DType) -> Result<()> {
        check_f32(dtype)?;
        self.deltas.set_shape(output_shape.clone());
        Ok(())
    }

    fn calc_loss(&self, prediction: &Tensor, target: Region, mem: &Memory) -> Result<f32> {
        let y = prediction.as_f32(mem)?;
        let t = cast::<f32>(mem.bytes(target)?)?;
        if y.len() != t.len() {
            return Err(Error::ElementCountMismatch {
                expected: y.len(),
                got: t.len(),
            });
        }
        Ok(y.iter()
            .zip(t.iter())
            .map(|(&y, &t)| (y - t) * (y - t))
            .sum())
    }

    fn calc_delta(&mut self, prediction: &Tensor, target: Region, mem: &mut Memory) -> Result<()> {
        // The delta region aliases the prediction, so `d` reads as y and is
        // overwritten element by element.
        debug_assert_eq!(self.deltas.data()?, prediction.data()?);
        let _ = prediction;
        let d = cast_mut::<f32>(region_mut(mem.work, &self.deltas.data()?)?)?;
        let t = cast::<f32>(region(mem.target, &target)?)?;
        if d.len() != t.len() {
            return Err(Error::ElementCountMismatch {
                expected: d.len(),
                got: t.len(),
            });
        }
        for (d, &t) in d.iter_mut().zip(t.iter()) {
            *d = 2.0 * (*d - t);
        }
        Ok(())
    }
}

/// Categorical cross-entropy against one-hot targets, paired with softmax.
pub struct CrossEntropyLoss {
    deltas: Tensor,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        CrossEntropyLoss {
            deltas: Tensor::unbound(DType::F32),
        }
    }
}

impl Default for CrossEntropyLoss {
    fn default() -> Self {
        Self::new()
    }
}

impl Loss for CrossEntropyLoss {
    fn type_name(&self) -> &'static str {
        "cross_entropy"
    }

    fn deltas(&self) -> &Tensor {
        &self.deltas
    }

    fn deltas_mut(&mut self) -> &mut Tensor {
        &mut self.deltas
    }

    fn infer_shape(&mut self, output_shape: &Shape, dtype: DType) -> Result<()> {
        check_f32(dtype)?;
        self.deltas.set_shape(output_shape.clone());
        Ok(())
    }

    fn calc_loss(&self, prediction: &Tensor, target: Region, mem: &Memory) -> Result<f32> {
        let y = prediction.as_f32(mem)?;
        let t = cast::<f32>(mem.bytes(target)?)?;
        if y.len() != t.len() {
            return Err(Error::ElementCountMismatch {
                expected: y.len(),
                got: t.len(),
            });
        }
        // Clamp away log(0); a softmax output can underflow to zero.
        Ok(-y
            .iter()
            .zip(t.iter())
            .map(|(&y, &t)| t * y.max(1e-7).ln())
            .sum::<f32>())
    }

    fn calc_delta(&mut self, prediction: &Tensor, target: Region, mem: &mut Memory) -> Result<()> {
        debug_assert_eq!(self.deltas.data()?, prediction.data()?);
        let _ = prediction;
        let d = cast_mut::<f32>(region_mut(mem.work, &self.deltas.data()?)?)?;
        let t = cast::<f32>(region(mem.target, &target)?)?;
        if d.len() != t.len() {
            return Err(Error::ElementCountMismatch {
                expected: d.len(),
                got: t.len(),
            });
        }
        for (d, &t) in d.iter_mut().zip(t.iter()) {
            *d -= t;
        }
        Ok(())
    }
}
