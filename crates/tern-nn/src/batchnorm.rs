// BatchNorm — per-feature batch normalization over [N, F]
//
//   x̂ = (x - mean) / sqrt(var + ε)
//   y = γ·x̂ + β
//
// Statistics: in training mode the layer computes the mean/variance of the
// batch it was handed and folds them into the running estimates. The
// BATCH_MODE settings bit tells it that this forward call sees the ENTIRE
// macro-batch, so those statistics are exact and are used directly for
// normalization; without it the (already updated) running estimates are
// used. In eval mode only the running estimates are read. Training this
// layer therefore wants batch_mode — the engine sets it when the requested
// batch size equals the input micro-batch size.
//
// The running mean/variance are parameter-memory state but NOT trainable:
// they are absent from `trainable_params`, so the optimizer never sees them.
// Backward recomputes the batch statistics from the (persisted) input
// activation; per-feature reductions live in the shared scratch slot.

use rand::RngCore;
use tern_core::arena::{cast, cast_mut, disjoint_mut, region};
use tern_core::{
    align_up, Cursor, DType, Error, MemSpace, Memory, Region, Result, Shape, Tensor,
};

use crate::layer::{Layer, Settings};

/// Batch normalization over the feature axis of `[N, F]` input.
pub struct BatchNorm {
    features: usize,
    eps: f32,
    /// EMA factor for the running statistics.
    momentum: f32,
    settings: Settings,
    result: Tensor,
    deltas: Tensor,
    gamma: Tensor,
    beta: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
    gamma_grad: Tensor,
    beta_grad: Tensor,
    optimem: [Option<Region>; 2],
    scratch: Option<Region>,
}

impl BatchNorm {
    pub fn new(eps: f32, momentum: f32) -> Self {
        let mut settings = Settings::default();
        settings.set_trainable(true);
        BatchNorm {
            features: 0,
            eps,
            momentum,
            settings,
            result: Tensor::unbound(DType::F32),
            deltas: Tensor::unbound(DType::F32),
            gamma: Tensor::unbound(DType::F32),
            beta: Tensor::unbound(DType::F32),
            running_mean: Tensor::unbound(DType::F32),
            running_var: Tensor::unbound(DType::F32),
            gamma_grad: Tensor::unbound(DType::F32),
            beta_grad: Tensor::unbound(DType::F32),
            optimem: [None, None],
            scratch: None,
        }
    }

    fn feature_bytes(&self) -> usize {
        self.features * std::mem::size_of::<f32>()
    }
}

impl Layer for BatchNorm {
    fn type_name(&self) -> &'static str {
        "batch_norm"
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
                "batch_norm expects 2D input [batch, features], got {}",
                input_shape
            )));
        }
        let features = input_shape.dim(1)?;
        if self.features != 0 && self.features != features {
            return Err(Error::ShapeMismatch {
                expected: Shape::from((input_shape.dim(0)?, self.features)),
                got: input_shape.clone(),
            });
        }
        self.features = features;
        for t in [
            &mut self.gamma,
            &mut self.beta,
            &mut self.running_mean,
            &mut self.running_var,
            &mut self.gamma_grad,
            &mut self.beta_grad,
        ] {
            t.set_shape(Shape::from(features));
        }
        self.result.set_shape(input_shape.clone());
        self.deltas.set_shape(input_shape.clone());
        Ok(())
    }

    fn param_mem_bytes(&self) -> usize {
        4 * align_up(self.feature_bytes())
    }

    fn bind_param_mem(&mut self, cursor: &mut Cursor) {
        let bytes = self.feature_bytes();
        self.gamma.bind_data(cursor.reserve(bytes));
        self.beta.bind_data(cursor.reserve(bytes));
        self.running_mean.bind_data(cursor.reserve(bytes));
        self.running_var.bind_data(cursor.reserve(bytes));
    }

    fn train_mem_bytes(&self) -> usize {
        2 * align_up(self.feature_bytes())
    }

    fn bind_train_mem(&mut self, cursor: &mut Cursor) {
        let bytes = self.feature_bytes();
        self.gamma_grad.bind_data(cursor.reserve(bytes));
        self.beta_grad.bind_data(cursor.reserve(bytes));
    }

    fn fwd_scratch_bytes(&self) -> usize {
        // Batch mean and variance, one f32 per feature each.
        2 * self.feature_bytes()
    }

    fn bwd_scratch_bytes(&self) -> usize {
        // Mean, variance, Σdy, Σdy·x̂.
        4 * self.feature_bytes()
    }

    fn bind_scratch(&mut self, region: Region) {
        self.scratch = Some(region);
    }

    fn trainable_params(&self) -> Vec<&Tensor> {
        vec![&self.gamma, &self.beta]
    }

    fn gradients(&self) -> Vec<&Tensor> {
        vec![&self.gamma_grad, &self.beta_grad]
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

    fn init_params(&mut self, mem: &mut Memory, _rng: &mut dyn RngCore) -> Result<()> {
        self.gamma.as_f32_mut(mem)?.fill(1.0);
        self.beta.as_f32_mut(mem)?.fill(0.0);
        self.running_mean.as_f32_mut(mem)?.fill(0.0);
        self.running_var.as_f32_mut(mem)?.fill(1.0);
        Ok(())
    }

    fn forward(&mut self, input: &Tensor, mem: &mut Memory) -> Result<()> {
        let n = input.shape().dim(0)?;
        let f = self.features;
        let sc_r = self.scratch.ok_or(Error::UnboundTensor)?;
        let sc_r = Region {
            len: self.fwd_scratch_bytes(),
            ..sc_r
        };

        let [g_b, be_b, rm_b, rv_b] = disjoint_mut(
            mem.params,
            [
                self.gamma.data()?,
                self.beta.data()?,
                self.running_mean.data()?,
                self.running_var.data()?,
            ],
        )?;
        let gamma = cast::<f32>(&*g_b)?;
        let beta = cast::<f32>(&*be_b)?;
        let rmean = cast_mut::<f32>(rm_b)?;
        let rvar = cast_mut::<f32>(rv_b)?;

        let x_r = input.data()?;
        let y_r = self.result.data()?;
        let training = self.settings.training();
        let batch_mode = self.settings.batch_mode();
        let (eps, momentum) = (self.eps, self.momentum);

        let mut run = |x: &[f32], y: &mut [f32], scratch: &mut [f32]| {
            let (mean, var) = scratch.split_at_mut(f);
            if training {
                batch_stats(x, mean, var, n, f);
                for i in 0..f {
                    rmean[i] = (1.0 - momentum) * rmean[i] + momentum * mean[i];
                    rvar[i] = (1.0 - momentum) * rvar[i] + momentum * var[i];
                }
                if !batch_mode {
                    mean.copy_from_slice(rmean);
                    var.copy_from_slice(rvar);
                }
            } else {
                mean.copy_from_slice(rmean);
                var.copy_from_slice(rvar);
            }
            for s in 0..n {
                for i in 0..f {
                    let inv = 1.0 / (var[i] + eps).sqrt();
                    y[s * f + i] = gamma[i] * (x[s * f + i] - mean[i]) * inv + beta[i];
                }
            }
        };

        match x_r.space {
            MemSpace::Input => {
                let x = cast::<f32>(region(mem.input, &x_r)?)?;
                let [y_b, sc_b] = disjoint_mut(mem.work, [y_r, sc_r])?;
                run(x, cast_mut::<f32>(y_b)?, cast_mut::<f32>(sc_b)?);
            }
            MemSpace::Work => {
                let [y_b, sc_b, x_b] = disjoint_mut(mem.work, [y_r, sc_r, x_r])?;
                run(
                    cast::<f32>(&*x_b)?,
                    cast_mut::<f32>(y_b)?,
                    cast_mut::<f32>(sc_b)?,
                );
            }
            _ => return Err(Error::msg("layer input must live in input or working memory")),
        }
        Ok(())
    }

    fn has_backward(&self) -> bool {
        true
    }

    fn backward(&mut self, input: &Tensor, incoming: &Tensor, mem: &mut Memory) -> Result<()> {
        let n = input.shape().dim(0)?;
        let f = self.features;
        let eps = self.eps;
        let sc_r = self.scratch.ok_or(Error::UnboundTensor)?;
        let sc_r = Region {
            len: self.bwd_scratch_bytes(),
            ..sc_r
        };
        let x_r = input.data()?;
        let dy_r = incoming.data()?;
        let gg_r = self.gamma_grad.data()?;
        let bg_r = self.beta_grad.data()?;

        let gamma = cast::<f32>(region(mem.params, &self.gamma.data()?)?)?;

        if x_r.space == MemSpace::Input {
            // First compute layer: caller data, parameter gradients only.
            let x = cast::<f32>(region(mem.input, &x_r)?)?;
            let [dy_b, sc_b, gg_b, bg_b] = disjoint_mut(mem.work, [dy_r, sc_r, gg_r, bg_r])?;
            let dy = cast::<f32>(&*dy_b)?;
            bn_reductions(
                x,
                dy,
                cast_mut::<f32>(sc_b)?,
                cast_mut::<f32>(gg_b)?,
                cast_mut::<f32>(bg_b)?,
                n,
                f,
                eps,
            );
            return Ok(());
        }

        let [x_b, dy_b, sc_b, gg_b, bg_b] =
            disjoint_mut(mem.work, [x_r, dy_r, sc_r, gg_r, bg_r])?;
        let x_dx = cast_mut::<f32>(x_b)?;
        let dy = cast::<f32>(&*dy_b)?;
        let scratch = cast_mut::<f32>(sc_b)?;
        bn_reductions(
            x_dx,
            dy,
            scratch,
            cast_mut::<f32>(gg_b)?,
            cast_mut::<f32>(bg_b)?,
            n,
            f,
            eps,
        );

        if !self.settings.no_input_gradient() {
            let (mean, rest) = scratch.split_at_mut(f);
            let (var, rest) = rest.split_at_mut(f);
            let (sum_dy, sum_dy_xhat) = rest.split_at_mut(f);
            let n_f = n as f32;
            for s in 0..n {
                for i in 0..f {
                    let inv = 1.0 / (var[i] + eps).sqrt();
                    let xhat = (x_dx[s * f + i] - mean[i]) * inv;
                    x_dx[s * f + i] = gamma[i] * inv / n_f
                        * (n_f * dy[s * f + i] - sum_dy[i] - xhat * sum_dy_xhat[i]);
                }
            }
        }
        Ok(())
    }
}

/// Shared backward reductions: recompute the batch statistics from the
/// persisted activation, accumulate the sums into scratch, and fold them
/// into the gamma/beta gradients.
#[allow(clippy::too_many_arguments)]
fn bn_reductions(
    x: &[f32],
    dy: &[f32],
    scratch: &mut [f32],
    gamma_grad: &mut [f32],
    beta_grad: &mut [f32],
    n: usize,
    f: usize,
    eps: f32,
) {
    let (mean, rest) = scratch.split_at_mut(f);
    let (var, rest) = rest.split_at_mut(f);
    let (sum_dy, sum_dy_xhat) = rest.split_at_mut(f);

    batch_stats(x, mean, var, n, f);

    sum_dy.fill(0.0);
    sum_dy_xhat.fill(0.0);
    for s in 0..n {
        for i in 0..f {
            let inv = 1.0 / (var[i] + eps).sqrt();
            let xhat = (x[s * f + i] - mean[i]) * inv;
            sum_dy[i] += dy[s * f + i];
            sum_dy_xhat[i] += dy[s * f + i] * xhat;
        }
    }
    for i in 0..f {
        gamma_grad[i] += sum_dy_xhat[i];
        beta_grad[i] += sum_dy[i];
    }
}

/// Per-feature mean and (population) variance over the batch axis.
fn batch_stats(x: &[f32], mean: &mut [f32], var: &mut [f32], n: usize, f: usize) {
    let inv_n = 1.0 / n as f32;
    mean.fill(0.0);
    var.fill(0.0);
    for s in 0..n {
        for i in 0..f {
            mean[i] += x[s * f + i];
        }
    }
    for m in mean.iter_mut() {
        *m *= inv_n;
    }
    for s in 0..n {
        for i in 0..f {
            let d = x[s * f + i] - mean[i];
            var[i] += d * d;
        }
    }
    for v in var.iter_mut() {
        *v *= inv_n;
    }
}
