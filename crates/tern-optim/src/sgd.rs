// SGD — stochastic gradient descent, optionally with momentum
//
// Plain:      w -= lr * g
// Momentum:   v  = momentum * v + g
//             w -= lr * v
//
// With momentum the velocity buffer `v` is the per-parameter state the
// planner reserves; without it the optimizer needs zero state bytes and the
// planner reserves nothing.

use tern_core::arena::{cast, cast_mut, disjoint_mut, region, region_mut};
use tern_core::{Memory, Region, Result, Tensor};

use crate::optimizer::Optimizer;

/// Stochastic gradient descent.
#[derive(Debug, Clone)]
pub struct Sgd {
    /// Step size. Same numeric domain as the parameters (f32).
    pub learning_rate: f32,
    /// Momentum factor; 0.0 disables the velocity buffer entirely.
    pub momentum: f32,
}

impl Sgd {
    /// Plain SGD without momentum.
    pub fn new(learning_rate: f32) -> Self {
        Sgd {
            learning_rate,
            momentum: 0.0,
        }
    }

    /// SGD with momentum.
    pub fn with_momentum(learning_rate: f32, momentum: f32) -> Self {
        Sgd {
            learning_rate,
            momentum,
        }
    }
}

impl Optimizer for Sgd {
    fn type_name(&self) -> &'static str {
        "sgd"
    }

    fn state_bytes(&self, param: &Tensor) -> usize {
        if self.momentum != 0.0 {
            param.byte_len()
        } else {
            0
        }
    }

    fn init_state(&self, _param: &Tensor, state: Region, mem: &mut Memory) -> Result<()> {
        if state.len > 0 {
            mem.f32_mut(state)?.fill(0.0);
        }
        Ok(())
    }

    fn update(
        &mut self,
        param: &Tensor,
        grad: &Tensor,
        state: Option<Region>,
        mem: &mut Memory,
    ) -> Result<()> {
        let pr = param.data()?;
        let gr = grad.data()?;
        let p = cast_mut::<f32>(region_mut(mem.params, &pr)?)?;

        match state.filter(|s| s.len > 0) {
            Some(sr) => {
                let [g_bytes, v_bytes] = disjoint_mut(mem.work, [gr, sr])?;
                let g = cast::<f32>(g_bytes)?;
                let v = cast_mut::<f32>(v_bytes)?;
                for ((w, &g), v) in p.iter_mut().zip(g.iter()).zip(v.iter_mut()) {
                    *v = self.momentum * *v + g;
                    *w -= self.learning_rate * *v;
                }
            }
            None => {
                let g = cast::<f32>(region(mem.work, &gr)?)?;
                for (w, &g) in p.iter_mut().zip(g.iter()) {
                    *w -= self.learning_rate * g;
                }
            }
        }
        Ok(())
    }
}
