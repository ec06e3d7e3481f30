// Adam — adaptive moments with bias correction
//
//   m = β1·m + (1-β1)·g
//   v = β2·v + (1-β2)·g²
//   w -= lr · (m / (1-β1^t)) / (sqrt(v / (1-β2^t)) + ε)
//
// The step counter t is the one piece of state that is global rather than
// per-parameter; it advances in `begin_step`, which also precomputes the two
// correction divisors so the per-tensor updates stay divide-light.

use tern_core::arena::{cast, cast_mut, disjoint_mut, region_mut};
use tern_core::{Error, Memory, Region, Result, Tensor};

use crate::optimizer::Optimizer;

/// Adam optimizer.
#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    /// Step counter; advanced by `begin_step`.
    step: u64,
    /// 1 / (1 - β1^t), refreshed each step.
    corr1: f32,
    /// 1 / (1 - β2^t), refreshed each step.
    corr2: f32,
}

impl Adam {
    /// Adam with the customary β1 = 0.9, β2 = 0.999, ε = 1e-7.
    pub fn new(learning_rate: f32) -> Self {
        Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
            step: 0,
            corr1: 1.0,
            corr2: 1.0,
        }
    }

    /// Fully parameterized constructor.
    pub fn with_betas(learning_rate: f32, beta1: f32, beta2: f32, eps: f32) -> Self {
        Adam {
            learning_rate,
            beta1,
            beta2,
            eps,
            step: 0,
            corr1: 1.0,
            corr2: 1.0,
        }
    }

    /// Steps taken so far.
    pub fn step_count(&self) -> u64 {
        self.step
    }
}

impl Optimizer for Adam {
    fn type_name(&self) -> &'static str {
        "adam"
    }

    fn state_bytes(&self, param: &Tensor) -> usize {
        // First and second moment buffers, one f32 each per element.
        2 * param.byte_len()
    }

    fn init_state(&self, _param: &Tensor, state: Region, mem: &mut Memory) -> Result<()> {
        mem.f32_mut(state)?.fill(0.0);
        Ok(())
    }

    fn begin_step(&mut self) {
        self.step += 1;
        let t = self.step as i32;
        self.corr1 = 1.0 / (1.0 - self.beta1.powi(t));
        self.corr2 = 1.0 / (1.0 - self.beta2.powi(t));
    }

    fn update(
        &mut self,
        param: &Tensor,
        grad: &Tensor,
        state: Option<Region>,
        mem: &mut Memory,
    ) -> Result<()> {
        let state = state.ok_or_else(|| Error::msg("adam requires optimizer state memory"))?;
        let pr = param.data()?;
        let gr = grad.data()?;
        let p = cast_mut::<f32>(region_mut(mem.params, &pr)?)?;

        let [g_bytes, mv_bytes] = disjoint_mut(mem.work, [gr, state])?;
        let g = cast::<f32>(g_bytes)?;
        let mv = cast_mut::<f32>(mv_bytes)?;
        let (m, v) = mv.split_at_mut(p.len());

        for i in 0..p.len() {
            m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * g[i];
            v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * g[i] * g[i];
            let m_hat = m[i] * self.corr1;
            let v_hat = v[i] * self.corr2;
            p[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.eps);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_core::{AlignedBuffer, DType, MemSpace, Shape};

    #[test]
    fn test_first_step_moves_against_gradient() {
        let mut pbuf = AlignedBuffer::new(16);
        let mut wbuf = AlignedBuffer::new(64);

        let mut param = Tensor::new(DType::F32, Shape::from(2));
        param.bind_data(Region::new(MemSpace::Params, 0, 8));
        let mut grad = Tensor::new(DType::F32, Shape::from(2));
        grad.bind_data(Region::new(MemSpace::Work, 0, 8));

        let mut opt = Adam::new(0.01);
        let state = Region::new(MemSpace::Work, 16, opt.state_bytes(&param));

        let mut mem = Memory::new(pbuf.as_mut_slice(), wbuf.as_mut_slice()).unwrap();
        param.as_f32_mut(&mut mem).unwrap().copy_from_slice(&[1.0, -1.0]);
        grad.as_f32_mut(&mut mem).unwrap().copy_from_slice(&[0.4, -0.4]);
        opt.init_state(&param, state, &mut mem).unwrap();

        opt.begin_step();
        opt.update(&param, &grad, Some(state), &mut mem).unwrap();
        opt.end_step();

        // With bias correction the very first step is ≈ lr in magnitude.
        let p = param.as_f32(&mem).unwrap();
        assert!((p[0] - (1.0 - 0.01)).abs() < 1e-4, "got {}", p[0]);
        assert!((p[1] - (-1.0 + 0.01)).abs() < 1e-4, "got {}", p[1]);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_update_without_state_is_an_error() {
        let mut pbuf = AlignedBuffer::new(8);
        let mut wbuf = AlignedBuffer::new(8);
        let mut param = Tensor::new(DType::F32, Shape::from(1));
        param.bind_data(Region::new(MemSpace::Params, 0, 4));
        let mut grad = Tensor::new(DType::F32, Shape::from(1));
        grad.bind_data(Region::new(MemSpace::Work, 0, 4));

        let mut mem = Memory::new(pbuf.as_mut_slice(), wbuf.as_mut_slice()).unwrap();
        let mut opt = Adam::new(0.01);
        assert!(opt.update(&param, &grad, None, &mut mem).is_err());
    }
}
