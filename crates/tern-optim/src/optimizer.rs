// Optimizer trait — the capability surface the engine drives updates through
//
// An optimizer never owns state. Whatever it needs per trainable tensor
// across steps (momentum, moment estimates) it declares via `state_bytes`;
// the training-memory planner reserves that block and hands the region back
// on every call. Apart from a step counter, an optimizer is stateless.

use tern_core::{Memory, Region, Result, Tensor};

/// The interface every optimizer implements.
///
/// The engine calls, per training iteration:
/// 1. `zero_gradients` for every gradient tensor (start of a macro-batch)
/// 2. `begin_step` once before the parameter updates
/// 3. `update` for every (parameter, gradient, state) triple
/// 4. `end_step` once after
///
/// `begin_step`/`end_step` are optional bookends for optimizers that keep a
/// global step counter (bias correction); the defaults do nothing.
pub trait Optimizer {
    /// Short identifier for error messages and logs.
    fn type_name(&self) -> &'static str;

    /// Bytes of per-parameter state this optimizer needs across steps.
    fn state_bytes(&self, param: &Tensor) -> usize;

    /// Initialize a freshly planned state region for one parameter.
    fn init_state(&self, param: &Tensor, state: Region, mem: &mut Memory) -> Result<()>;

    /// Zero one gradient tensor.
    fn zero_gradients(&self, grad: &Tensor, mem: &mut Memory) -> Result<()> {
        grad.as_f32_mut(mem)?.fill(0.0);
        Ok(())
    }

    /// Called once before the per-tensor updates of a step.
    fn begin_step(&mut self) {}

    /// Called once after the per-tensor updates of a step.
    fn end_step(&mut self) {}

    /// Apply one update: mutate `param` in place from `grad` and `state`.
    fn update(
        &mut self,
        param: &Tensor,
        grad: &Tensor,
        state: Option<Region>,
        mem: &mut Memory,
    ) -> Result<()>;
}
