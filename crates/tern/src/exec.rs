// Execution engine — straight-line walks over the compiled chain
//
// One training iteration is, conceptually:
//
//   ZeroGradients → { Forward → Backward } × micro-batches → UpdateParams
//
// repeated per macro-batch, repeated per epoch by the caller. Everything is
// a plain sequential loop on the calling thread: no scheduler, no
// suspension points, no parallelism. All preconditions (compiled model,
// attached loss, batch divisibility, backward hooks) are checked before any
// state is touched, and every failure is a returned error code — the engine
// never unwinds.

use rand::RngCore;
use tern_core::{Error, MemSpace, Memory, QuantParams, Region, Result, Tensor};
use tern_optim::Optimizer;

use crate::model::Model;

impl Model {
    /// Bind the input layer's result to a slice of the caller's input data.
    /// No copy: the first compute layer reads the caller's buffer directly.
    fn bind_input(&mut self, offset: usize, len: usize) {
        self.layers_mut()[0]
            .result_mut()
            .bind_data(Region::new(MemSpace::Input, offset, len));
    }

    /// Walk the chain once in order, layer by layer.
    fn forward_pass(&mut self, mem: &mut Memory) -> Result<()> {
        for i in 1..self.layer_count() {
            let input = self.layers()[i - 1].result().clone();
            self.layers_mut()[i].forward(&input, mem)?;
        }
        Ok(())
    }

    /// Seed the terminal delta from the loss, then walk the chain in
    /// reverse. `target` addresses the caller's target slice.
    fn backward_pass(&mut self, target: Region, mem: &mut Memory) -> Result<()> {
        // Structural misconfiguration, not a data error: detect it before
        // the pass mutates anything.
        for i in 1..self.layer_count() {
            if !self.layers()[i].has_backward() {
                let name = self.layers()[i].type_name();
                log::error!(
                    "layer '{}' participates in training but has no backward pass",
                    name
                );
                return Err(Error::MissingBackward { layer: name });
            }
        }
        let prediction = self.layers()[self.layer_count() - 1].result().clone();
        let loss = self.loss_mut().ok_or(Error::MissingLoss)?;
        loss.calc_delta(&prediction, target, mem)?;
        let loss_deltas = loss.deltas().clone();

        for i in (1..self.layer_count()).rev() {
            let input = self.layers()[i - 1].result().clone();
            let incoming = if i == self.layer_count() - 1 {
                loss_deltas.clone()
            } else {
                self.layers()[i + 1].deltas().clone()
            };
            self.layers_mut()[i].backward(&input, &incoming, mem)?;
        }
        Ok(())
    }

    /// Run one forward pass over the micro-batch in `mem.input` and return
    /// the output tensor descriptor.
    ///
    /// Precondition: memory is scheduled (all regions bound). Nothing is
    /// allocated or copied here.
    pub fn forward(&mut self, mem: &mut Memory) -> Result<Tensor> {
        self.check_compiled()?;
        let needed = self.layers()[0].result().byte_len();
        if mem.input.len() < needed {
            return Err(Error::BufferTooSmall {
                required: needed,
                available: mem.input.len(),
            });
        }
        self.bind_input(0, needed);
        self.forward_pass(mem)?;
        Ok(self.layers()[self.layer_count() - 1].result().clone())
    }

    /// Run one backward pass against the target micro-batch in `mem.target`.
    /// `forward` must have run over the matching input first.
    pub fn backward(&mut self, mem: &mut Memory) -> Result<()> {
        self.check_compiled()?;
        let out = self.layers()[self.layer_count() - 1].result();
        let needed = out.byte_len();
        if mem.target.len() < needed {
            return Err(Error::BufferTooSmall {
                required: needed,
                available: mem.target.len(),
            });
        }
        self.backward_pass(Region::new(MemSpace::Target, 0, needed), mem)
    }

    /// Train over `samples` input/target rows: per macro-batch of
    /// `batch_size` samples, zero gradients, accumulate over micro-batches,
    /// then take one optimizer step. Only complete macro-batches run.
    ///
    /// `batch_size` must be an exact multiple of the input layer's
    /// micro-batch size; a violation is reported before anything mutates.
    pub fn train(
        &mut self,
        mem: &mut Memory,
        samples: usize,
        batch_size: usize,
        optimizer: &mut dyn Optimizer,
    ) -> Result<()> {
        self.check_compiled()?;
        if self.loss().is_none() {
            return Err(Error::MissingLoss);
        }
        let slice = self.input_slice_size()?;
        if batch_size == 0 || batch_size % slice != 0 {
            log::error!(
                "batch size {} is not a multiple of the input slice size {}",
                batch_size,
                slice
            );
            return Err(Error::BatchSizeMismatch {
                batch_size,
                slice_size: slice,
            });
        }
        let in_bytes = self.input_sample_bytes()?;
        let out_bytes = self.output_sample_bytes()?;
        let required_in = samples * in_bytes;
        if mem.input.len() < required_in {
            return Err(Error::BufferTooSmall {
                required: required_in,
                available: mem.input.len(),
            });
        }
        let required_target = samples * out_bytes;
        if mem.target.len() < required_target {
            return Err(Error::BufferTooSmall {
                required: required_target,
                available: mem.target.len(),
            });
        }

        // Whole-batch forward calls may compute exact batch statistics.
        let batch_mode = batch_size == slice;
        for layer in self.layers_mut() {
            layer.settings_mut().set_training(true);
            layer.settings_mut().set_batch_mode(batch_mode);
        }

        let mut macro_start = 0;
        while macro_start + batch_size <= samples {
            self.zero_gradients(optimizer, mem)?;
            let mut micro_start = macro_start;
            while micro_start < macro_start + batch_size {
                self.bind_input(micro_start * in_bytes, slice * in_bytes);
                self.forward_pass(mem)?;
                let target = Region::new(
                    MemSpace::Target,
                    micro_start * out_bytes,
                    slice * out_bytes,
                );
                self.backward_pass(target, mem)?;
                micro_start += slice;
            }
            self.update_params(optimizer, mem)?;
            macro_start += batch_size;
        }

        for layer in self.layers_mut() {
            layer.settings_mut().set_training(false);
            layer.settings_mut().set_batch_mode(false);
        }
        Ok(())
    }

    /// Run inference over `samples` input rows, copying each micro-batch's
    /// output into `output`. Training and batch modes are forced off.
    ///
    /// `samples` must be a multiple of the input micro-batch size. For
    /// quantized outputs, read the grid once afterwards via
    /// [`Model::output_qparams`].
    pub fn inference(&mut self, mem: &mut Memory, samples: usize, output: &mut [u8]) -> Result<()> {
        self.check_compiled()?;
        let slice = self.input_slice_size()?;
        if samples == 0 || samples % slice != 0 {
            return Err(Error::BatchSizeMismatch {
                batch_size: samples,
                slice_size: slice,
            });
        }
        let in_bytes = self.input_sample_bytes()?;
        let out_bytes = self.output_sample_bytes()?;
        if output.len() < samples * out_bytes {
            return Err(Error::BufferTooSmall {
                required: samples * out_bytes,
                available: output.len(),
            });
        }
        if mem.input.len() < samples * in_bytes {
            return Err(Error::BufferTooSmall {
                required: samples * in_bytes,
                available: mem.input.len(),
            });
        }
        for layer in self.layers_mut() {
            layer.settings_mut().set_training(false);
            layer.settings_mut().set_batch_mode(false);
        }

        let mut start = 0;
        while start < samples {
            self.bind_input(start * in_bytes, slice * in_bytes);
            self.forward_pass(mem)?;
            let result = self.layers()[self.layer_count() - 1].result();
            let bytes = mem.bytes(result.data()?)?;
            output[start * out_bytes..start * out_bytes + bytes.len()].copy_from_slice(bytes);
            start += slice;
        }
        Ok(())
    }

    /// The output layer's quantization parameters, if its dtype has any.
    pub fn output_qparams(&self, mem: &Memory) -> Result<Option<QuantParams>> {
        self.check_compiled()?;
        let out = self.layers()[self.layer_count() - 1].result();
        if out.dtype().is_quantized() {
            Ok(Some(out.quant_params(mem)?))
        } else {
            Ok(None)
        }
    }

    /// Average per-sample loss over `samples` input/target rows, with
    /// training and batch modes forced off.
    pub fn calc_loss(&mut self, mem: &mut Memory, samples: usize) -> Result<f32> {
        self.check_compiled()?;
        if self.loss().is_none() {
            return Err(Error::MissingLoss);
        }
        let slice = self.input_slice_size()?;
        if samples == 0 || samples % slice != 0 {
            return Err(Error::BatchSizeMismatch {
                batch_size: samples,
                slice_size: slice,
            });
        }
        let in_bytes = self.input_sample_bytes()?;
        let out_bytes = self.output_sample_bytes()?;
        for layer in self.layers_mut() {
            layer.settings_mut().set_training(false);
            layer.settings_mut().set_batch_mode(false);
        }

        let mut total = 0.0f32;
        let mut start = 0;
        while start < samples {
            self.bind_input(start * in_bytes, slice * in_bytes);
            self.forward_pass(mem)?;
            let prediction = self.layers()[self.layer_count() - 1].result().clone();
            let target = Region::new(MemSpace::Target, start * out_bytes, slice * out_bytes);
            let loss = self.loss().ok_or(Error::MissingLoss)?;
            total += loss.calc_loss(&prediction, target, mem)?;
            start += slice;
        }
        Ok(total / samples as f32)
    }

    /// Zero every trainable layer's gradient tensors.
    pub fn zero_gradients(&mut self, optimizer: &dyn Optimizer, mem: &mut Memory) -> Result<()> {
        self.check_compiled()?;
        for layer in self.layers() {
            if !layer.settings().trainable() {
                continue;
            }
            for grad in layer.gradients() {
                optimizer.zero_gradients(grad, mem)?;
            }
        }
        Ok(())
    }

    /// One optimizer step over every trainable layer's parameter/gradient
    /// pairs, bracketed by the optimizer's begin/end hooks.
    pub fn update_params(&mut self, optimizer: &mut dyn Optimizer, mem: &mut Memory) -> Result<()> {
        self.check_compiled()?;
        optimizer.begin_step();
        for layer in self.layers() {
            if !layer.settings().trainable() {
                continue;
            }
            let params = layer.trainable_params();
            let grads = layer.gradients();
            let states = layer.optimem();
            for (idx, param) in params.iter().enumerate() {
                let state = states.get(idx).copied().flatten();
                optimizer.update(param, grads[idx], state, mem)?;
            }
        }
        optimizer.end_step();
        Ok(())
    }

    /// Initialize the optimizer's per-parameter state blocks. Call once
    /// after `schedule_training_memory`.
    pub fn init_optimizer_state(
        &mut self,
        optimizer: &dyn Optimizer,
        mem: &mut Memory,
    ) -> Result<()> {
        self.check_compiled()?;
        for layer in self.layers() {
            if !layer.settings().trainable() {
                continue;
            }
            let params = layer.trainable_params();
            let states = layer.optimem();
            for (idx, param) in params.iter().enumerate() {
                if let Some(state) = states.get(idx).copied().flatten() {
                    if state.len > 0 {
                        optimizer.init_state(param, state, mem)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Run every trainable-flagged layer's weight-initialization hook.
    pub fn init_params(&mut self, mem: &mut Memory, rng: &mut dyn RngCore) -> Result<()> {
        self.check_compiled()?;
        for layer in self.layers_mut() {
            if layer.settings().trainable() && layer.has_init_params() {
                layer.init_params(mem, rng)?;
            }
        }
        Ok(())
    }
}
