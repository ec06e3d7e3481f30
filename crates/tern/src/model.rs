// Model — the layer chain and its graph compiler
//
// A model is an ordered chain of layers plus an optional loss. It owns no
// tensor memory, only the descriptors inside its layers; every byte the
// chain touches comes from the caller through the planner.
//
// `compile` is the one-time walk that validates the chain, runs shape
// inference end to end, and caches the layer and trainable-tensor counts.
// The counts are STALE after any chain mutation: adding a layer clears the
// compiled flag, and every planner/engine entry point refuses to run on an
// uncompiled model.

use tern_core::{DType, Error, Result, Shape};
use tern_nn::{Layer, Loss};

/// Hard ceiling on chain length; hitting it means a malformed chain.
pub const MAX_CHAIN_LEN: usize = 128;

/// A linear chain of layers with an optional loss at the end.
pub struct Model {
    layers: Vec<Box<dyn Layer>>,
    loss: Option<Box<dyn Loss>>,
    layer_count: usize,
    trainable_tensor_count: usize,
    compiled: bool,
    param_mem_size: usize,
    work_mem_size: usize,
}

impl Model {
    pub fn new() -> Self {
        Model {
            layers: Vec::new(),
            loss: None,
            layer_count: 0,
            trainable_tensor_count: 0,
            compiled: false,
            param_mem_size: 0,
            work_mem_size: 0,
        }
    }

    /// Append a layer to the chain (builder style).
    pub fn add(mut self, layer: impl Layer + 'static) -> Self {
        self.push(layer);
        self
    }

    /// Append a layer to the chain.
    pub fn push(&mut self, layer: impl Layer + 'static) {
        self.layers.push(Box::new(layer));
        self.compiled = false;
    }

    /// Attach the loss (builder style).
    pub fn with_loss(mut self, loss: impl Loss + 'static) -> Self {
        self.loss = Some(Box::new(loss));
        self.compiled = false;
        self
    }

    /// Walk the chain once: validate, infer shapes, cache counts.
    ///
    /// Must be re-invoked after any chain mutation; there is no automatic
    /// invalidation beyond the compiled flag.
    pub fn compile(&mut self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(Error::msg("model has no layers"));
        }
        if self.layers.len() > MAX_CHAIN_LEN {
            return Err(Error::ChainTooLong {
                limit: MAX_CHAIN_LEN,
            });
        }

        // Shape inference in chain order. The head layer's shape is its own
        // configuration; everything downstream derives from it.
        let mut prev_shape: Shape = self.layers[0].result().shape().clone();
        let head_shape = prev_shape.clone();
        self.layers[0].infer_result_shape(&head_shape)?;
        for layer in self.layers.iter_mut().skip(1) {
            layer.infer_result_shape(&prev_shape)?;
            prev_shape = layer.result().shape().clone();
        }

        // The first compute layer's input is the caller's read-only data;
        // nothing upstream can consume a gradient for it.
        if self.layers.len() > 1 {
            self.layers[1].settings_mut().set_no_input_gradient(true);
        }

        self.trainable_tensor_count = self
            .layers
            .iter()
            .map(|l| l.trainable_params().len())
            .sum();
        self.layer_count = self.layers.len();

        if let Some(loss) = self.loss.as_mut() {
            let out = self.layers[self.layer_count - 1].result();
            let (shape, dtype) = (out.shape().clone(), out.dtype());
            loss.infer_shape(&shape, dtype)?;
        }

        self.compiled = true;
        Ok(())
    }

    /// Number of layers, cached by `compile`. Zero before the first compile.
    pub fn layer_count(&self) -> usize {
        self.layer_count
    }

    /// Total trainable parameter tensors across the chain, cached by `compile`.
    pub fn trainable_tensor_count(&self) -> usize {
        self.trainable_tensor_count
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    pub(crate) fn check_compiled(&self) -> Result<()> {
        if !self.compiled {
            return Err(Error::NotCompiled);
        }
        Ok(())
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Box<dyn Layer>] {
        &mut self.layers
    }

    pub fn loss(&self) -> Option<&dyn Loss> {
        self.loss.as_deref()
    }

    pub(crate) fn loss_mut(&mut self) -> Option<&mut Box<dyn Loss>> {
        self.loss.as_mut()
    }

    /// Samples one forward call processes — the input layer's leading dim.
    pub fn input_slice_size(&self) -> Result<usize> {
        self.check_compiled()?;
        self.layers[0].result().shape().dim(0)
    }

    /// Bytes of one input sample.
    pub fn input_sample_bytes(&self) -> Result<usize> {
        self.check_compiled()?;
        let t = self.layers[0].result();
        Ok(t.shape().elems_per_sample() * t.dtype().size_in_bytes())
    }

    /// Bytes of one output sample.
    pub fn output_sample_bytes(&self) -> Result<usize> {
        self.check_compiled()?;
        let t = self.layers[self.layer_count - 1].result();
        Ok(t.shape().elems_per_sample() * t.dtype().size_in_bytes())
    }

    /// The output layer's dtype.
    pub fn output_dtype(&self) -> Result<DType> {
        self.check_compiled()?;
        Ok(self.layers[self.layer_count - 1].result().dtype())
    }

    pub(crate) fn set_param_mem_size(&mut self, bytes: usize) {
        self.param_mem_size = bytes;
    }

    pub(crate) fn set_work_mem_size(&mut self, bytes: usize) {
        self.work_mem_size = bytes;
    }

    /// Bytes of parameter memory bound by the last placement (0 before).
    pub fn param_mem_size(&self) -> usize {
        self.param_mem_size
    }

    /// Bytes of working memory bound by the last placement (0 before).
    pub fn work_mem_size(&self) -> usize {
        self.work_mem_size
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}
