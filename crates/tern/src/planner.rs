// Memory planner — size first, place second
//
// Three planning pairs over the compiled chain:
//
//   parameter memory   — weights, biases, calibrated result qparams
//   inference memory   — shared scratch + ping-pong double buffer
//   training memory    — shared scratch + persistent activations, deltas,
//                        gradients, optimizer state
//
// Every pair walks the chain with identical cursor arithmetic: the sizing
// walk counts, the placement walk binds, and because both go through
// `Cursor::reserve` (which aligns after every sub-allocation) they land on
// the same total. The caller allocates exactly `*_memory_size` bytes, then
// placement refuses anything smaller.
//
// The inference double buffer is the one deliberate aliasing scheme: layer
// i's result is read only by layer i+1 before being overwritten, so results
// ping-pong between two halves sized to the largest activation. Layers that
// keep their input buffer consume no half and do not advance the parity.
// Training memory is the opposite: every activation persists, because
// backward passes read the forward activations; there the aliasing is
// between layer i's result and layer i+1's delta, which overwrite each
// other only in the order backward already requires.

use tern_core::{Cursor, Error, MemSpace, Region, Result};
use tern_optim::Optimizer;

use crate::model::Model;

// Parameter memory

/// Bytes of parameter memory the chain needs.
///
/// Two mirrored passes, so same-kind blocks stay grouped and alignment
/// padding is not wasted between dissimilar kinds: first the result-qparams
/// blocks of quantized layers that do NOT define their own parameters (they
/// are calibrated later and persist with the weights), then every layer's
/// parameter block.
pub fn parameter_memory_size(model: &Model) -> Result<usize> {
    model.check_compiled()?;
    let mut cursor = Cursor::new(MemSpace::Params);
    for layer in model.layers() {
        if let Some(qp) = layer.result().dtype().quant_params_size() {
            if !layer.defines_result_qparams() {
                cursor.reserve(qp);
            }
        }
    }
    for layer in model.layers() {
        let bytes = layer.param_mem_bytes();
        if bytes > 0 {
            cursor.reserve(bytes);
        }
    }
    Ok(cursor.total())
}

/// Bind parameter tensors into a block of `available` bytes.
pub fn distribute_parameter_memory(model: &mut Model, available: usize) -> Result<()> {
    let required = parameter_memory_size(model)?;
    if required > available {
        return Err(Error::BufferTooSmall {
            required,
            available,
        });
    }
    let mut cursor = Cursor::new(MemSpace::Params);
    for layer in model.layers_mut() {
        if let Some(qp) = layer.result().dtype().quant_params_size() {
            if !layer.defines_result_qparams() {
                let region = cursor.reserve(qp);
                layer.result_mut().bind_qparams(region);
            }
        }
    }
    for layer in model.layers_mut() {
        if layer.param_mem_bytes() > 0 {
            layer.bind_param_mem(&mut cursor);
        }
    }
    model.set_param_mem_size(required);
    Ok(())
}

// Inference memory

struct InferencePlan {
    scratch: usize,
    max_activation: usize,
}

fn inference_extents(model: &Model) -> InferencePlan {
    let mut scratch = 0usize;
    let mut max_activation = 0usize;
    for (i, layer) in model.layers().iter().enumerate() {
        scratch = scratch.max(tern_core::align_up(layer.fwd_scratch_bytes()));
        if i > 0 && !layer.settings().keep_input_buffer() {
            max_activation = max_activation.max(tern_core::align_up(layer.result().byte_len()));
        }
    }
    InferencePlan {
        scratch,
        max_activation,
    }
}

/// Bytes of working memory one inference pass needs.
pub fn inference_memory_size(model: &Model) -> Result<usize> {
    model.check_compiled()?;
    let mut cursor = Cursor::new(MemSpace::Work);
    let plan = inference_extents(model);
    cursor.reserve(plan.scratch);
    for layer in model.layers() {
        if let Some(qp) = layer.result().dtype().quant_params_size() {
            if layer.defines_result_qparams() {
                cursor.reserve(qp);
            }
        }
    }
    cursor.reserve(plan.max_activation);
    cursor.reserve(plan.max_activation);
    Ok(cursor.total())
}

/// Bind activation, scratch, and layer-defined qparams regions for
/// inference into a block of `available` bytes.
pub fn schedule_inference_memory(model: &mut Model, available: usize) -> Result<()> {
    let required = inference_memory_size(model)?;
    if required > available {
        return Err(Error::BufferTooSmall {
            required,
            available,
        });
    }
    let mut cursor = Cursor::new(MemSpace::Work);
    let plan = inference_extents(model);

    let scratch = cursor.reserve(plan.scratch);
    for layer in model.layers_mut() {
        if let Some(qp) = layer.result().dtype().quant_params_size() {
            if layer.defines_result_qparams() {
                let region = cursor.reserve(qp);
                layer.result_mut().bind_qparams(region);
            }
        }
    }
    let halves = [
        cursor.reserve(plan.max_activation),
        cursor.reserve(plan.max_activation),
    ];

    // Ping-pong: each allocating layer takes the half its predecessor is
    // not using. Keep-input layers alias at forward time and advance
    // nothing.
    let mut parity = 0usize;
    for layer in model.layers_mut().iter_mut().skip(1) {
        if layer.settings().keep_input_buffer() {
            continue;
        }
        let bytes = layer.result().byte_len();
        let half = halves[parity];
        layer
            .result_mut()
            .bind_data(Region::new(MemSpace::Work, half.offset, bytes));
        parity ^= 1;
    }

    for layer in model.layers_mut() {
        if layer.fwd_scratch_bytes() > 0 || layer.bwd_scratch_bytes() > 0 {
            layer.bind_scratch(scratch);
        }
    }
    model.set_work_mem_size(required);
    Ok(())
}

// Training memory

fn training_scratch(model: &Model) -> usize {
    // Forward and backward scratch are never live at once; one slot serves
    // both, sized to the chain-wide maximum.
    model
        .layers()
        .iter()
        .map(|l| {
            tern_core::align_up(l.fwd_scratch_bytes())
                .max(tern_core::align_up(l.bwd_scratch_bytes()))
        })
        .max()
        .unwrap_or(0)
}

/// Bytes of working memory one training session needs.
///
/// A model with no attached loss cannot train; sizing fails with
/// [`Error::MissingLoss`] rather than reporting a partial size.
pub fn training_memory_size(model: &Model, optimizer: &dyn Optimizer) -> Result<usize> {
    model.check_compiled()?;
    if model.loss().is_none() {
        return Err(Error::MissingLoss);
    }
    let mut cursor = Cursor::new(MemSpace::Work);
    cursor.reserve(training_scratch(model));

    for layer in model.layers().iter().skip(1) {
        if let Some(qp) = layer.deltas().dtype().quant_params_size() {
            cursor.reserve(qp);
        }
        if !layer.settings().keep_input_buffer() {
            cursor.reserve(layer.result().byte_len());
        }
        if layer.settings().trainable() {
            let train_bytes = layer.train_mem_bytes();
            if train_bytes > 0 {
                cursor.reserve(train_bytes);
            }
            for param in layer.trainable_params() {
                let state = optimizer.state_bytes(param);
                if state > 0 {
                    cursor.reserve(state);
                }
            }
        }
    }
    Ok(cursor.total())
}

/// Bind every training-session region into a block of `available` bytes:
/// persistent activations, aliased deltas, gradients, optimizer state, and
/// the shared forward/backward scratch slot.
pub fn schedule_training_memory(
    model: &mut Model,
    optimizer: &dyn Optimizer,
    available: usize,
) -> Result<()> {
    let required = training_memory_size(model, optimizer)?;
    if required > available {
        return Err(Error::BufferTooSmall {
            required,
            available,
        });
    }
    let mut cursor = Cursor::new(MemSpace::Work);
    let scratch = cursor.reserve(training_scratch(model));

    let layer_count = model.layer_count();
    // Effective result region per layer index: keep-input layers pass their
    // predecessor's region through; the head layer's region is the caller's
    // per-call input slice and stays None here.
    let mut effective: Vec<Option<Region>> = vec![None; layer_count];

    for i in 1..layer_count {
        let layer = &mut model.layers_mut()[i];

        if let Some(qp) = layer.deltas().dtype().quant_params_size() {
            let region = cursor.reserve(qp);
            layer.deltas_mut().bind_qparams(region);
        }

        if layer.settings().keep_input_buffer() {
            effective[i] = effective[i - 1];
        } else {
            let region = cursor.reserve(layer.result().byte_len());
            layer.result_mut().bind_data(region);
            effective[i] = Some(region);
        }

        if layer.settings().trainable() {
            if layer.train_mem_bytes() > 0 {
                layer.bind_train_mem(&mut cursor);
            }
            let state_sizes: Vec<usize> = layer
                .trainable_params()
                .iter()
                .map(|p| optimizer.state_bytes(p))
                .collect();
            for (idx, bytes) in state_sizes.iter().enumerate() {
                let region = if *bytes > 0 {
                    cursor.reserve(*bytes)
                } else {
                    Region::new(MemSpace::Work, 0, 0)
                };
                layer.optimem_mut()[idx] = Some(region);
            }
        }
    }

    // Delta aliasing: layer i's delta tensor shares the region holding its
    // input activation. The head compute layer's input is caller data, so
    // its delta stays unbound and no_input_gradient keeps backward away.
    for i in 1..layer_count {
        if let Some(region) = effective[i - 1] {
            let bytes = model.layers()[i].deltas().byte_len();
            model.layers_mut()[i]
                .deltas_mut()
                .bind_data(Region::new(MemSpace::Work, region.offset, bytes));
        }
    }
    let last = effective[layer_count - 1].ok_or_else(|| {
        Error::msg("output layer has no bindable result region for the loss delta")
    })?;
    {
        let loss = model.loss_mut().ok_or(Error::MissingLoss)?;
        let bytes = loss.deltas().byte_len();
        loss.deltas_mut()
            .bind_data(Region::new(MemSpace::Work, last.offset, bytes));
    }

    for layer in model.layers_mut() {
        if layer.fwd_scratch_bytes() > 0 || layer.bwd_scratch_bytes() > 0 {
            layer.bind_scratch(scratch);
        }
    }
    model.set_work_mem_size(required);
    Ok(())
}
