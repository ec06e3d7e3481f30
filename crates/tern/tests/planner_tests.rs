// Planner tests — sizing/placement agreement, aliasing invariants, and the
// structural error paths of the memory planner.

use tern::prelude::*;
use tern::{Model, MAX_CHAIN_LEN};
use tern_core::Region;

fn compiled_mlp(batch: usize, widths: &[usize]) -> Model {
    let mut model = Model::new().add(InputLayer::new(DType::F32, (batch, widths[0])));
    for &w in &widths[1..] {
        model.push(Dense::new(w));
        model.push(ReLU::new());
    }
    let mut model = model.with_loss(MseLoss::new());
    model.compile().unwrap();
    model
}

fn assert_in_bounds(region: Region, space: MemSpace, size: usize) {
    assert_eq!(region.space, space);
    assert!(
        region.offset + region.len <= size,
        "region [{}, {}) exceeds {} bytes",
        region.offset,
        region.offset + region.len,
        size
    );
}

// Graph compiler

#[test]
fn test_compile_scenario_counts() {
    // [1,4] → dense 3 → dense 1: three layers, four trainable tensors.
    let mut model = Model::new()
        .add(InputLayer::new(DType::F32, (1, 4)))
        .add(Dense::new(3))
        .add(Dense::new(1))
        .with_loss(MseLoss::new());
    model.compile().unwrap();
    assert_eq!(model.layer_count(), 3);
    assert_eq!(model.trainable_tensor_count(), 4);
}

#[test]
fn test_compile_chain_ceiling() {
    let mut model = Model::new().add(InputLayer::new(DType::F32, (1, 4)));
    for _ in 0..MAX_CHAIN_LEN {
        model.push(ReLU::new());
    }
    let err = model.compile().unwrap_err();
    assert!(matches!(err, Error::ChainTooLong { limit } if limit == MAX_CHAIN_LEN));
}

#[test]
fn test_shape_inference_idempotent() {
    let mut model = compiled_mlp(2, &[4, 3, 1]);
    let shapes: Vec<_> = model
        .layers()
        .iter()
        .map(|l| l.result().shape().clone())
        .collect();
    model.compile().unwrap();
    let again: Vec<_> = model
        .layers()
        .iter()
        .map(|l| l.result().shape().clone())
        .collect();
    assert_eq!(shapes, again);
}

#[test]
fn test_planner_requires_compile() {
    let model = Model::new()
        .add(InputLayer::new(DType::F32, (1, 4)))
        .add(Dense::new(3));
    assert!(matches!(
        tern::parameter_memory_size(&model),
        Err(Error::NotCompiled)
    ));
    assert!(matches!(
        tern::inference_memory_size(&model),
        Err(Error::NotCompiled)
    ));
}

// Parameter memory

#[test]
fn test_parameter_memory_size_exact() {
    let mut model = Model::new()
        .add(InputLayer::new(DType::F32, (1, 4)))
        .add(Dense::new(3))
        .add(Dense::new(1));
    model.compile().unwrap();
    // dense1: weights 4*3*4 = 48, bias 3*4 = 12 → 16 aligned. dense2:
    // weights 3*1*4 = 12 → 16, bias 4 → 8.
    assert_eq!(tern::parameter_memory_size(&model).unwrap(), 48 + 16 + 16 + 8);
}

#[test]
fn test_parameter_placement_in_bounds() {
    let mut model = compiled_mlp(2, &[5, 7, 3, 2]);
    let size = tern::parameter_memory_size(&model).unwrap();
    tern::distribute_parameter_memory(&mut model, size).unwrap();
    for layer in model.layers() {
        for param in layer.trainable_params() {
            assert_in_bounds(param.data().unwrap(), MemSpace::Params, size);
        }
    }
}

#[test]
fn test_parameter_placement_rejects_small_buffer() {
    let mut model = compiled_mlp(1, &[4, 3]);
    let size = tern::parameter_memory_size(&model).unwrap();
    let err = tern::distribute_parameter_memory(&mut model, size - 1).unwrap_err();
    assert!(matches!(err, Error::BufferTooSmall { .. }));
}

#[test]
fn test_parameter_roundtrip_markers() {
    // Writing marker values through the placed regions and reading them
    // back through the parameter tensor views recovers the exact bytes.
    let mut model = compiled_mlp(1, &[4, 3]);
    let size = tern::parameter_memory_size(&model).unwrap();
    tern::distribute_parameter_memory(&mut model, size).unwrap();

    let mut params = AlignedBuffer::new(size);
    let mut work = AlignedBuffer::new(64);
    let mut mem = Memory::new(params.as_mut_slice(), work.as_mut_slice()).unwrap();

    let markers: Vec<f32> = (0..12).map(|i| i as f32 * 0.5 - 3.0).collect();
    {
        let weights = model.layers()[1].trainable_params()[0].clone();
        weights
            .as_f32_mut(&mut mem)
            .unwrap()
            .copy_from_slice(&markers);
    }
    let read = model.layers()[1].trainable_params()[0]
        .as_f32(&mem)
        .unwrap()
        .to_vec();
    assert_eq!(read, markers);
}

// Inference memory

#[test]
fn test_inference_double_buffer_invariants() {
    let mut model = compiled_mlp(2, &[4, 8, 8, 3]);
    let size = tern::inference_memory_size(&model).unwrap();
    tern::schedule_inference_memory(&mut model, size).unwrap();

    let regions: Vec<Region> = model.layers()[1..]
        .iter()
        .map(|l| l.result().data().unwrap())
        .collect();
    for r in &regions {
        assert_in_bounds(*r, MemSpace::Work, size);
    }
    // Adjacent results must not overlap: layer i+1 reads result i while
    // writing its own. Results two apart share a ping-pong half by design.
    for pair in regions.windows(2) {
        assert!(!pair[0].overlaps(&pair[1]), "adjacent results overlap");
    }
    for triple in regions.windows(3) {
        assert_eq!(
            triple[0].offset, triple[2].offset,
            "distance-2 results should reuse a half"
        );
    }
}

#[test]
fn test_inference_size_is_two_halves_plus_scratch() {
    // No scratch users and no quantized layers: the plan is exactly two
    // copies of the largest activation.
    let mut model = compiled_mlp(1, &[4, 6, 2]);
    let size = tern::inference_memory_size(&model).unwrap();
    // Largest activation: dense 6 → 24 bytes aligned, doubled.
    assert_eq!(size, 2 * 24);
}

#[test]
fn test_keep_input_layer_consumes_no_half() {
    let mut with_flatten = Model::new()
        .add(InputLayer::new(DType::F32, (1, 2, 3)))
        .add(Flatten::new(DType::F32))
        .add(Dense::new(4));
    with_flatten.compile().unwrap();

    let mut without = Model::new()
        .add(InputLayer::new(DType::F32, (1, 6)))
        .add(Dense::new(4));
    without.compile().unwrap();

    assert_eq!(
        tern::inference_memory_size(&with_flatten).unwrap(),
        tern::inference_memory_size(&without).unwrap()
    );
}

// Training memory

#[test]
fn test_training_requires_loss() {
    let mut model = Model::new()
        .add(InputLayer::new(DType::F32, (1, 4)))
        .add(Dense::new(3));
    model.compile().unwrap();
    let opt = Sgd::new(0.1);
    assert!(matches!(
        tern::training_memory_size(&model, &opt),
        Err(Error::MissingLoss)
    ));
}

#[test]
fn test_training_placement_in_bounds_and_persistent() {
    let mut model = compiled_mlp(2, &[4, 5, 3]);
    let opt = Sgd::with_momentum(0.1, 0.9);
    let size = tern::training_memory_size(&model, &opt).unwrap();
    tern::schedule_training_memory(&mut model, &opt, size).unwrap();

    let mut result_regions = Vec::new();
    for layer in model.layers()[1..].iter() {
        let r = layer.result().data().unwrap();
        assert_in_bounds(r, MemSpace::Work, size);
        result_regions.push(r);
        for grad in layer.gradients() {
            assert_in_bounds(grad.data().unwrap(), MemSpace::Work, size);
        }
        for state in layer.optimem().iter().flatten() {
            assert_in_bounds(*state, MemSpace::Work, size);
        }
    }
    // No double buffering in training: every activation persists.
    for i in 0..result_regions.len() {
        for j in (i + 1)..result_regions.len() {
            assert!(
                !result_regions[i].overlaps(&result_regions[j]),
                "training activations {} and {} overlap",
                i,
                j
            );
        }
    }
}

#[test]
fn test_training_delta_aliases_input_activation() {
    let mut model = compiled_mlp(1, &[4, 3, 2]);
    let opt = Sgd::new(0.1);
    let size = tern::training_memory_size(&model, &opt).unwrap();
    tern::schedule_training_memory(&mut model, &opt, size).unwrap();

    // deltas(i) shares the region holding result(i-1).
    for i in 2..model.layer_count() {
        let upstream = model.layers()[i - 1].result().data().unwrap();
        let delta = model.layers()[i].deltas().data().unwrap();
        assert_eq!(delta.offset, upstream.offset);
    }
    // The loss delta sink aliases the output layer's result.
    let out = model.layers()[model.layer_count() - 1]
        .result()
        .data()
        .unwrap();
    let loss_delta = model.loss().unwrap().deltas().data().unwrap();
    assert_eq!(loss_delta.offset, out.offset);
}

#[test]
fn test_training_size_grows_with_optimizer_state() {
    let mut model = compiled_mlp(1, &[4, 3]);
    let plain = Sgd::new(0.1);
    let momentum = Sgd::with_momentum(0.1, 0.9);
    let adam = Adam::new(0.01);
    let s0 = tern::training_memory_size(&model, &plain).unwrap();
    let s1 = tern::training_memory_size(&model, &momentum).unwrap();
    let s2 = tern::training_memory_size(&model, &adam).unwrap();
    assert!(s0 < s1, "momentum adds state: {} vs {}", s0, s1);
    assert!(s1 < s2, "adam doubles state: {} vs {}", s1, s2);
}

#[test]
fn test_randomized_chains_size_place_agree() {
    // Light fuzz over chain shapes: placement must accept exactly the
    // sized buffer and bind everything inside it.
    let cases: [&[usize]; 4] = [&[3, 5], &[4, 4, 4], &[2, 9, 1], &[6, 2, 7, 3]];
    for widths in cases {
        for batch in [1usize, 2, 5] {
            let mut model = compiled_mlp(batch, widths);
            let psize = tern::parameter_memory_size(&model).unwrap();
            tern::distribute_parameter_memory(&mut model, psize).unwrap();

            let isize = tern::inference_memory_size(&model).unwrap();
            tern::schedule_inference_memory(&mut model, isize).unwrap();
            for layer in model.layers()[1..].iter() {
                assert_in_bounds(layer.result().data().unwrap(), MemSpace::Work, isize);
            }

            let opt = Adam::new(0.01);
            let tsize = tern::training_memory_size(&model, &opt).unwrap();
            tern::schedule_training_memory(&mut model, &opt, tsize).unwrap();
            for layer in model.layers()[1..].iter() {
                assert_in_bounds(layer.result().data().unwrap(), MemSpace::Work, tsize);
                for grad in layer.gradients() {
                    assert_in_bounds(grad.data().unwrap(), MemSpace::Work, tsize);
                }
            }
        }
    }
}
