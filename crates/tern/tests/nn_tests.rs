// Layer behavior tests through the full planner + engine stack.

use tern::prelude::*;
use tern::Model;

fn assert_vec_approx(got: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            (g - e).abs() < tol,
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

/// Plan parameter + inference memory and hand back the two buffers.
fn plan_inference(model: &mut Model) -> (AlignedBuffer, AlignedBuffer) {
    let psize = tern::parameter_memory_size(model).unwrap();
    tern::distribute_parameter_memory(model, psize).unwrap();
    let isize = tern::inference_memory_size(model).unwrap();
    tern::schedule_inference_memory(model, isize).unwrap();
    (AlignedBuffer::new(psize.max(8)), AlignedBuffer::new(isize.max(8)))
}

// Activations

#[test]
fn test_sigmoid_values() {
    let mut model = Model::new()
        .add(InputLayer::new(DType::F32, (1, 3)))
        .add(Sigmoid::new());
    model.compile().unwrap();
    let (mut params, mut work) = plan_inference(&mut model);

    let input: [f32; 3] = [0.0, 2.0, -2.0];
    let mut mem = Memory::new(params.as_mut_slice(), work.as_mut_slice())
        .unwrap()
        .with_input(bytemuck::cast_slice(&input));
    let out = model.forward(&mut mem).unwrap();
    assert_vec_approx(
        out.as_f32(&mem).unwrap(),
        &[0.5, 0.8807971, 0.1192029],
        1e-6,
    );
}

#[test]
fn test_relu_and_tanh_values() {
    let mut model = Model::new()
        .add(InputLayer::new(DType::F32, (1, 4)))
        .add(ReLU::new());
    model.compile().unwrap();
    let (mut params, mut work) = plan_inference(&mut model);

    let input: [f32; 4] = [-1.0, 0.0, 0.5, 3.0];
    let mut mem = Memory::new(params.as_mut_slice(), work.as_mut_slice())
        .unwrap()
        .with_input(bytemuck::cast_slice(&input));
    let out = model.forward(&mut mem).unwrap();
    assert_eq!(out.as_f32(&mem).unwrap(), &[0.0, 0.0, 0.5, 3.0]);

    let mut model = Model::new()
        .add(InputLayer::new(DType::F32, (1, 2)))
        .add(Tanh::new());
    model.compile().unwrap();
    let (mut params, mut work) = plan_inference(&mut model);
    let input: [f32; 2] = [0.0, 1.0];
    let mut mem = Memory::new(params.as_mut_slice(), work.as_mut_slice())
        .unwrap()
        .with_input(bytemuck::cast_slice(&input));
    let out = model.forward(&mut mem).unwrap();
    assert_vec_approx(out.as_f32(&mem).unwrap(), &[0.0, 0.7615942], 1e-6);
}

#[test]
fn test_softmax_rows_sum_to_one() {
    let mut model = Model::new()
        .add(InputLayer::new(DType::F32, (2, 3)))
        .add(Softmax::new());
    model.compile().unwrap();
    let (mut params, mut work) = plan_inference(&mut model);

    let input: [f32; 6] = [1.0, 2.0, 3.0, -5.0, 0.0, 5.0];
    let mut mem = Memory::new(params.as_mut_slice(), work.as_mut_slice())
        .unwrap()
        .with_input(bytemuck::cast_slice(&input));
    let out = model.forward(&mut mem).unwrap();
    let y = out.as_f32(&mem).unwrap();
    for row in y.chunks(3) {
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(row.iter().all(|&v| v >= 0.0));
    }
}

// Flatten

#[test]
fn test_flatten_is_a_pure_view() {
    let mut model = Model::new()
        .add(InputLayer::new(DType::F32, (1, 2, 3)))
        .add(Flatten::new(DType::F32))
        .add(Dense::new(1));
    model.compile().unwrap();
    let (mut params, mut work) = plan_inference(&mut model);

    let input: [f32; 6] = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
    let mut mem = Memory::new(params.as_mut_slice(), work.as_mut_slice())
        .unwrap()
        .with_input(bytemuck::cast_slice(&input));
    {
        let params = model.layers()[2].trainable_params();
        let w = params[0].clone();
        let b = params[1].clone();
        w.as_f32_mut(&mut mem)
            .unwrap()
            .copy_from_slice(&[1.0; 6]);
        b.as_f32_mut(&mut mem).unwrap().copy_from_slice(&[0.5]);
    }
    let out = model.forward(&mut mem).unwrap();
    assert_eq!(out.as_f32(&mem).unwrap(), &[6.5]);

    // The flatten result aliases the caller's input buffer directly.
    let flat_region = model.layers()[1].result().data().unwrap();
    assert_eq!(flat_region.space, MemSpace::Input);
    assert_eq!(model.layers()[1].result().dims(), &[1, 6]);
}

// BatchNorm

#[test]
fn test_batchnorm_eval_is_identity_after_init() {
    let mut model = Model::new()
        .add(InputLayer::new(DType::F32, (4, 2)))
        .add(BatchNorm::new(1e-5, 0.1));
    model.compile().unwrap();
    let (mut params, mut work) = plan_inference(&mut model);

    let input: [f32; 8] = [1.0, -1.0, 2.0, -2.0, 3.0, -3.0, 4.0, -4.0];
    let mut mem = Memory::new(params.as_mut_slice(), work.as_mut_slice())
        .unwrap()
        .with_input(bytemuck::cast_slice(&input));
    use rand::SeedableRng;
    let mut rng = rand::rngs::StdRng::seed_from_u64(1);
    model.init_params(&mut mem, &mut rng).unwrap();

    // Freshly initialized running stats are mean 0, var 1.
    let mut output = vec![0u8; 8 * 4];
    model.inference(&mut mem, 4, &mut output).unwrap();
    let out: &[f32] = bytemuck::cast_slice(&output);
    assert_vec_approx(out, &input, 1e-3);
}

#[test]
fn test_batchnorm_batch_mode_normalizes() {
    let mut model = Model::new()
        .add(InputLayer::new(DType::F32, (4, 1)))
        .add(BatchNorm::new(1e-5, 0.1));
    model.compile().unwrap();
    let (mut params, mut work) = plan_inference(&mut model);

    let input: [f32; 4] = [1.0, 2.0, 3.0, 4.0];
    let mut mem = Memory::new(params.as_mut_slice(), work.as_mut_slice())
        .unwrap()
        .with_input(bytemuck::cast_slice(&input));
    use rand::SeedableRng;
    let mut rng = rand::rngs::StdRng::seed_from_u64(1);
    model.init_params(&mut mem, &mut rng).unwrap();

    // Whole batch in one call: exact statistics.
    for layer in model.layers_mut() {
        layer.settings_mut().set_training(true);
        layer.settings_mut().set_batch_mode(true);
    }
    let out = model.forward(&mut mem).unwrap();
    let y = out.as_f32(&mem).unwrap();
    // mean 2.5, var 1.25 → invstd ≈ 0.8944
    assert_vec_approx(y, &[-1.3416355, -0.4472118, 0.4472118, 1.3416355], 1e-3);

    let mean: f32 = y.iter().sum::<f32>() / 4.0;
    assert!(mean.abs() < 1e-5);
}

#[test]
fn test_batchnorm_chain_trains() {
    // BatchNorm sandwiched in a dense chain, trained full-batch so the
    // engine flips batch mode on.
    let mut model = Model::new()
        .add(InputLayer::new(DType::F32, (4, 2)))
        .add(Dense::new(3))
        .add(BatchNorm::new(1e-5, 0.1))
        .add(Tanh::new())
        .add(Dense::new(1))
        .with_loss(MseLoss::new());
    model.compile().unwrap();
    let mut opt = Sgd::new(0.05);

    let psize = tern::parameter_memory_size(&model).unwrap();
    tern::distribute_parameter_memory(&mut model, psize).unwrap();
    let tsize = tern::training_memory_size(&model, &opt).unwrap();
    tern::schedule_training_memory(&mut model, &opt, tsize).unwrap();
    let mut params = AlignedBuffer::new(psize);
    let mut work = AlignedBuffer::new(tsize);

    let inputs: [f32; 8] = [0.2, -0.4, 0.9, 0.1, -0.8, 0.5, 0.3, -0.2];
    let targets: [f32; 4] = [0.1, -0.3, 0.6, 0.2];
    let mut mem = Memory::new(params.as_mut_slice(), work.as_mut_slice())
        .unwrap()
        .with_input(bytemuck::cast_slice(&inputs))
        .with_target(bytemuck::cast_slice(&targets));

    use rand::SeedableRng;
    let mut rng = rand::rngs::StdRng::seed_from_u64(9);
    model.init_params(&mut mem, &mut rng).unwrap();
    model.init_optimizer_state(&opt, &mut mem).unwrap();

    let before = model.calc_loss(&mut mem, 4).unwrap();
    for _ in 0..300 {
        model.train(&mut mem, 4, 4, &mut opt).unwrap();
    }
    let after = model.calc_loss(&mut mem, 4).unwrap();
    assert!(after < before, "loss did not decrease: {} → {}", before, after);
}

// Quantized layers

#[test]
fn test_dense_q7_forward_known_values() {
    let mut model = Model::new()
        .add(InputLayer::new(DType::Q7, (1, 2)))
        .add(DenseQ7::new(2));
    model.compile().unwrap();
    let (mut params, mut work) = plan_inference(&mut model);

    let input: [i8; 2] = [16, 32]; // 1.0, 2.0 at shift 4
    let mut mem = Memory::new(params.as_mut_slice(), work.as_mut_slice())
        .unwrap()
        .with_input(bytemuck::cast_slice(&input));

    let qp_io = QuantParams { shift: 4, zero: 0 };
    let input_qp_region = model.layers()[0].result().qparams_region().unwrap();
    mem.set_qparams(input_qp_region, qp_io).unwrap();
    let result_qp_region = model.layers()[1].result().qparams_region().unwrap();
    mem.set_qparams(result_qp_region, qp_io).unwrap();

    {
        let layer = &model.layers()[1];
        let params = layer.trainable_params();
        let (weights, bias) = (params[0].clone(), params[1].clone());
        mem.set_qparams(
            weights.qparams_region().unwrap(),
            QuantParams { shift: 5, zero: 0 },
        )
        .unwrap();
        // Identity matrix at shift 5.
        weights
            .as_i8_mut(&mut mem)
            .unwrap()
            .copy_from_slice(&[32, 0, 0, 32]);
        bias.as_i32_mut(&mut mem).unwrap().copy_from_slice(&[0, 0]);
    }

    let out = model.forward(&mut mem).unwrap();
    assert_eq!(out.as_i8(&mem).unwrap(), &[16, 32]);
    assert_eq!(model.output_qparams(&mem).unwrap(), Some(qp_io));
}

#[test]
fn test_trainable_flags() {
    let dense = Dense::new(3);
    assert!(dense.settings().trainable());
    let dense_q7 = DenseQ7::new(3);
    assert!(!dense_q7.settings().trainable());
    assert_eq!(dense_q7.trainable_params().len(), 2);
}
