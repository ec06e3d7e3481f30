// Quantization post-processor tests — calibrating a q7 model from its f32
// twin over a representative dataset.

use tern::prelude::*;
use tern::Model;

const DATASET: [f32; 8] = [0.5, -0.5, 1.0, 0.25, -1.0, 0.75, 0.0, -0.25];
const SAMPLES: usize = 4;

fn float_model() -> Model {
    let mut model = Model::new()
        .add(InputLayer::new(DType::F32, (1, 2)))
        .add(Dense::new(2))
        .add(ReLU::new())
        .add(Dense::new(1));
    model.compile().unwrap();
    model
}

fn q7_model() -> Model {
    let mut model = Model::new()
        .add(InputLayer::new(DType::Q7, (1, 2)))
        .add(DenseQ7::new(2))
        .add(ReLUQ7::new())
        .add(DenseQ7::new(1));
    model.compile().unwrap();
    model
}

fn plan(model: &mut Model) -> (AlignedBuffer, AlignedBuffer) {
    let psize = tern::parameter_memory_size(model).unwrap();
    tern::distribute_parameter_memory(model, psize).unwrap();
    let isize = tern::inference_memory_size(model).unwrap();
    tern::schedule_inference_memory(model, isize).unwrap();
    (AlignedBuffer::new(psize), AlignedBuffer::new(isize.max(8)))
}

fn load_float_weights(model: &Model, mem: &mut Memory) {
    let d1 = model.layers()[1].trainable_params();
    d1[0]
        .clone()
        .as_f32_mut(mem)
        .unwrap()
        .copy_from_slice(&[0.5, -0.25, 0.25, 0.5]);
    d1[1].clone().as_f32_mut(mem).unwrap().copy_from_slice(&[0.1, -0.1]);
    let d3 = model.layers()[3].trainable_params();
    d3[0]
        .clone()
        .as_f32_mut(mem)
        .unwrap()
        .copy_from_slice(&[0.8, -0.4]);
    d3[1].clone().as_f32_mut(mem).unwrap().copy_from_slice(&[0.05]);
}

/// Observed per-layer activation ranges of the float model over DATASET.
///
/// Walks layer by layer and samples each result right after it is written;
/// the double-buffered inference plan recycles result regions, so a result
/// only survives until the layer after next runs.
fn observed_ranges(model: &mut Model, mem: &mut Memory) -> Vec<(f32, f32)> {
    let mut ranges = vec![(f32::INFINITY, f32::NEG_INFINITY); model.layer_count()];
    for s in 0..SAMPLES {
        let micro: [f32; 2] = [DATASET[s * 2], DATASET[s * 2 + 1]];
        let mut step = Memory {
            params: &mut *mem.params,
            work: &mut *mem.work,
            input: bytemuck::cast_slice(&micro),
            target: &[],
        };
        let micro_bytes = model.layers()[0].result().byte_len();
        model.layers_mut()[0]
            .result_mut()
            .bind_data(Region::new(MemSpace::Input, 0, micro_bytes));
        for i in 0..model.layer_count() {
            if i > 0 {
                let input = model.layers()[i - 1].result().clone();
                model.layers_mut()[i].forward(&input, &mut step).unwrap();
            }
            for &v in model.layers()[i].result().as_f32(&step).unwrap() {
                ranges[i].0 = ranges[i].0.min(v);
                ranges[i].1 = ranges[i].1.max(v);
            }
        }
    }
    ranges
}

fn calibrated_pair() -> (Model, Model, AlignedBuffer, AlignedBuffer, AlignedBuffer, AlignedBuffer) {
    let mut fm = float_model();
    let mut qm = q7_model();
    let (mut fparams, mut fwork) = plan(&mut fm);
    let (mut qparams, mut qwork) = plan(&mut qm);

    {
        let mut fmem = Memory::new(fparams.as_mut_slice(), fwork.as_mut_slice())
            .unwrap()
            .with_input(bytemuck::cast_slice(&DATASET));
        load_float_weights(&fm, &mut fmem);
        let mut qmem = Memory::new(qparams.as_mut_slice(), qwork.as_mut_slice()).unwrap();
        quantize_model_f32_to_q7(&mut fm, &mut qm, &mut fmem, &mut qmem, SAMPLES).unwrap();
    }
    (fm, qm, fparams, fwork, qparams, qwork)
}

#[test]
fn test_calibration_covers_observed_ranges() {
    let (mut fm, qm, mut fparams, mut fwork, mut qparams, mut qwork) = calibrated_pair();
    let mut fmem = Memory::new(fparams.as_mut_slice(), fwork.as_mut_slice()).unwrap();
    let ranges = observed_ranges(&mut fm, &mut fmem);

    let qmem = Memory::new(qparams.as_mut_slice(), qwork.as_mut_slice()).unwrap();
    for (i, layer) in qm.layers().iter().enumerate() {
        let qp = layer.result().quant_params(&qmem).unwrap();
        let (min, max) = ranges[i];
        assert!(
            qp.min_f32() <= min && qp.max_f32() >= max,
            "layer {} grid [{}, {}] does not cover observed [{}, {}]",
            i,
            qp.min_f32(),
            qp.max_f32(),
            min,
            max
        );
    }
}

#[test]
fn test_relu_q7_reuses_input_grid() {
    let (_fm, qm, _fp, _fw, mut qparams, mut qwork) = calibrated_pair();
    let qmem = Memory::new(qparams.as_mut_slice(), qwork.as_mut_slice()).unwrap();
    let dense_qp = qm.layers()[1].result().quant_params(&qmem).unwrap();
    let relu_qp = qm.layers()[2].result().quant_params(&qmem).unwrap();
    assert_eq!(dense_qp, relu_qp);
}

#[test]
fn test_dense_bias_carries_accumulator_shift() {
    let (_fm, qm, _fp, _fw, mut qparams, mut qwork) = calibrated_pair();
    let qmem = Memory::new(qparams.as_mut_slice(), qwork.as_mut_slice()).unwrap();

    let input_qp = qm.layers()[0].result().quant_params(&qmem).unwrap();
    let params = qm.layers()[1].trainable_params();
    let weight_qp = params[0].quant_params(&qmem).unwrap();
    let bias_qp = params[1].quant_params(&qmem).unwrap();
    assert_eq!(bias_qp.shift, input_qp.shift + weight_qp.shift);
    assert_eq!(bias_qp.zero, 0);
    assert_eq!(weight_qp.zero, 0);
}

#[test]
fn test_q7_inference_tracks_float_model() {
    let (mut fm, mut qm, mut fparams, mut fwork, mut qparams, mut qwork) = calibrated_pair();

    for s in 0..SAMPLES {
        let micro: [f32; 2] = [DATASET[s * 2], DATASET[s * 2 + 1]];
        let mut fmem = Memory::new(fparams.as_mut_slice(), fwork.as_mut_slice())
            .unwrap()
            .with_input(bytemuck::cast_slice(&micro));
        let f_out = fm.forward(&mut fmem).unwrap().as_f32(&fmem).unwrap()[0];

        let mut qmem = Memory::new(qparams.as_mut_slice(), qwork.as_mut_slice()).unwrap();
        let input_qp = qm.layers()[0].result().quant_params(&qmem).unwrap();
        let q_in: [i8; 2] = [
            input_qp
                .quantize_f32(micro[0])
                .clamp(i8::MIN as i32, i8::MAX as i32) as i8,
            input_qp
                .quantize_f32(micro[1])
                .clamp(i8::MIN as i32, i8::MAX as i32) as i8,
        ];
        let mut qmem = qmem.with_input(bytemuck::cast_slice(&q_in));
        let q_raw = qm.forward(&mut qmem).unwrap().as_i8(&qmem).unwrap()[0];
        let out_qp = qm.output_qparams(&qmem).unwrap().unwrap();
        let q_out = out_qp.dequantize_to_f32(q_raw as i32);

        assert!(
            (f_out - q_out).abs() < 0.15,
            "sample {}: float {} vs q7 {}",
            s,
            f_out,
            q_out
        );
    }
}

#[test]
fn test_structural_mismatch_is_rejected() {
    let mut fm = float_model();
    let mut qm = {
        let mut model = Model::new()
            .add(InputLayer::new(DType::Q7, (1, 2)))
            .add(DenseQ7::new(2));
        model.compile().unwrap();
        model
    };
    let (mut fparams, mut fwork) = plan(&mut fm);
    let (mut qparams, mut qwork) = plan(&mut qm);

    let mut fmem = Memory::new(fparams.as_mut_slice(), fwork.as_mut_slice())
        .unwrap()
        .with_input(bytemuck::cast_slice(&DATASET));
    let mut qmem = Memory::new(qparams.as_mut_slice(), qwork.as_mut_slice()).unwrap();
    assert!(quantize_model_f32_to_q7(&mut fm, &mut qm, &mut fmem, &mut qmem, SAMPLES).is_err());
}
