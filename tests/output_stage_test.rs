//! GEMMLowp output stage: golden values and bit-exactness across backends.

use std::sync::Arc;

use gg_compute::backend::cl::{ClRuntime, HostClRuntime};
use gg_compute::backend::cpu::{CpuArch, CpuInfo, CpuScheduler};
use gg_compute::types::{
    ActivationFunction, ActivationLayerInfo, DataType, GemmLowpOutputStageInfo, OutputStageType,
    QuantizationInfo, Tensor, TensorInfo, TensorShape,
};
use gg_compute::{compose_output_stage, ExecutionTarget, GemmLowpOutputStage, KernelError, QuantizedGemm};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn opencl() -> ExecutionTarget {
    let runtime: Arc<dyn ClRuntime> = Arc::new(HostClRuntime::with_builtin_programs());
    ExecutionTarget::opencl(runtime)
}

/// A 64-bit CPU target regardless of the host, so the fused micro-kernel is taken.
fn cpu_assembly() -> ExecutionTarget {
    ExecutionTarget::Cpu {
        scheduler: CpuScheduler::with_threads(3),
        cpu: CpuInfo::baseline(CpuArch::Aarch64),
        allow_assembly: true,
    }
}

fn s32(shape: &[usize], values: &[i32]) -> Tensor {
    Tensor::from_slice(TensorInfo::new(TensorShape::new(shape), DataType::S32), values).unwrap()
}

fn run_stage(
    target: &ExecutionTarget,
    src: &Tensor,
    bias: Option<&Tensor>,
    info: &GemmLowpOutputStageInfo,
) -> Tensor {
    let mut stage = GemmLowpOutputStage::new();
    let mut dst_info = TensorInfo::empty();
    stage
        .configure(target, src.info(), bias.map(|b| b.info()), &mut dst_info, info)
        .unwrap();
    let mut dst = Tensor::new(dst_info);
    stage.run(src, bias, &mut dst).unwrap();
    dst
}

/// Float emulation of the fixed-point pipeline.
///
/// The high multiply rounds half up; the shift rounds half away from zero.
fn emulate_fixed_point(acc: i32, bias: i32, multiplier: i32, shift: i32, offset: i32, min: i32, max: i32) -> i32 {
    let x = (acc + bias) as f64;
    let high = (x * multiplier as f64 / 2f64.powi(31) + 0.5).floor();
    let shifted = (high / 2f64.powi(shift)).round();
    (shifted as i32 + offset).clamp(min, max)
}

#[test]
fn per_tensor_requantize_matches_golden() {
    let acc = s32(&[3], &[1000, -2000, 500]);
    let bias = s32(&[3], &[10, 10, 10]);
    let info = GemmLowpOutputStageInfo::fixed_point(DataType::QAsymm8, 0x4000_0000, 1, 128);
    let expected: Vec<u8> = [1000, -2000, 500]
        .iter()
        .map(|a| emulate_fixed_point(*a, 10, 0x4000_0000, 1, 128, 0, 255) as u8)
        .collect();
    assert_eq!(expected, vec![255, 0, 255]);

    for target in [ExecutionTarget::cpu(), ExecutionTarget::cpu_generic(), opencl()] {
        let dst = run_stage(&target, &acc, Some(&bias), &info);
        assert_eq!(dst.info().data_type(), DataType::QAsymm8);
        assert_eq!(dst.to_vec::<u8>(), expected, "backend {}", target.kind());
    }
}

#[test]
fn unsaturated_values_match_emulation() {
    let mut rng = StdRng::seed_from_u64(11);
    let values: Vec<i32> = (0..67 * 5).map(|_| rng.gen_range(-600..600)).collect();
    let acc = s32(&[67, 5], &values);
    let info = GemmLowpOutputStageInfo::fixed_point(DataType::QAsymm8Signed, 0x4000_0000, 2, -7);

    let dst = run_stage(&opencl(), &acc, None, &info);
    let expected: Vec<i8> = values
        .iter()
        .map(|a| emulate_fixed_point(*a, 0, 0x4000_0000, 2, -7, -128, 127) as i8)
        .collect();
    assert_eq!(dst.to_vec::<i8>(), expected);
}

#[test]
fn backends_are_bit_exact_on_random_accumulators() {
    let mut rng = StdRng::seed_from_u64(0xacc);
    for (cols, rows) in [(1, 1), (3, 7), (16, 4), (17, 9), (33, 2)] {
        let values: Vec<i32> = (0..cols * rows).map(|_| rng.gen_range(-50_000..50_000)).collect();
        let bias_values: Vec<i32> = (0..cols).map(|_| rng.gen_range(-500..500)).collect();
        let acc = s32(&[cols, rows], &values);
        let bias = s32(&[cols], &bias_values);

        let stages = [
            GemmLowpOutputStageInfo::fixed_point(DataType::QAsymm8, 1_395_864_371, 8, 3),
            GemmLowpOutputStageInfo::fixed_point(DataType::QAsymm8Signed, 1_073_741_824, -1, 0)
                .with_bounds(-20, 90),
            GemmLowpOutputStageInfo::fixed_point(DataType::QSymm16, 2_000_000_000, 4, 0),
            GemmLowpOutputStageInfo {
                kind: OutputStageType::QuantizeDown,
                output_data_type: DataType::QAsymm8,
                gemmlowp_offset: 11,
                gemmlowp_multiplier: 3,
                gemmlowp_shift: 9,
                gemmlowp_min_bound: 0,
                gemmlowp_max_bound: 255,
                ..GemmLowpOutputStageInfo::default()
            },
            GemmLowpOutputStageInfo {
                kind: OutputStageType::QuantizeDownFloat,
                output_data_type: DataType::QAsymm8Signed,
                gemmlowp_offset: -4,
                gemmlowp_real_multiplier: 0.0031,
                gemmlowp_min_bound: -128,
                gemmlowp_max_bound: 127,
                ..GemmLowpOutputStageInfo::default()
            },
        ];
        for info in &stages {
            let cpu = run_stage(&ExecutionTarget::cpu_generic(), &acc, Some(&bias), info);
            let cl = run_stage(&opencl(), &acc, Some(&bias), info);
            assert_eq!(cpu.bytes(), cl.bytes(), "{:?} on {cols}x{rows}", info.kind);
        }
    }
}

#[test]
fn fused_gemm_matches_two_pass_on_every_backend() {
    let mut rng = StdRng::seed_from_u64(5);
    let lhs_info = TensorInfo::new(TensorShape::new(&[19, 7]), DataType::QAsymm8)
        .with_quantization(QuantizationInfo::new(0.04, 9));
    let rhs_info = TensorInfo::new(TensorShape::new(&[11, 19]), DataType::QAsymm8)
        .with_quantization(QuantizationInfo::new(0.015, 120));
    let dst_template = TensorInfo::new(TensorShape::new(&[11, 7]), DataType::QAsymm8)
        .with_quantization(QuantizationInfo::new(0.08, 100));
    let info = compose_output_stage(
        OutputStageType::QuantizeDownFixedPoint,
        lhs_info.quantization_info(),
        rhs_info.quantization_info(),
        &dst_template,
        &ActivationLayerInfo::new(ActivationFunction::Relu, 0.0, 0.0),
    )
    .unwrap();

    let lhs_values: Vec<u8> = (0..19 * 7).map(|_| rng.gen()).collect();
    let rhs_values: Vec<u8> = (0..11 * 19).map(|_| rng.gen()).collect();
    let bias_values: Vec<i32> = (0..11).map(|_| rng.gen_range(-2000..2000)).collect();
    let lhs = Tensor::from_slice(lhs_info.clone(), &lhs_values).unwrap();
    let rhs = Tensor::from_slice(rhs_info.clone(), &rhs_values).unwrap();
    let bias = s32(&[11], &bias_values);

    let mut outputs = Vec::new();
    for target in [cpu_assembly(), ExecutionTarget::cpu_generic(), opencl()] {
        let mut gemm = QuantizedGemm::new();
        let mut dst_info = dst_template.clone();
        gemm.configure(&target, &lhs_info, &rhs_info, Some(bias.info()), &mut dst_info, &info)
            .unwrap();
        if matches!(target, ExecutionTarget::Cpu { allow_assembly: true, .. }) {
            assert!(gemm.is_fused());
        } else {
            assert!(!gemm.is_fused());
        }
        let mut dst = Tensor::new(dst_info);
        gemm.run(&lhs, &rhs, Some(&bias), &mut dst).unwrap();
        outputs.push(dst.to_vec::<u8>());
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[1], outputs[2]);
    // Relu clamps at the output zero point
    assert!(outputs[0].iter().all(|v| *v >= 100));
}

#[test]
fn equal_bounds_mean_type_range() {
    let acc = s32(&[4], &[-1000, -10, 10, 1000]);
    let info = GemmLowpOutputStageInfo::fixed_point(DataType::QAsymm8, 0x4000_0000, 0, 0).with_bounds(50, 50);
    for target in [ExecutionTarget::cpu_generic(), opencl()] {
        let dst = run_stage(&target, &acc, None, &info);
        assert_eq!(dst.to_vec::<u8>(), vec![0, 0, 5, 255]);
    }
}

#[test]
fn validate_rejects_mismatching_destination_without_mutating_it() {
    let src = TensorInfo::new(TensorShape::new(&[8, 4]), DataType::S32);
    let info = GemmLowpOutputStageInfo::fixed_point(DataType::QAsymm8, 0x4000_0000, 1, 0);
    let wrong = TensorInfo::new(TensorShape::new(&[8, 5]), DataType::QAsymm8);

    for target in [ExecutionTarget::cpu_generic(), opencl()] {
        let err = GemmLowpOutputStage::validate(&target, &src, None, &wrong, &info).unwrap_err();
        assert!(matches!(err, KernelError::MismatchingShapes(_)), "{err}");
        assert!(err.to_string().contains("output shape does not match computed shape"));

        let mut dst = wrong.clone();
        let mut stage = GemmLowpOutputStage::new();
        assert!(stage.configure(&target, &src, None, &mut dst, &info).is_err());
        assert_eq!(dst, wrong);
        assert!(!stage.is_configured());
    }
}

#[test]
fn opencl_rejects_per_channel_requantization() {
    let src = TensorInfo::new(TensorShape::new(&[2, 2]), DataType::S32);
    let mut info = GemmLowpOutputStageInfo::fixed_point(DataType::QAsymm8, 0x4000_0000, 1, 0);
    info.is_quantized_per_channel = true;
    info.gemmlowp_multipliers = vec![0x4000_0000, 0x5000_0000];
    info.gemmlowp_shifts = vec![1, 2];

    assert!(GemmLowpOutputStage::validate(&ExecutionTarget::cpu_generic(), &src, None, &TensorInfo::empty(), &info).is_ok());
    assert!(GemmLowpOutputStage::validate(&opencl(), &src, None, &TensorInfo::empty(), &info).is_err());
}

#[test]
fn second_configure_is_rejected() {
    let src = TensorInfo::new(TensorShape::new(&[4]), DataType::S32);
    let info = GemmLowpOutputStageInfo::fixed_point(DataType::QAsymm8, 0x4000_0000, 1, 0);
    let mut stage = GemmLowpOutputStage::new();
    stage
        .configure(&ExecutionTarget::cpu_generic(), &src, None, &mut TensorInfo::empty(), &info)
        .unwrap();
    assert_eq!(stage.kernel_name(), Some("cpu_gemmlowp_quantize_down_int32_scale_by_fixedpoint"));
    let err = stage
        .configure(&ExecutionTarget::cpu_generic(), &src, None, &mut TensorInfo::empty(), &info)
        .unwrap_err();
    assert!(matches!(err, KernelError::AlreadyConfigured(_)));
}
