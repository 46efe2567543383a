//! CPU scheduler: threaded runs must match single-threaded runs.

use gg_compute::backend::cpu::assembly::{AsmKernel, CpuPool2dAssemblyKernel};
use gg_compute::backend::cpu::kernels::{CpuGemmLowpOutputStageKernel, CpuPool2dKernel, CpuSoftmaxKernel};
use gg_compute::backend::cpu::{CpuArch, CpuInfo, CpuScheduler, SchedulerConfig};
use gg_compute::kernel::{run_configured, Kernel};
use gg_compute::types::{
    DataLayout, DataType, GemmLowpOutputStageInfo, PadStrideInfo, PoolingLayerInfo, PoolingType,
    QuantizationInfo, Size2D, SoftmaxInfo, Tensor, TensorInfo, TensorPack, TensorShape, TensorSlot,
};
use gg_compute::window::Window;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn run_with(scheduler: Option<&CpuScheduler>, kernel: &dyn Kernel, src: &Tensor, dst_info: &TensorInfo) -> Vec<u8> {
    let mut dst = Tensor::new(dst_info.clone());
    let pack = TensorPack::new()
        .with_const(TensorSlot::Src0, src.view())
        .with_mut(TensorSlot::Dst0, dst.view_mut());
    match scheduler {
        Some(scheduler) => scheduler.schedule(kernel, &pack).unwrap(),
        None => run_configured(kernel, &pack).unwrap(),
    }
    drop(pack);
    dst.bytes().to_vec()
}

#[test]
fn scheduler_thread_count() {
    assert_eq!(CpuScheduler::with_threads(3).num_threads(), 3);
    assert_eq!(CpuScheduler::with_threads(0).num_threads(), 1);
    assert!(CpuScheduler::new(SchedulerConfig::default()).num_threads() >= 1);
}

#[test]
fn pooling_is_thread_count_invariant() {
    let mut rng = StdRng::seed_from_u64(3);
    let src_info = TensorInfo::new(TensorShape::new(&[13, 11, 3]), DataType::QAsymm8)
        .with_quantization(QuantizationInfo::new(0.25, 4));
    let values: Vec<u8> = (0..13 * 11 * 3).map(|_| rng.gen()).collect();
    let src = Tensor::from_slice(src_info.clone(), &values).unwrap();
    let desc = PoolingLayerInfo::new(
        PoolingType::Avg,
        Size2D::new(3, 2),
        DataLayout::Nchw,
        PadStrideInfo::new(2, 1, 1, 0),
        true,
    );

    let mut dst_info = TensorInfo::empty();
    let mut kernel = CpuPool2dKernel::new();
    kernel.configure(&src_info, &mut dst_info, &desc).unwrap();

    let reference = run_with(None, &kernel, &src, &dst_info);
    for threads in 1..=4 {
        let scheduler = CpuScheduler::with_threads(threads);
        assert_eq!(run_with(Some(&scheduler), &kernel, &src, &dst_info), reference, "{threads} threads");
    }
}

#[test]
fn softmax_rows_split_across_threads() {
    let mut rng = StdRng::seed_from_u64(9);
    let src_info = TensorInfo::new(TensorShape::new(&[37, 8]), DataType::F32);
    let values: Vec<f32> = (0..37 * 8).map(|_| rng.gen_range(-4.0..4.0)).collect();
    let src = Tensor::from_slice(src_info.clone(), &values).unwrap();

    let mut dst_info = TensorInfo::empty();
    let mut kernel = CpuSoftmaxKernel::new();
    kernel.configure(&src_info, &mut dst_info, &SoftmaxInfo::default()).unwrap();

    let reference = run_with(None, &kernel, &src, &dst_info);
    for threads in 1..=4 {
        let scheduler = CpuScheduler::with_threads(threads);
        assert_eq!(run_with(Some(&scheduler), &kernel, &src, &dst_info), reference);
    }

    let out: Vec<f32> = reference
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    for row in out.chunks(37) {
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }
}

#[test]
fn output_stage_split_along_x_when_rows_are_few() {
    let mut rng = StdRng::seed_from_u64(21);
    let src_info = TensorInfo::new(TensorShape::new(&[64, 1]), DataType::S32);
    let values: Vec<i32> = (0..64).map(|_| rng.gen_range(-10_000..10_000)).collect();
    let src = Tensor::from_slice(src_info.clone(), &values).unwrap();
    let info = GemmLowpOutputStageInfo::fixed_point(DataType::QAsymm8Signed, 1_518_500_250, 6, 2);

    let mut dst_info = TensorInfo::empty();
    let mut kernel = CpuGemmLowpOutputStageKernel::new();
    kernel.configure(&src_info, None, &mut dst_info, &info).unwrap();

    let reference = run_with(None, &kernel, &src, &dst_info);
    for threads in 2..=4 {
        let scheduler = CpuScheduler::with_threads(threads);
        let mut dst = Tensor::new(dst_info.clone());
        let pack = TensorPack::new()
            .with_const(TensorSlot::Src0, src.view())
            .with_mut(TensorSlot::Dst0, dst.view_mut());
        scheduler.schedule_with_hint(&kernel, Window::DIM_Y, &pack).unwrap();
        drop(pack);
        assert_eq!(dst.bytes(), reference.as_slice());
    }
}

#[test]
fn assembly_pooling_is_thread_count_invariant() {
    let mut rng = StdRng::seed_from_u64(17);
    let src_info = TensorInfo::new(TensorShape::new(&[6, 9, 10]), DataType::F32).with_layout(DataLayout::Nhwc);
    let values: Vec<f32> = (0..6 * 9 * 10).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let src = Tensor::from_slice(src_info.clone(), &values).unwrap();
    let desc = PoolingLayerInfo::new(
        PoolingType::Max,
        Size2D::new(2, 2),
        DataLayout::Nhwc,
        PadStrideInfo::new(2, 2, 0, 0),
        false,
    );

    let mut dst_info = TensorInfo::empty();
    let mut kernel = CpuPool2dAssemblyKernel::new();
    kernel
        .configure(&src_info, &mut dst_info, &desc, &CpuInfo::baseline(CpuArch::X86_64))
        .unwrap();
    assert!(kernel.is_configured());

    let mut generic_dst = TensorInfo::empty();
    let mut generic = CpuPool2dKernel::new();
    generic.configure(&src_info, &mut generic_dst, &desc).unwrap();
    let reference = run_with(None, &generic, &src, &generic_dst);

    for threads in 1..=4 {
        let scheduler = CpuScheduler::with_threads(threads);
        let mut dst = Tensor::new(dst_info.clone());
        let pack = TensorPack::new()
            .with_const(TensorSlot::Src0, src.view())
            .with_mut(TensorSlot::Dst0, dst.view_mut());
        scheduler.run_asm(&kernel, &pack).unwrap();
        drop(pack);
        assert_eq!(dst.bytes(), reference.as_slice(), "{threads} threads");
    }
}

#[test]
fn scheduling_an_unconfigured_kernel_fails() {
    let kernel = CpuPool2dKernel::new();
    let src = Tensor::new(TensorInfo::new(TensorShape::new(&[4, 4]), DataType::F32));
    let mut dst = Tensor::new(TensorInfo::new(TensorShape::new(&[2, 2]), DataType::F32));
    let pack = TensorPack::new()
        .with_const(TensorSlot::Src0, src.view())
        .with_mut(TensorSlot::Dst0, dst.view_mut());
    assert!(CpuScheduler::with_threads(2).schedule(&kernel, &pack).is_err());
}
