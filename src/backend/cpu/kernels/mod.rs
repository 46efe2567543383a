//! Generic CPU kernels.
//!
//! Every kernel resolves its typed run method once in `configure` and keeps
//! it as a plain function pointer; `run` only checks the window and calls it.

pub mod depthwise;
pub mod direct_conv;
pub mod gemm;
pub mod gemmlowp_mm;
pub mod gemmlowp_output_stage;
pub mod layer_norm;
pub mod pool2d;
pub mod softmax;

pub use depthwise::CpuDepthwiseConv2dNativeKernel;
pub use direct_conv::CpuDirectConv2dKernel;
pub use gemm::CpuGemmMatrixMultiplyKernel;
pub use gemmlowp_mm::CpuGemmLowpMatrixMultiplyKernel;
pub use gemmlowp_output_stage::CpuGemmLowpOutputStageKernel;
pub use layer_norm::CpuQLayerNormKernel;
pub use pool2d::CpuPool2dKernel;
pub use softmax::CpuSoftmaxKernel;

use crate::error::KernelError;
use crate::kernel::KernelState;
use crate::telemetry::KernelSpan;
use crate::types::{Coordinates, DataType, TensorPack, TensorViewMut};
use crate::window::{Dimension, Window};

/// Typed body of a kernel, chosen at configure.
pub(crate) type RunFn<K> = fn(&K, &TensorPack<'_>, &Window) -> Result<(), KernelError>;

/// Shared `run` path: window check, span, then the stored method.
pub(crate) fn dispatch<K>(
    kernel: &K,
    state: &KernelState,
    run_method: Option<RunFn<K>>,
    tensors: &TensorPack<'_>,
    window: &Window,
) -> Result<(), KernelError> {
    state.check_run(window)?;
    let run = run_method.ok_or_else(|| KernelError::NotConfigured(state.name().to_string()))?;
    let _span = KernelSpan::run(state.name(), window).entered();
    run(kernel, tensors, window)
}

/// Visit the first element of every row of `window`; axis 0 is left to the caller.
pub(crate) fn for_each_row(window: &Window, mut f: impl FnMut(Coordinates)) {
    let mut rows = *window;
    rows.set(Window::DIM_X, Dimension::new(0, 1, 1));
    for block in rows.blocks() {
        f(block.start);
    }
}

/// Store an already clamped quantized value with the destination's width.
pub(crate) fn store_quantized(dst: &TensorViewMut<'_>, coords: &Coordinates, value: i32) {
    match dst.info().data_type() {
        DataType::QAsymm8 => dst.set(coords, value as u8),
        DataType::QAsymm8Signed | DataType::QSymm8 | DataType::QSymm8PerChannel => {
            dst.set(coords, value as i8)
        }
        DataType::QSymm16 => dst.set(coords, value as i16),
        DataType::QAsymm16 => dst.set(coords, value as u16),
        _ => dst.set(coords, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Steps, Tensor, TensorInfo, TensorShape};
    use crate::window::calculate_max_window;

    #[test]
    fn test_for_each_row_visits_every_row_once() {
        let win = calculate_max_window(&TensorShape::new(&[5, 3, 2]), &Steps::default());
        let mut rows = Vec::new();
        for_each_row(&win, |c| rows.push((c[0], c[1], c[2])));
        assert_eq!(rows.len(), 6);
        assert!(rows.iter().all(|r| r.0 == 0));
        assert_eq!(rows[1], (0, 1, 0));
    }

    #[test]
    fn test_store_quantized_width() {
        let info = TensorInfo::new(TensorShape::new(&[2]), DataType::QSymm16);
        let mut tensor = Tensor::new(info);
        store_quantized(&tensor.view_mut(), &[1, 0, 0, 0, 0, 0], -300);
        assert_eq!(tensor.to_vec::<i16>(), vec![0, -300]);
    }
}
