//! NHWC depthwise micro-kernels for 3x3 and 5x5 filters.
//!
//! Channels map onto SIMD lanes; every tap multiplies a channel row of the
//! source by the matching weight row. Multiplies and adds stay separate so
//! float results match the generic kernel exactly.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

#[cfg(target_arch = "aarch64")]
use super::neon;
use super::{record_unsupported, thread_window, AsmKernel};
use crate::backend::cpu::CpuInfo;
use crate::error::KernelError;
use crate::kernel::KernelState;
use crate::ops::conv::{ConvGeometry, Requantize};
use crate::ops::depthwise::{validate_depthwise, DepthwiseInfo};
use crate::ops::shape::compute_depthwise_convolution_shape;
use crate::types::{
    ActivationFunction, ActivationLayerInfo, DataLayout, DataType, FloatElement, IntElement,
    Steps, TensorInfo, TensorPack, TensorSlot, MAX_DIMS,
};
use crate::window::{calculate_max_window, Dimension, Window};

type RunFn = fn(&CpuDepthwiseAssemblyKernel, &TensorPack<'_>, &Window) -> Result<(), KernelError>;

/// Assembly dispatch of the depthwise convolution.
pub struct CpuDepthwiseAssemblyKernel {
    state: KernelState,
    geometry: Option<ConvGeometry>,
    requantize: Option<Requantize>,
    activation: ActivationLayerInfo,
    channels: usize,
    simd: bool,
    run_method: Option<RunFn>,
}

impl CpuDepthwiseAssemblyKernel {
    pub fn new() -> Self {
        Self {
            state: KernelState::new("cpu_depthwise_assembly"),
            geometry: None,
            requantize: None,
            activation: ActivationLayerInfo::disabled(),
            channels: 0,
            simd: false,
            run_method: None,
        }
    }

    pub fn validate(
        src: &TensorInfo,
        weights: &TensorInfo,
        biases: Option<&TensorInfo>,
        dst: &TensorInfo,
        info: &DepthwiseInfo,
    ) -> Result<(), KernelError> {
        validate_depthwise(src, weights, biases, dst, info)
    }

    /// Why the micro-kernels cannot run this request, if they cannot.
    pub fn unsupported_reason(
        src: &TensorInfo,
        weights: &TensorInfo,
        dst: &TensorInfo,
        info: &DepthwiseInfo,
        cpu: &CpuInfo,
    ) -> Option<&'static str> {
        if !cpu.is_64bit() {
            return Some("32-bit is not supported by assembly kernels");
        }
        if src.data_layout() != DataLayout::Nhwc {
            return Some("Only NHWC is supported by assembly kernels");
        }
        let data_type = src.data_type();
        if !(data_type.is_float() || data_type == DataType::QAsymm8) {
            return Some("Only F16, F32 and QASYMM8 sources are supported");
        }
        if data_type == DataType::F16 && !cpu.has_fp16 {
            return Some("F16 needs half-precision arithmetic support");
        }
        if info.depth_multiplier != 1 {
            return Some("Depth multiplier must be 1");
        }
        let layout = src.data_layout();
        let (kw, kh) = (
            weights.dimension(layout.width_index()),
            weights.dimension(layout.height_index()),
        );
        let ps = &info.pad_stride;
        let supported_filter = kw == kh
            && ps.stride_x == ps.stride_y
            && matches!((kw, ps.stride_x), (3, 1) | (3, 2) | (5, 1) | (5, 2));
        if !supported_filter {
            return Some("Only 3x3 and 5x5 filters with equal strides of 1 or 2 are supported");
        }
        let valid = !ps.has_padding();
        let (same_x, same_y) = (
            same_padding(src.dimension(layout.width_index()), kw, ps.stride_x),
            same_padding(src.dimension(layout.height_index()), kh, ps.stride_y),
        );
        let same = (ps.pad_left, ps.pad_right) == same_x && (ps.pad_top, ps.pad_bottom) == same_y;
        if !(valid || same) {
            return Some("Only valid or same padding is supported");
        }
        let act = &info.activation;
        let relu_like = matches!(act.function, ActivationFunction::Relu)
            || (act.function == ActivationFunction::BoundedRelu && act.a == 6.0);
        if act.enabled && act.function != ActivationFunction::Identity && !relu_like {
            return Some("Only RELU and RELU6 activations are fused");
        }
        if data_type.is_quantized() {
            let iq = src.quantization_info().uniform();
            let oq = if dst.quantization_info().is_empty() {
                iq
            } else {
                dst.quantization_info().uniform()
            };
            if weights
                .quantization_info()
                .scales()
                .iter()
                .any(|s| iq.scale * s / oq.scale > 1.0)
            {
                return Some("Requantization multiplier above one");
            }
        }
        None
    }

    /// Configure if the micro-kernels cover the request; otherwise stay
    /// unconfigured without error.
    pub fn configure(
        &mut self,
        src: &TensorInfo,
        weights: &TensorInfo,
        biases: Option<&TensorInfo>,
        dst: &mut TensorInfo,
        info: &DepthwiseInfo,
        cpu: &CpuInfo,
    ) -> Result<(), KernelError> {
        self.state.ensure_unconfigured()?;
        Self::validate(src, weights, biases, dst, info)?;
        if let Some(reason) = Self::unsupported_reason(src, weights, dst, info, cpu) {
            record_unsupported(self.state.name(), reason);
            return Ok(());
        }

        let shape = compute_depthwise_convolution_shape(src, weights, &info.pad_stride, 1)?;
        dst.auto_init_from(src, shape, src.data_type());

        let data_type = src.data_type();
        self.run_method = Some(match data_type {
            DataType::F32 => Self::run_float::<f32>,
            DataType::F16 => Self::run_float::<half::f16>,
            DataType::QAsymm8 => Self::run_quantized::<u8>,
            other => {
                return Err(KernelError::UnsupportedDataType {
                    data_type: other,
                    context: "assembly depthwise".to_string(),
                })
            }
        });
        if data_type.is_quantized() {
            self.requantize = Some(Requantize::new(src, weights, dst, &info.activation)?);
        }
        self.geometry = Some(ConvGeometry::new(src, weights, &info.pad_stride));
        self.activation = info.activation;
        self.channels = src.dimension(0);
        self.simd = cpu.has_simd();

        let isa = if cpu.has_avx2 { "x64" } else { "a64" };
        let kernel = weights.dimension(1);
        let name = format!(
            "{isa}_{}_nhwc_{kernel}x{kernel}_s{}_output2x2_mla_depthfirst",
            data_type.to_string().to_lowercase(),
            info.pad_stride.stride_x
        );
        let window = calculate_max_window(dst.shape(), &Steps::new(&[self.channels]));
        self.state.finish(name, "", window);
        Ok(())
    }

    fn geometry(&self) -> Result<&ConvGeometry, KernelError> {
        self.geometry
            .as_ref()
            .ok_or_else(|| KernelError::NotConfigured(self.state.name().to_string()))
    }

    fn run_float<T: FloatElement>(&self, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let geom = self.geometry()?;
        let src = tensors.get_const(TensorSlot::Src0)?;
        let weights = tensors.get_const(TensorSlot::Src1)?;
        let bias = tensors.find_const(TensorSlot::Src2);
        let dst = tensors.get_mut(TensorSlot::Dst0)?;
        let channels = self.channels;
        let mut acc = vec![0f32; channels];
        let mut src_row = vec![0f32; channels];
        let mut weight_row = vec![0f32; channels];

        for_each_output(window, |ox, oy, batch| {
            acc.iter_mut().for_each(|a| *a = 0.0);
            geom.for_each_tap(ox, oy, |kx, ky, ix, iy| {
                let src_base = src.info().offset_of(&nhwc(0, ix, iy, batch));
                let w_base = weights.info().offset_of(&nhwc(0, kx, ky, 0));
                for c in 0..channels {
                    src_row[c] = src.get_at::<T>(src_base + c * T::SIZE).to_f32();
                    weight_row[c] = weights.get_at::<T>(w_base + c * T::SIZE).to_f32();
                }
                mul_add_rows(&mut acc, &src_row, &weight_row, self.simd);
            });
            let base = dst.info().offset_of(&nhwc(0, ox, oy, batch));
            for (c, value) in acc.iter().enumerate() {
                let biased = match &bias {
                    Some(b) => value + b.element::<T>(c).to_f32(),
                    None => *value,
                };
                dst.set_at(base + c * T::SIZE, T::from_f32(self.activation.apply(biased)));
            }
        });
        Ok(())
    }

    fn run_quantized<T: IntElement>(&self, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let geom = self.geometry()?;
        let requant = self
            .requantize
            .as_ref()
            .ok_or_else(|| KernelError::NotConfigured(self.state.name().to_string()))?;
        let src = tensors.get_const(TensorSlot::Src0)?;
        let weights = tensors.get_const(TensorSlot::Src1)?;
        let bias = tensors.find_const(TensorSlot::Src2);
        let dst = tensors.get_mut(TensorSlot::Dst0)?;
        let per_channel_weights = weights.info().data_type().is_quantized_per_channel();
        let mut acc = vec![0i32; self.channels];

        for_each_output(window, |ox, oy, batch| {
            acc.iter_mut().for_each(|a| *a = 0);
            geom.for_each_tap(ox, oy, |kx, ky, ix, iy| {
                let src_base = src.info().offset_of(&nhwc(0, ix, iy, batch));
                let w_base = weights.info().offset_of(&nhwc(0, kx, ky, 0));
                for (c, slot) in acc.iter_mut().enumerate() {
                    let s = src.get_at::<T>(src_base + c * T::SIZE).to_i32().wrapping_add(requant.src_offset);
                    let w = if per_channel_weights {
                        weights.get_at::<i8>(w_base + c) as i32
                    } else {
                        weights.get_at::<T>(w_base + c * T::SIZE).to_i32()
                    };
                    *slot = slot.wrapping_add(s.wrapping_mul(w.wrapping_add(requant.weights_offset)));
                }
            });
            let base = dst.info().offset_of(&nhwc(0, ox, oy, batch));
            for (c, value) in acc.iter().enumerate() {
                let biased = value.wrapping_add(bias.map_or(0, |b| b.element::<i32>(c)));
                dst.set_at(base + c * T::SIZE, T::from_i32(requant.apply(biased, c)));
            }
        });
        Ok(())
    }
}

impl Default for CpuDepthwiseAssemblyKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl AsmKernel for CpuDepthwiseAssemblyKernel {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn is_configured(&self) -> bool {
        self.state.is_configured()
    }

    fn get_window_size(&self) -> Result<Window, KernelError> {
        self.state.window().copied()
    }

    fn get_working_size(&self, _num_threads: usize) -> usize {
        0
    }

    fn execute(
        &self,
        tensors: &TensorPack<'_>,
        _workspace: &mut [u8],
        thread_id: usize,
        num_threads: usize,
    ) -> Result<(), KernelError> {
        let run = self
            .run_method
            .ok_or_else(|| KernelError::NotConfigured(self.state.name().to_string()))?;
        let window = thread_window(self, thread_id, num_threads)?;
        run(self, tensors, &window)
    }
}

/// Padding `(before, after)` that keeps `ceil(extent / stride)` outputs.
fn same_padding(extent: usize, kernel: usize, stride: usize) -> (usize, usize) {
    let out = extent.div_ceil(stride.max(1));
    let total = ((out.max(1) - 1) * stride + kernel).saturating_sub(extent);
    (total / 2, total - total / 2)
}

#[inline]
fn nhwc(channel: usize, x: usize, y: usize, batch: usize) -> [usize; MAX_DIMS] {
    let mut c = [0; MAX_DIMS];
    c[0] = channel;
    c[1] = x;
    c[2] = y;
    c[3] = batch;
    c
}

fn for_each_output(window: &Window, mut f: impl FnMut(usize, usize, usize)) {
    let mut positions = *window;
    positions.set(Window::DIM_X, Dimension::new(0, 1, 1));
    for block in positions.blocks() {
        f(block.start[1], block.start[2], block.start[3]);
    }
}

fn mul_add_rows(acc: &mut [f32], a: &[f32], b: &[f32], simd: bool) {
    let mut done = 0;
    if simd {
        #[cfg(target_arch = "x86_64")]
        if crate::backend::cpu::avx2_available() {
            // SAFETY: AVX2 detected above.
            done = unsafe { mul_add_rows_avx2(acc, a, b) };
        }
        #[cfg(target_arch = "aarch64")]
        {
            // SAFETY: NEON is baseline on aarch64.
            done = unsafe { neon::mul_add_f32_neon(acc, a, b) };
        }
    }
    for ((acc, a), b) in acc[done..].iter_mut().zip(&a[done..]).zip(&b[done..]) {
        *acc += a * b;
    }
}

// ============================================================================
// AVX2 Kernels (x86_64)
// ============================================================================

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn mul_add_rows_avx2(acc: &mut [f32], a: &[f32], b: &[f32]) -> usize {
    let len = acc.len().min(a.len()).min(b.len());
    let chunks = len / 8;
    for i in 0..chunks {
        let offset = i * 8;
        let va = _mm256_loadu_ps(a.as_ptr().add(offset));
        let vb = _mm256_loadu_ps(b.as_ptr().add(offset));
        let vacc = _mm256_loadu_ps(acc.as_ptr().add(offset));
        _mm256_storeu_ps(acc.as_mut_ptr().add(offset), _mm256_add_ps(vacc, _mm256_mul_ps(va, vb)));
    }
    chunks * 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuArch;
    use crate::types::{PadStrideInfo, QuantizationInfo, TensorShape};

    fn nhwc_info(shape: &[usize], dt: DataType) -> TensorInfo {
        TensorInfo::new(TensorShape::new(shape), dt).with_layout(DataLayout::Nhwc)
    }

    #[test]
    fn test_same_padding() {
        assert_eq!(same_padding(8, 3, 1), (1, 1));
        assert_eq!(same_padding(8, 3, 2), (0, 1));
        assert_eq!(same_padding(7, 5, 1), (2, 2));
    }

    #[test]
    fn test_support_matrix() {
        let cpu = CpuInfo::baseline(CpuArch::Aarch64);
        let src = nhwc_info(&[8, 8, 8], DataType::F32);
        let w3 = nhwc_info(&[8, 3, 3], DataType::F32);
        let same = DepthwiseInfo::new(PadStrideInfo::new(1, 1, 1, 1), 1);
        let empty = TensorInfo::empty();
        assert_eq!(CpuDepthwiseAssemblyKernel::unsupported_reason(&src, &w3, &empty, &same, &cpu), None);

        let stride3 = DepthwiseInfo::new(PadStrideInfo::new(3, 3, 0, 0), 1);
        assert!(CpuDepthwiseAssemblyKernel::unsupported_reason(&src, &w3, &empty, &stride3, &cpu).is_some());

        let odd_pad = DepthwiseInfo::new(PadStrideInfo::new(1, 1, 2, 0), 1);
        assert!(CpuDepthwiseAssemblyKernel::unsupported_reason(&src, &w3, &empty, &odd_pad, &cpu).is_some());

        let signed = nhwc_info(&[8, 8, 8], DataType::QAsymm8Signed)
            .with_quantization(QuantizationInfo::new(0.5, 0));
        assert!(CpuDepthwiseAssemblyKernel::unsupported_reason(&signed, &w3, &empty, &same, &cpu).is_some());

        let armv7 = CpuInfo::baseline(CpuArch::Armv7);
        assert!(CpuDepthwiseAssemblyKernel::unsupported_reason(&src, &w3, &empty, &same, &armv7).is_some());
    }

    #[test]
    fn test_unsupported_leaves_kernel_unconfigured() {
        let src = nhwc_info(&[4, 6, 6], DataType::F32);
        let weights = nhwc_info(&[8, 3, 3], DataType::F32);
        let info = DepthwiseInfo::new(PadStrideInfo::new(1, 1, 0, 0), 2);
        let mut dst = TensorInfo::empty();
        let mut kernel = CpuDepthwiseAssemblyKernel::new();
        kernel
            .configure(&src, &weights, None, &mut dst, &info, &CpuInfo::baseline(CpuArch::X86_64))
            .unwrap();
        assert!(!kernel.is_configured());
    }
}
