//! NHWC depth-first pooling micro-kernel.
//!
//! Reduces whole channel rows at a time, so the channel axis maps onto SIMD
//! lanes. Only available on 64-bit targets.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

#[cfg(target_arch = "aarch64")]
use super::neon;
use super::{record_unsupported, thread_window, AsmKernel};
use crate::backend::cpu::CpuInfo;
use crate::error::KernelError;
use crate::kernel::KernelState;
use crate::ops::pooling::{div_round_half_away, validate_pooling, PoolGeometry, PoolRequantize};
use crate::ops::shape::compute_pool_shape;
use crate::quantization::get_min_max_values_from_quantized_data_type;
use crate::types::{
    DataLayout, DataType, FloatElement, IntElement, PoolingLayerInfo, PoolingType, Steps,
    TensorInfo, TensorPack, TensorSlot, MAX_DIMS,
};
use crate::window::{calculate_max_window, Dimension, Window};

type RunFn = fn(&CpuPool2dAssemblyKernel, &TensorPack<'_>, &Window) -> Result<(), KernelError>;

/// Assembly wrapper of the pooling layer.
pub struct CpuPool2dAssemblyKernel {
    state: KernelState,
    geometry: Option<PoolGeometry>,
    requantize: Option<PoolRequantize>,
    type_min: i32,
    channels: usize,
    simd: bool,
    run_method: Option<RunFn>,
}

impl CpuPool2dAssemblyKernel {
    pub fn new() -> Self {
        Self {
            state: KernelState::new("cpu_pool2d_assembly"),
            geometry: None,
            requantize: None,
            type_min: 0,
            channels: 0,
            simd: false,
            run_method: None,
        }
    }

    pub fn validate(src: &TensorInfo, dst: &TensorInfo, info: &PoolingLayerInfo) -> Result<(), KernelError> {
        validate_pooling(src, dst, info)
    }

    /// Why the micro-kernels cannot run this request, if they cannot.
    pub fn unsupported_reason(src: &TensorInfo, dst: &TensorInfo, info: &PoolingLayerInfo, cpu: &CpuInfo) -> Option<&'static str> {
        if !cpu.is_64bit() {
            return Some("32-bit is not supported by assembly kernels");
        }
        let layout = if info.data_layout == DataLayout::Unknown {
            src.data_layout()
        } else {
            info.data_layout
        };
        if src.data_layout() != DataLayout::Nhwc || layout != DataLayout::Nhwc {
            return Some("Only NHWC is supported by assembly kernels");
        }
        if !matches!(info.pool_type, PoolingType::Avg | PoolingType::Max) {
            return Some("Only AVG and MAX pooling are supported by assembly kernels");
        }
        if src.data_type() == DataType::F16 && !cpu.has_fp16 {
            return Some("F16 needs half-precision arithmetic support");
        }
        let ps = &info.pad_stride_info;
        let (pw, ph) = (info.pool_size.width, info.pool_size.height);
        if !info.is_global_pooling
            && (pw <= ps.pad_left || pw <= ps.pad_right || ph <= ps.pad_top || ph <= ps.pad_bottom)
        {
            return Some("Pooling region that is entirely outside input tensor is unsupported by assembly kernels");
        }
        if src.data_type().is_quantized()
            && info.pool_type == PoolingType::Max
            && dst.total_size() != 0
            && dst.quantization_info() != src.quantization_info()
        {
            return Some("Requantization is not supported for MAX pooling");
        }
        None
    }

    /// Configure if the micro-kernels cover the request; otherwise stay
    /// unconfigured without error.
    pub fn configure(
        &mut self,
        src: &TensorInfo,
        dst: &mut TensorInfo,
        info: &PoolingLayerInfo,
        cpu: &CpuInfo,
    ) -> Result<(), KernelError> {
        self.state.ensure_unconfigured()?;
        Self::validate(src, dst, info)?;
        if let Some(reason) = Self::unsupported_reason(src, dst, info, cpu) {
            record_unsupported(self.state.name(), reason);
            return Ok(());
        }

        let shape = compute_pool_shape(src, info)?;
        dst.auto_init_from(src, shape, src.data_type());

        let data_type = src.data_type();
        self.run_method = Some(match data_type {
            DataType::F32 => Self::run_float::<f32>,
            DataType::F16 => Self::run_float::<half::f16>,
            DataType::QAsymm8 => Self::run_quantized::<u8>,
            DataType::QAsymm8Signed => Self::run_quantized::<i8>,
            other => {
                return Err(KernelError::UnsupportedDataType {
                    data_type: other,
                    context: "assembly pooling".to_string(),
                })
            }
        });
        if data_type.is_quantized() {
            self.type_min = get_min_max_values_from_quantized_data_type(data_type)?.0;
            self.requantize = PoolRequantize::new(src, dst)?;
        }
        self.geometry = Some(PoolGeometry::new(src, info));
        self.channels = src.dimension(0);
        self.simd = cpu.has_simd();

        let isa = if cpu.has_avx2 { "x64" } else { "a64" };
        let pool = if info.pool_type == PoolingType::Max { "max" } else { "avg" };
        let name = format!(
            "{isa}_{}_nhwc_{pool}_generic_depthfirst",
            data_type.to_string().to_lowercase()
        );
        // channels are reduced as whole rows
        let window = calculate_max_window(dst.shape(), &Steps::new(&[self.channels]));
        self.state.finish(name, "", window);
        Ok(())
    }

    fn geometry(&self) -> Result<&PoolGeometry, KernelError> {
        self.geometry
            .as_ref()
            .ok_or_else(|| KernelError::NotConfigured(self.state.name().to_string()))
    }

    fn run_float<T: FloatElement>(&self, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let geom = self.geometry()?;
        let src = tensors.get_const(TensorSlot::Src0)?;
        let dst = tensors.get_mut(TensorSlot::Dst0)?;
        let channels = self.channels;
        let mut acc = vec![0f32; channels];
        let mut row = vec![0f32; channels];

        for_each_output(window, |ox, oy, batch| {
            let region = geom.region(ox, oy);
            let init = if geom.pool_type == PoolingType::Max { f32::MIN } else { 0.0 };
            acc.iter_mut().for_each(|a| *a = init);
            for y in region.y_begin..region.y_end {
                for x in region.x_begin..region.x_end {
                    let base = src.info().offset_of(&nhwc(0, x, y, batch));
                    for (c, slot) in row.iter_mut().enumerate() {
                        *slot = src.get_at::<T>(base + c * T::SIZE).to_f32();
                    }
                    if geom.pool_type == PoolingType::Max {
                        max_rows(&mut acc, &row, self.simd);
                    } else {
                        add_rows(&mut acc, &row, self.simd);
                    }
                }
            }
            let base = dst.info().offset_of(&nhwc(0, ox, oy, batch));
            for (c, value) in acc.iter().enumerate() {
                let value = if geom.pool_type == PoolingType::Avg {
                    value / region.divisor as f32
                } else {
                    *value
                };
                dst.set_at(base + c * T::SIZE, T::from_f32(value));
            }
        });
        Ok(())
    }

    fn run_quantized<T: IntElement>(&self, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let geom = self.geometry()?;
        let src = tensors.get_const(TensorSlot::Src0)?;
        let dst = tensors.get_mut(TensorSlot::Dst0)?;
        let mut acc = vec![0i64; self.channels];

        for_each_output(window, |ox, oy, batch| {
            let region = geom.region(ox, oy);
            let init = if geom.pool_type == PoolingType::Max { self.type_min as i64 } else { 0 };
            acc.iter_mut().for_each(|a| *a = init);
            for y in region.y_begin..region.y_end {
                for x in region.x_begin..region.x_end {
                    let base = src.info().offset_of(&nhwc(0, x, y, batch));
                    for (c, slot) in acc.iter_mut().enumerate() {
                        let v = src.get_at::<T>(base + c * T::SIZE).to_i32() as i64;
                        if geom.pool_type == PoolingType::Max {
                            *slot = (*slot).max(v);
                        } else {
                            *slot += v;
                        }
                    }
                }
            }
            let base = dst.info().offset_of(&nhwc(0, ox, oy, batch));
            for (c, value) in acc.iter().enumerate() {
                let mut q = if geom.pool_type == PoolingType::Avg {
                    div_round_half_away(*value, region.divisor) as i32
                } else {
                    *value as i32
                };
                if let Some(requantize) = &self.requantize {
                    q = requantize.apply(q);
                }
                dst.set_at(base + c * T::SIZE, T::from_i32(q));
            }
        });
        Ok(())
    }
}

impl Default for CpuPool2dAssemblyKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl AsmKernel for CpuPool2dAssemblyKernel {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn is_configured(&self) -> bool {
        self.state.is_configured()
    }

    fn get_window_size(&self) -> Result<Window, KernelError> {
        self.state.window().copied()
    }

    /// Accumulators live on the stack of each call.
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

#[inline]
fn nhwc(channel: usize, x: usize, y: usize, batch: usize) -> [usize; MAX_DIMS] {
    let mut c = [0; MAX_DIMS];
    c[0] = channel;
    c[1] = x;
    c[2] = y;
    c[3] = batch;
    c
}

/// Visit every `(x, y, batch)` output position of an NHWC window.
fn for_each_output(window: &Window, mut f: impl FnMut(usize, usize, usize)) {
    let mut positions = *window;
    positions.set(Window::DIM_X, Dimension::new(0, 1, 1));
    for block in positions.blocks() {
        f(block.start[1], block.start[2], block.start[3]);
    }
}

fn max_rows(acc: &mut [f32], row: &[f32], simd: bool) {
    let done = if simd { max_rows_simd(acc, row) } else { 0 };
    for (a, r) in acc[done..].iter_mut().zip(&row[done..]) {
        *a = a.max(*r);
    }
}

fn add_rows(acc: &mut [f32], row: &[f32], simd: bool) {
    let done = if simd { add_rows_simd(acc, row) } else { 0 };
    for (a, r) in acc[done..].iter_mut().zip(&row[done..]) {
        *a += *r;
    }
}

#[cfg(target_arch = "x86_64")]
fn max_rows_simd(acc: &mut [f32], row: &[f32]) -> usize {
    if !crate::backend::cpu::avx2_available() {
        return 0;
    }
    // SAFETY: AVX2 detected above.
    unsafe { max_rows_avx2(acc, row) }
}

#[cfg(target_arch = "x86_64")]
fn add_rows_simd(acc: &mut [f32], row: &[f32]) -> usize {
    if !crate::backend::cpu::avx2_available() {
        return 0;
    }
    // SAFETY: AVX2 detected above.
    unsafe { add_rows_avx2(acc, row) }
}

#[cfg(target_arch = "aarch64")]
fn max_rows_simd(acc: &mut [f32], row: &[f32]) -> usize {
    // SAFETY: NEON is baseline on aarch64.
    unsafe { neon::max_f32_neon(acc, row) }
}

#[cfg(target_arch = "aarch64")]
fn add_rows_simd(acc: &mut [f32], row: &[f32]) -> usize {
    // SAFETY: NEON is baseline on aarch64.
    unsafe { neon::add_f32_neon(acc, row) }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn max_rows_simd(_acc: &mut [f32], _row: &[f32]) -> usize {
    0
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn add_rows_simd(_acc: &mut [f32], _row: &[f32]) -> usize {
    0
}

// ============================================================================
// AVX2 Kernels (x86_64)
// ============================================================================

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn max_rows_avx2(acc: &mut [f32], row: &[f32]) -> usize {
    let len = acc.len().min(row.len());
    let chunks = len / 8;
    for i in 0..chunks {
        let offset = i * 8;
        let a = _mm256_loadu_ps(acc.as_ptr().add(offset));
        let r = _mm256_loadu_ps(row.as_ptr().add(offset));
        _mm256_storeu_ps(acc.as_mut_ptr().add(offset), _mm256_max_ps(a, r));
    }
    chunks * 8
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn add_rows_avx2(acc: &mut [f32], row: &[f32]) -> usize {
    let len = acc.len().min(row.len());
    let chunks = len / 8;
    for i in 0..chunks {
        let offset = i * 8;
        let a = _mm256_loadu_ps(acc.as_ptr().add(offset));
        let r = _mm256_loadu_ps(row.as_ptr().add(offset));
        _mm256_storeu_ps(acc.as_mut_ptr().add(offset), _mm256_add_ps(a, r));
    }
    chunks * 8
}
