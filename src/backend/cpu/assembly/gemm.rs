//! 8-bit GEMM micro-kernel with optional fused fixed-point requantization.
//!
//! The inner loop computes the raw `sum(a * b)` with SIMD widening
//! multiply-adds; zero-point offsets are folded in afterwards from row and
//! column sums. In 32-bit wrapping arithmetic this equals accumulating
//! `(a + a_offset) * (b + b_offset)` directly, so results match the generic
//! kernel bit for bit.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

#[cfg(target_arch = "aarch64")]
use super::neon;
use super::{record_unsupported, thread_window, AsmKernel};
use crate::backend::cpu::kernels::store_quantized;
use crate::backend::cpu::CpuInfo;
use crate::error::KernelError;
use crate::kernel::validate::ensure;
use crate::kernel::KernelState;
use crate::ops::gemmlowp::{validate_mm, validate_output_stage, GemmLowpMmInfo, OutputStageParams};
use crate::ops::shape::compute_mm_shape;
use crate::types::{
    DataType, GemmLowpOutputStageInfo, OutputStageType, QuantizationInfo, Steps, TensorInfo,
    TensorPack, TensorSlot, MAX_DIMS,
};
use crate::window::{calculate_max_window, Dimension, Window};

type DotFn = fn(&[u8], &[u8]) -> i32;

/// Assembly dispatch of the quantized matrix multiply.
pub struct CpuGemmAssemblyKernel {
    state: KernelState,
    k: usize,
    signed: bool,
    rhs_batched: bool,
    offsets: GemmLowpMmInfo,
    output_stage: Option<OutputStageParams>,
    dot: Option<DotFn>,
}

impl CpuGemmAssemblyKernel {
    pub fn new() -> Self {
        Self {
            state: KernelState::new("cpu_gemm_assembly"),
            k: 0,
            signed: false,
            rhs_batched: false,
            offsets: GemmLowpMmInfo::default(),
            output_stage: None,
            dot: None,
        }
    }

    /// Validate the request as a whole; a valid request may still be
    /// unsupported by the micro-kernels, see [`configure`](Self::configure).
    pub fn validate(
        lhs: &TensorInfo,
        rhs: &TensorInfo,
        bias: Option<&TensorInfo>,
        dst: &TensorInfo,
        output_stage: Option<&GemmLowpOutputStageInfo>,
    ) -> Result<(), KernelError> {
        match output_stage {
            None => {
                ensure(bias.is_none(), "Bias requires a fused output stage")?;
                validate_mm(lhs, rhs, dst)
            }
            Some(stage) => {
                validate_mm(lhs, rhs, &TensorInfo::empty())?;
                let acc = TensorInfo::new(compute_mm_shape(lhs, rhs), DataType::S32);
                validate_output_stage(&acc, bias, dst, stage)
            }
        }
    }

    /// Configure if the micro-kernels cover the request.
    ///
    /// Returns `Ok(())` and stays unconfigured when they do not; check
    /// [`AsmKernel::is_configured`] before running.
    pub fn configure(
        &mut self,
        lhs: &TensorInfo,
        rhs: &TensorInfo,
        bias: Option<&TensorInfo>,
        dst: &mut TensorInfo,
        output_stage: Option<&GemmLowpOutputStageInfo>,
        cpu: &CpuInfo,
    ) -> Result<(), KernelError> {
        self.state.ensure_unconfigured()?;
        Self::validate(lhs, rhs, bias, dst, output_stage)?;

        if !cpu.is_64bit() {
            record_unsupported(self.state.name(), "32-bit target");
            return Ok(());
        }
        if rhs.data_type() != lhs.data_type() {
            record_unsupported(self.state.name(), "mixed lhs/rhs types");
            return Ok(());
        }
        if let Some(stage) = output_stage {
            if stage.kind != OutputStageType::QuantizeDownFixedPoint {
                record_unsupported(self.state.name(), "only fixed-point requantization is fused");
                return Ok(());
            }
        }

        let signed = lhs.data_type() == DataType::QAsymm8Signed;
        let (dot, isa) = select_dot(cpu, signed);
        let shape = compute_mm_shape(lhs, rhs);
        match output_stage {
            Some(stage) => {
                dst.auto_init_if_empty(shape, stage.output_data_type, QuantizationInfo::default());
                self.output_stage = Some(OutputStageParams::new(stage)?);
            }
            None => {
                dst.auto_init_if_empty(shape, DataType::S32, QuantizationInfo::default());
            }
        }

        self.k = lhs.dimension(0);
        self.signed = signed;
        self.rhs_batched = rhs.num_dimensions() > 2;
        self.offsets = GemmLowpMmInfo::from_quantization(lhs, rhs);
        self.dot = Some(dot);

        let name = format!(
            "cpu_gemm_assembly_{isa}_{}",
            if signed { "s8" } else { "u8" }
        );
        let window = calculate_max_window(&shape, &Steps::default());
        self.state.finish(name, "", window);
        Ok(())
    }

    fn run_columns(
        &self,
        tensors: &TensorPack<'_>,
        packed: &mut [u8],
        window: &Window,
    ) -> Result<(), KernelError> {
        let dot = self.dot.ok_or_else(|| KernelError::NotConfigured(self.state.name().to_string()))?;
        let lhs = tensors.get_const(TensorSlot::Src0)?;
        let rhs = tensors.get_const(TensorSlot::Src1)?;
        let bias = tensors.find_const(TensorSlot::Src2);
        let dst = tensors.get_mut(TensorSlot::Dst0)?;
        let k = self.k;
        let widen = |b: u8| if self.signed { b as i8 as i32 } else { b as i32 };

        let mut outer = *window;
        outer.set(Window::DIM_X, Dimension::new(0, 1, 1));
        outer.set(Window::DIM_Y, Dimension::new(0, 1, 1));
        for block in outer.blocks() {
            let (z, w) = (block.start[2], block.start[3]);
            let row_sums: Vec<i32> = (window.y().start()..window.y().end())
                .map(|y| {
                    let start = lhs.info().offset_of(&coords(0, y, z, w));
                    lhs.bytes()[start..start + k]
                        .iter()
                        .fold(0i32, |acc, b| acc.wrapping_add(widen(*b)))
                })
                .collect();

            for x in window.x().start()..window.x().end() {
                let rz = if self.rhs_batched { z } else { 0 };
                let mut col_sum = 0i32;
                for (i, slot) in packed[..k].iter_mut().enumerate() {
                    let byte = rhs.bytes()[rhs.info().offset_of(&coords(x, i, rz, 0))];
                    *slot = byte;
                    col_sum = col_sum.wrapping_add(widen(byte));
                }

                for (row, y) in (window.y().start()..window.y().end()).enumerate() {
                    let start = lhs.info().offset_of(&coords(0, y, z, w));
                    let raw = dot(&lhs.bytes()[start..start + k], &packed[..k]);
                    let acc = self.offsets.contribute(raw, row_sums[row], col_sum, k);
                    let at = coords(x, y, z, w);
                    match &self.output_stage {
                        None => dst.set(&at, acc),
                        Some(stage) => {
                            let b = bias.map_or(0, |b| b.element::<i32>(x));
                            store_quantized(&dst, &at, stage.apply(acc, b, x));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for CpuGemmAssemblyKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl AsmKernel for CpuGemmAssemblyKernel {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn is_configured(&self) -> bool {
        self.state.is_configured()
    }

    fn get_window_size(&self) -> Result<Window, KernelError> {
        self.state.window().copied()
    }

    /// Threads own output columns so each packs its columns once.
    fn split_dimension(&self) -> usize {
        Window::DIM_X
    }

    fn get_working_size(&self, num_threads: usize) -> usize {
        self.k * num_threads.max(1)
    }

    fn execute(
        &self,
        tensors: &TensorPack<'_>,
        workspace: &mut [u8],
        thread_id: usize,
        num_threads: usize,
    ) -> Result<(), KernelError> {
        let window = thread_window(self, thread_id, num_threads)?;
        if workspace.len() < self.k {
            return Err(KernelError::InvalidArgument(format!(
                "workspace of {} bytes, need {}",
                workspace.len(),
                self.k
            )));
        }
        self.run_columns(tensors, workspace, &window)
    }
}

#[inline]
fn coords(x: usize, y: usize, z: usize, w: usize) -> [usize; MAX_DIMS] {
    let mut c = [0; MAX_DIMS];
    c[0] = x;
    c[1] = y;
    c[2] = z;
    c[3] = w;
    c
}

fn select_dot(cpu: &CpuInfo, signed: bool) -> (DotFn, &'static str) {
    if let Some(simd) = select_simd_dot(cpu, signed) {
        return simd;
    }
    if signed {
        (dot_scalar::<true>, "generic")
    } else {
        (dot_scalar::<false>, "generic")
    }
}

#[cfg(target_arch = "x86_64")]
fn select_simd_dot(cpu: &CpuInfo, signed: bool) -> Option<(DotFn, &'static str)> {
    if !(cpu.has_avx2 && crate::backend::cpu::avx2_available()) {
        return None;
    }
    Some(if signed {
        (dot_s8_avx2_entry, "avx2")
    } else {
        (dot_u8_avx2_entry, "avx2")
    })
}

#[cfg(target_arch = "aarch64")]
fn select_simd_dot(cpu: &CpuInfo, signed: bool) -> Option<(DotFn, &'static str)> {
    if !cpu.has_neon {
        return None;
    }
    Some(if signed {
        (dot_s8_neon_entry, "neon")
    } else {
        (dot_u8_neon_entry, "neon")
    })
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn select_simd_dot(_cpu: &CpuInfo, _signed: bool) -> Option<(DotFn, &'static str)> {
    None
}

fn dot_scalar<const SIGNED: bool>(a: &[u8], b: &[u8]) -> i32 {
    a.iter().zip(b).fold(0i32, |acc, (x, y)| {
        let (x, y) = if SIGNED {
            (*x as i8 as i32, *y as i8 as i32)
        } else {
            (*x as i32, *y as i32)
        };
        acc.wrapping_add(x * y)
    })
}

// ============================================================================
// AVX2 Kernels (x86_64)
// ============================================================================

#[cfg(target_arch = "x86_64")]
fn dot_u8_avx2_entry(a: &[u8], b: &[u8]) -> i32 {
    // SAFETY: selected only after AVX2 was detected on this host.
    unsafe { dot_avx2::<false>(a, b) }
}

#[cfg(target_arch = "x86_64")]
fn dot_s8_avx2_entry(a: &[u8], b: &[u8]) -> i32 {
    // SAFETY: as above.
    unsafe { dot_avx2::<true>(a, b) }
}

/// Widen 16 bytes to i16 and multiply-add pairs into eight i32 lanes.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn dot_avx2<const SIGNED: bool>(a: &[u8], b: &[u8]) -> i32 {
    let n = a.len().min(b.len());
    let mut acc = _mm256_setzero_si256();
    let mut i = 0;
    while i + 16 <= n {
        let ra = _mm_loadu_si128(a.as_ptr().add(i) as *const __m128i);
        let rb = _mm_loadu_si128(b.as_ptr().add(i) as *const __m128i);
        let (va, vb) = if SIGNED {
            (_mm256_cvtepi8_epi16(ra), _mm256_cvtepi8_epi16(rb))
        } else {
            (_mm256_cvtepu8_epi16(ra), _mm256_cvtepu8_epi16(rb))
        };
        acc = _mm256_add_epi32(acc, _mm256_madd_epi16(va, vb));
        i += 16;
    }
    let mut lanes = [0i32; 8];
    _mm256_storeu_si256(lanes.as_mut_ptr() as *mut __m256i, acc);
    let sum = lanes.iter().fold(0i32, |s, v| s.wrapping_add(*v));
    sum.wrapping_add(dot_scalar::<SIGNED>(&a[i..n], &b[i..n]))
}

// ============================================================================
// NEON Kernels (aarch64)
// ============================================================================

#[cfg(target_arch = "aarch64")]
fn dot_u8_neon_entry(a: &[u8], b: &[u8]) -> i32 {
    // SAFETY: NEON is baseline on aarch64.
    let (sum, done) = unsafe { neon::dot_u8_neon(a, b) };
    sum.wrapping_add(dot_scalar::<false>(&a[done..], &b[done..a.len().min(b.len())]))
}

#[cfg(target_arch = "aarch64")]
fn dot_s8_neon_entry(a: &[u8], b: &[u8]) -> i32 {
    // SAFETY: NEON is baseline on aarch64.
    let (sum, done) = unsafe { neon::dot_s8_neon(a, b) };
    sum.wrapping_add(dot_scalar::<true>(&a[done..], &b[done..a.len().min(b.len())]))
}
