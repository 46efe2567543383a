//! CPU backend.
//!
//! Generic kernels live in [`kernels`]; hand-tuned micro-kernels are behind
//! [`assembly`]. Feature detection runs once per process and is cached.

pub mod assembly;
pub mod kernels;
pub mod scheduler;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

pub use scheduler::{CpuScheduler, SchedulerConfig};

static AVX2_AVAILABLE: AtomicBool = AtomicBool::new(false);
static DOT_PRODUCT_AVAILABLE: AtomicBool = AtomicBool::new(false);
static FP16_AVAILABLE: AtomicBool = AtomicBool::new(false);
static SIMD_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize SIMD detection (call once at startup).
#[cfg(target_arch = "x86_64")]
pub fn init_simd() {
    AVX2_AVAILABLE.store(is_x86_feature_detected!("avx2"), Ordering::Relaxed);
    FP16_AVAILABLE.store(is_x86_feature_detected!("f16c"), Ordering::Relaxed);
    SIMD_INITIALIZED.store(true, Ordering::Relaxed);
}

#[cfg(target_arch = "aarch64")]
pub fn init_simd() {
    // NEON is baseline on aarch64
    DOT_PRODUCT_AVAILABLE.store(
        std::arch::is_aarch64_feature_detected!("dotprod"),
        Ordering::Relaxed,
    );
    FP16_AVAILABLE.store(std::arch::is_aarch64_feature_detected!("fp16"), Ordering::Relaxed);
    SIMD_INITIALIZED.store(true, Ordering::Relaxed);
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn init_simd() {
    SIMD_INITIALIZED.store(true, Ordering::Relaxed);
}

fn ensure_initialized() {
    if !SIMD_INITIALIZED.load(Ordering::Relaxed) {
        init_simd();
    }
}

/// Instruction set family of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuArch {
    X86_64,
    X86,
    Aarch64,
    Armv7,
    Other,
}

impl CpuArch {
    pub fn current() -> Self {
        if cfg!(target_arch = "x86_64") {
            CpuArch::X86_64
        } else if cfg!(target_arch = "x86") {
            CpuArch::X86
        } else if cfg!(target_arch = "aarch64") {
            CpuArch::Aarch64
        } else if cfg!(target_arch = "arm") {
            CpuArch::Armv7
        } else {
            CpuArch::Other
        }
    }

    pub fn is_64bit(self) -> bool {
        matches!(self, CpuArch::X86_64 | CpuArch::Aarch64)
    }
}

impl fmt::Display for CpuArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuArch::X86_64 => write!(f, "x86_64"),
            CpuArch::X86 => write!(f, "x86"),
            CpuArch::Aarch64 => write!(f, "aarch64"),
            CpuArch::Armv7 => write!(f, "armv7"),
            CpuArch::Other => write!(f, "other"),
        }
    }
}

/// Capabilities that drive micro-kernel selection.
///
/// Kernels take this by value at configure, so tests can describe a target
/// other than the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub arch: CpuArch,
    pub has_neon: bool,
    pub has_avx2: bool,
    pub has_dot_product: bool,
    pub has_fp16: bool,
    pub num_cores: usize,
}

impl CpuInfo {
    /// Capabilities of the running host.
    pub fn detect() -> Self {
        ensure_initialized();
        let arch = CpuArch::current();
        Self {
            arch,
            has_neon: arch == CpuArch::Aarch64,
            has_avx2: AVX2_AVAILABLE.load(Ordering::Relaxed),
            has_dot_product: DOT_PRODUCT_AVAILABLE.load(Ordering::Relaxed),
            has_fp16: FP16_AVAILABLE.load(Ordering::Relaxed),
            num_cores: num_cpus::get().max(1),
        }
    }

    /// A target with no optional extensions.
    pub fn baseline(arch: CpuArch) -> Self {
        Self {
            arch,
            has_neon: arch == CpuArch::Aarch64,
            has_avx2: false,
            has_dot_product: false,
            has_fp16: false,
            num_cores: 1,
        }
    }

    pub fn is_64bit(&self) -> bool {
        self.arch.is_64bit()
    }

    /// True when some vector extension the micro-kernels target is present.
    pub fn has_simd(&self) -> bool {
        self.has_neon || self.has_avx2
    }
}

impl Default for CpuInfo {
    fn default() -> Self {
        Self::detect()
    }
}

/// AVX2 availability on this host, detected lazily.
pub(crate) fn avx2_available() -> bool {
    ensure_initialized();
    AVX2_AVAILABLE.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_matches_compile_target() {
        let info = CpuInfo::detect();
        assert_eq!(info.arch, CpuArch::current());
        assert!(info.num_cores >= 1);
        #[cfg(target_arch = "aarch64")]
        assert!(info.has_neon);
        #[cfg(target_arch = "x86_64")]
        assert_eq!(info.has_avx2, avx2_available());
    }

    #[test]
    fn test_baseline_targets() {
        let armv7 = CpuInfo::baseline(CpuArch::Armv7);
        assert!(!armv7.is_64bit());
        assert!(!armv7.has_simd());
        let a64 = CpuInfo::baseline(CpuArch::Aarch64);
        assert!(a64.is_64bit() && a64.has_neon);
        assert_eq!(CpuArch::X86_64.to_string(), "x86_64");
    }
}
