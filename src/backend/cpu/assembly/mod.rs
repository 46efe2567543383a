//! Hand-tuned micro-kernels.
//!
//! Each wrapper decides at configure whether its micro-kernel covers the
//! request. An unsupported request is not an error: the wrapper simply stays
//! unconfigured and the caller falls back to the generic kernel.

pub mod depthwise;
pub mod gemm;
#[cfg(target_arch = "aarch64")]
mod neon;
pub mod pooling;

pub use depthwise::CpuDepthwiseAssemblyKernel;
pub use gemm::CpuGemmAssemblyKernel;
pub use pooling::CpuPool2dAssemblyKernel;

use tracing::info;

use crate::error::KernelError;
use crate::telemetry;
use crate::types::TensorPack;
use crate::window::Window;

/// Interface of the micro-kernel library.
pub trait AsmKernel: Send + Sync {
    fn name(&self) -> &str;

    fn is_configured(&self) -> bool;

    /// Full iteration space; `execute` takes its share by thread id.
    fn get_window_size(&self) -> Result<Window, KernelError>;

    /// Axis partitioned between threads.
    fn split_dimension(&self) -> usize {
        Window::DIM_Y
    }

    /// Total scratch bytes for `num_threads` threads, split evenly.
    fn get_working_size(&self, num_threads: usize) -> usize;

    /// Run the share of `thread_id` out of `num_threads`.
    fn execute(
        &self,
        tensors: &TensorPack<'_>,
        workspace: &mut [u8],
        thread_id: usize,
        num_threads: usize,
    ) -> Result<(), KernelError>;
}

/// Sub-window owned by one thread.
pub(crate) fn thread_window(
    kernel: &dyn AsmKernel,
    thread_id: usize,
    num_threads: usize,
) -> Result<Window, KernelError> {
    let window = kernel.get_window_size()?;
    Ok(window.split_window(kernel.split_dimension(), thread_id, num_threads))
}

/// Log and count a request the micro-kernels do not cover.
pub(crate) fn record_unsupported(kernel: &str, reason: &str) {
    info!(kernel, reason, "assembly kernel not available, using generic path");
    telemetry::record_asm_fallback(kernel);
}
