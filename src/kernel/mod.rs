//! The validate / configure / run contract shared by every kernel.
//!
//! Each kernel type provides an associated `validate(..)` that only reads
//! descriptors, a `configure(&mut self, ..)` that may be called once, and
//! implements [`Kernel`] so schedulers can run it over sub-windows.

pub mod validate;

use tracing::debug;

use crate::error::KernelError;
use crate::telemetry::{self, KernelSpan};
use crate::types::{BorderSize, TensorPack};
use crate::window::Window;

/// Minimum workload size reported when a kernel has no preference.
pub const DEFAULT_MWS: usize = 1;

/// Capability shared by CPU and device kernels.
pub trait Kernel: Send + Sync {
    /// Kernel name; device kernels report the selected source variant.
    fn name(&self) -> &str;

    /// Configured execution window.
    fn window(&self) -> Result<&Window, KernelError>;

    fn is_configured(&self) -> bool;

    /// Halo the kernel reads around its window.
    fn border_size(&self) -> BorderSize {
        BorderSize::default()
    }

    /// Minimum number of window iterations worth giving one thread.
    fn get_mws(&self, _thread_count: usize) -> usize {
        DEFAULT_MWS
    }

    /// Execute over `window`, a sub-window of the configured one.
    fn run(&self, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError>;
}

/// Run a kernel over its whole configured window.
pub fn run_configured(kernel: &dyn Kernel, tensors: &TensorPack<'_>) -> Result<(), KernelError> {
    let window = *kernel.window()?;
    kernel.run(tensors, &window)
}

/// Lifecycle bookkeeping embedded in every kernel.
///
/// Enforces `Unconfigured -> Configured`: a second configure and any run
/// before configure fail with a precondition error.
#[derive(Debug, Clone)]
pub struct KernelState {
    name: String,
    config_id: String,
    window: Option<Window>,
}

impl KernelState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config_id: String::new(),
            window: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    pub fn is_configured(&self) -> bool {
        self.window.is_some()
    }

    /// Fails if `configure` already succeeded.
    pub fn ensure_unconfigured(&self) -> Result<(), KernelError> {
        if self.is_configured() {
            return Err(KernelError::AlreadyConfigured(self.name.clone()));
        }
        Ok(())
    }

    /// Record a successful configure.
    pub fn finish(&mut self, name: impl Into<String>, config_id: impl Into<String>, window: Window) {
        self.name = name.into();
        self.config_id = config_id.into();
        let _span = KernelSpan::configure(&self.name).entered();
        debug!(kernel = %self.name, config_id = %self.config_id, window = %window, "kernel configured");
        telemetry::record_kernel_configured(&self.name);
        self.window = Some(window);
    }

    pub fn window(&self) -> Result<&Window, KernelError> {
        self.window
            .as_ref()
            .ok_or_else(|| KernelError::NotConfigured(self.name.clone()))
    }

    /// Check that `window` may be passed to `run`.
    pub fn check_run(&self, window: &Window) -> Result<(), KernelError> {
        self.window()?.validate_subwindow(window)
    }
}
