// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! OpenCL backend.
//!
//! Kernels pick a program name and a set of build options at configure,
//! compile them through a [`ClRuntime`] and enqueue the compiled program
//! over 3D slices of their window at run time. [`HostClRuntime`] executes
//! the programs in-process.

pub mod host;
pub mod kernels;
pub mod options;
pub mod runtime;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

pub use host::{Defines, HostClRuntime, HostProgram};
pub use options::{BuildOptions, ConfigId};
pub use runtime::{program_key, ClRuntime, DeviceInfo, KernelHandle, Lws};

use crate::error::KernelError;
use crate::kernel::KernelState;
use crate::telemetry::KernelSpan;
use crate::types::TensorPack;
use crate::window::Window;

/// Vectorisation preferences shared by every device kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClTuning {
    /// Upper bound for any `VEC_SIZE`/`N0` a kernel selects.
    pub max_vec_size: usize,
    /// Round the global work size up to a multiple of the local size.
    pub use_dummy_work_items: bool,
}

impl Default for ClTuning {
    fn default() -> Self {
        Self {
            max_vec_size: 16,
            use_dummy_work_items: false,
        }
    }
}

impl ClTuning {
    /// `preferred` capped by `max_vec_size`, then fitted to `dim0`.
    pub fn vec_size(&self, preferred: usize, dim0: usize) -> usize {
        crate::window::adjust_vec_size(preferred.min(self.max_vec_size.max(1)), dim0)
    }
}

/// State common to all device kernels.
pub struct ClKernel {
    state: KernelState,
    runtime: Arc<dyn ClRuntime>,
    tuning: ClTuning,
    handle: Option<KernelHandle>,
    build_options: BuildOptions,
    lws_hint: Option<Lws>,
    slice_dims: usize,
}

impl ClKernel {
    pub fn new(name: &str, runtime: Arc<dyn ClRuntime>, tuning: ClTuning) -> Self {
        Self {
            state: KernelState::new(name),
            runtime,
            tuning,
            handle: None,
            build_options: BuildOptions::new(),
            lws_hint: None,
            slice_dims: 3,
        }
    }

    pub fn state(&self) -> &KernelState {
        &self.state
    }

    pub fn ensure_unconfigured(&self) -> Result<(), KernelError> {
        self.state.ensure_unconfigured()
    }

    pub fn device_info(&self) -> &DeviceInfo {
        self.runtime.device_info()
    }

    pub fn tuning(&self) -> &ClTuning {
        &self.tuning
    }

    /// Compile `name` with `options` and record the configuration.
    ///
    /// `slice_dims` is the number of window axes covered by one enqueue.
    pub fn build(
        &mut self,
        name: &str,
        options: BuildOptions,
        config_id: impl Into<String>,
        window: Window,
        slice_dims: usize,
    ) -> Result<(), KernelError> {
        let handle = self.runtime.compile(name, &options)?;
        self.handle = Some(handle);
        self.build_options = options;
        self.slice_dims = slice_dims;
        self.state.finish(name, config_id, window);
        Ok(())
    }

    pub fn set_lws_hint(&mut self, lws: Lws) {
        self.lws_hint = Some(lws);
    }

    pub fn lws_hint(&self) -> Option<Lws> {
        self.lws_hint
    }

    pub fn build_options(&self) -> &BuildOptions {
        &self.build_options
    }

    pub fn config_id(&self) -> &str {
        self.state.config_id()
    }

    /// Work items launched for one slice.
    pub fn global_work_size(&self, slice: &Window) -> [usize; 3] {
        let mut gws = [0; 3];
        for (axis, size) in gws.iter_mut().enumerate() {
            *size = slice.num_iterations(axis).max(1);
            if let (true, Some(lws)) = (self.tuning.use_dummy_work_items, self.lws_hint) {
                *size = size.next_multiple_of(lws[axis].max(1));
            }
        }
        gws
    }

    /// Enqueue the compiled program once per slice of `window`.
    pub fn enqueue(&self, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        self.state.check_run(window)?;
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| KernelError::NotConfigured(self.state.name().to_string()))?;
        let _span = KernelSpan::run(self.state.name(), window).entered();
        if window.is_empty() {
            return Ok(());
        }
        let mut slice = match self.slice_dims {
            1 => window.first_slice_window_1d(),
            2 => window.first_slice_window_2d(),
            3 => window.first_slice_window_3d(),
            n => window.first_slice_window(n),
        };
        loop {
            trace!(gws = ?self.global_work_size(&slice), "enqueue slice");
            self.runtime.enqueue(handle, tensors, &slice, self.lws_hint)?;
            if !window.slide_window_slice(self.slice_dims, &mut slice) {
                break;
            }
        }
        Ok(())
    }
}

/// Implement [`Kernel`](crate::kernel::Kernel) for a struct holding a `kernel: ClKernel` field.
macro_rules! impl_cl_kernel {
    ($kernel:ty) => {
        impl $crate::kernel::Kernel for $kernel {
            fn name(&self) -> &str {
                self.kernel.state().name()
            }

            fn window(&self) -> Result<&$crate::window::Window, $crate::error::KernelError> {
                self.kernel.state().window()
            }

            fn is_configured(&self) -> bool {
                self.kernel.state().is_configured()
            }

            fn run(
                &self,
                tensors: &$crate::types::TensorPack<'_>,
                window: &$crate::window::Window,
            ) -> Result<(), $crate::error::KernelError> {
                self.kernel.enqueue(tensors, window)
            }
        }
    };
}
pub(crate) use impl_cl_kernel;
