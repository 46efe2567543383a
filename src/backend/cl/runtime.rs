// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! The device runtime seam: compile a named program with build options,
//! then enqueue it over a window.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::options::BuildOptions;
use crate::error::KernelError;
use crate::types::TensorPack;
use crate::window::Window;

/// Local work-group size hint.
pub type Lws = [usize; 3];

/// Device capabilities consulted while selecting kernel variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// `cl_khr_fp16` is available
    pub supports_fp16: bool,
    /// 8-bit dot product instructions are available
    pub supports_dot8: bool,
    /// Largest work-group the device accepts
    pub max_work_group_size: usize,
    /// Number of compute units
    pub compute_units: usize,
}

impl DeviceInfo {
    /// Device description of the in-process host runtime.
    pub fn host() -> Self {
        Self {
            name: "host".to_string(),
            supports_fp16: true,
            supports_dot8: false,
            max_work_group_size: 256,
            compute_units: num_cpus::get(),
        }
    }

    pub fn with_dot8(mut self, supports_dot8: bool) -> Self {
        self.supports_dot8 = supports_dot8;
        self
    }
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self::host()
    }
}

/// A compiled program as returned by [`ClRuntime::compile`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelHandle {
    name: String,
    key: String,
}

impl KernelHandle {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }

    /// Kernel entry point name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Program cache key, see [`program_key`].
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, &self.key[..self.key.len().min(12)])
    }
}

/// Hex SHA-256 of the kernel name and its rendered build options.
pub fn program_key(name: &str, options: &BuildOptions) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(options.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Device runtime used by every OpenCL kernel.
///
/// `enqueue` may return before the work completes; callers synchronise
/// through the runtime, never through the kernel.
pub trait ClRuntime: Send + Sync {
    fn compile(&self, name: &str, options: &BuildOptions) -> Result<KernelHandle, KernelError>;

    fn enqueue(
        &self,
        kernel: &KernelHandle,
        tensors: &TensorPack<'_>,
        window: &Window,
        lws: Option<Lws>,
    ) -> Result<(), KernelError>;

    fn device_info(&self) -> &DeviceInfo;
}
