//! Kernel backends.
//!
//! Both backends implement [`Kernel`](crate::kernel::Kernel) and share the
//! acceptance sets and per-point arithmetic in [`crate::ops`]; they differ
//! only in how a window is walked and how constants reach the code.

pub mod cl;
pub mod cpu;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ComputeConfig;
use cl::{ClRuntime, ClTuning};
use cpu::{CpuInfo, CpuScheduler};

/// Backend a kernel runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Cpu,
    OpenCl,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cpu => write!(f, "CPU"),
            BackendKind::OpenCl => write!(f, "OpenCL"),
        }
    }
}

/// Where an operator places its kernels.
#[derive(Clone)]
pub enum ExecutionTarget {
    /// Generic kernels on the scheduler, or micro-kernels when allowed and supported.
    Cpu {
        scheduler: CpuScheduler,
        cpu: CpuInfo,
        allow_assembly: bool,
    },
    OpenCl {
        runtime: Arc<dyn ClRuntime>,
        tuning: ClTuning,
    },
}

impl ExecutionTarget {
    /// Host CPU with every detected capability.
    pub fn cpu() -> Self {
        Self::Cpu {
            scheduler: CpuScheduler::default(),
            cpu: CpuInfo::detect(),
            allow_assembly: true,
        }
    }

    /// Host CPU restricted to the generic kernels.
    pub fn cpu_generic() -> Self {
        Self::Cpu {
            scheduler: CpuScheduler::default(),
            cpu: CpuInfo::detect(),
            allow_assembly: false,
        }
    }

    pub fn opencl(runtime: Arc<dyn ClRuntime>) -> Self {
        Self::OpenCl {
            runtime,
            tuning: ClTuning::default(),
        }
    }

    /// CPU target honouring the thread count and assembly preference.
    pub fn cpu_from_config(config: &ComputeConfig) -> Self {
        Self::Cpu {
            scheduler: CpuScheduler::with_threads(config.effective_threads()),
            cpu: CpuInfo::detect(),
            allow_assembly: config.cpu.allow_assembly,
        }
    }

    pub fn opencl_from_config(runtime: Arc<dyn ClRuntime>, config: &ComputeConfig) -> Self {
        Self::OpenCl {
            runtime,
            tuning: config.cl,
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Cpu { .. } => BackendKind::Cpu,
            Self::OpenCl { .. } => BackendKind::OpenCl,
        }
    }
}

impl fmt::Debug for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu {
                scheduler,
                cpu,
                allow_assembly,
            } => f
                .debug_struct("Cpu")
                .field("num_threads", &scheduler.num_threads())
                .field("arch", &cpu.arch)
                .field("allow_assembly", allow_assembly)
                .finish(),
            Self::OpenCl { runtime, tuning } => f
                .debug_struct("OpenCl")
                .field("device", &runtime.device_info().name)
                .field("tuning", tuning)
                .finish(),
        }
    }
}
