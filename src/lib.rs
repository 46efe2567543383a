//! GG-COMPUTE
//!
//! Quantized tensor-operator kernels with a CPU backend (generic kernels and
//! hand-tuned micro-kernels) and an OpenCL backend (generated programs run
//! through a pluggable device runtime).
//!
//! # Kernel Contract
//!
//! - **validate**: pure check of a tensor-descriptor configuration
//! - **configure**: validate, infer the destination, compute the window and
//!   backend build parameters; at most once per kernel
//! - **run**: execute any sub-window of the configured window, with no state
//!   carried between calls
//!
//! # Layout
//!
//! - [`quantization`]: multiplier/shift encoding and fixed-point primitives
//! - [`window`]: iteration spaces, tiling and thread partitioning
//! - [`kernel`]: the shared kernel trait and validation helpers
//! - [`ops`]: acceptance sets and per-point arithmetic shared by both backends
//! - [`backend`]: CPU and OpenCL kernels
//! - [`output_stage`]: requantization operators composed from the kernels

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod kernel;
pub mod ops;
pub mod output_stage;
pub mod quantization;
pub mod telemetry;
pub mod types;
pub mod window;

pub use backend::{BackendKind, ExecutionTarget};
pub use config::{ComputeConfig, ConfigError};
pub use error::KernelError;
pub use kernel::Kernel;
pub use output_stage::{compose_output_stage, GemmLowpOutputStage, QuantizedGemm};
pub use quantization::QuantizedMultiplier;
pub use types::{DataType, GemmLowpOutputStageInfo, Tensor, TensorInfo, TensorPack, TensorShape, TensorSlot};
pub use window::Window;
