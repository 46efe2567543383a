//! Kernel error types.
//!
//! Validation never mutates anything: a configuration that fails here leaves
//! every descriptor exactly as the caller passed it.

use thiserror::Error;

use crate::types::{DataType, TensorSlot};

/// Errors reported by validate/configure/run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported data type {data_type}: {context}")]
    UnsupportedDataType { data_type: DataType, context: String },

    #[error("Mismatching shapes: {0}")]
    MismatchingShapes(String),

    #[error("Mismatching data types: {0}")]
    MismatchingDataTypes(String),

    #[error("Mismatching quantization info: {0}")]
    MismatchingQuantization(String),

    #[error("{0}")]
    InvalidConfiguration(String),

    #[error("Kernel {0} has not been configured")]
    NotConfigured(String),

    #[error("Kernel {0} is already configured")]
    AlreadyConfigured(String),

    #[error("Invalid sub-window: {0}")]
    InvalidSubWindow(String),

    #[error("Missing tensor for slot {0}")]
    MissingTensor(TensorSlot),

    #[error("Kernel compilation failed for {name}: {reason}")]
    Compile { name: String, reason: String },

    #[error("Kernel enqueue failed: {0}")]
    Enqueue(String),
}

impl KernelError {
    /// Returns true for precondition violations that indicate a caller bug
    /// rather than an unsupported-but-valid request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotConfigured(_)
                | Self::AlreadyConfigured(_)
                | Self::InvalidSubWindow(_)
                | Self::MissingTensor(_)
        )
    }

    /// Short, stable label for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::UnsupportedDataType { .. } => "unsupported_data_type",
            Self::MismatchingShapes(_) => "mismatching_shapes",
            Self::MismatchingDataTypes(_) => "mismatching_data_types",
            Self::MismatchingQuantization(_) => "mismatching_quantization",
            Self::InvalidConfiguration(_) => "invalid_configuration",
            Self::NotConfigured(_) | Self::AlreadyConfigured(_) => "precondition",
            Self::InvalidSubWindow(_) => "invalid_sub_window",
            Self::MissingTensor(_) => "missing_tensor",
            Self::Compile { .. } => "compile",
            Self::Enqueue(_) => "enqueue",
        }
    }
}
