//! Operator rules shared by every backend.
//!
//! Each submodule owns the acceptance set (`validate_*`), the output shape
//! and the per-element arithmetic of one operator. Backends only decide how
//! to walk the window; identical inputs therefore produce identical results
//! whichever backend runs them.

pub mod conv;
pub mod depthwise;
pub mod gemm;
pub mod gemmlowp;
pub mod layer_norm;
pub mod pooling;
pub mod shape;
pub mod softmax;

pub use gemmlowp::{GemmLowpMmInfo, OutputStageParams};
