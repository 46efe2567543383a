//! Softmax along axis 0, float and 8-bit asymmetric.
//!
//! Runs as two stages: the first computes the row maximum, the shifted
//! exponentials and their sum; the second normalises. Quantized rows are
//! shifted in the integer domain and exponentiated in `f32`, and the result
//! is written with the fixed output quantization from
//! [`softmax_output_quantization`].

use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::kernel::validate::{check_data_type_in, check_mismatching_data_types, check_mismatching_shapes, ensure};
use crate::types::{DataType, QuantizationInfo, SoftmaxInfo, TensorInfo};

pub const SOFTMAX_TYPES: [DataType; 4] = [
    DataType::QAsymm8,
    DataType::QAsymm8Signed,
    DataType::F16,
    DataType::F32,
];

/// Reduction strategy thresholds, injected per kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftmaxTuning {
    /// Work-items cooperating on one row in the parallel reduction.
    pub grid_size: usize,
    pub serial_vector_size: usize,
    pub parallel_vector_size: usize,
}

impl Default for SoftmaxTuning {
    fn default() -> Self {
        Self {
            grid_size: 64,
            serial_vector_size: 8,
            parallel_vector_size: 4,
        }
    }
}

impl SoftmaxTuning {
    /// Rows of at least `grid_size * serial_vector_size` use the parallel reduction.
    pub fn is_parallel(&self, row_len: usize) -> bool {
        self.grid_size > 1 && row_len >= self.grid_size * self.serial_vector_size
    }

    pub fn vector_size(&self, row_len: usize) -> usize {
        if self.is_parallel(row_len) {
            self.parallel_vector_size
        } else {
            self.serial_vector_size
        }
    }
}

/// Output quantization of a quantized softmax: scale 1/256, offset 0 or -128.
pub fn softmax_output_quantization(data_type: DataType) -> QuantizationInfo {
    if data_type == DataType::QAsymm8Signed {
        QuantizationInfo::new(1.0 / 256.0, -128)
    } else {
        QuantizationInfo::new(1.0 / 256.0, 0)
    }
}

pub fn validate_softmax(src: &TensorInfo, dst: &TensorInfo, info: &SoftmaxInfo) -> Result<(), KernelError> {
    check_data_type_in(src, &SOFTMAX_TYPES, "src")?;
    ensure(info.beta.is_finite(), "beta must be finite")?;
    ensure(
        !(info.is_log && !src.data_type().is_float()),
        "Log softmax is only supported for floating point data types",
    )?;
    if dst.total_size() != 0 {
        check_mismatching_data_types(src, dst, "src and dst")?;
        check_mismatching_shapes(src.shape(), dst.shape(), "src and dst")?;
        if src.data_type().is_quantized() {
            let expected = softmax_output_quantization(src.data_type());
            if dst.quantization_info() != &expected {
                return Err(KernelError::MismatchingQuantization(format!(
                    "softmax output must use scale 1/256 and offset {}",
                    expected.offset()
                )));
            }
        }
    }
    Ok(())
}

/// Per-row constants resolved at configure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftmaxParams {
    /// `beta` times the input scale (1 for float inputs).
    pub scaled_beta: f32,
    pub is_log: bool,
    pub quantized: bool,
    pub out_offset: i32,
    pub out_min: i32,
    pub out_max: i32,
}

impl SoftmaxParams {
    pub fn new(src: &TensorInfo, info: &SoftmaxInfo) -> Self {
        let data_type = src.data_type();
        let quantized = data_type.is_quantized();
        let scale = if quantized {
            src.quantization_info().uniform().scale as f32
        } else {
            1.0
        };
        let (out_min, out_max) = if data_type == DataType::QAsymm8Signed {
            (i8::MIN as i32, i8::MAX as i32)
        } else {
            (0, u8::MAX as i32)
        };
        Self {
            scaled_beta: info.beta * scale,
            is_log: info.is_log,
            quantized,
            out_offset: softmax_output_quantization(data_type).offset(),
            out_min,
            out_max,
        }
    }

    /// Stage one value for an element `diff` below the row maximum.
    #[inline]
    pub fn shifted(&self, diff: f32) -> f32 {
        let scaled = diff * self.scaled_beta;
        if self.is_log {
            scaled
        } else {
            scaled.exp()
        }
    }

    /// Contribution of a stage one value to the row sum.
    #[inline]
    pub fn sum_term(&self, shifted: f32) -> f32 {
        if self.is_log {
            shifted.exp()
        } else {
            shifted
        }
    }

    /// Row sum of stage one values, accumulated in index order.
    ///
    /// Every backend and both reduction variants go through here so the
    /// normalised output does not depend on how rows are partitioned.
    pub fn row_sum(&self, shifted: &[f32]) -> f32 {
        shifted.iter().fold(0.0f32, |acc, v| acc + self.sum_term(*v))
    }

    #[inline]
    pub fn normalize(&self, shifted: f32, sum: f32) -> f32 {
        if self.is_log {
            shifted - sum.ln()
        } else {
            shifted / sum
        }
    }

    #[inline]
    pub fn normalize_quantized(&self, shifted: f32, sum: f32) -> i32 {
        let q = (shifted / sum * 256.0).round() as i32 + self.out_offset;
        q.clamp(self.out_min, self.out_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TensorShape;

    #[test]
    fn test_tuning_threshold() {
        let tuning = SoftmaxTuning::default();
        assert!(!tuning.is_parallel(511));
        assert!(tuning.is_parallel(512));
        assert_eq!(tuning.vector_size(512), 4);
        let serial_only = SoftmaxTuning { grid_size: 1, ..tuning };
        assert!(!serial_only.is_parallel(1 << 20));
    }

    #[test]
    fn test_validate_softmax() {
        let src = TensorInfo::new(TensorShape::new(&[10, 2]), DataType::QAsymm8)
            .with_quantization(QuantizationInfo::new(0.1, 3));
        validate_softmax(&src, &TensorInfo::empty(), &SoftmaxInfo::default()).unwrap();

        let log = SoftmaxInfo { beta: 1.0, is_log: true };
        assert!(validate_softmax(&src, &TensorInfo::empty(), &log).is_err());

        let wrong_q = src.clone().with_quantization(QuantizationInfo::new(1.0 / 256.0, 5));
        assert!(matches!(
            validate_softmax(&src, &wrong_q, &SoftmaxInfo::default()),
            Err(KernelError::MismatchingQuantization(_))
        ));
        let good = src.clone().with_quantization(softmax_output_quantization(DataType::QAsymm8));
        validate_softmax(&src, &good, &SoftmaxInfo::default()).unwrap();
    }

    #[test]
    fn test_row_math() {
        let src = TensorInfo::new(TensorShape::new(&[3]), DataType::F32);
        let params = SoftmaxParams::new(&src, &SoftmaxInfo::default());
        let row = [1.0f32, 2.0, 3.0];
        let max = 3.0;
        let shifted: Vec<f32> = row.iter().map(|x| params.shifted(x - max)).collect();
        let sum = params.row_sum(&shifted);
        let out: Vec<f32> = shifted.iter().map(|v| params.normalize(*v, sum)).collect();
        assert!((out.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(out[2] > out[1] && out[1] > out[0]);

        let q = TensorInfo::new(TensorShape::new(&[2]), DataType::QAsymm8Signed)
            .with_quantization(QuantizationInfo::new(1.0, 0));
        let params = SoftmaxParams::new(&q, &SoftmaxInfo::default());
        // two equal logits: each half, 128 - 128 = 0
        assert_eq!(params.normalize_quantized(1.0, 2.0), 0);
        assert_eq!(params.normalize_quantized(1.0, 1.0), 127);
    }
}
