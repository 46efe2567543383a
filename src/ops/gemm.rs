//! Native floating-point GEMM: `dst = alpha * lhs * rhs + beta * bias`.

use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::kernel::validate::{
    check_data_type_in, check_destination, check_max_dimensions, check_mismatching_data_types,
    ensure,
};
use crate::ops::shape::compute_mm_shape;
use crate::types::{DataType, TensorInfo};

/// Scalars of the float GEMM.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GemmInfo {
    pub alpha: f32,
    pub beta: f32,
}

impl Default for GemmInfo {
    fn default() -> Self {
        Self { alpha: 1.0, beta: 1.0 }
    }
}

pub fn validate_gemm(
    lhs: &TensorInfo,
    rhs: &TensorInfo,
    bias: Option<&TensorInfo>,
    dst: &TensorInfo,
) -> Result<(), KernelError> {
    check_data_type_in(lhs, &[DataType::F16, DataType::F32], "lhs")?;
    check_mismatching_data_types(lhs, rhs, "lhs and rhs")?;
    check_max_dimensions(lhs, 4, "lhs")?;
    check_max_dimensions(rhs, 3, "rhs")?;
    ensure(
        lhs.dimension(0) == rhs.dimension(1),
        format!(
            "The number of lhs columns ({}) must match the number of rhs rows ({})",
            lhs.dimension(0),
            rhs.dimension(1)
        ),
    )?;
    if let Some(bias) = bias {
        check_mismatching_data_types(lhs, bias, "lhs and bias")?;
        ensure(
            bias.num_dimensions() <= 1 && bias.dimension(0) == rhs.dimension(0),
            "Bias must be 1D with one value per output column",
        )?;
    }
    check_destination(dst, &compute_mm_shape(lhs, rhs), lhs.data_type())
}

/// Sequential f32 dot product over `k`; the summation order is part of the contract.
#[inline]
pub fn gemm_dot(k: usize, mut a: impl FnMut(usize) -> f32, mut b: impl FnMut(usize) -> f32) -> f32 {
    let mut acc = 0.0f32;
    for i in 0..k {
        acc += a(i) * b(i);
    }
    acc
}

#[inline]
pub fn finalize(acc: f32, bias: Option<f32>, info: &GemmInfo) -> f32 {
    let scaled = acc * info.alpha;
    match bias {
        Some(b) => scaled + b * info.beta,
        None => scaled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TensorShape;

    #[test]
    fn test_validate_gemm() {
        let lhs = TensorInfo::new(TensorShape::new(&[3, 2]), DataType::F32);
        let rhs = TensorInfo::new(TensorShape::new(&[4, 3]), DataType::F32);
        let bias = TensorInfo::new(TensorShape::new(&[4]), DataType::F32);
        validate_gemm(&lhs, &rhs, Some(&bias), &TensorInfo::empty()).unwrap();

        let rhs16 = TensorInfo::new(TensorShape::new(&[4, 3]), DataType::F16);
        assert!(matches!(
            validate_gemm(&lhs, &rhs16, None, &TensorInfo::empty()),
            Err(KernelError::MismatchingDataTypes(_))
        ));
        let short_bias = TensorInfo::new(TensorShape::new(&[3]), DataType::F32);
        assert!(validate_gemm(&lhs, &rhs, Some(&short_bias), &TensorInfo::empty()).is_err());
    }

    #[test]
    fn test_finalize() {
        let info = GemmInfo { alpha: 2.0, beta: 0.5 };
        let acc = gemm_dot(2, |i| [1.0, 2.0][i], |i| [3.0, 4.0][i]);
        assert_eq!(acc, 11.0);
        assert_eq!(finalize(acc, Some(4.0), &info), 24.0);
        assert_eq!(finalize(acc, None, &info), 22.0);
    }
}
