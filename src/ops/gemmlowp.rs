//! GEMMLowp: quantized matrix multiply and the int32 output stage.
//!
//! The output stage turns an int32 accumulator into a narrow quantized value:
//!
//! ```text
//! acc -> + bias[c] -> multiply_by_quantized_multiplier -> + offset -> clamp -> cast
//! ```
//!
//! Bounds given by the caller narrow the output type range, except when
//! `min_bound == max_bound`: that pair is treated as "no bounds requested"
//! and only the type range applies.

use crate::error::KernelError;
use crate::kernel::validate::{
    check_data_type_in, check_destination, check_max_dimensions, ensure,
};
use crate::ops::shape::compute_mm_shape;
use crate::quantization::{
    get_min_max_values_from_quantized_data_type, multiply_by_quantized_multiplier,
};
use crate::types::{DataType, GemmLowpOutputStageInfo, OutputStageType, TensorInfo};

/// Clamp range applied after requantization.
///
/// The type range always applies; caller bounds narrow it unless they are equal.
pub fn effective_bounds(min_bound: i32, max_bound: i32, type_min: i32, type_max: i32) -> (i32, i32) {
    if min_bound == max_bound {
        return (type_min, type_max);
    }
    (min_bound.max(type_min), max_bound.min(type_max))
}

/// Output stage constants resolved once at configure.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputStageParams {
    pub kind: OutputStageType,
    pub output_data_type: DataType,
    pub offset: i32,
    pub multipliers: Vec<i32>,
    pub shifts: Vec<i32>,
    pub real_multiplier: f32,
    pub per_channel: bool,
    pub min: i32,
    pub max: i32,
}

impl OutputStageParams {
    pub fn new(info: &GemmLowpOutputStageInfo) -> Result<Self, KernelError> {
        let (type_min, type_max) = get_min_max_values_from_quantized_data_type(info.output_data_type)?;
        let (min, max) = effective_bounds(
            info.gemmlowp_min_bound,
            info.gemmlowp_max_bound,
            type_min,
            type_max,
        );
        let (multipliers, shifts) = if info.is_quantized_per_channel {
            (info.gemmlowp_multipliers.clone(), info.gemmlowp_shifts.clone())
        } else {
            (vec![info.gemmlowp_multiplier], vec![info.gemmlowp_shift])
        };
        Ok(Self {
            kind: info.kind,
            output_data_type: info.output_data_type,
            offset: info.gemmlowp_offset,
            multipliers,
            shifts,
            real_multiplier: info.gemmlowp_real_multiplier,
            per_channel: info.is_quantized_per_channel,
            min,
            max,
        })
    }

    #[inline]
    fn multiplier(&self, channel: usize) -> (i32, i32) {
        let idx = if self.per_channel { channel } else { 0 };
        (self.multipliers[idx], self.shifts[idx])
    }

    /// Requantize one accumulator belonging to output column `channel`.
    #[inline]
    pub fn apply(&self, acc: i32, bias: i32, channel: usize) -> i32 {
        let acc = acc.wrapping_add(bias);
        let value = match self.kind {
            OutputStageType::QuantizeDownFixedPoint => {
                let (m, s) = self.multiplier(channel);
                multiply_by_quantized_multiplier(acc, m, s).wrapping_add(self.offset)
            }
            OutputStageType::QuantizeDown => {
                let (m, s) = self.multiplier(channel);
                acc.wrapping_add(self.offset).wrapping_mul(m) >> s
            }
            OutputStageType::QuantizeDownFloat => {
                ((acc as f32 * self.real_multiplier).round_ties_even() as i32).wrapping_add(self.offset)
            }
            OutputStageType::None => acc,
        };
        value.clamp(self.min, self.max)
    }
}

/// Output types each output stage kind can produce.
pub fn output_stage_types(kind: OutputStageType) -> &'static [DataType] {
    match kind {
        OutputStageType::QuantizeDownFixedPoint => {
            &[DataType::QAsymm8, DataType::QAsymm8Signed, DataType::QSymm16]
        }
        _ => &[DataType::QAsymm8, DataType::QAsymm8Signed],
    }
}

/// Acceptance set of the output stage, identical for every backend.
pub fn validate_output_stage(
    src: &TensorInfo,
    bias: Option<&TensorInfo>,
    dst: &TensorInfo,
    info: &GemmLowpOutputStageInfo,
) -> Result<(), KernelError> {
    check_data_type_in(src, &[DataType::S32], "GEMMLowp output stage source")?;
    ensure(info.kind != OutputStageType::None, "Output stage type must be set")?;
    let allowed = output_stage_types(info.kind);
    if !allowed.contains(&info.output_data_type) {
        let names: Vec<String> = allowed.iter().map(|d| d.to_string()).collect();
        return Err(KernelError::UnsupportedDataType {
            data_type: info.output_data_type,
            context: format!("output stage type must be one of [{}]", names.join(", ")),
        });
    }
    let (type_min, type_max) = get_min_max_values_from_quantized_data_type(info.output_data_type)?;
    ensure(
        info.gemmlowp_max_bound <= type_max,
        format!("Maximum bound {} above {} range", info.gemmlowp_max_bound, info.output_data_type),
    )?;
    ensure(
        info.gemmlowp_min_bound >= type_min && info.gemmlowp_min_bound <= info.gemmlowp_max_bound,
        format!(
            "Minimum bound {} outside [{type_min}, {}]",
            info.gemmlowp_min_bound, info.gemmlowp_max_bound
        ),
    )?;

    let columns = src.dimension(0);
    if info.is_quantized_per_channel {
        ensure(
            info.gemmlowp_multipliers.len() == columns && info.gemmlowp_shifts.len() == columns,
            format!("Per-channel multipliers and shifts must hold {columns} entries"),
        )?;
    }
    let shifts: &[i32] = if info.is_quantized_per_channel {
        &info.gemmlowp_shifts
    } else {
        std::slice::from_ref(&info.gemmlowp_shift)
    };
    match info.kind {
        OutputStageType::QuantizeDownFixedPoint => ensure(
            shifts.iter().all(|s| (-31..=62).contains(s)),
            "Fixed-point shift must be in [-31, 62]",
        )?,
        OutputStageType::QuantizeDown => ensure(
            shifts.iter().all(|s| (0..=31).contains(s)),
            "Integer shift must be in [0, 31]",
        )?,
        OutputStageType::QuantizeDownFloat => ensure(
            info.gemmlowp_real_multiplier.is_finite(),
            "Real multiplier must be finite",
        )?,
        OutputStageType::None => {}
    }

    if let Some(bias) = bias {
        check_data_type_in(bias, &[DataType::S32], "bias")?;
        ensure(
            bias.num_dimensions() <= 1 && bias.dimension(0) == columns,
            format!("Bias must be 1D with {columns} elements"),
        )?;
    }
    check_destination(dst, src.shape(), info.output_data_type)
}

/// Offsets added to every lhs/rhs element before multiplication.
///
/// Built from the tensor zero points, so both are usually the negated offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GemmLowpMmInfo {
    pub a_offset: i32,
    pub b_offset: i32,
}

impl GemmLowpMmInfo {
    pub fn from_quantization(lhs: &TensorInfo, rhs: &TensorInfo) -> Self {
        Self {
            a_offset: -lhs.quantization_info().offset(),
            b_offset: -rhs.quantization_info().offset(),
        }
    }

    /// Fold the offsets into a raw `sum(a * b)` using the row/column sums.
    ///
    /// `sum_row_a` is the sum of the lhs row, `sum_col_b` the sum of the rhs
    /// column. Equal (mod 2^32) to accumulating the offset products directly.
    #[inline]
    pub fn contribute(&self, raw: i32, sum_row_a: i32, sum_col_b: i32, k: usize) -> i32 {
        raw.wrapping_add(self.a_offset.wrapping_mul(sum_col_b))
            .wrapping_add(self.b_offset.wrapping_mul(sum_row_a))
            .wrapping_add((k as i32).wrapping_mul(self.a_offset).wrapping_mul(self.b_offset))
    }
}

/// Types accepted for the rhs given a lhs type.
pub fn mm_rhs_types(lhs: DataType) -> &'static [DataType] {
    if lhs == DataType::QAsymm8 {
        &[DataType::QAsymm8]
    } else {
        &[DataType::QAsymm8Signed, DataType::QSymm8, DataType::QSymm8PerChannel]
    }
}

/// Acceptance set of the quantized matrix multiply.
pub fn validate_mm(lhs: &TensorInfo, rhs: &TensorInfo, dst: &TensorInfo) -> Result<(), KernelError> {
    check_data_type_in(lhs, &[DataType::QAsymm8, DataType::QAsymm8Signed], "lhs")?;
    check_data_type_in(rhs, mm_rhs_types(lhs.data_type()), "rhs")?;
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
    if rhs.num_dimensions() > 2 {
        ensure(
            rhs.dimension(2) == lhs.dimension(2),
            "Batched rhs must match the lhs batch size",
        )?;
    }
    check_destination(dst, &compute_mm_shape(lhs, rhs), DataType::S32)
}

/// Reference element of `dst[x, y, b]` for the quantized multiply.
///
/// `a` yields lhs row `y`, `b` yields rhs column `x`, both as i32.
#[inline]
pub fn mm_dot(
    k: usize,
    offsets: &GemmLowpMmInfo,
    mut a: impl FnMut(usize) -> i32,
    mut b: impl FnMut(usize) -> i32,
) -> i32 {
    let mut acc = 0i32;
    for i in 0..k {
        let lhs = a(i).wrapping_add(offsets.a_offset);
        let rhs = b(i).wrapping_add(offsets.b_offset);
        acc = acc.wrapping_add(lhs.wrapping_mul(rhs));
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QuantizationInfo, TensorShape};

    fn stage() -> GemmLowpOutputStageInfo {
        GemmLowpOutputStageInfo::fixed_point(DataType::QAsymm8, 1 << 30, 1, 128)
    }

    #[test]
    fn test_effective_bounds() {
        assert_eq!(effective_bounds(10, 200, 0, 255), (10, 200));
        assert_eq!(effective_bounds(0, 0, 0, 255), (0, 255));
        assert_eq!(effective_bounds(-50, 300, 0, 255), (0, 255));
    }

    #[test]
    fn test_fixed_point_apply() {
        let params = OutputStageParams::new(&stage()).unwrap();
        // (1010 * 0.5) / 2 rounds half away from zero to 253, +128 clamps
        assert_eq!(params.apply(1000, 10, 0), 255);
        assert_eq!(params.apply(-2000, 10, 0), 0);
        assert_eq!(params.apply(-200, 0, 0), 78);
    }

    #[test]
    fn test_equal_bounds_fall_back_to_type_range() {
        let info = stage().with_bounds(0, 0);
        let params = OutputStageParams::new(&info).unwrap();
        assert_eq!((params.min, params.max), (0, 255));
        assert_eq!(params.apply(-80, 0, 0), 108);
    }

    #[test]
    fn test_integer_and_float_kinds() {
        let info = GemmLowpOutputStageInfo {
            kind: OutputStageType::QuantizeDown,
            output_data_type: DataType::QAsymm8Signed,
            gemmlowp_offset: 2,
            gemmlowp_multiplier: 3,
            gemmlowp_shift: 2,
            gemmlowp_min_bound: -128,
            gemmlowp_max_bound: 127,
            ..Default::default()
        };
        let params = OutputStageParams::new(&info).unwrap();
        assert_eq!(params.apply(10, 0, 0), 9);
        assert_eq!(params.apply(-10, 0, 0), -6);

        let info = GemmLowpOutputStageInfo {
            kind: OutputStageType::QuantizeDownFloat,
            gemmlowp_real_multiplier: 0.5,
            gemmlowp_offset: 0,
            ..info
        };
        let params = OutputStageParams::new(&info).unwrap();
        // ties to even
        assert_eq!(params.apply(5, 0, 0), 2);
        assert_eq!(params.apply(7, 0, 0), 4);
    }

    #[test]
    fn test_per_channel_apply() {
        let mut info = stage();
        info.is_quantized_per_channel = true;
        info.gemmlowp_multipliers = vec![1 << 30, 1 << 30];
        info.gemmlowp_shifts = vec![0, 2];
        let params = OutputStageParams::new(&info).unwrap();
        assert_eq!(params.apply(40, 0, 0), 148);
        assert_eq!(params.apply(40, 0, 1), 133);
    }

    #[test]
    fn test_validate_output_stage() {
        let src = TensorInfo::new(TensorShape::new(&[3, 2]), DataType::S32);
        let bias = TensorInfo::new(TensorShape::new(&[3]), DataType::S32);
        validate_output_stage(&src, Some(&bias), &TensorInfo::empty(), &stage()).unwrap();

        let bad_src = TensorInfo::new(TensorShape::new(&[3, 2]), DataType::F32);
        assert!(matches!(
            validate_output_stage(&bad_src, None, &TensorInfo::empty(), &stage()),
            Err(KernelError::UnsupportedDataType { .. })
        ));

        let bad_bias = TensorInfo::new(TensorShape::new(&[4]), DataType::S32);
        assert!(validate_output_stage(&src, Some(&bad_bias), &TensorInfo::empty(), &stage()).is_err());

        let wrong_dst = TensorInfo::new(TensorShape::new(&[3, 2]), DataType::QAsymm8Signed);
        let err = validate_output_stage(&src, None, &wrong_dst, &stage()).unwrap_err();
        assert!(err.to_string().contains("Mismatching output data type"));

        let mut unset = stage();
        unset.kind = OutputStageType::None;
        assert!(validate_output_stage(&src, None, &TensorInfo::empty(), &unset).is_err());

        let qsymm16_int = GemmLowpOutputStageInfo {
            kind: OutputStageType::QuantizeDown,
            output_data_type: DataType::QSymm16,
            gemmlowp_min_bound: -32768,
            gemmlowp_max_bound: 32767,
            ..Default::default()
        };
        assert!(validate_output_stage(&src, None, &TensorInfo::empty(), &qsymm16_int).is_err());
    }

    #[test]
    fn test_validate_bounds() {
        let src = TensorInfo::new(TensorShape::new(&[3]), DataType::S32);
        let above = stage().with_bounds(0, 300);
        assert!(validate_output_stage(&src, None, &TensorInfo::empty(), &above).is_err());
        let inverted = stage().with_bounds(200, 100);
        assert!(validate_output_stage(&src, None, &TensorInfo::empty(), &inverted).is_err());
        let equal = stage().with_bounds(0, 0);
        assert!(validate_output_stage(&src, None, &TensorInfo::empty(), &equal).is_ok());
    }

    #[test]
    fn test_validate_mm() {
        let lhs = TensorInfo::new(TensorShape::new(&[8, 4]), DataType::QAsymm8);
        let rhs = TensorInfo::new(TensorShape::new(&[5, 8]), DataType::QAsymm8);
        validate_mm(&lhs, &rhs, &TensorInfo::empty()).unwrap();

        let rhs_signed = TensorInfo::new(TensorShape::new(&[5, 8]), DataType::QAsymm8Signed);
        assert!(validate_mm(&lhs, &rhs_signed, &TensorInfo::empty()).is_err());

        let lhs_signed = TensorInfo::new(TensorShape::new(&[8, 4]), DataType::QAsymm8Signed);
        let rhs_pc = TensorInfo::new(TensorShape::new(&[5, 8]), DataType::QSymm8PerChannel);
        validate_mm(&lhs_signed, &rhs_pc, &TensorInfo::empty()).unwrap();

        let rhs_k = TensorInfo::new(TensorShape::new(&[5, 7]), DataType::QAsymm8);
        assert!(validate_mm(&lhs, &rhs_k, &TensorInfo::empty()).is_err());

        let dst = TensorInfo::new(TensorShape::new(&[5, 4]), DataType::S32);
        validate_mm(&lhs, &rhs, &dst).unwrap();
    }

    #[test]
    fn test_offset_contribution_matches_direct_sum() {
        let a = [3i32, 200, 17, 255];
        let b = [1i32, 0, 99, 128];
        let lhs = TensorInfo::new(TensorShape::new(&[4]), DataType::QAsymm8)
            .with_quantization(QuantizationInfo::new(0.1, 10));
        let rhs = TensorInfo::new(TensorShape::new(&[4]), DataType::QAsymm8)
            .with_quantization(QuantizationInfo::new(0.1, 128));
        let offsets = GemmLowpMmInfo::from_quantization(&lhs, &rhs);
        assert_eq!(offsets, GemmLowpMmInfo { a_offset: -10, b_offset: -128 });

        let direct = mm_dot(4, &offsets, |i| a[i], |i| b[i]);
        let raw: i32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        let sum_a: i32 = a.iter().sum();
        let sum_b: i32 = b.iter().sum();
        assert_eq!(offsets.contribute(raw, sum_a, sum_b, 4), direct);
    }
}
