//! Quantization arithmetic.
//!
//! Converts real-valued rescale factors into Q31 multiplier/shift pairs and
//! provides the saturating fixed-point primitives the kernels apply to them.
//! Every function here is pure and bit-exact.

mod fixed_point;

use serde::{Deserialize, Serialize};

pub use fixed_point::{
    get_invsqrt_quantized_multiplier_exp, multiply_by_quantized_multiplier,
    rounding_divide_by_pow2, saturating_rounding_doubling_highmul,
    saturating_rounding_multiply_by_pow2, FIXED_POINT_ONE_Q0,
};

use crate::error::KernelError;
use crate::types::{
    quantize_qasymm8, quantize_qasymm8_signed, ActivationFunction, ActivationLayerInfo, DataType,
    GemmLowpOutputStageInfo, QuantizationInfo, TensorInfo, UniformQuantizationInfo,
};

/// Tolerance accepted around the `[0, 1]` range of sub-unit multipliers.
pub const MULTIPLIER_EPSILON: f64 = 1e-5;

/// Q31 multiplier with shift; positive shift is a right shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct QuantizedMultiplier {
    pub multiplier: i32,
    pub shift: i32,
}

impl QuantizedMultiplier {
    /// Real value represented by this pair.
    pub fn to_real(self) -> f64 {
        self.multiplier as f64 / FIXED_POINT_ONE_Q0 as f64 * 2f64.powi(-self.shift)
    }

    pub fn apply(self, x: i32) -> i32 {
        multiply_by_quantized_multiplier(x, self.multiplier, self.shift)
    }
}

/// Split `x` into a mantissa in `[0.5, 1)` and a power-of-two exponent.
fn frexp(x: f64) -> (f64, i32) {
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let exp_bits = ((bits >> 52) & 0x7ff) as i32;
    if exp_bits == 0 {
        // subnormal
        let (m, e) = frexp(x * 2f64.powi(54));
        return (m, e - 54);
    }
    let mantissa = f64::from_bits((bits & !(0x7ffu64 << 52)) | (1022u64 << 52));
    (mantissa, exp_bits - 1022)
}

/// Encode the mantissa of `multiplier` in Q31, renormalising when rounding
/// reaches `2^31`. Returns `(q_fixed, exponent)`.
fn encode_q31(multiplier: f64) -> (i64, i32) {
    let (q, mut exponent) = frexp(multiplier);
    let mut q_fixed = (q * FIXED_POINT_ONE_Q0 as f64).round() as i64;
    if q_fixed == FIXED_POINT_ONE_Q0 {
        q_fixed /= 2;
        exponent += 1;
    }
    (q_fixed, exponent)
}

/// Factor a non-negative real multiplier into a Q31 multiplier and shift.
///
/// Zero maps to `(0, 0)`. Multipliers `>= 1` get a negative (left) shift.
/// With `ignore_epsilon`, right shifts beyond 31 bits flush to `(0, 0)`.
pub fn calculate_quantized_multiplier(
    multiplier: f64,
    ignore_epsilon: bool,
) -> Result<QuantizedMultiplier, KernelError> {
    if !multiplier.is_finite() {
        return Err(KernelError::InvalidArgument(format!(
            "multiplier {multiplier} is not finite"
        )));
    }
    if multiplier < 0.0 {
        return Err(KernelError::InvalidArgument(format!(
            "multiplier {multiplier} is negative"
        )));
    }
    if multiplier == 0.0 {
        return Ok(QuantizedMultiplier::default());
    }
    let (q_fixed, exponent) = encode_q31(multiplier);
    let shift = -exponent;
    if ignore_epsilon && shift > 31 {
        return Ok(QuantizedMultiplier::default());
    }
    Ok(QuantizedMultiplier {
        multiplier: q_fixed as i32,
        shift,
    })
}

/// Quantize a multiplier in `[0, 1]` to a Q31 value and a non-negative right shift.
///
/// Values within `MULTIPLIER_EPSILON` outside the range are accepted (no
/// tolerance with `ignore_epsilon`). Multipliers whose encoding would need a
/// left shift saturate to `(i32::MAX, 0)`.
pub fn calculate_quantized_multiplier_less_than_one(
    multiplier: f64,
    ignore_epsilon: bool,
) -> Result<(i32, u32), KernelError> {
    let epsilon = if ignore_epsilon { 0.0 } else { MULTIPLIER_EPSILON };
    if !multiplier.is_finite() || multiplier < -epsilon || multiplier > 1.0 + epsilon {
        return Err(KernelError::InvalidArgument(format!(
            "multiplier {multiplier} outside [0, 1]"
        )));
    }
    if multiplier <= 0.0 {
        return Ok((0, 0));
    }
    let (q_fixed, exponent) = encode_q31(multiplier);
    let right_shift = -exponent;
    if right_shift < 0 {
        return Ok((i32::MAX, 0));
    }
    if ignore_epsilon && right_shift > 31 {
        return Ok((0, 0));
    }
    Ok((q_fixed as i32, right_shift as u32))
}

/// Quantize a multiplier `>= 1` to a Q31 value and a non-negative left shift.
pub fn calculate_quantized_multiplier_greater_than_one(
    multiplier: f64,
) -> Result<(i32, i32), KernelError> {
    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(KernelError::InvalidArgument(format!(
            "multiplier {multiplier} is less than 1"
        )));
    }
    let (q_fixed, left_shift) = encode_q31(multiplier);
    Ok((q_fixed as i32, left_shift))
}

/// Fill the output-stage multipliers for `input * weights -> output`.
///
/// One pair per weight scale; the first pair also populates the scalar
/// `gemmlowp_multiplier`/`gemmlowp_shift` fields.
pub fn calculate_quantized_multipliers(
    input: &QuantizationInfo,
    weights: &QuantizationInfo,
    output: &QuantizationInfo,
    stage: &mut GemmLowpOutputStageInfo,
) -> Result<(), KernelError> {
    let (multipliers, shifts) = compute_multipliers(input, weights, output)?;
    stage.is_quantized_per_channel = weights.is_per_channel();
    stage.gemmlowp_multiplier = multipliers[0];
    stage.gemmlowp_shift = shifts[0];
    stage.gemmlowp_multipliers = multipliers;
    stage.gemmlowp_shifts = shifts;
    Ok(())
}

/// Per-channel multipliers and shifts for a quantized convolution.
pub fn compute_quantized_multipliers_and_shifts(
    input: &TensorInfo,
    weights: &TensorInfo,
    output: &TensorInfo,
) -> Result<(Vec<i32>, Vec<i32>), KernelError> {
    compute_multipliers(
        input.quantization_info(),
        weights.quantization_info(),
        output.quantization_info(),
    )
}

fn compute_multipliers(
    input: &QuantizationInfo,
    weights: &QuantizationInfo,
    output: &QuantizationInfo,
) -> Result<(Vec<i32>, Vec<i32>), KernelError> {
    let input_scale = input.uniform().scale;
    let output_scale = output.uniform().scale;
    if weights.is_empty() {
        return Err(KernelError::InvalidArgument(
            "weights carry no quantization scale".to_string(),
        ));
    }
    let mut multipliers = Vec::with_capacity(weights.scales().len());
    let mut shifts = Vec::with_capacity(weights.scales().len());
    for (channel, weight_scale) in weights.scales().iter().enumerate() {
        let ratio = input_scale * weight_scale / output_scale;
        if !(ratio.is_finite() && ratio > 0.0) {
            return Err(KernelError::InvalidArgument(format!(
                "rescale factor {ratio} for channel {channel} is not positive"
            )));
        }
        let quantized = calculate_quantized_multiplier(ratio, false)?;
        multipliers.push(quantized.multiplier);
        shifts.push(quantized.shift);
    }
    Ok((multipliers, shifts))
}

/// Representable range of a quantized data type.
pub fn get_min_max_values_from_quantized_data_type(
    data_type: DataType,
) -> Result<(i32, i32), KernelError> {
    match data_type {
        DataType::QAsymm8 => Ok((u8::MIN as i32, u8::MAX as i32)),
        DataType::QSymm8 | DataType::QAsymm8Signed | DataType::QSymm8PerChannel => {
            Ok((i8::MIN as i32, i8::MAX as i32))
        }
        DataType::QAsymm16 => Ok((u16::MIN as i32, u16::MAX as i32)),
        DataType::QSymm16 => Ok((i16::MIN as i32, i16::MAX as i32)),
        other => Err(KernelError::UnsupportedDataType {
            data_type: other,
            context: "not a quantized integer type".to_string(),
        }),
    }
}

/// Clamp bounds in the quantized domain for a fused activation.
pub fn get_quantized_activation_min_max(
    activation: &ActivationLayerInfo,
    data_type: DataType,
    qinfo: &UniformQuantizationInfo,
) -> Result<(i32, i32), KernelError> {
    let (type_min, type_max) = get_min_max_values_from_quantized_data_type(data_type)?;
    if !activation.enabled || activation.function == ActivationFunction::Identity {
        return Ok((type_min, type_max));
    }
    let quantize = |v: f32| -> i32 {
        if data_type == DataType::QAsymm8Signed {
            quantize_qasymm8_signed(v, qinfo) as i32
        } else {
            quantize_qasymm8(v, qinfo) as i32
        }
    };
    let min = match activation.function {
        ActivationFunction::LuBoundedRelu => quantize(activation.b),
        _ => qinfo.offset,
    };
    let max = match activation.function {
        ActivationFunction::Relu => type_max,
        _ => quantize(activation.a),
    };
    Ok((min.max(type_min), max.min(type_max)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_multiplier() {
        let q = calculate_quantized_multiplier(0.0, false).unwrap();
        assert_eq!(q, QuantizedMultiplier { multiplier: 0, shift: 0 });
    }

    #[test]
    fn test_negative_and_non_finite_rejected() {
        assert!(matches!(
            calculate_quantized_multiplier(-0.5, false),
            Err(KernelError::InvalidArgument(_))
        ));
        assert!(calculate_quantized_multiplier(f64::NAN, false).is_err());
        assert!(calculate_quantized_multiplier(f64::INFINITY, true).is_err());
    }

    #[test]
    fn test_half_encodes_as_q31_half() {
        let q = calculate_quantized_multiplier(0.5, false).unwrap();
        assert_eq!(q, QuantizedMultiplier { multiplier: 1 << 30, shift: 0 });
        let q = calculate_quantized_multiplier(0.25, false).unwrap();
        assert_eq!(q, QuantizedMultiplier { multiplier: 1 << 30, shift: 1 });
    }

    #[test]
    fn test_renormalisation_near_one() {
        let q = calculate_quantized_multiplier(0.99999999999, false).unwrap();
        assert_eq!(q.multiplier, 1 << 30);
        assert_eq!(q.shift, -1);
        assert!((q.to_real() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_renormalisation_keeps_multiplier_in_range() {
        // mantissas that round up to 2^31 just below each power of two
        for exp in -20..20 {
            let m = 2f64.powi(exp) * (1.0 - 1e-12);
            let q = calculate_quantized_multiplier(m, false).unwrap();
            assert!(q.multiplier >= 1 << 30, "m={m}");
            assert!((q.multiplier as i64) < FIXED_POINT_ONE_Q0, "m={m}");
        }
    }

    #[test]
    fn test_greater_than_one_multiplier_is_left_shift() {
        let q = calculate_quantized_multiplier(3.0, false).unwrap();
        assert_eq!(q.shift, -2);
        assert_eq!(q.apply(100), 300);
        let (m, left) = calculate_quantized_multiplier_greater_than_one(3.0).unwrap();
        assert_eq!((m, left), (q.multiplier, 2));
        assert!(calculate_quantized_multiplier_greater_than_one(0.9).is_err());
    }

    #[test]
    fn test_ignore_epsilon_flushes_tiny_multipliers() {
        let q = calculate_quantized_multiplier(1e-12, true).unwrap();
        assert_eq!(q, QuantizedMultiplier::default());
        let q = calculate_quantized_multiplier(1e-12, false).unwrap();
        assert!(q.shift > 31);
        assert_eq!(calculate_quantized_multiplier_less_than_one(1e-12, true).unwrap(), (0, 0));
    }

    #[test]
    fn test_less_than_one_range() {
        assert!(calculate_quantized_multiplier_less_than_one(1.5, false).is_err());
        assert!(calculate_quantized_multiplier_less_than_one(-0.1, false).is_err());
        assert!(calculate_quantized_multiplier_less_than_one(1.000001, false).is_ok());
        assert!(calculate_quantized_multiplier_less_than_one(1.000001, true).is_err());
        assert_eq!(
            calculate_quantized_multiplier_less_than_one(1.0, false).unwrap(),
            (i32::MAX, 0)
        );
        assert_eq!(
            calculate_quantized_multiplier_less_than_one(0.75, false).unwrap(),
            (1_610_612_736, 0)
        );
    }

    #[test]
    fn test_multiplier_round_trip_bound() {
        let mut m = 1e-7;
        while m < 1.0 {
            let (q, s) = calculate_quantized_multiplier_less_than_one(m, false).unwrap();
            let out = multiply_by_quantized_multiplier(1 << 30, q, s as i32) as f64;
            let err = (out / (1u64 << 30) as f64 - m).abs();
            assert!(err < 2f64.powi(-29), "m={m} err={err}");
            m *= 1.37;
        }
    }

    #[test]
    fn test_per_channel_multipliers() {
        let input = QuantizationInfo::new(0.5, 10);
        let weights = QuantizationInfo::per_channel(vec![0.1, 0.2, 0.4], 0);
        let output = QuantizationInfo::new(0.25, 5);
        let mut stage = GemmLowpOutputStageInfo::default();
        calculate_quantized_multipliers(&input, &weights, &output, &mut stage).unwrap();
        assert!(stage.is_quantized_per_channel);
        assert_eq!(stage.gemmlowp_multipliers.len(), 3);
        assert_eq!(stage.gemmlowp_multiplier, stage.gemmlowp_multipliers[0]);
        for (i, scale) in [0.1, 0.2, 0.4].iter().enumerate() {
            let real = QuantizedMultiplier {
                multiplier: stage.gemmlowp_multipliers[i],
                shift: stage.gemmlowp_shifts[i],
            }
            .to_real();
            assert!((real - 0.5 * scale / 0.25).abs() < 1e-9);
        }
    }

    #[test]
    fn test_per_channel_rejects_zero_scale() {
        let mut stage = GemmLowpOutputStageInfo::default();
        let err = calculate_quantized_multipliers(
            &QuantizationInfo::new(0.5, 0),
            &QuantizationInfo::per_channel(vec![0.1, 0.0], 0),
            &QuantizationInfo::new(0.25, 0),
            &mut stage,
        );
        assert!(err.is_err());
        assert!(stage.gemmlowp_multipliers.is_empty());
    }

    #[test]
    fn test_min_max_lookup() {
        assert_eq!(get_min_max_values_from_quantized_data_type(DataType::QAsymm8).unwrap(), (0, 255));
        assert_eq!(
            get_min_max_values_from_quantized_data_type(DataType::QAsymm8Signed).unwrap(),
            (-128, 127)
        );
        assert_eq!(
            get_min_max_values_from_quantized_data_type(DataType::QSymm16).unwrap(),
            (-32768, 32767)
        );
        assert!(get_min_max_values_from_quantized_data_type(DataType::F32).is_err());
    }

    #[test]
    fn test_activation_bounds() {
        let q = UniformQuantizationInfo { scale: 0.1, offset: 10 };
        let relu = ActivationLayerInfo::new(ActivationFunction::Relu, 0.0, 0.0);
        assert_eq!(get_quantized_activation_min_max(&relu, DataType::QAsymm8, &q).unwrap(), (10, 255));
        let relu6 = ActivationLayerInfo::new(ActivationFunction::BoundedRelu, 6.0, 0.0);
        assert_eq!(get_quantized_activation_min_max(&relu6, DataType::QAsymm8, &q).unwrap(), (10, 70));
        let lu = ActivationLayerInfo::new(ActivationFunction::LuBoundedRelu, 1.0, -1.0);
        assert_eq!(
            get_quantized_activation_min_max(&lu, DataType::QAsymm8Signed, &q).unwrap(),
            (0, 20)
        );
    }

    #[test]
    fn test_frexp() {
        assert_eq!(frexp(1.0), (0.5, 1));
        assert_eq!(frexp(0.75), (0.75, 0));
        assert_eq!(frexp(-8.0), (-0.5, 4));
        let (m, e) = frexp(f64::MIN_POSITIVE / 4.0);
        assert_eq!(m, 0.5);
        assert_eq!(e, -1023);
    }
}
