//! QSYMM16 layer normalisation along axis 0.
//!
//! Per row: `out = ((x - mean) / sqrt(var)) * weight + bias`, entirely in
//! integer arithmetic. The normalised value is held in Q10, so the bias is
//! expected at scale `weight_scale / 1024`.

use crate::error::KernelError;
use crate::kernel::validate::{check_data_type_in, check_destination, check_max_dimensions, ensure};
use crate::quantization::{
    calculate_quantized_multiplier, get_invsqrt_quantized_multiplier_exp,
    multiply_by_quantized_multiplier, QuantizedMultiplier,
};
use crate::types::{DataType, TensorInfo};

/// Fractional bits of the normalised intermediate.
pub const NORM_FRACTIONAL_BITS: u32 = 10;

pub fn validate_layer_norm(
    src: &TensorInfo,
    weight: &TensorInfo,
    bias: &TensorInfo,
    dst: &TensorInfo,
) -> Result<(), KernelError> {
    check_data_type_in(src, &[DataType::QSymm16], "src")?;
    check_max_dimensions(src, 2, "src")?;
    let width = src.dimension(0);
    check_data_type_in(weight, &[DataType::QSymm16], "weight")?;
    ensure(
        weight.num_dimensions() <= 1 && weight.dimension(0) == width,
        format!("Weight must be 1D with {width} elements"),
    )?;
    check_data_type_in(bias, &[DataType::S32], "bias")?;
    ensure(
        bias.num_dimensions() <= 1 && bias.dimension(0) == width,
        format!("Bias must be 1D with {width} elements"),
    )?;
    ensure(
        !weight.quantization_info().is_empty() && weight.quantization_info().has_valid_scales(),
        "Weight quantization scale must be finite and positive",
    )?;
    check_destination(dst, src.shape(), DataType::QSymm16)
}

/// Multiplier from the Q10 weighted sum to the output scale.
pub fn output_multiplier(weight: &TensorInfo, dst: &TensorInfo) -> Result<QuantizedMultiplier, KernelError> {
    let weight_scale = weight.quantization_info().uniform().scale;
    let output_scale = dst.quantization_info().uniform().scale;
    calculate_quantized_multiplier(
        weight_scale / ((1u32 << NORM_FRACTIONAL_BITS) as f64 * output_scale),
        false,
    )
}

/// Normalise one row in place of `out`.
pub fn normalize_row(
    row: &[i16],
    weight: &[i16],
    bias: &[i32],
    output: QuantizedMultiplier,
    out: &mut [i16],
) {
    let width = row.len() as i64;
    if width == 0 {
        return;
    }
    let (sum, sum_sq) = row.iter().fold((0i64, 0i64), |(s, sq), &x| {
        let x = x as i64;
        (s + x, sq + x * x)
    });
    let mean = sum / width;
    let variance = (sum_sq / width - mean * mean).clamp(0, i32::MAX as i64) as i32;
    let (inv_multiplier, inv_shift) = get_invsqrt_quantized_multiplier_exp(variance, 1);

    for (i, &x) in row.iter().enumerate() {
        let centered = ((x as i64 - mean) as i32) << NORM_FRACTIONAL_BITS;
        let normalized = multiply_by_quantized_multiplier(centered, inv_multiplier, inv_shift);
        let weighted = normalized.wrapping_mul(weight[i] as i32).wrapping_add(bias[i]);
        let value = multiply_by_quantized_multiplier(weighted, output.multiplier, output.shift);
        out[i] = value.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    }
}
