//! Saturating fixed-point primitives on Q31 values.
//!
//! These match the vector instructions the kernels are modelled on bit for
//! bit, so scalar, vector and device code paths produce identical outputs.

/// `1.0` in Q0.31.
pub const FIXED_POINT_ONE_Q0: i64 = 1 << 31;

/// Divide by `2^exponent`, rounding half away from zero.
///
/// `exponent` must be non-negative; 0 is the identity. Exponents above 31
/// are evaluated in 64-bit so every `i32` input has a defined result.
#[inline]
pub fn rounding_divide_by_pow2(x: i32, exponent: i32) -> i32 {
    debug_assert!(exponent >= 0, "negative exponent {exponent}");
    let exponent = exponent.clamp(0, 62) as u32;
    if exponent == 0 {
        return x;
    }
    let x = x as i64;
    let mask = (1i64 << exponent) - 1;
    let threshold = (mask >> 1) + i64::from(x < 0);
    ((x >> exponent) + i64::from((x & mask) > threshold)) as i32
}

/// High 32 bits of the rounded, doubled product `2 * a * b`.
///
/// The only overflowing input pair, `(i32::MIN, i32::MIN)`, saturates to
/// `i32::MAX`.
#[inline]
pub fn saturating_rounding_doubling_highmul(a: i32, b: i32) -> i32 {
    if a == i32::MIN && b == i32::MIN {
        return i32::MAX;
    }
    let ab = a as i64 * b as i64;
    let nudge: i64 = if ab >= 0 { 1 << 30 } else { 1 - (1 << 30) };
    ((ab + nudge) / FIXED_POINT_ONE_Q0) as i32
}

/// Multiply by `2^exponent` with saturation (left) or rounding (right).
#[inline]
pub fn saturating_rounding_multiply_by_pow2(exponent: i32, v: i32) -> i32 {
    if exponent == 0 {
        return v;
    }
    if exponent < 0 {
        return rounding_divide_by_pow2(v, -exponent);
    }
    if exponent >= 31 {
        return match v {
            0 => 0,
            v if v > 0 => i32::MAX,
            _ => i32::MIN,
        };
    }
    let threshold = (1i32 << (31 - exponent)) - 1;
    if v > threshold {
        i32::MAX
    } else if v < -threshold {
        i32::MIN
    } else {
        v << exponent
    }
}

/// Scale `x` by the real number `multiplier * 2^-31 * 2^-shift`.
///
/// A positive `shift` is a rounding right shift after the high multiply; a
/// negative `shift` pre-multiplies `x` by `2^-shift` with wrap-around, as
/// the vector multiply does.
#[inline]
pub fn multiply_by_quantized_multiplier(x: i32, multiplier: i32, shift: i32) -> i32 {
    let left_shift = if shift < 0 { (-shift) as u32 } else { 0 };
    let right_shift = shift.max(0);
    rounding_divide_by_pow2(
        saturating_rounding_doubling_highmul(x.wrapping_shl(left_shift), multiplier),
        right_shift,
    )
}

/// Change the number of integer bits of a fixed-point value.
#[inline]
fn rescale(value: i32, src_integer_bits: i32, dst_integer_bits: i32) -> i32 {
    saturating_rounding_multiply_by_pow2(src_integer_bits - dst_integer_bits, value)
}

/// Fixed-point `1 / sqrt(input)` as a Q31 multiplier and shift.
///
/// The result represents `multiplier * 2^-31 * 2^-shift` before
/// `reverse_shift` is applied; pass `-1` to get a left-shift amount.
/// Inputs `<= 1` return the sentinel `(i32::MAX, 0)`.
pub fn get_invsqrt_quantized_multiplier_exp(input: i32, reverse_shift: i32) -> (i32, i32) {
    if input <= 1 {
        return (i32::MAX, 0);
    }

    let mut input = input;
    let mut output_shift: i32 = 11;
    while input >= (1 << 29) {
        input /= 4;
        output_shift += 1;
    }

    let max_left_shift_bits = (input as u32).leading_zeros() as i32 - 1;
    let left_shift_bit_pairs = max_left_shift_bits / 2 - 1;
    output_shift -= left_shift_bit_pairs;
    input <<= 2 * left_shift_bit_pairs;

    const INTEGER_BITS: i32 = 3;
    const FRACTIONAL_BITS: i32 = 32 - 1 - INTEGER_BITS;

    let fixedpoint_input = input >> 1;
    let fixedpoint_half_input = rounding_divide_by_pow2(fixedpoint_input, 1);
    let fixedpoint_half_three = (1 << FRACTIONAL_BITS) + (1 << (FRACTIONAL_BITS - 1));

    let mut x: i32 = 1 << FRACTIONAL_BITS;
    for _ in 0..5 {
        let x3 = rescale(
            saturating_rounding_doubling_highmul(saturating_rounding_doubling_highmul(x, x), x),
            9,
            INTEGER_BITS,
        );
        let lhs = saturating_rounding_doubling_highmul(fixedpoint_half_three, x);
        let rhs = saturating_rounding_doubling_highmul(fixedpoint_half_input, x3);
        x = rescale(lhs.wrapping_sub(rhs), 6, INTEGER_BITS);
    }

    const HALF_SQRT_2_Q31: i32 = 1_518_500_250;
    let mut output_inv_sqrt = saturating_rounding_doubling_highmul(HALF_SQRT_2_Q31, x);
    if output_shift < 0 {
        output_inv_sqrt = output_inv_sqrt.wrapping_shl((-output_shift) as u32);
        output_shift = 0;
    }
    (output_inv_sqrt, output_shift * reverse_shift)
}

#[cfg(test)]
#[path = "fixed_point_tests.rs"]
mod tests;
