use super::*;

/// Reference rounding in wide arithmetic: half away from zero.
fn reference_divide(x: i32, exponent: u32) -> i32 {
    let divisor = (1i128 << exponent) as f64;
    let q = x as f64 / divisor;
    q.round() as i32
}

#[test]
fn test_divide_by_zero_exponent_is_identity() {
    for x in [i32::MIN, -7, -1, 0, 1, 7, i32::MAX] {
        assert_eq!(rounding_divide_by_pow2(x, 0), x);
    }
}

#[test]
fn test_divide_rounds_half_away_from_zero() {
    assert_eq!(rounding_divide_by_pow2(5, 1), 3);
    assert_eq!(rounding_divide_by_pow2(-5, 1), -3);
    assert_eq!(rounding_divide_by_pow2(6, 2), 2);
    assert_eq!(rounding_divide_by_pow2(-6, 2), -2);
    assert_eq!(rounding_divide_by_pow2(4, 2), 1);
    assert_eq!(rounding_divide_by_pow2(-3, 1), -2);
}

#[test]
fn test_divide_matches_reference() {
    let samples = [i32::MIN, -1_000_001, -65_537, -129, -3, 0, 2, 127, 65_535, 999_999, i32::MAX];
    for &x in &samples {
        for exponent in 0..31u32 {
            assert_eq!(
                rounding_divide_by_pow2(x, exponent as i32),
                reference_divide(x, exponent),
                "x={x} exponent={exponent}"
            );
        }
    }
}

#[test]
fn test_divide_large_exponent_is_defined() {
    assert_eq!(rounding_divide_by_pow2(i32::MAX, 40), 0);
    assert_eq!(rounding_divide_by_pow2(-5, 40), 0);
    assert_eq!(rounding_divide_by_pow2(i32::MIN, 31), -1);
}

#[test]
fn test_highmul_saturates_on_min_min() {
    assert_eq!(saturating_rounding_doubling_highmul(i32::MIN, i32::MIN), i32::MAX);
}

#[test]
fn test_highmul_values() {
    // 0.5 * 0.5 in Q31
    assert_eq!(saturating_rounding_doubling_highmul(1 << 30, 1 << 30), 1 << 29);
    assert_eq!(saturating_rounding_doubling_highmul(1000, 1 << 30), 500);
    assert_eq!(saturating_rounding_doubling_highmul(-1000, 1 << 30), -500);
    assert_eq!(saturating_rounding_doubling_highmul(i32::MIN, i32::MAX), -i32::MAX);
    assert_eq!(saturating_rounding_doubling_highmul(0, i32::MIN), 0);
}

#[test]
fn test_multiply_by_pow2_saturates() {
    assert_eq!(saturating_rounding_multiply_by_pow2(0, 123), 123);
    assert_eq!(saturating_rounding_multiply_by_pow2(3, 5), 40);
    assert_eq!(saturating_rounding_multiply_by_pow2(3, i32::MAX / 4), i32::MAX);
    assert_eq!(saturating_rounding_multiply_by_pow2(3, i32::MIN / 4), i32::MIN);
    assert_eq!(saturating_rounding_multiply_by_pow2(-1, 5), 3);
    assert_eq!(saturating_rounding_multiply_by_pow2(31, -1), i32::MIN);
}

#[test]
fn test_multiply_by_quantized_multiplier_right_shift() {
    // 0.5 in Q31 with one extra right shift = 0.25
    assert_eq!(multiply_by_quantized_multiplier(1010, 0x4000_0000, 1), 253);
    assert_eq!(multiply_by_quantized_multiplier(-1990, 0x4000_0000, 1), -498);
}

#[test]
fn test_multiply_by_quantized_multiplier_left_shift() {
    // 0.5 * 2^2 = 2
    assert_eq!(multiply_by_quantized_multiplier(100, 0x4000_0000, -2), 200);
    assert_eq!(multiply_by_quantized_multiplier(-7, 0x4000_0000, -1), -7);
}

#[test]
fn test_invsqrt_sentinel_for_small_inputs() {
    assert_eq!(get_invsqrt_quantized_multiplier_exp(0, 1), (i32::MAX, 0));
    assert_eq!(get_invsqrt_quantized_multiplier_exp(-5, -1), (i32::MAX, 0));
    assert_eq!(get_invsqrt_quantized_multiplier_exp(1, 1), (i32::MAX, 0));
}

#[test]
fn test_invsqrt_approximates_reciprocal_root() {
    for input in [2, 4, 9, 100, 1_000, 65_536, 123_456_789, 1 << 30, i32::MAX] {
        let (multiplier, shift) = get_invsqrt_quantized_multiplier_exp(input, 1);
        let value = multiplier as f64 / FIXED_POINT_ONE_Q0 as f64 * 2f64.powi(-shift);
        let expected = 1.0 / (input as f64).sqrt();
        let relative = ((value - expected) / expected).abs();
        assert!(relative < 1e-4, "input={input} value={value} expected={expected}");
    }
}

#[test]
fn test_invsqrt_reverse_shift_flips_sign() {
    let (m1, s1) = get_invsqrt_quantized_multiplier_exp(1 << 30, 1);
    let (m2, s2) = get_invsqrt_quantized_multiplier_exp(1 << 30, -1);
    assert_eq!(m1, m2);
    assert_eq!(s1, -s2);
    assert_eq!(s1, 12);
}
