//! Properties of the multiplier encoding and fixed-point primitives.

use gg_compute::quantization::{
    calculate_quantized_multiplier, calculate_quantized_multiplier_greater_than_one,
    calculate_quantized_multiplier_less_than_one, calculate_quantized_multipliers,
    get_quantized_activation_min_max, multiply_by_quantized_multiplier, rounding_divide_by_pow2,
    saturating_rounding_doubling_highmul,
};
use gg_compute::types::{
    ActivationFunction, ActivationLayerInfo, DataType, GemmLowpOutputStageInfo, QuantizationInfo,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const TWO_POW_30: f64 = (1u64 << 30) as f64;

#[test]
fn sub_unit_multiplier_round_trip_is_within_bound() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let bound = 2f64.powi(-29);
    let mut samples: Vec<f64> = (0..2000).map(|_| rng.gen_range(1e-6..0.999)).collect();
    samples.extend([0.5, 0.25, 0.125, 0.75, 1.0 / 3.0, 0.0078125]);

    for m in samples {
        let (q, s) = calculate_quantized_multiplier_less_than_one(m, false).unwrap();
        let scaled = multiply_by_quantized_multiplier(1 << 30, q, s as i32);
        let error = (scaled as f64 / TWO_POW_30 - m).abs();
        assert!(error < bound, "m = {m}: q = {q}, s = {s}, error = {error}");
    }
}

#[test]
fn general_multiplier_round_trip() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..500 {
        let m: f64 = rng.gen_range(1e-4..64.0);
        let quantized = calculate_quantized_multiplier(m, false).unwrap();
        assert!(quantized.multiplier >= 1 << 30, "mantissa not normalised for {m}");
        assert!(((quantized.to_real() - m) / m).abs() < 1e-9);
    }
}

#[test]
fn near_one_multiplier_renormalises() {
    let quantized = calculate_quantized_multiplier(0.99999999999, false).unwrap();
    assert!(quantized.multiplier >= 1 << 30);
    assert!((quantized.multiplier as i64) < (1i64 << 31));
    assert_eq!(quantized.multiplier, 1 << 30);
    assert_eq!(quantized.shift, -1);
    assert!((quantized.to_real() - 1.0).abs() < 1e-9);
}

#[test]
fn greater_than_one_uses_left_shift() {
    let (q, left) = calculate_quantized_multiplier_greater_than_one(3.0).unwrap();
    assert_eq!(q, 1_610_612_736);
    assert_eq!(left, 2);
    assert_eq!(multiply_by_quantized_multiplier(100, q, -left), 300);
    assert!(calculate_quantized_multiplier_greater_than_one(0.5).is_err());
}

#[test]
fn zero_and_invalid_multipliers() {
    let zero = calculate_quantized_multiplier(0.0, false).unwrap();
    assert_eq!((zero.multiplier, zero.shift), (0, 0));
    assert_eq!(calculate_quantized_multiplier_less_than_one(0.0, false).unwrap(), (0, 0));

    assert!(calculate_quantized_multiplier(-0.5, false).is_err());
    assert!(calculate_quantized_multiplier(f64::NAN, false).is_err());
    assert!(calculate_quantized_multiplier_less_than_one(1.5, false).is_err());

    // Tiny multipliers flush to zero only when epsilon is ignored
    let tiny = calculate_quantized_multiplier(1e-12, true).unwrap();
    assert_eq!((tiny.multiplier, tiny.shift), (0, 0));
    assert!(calculate_quantized_multiplier(1e-12, false).unwrap().shift > 31);
}

#[test]
fn rounding_divide_by_zero_exponent_is_identity() {
    let mut rng = StdRng::seed_from_u64(7);
    for x in [i32::MIN, i32::MIN + 1, -1, 0, 1, i32::MAX - 1, i32::MAX] {
        assert_eq!(rounding_divide_by_pow2(x, 0), x);
    }
    for _ in 0..1000 {
        let x: i32 = rng.gen();
        assert_eq!(rounding_divide_by_pow2(x, 0), x);
    }
}

#[test]
fn highmul_saturates_at_the_overflow_corner() {
    assert_eq!(saturating_rounding_doubling_highmul(i32::MIN, i32::MIN), i32::MAX);
    assert_eq!(saturating_rounding_doubling_highmul(i32::MIN, i32::MAX), -i32::MAX);
    assert_eq!(saturating_rounding_doubling_highmul(i32::MAX, i32::MAX), i32::MAX - 1);
}

#[test]
fn per_channel_multipliers_fill_stage() {
    let input = QuantizationInfo::new(0.5, 0);
    let weights = QuantizationInfo::per_channel(vec![0.25, 0.5, 1.0], 0);
    let output = QuantizationInfo::new(1.0, 0);
    let mut stage = GemmLowpOutputStageInfo::default();
    calculate_quantized_multipliers(&input, &weights, &output, &mut stage).unwrap();

    assert!(stage.is_quantized_per_channel);
    assert_eq!(stage.gemmlowp_multipliers, vec![1 << 30; 3]);
    assert_eq!(stage.gemmlowp_shifts, vec![2, 1, 0]);
    assert_eq!(stage.gemmlowp_multiplier, 1 << 30);
    assert_eq!(stage.gemmlowp_shift, 2);
}

#[test]
fn activation_bounds_in_quantized_domain() {
    let qinfo = QuantizationInfo::new(0.1, 10).uniform();
    let relu6 = ActivationLayerInfo::new(ActivationFunction::BoundedRelu, 6.0, 0.0);
    assert_eq!(
        get_quantized_activation_min_max(&relu6, DataType::QAsymm8, &qinfo).unwrap(),
        (10, 70)
    );
    let identity = ActivationLayerInfo::disabled();
    assert_eq!(
        get_quantized_activation_min_max(&identity, DataType::QAsymm8Signed, &qinfo).unwrap(),
        (-128, 127)
    );
    assert!(get_quantized_activation_min_max(&identity, DataType::F32, &qinfo).is_err());
}
