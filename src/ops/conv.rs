//! Direct 2D convolution: acceptance set, geometry and per-point math.
//!
//! Padded source elements contribute nothing. For quantized tensors that is
//! the same as reading the source zero point, since `src + src_offset == 0`
//! there.

use crate::error::KernelError;
use crate::kernel::validate::{
    check_data_type_in, check_destination, check_mismatching_data_types, check_quantization_scales,
    ensure,
};
use crate::ops::shape::compute_deep_convolution_shape;
use crate::quantization::{
    calculate_quantized_multiplier, compute_quantized_multipliers_and_shifts,
    get_quantized_activation_min_max, multiply_by_quantized_multiplier,
};
use crate::types::{ActivationLayerInfo, DataLayout, DataType, PadStrideInfo, TensorInfo};

/// Spatial walk of a convolution window over a padded plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub src_width: usize,
    pub src_height: usize,
    pub kernel_width: usize,
    pub kernel_height: usize,
    pub stride_x: usize,
    pub stride_y: usize,
    pub pad_left: usize,
    pub pad_top: usize,
}

impl ConvGeometry {
    pub fn new(src: &TensorInfo, weights: &TensorInfo, conv_info: &PadStrideInfo) -> Self {
        let layout = src.data_layout();
        Self {
            src_width: src.dimension(layout.width_index()),
            src_height: src.dimension(layout.height_index()),
            kernel_width: weights.dimension(layout.width_index()),
            kernel_height: weights.dimension(layout.height_index()),
            stride_x: conv_info.stride_x,
            stride_y: conv_info.stride_y,
            pad_left: conv_info.pad_left,
            pad_top: conv_info.pad_top,
        }
    }

    /// Source column read by output column `ox` at kernel tap `kx`, if not padding.
    #[inline]
    pub fn input_x(&self, ox: usize, kx: usize) -> Option<usize> {
        (ox * self.stride_x + kx)
            .checked_sub(self.pad_left)
            .filter(|&x| x < self.src_width)
    }

    #[inline]
    pub fn input_y(&self, oy: usize, ky: usize) -> Option<usize> {
        (oy * self.stride_y + ky)
            .checked_sub(self.pad_top)
            .filter(|&y| y < self.src_height)
    }

    /// Visit every in-bounds `(kx, ky, ix, iy)` tap of output `(ox, oy)`, ky-major.
    #[inline]
    pub fn for_each_tap(&self, ox: usize, oy: usize, mut f: impl FnMut(usize, usize, usize, usize)) {
        for ky in 0..self.kernel_height {
            let Some(iy) = self.input_y(oy, ky) else { continue };
            for kx in 0..self.kernel_width {
                let Some(ix) = self.input_x(ox, kx) else { continue };
                f(kx, ky, ix, iy);
            }
        }
    }
}

/// Requantization of int32 accumulators into the destination type.
#[derive(Debug, Clone, PartialEq)]
pub struct Requantize {
    pub multipliers: Vec<i32>,
    pub shifts: Vec<i32>,
    pub src_offset: i32,
    pub weights_offset: i32,
    pub dst_offset: i32,
    pub min: i32,
    pub max: i32,
}

impl Requantize {
    /// Constants for `src * weights -> dst`; per-channel when the weights carry
    /// several scales.
    pub fn new(
        src: &TensorInfo,
        weights: &TensorInfo,
        dst: &TensorInfo,
        act: &ActivationLayerInfo,
    ) -> Result<Self, KernelError> {
        let iq = src.quantization_info().uniform();
        let oq = dst.quantization_info().uniform();
        let (multipliers, shifts) = compute_quantized_multipliers_and_shifts(src, weights, dst)?;
        let (min, max) = get_quantized_activation_min_max(act, dst.data_type(), &oq)?;
        let weights_offset = if weights.data_type().is_quantized_per_channel() {
            0
        } else {
            -weights.quantization_info().offset()
        };
        Ok(Self {
            multipliers,
            shifts,
            src_offset: -iq.offset,
            weights_offset,
            dst_offset: oq.offset,
            min,
            max,
        })
    }

    pub fn is_per_channel(&self) -> bool {
        self.multipliers.len() > 1
    }

    #[inline]
    pub fn apply(&self, acc: i32, channel: usize) -> i32 {
        let idx = if self.is_per_channel() { channel } else { 0 };
        let scaled = multiply_by_quantized_multiplier(acc, self.multipliers[idx], self.shifts[idx]);
        scaled.wrapping_add(self.dst_offset).clamp(self.min, self.max)
    }
}

/// Acceptance set of the direct convolution shared by all backends.
pub fn validate_direct_conv(
    src: &TensorInfo,
    weights: &TensorInfo,
    biases: Option<&TensorInfo>,
    dst: &TensorInfo,
    conv_info: &PadStrideInfo,
    act: &ActivationLayerInfo,
) -> Result<(), KernelError> {
    check_data_type_in(
        src,
        &[DataType::QAsymm8Signed, DataType::QAsymm8, DataType::F16, DataType::F32],
        "src",
    )?;
    check_mismatching_data_types(src, weights, "src and weights")?;
    let layout = src.data_layout();
    ensure(
        matches!(layout, DataLayout::Nchw | DataLayout::Nhwc),
        format!("Unsupported data layout {layout}"),
    )?;
    let (w_idx, h_idx, c_idx) = (layout.width_index(), layout.height_index(), layout.channel_index());
    ensure(
        weights.dimension(w_idx) == weights.dimension(h_idx),
        "Weights should have same width and height",
    )?;
    ensure(
        weights.dimension(c_idx) == src.dimension(c_idx),
        "Weights feature map dimension should match the respective src's one",
    )?;
    ensure(weights.num_dimensions() <= 4, "Weights can be at most 4 dimensional")?;
    let kernel_size = weights.dimension(w_idx);
    ensure(
        !(kernel_size == 1 && conv_info.stride_x > 3),
        "Strides larger than 3 not supported for 1x1 convolution.",
    )?;
    ensure(
        !(matches!(kernel_size, 3 | 5 | 9) && conv_info.stride_x > 2),
        "Strides larger than 2 not supported for 3x3, 5x5, 9x9 convolution.",
    )?;
    ensure(
        !(layout != DataLayout::Nhwc && !src.data_type().is_float() && act.enabled),
        "Activation supported only for floating point and NHWC.",
    )?;

    if let Some(biases) = biases {
        if src.data_type().is_quantized_asymmetric() {
            check_data_type_in(biases, &[DataType::S32], "biases")?;
        } else {
            check_mismatching_data_types(weights, biases, "weights and biases")?;
        }
        ensure(
            biases.dimension(0) == weights.dimension(3),
            "Biases size and number of src feature maps should match",
        )?;
        ensure(biases.num_dimensions() <= 1, "Biases should be one dimensional")?;
    }

    let expected = compute_deep_convolution_shape(src, weights, conv_info)?;
    check_destination(dst, &expected, src.data_type())?;

    if src.data_type().is_quantized() {
        check_quantization_scales(src, "src")?;
        check_quantization_scales(weights, "weights")?;
        let oq = if dst.quantization_info().is_empty() {
            src.quantization_info()
        } else {
            dst.quantization_info()
        };
        let ratio = src.quantization_info().uniform().scale * weights.quantization_info().uniform().scale
            / oq.uniform().scale;
        calculate_quantized_multiplier(ratio, false)?;
    }
    Ok(())
}

/// Float accumulation of one output point over `channels` input channels.
#[inline]
pub fn conv_point_f32(
    geom: &ConvGeometry,
    ox: usize,
    oy: usize,
    channels: usize,
    src: impl Fn(usize, usize, usize) -> f32,
    weights: impl Fn(usize, usize, usize) -> f32,
) -> f32 {
    let mut acc = 0.0f32;
    geom.for_each_tap(ox, oy, |kx, ky, ix, iy| {
        for c in 0..channels {
            acc += src(ix, iy, c) * weights(kx, ky, c);
        }
    });
    acc
}

/// Integer accumulation of one output point; offsets are added per element.
#[inline]
pub fn conv_point_quantized(
    geom: &ConvGeometry,
    ox: usize,
    oy: usize,
    channels: usize,
    requant: &Requantize,
    src: impl Fn(usize, usize, usize) -> i32,
    weights: impl Fn(usize, usize, usize) -> i32,
) -> i32 {
    let mut acc = 0i32;
    geom.for_each_tap(ox, oy, |kx, ky, ix, iy| {
        for c in 0..channels {
            let s = src(ix, iy, c).wrapping_add(requant.src_offset);
            let w = weights(kx, ky, c).wrapping_add(requant.weights_offset);
            acc = acc.wrapping_add(s.wrapping_mul(w));
        }
    });
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActivationFunction, QuantizationInfo, TensorShape};

    fn nchw(shape: &[usize], dt: DataType) -> TensorInfo {
        TensorInfo::new(TensorShape::new(shape), dt)
    }

    #[test]
    fn test_geometry_skips_padding() {
        let src = nchw(&[4, 4, 1], DataType::F32);
        let weights = nchw(&[3, 3, 1, 1], DataType::F32);
        let geom = ConvGeometry::new(&src, &weights, &PadStrideInfo::new(1, 1, 1, 1));
        let mut taps = 0;
        geom.for_each_tap(0, 0, |_, _, _, _| taps += 1);
        assert_eq!(taps, 4);
        assert_eq!(geom.input_x(3, 2), None);
        assert_eq!(geom.input_x(1, 0), Some(0));
    }

    #[test]
    fn test_validate_direct_conv_messages() {
        let src = nchw(&[8, 8, 3], DataType::F32);
        let weights = nchw(&[3, 3, 3, 4], DataType::F32);
        validate_direct_conv(&src, &weights, None, &TensorInfo::empty(), &PadStrideInfo::new(1, 1, 1, 1), &ActivationLayerInfo::disabled()).unwrap();

        let wrong_c = nchw(&[3, 3, 2, 4], DataType::F32);
        let err = validate_direct_conv(&src, &wrong_c, None, &TensorInfo::empty(), &PadStrideInfo::default(), &ActivationLayerInfo::disabled()).unwrap_err();
        assert_eq!(err.to_string(), "Weights feature map dimension should match the respective src's one");

        let err = validate_direct_conv(&src, &weights, None, &TensorInfo::empty(), &PadStrideInfo::new(3, 3, 0, 0), &ActivationLayerInfo::disabled()).unwrap_err();
        assert_eq!(err.to_string(), "Strides larger than 2 not supported for 3x3, 5x5, 9x9 convolution.");

        let bias = nchw(&[5], DataType::F32);
        let err = validate_direct_conv(&src, &weights, Some(&bias), &TensorInfo::empty(), &PadStrideInfo::default(), &ActivationLayerInfo::disabled()).unwrap_err();
        assert_eq!(err.to_string(), "Biases size and number of src feature maps should match");
    }

    #[test]
    fn test_quantized_activation_requires_nhwc() {
        let q = QuantizationInfo::new(0.5, 10);
        let src = nchw(&[8, 8, 3], DataType::QAsymm8).with_quantization(q.clone());
        let weights = nchw(&[3, 3, 3, 4], DataType::QAsymm8).with_quantization(q);
        let relu = ActivationLayerInfo::new(ActivationFunction::Relu, 0.0, 0.0);
        let err = validate_direct_conv(&src, &weights, None, &TensorInfo::empty(), &PadStrideInfo::default(), &relu).unwrap_err();
        assert_eq!(err.to_string(), "Activation supported only for floating point and NHWC.");
    }

    #[test]
    fn test_quantized_point() {
        let q = QuantizationInfo::new(1.0, 1);
        let src = nchw(&[2, 2, 1], DataType::QAsymm8).with_quantization(q.clone());
        let weights = nchw(&[2, 2, 1, 1], DataType::QAsymm8).with_quantization(q.clone());
        let dst = nchw(&[1, 1, 1], DataType::QAsymm8).with_quantization(QuantizationInfo::new(2.0, 3));
        let geom = ConvGeometry::new(&src, &weights, &PadStrideInfo::default());
        let requant = Requantize::new(&src, &weights, &dst, &ActivationLayerInfo::disabled()).unwrap();
        let acc = conv_point_quantized(&geom, 0, 0, 1, &requant, |x, y, _| (1 + x + 2 * y) as i32 + 1, |_, _, _| 3);
        // sum(src - 1) * (3 - 1) = (1 + 2 + 3 + 4) * 2
        assert_eq!(acc, 20);
        assert_eq!(requant.apply(acc, 0), 13);
    }
}
