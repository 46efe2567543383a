//! Depthwise convolution: acceptance set and per-point math.
//!
//! Output channel `c` reads source channel `c / depth_multiplier`. Weights
//! are `[kw, kh, C * dm]` in NCHW and `[C * dm, kw, kh]` in NHWC.

use crate::error::KernelError;
use crate::kernel::validate::{
    check_data_type_in, check_destination, check_mismatching_data_types, ensure,
};
use crate::ops::conv::{ConvGeometry, Requantize};
use crate::ops::shape::compute_depthwise_convolution_shape;
use crate::quantization::calculate_quantized_multiplier;
use crate::types::{ActivationLayerInfo, DataLayout, DataType, PadStrideInfo, TensorInfo};

pub const DEPTHWISE_TYPES: [DataType; 4] = [
    DataType::QAsymm8,
    DataType::QAsymm8Signed,
    DataType::F16,
    DataType::F32,
];

/// Descriptor of a depthwise convolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthwiseInfo {
    pub pad_stride: PadStrideInfo,
    pub depth_multiplier: usize,
    pub activation: ActivationLayerInfo,
}

impl DepthwiseInfo {
    pub fn new(pad_stride: PadStrideInfo, depth_multiplier: usize) -> Self {
        Self {
            pad_stride,
            depth_multiplier,
            activation: ActivationLayerInfo::disabled(),
        }
    }

    pub fn with_activation(mut self, activation: ActivationLayerInfo) -> Self {
        self.activation = activation;
        self
    }
}

/// Acceptance set shared by every depthwise backend.
pub fn validate_depthwise(
    src: &TensorInfo,
    weights: &TensorInfo,
    biases: Option<&TensorInfo>,
    dst: &TensorInfo,
    info: &DepthwiseInfo,
) -> Result<(), KernelError> {
    check_data_type_in(src, &DEPTHWISE_TYPES, "src")?;
    let layout = src.data_layout();
    ensure(
        matches!(layout, DataLayout::Nchw | DataLayout::Nhwc),
        format!("Unsupported data layout {layout}"),
    )?;
    ensure(info.depth_multiplier >= 1, "Depth multiplier must be at least 1")?;
    ensure(
        info.pad_stride.stride_x >= 1 && info.pad_stride.stride_y >= 1,
        "Strides must be at least 1",
    )?;

    let data_type = src.data_type();
    if data_type.is_quantized() && weights.data_type() == DataType::QSymm8PerChannel {
        ensure(
            data_type == DataType::QAsymm8 || data_type == DataType::QAsymm8Signed,
            "Per-channel weights need an asymmetric quantized src",
        )?;
    } else {
        check_mismatching_data_types(src, weights, "src and weights")?;
    }

    ensure(weights.num_dimensions() <= 3, "Weights can be at most 3 dimensional")?;
    let c_idx = layout.channel_index();
    let out_channels = src.dimension(c_idx) * info.depth_multiplier;
    ensure(
        weights.dimension(c_idx) == out_channels,
        "Weights feature map dimension should match src channels times depth multiplier",
    )?;
    if weights.data_type().is_quantized_per_channel() {
        ensure(
            weights.quantization_info().scales().len() == out_channels,
            "Per-channel weights need one scale per output channel",
        )?;
    }

    if let Some(biases) = biases {
        if data_type.is_quantized_asymmetric() {
            check_data_type_in(biases, &[DataType::S32], "biases")?;
        } else {
            check_mismatching_data_types(weights, biases, "weights and biases")?;
        }
        ensure(
            biases.dimension(0) == out_channels,
            "Biases size and number of output feature maps should match",
        )?;
        ensure(biases.num_dimensions() <= 1, "Biases should be one dimensional")?;
    }

    let expected = compute_depthwise_convolution_shape(src, weights, &info.pad_stride, info.depth_multiplier)?;
    check_destination(dst, &expected, data_type)?;

    if data_type.is_quantized() {
        let iq = src.quantization_info().uniform();
        let oq = if dst.quantization_info().is_empty() {
            iq
        } else {
            dst.quantization_info().uniform()
        };
        for weight_scale in weights.quantization_info().scales() {
            calculate_quantized_multiplier(iq.scale * weight_scale / oq.scale, false)?;
        }
    }
    Ok(())
}

/// Float accumulation of one output point.
#[inline]
pub fn depthwise_point_f32(
    geom: &ConvGeometry,
    ox: usize,
    oy: usize,
    src: impl Fn(usize, usize) -> f32,
    weights: impl Fn(usize, usize) -> f32,
) -> f32 {
    let mut acc = 0.0f32;
    geom.for_each_tap(ox, oy, |kx, ky, ix, iy| acc += src(ix, iy) * weights(kx, ky));
    acc
}

#[inline]
pub fn depthwise_point_quantized(
    geom: &ConvGeometry,
    ox: usize,
    oy: usize,
    requant: &Requantize,
    src: impl Fn(usize, usize) -> i32,
    weights: impl Fn(usize, usize) -> i32,
) -> i32 {
    let mut acc = 0i32;
    geom.for_each_tap(ox, oy, |kx, ky, ix, iy| {
        let s = src(ix, iy).wrapping_add(requant.src_offset);
        let w = weights(kx, ky).wrapping_add(requant.weights_offset);
        acc = acc.wrapping_add(s.wrapping_mul(w));
    });
    acc
}
