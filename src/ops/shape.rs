//! Output shape calculators used by validate and auto-initialisation.

use crate::error::KernelError;
use crate::types::{
    Coordinates, DataLayout, DimensionRoundingType, PadStrideInfo,
    PoolingLayerInfo, TensorInfo, TensorShape, MAX_DIMS,
};

/// Coordinates of `(x, y, channel, batch)` in a tensor stored with `layout`.
///
/// Also addresses weights, whose kernel index takes the batch position.
#[inline]
pub fn layout_coords(layout: DataLayout, x: usize, y: usize, channel: usize, batch: usize) -> Coordinates {
    let mut coords = [0; MAX_DIMS];
    coords[layout.width_index()] = x;
    coords[layout.height_index()] = y;
    coords[layout.channel_index()] = channel;
    coords[layout.batch_index()] = batch;
    coords
}

/// Output (width, height) of a sliding window over a padded plane.
pub fn scaled_dimensions(
    width: usize,
    height: usize,
    kernel_width: usize,
    kernel_height: usize,
    info: &PadStrideInfo,
) -> Result<(usize, usize), KernelError> {
    let out_w = scaled_extent(
        width + info.pad_left + info.pad_right,
        kernel_width,
        info.stride_x,
        info.round,
    );
    let out_h = scaled_extent(
        height + info.pad_top + info.pad_bottom,
        kernel_height,
        info.stride_y,
        info.round,
    );
    match (out_w, out_h) {
        (Some(w), Some(h)) if w >= 1 && h >= 1 => Ok((w, h)),
        _ => Err(KernelError::InvalidConfiguration(
            "Calculated output dimension size is invalid".to_string(),
        )),
    }
}

fn scaled_extent(padded: usize, kernel: usize, stride: usize, round: DimensionRoundingType) -> Option<usize> {
    if stride == 0 || kernel == 0 || padded < kernel {
        return None;
    }
    let span = padded - kernel;
    let steps = match round {
        DimensionRoundingType::Floor => span / stride,
        DimensionRoundingType::Ceil => span.div_ceil(stride),
    };
    Some(steps + 1)
}

/// `[N, M, batch..]` for `lhs[K, M, batch..] * rhs[N, K]`.
pub fn compute_mm_shape(lhs: &TensorInfo, rhs: &TensorInfo) -> TensorShape {
    let mut shape = *lhs.shape();
    shape.set(0, rhs.dimension(0));
    shape.set(1, lhs.dimension(1));
    shape
}

/// Output of a direct convolution: spatial dims scaled, channels = number of kernels.
///
/// Weights are `[kw, kh, ifm, ofm]` in NCHW and `[ifm, kw, kh, ofm]` in NHWC.
pub fn compute_deep_convolution_shape(
    src: &TensorInfo,
    weights: &TensorInfo,
    conv_info: &PadStrideInfo,
) -> Result<TensorShape, KernelError> {
    let layout = src.data_layout();
    let (w_idx, h_idx, c_idx) = (layout.width_index(), layout.height_index(), layout.channel_index());
    let (out_w, out_h) = scaled_dimensions(
        src.dimension(w_idx),
        src.dimension(h_idx),
        weights.dimension(w_idx),
        weights.dimension(h_idx),
        conv_info,
    )?;
    let mut shape = *src.shape();
    shape.set(w_idx, out_w);
    shape.set(h_idx, out_h);
    shape.set(c_idx, weights.dimension(3));
    Ok(shape)
}

/// Output of a depthwise convolution with `depth_multiplier` kernels per input channel.
pub fn compute_depthwise_convolution_shape(
    src: &TensorInfo,
    weights: &TensorInfo,
    conv_info: &PadStrideInfo,
    depth_multiplier: usize,
) -> Result<TensorShape, KernelError> {
    let layout = src.data_layout();
    let (w_idx, h_idx, c_idx) = (layout.width_index(), layout.height_index(), layout.channel_index());
    let (out_w, out_h) = scaled_dimensions(
        src.dimension(w_idx),
        src.dimension(h_idx),
        weights.dimension(w_idx),
        weights.dimension(h_idx),
        conv_info,
    )?;
    let mut shape = *src.shape();
    shape.set(w_idx, out_w);
    shape.set(h_idx, out_h);
    shape.set(c_idx, src.dimension(c_idx) * depth_multiplier);
    Ok(shape)
}

/// Layout a pooling runs in: the descriptor's, or the source's when unset.
pub fn pool_layout(src: &TensorInfo, info: &PoolingLayerInfo) -> DataLayout {
    if info.data_layout == DataLayout::Unknown {
        src.data_layout()
    } else {
        info.data_layout
    }
}

/// Effective pool size, expanding global pooling to the whole plane.
pub fn effective_pool_size(src: &TensorInfo, info: &PoolingLayerInfo) -> (usize, usize) {
    if info.is_global_pooling {
        let layout = pool_layout(src, info);
        return (
            src.dimension(layout.width_index()),
            src.dimension(layout.height_index()),
        );
    }
    (info.pool_size.width, info.pool_size.height)
}

pub fn compute_pool_shape(src: &TensorInfo, info: &PoolingLayerInfo) -> Result<TensorShape, KernelError> {
    let layout = pool_layout(src, info);
    let (w_idx, h_idx) = (layout.width_index(), layout.height_index());
    let (pool_w, pool_h) = effective_pool_size(src, info);
    let pad_stride = if info.is_global_pooling {
        PadStrideInfo::default()
    } else {
        info.pad_stride_info
    };
    let (out_w, out_h) = scaled_dimensions(
        src.dimension(w_idx),
        src.dimension(h_idx),
        pool_w,
        pool_h,
        &pad_stride,
    )?;
    let mut shape = *src.shape();
    shape.set(w_idx, out_w);
    shape.set(h_idx, out_h);
    Ok(shape)
}
