//! 2D pooling: acceptance set and per-point reductions.
//!
//! Every backend (CPU generic, CPU assembly, OpenCL) validates through
//! [`validate_pooling`], so a descriptor accepted by one is accepted by all.

use crate::error::KernelError;
use crate::kernel::validate::{
    check_data_type_in, check_mismatching_data_types, check_mismatching_layouts,
    check_mismatching_shapes, ensure,
};
use crate::ops::shape::{compute_pool_shape, effective_pool_size, pool_layout};
use crate::quantization::get_min_max_values_from_quantized_data_type;
use crate::types::{
    DataLayout, DataType, PadStrideInfo, PoolingLayerInfo, PoolingType, TensorInfo,
    UniformQuantizationInfo,
};

pub const POOLING_TYPES: [DataType; 4] = [
    DataType::QAsymm8,
    DataType::QAsymm8Signed,
    DataType::F16,
    DataType::F32,
];

pub fn validate_pooling(
    src: &TensorInfo,
    dst: &TensorInfo,
    info: &PoolingLayerInfo,
) -> Result<(), KernelError> {
    check_data_type_in(src, &POOLING_TYPES, "src")?;
    ensure(
        !(src.data_type().is_quantized_asymmetric() && info.pool_type == PoolingType::L2),
        "Unsupported combination of parameters!",
    )?;
    let layout = pool_layout(src, info);
    ensure(
        matches!(layout, DataLayout::Nchw | DataLayout::Nhwc),
        format!("Unsupported data layout {layout}"),
    )?;
    let (pool_w, pool_h) = effective_pool_size(src, info);
    ensure(pool_w != 0 && pool_h != 0, "Pool size must be non-zero")?;
    ensure(
        !(src.data_type().is_quantized()
            && !info.exclude_padding
            && info.pool_type == PoolingType::Avg
            && info.pad_stride_info.has_padding()
            && layout == DataLayout::Nhwc),
        "exclude_padding equal false is not supported for AVG Pooling with padding on quantized types",
    )?;
    let expected = compute_pool_shape(src, info)?;
    if dst.total_size() != 0 {
        check_mismatching_data_types(src, dst, "src and dst")?;
        check_mismatching_layouts(src, dst, "src and dst")?;
        check_mismatching_shapes(dst.shape(), &expected, "dst")?;
    }
    Ok(())
}

/// Pooling window of one output point, clipped to the source plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRegion {
    pub x_begin: usize,
    pub x_end: usize,
    pub y_begin: usize,
    pub y_end: usize,
    /// Element count averages divide by.
    pub divisor: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub pool_type: PoolingType,
    pub src_width: usize,
    pub src_height: usize,
    pub pool_width: usize,
    pub pool_height: usize,
    pub pad_stride: PadStrideInfo,
    pub exclude_padding: bool,
}

impl PoolGeometry {
    pub fn new(src: &TensorInfo, info: &PoolingLayerInfo) -> Self {
        let layout = pool_layout(src, info);
        let (pool_width, pool_height) = effective_pool_size(src, info);
        Self {
            pool_type: info.pool_type,
            src_width: src.dimension(layout.width_index()),
            src_height: src.dimension(layout.height_index()),
            pool_width,
            pool_height,
            pad_stride: if info.is_global_pooling {
                PadStrideInfo::default()
            } else {
                info.pad_stride_info
            },
            exclude_padding: info.exclude_padding,
        }
    }

    pub fn region(&self, ox: usize, oy: usize) -> PoolRegion {
        let ps = &self.pad_stride;
        let (x_begin, x_end, x_count) = axis_region(
            ox * ps.stride_x,
            ps.pad_left,
            ps.pad_right,
            self.pool_width,
            self.src_width,
            self.exclude_padding,
        );
        let (y_begin, y_end, y_count) = axis_region(
            oy * ps.stride_y,
            ps.pad_top,
            ps.pad_bottom,
            self.pool_height,
            self.src_height,
            self.exclude_padding,
        );
        PoolRegion {
            x_begin,
            x_end,
            y_begin,
            y_end,
            divisor: (x_count * y_count).max(1),
        }
    }
}

/// Readable range plus averaging count along one axis.
fn axis_region(
    padded_start: usize,
    pad_before: usize,
    pad_after: usize,
    pool: usize,
    extent: usize,
    exclude_padding: bool,
) -> (usize, usize, i64) {
    let start = padded_start as i64 - pad_before as i64;
    let upper = extent as i64 + if exclude_padding { 0 } else { pad_after as i64 };
    let end = (start + pool as i64).min(upper);
    let count_start = if exclude_padding { start.max(0) } else { start };
    let begin = start.clamp(0, extent as i64) as usize;
    let read_end = end.clamp(0, extent as i64) as usize;
    (begin, read_end.max(begin), (end - count_start).max(0))
}

/// Integer division rounding half away from zero.
#[inline]
pub fn div_round_half_away(num: i64, den: i64) -> i64 {
    let half = den / 2;
    if num >= 0 {
        (num + half) / den
    } else {
        (num - half) / den
    }
}

/// Float reduction of one output point; rows outer, columns inner.
pub fn pool_point_f32(geom: &PoolGeometry, ox: usize, oy: usize, read: impl Fn(usize, usize) -> f32) -> f32 {
    let region = geom.region(ox, oy);
    match geom.pool_type {
        PoolingType::Max => {
            let mut acc = f32::MIN;
            for y in region.y_begin..region.y_end {
                for x in region.x_begin..region.x_end {
                    acc = acc.max(read(x, y));
                }
            }
            acc
        }
        PoolingType::Avg => {
            let mut acc = 0.0f32;
            for y in region.y_begin..region.y_end {
                for x in region.x_begin..region.x_end {
                    acc += read(x, y);
                }
            }
            acc / region.divisor as f32
        }
        PoolingType::L2 => {
            let mut acc = 0.0f32;
            for y in region.y_begin..region.y_end {
                for x in region.x_begin..region.x_end {
                    let v = read(x, y);
                    acc += v * v;
                }
            }
            (acc / region.divisor as f32).sqrt()
        }
    }
}

/// Quantized reduction of one output point, before any requantization.
pub fn pool_point_quantized(
    geom: &PoolGeometry,
    ox: usize,
    oy: usize,
    type_min: i32,
    read: impl Fn(usize, usize) -> i32,
) -> i32 {
    let region = geom.region(ox, oy);
    match geom.pool_type {
        PoolingType::Max => {
            let mut acc = type_min;
            for y in region.y_begin..region.y_end {
                for x in region.x_begin..region.x_end {
                    acc = acc.max(read(x, y));
                }
            }
            acc
        }
        // L2 is rejected for quantized types by validate_pooling
        PoolingType::Avg | PoolingType::L2 => {
            let mut acc = 0i64;
            for y in region.y_begin..region.y_end {
                for x in region.x_begin..region.x_end {
                    acc += read(x, y) as i64;
                }
            }
            div_round_half_away(acc, region.divisor) as i32
        }
    }
}

/// Maps pooled values from the source to the destination quantization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolRequantize {
    pub src: UniformQuantizationInfo,
    pub dst: UniformQuantizationInfo,
    pub min: i32,
    pub max: i32,
}

impl PoolRequantize {
    /// `None` when both sides share a quantization (or the type is float).
    pub fn new(src: &TensorInfo, dst: &TensorInfo) -> Result<Option<Self>, KernelError> {
        if !src.data_type().is_quantized() || src.quantization_info() == dst.quantization_info() {
            return Ok(None);
        }
        let (min, max) = get_min_max_values_from_quantized_data_type(src.data_type())?;
        Ok(Some(Self {
            src: src.quantization_info().uniform(),
            dst: dst.quantization_info().uniform(),
            min,
            max,
        }))
    }

    #[inline]
    pub fn apply(&self, value: i32) -> i32 {
        let real = (value - self.src.offset) as f32 * self.src.scale as f32;
        let q = (real / self.dst.scale as f32).round() as i32 + self.dst.offset;
        q.clamp(self.min, self.max)
    }
}
