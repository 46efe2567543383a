//! Operator descriptors passed to kernel `validate`/`configure`.

use serde::{Deserialize, Serialize};

use super::{DataLayout, DataType};

/// Width/height pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size2D {
    pub width: usize,
    pub height: usize,
}

impl Size2D {
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub const fn square(size: usize) -> Self {
        Self::new(size, size)
    }

    pub fn area(&self) -> usize {
        self.width * self.height
    }
}

/// How output spatial extents are rounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DimensionRoundingType {
    #[default]
    Floor,
    Ceil,
}

/// Strides and (possibly asymmetric) padding of a spatial operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PadStrideInfo {
    pub stride_x: usize,
    pub stride_y: usize,
    pub pad_left: usize,
    pub pad_right: usize,
    pub pad_top: usize,
    pub pad_bottom: usize,
    pub round: DimensionRoundingType,
}

impl PadStrideInfo {
    /// Symmetric padding.
    pub fn new(stride_x: usize, stride_y: usize, pad_x: usize, pad_y: usize) -> Self {
        Self {
            stride_x,
            stride_y,
            pad_left: pad_x,
            pad_right: pad_x,
            pad_top: pad_y,
            pad_bottom: pad_y,
            round: DimensionRoundingType::Floor,
        }
    }

    pub fn with_padding(mut self, left: usize, right: usize, top: usize, bottom: usize) -> Self {
        self.pad_left = left;
        self.pad_right = right;
        self.pad_top = top;
        self.pad_bottom = bottom;
        self
    }

    pub fn with_rounding(mut self, round: DimensionRoundingType) -> Self {
        self.round = round;
        self
    }

    pub fn has_padding(&self) -> bool {
        self.pad_left != 0 || self.pad_right != 0 || self.pad_top != 0 || self.pad_bottom != 0
    }
}

impl Default for PadStrideInfo {
    fn default() -> Self {
        Self::new(1, 1, 0, 0)
    }
}

/// Halo (in elements) a kernel reads outside its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BorderSize {
    pub top: usize,
    pub right: usize,
    pub bottom: usize,
    pub left: usize,
}

impl BorderSize {
    pub const fn new(top: usize, right: usize, bottom: usize, left: usize) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    pub const fn uniform(size: usize) -> Self {
        Self::new(size, size, size, size)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolingType {
    Max,
    Avg,
    L2,
}

/// 2D pooling descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolingLayerInfo {
    pub pool_type: PoolingType,
    pub pool_size: Size2D,
    pub data_layout: DataLayout,
    pub pad_stride_info: PadStrideInfo,
    /// Average pooling divides by the number of in-bounds elements only.
    pub exclude_padding: bool,
    /// Pool over the whole plane; `pool_size` is taken from the input.
    pub is_global_pooling: bool,
}

impl PoolingLayerInfo {
    pub fn new(
        pool_type: PoolingType,
        pool_size: Size2D,
        data_layout: DataLayout,
        pad_stride_info: PadStrideInfo,
        exclude_padding: bool,
    ) -> Self {
        Self {
            pool_type,
            pool_size,
            data_layout,
            pad_stride_info,
            exclude_padding,
            is_global_pooling: false,
        }
    }

    pub fn global(pool_type: PoolingType, data_layout: DataLayout) -> Self {
        Self {
            pool_type,
            pool_size: Size2D::default(),
            data_layout,
            pad_stride_info: PadStrideInfo::default(),
            exclude_padding: false,
            is_global_pooling: true,
        }
    }
}

/// Softmax along axis 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoftmaxInfo {
    pub beta: f32,
    pub is_log: bool,
}

impl Default for SoftmaxInfo {
    fn default() -> Self {
        Self {
            beta: 1.0,
            is_log: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivationFunction {
    Identity,
    Relu,
    /// `min(a, max(0, x))`
    BoundedRelu,
    /// `min(a, max(b, x))`
    LuBoundedRelu,
}

/// Fused activation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivationLayerInfo {
    pub function: ActivationFunction,
    pub a: f32,
    pub b: f32,
    pub enabled: bool,
}

impl ActivationLayerInfo {
    pub fn new(function: ActivationFunction, a: f32, b: f32) -> Self {
        Self {
            function,
            a,
            b,
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            function: ActivationFunction::Identity,
            a: 0.0,
            b: 0.0,
            enabled: false,
        }
    }

    pub fn apply(&self, x: f32) -> f32 {
        if !self.enabled {
            return x;
        }
        match self.function {
            ActivationFunction::Identity => x,
            ActivationFunction::Relu => x.max(0.0),
            ActivationFunction::BoundedRelu => x.max(0.0).min(self.a),
            ActivationFunction::LuBoundedRelu => x.max(self.b).min(self.a),
        }
    }
}

impl Default for ActivationLayerInfo {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Matrix sizes of a GEMM: `dst[M, N] = lhs[M, K] * rhs[K, N]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GemmKernelInfo {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

/// Register blocking on the LHS matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GemmLhsBlockInfo {
    pub m0: usize,
    pub k0: usize,
}

impl Default for GemmLhsBlockInfo {
    fn default() -> Self {
        Self { m0: 4, k0: 4 }
    }
}

/// Register blocking on the RHS matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GemmRhsBlockInfo {
    pub n0: usize,
    pub k0: usize,
}

impl Default for GemmRhsBlockInfo {
    fn default() -> Self {
        Self { n0: 4, k0: 4 }
    }
}

/// Requantization flavour of the GEMMLowp output stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OutputStageType {
    #[default]
    None,
    /// `((acc + bias + offset) * multiplier) >> shift`
    QuantizeDown,
    /// Q31 fixed-point multiplier with rounding shift.
    QuantizeDownFixedPoint,
    /// `round(acc * real_multiplier) + offset` in float.
    QuantizeDownFloat,
}

/// Everything needed to requantize int32 accumulators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GemmLowpOutputStageInfo {
    pub kind: OutputStageType,
    pub output_data_type: DataType,
    pub gemmlowp_offset: i32,
    pub gemmlowp_multiplier: i32,
    pub gemmlowp_shift: i32,
    pub gemmlowp_min_bound: i32,
    pub gemmlowp_max_bound: i32,
    pub gemmlowp_multipliers: Vec<i32>,
    pub gemmlowp_shifts: Vec<i32>,
    pub gemmlowp_real_multiplier: f32,
    pub is_quantized_per_channel: bool,
}

impl Default for GemmLowpOutputStageInfo {
    fn default() -> Self {
        Self {
            kind: OutputStageType::None,
            output_data_type: DataType::Unknown,
            gemmlowp_offset: 0,
            gemmlowp_multiplier: 0,
            gemmlowp_shift: 0,
            gemmlowp_min_bound: i32::MIN,
            gemmlowp_max_bound: i32::MAX,
            gemmlowp_multipliers: Vec::new(),
            gemmlowp_shifts: Vec::new(),
            gemmlowp_real_multiplier: 0.0,
            is_quantized_per_channel: false,
        }
    }
}

impl GemmLowpOutputStageInfo {
    /// Per-tensor fixed-point stage clamped to the full range of `output_data_type`.
    pub fn fixed_point(output_data_type: DataType, multiplier: i32, shift: i32, offset: i32) -> Self {
        let (min, max) = type_range(output_data_type);
        Self {
            kind: OutputStageType::QuantizeDownFixedPoint,
            output_data_type,
            gemmlowp_offset: offset,
            gemmlowp_multiplier: multiplier,
            gemmlowp_shift: shift,
            gemmlowp_min_bound: min,
            gemmlowp_max_bound: max,
            gemmlowp_multipliers: vec![multiplier],
            gemmlowp_shifts: vec![shift],
            ..Self::default()
        }
    }

    pub fn with_bounds(mut self, min: i32, max: i32) -> Self {
        self.gemmlowp_min_bound = min;
        self.gemmlowp_max_bound = max;
        self
    }

    /// Multiplier/shift for `channel`, falling back to the per-tensor pair.
    pub fn multiplier_for(&self, channel: usize) -> (i32, i32) {
        if self.is_quantized_per_channel {
            if let (Some(m), Some(s)) = (
                self.gemmlowp_multipliers.get(channel),
                self.gemmlowp_shifts.get(channel),
            ) {
                return (*m, *s);
            }
        }
        (self.gemmlowp_multiplier, self.gemmlowp_shift)
    }
}

fn type_range(data_type: DataType) -> (i32, i32) {
    match data_type {
        DataType::QAsymm8 => (0, 255),
        DataType::QAsymm8Signed | DataType::QSymm8 | DataType::QSymm8PerChannel => (-128, 127),
        DataType::QAsymm16 => (0, 65535),
        DataType::QSymm16 => (-32768, 32767),
        _ => (i32::MIN, i32::MAX),
    }
}
