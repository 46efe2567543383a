//! Tensor descriptors shared by every kernel.
//!
//! Axis 0 is always the innermost (fastest-varying) dimension. An NCHW
//! tensor is stored as `[W, H, C, N]`, NHWC as `[C, W, H, N]` and NDHWC as
//! `[C, W, H, D, N]`.

mod info;
mod ops;
mod quantization;
mod shape;
mod tensor;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use info::TensorInfo;
pub use ops::{
    ActivationFunction, ActivationLayerInfo, BorderSize, DimensionRoundingType, GemmKernelInfo,
    GemmLhsBlockInfo, GemmLowpOutputStageInfo, GemmRhsBlockInfo, OutputStageType,
    PadStrideInfo, PoolingLayerInfo, PoolingType, Size2D, SoftmaxInfo,
};
pub use quantization::{
    dequantize_qasymm8, dequantize_qasymm8_signed, dequantize_qsymm16, quantize_qasymm8,
    quantize_qasymm8_signed, quantize_qsymm16, QuantizationInfo, UniformQuantizationInfo,
};
pub use shape::{Coordinates, Steps, Strides, TensorShape, MAX_DIMS};
pub use tensor::{
    Element, FloatElement, IntElement, Tensor, TensorPack, TensorSlot, TensorView, TensorViewMut,
};

/// Element data types supported by the kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataType {
    /// Not yet initialised.
    #[default]
    Unknown,
    /// Asymmetric quantized 8-bit unsigned.
    QAsymm8,
    /// Asymmetric quantized 8-bit signed.
    QAsymm8Signed,
    /// Symmetric quantized 8-bit signed.
    QSymm8,
    /// Symmetric quantized 8-bit signed with one scale per output channel.
    QSymm8PerChannel,
    /// Symmetric quantized 16-bit signed.
    QSymm16,
    /// Asymmetric quantized 16-bit unsigned.
    QAsymm16,
    F16,
    F32,
    S32,
}

impl DataType {
    /// Size of one element in bytes (0 for `Unknown`).
    pub fn element_size(self) -> usize {
        match self {
            Self::Unknown => 0,
            Self::QAsymm8 | Self::QAsymm8Signed | Self::QSymm8 | Self::QSymm8PerChannel => 1,
            Self::QSymm16 | Self::QAsymm16 | Self::F16 => 2,
            Self::F32 | Self::S32 => 4,
        }
    }

    pub fn is_quantized(self) -> bool {
        matches!(
            self,
            Self::QAsymm8
                | Self::QAsymm8Signed
                | Self::QSymm8
                | Self::QSymm8PerChannel
                | Self::QSymm16
                | Self::QAsymm16
        )
    }

    pub fn is_quantized_asymmetric(self) -> bool {
        matches!(self, Self::QAsymm8 | Self::QAsymm8Signed | Self::QAsymm16)
    }

    pub fn is_quantized_per_channel(self) -> bool {
        matches!(self, Self::QSymm8PerChannel)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::F32)
    }

    /// OpenCL C type name used in generated kernel source.
    pub fn cl_type(self) -> &'static str {
        match self {
            Self::QAsymm8 => "uchar",
            Self::QAsymm8Signed | Self::QSymm8 | Self::QSymm8PerChannel => "char",
            Self::QSymm16 => "short",
            Self::QAsymm16 => "ushort",
            Self::F16 => "half",
            Self::F32 => "float",
            Self::S32 => "int",
            Self::Unknown => "",
        }
    }

    /// Accumulator type for 8-bit dot products on the device.
    pub fn cl_dot8_acc_type(self) -> &'static str {
        match self {
            Self::QAsymm8 => "uint",
            Self::QAsymm8Signed | Self::QSymm8 | Self::QSymm8PerChannel => "int",
            _ => "",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "UNKNOWN",
            Self::QAsymm8 => "QASYMM8",
            Self::QAsymm8Signed => "QASYMM8_SIGNED",
            Self::QSymm8 => "QSYMM8",
            Self::QSymm8PerChannel => "QSYMM8_PER_CHANNEL",
            Self::QSymm16 => "QSYMM16",
            Self::QAsymm16 => "QASYMM16",
            Self::F16 => "F16",
            Self::F32 => "F32",
            Self::S32 => "S32",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for DataType {
    type Err = String;

    /// Accepts the display names, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QASYMM8" => Ok(Self::QAsymm8),
            "QASYMM8_SIGNED" => Ok(Self::QAsymm8Signed),
            "QSYMM8" => Ok(Self::QSymm8),
            "QSYMM8_PER_CHANNEL" => Ok(Self::QSymm8PerChannel),
            "QSYMM16" => Ok(Self::QSymm16),
            "QASYMM16" => Ok(Self::QAsymm16),
            "F16" => Ok(Self::F16),
            "F32" => Ok(Self::F32),
            "S32" => Ok(Self::S32),
            other => Err(format!("unknown data type: {other}")),
        }
    }
}

/// Memory ordering of a 4D or 5D tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataLayout {
    /// Layout-free tensors (vectors, matrices).
    #[default]
    Unknown,
    Nchw,
    Nhwc,
    Ndhwc,
}

/// Logical dimensions that can be looked up in a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataLayoutDimension {
    Width,
    Height,
    Channel,
    Batch,
    Depth,
}

impl DataLayout {
    /// Physical axis holding `dim`, or `None` when the layout has no such axis.
    pub fn dimension_index(self, dim: DataLayoutDimension) -> Option<usize> {
        use DataLayoutDimension::*;
        match (self, dim) {
            (Self::Nchw | Self::Unknown, Width) => Some(0),
            (Self::Nchw | Self::Unknown, Height) => Some(1),
            (Self::Nchw | Self::Unknown, Channel) => Some(2),
            (Self::Nchw | Self::Unknown, Batch) => Some(3),
            (Self::Nhwc | Self::Ndhwc, Channel) => Some(0),
            (Self::Nhwc | Self::Ndhwc, Width) => Some(1),
            (Self::Nhwc | Self::Ndhwc, Height) => Some(2),
            (Self::Nhwc, Batch) => Some(3),
            (Self::Ndhwc, Depth) => Some(3),
            (Self::Ndhwc, Batch) => Some(4),
            (_, Depth) => None,
        }
    }

    pub fn width_index(self) -> usize {
        self.dimension_index(DataLayoutDimension::Width).unwrap_or(0)
    }

    pub fn height_index(self) -> usize {
        self.dimension_index(DataLayoutDimension::Height).unwrap_or(1)
    }

    pub fn channel_index(self) -> usize {
        self.dimension_index(DataLayoutDimension::Channel).unwrap_or(2)
    }

    pub fn batch_index(self) -> usize {
        self.dimension_index(DataLayoutDimension::Batch).unwrap_or(3)
    }

    /// Lower-case suffix used in device kernel names.
    pub fn kernel_suffix(self) -> &'static str {
        match self {
            Self::Nchw | Self::Unknown => "nchw",
            Self::Nhwc => "nhwc",
            Self::Ndhwc => "ndhwc",
        }
    }
}

impl fmt::Display for DataLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "UNKNOWN",
            Self::Nchw => "NCHW",
            Self::Nhwc => "NHWC",
            Self::Ndhwc => "NDHWC",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(DataType::QAsymm8.element_size(), 1);
        assert_eq!(DataType::QSymm16.element_size(), 2);
        assert_eq!(DataType::F16.element_size(), 2);
        assert_eq!(DataType::S32.element_size(), 4);
        assert_eq!(DataType::Unknown.element_size(), 0);
    }

    #[test]
    fn test_quantized_classification() {
        assert!(DataType::QAsymm8Signed.is_quantized_asymmetric());
        assert!(!DataType::QSymm8.is_quantized_asymmetric());
        assert!(DataType::QSymm8PerChannel.is_quantized_per_channel());
        assert!(!DataType::S32.is_quantized());
        assert!(DataType::F16.is_float());
    }

    #[test]
    fn test_data_type_parses_display_names() {
        for dt in [DataType::QAsymm8Signed, DataType::QSymm16, DataType::F32] {
            assert_eq!(dt.to_string().parse::<DataType>(), Ok(dt));
        }
        assert_eq!("qasymm8".parse::<DataType>(), Ok(DataType::QAsymm8));
        assert!("u8".parse::<DataType>().is_err());
    }

    #[test]
    fn test_layout_indices() {
        assert_eq!(DataLayout::Nchw.width_index(), 0);
        assert_eq!(DataLayout::Nchw.channel_index(), 2);
        assert_eq!(DataLayout::Nhwc.channel_index(), 0);
        assert_eq!(DataLayout::Nhwc.height_index(), 2);
        assert_eq!(
            DataLayout::Ndhwc.dimension_index(DataLayoutDimension::Depth),
            Some(3)
        );
        assert_eq!(DataLayout::Nhwc.dimension_index(DataLayoutDimension::Depth), None);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(DataType::QAsymm8Signed.to_string(), "QASYMM8_SIGNED");
        assert_eq!(DataLayout::Nhwc.to_string(), "NHWC");
    }
}
