//! Affine quantization parameters: `real = scale * (q - offset)`.

use serde::{Deserialize, Serialize};

/// Quantization parameters attached to a tensor.
///
/// Holds one scale for per-tensor quantization or one scale per output
/// channel for per-channel weights. An empty scale list means the tensor is
/// not quantized.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuantizationInfo {
    scales: Vec<f64>,
    offset: i32,
}

/// Per-tensor projection of a [`QuantizationInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UniformQuantizationInfo {
    pub scale: f64,
    pub offset: i32,
}

impl QuantizationInfo {
    pub fn new(scale: f64, offset: i32) -> Self {
        Self {
            scales: vec![scale],
            offset,
        }
    }

    pub fn per_channel(scales: Vec<f64>, offset: i32) -> Self {
        Self { scales, offset }
    }

    pub fn is_empty(&self) -> bool {
        self.scales.is_empty()
    }

    pub fn scales(&self) -> &[f64] {
        &self.scales
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }

    pub fn is_per_channel(&self) -> bool {
        self.scales.len() > 1
    }

    /// First scale and the offset; `(0.0, offset)` when no scale is set.
    pub fn uniform(&self) -> UniformQuantizationInfo {
        UniformQuantizationInfo {
            scale: self.scales.first().copied().unwrap_or(0.0),
            offset: self.offset,
        }
    }

    /// True when every scale is finite and strictly positive.
    pub fn has_valid_scales(&self) -> bool {
        self.scales.iter().all(|s| s.is_finite() && *s > 0.0)
    }
}

impl From<UniformQuantizationInfo> for QuantizationInfo {
    fn from(q: UniformQuantizationInfo) -> Self {
        Self::new(q.scale, q.offset)
    }
}

fn quantize_to_i32(value: f32, qinfo: &UniformQuantizationInfo) -> i32 {
    let scaled = (value as f64 / qinfo.scale).round();
    (scaled as i64)
        .saturating_add(qinfo.offset as i64)
        .clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Quantize to QASYMM8, rounding half away from zero.
pub fn quantize_qasymm8(value: f32, qinfo: &UniformQuantizationInfo) -> u8 {
    quantize_to_i32(value, qinfo).clamp(0, 255) as u8
}

/// Quantize to QASYMM8_SIGNED, rounding half away from zero.
pub fn quantize_qasymm8_signed(value: f32, qinfo: &UniformQuantizationInfo) -> i8 {
    quantize_to_i32(value, qinfo).clamp(-128, 127) as i8
}

/// Quantize to QSYMM16 (offset ignored).
pub fn quantize_qsymm16(value: f32, qinfo: &UniformQuantizationInfo) -> i16 {
    let symmetric = UniformQuantizationInfo {
        scale: qinfo.scale,
        offset: 0,
    };
    quantize_to_i32(value, &symmetric).clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

pub fn dequantize_qasymm8(value: u8, qinfo: &UniformQuantizationInfo) -> f32 {
    ((value as i32 - qinfo.offset) as f64 * qinfo.scale) as f32
}

pub fn dequantize_qasymm8_signed(value: i8, qinfo: &UniformQuantizationInfo) -> f32 {
    ((value as i32 - qinfo.offset) as f64 * qinfo.scale) as f32
}

pub fn dequantize_qsymm16(value: i16, qinfo: &UniformQuantizationInfo) -> f32 {
    (value as f64 * qinfo.scale) as f32
}
