//! Tensor metadata descriptor.

use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::quantization::get_min_max_values_from_quantized_data_type;

use super::quantization::QuantizationInfo;
use super::shape::{Coordinates, Strides, TensorShape, MAX_DIMS};
use super::{DataLayout, DataType};

/// Shape, element type, layout and quantization of a tensor.
///
/// A descriptor with `total_size() == 0` is "not yet initialised"; kernels
/// fill it in once during configure through [`TensorInfo::auto_init_if_empty`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TensorInfo {
    shape: TensorShape,
    data_type: DataType,
    data_layout: DataLayout,
    quantization_info: QuantizationInfo,
    is_resizable: bool,
}

impl TensorInfo {
    pub fn new(shape: TensorShape, data_type: DataType) -> Self {
        Self {
            shape,
            data_type,
            data_layout: DataLayout::Nchw,
            quantization_info: QuantizationInfo::default(),
            is_resizable: true,
        }
    }

    /// Descriptor for a destination the kernel should initialise.
    pub fn empty() -> Self {
        Self {
            is_resizable: true,
            ..Self::default()
        }
    }

    pub fn with_layout(mut self, layout: DataLayout) -> Self {
        self.data_layout = layout;
        self
    }

    pub fn with_quantization(mut self, qinfo: QuantizationInfo) -> Self {
        self.quantization_info = qinfo;
        self
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn dimension(&self, axis: usize) -> usize {
        self.shape.dim(axis)
    }

    pub fn num_dimensions(&self) -> usize {
        self.shape.num_dimensions()
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn data_layout(&self) -> DataLayout {
        self.data_layout
    }

    pub fn quantization_info(&self) -> &QuantizationInfo {
        &self.quantization_info
    }

    pub fn element_size(&self) -> usize {
        self.data_type.element_size()
    }

    pub fn is_resizable(&self) -> bool {
        self.is_resizable
    }

    /// Size in bytes; 0 means the descriptor is not initialised.
    pub fn total_size(&self) -> usize {
        self.shape.total_size() * self.element_size()
    }

    /// Contiguous byte strides derived from shape and element size.
    pub fn strides_in_bytes(&self) -> Strides {
        let mut strides = [0; MAX_DIMS];
        let mut stride = self.element_size();
        for (axis, slot) in strides.iter_mut().enumerate() {
            *slot = stride;
            stride *= self.shape.dim(axis).max(1);
        }
        strides
    }

    /// Byte offset of the element at `coords`.
    pub fn offset_of(&self, coords: &Coordinates) -> usize {
        let strides = self.strides_in_bytes();
        coords.iter().zip(strides.iter()).map(|(c, s)| c * s).sum()
    }

    pub fn set_shape(&mut self, shape: TensorShape) -> &mut Self {
        self.shape = shape;
        self
    }

    pub fn set_data_type(&mut self, data_type: DataType) -> &mut Self {
        self.data_type = data_type;
        self
    }

    pub fn set_data_layout(&mut self, layout: DataLayout) -> &mut Self {
        self.data_layout = layout;
        self
    }

    pub fn set_quantization_info(&mut self, qinfo: QuantizationInfo) -> &mut Self {
        self.quantization_info = qinfo;
        self
    }

    pub fn set_is_resizable(&mut self, resizable: bool) -> &mut Self {
        self.is_resizable = resizable;
        self
    }

    /// Initialise the descriptor if it is empty. Returns whether it changed.
    pub fn auto_init_if_empty(
        &mut self,
        shape: TensorShape,
        data_type: DataType,
        qinfo: QuantizationInfo,
    ) -> bool {
        if self.total_size() != 0 {
            return false;
        }
        self.shape = shape;
        self.data_type = data_type;
        if self.quantization_info.is_empty() {
            self.quantization_info = qinfo;
        }
        true
    }

    /// Like [`auto_init_if_empty`](Self::auto_init_if_empty) but copies the
    /// layout from `reference` as well.
    pub fn auto_init_from(&mut self, reference: &TensorInfo, shape: TensorShape, data_type: DataType) -> bool {
        let layout = reference.data_layout();
        let changed = self.auto_init_if_empty(shape, data_type, reference.quantization_info().clone());
        if changed {
            self.data_layout = layout;
        }
        changed
    }

    /// Scales must be finite and positive and the offset must fit the
    /// element type. Non-quantized descriptors always pass.
    pub fn validate_quantization(&self) -> Result<(), KernelError> {
        if !self.data_type.is_quantized() {
            return Ok(());
        }
        if !self.quantization_info.has_valid_scales() {
            return Err(KernelError::InvalidArgument(format!(
                "scales {:?} must be finite and positive",
                self.quantization_info.scales()
            )));
        }
        let (min, max) = get_min_max_values_from_quantized_data_type(self.data_type)?;
        let offset = self.quantization_info.offset();
        if offset < min || offset > max {
            return Err(KernelError::InvalidArgument(format!(
                "offset {offset} does not fit {} [{min}, {max}]",
                self.data_type
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides_are_contiguous() {
        let info = TensorInfo::new(TensorShape::new(&[4, 3, 2]), DataType::S32);
        let strides = info.strides_in_bytes();
        assert_eq!(&strides[..3], &[4, 16, 48]);
        assert_eq!(info.total_size(), 96);
        assert_eq!(info.offset_of(&[1, 2, 1, 0, 0, 0]), 4 + 32 + 48);
    }

    #[test]
    fn test_auto_init_only_when_empty() {
        let mut dst = TensorInfo::empty();
        assert_eq!(dst.total_size(), 0);
        assert!(dst.auto_init_if_empty(
            TensorShape::new(&[8]),
            DataType::QAsymm8,
            QuantizationInfo::new(0.5, 3)
        ));
        assert_eq!(dst.total_size(), 8);
        assert!(!dst.auto_init_if_empty(
            TensorShape::new(&[16]),
            DataType::S32,
            QuantizationInfo::default()
        ));
        assert_eq!(dst.dimension(0), 8);
        assert_eq!(dst.quantization_info().offset(), 3);
    }

    #[test]
    fn test_auto_init_keeps_existing_quantization() {
        let mut dst = TensorInfo::empty().with_quantization(QuantizationInfo::new(0.25, 1));
        dst.auto_init_if_empty(TensorShape::new(&[2]), DataType::QAsymm8, QuantizationInfo::new(1.0, 0));
        assert_eq!(dst.quantization_info().uniform().scale, 0.25);
    }

    #[test]
    fn test_validate_quantization() {
        let base = TensorInfo::new(TensorShape::new(&[4]), DataType::QAsymm8);
        assert!(base.clone().with_quantization(QuantizationInfo::new(0.5, 255)).validate_quantization().is_ok());
        assert!(base.clone().with_quantization(QuantizationInfo::new(0.5, 256)).validate_quantization().is_err());
        assert!(base.clone().with_quantization(QuantizationInfo::new(-0.5, 0)).validate_quantization().is_err());
        assert!(base.with_quantization(QuantizationInfo::new(f64::NAN, 0)).validate_quantization().is_err());

        let signed = TensorInfo::new(TensorShape::new(&[4]), DataType::QAsymm8Signed)
            .with_quantization(QuantizationInfo::new(0.1, -128));
        assert!(signed.validate_quantization().is_ok());
        let float = TensorInfo::new(TensorShape::new(&[4]), DataType::F32).with_quantization(QuantizationInfo::new(-1.0, 999));
        assert!(float.validate_quantization().is_ok());
    }
}
