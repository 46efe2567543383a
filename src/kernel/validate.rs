//! Common descriptor checks used by kernel `validate` functions.
//!
//! Every helper returns the first violated check as an error with a message
//! naming the failing condition.

use crate::error::KernelError;
use crate::types::{DataType, TensorInfo, TensorShape};

/// Fail with `msg` unless `condition` holds.
#[inline]
pub fn ensure(condition: bool, msg: impl Into<String>) -> Result<(), KernelError> {
    if condition {
        Ok(())
    } else {
        Err(KernelError::InvalidConfiguration(msg.into()))
    }
}

/// The tensor must hold data (non-zero total size).
pub fn check_initialized(info: &TensorInfo, what: &str) -> Result<(), KernelError> {
    ensure(info.total_size() != 0, format!("{what} tensor is not initialised"))
}

pub fn check_data_type_in(info: &TensorInfo, allowed: &[DataType], what: &str) -> Result<(), KernelError> {
    let data_type = info.data_type();
    if allowed.contains(&data_type) {
        return Ok(());
    }
    let names: Vec<String> = allowed.iter().map(|d| d.to_string()).collect();
    Err(KernelError::UnsupportedDataType {
        data_type,
        context: format!("{what} must be one of [{}]", names.join(", ")),
    })
}

pub fn check_mismatching_data_types(a: &TensorInfo, b: &TensorInfo, what: &str) -> Result<(), KernelError> {
    if a.data_type() != b.data_type() {
        return Err(KernelError::MismatchingDataTypes(format!(
            "{what}: {} vs {}",
            a.data_type(),
            b.data_type()
        )));
    }
    Ok(())
}

pub fn check_mismatching_shapes(a: &TensorShape, b: &TensorShape, what: &str) -> Result<(), KernelError> {
    if a != b {
        return Err(KernelError::MismatchingShapes(format!("{what}: {a} vs {b}")));
    }
    Ok(())
}

pub fn check_mismatching_layouts(a: &TensorInfo, b: &TensorInfo, what: &str) -> Result<(), KernelError> {
    ensure(
        a.data_layout() == b.data_layout(),
        format!("{what}: data layouts {} and {} differ", a.data_layout(), b.data_layout()),
    )
}

pub fn check_mismatching_quantization(a: &TensorInfo, b: &TensorInfo, what: &str) -> Result<(), KernelError> {
    if a.quantization_info() != b.quantization_info() {
        return Err(KernelError::MismatchingQuantization(what.to_string()));
    }
    Ok(())
}

pub fn check_max_dimensions(info: &TensorInfo, max: usize, what: &str) -> Result<(), KernelError> {
    ensure(
        info.num_dimensions() <= max,
        format!("{what} can be at most {max} dimensional"),
    )
}

/// If `dst` is already initialised it must match the computed shape and type.
///
/// An uninitialised destination is accepted; configure will fill it in.
pub fn check_destination(
    dst: &TensorInfo,
    expected_shape: &TensorShape,
    expected_type: DataType,
) -> Result<(), KernelError> {
    if dst.total_size() == 0 {
        return Ok(());
    }
    if dst.data_type() != expected_type {
        return Err(KernelError::MismatchingDataTypes(format!(
            "Mismatching output data type: expected {expected_type}, got {}",
            dst.data_type()
        )));
    }
    check_mismatching_shapes(dst.shape(), expected_shape, "output shape does not match computed shape")
}

/// Quantized tensors must carry a valid scale and an in-range offset.
pub fn check_quantization_scales(info: &TensorInfo, what: &str) -> Result<(), KernelError> {
    if !info.data_type().is_quantized() {
        return Ok(());
    }
    ensure(
        !info.quantization_info().is_empty(),
        format!("{what} carries no quantization scale"),
    )?;
    info.validate_quantization()
        .map_err(|e| KernelError::InvalidConfiguration(format!("{what} quantization: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QuantizationInfo;

    fn info(shape: &[usize], dt: DataType) -> TensorInfo {
        TensorInfo::new(TensorShape::new(shape), dt)
    }

    #[test]
    fn test_data_type_message_lists_allowed_set() {
        let err = check_data_type_in(&info(&[4], DataType::F16), &[DataType::S32], "src").unwrap_err();
        assert_eq!(err.to_string(), "Unsupported data type F16: src must be one of [S32]");
    }

    #[test]
    fn test_destination_checks() {
        let expected = TensorShape::new(&[4, 2]);
        assert!(check_destination(&TensorInfo::empty(), &expected, DataType::QAsymm8).is_ok());
        assert!(check_destination(&info(&[4, 2], DataType::QAsymm8), &expected, DataType::QAsymm8).is_ok());
        let err = check_destination(&info(&[4, 2], DataType::S32), &expected, DataType::QAsymm8).unwrap_err();
        assert!(err.to_string().contains("Mismatching output data type"));
        assert!(matches!(
            check_destination(&info(&[4, 3], DataType::QAsymm8), &expected, DataType::QAsymm8),
            Err(KernelError::MismatchingShapes(_))
        ));
    }

    #[test]
    fn test_quantization_scale_check() {
        let good = info(&[2], DataType::QAsymm8).with_quantization(QuantizationInfo::new(0.5, 0));
        assert!(check_quantization_scales(&good, "src").is_ok());
        let missing = info(&[2], DataType::QAsymm8);
        assert!(check_quantization_scales(&missing, "src").is_err());
        assert!(check_quantization_scales(&info(&[2], DataType::F32), "src").is_ok());
    }
}
