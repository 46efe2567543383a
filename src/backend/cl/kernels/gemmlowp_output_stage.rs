// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! GEMMLowp output stage: `gemmlowp_output_stage_quantize_down*`.
//!
//! Bounds are only emitted when they narrow the output type, and never when
//! `min == max`; the program then saturates to the output type.

use std::sync::Arc;

use super::{cl_type, for_each_vector};
use crate::backend::cl::host::{Defines, HostClRuntime, HostProgram};
use crate::backend::cl::{impl_cl_kernel, BuildOptions, ClKernel, ClRuntime, ClTuning, ConfigId};
use crate::error::KernelError;
use crate::kernel::validate::ensure;
use crate::ops::gemmlowp::validate_output_stage;
use crate::quantization::{get_min_max_values_from_quantized_data_type, multiply_by_quantized_multiplier};
use crate::types::{
    DataType, GemmLowpOutputStageInfo, OutputStageType, QuantizationInfo, Steps, TensorInfo,
    TensorPack, TensorSlot,
};
use crate::window::{calculate_max_window, Window};

const FIXEDPOINT: &str = "gemmlowp_output_stage_quantize_down_fixedpoint";
const FIXEDPOINT_QSYMM16: &str = "gemmlowp_output_stage_quantize_down_fixedpoint_qsymm16";
const INTEGER: &str = "gemmlowp_output_stage_quantize_down";
const FLOAT: &str = "gemmlowp_output_stage_quantize_down_float";

pub struct ClGemmLowpOutputStageKernel {
    kernel: ClKernel,
}

impl ClGemmLowpOutputStageKernel {
    pub fn new(runtime: Arc<dyn ClRuntime>) -> Self {
        Self::with_tuning(runtime, ClTuning::default())
    }

    pub fn with_tuning(runtime: Arc<dyn ClRuntime>, tuning: ClTuning) -> Self {
        Self {
            kernel: ClKernel::new("cl_gemmlowp_output_stage", runtime, tuning),
        }
    }

    pub fn validate(
        src: &TensorInfo,
        bias: Option<&TensorInfo>,
        dst: &TensorInfo,
        info: &GemmLowpOutputStageInfo,
    ) -> Result<(), KernelError> {
        validate_output_stage(src, bias, dst, info)?;
        ensure(
            !info.is_quantized_per_channel,
            "Per-channel requantization is not supported by the device output stage",
        )
    }

    /// Bias, when given, is read from `Src2`.
    pub fn configure(
        &mut self,
        src: &TensorInfo,
        bias: Option<&TensorInfo>,
        dst: &mut TensorInfo,
        info: &GemmLowpOutputStageInfo,
    ) -> Result<(), KernelError> {
        self.kernel.ensure_unconfigured()?;
        Self::validate(src, bias, dst, info)?;
        let data_type = info.output_data_type;
        dst.auto_init_if_empty(*src.shape(), data_type, QuantizationInfo::default());

        let dim0 = src.dimension(0);
        let vec_size = self.kernel.tuning().vec_size(4, dim0);
        let (type_min, type_max) = get_min_max_values_from_quantized_data_type(data_type)?;
        let (min, max) = (info.gemmlowp_min_bound, info.gemmlowp_max_bound);

        let mut opts = BuildOptions::new();
        opts.define("VEC_SIZE", vec_size)
            .define("VEC_SIZE_LEFTOVER", dim0 % vec_size)
            .define("OUTPUT_DATA_TYPE", data_type.cl_type())
            .define_if(min != max && min != type_min, "MIN_BOUND", min)
            .define_if(min != max && max != type_max, "MAX_BOUND", max)
            .flag_if(bias.is_some(), "ADD_BIAS");

        let name = match info.kind {
            OutputStageType::QuantizeDownFixedPoint => {
                opts.define("RESULT_OFFSET_AFTER_SHIFT", info.gemmlowp_offset)
                    .define("RESULT_FIXEDPOINT_MULTIPLIER", info.gemmlowp_multiplier)
                    .define("RESULT_SHIFT", info.gemmlowp_shift);
                if data_type == DataType::QSymm16 {
                    FIXEDPOINT_QSYMM16
                } else {
                    FIXEDPOINT
                }
            }
            OutputStageType::QuantizeDown => {
                opts.define("RESULT_OFFSET", info.gemmlowp_offset)
                    .define("RESULT_MULT_INT", info.gemmlowp_multiplier)
                    .define("RESULT_SHIFT", info.gemmlowp_shift);
                INTEGER
            }
            OutputStageType::QuantizeDownFloat => {
                opts.define("REAL_MULTIPLIER", info.gemmlowp_real_multiplier)
                    .define("OUTPUT_OFFSET", info.gemmlowp_offset);
                FLOAT
            }
            OutputStageType::None => {
                return Err(KernelError::InvalidConfiguration(
                    "Output stage type must be set".to_string(),
                ))
            }
        };

        let config_id = ConfigId::new(name)
            .with(data_type)
            .with(dim0)
            .with(src.dimension(1));
        let window = calculate_max_window(src.shape(), &Steps::new(&[vec_size]));
        self.kernel.build(name, opts, config_id, window, 3)
    }

    pub fn build_options(&self) -> &BuildOptions {
        self.kernel.build_options()
    }

    pub fn config_id(&self) -> &str {
        self.kernel.config_id()
    }
}

impl_cl_kernel!(ClGemmLowpOutputStageKernel);

pub(super) fn register(runtime: &HostClRuntime) {
    let fixed = Arc::new(QuantizeDownProgram(OutputStageType::QuantizeDownFixedPoint));
    runtime.register(FIXEDPOINT, fixed.clone());
    runtime.register(FIXEDPOINT_QSYMM16, fixed);
    runtime.register(INTEGER, Arc::new(QuantizeDownProgram(OutputStageType::QuantizeDown)));
    runtime.register(FLOAT, Arc::new(QuantizeDownProgram(OutputStageType::QuantizeDownFloat)));
}

/// Scaling step of one variant, read from the defines.
enum Scale {
    FixedPoint { multiplier: i32, shift: i32, offset: i32 },
    Integer { multiplier: i32, shift: i32, offset: i32 },
    Float { multiplier: f32, offset: i32 },
}

impl Scale {
    fn from_defines(kind: OutputStageType, defines: &Defines) -> Result<Self, KernelError> {
        Ok(match kind {
            OutputStageType::QuantizeDownFixedPoint => Self::FixedPoint {
                multiplier: defines.get("RESULT_FIXEDPOINT_MULTIPLIER")?,
                shift: defines.get("RESULT_SHIFT")?,
                offset: defines.get("RESULT_OFFSET_AFTER_SHIFT")?,
            },
            OutputStageType::QuantizeDown => Self::Integer {
                multiplier: defines.get("RESULT_MULT_INT")?,
                shift: defines.get("RESULT_SHIFT")?,
                offset: defines.get("RESULT_OFFSET")?,
            },
            _ => Self::Float {
                multiplier: defines.get("REAL_MULTIPLIER")?,
                offset: defines.get("OUTPUT_OFFSET")?,
            },
        })
    }

    #[inline]
    fn apply(&self, acc: i32) -> i32 {
        match *self {
            Self::FixedPoint { multiplier, shift, offset } => {
                multiply_by_quantized_multiplier(acc, multiplier, shift).wrapping_add(offset)
            }
            Self::Integer { multiplier, shift, offset } => {
                acc.wrapping_add(offset).wrapping_mul(multiplier) >> shift
            }
            Self::Float { multiplier, offset } => {
                ((acc as f32 * multiplier).round_ties_even() as i32).wrapping_add(offset)
            }
        }
    }
}

struct QuantizeDownProgram(OutputStageType);

impl HostProgram for QuantizeDownProgram {
    fn required_defines(&self) -> &'static [&'static str] {
        match self.0 {
            OutputStageType::QuantizeDownFixedPoint => &[
                "VEC_SIZE",
                "VEC_SIZE_LEFTOVER",
                "OUTPUT_DATA_TYPE",
                "RESULT_OFFSET_AFTER_SHIFT",
                "RESULT_FIXEDPOINT_MULTIPLIER",
                "RESULT_SHIFT",
            ],
            OutputStageType::QuantizeDown => &[
                "VEC_SIZE",
                "VEC_SIZE_LEFTOVER",
                "OUTPUT_DATA_TYPE",
                "RESULT_OFFSET",
                "RESULT_MULT_INT",
                "RESULT_SHIFT",
            ],
            _ => &[
                "VEC_SIZE",
                "VEC_SIZE_LEFTOVER",
                "OUTPUT_DATA_TYPE",
                "REAL_MULTIPLIER",
                "OUTPUT_OFFSET",
            ],
        }
    }

    fn run(&self, defines: &Defines, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let vec_size: usize = defines.get("VEC_SIZE")?;
        let leftover: usize = defines.get("VEC_SIZE_LEFTOVER")?;
        let out_type = cl_type(defines, "OUTPUT_DATA_TYPE")?;
        let scale = Scale::from_defines(self.0, defines)?;
        let min_bound: i32 = defines.get_or("MIN_BOUND", i32::MIN)?;
        let max_bound: i32 = defines.get_or("MAX_BOUND", i32::MAX)?;

        let src = tensors.get_const(TensorSlot::Src0)?;
        let bias = if defines.has("ADD_BIAS") {
            Some(tensors.get_const(TensorSlot::Src2)?)
        } else {
            None
        };
        let dst = tensors.get_mut(TensorSlot::Dst0)?;

        for_each_vector(window, vec_size, leftover, |mut at, len| {
            let x0 = at[0];
            for x in x0..x0 + len {
                at[0] = x;
                let mut acc = src.get::<i32>(&at);
                if let Some(bias) = &bias {
                    acc = acc.wrapping_add(bias.element::<i32>(x));
                }
                let value = scale.apply(acc).max(min_bound).min(max_bound);
                out_type.store_int_sat(&dst, &at, value);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cl::HostClRuntime;
    use crate::kernel::{run_configured, Kernel};
    use crate::types::{Tensor, TensorShape};

    fn runtime() -> Arc<dyn ClRuntime> {
        Arc::new(HostClRuntime::with_builtin_programs())
    }

    fn configure(shape: &[usize], bias: bool, info: &GemmLowpOutputStageInfo) -> (ClGemmLowpOutputStageKernel, TensorInfo) {
        let src = TensorInfo::new(TensorShape::new(shape), DataType::S32);
        let bias_info = TensorInfo::new(TensorShape::new(&[shape[0]]), DataType::S32);
        let mut dst = TensorInfo::empty();
        let mut kernel = ClGemmLowpOutputStageKernel::new(runtime());
        kernel
            .configure(&src, bias.then_some(&bias_info), &mut dst, info)
            .unwrap();
        (kernel, dst)
    }

    #[test]
    fn test_fixed_point_options() {
        let info = GemmLowpOutputStageInfo::fixed_point(DataType::QAsymm8, 1 << 30, 1, 128).with_bounds(10, 255);
        let (kernel, _) = configure(&[7, 3], true, &info);
        let opts = kernel.build_options();
        assert_eq!(kernel.name(), FIXEDPOINT);
        assert_eq!(opts.get("VEC_SIZE"), Some("4"));
        assert_eq!(opts.get("VEC_SIZE_LEFTOVER"), Some("3"));
        assert_eq!(opts.get("OUTPUT_DATA_TYPE"), Some("uchar"));
        assert_eq!(opts.get("MIN_BOUND"), Some("10"));
        assert!(!opts.has_define("MAX_BOUND"));
        assert!(opts.has_define("ADD_BIAS"));
        assert_eq!(kernel.config_id(), "gemmlowp_output_stage_quantize_down_fixedpoint_qasymm8_7_3");
    }

    #[test]
    fn test_equal_bounds_emit_nothing() {
        let info = GemmLowpOutputStageInfo::fixed_point(DataType::QAsymm8Signed, 1 << 30, 0, 0).with_bounds(5, 5);
        let (kernel, _) = configure(&[16], false, &info);
        assert!(!kernel.build_options().has_define("MIN_BOUND"));
        assert!(!kernel.build_options().has_define("MAX_BOUND"));
    }

    #[test]
    fn test_qsymm16_variant_name() {
        let info = GemmLowpOutputStageInfo::fixed_point(DataType::QSymm16, 1 << 30, 0, 0);
        let (kernel, dst) = configure(&[2], false, &info);
        assert_eq!(kernel.name(), FIXEDPOINT_QSYMM16);
        assert_eq!(dst.data_type(), DataType::QSymm16);
        assert_eq!(kernel.build_options().get("VEC_SIZE"), Some("2"));
    }

    #[test]
    fn test_golden_requantization() {
        let info = GemmLowpOutputStageInfo::fixed_point(DataType::QAsymm8, 1 << 30, 1, 128);
        let (kernel, dst_info) = configure(&[3], true, &info);
        let src_info = TensorInfo::new(TensorShape::new(&[3]), DataType::S32);
        let src = Tensor::from_slice(src_info, &[1000i32, -2000, 500]).unwrap();
        let bias = Tensor::from_slice(TensorInfo::new(TensorShape::new(&[3]), DataType::S32), &[10i32; 3]).unwrap();
        let mut dst = Tensor::new(dst_info);
        let pack = TensorPack::new()
            .with_const(TensorSlot::Src0, src.view())
            .with_const(TensorSlot::Src2, bias.view())
            .with_mut(TensorSlot::Dst0, dst.view_mut());
        run_configured(&kernel, &pack).unwrap();
        drop(pack);
        assert_eq!(dst.to_vec::<u8>(), vec![255, 0, 255]);
    }

    #[test]
    fn test_per_channel_rejected() {
        let src = TensorInfo::new(TensorShape::new(&[2]), DataType::S32);
        let mut info = GemmLowpOutputStageInfo::fixed_point(DataType::QAsymm8, 1 << 30, 1, 0);
        info.is_quantized_per_channel = true;
        info.gemmlowp_multipliers = vec![1 << 30; 2];
        info.gemmlowp_shifts = vec![1; 2];
        let err = ClGemmLowpOutputStageKernel::validate(&src, None, &TensorInfo::empty(), &info).unwrap_err();
        assert!(matches!(err, KernelError::InvalidConfiguration(_)));
    }
}
