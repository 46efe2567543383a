// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! OpenCL kernels and the host programs that execute them in-process.
//!
//! Each module pairs a kernel (validate, option selection, configure) with
//! the host programs registered under the kernel names it can select.

pub mod depthwise;
pub mod direct_conv;
pub mod gemm;
pub mod gemmlowp_mm;
pub mod gemmlowp_output_stage;
pub mod pool2d;
pub mod softmax;

pub use depthwise::ClDepthwiseConv2dKernel;
pub use direct_conv::ClDirectConv2dKernel;
pub use gemm::ClGemmMatrixMultiplyNativeKernel;
pub use gemmlowp_mm::ClGemmLowpMatrixMultiplyNativeKernel;
pub use gemmlowp_output_stage::ClGemmLowpOutputStageKernel;
pub use pool2d::ClPool2dKernel;
pub use softmax::{ClLogits1DMaxShiftExpSumKernel, ClLogits1DNormKernel};

use std::str::FromStr;

use half::f16;

use super::host::{Defines, HostClRuntime};
use super::options::BuildOptions;
use crate::error::KernelError;
use crate::types::{
    quantize_qasymm8, quantize_qasymm8_signed, ActivationFunction, ActivationLayerInfo,
    Coordinates, DataType, TensorView, TensorViewMut, UniformQuantizationInfo,
};
use crate::window::{leftover_first_span, Window};

/// Register every built-in host program with `runtime`.
pub fn register_host_programs(runtime: &HostClRuntime) {
    gemmlowp_output_stage::register(runtime);
    gemmlowp_mm::register(runtime);
    gemm::register(runtime);
    direct_conv::register(runtime);
    depthwise::register(runtime);
    pool2d::register(runtime);
    softmax::register(runtime);
}

/// OpenCL C scalar type named by a `*DATA_TYPE` define.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClType {
    Uchar,
    Char,
    Short,
    Ushort,
    Int,
    Half,
    Float,
}

impl FromStr for ClType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uchar" => Ok(Self::Uchar),
            "char" => Ok(Self::Char),
            "short" => Ok(Self::Short),
            "ushort" => Ok(Self::Ushort),
            "int" => Ok(Self::Int),
            "half" => Ok(Self::Half),
            "float" => Ok(Self::Float),
            _ => Err(()),
        }
    }
}

impl ClType {
    /// Representable range, used by `CONVERT_SAT`.
    pub(crate) fn range(self) -> (i32, i32) {
        match self {
            Self::Uchar => (u8::MIN as i32, u8::MAX as i32),
            Self::Char => (i8::MIN as i32, i8::MAX as i32),
            Self::Short => (i16::MIN as i32, i16::MAX as i32),
            Self::Ushort => (u16::MIN as i32, u16::MAX as i32),
            _ => (i32::MIN, i32::MAX),
        }
    }

    #[inline]
    pub(crate) fn load_int(self, view: &TensorView<'_>, at: &Coordinates) -> i32 {
        match self {
            Self::Uchar => view.get::<u8>(at) as i32,
            Self::Char => view.get::<i8>(at) as i32,
            Self::Short => view.get::<i16>(at) as i32,
            Self::Ushort => view.get::<u16>(at) as i32,
            Self::Int => view.get::<i32>(at),
            Self::Half => view.get::<f16>(at).to_f32() as i32,
            Self::Float => view.get::<f32>(at) as i32,
        }
    }

    #[inline]
    pub(crate) fn load_float(self, view: &TensorView<'_>, at: &Coordinates) -> f32 {
        match self {
            Self::Half => view.get::<f16>(at).to_f32(),
            Self::Float => view.get::<f32>(at),
            _ => self.load_int(view, at) as f32,
        }
    }

    /// `CONVERT_SAT` store of an integer value.
    #[inline]
    pub(crate) fn store_int_sat(self, dst: &TensorViewMut<'_>, at: &Coordinates, value: i32) {
        let (lo, hi) = self.range();
        let v = value.clamp(lo, hi);
        match self {
            Self::Uchar => dst.set(at, v as u8),
            Self::Char => dst.set(at, v as i8),
            Self::Short => dst.set(at, v as i16),
            Self::Ushort => dst.set(at, v as u16),
            Self::Int => dst.set(at, v),
            Self::Half => dst.set(at, f16::from_f32(v as f32)),
            Self::Float => dst.set(at, v as f32),
        }
    }

    #[inline]
    pub(crate) fn store_float(self, dst: &TensorViewMut<'_>, at: &Coordinates, value: f32) {
        match self {
            Self::Half => dst.set(at, f16::from_f32(value)),
            Self::Float => dst.set(at, value),
            _ => self.store_int_sat(dst, at, value as i32),
        }
    }
}

pub(crate) fn cl_type(defines: &Defines, name: &str) -> Result<ClType, KernelError> {
    let raw: String = defines.get(name)?;
    raw.parse()
        .map_err(|_| KernelError::Enqueue(format!("{name}={raw} is not a supported type")))
}

/// Visit every vector work item of `window` along x, leftover-first.
///
/// `f` receives the coordinates of the first element and the element count.
pub(crate) fn for_each_vector(
    window: &Window,
    vec_size: usize,
    leftover: usize,
    mut f: impl FnMut(Coordinates, usize),
) {
    for block in window.blocks() {
        let (x, len) = leftover_first_span(block.start[0] / vec_size.max(1), vec_size, leftover);
        let mut rows = block;
        rows.len[0] = 1;
        rows.for_each_element(|at| {
            let mut at = *at;
            at[0] = x;
            f(at, len);
        });
    }
}

/// Device name of a fused activation.
pub(crate) fn activation_name(function: ActivationFunction) -> &'static str {
    match function {
        ActivationFunction::Identity => "identity",
        ActivationFunction::Relu => "relu",
        ActivationFunction::BoundedRelu => "brelu",
        ActivationFunction::LuBoundedRelu => "lu_brelu",
    }
}

/// `ACTIVATION_TYPE`, `A_VAL`, `B_VAL` for a float kernel.
pub(crate) fn add_activation_options(opts: &mut BuildOptions, act: &ActivationLayerInfo) {
    if act.enabled {
        opts.define("ACTIVATION_TYPE", activation_name(act.function))
            .define("A_VAL", act.a)
            .define("B_VAL", act.b);
    }
}

/// Activation options of a quantized kernel; `A_VAL`/`B_VAL` are quantized
/// with the destination quantization.
pub(crate) fn add_quantized_activation_options(
    opts: &mut BuildOptions,
    act: &ActivationLayerInfo,
    data_type: DataType,
    oq: &UniformQuantizationInfo,
) {
    if !act.enabled {
        return;
    }
    let quantize = |v: f32| -> i32 {
        if data_type == DataType::QAsymm8Signed {
            quantize_qasymm8_signed(v, oq) as i32
        } else {
            quantize_qasymm8(v, oq) as i32
        }
    };
    opts.define("ACTIVATION_TYPE", activation_name(act.function))
        .define("A_VAL", quantize(act.a))
        .define("B_VAL", quantize(act.b));
}

/// Float activation described by the defines; identity when absent.
pub(crate) fn float_activation(defines: &Defines) -> Result<ActivationLayerInfo, KernelError> {
    if !defines.has("ACTIVATION_TYPE") {
        return Ok(ActivationLayerInfo::disabled());
    }
    let function = activation_function(defines)?;
    Ok(ActivationLayerInfo::new(
        function,
        defines.get("A_VAL")?,
        defines.get("B_VAL")?,
    ))
}

fn activation_function(defines: &Defines) -> Result<ActivationFunction, KernelError> {
    let name: String = defines.get("ACTIVATION_TYPE")?;
    match name.as_str() {
        "identity" => Ok(ActivationFunction::Identity),
        "relu" => Ok(ActivationFunction::Relu),
        "brelu" => Ok(ActivationFunction::BoundedRelu),
        "lu_brelu" => Ok(ActivationFunction::LuBoundedRelu),
        other => Err(KernelError::Enqueue(format!("unknown activation {other}"))),
    }
}

/// Clamp range of a quantized activation with destination zero point `offset`,
/// narrowed to the range of `ty`.
pub(crate) fn quantized_activation_bounds(
    defines: &Defines,
    ty: ClType,
    offset: i32,
) -> Result<(i32, i32), KernelError> {
    let (type_min, type_max) = ty.range();
    if !defines.has("ACTIVATION_TYPE") {
        return Ok((type_min, type_max));
    }
    let (min, max) = match activation_function(defines)? {
        ActivationFunction::Identity => (type_min, type_max),
        ActivationFunction::Relu => (offset, type_max),
        ActivationFunction::BoundedRelu => (offset, defines.get("A_VAL")?),
        ActivationFunction::LuBoundedRelu => (defines.get("B_VAL")?, defines.get("A_VAL")?),
    };
    Ok((min.max(type_min), max.min(type_max)))
}
