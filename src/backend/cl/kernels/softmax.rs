// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Two-stage softmax on the device.
//!
//! Stage one (`softmax_layer_max_shift_exp_sum_*`) writes the row maximum,
//! the shifted exponentials into an `F32` temporary and the row sums. Long
//! rows use the parallel variant where `GRID_SIZE` work items each find the
//! maximum of a strided share of the row. The sum is accumulated in index
//! order on both variants, so the choice never changes the result.
//!
//! Stage two (`softmax_layer_norm*`) divides by the sum, or subtracts its
//! logarithm for log-softmax, and quantizes with scale 1/256.

use std::sync::Arc;

use super::{cl_type, for_each_vector};
use crate::backend::cl::host::{Defines, HostClRuntime, HostProgram};
use crate::backend::cl::{impl_cl_kernel, BuildOptions, ClKernel, ClRuntime, ClTuning, ConfigId};
use crate::error::KernelError;
use crate::kernel::validate::{check_data_type_in, check_mismatching_shapes, ensure};
use crate::ops::softmax::{softmax_output_quantization, validate_softmax, SoftmaxParams, SoftmaxTuning, SOFTMAX_TYPES};
use crate::types::{DataType, SoftmaxInfo, Steps, TensorInfo, TensorPack, TensorShape, TensorSlot};
use crate::window::{calculate_max_window, Window};

const MAX_SHIFT_EXP_SUM_SERIAL: &str = "softmax_layer_max_shift_exp_sum_serial";
const MAX_SHIFT_EXP_SUM_PARALLEL: &str = "softmax_layer_max_shift_exp_sum_parallel";
const MAX_SHIFT_EXP_SUM_QUANTIZED_SERIAL: &str = "softmax_layer_max_shift_exp_sum_quantized_serial";
const MAX_SHIFT_EXP_SUM_QUANTIZED_PARALLEL: &str = "softmax_layer_max_shift_exp_sum_quantized_parallel";
const NORM: &str = "softmax_layer_norm";
const NORM_QUANTIZED: &str = "softmax_layer_norm_quantized";

/// Shape of the per-row max and sum tensors.
fn reduced_shape(shape: &TensorShape) -> TensorShape {
    let mut reduced = *shape;
    reduced.set(0, 1);
    reduced
}

fn check_if_initialized(info: &TensorInfo, shape: &TensorShape, data_type: DataType, what: &str) -> Result<(), KernelError> {
    if info.total_size() == 0 {
        return Ok(());
    }
    check_data_type_in(info, &[data_type], what)?;
    check_mismatching_shapes(info.shape(), shape, what)
}

/// Max, shift, exponentiate and sum.
///
/// `Src0` is the source, `Workspace` receives the row maxima, `Dst0` the
/// `F32` temporary and `Dst1` the row sums.
pub struct ClLogits1DMaxShiftExpSumKernel {
    kernel: ClKernel,
    softmax_tuning: SoftmaxTuning,
}

impl ClLogits1DMaxShiftExpSumKernel {
    pub fn new(runtime: Arc<dyn ClRuntime>) -> Self {
        Self::with_tuning(runtime, ClTuning::default())
    }

    pub fn with_tuning(runtime: Arc<dyn ClRuntime>, tuning: ClTuning) -> Self {
        Self {
            kernel: ClKernel::new("cl_softmax_max_shift_exp_sum", runtime, tuning),
            softmax_tuning: SoftmaxTuning::default(),
        }
    }

    pub fn with_softmax_tuning(mut self, tuning: SoftmaxTuning) -> Self {
        self.softmax_tuning = tuning;
        self
    }

    pub fn validate(
        src: &TensorInfo,
        max: &TensorInfo,
        tmp: &TensorInfo,
        sum: &TensorInfo,
        info: &SoftmaxInfo,
    ) -> Result<(), KernelError> {
        validate_softmax(src, &TensorInfo::empty(), info)?;
        let reduced = reduced_shape(src.shape());
        check_if_initialized(max, &reduced, src.data_type(), "max")?;
        check_if_initialized(tmp, src.shape(), DataType::F32, "tmp")?;
        check_if_initialized(sum, &reduced, DataType::F32, "sum")
    }

    pub fn configure(
        &mut self,
        src: &TensorInfo,
        max: &mut TensorInfo,
        tmp: &mut TensorInfo,
        sum: &mut TensorInfo,
        info: &SoftmaxInfo,
    ) -> Result<(), KernelError> {
        self.kernel.ensure_unconfigured()?;
        Self::validate(src, max, tmp, sum, info)?;
        let data_type = src.data_type();
        let reduced = reduced_shape(src.shape());
        max.auto_init_if_empty(reduced, data_type, src.quantization_info().clone());
        tmp.auto_init_if_empty(*src.shape(), DataType::F32, Default::default());
        sum.auto_init_if_empty(reduced, DataType::F32, Default::default());

        let row_len = src.dimension(0);
        let params = SoftmaxParams::new(src, info);
        let parallel = self.softmax_tuning.is_parallel(row_len);
        let vec = self.kernel.tuning().vec_size(self.softmax_tuning.vector_size(row_len), row_len);
        let name = match (params.quantized, parallel) {
            (false, false) => MAX_SHIFT_EXP_SUM_SERIAL,
            (false, true) => MAX_SHIFT_EXP_SUM_PARALLEL,
            (true, false) => MAX_SHIFT_EXP_SUM_QUANTIZED_SERIAL,
            (true, true) => MAX_SHIFT_EXP_SUM_QUANTIZED_PARALLEL,
        };

        let mut opts = BuildOptions::new();
        opts.define("DATA_TYPE", data_type.cl_type())
            .define("SRC_WIDTH", row_len)
            .define("VECTOR_SIZE", vec)
            .define("VECTOR_SIZE_LEFTOVER", row_len % vec)
            .define_if(params.scaled_beta != 1.0, "BETA", params.scaled_beta)
            .flag_if(params.is_log, "LOG_SOFTMAX")
            .flag_if(params.quantized, "IS_QUANTIZED")
            .define_if(parallel, "GRID_SIZE", self.softmax_tuning.grid_size);

        let config_id = ConfigId::new(name)
            .with(data_type)
            .with(row_len)
            .with(src.dimension(1));
        let window = calculate_max_window(src.shape(), &Steps::new(&[row_len.max(1)]));
        self.kernel.build(name, opts, config_id, window, 3)
    }

    pub fn build_options(&self) -> &BuildOptions {
        self.kernel.build_options()
    }

    pub fn config_id(&self) -> &str {
        self.kernel.config_id()
    }
}

impl_cl_kernel!(ClLogits1DMaxShiftExpSumKernel);

/// Normalisation. `Src0` is the temporary, `Src1` the row sums and `Dst0`
/// the destination in the source data type.
pub struct ClLogits1DNormKernel {
    kernel: ClKernel,
}

impl ClLogits1DNormKernel {
    pub fn new(runtime: Arc<dyn ClRuntime>) -> Self {
        Self::with_tuning(runtime, ClTuning::default())
    }

    pub fn with_tuning(runtime: Arc<dyn ClRuntime>, tuning: ClTuning) -> Self {
        Self {
            kernel: ClKernel::new("cl_softmax_norm", runtime, tuning),
        }
    }

    pub fn validate(
        tmp: &TensorInfo,
        sum: &TensorInfo,
        dst: &TensorInfo,
        info: &SoftmaxInfo,
        src_data_type: DataType,
    ) -> Result<(), KernelError> {
        check_data_type_in(tmp, &[DataType::F32], "tmp")?;
        check_data_type_in(sum, &[DataType::F32], "sum")?;
        check_mismatching_shapes(sum.shape(), &reduced_shape(tmp.shape()), "sum")?;
        ensure(
            SOFTMAX_TYPES.contains(&src_data_type),
            format!("Unsupported softmax data type {src_data_type}"),
        )?;
        ensure(
            !(info.is_log && !src_data_type.is_float()),
            "Log softmax is only supported for floating point data types",
        )?;
        if dst.total_size() != 0 {
            check_data_type_in(dst, &[src_data_type], "dst")?;
            check_mismatching_shapes(dst.shape(), tmp.shape(), "dst")?;
            if src_data_type.is_quantized() {
                ensure(
                    dst.quantization_info() == &softmax_output_quantization(src_data_type),
                    "softmax output must use scale 1/256",
                )?;
            }
        }
        Ok(())
    }

    pub fn configure(
        &mut self,
        tmp: &TensorInfo,
        sum: &TensorInfo,
        dst: &mut TensorInfo,
        info: &SoftmaxInfo,
        src_data_type: DataType,
    ) -> Result<(), KernelError> {
        self.kernel.ensure_unconfigured()?;
        Self::validate(tmp, sum, dst, info, src_data_type)?;
        let quantized = src_data_type.is_quantized();
        let qinfo = if quantized {
            softmax_output_quantization(src_data_type)
        } else {
            Default::default()
        };
        dst.auto_init_if_empty(*tmp.shape(), src_data_type, qinfo);

        let row_len = tmp.dimension(0);
        let vec = self.kernel.tuning().vec_size(16, row_len);
        let name = if quantized { NORM_QUANTIZED } else { NORM };
        let mut opts = BuildOptions::new();
        opts.define("DATA_TYPE", src_data_type.cl_type())
            .define("VECTOR_SIZE", vec)
            .define("VECTOR_SIZE_LEFTOVER", row_len % vec)
            .flag_if(info.is_log, "LOG_SOFTMAX")
            .define_if(quantized, "OUTPUT_OFFSET", dst.quantization_info().offset());

        let config_id = ConfigId::new(name)
            .with(src_data_type)
            .with(row_len)
            .with(tmp.dimension(1));
        let window = calculate_max_window(tmp.shape(), &Steps::new(&[vec]));
        self.kernel.build(name, opts, config_id, window, 3)
    }

    pub fn build_options(&self) -> &BuildOptions {
        self.kernel.build_options()
    }

    pub fn config_id(&self) -> &str {
        self.kernel.config_id()
    }
}

impl_cl_kernel!(ClLogits1DNormKernel);

pub(super) fn register(runtime: &HostClRuntime) {
    runtime.register(MAX_SHIFT_EXP_SUM_SERIAL, Arc::new(MaxShiftExpSumProgram));
    runtime.register(MAX_SHIFT_EXP_SUM_PARALLEL, Arc::new(MaxShiftExpSumProgram));
    runtime.register(MAX_SHIFT_EXP_SUM_QUANTIZED_SERIAL, Arc::new(MaxShiftExpSumProgram));
    runtime.register(MAX_SHIFT_EXP_SUM_QUANTIZED_PARALLEL, Arc::new(MaxShiftExpSumProgram));
    runtime.register(NORM, Arc::new(NormProgram));
    runtime.register(NORM_QUANTIZED, Arc::new(NormProgram));
}

/// Row constants of stage one, rebuilt from the defines.
fn stage_params(defines: &Defines) -> Result<SoftmaxParams, KernelError> {
    Ok(SoftmaxParams {
        scaled_beta: defines.get_or("BETA", 1.0)?,
        is_log: defines.has("LOG_SOFTMAX"),
        quantized: defines.has("IS_QUANTIZED"),
        out_offset: defines.get_or("OUTPUT_OFFSET", 0)?,
        out_min: 0,
        out_max: 0,
    })
}

/// Row maximum. With a grid, each work item reduces a strided share of
/// vectors and the partial maxima are combined afterwards.
fn row_max<T: Copy>(row: &[T], grid: Option<usize>, vec: usize, init: T, max: impl Fn(T, T) -> T) -> T {
    match grid {
        Some(grid) => {
            let mut partials = vec![init; grid.max(1)];
            let n = partials.len();
            for (i, chunk) in row.chunks(vec.max(1)).enumerate() {
                let partial = &mut partials[i % n];
                *partial = chunk.iter().fold(*partial, |acc, v| max(acc, *v));
            }
            partials.into_iter().fold(init, &max)
        }
        None => row.iter().fold(init, |acc, v| max(acc, *v)),
    }
}

struct MaxShiftExpSumProgram;

impl HostProgram for MaxShiftExpSumProgram {
    fn required_defines(&self) -> &'static [&'static str] {
        &["DATA_TYPE", "SRC_WIDTH", "VECTOR_SIZE"]
    }

    fn run(&self, defines: &Defines, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let ty = cl_type(defines, "DATA_TYPE")?;
        let row_len: usize = defines.get("SRC_WIDTH")?;
        let vec: usize = defines.get("VECTOR_SIZE")?;
        let grid: Option<usize> = if defines.has("GRID_SIZE") {
            Some(defines.get("GRID_SIZE")?)
        } else {
            None
        };
        let params = stage_params(defines)?;

        let src = tensors.get_const(TensorSlot::Src0)?;
        let max_out = tensors.get_mut(TensorSlot::Workspace)?;
        let tmp = tensors.get_mut(TensorSlot::Dst0)?;
        let sum_out = tensors.get_mut(TensorSlot::Dst1)?;
        let mut raw = vec![0i32; if params.quantized { row_len } else { 0 }];
        let mut values = vec![0.0f32; row_len];

        for_each_vector(window, row_len.max(1), 0, |mut at, _| {
            let row = at;
            if params.quantized {
                for (x, slot) in raw.iter_mut().enumerate() {
                    at[0] = x;
                    *slot = ty.load_int(&src, &at);
                }
                let max = row_max(&raw, grid, vec, i32::MIN, i32::max);
                for (slot, q) in values.iter_mut().zip(&raw) {
                    *slot = params.shifted((q - max) as f32);
                }
                ty.store_int_sat(&max_out, &row, max);
            } else {
                for (x, slot) in values.iter_mut().enumerate() {
                    at[0] = x;
                    *slot = ty.load_float(&src, &at);
                }
                let max = row_max(&values, grid, vec, f32::MIN, f32::max);
                for slot in values.iter_mut() {
                    *slot = params.shifted(*slot - max);
                }
                ty.store_float(&max_out, &row, max);
            }

            // The sum keeps index order on both variants.
            let sum = params.row_sum(&values);
            for (x, v) in values.iter().enumerate() {
                at[0] = x;
                tmp.set(&at, *v);
            }
            sum_out.set(&row, sum);
        });
        Ok(())
    }
}

struct NormProgram;

impl HostProgram for NormProgram {
    fn required_defines(&self) -> &'static [&'static str] {
        &["DATA_TYPE", "VECTOR_SIZE", "VECTOR_SIZE_LEFTOVER"]
    }

    fn run(&self, defines: &Defines, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let ty = cl_type(defines, "DATA_TYPE")?;
        let vec: usize = defines.get("VECTOR_SIZE")?;
        let leftover: usize = defines.get("VECTOR_SIZE_LEFTOVER")?;
        let quantized = defines.has("OUTPUT_OFFSET");
        let (out_min, out_max) = ty.range();
        let params = SoftmaxParams {
            out_min,
            out_max,
            ..stage_params(defines)?
        };

        let tmp = tensors.get_const(TensorSlot::Src0)?;
        let sums = tensors.get_const(TensorSlot::Src1)?;
        let dst = tensors.get_mut(TensorSlot::Dst0)?;

        for_each_vector(window, vec, leftover, |mut at, len| {
            let mut row = at;
            row[0] = 0;
            let sum = sums.get::<f32>(&row);
            let x0 = at[0];
            for x in x0..x0 + len {
                at[0] = x;
                let shifted = tmp.get::<f32>(&at);
                if quantized {
                    ty.store_int_sat(&dst, &at, params.normalize_quantized(shifted, sum));
                } else {
                    ty.store_float(&dst, &at, params.normalize(shifted, sum));
                }
            }
        });
        Ok(())
    }
}
