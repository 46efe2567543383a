// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Direct convolution: `direct_convolution_nhwc` for NHWC, and
//! `direct_convolution{K}x{K}` / `direct_convolution_quantized` for NCHW.
//!
//! The NHWC kernel vectorises over output channels with the leftover-first
//! scheme (`N0`, `PARTIAL_N0`) and handles `M0` output columns per work item.

use std::sync::Arc;

use super::{
    add_activation_options, add_quantized_activation_options, cl_type, float_activation,
    for_each_vector, quantized_activation_bounds, ClType,
};
use crate::backend::cl::host::{Defines, HostClRuntime, HostProgram};
use crate::backend::cl::{impl_cl_kernel, BuildOptions, ClKernel, ClRuntime, ClTuning, ConfigId};
use crate::error::KernelError;
use crate::kernel::validate::ensure;
use crate::ops::conv::{
    conv_point_f32, conv_point_quantized, validate_direct_conv, ConvGeometry, Requantize,
};
use crate::ops::shape::{compute_deep_convolution_shape, layout_coords};
use crate::types::{
    ActivationLayerInfo, DataLayout, PadStrideInfo, Steps, TensorInfo, TensorPack, TensorSlot,
    TensorView, MAX_DIMS,
};
use crate::window::{calculate_max_window, Window};

const NHWC: &str = "direct_convolution_nhwc";
const NCHW_QUANTIZED: &str = "direct_convolution_quantized";
const NCHW_FLOAT_SIZES: [usize; 3] = [1, 3, 5];
const NCHW_QUANTIZED_SIZES: [usize; 4] = [1, 3, 5, 9];

fn nchw_float_name(kernel_size: usize) -> String {
    format!("direct_convolution{kernel_size}x{kernel_size}")
}

pub struct ClDirectConv2dKernel {
    kernel: ClKernel,
}

impl ClDirectConv2dKernel {
    pub fn new(runtime: Arc<dyn ClRuntime>) -> Self {
        Self::with_tuning(runtime, ClTuning::default())
    }

    pub fn with_tuning(runtime: Arc<dyn ClRuntime>, tuning: ClTuning) -> Self {
        Self {
            kernel: ClKernel::new("cl_direct_conv2d", runtime, tuning),
        }
    }

    pub fn validate(
        src: &TensorInfo,
        weights: &TensorInfo,
        biases: Option<&TensorInfo>,
        dst: &TensorInfo,
        conv_info: &PadStrideInfo,
        act: &ActivationLayerInfo,
    ) -> Result<(), KernelError> {
        validate_direct_conv(src, weights, biases, dst, conv_info, act)?;
        if src.data_layout() == DataLayout::Nchw {
            let kernel_size = weights.dimension(DataLayout::Nchw.width_index());
            let supported: &[usize] = if src.data_type().is_quantized() {
                &NCHW_QUANTIZED_SIZES
            } else {
                &NCHW_FLOAT_SIZES
            };
            ensure(
                supported.contains(&kernel_size),
                format!("Kernel size {kernel_size}x{kernel_size} is not supported for NCHW"),
            )?;
        }
        Ok(())
    }

    /// Weights come from `Src1` and biases, when given, from `Src2`.
    pub fn configure(
        &mut self,
        src: &TensorInfo,
        weights: &TensorInfo,
        biases: Option<&TensorInfo>,
        dst: &mut TensorInfo,
        conv_info: &PadStrideInfo,
        act: &ActivationLayerInfo,
    ) -> Result<(), KernelError> {
        self.kernel.ensure_unconfigured()?;
        Self::validate(src, weights, biases, dst, conv_info, act)?;
        let shape = compute_deep_convolution_shape(src, weights, conv_info)?;
        dst.auto_init_from(src, shape, src.data_type());

        let layout = src.data_layout();
        let data_type = src.data_type();
        let (w_idx, h_idx, c_idx) = (layout.width_index(), layout.height_index(), layout.channel_index());
        let kernel_size = weights.dimension(w_idx);
        let requant = if data_type.is_quantized() {
            Some(Requantize::new(src, weights, dst, act)?)
        } else {
            None
        };
        let tuning = *self.kernel.tuning();

        let mut opts = BuildOptions::new();
        opts.define("SRC_WIDTH", src.dimension(w_idx))
            .define("SRC_HEIGHT", src.dimension(h_idx))
            .define("STRIDE_X", conv_info.stride_x)
            .define("STRIDE_Y", conv_info.stride_y)
            .define("PAD_LEFT", conv_info.pad_left)
            .define("PAD_TOP", conv_info.pad_top)
            .flag_if(biases.is_some(), "HAS_BIAS");

        let (name, steps) = if layout == DataLayout::Nhwc {
            let out_channels = shape.dim(c_idx);
            let n0 = tuning.vec_size(4, out_channels);
            let m0 = tuning.vec_size(2, shape.dim(w_idx));
            let k0 = tuning.vec_size(if data_type.is_quantized() { 16 } else { 8 }, src.dimension(c_idx));
            opts.define("SRC_CHANNELS", src.dimension(c_idx))
                .define("DST_WIDTH", shape.dim(w_idx))
                .define("DST_HEIGHT", shape.dim(h_idx))
                .define("DST_CHANNELS", out_channels)
                .define("WEI_WIDTH", kernel_size)
                .define("WEI_HEIGHT", weights.dimension(h_idx))
                .define("SRC_DATA_TYPE", data_type.cl_type())
                .define("WEI_DATA_TYPE", weights.data_type().cl_type())
                .define("DST_DATA_TYPE", data_type.cl_type())
                .define("N0", n0)
                .define("M0", m0)
                .define("K0", k0)
                .define("PARTIAL_N0", out_channels % n0);
            match &requant {
                Some(rq) => {
                    opts.flag("IS_QUANTIZED")
                        .define("ACC_DATA_TYPE", "int")
                        .define("SRC_OFFSET", rq.src_offset)
                        .define("WEI_OFFSET", rq.weights_offset)
                        .define("DST_OFFSET", rq.dst_offset)
                        .define("DST_MULTIPLIER", rq.multipliers[0])
                        .define("DST_SHIFT", rq.shifts[0]);
                    add_quantized_activation_options(
                        &mut opts,
                        act,
                        data_type,
                        &dst.quantization_info().uniform(),
                    );
                }
                None => {
                    opts.define("ACC_DATA_TYPE", data_type.cl_type());
                    add_activation_options(&mut opts, act);
                }
            }
            (NHWC.to_string(), Steps::new(&[n0, m0]))
        } else {
            let vec_x = tuning.vec_size(8, shape.dim(w_idx));
            opts.define("DATA_TYPE", data_type.cl_type())
                .define("KERNEL_SIZE", kernel_size)
                .define("WEIGHTS_DEPTH", weights.dimension(c_idx));
            let name = match &requant {
                Some(rq) => {
                    opts.define("INPUT_OFFSET", rq.src_offset)
                        .define("WEIGHTS_OFFSET", rq.weights_offset)
                        .define("OUTPUT_OFFSET", rq.dst_offset)
                        .define("OUTPUT_MULTIPLIER", rq.multipliers[0])
                        .define("OUTPUT_SHIFT", rq.shifts[0]);
                    NCHW_QUANTIZED.to_string()
                }
                None => {
                    add_activation_options(&mut opts, act);
                    nchw_float_name(kernel_size)
                }
            };
            (name, Steps::new(&[vec_x]))
        };

        let config_id = ConfigId::new(&name)
            .with(layout.kernel_suffix())
            .with(data_type)
            .with(src.dimension(w_idx))
            .with(src.dimension(h_idx))
            .with(src.dimension(c_idx))
            .with(shape.dim(c_idx))
            .with(kernel_size)
            .with(conv_info.stride_x);
        let window = calculate_max_window(&shape, &steps);
        self.kernel.build(&name, opts, config_id, window, 3)
    }

    pub fn build_options(&self) -> &BuildOptions {
        self.kernel.build_options()
    }

    pub fn config_id(&self) -> &str {
        self.kernel.config_id()
    }
}

impl_cl_kernel!(ClDirectConv2dKernel);

pub(super) fn register(runtime: &HostClRuntime) {
    runtime.register(NHWC, Arc::new(NhwcProgram));
    let nchw = Arc::new(NchwProgram);
    for size in NCHW_FLOAT_SIZES {
        runtime.register(&nchw_float_name(size), nchw.clone());
    }
    runtime.register(NCHW_QUANTIZED, nchw);
}

fn bias_coords(channel: usize) -> [usize; MAX_DIMS] {
    let mut at = [0; MAX_DIMS];
    at[0] = channel;
    at
}

/// Float or quantized epilogue of one output point.
enum Epilogue {
    Float(ActivationLayerInfo),
    Quantized(Requantize),
}

struct NhwcProgram;

impl HostProgram for NhwcProgram {
    fn required_defines(&self) -> &'static [&'static str] {
        &[
            "SRC_WIDTH",
            "SRC_HEIGHT",
            "SRC_CHANNELS",
            "WEI_WIDTH",
            "WEI_HEIGHT",
            "STRIDE_X",
            "STRIDE_Y",
            "PAD_LEFT",
            "PAD_TOP",
            "SRC_DATA_TYPE",
            "DST_DATA_TYPE",
            "N0",
            "PARTIAL_N0",
        ]
    }

    fn run(&self, defines: &Defines, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let geom = ConvGeometry {
            src_width: defines.get("SRC_WIDTH")?,
            src_height: defines.get("SRC_HEIGHT")?,
            kernel_width: defines.get("WEI_WIDTH")?,
            kernel_height: defines.get("WEI_HEIGHT")?,
            stride_x: defines.get("STRIDE_X")?,
            stride_y: defines.get("STRIDE_Y")?,
            pad_left: defines.get("PAD_LEFT")?,
            pad_top: defines.get("PAD_TOP")?,
        };
        let channels: usize = defines.get("SRC_CHANNELS")?;
        let src_ty = cl_type(defines, "SRC_DATA_TYPE")?;
        let dst_ty = cl_type(defines, "DST_DATA_TYPE")?;
        let n0: usize = defines.get("N0")?;
        let partial_n0: usize = defines.get("PARTIAL_N0")?;
        let epilogue = if defines.has("IS_QUANTIZED") {
            let dst_offset: i32 = defines.get("DST_OFFSET")?;
            let (min, max) = quantized_activation_bounds(defines, dst_ty, dst_offset)?;
            Epilogue::Quantized(Requantize {
                multipliers: vec![defines.get("DST_MULTIPLIER")?],
                shifts: vec![defines.get("DST_SHIFT")?],
                src_offset: defines.get("SRC_OFFSET")?,
                weights_offset: defines.get("WEI_OFFSET")?,
                dst_offset,
                min,
                max,
            })
        } else {
            Epilogue::Float(float_activation(defines)?)
        };

        let l = DataLayout::Nhwc;
        let src = tensors.get_const(TensorSlot::Src0)?;
        let weights = tensors.get_const(TensorSlot::Src1)?;
        let bias = if defines.has("HAS_BIAS") {
            Some(tensors.get_const(TensorSlot::Src2)?)
        } else {
            None
        };
        let dst = tensors.get_mut(TensorSlot::Dst0)?;

        for_each_vector(window, n0, partial_n0, |mut at, len| {
            let (ox, oy, b) = (at[1], at[2], at[3]);
            let c0 = at[0];
            for oc in c0..c0 + len {
                at[0] = oc;
                store_point(
                    &epilogue,
                    src_ty,
                    bias.as_ref(),
                    oc,
                    |rq| {
                        conv_point_quantized(
                            &geom,
                            ox,
                            oy,
                            channels,
                            rq,
                            |ix, iy, c| src_ty.load_int(&src, &layout_coords(l, ix, iy, c, b)),
                            |kx, ky, c| src_ty.load_int(&weights, &layout_coords(l, kx, ky, c, oc)),
                        )
                    },
                    || {
                        conv_point_f32(
                            &geom,
                            ox,
                            oy,
                            channels,
                            |ix, iy, c| src_ty.load_float(&src, &layout_coords(l, ix, iy, c, b)),
                            |kx, ky, c| src_ty.load_float(&weights, &layout_coords(l, kx, ky, c, oc)),
                        )
                    },
                    |value| match value {
                        Stored::Int(v) => dst_ty.store_int_sat(&dst, &at, v),
                        Stored::Float(v) => dst_ty.store_float(&dst, &at, v),
                    },
                );
            }
        });
        Ok(())
    }
}

enum Stored {
    Int(i32),
    Float(f32),
}

/// Accumulate, add the bias and run the epilogue for output channel `oc`.
fn store_point(
    epilogue: &Epilogue,
    src_ty: ClType,
    bias: Option<&TensorView<'_>>,
    oc: usize,
    quantized: impl FnOnce(&Requantize) -> i32,
    float: impl FnOnce() -> f32,
    mut store: impl FnMut(Stored),
) {
    match epilogue {
        Epilogue::Quantized(rq) => {
            let acc = quantized(rq);
            let bias = bias.map_or(0, |v| ClType::Int.load_int(v, &bias_coords(oc)));
            store(Stored::Int(rq.apply(acc.wrapping_add(bias), oc)));
        }
        Epilogue::Float(act) => {
            let acc = float();
            let bias = bias.map_or(0.0, |v| src_ty.load_float(v, &bias_coords(oc)));
            store(Stored::Float(act.apply(acc + bias)));
        }
    }
}

struct NchwProgram;

impl HostProgram for NchwProgram {
    fn required_defines(&self) -> &'static [&'static str] {
        &[
            "SRC_WIDTH",
            "SRC_HEIGHT",
            "KERNEL_SIZE",
            "WEIGHTS_DEPTH",
            "STRIDE_X",
            "STRIDE_Y",
            "PAD_LEFT",
            "PAD_TOP",
            "DATA_TYPE",
        ]
    }

    fn run(&self, defines: &Defines, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let kernel_size: usize = defines.get("KERNEL_SIZE")?;
        let geom = ConvGeometry {
            src_width: defines.get("SRC_WIDTH")?,
            src_height: defines.get("SRC_HEIGHT")?,
            kernel_width: kernel_size,
            kernel_height: kernel_size,
            stride_x: defines.get("STRIDE_X")?,
            stride_y: defines.get("STRIDE_Y")?,
            pad_left: defines.get("PAD_LEFT")?,
            pad_top: defines.get("PAD_TOP")?,
        };
        let channels: usize = defines.get("WEIGHTS_DEPTH")?;
        let ty = cl_type(defines, "DATA_TYPE")?;
        let epilogue = if defines.has("OUTPUT_MULTIPLIER") {
            let (min, max) = ty.range();
            Epilogue::Quantized(Requantize {
                multipliers: vec![defines.get("OUTPUT_MULTIPLIER")?],
                shifts: vec![defines.get("OUTPUT_SHIFT")?],
                src_offset: defines.get("INPUT_OFFSET")?,
                weights_offset: defines.get("WEIGHTS_OFFSET")?,
                dst_offset: defines.get("OUTPUT_OFFSET")?,
                min,
                max,
            })
        } else {
            Epilogue::Float(float_activation(defines)?)
        };

        let l = DataLayout::Nchw;
        let src = tensors.get_const(TensorSlot::Src0)?;
        let weights = tensors.get_const(TensorSlot::Src1)?;
        let bias = if defines.has("HAS_BIAS") {
            Some(tensors.get_const(TensorSlot::Src2)?)
        } else {
            None
        };
        let dst = tensors.get_mut(TensorSlot::Dst0)?;

        for block in window.blocks() {
            block.for_each_element(|at| {
                let (ox, oy, oc, b) = (at[0], at[1], at[2], at[3]);
                store_point(
                    &epilogue,
                    ty,
                    bias.as_ref(),
                    oc,
                    |rq| {
                        conv_point_quantized(
                            &geom,
                            ox,
                            oy,
                            channels,
                            rq,
                            |ix, iy, c| ty.load_int(&src, &layout_coords(l, ix, iy, c, b)),
                            |kx, ky, c| ty.load_int(&weights, &layout_coords(l, kx, ky, c, oc)),
                        )
                    },
                    || {
                        conv_point_f32(
                            &geom,
                            ox,
                            oy,
                            channels,
                            |ix, iy, c| ty.load_float(&src, &layout_coords(l, ix, iy, c, b)),
                            |kx, ky, c| ty.load_float(&weights, &layout_coords(l, kx, ky, c, oc)),
                        )
                    },
                    |value| match value {
                        Stored::Int(v) => ty.store_int_sat(&dst, at, v),
                        Stored::Float(v) => ty.store_float(&dst, at, v),
                    },
                );
            });
        }
        Ok(())
    }
}
