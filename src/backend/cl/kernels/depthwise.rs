// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Depthwise convolution.
//!
//! NCHW 3x3 filters select the specialised `depthwise_convolution_3x3*`
//! kernels (with a dot8 variant for quantized stride-1 unit-multiplier
//! cases); everything else runs `dwc_native_{fp|quantized}_{layout}`.
//!
//! Per-channel weights carry one multiplier and shift per output channel.
//! Those are read at run time from `Src3` (multipliers) and `Src4` (shifts),
//! both `S32` vectors, since a build option cannot hold an array.

use std::sync::Arc;

use super::{
    add_activation_options, add_quantized_activation_options, cl_type, float_activation,
    for_each_vector, quantized_activation_bounds,
};
use crate::backend::cl::host::{Defines, HostClRuntime, HostProgram};
use crate::backend::cl::{impl_cl_kernel, BuildOptions, ClKernel, ClRuntime, ClTuning, ConfigId};
use crate::error::KernelError;
use crate::ops::conv::{ConvGeometry, Requantize};
use crate::ops::depthwise::{depthwise_point_f32, depthwise_point_quantized, validate_depthwise, DepthwiseInfo};
use crate::ops::shape::{compute_depthwise_convolution_shape, layout_coords};
use crate::types::{DataLayout, DataType, Steps, TensorInfo, TensorPack, TensorSlot, MAX_DIMS};
use crate::window::{calculate_max_window, Window};

const DWC_3X3_F32: &str = "depthwise_convolution_3x3";
const DWC_3X3_F16: &str = "depthwise_convolution_3x3_f16";
const DWC_3X3_QUANTIZED: &str = "depthwise_convolution_3x3_quantized_nchw";
const DWC_3X3_QUANTIZED_DOT8: &str = "depthwise_convolution_3x3_quantized_dot8_nchw";

fn native_name(quantized: bool, layout: DataLayout) -> String {
    let kind = if quantized { "quantized" } else { "fp" };
    format!("dwc_native_{kind}_{}", layout.kernel_suffix())
}

pub struct ClDepthwiseConv2dKernel {
    kernel: ClKernel,
}

impl ClDepthwiseConv2dKernel {
    pub fn new(runtime: Arc<dyn ClRuntime>) -> Self {
        Self::with_tuning(runtime, ClTuning::default())
    }

    pub fn with_tuning(runtime: Arc<dyn ClRuntime>, tuning: ClTuning) -> Self {
        Self {
            kernel: ClKernel::new("cl_depthwise_conv2d", runtime, tuning),
        }
    }

    pub fn validate(
        src: &TensorInfo,
        weights: &TensorInfo,
        biases: Option<&TensorInfo>,
        dst: &TensorInfo,
        info: &DepthwiseInfo,
    ) -> Result<(), KernelError> {
        validate_depthwise(src, weights, biases, dst, info)
    }

    pub fn configure(
        &mut self,
        src: &TensorInfo,
        weights: &TensorInfo,
        biases: Option<&TensorInfo>,
        dst: &mut TensorInfo,
        info: &DepthwiseInfo,
    ) -> Result<(), KernelError> {
        self.kernel.ensure_unconfigured()?;
        Self::validate(src, weights, biases, dst, info)?;
        let shape = compute_depthwise_convolution_shape(src, weights, &info.pad_stride, info.depth_multiplier)?;
        dst.auto_init_from(src, shape, src.data_type());

        let layout = src.data_layout();
        let data_type = src.data_type();
        let quantized = data_type.is_quantized();
        let (w_idx, h_idx, c_idx) = (layout.width_index(), layout.height_index(), layout.channel_index());
        let (kernel_w, kernel_h) = (weights.dimension(w_idx), weights.dimension(h_idx));
        let out_channels = shape.dim(c_idx);
        let per_channel = weights.data_type() == DataType::QSymm8PerChannel;
        let conv = &info.pad_stride;

        let name = if layout == DataLayout::Nchw && kernel_w == 3 && kernel_h == 3 {
            match data_type {
                DataType::F32 => DWC_3X3_F32.to_string(),
                DataType::F16 => DWC_3X3_F16.to_string(),
                _ if self.kernel.device_info().supports_dot8
                    && conv.stride_x == 1
                    && info.depth_multiplier == 1 =>
                {
                    DWC_3X3_QUANTIZED_DOT8.to_string()
                }
                _ => DWC_3X3_QUANTIZED.to_string(),
            }
        } else {
            native_name(quantized, layout)
        };

        let tuning = *self.kernel.tuning();
        let mut opts = BuildOptions::new();
        opts.define("SRC_WIDTH", src.dimension(w_idx))
            .define("SRC_HEIGHT", src.dimension(h_idx))
            .define("DST_CHANNELS", out_channels)
            .define("WEI_WIDTH", kernel_w)
            .define("WEI_HEIGHT", kernel_h)
            .define("STRIDE_X", conv.stride_x)
            .define("STRIDE_Y", conv.stride_y)
            .define("PAD_LEFT", conv.pad_left)
            .define("PAD_TOP", conv.pad_top)
            .define("DEPTH_MULTIPLIER", info.depth_multiplier)
            .define("SRC_DATA_TYPE", data_type.cl_type())
            .define("WEI_DATA_TYPE", weights.data_type().cl_type())
            .define("DST_DATA_TYPE", data_type.cl_type())
            .flag_if(biases.is_some(), "HAS_BIAS");

        let steps = if layout == DataLayout::Nhwc {
            let n0 = if info.depth_multiplier > 1 { 1 } else { tuning.vec_size(4, out_channels) };
            opts.define("N0", n0).define("PARTIAL_N0", out_channels % n0);
            Steps::new(&[n0])
        } else {
            Steps::default()
        };

        if quantized {
            let requant = Requantize::new(src, weights, dst, &info.activation)?;
            opts.flag("IS_QUANTIZED")
                .define("SRC_OFFSET", requant.src_offset)
                .define("WEI_OFFSET", requant.weights_offset)
                .define("DST_OFFSET", requant.dst_offset);
            if per_channel {
                opts.flag("PER_CHANNEL_QUANTIZATION");
            } else {
                opts.define("DST_MULTIPLIER", requant.multipliers[0])
                    .define("DST_SHIFT", requant.shifts[0]);
            }
            if name == DWC_3X3_QUANTIZED_DOT8 {
                opts.define("ACC_DATA_TYPE", data_type.cl_dot8_acc_type());
            }
            add_quantized_activation_options(&mut opts, &info.activation, data_type, &dst.quantization_info().uniform());
        } else {
            add_activation_options(&mut opts, &info.activation);
        }

        let config_id = ConfigId::new(&name)
            .with(data_type)
            .with(src.dimension(w_idx))
            .with(src.dimension(h_idx))
            .with(src.dimension(c_idx))
            .with(kernel_w)
            .with(info.depth_multiplier)
            .with(conv.stride_x);
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

impl_cl_kernel!(ClDepthwiseConv2dKernel);

pub(super) fn register(runtime: &HostClRuntime) {
    let nchw = Arc::new(DepthwiseProgram { layout: DataLayout::Nchw });
    for name in [DWC_3X3_F32, DWC_3X3_F16, DWC_3X3_QUANTIZED, DWC_3X3_QUANTIZED_DOT8] {
        runtime.register(name, nchw.clone());
    }
    runtime.register(&native_name(false, DataLayout::Nchw), nchw.clone());
    runtime.register(&native_name(true, DataLayout::Nchw), nchw);
    let nhwc = Arc::new(DepthwiseProgram { layout: DataLayout::Nhwc });
    runtime.register(&native_name(false, DataLayout::Nhwc), nhwc.clone());
    runtime.register(&native_name(true, DataLayout::Nhwc), nhwc);
}

struct DepthwiseProgram {
    layout: DataLayout,
}

impl DepthwiseProgram {
    fn requantize(&self, defines: &Defines, tensors: &TensorPack<'_>, dst_offset: i32, min: i32, max: i32) -> Result<Requantize, KernelError> {
        let (multipliers, shifts) = if defines.has("PER_CHANNEL_QUANTIZATION") {
            let channels: usize = defines.get("DST_CHANNELS")?;
            let m = tensors.get_const(TensorSlot::Src3)?;
            let s = tensors.get_const(TensorSlot::Src4)?;
            (
                (0..channels).map(|c| m.element::<i32>(c)).collect(),
                (0..channels).map(|c| s.element::<i32>(c)).collect(),
            )
        } else {
            (vec![defines.get("DST_MULTIPLIER")?], vec![defines.get("DST_SHIFT")?])
        };
        Ok(Requantize {
            multipliers,
            shifts,
            src_offset: defines.get("SRC_OFFSET")?,
            weights_offset: defines.get("WEI_OFFSET")?,
            dst_offset,
            min,
            max,
        })
    }
}

impl HostProgram for DepthwiseProgram {
    fn required_defines(&self) -> &'static [&'static str] {
        &[
            "SRC_WIDTH",
            "SRC_HEIGHT",
            "WEI_WIDTH",
            "WEI_HEIGHT",
            "STRIDE_X",
            "STRIDE_Y",
            "PAD_LEFT",
            "PAD_TOP",
            "DEPTH_MULTIPLIER",
            "SRC_DATA_TYPE",
            "WEI_DATA_TYPE",
            "DST_DATA_TYPE",
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
        let dm: usize = defines.get("DEPTH_MULTIPLIER")?;
        let src_ty = cl_type(defines, "SRC_DATA_TYPE")?;
        let wei_ty = cl_type(defines, "WEI_DATA_TYPE")?;
        let dst_ty = cl_type(defines, "DST_DATA_TYPE")?;
        let requant = if defines.has("IS_QUANTIZED") {
            let dst_offset: i32 = defines.get("DST_OFFSET")?;
            let (min, max) = quantized_activation_bounds(defines, dst_ty, dst_offset)?;
            Some(self.requantize(defines, tensors, dst_offset, min, max)?)
        } else {
            None
        };
        let act = float_activation(defines)?;

        let l = self.layout;
        let src = tensors.get_const(TensorSlot::Src0)?;
        let weights = tensors.get_const(TensorSlot::Src1)?;
        let bias = if defines.has("HAS_BIAS") {
            Some(tensors.get_const(TensorSlot::Src2)?)
        } else {
            None
        };
        let dst = tensors.get_mut(TensorSlot::Dst0)?;

        let point = |at: &[usize; MAX_DIMS]| {
            let (ox, oy, oc, b) = (at[l.width_index()], at[l.height_index()], at[l.channel_index()], at[l.batch_index()]);
            let ic = oc / dm;
            let mut bias_at = [0; MAX_DIMS];
            bias_at[0] = oc;
            match &requant {
                Some(rq) => {
                    let acc = depthwise_point_quantized(
                        &geom,
                        ox,
                        oy,
                        rq,
                        |ix, iy| src_ty.load_int(&src, &layout_coords(l, ix, iy, ic, b)),
                        |kx, ky| wei_ty.load_int(&weights, &layout_coords(l, kx, ky, oc, 0)),
                    );
                    let bias = bias.as_ref().map_or(0, |v| v.get::<i32>(&bias_at));
                    dst_ty.store_int_sat(&dst, at, rq.apply(acc.wrapping_add(bias), oc));
                }
                None => {
                    let acc = depthwise_point_f32(
                        &geom,
                        ox,
                        oy,
                        |ix, iy| src_ty.load_float(&src, &layout_coords(l, ix, iy, ic, b)),
                        |kx, ky| wei_ty.load_float(&weights, &layout_coords(l, kx, ky, oc, 0)),
                    );
                    let bias = bias.as_ref().map_or(0.0, |v| wei_ty.load_float(v, &bias_at));
                    dst_ty.store_float(&dst, at, act.apply(acc + bias));
                }
            }
        };

        if l == DataLayout::Nhwc {
            let n0: usize = defines.get("N0")?;
            let partial_n0: usize = defines.get("PARTIAL_N0")?;
            for_each_vector(window, n0, partial_n0, |mut at, len| {
                let c0 = at[0];
                for c in c0..c0 + len {
                    at[0] = c;
                    point(&at);
                }
            });
        } else {
            for block in window.blocks() {
                block.for_each_element(|at| point(at));
            }
        }
        Ok(())
    }
}
