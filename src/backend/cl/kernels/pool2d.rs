// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! 2D pooling on the device.
//!
//! NHWC kernels vectorise over channels with `VEC_SIZE` and
//! `VEC_SIZE_LEFTOVER`. Quantized kernels rescale into the destination
//! quantization when `OFFSET_IN1`/`SCALE_IN1` and `OFFSET_OUT`/`SCALE_OUT`
//! differ.

use std::sync::Arc;

use super::{cl_type, for_each_vector, ClType};
use crate::backend::cl::host::{Defines, HostClRuntime, HostProgram};
use crate::backend::cl::{impl_cl_kernel, BuildOptions, ClKernel, ClRuntime, ClTuning, ConfigId};
use crate::error::KernelError;
use crate::ops::pooling::{pool_point_f32, pool_point_quantized, validate_pooling, PoolGeometry, PoolRequantize};
use crate::ops::shape::{compute_pool_shape, layout_coords, pool_layout};
use crate::quantization::get_min_max_values_from_quantized_data_type;
use crate::types::{
    Coordinates, DataLayout, PadStrideInfo, PoolingLayerInfo, PoolingType, Steps,
    TensorInfo, TensorPack, TensorSlot, UniformQuantizationInfo,
};
use crate::window::{calculate_max_window, Window};

const NCHW_SQUARE_SIZES: [usize; 3] = [2, 3, 7];

fn generic_name(quantized: bool, layout: DataLayout) -> String {
    let q = if quantized { "quantized_" } else { "" };
    format!("pooling_layer_MxN_{q}{}", layout.kernel_suffix())
}

fn pool_define(pool_type: PoolingType) -> &'static str {
    match pool_type {
        PoolingType::Max => "POOL_MAX",
        PoolingType::Avg => "POOL_AVG",
        PoolingType::L2 => "POOL_L2",
    }
}

pub struct ClPool2dKernel {
    kernel: ClKernel,
}

impl ClPool2dKernel {
    pub fn new(runtime: Arc<dyn ClRuntime>) -> Self {
        Self::with_tuning(runtime, ClTuning::default())
    }

    pub fn with_tuning(runtime: Arc<dyn ClRuntime>, tuning: ClTuning) -> Self {
        Self {
            kernel: ClKernel::new("cl_pool2d", runtime, tuning),
        }
    }

    pub fn validate(src: &TensorInfo, dst: &TensorInfo, info: &PoolingLayerInfo) -> Result<(), KernelError> {
        validate_pooling(src, dst, info)
    }

    pub fn configure(&mut self, src: &TensorInfo, dst: &mut TensorInfo, info: &PoolingLayerInfo) -> Result<(), KernelError> {
        self.kernel.ensure_unconfigured()?;
        Self::validate(src, dst, info)?;
        let shape = compute_pool_shape(src, info)?;
        dst.auto_init_from(src, shape, src.data_type());

        let layout = pool_layout(src, info);
        let data_type = src.data_type();
        let quantized = data_type.is_quantized();
        let geom = PoolGeometry::new(src, info);
        let ps = geom.pad_stride;
        let (w_idx, h_idx, c_idx) = (layout.width_index(), layout.height_index(), layout.channel_index());

        let square = geom.pool_width == geom.pool_height;
        let name = match layout {
            DataLayout::Nhwc if !quantized && square && geom.pool_width == 2 => "pooling_layer_2x2_nhwc".to_string(),
            DataLayout::Nchw if !quantized && square && NCHW_SQUARE_SIZES.contains(&geom.pool_width) => {
                format!("pooling_layer_{}", geom.pool_width)
            }
            _ => generic_name(quantized, layout),
        };

        let mut opts = BuildOptions::new();
        opts.flag(pool_define(geom.pool_type))
            .define("DATA_TYPE", data_type.cl_type())
            .define("ACC_DATA_TYPE", if quantized { "int" } else { "float" })
            .define("POOL_SIZE_X", geom.pool_width)
            .define("POOL_SIZE_Y", geom.pool_height)
            .define("STRIDE_X", ps.stride_x)
            .define("STRIDE_Y", ps.stride_y)
            .define("PAD_LEFT", ps.pad_left)
            .define("PAD_RIGHT", ps.pad_right)
            .define("PAD_TOP", ps.pad_top)
            .define("PAD_BOTTOM", ps.pad_bottom)
            .define("SRC_WIDTH", geom.src_width)
            .define("SRC_HEIGHT", geom.src_height)
            .flag_if(geom.exclude_padding, "EXCLUDE_PADDING");
        if quantized {
            opts.define("INITIAL_VALUE", get_min_max_values_from_quantized_data_type(data_type)?.0);
            if let Some(rq) = PoolRequantize::new(src, dst)? {
                opts.define("OFFSET_IN1", rq.src.offset)
                    .define("OFFSET_OUT", rq.dst.offset)
                    .define("SCALE_IN1", rq.src.scale)
                    .define("SCALE_OUT", rq.dst.scale);
            }
        }

        let steps = if layout == DataLayout::Nhwc {
            let channels = shape.dim(c_idx);
            let vec = self.kernel.tuning().vec_size(if quantized { 16 } else { 4 }, channels);
            opts.define("VEC_SIZE", vec).define("VEC_SIZE_LEFTOVER", channels % vec);
            Steps::new(&[vec])
        } else {
            Steps::default()
        };

        let config_id = ConfigId::new("pooling_layer")
            .with(data_type)
            .with(layout)
            .with(shape.dim(w_idx))
            .with(shape.dim(h_idx))
            .with(shape.dim(c_idx))
            .with(src.data_layout());
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

impl_cl_kernel!(ClPool2dKernel);

pub(super) fn register(runtime: &HostClRuntime) {
    let nchw = Arc::new(PoolProgram { layout: DataLayout::Nchw });
    for size in NCHW_SQUARE_SIZES {
        runtime.register(&format!("pooling_layer_{size}"), nchw.clone());
    }
    runtime.register(&generic_name(false, DataLayout::Nchw), nchw.clone());
    runtime.register(&generic_name(true, DataLayout::Nchw), nchw);
    let nhwc = Arc::new(PoolProgram { layout: DataLayout::Nhwc });
    runtime.register("pooling_layer_2x2_nhwc", nhwc.clone());
    runtime.register(&generic_name(false, DataLayout::Nhwc), nhwc.clone());
    runtime.register(&generic_name(true, DataLayout::Nhwc), nhwc);
}

struct PoolProgram {
    layout: DataLayout,
}

fn pool_type(defines: &Defines) -> Result<PoolingType, KernelError> {
    if defines.has("POOL_MAX") {
        Ok(PoolingType::Max)
    } else if defines.has("POOL_AVG") {
        Ok(PoolingType::Avg)
    } else if defines.has("POOL_L2") {
        Ok(PoolingType::L2)
    } else {
        Err(KernelError::Enqueue("no POOL_* type defined".to_string()))
    }
}

fn requantize(defines: &Defines, ty: ClType) -> Result<Option<PoolRequantize>, KernelError> {
    if !defines.has("OFFSET_OUT") {
        return Ok(None);
    }
    let (min, max) = ty.range();
    Ok(Some(PoolRequantize {
        src: UniformQuantizationInfo {
            scale: defines.get("SCALE_IN1")?,
            offset: defines.get("OFFSET_IN1")?,
        },
        dst: UniformQuantizationInfo {
            scale: defines.get("SCALE_OUT")?,
            offset: defines.get("OFFSET_OUT")?,
        },
        min,
        max,
    }))
}

impl HostProgram for PoolProgram {
    fn required_defines(&self) -> &'static [&'static str] {
        &["DATA_TYPE", "POOL_SIZE_X", "POOL_SIZE_Y", "STRIDE_X", "STRIDE_Y", "SRC_WIDTH", "SRC_HEIGHT"]
    }

    fn run(&self, defines: &Defines, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let pad_stride = PadStrideInfo::new(defines.get("STRIDE_X")?, defines.get("STRIDE_Y")?, 0, 0).with_padding(
            defines.get_or("PAD_LEFT", 0)?,
            defines.get_or("PAD_RIGHT", 0)?,
            defines.get_or("PAD_TOP", 0)?,
            defines.get_or("PAD_BOTTOM", 0)?,
        );
        let geom = PoolGeometry {
            pool_type: pool_type(defines)?,
            src_width: defines.get("SRC_WIDTH")?,
            src_height: defines.get("SRC_HEIGHT")?,
            pool_width: defines.get("POOL_SIZE_X")?,
            pool_height: defines.get("POOL_SIZE_Y")?,
            pad_stride,
            exclude_padding: defines.has("EXCLUDE_PADDING"),
        };
        let ty = cl_type(defines, "DATA_TYPE")?;
        let initial: Option<i32> = if defines.has("INITIAL_VALUE") {
            Some(defines.get("INITIAL_VALUE")?)
        } else {
            None
        };
        let requant = requantize(defines, ty)?;

        let l = self.layout;
        let src = tensors.get_const(TensorSlot::Src0)?;
        let dst = tensors.get_mut(TensorSlot::Dst0)?;
        let point = |at: &Coordinates| {
            let (ox, oy, c, b) = (at[l.width_index()], at[l.height_index()], at[l.channel_index()], at[l.batch_index()]);
            match initial {
                Some(type_min) => {
                    let pooled = pool_point_quantized(&geom, ox, oy, type_min, |x, y| {
                        ty.load_int(&src, &layout_coords(l, x, y, c, b))
                    });
                    let value = requant.map_or(pooled, |r| r.apply(pooled));
                    ty.store_int_sat(&dst, at, value);
                }
                None => {
                    let value = pool_point_f32(&geom, ox, oy, |x, y| ty.load_float(&src, &layout_coords(l, x, y, c, b)));
                    ty.store_float(&dst, at, value);
                }
            }
        };

        if l == DataLayout::Nhwc {
            let vec: usize = defines.get("VEC_SIZE")?;
            let leftover: usize = defines.get("VEC_SIZE_LEFTOVER")?;
            for_each_vector(window, vec, leftover, |mut at, len| {
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
