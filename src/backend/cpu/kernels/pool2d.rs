//! Generic 2D pooling (max, average, L2) for NCHW and NHWC.

use half::f16;

use super::{dispatch, RunFn};
use crate::error::KernelError;
use crate::kernel::{Kernel, KernelState};
use crate::ops::pooling::{pool_point_f32, pool_point_quantized, validate_pooling, PoolGeometry, PoolRequantize};
use crate::ops::shape::{compute_pool_shape, layout_coords, pool_layout};
use crate::quantization::get_min_max_values_from_quantized_data_type;
use crate::types::{
    DataLayout, DataType, FloatElement, IntElement, PoolingLayerInfo, PoolingType, Steps,
    TensorInfo, TensorPack, TensorSlot,
};
use crate::window::{calculate_max_window, Window};

pub struct CpuPool2dKernel {
    state: KernelState,
    layout: DataLayout,
    geometry: Option<PoolGeometry>,
    requantize: Option<PoolRequantize>,
    type_min: i32,
    run_method: Option<RunFn<Self>>,
}

impl CpuPool2dKernel {
    pub fn new() -> Self {
        Self {
            state: KernelState::new("cpu_pool2d"),
            layout: DataLayout::Nchw,
            geometry: None,
            requantize: None,
            type_min: 0,
            run_method: None,
        }
    }

    pub fn validate(src: &TensorInfo, dst: &TensorInfo, info: &PoolingLayerInfo) -> Result<(), KernelError> {
        validate_pooling(src, dst, info)
    }

    pub fn configure(&mut self, src: &TensorInfo, dst: &mut TensorInfo, info: &PoolingLayerInfo) -> Result<(), KernelError> {
        self.state.ensure_unconfigured()?;
        Self::validate(src, dst, info)?;
        let shape = compute_pool_shape(src, info)?;
        dst.auto_init_from(src, shape, src.data_type());

        self.layout = pool_layout(src, info);
        let geom = PoolGeometry::new(src, info);
        self.geometry = Some(geom);
        self.requantize = PoolRequantize::new(src, dst)?;
        if src.data_type().is_quantized() {
            self.type_min = get_min_max_values_from_quantized_data_type(src.data_type())?.0;
        }
        self.run_method = Some(match src.data_type() {
            DataType::F32 => Self::run_float::<f32>,
            DataType::F16 => Self::run_float::<f16>,
            DataType::QAsymm8 => Self::run_quantized::<u8>,
            _ => Self::run_quantized::<i8>,
        });

        let pool = match info.pool_type {
            PoolingType::Max => "max",
            PoolingType::Avg => "avg",
            PoolingType::L2 => "l2",
        };
        let name = format!("cpu_pool2d_{pool}_{}", self.layout.kernel_suffix());
        let config_id = format!(
            "{name}_{}_{}x{}",
            src.data_type().to_string().to_lowercase(),
            geom.pool_width,
            geom.pool_height
        );
        let window = calculate_max_window(&shape, &Steps::default());
        self.state.finish(name, config_id, window);
        Ok(())
    }

    fn geometry(&self) -> Result<&PoolGeometry, KernelError> {
        self.geometry
            .as_ref()
            .ok_or_else(|| KernelError::NotConfigured(self.state.name().to_string()))
    }

    fn run_float<T: FloatElement>(&self, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let geom = self.geometry()?;
        let src = tensors.get_const(TensorSlot::Src0)?;
        let dst = tensors.get_mut(TensorSlot::Dst0)?;
        let l = self.layout;

        for block in window.blocks() {
            block.for_each_element(|at| {
                let (ox, oy, c, b) = (at[l.width_index()], at[l.height_index()], at[l.channel_index()], at[l.batch_index()]);
                let value = pool_point_f32(geom, ox, oy, |x, y| src.get::<T>(&layout_coords(l, x, y, c, b)).to_f32());
                dst.set(at, T::from_f32(value));
            });
        }
        Ok(())
    }

    fn run_quantized<T: IntElement>(&self, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let geom = self.geometry()?;
        let src = tensors.get_const(TensorSlot::Src0)?;
        let dst = tensors.get_mut(TensorSlot::Dst0)?;
        let l = self.layout;

        for block in window.blocks() {
            block.for_each_element(|at| {
                let (ox, oy, c, b) = (at[l.width_index()], at[l.height_index()], at[l.channel_index()], at[l.batch_index()]);
                let pooled = pool_point_quantized(geom, ox, oy, self.type_min, |x, y| {
                    src.get::<T>(&layout_coords(l, x, y, c, b)).to_i32()
                });
                let value = self.requantize.map_or(pooled, |r| r.apply(pooled));
                dst.set(at, T::from_i32(value));
            });
        }
        Ok(())
    }
}

impl Default for CpuPool2dKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for CpuPool2dKernel {
    fn name(&self) -> &str {
        self.state.name()
    }

    fn window(&self) -> Result<&Window, KernelError> {
        self.state.window()
    }

    fn is_configured(&self) -> bool {
        self.state.is_configured()
    }

    fn run(&self, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        dispatch(self, &self.state, self.run_method, tensors, window)
    }
}
