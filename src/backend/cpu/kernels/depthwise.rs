//! Native depthwise convolution for any filter size, stride and depth multiplier.

use half::f16;

use super::{dispatch, store_quantized, RunFn};
use crate::error::KernelError;
use crate::kernel::{Kernel, KernelState};
use crate::ops::conv::{ConvGeometry, Requantize};
use crate::ops::depthwise::{depthwise_point_f32, depthwise_point_quantized, validate_depthwise, DepthwiseInfo};
use crate::ops::shape::{compute_depthwise_convolution_shape, layout_coords};
use crate::types::{
    ActivationLayerInfo, DataLayout, DataType, FloatElement, IntElement, Steps, TensorInfo,
    TensorPack, TensorSlot,
};
use crate::window::{calculate_max_window, Window};

pub struct CpuDepthwiseConv2dNativeKernel {
    state: KernelState,
    layout: DataLayout,
    geometry: Option<ConvGeometry>,
    depth_multiplier: usize,
    activation: ActivationLayerInfo,
    requantize: Option<Requantize>,
    per_channel_weights: bool,
    run_method: Option<RunFn<Self>>,
}

impl CpuDepthwiseConv2dNativeKernel {
    pub fn new() -> Self {
        Self {
            state: KernelState::new("cpu_depthwise_conv2d_native"),
            layout: DataLayout::Nchw,
            geometry: None,
            depth_multiplier: 1,
            activation: ActivationLayerInfo::disabled(),
            requantize: None,
            per_channel_weights: false,
            run_method: None,
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
        self.state.ensure_unconfigured()?;
        Self::validate(src, weights, biases, dst, info)?;
        let shape = compute_depthwise_convolution_shape(src, weights, &info.pad_stride, info.depth_multiplier)?;
        dst.auto_init_from(src, shape, src.data_type());

        self.layout = src.data_layout();
        self.geometry = Some(ConvGeometry::new(src, weights, &info.pad_stride));
        self.depth_multiplier = info.depth_multiplier;
        self.activation = info.activation;
        self.per_channel_weights = weights.data_type() == DataType::QSymm8PerChannel;
        if src.data_type().is_quantized() {
            self.requantize = Some(Requantize::new(src, weights, dst, &info.activation)?);
        }
        self.run_method = Some(match src.data_type() {
            DataType::F32 => Self::run_float::<f32>,
            DataType::F16 => Self::run_float::<f16>,
            DataType::QAsymm8 => Self::run_quantized::<u8>,
            _ => Self::run_quantized::<i8>,
        });

        let config_id = format!(
            "cpu_depthwise_conv2d_native_{}_{}_{}x{}_dm{}",
            self.layout.kernel_suffix(),
            src.data_type().to_string().to_lowercase(),
            weights.dimension(self.layout.width_index()),
            weights.dimension(self.layout.height_index()),
            info.depth_multiplier
        );
        let window = calculate_max_window(&shape, &Steps::default());
        self.state.finish("cpu_depthwise_conv2d_native", config_id, window);
        Ok(())
    }

    fn geometry(&self) -> Result<&ConvGeometry, KernelError> {
        self.geometry
            .as_ref()
            .ok_or_else(|| KernelError::NotConfigured(self.state.name().to_string()))
    }

    fn run_float<T: FloatElement>(&self, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let geom = self.geometry()?;
        let src = tensors.get_const(TensorSlot::Src0)?;
        let weights = tensors.get_const(TensorSlot::Src1)?;
        let bias = tensors.find_const(TensorSlot::Src2);
        let dst = tensors.get_mut(TensorSlot::Dst0)?;
        let l = self.layout;

        for block in window.blocks() {
            block.for_each_element(|at| {
                let (ox, oy, oc, b) = (at[l.width_index()], at[l.height_index()], at[l.channel_index()], at[l.batch_index()]);
                let ic = oc / self.depth_multiplier;
                let acc = depthwise_point_f32(
                    geom,
                    ox,
                    oy,
                    |ix, iy| src.get::<T>(&layout_coords(l, ix, iy, ic, b)).to_f32(),
                    |kx, ky| weights.get::<T>(&layout_coords(l, kx, ky, oc, 0)).to_f32(),
                );
                let bias = bias.map_or(0.0, |v| v.element::<T>(oc).to_f32());
                dst.set(at, T::from_f32(self.activation.apply(acc + bias)));
            });
        }
        Ok(())
    }

    fn run_quantized<T: IntElement>(&self, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let geom = self.geometry()?;
        let requant = self
            .requantize
            .as_ref()
            .ok_or_else(|| KernelError::NotConfigured(self.state.name().to_string()))?;
        let src = tensors.get_const(TensorSlot::Src0)?;
        let weights = tensors.get_const(TensorSlot::Src1)?;
        let bias = tensors.find_const(TensorSlot::Src2);
        let dst = tensors.get_mut(TensorSlot::Dst0)?;
        let l = self.layout;
        let weight = |kx: usize, ky: usize, oc: usize| -> i32 {
            let at = layout_coords(l, kx, ky, oc, 0);
            if self.per_channel_weights {
                weights.get::<i8>(&at) as i32
            } else {
                weights.get::<T>(&at).to_i32()
            }
        };

        for block in window.blocks() {
            block.for_each_element(|at| {
                let (ox, oy, oc, b) = (at[l.width_index()], at[l.height_index()], at[l.channel_index()], at[l.batch_index()]);
                let ic = oc / self.depth_multiplier;
                let acc = depthwise_point_quantized(
                    geom,
                    ox,
                    oy,
                    requant,
                    |ix, iy| src.get::<T>(&layout_coords(l, ix, iy, ic, b)).to_i32(),
                    |kx, ky| weight(kx, ky, oc),
                );
                let bias = bias.map_or(0, |v| v.element::<i32>(oc));
                store_quantized(&dst, at, requant.apply(acc.wrapping_add(bias), oc));
            });
        }
        Ok(())
    }
}

impl Default for CpuDepthwiseConv2dNativeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for CpuDepthwiseConv2dNativeKernel {
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
