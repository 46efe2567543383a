//! Direct 2D convolution over NCHW or NHWC tensors.

use half::f16;

use super::{dispatch, store_quantized, RunFn};
use crate::error::KernelError;
use crate::kernel::{Kernel, KernelState};
use crate::ops::conv::{
    conv_point_f32, conv_point_quantized, validate_direct_conv, ConvGeometry, Requantize,
};
use crate::ops::shape::{compute_deep_convolution_shape, layout_coords};
use crate::types::{
    ActivationLayerInfo, DataLayout, DataType, FloatElement, IntElement, PadStrideInfo, Steps,
    TensorInfo, TensorPack, TensorSlot,
};
use crate::window::{calculate_max_window, Window};

pub struct CpuDirectConv2dKernel {
    state: KernelState,
    layout: DataLayout,
    geometry: Option<ConvGeometry>,
    channels: usize,
    activation: ActivationLayerInfo,
    requantize: Option<Requantize>,
    run_method: Option<RunFn<Self>>,
}

impl CpuDirectConv2dKernel {
    pub fn new() -> Self {
        Self {
            state: KernelState::new("cpu_direct_conv2d"),
            layout: DataLayout::Nchw,
            geometry: None,
            channels: 0,
            activation: ActivationLayerInfo::disabled(),
            requantize: None,
            run_method: None,
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
        validate_direct_conv(src, weights, biases, dst, conv_info, act)
    }

    pub fn configure(
        &mut self,
        src: &TensorInfo,
        weights: &TensorInfo,
        biases: Option<&TensorInfo>,
        dst: &mut TensorInfo,
        conv_info: &PadStrideInfo,
        act: &ActivationLayerInfo,
    ) -> Result<(), KernelError> {
        self.state.ensure_unconfigured()?;
        Self::validate(src, weights, biases, dst, conv_info, act)?;
        let shape = compute_deep_convolution_shape(src, weights, conv_info)?;
        dst.auto_init_from(src, shape, src.data_type());

        self.layout = src.data_layout();
        self.geometry = Some(ConvGeometry::new(src, weights, conv_info));
        self.channels = src.dimension(self.layout.channel_index());
        self.activation = *act;
        self.run_method = Some(match src.data_type() {
            DataType::F32 => Self::run_float::<f32>,
            DataType::F16 => Self::run_float::<f16>,
            DataType::QAsymm8 => {
                self.requantize = Some(Requantize::new(src, weights, dst, act)?);
                Self::run_quantized::<u8>
            }
            _ => {
                self.requantize = Some(Requantize::new(src, weights, dst, act)?);
                Self::run_quantized::<i8>
            }
        });

        let name = format!("cpu_direct_conv2d_{}", self.layout.kernel_suffix());
        let config_id = format!(
            "{name}_{}_{}x{}_{}",
            src.data_type().to_string().to_lowercase(),
            weights.dimension(self.layout.width_index()),
            weights.dimension(self.layout.height_index()),
            weights.dimension(3)
        );
        let window = calculate_max_window(&shape, &Steps::default());
        self.state.finish(name, config_id, window);
        Ok(())
    }

    fn geometry(&self) -> Result<&ConvGeometry, KernelError> {
        self.geometry
            .as_ref()
            .ok_or_else(|| KernelError::NotConfigured(self.state.name().to_string()))
    }

    /// Split a destination coordinate into `(x, y, channel, batch)`.
    fn output_position(&self, at: &[usize]) -> (usize, usize, usize, usize) {
        let l = self.layout;
        (at[l.width_index()], at[l.height_index()], at[l.channel_index()], at[l.batch_index()])
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
                let (ox, oy, oc, b) = self.output_position(at);
                let acc = conv_point_f32(
                    geom,
                    ox,
                    oy,
                    self.channels,
                    |ix, iy, c| src.get::<T>(&layout_coords(l, ix, iy, c, b)).to_f32(),
                    |kx, ky, c| weights.get::<T>(&layout_coords(l, kx, ky, c, oc)).to_f32(),
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

        for block in window.blocks() {
            block.for_each_element(|at| {
                let (ox, oy, oc, b) = self.output_position(at);
                let acc = conv_point_quantized(
                    geom,
                    ox,
                    oy,
                    self.channels,
                    requant,
                    |ix, iy, c| src.get::<T>(&layout_coords(l, ix, iy, c, b)).to_i32(),
                    |kx, ky, c| weights.get::<T>(&layout_coords(l, kx, ky, c, oc)).to_i32(),
                );
                let bias = bias.map_or(0, |v| v.element::<i32>(oc));
                store_quantized(&dst, at, requant.apply(acc.wrapping_add(bias), oc));
            });
        }
        Ok(())
    }
}

impl Default for CpuDirectConv2dKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for CpuDirectConv2dKernel {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::run_configured;
    use crate::types::{ActivationFunction, QuantizationInfo, Tensor, TensorShape};

    fn run(kernel: &CpuDirectConv2dKernel, src: &Tensor, weights: &Tensor, bias: Option<&Tensor>, dst: &mut Tensor) {
        let mut pack = TensorPack::new()
            .with_const(TensorSlot::Src0, src.view())
            .with_const(TensorSlot::Src1, weights.view());
        if let Some(b) = bias {
            pack.add_const(TensorSlot::Src2, b.view());
        }
        let pack = pack.with_mut(TensorSlot::Dst0, dst.view_mut());
        run_configured(kernel, &pack).unwrap();
    }

    #[test]
    fn test_nchw_box_filter_with_bias() {
        // 3x3 ones over a 4x4 plane of ones, one input and one output channel
        let src_info = TensorInfo::new(TensorShape::new(&[4, 4, 1]), DataType::F32);
        let w_info = TensorInfo::new(TensorShape::new(&[3, 3, 1, 1]), DataType::F32);
        let b_info = TensorInfo::new(TensorShape::new(&[1]), DataType::F32);
        let src = Tensor::from_slice(src_info.clone(), &[1.0f32; 16]).unwrap();
        let weights = Tensor::from_slice(w_info.clone(), &[1.0f32; 9]).unwrap();
        let bias = Tensor::from_slice(b_info.clone(), &[0.5f32]).unwrap();

        let mut dst_info = TensorInfo::empty();
        let mut kernel = CpuDirectConv2dKernel::new();
        kernel
            .configure(
                &src_info,
                &w_info,
                Some(&b_info),
                &mut dst_info,
                &PadStrideInfo::new(1, 1, 1, 1),
                &ActivationLayerInfo::disabled(),
            )
            .unwrap();
        assert_eq!(kernel.name(), "cpu_direct_conv2d_nchw");
        let mut dst = Tensor::new(dst_info);
        run(&kernel, &src, &weights, Some(&bias), &mut dst);

        let out = dst.to_vec::<f32>();
        assert_eq!(out.len(), 16);
        assert_eq!(out[0], 4.5);
        assert_eq!(out[1], 6.5);
        assert_eq!(out[5], 9.5);
    }

    #[test]
    fn test_nhwc_relu_clamps_negative() {
        let src_info = TensorInfo::new(TensorShape::new(&[2, 2, 2]), DataType::F32).with_layout(DataLayout::Nhwc);
        let w_info = TensorInfo::new(TensorShape::new(&[2, 1, 1, 2]), DataType::F32).with_layout(DataLayout::Nhwc);
        let src = Tensor::from_slice(src_info.clone(), &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]).unwrap();
        // kernel 0 sums channels, kernel 1 negates them
        let weights = Tensor::from_slice(w_info.clone(), &[1.0f32, 1.0, -1.0, -1.0]).unwrap();

        let mut dst_info = TensorInfo::empty();
        let mut kernel = CpuDirectConv2dKernel::new();
        let relu = ActivationLayerInfo::new(ActivationFunction::Relu, 0.0, 0.0);
        kernel
            .configure(&src_info, &w_info, None, &mut dst_info, &PadStrideInfo::default(), &relu)
            .unwrap();
        let mut dst = Tensor::new(dst_info);
        run(&kernel, &src, &weights, None, &mut dst);
        assert_eq!(dst.to_vec::<f32>(), vec![3.0, 0.0, 7.0, 0.0, 11.0, 0.0, 15.0, 0.0]);
    }

    #[test]
    fn test_quantized_offsets() {
        let q = QuantizationInfo::new(1.0, 10);
        let src_info = TensorInfo::new(TensorShape::new(&[1, 1, 2]), DataType::QAsymm8).with_quantization(q.clone());
        let w_info = TensorInfo::new(TensorShape::new(&[1, 1, 2, 1]), DataType::QAsymm8)
            .with_quantization(QuantizationInfo::new(1.0, 0));
        let src = Tensor::from_slice(src_info.clone(), &[13u8, 14]).unwrap();
        let weights = Tensor::from_slice(w_info.clone(), &[2u8, 3]).unwrap();

        let mut dst_info = TensorInfo::empty();
        let mut kernel = CpuDirectConv2dKernel::new();
        kernel
            .configure(
                &src_info,
                &w_info,
                None,
                &mut dst_info,
                &PadStrideInfo::default(),
                &ActivationLayerInfo::disabled(),
            )
            .unwrap();
        let mut dst = Tensor::new(dst_info);
        run(&kernel, &src, &weights, None, &mut dst);
        // (3 * 2 + 4 * 3) + dst offset 10
        assert_eq!(dst.to_vec::<u8>(), vec![28]);
    }
}
