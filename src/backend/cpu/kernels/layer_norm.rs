//! QSYMM16 layer normalisation, one row per window iteration.

use super::{dispatch, for_each_row, RunFn};
use crate::error::KernelError;
use crate::kernel::{Kernel, KernelState};
use crate::ops::layer_norm::{normalize_row, output_multiplier, validate_layer_norm};
use crate::quantization::QuantizedMultiplier;
use crate::types::{DataType, Steps, TensorInfo, TensorPack, TensorSlot};
use crate::window::{calculate_max_window, Window};

pub struct CpuQLayerNormKernel {
    state: KernelState,
    output: QuantizedMultiplier,
    width: usize,
    run_method: Option<RunFn<Self>>,
}

impl CpuQLayerNormKernel {
    pub fn new() -> Self {
        Self {
            state: KernelState::new("cpu_qlayer_norm"),
            output: QuantizedMultiplier::default(),
            width: 0,
            run_method: None,
        }
    }

    pub fn validate(
        src: &TensorInfo,
        weight: &TensorInfo,
        bias: &TensorInfo,
        dst: &TensorInfo,
    ) -> Result<(), KernelError> {
        validate_layer_norm(src, weight, bias, dst)
    }

    /// Weight is read from `Src1` and bias from `Src2` at run time.
    pub fn configure(
        &mut self,
        src: &TensorInfo,
        weight: &TensorInfo,
        bias: &TensorInfo,
        dst: &mut TensorInfo,
    ) -> Result<(), KernelError> {
        self.state.ensure_unconfigured()?;
        Self::validate(src, weight, bias, dst)?;
        dst.auto_init_from(src, *src.shape(), DataType::QSymm16);

        self.output = output_multiplier(weight, dst)?;
        self.width = src.dimension(0);
        self.run_method = Some(Self::run_rows);

        let config_id = format!("cpu_qlayer_norm_{}x{}", self.width, src.dimension(1));
        let window = calculate_max_window(src.shape(), &Steps::new(&[self.width.max(1)]));
        self.state.finish("cpu_qlayer_norm", config_id, window);
        Ok(())
    }

    fn run_rows(&self, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let src = tensors.get_const(TensorSlot::Src0)?;
        let weight_view = tensors.get_const(TensorSlot::Src1)?;
        let bias_view = tensors.get_const(TensorSlot::Src2)?;
        let dst = tensors.get_mut(TensorSlot::Dst0)?;

        let weight: Vec<i16> = weight_view.to_vec();
        let bias: Vec<i32> = bias_view.to_vec();
        let mut row = vec![0i16; self.width];
        let mut out = vec![0i16; self.width];

        for_each_row(window, |mut at| {
            for (x, v) in row.iter_mut().enumerate() {
                at[0] = x;
                *v = src.get(&at);
            }
            normalize_row(&row, &weight, &bias, self.output, &mut out);
            for (x, v) in out.iter().enumerate() {
                at[0] = x;
                dst.set(&at, *v);
            }
        });
        Ok(())
    }
}

impl Default for CpuQLayerNormKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for CpuQLayerNormKernel {
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
    use crate::types::{QuantizationInfo, Tensor, TensorShape};

    fn q16(shape: &[usize], scale: f64) -> TensorInfo {
        TensorInfo::new(TensorShape::new(shape), DataType::QSymm16)
            .with_quantization(QuantizationInfo::new(scale, 0))
    }

    #[test]
    fn test_constant_rows_produce_bias() {
        let src = Tensor::from_slice(q16(&[3, 2], 1.0 / 1024.0), &[7i16, 7, 7, -2, -2, -2]).unwrap();
        let weight = Tensor::from_slice(q16(&[3], 1.0 / 1024.0), &[1024i16; 3]).unwrap();
        let bias_info = TensorInfo::new(TensorShape::new(&[3]), DataType::S32);
        let bias = Tensor::from_slice(bias_info, &[5120i32, -5120, 0]).unwrap();

        let mut dst_info = TensorInfo::empty();
        let mut kernel = CpuQLayerNormKernel::new();
        kernel
            .configure(src.info(), weight.info(), bias.info(), &mut dst_info)
            .unwrap();
        assert_eq!(kernel.window().unwrap().num_iterations(Window::DIM_Y), 2);

        let mut dst = Tensor::new(dst_info);
        let pack = TensorPack::new()
            .with_const(TensorSlot::Src0, src.view())
            .with_const(TensorSlot::Src1, weight.view())
            .with_const(TensorSlot::Src2, bias.view())
            .with_mut(TensorSlot::Dst0, dst.view_mut());
        run_configured(&kernel, &pack).unwrap();
        drop(pack);
        assert_eq!(dst.to_vec::<i16>(), vec![5, -5, 0, 5, -5, 0]);
    }
}
