//! Row-wise softmax and log-softmax.
//!
//! A CPU thread owns whole rows, so both stages (max/shift/sum, then
//! normalise) run back to back on a row held in a scratch buffer.

use half::f16;

use super::{dispatch, for_each_row, RunFn};
use crate::error::KernelError;
use crate::kernel::{Kernel, KernelState};
use crate::ops::softmax::{softmax_output_quantization, validate_softmax, SoftmaxParams};
use crate::types::{
    DataType, FloatElement, IntElement, SoftmaxInfo, Steps, TensorInfo, TensorPack, TensorSlot,
};
use crate::window::{calculate_max_window, Window};

pub struct CpuSoftmaxKernel {
    state: KernelState,
    params: Option<SoftmaxParams>,
    row_len: usize,
    run_method: Option<RunFn<Self>>,
}

impl CpuSoftmaxKernel {
    pub fn new() -> Self {
        Self {
            state: KernelState::new("cpu_softmax"),
            params: None,
            row_len: 0,
            run_method: None,
        }
    }

    pub fn validate(src: &TensorInfo, dst: &TensorInfo, info: &SoftmaxInfo) -> Result<(), KernelError> {
        validate_softmax(src, dst, info)
    }

    pub fn configure(&mut self, src: &TensorInfo, dst: &mut TensorInfo, info: &SoftmaxInfo) -> Result<(), KernelError> {
        self.state.ensure_unconfigured()?;
        Self::validate(src, dst, info)?;
        let data_type = src.data_type();
        let qinfo = if data_type.is_quantized() {
            softmax_output_quantization(data_type)
        } else {
            src.quantization_info().clone()
        };
        dst.auto_init_if_empty(*src.shape(), data_type, qinfo);

        self.params = Some(SoftmaxParams::new(src, info));
        self.row_len = src.dimension(0);
        self.run_method = Some(match data_type {
            DataType::F32 => Self::run_float::<f32>,
            DataType::F16 => Self::run_float::<f16>,
            DataType::QAsymm8 => Self::run_quantized::<u8>,
            _ => Self::run_quantized::<i8>,
        });

        let op = if info.is_log { "log_softmax" } else { "softmax" };
        let name = format!("cpu_{}_{op}", data_type.to_string().to_lowercase());
        let config_id = format!("{name}_{}", self.row_len);
        let window = calculate_max_window(src.shape(), &Steps::new(&[self.row_len.max(1)]));
        self.state.finish(name, config_id, window);
        Ok(())
    }

    fn params(&self) -> Result<&SoftmaxParams, KernelError> {
        self.params
            .as_ref()
            .ok_or_else(|| KernelError::NotConfigured(self.state.name().to_string()))
    }

    fn run_float<T: FloatElement>(&self, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let params = self.params()?;
        let src = tensors.get_const(TensorSlot::Src0)?;
        let dst = tensors.get_mut(TensorSlot::Dst0)?;
        let mut tmp = vec![0.0f32; self.row_len];

        for_each_row(window, |mut at| {
            let mut max = f32::MIN;
            for (x, slot) in tmp.iter_mut().enumerate() {
                at[0] = x;
                *slot = src.get::<T>(&at).to_f32();
                max = max.max(*slot);
            }
            for slot in tmp.iter_mut() {
                *slot = params.shifted(*slot - max);
            }
            let sum = params.row_sum(&tmp);
            for (x, slot) in tmp.iter().enumerate() {
                at[0] = x;
                dst.set(&at, T::from_f32(params.normalize(*slot, sum)));
            }
        });
        Ok(())
    }

    fn run_quantized<T: IntElement>(&self, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let params = self.params()?;
        let src = tensors.get_const(TensorSlot::Src0)?;
        let dst = tensors.get_mut(TensorSlot::Dst0)?;
        let mut tmp = vec![0.0f32; self.row_len];

        for_each_row(window, |mut at| {
            let mut max = i32::MIN;
            for x in 0..self.row_len {
                at[0] = x;
                max = max.max(src.get::<T>(&at).to_i32());
            }
            for (x, slot) in tmp.iter_mut().enumerate() {
                at[0] = x;
                *slot = params.shifted((src.get::<T>(&at).to_i32() - max) as f32);
            }
            let sum = params.row_sum(&tmp);
            for (x, slot) in tmp.iter().enumerate() {
                at[0] = x;
                dst.set(&at, T::from_i32(params.normalize_quantized(*slot, sum)));
            }
        });
        Ok(())
    }
}

impl Default for CpuSoftmaxKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for CpuSoftmaxKernel {
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
