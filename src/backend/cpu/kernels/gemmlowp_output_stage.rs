//! Int32 to 8/16-bit requantization of GEMMLowp accumulators.
//!
//! Rows are processed 16 columns at a time with a scalar loop for the
//! leftover columns.

use super::{dispatch, for_each_row, RunFn};
use crate::error::KernelError;
use crate::kernel::{Kernel, KernelState};
use crate::ops::gemmlowp::{validate_output_stage, OutputStageParams};
use crate::types::{
    DataType, GemmLowpOutputStageInfo, IntElement, OutputStageType, QuantizationInfo, Steps,
    TensorInfo, TensorPack, TensorSlot, MAX_DIMS,
};
use crate::window::{calculate_max_window, Window};

/// Columns requantized per block.
const WINDOW_STEP_X: usize = 16;

pub struct CpuGemmLowpOutputStageKernel {
    state: KernelState,
    params: Option<OutputStageParams>,
    run_method: Option<RunFn<Self>>,
}

impl CpuGemmLowpOutputStageKernel {
    pub fn new() -> Self {
        Self {
            state: KernelState::new("cpu_gemmlowp_output_stage"),
            params: None,
            run_method: None,
        }
    }

    pub fn validate(
        src: &TensorInfo,
        bias: Option<&TensorInfo>,
        dst: &TensorInfo,
        info: &GemmLowpOutputStageInfo,
    ) -> Result<(), KernelError> {
        validate_output_stage(src, bias, dst, info)
    }

    pub fn configure(
        &mut self,
        src: &TensorInfo,
        bias: Option<&TensorInfo>,
        dst: &mut TensorInfo,
        info: &GemmLowpOutputStageInfo,
    ) -> Result<(), KernelError> {
        self.state.ensure_unconfigured()?;
        Self::validate(src, bias, dst, info)?;
        dst.auto_init_if_empty(*src.shape(), info.output_data_type, QuantizationInfo::default());

        self.run_method = Some(match info.output_data_type {
            DataType::QAsymm8 => Self::run_output_stage::<u8>,
            DataType::QAsymm8Signed => Self::run_output_stage::<i8>,
            _ => Self::run_output_stage::<i16>,
        });
        self.params = Some(OutputStageParams::new(info)?);

        let variant = match info.kind {
            OutputStageType::QuantizeDownFixedPoint => "scale_by_fixedpoint",
            OutputStageType::QuantizeDownFloat => "scale_by_float",
            _ => "scale",
        };
        let name = format!("cpu_gemmlowp_quantize_down_int32_{variant}");
        let config_id = format!(
            "{name}_{}_{}x{}",
            info.output_data_type.to_string().to_lowercase(),
            src.dimension(0),
            src.dimension(1)
        );
        let window = calculate_max_window(src.shape(), &Steps::default());
        self.state.finish(name, config_id, window);
        Ok(())
    }

    fn run_output_stage<T: IntElement>(&self, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| KernelError::NotConfigured(self.state.name().to_string()))?;
        let src = tensors.get_const(TensorSlot::Src0)?;
        let bias = tensors.find_const(TensorSlot::Src2);
        let dst = tensors.get_mut(TensorSlot::Dst0)?;

        let (collapsed, _) = window.collapse_if_possible(self.state.window()?, Window::DIM_Z, MAX_DIMS);
        let x = collapsed.x();
        let bias_at = |col: usize| bias.map_or(0, |b| b.element::<i32>(col));

        for_each_row(&collapsed, |mut at| {
            let mut col = x.start();
            let mut block = [0i32; WINDOW_STEP_X];
            while col + WINDOW_STEP_X <= x.end() {
                for (lane, acc) in block.iter_mut().enumerate() {
                    at[0] = col + lane;
                    *acc = src.get::<i32>(&at);
                }
                for (lane, acc) in block.iter().enumerate() {
                    at[0] = col + lane;
                    let value = params.apply(*acc, bias_at(col + lane), col + lane);
                    dst.set(&at, T::from_i32(value));
                }
                col += WINDOW_STEP_X;
            }
            // Leftover
            for col in col..x.end() {
                at[0] = col;
                let value = params.apply(src.get::<i32>(&at), bias_at(col), col);
                dst.set(&at, T::from_i32(value));
            }
        });
        Ok(())
    }
}

impl Default for CpuGemmLowpOutputStageKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for CpuGemmLowpOutputStageKernel {
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
