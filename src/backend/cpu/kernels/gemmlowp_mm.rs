//! Native quantized matrix multiply producing int32 accumulators.

use super::{dispatch, RunFn};
use crate::error::KernelError;
use crate::kernel::{Kernel, KernelState};
use crate::ops::gemmlowp::{mm_dot, validate_mm, GemmLowpMmInfo};
use crate::ops::shape::compute_mm_shape;
use crate::types::{
    DataType, IntElement, QuantizationInfo, Steps, TensorInfo, TensorPack, TensorSlot, MAX_DIMS,
};
use crate::window::{calculate_max_window, Window};

pub struct CpuGemmLowpMatrixMultiplyKernel {
    state: KernelState,
    k: usize,
    rhs_batched: bool,
    offsets: GemmLowpMmInfo,
    run_method: Option<RunFn<Self>>,
}

impl CpuGemmLowpMatrixMultiplyKernel {
    pub fn new() -> Self {
        Self {
            state: KernelState::new("cpu_gemmlowp_mm_native"),
            k: 0,
            rhs_batched: false,
            offsets: GemmLowpMmInfo::default(),
            run_method: None,
        }
    }

    pub fn validate(lhs: &TensorInfo, rhs: &TensorInfo, dst: &TensorInfo) -> Result<(), KernelError> {
        validate_mm(lhs, rhs, dst)
    }

    pub fn configure(&mut self, lhs: &TensorInfo, rhs: &TensorInfo, dst: &mut TensorInfo) -> Result<(), KernelError> {
        self.state.ensure_unconfigured()?;
        Self::validate(lhs, rhs, dst)?;
        let shape = compute_mm_shape(lhs, rhs);
        dst.auto_init_if_empty(shape, DataType::S32, QuantizationInfo::default());

        self.k = lhs.dimension(0);
        self.rhs_batched = rhs.num_dimensions() > 2;
        self.offsets = GemmLowpMmInfo::from_quantization(lhs, rhs);
        self.run_method = Some(if lhs.data_type() == DataType::QAsymm8 {
            Self::run_mm::<u8>
        } else {
            Self::run_mm::<i8>
        });

        let config_id = format!(
            "cpu_gemmlowp_mm_native_{}_{}x{}x{}",
            lhs.data_type().to_string().to_lowercase(),
            shape.dim(1),
            shape.dim(0),
            self.k
        );
        let window = calculate_max_window(&shape, &Steps::default());
        self.state.finish("cpu_gemmlowp_mm_native", config_id, window);
        Ok(())
    }

    fn run_mm<T: IntElement>(&self, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let lhs = tensors.get_const(TensorSlot::Src0)?;
        let rhs = tensors.get_const(TensorSlot::Src1)?;
        let dst = tensors.get_mut(TensorSlot::Dst0)?;

        for block in window.blocks() {
            block.for_each_element(|at| {
                let (x, y, z) = (at[0], at[1], at[2]);
                let mut a_at = *at;
                let mut b_at = [0usize; MAX_DIMS];
                b_at[0] = x;
                b_at[2] = if self.rhs_batched { z } else { 0 };
                let acc = mm_dot(
                    self.k,
                    &self.offsets,
                    |i| {
                        a_at[0] = i;
                        a_at[1] = y;
                        lhs.get::<T>(&a_at).to_i32()
                    },
                    |i| {
                        b_at[1] = i;
                        rhs.get::<T>(&b_at).to_i32()
                    },
                );
                dst.set(at, acc);
            });
        }
        Ok(())
    }
}

impl Default for CpuGemmLowpMatrixMultiplyKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for CpuGemmLowpMatrixMultiplyKernel {
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
