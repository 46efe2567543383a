//! Native floating-point matrix multiply.

use half::f16;

use super::{dispatch, RunFn};
use crate::error::KernelError;
use crate::kernel::{Kernel, KernelState};
use crate::ops::gemm::{finalize, gemm_dot, validate_gemm, GemmInfo};
use crate::ops::shape::compute_mm_shape;
use crate::types::{
    DataType, FloatElement, QuantizationInfo, Steps, TensorInfo, TensorPack, TensorSlot, MAX_DIMS,
};
use crate::window::{calculate_max_window, Window};

pub struct CpuGemmMatrixMultiplyKernel {
    state: KernelState,
    info: GemmInfo,
    k: usize,
    rhs_batched: bool,
    run_method: Option<RunFn<Self>>,
}

impl CpuGemmMatrixMultiplyKernel {
    pub fn new() -> Self {
        Self {
            state: KernelState::new("cpu_gemm_native"),
            info: GemmInfo::default(),
            k: 0,
            rhs_batched: false,
            run_method: None,
        }
    }

    pub fn validate(
        lhs: &TensorInfo,
        rhs: &TensorInfo,
        bias: Option<&TensorInfo>,
        dst: &TensorInfo,
    ) -> Result<(), KernelError> {
        validate_gemm(lhs, rhs, bias, dst)
    }

    pub fn configure(
        &mut self,
        lhs: &TensorInfo,
        rhs: &TensorInfo,
        bias: Option<&TensorInfo>,
        dst: &mut TensorInfo,
        info: &GemmInfo,
    ) -> Result<(), KernelError> {
        self.state.ensure_unconfigured()?;
        Self::validate(lhs, rhs, bias, dst)?;
        let shape = compute_mm_shape(lhs, rhs);
        dst.auto_init_if_empty(shape, lhs.data_type(), QuantizationInfo::default());

        self.info = *info;
        self.k = lhs.dimension(0);
        self.rhs_batched = rhs.num_dimensions() > 2;
        self.run_method = Some(match lhs.data_type() {
            DataType::F16 => Self::run_gemm::<f16>,
            _ => Self::run_gemm::<f32>,
        });

        let config_id = format!(
            "cpu_gemm_native_{}_{}x{}x{}",
            lhs.data_type().to_string().to_lowercase(),
            shape.dim(1),
            shape.dim(0),
            self.k
        );
        let window = calculate_max_window(&shape, &Steps::default());
        self.state.finish("cpu_gemm_native", config_id, window);
        Ok(())
    }

    fn run_gemm<T: FloatElement>(&self, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let lhs = tensors.get_const(TensorSlot::Src0)?;
        let rhs = tensors.get_const(TensorSlot::Src1)?;
        let bias = tensors.find_const(TensorSlot::Src2);
        let dst = tensors.get_mut(TensorSlot::Dst0)?;

        for block in window.blocks() {
            block.for_each_element(|at| {
                let mut a_at = *at;
                let mut b_at = [0usize; MAX_DIMS];
                b_at[0] = at[0];
                b_at[2] = if self.rhs_batched { at[2] } else { 0 };
                let acc = gemm_dot(
                    self.k,
                    |i| {
                        a_at[0] = i;
                        lhs.get::<T>(&a_at).to_f32()
                    },
                    |i| {
                        b_at[1] = i;
                        rhs.get::<T>(&b_at).to_f32()
                    },
                );
                let b = bias.map(|b| b.element::<T>(at[0]).to_f32());
                dst.set(at, T::from_f32(finalize(acc, b, &self.info)));
            });
        }
        Ok(())
    }
}

impl Default for CpuGemmMatrixMultiplyKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for CpuGemmMatrixMultiplyKernel {
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
    use crate::types::{Tensor, TensorShape};

    #[test]
    fn test_alpha_beta_bias() {
        let lhs_info = TensorInfo::new(TensorShape::new(&[2, 2]), DataType::F32);
        let rhs_info = TensorInfo::new(TensorShape::new(&[2, 2]), DataType::F32);
        let bias_info = TensorInfo::new(TensorShape::new(&[2]), DataType::F32);
        let lhs = Tensor::from_slice(lhs_info.clone(), &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let rhs = Tensor::from_slice(rhs_info.clone(), &[1.0f32, 0.0, 0.0, 1.0]).unwrap();
        let bias = Tensor::from_slice(bias_info.clone(), &[1.0f32, -1.0]).unwrap();

        let mut dst_info = TensorInfo::empty();
        let mut kernel = CpuGemmMatrixMultiplyKernel::new();
        let info = GemmInfo { alpha: 2.0, beta: 0.5 };
        kernel
            .configure(&lhs_info, &rhs_info, Some(&bias_info), &mut dst_info, &info)
            .unwrap();
        let mut dst = Tensor::new(dst_info);
        let pack = TensorPack::new()
            .with_const(TensorSlot::Src0, lhs.view())
            .with_const(TensorSlot::Src1, rhs.view())
            .with_const(TensorSlot::Src2, bias.view())
            .with_mut(TensorSlot::Dst0, dst.view_mut());
        run_configured(&kernel, &pack).unwrap();
        drop(pack);

        assert_eq!(dst.to_vec::<f32>(), vec![2.5, 3.5, 6.5, 7.5]);
    }
}
