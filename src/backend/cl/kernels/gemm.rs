// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! `gemm_mm_native`: float matrix multiply with optional `alpha` and a
//! broadcast bias scaled by `beta`.

use std::sync::Arc;

use super::cl_type;
use crate::backend::cl::host::{Defines, HostClRuntime, HostProgram};
use crate::backend::cl::{impl_cl_kernel, BuildOptions, ClKernel, ClRuntime, ClTuning, ConfigId};
use crate::error::KernelError;
use crate::ops::gemm::{finalize, gemm_dot, validate_gemm, GemmInfo};
use crate::ops::shape::compute_mm_shape;
use crate::types::{QuantizationInfo, Steps, TensorInfo, TensorPack, TensorSlot, MAX_DIMS};
use crate::window::{adjust_vec_size, calculate_max_window, Window};

const KERNEL_NAME: &str = "gemm_mm_native";

pub struct ClGemmMatrixMultiplyNativeKernel {
    kernel: ClKernel,
}

impl ClGemmMatrixMultiplyNativeKernel {
    pub fn new(runtime: Arc<dyn ClRuntime>) -> Self {
        Self::with_tuning(runtime, ClTuning::default())
    }

    pub fn with_tuning(runtime: Arc<dyn ClRuntime>, tuning: ClTuning) -> Self {
        Self {
            kernel: ClKernel::new(KERNEL_NAME, runtime, tuning),
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

    /// Bias, when given, is read from `Src2`.
    pub fn configure(
        &mut self,
        lhs: &TensorInfo,
        rhs: &TensorInfo,
        bias: Option<&TensorInfo>,
        dst: &mut TensorInfo,
        info: &GemmInfo,
    ) -> Result<(), KernelError> {
        self.kernel.ensure_unconfigured()?;
        Self::validate(lhs, rhs, bias, dst)?;
        let shape = compute_mm_shape(lhs, rhs);
        dst.auto_init_if_empty(shape, lhs.data_type(), QuantizationInfo::default());

        let (m, n, k) = (shape.dim(1), shape.dim(0), lhs.dimension(0));
        let tuning = *self.kernel.tuning();
        let m0 = adjust_vec_size(4, m);
        let n0 = tuning.vec_size(4, n);
        let k0 = tuning.vec_size(4, k);

        let mut opts = BuildOptions::new();
        opts.define("M", m)
            .define("N", n)
            .define("K", k)
            .define("M0", m0)
            .define("N0", n0)
            .define("K0", k0)
            .define("PARTIAL_STORE_M0", m % m0)
            .define("PARTIAL_STORE_N0", n % n0)
            .define("DATA_TYPE", lhs.data_type().cl_type())
            .define_if(info.alpha != 1.0, "ALPHA", info.alpha)
            .define_if(rhs.num_dimensions() > 2, "MATRIX_B_DEPTH", rhs.dimension(2));
        if bias.is_some() {
            opts.define("BETA", info.beta)
                .flag_if(info.beta == 1.0, "UNIT_BETA")
                .flag("BROADCAST_BIAS");
        }

        let config_id = ConfigId::new(KERNEL_NAME)
            .with(lhs.data_type())
            .with(m)
            .with(n)
            .with(k)
            .with(u8::from(bias.is_some()));
        let window = calculate_max_window(&shape, &Steps::new(&[n0, m0]));
        self.kernel.build(KERNEL_NAME, opts, config_id, window, 3)
    }

    pub fn build_options(&self) -> &BuildOptions {
        self.kernel.build_options()
    }

    pub fn config_id(&self) -> &str {
        self.kernel.config_id()
    }
}

impl_cl_kernel!(ClGemmMatrixMultiplyNativeKernel);

pub(super) fn register(runtime: &HostClRuntime) {
    runtime.register(KERNEL_NAME, Arc::new(GemmNativeProgram));
}

struct GemmNativeProgram;

impl HostProgram for GemmNativeProgram {
    fn required_defines(&self) -> &'static [&'static str] {
        &["K", "M0", "N0", "DATA_TYPE"]
    }

    fn run(&self, defines: &Defines, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let k: usize = defines.get("K")?;
        let ty = cl_type(defines, "DATA_TYPE")?;
        let info = GemmInfo {
            alpha: defines.get_or("ALPHA", 1.0)?,
            beta: if defines.has("UNIT_BETA") { 1.0 } else { defines.get_or("BETA", 1.0)? },
        };
        let rhs_batched = defines.has("MATRIX_B_DEPTH");

        let lhs = tensors.get_const(TensorSlot::Src0)?;
        let rhs = tensors.get_const(TensorSlot::Src1)?;
        let bias = if defines.has("BETA") {
            Some(tensors.get_const(TensorSlot::Src2)?)
        } else {
            None
        };
        let dst = tensors.get_mut(TensorSlot::Dst0)?;

        for block in window.blocks() {
            block.for_each_element(|at| {
                let mut a_at = *at;
                let mut b_at = [0usize; MAX_DIMS];
                b_at[0] = at[0];
                b_at[2] = if rhs_batched { at[2] } else { 0 };
                let acc = gemm_dot(
                    k,
                    |i| {
                        a_at[0] = i;
                        ty.load_float(&lhs, &a_at)
                    },
                    |i| {
                        b_at[1] = i;
                        ty.load_float(&rhs, &b_at)
                    },
                );
                let mut bias_at = [0usize; MAX_DIMS];
                bias_at[0] = at[0];
                let b = bias.as_ref().map(|b| ty.load_float(b, &bias_at));
                ty.store_float(&dst, at, finalize(acc, b, &info));
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cl::HostClRuntime;
    use crate::kernel::{run_configured, Kernel};
    use crate::types::{DataType, Tensor, TensorShape};

    #[test]
    fn test_alpha_beta_bias() {
        let lhs_info = TensorInfo::new(TensorShape::new(&[2, 2]), DataType::F32);
        let rhs_info = TensorInfo::new(TensorShape::new(&[2, 2]), DataType::F32);
        let bias_info = TensorInfo::new(TensorShape::new(&[2]), DataType::F32);
        let lhs = Tensor::from_slice(lhs_info.clone(), &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let rhs = Tensor::from_slice(rhs_info.clone(), &[1.0f32, 0.0, 0.0, 1.0]).unwrap();
        let bias = Tensor::from_slice(bias_info.clone(), &[1.0f32, -1.0]).unwrap();

        let runtime: Arc<dyn ClRuntime> = Arc::new(HostClRuntime::with_builtin_programs());
        let mut kernel = ClGemmMatrixMultiplyNativeKernel::new(runtime);
        let mut dst_info = TensorInfo::empty();
        let info = GemmInfo { alpha: 2.0, beta: 0.5 };
        kernel
            .configure(&lhs_info, &rhs_info, Some(&bias_info), &mut dst_info, &info)
            .unwrap();
        assert_eq!(kernel.name(), "gemm_mm_native");
        assert_eq!(kernel.build_options().get("ALPHA"), Some("2"));
        assert_eq!(kernel.build_options().get("BETA"), Some("0.5"));
        assert!(!kernel.build_options().has_define("UNIT_BETA"));

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
