// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! `gemmlowp_mm_native`: quantized matrix multiply into int32, with the
//! offset contribution folded into the inner loop.

use std::sync::Arc;

use super::cl_type;
use crate::backend::cl::host::{Defines, HostClRuntime, HostProgram};
use crate::backend::cl::{impl_cl_kernel, BuildOptions, ClKernel, ClRuntime, ClTuning, ConfigId};
use crate::error::KernelError;
use crate::ops::gemmlowp::{mm_dot, validate_mm, GemmLowpMmInfo};
use crate::ops::shape::compute_mm_shape;
use crate::types::{DataType, QuantizationInfo, Steps, TensorInfo, TensorPack, TensorSlot, MAX_DIMS};
use crate::window::{adjust_vec_size, calculate_max_window, Window};

const KERNEL_NAME: &str = "gemmlowp_mm_native";

pub struct ClGemmLowpMatrixMultiplyNativeKernel {
    kernel: ClKernel,
}

impl ClGemmLowpMatrixMultiplyNativeKernel {
    pub fn new(runtime: Arc<dyn ClRuntime>) -> Self {
        Self::with_tuning(runtime, ClTuning::default())
    }

    pub fn with_tuning(runtime: Arc<dyn ClRuntime>, tuning: ClTuning) -> Self {
        Self {
            kernel: ClKernel::new(KERNEL_NAME, runtime, tuning),
        }
    }

    pub fn validate(lhs: &TensorInfo, rhs: &TensorInfo, dst: &TensorInfo) -> Result<(), KernelError> {
        validate_mm(lhs, rhs, dst)
    }

    pub fn configure(&mut self, lhs: &TensorInfo, rhs: &TensorInfo, dst: &mut TensorInfo) -> Result<(), KernelError> {
        self.kernel.ensure_unconfigured()?;
        Self::validate(lhs, rhs, dst)?;
        let shape = compute_mm_shape(lhs, rhs);
        dst.auto_init_if_empty(shape, DataType::S32, QuantizationInfo::default());

        let (m, n, k) = (shape.dim(1), shape.dim(0), lhs.dimension(0));
        let tuning = *self.kernel.tuning();
        let m0 = adjust_vec_size(4, m);
        let n0 = tuning.vec_size(4, n);
        let k0 = tuning.vec_size(16, k);
        let offsets = GemmLowpMmInfo::from_quantization(lhs, rhs);

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
            .define("ACC_DATA_TYPE", "int")
            .define_if(offsets.a_offset != 0, "A_OFFSET", offsets.a_offset)
            .define_if(offsets.b_offset != 0, "B_OFFSET", offsets.b_offset)
            .define_if(rhs.num_dimensions() > 2, "MATRIX_B_DEPTH", rhs.dimension(2));

        let config_id = ConfigId::new(KERNEL_NAME)
            .with(lhs.data_type())
            .with(m)
            .with(n)
            .with(k)
            .with(m0)
            .with(n0);
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

impl_cl_kernel!(ClGemmLowpMatrixMultiplyNativeKernel);

pub(super) fn register(runtime: &HostClRuntime) {
    runtime.register(KERNEL_NAME, Arc::new(MmNativeProgram));
}

struct MmNativeProgram;

impl HostProgram for MmNativeProgram {
    fn required_defines(&self) -> &'static [&'static str] {
        &["K", "M0", "N0", "DATA_TYPE"]
    }

    fn run(&self, defines: &Defines, tensors: &TensorPack<'_>, window: &Window) -> Result<(), KernelError> {
        let k: usize = defines.get("K")?;
        let ty = cl_type(defines, "DATA_TYPE")?;
        let offsets = GemmLowpMmInfo {
            a_offset: defines.get_or("A_OFFSET", 0)?,
            b_offset: defines.get_or("B_OFFSET", 0)?,
        };
        let rhs_batched = defines.has("MATRIX_B_DEPTH");

        let lhs = tensors.get_const(TensorSlot::Src0)?;
        let rhs = tensors.get_const(TensorSlot::Src1)?;
        let dst = tensors.get_mut(TensorSlot::Dst0)?;

        // Blocks are M0 x N0 tiles; the last tile of each axis stores partially
        for block in window.blocks() {
            block.for_each_element(|at| {
                let mut a_at = *at;
                let mut b_at = [0usize; MAX_DIMS];
                b_at[0] = at[0];
                b_at[2] = if rhs_batched { at[2] } else { 0 };
                let acc = mm_dot(
                    k,
                    &offsets,
                    |i| {
                        a_at[0] = i;
                        ty.load_int(&lhs, &a_at)
                    },
                    |i| {
                        b_at[1] = i;
                        ty.load_int(&rhs, &b_at)
                    },
                );
                dst.set(at, acc);
            });
        }
        Ok(())
    }
}
