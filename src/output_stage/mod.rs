//! Requantization operators.
//!
//! [`compose_output_stage`] derives the output-stage constants from the
//! quantization of the tensors involved. [`GemmLowpOutputStage`] runs the
//! int32 to 8/16-bit stage on its own, and [`QuantizedGemm`] chains it behind
//! the quantized matrix multiply, fusing both into one micro-kernel when the
//! CPU target allows it.

use tracing::debug;

use crate::backend::cl::kernels::{ClGemmLowpMatrixMultiplyNativeKernel, ClGemmLowpOutputStageKernel};
use crate::backend::cpu::assembly::{AsmKernel, CpuGemmAssemblyKernel};
use crate::backend::cpu::kernels::{CpuGemmLowpMatrixMultiplyKernel, CpuGemmLowpOutputStageKernel};
use crate::backend::cpu::CpuScheduler;
use crate::backend::{BackendKind, ExecutionTarget};
use crate::error::KernelError;
use crate::kernel::{run_configured, Kernel};
use crate::ops::shape::compute_mm_shape;
use crate::quantization::{calculate_quantized_multipliers, get_quantized_activation_min_max};
use crate::types::{
    ActivationLayerInfo, DataType, GemmLowpOutputStageInfo, OutputStageType, QuantizationInfo, Tensor,
    TensorInfo, TensorPack, TensorSlot,
};

/// Output-stage constants for `src * weights -> dst`.
///
/// `dst` supplies the output type, zero point and scale; `activation` narrows
/// the clamp bounds. The integer variant has no derivation from scales and is
/// rejected; build its [`GemmLowpOutputStageInfo`] by hand.
pub fn compose_output_stage(
    kind: OutputStageType,
    src: &QuantizationInfo,
    weights: &QuantizationInfo,
    dst: &TensorInfo,
    activation: &ActivationLayerInfo,
) -> Result<GemmLowpOutputStageInfo, KernelError> {
    let dst_q = dst.quantization_info().uniform();
    let (min, max) = get_quantized_activation_min_max(activation, dst.data_type(), &dst_q)?;
    let mut info = GemmLowpOutputStageInfo {
        kind,
        output_data_type: dst.data_type(),
        gemmlowp_offset: dst_q.offset,
        gemmlowp_min_bound: min,
        gemmlowp_max_bound: max,
        ..GemmLowpOutputStageInfo::default()
    };

    match kind {
        OutputStageType::QuantizeDownFixedPoint => {
            calculate_quantized_multipliers(src, weights, dst.quantization_info(), &mut info)?;
        }
        OutputStageType::QuantizeDownFloat => {
            if weights.is_per_channel() {
                return Err(KernelError::InvalidArgument(
                    "float requantization takes a single weight scale".to_string(),
                ));
            }
            let ratio = src.uniform().scale * weights.uniform().scale / dst_q.scale;
            if !(ratio.is_finite() && ratio > 0.0) {
                return Err(KernelError::InvalidArgument(format!(
                    "rescale factor {ratio} is not positive"
                )));
            }
            info.gemmlowp_real_multiplier = ratio as f32;
        }
        OutputStageType::QuantizeDown => {
            return Err(KernelError::InvalidArgument(
                "integer requantization needs an explicit multiplier and shift".to_string(),
            ))
        }
        OutputStageType::None => {
            return Err(KernelError::InvalidArgument(
                "output stage type must be set".to_string(),
            ))
        }
    }
    Ok(info)
}

/// A configured kernel and how to launch it.
struct Launch {
    kernel: Box<dyn Kernel>,
    scheduler: Option<CpuScheduler>,
}

impl Launch {
    fn run(&self, tensors: &TensorPack<'_>) -> Result<(), KernelError> {
        match &self.scheduler {
            Some(scheduler) => scheduler.schedule(self.kernel.as_ref(), tensors),
            None => run_configured(self.kernel.as_ref(), tensors),
        }
    }
}

/// Int32 accumulators to quantized values on the chosen backend.
#[derive(Default)]
pub struct GemmLowpOutputStage {
    launch: Option<Launch>,
    backend: BackendKind,
}

impl GemmLowpOutputStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(
        target: &ExecutionTarget,
        src: &TensorInfo,
        bias: Option<&TensorInfo>,
        dst: &TensorInfo,
        info: &GemmLowpOutputStageInfo,
    ) -> Result<(), KernelError> {
        match target {
            ExecutionTarget::Cpu { .. } => CpuGemmLowpOutputStageKernel::validate(src, bias, dst, info),
            ExecutionTarget::OpenCl { .. } => ClGemmLowpOutputStageKernel::validate(src, bias, dst, info),
        }
    }

    /// The CPU backend has no stand-alone micro-kernel for this stage, so
    /// `allow_assembly` does not change the choice here.
    pub fn configure(
        &mut self,
        target: &ExecutionTarget,
        src: &TensorInfo,
        bias: Option<&TensorInfo>,
        dst: &mut TensorInfo,
        info: &GemmLowpOutputStageInfo,
    ) -> Result<(), KernelError> {
        if self.launch.is_some() {
            return Err(KernelError::AlreadyConfigured("gemmlowp_output_stage".to_string()));
        }
        self.launch = Some(configure_stage(target, src, bias, dst, info)?);
        self.backend = target.kind();
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.launch.is_some()
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Name of the configured kernel.
    pub fn kernel_name(&self) -> Option<&str> {
        self.launch.as_ref().map(|l| l.kernel.name())
    }

    pub fn run(&self, src: &Tensor, bias: Option<&Tensor>, dst: &mut Tensor) -> Result<(), KernelError> {
        let launch = self
            .launch
            .as_ref()
            .ok_or_else(|| KernelError::NotConfigured("gemmlowp_output_stage".to_string()))?;
        let mut pack = TensorPack::new();
        pack.add_const(TensorSlot::Src0, src.view());
        if let Some(bias) = bias {
            pack.add_const(TensorSlot::Src2, bias.view());
        }
        pack.add_mut(TensorSlot::Dst0, dst.view_mut());
        launch.run(&pack)
    }
}

fn configure_stage(
    target: &ExecutionTarget,
    src: &TensorInfo,
    bias: Option<&TensorInfo>,
    dst: &mut TensorInfo,
    info: &GemmLowpOutputStageInfo,
) -> Result<Launch, KernelError> {
    let launch = match target {
        ExecutionTarget::Cpu { scheduler, .. } => {
            let mut kernel = CpuGemmLowpOutputStageKernel::new();
            kernel.configure(src, bias, dst, info)?;
            Launch {
                kernel: Box::new(kernel),
                scheduler: Some(scheduler.clone()),
            }
        }
        ExecutionTarget::OpenCl { runtime, tuning } => {
            let mut kernel = ClGemmLowpOutputStageKernel::with_tuning(runtime.clone(), *tuning);
            kernel.configure(src, bias, dst, info)?;
            Launch {
                kernel: Box::new(kernel),
                scheduler: None,
            }
        }
    };
    debug!(kernel = launch.kernel.name(), backend = %target.kind(), "output stage configured");
    Ok(launch)
}

enum GemmPlan {
    /// Multiply and requantize in one pass over the micro-kernel.
    Fused {
        kernel: CpuGemmAssemblyKernel,
        scheduler: CpuScheduler,
    },
    /// Multiply into an int32 workspace, then run the output stage.
    TwoPass {
        mm: Launch,
        stage: Launch,
        accumulator: TensorInfo,
    },
}

/// Quantized matrix multiply followed by the output stage.
#[derive(Default)]
pub struct QuantizedGemm {
    plan: Option<GemmPlan>,
    backend: BackendKind,
}

impl QuantizedGemm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(
        target: &ExecutionTarget,
        lhs: &TensorInfo,
        rhs: &TensorInfo,
        bias: Option<&TensorInfo>,
        dst: &TensorInfo,
        info: &GemmLowpOutputStageInfo,
    ) -> Result<(), KernelError> {
        match target {
            ExecutionTarget::Cpu { .. } => {
                CpuGemmLowpMatrixMultiplyKernel::validate(lhs, rhs, &TensorInfo::empty())?
            }
            ExecutionTarget::OpenCl { .. } => {
                ClGemmLowpMatrixMultiplyNativeKernel::validate(lhs, rhs, &TensorInfo::empty())?
            }
        }
        let accumulator = TensorInfo::new(compute_mm_shape(lhs, rhs), DataType::S32);
        GemmLowpOutputStage::validate(target, &accumulator, bias, dst, info)
    }

    pub fn configure(
        &mut self,
        target: &ExecutionTarget,
        lhs: &TensorInfo,
        rhs: &TensorInfo,
        bias: Option<&TensorInfo>,
        dst: &mut TensorInfo,
        info: &GemmLowpOutputStageInfo,
    ) -> Result<(), KernelError> {
        if self.plan.is_some() {
            return Err(KernelError::AlreadyConfigured("quantized_gemm".to_string()));
        }
        Self::validate(target, lhs, rhs, bias, dst, info)?;

        if let ExecutionTarget::Cpu {
            scheduler,
            cpu,
            allow_assembly: true,
        } = target
        {
            let mut kernel = CpuGemmAssemblyKernel::new();
            kernel.configure(lhs, rhs, bias, dst, Some(info), cpu)?;
            if kernel.is_configured() {
                debug!(kernel = kernel.name(), "quantized gemm fused on the micro-kernel");
                self.plan = Some(GemmPlan::Fused {
                    kernel,
                    scheduler: scheduler.clone(),
                });
                self.backend = BackendKind::Cpu;
                return Ok(());
            }
        }

        let mut accumulator = TensorInfo::empty();
        let mm = match target {
            ExecutionTarget::Cpu { scheduler, .. } => {
                let mut kernel = CpuGemmLowpMatrixMultiplyKernel::new();
                kernel.configure(lhs, rhs, &mut accumulator)?;
                Launch {
                    kernel: Box::new(kernel),
                    scheduler: Some(scheduler.clone()),
                }
            }
            ExecutionTarget::OpenCl { runtime, tuning } => {
                let mut kernel = ClGemmLowpMatrixMultiplyNativeKernel::with_tuning(runtime.clone(), *tuning);
                kernel.configure(lhs, rhs, &mut accumulator)?;
                Launch {
                    kernel: Box::new(kernel),
                    scheduler: None,
                }
            }
        };
        let stage = configure_stage(target, &accumulator, bias, dst, info)?;
        self.plan = Some(GemmPlan::TwoPass {
            mm,
            stage,
            accumulator,
        });
        self.backend = target.kind();
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.plan.is_some()
    }

    /// True when the multiply and requantization run as one micro-kernel.
    pub fn is_fused(&self) -> bool {
        matches!(self.plan, Some(GemmPlan::Fused { .. }))
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn run(
        &self,
        lhs: &Tensor,
        rhs: &Tensor,
        bias: Option<&Tensor>,
        dst: &mut Tensor,
    ) -> Result<(), KernelError> {
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| KernelError::NotConfigured("quantized_gemm".to_string()))?;
        match plan {
            GemmPlan::Fused { kernel, scheduler } => {
                let mut pack = TensorPack::new();
                pack.add_const(TensorSlot::Src0, lhs.view())
                    .add_const(TensorSlot::Src1, rhs.view());
                if let Some(bias) = bias {
                    pack.add_const(TensorSlot::Src2, bias.view());
                }
                pack.add_mut(TensorSlot::Dst0, dst.view_mut());
                scheduler.run_asm(kernel, &pack)
            }
            GemmPlan::TwoPass {
                mm,
                stage,
                accumulator,
            } => {
                let mut acc = Tensor::new(accumulator.clone());
                {
                    let pack = TensorPack::new()
                        .with_const(TensorSlot::Src0, lhs.view())
                        .with_const(TensorSlot::Src1, rhs.view())
                        .with_mut(TensorSlot::Dst0, acc.view_mut());
                    mm.run(&pack)?;
                }
                let mut pack = TensorPack::new();
                pack.add_const(TensorSlot::Src0, acc.view());
                if let Some(bias) = bias {
                    pack.add_const(TensorSlot::Src2, bias.view());
                }
                pack.add_mut(TensorSlot::Dst0, dst.view_mut());
                stage.run(&pack)
            }
        }
    }
}
