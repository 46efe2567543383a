// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! `kernel output-stage`: dump the program a device output stage compiles.

use std::sync::Arc;

use serde_json::{json, Value};

use super::{EXIT_FAILURE, EXIT_OK};
use crate::backend::cl::kernels::ClGemmLowpOutputStageKernel;
use crate::backend::cl::{ClRuntime, ClTuning, HostClRuntime};
use crate::config::ComputeConfig;
use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::quantization::calculate_quantized_multiplier;
use crate::types::{DataType, GemmLowpOutputStageInfo, TensorInfo, TensorShape};

/// Request for a fixed-point output stage over a `cols x rows` accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputStageRequest {
    pub cols: usize,
    pub rows: usize,
    pub real_multiplier: f64,
    pub offset: i32,
    pub output_data_type: DataType,
}

impl OutputStageRequest {
    /// Parse `<cols> <rows> <real> [--offset N] [--type T]`.
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let positional = |i: usize, what: &str| -> Result<&str, String> {
            args.get(i).map(String::as_str).ok_or_else(|| format!("missing {what}"))
        };
        let cols = positional(0, "<cols>")?
            .parse()
            .map_err(|e| format!("invalid <cols>: {e}"))?;
        let rows = positional(1, "<rows>")?
            .parse()
            .map_err(|e| format!("invalid <rows>: {e}"))?;
        let real_multiplier = positional(2, "<real>")?
            .parse()
            .map_err(|e| format!("invalid <real>: {e}"))?;
        let offset = match super::flag_value(args, "--offset") {
            Some(v) => v.parse().map_err(|e| format!("invalid --offset: {e}"))?,
            None => 0,
        };
        let output_data_type = match super::flag_value(args, "--type") {
            Some(v) => v.parse()?,
            None => DataType::QAsymm8,
        };
        Ok(Self {
            cols,
            rows,
            real_multiplier,
            offset,
            output_data_type,
        })
    }
}

/// Configure the device kernel on the host runtime and describe what it built.
pub fn describe(request: &OutputStageRequest, tuning: ClTuning) -> Result<Value, KernelError> {
    let quantized = calculate_quantized_multiplier(request.real_multiplier, false)?;
    let info = GemmLowpOutputStageInfo::fixed_point(
        request.output_data_type,
        quantized.multiplier,
        quantized.shift,
        request.offset,
    );
    let src = TensorInfo::new(TensorShape::new(&[request.cols, request.rows]), DataType::S32);
    let mut dst = TensorInfo::empty();

    let runtime: Arc<dyn ClRuntime> = Arc::new(HostClRuntime::with_builtin_programs());
    let mut kernel = ClGemmLowpOutputStageKernel::with_tuning(runtime, tuning);
    kernel.configure(&src, None, &mut dst, &info)?;
    let options: Vec<&str> = kernel.build_options().options().collect();
    Ok(json!({
        "kernel": kernel.name(),
        "config_id": kernel.config_id(),
        "build_options": options,
        "window": kernel.window()?.to_string(),
    }))
}

pub fn run(args: &[String], config: &ComputeConfig) -> i32 {
    match args.first().map(String::as_str) {
        Some("output-stage") => {}
        other => {
            eprintln!("Unknown kernel: {}", other.unwrap_or("<none>"));
            eprintln!("Usage: gg-compute-cli kernel output-stage <cols> <rows> <real> [--offset N] [--type T]");
            return EXIT_FAILURE;
        }
    }
    let request = match OutputStageRequest::parse(&args[1..]) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{e}");
            return EXIT_FAILURE;
        }
    };
    match describe(&request, config.cl) {
        Ok(value) => {
            println!("{value:#}");
            EXIT_OK
        }
        Err(e) => {
            eprintln!("{e}");
            EXIT_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_request() {
        let request = OutputStageRequest::parse(&args(&["17", "4", "0.25", "--type", "qasymm8_signed", "--offset", "-5"]))
            .unwrap();
        assert_eq!(request.cols, 17);
        assert_eq!(request.rows, 4);
        assert_eq!(request.offset, -5);
        assert_eq!(request.output_data_type, DataType::QAsymm8Signed);
        assert!(OutputStageRequest::parse(&args(&["17"])).is_err());
        assert!(OutputStageRequest::parse(&args(&["17", "4", "x"])).is_err());
    }

    #[test]
    fn test_describe_reports_build_options() {
        let request = OutputStageRequest::parse(&args(&["17", "4", "0.25"])).unwrap();
        let value = describe(&request, ClTuning::default()).unwrap();
        assert_eq!(value["kernel"], "gemmlowp_output_stage_quantize_down_fixedpoint");
        let options: Vec<String> = value["build_options"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert!(options.contains(&"-DVEC_SIZE=4".to_string()));
        assert!(options.contains(&"-DVEC_SIZE_LEFTOVER=1".to_string()));
        assert!(options.contains(&"-DRESULT_SHIFT=1".to_string()));
    }

    #[test]
    fn test_run_unknown_kernel() {
        assert_eq!(run(&args(&["softmax"]), &ComputeConfig::default()), EXIT_FAILURE);
    }
}
