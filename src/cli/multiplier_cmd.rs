// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! `multiplier <real>`: show how a real rescale factor is encoded.

use serde_json::{json, Value};

use super::{EXIT_FAILURE, EXIT_OK};
use crate::error::KernelError;
use crate::quantization::{calculate_quantized_multiplier, calculate_quantized_multiplier_less_than_one};

/// Encoding of `real` as JSON: the general pair, the value it represents
/// and, for sub-unit reals, the right-shift-only pair.
pub fn describe(real: f64) -> Result<Value, KernelError> {
    let quantized = calculate_quantized_multiplier(real, false)?;
    let mut out = json!({
        "real": real,
        "multiplier": quantized.multiplier,
        "shift": quantized.shift,
        "represented": quantized.to_real(),
    });
    if real <= 1.0 {
        let (multiplier, right_shift) = calculate_quantized_multiplier_less_than_one(real, false)?;
        out["less_than_one"] = json!({ "multiplier": multiplier, "right_shift": right_shift });
    }
    Ok(out)
}

pub fn run(arg: Option<&str>) -> i32 {
    let Some(arg) = arg else {
        eprintln!("Usage: gg-compute-cli multiplier <real>");
        return EXIT_FAILURE;
    };
    let real = match arg.parse::<f64>() {
        Ok(real) => real,
        Err(e) => {
            eprintln!("Invalid multiplier {arg:?}: {e}");
            return EXIT_FAILURE;
        }
    };
    match describe(real) {
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
