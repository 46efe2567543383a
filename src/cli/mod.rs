// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! CLI subcommands for inspecting the library without writing code.
//!
//! ## Usage
//!
//! ```bash
//! gg-compute-cli config                 # Effective configuration as JSON
//! gg-compute-cli config --file cfg.toml # Same, loaded from a TOML file
//! gg-compute-cli multiplier 0.0078125   # Q31 multiplier and shift of a real scale
//! gg-compute-cli kernel output-stage 17 4 0.25
//! ```
//!
//! Every `run_*` function returns the process exit code.

pub mod config_cmd;
pub mod kernel_cmd;
pub mod multiplier_cmd;

/// Exit code for a successful command.
pub const EXIT_OK: i32 = 0;
/// Exit code for invalid input or a failed operation.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for a configuration that cannot be loaded.
pub const EXIT_CONFIG_ERROR: i32 = 2;

/// Value following `flag` in `args`, if any.
pub fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}
