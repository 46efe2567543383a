// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Config CLI subcommands: show, defaults, validate.

use std::path::Path;

use super::{EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_OK};
use crate::config::{self, ComputeConfig, ConfigError};

/// Configuration from `path`, or from the environment when no path is given.
pub fn resolve(path: Option<&str>) -> Result<ComputeConfig, ConfigError> {
    match path {
        Some(path) => ComputeConfig::from_file(Path::new(path)),
        None => Ok(config::load()),
    }
}

/// Effective configuration rendered as pretty JSON.
pub fn render_effective(cfg: &ComputeConfig) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&cfg.effective_config())
}

/// Print the effective configuration as JSON to stdout.
pub fn run_show(path: Option<&str>) -> i32 {
    let cfg = match resolve(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return EXIT_CONFIG_ERROR;
        }
    };
    match render_effective(&cfg) {
        Ok(json) => {
            println!("{json}");
            EXIT_OK
        }
        Err(e) => {
            eprintln!("Failed to render configuration: {e}");
            EXIT_FAILURE
        }
    }
}

/// Print the default configuration as a TOML document.
pub fn run_defaults() -> i32 {
    match toml::to_string_pretty(&ComputeConfig::default()) {
        Ok(doc) => {
            print!("{doc}");
            EXIT_OK
        }
        Err(e) => {
            eprintln!("Failed to render defaults: {e}");
            EXIT_FAILURE
        }
    }
}

/// Load and validate; returns 0 if valid, 2 otherwise.
pub fn run_validate(path: Option<&str>) -> i32 {
    match resolve(path).and_then(|cfg| cfg.validate().map(|_| cfg)) {
        Ok(_) => {
            println!("Configuration is valid.");
            EXIT_OK
        }
        Err(e) => {
            eprintln!("Configuration is invalid: {e}");
            EXIT_CONFIG_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_render_effective_is_json() {
        let json = render_effective(&ComputeConfig::default()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["softmax_grid_size"], 64);
        assert_eq!(value["cl_use_dummy_work_items"], false);
    }

    #[test]
    fn test_defaults_round_trip_through_toml() {
        let doc = toml::to_string_pretty(&ComputeConfig::default()).unwrap();
        assert_eq!(ComputeConfig::from_toml_str(&doc).unwrap(), ComputeConfig::default());
    }

    #[test]
    fn test_validate_file_exit_codes() {
        let mut good = tempfile::NamedTempFile::new().unwrap();
        writeln!(good, "num_threads = 2").unwrap();
        assert_eq!(run_validate(good.path().to_str()), EXIT_OK);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "[cl]\nmax_vec_size = 3").unwrap();
        assert_eq!(run_validate(bad.path().to_str()), EXIT_CONFIG_ERROR);
        assert_eq!(run_show(Some("/nonexistent/gg-compute.toml")), EXIT_CONFIG_ERROR);
    }
}
