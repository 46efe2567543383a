//! Runtime configuration.
//!
//! Values come from `GG_COMPUTE_*` environment variables or a TOML file.
//! Invalid environment values fall back to defaults without failing; a TOML
//! file is validated and rejected as a whole.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `GG_COMPUTE_NUM_THREADS` | 0 | CPU worker threads (0 = auto) |
//! | `GG_COMPUTE_SOFTMAX_GRID_SIZE` | 64 | Work-items per row in the parallel softmax |
//! | `GG_COMPUTE_SOFTMAX_SERIAL_VECTOR_SIZE` | 8 | Vector width of the serial softmax |
//! | `GG_COMPUTE_SOFTMAX_PARALLEL_VECTOR_SIZE` | 4 | Vector width of the parallel softmax |
//! | `GG_COMPUTE_ALLOW_ASSEMBLY` | true | Use CPU micro-kernels when they cover a request |
//! | `GG_COMPUTE_CL_MAX_VEC_SIZE` | 16 | Upper bound for device vector widths |
//! | `GG_COMPUTE_CL_DUMMY_WORK_ITEMS` | false | Round device global sizes up to the local size |
//! | `GG_COMPUTE_LOG_LEVEL` | info | Log filter directive |
//! | `GG_COMPUTE_LOG_FORMAT` | json | `json` or `pretty` |
//! | `GG_COMPUTE_LOG_SPAN_TIMING` | false | Log kernel span durations on close |

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::cl::ClTuning;
use crate::ops::softmax::SoftmaxTuning;
use crate::telemetry::{LogConfig, LogFormat};

/// Vector widths a device kernel may be built with.
const VALID_VEC_SIZES: [usize; 5] = [1, 2, 4, 8, 16];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation failed: {0}")]
    Validation(String),
}

/// CPU backend preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub allow_assembly: bool,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self { allow_assembly: true }
    }
}

/// Everything tunable about kernel selection and scheduling.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Worker threads for the CPU scheduler (0 = one per core).
    pub num_threads: usize,
    pub softmax: SoftmaxTuning,
    pub cpu: CpuConfig,
    pub cl: ClTuning,
    pub logging: LogConfig,
}

/// Flattened view of the effective values, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveConfig {
    pub num_threads: usize,
    pub effective_threads: usize,
    pub softmax_grid_size: usize,
    pub softmax_serial_vector_size: usize,
    pub softmax_parallel_vector_size: usize,
    pub allow_assembly: bool,
    pub cl_max_vec_size: usize,
    pub cl_use_dummy_work_items: bool,
    pub log_level: String,
    pub log_format: LogFormat,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a boolean env var (`1/true/yes`, `0/false/no`), returning `default` otherwise.
fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Vector width from env, kept only when it is one a kernel can build.
fn parse_vec_size(key: &str, default: usize) -> usize {
    let value = parse_usize(key, default);
    if VALID_VEC_SIZES.contains(&value) {
        value
    } else {
        default
    }
}

fn load_softmax_tuning() -> SoftmaxTuning {
    let defaults = SoftmaxTuning::default();
    let grid_size = parse_usize("GG_COMPUTE_SOFTMAX_GRID_SIZE", defaults.grid_size);
    SoftmaxTuning {
        grid_size: grid_size.max(1),
        serial_vector_size: parse_vec_size(
            "GG_COMPUTE_SOFTMAX_SERIAL_VECTOR_SIZE",
            defaults.serial_vector_size,
        ),
        parallel_vector_size: parse_vec_size(
            "GG_COMPUTE_SOFTMAX_PARALLEL_VECTOR_SIZE",
            defaults.parallel_vector_size,
        ),
    }
}

fn load_cl_tuning() -> ClTuning {
    let defaults = ClTuning::default();
    ClTuning {
        max_vec_size: parse_vec_size("GG_COMPUTE_CL_MAX_VEC_SIZE", defaults.max_vec_size),
        use_dummy_work_items: parse_bool(
            "GG_COMPUTE_CL_DUMMY_WORK_ITEMS",
            defaults.use_dummy_work_items,
        ),
    }
}

fn load_log_config() -> LogConfig {
    let defaults = LogConfig::default();
    let format = match std::env::var("GG_COMPUTE_LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        Ok("pretty") => LogFormat::Pretty,
        _ => defaults.format,
    };
    let level = std::env::var("GG_COMPUTE_LOG_LEVEL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(defaults.level);
    LogConfig {
        format,
        level,
        output_path: None,
        span_timing: parse_bool("GG_COMPUTE_LOG_SPAN_TIMING", defaults.span_timing),
    }
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> ComputeConfig {
    ComputeConfig {
        num_threads: parse_usize("GG_COMPUTE_NUM_THREADS", 0).min(1024),
        softmax: load_softmax_tuning(),
        cpu: CpuConfig {
            allow_assembly: parse_bool("GG_COMPUTE_ALLOW_ASSEMBLY", true),
        },
        cl: load_cl_tuning(),
        logging: load_log_config(),
    }
}

impl ComputeConfig {
    /// Same as [`load`].
    pub fn from_env() -> Self {
        load()
    }

    /// Parse and validate a TOML document; missing fields take defaults.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let cfg: ComputeConfig = toml::from_str(toml_str)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_threads > 1024 {
            return Err(ConfigError::Validation(format!(
                "num_threads must be <= 1024, got {}",
                self.num_threads
            )));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Validation(
                "logging.level must not be empty".to_string(),
            ));
        }
        if self.softmax.grid_size == 0 {
            return Err(ConfigError::Validation(
                "softmax.grid_size must be > 0".to_string(),
            ));
        }
        for (field, value) in [
            ("softmax.serial_vector_size", self.softmax.serial_vector_size),
            ("softmax.parallel_vector_size", self.softmax.parallel_vector_size),
            ("cl.max_vec_size", self.cl.max_vec_size),
        ] {
            if !VALID_VEC_SIZES.contains(&value) {
                return Err(ConfigError::Validation(format!(
                    "{field} must be one of {VALID_VEC_SIZES:?}, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Thread count the scheduler will use.
    pub fn effective_threads(&self) -> usize {
        if self.num_threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.num_threads
        }
    }

    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            num_threads: self.num_threads,
            effective_threads: self.effective_threads(),
            softmax_grid_size: self.softmax.grid_size,
            softmax_serial_vector_size: self.softmax.serial_vector_size,
            softmax_parallel_vector_size: self.softmax.parallel_vector_size,
            allow_assembly: self.cpu.allow_assembly,
            cl_max_vec_size: self.cl.max_vec_size,
            cl_use_dummy_work_items: self.cl.use_dummy_work_items,
            log_level: self.logging.level.clone(),
            log_format: self.logging.format,
        }
    }
}
