//! Configuration file loading and validation.

use std::io::Write;

use gg_compute::backend::cl::ClTuning;
use gg_compute::config::{ComputeConfig, ConfigError};
use gg_compute::ops::softmax::SoftmaxTuning;
use gg_compute::telemetry::LogFormat;

#[test]
fn partial_toml_keeps_defaults() {
    let cfg = ComputeConfig::from_toml_str(
        r#"
num_threads = 6

[softmax]
grid_size = 32

[logging]
format = "pretty"
"#,
    )
    .unwrap();

    assert_eq!(cfg.num_threads, 6);
    assert_eq!(cfg.effective_threads(), 6);
    assert_eq!(cfg.softmax.grid_size, 32);
    assert_eq!(cfg.softmax.serial_vector_size, SoftmaxTuning::default().serial_vector_size);
    assert_eq!(cfg.softmax.parallel_vector_size, 4);
    assert!(cfg.cpu.allow_assembly);
    assert_eq!(cfg.cl, ClTuning::default());
    assert_eq!(cfg.logging.format, LogFormat::Pretty);
    assert_eq!(cfg.logging.level, "info");
}

#[test]
fn empty_document_equals_default() {
    let cfg = ComputeConfig::from_toml_str("").unwrap();
    assert_eq!(cfg, ComputeConfig::default());
    assert!(cfg.effective_threads() >= 1);
}

#[test]
fn malformed_toml_is_a_parse_error() {
    let err = ComputeConfig::from_toml_str("num_threads = [").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)), "{err}");

    let err = ComputeConfig::from_toml_str("num_threads = \"four\"").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)), "{err}");
}

#[test]
fn out_of_range_values_fail_validation() {
    for doc in [
        "[cl]\nmax_vec_size = 3",
        "[softmax]\nserial_vector_size = 32",
        "[softmax]\ngrid_size = 0",
        "num_threads = 4096",
        "[logging]\nlevel = \"  \"",
    ] {
        let err = ComputeConfig::from_toml_str(doc).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)), "{doc}: {err}");
    }
}

#[test]
fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[cpu]\nallow_assembly = false\n\n[cl]\nuse_dummy_work_items = true").unwrap();

    let cfg = ComputeConfig::from_file(file.path()).unwrap();
    assert!(!cfg.cpu.allow_assembly);
    assert!(cfg.cl.use_dummy_work_items);
    assert_eq!(cfg.cl.max_vec_size, 16);
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ComputeConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn effective_config_serializes_flat() {
    let cfg = ComputeConfig::from_toml_str("num_threads = 2\n[cl]\nmax_vec_size = 8").unwrap();
    let effective = cfg.effective_config();
    assert_eq!(effective.effective_threads, 2);

    let json = serde_json::to_value(&effective).unwrap();
    assert_eq!(json["num_threads"], 2);
    assert_eq!(json["softmax_grid_size"], 64);
    assert_eq!(json["cl_max_vec_size"], 8);
    assert_eq!(json["allow_assembly"], true);
    assert_eq!(json["log_format"], "json");
}
