//! gg-compute-cli entry point.
//!
//! ## CLI Subcommands
//!
//! - `gg-compute-cli config [show|defaults|validate] [--file PATH]`
//! - `gg-compute-cli multiplier <real>`
//! - `gg-compute-cli kernel output-stage <cols> <rows> <real>`
//! - `gg-compute-cli help | version`

use std::process::ExitCode;

use gg_compute::cli::{config_cmd, flag_value, kernel_cmd, multiplier_cmd, EXIT_CONFIG_ERROR};
use gg_compute::telemetry::{init_logging, LogFormat};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    let code = match command {
        "config" => {
            let subcommand = match args.get(2).map(|s| s.as_str()) {
                Some(s) if !s.starts_with("--") => s,
                _ => "show",
            };
            let file = flag_value(&args, "--file");
            match subcommand {
                "show" => config_cmd::run_show(file),
                "defaults" => config_cmd::run_defaults(),
                "validate" => config_cmd::run_validate(file),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    1
                }
            }
        }
        "multiplier" => multiplier_cmd::run(args.get(2).map(|s| s.as_str())),
        "kernel" => {
            let config = match config_cmd::resolve(flag_value(&args, "--file")) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Failed to load configuration: {}", e);
                    return ExitCode::from(EXIT_CONFIG_ERROR as u8);
                }
            };
            let mut logging = config.logging.clone();
            logging.format = LogFormat::Pretty;
            if let Err(e) = init_logging(&logging) {
                eprintln!("Logging disabled: {}", e);
            }
            kernel_cmd::run(&args[2..], &config)
        }
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            0
        }
        "version" | "--version" | "-V" => {
            println!("gg-compute-cli {}", env!("CARGO_PKG_VERSION"));
            0
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            1
        }
    };
    ExitCode::from(code.clamp(0, 255) as u8)
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "gg-compute-cli - quantized kernel inspection v{}

USAGE:
    gg-compute-cli [COMMAND] [OPTIONS]

COMMANDS:
    config       Show, validate or print the default configuration
    multiplier   Encode a real rescale factor as a Q31 multiplier and shift
    kernel       Dump the build options of a device kernel
    version      Show version information
    help         Show this help message

OPTIONS:
    --file PATH    Load configuration from a TOML file instead of the environment

ENVIRONMENT:
    GG_COMPUTE_*   Configuration overrides (see `gg-compute-cli help config`)

EXIT CODES:
    0  Success
    1  Invalid input or failed operation
    2  Configuration error
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "config" => {
            eprintln!(
                "gg-compute-cli config - Configuration

USAGE:
    gg-compute-cli config [show|defaults|validate] [--file PATH]

DESCRIPTION:
    show      Print the effective configuration as JSON (default)
    defaults  Print the default configuration as TOML
    validate  Exit 0 if the configuration is valid, 2 otherwise

ENVIRONMENT:
    GG_COMPUTE_NUM_THREADS                   CPU worker threads (0 = auto)
    GG_COMPUTE_SOFTMAX_GRID_SIZE             Parallel softmax work-items per row
    GG_COMPUTE_SOFTMAX_SERIAL_VECTOR_SIZE    Serial softmax vector width
    GG_COMPUTE_SOFTMAX_PARALLEL_VECTOR_SIZE  Parallel softmax vector width
    GG_COMPUTE_ALLOW_ASSEMBLY                Use CPU micro-kernels (true/false)
    GG_COMPUTE_CL_MAX_VEC_SIZE               Device vector width cap
    GG_COMPUTE_CL_DUMMY_WORK_ITEMS           Pad device global sizes (true/false)
    GG_COMPUTE_LOG_LEVEL                     Log filter directive
    GG_COMPUTE_LOG_FORMAT                    json or pretty
    GG_COMPUTE_LOG_SPAN_TIMING               Log kernel span durations (true/false)
"
            );
        }
        "multiplier" => {
            eprintln!(
                "gg-compute-cli multiplier - Encode a rescale factor

USAGE:
    gg-compute-cli multiplier <real>

EXAMPLES:
    gg-compute-cli multiplier 0.0078125
    gg-compute-cli multiplier 3.5
"
            );
        }
        "kernel" => {
            eprintln!(
                "gg-compute-cli kernel - Device kernel build options

USAGE:
    gg-compute-cli kernel output-stage <cols> <rows> <real> [--offset N] [--type T]

DESCRIPTION:
    Configures the fixed-point output stage on the host device runtime and
    prints its program name, config id, build options and window.
"
            );
        }
        _ => {
            eprintln!("No help available for '{}'", command);
            print_usage();
        }
    }
}
