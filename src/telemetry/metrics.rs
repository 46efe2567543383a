//! Counters emitted through the `metrics` facade.
//!
//! Without an installed recorder these calls are no-ops.

use metrics::{counter, describe_counter};

pub const KERNELS_CONFIGURED: &str = "gg_compute_kernels_configured_total";
pub const CL_COMPILE: &str = "gg_compute_cl_compile_total";
pub const ASM_FALLBACK: &str = "gg_compute_asm_fallback_total";

/// Register descriptions for every counter.
pub fn describe_metrics() {
    describe_counter!(KERNELS_CONFIGURED, "Kernels successfully configured");
    describe_counter!(CL_COMPILE, "Device program compilations by cache result");
    describe_counter!(
        ASM_FALLBACK,
        "Assembly kernel requests left unconfigured for an unsupported configuration"
    );
}

pub fn record_kernel_configured(kernel: &str) {
    counter!(KERNELS_CONFIGURED, "kernel" => kernel.to_string()).increment(1);
}

pub fn record_cl_compile(cache_hit: bool) {
    let result = if cache_hit { "hit" } else { "miss" };
    counter!(CL_COMPILE, "result" => result).increment(1);
}

pub fn record_asm_fallback(kernel: &str) {
    counter!(ASM_FALLBACK, "kernel" => kernel.to_string()).increment(1);
}
