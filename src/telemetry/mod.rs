//! Telemetry: structured logging, spans and counters.
//!
//! Nothing here opens sockets; logs go to stderr or a file and counters go
//! to whatever `metrics` recorder the host process installs.

mod logging;
mod metrics;
mod spans;

pub use self::metrics::{
    describe_metrics, record_asm_fallback, record_cl_compile, record_kernel_configured,
    ASM_FALLBACK, CL_COMPILE, KERNELS_CONFIGURED,
};
pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use spans::{KernelSpan, SpanExt};
