//! Span helpers for kernel configure and run.

use tracing::{debug_span, trace_span, Span};

/// Extension trait for recording an outcome on a span.
pub trait SpanExt {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for standard kernel spans.
pub struct KernelSpan;

impl KernelSpan {
    /// Span around `configure`; `status` is filled by [`SpanExt::record_result`].
    pub fn configure(kernel: &str) -> Span {
        debug_span!(
            "kernel_configure",
            kernel = %kernel,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }

    /// Span around one `run` slice.
    pub fn run(kernel: &str, window: &crate::window::Window) -> Span {
        trace_span!("kernel_run", kernel = %kernel, window = %window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_result_without_subscriber() {
        let span = KernelSpan::configure("test_kernel");
        span.record_result::<(), String>(&Err("bad".to_string()));
        span.record_result::<(), String>(&Ok(()));
    }
}
