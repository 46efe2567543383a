//! Window partitioning over scoped worker threads.
//!
//! A kernel window is cut along one axis into disjoint sub-windows with
//! [`Window::split_window`]; each worker runs one of them. Because split
//! points sit on block boundaries the result does not depend on the thread
//! count.

use std::panic;
use std::thread::{self, ScopedJoinHandle};

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::assembly::AsmKernel;
use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::types::TensorPack;
use crate::window::Window;

/// Configuration for the CPU scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads (0 = auto-detect).
    pub num_threads: usize,
    /// Thread name prefix.
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_threads: 0, // Auto-detect
            thread_name_prefix: "gg-compute".to_string(),
        }
    }
}

/// Runs kernels on scoped threads, one sub-window each.
#[derive(Debug, Clone)]
pub struct CpuScheduler {
    num_threads: usize,
    thread_name_prefix: String,
}

impl CpuScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let num_threads = if config.num_threads == 0 {
            num_cpus::get().max(1)
        } else {
            config.num_threads
        };
        Self {
            num_threads,
            thread_name_prefix: config.thread_name_prefix,
        }
    }

    /// Scheduler with a fixed thread count.
    pub fn with_threads(num_threads: usize) -> Self {
        Self::new(SchedulerConfig {
            num_threads: num_threads.max(1),
            ..SchedulerConfig::default()
        })
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Run `kernel` over its configured window, splitting along y when possible.
    pub fn schedule(&self, kernel: &dyn Kernel, tensors: &TensorPack<'_>) -> Result<(), KernelError> {
        self.schedule_with_hint(kernel, Window::DIM_Y, tensors)
    }

    pub fn schedule_with_hint(
        &self,
        kernel: &dyn Kernel,
        split_hint: usize,
        tensors: &TensorPack<'_>,
    ) -> Result<(), KernelError> {
        let window = *kernel.window()?;
        if window.is_empty() {
            return Ok(());
        }
        let axis = split_axis(&window, split_hint, self.num_threads);
        let iterations = window.num_iterations(axis);
        let mws = kernel.get_mws(self.num_threads).max(1);
        let num_windows = self.num_threads.min(iterations / mws).max(1);

        if num_windows == 1 {
            trace!(kernel = kernel.name(), window = %window, "run single slice");
            return kernel.run(tensors, &window);
        }

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(num_windows);
            for id in 0..num_windows {
                let sub = window.split_window(axis, id, num_windows);
                let handle = thread::Builder::new()
                    .name(format!("{}-{}", self.thread_name_prefix, id))
                    .spawn_scoped(scope, move || {
                        trace!(kernel = kernel.name(), thread = id, window = %sub, "run slice");
                        kernel.run(tensors, &sub)
                    })
                    .map_err(|e| KernelError::Enqueue(format!("failed to spawn worker: {e}")))?;
                handles.push(handle);
            }
            join_all(handles)
        })
    }

    /// Run an assembly kernel with one workspace slice per thread.
    ///
    /// The kernel splits its own window by thread id.
    pub fn run_asm(&self, kernel: &dyn AsmKernel, tensors: &TensorPack<'_>) -> Result<(), KernelError> {
        let window = kernel.get_window_size()?;
        let iterations = window.num_iterations(kernel.split_dimension()).max(1);
        let num_threads = self.num_threads.min(iterations);
        let per_thread = kernel.get_working_size(num_threads) / num_threads;
        let mut workspace = vec![0u8; per_thread * num_threads];

        if num_threads == 1 {
            return kernel.execute(tensors, &mut workspace, 0, 1);
        }

        let mut slices: Vec<&mut [u8]> = Vec::with_capacity(num_threads);
        let mut rest = workspace.as_mut_slice();
        for _ in 0..num_threads {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(per_thread);
            slices.push(head);
            rest = tail;
        }

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(num_threads);
            for (id, slice) in slices.into_iter().enumerate() {
                let handle = thread::Builder::new()
                    .name(format!("{}-asm-{}", self.thread_name_prefix, id))
                    .spawn_scoped(scope, move || kernel.execute(tensors, slice, id, num_threads))
                    .map_err(|e| KernelError::Enqueue(format!("failed to spawn worker: {e}")))?;
                handles.push(handle);
            }
            join_all(handles)
        })
    }
}

impl Default for CpuScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// Axis to split: the hint if it gives every thread work, else the longest axis.
pub fn split_axis(window: &Window, hint: usize, num_threads: usize) -> usize {
    if window.num_iterations(hint) >= num_threads {
        return hint;
    }
    (0..crate::types::MAX_DIMS)
        .max_by_key(|&axis| (window.num_iterations(axis), axis == hint))
        .unwrap_or(hint)
}

fn join_all(handles: Vec<ScopedJoinHandle<'_, Result<(), KernelError>>>) -> Result<(), KernelError> {
    let mut result = Ok(());
    for handle in handles {
        match handle.join() {
            Ok(outcome) => {
                if result.is_ok() {
                    result = outcome;
                }
            }
            Err(payload) => panic::resume_unwind(payload),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Steps, TensorShape};
    use crate::window::calculate_max_window;

    #[test]
    fn test_auto_thread_count() {
        let scheduler = CpuScheduler::default();
        assert!(scheduler.num_threads() >= 1);
        assert_eq!(CpuScheduler::with_threads(3).num_threads(), 3);
        assert_eq!(CpuScheduler::with_threads(0).num_threads(), 1);
    }

    #[test]
    fn test_split_axis_prefers_hint() {
        let win = calculate_max_window(&TensorShape::new(&[64, 8]), &Steps::new(&[16, 1]));
        assert_eq!(split_axis(&win, Window::DIM_Y, 4), Window::DIM_Y);
        // only 2 rows for 4 threads: fall back to the longest axis
        let flat = calculate_max_window(&TensorShape::new(&[64, 2]), &Steps::new(&[1, 1]));
        assert_eq!(split_axis(&flat, Window::DIM_Y, 4), Window::DIM_X);
    }
}
