//! Iteration windows.
//!
//! A [`Window`] describes, per axis, the half-open range `[start, end)` a
//! kernel iterates and the `step` (block size) it processes at a time. Ends
//! are never rounded up to a multiple of the step: the last block on an axis
//! may be partial and kernels carry a leftover path for it.

mod tiling;

use std::fmt;
use std::ops::Index;

use serde::{Deserialize, Serialize};

pub use tiling::{
    adjust_vec_size, axis_blocks, classify_2d, leftover, leftover_first_blocks, leftover_first_span,
    AxisBlock, Block, Blocks, TileKind,
};

use crate::error::KernelError;
use crate::types::{Coordinates, Steps, TensorShape, MAX_DIMS};

/// Range and step along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimension {
    start: usize,
    end: usize,
    step: usize,
}

impl Dimension {
    pub fn new(start: usize, end: usize, step: usize) -> Self {
        Self {
            start,
            end: end.max(start),
            step: step.max(1),
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn extent(&self) -> usize {
        self.end - self.start
    }

    /// Number of blocks, counting a trailing partial block.
    pub fn num_iterations(&self) -> usize {
        self.extent().div_ceil(self.step)
    }

    pub fn set_end(&mut self, end: usize) {
        self.end = end.max(self.start);
    }
}

impl Default for Dimension {
    fn default() -> Self {
        Self::new(0, 1, 1)
    }
}

/// Per-axis iteration space of a kernel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    dims: [Dimension; MAX_DIMS],
}

impl Window {
    pub const DIM_X: usize = 0;
    pub const DIM_Y: usize = 1;
    pub const DIM_Z: usize = 2;
    pub const DIM_W: usize = 3;
    pub const DIM_V: usize = 4;

    /// Window with a single iteration on every axis.
    pub fn new() -> Self {
        Self {
            dims: [Dimension::default(); MAX_DIMS],
        }
    }

    pub fn set(&mut self, axis: usize, dim: Dimension) -> &mut Self {
        self.dims[axis] = dim;
        self
    }

    pub fn get(&self, axis: usize) -> Dimension {
        self.dims[axis]
    }

    pub fn x(&self) -> Dimension {
        self.dims[Self::DIM_X]
    }

    pub fn y(&self) -> Dimension {
        self.dims[Self::DIM_Y]
    }

    pub fn z(&self) -> Dimension {
        self.dims[Self::DIM_Z]
    }

    pub fn set_dimension_step(&mut self, axis: usize, step: usize) -> &mut Self {
        let d = self.dims[axis];
        self.dims[axis] = Dimension::new(d.start, d.end, step);
        self
    }

    pub fn num_iterations(&self, axis: usize) -> usize {
        self.dims[axis].num_iterations()
    }

    /// Total number of blocks over every axis.
    pub fn num_iterations_total(&self) -> usize {
        self.dims.iter().map(Dimension::num_iterations).product()
    }

    /// True when some axis has an empty range.
    pub fn is_empty(&self) -> bool {
        self.dims.iter().any(|d| d.extent() == 0)
    }

    /// Extents as a shape.
    pub fn shape(&self) -> TensorShape {
        let extents: Vec<usize> = self.dims.iter().map(Dimension::extent).collect();
        TensorShape::new(&extents)
    }

    /// Check that `sub` lies inside this window on step-aligned boundaries.
    pub fn validate_subwindow(&self, sub: &Window) -> Result<(), KernelError> {
        for axis in 0..MAX_DIMS {
            let full = self.dims[axis];
            let part = sub.dims[axis];
            if part.start < full.start || part.end > full.end {
                return Err(KernelError::InvalidSubWindow(format!(
                    "axis {axis}: [{}, {}) outside [{}, {})",
                    part.start, part.end, full.start, full.end
                )));
            }
            if part.step != full.step {
                return Err(KernelError::InvalidSubWindow(format!(
                    "axis {axis}: step {} differs from configured step {}",
                    part.step, full.step
                )));
            }
            if (part.start - full.start) % full.step != 0 {
                return Err(KernelError::InvalidSubWindow(format!(
                    "axis {axis}: start {} not aligned to step {}",
                    part.start, full.step
                )));
            }
        }
        Ok(())
    }

    /// Part `id` of `total` along `axis`.
    ///
    /// Parts are whole blocks, so split points never move block boundaries.
    /// Earlier parts receive the remainder blocks; trailing parts may be empty.
    pub fn split_window(&self, axis: usize, id: usize, total: usize) -> Window {
        let total = total.max(1);
        let mut out = *self;
        let dim = self.dims[axis];
        let num_it = dim.num_iterations();
        let remainder = num_it % total;
        let mut work = num_it / total;
        let mut it_start = work * id;
        if id < remainder {
            work += 1;
            it_start += id;
        } else {
            it_start += remainder;
        }
        let start = (dim.start + it_start * dim.step).min(dim.end);
        let end = (start + work * dim.step).min(dim.end);
        out.dims[axis] = Dimension::new(start, end, dim.step);
        out
    }

    /// Merge axes `[first, last)` into axis `first` when every one of them
    /// matches `full` exactly with unit steps from 0.
    ///
    /// Collapsing only changes how work is sliced: because tensors are
    /// contiguous, the merged index addresses the same elements in the same
    /// order. Returns the (possibly unchanged) window and whether it collapsed.
    pub fn collapse_if_possible(&self, full: &Window, first: usize, last: usize) -> (Window, bool) {
        let last = last.min(MAX_DIMS);
        if first + 1 >= last {
            return (*self, false);
        }
        let collapsible = (first..last).all(|d| {
            let mine = self.dims[d];
            let reference = full.dims[d];
            mine.start == 0
                && reference.start == 0
                && mine.step == 1
                && reference.step == 1
                && mine.end == reference.end
        });
        if !collapsible {
            return (*self, false);
        }
        let mut out = *self;
        let total: usize = (first..last).map(|d| self.dims[d].end).product();
        out.dims[first] = Dimension::new(0, total, 1);
        for d in first + 1..last {
            out.dims[d] = Dimension::default();
        }
        (out, true)
    }

    /// Collapse every axis from `first` upwards if possible.
    pub fn collapse(&self, full: &Window, first: usize) -> Window {
        self.collapse_if_possible(full, first, MAX_DIMS).0
    }

    /// First slice that iterates the lowest `n` axes and one position of the rest.
    pub fn first_slice_window(&self, n: usize) -> Window {
        let mut slice = *self;
        for d in n..MAX_DIMS {
            let dim = self.dims[d];
            slice.dims[d] = Dimension::new(dim.start, (dim.start + dim.step).min(dim.end), dim.step);
        }
        slice
    }

    pub fn first_slice_window_1d(&self) -> Window {
        self.first_slice_window(1)
    }

    pub fn first_slice_window_2d(&self) -> Window {
        self.first_slice_window(2)
    }

    pub fn first_slice_window_3d(&self) -> Window {
        self.first_slice_window(3)
    }

    /// Advance `slice` to the next position of the axes `>= n`.
    /// Returns false once every position has been visited.
    pub fn slide_window_slice(&self, n: usize, slice: &mut Window) -> bool {
        for d in n..MAX_DIMS {
            let dim = self.dims[d];
            let next = slice.dims[d].start + dim.step;
            if next < dim.end {
                slice.dims[d] = Dimension::new(next, (next + dim.step).min(dim.end), dim.step);
                return true;
            }
            slice.dims[d] = Dimension::new(dim.start, (dim.start + dim.step).min(dim.end), dim.step);
        }
        false
    }

    /// Every slice over the lowest `n` axes.
    pub fn slices(&self, n: usize) -> Vec<Window> {
        if self.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut slice = self.first_slice_window(n);
        loop {
            out.push(slice);
            if !self.slide_window_slice(n, &mut slice) {
                break;
            }
        }
        out
    }

    /// Iterate over the blocks of this window, axis 0 fastest.
    pub fn blocks(&self) -> Blocks {
        Blocks::new(self)
    }

    /// Coordinates of the first element of the window.
    pub fn start_coordinates(&self) -> Coordinates {
        let mut coords = [0; MAX_DIMS];
        for (c, d) in coords.iter_mut().zip(self.dims.iter()) {
            *c = d.start;
        }
        coords
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for Window {
    type Output = Dimension;

    fn index(&self, axis: usize) -> &Dimension {
        &self.dims[axis]
    }
}

impl fmt::Debug for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Window({self})")
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .dims
            .iter()
            .map(|d| format!("[{},{},{}]", d.start, d.end, d.step))
            .collect();
        f.write_str(&parts.join(""))
    }
}

/// Largest window over `shape` with the given block steps.
///
/// Ends equal the shape extents; they are not rounded up to the step.
pub fn calculate_max_window(shape: &TensorShape, steps: &Steps) -> Window {
    let mut window = Window::new();
    for axis in 0..MAX_DIMS {
        window.set(axis, Dimension::new(0, shape.dim(axis), steps.get(axis)));
    }
    window
}
