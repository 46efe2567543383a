//! Block decomposition of windows: full blocks plus leftover blocks.

use super::Window;
use crate::types::{Coordinates, MAX_DIMS};

/// Whether a block spans a whole step or only the leftover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileKind {
    Full,
    Partial,
}

/// Elements left over after the last full block.
#[inline]
pub fn leftover(extent: usize, block: usize) -> usize {
    extent % block.max(1)
}

/// One block along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisBlock {
    pub start: usize,
    pub len: usize,
    pub kind: TileKind,
}

/// Blocks of `[start, end)` with size `step`; only the last may be partial.
pub fn axis_blocks(start: usize, end: usize, step: usize) -> impl Iterator<Item = AxisBlock> {
    let step = step.max(1);
    (start..end).step_by(step).map(move |s| {
        let len = step.min(end - s);
        AxisBlock {
            start: s,
            len,
            kind: if len == step { TileKind::Full } else { TileKind::Partial },
        }
    })
}

/// An n-dimensional block of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub start: Coordinates,
    pub len: [usize; MAX_DIMS],
    partial: [bool; MAX_DIMS],
}

impl Block {
    pub fn kind(&self, axis: usize) -> TileKind {
        if self.partial[axis] {
            TileKind::Partial
        } else {
            TileKind::Full
        }
    }

    pub fn is_full(&self) -> bool {
        !self.partial.iter().any(|p| *p)
    }

    /// Every element coordinate inside the block, axis 0 fastest.
    pub fn for_each_element(&self, mut f: impl FnMut(&Coordinates)) {
        if self.len.iter().any(|l| *l == 0) {
            return;
        }
        let mut coords = self.start;
        loop {
            f(&coords);
            let mut axis = 0;
            loop {
                coords[axis] += 1;
                if coords[axis] < self.start[axis] + self.len[axis] {
                    break;
                }
                coords[axis] = self.start[axis];
                axis += 1;
                if axis == MAX_DIMS {
                    return;
                }
            }
        }
    }
}

/// Classify a block on the (x, y) plane.
pub fn classify_2d(block: &Block) -> (TileKind, TileKind) {
    (block.kind(Window::DIM_X), block.kind(Window::DIM_Y))
}

/// Iterator over the blocks of a window.
#[derive(Debug, Clone)]
pub struct Blocks {
    window: Window,
    next: Option<Coordinates>,
}

impl Blocks {
    pub(super) fn new(window: &Window) -> Self {
        let next = if window.is_empty() {
            None
        } else {
            Some(window.start_coordinates())
        };
        Self {
            window: *window,
            next,
        }
    }
}

impl Iterator for Blocks {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let start = self.next?;
        let mut len = [0; MAX_DIMS];
        let mut partial = [false; MAX_DIMS];
        for axis in 0..MAX_DIMS {
            let dim = self.window.get(axis);
            len[axis] = dim.step().min(dim.end() - start[axis]);
            partial[axis] = len[axis] < dim.step();
        }

        let mut coords = start;
        let mut advanced = false;
        for axis in 0..MAX_DIMS {
            let dim = self.window.get(axis);
            coords[axis] += dim.step();
            if coords[axis] < dim.end() {
                advanced = true;
                break;
            }
            coords[axis] = dim.start();
        }
        self.next = if advanced { Some(coords) } else { None };

        Some(Block {
            start,
            len,
            partial,
        })
    }
}

/// Shrink a vector width until it fits `dim0`.
///
/// A width-3 axis keeps width 3 since the device supports 3-wide vectors.
pub fn adjust_vec_size(vec_size: usize, dim0: usize) -> usize {
    let mut vec_size = vec_size.max(1);
    if vec_size >= dim0 && dim0 == 3 {
        return dim0;
    }
    while vec_size > dim0 && vec_size > 1 {
        vec_size >>= 1;
    }
    vec_size
}

/// Vector blocks as processed by generated device kernels.
///
/// The partial block, if any, is handled by the first work item; every later
/// work item is shifted back so it stores a full vector. Yields
/// `(start, len)` per work item.
pub fn leftover_first_blocks(extent: usize, vec_size: usize) -> impl Iterator<Item = (usize, usize)> {
    let vec_size = vec_size.max(1);
    let rem = extent % vec_size;
    (0..extent.div_ceil(vec_size)).map(move |item| leftover_first_span(item, vec_size, rem))
}

/// `(start, len)` of work item `item` given `VEC_SIZE` and `VEC_SIZE_LEFTOVER`.
#[inline]
pub fn leftover_first_span(item: usize, vec_size: usize, leftover: usize) -> (usize, usize) {
    let vec_size = vec_size.max(1);
    let shift = (vec_size - leftover % vec_size) % vec_size;
    let x = (item * vec_size).saturating_sub(shift);
    let len = if item == 0 && leftover % vec_size != 0 { leftover % vec_size } else { vec_size };
    (x, len)
}
