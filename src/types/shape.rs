//! Tensor shapes, coordinates and steps.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum number of tensor dimensions.
pub const MAX_DIMS: usize = 6;

/// Element coordinates, one entry per axis.
pub type Coordinates = [usize; MAX_DIMS];

/// Byte strides, one entry per axis.
pub type Strides = [usize; MAX_DIMS];

/// Extent of a tensor along each axis.
///
/// Axes past `num_dimensions()` have extent 1. The empty shape has every
/// extent set to 0, so its `total_size()` is 0.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    dims: [usize; MAX_DIMS],
    num_dimensions: usize,
}

impl TensorShape {
    /// Build a shape from its extents, innermost axis first.
    ///
    /// Trailing extents of 1 do not count towards `num_dimensions()`.
    pub fn new(extents: &[usize]) -> Self {
        assert!(extents.len() <= MAX_DIMS, "at most {MAX_DIMS} dimensions");
        if extents.is_empty() {
            return Self::empty();
        }
        let mut dims = [1; MAX_DIMS];
        dims[..extents.len()].copy_from_slice(extents);
        let mut shape = Self {
            dims,
            num_dimensions: extents.len(),
        };
        shape.apply_dimension_correction();
        shape
    }

    /// Shape of a tensor that has not been initialised.
    pub const fn empty() -> Self {
        Self {
            dims: [0; MAX_DIMS],
            num_dimensions: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_dimensions == 0
    }

    pub fn num_dimensions(&self) -> usize {
        self.num_dimensions
    }

    /// Extent along `axis` (1 for axes past the last dimension).
    pub fn dim(&self, axis: usize) -> usize {
        self.dims.get(axis).copied().unwrap_or(1)
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims[..self.num_dimensions]
    }

    /// Set the extent of `axis`, growing the dimension count if needed.
    pub fn set(&mut self, axis: usize, extent: usize) -> &mut Self {
        assert!(axis < MAX_DIMS, "axis {axis} out of range");
        if self.is_empty() {
            self.dims = [1; MAX_DIMS];
        }
        self.dims[axis] = extent;
        self.num_dimensions = self.num_dimensions.max(axis + 1);
        self.apply_dimension_correction();
        self
    }

    /// Number of elements.
    pub fn total_size(&self) -> usize {
        self.dims.iter().product()
    }

    /// Number of elements in the axes from `first` upwards.
    pub fn total_size_upper(&self, first: usize) -> usize {
        self.dims[first.min(MAX_DIMS)..].iter().product()
    }

    /// Number of elements in the axes below `last`.
    pub fn total_size_lower(&self, last: usize) -> usize {
        self.dims[..last.min(MAX_DIMS)].iter().product()
    }

    /// Merge `n` axes starting at `first` into one.
    pub fn collapse(&mut self, n: usize, first: usize) -> &mut Self {
        if n <= 1 || first >= self.num_dimensions {
            return self;
        }
        let last = (first + n).min(MAX_DIMS);
        let merged: usize = self.dims[first..last].iter().product();
        let removed = last - first - 1;
        let mut dims = [1; MAX_DIMS];
        dims[..first].copy_from_slice(&self.dims[..first]);
        dims[first] = merged;
        for axis in last..MAX_DIMS {
            dims[axis - removed] = self.dims[axis];
        }
        self.dims = dims;
        self.num_dimensions = self.num_dimensions.saturating_sub(removed).max(first + 1);
        self.apply_dimension_correction();
        self
    }

    /// Copy of this shape with every axis from `first` upwards merged into one.
    pub fn collapsed_from(&self, first: usize) -> Self {
        let mut shape = *self;
        let n = MAX_DIMS.saturating_sub(first);
        shape.collapse(n, first);
        shape
    }

    /// Remove `axis`, shifting the outer axes down by one.
    pub fn remove_dimension(&mut self, axis: usize) -> &mut Self {
        if axis >= self.num_dimensions {
            return self;
        }
        for a in axis..MAX_DIMS - 1 {
            self.dims[a] = self.dims[a + 1];
        }
        self.dims[MAX_DIMS - 1] = 1;
        self.num_dimensions -= 1;
        if self.num_dimensions == 0 {
            *self = Self::new(&[1]);
        }
        self.apply_dimension_correction();
        self
    }

    fn apply_dimension_correction(&mut self) {
        while self.num_dimensions > 1 && self.dims[self.num_dimensions - 1] == 1 {
            self.num_dimensions -= 1;
        }
    }
}

impl Default for TensorShape {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TensorShape({self})")
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.dims().iter().map(|d| d.to_string()).collect();
        f.write_str(&parts.join("x"))
    }
}

/// Iteration step per axis; unspecified axes step by 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Steps([usize; MAX_DIMS]);

impl Steps {
    pub fn new(steps: &[usize]) -> Self {
        assert!(steps.len() <= MAX_DIMS, "at most {MAX_DIMS} steps");
        let mut all = [1; MAX_DIMS];
        for (slot, step) in all.iter_mut().zip(steps) {
            *slot = (*step).max(1);
        }
        Self(all)
    }

    pub fn get(&self, axis: usize) -> usize {
        self.0.get(axis).copied().unwrap_or(1)
    }
}

impl Default for Steps {
    fn default() -> Self {
        Self([1; MAX_DIMS])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_ones_are_trimmed() {
        let shape = TensorShape::new(&[4, 3, 1, 1]);
        assert_eq!(shape.num_dimensions(), 2);
        assert_eq!(shape, TensorShape::new(&[4, 3]));
        assert_eq!(shape.dim(5), 1);
    }

    #[test]
    fn test_empty_shape_has_zero_size() {
        let shape = TensorShape::empty();
        assert_eq!(shape.total_size(), 0);
        assert!(shape.is_empty());
        assert_eq!(TensorShape::new(&[1]).total_size(), 1);
    }

    #[test]
    fn test_collapse_merges_axes() {
        let mut shape = TensorShape::new(&[8, 4, 3, 2]);
        shape.collapse(2, 1);
        assert_eq!(shape.dims(), &[8, 12, 2]);
        assert_eq!(TensorShape::new(&[8, 4, 3, 2]).collapsed_from(2).dims(), &[8, 4, 6]);
    }

    #[test]
    fn test_set_grows_dimensions() {
        let mut shape = TensorShape::new(&[5]);
        shape.set(2, 7);
        assert_eq!(shape.dims(), &[5, 1, 7]);
        assert_eq!(shape.total_size(), 35);
    }

    #[test]
    fn test_remove_dimension() {
        let mut shape = TensorShape::new(&[2, 3, 4]);
        shape.remove_dimension(1);
        assert_eq!(shape.dims(), &[2, 4]);
    }

    #[test]
    fn test_display() {
        assert_eq!(TensorShape::new(&[16, 8, 3]).to_string(), "16x8x3");
    }
}
