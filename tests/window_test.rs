//! Window coverage, tiling and thread-partitioning tests.

use std::collections::HashMap;

use gg_compute::types::{Coordinates, Steps, TensorShape};
use gg_compute::window::{
    adjust_vec_size, calculate_max_window, classify_2d, leftover, leftover_first_blocks, Dimension,
    TileKind, Window,
};

/// Visit count per element over all blocks of `window`.
fn coverage(window: &Window) -> HashMap<Coordinates, usize> {
    let mut counts = HashMap::new();
    for block in window.blocks() {
        block.for_each_element(|c| *counts.entry(*c).or_insert(0) += 1);
    }
    counts
}

fn assert_exact_cover(window: &Window, shape: &TensorShape) {
    let counts = coverage(window);
    assert_eq!(counts.len(), shape.total_size(), "gaps for {shape:?} with {window}");
    assert!(counts.values().all(|n| *n == 1), "overlap for {shape:?} with {window}");
    for coords in counts.keys() {
        for (axis, c) in coords.iter().enumerate() {
            assert!(*c < shape.dim(axis).max(1));
        }
    }
}

#[test]
fn blocks_cover_every_element_once() {
    for (w, h) in [(1, 1), (3, 5), (8, 8), (17, 4), (4, 17), (33, 9)] {
        for (bx, by) in [(1, 1), (4, 1), (4, 4), (16, 2), (5, 3)] {
            let shape = TensorShape::new(&[w, h, 2]);
            let window = calculate_max_window(&shape, &Steps::new(&[bx, by]));
            assert_exact_cover(&window, &shape);
        }
    }
}

#[test]
fn all_four_2d_tile_combinations_occur() {
    let shape = TensorShape::new(&[10, 7]);
    let window = calculate_max_window(&shape, &Steps::new(&[4, 3]));
    let mut seen: HashMap<(TileKind, TileKind), usize> = HashMap::new();
    for block in window.blocks() {
        *seen.entry(classify_2d(&block)).or_insert(0) += 1;
    }
    // 2 full + 1 partial columns, 2 full + 1 partial rows
    assert_eq!(seen.get(&(TileKind::Full, TileKind::Full)), Some(&4));
    assert_eq!(seen.get(&(TileKind::Partial, TileKind::Full)), Some(&2));
    assert_eq!(seen.get(&(TileKind::Full, TileKind::Partial)), Some(&2));
    assert_eq!(seen.get(&(TileKind::Partial, TileKind::Partial)), Some(&1));
    assert_eq!(leftover(10, 4), 2);
    assert_eq!(leftover(7, 3), 1);
}

#[test]
fn exact_multiples_have_no_partial_tiles() {
    let shape = TensorShape::new(&[12, 6]);
    let window = calculate_max_window(&shape, &Steps::new(&[4, 3]));
    assert!(window.blocks().all(|b| b.is_full()));
    assert_eq!(window.blocks().count(), 6);
}

#[test]
fn split_parts_partition_the_window() {
    let shape = TensorShape::new(&[9, 13, 3]);
    let window = calculate_max_window(&shape, &Steps::new(&[4, 2]));
    for total in 1..=6 {
        for axis in [Window::DIM_X, Window::DIM_Y, Window::DIM_Z] {
            let mut counts: HashMap<Coordinates, usize> = HashMap::new();
            for id in 0..total {
                let part = window.split_window(axis, id, total);
                if !part.is_empty() {
                    window.validate_subwindow(&part).unwrap();
                }
                for (c, n) in coverage(&part) {
                    *counts.entry(c).or_insert(0) += n;
                }
            }
            assert_eq!(counts.len(), shape.total_size(), "axis {axis}, {total} parts");
            assert!(counts.values().all(|n| *n == 1));
        }
    }
}

#[test]
fn collapse_preserves_element_count() {
    let shape = TensorShape::new(&[6, 5, 4, 3]);
    let window = calculate_max_window(&shape, &Steps::default());
    let (collapsed, did_collapse) = window.collapse_if_possible(&window, Window::DIM_Z, 4);
    assert!(did_collapse);
    assert_eq!(collapsed.z().end(), 12);
    assert_eq!(collapsed.num_iterations_total(), window.num_iterations_total());
    assert_eq!(coverage(&collapsed).len(), shape.total_size());

    // A sub-window that does not span its axes is left alone
    let part = window.split_window(Window::DIM_Z, 0, 2);
    let (same, did_collapse) = part.collapse_if_possible(&window, Window::DIM_Z, 4);
    assert!(!did_collapse);
    assert_eq!(same, part);
}

#[test]
fn slices_visit_every_plane() {
    let shape = TensorShape::new(&[4, 3, 5, 2]);
    let window = calculate_max_window(&shape, &Steps::default());
    let slices = window.slices(2);
    assert_eq!(slices.len(), 10);
    let mut counts: HashMap<Coordinates, usize> = HashMap::new();
    for slice in &slices {
        for (c, n) in coverage(slice) {
            *counts.entry(c).or_insert(0) += n;
        }
    }
    assert_eq!(counts.len(), shape.total_size());
    assert!(counts.values().all(|n| *n == 1));
}

#[test]
fn misaligned_subwindow_is_rejected() {
    let window = calculate_max_window(&TensorShape::new(&[16, 4]), &Steps::new(&[4]));
    let mut sub = window;
    sub.set(Window::DIM_X, Dimension::new(2, 16, 4));
    assert!(window.validate_subwindow(&sub).is_err());
    sub.set(Window::DIM_X, Dimension::new(0, 20, 4));
    assert!(window.validate_subwindow(&sub).is_err());
}

#[test]
fn device_vector_blocks_cover_axis_once() {
    for extent in 1..=40 {
        for preferred in [1, 2, 4, 8, 16] {
            let vec_size = adjust_vec_size(preferred, extent);
            assert!(vec_size <= extent);
            let mut hits = vec![0usize; extent];
            for (start, len) in leftover_first_blocks(extent, vec_size) {
                assert!(start + len <= extent);
                for hit in &mut hits[start..start + len] {
                    *hit += 1;
                }
            }
            assert!(hits.iter().all(|n| *n == 1), "extent {extent}, vec {vec_size}");
        }
    }
}
