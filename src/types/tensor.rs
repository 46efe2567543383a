//! Tensor storage and the argument pack handed to `run`.
//!
//! Kernels never own tensor memory. A caller builds a [`TensorPack`] of
//! borrowed views and passes it to every `run` call; destination views can
//! be shared across threads as long as each thread writes a disjoint window.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use half::f16;

use super::info::TensorInfo;
use super::shape::Coordinates;
use crate::error::KernelError;

/// Plain-old-data element types that can live in a tensor buffer.
pub trait Element: Copy + Default + Send + Sync + 'static {
    const SIZE: usize;
    fn read_ne(bytes: &[u8]) -> Self;
    fn write_ne(self, out: &mut [u8]);
}

macro_rules! impl_element {
    ($($t:ty),*) => {
        $(
            impl Element for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                #[inline]
                fn read_ne(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$t>::from_ne_bytes(raw)
                }

                #[inline]
                fn write_ne(self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_ne_bytes());
                }
            }
        )*
    };
}

impl_element!(u8, i8, u16, i16, u32, i32, f32, f16);

/// Integer elements that widen losslessly to `i32`.
pub trait IntElement: Element {
    fn to_i32(self) -> i32;
    /// Narrow a value already clamped to the type range.
    fn from_i32(value: i32) -> Self;
}

macro_rules! impl_int_element {
    ($($t:ty),*) => {
        $(
            impl IntElement for $t {
                #[inline]
                fn to_i32(self) -> i32 {
                    self as i32
                }

                #[inline]
                fn from_i32(value: i32) -> Self {
                    value as $t
                }
            }
        )*
    };
}

impl_int_element!(u8, i8, u16, i16, i32);

/// Floating-point elements computed in `f32`.
pub trait FloatElement: Element {
    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
}

impl FloatElement for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }
}

impl FloatElement for f16 {
    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

/// An owned tensor: descriptor plus a contiguous byte buffer.
#[derive(Debug, Clone)]
pub struct Tensor {
    info: TensorInfo,
    buffer: Vec<u8>,
}

impl Tensor {
    /// Allocate a zero-filled tensor for `info`.
    pub fn new(info: TensorInfo) -> Self {
        let buffer = vec![0u8; info.total_size()];
        Self { info, buffer }
    }

    /// Allocate a tensor and fill it from `data`.
    pub fn from_slice<T: Element>(info: TensorInfo, data: &[T]) -> Result<Self, KernelError> {
        if info.element_size() != T::SIZE {
            return Err(KernelError::InvalidArgument(format!(
                "element size {} does not match data type {}",
                T::SIZE,
                info.data_type()
            )));
        }
        if info.shape().total_size() != data.len() {
            return Err(KernelError::MismatchingShapes(format!(
                "{} elements supplied for shape {}",
                data.len(),
                info.shape()
            )));
        }
        let mut tensor = Self::new(info);
        for (chunk, value) in tensor.buffer.chunks_exact_mut(T::SIZE).zip(data) {
            value.write_ne(chunk);
        }
        Ok(tensor)
    }

    pub fn info(&self) -> &TensorInfo {
        &self.info
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Copy the contents out as typed elements.
    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        self.buffer.chunks_exact(T::SIZE).map(T::read_ne).collect()
    }

    pub fn view(&self) -> TensorView<'_> {
        TensorView::new(&self.info, &self.buffer)
    }

    pub fn view_mut(&mut self) -> TensorViewMut<'_> {
        TensorViewMut::new(&self.info, &mut self.buffer)
    }
}

/// Read-only borrowed tensor.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    info: &'a TensorInfo,
    data: &'a [u8],
}

impl<'a> TensorView<'a> {
    pub fn new(info: &'a TensorInfo, data: &'a [u8]) -> Self {
        Self { info, data }
    }

    pub fn info(&self) -> &'a TensorInfo {
        self.info
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    #[inline]
    pub fn get_at<T: Element>(&self, byte_offset: usize) -> T {
        T::read_ne(&self.data[byte_offset..byte_offset + T::SIZE])
    }

    #[inline]
    pub fn get<T: Element>(&self, coords: &Coordinates) -> T {
        self.get_at(self.info.offset_of(coords))
    }

    /// Element at linear index `index`.
    #[inline]
    pub fn element<T: Element>(&self, index: usize) -> T {
        self.get_at(index * T::SIZE)
    }

    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        self.data.chunks_exact(T::SIZE).map(T::read_ne).collect()
    }
}

/// Writable borrowed tensor that can be shared across worker threads.
///
/// The bytes are viewed as relaxed atomics, so a copy of the view can be
/// handed to every worker. Threads are expected to write disjoint elements,
/// which the window partitioning of `run` guarantees. Overlapping writes
/// may tear an element but are not undefined behaviour.
#[derive(Clone, Copy)]
pub struct TensorViewMut<'a> {
    info: &'a TensorInfo,
    data: &'a [AtomicU8],
}

impl<'a> TensorViewMut<'a> {
    pub fn new(info: &'a TensorInfo, data: &'a mut [u8]) -> Self {
        // SAFETY: `AtomicU8` has the size and alignment of `u8`, and the
        // exclusive borrow keeps every other access out for 'a.
        let data = unsafe { &*(data as *mut [u8] as *const [AtomicU8]) };
        Self { info, data }
    }

    pub fn info(&self) -> &'a TensorInfo {
        self.info
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    fn cells<T: Element>(&self, byte_offset: usize, op: &str) -> &'a [AtomicU8] {
        assert!(
            byte_offset + T::SIZE <= self.data.len(),
            "{op} at byte {byte_offset} past end of {}-byte tensor",
            self.data.len()
        );
        &self.data[byte_offset..byte_offset + T::SIZE]
    }

    #[inline]
    pub fn set_at<T: Element>(&self, byte_offset: usize, value: T) {
        let mut raw = [0u8; 8];
        value.write_ne(&mut raw);
        for (cell, byte) in self.cells::<T>(byte_offset, "write").iter().zip(raw) {
            cell.store(byte, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn get_at<T: Element>(&self, byte_offset: usize) -> T {
        let mut raw = [0u8; 8];
        for (byte, cell) in raw.iter_mut().zip(self.cells::<T>(byte_offset, "read")) {
            *byte = cell.load(Ordering::Relaxed);
        }
        T::read_ne(&raw)
    }

    #[inline]
    pub fn set<T: Element>(&self, coords: &Coordinates, value: T) {
        self.set_at(self.info.offset_of(coords), value)
    }

    #[inline]
    pub fn get<T: Element>(&self, coords: &Coordinates) -> T {
        self.get_at(self.info.offset_of(coords))
    }

    #[inline]
    pub fn set_element<T: Element>(&self, index: usize, value: T) {
        self.set_at(index * T::SIZE, value)
    }

    #[inline]
    pub fn element<T: Element>(&self, index: usize) -> T {
        self.get_at(index * T::SIZE)
    }
}

impl fmt::Debug for TensorViewMut<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorViewMut")
            .field("info", self.info)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Argument slots of a kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorSlot {
    Src0,
    Src1,
    Src2,
    Src3,
    Src4,
    Dst0,
    Dst1,
    Workspace,
}

impl TensorSlot {
    pub const DST: TensorSlot = TensorSlot::Dst0;
}

impl fmt::Display for TensorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Src0 => "SRC_0",
            Self::Src1 => "SRC_1",
            Self::Src2 => "SRC_2",
            Self::Src3 => "SRC_3",
            Self::Src4 => "SRC_4",
            Self::Dst0 => "DST_0",
            Self::Dst1 => "DST_1",
            Self::Workspace => "WORKSPACE",
        };
        f.write_str(name)
    }
}

/// Slot-to-tensor mapping for one `run` call.
#[derive(Debug, Clone, Default)]
pub struct TensorPack<'a> {
    consts: Vec<(TensorSlot, TensorView<'a>)>,
    muts: Vec<(TensorSlot, TensorViewMut<'a>)>,
}

impl<'a> TensorPack<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_const(&mut self, slot: TensorSlot, view: TensorView<'a>) -> &mut Self {
        self.consts.retain(|(s, _)| *s != slot);
        self.consts.push((slot, view));
        self
    }

    pub fn add_mut(&mut self, slot: TensorSlot, view: TensorViewMut<'a>) -> &mut Self {
        self.muts.retain(|(s, _)| *s != slot);
        self.muts.push((slot, view));
        self
    }

    /// Builder form of [`add_const`](Self::add_const).
    pub fn with_const(mut self, slot: TensorSlot, view: TensorView<'a>) -> Self {
        self.add_const(slot, view);
        self
    }

    /// Builder form of [`add_mut`](Self::add_mut).
    pub fn with_mut(mut self, slot: TensorSlot, view: TensorViewMut<'a>) -> Self {
        self.add_mut(slot, view);
        self
    }

    pub fn get_const(&self, slot: TensorSlot) -> Result<TensorView<'a>, KernelError> {
        self.find_const(slot).ok_or(KernelError::MissingTensor(slot))
    }

    /// Optional inputs such as a bias.
    pub fn find_const(&self, slot: TensorSlot) -> Option<TensorView<'a>> {
        self.consts.iter().find(|(s, _)| *s == slot).map(|(_, v)| *v)
    }

    pub fn get_mut(&self, slot: TensorSlot) -> Result<TensorViewMut<'a>, KernelError> {
        self.muts
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, v)| *v)
            .ok_or(KernelError::MissingTensor(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, TensorShape};

    #[test]
    fn test_from_slice_round_trips_values() {
        let info = TensorInfo::new(TensorShape::new(&[3]), DataType::S32);
        let tensor = Tensor::from_slice(info, &[1i32, -2, 3]).unwrap();
        assert_eq!(tensor.to_vec::<i32>(), vec![1, -2, 3]);
        assert_eq!(tensor.view().element::<i32>(1), -2);
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        let info = TensorInfo::new(TensorShape::new(&[4]), DataType::S32);
        let err = Tensor::from_slice(info, &[1i32, 2]).unwrap_err();
        assert!(matches!(err, KernelError::MismatchingShapes(_)));
    }

    #[test]
    fn test_from_slice_rejects_wrong_element_size() {
        let info = TensorInfo::new(TensorShape::new(&[2]), DataType::QAsymm8);
        assert!(Tensor::from_slice(info, &[1i32, 2]).is_err());
    }

    #[test]
    fn test_mut_view_writes_are_visible() {
        let info = TensorInfo::new(TensorShape::new(&[2, 2]), DataType::QAsymm8);
        let mut tensor = Tensor::new(info);
        {
            let view = tensor.view_mut();
            view.set(&[1, 1, 0, 0, 0, 0], 7u8);
            assert_eq!(view.get_at::<u8>(3), 7);
        }
        assert_eq!(tensor.to_vec::<u8>(), vec![0, 0, 0, 7]);
    }

    #[test]
    fn test_shared_view_writes_from_many_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TensorViewMut<'_>>();

        // Slot 4 is contended by every thread; slots 0..4 are owned by one.
        let info = TensorInfo::new(TensorShape::new(&[5]), DataType::S32);
        let mut tensor = Tensor::new(info);
        let view = tensor.view_mut();
        std::thread::scope(|scope| {
            for id in 0..4usize {
                let v = view;
                scope.spawn(move || {
                    for i in 0..10_000 {
                        v.set_element::<i32>(4, i);
                        v.set_element::<i32>(id, id as i32 + 1);
                    }
                });
            }
        });
        assert_eq!(tensor.to_vec::<i32>()[..4], [1, 2, 3, 4]);
    }

    #[test]
    #[should_panic(expected = "past end")]
    fn test_out_of_bounds_write_panics() {
        let info = TensorInfo::new(TensorShape::new(&[2]), DataType::QSymm16);
        let mut tensor = Tensor::new(info);
        tensor.view_mut().set_element::<i16>(2, 1);
    }

    #[test]
    fn test_pack_reports_missing_slot() {
        let pack = TensorPack::new();
        let err = pack.get_const(TensorSlot::Src0).unwrap_err();
        assert_eq!(err, KernelError::MissingTensor(TensorSlot::Src0));
    }
}
