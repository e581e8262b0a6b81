//! Inline array components.
//!
//! An array component stores a `u32` length header followed by a fixed
//! number of element slots, all inside the chunk row. The registered size
//! of an array type always matches `size_of::<InlineArray<T, N>>()`.

use std::{
    alloc::Layout,
    fmt,
    marker::PhantomData,
    mem::{self, MaybeUninit},
    ptr,
};

/// Length header at the start of every array component.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ArrayHeader {
    pub len: u32,
}

/// The in-row representation of an array component with `N` slots.
#[repr(C)]
pub struct InlineArray<T, const N: usize> {
    header: ArrayHeader,
    data: [MaybeUninit<T>; N],
}

impl<T, const N: usize> InlineArray<T, N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            header: ArrayHeader { len: 0 },
            data: [const { MaybeUninit::uninit() }; N],
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.header.len as usize
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.header.len == 0
    }

    /// Push an element, handing it back if the array is full.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        let len = self.len();
        if len == N {
            return Err(value);
        }
        self.data[len].write(value);
        self.header.len += 1;
        Ok(())
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the first `len` slots are initialized
        unsafe { std::slice::from_raw_parts(self.data.as_ptr().cast::<T>(), self.len()) }
    }
}

impl<T, const N: usize> Default for InlineArray<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for InlineArray<T, N> {
    fn drop(&mut self) {
        let len = self.len();
        // SAFETY: the first `len` slots are initialized and dropped once
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(
                self.data.as_mut_ptr().cast::<T>(),
                len,
            ));
        }
    }
}

/// Byte offset of the first element inside an array component.
#[must_use]
pub const fn array_data_offset(element_align: usize) -> usize {
    let header = mem::size_of::<ArrayHeader>();
    if element_align > header {
        element_align
    } else {
        header
    }
}

/// Layout of an array component with `capacity` elements.
#[must_use]
pub fn array_layout(element: Layout, capacity: usize) -> Option<Layout> {
    let elements = Layout::from_size_align(element.size().checked_mul(capacity)?, element.align())
        .ok()?;
    let (layout, _) = Layout::new::<ArrayHeader>().extend(elements).ok()?;
    Some(layout.pad_to_align())
}

/// Mutable view over an array component stored in a chunk.
pub struct ArrayMut<'a, T> {
    header: *mut ArrayHeader,
    data: *mut T,
    capacity: usize,
    _marker: PhantomData<&'a mut T>,
}

impl<'a, T> ArrayMut<'a, T> {
    /// # Safety
    ///
    /// `base` must point to a live array component of element type `T` with
    /// `capacity` slots, exclusively borrowed for `'a`.
    pub(crate) unsafe fn from_raw(base: *mut u8, capacity: usize) -> Self {
        Self {
            header: base.cast::<ArrayHeader>(),
            // SAFETY: the data offset stays inside the component
            data: unsafe { base.add(array_data_offset(mem::align_of::<T>())) }.cast::<T>(),
            capacity,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        // SAFETY: the header is valid for 'a
        unsafe { (*self.header).len as usize }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Push an element, handing it back if the array is full.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        let len = self.len();
        if len == self.capacity {
            return Err(value);
        }
        // SAFETY: `len < capacity`, the slot is uninitialized
        unsafe {
            self.data.add(len).write(value);
            (*self.header).len += 1;
        }
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        // SAFETY: slot `len - 1` is initialized and becomes logically uninit
        unsafe {
            (*self.header).len -= 1;
            Some(self.data.add(len - 1).read())
        }
    }

    pub fn clear(&mut self) {
        let len = self.len();
        // SAFETY: the first `len` slots are initialized; the length is
        // reset before dropping so a panicking destructor cannot double drop
        unsafe {
            (*self.header).len = 0;
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.data, len));
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the first `len` slots are initialized
        unsafe { std::slice::from_raw_parts(self.data, self.len()) }
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: the first `len` slots are initialized, borrow is exclusive
        unsafe { std::slice::from_raw_parts_mut(self.data, self.len()) }
    }
}

impl<T: fmt::Debug> fmt::Debug for ArrayMut<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

/// Read an array component as a slice.
///
/// # Safety
///
/// `base` must point to a live array component of element type `T`.
pub(crate) unsafe fn array_slice<'a, T>(base: *const u8) -> &'a [T] {
    unsafe {
        let len = (*base.cast::<ArrayHeader>()).len as usize;
        let data = base.add(array_data_offset(mem::align_of::<T>())).cast::<T>();
        std::slice::from_raw_parts(data, len)
    }
}

pub(crate) unsafe fn construct_array(ptr: *mut u8) {
    unsafe { ptr.cast::<ArrayHeader>().write(ArrayHeader { len: 0 }) };
}

pub(crate) unsafe fn copy_array<T: Clone>(dst: *mut u8, src: *const u8) {
    unsafe {
        let items = array_slice::<T>(src);
        dst.cast::<ArrayHeader>().write(ArrayHeader {
            len: items.len() as u32,
        });
        let data = dst.add(array_data_offset(mem::align_of::<T>())).cast::<T>();
        for (i, item) in items.iter().enumerate() {
            data.add(i).write(item.clone());
        }
    }
}

pub(crate) unsafe fn drop_array<T>(ptr: *mut u8) {
    unsafe {
        let len = (*ptr.cast::<ArrayHeader>()).len as usize;
        let data = ptr.add(array_data_offset(mem::align_of::<T>())).cast::<T>();
        ptr::drop_in_place(ptr::slice_from_raw_parts_mut(data, len));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_matches_inline_array() {
        fn check<T, const N: usize>() {
            let layout = array_layout(Layout::new::<T>(), N).unwrap();
            assert_eq!(layout.size(), mem::size_of::<InlineArray<T, N>>());
            assert_eq!(layout.align(), mem::align_of::<InlineArray<T, N>>());
        }
        check::<u8, 3>();
        check::<u32, 5>();
        check::<u64, 15>();
        check::<[f32; 3], 4>();
    }

    #[test]
    fn test_inline_array_push() {
        let mut array = InlineArray::<String, 2>::new();
        assert!(array.push("a".to_string()).is_ok());
        assert!(array.push("b".to_string()).is_ok());
        assert_eq!(array.push("c".to_string()), Err("c".to_string()));
        assert_eq!(array.as_slice(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_array_mut_over_raw_memory() {
        let mut raw = InlineArray::<u64, 4>::new();
        let base = ptr::from_mut(&mut raw).cast::<u8>();

        // SAFETY: `raw` is a live InlineArray<u64, 4>
        let mut array = unsafe { ArrayMut::<u64>::from_raw(base, 4) };
        for i in 0..4 {
            assert!(array.push(i).is_ok());
        }
        assert_eq!(array.push(9), Err(9));
        array.as_mut_slice()[0] = 10;
        assert_eq!(array.pop(), Some(3));
        assert_eq!(array.as_slice(), &[10, 1, 2]);
        array.clear();
        assert!(array.is_empty());
        assert_eq!(raw.len(), 0);
    }
}
