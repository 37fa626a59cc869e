//! Bounds-checked views over caller-owned output arrays

use std::os::raw::c_int;
use tpu_adapter::{Result, TpuError};

/// Mutable view of a caller-provided array with a declared capacity
///
/// Writes are checked against the capacity; nothing is written past it.
#[derive(Debug)]
pub struct OutBuffer<'a, T> {
    slots: &'a mut [T],
}

impl<'a, T: Copy> OutBuffer<'a, T> {
    /// Build a view from a raw pointer and declared length
    ///
    /// Returns `None` for a negative length or a null pointer with a
    /// non-zero length. A zero length yields an empty view whatever the
    /// pointer.
    ///
    /// # Safety
    ///
    /// When `len > 0` and `ptr` is non-null, `ptr` must be valid for writes
    /// of `len` properly aligned values of `T` and must not be aliased for
    /// the lifetime `'a`.
    pub unsafe fn from_raw(ptr: *mut T, len: c_int) -> Option<Self> {
        let len = usize::try_from(len).ok()?;
        if len == 0 {
            return Some(Self { slots: &mut [] });
        }
        if ptr.is_null() {
            return None;
        }
        // SAFETY: non-null, and the caller guarantees `len` writable elements
        let slots = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
        Some(Self { slots })
    }

    /// Wrap an owned slice
    pub fn from_slice(slots: &'a mut [T]) -> Self {
        Self { slots }
    }

    /// Declared capacity
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Write one value, rejecting indexes at or past the capacity
    pub fn write(&mut self, index: usize, value: T) -> Result<()> {
        let capacity = self.slots.len();
        match self.slots.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(TpuError::BufferOverflow {
                requested: index + 1,
                capacity,
            }),
        }
    }

    /// Fill the whole buffer from `values`, which must match the capacity
    /// exactly; nothing is written otherwise
    pub fn copy_from(&mut self, values: &[T]) -> Result<()> {
        if values.len() != self.slots.len() {
            return Err(TpuError::BufferOverflow {
                requested: values.len(),
                capacity: self.slots.len(),
            });
        }
        self.slots.copy_from_slice(values);
        Ok(())
    }
}
