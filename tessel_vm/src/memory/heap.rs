use std::ptr::{self, NonNull};

use super::{MemoryError, PageReservation};
use crate::register::Register;

/// A reservation backed by one zeroed heap allocation.
///
/// Committing is bookkeeping only. Decommitting zeroes the range so a
/// later commit observes the same fresh memory an OS mapping would give.
pub struct HeapReservation {
    slots: NonNull<Register>,
    len: usize,
}

// The allocation is owned exclusively by this value.
unsafe impl Send for HeapReservation {}

impl HeapReservation {
    pub fn reserve(size: usize) -> Self {
        let len = (size + Register::SIZE - 1) / Register::SIZE;
        let slots = vec![Register::EMPTY; len].into_boxed_slice();
        let slots = Box::into_raw(slots) as *mut Register;

        Self {
            // `Box::into_raw` never returns null
            slots: NonNull::new(slots).unwrap_or_else(NonNull::dangling),
            len,
        }
    }
}

impl PageReservation for HeapReservation {
    fn base(&self) -> NonNull<u8> {
        self.slots.cast()
    }

    fn size(&self) -> usize {
        self.len * Register::SIZE
    }

    fn commit(&mut self, offset: usize, len: usize) -> Result<(), MemoryError> {
        debug_assert!(offset + len <= self.size());
        Ok(())
    }

    fn decommit(&mut self, offset: usize, len: usize) -> Result<(), MemoryError> {
        debug_assert!(offset + len <= self.size());

        unsafe {
            ptr::write_bytes(self.base().as_ptr().add(offset), 0, len);
        }

        Ok(())
    }
}

impl Drop for HeapReservation {
    fn drop(&mut self) {
        unsafe {
            let slice = ptr::slice_from_raw_parts_mut(self.slots.as_ptr(), self.len);
            drop(Box::from_raw(slice));
        }
    }
}
