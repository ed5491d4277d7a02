//! Heap stand-ins for runtime structures, shared by this workspace's tests.
//!
//! Compiled for this crate's own tests and, with the `testing` feature, for
//! dependents that fake descriptors and precode stubs.

use core::mem::size_of;

use crate::layout::RuntimeLayout;

/// Zeroed, 8-byte aligned heap memory standing in for runtime structures.
pub struct Scratch {
    ptr: *mut u64,
    words: usize,
}

impl Scratch {
    pub fn new(bytes: usize) -> Self {
        let words = bytes.div_ceil(8).max(1);
        let boxed = vec![0u64; words].into_boxed_slice();
        Self {
            ptr: Box::into_raw(boxed) as *mut u64,
            words,
        }
    }

    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    pub fn put<T: Copy>(&mut self, offset: usize, value: T) {
        assert!(offset + size_of::<T>() <= self.words * 8, "write past scratch end");
        unsafe { (self.ptr as *mut u8).add(offset).cast::<T>().write_unaligned(value) }
    }

    pub fn get<T: Copy>(&self, offset: usize) -> T {
        assert!(offset + size_of::<T>() <= self.words * 8, "read past scratch end");
        unsafe { (self.ptr as *const u8).add(offset).cast::<T>().read_unaligned() }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(self.ptr, self.words)));
        }
    }
}

/// An IL method descriptor whose inline slot points at `jump_site`.
pub fn fake_method(layout: &RuntimeLayout, jump_site: usize) -> Scratch {
    let mut desc = Scratch::new(0x40);
    desc.put::<u16>(layout.method_desc.flags_offset, layout.method_desc.has_non_vtable_slot);
    desc.put::<usize>(layout.method_desc.method_desc_size, jump_site);
    desc
}
