//! Raw reads from runtime-owned memory.
//!
//! Every address-plus-offset read of descriptor or instruction memory goes
//! through [`MemoryView`]. The runtime's structures cannot be bounds-checked
//! from the outside: a view is exactly as trustworthy as the address it was
//! built from, which is why building one is `unsafe` and reading is not.

use core::mem::size_of;

mod sealed {
    pub trait Sealed {}
}

/// Plain integers that may be read from arbitrary (possibly unaligned) memory.
pub trait Scalar: Copy + sealed::Sealed {}

macro_rules! scalar {
    ($($t:ty),*) => {
        $(
            impl sealed::Sealed for $t {}
            impl Scalar for $t {}
        )*
    };
}

scalar!(u8, u16, u32, u64, i8, i16, i32, i64, usize);

/// A non-owning window onto memory starting at `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryView {
    base: usize,
}

impl MemoryView {
    /// # Safety
    /// `base` must point to live memory that stays readable, for every offset
    /// later read through this view, for as long as the view is used.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    pub const fn base(&self) -> usize {
        self.base
    }

    pub const fn address(&self, offset: usize) -> usize {
        self.base.wrapping_add(offset)
    }

    /// A view `offset` bytes further in, under the same validity contract.
    pub const fn offset(&self, offset: usize) -> Self {
        Self { base: self.address(offset) }
    }

    #[inline]
    pub fn read<T: Scalar>(&self, offset: usize) -> T {
        // SAFETY: upheld by the constructor's contract.
        unsafe { core::ptr::read_unaligned(self.address(offset) as *const T) }
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.read(offset)
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le(self.read(offset))
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le(self.read(offset))
    }

    pub fn read_i32(&self, offset: usize) -> i32 {
        i32::from_le(self.read(offset))
    }

    /// Read a pointer-sized value.
    pub fn read_pointer(&self, offset: usize) -> usize {
        usize::from_le(self.read(offset))
    }

    /// Copy `N` bytes starting at `offset`.
    pub fn read_bytes<const N: usize>(&self, offset: usize) -> [u8; N] {
        // SAFETY: upheld by the constructor's contract.
        unsafe { core::ptr::read_unaligned(self.address(offset) as *const [u8; N]) }
    }
}

pub const POINTER_SIZE: usize = size_of::<usize>();
