//! Accessor for a method's descriptor (`MethodDesc`).
//!
//! A method whose entry point is not shared through its type's vtable keeps a
//! "non-vtable slot" directly behind its descriptor header. That slot holds
//! the address of the method's precode, whose first instruction is the jump
//! we redirect.

use std::fmt;

use crate::error::{MetadataError, Result};
use crate::layout::{MethodDescLayout, RuntimeLayout};
use crate::memory::MemoryView;

/// Opaque function-metadata handle (the runtime's `MethodDesc*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MethodHandle(usize);

impl MethodHandle {
    pub const fn from_raw(address: usize) -> Self {
        Self(address)
    }

    pub const fn as_raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for MethodHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodDesc@{:#x}", self.0)
    }
}

/// Structural subtype of a descriptor, from the low bits of `flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Classification {
    Il = 0,
    FCall = 1,
    NDirect = 2,
    EEImpl = 3,
    Array = 4,
    Instantiated = 5,
    ComInterop = 6,
    Dynamic = 7,
}

impl Classification {
    fn from_bits(bits: u16) -> Self {
        match bits & 0x7 {
            0 => Self::Il,
            1 => Self::FCall,
            2 => Self::NDirect,
            3 => Self::EEImpl,
            4 => Self::Array,
            5 => Self::Instantiated,
            6 => Self::ComInterop,
            _ => Self::Dynamic,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MethodDesc {
    layout: &'static MethodDescLayout,
    view: MemoryView,
}

impl MethodDesc {
    /// # Safety
    /// `handle` must address a live `MethodDesc` of the runtime `layout` was
    /// selected for, including its trailing non-vtable slot when it has one.
    pub unsafe fn new(layout: &'static RuntimeLayout, handle: MethodHandle) -> Self {
        Self {
            layout: &layout.method_desc,
            view: MemoryView::new(handle.as_raw()),
        }
    }

    pub fn handle(&self) -> MethodHandle {
        MethodHandle(self.view.base())
    }

    pub fn flags3_and_token_remainder(&self) -> u16 {
        self.view.read_u16(self.layout.flags3_and_token_remainder_offset)
    }

    pub fn chunk_index(&self) -> u8 {
        self.view.read_u8(self.layout.chunk_index_offset)
    }

    pub fn flags2(&self) -> u8 {
        self.view.read_u8(self.layout.flags2_offset)
    }

    /// Raw 16-bit slot field, including any packed auxiliary bits.
    pub fn raw_slot_number(&self) -> u16 {
        self.view.read_u16(self.layout.slot_number_offset)
    }

    pub fn flags(&self) -> u16 {
        self.view.read_u16(self.layout.flags_offset)
    }

    pub fn classification(&self) -> Classification {
        Classification::from_bits(self.flags() & self.layout.classification_mask)
    }

    pub fn is_static(&self) -> bool {
        self.flags() & self.layout.is_static != 0
    }

    pub fn has_non_vtable_slot(&self) -> bool {
        self.flags() & self.layout.has_non_vtable_slot != 0
    }

    pub fn requires_full_slot_number(&self) -> bool {
        self.flags() & self.layout.requires_full_slot_number != 0
    }

    /// Slot index within the owning type.
    ///
    /// When the full-slot-number flag is set only the low 10 bits are the
    /// slot; the rest of the word belongs to other per-method data.
    pub fn slot_number(&self) -> u16 {
        let raw = self.raw_slot_number();
        if self.requires_full_slot_number() {
            raw & self.layout.packed_slot_mask
        } else {
            raw
        }
    }

    /// Size of the fixed header the non-vtable slot follows.
    pub fn base_size(&self) -> Result<usize> {
        match self.classification() {
            Classification::Il => Ok(self.layout.method_desc_size),
            Classification::Dynamic => Ok(self.layout.dynamic_method_desc_size),
            other => Err(MetadataError::UnimplementedClassification(other as u16)),
        }
    }

    /// Address of the slot holding the pointer to the method's entry jump.
    pub fn addr_of_slot(&self) -> Result<usize> {
        if !self.has_non_vtable_slot() {
            // Vtable-resident slots are found through the owning type.
            return Err(MetadataError::UnimplementedSlotKind(
                "vtable slot (resolve through the owning MethodTable)",
            ));
        }
        Ok(self.view.address(self.base_size()?))
    }

    /// Address of the entry jump instruction, read from the non-vtable slot.
    pub fn jump_site(&self) -> Result<usize> {
        let slot = self.addr_of_slot()?;
        Ok(self.view.read_pointer(slot - self.view.base()))
    }
}
