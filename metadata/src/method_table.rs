//! Accessor for a type's descriptor (`MethodTable`).
//!
//! Only the parts needed to find non-virtual slots are modelled: the header
//! counters, the parent link and the multipurpose slots.

use std::fmt;

use crate::error::{MetadataError, Result};
use crate::layout::{MethodTableLayout, RuntimeLayout};
use crate::memory::{MemoryView, POINTER_SIZE};

/// Opaque type-metadata handle (the runtime's `MethodTable*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TypeHandle(usize);

impl TypeHandle {
    pub const fn from_raw(address: usize) -> Self {
        Self(address)
    }

    pub const fn as_raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for TypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodTable@{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MethodTable {
    layout: &'static MethodTableLayout,
    view: MemoryView,
}

impl MethodTable {
    /// # Safety
    /// `handle` must address a live `MethodTable` of the runtime `layout` was
    /// selected for. Its parent chain and slot storage are trusted the same way.
    pub unsafe fn new(layout: &'static RuntimeLayout, handle: TypeHandle) -> Self {
        Self {
            layout: &layout.method_table,
            view: MemoryView::new(handle.as_raw()),
        }
    }

    pub fn handle(&self) -> TypeHandle {
        TypeHandle(self.view.base())
    }

    pub fn flags(&self) -> u32 {
        self.view.read_u32(self.layout.flags_offset)
    }

    pub fn base_size(&self) -> u32 {
        self.view.read_u32(self.layout.base_size_offset)
    }

    pub fn flags2(&self) -> u16 {
        self.view.read_u16(self.layout.flags2_offset)
    }

    pub fn num_virtuals(&self) -> u16 {
        self.view.read_u16(self.layout.num_virtuals_offset)
    }

    pub fn num_interfaces(&self) -> u16 {
        self.view.read_u16(self.layout.num_interfaces_offset)
    }

    /// The parent type, or `None` for the root of the hierarchy.
    pub fn parent(&self) -> Option<MethodTable> {
        match self.view.read_pointer(self.layout.parent_offset) {
            0 => None,
            parent => Some(Self {
                layout: self.layout,
                // SAFETY: a live MethodTable's parent link is either null or
                // another live MethodTable.
                view: unsafe { MemoryView::new(parent) },
            }),
        }
    }

    /// Walk the parents of this type, nearest first, ending at the root.
    pub fn ancestors(&self) -> Ancestors {
        Ancestors { next: self.parent() }
    }

    pub fn has_non_virtual_slots(&self) -> bool {
        self.flags2() & self.layout.has_non_virtual_slots != 0
    }

    pub fn has_single_non_virtual_slot(&self) -> bool {
        self.flags2() & self.layout.has_single_non_virtual_slot != 0
    }

    /// Number of vtable indirection cells laid out after the fixed header.
    pub fn num_vtable_indirections(&self) -> usize {
        (self.num_virtuals() / self.layout.vtable_slots_per_chunk) as usize
    }

    /// Offset of the multipurpose slot selected by `flag`.
    ///
    /// The raw value of the multipurpose flags below `flag` picks the slot:
    /// 0 and 1 are the two slots inside the fixed header, any larger value `n`
    /// lands at `size + (n - 2) * 8`. Offsets past the fixed header are then
    /// shifted over the vtable indirection cells.
    fn multipurpose_slot_offset(&self, flag: u16) -> usize {
        let mask = (self.flags2() & flag.wrapping_sub(1)) as usize;
        let offset = match mask {
            0 => self.layout.multipurpose_slot1_offset,
            1 => self.layout.multipurpose_slot2_offset,
            n => self.layout.size + (n - 2) * POINTER_SIZE,
        };

        if offset >= self.layout.size {
            offset + self.num_vtable_indirections() * self.layout.vtable_indirection_size
        } else {
            offset
        }
    }

    /// Address of the multipurpose slot describing the non-virtual slots.
    pub fn non_virtual_slots_address(&self) -> Result<usize> {
        if !self.has_non_virtual_slots() {
            return Err(MetadataError::UnimplementedSlotKind("type has no non-virtual slots"));
        }
        let offset = self.multipurpose_slot_offset(self.layout.has_non_virtual_slots);
        Ok(self.view.address(offset))
    }

    /// Address of the slot with global index `slot`.
    ///
    /// Virtual slots (below `num_virtuals`) are not supported.
    pub fn slot_address(&self, slot: u16) -> Result<usize> {
        let num_virtuals = self.num_virtuals();
        if slot < num_virtuals {
            return Err(MetadataError::UnimplementedSlotKind("virtual slot"));
        }

        let slots = self.non_virtual_slots_address()?;
        if self.has_single_non_virtual_slot() {
            if slot != num_virtuals {
                return Err(MetadataError::SlotOutOfRange { slot, num_virtuals });
            }
            return Ok(slots);
        }

        // SAFETY: the multipurpose slot lies inside this MethodTable's allocation.
        let array = unsafe { MemoryView::new(slots) }.read_pointer(0);
        // The relative index is added as a byte offset, not scaled.
        Ok(array + (slot - num_virtuals) as usize)
    }
}

/// Iterator over a type's ancestors; see [`MethodTable::ancestors`].
#[derive(Debug, Clone)]
pub struct Ancestors {
    next: Option<MethodTable>,
}

impl Iterator for Ancestors {
    type Item = MethodTable;

    fn next(&mut self) -> Option<MethodTable> {
        let current = self.next.take()?;
        self.next = current.parent();
        Some(current)
    }
}
