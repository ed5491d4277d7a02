//! Hard-coded descriptor layouts, one table per runtime version family.
//!
//! Nothing here is probed from memory. A version inside a known family gets
//! that family's offsets and the accessors trust them; a version outside every
//! family is refused instead of guessed at.
//!
//! Values were read off the runtime's `method.hpp` / `methodtable.h` for the
//! 64-bit builds and cross-checked against disassembly of `coreclr`.

use log::debug;

use crate::error::{MetadataError, Result};
use crate::version::RuntimeVersion;

/// Offsets, sizes and flag masks of `MethodDesc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDescLayout {
    /// Size of a plain IL `MethodDesc` header.
    pub method_desc_size: usize,
    /// Size of a `DynamicMethodDesc` header (LCG / IL stubs).
    pub dynamic_method_desc_size: usize,

    pub flags3_and_token_remainder_offset: usize,
    pub chunk_index_offset: usize,
    /// `m_bFlags2`; renamed `m_bFlags4` in 9.0 without moving.
    pub flags2_offset: usize,
    pub slot_number_offset: usize,
    pub flags_offset: usize,

    pub classification_mask: u16,
    pub has_non_vtable_slot: u16,
    pub is_static: u16,
    pub requires_full_slot_number: u16,
    /// Bits of the slot field that hold the slot when the number is packed.
    pub packed_slot_mask: u16,
}

/// Offsets, sizes and flag masks of `MethodTable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodTableLayout {
    /// Fixed-size part, up to and including the second multipurpose slot.
    pub size: usize,
    /// Size of one vtable indirection cell.
    pub vtable_indirection_size: usize,
    /// Virtual slots reachable through one indirection cell.
    pub vtable_slots_per_chunk: u16,

    pub flags_offset: usize,
    pub base_size_offset: usize,
    pub flags2_offset: usize,
    pub num_virtuals_offset: usize,
    pub num_interfaces_offset: usize,
    pub parent_offset: usize,
    pub multipurpose_slot1_offset: usize,
    pub multipurpose_slot2_offset: usize,

    pub has_non_virtual_slots: u16,
    pub has_single_non_virtual_slot: u16,
}

/// Known layout families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutFamily {
    /// Runtime majors 6, 7 and 8.
    Net8,
    /// Runtime majors 9 and 10.
    Net9,
}

impl LayoutFamily {
    pub fn for_version(version: RuntimeVersion) -> Result<Self> {
        match version.major {
            6..=8 => Ok(Self::Net8),
            9 | 10 => Ok(Self::Net9),
            _ => Err(MetadataError::UnsupportedRuntimeVersion(version)),
        }
    }

    pub fn layout(self) -> &'static RuntimeLayout {
        match self {
            Self::Net8 => &NET8,
            Self::Net9 => &NET9,
        }
    }
}

/// Everything the descriptor accessors need to know about one version family.
#[derive(Debug, PartialEq, Eq)]
pub struct RuntimeLayout {
    pub family: LayoutFamily,
    pub method_desc: MethodDescLayout,
    pub method_table: MethodTableLayout,
}

impl RuntimeLayout {
    /// Select the layout for `version`, or refuse an unknown major.
    pub fn for_version(version: RuntimeVersion) -> Result<&'static RuntimeLayout> {
        let family = LayoutFamily::for_version(version)?;
        debug!("Selected {:?} descriptor layout for runtime {}", family, version);
        Ok(family.layout())
    }
}

const METHOD_DESC_FIELDS: MethodDescLayout = MethodDescLayout {
    method_desc_size: 0,
    dynamic_method_desc_size: 0,
    flags3_and_token_remainder_offset: 0,
    chunk_index_offset: 2,
    flags2_offset: 3,
    slot_number_offset: 4,
    flags_offset: 6,
    classification_mask: 0x0007,
    has_non_vtable_slot: 0x0008,
    is_static: 0x0080,
    requires_full_slot_number: 0x8000,
    packed_slot_mask: 0x03FF,
};

const METHOD_TABLE: MethodTableLayout = MethodTableLayout {
    size: 0x40,
    vtable_indirection_size: 0x8,
    vtable_slots_per_chunk: 8,
    flags_offset: 0x0,
    base_size_offset: 0x4,
    flags2_offset: 0x8,
    num_virtuals_offset: 0xC,
    num_interfaces_offset: 0xE,
    parent_offset: 0x10,
    multipurpose_slot1_offset: 0x30,
    multipurpose_slot2_offset: 0x38,
    has_non_virtual_slots: 0x0008,
    has_single_non_virtual_slot: 0x4000,
};

static NET8: RuntimeLayout = RuntimeLayout {
    family: LayoutFamily::Net8,
    method_desc: MethodDescLayout {
        method_desc_size: 0x8,
        dynamic_method_desc_size: 0x28,
        ..METHOD_DESC_FIELDS
    },
    method_table: METHOD_TABLE,
};

// 9.0 grew MethodDesc by a code-data pointer.
static NET9: RuntimeLayout = RuntimeLayout {
    family: LayoutFamily::Net9,
    method_desc: MethodDescLayout {
        method_desc_size: 0x10,
        dynamic_method_desc_size: 0x30,
        ..METHOD_DESC_FIELDS
    },
    method_table: METHOD_TABLE,
};
