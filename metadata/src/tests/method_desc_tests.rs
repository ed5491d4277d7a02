//! Tests for the method descriptor accessor.

use super::Scratch;
use crate::error::MetadataError;
use crate::layout::{LayoutFamily, RuntimeLayout};
use crate::method_desc::{Classification, MethodDesc, MethodHandle};

const HAS_NON_VTABLE_SLOT: u16 = 0x0008;
const IS_STATIC: u16 = 0x0080;
const REQUIRES_FULL_SLOT_NUMBER: u16 = 0x8000;

fn net8() -> &'static RuntimeLayout {
    LayoutFamily::Net8.layout()
}

fn net9() -> &'static RuntimeLayout {
    LayoutFamily::Net9.layout()
}

/// A descriptor with the given flags and, behind every candidate header size,
/// a distinct fake jump-site pointer.
fn descriptor(flags: u16) -> Scratch {
    let mut md = Scratch::new(0x40);
    md.put::<u16>(6, flags);
    for header in [0x8usize, 0x10, 0x28, 0x30] {
        md.put::<usize>(header, 0x1000 + header);
    }
    md
}

fn view(layout: &'static RuntimeLayout, md: &Scratch) -> MethodDesc {
    unsafe { MethodDesc::new(layout, MethodHandle::from_raw(md.addr())) }
}

#[test]
fn test_il_method_slot_follows_the_method_desc_header() {
    let md = descriptor(HAS_NON_VTABLE_SLOT);

    assert_eq!(view(net8(), &md).addr_of_slot(), Ok(md.addr() + 0x8));
    assert_eq!(view(net9(), &md).addr_of_slot(), Ok(md.addr() + 0x10));
}

#[test]
fn test_dynamic_method_slot_follows_the_dynamic_header() {
    let md = descriptor(HAS_NON_VTABLE_SLOT | 7);

    let desc = view(net8(), &md);
    assert_eq!(desc.classification(), Classification::Dynamic);
    assert_eq!(desc.addr_of_slot(), Ok(md.addr() + 0x28));
    assert_eq!(view(net9(), &md).addr_of_slot(), Ok(md.addr() + 0x30));
}

#[test]
fn test_jump_site_is_read_from_the_slot() {
    let md = descriptor(HAS_NON_VTABLE_SLOT);
    assert_eq!(view(net8(), &md).jump_site(), Ok(0x1008));
    assert_eq!(view(net9(), &md).jump_site(), Ok(0x1010));

    let md = descriptor(HAS_NON_VTABLE_SLOT | 7);
    assert_eq!(view(net9(), &md).jump_site(), Ok(0x1030));
}

#[test]
fn test_other_classifications_are_unimplemented() {
    for classification in 1..=6u16 {
        let md = descriptor(HAS_NON_VTABLE_SLOT | classification);
        assert_eq!(
            view(net8(), &md).addr_of_slot(),
            Err(MetadataError::UnimplementedClassification(classification))
        );
    }
}

#[test]
fn test_vtable_slot_is_refused_before_classification() {
    // Classification 3 would also fail; the slot kind is checked first.
    let md = descriptor(3);
    assert!(matches!(
        view(net8(), &md).addr_of_slot(),
        Err(MetadataError::UnimplementedSlotKind(_))
    ));
    assert!(matches!(
        view(net8(), &md).jump_site(),
        Err(MetadataError::UnimplementedSlotKind(_))
    ));
}

#[test]
fn test_slot_number_masks_packed_bits_only_when_flagged() {
    let mut md = descriptor(HAS_NON_VTABLE_SLOT);
    md.put::<u16>(4, 0x8C05);
    assert_eq!(view(net8(), &md).slot_number(), 0x8C05);

    md.put::<u16>(6, HAS_NON_VTABLE_SLOT | REQUIRES_FULL_SLOT_NUMBER);
    let desc = view(net8(), &md);
    assert!(desc.requires_full_slot_number());
    assert_eq!(desc.raw_slot_number(), 0x8C05);
    assert_eq!(desc.slot_number(), 0x005);
}

#[test]
fn test_raw_fields_are_read_at_layout_offsets() {
    let mut md = descriptor(HAS_NON_VTABLE_SLOT | IS_STATIC);
    md.put::<u16>(0, 0xBEEF);
    md.put::<u8>(2, 0x21);
    md.put::<u8>(3, 0x42);

    let desc = view(net9(), &md);
    assert_eq!(desc.flags3_and_token_remainder(), 0xBEEF);
    assert_eq!(desc.chunk_index(), 0x21);
    assert_eq!(desc.flags2(), 0x42);
    assert!(desc.is_static());
    assert!(desc.has_non_vtable_slot());
    assert_eq!(desc.classification(), Classification::Il);
    assert_eq!(desc.handle(), MethodHandle::from_raw(md.addr()));
}
