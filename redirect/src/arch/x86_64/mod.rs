//! x86-64 entry jumps: `jmp rel32` and `jmp [rip + disp32]`.

pub mod writer;

use clrdetour_metadata::MemoryView;

use super::{Jump, JumpPatcher};
use crate::error::{RedirectError, Result};

const JMP_REL32: u8 = 0xE9;
const JMP_INDIRECT: u8 = 0xFF;
/// ModRM r/m value selecting RIP-relative addressing.
const RM_RIP_RELATIVE: u8 = 0x5;

const REL32_LEN: i64 = 5;
const INDIRECT_LEN: i64 = 6;

/// Largest displacement magnitude a `jmp rel32` is allowed to encode.
pub const NEAR_RANGE: u64 = 0x7FFF_FFFF;

/// Absolute target of a `jmp rel32` at `site`.
pub fn relative_target(site: usize, displacement: i32) -> usize {
    (site as i64)
        .wrapping_add(REL32_LEN)
        .wrapping_add(displacement as i64) as usize
}

/// Displacement that makes a `jmp rel32` at `site` land on `target`.
pub fn relative_displacement(site: usize, target: usize) -> Result<i32> {
    let displacement = (target as i64).wrapping_sub((site as i64).wrapping_add(REL32_LEN));
    if displacement.unsigned_abs() > NEAR_RANGE {
        return Err(RedirectError::DisplacementOverflow { site, target });
    }
    Ok(displacement as i32)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X86_64Patcher;

impl JumpPatcher for X86_64Patcher {
    unsafe fn decode(&self, site: usize) -> Result<Jump> {
        let view = MemoryView::new(site);
        match view.read_u8(0) {
            JMP_REL32 => Ok(Jump::Relative {
                site,
                displacement: view.read_i32(1),
            }),
            JMP_INDIRECT => {
                if view.read_u8(1) & 0x7 != RM_RIP_RELATIVE {
                    return Err(RedirectError::invalid_encoding(site, "indirect jump is not RIP-relative"));
                }
                let cell = (site as i64)
                    .wrapping_add(INDIRECT_LEN)
                    .wrapping_add(view.read_i32(2) as i64) as usize;
                Ok(Jump::Indirect { site, cell })
            }
            _ => Err(RedirectError::invalid_encoding(site, "expected jmp rel32 or jmp [rip+disp32]")),
        }
    }
}
