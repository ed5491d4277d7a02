//! ARM64 entry jumps: `ldr xN, literal` (optionally behind `adr x12, #0`)
//! followed by a branch through `xN`.
//!
//! Only the literal load is decoded. The branch after it is assumed, which is
//! safe because the target is read from and written to the literal cell.

pub mod writer;

use clrdetour_metadata::MemoryView;

use super::{Jump, JumpPatcher};
use crate::error::{RedirectError, Result};

const ADR_MASK: u32 = 0x9F00_0000;
const ADR_OPCODE: u32 = 0x1000_0000;
const LDR_LITERAL_MASK: u32 = 0xFF00_0000;
const LDR_LITERAL_X: u32 = 0x5800_0000;

/// Register the runtime's precode materializes its own address into.
const PRELUDE_REGISTER: u32 = 12;

fn sign_extend(value: i64, bits: u32) -> i64 {
    let shift = 64 - bits;
    (value << shift) >> shift
}

pub(crate) fn decode_imm21_adr(insn: u32) -> i64 {
    let immlo = ((insn >> 29) & 0x3) as i64;
    let immhi = ((insn >> 5) & 0x7ffff) as i64;
    sign_extend((immhi << 2) | immlo, 21)
}

pub(crate) fn decode_imm19(insn: u32) -> i64 {
    sign_extend(((insn >> 5) & 0x7ffff) as i64, 19)
}

/// `adr x12, #0`, and nothing looser.
fn is_adr_prelude(insn: u32) -> bool {
    insn & ADR_MASK == ADR_OPCODE && decode_imm21_adr(insn) == 0 && insn & 0x1F == PRELUDE_REGISTER
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arm64Patcher {
    skip_adr_prelude: bool,
}

impl Default for Arm64Patcher {
    fn default() -> Self {
        Self { skip_adr_prelude: true }
    }
}

impl Arm64Patcher {
    pub fn new(skip_adr_prelude: bool) -> Self {
        Self { skip_adr_prelude }
    }
}

impl JumpPatcher for Arm64Patcher {
    unsafe fn decode(&self, site: usize) -> Result<Jump> {
        let view = MemoryView::new(site);
        let load = if self.skip_adr_prelude && is_adr_prelude(view.read_u32(0)) {
            site + 4
        } else {
            site
        };

        let insn = view.read_u32(load - site);
        if insn & LDR_LITERAL_MASK != LDR_LITERAL_X {
            return Err(RedirectError::invalid_encoding(load, "expected ldr xN, literal"));
        }

        let cell = (load as i64).wrapping_add(decode_imm19(insn) * 4) as usize;
        Ok(Jump::LiteralLoad {
            site,
            load,
            register: (insn & 0x1F) as u8,
            cell,
        })
    }
}
