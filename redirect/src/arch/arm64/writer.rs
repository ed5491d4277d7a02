//! Emitter for ARM64 precode-shaped stubs.
//!
//! Stub-building support only; nothing in the redirect path emits code.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0,
    X11 = 11,
    X12 = 12,
    X16 = 16,
}

#[derive(Debug)]
pub struct Arm64Writer {
    base: *mut u32,
    code: *mut u32,
    pc: usize,
    size: usize,
}

impl Arm64Writer {
    /// # Safety
    /// `buffer` must be 4-byte aligned and writable for `size` bytes while the
    /// writer is used. `pc` is the address the emitted code will execute at.
    pub unsafe fn new(buffer: *mut u8, size: usize, pc: usize) -> Self {
        Self {
            base: buffer as *mut u32,
            code: buffer as *mut u32,
            pc,
            size,
        }
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn offset(&self) -> usize {
        (self.code as usize).saturating_sub(self.base as usize)
    }

    fn can_write(&self, bytes: usize) -> bool {
        self.offset() + bytes <= self.size
    }

    unsafe fn put_u32(&mut self, insn: u32) {
        debug_assert!(self.can_write(4));
        self.code.write(insn.to_le());
        self.code = self.code.add(1);
        self.pc = self.pc.wrapping_add(4);
    }

    /// Inline 8-byte literal.
    pub unsafe fn put_u64(&mut self, value: u64) {
        debug_assert!(self.can_write(8));
        (self.code as *mut u64).write_unaligned(value.to_le());
        self.code = self.code.add(2);
        self.pc = self.pc.wrapping_add(8);
    }

    pub unsafe fn put_ret(&mut self) {
        self.put_u32(0xD65F03C0);
    }

    pub unsafe fn put_nop(&mut self) {
        self.put_u32(0xD503201F);
    }

    pub unsafe fn put_br_reg(&mut self, reg: Reg) {
        self.put_u32(0xD61F0000 | ((reg as u32) << 5));
    }

    /// `adr Xd, #imm` with a byte offset in ±1 MiB.
    pub unsafe fn put_adr(&mut self, reg: Reg, imm: i32) {
        let imm = (imm as u32) & 0x1F_FFFF;
        let immlo = imm & 0x3;
        let immhi = imm >> 2;
        self.put_u32(0x1000_0000 | (immlo << 29) | (immhi << 5) | reg as u32);
    }

    /// `ldr Xt, [pc + byte_offset]`; the offset must be a multiple of 4.
    pub unsafe fn put_ldr_literal(&mut self, reg: Reg, byte_offset: i32) {
        debug_assert_eq!(byte_offset % 4, 0);
        let imm19 = ((byte_offset / 4) as u32) & 0x7FFFF;
        self.put_u32(0x5800_0000 | (imm19 << 5) | reg as u32);
    }
}
