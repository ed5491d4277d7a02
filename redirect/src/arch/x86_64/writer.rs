//! Emitter for the handful of x86-64 jumps an entry stub is made of.
//!
//! Stub-building support; the redirect path decodes and patches jumps in
//! place and never emits code.

#[derive(Debug)]
pub struct X86_64Writer {
    base: *mut u8,
    code: *mut u8,
    pc: usize,
    size: usize,
}

impl X86_64Writer {
    /// # Safety
    /// `buffer` must be writable for `size` bytes while the writer is used.
    /// `pc` is the address the emitted code will execute at.
    pub unsafe fn new(buffer: *mut u8, size: usize, pc: usize) -> Self {
        Self {
            base: buffer,
            code: buffer,
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

    unsafe fn emit(&mut self, byte: u8) {
        debug_assert!(self.can_write(1));
        self.code.write(byte);
        self.code = self.code.add(1);
        self.pc = self.pc.wrapping_add(1);
    }

    unsafe fn emit_u32_le(&mut self, val: u32) {
        debug_assert!(self.can_write(4));
        (self.code as *mut u32).write_unaligned(val.to_le());
        self.code = self.code.add(4);
        self.pc = self.pc.wrapping_add(4);
    }

    unsafe fn emit_u64_le(&mut self, val: u64) {
        debug_assert!(self.can_write(8));
        (self.code as *mut u64).write_unaligned(val.to_le());
        self.code = self.code.add(8);
        self.pc = self.pc.wrapping_add(8);
    }

    /// `jmp rel32`: E9 cd (5 bytes). `target` is absolute and must be within ±2 GiB.
    pub unsafe fn put_jmp_near(&mut self, target: usize) {
        self.emit(0xE9);
        let rel = (target as i64).wrapping_sub(self.pc as i64 + 4);
        debug_assert!(rel >= i32::MIN as i64 && rel <= i32::MAX as i64);
        self.emit_u32_le(rel as u32);
    }

    /// `jmp [rip + disp32]`: FF 25 cd (6 bytes), jumping through the cell at `cell`.
    pub unsafe fn put_jmp_indirect(&mut self, cell: usize) {
        // FF /4 = JMP r/m64; ModRM mod=00, reg=4, rm=5 (RIP+disp32)
        self.emit(0xFF);
        self.emit(0x25);
        let rel = (cell as i64).wrapping_sub(self.pc as i64 + 4);
        debug_assert!(rel >= i32::MIN as i64 && rel <= i32::MAX as i64);
        self.emit_u32_le(rel as u32);
    }

    /// Far absolute jump via `jmp [rip+2]; ud2; .quad addr` (16 bytes).
    pub unsafe fn put_jmp_far(&mut self, target: usize) {
        self.emit(0xFF);
        self.emit(0x25);
        self.emit_u32_le(0x02); // skip over UD2
        self.emit(0x0F);
        self.emit(0x0B); // UD2
        self.emit_u64_le(target as u64);
    }

    /// `ret`: C3
    pub unsafe fn put_ret(&mut self) {
        self.emit(0xC3);
    }

    /// `nop`: 90
    pub unsafe fn put_nop(&mut self) {
        self.emit(0x90);
    }

    /// `int3`: CC
    pub unsafe fn put_breakpoint(&mut self) {
        self.emit(0xCC);
    }

    pub unsafe fn put_u64(&mut self, value: u64) {
        self.emit_u64_le(value);
    }

    pub unsafe fn put_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.can_write(bytes.len()));
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.code, bytes.len());
        self.code = self.code.add(bytes.len());
        self.pc = self.pc.wrapping_add(bytes.len());
    }
}
