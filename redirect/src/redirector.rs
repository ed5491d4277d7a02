//! Pointing one managed method's entry jump at another method's body.
//!
//! Each method's precode begins with a jump to its compiled body. Redirecting
//! `original` to `replacement` rewrites the original's jump so it lands where
//! the replacement's jump lands. Nothing else changes: no code is copied and
//! the replacement keeps working as before.

use std::mem::ManuallyDrop;

use log::{debug, warn};

use clrdetour_metadata::{MemoryView, MethodDesc, MethodHandle, MethodTable, RuntimeLayout, RuntimeVersion, TypeHandle};

use crate::arch::{Arch, InstructionPatcher, JumpPatcher};
use crate::config::RedirectConfig;
use crate::error::{RedirectError, Result};
use crate::signature::SignatureCheck;

/// A method, optionally with the type that owns it.
///
/// The owner is only consulted for methods whose entry slot is not stored
/// inline behind their descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Function {
    pub method: MethodHandle,
    pub owner: Option<TypeHandle>,
}

impl Function {
    pub const fn new(method: MethodHandle) -> Self {
        Self { method, owner: None }
    }

    pub const fn with_owner(method: MethodHandle, owner: TypeHandle) -> Self {
        Self {
            method,
            owner: Some(owner),
        }
    }
}

impl From<MethodHandle> for Function {
    fn from(method: MethodHandle) -> Self {
        Self::new(method)
    }
}

/// What one patch changed, enough to undo it.
#[derive(Debug, PartialEq, Eq)]
pub struct PatchRecord {
    site: usize,
    original_target: usize,
    replacement_target: usize,
}

impl PatchRecord {
    /// Address of the patched jump instruction.
    pub fn site(&self) -> usize {
        self.site
    }

    pub fn original_target(&self) -> usize {
        self.original_target
    }

    pub fn replacement_target(&self) -> usize {
        self.replacement_target
    }
}

/// Resolves jump sites for one runtime and rewrites them.
#[derive(Debug, Clone, Copy)]
pub struct Redirector {
    layout: &'static RuntimeLayout,
    patcher: InstructionPatcher,
}

impl Redirector {
    /// A redirector for `version` on the host architecture.
    pub fn new(version: RuntimeVersion) -> Result<Self> {
        let layout = RuntimeLayout::for_version(version)?;
        Ok(Self::with_patcher(layout, InstructionPatcher::for_host()?))
    }

    pub fn from_config(config: &RedirectConfig) -> Result<Self> {
        let version = config.runtime_version.ok_or(RedirectError::MissingRuntimeVersion)?;
        let layout = RuntimeLayout::for_version(version)?;
        let patcher = InstructionPatcher::for_host()?.with_adr_prelude(config.arm64_adr_prelude);
        Ok(Self::with_patcher(layout, patcher))
    }

    pub fn from_env() -> Result<Self> {
        Self::from_config(&RedirectConfig::from_env()?)
    }

    pub fn with_patcher(layout: &'static RuntimeLayout, patcher: InstructionPatcher) -> Self {
        Self { layout, patcher }
    }

    pub fn layout(&self) -> &'static RuntimeLayout {
        self.layout
    }

    pub fn patcher(&self) -> InstructionPatcher {
        self.patcher
    }

    pub fn arch(&self) -> Arch {
        self.patcher.arch()
    }

    /// Address of the slot holding `function`'s jump site.
    ///
    /// # Safety
    /// The handles in `function` must address live runtime metadata of the
    /// version this redirector was built for.
    pub unsafe fn slot_address(&self, function: Function) -> Result<usize> {
        let method = MethodDesc::new(self.layout, function.method);
        match function.owner {
            Some(owner) if !method.has_non_vtable_slot() => {
                let table = MethodTable::new(self.layout, owner);
                Ok(table.slot_address(method.slot_number())?)
            }
            _ => Ok(method.addr_of_slot()?),
        }
    }

    /// Address of the first instruction of `function`'s entry jump.
    ///
    /// # Safety
    /// As for [`slot_address`](Self::slot_address).
    pub unsafe fn jump_site(&self, function: Function) -> Result<usize> {
        let slot = self.slot_address(function)?;
        Ok(MemoryView::new(slot).read_pointer(0))
    }

    /// Make calls to `original` land in `replacement`'s body.
    ///
    /// Both jump sites are resolved and decoded before anything is written,
    /// so an error leaves memory as it was. The returned handle reverts the
    /// patch when dropped.
    ///
    /// # Safety
    /// Both functions must be live methods of this runtime whose jump sites
    /// stay where they are while the redirection exists. The caller is
    /// responsible for the two methods being call-compatible and for no other
    /// thread rewriting either site concurrently.
    pub unsafe fn redirect(
        &self,
        original: impl Into<Function>,
        replacement: impl Into<Function>,
    ) -> Result<Redirection> {
        let (original, replacement) = (original.into(), replacement.into());

        let original_site = self.jump_site(original)?;
        let replacement_site = self.jump_site(replacement)?;
        let replacement_target = self.patcher.find_absolute_target(replacement_site)?;
        let original_target = self.patcher.find_absolute_target(original_site)?;

        self.patcher.patch_absolute_target(original_site, replacement_target)?;
        debug!(
            "Redirected {} (jump at {:#x}) from {:#x} to {:#x}",
            original.method, original_site, original_target, replacement_target
        );

        Ok(Redirection::new(
            self.patcher,
            PatchRecord {
                site: original_site,
                original_target,
                replacement_target,
            },
            None,
        ))
    }

    /// [`redirect`](Self::redirect), after `check` has accepted the pair.
    ///
    /// # Safety
    /// As for [`redirect`](Self::redirect).
    pub unsafe fn redirect_checked(
        &self,
        original: impl Into<Function>,
        replacement: impl Into<Function>,
        check: &dyn SignatureCheck,
    ) -> Result<Redirection> {
        let (original, replacement) = (original.into(), replacement.into());
        check
            .check(original, replacement)
            .map_err(RedirectError::IncompatibleSignature)?;
        self.redirect(original, replacement)
    }

    /// Redirect `original`, keeping its body reachable through `passthrough`.
    ///
    /// `passthrough` is a stub method supplied by the caller; its jump is
    /// pointed at the original body before the original's jump is pointed at
    /// the replacement. If the second write fails the first is undone.
    /// Reverting only restores the original; the stub keeps pointing at the
    /// original body.
    ///
    /// # Safety
    /// As for [`redirect`](Self::redirect), for all three functions.
    pub unsafe fn redirect_with_passthrough(
        &self,
        original: impl Into<Function>,
        replacement: impl Into<Function>,
        passthrough: impl Into<Function>,
    ) -> Result<Redirection> {
        let (original, replacement, passthrough) = (original.into(), replacement.into(), passthrough.into());

        let original_site = self.jump_site(original)?;
        let replacement_site = self.jump_site(replacement)?;
        let passthrough_site = self.jump_site(passthrough)?;
        let replacement_target = self.patcher.find_absolute_target(replacement_site)?;
        let original_target = self.patcher.find_absolute_target(original_site)?;
        let passthrough_target = self.patcher.find_absolute_target(passthrough_site)?;

        self.patcher.patch_absolute_target(passthrough_site, original_target)?;
        if let Err(e) = self.patcher.patch_absolute_target(original_site, replacement_target) {
            if let Err(rollback) = self.patcher.patch_absolute_target(passthrough_site, passthrough_target) {
                warn!("Failed to roll back pass-through jump at {:#x}: {}", passthrough_site, rollback);
            }
            return Err(e);
        }
        debug!(
            "Redirected {} from {:#x} to {:#x}, pass-through {} now reaches the original",
            original.method, original_target, replacement_target, passthrough.method
        );

        Ok(Redirection::new(
            self.patcher,
            PatchRecord {
                site: original_site,
                original_target,
                replacement_target,
            },
            Some(PatchRecord {
                site: passthrough_site,
                original_target: passthrough_target,
                replacement_target: original_target,
            }),
        ))
    }

    /// Undo a patch whose [`Redirection`] was leaked.
    ///
    /// # Safety
    /// `record` must come from a redirection made with this redirector's
    /// instruction set, and its site must still hold the patched jump.
    pub unsafe fn restore(&self, record: PatchRecord) -> Result<()> {
        self.patcher.patch_absolute_target(record.site, record.original_target)?;
        debug!("Restored jump at {:#x} to {:#x}", record.site, record.original_target);
        Ok(())
    }
}

/// A live redirection. Dropping it reverts the patch.
#[must_use = "dropping a Redirection reverts it immediately; use leak() to keep the patch"]
#[derive(Debug)]
pub struct Redirection {
    patcher: InstructionPatcher,
    record: PatchRecord,
    passthrough: Option<PatchRecord>,
    armed: bool,
}

impl Redirection {
    fn new(patcher: InstructionPatcher, record: PatchRecord, passthrough: Option<PatchRecord>) -> Self {
        Self {
            patcher,
            record,
            passthrough,
            armed: true,
        }
    }

    pub fn record(&self) -> &PatchRecord {
        &self.record
    }

    /// The pass-through stub's patch, for [`Redirector::redirect_with_passthrough`].
    pub fn passthrough(&self) -> Option<&PatchRecord> {
        self.passthrough.as_ref()
    }

    /// Point the original jump back at its original target.
    ///
    /// Fails with `InvalidInstructionEncoding` if the site no longer holds a
    /// jump this crate understands, in which case nothing is written.
    pub fn revert(mut self) -> Result<()> {
        self.armed = false;
        self.restore_original()
    }

    /// Keep the patch for the rest of the process, returning what it changed.
    pub fn leak(self) -> PatchRecord {
        let this = ManuallyDrop::new(self);
        debug!("Leaking redirection of jump at {:#x}", this.record.site);
        // SAFETY: `this` is never dropped, so `record` is moved out exactly once.
        unsafe { std::ptr::read(&this.record) }
    }

    fn restore_original(&self) -> Result<()> {
        // SAFETY: the redirection was created through an unsafe call whose
        // contract keeps the site valid for as long as this handle lives.
        unsafe {
            self.patcher
                .patch_absolute_target(self.record.site, self.record.original_target)?;
        }
        debug!(
            "Reverted jump at {:#x} to {:#x}",
            self.record.site, self.record.original_target
        );
        Ok(())
    }
}

impl Drop for Redirection {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.restore_original() {
            warn!("Failed to revert redirection of jump at {:#x}: {}", self.record.site, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clrdetour_metadata::testing::{fake_method, Scratch};
    use clrdetour_metadata::{LayoutFamily, MetadataError};

    fn x86(family: LayoutFamily) -> Redirector {
        Redirector::with_patcher(family.layout(), InstructionPatcher::new(Arch::X86_64))
    }

    fn arm64(skip_adr: bool) -> Redirector {
        Redirector::with_patcher(
            LayoutFamily::Net8.layout(),
            InstructionPatcher::new(Arch::Arm64).with_adr_prelude(skip_adr),
        )
    }

    /// `jmp [rip+2]; ud2; .quad target`
    fn indirect_stub(target: usize) -> Scratch {
        let mut stub = Scratch::new(16);
        stub.put::<[u8; 8]>(0, [0xFF, 0x25, 0x02, 0x00, 0x00, 0x00, 0x0F, 0x0B]);
        stub.put::<usize>(8, target);
        stub
    }

    /// `jmp rel32`
    fn relative_stub(displacement: i32) -> Scratch {
        let mut stub = Scratch::new(8);
        stub.put::<u8>(0, 0xE9);
        stub.put::<i32>(1, displacement);
        stub
    }

    struct Method {
        stub: Scratch,
        desc: Scratch,
    }

    impl Method {
        fn new(family: LayoutFamily, stub: Scratch) -> Self {
            let desc = fake_method(family.layout(), stub.addr());
            Self { stub, desc }
        }

        fn handle(&self) -> MethodHandle {
            MethodHandle::from_raw(self.desc.addr())
        }
    }

    #[test]
    fn test_indirect_redirect_and_revert() {
        let original = Method::new(LayoutFamily::Net8, indirect_stub(0x1111));
        let replacement = Method::new(LayoutFamily::Net8, indirect_stub(0x2222));
        let redirector = x86(LayoutFamily::Net8);

        let redirection = unsafe { redirector.redirect(original.handle(), replacement.handle()) }.expect("redirect");
        assert_eq!(redirection.record().site(), original.stub.addr());
        assert_eq!(redirection.record().original_target(), 0x1111);
        assert_eq!(redirection.record().replacement_target(), 0x2222);
        assert_eq!(original.stub.get::<usize>(8), 0x2222);
        assert_eq!(original.stub.get::<[u8; 8]>(0), [0xFF, 0x25, 0x02, 0x00, 0x00, 0x00, 0x0F, 0x0B]);
        assert_eq!(replacement.stub.get::<usize>(8), 0x2222);

        redirection.revert().expect("revert");
        assert_eq!(original.stub.get::<usize>(8), 0x1111);
    }

    #[test]
    fn test_relative_redirect_and_revert() {
        let original = Method::new(LayoutFamily::Net9, relative_stub(0x100));
        let replacement = Method::new(LayoutFamily::Net9, relative_stub(0x200));
        let redirector = x86(LayoutFamily::Net9);

        let replacement_target = replacement.stub.addr() + 5 + 0x200;
        let redirection = unsafe { redirector.redirect(original.handle(), replacement.handle()) }.expect("redirect");
        assert_eq!(redirection.record().replacement_target(), replacement_target);

        let displacement = original.stub.get::<i32>(1);
        assert_eq!(
            (original.stub.addr() as i64 + 5 + displacement as i64) as usize,
            replacement_target
        );
        assert_eq!(original.stub.get::<u8>(0), 0xE9);

        redirection.revert().expect("revert");
        assert_eq!(original.stub.get::<i32>(1), 0x100);
    }

    #[test]
    fn test_relative_overflow_leaves_site_unmodified() {
        let original = Method::new(LayoutFamily::Net8, relative_stub(0x40));
        let far = original.stub.addr().wrapping_add(0x1_0000_0000);
        let replacement = Method::new(LayoutFamily::Net8, indirect_stub(far));

        let err = unsafe { x86(LayoutFamily::Net8).redirect(original.handle(), replacement.handle()) }.unwrap_err();
        assert_eq!(
            err,
            RedirectError::DisplacementOverflow {
                site: original.stub.addr(),
                target: far
            }
        );
        assert_eq!(original.stub.get::<u8>(0), 0xE9);
        assert_eq!(original.stub.get::<i32>(1), 0x40);
    }

    #[test]
    fn test_resolution_failure_writes_nothing() {
        let original = Method::new(LayoutFamily::Net8, indirect_stub(0x1111));
        let replacement = Method::new(LayoutFamily::Net8, indirect_stub(0x2222));
        let mut vtable_method = Scratch::new(0x40);
        vtable_method.put::<u16>(6, 0); // no inline slot, no owner

        let err = unsafe {
            x86(LayoutFamily::Net8).redirect(original.handle(), MethodHandle::from_raw(vtable_method.addr()))
        }
        .unwrap_err();
        assert!(matches!(err, RedirectError::Metadata(MetadataError::UnimplementedSlotKind(_))));
        assert_eq!(original.stub.get::<usize>(8), 0x1111);

        // An unknown encoding at the original site is caught before the write.
        let mut garbage = Scratch::new(16);
        garbage.put::<[u8; 4]>(0, [0x90, 0x90, 0x90, 0xC3]);
        let broken = Method::new(LayoutFamily::Net8, garbage);
        let err = unsafe { x86(LayoutFamily::Net8).redirect(broken.handle(), replacement.handle()) }.unwrap_err();
        assert_eq!(
            err,
            RedirectError::InvalidInstructionEncoding {
                address: broken.stub.addr(),
                reason: "expected jmp rel32 or jmp [rip+disp32]"
            }
        );
        assert_eq!(broken.stub.get::<[u8; 4]>(0), [0x90, 0x90, 0x90, 0xC3]);
    }

    #[test]
    fn test_drop_reverts() {
        let original = Method::new(LayoutFamily::Net8, indirect_stub(0x1111));
        let replacement = Method::new(LayoutFamily::Net8, indirect_stub(0x2222));
        {
            let _redirection =
                unsafe { x86(LayoutFamily::Net8).redirect(original.handle(), replacement.handle()) }.expect("redirect");
            assert_eq!(original.stub.get::<usize>(8), 0x2222);
        }
        assert_eq!(original.stub.get::<usize>(8), 0x1111);
    }

    #[test]
    fn test_leak_keeps_patch_until_restored() {
        let original = Method::new(LayoutFamily::Net8, indirect_stub(0x1111));
        let replacement = Method::new(LayoutFamily::Net8, indirect_stub(0x2222));
        let redirector = x86(LayoutFamily::Net8);

        let record = unsafe { redirector.redirect(original.handle(), replacement.handle()) }
            .expect("redirect")
            .leak();
        assert_eq!(original.stub.get::<usize>(8), 0x2222);

        unsafe { redirector.restore(record) }.expect("restore");
        assert_eq!(original.stub.get::<usize>(8), 0x1111);
    }

    #[test]
    fn test_revert_fails_on_clobbered_site() {
        let mut original = Method::new(LayoutFamily::Net8, indirect_stub(0x1111));
        let replacement = Method::new(LayoutFamily::Net8, indirect_stub(0x2222));

        let redirection =
            unsafe { x86(LayoutFamily::Net8).redirect(original.handle(), replacement.handle()) }.expect("redirect");
        original.stub.put::<u8>(0, 0x90);

        let err = redirection.revert().unwrap_err();
        assert!(matches!(err, RedirectError::InvalidInstructionEncoding { .. }));
        assert_eq!(original.stub.get::<usize>(8), 0x2222);
    }

    #[test]
    fn test_checked_redirect_consults_the_check_first() {
        let original = Method::new(LayoutFamily::Net8, indirect_stub(0x1111));
        let replacement = Method::new(LayoutFamily::Net8, indirect_stub(0x2222));
        let redirector = x86(LayoutFamily::Net8);

        let reject = |_: Function, _: Function| -> std::result::Result<(), String> {
            Err("parameter count differs".to_string())
        };
        let err = unsafe { redirector.redirect_checked(original.handle(), replacement.handle(), &reject) }
            .unwrap_err();
        assert_eq!(err, RedirectError::IncompatibleSignature("parameter count differs".to_string()));
        assert_eq!(original.stub.get::<usize>(8), 0x1111);

        let seen = std::cell::Cell::new(None);
        let accept = |o: Function, r: Function| -> std::result::Result<(), String> {
            seen.set(Some((o.method, r.method)));
            Ok(())
        };
        let redirection = unsafe { redirector.redirect_checked(original.handle(), replacement.handle(), &accept) }
            .expect("redirect");
        assert_eq!(seen.get(), Some((original.handle(), replacement.handle())));
        assert_eq!(original.stub.get::<usize>(8), 0x2222);
        drop(redirection);
    }

    #[test]
    fn test_passthrough_reaches_the_original_body() {
        let original = Method::new(LayoutFamily::Net8, indirect_stub(0x1111));
        let replacement = Method::new(LayoutFamily::Net8, indirect_stub(0x2222));
        let passthrough = Method::new(LayoutFamily::Net8, indirect_stub(0x3333));

        let redirection = unsafe {
            x86(LayoutFamily::Net8).redirect_with_passthrough(
                original.handle(),
                replacement.handle(),
                passthrough.handle(),
            )
        }
        .expect("redirect");
        assert_eq!(original.stub.get::<usize>(8), 0x2222);
        assert_eq!(passthrough.stub.get::<usize>(8), 0x1111);

        let stub_record = redirection.passthrough().expect("passthrough record");
        assert_eq!(stub_record.site(), passthrough.stub.addr());
        assert_eq!(stub_record.original_target(), 0x3333);
        assert_eq!(stub_record.replacement_target(), 0x1111);

        redirection.revert().expect("revert");
        assert_eq!(original.stub.get::<usize>(8), 0x1111);
        assert_eq!(passthrough.stub.get::<usize>(8), 0x1111);
    }

    #[test]
    fn test_passthrough_rolled_back_when_original_write_fails() {
        let original = Method::new(LayoutFamily::Net8, relative_stub(0x40));
        let far = original.stub.addr().wrapping_add(0x1_0000_0000);
        let replacement = Method::new(LayoutFamily::Net8, indirect_stub(far));
        let passthrough = Method::new(LayoutFamily::Net8, indirect_stub(0x3333));

        let err = unsafe {
            x86(LayoutFamily::Net8).redirect_with_passthrough(
                original.handle(),
                replacement.handle(),
                passthrough.handle(),
            )
        }
        .unwrap_err();
        assert!(matches!(err, RedirectError::DisplacementOverflow { .. }));
        assert_eq!(original.stub.get::<i32>(1), 0x40);
        assert_eq!(passthrough.stub.get::<usize>(8), 0x3333);
    }

    #[test]
    fn test_owner_slot_table_is_used_without_inline_slot() {
        let layout = LayoutFamily::Net8.layout();
        let original_stub = indirect_stub(0x1111);
        let replacement = Method::new(LayoutFamily::Net8, indirect_stub(0x2222));

        // Slot 5 sits one byte past the array base for a type with 4 virtuals.
        let mut slots = Scratch::new(16);
        slots.put::<usize>(1, original_stub.addr());

        let mut table = Scratch::new(layout.method_table.size);
        table.put::<u16>(layout.method_table.flags2_offset, layout.method_table.has_non_virtual_slots);
        table.put::<u16>(layout.method_table.num_virtuals_offset, 4);
        table.put::<usize>(layout.method_table.multipurpose_slot1_offset, slots.addr());

        let mut desc = Scratch::new(0x40);
        desc.put::<u16>(layout.method_desc.slot_number_offset, 5);
        let original = Function::with_owner(MethodHandle::from_raw(desc.addr()), TypeHandle::from_raw(table.addr()));

        let redirector = x86(LayoutFamily::Net8);
        assert_eq!(unsafe { redirector.slot_address(original) }, Ok(slots.addr() + 1));

        let redirection = unsafe { redirector.redirect(original, replacement.handle()) }.expect("redirect");
        assert_eq!(original_stub.get::<usize>(8), 0x2222);
        redirection.revert().expect("revert");
        assert_eq!(original_stub.get::<usize>(8), 0x1111);
    }

    /// `[adr x12, #0;] ldr x11, literal; br x11; [nop;] .quad target`
    fn literal_stub(with_adr: bool, target: usize) -> Scratch {
        let mut stub = Scratch::new(24);
        if with_adr {
            stub.put::<u32>(0, 0x1000_000C);
            stub.put::<u32>(4, 0x5800_006B); // ldr x11, #12
            stub.put::<u32>(8, 0xD61F_0160);
            stub.put::<u32>(12, 0xD503_201F);
            stub.put::<usize>(16, target);
        } else {
            stub.put::<u32>(0, 0x5800_004B); // ldr x11, #8
            stub.put::<u32>(4, 0xD61F_0160);
            stub.put::<usize>(8, target);
        }
        stub
    }

    #[test]
    fn test_arm64_literal_redirect_with_and_without_prelude() {
        let original = Method::new(LayoutFamily::Net8, literal_stub(true, 0x1111));
        let replacement = Method::new(LayoutFamily::Net8, literal_stub(false, 0x2222));

        let redirection = unsafe { arm64(true).redirect(original.handle(), replacement.handle()) }.expect("redirect");
        assert_eq!(original.stub.get::<usize>(16), 0x2222);
        assert_eq!(original.stub.get::<u32>(0), 0x1000_000C);
        redirection.revert().expect("revert");
        assert_eq!(original.stub.get::<usize>(16), 0x1111);

        // With the prelude skip off the adr is not a jump.
        let err = unsafe { arm64(false).redirect(original.handle(), replacement.handle()) }.unwrap_err();
        assert!(matches!(err, RedirectError::InvalidInstructionEncoding { .. }));
        assert_eq!(original.stub.get::<usize>(16), 0x1111);
    }

    #[test]
    fn test_constructors_refuse_unknown_or_missing_versions() {
        let err = Redirector::new(RuntimeVersion::new(99, 0, 0)).unwrap_err();
        assert_eq!(
            err,
            RedirectError::Metadata(MetadataError::UnsupportedRuntimeVersion(RuntimeVersion::new(99, 0, 0)))
        );

        let err = Redirector::from_config(&RedirectConfig::default()).unwrap_err();
        assert_eq!(err, RedirectError::MissingRuntimeVersion);

        let config = RedirectConfig::default().with_runtime_version(RuntimeVersion::new(9, 0, 4));
        let redirector = Redirector::from_config(&config).expect("supported");
        assert_eq!(redirector.layout().family, LayoutFamily::Net9);
        assert_eq!(Some(redirector.arch()), Arch::host().ok());
    }
}
