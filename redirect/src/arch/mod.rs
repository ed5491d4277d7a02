//! Decoding and retargeting of entry jumps, per instruction set.
//!
//! A jump site is the first instruction of a method's precode. Only the few
//! forms the runtime actually emits there are understood; anything else is
//! reported as an invalid encoding rather than guessed at.

pub mod arm64;
pub mod x86_64;

use std::fmt;

use log::trace;

use clrdetour_metadata::MemoryView;

use crate::code::patcher::{write_i32, write_pointer};
use crate::error::{RedirectError, Result};

pub use arm64::Arm64Patcher;
pub use x86_64::X86_64Patcher;

/// Instruction sets whose entry jumps can be redirected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Arm64,
}

impl Arch {
    /// The CPU family this process runs on.
    pub fn host() -> Result<Self> {
        if cfg!(target_arch = "x86_64") {
            Ok(Self::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Ok(Self::Arm64)
        } else {
            Err(RedirectError::UnsupportedArchitecture(std::env::consts::ARCH))
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X86_64 => f.write_str("x86_64"),
            Self::Arm64 => f.write_str("aarch64"),
        }
    }
}

/// A decoded entry jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jump {
    /// `jmp rel32`: the target is encoded in the instruction.
    Relative { site: usize, displacement: i32 },
    /// `jmp [rip + disp32]`: the target lives in `cell`.
    Indirect { site: usize, cell: usize },
    /// `ldr xN, literal` followed by a branch through `xN`.
    ///
    /// `load` is the address of the `ldr`; it differs from `site` when an
    /// `adr x12, #0` prelude was stepped over.
    LiteralLoad {
        site: usize,
        load: usize,
        register: u8,
        cell: usize,
    },
}

impl Jump {
    pub fn site(&self) -> usize {
        match *self {
            Self::Relative { site, .. } | Self::Indirect { site, .. } | Self::LiteralLoad { site, .. } => site,
        }
    }

    /// The data cell holding the target, for jumps that have one.
    pub fn cell(&self) -> Option<usize> {
        match *self {
            Self::Relative { .. } => None,
            Self::Indirect { cell, .. } | Self::LiteralLoad { cell, .. } => Some(cell),
        }
    }

    pub fn skipped_prelude(&self) -> bool {
        matches!(*self, Self::LiteralLoad { site, load, .. } if site != load)
    }

    /// Absolute address the jump currently lands on.
    ///
    /// # Safety
    /// For cell-based jumps the cell must still be readable.
    pub unsafe fn target(&self) -> usize {
        match *self {
            Self::Relative { site, displacement } => x86_64::relative_target(site, displacement),
            Self::Indirect { cell, .. } | Self::LiteralLoad { cell, .. } => MemoryView::new(cell).read_pointer(0),
        }
    }

    /// Make the jump land on `target`.
    ///
    /// A relative jump rewrites its 4-byte displacement and fails without
    /// writing when `target` is out of reach. Cell-based jumps rewrite only the
    /// cell; the instruction bytes are never touched.
    ///
    /// # Safety
    /// The jump must still be at `site()`, and nothing may depend on the old target.
    pub unsafe fn retarget(&self, target: usize) -> Result<()> {
        match *self {
            Self::Relative { site, .. } => {
                let displacement = x86_64::relative_displacement(site, target)?;
                write_i32(site + 1, displacement)
            }
            Self::Indirect { cell, .. } | Self::LiteralLoad { cell, .. } => write_pointer(cell, target),
        }
    }
}

/// Reads and rewrites the absolute target of a jump site.
pub trait JumpPatcher {
    /// Decode the jump at `site`.
    ///
    /// # Safety
    /// `site` must point to readable memory holding at least one full instruction.
    unsafe fn decode(&self, site: usize) -> Result<Jump>;

    /// # Safety
    /// As for [`decode`](Self::decode); the cell of a cell-based jump must be readable too.
    unsafe fn find_absolute_target(&self, site: usize) -> Result<usize> {
        let jump = self.decode(site)?;
        let target = jump.target();
        trace!("Decoded {:?} -> {:#x}", jump, target);
        Ok(target)
    }

    /// # Safety
    /// As for [`Jump::retarget`].
    unsafe fn patch_absolute_target(&self, site: usize, target: usize) -> Result<()> {
        let jump = self.decode(site)?;
        trace!("Retargeting {:?} -> {:#x}", jump, target);
        jump.retarget(target)
    }
}

/// The patcher for one instruction set, chosen once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionPatcher {
    X86_64(X86_64Patcher),
    Arm64(Arm64Patcher),
}

impl InstructionPatcher {
    pub fn for_host() -> Result<Self> {
        Ok(Self::new(Arch::host()?))
    }

    pub fn new(arch: Arch) -> Self {
        match arch {
            Arch::X86_64 => Self::X86_64(X86_64Patcher),
            Arch::Arm64 => Self::Arm64(Arm64Patcher::default()),
        }
    }

    /// Whether the ARM64 decoder steps over an `adr x12, #0` prelude. No effect on x86-64.
    pub fn with_adr_prelude(self, skip: bool) -> Self {
        match self {
            Self::Arm64(_) => Self::Arm64(Arm64Patcher::new(skip)),
            other => other,
        }
    }

    pub fn arch(&self) -> Arch {
        match self {
            Self::X86_64(_) => Arch::X86_64,
            Self::Arm64(_) => Arch::Arm64,
        }
    }
}

impl JumpPatcher for InstructionPatcher {
    unsafe fn decode(&self, site: usize) -> Result<Jump> {
        match self {
            Self::X86_64(p) => p.decode(site),
            Self::Arm64(p) => p.decode(site),
        }
    }
}
