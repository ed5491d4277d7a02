//! clrdetour: redirect a managed method to another by rewriting its entry jump.
//!
//! The runtime enters every compiled method through a small precode whose
//! first instruction is a jump to the method body. [`Redirector`] finds that
//! jump from the method's descriptor (see [`metadata`]), decodes it for the
//! host instruction set and retargets it at the replacement's body. The
//! returned [`Redirection`] puts the old target back when dropped.
//!
//! ```no_run
//! use clrdetour::{MethodHandle, Redirector, RuntimeVersion};
//!
//! # fn handles() -> (MethodHandle, MethodHandle) { unimplemented!() }
//! let (original, replacement) = handles();
//! let redirector = Redirector::new(RuntimeVersion::new(8, 0, 11))?;
//! let redirection = unsafe { redirector.redirect(original, replacement)? };
//! // ... calls to `original` now run `replacement` ...
//! redirection.revert()?;
//! # Ok::<(), clrdetour::RedirectError>(())
//! ```

pub mod arch;
pub mod code;
pub mod config;
pub mod error;
pub mod redirector;
pub mod signature;

pub use clrdetour_metadata as metadata;
pub use clrdetour_metadata::{MethodHandle, RuntimeVersion, TypeHandle};

pub use arch::{Arch, InstructionPatcher, Jump, JumpPatcher};
pub use config::RedirectConfig;
pub use error::{RedirectError, Result};
pub use redirector::{Function, PatchRecord, Redirection, Redirector};
pub use signature::SignatureCheck;

/// Process-global lock for tests that flip protection of executable pages.
#[cfg(test)]
pub(crate) fn lock_patch_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
