use thiserror::Error;

use clrdetour_metadata::MetadataError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedirectError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(&'static str),

    #[error("invalid instruction encoding at {address:#x}: {reason}")]
    InvalidInstructionEncoding { address: usize, reason: &'static str },

    #[error("displacement from {site:#x} to {target:#x} does not fit in a rel32 jump")]
    DisplacementOverflow { site: usize, target: usize },

    #[error("incompatible signature: {0}")]
    IncompatibleSignature(String),

    #[error("runtime version not configured (set CLRDETOUR_RUNTIME_VERSION)")]
    MissingRuntimeVersion,

    #[error("failed to change protection of {address:#x} (os error {errno})")]
    MemoryProtection { address: usize, errno: i32 },

    #[error("failed to allocate code memory (os error {errno})")]
    AllocationFailed { errno: i32 },

    #[error("code patching is not supported on this platform")]
    UnsupportedPlatform,
}

impl RedirectError {
    pub(crate) fn invalid_encoding(address: usize, reason: &'static str) -> Self {
        Self::InvalidInstructionEncoding { address, reason }
    }

    pub(crate) fn last_os_error(address: usize) -> Self {
        Self::MemoryProtection {
            address,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

pub type Result<T> = std::result::Result<T, RedirectError>;
