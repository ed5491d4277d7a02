use thiserror::Error;

use crate::version::RuntimeVersion;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error("unsupported runtime version: {0} (supported majors: 6-10)")]
    UnsupportedRuntimeVersion(RuntimeVersion),

    #[error("invalid runtime version string: {0:?}")]
    InvalidVersion(String),

    #[error("unimplemented slot kind: {0}")]
    UnimplementedSlotKind(&'static str),

    #[error("unimplemented method descriptor classification: {0}")]
    UnimplementedClassification(u16),

    #[error("slot {slot} is past the single non-virtual slot of a type with {num_virtuals} virtuals")]
    SlotOutOfRange { slot: u16, num_virtuals: u16 },
}

pub type Result<T> = std::result::Result<T, MetadataError>;
