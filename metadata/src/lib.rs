//! Views over the managed runtime's method and type descriptors.
//!
//! The runtime hands out opaque handles (`MethodHandle`, `TypeHandle`) that are
//! really addresses of its internal `MethodDesc` and `MethodTable` structures.
//! This crate knows, per runtime version family, where the interesting fields
//! of those structures live, and turns a handle into the address of the slot
//! holding the function's entry jump.
//!
//! # Example
//!
//! ```
//! use clrdetour_metadata::{LayoutFamily, RuntimeLayout, RuntimeVersion};
//!
//! let version: RuntimeVersion = "8.0.11".parse().unwrap();
//! let layout = RuntimeLayout::for_version(version).unwrap();
//! assert_eq!(layout.family, LayoutFamily::Net8);
//! assert_eq!(layout.method_desc.method_desc_size, 0x8);
//!
//! assert!(RuntimeLayout::for_version(RuntimeVersion::new(99, 0, 0)).is_err());
//! ```

pub mod error;
pub mod layout;
pub mod memory;
pub mod method_desc;
pub mod method_table;
pub mod version;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod tests;

pub use error::{MetadataError, Result};
pub use layout::{LayoutFamily, MethodDescLayout, MethodTableLayout, RuntimeLayout};
pub use memory::MemoryView;
pub use method_desc::{Classification, MethodDesc, MethodHandle};
pub use method_table::{Ancestors, MethodTable, TypeHandle};
pub use version::RuntimeVersion;
