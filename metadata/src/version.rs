//! Runtime version triple.
//!
//! The harness reports the version of the runtime it is hosted in (for example
//! `Environment.Version`), and the major component alone decides which
//! descriptor layout applies.

use std::fmt;
use std::str::FromStr;

use crate::error::MetadataError;

/// Runtime version (major.minor.build)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuntimeVersion {
    pub major: u16,
    pub minor: u16,
    pub build: u32,
}

impl RuntimeVersion {
    pub const fn new(major: u16, minor: u16, build: u32) -> Self {
        Self { major, minor, build }
    }

    /// Parse strings like "8.0.11", "9.0.0-rc.2.24473.5" or "10.0".
    ///
    /// Anything after the build number (pre-release tags, build metadata,
    /// a fourth revision component) is ignored. A missing build is 0.
    pub fn parse(version_str: &str) -> Option<Self> {
        let version_part = version_str.split_whitespace().next()?;
        let version_part = version_part.split(['-', '+']).next()?;
        let mut parts = version_part.split('.');

        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let build = match parts.next() {
            Some(s) => s.parse().ok()?,
            None => 0,
        };
        Some(Self { major, minor, build })
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

impl FromStr for RuntimeVersion {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| MetadataError::InvalidVersion(s.to_string()))
    }
}
