//! Redirector settings, from code or from the environment.

use clrdetour_metadata::RuntimeVersion;

use crate::error::Result;

/// Runtime version the host reports, e.g. `8.0.11`.
pub const RUNTIME_VERSION_VAR: &str = "CLRDETOUR_RUNTIME_VERSION";
/// Set to `0`, `false`, `off` or `no` to stop stepping over `adr x12, #0` on ARM64.
pub const ADR_PRELUDE_VAR: &str = "CLRDETOUR_ARM64_ADR_PRELUDE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectConfig {
    /// Selects the descriptor layout. Required to build a redirector.
    pub runtime_version: Option<RuntimeVersion>,
    /// Whether the ARM64 decoder steps over an `adr x12, #0` before the literal load.
    pub arm64_adr_prelude: bool,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            runtime_version: None,
            arm64_adr_prelude: true,
        }
    }
}

impl RedirectConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or blank keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup(RUNTIME_VERSION_VAR).filter(|v| !v.trim().is_empty()) {
            config.runtime_version = Some(value.trim().parse()?);
        }
        if let Some(value) = lookup(ADR_PRELUDE_VAR).filter(|v| !v.trim().is_empty()) {
            config.arm64_adr_prelude = !is_disabled(&value);
        }
        Ok(config)
    }

    pub fn with_runtime_version(mut self, version: RuntimeVersion) -> Self {
        self.runtime_version = Some(version);
        self
    }

    pub fn with_arm64_adr_prelude(mut self, enabled: bool) -> Self {
        self.arm64_adr_prelude = enabled;
        self
    }
}

fn is_disabled(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "0" | "false" | "off" | "no")
}
