//! Arena configuration

use super::{Arena, Region};
use crate::error::{Result, VmemError};
use serde::{Deserialize, Serialize};

/// Settings applied when an arena is created
///
/// Can be loaded from TOML:
///
/// ```toml
/// name = "session-cache"
/// fork_safe = true
/// poison_on_free = 0xDD
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Label used in log output
    pub name: String,

    /// Register the arena with the fork protocol
    pub fork_safe: bool,

    /// Fill freed allocations with this byte
    pub poison_on_free: Option<u8>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        ArenaConfig {
            name: "arena".to_string(),
            fork_safe: true,
            poison_on_free: None,
        }
    }
}

impl ArenaConfig {
    /// Parse a configuration from TOML; missing keys take their defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| VmemError::Config(e.to_string()))
    }
}

/// Builder for customizing arena creation
///
/// # Examples
///
/// ```rust,no_run
/// use memmap2::MmapMut;
/// use vmem_rs::{ArenaBuilder, Region};
///
/// # fn main() -> vmem_rs::Result<()> {
/// let mut map = MmapMut::map_anon(1 << 20)?;
/// let region = unsafe { Region::from_mmap(&mut map)? };
/// let arena = ArenaBuilder::new()
///     .name("scratch")
///     .poison_on_free(0xDD)
///     .build(region)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ArenaBuilder {
    config: ArenaConfig,
}

impl ArenaBuilder {
    /// Create a new ArenaBuilder with default settings
    pub fn new() -> Self {
        ArenaBuilder::default()
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: ArenaConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the label used in log output
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.name = name.into();
        self
    }

    /// Enable or disable fork-safety registration
    pub fn fork_safe(mut self, enabled: bool) -> Self {
        self.config.fork_safe = enabled;
        self
    }

    /// Fill freed allocations with `byte`
    pub fn poison_on_free(mut self, byte: u8) -> Self {
        self.config.poison_on_free = Some(byte);
        self
    }

    /// Create the arena over `region`
    pub fn build(self, region: Region) -> Result<Arena> {
        Arena::with_config(region, self.config)
    }
}
