//! Patch engine configuration.

use crate::patch::{ArchKind, DumpFlags};

/// Settings of a [`crate::patch::PatchEngine`].
///
/// # Example
///
/// ```rust
/// use dotpatch::patch::{ArchKind, DumpFlags, EngineConfig};
///
/// let config = EngineConfig::default()
///     .with_arch("arm64".parse::<ArchKind>().unwrap())
///     .with_dump(DumpFlags::ORIGINAL | DumpFlags::COMPOSED)
///     .with_parallel(false);
/// assert_eq!(config.arch, ArchKind::Aarch64);
/// ```
///
/// # Default Values
///
/// | Setting | Default Value |
/// |---------|---------------|
/// | `arch` | [`ArchKind::X64`] |
/// | `dump` | empty |
/// | `parallel` | `true` |
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Jump encoding written at patched entries.
    pub arch: ArchKind,

    /// Stages whose instruction lists go to the diagnostic sink.
    pub dump: DumpFlags,

    /// Compose dirty functions on the rayon pool during commit.
    ///
    /// Trampolines are always installed one after the other.
    pub parallel: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            arch: ArchKind::default(),
            dump: DumpFlags::empty(),
            parallel: true,
        }
    }
}

impl EngineConfig {
    /// Sets the jump encoding.
    ///
    /// # Arguments
    ///
    /// * `arch` - Architecture of the patched code
    ///
    /// # Returns
    ///
    /// Returns `self` for method chaining.
    #[must_use]
    pub fn with_arch(mut self, arch: ArchKind) -> Self {
        self.arch = arch;
        self
    }

    /// Sets the dumped stages.
    ///
    /// # Arguments
    ///
    /// * `dump` - Stages to dump
    ///
    /// # Returns
    ///
    /// Returns `self` for method chaining.
    #[must_use]
    pub fn with_dump(mut self, dump: DumpFlags) -> Self {
        self.dump = dump;
        self
    }

    /// Enables or disables parallel composition.
    ///
    /// # Arguments
    ///
    /// * `parallel` - `true` to compose on the rayon pool
    ///
    /// # Returns
    ///
    /// Returns `self` for method chaining.
    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}
