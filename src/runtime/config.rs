//! Runtime configuration.

/// Default address of the first byte of the code heap.
pub const DEFAULT_CODE_BASE: u64 = 0x0001_0000_0000;

/// Settings of a [`crate::runtime::Runtime`].
///
/// Limits guard the interpreter against runaway hooks and recursion. A limit of 0 means
/// unlimited.
///
/// # Example
///
/// ```rust
/// use dotpatch::runtime::RuntimeConfig;
///
/// let config = RuntimeConfig::default()
///     .with_max_instructions(5_000_000)
///     .with_max_call_depth(100);
/// assert_eq!(config.max_call_depth, 100);
/// ```
///
/// # Default Values
///
/// | Setting | Default Value |
/// |---------|---------------|
/// | `code_base` | `0x1_0000_0000` |
/// | `max_instructions` | 10,000,000 |
/// | `max_call_depth` | 1,000 |
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Address of the first byte of the code heap.
    pub code_base: u64,

    /// Maximum nested calls of one invocation.
    ///
    /// When exceeded, the invocation stops with [`crate::Error::CallDepthExceeded`].
    pub max_call_depth: usize,

    /// Maximum instructions executed by one invocation.
    ///
    /// Set to 0 for unlimited execution. When exceeded, the invocation stops with
    /// [`crate::Error::InstructionLimitExceeded`].
    pub max_instructions: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            code_base: DEFAULT_CODE_BASE,
            max_call_depth: 1000,
            max_instructions: 10_000_000,
        }
    }
}

impl RuntimeConfig {
    /// Sets the base address of the code heap.
    ///
    /// # Arguments
    ///
    /// * `base` - Address of the first heap byte
    ///
    /// # Returns
    ///
    /// Returns `self` for method chaining.
    #[must_use]
    pub fn with_code_base(mut self, base: u64) -> Self {
        self.code_base = base;
        self
    }

    /// Sets the maximum call depth.
    ///
    /// # Arguments
    ///
    /// * `max` - Maximum nested calls
    ///
    /// # Returns
    ///
    /// Returns `self` for method chaining.
    #[must_use]
    pub fn with_max_call_depth(mut self, max: usize) -> Self {
        self.max_call_depth = max;
        self
    }

    /// Sets the maximum number of executed instructions.
    ///
    /// # Arguments
    ///
    /// * `max` - Maximum instructions, 0 for unlimited
    ///
    /// # Returns
    ///
    /// Returns `self` for method chaining.
    #[must_use]
    pub fn with_max_instructions(mut self, max: u64) -> Self {
        self.max_instructions = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = RuntimeConfig::default()
            .with_code_base(0x4000)
            .with_max_instructions(5000)
            .with_max_call_depth(50);

        assert_eq!(config.code_base, 0x4000);
        assert_eq!(config.max_instructions, 5000);
        assert_eq!(config.max_call_depth, 50);
    }
}
