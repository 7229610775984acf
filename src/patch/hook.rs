//! Hook descriptions.
//!
//! - [`HookPriority`]: ordering of hooks on one function
//! - [`HookKind`]: the three roles a hook can play
//! - [`Transpiler`]: a body rewrite implemented in Rust
//! - [`Hook`]: one registration, as stored in a [`crate::patch::HookSet`]

use std::{cmp::Reverse, fmt, sync::Arc};

use crate::{
    assembly::Instruction,
    runtime::{MethodDef, MethodHandle},
    Result,
};

/// Priority level of a hook.
///
/// Prefixes and transpilers with a higher priority run earlier, suffixes with a higher
/// priority run later. Hooks of equal priority keep their registration order.
///
/// | Constant | Value |
/// |----------|-------|
/// | [`HIGHEST`](Self::HIGHEST) | 1000 |
/// | [`HIGH`](Self::HIGH) | 500 |
/// | [`NORMAL`](Self::NORMAL) | 0 |
/// | [`LOW`](Self::LOW) | -500 |
/// | [`LOWEST`](Self::LOWEST) | -1000 |
///
/// ```rust
/// use dotpatch::patch::HookPriority;
///
/// assert!(HookPriority::HIGHEST > HookPriority::HIGH);
/// assert_eq!(HookPriority::from(10), HookPriority(10));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookPriority(pub i32);

impl HookPriority {
    /// Runs first (value: 1000).
    pub const HIGHEST: Self = Self(1000);
    /// Value: 500.
    pub const HIGH: Self = Self(500);
    /// Default (value: 0).
    pub const NORMAL: Self = Self(0);
    /// Value: -500.
    pub const LOW: Self = Self(-500);
    /// Runs last (value: -1000).
    pub const LOWEST: Self = Self(-1000);
}

impl Default for HookPriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<i32> for HookPriority {
    fn from(value: i32) -> Self {
        HookPriority(value)
    }
}

impl fmt::Display for HookPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum HookKind {
    /// Runs before the body and may skip it
    Prefix,
    /// Runs after the body
    Suffix,
    /// Rewrites the body
    Transpiler,
}

/// Identifies a registration for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(pub(crate) u64);

impl HookId {
    /// The raw id.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Signature of a transpiler function.
pub type TranspilerFn =
    Arc<dyn Fn(&MethodDef, Vec<Instruction>) -> Result<Vec<Instruction>> + Send + Sync>;

/// A whole-body rewrite.
///
/// The function receives the current instruction list of the patched method and returns
/// the list to hand to the next transpiler. Labels must stay consistent: every label used
/// by an operand must remain attached to exactly one instruction.
///
/// ```rust
/// use dotpatch::patch::{HookPriority, Transpiler};
///
/// let identity = Transpiler::new("identity", |_method, body| Ok(body))
///     .with_priority(HookPriority::HIGH);
/// assert_eq!(identity.priority(), HookPriority::HIGH);
/// ```
#[derive(Clone)]
pub struct Transpiler {
    name: String,
    priority: HookPriority,
    function: TranspilerFn,
}

impl Transpiler {
    /// Creates a transpiler of normal priority.
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&MethodDef, Vec<Instruction>) -> Result<Vec<Instruction>> + Send + Sync + 'static,
    {
        Transpiler {
            name: name.into(),
            priority: HookPriority::NORMAL,
            function: Arc::new(function),
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: impl Into<HookPriority>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Priority.
    #[must_use]
    pub fn priority(&self) -> HookPriority {
        self.priority
    }

    /// Runs the rewrite.
    ///
    /// # Errors
    /// Whatever the transpiler reports.
    pub fn apply(&self, method: &MethodDef, body: Vec<Instruction>) -> Result<Vec<Instruction>> {
        (self.function)(method, body)
    }
}

impl fmt::Debug for Transpiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transpiler")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// What a hook runs.
#[derive(Debug, Clone)]
pub enum HookAction {
    /// A runtime method called by prefixes and suffixes
    Method(MethodHandle),
    /// A Rust rewrite of the body
    Transpiler(Transpiler),
}

/// One registration.
#[derive(Debug, Clone)]
pub struct Hook {
    /// Registration id
    pub id: HookId,
    /// Name of the registering context
    pub owner: String,
    /// Role
    pub kind: HookKind,
    /// Priority
    pub priority: HookPriority,
    /// Global registration counter, breaks priority ties
    pub sequence: u64,
    /// The hook itself
    pub action: HookAction,
}

impl Hook {
    /// The hook method of a prefix or suffix.
    #[must_use]
    pub fn method(&self) -> Option<&MethodHandle> {
        match &self.action {
            HookAction::Method(method) => Some(method),
            HookAction::Transpiler(_) => None,
        }
    }

    /// The transpiler of a transpiler hook.
    #[must_use]
    pub fn transpiler(&self) -> Option<&Transpiler> {
        match &self.action {
            HookAction::Transpiler(transpiler) => Some(transpiler),
            HookAction::Method(_) => None,
        }
    }

    /// Display name of the hook target.
    #[must_use]
    pub fn name(&self) -> String {
        match &self.action {
            HookAction::Method(method) => method.full_name(),
            HookAction::Transpiler(transpiler) => transpiler.name().to_string(),
        }
    }
}

/// Sorts `hooks` into execution order for their role.
pub fn sort_for_execution(kind: HookKind, hooks: &mut [Hook]) {
    match kind {
        HookKind::Prefix | HookKind::Transpiler => {
            hooks.sort_by_key(|hook| (Reverse(hook.priority), hook.sequence));
        }
        HookKind::Suffix => hooks.sort_by_key(|hook| (hook.priority, hook.sequence)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(kind: HookKind, priority: i32, sequence: u64) -> Hook {
        Hook {
            id: HookId(sequence),
            owner: "test".to_string(),
            kind,
            priority: HookPriority(priority),
            sequence,
            action: HookAction::Transpiler(Transpiler::new("t", |_, body| Ok(body))),
        }
    }

    fn order(kind: HookKind, mut hooks: Vec<Hook>) -> Vec<u64> {
        sort_for_execution(kind, &mut hooks);
        hooks.iter().map(|hook| hook.sequence).collect()
    }

    #[test]
    fn prefixes_run_highest_first() {
        let hooks = vec![
            hook(HookKind::Prefix, 0, 1),
            hook(HookKind::Prefix, 10, 2),
            hook(HookKind::Prefix, 0, 3),
        ];
        assert_eq!(order(HookKind::Prefix, hooks), vec![2, 1, 3]);
    }

    #[test]
    fn suffixes_run_highest_last() {
        let hooks = vec![
            hook(HookKind::Suffix, 10, 1),
            hook(HookKind::Suffix, 0, 2),
            hook(HookKind::Suffix, 0, 3),
        ];
        assert_eq!(order(HookKind::Suffix, hooks), vec![2, 3, 1]);
    }

    #[test]
    fn priority_constants() {
        assert_eq!(HookPriority::default(), HookPriority::NORMAL);
        assert!(HookPriority::LOW > HookPriority::LOWEST);
        assert_eq!(HookKind::Transpiler.to_string(), "Transpiler");
    }
}
