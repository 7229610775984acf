//! Per-function hook collections.
//!
//! A [`HookSet`] holds the hooks of one role on one function. Sets form a two level tree:
//! the engine owns one root set per function and role, each [`crate::patch::PatchContext`]
//! owns child sets chained to those roots. Adding or removing through a child mutates the
//! root as well, so a context sees its own hooks while the root sees everyone's.

use std::sync::{Arc, Mutex};

use crate::{
    patch::hook::{sort_for_execution, Hook, HookId, HookKind},
    runtime::MethodHandle,
    Result,
};

/// A [`HookSet`] shared between the engine and contexts.
pub type SharedHookSet = Arc<Mutex<HookSet>>;

/// The hooks of one role on one function.
#[derive(Debug)]
pub struct HookSet {
    kind: HookKind,
    hooks: Vec<Hook>,
    dirty: bool,
    parent: Option<SharedHookSet>,
}

impl HookSet {
    /// Creates an empty root set.
    #[must_use]
    pub fn new(kind: HookKind) -> Self {
        HookSet {
            kind,
            hooks: Vec::new(),
            dirty: false,
            parent: None,
        }
    }

    /// Creates an empty set chained to `parent`.
    #[must_use]
    pub fn with_parent(kind: HookKind, parent: SharedHookSet) -> Self {
        HookSet {
            kind,
            hooks: Vec::new(),
            dirty: false,
            parent: Some(parent),
        }
    }

    /// Role of the hooks in this set.
    #[must_use]
    pub fn kind(&self) -> HookKind {
        self.kind
    }

    /// Adds `hook` here and to every ancestor.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if an ancestor lock is poisoned.
    pub fn add(&mut self, hook: Hook) -> Result<()> {
        if let Some(parent) = &self.parent {
            lock!(parent).add(hook.clone())?;
        }
        self.hooks.push(hook);
        self.dirty = true;
        Ok(())
    }

    /// Removes hook `id` here and from every ancestor.
    ///
    /// Returns `false` if this set does not hold the hook. A hook the parent no longer holds,
    /// because the parent was cleared behind this set, is dropped here as well and also
    /// reported as `false`.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if an ancestor lock is poisoned.
    pub fn remove(&mut self, id: HookId) -> Result<bool> {
        let Some(position) = self.hooks.iter().position(|hook| hook.id == id) else {
            return Ok(false);
        };

        let held = match &self.parent {
            Some(parent) => lock!(parent).remove(id)?,
            None => true,
        };
        self.hooks.remove(position);
        self.dirty = true;
        Ok(held)
    }

    /// Removes every hook of this set, here and from every ancestor, under one lock of the
    /// parent.
    ///
    /// Returns the number of removed hooks. Hooks the parent no longer held are dropped
    /// without being counted.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if an ancestor lock is poisoned.
    pub fn clear(&mut self) -> Result<usize> {
        if self.hooks.is_empty() {
            return Ok(0);
        }

        let mut removed = self.hooks.len();
        if let Some(parent) = &self.parent {
            let mut parent = lock!(parent);
            removed = 0;
            for hook in &self.hooks {
                if parent.remove(hook.id)? {
                    removed += 1;
                }
            }
        }

        self.hooks.clear();
        self.dirty = true;
        Ok(removed)
    }

    /// `true` if `id` is in this set.
    #[must_use]
    pub fn contains(&self, id: HookId) -> bool {
        self.hooks.iter().any(|hook| hook.id == id)
    }

    /// Hooks in registration order.
    #[must_use]
    pub fn hooks(&self) -> &[Hook] {
        &self.hooks
    }

    /// Hooks in execution order for this role.
    #[must_use]
    pub fn ordered(&self) -> Vec<Hook> {
        let mut hooks = self.hooks.clone();
        sort_for_execution(self.kind, &mut hooks);
        hooks
    }

    /// Number of hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// `true` without hooks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// `true` if the set changed since the last [`HookSet::clear_dirty`].
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Marks the current content as committed.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Marks the set as changed, so the next commit picks it up again.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

/// The prefix, suffix and transpiler sets of one function.
#[derive(Debug, Clone)]
pub struct MethodHooks {
    /// The hooked function
    pub method: MethodHandle,
    /// Prefixes
    pub prefixes: SharedHookSet,
    /// Suffixes
    pub suffixes: SharedHookSet,
    /// Transpilers
    pub transpilers: SharedHookSet,
}

impl MethodHooks {
    /// Creates root sets for `method`.
    #[must_use]
    pub fn new(method: MethodHandle) -> Self {
        MethodHooks {
            method,
            prefixes: Arc::new(Mutex::new(HookSet::new(HookKind::Prefix))),
            suffixes: Arc::new(Mutex::new(HookSet::new(HookKind::Suffix))),
            transpilers: Arc::new(Mutex::new(HookSet::new(HookKind::Transpiler))),
        }
    }

    /// Creates child sets chained to `parent`'s.
    #[must_use]
    pub fn child_of(parent: &MethodHooks) -> Self {
        let child = |kind, set: &SharedHookSet| {
            Arc::new(Mutex::new(HookSet::with_parent(kind, set.clone())))
        };
        MethodHooks {
            method: parent.method.clone(),
            prefixes: child(HookKind::Prefix, &parent.prefixes),
            suffixes: child(HookKind::Suffix, &parent.suffixes),
            transpilers: child(HookKind::Transpiler, &parent.transpilers),
        }
    }

    /// The set of role `kind`.
    #[must_use]
    pub fn set(&self, kind: HookKind) -> &SharedHookSet {
        match kind {
            HookKind::Prefix => &self.prefixes,
            HookKind::Suffix => &self.suffixes,
            HookKind::Transpiler => &self.transpilers,
        }
    }

    fn sets(&self) -> [&SharedHookSet; 3] {
        [&self.prefixes, &self.suffixes, &self.transpilers]
    }

    /// `true` if any of the three sets is dirty.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if a set lock is poisoned.
    pub fn is_dirty(&self) -> Result<bool> {
        for set in self.sets() {
            if lock!(set).is_dirty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// `true` if none of the three sets holds a hook.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if a set lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        for set in self.sets() {
            if !lock!(set).is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Clears the dirty flag of all three sets.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if a set lock is poisoned.
    pub fn clear_dirty(&self) -> Result<()> {
        for set in self.sets() {
            lock!(set).clear_dirty();
        }
        Ok(())
    }

    /// Marks all three sets dirty.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if a set lock is poisoned.
    pub fn mark_dirty(&self) -> Result<()> {
        for set in self.sets() {
            lock!(set).mark_dirty();
        }
        Ok(())
    }

    /// Removes hook `id` from whichever set holds it.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if a set lock is poisoned.
    pub fn remove(&self, id: HookId) -> Result<bool> {
        for set in self.sets() {
            if lock!(set).remove(id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Empties all three sets. Returns the number of removed hooks.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if a set lock is poisoned.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for set in self.sets() {
            removed += lock!(set).clear()?;
        }
        Ok(removed)
    }

    /// Snapshot of the hooks of every role in execution order.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if a set lock is poisoned.
    pub fn snapshot(&self) -> Result<HookSnapshot> {
        Ok(HookSnapshot {
            prefixes: lock!(self.prefixes).ordered(),
            suffixes: lock!(self.suffixes).ordered(),
            transpilers: lock!(self.transpilers).ordered(),
        })
    }

    /// Snapshot for a commit: takes the three set locks together and clears the dirty flags
    /// under them, so a change landing after this call marks the sets dirty again.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if a set lock is poisoned.
    pub fn take_snapshot(&self) -> Result<HookSnapshot> {
        let mut prefixes = lock!(self.prefixes);
        let mut suffixes = lock!(self.suffixes);
        let mut transpilers = lock!(self.transpilers);

        let snapshot = HookSnapshot {
            prefixes: prefixes.ordered(),
            suffixes: suffixes.ordered(),
            transpilers: transpilers.ordered(),
        };
        prefixes.clear_dirty();
        suffixes.clear_dirty();
        transpilers.clear_dirty();
        Ok(snapshot)
    }
}

/// The hooks of one function at commit time, in execution order.
#[derive(Debug, Clone, Default)]
pub struct HookSnapshot {
    /// Prefixes, highest priority first
    pub prefixes: Vec<Hook>,
    /// Suffixes, highest priority last
    pub suffixes: Vec<Hook>,
    /// Transpilers, highest priority first
    pub transpilers: Vec<Hook>,
}

impl HookSnapshot {
    /// `true` without hooks of any role.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty() && self.suffixes.is_empty() && self.transpilers.is_empty()
    }

    /// Total number of hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.prefixes.len() + self.suffixes.len() + self.transpilers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        patch::hook::{HookAction, HookPriority, Transpiler},
        runtime::{MethodBuilder, Runtime, RuntimeConfig},
    };

    fn transpiler_hook(id: u64) -> Hook {
        Hook {
            id: HookId(id),
            owner: "test".to_string(),
            kind: HookKind::Transpiler,
            priority: HookPriority::NORMAL,
            sequence: id,
            action: HookAction::Transpiler(Transpiler::new("t", |_, body| Ok(body))),
        }
    }

    #[test]
    fn child_changes_reach_parent() {
        let parent: SharedHookSet = Arc::new(Mutex::new(HookSet::new(HookKind::Transpiler)));
        let mut child = HookSet::with_parent(HookKind::Transpiler, parent.clone());

        child.add(transpiler_hook(1)).unwrap();
        child.add(transpiler_hook(2)).unwrap();
        assert_eq!(parent.lock().unwrap().len(), 2);
        assert!(parent.lock().unwrap().is_dirty());

        parent.lock().unwrap().clear_dirty();
        assert!(child.remove(HookId(1)).unwrap());
        assert!(!child.remove(HookId(1)).unwrap());
        assert_eq!(parent.lock().unwrap().len(), 1);
        assert!(parent.lock().unwrap().is_dirty());
    }

    #[test]
    fn clearing_a_child_keeps_siblings() {
        let parent: SharedHookSet = Arc::new(Mutex::new(HookSet::new(HookKind::Transpiler)));
        let mut first = HookSet::with_parent(HookKind::Transpiler, parent.clone());
        let mut second = HookSet::with_parent(HookKind::Transpiler, parent.clone());

        first.add(transpiler_hook(1)).unwrap();
        second.add(transpiler_hook(2)).unwrap();
        assert_eq!(first.clear().unwrap(), 1);

        let parent = parent.lock().unwrap();
        assert_eq!(parent.len(), 1);
        assert!(parent.contains(HookId(2)));
    }

    #[test]
    fn cleared_parent_leaves_nothing_to_count() {
        let parent: SharedHookSet = Arc::new(Mutex::new(HookSet::new(HookKind::Transpiler)));
        let mut child = HookSet::with_parent(HookKind::Transpiler, parent.clone());

        child.add(transpiler_hook(1)).unwrap();
        child.add(transpiler_hook(2)).unwrap();
        parent.lock().unwrap().clear().unwrap();

        assert!(!child.remove(HookId(1)).unwrap());
        assert!(!child.contains(HookId(1)));
        assert_eq!(child.clear().unwrap(), 0);
        assert!(child.is_empty());

        child.add(transpiler_hook(3)).unwrap();
        assert_eq!(child.clear().unwrap(), 1);
    }

    #[test]
    fn changes_after_a_snapshot_stay_dirty() {
        let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
        let ty = runtime.define_type("App", "Sets", None).unwrap();
        let method = runtime.define_method(MethodBuilder::new(&ty, "Target")).unwrap();
        let root = MethodHooks::new(method);
        let child = MethodHooks::child_of(&root);

        lock_set(&child.transpilers).add(transpiler_hook(1)).unwrap();
        let snapshot = root.take_snapshot().unwrap();
        assert_eq!(snapshot.transpilers.len(), 1);
        assert!(!root.is_dirty().unwrap());

        lock_set(&child.transpilers).add(transpiler_hook(2)).unwrap();
        assert!(root.is_dirty().unwrap());
        assert_eq!(root.take_snapshot().unwrap().transpilers.len(), 2);

        root.mark_dirty().unwrap();
        assert!(root.is_dirty().unwrap());
    }

    fn lock_set(set: &SharedHookSet) -> std::sync::MutexGuard<'_, HookSet> {
        set.lock().unwrap()
    }
}
