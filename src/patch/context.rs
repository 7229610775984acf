//! Registration contexts.
//!
//! A [`PatchContext`] groups the hooks registered by one caller. Its child hook sets are
//! chained to the engine's root sets, so every registration is visible to the engine at
//! once while the context can still take back exactly what it added with
//! [`PatchContext::free`]. Dropping a context without freeing it leaves its hooks in place.

use std::collections::HashMap;

use log::debug;

use crate::{
    metadata::token::Token,
    patch::{
        hook::{Hook, HookAction, HookId, HookKind, HookPriority, Transpiler},
        hookset::MethodHooks,
        PatchEngine,
    },
    runtime::{MethodDef, MethodHandle},
    Error, Result,
};

/// The registrations of one caller.
pub struct PatchContext<'e> {
    engine: &'e PatchEngine,
    name: String,
    functions: HashMap<Token, MethodHooks>,
    freed: bool,
}

impl<'e> PatchContext<'e> {
    pub(crate) fn new(engine: &'e PatchEngine, name: String) -> Self {
        PatchContext {
            engine,
            name,
            functions: HashMap::new(),
            freed: false,
        }
    }

    /// Name given at creation.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` after [`PatchContext::free`].
    #[must_use]
    pub fn is_freed(&self) -> bool {
        self.freed
    }

    /// Registers `hook` to run before the body of `target`.
    ///
    /// A hook returning `bool` skips the body and the remaining prefixes by returning
    /// `false`. The priority comes from the hook's own annotation.
    ///
    /// # Errors
    /// Returns [`Error::ContextFreed`] after [`PatchContext::free`] and
    /// [`Error::Construction`] for native targets.
    pub fn add_prefix(&mut self, target: &MethodHandle, hook: &MethodHandle) -> Result<HookId> {
        self.add(
            target,
            HookKind::Prefix,
            hook.priority.unwrap_or_default(),
            HookAction::Method(hook.clone()),
        )
    }

    /// Registers `hook` to run after the body of `target`, even when a prefix skipped it.
    ///
    /// # Errors
    /// Returns [`Error::ContextFreed`] after [`PatchContext::free`] and
    /// [`Error::Construction`] for native targets.
    pub fn add_suffix(&mut self, target: &MethodHandle, hook: &MethodHandle) -> Result<HookId> {
        self.add(
            target,
            HookKind::Suffix,
            hook.priority.unwrap_or_default(),
            HookAction::Method(hook.clone()),
        )
    }

    /// Registers a rewrite of the body of `target`.
    ///
    /// # Errors
    /// Returns [`Error::ContextFreed`] after [`PatchContext::free`] and
    /// [`Error::Construction`] for native targets.
    pub fn add_transpiler(
        &mut self,
        target: &MethodHandle,
        transpiler: Transpiler,
    ) -> Result<HookId> {
        let priority = transpiler.priority();
        self.add(
            target,
            HookKind::Transpiler,
            priority,
            HookAction::Transpiler(transpiler),
        )
    }

    fn add(
        &mut self,
        target: &MethodHandle,
        kind: HookKind,
        priority: HookPriority,
        action: HookAction,
    ) -> Result<HookId> {
        self.check_open()?;
        check_patchable(target)?;

        let hooks = match self.functions.get(&target.token) {
            Some(hooks) => hooks.clone(),
            None => {
                let root = self.engine.hooks_for(target)?;
                let child = MethodHooks::child_of(&root);
                self.functions.insert(target.token, child.clone());
                child
            }
        };

        let sequence = self.engine.next_sequence();
        let hook = Hook {
            id: HookId(sequence),
            owner: self.name.clone(),
            kind,
            priority,
            sequence,
            action,
        };
        let id = hook.id;
        debug!(
            "{}: {kind} {} on {} (priority {priority}, id {id})",
            self.name,
            hook.name(),
            target.full_name()
        );
        lock!(hooks.set(kind)).add(hook)?;
        Ok(id)
    }

    /// Removes one registration of this context.
    ///
    /// # Errors
    /// Returns [`Error::HookNotFound`] if this context did not register `id` or the hook was
    /// already dropped by [`crate::patch::PatchEngine::detach`], and
    /// [`Error::ContextFreed`] after [`PatchContext::free`].
    pub fn remove(&mut self, id: HookId) -> Result<()> {
        self.check_open()?;
        for hooks in self.functions.values() {
            if hooks.remove(id)? {
                debug!("{}: removed hook {id}", self.name);
                return Ok(());
            }
        }
        Err(Error::HookNotFound(id.value()))
    }

    /// Removes every registration of this context and closes it.
    ///
    /// Returns the number of removed hooks. The change takes effect on the next commit.
    ///
    /// # Errors
    /// Returns [`Error::ContextFreed`] when called twice.
    pub fn free(&mut self) -> Result<usize> {
        self.check_open()?;
        let mut removed = 0;
        for hooks in self.functions.values() {
            removed += hooks.clear()?;
        }
        self.functions.clear();
        self.freed = true;
        debug!("{}: freed {removed} hook(s)", self.name);
        Ok(removed)
    }

    fn check_open(&self) -> Result<()> {
        if self.freed {
            return Err(Error::ContextFreed(self.name.clone()));
        }
        Ok(())
    }
}

fn check_patchable(target: &MethodDef) -> Result<()> {
    if target.is_native() {
        return Err(construction_error!(
            target.full_name(),
            "native methods cannot be patched"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::signatures::TypeSignature,
        runtime::{MethodBuilder, Runtime, RuntimeConfig},
    };
    use std::sync::Arc;

    fn fixture() -> (Arc<Runtime>, MethodHandle, MethodHandle) {
        let runtime = Arc::new(Runtime::new(RuntimeConfig::default()).unwrap());
        let ty = runtime.define_type("App", "Target", None).unwrap();
        let target = runtime
            .define_method(MethodBuilder::new(&ty, "Run").param("x", TypeSignature::I4))
            .unwrap();
        let hook = runtime
            .define_method(
                MethodBuilder::new(&ty, "Hook")
                    .param("x", TypeSignature::I4)
                    .priority(HookPriority::HIGH),
            )
            .unwrap();
        (runtime, target, hook)
    }

    #[test]
    fn hooks_reach_the_engine() {
        let (runtime, target, hook) = fixture();
        let engine = PatchEngine::new(runtime);
        let mut context = engine.context("mod-a");

        context.add_prefix(&target, &hook).unwrap();
        context.add_suffix(&target, &hook).unwrap();

        let root = engine.hooks_for(&target).unwrap();
        let snapshot = root.snapshot().unwrap();
        assert_eq!(snapshot.prefixes.len(), 1);
        assert_eq!(snapshot.suffixes.len(), 1);
        assert_eq!(snapshot.prefixes[0].priority, HookPriority::HIGH);
        assert_eq!(snapshot.prefixes[0].owner, "mod-a");
        assert!(root.is_dirty().unwrap());
    }

    #[test]
    fn remove_only_own_hooks() {
        let (runtime, target, hook) = fixture();
        let engine = PatchEngine::new(runtime);
        let mut first = engine.context("a");
        let mut second = engine.context("b");

        let id = first.add_prefix(&target, &hook).unwrap();
        assert!(matches!(
            second.remove(id),
            Err(Error::HookNotFound(value)) if value == id.value()
        ));
        first.remove(id).unwrap();
        assert!(engine.hooks_for(&target).unwrap().is_empty().unwrap());
    }

    #[test]
    fn freed_context_rejects_changes() {
        let (runtime, target, hook) = fixture();
        let engine = PatchEngine::new(runtime);
        let mut context = engine.context("a");

        context.add_prefix(&target, &hook).unwrap();
        context.add_suffix(&target, &hook).unwrap();
        assert_eq!(context.free().unwrap(), 2);
        assert!(context.is_freed());

        assert!(matches!(
            context.add_prefix(&target, &hook),
            Err(Error::ContextFreed(name)) if name == "a"
        ));
        assert!(matches!(context.free(), Err(Error::ContextFreed(_))));
    }

    #[test]
    fn native_targets_are_rejected() {
        let (runtime, _target, hook) = fixture();
        let engine = PatchEngine::new(runtime.clone());
        let native = runtime
            .module()
            .find_method("System.Exception", ".ctor")
            .unwrap();

        assert!(matches!(
            engine.context("a").add_prefix(&native, &hook),
            Err(Error::Construction { .. })
        ));
    }
}
