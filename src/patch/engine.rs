//! The patch registry and its commit cycle.
//!
//! A [`PatchEngine`] keeps one root [`MethodHooks`] per hooked function and one
//! [`PatchedMethod`] per function whose entry currently jumps into a generated artifact.
//! Registrations made through [`PatchContext`]s only mark root sets dirty; nothing touches
//! code until [`PatchEngine::commit`]:
//!
//! 1. every dirty function is recomposed from its original body, with the bytes saved by an
//!    existing trampoline laid back over the entry,
//! 2. the composed bodies are encoded into artifacts, on the rayon pool when
//!    [`EngineConfig::parallel`] is set,
//! 3. trampolines are installed or retargeted one function at a time; functions without
//!    hooks are reverted.
//!
//! A function that fails stays dirty and keeps its previous patch state, the others are
//! applied and the failures are reported together as [`Error::Commit`].

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::{
    assembly::{decode_method, encode_method, EncodeOptions, Instruction},
    metadata::{resolver::ModuleResolver, token::Token},
    patch::{
        compose::compose,
        diagnostics::{DiagnosticSink, DumpFlags, LogSink},
        hookset::{HookSnapshot, MethodHooks},
        trampoline::{CodeMemory, Trampoline},
        EngineConfig, PatchContext,
    },
    runtime::{Artifact, DynamicMethod, DynamicTokenTable, MethodDef, MethodHandle, Runtime},
    Error, Result,
};

/// A function whose entry jumps into a generated artifact.
///
/// The trampoline is declared before the artifact so that it is reverted before the pin on
/// the code it jumps to is released.
#[derive(Debug)]
pub struct PatchedMethod {
    /// The patched function
    pub method: MethodHandle,
    /// The jump at its entry
    pub trampoline: Trampoline,
    /// The code the jump leads to
    pub artifact: Artifact,
}

/// Counts of one commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Functions that got a new artifact
    pub patched: usize,
    /// Functions whose trampoline was removed
    pub unpatched: usize,
}

#[derive(Default)]
struct Registry {
    functions: BTreeMap<Token, MethodHooks>,
    patched: HashMap<Token, PatchedMethod>,
}

struct Job {
    hooks: MethodHooks,
    snapshot: HookSnapshot,
    saved: Option<Vec<u8>>,
}

/// Owner of all registrations and patches of one runtime.
///
/// Dropping the engine reverts every patch.
pub struct PatchEngine {
    runtime: Arc<Runtime>,
    config: EngineConfig,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    sink: Box<dyn DiagnosticSink>,
}

impl PatchEngine {
    /// Creates an engine with the default configuration.
    #[must_use]
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self::with_config(runtime, EngineConfig::default())
    }

    /// Creates an engine with `config`. Dumps go to a [`LogSink`].
    #[must_use]
    pub fn with_config(runtime: Arc<Runtime>, config: EngineConfig) -> Self {
        PatchEngine {
            runtime,
            config,
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            sink: Box::new(LogSink),
        }
    }

    /// Replaces the diagnostic sink.
    #[must_use]
    pub fn with_sink(mut self, sink: impl DiagnosticSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// The patched runtime.
    #[must_use]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Opens a registration context called `name`.
    #[must_use]
    pub fn context(&self, name: impl Into<String>) -> PatchContext<'_> {
        PatchContext::new(self, name.into())
    }

    /// The root hook sets of `method`, created on first use.
    pub(crate) fn hooks_for(&self, method: &MethodHandle) -> Result<MethodHooks> {
        let mut registry = lock!(self.registry);
        Ok(registry
            .functions
            .entry(method.token)
            .or_insert_with(|| MethodHooks::new(method.clone()))
            .clone())
    }

    /// Next registration number, used both as id and as tie breaker.
    pub(crate) fn next_sequence(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Applies every change made since the last commit.
    ///
    /// # Errors
    /// Returns [`Error::Commit`] listing the functions that could not be patched, after
    /// applying all the others. Returns [`Error::LockError`] if a lock is poisoned.
    pub fn commit(&self) -> Result<CommitSummary> {
        let mut registry = lock!(self.registry);

        let mut jobs = Vec::new();
        for (token, hooks) in &registry.functions {
            if !hooks.is_dirty()? {
                continue;
            }
            jobs.push(Job {
                hooks: hooks.clone(),
                snapshot: hooks.take_snapshot()?,
                saved: registry
                    .patched
                    .get(token)
                    .map(|patched| patched.trampoline.saved_bytes().to_vec()),
            });
        }

        if jobs.is_empty() {
            debug!("Nothing to commit");
            return Ok(CommitSummary::default());
        }

        let built: Vec<Result<Option<Artifact>>> = if self.config.parallel {
            jobs.par_iter().map(|job| self.build(job)).collect()
        } else {
            jobs.iter().map(|job| self.build(job)).collect()
        };

        let mut summary = CommitSummary::default();
        let mut failures = Vec::new();
        for (job, artifact) in jobs.iter().zip(built) {
            let method = &job.hooks.method;
            let applied =
                artifact.and_then(|artifact| self.apply(&mut registry, method, artifact));

            match applied {
                Ok(Some(true)) => summary.patched += 1,
                Ok(Some(false)) => summary.unpatched += 1,
                Ok(None) => {}
                Err(error) => {
                    warn!("Failed to patch {}: {error}", method.full_name());
                    job.hooks.mark_dirty()?;
                    failures.push((method.full_name(), error));
                }
            }
        }

        info!(
            "Committed {} function(s): {} patched, {} unpatched, {} failed",
            jobs.len(),
            summary.patched,
            summary.unpatched,
            failures.len()
        );

        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(Error::Commit { failures })
        }
    }

    /// Commits the current registrations. Same as [`PatchEngine::commit`].
    ///
    /// # Errors
    /// See [`PatchEngine::commit`].
    pub fn attach(&self) -> Result<CommitSummary> {
        self.commit()
    }

    /// Reverts every patch and removes every registration.
    ///
    /// Returns the number of reverted functions.
    ///
    /// # Errors
    /// Returns the first revert failure after trying all functions, or
    /// [`Error::LockError`] if a lock is poisoned.
    pub fn detach(&self) -> Result<usize> {
        let mut registry = lock!(self.registry);

        let mut reverted = 0;
        let mut first_error = None;
        for (_, mut patched) in registry.patched.drain() {
            match patched.trampoline.revert() {
                Ok(()) => reverted += 1,
                Err(error) => {
                    warn!(
                        "Failed to revert {}: {error}",
                        patched.method.full_name()
                    );
                    first_error.get_or_insert(error);
                }
            }
        }

        for hooks in registry.functions.values() {
            hooks.clear()?;
            hooks.clear_dirty()?;
        }

        info!("Detached {reverted} function(s)");
        match first_error {
            Some(error) => Err(error),
            None => Ok(reverted),
        }
    }

    /// `true` if the entry of `method` currently jumps into an artifact.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the registry lock is poisoned.
    pub fn is_patched(&self, method: &MethodDef) -> Result<bool> {
        Ok(lock!(self.registry).patched.contains_key(&method.token))
    }

    /// All currently patched functions, in token order.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the registry lock is poisoned.
    pub fn patched_methods(&self) -> Result<Vec<MethodHandle>> {
        let registry = lock!(self.registry);
        let mut methods: Vec<MethodHandle> = registry
            .patched
            .values()
            .map(|patched| patched.method.clone())
            .collect();
        methods.sort_by_key(|method| method.token);
        Ok(methods)
    }

    /// The hooks currently registered on `method`, in execution order.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if a lock is poisoned.
    pub fn hooks(&self, method: &MethodDef) -> Result<HookSnapshot> {
        let hooks = lock!(self.registry).functions.get(&method.token).cloned();
        match hooks {
            Some(hooks) => hooks.snapshot(),
            None => Ok(HookSnapshot::default()),
        }
    }

    /// Entry address of the artifact `method` currently jumps to.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the registry lock is poisoned.
    pub fn artifact_entry(&self, method: &MethodDef) -> Result<Option<u64>> {
        Ok(lock!(self.registry)
            .patched
            .get(&method.token)
            .map(|patched| patched.artifact.entry()))
    }

    fn dump(&self, stage: DumpFlags, method: &MethodDef, instructions: &[Instruction]) {
        if self.config.dump.contains(stage) {
            self.sink.dump(stage, method, instructions);
        }
    }

    /// Builds the artifact of one function, `None` if it has no hooks left.
    fn build(&self, job: &Job) -> Result<Option<Artifact>> {
        let method = &job.hooks.method;
        if job.snapshot.is_empty() {
            return Ok(None);
        }

        let entry = method.entry();
        if entry == 0 {
            return Err(construction_error!(
                method.full_name(),
                "the method has no body to patch"
            ));
        }

        let heap = self.runtime.code_heap();
        let mut bytes = heap.read_blob(entry)?;
        if let Some(saved) = &job.saved {
            if let Some(head) = bytes.get_mut(..saved.len()) {
                head.copy_from_slice(saved);
            }
        }

        let original = decode_method(&bytes, &ModuleResolver::new(self.runtime.module()), method)?;
        self.dump(DumpFlags::ORIGINAL, method, &original.instructions);

        let Some(composed) = compose(method, original, &job.snapshot)? else {
            return Ok(None);
        };
        self.dump(DumpFlags::COMPOSED, method, &composed.instructions);

        let options = EncodeOptions {
            locals: composed.locals,
            returns_value: method.returns_value(),
            init_locals: true,
        };
        let mut tokens = DynamicTokenTable::new();
        let encoded = encode_method(&composed.instructions, &options, &mut tokens)?;
        let generated = DynamicMethod::new(
            format!("{}_Patch", method.full_name()),
            method.clone(),
            encoded.body,
            tokens,
        );

        if self.config.dump.contains(DumpFlags::FINAL_EMITTED) {
            let emitted = decode_method(generated.body(), &generated.resolver(), method)?;
            self.sink
                .dump(DumpFlags::FINAL_EMITTED, method, &emitted.instructions);
        }

        let artifact = heap.materialize(generated)?;
        debug!(
            "Built {} with {} hook(s) at 0x{:x}",
            method.full_name(),
            job.snapshot.len(),
            artifact.entry()
        );
        Ok(Some(artifact))
    }

    /// Points the entry of `method` at `artifact`, or reverts it for `None`.
    ///
    /// Returns `Some(true)` for a new or moved patch, `Some(false)` for a removed one and
    /// `None` when nothing changed.
    fn apply(
        &self,
        registry: &mut Registry,
        method: &MethodHandle,
        artifact: Option<Artifact>,
    ) -> Result<Option<bool>> {
        let token = method.token;

        let Some(artifact) = artifact else {
            let Some(mut patched) = registry.patched.remove(&token) else {
                return Ok(None);
            };
            if let Err(error) = patched.trampoline.revert() {
                registry.patched.insert(token, patched);
                return Err(error);
            }
            return Ok(Some(false));
        };

        if let Some(patched) = registry.patched.get_mut(&token) {
            patched.trampoline.retarget(artifact.entry())?;
            patched.artifact = artifact;
            return Ok(Some(true));
        }

        let memory: Arc<dyn CodeMemory> = self.runtime.code_heap().clone();
        let trampoline = Trampoline::install(
            memory,
            self.config.arch.arch(),
            method.entry(),
            artifact.entry(),
        )?;
        registry.patched.insert(
            token,
            PatchedMethod {
                method: method.clone(),
                trampoline,
                artifact,
            },
        );
        Ok(Some(true))
    }
}

impl Drop for PatchEngine {
    fn drop(&mut self) {
        let registry = self
            .registry
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if !registry.patched.is_empty() {
            info!("Reverting {} patch(es)", registry.patched.len());
        }
        registry.patched.clear();
    }
}
