//! Function patching.
//!
//! This module turns hook registrations into running code. A caller obtains a
//! [`PatchContext`] from a [`PatchEngine`], registers prefixes, suffixes and transpilers on
//! target functions and calls [`PatchEngine::commit`]. Each dirty function is then decoded,
//! composed with its hooks, emitted as a new artifact and reached through a jump written
//! over the entry of the original body.
//!
//! # Key Components
//!
//! - [`hook`]: priorities, hook kinds and transpilers
//! - [`hookset`]: ordered hook collections with parent chaining and dirty tracking
//! - [`compose`]: builds the replacement instruction list of one function
//! - [`trampoline`]: writes and reverts the entry jumps
//! - [`diagnostics`]: instruction dumps of each stage
//! - [`PatchEngine`] and [`PatchContext`]: registry and commit
//!
//! # Examples
//!
//! ```rust
//! use dotpatch::prelude::*;
//! use std::sync::Arc;
//!
//! let runtime = Arc::new(Runtime::new(RuntimeConfig::default())?);
//! let ty = runtime.define_type("App", "Math", None)?;
//! let answer = runtime.define_method(
//!     MethodBuilder::new(&ty, "Answer").returns(TypeSignature::I4),
//! )?;
//! runtime.implement(
//!     &answer,
//!     vec![],
//!     &InstructionAssembler::new().ldc_i4(41).ret().finish()?,
//! )?;
//!
//! let engine = PatchEngine::new(runtime.clone());
//! let mut context = engine.context("example");
//! context.add_transpiler(
//!     &answer,
//!     Transpiler::new("plus one", |_, mut body: Vec<Instruction>| {
//!         let ret = body.pop();
//!         body.push(Instruction::new(OpCode::LdcI4, Operand::Int32(1))?);
//!         body.push(Instruction::simple(OpCode::Add)?);
//!         body.extend(ret);
//!         Ok(body)
//!     }),
//! )?;
//! engine.commit()?;
//!
//! assert_eq!(runtime.invoke(&answer, vec![])?, Some(Value::I4(42)));
//! # Ok::<(), dotpatch::Error>(())
//! ```

mod binding;
pub mod compose;
mod config;
mod context;
pub mod diagnostics;
mod engine;
pub mod hook;
pub mod hookset;
pub mod trampoline;

pub use compose::{compose, ComposedMethod};
pub use config::EngineConfig;
pub use context::PatchContext;
pub use diagnostics::{DiagnosticSink, DumpFlags, DumpRecord, LogSink, MemorySink};
pub use engine::{CommitSummary, PatchEngine, PatchedMethod};
pub use hook::{
    sort_for_execution, Hook, HookAction, HookId, HookKind, HookPriority, Transpiler,
};
pub use hookset::{HookSet, HookSnapshot, MethodHooks, SharedHookSet};
pub use trampoline::{
    decode_any, Aarch64AbsoluteJump, ArchKind, CodeMemory, RawCodeMemory, Trampoline,
    TrampolineArch, X64AbsoluteJump, MAX_TRAMPOLINE_SIZE,
};
