//! # dotpatch Prelude
//!
//! Re-exports of the types needed to define host functions, register hooks and commit
//! patches. Import it with `use dotpatch::prelude::*;`.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dotpatch operations
pub use crate::Error;

/// The result type used throughout dotpatch
pub use crate::Result;

// ================================================================================================
// Host Runtime
// ================================================================================================

/// The host runtime and its settings
pub use crate::runtime::{Runtime, RuntimeConfig};

/// Metadata definitions of the host module
pub use crate::runtime::{
    FieldHandle, MethodBuilder, MethodDef, MethodHandle, TypeDef, TypeHandle,
};

/// Values handled by the interpreter
pub use crate::runtime::{Object, ObjectRef, Value};

/// Late-bound references to host members
pub use crate::runtime::{BindingKind, BindingRegistry};

/// Type signatures of parameters, locals and fields
pub use crate::metadata::signatures::TypeSignature;

/// Metadata tokens
pub use crate::metadata::token::Token;

// ================================================================================================
// Instructions
// ================================================================================================

/// Instruction model
pub use crate::assembly::{ExceptionBlock, Instruction, Label, OpCode, Operand};

/// Fluent instruction builder
pub use crate::assembly::InstructionAssembler;

/// Decoding and encoding of method bodies
pub use crate::assembly::{decode_method, encode_method, DecodedMethod, EncodeOptions};

// ================================================================================================
// Patching
// ================================================================================================

/// The commit engine and registration contexts
pub use crate::patch::{CommitSummary, EngineConfig, PatchContext, PatchEngine};

/// Hook descriptions
pub use crate::patch::{HookId, HookKind, HookPriority, Transpiler};

/// Entry jump encodings
pub use crate::patch::ArchKind;

/// Instruction dumps
pub use crate::patch::{DiagnosticSink, DumpFlags, LogSink, MemorySink};
