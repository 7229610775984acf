// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]
// - 'patch/trampoline.rs' writes jump sequences through raw pointers in `RawCodeMemory`

//! # dotpatch
//!
//! Runtime function patching for CIL method bodies. `dotpatch` decodes the instruction
//! stream of a compiled function, lets independent callers attach prefix, suffix and
//! transpiler hooks to it, composes a replacement body and redirects the original entry
//! point to it with a jump, reversibly and while the host keeps running.
//!
//! ## Quick Start
//!
//! ```rust
//! use dotpatch::prelude::*;
//! use std::sync::Arc;
//!
//! let runtime = Arc::new(Runtime::new(RuntimeConfig::default())?);
//! let ty = runtime.define_type("App", "Checks", None)?;
//!
//! // bool IsPositive(int x) => x >= 0
//! let is_positive = runtime.define_method(
//!     MethodBuilder::new(&ty, "IsPositive")
//!         .param("x", TypeSignature::I4)
//!         .returns(TypeSignature::Boolean),
//! )?;
//! runtime.implement(
//!     &is_positive,
//!     vec![],
//!     &InstructionAssembler::new()
//!         .ldarg(0)
//!         .ldc_i4(0)
//!         .op(OpCode::Clt)
//!         .ldc_i4(0)
//!         .op(OpCode::Ceq)
//!         .ret()
//!         .finish()?,
//! )?;
//!
//! // static void Negate(ref int x) => x = -x
//! let negate = runtime.define_method(
//!     MethodBuilder::new(&ty, "Negate").param("x", TypeSignature::by_ref(TypeSignature::I4)),
//! )?;
//! runtime.implement(
//!     &negate,
//!     vec![],
//!     &InstructionAssembler::new()
//!         .ldarg(0)
//!         .ldarg(0)
//!         .ldind(&TypeSignature::I4)
//!         .op(OpCode::Neg)
//!         .stind(&TypeSignature::I4)
//!         .ret()
//!         .finish()?,
//! )?;
//!
//! let engine = PatchEngine::new(runtime.clone());
//! engine.context("example").add_prefix(&is_positive, &negate)?;
//! engine.commit()?;
//!
//! assert_eq!(runtime.invoke(&is_positive, vec![Value::I4(-5)])?, Some(Value::I4(1)));
//!
//! engine.detach()?;
//! assert_eq!(runtime.invoke(&is_positive, vec![Value::I4(-5)])?, Some(Value::I4(0)));
//! # Ok::<(), dotpatch::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`metadata`] - Tokens, the token resolvers, method body headers and local signatures
//! - [`assembly`] - The instruction model, decoder, encoder and assembler
//! - [`runtime`] - The host: module, code heap, dynamic methods and the interpreter
//! - [`patch`] - Hooks, contexts, composition, trampolines and the commit engine
//! - [`file`] - Byte-level readers and writers
//! - [`prelude`] - Re-exports of the types most callers need
//!
//! ### Patching Flow
//!
//! A [`patch::PatchContext`] records hooks into per-function hook sets owned by the
//! [`PatchEngine`]. [`PatchEngine::commit`] then takes every dirty function, decodes its
//! original body, runs the transpilers, wraps the result with the prefixes and suffixes,
//! encodes a new artifact into the code heap and writes a jump at the original entry.
//! [`PatchEngine::detach`] restores every entry.
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T>`]. Commit failures are collected per
//! function into [`Error::Commit`] so that one broken hook does not keep other functions
//! from being patched.

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

pub mod assembly;
pub mod file;
pub mod metadata;
pub mod patch;
pub mod prelude;
pub mod runtime;

/// `dotpatch` Result type
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always [`Error`].
///
/// # Examples
///
/// ```rust
/// use dotpatch::{Error, Result};
///
/// fn checked(value: u32) -> Result<u32> {
///     if value == 0 {
///         return Err(Error::NotSupported("zero".to_string()));
///     }
///     Ok(value)
/// }
/// assert!(checked(1).is_ok());
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `dotpatch` Error types
pub use error::{Error, TrampolineError};

/// Bounds-checked little-endian reader
pub use file::parser::Parser;

/// The commit engine
pub use patch::PatchEngine;

/// The host runtime
pub use runtime::Runtime;
