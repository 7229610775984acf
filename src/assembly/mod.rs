//! CIL instruction model, decoder and encoder.
//!
//! Method bodies are handled as lists of structural [`Instruction`]s: canonical opcodes with
//! typed operands, identity [`Label`]s as branch targets and [`ExceptionBlock`] operations
//! marking regions. The list form is what hooks and transpilers operate on; byte offsets and
//! tokens only exist at the edges.
//!
//! # Key Types
//! - [`Instruction`] - One instruction with its labels and region operations
//! - [`Operand`] - Typed operand (handles, labels, constants)
//! - [`OpCode`] - Canonical operation, short forms folded
//! - [`Label`] - Jump target compared by identity
//! - [`InstructionAssembler`] - Fluent list builder
//!
//! # Main Functions
//! - [`decode_method`] - Body bytes to instruction list
//! - [`decode_instruction`] - A single instruction
//! - [`encode_method`] - Instruction list to body bytes
//! - [`collect_regions`] - Explicit exception regions of a list
//!
//! # Example
//! ```rust
//! use dotpatch::assembly::{encode_method, EncodeOptions, InstructionAssembler, ModuleTokens};
//! use dotpatch::runtime::Module;
//!
//! let module = Module::new();
//! let body = InstructionAssembler::new().ldc_i4(2).ret().finish()?;
//! let options = EncodeOptions {
//!     returns_value: true,
//!     ..EncodeOptions::default()
//! };
//! let encoded = encode_method(&body, &options, &mut ModuleTokens::new(&module))?;
//! // tiny header, ldc.i4.2, ret
//! assert_eq!(encoded.body, vec![0x0A, 0x18, 0x2A]);
//! # Ok::<(), dotpatch::Error>(())
//! ```

mod assembler;
mod decoder;
mod encoder;
mod instruction;
mod instructions;
mod label;
pub mod opcodes;
mod regions;

pub use assembler::{ldind_for, stind_for, InstructionAssembler};
pub use decoder::{decode_instruction, decode_method, DecodeContext, DecodedMethod};
pub use encoder::{encode_method, EncodeOptions, EncodedMethod, ModuleTokens, TokenSink};
pub use instruction::{
    ArgumentRef, BlockKind, ExceptionBlock, Instruction, LocalRef, Operand,
};
pub use instructions::{FlowType, OpCode, OpCodeInfo, OperandShape};
pub use label::Label;
pub use regions::{collect_regions, ExceptionRegion, HandlerKind};
