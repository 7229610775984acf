use thiserror::Error;

use crate::metadata::token::Token;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! construction_error {
    ($method:expr, $fmt:expr $(, $arg:expr)* $(,)?) => {
        crate::Error::Construction {
            method: $method.to_string(),
            message: format!($fmt $(, $arg)*),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// # Error Categories
///
/// ## Byte stream errors
/// - [`Error::Malformed`] - Corrupted method body, header or signature
/// - [`Error::OutOfBounds`] - Read or write past the end of a buffer or code region
/// - [`Error::NotSupported`] - Valid input using a feature this crate does not handle
///
/// ## Decode / encode errors
/// - [`Error::Resolution`] - A token inside an instruction stream could not be resolved
/// - [`Error::OperandMismatch`] - Operand kind does not fit the opcode
/// - [`Error::LabelIntegrity`] - A referenced label is not attached to exactly one instruction
///
/// ## Patching errors
/// - [`Error::Construction`] - A hook could not be composed into the target function
/// - [`Error::Trampoline`] - The entry-point patch is not in the expected state
/// - [`Error::Commit`] - One or more functions failed during [`crate::PatchEngine::commit`]
/// - [`Error::ContextFreed`] - Registration through a context that was already freed
///
/// ## Execution errors
/// - [`Error::UnhandledException`] - A managed exception escaped the invoked function
/// - [`Error::InvalidProgram`] - The instruction stream violates stack or type rules
/// - [`Error::CallDepthExceeded`] / [`Error::InstructionLimitExceeded`] - Interpreter limits
#[derive(Error, Debug)]
pub enum Error {
    /// The byte stream is damaged and could not be parsed.
    ///
    /// The error includes the source location where the malformation was detected.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// The input uses a feature that is not supported.
    #[error("Not supported - {0}")]
    NotSupported(String),

    /// A metadata token could not be resolved by the active token resolver.
    ///
    /// Decoding is all-or-nothing, so this aborts the decode of the whole function.
    #[error("Failed to resolve token {token}")]
    Resolution {
        /// The token that failed to resolve
        token: Token,
    },

    /// The operand attached to an instruction does not match the opcode's shape.
    #[error("Operand for '{mnemonic}' must be {expected}")]
    OperandMismatch {
        /// Canonical mnemonic of the opcode
        mnemonic: &'static str,
        /// The operand shape the opcode requires
        expected: &'static str,
    },

    /// A label is referenced by an operand but attached to zero or several instructions.
    #[error("Label {label} is attached to {attached} instructions, expected exactly one")]
    LabelIntegrity {
        /// Display name of the offending label
        label: String,
        /// How many instructions carry the label
        attached: usize,
    },

    /// A hook could not be composed into the target function.
    #[error("Cannot patch {method}: {message}")]
    Construction {
        /// Display name of the target function
        method: String,
        /// What went wrong
        message: String,
    },

    /// The entry-point trampoline is not in the expected state.
    #[error(transparent)]
    Trampoline(#[from] TrampolineError),

    /// One or more functions failed during a commit. Every other function was applied.
    #[error("{} function(s) failed to commit: {}", failures.len(), summarize(failures))]
    Commit {
        /// The failing functions together with their individual errors
        failures: Vec<(String, Error)>,
    },

    /// A hook was registered through a context after it was freed.
    #[error("Context '{0}' was already freed")]
    ContextFreed(String),

    /// The hook id is not registered in this context.
    #[error("Hook {0} is not registered in this context")]
    HookNotFound(u64),

    /// No method with this token or name exists.
    #[error("Method not found - {0}")]
    MethodNotFound(String),

    /// No type with this token or name exists.
    #[error("Type not found - {0}")]
    TypeNotFound(String),

    /// No field with this token or name exists.
    #[error("Field not found - {0}")]
    FieldNotFound(String),

    /// The method already has a body.
    #[error("Method {0} already has a body")]
    AlreadyImplemented(String),

    /// A managed exception was thrown and not caught by the invoked function.
    #[error("Unhandled exception of type {type_name}")]
    UnhandledException {
        /// Full name of the exception's type
        type_name: String,
    },

    /// The instruction stream violates the rules of the execution engine.
    #[error("Invalid program - {0}")]
    InvalidProgram(String),

    /// Too many nested calls.
    #[error("Maximum call depth of {0} exceeded")]
    CallDepthExceeded(usize),

    /// Too many executed instructions.
    #[error("Instruction limit of {0} exceeded")]
    InstructionLimitExceeded(u64),

    /// Failed to lock target.
    #[error("Failed to lock target")]
    LockError,
}

/// Errors raised by the trampoline installer.
///
/// All of these are invariant violations: the operation is aborted and memory is left as it was.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrampolineError {
    /// The target entry already starts with a jump sequence.
    #[error("Entry 0x{address:x} already carries a trampoline")]
    AlreadyInstalled {
        /// Entry address of the function
        address: u64,
    },

    /// The bytes at the entry are not the jump sequence that was written.
    #[error("Entry 0x{address:x} no longer holds the installed trampoline")]
    Mismatch {
        /// Entry address of the function
        address: u64,
    },

    /// The patch site is smaller than the jump sequence.
    #[error("Entry 0x{address:x} has {available} bytes, trampoline needs {required}")]
    SiteTooSmall {
        /// Entry address of the function
        address: u64,
        /// Bytes available at the patch site
        available: usize,
        /// Bytes required by the architecture
        required: usize,
    },

    /// The trampoline was already reverted.
    #[error("Trampoline at 0x{address:x} was already reverted")]
    NotInstalled {
        /// Entry address of the function
        address: u64,
    },
}

fn summarize(failures: &[(String, Error)]) -> String {
    failures
        .iter()
        .map(|(method, error)| format!("{method}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}
