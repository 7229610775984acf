//! Method body layout: headers, exception clauses and their flags.

mod body;
mod exceptions;
mod types;

pub use body::MethodBody;
pub use exceptions::{ExceptionHandler, ExceptionHandlerFlags};
pub use types::{MethodBodyFlags, SectionFlags, TINY_CODE_LIMIT, TINY_MAX_STACK};
