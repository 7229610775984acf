//! Metadata needed to read and write instruction streams.
//!
//! - [`token`] - table/row references stored in operands
//! - [`resolver`] - turning tokens into handles for ordinary and generated bodies
//! - [`signatures`] - type signatures and local variable signature blobs
//! - [`method`] - method headers and exception clauses

pub mod method;
pub mod resolver;
pub mod signatures;
pub mod token;
