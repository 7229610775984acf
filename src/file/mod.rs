//! Byte-level reading and writing used by the decoder, encoder and signature codecs.

pub mod io;
pub mod parser;
