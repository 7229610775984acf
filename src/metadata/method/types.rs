//! Header and section flags of a method body (ECMA-335 II.25.4).

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Low bits of the first header word
    pub struct MethodBodyFlags: u16 {
        /// One-byte header, code size in the upper six bits
        const TINY_FORMAT = 0x2;
        /// Twelve-byte header
        const FAT_FORMAT = 0x3;
        /// Exception sections follow the code
        const MORE_SECTS = 0x8;
        /// Locals start zeroed
        const INIT_LOCALS = 0x10;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Kind byte of a data section after the code
    pub struct SectionFlags: u8 {
        /// Exception clauses
        const EHTABLE = 0x1;
        /// Reserved
        const OPT_ILTABLE = 0x2;
        /// 24-byte clauses with a 24-bit section size
        const FAT_FORMAT = 0x40;
        /// Another section follows this one
        const MORE_SECTS = 0x80;
    }
}

/// Largest code size a tiny header can describe.
pub const TINY_CODE_LIMIT: usize = 0x3F;

/// Largest evaluation stack a tiny header implies.
pub const TINY_MAX_STACK: usize = 8;
