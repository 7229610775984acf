//! Exception regions recovered from per-instruction block operations.
//!
//! Instruction lists carry regions only as [`ExceptionBlock`] operations. The encoder and
//! the interpreter both need the explicit form: a protected range and a handler range,
//! in instruction indices, innermost region first.

use crate::{
    assembly::{BlockKind, Instruction},
    runtime::TypeHandle,
    Result,
};

/// What a region's handler does.
#[derive(Debug, Clone)]
pub enum HandlerKind {
    /// Catches the given type and its subclasses
    Catch(TypeHandle),
    /// Runs on every exit from the protected range
    Finally,
    /// Runs only when an exception leaves the protected range
    Fault,
}

/// One try range with one handler, in instruction indices (end exclusive).
#[derive(Debug, Clone)]
pub struct ExceptionRegion {
    /// Handler kind
    pub kind: HandlerKind,
    /// First protected instruction
    pub try_start: usize,
    /// One past the last protected instruction
    pub try_end: usize,
    /// First handler instruction
    pub handler_start: usize,
    /// One past the last handler instruction
    pub handler_end: usize,
}

impl ExceptionRegion {
    /// `true` if instruction `index` is protected by this region.
    #[must_use]
    pub fn try_contains(&self, index: usize) -> bool {
        (self.try_start..self.try_end).contains(&index)
    }

    /// `true` if instruction `index` belongs to this region's handler.
    #[must_use]
    pub fn handler_contains(&self, index: usize) -> bool {
        (self.handler_start..self.handler_end).contains(&index)
    }
}

struct OpenRegion {
    try_start: usize,
    try_end: Option<usize>,
    handlers: Vec<(HandlerKind, usize, usize)>,
    current: Option<(HandlerKind, usize)>,
}

impl OpenRegion {
    fn close_handler(&mut self, at: usize) {
        if let Some((kind, start)) = self.current.take() {
            self.handlers.push((kind, start, at));
        }
    }
}

/// Rebuilds the explicit regions from the blocks attached to `instructions`.
///
/// Regions are returned innermost first; handlers sharing one try range keep their order.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if the block operations are unbalanced.
pub fn collect_regions(instructions: &[Instruction]) -> Result<Vec<ExceptionRegion>> {
    let mut open: Vec<OpenRegion> = Vec::new();
    let mut regions = Vec::new();

    for (index, instruction) in instructions.iter().enumerate() {
        for block in &instruction.blocks {
            match block.kind {
                BlockKind::BeginTry => open.push(OpenRegion {
                    try_start: index,
                    try_end: None,
                    handlers: Vec::new(),
                    current: None,
                }),
                BlockKind::BeginCatch | BlockKind::BeginFinally | BlockKind::BeginFault => {
                    let Some(region) = open.last_mut() else {
                        return Err(malformed_error!(
                            "{} at instruction {} without an open try",
                            block.kind,
                            index
                        ));
                    };

                    let kind = match block.kind {
                        BlockKind::BeginCatch => match &block.catch_type {
                            Some(ty) => HandlerKind::Catch(ty.clone()),
                            None => {
                                return Err(malformed_error!(
                                    "Catch handler at instruction {} has no type",
                                    index
                                ))
                            }
                        },
                        BlockKind::BeginFinally => HandlerKind::Finally,
                        _ => HandlerKind::Fault,
                    };

                    region.close_handler(index);
                    if region.try_end.is_none() {
                        region.try_end = Some(index);
                    }
                    region.current = Some((kind, index));
                }
                BlockKind::EndTry => {
                    let Some(mut region) = open.pop() else {
                        return Err(malformed_error!(
                            "EndTry at instruction {} without an open try",
                            index
                        ));
                    };

                    region.close_handler(index);
                    let Some(try_end) = region.try_end else {
                        return Err(malformed_error!(
                            "Try starting at instruction {} has no handler",
                            region.try_start
                        ));
                    };

                    for (kind, handler_start, handler_end) in region.handlers {
                        regions.push(ExceptionRegion {
                            kind,
                            try_start: region.try_start,
                            try_end,
                            handler_start,
                            handler_end,
                        });
                    }
                }
            }
        }
    }

    if let Some(region) = open.last() {
        return Err(malformed_error!(
            "Try starting at instruction {} is never closed",
            region.try_start
        ));
    }

    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{ExceptionBlock, OpCode};

    fn nop() -> Instruction {
        Instruction::simple(OpCode::Nop).unwrap()
    }

    #[test]
    fn try_finally() {
        let instructions = vec![
            nop().with_block(ExceptionBlock::begin_try()),
            nop(),
            nop().with_block(ExceptionBlock::begin_finally()),
            nop().with_block(ExceptionBlock::end_try()),
        ];

        let regions = collect_regions(&instructions).unwrap();
        assert_eq!(regions.len(), 1);
        assert!(matches!(regions[0].kind, HandlerKind::Finally));
        assert_eq!((regions[0].try_start, regions[0].try_end), (0, 2));
        assert_eq!((regions[0].handler_start, regions[0].handler_end), (2, 3));
        assert!(regions[0].try_contains(1));
        assert!(!regions[0].try_contains(2));
    }

    #[test]
    fn nested_regions_inner_first() {
        let instructions = vec![
            nop()
                .with_block(ExceptionBlock::begin_try())
                .with_block(ExceptionBlock::begin_try()),
            nop().with_block(ExceptionBlock::begin_fault()),
            nop()
                .with_block(ExceptionBlock::end_try())
                .with_block(ExceptionBlock::begin_finally()),
            nop().with_block(ExceptionBlock::end_try()),
        ];

        let regions = collect_regions(&instructions).unwrap();
        assert_eq!(regions.len(), 2);
        assert!(matches!(regions[0].kind, HandlerKind::Fault));
        assert_eq!((regions[0].try_start, regions[0].try_end), (0, 1));
        assert!(matches!(regions[1].kind, HandlerKind::Finally));
        assert_eq!((regions[1].try_start, regions[1].try_end), (0, 2));
    }

    #[test]
    fn unbalanced() {
        let dangling = vec![nop().with_block(ExceptionBlock::begin_try()), nop()];
        assert!(collect_regions(&dangling).is_err());

        let stray_end = vec![nop().with_block(ExceptionBlock::end_try())];
        assert!(collect_regions(&stray_end).is_err());

        let no_handler = vec![
            nop().with_block(ExceptionBlock::begin_try()),
            nop().with_block(ExceptionBlock::end_try()),
        ];
        assert!(collect_regions(&no_handler).is_err());
    }
}
