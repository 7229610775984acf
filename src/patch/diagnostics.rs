//! Instruction dumps taken while patching.
//!
//! The engine can hand the instruction list of a function to a [`DiagnosticSink`] at three
//! points, selected by [`DumpFlags`]: as decoded from the original body, as composed, and
//! as decoded back from the emitted artifact.

use std::sync::Mutex;

use bitflags::bitflags;
use log::debug;

use crate::{assembly::Instruction, runtime::MethodDef, Result};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    /// Stages at which instruction lists are dumped
    pub struct DumpFlags: u8 {
        /// The original body, after decoding
        const ORIGINAL = 0x1;
        /// The composed replacement, before encoding
        const COMPOSED = 0x2;
        /// The emitted artifact, decoded back from its bytes
        const FINAL_EMITTED = 0x4;
    }
}

impl DumpFlags {
    /// Short name of a single stage.
    #[must_use]
    pub fn stage_name(self) -> &'static str {
        if self == DumpFlags::ORIGINAL {
            "original"
        } else if self == DumpFlags::COMPOSED {
            "composed"
        } else if self == DumpFlags::FINAL_EMITTED {
            "emitted"
        } else {
            "mixed"
        }
    }
}

/// Receives instruction dumps.
pub trait DiagnosticSink: Send + Sync {
    /// Called once per enabled `stage` and patched function.
    fn dump(&self, stage: DumpFlags, method: &MethodDef, instructions: &[Instruction]);
}

/// Writes dumps to the `log` facade at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn dump(&self, stage: DumpFlags, method: &MethodDef, instructions: &[Instruction]) {
        debug!(
            "{} body of {} ({} instructions)",
            stage.stage_name(),
            method.full_name(),
            instructions.len()
        );
        for (index, instruction) in instructions.iter().enumerate() {
            debug!("  {index:4}: {instruction}");
        }
    }
}

/// One captured dump.
#[derive(Debug, Clone, PartialEq)]
pub struct DumpRecord {
    /// The stage
    pub stage: DumpFlags,
    /// Full name of the function
    pub method: String,
    /// One rendered line per instruction
    pub lines: Vec<String>,
}

/// Keeps dumps in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<DumpRecord>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        MemorySink::default()
    }

    /// The captured dumps, oldest first.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the sink lock is poisoned.
    pub fn records(&self) -> Result<Vec<DumpRecord>> {
        Ok(lock!(self.records).clone())
    }
}

impl DiagnosticSink for MemorySink {
    fn dump(&self, stage: DumpFlags, method: &MethodDef, instructions: &[Instruction]) {
        let record = DumpRecord {
            stage,
            method: method.full_name(),
            lines: instructions.iter().map(ToString::to_string).collect(),
        };
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

impl<T: DiagnosticSink> DiagnosticSink for std::sync::Arc<T> {
    fn dump(&self, stage: DumpFlags, method: &MethodDef, instructions: &[Instruction]) {
        (**self).dump(stage, method, instructions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{InstructionAssembler, OpCode},
        runtime::{MethodBuilder, Runtime, RuntimeConfig},
    };

    #[test]
    fn memory_sink_captures() {
        let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
        let ty = runtime.define_type("App", "Host", None).unwrap();
        let method = runtime.define_method(MethodBuilder::new(&ty, "Run")).unwrap();
        let body = InstructionAssembler::new()
            .ldc_i4(1)
            .op(OpCode::Pop)
            .ret()
            .finish()
            .unwrap();

        let sink = MemorySink::new();
        sink.dump(DumpFlags::COMPOSED, &method, &body);
        let records = sink.records().unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, "App.Host::Run");
        assert_eq!(records[0].lines.len(), 3);
        assert_eq!(records[0].stage.stage_name(), "composed");
    }
}
