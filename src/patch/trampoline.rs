//! Entry-point redirection.
//!
//! A [`Trampoline`] overwrites the first bytes of a function entry with an absolute jump to
//! a replacement and keeps the overwritten bytes so the entry can be restored byte for byte.
//! The jump encoding is chosen through [`TrampolineArch`]; the bytes are read and written
//! through [`CodeMemory`], which the runtime [`crate::runtime::CodeHeap`] implements safely.
//! [`RawCodeMemory`] writes straight into process memory and is the only `unsafe` boundary
//! of the crate.
//!
//! # Encodings
//!
//! | Architecture | Size | Sequence |
//! |--------------|------|----------|
//! | x86-64 | 12 | `mov rax, imm64; jmp rax` |
//! | AArch64 | 16 | `ldr x16, #8; br x16; .quad target` |
//!
//! Neither sequence starts with a byte whose low two bits are set, so a trampoline can never
//! be mistaken for a method header.

use std::{fmt, sync::Arc};

use log::{info, warn};

use crate::{Error, Result, TrampolineError};

/// Byte access to the memory holding function entries.
pub trait CodeMemory: Send + Sync {
    /// Fills `buffer` with the bytes starting at `address`.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] if the range is not readable.
    fn read_code(&self, address: u64, buffer: &mut [u8]) -> Result<()>;

    /// Writes `bytes` at `address` as one copy.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] if the range is not writable.
    fn write_code(&self, address: u64, bytes: &[u8]) -> Result<()>;

    /// Number of bytes that may be overwritten at `address`, if known.
    fn patch_site(&self, _address: u64) -> Option<usize> {
        None
    }
}

/// An absolute jump encoding for one instruction set.
pub trait TrampolineArch: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Number of bytes the jump occupies.
    fn size(&self) -> usize;

    /// Encodes a jump to `target`.
    fn encode(&self, target: u64) -> Vec<u8>;

    /// Returns the target if `bytes` start with a jump of this encoding.
    fn decode(&self, bytes: &[u8]) -> Option<u64>;
}

/// `mov rax, imm64; jmp rax`
#[derive(Debug, Clone, Copy, Default)]
pub struct X64AbsoluteJump;

impl TrampolineArch for X64AbsoluteJump {
    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn size(&self) -> usize {
        12
    }

    fn encode(&self, target: u64) -> Vec<u8> {
        let mut code = Vec::with_capacity(12);
        code.extend_from_slice(&[0x48, 0xB8]); // mov rax, imm64
        code.extend_from_slice(&target.to_le_bytes());
        code.extend_from_slice(&[0xFF, 0xE0]); // jmp rax
        code
    }

    fn decode(&self, bytes: &[u8]) -> Option<u64> {
        let code = bytes.get(..12)?;
        if code[..2] != [0x48, 0xB8] || code[10..] != [0xFF, 0xE0] {
            return None;
        }
        let mut target = [0u8; 8];
        target.copy_from_slice(&code[2..10]);
        Some(u64::from_le_bytes(target))
    }
}

const AARCH64_LDR_X16: u32 = 0x5800_0050; // ldr x16, #8
const AARCH64_BR_X16: u32 = 0xD61F_0200; // br x16

/// `ldr x16, #8; br x16; .quad target`
#[derive(Debug, Clone, Copy, Default)]
pub struct Aarch64AbsoluteJump;

impl TrampolineArch for Aarch64AbsoluteJump {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn size(&self) -> usize {
        16
    }

    fn encode(&self, target: u64) -> Vec<u8> {
        let mut code = Vec::with_capacity(16);
        code.extend_from_slice(&AARCH64_LDR_X16.to_le_bytes());
        code.extend_from_slice(&AARCH64_BR_X16.to_le_bytes());
        code.extend_from_slice(&target.to_le_bytes());
        code
    }

    fn decode(&self, bytes: &[u8]) -> Option<u64> {
        let code = bytes.get(..16)?;
        if code[..4] != AARCH64_LDR_X16.to_le_bytes() || code[4..8] != AARCH64_BR_X16.to_le_bytes()
        {
            return None;
        }
        let mut target = [0u8; 8];
        target.copy_from_slice(&code[8..16]);
        Some(u64::from_le_bytes(target))
    }
}

/// Selects a [`TrampolineArch`] by name.
///
/// ```rust
/// use dotpatch::patch::ArchKind;
///
/// assert_eq!("arm64".parse::<ArchKind>().unwrap(), ArchKind::Aarch64);
/// assert_eq!(ArchKind::default().to_string(), "x86_64");
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::EnumString, strum::Display,
)]
#[strum(ascii_case_insensitive)]
pub enum ArchKind {
    /// x86-64, 12 byte jump
    #[default]
    #[strum(to_string = "x86_64", serialize = "x64", serialize = "amd64")]
    X64,
    /// AArch64, 16 byte jump
    #[strum(to_string = "aarch64", serialize = "arm64")]
    Aarch64,
}

impl ArchKind {
    /// The jump encoding of this architecture.
    #[must_use]
    pub fn arch(self) -> &'static dyn TrampolineArch {
        match self {
            ArchKind::X64 => &X64AbsoluteJump,
            ArchKind::Aarch64 => &Aarch64AbsoluteJump,
        }
    }
}

/// Longest jump of any supported architecture.
pub const MAX_TRAMPOLINE_SIZE: usize = 16;

/// Decodes a jump of any supported architecture.
#[must_use]
pub fn decode_any(bytes: &[u8]) -> Option<u64> {
    X64AbsoluteJump
        .decode(bytes)
        .or_else(|| Aarch64AbsoluteJump.decode(bytes))
}

/// Process memory addressed by raw pointers.
pub struct RawCodeMemory {
    _private: (),
}

impl RawCodeMemory {
    /// Creates the accessor.
    ///
    /// # Safety
    ///
    /// Every address later passed to [`CodeMemory`] methods must point to mapped memory
    /// that is readable and writable for the requested length, and no thread may execute
    /// or access those bytes while they are written.
    #[must_use]
    pub unsafe fn new() -> Self {
        RawCodeMemory { _private: () }
    }
}

impl CodeMemory for RawCodeMemory {
    fn read_code(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        if address == 0 {
            return Err(Error::OutOfBounds);
        }
        // SAFETY: guaranteed by the contract of `RawCodeMemory::new`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                address as usize as *const u8,
                buffer.as_mut_ptr(),
                buffer.len(),
            );
        }
        Ok(())
    }

    fn write_code(&self, address: u64, bytes: &[u8]) -> Result<()> {
        if address == 0 {
            return Err(Error::OutOfBounds);
        }
        // SAFETY: guaranteed by the contract of `RawCodeMemory::new`.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as usize as *mut u8, bytes.len());
        }
        Ok(())
    }
}

/// An installed jump at a function entry.
///
/// Dropping an installed trampoline reverts it.
pub struct Trampoline {
    memory: Arc<dyn CodeMemory>,
    arch: &'static dyn TrampolineArch,
    address: u64,
    target: u64,
    saved: Vec<u8>,
    installed: bool,
}

impl Trampoline {
    /// Writes a jump to `target` at `address`.
    ///
    /// # Errors
    /// - [`TrampolineError::AlreadyInstalled`] if `address` already starts with a jump
    /// - [`TrampolineError::SiteTooSmall`] if the entry cannot hold the jump
    /// - [`Error::OutOfBounds`] if the memory cannot be accessed
    pub fn install(
        memory: Arc<dyn CodeMemory>,
        arch: &'static dyn TrampolineArch,
        address: u64,
        target: u64,
    ) -> Result<Self> {
        let required = arch.size();
        if let Some(available) = memory.patch_site(address) {
            if available < required {
                return Err(TrampolineError::SiteTooSmall {
                    address,
                    available,
                    required,
                }
                .into());
            }
        }

        let mut saved = vec![0u8; required];
        memory.read_code(address, &mut saved)?;
        if arch.decode(&saved).is_some() {
            return Err(TrampolineError::AlreadyInstalled { address }.into());
        }

        memory.write_code(address, &arch.encode(target))?;
        info!(
            "Installed {} trampoline 0x{address:x} -> 0x{target:x}",
            arch.name()
        );

        Ok(Trampoline {
            memory,
            arch,
            address,
            target,
            saved,
            installed: true,
        })
    }

    /// Restores the saved bytes.
    ///
    /// # Errors
    /// - [`TrampolineError::NotInstalled`] after a previous revert
    /// - [`TrampolineError::Mismatch`] if the entry no longer holds the written jump; memory
    ///   is left untouched
    pub fn revert(&mut self) -> Result<()> {
        if !self.installed {
            return Err(TrampolineError::NotInstalled {
                address: self.address,
            }
            .into());
        }

        let mut current = vec![0u8; self.saved.len()];
        self.memory.read_code(self.address, &mut current)?;
        if current != self.arch.encode(self.target) {
            return Err(TrampolineError::Mismatch {
                address: self.address,
            }
            .into());
        }

        self.memory.write_code(self.address, &self.saved)?;
        self.installed = false;
        info!("Reverted trampoline at 0x{:x}", self.address);
        Ok(())
    }

    /// Points the installed jump at `target` with a single write.
    ///
    /// # Errors
    /// - [`TrampolineError::NotInstalled`] after a revert
    /// - [`TrampolineError::Mismatch`] if the entry no longer holds the written jump
    pub fn retarget(&mut self, target: u64) -> Result<()> {
        if !self.installed {
            return Err(TrampolineError::NotInstalled {
                address: self.address,
            }
            .into());
        }

        let mut current = vec![0u8; self.saved.len()];
        self.memory.read_code(self.address, &mut current)?;
        if current != self.arch.encode(self.target) {
            return Err(TrampolineError::Mismatch {
                address: self.address,
            }
            .into());
        }

        self.memory.write_code(self.address, &self.arch.encode(target))?;
        info!(
            "Retargeted trampoline at 0x{:x}: 0x{:x} -> 0x{target:x}",
            self.address, self.target
        );
        self.target = target;
        Ok(())
    }

    /// The patched entry.
    #[must_use]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Where the jump leads.
    #[must_use]
    pub fn target(&self) -> u64 {
        self.target
    }

    /// The bytes the jump replaced.
    #[must_use]
    pub fn saved_bytes(&self) -> &[u8] {
        &self.saved
    }

    /// `false` once reverted.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// The jump encoding in use.
    #[must_use]
    pub fn arch(&self) -> &'static dyn TrampolineArch {
        self.arch
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        if self.installed {
            if let Err(error) = self.revert() {
                warn!(
                    "Failed to revert trampoline at 0x{:x}: {error}",
                    self.address
                );
            }
        }
    }
}

impl fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trampoline")
            .field("arch", &self.arch.name())
            .field("address", &format_args!("0x{:x}", self.address))
            .field("target", &format_args!("0x{:x}", self.target))
            .field("installed", &self.installed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metadata::token::Token, runtime::CodeHeap};

    fn heap_with_entry() -> (Arc<CodeHeap>, u64) {
        let heap = Arc::new(CodeHeap::new(0x4000));
        let entry = heap
            .allocate_method(Token(0x06000001), &[0x0A, 0x17, 0x2A])
            .unwrap();
        (heap, entry)
    }

    #[test]
    fn x64_encoding() {
        let code = X64AbsoluteJump.encode(0x1122_3344_5566_7788);
        assert_eq!(
            code,
            vec![0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0xFF, 0xE0]
        );
        assert_eq!(X64AbsoluteJump.decode(&code), Some(0x1122_3344_5566_7788));
        assert_eq!(X64AbsoluteJump.decode(&code[..11]), None);
    }

    #[test]
    fn aarch64_encoding() {
        let code = Aarch64AbsoluteJump.encode(0x8000);
        assert_eq!(&code[..8], &[0x50, 0x00, 0x00, 0x58, 0x00, 0x02, 0x1F, 0xD6]);
        assert_eq!(decode_any(&code), Some(0x8000));
        assert_eq!(X64AbsoluteJump.decode(&code), None);
    }

    #[test]
    fn install_and_revert_restore_bytes() {
        let (heap, entry) = heap_with_entry();
        let original = heap.read(entry, 16).unwrap();

        let mut trampoline =
            Trampoline::install(heap.clone(), &X64AbsoluteJump, entry, 0x9000).unwrap();
        assert_eq!(decode_any(&heap.read(entry, 12).unwrap()), Some(0x9000));
        assert_eq!(trampoline.saved_bytes(), &original[..12]);

        trampoline.revert().unwrap();
        assert_eq!(heap.read(entry, 16).unwrap(), original);
        assert!(matches!(
            trampoline.revert(),
            Err(Error::Trampoline(TrampolineError::NotInstalled { .. }))
        ));
    }

    #[test]
    fn retarget_keeps_saved_bytes() {
        let (heap, entry) = heap_with_entry();
        let original = heap.read(entry, 16).unwrap();

        let mut trampoline =
            Trampoline::install(heap.clone(), &X64AbsoluteJump, entry, 0x9000).unwrap();
        trampoline.retarget(0xA000).unwrap();
        assert_eq!(decode_any(&heap.read(entry, 12).unwrap()), Some(0xA000));
        assert_eq!(trampoline.target(), 0xA000);

        trampoline.revert().unwrap();
        assert_eq!(heap.read(entry, 16).unwrap(), original);
    }

    #[test]
    fn stacking_is_rejected() {
        let (heap, entry) = heap_with_entry();
        let _first = Trampoline::install(heap.clone(), &X64AbsoluteJump, entry, 0x9000).unwrap();
        let second = Trampoline::install(heap.clone(), &X64AbsoluteJump, entry, 0xA000);
        assert!(matches!(
            second,
            Err(Error::Trampoline(TrampolineError::AlreadyInstalled { .. }))
        ));
    }

    #[test]
    fn revert_refuses_foreign_bytes() {
        let (heap, entry) = heap_with_entry();
        let mut trampoline =
            Trampoline::install(heap.clone(), &X64AbsoluteJump, entry, 0x9000).unwrap();
        heap.write_code(entry, &[0x90; 4]).unwrap();

        assert!(matches!(
            trampoline.revert(),
            Err(Error::Trampoline(TrampolineError::Mismatch { .. }))
        ));
        assert_eq!(heap.read(entry, 4).unwrap(), vec![0x90; 4]);
        assert!(trampoline.is_installed());
    }

    #[test]
    fn drop_reverts() {
        let (heap, entry) = heap_with_entry();
        let original = heap.read(entry, 16).unwrap();
        {
            let _trampoline =
                Trampoline::install(heap.clone(), &Aarch64AbsoluteJump, entry, 0x9000).unwrap();
            assert_ne!(heap.read(entry, 16).unwrap(), original);
        }
        assert_eq!(heap.read(entry, 16).unwrap(), original);
    }

    #[test]
    fn raw_memory() {
        let mut buffer = Box::new([0x2Au8; 16]);
        let address = buffer.as_mut_ptr() as usize as u64;
        // SAFETY: the buffer outlives the trampoline and is not accessed meanwhile.
        let memory: Arc<dyn CodeMemory> = Arc::new(unsafe { RawCodeMemory::new() });

        let mut trampoline =
            Trampoline::install(memory.clone(), &X64AbsoluteJump, address, 0x1234).unwrap();
        let mut current = [0u8; 12];
        memory.read_code(address, &mut current).unwrap();
        assert_eq!(X64AbsoluteJump.decode(&current), Some(0x1234));

        trampoline.revert().unwrap();
        assert_eq!(*buffer, [0x2Au8; 16]);
    }

    #[test]
    fn arch_names_parse() {
        assert_eq!("X64".parse::<ArchKind>().unwrap(), ArchKind::X64);
        assert_eq!("aarch64".parse::<ArchKind>().unwrap(), ArchKind::Aarch64);
        assert!("mips".parse::<ArchKind>().is_err());
        assert_eq!(ArchKind::Aarch64.arch().size(), 16);
    }
}
