//! The addressable code region.
//!
//! Every method body lives at a concrete address inside one contiguous byte region. Blobs
//! are bump-allocated on 16 byte boundaries and padded so that a trampoline always fits at
//! their entry. Addresses are never reused. Blobs owned by a generated artifact are freed by
//! [`CodeHeap::collect`] once the last [`Artifact`] clone is gone; their bytes are poisoned
//! so that executing them is detected.

use std::sync::{Arc, RwLock, Weak};

use crossbeam_skiplist::SkipMap;
use log::debug;

use crate::{
    metadata::token::Token,
    patch::CodeMemory,
    runtime::dynamic::{Artifact, ArtifactInner, DynamicMethod},
    Error, Result,
};

/// Minimal size of a blob, large enough for every supported trampoline.
pub const MIN_PATCH_SITE: usize = 16;

const ALIGNMENT: usize = 16;
const POISON: u8 = 0xCC;

/// Who a blob belongs to.
#[derive(Debug, Clone)]
pub(crate) enum BlobOwner {
    /// The body of a module method
    Method(Token),
    /// A generated artifact
    Dynamic(Weak<ArtifactInner>),
}

#[derive(Debug, Clone)]
struct Blob {
    len: usize,
    owner: BlobOwner,
}

/// The code region of a runtime.
pub struct CodeHeap {
    base: u64,
    memory: RwLock<Vec<u8>>,
    blobs: SkipMap<u64, Blob>,
}

impl CodeHeap {
    /// Creates an empty heap whose first byte lives at `base`.
    #[must_use]
    pub fn new(base: u64) -> Self {
        CodeHeap {
            base,
            memory: RwLock::new(Vec::new()),
            blobs: SkipMap::new(),
        }
    }

    /// Address of the first byte of the region.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    fn offset(&self, address: u64, len: usize, available: usize) -> Result<usize> {
        let offset = address
            .checked_sub(self.base)
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or(Error::OutOfBounds)?;
        match offset.checked_add(len) {
            Some(end) if end <= available => Ok(offset),
            _ => Err(Error::OutOfBounds),
        }
    }

    fn place(&self, bytes: &[u8]) -> Result<(u64, usize)> {
        let len = bytes.len().max(MIN_PATCH_SITE);
        let mut memory = write_lock!(self.memory);

        let start = memory.len().next_multiple_of(ALIGNMENT);
        memory.resize(start + len, 0);
        memory[start..start + bytes.len()].copy_from_slice(bytes);

        let address = self.base + start as u64;
        Ok((address, len))
    }

    /// Places the body of module method `token` and returns its address.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the heap lock is poisoned.
    pub(crate) fn allocate_method(&self, token: Token, body: &[u8]) -> Result<u64> {
        let (address, len) = self.place(body)?;
        self.blobs.insert(
            address,
            Blob {
                len,
                owner: BlobOwner::Method(token),
            },
        );
        debug!("Placed body of {token} at 0x{address:x} ({} bytes)", body.len());
        Ok(address)
    }

    /// Materialises a generated method and returns the pinning [`Artifact`].
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the heap lock is poisoned.
    pub fn materialize(&self, method: DynamicMethod) -> Result<Artifact> {
        let (address, len) = self.place(method.body())?;
        let inner = Arc::new_cyclic(|weak| {
            self.blobs.insert(
                address,
                Blob {
                    len,
                    owner: BlobOwner::Dynamic(weak.clone()),
                },
            );
            ArtifactInner { method, address }
        });
        debug!(
            "Materialized {} at 0x{address:x} ({len} bytes)",
            inner.method.name()
        );
        Ok(Artifact(inner))
    }

    /// Owner of the blob starting at `address`.
    #[must_use]
    pub(crate) fn owner(&self, address: u64) -> Option<BlobOwner> {
        self.blobs.get(&address).map(|entry| entry.value().owner.clone())
    }

    /// `true` if a live blob starts at `address`.
    #[must_use]
    pub fn is_live(&self, address: u64) -> bool {
        self.blobs.contains_key(&address)
    }

    /// Number of live blobs.
    #[must_use]
    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    /// Copies `len` bytes starting at `address`.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] outside the region.
    pub fn read(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let memory = read_lock!(self.memory);
        let offset = self.offset(address, len, memory.len())?;
        Ok(memory[offset..offset + len].to_vec())
    }

    /// Copies the whole blob starting at `address`.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] if no live blob starts there.
    pub fn read_blob(&self, address: u64) -> Result<Vec<u8>> {
        let len = self
            .blobs
            .get(&address)
            .map(|entry| entry.value().len)
            .ok_or(Error::OutOfBounds)?;
        self.read(address, len)
    }

    /// Frees every generated blob whose artifact is no longer pinned.
    ///
    /// Returns the freed addresses.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the heap lock is poisoned.
    pub fn collect(&self) -> Result<Vec<u64>> {
        let dead: Vec<(u64, usize)> = self
            .blobs
            .iter()
            .filter_map(|entry| match &entry.value().owner {
                BlobOwner::Dynamic(weak) if weak.strong_count() == 0 => {
                    Some((*entry.key(), entry.value().len))
                }
                _ => None,
            })
            .collect();

        if dead.is_empty() {
            return Ok(Vec::new());
        }

        let mut memory = write_lock!(self.memory);
        let mut freed = Vec::with_capacity(dead.len());
        for (address, len) in dead {
            let offset = self.offset(address, len, memory.len())?;
            memory[offset..offset + len].fill(POISON);
            self.blobs.remove(&address);
            freed.push(address);
        }

        debug!("Collected {} unpinned artifact(s)", freed.len());
        Ok(freed)
    }
}

impl CodeMemory for CodeHeap {
    fn read_code(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        let memory = read_lock!(self.memory);
        let offset = self.offset(address, buffer.len(), memory.len())?;
        buffer.copy_from_slice(&memory[offset..offset + buffer.len()]);
        Ok(())
    }

    fn write_code(&self, address: u64, bytes: &[u8]) -> Result<()> {
        let mut memory = write_lock!(self.memory);
        let offset = self.offset(address, bytes.len(), memory.len())?;
        memory[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn patch_site(&self, address: u64) -> Option<usize> {
        self.blobs.get(&address).map(|entry| entry.value().len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::dynamic::DynamicTokenTable;
    use crate::runtime::{MethodBuilder, Module};

    #[test]
    fn allocation_is_aligned_and_padded() {
        let heap = CodeHeap::new(0x1000);
        let a = heap.allocate_method(Token(0x06000001), &[0x06, 0x2A]).unwrap();
        let b = heap.allocate_method(Token(0x06000002), &[0x06, 0x2A]).unwrap();

        assert_eq!(a, 0x1000);
        assert_eq!(b, 0x1010);
        assert_eq!(heap.read_blob(a).unwrap().len(), MIN_PATCH_SITE);
        assert_eq!(heap.patch_site(a), Some(MIN_PATCH_SITE));
        assert!(heap.read(0x0FFF, 1).is_err());
    }

    #[test]
    fn writes_are_bounded() {
        let heap = CodeHeap::new(0x1000);
        let a = heap.allocate_method(Token(0x06000001), &[0x06, 0x2A]).unwrap();
        heap.write_code(a, &[0xAA; 4]).unwrap();
        assert_eq!(heap.read(a, 4).unwrap(), vec![0xAA; 4]);
        assert!(heap.write_code(a + 15, &[0; 2]).is_err());
    }

    #[test]
    fn unpinned_artifacts_are_collected() {
        let module = Module::new();
        let ty = module.define_type("App", "Host", None).unwrap();
        let owner = module.define_method(MethodBuilder::new(&ty, "Run")).unwrap();

        let heap = CodeHeap::new(0x1000);
        let artifact = heap
            .materialize(DynamicMethod::new(
                "Run_patch",
                owner,
                vec![0x06, 0x2A],
                DynamicTokenTable::new(),
            ))
            .unwrap();
        let address = artifact.entry();

        assert!(heap.collect().unwrap().is_empty());
        assert!(heap.is_live(address));

        drop(artifact);
        assert_eq!(heap.collect().unwrap(), vec![address]);
        assert!(!heap.is_live(address));
        assert_eq!(heap.read(address, 2).unwrap(), vec![POISON, POISON]);
    }
}
