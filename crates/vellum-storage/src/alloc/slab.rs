//! Per-transaction slab allocator.
//!
//! A `SlabAlloc` is bound to one committed [`Mapping`]. Refs below the
//! mapping size (the baseline) translate into the immutable committed
//! image; refs at or above it name slab memory owned by the write in
//! progress. Freeing a committed ref during a write does not release it
//! immediately: the range is recorded and handed to the file image at
//! commit, tagged with the version that released it.

use std::sync::Arc;
use tracing::{debug, trace};

use vellum_common::constants::{DEFAULT_MAX_SLAB_BYTES, MIN_SLAB_SIZE, NODE_HEADER_SIZE};
use vellum_common::types::Ref;

use super::image::Mapping;
use crate::array::header::read_capacity;
use crate::error::{StorageError, StorageResult};

/// A freshly allocated block.
///
/// Owns no memory; valid only while the allocator is not otherwise
/// borrowed.
#[derive(Debug)]
pub struct MemRef<'a> {
    /// Ref naming the block.
    pub ref_: Ref,
    /// The block's bytes, zero-filled.
    pub addr: &'a mut [u8],
}

/// A contiguous byte range in ref space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// First byte.
    pub ref_: u64,
    /// Length in bytes.
    pub size: u64,
}

impl Chunk {
    fn end(&self) -> u64 {
        self.ref_ + self.size
    }
}

struct Slab {
    ref_start: u64,
    mem: Vec<u8>,
}

impl Slab {
    fn ref_end(&self) -> u64 {
        self.ref_start + self.mem.len() as u64
    }
}

/// Allocator limits.
#[derive(Debug, Clone, Copy)]
pub struct SlabConfig {
    /// Size of the first slab.
    pub initial_slab_bytes: usize,
    /// Largest slab that may be created.
    pub max_slab_bytes: usize,
}

impl Default for SlabConfig {
    fn default() -> Self {
        Self {
            initial_slab_bytes: MIN_SLAB_SIZE,
            max_slab_bytes: DEFAULT_MAX_SLAB_BYTES,
        }
    }
}

/// Maps refs to memory for one transaction.
pub struct SlabAlloc {
    config: SlabConfig,
    mapping: Arc<Mapping>,
    baseline: u64,
    writable: bool,
    attached: bool,
    slabs: Vec<Slab>,
    free_space: Vec<Chunk>,
    freed_read_only: Vec<Chunk>,
    storage_version: u64,
    content_version: u64,
    instance_version: u64,
}

impl std::fmt::Debug for SlabAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabAlloc")
            .field("baseline", &self.baseline)
            .field("writable", &self.writable)
            .field("slabs", &self.slabs.len())
            .field("storage_version", &self.storage_version)
            .field("content_version", &self.content_version)
            .field("instance_version", &self.instance_version)
            .finish()
    }
}

impl Default for SlabAlloc {
    fn default() -> Self {
        Self::new(SlabConfig::default())
    }
}

impl SlabAlloc {
    /// Creates a detached allocator.
    #[must_use]
    pub fn new(config: SlabConfig) -> Self {
        let mapping = Arc::new(Mapping::empty());
        Self {
            config,
            baseline: mapping.size(),
            mapping,
            writable: false,
            attached: false,
            slabs: Vec::new(),
            free_space: Vec::new(),
            freed_read_only: Vec::new(),
            storage_version: 0,
            content_version: 0,
            instance_version: 0,
        }
    }

    /// Creates a writable allocator over an empty image; convenient for
    /// standalone use of arrays and trees.
    #[must_use]
    pub fn new_writable() -> Self {
        let mut alloc = Self::default();
        alloc.attach(Arc::new(Mapping::empty()), true);
        alloc
    }

    // =========================================================================
    // Attachment
    // =========================================================================

    /// Binds the allocator to a committed mapping, discarding all slab
    /// memory.
    pub fn attach(&mut self, mapping: Arc<Mapping>, writable: bool) {
        self.baseline = mapping.size();
        self.mapping = mapping;
        self.writable = writable;
        self.attached = true;
        self.reset_slabs();
        self.instance_version += 1;
        trace!(
            baseline = self.baseline,
            writable,
            instance_version = self.instance_version,
            "allocator attached"
        );
    }

    /// Moves to a newer mapping of the same file without invalidating
    /// committed refs.
    ///
    /// Used when a reader advances: refs below the old baseline remain
    /// valid if they are still reachable in the new snapshot.
    pub fn update_reader_view(&mut self, mapping: Arc<Mapping>) {
        self.baseline = mapping.size();
        self.mapping = mapping;
        self.reset_slabs();
    }

    /// Switches between read-only and writable mode.
    pub fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    /// Unbinds the allocator.
    pub fn detach(&mut self) {
        self.attached = false;
        self.writable = false;
        self.mapping = Arc::new(Mapping::empty());
        self.baseline = self.mapping.size();
        self.reset_slabs();
        self.instance_version += 1;
    }

    /// Discards all uncommitted allocations and deferred frees.
    pub fn reset_free_space_tracking(&mut self) {
        self.reset_slabs();
    }

    fn reset_slabs(&mut self) {
        self.slabs.clear();
        self.free_space.clear();
        self.freed_read_only.clear();
        self.storage_version += 1;
    }

    /// Returns true while bound to a mapping.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Returns true if allocation is permitted.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// The committed mapping this allocator is bound to.
    #[must_use]
    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }

    /// First ref that belongs to slab memory.
    #[must_use]
    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    /// Returns true if `r` belongs to the committed image.
    #[inline]
    #[must_use]
    pub fn is_read_only(&self, r: Ref) -> bool {
        r.as_u64() < self.baseline
    }

    // =========================================================================
    // Version counters
    // =========================================================================

    /// Changes whenever slab memory is discarded or the mapping changes.
    #[must_use]
    pub fn storage_version(&self) -> u64 {
        self.storage_version
    }

    /// Changes whenever any node is allocated, freed or modified.
    #[must_use]
    pub fn content_version(&self) -> u64 {
        self.content_version
    }

    /// Changes whenever the allocator is attached to another snapshot.
    #[must_use]
    pub fn instance_version(&self) -> u64 {
        self.instance_version
    }

    /// Records a modification that bypassed `translate_mut`.
    pub fn bump_content_version(&mut self) {
        self.content_version += 1;
    }

    // =========================================================================
    // Translation
    // =========================================================================

    /// Translates a ref into the bytes starting at it.
    ///
    /// Returns an empty slice for refs that name no storage.
    #[inline]
    pub fn translate(&self, r: Ref) -> &[u8] {
        let offset = r.as_u64();
        if offset < self.baseline {
            return self.mapping.translate(r);
        }
        match self.find_slab(offset) {
            Some(slab) => &slab.mem[(offset - slab.ref_start) as usize..],
            None => &[],
        }
    }

    /// Translates a ref, validating that it names a complete node.
    pub fn try_translate(&self, r: Ref) -> StorageResult<&[u8]> {
        if r.is_null() || !r.is_aligned() {
            return Err(StorageError::InvalidRef(r));
        }
        let bytes = self.translate(r);
        if bytes.len() < NODE_HEADER_SIZE || read_capacity(bytes) > bytes.len() {
            return Err(StorageError::InvalidRef(r));
        }
        Ok(bytes)
    }

    /// Translates a slab ref for modification.
    pub fn translate_mut(&mut self, r: Ref) -> StorageResult<&mut [u8]> {
        let offset = r.as_u64();
        if offset < self.baseline {
            return Err(StorageError::wrong_state(format!(
                "ref {} is read-only",
                offset
            )));
        }
        let ndx = self.slab_index(offset).ok_or(StorageError::InvalidRef(r))?;
        self.content_version += 1;
        let slab = &mut self.slabs[ndx];
        Ok(&mut slab.mem[(offset - slab.ref_start) as usize..])
    }

    fn slab_index(&self, offset: u64) -> Option<usize> {
        let ndx = self.slabs.partition_point(|s| s.ref_end() <= offset);
        (ndx < self.slabs.len() && self.slabs[ndx].ref_start <= offset).then_some(ndx)
    }

    fn find_slab(&self, offset: u64) -> Option<&Slab> {
        self.slab_index(offset).map(|ndx| &self.slabs[ndx])
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocates `size` bytes.
    ///
    /// `size` must be non-zero and a multiple of 8.
    pub fn alloc(&mut self, size: usize) -> StorageResult<MemRef<'_>> {
        if size == 0 || size % 8 != 0 {
            return Err(StorageError::InvalidSize(size));
        }
        if !self.writable {
            return Err(StorageError::wrong_state("allocation in read-only transaction"));
        }
        let size = size as u64;
        let pos = match self.free_space.iter().position(|c| c.size >= size) {
            Some(pos) => pos,
            None => {
                self.grow(size)?;
                self.free_space.len() - 1
            }
        };
        let chunk = &mut self.free_space[pos];
        let at = chunk.ref_;
        chunk.ref_ += size;
        chunk.size -= size;
        if chunk.size == 0 {
            self.free_space.remove(pos);
        }
        self.content_version += 1;
        let ndx = self
            .slab_index(at)
            .ok_or(StorageError::InvalidRef(Ref::new(at)))?;
        let slab = &mut self.slabs[ndx];
        let start = (at - slab.ref_start) as usize;
        let addr = &mut slab.mem[start..start + size as usize];
        addr.fill(0);
        Ok(MemRef {
            ref_: Ref::new(at),
            addr,
        })
    }

    fn grow(&mut self, size: u64) -> StorageResult<()> {
        let limit = self.config.max_slab_bytes;
        let min = size as usize;
        if min > limit {
            return Err(StorageError::OutOfMemory {
                requested: min,
                limit,
            });
        }
        let previous = self
            .slabs
            .last()
            .map_or(self.config.initial_slab_bytes / 2, |s| s.mem.len());
        let slab_size = (previous * 2).max(min).min(limit);
        let slab_size = (slab_size + 7) & !7;
        let ref_start = self
            .slabs
            .last()
            .map_or((self.baseline + 7) & !7, Slab::ref_end);
        debug!(ref_start, slab_size, "allocating new slab");
        self.slabs.push(Slab {
            ref_start,
            mem: vec![0; slab_size],
        });
        self.free_space.push(Chunk {
            ref_: ref_start,
            size: slab_size as u64,
        });
        Ok(())
    }

    /// Moves a node to a block of `new_size` bytes, preserving the first
    /// `min(old_size, new_size)` bytes, and frees the old block.
    pub fn realloc_(
        &mut self,
        r: Ref,
        old_size: usize,
        new_size: usize,
    ) -> StorageResult<MemRef<'_>> {
        let keep = old_size.min(new_size);
        let contents = self.translate(r).get(..keep).map(<[u8]>::to_vec);
        let contents = contents.ok_or(StorageError::InvalidRef(r))?;
        // the old block stays live until the copy exists
        let moved = {
            let mem = self.alloc(new_size)?;
            mem.addr[..keep].copy_from_slice(&contents);
            mem.ref_
        };
        self.free_chunk(r, old_size as u64)?;
        let addr = &mut self.translate_mut(moved)?[..new_size];
        Ok(MemRef { ref_: moved, addr })
    }

    /// Releases a node. The size is read from the node header.
    pub fn free_(&mut self, r: Ref) -> StorageResult<()> {
        if r.is_null() {
            return Ok(());
        }
        let capacity = {
            let bytes = self.try_translate(r)?;
            read_capacity(bytes)
        };
        self.free_chunk(r, capacity as u64)
    }

    fn free_chunk(&mut self, r: Ref, size: u64) -> StorageResult<()> {
        if !self.writable {
            return Err(StorageError::wrong_state("free in read-only transaction"));
        }
        let chunk = Chunk {
            ref_: r.as_u64(),
            size,
        };
        self.content_version += 1;
        if self.is_read_only(r) {
            self.freed_read_only.push(chunk);
            return Ok(());
        }
        let pos = self.free_space.partition_point(|c| c.ref_ < chunk.ref_);
        self.free_space.insert(pos, chunk);
        // coalesce with neighbours inside the same slab
        if pos + 1 < self.free_space.len()
            && self.free_space[pos].end() == self.free_space[pos + 1].ref_
            && self.same_slab(self.free_space[pos].ref_, self.free_space[pos + 1].ref_)
        {
            self.free_space[pos].size += self.free_space[pos + 1].size;
            self.free_space.remove(pos + 1);
        }
        if pos > 0
            && self.free_space[pos - 1].end() == self.free_space[pos].ref_
            && self.same_slab(self.free_space[pos - 1].ref_, self.free_space[pos].ref_)
        {
            self.free_space[pos - 1].size += self.free_space[pos].size;
            self.free_space.remove(pos);
        }
        Ok(())
    }

    fn same_slab(&self, a: u64, b: u64) -> bool {
        self.slab_index(a) == self.slab_index(b)
    }

    /// Committed ranges freed by the current write, ready to be released
    /// to the file image at commit.
    pub fn take_freed_read_only(&mut self) -> Vec<Chunk> {
        std::mem::take(&mut self.freed_read_only)
    }

    /// Total bytes of slab memory.
    #[must_use]
    pub fn slab_bytes(&self) -> usize {
        self.slabs.iter().map(|s| s.mem.len()).sum()
    }

    /// Total bytes currently free inside slabs.
    #[must_use]
    pub fn free_slab_bytes(&self) -> u64 {
        self.free_space.iter().map(|c| c.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_common::constants::FILE_HEADER_SIZE;

    #[test]
    fn test_alloc_requires_aligned_nonzero_size() {
        let mut alloc = SlabAlloc::new_writable();
        assert!(matches!(alloc.alloc(0), Err(StorageError::InvalidSize(0))));
        assert!(matches!(alloc.alloc(12), Err(StorageError::InvalidSize(12))));
        let mem = alloc.alloc(16).unwrap();
        assert_eq!(mem.addr.len(), 16);
        assert_eq!(mem.ref_.as_u64(), FILE_HEADER_SIZE);
    }

    #[test]
    fn test_read_only_allocator_rejects_mutation() {
        let mut alloc = SlabAlloc::default();
        alloc.attach(Arc::new(Mapping::empty()), false);
        let err = alloc.alloc(8).unwrap_err();
        assert!(matches!(err, StorageError::WrongTransactionState(_)));
        assert!(alloc.is_read_only(Ref::new(8)));
        assert!(!alloc.is_read_only(Ref::new(FILE_HEADER_SIZE)));
    }

    #[test]
    fn test_free_and_reuse() {
        let mut alloc = SlabAlloc::new_writable();
        let a = alloc.alloc(64).unwrap().ref_;
        alloc.translate_mut(a).unwrap()[..8].copy_from_slice(&[64, 0, 0, 0, 0, 0, 0, 0]);
        let b = alloc.alloc(64).unwrap().ref_;
        assert_ne!(a, b);
        alloc.free_(a).unwrap();
        let c = alloc.alloc(32).unwrap().ref_;
        assert_eq!(c, a);
    }

    #[test]
    fn test_slab_growth_and_limit() {
        let mut alloc = SlabAlloc::new(SlabConfig {
            initial_slab_bytes: 64,
            max_slab_bytes: 256,
        });
        alloc.attach(Arc::new(Mapping::empty()), true);
        alloc.alloc(64).unwrap();
        assert_eq!(alloc.slab_bytes(), 64);
        alloc.alloc(64).unwrap();
        assert_eq!(alloc.slab_bytes(), 64 + 128);
        let err = alloc.alloc(512).unwrap_err();
        assert!(matches!(err, StorageError::OutOfMemory { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_realloc_preserves_contents() {
        let mut alloc = SlabAlloc::new_writable();
        let r = {
            let mem = alloc.alloc(16).unwrap();
            mem.addr[8] = 42;
            mem.addr[0] = 16;
            mem.ref_
        };
        let moved = alloc.realloc_(r, 16, 64).unwrap();
        assert_eq!(moved.addr[8], 42);
        assert_eq!(moved.addr.len(), 64);
    }

    #[test]
    fn test_failed_realloc_keeps_node_allocated() {
        let mut alloc = SlabAlloc::new(SlabConfig {
            initial_slab_bytes: 128,
            max_slab_bytes: 128,
        });
        alloc.attach(Arc::new(Mapping::empty()), true);
        let r = {
            let mem = alloc.alloc(64).unwrap();
            mem.addr[8] = 0xAB;
            mem.ref_
        };
        let free_before = alloc.free_slab_bytes();

        let err = alloc.realloc_(r, 64, 256).unwrap_err();
        assert!(matches!(err, StorageError::OutOfMemory { .. }));
        assert_eq!(alloc.free_slab_bytes(), free_before);

        let other = alloc.alloc(64).unwrap().ref_;
        assert_ne!(other, r);
        assert_eq!(alloc.translate(r)[8], 0xAB);
    }

    #[test]
    fn test_versions_change() {
        let mut alloc = SlabAlloc::new_writable();
        let instance = alloc.instance_version();
        let content = alloc.content_version();
        alloc.alloc(8).unwrap();
        assert!(alloc.content_version() > content);
        assert_eq!(alloc.instance_version(), instance);
        alloc.attach(Arc::new(Mapping::empty()), false);
        assert!(alloc.instance_version() > instance);
    }
}
