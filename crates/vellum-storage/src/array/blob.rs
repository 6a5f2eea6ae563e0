//! Raw byte nodes.

use vellum_common::constants::{MAX_NODE_SIZE, NODE_HEADER_SIZE};
use vellum_common::types::Ref;

use super::header::{node_len, NodeHeader, WidthType};
use crate::alloc::SlabAlloc;
use crate::error::{StorageError, StorageResult};

/// Accessor for a node holding raw bytes (width type "ignore").
#[derive(Debug, Clone, Copy)]
pub struct ArrayBlob {
    ref_: Ref,
    len: usize,
    capacity: usize,
}

impl ArrayBlob {
    /// Allocates a node holding `data`.
    pub fn create(alloc: &mut SlabAlloc, data: &[u8]) -> StorageResult<Self> {
        let capacity = node_len(WidthType::Ignore, data.len(), 0);
        if capacity > MAX_NODE_SIZE {
            return Err(StorageError::NodeTooLarge {
                size: capacity,
                max: MAX_NODE_SIZE,
            });
        }
        let mem = alloc.alloc(capacity)?;
        NodeHeader::blob(capacity, data.len()).write(mem.addr);
        mem.addr[NODE_HEADER_SIZE..NODE_HEADER_SIZE + data.len()].copy_from_slice(data);
        Ok(Self {
            ref_: mem.ref_,
            len: data.len(),
            capacity,
        })
    }

    /// Attaches an accessor to an existing blob node.
    pub fn init_from_ref(alloc: &SlabAlloc, r: Ref) -> StorageResult<Self> {
        let bytes = alloc.try_translate(r)?;
        let header =
            NodeHeader::parse(bytes).ok_or_else(|| StorageError::corrupted(r, "bad header"))?;
        if header.width_type != WidthType::Ignore {
            return Err(StorageError::corrupted(r, "not a blob"));
        }
        if NODE_HEADER_SIZE + header.size > header.capacity {
            return Err(StorageError::corrupted(r, "blob exceeds capacity"));
        }
        Ok(Self {
            ref_: r,
            len: header.size,
            capacity: header.capacity,
        })
    }

    /// Ref of the node.
    #[must_use]
    pub fn ref_(&self) -> Ref {
        self.ref_
    }

    /// Number of bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the blob holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The stored bytes.
    pub fn bytes<'a>(&self, alloc: &'a SlabAlloc) -> &'a [u8] {
        &alloc.translate(self.ref_)[NODE_HEADER_SIZE..NODE_HEADER_SIZE + self.len]
    }

    /// Replaces bytes `[begin, end)` with `data`. May move the node.
    pub fn replace(
        &mut self,
        alloc: &mut SlabAlloc,
        begin: usize,
        end: usize,
        data: &[u8],
    ) -> StorageResult<()> {
        if begin > end || end > self.len {
            return Err(StorageError::out_of_bounds(end, self.len));
        }
        let new_len = self.len - (end - begin) + data.len();
        let needed = node_len(WidthType::Ignore, new_len, 0);
        if needed > MAX_NODE_SIZE {
            return Err(StorageError::NodeTooLarge {
                size: needed,
                max: MAX_NODE_SIZE,
            });
        }
        if alloc.is_read_only(self.ref_) || needed > self.capacity {
            let mut contents = self.bytes(alloc).to_vec();
            contents.splice(begin..end, data.iter().copied());
            let capacity = needed.max((self.capacity * 2).min(MAX_NODE_SIZE)) & !7;
            let old = self.ref_;
            let mem = alloc.alloc(capacity)?;
            NodeHeader::blob(capacity, new_len).write(mem.addr);
            mem.addr[NODE_HEADER_SIZE..NODE_HEADER_SIZE + new_len].copy_from_slice(&contents);
            self.ref_ = mem.ref_;
            self.capacity = capacity;
            self.len = new_len;
            return alloc.free_(old);
        }
        let old_len = self.len;
        let bytes = &mut alloc.translate_mut(self.ref_)?[NODE_HEADER_SIZE..];
        bytes.copy_within(end..old_len, begin + data.len());
        bytes[begin..begin + data.len()].copy_from_slice(data);
        NodeHeader::blob(self.capacity, new_len).write(&mut alloc.translate_mut(self.ref_)?[..]);
        self.len = new_len;
        Ok(())
    }

    /// Appends `data`.
    pub fn append(&mut self, alloc: &mut SlabAlloc, data: &[u8]) -> StorageResult<()> {
        self.replace(alloc, self.len, self.len, data)
    }

    /// Frees the node.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> StorageResult<()> {
        alloc.free_(self.ref_)
    }
}
