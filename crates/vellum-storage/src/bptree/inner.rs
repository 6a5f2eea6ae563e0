//! Inner node bookkeeping.
//!
//! An inner node is an inner-flagged has-refs array laid out as
//! `[offsets, child_0, .., child_n-1, total]` where `offsets` is a plain
//! array holding the cumulative end index of every child and `total` is
//! the tagged element count of the whole subtree.

use vellum_common::types::Ref;

use crate::alloc::SlabAlloc;
use crate::array::{Array, ArrayType, RefOrTagged};
use crate::error::{StorageError, StorageResult};

#[derive(Debug)]
pub(crate) struct InnerNode {
    node: Array,
    offsets: Array,
}

impl InnerNode {
    pub(crate) fn create(alloc: &mut SlabAlloc) -> StorageResult<Self> {
        let offsets = Array::create_empty(alloc, ArrayType::Normal)?;
        let mut node = Array::create_empty(alloc, ArrayType::InnerBptreeNode)?;
        node.add(alloc, offsets.ref_().to_slot())?;
        node.add(alloc, RefOrTagged::make_tagged(0).to_slot())?;
        Ok(Self { node, offsets })
    }

    pub(crate) fn init_from_ref(alloc: &SlabAlloc, r: Ref) -> StorageResult<Self> {
        let node = Array::init_from_ref(alloc, r)?;
        if !node.is_inner_bptree_node() || node.size() < 2 {
            return Err(StorageError::corrupted(r, "not an inner node"));
        }
        let offsets = Array::init_from_ref(alloc, node.get_ref(alloc, 0))?;
        Ok(Self { node, offsets })
    }

    pub(crate) fn ref_(&self) -> Ref {
        self.node.ref_()
    }

    pub(crate) fn child_count(&self) -> usize {
        self.node.size() - 2
    }

    pub(crate) fn child_ref(&self, alloc: &SlabAlloc, i: usize) -> Ref {
        self.node.get_ref(alloc, i + 1)
    }

    pub(crate) fn total(&self, alloc: &SlabAlloc) -> usize {
        self.node
            .get_as_ref_or_tagged(alloc, self.node.size() - 1)
            .get_as_int() as usize
    }

    pub(crate) fn child_begin(&self, alloc: &SlabAlloc, i: usize) -> usize {
        if i == 0 {
            0
        } else {
            self.offsets.get(alloc, i - 1) as usize
        }
    }

    pub(crate) fn child_end(&self, alloc: &SlabAlloc, i: usize) -> usize {
        self.offsets.get(alloc, i) as usize
    }

    /// Child holding element `ndx`, with the child's first index. An index
    /// equal to the total maps to the last child.
    pub(crate) fn find_child(&self, alloc: &SlabAlloc, ndx: usize) -> (usize, usize) {
        let i = self
            .offsets
            .upper_bound(alloc, ndx as i64)
            .min(self.child_count().saturating_sub(1));
        (i, self.child_begin(alloc, i))
    }

    fn sync_offsets(&mut self, alloc: &mut SlabAlloc, before: Ref) -> StorageResult<()> {
        if self.offsets.ref_() != before {
            self.node.set_ref(alloc, 0, self.offsets.ref_())?;
        }
        Ok(())
    }

    fn set_total(&mut self, alloc: &mut SlabAlloc, total: usize) -> StorageResult<()> {
        let last = self.node.size() - 1;
        self.node
            .set_ref_or_tagged(alloc, last, RefOrTagged::make_tagged(total as u64))
    }

    pub(crate) fn set_child_ref(
        &mut self,
        alloc: &mut SlabAlloc,
        i: usize,
        r: Ref,
    ) -> StorageResult<()> {
        if self.child_ref(alloc, i) != r {
            self.node.set_ref(alloc, i + 1, r)?;
        }
        Ok(())
    }

    pub(crate) fn set_child_end(
        &mut self,
        alloc: &mut SlabAlloc,
        i: usize,
        end: usize,
    ) -> StorageResult<()> {
        let before = self.offsets.ref_();
        self.offsets.set(alloc, i, end as i64)?;
        self.sync_offsets(alloc, before)
    }

    /// Shifts the ends of children `[from, n)` and the total by `diff`.
    pub(crate) fn adjust_from(
        &mut self,
        alloc: &mut SlabAlloc,
        from: usize,
        diff: i64,
    ) -> StorageResult<()> {
        let before = self.offsets.ref_();
        let n = self.child_count();
        self.offsets.adjust(alloc, from, n, diff)?;
        self.sync_offsets(alloc, before)?;
        let total = (self.total(alloc) as i64 + diff) as usize;
        self.set_total(alloc, total)
    }

    /// Inserts a child at position `i` ending at `end`. Later ends and the
    /// total are left to the caller.
    pub(crate) fn insert_child(
        &mut self,
        alloc: &mut SlabAlloc,
        i: usize,
        r: Ref,
        end: usize,
    ) -> StorageResult<()> {
        let before = self.offsets.ref_();
        self.offsets.insert(alloc, i, end as i64)?;
        self.sync_offsets(alloc, before)?;
        self.node.insert(alloc, i + 1, r.to_slot())
    }

    /// Appends a child of `size` elements, growing the total.
    pub(crate) fn append_child(
        &mut self,
        alloc: &mut SlabAlloc,
        r: Ref,
        size: usize,
    ) -> StorageResult<()> {
        let total = self.total(alloc) + size;
        let n = self.child_count();
        self.insert_child(alloc, n, r, total)?;
        self.set_total(alloc, total)
    }

    /// Removes child `i` without destroying it, and drops its elements from
    /// the offsets and total.
    pub(crate) fn remove_child(&mut self, alloc: &mut SlabAlloc, i: usize) -> StorageResult<()> {
        let size = self.child_end(alloc, i) - self.child_begin(alloc, i);
        let before = self.offsets.ref_();
        self.offsets.erase(alloc, i)?;
        self.sync_offsets(alloc, before)?;
        self.node.erase(alloc, i + 1)?;
        if size > 0 {
            self.adjust_from(alloc, i, -(size as i64))?;
        }
        Ok(())
    }

    /// Merges child `i + 1` into child `i`'s offset range after its
    /// elements were moved there. The right child is not destroyed.
    pub(crate) fn merge_children(&mut self, alloc: &mut SlabAlloc, i: usize) -> StorageResult<()> {
        let end = self.child_end(alloc, i + 1);
        self.set_child_end(alloc, i, end)?;
        let before = self.offsets.ref_();
        self.offsets.erase(alloc, i + 1)?;
        self.sync_offsets(alloc, before)?;
        self.node.erase(alloc, i + 2)
    }

    /// Moves children `[from, n)` into a new inner node and returns it.
    pub(crate) fn split_off(&mut self, alloc: &mut SlabAlloc, from: usize) -> StorageResult<Self> {
        let mut right = Self::create(alloc)?;
        let base = self.child_begin(alloc, from);
        let total = self.total(alloc);
        for i in from..self.child_count() {
            let size = self.child_end(alloc, i) - self.child_begin(alloc, i);
            let child = self.child_ref(alloc, i);
            right.append_child(alloc, child, size)?;
        }
        let before = self.offsets.ref_();
        self.offsets.truncate(alloc, from)?;
        self.sync_offsets(alloc, before)?;
        let n = self.node.size();
        self.node.erase_range(alloc, from + 1, n - 1)?;
        self.set_total(alloc, base)?;
        debug_assert_eq!(right.total(alloc), total - base);
        Ok(right)
    }

    /// Appends every child of `other` and frees `other`'s own nodes.
    pub(crate) fn absorb(&mut self, alloc: &mut SlabAlloc, other: Self) -> StorageResult<()> {
        for i in 0..other.child_count() {
            let size = other.child_end(alloc, i) - other.child_begin(alloc, i);
            let child = other.child_ref(alloc, i);
            self.append_child(alloc, child, size)?;
        }
        other.destroy_shallow(alloc)
    }

    /// Frees the node and its offsets array, leaving children alone.
    pub(crate) fn destroy_shallow(self, alloc: &mut SlabAlloc) -> StorageResult<()> {
        self.offsets.destroy(alloc)?;
        self.node.destroy(alloc)
    }
}

/// Returns true if the node at `r` is an inner B+Tree node.
pub(crate) fn is_inner(alloc: &SlabAlloc, r: Ref) -> StorageResult<bool> {
    Ok(Array::init_from_ref(alloc, r)?.is_inner_bptree_node())
}
