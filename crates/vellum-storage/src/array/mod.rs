//! Packed, width-adaptive node storage.
//!
//! An [`Array`] is the physical representation of every leaf and inner
//! node. It stores up to 2^24 signed integers using the smallest width in
//! {0, 1, 2, 4, 8, 16, 32, 64} bits that fits all of them, widening
//! transparently when a larger value is stored.
//!
//! Arrays are accessed through lightweight accessors that hold the node's
//! ref and cached header fields. Every operation takes the allocator
//! explicitly. Mutating a committed (read-only) node copies it first, so
//! the node's ref may change; the owner of the accessor is responsible for
//! storing the new ref in the parent slot.

pub mod blob;
pub mod header;
pub mod width;
pub mod writer;

use vellum_common::constants::{MAX_NODE_SIZE, NODE_HEADER_SIZE};
use vellum_common::types::Ref;

use crate::alloc::SlabAlloc;
use crate::error::{StorageError, StorageResult};

pub use blob::ArrayBlob;
pub use header::{NodeHeader, WidthType};
pub use width::{bit_width, lbound_for_width, ubound_for_width, Getter};
pub use writer::ArrayWriter;

use header::node_len;
use width::{getter_for_width, setter_for_width};

/// Kind of node to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayType {
    /// Plain integers.
    Normal,
    /// Slots hold refs to owned subnodes or tagged integers.
    HasRefs,
    /// Inner B+Tree node; implies `HasRefs`.
    InnerBptreeNode,
}

/// A slot value of a has-refs node: a ref (even) or a tagged integer
/// (odd, value shifted left by one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefOrTagged {
    /// A ref to an owned node, or null.
    Ref(Ref),
    /// A plain value below 2^63.
    Tagged(u64),
}

impl RefOrTagged {
    /// Decodes a slot value.
    #[inline]
    #[must_use]
    pub fn from_slot(v: i64) -> Self {
        if v & 1 == 1 {
            Self::Tagged((v as u64) >> 1)
        } else {
            Self::Ref(Ref::from_slot(v))
        }
    }

    /// Wraps a plain value.
    #[inline]
    #[must_use]
    pub fn make_tagged(v: u64) -> Self {
        Self::Tagged(v)
    }

    /// Encodes as a slot value.
    #[inline]
    #[must_use]
    pub fn to_slot(self) -> i64 {
        match self {
            Self::Ref(r) => r.to_slot(),
            Self::Tagged(v) => ((v << 1) | 1) as i64,
        }
    }

    /// Returns the ref, or null for tagged values.
    #[must_use]
    pub fn get_as_ref(self) -> Ref {
        match self {
            Self::Ref(r) => r,
            Self::Tagged(_) => Ref::NULL,
        }
    }

    /// Returns the tagged value, or zero for refs.
    #[must_use]
    pub fn get_as_int(self) -> u64 {
        match self {
            Self::Ref(_) => 0,
            Self::Tagged(v) => v,
        }
    }
}

/// Accessor for one packed integer node.
#[derive(Clone, Copy)]
pub struct Array {
    ref_: Ref,
    size: usize,
    width: u8,
    capacity: usize,
    has_refs: bool,
    is_inner: bool,
    context_flag: bool,
    getter: Getter,
}

impl std::fmt::Debug for Array {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Array")
            .field("ref", &self.ref_)
            .field("size", &self.size)
            .field("width", &self.width)
            .field("has_refs", &self.has_refs)
            .field("inner", &self.is_inner)
            .finish()
    }
}

impl Array {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Allocates a node holding `size` copies of `value`.
    pub fn create(
        alloc: &mut SlabAlloc,
        ty: ArrayType,
        context_flag: bool,
        size: usize,
        value: i64,
    ) -> StorageResult<Self> {
        let width = bit_width(value);
        let len = node_len(WidthType::Bits, size, width);
        if len > MAX_NODE_SIZE {
            return Err(StorageError::NodeTooLarge {
                size: len,
                max: MAX_NODE_SIZE,
            });
        }
        let capacity = len.max(NODE_HEADER_SIZE + 8);
        let mem = alloc.alloc(capacity)?;
        let header = NodeHeader {
            capacity,
            is_inner_bptree: ty == ArrayType::InnerBptreeNode,
            has_refs: ty != ArrayType::Normal,
            context_flag,
            width_type: WidthType::Bits,
            width,
            size,
        };
        header.write(mem.addr);
        if value != 0 {
            let set = setter_for_width(width);
            let data = &mut mem.addr[NODE_HEADER_SIZE..];
            for i in 0..size {
                set(data, i, value);
            }
        }
        Ok(Self::from_header(mem.ref_, &header))
    }

    /// Allocates an empty node.
    pub fn create_empty(alloc: &mut SlabAlloc, ty: ArrayType) -> StorageResult<Self> {
        Self::create(alloc, ty, false, 0, 0)
    }

    /// Attaches an accessor to an existing node.
    pub fn init_from_ref(alloc: &SlabAlloc, r: Ref) -> StorageResult<Self> {
        let bytes = alloc.try_translate(r)?;
        let header =
            NodeHeader::parse(bytes).ok_or_else(|| StorageError::corrupted(r, "bad header"))?;
        if header.width_type != WidthType::Bits {
            return Err(StorageError::corrupted(r, "not an integer array"));
        }
        if NODE_HEADER_SIZE + header.payload_len() > header.capacity {
            return Err(StorageError::corrupted(r, "size exceeds capacity"));
        }
        Ok(Self::from_header(r, &header))
    }

    fn from_header(r: Ref, header: &NodeHeader) -> Self {
        Self {
            ref_: r,
            size: header.size,
            width: header.width,
            capacity: header.capacity,
            has_refs: header.has_refs,
            is_inner: header.is_inner_bptree,
            context_flag: header.context_flag,
            getter: getter_for_width(header.width),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Ref of the node.
    #[inline]
    #[must_use]
    pub fn ref_(&self) -> Ref {
        self.ref_
    }

    /// Number of elements.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns true if the node has no elements.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Current element width in bits.
    #[inline]
    #[must_use]
    pub fn width(&self) -> u8 {
        self.width
    }

    /// Returns true if even non-zero slots are owned refs.
    #[inline]
    #[must_use]
    pub fn has_refs(&self) -> bool {
        self.has_refs
    }

    /// Returns true for inner B+Tree nodes.
    #[inline]
    #[must_use]
    pub fn is_inner_bptree_node(&self) -> bool {
        self.is_inner
    }

    /// The owner-defined context flag.
    #[inline]
    #[must_use]
    pub fn context_flag(&self) -> bool {
        self.context_flag
    }

    /// Reads element `ndx`.
    #[inline]
    pub fn get(&self, alloc: &SlabAlloc, ndx: usize) -> i64 {
        debug_assert!(ndx < self.size, "index {} out of bounds ({})", ndx, self.size);
        (self.getter)(&alloc.translate(self.ref_)[NODE_HEADER_SIZE..], ndx)
    }

    /// Reads element `ndx` as a ref.
    #[inline]
    pub fn get_ref(&self, alloc: &SlabAlloc, ndx: usize) -> Ref {
        Ref::from_slot(self.get(alloc, ndx))
    }

    /// Reads element `ndx` as a ref-or-tagged slot.
    #[inline]
    pub fn get_as_ref_or_tagged(&self, alloc: &SlabAlloc, ndx: usize) -> RefOrTagged {
        RefOrTagged::from_slot(self.get(alloc, ndx))
    }

    /// Reads the last element.
    pub fn back(&self, alloc: &SlabAlloc) -> Option<i64> {
        (self.size > 0).then(|| self.get(alloc, self.size - 1))
    }

    /// Reads all elements.
    pub fn get_all(&self, alloc: &SlabAlloc) -> Vec<i64> {
        let data = &alloc.translate(self.ref_)[NODE_HEADER_SIZE..];
        (0..self.size).map(|i| (self.getter)(data, i)).collect()
    }

    /// Index of the first element equal to `value` in `[begin, end)`.
    pub fn find_first(
        &self,
        alloc: &SlabAlloc,
        value: i64,
        begin: usize,
        end: usize,
    ) -> Option<usize> {
        if value < lbound_for_width(self.width) || value > ubound_for_width(self.width) {
            return None;
        }
        let data = &alloc.translate(self.ref_)[NODE_HEADER_SIZE..];
        (begin..end.min(self.size)).find(|&i| (self.getter)(data, i) == value)
    }

    /// First index whose element is not less than `value`, assuming the
    /// elements are sorted.
    pub fn lower_bound(&self, alloc: &SlabAlloc, value: i64) -> usize {
        let data = &alloc.translate(self.ref_)[NODE_HEADER_SIZE..];
        let (mut lo, mut hi) = (0, self.size);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if (self.getter)(data, mid) < value {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// First index whose element is greater than `value`, assuming the
    /// elements are sorted.
    pub fn upper_bound(&self, alloc: &SlabAlloc, value: i64) -> usize {
        let data = &alloc.translate(self.ref_)[NODE_HEADER_SIZE..];
        let (mut lo, mut hi) = (0, self.size);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if (self.getter)(data, mid) <= value {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Makes the node writable with room for `new_size` elements of at
    /// least `min_width` bits. May move the node.
    fn prepare(
        &mut self,
        alloc: &mut SlabAlloc,
        new_size: usize,
        min_width: u8,
    ) -> StorageResult<()> {
        let width = self.width.max(min_width);
        let needed = node_len(WidthType::Bits, new_size.max(self.size), width);
        if needed > MAX_NODE_SIZE {
            return Err(StorageError::NodeTooLarge {
                size: needed,
                max: MAX_NODE_SIZE,
            });
        }
        let read_only = alloc.is_read_only(self.ref_);
        if read_only || needed > self.capacity {
            let grown = if read_only {
                needed.max(self.capacity)
            } else {
                needed.max(self.capacity * 2)
            };
            let new_capacity = grown.min(MAX_NODE_SIZE) & !7;
            let mem = alloc.realloc_(self.ref_, self.capacity, new_capacity)?;
            header::set_capacity(mem.addr, new_capacity);
            self.ref_ = mem.ref_;
            self.capacity = new_capacity;
        }
        if width > self.width {
            let get_old = self.getter;
            let set_new = setter_for_width(width);
            let data = &mut alloc.translate_mut(self.ref_)?[NODE_HEADER_SIZE..];
            for i in (0..self.size).rev() {
                let v = get_old(data, i);
                set_new(data, i, v);
            }
            self.width = width;
            self.getter = getter_for_width(width);
            self.write_header(alloc)?;
        }
        Ok(())
    }

    /// Widens the node so that `value` fits, copying it out of read-only
    /// memory first if needed.
    pub fn ensure_minimum_width(&mut self, alloc: &mut SlabAlloc, value: i64) -> StorageResult<()> {
        let width = bit_width(value);
        if width <= self.width && !alloc.is_read_only(self.ref_) {
            return Ok(());
        }
        self.prepare(alloc, self.size, width)
    }

    /// Copies a committed node into writable memory.
    pub fn copy_on_write(&mut self, alloc: &mut SlabAlloc) -> StorageResult<()> {
        if alloc.is_read_only(self.ref_) {
            self.prepare(alloc, self.size, 0)?;
        }
        Ok(())
    }

    fn write_header(&self, alloc: &mut SlabAlloc) -> StorageResult<()> {
        let header = NodeHeader {
            capacity: self.capacity,
            is_inner_bptree: self.is_inner,
            has_refs: self.has_refs,
            context_flag: self.context_flag,
            width_type: WidthType::Bits,
            width: self.width,
            size: self.size,
        };
        header.write(alloc.translate_mut(self.ref_)?);
        Ok(())
    }

    fn payload_mut<'a>(&self, alloc: &'a mut SlabAlloc) -> StorageResult<&'a mut [u8]> {
        Ok(&mut alloc.translate_mut(self.ref_)?[NODE_HEADER_SIZE..])
    }

    /// Overwrites element `ndx`.
    pub fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: i64) -> StorageResult<()> {
        if ndx >= self.size {
            return Err(StorageError::out_of_bounds(ndx, self.size));
        }
        self.prepare(alloc, self.size, bit_width(value))?;
        let set = setter_for_width(self.width);
        set(self.payload_mut(alloc)?, ndx, value);
        Ok(())
    }

    /// Overwrites element `ndx` with a ref.
    pub fn set_ref(&mut self, alloc: &mut SlabAlloc, ndx: usize, r: Ref) -> StorageResult<()> {
        self.set(alloc, ndx, r.to_slot())
    }

    /// Overwrites element `ndx` with a ref-or-tagged slot.
    pub fn set_ref_or_tagged(
        &mut self,
        alloc: &mut SlabAlloc,
        ndx: usize,
        value: RefOrTagged,
    ) -> StorageResult<()> {
        self.set(alloc, ndx, value.to_slot())
    }

    /// Inserts `value` before element `ndx`.
    pub fn insert(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: i64) -> StorageResult<()> {
        if ndx > self.size {
            return Err(StorageError::out_of_bounds(ndx, self.size));
        }
        self.prepare(alloc, self.size + 1, bit_width(value))?;
        let get = self.getter;
        let set = setter_for_width(self.width);
        let data = self.payload_mut(alloc)?;
        for i in (ndx..self.size).rev() {
            let v = get(data, i);
            set(data, i + 1, v);
        }
        set(data, ndx, value);
        self.size += 1;
        self.write_header(alloc)
    }

    /// Appends `value`.
    pub fn add(&mut self, alloc: &mut SlabAlloc, value: i64) -> StorageResult<()> {
        self.insert(alloc, self.size, value)
    }

    /// Removes element `ndx`. Owned subnodes are not destroyed.
    pub fn erase(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> StorageResult<()> {
        self.erase_range(alloc, ndx, ndx + 1)
    }

    /// Removes elements `[begin, end)`. Owned subnodes are not destroyed.
    pub fn erase_range(
        &mut self,
        alloc: &mut SlabAlloc,
        begin: usize,
        end: usize,
    ) -> StorageResult<()> {
        if begin > end || end > self.size {
            return Err(StorageError::out_of_bounds(end, self.size));
        }
        if begin == end {
            return Ok(());
        }
        self.prepare(alloc, self.size, 0)?;
        let get = self.getter;
        let set = setter_for_width(self.width);
        let count = end - begin;
        let data = self.payload_mut(alloc)?;
        for i in end..self.size {
            let v = get(data, i);
            set(data, i - count, v);
        }
        self.size -= count;
        self.write_header(alloc)
    }

    /// Shrinks to `new_size` elements. Owned subnodes past the end are
    /// not destroyed.
    pub fn truncate(&mut self, alloc: &mut SlabAlloc, new_size: usize) -> StorageResult<()> {
        if new_size > self.size {
            return Err(StorageError::out_of_bounds(new_size, self.size));
        }
        self.prepare(alloc, self.size, 0)?;
        self.size = new_size;
        if new_size == 0 {
            self.width = 0;
            self.getter = getter_for_width(0);
        }
        self.write_header(alloc)
    }

    /// Shrinks to `new_size` elements, destroying owned subnodes past the
    /// end.
    pub fn truncate_and_destroy_children(
        &mut self,
        alloc: &mut SlabAlloc,
        new_size: usize,
    ) -> StorageResult<()> {
        if self.has_refs {
            for i in new_size..self.size {
                let v = self.get(alloc, i);
                if v != 0 && v & 1 == 0 {
                    destroy_deep(alloc, Ref::from_slot(v))?;
                }
            }
        }
        self.truncate(alloc, new_size)
    }

    /// Removes all elements, destroying owned subnodes.
    pub fn clear(&mut self, alloc: &mut SlabAlloc) -> StorageResult<()> {
        self.truncate_and_destroy_children(alloc, 0)
    }

    /// Moves elements `[begin, size)` to the end of `dest`.
    pub fn move_tail(
        &mut self,
        alloc: &mut SlabAlloc,
        begin: usize,
        dest: &mut Array,
    ) -> StorageResult<()> {
        if begin > self.size {
            return Err(StorageError::out_of_bounds(begin, self.size));
        }
        let tail: Vec<i64> = (begin..self.size).map(|i| self.get(alloc, i)).collect();
        for v in tail {
            dest.add(alloc, v)?;
        }
        self.truncate(alloc, begin)
    }

    /// Adds `diff` to every element in `[begin, end)`.
    pub fn adjust(
        &mut self,
        alloc: &mut SlabAlloc,
        begin: usize,
        end: usize,
        diff: i64,
    ) -> StorageResult<()> {
        for i in begin..end.min(self.size) {
            let v = self.get(alloc, i);
            self.set(alloc, i, v + diff)?;
        }
        Ok(())
    }

    /// Changes the context flag.
    pub fn set_context_flag(&mut self, alloc: &mut SlabAlloc, flag: bool) -> StorageResult<()> {
        if self.context_flag == flag {
            return Ok(());
        }
        self.prepare(alloc, self.size, 0)?;
        self.context_flag = flag;
        self.write_header(alloc)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Frees this node only.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> StorageResult<()> {
        alloc.free_(self.ref_)
    }

    /// Frees this node and every subnode it owns.
    pub fn destroy_deep(self, alloc: &mut SlabAlloc) -> StorageResult<()> {
        destroy_deep(alloc, self.ref_)
    }

    /// Copies this node and every subnode it owns into writable memory.
    pub fn clone_deep(&self, alloc: &mut SlabAlloc) -> StorageResult<Ref> {
        clone_deep(alloc, self.ref_)
    }

    /// Serializes the node through `out`.
    ///
    /// With `only_if_modified`, committed nodes are not rewritten and keep
    /// their ref. With `deep`, owned subnodes are written first and the
    /// copy refers to their new refs.
    pub fn write(
        &self,
        alloc: &SlabAlloc,
        deep: bool,
        only_if_modified: bool,
        out: &mut dyn ArrayWriter,
    ) -> StorageResult<Ref> {
        write_node(alloc, self.ref_, deep, only_if_modified, out)
    }
}

/// Frees the node at `r` and every subnode it owns.
pub fn destroy_deep(alloc: &mut SlabAlloc, r: Ref) -> StorageResult<()> {
    if r.is_null() {
        return Ok(());
    }
    let children = owned_children(alloc, r)?;
    for child in children {
        destroy_deep(alloc, child)?;
    }
    alloc.free_(r)
}

fn owned_children(alloc: &SlabAlloc, r: Ref) -> StorageResult<Vec<Ref>> {
    let bytes = alloc.try_translate(r)?;
    let header = NodeHeader::parse(bytes).ok_or_else(|| StorageError::corrupted(r, "bad header"))?;
    if !header.has_refs || header.width_type != WidthType::Bits {
        return Ok(Vec::new());
    }
    let get = getter_for_width(header.width);
    let data = &bytes[NODE_HEADER_SIZE..];
    Ok((0..header.size)
        .map(|i| get(data, i))
        .filter(|v| *v != 0 && v & 1 == 0)
        .map(Ref::from_slot)
        .collect())
}

/// Copies the node at `r` and every subnode it owns.
pub fn clone_deep(alloc: &mut SlabAlloc, r: Ref) -> StorageResult<Ref> {
    let (bytes, header) = {
        let src = alloc.try_translate(r)?;
        let header =
            NodeHeader::parse(src).ok_or_else(|| StorageError::corrupted(r, "bad header"))?;
        let used = node_len(header.width_type, header.size, header.width);
        (src[..used].to_vec(), header)
    };
    let copy = {
        let mem = alloc.alloc(bytes.len())?;
        mem.addr.copy_from_slice(&bytes);
        header::set_capacity(mem.addr, bytes.len());
        mem.ref_
    };
    if header.has_refs && header.width_type == WidthType::Bits {
        let mut array = Array::init_from_ref(alloc, copy)?;
        for i in 0..array.size() {
            let v = array.get(alloc, i);
            if v != 0 && v & 1 == 0 {
                let child = clone_deep(alloc, Ref::from_slot(v))?;
                array.set_ref(alloc, i, child)?;
            }
        }
        return Ok(array.ref_());
    }
    Ok(copy)
}

/// Serializes the node at `r`; see [`Array::write`].
pub fn write_node(
    alloc: &SlabAlloc,
    r: Ref,
    deep: bool,
    only_if_modified: bool,
    out: &mut dyn ArrayWriter,
) -> StorageResult<Ref> {
    if only_if_modified && alloc.is_read_only(r) {
        return Ok(r);
    }
    let bytes = alloc.try_translate(r)?;
    let header = NodeHeader::parse(bytes).ok_or_else(|| StorageError::corrupted(r, "bad header"))?;
    let used = node_len(header.width_type, header.size, header.width);
    if !deep || !header.has_refs || header.width_type != WidthType::Bits {
        let mut copy = bytes[..used].to_vec();
        header::set_capacity(&mut copy, used);
        return out.write_array(&copy);
    }

    let get = getter_for_width(header.width);
    let data = &bytes[NODE_HEADER_SIZE..];
    let mut values = Vec::with_capacity(header.size);
    for i in 0..header.size {
        let v = get(data, i);
        if v != 0 && v & 1 == 0 {
            let child = write_node(alloc, Ref::from_slot(v), deep, only_if_modified, out)?;
            values.push(child.to_slot());
        } else {
            values.push(v);
        }
    }
    let width = values.iter().map(|v| bit_width(*v)).max().unwrap_or(0);
    let len = node_len(WidthType::Bits, values.len(), width);
    let mut copy = vec![0u8; len];
    NodeHeader {
        capacity: len,
        width,
        ..header
    }
    .write(&mut copy);
    let set = setter_for_width(width);
    for (i, v) in values.iter().enumerate() {
        set(&mut copy[NODE_HEADER_SIZE..], i, *v);
    }
    out.write_array(&copy)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Collects written nodes in memory, handing out fresh refs.
    #[derive(Default)]
    pub(crate) struct MemWriter {
        pub nodes: HashMap<Ref, Vec<u8>>,
        next: u64,
    }

    impl ArrayWriter for MemWriter {
        fn write_array(&mut self, data: &[u8]) -> StorageResult<Ref> {
            self.next += 1 << 20;
            let r = Ref::new(self.next);
            self.nodes.insert(r, data.to_vec());
            Ok(r)
        }
    }

    #[test]
    fn test_create_and_get() {
        let mut alloc = SlabAlloc::new_writable();
        let array = Array::create(&mut alloc, ArrayType::Normal, false, 5, 3).unwrap();
        assert_eq!(array.size(), 5);
        assert_eq!(array.width(), 2);
        assert_eq!(array.get_all(&alloc), vec![3; 5]);

        let again = Array::init_from_ref(&alloc, array.ref_()).unwrap();
        assert_eq!(again.size(), 5);
        assert_eq!(again.get(&alloc, 4), 3);
    }

    #[test]
    fn test_widening_preserves_values() {
        let mut alloc = SlabAlloc::new_writable();
        let mut array = Array::create_empty(&mut alloc, ArrayType::Normal).unwrap();
        let values = [0i64, 1, 3, 15, -1, 300, -70_000, i64::MAX, i64::MIN];
        for (i, v) in values.iter().enumerate() {
            array.add(&mut alloc, *v).unwrap();
            assert_eq!(array.get_all(&alloc), values[..=i].to_vec());
        }
        assert_eq!(array.width(), 64);
    }

    #[test]
    fn test_ensure_minimum_width() {
        let mut alloc = SlabAlloc::new_writable();
        let mut array = Array::create(&mut alloc, ArrayType::Normal, false, 3, 1).unwrap();
        let narrow = array.width();
        array.ensure_minimum_width(&mut alloc, 1).unwrap();
        assert_eq!(array.width(), narrow);

        array.ensure_minimum_width(&mut alloc, 70_000).unwrap();
        assert_eq!(array.width(), 32);
        assert_eq!(array.get_all(&alloc), vec![1, 1, 1]);
    }

    #[test]
    fn test_insert_erase() {
        let mut alloc = SlabAlloc::new_writable();
        let mut array = Array::create_empty(&mut alloc, ArrayType::Normal).unwrap();
        for v in 0..10 {
            array.add(&mut alloc, v).unwrap();
        }
        array.insert(&mut alloc, 0, 100).unwrap();
        array.erase(&mut alloc, 5).unwrap();
        array.erase_range(&mut alloc, 7, 9).unwrap();
        assert_eq!(array.get_all(&alloc), vec![100, 0, 1, 2, 3, 5, 6, 9]);
        assert_eq!(array.find_first(&alloc, 5, 0, array.size()), Some(5));
        assert_eq!(array.find_first(&alloc, 1000, 0, array.size()), None);
        assert!(array.insert(&mut alloc, 20, 1).is_err());
    }

    #[test]
    fn test_zero_length_roundtrip() {
        let mut alloc = SlabAlloc::new_writable();
        let array = Array::create_empty(&mut alloc, ArrayType::HasRefs).unwrap();
        let mut out = MemWriter::default();
        let written = array.write(&alloc, true, false, &mut out).unwrap();
        let node = &out.nodes[&written];
        let header = NodeHeader::parse(node).unwrap();
        assert_eq!(header.size, 0);
        assert!(header.has_refs);
        array.destroy_deep(&mut alloc).unwrap();
    }

    #[test]
    fn test_move_tail_and_truncate() {
        let mut alloc = SlabAlloc::new_writable();
        let mut a = Array::create_empty(&mut alloc, ArrayType::Normal).unwrap();
        let mut b = Array::create_empty(&mut alloc, ArrayType::Normal).unwrap();
        for v in 0..6 {
            a.add(&mut alloc, v * 10).unwrap();
        }
        a.move_tail(&mut alloc, 4, &mut b).unwrap();
        assert_eq!(a.get_all(&alloc), vec![0, 10, 20, 30]);
        assert_eq!(b.get_all(&alloc), vec![40, 50]);
        a.truncate(&mut alloc, 0).unwrap();
        assert_eq!(a.width(), 0);
    }

    #[test]
    fn test_ref_or_tagged() {
        let tagged = RefOrTagged::make_tagged(21);
        assert_eq!(tagged.to_slot(), 43);
        assert_eq!(RefOrTagged::from_slot(43), tagged);
        assert_eq!(RefOrTagged::from_slot(64).get_as_ref(), Ref::new(64));
        assert_eq!(RefOrTagged::from_slot(0), RefOrTagged::Ref(Ref::NULL));
    }

    #[test]
    fn test_lower_upper_bound() {
        let mut alloc = SlabAlloc::new_writable();
        let mut a = Array::create_empty(&mut alloc, ArrayType::Normal).unwrap();
        for v in [2, 4, 4, 8] {
            a.add(&mut alloc, v).unwrap();
        }
        assert_eq!(a.lower_bound(&alloc, 4), 1);
        assert_eq!(a.upper_bound(&alloc, 4), 3);
        assert_eq!(a.lower_bound(&alloc, 9), 4);
    }

    #[test]
    fn test_deep_write_rewrites_child_refs() {
        let mut alloc = SlabAlloc::new_writable();
        let child = Array::create(&mut alloc, ArrayType::Normal, false, 3, 7).unwrap();
        let mut parent = Array::create_empty(&mut alloc, ArrayType::HasRefs).unwrap();
        parent.add(&mut alloc, child.ref_().to_slot()).unwrap();
        parent
            .add(&mut alloc, RefOrTagged::make_tagged(5).to_slot())
            .unwrap();

        let mut out = MemWriter::default();
        let written = parent.write(&alloc, true, false, &mut out).unwrap();
        assert_eq!(out.nodes.len(), 2);
        let node = &out.nodes[&written];
        let header = NodeHeader::parse(node).unwrap();
        let get = getter_for_width(header.width);
        let child_ref = Ref::from_slot(get(&node[8..], 0));
        assert!(out.nodes.contains_key(&child_ref));
        assert_eq!(get(&node[8..], 1), 11);
    }

    #[test]
    fn test_unmodified_write_keeps_refs() {
        let mut alloc = SlabAlloc::new_writable();
        let child = Array::create(&mut alloc, ArrayType::Normal, false, 3, 7).unwrap();
        let mut parent = Array::create_empty(&mut alloc, ArrayType::HasRefs).unwrap();
        parent.add(&mut alloc, child.ref_().to_slot()).unwrap();

        let image = crate::alloc::FileImage::new();
        let mut writer = image.writer(0);
        let top = parent.write(&alloc, true, true, &mut writer).unwrap();
        let mapping = image.publish(writer.finish());

        let mut reader = SlabAlloc::default();
        reader.attach(mapping, false);
        let committed = Array::init_from_ref(&reader, top).unwrap();
        let mut out = MemWriter::default();
        assert_eq!(committed.write(&reader, true, true, &mut out).unwrap(), top);
        assert_eq!(committed.write(&reader, true, true, &mut out).unwrap(), top);
        assert!(out.nodes.is_empty());

        // a forced rewrite copies both nodes
        committed.write(&reader, true, false, &mut out).unwrap();
        assert_eq!(out.nodes.len(), 2);
    }

    #[test]
    fn test_clone_deep_is_independent() {
        let mut alloc = SlabAlloc::new_writable();
        let child = Array::create(&mut alloc, ArrayType::Normal, false, 2, 1).unwrap();
        let mut parent = Array::create_empty(&mut alloc, ArrayType::HasRefs).unwrap();
        parent.add(&mut alloc, child.ref_().to_slot()).unwrap();
        let r = parent.clone_deep(&mut alloc).unwrap();
        let copy = Array::init_from_ref(&alloc, r).unwrap();
        let copied_child = copy.get_ref(&alloc, 0);
        assert_ne!(copied_child, child.ref_());
        let mut original_child = child;
        original_child.set(&mut alloc, 0, 9).unwrap();
        let copied = Array::init_from_ref(&alloc, copied_child).unwrap();
        assert_eq!(copied.get_all(&alloc), vec![1, 1]);
    }
}
