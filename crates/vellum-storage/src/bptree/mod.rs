//! Generic B+Tree over packed leaves.
//!
//! A [`BPlusTree<T>`] is an ordered sequence addressed by position. The
//! root is either a single leaf or an inner node whose offsets array holds
//! the cumulative end index of every child subtree. Inserts split a full
//! node at the insertion point; erases remove empty nodes, merge
//! underflowing siblings and collapse a root left with a single child.
//!
//! Point operations are O(log n); sequential reads hit a single-leaf cache
//! and are O(1) amortized.

mod inner;
pub mod leaf;
pub mod mixed_leaf;
pub mod string_leaf;

use std::cell::Cell;
use std::marker::PhantomData;

use tracing::trace;
use vellum_common::constants::{DEFAULT_MAX_INNER_SIZE, DEFAULT_MAX_LEAF_SIZE};
use vellum_common::types::{Mixed, Ref};

use crate::alloc::SlabAlloc;
use crate::array::destroy_deep;
use crate::error::{StorageError, StorageResult};

use inner::{is_inner, InnerNode};

pub use leaf::{AggregateKind, IntLeaf, IntLike, Leaf, NullableLeaf, TreeValue};
pub use mixed_leaf::MixedLeaf;
pub use string_leaf::{BytesLike, StringLeaf};

/// Result of a traversal callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorControl {
    /// Visit the next leaf.
    Continue,
    /// End the traversal.
    Stop,
}

/// Fan-out limits of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    /// Maximum elements per leaf.
    pub max_leaf_size: usize,
    /// Maximum children per inner node.
    pub max_inner_size: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_leaf_size: DEFAULT_MAX_LEAF_SIZE,
            max_inner_size: DEFAULT_MAX_INNER_SIZE,
        }
    }
}

impl TreeConfig {
    /// Creates limits with the given fan-out.
    #[must_use]
    pub fn new(max_leaf_size: usize, max_inner_size: usize) -> Self {
        Self {
            max_leaf_size: max_leaf_size.max(2),
            max_inner_size: max_inner_size.max(2),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LeafCache {
    begin: usize,
    end: usize,
    leaf: Ref,
}

struct Split {
    left_size: usize,
    right: Ref,
    right_size: usize,
}

/// An ordered sequence of `T` stored as a B+Tree.
///
/// The accessor holds the root ref. Mutations may move the root; owners
/// read [`ref_`](Self::ref_) afterwards and store it in their parent slot.
pub struct BPlusTree<T: TreeValue> {
    root: Ref,
    config: TreeConfig,
    cache: Cell<Option<LeafCache>>,
    _marker: PhantomData<T>,
}

impl<T: TreeValue> std::fmt::Debug for BPlusTree<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BPlusTree")
            .field("root", &self.root)
            .field("type", &T::type_name())
            .finish()
    }
}

impl<T: TreeValue> BPlusTree<T> {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Allocates an empty tree.
    pub fn create(alloc: &mut SlabAlloc, config: TreeConfig) -> StorageResult<Self> {
        let leaf = T::Leaf::create(alloc)?;
        Ok(Self::with_root(leaf.ref_(), config))
    }

    /// Attaches to the tree rooted at `r`.
    pub fn init_from_ref(alloc: &SlabAlloc, r: Ref, config: TreeConfig) -> StorageResult<Self> {
        if r.is_null() {
            return Err(StorageError::InvalidRef(r));
        }
        if !is_inner(alloc, r)? {
            T::Leaf::init_from_ref(alloc, r)?;
        }
        Ok(Self::with_root(r, config))
    }

    fn with_root(root: Ref, config: TreeConfig) -> Self {
        Self {
            root,
            config,
            cache: Cell::new(None),
            _marker: PhantomData,
        }
    }

    /// Ref of the root node.
    #[must_use]
    pub fn ref_(&self) -> Ref {
        self.root
    }

    fn invalidate(&self) {
        self.cache.set(None);
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Number of elements.
    pub fn size(&self, alloc: &SlabAlloc) -> StorageResult<usize> {
        node_size::<T>(alloc, self.root)
    }

    /// Returns true if the tree has no elements.
    pub fn is_empty(&self, alloc: &SlabAlloc) -> StorageResult<bool> {
        Ok(self.size(alloc)? == 0)
    }

    fn find_leaf(&self, alloc: &SlabAlloc, ndx: usize) -> StorageResult<LeafCache> {
        if let Some(c) = self.cache.get() {
            if ndx >= c.begin && ndx < c.end {
                return Ok(c);
            }
        }
        let mut r = self.root;
        let mut begin = 0;
        let mut local = ndx;
        while is_inner(alloc, r)? {
            let inner = InnerNode::init_from_ref(alloc, r)?;
            if local >= inner.total(alloc) {
                return Err(StorageError::out_of_bounds(ndx, begin + inner.total(alloc)));
            }
            let (i, child_begin) = inner.find_child(alloc, local);
            r = inner.child_ref(alloc, i);
            begin += child_begin;
            local -= child_begin;
        }
        let size = T::Leaf::init_from_ref(alloc, r)?.size();
        if local >= size {
            return Err(StorageError::out_of_bounds(ndx, begin + size));
        }
        let found = LeafCache {
            begin,
            end: begin + size,
            leaf: r,
        };
        self.cache.set(Some(found));
        Ok(found)
    }

    /// Reads element `ndx`.
    pub fn get(&self, alloc: &SlabAlloc, ndx: usize) -> StorageResult<T> {
        let c = self.find_leaf(alloc, ndx)?;
        let leaf = T::Leaf::init_from_ref(alloc, c.leaf)?;
        Ok(leaf.get(alloc, ndx - c.begin))
    }

    /// Reads every element in order.
    pub fn get_all(&self, alloc: &SlabAlloc) -> StorageResult<Vec<T>> {
        let mut out = Vec::new();
        self.traverse(alloc, |leaf, _| {
            out.extend((0..leaf.size()).map(|i| leaf.get(alloc, i)));
            IteratorControl::Continue
        })?;
        Ok(out)
    }

    /// Visits every leaf in order with the index of its first element.
    /// Returns false if the callback stopped the traversal.
    pub fn traverse<F>(&self, alloc: &SlabAlloc, mut f: F) -> StorageResult<bool>
    where
        F: FnMut(&T::Leaf, usize) -> IteratorControl,
    {
        Ok(traverse_node::<T, F>(alloc, self.root, 0, &mut f)? == IteratorControl::Continue)
    }

    /// Calls `f` with every index and element.
    pub fn for_each<F>(&self, alloc: &SlabAlloc, mut f: F) -> StorageResult<()>
    where
        F: FnMut(usize, T),
    {
        self.traverse(alloc, |leaf, offset| {
            for i in 0..leaf.size() {
                f(offset + i, leaf.get(alloc, i));
            }
            IteratorControl::Continue
        })?;
        Ok(())
    }

    /// Index of the first element equal to `value`.
    pub fn find_first(&self, alloc: &SlabAlloc, value: &T) -> StorageResult<Option<usize>> {
        let mut found = None;
        self.traverse(alloc, |leaf, offset| {
            match (0..leaf.size()).find(|&i| leaf.get(alloc, i) == *value) {
                Some(i) => {
                    found = Some(offset + i);
                    IteratorControl::Stop
                }
                None => IteratorControl::Continue,
            }
        })?;
        Ok(found)
    }

    /// Indices of every element equal to `value`.
    pub fn find_all(&self, alloc: &SlabAlloc, value: &T) -> StorageResult<Vec<usize>> {
        let mut found = Vec::new();
        self.traverse(alloc, |leaf, offset| {
            found.extend(
                (0..leaf.size())
                    .filter(|&i| leaf.get(alloc, i) == *value)
                    .map(|i| offset + i),
            );
            IteratorControl::Continue
        })?;
        Ok(found)
    }

    // =========================================================================
    // Aggregates
    // =========================================================================

    fn numeric_values(&self, alloc: &SlabAlloc) -> StorageResult<Option<Vec<Mixed>>> {
        if T::AGGREGATE == AggregateKind::Unsupported {
            return Ok(None);
        }
        let mut values = Vec::new();
        self.for_each(alloc, |_, v| {
            let m = v.to_mixed();
            if matches!(m, Mixed::Int(_) | Mixed::Double(_)) {
                values.push(m);
            }
        })?;
        Ok(Some(values))
    }

    /// Sum of the non-null elements, or `None` if the type has no sum.
    pub fn sum(&self, alloc: &SlabAlloc) -> StorageResult<Option<Mixed>> {
        let Some(values) = self.numeric_values(alloc)? else {
            return Ok(None);
        };
        let has_double = T::AGGREGATE == AggregateKind::Double
            || values.iter().any(|v| matches!(v, Mixed::Double(_)));
        if has_double {
            let total: f64 = values.iter().filter_map(Mixed::as_double).sum();
            return Ok(Some(Mixed::Double(total)));
        }
        let total = values
            .iter()
            .filter_map(Mixed::as_int)
            .fold(0i64, i64::wrapping_add);
        Ok(Some(Mixed::Int(total)))
    }

    /// Smallest non-null element, `Mixed::Null` if there is none.
    pub fn min(&self, alloc: &SlabAlloc) -> StorageResult<Option<Mixed>> {
        Ok(self.numeric_values(alloc)?.map(|values| {
            values
                .into_iter()
                .min_by(Mixed::compare)
                .unwrap_or(Mixed::Null)
        }))
    }

    /// Largest non-null element, `Mixed::Null` if there is none.
    pub fn max(&self, alloc: &SlabAlloc) -> StorageResult<Option<Mixed>> {
        Ok(self.numeric_values(alloc)?.map(|values| {
            values
                .into_iter()
                .max_by(Mixed::compare)
                .unwrap_or(Mixed::Null)
        }))
    }

    /// Mean of the non-null elements, `Mixed::Null` if there is none.
    pub fn avg(&self, alloc: &SlabAlloc) -> StorageResult<Option<Mixed>> {
        Ok(self.numeric_values(alloc)?.map(|values| {
            if values.is_empty() {
                return Mixed::Null;
            }
            let total: f64 = values.iter().filter_map(Mixed::as_double).sum();
            Mixed::Double(total / values.len() as f64)
        }))
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Overwrites element `ndx`.
    pub fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &T) -> StorageResult<()> {
        let size = self.size(alloc)?;
        if ndx >= size {
            return Err(StorageError::out_of_bounds(ndx, size));
        }
        self.invalidate();
        self.root = self.set_rec(alloc, self.root, ndx, value)?;
        Ok(())
    }

    fn set_rec(&self, alloc: &mut SlabAlloc, r: Ref, ndx: usize, value: &T) -> StorageResult<Ref> {
        if !is_inner(alloc, r)? {
            let mut leaf = T::Leaf::init_from_ref(alloc, r)?;
            leaf.set(alloc, ndx, value)?;
            return Ok(leaf.ref_());
        }
        let mut inner = InnerNode::init_from_ref(alloc, r)?;
        let (i, begin) = inner.find_child(alloc, ndx);
        let child = inner.child_ref(alloc, i);
        let new_child = self.set_rec(alloc, child, ndx - begin, value)?;
        inner.set_child_ref(alloc, i, new_child)?;
        Ok(inner.ref_())
    }

    /// Inserts `value` before element `ndx`.
    pub fn insert(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &T) -> StorageResult<()> {
        let size = self.size(alloc)?;
        if ndx > size {
            return Err(StorageError::out_of_bounds(ndx, size));
        }
        self.invalidate();
        let (new_root, split) = self.insert_rec(alloc, self.root, ndx, value)?;
        self.root = match split {
            None => new_root,
            Some(s) => {
                let mut inner = InnerNode::create(alloc)?;
                inner.append_child(alloc, new_root, s.left_size)?;
                inner.append_child(alloc, s.right, s.right_size)?;
                trace!(size = size + 1, "b+tree root split");
                inner.ref_()
            }
        };
        Ok(())
    }

    /// Appends `value`.
    pub fn add(&mut self, alloc: &mut SlabAlloc, value: &T) -> StorageResult<()> {
        let size = self.size(alloc)?;
        self.insert(alloc, size, value)
    }

    fn insert_rec(
        &self,
        alloc: &mut SlabAlloc,
        r: Ref,
        ndx: usize,
        value: &T,
    ) -> StorageResult<(Ref, Option<Split>)> {
        if !is_inner(alloc, r)? {
            let mut leaf = T::Leaf::init_from_ref(alloc, r)?;
            if leaf.size() < self.config.max_leaf_size {
                leaf.insert(alloc, ndx, value)?;
                return Ok((leaf.ref_(), None));
            }
            let mut right = T::Leaf::create(alloc)?;
            if ndx == leaf.size() {
                right.insert(alloc, 0, value)?;
            } else {
                leaf.move_tail(alloc, ndx, &mut right)?;
                leaf.insert(alloc, ndx, value)?;
            }
            let split = Split {
                left_size: leaf.size(),
                right: right.ref_(),
                right_size: right.size(),
            };
            return Ok((leaf.ref_(), Some(split)));
        }

        let mut inner = InnerNode::init_from_ref(alloc, r)?;
        let (i, begin) = inner.find_child(alloc, ndx);
        let child = inner.child_ref(alloc, i);
        let (new_child, split) = self.insert_rec(alloc, child, ndx - begin, value)?;
        inner.set_child_ref(alloc, i, new_child)?;
        match split {
            None => inner.adjust_from(alloc, i, 1)?,
            Some(s) => {
                inner.set_child_end(alloc, i, begin + s.left_size)?;
                inner.insert_child(alloc, i + 1, s.right, begin + s.left_size + s.right_size)?;
                inner.adjust_from(alloc, i + 2, 1)?;
            }
        }
        if inner.child_count() <= self.config.max_inner_size {
            return Ok((inner.ref_(), None));
        }
        let mid = inner.child_count() / 2;
        let right = inner.split_off(alloc, mid)?;
        let split = Split {
            left_size: inner.total(alloc),
            right: right.ref_(),
            right_size: right.total(alloc),
        };
        Ok((inner.ref_(), Some(split)))
    }

    /// Removes element `ndx`.
    pub fn erase(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> StorageResult<()> {
        let size = self.size(alloc)?;
        if ndx >= size {
            return Err(StorageError::out_of_bounds(ndx, size));
        }
        self.invalidate();
        let (mut root, _) = self.erase_rec(alloc, self.root, ndx)?;
        while is_inner(alloc, root)? {
            let inner = InnerNode::init_from_ref(alloc, root)?;
            match inner.child_count() {
                0 => {
                    inner.destroy_shallow(alloc)?;
                    root = T::Leaf::create(alloc)?.ref_();
                }
                1 => {
                    let child = inner.child_ref(alloc, 0);
                    inner.destroy_shallow(alloc)?;
                    trace!("b+tree root collapsed");
                    root = child;
                }
                _ => break,
            }
        }
        self.root = root;
        Ok(())
    }

    fn erase_rec(&self, alloc: &mut SlabAlloc, r: Ref, ndx: usize) -> StorageResult<(Ref, usize)> {
        if !is_inner(alloc, r)? {
            let mut leaf = T::Leaf::init_from_ref(alloc, r)?;
            leaf.erase(alloc, ndx)?;
            return Ok((leaf.ref_(), leaf.size()));
        }
        let mut inner = InnerNode::init_from_ref(alloc, r)?;
        let (i, begin) = inner.find_child(alloc, ndx);
        let child = inner.child_ref(alloc, i);
        let (new_child, child_size) = self.erase_rec(alloc, child, ndx - begin)?;
        inner.set_child_ref(alloc, i, new_child)?;
        inner.adjust_from(alloc, i, -1)?;
        if child_size == 0 {
            inner.remove_child(alloc, i)?;
            destroy_deep(alloc, new_child)?;
        } else {
            self.try_merge(alloc, &mut inner, i)?;
        }
        let total = inner.total(alloc);
        Ok((inner.ref_(), total))
    }

    /// Merges child `i` with a neighbour when it has underflowed and both
    /// fit in one node.
    fn try_merge(&self, alloc: &mut SlabAlloc, inner: &mut InnerNode, i: usize) -> StorageResult<()> {
        let n = inner.child_count();
        if n < 2 {
            return Ok(());
        }
        let child = inner.child_ref(alloc, i);
        let child_is_inner = is_inner(alloc, child)?;
        let (limit, fill) = if child_is_inner {
            let size = InnerNode::init_from_ref(alloc, child)?.child_count();
            (self.config.max_inner_size, size)
        } else {
            let size = inner.child_end(alloc, i) - inner.child_begin(alloc, i);
            (self.config.max_leaf_size, size)
        };
        if fill * 2 >= limit {
            return Ok(());
        }
        let left = if i + 1 < n { i } else { i - 1 };
        let left_ref = inner.child_ref(alloc, left);
        let right_ref = inner.child_ref(alloc, left + 1);
        if child_is_inner {
            let mut l = InnerNode::init_from_ref(alloc, left_ref)?;
            let r = InnerNode::init_from_ref(alloc, right_ref)?;
            if l.child_count() + r.child_count() > limit {
                return Ok(());
            }
            l.absorb(alloc, r)?;
            inner.set_child_ref(alloc, left, l.ref_())?;
        } else {
            let mut l = T::Leaf::init_from_ref(alloc, left_ref)?;
            let mut r = T::Leaf::init_from_ref(alloc, right_ref)?;
            if l.size() + r.size() > limit {
                return Ok(());
            }
            r.move_tail(alloc, 0, &mut l)?;
            r.destroy(alloc)?;
            inner.set_child_ref(alloc, left, l.ref_())?;
        }
        inner.merge_children(alloc, left)
    }

    /// Swaps elements `a` and `b`.
    pub fn swap(&mut self, alloc: &mut SlabAlloc, a: usize, b: usize) -> StorageResult<()> {
        if a == b {
            return Ok(());
        }
        let va = self.get(alloc, a)?;
        let vb = self.get(alloc, b)?;
        self.set(alloc, a, &vb)?;
        self.set(alloc, b, &va)
    }

    /// Moves element `from` so that it ends up at index `to`.
    pub fn move_element(&mut self, alloc: &mut SlabAlloc, from: usize, to: usize) -> StorageResult<()> {
        if from == to {
            return Ok(());
        }
        let v = self.get(alloc, from)?;
        self.erase(alloc, from)?;
        self.insert(alloc, to, &v)
    }

    /// Removes every element.
    pub fn clear(&mut self, alloc: &mut SlabAlloc) -> StorageResult<()> {
        self.invalidate();
        destroy_deep(alloc, self.root)?;
        self.root = T::Leaf::create(alloc)?.ref_();
        Ok(())
    }

    /// Frees the whole tree.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> StorageResult<()> {
        destroy_deep(alloc, self.root)
    }

    /// Checks the structural invariants and returns the element count.
    pub fn verify(&self, alloc: &SlabAlloc) -> StorageResult<usize> {
        verify_node::<T>(alloc, self.root)
    }
}

fn node_size<T: TreeValue>(alloc: &SlabAlloc, r: Ref) -> StorageResult<usize> {
    if is_inner(alloc, r)? {
        Ok(InnerNode::init_from_ref(alloc, r)?.total(alloc))
    } else {
        Ok(T::Leaf::init_from_ref(alloc, r)?.size())
    }
}

fn traverse_node<T, F>(
    alloc: &SlabAlloc,
    r: Ref,
    offset: usize,
    f: &mut F,
) -> StorageResult<IteratorControl>
where
    T: TreeValue,
    F: FnMut(&T::Leaf, usize) -> IteratorControl,
{
    if !is_inner(alloc, r)? {
        let leaf = T::Leaf::init_from_ref(alloc, r)?;
        return Ok(f(&leaf, offset));
    }
    let inner = InnerNode::init_from_ref(alloc, r)?;
    for i in 0..inner.child_count() {
        let begin = inner.child_begin(alloc, i);
        let child = inner.child_ref(alloc, i);
        if traverse_node::<T, F>(alloc, child, offset + begin, f)? == IteratorControl::Stop {
            return Ok(IteratorControl::Stop);
        }
    }
    Ok(IteratorControl::Continue)
}

fn verify_node<T: TreeValue>(alloc: &SlabAlloc, r: Ref) -> StorageResult<usize> {
    if !is_inner(alloc, r)? {
        return Ok(T::Leaf::init_from_ref(alloc, r)?.size());
    }
    let inner = InnerNode::init_from_ref(alloc, r)?;
    if inner.child_count() == 0 {
        return Err(StorageError::corrupted(r, "inner node without children"));
    }
    let mut prev = 0;
    for i in 0..inner.child_count() {
        let end = inner.child_end(alloc, i);
        if end <= prev {
            return Err(StorageError::corrupted(r, "offsets not increasing"));
        }
        let size = verify_node::<T>(alloc, inner.child_ref(alloc, i))?;
        if size != end - prev {
            return Err(StorageError::corrupted(r, "child size disagrees with offsets"));
        }
        prev = end;
    }
    if inner.total(alloc) != prev {
        return Err(StorageError::corrupted(r, "total disagrees with offsets"));
    }
    Ok(prev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn small() -> TreeConfig {
        TreeConfig::new(4, 4)
    }

    #[test]
    fn test_insert_and_get_across_splits() {
        let mut alloc = SlabAlloc::new_writable();
        let mut tree = BPlusTree::<i64>::create(&mut alloc, small()).unwrap();
        for v in 0..100 {
            tree.add(&mut alloc, &v).unwrap();
        }
        tree.insert(&mut alloc, 0, &-1).unwrap();
        tree.insert(&mut alloc, 50, &1000).unwrap();
        assert_eq!(tree.verify(&alloc).unwrap(), 102);
        assert_eq!(tree.get(&alloc, 0).unwrap(), -1);
        assert_eq!(tree.get(&alloc, 50).unwrap(), 1000);
        assert_eq!(tree.get(&alloc, 51).unwrap(), 49);
        assert_eq!(tree.get(&alloc, 101).unwrap(), 99);
        assert!(tree.get(&alloc, 102).is_err());
    }

    #[test]
    fn test_random_insert_erase_matches_vec() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut alloc = SlabAlloc::new_writable();
        let mut tree = BPlusTree::<i64>::create(&mut alloc, small()).unwrap();
        let mut model: Vec<i64> = Vec::new();
        for step in 0..2000 {
            let erase = !model.is_empty() && rng.gen_bool(0.45);
            if erase {
                let ndx = rng.gen_range(0..model.len());
                model.remove(ndx);
                tree.erase(&mut alloc, ndx).unwrap();
            } else {
                let ndx = rng.gen_range(0..=model.len());
                let v = rng.gen_range(-1000..1000);
                model.insert(ndx, v);
                tree.insert(&mut alloc, ndx, &v).unwrap();
            }
            if step % 97 == 0 {
                assert_eq!(tree.verify(&alloc).unwrap(), model.len());
            }
        }
        assert_eq!(tree.size(&alloc).unwrap(), model.len());
        assert_eq!(tree.get_all(&alloc).unwrap(), model);
        for (i, v) in model.iter().enumerate() {
            assert_eq!(tree.get(&alloc, i).unwrap(), *v);
        }
    }

    #[test]
    fn test_erase_all_collapses_root() {
        let mut alloc = SlabAlloc::new_writable();
        let mut tree = BPlusTree::<String>::create(&mut alloc, small()).unwrap();
        for i in 0..40 {
            tree.add(&mut alloc, &format!("s{}", i)).unwrap();
        }
        for _ in 0..40 {
            tree.erase(&mut alloc, 0).unwrap();
        }
        assert!(tree.is_empty(&alloc).unwrap());
        assert!(!is_inner(&alloc, tree.ref_()).unwrap());
        tree.add(&mut alloc, &"again".to_string()).unwrap();
        assert_eq!(tree.get(&alloc, 0).unwrap(), "again");
    }

    #[test]
    fn test_find_and_traverse_stop() {
        let mut alloc = SlabAlloc::new_writable();
        let mut tree = BPlusTree::<Option<i64>>::create(&mut alloc, small()).unwrap();
        for i in 0..20 {
            let v = if i % 5 == 0 { None } else { Some(i % 3) };
            tree.add(&mut alloc, &v).unwrap();
        }
        assert_eq!(tree.find_first(&alloc, &Some(2)).unwrap(), Some(2));
        assert_eq!(tree.find_all(&alloc, &None).unwrap(), vec![0, 5, 10, 15]);
        assert_eq!(tree.find_first(&alloc, &Some(7)).unwrap(), None);

        let mut leaves = 0;
        let completed = tree
            .traverse(&alloc, |_, _| {
                leaves += 1;
                IteratorControl::Stop
            })
            .unwrap();
        assert!(!completed);
        assert_eq!(leaves, 1);
    }

    #[test]
    fn test_aggregates() {
        let mut alloc = SlabAlloc::new_writable();
        let mut ints = BPlusTree::<Option<i64>>::create(&mut alloc, small()).unwrap();
        assert_eq!(ints.sum(&alloc).unwrap(), Some(Mixed::Int(0)));
        assert_eq!(ints.min(&alloc).unwrap(), Some(Mixed::Null));
        for v in [Some(4), None, Some(-2), Some(10)] {
            ints.add(&mut alloc, &v).unwrap();
        }
        assert_eq!(ints.sum(&alloc).unwrap(), Some(Mixed::Int(12)));
        assert_eq!(ints.min(&alloc).unwrap(), Some(Mixed::Int(-2)));
        assert_eq!(ints.max(&alloc).unwrap(), Some(Mixed::Int(10)));
        assert_eq!(ints.avg(&alloc).unwrap(), Some(Mixed::Double(4.0)));

        let mut strings = BPlusTree::<String>::create(&mut alloc, small()).unwrap();
        strings.add(&mut alloc, &"x".to_string()).unwrap();
        assert_eq!(strings.sum(&alloc).unwrap(), None);

        let mut mixed = BPlusTree::<Mixed>::create(&mut alloc, small()).unwrap();
        for v in [Mixed::Int(1), Mixed::String("a".into()), Mixed::Double(0.5)] {
            mixed.add(&mut alloc, &v).unwrap();
        }
        assert_eq!(mixed.sum(&alloc).unwrap(), Some(Mixed::Double(1.5)));
        assert_eq!(mixed.max(&alloc).unwrap(), Some(Mixed::Int(1)));
    }

    #[test]
    fn test_swap_and_move_strings_in_one_leaf() {
        let mut alloc = SlabAlloc::new_writable();
        let mut tree = BPlusTree::<String>::create(&mut alloc, TreeConfig::default()).unwrap();
        for s in ["short", "a much longer string", "mid"] {
            tree.add(&mut alloc, &s.to_string()).unwrap();
        }
        tree.swap(&mut alloc, 0, 1).unwrap();
        tree.move_element(&mut alloc, 2, 0).unwrap();
        assert_eq!(
            tree.get_all(&alloc).unwrap(),
            vec!["mid", "a much longer string", "short"]
        );
    }

    #[test]
    fn test_clear_after_deep_write() {
        use crate::array::tests::MemWriter;
        use crate::array::write_node;

        let mut alloc = SlabAlloc::new_writable();
        let mut tree = BPlusTree::<i64>::create(&mut alloc, small()).unwrap();
        for v in 0..30 {
            tree.add(&mut alloc, &v).unwrap();
        }
        let mut out = MemWriter::default();
        write_node(&alloc, tree.ref_(), true, false, &mut out).unwrap();
        assert!(out.nodes.len() > 1);
        tree.clear(&mut alloc).unwrap();
        assert_eq!(tree.size(&alloc).unwrap(), 0);
        tree.verify(&alloc).unwrap();
    }
}
