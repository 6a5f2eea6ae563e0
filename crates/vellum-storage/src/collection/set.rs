//! Sorted sets.

use std::cmp::Ordering;

use vellum_common::types::{Mixed, Ref};

use super::hook::CollectionHook;
use crate::alloc::SlabAlloc;
use crate::bptree::{BPlusTree, TreeConfig, TreeValue};
use crate::error::{StorageError, StorageResult};

/// A set of `T` kept sorted by [`Mixed::compare`].
#[derive(Debug)]
pub struct SetCore<T: TreeValue> {
    tree: BPlusTree<T>,
    nullable: bool,
}

impl<T: TreeValue> SetCore<T> {
    /// Allocates an empty set.
    pub fn create(alloc: &mut SlabAlloc, config: TreeConfig, nullable: bool) -> StorageResult<Self> {
        Ok(Self {
            tree: BPlusTree::create(alloc, config)?,
            nullable,
        })
    }

    /// Attaches to the set rooted at `r`.
    pub fn init_from_ref(
        alloc: &SlabAlloc,
        r: Ref,
        config: TreeConfig,
        nullable: bool,
    ) -> StorageResult<Self> {
        Ok(Self {
            tree: BPlusTree::init_from_ref(alloc, r, config)?,
            nullable,
        })
    }

    /// Ref of the set's root node.
    #[must_use]
    pub fn ref_(&self) -> Ref {
        self.tree.ref_()
    }

    /// Number of elements.
    pub fn size(&self, alloc: &SlabAlloc) -> StorageResult<usize> {
        self.tree.size(alloc)
    }

    /// Element at sorted position `ndx`.
    pub fn get(&self, alloc: &SlabAlloc, ndx: usize) -> StorageResult<T> {
        self.tree.get(alloc, ndx)
    }

    /// Every element in sorted order.
    pub fn get_all(&self, alloc: &SlabAlloc) -> StorageResult<Vec<T>> {
        self.tree.get_all(alloc)
    }

    /// First position whose element is not less than `value`.
    fn lower_bound(&self, alloc: &SlabAlloc, value: &Mixed) -> StorageResult<usize> {
        let (mut lo, mut hi) = (0, self.size(alloc)?);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.tree.get(alloc, mid)?.to_mixed().compare(value) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Position of `value`, if present.
    pub fn find(&self, alloc: &SlabAlloc, value: &T) -> StorageResult<Option<usize>> {
        let m = value.to_mixed();
        let ndx = self.lower_bound(alloc, &m)?;
        if ndx < self.size(alloc)? && self.tree.get(alloc, ndx)?.to_mixed().compare(&m) == Ordering::Equal {
            return Ok(Some(ndx));
        }
        Ok(None)
    }

    /// Returns true if `value` is present.
    pub fn contains(&self, alloc: &SlabAlloc, value: &T) -> StorageResult<bool> {
        Ok(self.find(alloc, value)?.is_some())
    }

    /// Inserts `value`. Returns its position and whether it was added.
    pub fn insert(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        value: T,
    ) -> StorageResult<(usize, bool)> {
        if !self.nullable && value.is_null() {
            return Err(StorageError::NullNotAllowed);
        }
        if let Some(ndx) = self.find(alloc, &value)? {
            return Ok((ndx, false));
        }
        let m = value.to_mixed();
        let ndx = self.lower_bound(alloc, &m)?;
        self.tree.insert(alloc, ndx, &value)?;
        hook.on_insert(ndx, &m);
        Ok((ndx, true))
    }

    /// Removes `value`. Returns the position it had.
    pub fn erase(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        value: &T,
    ) -> StorageResult<Option<usize>> {
        let Some(ndx) = self.find(alloc, value)? else {
            return Ok(None);
        };
        self.tree.erase(alloc, ndx)?;
        hook.on_erase(ndx);
        Ok(Some(ndx))
    }

    /// Removes every element.
    pub fn clear(&mut self, alloc: &mut SlabAlloc, hook: &mut dyn CollectionHook) -> StorageResult<()> {
        let size = self.size(alloc)?;
        if size == 0 {
            return Ok(());
        }
        self.tree.clear(alloc)?;
        hook.on_clear(size);
        Ok(())
    }

    /// Adds every element of `other`.
    pub fn assign_union(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        other: &[T],
    ) -> StorageResult<()> {
        for v in other {
            self.insert(alloc, hook, v.clone())?;
        }
        Ok(())
    }

    /// Keeps only elements also in `other`.
    pub fn assign_intersection(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        other: &[T],
    ) -> StorageResult<()> {
        for v in self.get_all(alloc)? {
            if !other.contains(&v) {
                self.erase(alloc, hook, &v)?;
            }
        }
        Ok(())
    }

    /// Removes every element of `other`.
    pub fn assign_difference(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        other: &[T],
    ) -> StorageResult<()> {
        for v in other {
            self.erase(alloc, hook, v)?;
        }
        Ok(())
    }

    /// Returns true if every element is in `other`.
    pub fn is_subset_of(&self, alloc: &SlabAlloc, other: &[T]) -> StorageResult<bool> {
        Ok(self.get_all(alloc)?.iter().all(|v| other.contains(v)))
    }

    /// Sum of the elements, `None` if unsupported for `T`.
    pub fn sum(&self, alloc: &SlabAlloc) -> StorageResult<Option<Mixed>> {
        self.tree.sum(alloc)
    }

    /// Minimum element, `None` if unsupported for `T`.
    pub fn min(&self, alloc: &SlabAlloc) -> StorageResult<Option<Mixed>> {
        self.tree.min(alloc)
    }

    /// Maximum element, `None` if unsupported for `T`.
    pub fn max(&self, alloc: &SlabAlloc) -> StorageResult<Option<Mixed>> {
        self.tree.max(alloc)
    }

    /// Frees the set.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> StorageResult<()> {
        self.tree.destroy(alloc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::hook::{HookEvent, NoHook, RecordingHook};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    #[test]
    fn test_set_stays_sorted_and_unique() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut alloc = SlabAlloc::new_writable();
        let mut set = SetCore::<i64>::create(&mut alloc, TreeConfig::new(4, 4), false).unwrap();
        let mut model = BTreeSet::new();
        for _ in 0..300 {
            let v = rng.gen_range(-50..50);
            let (ndx, inserted) = set.insert(&mut alloc, &mut NoHook, v).unwrap();
            assert_eq!(inserted, model.insert(v));
            assert_eq!(set.get(&alloc, ndx).unwrap(), v);
        }
        assert_eq!(
            set.get_all(&alloc).unwrap(),
            model.iter().copied().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_mixed_set_orders_across_types() {
        let mut alloc = SlabAlloc::new_writable();
        let mut hook = RecordingHook::default();
        let mut set = SetCore::<Mixed>::create(&mut alloc, TreeConfig::default(), true).unwrap();
        for v in [
            Mixed::String("b".into()),
            Mixed::Int(3),
            Mixed::Double(2.5),
            Mixed::Null,
            Mixed::Int(3),
        ] {
            set.insert(&mut alloc, &mut hook, v).unwrap();
        }
        assert_eq!(set.size(&alloc).unwrap(), 4);
        assert_eq!(set.get(&alloc, 0).unwrap(), Mixed::Null);
        assert_eq!(set.get(&alloc, 1).unwrap(), Mixed::Double(2.5));
        assert_eq!(set.erase(&mut alloc, &mut hook, &Mixed::Int(3)).unwrap(), Some(2));
        assert_eq!(hook.events.last(), Some(&HookEvent::Erase(2)));
    }

    #[test]
    fn test_set_algebra() {
        let mut alloc = SlabAlloc::new_writable();
        let mut set = SetCore::<String>::create(&mut alloc, TreeConfig::default(), false).unwrap();
        let words = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        set.assign_union(&mut alloc, &mut NoHook, &words(&["a", "b", "c"]))
            .unwrap();
        set.assign_intersection(&mut alloc, &mut NoHook, &words(&["b", "c", "d"]))
            .unwrap();
        assert_eq!(set.get_all(&alloc).unwrap(), words(&["b", "c"]));
        set.assign_difference(&mut alloc, &mut NoHook, &words(&["c"]))
            .unwrap();
        assert!(set.is_subset_of(&alloc, &words(&["a", "b"])).unwrap());
    }
}
