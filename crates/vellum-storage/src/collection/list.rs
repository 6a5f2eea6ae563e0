//! Ordered lists.

use vellum_common::types::{Mixed, Ref};

use super::hook::CollectionHook;
use crate::alloc::SlabAlloc;
use crate::bptree::{BPlusTree, TreeConfig, TreeValue};
use crate::error::{StorageError, StorageResult};

/// A list of `T` backed by one B+Tree.
#[derive(Debug)]
pub struct LstCore<T: TreeValue> {
    tree: BPlusTree<T>,
    nullable: bool,
}

impl<T: TreeValue> LstCore<T> {
    /// Allocates an empty list.
    pub fn create(alloc: &mut SlabAlloc, config: TreeConfig, nullable: bool) -> StorageResult<Self> {
        Ok(Self {
            tree: BPlusTree::create(alloc, config)?,
            nullable,
        })
    }

    /// Attaches to the list rooted at `r`.
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

    /// Ref of the list's root node.
    #[must_use]
    pub fn ref_(&self) -> Ref {
        self.tree.ref_()
    }

    /// The underlying tree.
    #[must_use]
    pub fn tree(&self) -> &BPlusTree<T> {
        &self.tree
    }

    fn check_null(&self, value: &T) -> StorageResult<()> {
        if !self.nullable && value.is_null() {
            return Err(StorageError::NullNotAllowed);
        }
        Ok(())
    }

    /// Number of elements.
    pub fn size(&self, alloc: &SlabAlloc) -> StorageResult<usize> {
        self.tree.size(alloc)
    }

    /// Reads element `ndx`.
    pub fn get(&self, alloc: &SlabAlloc, ndx: usize) -> StorageResult<T> {
        self.tree.get(alloc, ndx)
    }

    /// Reads every element.
    pub fn get_all(&self, alloc: &SlabAlloc) -> StorageResult<Vec<T>> {
        self.tree.get_all(alloc)
    }

    /// Reads element `ndx` as a `Mixed`.
    pub fn get_any(&self, alloc: &SlabAlloc, ndx: usize) -> StorageResult<Mixed> {
        Ok(self.tree.get(alloc, ndx)?.to_mixed())
    }

    /// Index of the first element equal to `value`.
    pub fn find_first(&self, alloc: &SlabAlloc, value: &T) -> StorageResult<Option<usize>> {
        self.tree.find_first(alloc, value)
    }

    /// Inserts `value` before element `ndx`.
    pub fn insert(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        ndx: usize,
        value: T,
    ) -> StorageResult<()> {
        self.check_null(&value)?;
        self.tree.insert(alloc, ndx, &value)?;
        hook.on_insert(ndx, &value.to_mixed());
        Ok(())
    }

    /// Appends `value`.
    pub fn add(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        value: T,
    ) -> StorageResult<()> {
        let size = self.size(alloc)?;
        self.insert(alloc, hook, size, value)
    }

    /// Overwrites element `ndx` and returns the previous value.
    pub fn set(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        ndx: usize,
        value: T,
    ) -> StorageResult<T> {
        self.check_null(&value)?;
        let old = self.tree.get(alloc, ndx)?;
        self.tree.set(alloc, ndx, &value)?;
        hook.on_set(ndx, &value.to_mixed());
        Ok(old)
    }

    /// Removes element `ndx` and returns it.
    pub fn erase(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        ndx: usize,
    ) -> StorageResult<T> {
        let old = self.tree.get(alloc, ndx)?;
        self.tree.erase(alloc, ndx)?;
        hook.on_erase(ndx);
        Ok(old)
    }

    /// Removes elements `[begin, end)`.
    pub fn remove_range(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        begin: usize,
        end: usize,
    ) -> StorageResult<()> {
        for ndx in (begin..end).rev() {
            self.erase(alloc, hook, ndx)?;
        }
        Ok(())
    }

    /// Moves element `from` to position `to`. Moving an element onto itself
    /// does nothing and reports nothing.
    pub fn move_(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        from: usize,
        to: usize,
    ) -> StorageResult<()> {
        if from == to {
            return Ok(());
        }
        let size = self.size(alloc)?;
        if to >= size {
            return Err(StorageError::out_of_bounds(to, size));
        }
        self.tree.move_element(alloc, from, to)?;
        hook.on_move(from, to);
        Ok(())
    }

    /// Swaps elements `a` and `b`.
    pub fn swap(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        a: usize,
        b: usize,
    ) -> StorageResult<()> {
        if a == b {
            return Ok(());
        }
        self.tree.swap(alloc, a, b)?;
        hook.on_swap(a, b);
        Ok(())
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

    /// Mean of the elements, `None` if unsupported for `T`.
    pub fn avg(&self, alloc: &SlabAlloc) -> StorageResult<Option<Mixed>> {
        self.tree.avg(alloc)
    }

    /// Frees the list.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> StorageResult<()> {
        self.tree.destroy(alloc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::hook::{HookEvent, NoHook, RecordingHook};

    #[test]
    fn test_list_operations_report_to_hook() {
        let mut alloc = SlabAlloc::new_writable();
        let mut hook = RecordingHook::default();
        let mut list = LstCore::<i64>::create(&mut alloc, TreeConfig::new(4, 4), false).unwrap();
        for v in [10, 20, 30] {
            list.add(&mut alloc, &mut hook, v).unwrap();
        }
        list.set(&mut alloc, &mut hook, 1, 25).unwrap();
        list.move_(&mut alloc, &mut hook, 0, 2).unwrap();
        list.move_(&mut alloc, &mut hook, 1, 1).unwrap();
        list.erase(&mut alloc, &mut hook, 0).unwrap();

        assert_eq!(list.get_all(&alloc).unwrap(), vec![30, 10]);
        assert_eq!(
            hook.events,
            vec![
                HookEvent::Insert(0, Mixed::Int(10)),
                HookEvent::Insert(1, Mixed::Int(20)),
                HookEvent::Insert(2, Mixed::Int(30)),
                HookEvent::Set(1, Mixed::Int(25)),
                HookEvent::Move(0, 2),
                HookEvent::Erase(0),
            ]
        );
    }

    #[test]
    fn test_nullability_enforced() {
        let mut alloc = SlabAlloc::new_writable();
        let mut strict =
            LstCore::<Option<i64>>::create(&mut alloc, TreeConfig::default(), false).unwrap();
        assert!(matches!(
            strict.add(&mut alloc, &mut NoHook, None),
            Err(StorageError::NullNotAllowed)
        ));
        let mut loose =
            LstCore::<Option<i64>>::create(&mut alloc, TreeConfig::default(), true).unwrap();
        loose.add(&mut alloc, &mut NoHook, None).unwrap();
        loose.add(&mut alloc, &mut NoHook, Some(3)).unwrap();
        assert_eq!(loose.sum(&alloc).unwrap(), Some(Mixed::Int(3)));
        assert_eq!(loose.get_any(&alloc, 0).unwrap(), Mixed::Null);
    }
}
