//! Link lists with tombstone filtering.
//!
//! A link list may hold unresolved keys pointing at tombstones of removed
//! objects. Those entries keep their physical position but are invisible:
//! every public index is a virtual index over the resolved entries only.

use vellum_common::types::{ObjKey, Ref};

use super::hook::CollectionHook;
use super::list::LstCore;
use crate::alloc::SlabAlloc;
use crate::bptree::TreeConfig;
use crate::error::{StorageError, StorageResult};

/// A list of links into one target table.
#[derive(Debug)]
pub struct LnkLst {
    core: LstCore<ObjKey>,
}

impl LnkLst {
    /// Allocates an empty link list.
    pub fn create(alloc: &mut SlabAlloc, config: TreeConfig) -> StorageResult<Self> {
        Ok(Self {
            core: LstCore::create(alloc, config, false)?,
        })
    }

    /// Attaches to the link list rooted at `r`.
    pub fn init_from_ref(alloc: &SlabAlloc, r: Ref, config: TreeConfig) -> StorageResult<Self> {
        Ok(Self {
            core: LstCore::init_from_ref(alloc, r, config, false)?,
        })
    }

    /// Ref of the list's root node.
    #[must_use]
    pub fn ref_(&self) -> Ref {
        self.core.ref_()
    }

    fn physical(&self, alloc: &SlabAlloc) -> StorageResult<Vec<ObjKey>> {
        self.core.get_all(alloc)
    }

    /// Returns true if any entry points at a tombstone.
    pub fn has_unresolved(&self, alloc: &SlabAlloc) -> StorageResult<bool> {
        Ok(self.physical(alloc)?.iter().any(|k| k.is_unresolved()))
    }

    /// Number of resolved links.
    pub fn size(&self, alloc: &SlabAlloc) -> StorageResult<usize> {
        Ok(self
            .physical(alloc)?
            .iter()
            .filter(|k| !k.is_unresolved())
            .count())
    }

    /// Number of entries including tombstones.
    pub fn physical_size(&self, alloc: &SlabAlloc) -> StorageResult<usize> {
        self.core.size(alloc)
    }

    /// Physical position of virtual index `ndx`. A `ndx` equal to the
    /// virtual size maps to the physical end.
    pub fn virtual_to_physical(&self, alloc: &SlabAlloc, ndx: usize) -> StorageResult<usize> {
        let keys = self.physical(alloc)?;
        let mut seen = 0;
        for (i, k) in keys.iter().enumerate() {
            if k.is_unresolved() {
                continue;
            }
            if seen == ndx {
                return Ok(i);
            }
            seen += 1;
        }
        if seen == ndx {
            Ok(keys.len())
        } else {
            Err(StorageError::out_of_bounds(ndx, seen))
        }
    }

    /// Virtual index of physical position `ndx`, `None` for tombstones.
    pub fn physical_to_virtual(&self, alloc: &SlabAlloc, ndx: usize) -> StorageResult<Option<usize>> {
        let keys = self.physical(alloc)?;
        match keys.get(ndx) {
            None => Err(StorageError::out_of_bounds(ndx, keys.len())),
            Some(k) if k.is_unresolved() => Ok(None),
            Some(_) => Ok(Some(keys[..ndx].iter().filter(|k| !k.is_unresolved()).count())),
        }
    }

    /// Link at virtual index `ndx`.
    pub fn get(&self, alloc: &SlabAlloc, ndx: usize) -> StorageResult<ObjKey> {
        let p = self.virtual_to_physical(alloc, ndx)?;
        self.core.get(alloc, p)
    }

    /// Every resolved link in order.
    pub fn get_all(&self, alloc: &SlabAlloc) -> StorageResult<Vec<ObjKey>> {
        Ok(self
            .physical(alloc)?
            .into_iter()
            .filter(|k| !k.is_unresolved())
            .collect())
    }

    /// Virtual index of the first link to `key`.
    pub fn find_first(&self, alloc: &SlabAlloc, key: ObjKey) -> StorageResult<Option<usize>> {
        Ok(self.get_all(alloc)?.iter().position(|k| *k == key))
    }

    fn check_key(key: ObjKey) -> StorageResult<()> {
        if !key.is_valid() {
            return Err(StorageError::NullNotAllowed);
        }
        Ok(())
    }

    /// Inserts a link before virtual index `ndx`.
    pub fn insert(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        ndx: usize,
        key: ObjKey,
    ) -> StorageResult<()> {
        Self::check_key(key)?;
        let p = self.virtual_to_physical(alloc, ndx)?;
        self.core.insert(alloc, hook, p, key)
    }

    /// Appends a link.
    pub fn add(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        key: ObjKey,
    ) -> StorageResult<()> {
        Self::check_key(key)?;
        let p = self.core.size(alloc)?;
        self.core.insert(alloc, hook, p, key)
    }

    /// Replaces the link at virtual index `ndx`.
    pub fn set(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        ndx: usize,
        key: ObjKey,
    ) -> StorageResult<ObjKey> {
        Self::check_key(key)?;
        let p = self.virtual_to_physical(alloc, ndx)?;
        self.core.set(alloc, hook, p, key)
    }

    /// Removes the link at virtual index `ndx`.
    pub fn erase(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        ndx: usize,
    ) -> StorageResult<ObjKey> {
        let p = self.virtual_to_physical(alloc, ndx)?;
        self.core.erase(alloc, hook, p)
    }

    /// Moves the link at virtual index `from` to virtual index `to`.
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
        let pf = self.virtual_to_physical(alloc, from)?;
        let pt = self.virtual_to_physical(alloc, to)?;
        self.core.move_(alloc, hook, pf, pt)
    }

    /// Removes every entry, tombstones included.
    pub fn clear(&mut self, alloc: &mut SlabAlloc, hook: &mut dyn CollectionHook) -> StorageResult<()> {
        self.core.clear(alloc, hook)
    }

    /// Rewrites every entry equal to `from` into `to`. Used when a target
    /// object becomes a tombstone or is resurrected. Returns the number of
    /// entries changed.
    pub fn replace_key(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        from: ObjKey,
        to: ObjKey,
    ) -> StorageResult<usize> {
        let keys = self.physical(alloc)?;
        let mut changed = 0;
        for (i, k) in keys.iter().enumerate() {
            if *k == from {
                self.core.set(alloc, hook, i, to)?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Removes every entry equal to `key`, tombstone or not.
    pub fn remove_key(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        key: ObjKey,
    ) -> StorageResult<usize> {
        let keys = self.physical(alloc)?;
        let mut removed = 0;
        for (i, k) in keys.iter().enumerate().rev() {
            if *k == key {
                self.core.erase(alloc, hook, i)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Frees the list.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> StorageResult<()> {
        self.core.destroy(alloc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::hook::NoHook;

    fn keys(v: &[i64]) -> Vec<ObjKey> {
        v.iter().map(|k| ObjKey::new(*k)).collect()
    }

    #[test]
    fn test_tombstones_are_invisible() {
        let mut alloc = SlabAlloc::new_writable();
        let mut list = LnkLst::create(&mut alloc, TreeConfig::new(4, 4)).unwrap();
        for k in [1, 2, 3, 4] {
            list.add(&mut alloc, &mut NoHook, ObjKey::new(k)).unwrap();
        }
        let tomb = ObjKey::new(2).get_unresolved();
        assert!(tomb.is_unresolved());
        assert_eq!(
            list.replace_key(&mut alloc, &mut NoHook, ObjKey::new(2), tomb)
                .unwrap(),
            1
        );

        assert!(list.has_unresolved(&alloc).unwrap());
        assert_eq!(list.size(&alloc).unwrap(), 3);
        assert_eq!(list.physical_size(&alloc).unwrap(), 4);
        assert_eq!(list.get_all(&alloc).unwrap(), keys(&[1, 3, 4]));
        assert_eq!(list.get(&alloc, 1).unwrap(), ObjKey::new(3));
        assert_eq!(list.virtual_to_physical(&alloc, 1).unwrap(), 2);
        assert_eq!(list.physical_to_virtual(&alloc, 1).unwrap(), None);
        assert_eq!(list.physical_to_virtual(&alloc, 3).unwrap(), Some(2));

        list.insert(&mut alloc, &mut NoHook, 1, ObjKey::new(9)).unwrap();
        assert_eq!(list.get_all(&alloc).unwrap(), keys(&[1, 9, 3, 4]));
        list.erase(&mut alloc, &mut NoHook, 0).unwrap();
        assert_eq!(list.find_first(&alloc, ObjKey::new(4)).unwrap(), Some(2));
    }

    #[test]
    fn test_null_link_rejected() {
        let mut alloc = SlabAlloc::new_writable();
        let mut list = LnkLst::create(&mut alloc, TreeConfig::default()).unwrap();
        assert!(list.add(&mut alloc, &mut NoHook, ObjKey::NULL).is_err());
    }
}
