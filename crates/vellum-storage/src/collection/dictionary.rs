//! String-keyed dictionaries.

use vellum_common::types::{Mixed, Ref};

use super::hook::CollectionHook;
use crate::alloc::SlabAlloc;
use crate::array::{Array, ArrayType};
use crate::bptree::{BPlusTree, TreeConfig};
use crate::error::{StorageError, StorageResult};

/// A dictionary from strings to `Mixed`: `[keys, values]`, with the keys
/// kept sorted so that lookups are a binary search.
#[derive(Debug)]
pub struct DictionaryCore {
    top: Array,
    keys: BPlusTree<String>,
    values: BPlusTree<Mixed>,
    nullable: bool,
}

impl DictionaryCore {
    /// Allocates an empty dictionary.
    pub fn create(alloc: &mut SlabAlloc, config: TreeConfig, nullable: bool) -> StorageResult<Self> {
        let keys = BPlusTree::create(alloc, config)?;
        let values = BPlusTree::create(alloc, config)?;
        let mut top = Array::create_empty(alloc, ArrayType::HasRefs)?;
        top.add(alloc, keys.ref_().to_slot())?;
        top.add(alloc, values.ref_().to_slot())?;
        Ok(Self {
            top,
            keys,
            values,
            nullable,
        })
    }

    /// Attaches to the dictionary rooted at `r`.
    pub fn init_from_ref(
        alloc: &SlabAlloc,
        r: Ref,
        config: TreeConfig,
        nullable: bool,
    ) -> StorageResult<Self> {
        let top = Array::init_from_ref(alloc, r)?;
        if top.size() != 2 {
            return Err(StorageError::corrupted(r, "dictionary needs keys and values"));
        }
        Ok(Self {
            keys: BPlusTree::init_from_ref(alloc, top.get_ref(alloc, 0), config)?,
            values: BPlusTree::init_from_ref(alloc, top.get_ref(alloc, 1), config)?,
            top,
            nullable,
        })
    }

    /// Ref of the dictionary's top node.
    #[must_use]
    pub fn ref_(&self) -> Ref {
        self.top.ref_()
    }

    fn sync(&mut self, alloc: &mut SlabAlloc, before: (Ref, Ref)) -> StorageResult<()> {
        if self.keys.ref_() != before.0 {
            self.top.set_ref(alloc, 0, self.keys.ref_())?;
        }
        if self.values.ref_() != before.1 {
            self.top.set_ref(alloc, 1, self.values.ref_())?;
        }
        Ok(())
    }

    fn refs(&self) -> (Ref, Ref) {
        (self.keys.ref_(), self.values.ref_())
    }

    /// Number of entries.
    pub fn size(&self, alloc: &SlabAlloc) -> StorageResult<usize> {
        self.keys.size(alloc)
    }

    fn lower_bound(&self, alloc: &SlabAlloc, key: &str) -> StorageResult<usize> {
        let (mut lo, mut hi) = (0, self.size(alloc)?);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.keys.get(alloc, mid)?.as_str() < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Position of `key`, if present.
    pub fn find(&self, alloc: &SlabAlloc, key: &str) -> StorageResult<Option<usize>> {
        let ndx = self.lower_bound(alloc, key)?;
        if ndx < self.size(alloc)? && self.keys.get(alloc, ndx)? == key {
            return Ok(Some(ndx));
        }
        Ok(None)
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, alloc: &SlabAlloc, key: &str) -> StorageResult<bool> {
        Ok(self.find(alloc, key)?.is_some())
    }

    /// Value stored under `key`, if any.
    pub fn get(&self, alloc: &SlabAlloc, key: &str) -> StorageResult<Option<Mixed>> {
        match self.find(alloc, key)? {
            Some(ndx) => Ok(Some(self.values.get(alloc, ndx)?)),
            None => Ok(None),
        }
    }

    /// Value stored under `key`, failing with `KeyNotFound`.
    pub fn try_get(&self, alloc: &SlabAlloc, key: &str) -> StorageResult<Mixed> {
        self.get(alloc, key)?
            .ok_or_else(|| StorageError::KeyNotFound(key.to_string()))
    }

    /// Entry at sorted position `ndx`.
    pub fn get_pair(&self, alloc: &SlabAlloc, ndx: usize) -> StorageResult<(String, Mixed)> {
        Ok((self.keys.get(alloc, ndx)?, self.values.get(alloc, ndx)?))
    }

    /// Every key in sorted order.
    pub fn keys(&self, alloc: &SlabAlloc) -> StorageResult<Vec<String>> {
        self.keys.get_all(alloc)
    }

    /// Every value in key order.
    pub fn values(&self, alloc: &SlabAlloc) -> StorageResult<Vec<Mixed>> {
        self.values.get_all(alloc)
    }

    /// Stores `value` under `key`. Returns the entry's position and true
    /// if the key is new.
    pub fn insert(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        key: &str,
        value: Mixed,
    ) -> StorageResult<(usize, bool)> {
        if !self.nullable && value.is_null() {
            return Err(StorageError::NullNotAllowed);
        }
        let before = self.refs();
        if let Some(ndx) = self.find(alloc, key)? {
            if self.values.get(alloc, ndx)? != value {
                self.values.set(alloc, ndx, &value)?;
                hook.on_dictionary_set(ndx, key, &value);
            }
            self.sync(alloc, before)?;
            return Ok((ndx, false));
        }
        let ndx = self.lower_bound(alloc, key)?;
        self.keys.insert(alloc, ndx, &key.to_string())?;
        self.values.insert(alloc, ndx, &value)?;
        hook.on_dictionary_insert(ndx, key, &value);
        self.sync(alloc, before)?;
        Ok((ndx, true))
    }

    /// Removes `key`. Returns the position it had.
    pub fn erase(
        &mut self,
        alloc: &mut SlabAlloc,
        hook: &mut dyn CollectionHook,
        key: &str,
    ) -> StorageResult<usize> {
        let ndx = self
            .find(alloc, key)?
            .ok_or_else(|| StorageError::KeyNotFound(key.to_string()))?;
        let before = self.refs();
        self.keys.erase(alloc, ndx)?;
        self.values.erase(alloc, ndx)?;
        hook.on_dictionary_erase(ndx, key);
        self.sync(alloc, before)?;
        Ok(ndx)
    }

    /// Removes every entry.
    pub fn clear(&mut self, alloc: &mut SlabAlloc, hook: &mut dyn CollectionHook) -> StorageResult<()> {
        let size = self.size(alloc)?;
        if size == 0 {
            return Ok(());
        }
        let before = self.refs();
        self.keys.clear(alloc)?;
        self.values.clear(alloc)?;
        hook.on_clear(size);
        self.sync(alloc, before)
    }

    /// Sum of the numeric values.
    pub fn sum(&self, alloc: &SlabAlloc) -> StorageResult<Option<Mixed>> {
        self.values.sum(alloc)
    }

    /// Frees the dictionary.
    pub fn destroy(self, alloc: &mut SlabAlloc) -> StorageResult<()> {
        self.top.destroy_deep(alloc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::hook::{HookEvent, RecordingHook};

    #[test]
    fn test_dictionary_insert_update_erase() {
        let mut alloc = SlabAlloc::new_writable();
        let mut hook = RecordingHook::default();
        let mut dict = DictionaryCore::create(&mut alloc, TreeConfig::new(4, 4), true).unwrap();
        for (i, k) in ["delta", "alpha", "charlie", "bravo", "echo"].iter().enumerate() {
            dict.insert(&mut alloc, &mut hook, k, Mixed::Int(i as i64))
                .unwrap();
        }
        assert_eq!(
            dict.keys(&alloc).unwrap(),
            vec!["alpha", "bravo", "charlie", "delta", "echo"]
        );
        assert_eq!(
            dict.insert(&mut alloc, &mut hook, "charlie", Mixed::Null)
                .unwrap(),
            (2, false)
        );
        assert_eq!(hook.events.last(), Some(&HookEvent::Set(2, Mixed::Null)));
        assert_eq!(dict.get(&alloc, "charlie").unwrap(), Some(Mixed::Null));
        assert_eq!(dict.erase(&mut alloc, &mut hook, "alpha").unwrap(), 0);
        assert!(matches!(
            dict.try_get(&alloc, "alpha"),
            Err(StorageError::KeyNotFound(_))
        ));

        let again = DictionaryCore::init_from_ref(&alloc, dict.ref_(), TreeConfig::new(4, 4), true)
            .unwrap();
        assert_eq!(again.size(&alloc).unwrap(), 4);
        assert_eq!(
            again.get_pair(&alloc, 0).unwrap(),
            ("bravo".to_string(), Mixed::Int(3))
        );
    }

    #[test]
    fn test_dictionary_clear() {
        let mut alloc = SlabAlloc::new_writable();
        let mut hook = RecordingHook::default();
        let mut dict = DictionaryCore::create(&mut alloc, TreeConfig::default(), false).unwrap();
        assert!(dict.insert(&mut alloc, &mut hook, "k", Mixed::Null).is_err());
        dict.insert(&mut alloc, &mut hook, "k", Mixed::Int(1)).unwrap();
        dict.clear(&mut alloc, &mut hook).unwrap();
        assert_eq!(dict.size(&alloc).unwrap(), 0);
        assert_eq!(hook.events.last(), Some(&HookEvent::Clear(1)));
        dict.destroy(&mut alloc).unwrap();
    }
}
