//! Changesets stored inside the snapshot.
//!
//! Entry `i` of the history tree is the changeset that produced version
//! `base + i + 1`. Trimming drops entries from the front and raises the
//! base, so a snapshot carries exactly the changesets some live reader may
//! still need to advance.

use bytes::Bytes;
use tracing::trace;
use vellum_common::types::{HistoryType, Ref};
use vellum_storage::{BPlusTree, SlabAlloc};

use super::{get_tagged, set_tagged, update_slot, Group, TOP_HISTORY, TOP_HISTORY_BASE};
use crate::error::{TxnError, TxnResult};

impl Group {
    fn history_tree(&self, alloc: &SlabAlloc) -> TxnResult<Option<BPlusTree<Vec<u8>>>> {
        let r = self.top.get_ref(alloc, TOP_HISTORY);
        if r.is_null() {
            return Ok(None);
        }
        Ok(Some(BPlusTree::init_from_ref(alloc, r, self.config)?))
    }

    /// Version preceding the first stored changeset.
    pub fn history_base(&self, alloc: &SlabAlloc) -> u64 {
        get_tagged(alloc, &self.top, TOP_HISTORY_BASE)
    }

    /// Number of stored changesets.
    pub fn history_size(&self, alloc: &SlabAlloc) -> TxnResult<usize> {
        match self.history_tree(alloc)? {
            Some(tree) => Ok(tree.size(alloc)?),
            None => Ok(0),
        }
    }

    /// Records the changeset of the commit that produces the next version.
    /// Nothing is stored without a history.
    pub(crate) fn history_append(&mut self, alloc: &mut SlabAlloc, changeset: &[u8]) -> TxnResult<()> {
        if self.history_type(alloc) == HistoryType::None {
            return Ok(());
        }
        let config = self.config;
        update_slot(alloc, &mut self.top, TOP_HISTORY, |alloc, r| {
            let mut tree = if r.is_null() {
                BPlusTree::<Vec<u8>>::create(alloc, config)?
            } else {
                BPlusTree::<Vec<u8>>::init_from_ref(alloc, r, config)?
            };
            tree.add(alloc, &changeset.to_vec())?;
            Ok((tree.ref_(), ()))
        })
    }

    /// Changesets that lead from `from` to the snapshot's own version, in
    /// order.
    pub fn history_entries_after(&self, alloc: &SlabAlloc, from: u64) -> TxnResult<Vec<Bytes>> {
        let base = self.history_base(alloc);
        let version = self.version(alloc);
        if from >= version {
            return Ok(Vec::new());
        }
        if from < base {
            return Err(TxnError::BadVersion(from));
        }
        let Some(tree) = self.history_tree(alloc)? else {
            return Err(TxnError::BadVersion(from));
        };
        let first = (from - base) as usize;
        let last = (version - base) as usize;
        if last > tree.size(alloc)? {
            return Err(TxnError::Corrupted(format!(
                "history ends before version {version}"
            )));
        }
        (first..last)
            .map(|i| Ok(Bytes::from(tree.get(alloc, i)?)))
            .collect()
    }

    /// Every stored changeset, oldest first.
    pub(crate) fn history_all_entries(&self, alloc: &SlabAlloc) -> TxnResult<Vec<Vec<u8>>> {
        match self.history_tree(alloc)? {
            Some(tree) => Ok(tree.get_all(alloc)?),
            None => Ok(Vec::new()),
        }
    }

    /// Replaces every stored changeset, keeping the base.
    pub(crate) fn replace_history(
        &mut self,
        alloc: &mut SlabAlloc,
        entries: &[Vec<u8>],
    ) -> TxnResult<()> {
        let config = self.config;
        update_slot(alloc, &mut self.top, TOP_HISTORY, |alloc, r| {
            if !r.is_null() {
                vellum_storage::array::destroy_deep(alloc, r)?;
            }
            if entries.is_empty() {
                return Ok((Ref::NULL, ()));
            }
            let mut tree = BPlusTree::<Vec<u8>>::create(alloc, config)?;
            for e in entries {
                tree.add(alloc, e)?;
            }
            Ok((tree.ref_(), ()))
        })
    }

    /// Drops the changesets no reader at `oldest_live` or later needs.
    pub(crate) fn history_trim(&mut self, alloc: &mut SlabAlloc, oldest_live: u64) -> TxnResult<()> {
        let base = self.history_base(alloc);
        if oldest_live <= base {
            return Ok(());
        }
        let size = self.history_size(alloc)? as u64;
        let drop_count = (oldest_live - base).min(size);
        if drop_count == 0 {
            return Ok(());
        }
        let config = self.config;
        update_slot(alloc, &mut self.top, TOP_HISTORY, |alloc, r| {
            let mut tree = BPlusTree::<Vec<u8>>::init_from_ref(alloc, r, config)?;
            for _ in 0..drop_count {
                tree.erase(alloc, 0)?;
            }
            Ok((tree.ref_(), ()))
        })?;
        set_tagged(alloc, &mut self.top, TOP_HISTORY_BASE, base + drop_count)?;
        trace!(base = base + drop_count, "history trimmed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use vellum_storage::TreeConfig;

    use super::*;

    fn commit(alloc: &mut SlabAlloc, group: &mut Group, payload: u8) {
        group.history_append(alloc, &[payload]).unwrap();
        let v = group.version(alloc);
        group.set_version(alloc, v + 1).unwrap();
    }

    #[test]
    fn test_entries_and_trim() {
        let mut alloc = SlabAlloc::new_writable();
        let mut group =
            Group::create(&mut alloc, TreeConfig::new(4, 4), HistoryType::InRealm).unwrap();
        for p in 1..=6 {
            commit(&mut alloc, &mut group, p);
        }
        assert_eq!(group.version(&alloc), 6);

        let tail = group.history_entries_after(&alloc, 4).unwrap();
        assert_eq!(tail, vec![Bytes::from_static(&[5]), Bytes::from_static(&[6])]);
        assert!(group.history_entries_after(&alloc, 6).unwrap().is_empty());

        group.history_trim(&mut alloc, 3).unwrap();
        assert_eq!(group.history_base(&alloc), 3);
        assert_eq!(group.history_size(&alloc).unwrap(), 3);
        assert_eq!(group.history_entries_after(&alloc, 3).unwrap().len(), 3);
        assert!(matches!(
            group.history_entries_after(&alloc, 2),
            Err(TxnError::BadVersion(2))
        ));
    }

    #[test]
    fn test_no_history_stores_nothing() {
        let mut alloc = SlabAlloc::new_writable();
        let mut group =
            Group::create(&mut alloc, TreeConfig::new(4, 4), HistoryType::None).unwrap();
        commit(&mut alloc, &mut group, 1);
        assert_eq!(group.history_size(&alloc).unwrap(), 0);
    }
}
