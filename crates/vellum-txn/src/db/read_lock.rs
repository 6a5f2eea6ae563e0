//! Read-lock ring.
//!
//! Each slot holds one published snapshot and the number of transactions
//! bound to it. The latest snapshot always occupies a slot. Older
//! snapshots keep their slot only while some transaction pins them; their
//! nodes and history entries may be reclaimed once the slot is cleared.

use std::sync::Arc;

use tracing::{trace, warn};
use vellum_common::types::{Ref, VersionId};
use vellum_storage::Mapping;

/// One published version of the database.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Version number.
    pub version: u64,
    /// Top array of the version.
    pub top_ref: Ref,
    /// Committed image the top ref lives in.
    pub mapping: Arc<Mapping>,
}

#[derive(Debug, Default)]
struct Slot {
    snapshot: Option<Snapshot>,
    count: usize,
}

#[derive(Debug)]
pub(crate) struct ReadLockRing {
    slots: Vec<Slot>,
    latest: usize,
}

impl ReadLockRing {
    pub(crate) fn new(capacity: usize, initial: Snapshot) -> Self {
        let mut slots: Vec<Slot> = (0..capacity.max(1)).map(|_| Slot::default()).collect();
        slots[0].snapshot = Some(initial);
        Self { slots, latest: 0 }
    }

    fn latest_slot(&self) -> &Slot {
        &self.slots[self.latest]
    }

    /// The most recently published snapshot.
    pub(crate) fn latest(&self) -> Option<&Snapshot> {
        self.latest_slot().snapshot.as_ref()
    }

    pub(crate) fn latest_version(&self) -> u64 {
        self.latest().map_or(0, |s| s.version)
    }

    fn pin(&mut self, idx: usize) -> Option<(VersionId, Snapshot)> {
        let slot = &mut self.slots[idx];
        let snapshot = slot.snapshot.clone()?;
        slot.count += 1;
        trace!(version = snapshot.version, idx, count = slot.count, "read lock taken");
        Some((VersionId::new(snapshot.version, idx as u32), snapshot))
    }

    /// Pins the latest snapshot.
    pub(crate) fn grab_latest(&mut self) -> Option<(VersionId, Snapshot)> {
        self.pin(self.latest)
    }

    /// Pins the snapshot of `version` if it is still retained.
    pub(crate) fn grab(&mut self, version: u64) -> Option<(VersionId, Snapshot)> {
        let idx = self.slots.iter().position(|s| {
            s.snapshot.as_ref().is_some_and(|snap| snap.version == version)
        })?;
        self.pin(idx)
    }

    /// Releases one pin of `id`. The slot is cleared when it was the last
    /// pin of a snapshot that is no longer the latest.
    pub(crate) fn release(&mut self, id: VersionId) {
        let idx = id.reader_idx as usize;
        let latest = self.latest;
        let Some(slot) = self.slots.get_mut(idx) else {
            return;
        };
        if slot.snapshot.as_ref().map(|s| s.version) != Some(id.version) || slot.count == 0 {
            return;
        }
        slot.count -= 1;
        if slot.count == 0 && idx != latest {
            slot.snapshot = None;
        }
        trace!(version = id.version, idx, "read lock released");
    }

    /// Publishes `snapshot` as the latest version, optionally pinned once
    /// for the committing transaction.
    pub(crate) fn publish(&mut self, snapshot: Snapshot, pin: bool) -> Option<VersionId> {
        let idx = match self
            .slots
            .iter()
            .enumerate()
            .position(|(i, s)| i != self.latest && s.count == 0)
        {
            Some(idx) => idx,
            None => {
                warn!(slots = self.slots.len(), "read lock ring full, growing");
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let previous = self.latest;
        self.slots[idx] = Slot {
            snapshot: Some(snapshot),
            count: 0,
        };
        self.latest = idx;
        if self.slots[previous].count == 0 {
            self.slots[previous].snapshot = None;
        }
        if pin {
            self.pin(idx).map(|(id, _)| id)
        } else {
            None
        }
    }

    /// Oldest version any slot still retains.
    pub(crate) fn oldest_live_version(&self) -> u64 {
        self.slots
            .iter()
            .filter_map(|s| s.snapshot.as_ref().map(|snap| snap.version))
            .min()
            .unwrap_or(0)
    }

    /// Versions currently retained, oldest first.
    pub(crate) fn retained_versions(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self
            .slots
            .iter()
            .filter_map(|s| s.snapshot.as_ref().map(|snap| snap.version))
            .collect();
        v.sort_unstable();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(version: u64) -> Snapshot {
        Snapshot {
            version,
            top_ref: Ref::new(version * 8 + 24),
            mapping: Arc::new(Mapping::empty()),
        }
    }

    #[test]
    fn test_unpinned_versions_are_dropped() {
        let mut ring = ReadLockRing::new(4, snap(0));
        ring.publish(snap(1), false);
        ring.publish(snap(2), false);
        assert_eq!(ring.retained_versions(), vec![2]);
        assert_eq!(ring.oldest_live_version(), 2);
        assert!(ring.grab(1).is_none());
    }

    #[test]
    fn test_pinned_versions_survive_until_released() {
        let mut ring = ReadLockRing::new(2, snap(0));
        let (id0, s0) = ring.grab_latest().unwrap();
        assert_eq!(s0.version, 0);

        ring.publish(snap(1), false);
        ring.publish(snap(2), false);
        assert_eq!(ring.retained_versions(), vec![0, 2]);
        assert_eq!(ring.oldest_live_version(), 0);

        let (again, _) = ring.grab(0).unwrap();
        assert_eq!(again, id0);
        ring.release(again);
        assert_eq!(ring.oldest_live_version(), 0);
        ring.release(id0);
        assert_eq!(ring.retained_versions(), vec![2]);
    }

    #[test]
    fn test_ring_grows_when_full() {
        let mut ring = ReadLockRing::new(1, snap(0));
        let (id0, _) = ring.grab_latest().unwrap();
        let id1 = ring.publish(snap(1), true).unwrap();
        assert_eq!(ring.retained_versions(), vec![0, 1]);
        assert_eq!(id1.version, 1);
        assert_ne!(id0.reader_idx, id1.reader_idx);
        assert_eq!(ring.latest_version(), 1);
    }
}
