//! Accumulates list mutations into a compact change description.
//!
//! Deletions are expressed in indices of the collection before the
//! changes; insertions and modifications in indices after them. A move
//! shows up as a deletion of its source, an insertion of its destination
//! and an entry in `moves`.

use super::index_set::IndexSet;

/// One element that survived at a different position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    /// Index before the changes.
    pub from: usize,
    /// Index after the changes.
    pub to: usize,
}

/// The finished description of what happened to one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionChangeSet {
    /// Old indices of removed elements.
    pub deletions: IndexSet,
    /// New indices of added elements.
    pub insertions: IndexSet,
    /// New indices of elements whose value changed.
    pub modifications: IndexSet,
    /// Elements that moved.
    pub moves: Vec<Move>,
    /// True if the collection was cleared at some point.
    pub collection_was_cleared: bool,
}

impl CollectionChangeSet {
    /// Returns true when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty()
            && self.insertions.is_empty()
            && self.modifications.is_empty()
            && self.moves.is_empty()
            && !self.collection_was_cleared
    }
}

/// Builds a [`CollectionChangeSet`] one mutation at a time.
#[derive(Debug, Clone, Default)]
pub struct CollectionChangeBuilder {
    deletions: IndexSet,
    insertions: IndexSet,
    modifications: IndexSet,
    moves: Vec<Move>,
    cleared: bool,
}

impl CollectionChangeBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when no mutation has been recorded.
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty()
            && self.insertions.is_empty()
            && self.modifications.is_empty()
            && self.moves.is_empty()
            && !self.cleared
    }

    fn move_target(&self, ndx: usize) -> Option<usize> {
        self.moves.iter().position(|m| m.to == ndx)
    }

    // Index the element currently at `ndx` had before any change.
    fn original_index(&self, ndx: usize) -> usize {
        self.deletions.shift(self.insertions.unshift(ndx))
    }

    /// An element was inserted at `ndx`.
    pub fn insert(&mut self, ndx: usize) {
        self.insertions.insert_at(ndx);
        self.modifications.shift_for_insert_at(ndx);
        for m in &mut self.moves {
            if m.to >= ndx {
                m.to += 1;
            }
        }
    }

    /// The element at `ndx` changed value.
    pub fn modify(&mut self, ndx: usize) {
        if self.insertions.contains(ndx) && self.move_target(ndx).is_none() {
            return;
        }
        self.modifications.add(ndx);
    }

    // Drops the element at `ndx` from the new-index sets without
    // recording a deletion.
    fn detach(&mut self, ndx: usize) {
        self.insertions.erase_at(ndx);
        self.modifications.erase_at(ndx);
        for m in &mut self.moves {
            if m.to > ndx {
                m.to -= 1;
            }
        }
    }

    /// The element at `ndx` was erased.
    pub fn erase(&mut self, ndx: usize) {
        if let Some(p) = self.move_target(ndx) {
            self.moves.remove(p);
        } else if !self.insertions.contains(ndx) {
            let old = self.original_index(ndx);
            self.deletions.add(old);
        }
        self.detach(ndx);
    }

    /// The element at `from` now sits at `to`.
    pub fn move_(&mut self, from: usize, to: usize) {
        if from == to {
            return;
        }
        let modified = self.modifications.contains(from);
        let origin = match self.move_target(from) {
            Some(p) => Some(self.moves.remove(p).from),
            None if self.insertions.contains(from) => None,
            None => {
                let old = self.original_index(from);
                self.deletions.add(old);
                Some(old)
            }
        };
        self.detach(from);
        self.insert(to);
        if let Some(old) = origin {
            self.moves.push(Move { from: old, to });
            if modified {
                self.modifications.add(to);
            }
        }
    }

    /// The elements at `a` and `b` traded places.
    pub fn swap(&mut self, a: usize, b: usize) {
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        if lo == hi {
            return;
        }
        self.move_(lo, hi);
        self.move_(hi - 1, lo);
    }

    /// Every one of the `old_size` elements was removed.
    pub fn clear(&mut self, old_size: usize) {
        for ndx in (0..old_size).rev() {
            self.erase(ndx);
        }
        self.cleared = true;
    }

    /// Produces the change set.
    pub fn finalize(mut self) -> CollectionChangeSet {
        self.moves.sort_by_key(|m| m.to);
        CollectionChangeSet {
            deletions: self.deletions,
            insertions: self.insertions,
            modifications: self.modifications,
            moves: self.moves,
            collection_was_cleared: self.cleared,
        }
    }
}
