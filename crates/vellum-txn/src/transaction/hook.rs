//! Forwards collection mutations to the transaction's replication.

use vellum_common::types::{ColKey, Mixed, ObjKey, TableKey};
use vellum_replication::Replication;
use vellum_storage::CollectionHook;

/// Records every mutation of one collection as changeset instructions.
pub(crate) struct ReplicationHook<'a> {
    repl: Option<&'a mut Replication>,
    table: TableKey,
    col: ColKey,
    key: ObjKey,
}

impl<'a> ReplicationHook<'a> {
    pub(crate) fn new(
        repl: Option<&'a mut Replication>,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
    ) -> Self {
        Self {
            repl,
            table,
            col,
            key,
        }
    }
}

impl CollectionHook for ReplicationHook<'_> {
    fn on_insert(&mut self, ndx: usize, value: &Mixed) {
        if let Some(r) = self.repl.as_deref_mut() {
            r.list_insert(self.table, self.col, self.key, ndx, value);
        }
    }

    fn on_set(&mut self, ndx: usize, value: &Mixed) {
        if let Some(r) = self.repl.as_deref_mut() {
            r.list_set(self.table, self.col, self.key, ndx, value);
        }
    }

    fn on_erase(&mut self, ndx: usize) {
        if let Some(r) = self.repl.as_deref_mut() {
            r.list_erase(self.table, self.col, self.key, ndx);
        }
    }

    fn on_move(&mut self, from: usize, to: usize) {
        if let Some(r) = self.repl.as_deref_mut() {
            r.list_move(self.table, self.col, self.key, from, to);
        }
    }

    fn on_swap(&mut self, a: usize, b: usize) {
        if let Some(r) = self.repl.as_deref_mut() {
            r.list_swap(self.table, self.col, self.key, a, b);
        }
    }

    fn on_clear(&mut self, old_size: usize) {
        if let Some(r) = self.repl.as_deref_mut() {
            r.list_clear(self.table, self.col, self.key, old_size);
        }
    }

    fn on_dictionary_insert(&mut self, ndx: usize, key: &str, value: &Mixed) {
        if let Some(r) = self.repl.as_deref_mut() {
            r.dictionary_insert(self.table, self.col, self.key, ndx, key, value);
        }
    }

    fn on_dictionary_set(&mut self, ndx: usize, key: &str, value: &Mixed) {
        if let Some(r) = self.repl.as_deref_mut() {
            r.dictionary_set(self.table, self.col, self.key, ndx, key, value);
        }
    }

    fn on_dictionary_erase(&mut self, ndx: usize, key: &str) {
        if let Some(r) = self.repl.as_deref_mut() {
            r.dictionary_erase(self.table, self.col, self.key, ndx, key);
        }
    }
}
