//! Replays changesets into a write transaction.
//!
//! Used to integrate changes received from a sync server and to re-apply
//! local changes after a client reset. Object creation and removal are
//! idempotent so that a changeset touching an object the local state
//! already has (or already lost) still applies.

use bytes::Bytes;
use tracing::{trace, warn};
use vellum_common::types::{ColKey, Mixed, ObjKey, TableKey};
use vellum_replication::{parse_changeset, InstructionHandler, ParseError};

use crate::collection::any;
use crate::error::{TxnError, TxnResult};
use crate::transaction::Transaction;

/// An [`InstructionHandler`] applying every instruction to a transaction.
pub struct InstructionApplier<'a> {
    tr: &'a mut Transaction,
    table: TableKey,
    collection: Option<(ColKey, ObjKey)>,
    error: Option<TxnError>,
    applied: usize,
}

impl std::fmt::Debug for InstructionApplier<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstructionApplier")
            .field("table", &self.table)
            .field("collection", &self.collection)
            .field("applied", &self.applied)
            .finish()
    }
}

impl<'a> InstructionApplier<'a> {
    /// Creates an applier writing into `tr`, which must be writing.
    pub fn new(tr: &'a mut Transaction) -> Self {
        Self {
            tr,
            table: TableKey::NULL,
            collection: None,
            error: None,
            applied: 0,
        }
    }

    /// Number of instructions applied so far.
    pub fn applied(&self) -> usize {
        self.applied
    }

    /// The error that stopped the last parse, if any.
    pub fn take_error(&mut self) -> Option<TxnError> {
        self.error.take()
    }

    fn run(&mut self, what: &str, f: impl FnOnce(&mut Self) -> TxnResult<()>) -> bool {
        match f(self) {
            Ok(()) => {
                self.applied += 1;
                true
            }
            Err(e) => {
                warn!(instruction = what, error = %e, "changeset instruction failed");
                self.error = Some(e);
                false
            }
        }
    }

    fn table(&self) -> TxnResult<TableKey> {
        if self.table.is_valid() {
            Ok(self.table)
        } else {
            Err(TxnError::illegal("object instruction without a selected table"))
        }
    }

    fn collection(&self) -> TxnResult<(TableKey, ColKey, ObjKey)> {
        let table = self.table()?;
        let (col, key) = self
            .collection
            .ok_or_else(|| TxnError::illegal("collection instruction without a selected collection"))?;
        Ok((table, col, key))
    }
}

impl InstructionHandler for InstructionApplier<'_> {
    fn insert_group_level_table(&mut self, table: TableKey, name: &str) -> bool {
        self.run("insert_group_level_table", |a| {
            if a.tr.has_table(table)? {
                if a.tr.table_name(table)? == name {
                    return Ok(());
                }
                return Err(TxnError::illegal(format!(
                    "table key {table} already names another table"
                )));
            }
            a.tr.add_table_with_key(name, table)
        })
    }

    fn erase_group_level_table(&mut self, table: TableKey) -> bool {
        self.run("erase_group_level_table", |a| {
            if a.table == table {
                a.table = TableKey::NULL;
                a.collection = None;
            }
            a.tr.remove_table(table)
        })
    }

    fn rename_group_level_table(&mut self, table: TableKey, name: &str) -> bool {
        self.run("rename_group_level_table", |a| a.tr.rename_table(table, name))
    }

    fn select_table(&mut self, table: TableKey) -> bool {
        self.run("select_table", |a| {
            if !a.tr.has_table(table)? {
                return Err(TxnError::NoSuchTable(table.to_string()));
            }
            a.table = table;
            a.collection = None;
            Ok(())
        })
    }

    fn create_object(&mut self, key: ObjKey) -> bool {
        self.run("create_object", |a| {
            let table = a.table()?;
            if a.tr.has_object(table, key)? {
                trace!(%table, %key, "object already exists");
                return Ok(());
            }
            a.tr.insert_object(table, key)
        })
    }

    fn remove_object(&mut self, key: ObjKey) -> bool {
        self.run("remove_object", |a| {
            let table = a.table()?;
            if !a.tr.has_object(table, key)? {
                trace!(%table, %key, "object already gone");
                return Ok(());
            }
            if matches!(a.collection, Some((_, k)) if k == key) {
                a.collection = None;
            }
            a.tr.remove_object(table, key)
        })
    }

    fn clear_table(&mut self, _old_size: usize) -> bool {
        self.run("clear_table", |a| {
            let table = a.table()?;
            a.collection = None;
            a.tr.clear_table(table)
        })
    }

    fn modify_object(&mut self, col: ColKey, key: ObjKey, value: &Mixed) -> bool {
        self.run("modify_object", |a| {
            let table = a.table()?;
            a.tr.set(table, col, key, value.clone())
        })
    }

    fn insert_column(&mut self, col: ColKey, name: &str, target: TableKey) -> bool {
        self.run("insert_column", |a| {
            let table = a.table()?;
            if a.tr.find_column(table, name)? == Some(col) {
                return Ok(());
            }
            a.tr.add_column_with_key(table, col, name, target)
        })
    }

    fn erase_column(&mut self, col: ColKey) -> bool {
        self.run("erase_column", |a| {
            let table = a.table()?;
            if matches!(a.collection, Some((c, _)) if c == col) {
                a.collection = None;
            }
            a.tr.remove_column(table, col)
        })
    }

    fn rename_column(&mut self, col: ColKey, name: &str) -> bool {
        self.run("rename_column", |a| {
            let table = a.table()?;
            a.tr.rename_column(table, col, name)
        })
    }

    fn typed_link_change(&mut self, col: ColKey, target: TableKey) -> bool {
        self.run("typed_link_change", |a| {
            let table = a.table()?;
            a.tr.set_link_target(table, col, target)
        })
    }

    fn select_collection(&mut self, col: ColKey, key: ObjKey) -> bool {
        self.run("select_collection", |a| {
            let table = a.table()?;
            if !col.is_collection() {
                return Err(TxnError::invalid_column(format!("{col:?} is not a collection")));
            }
            if !a.tr.has_object(table, key)? {
                return Err(TxnError::KeyNotFound { table, key });
            }
            a.collection = Some((col, key));
            Ok(())
        })
    }

    fn collection_insert(&mut self, ndx: usize, value: &Mixed) -> bool {
        self.run("collection_insert", |a| {
            let (t, c, k) = a.collection()?;
            any::insert(a.tr, t, c, k, ndx, value)
        })
    }

    fn collection_set(&mut self, ndx: usize, value: &Mixed) -> bool {
        self.run("collection_set", |a| {
            let (t, c, k) = a.collection()?;
            any::set(a.tr, t, c, k, ndx, value)
        })
    }

    fn collection_move(&mut self, from: usize, to: usize) -> bool {
        self.run("collection_move", |a| {
            let (t, c, k) = a.collection()?;
            any::move_(a.tr, t, c, k, from, to)
        })
    }

    fn collection_swap(&mut self, x: usize, y: usize) -> bool {
        self.run("collection_swap", |a| {
            let (t, c, k) = a.collection()?;
            any::swap(a.tr, t, c, k, x, y)
        })
    }

    fn collection_erase(&mut self, ndx: usize) -> bool {
        self.run("collection_erase", |a| {
            let (t, c, k) = a.collection()?;
            any::erase(a.tr, t, c, k, ndx)
        })
    }

    fn collection_clear(&mut self, _old_size: usize) -> bool {
        self.run("collection_clear", |a| {
            let (t, c, k) = a.collection()?;
            any::clear(a.tr, t, c, k)
        })
    }

    fn dictionary_insert(&mut self, _ndx: usize, key: &str, value: &Mixed) -> bool {
        self.run("dictionary_insert", |a| {
            let (t, c, k) = a.collection()?;
            any::dictionary_insert(a.tr, t, c, k, key, value)
        })
    }

    fn dictionary_set(&mut self, _ndx: usize, key: &str, value: &Mixed) -> bool {
        self.run("dictionary_set", |a| {
            let (t, c, k) = a.collection()?;
            any::dictionary_insert(a.tr, t, c, k, key, value)
        })
    }

    fn dictionary_erase(&mut self, _ndx: usize, key: &str) -> bool {
        self.run("dictionary_erase", |a| {
            let (t, c, k) = a.collection()?;
            any::dictionary_erase(a.tr, t, c, k, key)
        })
    }
}

/// Applies `changeset` to the writing transaction `tr`. Returns the number
/// of instructions applied. On error nothing is undone; roll the
/// transaction back.
pub fn apply_changeset(tr: &mut Transaction, changeset: &Bytes) -> TxnResult<usize> {
    let mut applier = InstructionApplier::new(tr);
    match parse_changeset(changeset, &mut applier) {
        Ok(()) => Ok(applier.applied()),
        Err(ParseError::Rejected(_)) => Err(applier
            .take_error()
            .unwrap_or_else(|| TxnError::illegal("changeset rejected"))),
        Err(e) => Err(e.into()),
    }
}
