//! Mutation recording for write transactions.
//!
//! [`Replication`] is the entry point the transaction layer calls for every
//! mutation. It tracks the current table and collection selection so that
//! `SelectTable`/`SelectCollection` are only emitted when the target
//! changes, and hands the finished changeset back at commit.

use bytes::Bytes;
use tracing::{debug, trace};
use vellum_common::types::{ColKey, HistoryType, Mixed, ObjKey, TableKey};

use crate::encoder::TransactLogEncoder;
use crate::error::{ReplicationError, ReplicationResult};

/// Records the mutations of one write transaction at a time.
#[derive(Debug)]
pub struct Replication {
    history_type: HistoryType,
    encoder: TransactLogEncoder,
    /// Version the running write builds on, if any.
    base_version: Option<u64>,
    selected_table: TableKey,
    selected_collection: Option<(ColKey, ObjKey)>,
}

impl Replication {
    /// Creates a replication recording a history of `history_type`.
    pub fn new(history_type: HistoryType) -> Self {
        Self {
            history_type,
            encoder: TransactLogEncoder::new(),
            base_version: None,
            selected_table: TableKey::NULL,
            selected_collection: None,
        }
    }

    /// Kind of history this replication writes.
    pub fn history_type(&self) -> HistoryType {
        self.history_type
    }

    /// Returns true between `initiate_transact` and commit or abort.
    pub fn is_in_transaction(&self) -> bool {
        self.base_version.is_some()
    }

    /// Version the running write transaction builds on.
    pub fn base_version(&self) -> Option<u64> {
        self.base_version
    }

    /// Starts recording a write transaction on top of `version`.
    pub fn initiate_transact(&mut self, version: u64) {
        trace!(version, "initiate_transact");
        self.encoder.reset();
        self.reset_selection();
        self.base_version = Some(version);
    }

    /// Changes recorded so far in the running write.
    pub fn get_uncommitted_changes(&self) -> &[u8] {
        self.encoder.as_bytes()
    }

    /// Ends the write and returns its changeset.
    pub fn prepare_commit(&mut self) -> ReplicationResult<Bytes> {
        let base = self
            .base_version
            .take()
            .ok_or_else(|| ReplicationError::not_in_transaction("prepare_commit"))?;
        let instructions = self.encoder.instruction_count();
        let changeset = self.encoder.finish();
        self.reset_selection();
        debug!(
            base_version = base,
            instructions,
            bytes = changeset.len(),
            "changeset prepared"
        );
        Ok(changeset)
    }

    /// Discards the running write.
    pub fn abort_transact(&mut self) {
        if self.base_version.take().is_some() {
            trace!(bytes = self.encoder.len(), "abort_transact");
        }
        self.encoder.reset();
        self.reset_selection();
    }

    fn reset_selection(&mut self) {
        self.selected_table = TableKey::NULL;
        self.selected_collection = None;
    }

    fn select_table(&mut self, table: TableKey) {
        if self.selected_table != table {
            self.encoder.select_table(table);
            self.selected_table = table;
            self.selected_collection = None;
        }
    }

    fn select_collection(&mut self, table: TableKey, col: ColKey, key: ObjKey) {
        self.select_table(table);
        if self.selected_collection != Some((col, key)) {
            self.encoder.select_collection(col, key);
            self.selected_collection = Some((col, key));
        }
    }

    // =========================================================================
    // Schema
    // =========================================================================

    /// Records a new table.
    pub fn add_class(&mut self, table: TableKey, name: &str) {
        self.encoder.insert_group_level_table(table, name);
    }

    /// Records a table removal.
    pub fn erase_class(&mut self, table: TableKey) {
        if self.selected_table == table {
            self.reset_selection();
        }
        self.encoder.erase_group_level_table(table);
    }

    /// Records a table rename.
    pub fn rename_class(&mut self, table: TableKey, name: &str) {
        self.encoder.rename_group_level_table(table, name);
    }

    /// Records a new column.
    pub fn insert_column(&mut self, table: TableKey, col: ColKey, name: &str, target: TableKey) {
        self.select_table(table);
        self.encoder.insert_column(col, name, target);
    }

    /// Records a column removal.
    pub fn erase_column(&mut self, table: TableKey, col: ColKey) {
        self.select_table(table);
        if matches!(self.selected_collection, Some((c, _)) if c == col) {
            self.selected_collection = None;
        }
        self.encoder.erase_column(col);
    }

    /// Records a column rename.
    pub fn rename_column(&mut self, table: TableKey, col: ColKey, name: &str) {
        self.select_table(table);
        self.encoder.rename_column(col, name);
    }

    /// Records a typed link retarget.
    pub fn typed_link_change(&mut self, table: TableKey, col: ColKey, target: TableKey) {
        self.select_table(table);
        self.encoder.typed_link_change(col, target);
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Records an object creation.
    pub fn create_object(&mut self, table: TableKey, key: ObjKey) {
        self.select_table(table);
        self.encoder.create_object(key);
    }

    /// Records an object removal.
    pub fn remove_object(&mut self, table: TableKey, key: ObjKey) {
        self.select_table(table);
        if matches!(self.selected_collection, Some((_, k)) if k == key) {
            self.selected_collection = None;
        }
        self.encoder.remove_object(key);
    }

    /// Records a table clear.
    pub fn clear_table(&mut self, table: TableKey, old_size: usize) {
        self.select_table(table);
        self.selected_collection = None;
        self.encoder.clear_table(old_size);
    }

    /// Records a scalar field update.
    pub fn set(&mut self, table: TableKey, col: ColKey, key: ObjKey, value: &Mixed) {
        self.select_table(table);
        self.encoder.modify_object(col, key, value);
    }

    // =========================================================================
    // Collections
    // =========================================================================

    /// Records a list or set insertion.
    pub fn list_insert(
        &mut self,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        ndx: usize,
        value: &Mixed,
    ) {
        self.select_collection(table, col, key);
        self.encoder.collection_insert(ndx, value);
    }

    /// Records a list element overwrite.
    pub fn list_set(
        &mut self,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        ndx: usize,
        value: &Mixed,
    ) {
        self.select_collection(table, col, key);
        self.encoder.collection_set(ndx, value);
    }

    /// Records a list move. Self-moves are dropped.
    pub fn list_move(&mut self, table: TableKey, col: ColKey, key: ObjKey, from: usize, to: usize) {
        if from == to {
            return;
        }
        self.select_collection(table, col, key);
        self.encoder.collection_move(from, to);
    }

    /// Records a list swap.
    pub fn list_swap(&mut self, table: TableKey, col: ColKey, key: ObjKey, a: usize, b: usize) {
        self.select_collection(table, col, key);
        self.encoder.collection_swap(a, b);
    }

    /// Records a list, set or dictionary erase by position.
    pub fn list_erase(&mut self, table: TableKey, col: ColKey, key: ObjKey, ndx: usize) {
        self.select_collection(table, col, key);
        self.encoder.collection_erase(ndx);
    }

    /// Records a collection clear.
    pub fn list_clear(&mut self, table: TableKey, col: ColKey, key: ObjKey, old_size: usize) {
        self.select_collection(table, col, key);
        self.encoder.collection_clear(old_size);
    }

    /// Records a new dictionary key.
    pub fn dictionary_insert(
        &mut self,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        ndx: usize,
        dict_key: &str,
        value: &Mixed,
    ) {
        self.select_collection(table, col, key);
        self.encoder.dictionary_insert(ndx, dict_key, value);
    }

    /// Records a dictionary value replacement.
    pub fn dictionary_set(
        &mut self,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        ndx: usize,
        dict_key: &str,
        value: &Mixed,
    ) {
        self.select_collection(table, col, key);
        self.encoder.dictionary_set(ndx, dict_key, value);
    }

    /// Records a dictionary key removal.
    pub fn dictionary_erase(
        &mut self,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        ndx: usize,
        dict_key: &str,
    ) {
        self.select_collection(table, col, key);
        self.encoder.dictionary_erase(ndx, dict_key);
    }
}
