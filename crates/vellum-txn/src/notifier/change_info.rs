//! Collects the changes between two snapshots while a read transaction
//! advances.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use vellum_common::types::{ColKey, Mixed, ObjKey, TableKey};
use vellum_replication::InstructionHandler;

use super::change_builder::CollectionChangeBuilder;

/// Object level changes of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectChangeSet {
    /// Objects created.
    pub insertions: BTreeSet<ObjKey>,
    /// Objects removed that existed before.
    pub deletions: BTreeSet<ObjKey>,
    /// Columns modified per surviving object.
    pub modifications: BTreeMap<ObjKey, BTreeSet<ColKey>>,
    /// The table was cleared at some point.
    pub cleared: bool,
}

impl ObjectChangeSet {
    /// Returns true when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.insertions.is_empty()
            && self.deletions.is_empty()
            && self.modifications.is_empty()
            && !self.cleared
    }

    /// Returns true if `col` of `key` was modified.
    pub fn column_modified(&self, key: ObjKey, col: ColKey) -> bool {
        self.modifications
            .get(&key)
            .map_or(false, |cols| cols.contains(&col))
    }

    fn insert(&mut self, key: ObjKey) {
        self.deletions.remove(&key);
        self.insertions.insert(key);
    }

    fn erase(&mut self, key: ObjKey) {
        self.modifications.remove(&key);
        if !self.insertions.remove(&key) {
            self.deletions.insert(key);
        }
    }

    fn modify(&mut self, key: ObjKey, col: ColKey) {
        if !self.insertions.contains(&key) {
            self.modifications.entry(key).or_default().insert(col);
        }
    }
}

/// Identifies one collection field.
pub type CollectionPath = (TableKey, ColKey, ObjKey);

/// Everything that changed across one advance, grouped by table and by
/// collection.
#[derive(Debug)]
pub struct TransactionChangeInfo {
    tables: HashMap<TableKey, ObjectChangeSet>,
    collections: HashMap<CollectionPath, CollectionChangeBuilder>,
    schema_changed: bool,
    table: TableKey,
    collection: Option<CollectionPath>,
}

impl TransactionChangeInfo {
    /// Creates an empty change record.
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
            collections: HashMap::new(),
            schema_changed: false,
            table: TableKey::NULL,
            collection: None,
        }
    }

    /// Object changes of `table`, if any happened.
    pub fn table(&self, table: TableKey) -> Option<&ObjectChangeSet> {
        self.tables.get(&table)
    }

    /// Tables with object changes.
    pub fn changed_tables(&self) -> impl Iterator<Item = TableKey> + '_ {
        self.tables.keys().copied()
    }

    /// Changes of one collection, if any happened.
    pub fn collection(&self, path: CollectionPath) -> Option<&CollectionChangeBuilder> {
        self.collections.get(&path)
    }

    /// Moves the builder of one collection out.
    pub fn take_collection(&mut self, path: CollectionPath) -> Option<CollectionChangeBuilder> {
        self.collections.remove(&path)
    }

    /// True if a table or column was added, removed or renamed.
    pub fn schema_changed(&self) -> bool {
        self.schema_changed
    }

    /// Returns true when nothing was observed.
    pub fn is_empty(&self) -> bool {
        !self.schema_changed
            && self.tables.values().all(ObjectChangeSet::is_empty)
            && self.collections.values().all(CollectionChangeBuilder::is_empty)
    }

    fn objects(&mut self) -> &mut ObjectChangeSet {
        self.tables.entry(self.table).or_default()
    }

    fn builder(&mut self) -> Option<&mut CollectionChangeBuilder> {
        let path = self.collection?;
        self.tables
            .entry(path.0)
            .or_default()
            .modify(path.2, path.1);
        Some(self.collections.entry(path).or_default())
    }
}

impl Default for TransactionChangeInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl InstructionHandler for TransactionChangeInfo {
    fn insert_group_level_table(&mut self, _table: TableKey, _name: &str) -> bool {
        self.schema_changed = true;
        true
    }

    fn erase_group_level_table(&mut self, table: TableKey) -> bool {
        self.schema_changed = true;
        self.tables.remove(&table);
        self.collections.retain(|path, _| path.0 != table);
        true
    }

    fn rename_group_level_table(&mut self, _table: TableKey, _name: &str) -> bool {
        self.schema_changed = true;
        true
    }

    fn select_table(&mut self, table: TableKey) -> bool {
        self.table = table;
        true
    }

    fn create_object(&mut self, key: ObjKey) -> bool {
        self.objects().insert(key);
        true
    }

    fn remove_object(&mut self, key: ObjKey) -> bool {
        let table = self.table;
        self.objects().erase(key);
        self.collections
            .retain(|path, _| !(path.0 == table && path.2 == key));
        true
    }

    fn clear_table(&mut self, _old_size: usize) -> bool {
        let table = self.table;
        let objects = self.objects();
        let inserted = std::mem::take(&mut objects.insertions);
        let modified: Vec<ObjKey> = std::mem::take(&mut objects.modifications)
            .into_keys()
            .collect();
        objects.cleared = true;
        for key in modified {
            if !inserted.contains(&key) {
                objects.deletions.insert(key);
            }
        }
        self.collections.retain(|path, _| path.0 != table);
        true
    }

    fn modify_object(&mut self, col: ColKey, key: ObjKey, _value: &Mixed) -> bool {
        self.objects().modify(key, col);
        true
    }

    fn insert_column(&mut self, _col: ColKey, _name: &str, _target: TableKey) -> bool {
        self.schema_changed = true;
        true
    }

    fn erase_column(&mut self, col: ColKey) -> bool {
        let table = self.table;
        self.schema_changed = true;
        self.collections
            .retain(|path, _| !(path.0 == table && path.1 == col));
        true
    }

    fn rename_column(&mut self, _col: ColKey, _name: &str) -> bool {
        self.schema_changed = true;
        true
    }

    fn typed_link_change(&mut self, _col: ColKey, _target: TableKey) -> bool {
        self.schema_changed = true;
        true
    }

    fn select_collection(&mut self, col: ColKey, key: ObjKey) -> bool {
        self.collection = Some((self.table, col, key));
        true
    }

    fn collection_insert(&mut self, ndx: usize, _value: &Mixed) -> bool {
        if let Some(b) = self.builder() {
            b.insert(ndx);
        }
        true
    }

    fn collection_set(&mut self, ndx: usize, _value: &Mixed) -> bool {
        if let Some(b) = self.builder() {
            b.modify(ndx);
        }
        true
    }

    fn collection_move(&mut self, from: usize, to: usize) -> bool {
        if let Some(b) = self.builder() {
            b.move_(from, to);
        }
        true
    }

    fn collection_swap(&mut self, a: usize, b: usize) -> bool {
        if let Some(builder) = self.builder() {
            builder.swap(a, b);
        }
        true
    }

    fn collection_erase(&mut self, ndx: usize) -> bool {
        if let Some(b) = self.builder() {
            b.erase(ndx);
        }
        true
    }

    fn collection_clear(&mut self, old_size: usize) -> bool {
        if let Some(b) = self.builder() {
            b.clear(old_size);
        }
        true
    }

    fn dictionary_insert(&mut self, ndx: usize, _key: &str, _value: &Mixed) -> bool {
        if let Some(b) = self.builder() {
            b.insert(ndx);
        }
        true
    }

    fn dictionary_set(&mut self, ndx: usize, _key: &str, _value: &Mixed) -> bool {
        if let Some(b) = self.builder() {
            b.modify(ndx);
        }
        true
    }

    fn dictionary_erase(&mut self, ndx: usize, _key: &str) -> bool {
        if let Some(b) = self.builder() {
            b.erase(ndx);
        }
        true
    }
}
