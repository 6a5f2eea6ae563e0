//! The object store of one snapshot.
//!
//! A [`Group`] is an accessor for the top array of a snapshot. Everything
//! below it is addressed by stable keys rather than by pointers: tables by
//! [`TableKey`], columns by [`ColKey`], objects by [`ObjKey`]. Each
//! operation resolves its path from the top array again, and writes copy
//! every node on the path before updating the parent slot, so an accessor
//! can never observe a detached node.
//!
//! # Layout
//!
//! ```text
//! top
//! ├─ 0 tables          HasRefs, one table top per TableKey (null if removed)
//! ├─ 1 table names     BPlusTree<String>, parallel to tables
//! ├─ 2 version         tagged
//! ├─ 3 history         BPlusTree<Vec<u8>> of changesets, or null
//! ├─ 4 history type    tagged
//! ├─ 5 history schema  tagged
//! └─ 6 history base    tagged, version preceding the first entry
//! ```

mod history;
mod table;

pub(crate) use table::{check_value, element_type_name};

use tracing::debug;
use vellum_common::constants::HISTORY_SCHEMA_VERSION;
use vellum_common::types::{HistoryType, Ref, TableKey};
use vellum_storage::{
    Array, ArrayType, BPlusTree, RefOrTagged, SlabAlloc, TreeConfig, TreeValue,
};

use crate::error::{TxnError, TxnResult};

pub(crate) const TOP_TABLES: usize = 0;
pub(crate) const TOP_TABLE_NAMES: usize = 1;
pub(crate) const TOP_VERSION: usize = 2;
pub(crate) const TOP_HISTORY: usize = 3;
pub(crate) const TOP_HISTORY_TYPE: usize = 4;
pub(crate) const TOP_HISTORY_SCHEMA: usize = 5;
pub(crate) const TOP_HISTORY_BASE: usize = 6;
const TOP_SIZE: usize = 7;

/// Runs `f` on the ref in `parent[ndx]` and stores the ref it returns if
/// it changed.
pub(crate) fn update_slot<R>(
    alloc: &mut SlabAlloc,
    parent: &mut Array,
    ndx: usize,
    f: impl FnOnce(&mut SlabAlloc, Ref) -> TxnResult<(Ref, R)>,
) -> TxnResult<R> {
    let old = parent.get_ref(alloc, ndx);
    let (new, out) = f(alloc, old)?;
    if new != old {
        parent.set_ref(alloc, ndx, new)?;
    }
    Ok(out)
}

/// Runs `f` on the array in `parent[ndx]`.
pub(crate) fn update_array<R>(
    alloc: &mut SlabAlloc,
    parent: &mut Array,
    ndx: usize,
    f: impl FnOnce(&mut SlabAlloc, &mut Array) -> TxnResult<R>,
) -> TxnResult<R> {
    update_slot(alloc, parent, ndx, |alloc, r| {
        let mut array = Array::init_from_ref(alloc, r)?;
        let out = f(alloc, &mut array)?;
        Ok((array.ref_(), out))
    })
}

/// Runs `f` on the tree rooted at `parent[ndx]`.
pub(crate) fn update_tree<T: TreeValue, R>(
    alloc: &mut SlabAlloc,
    parent: &mut Array,
    ndx: usize,
    config: TreeConfig,
    f: impl FnOnce(&mut SlabAlloc, &mut BPlusTree<T>) -> TxnResult<R>,
) -> TxnResult<R> {
    update_slot(alloc, parent, ndx, |alloc, r| {
        let mut tree = BPlusTree::<T>::init_from_ref(alloc, r, config)?;
        let out = f(alloc, &mut tree)?;
        Ok((tree.ref_(), out))
    })
}

pub(crate) fn read_tree<T: TreeValue>(
    alloc: &SlabAlloc,
    parent: &Array,
    ndx: usize,
    config: TreeConfig,
) -> TxnResult<BPlusTree<T>> {
    Ok(BPlusTree::init_from_ref(alloc, parent.get_ref(alloc, ndx), config)?)
}

pub(crate) fn get_tagged(alloc: &SlabAlloc, array: &Array, ndx: usize) -> u64 {
    array.get_as_ref_or_tagged(alloc, ndx).get_as_int()
}

pub(crate) fn set_tagged(
    alloc: &mut SlabAlloc,
    array: &mut Array,
    ndx: usize,
    value: u64,
) -> TxnResult<()> {
    array.set_ref_or_tagged(alloc, ndx, RefOrTagged::make_tagged(value))?;
    Ok(())
}

/// Accessor for the top array of one snapshot.
#[derive(Debug, Clone, Copy)]
pub struct Group {
    top: Array,
    config: TreeConfig,
}

impl Group {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Builds the top array of an empty database.
    pub(crate) fn create(
        alloc: &mut SlabAlloc,
        config: TreeConfig,
        history_type: HistoryType,
    ) -> TxnResult<Self> {
        let tables = Array::create_empty(alloc, ArrayType::HasRefs)?;
        let names = BPlusTree::<String>::create(alloc, config)?;
        let mut top = Array::create_empty(alloc, ArrayType::HasRefs)?;
        top.add(alloc, tables.ref_().to_slot())?;
        top.add(alloc, names.ref_().to_slot())?;
        top.add(alloc, RefOrTagged::make_tagged(0).to_slot())?;
        top.add(alloc, Ref::NULL.to_slot())?;
        top.add(
            alloc,
            RefOrTagged::make_tagged(u64::from(history_type.as_u8())).to_slot(),
        )?;
        top.add(
            alloc,
            RefOrTagged::make_tagged(u64::from(HISTORY_SCHEMA_VERSION)).to_slot(),
        )?;
        top.add(alloc, RefOrTagged::make_tagged(0).to_slot())?;
        debug!(top = ?top.ref_(), ?history_type, "created empty group");
        Ok(Self { top, config })
    }

    /// Attaches to the top array at `top_ref`.
    pub(crate) fn attach(alloc: &SlabAlloc, top_ref: Ref, config: TreeConfig) -> TxnResult<Self> {
        let top = Array::init_from_ref(alloc, top_ref)?;
        if top.size() != TOP_SIZE || !top.has_refs() {
            return Err(TxnError::Corrupted(format!(
                "top array at {top_ref:?} has {} slots",
                top.size()
            )));
        }
        Ok(Self { top, config })
    }

    /// Ref of the top array; changes when a write copies it.
    #[must_use]
    pub fn top_ref(&self) -> Ref {
        self.top.ref_()
    }

    /// Fan-out of every tree in the group.
    #[must_use]
    pub fn tree_config(&self) -> TreeConfig {
        self.config
    }

    /// Version number recorded in this snapshot.
    pub fn version(&self, alloc: &SlabAlloc) -> u64 {
        get_tagged(alloc, &self.top, TOP_VERSION)
    }

    pub(crate) fn set_version(&mut self, alloc: &mut SlabAlloc, version: u64) -> TxnResult<()> {
        set_tagged(alloc, &mut self.top, TOP_VERSION, version)
    }

    // =========================================================================
    // Tables
    // =========================================================================

    fn tables(&self, alloc: &SlabAlloc) -> TxnResult<Array> {
        Ok(Array::init_from_ref(alloc, self.top.get_ref(alloc, TOP_TABLES))?)
    }

    fn table_names(&self, alloc: &SlabAlloc) -> TxnResult<BPlusTree<String>> {
        read_tree(alloc, &self.top, TOP_TABLE_NAMES, self.config)
    }

    /// Keys of every live table, in key order.
    pub fn table_keys(&self, alloc: &SlabAlloc) -> TxnResult<Vec<TableKey>> {
        let tables = self.tables(alloc)?;
        Ok((0..tables.size())
            .filter(|i| !tables.get_ref(alloc, *i).is_null())
            .map(|i| TableKey::new(i as u32))
            .collect())
    }

    /// Returns true if `table` names a live table.
    pub fn has_table(&self, alloc: &SlabAlloc, table: TableKey) -> bool {
        let Ok(tables) = self.tables(alloc) else {
            return false;
        };
        let ndx = table.value() as usize;
        table.is_valid() && ndx < tables.size() && !tables.get_ref(alloc, ndx).is_null()
    }

    pub(crate) fn table_array(&self, alloc: &SlabAlloc, table: TableKey) -> TxnResult<Array> {
        if !self.has_table(alloc, table) {
            return Err(TxnError::NoSuchTable(table.to_string()));
        }
        let tables = self.tables(alloc)?;
        Ok(Array::init_from_ref(
            alloc,
            tables.get_ref(alloc, table.value() as usize),
        )?)
    }

    /// Runs `f` on the top array of `table`, propagating copies upwards.
    pub(crate) fn update_table<R>(
        &mut self,
        alloc: &mut SlabAlloc,
        table: TableKey,
        f: impl FnOnce(&mut SlabAlloc, &mut Array) -> TxnResult<R>,
    ) -> TxnResult<R> {
        if !self.has_table(alloc, table) {
            return Err(TxnError::NoSuchTable(table.to_string()));
        }
        let ndx = table.value() as usize;
        update_array(alloc, &mut self.top, TOP_TABLES, |alloc, tables| {
            update_array(alloc, tables, ndx, f)
        })
    }

    /// Name of `table`.
    pub fn table_name(&self, alloc: &SlabAlloc, table: TableKey) -> TxnResult<String> {
        if !self.has_table(alloc, table) {
            return Err(TxnError::NoSuchTable(table.to_string()));
        }
        Ok(self.table_names(alloc)?.get(alloc, table.value() as usize)?)
    }

    /// Key of the live table called `name`.
    pub fn find_table(&self, alloc: &SlabAlloc, name: &str) -> TxnResult<Option<TableKey>> {
        if name.is_empty() {
            return Ok(None);
        }
        let names = self.table_names(alloc)?;
        Ok(names
            .find_first(alloc, &name.to_string())?
            .map(|i| TableKey::new(i as u32)))
    }

    /// Key the next added table receives.
    pub fn next_table_key(&self, alloc: &SlabAlloc) -> TxnResult<TableKey> {
        Ok(TableKey::new(self.tables(alloc)?.size() as u32))
    }

    /// Creates `table` called `name`. Keys are never reused, so `table` may
    /// lie beyond the end; the gap is filled with removed slots.
    pub(crate) fn insert_table(
        &mut self,
        alloc: &mut SlabAlloc,
        table: TableKey,
        name: &str,
    ) -> TxnResult<()> {
        if name.is_empty() {
            return Err(TxnError::illegal("table name must not be empty"));
        }
        if self.find_table(alloc, name)?.is_some() {
            return Err(TxnError::TableNameInUse(name.to_string()));
        }
        if self.has_table(alloc, table) {
            return Err(TxnError::illegal(format!("table key {table} already in use")));
        }
        let ndx = table.value() as usize;
        let config = self.config;
        let table_top = table::create_table(alloc, table, config)?;
        update_array(alloc, &mut self.top, TOP_TABLES, |alloc, tables| {
            while tables.size() <= ndx {
                tables.add(alloc, Ref::NULL.to_slot())?;
            }
            tables.set_ref(alloc, ndx, table_top)?;
            Ok(())
        })?;
        update_tree::<String, _>(alloc, &mut self.top, TOP_TABLE_NAMES, config, |alloc, names| {
            while names.size(alloc)? <= ndx {
                names.add(alloc, &String::new())?;
            }
            names.set(alloc, ndx, &name.to_string())?;
            Ok(())
        })?;
        debug!(%table, name, "table added");
        Ok(())
    }

    /// Frees `table` and leaves its key unused.
    pub(crate) fn remove_table(&mut self, alloc: &mut SlabAlloc, table: TableKey) -> TxnResult<()> {
        for other in self.table_keys(alloc)? {
            if other == table {
                continue;
            }
            if !self.link_columns_into(alloc, other, table)?.is_empty() {
                return Err(TxnError::illegal(format!(
                    "table {table} is the target of links from table {other}"
                )));
            }
        }
        let ndx = table.value() as usize;
        let table_top = self.table_array(alloc, table)?;
        vellum_storage::array::destroy_deep(alloc, table_top.ref_())?;
        update_array(alloc, &mut self.top, TOP_TABLES, |alloc, tables| {
            tables.set_ref(alloc, ndx, Ref::NULL)?;
            Ok(())
        })?;
        let config = self.config;
        update_tree::<String, _>(alloc, &mut self.top, TOP_TABLE_NAMES, config, |alloc, names| {
            names.set(alloc, ndx, &String::new())?;
            Ok(())
        })?;
        debug!(%table, "table removed");
        Ok(())
    }

    /// Renames `table`.
    pub(crate) fn rename_table(
        &mut self,
        alloc: &mut SlabAlloc,
        table: TableKey,
        name: &str,
    ) -> TxnResult<()> {
        if name.is_empty() {
            return Err(TxnError::illegal("table name must not be empty"));
        }
        match self.find_table(alloc, name)? {
            Some(t) if t == table => return Ok(()),
            Some(_) => return Err(TxnError::TableNameInUse(name.to_string())),
            None => {}
        }
        if !self.has_table(alloc, table) {
            return Err(TxnError::NoSuchTable(table.to_string()));
        }
        let config = self.config;
        update_tree::<String, _>(alloc, &mut self.top, TOP_TABLE_NAMES, config, |alloc, names| {
            names.set(alloc, table.value() as usize, &name.to_string())?;
            Ok(())
        })
    }

    // =========================================================================
    // History slots
    // =========================================================================

    /// History kind recorded in the snapshot.
    pub fn history_type(&self, alloc: &SlabAlloc) -> HistoryType {
        let raw = get_tagged(alloc, &self.top, TOP_HISTORY_TYPE);
        HistoryType::from_u8(raw as u8).unwrap_or_default()
    }

    pub(crate) fn set_history_type(
        &mut self,
        alloc: &mut SlabAlloc,
        history_type: HistoryType,
    ) -> TxnResult<()> {
        set_tagged(
            alloc,
            &mut self.top,
            TOP_HISTORY_TYPE,
            u64::from(history_type.as_u8()),
        )
    }

    /// Schema version of the stored history entries.
    pub fn history_schema_version(&self, alloc: &SlabAlloc) -> u32 {
        get_tagged(alloc, &self.top, TOP_HISTORY_SCHEMA) as u32
    }

    pub(crate) fn set_history_schema_version(
        &mut self,
        alloc: &mut SlabAlloc,
        version: u32,
    ) -> TxnResult<()> {
        set_tagged(alloc, &mut self.top, TOP_HISTORY_SCHEMA, u64::from(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TreeConfig {
        TreeConfig::new(4, 4)
    }

    #[test]
    fn test_tables_keep_their_keys() {
        let mut alloc = SlabAlloc::new_writable();
        let mut group = Group::create(&mut alloc, config(), HistoryType::InRealm).unwrap();

        group.insert_table(&mut alloc, TableKey::new(0), "class_A").unwrap();
        group.insert_table(&mut alloc, TableKey::new(1), "class_B").unwrap();
        group.insert_table(&mut alloc, TableKey::new(4), "class_C").unwrap();
        assert_eq!(
            group.table_keys(&alloc).unwrap(),
            vec![TableKey::new(0), TableKey::new(1), TableKey::new(4)]
        );
        assert_eq!(group.next_table_key(&alloc).unwrap(), TableKey::new(5));

        group.remove_table(&mut alloc, TableKey::new(1)).unwrap();
        assert!(!group.has_table(&alloc, TableKey::new(1)));
        assert_eq!(group.find_table(&alloc, "class_B").unwrap(), None);
        assert_eq!(
            group.find_table(&alloc, "class_C").unwrap(),
            Some(TableKey::new(4))
        );

        assert!(matches!(
            group.insert_table(&mut alloc, TableKey::new(7), "class_A"),
            Err(TxnError::TableNameInUse(_))
        ));
        group.rename_table(&mut alloc, TableKey::new(0), "class_Z").unwrap();
        assert_eq!(group.table_name(&alloc, TableKey::new(0)).unwrap(), "class_Z");
    }

    #[test]
    fn test_top_slots() {
        let mut alloc = SlabAlloc::new_writable();
        let mut group = Group::create(&mut alloc, config(), HistoryType::SyncClient).unwrap();
        assert_eq!(group.version(&alloc), 0);
        assert_eq!(group.history_type(&alloc), HistoryType::SyncClient);
        assert_eq!(group.history_schema_version(&alloc), HISTORY_SCHEMA_VERSION);

        group.set_version(&mut alloc, 41).unwrap();
        let again = Group::attach(&alloc, group.top_ref(), config()).unwrap();
        assert_eq!(again.version(&alloc), 41);
    }
}
