//! Columns, objects and values of one table.
//!
//! ```text
//! table top
//! ├─ 0 table key       tagged
//! ├─ 1 column keys     Normal, raw ColKey per column index (NULL if removed)
//! ├─ 2 column names    BPlusTree<String>
//! ├─ 3 link targets    Normal, target TableKey per column (-1 if none)
//! ├─ 4 object keys     BPlusTree<ObjKey>, insertion order
//! ├─ 5 column values   HasRefs, one tree per column, parallel to the keys
//! ├─ 6 next key        tagged
//! └─ 7 next column tag tagged
//! ```
//!
//! Scalar columns store `Mixed` values. Collection columns store the ref of
//! each object's collection, null until the collection is first written.

use vellum_common::types::{
    ColKey, ColumnAttrs, ColumnType, Mixed, ObjKey, Ref, TableKey, Timestamp,
};
use vellum_storage::{Array, ArrayType, BPlusTree, RefOrTagged, SlabAlloc, TreeConfig};

use super::{get_tagged, read_tree, set_tagged, update_array, update_tree, Group};
use crate::error::{TxnError, TxnResult};

// slot 0 holds the table key, tagged
const T_COL_KEYS: usize = 1;
const T_COL_NAMES: usize = 2;
const T_COL_TARGETS: usize = 3;
const T_OBJ_KEYS: usize = 4;
const T_COLUMNS: usize = 5;
const T_NEXT_KEY: usize = 6;
const T_NEXT_TAG: usize = 7;

pub(super) fn create_table(
    alloc: &mut SlabAlloc,
    table: TableKey,
    config: TreeConfig,
) -> TxnResult<Ref> {
    let col_keys = Array::create_empty(alloc, ArrayType::Normal)?;
    let col_names = BPlusTree::<String>::create(alloc, config)?;
    let targets = Array::create_empty(alloc, ArrayType::Normal)?;
    let obj_keys = BPlusTree::<ObjKey>::create(alloc, config)?;
    let columns = Array::create_empty(alloc, ArrayType::HasRefs)?;

    let mut top = Array::create_empty(alloc, ArrayType::HasRefs)?;
    top.add(
        alloc,
        RefOrTagged::make_tagged(u64::from(table.value())).to_slot(),
    )?;
    top.add(alloc, col_keys.ref_().to_slot())?;
    top.add(alloc, col_names.ref_().to_slot())?;
    top.add(alloc, targets.ref_().to_slot())?;
    top.add(alloc, obj_keys.ref_().to_slot())?;
    top.add(alloc, columns.ref_().to_slot())?;
    top.add(alloc, RefOrTagged::make_tagged(0).to_slot())?;
    top.add(alloc, RefOrTagged::make_tagged(0).to_slot())?;
    Ok(top.ref_())
}

/// Value a new object starts with in a scalar column.
pub(crate) fn default_value(col: ColKey) -> Mixed {
    if col.is_nullable() {
        return Mixed::Null;
    }
    match col.column_type() {
        ColumnType::Int => Mixed::Int(0),
        ColumnType::Bool => Mixed::Bool(false),
        ColumnType::Double => Mixed::Double(0.0),
        ColumnType::String => Mixed::String(String::new()),
        ColumnType::Binary => Mixed::Binary(Vec::new()),
        ColumnType::Timestamp => Mixed::Timestamp(Timestamp::new(0, 0)),
        ColumnType::Mixed | ColumnType::Link | ColumnType::TypedLink => Mixed::Null,
    }
}

/// Name of the storage type of a collection column's elements, matching
/// `TreeValue::type_name` of the element type.
pub(crate) fn element_type_name(col: ColKey) -> &'static str {
    let nullable = col.is_nullable();
    match col.column_type() {
        ColumnType::Int if nullable => "Int?",
        ColumnType::Int => "Int",
        ColumnType::Bool if nullable => "Bool?",
        ColumnType::Bool => "Bool",
        ColumnType::Double if nullable => "Double?",
        ColumnType::Double => "Double",
        ColumnType::String if nullable => "String?",
        ColumnType::String => "String",
        ColumnType::Binary if nullable => "Binary?",
        ColumnType::Binary => "Binary",
        ColumnType::Link => "Link",
        ColumnType::Mixed | ColumnType::Timestamp | ColumnType::TypedLink => "Mixed",
    }
}

/// Checks that `value` may be stored in scalar column `col`.
pub(crate) fn check_value(col: ColKey, value: &Mixed) -> TxnResult<()> {
    let ty = col.column_type();
    let ok = match value {
        Mixed::Null => col.is_nullable() || matches!(ty, ColumnType::Link | ColumnType::Mixed),
        Mixed::Int(_) => matches!(ty, ColumnType::Int),
        Mixed::Bool(_) => matches!(ty, ColumnType::Bool),
        Mixed::Double(_) => matches!(ty, ColumnType::Double),
        Mixed::String(_) => matches!(ty, ColumnType::String),
        Mixed::Binary(_) => matches!(ty, ColumnType::Binary),
        Mixed::Timestamp(_) => matches!(ty, ColumnType::Timestamp),
        Mixed::Link(_) => matches!(ty, ColumnType::Link),
        Mixed::TypedLink(_) => matches!(ty, ColumnType::TypedLink),
    } || (ty == ColumnType::Mixed && !matches!(value, Mixed::Link(_)));
    if ok {
        Ok(())
    } else {
        Err(TxnError::type_mismatch(
            format!("{ty:?}"),
            format!("{:?}", value.get_type()),
        ))
    }
}

impl Group {
    // =========================================================================
    // Columns
    // =========================================================================

    fn col_keys(&self, alloc: &SlabAlloc, table: TableKey) -> TxnResult<(Array, Array)> {
        let top = self.table_array(alloc, table)?;
        let keys = Array::init_from_ref(alloc, top.get_ref(alloc, T_COL_KEYS))?;
        Ok((top, keys))
    }

    fn check_column(alloc: &SlabAlloc, col_keys: &Array, col: ColKey) -> TxnResult<()> {
        let ndx = col.index();
        if !col.is_valid() || ndx >= col_keys.size() || col_keys.get(alloc, ndx) != col.value() {
            return Err(TxnError::invalid_column(format!("{col:?}")));
        }
        Ok(())
    }

    /// Fails unless `col` is a live column of `table`.
    pub fn validate_column(&self, alloc: &SlabAlloc, table: TableKey, col: ColKey) -> TxnResult<()> {
        let (_, keys) = self.col_keys(alloc, table)?;
        Self::check_column(alloc, &keys, col)
    }

    /// Keys of the live columns of `table`, in index order.
    pub fn column_keys(&self, alloc: &SlabAlloc, table: TableKey) -> TxnResult<Vec<ColKey>> {
        let (_, keys) = self.col_keys(alloc, table)?;
        Ok(keys
            .get_all(alloc)
            .into_iter()
            .map(ColKey::from_raw)
            .filter(|c| c.is_valid())
            .collect())
    }

    /// Name of column `col`.
    pub fn column_name(&self, alloc: &SlabAlloc, table: TableKey, col: ColKey) -> TxnResult<String> {
        let (top, keys) = self.col_keys(alloc, table)?;
        Self::check_column(alloc, &keys, col)?;
        let names: BPlusTree<String> = read_tree(alloc, &top, T_COL_NAMES, self.config)?;
        Ok(names.get(alloc, col.index())?)
    }

    /// Column of `table` called `name`.
    pub fn find_column(
        &self,
        alloc: &SlabAlloc,
        table: TableKey,
        name: &str,
    ) -> TxnResult<Option<ColKey>> {
        if name.is_empty() {
            return Ok(None);
        }
        let (top, keys) = self.col_keys(alloc, table)?;
        let names: BPlusTree<String> = read_tree(alloc, &top, T_COL_NAMES, self.config)?;
        Ok(names
            .find_first(alloc, &name.to_string())?
            .map(|i| ColKey::from_raw(keys.get(alloc, i))))
    }

    /// Target table of link column `col`, `TableKey::NULL` for other columns.
    pub fn link_target(&self, alloc: &SlabAlloc, table: TableKey, col: ColKey) -> TxnResult<TableKey> {
        let (top, keys) = self.col_keys(alloc, table)?;
        Self::check_column(alloc, &keys, col)?;
        let targets = Array::init_from_ref(alloc, top.get_ref(alloc, T_COL_TARGETS))?;
        let raw = targets.get(alloc, col.index());
        Ok(if raw < 0 {
            TableKey::NULL
        } else {
            TableKey::new(raw as u32)
        })
    }

    /// Link columns of `table` whose target is `target`.
    pub(crate) fn link_columns_into(
        &self,
        alloc: &SlabAlloc,
        table: TableKey,
        target: TableKey,
    ) -> TxnResult<Vec<ColKey>> {
        let mut out = Vec::new();
        for col in self.column_keys(alloc, table)? {
            if col.column_type() == ColumnType::Link && self.link_target(alloc, table, col)? == target {
                out.push(col);
            }
        }
        Ok(out)
    }

    /// Builds the key the next added column of `table` receives.
    pub(crate) fn next_column_key(
        &self,
        alloc: &SlabAlloc,
        table: TableKey,
        ty: ColumnType,
        attrs: ColumnAttrs,
    ) -> TxnResult<ColKey> {
        let (top, keys) = self.col_keys(alloc, table)?;
        let ndx = keys.size();
        if ndx > usize::from(u16::MAX) {
            return Err(TxnError::illegal(format!("table {table} has too many columns")));
        }
        let tag = get_tagged(alloc, &top, T_NEXT_TAG) as u32;
        Ok(ColKey::new(ndx as u16, ty, attrs, tag))
    }

    /// Adds column `col` to `table`. Every existing object gets the
    /// column's default value, or no collection.
    pub(crate) fn insert_column(
        &mut self,
        alloc: &mut SlabAlloc,
        table: TableKey,
        col: ColKey,
        name: &str,
        target: TableKey,
    ) -> TxnResult<()> {
        if name.is_empty() {
            return Err(TxnError::illegal("column name must not be empty"));
        }
        if self.find_column(alloc, table, name)?.is_some() {
            return Err(TxnError::illegal(format!("column name '{name}' in use")));
        }
        if col.column_type() == ColumnType::Link && !self.has_table(alloc, target) {
            return Err(TxnError::NoSuchTable(target.to_string()));
        }
        let (_, keys) = self.col_keys(alloc, table)?;
        let ndx = col.index();
        if !col.is_valid() || (ndx < keys.size() && ColKey::from_raw(keys.get(alloc, ndx)).is_valid()) {
            return Err(TxnError::invalid_column(format!("{col:?} already in use")));
        }
        let objects = self.table_size(alloc, table)?;
        let config = self.config;
        let target_raw = if target.is_valid() {
            i64::from(target.value())
        } else {
            -1
        };

        self.update_table(alloc, table, |alloc, top| {
            let values = if col.is_collection() {
                let mut tree = BPlusTree::<Ref>::create(alloc, config)?;
                for _ in 0..objects {
                    tree.add(alloc, &Ref::NULL)?;
                }
                tree.ref_()
            } else {
                let mut tree = BPlusTree::<Mixed>::create(alloc, config)?;
                let value = default_value(col);
                for _ in 0..objects {
                    tree.add(alloc, &value)?;
                }
                tree.ref_()
            };
            update_array(alloc, top, T_COL_KEYS, |alloc, keys| {
                while keys.size() <= ndx {
                    keys.add(alloc, ColKey::NULL.value())?;
                }
                keys.set(alloc, ndx, col.value())?;
                Ok(())
            })?;
            update_tree::<String, _>(alloc, top, T_COL_NAMES, config, |alloc, names| {
                while names.size(alloc)? <= ndx {
                    names.add(alloc, &String::new())?;
                }
                names.set(alloc, ndx, &name.to_string())?;
                Ok(())
            })?;
            update_array(alloc, top, T_COL_TARGETS, |alloc, targets| {
                while targets.size() <= ndx {
                    targets.add(alloc, -1)?;
                }
                targets.set(alloc, ndx, target_raw)?;
                Ok(())
            })?;
            update_array(alloc, top, T_COLUMNS, |alloc, columns| {
                while columns.size() <= ndx {
                    columns.add(alloc, Ref::NULL.to_slot())?;
                }
                columns.set_ref(alloc, ndx, values)?;
                Ok(())
            })?;
            let next_tag = get_tagged(alloc, top, T_NEXT_TAG).max(u64::from(col.tag()) + 1);
            set_tagged(alloc, top, T_NEXT_TAG, next_tag)
        })
    }

    /// Removes column `col` and frees its values. The index stays unused.
    pub(crate) fn remove_column(
        &mut self,
        alloc: &mut SlabAlloc,
        table: TableKey,
        col: ColKey,
    ) -> TxnResult<()> {
        self.validate_column(alloc, table, col)?;
        let ndx = col.index();
        let config = self.config;
        self.update_table(alloc, table, |alloc, top| {
            update_array(alloc, top, T_COLUMNS, |alloc, columns| {
                let values = columns.get_ref(alloc, ndx);
                vellum_storage::array::destroy_deep(alloc, values)?;
                columns.set_ref(alloc, ndx, Ref::NULL)?;
                Ok(())
            })?;
            update_array(alloc, top, T_COL_KEYS, |alloc, keys| {
                keys.set(alloc, ndx, ColKey::NULL.value())?;
                Ok(())
            })?;
            update_array(alloc, top, T_COL_TARGETS, |alloc, targets| {
                targets.set(alloc, ndx, -1)?;
                Ok(())
            })?;
            update_tree::<String, _>(alloc, top, T_COL_NAMES, config, |alloc, names| {
                names.set(alloc, ndx, &String::new())?;
                Ok(())
            })
        })
    }

    /// Renames column `col`.
    pub(crate) fn rename_column(
        &mut self,
        alloc: &mut SlabAlloc,
        table: TableKey,
        col: ColKey,
        name: &str,
    ) -> TxnResult<()> {
        self.validate_column(alloc, table, col)?;
        if name.is_empty() {
            return Err(TxnError::illegal("column name must not be empty"));
        }
        match self.find_column(alloc, table, name)? {
            Some(c) if c == col => return Ok(()),
            Some(_) => return Err(TxnError::illegal(format!("column name '{name}' in use"))),
            None => {}
        }
        let config = self.config;
        self.update_table(alloc, table, |alloc, top| {
            update_tree::<String, _>(alloc, top, T_COL_NAMES, config, |alloc, names| {
                names.set(alloc, col.index(), &name.to_string())?;
                Ok(())
            })
        })
    }

    /// Points link column `col` at another table.
    pub(crate) fn set_link_target(
        &mut self,
        alloc: &mut SlabAlloc,
        table: TableKey,
        col: ColKey,
        target: TableKey,
    ) -> TxnResult<()> {
        self.validate_column(alloc, table, col)?;
        if !matches!(col.column_type(), ColumnType::Link | ColumnType::TypedLink) {
            return Err(TxnError::invalid_column(format!("{col:?} is not a link column")));
        }
        if target.is_valid() && !self.has_table(alloc, target) {
            return Err(TxnError::NoSuchTable(target.to_string()));
        }
        let raw = if target.is_valid() {
            i64::from(target.value())
        } else {
            -1
        };
        self.update_table(alloc, table, |alloc, top| {
            update_array(alloc, top, T_COL_TARGETS, |alloc, targets| {
                targets.set(alloc, col.index(), raw)?;
                Ok(())
            })
        })
    }

    // =========================================================================
    // Objects
    // =========================================================================

    fn obj_keys(&self, alloc: &SlabAlloc, table: TableKey) -> TxnResult<BPlusTree<ObjKey>> {
        let top = self.table_array(alloc, table)?;
        read_tree(alloc, &top, T_OBJ_KEYS, self.config)
    }

    /// Number of objects in `table`.
    pub fn table_size(&self, alloc: &SlabAlloc, table: TableKey) -> TxnResult<usize> {
        Ok(self.obj_keys(alloc, table)?.size(alloc)?)
    }

    /// Keys of every object in `table`, in insertion order.
    pub fn object_keys(&self, alloc: &SlabAlloc, table: TableKey) -> TxnResult<Vec<ObjKey>> {
        Ok(self.obj_keys(alloc, table)?.get_all(alloc)?)
    }

    /// Position of object `key`, if it exists.
    pub fn row_of(&self, alloc: &SlabAlloc, table: TableKey, key: ObjKey) -> TxnResult<Option<usize>> {
        if !key.is_valid() || key.is_unresolved() {
            return Ok(None);
        }
        Ok(self.obj_keys(alloc, table)?.find_first(alloc, &key)?)
    }

    fn require_row(&self, alloc: &SlabAlloc, table: TableKey, key: ObjKey) -> TxnResult<usize> {
        self.row_of(alloc, table, key)?
            .ok_or(TxnError::KeyNotFound { table, key })
    }

    /// Returns true if object `key` exists.
    pub fn has_object(&self, alloc: &SlabAlloc, table: TableKey, key: ObjKey) -> TxnResult<bool> {
        Ok(self.row_of(alloc, table, key)?.is_some())
    }

    /// Key the next implicitly keyed object of `table` receives.
    pub fn next_object_key(&self, alloc: &SlabAlloc, table: TableKey) -> TxnResult<ObjKey> {
        let top = self.table_array(alloc, table)?;
        Ok(ObjKey::new(get_tagged(alloc, &top, T_NEXT_KEY) as i64))
    }

    /// Appends object `key` with default values.
    pub(crate) fn create_object(
        &mut self,
        alloc: &mut SlabAlloc,
        table: TableKey,
        key: ObjKey,
    ) -> TxnResult<()> {
        if !key.is_valid() || key.is_unresolved() {
            return Err(TxnError::illegal(format!("{key} is not a valid object key")));
        }
        if self.has_object(alloc, table, key)? {
            return Err(TxnError::KeyAlreadyUsed { table, key });
        }
        let cols = self.column_keys(alloc, table)?;
        let config = self.config;
        self.update_table(alloc, table, |alloc, top| {
            update_tree::<ObjKey, _>(alloc, top, T_OBJ_KEYS, config, |alloc, keys| {
                keys.add(alloc, &key)?;
                Ok(())
            })?;
            update_array(alloc, top, T_COLUMNS, |alloc, columns| {
                for col in &cols {
                    if col.is_collection() {
                        update_tree::<Ref, _>(alloc, columns, col.index(), config, |alloc, t| {
                            t.add(alloc, &Ref::NULL)?;
                            Ok(())
                        })?;
                    } else {
                        let value = default_value(*col);
                        update_tree::<Mixed, _>(alloc, columns, col.index(), config, |alloc, t| {
                            t.add(alloc, &value)?;
                            Ok(())
                        })?;
                    }
                }
                Ok(())
            })?;
            let next = get_tagged(alloc, top, T_NEXT_KEY).max(key.value() as u64 + 1);
            set_tagged(alloc, top, T_NEXT_KEY, next)
        })
    }

    /// Removes the row of object `key`, freeing its collections. Links
    /// pointing at it are left to the caller.
    pub(crate) fn erase_object(
        &mut self,
        alloc: &mut SlabAlloc,
        table: TableKey,
        key: ObjKey,
    ) -> TxnResult<()> {
        let row = self.require_row(alloc, table, key)?;
        let cols = self.column_keys(alloc, table)?;
        let config = self.config;
        self.update_table(alloc, table, |alloc, top| {
            update_tree::<ObjKey, _>(alloc, top, T_OBJ_KEYS, config, |alloc, keys| {
                keys.erase(alloc, row)?;
                Ok(())
            })?;
            update_array(alloc, top, T_COLUMNS, |alloc, columns| {
                for col in &cols {
                    if col.is_collection() {
                        update_tree::<Ref, _>(alloc, columns, col.index(), config, |alloc, t| {
                            let r = t.get(alloc, row)?;
                            vellum_storage::array::destroy_deep(alloc, r)?;
                            t.erase(alloc, row)?;
                            Ok(())
                        })?;
                    } else {
                        update_tree::<Mixed, _>(alloc, columns, col.index(), config, |alloc, t| {
                            t.erase(alloc, row)?;
                            Ok(())
                        })?;
                    }
                }
                Ok(())
            })
        })
    }

    /// Removes every object of `table` and returns how many there were.
    pub(crate) fn clear_objects(&mut self, alloc: &mut SlabAlloc, table: TableKey) -> TxnResult<usize> {
        let old_size = self.table_size(alloc, table)?;
        let cols = self.column_keys(alloc, table)?;
        let config = self.config;
        self.update_table(alloc, table, |alloc, top| {
            update_tree::<ObjKey, _>(alloc, top, T_OBJ_KEYS, config, |alloc, keys| {
                keys.clear(alloc)?;
                Ok(())
            })?;
            update_array(alloc, top, T_COLUMNS, |alloc, columns| {
                for col in &cols {
                    if col.is_collection() {
                        update_tree::<Ref, _>(alloc, columns, col.index(), config, |alloc, t| {
                            t.clear(alloc)?;
                            Ok(())
                        })?;
                    } else {
                        update_tree::<Mixed, _>(alloc, columns, col.index(), config, |alloc, t| {
                            t.clear(alloc)?;
                            Ok(())
                        })?;
                    }
                }
                Ok(())
            })
        })?;
        Ok(old_size)
    }

    // =========================================================================
    // Values
    // =========================================================================

    fn scalar_column(&self, alloc: &SlabAlloc, table: TableKey, col: ColKey) -> TxnResult<Array> {
        let (top, keys) = self.col_keys(alloc, table)?;
        Self::check_column(alloc, &keys, col)?;
        if col.is_collection() {
            return Err(TxnError::invalid_column(format!("{col:?} is a collection column")));
        }
        Ok(top)
    }

    /// Stored value of scalar column `col`, links to tombstones included.
    pub fn get_raw(
        &self,
        alloc: &SlabAlloc,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
    ) -> TxnResult<Mixed> {
        let top = self.scalar_column(alloc, table, col)?;
        let row = self.require_row(alloc, table, key)?;
        let columns = Array::init_from_ref(alloc, top.get_ref(alloc, T_COLUMNS))?;
        let values: BPlusTree<Mixed> = read_tree(alloc, &columns, col.index(), self.config)?;
        Ok(values.get(alloc, row)?)
    }

    /// Value of scalar column `col`. A link to a tombstone reads as null.
    pub fn get_value(
        &self,
        alloc: &SlabAlloc,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
    ) -> TxnResult<Mixed> {
        Ok(match self.get_raw(alloc, table, col, key)? {
            Mixed::Link(k) if k.is_unresolved() => Mixed::Null,
            v => v,
        })
    }

    /// Overwrites scalar column `col`. Type and link targets are checked.
    pub(crate) fn set_value(
        &mut self,
        alloc: &mut SlabAlloc,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        value: Mixed,
    ) -> TxnResult<()> {
        self.scalar_column(alloc, table, col)?;
        check_value(col, &value)?;
        if let Mixed::Link(target_key) = value {
            if !target_key.is_unresolved() {
                let target = self.link_target(alloc, table, col)?;
                if !self.has_object(alloc, target, target_key)? {
                    return Err(TxnError::KeyNotFound {
                        table: target,
                        key: target_key,
                    });
                }
            }
        }
        let row = self.require_row(alloc, table, key)?;
        let config = self.config;
        self.update_table(alloc, table, |alloc, top| {
            update_array(alloc, top, T_COLUMNS, |alloc, columns| {
                update_tree::<Mixed, _>(alloc, columns, col.index(), config, |alloc, t| {
                    t.set(alloc, row, &value)?;
                    Ok(())
                })
            })
        })
    }

    // =========================================================================
    // Collections
    // =========================================================================

    fn collection_column(&self, alloc: &SlabAlloc, table: TableKey, col: ColKey) -> TxnResult<Array> {
        let (top, keys) = self.col_keys(alloc, table)?;
        Self::check_column(alloc, &keys, col)?;
        if !col.is_collection() {
            return Err(TxnError::invalid_column(format!("{col:?} is not a collection column")));
        }
        Ok(top)
    }

    /// Ref of the collection of object `key` in column `col`, null if it
    /// was never written.
    pub fn collection_ref(
        &self,
        alloc: &SlabAlloc,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
    ) -> TxnResult<Ref> {
        let top = self.collection_column(alloc, table, col)?;
        let row = self.require_row(alloc, table, key)?;
        let columns = Array::init_from_ref(alloc, top.get_ref(alloc, T_COLUMNS))?;
        let refs: BPlusTree<Ref> = read_tree(alloc, &columns, col.index(), self.config)?;
        Ok(refs.get(alloc, row)?)
    }

    /// Runs `f` on the collection of object `key` and stores the root it
    /// returns.
    pub(crate) fn update_collection<R>(
        &mut self,
        alloc: &mut SlabAlloc,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        f: impl FnOnce(&mut SlabAlloc, Ref) -> TxnResult<(Ref, R)>,
    ) -> TxnResult<R> {
        self.collection_column(alloc, table, col)?;
        let row = self.require_row(alloc, table, key)?;
        let config = self.config;
        self.update_table(alloc, table, |alloc, top| {
            update_array(alloc, top, T_COLUMNS, |alloc, columns| {
                update_tree::<Ref, _>(alloc, columns, col.index(), config, |alloc, refs| {
                    let old = refs.get(alloc, row)?;
                    let (new, out) = f(alloc, old)?;
                    if new != old {
                        refs.set(alloc, row, &new)?;
                    }
                    Ok(out)
                })
            })
        })
    }

    /// Objects of `table` whose non-null collection in `col` exists.
    pub(crate) fn objects_with_collection(
        &self,
        alloc: &SlabAlloc,
        table: TableKey,
        col: ColKey,
    ) -> TxnResult<Vec<(ObjKey, Ref)>> {
        let top = self.collection_column(alloc, table, col)?;
        let keys = self.obj_keys(alloc, table)?.get_all(alloc)?;
        let columns = Array::init_from_ref(alloc, top.get_ref(alloc, T_COLUMNS))?;
        let refs: BPlusTree<Ref> = read_tree(alloc, &columns, col.index(), self.config)?;
        Ok(keys
            .into_iter()
            .zip(refs.get_all(alloc)?)
            .filter(|(_, r)| !r.is_null())
            .collect())
    }

    /// Objects of `table` whose scalar link in `col` is `target_key`.
    pub(crate) fn objects_linking_to(
        &self,
        alloc: &SlabAlloc,
        table: TableKey,
        col: ColKey,
        target_key: ObjKey,
    ) -> TxnResult<Vec<ObjKey>> {
        let top = self.scalar_column(alloc, table, col)?;
        let keys = self.obj_keys(alloc, table)?.get_all(alloc)?;
        let columns = Array::init_from_ref(alloc, top.get_ref(alloc, T_COLUMNS))?;
        let values: BPlusTree<Mixed> = read_tree(alloc, &columns, col.index(), self.config)?;
        let rows = values.find_all(alloc, &Mixed::Link(target_key))?;
        Ok(rows.into_iter().map(|r| keys[r]).collect())
    }
}
