//! Typed collection handles.
//!
//! A handle names one collection by `(table, column, object)` and resolves
//! it again on every call, so it stays valid across commits and advances
//! of the transaction it is used with. Mutations go through
//! [`Transaction`] and are recorded in its changeset.
//!
//! ```rust
//! use vellum_common::config::DbConfig;
//! use vellum_common::types::{ColumnAttrs, ColumnType};
//! use vellum_txn::{collection::List, Db};
//!
//! let db = Db::open(DbConfig::for_testing()).unwrap();
//! let mut tr = db.start_write().unwrap();
//! let t = tr.add_table("t").unwrap();
//! let col = tr.add_column(t, ColumnType::Int, "nums", ColumnAttrs::LIST).unwrap();
//! let obj = tr.create_object(t).unwrap();
//!
//! let nums = List::<i64>::new(t, col, obj);
//! nums.add(&mut tr, 3).unwrap();
//! nums.insert(&mut tr, 0, 1).unwrap();
//! assert_eq!(nums.get_all(&tr).unwrap(), vec![1, 3]);
//! ```

use std::marker::PhantomData;

use vellum_common::types::{ColKey, ColumnAttrs, ColumnType, Mixed, ObjKey, Ref, TableKey};
use vellum_storage::{DictionaryCore, LnkLst, LstCore, SetCore, SlabAlloc, TreeConfig, TreeValue};

use crate::error::{TxnError, TxnResult};
use crate::group::{check_value, element_type_name};
use crate::transaction::Transaction;

/// Runs `$body` with `$t` bound to the storage type of `$col`'s elements.
macro_rules! with_element_type {
    ($col:expr, $t:ident => $body:expr) => {{
        let nullable = $col.is_nullable();
        match $col.column_type() {
            ColumnType::Int if nullable => {
                type $t = Option<i64>;
                $body
            }
            ColumnType::Int => {
                type $t = i64;
                $body
            }
            ColumnType::Bool if nullable => {
                type $t = Option<bool>;
                $body
            }
            ColumnType::Bool => {
                type $t = bool;
                $body
            }
            ColumnType::Double if nullable => {
                type $t = Option<f64>;
                $body
            }
            ColumnType::Double => {
                type $t = f64;
                $body
            }
            ColumnType::String if nullable => {
                type $t = Option<String>;
                $body
            }
            ColumnType::String => {
                type $t = String;
                $body
            }
            ColumnType::Binary if nullable => {
                type $t = Option<Vec<u8>>;
                $body
            }
            ColumnType::Binary => {
                type $t = Vec<u8>;
                $body
            }
            ColumnType::Link => {
                type $t = ObjKey;
                $body
            }
            ColumnType::Mixed | ColumnType::Timestamp | ColumnType::TypedLink => {
                type $t = Mixed;
                $body
            }
        }
    }};
}

fn elements_nullable(col: ColKey) -> bool {
    col.is_nullable() || col.column_type() == ColumnType::Mixed
}

fn check_kind<T: TreeValue>(col: ColKey, kind: ColumnAttrs, what: &str) -> TxnResult<()> {
    if !col.attrs().contains(kind) {
        return Err(TxnError::invalid_column(format!("{col:?} is not a {what} column")));
    }
    let expected = element_type_name(col);
    if expected != T::type_name() {
        return Err(TxnError::type_mismatch(expected, T::type_name()));
    }
    Ok(())
}

fn from_mixed<T: TreeValue>(col: ColKey, value: &Mixed) -> TxnResult<T> {
    T::from_mixed(value).ok_or_else(|| {
        TxnError::type_mismatch(element_type_name(col), format!("{:?}", value.get_type()))
    })
}

fn open_list<T: TreeValue>(
    alloc: &mut SlabAlloc,
    root: Ref,
    config: TreeConfig,
    nullable: bool,
) -> TxnResult<LstCore<T>> {
    Ok(if root.is_null() {
        LstCore::create(alloc, config, nullable)?
    } else {
        LstCore::init_from_ref(alloc, root, config, nullable)?
    })
}

fn open_set<T: TreeValue>(
    alloc: &mut SlabAlloc,
    root: Ref,
    config: TreeConfig,
    nullable: bool,
) -> TxnResult<SetCore<T>> {
    Ok(if root.is_null() {
        SetCore::create(alloc, config, nullable)?
    } else {
        SetCore::init_from_ref(alloc, root, config, nullable)?
    })
}

fn open_dictionary(
    alloc: &mut SlabAlloc,
    root: Ref,
    config: TreeConfig,
) -> TxnResult<DictionaryCore> {
    Ok(if root.is_null() {
        DictionaryCore::create(alloc, config, true)?
    } else {
        DictionaryCore::init_from_ref(alloc, root, config, true)?
    })
}

fn check_link_target(tr: &Transaction, table: TableKey, col: ColKey, key: ObjKey) -> TxnResult<()> {
    let target = tr.link_target(table, col)?;
    if !tr.has_object(target, key)? {
        return Err(TxnError::KeyNotFound { table: target, key });
    }
    Ok(())
}

// =============================================================================
// List
// =============================================================================

/// An ordered list of `T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct List<T> {
    table: TableKey,
    col: ColKey,
    key: ObjKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TreeValue> List<T> {
    /// Handle for the list in `col` of object `key`.
    pub fn new(table: TableKey, col: ColKey, key: ObjKey) -> Self {
        Self {
            table,
            col,
            key,
            _marker: PhantomData,
        }
    }

    fn read(&self, tr: &Transaction) -> TxnResult<Option<LstCore<T>>> {
        check_kind::<T>(self.col, ColumnAttrs::LIST, "list")?;
        let root = tr.collection_root(self.table, self.col, self.key)?;
        if root.is_null() {
            return Ok(None);
        }
        Ok(Some(LstCore::init_from_ref(
            tr.alloc(),
            root,
            tr.tree_config(),
            elements_nullable(self.col),
        )?))
    }

    fn update<R>(
        &self,
        tr: &mut Transaction,
        f: impl FnOnce(&mut SlabAlloc, &mut LstCore<T>, &mut dyn vellum_storage::CollectionHook) -> TxnResult<R>,
    ) -> TxnResult<R> {
        check_kind::<T>(self.col, ColumnAttrs::LIST, "list")?;
        let nullable = elements_nullable(self.col);
        tr.update_collection(self.table, self.col, self.key, |alloc, root, config, hook| {
            let mut list = open_list::<T>(alloc, root, config, nullable)?;
            let out = f(alloc, &mut list, hook)?;
            Ok((list.ref_(), out))
        })
    }

    /// Number of elements.
    pub fn size(&self, tr: &Transaction) -> TxnResult<usize> {
        match self.read(tr)? {
            Some(l) => Ok(l.size(tr.alloc())?),
            None => Ok(0),
        }
    }

    /// Element `ndx`.
    pub fn get(&self, tr: &Transaction, ndx: usize) -> TxnResult<T> {
        match self.read(tr)? {
            Some(l) => Ok(l.get(tr.alloc(), ndx)?),
            None => Err(vellum_storage::StorageError::out_of_bounds(ndx, 0).into()),
        }
    }

    /// Every element in order.
    pub fn get_all(&self, tr: &Transaction) -> TxnResult<Vec<T>> {
        match self.read(tr)? {
            Some(l) => Ok(l.get_all(tr.alloc())?),
            None => Ok(Vec::new()),
        }
    }

    /// Index of the first element equal to `value`.
    pub fn find_first(&self, tr: &Transaction, value: &T) -> TxnResult<Option<usize>> {
        match self.read(tr)? {
            Some(l) => Ok(l.find_first(tr.alloc(), value)?),
            None => Ok(None),
        }
    }

    /// Inserts `value` before element `ndx`.
    pub fn insert(&self, tr: &mut Transaction, ndx: usize, value: T) -> TxnResult<()> {
        self.update(tr, |alloc, l, hook| Ok(l.insert(alloc, hook, ndx, value)?))
    }

    /// Appends `value`.
    pub fn add(&self, tr: &mut Transaction, value: T) -> TxnResult<()> {
        self.update(tr, |alloc, l, hook| Ok(l.add(alloc, hook, value)?))
    }

    /// Overwrites element `ndx` and returns the previous value.
    pub fn set(&self, tr: &mut Transaction, ndx: usize, value: T) -> TxnResult<T> {
        self.update(tr, |alloc, l, hook| Ok(l.set(alloc, hook, ndx, value)?))
    }

    /// Removes element `ndx` and returns it.
    pub fn erase(&self, tr: &mut Transaction, ndx: usize) -> TxnResult<T> {
        self.update(tr, |alloc, l, hook| Ok(l.erase(alloc, hook, ndx)?))
    }

    /// Removes elements `[begin, end)`.
    pub fn remove_range(&self, tr: &mut Transaction, begin: usize, end: usize) -> TxnResult<()> {
        self.update(tr, |alloc, l, hook| Ok(l.remove_range(alloc, hook, begin, end)?))
    }

    /// Moves element `from` to position `to`.
    pub fn move_(&self, tr: &mut Transaction, from: usize, to: usize) -> TxnResult<()> {
        self.update(tr, |alloc, l, hook| Ok(l.move_(alloc, hook, from, to)?))
    }

    /// Swaps elements `a` and `b`.
    pub fn swap(&self, tr: &mut Transaction, a: usize, b: usize) -> TxnResult<()> {
        self.update(tr, |alloc, l, hook| Ok(l.swap(alloc, hook, a, b)?))
    }

    /// Removes every element.
    pub fn clear(&self, tr: &mut Transaction) -> TxnResult<()> {
        self.update(tr, |alloc, l, hook| Ok(l.clear(alloc, hook)?))
    }

    /// Sum of the elements; `None` for non-numeric lists.
    pub fn sum(&self, tr: &Transaction) -> TxnResult<Option<Mixed>> {
        match self.read(tr)? {
            Some(l) => Ok(l.sum(tr.alloc())?),
            None => Ok(None),
        }
    }

    /// Smallest element.
    pub fn min(&self, tr: &Transaction) -> TxnResult<Option<Mixed>> {
        match self.read(tr)? {
            Some(l) => Ok(l.min(tr.alloc())?),
            None => Ok(None),
        }
    }

    /// Largest element.
    pub fn max(&self, tr: &Transaction) -> TxnResult<Option<Mixed>> {
        match self.read(tr)? {
            Some(l) => Ok(l.max(tr.alloc())?),
            None => Ok(None),
        }
    }

    /// Average of the elements.
    pub fn avg(&self, tr: &Transaction) -> TxnResult<Option<Mixed>> {
        match self.read(tr)? {
            Some(l) => Ok(l.avg(tr.alloc())?),
            None => Ok(None),
        }
    }
}

// =============================================================================
// LinkList
// =============================================================================

/// A list of links. Links to tombstones are hidden; indices count only
/// resolved links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkList {
    table: TableKey,
    col: ColKey,
    key: ObjKey,
}

impl LinkList {
    /// Handle for the link list in `col` of object `key`.
    pub fn new(table: TableKey, col: ColKey, key: ObjKey) -> Self {
        Self { table, col, key }
    }

    fn read(&self, tr: &Transaction) -> TxnResult<Option<LnkLst>> {
        check_kind::<ObjKey>(self.col, ColumnAttrs::LIST, "link list")?;
        let root = tr.collection_root(self.table, self.col, self.key)?;
        if root.is_null() {
            return Ok(None);
        }
        Ok(Some(LnkLst::init_from_ref(tr.alloc(), root, tr.tree_config())?))
    }

    fn update<R>(
        &self,
        tr: &mut Transaction,
        f: impl FnOnce(&mut SlabAlloc, &mut LnkLst, &mut dyn vellum_storage::CollectionHook) -> TxnResult<R>,
    ) -> TxnResult<R> {
        check_kind::<ObjKey>(self.col, ColumnAttrs::LIST, "link list")?;
        tr.update_collection(self.table, self.col, self.key, |alloc, root, config, hook| {
            let mut list = if root.is_null() {
                LnkLst::create(alloc, config)?
            } else {
                LnkLst::init_from_ref(alloc, root, config)?
            };
            let out = f(alloc, &mut list, hook)?;
            Ok((list.ref_(), out))
        })
    }

    /// Number of resolved links.
    pub fn size(&self, tr: &Transaction) -> TxnResult<usize> {
        match self.read(tr)? {
            Some(l) => Ok(l.size(tr.alloc())?),
            None => Ok(0),
        }
    }

    /// Link at index `ndx`.
    pub fn get(&self, tr: &Transaction, ndx: usize) -> TxnResult<ObjKey> {
        match self.read(tr)? {
            Some(l) => Ok(l.get(tr.alloc(), ndx)?),
            None => Err(vellum_storage::StorageError::out_of_bounds(ndx, 0).into()),
        }
    }

    /// Every resolved link in order.
    pub fn get_all(&self, tr: &Transaction) -> TxnResult<Vec<ObjKey>> {
        match self.read(tr)? {
            Some(l) => Ok(l.get_all(tr.alloc())?),
            None => Ok(Vec::new()),
        }
    }

    /// Index of the first link to `key`.
    pub fn find_first(&self, tr: &Transaction, key: ObjKey) -> TxnResult<Option<usize>> {
        match self.read(tr)? {
            Some(l) => Ok(l.find_first(tr.alloc(), key)?),
            None => Ok(None),
        }
    }

    /// Returns true if any entry points at a tombstone.
    pub fn has_unresolved(&self, tr: &Transaction) -> TxnResult<bool> {
        match self.read(tr)? {
            Some(l) => Ok(l.has_unresolved(tr.alloc())?),
            None => Ok(false),
        }
    }

    /// Inserts a link to `target` before index `ndx`.
    pub fn insert(&self, tr: &mut Transaction, ndx: usize, target: ObjKey) -> TxnResult<()> {
        check_link_target(tr, self.table, self.col, target)?;
        self.update(tr, |alloc, l, hook| Ok(l.insert(alloc, hook, ndx, target)?))
    }

    /// Appends a link to `target`.
    pub fn add(&self, tr: &mut Transaction, target: ObjKey) -> TxnResult<()> {
        check_link_target(tr, self.table, self.col, target)?;
        self.update(tr, |alloc, l, hook| Ok(l.add(alloc, hook, target)?))
    }

    /// Replaces the link at `ndx`.
    pub fn set(&self, tr: &mut Transaction, ndx: usize, target: ObjKey) -> TxnResult<ObjKey> {
        check_link_target(tr, self.table, self.col, target)?;
        self.update(tr, |alloc, l, hook| Ok(l.set(alloc, hook, ndx, target)?))
    }

    /// Removes the link at `ndx`.
    pub fn erase(&self, tr: &mut Transaction, ndx: usize) -> TxnResult<ObjKey> {
        self.update(tr, |alloc, l, hook| Ok(l.erase(alloc, hook, ndx)?))
    }

    /// Moves the link at `from` to `to`.
    pub fn move_(&self, tr: &mut Transaction, from: usize, to: usize) -> TxnResult<()> {
        self.update(tr, |alloc, l, hook| Ok(l.move_(alloc, hook, from, to)?))
    }

    /// Removes every link, tombstones included.
    pub fn clear(&self, tr: &mut Transaction) -> TxnResult<()> {
        self.update(tr, |alloc, l, hook| Ok(l.clear(alloc, hook)?))
    }
}

// =============================================================================
// Set
// =============================================================================

/// A sorted set of `T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Set<T> {
    table: TableKey,
    col: ColKey,
    key: ObjKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TreeValue> Set<T> {
    /// Handle for the set in `col` of object `key`.
    pub fn new(table: TableKey, col: ColKey, key: ObjKey) -> Self {
        Self {
            table,
            col,
            key,
            _marker: PhantomData,
        }
    }

    fn read(&self, tr: &Transaction) -> TxnResult<Option<SetCore<T>>> {
        check_kind::<T>(self.col, ColumnAttrs::SET, "set")?;
        let root = tr.collection_root(self.table, self.col, self.key)?;
        if root.is_null() {
            return Ok(None);
        }
        Ok(Some(SetCore::init_from_ref(
            tr.alloc(),
            root,
            tr.tree_config(),
            elements_nullable(self.col),
        )?))
    }

    fn update<R>(
        &self,
        tr: &mut Transaction,
        f: impl FnOnce(&mut SlabAlloc, &mut SetCore<T>, &mut dyn vellum_storage::CollectionHook) -> TxnResult<R>,
    ) -> TxnResult<R> {
        check_kind::<T>(self.col, ColumnAttrs::SET, "set")?;
        let nullable = elements_nullable(self.col);
        tr.update_collection(self.table, self.col, self.key, |alloc, root, config, hook| {
            let mut set = open_set::<T>(alloc, root, config, nullable)?;
            let out = f(alloc, &mut set, hook)?;
            Ok((set.ref_(), out))
        })
    }

    fn check_links(&self, tr: &Transaction, values: &[T]) -> TxnResult<()> {
        if self.col.column_type() != ColumnType::Link {
            return Ok(());
        }
        for v in values {
            if let Mixed::Link(k) = v.to_mixed() {
                check_link_target(tr, self.table, self.col, k)?;
            }
        }
        Ok(())
    }

    /// Number of elements.
    pub fn size(&self, tr: &Transaction) -> TxnResult<usize> {
        match self.read(tr)? {
            Some(s) => Ok(s.size(tr.alloc())?),
            None => Ok(0),
        }
    }

    /// Element at sorted position `ndx`.
    pub fn get(&self, tr: &Transaction, ndx: usize) -> TxnResult<T> {
        match self.read(tr)? {
            Some(s) => Ok(s.get(tr.alloc(), ndx)?),
            None => Err(vellum_storage::StorageError::out_of_bounds(ndx, 0).into()),
        }
    }

    /// Every element in sorted order.
    pub fn get_all(&self, tr: &Transaction) -> TxnResult<Vec<T>> {
        match self.read(tr)? {
            Some(s) => Ok(s.get_all(tr.alloc())?),
            None => Ok(Vec::new()),
        }
    }

    /// Position of `value`.
    pub fn find(&self, tr: &Transaction, value: &T) -> TxnResult<Option<usize>> {
        match self.read(tr)? {
            Some(s) => Ok(s.find(tr.alloc(), value)?),
            None => Ok(None),
        }
    }

    /// Returns true if `value` is present.
    pub fn contains(&self, tr: &Transaction, value: &T) -> TxnResult<bool> {
        Ok(self.find(tr, value)?.is_some())
    }

    /// Inserts `value`, returning its position and whether it was added.
    pub fn insert(&self, tr: &mut Transaction, value: T) -> TxnResult<(usize, bool)> {
        self.check_links(tr, std::slice::from_ref(&value))?;
        self.update(tr, |alloc, s, hook| Ok(s.insert(alloc, hook, value)?))
    }

    /// Removes `value`, returning the position it had.
    pub fn erase(&self, tr: &mut Transaction, value: &T) -> TxnResult<Option<usize>> {
        self.update(tr, |alloc, s, hook| Ok(s.erase(alloc, hook, value)?))
    }

    /// Removes every element.
    pub fn clear(&self, tr: &mut Transaction) -> TxnResult<()> {
        self.update(tr, |alloc, s, hook| Ok(s.clear(alloc, hook)?))
    }

    /// Adds every element of `other`.
    pub fn assign_union(&self, tr: &mut Transaction, other: &[T]) -> TxnResult<()> {
        self.check_links(tr, other)?;
        self.update(tr, |alloc, s, hook| Ok(s.assign_union(alloc, hook, other)?))
    }

    /// Keeps only elements also in `other`.
    pub fn assign_intersection(&self, tr: &mut Transaction, other: &[T]) -> TxnResult<()> {
        self.update(tr, |alloc, s, hook| Ok(s.assign_intersection(alloc, hook, other)?))
    }

    /// Removes every element of `other`.
    pub fn assign_difference(&self, tr: &mut Transaction, other: &[T]) -> TxnResult<()> {
        self.update(tr, |alloc, s, hook| Ok(s.assign_difference(alloc, hook, other)?))
    }

    /// Returns true if every element is in `other`.
    pub fn is_subset_of(&self, tr: &Transaction, other: &[T]) -> TxnResult<bool> {
        match self.read(tr)? {
            Some(s) => Ok(s.is_subset_of(tr.alloc(), other)?),
            None => Ok(true),
        }
    }

    /// Sum of the elements.
    pub fn sum(&self, tr: &Transaction) -> TxnResult<Option<Mixed>> {
        match self.read(tr)? {
            Some(s) => Ok(s.sum(tr.alloc())?),
            None => Ok(None),
        }
    }

    /// Smallest element.
    pub fn min(&self, tr: &Transaction) -> TxnResult<Option<Mixed>> {
        match self.read(tr)? {
            Some(s) => Ok(s.min(tr.alloc())?),
            None => Ok(None),
        }
    }

    /// Largest element.
    pub fn max(&self, tr: &Transaction) -> TxnResult<Option<Mixed>> {
        match self.read(tr)? {
            Some(s) => Ok(s.max(tr.alloc())?),
            None => Ok(None),
        }
    }
}

// =============================================================================
// Dictionary
// =============================================================================

/// A dictionary from strings to values of the column's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dictionary {
    table: TableKey,
    col: ColKey,
    key: ObjKey,
}

impl Dictionary {
    /// Handle for the dictionary in `col` of object `key`.
    pub fn new(table: TableKey, col: ColKey, key: ObjKey) -> Self {
        Self { table, col, key }
    }

    fn check(&self) -> TxnResult<()> {
        if !self.col.attrs().contains(ColumnAttrs::DICTIONARY) {
            return Err(TxnError::invalid_column(format!(
                "{:?} is not a dictionary column",
                self.col
            )));
        }
        Ok(())
    }

    fn read(&self, tr: &Transaction) -> TxnResult<Option<DictionaryCore>> {
        self.check()?;
        let root = tr.collection_root(self.table, self.col, self.key)?;
        if root.is_null() {
            return Ok(None);
        }
        Ok(Some(DictionaryCore::init_from_ref(
            tr.alloc(),
            root,
            tr.tree_config(),
            true,
        )?))
    }

    fn update<R>(
        &self,
        tr: &mut Transaction,
        f: impl FnOnce(&mut SlabAlloc, &mut DictionaryCore, &mut dyn vellum_storage::CollectionHook) -> TxnResult<R>,
    ) -> TxnResult<R> {
        self.check()?;
        tr.update_collection(self.table, self.col, self.key, |alloc, root, config, hook| {
            let mut dict = open_dictionary(alloc, root, config)?;
            let out = f(alloc, &mut dict, hook)?;
            Ok((dict.ref_(), out))
        })
    }

    /// Number of entries.
    pub fn size(&self, tr: &Transaction) -> TxnResult<usize> {
        match self.read(tr)? {
            Some(d) => Ok(d.size(tr.alloc())?),
            None => Ok(0),
        }
    }

    /// Value under `key`. A link to a tombstone reads as null.
    pub fn get(&self, tr: &Transaction, key: &str) -> TxnResult<Option<Mixed>> {
        let Some(d) = self.read(tr)? else {
            return Ok(None);
        };
        Ok(d.get(tr.alloc(), key)?.map(|v| match v {
            Mixed::Link(k) if k.is_unresolved() => Mixed::Null,
            v => v,
        }))
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, tr: &Transaction, key: &str) -> TxnResult<bool> {
        match self.read(tr)? {
            Some(d) => Ok(d.contains(tr.alloc(), key)?),
            None => Ok(false),
        }
    }

    /// Every key in sorted order.
    pub fn keys(&self, tr: &Transaction) -> TxnResult<Vec<String>> {
        match self.read(tr)? {
            Some(d) => Ok(d.keys(tr.alloc())?),
            None => Ok(Vec::new()),
        }
    }

    /// Every value in key order.
    pub fn values(&self, tr: &Transaction) -> TxnResult<Vec<Mixed>> {
        match self.read(tr)? {
            Some(d) => Ok(d.values(tr.alloc())?),
            None => Ok(Vec::new()),
        }
    }

    fn check_value(&self, tr: &Transaction, value: &Mixed) -> TxnResult<()> {
        let scalar = ColKey::new(
            0,
            self.col.column_type(),
            if self.col.is_nullable() {
                ColumnAttrs::NULLABLE
            } else {
                ColumnAttrs::NONE
            },
            0,
        );
        check_value(scalar, value)?;
        if let Mixed::Link(k) = value {
            check_link_target(tr, self.table, self.col, *k)?;
        }
        Ok(())
    }

    /// Stores `value` under `key`. Returns the entry's position and true
    /// if the key is new.
    pub fn insert(
        &self,
        tr: &mut Transaction,
        key: &str,
        value: impl Into<Mixed>,
    ) -> TxnResult<(usize, bool)> {
        let value = value.into();
        self.check_value(tr, &value)?;
        self.update(tr, |alloc, d, hook| Ok(d.insert(alloc, hook, key, value)?))
    }

    /// Removes `key`, returning the position it had.
    pub fn erase(&self, tr: &mut Transaction, key: &str) -> TxnResult<usize> {
        self.update(tr, |alloc, d, hook| Ok(d.erase(alloc, hook, key)?))
    }

    /// Removes every entry.
    pub fn clear(&self, tr: &mut Transaction) -> TxnResult<()> {
        self.update(tr, |alloc, d, hook| Ok(d.clear(alloc, hook)?))
    }

    /// Sum of the numeric values.
    pub fn sum(&self, tr: &Transaction) -> TxnResult<Option<Mixed>> {
        match self.read(tr)? {
            Some(d) => Ok(d.sum(tr.alloc())?),
            None => Ok(None),
        }
    }
}

// =============================================================================
// Positional access by column type
// =============================================================================

/// Mutations addressed by physical position with `Mixed` values, as
/// recorded in changesets.
pub(crate) mod any {
    use super::*;

    fn list_update<R>(
        tr: &mut Transaction,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        f: impl FnOnce(&mut SlabAlloc, Ref, TreeConfig, &mut dyn vellum_storage::CollectionHook) -> TxnResult<(Ref, R)>,
    ) -> TxnResult<R> {
        tr.update_collection(table, col, key, f)
    }

    pub(crate) fn insert(
        tr: &mut Transaction,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        ndx: usize,
        value: &Mixed,
    ) -> TxnResult<()> {
        let nullable = elements_nullable(col) && col.column_type() != ColumnType::Link;
        if col.attrs().contains(ColumnAttrs::SET) {
            return with_element_type!(col, E => {
                let v: E = from_mixed(col, value)?;
                list_update(tr, table, col, key, |alloc, root, config, hook| {
                    let mut set = open_set::<E>(alloc, root, config, nullable)?;
                    set.insert(alloc, hook, v)?;
                    Ok((set.ref_(), ()))
                })
            });
        }
        with_element_type!(col, E => {
            let v: E = from_mixed(col, value)?;
            list_update(tr, table, col, key, |alloc, root, config, hook| {
                let mut list = open_list::<E>(alloc, root, config, nullable)?;
                list.insert(alloc, hook, ndx, v)?;
                Ok((list.ref_(), ()))
            })
        })
    }

    pub(crate) fn set(
        tr: &mut Transaction,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        ndx: usize,
        value: &Mixed,
    ) -> TxnResult<()> {
        let nullable = elements_nullable(col) && col.column_type() != ColumnType::Link;
        with_element_type!(col, E => {
            let v: E = from_mixed(col, value)?;
            list_update(tr, table, col, key, |alloc, root, config, hook| {
                let mut list = open_list::<E>(alloc, root, config, nullable)?;
                list.set(alloc, hook, ndx, v)?;
                Ok((list.ref_(), ()))
            })
        })
    }

    pub(crate) fn erase(
        tr: &mut Transaction,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        ndx: usize,
    ) -> TxnResult<()> {
        let nullable = elements_nullable(col) && col.column_type() != ColumnType::Link;
        if col.attrs().contains(ColumnAttrs::DICTIONARY) {
            return list_update(tr, table, col, key, |alloc, root, config, hook| {
                let mut dict = open_dictionary(alloc, root, config)?;
                let (k, _) = dict.get_pair(alloc, ndx)?;
                dict.erase(alloc, hook, &k)?;
                Ok((dict.ref_(), ()))
            });
        }
        if col.attrs().contains(ColumnAttrs::SET) {
            return with_element_type!(col, E => {
                list_update(tr, table, col, key, |alloc, root, config, hook| {
                    let mut set = open_set::<E>(alloc, root, config, nullable)?;
                    let v = set.get(alloc, ndx)?;
                    set.erase(alloc, hook, &v)?;
                    Ok((set.ref_(), ()))
                })
            });
        }
        with_element_type!(col, E => {
            list_update(tr, table, col, key, |alloc, root, config, hook| {
                let mut list = open_list::<E>(alloc, root, config, nullable)?;
                list.erase(alloc, hook, ndx)?;
                Ok((list.ref_(), ()))
            })
        })
    }

    pub(crate) fn move_(
        tr: &mut Transaction,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        from: usize,
        to: usize,
    ) -> TxnResult<()> {
        let nullable = elements_nullable(col) && col.column_type() != ColumnType::Link;
        with_element_type!(col, E => {
            list_update(tr, table, col, key, |alloc, root, config, hook| {
                let mut list = open_list::<E>(alloc, root, config, nullable)?;
                list.move_(alloc, hook, from, to)?;
                Ok((list.ref_(), ()))
            })
        })
    }

    pub(crate) fn swap(
        tr: &mut Transaction,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        a: usize,
        b: usize,
    ) -> TxnResult<()> {
        let nullable = elements_nullable(col) && col.column_type() != ColumnType::Link;
        with_element_type!(col, E => {
            list_update(tr, table, col, key, |alloc, root, config, hook| {
                let mut list = open_list::<E>(alloc, root, config, nullable)?;
                list.swap(alloc, hook, a, b)?;
                Ok((list.ref_(), ()))
            })
        })
    }

    pub(crate) fn clear(tr: &mut Transaction, table: TableKey, col: ColKey, key: ObjKey) -> TxnResult<()> {
        let nullable = elements_nullable(col) && col.column_type() != ColumnType::Link;
        if col.attrs().contains(ColumnAttrs::DICTIONARY) {
            return list_update(tr, table, col, key, |alloc, root, config, hook| {
                let mut dict = open_dictionary(alloc, root, config)?;
                dict.clear(alloc, hook)?;
                Ok((dict.ref_(), ()))
            });
        }
        if col.attrs().contains(ColumnAttrs::SET) {
            return with_element_type!(col, E => {
                list_update(tr, table, col, key, |alloc, root, config, hook| {
                    let mut set = open_set::<E>(alloc, root, config, nullable)?;
                    set.clear(alloc, hook)?;
                    Ok((set.ref_(), ()))
                })
            });
        }
        with_element_type!(col, E => {
            list_update(tr, table, col, key, |alloc, root, config, hook| {
                let mut list = open_list::<E>(alloc, root, config, nullable)?;
                list.clear(alloc, hook)?;
                Ok((list.ref_(), ()))
            })
        })
    }

    pub(crate) fn dictionary_insert(
        tr: &mut Transaction,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        dict_key: &str,
        value: &Mixed,
    ) -> TxnResult<()> {
        let value = value.clone();
        list_update(tr, table, col, key, |alloc, root, config, hook| {
            let mut dict = open_dictionary(alloc, root, config)?;
            dict.insert(alloc, hook, dict_key, value)?;
            Ok((dict.ref_(), ()))
        })
    }

    pub(crate) fn dictionary_erase(
        tr: &mut Transaction,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        dict_key: &str,
    ) -> TxnResult<()> {
        list_update(tr, table, col, key, |alloc, root, config, hook| {
            let mut dict = open_dictionary(alloc, root, config)?;
            dict.erase(alloc, hook, dict_key)?;
            Ok((dict.ref_(), ()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use vellum_common::config::DbConfig;

    fn setup(ty: ColumnType, attrs: ColumnAttrs) -> (Db, Transaction, TableKey, ColKey, ObjKey) {
        let db = Db::open(DbConfig::for_testing()).unwrap();
        let mut tr = db.start_write().unwrap();
        let t = tr.add_table("t").unwrap();
        let col = tr.add_column(t, ty, "c", attrs).unwrap();
        let obj = tr.create_object(t).unwrap();
        (db, tr, t, col, obj)
    }

    #[test]
    fn test_list_operations() {
        let (_db, mut tr, t, col, obj) = setup(ColumnType::Int, ColumnAttrs::LIST);
        let list = List::<i64>::new(t, col, obj);
        assert_eq!(list.size(&tr).unwrap(), 0);
        for v in [5, 1, 4, 2, 3] {
            list.add(&mut tr, v).unwrap();
        }
        list.move_(&mut tr, 0, 4).unwrap();
        assert_eq!(list.get_all(&tr).unwrap(), vec![1, 4, 2, 3, 5]);
        list.swap(&mut tr, 1, 2).unwrap();
        assert_eq!(list.set(&mut tr, 0, 10).unwrap(), 1);
        assert_eq!(list.erase(&mut tr, 4).unwrap(), 5);
        assert_eq!(list.get_all(&tr).unwrap(), vec![10, 2, 4, 3]);
        assert_eq!(list.sum(&tr).unwrap(), Some(Mixed::Int(19)));
        list.remove_range(&mut tr, 1, 3).unwrap();
        assert_eq!(list.get_all(&tr).unwrap(), vec![10, 3]);
        list.clear(&mut tr).unwrap();
        assert_eq!(list.size(&tr).unwrap(), 0);
    }

    #[test]
    fn test_list_type_is_checked() {
        let (_db, mut tr, t, col, obj) = setup(ColumnType::Int, ColumnAttrs::LIST);
        let wrong = List::<String>::new(t, col, obj);
        assert!(matches!(
            wrong.add(&mut tr, "x".into()),
            Err(TxnError::TypeMismatch { .. })
        ));
        let nullable = List::<Option<i64>>::new(t, col, obj);
        assert!(nullable.size(&tr).is_err());
        let set = Set::<i64>::new(t, col, obj);
        assert!(matches!(set.size(&tr), Err(TxnError::InvalidColumnKey(_))));
    }

    #[test]
    fn test_nullable_list() {
        let (_db, mut tr, t, col, obj) = setup(
            ColumnType::String,
            ColumnAttrs::LIST.union(ColumnAttrs::NULLABLE),
        );
        let list = List::<Option<String>>::new(t, col, obj);
        list.add(&mut tr, None).unwrap();
        list.add(&mut tr, Some("a".into())).unwrap();
        assert_eq!(list.get_all(&tr).unwrap(), vec![None, Some("a".to_string())]);
    }

    #[test]
    fn test_set_stays_sorted() {
        let (_db, mut tr, t, col, obj) = setup(ColumnType::Int, ColumnAttrs::SET);
        let set = Set::<i64>::new(t, col, obj);
        assert_eq!(set.insert(&mut tr, 3).unwrap(), (0, true));
        assert_eq!(set.insert(&mut tr, 1).unwrap(), (0, true));
        assert_eq!(set.insert(&mut tr, 3).unwrap(), (1, false));
        set.assign_union(&mut tr, &[2, 7]).unwrap();
        assert_eq!(set.get_all(&tr).unwrap(), vec![1, 2, 3, 7]);
        set.assign_intersection(&mut tr, &[1, 3, 9]).unwrap();
        assert_eq!(set.get_all(&tr).unwrap(), vec![1, 3]);
        assert!(set.is_subset_of(&tr, &[1, 2, 3]).unwrap());
        assert_eq!(set.erase(&mut tr, &1).unwrap(), Some(0));
        assert_eq!(set.erase(&mut tr, &1).unwrap(), None);
    }

    #[test]
    fn test_dictionary() {
        let (_db, mut tr, t, col, obj) = setup(
            ColumnType::Int,
            ColumnAttrs::DICTIONARY.union(ColumnAttrs::NULLABLE),
        );
        let dict = Dictionary::new(t, col, obj);
        assert_eq!(dict.insert(&mut tr, "b", 2_i64).unwrap(), (0, true));
        assert_eq!(dict.insert(&mut tr, "a", 1_i64).unwrap(), (0, true));
        assert_eq!(dict.insert(&mut tr, "b", 5_i64).unwrap(), (1, false));
        assert!(dict.insert(&mut tr, "c", "text").is_err());
        dict.insert(&mut tr, "n", Mixed::Null).unwrap();
        assert_eq!(dict.keys(&tr).unwrap(), vec!["a", "b", "n"]);
        assert_eq!(dict.get(&tr, "b").unwrap(), Some(Mixed::Int(5)));
        assert_eq!(dict.sum(&tr).unwrap(), Some(Mixed::Int(6)));
        assert_eq!(dict.erase(&mut tr, "a").unwrap(), 0);
        assert!(matches!(
            dict.erase(&mut tr, "a"),
            Err(TxnError::Storage(_))
        ));
    }

    #[test]
    fn test_link_list_checks_target() {
        let db = Db::open(DbConfig::for_testing()).unwrap();
        let mut tr = db.start_write().unwrap();
        let a = tr.add_table("a").unwrap();
        let b = tr.add_table("b").unwrap();
        let col = tr.add_link_column(a, "bs", b, ColumnAttrs::LIST).unwrap();
        let owner = tr.create_object(a).unwrap();
        let target = tr.create_object(b).unwrap();
        let list = LinkList::new(a, col, owner);
        assert!(matches!(
            list.add(&mut tr, ObjKey::new(99)),
            Err(TxnError::KeyNotFound { .. })
        ));
        list.add(&mut tr, target).unwrap();
        assert_eq!(list.find_first(&tr, target).unwrap(), Some(0));
        assert!(!list.has_unresolved(&tr).unwrap());
    }

    #[test]
    fn test_positional_access() {
        let (_db, mut tr, t, col, obj) = setup(ColumnType::Mixed, ColumnAttrs::LIST);
        any::insert(&mut tr, t, col, obj, 0, &Mixed::Int(1)).unwrap();
        any::insert(&mut tr, t, col, obj, 1, &Mixed::from("two")).unwrap();
        any::swap(&mut tr, t, col, obj, 0, 1).unwrap();
        any::set(&mut tr, t, col, obj, 1, &Mixed::Null).unwrap();
        let list = List::<Mixed>::new(t, col, obj);
        assert_eq!(list.get_all(&tr).unwrap(), vec![Mixed::from("two"), Mixed::Null]);
        any::erase(&mut tr, t, col, obj, 0).unwrap();
        any::clear(&mut tr, t, col, obj).unwrap();
        assert_eq!(list.size(&tr).unwrap(), 0);
    }
}
