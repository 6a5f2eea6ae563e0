//! Schema and object operations of a transaction.
//!
//! Reads work in every bound stage. Writes require `Writing` and record one
//! instruction per change in the transaction's replication, so a committed
//! changeset replays to exactly the same state.

use tracing::debug;
use vellum_common::types::{ColKey, ColumnAttrs, ColumnType, Mixed, ObjKey, Ref, TableKey};
use vellum_storage::{CollectionHook, DictionaryCore, LnkLst, SetCore, SlabAlloc, TreeConfig};

use super::{ReplicationHook, Transaction};
use crate::error::{TxnError, TxnResult};

/// What happens to links into an object whose state changes.
#[derive(Debug, Clone, Copy)]
enum LinkRewrite {
    /// The object is removed: links are nulled or dropped.
    Remove(ObjKey),
    /// Links to `from` now point at `to`.
    Replace { from: ObjKey, to: ObjKey },
}

impl LinkRewrite {
    fn from(self) -> ObjKey {
        match self {
            Self::Remove(k) => k,
            Self::Replace { from, .. } => from,
        }
    }

    fn replacement(self) -> Mixed {
        match self {
            Self::Remove(_) => Mixed::Null,
            Self::Replace { to, .. } => Mixed::Link(to),
        }
    }
}

impl Transaction {
    // =========================================================================
    // Tables
    // =========================================================================

    /// Adds a table called `name`.
    pub fn add_table(&mut self, name: &str) -> TxnResult<TableKey> {
        let key = {
            let (alloc, group) = self.read_parts()?;
            group.next_table_key(alloc)?
        };
        self.add_table_with_key(name, key)?;
        Ok(key)
    }

    pub(crate) fn add_table_with_key(&mut self, name: &str, key: TableKey) -> TxnResult<()> {
        let (alloc, group, repl) = self.write_parts()?;
        group.insert_table(alloc, key, name)?;
        if let Some(r) = repl {
            r.add_class(key, name);
        }
        Ok(())
    }

    /// Removes `table` with all its objects. Fails while other tables link
    /// to it.
    pub fn remove_table(&mut self, table: TableKey) -> TxnResult<()> {
        let (alloc, group, repl) = self.write_parts()?;
        group.remove_table(alloc, table)?;
        if let Some(r) = repl {
            r.erase_class(table);
        }
        Ok(())
    }

    /// Renames `table`.
    pub fn rename_table(&mut self, table: TableKey, name: &str) -> TxnResult<()> {
        let (alloc, group, repl) = self.write_parts()?;
        group.rename_table(alloc, table, name)?;
        if let Some(r) = repl {
            r.rename_class(table, name);
        }
        Ok(())
    }

    /// Table called `name`, if any.
    pub fn find_table(&self, name: &str) -> TxnResult<Option<TableKey>> {
        let (alloc, group) = self.read_parts()?;
        group.find_table(alloc, name)
    }

    /// Keys of every table.
    pub fn table_keys(&self) -> TxnResult<Vec<TableKey>> {
        let (alloc, group) = self.read_parts()?;
        group.table_keys(alloc)
    }

    /// Name of `table`.
    pub fn table_name(&self, table: TableKey) -> TxnResult<String> {
        let (alloc, group) = self.read_parts()?;
        group.table_name(alloc, table)
    }

    /// Returns true if `table` exists.
    pub fn has_table(&self, table: TableKey) -> TxnResult<bool> {
        let (alloc, group) = self.read_parts()?;
        Ok(group.has_table(alloc, table))
    }

    // =========================================================================
    // Columns
    // =========================================================================

    /// Adds a column of type `ty`. Link columns need a target table; use
    /// [`Transaction::add_link_column`] for them.
    pub fn add_column(
        &mut self,
        table: TableKey,
        ty: ColumnType,
        name: &str,
        attrs: ColumnAttrs,
    ) -> TxnResult<ColKey> {
        if ty == ColumnType::Link {
            return Err(TxnError::illegal("link columns need a target table"));
        }
        self.add_column_to(table, ty, name, attrs, TableKey::NULL)
    }

    /// Adds a link column pointing at `target`.
    pub fn add_link_column(
        &mut self,
        table: TableKey,
        name: &str,
        target: TableKey,
        attrs: ColumnAttrs,
    ) -> TxnResult<ColKey> {
        if !self.has_table(target)? {
            return Err(TxnError::NoSuchTable(target.to_string()));
        }
        self.add_column_to(table, ColumnType::Link, name, attrs, target)
    }

    fn add_column_to(
        &mut self,
        table: TableKey,
        ty: ColumnType,
        name: &str,
        attrs: ColumnAttrs,
        target: TableKey,
    ) -> TxnResult<ColKey> {
        let (lists, sets, dicts) = (
            attrs.contains(ColumnAttrs::LIST),
            attrs.contains(ColumnAttrs::SET),
            attrs.contains(ColumnAttrs::DICTIONARY),
        );
        if u8::from(lists) + u8::from(sets) + u8::from(dicts) > 1 {
            return Err(TxnError::illegal("a column has at most one collection kind"));
        }
        let col = {
            let (alloc, group) = self.read_parts()?;
            group.next_column_key(alloc, table, ty, attrs)?
        };
        self.add_column_with_key(table, col, name, target)?;
        Ok(col)
    }

    pub(crate) fn add_column_with_key(
        &mut self,
        table: TableKey,
        col: ColKey,
        name: &str,
        target: TableKey,
    ) -> TxnResult<()> {
        let (alloc, group, repl) = self.write_parts()?;
        group.insert_column(alloc, table, col, name, target)?;
        if let Some(r) = repl {
            r.insert_column(table, col, name, target);
        }
        debug!(%table, ?col, name, "column added");
        Ok(())
    }

    /// Removes column `col` and its values.
    pub fn remove_column(&mut self, table: TableKey, col: ColKey) -> TxnResult<()> {
        let (alloc, group, repl) = self.write_parts()?;
        group.remove_column(alloc, table, col)?;
        if let Some(r) = repl {
            r.erase_column(table, col);
        }
        Ok(())
    }

    /// Renames column `col`.
    pub fn rename_column(&mut self, table: TableKey, col: ColKey, name: &str) -> TxnResult<()> {
        let (alloc, group, repl) = self.write_parts()?;
        group.rename_column(alloc, table, col, name)?;
        if let Some(r) = repl {
            r.rename_column(table, col, name);
        }
        Ok(())
    }

    /// Points link column `col` at `target`.
    pub fn set_link_target(&mut self, table: TableKey, col: ColKey, target: TableKey) -> TxnResult<()> {
        let (alloc, group, repl) = self.write_parts()?;
        group.set_link_target(alloc, table, col, target)?;
        if let Some(r) = repl {
            r.typed_link_change(table, col, target);
        }
        Ok(())
    }

    /// Keys of every column of `table`.
    pub fn column_keys(&self, table: TableKey) -> TxnResult<Vec<ColKey>> {
        let (alloc, group) = self.read_parts()?;
        group.column_keys(alloc, table)
    }

    /// Column of `table` called `name`.
    pub fn find_column(&self, table: TableKey, name: &str) -> TxnResult<Option<ColKey>> {
        let (alloc, group) = self.read_parts()?;
        group.find_column(alloc, table, name)
    }

    /// Name of column `col`.
    pub fn column_name(&self, table: TableKey, col: ColKey) -> TxnResult<String> {
        let (alloc, group) = self.read_parts()?;
        group.column_name(alloc, table, col)
    }

    /// Target table of link column `col`.
    pub fn link_target(&self, table: TableKey, col: ColKey) -> TxnResult<TableKey> {
        let (alloc, group) = self.read_parts()?;
        group.link_target(alloc, table, col)
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Creates an object with the next free key.
    pub fn create_object(&mut self, table: TableKey) -> TxnResult<ObjKey> {
        let key = {
            let (alloc, group) = self.read_parts()?;
            group.next_object_key(alloc, table)?
        };
        self.create_object_with_key(table, key)?;
        Ok(key)
    }

    /// Creates object `key`. Links left pointing at a tombstone of `key`
    /// are resolved again.
    pub fn create_object_with_key(&mut self, table: TableKey, key: ObjKey) -> TxnResult<()> {
        self.insert_object(table, key)?;
        self.rewrite_incoming_links(
            table,
            LinkRewrite::Replace {
                from: key.get_unresolved(),
                to: key,
            },
        )
    }

    /// Creates object `key` without touching links to its tombstone.
    pub(crate) fn insert_object(&mut self, table: TableKey, key: ObjKey) -> TxnResult<()> {
        let (alloc, group, repl) = self.write_parts()?;
        group.create_object(alloc, table, key)?;
        if let Some(r) = repl {
            r.create_object(table, key);
        }
        Ok(())
    }

    /// Removes object `key`. Scalar links to it become null and collection
    /// entries pointing at it are dropped first.
    pub fn remove_object(&mut self, table: TableKey, key: ObjKey) -> TxnResult<()> {
        if !self.has_object(table, key)? {
            return Err(TxnError::KeyNotFound { table, key });
        }
        self.rewrite_incoming_links(table, LinkRewrite::Remove(key))?;
        self.erase_object(table, key)
    }

    /// Removes object `key` but keeps links to it as tombstones, which
    /// read as absent until an object with the same key is created again.
    pub fn invalidate_object(&mut self, table: TableKey, key: ObjKey) -> TxnResult<()> {
        if !self.has_object(table, key)? {
            return Err(TxnError::KeyNotFound { table, key });
        }
        self.rewrite_incoming_links(
            table,
            LinkRewrite::Replace {
                from: key,
                to: key.get_unresolved(),
            },
        )?;
        self.erase_object(table, key)?;
        debug!(%table, %key, "object invalidated");
        Ok(())
    }

    fn erase_object(&mut self, table: TableKey, key: ObjKey) -> TxnResult<()> {
        let (alloc, group, repl) = self.write_parts()?;
        group.erase_object(alloc, table, key)?;
        if let Some(r) = repl {
            r.remove_object(table, key);
        }
        Ok(())
    }

    /// Removes every object of `table`.
    pub fn clear_table(&mut self, table: TableKey) -> TxnResult<()> {
        if !self.incoming_link_columns(table)?.is_empty() {
            for key in self.object_keys(table)? {
                self.rewrite_incoming_links(table, LinkRewrite::Remove(key))?;
            }
        }
        let (alloc, group, repl) = self.write_parts()?;
        let old_size = group.clear_objects(alloc, table)?;
        if let Some(r) = repl {
            r.clear_table(table, old_size);
        }
        Ok(())
    }

    /// Keys of every object of `table`, in insertion order.
    pub fn object_keys(&self, table: TableKey) -> TxnResult<Vec<ObjKey>> {
        let (alloc, group) = self.read_parts()?;
        group.object_keys(alloc, table)
    }

    /// Returns true if object `key` exists.
    pub fn has_object(&self, table: TableKey, key: ObjKey) -> TxnResult<bool> {
        let (alloc, group) = self.read_parts()?;
        group.has_object(alloc, table, key)
    }

    /// Number of objects in `table`.
    pub fn table_size(&self, table: TableKey) -> TxnResult<usize> {
        let (alloc, group) = self.read_parts()?;
        group.table_size(alloc, table)
    }

    // =========================================================================
    // Values
    // =========================================================================

    /// Value of scalar column `col` of object `key`.
    pub fn get(&self, table: TableKey, col: ColKey, key: ObjKey) -> TxnResult<Mixed> {
        let (alloc, group) = self.read_parts()?;
        group.get_value(alloc, table, col, key)
    }

    /// Sets scalar column `col` of object `key`.
    pub fn set(
        &mut self,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        value: impl Into<Mixed>,
    ) -> TxnResult<()> {
        let value = value.into();
        let (alloc, group, repl) = self.write_parts()?;
        group.set_value(alloc, table, col, key, value.clone())?;
        if let Some(r) = repl {
            r.set(table, col, key, &value);
        }
        Ok(())
    }

    // =========================================================================
    // Collections
    // =========================================================================

    /// Root of the collection in `col` of object `key`, null if never
    /// written.
    pub(crate) fn collection_root(&self, table: TableKey, col: ColKey, key: ObjKey) -> TxnResult<Ref> {
        let (alloc, group) = self.read_parts()?;
        group.collection_ref(alloc, table, col, key)
    }

    pub(crate) fn tree_config(&self) -> TreeConfig {
        self.db.inner().tree_config()
    }

    pub(crate) fn alloc(&self) -> &SlabAlloc {
        &self.alloc
    }

    /// Runs `f` on the collection root of `col` of object `key`, recording
    /// its mutations, and stores the root it returns.
    pub(crate) fn update_collection<R>(
        &mut self,
        table: TableKey,
        col: ColKey,
        key: ObjKey,
        f: impl FnOnce(&mut SlabAlloc, Ref, TreeConfig, &mut dyn CollectionHook) -> TxnResult<(Ref, R)>,
    ) -> TxnResult<R> {
        let (alloc, group, repl) = self.write_parts()?;
        let config = group.tree_config();
        let mut hook = ReplicationHook::new(repl, table, col, key);
        group.update_collection(alloc, table, col, key, |alloc, root| {
            f(alloc, root, config, &mut hook)
        })
    }

    // =========================================================================
    // Incoming links
    // =========================================================================

    fn incoming_link_columns(&self, target: TableKey) -> TxnResult<Vec<(TableKey, ColKey)>> {
        let (alloc, group) = self.read_parts()?;
        let mut out = Vec::new();
        for origin in group.table_keys(alloc)? {
            for col in group.link_columns_into(alloc, origin, target)? {
                out.push((origin, col));
            }
        }
        Ok(out)
    }

    fn rewrite_incoming_links(&mut self, target: TableKey, rewrite: LinkRewrite) -> TxnResult<()> {
        let from = rewrite.from();
        for (origin, col) in self.incoming_link_columns(target)? {
            let attrs = col.attrs();
            if !col.is_collection() {
                let linking = {
                    let (alloc, group) = self.read_parts()?;
                    group.objects_linking_to(alloc, origin, col, from)?
                };
                for key in linking {
                    let (alloc, group, repl) = self.write_parts()?;
                    let value = rewrite.replacement();
                    group.set_value(alloc, origin, col, key, value.clone())?;
                    if let Some(r) = repl {
                        r.set(origin, col, key, &value);
                    }
                }
                continue;
            }

            let owners = {
                let (alloc, group) = self.read_parts()?;
                group.objects_with_collection(alloc, origin, col)?
            };
            let config = self.tree_config();
            for (key, root) in owners {
                if attrs.contains(ColumnAttrs::LIST) {
                    let list = LnkLst::init_from_ref(self.alloc(), root, config)?;
                    if !list_holds(&list, self.alloc(), from)? {
                        continue;
                    }
                    self.update_collection(origin, col, key, |alloc, root, config, hook| {
                        let mut list = LnkLst::init_from_ref(alloc, root, config)?;
                        match rewrite {
                            LinkRewrite::Remove(k) => list.remove_key(alloc, hook, k)?,
                            LinkRewrite::Replace { from, to } => list.replace_key(alloc, hook, from, to)?,
                        };
                        Ok((list.ref_(), ()))
                    })?;
                } else if attrs.contains(ColumnAttrs::SET) {
                    let set = SetCore::<ObjKey>::init_from_ref(self.alloc(), root, config, false)?;
                    if !set.contains(self.alloc(), &from)? {
                        continue;
                    }
                    self.update_collection(origin, col, key, |alloc, root, config, hook| {
                        let mut set = SetCore::<ObjKey>::init_from_ref(alloc, root, config, false)?;
                        set.erase(alloc, hook, &from)?;
                        if let LinkRewrite::Replace { to, .. } = rewrite {
                            set.insert(alloc, hook, to)?;
                        }
                        Ok((set.ref_(), ()))
                    })?;
                } else {
                    let dict = DictionaryCore::init_from_ref(self.alloc(), root, config, true)?;
                    let hits: Vec<String> = dict
                        .keys(self.alloc())?
                        .into_iter()
                        .zip(dict.values(self.alloc())?)
                        .filter(|(_, v)| *v == Mixed::Link(from))
                        .map(|(k, _)| k)
                        .collect();
                    if hits.is_empty() {
                        continue;
                    }
                    self.update_collection(origin, col, key, |alloc, root, config, hook| {
                        let mut dict = DictionaryCore::init_from_ref(alloc, root, config, true)?;
                        for k in &hits {
                            dict.insert(alloc, hook, k, rewrite.replacement())?;
                        }
                        Ok((dict.ref_(), ()))
                    })?;
                }
            }
        }
        Ok(())
    }
}

fn list_holds(list: &LnkLst, alloc: &SlabAlloc, key: ObjKey) -> TxnResult<bool> {
    if key.is_unresolved() {
        return Ok(list.has_unresolved(alloc)?);
    }
    Ok(list.find_first(alloc, key)?.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{Dictionary, LinkList};
    use crate::db::Db;
    use vellum_common::config::DbConfig;

    fn write() -> (Db, Transaction) {
        let db = Db::open(DbConfig::for_testing()).unwrap();
        let tr = db.start_write().unwrap();
        (db, tr)
    }

    #[test]
    fn test_schema_roundtrip() {
        let (_db, mut tr) = write();
        let t = tr.add_table("dogs").unwrap();
        let name = tr.add_column(t, ColumnType::String, "name", ColumnAttrs::NONE).unwrap();
        assert_eq!(tr.find_column(t, "name").unwrap(), Some(name));
        tr.rename_column(t, name, "title").unwrap();
        assert_eq!(tr.column_name(t, name).unwrap(), "title");
        tr.rename_table(t, "hounds").unwrap();
        assert_eq!(tr.table_name(t).unwrap(), "hounds");
        assert!(matches!(
            tr.add_table("hounds"),
            Err(TxnError::TableNameInUse(_))
        ));
        assert!(tr
            .add_column(t, ColumnType::Link, "bad", ColumnAttrs::NONE)
            .is_err());
        tr.remove_column(t, name).unwrap();
        assert!(tr.column_keys(t).unwrap().is_empty());
    }

    #[test]
    fn test_values_are_type_checked() {
        let (_db, mut tr) = write();
        let t = tr.add_table("t").unwrap();
        let age = tr.add_column(t, ColumnType::Int, "age", ColumnAttrs::NONE).unwrap();
        let k = tr.create_object(t).unwrap();
        assert_eq!(tr.get(t, age, k).unwrap(), Mixed::Int(0));
        tr.set(t, age, k, 41_i64).unwrap();
        assert_eq!(tr.get(t, age, k).unwrap(), Mixed::Int(41));
        assert!(matches!(
            tr.set(t, age, k, "old"),
            Err(TxnError::TypeMismatch { .. })
        ));
        assert!(tr.set(t, age, k, Mixed::Null).is_err());
    }

    #[test]
    fn test_remove_object_nullifies_links() {
        let (_db, mut tr) = write();
        let people = tr.add_table("people").unwrap();
        let dogs = tr.add_table("dogs").unwrap();
        let best = tr
            .add_link_column(people, "best", dogs, ColumnAttrs::NULLABLE)
            .unwrap();
        let all = tr.add_link_column(people, "all", dogs, ColumnAttrs::LIST).unwrap();
        let rex = tr.create_object(dogs).unwrap();
        let fido = tr.create_object(dogs).unwrap();
        let p = tr.create_object(people).unwrap();
        tr.set(people, best, p, rex).unwrap();
        let list = LinkList::new(people, all, p);
        list.add(&mut tr, rex).unwrap();
        list.add(&mut tr, fido).unwrap();

        tr.remove_object(dogs, rex).unwrap();
        assert_eq!(tr.get(people, best, p).unwrap(), Mixed::Null);
        assert_eq!(list.get_all(&tr).unwrap(), vec![fido]);
        assert!(!tr.has_object(dogs, rex).unwrap());
    }

    #[test]
    fn test_invalidate_then_resurrect() {
        let (_db, mut tr) = write();
        let people = tr.add_table("people").unwrap();
        let dogs = tr.add_table("dogs").unwrap();
        let best = tr
            .add_link_column(people, "best", dogs, ColumnAttrs::NULLABLE)
            .unwrap();
        let all = tr.add_link_column(people, "all", dogs, ColumnAttrs::LIST).unwrap();
        let tags = tr
            .add_link_column(people, "tags", dogs, ColumnAttrs::DICTIONARY.union(ColumnAttrs::NULLABLE))
            .unwrap();
        let rex = tr.create_object(dogs).unwrap();
        let p = tr.create_object(people).unwrap();
        tr.set(people, best, p, rex).unwrap();
        let list = LinkList::new(people, all, p);
        list.add(&mut tr, rex).unwrap();
        let dict = Dictionary::new(people, tags, p);
        dict.insert(&mut tr, "fav", rex).unwrap();

        tr.invalidate_object(dogs, rex).unwrap();
        assert_eq!(tr.get(people, best, p).unwrap(), Mixed::Null);
        assert_eq!(list.size(&tr).unwrap(), 0);

        tr.create_object_with_key(dogs, rex).unwrap();
        assert_eq!(tr.get(people, best, p).unwrap(), Mixed::Link(rex));
        assert_eq!(list.get_all(&tr).unwrap(), vec![rex]);
        assert_eq!(dict.get(&tr, "fav").unwrap(), Some(Mixed::Link(rex)));
    }

    #[test]
    fn test_clear_table_records_old_size() {
        let (_db, mut tr) = write();
        let t = tr.add_table("t").unwrap();
        for _ in 0..3 {
            tr.create_object(t).unwrap();
        }
        tr.clear_table(t).unwrap();
        assert_eq!(tr.table_size(t).unwrap(), 0);
        assert!(!tr.uncommitted_changes().is_empty());
        assert_eq!(tr.create_object(t).unwrap(), ObjKey::new(3));
    }

    #[test]
    fn test_reads_fail_after_end() {
        let (db, mut tr) = write();
        tr.add_table("t").unwrap();
        tr.commit().unwrap();
        assert!(tr.table_keys().is_err());
        let r = db.start_read(None).unwrap();
        assert!(matches!(
            r.find_table("t").unwrap(),
            Some(_)
        ));
        let mut r = r;
        assert!(matches!(
            r.add_table("u"),
            Err(TxnError::WrongTransactionState { .. })
        ));
    }
}
