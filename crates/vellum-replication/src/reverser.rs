//! Transact-log reversal.
//!
//! A rolled-back write never reaches history, yet observers still need to
//! learn what was undone. [`TransactReverser`] records a changeset and
//! replays its inverse, last instruction first, re-emitting selections so
//! each inverted instruction lands in the context it was recorded in.
//!
//! Inverses only need to be exact for structure (positions, object and
//! column existence). Overwrites have no recorded old value and are
//! replayed as markers with the value they set; an erased element comes
//! back as `Null`.

use std::collections::HashMap;

use bytes::Bytes;
use vellum_common::types::{ColKey, Mixed, ObjKey, TableKey};

use crate::encoder::TransactLogEncoder;
use crate::handler::{dispatch, InstructionHandler};
use crate::instruction::Instruction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Context {
    table: TableKey,
    collection: Option<(ColKey, ObjKey)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Needs {
    Nothing,
    Table,
    Collection,
}

#[derive(Debug)]
struct Entry {
    context: Context,
    needs: Needs,
    inverse: Vec<Instruction>,
}

/// Records instructions and replays their inverse in reverse order.
#[derive(Debug)]
pub struct TransactReverser {
    context: Context,
    entries: Vec<Entry>,
    table_names: HashMap<TableKey, String>,
    column_names: HashMap<(TableKey, ColKey), String>,
}

impl Default for TransactReverser {
    fn default() -> Self {
        Self {
            context: Context {
                table: TableKey::NULL,
                collection: None,
            },
            entries: Vec::new(),
            table_names: HashMap::new(),
            column_names: HashMap::new(),
        }
    }
}

impl TransactReverser {
    /// Creates an empty reverser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded instructions, selections excluded.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn record(&mut self, needs: Needs, inverse: Vec<Instruction>) -> bool {
        self.entries.push(Entry {
            context: self.context,
            needs,
            inverse,
        });
        true
    }

    /// Feeds the inverse of everything recorded to `handler`.
    ///
    /// Returns false as soon as the handler rejects an instruction.
    pub fn reverse(&self, handler: &mut dyn InstructionHandler) -> bool {
        let mut table = TableKey::NULL;
        let mut collection: Option<(ColKey, ObjKey)> = None;
        for entry in self.entries.iter().rev() {
            if entry.needs != Needs::Nothing && entry.context.table != table {
                table = entry.context.table;
                collection = None;
                if !handler.select_table(table) {
                    return false;
                }
            }
            if entry.needs == Needs::Collection && entry.context.collection != collection {
                collection = entry.context.collection;
                if let Some((col, key)) = collection {
                    if !handler.select_collection(col, key) {
                        return false;
                    }
                }
            }
            for instr in &entry.inverse {
                if !dispatch(handler, instr) {
                    return false;
                }
            }
        }
        true
    }

    /// Encodes the inverse as a changeset.
    pub fn reverse_to_bytes(&self) -> Bytes {
        let mut enc = TransactLogEncoder::new();
        self.reverse(&mut enc);
        enc.finish()
    }
}

impl InstructionHandler for TransactReverser {
    fn insert_group_level_table(&mut self, table: TableKey, name: &str) -> bool {
        self.table_names.insert(table, name.to_string());
        self.record(Needs::Nothing, vec![Instruction::EraseGroupLevelTable { table }])
    }

    fn erase_group_level_table(&mut self, table: TableKey) -> bool {
        let name = self.table_names.get(&table).cloned().unwrap_or_default();
        self.record(
            Needs::Nothing,
            vec![Instruction::InsertGroupLevelTable { table, name }],
        )
    }

    fn rename_group_level_table(&mut self, table: TableKey, name: &str) -> bool {
        let old = self
            .table_names
            .insert(table, name.to_string())
            .unwrap_or_else(|| name.to_string());
        self.record(
            Needs::Nothing,
            vec![Instruction::RenameGroupLevelTable { table, name: old }],
        )
    }

    fn select_table(&mut self, table: TableKey) -> bool {
        self.context = Context {
            table,
            collection: None,
        };
        true
    }

    fn create_object(&mut self, key: ObjKey) -> bool {
        self.record(Needs::Table, vec![Instruction::RemoveObject(key)])
    }

    fn remove_object(&mut self, key: ObjKey) -> bool {
        self.record(Needs::Table, vec![Instruction::CreateObject(key)])
    }

    fn clear_table(&mut self, old_size: usize) -> bool {
        self.record(Needs::Table, vec![Instruction::ClearTable { old_size }])
    }

    fn modify_object(&mut self, col: ColKey, key: ObjKey, value: &Mixed) -> bool {
        self.record(
            Needs::Table,
            vec![Instruction::Modify {
                col,
                key,
                value: value.clone(),
            }],
        )
    }

    fn insert_column(&mut self, col: ColKey, name: &str, _target: TableKey) -> bool {
        self.column_names
            .insert((self.context.table, col), name.to_string());
        self.record(Needs::Table, vec![Instruction::EraseColumn(col)])
    }

    fn erase_column(&mut self, col: ColKey) -> bool {
        let name = self
            .column_names
            .get(&(self.context.table, col))
            .cloned()
            .unwrap_or_default();
        self.record(
            Needs::Table,
            vec![Instruction::InsertColumn {
                col,
                name,
                target: TableKey::NULL,
            }],
        )
    }

    fn rename_column(&mut self, col: ColKey, name: &str) -> bool {
        let old = self
            .column_names
            .insert((self.context.table, col), name.to_string())
            .unwrap_or_else(|| name.to_string());
        self.record(Needs::Table, vec![Instruction::RenameColumn { col, name: old }])
    }

    fn typed_link_change(&mut self, col: ColKey, target: TableKey) -> bool {
        self.record(Needs::Table, vec![Instruction::TypedLinkChange { col, target }])
    }

    fn select_collection(&mut self, col: ColKey, key: ObjKey) -> bool {
        self.context.collection = Some((col, key));
        true
    }

    fn collection_insert(&mut self, ndx: usize, _value: &Mixed) -> bool {
        self.record(Needs::Collection, vec![Instruction::CollectionErase { ndx }])
    }

    fn collection_set(&mut self, ndx: usize, value: &Mixed) -> bool {
        self.record(
            Needs::Collection,
            vec![Instruction::CollectionSet {
                ndx,
                value: value.clone(),
            }],
        )
    }

    fn collection_move(&mut self, from: usize, to: usize) -> bool {
        self.record(
            Needs::Collection,
            vec![Instruction::CollectionMove { from: to, to: from }],
        )
    }

    fn collection_swap(&mut self, a: usize, b: usize) -> bool {
        self.record(Needs::Collection, vec![Instruction::CollectionSwap { a, b }])
    }

    fn collection_erase(&mut self, ndx: usize) -> bool {
        self.record(
            Needs::Collection,
            vec![Instruction::CollectionInsert {
                ndx,
                value: Mixed::Null,
            }],
        )
    }

    fn collection_clear(&mut self, old_size: usize) -> bool {
        let inserts = (0..old_size)
            .map(|ndx| Instruction::CollectionInsert {
                ndx,
                value: Mixed::Null,
            })
            .collect();
        self.record(Needs::Collection, inserts)
    }

    fn dictionary_insert(&mut self, ndx: usize, key: &str, _value: &Mixed) -> bool {
        self.record(
            Needs::Collection,
            vec![Instruction::DictionaryErase {
                ndx,
                key: key.to_string(),
            }],
        )
    }

    fn dictionary_set(&mut self, ndx: usize, key: &str, value: &Mixed) -> bool {
        self.record(
            Needs::Collection,
            vec![Instruction::DictionarySet {
                ndx,
                key: key.to_string(),
                value: value.clone(),
            }],
        )
    }

    fn dictionary_erase(&mut self, ndx: usize, key: &str) -> bool {
        self.record(
            Needs::Collection,
            vec![Instruction::DictionaryInsert {
                ndx,
                key: key.to_string(),
                value: Mixed::Null,
            }],
        )
    }
}
