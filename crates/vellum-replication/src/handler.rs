//! Instruction handlers.
//!
//! The parser resolves each instruction and calls the matching method of an
//! [`InstructionHandler`]. A method returning `false` aborts the parse.

use tracing::trace;
use vellum_common::types::{ColKey, Mixed, ObjKey, TableKey};

use crate::instruction::Instruction;

/// Receives decoded instructions.
///
/// Every method defaults to accepting the instruction and doing nothing, so
/// observers only override what they care about.
#[allow(unused_variables)]
pub trait InstructionHandler {
    /// A table was added.
    fn insert_group_level_table(&mut self, table: TableKey, name: &str) -> bool {
        true
    }
    /// A table was removed.
    fn erase_group_level_table(&mut self, table: TableKey) -> bool {
        true
    }
    /// A table was renamed.
    fn rename_group_level_table(&mut self, table: TableKey, name: &str) -> bool {
        true
    }
    /// Later object instructions refer to `table`.
    fn select_table(&mut self, table: TableKey) -> bool {
        true
    }
    /// An object was created in the selected table.
    fn create_object(&mut self, key: ObjKey) -> bool {
        true
    }
    /// An object was removed from the selected table.
    fn remove_object(&mut self, key: ObjKey) -> bool {
        true
    }
    /// Every object of the selected table was removed.
    fn clear_table(&mut self, old_size: usize) -> bool {
        true
    }
    /// A scalar field was set.
    fn modify_object(&mut self, col: ColKey, key: ObjKey, value: &Mixed) -> bool {
        true
    }
    /// A column was added to the selected table.
    fn insert_column(&mut self, col: ColKey, name: &str, target: TableKey) -> bool {
        true
    }
    /// A column was removed from the selected table.
    fn erase_column(&mut self, col: ColKey) -> bool {
        true
    }
    /// A column of the selected table was renamed.
    fn rename_column(&mut self, col: ColKey, name: &str) -> bool {
        true
    }
    /// A typed link column changed target.
    fn typed_link_change(&mut self, col: ColKey, target: TableKey) -> bool {
        true
    }
    /// Later collection instructions refer to `col` of `key`.
    fn select_collection(&mut self, col: ColKey, key: ObjKey) -> bool {
        true
    }
    /// An element was inserted.
    fn collection_insert(&mut self, ndx: usize, value: &Mixed) -> bool {
        true
    }
    /// An element was overwritten.
    fn collection_set(&mut self, ndx: usize, value: &Mixed) -> bool {
        true
    }
    /// An element moved from `from` to `to`.
    fn collection_move(&mut self, from: usize, to: usize) -> bool {
        true
    }
    /// Two elements swapped places.
    fn collection_swap(&mut self, a: usize, b: usize) -> bool {
        true
    }
    /// An element was erased.
    fn collection_erase(&mut self, ndx: usize) -> bool {
        true
    }
    /// The collection was emptied.
    fn collection_clear(&mut self, old_size: usize) -> bool {
        true
    }
    /// A dictionary key was added at sorted position `ndx`.
    fn dictionary_insert(&mut self, ndx: usize, key: &str, value: &Mixed) -> bool {
        true
    }
    /// A dictionary value was replaced.
    fn dictionary_set(&mut self, ndx: usize, key: &str, value: &Mixed) -> bool {
        true
    }
    /// A dictionary key was erased.
    fn dictionary_erase(&mut self, ndx: usize, key: &str) -> bool {
        true
    }
}

/// Feeds one instruction to `handler`.
///
/// Returns the handler's verdict.
pub fn dispatch(handler: &mut dyn InstructionHandler, instr: &Instruction) -> bool {
    match instr {
        Instruction::InsertGroupLevelTable { table, name } => {
            handler.insert_group_level_table(*table, name)
        }
        Instruction::EraseGroupLevelTable { table } => handler.erase_group_level_table(*table),
        Instruction::RenameGroupLevelTable { table, name } => {
            handler.rename_group_level_table(*table, name)
        }
        Instruction::SelectTable(t) => handler.select_table(*t),
        Instruction::CreateObject(k) => handler.create_object(*k),
        Instruction::RemoveObject(k) => handler.remove_object(*k),
        Instruction::ClearTable { old_size } => handler.clear_table(*old_size),
        Instruction::Modify { col, key, value } => handler.modify_object(*col, *key, value),
        Instruction::InsertColumn { col, name, target } => {
            handler.insert_column(*col, name, *target)
        }
        Instruction::EraseColumn(col) => handler.erase_column(*col),
        Instruction::RenameColumn { col, name } => handler.rename_column(*col, name),
        Instruction::TypedLinkChange { col, target } => handler.typed_link_change(*col, *target),
        Instruction::SelectCollection { col, key } => handler.select_collection(*col, *key),
        Instruction::CollectionInsert { ndx, value } => handler.collection_insert(*ndx, value),
        Instruction::CollectionSet { ndx, value } => handler.collection_set(*ndx, value),
        Instruction::CollectionMove { from, to } => handler.collection_move(*from, *to),
        Instruction::CollectionSwap { a, b } => handler.collection_swap(*a, *b),
        Instruction::CollectionErase { ndx } => handler.collection_erase(*ndx),
        Instruction::CollectionClear { old_size } => handler.collection_clear(*old_size),
        Instruction::DictionaryInsert { ndx, key, value } => {
            handler.dictionary_insert(*ndx, key, value)
        }
        Instruction::DictionarySet { ndx, key, value } => handler.dictionary_set(*ndx, key, value),
        Instruction::DictionaryErase { ndx, key } => handler.dictionary_erase(*ndx, key),
    }
}

// =============================================================================
// Stock handlers
// =============================================================================

/// Accepts everything and does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullInstructionObserver;

impl InstructionHandler for NullInstructionObserver {}

/// Collects every instruction it sees.
#[derive(Debug, Default, Clone)]
pub struct RecordingHandler {
    /// Instructions in arrival order.
    pub instructions: Vec<Instruction>,
}

impl RecordingHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, instr: Instruction) -> bool {
        self.instructions.push(instr);
        true
    }
}

impl InstructionHandler for RecordingHandler {
    fn insert_group_level_table(&mut self, table: TableKey, name: &str) -> bool {
        self.push(Instruction::InsertGroupLevelTable {
            table,
            name: name.to_string(),
        })
    }
    fn erase_group_level_table(&mut self, table: TableKey) -> bool {
        self.push(Instruction::EraseGroupLevelTable { table })
    }
    fn rename_group_level_table(&mut self, table: TableKey, name: &str) -> bool {
        self.push(Instruction::RenameGroupLevelTable {
            table,
            name: name.to_string(),
        })
    }
    fn select_table(&mut self, table: TableKey) -> bool {
        self.push(Instruction::SelectTable(table))
    }
    fn create_object(&mut self, key: ObjKey) -> bool {
        self.push(Instruction::CreateObject(key))
    }
    fn remove_object(&mut self, key: ObjKey) -> bool {
        self.push(Instruction::RemoveObject(key))
    }
    fn clear_table(&mut self, old_size: usize) -> bool {
        self.push(Instruction::ClearTable { old_size })
    }
    fn modify_object(&mut self, col: ColKey, key: ObjKey, value: &Mixed) -> bool {
        self.push(Instruction::Modify {
            col,
            key,
            value: value.clone(),
        })
    }
    fn insert_column(&mut self, col: ColKey, name: &str, target: TableKey) -> bool {
        self.push(Instruction::InsertColumn {
            col,
            name: name.to_string(),
            target,
        })
    }
    fn erase_column(&mut self, col: ColKey) -> bool {
        self.push(Instruction::EraseColumn(col))
    }
    fn rename_column(&mut self, col: ColKey, name: &str) -> bool {
        self.push(Instruction::RenameColumn {
            col,
            name: name.to_string(),
        })
    }
    fn typed_link_change(&mut self, col: ColKey, target: TableKey) -> bool {
        self.push(Instruction::TypedLinkChange { col, target })
    }
    fn select_collection(&mut self, col: ColKey, key: ObjKey) -> bool {
        self.push(Instruction::SelectCollection { col, key })
    }
    fn collection_insert(&mut self, ndx: usize, value: &Mixed) -> bool {
        self.push(Instruction::CollectionInsert {
            ndx,
            value: value.clone(),
        })
    }
    fn collection_set(&mut self, ndx: usize, value: &Mixed) -> bool {
        self.push(Instruction::CollectionSet {
            ndx,
            value: value.clone(),
        })
    }
    fn collection_move(&mut self, from: usize, to: usize) -> bool {
        self.push(Instruction::CollectionMove { from, to })
    }
    fn collection_swap(&mut self, a: usize, b: usize) -> bool {
        self.push(Instruction::CollectionSwap { a, b })
    }
    fn collection_erase(&mut self, ndx: usize) -> bool {
        self.push(Instruction::CollectionErase { ndx })
    }
    fn collection_clear(&mut self, old_size: usize) -> bool {
        self.push(Instruction::CollectionClear { old_size })
    }
    fn dictionary_insert(&mut self, ndx: usize, key: &str, value: &Mixed) -> bool {
        self.push(Instruction::DictionaryInsert {
            ndx,
            key: key.to_string(),
            value: value.clone(),
        })
    }
    fn dictionary_set(&mut self, ndx: usize, key: &str, value: &Mixed) -> bool {
        self.push(Instruction::DictionarySet {
            ndx,
            key: key.to_string(),
            value: value.clone(),
        })
    }
    fn dictionary_erase(&mut self, ndx: usize, key: &str) -> bool {
        self.push(Instruction::DictionaryErase {
            ndx,
            key: key.to_string(),
        })
    }
}

/// Traces every instruction at `trace` level and accepts it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl InstructionHandler for LoggingObserver {
    fn insert_group_level_table(&mut self, table: TableKey, name: &str) -> bool {
        trace!(%table, name, "insert_group_level_table");
        true
    }
    fn erase_group_level_table(&mut self, table: TableKey) -> bool {
        trace!(%table, "erase_group_level_table");
        true
    }
    fn rename_group_level_table(&mut self, table: TableKey, name: &str) -> bool {
        trace!(%table, name, "rename_group_level_table");
        true
    }
    fn select_table(&mut self, table: TableKey) -> bool {
        trace!(%table, "select_table");
        true
    }
    fn create_object(&mut self, key: ObjKey) -> bool {
        trace!(%key, "create_object");
        true
    }
    fn remove_object(&mut self, key: ObjKey) -> bool {
        trace!(%key, "remove_object");
        true
    }
    fn clear_table(&mut self, old_size: usize) -> bool {
        trace!(old_size, "clear_table");
        true
    }
    fn modify_object(&mut self, col: ColKey, key: ObjKey, value: &Mixed) -> bool {
        trace!(?col, %key, %value, "modify_object");
        true
    }
    fn insert_column(&mut self, col: ColKey, name: &str, target: TableKey) -> bool {
        trace!(?col, name, %target, "insert_column");
        true
    }
    fn erase_column(&mut self, col: ColKey) -> bool {
        trace!(?col, "erase_column");
        true
    }
    fn rename_column(&mut self, col: ColKey, name: &str) -> bool {
        trace!(?col, name, "rename_column");
        true
    }
    fn typed_link_change(&mut self, col: ColKey, target: TableKey) -> bool {
        trace!(?col, %target, "typed_link_change");
        true
    }
    fn select_collection(&mut self, col: ColKey, key: ObjKey) -> bool {
        trace!(?col, %key, "select_collection");
        true
    }
    fn collection_insert(&mut self, ndx: usize, value: &Mixed) -> bool {
        trace!(ndx, %value, "collection_insert");
        true
    }
    fn collection_set(&mut self, ndx: usize, value: &Mixed) -> bool {
        trace!(ndx, %value, "collection_set");
        true
    }
    fn collection_move(&mut self, from: usize, to: usize) -> bool {
        trace!(from, to, "collection_move");
        true
    }
    fn collection_swap(&mut self, a: usize, b: usize) -> bool {
        trace!(a, b, "collection_swap");
        true
    }
    fn collection_erase(&mut self, ndx: usize) -> bool {
        trace!(ndx, "collection_erase");
        true
    }
    fn collection_clear(&mut self, old_size: usize) -> bool {
        trace!(old_size, "collection_clear");
        true
    }
    fn dictionary_insert(&mut self, ndx: usize, key: &str, value: &Mixed) -> bool {
        trace!(ndx, key, %value, "dictionary_insert");
        true
    }
    fn dictionary_set(&mut self, ndx: usize, key: &str, value: &Mixed) -> bool {
        trace!(ndx, key, %value, "dictionary_set");
        true
    }
    fn dictionary_erase(&mut self, ndx: usize, key: &str) -> bool {
        trace!(ndx, key, "dictionary_erase");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_reaches_recorder() {
        let instrs = vec![
            Instruction::SelectTable(TableKey::new(1)),
            Instruction::CreateObject(ObjKey::new(5)),
            Instruction::DictionaryErase {
                ndx: 2,
                key: "k".into(),
            },
        ];
        let mut rec = RecordingHandler::new();
        for i in &instrs {
            assert!(dispatch(&mut rec, i));
        }
        assert_eq!(rec.instructions, instrs);
    }

    #[test]
    fn test_default_handler_accepts() {
        let mut null = NullInstructionObserver;
        assert!(dispatch(&mut null, &Instruction::ClearTable { old_size: 3 }));
        let mut log = LoggingObserver;
        assert!(dispatch(
            &mut log,
            &Instruction::CollectionMove { from: 0, to: 1 }
        ));
    }
}
