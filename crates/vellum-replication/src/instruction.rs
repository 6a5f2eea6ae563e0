//! Instruction tags and decoded instructions.
//!
//! The tag values are persisted in history and sent over the wire; they
//! must never be renumbered.

use vellum_common::types::{ColKey, Mixed, ObjKey, TableKey};

use crate::error::{ParseError, ParseResult};

/// First byte of every encoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InstructionTag {
    /// Binds a string index for later name operands.
    InternString = 1,
    /// Adds a table.
    InsertGroupLevelTable = 2,
    /// Removes a table.
    EraseGroupLevelTable = 3,
    /// Renames a table.
    RenameGroupLevelTable = 4,
    /// Selects the table later object instructions refer to.
    SelectTable = 10,
    /// Creates an object in the selected table.
    CreateObject = 11,
    /// Removes an object from the selected table.
    RemoveObject = 12,
    /// Removes every object from the selected table.
    ClearTable = 13,
    /// Sets a scalar field.
    Modify = 14,
    /// Adds a column to the selected table.
    InsertColumn = 20,
    /// Removes a column from the selected table.
    EraseColumn = 21,
    /// Renames a column of the selected table.
    RenameColumn = 22,
    /// Changes the target table of a typed link column.
    TypedLinkChange = 23,
    /// Selects the collection later collection instructions refer to.
    SelectCollection = 30,
    /// Inserts into the selected collection.
    CollectionInsert = 31,
    /// Overwrites an element of the selected collection.
    CollectionSet = 32,
    /// Moves an element of the selected collection.
    CollectionMove = 33,
    /// Swaps two elements of the selected collection.
    CollectionSwap = 34,
    /// Erases an element of the selected collection.
    CollectionErase = 35,
    /// Empties the selected collection.
    CollectionClear = 36,
    /// Inserts a new key into the selected dictionary.
    DictionaryInsert = 37,
    /// Replaces the value of a key in the selected dictionary.
    DictionarySet = 38,
    /// Erases a key from the selected dictionary.
    DictionaryErase = 39,
}

impl InstructionTag {
    /// Converts the tag to a u8.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Creates a tag from a u8.
    pub fn from_u8(value: u8) -> ParseResult<Self> {
        Ok(match value {
            1 => Self::InternString,
            2 => Self::InsertGroupLevelTable,
            3 => Self::EraseGroupLevelTable,
            4 => Self::RenameGroupLevelTable,
            10 => Self::SelectTable,
            11 => Self::CreateObject,
            12 => Self::RemoveObject,
            13 => Self::ClearTable,
            14 => Self::Modify,
            20 => Self::InsertColumn,
            21 => Self::EraseColumn,
            22 => Self::RenameColumn,
            23 => Self::TypedLinkChange,
            30 => Self::SelectCollection,
            31 => Self::CollectionInsert,
            32 => Self::CollectionSet,
            33 => Self::CollectionMove,
            34 => Self::CollectionSwap,
            35 => Self::CollectionErase,
            36 => Self::CollectionClear,
            37 => Self::DictionaryInsert,
            38 => Self::DictionarySet,
            39 => Self::DictionaryErase,
            other => return Err(ParseError::UnknownInstruction(other)),
        })
    }

    /// Handler method name, used in rejection errors and logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::InternString => "intern_string",
            Self::InsertGroupLevelTable => "insert_group_level_table",
            Self::EraseGroupLevelTable => "erase_group_level_table",
            Self::RenameGroupLevelTable => "rename_group_level_table",
            Self::SelectTable => "select_table",
            Self::CreateObject => "create_object",
            Self::RemoveObject => "remove_object",
            Self::ClearTable => "clear_table",
            Self::Modify => "modify_object",
            Self::InsertColumn => "insert_column",
            Self::EraseColumn => "erase_column",
            Self::RenameColumn => "rename_column",
            Self::TypedLinkChange => "typed_link_change",
            Self::SelectCollection => "select_collection",
            Self::CollectionInsert => "collection_insert",
            Self::CollectionSet => "collection_set",
            Self::CollectionMove => "collection_move",
            Self::CollectionSwap => "collection_swap",
            Self::CollectionErase => "collection_erase",
            Self::CollectionClear => "collection_clear",
            Self::DictionaryInsert => "dictionary_insert",
            Self::DictionarySet => "dictionary_set",
            Self::DictionaryErase => "dictionary_erase",
        }
    }

    /// Returns true for instructions that change schema rather than data.
    pub const fn is_schema_change(self) -> bool {
        matches!(
            self,
            Self::InsertGroupLevelTable
                | Self::EraseGroupLevelTable
                | Self::RenameGroupLevelTable
                | Self::InsertColumn
                | Self::EraseColumn
                | Self::RenameColumn
                | Self::TypedLinkChange
        )
    }
}

/// One decoded instruction with its operands resolved.
///
/// String interning is a wire concern; names appear here as strings.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// See [`InstructionTag::InsertGroupLevelTable`].
    InsertGroupLevelTable {
        /// New table.
        table: TableKey,
        /// Table name.
        name: String,
    },
    /// See [`InstructionTag::EraseGroupLevelTable`].
    EraseGroupLevelTable {
        /// Removed table.
        table: TableKey,
    },
    /// See [`InstructionTag::RenameGroupLevelTable`].
    RenameGroupLevelTable {
        /// Renamed table.
        table: TableKey,
        /// New name.
        name: String,
    },
    /// See [`InstructionTag::SelectTable`].
    SelectTable(TableKey),
    /// See [`InstructionTag::CreateObject`].
    CreateObject(ObjKey),
    /// See [`InstructionTag::RemoveObject`].
    RemoveObject(ObjKey),
    /// See [`InstructionTag::ClearTable`].
    ClearTable {
        /// Objects removed.
        old_size: usize,
    },
    /// See [`InstructionTag::Modify`].
    Modify {
        /// Field column.
        col: ColKey,
        /// Object.
        key: ObjKey,
        /// New value.
        value: Mixed,
    },
    /// See [`InstructionTag::InsertColumn`].
    InsertColumn {
        /// New column.
        col: ColKey,
        /// Column name.
        name: String,
        /// Link target table, or null.
        target: TableKey,
    },
    /// See [`InstructionTag::EraseColumn`].
    EraseColumn(ColKey),
    /// See [`InstructionTag::RenameColumn`].
    RenameColumn {
        /// Renamed column.
        col: ColKey,
        /// New name.
        name: String,
    },
    /// See [`InstructionTag::TypedLinkChange`].
    TypedLinkChange {
        /// Link column.
        col: ColKey,
        /// New target table.
        target: TableKey,
    },
    /// See [`InstructionTag::SelectCollection`].
    SelectCollection {
        /// Collection column.
        col: ColKey,
        /// Owning object.
        key: ObjKey,
    },
    /// See [`InstructionTag::CollectionInsert`].
    CollectionInsert {
        /// Position.
        ndx: usize,
        /// Inserted value.
        value: Mixed,
    },
    /// See [`InstructionTag::CollectionSet`].
    CollectionSet {
        /// Position.
        ndx: usize,
        /// New value.
        value: Mixed,
    },
    /// See [`InstructionTag::CollectionMove`].
    CollectionMove {
        /// Source position.
        from: usize,
        /// Destination position.
        to: usize,
    },
    /// See [`InstructionTag::CollectionSwap`].
    CollectionSwap {
        /// First position.
        a: usize,
        /// Second position.
        b: usize,
    },
    /// See [`InstructionTag::CollectionErase`].
    CollectionErase {
        /// Position.
        ndx: usize,
    },
    /// See [`InstructionTag::CollectionClear`].
    CollectionClear {
        /// Elements removed.
        old_size: usize,
    },
    /// See [`InstructionTag::DictionaryInsert`].
    DictionaryInsert {
        /// Sorted position of the new key.
        ndx: usize,
        /// Key.
        key: String,
        /// Value.
        value: Mixed,
    },
    /// See [`InstructionTag::DictionarySet`].
    DictionarySet {
        /// Sorted position of the key.
        ndx: usize,
        /// Key.
        key: String,
        /// New value.
        value: Mixed,
    },
    /// See [`InstructionTag::DictionaryErase`].
    DictionaryErase {
        /// Sorted position the key had.
        ndx: usize,
        /// Key.
        key: String,
    },
}

impl Instruction {
    /// Wire tag of this instruction.
    pub fn tag(&self) -> InstructionTag {
        match self {
            Self::InsertGroupLevelTable { .. } => InstructionTag::InsertGroupLevelTable,
            Self::EraseGroupLevelTable { .. } => InstructionTag::EraseGroupLevelTable,
            Self::RenameGroupLevelTable { .. } => InstructionTag::RenameGroupLevelTable,
            Self::SelectTable(_) => InstructionTag::SelectTable,
            Self::CreateObject(_) => InstructionTag::CreateObject,
            Self::RemoveObject(_) => InstructionTag::RemoveObject,
            Self::ClearTable { .. } => InstructionTag::ClearTable,
            Self::Modify { .. } => InstructionTag::Modify,
            Self::InsertColumn { .. } => InstructionTag::InsertColumn,
            Self::EraseColumn(_) => InstructionTag::EraseColumn,
            Self::RenameColumn { .. } => InstructionTag::RenameColumn,
            Self::TypedLinkChange { .. } => InstructionTag::TypedLinkChange,
            Self::SelectCollection { .. } => InstructionTag::SelectCollection,
            Self::CollectionInsert { .. } => InstructionTag::CollectionInsert,
            Self::CollectionSet { .. } => InstructionTag::CollectionSet,
            Self::CollectionMove { .. } => InstructionTag::CollectionMove,
            Self::CollectionSwap { .. } => InstructionTag::CollectionSwap,
            Self::CollectionErase { .. } => InstructionTag::CollectionErase,
            Self::CollectionClear { .. } => InstructionTag::CollectionClear,
            Self::DictionaryInsert { .. } => InstructionTag::DictionaryInsert,
            Self::DictionarySet { .. } => InstructionTag::DictionarySet,
            Self::DictionaryErase { .. } => InstructionTag::DictionaryErase,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_values_are_stable() {
        for v in 0..=u8::MAX {
            if let Ok(tag) = InstructionTag::from_u8(v) {
                assert_eq!(tag.as_u8(), v);
            }
        }
        assert_eq!(InstructionTag::CollectionMove.as_u8(), 33);
        assert!(matches!(
            InstructionTag::from_u8(99),
            Err(ParseError::UnknownInstruction(99))
        ));
        assert!(InstructionTag::InsertColumn.is_schema_change());
        assert!(!InstructionTag::Modify.is_schema_change());
    }
}
