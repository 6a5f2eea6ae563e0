//! Transact-log encoder.
//!
//! Instructions are appended to a growable buffer as a tag byte followed by
//! varint operands. Table and column names are interned: the first use of
//! a name within a changeset emits an `InternString` instruction binding
//! it to an index, and later uses refer to the index.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use vellum_common::types::{ColKey, Mixed, ObjKey, TableKey};

use crate::handler::{dispatch, InstructionHandler};
use crate::instruction::{Instruction, InstructionTag};
use crate::varint::encode_int;

/// Appends the encoding of a [`Mixed`] value: type code, then payload.
pub fn encode_mixed(out: &mut impl BufMut, value: &Mixed) {
    encode_int(out, i64::from(value.get_type().as_u8()));
    match value {
        Mixed::Null => {}
        Mixed::Int(v) => encode_int(out, *v),
        Mixed::Bool(b) => encode_int(out, i64::from(*b)),
        Mixed::Double(d) => encode_int(out, d.to_bits() as i64),
        Mixed::String(s) => encode_bytes(out, s.as_bytes()),
        Mixed::Binary(b) => encode_bytes(out, b),
        Mixed::Timestamp(ts) => {
            encode_int(out, ts.seconds);
            encode_int(out, i64::from(ts.nanoseconds));
        }
        Mixed::Link(key) => encode_int(out, key.value()),
        Mixed::TypedLink(link) => {
            encode_int(out, i64::from(link.table.value()));
            encode_int(out, link.key.value());
        }
    }
}

/// Appends a length-prefixed byte string.
pub fn encode_bytes(out: &mut impl BufMut, data: &[u8]) {
    encode_int(out, data.len() as i64);
    out.put_slice(data);
}

/// Builds one changeset.
#[derive(Debug, Default)]
pub struct TransactLogEncoder {
    buf: BytesMut,
    interned: HashMap<String, usize>,
    instructions: usize,
}

impl TransactLogEncoder {
    /// Creates an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoded bytes so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been encoded.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of instructions encoded, interning excluded.
    pub fn instruction_count(&self) -> usize {
        self.instructions
    }

    /// Peeks at the bytes encoded so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Takes the finished changeset and resets the encoder, including its
    /// string table.
    pub fn finish(&mut self) -> Bytes {
        self.interned.clear();
        self.instructions = 0;
        self.buf.split().freeze()
    }

    /// Discards everything encoded since the last `finish`.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.interned.clear();
        self.instructions = 0;
    }

    /// Encodes a decoded instruction.
    pub fn encode(&mut self, instr: &Instruction) {
        dispatch(self, instr);
    }

    fn tag(&mut self, tag: InstructionTag) {
        self.buf.put_u8(tag.as_u8());
        self.instructions += 1;
    }

    fn int(&mut self, v: i64) {
        encode_int(&mut self.buf, v);
    }

    fn index(&mut self, v: usize) {
        encode_int(&mut self.buf, v as i64);
    }

    fn table(&mut self, t: TableKey) {
        self.int(i64::from(t.value()));
    }

    fn col(&mut self, c: ColKey) {
        self.int(c.value());
    }

    fn key(&mut self, k: ObjKey) {
        self.int(k.value());
    }

    fn intern(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.interned.get(name) {
            return idx;
        }
        let idx = self.interned.len();
        self.interned.insert(name.to_string(), idx);
        self.buf.put_u8(InstructionTag::InternString.as_u8());
        encode_int(&mut self.buf, idx as i64);
        encode_bytes(&mut self.buf, name.as_bytes());
        idx
    }

    // =========================================================================
    // Table-level instructions
    // =========================================================================

    /// Encodes a table insertion.
    pub fn insert_group_level_table(&mut self, table: TableKey, name: &str) {
        let idx = self.intern(name);
        self.tag(InstructionTag::InsertGroupLevelTable);
        self.table(table);
        self.index(idx);
    }

    /// Encodes a table removal.
    pub fn erase_group_level_table(&mut self, table: TableKey) {
        self.tag(InstructionTag::EraseGroupLevelTable);
        self.table(table);
    }

    /// Encodes a table rename.
    pub fn rename_group_level_table(&mut self, table: TableKey, name: &str) {
        let idx = self.intern(name);
        self.tag(InstructionTag::RenameGroupLevelTable);
        self.table(table);
        self.index(idx);
    }

    /// Encodes a table selection.
    pub fn select_table(&mut self, table: TableKey) {
        self.tag(InstructionTag::SelectTable);
        self.table(table);
    }

    /// Encodes an object creation.
    pub fn create_object(&mut self, key: ObjKey) {
        self.tag(InstructionTag::CreateObject);
        self.key(key);
    }

    /// Encodes an object removal.
    pub fn remove_object(&mut self, key: ObjKey) {
        self.tag(InstructionTag::RemoveObject);
        self.key(key);
    }

    /// Encodes a table clear.
    pub fn clear_table(&mut self, old_size: usize) {
        self.tag(InstructionTag::ClearTable);
        self.index(old_size);
    }

    /// Encodes a scalar field update.
    pub fn modify_object(&mut self, col: ColKey, key: ObjKey, value: &Mixed) {
        self.tag(InstructionTag::Modify);
        self.col(col);
        self.key(key);
        encode_mixed(&mut self.buf, value);
    }

    // =========================================================================
    // Schema instructions
    // =========================================================================

    /// Encodes a column insertion.
    pub fn insert_column(&mut self, col: ColKey, name: &str, target: TableKey) {
        let idx = self.intern(name);
        self.tag(InstructionTag::InsertColumn);
        self.col(col);
        self.index(idx);
        self.table(target);
    }

    /// Encodes a column removal.
    pub fn erase_column(&mut self, col: ColKey) {
        self.tag(InstructionTag::EraseColumn);
        self.col(col);
    }

    /// Encodes a column rename.
    pub fn rename_column(&mut self, col: ColKey, name: &str) {
        let idx = self.intern(name);
        self.tag(InstructionTag::RenameColumn);
        self.col(col);
        self.index(idx);
    }

    /// Encodes a typed link retarget.
    pub fn typed_link_change(&mut self, col: ColKey, target: TableKey) {
        self.tag(InstructionTag::TypedLinkChange);
        self.col(col);
        self.table(target);
    }

    // =========================================================================
    // Collection instructions
    // =========================================================================

    /// Encodes a collection selection.
    pub fn select_collection(&mut self, col: ColKey, key: ObjKey) {
        self.tag(InstructionTag::SelectCollection);
        self.col(col);
        self.key(key);
    }

    /// Encodes an element insertion.
    pub fn collection_insert(&mut self, ndx: usize, value: &Mixed) {
        self.tag(InstructionTag::CollectionInsert);
        self.index(ndx);
        encode_mixed(&mut self.buf, value);
    }

    /// Encodes an element overwrite.
    pub fn collection_set(&mut self, ndx: usize, value: &Mixed) {
        self.tag(InstructionTag::CollectionSet);
        self.index(ndx);
        encode_mixed(&mut self.buf, value);
    }

    /// Encodes an element move. Moving an element onto itself encodes
    /// nothing.
    pub fn collection_move(&mut self, from: usize, to: usize) {
        if from == to {
            return;
        }
        self.tag(InstructionTag::CollectionMove);
        self.index(from);
        self.index(to);
    }

    /// Encodes a swap.
    pub fn collection_swap(&mut self, a: usize, b: usize) {
        self.tag(InstructionTag::CollectionSwap);
        self.index(a);
        self.index(b);
    }

    /// Encodes an element erase.
    pub fn collection_erase(&mut self, ndx: usize) {
        self.tag(InstructionTag::CollectionErase);
        self.index(ndx);
    }

    /// Encodes a collection clear.
    pub fn collection_clear(&mut self, old_size: usize) {
        self.tag(InstructionTag::CollectionClear);
        self.index(old_size);
    }

    /// Encodes a dictionary key insertion.
    pub fn dictionary_insert(&mut self, ndx: usize, key: &str, value: &Mixed) {
        self.tag(InstructionTag::DictionaryInsert);
        self.index(ndx);
        encode_bytes(&mut self.buf, key.as_bytes());
        encode_mixed(&mut self.buf, value);
    }

    /// Encodes a dictionary value replacement.
    pub fn dictionary_set(&mut self, ndx: usize, key: &str, value: &Mixed) {
        self.tag(InstructionTag::DictionarySet);
        self.index(ndx);
        encode_bytes(&mut self.buf, key.as_bytes());
        encode_mixed(&mut self.buf, value);
    }

    /// Encodes a dictionary key erase.
    pub fn dictionary_erase(&mut self, ndx: usize, key: &str) {
        self.tag(InstructionTag::DictionaryErase);
        self.index(ndx);
        encode_bytes(&mut self.buf, key.as_bytes());
    }
}

impl InstructionHandler for TransactLogEncoder {
    fn insert_group_level_table(&mut self, table: TableKey, name: &str) -> bool {
        TransactLogEncoder::insert_group_level_table(self, table, name);
        true
    }
    fn erase_group_level_table(&mut self, table: TableKey) -> bool {
        TransactLogEncoder::erase_group_level_table(self, table);
        true
    }
    fn rename_group_level_table(&mut self, table: TableKey, name: &str) -> bool {
        TransactLogEncoder::rename_group_level_table(self, table, name);
        true
    }
    fn select_table(&mut self, table: TableKey) -> bool {
        TransactLogEncoder::select_table(self, table);
        true
    }
    fn create_object(&mut self, key: ObjKey) -> bool {
        TransactLogEncoder::create_object(self, key);
        true
    }
    fn remove_object(&mut self, key: ObjKey) -> bool {
        TransactLogEncoder::remove_object(self, key);
        true
    }
    fn clear_table(&mut self, old_size: usize) -> bool {
        TransactLogEncoder::clear_table(self, old_size);
        true
    }
    fn modify_object(&mut self, col: ColKey, key: ObjKey, value: &Mixed) -> bool {
        TransactLogEncoder::modify_object(self, col, key, value);
        true
    }
    fn insert_column(&mut self, col: ColKey, name: &str, target: TableKey) -> bool {
        TransactLogEncoder::insert_column(self, col, name, target);
        true
    }
    fn erase_column(&mut self, col: ColKey) -> bool {
        TransactLogEncoder::erase_column(self, col);
        true
    }
    fn rename_column(&mut self, col: ColKey, name: &str) -> bool {
        TransactLogEncoder::rename_column(self, col, name);
        true
    }
    fn typed_link_change(&mut self, col: ColKey, target: TableKey) -> bool {
        TransactLogEncoder::typed_link_change(self, col, target);
        true
    }
    fn select_collection(&mut self, col: ColKey, key: ObjKey) -> bool {
        TransactLogEncoder::select_collection(self, col, key);
        true
    }
    fn collection_insert(&mut self, ndx: usize, value: &Mixed) -> bool {
        TransactLogEncoder::collection_insert(self, ndx, value);
        true
    }
    fn collection_set(&mut self, ndx: usize, value: &Mixed) -> bool {
        TransactLogEncoder::collection_set(self, ndx, value);
        true
    }
    fn collection_move(&mut self, from: usize, to: usize) -> bool {
        TransactLogEncoder::collection_move(self, from, to);
        true
    }
    fn collection_swap(&mut self, a: usize, b: usize) -> bool {
        TransactLogEncoder::collection_swap(self, a, b);
        true
    }
    fn collection_erase(&mut self, ndx: usize) -> bool {
        TransactLogEncoder::collection_erase(self, ndx);
        true
    }
    fn collection_clear(&mut self, old_size: usize) -> bool {
        TransactLogEncoder::collection_clear(self, old_size);
        true
    }
    fn dictionary_insert(&mut self, ndx: usize, key: &str, value: &Mixed) -> bool {
        TransactLogEncoder::dictionary_insert(self, ndx, key, value);
        true
    }
    fn dictionary_set(&mut self, ndx: usize, key: &str, value: &Mixed) -> bool {
        TransactLogEncoder::dictionary_set(self, ndx, key, value);
        true
    }
    fn dictionary_erase(&mut self, ndx: usize, key: &str) -> bool {
        TransactLogEncoder::dictionary_erase(self, ndx, key);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_common::types::MixedType;

    #[test]
    fn test_move_onto_itself_encodes_nothing() {
        let mut enc = TransactLogEncoder::new();
        enc.select_collection(ColKey::from_raw(1), ObjKey::new(0));
        let before = enc.len();
        enc.collection_move(4, 4);
        assert_eq!(enc.len(), before);
        enc.collection_move(4, 5);
        assert!(enc.len() > before);
    }

    #[test]
    fn test_names_are_interned_once() {
        let mut enc = TransactLogEncoder::new();
        enc.insert_group_level_table(TableKey::new(0), "person");
        let first = enc.len();
        enc.rename_group_level_table(TableKey::new(0), "person");
        let second = enc.len() - first;
        // tag + table + index, no string payload
        assert_eq!(second, 3);
        assert_eq!(enc.instruction_count(), 2);

        let bytes = enc.finish();
        assert_eq!(bytes[0], InstructionTag::InternString.as_u8());
        assert!(enc.is_empty());

        // Interning restarts after finish
        enc.rename_group_level_table(TableKey::new(0), "person");
        assert_eq!(enc.as_bytes()[0], InstructionTag::InternString.as_u8());
    }

    #[test]
    fn test_mixed_payload_sizes() {
        let mut buf = Vec::new();
        encode_mixed(&mut buf, &Mixed::Null);
        assert_eq!(buf.len(), 1);

        buf.clear();
        encode_mixed(&mut buf, &Mixed::from("abc"));
        assert_eq!(buf.len(), 1 + 1 + 3);

        buf.clear();
        encode_mixed(&mut buf, &Mixed::Bool(true));
        assert_eq!(buf, vec![MixedType::Bool.as_u8(), 1]);
    }
}
