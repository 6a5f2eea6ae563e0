//! Transact-log parser.
//!
//! Reads instructions from an [`InputStream`] of byte blocks and feeds them
//! to an [`InstructionHandler`]. Instructions may straddle block
//! boundaries. Parsing stops at the first malformed instruction or the
//! first instruction the handler rejects.

use std::collections::VecDeque;

use bytes::{Buf, Bytes};
use vellum_common::types::{
    ColKey, Mixed, MixedType, ObjKey, ObjLink, TableKey, Timestamp,
};

use crate::error::{ParseError, ParseResult};
use crate::handler::InstructionHandler;
use crate::instruction::InstructionTag;
use crate::varint::{decode_int, MAX_ENC_BYTES_PER_INT};

// =============================================================================
// Input streams
// =============================================================================

/// A source of transact-log bytes delivered in blocks.
pub trait InputStream {
    /// Returns the next non-empty block, or `None` at the end.
    fn next_block(&mut self) -> Option<Bytes>;
}

/// Serves a single buffer.
#[derive(Debug)]
pub struct SimpleInputStream {
    data: Option<Bytes>,
}

impl SimpleInputStream {
    /// Creates a stream over `data`.
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            data: (!data.is_empty()).then_some(data),
        }
    }
}

impl InputStream for SimpleInputStream {
    fn next_block(&mut self) -> Option<Bytes> {
        self.data.take()
    }
}

/// Serves a sequence of changesets back to back, skipping empty ones.
#[derive(Debug, Default)]
pub struct ChangesetInputStream {
    changesets: VecDeque<Bytes>,
}

impl ChangesetInputStream {
    /// Creates a stream over `changesets` in order.
    pub fn new(changesets: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            changesets: changesets.into_iter().collect(),
        }
    }
}

impl InputStream for ChangesetInputStream {
    fn next_block(&mut self) -> Option<Bytes> {
        while let Some(block) = self.changesets.pop_front() {
            if !block.is_empty() {
                return Some(block);
            }
        }
        None
    }
}

// =============================================================================
// Reader
// =============================================================================

struct Reader<'a> {
    input: &'a mut dyn InputStream,
    current: Bytes,
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(input: &'a mut dyn InputStream) -> Self {
        Self {
            input,
            current: Bytes::new(),
            offset: 0,
        }
    }

    fn fill(&mut self) -> bool {
        while !self.current.has_remaining() {
            match self.input.next_block() {
                Some(block) => self.current = block,
                None => return false,
            }
        }
        true
    }

    /// True at a clean end of input.
    fn at_end(&mut self) -> bool {
        !self.fill()
    }

    fn read_u8(&mut self) -> ParseResult<u8> {
        if !self.fill() {
            return Err(ParseError::UnexpectedEnd);
        }
        self.offset += 1;
        Ok(self.current.get_u8())
    }

    fn read_int(&mut self) -> ParseResult<i64> {
        let start = self.offset;
        let mut scratch = [0u8; MAX_ENC_BYTES_PER_INT];
        for i in 0..MAX_ENC_BYTES_PER_INT {
            let b = self.read_u8()?;
            scratch[i] = b;
            if b & 0x80 == 0 {
                return decode_int(&scratch[..=i])
                    .map(|(v, _)| v)
                    .map_err(|e| match e {
                        ParseError::BadVarint { offset } => ParseError::BadVarint {
                            offset: start + offset,
                        },
                        other => other,
                    });
            }
        }
        Err(ParseError::BadVarint {
            offset: start + MAX_ENC_BYTES_PER_INT,
        })
    }

    fn read_usize(&mut self) -> ParseResult<usize> {
        let v = self.read_int()?;
        usize::try_from(v).map_err(|_| ParseError::OutOfRange(v))
    }

    fn read_u32(&mut self) -> ParseResult<u32> {
        let v = self.read_int()?;
        u32::try_from(v).map_err(|_| ParseError::OutOfRange(v))
    }

    fn read_table(&mut self) -> ParseResult<TableKey> {
        self.read_u32().map(TableKey::new)
    }

    fn read_col(&mut self) -> ParseResult<ColKey> {
        self.read_int().map(ColKey::from_raw)
    }

    fn read_key(&mut self) -> ParseResult<ObjKey> {
        self.read_int().map(ObjKey::new)
    }

    fn read_bytes(&mut self) -> ParseResult<Vec<u8>> {
        let mut len = self.read_usize()?;
        let mut out = Vec::with_capacity(len.min(64 * 1024));
        while len > 0 {
            if !self.fill() {
                return Err(ParseError::UnexpectedEnd);
            }
            let n = len.min(self.current.remaining());
            out.extend_from_slice(&self.current[..n]);
            self.current.advance(n);
            self.offset += n;
            len -= n;
        }
        Ok(out)
    }

    fn read_string(&mut self) -> ParseResult<String> {
        String::from_utf8(self.read_bytes()?).map_err(|_| ParseError::BadString)
    }

    fn read_mixed(&mut self) -> ParseResult<Mixed> {
        let code = self.read_int()?;
        let ty = u8::try_from(code)
            .ok()
            .and_then(MixedType::from_u8)
            .ok_or(ParseError::UnknownValueType(code))?;
        Ok(match ty {
            MixedType::Null => Mixed::Null,
            MixedType::Int => Mixed::Int(self.read_int()?),
            MixedType::Bool => Mixed::Bool(self.read_int()? != 0),
            MixedType::Double => Mixed::Double(f64::from_bits(self.read_int()? as u64)),
            MixedType::String => Mixed::String(self.read_string()?),
            MixedType::Binary => Mixed::Binary(self.read_bytes()?),
            MixedType::Timestamp => {
                let seconds = self.read_int()?;
                let nanos = self.read_int()?;
                let nanos = i32::try_from(nanos).map_err(|_| ParseError::OutOfRange(nanos))?;
                Mixed::Timestamp(Timestamp::new(seconds, nanos))
            }
            MixedType::Link => Mixed::Link(self.read_key()?),
            MixedType::TypedLink => {
                let table = self.read_table()?;
                let key = self.read_key()?;
                Mixed::TypedLink(ObjLink::new(table, key))
            }
        })
    }
}

// =============================================================================
// Parser
// =============================================================================

/// Decodes transact logs.
///
/// The parser owns the string table that `InternString` instructions
/// populate. Each changeset restarts its indices at zero, so an index equal
/// to the table length appends and a smaller one rebinds.
#[derive(Debug, Default)]
pub struct TransactLogParser {
    strings: Vec<String>,
}

impl TransactLogParser {
    /// Creates a parser with an empty string table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `input` to the end, calling `handler` for each instruction.
    pub fn parse(
        &mut self,
        input: &mut dyn InputStream,
        handler: &mut dyn InstructionHandler,
    ) -> ParseResult<()> {
        self.strings.clear();
        let mut reader = Reader::new(input);
        while !reader.at_end() {
            let tag = InstructionTag::from_u8(reader.read_u8()?)?;
            if !self.parse_one(tag, &mut reader, handler)? {
                return Err(ParseError::Rejected(tag.name()));
            }
        }
        Ok(())
    }

    fn name(&self, idx: usize) -> ParseResult<&str> {
        self.strings
            .get(idx)
            .map(String::as_str)
            .ok_or(ParseError::BadStringIndex(idx as u64))
    }

    fn parse_one(
        &mut self,
        tag: InstructionTag,
        r: &mut Reader<'_>,
        h: &mut dyn InstructionHandler,
    ) -> ParseResult<bool> {
        Ok(match tag {
            InstructionTag::InternString => {
                let idx = r.read_usize()?;
                let s = r.read_string()?;
                match idx.cmp(&self.strings.len()) {
                    std::cmp::Ordering::Less => self.strings[idx] = s,
                    std::cmp::Ordering::Equal => self.strings.push(s),
                    std::cmp::Ordering::Greater => {
                        return Err(ParseError::BadStringIndex(idx as u64))
                    }
                }
                true
            }
            InstructionTag::InsertGroupLevelTable => {
                let table = r.read_table()?;
                let idx = r.read_usize()?;
                h.insert_group_level_table(table, self.name(idx)?)
            }
            InstructionTag::EraseGroupLevelTable => h.erase_group_level_table(r.read_table()?),
            InstructionTag::RenameGroupLevelTable => {
                let table = r.read_table()?;
                let idx = r.read_usize()?;
                h.rename_group_level_table(table, self.name(idx)?)
            }
            InstructionTag::SelectTable => h.select_table(r.read_table()?),
            InstructionTag::CreateObject => h.create_object(r.read_key()?),
            InstructionTag::RemoveObject => h.remove_object(r.read_key()?),
            InstructionTag::ClearTable => h.clear_table(r.read_usize()?),
            InstructionTag::Modify => {
                let col = r.read_col()?;
                let key = r.read_key()?;
                let value = r.read_mixed()?;
                h.modify_object(col, key, &value)
            }
            InstructionTag::InsertColumn => {
                let col = r.read_col()?;
                let idx = r.read_usize()?;
                let target = r.read_table()?;
                h.insert_column(col, self.name(idx)?, target)
            }
            InstructionTag::EraseColumn => h.erase_column(r.read_col()?),
            InstructionTag::RenameColumn => {
                let col = r.read_col()?;
                let idx = r.read_usize()?;
                h.rename_column(col, self.name(idx)?)
            }
            InstructionTag::TypedLinkChange => {
                let col = r.read_col()?;
                let target = r.read_table()?;
                h.typed_link_change(col, target)
            }
            InstructionTag::SelectCollection => {
                let col = r.read_col()?;
                let key = r.read_key()?;
                h.select_collection(col, key)
            }
            InstructionTag::CollectionInsert => {
                let ndx = r.read_usize()?;
                let value = r.read_mixed()?;
                h.collection_insert(ndx, &value)
            }
            InstructionTag::CollectionSet => {
                let ndx = r.read_usize()?;
                let value = r.read_mixed()?;
                h.collection_set(ndx, &value)
            }
            InstructionTag::CollectionMove => {
                let from = r.read_usize()?;
                let to = r.read_usize()?;
                h.collection_move(from, to)
            }
            InstructionTag::CollectionSwap => {
                let a = r.read_usize()?;
                let b = r.read_usize()?;
                h.collection_swap(a, b)
            }
            InstructionTag::CollectionErase => h.collection_erase(r.read_usize()?),
            InstructionTag::CollectionClear => h.collection_clear(r.read_usize()?),
            InstructionTag::DictionaryInsert => {
                let ndx = r.read_usize()?;
                let key = r.read_string()?;
                let value = r.read_mixed()?;
                h.dictionary_insert(ndx, &key, &value)
            }
            InstructionTag::DictionarySet => {
                let ndx = r.read_usize()?;
                let key = r.read_string()?;
                let value = r.read_mixed()?;
                h.dictionary_set(ndx, &key, &value)
            }
            InstructionTag::DictionaryErase => {
                let ndx = r.read_usize()?;
                let key = r.read_string()?;
                h.dictionary_erase(ndx, &key)
            }
        })
    }
}

/// Parses a single buffer into `handler`.
pub fn parse_changeset(data: &Bytes, handler: &mut dyn InstructionHandler) -> ParseResult<()> {
    let mut input = SimpleInputStream::new(data.clone());
    TransactLogParser::new().parse(&mut input, handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::TransactLogEncoder;
    use crate::handler::RecordingHandler;
    use crate::instruction::Instruction;
    use vellum_common::types::{ColumnAttrs, ColumnType};

    fn sample() -> Vec<Instruction> {
        let col = ColKey::new(0, ColumnType::Int, ColumnAttrs::NULLABLE, 1);
        let list = ColKey::new(1, ColumnType::Mixed, ColumnAttrs::LIST, 2);
        vec![
            Instruction::InsertGroupLevelTable {
                table: TableKey::new(0),
                name: "class_Person".into(),
            },
            Instruction::SelectTable(TableKey::new(0)),
            Instruction::InsertColumn {
                col,
                name: "age".into(),
                target: TableKey::NULL,
            },
            Instruction::CreateObject(ObjKey::new(0)),
            Instruction::Modify {
                col,
                key: ObjKey::new(0),
                value: Mixed::Int(i64::MIN),
            },
            Instruction::Modify {
                col,
                key: ObjKey::new(0),
                value: Mixed::Int(i64::MAX),
            },
            Instruction::SelectCollection {
                col: list,
                key: ObjKey::new(0),
            },
            Instruction::CollectionInsert {
                ndx: 0,
                value: Mixed::Double(-0.5),
            },
            Instruction::CollectionInsert {
                ndx: 1,
                value: Mixed::Timestamp(Timestamp::new(-1, 999_999_999)),
            },
            Instruction::CollectionInsert {
                ndx: 2,
                value: Mixed::TypedLink(ObjLink::new(TableKey::new(3), ObjKey::new(-5))),
            },
            Instruction::CollectionMove { from: 0, to: 2 },
            Instruction::DictionaryInsert {
                ndx: 0,
                key: "k\u{e9}y".into(),
                value: Mixed::Binary(vec![0, 255]),
            },
            Instruction::RenameColumn {
                col,
                name: "age".into(),
            },
            Instruction::ClearTable { old_size: 1 },
        ]
    }

    #[test]
    fn test_encode_then_parse() {
        let instrs = sample();
        let mut enc = TransactLogEncoder::new();
        for i in &instrs {
            enc.encode(i);
        }
        let bytes = enc.finish();

        let mut rec = RecordingHandler::new();
        parse_changeset(&bytes, &mut rec).unwrap();
        assert_eq!(rec.instructions, instrs);
    }

    #[test]
    fn test_instructions_straddle_blocks() {
        let instrs = sample();
        let mut enc = TransactLogEncoder::new();
        for i in &instrs {
            enc.encode(i);
        }
        let bytes = enc.finish();

        // One byte per block
        let blocks: Vec<Bytes> = (0..bytes.len()).map(|i| bytes.slice(i..i + 1)).collect();
        let mut input = ChangesetInputStream::new(blocks);
        let mut rec = RecordingHandler::new();
        TransactLogParser::new().parse(&mut input, &mut rec).unwrap();
        assert_eq!(rec.instructions, instrs);
    }

    #[test]
    fn test_consecutive_changesets_rebind_strings() {
        let mut enc = TransactLogEncoder::new();
        enc.insert_group_level_table(TableKey::new(0), "a");
        let first = enc.finish();
        enc.insert_group_level_table(TableKey::new(1), "b");
        let second = enc.finish();

        let mut input = ChangesetInputStream::new(vec![first, Bytes::new(), second]);
        let mut rec = RecordingHandler::new();
        TransactLogParser::new().parse(&mut input, &mut rec).unwrap();
        assert_eq!(
            rec.instructions,
            vec![
                Instruction::InsertGroupLevelTable {
                    table: TableKey::new(0),
                    name: "a".into()
                },
                Instruction::InsertGroupLevelTable {
                    table: TableKey::new(1),
                    name: "b".into()
                },
            ]
        );
    }

    #[test]
    fn test_truncated_and_unknown_input() {
        let mut enc = TransactLogEncoder::new();
        enc.modify_object(ColKey::from_raw(0), ObjKey::new(1), &Mixed::from("hello"));
        let bytes = enc.finish();
        let cut = bytes.slice(..bytes.len() - 2);
        assert_eq!(
            parse_changeset(&cut, &mut RecordingHandler::new()),
            Err(ParseError::UnexpectedEnd)
        );

        let bad = Bytes::from_static(&[99]);
        assert_eq!(
            parse_changeset(&bad, &mut RecordingHandler::new()),
            Err(ParseError::UnknownInstruction(99))
        );

        // Name index 5 was never interned
        let bad = Bytes::from_static(&[InstructionTag::RenameColumn as u8, 0, 5]);
        assert_eq!(
            parse_changeset(&bad, &mut RecordingHandler::new()),
            Err(ParseError::BadStringIndex(5))
        );
    }

    struct RejectRemovals;

    impl InstructionHandler for RejectRemovals {
        fn remove_object(&mut self, _key: ObjKey) -> bool {
            false
        }
    }

    #[test]
    fn test_handler_rejection_stops_parse() {
        let mut enc = TransactLogEncoder::new();
        enc.create_object(ObjKey::new(1));
        enc.remove_object(ObjKey::new(1));
        enc.create_object(ObjKey::new(2));
        let bytes = enc.finish();
        let err = parse_changeset(&bytes, &mut RejectRemovals).unwrap_err();
        assert_eq!(err, ParseError::Rejected("remove_object"));
        assert!(err.is_fatal());
    }
}
