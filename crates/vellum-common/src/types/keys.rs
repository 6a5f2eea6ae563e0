//! Table, column and object keys.
//!
//! Keys are stable integer handles. Accessors hold keys rather than
//! pointers, and revalidate them against the current snapshot on use.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a table within a group.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TableKey(u32);

impl TableKey {
    /// Null table key.
    pub const NULL: Self = Self(u32::MAX);

    /// Creates a table key from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Returns true unless this is the null key.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

impl fmt::Debug for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "TableKey({})", self.0)
        } else {
            write!(f, "TableKey(NULL)")
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stored type of a column (or of the elements of a collection column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnType {
    /// 64-bit signed integer.
    Int = 0,
    /// Boolean.
    Bool = 1,
    /// UTF-8 string.
    String = 2,
    /// Byte string.
    Binary = 4,
    /// Dynamically typed value.
    Mixed = 6,
    /// Seconds and nanoseconds since the epoch.
    Timestamp = 8,
    /// 64-bit float.
    Double = 10,
    /// Link to an object in a fixed target table.
    Link = 12,
    /// Link to an object in any table.
    TypedLink = 16,
}

impl ColumnType {
    /// Converts the stored representation back into a column type.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Int),
            1 => Some(Self::Bool),
            2 => Some(Self::String),
            4 => Some(Self::Binary),
            6 => Some(Self::Mixed),
            8 => Some(Self::Timestamp),
            10 => Some(Self::Double),
            12 => Some(Self::Link),
            16 => Some(Self::TypedLink),
            _ => None,
        }
    }

    /// Returns the stored representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Column attribute flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnAttrs(u8);

impl ColumnAttrs {
    /// No attributes.
    pub const NONE: Self = Self(0);
    /// Column (or its elements) may hold null.
    pub const NULLABLE: Self = Self(1 << 0);
    /// Column holds a list per object.
    pub const LIST: Self = Self(1 << 1);
    /// Column holds a set per object.
    pub const SET: Self = Self(1 << 2);
    /// Column holds a dictionary per object.
    pub const DICTIONARY: Self = Self(1 << 3);

    /// Checks if all flags of `other` are set.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Returns the union of two flag sets.
    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns true if any collection flag is set.
    #[inline]
    #[must_use]
    pub const fn is_collection(self) -> bool {
        self.0 & (Self::LIST.0 | Self::SET.0 | Self::DICTIONARY.0) != 0
    }

    /// Returns the raw byte value.
    #[inline]
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Creates from a byte value.
    #[inline]
    #[must_use]
    pub const fn from_byte(b: u8) -> Self {
        Self(b)
    }
}

/// Identifies a column within a table.
///
/// Layout of the 64-bit value:
/// - bits 0..16: column index
/// - bits 16..22: column type
/// - bits 22..30: attribute flags
/// - bits 30..62: tag, distinguishing columns that reuse an index
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ColKey(i64);

impl ColKey {
    /// Null column key.
    pub const NULL: Self = Self(i64::MAX);

    /// Builds a column key from its parts.
    #[must_use]
    pub const fn new(index: u16, ty: ColumnType, attrs: ColumnAttrs, tag: u32) -> Self {
        let value = (index as i64)
            | ((ty as i64 & 0x3F) << 16)
            | ((attrs.0 as i64) << 22)
            | (((tag as i64) & 0xFFFF_FFFF) << 30);
        Self(value)
    }

    /// Creates a column key from its raw value.
    #[inline]
    #[must_use]
    pub const fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Returns true unless this is the null key.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != i64::MAX
    }

    /// Returns the column index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        (self.0 & 0xFFFF) as usize
    }

    /// Returns the column type.
    ///
    /// Falls back to `Int` for keys that were never produced by `new`.
    #[must_use]
    pub fn column_type(self) -> ColumnType {
        ColumnType::from_u8(((self.0 >> 16) & 0x3F) as u8).unwrap_or(ColumnType::Int)
    }

    /// Returns the attribute flags.
    #[inline]
    #[must_use]
    pub const fn attrs(self) -> ColumnAttrs {
        ColumnAttrs(((self.0 >> 22) & 0xFF) as u8)
    }

    /// Returns the tag.
    #[inline]
    #[must_use]
    pub const fn tag(self) -> u32 {
        ((self.0 >> 30) & 0xFFFF_FFFF) as u32
    }

    /// Returns true if the column holds a collection per object.
    #[inline]
    #[must_use]
    pub const fn is_collection(self) -> bool {
        self.attrs().is_collection()
    }

    /// Returns true if the column (or its elements) may be null.
    #[inline]
    #[must_use]
    pub const fn is_nullable(self) -> bool {
        self.attrs().contains(ColumnAttrs::NULLABLE)
    }
}

impl fmt::Debug for ColKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(
                f,
                "ColKey({}, {:?}, {:#04x})",
                self.index(),
                self.column_type(),
                self.attrs().as_byte()
            )
        } else {
            write!(f, "ColKey(NULL)")
        }
    }
}

/// Identifies an object within a table.
///
/// Non-negative values are regular keys. `-1` is null. Values below `-1`
/// encode unresolved keys: tombstones standing in for a removed link
/// target, kept so that link collections preserve ordering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ObjKey(i64);

impl ObjKey {
    /// Null object key.
    pub const NULL: Self = Self(-1);

    /// Creates an object key from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Returns true unless this is the null key.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != -1
    }

    /// Returns true if this key is a tombstone.
    #[inline]
    #[must_use]
    pub const fn is_unresolved(self) -> bool {
        self.0 <= -2
    }

    /// Returns the unresolved counterpart of a regular key, or the regular
    /// key of an unresolved one.
    #[inline]
    #[must_use]
    pub const fn get_unresolved(self) -> Self {
        Self(-2 - self.0)
    }
}

impl fmt::Debug for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            write!(f, "ObjKey(NULL)")
        } else if self.is_unresolved() {
            write!(f, "ObjKey(unresolved {})", self.get_unresolved().0)
        } else {
            write!(f, "ObjKey({})", self.0)
        }
    }
}

impl fmt::Display for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A link to an object in any table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjLink {
    /// Table of the target object.
    pub table: TableKey,
    /// Key of the target object.
    pub key: ObjKey,
}

impl ObjLink {
    /// Creates a typed link.
    #[must_use]
    pub const fn new(table: TableKey, key: ObjKey) -> Self {
        Self { table, key }
    }

    /// Returns true if both halves are valid.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.table.is_valid() && self.key.is_valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_col_key_roundtrip_parts() {
        let attrs = ColumnAttrs::NULLABLE.union(ColumnAttrs::LIST);
        let key = ColKey::new(513, ColumnType::String, attrs, 0xDEAD_BEEF);
        assert_eq!(key.index(), 513);
        assert_eq!(key.column_type(), ColumnType::String);
        assert_eq!(key.attrs(), attrs);
        assert_eq!(key.tag(), 0xDEAD_BEEF);
        assert!(key.is_collection());
        assert!(key.is_nullable());
        assert!(key.is_valid());
        assert!(!ColKey::NULL.is_valid());
    }

    #[test]
    fn test_obj_key_unresolved() {
        let key = ObjKey::new(5);
        let tomb = key.get_unresolved();
        assert!(tomb.is_unresolved());
        assert!(tomb.is_valid());
        assert_eq!(tomb.get_unresolved(), key);
        assert!(!ObjKey::NULL.is_valid());
        assert!(!ObjKey::new(0).is_unresolved());
        assert_eq!(ObjKey::new(0).get_unresolved().value(), -2);
    }

    #[test]
    fn test_column_type_from_u8() {
        for ty in [
            ColumnType::Int,
            ColumnType::Bool,
            ColumnType::String,
            ColumnType::Binary,
            ColumnType::Mixed,
            ColumnType::Timestamp,
            ColumnType::Double,
            ColumnType::Link,
            ColumnType::TypedLink,
        ] {
            assert_eq!(ColumnType::from_u8(ty.as_u8()), Some(ty));
        }
        assert_eq!(ColumnType::from_u8(3), None);
    }
}
