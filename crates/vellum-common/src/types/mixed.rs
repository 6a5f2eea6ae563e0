//! The dynamically typed `Mixed` value.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use super::keys::{ObjKey, ObjLink};

/// A point in time with nanosecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub seconds: i64,
    /// Nanoseconds within the second, always in `0..1_000_000_000` for
    /// non-negative `seconds`.
    pub nanoseconds: i32,
}

impl Timestamp {
    /// Creates a timestamp.
    #[must_use]
    pub const fn new(seconds: i64, nanoseconds: i32) -> Self {
        Self {
            seconds,
            nanoseconds,
        }
    }
}

/// Type tag of a [`Mixed`] value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MixedType {
    /// Null.
    Null = 0,
    /// Integer.
    Int = 1,
    /// Boolean.
    Bool = 2,
    /// Double.
    Double = 3,
    /// String.
    String = 4,
    /// Binary.
    Binary = 5,
    /// Timestamp.
    Timestamp = 6,
    /// Link within a fixed target table.
    Link = 7,
    /// Link to any table.
    TypedLink = 8,
}

impl MixedType {
    /// Converts a stored tag back into a type.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Null,
            1 => Self::Int,
            2 => Self::Bool,
            3 => Self::Double,
            4 => Self::String,
            5 => Self::Binary,
            6 => Self::Timestamp,
            7 => Self::Link,
            8 => Self::TypedLink,
            _ => return None,
        })
    }

    /// Returns the stored tag.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    // Numeric types compare with each other by value.
    fn rank(self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool => 1,
            Self::Int | Self::Double => 2,
            Self::Timestamp => 3,
            Self::String => 4,
            Self::Binary => 5,
            Self::Link => 6,
            Self::TypedLink => 7,
        }
    }
}

/// A value of any storable type.
///
/// `Mixed` is the currency of scalar get/set, of `Mixed` columns and
/// collections, and of the values carried by transact-log instructions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Mixed {
    /// No value.
    #[default]
    Null,
    /// 64-bit integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Byte string.
    Binary(Vec<u8>),
    /// Timestamp.
    Timestamp(Timestamp),
    /// Link into the column's target table.
    Link(ObjKey),
    /// Link into any table.
    TypedLink(ObjLink),
}

impl Mixed {
    /// Returns the type tag.
    #[must_use]
    pub fn get_type(&self) -> MixedType {
        match self {
            Self::Null => MixedType::Null,
            Self::Int(_) => MixedType::Int,
            Self::Bool(_) => MixedType::Bool,
            Self::Double(_) => MixedType::Double,
            Self::String(_) => MixedType::String,
            Self::Binary(_) => MixedType::Binary,
            Self::Timestamp(_) => MixedType::Timestamp,
            Self::Link(_) => MixedType::Link,
            Self::TypedLink(_) => MixedType::TypedLink,
        }
    }

    /// Returns true for `Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the integer payload, if any.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the boolean payload, if any.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the numeric payload as a double, if any.
    #[must_use]
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Returns the string payload, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the link payload, if any.
    #[must_use]
    pub fn as_link(&self) -> Option<ObjKey> {
        match self {
            Self::Link(k) => Some(*k),
            _ => None,
        }
    }

    /// Total order over all values.
    ///
    /// Values of different types order by type, except that integers and
    /// doubles compare numerically. NaN sorts below every other double.
    #[must_use]
    pub fn compare(&self, other: &Mixed) -> Ordering {
        let (ra, rb) = (self.get_type().rank(), other.get_type().rank());
        if ra != rb {
            return ra.cmp(&rb);
        }
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Double(a), Self::Double(b)) => cmp_double(*a, *b),
            (Self::Int(a), Self::Double(b)) => cmp_double(*a as f64, *b),
            (Self::Double(a), Self::Int(b)) => cmp_double(*a, *b as f64),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Binary(a), Self::Binary(b)) => a.cmp(b),
            (Self::Link(a), Self::Link(b)) => a.cmp(b),
            (Self::TypedLink(a), Self::TypedLink(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

fn cmp_double(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.total_cmp(&b),
    }
}

impl fmt::Display for Mixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Int(v) => write!(f, "{}", v),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::String(s) => write!(f, "\"{}\"", s),
            Self::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Self::Timestamp(t) => write!(f, "T{}:{}", t.seconds, t.nanoseconds),
            Self::Link(k) => write!(f, "link({})", k),
            Self::TypedLink(l) => write!(f, "link({}:{})", l.table, l.key),
        }
    }
}

impl From<i64> for Mixed {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Mixed {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Mixed {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Mixed {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Mixed {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Mixed {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(v)
    }
}

impl From<Timestamp> for Mixed {
    fn from(v: Timestamp) -> Self {
        Self::Timestamp(v)
    }
}

impl From<ObjKey> for Mixed {
    fn from(v: ObjKey) -> Self {
        Self::Link(v)
    }
}

impl From<ObjLink> for Mixed {
    fn from(v: ObjLink) -> Self {
        Self::TypedLink(v)
    }
}

impl<T: Into<Mixed>> From<Option<T>> for Mixed {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TableKey;

    #[test]
    fn test_compare_across_types() {
        assert_eq!(Mixed::Null.compare(&Mixed::Int(0)), Ordering::Less);
        assert_eq!(Mixed::Int(2).compare(&Mixed::Double(2.0)), Ordering::Equal);
        assert_eq!(Mixed::Double(1.5).compare(&Mixed::Int(2)), Ordering::Less);
        assert_eq!(
            Mixed::from("b").compare(&Mixed::from("a")),
            Ordering::Greater
        );
        assert_eq!(
            Mixed::Double(f64::NAN).compare(&Mixed::Double(f64::NEG_INFINITY)),
            Ordering::Less
        );
        assert_eq!(Mixed::Bool(true).compare(&Mixed::Int(0)), Ordering::Less);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(Mixed::from(None::<i64>), Mixed::Null);
        assert_eq!(Mixed::from(Some(4i64)), Mixed::Int(4));
        let link = ObjLink::new(TableKey::new(1), ObjKey::new(9));
        assert_eq!(Mixed::from(link).get_type(), MixedType::TypedLink);
        assert_eq!(Mixed::Int(3).as_double(), Some(3.0));
        assert!(Mixed::default().is_null());
    }

    #[test]
    fn test_mixed_type_tags() {
        for tag in 0..=8u8 {
            let ty = MixedType::from_u8(tag).unwrap();
            assert_eq!(ty.as_u8(), tag);
        }
        assert!(MixedType::from_u8(9).is_none());
    }
}
