//! Storage and versioning identifiers.
//!
//! These types provide type-safe wrappers around the integers that name
//! storage blocks and snapshots, preventing accidental mixing of the two.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::REF_ALIGNMENT;

/// Ref - names a block of allocator-managed storage.
///
/// A ref is an 8-byte aligned offset, not a pointer. `0` is reserved for
/// null. Refs below the allocator's baseline belong to a committed snapshot
/// and are immutable; refs at or above it belong to the write in progress.
///
/// # Example
///
/// ```rust
/// use vellum_common::types::Ref;
///
/// let r = Ref::new(64);
/// assert!(!r.is_null());
/// assert!(Ref::NULL.is_null());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Ref(u64);

impl Ref {
    /// The null ref.
    pub const NULL: Self = Self(0);

    /// Creates a new `Ref` from a raw offset.
    #[inline]
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Returns the raw offset.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true for the null ref.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the ref has the required 8-byte alignment.
    #[inline]
    #[must_use]
    pub const fn is_aligned(self) -> bool {
        self.0 % REF_ALIGNMENT == 0
    }

    /// Reinterprets a slot value as a ref.
    ///
    /// Only meaningful for slot values whose low bit is clear.
    #[inline]
    #[must_use]
    pub const fn from_slot(value: i64) -> Self {
        Self(value as u64)
    }

    /// Returns the slot representation of this ref.
    #[inline]
    #[must_use]
    pub const fn to_slot(self) -> i64 {
        self.0 as i64
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Ref(NULL)")
        } else {
            write!(f, "Ref({})", self.0)
        }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Ref {
    #[inline]
    fn from(offset: u64) -> Self {
        Self::new(offset)
    }
}

/// Identifies an immutable snapshot.
///
/// `version` is the commit number; `reader_idx` names the slot in the
/// shared read-lock ring that pins the snapshot against reclamation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VersionId {
    /// Commit number of the snapshot.
    pub version: u64,
    /// Slot in the read-lock ring.
    pub reader_idx: u32,
}

impl VersionId {
    /// Creates a new version identifier.
    #[inline]
    #[must_use]
    pub const fn new(version: u64, reader_idx: u32) -> Self {
        Self {
            version,
            reader_idx,
        }
    }
}

impl fmt::Debug for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionId({}@{})", self.version, self.reader_idx)
    }
}

/// Kind of history a file carries.
///
/// Once a file has a history other than `None` it keeps that kind for the
/// rest of its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum HistoryType {
    /// No history.
    #[default]
    None = 0,
    /// Local changeset history for notifications and promote-to-write.
    InRealm = 2,
    /// History of a sync client: changesets plus sync progress.
    SyncClient = 3,
    /// History of a sync server.
    SyncServer = 4,
}

impl HistoryType {
    /// Converts a stored value back into a history type.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            2 => Some(Self::InRealm),
            3 => Some(Self::SyncClient),
            4 => Some(Self::SyncServer),
            _ => None,
        }
    }

    /// Returns the stored representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns true if a file with history `stored` may be opened with
    /// `self` as the requested history.
    ///
    /// A file without history accepts any kind; otherwise the kinds must
    /// agree.
    #[must_use]
    pub fn is_compatible_with(self, stored: HistoryType) -> bool {
        stored == HistoryType::None || stored == self
    }
}
