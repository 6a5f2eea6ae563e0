//! Variable-length leaves.

use std::marker::PhantomData;

use vellum_common::types::{Mixed, Ref};

use super::leaf::{Leaf, TreeValue};
use crate::alloc::SlabAlloc;
use crate::array::{Array, ArrayBlob, ArrayType};
use crate::error::{StorageError, StorageResult};

/// A value stored as an optional byte string.
pub trait BytesLike: Clone {
    /// The bytes, or `None` for null.
    fn as_bytes(&self) -> Option<&[u8]>;

    /// Decodes from stored bytes.
    fn from_bytes(bytes: Option<&[u8]>) -> Self;
}

impl BytesLike for String {
    fn as_bytes(&self) -> Option<&[u8]> {
        Some(str::as_bytes(self))
    }
    fn from_bytes(bytes: Option<&[u8]>) -> Self {
        bytes.map_or_else(String::new, |b| String::from_utf8_lossy(b).into_owned())
    }
}

impl BytesLike for Option<String> {
    fn as_bytes(&self) -> Option<&[u8]> {
        self.as_deref().map(str::as_bytes)
    }
    fn from_bytes(bytes: Option<&[u8]>) -> Self {
        bytes.map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

impl BytesLike for Vec<u8> {
    fn as_bytes(&self) -> Option<&[u8]> {
        Some(self)
    }
    fn from_bytes(bytes: Option<&[u8]>) -> Self {
        bytes.map(<[u8]>::to_vec).unwrap_or_default()
    }
}

impl BytesLike for Option<Vec<u8>> {
    fn as_bytes(&self) -> Option<&[u8]> {
        self.as_deref()
    }
    fn from_bytes(bytes: Option<&[u8]>) -> Self {
        bytes.map(<[u8]>::to_vec)
    }
}

/// Leaf of byte strings: `[ends, blob, nulls]`.
///
/// `ends[i]` is the end offset of element `i` within the blob.
#[derive(Debug)]
pub struct StringLeaf<T: BytesLike> {
    top: Array,
    ends: Array,
    blob: ArrayBlob,
    nulls: Array,
    _marker: PhantomData<T>,
}

impl<T: BytesLike> StringLeaf<T> {
    fn refs(&self) -> [Ref; 3] {
        [self.ends.ref_(), self.blob.ref_(), self.nulls.ref_()]
    }

    fn sync(&mut self, alloc: &mut SlabAlloc, before: [Ref; 3]) -> StorageResult<()> {
        for (slot, (old, new)) in before.iter().zip(self.refs()).enumerate() {
            if *old != new {
                self.top.set_ref(alloc, slot, new)?;
            }
        }
        Ok(())
    }

    fn range(&self, alloc: &SlabAlloc, ndx: usize) -> (usize, usize) {
        let begin = if ndx == 0 {
            0
        } else {
            self.ends.get(alloc, ndx - 1) as usize
        };
        (begin, self.ends.get(alloc, ndx) as usize)
    }

    /// Raw bytes of element `ndx`, `None` for null.
    pub fn get_bytes<'a>(&self, alloc: &'a SlabAlloc, ndx: usize) -> Option<&'a [u8]> {
        if self.nulls.get(alloc, ndx) != 0 {
            return None;
        }
        let (begin, end) = self.range(alloc, ndx);
        Some(&self.blob.bytes(alloc)[begin..end])
    }
}

impl<T: BytesLike> Leaf for StringLeaf<T> {
    type Value = T;

    fn create(alloc: &mut SlabAlloc) -> StorageResult<Self> {
        let ends = Array::create_empty(alloc, ArrayType::Normal)?;
        let blob = ArrayBlob::create(alloc, &[])?;
        let nulls = Array::create_empty(alloc, ArrayType::Normal)?;
        let mut top = Array::create_empty(alloc, ArrayType::HasRefs)?;
        for r in [ends.ref_(), blob.ref_(), nulls.ref_()] {
            top.add(alloc, r.to_slot())?;
        }
        Ok(Self {
            top,
            ends,
            blob,
            nulls,
            _marker: PhantomData,
        })
    }

    fn init_from_ref(alloc: &SlabAlloc, r: Ref) -> StorageResult<Self> {
        let top = Array::init_from_ref(alloc, r)?;
        if top.size() != 3 {
            return Err(StorageError::corrupted(r, "string leaf needs three subarrays"));
        }
        let leaf = Self {
            ends: Array::init_from_ref(alloc, top.get_ref(alloc, 0))?,
            blob: ArrayBlob::init_from_ref(alloc, top.get_ref(alloc, 1))?,
            nulls: Array::init_from_ref(alloc, top.get_ref(alloc, 2))?,
            top,
            _marker: PhantomData,
        };
        if leaf.ends.size() != leaf.nulls.size() {
            return Err(StorageError::corrupted(r, "string leaf arrays disagree in size"));
        }
        Ok(leaf)
    }

    fn ref_(&self) -> Ref {
        self.top.ref_()
    }

    fn size(&self) -> usize {
        self.ends.size()
    }

    fn get(&self, alloc: &SlabAlloc, ndx: usize) -> T {
        T::from_bytes(self.get_bytes(alloc, ndx))
    }

    fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &T) -> StorageResult<()> {
        if ndx >= self.size() {
            return Err(StorageError::out_of_bounds(ndx, self.size()));
        }
        let before = self.refs();
        let (begin, end) = self.range(alloc, ndx);
        let data = value.as_bytes().unwrap_or(&[]);
        self.blob.replace(alloc, begin, end, data)?;
        let diff = data.len() as i64 - (end - begin) as i64;
        if diff != 0 {
            let size = self.size();
            self.ends.adjust(alloc, ndx, size, diff)?;
        }
        self.nulls
            .set(alloc, ndx, value.as_bytes().is_none() as i64)?;
        self.sync(alloc, before)
    }

    fn insert(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &T) -> StorageResult<()> {
        if ndx > self.size() {
            return Err(StorageError::out_of_bounds(ndx, self.size()));
        }
        let before = self.refs();
        let begin = if ndx == 0 {
            0
        } else {
            self.ends.get(alloc, ndx - 1) as usize
        };
        let data = value.as_bytes().unwrap_or(&[]);
        self.blob.replace(alloc, begin, begin, data)?;
        self.ends.insert(alloc, ndx, (begin + data.len()) as i64)?;
        if !data.is_empty() {
            let size = self.size();
            self.ends.adjust(alloc, ndx + 1, size, data.len() as i64)?;
        }
        self.nulls
            .insert(alloc, ndx, value.as_bytes().is_none() as i64)?;
        self.sync(alloc, before)
    }

    fn erase(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> StorageResult<()> {
        if ndx >= self.size() {
            return Err(StorageError::out_of_bounds(ndx, self.size()));
        }
        let before = self.refs();
        let (begin, end) = self.range(alloc, ndx);
        self.blob.replace(alloc, begin, end, &[])?;
        self.ends.erase(alloc, ndx)?;
        if end > begin {
            let size = self.size();
            self.ends
                .adjust(alloc, ndx, size, -((end - begin) as i64))?;
        }
        self.nulls.erase(alloc, ndx)?;
        self.sync(alloc, before)
    }

    fn truncate(&mut self, alloc: &mut SlabAlloc, new_size: usize) -> StorageResult<()> {
        if new_size > self.size() {
            return Err(StorageError::out_of_bounds(new_size, self.size()));
        }
        let before = self.refs();
        let keep = if new_size == 0 {
            0
        } else {
            self.ends.get(alloc, new_size - 1) as usize
        };
        let len = self.blob.len();
        self.blob.replace(alloc, keep, len, &[])?;
        self.ends.truncate(alloc, new_size)?;
        self.nulls.truncate(alloc, new_size)?;
        self.sync(alloc, before)
    }
}

impl TreeValue for String {
    type Leaf = StringLeaf<String>;

    fn default_value() -> Self {
        String::new()
    }
    fn to_mixed(&self) -> Mixed {
        Mixed::String(self.clone())
    }
    fn from_mixed(m: &Mixed) -> Option<Self> {
        m.as_str().map(str::to_owned)
    }
    fn type_name() -> &'static str {
        "String"
    }
}

impl TreeValue for Option<String> {
    type Leaf = StringLeaf<Option<String>>;

    fn default_value() -> Self {
        None
    }
    fn to_mixed(&self) -> Mixed {
        self.clone().map_or(Mixed::Null, Mixed::String)
    }
    fn from_mixed(m: &Mixed) -> Option<Self> {
        match m {
            Mixed::Null => Some(None),
            Mixed::String(s) => Some(Some(s.clone())),
            _ => None,
        }
    }
    fn is_null(&self) -> bool {
        self.is_none()
    }
    fn type_name() -> &'static str {
        "String?"
    }
}

impl TreeValue for Vec<u8> {
    type Leaf = StringLeaf<Vec<u8>>;

    fn default_value() -> Self {
        Vec::new()
    }
    fn to_mixed(&self) -> Mixed {
        Mixed::Binary(self.clone())
    }
    fn from_mixed(m: &Mixed) -> Option<Self> {
        match m {
            Mixed::Binary(b) => Some(b.clone()),
            _ => None,
        }
    }
    fn type_name() -> &'static str {
        "Binary"
    }
}

impl TreeValue for Option<Vec<u8>> {
    type Leaf = StringLeaf<Option<Vec<u8>>>;

    fn default_value() -> Self {
        None
    }
    fn to_mixed(&self) -> Mixed {
        self.clone().map_or(Mixed::Null, Mixed::Binary)
    }
    fn from_mixed(m: &Mixed) -> Option<Self> {
        match m {
            Mixed::Null => Some(None),
            Mixed::Binary(b) => Some(Some(b.clone())),
            _ => None,
        }
    }
    fn is_null(&self) -> bool {
        self.is_none()
    }
    fn type_name() -> &'static str {
        "Binary?"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_leaf_edit() {
        let mut alloc = SlabAlloc::new_writable();
        let mut leaf = StringLeaf::<Option<String>>::create(&mut alloc).unwrap();
        leaf.insert(&mut alloc, 0, &Some("alpha".into())).unwrap();
        leaf.insert(&mut alloc, 1, &None).unwrap();
        leaf.insert(&mut alloc, 1, &Some("".into())).unwrap();
        leaf.insert(&mut alloc, 0, &Some("zz".into())).unwrap();
        leaf.set(&mut alloc, 1, &Some("a".into())).unwrap();

        let values: Vec<_> = (0..leaf.size()).map(|i| leaf.get(&alloc, i)).collect();
        assert_eq!(
            values,
            vec![Some("zz".into()), Some("a".into()), Some("".into()), None]
        );

        leaf.erase(&mut alloc, 0).unwrap();
        leaf.truncate(&mut alloc, 2).unwrap();
        let again = StringLeaf::<Option<String>>::init_from_ref(&alloc, leaf.ref_()).unwrap();
        assert_eq!(again.get(&alloc, 0), Some("a".to_string()));
        assert_eq!(again.get(&alloc, 1), Some(String::new()));
        assert_eq!(again.size(), 2);
    }

    #[test]
    fn test_binary_leaf_null_vs_empty() {
        let mut alloc = SlabAlloc::new_writable();
        let mut leaf = StringLeaf::<Option<Vec<u8>>>::create(&mut alloc).unwrap();
        leaf.insert(&mut alloc, 0, &None).unwrap();
        leaf.insert(&mut alloc, 1, &Some(Vec::new())).unwrap();
        assert_eq!(leaf.get(&alloc, 0), None);
        assert_eq!(leaf.get(&alloc, 1), Some(Vec::new()));
    }
}
