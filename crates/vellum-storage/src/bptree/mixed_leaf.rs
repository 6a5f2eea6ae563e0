//! Leaf of dynamically typed values.

use vellum_common::types::{Mixed, MixedType, ObjKey, ObjLink, Ref, TableKey, Timestamp};

use super::leaf::{AggregateKind, Leaf, TreeValue};
use super::string_leaf::StringLeaf;
use crate::alloc::SlabAlloc;
use crate::array::{Array, ArrayType};
use crate::error::{StorageError, StorageResult};

/// Leaf of `Mixed` values: `[types, ints, aux, payloads]`.
///
/// Fixed-size values live in `ints` (and `aux` for the second half of
/// timestamps and typed links); strings and binaries live in `payloads`.
#[derive(Debug)]
pub struct MixedLeaf {
    top: Array,
    types: Array,
    ints: Array,
    aux: Array,
    payloads: StringLeaf<Option<Vec<u8>>>,
}

struct Encoded {
    ty: MixedType,
    int: i64,
    aux: i64,
    payload: Option<Vec<u8>>,
}

fn encode(value: &Mixed) -> Encoded {
    let (int, aux, payload) = match value {
        Mixed::Null => (0, 0, None),
        Mixed::Int(v) => (*v, 0, None),
        Mixed::Bool(v) => (*v as i64, 0, None),
        Mixed::Double(v) => (v.to_bits() as i64, 0, None),
        Mixed::String(s) => (0, 0, Some(s.as_bytes().to_vec())),
        Mixed::Binary(b) => (0, 0, Some(b.clone())),
        Mixed::Timestamp(t) => (t.seconds, t.nanoseconds as i64, None),
        Mixed::Link(k) => (k.value(), 0, None),
        Mixed::TypedLink(l) => (l.key.value(), l.table.value() as i64, None),
    };
    Encoded {
        ty: value.get_type(),
        int,
        aux,
        payload,
    }
}

impl MixedLeaf {
    fn refs(&self) -> [Ref; 4] {
        [
            self.types.ref_(),
            self.ints.ref_(),
            self.aux.ref_(),
            self.payloads.ref_(),
        ]
    }

    fn sync(&mut self, alloc: &mut SlabAlloc, before: [Ref; 4]) -> StorageResult<()> {
        for (slot, (old, new)) in before.iter().zip(self.refs()).enumerate() {
            if *old != new {
                self.top.set_ref(alloc, slot, new)?;
            }
        }
        Ok(())
    }

    /// Type tag of element `ndx`.
    pub fn get_type(&self, alloc: &SlabAlloc, ndx: usize) -> MixedType {
        MixedType::from_u8(self.types.get(alloc, ndx) as u8).unwrap_or(MixedType::Null)
    }
}

impl Leaf for MixedLeaf {
    type Value = Mixed;

    fn create(alloc: &mut SlabAlloc) -> StorageResult<Self> {
        let types = Array::create_empty(alloc, ArrayType::Normal)?;
        let ints = Array::create_empty(alloc, ArrayType::Normal)?;
        let aux = Array::create_empty(alloc, ArrayType::Normal)?;
        let payloads = StringLeaf::create(alloc)?;
        let mut top = Array::create_empty(alloc, ArrayType::HasRefs)?;
        for r in [types.ref_(), ints.ref_(), aux.ref_(), payloads.ref_()] {
            top.add(alloc, r.to_slot())?;
        }
        Ok(Self {
            top,
            types,
            ints,
            aux,
            payloads,
        })
    }

    fn init_from_ref(alloc: &SlabAlloc, r: Ref) -> StorageResult<Self> {
        let top = Array::init_from_ref(alloc, r)?;
        if top.size() != 4 {
            return Err(StorageError::corrupted(r, "mixed leaf needs four subarrays"));
        }
        Ok(Self {
            types: Array::init_from_ref(alloc, top.get_ref(alloc, 0))?,
            ints: Array::init_from_ref(alloc, top.get_ref(alloc, 1))?,
            aux: Array::init_from_ref(alloc, top.get_ref(alloc, 2))?,
            payloads: StringLeaf::init_from_ref(alloc, top.get_ref(alloc, 3))?,
            top,
        })
    }

    fn ref_(&self) -> Ref {
        self.top.ref_()
    }

    fn size(&self) -> usize {
        self.types.size()
    }

    fn get(&self, alloc: &SlabAlloc, ndx: usize) -> Mixed {
        let int = self.ints.get(alloc, ndx);
        match self.get_type(alloc, ndx) {
            MixedType::Null => Mixed::Null,
            MixedType::Int => Mixed::Int(int),
            MixedType::Bool => Mixed::Bool(int != 0),
            MixedType::Double => Mixed::Double(f64::from_bits(int as u64)),
            MixedType::String => Mixed::String(
                String::from_utf8_lossy(self.payloads.get_bytes(alloc, ndx).unwrap_or(&[]))
                    .into_owned(),
            ),
            MixedType::Binary => {
                Mixed::Binary(self.payloads.get(alloc, ndx).unwrap_or_default())
            }
            MixedType::Timestamp => {
                Mixed::Timestamp(Timestamp::new(int, self.aux.get(alloc, ndx) as i32))
            }
            MixedType::Link => Mixed::Link(ObjKey::new(int)),
            MixedType::TypedLink => Mixed::TypedLink(ObjLink::new(
                TableKey::new(self.aux.get(alloc, ndx) as u32),
                ObjKey::new(int),
            )),
        }
    }

    fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &Mixed) -> StorageResult<()> {
        let before = self.refs();
        let e = encode(value);
        self.types.set(alloc, ndx, e.ty.as_u8() as i64)?;
        self.ints.set(alloc, ndx, e.int)?;
        self.aux.set(alloc, ndx, e.aux)?;
        self.payloads.set(alloc, ndx, &e.payload)?;
        self.sync(alloc, before)
    }

    fn insert(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &Mixed) -> StorageResult<()> {
        let before = self.refs();
        let e = encode(value);
        self.types.insert(alloc, ndx, e.ty.as_u8() as i64)?;
        self.ints.insert(alloc, ndx, e.int)?;
        self.aux.insert(alloc, ndx, e.aux)?;
        self.payloads.insert(alloc, ndx, &e.payload)?;
        self.sync(alloc, before)
    }

    fn erase(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> StorageResult<()> {
        let before = self.refs();
        self.types.erase(alloc, ndx)?;
        self.ints.erase(alloc, ndx)?;
        self.aux.erase(alloc, ndx)?;
        self.payloads.erase(alloc, ndx)?;
        self.sync(alloc, before)
    }

    fn truncate(&mut self, alloc: &mut SlabAlloc, new_size: usize) -> StorageResult<()> {
        let before = self.refs();
        self.types.truncate(alloc, new_size)?;
        self.ints.truncate(alloc, new_size)?;
        self.aux.truncate(alloc, new_size)?;
        self.payloads.truncate(alloc, new_size)?;
        self.sync(alloc, before)
    }
}

impl TreeValue for Mixed {
    type Leaf = MixedLeaf;
    const AGGREGATE: AggregateKind = AggregateKind::Mixed;

    fn default_value() -> Self {
        Mixed::Null
    }
    fn to_mixed(&self) -> Mixed {
        self.clone()
    }
    fn from_mixed(m: &Mixed) -> Option<Self> {
        Some(m.clone())
    }
    fn is_null(&self) -> bool {
        Mixed::is_null(self)
    }
    fn type_name() -> &'static str {
        "Mixed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_leaf_all_types() {
        let mut alloc = SlabAlloc::new_writable();
        let mut leaf = MixedLeaf::create(&mut alloc).unwrap();
        let values = vec![
            Mixed::Null,
            Mixed::Int(-7),
            Mixed::Bool(true),
            Mixed::Double(2.5),
            Mixed::String("text".into()),
            Mixed::Binary(vec![0, 255]),
            Mixed::Timestamp(Timestamp::new(1_700_000_000, 500)),
            Mixed::Link(ObjKey::new(12)),
            Mixed::TypedLink(ObjLink::new(TableKey::new(3), ObjKey::new(4))),
        ];
        for v in &values {
            leaf.insert(&mut alloc, leaf.size(), v).unwrap();
        }
        let again = MixedLeaf::init_from_ref(&alloc, leaf.ref_()).unwrap();
        let read: Vec<_> = (0..again.size()).map(|i| again.get(&alloc, i)).collect();
        assert_eq!(read, values);
    }

    #[test]
    fn test_mixed_leaf_overwrite_changes_type() {
        let mut alloc = SlabAlloc::new_writable();
        let mut leaf = MixedLeaf::create(&mut alloc).unwrap();
        leaf.insert(&mut alloc, 0, &Mixed::String("long string value".into()))
            .unwrap();
        leaf.insert(&mut alloc, 1, &Mixed::String("b".into())).unwrap();
        leaf.set(&mut alloc, 0, &Mixed::Int(1)).unwrap();
        assert_eq!(leaf.get(&alloc, 0), Mixed::Int(1));
        assert_eq!(leaf.get(&alloc, 1), Mixed::String("b".into()));
        assert_eq!(leaf.get_type(&alloc, 0), MixedType::Int);
    }
}
