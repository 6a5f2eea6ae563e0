//! Leaf node families.
//!
//! Every value type stored in a [`BPlusTree`](super::BPlusTree) names its
//! leaf type through [`TreeValue`]. Leaves made of several arrays keep the
//! subarray refs in a has-refs top array and write back any ref that moves
//! on copy-on-write.

use std::marker::PhantomData;

use vellum_common::types::{Mixed, ObjKey, Ref};

use crate::alloc::SlabAlloc;
use crate::array::{destroy_deep, Array, ArrayType};
use crate::error::{StorageError, StorageResult};

/// Which aggregates a value type supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    /// No aggregates.
    Unsupported,
    /// Integer sum, min, max and average.
    Int,
    /// Floating point sum, min, max and average.
    Double,
    /// Aggregates over the numeric elements of a `Mixed` sequence.
    Mixed,
}

/// A leaf node accessor.
pub trait Leaf: Sized {
    /// Element type.
    type Value: Clone;

    /// Allocates an empty leaf.
    fn create(alloc: &mut SlabAlloc) -> StorageResult<Self>;

    /// Attaches to an existing leaf.
    fn init_from_ref(alloc: &SlabAlloc, r: Ref) -> StorageResult<Self>;

    /// Ref of the leaf's top node.
    fn ref_(&self) -> Ref;

    /// Number of elements.
    fn size(&self) -> usize;

    /// Reads element `ndx`.
    fn get(&self, alloc: &SlabAlloc, ndx: usize) -> Self::Value;

    /// Overwrites element `ndx`.
    fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &Self::Value)
        -> StorageResult<()>;

    /// Inserts before element `ndx`.
    fn insert(
        &mut self,
        alloc: &mut SlabAlloc,
        ndx: usize,
        value: &Self::Value,
    ) -> StorageResult<()>;

    /// Removes element `ndx`.
    fn erase(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> StorageResult<()>;

    /// Shrinks to `new_size` elements.
    fn truncate(&mut self, alloc: &mut SlabAlloc, new_size: usize) -> StorageResult<()>;

    /// Frees the leaf and everything it owns.
    fn destroy(self, alloc: &mut SlabAlloc) -> StorageResult<()> {
        destroy_deep(alloc, self.ref_())
    }

    /// Moves elements `[begin, size)` to the end of `dest`.
    fn move_tail(
        &mut self,
        alloc: &mut SlabAlloc,
        begin: usize,
        dest: &mut Self,
    ) -> StorageResult<()> {
        for i in begin..self.size() {
            let v = self.get(alloc, i);
            dest.insert(alloc, dest.size(), &v)?;
        }
        self.truncate(alloc, begin)
    }
}

/// A value that can be stored in a B+Tree.
pub trait TreeValue: Clone + PartialEq + std::fmt::Debug + Sized {
    /// Leaf type holding this value.
    type Leaf: Leaf<Value = Self>;

    /// Supported aggregates.
    const AGGREGATE: AggregateKind = AggregateKind::Unsupported;

    /// Value used when a slot is created without one.
    fn default_value() -> Self;

    /// Converts into a `Mixed`.
    fn to_mixed(&self) -> Mixed;

    /// Converts from a `Mixed`, if the type matches.
    fn from_mixed(m: &Mixed) -> Option<Self>;

    /// Returns true for the null value of nullable types.
    fn is_null(&self) -> bool {
        false
    }

    /// Name used in type mismatch errors.
    fn type_name() -> &'static str;
}

// =============================================================================
// Integer-like leaves
// =============================================================================

/// A value stored directly as a 64-bit integer.
pub trait IntLike: Copy {
    /// Slots are owned refs.
    const HAS_REFS: bool = false;

    /// Encodes as an integer.
    fn to_i64(self) -> i64;

    /// Decodes from an integer.
    fn from_i64(v: i64) -> Self;
}

impl IntLike for i64 {
    fn to_i64(self) -> i64 {
        self
    }
    fn from_i64(v: i64) -> Self {
        v
    }
}

impl IntLike for bool {
    fn to_i64(self) -> i64 {
        self as i64
    }
    fn from_i64(v: i64) -> Self {
        v != 0
    }
}

impl IntLike for f64 {
    fn to_i64(self) -> i64 {
        self.to_bits() as i64
    }
    fn from_i64(v: i64) -> Self {
        f64::from_bits(v as u64)
    }
}

impl IntLike for ObjKey {
    fn to_i64(self) -> i64 {
        self.value()
    }
    fn from_i64(v: i64) -> Self {
        ObjKey::new(v)
    }
}

impl IntLike for Ref {
    const HAS_REFS: bool = true;

    fn to_i64(self) -> i64 {
        self.to_slot()
    }
    fn from_i64(v: i64) -> Self {
        Ref::from_slot(v)
    }
}

/// Leaf of plain integer-like values.
#[derive(Debug)]
pub struct IntLeaf<T: IntLike> {
    array: Array,
    _marker: PhantomData<T>,
}

impl<T: IntLike> Leaf for IntLeaf<T> {
    type Value = T;

    fn create(alloc: &mut SlabAlloc) -> StorageResult<Self> {
        let ty = if T::HAS_REFS {
            ArrayType::HasRefs
        } else {
            ArrayType::Normal
        };
        Ok(Self {
            array: Array::create_empty(alloc, ty)?,
            _marker: PhantomData,
        })
    }

    fn init_from_ref(alloc: &SlabAlloc, r: Ref) -> StorageResult<Self> {
        Ok(Self {
            array: Array::init_from_ref(alloc, r)?,
            _marker: PhantomData,
        })
    }

    fn ref_(&self) -> Ref {
        self.array.ref_()
    }

    fn size(&self) -> usize {
        self.array.size()
    }

    fn get(&self, alloc: &SlabAlloc, ndx: usize) -> T {
        T::from_i64(self.array.get(alloc, ndx))
    }

    fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &T) -> StorageResult<()> {
        self.array.set(alloc, ndx, value.to_i64())
    }

    fn insert(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &T) -> StorageResult<()> {
        self.array.insert(alloc, ndx, value.to_i64())
    }

    fn erase(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> StorageResult<()> {
        self.array.erase(alloc, ndx)
    }

    fn truncate(&mut self, alloc: &mut SlabAlloc, new_size: usize) -> StorageResult<()> {
        self.array.truncate(alloc, new_size)
    }
}

// =============================================================================
// Nullable leaves
// =============================================================================

/// Leaf of optional integer-like values: `[values, nulls]`.
#[derive(Debug)]
pub struct NullableLeaf<T: IntLike> {
    top: Array,
    values: Array,
    nulls: Array,
    _marker: PhantomData<T>,
}

impl<T: IntLike> NullableLeaf<T> {
    fn sync(&mut self, alloc: &mut SlabAlloc, before: (Ref, Ref)) -> StorageResult<()> {
        if self.values.ref_() != before.0 {
            self.top.set_ref(alloc, 0, self.values.ref_())?;
        }
        if self.nulls.ref_() != before.1 {
            self.top.set_ref(alloc, 1, self.nulls.ref_())?;
        }
        Ok(())
    }

    fn refs(&self) -> (Ref, Ref) {
        (self.values.ref_(), self.nulls.ref_())
    }
}

impl<T: IntLike> Leaf for NullableLeaf<T> {
    type Value = Option<T>;

    fn create(alloc: &mut SlabAlloc) -> StorageResult<Self> {
        let values = Array::create_empty(alloc, ArrayType::Normal)?;
        let nulls = Array::create_empty(alloc, ArrayType::Normal)?;
        let mut top = Array::create_empty(alloc, ArrayType::HasRefs)?;
        top.add(alloc, values.ref_().to_slot())?;
        top.add(alloc, nulls.ref_().to_slot())?;
        Ok(Self {
            top,
            values,
            nulls,
            _marker: PhantomData,
        })
    }

    fn init_from_ref(alloc: &SlabAlloc, r: Ref) -> StorageResult<Self> {
        let top = Array::init_from_ref(alloc, r)?;
        if top.size() != 2 {
            return Err(StorageError::corrupted(r, "nullable leaf needs two subarrays"));
        }
        Ok(Self {
            values: Array::init_from_ref(alloc, top.get_ref(alloc, 0))?,
            nulls: Array::init_from_ref(alloc, top.get_ref(alloc, 1))?,
            top,
            _marker: PhantomData,
        })
    }

    fn ref_(&self) -> Ref {
        self.top.ref_()
    }

    fn size(&self) -> usize {
        self.values.size()
    }

    fn get(&self, alloc: &SlabAlloc, ndx: usize) -> Option<T> {
        if self.nulls.get(alloc, ndx) != 0 {
            None
        } else {
            Some(T::from_i64(self.values.get(alloc, ndx)))
        }
    }

    fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &Option<T>) -> StorageResult<()> {
        let before = self.refs();
        self.values
            .set(alloc, ndx, value.map_or(0, IntLike::to_i64))?;
        self.nulls.set(alloc, ndx, value.is_none() as i64)?;
        self.sync(alloc, before)
    }

    fn insert(
        &mut self,
        alloc: &mut SlabAlloc,
        ndx: usize,
        value: &Option<T>,
    ) -> StorageResult<()> {
        let before = self.refs();
        self.values
            .insert(alloc, ndx, value.map_or(0, IntLike::to_i64))?;
        self.nulls.insert(alloc, ndx, value.is_none() as i64)?;
        self.sync(alloc, before)
    }

    fn erase(&mut self, alloc: &mut SlabAlloc, ndx: usize) -> StorageResult<()> {
        let before = self.refs();
        self.values.erase(alloc, ndx)?;
        self.nulls.erase(alloc, ndx)?;
        self.sync(alloc, before)
    }

    fn truncate(&mut self, alloc: &mut SlabAlloc, new_size: usize) -> StorageResult<()> {
        let before = self.refs();
        self.values.truncate(alloc, new_size)?;
        self.nulls.truncate(alloc, new_size)?;
        self.sync(alloc, before)
    }
}

// =============================================================================
// TreeValue implementations for integer-like types
// =============================================================================

impl TreeValue for i64 {
    type Leaf = IntLeaf<i64>;
    const AGGREGATE: AggregateKind = AggregateKind::Int;

    fn default_value() -> Self {
        0
    }
    fn to_mixed(&self) -> Mixed {
        Mixed::Int(*self)
    }
    fn from_mixed(m: &Mixed) -> Option<Self> {
        m.as_int()
    }
    fn type_name() -> &'static str {
        "Int"
    }
}

impl TreeValue for bool {
    type Leaf = IntLeaf<bool>;

    fn default_value() -> Self {
        false
    }
    fn to_mixed(&self) -> Mixed {
        Mixed::Bool(*self)
    }
    fn from_mixed(m: &Mixed) -> Option<Self> {
        m.as_bool()
    }
    fn type_name() -> &'static str {
        "Bool"
    }
}

impl TreeValue for f64 {
    type Leaf = IntLeaf<f64>;
    const AGGREGATE: AggregateKind = AggregateKind::Double;

    fn default_value() -> Self {
        0.0
    }
    fn to_mixed(&self) -> Mixed {
        Mixed::Double(*self)
    }
    fn from_mixed(m: &Mixed) -> Option<Self> {
        match m {
            Mixed::Double(v) => Some(*v),
            _ => None,
        }
    }
    fn type_name() -> &'static str {
        "Double"
    }
}

impl TreeValue for ObjKey {
    type Leaf = IntLeaf<ObjKey>;

    fn default_value() -> Self {
        ObjKey::NULL
    }
    fn to_mixed(&self) -> Mixed {
        if self.is_valid() {
            Mixed::Link(*self)
        } else {
            Mixed::Null
        }
    }
    fn from_mixed(m: &Mixed) -> Option<Self> {
        match m {
            Mixed::Link(k) => Some(*k),
            Mixed::Null => Some(ObjKey::NULL),
            _ => None,
        }
    }
    fn is_null(&self) -> bool {
        !self.is_valid()
    }
    fn type_name() -> &'static str {
        "Link"
    }
}

impl TreeValue for Ref {
    type Leaf = IntLeaf<Ref>;

    fn default_value() -> Self {
        Ref::NULL
    }
    fn to_mixed(&self) -> Mixed {
        Mixed::Int(self.to_slot())
    }
    fn from_mixed(m: &Mixed) -> Option<Self> {
        m.as_int().map(Ref::from_slot)
    }
    fn is_null(&self) -> bool {
        Ref::is_null(*self)
    }
    fn type_name() -> &'static str {
        "Ref"
    }
}

macro_rules! nullable_tree_value {
    ($t:ty, $name:expr, $agg:expr) => {
        impl TreeValue for Option<$t> {
            type Leaf = NullableLeaf<$t>;
            const AGGREGATE: AggregateKind = $agg;

            fn default_value() -> Self {
                None
            }
            fn to_mixed(&self) -> Mixed {
                self.map_or(Mixed::Null, |v| v.to_mixed())
            }
            fn from_mixed(m: &Mixed) -> Option<Self> {
                if m.is_null() {
                    Some(None)
                } else {
                    <$t as TreeValue>::from_mixed(m).map(Some)
                }
            }
            fn is_null(&self) -> bool {
                self.is_none()
            }
            fn type_name() -> &'static str {
                $name
            }
        }
    };
}

nullable_tree_value!(i64, "Int?", AggregateKind::Int);
nullable_tree_value!(bool, "Bool?", AggregateKind::Unsupported);
nullable_tree_value!(f64, "Double?", AggregateKind::Double);
