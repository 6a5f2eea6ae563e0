//! Sorted set of indices stored as half-open ranges.

use std::fmt;

/// A set of `usize` indices kept as sorted, disjoint, non-adjacent
/// `[begin, end)` ranges.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct IndexSet {
    ranges: Vec<(usize, usize)>,
}

impl IndexSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from arbitrary indices.
    pub fn from_indices(indices: impl IntoIterator<Item = usize>) -> Self {
        let mut set = Self::new();
        for i in indices {
            set.add(i);
        }
        set
    }

    /// Returns true when the set holds no index.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of indices in the set.
    pub fn count(&self) -> usize {
        self.ranges.iter().map(|(b, e)| e - b).sum()
    }

    /// Number of indices strictly below `ndx`.
    pub fn count_before(&self, ndx: usize) -> usize {
        let mut n = 0;
        for &(b, e) in &self.ranges {
            if b >= ndx {
                break;
            }
            n += e.min(ndx) - b;
        }
        n
    }

    /// The underlying ranges.
    pub fn ranges(&self) -> &[(usize, usize)] {
        &self.ranges
    }

    /// Iterates the indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.ranges.iter().flat_map(|&(b, e)| b..e)
    }

    /// Collects the indices.
    pub fn to_vec(&self) -> Vec<usize> {
        self.iter().collect()
    }

    /// Returns true if `ndx` is in the set.
    pub fn contains(&self, ndx: usize) -> bool {
        self.position(ndx).is_ok()
    }

    // Ok(range index) if contained, Err(insertion point) otherwise.
    fn position(&self, ndx: usize) -> Result<usize, usize> {
        let p = self.ranges.partition_point(|&(_, e)| e <= ndx);
        match self.ranges.get(p) {
            Some(&(b, _)) if b <= ndx => Ok(p),
            _ => Err(p),
        }
    }

    /// Adds `ndx`; returns false if it was already present.
    pub fn add(&mut self, ndx: usize) -> bool {
        self.add_range(ndx, ndx + 1)
    }

    /// Adds every index in `[begin, end)`; returns true if anything was new.
    pub fn add_range(&mut self, begin: usize, end: usize) -> bool {
        if begin >= end {
            return false;
        }
        let before = self.count();
        let first = self.ranges.partition_point(|&(_, e)| e < begin);
        let last = self.ranges.partition_point(|&(b, _)| b <= end);
        let (mut b, mut e) = (begin, end);
        if first < last {
            b = b.min(self.ranges[first].0);
            e = e.max(self.ranges[last - 1].1);
        }
        self.ranges.splice(first..last, std::iter::once((b, e)));
        self.count() != before
    }

    /// Removes `ndx`; returns false if it was absent.
    pub fn remove(&mut self, ndx: usize) -> bool {
        let Ok(p) = self.position(ndx) else {
            return false;
        };
        let (b, e) = self.ranges[p];
        match (b == ndx, e == ndx + 1) {
            (true, true) => {
                self.ranges.remove(p);
            }
            (true, false) => self.ranges[p].0 += 1,
            (false, true) => self.ranges[p].1 -= 1,
            (false, false) => {
                self.ranges[p].1 = ndx;
                self.ranges.insert(p + 1, (ndx + 1, e));
            }
        }
        true
    }

    /// Removes every index.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Makes room for a new element at `ndx`: every index at or above
    /// `ndx` moves up by one.
    pub fn shift_for_insert_at(&mut self, ndx: usize) {
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        for &(b, e) in &self.ranges {
            if b >= ndx {
                out.push((b + 1, e + 1));
            } else if e > ndx {
                out.push((b, ndx));
                out.push((ndx + 1, e + 1));
            } else {
                out.push((b, e));
            }
        }
        self.ranges = out;
    }

    /// Records an element inserted at `ndx`.
    pub fn insert_at(&mut self, ndx: usize) {
        self.shift_for_insert_at(ndx);
        self.add(ndx);
    }

    /// Records the element at `ndx` going away: `ndx` is dropped and every
    /// index above it moves down by one.
    pub fn erase_at(&mut self, ndx: usize) {
        self.remove(ndx);
        let mut out: Vec<(usize, usize)> = Vec::with_capacity(self.ranges.len());
        for &(b, e) in &self.ranges {
            let r = if b > ndx { (b - 1, e - 1) } else { (b, e) };
            match out.last_mut() {
                Some(last) if last.1 == r.0 => last.1 = r.1,
                _ => out.push(r),
            }
        }
        self.ranges = out;
    }

    /// Maps an index that skips the members of this set to the index it
    /// denotes once the members are counted.
    ///
    /// With deletions `{1, 2}`, surviving element 1 was originally at 3.
    pub fn shift(&self, mut ndx: usize) -> usize {
        for &(b, e) in &self.ranges {
            if b > ndx {
                break;
            }
            ndx += e - b;
        }
        ndx
    }

    /// Inverse of [`IndexSet::shift`] for an index not in the set.
    pub fn unshift(&self, ndx: usize) -> usize {
        ndx - self.count_before(ndx)
    }
}

impl fmt::Debug for IndexSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<usize> for IndexSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self::from_indices(iter)
    }
}
