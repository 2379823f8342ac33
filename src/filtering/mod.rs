//! Exclusion filters for search.
//!
//! Search entry points take a [`BitsetView`]: bit `i` set means database entry `i` is
//! excluded. An empty view excludes nothing. [`IdSelector`] describes *included* ids
//! declaratively and is lowered to a [`Bitset`] with [`Bitset::from_selector`].

use std::collections::HashSet;

/// Borrowed exclusion bitset.
#[derive(Debug, Clone, Copy, Default)]
pub struct BitsetView<'a> {
    bits: &'a [u8],
    num_bits: usize,
}

impl<'a> BitsetView<'a> {
    /// View over `bits`, holding `num_bits` meaningful bits.
    #[must_use]
    pub fn new(bits: &'a [u8], num_bits: usize) -> Self {
        debug_assert!(bits.len() * 8 >= num_bits);
        Self { bits, num_bits }
    }

    /// The view that excludes nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// True when no id can be excluded.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_bits == 0
    }

    /// Number of ids covered.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.num_bits
    }

    /// Whether `id` is excluded. Ids past the end are never excluded.
    #[inline]
    #[must_use]
    pub fn test(&self, id: usize) -> bool {
        id < self.num_bits && (self.bits[id >> 3] >> (id & 7)) & 1 == 1
    }

    /// Whether every id in `start..end` is excluded.
    #[must_use]
    pub fn all_excluded(&self, start: usize, end: usize) -> bool {
        !self.is_empty() && end <= self.num_bits && (start..end).all(|i| self.test(i))
    }

    /// Number of excluded ids.
    #[must_use]
    pub fn count(&self) -> usize {
        let full = self.num_bits / 8;
        let mut c: usize = self.bits[..full]
            .iter()
            .map(|b| b.count_ones() as usize)
            .sum();
        for i in full * 8..self.num_bits {
            c += usize::from(self.test(i));
        }
        c
    }
}

/// Owned exclusion bitset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitset {
    bits: Vec<u8>,
    num_bits: usize,
}

impl Bitset {
    /// All-clear bitset over `num_bits` ids.
    #[must_use]
    pub fn new(num_bits: usize) -> Self {
        Self {
            bits: vec![0; num_bits.div_ceil(8)],
            num_bits,
        }
    }

    /// Exclude every id in `0..num_bits` that `selector` does not select.
    #[must_use]
    pub fn from_selector(selector: &IdSelector, num_bits: usize) -> Self {
        let mut bs = Self::new(num_bits);
        for id in 0..num_bits {
            if !selector.is_member(id as i64) {
                bs.set(id);
            }
        }
        bs
    }

    /// Exclude `id`.
    #[inline]
    pub fn set(&mut self, id: usize) {
        assert!(id < self.num_bits, "bit {id} out of range {}", self.num_bits);
        self.bits[id >> 3] |= 1 << (id & 7);
    }

    /// Re-include `id`.
    #[inline]
    pub fn clear(&mut self, id: usize) {
        assert!(id < self.num_bits, "bit {id} out of range {}", self.num_bits);
        self.bits[id >> 3] &= !(1 << (id & 7));
    }

    /// Borrow as a view.
    #[must_use]
    pub fn view(&self) -> BitsetView<'_> {
        BitsetView::new(&self.bits, self.num_bits)
    }
}

/// Declarative set of included ids.
#[derive(Debug, Clone)]
pub enum IdSelector {
    /// `imin <= id < imax`.
    Range { imin: i64, imax: i64 },
    /// Explicit list, scanned linearly.
    Array(Vec<i64>),
    /// Explicit list, hashed.
    Batch(HashSet<i64>),
    /// Ids selected by every inner selector.
    And(Vec<IdSelector>),
    /// Ids selected by any inner selector.
    Or(Vec<IdSelector>),
    /// Complement.
    Not(Box<IdSelector>),
}

impl IdSelector {
    /// Range selector.
    #[must_use]
    pub fn range(imin: i64, imax: i64) -> Self {
        Self::Range { imin, imax }
    }

    /// Hashed selector over `ids`.
    #[must_use]
    pub fn batch(ids: impl IntoIterator<Item = i64>) -> Self {
        Self::Batch(ids.into_iter().collect())
    }

    /// Whether `id` is selected.
    #[must_use]
    pub fn is_member(&self, id: i64) -> bool {
        match self {
            Self::Range { imin, imax } => *imin <= id && id < *imax,
            Self::Array(ids) => ids.contains(&id),
            Self::Batch(set) => set.contains(&id),
            Self::And(sels) => sels.iter().all(|s| s.is_member(id)),
            Self::Or(sels) => sels.iter().any(|s| s.is_member(id)),
            Self::Not(inner) => !inner.is_member(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_view_excludes_nothing() {
        let v = BitsetView::empty();
        assert!(v.is_empty());
        assert!(!v.test(0));
        assert!(!v.all_excluded(0, 32));
    }

    #[test]
    fn set_and_count() {
        let mut bs = Bitset::new(70);
        for i in [0, 9, 64, 69] {
            bs.set(i);
        }
        let v = bs.view();
        assert!(v.test(9) && v.test(69) && !v.test(10));
        assert_eq!(v.count(), 4);
        bs.clear(9);
        assert_eq!(bs.view().count(), 3);
    }

    #[test]
    fn selector_lowering() {
        let sel = IdSelector::Or(vec![
            IdSelector::range(0, 2),
            IdSelector::And(vec![
                IdSelector::batch([5, 6, 7]),
                IdSelector::Not(Box::new(IdSelector::Array(vec![6]))),
            ]),
        ]);
        let bs = Bitset::from_selector(&sel, 8);
        let kept: Vec<usize> = (0..8).filter(|&i| !bs.view().test(i)).collect();
        assert_eq!(kept, vec![0, 1, 5, 7]);
    }

    #[test]
    fn all_excluded_block() {
        let mut bs = Bitset::new(64);
        for i in 32..64 {
            bs.set(i);
        }
        assert!(bs.view().all_excluded(32, 64));
        assert!(!bs.view().all_excluded(0, 32));
    }
}
