//! Bounded binary heaps stored in flat arrays.
//!
//! A top-k result for one query is two parallel slices, `val` and `ids`, of length `k`.
//! To keep the `k` smallest values we use a max-heap ([`CMax`]): the root is the worst
//! value kept so far and a candidate enters only if it beats the root. [`CMin`] is the
//! mirror image, used when larger is better (inner product).
//!
//! Ties on the value are broken by the id: with [`CMax`] the larger id is the worse one,
//! so among equal values the smallest ids survive no matter in which order candidates are
//! offered. This is what makes multi-threaded scans reproducible.

use std::fmt;
use std::marker::PhantomData;

/// Values that can live in a result heap.
pub trait HeapValue: Copy + PartialOrd + Send + Sync + fmt::Debug + 'static {
    /// Smallest representable value.
    const LOWEST: Self;
    /// Largest representable value.
    const HIGHEST: Self;
}

impl HeapValue for f32 {
    const LOWEST: Self = f32::NEG_INFINITY;
    const HIGHEST: Self = f32::INFINITY;
}

impl HeapValue for i32 {
    const LOWEST: Self = i32::MIN;
    const HIGHEST: Self = i32::MAX;
}

impl HeapValue for u16 {
    const LOWEST: Self = 0;
    const HIGHEST: Self = u16::MAX;
}

/// Ordering policy of a result heap.
pub trait Comparator: Copy + Default + Send + Sync + fmt::Debug + 'static {
    /// Value type.
    type T: HeapValue;

    /// True when `a` is strictly worse than `b` (the root of the heap is the worst element).
    fn cmp(a: Self::T, b: Self::T) -> bool;

    /// [`Comparator::cmp`] with ids as tie-breaker.
    #[inline]
    fn cmp2(a: Self::T, b: Self::T, ia: i64, ib: i64) -> bool {
        Self::cmp(a, b) || (a == b && ia > ib)
    }

    /// Value every real candidate beats; used to fill empty slots.
    fn neutral() -> Self::T;

    /// Whether this comparator keeps the smallest values.
    fn keeps_smallest() -> bool;
}

/// Max-heap: keeps the k smallest values.
pub struct CMax<T>(PhantomData<fn() -> T>);

/// Min-heap: keeps the k largest values.
pub struct CMin<T>(PhantomData<fn() -> T>);

macro_rules! comparator_boilerplate {
    ($name:ident) => {
        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                *self
            }
        }
        impl<T> Copy for $name<T> {}
        impl<T> Default for $name<T> {
            fn default() -> Self {
                Self(PhantomData)
            }
        }
        impl<T> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}<{}>", stringify!($name), std::any::type_name::<T>())
            }
        }
    };
}

comparator_boilerplate!(CMax);
comparator_boilerplate!(CMin);

impl<T: HeapValue> Comparator for CMax<T> {
    type T = T;

    #[inline]
    fn cmp(a: T, b: T) -> bool {
        a > b
    }

    #[inline]
    fn neutral() -> T {
        T::HIGHEST
    }

    #[inline]
    fn keeps_smallest() -> bool {
        true
    }
}

impl<T: HeapValue> Comparator for CMin<T> {
    type T = T;

    #[inline]
    fn cmp(a: T, b: T) -> bool {
        a < b
    }

    #[inline]
    fn cmp2(a: T, b: T, ia: i64, ib: i64) -> bool {
        a < b || (a == b && ia > ib)
    }

    #[inline]
    fn neutral() -> T {
        T::LOWEST
    }

    #[inline]
    fn keeps_smallest() -> bool {
        false
    }
}

/// Restore the heap property below `i`, with `(v, id)` as the element to place.
#[inline]
fn sift_down<C: Comparator>(k: usize, val: &mut [C::T], ids: &mut [i64], v: C::T, id: i64) {
    let mut i = 0;
    loop {
        let l = 2 * i + 1;
        if l >= k {
            break;
        }
        let r = l + 1;
        let child = if r >= k || C::cmp2(val[l], val[r], ids[l], ids[r]) {
            l
        } else {
            r
        };
        if C::cmp2(v, val[child], id, ids[child]) {
            break;
        }
        val[i] = val[child];
        ids[i] = ids[child];
        i = child;
    }
    val[i] = v;
    ids[i] = id;
}

/// Replace the root of a heap of size `k` and sift down.
#[inline]
pub fn heap_replace_top<C: Comparator>(
    k: usize,
    val: &mut [C::T],
    ids: &mut [i64],
    v: C::T,
    id: i64,
) {
    debug_assert!(k > 0 && val.len() >= k && ids.len() >= k);
    sift_down::<C>(k, val, ids, v, id);
}

/// Remove the root of a heap of size `k`; the heap then has size `k - 1`.
#[inline]
pub fn heap_pop<C: Comparator>(k: usize, val: &mut [C::T], ids: &mut [i64]) {
    debug_assert!(k > 0);
    let last = k - 1;
    let (v, id) = (val[last], ids[last]);
    sift_down::<C>(last, val, ids, v, id);
}

/// Insert into a heap of size `k`; the heap then has size `k + 1`.
#[inline]
pub fn heap_push<C: Comparator>(k: usize, val: &mut [C::T], ids: &mut [i64], v: C::T, id: i64) {
    let mut i = k;
    while i > 0 {
        let parent = (i - 1) / 2;
        if !C::cmp2(v, val[parent], id, ids[parent]) {
            break;
        }
        val[i] = val[parent];
        ids[i] = ids[parent];
        i = parent;
    }
    val[i] = v;
    ids[i] = id;
}

/// Fill a heap of size `k` with neutral values and invalid ids.
#[inline]
pub fn heap_heapify<C: Comparator>(k: usize, val: &mut [C::T], ids: &mut [i64]) {
    val[..k].fill(C::neutral());
    ids[..k].fill(-1);
}

/// Offer a candidate: it replaces the root if it is better.
#[inline]
pub fn heap_offer<C: Comparator>(val: &mut [C::T], ids: &mut [i64], v: C::T, id: i64) -> bool {
    let k = val.len();
    if k > 0 && C::cmp2(val[0], v, ids[0], id) {
        heap_replace_top::<C>(k, val, ids, v, id);
        true
    } else {
        false
    }
}

/// Sort a heap of size `k` best-first in place. Slots with id `-1` are moved to the end
/// and reset to the neutral value. Returns the number of valid entries.
pub fn heap_reorder<C: Comparator>(k: usize, val: &mut [C::T], ids: &mut [i64]) -> usize {
    let mut valid = 0;
    for i in 0..k {
        let (v, id) = (val[0], ids[0]);
        heap_pop::<C>(k - i, val, ids);
        val[k - valid - 1] = v;
        ids[k - valid - 1] = id;
        if id != -1 {
            valid += 1;
        }
    }
    val.copy_within(k - valid..k, 0);
    ids.copy_within(k - valid..k, 0);
    for i in valid..k {
        val[i] = C::neutral();
        ids[i] = -1;
    }
    valid
}

/// `nh` heaps of size `k`, stored contiguously.
#[derive(Debug, Clone)]
pub struct HeapArray<C: Comparator> {
    /// Number of heaps.
    pub nh: usize,
    /// Size of each heap.
    pub k: usize,
    /// Values, `nh * k`.
    pub val: Vec<C::T>,
    /// Ids, `nh * k`.
    pub ids: Vec<i64>,
    _cmp: PhantomData<C>,
}

impl<C: Comparator> HeapArray<C> {
    /// Allocate `nh` empty heaps.
    pub fn new(nh: usize, k: usize) -> Self {
        Self {
            nh,
            k,
            val: vec![C::neutral(); nh * k],
            ids: vec![-1; nh * k],
            _cmp: PhantomData,
        }
    }

    /// Mutable slices of heap `i`.
    #[inline]
    pub fn heap_mut(&mut self, i: usize) -> (&mut [C::T], &mut [i64]) {
        let r = i * self.k..(i + 1) * self.k;
        (&mut self.val[r.clone()], &mut self.ids[r])
    }

    /// Values of heap `i`.
    #[inline]
    pub fn vals(&self, i: usize) -> &[C::T] {
        &self.val[i * self.k..(i + 1) * self.k]
    }

    /// Ids of heap `i`.
    #[inline]
    pub fn labels(&self, i: usize) -> &[i64] {
        &self.ids[i * self.k..(i + 1) * self.k]
    }

    /// Reset all heaps to empty.
    pub fn heapify(&mut self) {
        self.val.fill(C::neutral());
        self.ids.fill(-1);
    }

    /// Sort every heap best-first.
    pub fn reorder(&mut self) {
        let k = self.k;
        if k == 0 {
            return;
        }
        for (v, i) in self.val.chunks_exact_mut(k).zip(self.ids.chunks_exact_mut(k)) {
            heap_reorder::<C>(k, v, i);
        }
    }

    /// Consume into `(values, ids)`.
    pub fn into_parts(self) -> (Vec<C::T>, Vec<i64>) {
        (self.val, self.ids)
    }
}
