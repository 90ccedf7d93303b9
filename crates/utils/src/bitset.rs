//! Fixed-capacity bit-set indexed by a typed position.
//!
//! Masks of different domains (engines, slot identifiers, placement
//! identifiers) use distinct index newtypes, so a mask of one domain cannot be
//! combined with or compared to a mask of another.

use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::marker::PhantomData;
use std::ops::BitAnd;
use std::ops::BitAndAssign;
use std::ops::BitOr;
use std::ops::BitOrAssign;
use std::ops::Range;
use std::ops::Sub;

/// A type that names a bit position inside a [`BitSet`].
pub trait BitIndex: Copy {
    fn to_bit(self) -> u32;
    fn from_bit(bit: u32) -> Self;
}

impl BitIndex for u32 {
    fn to_bit(self) -> u32 {
        self
    }

    fn from_bit(bit: u32) -> Self {
        bit
    }
}

/// `N` words of 64 bits, bit 0 is the least significant bit of word 0.
pub struct BitSet<I, const N: usize> {
    words: [u64; N],
    _index: PhantomData<fn() -> I>,
}

impl<I, const N: usize> Clone for BitSet<I, N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I, const N: usize> Copy for BitSet<I, N> {}

impl<I, const N: usize> PartialEq for BitSet<I, N> {
    fn eq(&self, other: &Self) -> bool {
        self.words == other.words
    }
}

impl<I, const N: usize> Eq for BitSet<I, N> {}

impl<I, const N: usize> Hash for BitSet<I, N> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.words.hash(state);
    }
}

impl<I, const N: usize> Default for BitSet<I, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: BitIndex + fmt::Debug, const N: usize> fmt::Debug for BitSet<I, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<I, const N: usize> BitSet<I, N> {
    pub const CAPACITY: u32 = N as u32 * u64::BITS;

    pub const fn new() -> Self {
        Self {
            words: [0; N],
            _index: PhantomData,
        }
    }

    pub const fn from_words(words: [u64; N]) -> Self {
        Self {
            words,
            _index: PhantomData,
        }
    }

    pub const fn words(&self) -> [u64; N] {
        self.words
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Number of set bits.
    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_disjoint(&self, other: &Self) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(a, b)| a & b == 0)
    }

    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(a, b)| a & !b == 0)
    }

    fn test_bit(&self, bit: u32) -> bool {
        if bit >= Self::CAPACITY {
            return false;
        }
        let (idx, mask) = Self::locate(bit);
        self.words[idx] & mask != 0
    }

    #[inline(always)]
    fn locate(bit: u32) -> (usize, u64) {
        ((bit / u64::BITS) as usize, 1 << (bit & (u64::BITS - 1)))
    }
}

impl<I: BitIndex, const N: usize> BitSet<I, N> {
    /// A set holding exactly the positions in `range`.
    pub fn from_range(range: Range<I>) -> Self {
        let mut set = Self::new();
        set.insert_range(range);
        set
    }

    /// Returns whether `index` is set. Positions beyond the capacity are
    /// never set.
    pub fn test(&self, index: I) -> bool {
        self.test_bit(index.to_bit())
    }

    /// Set the bit at `index` to `val` and return the value before it was set.
    ///
    /// # Panics
    ///
    /// Panics if `index` is beyond the capacity.
    pub fn test_and_set(&mut self, index: I, val: bool) -> bool {
        let bit = index.to_bit();
        assert!(bit < Self::CAPACITY, "bit {bit} out of range");
        let (idx, mask) = Self::locate(bit);
        let before = self.words[idx] & mask != 0;
        if val {
            self.words[idx] |= mask;
        } else {
            self.words[idx] &= !mask;
        }
        before
    }

    pub fn insert(&mut self, index: I) {
        self.test_and_set(index, true);
    }

    pub fn remove(&mut self, index: I) {
        self.test_and_set(index, false);
    }

    pub fn insert_range(&mut self, range: Range<I>) {
        for bit in range.start.to_bit()..range.end.to_bit() {
            self.insert(I::from_bit(bit));
        }
    }

    /// Iterates set positions in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = I> + '_ {
        self.words.iter().enumerate().flat_map(|(row, word)| {
            let mut word = *word;
            std::iter::from_fn(move || {
                if word == 0 {
                    return None;
                }
                let col = word.trailing_zeros();
                word &= word - 1;
                Some(I::from_bit(row as u32 * u64::BITS + col))
            })
        })
    }

    /// Lowest set position.
    pub fn first(&self) -> Option<I> {
        self.iter().next()
    }

    /// The `n`-th (0-based) set position in ascending order.
    pub fn nth(&self, n: u32) -> Option<I> {
        self.iter().nth(n as usize)
    }

    /// Number of set positions strictly below `index`.
    pub fn rank(&self, index: I) -> u32 {
        let bit = index.to_bit();
        self.iter().take_while(|i| i.to_bit() < bit).count() as u32
    }

    /// Returns the position of the next 0,
    /// after `offset` (including `offset`) and before `end` (excluding `end`).
    /// None means not existing
    pub fn find_next_zero(&self, offset: I, end: Option<I>) -> Option<I> {
        let end = end.map_or(Self::CAPACITY, |e| e.to_bit().min(Self::CAPACITY));
        (offset.to_bit()..end)
            .find(|bit| !self.test_bit(*bit))
            .map(I::from_bit)
    }

    /// Positions of `self` restricted to `range`.
    pub fn within(&self, range: Range<I>) -> Self {
        *self & Self::from_range(range)
    }
}

impl<I> BitSet<I, 1> {
    pub const fn from_bits(bits: u64) -> Self {
        Self::from_words([bits])
    }

    pub const fn bits(&self) -> u64 {
        self.words[0]
    }
}

impl<I, const N: usize> BitOr for BitSet<I, N> {
    type Output = Self;

    fn bitor(mut self, rhs: Self) -> Self {
        self |= rhs;
        self
    }
}

impl<I, const N: usize> BitOrAssign for BitSet<I, N> {
    fn bitor_assign(&mut self, rhs: Self) {
        for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
            *a |= b;
        }
    }
}

impl<I, const N: usize> BitAnd for BitSet<I, N> {
    type Output = Self;

    fn bitand(mut self, rhs: Self) -> Self {
        self &= rhs;
        self
    }
}

impl<I, const N: usize> BitAndAssign for BitSet<I, N> {
    fn bitand_assign(&mut self, rhs: Self) {
        for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
            *a &= b;
        }
    }
}

/// Set difference.
impl<I, const N: usize> Sub for BitSet<I, N> {
    type Output = Self;

    fn sub(mut self, rhs: Self) -> Self {
        for (a, b) in self.words.iter_mut().zip(rhs.words.iter()) {
            *a &= !b;
        }
        self
    }
}

impl<I: BitIndex, const N: usize> FromIterator<I> for BitSet<I, N> {
    fn from_iter<T: IntoIterator<Item = I>>(iter: T) -> Self {
        let mut set = Self::new();
        for index in iter {
            set.insert(index);
        }
        set
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::BitSet;

    type Set2 = BitSet<u32, 2>;

    #[test]
    fn bitset_test() {
        let mut bitset = Set2::new();
        assert!(!bitset.test(1));
        bitset.test_and_set(1, true);
        assert!(bitset.test(1));

        assert!(!bitset.test(127));
        bitset.test_and_set(127, true);
        assert!(bitset.test(127));
        assert!(!bitset.test(128));
    }

    #[test]
    fn bitset_test_and_set() {
        let mut bitset = BitSet::<u32, 8>::new();
        assert!(!bitset.test_and_set(0, true));
        assert!(bitset.test_and_set(0, true));

        assert!(!bitset.test_and_set(63, true));
        assert!(bitset.test_and_set(63, true));
        assert!(!bitset.test_and_set(64, true));
        assert!(bitset.test_and_set(64, true));

        assert!(bitset.test_and_set(64, false));
        assert!(!bitset.test(64));
        assert_eq!(bitset.count(), 2);
    }

    #[test]
    fn bitset_set_algebra() {
        let a: Set2 = [1, 2, 3, 70].into_iter().collect();
        let b: Set2 = [3, 4, 70].into_iter().collect();

        assert_eq!((a | b).iter().collect::<Vec<_>>(), vec![1, 2, 3, 4, 70]);
        assert_eq!((a & b).iter().collect::<Vec<_>>(), vec![3, 70]);
        assert_eq!((a - b).iter().collect::<Vec<_>>(), vec![1, 2]);
        assert!(!a.is_disjoint(&b));
        assert!((a - b).is_disjoint(&b));
        assert!((a & b).is_subset_of(&a));
        assert!(!a.is_subset_of(&b));
    }

    #[test]
    fn bitset_rank_and_nth() {
        let set: Set2 = [2, 5, 9, 65].into_iter().collect();
        assert_eq!(set.first(), Some(2));
        assert_eq!(set.nth(2), Some(9));
        assert_eq!(set.nth(4), None);
        assert_eq!(set.rank(9), 2);
        assert_eq!(set.rank(65), 3);
        assert_eq!(set.rank(0), 0);
    }

    #[test]
    fn bitset_ranges() {
        let set = Set2::from_range(5..9);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![5, 6, 7, 8]);
        let other: Set2 = [1, 6, 8, 40].into_iter().collect();
        assert_eq!(other.within(5..9).iter().collect::<Vec<_>>(), vec![6, 8]);
        assert_eq!(BitSet::<u32, 1>::from_range(0..4).bits(), 0b1111);
    }

    #[test]
    fn bitset_find_next_zero() {
        let mut bitset = Set2::new();
        assert_eq!(bitset.find_next_zero(0, None), Some(0));

        bitset.insert(0);
        bitset.insert(1);
        assert_eq!(bitset.find_next_zero(0, None), Some(2));
        assert_eq!(bitset.find_next_zero(0, Some(3)), Some(2));
        assert_eq!(bitset.find_next_zero(0, Some(2)), None);

        let full = Set2::from_range(0..128);
        assert_eq!(full.find_next_zero(0, None), None);
    }
}
