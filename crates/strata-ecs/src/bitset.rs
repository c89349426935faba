//! Bitset over [`FragmentTypeId`]s.
//!
//! Archetype compositions and query requirements are sets of type ids. Since
//! ids are dense, a word-packed bitset makes the `HasAll` / `HasAny` /
//! `HasNone` tests of query matching a handful of AND operations.

use std::fmt;

use crate::fragment::FragmentTypeId;

/// A growable set of [`FragmentTypeId`]s backed by `Vec<u64>`.
///
/// Trailing zero words are always trimmed, so two sets with the same members
/// compare and hash equal regardless of how they were built.
#[derive(Default, Clone, PartialEq, Eq, Hash)]
pub struct FragmentBitSet {
    words: Vec<u64>,
}

impl FragmentBitSet {
    /// Creates a new, empty set.
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Builds a set from a list of ids. Duplicates are ignored.
    pub fn from_ids(ids: &[FragmentTypeId]) -> Self {
        let mut set = Self::new();
        for &id in ids {
            set.insert(id);
        }
        set
    }

    /// Adds `id` to the set. Returns `false` if it was already present.
    pub fn insert(&mut self, id: FragmentTypeId) -> bool {
        let (word, bit) = Self::split(id);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let was_set = self.words[word] & bit != 0;
        self.words[word] |= bit;
        !was_set
    }

    /// Removes `id` from the set. Returns `false` if it was not present.
    pub fn remove(&mut self, id: FragmentTypeId) -> bool {
        let (word, bit) = Self::split(id);
        let Some(w) = self.words.get_mut(word) else {
            return false;
        };
        let was_set = *w & bit != 0;
        *w &= !bit;
        self.trim();
        was_set
    }

    /// Returns true if `id` is a member.
    pub fn contains(&self, id: FragmentTypeId) -> bool {
        let (word, bit) = Self::split(id);
        self.words.get(word).is_some_and(|w| w & bit != 0)
    }

    /// Every member of `other` is a member of `self`.
    pub fn has_all(&self, other: &FragmentBitSet) -> bool {
        other
            .words
            .iter()
            .enumerate()
            .all(|(i, &w)| self.word(i) & w == w)
    }

    /// At least one member of `other` is a member of `self`.
    ///
    /// An empty `other` yields `false`.
    pub fn has_any(&self, other: &FragmentBitSet) -> bool {
        other
            .words
            .iter()
            .enumerate()
            .any(|(i, &w)| self.word(i) & w != 0)
    }

    /// No member of `other` is a member of `self`.
    pub fn has_none(&self, other: &FragmentBitSet) -> bool {
        !self.has_any(other)
    }

    /// Whether the set has no members.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Adds every member of `other`.
    pub fn union_with(&mut self, other: &FragmentBitSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= o;
        }
    }

    /// Removes every member of `other`.
    pub fn difference_with(&mut self, other: &FragmentBitSet) {
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= !o;
        }
        self.trim();
    }

    /// Members in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = FragmentTypeId> + '_ {
        self.words.iter().enumerate().flat_map(|(word_idx, &word)| {
            let mut bits = word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let tz = bits.trailing_zeros();
                bits &= bits - 1;
                Some(FragmentTypeId(word_idx as u32 * 64 + tz))
            })
        })
    }

    #[inline]
    fn word(&self, i: usize) -> u64 {
        self.words.get(i).copied().unwrap_or(0)
    }

    #[inline]
    fn split(id: FragmentTypeId) -> (usize, u64) {
        ((id.0 / 64) as usize, 1u64 << (id.0 % 64))
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }
}

impl fmt::Debug for FragmentBitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|id| id.0)).finish()
    }
}

impl FromIterator<FragmentTypeId> for FragmentBitSet {
    fn from_iter<I: IntoIterator<Item = FragmentTypeId>>(iter: I) -> Self {
        let mut set = Self::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}
