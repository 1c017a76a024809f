use std::{
    cmp,
    collections::{btree_map, BTreeMap},
    ops::{
        Bound::{Excluded, Included, Unbounded},
        Range,
    },
};

/// A set of u64 values optimized for long runs and random insert/delete/contains
#[derive(Debug, Default, Clone)]
pub struct RangeSet(BTreeMap<u64, u64>);

impl RangeSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn contains(&self, x: u64) -> bool {
        self.pred(x).map_or(false, |(_, end)| end > x)
    }

    /// The contiguous range containing `x`, if any
    pub fn containing(&self, x: u64) -> Option<Range<u64>> {
        self.pred(x)
            .filter(|&(_, end)| end > x)
            .map(|(start, end)| start..end)
    }

    /// The first range beginning at or after `x`
    pub fn first_after(&self, x: u64) -> Option<Range<u64>> {
        self.succ_inclusive(x).map(|(start, end)| start..end)
    }

    pub fn insert_one(&mut self, x: u64) -> bool {
        self.insert(x..x + 1)
    }

    pub fn insert(&mut self, mut x: Range<u64>) -> bool {
        if x.is_empty() {
            return false;
        }
        if let Some((start, end)) = self.pred(x.start) {
            if end >= x.end {
                // Wholly contained
                return false;
            }
            if end >= x.start {
                // Merge with predecessor
                self.0.remove(&start);
                x.start = start;
            }
        }
        // Absorb overlapping or adjacent successors
        while let Some((next_start, next_end)) = self.succ_inclusive(x.start) {
            if next_start > x.end {
                break;
            }
            self.0.remove(&next_start);
            x.end = cmp::max(next_end, x.end);
        }
        self.0.insert(x.start, x.end);
        true
    }

    pub fn remove(&mut self, x: Range<u64>) -> bool {
        if x.is_empty() {
            return false;
        }
        let mut changed = false;
        if let Some((start, end)) = self.pred(x.start) {
            if end > x.start {
                self.0.remove(&start);
                if start < x.start {
                    self.0.insert(start, x.start);
                }
                if end > x.end {
                    self.0.insert(x.end, end);
                }
                changed = true;
                if end >= x.end {
                    return true;
                }
            }
        }
        while let Some((start, end)) = self.succ(x.start) {
            if start >= x.end {
                break;
            }
            changed = true;
            self.0.remove(&start);
            if end > x.end {
                self.0.insert(x.end, end);
                break;
            }
        }
        changed
    }

    pub fn subtract(&mut self, other: &RangeSet) {
        for (&start, &end) in &other.0 {
            self.remove(start..end);
        }
    }

    /// Predecessor range starting at or before `x`
    fn pred(&self, x: u64) -> Option<(u64, u64)> {
        self.0
            .range((Unbounded, Included(x)))
            .next_back()
            .map(|(&s, &e)| (s, e))
    }

    /// Successor range starting strictly after `x`
    fn succ(&self, x: u64) -> Option<(u64, u64)> {
        self.0
            .range((Excluded(x), Unbounded))
            .next()
            .map(|(&s, &e)| (s, e))
    }

    /// Like `succ`, but also yields a range starting exactly at `x`
    fn succ_inclusive(&self, x: u64) -> Option<(u64, u64)> {
        self.0
            .range((Included(x), Unbounded))
            .next()
            .map(|(&s, &e)| (s, e))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn min(&self) -> Option<u64> {
        self.0.keys().next().copied()
    }

    pub fn max(&self) -> Option<u64> {
        self.0.values().next_back().map(|&e| e - 1)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter(self.0.iter())
    }

    pub fn elts(&self) -> impl DoubleEndedIterator<Item = u64> + '_ {
        self.iter().flatten()
    }

    pub fn pop_min(&mut self) -> Option<Range<u64>> {
        let (&start, &end) = self.0.iter().next()?;
        self.0.remove(&start);
        Some(start..end)
    }
}

pub struct Iter<'a>(btree_map::Iter<'a, u64, u64>);

impl Iterator for Iter<'_> {
    type Item = Range<u64>;
    fn next(&mut self) -> Option<Range<u64>> {
        let (&start, &end) = self.0.next()?;
        Some(start..end)
    }
}

impl DoubleEndedIterator for Iter<'_> {
    fn next_back(&mut self) -> Option<Range<u64>> {
        let (&start, &end) = self.0.next_back()?;
        Some(start..end)
    }
}

impl<'a> IntoIterator for &'a RangeSet {
    type Item = Range<u64>;
    type IntoIter = Iter<'a>;
    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elts(set: &RangeSet) -> Vec<u64> {
        set.elts().collect()
    }

    #[test]
    fn merge_and_split() {
        let mut set = RangeSet::new();
        assert!(set.insert(0..2));
        assert!(set.insert(2..4));
        assert!(!set.insert(1..3));
        assert_eq!(set.len(), 1);
        assert_eq!(elts(&set), [0, 1, 2, 3]);
        assert!(!set.contains(4));
        assert!(set.remove(2..3));
        assert_eq!(set.len(), 2);
        assert!(!set.contains(2));
        assert_eq!(elts(&set), [0, 1, 3]);
    }

    #[test]
    fn double_merge_exact() {
        let mut set = RangeSet::new();
        assert!(set.insert(0..2));
        assert!(set.insert(4..6));
        assert_eq!(set.len(), 2);
        assert!(set.insert(2..4));
        assert_eq!(set.len(), 1);
        assert_eq!(elts(&set), [0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn single_merge_low() {
        let mut set = RangeSet::new();
        assert!(set.insert(0..2));
        assert!(set.insert(4..6));
        assert!(set.insert(2..3));
        assert_eq!(set.len(), 2);
        assert_eq!(elts(&set), [0, 1, 2, 4, 5]);
    }

    #[test]
    fn single_merge_high() {
        let mut set = RangeSet::new();
        assert!(set.insert(0..2));
        assert!(set.insert(4..6));
        assert!(set.insert(3..4));
        assert_eq!(set.len(), 2);
        assert_eq!(elts(&set), [0, 1, 3, 4, 5]);
    }

    #[test]
    fn double_merge_wide() {
        let mut set = RangeSet::new();
        assert!(set.insert(0..2));
        assert!(set.insert(4..6));
        assert!(set.insert(1..5));
        assert_eq!(set.len(), 1);
        assert_eq!(elts(&set), [0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn double_remove() {
        let mut set = RangeSet::new();
        assert!(set.insert(0..2));
        assert!(set.insert(4..6));
        assert!(set.remove(1..5));
        assert_eq!(set.len(), 2);
        assert_eq!(elts(&set), [0, 5]);
    }

    #[test]
    fn insert_multiple() {
        let mut set = RangeSet::new();
        assert!(set.insert(0..1));
        assert!(set.insert(2..3));
        assert!(set.insert(4..5));
        assert!(set.insert(0..5));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn remove_multiple() {
        let mut set = RangeSet::new();
        assert!(set.insert(0..1));
        assert!(set.insert(2..3));
        assert!(set.insert(4..5));
        assert!(set.remove(0..5));
        assert!(set.is_empty());
    }

    #[test]
    fn subtract() {
        let mut set = RangeSet::new();
        set.insert(0..10);
        let mut other = RangeSet::new();
        other.insert(2..4);
        other.insert(6..8);
        set.subtract(&other);
        assert_eq!(elts(&set), [0, 1, 4, 5, 8, 9]);
    }

    #[test]
    fn range_queries() {
        let mut set = RangeSet::new();
        set.insert(3..6);
        set.insert(9..11);
        assert_eq!(set.containing(2), None);
        assert_eq!(set.containing(3), Some(3..6));
        assert_eq!(set.containing(5), Some(3..6));
        assert_eq!(set.containing(6), None);
        assert_eq!(set.first_after(0), Some(3..6));
        assert_eq!(set.first_after(3), Some(3..6));
        assert_eq!(set.first_after(7), Some(9..11));
        assert_eq!(set.first_after(11), None);
    }

    #[test]
    fn min_max() {
        let mut set = RangeSet::new();
        assert_eq!(set.min(), None);
        set.insert(3..6);
        set.insert(9..11);
        assert_eq!(set.min(), Some(3));
        assert_eq!(set.max(), Some(10));
        assert_eq!(set.pop_min(), Some(3..6));
        assert_eq!(set.min(), Some(9));
    }
}
