//! Interval bookkeeping for data already requested from a source.

use smallvec::SmallVec;
use std::collections::BTreeMap;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval<T> {
    pub start: T,
    pub end: T,
}

impl<T: Ord + Copy> Interval<T> {
    pub fn new(start: T, end: T) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, t: T) -> bool {
        self.start <= t && t < self.end
    }
}

pub type IntervalList<T> = SmallVec<[Interval<T>; 4]>;

/// Ordered set of requested intervals, kept maximally coalesced: no two stored
/// intervals overlap or touch. The set only grows; data that was fetched stays
/// valid for the life of the series.
#[derive(Debug, Clone)]
pub struct RequestCache<T> {
    // start -> end
    intervals: BTreeMap<T, T>,
}

impl<T: Ord + Copy> Default for RequestCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Copy> RequestCache<T> {
    pub fn new() -> Self {
        Self {
            intervals: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn intervals(&self) -> impl Iterator<Item = Interval<T>> + '_ {
        self.intervals.iter().map(|(&start, &end)| Interval { start, end })
    }

    pub fn contains(&self, t: T) -> bool {
        self.intervals
            .range(..=t)
            .next_back()
            .is_some_and(|(_, &end)| t < end)
    }

    /// Parts of `[start, end)` that have not been requested yet, in order.
    pub fn missing(&self, start: T, end: T) -> IntervalList<T> {
        let mut gaps = IntervalList::new();
        if start >= end {
            return gaps;
        }

        // Begin at the stored interval that may already cover `start`.
        let from = self
            .intervals
            .range(..=start)
            .next_back()
            .map(|(&s, _)| s)
            .unwrap_or(start);

        let mut cursor = start;
        for (&s, &e) in self.intervals.range(from..end) {
            if e <= cursor {
                continue;
            }
            if s > cursor {
                gaps.push(Interval::new(cursor, s));
            }
            cursor = e;
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            gaps.push(Interval::new(cursor, end));
        }
        gaps
    }

    /// Registers `[start, end)` as requested and returns the sub-intervals that
    /// were not registered before. Calling it twice with the same bounds
    /// returns nothing the second time.
    pub fn adapt(&mut self, start: T, end: T) -> IntervalList<T> {
        let fresh = self.missing(start, end);
        if !fresh.is_empty() {
            self.insert(start, end);
        }
        fresh
    }

    fn insert(&mut self, mut start: T, mut end: T) {
        // Left neighbour overlapping or touching.
        if let Some((&s, &e)) = self.intervals.range(..=start).next_back() {
            if e >= start {
                self.intervals.remove(&s);
                start = s;
                end = end.max(e);
            }
        }

        // Right neighbours starting inside or right at the end.
        while let Some((&s, &e)) = self.intervals.range(start..=end).next() {
            self.intervals.remove(&s);
            end = end.max(e);
        }

        self.intervals.insert(start, end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn list(cache: &RequestCache<i64>) -> Vec<(i64, i64)> {
        cache.intervals().map(|i| (i.start, i.end)).collect()
    }

    fn assert_coalesced(cache: &RequestCache<i64>) {
        let all: Vec<_> = cache.intervals().collect();
        for w in all.windows(2) {
            assert!(w[0].end < w[1].start, "{:?} touches {:?}", w[0], w[1]);
        }
        assert!(all.iter().all(|i| !i.is_empty()));
    }

    #[test]
    fn test_missing_then_adapt_scenario() {
        let day = |d: u32| Utc.with_ymd_and_hms(2014, 1, d, 0, 0, 0).unwrap();
        let mut cache = RequestCache::new();

        let gaps = cache.missing(day(1), day(5));
        assert_eq!(gaps.as_slice(), &[Interval::new(day(1), day(5))]);

        cache.adapt(day(1), day(3));
        let gaps = cache.missing(day(1), day(5));
        assert_eq!(gaps.as_slice(), &[Interval::new(day(3), day(5))]);
    }

    #[test]
    fn test_adapt_is_idempotent() {
        let mut cache = RequestCache::new();
        assert_eq!(cache.adapt(10, 20).as_slice(), &[Interval::new(10, 20)]);
        assert!(cache.adapt(10, 20).is_empty());
        assert!(cache.adapt(12, 18).is_empty());
        assert_eq!(list(&cache), vec![(10, 20)]);
    }

    #[test]
    fn test_adapt_returns_only_new_parts() {
        let mut cache = RequestCache::new();
        cache.adapt(10, 20);
        cache.adapt(30, 40);

        let fresh = cache.adapt(5, 45);
        assert_eq!(
            fresh.as_slice(),
            &[Interval::new(5, 10), Interval::new(20, 30), Interval::new(40, 45)]
        );
        assert_eq!(list(&cache), vec![(5, 45)]);
    }

    #[test]
    fn test_touching_intervals_merge() {
        let mut cache = RequestCache::new();
        cache.adapt(0, 5);
        cache.adapt(10, 15);
        cache.adapt(5, 10);
        assert_eq!(list(&cache), vec![(0, 15)]);

        cache.adapt(15, 16);
        assert_eq!(list(&cache), vec![(0, 16)]);
    }

    #[test]
    fn test_stays_coalesced_under_mixed_inserts() {
        let mut cache = RequestCache::new();
        let inserts = [
            (50, 60),
            (0, 3),
            (7, 9),
            (3, 4),
            (58, 70),
            (20, 25),
            (9, 20),
            (100, 101),
            (4, 7),
            (25, 49),
        ];
        for (s, e) in inserts {
            cache.adapt(s, e);
            assert_coalesced(&cache);
        }
        assert_eq!(list(&cache), vec![(0, 49), (50, 70), (100, 101)]);
        assert_eq!(cache.missing(0, 110).as_slice(), &[
            Interval::new(49, 50),
            Interval::new(70, 100),
            Interval::new(101, 110),
        ]);
        assert!(cache.contains(49 - 1));
        assert!(!cache.contains(49));
    }

    #[test]
    fn test_empty_and_inverted_ranges() {
        let mut cache: RequestCache<i64> = RequestCache::new();
        assert!(cache.missing(5, 5).is_empty());
        assert!(cache.adapt(9, 3).is_empty());
        assert!(cache.is_empty());
    }
}
