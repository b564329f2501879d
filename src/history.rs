//! Time-windowed history of orientation samples.
//!
//! `RecentList` is a growable ring buffer with explicit head/tail cursors.
//! The backing storage always keeps one slot free, doubles when it would fill
//! up and halves when occupancy drops under a quarter, never going below the
//! configured minimum capacity. Logical indices are stable across
//! reallocation: index 0 is always the oldest element.
//!
//! ```text
//!                 0   1   2   3                 logical index
//!         0   1   2   3   4   5   6   7   8     slot index
//!       -------------------------------------
//!       |   |   | A | B | C | D |   |   |   |
//!       -------------------------------------
//!                 ^               ^
//!                 head            tail
//! ```

use std::ops::Index;

use crate::error::HistoryError;
use crate::orientation::OrientationSample;

pub const DEFAULT_MIN_CAPACITY: usize = 4;

#[derive(Debug, Clone)]
pub struct RecentList<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    min_capacity: usize,
}

impl<T> Default for RecentList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RecentList<T> {
    pub fn new() -> Self {
        Self::with_min_capacity(DEFAULT_MIN_CAPACITY)
    }

    /// Capacities below 2 cannot hold an element next to the free slot and
    /// are raised to 2.
    pub fn with_min_capacity(min_capacity: usize) -> Self {
        let min_capacity = min_capacity.max(2);
        Self {
            slots: empty_slots(min_capacity),
            head: 0,
            tail: 0,
            min_capacity,
        }
    }

    pub fn len(&self) -> usize {
        let cap = self.slots.len();
        (self.tail + cap - self.head) % cap
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn push_back(&mut self, value: T) {
        if self.len() == self.slots.len() - 1 {
            self.relocate(self.slots.len() * 2);
        }
        self.slots[self.tail] = Some(value);
        self.tail = self.advance(self.tail);
    }

    pub fn pop_front(&mut self) -> Result<T, HistoryError> {
        if self.is_empty() {
            return Err(HistoryError::Empty);
        }

        let cap = self.slots.len();
        if self.len() < cap / 4 && cap / 2 >= self.min_capacity {
            self.relocate(cap / 2);
        }

        let value = self.slots[self.head].take();
        self.head = self.advance(self.head);
        value.ok_or(HistoryError::Empty)
    }

    pub fn clear(&mut self) {
        self.slots = empty_slots(self.min_capacity);
        self.head = 0;
        self.tail = 0;
    }

    pub fn get(&self, index: usize) -> Result<&T, HistoryError> {
        let size = self.len();
        if index >= size {
            return Err(HistoryError::Bounds { index, size });
        }
        let slot = (self.head + index) % self.slots.len();
        self.slots[slot]
            .as_ref()
            .ok_or(HistoryError::Bounds { index, size })
    }

    pub fn first(&self) -> Option<&T> {
        self.get(0).ok()
    }

    pub fn last(&self) -> Option<&T> {
        self.len().checked_sub(1).and_then(|i| self.get(i).ok())
    }

    /// Oldest first.
    #[cfg(test)]
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + '_ {
        let cap = self.slots.len();
        (0..self.len()).filter_map(move |i| self.slots[(self.head + i) % cap].as_ref())
    }

    fn advance(&self, cursor: usize) -> usize {
        if cursor + 1 < self.slots.len() {
            cursor + 1
        } else {
            0
        }
    }

    fn relocate(&mut self, new_capacity: usize) {
        let size = self.len();
        let cap = self.slots.len();
        let mut fresh = empty_slots(new_capacity);
        for (j, slot) in fresh.iter_mut().enumerate().take(size) {
            *slot = self.slots[(self.head + j) % cap].take();
        }
        self.slots = fresh;
        self.head = 0;
        self.tail = size;
    }
}

impl<T> Index<usize> for RecentList<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Ok(v) => v,
            Err(e) => panic!("{e}"),
        }
    }
}

fn empty_slots<T>(n: usize) -> Vec<Option<T>> {
    std::iter::repeat_with(|| None).take(n).collect()
}

/// Orientation samples no older than `retention_ns` relative to the newest one.
#[derive(Debug, Clone)]
pub struct TimeWindowedHistory {
    samples: RecentList<OrientationSample>,
    retention_ns: u64,
}

impl TimeWindowedHistory {
    pub fn new(retention_ns: u64, min_capacity: usize) -> Self {
        Self {
            samples: RecentList::with_min_capacity(min_capacity),
            retention_ns,
        }
    }

    /// Appends `sample` and evicts everything that fell out of the window.
    pub fn push(&mut self, sample: OrientationSample) -> Result<(), HistoryError> {
        if let Some(last) = self.samples.last() {
            if sample.timestamp_ns <= last.timestamp_ns {
                return Err(HistoryError::Ordering {
                    last: last.timestamp_ns,
                    next: sample.timestamp_ns,
                });
            }
        }

        self.samples.push_back(sample);

        let newest = sample.timestamp_ns;
        while let Some(head) = self.samples.first() {
            if newest - head.timestamp_ns <= self.retention_ns {
                break;
            }
            self.samples.pop_front()?;
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> Result<&OrientationSample, HistoryError> {
        self.samples.get(index)
    }

    pub fn latest(&self) -> Option<&OrientationSample> {
        self.samples.last()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl Index<usize> for TimeWindowedHistory {
    type Output = OrientationSample;

    fn index(&self, index: usize) -> &OrientationSample {
        &self.samples[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    fn sample(t_ms: u64, azimuth_deg: f64) -> OrientationSample {
        OrientationSample::new(t_ms * MS, azimuth_deg.to_radians(), 0.0, 0.0)
    }

    #[test]
    fn size_law_with_capped_window_and_periodic_clear() {
        let mut list = RecentList::new();

        for a in 0..=100 {
            list.push_back(a);

            let max_size = (a / 10) + 2;
            while max_size < list.len() {
                list.pop_front().unwrap();
            }

            if a % 40 == 0 {
                list.clear();
            }
        }

        assert_eq!(list.len(), 12);

        for _ in 1..=11 {
            list.pop_front().unwrap();
        }

        assert_eq!(list.len(), 1);
        assert_eq!(list[0], 100);
    }

    #[test]
    fn growth_preserves_order_across_wraparound() {
        let mut list = RecentList::with_min_capacity(4);
        list.push_back(0);
        list.push_back(1);
        list.push_back(2);
        list.pop_front().unwrap();
        list.pop_front().unwrap();
        // head is now mid-buffer, so the next pushes wrap before growing
        for v in 3..20 {
            list.push_back(v);
        }
        let got: Vec<i32> = list.iter().copied().collect();
        assert_eq!(got, (2..20).collect::<Vec<_>>());
        assert!(list.capacity() > list.len());
    }

    #[test]
    fn shrinks_but_never_below_minimum() {
        let mut list = RecentList::with_min_capacity(8);
        for v in 0..100 {
            list.push_back(v);
        }
        let grown = list.capacity();
        assert!(grown >= 101);

        while list.len() > 1 {
            list.pop_front().unwrap();
            assert!(list.capacity() > list.len());
        }
        assert!(list.capacity() < grown);
        assert!(list.capacity() >= 8);
        assert_eq!(list[0], 99);
    }

    #[test]
    fn minimum_capacity_is_raised_to_two() {
        let mut list = RecentList::with_min_capacity(0);
        assert_eq!(list.capacity(), 2);
        list.push_back('a');
        list.push_back('b');
        assert_eq!(list.len(), 2);
        assert_eq!(list[1], 'b');
    }

    #[test]
    fn get_out_of_bounds_is_an_error() {
        let mut list = RecentList::new();
        list.push_back(7);
        assert_eq!(list.get(0), Ok(&7));
        assert_eq!(
            list.get(1),
            Err(HistoryError::Bounds { index: 1, size: 1 })
        );
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn indexing_past_the_end_panics() {
        let list: RecentList<u8> = RecentList::new();
        let _ = list[0];
    }

    #[test]
    fn pop_on_empty_is_an_error() {
        let mut list: RecentList<u8> = RecentList::new();
        assert_eq!(list.pop_front(), Err(HistoryError::Empty));
    }

    #[test]
    fn evicts_samples_older_than_retention() {
        let mut history = TimeWindowedHistory::new(1500 * MS, 4);
        for i in 0..20 {
            history.push(sample(i * 100, 0.0)).unwrap();
        }
        // ages 0..=1500 ms survive
        assert_eq!(history.len(), 16);
        assert_eq!(history[0].timestamp_ns, 400 * MS);
        assert_eq!(history.latest().unwrap().timestamp_ns, 1900 * MS);
    }

    #[test]
    fn long_gap_leaves_only_the_newest_sample() {
        let mut history = TimeWindowedHistory::new(1500 * MS, 4);
        history.push(sample(0, 0.0)).unwrap();
        history.push(sample(10, 0.0)).unwrap();
        history.push(sample(5000, 0.0)).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].timestamp_ns, 5000 * MS);
    }

    #[test]
    fn history_get_past_the_newest_is_an_error() {
        let mut history = TimeWindowedHistory::new(1500 * MS, 4);
        assert_eq!(
            history.get(0),
            Err(HistoryError::Bounds { index: 0, size: 0 })
        );
        history.push(sample(10, 0.0)).unwrap();
        assert_eq!(history.get(0).unwrap().timestamp_ns, 10 * MS);
        assert_eq!(
            history.get(1),
            Err(HistoryError::Bounds { index: 1, size: 1 })
        );
    }

    #[test]
    fn rejects_non_increasing_timestamps() {
        let mut history = TimeWindowedHistory::new(1500 * MS, 4);
        history.push(sample(10, 0.0)).unwrap();
        assert_eq!(
            history.push(sample(10, 5.0)),
            Err(HistoryError::Ordering {
                last: 10 * MS,
                next: 10 * MS
            })
        );
        assert!(history.push(sample(9, 5.0)).is_err());
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn clear_empties_and_accepts_new_samples() {
        let mut history = TimeWindowedHistory::new(1500 * MS, 4);
        for i in 0..10 {
            history.push(sample(i, 0.0)).unwrap();
        }
        history.clear();
        assert!(history.is_empty());
        assert!(history.latest().is_none());
        // ordering restarts after a clear
        history.push(sample(1, 0.0)).unwrap();
        assert_eq!(history.len(), 1);
    }
}
