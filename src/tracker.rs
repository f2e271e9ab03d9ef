// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded history of the pictures submitted for decoding.

use std::collections::VecDeque;

/// Number of decode operations remembered by default.
pub const DEFAULT_DECODE_HISTORY: usize = 32;

/// An entry of the decode history.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DecodeRecord {
    /// Position of the picture in decode order, starting at 0 for the session.
    pub decode_number: u64,
    pub picture_index: u32,
}

/// Remembers the last few picture indices in the order they were submitted for decoding.
///
/// Only used for diagnostics: recording never fails, and once the history is full the oldest
/// entry is evicted.
#[derive(Debug)]
pub struct DecodeOrderTracker {
    history: VecDeque<DecodeRecord>,
    capacity: usize,
    total: u64,
}

impl Default for DecodeOrderTracker {
    fn default() -> Self {
        Self::new(DEFAULT_DECODE_HISTORY)
    }
}

impl DecodeOrderTracker {
    /// Creates a tracker remembering up to `capacity` decode operations. A zero capacity is
    /// bumped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);

        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            total: 0,
        }
    }

    /// Records that `picture_index` has been submitted for decoding and returns its decode
    /// number.
    pub fn record(&mut self, picture_index: u32) -> u64 {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }

        let decode_number = self.total;
        self.history.push_back(DecodeRecord {
            decode_number,
            picture_index,
        });
        self.total += 1;

        decode_number
    }

    /// Returns the decode number of the most recent decode into `picture_index`, if it is still
    /// remembered.
    pub fn decode_number(&self, picture_index: u32) -> Option<u64> {
        self.history
            .iter()
            .rev()
            .find(|r| r.picture_index == picture_index)
            .map(|r| r.decode_number)
    }

    /// Iterates over the remembered entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &DecodeRecord> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of decode operations recorded since creation, including evicted ones.
    pub fn total_recorded(&self) -> u64 {
        self.total
    }

    /// Forgets the history. The decode numbering keeps going.
    pub fn clear(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_decode_order() {
        let mut tracker = DecodeOrderTracker::default();

        assert_eq!(tracker.record(3), 0);
        assert_eq!(tracker.record(1), 1);
        assert_eq!(tracker.record(3), 2);

        let indices: Vec<u32> = tracker.iter().map(|r| r.picture_index).collect();
        assert_eq!(indices, vec![3, 1, 3]);
        assert_eq!(tracker.decode_number(3), Some(2));
        assert_eq!(tracker.decode_number(1), Some(1));
        assert_eq!(tracker.decode_number(0), None);
    }

    #[test]
    fn oldest_entry_is_evicted_when_full() {
        let mut tracker = DecodeOrderTracker::new(4);

        for i in 0..10 {
            tracker.record(i);
        }

        assert_eq!(tracker.len(), 4);
        assert_eq!(tracker.total_recorded(), 10);
        let numbers: Vec<u64> = tracker.iter().map(|r| r.decode_number).collect();
        assert_eq!(numbers, vec![6, 7, 8, 9]);
        assert_eq!(tracker.decode_number(2), None);
    }

    #[test]
    fn clear_keeps_numbering() {
        let mut tracker = DecodeOrderTracker::new(0);
        assert_eq!(tracker.capacity(), 1);

        tracker.record(0);
        tracker.record(1);
        tracker.clear();
        assert!(tracker.is_empty());
        assert_eq!(tracker.record(5), 2);
    }
}
