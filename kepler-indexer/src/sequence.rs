//! Shared generator of block-number work ranges.
//!
//! The catch-up pipeline builds one finite [`Sequence`] per pass and lets a
//! pool of range workers drain it; a failed range is pushed back through
//! [`Sequence::queue`]. The realtime path uses tiny throwaway sequences so
//! both pipelines share the same retry semantics.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Inclusive block number range. `first > last` means the range is walked
/// downwards; both orientations are legal everywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRange {
    pub first: u64,
    pub last: u64,
}

impl BlockRange {
    pub fn new(first: u64, last: u64) -> Self {
        Self { first, last }
    }

    /// Number of blocks covered; inclusive ranges are never empty.
    pub fn len(&self) -> u64 {
        self.first.abs_diff(self.last) + 1
    }

    /// Splits into sub-ranges of at most `step.unsigned_abs()` numbers,
    /// walking in the direction given by the sign of `step`. Both endpoints
    /// of the input survive in the output.
    fn chunk(&self, step: i64) -> Vec<BlockRange> {
        let size = step.unsigned_abs().max(1);
        let (lo, hi) = if self.first <= self.last {
            (self.first, self.last)
        } else {
            (self.last, self.first)
        };
        let descending = step < 0;

        let mut chunks = Vec::new();
        if descending {
            let mut upper = hi;
            loop {
                let lower = upper.saturating_sub(size - 1).max(lo);
                chunks.push(BlockRange::new(upper, lower));
                if lower == lo {
                    break;
                }
                upper = lower - 1;
            }
        } else {
            let mut lower = lo;
            loop {
                let upper = lower.saturating_add(size - 1).min(hi);
                chunks.push(BlockRange::new(lower, upper));
                if upper == hi {
                    break;
                }
                lower = upper + 1;
            }
        }
        chunks
    }
}

#[derive(Debug)]
struct State {
    queue: VecDeque<BlockRange>,
    /// Cursor of the infinite tail; `None` once capped or finite.
    current: Option<u64>,
    step: i64,
}

/// Hands out distinct ranges to concurrent consumers.
#[derive(Debug)]
pub struct Sequence {
    inner: Mutex<State>,
}

impl Sequence {
    /// Finite sequence over the given ranges, each pre-chunked by
    /// `step.unsigned_abs()` with the sign giving the walk direction.
    ///
    /// Panics if `step` is zero.
    pub fn new_finite(ranges: impl IntoIterator<Item = BlockRange>, step: i64) -> Self {
        assert!(step != 0, "sequence step must be nonzero");
        let queue = ranges
            .into_iter()
            .flat_map(|r| r.chunk(step))
            .collect();
        Self { inner: Mutex::new(State { queue, current: None, step }) }
    }

    /// Infinite ascending sequence starting at `first`.
    ///
    /// Panics if `step` is not positive; an infinite tail only makes sense
    /// walking forward.
    pub fn new_infinite(first: u64, step: i64) -> Self {
        assert!(step > 0, "infinite sequence step must be positive");
        Self {
            inner: Mutex::new(State { queue: VecDeque::new(), current: Some(first), step }),
        }
    }

    /// Next range, or `None` once a finite sequence is drained. Concurrent
    /// callers never receive the same range.
    pub fn pop(&self) -> Option<BlockRange> {
        let mut state = self.inner.lock().expect("sequence lock poisoned");
        if let Some(range) = state.queue.pop_front() {
            return Some(range);
        }
        let step = state.step;
        match state.current {
            Some(cursor) => {
                let last = cursor + (step as u64 - 1);
                state.current = Some(last + 1);
                Some(BlockRange::new(cursor, last))
            }
            None => None,
        }
    }

    /// Re-inserts a range at the tail, typically after a failed fetch.
    pub fn queue(&self, range: BlockRange) {
        let mut state = self.inner.lock().expect("sequence lock poisoned");
        state.queue.push_back(range);
    }

    /// Caps an infinite sequence: the tail stops advancing and `pop`
    /// returns `None` once the queue drains.
    pub fn cap(&self) {
        let mut state = self.inner.lock().expect("sequence lock poisoned");
        state.current = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn chunks_descending_preserving_endpoints() {
        let sequence = Sequence::new_finite([BlockRange::new(20, 0)], -5);
        let mut popped = Vec::new();
        while let Some(range) = sequence.pop() {
            popped.push((range.first, range.last));
        }
        assert_eq!(popped, vec![(20, 16), (15, 11), (10, 6), (5, 1), (0, 0)]);
    }

    #[test]
    fn chunks_ascending() {
        let sequence = Sequence::new_finite([BlockRange::new(0, 7)], 3);
        let mut popped = Vec::new();
        while let Some(range) = sequence.pop() {
            popped.push((range.first, range.last));
        }
        assert_eq!(popped, vec![(0, 2), (3, 5), (6, 7)]);
    }

    #[test]
    fn short_range_is_a_single_chunk() {
        // |range| < chunk size
        let sequence = Sequence::new_finite([BlockRange::new(9, 6)], -10);
        assert_eq!(sequence.pop(), Some(BlockRange::new(9, 6)));
        assert_eq!(sequence.pop(), None);
    }

    #[test]
    fn queue_reinserts_at_tail() {
        let sequence = Sequence::new_finite([BlockRange::new(10, 1)], -5);
        let first = sequence.pop().unwrap();
        sequence.queue(first);
        assert_eq!(sequence.pop(), Some(BlockRange::new(5, 1)));
        assert_eq!(sequence.pop(), Some(first));
        assert_eq!(sequence.pop(), None);
    }

    #[test]
    fn infinite_tail_advances_then_caps() {
        let sequence = Sequence::new_infinite(100, 2);
        assert_eq!(sequence.pop(), Some(BlockRange::new(100, 101)));
        assert_eq!(sequence.pop(), Some(BlockRange::new(102, 103)));
        sequence.cap();
        assert_eq!(sequence.pop(), None);
        // queued ranges still drain after capping
        sequence.queue(BlockRange::new(102, 103));
        assert_eq!(sequence.pop(), Some(BlockRange::new(102, 103)));
        assert_eq!(sequence.pop(), None);
    }

    #[test]
    fn concurrent_pops_receive_distinct_ranges() {
        use std::sync::Arc;
        let sequence = Arc::new(Sequence::new_finite([BlockRange::new(99, 0)], -10));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let sequence = Arc::clone(&sequence);
            handles.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(range) = sequence.pop() {
                    seen.push(range);
                }
                seen
            }));
        }
        let mut all: Vec<BlockRange> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_by_key(|r| r.last);
        let firsts: Vec<u64> = all.iter().map(|r| r.first).collect();
        assert_eq!(firsts, vec![9, 19, 29, 39, 49, 59, 69, 79, 89, 99]);
    }
}
